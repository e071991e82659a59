//! # Convoy data sources
//!
//! The pluggable query interface the scheduler detects batch membership
//! through, plus the two production drivers (Dataverse OData and Databricks
//! SQL statements). Connection strings are bound through process
//! environment variables named by the runbook, never stored in the
//! database.

pub mod backoff;
pub mod databricks;
pub mod dataverse;
pub mod source;

use std::sync::Arc;

use convoy_core::DataSourceKind;

pub use backoff::Backoff;
pub use databricks::DatabricksSource;
pub use dataverse::DataverseSource;
pub use source::{
    parse_connection, resolve_env, split_multi_valued, DataSource, DataSourceError, SourceRow,
};

/// Driver lookup by runbook `data_source.type`
#[derive(Clone)]
pub struct SourceRegistry {
    dataverse: Arc<dyn DataSource>,
    databricks: Arc<dyn DataSource>,
}

impl SourceRegistry {
    /// Registry with the production drivers
    pub fn new() -> Self {
        Self {
            dataverse: Arc::new(DataverseSource::new()),
            databricks: Arc::new(DatabricksSource::new()),
        }
    }

    /// Registry with explicit drivers (tests substitute fakes here)
    pub fn with_sources(dataverse: Arc<dyn DataSource>, databricks: Arc<dyn DataSource>) -> Self {
        Self {
            dataverse,
            databricks,
        }
    }

    pub fn for_kind(&self, kind: DataSourceKind) -> Arc<dyn DataSource> {
        match kind {
            DataSourceKind::Dataverse => self.dataverse.clone(),
            DataSourceKind::Databricks => self.databricks.clone(),
        }
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
