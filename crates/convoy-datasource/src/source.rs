//! DataSource trait and row model
//!
//! The scheduler is driver-agnostic: it hands a validated
//! [`DataSourceDef`] to a [`DataSource`] and gets back ordered rows of
//! column -> value. Column names are matched case-insensitively everywhere
//! downstream, so drivers only have to preserve them, not normalize them.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{Map, Value};

use convoy_core::{DataSourceDef, MultiValueFormat, MultiValuedColumn};

/// Error type for data-source operations
#[derive(Debug, thiserror::Error)]
pub enum DataSourceError {
    /// The connection env var named by the runbook is not set
    #[error("environment variable {0} is not set")]
    MissingEnv(String),

    /// The connection string did not parse
    #[error("invalid connection string in {env}: {reason}")]
    InvalidConnection { env: String, reason: String },

    /// Transport-level failure after retries were exhausted
    #[error("request failed: {0}")]
    Http(String),

    /// The service answered with a non-success status
    #[error("query rejected ({status}): {detail}")]
    Rejected { status: u16, detail: String },

    /// The response payload did not have the expected shape
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// One query result row: ordered columns with case-insensitive access
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceRow {
    columns: Vec<(String, Value)>,
}

impl SourceRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: Value) {
        self.columns.push((name.into(), value));
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// The column rendered as a plain string (scalars unquoted)
    pub fn get_str(&self, name: &str) -> Option<String> {
        self.get(name).map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Serialize to the JSON object stored as the member's data snapshot
    pub fn to_json(&self) -> Map<String, Value> {
        self.columns
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl FromIterator<(String, Value)> for SourceRow {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self {
            columns: iter.into_iter().collect(),
        }
    }
}

/// Pluggable query driver; one implementation per `data_source.type`
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Run the runbook's membership query and return all rows
    async fn query(&self, def: &DataSourceDef) -> Result<Vec<SourceRow>, DataSourceError>;
}

/// Resolve the env var a runbook binds its connection string to
pub fn resolve_env(name: &str) -> Result<String, DataSourceError> {
    std::env::var(name).map_err(|_| DataSourceError::MissingEnv(name.to_string()))
}

/// Parse a `key=value;key=value` connection string
pub fn parse_connection(
    env: &str,
    raw: &str,
) -> Result<BTreeMap<String, String>, DataSourceError> {
    let mut parts = BTreeMap::new();
    for pair in raw.split(';').filter(|p| !p.trim().is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| DataSourceError::InvalidConnection {
                env: env.to_string(),
                reason: format!("segment {pair:?} is not key=value"),
            })?;
        parts.insert(key.trim().to_lowercase(), value.trim().to_string());
    }
    Ok(parts)
}

/// Expand declared multi-valued columns from delimited strings into JSON
/// arrays, in place. Columns already arrays (or missing) pass through.
pub fn split_multi_valued(row: &mut SourceRow, declarations: &[MultiValuedColumn]) {
    for declaration in declarations {
        let Some(position) = row
            .columns
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(&declaration.column))
        else {
            continue;
        };

        let current = &row.columns[position].1;
        let Value::String(raw) = current else {
            continue;
        };

        let values: Vec<Value> = match declaration.format {
            MultiValueFormat::SemicolonDelimited => split_delimited(raw, ';'),
            MultiValueFormat::CommaDelimited => split_delimited(raw, ','),
            MultiValueFormat::JsonArray => match serde_json::from_str::<Value>(raw) {
                Ok(Value::Array(items)) => items,
                // Anything else stays a single-element array of the raw text
                _ => vec![Value::String(raw.clone())],
            },
        };

        row.columns[position].1 = Value::Array(values);
    }
}

fn split_delimited(raw: &str, delimiter: char) -> Vec<Value> {
    raw.split(delimiter)
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| Value::String(part.to_string()))
        .collect()
}
