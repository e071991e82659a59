//! Dataverse (OData Web API) query driver
//!
//! The runbook binds `connection` to an env var holding
//! `url=<org url>;token=<bearer token>`. The configured query is an OData
//! resource query (e.g. `contacts?$select=emailaddress1,region`); results
//! page through `@odata.nextLink` until exhausted.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, instrument};

use convoy_core::DataSourceDef;

use crate::backoff::Backoff;
use crate::source::{
    parse_connection, resolve_env, split_multi_valued, DataSource, DataSourceError, SourceRow,
};

const API_VERSION: &str = "v9.2";
/// Server-driven paging size per request
const PAGE_SIZE: u32 = 1000;

pub struct DataverseSource {
    client: reqwest::Client,
    backoff: Backoff,
}

impl DataverseSource {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    async fn fetch_page(
        &self,
        url: &str,
        token: &str,
    ) -> Result<Value, DataSourceError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let response = self
                .client
                .get(url)
                .bearer_auth(token)
                .header("Accept", "application/json")
                .header("Prefer", format!("odata.maxpagesize={PAGE_SIZE}"))
                .send()
                .await;

            match response {
                Ok(resp) if resp.status().is_success() => {
                    return resp
                        .json::<Value>()
                        .await
                        .map_err(|e| DataSourceError::Malformed(e.to_string()));
                }
                Ok(resp) if retryable_status(resp.status()) => {
                    let Some(delay) = self.backoff.delay_for(attempt) else {
                        return Err(DataSourceError::Rejected {
                            status: resp.status().as_u16(),
                            detail: resp.text().await.unwrap_or_default(),
                        });
                    };
                    debug!(attempt, status = %resp.status(), "retrying dataverse page");
                    tokio::time::sleep(delay).await;
                }
                Ok(resp) => {
                    return Err(DataSourceError::Rejected {
                        status: resp.status().as_u16(),
                        detail: resp.text().await.unwrap_or_default(),
                    });
                }
                Err(e) => {
                    let Some(delay) = self.backoff.delay_for(attempt) else {
                        return Err(DataSourceError::Http(e.to_string()));
                    };
                    debug!(attempt, error = %e, "retrying dataverse page");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

impl Default for DataverseSource {
    fn default() -> Self {
        Self::new()
    }
}

fn retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

#[async_trait]
impl DataSource for DataverseSource {
    #[instrument(skip(self, def), fields(connection = %def.connection))]
    async fn query(&self, def: &DataSourceDef) -> Result<Vec<SourceRow>, DataSourceError> {
        let raw = resolve_env(&def.connection)?;
        let parts = parse_connection(&def.connection, &raw)?;
        let base_url = parts
            .get("url")
            .ok_or_else(|| DataSourceError::InvalidConnection {
                env: def.connection.clone(),
                reason: "missing url=".into(),
            })?
            .trim_end_matches('/')
            .to_string();
        let token = parts
            .get("token")
            .ok_or_else(|| DataSourceError::InvalidConnection {
                env: def.connection.clone(),
                reason: "missing token=".into(),
            })?;

        let mut url = format!("{base_url}/api/data/{API_VERSION}/{}", def.query);
        let mut rows = Vec::new();

        loop {
            let page = self.fetch_page(&url, token).await?;

            let values = page
                .get("value")
                .and_then(Value::as_array)
                .ok_or_else(|| DataSourceError::Malformed("response has no value array".into()))?;

            for entry in values {
                let object = entry.as_object().ok_or_else(|| {
                    DataSourceError::Malformed("row is not a JSON object".into())
                })?;
                let mut row: SourceRow = object
                    .iter()
                    // OData annotations are metadata, not columns
                    .filter(|(k, _)| !k.starts_with('@') && !k.contains("@odata"))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                split_multi_valued(&mut row, &def.multi_valued_columns);
                rows.push(row);
            }

            match page.get("@odata.nextLink").and_then(Value::as_str) {
                Some(next) => url = next.to_string(),
                None => break,
            }
        }

        debug!(rows = rows.len(), "dataverse query complete");
        Ok(rows)
    }
}
