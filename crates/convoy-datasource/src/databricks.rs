//! Databricks SQL statement execution driver
//!
//! The runbook binds `connection` to an env var holding
//! `host=<workspace url>;token=<pat>` and `warehouse_id` to an env var
//! holding the SQL warehouse id. The configured query is submitted to the
//! statement execution API and polled until it finishes; result chunks page
//! until exhausted.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use convoy_core::DataSourceDef;

use crate::backoff::Backoff;
use crate::source::{
    parse_connection, resolve_env, split_multi_valued, DataSource, DataSourceError, SourceRow,
};

const STATEMENTS_PATH: &str = "/api/2.0/sql/statements";
/// How long the initial request waits server-side before switching to polling
const WAIT_TIMEOUT: &str = "30s";
const POLL_INTERVAL: Duration = Duration::from_secs(5);

pub struct DatabricksSource {
    client: reqwest::Client,
    backoff: Backoff,
}

impl DatabricksSource {
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

    async fn request(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<Value, DataSourceError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match build().send().await {
                Ok(resp) if resp.status().is_success() => {
                    return resp
                        .json::<Value>()
                        .await
                        .map_err(|e| DataSourceError::Malformed(e.to_string()));
                }
                Ok(resp)
                    if resp.status().as_u16() == 429 || resp.status().is_server_error() =>
                {
                    let Some(delay) = self.backoff.delay_for(attempt) else {
                        return Err(DataSourceError::Rejected {
                            status: resp.status().as_u16(),
                            detail: resp.text().await.unwrap_or_default(),
                        });
                    };
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
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

impl Default for DatabricksSource {
    fn default() -> Self {
        Self::new()
    }
}

fn statement_state(body: &Value) -> &str {
    body.pointer("/status/state").and_then(Value::as_str).unwrap_or("")
}

fn column_names(body: &Value) -> Result<Vec<String>, DataSourceError> {
    body.pointer("/manifest/schema/columns")
        .and_then(Value::as_array)
        .map(|columns| {
            columns
                .iter()
                .filter_map(|c| c.get("name").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .ok_or_else(|| DataSourceError::Malformed("statement result has no schema".into()))
}

#[async_trait]
impl DataSource for DatabricksSource {
    #[instrument(skip(self, def), fields(connection = %def.connection))]
    async fn query(&self, def: &DataSourceDef) -> Result<Vec<SourceRow>, DataSourceError> {
        let raw = resolve_env(&def.connection)?;
        let parts = parse_connection(&def.connection, &raw)?;
        let host = parts
            .get("host")
            .ok_or_else(|| DataSourceError::InvalidConnection {
                env: def.connection.clone(),
                reason: "missing host=".into(),
            })?
            .trim_end_matches('/')
            .to_string();
        let token = parts
            .get("token")
            .ok_or_else(|| DataSourceError::InvalidConnection {
                env: def.connection.clone(),
                reason: "missing token=".into(),
            })?
            .clone();

        let warehouse_env = def.warehouse_id.as_deref().ok_or_else(|| {
            DataSourceError::InvalidConnection {
                env: def.connection.clone(),
                reason: "databricks runbook without warehouse_id".into(),
            }
        })?;
        let warehouse_id = resolve_env(warehouse_env)?;

        // Submit, then poll until the statement reaches a terminal state
        let submit_url = format!("{host}{STATEMENTS_PATH}");
        let payload = json!({
            "statement": def.query,
            "warehouse_id": warehouse_id,
            "wait_timeout": WAIT_TIMEOUT,
        });
        let mut body = self
            .request(|| {
                self.client
                    .post(&submit_url)
                    .bearer_auth(&token)
                    .json(&payload)
            })
            .await?;

        let statement_id = body
            .get("statement_id")
            .and_then(Value::as_str)
            .ok_or_else(|| DataSourceError::Malformed("no statement_id in response".into()))?
            .to_string();

        while matches!(statement_state(&body), "PENDING" | "RUNNING") {
            tokio::time::sleep(POLL_INTERVAL).await;
            let status_url = format!("{host}{STATEMENTS_PATH}/{statement_id}");
            body = self
                .request(|| self.client.get(&status_url).bearer_auth(&token))
                .await?;
        }

        if statement_state(&body) != "SUCCEEDED" {
            let detail = body
                .pointer("/status/error/message")
                .and_then(Value::as_str)
                .unwrap_or("statement did not succeed");
            return Err(DataSourceError::Rejected {
                status: 200,
                detail: format!("{} ({})", detail, statement_state(&body)),
            });
        }

        let names = column_names(&body)?;
        let mut rows = Vec::new();
        let mut chunk = body.get("result").cloned();

        while let Some(current) = chunk.take() {
            if let Some(data) = current.get("data_array").and_then(Value::as_array) {
                for values in data {
                    let values = values.as_array().ok_or_else(|| {
                        DataSourceError::Malformed("data_array row is not an array".into())
                    })?;
                    let mut row: SourceRow = names
                        .iter()
                        .cloned()
                        .zip(values.iter().cloned())
                        .collect();
                    split_multi_valued(&mut row, &def.multi_valued_columns);
                    rows.push(row);
                }
            }

            // Chunked results stream until next_chunk_index runs out
            if let Some(next) = current.get("next_chunk_index").and_then(Value::as_i64) {
                let chunk_url =
                    format!("{host}{STATEMENTS_PATH}/{statement_id}/result/chunks/{next}");
                chunk = Some(
                    self.request(|| self.client.get(&chunk_url).bearer_auth(&token))
                        .await?,
                );
            }
        }

        debug!(rows = rows.len(), "databricks query complete");
        Ok(rows)
    }
}
