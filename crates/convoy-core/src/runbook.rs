//! Runbook definitions and the YAML parser
//!
//! A runbook describes one migration workflow: where its members come from
//! (the data source), the timed phases each batch walks through, the init
//! steps run once per batch, and the rollback sequences referenced by
//! `on_failure`.
//!
//! Parsing is two stage: serde deserializes the YAML into raw structs, then
//! [`parse_runbook`] validates and converts them into the definition types
//! the scheduler and orchestrator consume. Unknown top-level keys are
//! ignored so operators can annotate runbooks freely.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

/// Errors raised while parsing or validating a runbook
#[derive(Debug, thiserror::Error)]
pub enum RunbookError {
    /// YAML syntax or shape error
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Phase offset did not match `T-<N><unit>`
    #[error("invalid phase offset {0:?}: {1}")]
    InvalidOffset(String, String),

    /// Duration did not match `<N><unit>` with unit in s/m/h/d
    #[error("invalid duration {0:?}")]
    InvalidDuration(String),

    /// `on_failure` names a rollback that does not exist
    #[error("step {step:?} references unknown rollback {rollback:?}")]
    UnknownRollback { step: String, rollback: String },

    /// `batch_time` and `batch_time_column` are mutually exclusive
    #[error("data_source: batch_time and batch_time_column are mutually exclusive")]
    BatchTimeConflict,

    /// Neither `batch_time` nor `batch_time_column` was given
    #[error("data_source: one of batch_time or batch_time_column is required")]
    BatchTimeMissing,

    /// `batch_time` must be the literal `immediate`
    #[error("data_source: unsupported batch_time {0:?} (expected \"immediate\")")]
    InvalidBatchTime(String),

    /// `primary_key` must be non-empty
    #[error("data_source: primary_key must not be empty")]
    EmptyPrimaryKey,

    /// Databricks sources require `warehouse_id`
    #[error("data_source: warehouse_id is required for databricks sources")]
    MissingWarehouseId,
}

/// Which driver executes the membership query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSourceKind {
    Dataverse,
    Databricks,
}

/// How batch start times are derived from query results
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchTimeMode {
    /// Every tick groups new rows into a batch starting "now" (rounded to
    /// the nearest 5-minute boundary)
    Immediate,

    /// Rows carry their batch start time in this column
    Column(String),
}

/// Split format for a multi-valued column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultiValueFormat {
    SemicolonDelimited,
    CommaDelimited,
    JsonArray,
}

/// A column whose delimited value expands into a JSON array
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MultiValuedColumn {
    pub column: String,
    pub format: MultiValueFormat,
}

/// Validated data-source section
#[derive(Debug, Clone, PartialEq)]
pub struct DataSourceDef {
    pub kind: DataSourceKind,
    /// Name of the environment variable holding the connection string
    pub connection: String,
    /// Name of the environment variable holding the warehouse id (databricks)
    pub warehouse_id: Option<String>,
    pub query: String,
    pub primary_key: String,
    pub batch_time: BatchTimeMode,
    pub multi_valued_columns: Vec<MultiValuedColumn>,
}

/// Retry settings, global or per step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDef {
    pub max_retries: i32,
    pub interval_secs: i64,
}

impl RetryDef {
    /// No retries at all; the default when a runbook omits `retry`
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            interval_secs: 0,
        }
    }
}

/// Poll settings for a step whose worker reports `{complete: false}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollDef {
    pub interval_secs: i64,
    pub timeout_secs: i64,
}

/// One function invocation, per member (phase steps) or per batch (init)
#[derive(Debug, Clone, PartialEq)]
pub struct StepDef {
    pub name: String,
    pub worker_id: String,
    /// Function name; may contain `{{var}}` templates
    pub function: String,
    /// Parameter map; string values may contain `{{var}}` templates
    pub params: serde_json::Map<String, Value>,
    /// Template-var name -> result field to capture after success
    pub output_params: BTreeMap<String, String>,
    /// Rollback sequence dispatched when this step fails terminally
    pub on_failure: Option<String>,
    pub poll: Option<PollDef>,
    /// Step-level retry; replaces the global setting entirely when present
    pub retry: Option<RetryDef>,
}

/// A named, time-offset section of the runbook
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseDef {
    pub name: String,
    /// Minutes before the batch start time that this phase becomes due
    pub offset_minutes: i64,
    pub steps: Vec<StepDef>,
}

/// A parsed, validated runbook
#[derive(Debug, Clone, PartialEq)]
pub struct RunbookDef {
    pub name: String,
    pub description: Option<String>,
    pub data_source: DataSourceDef,
    /// Global retry setting; steps may override
    pub retry: Option<RetryDef>,
    pub init: Vec<StepDef>,
    pub phases: Vec<PhaseDef>,
    pub on_member_removed: Vec<StepDef>,
    pub rollbacks: BTreeMap<String, Vec<StepDef>>,
}

impl RunbookDef {
    /// Effective retry setting for a step: the step override, else the
    /// global setting, else none.
    pub fn effective_retry(&self, step: &StepDef) -> RetryDef {
        step.retry.or(self.retry).unwrap_or_else(RetryDef::none)
    }

    /// Phases ordered by offset, largest (earliest) first
    pub fn phases_by_offset(&self) -> Vec<&PhaseDef> {
        let mut phases: Vec<&PhaseDef> = self.phases.iter().collect();
        phases.sort_by(|a, b| b.offset_minutes.cmp(&a.offset_minutes));
        phases
    }

    pub fn phase(&self, name: &str) -> Option<&PhaseDef> {
        self.phases.iter().find(|p| p.name == name)
    }
}

// ---------------------------------------------------------------------------
// Raw YAML shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawRunbook {
    name: String,
    #[serde(default)]
    description: Option<String>,
    data_source: RawDataSource,
    #[serde(default)]
    retry: Option<RawRetry>,
    #[serde(default)]
    init: Vec<RawStep>,
    #[serde(default)]
    phases: Vec<RawPhase>,
    #[serde(default)]
    on_member_removed: Vec<RawStep>,
    #[serde(default)]
    rollbacks: BTreeMap<String, Vec<RawStep>>,
}

#[derive(Debug, Deserialize)]
struct RawDataSource {
    #[serde(rename = "type")]
    kind: DataSourceKind,
    connection: String,
    #[serde(default)]
    warehouse_id: Option<String>,
    query: String,
    primary_key: String,
    #[serde(default)]
    batch_time: Option<String>,
    #[serde(default)]
    batch_time_column: Option<String>,
    #[serde(default)]
    multi_valued_columns: Vec<MultiValuedColumn>,
}

#[derive(Debug, Deserialize)]
struct RawRetry {
    max_retries: i32,
    interval: String,
}

#[derive(Debug, Deserialize)]
struct RawPoll {
    interval: String,
    timeout: String,
}

#[derive(Debug, Deserialize)]
struct RawStep {
    name: String,
    worker_id: String,
    function: String,
    #[serde(default)]
    params: serde_json::Map<String, Value>,
    #[serde(default)]
    output_params: BTreeMap<String, String>,
    #[serde(default)]
    on_failure: Option<String>,
    #[serde(default)]
    poll: Option<RawPoll>,
    #[serde(default)]
    retry: Option<RawRetry>,
}

#[derive(Debug, Deserialize)]
struct RawPhase {
    name: String,
    offset: String,
    #[serde(default)]
    steps: Vec<RawStep>,
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse and validate a YAML runbook
pub fn parse_runbook(yaml: &str) -> Result<RunbookDef, RunbookError> {
    let raw: RawRunbook = serde_yaml::from_str(yaml)?;

    let batch_time = match (&raw.data_source.batch_time, &raw.data_source.batch_time_column) {
        (Some(_), Some(_)) => return Err(RunbookError::BatchTimeConflict),
        (None, None) => return Err(RunbookError::BatchTimeMissing),
        (Some(mode), None) if mode == "immediate" => BatchTimeMode::Immediate,
        (Some(mode), None) => return Err(RunbookError::InvalidBatchTime(mode.clone())),
        (None, Some(column)) => BatchTimeMode::Column(column.clone()),
    };

    if raw.data_source.primary_key.trim().is_empty() {
        return Err(RunbookError::EmptyPrimaryKey);
    }
    if raw.data_source.kind == DataSourceKind::Databricks && raw.data_source.warehouse_id.is_none()
    {
        return Err(RunbookError::MissingWarehouseId);
    }

    let data_source = DataSourceDef {
        kind: raw.data_source.kind,
        connection: raw.data_source.connection,
        warehouse_id: raw.data_source.warehouse_id,
        query: raw.data_source.query,
        primary_key: raw.data_source.primary_key,
        batch_time,
        multi_valued_columns: raw.data_source.multi_valued_columns,
    };

    let retry = raw.retry.map(convert_retry).transpose()?;
    let init = convert_steps(raw.init)?;
    let on_member_removed = convert_steps(raw.on_member_removed)?;

    let mut phases = Vec::with_capacity(raw.phases.len());
    for phase in raw.phases {
        phases.push(PhaseDef {
            offset_minutes: parse_offset(&phase.offset)?,
            name: phase.name,
            steps: convert_steps(phase.steps)?,
        });
    }

    let mut rollbacks = BTreeMap::new();
    for (name, steps) in raw.rollbacks {
        rollbacks.insert(name, convert_steps(steps)?);
    }

    let def = RunbookDef {
        name: raw.name,
        description: raw.description,
        data_source,
        retry,
        init,
        phases,
        on_member_removed,
        rollbacks,
    };

    validate_rollback_refs(&def)?;
    Ok(def)
}

fn convert_steps(raw: Vec<RawStep>) -> Result<Vec<StepDef>, RunbookError> {
    raw.into_iter().map(convert_step).collect()
}

fn convert_step(raw: RawStep) -> Result<StepDef, RunbookError> {
    let poll = match raw.poll {
        Some(p) => Some(PollDef {
            interval_secs: parse_duration_secs(&p.interval)?,
            timeout_secs: parse_duration_secs(&p.timeout)?,
        }),
        None => None,
    };
    Ok(StepDef {
        name: raw.name,
        worker_id: raw.worker_id,
        function: raw.function,
        params: raw.params,
        output_params: raw.output_params,
        on_failure: raw.on_failure,
        poll,
        retry: raw.retry.map(convert_retry).transpose()?,
    })
}

fn convert_retry(raw: RawRetry) -> Result<RetryDef, RunbookError> {
    Ok(RetryDef {
        max_retries: raw.max_retries,
        interval_secs: parse_duration_secs(&raw.interval)?,
    })
}

fn validate_rollback_refs(def: &RunbookDef) -> Result<(), RunbookError> {
    let all_steps = def
        .init
        .iter()
        .chain(def.phases.iter().flat_map(|p| p.steps.iter()))
        .chain(def.on_member_removed.iter())
        .chain(def.rollbacks.values().flatten());

    for step in all_steps {
        if let Some(rollback) = &step.on_failure {
            if !def.rollbacks.contains_key(rollback) {
                return Err(RunbookError::UnknownRollback {
                    step: step.name.clone(),
                    rollback: rollback.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Parse a phase offset of the form `T-<N><unit>` into minutes.
///
/// Units: `d` (days), `h` (hours), `m` (minutes), `s` (seconds, rounded up
/// to whole minutes). `T-0` means zero offset.
pub fn parse_offset(offset: &str) -> Result<i64, RunbookError> {
    let invalid = |reason: &str| RunbookError::InvalidOffset(offset.to_string(), reason.into());

    let rest = offset
        .strip_prefix("T-")
        .ok_or_else(|| invalid("expected T- prefix"))?;

    if rest == "0" {
        return Ok(0);
    }

    let unit = rest
        .chars()
        .last()
        .ok_or_else(|| invalid("missing magnitude"))?;
    let digits = &rest[..rest.len() - unit.len_utf8()];
    let n: i64 = digits.parse().map_err(|_| invalid("magnitude not a number"))?;

    match unit {
        'd' => Ok(n * 1440),
        'h' => Ok(n * 60),
        'm' => Ok(n),
        's' => Ok((n + 59) / 60),
        _ => Err(invalid("unit must be one of d/h/m/s")),
    }
}

/// Parse a duration of the form `<N><unit>` into seconds (unit s/m/h/d)
pub fn parse_duration_secs(duration: &str) -> Result<i64, RunbookError> {
    let invalid = || RunbookError::InvalidDuration(duration.to_string());

    let unit = duration.chars().last().ok_or_else(invalid)?;
    let digits = &duration[..duration.len() - unit.len_utf8()];
    let n: i64 = digits.parse().map_err(|_| invalid())?;

    match unit {
        's' => Ok(n),
        'm' => Ok(n * 60),
        'h' => Ok(n * 3600),
        'd' => Ok(n * 86400),
        _ => Err(invalid()),
    }
}
