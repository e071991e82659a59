// Database row models and status state machines

use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// A status string in the database did not match its state machine
#[derive(Debug, thiserror::Error)]
#[error("unknown {entity} status: {value}")]
pub struct UnknownStatus {
    pub entity: &'static str,
    pub value: String,
}

// ============================================
// Status state machines
// ============================================

/// Batch lifecycle: detected -> init_dispatched -> active -> completed|failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    Detected,
    InitDispatched,
    Active,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Detected => "detected",
            Self::InitDispatched => "init_dispatched",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self, UnknownStatus> {
        match value {
            "detected" => Ok(Self::Detected),
            "init_dispatched" => Ok(Self::InitDispatched),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(UnknownStatus {
                entity: "batch",
                value: other.to_string(),
            }),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Member lifecycle: active -> removed|failed (removed may reactivate)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberStatus {
    Active,
    Removed,
    Failed,
}

impl MemberStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Removed => "removed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self, UnknownStatus> {
        match value {
            "active" => Ok(Self::Active),
            "removed" => Ok(Self::Removed),
            "failed" => Ok(Self::Failed),
            other => Err(UnknownStatus {
                entity: "member",
                value: other.to_string(),
            }),
        }
    }
}

/// Phase lifecycle: pending -> dispatched -> completed|failed|skipped|superseded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseStatus {
    Pending,
    Dispatched,
    Completed,
    Failed,
    Skipped,
    Superseded,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Dispatched => "dispatched",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Superseded => "superseded",
        }
    }

    pub fn parse(value: &str) -> Result<Self, UnknownStatus> {
        match value {
            "pending" => Ok(Self::Pending),
            "dispatched" => Ok(Self::Dispatched),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "superseded" => Ok(Self::Superseded),
            other => Err(UnknownStatus {
                entity: "phase",
                value: other.to_string(),
            }),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Dispatched)
    }
}

/// Step lifecycle: pending -> dispatched -> succeeded|failed|polling|poll_timeout|cancelled,
/// with failed -> pending permitted under the retry protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Pending,
    Dispatched,
    Succeeded,
    Failed,
    Polling,
    PollTimeout,
    Cancelled,
}

impl StepStatus {
    /// Statuses a cancel may still claim
    pub const NON_TERMINAL: [StepStatus; 3] = [Self::Pending, Self::Dispatched, Self::Polling];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Dispatched => "dispatched",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Polling => "polling",
            Self::PollTimeout => "poll_timeout",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Result<Self, UnknownStatus> {
        match value {
            "pending" => Ok(Self::Pending),
            "dispatched" => Ok(Self::Dispatched),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "polling" => Ok(Self::Polling),
            "poll_timeout" => Ok(Self::PollTimeout),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(UnknownStatus {
                entity: "step",
                value: other.to_string(),
            }),
        }
    }

    /// Whether a worker result arriving for this status must be ignored.
    /// `failed` counts as terminal here; only `set_retry_pending` may move
    /// it back to `pending`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::PollTimeout | Self::Cancelled
        )
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a runbook version transition does with already-overdue phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverdueBehavior {
    Rerun,
    Ignore,
}

impl OverdueBehavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rerun => "rerun",
            Self::Ignore => "ignore",
        }
    }

    pub fn parse(value: &str) -> Result<Self, UnknownStatus> {
        match value {
            "rerun" => Ok(Self::Rerun),
            "ignore" => Ok(Self::Ignore),
            other => Err(UnknownStatus {
                entity: "overdue_behavior",
                value: other.to_string(),
            }),
        }
    }
}

// ============================================
// Runbooks
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct RunbookRow {
    pub id: i64,
    pub name: String,
    pub version: i32,
    pub yaml: String,
    pub is_active: bool,
    pub overdue_behavior: String,
    pub ignore_overdue_applied: bool,
    pub rerun_init: bool,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunbookRow {
    pub fn overdue_behavior(&self) -> Result<OverdueBehavior, UnknownStatus> {
        OverdueBehavior::parse(&self.overdue_behavior)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct AutomationSettingsRow {
    pub runbook_name: String,
    pub enabled: bool,
    pub updated_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================
// Batches and members
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct BatchRow {
    pub id: i64,
    pub runbook_id: i64,
    /// NULL iff the batch is manual
    pub batch_start_time: Option<DateTime<Utc>>,
    pub is_manual: bool,
    pub status: String,
    pub current_phase: Option<String>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BatchRow {
    pub fn status(&self) -> Result<BatchStatus, UnknownStatus> {
        BatchStatus::parse(&self.status)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct BatchMemberRow {
    pub id: i64,
    pub batch_id: i64,
    pub member_key: String,
    /// Latest attribute snapshot from the data-source query
    pub data_json: serde_json::Value,
    /// Named outputs accumulated from step results
    pub worker_data_json: serde_json::Value,
    pub status: String,
    pub removed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BatchMemberRow {
    pub fn status(&self) -> Result<MemberStatus, UnknownStatus> {
        MemberStatus::parse(&self.status)
    }

    pub fn data(&self) -> serde_json::Map<String, serde_json::Value> {
        self.data_json.as_object().cloned().unwrap_or_default()
    }

    pub fn worker_data(&self) -> serde_json::Map<String, serde_json::Value> {
        self.worker_data_json
            .as_object()
            .cloned()
            .unwrap_or_default()
    }
}

// ============================================
// Phase executions
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct PhaseExecutionRow {
    pub id: i64,
    pub batch_id: i64,
    pub phase_name: String,
    pub offset_minutes: i32,
    /// NULL for manual batches
    pub due_at: Option<DateTime<Utc>>,
    pub runbook_version: i32,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PhaseExecutionRow {
    pub fn status(&self) -> Result<PhaseStatus, UnknownStatus> {
        PhaseStatus::parse(&self.status)
    }
}

/// Insert shape for materializing a phase execution
#[derive(Debug, Clone)]
pub struct NewPhaseExecution {
    pub batch_id: i64,
    pub phase_name: String,
    pub offset_minutes: i32,
    pub due_at: Option<DateTime<Utc>>,
    pub runbook_version: i32,
}

// ============================================
// Step executions
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct StepExecutionRow {
    pub id: i64,
    pub phase_execution_id: i64,
    pub batch_member_id: i64,
    pub step_name: String,
    pub step_index: i32,
    pub worker_id: String,
    pub function_name: String,
    pub params_json: serde_json::Value,
    pub status: String,
    pub job_id: Option<String>,
    pub result_json: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub is_poll_step: bool,
    pub poll_interval_secs: Option<i32>,
    pub poll_timeout_secs: Option<i32>,
    pub poll_started_at: Option<DateTime<Utc>>,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub poll_count: i32,
    pub on_failure: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub retry_interval_secs: i32,
    pub retry_after: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StepExecutionRow {
    pub fn status(&self) -> Result<StepStatus, UnknownStatus> {
        StepStatus::parse(&self.status)
    }

    pub fn params(&self) -> serde_json::Map<String, serde_json::Value> {
        self.params_json.as_object().cloned().unwrap_or_default()
    }
}

/// Insert shape for a member step execution; params are already resolved
#[derive(Debug, Clone)]
pub struct NewStepExecution {
    pub phase_execution_id: i64,
    pub batch_member_id: i64,
    pub step_name: String,
    pub step_index: i32,
    pub worker_id: String,
    pub function_name: String,
    pub params_json: serde_json::Value,
    pub is_poll_step: bool,
    pub poll_interval_secs: Option<i32>,
    pub poll_timeout_secs: Option<i32>,
    pub on_failure: Option<String>,
    pub max_retries: i32,
    pub retry_interval_secs: i32,
}

// ============================================
// Init executions
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct InitExecutionRow {
    pub id: i64,
    pub batch_id: i64,
    pub runbook_version: i32,
    pub step_name: String,
    pub step_index: i32,
    pub worker_id: String,
    pub function_name: String,
    pub params_json: serde_json::Value,
    pub status: String,
    pub job_id: Option<String>,
    pub result_json: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub is_poll_step: bool,
    pub poll_interval_secs: Option<i32>,
    pub poll_timeout_secs: Option<i32>,
    pub poll_started_at: Option<DateTime<Utc>>,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub poll_count: i32,
    pub on_failure: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub retry_interval_secs: i32,
    pub retry_after: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InitExecutionRow {
    pub fn status(&self) -> Result<StepStatus, UnknownStatus> {
        StepStatus::parse(&self.status)
    }

    pub fn params(&self) -> serde_json::Map<String, serde_json::Value> {
        self.params_json.as_object().cloned().unwrap_or_default()
    }
}

/// Insert shape for an init execution (one per init step per batch version)
#[derive(Debug, Clone)]
pub struct NewInitExecution {
    pub batch_id: i64,
    pub runbook_version: i32,
    pub step_name: String,
    pub step_index: i32,
    pub worker_id: String,
    pub function_name: String,
    pub params_json: serde_json::Value,
    pub is_poll_step: bool,
    pub poll_interval_secs: Option<i32>,
    pub poll_timeout_secs: Option<i32>,
    pub on_failure: Option<String>,
    pub max_retries: i32,
    pub retry_interval_secs: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_roundtrip() {
        for status in [
            StepStatus::Pending,
            StepStatus::Dispatched,
            StepStatus::Succeeded,
            StepStatus::Failed,
            StepStatus::Polling,
            StepStatus::PollTimeout,
            StepStatus::Cancelled,
        ] {
            assert_eq!(StepStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(StepStatus::parse("done").is_err());
    }

    #[test]
    fn step_terminality() {
        assert!(StepStatus::Succeeded.is_terminal());
        assert!(StepStatus::Failed.is_terminal());
        assert!(StepStatus::PollTimeout.is_terminal());
        assert!(StepStatus::Cancelled.is_terminal());
        assert!(!StepStatus::Polling.is_terminal());
        assert!(!StepStatus::Pending.is_terminal());
        assert!(!StepStatus::Dispatched.is_terminal());
    }

    #[test]
    fn phase_terminality() {
        assert!(PhaseStatus::Skipped.is_terminal());
        assert!(PhaseStatus::Superseded.is_terminal());
        assert!(!PhaseStatus::Dispatched.is_terminal());
    }
}
