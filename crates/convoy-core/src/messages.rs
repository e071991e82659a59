//! Wire contracts for the three bus topics
//!
//! All bodies are canonical PascalCase JSON. The event kind travels in the
//! `MessageType` application property, not the body, so bodies stay exactly
//! the shapes the workers and admin tooling already speak.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Scheduler -> orchestrator, plus orchestrator self-scheduling
pub const TOPIC_ORCHESTRATOR_EVENTS: &str = "orchestrator-events";
/// Orchestrator -> workers, filtered per worker by the `WorkerId` property
pub const TOPIC_WORKER_JOBS: &str = "worker-jobs";
/// Workers -> orchestrator
pub const TOPIC_WORKER_RESULTS: &str = "worker-results";

/// Application property carrying the orchestrator event kind
pub const PROP_MESSAGE_TYPE: &str = "MessageType";
/// Application property the worker-jobs subscriptions filter on
pub const PROP_WORKER_ID: &str = "WorkerId";

/// Subscription name the orchestrator consumes under, on both
/// `orchestrator-events` and `worker-results`
pub const SUB_ORCHESTRATOR: &str = "orchestrator";

/// Decode failures for bus message bodies
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("unknown message type {0:?}")]
    UnknownType(String),

    #[error("invalid {message_type} body: {source}")]
    Body {
        message_type: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

// ---------------------------------------------------------------------------
// Orchestrator events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BatchInitEvent {
    pub batch_id: i64,
    pub runbook_name: String,
    pub runbook_version: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PhaseDueEvent {
    pub batch_id: i64,
    pub runbook_name: String,
    pub runbook_version: i32,
    pub phase_name: String,
    pub phase_execution_id: i64,
}

/// Shared body for `member-added` and `member-removed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MemberEvent {
    pub batch_id: i64,
    pub member_key: String,
    pub batch_member_id: i64,
}

/// Shared body for `poll-check` and `retry-check`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecutionCheckEvent {
    pub step_execution_id: i64,
    pub is_init_step: bool,
}

/// The six event kinds carried on `orchestrator-events`
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    BatchInit(BatchInitEvent),
    PhaseDue(PhaseDueEvent),
    MemberAdded(MemberEvent),
    MemberRemoved(MemberEvent),
    PollCheck(ExecutionCheckEvent),
    RetryCheck(ExecutionCheckEvent),
}

impl OrchestratorEvent {
    pub const BATCH_INIT: &'static str = "batch-init";
    pub const PHASE_DUE: &'static str = "phase-due";
    pub const MEMBER_ADDED: &'static str = "member-added";
    pub const MEMBER_REMOVED: &'static str = "member-removed";
    pub const POLL_CHECK: &'static str = "poll-check";
    pub const RETRY_CHECK: &'static str = "retry-check";

    /// Value for the `MessageType` application property
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::BatchInit(_) => Self::BATCH_INIT,
            Self::PhaseDue(_) => Self::PHASE_DUE,
            Self::MemberAdded(_) => Self::MEMBER_ADDED,
            Self::MemberRemoved(_) => Self::MEMBER_REMOVED,
            Self::PollCheck(_) => Self::POLL_CHECK,
            Self::RetryCheck(_) => Self::RETRY_CHECK,
        }
    }

    /// Serialize the body for the wire
    pub fn body(&self) -> Value {
        // Serialization of these shapes cannot fail
        match self {
            Self::BatchInit(e) => serde_json::to_value(e),
            Self::PhaseDue(e) => serde_json::to_value(e),
            Self::MemberAdded(e) | Self::MemberRemoved(e) => serde_json::to_value(e),
            Self::PollCheck(e) | Self::RetryCheck(e) => serde_json::to_value(e),
        }
        .unwrap_or(Value::Null)
    }

    /// Decode a body by its `MessageType` property
    pub fn decode(message_type: &str, body: &Value) -> Result<Self, MessageError> {
        fn parse<T: serde::de::DeserializeOwned>(
            message_type: &'static str,
            body: &Value,
        ) -> Result<T, MessageError> {
            serde_json::from_value(body.clone()).map_err(|source| MessageError::Body {
                message_type,
                source,
            })
        }

        match message_type {
            Self::BATCH_INIT => Ok(Self::BatchInit(parse(Self::BATCH_INIT, body)?)),
            Self::PHASE_DUE => Ok(Self::PhaseDue(parse(Self::PHASE_DUE, body)?)),
            Self::MEMBER_ADDED => Ok(Self::MemberAdded(parse(Self::MEMBER_ADDED, body)?)),
            Self::MEMBER_REMOVED => Ok(Self::MemberRemoved(parse(Self::MEMBER_REMOVED, body)?)),
            Self::POLL_CHECK => Ok(Self::PollCheck(parse(Self::POLL_CHECK, body)?)),
            Self::RETRY_CHECK => Ok(Self::RetryCheck(parse(Self::RETRY_CHECK, body)?)),
            other => Err(MessageError::UnknownType(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Worker jobs and results
// ---------------------------------------------------------------------------

/// Ties a result back to the execution row that dispatched it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CorrelationData {
    pub step_execution_id: i64,
    pub is_init_step: bool,
    pub runbook_name: String,
    pub runbook_version: i32,
}

/// Body published to `worker-jobs`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WorkerJob {
    pub job_id: String,
    pub batch_id: Option<i64>,
    pub worker_id: String,
    pub function_name: String,
    pub parameters: Map<String, Value>,
    pub correlation_data: CorrelationData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultType {
    Boolean,
    Object,
}

/// Worker-reported failure details
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WorkerErrorInfo {
    pub message: String,
    #[serde(rename = "Type", default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub is_throttled: bool,
    #[serde(default)]
    pub attempts: Option<i32>,
}

/// Body received on `worker-results`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WorkerResult {
    pub job_id: String,
    pub status: ResultStatus,
    #[serde(default)]
    pub result_type: Option<ResultType>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<WorkerErrorInfo>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    pub correlation_data: CorrelationData,
}

impl WorkerResult {
    /// Whether a successful result is still incomplete (poll protocol).
    ///
    /// Workers signal "call me again later" with `complete: false` on the
    /// result object; anything else counts as complete.
    pub fn is_poll_incomplete(&self) -> bool {
        self.result
            .as_ref()
            .and_then(|r| r.as_object())
            .and_then(|o| get_field_ci(o, "complete"))
            .and_then(Value::as_bool)
            == Some(false)
    }

    /// The payload `output_params` fields are read from: the `data`
    /// sub-object when a poll completed, else the result itself.
    pub fn output_payload(&self) -> Option<&Map<String, Value>> {
        let root = self.result.as_ref()?.as_object()?;
        if get_field_ci(root, "complete").and_then(Value::as_bool) == Some(true) {
            if let Some(data) = get_field_ci(root, "data").and_then(Value::as_object) {
                return Some(data);
            }
        }
        Some(root)
    }
}

/// Case-insensitive field lookup; the wire is case-preserving but result
/// field names are matched case-insensitively by contract.
pub fn get_field_ci<'a>(map: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    map.get(name)
        .or_else(|| map.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v))
}

// ---------------------------------------------------------------------------
// Job ids
// ---------------------------------------------------------------------------

/// Job id for a member step dispatch; distinct per attempt so the bus
/// duplicate-detection window rejects replays.
pub fn step_job_id(step_execution_id: i64, retry_count: i32) -> String {
    if retry_count == 0 {
        format!("step-{step_execution_id}-attempt-1")
    } else {
        format!("step-{step_execution_id}-retry-{retry_count}")
    }
}

/// Job id for an init step dispatch
pub fn init_job_id(init_execution_id: i64, retry_count: i32) -> String {
    if retry_count == 0 {
        format!("init-{init_execution_id}-attempt-1")
    } else {
        format!("init-{init_execution_id}-retry-{retry_count}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_bodies_are_pascal_case() {
        let event = OrchestratorEvent::PhaseDue(PhaseDueEvent {
            batch_id: 3,
            runbook_name: "r".into(),
            runbook_version: 2,
            phase_name: "cutover".into(),
            phase_execution_id: 11,
        });
        assert_eq!(event.message_type(), "phase-due");
        assert_eq!(
            event.body(),
            json!({
                "BatchId": 3,
                "RunbookName": "r",
                "RunbookVersion": 2,
                "PhaseName": "cutover",
                "PhaseExecutionId": 11
            })
        );
    }

    #[test]
    fn decode_roundtrips_every_kind() {
        let events = [
            OrchestratorEvent::BatchInit(BatchInitEvent {
                batch_id: 1,
                runbook_name: "r".into(),
                runbook_version: 1,
            }),
            OrchestratorEvent::PhaseDue(PhaseDueEvent {
                batch_id: 1,
                runbook_name: "r".into(),
                runbook_version: 1,
                phase_name: "p".into(),
                phase_execution_id: 2,
            }),
            OrchestratorEvent::MemberAdded(MemberEvent {
                batch_id: 1,
                member_key: "a@x".into(),
                batch_member_id: 5,
            }),
            OrchestratorEvent::MemberRemoved(MemberEvent {
                batch_id: 1,
                member_key: "a@x".into(),
                batch_member_id: 5,
            }),
            OrchestratorEvent::PollCheck(ExecutionCheckEvent {
                step_execution_id: 9,
                is_init_step: false,
            }),
            OrchestratorEvent::RetryCheck(ExecutionCheckEvent {
                step_execution_id: 9,
                is_init_step: true,
            }),
        ];
        for event in events {
            let decoded =
                OrchestratorEvent::decode(event.message_type(), &event.body()).unwrap();
            assert_eq!(decoded, event);
        }
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let err = OrchestratorEvent::decode("batch-done", &json!({})).unwrap_err();
        assert!(matches!(err, MessageError::UnknownType(_)));
    }

    #[test]
    fn worker_result_poll_protocol() {
        let mut result = WorkerResult {
            job_id: "step-1-attempt-1".into(),
            status: ResultStatus::Success,
            result_type: Some(ResultType::Object),
            result: Some(json!({"Complete": false})),
            error: None,
            duration_ms: Some(12),
            timestamp: None,
            correlation_data: CorrelationData {
                step_execution_id: 1,
                is_init_step: false,
                runbook_name: "r".into(),
                runbook_version: 1,
            },
        };
        assert!(result.is_poll_incomplete());

        result.result = Some(json!({"complete": true, "Data": {"MailboxId": "m-1"}}));
        assert!(!result.is_poll_incomplete());
        let payload = result.output_payload().unwrap();
        assert_eq!(get_field_ci(payload, "mailboxid"), Some(&json!("m-1")));

        // Plain object results read output fields from the top level
        result.result = Some(json!({"mailbox_id": "m-2"}));
        let payload = result.output_payload().unwrap();
        assert_eq!(get_field_ci(payload, "MAILBOX_ID"), Some(&json!("m-2")));
    }

    #[test]
    fn worker_result_decodes_wire_shape() {
        let body = json!({
            "JobId": "step-4-retry-1",
            "Status": "Failure",
            "ResultType": null,
            "Error": {"Message": "boom", "Type": "Transient", "IsThrottled": true, "Attempts": 2},
            "DurationMs": 900,
            "Timestamp": "2026-03-01T12:00:00Z",
            "CorrelationData": {
                "StepExecutionId": 4,
                "IsInitStep": false,
                "RunbookName": "r",
                "RunbookVersion": 3
            }
        });
        let result: WorkerResult = serde_json::from_value(body).unwrap();
        assert_eq!(result.status, ResultStatus::Failure);
        let error = result.error.unwrap();
        assert_eq!(error.error_type.as_deref(), Some("Transient"));
        assert!(error.is_throttled);
        assert_eq!(result.correlation_data.runbook_version, 3);
    }

    #[test]
    fn job_id_formats() {
        assert_eq!(step_job_id(42, 0), "step-42-attempt-1");
        assert_eq!(step_job_id(42, 2), "step-42-retry-2");
        assert_eq!(init_job_id(7, 0), "init-7-attempt-1");
        assert_eq!(init_job_id(7, 1), "init-7-retry-1");
    }
}
