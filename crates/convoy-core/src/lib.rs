//! # Convoy core
//!
//! Shared domain types for the convoy scheduler and orchestrator:
//!
//! - **Runbooks**: versioned YAML workflow definitions, parsed and validated
//!   into [`runbook::RunbookDef`]
//! - **Templates**: `{{var}}` resolution against member data, worker output
//!   and the special batch variables
//! - **Messages**: the wire contracts carried on the three bus topics
//!   (orchestrator events, worker jobs, worker results)
//!
//! Everything here is pure — no I/O. The storage, bus and service crates
//! build on these types.

pub mod messages;
pub mod runbook;
pub mod template;

pub use messages::{
    get_field_ci, init_job_id, step_job_id, BatchInitEvent, CorrelationData, ExecutionCheckEvent,
    MemberEvent, OrchestratorEvent, PhaseDueEvent, ResultStatus, ResultType, WorkerErrorInfo,
    WorkerJob, WorkerResult, PROP_MESSAGE_TYPE, PROP_WORKER_ID, SUB_ORCHESTRATOR,
    TOPIC_ORCHESTRATOR_EVENTS, TOPIC_WORKER_JOBS, TOPIC_WORKER_RESULTS,
};
pub use runbook::{
    parse_runbook, BatchTimeMode, DataSourceDef, DataSourceKind, MultiValueFormat,
    MultiValuedColumn, PhaseDef, PollDef, RetryDef, RunbookDef, RunbookError, StepDef,
};
pub use template::{TemplateContext, TemplateError};
