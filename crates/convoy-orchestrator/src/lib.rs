//! # Convoy orchestrator
//!
//! The event-driven dispatch and progression engine. A single consumer
//! reads `orchestrator-events` and `worker-results`; every handler is
//! idempotent under at-least-once delivery because each state transition is
//! a guarded conditional update — losing a guard means another delivery
//! already did the work.

pub mod dispatcher;
pub mod handlers;
pub mod progression;
pub mod results;
pub mod router;

use std::sync::Arc;

use anyhow::Result;
use tracing::warn;

use convoy_bus::MessageBus;
use convoy_core::{parse_runbook, OrchestratorEvent, RunbookDef};
use convoy_storage::{Database, RunbookRow};

pub use dispatcher::WorkerDispatcher;
pub use router::{EventRouter, RouterConfig};

pub struct Orchestrator {
    pub(crate) db: Database,
    pub(crate) bus: Arc<dyn MessageBus>,
    pub(crate) dispatcher: WorkerDispatcher,
}

impl Orchestrator {
    pub fn new(db: Database, bus: Arc<dyn MessageBus>) -> Self {
        let dispatcher = WorkerDispatcher::new(db.clone(), bus.clone());
        Self {
            db,
            bus,
            dispatcher,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Dispatch one decoded event to its handler
    pub async fn handle_event(&self, event: &OrchestratorEvent) -> Result<()> {
        match event {
            OrchestratorEvent::BatchInit(e) => self.handle_batch_init(e).await,
            OrchestratorEvent::PhaseDue(e) => self.handle_phase_due(e).await,
            OrchestratorEvent::MemberAdded(e) => self.handle_member_added(e).await,
            OrchestratorEvent::MemberRemoved(e) => self.handle_member_removed(e).await,
            OrchestratorEvent::PollCheck(e) => self.handle_poll_check(e).await,
            OrchestratorEvent::RetryCheck(e) => self.handle_retry_check(e).await,
        }
    }

    /// Load and parse a specific runbook version. A missing version or
    /// unparseable YAML is reported by the caller, not retried forever.
    pub(crate) async fn load_def(
        &self,
        name: &str,
        version: i32,
    ) -> Result<Option<(RunbookRow, RunbookDef)>> {
        let Some(row) = self.db.get_runbook(name, version).await? else {
            warn!(runbook = name, version, "runbook version not found");
            return Ok(None);
        };
        match parse_runbook(&row.yaml) {
            Ok(def) => Ok(Some((row, def))),
            Err(e) => {
                warn!(runbook = name, version, error = %e, "stored runbook failed to parse");
                Ok(None)
            }
        }
    }
}
