//! Worker dispatcher
//!
//! Serializes jobs onto the `worker-jobs` topic with the `WorkerId`
//! application property the per-worker subscriptions filter on. Every
//! dispatch attempt carries a distinct job id, and the job id doubles as
//! the bus message id so the duplicate-detection window shields workers
//! from replayed dispatches.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, instrument, warn};

use convoy_bus::{BusMessage, MessageBus};
use convoy_core::{
    init_job_id, step_job_id, CorrelationData, StepDef, TemplateContext, WorkerJob,
    PROP_WORKER_ID, TOPIC_WORKER_JOBS,
};
use convoy_storage::{Database, InitExecutionRow, StepExecutionRow};

#[derive(Clone)]
pub struct WorkerDispatcher {
    db: Database,
    bus: Arc<dyn MessageBus>,
}

impl WorkerDispatcher {
    pub fn new(db: Database, bus: Arc<dyn MessageBus>) -> Self {
        Self { db, bus }
    }

    /// Dispatch a pending member step. Publishes the job first, then claims
    /// pending -> dispatched; a redelivered trigger republished under the
    /// same job id is absorbed by duplicate detection.
    #[instrument(skip(self, step), fields(step_execution_id = step.id))]
    pub async fn dispatch_step(
        &self,
        step: &StepExecutionRow,
        batch_id: i64,
        runbook_name: &str,
        runbook_version: i32,
    ) -> Result<bool> {
        // A retry-armed step stays parked until its RetryAfter; only the
        // delayed retry-check (or anything later) may start it
        if step.retry_after.map(|due| due > Utc::now()).unwrap_or(false) {
            debug!(step_execution_id = step.id, "retry not due yet");
            return Ok(false);
        }

        let job_id = step_job_id(step.id, step.retry_count);
        let job = WorkerJob {
            job_id: job_id.clone(),
            batch_id: Some(batch_id),
            worker_id: step.worker_id.clone(),
            function_name: step.function_name.clone(),
            parameters: step.params(),
            correlation_data: CorrelationData {
                step_execution_id: step.id,
                is_init_step: false,
                runbook_name: runbook_name.to_string(),
                runbook_version,
            },
        };

        self.publish_job(&job).await?;
        let claimed = self.db.mark_step_dispatched(step.id, &job_id).await?;
        if claimed {
            debug!(job_id, worker_id = %step.worker_id, "step dispatched");
        }
        Ok(claimed)
    }

    /// Dispatch a pending init step
    #[instrument(skip(self, init), fields(init_execution_id = init.id))]
    pub async fn dispatch_init(
        &self,
        init: &InitExecutionRow,
        runbook_name: &str,
    ) -> Result<bool> {
        if init.retry_after.map(|due| due > Utc::now()).unwrap_or(false) {
            debug!(init_execution_id = init.id, "retry not due yet");
            return Ok(false);
        }

        let job_id = init_job_id(init.id, init.retry_count);
        let job = WorkerJob {
            job_id: job_id.clone(),
            batch_id: Some(init.batch_id),
            worker_id: init.worker_id.clone(),
            function_name: init.function_name.clone(),
            parameters: init.params(),
            correlation_data: CorrelationData {
                step_execution_id: init.id,
                is_init_step: true,
                runbook_name: runbook_name.to_string(),
                runbook_version: init.runbook_version,
            },
        };

        self.publish_job(&job).await?;
        let claimed = self.db.mark_init_dispatched(init.id, &job_id).await?;
        if claimed {
            debug!(job_id, worker_id = %init.worker_id, "init step dispatched");
        }
        Ok(claimed)
    }

    /// Re-dispatch a polling step with the same function and params
    pub async fn redispatch_poll(
        &self,
        step: &StepExecutionRow,
        batch_id: i64,
        runbook_name: &str,
        runbook_version: i32,
    ) -> Result<()> {
        let job_id = format!("step-{}-poll-{}", step.id, step.poll_count + 1);
        let job = WorkerJob {
            job_id: job_id.clone(),
            batch_id: Some(batch_id),
            worker_id: step.worker_id.clone(),
            function_name: step.function_name.clone(),
            parameters: step.params(),
            correlation_data: CorrelationData {
                step_execution_id: step.id,
                is_init_step: false,
                runbook_name: runbook_name.to_string(),
                runbook_version,
            },
        };

        self.publish_job(&job).await?;
        self.db.touch_step_poll(step.id, &job_id).await?;
        Ok(())
    }

    /// Re-dispatch a polling init step
    pub async fn redispatch_init_poll(
        &self,
        init: &InitExecutionRow,
        runbook_name: &str,
    ) -> Result<()> {
        let job_id = format!("init-{}-poll-{}", init.id, init.poll_count + 1);
        let job = WorkerJob {
            job_id: job_id.clone(),
            batch_id: Some(init.batch_id),
            worker_id: init.worker_id.clone(),
            function_name: init.function_name.clone(),
            parameters: init.params(),
            correlation_data: CorrelationData {
                step_execution_id: init.id,
                is_init_step: true,
                runbook_name: runbook_name.to_string(),
                runbook_version: init.runbook_version,
            },
        };

        self.publish_job(&job).await?;
        self.db.touch_init_poll(init.id, &job_id).await?;
        Ok(())
    }

    /// Fire-and-forget dispatch for rollback and on_member_removed
    /// sequences: no execution rows, no status tracking. Late results hit
    /// the terminal-state guard (or an unknown id) and are ignored.
    pub async fn dispatch_untracked(
        &self,
        steps: &[StepDef],
        ctx: &TemplateContext<'_>,
        job_id_prefix: &str,
        batch_id: i64,
        runbook_name: &str,
        runbook_version: i32,
    ) -> Result<()> {
        for (index, step) in steps.iter().enumerate() {
            let function_name = match ctx.resolve_str(&step.function) {
                Ok(resolved) => resolved,
                Err(e) => {
                    warn!(step = %step.name, error = %e, "untracked step skipped");
                    continue;
                }
            };
            let parameters: Map<String, Value> = match ctx.resolve_params(&step.params) {
                Ok(resolved) => resolved,
                Err(e) => {
                    warn!(step = %step.name, error = %e, "untracked step skipped");
                    continue;
                }
            };

            let job = WorkerJob {
                job_id: format!("{job_id_prefix}-{index}"),
                batch_id: Some(batch_id),
                worker_id: step.worker_id.clone(),
                function_name,
                parameters,
                correlation_data: CorrelationData {
                    // No execution row backs these jobs
                    step_execution_id: 0,
                    is_init_step: false,
                    runbook_name: runbook_name.to_string(),
                    runbook_version,
                },
            };
            self.publish_job(&job).await?;
        }
        Ok(())
    }

    async fn publish_job(&self, job: &WorkerJob) -> Result<()> {
        let body = serde_json::to_value(job)?;
        let message = BusMessage::new(TOPIC_WORKER_JOBS, body)
            .with_property(PROP_WORKER_ID, job.worker_id.clone())
            .with_message_id(job.job_id.clone());
        self.bus.publish(message).await?;
        Ok(())
    }
}
