//! Worker result processor
//!
//! Routes results from the `worker-results` subscription by
//! `CorrelationData`. Results for terminal executions are ignored, which is
//! what makes duplicate and late deliveries (including results for
//! speculatively cancelled steps) harmless.

use anyhow::Result;
use chrono::Utc;
use serde_json::Map;
use tracing::{debug, info, warn};

use convoy_bus::BusMessage;
use convoy_core::{
    get_field_ci, ExecutionCheckEvent, OrchestratorEvent, ResultStatus, TemplateContext,
    WorkerResult, PROP_MESSAGE_TYPE, TOPIC_ORCHESTRATOR_EVENTS,
};
use convoy_storage::{retry_after, BatchStatus, InitExecutionRow, StepExecutionRow};

use crate::Orchestrator;

impl Orchestrator {
    /// Entry point for one worker result
    pub async fn process_worker_result(&self, result: &WorkerResult) -> Result<()> {
        if result.correlation_data.is_init_step {
            self.process_init_result(result).await
        } else {
            self.process_step_result(result).await
        }
    }

    async fn process_step_result(&self, result: &WorkerResult) -> Result<()> {
        let Some(step) = self
            .db
            .get_step(result.correlation_data.step_execution_id)
            .await?
        else {
            // Untracked dispatches (rollbacks, cleanup) land here
            debug!(job_id = %result.job_id, "result without execution row ignored");
            return Ok(());
        };
        if step.status()?.is_terminal() {
            debug!(step_execution_id = step.id, "result for terminal step ignored");
            return Ok(());
        }

        match result.status {
            ResultStatus::Success => {
                if result.is_poll_incomplete() {
                    // Worker says "not done yet": enter/stay in polling
                    self.db.mark_step_polling(step.id).await?;
                    return Ok(());
                }

                if self
                    .db
                    .mark_step_succeeded(step.id, result.result.as_ref())
                    .await?
                {
                    info!(step_execution_id = step.id, step = %step.step_name, "step succeeded");
                    self.apply_output_params(&step, result).await?;
                    self.check_member_progression(&step).await?;
                }
            }
            ResultStatus::Failure => {
                let error = result
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| "worker reported failure".to_string());

                if step.retry_count < step.max_retries {
                    if self.db.mark_step_failed(step.id, &error).await? {
                        let due = retry_after(Utc::now(), step.retry_interval_secs);
                        if self.db.set_step_retry_pending(step.id, due).await? {
                            info!(
                                step_execution_id = step.id,
                                retry = step.retry_count + 1,
                                of = step.max_retries,
                                "step will retry"
                            );
                            self.schedule_retry_check(step.id, false, step.retry_count + 1, due)
                                .await?;
                        }
                    }
                } else if self.db.mark_step_failed(step.id, &error).await? {
                    warn!(step_execution_id = step.id, error = %error, "step failed terminally");
                    self.after_step_terminal_failure(&step).await?;
                }
            }
        }

        Ok(())
    }

    async fn process_init_result(&self, result: &WorkerResult) -> Result<()> {
        let Some(init) = self
            .db
            .get_init(result.correlation_data.step_execution_id)
            .await?
        else {
            debug!(job_id = %result.job_id, "result without init row ignored");
            return Ok(());
        };
        if init.status()?.is_terminal() {
            debug!(init_execution_id = init.id, "result for terminal init ignored");
            return Ok(());
        }

        match result.status {
            ResultStatus::Success => {
                if result.is_poll_incomplete() {
                    self.db.mark_init_polling(init.id).await?;
                    return Ok(());
                }

                if self
                    .db
                    .mark_init_succeeded(init.id, result.result.as_ref())
                    .await?
                {
                    info!(init_execution_id = init.id, step = %init.step_name, "init step succeeded");
                    self.advance_init(&init).await?;
                }
            }
            ResultStatus::Failure => {
                let error = result
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| "worker reported failure".to_string());

                if init.retry_count < init.max_retries {
                    if self.db.mark_init_failed(init.id, &error).await? {
                        let due = retry_after(Utc::now(), init.retry_interval_secs);
                        if self.db.set_init_retry_pending(init.id, due).await? {
                            info!(
                                init_execution_id = init.id,
                                retry = init.retry_count + 1,
                                "init step will retry"
                            );
                            self.schedule_retry_check(init.id, true, init.retry_count + 1, due)
                                .await?;
                        }
                    }
                } else if self.db.mark_init_failed(init.id, &error).await? {
                    warn!(init_execution_id = init.id, error = %error, "init step failed terminally");
                    self.after_init_terminal_failure(&init).await?;
                }
            }
        }

        Ok(())
    }

    /// Sequential init progression: dispatch the next pending init, or move
    /// the batch to active after the last one.
    async fn advance_init(&self, init: &InitExecutionRow) -> Result<()> {
        let Some(batch) = self.db.get_batch(init.batch_id).await? else {
            return Ok(());
        };
        let Some(runbook) = self.db.get_runbook_by_id(batch.runbook_id).await? else {
            return Ok(());
        };

        match self
            .db
            .next_pending_init(init.batch_id, init.runbook_version)
            .await?
        {
            Some(next) => {
                self.dispatcher.dispatch_init(&next, &runbook.name).await?;
            }
            None => {
                if self
                    .db
                    .inits_all_succeeded(init.batch_id, init.runbook_version)
                    .await?
                {
                    if self
                        .db
                        .try_transition_batch(
                            batch.id,
                            &[BatchStatus::InitDispatched],
                            BatchStatus::Active,
                        )
                        .await?
                    {
                        info!(batch_id = batch.id, "init complete, batch active");
                        // Phases may already be terminal (all skipped at a
                        // version transition while init was re-running)
                        self.check_batch_completion(batch.id).await?;
                    }
                }
            }
        }

        Ok(())
    }

    /// Capture declared output params from the payload into the member's
    /// accumulated worker data. Field lookup is case-insensitive.
    async fn apply_output_params(
        &self,
        step: &StepExecutionRow,
        result: &WorkerResult,
    ) -> Result<()> {
        let Some(phase) = self.db.get_phase(step.phase_execution_id).await? else {
            return Ok(());
        };
        let Some((_, def)) = self
            .load_def(
                &result.correlation_data.runbook_name,
                result.correlation_data.runbook_version,
            )
            .await?
        else {
            return Ok(());
        };
        let Some(step_def) = def
            .phase(&phase.phase_name)
            .and_then(|p| p.steps.get(step.step_index as usize))
        else {
            return Ok(());
        };
        if step_def.output_params.is_empty() {
            return Ok(());
        }
        let Some(payload) = result.output_payload() else {
            return Ok(());
        };

        let mut updates = Map::new();
        for (variable, field) in &step_def.output_params {
            match get_field_ci(payload, field) {
                Some(value) => {
                    updates.insert(variable.clone(), value.clone());
                }
                None => {
                    warn!(
                        step_execution_id = step.id,
                        field = %field,
                        "output param field missing from result"
                    );
                }
            }
        }

        self.db
            .merge_member_worker_data(step.batch_member_id, &updates)
            .await?;
        Ok(())
    }

    /// Failure path after a step is terminally failed (retries exhausted or
    /// poll timeout): run the configured rollback fire-and-forget, then
    /// isolate the member.
    pub(crate) async fn after_step_terminal_failure(
        &self,
        step: &StepExecutionRow,
    ) -> Result<()> {
        if let Some(rollback_name) = &step.on_failure {
            if let Err(e) = self.dispatch_step_rollback(step, rollback_name).await {
                // Rollbacks are best-effort; member isolation still runs
                warn!(step_execution_id = step.id, error = %e, "rollback dispatch failed");
            }
        }
        self.handle_member_failure(step.batch_member_id).await
    }

    async fn dispatch_step_rollback(
        &self,
        step: &StepExecutionRow,
        rollback_name: &str,
    ) -> Result<()> {
        let Some(phase) = self.db.get_phase(step.phase_execution_id).await? else {
            return Ok(());
        };
        let Some(batch) = self.db.get_batch(phase.batch_id).await? else {
            return Ok(());
        };
        let Some(runbook) = self.db.get_runbook_by_id(batch.runbook_id).await? else {
            return Ok(());
        };
        let Some((_, def)) = self.load_def(&runbook.name, phase.runbook_version).await? else {
            return Ok(());
        };
        let Some(rollback_steps) = def.rollbacks.get(rollback_name) else {
            warn!(rollback = rollback_name, "rollback sequence missing from definition");
            return Ok(());
        };
        let Some(member) = self.db.get_member(step.batch_member_id).await? else {
            return Ok(());
        };

        info!(
            step_execution_id = step.id,
            rollback = rollback_name,
            member_key = %member.member_key,
            "dispatching rollback"
        );

        let data = member.data();
        let worker_data = member.worker_data();
        let ctx =
            TemplateContext::for_member(batch.id, batch.batch_start_time, &data, &worker_data);
        self.dispatcher
            .dispatch_untracked(
                rollback_steps,
                &ctx,
                &format!("rollback-step-{}", step.id),
                batch.id,
                &runbook.name,
                phase.runbook_version,
            )
            .await
    }

    /// Init failure fails the batch immediately
    pub(crate) async fn after_init_terminal_failure(
        &self,
        init: &InitExecutionRow,
    ) -> Result<()> {
        let Some(batch) = self.db.get_batch(init.batch_id).await? else {
            return Ok(());
        };
        let Some(runbook) = self.db.get_runbook_by_id(batch.runbook_id).await? else {
            return Ok(());
        };

        if let Some(rollback_name) = &init.on_failure {
            if let Some((_, def)) = self.load_def(&runbook.name, init.runbook_version).await? {
                if let Some(rollback_steps) = def.rollbacks.get(rollback_name) {
                    let ctx = TemplateContext::for_init(batch.id, batch.batch_start_time);
                    if let Err(e) = self
                        .dispatcher
                        .dispatch_untracked(
                            rollback_steps,
                            &ctx,
                            &format!("rollback-init-{}", init.id),
                            batch.id,
                            &runbook.name,
                            init.runbook_version,
                        )
                        .await
                    {
                        warn!(init_execution_id = init.id, error = %e, "init rollback dispatch failed");
                    }
                }
            }
        }

        if self
            .db
            .try_transition_batch(
                batch.id,
                &[BatchStatus::Detected, BatchStatus::InitDispatched],
                BatchStatus::Failed,
            )
            .await?
        {
            warn!(batch_id = batch.id, "batch failed during init");
        }
        Ok(())
    }

    /// Arm the delayed self-message that re-dispatches a retry-pending
    /// execution at its RetryAfter time.
    async fn schedule_retry_check(
        &self,
        execution_id: i64,
        is_init_step: bool,
        retry_number: i32,
        due: chrono::DateTime<Utc>,
    ) -> Result<()> {
        let event = OrchestratorEvent::RetryCheck(ExecutionCheckEvent {
            step_execution_id: execution_id,
            is_init_step,
        });
        let kind = if is_init_step { "init" } else { "step" };
        let message = BusMessage::new(TOPIC_ORCHESTRATOR_EVENTS, event.body())
            .with_property(PROP_MESSAGE_TYPE, event.message_type())
            .with_message_id(format!("retry-check-{kind}-{execution_id}-{retry_number}"))
            .with_visible_at(due);
        self.bus.publish(message).await?;
        Ok(())
    }
}
