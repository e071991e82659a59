//! Event handlers for the six orchestrator event kinds
//!
//! All handlers are at-least-once and idempotent. Re-delivered events lose
//! their guarded updates and fall through to no-ops; partially applied
//! handlers converge on redelivery because inserts are keyed and
//! transitions are conditional.

use anyhow::Result;
use chrono::Utc;
use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, info, warn};

use convoy_core::{
    BatchInitEvent, ExecutionCheckEvent, MemberEvent, PhaseDueEvent, PhaseDef, RunbookDef,
    StepDef, TemplateContext, TemplateError,
};
use convoy_storage::{
    BatchRow, BatchMemberRow, BatchStatus, NewInitExecution, NewStepExecution, PhaseStatus,
    StepStatus,
};

use crate::Orchestrator;

impl Orchestrator {
    /// `batch-init`: materialize init executions for the runbook version and
    /// dispatch the first pending one. Init steps run once per batch,
    /// sequentially.
    pub async fn handle_batch_init(&self, event: &BatchInitEvent) -> Result<()> {
        let Some(batch) = self.db.get_batch(event.batch_id).await? else {
            warn!(batch_id = event.batch_id, "batch-init for unknown batch");
            return Ok(());
        };
        if batch.status()? != BatchStatus::InitDispatched {
            debug!(batch_id = batch.id, status = %batch.status, "batch-init ignored");
            return Ok(());
        }

        let Some((_, def)) = self
            .load_def(&event.runbook_name, event.runbook_version)
            .await?
        else {
            return Ok(());
        };

        if def.init.is_empty() {
            self.db
                .try_transition_batch(batch.id, &[BatchStatus::InitDispatched], BatchStatus::Active)
                .await?;
            return Ok(());
        }

        let ctx = TemplateContext::for_init(batch.id, batch.batch_start_time);
        let inits = match build_init_executions(&batch, &def, event.runbook_version, &ctx) {
            Ok(inits) => inits,
            Err(e) => {
                // Init templates only see special variables; a bad reference
                // can never resolve, so the batch fails outright
                warn!(batch_id = batch.id, error = %e, "init template resolution failed");
                self.db
                    .try_transition_batch(
                        batch.id,
                        &[BatchStatus::Detected, BatchStatus::InitDispatched],
                        BatchStatus::Failed,
                    )
                    .await?;
                return Ok(());
            }
        };

        self.db.insert_init_executions(&inits).await?;

        match self
            .db
            .next_pending_init(batch.id, event.runbook_version)
            .await?
        {
            Some(next) => {
                self.dispatcher.dispatch_init(&next, &event.runbook_name).await?;
            }
            None => {
                // Redelivery after all inits finished
                if self
                    .db
                    .inits_all_succeeded(batch.id, event.runbook_version)
                    .await?
                {
                    self.db
                        .try_transition_batch(
                            batch.id,
                            &[BatchStatus::InitDispatched],
                            BatchStatus::Active,
                        )
                        .await?;
                }
            }
        }

        Ok(())
    }

    /// `phase-due`: fan out one step execution per (active member x step),
    /// resolve templates per member, claim pending -> dispatched, and start
    /// every member's first step in parallel.
    pub async fn handle_phase_due(&self, event: &PhaseDueEvent) -> Result<()> {
        let Some(phase) = self.db.get_phase(event.phase_execution_id).await? else {
            warn!(phase_execution_id = event.phase_execution_id, "phase-due for unknown phase");
            return Ok(());
        };
        let status = phase.status()?;
        if status.is_terminal() {
            debug!(phase_execution_id = phase.id, status = %phase.status, "phase-due ignored");
            return Ok(());
        }
        let Some(batch) = self.db.get_batch(phase.batch_id).await? else {
            return Ok(());
        };
        let Some((_, def)) = self
            .load_def(&event.runbook_name, phase.runbook_version)
            .await?
        else {
            return Ok(());
        };
        let Some(phase_def) = def.phase(&phase.phase_name) else {
            warn!(phase = %phase.phase_name, "phase missing from runbook definition");
            return Ok(());
        };

        if status == PhaseStatus::Pending {
            for member in self.db.list_active_members(batch.id).await? {
                match build_member_steps(phase.id, &batch, &member, phase_def, &def) {
                    Ok(steps) => {
                        self.db.insert_step_executions(&steps).await?;
                    }
                    Err(e) => {
                        // Per-member isolation: one bad template does not
                        // hold up the rest of the batch
                        warn!(
                            batch_id = batch.id,
                            member_key = %member.member_key,
                            error = %e,
                            "member failed template resolution"
                        );
                        self.handle_member_failure(member.id).await?;
                    }
                }
            }

            self.db
                .try_transition_phase(phase.id, &[PhaseStatus::Pending], PhaseStatus::Dispatched)
                .await?;
            self.db
                .set_batch_current_phase(batch.id, Some(&phase.phase_name))
                .await?;
            info!(batch_id = batch.id, phase = %phase.phase_name, "phase dispatched");
        }

        // Fresh dispatch and redelivery share this path: only steps still
        // pending at index 0 are claimed
        let entries = self.db.list_phase_entry_steps(phase.id).await?;
        if entries.is_empty() {
            // Nothing to start (no members, or all failed resolution):
            // completion must be decided here or never
            self.check_phase_completion(phase.id).await?;
            return Ok(());
        }

        let dispatches = entries.iter().map(|step| {
            self.dispatcher.dispatch_step(
                step,
                batch.id,
                &event.runbook_name,
                phase.runbook_version,
            )
        });
        for outcome in join_all(dispatches).await {
            outcome?;
        }

        Ok(())
    }

    /// `member-added`: late-join catch-up. Phases already dispatched (or
    /// finished) get step rows for the new member immediately; pending
    /// phases pick the member up at normal dispatch.
    pub async fn handle_member_added(&self, event: &MemberEvent) -> Result<()> {
        let Some(member) = self.db.get_member(event.batch_member_id).await? else {
            warn!(batch_member_id = event.batch_member_id, "member-added for unknown member");
            return Ok(());
        };
        if member.status()? != convoy_storage::MemberStatus::Active {
            return Ok(());
        }
        let Some(batch) = self.db.get_batch(member.batch_id).await? else {
            return Ok(());
        };
        let Some(runbook) = self.db.get_runbook_by_id(batch.runbook_id).await? else {
            return Ok(());
        };

        for phase in self.db.list_phases(batch.id).await? {
            match phase.status()? {
                PhaseStatus::Dispatched | PhaseStatus::Completed | PhaseStatus::Failed => {}
                _ => continue,
            }

            let Some((_, def)) = self.load_def(&runbook.name, phase.runbook_version).await? else {
                continue;
            };
            let Some(phase_def) = def.phase(&phase.phase_name) else {
                continue;
            };

            match build_member_steps(phase.id, &batch, &member, phase_def, &def) {
                Ok(steps) => {
                    self.db.insert_step_executions(&steps).await?;
                    if let Some(next) = self.db.next_pending_step(phase.id, member.id).await? {
                        if next.step_index == 0 {
                            self.dispatcher
                                .dispatch_step(&next, batch.id, &runbook.name, phase.runbook_version)
                                .await?;
                        }
                    }
                    debug!(
                        batch_id = batch.id,
                        member_key = %member.member_key,
                        phase = %phase.phase_name,
                        "late-join catch-up"
                    );
                }
                Err(e) => {
                    warn!(
                        batch_id = batch.id,
                        member_key = %member.member_key,
                        error = %e,
                        "late member failed template resolution"
                    );
                    self.handle_member_failure(member.id).await?;
                    return Ok(());
                }
            }
        }

        Ok(())
    }

    /// `member-removed`: cancel everything non-terminal for the member,
    /// then run the runbook's cleanup sequence fire-and-forget.
    pub async fn handle_member_removed(&self, event: &MemberEvent) -> Result<()> {
        let Some(member) = self.db.get_member(event.batch_member_id).await? else {
            warn!(batch_member_id = event.batch_member_id, "member-removed for unknown member");
            return Ok(());
        };

        let cancelled = self.db.cancel_member_steps(member.id).await?;
        if cancelled > 0 {
            info!(
                batch_id = member.batch_id,
                member_key = %member.member_key,
                cancelled,
                "cancelled steps for removed member"
            );
        }

        let Some(batch) = self.db.get_batch(member.batch_id).await? else {
            return Ok(());
        };
        let Some(runbook) = self.db.get_runbook_by_id(batch.runbook_id).await? else {
            return Ok(());
        };

        // Cleanup runs under the currently active definition; fall back to
        // the version the batch was created with
        let active = self.db.get_active_runbook(&runbook.name).await?;
        let (version, def) = match active {
            Some(row) => match self.load_def(&runbook.name, row.version).await? {
                Some((_, def)) => (row.version, Some(def)),
                None => (runbook.version, None),
            },
            None => (runbook.version, None),
        };
        let def = match def {
            Some(def) => Some(def),
            None => self
                .load_def(&runbook.name, runbook.version)
                .await?
                .map(|(_, def)| def),
        };

        if let Some(def) = def {
            if !def.on_member_removed.is_empty() {
                let data = member.data();
                let worker_data = member.worker_data();
                let ctx = TemplateContext::for_member(
                    batch.id,
                    batch.batch_start_time,
                    &data,
                    &worker_data,
                );
                self.dispatcher
                    .dispatch_untracked(
                        &def.on_member_removed,
                        &ctx,
                        &format!("member-removed-{}", member.id),
                        batch.id,
                        &runbook.name,
                        version,
                    )
                    .await?;
            }
        }

        // The cancellations may have closed out a phase
        for phase_id in self.db.member_dispatched_phase_ids(member.id).await? {
            self.check_phase_completion(phase_id).await?;
        }

        Ok(())
    }

    /// `poll-check`: abandon a poll past its timeout, otherwise re-invoke
    /// the worker and record the poll.
    pub async fn handle_poll_check(&self, event: &ExecutionCheckEvent) -> Result<()> {
        if event.is_init_step {
            return self.poll_check_init(event).await;
        }

        let Some(step) = self.db.get_step(event.step_execution_id).await? else {
            return Ok(());
        };
        if step.status()? != StepStatus::Polling {
            debug!(step_execution_id = step.id, status = %step.status, "poll-check ignored");
            return Ok(());
        }

        let now = Utc::now();
        let timed_out = match (step.poll_started_at, step.poll_timeout_secs) {
            (Some(started), Some(timeout)) => {
                started + chrono::Duration::seconds(timeout as i64) < now
            }
            _ => false,
        };

        if timed_out {
            if self.db.mark_step_poll_timeout(step.id).await? {
                info!(step_execution_id = step.id, "poll timed out");
                // Poll timeouts never retry; straight to the failure path
                self.after_step_terminal_failure(&step).await?;
            }
            return Ok(());
        }

        let Some(phase) = self.db.get_phase(step.phase_execution_id).await? else {
            return Ok(());
        };
        let Some(batch) = self.db.get_batch(phase.batch_id).await? else {
            return Ok(());
        };
        let Some(runbook) = self.db.get_runbook_by_id(batch.runbook_id).await? else {
            return Ok(());
        };

        self.dispatcher
            .redispatch_poll(&step, batch.id, &runbook.name, phase.runbook_version)
            .await?;
        Ok(())
    }

    async fn poll_check_init(&self, event: &ExecutionCheckEvent) -> Result<()> {
        let Some(init) = self.db.get_init(event.step_execution_id).await? else {
            return Ok(());
        };
        if init.status()? != StepStatus::Polling {
            return Ok(());
        }

        let now = Utc::now();
        let timed_out = match (init.poll_started_at, init.poll_timeout_secs) {
            (Some(started), Some(timeout)) => {
                started + chrono::Duration::seconds(timeout as i64) < now
            }
            _ => false,
        };

        if timed_out {
            if self.db.mark_init_poll_timeout(init.id).await? {
                info!(init_execution_id = init.id, "init poll timed out");
                self.after_init_terminal_failure(&init).await?;
            }
            return Ok(());
        }

        let Some(batch) = self.db.get_batch(init.batch_id).await? else {
            return Ok(());
        };
        let Some(runbook) = self.db.get_runbook_by_id(batch.runbook_id).await? else {
            return Ok(());
        };

        self.dispatcher.redispatch_init_poll(&init, &runbook.name).await?;
        Ok(())
    }

    /// `retry-check`: the delayed self-message armed by `SetRetryPending`.
    /// Only acts on an execution still in retry-pending state.
    pub async fn handle_retry_check(&self, event: &ExecutionCheckEvent) -> Result<()> {
        if event.is_init_step {
            let Some(init) = self.db.get_init(event.step_execution_id).await? else {
                return Ok(());
            };
            if init.status()? != StepStatus::Pending || init.retry_count == 0 {
                debug!(init_execution_id = init.id, "retry-check ignored");
                return Ok(());
            }
            let Some(batch) = self.db.get_batch(init.batch_id).await? else {
                return Ok(());
            };
            let Some(runbook) = self.db.get_runbook_by_id(batch.runbook_id).await? else {
                return Ok(());
            };
            self.dispatcher.dispatch_init(&init, &runbook.name).await?;
            return Ok(());
        }

        let Some(step) = self.db.get_step(event.step_execution_id).await? else {
            return Ok(());
        };
        if step.status()? != StepStatus::Pending || step.retry_count == 0 {
            debug!(step_execution_id = step.id, "retry-check ignored");
            return Ok(());
        }
        let Some(phase) = self.db.get_phase(step.phase_execution_id).await? else {
            return Ok(());
        };
        let Some(batch) = self.db.get_batch(phase.batch_id).await? else {
            return Ok(());
        };
        let Some(runbook) = self.db.get_runbook_by_id(batch.runbook_id).await? else {
            return Ok(());
        };

        self.dispatcher
            .dispatch_step(&step, batch.id, &runbook.name, phase.runbook_version)
            .await?;
        Ok(())
    }
}

/// Resolve one member's step executions for a phase. Resolution happens
/// exactly once, here; the resolved function and params are stored on the
/// rows.
pub(crate) fn build_member_steps(
    phase_execution_id: i64,
    batch: &BatchRow,
    member: &BatchMemberRow,
    phase_def: &PhaseDef,
    def: &RunbookDef,
) -> Result<Vec<NewStepExecution>, TemplateError> {
    let data = member.data();
    let worker_data = member.worker_data();
    let ctx = TemplateContext::for_member(batch.id, batch.batch_start_time, &data, &worker_data);

    phase_def
        .steps
        .iter()
        .enumerate()
        .map(|(index, step)| {
            let (function_name, params) = resolve_step(&ctx, step)?;
            let retry = def.effective_retry(step);
            Ok(NewStepExecution {
                phase_execution_id,
                batch_member_id: member.id,
                step_name: step.name.clone(),
                step_index: index as i32,
                worker_id: step.worker_id.clone(),
                function_name,
                params_json: Value::Object(params),
                is_poll_step: step.poll.is_some(),
                poll_interval_secs: step.poll.map(|p| p.interval_secs as i32),
                poll_timeout_secs: step.poll.map(|p| p.timeout_secs as i32),
                on_failure: step.on_failure.clone(),
                max_retries: retry.max_retries,
                retry_interval_secs: retry.interval_secs as i32,
            })
        })
        .collect()
}

/// Resolve init executions; init templates only see the special variables
pub(crate) fn build_init_executions(
    batch: &BatchRow,
    def: &RunbookDef,
    runbook_version: i32,
    ctx: &TemplateContext<'_>,
) -> Result<Vec<NewInitExecution>, TemplateError> {
    def.init
        .iter()
        .enumerate()
        .map(|(index, step)| {
            let (function_name, params) = resolve_step(ctx, step)?;
            let retry = def.effective_retry(step);
            Ok(NewInitExecution {
                batch_id: batch.id,
                runbook_version,
                step_name: step.name.clone(),
                step_index: index as i32,
                worker_id: step.worker_id.clone(),
                function_name,
                params_json: Value::Object(params),
                is_poll_step: step.poll.is_some(),
                poll_interval_secs: step.poll.map(|p| p.interval_secs as i32),
                poll_timeout_secs: step.poll.map(|p| p.timeout_secs as i32),
                on_failure: step.on_failure.clone(),
                max_retries: retry.max_retries,
                retry_interval_secs: retry.interval_secs as i32,
            })
        })
        .collect()
}

fn resolve_step(
    ctx: &TemplateContext<'_>,
    step: &StepDef,
) -> Result<(String, serde_json::Map<String, Value>), TemplateError> {
    let function_name = ctx.resolve_str(&step.function)?;
    let params = ctx.resolve_params(&step.params)?;
    Ok((function_name, params))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use convoy_core::parse_runbook;
    use serde_json::json;

    fn batch() -> BatchRow {
        BatchRow {
            id: 7,
            runbook_id: 1,
            batch_start_time: Some(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()),
            is_manual: false,
            status: "active".into(),
            current_phase: None,
            created_by: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn member(data: serde_json::Value, worker_data: serde_json::Value) -> BatchMemberRow {
        BatchMemberRow {
            id: 21,
            batch_id: 7,
            member_key: "a@x".into(),
            data_json: data,
            worker_data_json: worker_data,
            status: "active".into(),
            removed_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    const YAML: &str = r#"
name: r
data_source:
  type: dataverse
  connection: CONN
  query: q
  primary_key: email
  batch_time: immediate
retry:
  max_retries: 3
  interval: 2m
init:
  - name: provision
    worker_id: infra
    function: Provision
    params:
      batch: "{{_batch_id}}"
phases:
  - name: p
    offset: T-0
    steps:
      - name: sync
        worker_id: mover
        function: "Sync{{flavor}}"
        params:
          who: "{{email}}"
          mailbox: "{{MailboxId}}"
        poll:
          interval: 15m
          timeout: 1h
        on_failure: undo
      - name: finish
        worker_id: mover
        function: Finish
        retry:
          max_retries: 1
          interval: 30s
rollbacks:
  undo:
    - name: stop
      worker_id: mover
      function: Stop
"#;

    #[test]
    fn builds_resolved_member_steps() {
        let def = parse_runbook(YAML).unwrap();
        let batch = batch();
        let member = member(
            json!({"email": "a@x", "flavor": "Fast"}),
            json!({"MailboxId": "mb-1"}),
        );

        let steps =
            build_member_steps(99, &batch, &member, def.phase("p").unwrap(), &def).unwrap();
        assert_eq!(steps.len(), 2);

        let sync = &steps[0];
        assert_eq!(sync.step_index, 0);
        assert_eq!(sync.function_name, "SyncFast");
        assert_eq!(sync.params_json, json!({"who": "a@x", "mailbox": "mb-1"}));
        assert!(sync.is_poll_step);
        assert_eq!(sync.poll_interval_secs, Some(900));
        assert_eq!(sync.poll_timeout_secs, Some(3600));
        assert_eq!(sync.on_failure.as_deref(), Some("undo"));
        // Global retry applies when the step has no override
        assert_eq!(sync.max_retries, 3);
        assert_eq!(sync.retry_interval_secs, 120);

        let finish = &steps[1];
        assert_eq!(finish.step_index, 1);
        assert!(!finish.is_poll_step);
        // Step-level retry replaces the global setting entirely
        assert_eq!(finish.max_retries, 1);
        assert_eq!(finish.retry_interval_secs, 30);
    }

    #[test]
    fn unresolved_member_variable_is_an_error() {
        let def = parse_runbook(YAML).unwrap();
        let batch = batch();
        // No MailboxId captured yet
        let member = member(json!({"email": "a@x", "flavor": "Fast"}), json!({}));

        let err = build_member_steps(99, &batch, &member, def.phase("p").unwrap(), &def)
            .unwrap_err();
        assert_eq!(err, TemplateError("MailboxId".into()));
    }

    #[test]
    fn builds_init_executions_with_special_vars_only() {
        let def = parse_runbook(YAML).unwrap();
        let batch = batch();
        let ctx = TemplateContext::for_init(batch.id, batch.batch_start_time);

        let inits = build_init_executions(&batch, &def, 4, &ctx).unwrap();
        assert_eq!(inits.len(), 1);
        assert_eq!(inits[0].runbook_version, 4);
        assert_eq!(inits[0].step_index, 0);
        assert_eq!(inits[0].worker_id, "infra");
        assert_eq!(inits[0].params_json, json!({"batch": "7"}));
    }
}
