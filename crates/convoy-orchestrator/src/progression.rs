//! Progression service
//!
//! Per-member step walk, member-failure isolation, and the phase/batch
//! completion cascade. Every decision point re-reads state and claims its
//! transition with a guard, so any interleaving of successes, failures and
//! cancellations converges to the same terminal state.

use anyhow::Result;
use tracing::{debug, info, warn};

use convoy_storage::{BatchStatus, PhaseStatus, StepExecutionRow};

use crate::Orchestrator;

impl Orchestrator {
    /// After a step success: dispatch the member's next pending step in the
    /// phase, or close out the phase if the member is done.
    pub async fn check_member_progression(&self, step: &StepExecutionRow) -> Result<()> {
        let Some(phase) = self.db.get_phase(step.phase_execution_id).await? else {
            return Ok(());
        };
        let Some(batch) = self.db.get_batch(phase.batch_id).await? else {
            return Ok(());
        };
        let Some(runbook) = self.db.get_runbook_by_id(batch.runbook_id).await? else {
            return Ok(());
        };

        match self
            .db
            .next_pending_step(phase.id, step.batch_member_id)
            .await?
        {
            Some(next) => {
                debug!(
                    batch_member_id = step.batch_member_id,
                    next_step = %next.step_name,
                    "advancing member"
                );
                self.dispatcher
                    .dispatch_step(&next, batch.id, &runbook.name, phase.runbook_version)
                    .await?;
            }
            None => {
                self.check_phase_completion(phase.id).await?;
            }
        }

        Ok(())
    }

    /// Member-failure isolation: claim active -> failed, cancel everything
    /// non-terminal the member owns, then re-evaluate affected phases. The
    /// guard means exactly one concurrent caller does the cleanup.
    pub async fn handle_member_failure(&self, batch_member_id: i64) -> Result<()> {
        if !self.db.fail_member(batch_member_id).await? {
            debug!(batch_member_id, "member failure already handled");
            return Ok(());
        }

        let cancelled = self.db.cancel_member_steps(batch_member_id).await?;
        warn!(batch_member_id, cancelled, "member failed, steps cancelled");

        for phase_id in self.db.member_dispatched_phase_ids(batch_member_id).await? {
            self.check_phase_completion(phase_id).await?;
        }

        Ok(())
    }

    /// Close a phase once every step row is terminal: completed when at
    /// least one member ran every step successfully, failed otherwise.
    pub async fn check_phase_completion(&self, phase_execution_id: i64) -> Result<()> {
        let Some(phase) = self.db.get_phase(phase_execution_id).await? else {
            return Ok(());
        };
        if phase.status()? != PhaseStatus::Dispatched {
            return Ok(());
        }
        if !self.db.phase_steps_terminal(phase.id).await? {
            return Ok(());
        }

        let outcome = if self.db.phase_has_fully_succeeded_member(phase.id).await? {
            PhaseStatus::Completed
        } else {
            PhaseStatus::Failed
        };

        if self
            .db
            .try_transition_phase(phase.id, &[PhaseStatus::Dispatched], outcome)
            .await?
        {
            info!(
                phase_execution_id = phase.id,
                phase = %phase.phase_name,
                outcome = outcome.as_str(),
                "phase finished"
            );
            self.check_batch_completion(phase.batch_id).await?;
        }

        Ok(())
    }

    /// Close a batch once every phase is terminal: completed when at least
    /// one phase completed, failed otherwise.
    pub async fn check_batch_completion(&self, batch_id: i64) -> Result<()> {
        let phases = self.db.list_phases(batch_id).await?;
        if phases.is_empty() {
            return Ok(());
        }

        let mut any_completed = false;
        for phase in &phases {
            match phase.status()? {
                PhaseStatus::Pending | PhaseStatus::Dispatched => return Ok(()),
                PhaseStatus::Completed => any_completed = true,
                _ => {}
            }
        }

        let outcome = if any_completed {
            BatchStatus::Completed
        } else {
            BatchStatus::Failed
        };

        if self
            .db
            .try_transition_batch(batch_id, &[BatchStatus::Active], outcome)
            .await?
        {
            info!(batch_id, outcome = outcome.as_str(), "batch finished");
            self.db.set_batch_current_phase(batch_id, None).await?;
        }

        Ok(())
    }
}
