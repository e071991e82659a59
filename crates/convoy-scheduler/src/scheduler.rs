//! The scheduler loop
//!
//! Every tick walks all active runbooks inside an isolated error boundary:
//! query the data source, detect new batches, diff membership of existing
//! ones, publish timing events for due phases, and carry in-flight batches
//! across runbook version transitions. A cross-runbook sweep then emits
//! poll-check events for polling executions whose interval elapsed.
//!
//! The scheduler never transitions phase or step state itself; it only
//! observes and publishes. The orchestrator is the sole state transitioner,
//! which is what makes every publish here safely repeatable.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use convoy_bus::{BusMessage, MessageBus};
use convoy_core::{
    parse_runbook, BatchInitEvent, ExecutionCheckEvent, MemberEvent, OrchestratorEvent,
    PhaseDueEvent, RunbookDef, PROP_MESSAGE_TYPE, TOPIC_ORCHESTRATOR_EVENTS,
};
use convoy_datasource::SourceRegistry;
use convoy_storage::{
    BatchRow, BatchStatus, Database, MemberStatus, NewPhaseExecution, OverdueBehavior, RunbookRow,
};

use crate::config::SchedulerConfig;
use crate::detect::group_rows;

pub struct Scheduler {
    db: Database,
    bus: Arc<dyn MessageBus>,
    sources: SourceRegistry,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        db: Database,
        bus: Arc<dyn MessageBus>,
        sources: SourceRegistry,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            db,
            bus,
            sources,
            config,
        }
    }

    /// Run until the shutdown signal flips
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(interval_secs = self.config.tick_interval.as_secs(), "scheduler running");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        error!(error = %e, "tick failed");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("scheduler shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// One full tick: every active runbook, then the poll sweep
    #[instrument(skip(self))]
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<()> {
        let runbooks = self.db.list_active_runbooks().await?;
        debug!(count = runbooks.len(), "tick started");

        for runbook in &runbooks {
            // Per-runbook error boundary: one broken runbook must not
            // starve the rest of the tick
            if let Err(e) = self.process_runbook(runbook, now).await {
                warn!(runbook = %runbook.name, error = %e, "runbook tick failed");
                if let Err(record_err) =
                    self.db.record_runbook_error(runbook.id, &e.to_string()).await
                {
                    error!(runbook = %runbook.name, error = %record_err, "failed to record error");
                }
            }
        }

        if let Err(e) = self.poll_sweep(now).await {
            error!(error = %e, "poll sweep failed");
        }

        Ok(())
    }

    #[instrument(skip(self, runbook, now), fields(runbook = %runbook.name, version = runbook.version))]
    async fn process_runbook(&self, runbook: &RunbookRow, now: DateTime<Utc>) -> Result<()> {
        let def = parse_runbook(&runbook.yaml)?;

        if !self.db.automation_enabled(&runbook.name).await? {
            debug!("automation disabled, skipping");
            return Ok(());
        }

        let source = self.sources.for_kind(def.data_source.kind);
        let rows = source.query(&def.data_source).await?;

        let active_keys: HashSet<String> = self
            .db
            .active_member_keys(&runbook.name)
            .await?
            .into_iter()
            .collect();
        let groups = group_rows(&def.data_source, rows, now, &active_keys);

        for (start, group) in groups {
            match self.db.find_batch(&runbook.name, start).await? {
                None => self.create_batch(runbook, &def, start, group).await?,
                Some(batch) => self.diff_membership(&batch, &def, group).await?,
            }
        }

        self.dispatch_due(runbook, &def, now).await?;
        self.apply_version_transitions(runbook, &def, now).await?;

        Ok(())
    }

    /// Materialize a freshly detected batch: members, phase executions,
    /// and either the init handshake or a direct move to active.
    async fn create_batch(
        &self,
        runbook: &RunbookRow,
        def: &RunbookDef,
        start: DateTime<Utc>,
        rows: Vec<convoy_datasource::SourceRow>,
    ) -> Result<()> {
        let batch = self.db.create_batch(runbook.id, Some(start), false, None).await?;
        info!(batch_id = batch.id, start = %start, members = rows.len(), "batch detected");

        for row in &rows {
            let Some(key) = row.get_str(&def.data_source.primary_key) else {
                continue;
            };
            let data = serde_json::Value::Object(row.to_json());
            self.db.insert_member(batch.id, &key, &data).await?;
        }

        let phases: Vec<NewPhaseExecution> = def
            .phases
            .iter()
            .map(|p| NewPhaseExecution {
                batch_id: batch.id,
                phase_name: p.name.clone(),
                offset_minutes: p.offset_minutes as i32,
                due_at: Some(start - Duration::minutes(p.offset_minutes)),
                runbook_version: runbook.version,
            })
            .collect();
        self.db.insert_phase_executions(&phases).await?;

        if def.init.is_empty() {
            self.db
                .try_transition_batch(batch.id, &[BatchStatus::Detected], BatchStatus::Active)
                .await?;
        } else {
            self.db
                .try_transition_batch(
                    batch.id,
                    &[BatchStatus::Detected],
                    BatchStatus::InitDispatched,
                )
                .await?;
            self.publish_batch_init(&batch, runbook).await?;
        }

        Ok(())
    }

    /// Membership diff for an existing batch: add, remove, refresh
    async fn diff_membership(
        &self,
        batch: &BatchRow,
        def: &RunbookDef,
        rows: Vec<convoy_datasource::SourceRow>,
    ) -> Result<()> {
        if batch.status()?.is_terminal() {
            return Ok(());
        }

        let members = self.db.list_members(batch.id).await?;
        let by_key: HashMap<&str, &convoy_storage::BatchMemberRow> = members
            .iter()
            .map(|m| (m.member_key.as_str(), m))
            .collect();

        let mut seen: HashSet<String> = HashSet::with_capacity(rows.len());
        for row in &rows {
            let Some(key) = row.get_str(&def.data_source.primary_key) else {
                continue;
            };
            seen.insert(key.clone());
            let data = serde_json::Value::Object(row.to_json());

            match by_key.get(key.as_str()) {
                None => {
                    let member = self.db.insert_member(batch.id, &key, &data).await?;
                    info!(batch_id = batch.id, member_key = %key, "member added");
                    self.publish_event(
                        &OrchestratorEvent::MemberAdded(MemberEvent {
                            batch_id: batch.id,
                            member_key: key,
                            batch_member_id: member.id,
                        }),
                        None,
                    )
                    .await?;
                }
                Some(existing) => match existing.status()? {
                    // A removed key reappearing converges back to active
                    MemberStatus::Removed => {
                        if self.db.reactivate_member(existing.id, &data).await? {
                            info!(batch_id = batch.id, member_key = %key, "member re-added");
                            self.publish_event(
                                &OrchestratorEvent::MemberAdded(MemberEvent {
                                    batch_id: batch.id,
                                    member_key: key,
                                    batch_member_id: existing.id,
                                }),
                                None,
                            )
                            .await?;
                        }
                    }
                    MemberStatus::Active | MemberStatus::Failed => {
                        self.db.refresh_member_data(existing.id, &data).await?;
                    }
                },
            }
        }

        for member in &members {
            if member.status()? == MemberStatus::Active && !seen.contains(&member.member_key) {
                if self.db.mark_member_removed(member.id).await? {
                    info!(batch_id = batch.id, member_key = %member.member_key, "member removed");
                    self.publish_event(
                        &OrchestratorEvent::MemberRemoved(MemberEvent {
                            batch_id: batch.id,
                            member_key: member.member_key.clone(),
                            batch_member_id: member.id,
                        }),
                        None,
                    )
                    .await?;
                }
            }
        }

        Ok(())
    }

    /// Publish timing events: phase-due for active batches, and a batch-init
    /// nudge for batches stuck in init_dispatched (covers a crash between
    /// transition and publish; duplicate detection absorbs the rest).
    async fn dispatch_due(
        &self,
        runbook: &RunbookRow,
        def: &RunbookDef,
        now: DateTime<Utc>,
    ) -> Result<()> {
        for batch in self.db.list_unfinished_batches(&runbook.name).await? {
            match batch.status()? {
                // A crash between batch creation and its first transition
                // leaves it detected; re-run the creation handshake
                BatchStatus::Detected => {
                    if def.init.is_empty() {
                        self.db
                            .try_transition_batch(
                                batch.id,
                                &[BatchStatus::Detected],
                                BatchStatus::Active,
                            )
                            .await?;
                    } else {
                        self.db
                            .try_transition_batch(
                                batch.id,
                                &[BatchStatus::Detected],
                                BatchStatus::InitDispatched,
                            )
                            .await?;
                        self.publish_batch_init(&batch, runbook).await?;
                    }
                }
                BatchStatus::InitDispatched => {
                    self.publish_batch_init(&batch, runbook).await?;
                }
                BatchStatus::Active => {
                    for phase in self.db.list_due_phases(batch.id, now).await? {
                        debug!(batch_id = batch.id, phase = %phase.phase_name, "phase due");
                        self.publish_event(
                            &OrchestratorEvent::PhaseDue(PhaseDueEvent {
                                batch_id: batch.id,
                                runbook_name: runbook.name.clone(),
                                runbook_version: phase.runbook_version,
                                phase_name: phase.phase_name.clone(),
                                phase_execution_id: phase.id,
                            }),
                            Some(format!("phase-due-{}", phase.id)),
                        )
                        .await?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Carry in-flight batches across a runbook version transition:
    /// materialize the new version's phases, supersede the old ones, and
    /// apply the overdue policy.
    async fn apply_version_transitions(
        &self,
        runbook: &RunbookRow,
        def: &RunbookDef,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let behavior = runbook.overdue_behavior()?;
        let mut skipped_overdue = false;

        for batch in self.db.list_unfinished_batches(&runbook.name).await? {
            let Some(latest) = self.db.latest_phase_version(batch.id).await? else {
                continue;
            };
            if latest >= runbook.version {
                continue;
            }

            info!(
                batch_id = batch.id,
                from_version = latest,
                to_version = runbook.version,
                "runbook version transition"
            );

            let phases: Vec<NewPhaseExecution> = def
                .phases
                .iter()
                .map(|p| NewPhaseExecution {
                    batch_id: batch.id,
                    phase_name: p.name.clone(),
                    offset_minutes: p.offset_minutes as i32,
                    due_at: batch
                        .batch_start_time
                        .map(|start| start - Duration::minutes(p.offset_minutes)),
                    runbook_version: runbook.version,
                })
                .collect();
            self.db.insert_phase_executions(&phases).await?;
            self.db.supersede_phases_before(batch.id, runbook.version).await?;

            if behavior == OverdueBehavior::Ignore && !runbook.ignore_overdue_applied {
                let skipped = self
                    .db
                    .skip_overdue_phases(batch.id, runbook.version, now)
                    .await?;
                if skipped > 0 {
                    debug!(batch_id = batch.id, skipped, "overdue phases skipped");
                }
                skipped_overdue = true;
            }

            if runbook.rerun_init && !def.init.is_empty() {
                let claimed = self
                    .db
                    .try_transition_batch(
                        batch.id,
                        &[BatchStatus::Active],
                        BatchStatus::InitDispatched,
                    )
                    .await?;
                if claimed {
                    self.publish_batch_init(&batch, runbook).await?;
                }
            }
        }

        if skipped_overdue {
            self.db.set_ignore_overdue_applied(runbook.id).await?;
        }

        Ok(())
    }

    /// Cross-runbook sweep: poll-check for every polling execution whose
    /// interval has elapsed. Bus-level delay is not used for polling; this
    /// sweep is the clock.
    async fn poll_sweep(&self, now: DateTime<Utc>) -> Result<()> {
        for step in self.db.due_polling_steps(now).await? {
            self.publish_event(
                &OrchestratorEvent::PollCheck(ExecutionCheckEvent {
                    step_execution_id: step.id,
                    is_init_step: false,
                }),
                Some(format!("poll-check-step-{}-{}", step.id, step.poll_count)),
            )
            .await?;
        }
        for init in self.db.due_polling_inits(now).await? {
            self.publish_event(
                &OrchestratorEvent::PollCheck(ExecutionCheckEvent {
                    step_execution_id: init.id,
                    is_init_step: true,
                }),
                Some(format!("poll-check-init-{}-{}", init.id, init.poll_count)),
            )
            .await?;
        }
        Ok(())
    }

    async fn publish_batch_init(&self, batch: &BatchRow, runbook: &RunbookRow) -> Result<()> {
        self.publish_event(
            &OrchestratorEvent::BatchInit(BatchInitEvent {
                batch_id: batch.id,
                runbook_name: runbook.name.clone(),
                runbook_version: runbook.version,
            }),
            Some(format!("batch-init-{}-v{}", batch.id, runbook.version)),
        )
        .await
    }

    async fn publish_event(
        &self,
        event: &OrchestratorEvent,
        message_id: Option<String>,
    ) -> Result<()> {
        let mut message = BusMessage::new(TOPIC_ORCHESTRATOR_EVENTS, event.body())
            .with_property(PROP_MESSAGE_TYPE, event.message_type());
        if let Some(id) = message_id {
            message = message.with_message_id(id);
        }
        self.bus.publish(message).await?;
        Ok(())
    }
}
