//! End-to-end orchestration scenarios
//!
//! These drive the real scheduler and orchestrator against PostgreSQL with
//! the in-memory bus, simulating the worker by draining `worker-jobs` and
//! feeding back synthesized results. They require a database:
//!
//! ```sh
//! DATABASE_URL=postgres://localhost/convoy_test \
//!     cargo test -p convoy-orchestrator -- --ignored
//! ```
//!
//! Each test publishes a uniquely named runbook, so reruns and parallel
//! tests stay isolated.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use convoy_bus::{InMemoryMessageBus, MessageBus, SubscriptionSpec};
use convoy_core::{
    CorrelationData, DataSourceDef, OrchestratorEvent, ResultStatus, ResultType, WorkerErrorInfo,
    WorkerJob, WorkerResult, PROP_MESSAGE_TYPE, SUB_ORCHESTRATOR, TOPIC_ORCHESTRATOR_EVENTS,
    TOPIC_WORKER_JOBS,
};
use convoy_datasource::{DataSource, DataSourceError, SourceRegistry, SourceRow};
use convoy_orchestrator::Orchestrator;
use convoy_scheduler::{round_to_nearest_5m, Scheduler, SchedulerConfig};
use convoy_storage::{Database, OverdueBehavior, StepExecutionRow};

const LOCK: Duration = Duration::from_secs(30);
const WORKER: &str = "general";

/// Data source returning whatever the test staged
#[derive(Default)]
struct StaticSource {
    rows: Mutex<Vec<SourceRow>>,
}

impl StaticSource {
    fn set(&self, rows: Vec<SourceRow>) {
        *self.rows.lock().unwrap() = rows;
    }
}

#[async_trait]
impl DataSource for StaticSource {
    async fn query(&self, _def: &DataSourceDef) -> Result<Vec<SourceRow>, DataSourceError> {
        Ok(self.rows.lock().unwrap().clone())
    }
}

struct Harness {
    db: Database,
    bus: Arc<InMemoryMessageBus>,
    orchestrator: Arc<Orchestrator>,
    scheduler: Scheduler,
    source: Arc<StaticSource>,
}

async fn harness() -> Harness {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required for scenario tests");
    let db = Database::from_url(&url).await.expect("database connection");
    db.migrate().await.expect("migrations");

    let bus = Arc::new(InMemoryMessageBus::new());
    bus.ensure_subscription(&SubscriptionSpec::new(TOPIC_ORCHESTRATOR_EVENTS, SUB_ORCHESTRATOR))
        .await
        .unwrap();
    bus.ensure_subscription(
        &SubscriptionSpec::new(TOPIC_WORKER_JOBS, WORKER).with_filter("WorkerId", WORKER),
    )
    .await
    .unwrap();

    let source = Arc::new(StaticSource::default());
    let registry = SourceRegistry::with_sources(source.clone(), source.clone());
    let scheduler = Scheduler::new(
        db.clone(),
        bus.clone(),
        registry,
        SchedulerConfig::default(),
    );
    let orchestrator = Arc::new(Orchestrator::new(db.clone(), bus.clone()));

    Harness {
        db,
        bus,
        orchestrator,
        scheduler,
        source,
    }
}

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

/// A deterministic "now" sitting just past a 5-minute boundary, so the
/// rounded batch start time is never in the future.
fn tick_now() -> DateTime<Utc> {
    let floored = (Utc::now().timestamp() / 300) * 300;
    Utc.timestamp_opt(floored + 60, 0).unwrap()
}

fn row(pairs: &[(&str, Value)]) -> SourceRow {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Deliver every visible orchestrator event to the handlers
async fn drain_events(h: &Harness) -> usize {
    let mut handled = 0;
    loop {
        let batch = h
            .bus
            .receive(TOPIC_ORCHESTRATOR_EVENTS, SUB_ORCHESTRATOR, 10, LOCK)
            .await
            .unwrap();
        if batch.is_empty() {
            return handled;
        }
        for message in batch {
            let message_type = message.property(PROP_MESSAGE_TYPE).unwrap_or_default();
            let event = OrchestratorEvent::decode(message_type, &message.body).unwrap();
            h.orchestrator.handle_event(&event).await.unwrap();
            h.bus.complete(message.delivery_id).await.unwrap();
            handled += 1;
        }
    }
}

/// Drain all pending jobs for the test worker
async fn take_jobs(h: &Harness) -> Vec<WorkerJob> {
    let mut jobs = Vec::new();
    loop {
        let batch = h.bus.receive(TOPIC_WORKER_JOBS, WORKER, 10, LOCK).await.unwrap();
        if batch.is_empty() {
            return jobs;
        }
        for message in batch {
            jobs.push(serde_json::from_value(message.body.clone()).unwrap());
            h.bus.complete(message.delivery_id).await.unwrap();
        }
    }
}

fn success(job: &WorkerJob, result: Value) -> WorkerResult {
    WorkerResult {
        job_id: job.job_id.clone(),
        status: ResultStatus::Success,
        result_type: Some(ResultType::Object),
        result: Some(result),
        error: None,
        duration_ms: Some(5),
        timestamp: Some(Utc::now()),
        correlation_data: job.correlation_data.clone(),
    }
}

fn failure(job: &WorkerJob, message: &str) -> WorkerResult {
    WorkerResult {
        job_id: job.job_id.clone(),
        status: ResultStatus::Failure,
        result_type: None,
        result: None,
        error: Some(WorkerErrorInfo {
            message: message.to_string(),
            error_type: Some("Test".into()),
            is_throttled: false,
            attempts: Some(1),
        }),
        duration_ms: Some(5),
        timestamp: Some(Utc::now()),
        correlation_data: job.correlation_data.clone(),
    }
}

async fn member_key_of(h: &Harness, step: &CorrelationData) -> String {
    let step_row = h.db.get_step(step.step_execution_id).await.unwrap().unwrap();
    let member = h
        .db
        .get_member(step_row.batch_member_id)
        .await
        .unwrap()
        .unwrap();
    member.member_key
}

async fn step_of(h: &Harness, job: &WorkerJob) -> StepExecutionRow {
    h.db
        .get_step(job.correlation_data.step_execution_id)
        .await
        .unwrap()
        .unwrap()
}

// ---------------------------------------------------------------------------
// Scenario 1: immediate-mode new batch
// ---------------------------------------------------------------------------

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn immediate_mode_detects_batch_and_runs_it() {
    let h = harness().await;
    let name = unique("imm");
    let yaml = format!(
        r#"
name: {name}
data_source:
  type: dataverse
  connection: CONN
  query: contacts
  primary_key: email
  batch_time: immediate
phases:
  - name: p
    offset: T-0
    steps:
      - name: s
        worker_id: general
        function: Echo
        params:
          msg: "{{{{email}}}}"
"#
    );
    h.db
        .publish_runbook(&name, &yaml, OverdueBehavior::Rerun, false)
        .await
        .unwrap();

    h.source.set(vec![row(&[("email", json!("a@x"))])]);
    let now = tick_now();
    h.scheduler.tick(now).await.unwrap();

    let start = round_to_nearest_5m(now);
    let batch = h.db.find_batch(&name, start).await.unwrap().expect("batch detected");
    assert_eq!(batch.status, "active");
    assert_eq!(batch.batch_start_time, Some(start));

    let members = h.db.list_members(batch.id).await.unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].member_key, "a@x");

    let phases = h.db.list_phases(batch.id).await.unwrap();
    assert_eq!(phases.len(), 1);
    assert_eq!(phases[0].due_at, Some(start));

    drain_events(&h).await;

    let steps = h.db.list_phase_steps(phases[0].id).await.unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].status, "dispatched");
    assert_eq!(steps[0].params_json, json!({"msg": "a@x"}));
    assert_eq!(
        steps[0].job_id.as_deref(),
        Some(format!("step-{}-attempt-1", steps[0].id).as_str())
    );

    // Replayed phase-due deliveries change nothing
    let replay = OrchestratorEvent::decode(
        "phase-due",
        &json!({
            "BatchId": batch.id,
            "RunbookName": name,
            "RunbookVersion": 1,
            "PhaseName": "p",
            "PhaseExecutionId": phases[0].id
        }),
    )
    .unwrap();
    h.orchestrator.handle_event(&replay).await.unwrap();
    h.orchestrator.handle_event(&replay).await.unwrap();
    assert_eq!(h.db.list_phase_steps(phases[0].id).await.unwrap().len(), 1);

    // Worker succeeds: step, phase and batch complete
    let jobs = take_jobs(&h).await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].function_name, "Echo");
    let result = success(&jobs[0], json!({"ok": true}));
    h.orchestrator.process_worker_result(&result).await.unwrap();
    // Duplicate result delivery is a no-op
    h.orchestrator.process_worker_result(&result).await.unwrap();

    let step = h.db.get_step(steps[0].id).await.unwrap().unwrap();
    assert_eq!(step.status, "succeeded");
    let phase = h.db.get_phase(phases[0].id).await.unwrap().unwrap();
    assert_eq!(phase.status, "completed");
    let batch = h.db.get_batch(batch.id).await.unwrap().unwrap();
    assert_eq!(batch.status, "completed");
}

// ---------------------------------------------------------------------------
// Scenario 2: late join triggers catch-up
// ---------------------------------------------------------------------------

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn late_join_catches_up_on_dispatched_and_finished_phases() {
    let h = harness().await;
    let name = unique("late");
    let yaml = format!(
        r#"
name: {name}
data_source:
  type: dataverse
  connection: CONN
  query: waves
  primary_key: email
  batch_time_column: wave
phases:
  - name: p1
    offset: T-2h
    steps:
      - name: s1
        worker_id: general
        function: Prepare
  - name: p2
    offset: T-1h
    steps:
      - name: s2
        worker_id: general
        function: Move
  - name: p3
    offset: T-0
    steps:
      - name: s3
        worker_id: general
        function: Verify
"#
    );
    h.db
        .publish_runbook(&name, &yaml, OverdueBehavior::Rerun, false)
        .await
        .unwrap();

    let now = tick_now();
    let start = now + chrono::Duration::minutes(30);
    let wave = start.to_rfc3339();
    h.source
        .set(vec![row(&[("email", json!("a@x")), ("wave", json!(wave.clone()))])]);

    h.scheduler.tick(now).await.unwrap();
    drain_events(&h).await;

    let batch = h.db.find_batch(&name, start).await.unwrap().unwrap();

    // Complete p1 for the original member; leave p2 in flight
    let jobs = take_jobs(&h).await;
    for job in &jobs {
        if job.function_name == "Prepare" {
            h.orchestrator
                .process_worker_result(&success(job, json!({"ok": true})))
                .await
                .unwrap();
        }
    }

    let phases = h.db.list_phases(batch.id).await.unwrap();
    let p1 = phases.iter().find(|p| p.phase_name == "p1").unwrap();
    let p2 = phases.iter().find(|p| p.phase_name == "p2").unwrap();
    let p3 = phases.iter().find(|p| p.phase_name == "p3").unwrap();
    assert_eq!(p1.status, "completed");
    assert_eq!(p2.status, "dispatched");
    assert_eq!(p3.status, "pending");

    // Second tick sees a new member in the same wave
    h.source.set(vec![
        row(&[("email", json!("a@x")), ("wave", json!(wave.clone()))]),
        row(&[("email", json!("n@x")), ("wave", json!(wave))]),
    ]);
    h.scheduler.tick(now).await.unwrap();
    drain_events(&h).await;

    let members = h.db.list_members(batch.id).await.unwrap();
    let joined = members.iter().find(|m| m.member_key == "n@x").expect("late member");

    // Catch-up materialized and dispatched steps in p1 and p2, but not p3
    let p1_steps = h.db.list_phase_steps(p1.id).await.unwrap();
    let joined_p1: Vec<_> = p1_steps.iter().filter(|s| s.batch_member_id == joined.id).collect();
    assert_eq!(joined_p1.len(), 1);
    assert_eq!(joined_p1[0].status, "dispatched");

    let p2_steps = h.db.list_phase_steps(p2.id).await.unwrap();
    let joined_p2: Vec<_> = p2_steps.iter().filter(|s| s.batch_member_id == joined.id).collect();
    assert_eq!(joined_p2.len(), 1);
    assert_eq!(joined_p2[0].status, "dispatched");

    let p3_steps = h.db.list_phase_steps(p3.id).await.unwrap();
    assert!(p3_steps.iter().all(|s| s.batch_member_id != joined.id));
}

// ---------------------------------------------------------------------------
// Scenario 3: retry succeeds on the third attempt
// ---------------------------------------------------------------------------

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn retry_exhausts_two_failures_then_succeeds() {
    let h = harness().await;
    let name = unique("retry");
    let yaml = format!(
        r#"
name: {name}
data_source:
  type: dataverse
  connection: CONN
  query: contacts
  primary_key: email
  batch_time: immediate
retry:
  max_retries: 2
  interval: 1m
phases:
  - name: p
    offset: T-0
    steps:
      - name: s
        worker_id: general
        function: Flaky
"#
    );
    h.db
        .publish_runbook(&name, &yaml, OverdueBehavior::Rerun, false)
        .await
        .unwrap();
    h.source.set(vec![row(&[("email", json!("a@x"))])]);

    h.scheduler.tick(tick_now()).await.unwrap();
    drain_events(&h).await;

    let mut seen_job_ids = Vec::new();

    // Attempt 1 fails
    let jobs = take_jobs(&h).await;
    assert_eq!(jobs.len(), 1);
    seen_job_ids.push(jobs[0].job_id.clone());
    h.orchestrator
        .process_worker_result(&failure(&jobs[0], "boom"))
        .await
        .unwrap();

    let step = step_of(&h, &jobs[0]).await;
    assert_eq!(step.status, "pending");
    assert_eq!(step.retry_count, 1);
    assert!(step.retry_after.is_some());

    // The retry interval elapses and the delayed retry-check arrives
    let elapse = |id: i64| {
        let pool = h.db.pool();
        async move {
            sqlx::query("UPDATE step_executions SET retry_after = NOW() - INTERVAL '1 second' WHERE id = $1")
                .bind(id)
                .execute(pool)
                .await
                .unwrap();
        }
    };
    elapse(step.id).await;
    let retry_event = OrchestratorEvent::decode(
        "retry-check",
        &json!({"StepExecutionId": step.id, "IsInitStep": false}),
    )
    .unwrap();
    h.orchestrator.handle_event(&retry_event).await.unwrap();

    // Attempt 2 fails
    let jobs = take_jobs(&h).await;
    assert_eq!(jobs.len(), 1);
    seen_job_ids.push(jobs[0].job_id.clone());
    h.orchestrator
        .process_worker_result(&failure(&jobs[0], "boom again"))
        .await
        .unwrap();

    let step = step_of(&h, &jobs[0]).await;
    assert_eq!(step.status, "pending");
    assert_eq!(step.retry_count, 2);

    // Attempt 3 succeeds
    elapse(step.id).await;
    h.orchestrator.handle_event(&retry_event).await.unwrap();
    let jobs = take_jobs(&h).await;
    assert_eq!(jobs.len(), 1);
    seen_job_ids.push(jobs[0].job_id.clone());
    h.orchestrator
        .process_worker_result(&success(&jobs[0], json!({"ok": true})))
        .await
        .unwrap();

    let step = step_of(&h, &jobs[0]).await;
    assert_eq!(step.status, "succeeded");
    assert_eq!(step.retry_count, 2);
    assert_eq!(
        seen_job_ids,
        vec![
            format!("step-{}-attempt-1", step.id),
            format!("step-{}-retry-1", step.id),
            format!("step-{}-retry-2", step.id),
        ]
    );

    // A stale retry-check after success is ignored
    h.orchestrator.handle_event(&retry_event).await.unwrap();
    assert!(take_jobs(&h).await.is_empty());
}

// ---------------------------------------------------------------------------
// Scenario 4: poll timeout triggers rollback and member failure
// ---------------------------------------------------------------------------

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn poll_timeout_rolls_back_and_isolates_member() {
    let h = harness().await;
    let name = unique("poll");
    let yaml = format!(
        r#"
name: {name}
data_source:
  type: dataverse
  connection: CONN
  query: contacts
  primary_key: email
  batch_time: immediate
phases:
  - name: p
    offset: T-0
    steps:
      - name: sync
        worker_id: general
        function: StartSync
        poll:
          interval: 15m
          timeout: 1h
        on_failure: undo
      - name: finish
        worker_id: general
        function: Finish
rollbacks:
  undo:
    - name: stop
      worker_id: general
      function: StopSync
"#
    );
    h.db
        .publish_runbook(&name, &yaml, OverdueBehavior::Rerun, false)
        .await
        .unwrap();
    h.source.set(vec![row(&[("email", json!("a@x"))])]);

    h.scheduler.tick(tick_now()).await.unwrap();
    drain_events(&h).await;

    let jobs = take_jobs(&h).await;
    assert_eq!(jobs.len(), 1);
    h.orchestrator
        .process_worker_result(&success(&jobs[0], json!({"complete": false})))
        .await
        .unwrap();

    let step = step_of(&h, &jobs[0]).await;
    assert_eq!(step.status, "polling");
    assert!(step.poll_started_at.is_some());

    // The poll has been running for two hours against a one-hour timeout
    sqlx::query(
        "UPDATE step_executions
         SET poll_started_at = NOW() - INTERVAL '2 hours',
             last_polled_at = NOW() - INTERVAL '20 minutes'
         WHERE id = $1",
    )
    .bind(step.id)
    .execute(h.db.pool())
    .await
    .unwrap();

    let poll_event = OrchestratorEvent::decode(
        "poll-check",
        &json!({"StepExecutionId": step.id, "IsInitStep": false}),
    )
    .unwrap();
    h.orchestrator.handle_event(&poll_event).await.unwrap();

    let step = h.db.get_step(step.id).await.unwrap().unwrap();
    assert_eq!(step.status, "poll_timeout");

    let member = h.db.get_member(step.batch_member_id).await.unwrap().unwrap();
    assert_eq!(member.status, "failed");

    // The member's other step was cancelled
    let steps = h.db.list_phase_steps(step.phase_execution_id).await.unwrap();
    let finish = steps.iter().find(|s| s.step_name == "finish").unwrap();
    assert_eq!(finish.status, "cancelled");

    // The rollback sequence went out fire-and-forget
    let rollback_jobs = take_jobs(&h).await;
    assert_eq!(rollback_jobs.len(), 1);
    assert_eq!(rollback_jobs[0].function_name, "StopSync");
    assert_eq!(rollback_jobs[0].job_id, format!("rollback-step-{}-0", step.id));

    // No member fully succeeded: phase and batch fail
    let phase = h.db.get_phase(step.phase_execution_id).await.unwrap().unwrap();
    assert_eq!(phase.status, "failed");
    let batch = h.db.get_batch(phase.batch_id).await.unwrap().unwrap();
    assert_eq!(batch.status, "failed");
}

// ---------------------------------------------------------------------------
// Scenario 5: member failure isolates, others advance
// ---------------------------------------------------------------------------

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn member_failure_isolates_while_others_complete() {
    let h = harness().await;
    let name = unique("isolate");
    let yaml = format!(
        r#"
name: {name}
data_source:
  type: dataverse
  connection: CONN
  query: contacts
  primary_key: email
  batch_time: immediate
phases:
  - name: p
    offset: T-0
    steps:
      - name: s0
        worker_id: general
        function: First
      - name: s1
        worker_id: general
        function: Second
"#
    );
    h.db
        .publish_runbook(&name, &yaml, OverdueBehavior::Rerun, false)
        .await
        .unwrap();
    h.source.set(vec![
        row(&[("email", json!("a@x"))]),
        row(&[("email", json!("b@x"))]),
        row(&[("email", json!("c@x"))]),
    ]);

    h.scheduler.tick(tick_now()).await.unwrap();
    drain_events(&h).await;

    // Step 0 for all three members; a fails (no retries configured)
    let jobs = take_jobs(&h).await;
    assert_eq!(jobs.len(), 3);
    for job in &jobs {
        let key = member_key_of(&h, &job.correlation_data).await;
        if key == "a@x" {
            h.orchestrator
                .process_worker_result(&failure(job, "broken"))
                .await
                .unwrap();
        } else {
            h.orchestrator
                .process_worker_result(&success(job, json!({"ok": true})))
                .await
                .unwrap();
        }
    }

    // b and c advanced to step 1; a is failed with step 1 cancelled
    let jobs = take_jobs(&h).await;
    assert_eq!(jobs.len(), 2);
    for job in &jobs {
        let key = member_key_of(&h, &job.correlation_data).await;
        assert_ne!(key, "a@x");
        assert_eq!(job.function_name, "Second");
        h.orchestrator
            .process_worker_result(&success(job, json!({"ok": true})))
            .await
            .unwrap();
    }

    let phase_id = step_of(&h, &jobs[0]).await.phase_execution_id;
    let steps = h.db.list_phase_steps(phase_id).await.unwrap();
    let phase = h.db.get_phase(phase_id).await.unwrap().unwrap();
    let batch = h.db.get_batch(phase.batch_id).await.unwrap().unwrap();

    let members = h.db.list_members(batch.id).await.unwrap();
    let a = members.iter().find(|m| m.member_key == "a@x").unwrap();
    assert_eq!(a.status, "failed");

    let a_steps: Vec<_> = steps.iter().filter(|s| s.batch_member_id == a.id).collect();
    assert_eq!(a_steps.len(), 2);
    assert!(a_steps.iter().any(|s| s.status == "failed"));
    assert!(a_steps.iter().any(|s| s.status == "cancelled"));

    // At least one member ran everything: phase completed, batch completed
    assert_eq!(phase.status, "completed");
    assert_eq!(batch.status, "completed");
}

// ---------------------------------------------------------------------------
// Scenario 6: version transition with overdue=ignore
// ---------------------------------------------------------------------------

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn version_transition_skips_overdue_phases_once() {
    let h = harness().await;
    let name = unique("version");
    let yaml_v1 = format!(
        r#"
name: {name}
data_source:
  type: dataverse
  connection: CONN
  query: waves
  primary_key: email
  batch_time_column: wave
phases:
  - name: early
    offset: T-5d
    steps:
      - name: s
        worker_id: general
        function: Early
  - name: near
    offset: T-1d
    steps:
      - name: s
        worker_id: general
        function: Near
"#
    );
    h.db
        .publish_runbook(&name, &yaml_v1, OverdueBehavior::Ignore, false)
        .await
        .unwrap();

    let now = tick_now();
    // Start in two days: "early" (T-5d) is three days overdue, "near"
    // (T-1d) fires tomorrow
    let start = now + chrono::Duration::days(2);
    h.source.set(vec![row(&[
        ("email", json!("a@x")),
        ("wave", json!(start.to_rfc3339())),
    ])]);
    h.scheduler.tick(now).await.unwrap();

    let batch = h.db.find_batch(&name, start).await.unwrap().unwrap();

    // Admin publishes v2 with the same phases
    h.db
        .publish_runbook(&name, &yaml_v1, OverdueBehavior::Ignore, false)
        .await
        .unwrap();
    h.scheduler.tick(now).await.unwrap();

    let phases = h.db.list_phases(batch.id).await.unwrap();
    let v1: Vec<_> = phases.iter().filter(|p| p.runbook_version == 1).collect();
    let v2: Vec<_> = phases.iter().filter(|p| p.runbook_version == 2).collect();
    assert_eq!(v1.len(), 2);
    assert_eq!(v2.len(), 2);

    // Old-version phases lost to the new materialization
    assert!(v1.iter().all(|p| p.status == "superseded"));

    let early = v2.iter().find(|p| p.phase_name == "early").unwrap();
    let near = v2.iter().find(|p| p.phase_name == "near").unwrap();
    assert_eq!(early.status, "skipped");
    assert_eq!(near.status, "pending");

    let runbook = h.db.get_runbook(&name, 2).await.unwrap().unwrap();
    assert!(runbook.ignore_overdue_applied);
}

// ---------------------------------------------------------------------------
// Convergence: removed then re-added member
// ---------------------------------------------------------------------------

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn removed_member_readded_converges_to_active() {
    let h = harness().await;
    let name = unique("readd");
    let yaml = format!(
        r#"
name: {name}
data_source:
  type: dataverse
  connection: CONN
  query: waves
  primary_key: email
  batch_time_column: wave
phases:
  - name: p
    offset: T-0
    steps:
      - name: s
        worker_id: general
        function: Echo
"#
    );
    h.db
        .publish_runbook(&name, &yaml, OverdueBehavior::Rerun, false)
        .await
        .unwrap();

    let now = tick_now();
    let start = now + chrono::Duration::days(1);
    let wave = start.to_rfc3339();
    let a = || row(&[("email", json!("a@x")), ("wave", json!(wave.clone()))]);
    let b = |region: &str| {
        row(&[
            ("email", json!("b@x")),
            ("region", json!(region)),
            ("wave", json!(wave.clone())),
        ])
    };

    h.source.set(vec![a(), b("emea")]);
    h.scheduler.tick(now).await.unwrap();
    drain_events(&h).await;

    let batch = h.db.find_batch(&name, start).await.unwrap().unwrap();

    // b disappears from the query
    h.source.set(vec![a()]);
    h.scheduler.tick(now).await.unwrap();
    drain_events(&h).await;

    let members = h.db.list_members(batch.id).await.unwrap();
    let member_b = members.iter().find(|m| m.member_key == "b@x").unwrap();
    assert_eq!(member_b.status, "removed");
    assert!(member_b.removed_at.is_some());

    // b returns with refreshed data
    h.source.set(vec![a(), b("amer")]);
    h.scheduler.tick(now).await.unwrap();
    drain_events(&h).await;

    let members = h.db.list_members(batch.id).await.unwrap();
    assert_eq!(members.len(), 2);
    let member_b = members.iter().find(|m| m.member_key == "b@x").unwrap();
    assert_eq!(member_b.status, "active");
    assert!(member_b.removed_at.is_none());
    assert_eq!(member_b.data_json["region"], json!("amer"));
}

// ---------------------------------------------------------------------------
// Worker outputs feed later phases
// ---------------------------------------------------------------------------

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn output_params_resolve_in_later_phases() {
    let h = harness().await;
    let name = unique("outputs");
    let yaml = format!(
        r#"
name: {name}
data_source:
  type: dataverse
  connection: CONN
  query: waves
  primary_key: email
  batch_time_column: wave
phases:
  - name: provision
    offset: T-1h
    steps:
      - name: create
        worker_id: general
        function: CreateMailbox
        output_params:
          MailboxId: mailbox_id
  - name: migrate
    offset: T-0
    steps:
      - name: move
        worker_id: general
        function: Move
        params:
          target: "{{{{MailboxId}}}}"
"#
    );
    h.db
        .publish_runbook(&name, &yaml, OverdueBehavior::Rerun, false)
        .await
        .unwrap();

    let now = tick_now();
    // provision is due now; migrate only in an hour
    let start = now + chrono::Duration::hours(1);
    h.source.set(vec![row(&[
        ("email", json!("a@x")),
        ("wave", json!(start.to_rfc3339())),
    ])]);
    h.scheduler.tick(now).await.unwrap();
    drain_events(&h).await;

    let jobs = take_jobs(&h).await;
    assert_eq!(jobs.len(), 1);
    // Field name on the wire differs in case from the declaration
    h.orchestrator
        .process_worker_result(&success(&jobs[0], json!({"Mailbox_ID": "mb-7"})))
        .await
        .unwrap();

    let batch = h.db.find_batch(&name, start).await.unwrap().unwrap();
    let member = &h.db.list_members(batch.id).await.unwrap()[0];
    assert_eq!(member.worker_data_json["MailboxId"], json!("mb-7"));

    // An hour later the migrate phase resolves the captured output
    let later = now + chrono::Duration::minutes(61);
    h.scheduler.tick(later).await.unwrap();
    drain_events(&h).await;

    let jobs = take_jobs(&h).await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].function_name, "Move");
    assert_eq!(jobs[0].parameters["target"], json!("mb-7"));
}
