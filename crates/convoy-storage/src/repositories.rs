// Repository layer for the convoy state store.
//
// All state transitions are guarded conditional UPDATEs: the WHERE clause
// names the statuses the transition may claim, and the boolean return says
// whether this caller won the transition. Losing a guard is not an error;
// handlers treat it as "someone else already did this".

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};

use convoy_core::{parse_runbook, RunbookDef};

use crate::models::*;

/// Columns selected for every step_executions read
const STEP_COLUMNS: &str = "id, phase_execution_id, batch_member_id, step_name, step_index, \
     worker_id, function_name, params_json, status, job_id, result_json, error_message, \
     is_poll_step, poll_interval_secs, poll_timeout_secs, poll_started_at, last_polled_at, \
     poll_count, on_failure, retry_count, max_retries, retry_interval_secs, retry_after, \
     completed_at, created_at, updated_at";

/// Columns selected for every init_executions read
const INIT_COLUMNS: &str = "id, batch_id, runbook_version, step_name, step_index, \
     worker_id, function_name, params_json, status, job_id, result_json, error_message, \
     is_poll_step, poll_interval_secs, poll_timeout_secs, poll_started_at, last_polled_at, \
     poll_count, on_failure, retry_count, max_retries, retry_interval_secs, retry_after, \
     completed_at, created_at, updated_at";

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create database connection from URL
    pub async fn from_url(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending schema migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    // ============================================
    // Runbooks
    // ============================================

    /// Publish a new runbook version: validates the YAML, deactivates the
    /// previous active version for the name, and inserts the next version,
    /// all in one transaction. Returns the new row and parsed definition.
    #[instrument(skip(self, yaml))]
    pub async fn publish_runbook(
        &self,
        name: &str,
        yaml: &str,
        overdue_behavior: OverdueBehavior,
        rerun_init: bool,
    ) -> Result<(RunbookRow, RunbookDef)> {
        let def = parse_runbook(yaml)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE runbooks SET is_active = FALSE, updated_at = NOW() WHERE name = $1 AND is_active",
        )
        .bind(name)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query_as::<_, RunbookRow>(
            r#"
            INSERT INTO runbooks (name, version, yaml, is_active, overdue_behavior, rerun_init)
            VALUES ($1, COALESCE((SELECT MAX(version) + 1 FROM runbooks WHERE name = $1), 1),
                    $2, TRUE, $3, $4)
            RETURNING id, name, version, yaml, is_active, overdue_behavior,
                      ignore_overdue_applied, rerun_init, last_error, last_error_at,
                      created_at, updated_at
            "#,
        )
        .bind(name)
        .bind(yaml)
        .bind(overdue_behavior.as_str())
        .bind(rerun_init)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(name, version = row.version, "published runbook");
        Ok((row, def))
    }

    pub async fn get_active_runbook(&self, name: &str) -> Result<Option<RunbookRow>> {
        let row = sqlx::query_as::<_, RunbookRow>(
            r#"
            SELECT id, name, version, yaml, is_active, overdue_behavior,
                   ignore_overdue_applied, rerun_init, last_error, last_error_at,
                   created_at, updated_at
            FROM runbooks
            WHERE name = $1 AND is_active
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn get_runbook(&self, name: &str, version: i32) -> Result<Option<RunbookRow>> {
        let row = sqlx::query_as::<_, RunbookRow>(
            r#"
            SELECT id, name, version, yaml, is_active, overdue_behavior,
                   ignore_overdue_applied, rerun_init, last_error, last_error_at,
                   created_at, updated_at
            FROM runbooks
            WHERE name = $1 AND version = $2
            "#,
        )
        .bind(name)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn get_runbook_by_id(&self, id: i64) -> Result<Option<RunbookRow>> {
        let row = sqlx::query_as::<_, RunbookRow>(
            r#"
            SELECT id, name, version, yaml, is_active, overdue_behavior,
                   ignore_overdue_applied, rerun_init, last_error, last_error_at,
                   created_at, updated_at
            FROM runbooks
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn list_active_runbooks(&self) -> Result<Vec<RunbookRow>> {
        let rows = sqlx::query_as::<_, RunbookRow>(
            r#"
            SELECT id, name, version, yaml, is_active, overdue_behavior,
                   ignore_overdue_applied, rerun_init, last_error, last_error_at,
                   created_at, updated_at
            FROM runbooks
            WHERE is_active
            ORDER BY name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Deactivate a version. Fails the guard if it was already inactive.
    pub async fn deactivate_runbook(&self, name: &str, version: i32) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE runbooks
            SET is_active = FALSE, updated_at = NOW()
            WHERE name = $1 AND version = $2 AND is_active
            "#,
        )
        .bind(name)
        .bind(version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Record a data-source or parse error on the runbook for operators
    pub async fn record_runbook_error(&self, id: i64, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE runbooks
            SET last_error = $2, last_error_at = NOW(), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// One-shot flag for the `ignore` overdue behavior; the guard makes the
    /// skip idempotent across ticks.
    pub async fn set_ignore_overdue_applied(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE runbooks
            SET ignore_overdue_applied = TRUE, updated_at = NOW()
            WHERE id = $1 AND NOT ignore_overdue_applied
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    // ============================================
    // Automation settings
    // ============================================

    /// Whether batch detection is enabled for this runbook name.
    /// No settings row means enabled.
    pub async fn automation_enabled(&self, runbook_name: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT enabled FROM runbook_automation_settings WHERE runbook_name = $1",
        )
        .bind(runbook_name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get("enabled")).unwrap_or(true))
    }

    pub async fn set_automation(
        &self,
        runbook_name: &str,
        enabled: bool,
        updated_by: Option<&str>,
    ) -> Result<AutomationSettingsRow> {
        let row = sqlx::query_as::<_, AutomationSettingsRow>(
            r#"
            INSERT INTO runbook_automation_settings (runbook_name, enabled, updated_by)
            VALUES ($1, $2, $3)
            ON CONFLICT (runbook_name) DO UPDATE SET
                enabled = EXCLUDED.enabled,
                updated_by = EXCLUDED.updated_by,
                updated_at = NOW()
            RETURNING runbook_name, enabled, updated_by, created_at, updated_at
            "#,
        )
        .bind(runbook_name)
        .bind(enabled)
        .bind(updated_by)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    // ============================================
    // Batches
    // ============================================

    pub async fn create_batch(
        &self,
        runbook_id: i64,
        batch_start_time: Option<DateTime<Utc>>,
        is_manual: bool,
        created_by: Option<&str>,
    ) -> Result<BatchRow> {
        let row = sqlx::query_as::<_, BatchRow>(
            r#"
            INSERT INTO batches (runbook_id, batch_start_time, is_manual, status, created_by)
            VALUES ($1, $2, $3, 'detected', $4)
            RETURNING id, runbook_id, batch_start_time, is_manual, status, current_phase,
                      created_by, created_at, updated_at
            "#,
        )
        .bind(runbook_id)
        .bind(batch_start_time)
        .bind(is_manual)
        .bind(created_by)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn get_batch(&self, id: i64) -> Result<Option<BatchRow>> {
        let row = sqlx::query_as::<_, BatchRow>(
            r#"
            SELECT id, runbook_id, batch_start_time, is_manual, status, current_phase,
                   created_by, created_at, updated_at
            FROM batches
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Find the batch for a runbook name and start time, across versions:
    /// a batch created under v1 still matches after v2 is published.
    pub async fn find_batch(
        &self,
        runbook_name: &str,
        batch_start_time: DateTime<Utc>,
    ) -> Result<Option<BatchRow>> {
        let row = sqlx::query_as::<_, BatchRow>(
            r#"
            SELECT b.id, b.runbook_id, b.batch_start_time, b.is_manual, b.status,
                   b.current_phase, b.created_by, b.created_at, b.updated_at
            FROM batches b
            JOIN runbooks r ON b.runbook_id = r.id
            WHERE r.name = $1 AND b.batch_start_time = $2
            "#,
        )
        .bind(runbook_name)
        .bind(batch_start_time)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Batches of this runbook name (any version) not yet completed/failed
    pub async fn list_unfinished_batches(&self, runbook_name: &str) -> Result<Vec<BatchRow>> {
        let rows = sqlx::query_as::<_, BatchRow>(
            r#"
            SELECT b.id, b.runbook_id, b.batch_start_time, b.is_manual, b.status,
                   b.current_phase, b.created_by, b.created_at, b.updated_at
            FROM batches b
            JOIN runbooks r ON b.runbook_id = r.id
            WHERE r.name = $1 AND b.status NOT IN ('completed', 'failed')
            ORDER BY b.id
            "#,
        )
        .bind(runbook_name)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Member keys already active in an unfinished batch of this runbook
    /// name; immediate-mode detection filters these out of new groups.
    pub async fn active_member_keys(&self, runbook_name: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT m.member_key
            FROM batch_members m
            JOIN batches b ON m.batch_id = b.id
            JOIN runbooks r ON b.runbook_id = r.id
            WHERE r.name = $1
              AND m.status = 'active'
              AND b.status NOT IN ('completed', 'failed')
            "#,
        )
        .bind(runbook_name)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.get("member_key")).collect())
    }

    #[instrument(skip(self))]
    pub async fn try_transition_batch(
        &self,
        id: i64,
        from: &[BatchStatus],
        to: BatchStatus,
    ) -> Result<bool> {
        let from: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();
        let result = sqlx::query(
            r#"
            UPDATE batches
            SET status = $2, updated_at = NOW()
            WHERE id = $1 AND status = ANY($3)
            "#,
        )
        .bind(id)
        .bind(to.as_str())
        .bind(&from)
        .execute(&self.pool)
        .await?;

        let won = result.rows_affected() > 0;
        if !won {
            debug!(batch_id = id, to = to.as_str(), "batch transition lost");
        }
        Ok(won)
    }

    pub async fn set_batch_current_phase(&self, id: i64, phase: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE batches SET current_phase = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(phase)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ============================================
    // Batch members
    // ============================================

    pub async fn insert_member(
        &self,
        batch_id: i64,
        member_key: &str,
        data_json: &serde_json::Value,
    ) -> Result<BatchMemberRow> {
        let row = sqlx::query_as::<_, BatchMemberRow>(
            r#"
            INSERT INTO batch_members (batch_id, member_key, data_json, status)
            VALUES ($1, $2, $3, 'active')
            RETURNING id, batch_id, member_key, data_json, worker_data_json, status,
                      removed_at, created_at, updated_at
            "#,
        )
        .bind(batch_id)
        .bind(member_key)
        .bind(data_json)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn get_member(&self, id: i64) -> Result<Option<BatchMemberRow>> {
        let row = sqlx::query_as::<_, BatchMemberRow>(
            r#"
            SELECT id, batch_id, member_key, data_json, worker_data_json, status,
                   removed_at, created_at, updated_at
            FROM batch_members
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn list_members(&self, batch_id: i64) -> Result<Vec<BatchMemberRow>> {
        let rows = sqlx::query_as::<_, BatchMemberRow>(
            r#"
            SELECT id, batch_id, member_key, data_json, worker_data_json, status,
                   removed_at, created_at, updated_at
            FROM batch_members
            WHERE batch_id = $1
            ORDER BY id
            "#,
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn list_active_members(&self, batch_id: i64) -> Result<Vec<BatchMemberRow>> {
        let rows = sqlx::query_as::<_, BatchMemberRow>(
            r#"
            SELECT id, batch_id, member_key, data_json, worker_data_json, status,
                   removed_at, created_at, updated_at
            FROM batch_members
            WHERE batch_id = $1 AND status = 'active'
            ORDER BY id
            "#,
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Refresh the data snapshot for a member still present in the query
    pub async fn refresh_member_data(
        &self,
        id: i64,
        data_json: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE batch_members SET data_json = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(data_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// A removed key reappeared in the query: converge back to active
    pub async fn reactivate_member(
        &self,
        id: i64,
        data_json: &serde_json::Value,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE batch_members
            SET status = 'active', data_json = $2, removed_at = NULL, updated_at = NOW()
            WHERE id = $1 AND status = 'removed'
            "#,
        )
        .bind(id)
        .bind(data_json)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    pub async fn mark_member_removed(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE batch_members
            SET status = 'removed', removed_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = 'active'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Member-failure isolation, step one: claim the active -> failed
    /// transition. Exactly one concurrent caller wins.
    #[instrument(skip(self))]
    pub async fn fail_member(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE batch_members
            SET status = 'failed', updated_at = NOW()
            WHERE id = $1 AND status = 'active'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Merge named worker outputs into the member's accumulated data.
    /// The row lock serializes concurrent merges from parallel successes.
    #[instrument(skip(self, updates))]
    pub async fn merge_member_worker_data(
        &self,
        id: i64,
        updates: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT worker_data_json FROM batch_members WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            return Ok(());
        };

        let mut data: serde_json::Value = row.get("worker_data_json");
        let merged = data.as_object_mut().map(|obj| {
            for (k, v) in updates {
                obj.insert(k.clone(), v.clone());
            }
        });
        if merged.is_none() {
            data = serde_json::Value::Object(updates.clone());
        }

        sqlx::query(
            "UPDATE batch_members SET worker_data_json = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(&data)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    // ============================================
    // Phase executions
    // ============================================

    /// Materialize phase executions. Idempotent: redeliveries and repeated
    /// ticks hit the (batch_id, runbook_version, phase_name) uniqueness.
    pub async fn insert_phase_executions(&self, phases: &[NewPhaseExecution]) -> Result<u64> {
        let mut inserted = 0;
        for phase in phases {
            let result = sqlx::query(
                r#"
                INSERT INTO phase_executions
                    (batch_id, phase_name, offset_minutes, due_at, runbook_version, status)
                VALUES ($1, $2, $3, $4, $5, 'pending')
                ON CONFLICT (batch_id, runbook_version, phase_name) DO NOTHING
                "#,
            )
            .bind(phase.batch_id)
            .bind(&phase.phase_name)
            .bind(phase.offset_minutes)
            .bind(phase.due_at)
            .bind(phase.runbook_version)
            .execute(&self.pool)
            .await?;
            inserted += result.rows_affected();
        }
        Ok(inserted)
    }

    pub async fn get_phase(&self, id: i64) -> Result<Option<PhaseExecutionRow>> {
        let row = sqlx::query_as::<_, PhaseExecutionRow>(
            r#"
            SELECT id, batch_id, phase_name, offset_minutes, due_at, runbook_version,
                   status, created_at, updated_at
            FROM phase_executions
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn list_phases(&self, batch_id: i64) -> Result<Vec<PhaseExecutionRow>> {
        let rows = sqlx::query_as::<_, PhaseExecutionRow>(
            r#"
            SELECT id, batch_id, phase_name, offset_minutes, due_at, runbook_version,
                   status, created_at, updated_at
            FROM phase_executions
            WHERE batch_id = $1
            ORDER BY offset_minutes DESC, id
            "#,
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Pending phases whose due time has passed
    pub async fn list_due_phases(
        &self,
        batch_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<PhaseExecutionRow>> {
        let rows = sqlx::query_as::<_, PhaseExecutionRow>(
            r#"
            SELECT id, batch_id, phase_name, offset_minutes, due_at, runbook_version,
                   status, created_at, updated_at
            FROM phase_executions
            WHERE batch_id = $1 AND status = 'pending' AND due_at IS NOT NULL AND due_at <= $2
            ORDER BY offset_minutes DESC, id
            "#,
        )
        .bind(batch_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    #[instrument(skip(self))]
    pub async fn try_transition_phase(
        &self,
        id: i64,
        from: &[PhaseStatus],
        to: PhaseStatus,
    ) -> Result<bool> {
        let from: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();
        let result = sqlx::query(
            r#"
            UPDATE phase_executions
            SET status = $2, updated_at = NOW()
            WHERE id = $1 AND status = ANY($3)
            "#,
        )
        .bind(id)
        .bind(to.as_str())
        .bind(&from)
        .execute(&self.pool)
        .await?;

        let won = result.rows_affected() > 0;
        if !won {
            debug!(phase_execution_id = id, to = to.as_str(), "phase transition lost");
        }
        Ok(won)
    }

    /// Highest runbook version any phase of this batch was materialized for
    pub async fn latest_phase_version(&self, batch_id: i64) -> Result<Option<i32>> {
        let row = sqlx::query(
            "SELECT MAX(runbook_version) AS version FROM phase_executions WHERE batch_id = $1",
        )
        .bind(batch_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("version"))
    }

    /// Non-terminal phases of versions older than `version` lose to the new
    /// materialization.
    pub async fn supersede_phases_before(&self, batch_id: i64, version: i32) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE phase_executions
            SET status = 'superseded', updated_at = NOW()
            WHERE batch_id = $1 AND runbook_version < $2
              AND status IN ('pending', 'dispatched')
            "#,
        )
        .bind(batch_id)
        .bind(version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// `ignore` overdue behavior: overdue pending phases of this version are
    /// skipped instead of rerun.
    pub async fn skip_overdue_phases(
        &self,
        batch_id: i64,
        version: i32,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE phase_executions
            SET status = 'skipped', updated_at = NOW()
            WHERE batch_id = $1 AND runbook_version = $2 AND status = 'pending'
              AND due_at IS NOT NULL AND due_at <= $3
            "#,
        )
        .bind(batch_id)
        .bind(version)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    // ============================================
    // Step executions
    // ============================================

    /// Idempotent fan-out insert; conflicts on
    /// (phase_execution_id, batch_member_id, step_index) are redeliveries.
    pub async fn insert_step_executions(&self, steps: &[NewStepExecution]) -> Result<u64> {
        let mut inserted = 0;
        for step in steps {
            let result = sqlx::query(
                r#"
                INSERT INTO step_executions
                    (phase_execution_id, batch_member_id, step_name, step_index, worker_id,
                     function_name, params_json, status, is_poll_step, poll_interval_secs,
                     poll_timeout_secs, on_failure, max_retries, retry_interval_secs)
                VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', $8, $9, $10, $11, $12, $13)
                ON CONFLICT (phase_execution_id, batch_member_id, step_index) DO NOTHING
                "#,
            )
            .bind(step.phase_execution_id)
            .bind(step.batch_member_id)
            .bind(&step.step_name)
            .bind(step.step_index)
            .bind(&step.worker_id)
            .bind(&step.function_name)
            .bind(&step.params_json)
            .bind(step.is_poll_step)
            .bind(step.poll_interval_secs)
            .bind(step.poll_timeout_secs)
            .bind(&step.on_failure)
            .bind(step.max_retries)
            .bind(step.retry_interval_secs)
            .execute(&self.pool)
            .await?;
            inserted += result.rows_affected();
        }
        Ok(inserted)
    }

    pub async fn get_step(&self, id: i64) -> Result<Option<StepExecutionRow>> {
        let sql = format!("SELECT {STEP_COLUMNS} FROM step_executions WHERE id = $1");
        let row = sqlx::query_as::<_, StepExecutionRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row)
    }

    pub async fn list_phase_steps(&self, phase_execution_id: i64) -> Result<Vec<StepExecutionRow>> {
        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM step_executions \
             WHERE phase_execution_id = $1 ORDER BY batch_member_id, step_index"
        );
        let rows = sqlx::query_as::<_, StepExecutionRow>(&sql)
            .bind(phase_execution_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }

    /// First-position pending steps for a phase, one per member
    pub async fn list_phase_entry_steps(
        &self,
        phase_execution_id: i64,
    ) -> Result<Vec<StepExecutionRow>> {
        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM step_executions \
             WHERE phase_execution_id = $1 AND step_index = 0 AND status = 'pending' \
             ORDER BY batch_member_id"
        );
        let rows = sqlx::query_as::<_, StepExecutionRow>(&sql)
            .bind(phase_execution_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }

    /// The member's next pending step in the phase, lowest index first
    pub async fn next_pending_step(
        &self,
        phase_execution_id: i64,
        batch_member_id: i64,
    ) -> Result<Option<StepExecutionRow>> {
        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM step_executions \
             WHERE phase_execution_id = $1 AND batch_member_id = $2 AND status = 'pending' \
             ORDER BY step_index LIMIT 1"
        );
        let row = sqlx::query_as::<_, StepExecutionRow>(&sql)
            .bind(phase_execution_id)
            .bind(batch_member_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row)
    }

    #[instrument(skip(self))]
    pub async fn mark_step_dispatched(&self, id: i64, job_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE step_executions
            SET status = 'dispatched', job_id = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, result_json))]
    pub async fn mark_step_succeeded(
        &self,
        id: i64,
        result_json: Option<&serde_json::Value>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE step_executions
            SET status = 'succeeded', result_json = $2, error_message = NULL,
                completed_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status IN ('dispatched', 'polling')
            "#,
        )
        .bind(id)
        .bind(result_json)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    pub async fn mark_step_failed(&self, id: i64, error: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE step_executions
            SET status = 'failed', error_message = $2, completed_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status IN ('dispatched', 'polling')
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// A step awaiting template resolution can fail before dispatch
    pub async fn mark_pending_step_failed(&self, id: i64, error: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE step_executions
            SET status = 'failed', error_message = $2, completed_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Arm the retry protocol: failed|poll_timeout -> pending with the
    /// retry counter bumped and the dispatch bookkeeping cleared.
    #[instrument(skip(self))]
    pub async fn set_step_retry_pending(
        &self,
        id: i64,
        retry_after: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE step_executions
            SET status = 'pending', retry_count = retry_count + 1, job_id = NULL,
                completed_at = NULL, retry_after = $2, updated_at = NOW()
            WHERE id = $1 AND status IN ('failed', 'poll_timeout')
            "#,
        )
        .bind(id)
        .bind(retry_after)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    pub async fn mark_step_polling(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE step_executions
            SET status = 'polling',
                poll_started_at = COALESCE(poll_started_at, NOW()),
                last_polled_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status IN ('dispatched', 'polling')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Record a poll re-dispatch
    pub async fn touch_step_poll(&self, id: i64, job_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE step_executions
            SET last_polled_at = NOW(), poll_count = poll_count + 1, job_id = $2,
                updated_at = NOW()
            WHERE id = $1 AND status = 'polling'
            "#,
        )
        .bind(id)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    pub async fn mark_step_poll_timeout(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE step_executions
            SET status = 'poll_timeout', error_message = 'poll timeout',
                completed_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = 'polling'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Cancel every non-terminal step for a member, across all phases
    #[instrument(skip(self))]
    pub async fn cancel_member_steps(&self, batch_member_id: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE step_executions
            SET status = 'cancelled', completed_at = NOW(), updated_at = NOW()
            WHERE batch_member_id = $1 AND status IN ('pending', 'dispatched', 'polling')
            "#,
        )
        .bind(batch_member_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Phase ids where this member has steps and the phase is still dispatched
    pub async fn member_dispatched_phase_ids(&self, batch_member_id: i64) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT p.id
            FROM step_executions s
            JOIN phase_executions p ON s.phase_execution_id = p.id
            WHERE s.batch_member_id = $1 AND p.status = 'dispatched'
            "#,
        )
        .bind(batch_member_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.get("id")).collect())
    }

    /// Whether every step row of the phase is terminal
    pub async fn phase_steps_terminal(&self, phase_execution_id: i64) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) FILTER (WHERE status IN ('pending', 'dispatched', 'polling'))
                   AS open_count
            FROM step_executions
            WHERE phase_execution_id = $1
            "#,
        )
        .bind(phase_execution_id)
        .fetch_one(&self.pool)
        .await?;

        let open: i64 = row.get("open_count");
        Ok(open == 0)
    }

    /// Whether at least one member ran every step of the phase successfully
    pub async fn phase_has_fully_succeeded_member(
        &self,
        phase_execution_id: i64,
    ) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT batch_member_id
                FROM step_executions
                WHERE phase_execution_id = $1
                GROUP BY batch_member_id
                HAVING COUNT(*) FILTER (WHERE status <> 'succeeded') = 0
            ) AS any_full_success
            "#,
        )
        .bind(phase_execution_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("any_full_success"))
    }

    /// Polling steps whose next poll is due
    pub async fn due_polling_steps(&self, now: DateTime<Utc>) -> Result<Vec<StepExecutionRow>> {
        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM step_executions \
             WHERE status = 'polling' \
               AND last_polled_at + poll_interval_secs * INTERVAL '1 second' <= $1 \
             ORDER BY last_polled_at"
        );
        let rows = sqlx::query_as::<_, StepExecutionRow>(&sql)
            .bind(now)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }

    // ============================================
    // Init executions
    // ============================================

    /// Idempotent insert keyed by (batch_id, runbook_version, step_index)
    pub async fn insert_init_executions(&self, inits: &[NewInitExecution]) -> Result<u64> {
        let mut inserted = 0;
        for init in inits {
            let result = sqlx::query(
                r#"
                INSERT INTO init_executions
                    (batch_id, runbook_version, step_name, step_index, worker_id,
                     function_name, params_json, status, is_poll_step, poll_interval_secs,
                     poll_timeout_secs, on_failure, max_retries, retry_interval_secs)
                VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', $8, $9, $10, $11, $12, $13)
                ON CONFLICT (batch_id, runbook_version, step_index) DO NOTHING
                "#,
            )
            .bind(init.batch_id)
            .bind(init.runbook_version)
            .bind(&init.step_name)
            .bind(init.step_index)
            .bind(&init.worker_id)
            .bind(&init.function_name)
            .bind(&init.params_json)
            .bind(init.is_poll_step)
            .bind(init.poll_interval_secs)
            .bind(init.poll_timeout_secs)
            .bind(&init.on_failure)
            .bind(init.max_retries)
            .bind(init.retry_interval_secs)
            .execute(&self.pool)
            .await?;
            inserted += result.rows_affected();
        }
        Ok(inserted)
    }

    pub async fn get_init(&self, id: i64) -> Result<Option<InitExecutionRow>> {
        let sql = format!("SELECT {INIT_COLUMNS} FROM init_executions WHERE id = $1");
        let row = sqlx::query_as::<_, InitExecutionRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row)
    }

    pub async fn list_inits(
        &self,
        batch_id: i64,
        runbook_version: i32,
    ) -> Result<Vec<InitExecutionRow>> {
        let sql = format!(
            "SELECT {INIT_COLUMNS} FROM init_executions \
             WHERE batch_id = $1 AND runbook_version = $2 ORDER BY step_index"
        );
        let rows = sqlx::query_as::<_, InitExecutionRow>(&sql)
            .bind(batch_id)
            .bind(runbook_version)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }

    /// Next init step to run; init progression is sequential per batch
    pub async fn next_pending_init(
        &self,
        batch_id: i64,
        runbook_version: i32,
    ) -> Result<Option<InitExecutionRow>> {
        let sql = format!(
            "SELECT {INIT_COLUMNS} FROM init_executions \
             WHERE batch_id = $1 AND runbook_version = $2 AND status = 'pending' \
             ORDER BY step_index LIMIT 1"
        );
        let row = sqlx::query_as::<_, InitExecutionRow>(&sql)
            .bind(batch_id)
            .bind(runbook_version)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row)
    }

    #[instrument(skip(self))]
    pub async fn mark_init_dispatched(&self, id: i64, job_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE init_executions
            SET status = 'dispatched', job_id = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, result_json))]
    pub async fn mark_init_succeeded(
        &self,
        id: i64,
        result_json: Option<&serde_json::Value>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE init_executions
            SET status = 'succeeded', result_json = $2, error_message = NULL,
                completed_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status IN ('dispatched', 'polling')
            "#,
        )
        .bind(id)
        .bind(result_json)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    pub async fn mark_init_failed(&self, id: i64, error: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE init_executions
            SET status = 'failed', error_message = $2, completed_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status IN ('dispatched', 'polling')
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    pub async fn set_init_retry_pending(
        &self,
        id: i64,
        retry_after: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE init_executions
            SET status = 'pending', retry_count = retry_count + 1, job_id = NULL,
                completed_at = NULL, retry_after = $2, updated_at = NOW()
            WHERE id = $1 AND status IN ('failed', 'poll_timeout')
            "#,
        )
        .bind(id)
        .bind(retry_after)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    pub async fn mark_init_polling(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE init_executions
            SET status = 'polling',
                poll_started_at = COALESCE(poll_started_at, NOW()),
                last_polled_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status IN ('dispatched', 'polling')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn touch_init_poll(&self, id: i64, job_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE init_executions
            SET last_polled_at = NOW(), poll_count = poll_count + 1, job_id = $2,
                updated_at = NOW()
            WHERE id = $1 AND status = 'polling'
            "#,
        )
        .bind(id)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    pub async fn mark_init_poll_timeout(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE init_executions
            SET status = 'poll_timeout', error_message = 'poll timeout',
                completed_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = 'polling'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Whether every init step for the version has succeeded
    pub async fn inits_all_succeeded(&self, batch_id: i64, runbook_version: i32) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) FILTER (WHERE status <> 'succeeded') AS open_count,
                   COUNT(*) AS total
            FROM init_executions
            WHERE batch_id = $1 AND runbook_version = $2
            "#,
        )
        .bind(batch_id)
        .bind(runbook_version)
        .fetch_one(&self.pool)
        .await?;

        let open: i64 = row.get("open_count");
        let total: i64 = row.get("total");
        Ok(total > 0 && open == 0)
    }

    /// Polling init steps whose next poll is due
    pub async fn due_polling_inits(&self, now: DateTime<Utc>) -> Result<Vec<InitExecutionRow>> {
        let sql = format!(
            "SELECT {INIT_COLUMNS} FROM init_executions \
             WHERE status = 'polling' \
               AND last_polled_at + poll_interval_secs * INTERVAL '1 second' <= $1 \
             ORDER BY last_polled_at"
        );
        let rows = sqlx::query_as::<_, InitExecutionRow>(&sql)
            .bind(now)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }
}

/// Compute the retry deadline for a failed execution
pub fn retry_after(now: DateTime<Utc>, retry_interval_secs: i32) -> DateTime<Utc> {
    now + Duration::seconds(retry_interval_secs as i64)
}
