//! SQLite-backed job store.
//!
//! SQLite has no `SELECT ... FOR UPDATE SKIP LOCKED`. Leasing is instead a
//! compare-and-swap claim inside an `IMMEDIATE` transaction: each candidate
//! row is claimed with a conditional update that only matches while the row is
//! still due, and rows whose update matches nothing were taken by another
//! caller and are skipped. Runs are claimed the same way on `status =
//! 'running'`, so a run leaves `running` at most once.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use tokio::sync::Mutex;
use tracing::{debug, info};

use agentjobs_types::policy::{STALE_RUN_ERROR, run_duration_ms, stale_cutoff};
use agentjobs_types::validate::{validate_completion, validate_job, validate_payload};
use agentjobs_types::{
    AgentJob, AgentJobPatch, AgentJobRun, CompleteRunInput, JobFilter, JobStatus, MAX_LIST_JOBS,
    RunStatus, ValidationError,
};

use crate::error::{JobError, Result, is_duplicate_key, is_foreign_key_violation};
use crate::{JobRepository, MAX_LIST_RUNS};

/// How long a writer waits for another connection's transaction.
const BUSY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS agents (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        name TEXT NOT NULL,
        created_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS agent_jobs (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        agent_id TEXT NOT NULL REFERENCES agents(id),
        name TEXT NOT NULL,
        description TEXT,
        schedule_kind TEXT NOT NULL,
        cron_expr TEXT,
        interval_ms INTEGER,
        run_at INTEGER,
        timezone TEXT NOT NULL DEFAULT 'UTC',
        payload_kind TEXT NOT NULL,
        payload_text TEXT NOT NULL,
        room_id TEXT,
        enabled INTEGER NOT NULL DEFAULT 1,
        status TEXT NOT NULL DEFAULT 'active',
        last_run_at INTEGER,
        last_run_status TEXT,
        last_run_error TEXT,
        next_run_at INTEGER,
        run_count INTEGER NOT NULL DEFAULT 0,
        error_count INTEGER NOT NULL DEFAULT 0,
        max_failures INTEGER NOT NULL DEFAULT 5 CHECK (max_failures > 0),
        consecutive_failures INTEGER NOT NULL DEFAULT 0,
        created_by TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_agent_jobs_tenant
        ON agent_jobs(tenant_id, created_at);
    CREATE INDEX IF NOT EXISTS idx_agent_jobs_due
        ON agent_jobs(next_run_at, created_at) WHERE enabled = 1 AND status = 'active';

    CREATE TABLE IF NOT EXISTS agent_job_runs (
        id TEXT PRIMARY KEY,
        job_id TEXT NOT NULL REFERENCES agent_jobs(id) ON DELETE CASCADE,
        tenant_id TEXT NOT NULL,
        status TEXT NOT NULL,
        started_at INTEGER NOT NULL,
        completed_at INTEGER,
        duration_ms INTEGER,
        error TEXT,
        payload_text TEXT NOT NULL,
        message_id TEXT,
        created_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_agent_job_runs_job
        ON agent_job_runs(job_id, started_at DESC, id DESC);
    CREATE INDEX IF NOT EXISTS idx_agent_job_runs_running
        ON agent_job_runs(started_at) WHERE status = 'running';";

const JOB_COLUMNS: &str = "id, tenant_id, agent_id, name, description, schedule_kind, cron_expr,
    interval_ms, run_at, timezone, payload_kind, payload_text, room_id, enabled, status,
    last_run_at, last_run_status, last_run_error, next_run_at, run_count, error_count,
    max_failures, consecutive_failures, created_by, created_at, updated_at";

const RUN_COLUMNS: &str = "id, job_id, tenant_id, status, started_at, completed_at, duration_ms,
    error, payload_text, message_id, created_at";

/// SQLite storage for agent jobs and runs.
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobStore {
    /// Open (or create) the SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if path.as_os_str().is_empty() {
            return Err(JobError::Configuration("database path is empty".to_string()));
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                return Err(JobError::Configuration(format!(
                    "database directory does not exist: {}",
                    parent.display()
                )));
            }
        }

        let conn = Connection::open(path)?;
        // Enable WAL mode for concurrent readers alongside the single writer.
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        init_schema(&conn)?;

        info!("Job store opened: {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            f(&mut conn)
        })
        .await?
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

// ─── Row mapping ───────────────────────────────────

fn to_ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_ms(idx: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

fn ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    from_ms(idx, row.get(idx)?)
}

fn opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<i64>>(idx)?
        .map(|ms| from_ms(idx, ms))
        .transpose()
}

fn parse<T: FromStr<Err = ValidationError>>(idx: usize, text: &str) -> rusqlite::Result<T> {
    text.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn enum_col<T: FromStr<Err = ValidationError>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    parse(idx, &row.get::<_, String>(idx)?)
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<AgentJob> {
    Ok(AgentJob {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        agent_id: row.get(2)?,
        name: row.get(3)?,
        description: row.get(4)?,
        schedule_kind: enum_col(row, 5)?,
        cron_expr: row.get(6)?,
        interval_ms: row.get(7)?,
        run_at: opt_ts(row, 8)?,
        timezone: row.get(9)?,
        payload_kind: enum_col(row, 10)?,
        payload_text: row.get(11)?,
        room_id: row.get(12)?,
        enabled: row.get::<_, i64>(13)? != 0,
        status: enum_col(row, 14)?,
        last_run_at: opt_ts(row, 15)?,
        last_run_status: row
            .get::<_, Option<String>>(16)?
            .map(|s| parse(16, &s))
            .transpose()?,
        last_run_error: row.get(17)?,
        next_run_at: opt_ts(row, 18)?,
        run_count: row.get(19)?,
        error_count: row.get(20)?,
        max_failures: row.get(21)?,
        consecutive_failures: row.get(22)?,
        created_by: row.get(23)?,
        created_at: ts(row, 24)?,
        updated_at: ts(row, 25)?,
    })
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<AgentJobRun> {
    Ok(AgentJobRun {
        id: row.get(0)?,
        job_id: row.get(1)?,
        tenant_id: row.get(2)?,
        status: enum_col(row, 3)?,
        started_at: ts(row, 4)?,
        completed_at: opt_ts(row, 5)?,
        duration_ms: row.get(6)?,
        error: row.get(7)?,
        payload_text: row.get(8)?,
        message_id: row.get(9)?,
        created_at: ts(row, 10)?,
    })
}

// ─── Statements shared inside transactions ───────────────────────────────────

fn load_job(conn: &Connection, tenant_id: &str, job_id: &str) -> Result<AgentJob> {
    conn.query_row(
        &format!("SELECT {JOB_COLUMNS} FROM agent_jobs WHERE id = ?1 AND tenant_id = ?2"),
        params![job_id, tenant_id],
        job_from_row,
    )
    .optional()?
    .ok_or_else(|| JobError::not_found("job", job_id))
}

fn load_job_by_id(conn: &Connection, job_id: &str) -> Result<Option<AgentJob>> {
    Ok(conn
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM agent_jobs WHERE id = ?1"),
            params![job_id],
            job_from_row,
        )
        .optional()?)
}

fn load_run(conn: &Connection, tenant_id: &str, run_id: &str) -> Result<AgentJobRun> {
    conn.query_row(
        &format!("SELECT {RUN_COLUMNS} FROM agent_job_runs WHERE id = ?1 AND tenant_id = ?2"),
        params![run_id, tenant_id],
        run_from_row,
    )
    .optional()?
    .ok_or_else(|| JobError::not_found("run", run_id))
}

/// Persist the user-editable definition of a job.
fn write_definition(conn: &Connection, job: &AgentJob) -> Result<()> {
    conn.execute(
        "UPDATE agent_jobs SET
            name = ?2, description = ?3, schedule_kind = ?4, cron_expr = ?5, interval_ms = ?6,
            run_at = ?7, timezone = ?8, payload_kind = ?9, payload_text = ?10, room_id = ?11,
            enabled = ?12, status = ?13, max_failures = ?14, next_run_at = ?15, updated_at = ?16
         WHERE id = ?1",
        params![
            job.id,
            job.name,
            job.description,
            job.schedule_kind.as_str(),
            job.cron_expr,
            job.interval_ms,
            job.run_at.map(to_ms),
            job.timezone,
            job.payload_kind.as_str(),
            job.payload_text,
            job.room_id,
            job.enabled as i64,
            job.status.as_str(),
            job.max_failures,
            job.next_run_at.map(to_ms),
            to_ms(job.updated_at),
        ],
    )?;
    Ok(())
}

/// Persist the run summary and counters of a job.
fn write_summary(conn: &Connection, job: &AgentJob) -> Result<()> {
    conn.execute(
        "UPDATE agent_jobs SET
            status = ?2, last_run_at = ?3, last_run_status = ?4, last_run_error = ?5,
            next_run_at = ?6, run_count = ?7, error_count = ?8, consecutive_failures = ?9,
            updated_at = ?10
         WHERE id = ?1",
        params![
            job.id,
            job.status.as_str(),
            job.last_run_at.map(to_ms),
            job.last_run_status.map(|s| s.as_str()),
            job.last_run_error,
            job.next_run_at.map(to_ms),
            job.run_count,
            job.error_count,
            job.consecutive_failures,
            to_ms(job.updated_at),
        ],
    )?;
    Ok(())
}

fn insert_job(conn: &Connection, job: &AgentJob) -> rusqlite::Result<usize> {
    conn.execute(
        &format!(
            "INSERT INTO agent_jobs ({JOB_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                     ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26)"
        ),
        params![
            job.id,
            job.tenant_id,
            job.agent_id,
            job.name,
            job.description,
            job.schedule_kind.as_str(),
            job.cron_expr,
            job.interval_ms,
            job.run_at.map(to_ms),
            job.timezone,
            job.payload_kind.as_str(),
            job.payload_text,
            job.room_id,
            job.enabled as i64,
            job.status.as_str(),
            job.last_run_at.map(to_ms),
            job.last_run_status.map(|s| s.as_str()),
            job.last_run_error,
            job.next_run_at.map(to_ms),
            job.run_count,
            job.error_count,
            job.max_failures,
            job.consecutive_failures,
            job.created_by,
            to_ms(job.created_at),
            to_ms(job.updated_at),
        ],
    )
}

#[async_trait]
impl JobRepository for SqliteJobStore {
    async fn register_agent(&self, tenant_id: &str, agent_id: &str, name: &str) -> Result<()> {
        let tenant_id = tenant_id.to_string();
        let agent_id = agent_id.to_string();
        let name = name.to_string();
        let now = to_ms(Utc::now());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO agents (id, tenant_id, name, created_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name
                 WHERE agents.tenant_id = excluded.tenant_id",
                params![agent_id, tenant_id, name, now],
            )?;
            Ok(())
        })
        .await
    }

    async fn create_job(&self, job: AgentJob) -> Result<AgentJob> {
        validate_job(&job)?;
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let owned = tx
                .query_row(
                    "SELECT 1 FROM agents WHERE id = ?1 AND tenant_id = ?2",
                    params![job.agent_id, job.tenant_id],
                    |_| Ok(()),
                )
                .optional()?;
            if owned.is_none() {
                return Err(JobError::not_found("agent", job.agent_id));
            }
            match insert_job(&tx, &job) {
                Ok(_) => {}
                Err(e) if is_foreign_key_violation(&e) => {
                    return Err(JobError::not_found("agent", job.agent_id));
                }
                Err(e) if is_duplicate_key(&e) => {
                    return Err(JobError::Conflict(format!("job {} already exists", job.id)));
                }
                Err(e) => return Err(e.into()),
            }
            tx.commit()?;
            Ok(job)
        })
        .await
    }

    async fn get_job(&self, tenant_id: &str, job_id: &str) -> Result<AgentJob> {
        let tenant_id = tenant_id.to_string();
        let job_id = job_id.to_string();
        self.with_conn(move |conn| load_job(conn, &tenant_id, &job_id))
            .await
    }

    async fn update_job(
        &self,
        tenant_id: &str,
        job_id: &str,
        patch: &AgentJobPatch,
        now: DateTime<Utc>,
    ) -> Result<AgentJob> {
        let tenant_id = tenant_id.to_string();
        let job_id = job_id.to_string();
        let patch = patch.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut job = load_job(&tx, &tenant_id, &job_id)?;
            patch.apply(&mut job, now);
            validate_job(&job)?;
            write_definition(&tx, &job)?;
            tx.commit()?;
            Ok(job)
        })
        .await
    }

    async fn delete_job(&self, tenant_id: &str, job_id: &str) -> Result<()> {
        let tenant_id = tenant_id.to_string();
        let job_id = job_id.to_string();
        self.with_conn(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM agent_jobs WHERE id = ?1 AND tenant_id = ?2",
                params![job_id, tenant_id],
            )?;
            if deleted == 0 {
                return Err(JobError::not_found("job", job_id));
            }
            Ok(())
        })
        .await
    }

    async fn list_jobs(&self, tenant_id: &str, filter: &JobFilter) -> Result<Vec<AgentJob>> {
        let tenant_id = tenant_id.to_string();
        let filter = filter.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM agent_jobs
                 WHERE tenant_id = ?1
                   AND (?2 IS NULL OR agent_id = ?2)
                   AND (?3 IS NULL OR status = ?3)
                   AND (?4 IS NULL OR enabled = ?4)
                 ORDER BY created_at ASC, id ASC
                 LIMIT ?5"
            ))?;
            let jobs = stmt
                .query_map(
                    params![
                        tenant_id,
                        filter.agent_id,
                        filter.status.map(|s| s.as_str()),
                        filter.enabled.map(|e| e as i64),
                        MAX_LIST_JOBS as i64,
                    ],
                    job_from_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(jobs)
        })
        .await
    }

    async fn pickup_due(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<AgentJob>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.with_conn(move |conn| {
            let now_ms = to_ms(now);
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let candidates = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM agent_jobs
                     WHERE enabled = 1 AND status = 'active'
                       AND next_run_at IS NOT NULL AND next_run_at <= ?1
                     ORDER BY next_run_at ASC, created_at ASC, id ASC
                     LIMIT ?2",
                )?;
                stmt.query_map(params![now_ms, limit as i64], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            };

            let mut leased = Vec::with_capacity(candidates.len());
            for job_id in candidates {
                let claimed = tx.execute(
                    "UPDATE agent_jobs
                     SET next_run_at = NULL, updated_at = ?2
                     WHERE id = ?1 AND enabled = 1 AND status = 'active'
                       AND next_run_at IS NOT NULL AND next_run_at <= ?2",
                    params![job_id, now_ms],
                )?;
                if claimed == 0 {
                    debug!(job_id = %job_id, "Job already leased, skipping");
                    continue;
                }
                if let Some(job) = load_job_by_id(&tx, &job_id)? {
                    leased.push(job);
                }
            }
            tx.commit()?;

            if !leased.is_empty() {
                debug!(count = leased.len(), "Leased due jobs");
            }
            Ok(leased)
        })
        .await
    }

    async fn start_run(
        &self,
        tenant_id: &str,
        job_id: &str,
        payload_text: &str,
        started_at: DateTime<Utc>,
    ) -> Result<AgentJobRun> {
        validate_payload(payload_text)?;
        let tenant_id = tenant_id.to_string();
        let job_id = job_id.to_string();
        let payload_text = payload_text.to_string();
        let run_id = uuid::Uuid::new_v4().to_string();
        self.with_conn(move |conn| {
            let started_ms = to_ms(started_at);
            // The run copies its tenant from the parent row so the two always agree.
            let inserted = conn.execute(
                "INSERT INTO agent_job_runs
                    (id, job_id, tenant_id, status, started_at, payload_text, created_at)
                 SELECT ?1, id, tenant_id, 'running', ?2, ?3, ?2
                 FROM agent_jobs WHERE id = ?4 AND tenant_id = ?5",
                params![run_id, started_ms, payload_text, job_id, tenant_id],
            )?;
            if inserted == 0 {
                return Err(JobError::not_found("job", job_id));
            }
            load_run(conn, &tenant_id, &run_id)
        })
        .await
    }

    async fn complete_run(&self, tenant_id: &str, input: &CompleteRunInput) -> Result<AgentJob> {
        validate_completion(input)?;
        let tenant_id = tenant_id.to_string();
        let input = input.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut run = load_run(&tx, &tenant_id, &input.run_id)?;
            if run.job_id != input.job_id {
                return Err(JobError::not_found("run", input.run_id));
            }
            if run.status != RunStatus::Running {
                return Err(JobError::Conflict(format!(
                    "run {} already completed with status {}",
                    run.id, run.status
                )));
            }

            run.finish(
                input.status,
                input.completed_at,
                input.error.clone(),
                input.message_id.clone(),
            );
            let claimed = tx.execute(
                "UPDATE agent_job_runs
                 SET status = ?2, completed_at = ?3, duration_ms = ?4, error = ?5, message_id = ?6
                 WHERE id = ?1 AND status = 'running'",
                params![
                    run.id,
                    run.status.as_str(),
                    run.completed_at.map(to_ms),
                    run.duration_ms,
                    run.error,
                    run.message_id,
                ],
            )?;
            if claimed == 0 {
                return Err(JobError::Conflict(format!("run {} is no longer running", run.id)));
            }

            let mut job = load_job(&tx, &tenant_id, &input.job_id)?;
            job.record_completion(&run, &input);
            write_summary(&tx, &job)?;
            tx.commit()?;
            Ok(job)
        })
        .await
    }

    async fn get_run(&self, tenant_id: &str, run_id: &str) -> Result<AgentJobRun> {
        let tenant_id = tenant_id.to_string();
        let run_id = run_id.to_string();
        self.with_conn(move |conn| load_run(conn, &tenant_id, &run_id))
            .await
    }

    async fn list_runs(
        &self,
        tenant_id: &str,
        job_id: &str,
        limit: usize,
    ) -> Result<Vec<AgentJobRun>> {
        let tenant_id = tenant_id.to_string();
        let job_id = job_id.to_string();
        let limit = limit.min(MAX_LIST_RUNS) as i64;
        self.with_conn(move |conn| {
            load_job(conn, &tenant_id, &job_id)?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM agent_job_runs
                 WHERE job_id = ?1 AND tenant_id = ?2
                 ORDER BY started_at DESC, id DESC
                 LIMIT ?3"
            ))?;
            let runs = stmt
                .query_map(params![job_id, tenant_id, limit], run_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(runs)
        })
        .await
    }

    async fn prune_run_history(
        &self,
        tenant_id: &str,
        job_id: &str,
        max_runs: usize,
    ) -> Result<usize> {
        let tenant_id = tenant_id.to_string();
        let job_id = job_id.to_string();
        self.with_conn(move |conn| {
            load_job(conn, &tenant_id, &job_id)?;
            let deleted = conn.execute(
                "DELETE FROM agent_job_runs
                 WHERE job_id = ?1 AND id NOT IN (
                     SELECT id FROM agent_job_runs
                     WHERE job_id = ?1
                     ORDER BY started_at DESC, id DESC
                     LIMIT ?2
                 )",
                params![job_id, max_runs as i64],
            )?;
            if deleted > 0 {
                debug!(job_id = %job_id, deleted, "Pruned run history");
            }
            Ok(deleted)
        })
        .await
    }

    async fn jobs_exceeding_history(&self, max_runs: usize) -> Result<Vec<(String, String)>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT j.tenant_id, j.id FROM agent_jobs j
                 JOIN agent_job_runs r ON r.job_id = j.id
                 GROUP BY j.id
                 HAVING COUNT(r.id) > ?1
                 ORDER BY j.created_at ASC",
            )?;
            let rows = stmt
                .query_map(params![max_runs as i64], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn cleanup_stale_runs(&self, older_than: Duration, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = stale_cutoff(older_than, now)?;
        self.with_conn(move |conn| {
            let cutoff = to_ms(cutoff);
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let stale = {
                let mut stmt = tx.prepare(
                    "SELECT id, job_id, started_at FROM agent_job_runs
                     WHERE status = 'running' AND started_at < ?1
                     ORDER BY started_at ASC",
                )?;
                stmt.query_map(params![cutoff], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        ts(row, 2)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?
            };

            let mut per_job: BTreeMap<String, i64> = BTreeMap::new();
            for (run_id, job_id, started_at) in stale {
                let duration_ms = run_duration_ms(started_at, now);
                let claimed = tx.execute(
                    "UPDATE agent_job_runs
                     SET status = 'timeout', completed_at = ?2, duration_ms = ?3, error = ?4
                     WHERE id = ?1 AND status = 'running'",
                    params![run_id, to_ms(now), duration_ms, STALE_RUN_ERROR],
                )?;
                if claimed == 1 {
                    *per_job.entry(job_id).or_default() += 1;
                }
            }

            let mut reclaimed = 0usize;
            for (job_id, count) in &per_job {
                reclaimed += *count as usize;
                let Some(mut job) = load_job_by_id(&tx, job_id)? else {
                    continue;
                };
                let previous = job.status;
                job.record_stale_runs(*count, now);
                write_summary(&tx, &job)?;
                if previous != job.status && job.status == JobStatus::Paused {
                    info!(
                        job_id = %job.id,
                        tenant_id = %job.tenant_id,
                        "Job paused after stale runs"
                    );
                }
            }
            tx.commit()?;

            if reclaimed > 0 {
                info!(reclaimed, jobs = per_job.len(), "Reclaimed stale runs");
            }
            Ok(reclaimed)
        })
        .await
    }
}
