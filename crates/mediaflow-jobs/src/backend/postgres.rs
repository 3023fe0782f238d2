use super::{JobBackend, QueueCounts, StalledJob, STALLED_LIMIT_REASON};
use crate::error::{JobError, Result};
use crate::job::{JobRecord, JobState};
use crate::options::JobOptions;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Pool, Postgres, Row};
use std::time::Duration;

const COLUMNS: &str = "id, queue, job_type, payload, state, progress, attempts_made, \
    stalled_count, options, result, failure_reason, created_at, run_at, locked_until, lease, finished_at";

/// Postgres-backed job queue
///
/// Survives restarts and can be shared by several worker processes; claims
/// use `FOR UPDATE SKIP LOCKED` so concurrent workers never take the same job.
#[derive(Debug, Clone)]
pub struct PostgresBackend {
    pool: Pool<Postgres>,
    table_name: String,
}

fn backend_err(e: sqlx::Error) -> JobError {
    JobError::BackendError(e.to_string())
}

/// No matching row means the job moved on without this lease holder.
fn held(rows_affected: u64, job_id: &str) -> Result<()> {
    if rows_affected == 0 {
        return Err(JobError::LeaseLost(job_id.to_string()));
    }
    Ok(())
}

impl PostgresBackend {
    pub fn new(pool: Pool<Postgres>, table_name: &str) -> Result<Self> {
        let valid = !table_name.is_empty()
            && table_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(JobError::ConfigError(format!(
                "invalid job table name: {table_name}"
            )));
        }

        Ok(Self {
            pool,
            table_name: table_name.to_string(),
        })
    }

    /// Connect a bounded pool and make sure the schema exists.
    pub async fn connect(url: &str, table_name: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await
            .map_err(backend_err)?;

        let backend = Self::new(pool, table_name)?;
        backend.ensure_schema().await?;
        Ok(backend)
    }

    /// Initialize the database schema
    pub async fn ensure_schema(&self) -> Result<()> {
        let query = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {t} (
                seq BIGSERIAL,
                id TEXT NOT NULL,
                queue TEXT NOT NULL,
                job_type TEXT NOT NULL,
                payload JSONB NOT NULL,
                state TEXT NOT NULL DEFAULT 'waiting',
                progress SMALLINT NOT NULL DEFAULT 0,
                attempts_made INT NOT NULL DEFAULT 0,
                stalled_count INT NOT NULL DEFAULT 0,
                priority INT NOT NULL DEFAULT 0,
                options JSONB NOT NULL,
                result JSONB,
                failure_reason TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                run_at TIMESTAMPTZ,
                locked_until TIMESTAMPTZ,
                lease BIGINT NOT NULL DEFAULT 0,
                finished_at TIMESTAMPTZ,
                PRIMARY KEY (queue, id)
            );
            CREATE INDEX IF NOT EXISTS idx_{t}_claim ON {t} (queue, state, priority, seq);
            CREATE INDEX IF NOT EXISTS idx_{t}_finished ON {t} (queue, state, finished_at);
            "#,
            t = self.table_name
        );

        sqlx::raw_sql(&query)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;

        Ok(())
    }

    fn decode(row: &PgRow) -> Result<JobRecord> {
        let state: String = row.try_get("state").map_err(backend_err)?;
        let state = JobState::parse(&state)
            .ok_or_else(|| JobError::BackendError(format!("unknown job state: {state}")))?;
        let options: Json<JobOptions> = row.try_get("options").map_err(backend_err)?;

        Ok(JobRecord {
            id: row.try_get("id").map_err(backend_err)?,
            queue: row.try_get("queue").map_err(backend_err)?,
            job_type: row.try_get("job_type").map_err(backend_err)?,
            payload: row.try_get("payload").map_err(backend_err)?,
            state,
            progress: row.try_get::<i16, _>("progress").map_err(backend_err)?.clamp(0, 100) as u8,
            attempts_made: row.try_get::<i32, _>("attempts_made").map_err(backend_err)? as u32,
            stalled_count: row.try_get::<i32, _>("stalled_count").map_err(backend_err)? as u32,
            options: options.0,
            result: row.try_get("result").map_err(backend_err)?,
            failure_reason: row.try_get("failure_reason").map_err(backend_err)?,
            created_at: row.try_get("created_at").map_err(backend_err)?,
            run_at: row.try_get("run_at").map_err(backend_err)?,
            locked_until: row.try_get("locked_until").map_err(backend_err)?,
            lease: row.try_get::<i64, _>("lease").map_err(backend_err)?.max(0) as u64,
            finished_at: row.try_get("finished_at").map_err(backend_err)?,
        })
    }
}

#[async_trait]
impl JobBackend for PostgresBackend {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn push(&self, job: JobRecord) -> Result<()> {
        let query = format!(
            r#"
            INSERT INTO {} (id, queue, job_type, payload, state, priority, options, created_at, run_at)
            VALUES ($1, $2, $3, $4, 'waiting', $5, $6, $7, $8)
            ON CONFLICT (queue, id) DO NOTHING
            "#,
            self.table_name
        );

        sqlx::query(&query)
            .bind(&job.id)
            .bind(&job.queue)
            .bind(&job.job_type)
            .bind(&job.payload)
            .bind(job.options.priority)
            .bind(Json(&job.options))
            .bind(job.created_at)
            .bind(job.run_at)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;

        Ok(())
    }

    async fn claim(
        &self,
        queue: &str,
        job_types: &[String],
        lock: Duration,
    ) -> Result<Option<JobRecord>> {
        // Atomic claim; skipped rows are being claimed by another worker
        let query = format!(
            r#"
            UPDATE {t}
            SET state = 'active',
                run_at = NULL,
                lease = lease + 1,
                locked_until = NOW() + make_interval(secs => $3)
            WHERE queue = $1 AND id = (
                SELECT id
                FROM {t}
                WHERE queue = $1
                  AND state = 'waiting'
                  AND (run_at IS NULL OR run_at <= NOW())
                  AND (cardinality($2::text[]) = 0 OR job_type = ANY($2::text[]))
                ORDER BY priority ASC, seq ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {COLUMNS}
            "#,
            t = self.table_name
        );

        let row = sqlx::query(&query)
            .bind(queue)
            .bind(job_types)
            .bind(lock.as_secs_f64())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;

        row.as_ref().map(Self::decode).transpose()
    }

    async fn extend_lock(&self, queue: &str, job_id: &str, lease: u64, lock: Duration) -> Result<()> {
        let query = format!(
            "UPDATE {} SET locked_until = NOW() + make_interval(secs => $4) \
             WHERE queue = $1 AND id = $2 AND state = 'active' AND lease = $3",
            self.table_name
        );
        let done = sqlx::query(&query)
            .bind(queue)
            .bind(job_id)
            .bind(lease as i64)
            .bind(lock.as_secs_f64())
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        held(done.rows_affected(), job_id)
    }

    async fn update_progress(&self, queue: &str, job_id: &str, lease: u64, progress: u8) -> Result<()> {
        let query = format!(
            "UPDATE {} SET progress = GREATEST(progress, $4) \
             WHERE queue = $1 AND id = $2 AND state = 'active' AND lease = $3",
            self.table_name
        );
        let done = sqlx::query(&query)
            .bind(queue)
            .bind(job_id)
            .bind(lease as i64)
            .bind(progress.min(100) as i16)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        held(done.rows_affected(), job_id)
    }

    async fn complete(
        &self,
        queue: &str,
        job_id: &str,
        lease: u64,
        result: serde_json::Value,
    ) -> Result<()> {
        let query = format!(
            r#"
            UPDATE {}
            SET state = 'completed', progress = 100, result = $4,
                locked_until = NULL, finished_at = NOW()
            WHERE queue = $1 AND id = $2 AND state = 'active' AND lease = $3
            "#,
            self.table_name
        );
        let done = sqlx::query(&query)
            .bind(queue)
            .bind(job_id)
            .bind(lease as i64)
            .bind(result)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        held(done.rows_affected(), job_id)
    }

    async fn fail(
        &self,
        queue: &str,
        job_id: &str,
        lease: u64,
        reason: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let query = format!(
            r#"
            UPDATE {}
            SET attempts_made = attempts_made + 1,
                failure_reason = $4,
                locked_until = NULL,
                run_at = $5,
                state = CASE WHEN $5::timestamptz IS NULL THEN 'failed' ELSE 'waiting' END,
                progress = CASE WHEN $5::timestamptz IS NULL THEN progress ELSE 0 END,
                finished_at = CASE WHEN $5::timestamptz IS NULL THEN NOW() ELSE NULL END
            WHERE queue = $1 AND id = $2 AND state = 'active' AND lease = $3
            "#,
            self.table_name
        );
        let done = sqlx::query(&query)
            .bind(queue)
            .bind(job_id)
            .bind(lease as i64)
            .bind(reason)
            .bind(retry_at)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        held(done.rows_affected(), job_id)
    }

    async fn get(&self, queue: &str, job_id: &str) -> Result<Option<JobRecord>> {
        let query = format!(
            "SELECT {COLUMNS} FROM {} WHERE queue = $1 AND id = $2",
            self.table_name
        );
        let row = sqlx::query(&query)
            .bind(queue)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;

        row.as_ref().map(Self::decode).transpose()
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts> {
        let query = format!(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE state = 'waiting' AND (run_at IS NULL OR run_at <= NOW())) AS waiting,
                COUNT(*) FILTER (WHERE state = 'waiting' AND run_at > NOW()) AS delayed,
                COUNT(*) FILTER (WHERE state = 'active') AS active,
                COUNT(*) FILTER (WHERE state = 'completed') AS completed,
                COUNT(*) FILTER (WHERE state = 'failed') AS failed
            FROM {}
            WHERE queue = $1
            "#,
            self.table_name
        );
        let row = sqlx::query(&query)
            .bind(queue)
            .fetch_one(&self.pool)
            .await
            .map_err(backend_err)?;

        let count = |name: &str| -> Result<u64> {
            Ok(row.try_get::<i64, _>(name).map_err(backend_err)?.max(0) as u64)
        };

        Ok(QueueCounts {
            waiting: count("waiting")?,
            active: count("active")?,
            completed: count("completed")?,
            failed: count("failed")?,
            delayed: count("delayed")?,
        })
    }

    async fn recover_stalled(
        &self,
        queue: &str,
        max_stalled_count: u32,
    ) -> Result<Vec<StalledJob>> {
        // SET expressions see the pre-update row
        let query = format!(
            r#"
            UPDATE {}
            SET stalled_count = stalled_count + 1,
                locked_until = NULL,
                state = CASE WHEN stalled_count + 1 > $2 THEN 'failed' ELSE 'waiting' END,
                progress = CASE WHEN stalled_count + 1 > $2 THEN progress ELSE 0 END,
                failure_reason = CASE WHEN stalled_count + 1 > $2 THEN $3 ELSE failure_reason END,
                finished_at = CASE WHEN stalled_count + 1 > $2 THEN NOW() ELSE finished_at END
            WHERE queue = $1
              AND state = 'active'
              AND (locked_until IS NULL OR locked_until < NOW())
            RETURNING id, state
            "#,
            self.table_name
        );
        let rows = sqlx::query(&query)
            .bind(queue)
            .bind(max_stalled_count as i32)
            .bind(STALLED_LIMIT_REASON)
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;

        rows.iter()
            .map(|row| {
                let state: String = row.try_get("state").map_err(backend_err)?;
                Ok(StalledJob {
                    job_id: row.try_get("id").map_err(backend_err)?,
                    requeued: state == JobState::Waiting.as_str(),
                })
            })
            .collect()
    }

    async fn prune(&self, queue: &str, keep_completed: usize, keep_failed: usize) -> Result<u64> {
        let query = format!(
            r#"
            DELETE FROM {t}
            WHERE queue = $1 AND state = $2 AND seq IN (
                SELECT seq FROM {t}
                WHERE queue = $1 AND state = $2
                ORDER BY finished_at DESC, seq DESC
                OFFSET $3
            )
            "#,
            t = self.table_name
        );

        let mut evicted = 0;
        for (state, keep) in [
            (JobState::Completed, keep_completed),
            (JobState::Failed, keep_failed),
        ] {
            let done = sqlx::query(&query)
                .bind(queue)
                .bind(state.as_str())
                .bind(keep as i64)
                .execute(&self.pool)
                .await
                .map_err(backend_err)?;
            evicted += done.rows_affected();
        }
        Ok(evicted)
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
