//! Transactional job queue on SQLite.
//!
//! A job is leased by a single `UPDATE ... RETURNING` statement, so two
//! workers can never receive the same job. A lease that is neither completed
//! nor failed within the expiry window counts as a failed attempt and the job
//! is handed out again.

use std::str::FromStr as _;

use sqlx::FromRow;
use tracing::{debug, error, warn};

use super::{Job, JobId, JobQueue, TileJob};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] sqlx::Error),
    #[error("failed to encode job payload: {0}")]
    Encode(serde_json::Error),
}

pub struct SqliteQueue {
    pool: sqlx::SqlitePool,
    name: String,
    retry_limit: u32,
    retry_delay: u64,
    expire_secs: u64,
}

/// Snapshot of a job row, for inspection.
#[derive(FromRow, Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub id: JobId,
    pub state: String,
    pub retry_count: i64,
    pub output: Option<String>,
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

impl SqliteQueue {
    pub async fn open(url: &str, name: impl Into<String>) -> Result<Self, Error> {
        let options = sqlx::sqlite::SqliteConnectOptions::from_str(url)
            .inspect_err(|error| error!(%error, %url, "Failed to open queue db"))?
            .create_if_missing(true);
        let pool = sqlx::pool::PoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .inspect_err(|error| error!(%error, %url, "Failed to open queue db"))?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS job(
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                data TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'created',
                retry_count INTEGER NOT NULL DEFAULT 0,
                retry_limit INTEGER NOT NULL,
                start_after INTEGER NOT NULL,
                output TEXT,
                created_on INTEGER NOT NULL,
                started_on INTEGER,
                completed_on INTEGER
            );

            CREATE INDEX IF NOT EXISTS job_fetch ON job(name, state, start_after);
        "#,
        )
        .execute(&pool)
        .await
        .inspect_err(|error| error!(%error, %url, "Failed to execute DDL to queue db"))?;
        Ok(Self {
            pool,
            name: name.into(),
            retry_limit: 3,
            retry_delay: 0,
            expire_secs: 3600,
        })
    }

    /// Failed jobs are retried up to `limit` times, each no sooner than
    /// `delay_secs` after the failure.
    pub fn with_retry(self, limit: u32, delay_secs: u64) -> Self {
        Self {
            retry_limit: limit,
            retry_delay: delay_secs,
            ..self
        }
    }

    /// Active jobs leased more than `secs` ago are reclaimed on the next fetch.
    pub fn with_expiry(self, secs: u64) -> Self {
        Self {
            expire_secs: secs,
            ..self
        }
    }

    pub async fn enqueue(&self, job: &TileJob) -> Result<JobId, Error> {
        let data = serde_json::to_string(job).map_err(Error::Encode)?;
        self.enqueue_raw(&data).await
    }

    async fn enqueue_raw(&self, data: &str) -> Result<JobId, Error> {
        let now = now();
        let (id,): (JobId,) = sqlx::query_as(
            r#"
            INSERT INTO job(name, data, retry_limit, start_after, created_on)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id
        "#,
        )
        .bind(&self.name)
        .bind(data)
        .bind(self.retry_limit as i64)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        debug!(id, queue = self.name, "job enqueued");
        Ok(id)
    }

    pub async fn job(&self, id: JobId) -> Result<Option<JobRecord>, Error> {
        let record = sqlx::query_as::<_, JobRecord>(
            "SELECT id, state, retry_count, output FROM job WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn reclaim_expired(&self, now: i64) -> Result<(), Error> {
        let expired = sqlx::query(
            r#"
            UPDATE job
            SET
                state = CASE WHEN retry_count < retry_limit THEN 'retry' ELSE 'failed' END,
                retry_count = retry_count + 1,
                output = 'lease expired',
                completed_on = CASE WHEN retry_count < retry_limit THEN NULL ELSE ? END
            WHERE name = ? AND state = 'active' AND started_on <= ?
        "#,
        )
        .bind(now)
        .bind(&self.name)
        .bind(now.saturating_sub(self.expire_secs as i64))
        .execute(&self.pool)
        .await?
        .rows_affected();
        if expired > 0 {
            warn!(expired, queue = self.name, "reclaimed expired leases");
        }
        Ok(())
    }

    async fn lease(&self) -> Result<Option<(JobId, String)>, Error> {
        let now = now();
        self.reclaim_expired(now).await?;
        let row = sqlx::query_as::<_, (JobId, String)>(
            r#"
            UPDATE job
            SET state = 'active', started_on = ?
            WHERE id = (
                SELECT id FROM job
                WHERE name = ? AND state IN ('created', 'retry') AND start_after <= ?
                ORDER BY id
                LIMIT 1
            )
            RETURNING id, data
        "#,
        )
        .bind(now)
        .bind(&self.name)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn reject(&self, id: JobId, error: &str) -> Result<(), Error> {
        sqlx::query("UPDATE job SET state = 'failed', output = ?, completed_on = ? WHERE id = ?")
            .bind(error)
            .bind(now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

impl JobQueue for SqliteQueue {
    type Error = Error;

    async fn fetch(&self) -> Result<Option<Job>, Self::Error> {
        while let Some((id, data)) = self.lease().await? {
            match serde_json::from_str::<TileJob>(&data) {
                Ok(data) => return Ok(Some(Job { id, data })),
                Err(error) => {
                    warn!(id, %error, "discarding job with malformed payload");
                    self.reject(id, &format!("malformed payload: {error}"))
                        .await?;
                }
            }
        }
        Ok(None)
    }

    async fn complete(&self, id: JobId) -> Result<(), Self::Error> {
        sqlx::query(
            "UPDATE job SET state = 'completed', output = NULL, completed_on = ? WHERE id = ?",
        )
        .bind(now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail(&self, id: JobId, error: &str) -> Result<(), Self::Error> {
        let now = now();
        sqlx::query(
            r#"
            UPDATE job
            SET
                state = CASE WHEN retry_count < retry_limit THEN 'retry' ELSE 'failed' END,
                retry_count = retry_count + 1,
                start_after = ?,
                output = ?,
                completed_on = CASE WHEN retry_count < retry_limit THEN NULL ELSE ? END
            WHERE id = ?
        "#,
        )
        .bind(now + self.retry_delay as i64)
        .bind(error)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
