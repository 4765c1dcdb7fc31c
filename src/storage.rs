//! Durable event log.
//!
//! [`EventLog`] is the storage contract the event store writes through. The
//! store keeps its own in-memory indices; the log only has to persist events
//! and hand them back on startup.
//!
//! - [`Storage`]: SQLite via sqlx
//! - [`MemoryLog`]: in-process log for tests and simulations
//!
//! Timestamps are stored as Unix nanoseconds so a replayed log reproduces
//! the indexed events exactly. Events outside the i64 nanosecond range
//! (years 1677 to 2262) are rejected before they reach the log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};

use crate::model::{Deployment, DeploymentStatus, Incident};

/// Every event a log holds, in the state of its latest write.
#[derive(Debug, Clone, Default)]
pub struct LoggedEvents {
    pub deployments: Vec<Deployment>,
    pub incidents: Vec<Incident>,
}

#[async_trait]
pub trait EventLog: Send + Sync {
    async fn record_deployment(&self, deployment: &Deployment) -> anyhow::Result<()>;

    /// Persist the terminal status of a previously in-progress deployment.
    async fn record_completion(
        &self,
        id: &str,
        status: DeploymentStatus,
        end_time: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()>;

    async fn record_incident(&self, incident: &Incident) -> anyhow::Result<()>;

    async fn record_resolution(&self, id: &str, resolved_time: DateTime<Utc>)
    -> anyhow::Result<()>;

    async fn load(&self) -> anyhow::Result<LoggedEvents>;

    /// Cheap liveness probe for health checks.
    async fn ping(&self) -> anyhow::Result<()>;
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Create a new storage instance and initialize the schema.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite connection string (e.g., "sqlite:metrichub.db" or "sqlite::memory:")
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        // Every connection to `:memory:` is a separate database
        let max_connections = if database_url.contains(":memory:") {
            1
        } else {
            5
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        let storage = Self { pool };
        storage.initialize_schema().await?;

        Ok(storage)
    }

    /// Create the database schema if it doesn't exist.
    async fn initialize_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS deployments (
                id TEXT PRIMARY KEY,
                service TEXT NOT NULL,
                environment TEXT NOT NULL,
                status TEXT NOT NULL,
                start_ts INTEGER NOT NULL,
                end_ts INTEGER,
                commit_sha TEXT,
                commit_ts INTEGER,
                version TEXT,
                created_ts INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS incidents (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                description TEXT,
                service TEXT NOT NULL,
                environment TEXT NOT NULL,
                severity TEXT NOT NULL,
                start_ts INTEGER NOT NULL,
                resolved_ts INTEGER,
                created_ts INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Index for time-range reads by partition
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_deployments_partition_ts
            ON deployments(service, environment, start_ts)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_incidents_partition_ts
            ON incidents(service, environment, start_ts)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_deployments(&self) -> anyhow::Result<Vec<Deployment>> {
        let rows = sqlx::query(
            r#"
            SELECT id, service, environment, status, start_ts, end_ts,
                   commit_sha, commit_ts, version, created_ts
            FROM deployments
            ORDER BY start_ts, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(deployment_from_row).collect()
    }

    async fn load_incidents(&self) -> anyhow::Result<Vec<Incident>> {
        let rows = sqlx::query(
            r#"
            SELECT id, title, description, service, environment, severity,
                   start_ts, resolved_ts, created_ts
            FROM incidents
            ORDER BY start_ts, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(incident_from_row).collect()
    }
}

#[async_trait]
impl EventLog for Storage {
    async fn record_deployment(&self, deployment: &Deployment) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO deployments (id, service, environment, status, start_ts, end_ts,
                                     commit_sha, commit_ts, version, created_ts)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&deployment.id)
        .bind(&deployment.service)
        .bind(&deployment.environment)
        .bind(deployment.status.as_str())
        .bind(to_nanos(deployment.start_time)?)
        .bind(optional_nanos(deployment.end_time)?)
        .bind(&deployment.commit_sha)
        .bind(optional_nanos(deployment.commit_time)?)
        .bind(&deployment.version)
        .bind(to_nanos(deployment.created_at)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_completion(
        &self,
        id: &str,
        status: DeploymentStatus,
        end_time: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE deployments
            SET status = ?, end_ts = ?
            WHERE id = ? AND status = 'in_progress'
            "#,
        )
        .bind(status.as_str())
        .bind(optional_nanos(end_time)?)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            anyhow::bail!("no in-progress deployment {id} in the log");
        }
        Ok(())
    }

    async fn record_incident(&self, incident: &Incident) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO incidents (id, title, description, service, environment, severity,
                                   start_ts, resolved_ts, created_ts)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&incident.id)
        .bind(&incident.title)
        .bind(&incident.description)
        .bind(&incident.service)
        .bind(&incident.environment)
        .bind(incident.severity.as_str())
        .bind(to_nanos(incident.start_time)?)
        .bind(optional_nanos(incident.resolved_time)?)
        .bind(to_nanos(incident.created_at)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_resolution(
        &self,
        id: &str,
        resolved_time: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE incidents
            SET resolved_ts = ?
            WHERE id = ? AND resolved_ts IS NULL
            "#,
        )
        .bind(to_nanos(resolved_time)?)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            anyhow::bail!("no open incident {id} in the log");
        }
        Ok(())
    }

    async fn load(&self) -> anyhow::Result<LoggedEvents> {
        Ok(LoggedEvents {
            deployments: self.load_deployments().await?,
            incidents: self.load_incidents().await?,
        })
    }

    async fn ping(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn to_nanos(at: DateTime<Utc>) -> anyhow::Result<i64> {
    at.timestamp_nanos_opt()
        .ok_or_else(|| anyhow::anyhow!("timestamp {at} cannot be stored in nanoseconds"))
}

fn optional_nanos(at: Option<DateTime<Utc>>) -> anyhow::Result<Option<i64>> {
    at.map(to_nanos).transpose()
}

fn deployment_from_row(row: &SqliteRow) -> anyhow::Result<Deployment> {
    let status: String = row.try_get("status")?;
    Ok(Deployment {
        id: row.try_get("id")?,
        service: row.try_get("service")?,
        environment: row.try_get("environment")?,
        status: status.parse()?,
        start_time: DateTime::from_timestamp_nanos(row.try_get("start_ts")?),
        end_time: row.try_get::<Option<i64>, _>("end_ts")?.map(DateTime::from_timestamp_nanos),
        commit_sha: row.try_get("commit_sha")?,
        commit_time: row.try_get::<Option<i64>, _>("commit_ts")?.map(DateTime::from_timestamp_nanos),
        version: row.try_get("version")?,
        created_at: DateTime::from_timestamp_nanos(row.try_get("created_ts")?),
    })
}

fn incident_from_row(row: &SqliteRow) -> anyhow::Result<Incident> {
    let severity: String = row.try_get("severity")?;
    Ok(Incident {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        service: row.try_get("service")?,
        environment: row.try_get("environment")?,
        severity: severity.parse()?,
        start_time: DateTime::from_timestamp_nanos(row.try_get("start_ts")?),
        resolved_time: row.try_get::<Option<i64>, _>("resolved_ts")?.map(DateTime::from_timestamp_nanos),
        created_at: DateTime::from_timestamp_nanos(row.try_get("created_ts")?),
    })
}

/// In-memory [`EventLog`].
///
/// Can be pre-seeded with events (see [`crate::fixtures`]) so an engine
/// opened over it starts from a known, deterministic history.
#[derive(Debug, Default)]
pub struct MemoryLog {
    events: Mutex<LoggedEvents>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(events: LoggedEvents) -> Self {
        Self {
            events: Mutex::new(events),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LoggedEvents> {
        self.events.lock()
    }
}

#[async_trait]
impl EventLog for MemoryLog {
    async fn record_deployment(&self, deployment: &Deployment) -> anyhow::Result<()> {
        self.lock().deployments.push(deployment.clone());
        Ok(())
    }

    async fn record_completion(
        &self,
        id: &str,
        status: DeploymentStatus,
        end_time: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()> {
        let mut events = self.lock();
        let deployment = events
            .deployments
            .iter_mut()
            .find(|d| d.id == id && d.status == DeploymentStatus::InProgress)
            .ok_or_else(|| anyhow::anyhow!("no in-progress deployment {id} in the log"))?;
        deployment.status = status;
        deployment.end_time = end_time;
        Ok(())
    }

    async fn record_incident(&self, incident: &Incident) -> anyhow::Result<()> {
        self.lock().incidents.push(incident.clone());
        Ok(())
    }

    async fn record_resolution(
        &self,
        id: &str,
        resolved_time: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let mut events = self.lock();
        let incident = events
            .incidents
            .iter_mut()
            .find(|i| i.id == id && i.resolved_time.is_none())
            .ok_or_else(|| anyhow::anyhow!("no open incident {id} in the log"))?;
        incident.resolved_time = Some(resolved_time);
        Ok(())
    }

    async fn load(&self) -> anyhow::Result<LoggedEvents> {
        Ok(self.lock().clone())
    }

    async fn ping(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
