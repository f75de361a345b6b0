use crate::config::DatabaseConfig;
use crate::records::{DetectionRecord, Record, StatusRecord};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgPool, PgPoolOptions};
use sqlx::{Connection, Executor, Postgres, QueryBuilder};
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Postgres accepts at most this many bind parameters per statement
const PG_BIND_LIMIT: usize = 65535;

const DETECTION_COLUMNS: usize = 4;
const STATUS_COLUMNS: usize = 3;

/// SQLSTATE `duplicate_database`
const DUPLICATE_DATABASE: &str = "42P04";

/// SQLSTATE `unique_violation`, raised on `pg_database` when two creators race
const UNIQUE_VIOLATION: &str = "23505";

/// Tables and indexes created at startup. Every statement is idempotent.
pub const SCHEMA_STATEMENTS: [&str; 6] = [
    r#"
    CREATE TABLE IF NOT EXISTS objects_detection (
        vehicle_id TEXT,
        detection_time TEXT,
        object_type TEXT,
        object_value INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS vehicles_status (
        vehicle_id TEXT,
        report_time TEXT,
        status TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_vehicle_id ON objects_detection (vehicle_id)",
    "CREATE INDEX IF NOT EXISTS idx_detection_time ON objects_detection (detection_time)",
    "CREATE INDEX IF NOT EXISTS idx_vehicle_status_id ON vehicles_status (vehicle_id)",
    "CREATE INDEX IF NOT EXISTS idx_report_time ON vehicles_status (report_time)",
];

/// Errors surfaced by the store layer
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// No pooled connection became free within `acquire_timeout`.
    ///
    /// This is backpressure rather than a failed write: nothing was sent to
    /// the database.
    pub fn is_pool_exhausted(&self) -> bool {
        matches!(self, StoreError::Database(sqlx::Error::PoolTimedOut))
    }
}

/// Transactional sink for record batches.
///
/// Each call commits all of `rows` or none of them.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn insert_detection_batch(&self, rows: &[DetectionRecord]) -> Result<(), StoreError>;

    async fn insert_status_batch(&self, rows: &[StatusRecord]) -> Result<(), StoreError>;
}

/// Routes a record type to its insert method on a [`RecordSink`].
#[async_trait]
pub trait Persist: Record + Sized {
    async fn persist<S: RecordSink + ?Sized>(sink: &S, rows: &[Self]) -> Result<(), StoreError>;
}

#[async_trait]
impl Persist for DetectionRecord {
    async fn persist<S: RecordSink + ?Sized>(sink: &S, rows: &[Self]) -> Result<(), StoreError> {
        sink.insert_detection_batch(rows).await
    }
}

#[async_trait]
impl Persist for StatusRecord {
    async fn persist<S: RecordSink + ?Sized>(sink: &S, rows: &[Self]) -> Result<(), StoreError> {
        sink.insert_status_batch(rows).await
    }
}

/// PostgreSQL-backed record store over a connection pool
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create the target database if needed, then open the pool.
    ///
    /// Writers wait up to `acquire_timeout` for a free connection per try; the
    /// retrying writer keeps waiting on timeout without spending an attempt.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let created = ensure_database(config).await?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect_with(connect_options(config, &config.name))
            .await?;

        info!(
            host = %config.host,
            port = config.port,
            database = %config.name,
            created_database = created,
            "Connected to PostgreSQL database"
        );

        Ok(Self { pool })
    }

    /// Create tables and indexes if absent. Safe to call repeatedly.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA_STATEMENTS {
            self.pool.execute(statement).await?;
        }
        info!("Schema ready");
        Ok(())
    }

    /// Close every pooled connection
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Database pool closed");
    }

    /// Get the connection pool (for health checks)
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl RecordSink for PgStore {
    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn insert_detection_batch(&self, rows: &[DetectionRecord]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for chunk in rows.chunks(PG_BIND_LIMIT / DETECTION_COLUMNS) {
            let mut query = QueryBuilder::<Postgres>::new(
                "INSERT INTO objects_detection (vehicle_id, detection_time, object_type, object_value) ",
            );
            query.push_values(chunk, |mut row, record| {
                row.push_bind(record.vehicle_id.as_str())
                    .push_bind(record.detection_time.as_str())
                    .push_bind(record.object_type.as_str())
                    .push_bind(record.object_value);
            });
            query.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;

        debug!("Detection batch committed");
        Ok(())
    }

    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn insert_status_batch(&self, rows: &[StatusRecord]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for chunk in rows.chunks(PG_BIND_LIMIT / STATUS_COLUMNS) {
            let mut query = QueryBuilder::<Postgres>::new(
                "INSERT INTO vehicles_status (vehicle_id, report_time, status) ",
            );
            query.push_values(chunk, |mut row, record| {
                row.push_bind(record.vehicle_id.as_str())
                    .push_bind(record.report_time.as_str())
                    .push_bind(record.status.as_str());
            });
            query.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;

        debug!("Status batch committed");
        Ok(())
    }
}

fn connect_options(config: &DatabaseConfig, database: &str) -> PgConnectOptions {
    PgConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .username(&config.user)
        .password(&config.password)
        .database(database)
}

/// Create the target database through the maintenance database when missing.
/// Returns whether this call created it.
async fn ensure_database(config: &DatabaseConfig) -> Result<bool, StoreError> {
    let mut conn =
        PgConnection::connect_with(&connect_options(config, &config.maintenance_database)).await?;

    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(&config.name)
            .fetch_one(&mut conn)
            .await?;

    let mut created = false;
    if !exists {
        let statement = format!("CREATE DATABASE {}", quote_identifier(&config.name));
        match conn.execute(statement.as_str()).await {
            Ok(_) => {
                info!(database = %config.name, "Created database");
                created = true;
            }
            Err(sqlx::Error::Database(e)) if created_concurrently(e.code().as_deref()) => {
                debug!(database = %config.name, "Database created concurrently");
            }
            Err(e) => return Err(e.into()),
        }
    }

    conn.close().await?;
    Ok(created)
}

fn created_concurrently(code: Option<&str>) -> bool {
    matches!(code, Some(DUPLICATE_DATABASE) | Some(UNIQUE_VIOLATION))
}

/// Quote a Postgres identifier, doubling embedded quotes
fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
