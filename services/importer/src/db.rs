//! PostgreSQL event store.
//!
//! [`Store`] owns one connection pool behind a mutex.  Callers never see the
//! pool: every operation takes a handle under the guard, and a reconnect
//! swaps the pool under the same guard, so no caller can use a pool that is
//! being torn down.
//!
//! Pooled connections are not pinged on acquire.  When an insert or purge
//! fails because its connection was lost, or fails and a follow-up health
//! check fails too, the store reconnects and retries the operation once.

use crate::BoxFuture;
use crate::engine::EventSink;
use crate::purge::RetentionTarget;
use k8see_event::EventRecord;
use k8see_log::{ActivityLog, LogLevel};
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;

/// Pool open attempts before a connect error is surfaced.
pub const CONNECT_ATTEMPTS: u32 = 3;
/// Delay between connect attempts and between startup polls.
pub const RETRY_DELAY: Duration = Duration::from_millis(200);
/// How long startup waits for the database to accept connections.
pub const STARTUP_DEADLINE: Duration = Duration::from_secs(30);

const MAX_CONNECTIONS: u32 = 25;
const MAX_LIFETIME: Duration = Duration::from_secs(5 * 60);
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

const INSERT_EVENT: &str = r#"INSERT INTO k8sevents
    (exportedtime, firsttime, eventtime, name, reason, type, message, namespace)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#;

const PURGE_EVENTS: &str =
    "DELETE FROM k8sevents WHERE exportedtime < now() - make_interval(days => $1)";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database unreachable: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("database not ready after {0:?}")]
    Timeout(Duration),
    #[error("query failed: {0}")]
    Query(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("retention must be a positive number of days, got {0}")]
    InvalidRetention(u32),
    #[error("store is closed")]
    Closed,
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

/// Poll the database until it accepts a connection or `deadline` passes.
pub async fn wait_for_store(
    options: &PgConnectOptions,
    deadline: Duration,
    log: &ActivityLog,
) -> Result<(), StoreError> {
    log.log("waiting for database connection");
    let poll = async {
        loop {
            match open_pool(options, 1).await {
                Ok(pool) => {
                    pool.close().await;
                    return;
                }
                Err(e) => {
                    log.log_at(LogLevel::Debug, format!("database not ready yet: {e}"));
                    sleep(RETRY_DELAY).await;
                }
            }
        }
    };
    tokio::time::timeout(deadline, poll)
        .await
        .map_err(|_| StoreError::Timeout(deadline))?;
    log.log("database is ready");
    Ok(())
}

async fn open_pool(
    options: &PgConnectOptions,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .max_lifetime(MAX_LIFETIME)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .test_before_acquire(false)
        .connect_with(options.clone())
        .await?;
    if let Err(e) = ping(&pool).await {
        pool.close().await;
        return Err(e);
    }
    Ok(pool)
}

async fn connect_with_retry(
    options: &PgConnectOptions,
    log: &ActivityLog,
) -> Result<PgPool, StoreError> {
    let mut attempt = 1;
    loop {
        match open_pool(options, MAX_CONNECTIONS).await {
            Ok(pool) => return Ok(pool),
            Err(e) if attempt < CONNECT_ATTEMPTS => {
                log.log_at(
                    LogLevel::Warn,
                    format!("database connect attempt {attempt}/{CONNECT_ATTEMPTS} failed: {e}"),
                );
                attempt += 1;
                sleep(RETRY_DELAY).await;
            }
            Err(e) => return Err(StoreError::Connect(e)),
        }
    }
}

async fn ping(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Errors that mean the connection itself is gone: transport failures, pool
/// exhaustion, and SQLSTATE classes 08 (connection exception) and 57P
/// (operator intervention, such as a terminated backend).
fn is_connection_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db) => db
            .code()
            .is_some_and(|code| code.starts_with("08") || code.starts_with("57P")),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct Store {
    options: PgConnectOptions,
    pool: Mutex<Option<PgPool>>,
    log: Arc<ActivityLog>,
}

impl Store {
    /// Open the pool, retrying up to [`CONNECT_ATTEMPTS`] times.
    pub async fn connect(
        options: PgConnectOptions,
        log: Arc<ActivityLog>,
    ) -> Result<Self, StoreError> {
        let pool = connect_with_retry(&options, &log).await?;
        log.log("connected to database");
        Ok(Store {
            options,
            pool: Mutex::new(Some(pool)),
            log,
        })
    }

    /// Apply pending schema migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        let pool = self.pool().await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        self.log.log("database migrations applied");
        Ok(())
    }

    /// Lightweight liveness check.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let pool = self.pool().await?;
        ping(&pool).await?;
        Ok(())
    }

    /// Replace the pool with a freshly opened one.
    pub async fn reconnect(&self) -> Result<(), StoreError> {
        let mut guard = self.pool.lock().await;
        if guard.is_none() {
            return Err(StoreError::Closed);
        }
        let fresh = connect_with_retry(&self.options, &self.log).await?;
        let old = guard.replace(fresh);
        drop(guard);
        if let Some(old) = old {
            old.close().await;
        }
        self.log.log("reconnected to database");
        Ok(())
    }

    /// Durably write one event.  Returns only after the row is committed.
    pub async fn insert(&self, record: &EventRecord) -> Result<(), StoreError> {
        let pool = self.pool().await?;
        match insert_row(&pool, record).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let pool = self.recover(err).await?;
                insert_row(&pool, record).await?;
                Ok(())
            }
        }
    }

    /// Delete every event exported more than `days` days ago.
    pub async fn purge_older_than(&self, days: u32) -> Result<u64, StoreError> {
        let days_param = i32::try_from(days)
            .ok()
            .filter(|d| *d >= 1)
            .ok_or(StoreError::InvalidRetention(days))?;
        let pool = self.pool().await?;
        match purge_rows(&pool, days_param).await {
            Ok(deleted) => Ok(deleted),
            Err(err) => {
                let pool = self.recover(err).await?;
                Ok(purge_rows(&pool, days_param).await?)
            }
        }
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let pool = self.pool().await?;
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM k8sevents")
            .fetch_one(&pool)
            .await?;
        Ok(n)
    }

    /// Close the pool.  Safe to call more than once.
    pub async fn close(&self) {
        let pool = self.pool.lock().await.take();
        if let Some(pool) = pool {
            pool.close().await;
            self.log.log("database connection closed");
        }
    }

    async fn pool(&self) -> Result<PgPool, StoreError> {
        self.pool.lock().await.clone().ok_or(StoreError::Closed)
    }

    /// After a failed operation: surface `err` if it is a query error and the
    /// database is healthy, otherwise reconnect and hand back the new pool
    /// for a single retry.
    async fn recover(&self, err: sqlx::Error) -> Result<PgPool, StoreError> {
        let pool = self.pool().await?;
        if !is_connection_error(&err) && ping(&pool).await.is_ok() {
            return Err(StoreError::Query(err));
        }
        self.log.log_at(LogLevel::Warn, format!("database connection lost ({err}); reconnecting"));
        self.reconnect().await?;
        self.pool().await
    }
}

async fn insert_row(pool: &PgPool, record: &EventRecord) -> Result<(), sqlx::Error> {
    sqlx::query(INSERT_EVENT)
        .bind(record.exported_time)
        .bind(record.first_time)
        .bind(record.event_time)
        .bind(&record.name)
        .bind(&record.reason)
        .bind(&record.event_type)
        .bind(&record.message)
        .bind(&record.namespace)
        .execute(pool)
        .await?;
    Ok(())
}

async fn purge_rows(pool: &PgPool, days: i32) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(PURGE_EVENTS).bind(days).execute(pool).await?;
    Ok(result.rows_affected())
}

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

impl EventSink for Store {
    fn insert<'a>(&'a self, record: &'a EventRecord) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move { Store::insert(self, record).await })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move { Store::close(self).await })
    }
}

impl RetentionTarget for Store {
    fn purge_older_than(&self, days: u32) -> BoxFuture<'_, Result<u64, StoreError>> {
        Box::pin(async move { Store::purge_older_than(self, days).await })
    }
}
