//! Background retention purge.
//!
//! Purges once at startup and then every [`PURGE_INTERVAL`] until stopped.
//! A failed purge is logged and left to the next tick; deleting rows that
//! are already gone is a no-op, so there is nothing to recover.

use crate::BoxFuture;
use crate::db::StoreError;
use crate::shutdown::ShutdownSignal;
use k8see_log::{ActivityLog, LogLevel};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

pub const PURGE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Store that can drop events past their retention window.
pub trait RetentionTarget: Send + Sync {
    /// Delete events exported more than `days` days ago; returns rows deleted.
    fn purge_older_than(&self, days: u32) -> BoxFuture<'_, Result<u64, StoreError>>;
}

pub struct RetentionPurger {
    target: Arc<dyn RetentionTarget>,
    retention_days: u32,
    interval: Duration,
    log: Arc<ActivityLog>,
}

impl RetentionPurger {
    pub fn new(
        target: Arc<dyn RetentionTarget>,
        retention_days: u32,
        log: Arc<ActivityLog>,
    ) -> Self {
        RetentionPurger {
            target,
            retention_days,
            interval: PURGE_INTERVAL,
            log,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Tick until `stop` fires.  A purge already under way runs to completion;
    /// no new purge starts once `stop` has been observed.
    pub async fn run(self, mut stop: ShutdownSignal) {
        if stop.is_triggered() {
            return;
        }
        self.purge_once().await;

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    self.log.log("retention purge stopping");
                    return;
                }
                _ = ticker.tick() => {
                    self.purge_once().await;
                }
            }
        }
    }

    /// Run a single purge and log the result.
    pub async fn purge_once(&self) -> Option<u64> {
        match self.target.purge_older_than(self.retention_days).await {
            Ok(deleted) => {
                self.log.log(format!(
                    "retention purge deleted {deleted} rows older than {} days",
                    self.retention_days
                ));
                Some(deleted)
            }
            Err(e) => {
                self.log
                    .log_at(LogLevel::Error, format!("retention purge failed: {e}"));
                None
            }
        }
    }
}
