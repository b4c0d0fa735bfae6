//! Restart loop and service lifecycle.
//!
//! Startup order: wait for the database, open the store, apply migrations,
//! start the retention purger, start the import restart loop.
//!
//! Shutdown order: stop the restart loop and wait up to the grace period for
//! the running cycle, then stop the purger, then close the stream and store.

use crate::config::ImporterConfig;
use crate::db::{self, Store, StoreError};
use crate::engine::{EventSink, EventSource, ImportEngine};
use crate::purge::{PURGE_INTERVAL, RetentionPurger, RetentionTarget};
use crate::shutdown::{Shutdown, ShutdownSignal};
use crate::stream::{StreamConsumer, StreamSettings};
use k8see_log::{ActivityLog, LogLevel};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Pause between a failed import cycle and the next one.
pub const RESTART_DELAY: Duration = Duration::from_secs(2);
/// How long shutdown waits for the running cycle to return.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Runs import cycles back to back, pausing after each failure.
pub struct Supervisor {
    engine: ImportEngine,
    restart_delay: Duration,
    log: Arc<ActivityLog>,
}

impl Supervisor {
    pub fn new(engine: ImportEngine, log: Arc<ActivityLog>) -> Self {
        Supervisor {
            engine,
            restart_delay: RESTART_DELAY,
            log,
        }
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    /// Loop until `cancel` fires.  Returns the number of cycles started.
    pub async fn run(&self, mut cancel: ShutdownSignal) -> u64 {
        let mut cycles = 0;
        loop {
            if cancel.is_triggered() {
                break;
            }
            cycles += 1;
            match self.engine.run_cycle(cancel.clone()).await {
                Ok(()) => {
                    if cancel.is_triggered() {
                        break;
                    }
                }
                Err(e) => {
                    self.log.log_at(
                        LogLevel::Error,
                        format!(
                            "import cycle failed: {e}; restarting in {}s",
                            self.restart_delay.as_secs_f64()
                        ),
                    );
                }
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = sleep(self.restart_delay) => {}
            }
        }
        self.log.log("import loop stopped");
        cycles
    }
}

// ---------------------------------------------------------------------------
// Service lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub retention_days: u32,
    pub batch_size: usize,
    pub restart_delay: Duration,
    pub purge_interval: Duration,
    pub shutdown_grace: Duration,
}

impl ServiceSettings {
    pub fn new(retention_days: u32) -> Self {
        ServiceSettings {
            retention_days,
            batch_size: crate::engine::READ_BATCH_SIZE,
            restart_delay: RESTART_DELAY,
            purge_interval: PURGE_INTERVAL,
            shutdown_grace: SHUTDOWN_GRACE,
        }
    }
}

/// Handle to a running importer.
pub struct ServiceHandle {
    stop: Shutdown,
    purge_stop: Shutdown,
    import_task: JoinHandle<u64>,
    purge_task: JoinHandle<()>,
    source: Arc<dyn EventSource>,
    sink: Arc<dyn EventSink>,
    shutdown_grace: Duration,
    log: Arc<ActivityLog>,
}

impl ServiceHandle {
    /// Stop the import loop from starting or continuing cycles.  Idempotent.
    pub fn cancel(&self) {
        if self.stop.trigger() {
            self.log.log("shutdown requested");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.import_task.is_finished()
    }

    /// Cancel, wait for the import loop within the grace period, stop the
    /// purger, then release the stream and store connections.
    pub async fn shutdown(self) {
        self.cancel();

        let mut import_task = self.import_task;
        match tokio::time::timeout(self.shutdown_grace, &mut import_task).await {
            Ok(Ok(cycles)) => self
                .log
                .log(format!("import loop exited after {cycles} cycles")),
            Ok(Err(e)) => self
                .log
                .log_at(LogLevel::Error, format!("import loop task failed: {e}")),
            Err(_) => {
                self.log.log_at(
                    LogLevel::Warn,
                    format!(
                        "import loop did not stop within {:?}; aborting it",
                        self.shutdown_grace
                    ),
                );
                import_task.abort();
            }
        }

        self.purge_stop.trigger();
        if let Err(e) = self.purge_task.await {
            self.log
                .log_at(LogLevel::Error, format!("retention purge task failed: {e}"));
        }

        self.source.close().await;
        self.sink.close().await;
        self.log.log("shutdown complete");
    }
}

/// Start the purger and the import loop over already-opened collaborators.
pub fn spawn(
    source: Arc<dyn EventSource>,
    sink: Arc<dyn EventSink>,
    retention: Arc<dyn RetentionTarget>,
    settings: ServiceSettings,
    log: Arc<ActivityLog>,
) -> ServiceHandle {
    let stop = Shutdown::new();
    let purge_stop = Shutdown::new();

    let purger = RetentionPurger::new(retention, settings.retention_days, log.clone())
        .with_interval(settings.purge_interval);
    let purge_task = tokio::spawn(purger.run(purge_stop.subscribe()));

    let engine = ImportEngine::new(source.clone(), sink.clone(), log.clone())
        .with_batch_size(settings.batch_size);
    let supervisor =
        Supervisor::new(engine, log.clone()).with_restart_delay(settings.restart_delay);
    let cancel = stop.subscribe();
    let import_task = tokio::spawn(async move { supervisor.run(cancel).await });

    ServiceHandle {
        stop,
        purge_stop,
        import_task,
        purge_task,
        source,
        sink,
        shutdown_grace: settings.shutdown_grace,
        log,
    }
}

/// Bring up the importer described by `config`.
///
/// Fails only if the database cannot be reached within
/// [`db::STARTUP_DEADLINE`] or migrations fail.
pub async fn start(
    config: &ImporterConfig,
    log: Arc<ActivityLog>,
) -> Result<ServiceHandle, StoreError> {
    let options = config.database.connect_options();
    db::wait_for_store(&options, db::STARTUP_DEADLINE, &log).await?;
    let store = Arc::new(Store::connect(options, log.clone()).await?);
    if let Err(e) = store.migrate().await {
        store.close().await;
        return Err(e);
    }

    let consumer = Arc::new(StreamConsumer::new(
        StreamSettings::new(config.redis.url(), config.redis.stream.clone()),
        log.clone(),
    ));
    log.log(format!(
        "importing stream {} with {} day retention",
        config.redis.stream, config.retention_days
    ));
    Ok(spawn(
        consumer,
        store.clone(),
        store,
        ServiceSettings::new(config.retention_days),
        log,
    ))
}
