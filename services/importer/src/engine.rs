//! Import cycle: stream -> parse -> store -> ack.
//!
//! One cycle connects the source, then reads batches until cancelled or
//! until a read fails.  Each entry is handled on its own:
//!
//! | outcome                | insert | ack |
//! |------------------------|--------|-----|
//! | unparseable entry      | no     | yes |
//! | insert failed          | tried  | no  |
//! | stored                 | yes    | yes |
//!
//! An entry is never acked before its row is committed.  A failed ack after
//! a committed insert only risks a duplicate on redelivery.

use crate::BoxFuture;
use crate::db::StoreError;
use crate::shutdown::ShutdownSignal;
use crate::stream::{ConsumerIdentity, StreamEntry, StreamError};
use k8see_event::EventRecord;
use k8see_log::{ActivityLog, LogLevel};
use std::sync::Arc;

/// Entries claimed per read.
pub const READ_BATCH_SIZE: usize = 2;

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

/// Consumer-group access to the event stream.
pub trait EventSource: Send + Sync {
    /// (Re)connect under a fresh identity, replacing any live connection.
    fn connect(&self) -> BoxFuture<'_, Result<ConsumerIdentity, StreamError>>;

    /// Wait for and claim up to `max_count` entries.  Returns an empty batch
    /// once `cancel` fires.
    fn read_batch<'a>(
        &'a self,
        cancel: &'a ShutdownSignal,
        max_count: usize,
    ) -> BoxFuture<'a, Result<Vec<StreamEntry>, StreamError>>;

    fn ack<'a>(&'a self, message_id: &'a str) -> BoxFuture<'a, Result<(), StreamError>>;

    fn close(&self) -> BoxFuture<'_, ()>;
}

/// Durable destination for parsed events.
pub trait EventSink: Send + Sync {
    /// Resolves only once the row is committed.
    fn insert<'a>(&'a self, record: &'a EventRecord) -> BoxFuture<'a, Result<(), StoreError>>;

    fn close(&self) -> BoxFuture<'_, ()>;
}

// ---------------------------------------------------------------------------
// Outcomes and errors
// ---------------------------------------------------------------------------

/// What happened to a single stream entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOutcome {
    /// Inserted and acked.
    Stored,
    /// Inserted, but the ack failed; the entry may be redelivered.
    StoredUnacked,
    /// Unparseable; acked without inserting.
    Discarded,
    /// Insert failed; left pending for redelivery.
    LeftPending,
}

/// Why an import cycle ended early.
#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("stream connect failed: {0}")]
    Connect(#[source] StreamError),
    #[error("stream read failed: {0}")]
    Read(#[source] StreamError),
}

// ---------------------------------------------------------------------------
// ImportEngine
// ---------------------------------------------------------------------------

pub struct ImportEngine {
    source: Arc<dyn EventSource>,
    sink: Arc<dyn EventSink>,
    log: Arc<ActivityLog>,
    batch_size: usize,
}

impl ImportEngine {
    pub fn new(
        source: Arc<dyn EventSource>,
        sink: Arc<dyn EventSink>,
        log: Arc<ActivityLog>,
    ) -> Self {
        ImportEngine {
            source,
            sink,
            log,
            batch_size: READ_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn source(&self) -> &Arc<dyn EventSource> {
        &self.source
    }

    pub fn sink(&self) -> &Arc<dyn EventSink> {
        &self.sink
    }

    /// Run one cycle.  `Ok(())` means the cycle stopped because `cancel`
    /// fired; connect and read failures end the cycle with an error and are
    /// not retried here.
    pub async fn run_cycle(&self, mut cancel: ShutdownSignal) -> Result<(), CycleError> {
        if cancel.is_triggered() {
            return Ok(());
        }
        let identity = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            res = self.source.connect() => res.map_err(CycleError::Connect)?,
        };
        self.log
            .log(format!("import cycle started as consumer {identity}"));

        loop {
            if cancel.is_triggered() {
                self.log.log("import cycle stopping");
                return Ok(());
            }
            let entries = self
                .source
                .read_batch(&cancel, self.batch_size)
                .await
                .map_err(CycleError::Read)?;
            for entry in entries {
                if cancel.is_triggered() {
                    self.log.log_at(
                        LogLevel::Debug,
                        format!("leaving message {} pending at shutdown", entry.id),
                    );
                    continue;
                }
                self.process_entry(entry).await;
            }
        }
    }

    /// Parse, store and ack a single entry.
    pub async fn process_entry(&self, entry: StreamEntry) -> EntryOutcome {
        let record = match EventRecord::from_fields(&entry.fields) {
            Ok(record) => record,
            Err(e) => {
                self.log
                    .log_at(LogLevel::Warn, format!("skipping message {}: {e}", entry.id));
                if let Err(e) = self.source.ack(&entry.id).await {
                    self.log.log_at(
                        LogLevel::Warn,
                        format!("failed to acknowledge skipped message {}: {e}", entry.id),
                    );
                }
                return EntryOutcome::Discarded;
            }
        };

        self.log.log(format!(
            "NEW=> id={} type={} reason={} name={}",
            entry.id, record.event_type, record.reason, record.name
        ));
        self.log.log_at(
            LogLevel::Debug,
            format!(
                "eventTime={} firstTime={} exportedTime={}",
                record.event_time, record.first_time, record.exported_time
            ),
        );

        if let Err(e) = self.sink.insert(&record).await {
            self.log.log_at(
                LogLevel::Error,
                format!("insert failed for message {}, leaving it pending: {e}", entry.id),
            );
            return EntryOutcome::LeftPending;
        }

        match self.source.ack(&entry.id).await {
            Ok(()) => EntryOutcome::Stored,
            Err(e) => {
                self.log.log_at(
                    LogLevel::Warn,
                    format!("failed to acknowledge message {}: {e}", entry.id),
                );
                EntryOutcome::StoredUnacked
            }
        }
    }
}
