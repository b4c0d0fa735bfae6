use importer::BoxFuture;
use importer::engine::EventSource;
use importer::shutdown::ShutdownSignal;
use importer::stream::{
    ConsumerIdentity, READ_BLOCK, RECLAIM_MIN_IDLE, RECLAIM_SWEEP_INTERVAL, StreamEntry,
    StreamError,
};
use k8see_event::Fields;
use redis::{ErrorKind, RedisError};
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// In-memory consumer group over a single stream.
///
/// Entries move from the undelivered queue to the pending list when read and
/// leave the pending list when acked.  Like the Redis consumer, the pending
/// list is swept right after `connect` and then every sweep interval, and
/// only entries idle for at least the minimum idle time are claimed again.
/// A blocked read wakes every [`READ_BLOCK`] to check whether a sweep is due.
pub struct MemoryStream {
    state: Mutex<State>,
    wake: Notify,
    min_idle: Duration,
    sweep_every: Duration,
}

struct Pending {
    entry: StreamEntry,
    delivered_at: Instant,
}

#[derive(Default)]
struct State {
    next_seq: u64,
    queue: VecDeque<StreamEntry>,
    pending: Vec<Pending>,
    /// When the next pending-list sweep may run; `None` before any connect.
    sweep_due: Option<Instant>,
    acked: Vec<String>,
    identities: Vec<ConsumerIdentity>,
    connected: bool,
    fail_connects: u32,
    fail_reads: u32,
    fail_acks: HashSet<String>,
    close_count: u32,
}

fn io_error(what: &'static str) -> RedisError {
    RedisError::from((ErrorKind::IoError, what))
}

impl MemoryStream {
    pub fn new() -> Self {
        MemoryStream {
            state: Mutex::new(State::default()),
            wake: Notify::new(),
            min_idle: RECLAIM_MIN_IDLE,
            sweep_every: RECLAIM_SWEEP_INTERVAL,
        }
    }

    /// Override the reclaim thresholds.
    pub fn with_reclaim(mut self, min_idle: Duration, sweep_every: Duration) -> Self {
        self.min_idle = min_idle;
        self.sweep_every = sweep_every;
        self
    }

    /// Append an entry; returns its id.
    pub fn push(&self, fields: Fields) -> String {
        let id = {
            let mut state = self.state.lock().unwrap();
            state.next_seq += 1;
            let id = format!("{}-0", state.next_seq);
            state.queue.push_back(StreamEntry {
                id: id.clone(),
                fields,
            });
            id
        };
        self.wake.notify_one();
        id
    }

    /// Make the next `n` connects fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.state.lock().unwrap().fail_connects = n;
    }

    /// Make the next `n` reads fail and drop the connection.
    pub fn fail_next_reads(&self, n: u32) {
        self.state.lock().unwrap().fail_reads = n;
        self.wake.notify_one();
    }

    /// Break the live connection; a blocked read returns an error.
    pub fn disconnect(&self) {
        self.fail_next_reads(1);
    }

    /// Make every ack of `id` fail.
    pub fn fail_ack(&self, id: &str) {
        self.state.lock().unwrap().fail_acks.insert(id.to_owned());
    }

    pub fn acked(&self) -> Vec<String> {
        self.state.lock().unwrap().acked.clone()
    }

    /// Ids delivered to some consumer and not yet acked.
    pub fn pending_ids(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.pending.iter().map(|p| p.entry.id.clone()).collect()
    }

    /// Ids never delivered.
    pub fn undelivered_ids(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.queue.iter().map(|e| e.id.clone()).collect()
    }

    /// Every identity handed out by `connect`, oldest first.
    pub fn identities(&self) -> Vec<ConsumerIdentity> {
        self.state.lock().unwrap().identities.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    pub fn close_count(&self) -> u32 {
        self.state.lock().unwrap().close_count
    }

    fn try_connect(&self) -> Result<ConsumerIdentity, StreamError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(StreamError::Connect(io_error("connection refused")));
        }
        let identity = ConsumerIdentity::generate();
        state.sweep_due = Some(Instant::now());
        state.identities.push(identity.clone());
        state.connected = true;
        Ok(identity)
    }

    /// Take up to `max_count` entries, idle pending ones first when a sweep
    /// is due.  `Ok(None)` when nothing is available yet.
    fn try_take(&self, max_count: usize) -> Result<Option<Vec<StreamEntry>>, StreamError> {
        let mut state = self.state.lock().unwrap();
        if !state.connected {
            return Err(StreamError::NotConnected);
        }
        if state.fail_reads > 0 {
            state.fail_reads -= 1;
            state.connected = false;
            return Err(StreamError::Read(io_error("connection reset")));
        }

        let now = Instant::now();
        if state.sweep_due.is_some_and(|due| now >= due) {
            let claimed: Vec<StreamEntry> = state
                .pending
                .iter_mut()
                .filter(|p| now.duration_since(p.delivered_at) >= self.min_idle)
                .take(max_count)
                .map(|p| {
                    p.delivered_at = now;
                    p.entry.clone()
                })
                .collect();
            if claimed.len() < max_count {
                state.sweep_due = Some(now + self.sweep_every);
            }
            if !claimed.is_empty() {
                return Ok(Some(claimed));
            }
        }

        let mut batch = Vec::new();
        while batch.len() < max_count {
            let Some(entry) = state.queue.pop_front() else {
                break;
            };
            state.pending.push(Pending {
                entry: entry.clone(),
                delivered_at: now,
            });
            batch.push(entry);
        }
        Ok((!batch.is_empty()).then_some(batch))
    }

    async fn read(
        &self,
        cancel: &ShutdownSignal,
        max_count: usize,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let mut cancel = cancel.clone();
        loop {
            if cancel.is_triggered() {
                return Ok(Vec::new());
            }
            if let Some(batch) = self.try_take(max_count)? {
                return Ok(batch);
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Vec::new()),
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(READ_BLOCK) => {}
            }
        }
    }

    fn try_ack(&self, message_id: &str) -> Result<(), StreamError> {
        let mut state = self.state.lock().unwrap();
        if !state.connected {
            return Err(StreamError::NotConnected);
        }
        if state.fail_acks.contains(message_id) {
            return Err(StreamError::Ack(io_error("ack rejected")));
        }
        if let Some(pos) = state.pending.iter().position(|p| p.entry.id == message_id) {
            state.pending.remove(pos);
            state.acked.push(message_id.to_owned());
        }
        Ok(())
    }
}

impl Default for MemoryStream {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSource for MemoryStream {
    fn connect(&self) -> BoxFuture<'_, Result<ConsumerIdentity, StreamError>> {
        Box::pin(async move { self.try_connect() })
    }

    fn read_batch<'a>(
        &'a self,
        cancel: &'a ShutdownSignal,
        max_count: usize,
    ) -> BoxFuture<'a, Result<Vec<StreamEntry>, StreamError>> {
        Box::pin(self.read(cancel, max_count))
    }

    fn ack<'a>(&'a self, message_id: &'a str) -> BoxFuture<'a, Result<(), StreamError>> {
        Box::pin(async move { self.try_ack(message_id) })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            state.close_count += 1;
            state.connected = false;
        })
    }
}
