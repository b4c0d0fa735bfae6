use chrono::Utc;
use importer::BoxFuture;
use importer::db::StoreError;
use importer::engine::EventSink;
use importer::purge::RetentionTarget;
use k8see_event::EventRecord;
use std::sync::Mutex;

/// In-memory event store that can be switched into an outage.
pub struct MemorySink {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    rows: Vec<EventRecord>,
    failing: bool,
    insert_attempts: u32,
    purge_calls: Vec<u32>,
    fail_purges: u32,
    closed: bool,
}

fn outage() -> StoreError {
    StoreError::Query(sqlx::Error::PoolTimedOut)
}

impl MemorySink {
    pub fn new() -> Self {
        MemorySink {
            state: Mutex::new(State::default()),
        }
    }

    /// While set, every insert fails.
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().unwrap().failing = failing;
    }

    /// Make the next `n` purges fail.
    pub fn fail_next_purges(&self, n: u32) {
        self.state.lock().unwrap().fail_purges = n;
    }

    pub fn rows(&self) -> Vec<EventRecord> {
        self.state.lock().unwrap().rows.clone()
    }

    pub fn insert_attempts(&self) -> u32 {
        self.state.lock().unwrap().insert_attempts
    }

    /// Retention argument of every purge attempted, failed ones included.
    pub fn purge_calls(&self) -> Vec<u32> {
        self.state.lock().unwrap().purge_calls.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    fn try_insert(&self, record: &EventRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.insert_attempts += 1;
        if state.closed {
            return Err(StoreError::Closed);
        }
        if state.failing {
            return Err(outage());
        }
        state.rows.push(record.clone());
        Ok(())
    }

    fn try_purge(&self, days: u32) -> Result<u64, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.purge_calls.push(days);
        if days == 0 {
            return Err(StoreError::InvalidRetention(days));
        }
        if state.fail_purges > 0 {
            state.fail_purges -= 1;
            return Err(outage());
        }
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
        let before = state.rows.len();
        state.rows.retain(|r| r.exported_time >= cutoff);
        Ok((before - state.rows.len()) as u64)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for MemorySink {
    fn insert<'a>(&'a self, record: &'a EventRecord) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move { self.try_insert(record) })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.state.lock().unwrap().closed = true;
        })
    }
}

impl RetentionTarget for MemorySink {
    fn purge_older_than(&self, days: u32) -> BoxFuture<'_, Result<u64, StoreError>> {
        Box::pin(async move { self.try_purge(days) })
    }
}
