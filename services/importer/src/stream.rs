//! Redis stream consumer.
//!
//! Reads one stream as a member of the `k8see-consumer-group` consumer group.
//!
//! # Protocol
//! 1. `PING`, then `XGROUP CREATE <stream> <group> 0 MKSTREAM` (`BUSYGROUP`
//!    means the group already exists and is fine)
//! 2. A fresh [`ConsumerIdentity`] is generated for every connect
//! 3. The group's pending list is swept with `XAUTOCLAIM` right after
//!    connecting and again every [`RECLAIM_SWEEP_INTERVAL`]; entries idle for
//!    at least [`RECLAIM_MIN_IDLE`] are claimed by this identity, including
//!    its own entries whose insert failed earlier
//! 4. New entries are read with `XREADGROUP ... >`; each stays pending until
//!    `XACK`
//!
//! Redis 6.2 answers `XAUTOCLAIM` with nil entries for pending ids whose
//! entry was deleted from the stream.  Those are skipped, and acked when the
//! reply still carries their id.
//!
//! The live connection sits behind a mutex held for the duration of each
//! read or ack, so a reconnect or close never tears a connection out from
//! under an in-flight command.

use crate::BoxFuture;
use crate::engine::EventSource;
use crate::shutdown::ShutdownSignal;
use k8see_event::Fields;
use k8see_log::{ActivityLog, LogLevel};
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, AsyncConnectionConfig, RedisError, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

pub const CONSUMER_GROUP: &str = "k8see-consumer-group";
/// Server-side block per `XREADGROUP`; the read loops until data or cancel.
pub const READ_BLOCK: Duration = Duration::from_secs(5);
/// Minimum idle time before another consumer's pending entry is reclaimed.
pub const RECLAIM_MIN_IDLE: Duration = Duration::from_secs(60);
/// Pause between the end of one pending-list sweep and the start of the next.
pub const RECLAIM_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(15);

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Process-unique consumer name within the group, one per connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerIdentity(String);

impl ConsumerIdentity {
    pub fn generate() -> Self {
        ConsumerIdentity(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ConsumerIdentity {
    fn from(s: String) -> Self {
        ConsumerIdentity(s)
    }
}

impl fmt::Display for ConsumerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One claimed stream entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: Fields,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub url: String,
    pub stream: String,
    pub group: String,
    pub read_block: Duration,
    pub reclaim_min_idle: Duration,
    pub reclaim_sweep: Duration,
}

impl StreamSettings {
    pub fn new(url: impl Into<String>, stream: impl Into<String>) -> Self {
        StreamSettings {
            url: url.into(),
            stream: stream.into(),
            group: CONSUMER_GROUP.to_owned(),
            read_block: READ_BLOCK,
            reclaim_min_idle: RECLAIM_MIN_IDLE,
            reclaim_sweep: RECLAIM_SWEEP_INTERVAL,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("redis connect failed: {0}")]
    Connect(#[source] RedisError),
    #[error("redis read failed: {0}")]
    Read(#[source] RedisError),
    #[error("redis ack failed: {0}")]
    Ack(#[source] RedisError),
    #[error("stream consumer is not connected")]
    NotConnected,
}

struct Connection {
    conn: MultiplexedConnection,
    identity: ConsumerIdentity,
    sweep: ReclaimSweep,
}

/// Position in the repeated walk over the group's pending list.
#[derive(Debug)]
struct ReclaimSweep {
    /// Next `XAUTOCLAIM` start id; `None` between sweeps.
    cursor: Option<String>,
    finished_at: Option<Instant>,
    every: Duration,
}

impl ReclaimSweep {
    fn new(every: Duration) -> Self {
        ReclaimSweep {
            cursor: Some("0-0".to_owned()),
            finished_at: None,
            every,
        }
    }

    /// Start id for the next page, restarting from `0-0` once a finished
    /// sweep is `every` old.
    fn next_start(&mut self) -> Option<String> {
        if self.cursor.is_none() && self.finished_at.is_some_and(|t| t.elapsed() >= self.every) {
            self.cursor = Some("0-0".to_owned());
        }
        self.cursor.clone()
    }

    fn advance(&mut self, next: String) {
        if next == "0-0" {
            self.cursor = None;
            self.finished_at = Some(Instant::now());
        } else {
            self.cursor = Some(next);
        }
    }
}

/// One parsed `XAUTOCLAIM` reply.
#[derive(Debug, Default, PartialEq)]
struct AutoClaimPage {
    next: String,
    entries: Vec<StreamEntry>,
    /// Ids of claimed entries that no longer exist in the stream.
    deleted: Vec<String>,
    /// Nil entries with no id to ack.
    skipped: usize,
}

// ---------------------------------------------------------------------------
// StreamConsumer
// ---------------------------------------------------------------------------

pub struct StreamConsumer {
    settings: StreamSettings,
    log: Arc<ActivityLog>,
    conn: Mutex<Option<Connection>>,
}

impl StreamConsumer {
    pub fn new(settings: StreamSettings, log: Arc<ActivityLog>) -> Self {
        StreamConsumer {
            settings,
            log,
            conn: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    /// Connect, verify liveness, ensure the consumer group, and install the
    /// new connection under a fresh identity.  Any previous connection is
    /// dropped first.
    pub async fn connect(&self) -> Result<ConsumerIdentity, StreamError> {
        let mut guard = self.conn.lock().await;
        if guard.take().is_some() {
            self.log.log_at(LogLevel::Debug, "dropping previous redis connection");
        }

        let client =
            redis::Client::open(self.settings.url.as_str()).map_err(StreamError::Connect)?;
        let config = AsyncConnectionConfig::new()
            .set_connection_timeout(CONNECT_TIMEOUT)
            .set_response_timeout(RESPONSE_TIMEOUT.max(self.settings.read_block * 2));
        let mut conn = client
            .get_multiplexed_async_connection_with_config(&config)
            .await
            .map_err(StreamError::Connect)?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(StreamError::Connect)?;
        self.log.log("connected to redis");

        let created: Result<(), RedisError> = conn
            .xgroup_create_mkstream(&self.settings.stream, &self.settings.group, "0")
            .await;
        match created {
            Ok(()) => self.log.log(format!(
                "created consumer group {} on stream {}",
                self.settings.group, self.settings.stream
            )),
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => self
                .log
                .log_at(LogLevel::Error, format!("consumer group creation failed: {e}")),
        }

        let identity = ConsumerIdentity::generate();
        *guard = Some(Connection {
            conn,
            identity: identity.clone(),
            sweep: ReclaimSweep::new(self.settings.reclaim_sweep),
        });
        Ok(identity)
    }

    /// Claim up to `max_count` entries for this consumer, waiting until at
    /// least one is available.  Returns an empty batch once `cancel` fires.
    pub async fn read_batch(
        &self,
        cancel: &ShutdownSignal,
        max_count: usize,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let mut cancel = cancel.clone();
        let mut guard = self.conn.lock().await;
        let connection = guard.as_mut().ok_or(StreamError::NotConnected)?;
        loop {
            if cancel.is_triggered() {
                return Ok(Vec::new());
            }
            let entries = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Vec::new()),
                res = read_once(&self.settings, &self.log, connection, max_count) => res?,
            };
            if !entries.is_empty() {
                return Ok(entries);
            }
        }
    }

    /// Remove `message_id` from the group's pending list.
    pub async fn ack(&self, message_id: &str) -> Result<(), StreamError> {
        let mut guard = self.conn.lock().await;
        let connection = guard.as_mut().ok_or(StreamError::NotConnected)?;
        let _: i64 = connection
            .conn
            .xack(&self.settings.stream, &self.settings.group, &[message_id])
            .await
            .map_err(StreamError::Ack)?;
        Ok(())
    }

    /// Drop the connection.  Safe on an already-closed consumer.
    pub async fn close(&self) {
        if self.conn.lock().await.take().is_some() {
            self.log.log("redis connection closed");
        }
    }
}

async fn read_once(
    settings: &StreamSettings,
    log: &ActivityLog,
    connection: &mut Connection,
    max_count: usize,
) -> Result<Vec<StreamEntry>, StreamError> {
    if let Some(start) = connection.sweep.next_start() {
        let page = reclaim(settings, connection, &start, max_count).await?;
        connection.sweep.advance(page.next);
        let dropped = page.deleted.len() + page.skipped;
        if dropped > 0 {
            log.log_at(
                LogLevel::Warn,
                format!("skipped {dropped} pending entries deleted from the stream"),
            );
        }
        if !page.entries.is_empty() {
            return Ok(page.entries);
        }
    }

    let opts = StreamReadOptions::default()
        .group(&settings.group, connection.identity.as_str())
        .count(max_count)
        .block(settings.read_block.as_millis() as usize);
    let reply: Option<StreamReadReply> = connection
        .conn
        .xread_options(&[&settings.stream], &[">"], &opts)
        .await
        .map_err(StreamError::Read)?;

    Ok(reply
        .into_iter()
        .flat_map(|r| r.keys)
        .flat_map(|key| key.ids)
        .map(into_entry)
        .collect())
}

/// `XAUTOCLAIM` one page of idle pending entries onto this consumer, acking
/// away the ones whose stream entry was deleted.
async fn reclaim(
    settings: &StreamSettings,
    connection: &mut Connection,
    start: &str,
    max_count: usize,
) -> Result<AutoClaimPage, StreamError> {
    let reply: Vec<Value> = redis::cmd("XAUTOCLAIM")
        .arg(&settings.stream)
        .arg(&settings.group)
        .arg(connection.identity.as_str())
        .arg(settings.reclaim_min_idle.as_millis() as u64)
        .arg(start)
        .arg("COUNT")
        .arg(max_count)
        .query_async(&mut connection.conn)
        .await
        .map_err(StreamError::Read)?;

    let page = parse_autoclaim(reply).map_err(StreamError::Read)?;
    if !page.deleted.is_empty() {
        let _: i64 = connection
            .conn
            .xack(&settings.stream, &settings.group, &page.deleted)
            .await
            .map_err(StreamError::Ack)?;
    }
    Ok(page)
}

/// Split an `XAUTOCLAIM` reply into the next cursor, live entries and
/// deleted ones.  The Redis 7 third element (ids the server already dropped
/// from the pending list) needs no action and is ignored.
fn parse_autoclaim(reply: Vec<Value>) -> Result<AutoClaimPage, RedisError> {
    let mut reply = reply.into_iter();
    let next: String = match reply.next() {
        Some(v) => redis::from_redis_value(&v)?,
        None => "0-0".to_owned(),
    };
    let mut page = AutoClaimPage {
        next,
        ..AutoClaimPage::default()
    };
    let Some(Value::Array(items)) = reply.next() else {
        return Ok(page);
    };
    for item in items {
        match item {
            Value::Nil => page.skipped += 1,
            Value::Array(ref parts) if matches!(parts.get(1), Some(Value::Nil)) => {
                match parts.first() {
                    Some(id) => page.deleted.push(redis::from_redis_value(id)?),
                    None => page.skipped += 1,
                }
            }
            other => {
                let range: StreamRangeReply =
                    redis::from_redis_value(&Value::Array(vec![other]))?;
                page.entries.extend(range.ids.into_iter().map(into_entry));
            }
        }
    }
    Ok(page)
}

fn into_entry(id: StreamId) -> StreamEntry {
    let fields = id
        .map
        .into_iter()
        .filter_map(|(key, value)| match value {
            Value::BulkString(bytes) => Some((key, bytes)),
            Value::SimpleString(s) => Some((key, s.into_bytes())),
            _ => None,
        })
        .collect();
    StreamEntry { id: id.id, fields }
}

// ---------------------------------------------------------------------------
// Seam
// ---------------------------------------------------------------------------

impl EventSource for StreamConsumer {
    fn connect(&self) -> BoxFuture<'_, Result<ConsumerIdentity, StreamError>> {
        Box::pin(async move { StreamConsumer::connect(self).await })
    }

    fn read_batch<'a>(
        &'a self,
        cancel: &'a ShutdownSignal,
        max_count: usize,
    ) -> BoxFuture<'a, Result<Vec<StreamEntry>, StreamError>> {
        Box::pin(async move { StreamConsumer::read_batch(self, cancel, max_count).await })
    }

    fn ack<'a>(&'a self, message_id: &'a str) -> BoxFuture<'a, Result<(), StreamError>> {
        Box::pin(async move { StreamConsumer::ack(self, message_id).await })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move { StreamConsumer::close(self).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn identities_are_unique() {
        let a = ConsumerIdentity::generate();
        let b = ConsumerIdentity::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
    }

    #[test]
    fn into_entry_keeps_string_fields_and_drops_others() {
        let mut map = HashMap::new();
        map.insert("name".to_owned(), Value::BulkString(b"Pod1".to_vec()));
        map.insert("reason".to_owned(), Value::SimpleString("Started".to_owned()));
        map.insert("count".to_owned(), Value::Int(3));
        let entry = into_entry(StreamId {
            id: "1700000000000-0".to_owned(),
            map,
        });
        assert_eq!(entry.id, "1700000000000-0");
        assert_eq!(entry.fields.get("name"), Some(&b"Pod1".to_vec()));
        assert_eq!(entry.fields.get("reason"), Some(&b"Started".to_vec()));
        assert!(!entry.fields.contains_key("count"));
    }

    #[test]
    fn settings_default_to_the_shared_group() {
        let settings = StreamSettings::new("redis://localhost:6379/", "k8sevents");
        assert_eq!(settings.group, CONSUMER_GROUP);
        assert_eq!(settings.read_block, READ_BLOCK);
        assert_eq!(settings.reclaim_sweep, RECLAIM_SWEEP_INTERVAL);
    }

    fn bulk(s: &str) -> Value {
        Value::BulkString(s.as_bytes().to_vec())
    }

    fn entry(id: &str, name: &str) -> Value {
        Value::Array(vec![bulk(id), Value::Array(vec![bulk("name"), bulk(name)])])
    }

    #[test]
    fn autoclaim_reply_yields_cursor_and_entries() {
        let reply = vec![
            bulk("1700000000005-0"),
            Value::Array(vec![
                entry("1700000000001-0", "Pod1"),
                entry("1700000000002-0", "Pod2"),
            ]),
            Value::Array(vec![]),
        ];
        let page = parse_autoclaim(reply).unwrap();
        assert_eq!(page.next, "1700000000005-0");
        let ids: Vec<_> = page.entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["1700000000001-0", "1700000000002-0"]);
        assert_eq!(page.entries[1].fields.get("name"), Some(&b"Pod2".to_vec()));
        assert!(page.deleted.is_empty());
        assert_eq!(page.skipped, 0);
    }

    /// Test: the Redis 6.2 shapes for deleted entries do not fail the page.
    #[test]
    fn autoclaim_reply_with_deleted_entries_keeps_live_ones() {
        let reply = vec![
            bulk("0-0"),
            Value::Array(vec![
                Value::Nil,
                Value::Array(vec![bulk("1700000000002-0"), Value::Nil]),
                entry("1700000000003-0", "Pod3"),
            ]),
        ];
        let page = parse_autoclaim(reply).unwrap();
        assert_eq!(page.next, "0-0");
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].id, "1700000000003-0");
        assert_eq!(page.deleted, vec!["1700000000002-0".to_owned()]);
        assert_eq!(page.skipped, 1);
    }

    #[test]
    fn empty_autoclaim_reply_ends_the_sweep() {
        assert_eq!(parse_autoclaim(Vec::new()).unwrap().next, "0-0");
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_restarts_after_the_interval() {
        let mut sweep = ReclaimSweep::new(Duration::from_secs(30));
        assert_eq!(sweep.next_start().as_deref(), Some("0-0"));
        sweep.advance("1700000000009-0".to_owned());
        assert_eq!(sweep.next_start().as_deref(), Some("1700000000009-0"));
        sweep.advance("0-0".to_owned());
        assert_eq!(sweep.next_start(), None);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(sweep.next_start(), None);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(sweep.next_start().as_deref(), Some("0-0"));
        assert_eq!(sweep.next_start().as_deref(), Some("0-0"));
    }

    #[tokio::test]
    async fn read_and_ack_before_connect_are_rejected() {
        let consumer = StreamConsumer::new(
            StreamSettings::new("redis://localhost:6379/", "k8sevents"),
            Arc::new(ActivityLog::new()),
        );
        let shutdown = crate::shutdown::Shutdown::new();
        assert!(matches!(
            consumer.read_batch(&shutdown.subscribe(), 2).await,
            Err(StreamError::NotConnected)
        ));
        assert!(matches!(consumer.ack("1-0").await, Err(StreamError::NotConnected)));
        consumer.close().await;
        consumer.close().await;
    }
}
