use importer::purge::{PURGE_INTERVAL, RetentionPurger};
use importer::shutdown::Shutdown;
use k8see_event::EventRecord;
use k8see_log::{ActivityLog, LogLevel};
use k8see_test_utils::{MemorySink, event_fields};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3 * 24 * 3600);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_secs(60)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn purges_at_startup_then_every_interval() {
    let sink = Arc::new(MemorySink::new());
    let log = Arc::new(ActivityLog::with_buffer(64));
    let started = Instant::now();

    let shutdown = Shutdown::new();
    let purger = RetentionPurger::new(sink.clone(), 30, log.clone());
    let task = tokio::spawn(purger.run(shutdown.subscribe()));

    wait_until("startup purge", || sink.purge_calls().len() == 1).await;
    assert!(started.elapsed() < PURGE_INTERVAL);

    wait_until("second purge", || sink.purge_calls().len() == 2).await;
    assert!(started.elapsed() >= PURGE_INTERVAL);
    assert_eq!(sink.purge_calls(), vec![30, 30]);

    shutdown.trigger();
    task.await.unwrap();
    assert!(log.contains(LogLevel::Info, "retention purge deleted 0 rows older than 30 days"));
}

/// Test: a failed purge is logged and the next tick runs anyway.
#[tokio::test(start_paused = true)]
async fn failed_purge_keeps_ticking() {
    let sink = Arc::new(MemorySink::new());
    let log = Arc::new(ActivityLog::with_buffer(64));
    sink.fail_next_purges(1);

    let shutdown = Shutdown::new();
    let purger = RetentionPurger::new(sink.clone(), 30, log.clone())
        .with_interval(Duration::from_secs(60));
    let task = tokio::spawn(purger.run(shutdown.subscribe()));

    wait_until("second purge", || sink.purge_calls().len() == 2).await;
    assert!(log.contains(LogLevel::Error, "retention purge failed"));
    assert!(log.contains(LogLevel::Info, "retention purge deleted"));

    shutdown.trigger();
    task.await.unwrap();
}

#[tokio::test]
async fn purge_once_reports_deleted_rows() {
    let sink = Arc::new(MemorySink::new());
    let log = Arc::new(ActivityLog::with_buffer(64));
    for (name, time) in [
        ("ancient", "2001-05-01 00:00:00 +0000 UTC"),
        ("old", "2010-05-01 00:00:00 +0200 CEST"),
    ] {
        let record = EventRecord::from_fields(&event_fields(name, time)).unwrap();
        importer::engine::EventSink::insert(sink.as_ref(), &record)
            .await
            .unwrap();
    }
    let fresh_fields = event_fields("fresh", &now_timestamp());
    let fresh = EventRecord::from_fields(&fresh_fields).unwrap();
    importer::engine::EventSink::insert(sink.as_ref(), &fresh)
        .await
        .unwrap();

    let purger = RetentionPurger::new(sink.clone(), 30, log);
    assert_eq!(purger.purge_once().await, Some(2));
    assert_eq!(purger.purge_once().await, Some(0));
    let remaining: Vec<_> = sink.rows().into_iter().map(|r| r.name).collect();
    assert_eq!(remaining, vec!["fresh".to_owned()]);
}

#[tokio::test]
async fn stop_before_start_skips_the_startup_purge() {
    let sink = Arc::new(MemorySink::new());
    let log = Arc::new(ActivityLog::with_buffer(64));
    let shutdown = Shutdown::new();
    shutdown.trigger();

    RetentionPurger::new(sink.clone(), 30, log)
        .run(shutdown.subscribe())
        .await;
    assert!(sink.purge_calls().is_empty());
}

/// Test: stopping between ticks returns at once without another purge.
#[tokio::test(start_paused = true)]
async fn stop_between_ticks_exits_without_purging() {
    let sink = Arc::new(MemorySink::new());
    let log = Arc::new(ActivityLog::with_buffer(64));
    let shutdown = Shutdown::new();
    let purger = RetentionPurger::new(sink.clone(), 30, log.clone());
    let task = tokio::spawn(purger.run(shutdown.subscribe()));

    wait_until("startup purge", || sink.purge_calls().len() == 1).await;
    let stopped_at = Instant::now();
    shutdown.trigger();
    task.await.unwrap();

    assert!(stopped_at.elapsed() < Duration::from_secs(1));
    assert_eq!(sink.purge_calls().len(), 1);
    assert!(log.contains(LogLevel::Info, "retention purge stopping"));
}

fn now_timestamp() -> String {
    chrono::Utc::now()
        .format("%Y-%m-%d %H:%M:%S +0000 UTC")
        .to_string()
}
