//! Live fanout integration tests over the in-memory log.

use std::sync::Arc;
use std::time::Duration;

use foreman_core::append_log::TailFrom;
use foreman_core::config::{FanoutConfig, OverflowPolicy};
use foreman_core::models::{EntryId, LogEntry, Values};
use foreman_core::{AppendLog, MemoryAppendLog};
use foreman_server::subsystems::fanout::{Fanout, SubscribeRequest, Subscription};
use serde_json::json;

fn fanout(log: Arc<MemoryAppendLog>, capacity: usize, overflow: OverflowPolicy) -> Fanout {
    Fanout::new(
        log,
        FanoutConfig {
            buffer_capacity: capacity,
            overflow,
            block_ms: 20,
            batch_size: 10,
            keepalive_secs: 1,
        },
    )
}

fn request(thread: Option<&str>, from: TailFrom) -> SubscribeRequest {
    SubscribeRequest {
        user_id: "u1".into(),
        thread_id: thread.map(str::to_string),
        from,
    }
}

fn values(n: u64) -> Values {
    json!({"type": "prod.nudge", "n": n}).as_object().unwrap().clone()
}

async fn next(sub: &mut Subscription) -> LogEntry {
    tokio::time::timeout(Duration::from_secs(2), sub.recv())
        .await
        .expect("no entry within 2s")
        .expect("subscription closed")
}

// ============================================================================
// TEST 1: thread filter never leaks other threads, even with interleaved writers
// ============================================================================
#[tokio::test]
async fn test_thread_filter_isolates_subscribers() {
    let log = Arc::new(MemoryAppendLog::new());
    let fanout = fanout(log.clone(), 64, OverflowPolicy::DropOldest);
    let mut t1 = fanout.subscribe(request(Some("t1"), TailFrom::Now)).await.unwrap();
    let mut all = fanout.subscribe(request(None, TailFrom::Now)).await.unwrap();

    let writers: Vec<_> = ["t1", "t2", "t3"]
        .into_iter()
        .map(|thread| {
            let log = log.clone();
            tokio::spawn(async move {
                for n in 0..5 {
                    log.append("u1", Some(thread), values(n)).await.unwrap();
                }
            })
        })
        .collect();
    for w in writers {
        w.await.unwrap();
    }

    for _ in 0..5 {
        assert_eq!(next(&mut t1).await.thread_id.as_deref(), Some("t1"));
    }
    let extra = tokio::time::timeout(Duration::from_millis(100), t1.recv()).await;
    assert!(extra.is_err(), "t1 subscriber got an entry from another thread");

    let mut seen = Vec::new();
    for _ in 0..15 {
        seen.push(next(&mut all).await.id);
    }
    let mut sorted = seen.clone();
    sorted.sort();
    assert_eq!(seen, sorted, "tail must deliver in id order");
}

// ============================================================================
// TEST 2: resume cursor replays retained entries after it
// ============================================================================
#[tokio::test]
async fn test_resume_after_cursor() {
    let log = Arc::new(MemoryAppendLog::new());
    let first = log.append("u1", Some("t1"), values(1)).await.unwrap();
    let second = log.append("u1", Some("t1"), values(2)).await.unwrap();

    let fanout = fanout(log.clone(), 8, OverflowPolicy::DropOldest);
    let mut sub = fanout
        .subscribe(request(Some("t1"), TailFrom::After(first)))
        .await
        .unwrap();
    assert_eq!(next(&mut sub).await.id, second);

    let mut fresh = fanout
        .subscribe(request(Some("t1"), TailFrom::After(EntryId::ZERO)))
        .await
        .unwrap();
    assert_eq!(next(&mut fresh).await.id, first);
}

// ============================================================================
// TEST 3: a slow subscriber with drop-oldest loses history, not the writer
// ============================================================================
#[tokio::test]
async fn test_slow_subscriber_drops_oldest() {
    let log = Arc::new(MemoryAppendLog::new());
    let fanout = fanout(log.clone(), 2, OverflowPolicy::DropOldest);
    let mut slow = fanout.subscribe(request(None, TailFrom::Now)).await.unwrap();

    let mut ids = Vec::new();
    for n in 0..6 {
        ids.push(log.append("u1", Some("t1"), values(n)).await.unwrap());
    }

    // let the reader catch up without the subscriber consuming
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while slow.dropped() < 4 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(slow.dropped(), 4);
    assert_eq!(next(&mut slow).await.id, ids[4]);
    assert_eq!(next(&mut slow).await.id, ids[5]);
}

// ============================================================================
// TEST 4: disconnect policy closes the subscription on overflow
// ============================================================================
#[tokio::test]
async fn test_disconnect_policy_closes() {
    let log = Arc::new(MemoryAppendLog::new());
    let fanout = fanout(log.clone(), 1, OverflowPolicy::Disconnect);
    let mut sub = fanout.subscribe(request(None, TailFrom::Now)).await.unwrap();

    for n in 0..3 {
        log.append("u1", Some("t1"), values(n)).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(sub.recv().await.is_some());
    let closed = tokio::time::timeout(Duration::from_secs(1), sub.recv())
        .await
        .expect("closed subscription must not hang");
    assert!(closed.is_none());
}

// ============================================================================
// TEST 5: subscribers are independent of each other
// ============================================================================
#[tokio::test]
async fn test_dropping_one_subscriber_leaves_others() {
    let log = Arc::new(MemoryAppendLog::new());
    let fanout = fanout(log.clone(), 8, OverflowPolicy::DropOldest);
    let gone = fanout.subscribe(request(None, TailFrom::Now)).await.unwrap();
    let mut kept = fanout.subscribe(request(None, TailFrom::Now)).await.unwrap();
    drop(gone);

    let id = log.append("u1", Some("t1"), values(1)).await.unwrap();
    assert_eq!(next(&mut kept).await.id, id);
}
