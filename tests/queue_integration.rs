//! Integration tests for queue operations against a live backend.
//!
//! These tests require a running Redis-compatible server.
//! Run with: QUEVISOR_TEST_REDIS_HOST=127.0.0.1 cargo test --test queue_integration -- --ignored

use std::time::{Duration, Instant};

use quevisor::queue::{QueueConfig, QueueKind, TopicQueue};

fn test_config() -> QueueConfig {
    let host =
        std::env::var("QUEVISOR_TEST_REDIS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    QueueConfig::new(host, 6379).with_db(15)
}

/// Topic names are unique per test process so parallel runs never collide.
fn unique_topic(label: &str) -> String {
    format!("quevisor-test:{}:{}", label, std::process::id())
}

fn drain(queue: &mut TopicQueue, topic: &str) {
    while let Ok(Some(_)) = queue.pop(topic, Duration::from_secs(1)) {}
}

#[test]
#[ignore] // Run with: cargo test --test queue_integration -- --ignored
fn fifo_preserves_delivery_order() {
    let topic = unique_topic("fifo-order");
    let mut queue = TopicQueue::new(QueueKind::Fifo, test_config());

    for payload in ["a", "b", "c"] {
        queue.deliver(&topic, payload, 0).expect("deliver");
    }
    assert_eq!(queue.size(&topic).expect("size"), 3);

    let mut consumed = Vec::new();
    while let Some(payload) = queue.pop(&topic, Duration::from_secs(1)).expect("pop") {
        consumed.push(payload);
    }
    assert_eq!(consumed, vec!["a", "b", "c"]);
    assert_eq!(queue.size(&topic).expect("size"), 0);
}

#[test]
#[ignore]
fn fifo_round_trip_multiset() {
    let topic = unique_topic("fifo-roundtrip");
    let mut queue = TopicQueue::new(QueueKind::Fifo, test_config());

    let delivered: Vec<String> = (0..50).map(|i| format!("payload-{i}")).collect();
    for payload in &delivered {
        queue.deliver(&topic, payload, 0).expect("deliver");
    }

    let mut consumed = Vec::new();
    while let Some(payload) = queue.pop(&topic, Duration::from_secs(1)).expect("pop") {
        consumed.push(payload);
    }

    let mut expected = delivered.clone();
    expected.sort();
    consumed.sort();
    assert_eq!(consumed, expected);
}

#[test]
#[ignore]
fn delay_message_fires_at_or_after_eligibility() {
    let topic = unique_topic("delay-fire");
    let mut queue = TopicQueue::new(QueueKind::Delay, test_config());

    let eligible_at = chrono::Utc::now().timestamp() + 2;
    queue.deliver(&topic, "scheduled", eligible_at).expect("deliver");

    // Not yet eligible: invisible to size and pop.
    assert_eq!(queue.size(&topic).expect("size"), 0);
    assert!(queue.pop(&topic, Duration::from_secs(1)).expect("pop").is_none());

    // Wait past the eligibility instant.
    std::thread::sleep(Duration::from_secs(2));
    assert_eq!(queue.size(&topic).expect("size"), 1);

    let fired_at = chrono::Utc::now().timestamp();
    let payload = queue
        .pop(&topic, Duration::from_secs(1))
        .expect("pop")
        .expect("eligible payload");
    assert_eq!(payload, "scheduled");
    assert!(fired_at >= eligible_at, "fired before eligibility");

    // Claimed exactly once.
    assert!(queue.pop(&topic, Duration::from_secs(1)).expect("pop").is_none());
}

#[test]
#[ignore]
fn delay_revoke_withdraws_pending_payload() {
    let topic = unique_topic("delay-revoke");
    let mut queue = TopicQueue::new(QueueKind::Delay, test_config());

    queue.deliver(&topic, "doomed", 0).expect("deliver");
    assert!(queue.revoke(&topic, "doomed").expect("revoke"));
    assert!(!queue.revoke(&topic, "doomed").expect("second revoke"));
    assert!(queue.pop(&topic, Duration::from_secs(1)).expect("pop").is_none());
}

#[test]
#[ignore]
fn delay_empty_pop_sleeps_out_the_timeout() {
    let topic = unique_topic("delay-idle");
    let mut queue = TopicQueue::new(QueueKind::Delay, test_config());
    drain(&mut queue, &topic);

    let started = Instant::now();
    let result = queue.pop(&topic, Duration::from_secs(1)).expect("pop");
    assert!(result.is_none());
    assert!(started.elapsed() >= Duration::from_secs(1));
}

#[test]
#[ignore]
fn reconnect_survives_a_dropped_connection() {
    let topic = unique_topic("reconnect");
    let mut queue = TopicQueue::new(QueueKind::Fifo, test_config());

    queue.deliver(&topic, "before", 0).expect("deliver");
    // Simulate a lost connection; the next operation must transparently
    // reconnect rather than fail.
    queue.disconnect();
    queue.deliver(&topic, "after", 0).expect("deliver after reconnect");
    assert_eq!(queue.size(&topic).expect("size"), 2);
    drain(&mut queue, &topic);
}
