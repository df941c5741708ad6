//! Fan-out queries over in-process relays.

mod common;

use common::*;
use nostr::{EventTemplate, RelayEntry, RelayListMetadata};
use nostr_pool::memory::MemoryTransport;
use nostr_pool::{ConnectionState, Filter, PoolError, QueryOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const A: &str = "wss://a.example";
const B: &str = "wss://b.example";
const C: &str = "wss://c.example";

#[tokio::test(start_paused = true)]
async fn test_merges_and_dedups_with_silent_relay() {
    let transport = Arc::new(MemoryTransport::new());
    let [a, b, c] = relays(&transport, [A, B, C]);
    let e1 = note(&ALICE, "one", 100);
    let e2 = note(&ALICE, "two", 200);
    let e3 = note(&BOB, "three", 300);
    a.store(e1.clone());
    a.store(e2.clone());
    b.store(e2.clone());
    b.store(e3.clone());
    c.set_silent(true);

    let pool = broadcast_pool(&transport, &[A, B, C], 2);
    let events = pool
        .query(&[Filter::new().kinds(vec![1])], QueryOptions::new())
        .await
        .unwrap();

    let mut expected = vec![e1.id, e2.id, e3.id];
    expected.sort();
    assert_eq!(ids(&events), expected);
    assert_eq!(c.req_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_completes_without_waiting_for_deadline() {
    let transport = Arc::new(MemoryTransport::new());
    let [a, b] = relays(&transport, [A, B]);
    a.store(note(&ALICE, "hello", 1));
    b.store(note(&BOB, "world", 2));

    let pool = broadcast_pool(&transport, &[A, B], 2);
    let started = Instant::now();
    let events = pool
        .query(&[Filter::new()], QueryOptions::new().timeout(Duration::from_secs(30)))
        .await
        .unwrap();

    assert_eq!(events.len(), 2);
    assert!(started.elapsed() < Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn test_same_event_everywhere_returned_once() {
    let transport = Arc::new(MemoryTransport::new());
    let shared = note(&ALICE, "everywhere", 10);
    for relay in relays(&transport, [A, B, C]) {
        relay.store(shared.clone());
    }

    let pool = broadcast_pool(&transport, &[A, B, C], 2);
    let events = pool.query(&[Filter::new()], QueryOptions::new()).await.unwrap();
    assert_eq!(events, vec![shared]);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_relay_is_tolerated() {
    let transport = Arc::new(MemoryTransport::new());
    let [a, b] = relays(&transport, [A, B]);
    a.store(note(&ALICE, "still here", 5));
    b.set_refuse_connections(true);

    let pool = broadcast_pool(&transport, &[A, B, C], 2);
    let events = pool.query(&[Filter::new()], QueryOptions::new()).await.unwrap();
    assert_eq!(events.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_hung_connect_does_not_discard_other_relays() {
    let transport = Arc::new(MemoryTransport::new());
    let [a, b, c] = relays(&transport, [A, B, C]);
    let from_a = note(&ALICE, "stored on a", 1);
    let from_b = note(&BOB, "stored on b", 2);
    a.store(from_a.clone());
    b.store(from_b.clone());
    c.set_hang_connections(true);

    let pool = broadcast_pool(&transport, &[A, B, C], 2);
    let started = Instant::now();
    let events = pool
        .query(&[Filter::new()], QueryOptions::new().timeout(Duration::from_secs(2)))
        .await
        .unwrap();

    let mut expected = vec![from_a.id, from_b.id];
    expected.sort();
    assert_eq!(ids(&events), expected);
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(c.connect_count(), 0);

    let c_state = pool
        .relays()
        .into_iter()
        .find(|relay| relay.url == C)
        .map(|relay| relay.state);
    assert_eq!(c_state, Some(ConnectionState::Disconnected));
    assert!(pool.active_subscriptions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_hung_connect_alone_is_aggregate_timeout() {
    let transport = Arc::new(MemoryTransport::new());
    let [a] = relays(&transport, [A]);
    a.set_hang_connections(true);

    let pool = broadcast_pool(&transport, &[A], 1);
    let result = pool
        .query(&[Filter::new()], QueryOptions::new().timeout(Duration::from_secs(1)))
        .await;
    assert!(matches!(result, Err(PoolError::AggregateTimeout(_))));
}

#[tokio::test(start_paused = true)]
async fn test_slow_connect_only_delays_its_own_relay() {
    let transport = Arc::new(MemoryTransport::new());
    let [a, b] = relays(&transport, [A, B]);
    a.store(note(&ALICE, "fast", 1));
    b.store(note(&BOB, "slow", 2));
    b.set_connect_delay(Some(Duration::from_millis(1500)));

    let pool = broadcast_pool(&transport, &[A, B], 2);
    let started = Instant::now();
    let events = pool.query(&[Filter::new()], QueryOptions::new()).await.unwrap();

    assert_eq!(events.len(), 2);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(1500));
    assert!(elapsed < Duration::from_secs(5));
    // The fast relay was closed as soon as it sent EOSE.
    assert_eq!(a.open_subscriptions(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_all_unreachable_is_connection_unavailable() {
    let transport = Arc::new(MemoryTransport::new());
    let [a] = relays(&transport, [A]);
    a.set_refuse_connections(true);

    let pool = broadcast_pool(&transport, &[A, B], 2);
    let result = pool.query(&[Filter::new()], QueryOptions::new()).await;
    assert!(matches!(result, Err(PoolError::ConnectionUnavailable(_))));
}

#[tokio::test(start_paused = true)]
async fn test_all_silent_is_aggregate_timeout() {
    let transport = Arc::new(MemoryTransport::new());
    for relay in relays(&transport, [A, B]) {
        relay.set_silent(true);
    }

    let pool = broadcast_pool(&transport, &[A, B], 2);
    let started = Instant::now();
    let result = pool
        .query(&[Filter::new()], QueryOptions::new().timeout(Duration::from_millis(750)))
        .await;

    match result {
        Err(PoolError::AggregateTimeout(after)) => assert_eq!(after, Duration::from_millis(750)),
        other => panic!("expected AggregateTimeout, got {:?}", other),
    }
    assert!(started.elapsed() >= Duration::from_millis(750));
}

#[tokio::test(start_paused = true)]
async fn test_deadline_returns_partial_results() {
    let transport = Arc::new(MemoryTransport::new());
    let [a, b] = relays(&transport, [A, B]);
    a.store(note(&ALICE, "no eose after me", 1));
    a.set_withhold_eose(true);
    b.set_silent(true);

    let pool = broadcast_pool(&transport, &[A, B], 2);
    let events = pool
        .query(&[Filter::new()], QueryOptions::new().timeout(Duration::from_secs(1)))
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_and_tampered_events_dropped() {
    let transport = Arc::new(MemoryTransport::new());
    let [a] = relays(&transport, [A]);
    let good = note(&ALICE, "genuine", 10);

    let mut tampered = note(&ALICE, "original", 11);
    tampered.content = "forged".to_string();

    let mut bad_sig = note(&BOB, "unsigned", 12);
    bad_sig.sig = "00".repeat(64);

    let mut truncated = note(&BOB, "short id", 13);
    truncated.id.truncate(10);

    for event in [good.clone(), tampered, bad_sig, truncated] {
        a.store(event);
    }

    let pool = broadcast_pool(&transport, &[A], 2);
    let events = pool.query(&[Filter::new()], QueryOptions::new()).await.unwrap();
    assert_eq!(events, vec![good]);
}

#[tokio::test(start_paused = true)]
async fn test_closed_subscriptions_count_as_failures() {
    let transport = Arc::new(MemoryTransport::new());
    let [a, b] = relays(&transport, [A, B]);
    a.set_silent(true);
    b.set_silent(true);

    let pool = broadcast_pool(&transport, &[A, B], 2);
    let query = tokio::spawn({
        let pool = pool.clone();
        async move {
            pool.query(&[Filter::new()], QueryOptions::new().timeout(Duration::from_secs(60)))
                .await
        }
    });

    assert!(eventually(|| a.open_subscriptions() == 1 && b.open_subscriptions() == 1).await);
    let sid = a.open_subscription_ids().remove(0);
    a.close_subscription(&sid, "blocked: rate limited");
    b.close_subscription(&sid, "auth-required: sign in");

    let started = Instant::now();
    let result = query.await.unwrap();
    assert!(matches!(result, Err(PoolError::ConnectionUnavailable(_))));
    assert!(started.elapsed() < Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn test_relay_dropping_mid_query() {
    let transport = Arc::new(MemoryTransport::new());
    let [a, b] = relays(&transport, [A, B]);
    a.set_silent(true);
    b.store(note(&BOB, "survivor", 3));
    b.set_withhold_eose(true);

    let pool = broadcast_pool(&transport, &[A, B], 2);
    let query = tokio::spawn({
        let pool = pool.clone();
        async move {
            pool.query(&[Filter::new()], QueryOptions::new().timeout(Duration::from_secs(60)))
                .await
        }
    });

    assert!(eventually(|| a.open_subscriptions() == 1 && b.open_subscriptions() == 1).await);
    a.drop_connections();
    b.drop_connections();

    let events = query.await.unwrap().unwrap();
    assert_eq!(events.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_subscriptions_closed_after_query() {
    let transport = Arc::new(MemoryTransport::new());
    let [a, b] = relays(&transport, [A, B]);
    a.store(note(&ALICE, "x", 1));
    b.set_silent(true);

    let pool = broadcast_pool(&transport, &[A, B], 2);
    pool.query(&[Filter::new()], QueryOptions::new().timeout(Duration::from_secs(1)))
        .await
        .unwrap();

    assert!(eventually(|| a.open_subscriptions() == 0 && b.open_subscriptions() == 0).await);
    assert!(pool.active_subscriptions().is_empty());
    // Sockets stay open for the next query.
    assert_eq!(a.connection_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connections_reused_across_queries() {
    let transport = Arc::new(MemoryTransport::new());
    let [a] = relays(&transport, [A]);
    a.store(note(&ALICE, "x", 1));

    let pool = broadcast_pool(&transport, &[A], 2);
    for _ in 0..3 {
        pool.query(&[Filter::new()], QueryOptions::new()).await.unwrap();
    }
    assert_eq!(a.connect_count(), 1);
    assert_eq!(a.req_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_filters_reach_relays() {
    let transport = Arc::new(MemoryTransport::new());
    let [a] = relays(&transport, [A]);
    let from_alice = note(&ALICE, "mine", 10);
    a.store(from_alice.clone());
    a.store(note(&BOB, "not mine", 11));
    a.store(signed(&ALICE, EventTemplate::new(7, "+"), 12));

    let pool = broadcast_pool(&transport, &[A], 2);
    let events = pool
        .query(
            &[Filter::new().authors(vec![pubkey(&ALICE)]).kinds(vec![1])],
            QueryOptions::new(),
        )
        .await
        .unwrap();
    assert_eq!(events, vec![from_alice]);
}

#[tokio::test(start_paused = true)]
async fn test_outbox_pool_follows_author_relays() {
    use nostr_pool::{OutboxModel, OutboxRouter, PoolRole, RelayPool};

    init_tracing();
    let transport = Arc::new(MemoryTransport::new());
    let [configured, alice_out] = relays(&transport, [A, "wss://alice-out.example"]);
    let post = note(&ALICE, "from my outbox", 50);
    alice_out.store(post.clone());

    let outbox = Arc::new(OutboxModel::default());
    let list = RelayListMetadata::new(vec![
        RelayEntry::write("wss://alice-out.example"),
        RelayEntry::read("wss://alice-in.example"),
    ]);
    outbox
        .update_relay_list(&signed(&ALICE, list.to_template(), 40))
        .unwrap();

    let pool = RelayPool::new(
        PoolRole::Outbox,
        settings(&[A]),
        Arc::new(OutboxRouter::new(outbox, 2, 8)),
        transport.clone(),
    )
    .unwrap();

    let events = pool
        .query(&[Filter::new().authors(vec![pubkey(&ALICE)])], QueryOptions::new())
        .await
        .unwrap();

    assert_eq!(events, vec![post]);
    assert_eq!(configured.req_count(), 0);
    assert!(pool.relays().iter().any(|r| r.url == "wss://alice-out.example"));
}
