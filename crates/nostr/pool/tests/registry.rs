//! Role pools working together through the registry.

mod common;

use common::*;
use nostr::{RelayEntry, RelayListMetadata};
use nostr_pool::memory::MemoryTransport;
use nostr_pool::{Filter, PoolRegistry, PoolRole, PoolsConfig, QueryOptions, load_config};
use std::io::Write;
use std::sync::Arc;

const HOME: &str = "wss://home.example";
const INDEX: &str = "wss://index.example";
const ALICE_OUT: &str = "wss://alice-out.example";

fn registry(transport: &Arc<MemoryTransport>) -> PoolRegistry {
    init_tracing();
    let config = PoolsConfig {
        default_relays: vec![HOME.to_string()],
        discovery_relays: vec![INDEX.to_string()],
        ..PoolsConfig::default()
    };
    PoolRegistry::with_transport(config, transport.clone()).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_discovered_relay_lists_drive_outbox_reads() {
    let transport = Arc::new(MemoryTransport::new());
    let [home, index, alice_out] = relays(&transport, [HOME, INDEX, ALICE_OUT]);

    let list = RelayListMetadata::new(vec![RelayEntry::write(ALICE_OUT)]);
    index.store(signed(&ALICE, list.to_template(), 100));
    let post = note(&ALICE, "only on my relay", 200);
    alice_out.store(post.clone());

    let registry = registry(&transport);
    let alice = pubkey(&ALICE);

    let updated = registry
        .fetch_relay_lists(&[alice.clone(), pubkey(&BOB)], QueryOptions::new())
        .await
        .unwrap();
    assert_eq!(updated, 1);
    assert_eq!(registry.outbox().write_relays(&alice).unwrap(), vec![ALICE_OUT]);

    // Already cached: no second discovery query.
    let reqs = index.req_count();
    registry
        .fetch_relay_lists(&[alice.clone()], QueryOptions::new())
        .await
        .unwrap();
    assert_eq!(index.req_count(), reqs);

    let outbox = registry.get(PoolRole::Outbox).unwrap();
    let events = outbox
        .query(&[Filter::new().authors(vec![alice])], QueryOptions::new())
        .await
        .unwrap();
    assert_eq!(events, vec![post]);
    assert_eq!(home.req_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_outbox_publish_reaches_mentioned_read_relays() {
    let transport = Arc::new(MemoryTransport::new());
    let [home, bob_in] = relays(&transport, [HOME, "wss://bob-in.example"]);

    let registry = registry(&transport);
    registry.outbox().set_relay_list(
        pubkey(&BOB),
        RelayListMetadata::new(vec![RelayEntry::read("wss://bob-in.example")]),
    );

    let reply = signed(
        &ALICE,
        nostr::EventTemplate::new(1, "hi bob").tag(["p", pubkey(&BOB).as_str()]),
        10,
    );
    let outcome = registry.outbox_pool().unwrap().publish(&reply).await.unwrap();

    assert_eq!(outcome.accepted_by(), vec![HOME, "wss://bob-in.example"]);
    assert_eq!(home.stored_events(), vec![reply.clone()]);
    assert_eq!(bob_in.stored_events(), vec![reply]);
}

#[tokio::test(start_paused = true)]
async fn test_registry_from_config_file() {
    let transport = Arc::new(MemoryTransport::new());
    let [mine] = relays(&transport, ["wss://mine.example"]);
    mine.store(note(&ALICE, "configured", 1));

    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{ "defaultRelays": ["wss://mine.example/"], "queryTimeoutMs": 250 }}"#
    )
    .unwrap();
    let config = load_config(file.path()).unwrap();

    let registry = PoolRegistry::with_transport(config, transport.clone()).unwrap();
    let pool = registry.default_pool().unwrap();
    assert_eq!(pool.relay_urls(), ["wss://mine.example"]);

    let events = pool.query(&[Filter::new()], QueryOptions::new()).await.unwrap();
    assert_eq!(events.len(), 1);
}
