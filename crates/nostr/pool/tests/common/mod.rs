//! Shared helpers for pool integration tests.
//!
//! Relays are in-process `MemoryRelay`s, so no test touches the network.

#![allow(dead_code)]

use nostr::{Event, EventTemplate, get_public_key_hex, sign_event};
use nostr_pool::memory::{MemoryRelay, MemoryTransport};
use nostr_pool::{BroadcastRouter, PoolRole, PoolSettings, RelayPool};
use std::sync::{Arc, Once};
use std::time::Duration;

pub const ALICE: [u8; 32] = [0x11; 32];
pub const BOB: [u8; 32] = [0x22; 32];

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

pub fn pubkey(secret: &[u8; 32]) -> String {
    get_public_key_hex(secret).unwrap()
}

/// A signed event of `kind`.
pub fn signed(secret: &[u8; 32], template: EventTemplate, created_at: u64) -> Event {
    sign_event(template.into_unsigned(pubkey(secret), created_at), secret).unwrap()
}

/// A signed kind 1 note.
pub fn note(secret: &[u8; 32], content: &str, created_at: u64) -> Event {
    signed(secret, EventTemplate::new(1, content), created_at)
}

/// Register `urls` on `transport` and return the relays in the same order.
pub fn relays<const N: usize>(transport: &MemoryTransport, urls: [&str; N]) -> [Arc<MemoryRelay>; N] {
    urls.map(|url| transport.add_relay(url).unwrap())
}

pub fn settings(urls: &[&str]) -> PoolSettings {
    PoolSettings {
        query_timeout: Duration::from_secs(5),
        publish_timeout: Duration::from_secs(2),
        ..PoolSettings::new(urls.iter().copied())
    }
}

/// A broadcast pool over `urls` writing to the first `write_redundancy`.
pub fn broadcast_pool(
    transport: &Arc<MemoryTransport>,
    urls: &[&str],
    write_redundancy: usize,
) -> Arc<RelayPool> {
    init_tracing();
    Arc::new(
        RelayPool::new(
            PoolRole::Default,
            settings(urls),
            Arc::new(BroadcastRouter::new(write_redundancy)),
            transport.clone(),
        )
        .unwrap(),
    )
}

/// Poll `cond` until it holds, sleeping between attempts.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

pub fn ids(events: &[Event]) -> Vec<String> {
    let mut ids: Vec<String> = events.iter().map(|e| e.id.clone()).collect();
    ids.sort();
    ids
}
