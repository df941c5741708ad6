//! Nostr relay pool and query routing.
//!
//! This crate provides:
//! - Persistent relay connections multiplexing subscriptions (NIP-01 wire protocol)
//! - Read/write routing, including outbox routing over NIP-65 relay lists
//! - Pools that fan a query out to many relays and merge the answers
//! - Per-role pool singletons (`default`, `discovery`, `outbox`)
//! - Query deadlines and cancellation reaching every per-relay subscription
//!
//! # Example
//!
//! ```rust,no_run
//! use nostr_pool::{Filter, PoolRegistry, PoolsConfig, QueryOptions};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> nostr_pool::Result<()> {
//!     let registry = PoolRegistry::new(PoolsConfig::default())?;
//!     let pool = registry.default_pool()?;
//!
//!     let filter = Filter::new().kinds(vec![1]).limit(20);
//!     let events = pool
//!         .query(&[filter], QueryOptions::new().timeout(Duration::from_secs(3)))
//!         .await?;
//!     for event in events {
//!         println!("{} {}", event.id, event.content);
//!     }
//!
//!     registry.reset();
//!     Ok(())
//! }
//! ```

mod backoff;
mod config;
mod error;
mod executor;
pub mod memory;
mod message;
mod outbox;
mod pool;
mod registry;
mod relay;
mod router;
mod subscription;
mod transport;
mod url;

pub use backoff::ExponentialBackoff;
pub use config::{
    CONFIG_ENV_VAR, ConfigError, DEFAULT_DISCOVERY_RELAYS, DEFAULT_RELAYS, PoolsConfig,
    ReconnectConfig, UserRelayPreferences, config_path_from_env, load_config,
};
pub use error::{PoolError, Result};
pub use executor::{CancelReason, QueryContext, QueryOptions};
pub use message::{ClientMessage, Filter, MessageError, RelayMessage, matches_any};
pub use outbox::OutboxModel;
pub use pool::{
    PoolSettings, PublishOutcome, PublishStatus, RelayDescriptor, RelayPool, RelayPublishResult,
};
pub use registry::{PoolRegistry, PoolRole};
pub use relay::{
    ConnectionConfig, ConnectionState, PublishConfirmation, ReconnectPolicy, RelayConnection,
};
pub use router::{BroadcastRouter, OutboxRouter, ReadRouting, RelayRouter};
pub use subscription::{Subscription, SubscriptionMessage, SubscriptionState, generate_subscription_id};
pub use transport::{FrameSink, FrameStream, Transport, WebSocketTransport};
pub use url::{normalize_relay_url, normalize_relay_urls};

// Re-export the event model
pub use nostr::{Event, EventTemplate, Signer};

pub use tokio_util::sync::CancellationToken;
