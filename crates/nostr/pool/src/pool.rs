//! Relay pool: one logical query/publish API over many relay connections.
//!
//! A query is routed, sent to every selected relay under one subscription
//! id, and merged as events arrive: the first copy of each event id wins,
//! later copies are dropped. A relay is done once it sends EOSE, closes the
//! subscription, or loses its socket. The query ends when every relay is
//! done or its [`QueryContext`] fires, and no per-relay subscription
//! outlives it.
//!
//! A publish goes to the routed relays concurrently and succeeds when at
//! least one of them accepts.

use crate::error::{PoolError, Result};
use crate::executor::{CancelReason, QueryContext, QueryOptions};
use crate::message::{Filter, matches_any};
use crate::registry::PoolRole;
use crate::relay::{ConnectionConfig, ConnectionState, RelayConnection};
use crate::router::RelayRouter;
use crate::subscription::{
    Subscription, SubscriptionMessage, SubscriptionState, generate_subscription_id,
};
use crate::transport::Transport;
use crate::url::{normalize_relay_url, normalize_relay_urls};
use futures::future::join_all;
use futures::stream::{self, BoxStream, StreamExt, select_all};
use nostr::{Clock, Event, EventTemplate, Signer, get_event_hash, sign_template, validate_event, verify_event};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Static settings of one pool.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Configured relay set, in priority order
    pub relays: Vec<String>,
    /// Default deadline for `query`
    pub query_timeout: Duration,
    /// Per-relay bound on `publish`, connect included
    pub publish_timeout: Duration,
    /// Verify event signatures during queries (ids are always checked)
    pub verify_signatures: bool,
    pub connection: ConnectionConfig,
}

impl PoolSettings {
    pub fn new<I, S>(relays: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            relays: relays.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            query_timeout: Duration::from_secs(5),
            publish_timeout: Duration::from_secs(3),
            verify_signatures: true,
            connection: ConnectionConfig::default(),
        }
    }
}

/// A relay known to a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayDescriptor {
    pub url: String,
    pub role: PoolRole,
    pub state: ConnectionState,
}

/// How one relay answered a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishStatus {
    Accepted(String),
    Rejected(String),
    TimedOut,
    /// The relay could not be reached or dropped mid-publish
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayPublishResult {
    pub relay: String,
    pub status: PublishStatus,
}

/// A publish at least one relay accepted.
#[derive(Debug, Clone)]
pub struct PublishOutcome {
    pub event_id: String,
    pub results: Vec<RelayPublishResult>,
}

impl PublishOutcome {
    pub fn is_accepted(&self) -> bool {
        self.results
            .iter()
            .any(|r| matches!(r.status, PublishStatus::Accepted(_)))
    }

    /// Relays that accepted, in routing order.
    pub fn accepted_by(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| matches!(r.status, PublishStatus::Accepted(_)))
            .map(|r| r.relay.as_str())
            .collect()
    }

    /// Relays that did not accept, in routing order.
    pub fn failed(&self) -> Vec<&RelayPublishResult> {
        self.results
            .iter()
            .filter(|r| !matches!(r.status, PublishStatus::Accepted(_)))
            .collect()
    }
}

type SubscriptionMap = Arc<Mutex<HashMap<String, Subscription>>>;

pub struct RelayPool {
    role: PoolRole,
    settings: PoolSettings,
    relay_urls: Vec<String>,
    router: Arc<dyn RelayRouter>,
    transport: Arc<dyn Transport>,
    connections: Mutex<BTreeMap<String, RelayConnection>>,
    subscriptions: SubscriptionMap,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for RelayPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayPool")
            .field("role", &self.role)
            .field("relays", &self.relay_urls)
            .finish_non_exhaustive()
    }
}

impl RelayPool {
    /// Build a pool. Connections are allocated for the configured relays but
    /// nothing touches the network until the first query or publish.
    pub fn new(
        role: PoolRole,
        settings: PoolSettings,
        router: Arc<dyn RelayRouter>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let relay_urls = normalize_relay_urls(&settings.relays)?;
        let mut connections = BTreeMap::new();
        for url in &relay_urls {
            let conn = RelayConnection::new(url, transport.clone(), settings.connection.clone())?;
            connections.insert(url.clone(), conn);
        }

        Ok(Self {
            role,
            settings,
            relay_urls,
            router,
            transport,
            connections: Mutex::new(connections),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn role(&self) -> PoolRole {
        self.role
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Configured relay set, normalized
    pub fn relay_urls(&self) -> &[String] {
        &self.relay_urls
    }

    pub fn router(&self) -> &Arc<dyn RelayRouter> {
        &self.router
    }

    /// Every relay this pool holds a connection for, configured or routed to.
    pub fn relays(&self) -> Vec<RelayDescriptor> {
        self.connections
            .lock()
            .values()
            .map(|conn| RelayDescriptor {
                url: conn.url().to_string(),
                role: self.role,
                state: conn.state(),
            })
            .collect()
    }

    /// Connection for `url`, created on first use.
    pub fn connection(&self, url: &str) -> Result<RelayConnection> {
        if self.shutdown.is_cancelled() {
            return Err(PoolError::Cancelled);
        }
        let url = normalize_relay_url(url)?;
        let mut connections = self.connections.lock();
        if let Some(conn) = connections.get(&url) {
            return Ok(conn.clone());
        }
        let conn = RelayConnection::new(&url, self.transport.clone(), self.settings.connection.clone())?;
        connections.insert(url, conn.clone());
        Ok(conn)
    }

    /// Subscriptions of queries currently in flight.
    pub fn active_subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions.lock().values().cloned().collect()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Cancel every in-flight query and close every connection.
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!("Shutting down {} pool", self.role);
        self.shutdown.cancel();
        for conn in self.connections.lock().values() {
            conn.close();
        }
    }

    /// Fetch every stored event matching `filters` from the routed relays.
    ///
    /// The result is de-duplicated by id and has no particular order.
    pub async fn query(&self, filters: &[Filter], options: QueryOptions) -> Result<Vec<Event>> {
        if self.shutdown.is_cancelled() {
            return Err(PoolError::Cancelled);
        }

        let routing = self.router.route_read(filters, &self.relay_urls);
        if routing.is_empty() {
            return Err(PoolError::ConnectionUnavailable(
                "no relays routed for query".to_string(),
            ));
        }

        let ctx = QueryContext::new(&self.shutdown, &options, self.settings.query_timeout);
        let subscription_id = generate_subscription_id();
        let guard = QueryGuard::new(
            Subscription::new(
                subscription_id.clone(),
                filters.to_vec(),
                routing.keys().cloned().collect(),
            ),
            self.subscriptions.clone(),
        );
        debug!(
            "Query {} routed to {} relays on {} pool",
            subscription_id,
            routing.len(),
            self.role
        );

        let cancelled = ctx.cancelled();
        tokio::pin!(cancelled);

        // Each relay connects and subscribes inside its own stream, so a slow
        // or hung connect only holds back that relay.
        let streams = routing.iter().map(|(url, relay_filters)| {
            relay_stream(
                url.clone(),
                self.open_relay_subscription(&guard, &subscription_id, url, relay_filters),
                ctx.token().clone(),
            )
        });
        guard.set_state(SubscriptionState::AwaitingEose);

        let mut merged = select_all(streams);
        let mut seen: HashSet<String> = HashSet::new();
        let mut events: Vec<Event> = Vec::new();
        let mut done: HashSet<String> = HashSet::new();
        let mut completed = 0usize;

        let stopped = loop {
            tokio::select! {
                biased;
                reason = &mut cancelled => break Some(reason),
                item = merged.next() => match item {
                    None => break None,
                    Some((url, RelayItem::Message(SubscriptionMessage::Event(event)))) => {
                        let relay_filters = routing.get(&url).map(Vec::as_slice).unwrap_or(filters);
                        if seen.contains(&event.id) {
                            continue;
                        }
                        if let Err(reason) = self.check_event(&event, relay_filters) {
                            debug!("MalformedEvent from {}: {} ({})", url, event.id, reason);
                            continue;
                        }
                        seen.insert(event.id.clone());
                        events.push(event);
                    }
                    Some((url, RelayItem::Message(SubscriptionMessage::Eose))) => {
                        if done.insert(url.clone()) {
                            completed += 1;
                            guard.mark_eose(&url);
                            guard.close_relay(&url);
                        }
                    }
                    Some((url, RelayItem::Message(SubscriptionMessage::Closed(reason)))) => {
                        if done.insert(url.clone()) {
                            debug!("Relay {} closed query {}: {}", url, subscription_id, reason);
                        }
                    }
                    Some((url, RelayItem::End)) => {
                        if done.insert(url.clone()) {
                            debug!("Relay {} dropped out of query {}", url, subscription_id);
                        }
                    }
                },
            }
        };

        drop(merged);
        ctx.finish();
        drop(guard);

        debug!(
            "Query {} finished: {} events, {}/{} relays completed",
            subscription_id,
            events.len(),
            completed,
            routing.len()
        );

        match stopped {
            Some(CancelReason::Deadline) if completed == 0 && events.is_empty() => {
                Err(PoolError::AggregateTimeout(ctx.timeout()))
            }
            Some(CancelReason::Deadline) => Ok(events),
            Some(reason) => Err(stopped_error(reason, &ctx)),
            None if completed == 0 && events.is_empty() => Err(PoolError::ConnectionUnavailable(
                format!("all {} routed relays failed", routing.len()),
            )),
            None => Ok(events),
        }
    }

    async fn open_relay_subscription(
        &self,
        guard: &QueryGuard,
        subscription_id: &str,
        url: &str,
        filters: &[Filter],
    ) -> Option<mpsc::UnboundedReceiver<SubscriptionMessage>> {
        let conn = match self.connection(url) {
            Ok(conn) => conn,
            Err(e) => {
                debug!("Skipping relay {}: {}", url, e);
                return None;
            }
        };
        if let Err(e) = conn.connect().await {
            debug!("Skipping unreachable relay {}: {}", url, e);
            return None;
        }
        match conn.subscribe(subscription_id, filters) {
            Ok(rx) => {
                guard.track(conn);
                Some(rx)
            }
            Err(e) => {
                debug!("Could not subscribe on {}: {}", url, e);
                None
            }
        }
    }

    fn check_event(&self, event: &Event, filters: &[Filter]) -> std::result::Result<(), String> {
        if !validate_event(event) {
            return Err("malformed id, pubkey or sig".to_string());
        }
        if !matches_any(filters, event) {
            return Err("does not match the subscription filters".to_string());
        }
        if self.settings.verify_signatures {
            return match verify_event(event) {
                Ok(true) => Ok(()),
                Ok(false) => Err("id or signature does not verify".to_string()),
                Err(e) => Err(e.to_string()),
            };
        }
        match get_event_hash(&event.unsigned()) {
            Ok(id) if id == event.id => Ok(()),
            Ok(_) => Err("id does not match content".to_string()),
            Err(e) => Err(e.to_string()),
        }
    }

    /// Send a signed event to the routed relays.
    ///
    /// Succeeds when at least one relay accepts; otherwise every per-relay
    /// result is returned in [`PoolError::PublishRejectedByAll`].
    pub async fn publish(&self, event: &Event) -> Result<PublishOutcome> {
        if self.shutdown.is_cancelled() {
            return Err(PoolError::Cancelled);
        }
        match verify_event(event) {
            Ok(true) => {}
            Ok(false) => {
                return Err(PoolError::InvalidEvent(
                    "id or signature does not verify".to_string(),
                ));
            }
            Err(e) => return Err(PoolError::InvalidEvent(e.to_string())),
        }

        let targets = self.router.route_write(event, &self.relay_urls);
        if targets.is_empty() {
            return Err(PoolError::ConnectionUnavailable(
                "no relays routed for publish".to_string(),
            ));
        }
        info!("Publishing {} to {} relays", event.id, targets.len());

        let results = join_all(targets.iter().map(|url| self.publish_to(url, event))).await;
        let outcome = PublishOutcome {
            event_id: event.id.clone(),
            results,
        };

        if outcome.is_accepted() {
            for failed in outcome.failed() {
                debug!("Publish of {} not accepted by {}: {:?}", event.id, failed.relay, failed.status);
            }
            Ok(outcome)
        } else {
            warn!("Publish of {} rejected by all {} relays", event.id, outcome.results.len());
            Err(PoolError::PublishRejectedByAll {
                event_id: outcome.event_id,
                results: outcome.results,
            })
        }
    }

    async fn publish_to(&self, url: &str, event: &Event) -> RelayPublishResult {
        let publish_timeout = self.settings.publish_timeout;
        let deadline = Instant::now() + publish_timeout;
        let attempt = async {
            let conn = self.connection(url)?;
            conn.connect().await?;
            // The ack wait gets whatever the connect left over.
            conn.publish(event, deadline.saturating_duration_since(Instant::now()))
                .await
        };

        let status = tokio::select! {
            _ = self.shutdown.cancelled() => PublishStatus::Unavailable("pool shut down".to_string()),
            result = tokio::time::timeout(publish_timeout, attempt) => match result {
                Err(_) | Ok(Err(PoolError::Timeout(_))) => PublishStatus::TimedOut,
                Ok(Ok(confirmation)) if confirmation.accepted => {
                    PublishStatus::Accepted(confirmation.message)
                }
                Ok(Ok(confirmation)) => PublishStatus::Rejected(confirmation.message),
                Ok(Err(e)) => PublishStatus::Unavailable(e.to_string()),
            },
        };

        RelayPublishResult {
            relay: url.to_string(),
            status,
        }
    }

    /// Sign `template` through the external signer, stamped by `clock`, and
    /// publish the result.
    pub async fn publish_template(
        &self,
        signer: &dyn Signer,
        clock: &dyn Clock,
        template: EventTemplate,
    ) -> Result<PublishOutcome> {
        let event = sign_template(signer, clock, template).await?;
        self.publish(&event).await
    }
}

impl Drop for RelayPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn stopped_error(reason: CancelReason, ctx: &QueryContext) -> PoolError {
    match reason {
        CancelReason::Deadline => PoolError::AggregateTimeout(ctx.timeout()),
        CancelReason::Caller | CancelReason::Shutdown => PoolError::Cancelled,
    }
}

enum RelayItem {
    Message(SubscriptionMessage),
    /// The relay's channel ended
    End,
}

/// One relay's side of a query: open the subscription, relay its messages,
/// then end with [`RelayItem::End`]. A relay that can't be opened yields only
/// the `End`. The token stops the stream whether the relay is still
/// connecting or already streaming.
fn relay_stream<'a>(
    url: String,
    opening: impl Future<Output = Option<mpsc::UnboundedReceiver<SubscriptionMessage>>> + Send + 'a,
    token: CancellationToken,
) -> BoxStream<'a, (String, RelayItem)> {
    let end_url = url.clone();
    stream::once(opening)
        .filter_map(futures::future::ready)
        .flat_map(|rx| {
            stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|msg| (msg, rx)) })
        })
        .take_until(token.cancelled_owned())
        .map(move |msg| (url.clone(), RelayItem::Message(msg)))
        .chain(stream::once(async move { (end_url, RelayItem::End) }))
        .boxed()
}

/// Owns the per-relay subscriptions of one query. Dropping it sends CLOSE
/// to every relay still subscribed and retires the subscription record.
struct QueryGuard {
    subscription_id: String,
    registry: SubscriptionMap,
    open: Mutex<Vec<RelayConnection>>,
}

impl QueryGuard {
    fn new(record: Subscription, registry: SubscriptionMap) -> Self {
        let subscription_id = record.id.clone();
        registry.lock().insert(subscription_id.clone(), record);
        Self {
            subscription_id,
            registry,
            open: Mutex::new(Vec::new()),
        }
    }

    fn track(&self, conn: RelayConnection) {
        self.open.lock().push(conn);
    }

    fn set_state(&self, state: SubscriptionState) {
        if let Some(record) = self.registry.lock().get_mut(&self.subscription_id) {
            record.state = state;
        }
    }

    fn mark_eose(&self, url: &str) {
        if let Some(record) = self.registry.lock().get_mut(&self.subscription_id) {
            record.mark_eose(url);
        }
    }

    /// Close one relay's subscription early, e.g. after its EOSE.
    fn close_relay(&self, url: &str) {
        let conn = {
            let mut open = self.open.lock();
            open.iter()
                .position(|c| c.url() == url)
                .map(|pos| open.swap_remove(pos))
        };
        if let Some(conn) = conn {
            conn.unsubscribe(&self.subscription_id);
        }
    }
}

impl Drop for QueryGuard {
    fn drop(&mut self) {
        for conn in self.open.get_mut().drain(..) {
            conn.unsubscribe(&self.subscription_id);
        }
        if let Some(mut record) = self.registry.lock().remove(&self.subscription_id) {
            record.state = SubscriptionState::Closed;
            debug!(
                "Closed subscription {} ({} of {} relays sent EOSE)",
                record.id,
                record.eose_relays.len(),
                record.relays.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;
    use crate::router::BroadcastRouter;
    use nostr::{FixedClock, Keys, NoSigner};

    fn pool_with(transport: Arc<MemoryTransport>, urls: &[&str]) -> RelayPool {
        for url in urls {
            transport.add_relay(url).unwrap();
        }
        RelayPool::new(
            PoolRole::Default,
            PoolSettings::new(urls.iter().copied()),
            Arc::new(BroadcastRouter::new(2)),
            transport,
        )
        .unwrap()
    }

    #[test]
    fn test_new_rejects_bad_urls() {
        let result = RelayPool::new(
            PoolRole::Default,
            PoolSettings::new(["https://nope.example"]),
            Arc::new(BroadcastRouter::default()),
            Arc::new(MemoryTransport::new()),
        );
        assert!(matches!(result, Err(PoolError::InvalidUrl(_))));
    }

    #[test]
    fn test_construction_is_offline() {
        let transport = Arc::new(MemoryTransport::new());
        let pool = pool_with(transport.clone(), &["wss://a.example", "wss://b.example/"]);

        assert_eq!(pool.relay_urls(), ["wss://a.example", "wss://b.example"]);
        assert!(
            pool.relays()
                .iter()
                .all(|r| r.state == ConnectionState::Disconnected && r.role == PoolRole::Default)
        );
        assert_eq!(transport.relay("wss://a.example").unwrap().connect_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_template_signs_and_publishes() {
        let transport = Arc::new(MemoryTransport::new());
        let pool = pool_with(transport.clone(), &["wss://a.example"]);
        let keys = Keys::generate();

        let outcome = pool
            .publish_template(&keys, &FixedClock(1_700_000_000), EventTemplate::new(1, "hi"))
            .await
            .unwrap();

        assert_eq!(outcome.accepted_by(), vec!["wss://a.example"]);
        let stored = transport.relay("wss://a.example").unwrap().stored_events();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].pubkey, keys.public_key_hex());
        assert_eq!(stored[0].created_at, 1_700_000_000);
    }

    #[tokio::test]
    async fn test_publish_template_without_identity() {
        let pool = pool_with(Arc::new(MemoryTransport::new()), &["wss://a.example"]);
        let result = pool
            .publish_template(&NoSigner, &FixedClock(1), EventTemplate::new(1, "hi"))
            .await;
        assert!(matches!(result, Err(PoolError::Signer(_))));
    }

    #[tokio::test]
    async fn test_publish_rejects_unsigned_event() {
        let pool = pool_with(Arc::new(MemoryTransport::new()), &["wss://a.example"]);
        let keys = Keys::generate();
        let mut event = sign_template(&keys, &FixedClock(1), EventTemplate::new(1, "hi"))
            .await
            .unwrap();
        event.content = "changed".to_string();

        assert!(matches!(
            pool.publish(&event).await,
            Err(PoolError::InvalidEvent(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let transport = Arc::new(MemoryTransport::new());
        let pool = pool_with(transport.clone(), &["wss://a.example"]);
        pool.connection("wss://a.example").unwrap().connect().await.unwrap();

        pool.shutdown();
        assert!(pool.is_shut_down());
        assert!(pool.relays().iter().all(|r| r.state == ConnectionState::Closed));
        assert!(matches!(
            pool.query(&[Filter::new()], QueryOptions::new()).await,
            Err(PoolError::Cancelled)
        ));
        assert!(matches!(pool.connection("wss://b.example"), Err(PoolError::Cancelled)));
    }

    #[test]
    fn test_publish_outcome_helpers() {
        let outcome = PublishOutcome {
            event_id: "e".to_string(),
            results: vec![
                RelayPublishResult {
                    relay: "wss://a.example".to_string(),
                    status: PublishStatus::Rejected("blocked".to_string()),
                },
                RelayPublishResult {
                    relay: "wss://b.example".to_string(),
                    status: PublishStatus::Accepted(String::new()),
                },
            ],
        };
        assert!(outcome.is_accepted());
        assert_eq!(outcome.accepted_by(), vec!["wss://b.example"]);
        assert_eq!(outcome.failed().len(), 1);
    }
}
