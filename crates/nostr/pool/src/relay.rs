//! Single relay connection management
//!
//! One persistent socket to one relay, multiplexing any number of
//! subscriptions by id. Outbound frames fail fast with `NotConnected` unless
//! the socket is open. Inbound frames are broadcast on [`RelayConnection::messages`]
//! (the channel survives reconnects) and routed to per-subscription channels
//! and to publish waiters keyed by event id.

use crate::backoff::ExponentialBackoff;
use crate::error::{PoolError, Result};
use crate::message::{ClientMessage, Filter, RelayMessage};
use crate::subscription::SubscriptionMessage;
use crate::transport::{FrameSink, FrameStream, Transport};
use crate::url::normalize_relay_url;
use nostr::Event;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Never connected
    Disconnected,
    /// Connect attempt in flight
    Connecting,
    /// Connected and ready
    Open,
    /// Closed locally; terminal
    Closed,
    /// Connect failed or the socket was lost
    Errored,
}

/// Confirmation result for event publishing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishConfirmation {
    /// Event ID that was published
    pub event_id: String,
    /// Whether the relay accepted the event
    pub accepted: bool,
    /// Message from the relay (empty if accepted, reason if rejected)
    pub message: String,
}

/// How a dropped connection is re-established in the background.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// 0 = unlimited
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.initial_delay, self.max_delay, self.max_attempts)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 0,
        }
    }
}

/// Relay connection configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Bound on a single connect attempt
    pub connect_timeout: Duration,
    /// Background reconnect after an error; `None` disables it
    pub reconnect: Option<ReconnectPolicy>,
    /// Capacity of the `messages()` broadcast channel
    pub message_buffer: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            reconnect: None,
            message_buffer: 1024,
        }
    }
}

type AckSender = oneshot::Sender<PublishConfirmation>;

/// Puts the state back to `Disconnected` when a connect future is dropped
/// before the attempt settles.
struct AbandonedConnect<'a>(&'a watch::Sender<ConnectionState>);

impl Drop for AbandonedConnect<'_> {
    fn drop(&mut self) {
        self.0.send_if_modified(|state| {
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        });
    }
}

/// A registered publish waiter. Dropping it, on any path, removes the
/// sender from `pending_acks`.
struct PendingAck<'a> {
    conn: &'a RelayConnection,
    event_id: &'a str,
    rx: oneshot::Receiver<PublishConfirmation>,
}

impl Drop for PendingAck<'_> {
    fn drop(&mut self) {
        self.rx.close();
        self.conn.prune_acks(self.event_id);
    }
}

struct Shared {
    url: String,
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    state: watch::Sender<ConnectionState>,
    outbound: Mutex<Option<FrameSink>>,
    subscriptions: Mutex<HashMap<String, mpsc::UnboundedSender<SubscriptionMessage>>>,
    pending_acks: Mutex<HashMap<String, Vec<AckSender>>>,
    messages: broadcast::Sender<RelayMessage>,
    connect_lock: tokio::sync::Mutex<()>,
    /// Bumped on every successful connect so a stale reader can't tear down
    /// a newer socket.
    generation: AtomicU64,
    reconnecting: AtomicBool,
    shutdown: CancellationToken,
}

/// Connection to one relay. Cheap to clone; clones share the socket.
#[derive(Clone)]
pub struct RelayConnection {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for RelayConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConnection")
            .field("url", &self.shared.url)
            .field("state", &self.state())
            .finish()
    }
}

impl RelayConnection {
    /// Create a connection (does not connect yet)
    pub fn new(url: &str, transport: Arc<dyn Transport>, config: ConnectionConfig) -> Result<Self> {
        let url = normalize_relay_url(url)?;
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (messages, _) = broadcast::channel(config.message_buffer.max(1));

        Ok(Self {
            shared: Arc::new(Shared {
                url,
                config,
                transport,
                state,
                outbound: Mutex::new(None),
                subscriptions: Mutex::new(HashMap::new()),
                pending_acks: Mutex::new(HashMap::new()),
                messages,
                connect_lock: tokio::sync::Mutex::new(()),
                generation: AtomicU64::new(0),
                reconnecting: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Normalized relay URL
    pub fn url(&self) -> &str {
        &self.shared.url
    }

    /// Get current connection state
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watch connection state transitions
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Every parsed frame from the relay, across reconnects.
    pub fn messages(&self) -> broadcast::Receiver<RelayMessage> {
        self.shared.messages.subscribe()
    }

    /// Number of subscriptions currently routed through this connection
    pub fn subscription_count(&self) -> usize {
        self.shared.subscriptions.lock().len()
    }

    /// Publishes still waiting for the relay's OK
    pub fn pending_publish_count(&self) -> usize {
        self.shared.pending_acks.lock().values().map(Vec::len).sum()
    }

    /// Connect if not already open.
    ///
    /// Concurrent callers share one attempt; the attempt is bounded by the
    /// configured connect timeout.
    pub async fn connect(&self) -> Result<()> {
        let shared = &self.shared;
        if shared.shutdown.is_cancelled() {
            return Err(self.closed_error());
        }

        let _attempt = shared.connect_lock.lock().await;
        if self.is_open() {
            return Ok(());
        }
        if shared.shutdown.is_cancelled() {
            return Err(self.closed_error());
        }

        shared.state.send_replace(ConnectionState::Connecting);
        let _abandoned = AbandonedConnect(&shared.state);
        info!("Connecting to relay: {}", shared.url);

        let attempt = tokio::select! {
            _ = shared.shutdown.cancelled() => Err(self.closed_error()),
            result = timeout(shared.config.connect_timeout, shared.transport.connect(&shared.url)) => {
                match result {
                    Ok(result) => result,
                    Err(_) => Err(PoolError::Timeout(format!(
                        "Connection timeout after {:?}",
                        shared.config.connect_timeout
                    ))),
                }
            }
        };

        match attempt {
            Ok((sink, stream)) => {
                if shared.shutdown.is_cancelled() {
                    return Err(self.closed_error());
                }
                let generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
                *shared.outbound.lock() = Some(sink);
                shared.state.send_replace(ConnectionState::Open);
                info!("Connected to relay: {}", shared.url);
                self.spawn_reader(stream, generation);
                Ok(())
            }
            Err(e) => {
                if shared.shutdown.is_cancelled() {
                    shared.state.send_replace(ConnectionState::Closed);
                } else {
                    warn!("Failed to connect to {}: {}", shared.url, e);
                    shared.state.send_replace(ConnectionState::Errored);
                    self.spawn_reconnect();
                }
                Err(e)
            }
        }
    }

    /// Send a frame. Fails with `NotConnected` unless the socket is open.
    pub fn send(&self, msg: &ClientMessage) -> Result<()> {
        if !self.is_open() {
            return Err(PoolError::NotConnected);
        }

        let text = msg.to_json()?;
        debug!("Sending to {}: {}", self.shared.url, text);

        match self.shared.outbound.lock().as_ref() {
            Some(sink) => sink.send(text).map_err(|_| PoolError::NotConnected),
            None => Err(PoolError::NotConnected),
        }
    }

    /// Open a subscription and receive what the relay sends for it.
    ///
    /// The channel ends when the relay sends CLOSED, the socket is lost, or
    /// [`unsubscribe`](Self::unsubscribe) is called.
    pub fn subscribe(
        &self,
        subscription_id: &str,
        filters: &[Filter],
    ) -> Result<mpsc::UnboundedReceiver<SubscriptionMessage>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .subscriptions
            .lock()
            .insert(subscription_id.to_string(), tx);

        let req = ClientMessage::Req {
            subscription_id: subscription_id.to_string(),
            filters: filters.to_vec(),
        };
        if let Err(e) = self.send(&req) {
            self.shared.subscriptions.lock().remove(subscription_id);
            return Err(e);
        }
        Ok(rx)
    }

    /// Stop routing a subscription and send CLOSE if the socket is open.
    pub fn unsubscribe(&self, subscription_id: &str) {
        let was_routed = self
            .shared
            .subscriptions
            .lock()
            .remove(subscription_id)
            .is_some();
        if was_routed && self.is_open() {
            self.send_close(subscription_id);
        }
    }

    fn send_close(&self, subscription_id: &str) {
        let close = ClientMessage::Close {
            subscription_id: subscription_id.to_string(),
        };
        if let Err(e) = self.send(&close) {
            debug!(
                "Could not close {} on {}: {}",
                subscription_id, self.shared.url, e
            );
        }
    }

    /// Publish an event and wait for the relay's OK.
    pub async fn publish(
        &self,
        event: &Event,
        ack_timeout: Duration,
    ) -> Result<PublishConfirmation> {
        let (tx, rx) = oneshot::channel();
        self.shared
            .pending_acks
            .lock()
            .entry(event.id.clone())
            .or_default()
            .push(tx);
        let mut pending = PendingAck {
            conn: self,
            event_id: &event.id,
            rx,
        };

        self.send(&ClientMessage::Event(event.clone()))?;

        match timeout(ack_timeout, &mut pending.rx).await {
            Ok(Ok(confirmation)) => Ok(confirmation),
            Ok(Err(_)) => Err(PoolError::ConnectionClosed(format!(
                "{} dropped before acknowledging {}",
                self.shared.url, event.id
            ))),
            Err(_) => Err(PoolError::Timeout(format!(
                "Event confirmation timeout after {:?}",
                ack_timeout
            ))),
        }
    }

    fn prune_acks(&self, event_id: &str) {
        let mut acks = self.shared.pending_acks.lock();
        if let Some(waiters) = acks.get_mut(event_id) {
            waiters.retain(|tx| !tx.is_closed());
            if waiters.is_empty() {
                acks.remove(event_id);
            }
        }
    }

    /// Close the connection for good. Subscriptions end and publish waiters
    /// are released.
    pub fn close(&self) {
        self.shared.shutdown.cancel();
        self.shared.outbound.lock().take();
        self.shared.subscriptions.lock().clear();
        self.shared.pending_acks.lock().clear();
        if self.state() != ConnectionState::Closed {
            info!("Closed relay connection: {}", self.shared.url);
        }
        self.shared.state.send_replace(ConnectionState::Closed);
    }

    fn closed_error(&self) -> PoolError {
        PoolError::ConnectionClosed(format!("{} is closed", self.shared.url))
    }

    fn spawn_reader(&self, mut stream: FrameStream, generation: u64) {
        let conn = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = conn.shared.shutdown.cancelled() => return,
                    frame = stream.recv() => match frame {
                        Some(text) => conn.dispatch(&text),
                        None => break,
                    },
                }
            }
            conn.handle_disconnect(generation);
        });
    }

    fn dispatch(&self, text: &str) {
        let msg = match RelayMessage::from_json(text) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Dropping malformed frame from {}: {}", self.shared.url, e);
                return;
            }
        };
        // No receivers is fine.
        let _ = self.shared.messages.send(msg.clone());

        match msg {
            RelayMessage::Event {
                subscription_id,
                event,
            } => self.route(&subscription_id, SubscriptionMessage::Event(event)),
            RelayMessage::Eose { subscription_id } => {
                self.route(&subscription_id, SubscriptionMessage::Eose)
            }
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                debug!(
                    "Relay {} closed subscription {}: {}",
                    self.shared.url, subscription_id, message
                );
                if let Some(tx) = self.shared.subscriptions.lock().remove(&subscription_id) {
                    let _ = tx.send(SubscriptionMessage::Closed(message));
                }
            }
            RelayMessage::Ok {
                event_id,
                success,
                message,
            } => {
                let waiters = self.shared.pending_acks.lock().remove(&event_id);
                for tx in waiters.into_iter().flatten() {
                    let _ = tx.send(PublishConfirmation {
                        event_id: event_id.clone(),
                        accepted: success,
                        message: message.clone(),
                    });
                }
            }
            RelayMessage::Notice { message } => {
                info!("NOTICE from {}: {}", self.shared.url, message);
            }
        }
    }

    fn route(&self, subscription_id: &str, msg: SubscriptionMessage) {
        let abandoned = {
            let mut subs = self.shared.subscriptions.lock();
            match subs.get(subscription_id) {
                Some(tx) if tx.send(msg).is_err() => {
                    subs.remove(subscription_id);
                    true
                }
                _ => false,
            }
        };
        if abandoned {
            debug!(
                "Subscription {} on {} has no receiver, closing",
                subscription_id, self.shared.url
            );
            self.send_close(subscription_id);
        }
    }

    fn handle_disconnect(&self, generation: u64) {
        let shared = &self.shared;
        if shared.generation.load(Ordering::SeqCst) != generation
            || shared.shutdown.is_cancelled()
        {
            return;
        }

        shared.outbound.lock().take();
        let subscriptions = std::mem::take(&mut *shared.subscriptions.lock());
        let pending = std::mem::take(&mut *shared.pending_acks.lock());
        warn!(
            "Lost connection to {} ({} subscriptions, {} pending publishes dropped)",
            shared.url,
            subscriptions.len(),
            pending.len()
        );
        drop(subscriptions);
        drop(pending);

        shared.state.send_replace(ConnectionState::Errored);
        self.spawn_reconnect();
    }

    fn spawn_reconnect(&self) {
        let Some(policy) = self.shared.config.reconnect.clone() else {
            return;
        };
        if self.shared.shutdown.is_cancelled() || self.shared.reconnecting.swap(true, Ordering::SeqCst)
        {
            return;
        }

        let conn = self.clone();
        tokio::spawn(async move {
            let mut backoff = policy.backoff();
            while let Some(delay) = backoff.next_delay() {
                debug!(
                    "Reconnecting to {} in {:?} (attempt {})",
                    conn.shared.url,
                    delay,
                    backoff.attempt()
                );
                tokio::select! {
                    _ = conn.shared.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                if conn.is_open() || conn.connect().await.is_ok() {
                    break;
                }
            }
            conn.shared.reconnecting.store(false, Ordering::SeqCst);
        });
    }
}
