//! In-process relays.
//!
//! `MemoryTransport` hands out sockets to `MemoryRelay`s that speak the
//! relay side of the wire protocol: REQ is answered with matching stored
//! events and EOSE, EVENT is stored and acknowledged with OK, CLOSE ends the
//! subscription. Each relay can be told to misbehave so pools can be driven
//! through silence, rejection, refusal and socket loss without a network.

use crate::error::{PoolError, Result};
use crate::message::{ClientMessage, Filter, RelayMessage, matches_any};
use crate::transport::{FrameSink, FrameStream, Transport};
use crate::url::normalize_relay_url;
use async_trait::async_trait;
use nostr::{Event, sort_events};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Transport that connects to registered in-process relays.
#[derive(Default)]
pub struct MemoryTransport {
    relays: Mutex<HashMap<String, Arc<MemoryRelay>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a relay at `url`, or return the one already there.
    pub fn add_relay(&self, url: &str) -> Result<Arc<MemoryRelay>> {
        let url = normalize_relay_url(url)?;
        let mut relays = self.relays.lock();
        let relay = relays
            .entry(url.clone())
            .or_insert_with(|| Arc::new(MemoryRelay::new(url)));
        Ok(Arc::clone(relay))
    }

    pub fn relay(&self, url: &str) -> Option<Arc<MemoryRelay>> {
        let url = normalize_relay_url(url).ok()?;
        self.relays.lock().get(&url).cloned()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, url: &str) -> Result<(FrameSink, FrameStream)> {
        let relay = self
            .relay(url)
            .ok_or_else(|| PoolError::Transport(format!("connection refused: {}", url)))?;

        let (hang, delay) = {
            let state = relay.state.lock();
            (state.hang_connections, state.connect_delay)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        relay.accept()
    }
}

#[derive(Default)]
struct RelayState {
    events: Vec<Event>,
    silent: bool,
    withhold_eose: bool,
    reject_publishes: Option<String>,
    refuse_connections: bool,
    hang_connections: bool,
    connect_delay: Option<Duration>,
    connections: HashMap<u64, mpsc::UnboundedSender<String>>,
    subscriptions: BTreeMap<(u64, String), Vec<Filter>>,
    req_count: usize,
    connect_count: usize,
}

/// A scriptable relay living in the current process.
pub struct MemoryRelay {
    url: String,
    next_connection: AtomicU64,
    state: Mutex<RelayState>,
}

impl MemoryRelay {
    fn new(url: String) -> Self {
        Self {
            url,
            next_connection: AtomicU64::new(0),
            state: Mutex::new(RelayState::default()),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Add an event to the relay's store without acknowledging anything.
    pub fn store(&self, event: Event) {
        let mut state = self.state.lock();
        if !state.events.iter().any(|e| e.id == event.id) {
            state.events.push(event);
        }
    }

    pub fn stored_events(&self) -> Vec<Event> {
        self.state.lock().events.clone()
    }

    /// A silent relay accepts sockets and frames but never answers.
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().silent = silent;
    }

    /// Answer REQs with stored events but never send EOSE.
    pub fn set_withhold_eose(&self, withhold: bool) {
        self.state.lock().withhold_eose = withhold;
    }

    /// Answer every EVENT with `["OK", id, false, message]`.
    pub fn reject_publishes(&self, message: impl Into<String>) {
        self.state.lock().reject_publishes = Some(message.into());
    }

    pub fn accept_publishes(&self) {
        self.state.lock().reject_publishes = None;
    }

    pub fn set_refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse_connections = refuse;
    }

    /// Connect attempts never complete, like a black-holed TCP handshake.
    pub fn set_hang_connections(&self, hang: bool) {
        self.state.lock().hang_connections = hang;
    }

    /// Hold each connect attempt for `delay` before accepting it.
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        self.state.lock().connect_delay = delay;
    }

    /// Drop every open socket, as a crashing relay would.
    pub fn drop_connections(&self) {
        let mut state = self.state.lock();
        state.connections.clear();
        state.subscriptions.clear();
    }

    /// End every subscription named `subscription_id` with a CLOSED frame.
    pub fn close_subscription(&self, subscription_id: &str, reason: &str) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let closing: Vec<(u64, String)> = state
            .subscriptions
            .keys()
            .filter(|(_, sid)| sid == subscription_id)
            .cloned()
            .collect();
        for key in closing {
            state.subscriptions.remove(&key);
            if let Some(conn) = state.connections.get(&key.0) {
                let frame = RelayMessage::Closed {
                    subscription_id: key.1,
                    message: reason.to_string(),
                };
                let _ = conn.send(frame.to_json());
            }
        }
    }

    /// Subscriptions opened by REQ and not yet ended by CLOSE.
    pub fn open_subscriptions(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    /// Ids of the subscriptions currently open, in key order.
    pub fn open_subscription_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .subscriptions
            .keys()
            .map(|(_, sid)| sid.clone())
            .collect()
    }

    /// REQ frames received since creation.
    pub fn req_count(&self) -> usize {
        self.state.lock().req_count
    }

    /// Sockets currently open.
    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Sockets accepted since creation.
    pub fn connect_count(&self) -> usize {
        self.state.lock().connect_count
    }

    fn accept(self: &Arc<Self>) -> Result<(FrameSink, FrameStream)> {
        let (to_relay_tx, mut to_relay_rx) = mpsc::unbounded_channel::<String>();
        let (to_client_tx, to_client_rx) = mpsc::unbounded_channel::<String>();
        let connection_id = self.next_connection.fetch_add(1, Ordering::Relaxed);

        {
            let mut state = self.state.lock();
            if state.refuse_connections {
                return Err(PoolError::Transport(format!(
                    "connection refused: {}",
                    self.url
                )));
            }
            state.connections.insert(connection_id, to_client_tx);
            state.connect_count += 1;
        }

        let relay = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(frame) = to_relay_rx.recv().await {
                if !relay.handle_frame(connection_id, &frame) {
                    break;
                }
            }
            relay.disconnect(connection_id);
        });

        Ok((to_relay_tx, to_client_rx))
    }

    fn disconnect(&self, connection_id: u64) {
        let mut state = self.state.lock();
        state.connections.remove(&connection_id);
        state
            .subscriptions
            .retain(|(cid, _), _| *cid != connection_id);
    }

    /// Returns false once the socket has been dropped on the relay side.
    fn handle_frame(&self, connection_id: u64, frame: &str) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(conn) = state.connections.get(&connection_id).cloned() else {
            return false;
        };
        let send = |msg: RelayMessage| {
            let _ = conn.send(msg.to_json());
        };

        let msg = match ClientMessage::from_json(frame) {
            Ok(msg) => msg,
            Err(e) => {
                send(RelayMessage::Notice {
                    message: format!("error: {}", e),
                });
                return true;
            }
        };

        match msg {
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                state.req_count += 1;
                state
                    .subscriptions
                    .insert((connection_id, subscription_id.clone()), filters.clone());
                if state.silent {
                    return true;
                }
                for event in stored_matches(&state.events, &filters) {
                    send(RelayMessage::Event {
                        subscription_id: subscription_id.clone(),
                        event,
                    });
                }
                if !state.withhold_eose {
                    send(RelayMessage::Eose { subscription_id });
                }
            }
            ClientMessage::Close { subscription_id } => {
                state
                    .subscriptions
                    .remove(&(connection_id, subscription_id));
            }
            ClientMessage::Event(event) => {
                if state.silent {
                    return true;
                }
                let event_id = event.id.clone();
                if let Some(reason) = state.reject_publishes.clone() {
                    debug!("{} rejecting {}", self.url, event_id);
                    send(RelayMessage::Ok {
                        event_id,
                        success: false,
                        message: reason,
                    });
                    return true;
                }

                if !state.events.iter().any(|e| e.id == event_id) {
                    for ((cid, sid), filters) in &state.subscriptions {
                        if matches_any(filters, &event)
                            && let Some(live) = state.connections.get(cid)
                        {
                            let frame = RelayMessage::Event {
                                subscription_id: sid.clone(),
                                event: event.clone(),
                            };
                            let _ = live.send(frame.to_json());
                        }
                    }
                    state.events.push(event);
                }
                send(RelayMessage::Ok {
                    event_id,
                    success: true,
                    message: String::new(),
                });
            }
        }
        true
    }
}

/// Stored events matching any filter; each filter's `limit` keeps its newest.
fn stored_matches(events: &[Event], filters: &[Filter]) -> Vec<Event> {
    let mut out: Vec<Event> = Vec::new();
    for filter in filters {
        let mut matched: Vec<Event> = events.iter().filter(|e| filter.matches(e)).cloned().collect();
        sort_events(&mut matched);
        if let Some(limit) = filter.limit {
            matched.truncate(limit as usize);
        }
        for event in matched {
            if !out.iter().any(|e| e.id == event.id) {
                out.push(event);
            }
        }
    }
    out
}
