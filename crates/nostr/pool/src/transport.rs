//! Duplex text-frame transport beneath a relay connection.
//!
//! A transport turns a relay URL into a pair of channels: frames pushed into
//! the sink go to the relay, frames from the relay come out of the stream.
//! The stream ending means the socket is gone.

use crate::error::{PoolError, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Outbound half: text frames to the relay.
pub type FrameSink = mpsc::UnboundedSender<String>;

/// Inbound half: text frames from the relay.
pub type FrameStream = mpsc::UnboundedReceiver<String>;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a socket to `url`. Dropping the returned sink closes it.
    async fn connect(&self, url: &str) -> Result<(FrameSink, FrameStream)>;
}

/// WebSocket transport over `tokio-tungstenite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, url: &str) -> Result<(FrameSink, FrameStream)> {
        let (ws, _response) = connect_async(url)
            .await
            .map_err(|e| PoolError::Transport(e.to_string()))?;
        info!("WebSocket open: {}", url);

        let (mut ws_sink, mut ws_stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        let writer_url = url.to_string();
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = ws_sink.send(Message::Text(text.into())).await {
                    warn!("WebSocket send to {} failed: {}", writer_url, e);
                    return;
                }
            }
            // Sink dropped by the connection: close politely.
            let _ = ws_sink.send(Message::Close(None)).await;
            debug!("WebSocket writer for {} finished", writer_url);
        });

        let reader_url = url.to_string();
        tokio::spawn(async move {
            while let Some(frame) = ws_stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(text.as_str().to_string()).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        info!("Relay {} closed connection", reader_url);
                        break;
                    }
                    // Pings are answered by tungstenite itself.
                    Ok(_) => {}
                    Err(e) => {
                        warn!("WebSocket error from {}: {}", reader_url, e);
                        break;
                    }
                }
            }
        });

        Ok((out_tx, in_rx))
    }
}
