//! WebSocket relay transport.
//!
//! Each connection splits the socket into a writer task draining the outbound
//! channel and a reader task feeding the inbound channel. Either side closing
//! tears the other down: the reader drops its sender when the socket ends, the
//! writer sends a close frame once the outbound channel is dropped.

use super::{RelayConnection, RelayConnector};
use crate::errors::SignalingError;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

/// Buffer for frames in each direction.
const RELAY_CHANNEL_BUFFER: usize = 256;

/// Connects to the relay over `ws://` or `wss://`.
#[derive(Debug, Clone)]
pub struct WsRelayConnector {
    url: Url,
}

impl WsRelayConnector {
    pub fn new(relay_url: &str) -> Result<Self, SignalingError> {
        let url = Url::parse(relay_url).map_err(|e| SignalingError::InvalidUrl(e.to_string()))?;
        match url.scheme() {
            "ws" | "wss" => Ok(Self { url }),
            other => Err(SignalingError::InvalidUrl(format!(
                "unsupported scheme '{other}'"
            ))),
        }
    }
}

#[async_trait]
impl RelayConnector for WsRelayConnector {
    async fn connect(&self) -> Result<RelayConnection, SignalingError> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| SignalingError::Connect(format!("websocket connect failed: {e}")))?;
        debug!(
            target: "mesh.session.signaling",
            host = self.url.host_str().unwrap_or_default(),
            "Relay websocket connected"
        );
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (outbound, mut outbound_rx) = mpsc::channel::<String>(RELAY_CHANNEL_BUFFER);
        let (inbound_tx, inbound) = mpsc::channel::<String>(RELAY_CHANNEL_BUFFER);

        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if ws_write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(
                            target: "mesh.session.signaling",
                            error = %e,
                            "Relay websocket error"
                        );
                        break;
                    }
                };
                if inbound_tx.send(text).await.is_err() {
                    break;
                }
            }
            debug!(target: "mesh.session.signaling", "Relay websocket reader finished");
        });

        Ok(RelayConnection { outbound, inbound })
    }
}
