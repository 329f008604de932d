//! Client side of the signaling relay: one WebSocket, reconnected after a
//! fixed delay for as long as anyone is listening.

use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use skiff_proto::{ClientMessage, PeerInfo, ServerMessage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Connected,
    Disconnected,
    PeerJoined(PeerInfo),
    PeerLeft(String),
    Signal { sender: String, data: Value },
}

/// Why a connection attempt or session ended.
enum Exit {
    /// The socket went away; try again after the delay.
    Dropped,
    /// Every handle is gone; stop for good.
    Stopped,
}

pub struct RelayClient {
    url: String,
    reconnect_delay: Duration,
    outbound: mpsc::UnboundedReceiver<ClientMessage>,
    events: mpsc::UnboundedSender<RelayEvent>,
}

impl RelayClient {
    /// Spawn the connection task. Messages sent while disconnected are
    /// dropped, matching a socket that is not open.
    pub fn spawn(
        url: impl Into<String>,
        reconnect_delay: Duration,
    ) -> (
        mpsc::UnboundedSender<ClientMessage>,
        mpsc::UnboundedReceiver<RelayEvent>,
        JoinHandle<()>,
    ) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let client = RelayClient {
            url: url.into(),
            reconnect_delay,
            outbound: outbound_rx,
            events: events_tx,
        };
        let handle = tokio::spawn(client.run());
        (outbound_tx, events_rx, handle)
    }

    async fn run(mut self) {
        loop {
            match self.session().await {
                Ok(Exit::Stopped) => break,
                Ok(Exit::Dropped) => {}
                Err(err) => warn!(url = %self.url, error = %err, "relay connection failed"),
            }
            if self.events.is_closed() {
                break;
            }
            debug!(delay_ms = self.reconnect_delay.as_millis() as u64, "reconnecting to relay");
            tokio::time::sleep(self.reconnect_delay).await;
        }
        debug!("relay client stopped");
    }

    async fn session(&mut self) -> Result<Exit> {
        let (ws, _) = connect_async(self.url.as_str())
            .await
            .with_context(|| format!("failed to connect to {}", self.url))?;
        let (mut write, mut read) = ws.split();

        // anything queued while disconnected is stale
        let mut stale = 0usize;
        while self.outbound.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            debug!(stale, "dropped messages queued while disconnected");
        }

        info!(url = %self.url, "connected to relay");
        if self.events.send(RelayEvent::Connected).is_err() {
            return Ok(Exit::Stopped);
        }

        let exit = loop {
            tokio::select! {
                incoming = read.next() => {
                    let message = match incoming {
                        Some(Ok(message)) => message,
                        Some(Err(err)) => {
                            warn!(error = %err, "relay socket error");
                            break Exit::Dropped;
                        }
                        None => break Exit::Dropped,
                    };
                    let text = match message {
                        Message::Text(text) => text,
                        Message::Binary(data) => match String::from_utf8(data) {
                            Ok(text) => text,
                            Err(_) => continue,
                        },
                        Message::Close(_) => break Exit::Dropped,
                        _ => continue,
                    };
                    match self.handle_text(&text) {
                        Some(reply) => {
                            let json = serde_json::to_string(&reply)?;
                            if write.send(Message::Text(json)).await.is_err() {
                                break Exit::Dropped;
                            }
                        }
                        None if self.events.is_closed() => break Exit::Stopped,
                        None => {}
                    }
                }
                outgoing = self.outbound.recv() => {
                    let Some(message) = outgoing else {
                        let _ = write.send(Message::Close(None)).await;
                        break Exit::Stopped;
                    };
                    let json = serde_json::to_string(&message)?;
                    trace!(len = json.len(), "relay send");
                    if write.send(Message::Text(json)).await.is_err() {
                        break Exit::Dropped;
                    }
                }
            }
        };

        info!(url = %self.url, "disconnected from relay");
        if self.events.send(RelayEvent::Disconnected).is_err() {
            return Ok(Exit::Stopped);
        }
        Ok(exit)
    }

    /// Forward one server message; returns a direct reply if one is owed.
    fn handle_text(&self, text: &str) -> Option<ClientMessage> {
        let message = match serde_json::from_str::<ServerMessage>(text) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "dropping unparseable relay message");
                return None;
            }
        };
        let event = match message {
            ServerMessage::PeerJoined { peer } => RelayEvent::PeerJoined(peer),
            ServerMessage::PeerLeft { peer_id } => RelayEvent::PeerLeft(peer_id),
            ServerMessage::Signal { sender, data } => RelayEvent::Signal { sender, data },
            ServerMessage::Ping => return Some(ClientMessage::Pong),
            ServerMessage::Pong => return None,
            ServerMessage::Error { message } => {
                warn!(%message, "relay reported an error");
                return None;
            }
        };
        let _ = self.events.send(event);
        None
    }
}
