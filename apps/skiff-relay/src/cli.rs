use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use skiff_proto::{ClientMessage, DeviceClass, DeviceInfo, ServerMessage};
use skiff_relay::config::{Config, DuplicatePolicy};
use tokio::time::{timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "skiff-relay")]
#[command(about = "Skiff rendezvous relay and roster probe")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the relay (default when no command is given)
    Serve(ServeArgs),
    /// Join a relay under a throwaway id and print the roster it reports
    Roster {
        /// Relay WebSocket URL
        #[arg(short, long, default_value = "ws://127.0.0.1:3030/ws")]
        url: String,

        /// How long to collect peer-joined messages
        #[arg(long, default_value_t = 2)]
        wait_secs: u64,
    },
}

#[derive(clap::Args, Debug, Default)]
pub struct ServeArgs {
    /// Port to listen on (env: SKIFF_RELAY_PORT, PORT)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Address to bind (env: SKIFF_RELAY_BIND)
    #[arg(long)]
    pub bind: Option<String>,

    /// Seconds between heartbeat pings (env: SKIFF_HEARTBEAT_SECS)
    #[arg(long)]
    pub heartbeat_secs: Option<u64>,

    /// Policy for a join whose id is already connected (env: SKIFF_DUPLICATE_ID_POLICY)
    #[arg(long, value_enum)]
    pub duplicate_id_policy: Option<DuplicatePolicy>,
}

impl ServeArgs {
    pub fn apply(&self, mut config: Config) -> Config {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(bind) = &self.bind {
            config.bind = bind.clone();
        }
        if let Some(secs) = self.heartbeat_secs.filter(|secs| *secs > 0) {
            config.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(policy) = self.duplicate_id_policy {
            config.duplicate_policy = policy;
        }
        config
    }
}

pub async fn run_roster_probe(url: String, wait: Duration) -> Result<()> {
    let (ws, _) = connect_async(url.as_str())
        .await
        .with_context(|| format!("failed to connect to {url}"))?;
    let (mut write, mut read) = ws.split();

    let probe_id = format!("probe-{}", std::process::id());
    let join = ClientMessage::Join {
        sender: probe_id.clone(),
        device: DeviceInfo {
            model: "Skiff Relay Probe".to_string(),
            class: DeviceClass::Desktop,
        },
    };
    write
        .send(Message::Text(serde_json::to_string(&join)?))
        .await
        .context("failed to send join")?;

    let deadline = Instant::now() + wait;
    let mut count = 0usize;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let next = match timeout(remaining, read.next()).await {
            Ok(Some(frame)) => frame.context("relay connection failed")?,
            Ok(None) => return Err(anyhow!("relay closed the connection")),
            Err(_) => break,
        };
        let Message::Text(text) = next else { continue };
        match serde_json::from_str::<ServerMessage>(&text) {
            Ok(ServerMessage::PeerJoined { peer }) => {
                count += 1;
                println!("{}\t{}\t{}", peer.id, peer.class.as_str(), peer.model);
            }
            Ok(ServerMessage::Error { message }) => return Err(anyhow!("relay error: {message}")),
            Ok(other) => debug!(?other, "ignoring relay message"),
            Err(err) => debug!(error = %err, "ignoring unparseable relay message"),
        }
    }

    let _ = write.send(Message::Close(None)).await;
    println!("{count} peer(s) connected");
    Ok(())
}
