use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};

use crate::config::{normalize_relay_url, ClientConfig};
use crate::identity::LocalIdentity;
use crate::relay::RelayClient;
use crate::session::{SendOutcome, Session, SessionEvent, SessionHandle};
use crate::terminal::cli::{Cli, Command, ListenArgs, PeersArgs, SendArgs};
use crate::terminal::error::CliError;
use crate::transport::webrtc::WebRtcLinkFactory;
use crate::transport::{Artifact, OutgoingFile};

pub async fn run(cli: Cli) -> Result<(), CliError> {
    let mut config = ClientConfig::from_env();
    if let Some(raw) = cli.relay_url.as_deref() {
        config.relay_url =
            normalize_relay_url(raw).ok_or_else(|| CliError::InvalidRelayUrl(raw.to_string()))?;
    }

    let identity_path = identity_file(cli.identity, &cli.command)?;
    let identity = match &identity_path {
        Some(path) => LocalIdentity::load_or_create(path, cli.device_class)?,
        None => LocalIdentity::generate(cli.device_class.unwrap_or_default()),
    };

    match cli.command {
        Command::Whoami => {
            println!("id:    {}", identity.id);
            println!("name:  {}", identity.name);
            println!("type:  {}", identity.class.as_str());
            if let Some(path) = &identity_path {
                println!("file:  {}", path.display());
            }
            Ok(())
        }
        Command::Listen(args) => listen(&config, identity, args).await,
        Command::Send(args) => send(&config, identity, args).await,
        Command::Peers(args) => peers(&config, identity, args).await,
    }
}

/// Where the identity comes from. `send` and `peers` join under a throwaway
/// identity unless a file is named, so they do not collide with a `listen`
/// on the same host.
fn identity_file(explicit: Option<PathBuf>, command: &Command) -> Result<Option<PathBuf>, CliError> {
    match (explicit, command) {
        (Some(path), _) => Ok(Some(path)),
        (None, Command::Send(_) | Command::Peers(_)) => Ok(None),
        (None, Command::Listen(_) | Command::Whoami) => Ok(Some(LocalIdentity::default_path()?)),
    }
}

/// A running relay client plus orchestrator.
struct Running {
    handle: SessionHandle,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    session: JoinHandle<()>,
    relay: JoinHandle<()>,
}

impl Running {
    fn start(config: &ClientConfig, identity: LocalIdentity) -> Self {
        info!(relay = %config.relay_url, id = %identity.id, "starting session");
        let (relay_tx, relay_rx, relay) =
            RelayClient::spawn(config.relay_url.clone(), config.reconnect_delay);
        let factory = Arc::new(WebRtcLinkFactory::new(&config.stun_urls));
        let (session, handle, events) =
            Session::new(identity, config.flow, factory, relay_tx, relay_rx);
        Self {
            handle,
            events,
            session: tokio::spawn(session.run()),
            relay,
        }
    }

    async fn stop(self) {
        self.handle.shutdown();
        let _ = self.session.await;
        self.relay.abort();
    }
}

async fn listen(
    config: &ClientConfig,
    identity: LocalIdentity,
    args: ListenArgs,
) -> Result<(), CliError> {
    tokio::fs::create_dir_all(&args.output).await?;
    println!(
        "listening as {} ({}); saving to {}",
        identity.id,
        identity.name,
        args.output.display()
    );
    let mut running = Running::start(config, identity);

    loop {
        let event = tokio::select! {
            event = running.events.recv() => event,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(event) = event else { break };
        match event {
            SessionEvent::RelayConnected => println!("connected to relay"),
            SessionEvent::RelayDisconnected => println!("relay connection lost; retrying"),
            SessionEvent::PeerDiscovered(peer) => {
                println!("+ {} {} ({})", peer.id, peer.model, peer.class.as_str())
            }
            SessionEvent::PeerRemoved(peer_id) => println!("- {peer_id}"),
            SessionEvent::PeerConnected(peer_id) => debug!(peer_id = %peer_id, "peer connected"),
            SessionEvent::TransferIncoming {
                peer_id,
                name,
                size,
                ..
            } => println!("receiving {name} ({size} bytes) from {peer_id}"),
            SessionEvent::TransferProgress { name, fraction, .. } => {
                debug!(name = %name, percent = (fraction * 100.0).round() as u32, "progress")
            }
            SessionEvent::TransferComplete { peer_id, artifact } => {
                let path = save_artifact(&args.output, &artifact).await?;
                println!("saved {} from {peer_id}", path.display());
                if args.once {
                    break;
                }
            }
            SessionEvent::TransferSent { .. } => {}
            SessionEvent::TransferFailed {
                peer_id,
                name,
                reason,
            } => println!("transfer {name} with {peer_id} failed: {reason}"),
        }
    }

    running.stop().await;
    Ok(())
}

async fn send(config: &ClientConfig, identity: LocalIdentity, args: SendArgs) -> Result<(), CliError> {
    let file = OutgoingFile::from_path(&args.path).await?;
    let (name, size) = (file.name.clone(), file.size);
    let mut running = Running::start(config, identity);

    let wait = Duration::from_secs(args.wait_secs);
    if let Err(err) = wait_until_connected(&mut running.events, &args.peer_id, wait).await {
        running.stop().await;
        return Err(err);
    }

    println!("sending {name} ({size} bytes) to {}", args.peer_id);
    let result = running.handle.send_file_and_wait(&args.peer_id, file).await;
    running.stop().await;
    match result? {
        SendOutcome::Sent => {
            println!("sent {name}");
            Ok(())
        }
        outcome => Err(CliError::SendRejected {
            peer_id: args.peer_id,
            outcome,
        }),
    }
}

async fn peers(config: &ClientConfig, identity: LocalIdentity, args: PeersArgs) -> Result<(), CliError> {
    let mut running = Running::start(config, identity);
    let deadline = Instant::now() + Duration::from_secs(args.wait_secs);
    while let Ok(Some(_)) = timeout_at(deadline, running.events.recv()).await {}

    let peers = running.handle.peers().await?;
    running.stop().await;
    if peers.is_empty() {
        println!("no peers online");
    }
    for peer in peers {
        println!(
            "{}\t{}\t{}",
            peer.info.id,
            peer.info.class.as_str(),
            peer.info.model
        );
    }
    Ok(())
}

/// Wait until `peer_id` has an open channel. Fails with `PeerNotFound` if it
/// never showed up and `PeerUnreachable` if it did but never connected.
async fn wait_until_connected(
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    peer_id: &str,
    wait: Duration,
) -> Result<(), CliError> {
    let deadline = Instant::now() + wait;
    let mut discovered = false;
    loop {
        match timeout_at(deadline, events.recv()).await {
            Ok(Some(SessionEvent::PeerDiscovered(peer))) if peer.id == peer_id => {
                debug!(peer_id, "peer discovered; waiting for channel");
                discovered = true;
            }
            Ok(Some(SessionEvent::PeerConnected(id))) if id == peer_id => return Ok(()),
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => {
                let peer_id = peer_id.to_string();
                let wait_secs = wait.as_secs();
                return Err(if discovered {
                    CliError::PeerUnreachable { peer_id, wait_secs }
                } else {
                    CliError::PeerNotFound { peer_id, wait_secs }
                });
            }
        }
    }
}

/// Write `artifact` into `dir` under its own file name, never overwriting an
/// existing file.
async fn save_artifact(dir: &Path, artifact: &Artifact) -> Result<PathBuf, CliError> {
    let name = safe_file_name(&artifact.name);
    let mut path = dir.join(&name);
    let mut n = 1;
    while tokio::fs::try_exists(&path).await? {
        let (stem, ext) = match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), format!(".{ext}")),
            _ => (name.clone(), String::new()),
        };
        path = dir.join(format!("{stem} ({n}){ext}"));
        n += 1;
    }
    tokio::fs::write(&path, &artifact.bytes).await?;
    Ok(path)
}

/// Strip any directory components a peer put in the announced name.
fn safe_file_name(announced: &str) -> String {
    Path::new(announced)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty() && name != "..")
        .unwrap_or_else(|| "received.bin".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use skiff_proto::{DeviceClass, PeerInfo};

    fn peer(id: &str) -> PeerInfo {
        PeerInfo {
            id: id.to_string(),
            model: format!("Skiff Unit {id}"),
            class: DeviceClass::Desktop,
        }
    }

    #[test]
    fn send_and_peers_use_a_throwaway_identity_by_default() {
        let send = Command::Send(SendArgs {
            peer_id: "k2z".into(),
            path: PathBuf::from("a.txt"),
            wait_secs: 10,
        });
        let peers = Command::Peers(PeersArgs { wait_secs: 2 });
        assert_eq!(identity_file(None, &send).unwrap(), None);
        assert_eq!(identity_file(None, &peers).unwrap(), None);

        let named = PathBuf::from("/tmp/sender.toml");
        assert_eq!(identity_file(Some(named.clone()), &send).unwrap(), Some(named));
    }

    #[test_timeout::tokio_timeout_test]
    async fn discovered_peer_that_never_connects_is_unreachable() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(SessionEvent::RelayConnected).unwrap();
        tx.send(SessionEvent::PeerDiscovered(peer("k2z"))).unwrap();
        let err = wait_until_connected(&mut rx, "k2z", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, CliError::PeerUnreachable { ref peer_id, .. } if peer_id == "k2z"));

        tx.send(SessionEvent::PeerDiscovered(peer("b7x"))).unwrap();
        let err = wait_until_connected(&mut rx, "k2z", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, CliError::PeerNotFound { .. }));

        tx.send(SessionEvent::PeerDiscovered(peer("k2z"))).unwrap();
        tx.send(SessionEvent::PeerConnected("k2z".into())).unwrap();
        wait_until_connected(&mut rx, "k2z", Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[test]
    fn announced_paths_are_flattened() {
        assert_eq!(safe_file_name("../../etc/passwd"), "passwd");
        assert_eq!(safe_file_name("/tmp/report.pdf"), "report.pdf");
        assert_eq!(safe_file_name(".."), "received.bin");
        assert_eq!(safe_file_name(""), "received.bin");
    }

    #[test_timeout::tokio_timeout_test]
    async fn saved_artifacts_never_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = Artifact {
            name: "photo.png".into(),
            mime: "image/png".into(),
            bytes: Bytes::from_static(b"one"),
        };
        let first = save_artifact(dir.path(), &artifact).await.unwrap();
        let second = save_artifact(dir.path(), &artifact).await.unwrap();
        assert_eq!(first, dir.path().join("photo.png"));
        assert_eq!(second, dir.path().join("photo (1).png"));
        assert_eq!(std::fs::read(second).unwrap(), b"one");
    }
}
