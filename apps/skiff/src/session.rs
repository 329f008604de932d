//! The orchestrator: one loop that owns the relay connection and every peer
//! pair, and talks to its collaborator only through typed events and a
//! cloneable handle.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use skiff_proto::{ClientMessage, NegotiationPayload, PeerInfo};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::identity::LocalIdentity;
use crate::negotiation::{NegotiationState, Negotiator, Role};
use crate::relay::RelayEvent;
use crate::transport::{
    send_file, Artifact, DataChannel, FlowConfig, LinkEvent, LinkEventSink, LinkFactory,
    OutgoingFile, PeerLinkEvent, TransferEvent, TransferReceiver, TransportError,
};

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    RelayConnected,
    RelayDisconnected,
    PeerDiscovered(PeerInfo),
    PeerRemoved(String),
    PeerConnected(String),
    TransferIncoming {
        peer_id: String,
        name: String,
        size: u64,
        mime: String,
    },
    TransferProgress {
        peer_id: String,
        name: String,
        fraction: f64,
    },
    TransferComplete {
        peer_id: String,
        artifact: Artifact,
    },
    TransferSent {
        peer_id: String,
        name: String,
        bytes: u64,
    },
    TransferFailed {
        peer_id: String,
        name: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Streaming has started.
    Queued,
    /// The transfer finished; only returned by `send_file_and_wait`.
    Sent,
    NotFound,
    /// The channel is not open yet; the file waits in the peer's slot.
    NotConnected,
    /// A transfer to this peer is already parked or streaming.
    Busy,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transfer failed: {0}")]
    Transfer(#[from] TransportError),
    #[error("session is not running")]
    Stopped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerSummary {
    pub info: PeerInfo,
    pub state: NegotiationState,
    pub sending: bool,
    pub receiving: bool,
}

type Completion = oneshot::Sender<Result<u64, TransportError>>;

enum Command {
    Send {
        peer_id: String,
        file: OutgoingFile,
        done: Option<Completion>,
        reply: oneshot::Sender<SendOutcome>,
    },
    Peers {
        reply: oneshot::Sender<Vec<PeerSummary>>,
    },
    Shutdown,
}

struct SendReport {
    peer_id: String,
    transfer_id: u64,
    result: Result<u64, TransportError>,
}

struct PendingSend {
    file: OutgoingFile,
    done: Option<Completion>,
}

struct ActiveSend {
    transfer_id: u64,
    name: String,
    task: JoinHandle<()>,
    done: Option<Completion>,
}

struct PeerRecord {
    info: PeerInfo,
    link_id: u64,
    negotiator: Negotiator,
    channel: Option<Arc<dyn DataChannel>>,
    receiver: TransferReceiver,
    pending: Option<PendingSend>,
    sending: Option<ActiveSend>,
}

impl PeerRecord {
    fn summary(&self) -> PeerSummary {
        PeerSummary {
            info: self.info.clone(),
            state: self.negotiator.state(),
            sending: self.sending.is_some(),
            receiving: self.receiver.is_receiving(),
        }
    }

    fn open_channel(&self) -> Option<Arc<dyn DataChannel>> {
        self.channel.as_ref().filter(|channel| channel.is_open()).cloned()
    }
}

/// Collaborator-side handle to a running [`Session`].
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl SessionHandle {
    pub async fn send_file(
        &self,
        peer_id: &str,
        file: OutgoingFile,
    ) -> Result<SendOutcome, SessionError> {
        self.submit(peer_id, file, None).await
    }

    /// Like [`send_file`](Self::send_file), but a dispatched or parked file
    /// is followed to the end: `Sent` on success, `SessionError::Transfer`
    /// if the channel or source fails.
    pub async fn send_file_and_wait(
        &self,
        peer_id: &str,
        file: OutgoingFile,
    ) -> Result<SendOutcome, SessionError> {
        let (done_tx, done_rx) = oneshot::channel();
        let outcome = self.submit(peer_id, file, Some(done_tx)).await?;
        match outcome {
            SendOutcome::Queued | SendOutcome::NotConnected => match done_rx.await {
                Ok(Ok(_)) => Ok(SendOutcome::Sent),
                Ok(Err(err)) => Err(SessionError::Transfer(err)),
                Err(_) => Err(SessionError::Transfer(TransportError::ChannelClosed)),
            },
            other => Ok(other),
        }
    }

    pub async fn peers(&self) -> Result<Vec<PeerSummary>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Peers { reply })
            .map_err(|_| SessionError::Stopped)?;
        rx.await.map_err(|_| SessionError::Stopped)
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    async fn submit(
        &self,
        peer_id: &str,
        file: OutgoingFile,
        done: Option<Completion>,
    ) -> Result<SendOutcome, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Send {
                peer_id: peer_id.to_string(),
                file,
                done,
                reply,
            })
            .map_err(|_| SessionError::Stopped)?;
        rx.await.map_err(|_| SessionError::Stopped)
    }
}

pub struct Session {
    identity: LocalIdentity,
    flow: FlowConfig,
    factory: Arc<dyn LinkFactory>,
    relay_tx: mpsc::UnboundedSender<ClientMessage>,
    relay_rx: mpsc::UnboundedReceiver<RelayEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    link_tx: mpsc::UnboundedSender<PeerLinkEvent>,
    link_rx: mpsc::UnboundedReceiver<PeerLinkEvent>,
    report_tx: mpsc::UnboundedSender<SendReport>,
    report_rx: mpsc::UnboundedReceiver<SendReport>,
    events: mpsc::UnboundedSender<SessionEvent>,
    peers: HashMap<String, PeerRecord>,
    next_link_id: u64,
    next_transfer_id: u64,
}

impl Session {
    pub fn new(
        identity: LocalIdentity,
        flow: FlowConfig,
        factory: Arc<dyn LinkFactory>,
        relay_tx: mpsc::UnboundedSender<ClientMessage>,
        relay_rx: mpsc::UnboundedReceiver<RelayEvent>,
    ) -> (Self, SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (report_tx, report_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let session = Self {
            identity,
            flow: flow.normalized(),
            factory,
            relay_tx,
            relay_rx,
            commands,
            link_tx,
            link_rx,
            report_tx,
            report_rx,
            events,
            peers: HashMap::new(),
            next_link_id: 0,
            next_transfer_id: 0,
        };
        (
            session,
            SessionHandle {
                commands: command_tx,
            },
            events_rx,
        )
    }

    /// Run until shutdown, until every handle is dropped, or until the relay
    /// client goes away.
    pub async fn run(mut self) {
        info!(id = %self.identity.id, name = %self.identity.name, "session started");
        loop {
            tokio::select! {
                event = self.relay_rx.recv() => match event {
                    Some(event) => self.on_relay_event(event).await,
                    None => {
                        debug!("relay client gone");
                        break;
                    }
                },
                Some(event) = self.link_rx.recv() => self.on_link_event(event).await,
                Some(report) = self.report_rx.recv() => self.on_send_report(report),
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command).await,
                },
            }
        }
        let ids: Vec<String> = self.peers.keys().cloned().collect();
        for id in ids {
            self.remove_peer(&id, "session stopped").await;
        }
        info!(id = %self.identity.id, "session stopped");
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    async fn on_relay_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Connected => {
                let join = ClientMessage::Join {
                    sender: self.identity.id.clone(),
                    device: self.identity.device_info(),
                };
                let _ = self.relay_tx.send(join);
                self.emit(SessionEvent::RelayConnected);
            }
            RelayEvent::Disconnected => {
                let ids: Vec<String> = self.peers.keys().cloned().collect();
                for id in ids {
                    self.remove_peer(&id, "relay disconnected").await;
                }
                self.emit(SessionEvent::RelayDisconnected);
            }
            RelayEvent::PeerJoined(peer) => self.add_peer(peer).await,
            RelayEvent::PeerLeft(peer_id) => self.remove_peer(&peer_id, "peer left").await,
            RelayEvent::Signal { sender, data } => self.on_signal(sender, data).await,
        }
    }

    async fn on_signal(&mut self, sender: String, data: Value) {
        let Some(record) = self.peers.get(&sender) else {
            debug!(sender = %sender, "dropping signal from unknown peer");
            return;
        };
        let payload = match NegotiationPayload::from_value(&data) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(peer_id = %sender, error = %err, "dropping malformed signal");
                return;
            }
        };
        // a fresh offer on a used pair means the initiator rebuilt its side
        let restarted = matches!(payload, NegotiationPayload::Offer { .. })
            && record.negotiator.role() == Role::Responder
            && !record.negotiator.is_fresh();
        if restarted {
            self.rebuild_link(&sender, "peer renegotiating").await;
        }
        let Some(record) = self.peers.get_mut(&sender) else {
            return;
        };
        match record.negotiator.handle_signal(payload).await {
            Ok(Some(reply)) => relay_signal(&self.relay_tx, &sender, &reply),
            Ok(None) => {}
            Err(err) => warn!(peer_id = %sender, error = %err, "dropping signal"),
        }
    }

    /// A new link and negotiator for `peer_id`, tagged with a fresh link id.
    async fn new_negotiator(&mut self, peer_id: &str) -> Result<(u64, Negotiator), TransportError> {
        self.next_link_id += 1;
        let link_id = self.next_link_id;
        let sink = LinkEventSink::new(peer_id, link_id, self.link_tx.clone());
        let link = self.factory.create(peer_id, sink).await?;
        Ok((link_id, Negotiator::new(&self.identity.id, peer_id, link)))
    }

    async fn add_peer(&mut self, peer: PeerInfo) {
        if peer.id == self.identity.id || self.peers.contains_key(&peer.id) {
            debug!(peer_id = %peer.id, "ignoring repeated peer-joined");
            return;
        }
        let (link_id, mut negotiator) = match self.new_negotiator(&peer.id).await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(peer_id = %peer.id, error = %err, "failed to create peer link");
                return;
            }
        };
        info!(peer_id = %peer.id, model = %peer.model, role = ?negotiator.role(), "peer discovered");
        self.emit(SessionEvent::PeerDiscovered(peer.clone()));
        send_offer(&self.relay_tx, &peer.id, &mut negotiator).await;

        self.peers.insert(
            peer.id.clone(),
            PeerRecord {
                info: peer,
                link_id,
                negotiator,
                channel: None,
                receiver: TransferReceiver::new(),
                pending: None,
                sending: None,
            },
        );
    }

    /// Swap the peer's link for a new one after the old one went down. The
    /// active send fails; a parked file waits for the new channel. The
    /// initiator offers again.
    async fn rebuild_link(&mut self, peer_id: &str, reason: &str) {
        if !self.peers.contains_key(peer_id) {
            return;
        }
        let (link_id, mut negotiator) = match self.new_negotiator(peer_id).await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(peer_id, error = %err, "failed to rebuild peer link");
                self.remove_peer(peer_id, reason).await;
                return;
            }
        };
        let Some(record) = self.peers.get_mut(peer_id) else {
            negotiator.close().await;
            return;
        };
        record.negotiator.close().await;
        record.channel = None;
        if record.receiver.is_receiving() {
            debug!(peer_id, "discarding partial incoming transfer");
        }
        record.receiver = TransferReceiver::new();
        fail_active(&self.events, peer_id, record, reason);
        info!(peer_id, reason, role = ?negotiator.role(), link_id, "rebuilding peer link");
        send_offer(&self.relay_tx, peer_id, &mut negotiator).await;
        record.link_id = link_id;
        record.negotiator = negotiator;
    }

    async fn remove_peer(&mut self, peer_id: &str, reason: &str) {
        let Some(mut record) = self.peers.remove(peer_id) else {
            return;
        };
        record.negotiator.close().await;
        if record.receiver.is_receiving() {
            debug!(peer_id, "discarding partial incoming transfer");
        }
        fail_transfers(&self.events, peer_id, &mut record, reason);
        info!(peer_id, reason, "peer removed");
        self.emit(SessionEvent::PeerRemoved(peer_id.to_string()));
    }

    async fn on_link_event(&mut self, event: PeerLinkEvent) {
        let PeerLinkEvent {
            peer_id,
            link_id,
            event,
        } = event;
        let Some(record) = self.peers.get_mut(&peer_id) else {
            return;
        };
        if record.link_id != link_id {
            debug!(peer_id = %peer_id, link_id, "ignoring event from stale link");
            return;
        }

        match event {
            LinkEvent::LocalCandidate(candidate) => {
                relay_signal(
                    &self.relay_tx,
                    &peer_id,
                    &NegotiationPayload::Candidate { candidate },
                );
            }
            LinkEvent::ChannelOpen(channel) => {
                record.negotiator.channel_open();
                record.channel = Some(channel);
                info!(peer_id = %peer_id, "data channel open");
                let _ = self.events.send(SessionEvent::PeerConnected(peer_id.clone()));
                if let Some(pending) = record.pending.take() {
                    debug!(peer_id = %peer_id, name = %pending.file.name, "flushing parked file");
                    self.next_transfer_id += 1;
                    start_send(
                        record,
                        &peer_id,
                        pending,
                        self.flow,
                        self.report_tx.clone(),
                        self.next_transfer_id,
                    );
                }
            }
            LinkEvent::Frame(frame) => {
                for event in record.receiver.ingest(frame) {
                    let _ = self.events.send(transfer_event(&peer_id, event));
                }
            }
            LinkEvent::ChannelClosed => self.rebuild_link(&peer_id, "data channel closed").await,
            LinkEvent::Failed(reason) => self.rebuild_link(&peer_id, &reason).await,
        }
    }

    fn on_send_report(&mut self, report: SendReport) {
        let Some(record) = self.peers.get_mut(&report.peer_id) else {
            return;
        };
        let current = record
            .sending
            .as_ref()
            .is_some_and(|active| active.transfer_id == report.transfer_id);
        if !current {
            return;
        }
        let Some(active) = record.sending.take() else {
            return;
        };
        let event = match &report.result {
            Ok(bytes) => {
                info!(peer_id = %report.peer_id, name = %active.name, bytes, "transfer sent");
                SessionEvent::TransferSent {
                    peer_id: report.peer_id.clone(),
                    name: active.name,
                    bytes: *bytes,
                }
            }
            Err(err) => {
                warn!(peer_id = %report.peer_id, name = %active.name, error = %err, "transfer failed");
                SessionEvent::TransferFailed {
                    peer_id: report.peer_id.clone(),
                    name: active.name,
                    reason: err.to_string(),
                }
            }
        };
        if let Some(done) = active.done {
            let _ = done.send(report.result);
        }
        self.emit(event);
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Send {
                peer_id,
                file,
                done,
                reply,
            } => {
                let outcome = self.submit_file(&peer_id, file, done).await;
                let _ = reply.send(outcome);
            }
            Command::Peers { reply } => {
                let mut peers: Vec<PeerSummary> =
                    self.peers.values().map(PeerRecord::summary).collect();
                peers.sort_by(|a, b| a.info.id.cmp(&b.info.id));
                let _ = reply.send(peers);
            }
            Command::Shutdown => {}
        }
    }

    async fn submit_file(
        &mut self,
        peer_id: &str,
        file: OutgoingFile,
        done: Option<Completion>,
    ) -> SendOutcome {
        let Some(record) = self.peers.get_mut(peer_id) else {
            return SendOutcome::NotFound;
        };
        if record.sending.is_some() || record.pending.is_some() {
            return SendOutcome::Busy;
        }
        if record.open_channel().is_some() {
            self.next_transfer_id += 1;
            start_send(
                record,
                peer_id,
                PendingSend { file, done },
                self.flow,
                self.report_tx.clone(),
                self.next_transfer_id,
            );
            return SendOutcome::Queued;
        }
        debug!(peer_id, name = %file.name, "channel not open; parking file");
        record.pending = Some(PendingSend { file, done });
        if record.negotiator.role() == Role::Initiator
            && record.negotiator.state() == NegotiationState::Idle
        {
            // the last offer could not be created; try again
            send_offer(&self.relay_tx, peer_id, &mut record.negotiator).await;
        }
        SendOutcome::NotConnected
    }
}

async fn send_offer(
    relay: &mpsc::UnboundedSender<ClientMessage>,
    peer_id: &str,
    negotiator: &mut Negotiator,
) {
    match negotiator.start().await {
        Ok(Some(offer)) => relay_signal(relay, peer_id, &offer),
        Ok(None) => {}
        Err(err) => warn!(peer_id, error = %err, "failed to create offer"),
    }
}

fn relay_signal(
    relay: &mpsc::UnboundedSender<ClientMessage>,
    to: &str,
    payload: &NegotiationPayload,
) {
    match payload.to_value() {
        Ok(data) => {
            debug!(peer_id = to, kind = payload.kind(), "relaying signal");
            let _ = relay.send(ClientMessage::Signal {
                to: to.to_string(),
                data,
            });
        }
        Err(err) => warn!(peer_id = to, error = %err, "failed to encode signal"),
    }
}

/// Spawn the sender loop for `file`. The caller has checked the slot is free.
fn start_send(
    record: &mut PeerRecord,
    peer_id: &str,
    send: PendingSend,
    flow: FlowConfig,
    reports: mpsc::UnboundedSender<SendReport>,
    transfer_id: u64,
) {
    let PendingSend { file, done } = send;
    let name = file.name.clone();
    let Some(channel) = record.open_channel() else {
        record.pending = Some(PendingSend { file, done });
        return;
    };
    let report_peer = peer_id.to_string();
    let task = tokio::spawn(async move {
        let result = send_file(channel.as_ref(), file, &flow).await;
        let _ = reports.send(SendReport {
            peer_id: report_peer,
            transfer_id,
            result,
        });
    });
    info!(peer_id, name = %name, "transfer started");
    record.sending = Some(ActiveSend {
        transfer_id,
        name,
        task,
        done,
    });
}

fn transfer_event(peer_id: &str, event: TransferEvent) -> SessionEvent {
    let peer_id = peer_id.to_string();
    match event {
        TransferEvent::Incoming(header) => SessionEvent::TransferIncoming {
            peer_id,
            name: header.name,
            size: header.size,
            mime: header.mime,
        },
        TransferEvent::Progress { name, fraction } => SessionEvent::TransferProgress {
            peer_id,
            name,
            fraction,
        },
        TransferEvent::Complete(artifact) => SessionEvent::TransferComplete { peer_id, artifact },
    }
}

/// Abort the active send, failing it with `reason`.
fn fail_active(
    events: &mpsc::UnboundedSender<SessionEvent>,
    peer_id: &str,
    record: &mut PeerRecord,
    reason: &str,
) {
    if let Some(active) = record.sending.take() {
        active.task.abort();
        if let Some(done) = active.done {
            let _ = done.send(Err(TransportError::ChannelClosed));
        }
        let _ = events.send(SessionEvent::TransferFailed {
            peer_id: peer_id.to_string(),
            name: active.name,
            reason: reason.to_string(),
        });
    }
}

/// Abort the active send and drop the parked file, failing both.
fn fail_transfers(
    events: &mpsc::UnboundedSender<SessionEvent>,
    peer_id: &str,
    record: &mut PeerRecord,
    reason: &str,
) {
    fail_active(events, peer_id, record, reason);
    if let Some(pending) = record.pending.take() {
        if let Some(done) = pending.done {
            let _ = done.send(Err(TransportError::ChannelClosed));
        }
        let _ = events.send(SessionEvent::TransferFailed {
            peer_id: peer_id.to_string(),
            name: pending.file.name,
            reason: reason.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryNetwork;
    use serde_json::json;
    use skiff_proto::DeviceClass;
    use std::time::Duration;
    use tokio::time::timeout;

    struct Node {
        handle: SessionHandle,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        relay_in: mpsc::UnboundedSender<RelayEvent>,
        relay_out: mpsc::UnboundedReceiver<ClientMessage>,
        task: JoinHandle<()>,
    }

    fn identity(id: &str) -> LocalIdentity {
        LocalIdentity {
            id: id.to_string(),
            name: format!("Skiff Node {id}"),
            class: DeviceClass::Desktop,
        }
    }

    fn peer(id: &str) -> PeerInfo {
        PeerInfo {
            id: id.to_string(),
            model: format!("Skiff Node {id}"),
            class: DeviceClass::Desktop,
        }
    }

    fn spawn_node(network: &MemoryNetwork, id: &str, flow: FlowConfig) -> Node {
        let (relay_tx, relay_out) = mpsc::unbounded_channel();
        let (relay_in, relay_rx) = mpsc::unbounded_channel();
        let (session, handle, events) = Session::new(
            identity(id),
            flow,
            Arc::new(network.factory(id)),
            relay_tx,
            relay_rx,
        );
        Node {
            handle,
            events,
            relay_in,
            relay_out,
            task: tokio::spawn(session.run()),
        }
    }

    async fn next_event(node: &mut Node) -> SessionEvent {
        timeout(Duration::from_secs(5), node.events.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("session event stream ended")
    }

    async fn wait_for<F>(node: &mut Node, mut pred: F) -> SessionEvent
    where
        F: FnMut(&SessionEvent) -> bool,
    {
        loop {
            let event = next_event(node).await;
            if pred(&event) {
                return event;
            }
        }
    }

    /// Move signals between two nodes the way the relay would.
    fn bridge(a: &mut Node, a_id: &str, b: &mut Node, b_id: &str) -> JoinHandle<()> {
        let mut a_out = std::mem::replace(&mut a.relay_out, mpsc::unbounded_channel().1);
        let mut b_out = std::mem::replace(&mut b.relay_out, mpsc::unbounded_channel().1);
        let a_in = a.relay_in.clone();
        let b_in = b.relay_in.clone();
        let (a_id, b_id) = (a_id.to_string(), b_id.to_string());
        tokio::spawn(async move {
            loop {
                let (message, sender, target) = tokio::select! {
                    Some(m) = a_out.recv() => (m, &a_id, &b_in),
                    Some(m) = b_out.recv() => (m, &b_id, &a_in),
                    else => break,
                };
                if let ClientMessage::Signal { data, .. } = message {
                    let _ = target.send(RelayEvent::Signal {
                        sender: sender.clone(),
                        data,
                    });
                }
            }
        })
    }

    async fn connected_pair(flow: FlowConfig) -> (Node, Node, JoinHandle<()>) {
        connected_pair_on(&MemoryNetwork::new(), flow).await
    }

    async fn connected_pair_on(
        network: &MemoryNetwork,
        flow: FlowConfig,
    ) -> (Node, Node, JoinHandle<()>) {
        let mut a = spawn_node(network, "b7x", flow);
        let mut b = spawn_node(network, "k2z", flow);
        let bridge = bridge(&mut a, "b7x", &mut b, "k2z");
        a.relay_in.send(RelayEvent::PeerJoined(peer("k2z"))).unwrap();
        b.relay_in.send(RelayEvent::PeerJoined(peer("b7x"))).unwrap();
        wait_for(&mut a, |e| matches!(e, SessionEvent::PeerConnected(_))).await;
        wait_for(&mut b, |e| matches!(e, SessionEvent::PeerConnected(_))).await;
        (a, b, bridge)
    }

    #[test_timeout::tokio_timeout_test]
    async fn relay_connect_sends_join() {
        let network = MemoryNetwork::new();
        let mut node = spawn_node(&network, "b7x", FlowConfig::default());
        node.relay_in.send(RelayEvent::Connected).unwrap();
        assert_eq!(next_event(&mut node).await, SessionEvent::RelayConnected);
        match node.relay_out.recv().await.unwrap() {
            ClientMessage::Join { sender, device } => {
                assert_eq!(sender, "b7x");
                assert_eq!(device.model, "Skiff Node b7x");
            }
            other => panic!("expected join, got {other:?}"),
        }
        node.handle.shutdown();
        node.task.await.unwrap();
    }

    #[test_timeout::tokio_timeout_test]
    async fn only_the_initiator_offers_and_duplicates_are_ignored() {
        let network = MemoryNetwork::new();
        let mut node = spawn_node(&network, "k2z", FlowConfig::default());
        node.relay_in.send(RelayEvent::PeerJoined(peer("b7x"))).unwrap();
        node.relay_in.send(RelayEvent::PeerJoined(peer("b7x"))).unwrap();
        assert!(matches!(next_event(&mut node).await, SessionEvent::PeerDiscovered(p) if p.id == "b7x"));

        let mut offers = 0;
        while let Ok(Some(message)) =
            timeout(Duration::from_millis(200), node.relay_out.recv()).await
        {
            if let ClientMessage::Signal { to, data } = message {
                assert_eq!(to, "b7x");
                if data["type"] == "offer" {
                    offers += 1;
                }
            }
        }
        assert_eq!(offers, 1);
        assert_eq!(node.handle.peers().await.unwrap().len(), 1);

        let mut responder = spawn_node(&network, "b7x", FlowConfig::default());
        responder.relay_in.send(RelayEvent::PeerJoined(peer("k2z"))).unwrap();
        next_event(&mut responder).await;
        assert!(timeout(Duration::from_millis(200), responder.relay_out.recv())
            .await
            .is_err());
    }

    #[test_timeout::tokio_timeout_test]
    async fn unknown_and_malformed_signals_are_dropped() {
        let network = MemoryNetwork::new();
        let mut node = spawn_node(&network, "b7x", FlowConfig::default());
        node.relay_in
            .send(RelayEvent::Signal {
                sender: "ghost".into(),
                data: json!({"type": "offer", "sdp": "x"}),
            })
            .unwrap();
        node.relay_in.send(RelayEvent::PeerJoined(peer("k2z"))).unwrap();
        node.relay_in
            .send(RelayEvent::Signal {
                sender: "k2z".into(),
                data: json!({"type": "bogus"}),
            })
            .unwrap();
        assert!(matches!(next_event(&mut node).await, SessionEvent::PeerDiscovered(_)));
        let peers = node.handle.peers().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].state, NegotiationState::Idle);
    }

    #[test_timeout::tokio_timeout_test]
    async fn send_outcomes_follow_peer_state() {
        let network = MemoryNetwork::new();
        let mut node = spawn_node(&network, "b7x", FlowConfig::default());
        let handle = node.handle.clone();

        let outcome = handle
            .send_file("nobody", OutgoingFile::from_bytes("a.txt", "hi"))
            .await
            .unwrap();
        assert_eq!(outcome, SendOutcome::NotFound);

        node.relay_in.send(RelayEvent::PeerJoined(peer("k2z"))).unwrap();
        next_event(&mut node).await;
        let parked = handle
            .send_file("k2z", OutgoingFile::from_bytes("a.txt", "hi"))
            .await
            .unwrap();
        assert_eq!(parked, SendOutcome::NotConnected);
        let busy = handle
            .send_file("k2z", OutgoingFile::from_bytes("b.txt", "hi"))
            .await
            .unwrap();
        assert_eq!(busy, SendOutcome::Busy);

        node.relay_in.send(RelayEvent::PeerLeft("k2z".into())).unwrap();
        let failed = next_event(&mut node).await;
        assert!(matches!(failed, SessionEvent::TransferFailed { ref name, .. } if name == "a.txt"));
        assert_eq!(next_event(&mut node).await, SessionEvent::PeerRemoved("k2z".into()));
        assert!(handle.peers().await.unwrap().is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn file_moves_between_two_sessions() {
        let flow = FlowConfig {
            chunk_size: 1000,
            high_water_mark: 4000,
            low_water_mark: 1000,
        };
        let (a, mut b, _bridge) = connected_pair(flow).await;
        let payload: Vec<u8> = (0..10_500u32).map(|i| (i % 251) as u8).collect();

        let outcome = a
            .handle
            .send_file_and_wait("k2z", OutgoingFile::from_bytes("data.bin", payload.clone()))
            .await
            .unwrap();
        assert_eq!(outcome, SendOutcome::Sent);

        let incoming = wait_for(&mut b, |e| matches!(e, SessionEvent::TransferIncoming { .. })).await;
        assert_eq!(
            incoming,
            SessionEvent::TransferIncoming {
                peer_id: "b7x".into(),
                name: "data.bin".into(),
                size: 10_500,
                mime: "application/octet-stream".into(),
            }
        );
        let mut last_fraction = 0.0;
        let artifact = loop {
            match next_event(&mut b).await {
                SessionEvent::TransferProgress { fraction, .. } => {
                    assert!(fraction > last_fraction);
                    last_fraction = fraction;
                }
                SessionEvent::TransferComplete { peer_id, artifact } => {
                    assert_eq!(peer_id, "b7x");
                    break artifact;
                }
                other => panic!("unexpected event: {other:?}"),
            }
        };
        assert_eq!(last_fraction, 1.0);
        assert_eq!(artifact.bytes.as_ref(), payload.as_slice());
    }

    #[test_timeout::tokio_timeout_test]
    async fn parked_file_flushes_when_channel_opens() {
        let network = MemoryNetwork::new();
        let mut a = spawn_node(&network, "b7x", FlowConfig::default());
        let mut b = spawn_node(&network, "k2z", FlowConfig::default());

        // b7x learns of k2z first and parks a file before any signal flows
        a.relay_in.send(RelayEvent::PeerJoined(peer("k2z"))).unwrap();
        next_event(&mut a).await;
        let outcome = a
            .handle
            .send_file("k2z", OutgoingFile::from_bytes("note.txt", "parked"))
            .await
            .unwrap();
        assert_eq!(outcome, SendOutcome::NotConnected);

        let _bridge = bridge(&mut a, "b7x", &mut b, "k2z");
        b.relay_in.send(RelayEvent::PeerJoined(peer("b7x"))).unwrap();

        let sent = wait_for(&mut a, |e| matches!(e, SessionEvent::TransferSent { .. })).await;
        assert_eq!(
            sent,
            SessionEvent::TransferSent {
                peer_id: "k2z".into(),
                name: "note.txt".into(),
                bytes: 6,
            }
        );
        let complete = wait_for(&mut b, |e| matches!(e, SessionEvent::TransferComplete { .. })).await;
        match complete {
            SessionEvent::TransferComplete { artifact, .. } => {
                assert_eq!(artifact.mime, "text/plain");
                assert_eq!(artifact.bytes.as_ref(), b"parked");
            }
            _ => unreachable!(),
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn relay_loss_tears_down_every_peer() {
        let (mut a, _b, _bridge) = connected_pair(FlowConfig::default()).await;
        a.relay_in.send(RelayEvent::Disconnected).unwrap();
        assert_eq!(next_event(&mut a).await, SessionEvent::PeerRemoved("k2z".into()));
        assert_eq!(next_event(&mut a).await, SessionEvent::RelayDisconnected);
        assert!(a.handle.peers().await.unwrap().is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn closed_channel_fails_waiting_sender() {
        use tokio::io::AsyncWriteExt;

        let (a, mut b, _bridge) = connected_pair(FlowConfig::default()).await;

        // the source delivers a little and then stalls, so the transfer is
        // still in flight when k2z drops the channel
        let (mut source, reader) = tokio::io::duplex(1024);
        source.write_all(&[7u8; 100]).await.unwrap();
        let file = OutgoingFile::new("big.bin", "application/octet-stream", 64 * 1024, reader);

        let sender = a.handle.clone();
        let waiting = tokio::spawn(async move { sender.send_file_and_wait("k2z", file).await });
        wait_for(&mut b, |e| matches!(e, SessionEvent::TransferIncoming { .. })).await;
        b.relay_in.send(RelayEvent::PeerLeft("b7x".into())).unwrap();

        let result = waiting.await.unwrap();
        assert!(matches!(
            result,
            Err(SessionError::Transfer(TransportError::ChannelClosed))
        ));
        // b7x stays on its roster and waits for a new offer
        let peers = a.handle.peers().await.unwrap();
        assert_eq!(peers[0].state, NegotiationState::Idle);
        assert!(!peers[0].sending);
        drop(source);
    }

    #[test_timeout::tokio_timeout_test]
    async fn severed_link_is_rebuilt_and_carries_the_next_file() {
        let network = MemoryNetwork::new();
        let (mut a, mut b, _bridge) = connected_pair_on(&network, FlowConfig::default()).await;

        assert!(network.sever("b7x", "k2z"));
        wait_for(&mut a, |e| *e == SessionEvent::PeerConnected("k2z".into())).await;
        wait_for(&mut b, |e| *e == SessionEvent::PeerConnected("b7x".into())).await;

        let peers = a.handle.peers().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].state, NegotiationState::Connected);

        let outcome = a
            .handle
            .send_file_and_wait("k2z", OutgoingFile::from_bytes("again.txt", "second link"))
            .await
            .unwrap();
        assert_eq!(outcome, SendOutcome::Sent);
        let complete = wait_for(&mut b, |e| matches!(e, SessionEvent::TransferComplete { .. })).await;
        match complete {
            SessionEvent::TransferComplete { peer_id, artifact } => {
                assert_eq!(peer_id, "b7x");
                assert_eq!(artifact.bytes.as_ref(), b"second link");
            }
            _ => unreachable!(),
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn shutdown_right_after_sent_still_delivers() {
        let flow = FlowConfig {
            chunk_size: 2048,
            high_water_mark: 8192,
            low_water_mark: 2048,
        };
        let (a, mut b, _bridge) = connected_pair(flow).await;
        let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 253) as u8).collect();

        let outcome = a
            .handle
            .send_file_and_wait("k2z", OutgoingFile::from_bytes("last.bin", payload.clone()))
            .await
            .unwrap();
        assert_eq!(outcome, SendOutcome::Sent);
        a.handle.shutdown();
        a.task.await.unwrap();

        let complete = wait_for(&mut b, |e| matches!(e, SessionEvent::TransferComplete { .. })).await;
        match complete {
            SessionEvent::TransferComplete { artifact, .. } => {
                assert_eq!(artifact.bytes.len(), payload.len());
                assert_eq!(artifact.bytes.as_ref(), payload.as_slice());
            }
            _ => unreachable!(),
        }
    }
}
