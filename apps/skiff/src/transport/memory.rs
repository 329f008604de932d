//! In-process links and channels. Channels count buffered bytes until the
//! other side reads them, so backpressure behaves like a real data channel.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use skiff_proto::IceCandidate;
use tokio::sync::Notify;
use tracing::debug;

use super::{
    DataChannel, Frame, LinkEvent, LinkEventSink, LinkFactory, PeerLink, TransportError,
    DEFAULT_LOW_WATER_BYTES,
};

const OFFER_PREFIX: &str = "memory-offer:";
const ANSWER_PREFIX: &str = "memory-answer:";

#[derive(Default)]
struct PipeState {
    frames: VecDeque<Frame>,
    buffered: usize,
}

/// One direction of a channel pair.
struct Pipe {
    state: Mutex<PipeState>,
    low_threshold: AtomicUsize,
    low: Notify,
    readable: Notify,
}

impl Pipe {
    fn new() -> Self {
        Self {
            state: Mutex::new(PipeState::default()),
            low_threshold: AtomicUsize::new(DEFAULT_LOW_WATER_BYTES),
            low: Notify::new(),
            readable: Notify::new(),
        }
    }

    fn push(&self, frame: Frame) {
        let mut state = self.state.lock();
        state.buffered += frame.len();
        state.frames.push_back(frame);
        drop(state);
        self.readable.notify_one();
    }

    fn pop(&self) -> Option<Frame> {
        let mut state = self.state.lock();
        let frame = state.frames.pop_front()?;
        let before = state.buffered;
        state.buffered = before.saturating_sub(frame.len());
        let threshold = self.low_threshold.load(Ordering::SeqCst);
        if before > threshold && state.buffered <= threshold {
            self.low.notify_one();
        }
        Some(frame)
    }

    /// Drop everything not yet read.
    fn discard(&self) -> usize {
        let mut state = self.state.lock();
        let dropped = state.frames.len();
        state.frames.clear();
        state.buffered = 0;
        dropped
    }

    fn wake_all(&self) {
        self.low.notify_one();
        self.readable.notify_one();
    }
}

/// One end of an in-memory channel pair.
pub struct MemoryChannel {
    outbound: Arc<Pipe>,
    inbound: Arc<Pipe>,
    closed: Arc<AtomicBool>,
}

/// Two connected channel ends; frames sent on one are read from the other.
pub fn channel_pair() -> (MemoryChannel, MemoryChannel) {
    let a_to_b = Arc::new(Pipe::new());
    let b_to_a = Arc::new(Pipe::new());
    let closed = Arc::new(AtomicBool::new(false));
    (
        MemoryChannel {
            outbound: a_to_b.clone(),
            inbound: b_to_a.clone(),
            closed: closed.clone(),
        },
        MemoryChannel {
            outbound: b_to_a,
            inbound: a_to_b,
            closed,
        },
    )
}

impl MemoryChannel {
    /// Next frame sent by the other end, if one is waiting.
    pub fn try_recv(&self) -> Option<Frame> {
        self.inbound.pop()
    }

    /// Next frame sent by the other end; `None` once the pair is closed.
    pub async fn recv(&self) -> Option<Frame> {
        loop {
            if let Some(frame) = self.inbound.pop() {
                return Some(frame);
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            self.inbound.readable.notified().await;
        }
    }

    /// Frames this end has sent that the other end has not read yet.
    pub fn queued_frames(&self) -> usize {
        self.outbound.state.lock().frames.len()
    }

    /// Close both ends. Frames neither side has read yet are lost, as they
    /// are when a real peer connection is torn down.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let dropped = self.outbound.discard() + self.inbound.discard();
            if dropped > 0 {
                debug!(dropped, "memory channel closed with unread frames");
            }
            self.outbound.wake_all();
            self.inbound.wake_all();
        }
    }

    fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed);
        }
        self.outbound.push(frame);
        Ok(())
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.send(Frame::Text(text))
    }

    async fn send_binary(&self, data: Bytes) -> Result<(), TransportError> {
        self.send(Frame::Binary(data))
    }

    async fn buffered_amount(&self) -> usize {
        self.outbound.state.lock().buffered
    }

    async fn set_low_threshold(&self, bytes: usize) {
        self.outbound.low_threshold.store(bytes, Ordering::SeqCst);
    }

    async fn wait_buffered_low(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed);
        }
        self.outbound.low.notified().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}

/// Forward everything the other end sends into `sink`, then report closure.
fn spawn_pump(channel: Arc<MemoryChannel>, sink: LinkEventSink) {
    tokio::spawn(async move {
        while let Some(frame) = channel.recv().await {
            sink.emit(LinkEvent::Frame(frame));
        }
        sink.emit(LinkEvent::ChannelClosed);
    });
}

#[derive(Default)]
struct NetworkState {
    /// Keyed by (local id, remote id).
    endpoints: HashMap<(String, String), Arc<MemoryLinkState>>,
}

/// A shared in-process "network" connecting every factory created from it.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self, local_id: &str) -> MemoryLinkFactory {
        MemoryLinkFactory {
            local_id: local_id.to_string(),
            network: self.clone(),
        }
    }

    /// Drop the open channel between `local` and `remote` as a failed
    /// transport would. Both ends see `ChannelClosed`.
    pub fn sever(&self, local: &str, remote: &str) -> bool {
        let Some(endpoint) = self.lookup(local, remote) else {
            return false;
        };
        let channel = endpoint.channel.lock().take();
        match channel {
            Some(channel) => {
                channel.close();
                true
            }
            None => false,
        }
    }

    fn lookup(&self, local: &str, remote: &str) -> Option<Arc<MemoryLinkState>> {
        self.state
            .lock()
            .endpoints
            .get(&(local.to_string(), remote.to_string()))
            .cloned()
    }
}

pub struct MemoryLinkFactory {
    local_id: String,
    network: MemoryNetwork,
}

#[async_trait]
impl LinkFactory for MemoryLinkFactory {
    async fn create(
        &self,
        remote_id: &str,
        sink: LinkEventSink,
    ) -> Result<Arc<dyn PeerLink>, TransportError> {
        let state = Arc::new(MemoryLinkState {
            sink,
            channel: Mutex::new(None),
            candidates: AtomicUsize::new(0),
        });
        self.network.state.lock().endpoints.insert(
            (self.local_id.clone(), remote_id.to_string()),
            state.clone(),
        );
        Ok(Arc::new(MemoryLink {
            local_id: self.local_id.clone(),
            remote_id: remote_id.to_string(),
            network: self.network.clone(),
            state,
        }))
    }
}

struct MemoryLinkState {
    sink: LinkEventSink,
    channel: Mutex<Option<Arc<MemoryChannel>>>,
    candidates: AtomicUsize,
}

impl MemoryLinkState {
    fn open(&self, channel: Arc<MemoryChannel>) {
        *self.channel.lock() = Some(channel.clone());
        self.sink.emit(LinkEvent::ChannelOpen(channel.clone()));
        spawn_pump(channel, self.sink.clone());
    }
}

/// A link whose "connection" completes as soon as the initiator applies the
/// responder's answer.
pub struct MemoryLink {
    local_id: String,
    remote_id: String,
    network: MemoryNetwork,
    state: Arc<MemoryLinkState>,
}

impl MemoryLink {
    fn local_candidate(&self) {
        self.state.sink.emit(LinkEvent::LocalCandidate(IceCandidate {
            candidate: format!("candidate:memory {}", self.local_id),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }));
    }

    pub fn candidates_applied(&self) -> usize {
        self.state.candidates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerLink for MemoryLink {
    async fn create_offer(&self) -> Result<String, TransportError> {
        self.local_candidate();
        Ok(format!("{OFFER_PREFIX}{}", self.local_id))
    }

    async fn accept_offer(&self, sdp: String) -> Result<String, TransportError> {
        if !sdp.starts_with(OFFER_PREFIX) {
            return Err(TransportError::Backend(format!("not a memory offer: {sdp}")));
        }
        self.local_candidate();
        Ok(format!("{ANSWER_PREFIX}{}", self.local_id))
    }

    async fn accept_answer(&self, sdp: String) -> Result<(), TransportError> {
        if !sdp.starts_with(ANSWER_PREFIX) {
            return Err(TransportError::Backend(format!("not a memory answer: {sdp}")));
        }
        let remote = self
            .network
            .lookup(&self.remote_id, &self.local_id)
            .ok_or_else(|| {
                TransportError::Backend(format!("no memory endpoint for {}", self.remote_id))
            })?;
        let (local_end, remote_end) = channel_pair();
        debug!(local = %self.local_id, remote = %self.remote_id, "memory channel open");
        self.state.open(Arc::new(local_end));
        remote.open(Arc::new(remote_end));
        Ok(())
    }

    async fn add_candidate(&self, _candidate: IceCandidate) -> Result<(), TransportError> {
        self.state.candidates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        if let Some(channel) = self.state.channel.lock().take() {
            channel.close();
        }
    }
}
