//! Peer data path: the channel/link abstractions the orchestrator drives,
//! the chunked file sender and receiver, and the two link backends.

pub mod memory;
pub mod receiver;
pub mod sender;
pub mod webrtc;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use skiff_proto::IceCandidate;
use thiserror::Error;
use tokio::sync::mpsc;

pub use receiver::{Artifact, TransferEvent, TransferReceiver};
pub use sender::{send_file, OutgoingFile};

pub const DEFAULT_CHUNK_BYTES: usize = 16 * 1024;
pub const DEFAULT_HIGH_WATER_BYTES: usize = 64 * 1024;
pub const DEFAULT_LOW_WATER_BYTES: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("data channel closed")]
    ChannelClosed,
    #[error("source ended after {read} of {expected} bytes")]
    ShortRead { expected: u64, read: u64 },
    #[error("failed to read source: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode control frame: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("link backend error: {0}")]
    Backend(String),
}

/// One message on a peer channel. Text frames carry JSON control messages,
/// binary frames carry file bytes.
#[derive(Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Frame::Binary(_))
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Frame::Binary(bytes) => write!(f, "Binary({} bytes)", bytes.len()),
        }
    }
}

/// Chunking and backpressure parameters for outgoing transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowConfig {
    pub chunk_size: usize,
    /// No chunk is sent while the channel buffers at least this many bytes.
    pub high_water_mark: usize,
    /// A suspended sender resumes once the buffer drains to this level.
    pub low_water_mark: usize,
}

impl FlowConfig {
    /// Clamp to a usable configuration: a non-zero chunk and `low <= high`.
    pub fn normalized(mut self) -> Self {
        self.chunk_size = self.chunk_size.max(1);
        self.high_water_mark = self.high_water_mark.max(1);
        if self.low_water_mark > self.high_water_mark {
            self.low_water_mark = self.high_water_mark;
        }
        self
    }
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_BYTES,
            high_water_mark: DEFAULT_HIGH_WATER_BYTES,
            low_water_mark: DEFAULT_LOW_WATER_BYTES,
        }
    }
}

/// An open, ordered, reliable peer channel.
#[async_trait]
pub trait DataChannel: Send + Sync {
    async fn send_text(&self, text: String) -> Result<(), TransportError>;

    async fn send_binary(&self, data: Bytes) -> Result<(), TransportError>;

    /// Bytes queued locally and not yet handed to the network.
    async fn buffered_amount(&self) -> usize;

    /// Level at or below which the low-buffer signal fires.
    async fn set_low_threshold(&self, bytes: usize);

    /// Suspend until the buffered amount falls to the low threshold. Fails
    /// with `ChannelClosed` if the channel closes while waiting.
    async fn wait_buffered_low(&self) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;
}

/// Notifications a link raises towards the orchestrator.
#[derive(Clone)]
pub enum LinkEvent {
    LocalCandidate(IceCandidate),
    ChannelOpen(Arc<dyn DataChannel>),
    Frame(Frame),
    ChannelClosed,
    Failed(String),
}

impl fmt::Debug for LinkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkEvent::LocalCandidate(candidate) => {
                f.debug_tuple("LocalCandidate").field(candidate).finish()
            }
            LinkEvent::ChannelOpen(_) => f.write_str("ChannelOpen"),
            LinkEvent::Frame(frame) => f.debug_tuple("Frame").field(frame).finish(),
            LinkEvent::ChannelClosed => f.write_str("ChannelClosed"),
            LinkEvent::Failed(reason) => f.debug_tuple("Failed").field(reason).finish(),
        }
    }
}

/// A link event tagged with the peer and link generation it came from.
#[derive(Debug, Clone)]
pub struct PeerLinkEvent {
    pub peer_id: String,
    pub link_id: u64,
    pub event: LinkEvent,
}

/// Where a link reports its events. Cheap to clone into backend callbacks.
#[derive(Clone)]
pub struct LinkEventSink {
    peer_id: Arc<str>,
    link_id: u64,
    tx: mpsc::UnboundedSender<PeerLinkEvent>,
}

impl LinkEventSink {
    pub fn new(peer_id: &str, link_id: u64, tx: mpsc::UnboundedSender<PeerLinkEvent>) -> Self {
        Self {
            peer_id: Arc::from(peer_id),
            link_id,
            tx,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn emit(&self, event: LinkEvent) {
        let _ = self.tx.send(PeerLinkEvent {
            peer_id: self.peer_id.to_string(),
            link_id: self.link_id,
            event,
        });
    }
}

/// The connection-setup half of a peer connection: session descriptions and
/// candidates go in, a `ChannelOpen` event eventually comes out of the sink.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Create the data channel and a local offer; returns the offer SDP.
    async fn create_offer(&self) -> Result<String, TransportError>;

    /// Apply a remote offer and return the local answer SDP.
    async fn accept_offer(&self, sdp: String) -> Result<String, TransportError>;

    async fn accept_answer(&self, sdp: String) -> Result<(), TransportError>;

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    async fn close(&self);
}

#[async_trait]
pub trait LinkFactory: Send + Sync {
    async fn create(
        &self,
        remote_id: &str,
        sink: LinkEventSink,
    ) -> Result<Arc<dyn PeerLink>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_flow_keeps_low_at_or_below_high() {
        let flow = FlowConfig {
            chunk_size: 0,
            high_water_mark: 8,
            low_water_mark: 32,
        }
        .normalized();
        assert_eq!(flow.chunk_size, 1);
        assert_eq!(flow.low_water_mark, 8);
        assert_eq!(FlowConfig::default().normalized(), FlowConfig::default());
    }

    #[test]
    fn sink_tags_events_with_peer_and_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = LinkEventSink::new("k2z", 7, tx);
        sink.emit(LinkEvent::ChannelClosed);
        let tagged = rx.try_recv().expect("event");
        assert_eq!(tagged.peer_id, "k2z");
        assert_eq!(tagged.link_id, 7);
        assert!(matches!(tagged.event, LinkEvent::ChannelClosed));
    }
}
