//! `PeerLink` on top of the `webrtc` crate: one ordered, reliable data channel
//! per peer, trickled ICE candidates, and the channel's buffered-amount-low
//! callback wired to a `Notify` for sender backpressure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use skiff_proto::IceCandidate;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::{
    DataChannel, Frame, LinkEvent, LinkEventSink, LinkFactory, PeerLink, TransportError,
};

pub const DATA_CHANNEL_LABEL: &str = "skiff-data";

fn backend(err: webrtc::Error) -> TransportError {
    TransportError::Backend(err.to_string())
}

/// Builds one `RTCPeerConnection` per remote peer.
pub struct WebRtcLinkFactory {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcLinkFactory {
    /// `stun_urls` may be empty for LAN-only operation.
    pub fn new(stun_urls: &[String]) -> Self {
        let ice_servers = if stun_urls.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: stun_urls.to_vec(),
                ..Default::default()
            }]
        };
        Self {
            api: APIBuilder::new().build(),
            ice_servers,
        }
    }
}

#[async_trait]
impl LinkFactory for WebRtcLinkFactory {
    async fn create(
        &self,
        remote_id: &str,
        sink: LinkEventSink,
    ) -> Result<Arc<dyn PeerLink>, TransportError> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await.map_err(backend)?);

        {
            let sink = sink.clone();
            pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let sink = sink.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else { return };
                    match candidate.to_json() {
                        Ok(init) => sink.emit(LinkEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        })),
                        Err(err) => warn!(
                            target = "skiff::transport::webrtc",
                            error = %err,
                            "failed to serialize local candidate"
                        ),
                    }
                })
            }));
        }

        {
            let sink = sink.clone();
            pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let sink = sink.clone();
                Box::pin(async move {
                    debug!(
                        target = "skiff::transport::webrtc",
                        peer_id = %sink.peer_id(),
                        state = ?state,
                        "peer connection state changed"
                    );
                    if state == RTCPeerConnectionState::Failed {
                        sink.emit(LinkEvent::Failed("peer connection failed".into()));
                    }
                })
            }));
        }

        {
            let sink = sink.clone();
            pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let sink = sink.clone();
                Box::pin(async move {
                    if dc.label() != DATA_CHANNEL_LABEL {
                        warn!(
                            target = "skiff::transport::webrtc",
                            label = %dc.label(),
                            "ignoring unexpected data channel"
                        );
                        return;
                    }
                    wire_channel(dc, sink).await;
                })
            }));
        }

        info!(
            target = "skiff::transport::webrtc",
            peer_id = %remote_id,
            "peer connection created"
        );
        Ok(Arc::new(WebRtcLink { pc, sink }))
    }
}

pub struct WebRtcLink {
    pc: Arc<RTCPeerConnection>,
    sink: LinkEventSink,
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn create_offer(&self) -> Result<String, TransportError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(DATA_CHANNEL_LABEL, Some(init))
            .await
            .map_err(backend)?;
        wire_channel(dc, self.sink.clone()).await;

        let offer = self.pc.create_offer(None).await.map_err(backend)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(backend)?;
        Ok(offer.sdp)
    }

    async fn accept_offer(&self, sdp: String) -> Result<String, TransportError> {
        let offer = RTCSessionDescription::offer(sdp).map_err(backend)?;
        self.pc.set_remote_description(offer).await.map_err(backend)?;
        let answer = self.pc.create_answer(None).await.map_err(backend)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(backend)?;
        Ok(answer.sdp)
    }

    async fn accept_answer(&self, sdp: String) -> Result<(), TransportError> {
        let answer = RTCSessionDescription::answer(sdp).map_err(backend)?;
        self.pc.set_remote_description(answer).await.map_err(backend)
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        };
        self.pc.add_ice_candidate(init).await.map_err(backend)
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            debug!(
                target = "skiff::transport::webrtc",
                error = %err,
                "peer connection close failed"
            );
        }
    }
}

/// Register open/close/message/low-buffer handlers on `dc`.
async fn wire_channel(dc: Arc<RTCDataChannel>, sink: LinkEventSink) {
    let channel = Arc::new(WebRtcChannel {
        dc: dc.clone(),
        low: Arc::new(Notify::new()),
        closed: Arc::new(AtomicBool::new(false)),
    });

    {
        let sink = sink.clone();
        let channel = channel.clone();
        dc.on_open(Box::new(move || {
            let sink = sink.clone();
            let channel = channel.clone();
            Box::pin(async move {
                info!(
                    target = "skiff::transport::webrtc",
                    peer_id = %sink.peer_id(),
                    "data channel open"
                );
                sink.emit(LinkEvent::ChannelOpen(channel));
            })
        }));
    }

    {
        let sink = sink.clone();
        let low = channel.low.clone();
        let closed = channel.closed.clone();
        dc.on_close(Box::new(move || {
            let sink = sink.clone();
            let low = low.clone();
            let closed = closed.clone();
            Box::pin(async move {
                closed.store(true, Ordering::SeqCst);
                low.notify_one();
                sink.emit(LinkEvent::ChannelClosed);
            })
        }));
    }

    {
        let sink = sink.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let sink = sink.clone();
            Box::pin(async move {
                let frame = if msg.is_string {
                    Frame::Text(String::from_utf8_lossy(&msg.data).into_owned())
                } else {
                    Frame::Binary(msg.data)
                };
                sink.emit(LinkEvent::Frame(frame));
            })
        }));
    }

    {
        let sink = sink.clone();
        dc.on_error(Box::new(move |err| {
            let sink = sink.clone();
            Box::pin(async move {
                warn!(
                    target = "skiff::transport::webrtc",
                    peer_id = %sink.peer_id(),
                    error = %err,
                    "data channel error"
                );
            })
        }));
    }

    let low = channel.low.clone();
    dc.on_buffered_amount_low(Box::new(move || {
        let low = low.clone();
        Box::pin(async move {
            low.notify_one();
        })
    }))
    .await;
}

pub struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
    low: Arc<Notify>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ChannelClosed);
        }
        self.dc.send_text(text).await.map(|_| ()).map_err(backend)
    }

    async fn send_binary(&self, data: Bytes) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ChannelClosed);
        }
        self.dc.send(&data).await.map(|_| ()).map_err(backend)
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn set_low_threshold(&self, bytes: usize) {
        self.dc.set_buffered_amount_low_threshold(bytes).await;
    }

    async fn wait_buffered_low(&self) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ChannelClosed);
        }
        self.low.notified().await;
        if !self.is_open() {
            return Err(TransportError::ChannelClosed);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.dc.ready_state() == RTCDataChannelState::Open
    }
}
