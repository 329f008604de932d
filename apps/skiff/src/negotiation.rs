use std::fmt;
use std::sync::Arc;

use skiff_proto::{IceCandidate, NegotiationPayload};
use thiserror::Error;
use tracing::{debug, info};

use crate::transport::{PeerLink, TransportError};

/// Whether this side sends the offer for a given pair of ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// The side whose id sorts greater (byte order) initiates. Both peers
/// compute this independently and always agree, so exactly one offer is
/// made per pair.
pub fn elect_initiator<'a>(a: &'a str, b: &'a str) -> &'a str {
    if a.as_bytes() >= b.as_bytes() {
        a
    } else {
        b
    }
}

pub fn role_for(local_id: &str, remote_id: &str) -> Role {
    if local_id != remote_id && elect_initiator(local_id, remote_id) == local_id {
        Role::Initiator
    } else {
        Role::Responder
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Negotiating,
    Connected,
    Closed,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::Negotiating => "negotiating",
            NegotiationState::Connected => "connected",
            NegotiationState::Closed => "closed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("unexpected {kind} while {state} as {role:?}")]
    Unexpected {
        kind: &'static str,
        state: NegotiationState,
        role: Role,
    },
    #[error(transparent)]
    Backend(#[from] TransportError),
}

/// Drives offer/answer/candidate exchange with one remote peer.
pub struct Negotiator {
    remote_id: String,
    role: Role,
    state: NegotiationState,
    link: Arc<dyn PeerLink>,
    remote_described: bool,
    pending_candidates: Vec<IceCandidate>,
}

impl Negotiator {
    pub fn new(local_id: &str, remote_id: &str, link: Arc<dyn PeerLink>) -> Self {
        Self {
            remote_id: remote_id.to_string(),
            role: role_for(local_id, remote_id),
            state: NegotiationState::Idle,
            link,
            remote_described: false,
            pending_candidates: Vec::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Nothing has been exchanged with the remote side yet.
    pub fn is_fresh(&self) -> bool {
        self.state == NegotiationState::Idle && !self.remote_described
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Begin negotiating. The initiator returns the offer to relay; the
    /// responder waits for one and returns `None`.
    pub async fn start(&mut self) -> Result<Option<NegotiationPayload>, NegotiationError> {
        if self.role == Role::Responder || self.state != NegotiationState::Idle {
            return Ok(None);
        }
        let sdp = self.link.create_offer().await?;
        self.state = NegotiationState::Negotiating;
        info!(peer_id = %self.remote_id, "offer created");
        Ok(Some(NegotiationPayload::Offer { sdp }))
    }

    /// Apply one relayed payload. Returns a reply to relay back, if any.
    pub async fn handle_signal(
        &mut self,
        payload: NegotiationPayload,
    ) -> Result<Option<NegotiationPayload>, NegotiationError> {
        let kind = payload.kind();
        match payload {
            NegotiationPayload::Offer { sdp } => {
                let acceptable = self.role == Role::Responder
                    && !self.remote_described
                    && matches!(
                        self.state,
                        NegotiationState::Idle | NegotiationState::Negotiating
                    );
                if !acceptable {
                    return Err(self.unexpected(kind));
                }
                let answer = self.link.accept_offer(sdp).await?;
                self.remote_described = true;
                self.state = NegotiationState::Negotiating;
                self.flush_candidates().await;
                info!(peer_id = %self.remote_id, "offer accepted; answering");
                Ok(Some(NegotiationPayload::Answer { sdp: answer }))
            }
            NegotiationPayload::Answer { sdp } => {
                let acceptable = self.role == Role::Initiator
                    && !self.remote_described
                    && self.state == NegotiationState::Negotiating;
                if !acceptable {
                    return Err(self.unexpected(kind));
                }
                self.link.accept_answer(sdp).await?;
                self.remote_described = true;
                self.flush_candidates().await;
                info!(peer_id = %self.remote_id, "answer applied");
                Ok(None)
            }
            NegotiationPayload::Candidate { candidate } => {
                if self.state == NegotiationState::Closed {
                    return Err(self.unexpected(kind));
                }
                if self.remote_described {
                    self.link.add_candidate(candidate).await?;
                } else {
                    debug!(peer_id = %self.remote_id, "buffering candidate until remote description");
                    self.pending_candidates.push(candidate);
                }
                Ok(None)
            }
        }
    }

    pub fn channel_open(&mut self) {
        if self.state != NegotiationState::Closed {
            self.state = NegotiationState::Connected;
        }
    }

    /// The link went away underneath us.
    pub fn mark_closed(&mut self) {
        self.state = NegotiationState::Closed;
        self.pending_candidates.clear();
    }

    pub async fn close(&mut self) {
        if self.state != NegotiationState::Closed {
            self.mark_closed();
            self.link.close().await;
        }
    }

    async fn flush_candidates(&mut self) {
        for candidate in std::mem::take(&mut self.pending_candidates) {
            if let Err(err) = self.link.add_candidate(candidate).await {
                debug!(peer_id = %self.remote_id, error = %err, "buffered candidate rejected");
            }
        }
    }

    fn unexpected(&self, kind: &'static str) -> NegotiationError {
        NegotiationError::Unexpected {
            kind,
            state: self.state,
            role: self.role,
        }
    }
}
