use crate::identity::IdentityError;
use crate::session::{SendOutcome, SessionError};
use crate::transport::TransportError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Session(#[from] SessionError),
    #[error("{0}")]
    Identity(#[from] IdentityError),
    #[error("{0}")]
    Transport(#[from] TransportError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("logging initialization failed: {0}")]
    Logging(String),
    #[error("invalid relay url '{0}'")]
    InvalidRelayUrl(String),
    #[error("peer {peer_id} did not appear within {wait_secs}s")]
    PeerNotFound { peer_id: String, wait_secs: u64 },
    #[error("peer {peer_id} appeared but no connection opened within {wait_secs}s")]
    PeerUnreachable { peer_id: String, wait_secs: u64 },
    #[error("send to {peer_id} was not accepted: {outcome:?}")]
    SendRejected {
        peer_id: String,
        outcome: SendOutcome,
    },
}
