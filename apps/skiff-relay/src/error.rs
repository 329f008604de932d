use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("session id {0} is already connected")]
    DuplicateIdentity(String),
    #[error("connection already joined as {0}")]
    AlreadyJoined(String),
}
