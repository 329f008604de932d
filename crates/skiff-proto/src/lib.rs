//! Wire definitions shared by the relay and the device client.
//! Kept in a dedicated crate so the relay never links the WebRTC stack.

pub mod frame;
pub mod signaling;

pub use frame::{ControlFrame, TransferHeader};
pub use signaling::{
    ClientMessage, DeviceClass, DeviceInfo, IceCandidate, NegotiationPayload, PeerInfo,
    ServerMessage,
};
