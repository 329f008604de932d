pub mod config;
pub mod identity;
pub mod negotiation;
pub mod relay;
pub mod session;
pub mod telemetry;
pub mod terminal;
pub mod transport;
