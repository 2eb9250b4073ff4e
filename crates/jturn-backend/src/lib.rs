//! JTURN backend agent
//!
//! Runs next to a NAT-hidden local service. Registers with the relay server
//! over one control channel, keeps the session alive with heartbeats and
//! opens outbound transmit sockets on demand so public clients can reach
//! the local service.

pub mod config;
pub mod control;
pub mod error;
pub mod transmit;

pub use config::BackendConfig;
pub use control::ControlChannel;
pub use error::BackendError;
pub use transmit::TransmitBridge;
