//! JTURN wire protocol
//!
//! Text messages carried over plain TCP, each prefixed with the literal
//! protocol tag. Control messages and raw relay payload share the same byte
//! stream; control text is recognized by exact full-chunk equality.

mod messages;

pub use messages::{ControlMessage, ProtocolError, MAX_CHUNK, PROTOCOL_PREFIX};
