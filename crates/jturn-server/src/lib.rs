//! JTURN relay server
//!
//! Accepts backend registrations on a single public registration port,
//! allocates one public proxy port per backend and relays every client
//! connection on that port through the backend's pool of outbound transmit
//! sockets.

pub mod backend;
pub mod config;
pub mod error;
mod listener;
pub mod pool;
pub mod registry;
pub mod server;
mod task_tracker;

pub use backend::Backend;
pub use config::ServerConfig;
pub use error::ServerError;
pub use pool::TransmitPool;
pub use registry::SessionDirectory;
pub use server::TurnServer;
