//! Shared tunnel engine pieces used by both the relay server and the
//! NAT-side backend: the socket envelope, the relay pump, the ephemeral port
//! allocator, the service status cell, the repeating-task spawner and the
//! read-error budget shared by the control read loops.

mod allocator;
mod budget;
mod pump;
mod scheduler;
mod socket;
mod status;

pub use allocator::{PortAllocator, DEFAULT_MAX_PORT, DEFAULT_MIN_PORT};
pub use budget::ErrorBudget;
pub use pump::{pump, PumpConfig};
pub use scheduler::spawn_repeating;
pub use socket::{now_millis, TransmitSocket, TunnelSocket};
pub use status::{ServiceStatus, StatusCell};
