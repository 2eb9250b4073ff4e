//! Ephemeral port allocation by random probing.

use rand::Rng;
use tokio::net::TcpListener;
use tracing::debug;

/// Default probe range, the IANA dynamic/private port block.
pub const DEFAULT_MIN_PORT: u16 = 49152;
pub const DEFAULT_MAX_PORT: u16 = 65535;

/// Finds an unused TCP port by random probing within a configured range.
///
/// The successful probe's listener is handed back still bound, so there is
/// no window for another allocation (or another process) to race the bind.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    min_port: u16,
    max_port: u16,
}

impl PortAllocator {
    pub fn new(min_port: u16, max_port: u16) -> Self {
        debug_assert!(min_port <= max_port);
        Self { min_port, max_port }
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.min_port..=self.max_port).contains(&port)
    }

    /// Probe up to `tries` random ports; `None` once the budget is spent
    /// (in particular when the whole range is occupied).
    pub async fn bind_free_port(&self, tries: usize) -> Option<(u16, TcpListener)> {
        for _ in 0..tries {
            let port = rand::thread_rng().gen_range(self.min_port..=self.max_port);
            match TcpListener::bind(("0.0.0.0", port)).await {
                Ok(listener) => {
                    debug!(port, "Allocated proxy port");
                    return Some((port, listener));
                }
                Err(_) => continue,
            }
        }
        None
    }

    /// Probe with a budget covering the whole range.
    pub async fn bind_any(&self) -> Option<(u16, TcpListener)> {
        let span = usize::from(self.max_port - self.min_port) + 1;
        self.bind_free_port(span).await
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_PORT, DEFAULT_MAX_PORT)
    }
}
