//! Server configuration.

use std::time::Duration;

use jturn_core::{DEFAULT_MAX_PORT, DEFAULT_MIN_PORT};

/// Tunable knobs of the relay server.
///
/// The online timeout (control heartbeat) and the transmit keep-alive are
/// independent windows and must stay so: the first detects a dead backend in
/// seconds, the second lets an idle pooled socket survive minutes.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port the backend dials for registration and transmit sockets.
    pub registration_port: u16,
    /// Maximum number of simultaneously registered backends.
    pub max_backends: usize,
    /// Maximum concurrently relayed clients per backend; clients past the
    /// cap are rejected immediately, never queued.
    pub max_clients_per_backend: usize,
    /// Proxy-port allocation range, inclusive.
    pub min_proxy_port: u16,
    pub max_proxy_port: u16,
    /// A backend whose last heartbeat is older than this is offline.
    pub online_timeout: Duration,
    /// A transmit socket idle longer than this is dead.
    pub transmit_keep_alive: Duration,
    /// Period of the idle-socket and offline-backend reapers.
    pub reap_interval: Duration,
    /// Attempts to obtain a live transmit socket per client.
    pub claim_attempts: u32,
    /// Base wait for a demanded socket; grows linearly with the attempt.
    pub claim_wait: Duration,
    /// Write retries for the registration success reply.
    pub register_write_retries: u32,
    /// Consecutive control-socket read errors tolerated before force-close.
    pub read_error_tolerance: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            registration_port: 13520,
            max_backends: 32,
            max_clients_per_backend: 64,
            min_proxy_port: DEFAULT_MIN_PORT,
            max_proxy_port: DEFAULT_MAX_PORT,
            online_timeout: Duration::from_millis(3000),
            transmit_keep_alive: Duration::from_secs(5 * 60),
            reap_interval: Duration::from_secs(5 * 60),
            claim_attempts: 3,
            claim_wait: Duration::from_millis(500),
            register_write_retries: 3,
            read_error_tolerance: 5,
        }
    }
}
