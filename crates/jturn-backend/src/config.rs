//! Backend agent configuration.

use std::time::Duration;

/// Tunable knobs of the backend agent.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Relay server to register with.
    pub server_host: String,
    pub server_port: u16,
    /// Local service the tunnel exposes.
    pub local_service_port: u16,
    /// Control heartbeat period.
    pub heartbeat_interval: Duration,
    /// A spare transmit socket idle longer than this is dead.
    pub keep_alive: Duration,
    /// Period of the idle-socket reaper.
    pub reap_interval: Duration,
    /// Consecutive control-socket read errors tolerated before giving up.
    pub read_error_tolerance: u32,
    /// Extra creation attempts when a demanded transmit socket fails.
    pub create_retries: u32,
    /// Write retries when registering a fresh transmit socket.
    pub register_write_retries: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            server_host: "127.0.0.1".to_string(),
            server_port: 13520,
            local_service_port: 8080,
            heartbeat_interval: Duration::from_secs(1),
            keep_alive: Duration::from_secs(5 * 60),
            reap_interval: Duration::from_secs(5 * 60),
            read_error_tolerance: 10,
            create_retries: 5,
            register_write_retries: 3,
        }
    }
}
