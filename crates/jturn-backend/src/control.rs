//! Control channel to the relay server.
//!
//! Owns the registration handshake, the 1-second heartbeat and the command
//! read loop. Demand commands are served by the [`TransmitBridge`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use jturn_core::{now_millis, spawn_repeating, ErrorBudget, StatusCell, TunnelSocket};
use jturn_proto::ControlMessage;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::BackendConfig;
use crate::error::BackendError;
use crate::transmit::TransmitBridge;

/// One registered backend session, live until either side closes it.
pub struct ControlChannel {
    socket: Arc<TunnelSocket>,
    session: String,
    proxy_port: u16,
    bridge: Arc<TransmitBridge>,
    config: Arc<BackendConfig>,
    status: StatusCell,
    last_pong: AtomicU64,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("session", &self.session)
            .field("proxy_port", &self.proxy_port)
            .finish_non_exhaustive()
    }
}

impl ControlChannel {
    /// Connect, register and go live.
    ///
    /// Returns once the server has assigned a session and proxy port; the
    /// heartbeat, the command loop and the idle reaper run on background
    /// tasks until [`shutdown`](Self::shutdown).
    pub async fn start(config: BackendConfig) -> Result<Arc<Self>, BackendError> {
        let config = Arc::new(config);
        let addr = format!("{}:{}", config.server_host, config.server_port);
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|source| BackendError::Connect {
                addr: addr.clone(),
                source,
            })?;
        let socket = Arc::new(TunnelSocket::new(stream)?);
        info!(addr, local_port = socket.local_port(), "Connected to relay server");

        socket
            .write_str(&ControlMessage::RegisterBackend.encode())
            .await?;
        let reply = socket.read_message().await?.ok_or_else(|| {
            BackendError::Registration {
                reason: "connection closed during registration".to_string(),
            }
        })?;

        let (session, proxy_port) = match ControlMessage::parse(&reply) {
            Ok(ControlMessage::RegisterBackendSuccess {
                session,
                proxy_port,
            }) => (session, proxy_port),
            Ok(ControlMessage::RegisterBackendError { reason }) => {
                return Err(BackendError::Registration { reason });
            }
            other => {
                return Err(BackendError::Registration {
                    reason: format!("unexpected reply: {other:?}"),
                });
            }
        };
        info!(session, proxy_port, "Registered, proxied on public port");

        let bridge = Arc::new(TransmitBridge::new(Arc::clone(&config)));
        let status = StatusCell::new();
        status.set_working();
        let channel = Arc::new(Self {
            socket,
            session,
            proxy_port,
            bridge,
            config,
            status,
            last_pong: AtomicU64::new(now_millis()),
            timers: Mutex::new(Vec::new()),
        });

        let mut timers = channel.timers.lock().unwrap();
        timers.push({
            let socket = Arc::clone(&channel.socket);
            let ping = ControlMessage::Ping {
                session: channel.session.clone(),
            }
            .encode();
            spawn_repeating(
                Duration::ZERO,
                channel.config.heartbeat_interval,
                move || {
                    let socket = Arc::clone(&socket);
                    let ping = ping.clone();
                    async move {
                        socket.write_str_unchecked(&ping).await;
                    }
                },
            )
        });
        timers.push({
            let bridge = Arc::clone(&channel.bridge);
            spawn_repeating(
                channel.config.reap_interval,
                channel.config.reap_interval,
                move || {
                    let bridge = Arc::clone(&bridge);
                    async move { bridge.reap_idle().await }
                },
            )
        });
        drop(timers);

        let runner = Arc::clone(&channel);
        tokio::spawn(async move { runner.read_loop().await });

        Ok(channel)
    }

    /// Serve server commands until the control socket dies.
    async fn read_loop(self: Arc<Self>) {
        let mut errors = ErrorBudget::new(self.config.read_error_tolerance);
        while !self.socket.is_closed() {
            let text = match self.socket.read_message().await {
                Ok(Some(text)) => text,
                Ok(None) => {
                    if self.status.is_working() {
                        error!("Relay server closed the control channel");
                    }
                    break;
                }
                Err(e) => {
                    let spent = errors.record();
                    warn!(error = %e, errors = errors.errors(), "Control read error");
                    if spent {
                        break;
                    }
                    continue;
                }
            };
            errors.reset();

            match ControlMessage::parse(&text) {
                Ok(ControlMessage::Pong) => {
                    self.last_pong.store(now_millis(), Ordering::Relaxed);
                }
                Ok(ControlMessage::RequireSocket { count }) => {
                    self.handle_require(count).await;
                }
                Ok(ControlMessage::AwareSocket { original_port }) => {
                    if !self.bridge.bind_transmit_socket(original_port).await {
                        warn!(original_port, "Bind on aware notice failed");
                    }
                }
                Ok(ControlMessage::BackendClosed) => {
                    info!("Relay server announced shutdown");
                    break;
                }
                Ok(other) => {
                    debug!(message = ?other, "Ignoring control message");
                }
                Err(e) => {
                    debug!(error = %e, "Unparseable control message");
                }
            }
        }

        self.socket
            .write_str_unchecked(&ControlMessage::BackendClosed.encode())
            .await;
        info!("Control channel closed");
        self.shutdown().await;
    }

    /// Open `count` fresh transmit sockets, with a bounded retry budget for
    /// failed creations; past the budget the demand is answered with an
    /// error notice.
    async fn handle_require(&self, count: u32) {
        let mut remaining = count;
        let mut retries = self.config.create_retries;
        while remaining > 0 && self.status.is_working() {
            if self.bridge.create_transmit_socket(&self.session).await {
                remaining -= 1;
            } else if retries == 0 {
                warn!(count, remaining, "Could not satisfy socket demand");
                self.socket
                    .write_str_unchecked(&ControlMessage::RequireSocketError.encode())
                    .await;
                break;
            } else {
                retries -= 1;
            }
        }
    }

    /// Idempotent teardown: control socket, transmit sockets, timers.
    pub async fn shutdown(&self) {
        if !self.status.begin_close() {
            return;
        }
        info!("Shutdown control channel...");
        self.socket.close().await;
        self.bridge.shutdown().await;
        for timer in self.timers.lock().unwrap().drain(..) {
            timer.abort();
        }
        self.status.finish_close();
        info!("Control channel shutdown gracefully");
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn proxy_port(&self) -> u16 {
        self.proxy_port
    }

    pub fn bridge(&self) -> &Arc<TransmitBridge> {
        &self.bridge
    }

    pub fn is_working(&self) -> bool {
        self.status.is_working()
    }

    /// Whether the server answered a heartbeat within `window`.
    pub fn server_alive(&self, window: Duration) -> bool {
        now_millis().saturating_sub(self.last_pong.load(Ordering::Relaxed))
            <= window.as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn config_for(addr: std::net::SocketAddr) -> BackendConfig {
        BackendConfig {
            server_host: addr.ip().to_string(),
            server_port: addr.port(),
            heartbeat_interval: Duration::from_millis(50),
            ..BackendConfig::default()
        }
    }

    async fn accept_control(listener: &TcpListener) -> TunnelSocket {
        let (stream, _) = listener.accept().await.unwrap();
        TunnelSocket::new(stream).unwrap()
    }

    #[tokio::test]
    async fn test_start_registers_and_heartbeats() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = config_for(listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let control = accept_control(&listener).await;
            let first = control.read_message().await.unwrap().unwrap();
            assert_eq!(first, ControlMessage::RegisterBackend.encode());
            control
                .write_str(
                    &ControlMessage::RegisterBackendSuccess {
                        session: "sess-1".to_string(),
                        proxy_port: 50055,
                    }
                    .encode(),
                )
                .await
                .unwrap();

            let ping = control.read_message().await.unwrap().unwrap();
            assert_eq!(
                ping,
                ControlMessage::Ping {
                    session: "sess-1".to_string()
                }
                .encode()
            );
            control
                .write_str(&ControlMessage::Pong.encode())
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let channel = ControlChannel::start(config).await.unwrap();
        assert_eq!(channel.session(), "sess-1");
        assert_eq!(channel.proxy_port(), 50055);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(channel.server_alive(Duration::from_secs(3)));
        server.await.unwrap();
        channel.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_fails_on_refusal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = config_for(listener.local_addr().unwrap());

        tokio::spawn(async move {
            let control = accept_control(&listener).await;
            control.read_message().await.unwrap();
            control
                .write_str(
                    &ControlMessage::RegisterBackendError {
                        reason: "Server Full".to_string(),
                    }
                    .encode(),
                )
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        });

        match ControlChannel::start(config).await {
            Err(BackendError::Registration { reason }) => assert_eq!(reason, "Server Full"),
            other => panic!("expected registration refusal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_require_socket_grows_bridge() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = config_for(listener.local_addr().unwrap());

        let control_task = tokio::spawn({
            async move {
                let control = accept_control(&listener).await;
                control.read_message().await.unwrap();
                control
                    .write_str(
                        &ControlMessage::RegisterBackendSuccess {
                            session: "sess-2".to_string(),
                            proxy_port: 50056,
                        }
                        .encode(),
                    )
                    .await
                    .unwrap();
                control
                    .write_str(&ControlMessage::RequireSocket { count: 2 }.encode())
                    .await
                    .unwrap();

                // Absorb the demanded transmit registrations (and ignore the
                // interleaved heartbeats on the control socket).
                let mut registrations = 0;
                while registrations < 2 {
                    let transmit = accept_control(&listener).await;
                    let msg = transmit.read_message().await.unwrap().unwrap();
                    assert!(msg.contains("Register Transmit Socket Session:sess-2"));
                    registrations += 1;
                }
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
        });

        let channel = ControlChannel::start(config).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while channel.bridge().spare_count() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("bridge should grow on demand");

        control_task.await.unwrap();
        channel.shutdown().await;
    }
}
