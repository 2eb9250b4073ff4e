//! Backend-side transmit socket management.
//!
//! Spare sockets are outbound connections to the relay, registered and
//! parked until the server claims one. They are keyed by their local port:
//! that port is what the server's `Aware Socket` notice names. Binding a
//! socket connects it to the local service and starts the relay pumps.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use jturn_core::{pump, PumpConfig, StatusCell, TransmitSocket, TunnelSocket};
use jturn_proto::ControlMessage;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::BackendConfig;

/// Pool of transmit sockets bridging the relay server to the local service.
pub struct TransmitBridge {
    spare: Mutex<HashMap<u16, Arc<TransmitSocket>>>,
    busy: Mutex<Vec<Arc<TransmitSocket>>>,
    config: Arc<BackendConfig>,
    status: StatusCell,
}

impl TransmitBridge {
    pub fn new(config: Arc<BackendConfig>) -> Self {
        let status = StatusCell::new();
        status.set_working();
        Self {
            spare: Mutex::new(HashMap::new()),
            busy: Mutex::new(Vec::new()),
            config,
            status,
        }
    }

    /// Open one fresh transmit socket to the relay and register it under
    /// the session.
    pub async fn create_transmit_socket(&self, session: &str) -> bool {
        if !self.status.is_working() {
            return false;
        }

        let addr = format!("{}:{}", self.config.server_host, self.config.server_port);
        let stream = match TcpStream::connect(&addr).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(addr, error = %e, "Create transmit socket failed");
                return false;
            }
        };
        let socket = match TunnelSocket::new(stream) {
            Ok(socket) => socket,
            Err(e) => {
                warn!(addr, error = %e, "Transmit socket setup failed");
                return false;
            }
        };
        let local_port = socket.local_port();
        let transmit = Arc::new(TransmitSocket::new(
            socket,
            session.to_string(),
            local_port,
        ));

        // Parked before the register write so an early Aware Socket notice
        // finds it.
        self.spare
            .lock()
            .unwrap()
            .insert(local_port, Arc::clone(&transmit));

        let register = ControlMessage::RegisterTransmit {
            session: session.to_string(),
            original_port: local_port,
        };
        let mut registered = false;
        for _ in 0..self.config.register_write_retries {
            if transmit.write_str(&register.encode()).await.is_ok() {
                registered = true;
                break;
            }
        }
        if !registered {
            self.spare.lock().unwrap().remove(&local_port);
            transmit.close().await;
            warn!(local_port, "Transmit socket registration write failed");
            return false;
        }

        debug!(local_port, "Transmit socket created");
        true
    }

    /// Answer an `Aware Socket` notice: wire the named spare to the local
    /// service and start relaying.
    pub async fn bind_transmit_socket(self: &Arc<Self>, port: u16) -> bool {
        let Some(transmit) = self.spare.lock().unwrap().remove(&port) else {
            warn!(port, "Transmit socket not found");
            return false;
        };
        if transmit.is_closed() || !transmit.is_alive(self.config.keep_alive) {
            warn!(port, "Transmit socket no longer usable");
            transmit.close().await;
            return false;
        }
        if !self.status.is_working() {
            transmit.close().await;
            return false;
        }

        let local_addr = format!("127.0.0.1:{}", self.config.local_service_port);
        let local = match TcpStream::connect(&local_addr).await {
            Ok(stream) => match TunnelSocket::new(stream) {
                Ok(socket) => Arc::new(socket),
                Err(e) => {
                    warn!(port, error = %e, "Local socket setup failed");
                    transmit.close().await;
                    return false;
                }
            },
            Err(e) => {
                warn!(port, addr = %local_addr, error = %e, "Local service unreachable");
                transmit.close().await;
                return false;
            }
        };

        // Liveness handshake before any payload moves.
        match transmit.read_message().await {
            Ok(Some(probe)) if probe == ControlMessage::TransmitPing.encode() => {}
            other => {
                warn!(port, ?other, "Expected liveness probe");
                transmit.close().await;
                local.close().await;
                return false;
            }
        }
        if transmit
            .write_str(&ControlMessage::Pong.encode())
            .await
            .is_err()
        {
            warn!(port, "Liveness reply failed");
            transmit.close().await;
            local.close().await;
            return false;
        }

        self.busy.lock().unwrap().push(Arc::clone(&transmit));
        info!(port, "Transmit socket bound to local service");
        self.spawn_relay_pair(local, transmit);
        true
    }

    /// One pump per direction. The transmit-reader pump owns the socket
    /// return; the local-reader pump announces the local service's exit.
    fn spawn_relay_pair(
        self: &Arc<Self>,
        local: Arc<TunnelSocket>,
        transmit: Arc<TransmitSocket>,
    ) {
        {
            let local = Arc::clone(&local);
            let transmit = Arc::clone(&transmit);
            tokio::spawn(async move {
                let notice = ControlMessage::ServerClosed.encode();
                pump(
                    "local->transmit",
                    &local,
                    &transmit,
                    PumpConfig {
                        stop_sentinel: None,
                        exit_notice: Some(&notice),
                    },
                )
                .await;
                local.close().await;
            });
        }

        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            let sentinel = ControlMessage::ClientClosed.encode();
            pump(
                "transmit->local",
                &transmit,
                &local,
                PumpConfig {
                    stop_sentinel: Some(&sentinel),
                    exit_notice: None,
                },
            )
            .await;
            local.close().await;
            bridge.return_socket(&transmit).await;
        });
    }

    /// Park a finished socket again, or discard it if it went stale.
    async fn return_socket(&self, transmit: &Arc<TransmitSocket>) {
        self.busy
            .lock()
            .unwrap()
            .retain(|s| !Arc::ptr_eq(s, transmit));

        if !self.status.is_working() || !transmit.is_alive(self.config.keep_alive) {
            transmit.close().await;
            return;
        }
        if !transmit.is_closed() {
            debug!(port = transmit.original_port(), "Transmit socket recycled");
            self.spare
                .lock()
                .unwrap()
                .insert(transmit.original_port(), Arc::clone(transmit));
        }
    }

    /// Evict dead or closed sockets from the spare set.
    pub async fn reap_idle(&self) {
        if !self.status.is_working() {
            return;
        }
        let removed: Vec<Arc<TransmitSocket>> = {
            let mut spare = self.spare.lock().unwrap();
            let mut removed = Vec::new();
            spare.retain(|_, socket| {
                let keep = !socket.is_closed() && socket.is_alive(self.config.keep_alive);
                if !keep {
                    removed.push(Arc::clone(socket));
                }
                keep
            });
            removed
        };
        if !removed.is_empty() {
            debug!(count = removed.len(), "Reaped idle transmit sockets");
        }
        for socket in removed {
            socket.close().await;
        }
    }

    /// Idempotent teardown of every socket.
    pub async fn shutdown(&self) {
        if !self.status.begin_close() {
            return;
        }
        info!("Shutdown transmit bridge...");
        let all: Vec<Arc<TransmitSocket>> = {
            let mut sockets: Vec<_> = self.spare.lock().unwrap().drain().map(|(_, s)| s).collect();
            sockets.extend(self.busy.lock().unwrap().drain(..));
            sockets
        };
        for socket in all {
            socket.close().await;
        }
        self.status.finish_close();
        info!("Transmit bridge shutdown gracefully");
    }

    pub fn spare_count(&self) -> usize {
        self.spare.lock().unwrap().len()
    }

    pub fn busy_count(&self) -> usize {
        self.busy.lock().unwrap().len()
    }
}
