//! Relay server orchestration.
//!
//! One registration listener accepts both backend control channels and
//! transmit sockets; the first message on a connection decides which it is.
//! Each registered backend gets a dedicated public proxy port, a session in
//! the transmit pool and a control read loop serving its heartbeats.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};

use jturn_core::{
    spawn_repeating, ErrorBudget, PortAllocator, ServiceStatus, StatusCell, TunnelSocket,
};
use jturn_proto::ControlMessage;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::listener::run_public_listener;
use crate::pool::TransmitPool;
use crate::registry::SessionDirectory;
use crate::task_tracker::TaskTracker;

/// The JTURN relay server.
pub struct TurnServer {
    config: Arc<ServerConfig>,
    directory: Arc<SessionDirectory>,
    pool: Arc<TransmitPool>,
    allocator: PortAllocator,
    tasks: TaskTracker,
    status: StatusCell,
    registration_addr: OnceLock<SocketAddr>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl TurnServer {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let config = Arc::new(config);
        let directory = Arc::new(SessionDirectory::new());
        let pool = Arc::new(TransmitPool::new(
            Arc::clone(&directory),
            Arc::clone(&config),
        ));
        let allocator = PortAllocator::new(config.min_proxy_port, config.max_proxy_port);
        Arc::new(Self {
            config,
            directory,
            pool,
            allocator,
            tasks: TaskTracker::new(),
            status: StatusCell::new(),
            registration_addr: OnceLock::new(),
            background: Mutex::new(Vec::new()),
        })
    }

    /// Bind the registration listener and start serving.
    ///
    /// Returns once the listener is bound; accepting and relaying run on
    /// background tasks until [`shutdown`](Self::shutdown).
    pub async fn start(self: &Arc<Self>) -> Result<(), ServerError> {
        let port = self.config.registration_port;
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|source| ServerError::Bind { port, source })?;
        let addr = listener.local_addr()?;
        let _ = self.registration_addr.set(addr);
        self.status.set_working();
        info!(%addr, "JTURN server listening for registrations");

        let mut background = self.background.lock().unwrap();
        background.push({
            let server = Arc::clone(self);
            tokio::spawn(async move { server.accept_loop(listener).await })
        });
        background.push({
            let server = Arc::clone(self);
            spawn_repeating(
                self.config.reap_interval,
                self.config.reap_interval,
                move || {
                    let server = Arc::clone(&server);
                    async move { server.pool.reap_idle().await }
                },
            )
        });
        background.push({
            let server = Arc::clone(self);
            spawn_repeating(
                self.config.reap_interval,
                self.config.reap_interval,
                move || {
                    let server = Arc::clone(&server);
                    async move { server.reap_offline_backends().await }
                },
            )
        });
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        while self.status.is_working() {
            let stream = match listener.accept().await {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!(error = %e, "Registration accept failed");
                    continue;
                }
            };
            let socket = match TunnelSocket::new(stream) {
                Ok(socket) => socket,
                Err(e) => {
                    warn!(error = %e, "Registration socket setup failed");
                    continue;
                }
            };
            let server = Arc::clone(&self);
            tokio::spawn(async move { server.handle_registration(socket).await });
        }
    }

    /// Dispatch a new connection on its first message.
    async fn handle_registration(self: Arc<Self>, socket: TunnelSocket) {
        let first = match socket.read_message().await {
            Ok(Some(first)) => first,
            Ok(None) => return,
            Err(e) => {
                debug!(peer = %socket.peer_addr(), error = %e, "Registration read failed");
                return;
            }
        };

        match ControlMessage::parse(&first) {
            Ok(ControlMessage::RegisterBackend) => self.register_backend(socket).await,
            Ok(ControlMessage::RegisterTransmit {
                session,
                original_port,
            }) => {
                self.register_transmit(socket, &session, original_port)
                    .await
            }
            Ok(other) => {
                warn!(peer = %socket.peer_addr(), message = ?other, "Unexpected first message");
                socket.close().await;
            }
            Err(e) => {
                warn!(peer = %socket.peer_addr(), error = %e, "Unparseable registration");
                socket.close().await;
            }
        }
    }

    /// Register a backend: allocate its proxy port, record it, start its
    /// public listener and control read loop, then confirm over the wire.
    async fn register_backend(self: &Arc<Self>, socket: TunnelSocket) {
        if self.directory.count() >= self.config.max_backends {
            warn!(peer = %socket.peer_addr(), "Backend capacity reached");
            let reply = ControlMessage::RegisterBackendError {
                reason: "Server Full".to_string(),
            };
            socket.write_str_unchecked(&reply.encode()).await;
            socket.close().await;
            return;
        }

        let Some((proxy_port, proxy_listener)) = self.allocator.bind_any().await else {
            warn!(peer = %socket.peer_addr(), "No free proxy port");
            let reply = ControlMessage::RegisterBackendError {
                reason: "No Free Port".to_string(),
            };
            socket.write_str_unchecked(&reply.encode()).await;
            socket.close().await;
            return;
        };

        let backend = Arc::new(Backend::new(socket, proxy_port));
        let session = backend.session().to_string();
        if !self.directory.register(Arc::clone(&backend)) {
            let reply = ControlMessage::RegisterBackendError {
                reason: "Register Proxy Error".to_string(),
            };
            backend.send(&reply).await;
            backend.close().await;
            return;
        }
        self.pool.create_session(&session);

        let listener_task = tokio::spawn(run_public_listener(
            proxy_listener,
            proxy_port,
            session.clone(),
            Arc::clone(&self.pool),
            Arc::clone(&self.config),
        ));
        self.tasks.register(proxy_port, listener_task);

        let reply = ControlMessage::RegisterBackendSuccess {
            session: session.clone(),
            proxy_port,
        };
        let mut confirmed = false;
        for _ in 0..self.config.register_write_retries {
            if backend.send(&reply).await {
                confirmed = true;
                break;
            }
        }
        if !confirmed {
            warn!(session, proxy_port, "Registration reply failed, tearing down");
            self.close_port(proxy_port).await;
            return;
        }
        info!(session, proxy_port, peer = %backend.remote_addr(), "Backend registered");

        let server = Arc::clone(self);
        tokio::spawn(async move { server.backend_read_loop(backend).await });
    }

    /// Accept a transmit socket into the backend's pool.
    ///
    /// Acceptance is silent: the next thing the backend reads on the socket
    /// is the liveness probe at claim time. Only rejection is answered.
    async fn register_transmit(&self, socket: TunnelSocket, session: &str, original_port: u16) {
        if !self.pool.accepts(session) {
            socket
                .write_str_unchecked(&ControlMessage::RegisterTransmitError.encode())
                .await;
            socket.close().await;
            return;
        }
        if !self.pool.register_transmit(session, original_port, socket) {
            debug!(session, original_port, "Transmit socket lost its session");
        }
    }

    /// Serve one backend's control channel until it closes, announces exit
    /// or stops answering heartbeats.
    async fn backend_read_loop(self: Arc<Self>, backend: Arc<Backend>) {
        let mut errors = ErrorBudget::new(self.config.read_error_tolerance);
        while !backend.is_closed() && backend.is_online(self.config.online_timeout) {
            let read = tokio::time::timeout(self.config.online_timeout, backend.read()).await;
            let text = match read {
                // No traffic inside the window; the loop condition decides.
                Err(_) => continue,
                Ok(Ok(Some(text))) => text,
                Ok(Ok(None)) => break,
                Ok(Err(e)) => {
                    let spent = errors.record();
                    debug!(
                        session = backend.session(),
                        error = %e,
                        errors = errors.errors(),
                        "Control read error"
                    );
                    if spent {
                        warn!(session = backend.session(), "Control channel unusable");
                        break;
                    }
                    continue;
                }
            };
            errors.reset();

            match ControlMessage::parse(&text) {
                Ok(ControlMessage::Ping { session }) => {
                    if session == backend.session() {
                        backend.refresh_online();
                        backend.send(&ControlMessage::Pong).await;
                    } else {
                        debug!(
                            expected = backend.session(),
                            got = %session,
                            "Heartbeat for wrong session"
                        );
                    }
                }
                Ok(ControlMessage::BackendClosed) => {
                    info!(session = backend.session(), "Backend announced shutdown");
                    break;
                }
                Ok(other) => {
                    debug!(session = backend.session(), message = ?other, "Ignoring control message");
                }
                Err(e) => {
                    debug!(session = backend.session(), error = %e, "Unparseable control message");
                }
            }
        }
        self.close_port(backend.proxy_port()).await;
    }

    /// Tear down everything attached to one proxy port.
    pub async fn close_port(&self, proxy_port: u16) {
        if self.status.get() == ServiceStatus::Closed {
            return;
        }
        let Some(backend) = self.directory.remove_port(proxy_port) else {
            return;
        };
        let session = backend.session().to_string();
        info!(session, proxy_port, "Closing backend");
        self.pool.close_session(&session).await;
        backend.close().await;
        self.tasks.unregister(proxy_port);
    }

    /// Drop backends whose control read loop wedged without noticing the
    /// heartbeat lapse.
    async fn reap_offline_backends(&self) {
        for port in self.directory.ports() {
            if let Some(backend) = self.directory.by_port(port) {
                if backend.is_closed() || !backend.is_online(self.config.online_timeout) {
                    info!(
                        session = backend.session(),
                        proxy_port = port,
                        "Reaping offline backend"
                    );
                    self.close_port(port).await;
                }
            }
        }
    }

    /// Idempotent full teardown.
    pub async fn shutdown(&self) {
        if !self.status.begin_close() {
            return;
        }
        info!("Shutdown server...");
        for port in self.directory.ports() {
            if let Some(backend) = self.directory.remove_port(port) {
                backend.send(&ControlMessage::BackendClosed).await;
                backend.close().await;
                self.tasks.unregister(port);
            }
        }
        self.pool.shutdown().await;
        self.tasks.abort_all();
        for handle in self.background.lock().unwrap().drain(..) {
            handle.abort();
        }
        self.status.finish_close();
        info!("Server shutdown gracefully");
    }

    /// Actual registration address, available after [`start`](Self::start).
    pub fn registration_addr(&self) -> Option<SocketAddr> {
        self.registration_addr.get().copied()
    }

    pub fn directory(&self) -> &Arc<SessionDirectory> {
        &self.directory
    }

    pub fn pool(&self) -> &Arc<TransmitPool> {
        &self.pool
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}
