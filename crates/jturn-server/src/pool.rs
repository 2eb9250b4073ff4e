//! Per-session transmit socket pool.
//!
//! Spare sockets are idle and reusable; busy sockets are relaying exactly
//! one client. A socket is always in exactly one of the two sets. Demand is
//! signaled to the backend over the control channel when a claim finds the
//! spare set empty.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use jturn_core::{StatusCell, TransmitSocket, TunnelSocket};
use jturn_proto::ControlMessage;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::registry::SessionDirectory;

struct SessionPool {
    spare: Mutex<VecDeque<Arc<TransmitSocket>>>,
    busy: Mutex<Vec<Arc<TransmitSocket>>>,
    /// Woken whenever a socket lands in the spare set.
    arrival: Notify,
}

impl SessionPool {
    fn new() -> Self {
        Self {
            spare: Mutex::new(VecDeque::new()),
            busy: Mutex::new(Vec::new()),
            arrival: Notify::new(),
        }
    }

    fn pop_spare(&self) -> Option<Arc<TransmitSocket>> {
        self.spare.lock().unwrap().pop_front()
    }

    fn push_spare(&self, socket: Arc<TransmitSocket>) {
        self.spare.lock().unwrap().push_back(socket);
        self.arrival.notify_one();
    }

    fn push_busy(&self, socket: Arc<TransmitSocket>) {
        self.busy.lock().unwrap().push(socket);
    }

    fn remove_busy(&self, socket: &Arc<TransmitSocket>) {
        self.busy
            .lock()
            .unwrap()
            .retain(|s| !Arc::ptr_eq(s, socket));
    }

    fn drain(&self) -> Vec<Arc<TransmitSocket>> {
        let mut all: Vec<_> = self.spare.lock().unwrap().drain(..).collect();
        all.extend(self.busy.lock().unwrap().drain(..));
        all
    }
}

/// Server-side pool of backend-opened transmit sockets.
pub struct TransmitPool {
    sessions: RwLock<HashMap<String, Arc<SessionPool>>>,
    directory: Arc<SessionDirectory>,
    config: Arc<ServerConfig>,
    status: StatusCell,
}

impl TransmitPool {
    pub fn new(directory: Arc<SessionDirectory>, config: Arc<ServerConfig>) -> Self {
        let status = StatusCell::new();
        status.set_working();
        Self {
            sessions: RwLock::new(HashMap::new()),
            directory,
            config,
            status,
        }
    }

    /// Create the session's spare/busy sets. Called at backend registration;
    /// transmit sockets for unknown sessions are rejected.
    pub fn create_session(&self, session: &str) {
        self.sessions
            .write()
            .unwrap()
            .entry(session.to_string())
            .or_insert_with(|| Arc::new(SessionPool::new()));
    }

    fn session_pool(&self, session: &str) -> Option<Arc<SessionPool>> {
        self.sessions.read().unwrap().get(session).cloned()
    }

    /// Whether a transmit socket for this session would be accepted.
    pub fn accepts(&self, session: &str) -> bool {
        self.status.is_working() && self.sessions.read().unwrap().contains_key(session)
    }

    /// Accept a freshly opened transmit socket into the spare set.
    pub fn register_transmit(&self, session: &str, original_port: u16, socket: TunnelSocket) -> bool {
        if !self.status.is_working() {
            return false;
        }
        let Some(pool) = self.session_pool(session) else {
            warn!(session, original_port, "Transmit socket for unknown session");
            return false;
        };

        info!(
            session,
            original_port,
            peer = %socket.peer_addr(),
            "Transmit socket registered"
        );
        pool.push_spare(Arc::new(TransmitSocket::new(
            socket,
            session.to_string(),
            original_port,
        )));
        true
    }

    /// Claim a live transmit socket for one client relay.
    ///
    /// When the spare set is empty, signal `Require Socket:1` and wait up to
    /// `claim_wait × attempt` for an arrival. Dead candidates are discarded
    /// without spending the attempt budget. A candidate is returned only
    /// after the backend was told to bind it (`Aware Socket`) and it answered
    /// the transmit `Ping` with `Pong`.
    pub async fn claim(&self, session: &str) -> Option<Arc<TransmitSocket>> {
        let pool = self.session_pool(session)?;
        let mut attempt: u32 = 0;

        while attempt < self.config.claim_attempts && self.status.is_working() {
            attempt += 1;

            let candidate = match pool.pop_spare() {
                Some(candidate) => candidate,
                None => {
                    self.directory
                        .send(session, &ControlMessage::RequireSocket { count: 1 })
                        .await;
                    let wait = self.config.claim_wait * attempt;
                    if tokio::time::timeout(wait, pool.arrival.notified())
                        .await
                        .is_err()
                    {
                        continue;
                    }
                    match pool.pop_spare() {
                        Some(candidate) => candidate,
                        None => continue,
                    }
                }
            };

            if candidate.is_closed() || !candidate.is_alive(self.config.transmit_keep_alive) {
                debug!(session, port = candidate.original_port(), "Discarding dead spare");
                candidate.close().await;
                attempt = attempt.saturating_sub(1);
                continue;
            }

            if !self
                .directory
                .send(
                    session,
                    &ControlMessage::AwareSocket {
                        original_port: candidate.original_port(),
                    },
                )
                .await
            {
                candidate.close().await;
                continue;
            }

            if !candidate
                .write_str_unchecked(&ControlMessage::TransmitPing.encode())
                .await
            {
                candidate.close().await;
                continue;
            }
            let wait = self.config.claim_wait * attempt;
            match tokio::time::timeout(wait, candidate.read_message()).await {
                Ok(Ok(Some(reply))) if reply == ControlMessage::Pong.encode() => {}
                other => {
                    warn!(session, ?other, "Transmit liveness handshake failed");
                    candidate.close().await;
                    continue;
                }
            }

            pool.push_busy(Arc::clone(&candidate));
            return Some(candidate);
        }

        warn!(session, "No transmit socket available");
        None
    }

    /// Give a socket back after its relay finished: respare it while the
    /// pool is working and the socket is still alive, discard it otherwise.
    pub async fn return_socket(&self, socket: &Arc<TransmitSocket>) {
        let Some(pool) = self.session_pool(socket.session()) else {
            socket.close().await;
            return;
        };
        pool.remove_busy(socket);

        if !self.status.is_working() || !socket.is_alive(self.config.transmit_keep_alive) {
            socket.close().await;
            return;
        }
        if !socket.is_closed() {
            debug!(
                session = socket.session(),
                port = socket.original_port(),
                "Transmit socket recycled"
            );
            pool.push_spare(Arc::clone(socket));
        }
    }

    /// Evict dead or closed sockets from every spare set.
    pub async fn reap_idle(&self) {
        if !self.status.is_working() {
            return;
        }
        let pools: Vec<(String, Arc<SessionPool>)> = self
            .sessions
            .read()
            .unwrap()
            .iter()
            .map(|(s, p)| (s.clone(), Arc::clone(p)))
            .collect();

        for (session, pool) in pools {
            let removed: Vec<Arc<TransmitSocket>> = {
                let mut spare = pool.spare.lock().unwrap();
                let mut removed = Vec::new();
                spare.retain(|socket| {
                    let keep = !socket.is_closed()
                        && socket.is_alive(self.config.transmit_keep_alive);
                    if !keep {
                        removed.push(Arc::clone(socket));
                    }
                    keep
                });
                removed
            };
            if !removed.is_empty() {
                debug!(session, count = removed.len(), "Reaped idle transmit sockets");
            }
            for socket in removed {
                socket.close().await;
            }
        }
    }

    /// Close every socket of one session and drop its pool state.
    pub async fn close_session(&self, session: &str) {
        if !self.status.is_working() {
            return;
        }
        let Some(pool) = self.sessions.write().unwrap().remove(session) else {
            return;
        };
        for socket in pool.drain() {
            socket.close().await;
        }
        info!(session, "Transmit pool closed");
    }

    /// Idempotent teardown of all sessions.
    pub async fn shutdown(&self) {
        if !self.status.begin_close() {
            return;
        }
        info!("Shutdown transmit pool...");
        let pools: Vec<Arc<SessionPool>> =
            self.sessions.write().unwrap().drain().map(|(_, p)| p).collect();
        for pool in pools {
            for socket in pool.drain() {
                socket.close().await;
            }
        }
        self.status.finish_close();
        info!("Transmit pool shutdown gracefully");
    }

    pub fn spare_count(&self, session: &str) -> usize {
        self.session_pool(session)
            .map(|p| p.spare.lock().unwrap().len())
            .unwrap_or(0)
    }

    pub fn busy_count(&self, session: &str) -> usize {
        self.session_pool(session)
            .map(|p| p.busy.lock().unwrap().len())
            .unwrap_or(0)
    }
}
