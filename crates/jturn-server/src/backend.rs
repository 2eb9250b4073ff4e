//! Backend registration record.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use jturn_core::{now_millis, TunnelSocket};
use jturn_proto::ControlMessage;

/// One registered backend: its write-locked control socket, the proxy port
/// allocated for it and its heartbeat bookkeeping.
///
/// Owned by the [`SessionDirectory`](crate::SessionDirectory) from
/// registration until teardown. Reads are single-consumer (the control read
/// loop); writes may come from the read loop's replies and the pool's demand
/// signals concurrently, which the socket's write lock serializes.
pub struct Backend {
    socket: TunnelSocket,
    remote_addr: SocketAddr,
    proxy_port: u16,
    session: OnceLock<String>,
    last_ping: AtomicU64,
}

impl Backend {
    pub fn new(socket: TunnelSocket, proxy_port: u16) -> Self {
        let remote_addr = socket.peer_addr();
        Self {
            socket,
            remote_addr,
            proxy_port,
            session: OnceLock::new(),
            last_ping: AtomicU64::new(now_millis()),
        }
    }

    /// The session identifier, generated at most once on first access and
    /// immutable afterwards.
    pub fn session(&self) -> &str {
        self.session.get_or_init(|| {
            format!(
                "Backend-{}::{}-{}",
                self.remote_addr,
                self.proxy_port,
                now_millis()
            )
        })
    }

    pub fn proxy_port(&self) -> u16 {
        self.proxy_port
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_online(&self, online_timeout: Duration) -> bool {
        now_millis().saturating_sub(self.last_ping.load(Ordering::Relaxed))
            <= online_timeout.as_millis() as u64
    }

    pub fn refresh_online(&self) {
        self.last_ping.store(now_millis(), Ordering::Relaxed);
    }

    /// Best-effort control-channel send.
    pub async fn send(&self, message: &ControlMessage) -> bool {
        self.socket.write_str_unchecked(&message.encode()).await
    }

    pub async fn read(&self) -> io::Result<Option<String>> {
        self.socket.read_message().await
    }

    pub fn is_closed(&self) -> bool {
        self.socket.is_closed()
    }

    pub async fn close(&self) {
        self.socket.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn test_backend(proxy_port: u16) -> Backend {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        // Keep the peer end alive past the test body.
        tokio::spawn(async move {
            let _hold = client;
            tokio::time::sleep(Duration::from_secs(1)).await;
        });
        Backend::new(TunnelSocket::new(server).unwrap(), proxy_port)
    }

    #[tokio::test]
    async fn test_session_generated_once() {
        let backend = test_backend(50001).await;
        let first = backend.session().to_string();
        assert!(first.starts_with("Backend-"));
        assert!(first.contains("::50001-"));
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(backend.session(), first);
    }

    #[tokio::test]
    async fn test_online_window() {
        let backend = test_backend(50001).await;
        assert!(backend.is_online(Duration::from_millis(3000)));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!backend.is_online(Duration::from_millis(1)));
        backend.refresh_online();
        assert!(backend.is_online(Duration::from_millis(3000)));
    }
}
