//! Session directory: who is registered, and on which proxy port.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use jturn_proto::ControlMessage;
use tracing::{info, warn};

use crate::backend::Backend;

#[derive(Default)]
struct Maps {
    backends: HashMap<String, Arc<Backend>>,
    ports: HashMap<u16, String>,
}

/// Maps session → backend record and proxy port → session.
///
/// Both maps live behind one lock so a proxy port can never point at a
/// session that is not registered.
pub struct SessionDirectory {
    inner: RwLock<Maps>,
}

impl SessionDirectory {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Maps::default()),
        }
    }

    /// Register a backend under its session and proxy port.
    ///
    /// Fails if either key is already taken.
    pub fn register(&self, backend: Arc<Backend>) -> bool {
        let session = backend.session().to_string();
        let proxy_port = backend.proxy_port();
        let mut maps = self.inner.write().unwrap();

        if maps.backends.contains_key(&session) || maps.ports.contains_key(&proxy_port) {
            warn!(session, proxy_port, "Refusing duplicate registration");
            return false;
        }

        maps.ports.insert(proxy_port, session.clone());
        maps.backends.insert(session.clone(), backend);
        info!(session, proxy_port, "Backend registered in directory");
        true
    }

    pub fn get(&self, session: &str) -> Option<Arc<Backend>> {
        self.inner.read().unwrap().backends.get(session).cloned()
    }

    pub fn by_port(&self, proxy_port: u16) -> Option<Arc<Backend>> {
        let maps = self.inner.read().unwrap();
        let session = maps.ports.get(&proxy_port)?;
        maps.backends.get(session).cloned()
    }

    /// Remove the backend owning `proxy_port` from both maps.
    pub fn remove_port(&self, proxy_port: u16) -> Option<Arc<Backend>> {
        let mut maps = self.inner.write().unwrap();
        let session = maps.ports.remove(&proxy_port)?;
        maps.backends.remove(&session)
    }

    pub fn ports(&self) -> Vec<u16> {
        self.inner.read().unwrap().ports.keys().copied().collect()
    }

    pub fn count(&self) -> usize {
        self.inner.read().unwrap().backends.len()
    }

    /// Send a control message to a session's backend; `false` when the
    /// session is unknown or the write fails.
    pub async fn send(&self, session: &str, message: &ControlMessage) -> bool {
        match self.get(session) {
            Some(backend) => backend.send(message).await,
            None => {
                warn!(session, "Send to unknown session");
                false
            }
        }
    }
}

impl Default for SessionDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jturn_core::TunnelSocket;
    use tokio::net::{TcpListener, TcpStream};

    async fn test_backend(proxy_port: u16) -> Arc<Backend> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        tokio::spawn(async move {
            let _hold = client;
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        });
        Arc::new(Backend::new(TunnelSocket::new(server).unwrap(), proxy_port))
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let directory = SessionDirectory::new();
        let backend = test_backend(50010).await;
        let session = backend.session().to_string();

        assert!(directory.register(Arc::clone(&backend)));
        assert_eq!(directory.count(), 1);
        assert!(directory.get(&session).is_some());
        assert_eq!(
            directory.by_port(50010).unwrap().session(),
            session.as_str()
        );
    }

    #[tokio::test]
    async fn test_duplicate_port_refused() {
        let directory = SessionDirectory::new();
        let first = test_backend(50011).await;
        let second = test_backend(50011).await;

        assert!(directory.register(first));
        assert!(!directory.register(second));
        assert_eq!(directory.count(), 1);
    }

    #[tokio::test]
    async fn test_remove_port_clears_both_maps() {
        let directory = SessionDirectory::new();
        let backend = test_backend(50012).await;
        let session = backend.session().to_string();
        directory.register(backend);

        let removed = directory.remove_port(50012).unwrap();
        assert_eq!(removed.session(), session.as_str());
        assert!(directory.get(&session).is_none());
        assert!(directory.by_port(50012).is_none());
        assert!(directory.remove_port(50012).is_none());
    }

    #[tokio::test]
    async fn test_send_to_unknown_session_fails() {
        let directory = SessionDirectory::new();
        assert!(!directory.send("nope", &ControlMessage::Pong).await);
    }

    #[tokio::test]
    async fn test_send_reaches_backend_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let peer = TunnelSocket::new(client).unwrap();

        let directory = SessionDirectory::new();
        let backend = Arc::new(Backend::new(TunnelSocket::new(server).unwrap(), 50013));
        let session = backend.session().to_string();
        directory.register(backend);

        assert!(
            directory
                .send(&session, &ControlMessage::RequireSocket { count: 1 })
                .await
        );
        let seen = peer.read_message().await.unwrap().unwrap();
        assert_eq!(seen, ControlMessage::RequireSocket { count: 1 }.encode());
    }
}
