//! Socket envelope shared by control, transmit and client connections.
//!
//! One reader at a time per socket; writes are serialized behind their own
//! lock so a heartbeat timer and a read-loop reply can write concurrently.

use std::io;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use jturn_proto::MAX_CHUNK;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};

/// Milliseconds since the Unix epoch, the timestamp base for session ids and
/// liveness bookkeeping.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

/// A bidirectional stream socket with chunked reads, locked writes, an
/// idempotent close and activity tracking.
///
/// `close` wakes a reader blocked in [`TunnelSocket::read_chunk`], so a peer
/// that never closes its end cannot wedge teardown.
pub struct TunnelSocket {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    peer_addr: SocketAddr,
    local_port: u16,
    closed: AtomicBool,
    close_signal: Notify,
    last_active: AtomicU64,
}

impl TunnelSocket {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let peer_addr = stream.peer_addr()?;
        let local_port = stream.local_addr()?.port();
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            peer_addr,
            local_port,
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
            last_active: AtomicU64::new(now_millis()),
        })
    }

    /// Read one chunk of up to [`MAX_CHUNK`] bytes.
    ///
    /// Returns `Ok(None)` on EOF or once this socket has been closed by us.
    pub async fn read_chunk(&self) -> io::Result<Option<Bytes>> {
        if self.is_closed() {
            return Ok(None);
        }
        let closed = self.close_signal.notified();
        tokio::pin!(closed);

        let mut reader = self.reader.lock().await;
        let mut buf = vec![0u8; MAX_CHUNK];
        tokio::select! {
            _ = &mut closed => Ok(None),
            res = reader.read(&mut buf) => {
                let n = res?;
                if n == 0 {
                    return Ok(None);
                }
                self.touch();
                buf.truncate(n);
                Ok(Some(Bytes::from(buf)))
            }
        }
    }

    /// Read one chunk and decode it as UTF-8 text (lossy).
    pub async fn read_message(&self) -> io::Result<Option<String>> {
        Ok(self
            .read_chunk()
            .await?
            .map(|chunk| String::from_utf8_lossy(&chunk).into_owned()))
    }

    pub async fn write(&self, bytes: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "socket closed"));
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        self.touch();
        Ok(())
    }

    pub async fn write_str(&self, message: &str) -> io::Result<()> {
        self.write(message.as_bytes()).await
    }

    /// Best-effort write; failures are reported only through the return value.
    pub async fn write_unchecked(&self, bytes: &[u8]) -> bool {
        self.write(bytes).await.is_ok()
    }

    pub async fn write_str_unchecked(&self, message: &str) -> bool {
        self.write_unchecked(message.as_bytes()).await
    }

    /// Idempotent close: marks the socket closed by us, wakes a blocked
    /// reader and shuts the write direction down.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close_signal.notify_one();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    /// True once we have closed this socket ourselves. Used to suppress
    /// error logs for writes racing an expected teardown.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn is_alive(&self, keep_alive: Duration) -> bool {
        now_millis().saturating_sub(self.last_active.load(Ordering::Relaxed))
            < keep_alive.as_millis() as u64
    }

    fn touch(&self) {
        self.last_active.store(now_millis(), Ordering::Relaxed);
    }
}

/// A pooled transmit socket: the envelope tagged with its owning session and
/// the local ephemeral port the backend opened it from (its pool key).
pub struct TransmitSocket {
    socket: TunnelSocket,
    session: String,
    original_port: u16,
}

impl TransmitSocket {
    pub fn new(socket: TunnelSocket, session: String, original_port: u16) -> Self {
        Self {
            socket,
            session,
            original_port,
        }
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn original_port(&self) -> u16 {
        self.original_port
    }
}

impl Deref for TransmitSocket {
    type Target = TunnelSocket;

    fn deref(&self) -> &TunnelSocket {
        &self.socket
    }
}
