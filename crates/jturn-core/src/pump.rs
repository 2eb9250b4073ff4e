//! One-directional relay pump.
//!
//! Copies chunks from a source socket to a destination socket until EOF, an
//! I/O error, either endpoint being closed, or a full-chunk match of the
//! configured stop sentinel. Control text and raw payload share the stream;
//! sentinel recognition is exact byte equality of a whole chunk.

use tracing::{debug, info, warn};

use crate::socket::TunnelSocket;

/// Per-direction pump behavior.
#[derive(Default)]
pub struct PumpConfig<'a> {
    /// A chunk equal to this message terminates the pump without being
    /// forwarded (e.g. `Server Closed` on the transmit→client direction).
    pub stop_sentinel: Option<&'a str>,
    /// Best-effort control notice written to the destination once the pump
    /// exits (e.g. `Client Closed` toward the transmit socket).
    pub exit_notice: Option<&'a str>,
}

/// Run one pump direction to completion.
///
/// The caller owns endpoint teardown and pool bookkeeping; the pump only
/// moves bytes and emits the exit notice.
pub async fn pump(label: &str, src: &TunnelSocket, dst: &TunnelSocket, config: PumpConfig<'_>) {
    debug!(
        pump = label,
        src = %src.peer_addr(),
        dst = %dst.peer_addr(),
        "Pump started"
    );

    while !src.is_closed() && !dst.is_closed() {
        let chunk = match src.read_chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => {
                debug!(pump = label, src = %src.peer_addr(), "Source reached EOF");
                break;
            }
            Err(e) => {
                if !src.is_closed() {
                    info!(pump = label, src = %src.peer_addr(), error = %e, "Source read interrupted");
                }
                break;
            }
        };

        if let Some(sentinel) = config.stop_sentinel {
            if chunk.as_ref() == sentinel.as_bytes() {
                debug!(pump = label, "Stop sentinel observed");
                break;
            }
        }

        if let Err(e) = dst.write(&chunk).await {
            // A write racing our own teardown of the peer is expected.
            if !dst.is_closed() {
                warn!(pump = label, dst = %dst.peer_addr(), error = %e, "Destination write interrupted");
            }
            break;
        }
    }

    if let Some(notice) = config.exit_notice {
        let _ = dst.write_unchecked(notice.as_bytes()).await;
    }

    debug!(pump = label, "Pump finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use jturn_proto::ControlMessage;
    use std::sync::Arc;
    use tokio::net::{TcpListener, TcpStream};

    async fn socket_pair() -> (Arc<TunnelSocket>, Arc<TunnelSocket>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (
            Arc::new(TunnelSocket::new(client).unwrap()),
            Arc::new(TunnelSocket::new(server).unwrap()),
        )
    }

    #[tokio::test]
    async fn test_pump_forwards_bytes_unmodified() {
        // upstream writes into src_in, pump copies src_out -> dst_in,
        // downstream reads from dst_out.
        let (src_in, src_out) = socket_pair().await;
        let (dst_in, dst_out) = socket_pair().await;

        let handle = {
            let src = Arc::clone(&src_out);
            let dst = Arc::clone(&dst_in);
            tokio::spawn(async move { pump("test", &src, &dst, PumpConfig::default()).await })
        };

        let payload = vec![0xAAu8, 0, 1, 2, 255];
        src_in.write(&payload).await.unwrap();
        let seen = dst_out.read_chunk().await.unwrap().unwrap();
        assert_eq!(seen.as_ref(), payload.as_slice());

        src_in.close().await;
        drop(src_in);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_pump_stops_on_sentinel_without_forwarding() {
        let (src_in, src_out) = socket_pair().await;
        let (dst_in, dst_out) = socket_pair().await;

        let sentinel = ControlMessage::ServerClosed.encode();
        let handle = {
            let src = Arc::clone(&src_out);
            let dst = Arc::clone(&dst_in);
            let sentinel = sentinel.clone();
            tokio::spawn(async move {
                pump(
                    "test",
                    &src,
                    &dst,
                    PumpConfig {
                        stop_sentinel: Some(&sentinel),
                        exit_notice: None,
                    },
                )
                .await
            })
        };

        src_in.write_str(&sentinel).await.unwrap();
        handle.await.unwrap();

        // Nothing was forwarded; closing both ends must leave dst_out at EOF.
        dst_in.close().await;
        drop(dst_in);
        assert!(dst_out.read_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pump_emits_exit_notice_on_eof() {
        let (src_in, src_out) = socket_pair().await;
        let (dst_in, dst_out) = socket_pair().await;

        let notice = ControlMessage::ClientClosed.encode();
        let handle = {
            let src = Arc::clone(&src_out);
            let dst = Arc::clone(&dst_in);
            let notice = notice.clone();
            tokio::spawn(async move {
                pump(
                    "test",
                    &src,
                    &dst,
                    PumpConfig {
                        stop_sentinel: None,
                        exit_notice: Some(&notice),
                    },
                )
                .await
            })
        };

        src_in.close().await;
        drop(src_in);
        handle.await.unwrap();

        let seen = dst_out.read_chunk().await.unwrap().unwrap();
        assert_eq!(seen.as_ref(), notice.as_bytes());
    }
}
