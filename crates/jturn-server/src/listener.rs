//! Public proxy-port listener.
//!
//! One listener task per registered backend. Every accepted client claims a
//! transmit socket from the pool and is relayed over it until either side
//! closes.

use std::sync::Arc;

use jturn_core::{now_millis, pump, PumpConfig, TransmitSocket, TunnelSocket};
use jturn_proto::ControlMessage;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::pool::TransmitPool;

/// Accept public clients on one proxy port until the task is aborted.
pub async fn run_public_listener(
    listener: TcpListener,
    proxy_port: u16,
    session: String,
    pool: Arc<TransmitPool>,
    config: Arc<ServerConfig>,
) {
    info!(proxy_port, session = %session, "Public listener started");

    loop {
        let stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(e) => {
                warn!(proxy_port, error = %e, "Accept failed");
                continue;
            }
        };
        let client = match TunnelSocket::new(stream) {
            Ok(client) => Arc::new(client),
            Err(e) => {
                warn!(proxy_port, error = %e, "Client socket setup failed");
                continue;
            }
        };
        let client_id = format!("Client-{}-{}", client.peer_addr(), now_millis());
        info!(proxy_port, client = %client_id, "Client connected");

        if pool.busy_count(&session) >= config.max_clients_per_backend {
            warn!(
                proxy_port,
                client = %client_id,
                "Client limit reached, rejecting"
            );
            client.close().await;
            continue;
        }

        let Some(transmit) = pool.claim(&session).await else {
            warn!(proxy_port, client = %client_id, "No transmit socket, rejecting client");
            client.close().await;
            continue;
        };

        spawn_relay_pair(client_id, client, transmit, Arc::clone(&pool));
    }
}

/// Wire a client to a claimed transmit socket with one pump per direction.
///
/// The client-to-transmit pump owns the socket return: it announces the
/// client's departure to the backend and hands the transmit socket back to
/// the pool exactly once. The opposite pump stops when the backend announces
/// the local service closed.
fn spawn_relay_pair(
    client_id: String,
    client: Arc<TunnelSocket>,
    transmit: Arc<TransmitSocket>,
    pool: Arc<TransmitPool>,
) {
    {
        let client = Arc::clone(&client);
        let transmit = Arc::clone(&transmit);
        let client_id = client_id.clone();
        tokio::spawn(async move {
            let notice = ControlMessage::ClientClosed.encode();
            pump(
                "client->transmit",
                &client,
                &transmit,
                PumpConfig {
                    stop_sentinel: None,
                    exit_notice: Some(&notice),
                },
            )
            .await;
            client.close().await;
            pool.return_socket(&transmit).await;
            info!(client = %client_id, "Client relay finished");
        });
    }

    tokio::spawn(async move {
        let sentinel = ControlMessage::ServerClosed.encode();
        pump(
            "transmit->client",
            &transmit,
            &client,
            PumpConfig {
                stop_sentinel: Some(&sentinel),
                exit_notice: None,
            },
        )
        .await;
        client.close().await;
    });
}
