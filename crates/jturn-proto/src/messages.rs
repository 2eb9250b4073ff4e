//! Protocol message catalog
//!
//! Every message is a single UTF-8 chunk (no framing, no newline) starting
//! with [`PROTOCOL_PREFIX`]. The relay sentinels (`Client Closed`,
//! `Server Closed`) travel in-band on the payload stream: a payload chunk
//! that happens to equal one of them byte-for-byte would be misread as a
//! control signal. That is a latent bug of the original protocol, kept here
//! for wire compatibility.

use thiserror::Error;

/// Literal tag prefixing every protocol message.
pub const PROTOCOL_PREFIX: &str = "JTURN-F/1.0 ";

/// Read granularity for both control messages and relay payload.
pub const MAX_CHUNK: usize = 1024;

const REGISTER_PS: &str = "Register PS";
const REGISTER_PS_SUCCESS: &str = "Register PS Success:";
const REGISTER_PS_ERROR: &str = "Register PS Error:";
const REGISTER_TRANSMIT: &str = "Register Transmit Socket Session:";
const REGISTER_TRANSMIT_ERROR: &str = "Register Transmit Socket ERROR";
const PING: &str = "Ping:";
const PONG: &str = "Pong";
const TRANSMIT_PING: &str = "Ping";
const REQUIRE_SOCKET: &str = "Require Socket:";
const REQUIRE_SOCKET_ERROR: &str = "Require Socket Error:";
const AWARE_SOCKET: &str = "Aware Socket:";
const CLIENT_CLOSED: &str = "Client Closed";
const SERVER_CLOSED: &str = "Server Closed";
const BACKEND_CLOSED: &str = "PS Closed";

const PORT_SEPARATOR: &str = ";;port:";

/// Errors raised while decoding a received chunk as a control message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("message does not start with protocol prefix: {0:?}")]
    MissingPrefix(String),

    #[error("unknown message: {0:?}")]
    UnknownMessage(String),

    #[error("malformed {field} in {message:?}")]
    MalformedField {
        field: &'static str,
        message: String,
    },
}

/// A decoded JTURN control message.
///
/// The control channel and the transmit channels share this vocabulary. The
/// transmit liveness probe is the bare `Ping` (no session suffix); `Pong` is
/// textually identical on both channels and therefore a single variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Backend opens a control session.
    RegisterBackend,
    /// Server assigned a session and a public proxy port.
    RegisterBackendSuccess { session: String, proxy_port: u16 },
    /// Server refused the registration.
    RegisterBackendError { reason: String },
    /// Backend offers a freshly opened transmit socket.
    RegisterTransmit { session: String, original_port: u16 },
    /// Server refused the transmit socket (unknown session); acceptance is
    /// silent, the socket's next traffic is the liveness probe.
    RegisterTransmitError,
    /// Control heartbeat from the backend.
    Ping { session: String },
    /// Heartbeat reply, also the transmit liveness reply.
    Pong,
    /// Transmit-socket liveness probe sent by the server before relay use.
    TransmitPing,
    /// Server demands `count` more transmit sockets.
    RequireSocket { count: u32 },
    /// Backend could not satisfy a socket demand.
    RequireSocketError,
    /// Server is about to claim the transmit socket opened from this port.
    AwareSocket { original_port: u16 },
    /// In-band: the public client disconnected.
    ClientClosed,
    /// In-band: the proxied service disconnected.
    ServerClosed,
    /// Control session teardown notice, sent by whichever side exits first:
    /// the backend on its way out, or the server at shutdown.
    BackendClosed,
}

impl ControlMessage {
    /// Render the message to its wire form, prefix included.
    pub fn encode(&self) -> String {
        let body = match self {
            ControlMessage::RegisterBackend => REGISTER_PS.to_string(),
            ControlMessage::RegisterBackendSuccess {
                session,
                proxy_port,
            } => format!("{REGISTER_PS_SUCCESS}{session}{PORT_SEPARATOR}{proxy_port}"),
            ControlMessage::RegisterBackendError { reason } => {
                format!("{REGISTER_PS_ERROR}{reason}")
            }
            ControlMessage::RegisterTransmit {
                session,
                original_port,
            } => format!("{REGISTER_TRANSMIT}{session}{PORT_SEPARATOR}{original_port}"),
            ControlMessage::RegisterTransmitError => REGISTER_TRANSMIT_ERROR.to_string(),
            ControlMessage::Ping { session } => format!("{PING}{session}"),
            ControlMessage::Pong => PONG.to_string(),
            ControlMessage::TransmitPing => TRANSMIT_PING.to_string(),
            ControlMessage::RequireSocket { count } => format!("{REQUIRE_SOCKET}{count}"),
            ControlMessage::RequireSocketError => REQUIRE_SOCKET_ERROR.to_string(),
            ControlMessage::AwareSocket { original_port } => {
                format!("{AWARE_SOCKET}{original_port}")
            }
            ControlMessage::ClientClosed => CLIENT_CLOSED.to_string(),
            ControlMessage::ServerClosed => SERVER_CLOSED.to_string(),
            ControlMessage::BackendClosed => BACKEND_CLOSED.to_string(),
        };
        format!("{PROTOCOL_PREFIX}{body}")
    }

    /// Decode one received chunk.
    pub fn parse(raw: &str) -> Result<ControlMessage, ProtocolError> {
        let body = raw
            .strip_prefix(PROTOCOL_PREFIX)
            .ok_or_else(|| ProtocolError::MissingPrefix(raw.to_string()))?;

        // Exact matches first: several prefixes overlap ("Ping" vs "Ping:",
        // "Register PS" vs "Register PS Success:").
        match body {
            REGISTER_PS => return Ok(ControlMessage::RegisterBackend),
            REGISTER_TRANSMIT_ERROR => return Ok(ControlMessage::RegisterTransmitError),
            PONG => return Ok(ControlMessage::Pong),
            TRANSMIT_PING => return Ok(ControlMessage::TransmitPing),
            CLIENT_CLOSED => return Ok(ControlMessage::ClientClosed),
            SERVER_CLOSED => return Ok(ControlMessage::ServerClosed),
            BACKEND_CLOSED => return Ok(ControlMessage::BackendClosed),
            REQUIRE_SOCKET_ERROR => return Ok(ControlMessage::RequireSocketError),
            _ => {}
        }

        if let Some(rest) = body.strip_prefix(REGISTER_PS_SUCCESS) {
            let (session, port) = split_session_port(rest, raw)?;
            return Ok(ControlMessage::RegisterBackendSuccess {
                session,
                proxy_port: port,
            });
        }
        if let Some(rest) = body.strip_prefix(REGISTER_PS_ERROR) {
            return Ok(ControlMessage::RegisterBackendError {
                reason: rest.to_string(),
            });
        }
        if let Some(rest) = body.strip_prefix(REGISTER_TRANSMIT) {
            let (session, port) = split_session_port(rest, raw)?;
            return Ok(ControlMessage::RegisterTransmit {
                session,
                original_port: port,
            });
        }
        if let Some(rest) = body.strip_prefix(PING) {
            return Ok(ControlMessage::Ping {
                session: rest.to_string(),
            });
        }
        if let Some(rest) = body.strip_prefix(REQUIRE_SOCKET) {
            let count = rest.parse().map_err(|_| ProtocolError::MalformedField {
                field: "count",
                message: raw.to_string(),
            })?;
            return Ok(ControlMessage::RequireSocket { count });
        }
        if let Some(rest) = body.strip_prefix(AWARE_SOCKET) {
            let original_port = rest.parse().map_err(|_| ProtocolError::MalformedField {
                field: "port",
                message: raw.to_string(),
            })?;
            return Ok(ControlMessage::AwareSocket { original_port });
        }

        Err(ProtocolError::UnknownMessage(raw.to_string()))
    }
}

fn split_session_port(rest: &str, raw: &str) -> Result<(String, u16), ProtocolError> {
    let (session, port) = rest
        .split_once(PORT_SEPARATOR)
        .ok_or_else(|| ProtocolError::MalformedField {
            field: "session/port pair",
            message: raw.to_string(),
        })?;
    let port = port.parse().map_err(|_| ProtocolError::MalformedField {
        field: "port",
        message: raw.to_string(),
    })?;
    Ok((session.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: ControlMessage) {
        let wire = msg.encode();
        assert!(wire.starts_with(PROTOCOL_PREFIX));
        assert!(wire.len() <= MAX_CHUNK);
        assert_eq!(ControlMessage::parse(&wire).unwrap(), msg);
    }

    #[test]
    fn test_catalog_round_trips() {
        round_trip(ControlMessage::RegisterBackend);
        round_trip(ControlMessage::RegisterBackendSuccess {
            session: "Backend-1.2.3.4:5678::50001-1733820000000".to_string(),
            proxy_port: 50001,
        });
        round_trip(ControlMessage::RegisterBackendError {
            reason: "Server Full".to_string(),
        });
        round_trip(ControlMessage::RegisterTransmit {
            session: "Backend-1.2.3.4:5678::50001-1733820000000".to_string(),
            original_port: 61234,
        });
        round_trip(ControlMessage::RegisterTransmitError);
        round_trip(ControlMessage::Ping {
            session: "s".to_string(),
        });
        round_trip(ControlMessage::Pong);
        round_trip(ControlMessage::TransmitPing);
        round_trip(ControlMessage::RequireSocket { count: 1 });
        round_trip(ControlMessage::RequireSocketError);
        round_trip(ControlMessage::AwareSocket {
            original_port: 61234,
        });
        round_trip(ControlMessage::ClientClosed);
        round_trip(ControlMessage::ServerClosed);
        round_trip(ControlMessage::BackendClosed);
    }

    #[test]
    fn test_wire_text_matches_catalog() {
        assert_eq!(
            ControlMessage::RegisterBackend.encode(),
            "JTURN-F/1.0 Register PS"
        );
        assert_eq!(
            ControlMessage::RegisterBackendSuccess {
                session: "s".to_string(),
                proxy_port: 50001,
            }
            .encode(),
            "JTURN-F/1.0 Register PS Success:s;;port:50001"
        );
        assert_eq!(
            ControlMessage::RegisterTransmit {
                session: "s".to_string(),
                original_port: 4321,
            }
            .encode(),
            "JTURN-F/1.0 Register Transmit Socket Session:s;;port:4321"
        );
        assert_eq!(
            ControlMessage::Ping {
                session: "s".to_string()
            }
            .encode(),
            "JTURN-F/1.0 Ping:s"
        );
        assert_eq!(ControlMessage::TransmitPing.encode(), "JTURN-F/1.0 Ping");
        assert_eq!(ControlMessage::Pong.encode(), "JTURN-F/1.0 Pong");
        assert_eq!(
            ControlMessage::RequireSocket { count: 2 }.encode(),
            "JTURN-F/1.0 Require Socket:2"
        );
        assert_eq!(
            ControlMessage::ClientClosed.encode(),
            "JTURN-F/1.0 Client Closed"
        );
        assert_eq!(
            ControlMessage::ServerClosed.encode(),
            "JTURN-F/1.0 Server Closed"
        );
        assert_eq!(
            ControlMessage::BackendClosed.encode(),
            "JTURN-F/1.0 PS Closed"
        );
    }

    #[test]
    fn test_bare_ping_is_transmit_variant() {
        assert_eq!(
            ControlMessage::parse("JTURN-F/1.0 Ping").unwrap(),
            ControlMessage::TransmitPing
        );
        assert_eq!(
            ControlMessage::parse("JTURN-F/1.0 Ping:abc").unwrap(),
            ControlMessage::Ping {
                session: "abc".to_string()
            }
        );
    }

    #[test]
    fn test_missing_prefix_rejected() {
        let err = ControlMessage::parse("Register PS").unwrap_err();
        assert!(matches!(err, ProtocolError::MissingPrefix(_)));
    }

    #[test]
    fn test_unknown_message_rejected() {
        let err = ControlMessage::parse("JTURN-F/1.0 Open Sesame").unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownMessage(_)));
    }

    #[test]
    fn test_malformed_port_rejected() {
        let err = ControlMessage::parse("JTURN-F/1.0 Aware Socket:many").unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedField { .. }));

        let err =
            ControlMessage::parse("JTURN-F/1.0 Register PS Success:sess-without-port").unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedField { .. }));
    }

    #[test]
    fn test_payload_is_not_a_message() {
        assert!(ControlMessage::parse("GET / HTTP/1.1\r\n").is_err());
    }
}
