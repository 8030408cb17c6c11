//! Server CONNECT relay (spec §4.7): dials the origin TCP target and
//! pumps bytes between it and the tunnel session in both directions.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};
use tunnel_proto::{ConnectClosePayload, Envelope, MAX_DATA_CHUNK_BYTES};

use crate::registry::ServerRegistry;

const ORIGIN_CHANNEL_CAPACITY: usize = 32;

/// Parse and validate a `host:port` target per spec §4.7 step 1.
pub fn parse_host_port(host: &str) -> Result<(String, u16), String> {
    let (host_part, port_part) = host.rsplit_once(':').ok_or_else(|| "missing port".to_string())?;
    if host_part.is_empty() {
        return Err("empty host".to_string());
    }
    let port: u16 = port_part.parse().map_err(|_| "port not numeric".to_string())?;
    if port == 0 {
        return Err("port out of range".to_string());
    }
    Ok((host_part.to_string(), port))
}

/// Run one CONNECT relay to completion: dial, ack, pump, teardown.
/// `to_session` is the shared writer channel for outbound envelopes.
/// The channel the dispatcher uses to deliver `connect_data`/
/// `connect_close` for this id is created here and registered with
/// `registry` once the dial succeeds (spec §4.7 step 3).
pub async fn run(
    id: String,
    host: String,
    dial_timeout: Duration,
    registry: Arc<ServerRegistry>,
    to_session: mpsc::Sender<Envelope>,
) {
    let (target_host, target_port) = match parse_host_port(&host) {
        Ok(pair) => pair,
        Err(reason) => {
            let _ = to_session
                .send(Envelope::ConnectAck(tunnel_proto::ConnectAckPayload {
                    id: id.clone(),
                    success: false,
                    error: Some(format!("invalid_host:{reason}")),
                }))
                .await;
            registry.remove(&id);
            return;
        }
    };

    let dial = timeout(dial_timeout, dial(&target_host, target_port)).await;
    let stream = match dial {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            let _ = to_session
                .send(Envelope::ConnectAck(tunnel_proto::ConnectAckPayload {
                    id: id.clone(),
                    success: false,
                    error: Some(format!("dial_failed:{e}")),
                }))
                .await;
            registry.remove(&id);
            return;
        }
        Err(_) => {
            let _ = to_session
                .send(Envelope::ConnectAck(tunnel_proto::ConnectAckPayload {
                    id: id.clone(),
                    success: false,
                    error: Some("dial_failed:timeout".to_string()),
                }))
                .await;
            registry.remove(&id);
            return;
        }
    };

    let (to_origin_tx, mut to_origin_rx) = mpsc::channel::<FromSession>(ORIGIN_CHANNEL_CAPACITY);
    if !registry.mark_established(&id, to_origin_tx) {
        registry.remove(&id);
        return;
    }
    if to_session
        .send(Envelope::ConnectAck(tunnel_proto::ConnectAckPayload {
            id: id.clone(),
            success: true,
            error: None,
        }))
        .await
        .is_err()
    {
        registry.remove(&id);
        return;
    }

    let (mut read_half, mut write_half) = stream.into_split();
    let mut origin_to_tunnel_done = false;
    let mut tunnel_to_origin_done = false;
    let mut buf = vec![0u8; MAX_DATA_CHUNK_BYTES];

    loop {
        if origin_to_tunnel_done && tunnel_to_origin_done {
            break;
        }
        tokio::select! {
            read = read_half.read(&mut buf), if !origin_to_tunnel_done => {
                match read {
                    Ok(0) => {
                        let _ = to_session.send(Envelope::ConnectClose(ConnectClosePayload { id: id.clone(), error: None })).await;
                        origin_to_tunnel_done = true;
                    }
                    Ok(n) => {
                        let env = Envelope::ConnectData(tunnel_proto::ConnectDataPayload {
                            id: id.clone(),
                            data: buf[..n].to_vec(),
                        });
                        if to_session.send(env).await.is_err() {
                            origin_to_tunnel_done = true;
                            tunnel_to_origin_done = true;
                        }
                    }
                    Err(e) => {
                        let _ = to_session.send(Envelope::ConnectClose(ConnectClosePayload { id: id.clone(), error: Some(e.to_string()) })).await;
                        origin_to_tunnel_done = true;
                    }
                }
            }
            event = to_origin_rx.recv(), if !tunnel_to_origin_done => {
                match event {
                    Some(FromSession::Data(data)) => {
                        if write_half.write_all(&data).await.is_err() {
                            tunnel_to_origin_done = true;
                        }
                    }
                    Some(FromSession::Close) | None => {
                        let _ = write_half.shutdown().await;
                        tunnel_to_origin_done = true;
                    }
                }
            }
        }
    }

    registry.remove(&id);
    debug!("CONNECT relay for {id} ({host}) finished");
}

/// Events the session dispatcher forwards to a relay task for its id.
pub enum FromSession {
    Data(Vec<u8>),
    Close,
}

async fn dial(host: &str, port: u16) -> std::io::Result<TcpStream> {
    TcpStream::connect((host, port)).await.map_err(|e| {
        warn!("CONNECT dial to {host}:{port} failed: {e}");
        e
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_host_port() {
        assert_eq!(parse_host_port("example.org:443").unwrap(), ("example.org".to_string(), 443));
    }

    #[test]
    fn rejects_missing_port() {
        assert!(parse_host_port("example.org").is_err());
    }

    #[test]
    fn rejects_zero_port() {
        assert!(parse_host_port("example.org:0").is_err());
    }

    #[test]
    fn rejects_non_numeric_port() {
        assert!(parse_host_port("example.org:https").is_err());
    }

    #[tokio::test]
    async fn dial_to_closed_port_fails() {
        let result = dial("127.0.0.1", 1).await;
        assert!(result.is_err());
    }
}
