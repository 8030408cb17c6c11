//! Server accept loop & per-session dispatcher (spec §4.5).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use reqwest::Client;
use rustls::ServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};
use tunnel_proto::{tls, Envelope, EnvelopeCodec};

use crate::connect_relay;
use crate::http_executor;
use crate::registry::{ForwardError, ServerRegistry};

const WRITER_CHANNEL_CAPACITY: usize = 256;

pub struct SessionLimits {
    pub request_timeout: Duration,
    pub connect_dial_timeout: Duration,
    pub max_response_body: usize,
}

/// Accept inbound mTLS connections and spawn one session task per
/// connection, refusing new connections once `max_sessions` are active
/// (spec §6 `max_sessions`).
pub async fn run_accept_loop(
    addr: SocketAddr,
    server_config: Arc<ServerConfig>,
    http_client: Client,
    limits: Arc<SessionLimits>,
    max_sessions: usize,
    active_sessions: Arc<AtomicUsize>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("tunnel server listening on {addr}");

    loop {
        let (tcp, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("failed to accept connection: {e}");
                continue;
            }
        };

        if active_sessions.load(Ordering::SeqCst) >= max_sessions {
            warn!("rejecting session from {peer}: at capacity ({max_sessions})");
            drop(tcp);
            continue;
        }

        let server_config = Arc::clone(&server_config);
        let http_client = http_client.clone();
        let limits = Arc::clone(&limits);
        let active_sessions = Arc::clone(&active_sessions);

        active_sessions.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            if let Err(e) = run_session(tcp, peer, server_config, http_client, limits).await {
                debug!("session from {peer} ended: {e:?}");
            }
            active_sessions.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

async fn run_session(
    tcp: TcpStream,
    peer: SocketAddr,
    server_config: Arc<ServerConfig>,
    http_client: Client,
    limits: Arc<SessionLimits>,
) -> anyhow::Result<()> {
    let tls_stream = tls::accept(tcp, server_config).await?;
    let identity = tls::peer_identity(&tls_stream);
    info!("session established with {peer} ({identity})");

    let framed = Framed::new(tls_stream, EnvelopeCodec::new());
    let (mut sink, mut stream) = framed.split();

    let (writer_tx, mut writer_rx) = mpsc::channel::<Envelope>(WRITER_CHANNEL_CAPACITY);
    let writer_task = tokio::spawn(async move {
        while let Some(env) = writer_rx.recv().await {
            if let Err(e) = sink.send(env).await {
                warn!("session write failed: {e}");
                break;
            }
        }
    });

    let registry = Arc::new(ServerRegistry::new());

    while let Some(decoded) = stream.next().await {
        match decoded {
            Ok(env) => {
                dispatch(
                    env,
                    Arc::clone(&registry),
                    writer_tx.clone(),
                    http_client.clone(),
                    Arc::clone(&limits),
                )
                .await;
            }
            Err(e) => {
                warn!("session with {peer} ({identity}) protocol error, tearing down: {e}");
                break;
            }
        }
    }

    drop(writer_tx);
    writer_task.abort();
    info!("session with {peer} ({identity}) closed, {} streams dropped", registry.len());
    Ok(())
}

/// Dispatches one decoded envelope. `connect_data`/`connect_close` are
/// forwarded inline rather than spawned: `ServerRegistry::forward_*`
/// awaits room in the relay's channel, so a slow origin write pump
/// backpressures this reader loop directly, which in turn stalls reads
/// off the mTLS socket and backpressures the Agent over TCP (spec §4.5,
/// §4.7).
async fn dispatch(
    env: Envelope,
    registry: Arc<ServerRegistry>,
    writer_tx: mpsc::Sender<Envelope>,
    http_client: Client,
    limits: Arc<SessionLimits>,
) {
    match env {
        Envelope::HttpRequest(req) => {
            let id = req.id.clone();
            registry.register_http(id.clone());
            tokio::spawn(async move {
                let resp = http_executor::execute(
                    &http_client,
                    req,
                    limits.request_timeout,
                    limits.max_response_body,
                )
                .await;
                registry.remove(&id);
                let _ = writer_tx.send(Envelope::HttpResponse(resp)).await;
            });
        }
        Envelope::ConnectOpen(open) => {
            registry.register_connect_opening(open.id.clone());
            let registry = Arc::clone(&registry);
            let dial_timeout = limits.connect_dial_timeout;
            tokio::spawn(connect_relay::run(open.id, open.host, dial_timeout, registry, writer_tx));
        }
        Envelope::ConnectData(data) => match registry.forward_data(&data.id, data.data).await {
            Ok(()) | Err(ForwardError::RelayGone) => {}
            Err(e) => warn!("protocol violation: connect_data for {} while {:?}", data.id, e),
        },
        Envelope::ConnectClose(close) => match registry.forward_close(&close.id).await {
            Ok(()) => {}
            Err(e) => debug!("connect_close for {} ignored: {:?}", close.id, e),
        },
        other @ (Envelope::HttpResponse(_) | Envelope::ConnectAck(_)) => {
            error!("server received a client-originated envelope type it should never see: {}", other.kind());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_limits_carries_configured_values() {
        let limits = SessionLimits {
            request_timeout: Duration::from_secs(5),
            connect_dial_timeout: Duration::from_secs(2),
            max_response_body: 1024,
        };
        assert_eq!(limits.request_timeout, Duration::from_secs(5));
        assert_eq!(limits.max_response_body, 1024);
    }
}
