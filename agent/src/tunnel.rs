//! Tunnel client & reconnect supervisor (spec §4.4).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};
use tunnel_proto::{
    new_stream_id, tls, ConnectAckPayload, ConnectClosePayload, ConnectDataPayload, ControlPlane,
    Envelope, EnvelopeCodec, HttpRequestPayload, HttpResponsePayload, NoopControlPlane,
    StartOutcome,
};

use crate::config::Config;
use crate::error::StreamError;
use crate::registry::{ConnectEvent, StreamRegistry};

/// Reconnect supervisor state (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    Backoff,
    Stopped,
}

const WRITER_CHANNEL_CAPACITY: usize = 256;
const CONNECT_EVENT_BUFFER: usize = 32;

struct Backoff {
    attempt: u32,
    max: Duration,
}

impl Backoff {
    fn new(max: Duration) -> Self {
        Self { attempt: 0, max }
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Exponential backoff with full jitter, bounded to [1s, `max`].
    fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let base = 1.0_f64;
        let cap = self.max.as_secs_f64().max(base);
        let exp = (base * 2f64.powi(self.attempt.min(10) as i32)).min(cap);
        let secs = rand::thread_rng().gen_range(base..=exp.max(base));
        Duration::from_secs_f64(secs)
    }
}

struct Shared {
    registry: Arc<StreamRegistry>,
    writer: Mutex<Option<mpsc::Sender<Envelope>>>,
    state_tx: watch::Sender<SessionState>,
    shutting_down: AtomicBool,
    config: Config,
}

/// A lazy bidirectional byte stream bound to one CONNECT id (spec §4.4
/// `open_connect`).
pub struct ConnectHandle {
    id: String,
    writer: mpsc::Sender<Envelope>,
    events: mpsc::Receiver<ConnectEvent>,
    registry: Arc<StreamRegistry>,
}

impl ConnectHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Chunk `data` into `connect_data` envelopes and send them. Blocks
    /// (applies backpressure) when the shared writer buffer is full.
    pub async fn send_chunk(&self, data: &[u8]) -> Result<(), StreamError> {
        for chunk in data.chunks(tunnel_proto::MAX_DATA_CHUNK_BYTES) {
            let env = Envelope::ConnectData(ConnectDataPayload {
                id: self.id.clone(),
                data: chunk.to_vec(),
            });
            self.writer.send(env).await.map_err(|_| StreamError::Disconnected)?;
        }
        Ok(())
    }

    pub async fn close(&self, error: Option<String>) -> Result<(), StreamError> {
        let env = Envelope::ConnectClose(ConnectClosePayload {
            id: self.id.clone(),
            error,
        });
        self.writer.send(env).await.map_err(|_| StreamError::Disconnected)
    }

    pub async fn recv(&mut self) -> Option<ConnectEvent> {
        self.events.recv().await
    }
}

impl Drop for ConnectHandle {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}

#[derive(Clone)]
pub struct TunnelClient {
    shared: Arc<Shared>,
}

impl TunnelClient {
    /// Dial and maintain one mTLS session to the Server, spawning the
    /// reconnect supervisor as a background task.
    pub fn spawn(config: Config, control_plane: Arc<dyn ControlPlane>) -> Self {
        let (state_tx, _state_rx) = watch::channel(SessionState::Connecting);
        let shared = Arc::new(Shared {
            registry: Arc::new(StreamRegistry::new()),
            writer: Mutex::new(None),
            state_tx,
            shutting_down: AtomicBool::new(false),
            config,
        });

        let client = TunnelClient {
            shared: Arc::clone(&shared),
        };
        tokio::spawn(run_supervisor(shared, control_plane));
        client
    }

    #[cfg(test)]
    pub fn spawn_noop(config: Config) -> Self {
        Self::spawn(config, Arc::new(NoopControlPlane))
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state_tx.borrow()
    }

    pub fn registry(&self) -> Arc<StreamRegistry> {
        Arc::clone(&self.shared.registry)
    }

    pub async fn send_request(&self, mut req: HttpRequestPayload) -> Result<HttpResponsePayload, StreamError> {
        if self.shared.shutting_down.load(Ordering::SeqCst) {
            return Err(StreamError::Shutdown);
        }
        req.id = new_stream_id();
        let rx = self.shared.registry.register_request(req.id.clone());
        let writer = self.wait_for_writer().await?;
        writer
            .send(Envelope::HttpRequest(req))
            .await
            .map_err(|_| StreamError::Disconnected)?;

        match timeout(self.shared.config.request_timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(StreamError::Disconnected),
            Err(_) => Err(StreamError::Timeout),
        }
    }

    pub async fn open_connect(&self, host: String) -> Result<ConnectHandle, StreamError> {
        if self.shared.shutting_down.load(Ordering::SeqCst) {
            return Err(StreamError::Shutdown);
        }
        let id = new_stream_id();
        let events = self.shared.registry.register_connect(id.clone(), CONNECT_EVENT_BUFFER);
        let writer = self.wait_for_writer().await?;
        writer
            .send(Envelope::ConnectOpen(tunnel_proto::ConnectOpenPayload {
                id: id.clone(),
                host,
            }))
            .await
            .map_err(|_| StreamError::Disconnected)?;

        Ok(ConnectHandle {
            id,
            writer,
            events,
            registry: Arc::clone(&self.shared.registry),
        })
    }

    pub fn shutdown(&self) {
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        let _ = self.shared.state_tx.send(SessionState::Stopped);
        self.shared.registry.fail_all("Shutdown");
    }

    async fn wait_for_writer(&self) -> Result<mpsc::Sender<Envelope>, StreamError> {
        if let Some(w) = self.shared.writer.lock().unwrap().clone() {
            return Ok(w);
        }
        let mut state_rx = self.shared.state_tx.subscribe();
        let deadline = self.shared.config.pre_connect_wake_deadline;
        let wait = async {
            loop {
                if let Some(w) = self.shared.writer.lock().unwrap().clone() {
                    return w;
                }
                if state_rx.changed().await.is_err() {
                    // supervisor dropped its sender; session is gone for good
                    std::future::pending::<()>().await;
                }
            }
        };
        timeout(deadline, wait).await.map_err(|_| StreamError::Unavailable)
    }
}

async fn run_supervisor(shared: Arc<Shared>, control_plane: Arc<dyn ControlPlane>) {
    match timeout(shared.config.pre_connect_wake_deadline, control_plane.on_start()).await {
        Ok(StartOutcome::Ready) => {}
        Ok(StartOutcome::WakeRequested) => {
            debug!("control plane requested a wake before dialing; proceeding anyway");
        }
        Err(_) => {
            warn!("control plane on_start did not resolve before the wake deadline; dialing anyway");
        }
    }

    let mut backoff = Backoff::new(shared.config.reconnect_max_backoff);

    loop {
        if shared.shutting_down.load(Ordering::SeqCst) {
            let _ = shared.state_tx.send(SessionState::Stopped);
            control_plane.on_shutdown().await;
            return;
        }

        let _ = shared.state_tx.send(SessionState::Connecting);
        match dial_session(&shared).await {
            Ok(()) => {
                backoff.reset();
            }
            Err(e) => {
                warn!("tunnel dial failed: {e}");
            }
        }

        *shared.writer.lock().unwrap() = None;
        shared.registry.fail_all("Disconnected");

        if shared.shutting_down.load(Ordering::SeqCst) {
            let _ = shared.state_tx.send(SessionState::Stopped);
            control_plane.on_shutdown().await;
            return;
        }

        let delay = backoff.next_delay();
        info!("reconnecting in {:.1}s", delay.as_secs_f64());
        let _ = shared.state_tx.send(SessionState::Backoff);
        tokio::time::sleep(delay).await;
    }
}

/// Dial once, run the session to completion (reader loop), and return
/// once the session has ended for any reason.
async fn dial_session(shared: &Arc<Shared>) -> anyhow::Result<()> {
    let client_config = Arc::new(tls::build_client_config(
        &shared.config.cert_file,
        &shared.config.key_file,
        &shared.config.ca_file,
    )?);

    let tls_stream = tls::dial(&shared.config.server_host, shared.config.server_port, client_config).await?;
    info!("tunnel session established to {}:{}", shared.config.server_host, shared.config.server_port);

    let framed = Framed::new(tls_stream, EnvelopeCodec::new());
    let (mut sink, mut stream) = framed.split();

    let (writer_tx, mut writer_rx) = mpsc::channel::<Envelope>(WRITER_CHANNEL_CAPACITY);
    *shared.writer.lock().unwrap() = Some(writer_tx);
    let _ = shared.state_tx.send(SessionState::Connected);

    let writer_task = tokio::spawn(async move {
        while let Some(env) = writer_rx.recv().await {
            if let Err(e) = sink.send(env).await {
                warn!("tunnel write failed: {e}");
                break;
            }
        }
    });

    loop {
        match stream.next().await {
            Some(Ok(env)) => dispatch(shared, env).await,
            Some(Err(e)) => {
                warn!("tunnel session protocol error: {e}");
                break;
            }
            None => {
                info!("tunnel session closed by peer");
                break;
            }
        }
    }

    writer_task.abort();
    Ok(())
}

/// Dispatches one decoded envelope. `connect_*` events are delivered
/// inline rather than spawned: `StreamRegistry::send_connect_event`
/// awaits room in the CONNECT buffer, so a slow browser-side pump
/// backpressures this reader loop directly, which in turn stalls reads
/// off the mTLS socket and backpressures the Server over TCP.
async fn dispatch(shared: &Arc<Shared>, envelope: Envelope) {
    match envelope {
        Envelope::HttpResponse(resp) => {
            let id = resp.id.clone();
            shared.registry.complete_request(&id, resp)
        }
        Envelope::ConnectAck(ConnectAckPayload { id, success, error }) => {
            shared.registry.send_connect_event(&id, ConnectEvent::Ack { success, error }).await;
        }
        Envelope::ConnectData(ConnectDataPayload { id, data }) => {
            shared.registry.send_connect_event(&id, ConnectEvent::Data(data)).await;
        }
        Envelope::ConnectClose(ConnectClosePayload { id, error }) => {
            shared.registry.send_connect_event(&id, ConnectEvent::Closed { error }).await;
        }
        other @ (Envelope::HttpRequest(_) | Envelope::ConnectOpen(_)) => {
            error!("agent received a server-originated envelope type it should never see: {}", other.kind());
        }
    }
}
