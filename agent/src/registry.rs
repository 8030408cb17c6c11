//! Agent-side stream registry (spec §3 "Stream", §9 "Stream registry").
//!
//! Maps a stream id to the channel the waiting browser-side handler is
//! reading from. The registry is a `Mutex`-guarded map: inserts happen
//! on the task that allocates the id (the proxy listener), and removals
//! happen on the tunnel client's single reader/dispatch task, matching
//! the "registry removes the stream on terminal state" ownership rule
//! in spec §3, invariant 7.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::{mpsc, oneshot};
use tunnel_proto::HttpResponsePayload;

/// Events delivered to a CONNECT stream's owning task as envelopes
/// arrive from the tunnel.
#[derive(Debug, Clone)]
pub enum ConnectEvent {
    Ack { success: bool, error: Option<String> },
    Data(Vec<u8>),
    Closed { error: Option<String> },
}

enum StreamHandle {
    Request(oneshot::Sender<HttpResponsePayload>),
    Connect(mpsc::Sender<ConnectEvent>),
}

#[derive(Default)]
pub struct StreamRegistry {
    streams: Mutex<HashMap<String, StreamHandle>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_request(&self, id: String) -> oneshot::Receiver<HttpResponsePayload> {
        let (tx, rx) = oneshot::channel();
        self.streams.lock().unwrap().insert(id, StreamHandle::Request(tx));
        rx
    }

    pub fn register_connect(&self, id: String, buffer: usize) -> mpsc::Receiver<ConnectEvent> {
        let (tx, rx) = mpsc::channel(buffer);
        self.streams.lock().unwrap().insert(id, StreamHandle::Connect(tx));
        rx
    }

    pub fn remove(&self, id: &str) {
        self.streams.lock().unwrap().remove(id);
    }

    pub fn len(&self) -> usize {
        self.streams.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver a decoded `http_response` to the waiting request task.
    /// Per spec §3 invariant 2, a second response for the same id is
    /// dropped (the oneshot has already been consumed, or was never
    /// registered).
    pub fn complete_request(&self, id: &str, response: HttpResponsePayload) {
        let handle = self.streams.lock().unwrap().remove(id);
        match handle {
            Some(StreamHandle::Request(tx)) => {
                let _ = tx.send(response);
            }
            Some(other) => {
                // Wrong stream kind for this id: put it back and let the
                // caller's protocol-violation path handle it.
                self.streams.lock().unwrap().insert(id.to_string(), other);
            }
            None => {}
        }
    }

    /// Deliver a CONNECT-stream event; unlike `complete_request` this
    /// does not remove the stream (a stream may receive many data
    /// events before it terminates). If the browser-side pump is slow
    /// and the buffer is full, this awaits room so the tunnel reader
    /// task blocks rather than dropping bytes — the backpressure then
    /// propagates to the Server over the mTLS connection itself.
    pub async fn send_connect_event(&self, id: &str, event: ConnectEvent) -> bool {
        let tx = {
            let streams = self.streams.lock().unwrap();
            match streams.get(id) {
                Some(StreamHandle::Connect(tx)) => Some(tx.clone()),
                _ => None,
            }
        };
        match tx {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Fail every stream currently registered (spec §3: "on session
    /// teardown, every non-terminal stream is failed").
    pub fn fail_all(&self, reason: &str) {
        let mut streams = self.streams.lock().unwrap();
        for (_, handle) in streams.drain() {
            match handle {
                StreamHandle::Request(tx) => {
                    let _ = tx.send(HttpResponsePayload::error("", reason));
                }
                StreamHandle::Connect(tx) => {
                    let _ = tx.try_send(ConnectEvent::Closed {
                        error: Some(reason.to_string()),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_stream_delivers_exactly_one_response() {
        let registry = StreamRegistry::new();
        let rx = registry.register_request("id-1".to_string());
        registry.complete_request("id-1", HttpResponsePayload {
            id: "id-1".to_string(),
            status_code: 200,
            ..Default::default()
        });
        let resp = rx.await.unwrap();
        assert_eq!(resp.status_code, 200);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn duplicate_response_for_same_id_is_dropped() {
        let registry = StreamRegistry::new();
        registry.complete_request("unregistered", HttpResponsePayload::default());
        // no panic, no-op
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn connect_events_are_delivered_in_order() {
        let registry = StreamRegistry::new();
        let mut rx = registry.register_connect("c-1".to_string(), 8);
        assert!(registry.send_connect_event("c-1", ConnectEvent::Data(vec![1, 2, 3])).await);
        assert!(registry.send_connect_event("c-1", ConnectEvent::Data(vec![4, 5])).await);
        match rx.recv().await.unwrap() {
            ConnectEvent::Data(d) => assert_eq!(d, vec![1, 2, 3]),
            _ => panic!("expected data"),
        }
        match rx.recv().await.unwrap() {
            ConnectEvent::Data(d) => assert_eq!(d, vec![4, 5]),
            _ => panic!("expected data"),
        }
    }

    #[tokio::test]
    async fn send_connect_event_blocks_until_the_reader_makes_room() {
        use std::sync::Arc;

        let registry = Arc::new(StreamRegistry::new());
        let mut rx = registry.register_connect("c-1".to_string(), 1);
        assert!(registry.send_connect_event("c-1", ConnectEvent::Data(vec![1])).await);

        let registry2 = Arc::clone(&registry);
        let blocked = tokio::spawn(async move {
            registry2.send_connect_event("c-1", ConnectEvent::Data(vec![2])).await
        });

        tokio::task::yield_now().await;
        assert!(!blocked.is_finished());

        rx.recv().await.unwrap();
        assert!(blocked.await.unwrap());
    }

    #[tokio::test]
    async fn fail_all_resolves_pending_requests_with_error() {
        let registry = StreamRegistry::new();
        let rx = registry.register_request("id-1".to_string());
        registry.fail_all("Disconnected");
        let resp = rx.await.unwrap();
        assert_eq!(resp.error.as_deref(), Some("Disconnected"));
    }
}
