//! Server-side stream registry (spec §4.5, §3 "Stream").
//!
//! Same `Mutex`-guarded map design as the agent's registry, but each
//! entry additionally tracks the stream's lifecycle state since the
//! server is the side that owns execution (HTTP request or CONNECT
//! relay) rather than just correlation.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::connect_relay::FromSession;

/// Lifecycle of one stream as seen by the server (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// `http_request` accepted, executor task spawned, no response yet.
    Pending,
    /// `connect_open` accepted, dial in flight, no `connect_ack` yet.
    Opening,
    /// CONNECT dial succeeded; pumps are running.
    Established,
}

enum Entry {
    Http,
    Connect {
        state: StreamState,
        /// Channel into the relay task, present once `Established`.
        to_origin: Option<mpsc::Sender<FromSession>>,
    },
}

#[derive(Default)]
pub struct ServerRegistry {
    streams: Mutex<HashMap<String, Entry>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_http(&self, id: String) {
        self.streams.lock().unwrap().insert(id, Entry::Http);
    }

    pub fn register_connect_opening(&self, id: String) {
        self.streams.lock().unwrap().insert(
            id,
            Entry::Connect {
                state: StreamState::Opening,
                to_origin: None,
            },
        );
    }

    /// Transition a CONNECT entry to `Established` and attach the
    /// channel that feeds the relay's origin-write pump. Returns `false`
    /// if the id is gone (relay already torn down) or not a CONNECT
    /// entry.
    pub fn mark_established(&self, id: &str, to_origin: mpsc::Sender<FromSession>) -> bool {
        let mut streams = self.streams.lock().unwrap();
        match streams.get_mut(id) {
            Some(Entry::Connect { state, to_origin: slot }) => {
                *state = StreamState::Established;
                *slot = Some(to_origin);
                true
            }
            _ => false,
        }
    }

    pub fn state_of(&self, id: &str) -> Option<StreamState> {
        match self.streams.lock().unwrap().get(id)? {
            Entry::Http => None,
            Entry::Connect { state, .. } => Some(*state),
        }
    }

    /// Forward a `connect_data` chunk to the relay. Per spec §4.5: only
    /// valid once `Established`; otherwise this is a protocol violation
    /// the caller logs and drops. If the relay's inbound channel is full
    /// this awaits room, so a slow origin write pump backpressures the
    /// session reader directly (spec §4.5, §4.7).
    pub async fn forward_data(&self, id: &str, data: Vec<u8>) -> Result<(), ForwardError> {
        self.forward(id, FromSession::Data(data)).await
    }

    /// Signal a `connect_close` half-close to the relay.
    pub async fn forward_close(&self, id: &str) -> Result<(), ForwardError> {
        self.forward(id, FromSession::Close).await
    }

    async fn forward(&self, id: &str, event: FromSession) -> Result<(), ForwardError> {
        let sender = {
            let streams = self.streams.lock().unwrap();
            match streams.get(id) {
                Some(Entry::Connect { state: StreamState::Established, to_origin: Some(tx) }) => tx.clone(),
                Some(Entry::Connect { .. }) => return Err(ForwardError::NotEstablished),
                _ => return Err(ForwardError::UnknownStream),
            }
        };
        sender.send(event).await.map_err(|_| ForwardError::RelayGone)
    }

    pub fn remove(&self, id: &str) {
        self.streams.lock().unwrap().remove(id);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.streams.lock().unwrap().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.streams.lock().unwrap().len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardError {
    /// Protocol violation: no such stream was ever opened.
    UnknownStream,
    /// Protocol violation: `connect_data`/`connect_close` arrived before
    /// the matching `connect_ack` established the relay.
    NotEstablished,
    /// Benign teardown race: the relay task already exited and dropped
    /// its receiver (e.g. the origin connection closed first).
    RelayGone,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn http_entries_are_not_forwardable() {
        let reg = ServerRegistry::new();
        reg.register_http("h-1".to_string());
        assert_eq!(reg.forward_data("h-1", vec![1]).await, Err(ForwardError::UnknownStream));
    }

    #[tokio::test]
    async fn connect_data_before_established_is_rejected() {
        let reg = ServerRegistry::new();
        reg.register_connect_opening("c-1".to_string());
        assert_eq!(reg.state_of("c-1"), Some(StreamState::Opening));
        assert_eq!(reg.forward_data("c-1", vec![1]).await, Err(ForwardError::NotEstablished));
    }

    #[tokio::test]
    async fn established_forwards_data_to_relay_channel() {
        let reg = ServerRegistry::new();
        reg.register_connect_opening("c-1".to_string());
        let (tx, mut rx) = mpsc::channel(4);
        assert!(reg.mark_established("c-1", tx));
        assert_eq!(reg.state_of("c-1"), Some(StreamState::Established));
        reg.forward_data("c-1", vec![9, 9]).await.unwrap();
        match rx.recv().await.unwrap() {
            FromSession::Data(d) => assert_eq!(d, vec![9, 9]),
            FromSession::Close => panic!("expected data"),
        }
    }

    #[tokio::test]
    async fn close_is_forwarded_as_an_event() {
        let reg = ServerRegistry::new();
        reg.register_connect_opening("c-1".to_string());
        let (tx, mut rx) = mpsc::channel(4);
        reg.mark_established("c-1", tx);
        reg.forward_close("c-1").await.unwrap();
        assert!(matches!(rx.recv().await.unwrap(), FromSession::Close));
    }

    #[tokio::test]
    async fn forward_blocks_until_the_relay_makes_room() {
        let reg = ServerRegistry::new();
        reg.register_connect_opening("c-1".to_string());
        let (tx, mut rx) = mpsc::channel(1);
        reg.mark_established("c-1", tx);
        reg.forward_data("c-1", vec![1]).await.unwrap();

        let reg = Arc::new(reg);
        let reg2 = Arc::clone(&reg);
        let blocked = tokio::spawn(async move { reg2.forward_data("c-1", vec![2]).await });

        tokio::task::yield_now().await;
        assert!(!blocked.is_finished());

        rx.recv().await.unwrap();
        blocked.await.unwrap().unwrap();
    }

    #[test]
    fn removed_stream_is_no_longer_present() {
        let reg = ServerRegistry::new();
        reg.register_http("h-1".to_string());
        reg.remove("h-1");
        assert!(!reg.contains("h-1"));
        assert_eq!(reg.len(), 0);
    }
}
