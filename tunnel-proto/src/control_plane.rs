//! External control plane interface (spec §4.8).
//!
//! This is deliberately thin: the core tunnel never depends on a real
//! control plane being wired up. `NoopControlPlane` is what both `agent`
//! and `server` run against when no cloud lifecycle integration is
//! configured.

use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Ready,
    WakeRequested,
}

#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Called by the Agent before its first dial attempt. The reconnect
    /// supervisor delays dialing until this resolves (or its own
    /// `pre_connect_wake_deadline` elapses).
    async fn on_start(&self) -> StartOutcome {
        StartOutcome::Ready
    }

    /// Called by the Agent after the last session closes, or at process
    /// shutdown.
    async fn on_shutdown(&self) {}

    /// Called periodically by the Server while it has at least one
    /// active session, or on an idle heartbeat.
    async fn emit_activity(&self, _active_sessions: usize, _last_activity_epoch_seconds: u64) {}
}

/// The default: every hook is a no-op, `on_start` always reports ready.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopControlPlane;

#[async_trait]
impl ControlPlane for NoopControlPlane {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_control_plane_is_always_ready() {
        let cp = NoopControlPlane;
        assert_eq!(cp.on_start().await, StartOutcome::Ready);
        cp.on_shutdown().await;
        cp.emit_activity(3, 12345).await;
    }
}
