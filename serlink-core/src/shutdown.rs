//! Cooperative stop signals.
//!
//! Two scopes need one: the session-wide signal shared by the bridge loop,
//! the forwarder listeners, and the process signal handlers, and a per-flow
//! signal that ties the two directions of a stream proxy together. Each is
//! a [`StopSignal`] parameterized with its own cause type, so a flow cannot
//! be handed a session-level cause or vice versa.
//!
//! A signal latches the first cause it is given; replays are ignored, and
//! any number of tasks may await it before or after the fact.

use std::sync::Arc;
use tokio::sync::watch;

/// Why a session is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The operator asked the process to stop.
    Operator,
    /// The bridge is tearing the link down.
    LinkDown,
}

/// Why a flow's proxy pair must stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowEnd {
    /// The TCP connection left the data-transfer states or was reset.
    ConnectionClosed,
    /// The native socket failed mid-stream.
    ServiceFailed,
    /// The whole session is going away.
    SessionClosing,
}

/// The session-scope signal.
pub type SessionShutdown = StopSignal<SessionEnd>;

/// The flow-scope signal.
pub type FlowShutdown = StopSignal<FlowEnd>;

/// A latched stop signal carrying its cause.
///
/// Backed by a watch channel whose value flips from `None` to `Some(cause)`
/// exactly once. Waiters subscribe on demand, so a handle that never waits
/// costs nothing beyond the shared sender.
#[derive(Debug)]
pub struct StopSignal<C> {
    tx: Arc<watch::Sender<Option<C>>>,
}

impl<C: Copy> StopSignal<C> {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Raise the signal. The first cause is latched; later calls change
    /// nothing.
    pub fn raise(&self, cause: C) {
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(cause);
                true
            } else {
                false
            }
        });
    }

    /// The latched cause, if the signal has been raised.
    pub fn cause(&self) -> Option<C> {
        *self.tx.borrow()
    }

    pub fn is_raised(&self) -> bool {
        self.cause().is_some()
    }

    /// Wait until the signal is raised. Resolves immediately if it already
    /// has been.
    pub async fn stopped(&self) -> C {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(cause) = *rx.borrow_and_update() {
                return cause;
            }
            // Cannot fail: `self` keeps the sender alive while we wait.
            let _ = rx.changed().await;
        }
    }
}

impl<C> Clone for StopSignal<C> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<C: Copy> Default for StopSignal<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn the_first_cause_is_latched() {
        let flow = FlowShutdown::new();
        assert!(!flow.is_raised());
        flow.raise(FlowEnd::ServiceFailed);
        flow.raise(FlowEnd::ConnectionClosed);
        assert_eq!(flow.cause(), Some(FlowEnd::ServiceFailed));
        // A waiter arriving after the fact resolves immediately with the
        // original cause.
        assert_eq!(flow.stopped().await, FlowEnd::ServiceFailed);
    }

    #[tokio::test]
    async fn a_pending_waiter_wakes_when_raised() {
        let session = SessionShutdown::new();
        let observer = session.clone();
        let waiter = tokio::spawn(async move { observer.stopped().await });
        tokio::task::yield_now().await;
        assert!(!session.is_raised());
        session.raise(SessionEnd::Operator);
        assert_eq!(waiter.await.unwrap(), SessionEnd::Operator);
    }

    #[tokio::test]
    async fn flow_and_session_scopes_are_independent() {
        let session = SessionShutdown::new();
        let flow = FlowShutdown::new();
        flow.raise(FlowEnd::ConnectionClosed);
        assert!(!session.is_raised());
        session.raise(SessionEnd::LinkDown);
        assert_eq!(session.stopped().await, SessionEnd::LinkDown);
        assert_eq!(flow.stopped().await, FlowEnd::ConnectionClosed);
    }
}
