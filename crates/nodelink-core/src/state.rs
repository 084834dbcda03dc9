//! Connection states and the cell that tracks them.

use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{Duration, Instant};

/// Broker-side state of one accepted connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// Accepted, waiting for the handshake.
    Initializing,
    /// Handshake done, normal traffic allowed.
    Ready,
    /// A close request is in flight.
    Closing,
    /// Terminal.
    Closed,
}

/// Node-side state of the single broker connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectorState {
    /// No broker address known.
    NotConfigured,
    /// Transport handshake in flight.
    Connecting,
    /// Transport open, protocol handshake in flight.
    Initializing,
    /// Handshake done, normal traffic allowed.
    Ready,
    /// A close request is in flight.
    Closing,
    /// Disconnected, eligible for reconnect.
    Closed,
}

impl SessionState {
    /// Name used in logs and snapshots.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "Initializing",
            Self::Ready => "Ready",
            Self::Closing => "Closing",
            Self::Closed => "Closed",
        }
    }
}

impl ConnectorState {
    /// Name used in logs and snapshots.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotConfigured => "NotConfigured",
            Self::Connecting => "Connecting",
            Self::Initializing => "Initializing",
            Self::Ready => "Ready",
            Self::Closing => "Closing",
            Self::Closed => "Closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current state plus the instant it was entered.
///
/// Observers can [`subscribe`](Self::subscribe) to follow transitions.
pub struct StateCell<S> {
    inner: Mutex<(S, Instant)>,
    tx: watch::Sender<S>,
}

impl<S> StateCell<S>
where
    S: Copy + PartialEq + Send + Sync,
{
    /// Start in `initial`, timestamped now.
    pub fn new(initial: S) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self {
            inner: Mutex::new((initial, Instant::now())),
            tx,
        }
    }

    /// Current state.
    pub fn get(&self) -> S {
        self.inner.lock().0
    }

    /// When the current state was entered.
    pub fn since(&self) -> Instant {
        self.inner.lock().1
    }

    /// How long the cell has been in its current state as of `now`.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.since())
    }

    /// Move to `next`, returning the previous state.
    ///
    /// The timestamp only moves when the state actually changes.
    pub fn set(&self, next: S) -> S {
        let mut guard = self.inner.lock();
        let prev = guard.0;
        if prev != next {
            *guard = (next, Instant::now());
            let _ = self.tx.send_replace(next);
        }
        prev
    }

    /// Move to `next` only while in `expected`.
    pub fn compare_and_set(&self, expected: S, next: S) -> bool {
        let mut guard = self.inner.lock();
        if guard.0 != expected {
            return false;
        }
        if expected != next {
            *guard = (next, Instant::now());
            let _ = self.tx.send_replace(next);
        }
        true
    }

    /// Receiver that observes every later transition.
    pub fn subscribe(&self) -> watch::Receiver<S> {
        self.tx.subscribe()
    }
}

impl<S: fmt::Debug> fmt::Debug for StateCell<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.inner.lock();
        f.debug_struct("StateCell")
            .field("state", &guard.0)
            .field("since", &guard.1)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn set_updates_timestamp_on_change_only() {
        let cell = StateCell::new(SessionState::Initializing);
        let t0 = cell.since();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cell.set(SessionState::Initializing), SessionState::Initializing);
        assert_eq!(cell.since(), t0);

        assert_eq!(cell.set(SessionState::Ready), SessionState::Initializing);
        assert_eq!(cell.get(), SessionState::Ready);
        assert_eq!(cell.since(), t0 + Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn age_grows_with_time() {
        let cell = StateCell::new(ConnectorState::NotConfigured);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cell.age(Instant::now()), Duration::from_secs(5));
    }

    #[test]
    fn compare_and_set_checks_expected() {
        let cell = StateCell::new(SessionState::Ready);
        assert!(!cell.compare_and_set(SessionState::Initializing, SessionState::Closed));
        assert_eq!(cell.get(), SessionState::Ready);
        assert!(cell.compare_and_set(SessionState::Ready, SessionState::Closing));
        assert_eq!(cell.get(), SessionState::Closing);
    }

    #[tokio::test]
    async fn subscribers_see_transitions() {
        let cell = StateCell::new(ConnectorState::Connecting);
        let mut rx = cell.subscribe();
        let _ = cell.set(ConnectorState::Initializing);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ConnectorState::Initializing);
    }

    #[test]
    fn display_names() {
        assert_eq!(SessionState::Closing.to_string(), "Closing");
        assert_eq!(ConnectorState::NotConfigured.to_string(), "NotConfigured");
    }
}
