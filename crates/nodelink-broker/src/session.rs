//! One accepted node connection, as seen by the broker.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use nodelink_core::payload::NodeType;
use nodelink_core::pending::PendingRequests;
use nodelink_core::constants::DEFAULT_HEARTBEAT_INTERVAL;
use nodelink_core::transport::{BoxSink, TransportError, close_within};
use nodelink_core::{Envelope, NodeError, SessionId, SessionState, StateCell};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::{Duration, Instant};
use tracing::debug;

/// Identity a node declared in its handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeIdentity {
    /// Stable id across reconnects.
    pub consistent_id: String,
    /// Declared kind.
    pub node_type: NodeType,
}

/// Per-connection state on the broker.
///
/// Writes go through one async mutex around the sink, so a fan-out push and a
/// direct response never interleave on the same connection. Waiting for the
/// mutex and the write itself are bounded by the write timeout.
pub struct BrokerSession {
    id: SessionId,
    remote_addr: Option<String>,
    created_at: DateTime<Utc>,
    state: StateCell<SessionState>,
    state_changed_at: Mutex<DateTime<Utc>>,
    identity: RwLock<Option<NodeIdentity>>,
    topics: RwLock<BTreeSet<String>>,
    attrs: RwLock<Value>,
    last_recv: Mutex<Instant>,
    last_sent: Mutex<Instant>,
    frames_received: AtomicU64,
    frames_sent: AtomicU64,
    closed: AtomicBool,
    pending: PendingRequests,
    write_timeout: Duration,
    sink: tokio::sync::Mutex<Option<BoxSink>>,
}

impl BrokerSession {
    /// Wrap a freshly accepted transport. Starts in `Initializing`.
    pub fn new(sink: BoxSink, remote_addr: Option<String>) -> Self {
        let now = Instant::now();
        Self {
            id: SessionId::new(),
            remote_addr,
            created_at: Utc::now(),
            state: StateCell::new(SessionState::Initializing),
            state_changed_at: Mutex::new(Utc::now()),
            identity: RwLock::new(None),
            topics: RwLock::new(BTreeSet::new()),
            attrs: RwLock::new(Value::Null),
            last_recv: Mutex::new(now),
            last_sent: Mutex::new(now),
            frames_received: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            pending: PendingRequests::new(),
            write_timeout: DEFAULT_HEARTBEAT_INTERVAL,
            sink: tokio::sync::Mutex::new(Some(sink)),
        }
    }

    /// Bound every frame write to `limit`.
    #[must_use]
    pub fn with_write_timeout(mut self, limit: Duration) -> Self {
        self.write_timeout = limit;
        self
    }

    /// Ephemeral id.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Peer address as reported by the transport or a proxy header.
    pub fn remote_addr(&self) -> Option<&str> {
        self.remote_addr.as_deref()
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Receiver that observes state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// How long the session has been in its current state.
    pub fn state_age(&self, now: Instant) -> Duration {
        self.state.age(now)
    }

    /// Time since the last inbound frame.
    pub fn idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_recv.lock())
    }

    /// Move to `next`, returning the previous state.
    pub fn set_state(&self, next: SessionState) -> SessionState {
        let prev = self.state.set(next);
        if prev != next {
            *self.state_changed_at.lock() = Utc::now();
            debug!(session_id = %self.id, from = %prev, to = %next, "session state changed");
        }
        prev
    }

    /// Move `Ready` to `Closing`. Fails from any other state.
    pub fn begin_closing(&self) -> bool {
        let moved = self
            .state
            .compare_and_set(SessionState::Ready, SessionState::Closing);
        if moved {
            *self.state_changed_at.lock() = Utc::now();
        }
        moved
    }

    /// Consistent id, once the handshake completed.
    pub fn consistent_id(&self) -> Option<String> {
        self.identity.read().as_ref().map(|i| i.consistent_id.clone())
    }

    /// Declared node type, once the handshake completed.
    pub fn node_type(&self) -> Option<NodeType> {
        self.identity.read().as_ref().map(|i| i.node_type)
    }

    /// Record the handshake and move to `Ready`.
    pub(crate) fn complete_handshake(&self, identity: NodeIdentity, attrs: Value) {
        *self.identity.write() = Some(identity);
        *self.attrs.write() = attrs;
        let _ = self.set_state(SessionState::Ready);
    }

    /// Sorted topic set.
    pub fn topics(&self) -> Vec<String> {
        self.topics.read().iter().cloned().collect()
    }

    /// Replace the topic set wholesale.
    pub fn replace_topics<I: IntoIterator<Item = String>>(&self, topics: I) {
        *self.topics.write() = topics.into_iter().collect();
    }

    /// Whether pushes for `topic` should reach this session.
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.topics.read().contains(topic)
    }

    /// Last attribute snapshot.
    pub fn attrs(&self) -> Value {
        self.attrs.read().clone()
    }

    /// Store a new attribute snapshot.
    pub fn set_attrs(&self, attrs: Value) {
        *self.attrs.write() = attrs;
    }

    /// Broker-initiated requests awaiting an answer from this node.
    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    /// Note an inbound frame.
    pub fn mark_received(&self) {
        *self.last_recv.lock() = Instant::now();
        let _ = self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Send while `Ready`; any other state fails with [`NodeError::NotReady`].
    pub async fn send(&self, envelope: &Envelope) -> Result<(), NodeError> {
        let state = self.state();
        if state != SessionState::Ready {
            return Err(NodeError::NotReady(state.to_string()));
        }
        self.write_frame(envelope).await
    }

    /// Write regardless of state. Used for handshake rejections and close replies.
    pub async fn write_frame(&self, envelope: &Envelope) -> Result<(), NodeError> {
        let text = envelope.to_json()?;
        let write = async {
            let mut guard = self.sink.lock().await;
            let sink = guard.as_mut().ok_or(NodeError::ConnectionClosed)?;
            sink.send_text(text).await.map_err(NodeError::from)
        };
        tokio::time::timeout(self.write_timeout, write)
            .await
            .map_err(|_| NodeError::SendFailure(TransportError::WriteTimeout(self.write_timeout)))??;
        *self.last_sent.lock() = Instant::now();
        let _ = self.frames_sent.fetch_add(1, Ordering::Relaxed);
        debug!(session_id = %self.id, msg_type = %envelope.msg_type(), id = envelope.id(), "frame sent");
        Ok(())
    }

    /// Flip the closed flag. Only the first caller gets `true`.
    pub(crate) fn mark_closed(&self) -> bool {
        let first = self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        let _ = self.set_state(SessionState::Closed);
        first
    }

    /// Whether the session has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close and drop the transport.
    pub(crate) async fn shutdown_transport(&self) {
        let Ok(mut guard) = tokio::time::timeout(self.write_timeout, self.sink.lock()).await else {
            debug!(session_id = %self.id, "transport busy, dropping without close");
            return;
        };
        let sink = guard.take();
        drop(guard);
        if let Some(mut sink) = sink {
            if let Err(error) = close_within(sink.as_mut(), self.write_timeout).await {
                debug!(session_id = %self.id, %error, "transport close failed");
            }
        }
    }

    /// Serializable snapshot.
    pub fn info(&self) -> SessionInfo {
        let identity = self.identity.read().clone();
        SessionInfo {
            id: self.id.to_string(),
            consistent_id: identity.as_ref().map(|i| i.consistent_id.clone()),
            node_type: identity.map(|i| i.node_type),
            state: self.state(),
            state_time: *self.state_changed_at.lock(),
            attrs: self.attrs(),
            topics: self.topics(),
            remote_addr: self.remote_addr.clone(),
            creation_time: self.created_at,
            idle_ms: u64::try_from(self.idle(Instant::now()).as_millis()).unwrap_or(u64::MAX),
            total_messages_sent: self.frames_sent.load(Ordering::Relaxed),
            total_messages_recv: self.frames_received.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for BrokerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerSession")
            .field("id", &self.id)
            .field("consistent_id", &self.consistent_id())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// JSON view of a session for the HTTP API.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// Ephemeral id.
    pub id: String,
    /// Consistent id, absent before the handshake.
    pub consistent_id: Option<String>,
    /// Declared node type.
    #[serde(rename = "type")]
    pub node_type: Option<NodeType>,
    /// Current state.
    pub state: SessionState,
    /// When the current state was entered.
    pub state_time: DateTime<Utc>,
    /// Last attribute snapshot.
    pub attrs: Value,
    /// Subscribed topics.
    pub topics: Vec<String>,
    /// Peer address.
    pub remote_addr: Option<String>,
    /// When the connection was accepted.
    pub creation_time: DateTime<Utc>,
    /// Milliseconds since the last inbound frame.
    pub idle_ms: u64,
    /// Frames written.
    pub total_messages_sent: u64,
    /// Frames read.
    pub total_messages_recv: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use nodelink_core::envelope::MsgType;
    use nodelink_core::transport::memory::{self, MemoryStream};
    use nodelink_core::transport::FrameStream;
    use serde_json::{Map, json};

    fn session() -> (BrokerSession, MemoryStream) {
        let (local, remote) = memory::pair();
        (
            BrokerSession::new(Box::new(local.sink), Some("10.0.0.5".into())),
            remote.stream,
        )
    }

    fn identity() -> NodeIdentity {
        NodeIdentity {
            consistent_id: "N1".into(),
            node_type: NodeType::Trader,
        }
    }

    #[test]
    fn starts_initializing() {
        let (s, _rx) = session();
        assert_eq!(s.state(), SessionState::Initializing);
        assert!(s.consistent_id().is_none());
        assert!(!s.is_closed());
        assert_eq!(s.remote_addr(), Some("10.0.0.5"));
    }

    #[tokio::test]
    async fn send_requires_ready() {
        let (s, _rx) = session();
        let env = Envelope::new_request(MsgType::PingReq, Map::new());
        assert_matches!(s.send(&env).await, Err(NodeError::NotReady(state)) if state == "Initializing");
    }

    #[tokio::test]
    async fn write_frame_ignores_state() {
        let (s, mut rx) = session();
        let env = Envelope::new_request(MsgType::CloseReq, Map::new());
        s.write_frame(&env).await.unwrap();
        let text = rx.next_frame().await.unwrap().unwrap();
        assert_eq!(Envelope::parse(&text).unwrap().msg_type(), MsgType::CloseReq);
        assert_eq!(s.info().total_messages_sent, 1);
    }

    #[tokio::test]
    async fn handshake_enables_send() {
        let (s, mut rx) = session();
        s.complete_handshake(identity(), json!({"os": "linux"}));
        assert_eq!(s.state(), SessionState::Ready);
        assert_eq!(s.consistent_id().as_deref(), Some("N1"));
        assert_eq!(s.attrs()["os"], "linux");

        s.send(&Envelope::new_request(MsgType::PingReq, Map::new()))
            .await
            .unwrap();
        assert!(rx.next_frame().await.is_some());
    }

    #[test]
    fn topics_are_replaced_not_merged() {
        let (s, _rx) = session();
        s.replace_topics(["/a".to_owned(), "/b".to_owned()]);
        s.replace_topics(["/c".to_owned()]);
        assert_eq!(s.topics(), vec!["/c"]);
        assert!(s.is_subscribed("/c"));
        assert!(!s.is_subscribed("/a"));
    }

    #[test]
    fn mark_closed_once() {
        let (s, _rx) = session();
        assert!(s.mark_closed());
        assert!(!s.mark_closed());
        assert_eq!(s.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn shutdown_transport_ends_peer_stream() {
        let (s, mut rx) = session();
        s.shutdown_transport().await;
        assert!(rx.next_frame().await.is_none());
        let env = Envelope::new_request(MsgType::PingReq, Map::new());
        assert_matches!(s.write_frame(&env).await, Err(NodeError::ConnectionClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_write_fails_after_write_timeout() {
        let (local, _remote) = memory::pair();
        let limit = Duration::from_secs(4);
        let s = BrokerSession::new(Box::new(local.sink.stall_after(0)), None).with_write_timeout(limit);
        let env = Envelope::new_request(MsgType::PingReq, Map::new());

        let start = Instant::now();
        let err = s.write_frame(&env).await.unwrap_err();
        assert_matches!(err, NodeError::SendFailure(TransportError::WriteTimeout(d)) if d == limit);
        assert!(start.elapsed() >= limit);

        // Teardown is bounded too, even though close never completes.
        let start = Instant::now();
        s.shutdown_transport().await;
        assert!(start.elapsed() <= limit);
        assert_matches!(s.write_frame(&env).await, Err(NodeError::ConnectionClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_resets_on_receive() {
        let (s, _rx) = session();
        tokio::time::advance(Duration::from_secs(15)).await;
        assert_eq!(s.idle(Instant::now()), Duration::from_secs(15));
        s.mark_received();
        assert_eq!(s.idle(Instant::now()), Duration::ZERO);
    }

    #[test]
    fn info_serializes_camel_case() {
        let (s, _rx) = session();
        s.complete_handshake(identity(), Value::Null);
        let value = serde_json::to_value(s.info()).unwrap();
        assert_eq!(value["consistentId"], "N1");
        assert_eq!(value["type"], "Trader");
        assert_eq!(value["state"], "Ready");
        assert_eq!(value["remoteAddr"], "10.0.0.5");
        assert!(value["totalMessagesRecv"].is_number());
    }
}
