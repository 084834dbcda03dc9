//! The node's single outbound connection to the broker.
//!
//! Every successful dial starts a new *generation*. Readers and late dial
//! results from an older generation are ignored, so a reconnect never sees
//! traffic or teardown from the connection it replaced.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nodelink_core::constants::{
    DEFAULT_HANDSHAKE_GRACE, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_RECONNECT_BACKOFF,
    DEFAULT_REQUEST_TIMEOUT, fields,
};
use nodelink_core::guard::call_listener;
use nodelink_core::payload::{DataQuery, DataQueryResult, InitRequest, NodeType, Payload, TopicSubscription};
use nodelink_core::pending::PendingRequests;
use nodelink_core::ports::{AttributeProvider, InvokeRouter, NoRoutes, StaticAttributes};
use nodelink_core::topics::{TopicListener, TopicListeners};
use nodelink_core::transport::{BoxSink, BoxStream, TransportError, close_within};
use nodelink_core::{ConnectorState, Envelope, MsgType, NodeError, StateCell};
use nodelink_settings::NodelinkSettings;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

// ── Configuration ───────────────────────────────────────────────────

/// Identity and timing of one connector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectorConfig {
    /// Stable identity presented on every connection.
    pub consistent_id: String,
    /// Declared node kind.
    pub node_type: NodeType,
    /// Handshake user.
    pub user: Option<String>,
    /// Handshake credential.
    pub credential: Option<String>,
    /// The broker is considered gone after three intervals of silence.
    pub heartbeat_interval: Duration,
    /// How long a close request waits for its answer.
    pub handshake_grace: Duration,
    /// Wait before redialling a closed connection.
    pub reconnect_backoff: Duration,
    /// Deadline for requests sent to the broker.
    pub request_timeout: Duration,
    /// Liveness supervisor tick.
    pub check_interval: Duration,
    /// Longest a single frame write may block before the connection is dropped.
    pub write_timeout: Duration,
}

impl ConnectorConfig {
    /// Defaults for `consistent_id`.
    pub fn new(consistent_id: impl Into<String>) -> Self {
        Self {
            consistent_id: consistent_id.into(),
            node_type: NodeType::default(),
            user: None,
            credential: None,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            handshake_grace: DEFAULT_HANDSHAKE_GRACE,
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            check_interval: DEFAULT_HEARTBEAT_INTERVAL,
            write_timeout: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }

    /// Build from loaded settings. `suffix` names the process when no consistent id is set.
    pub fn from_settings(settings: &NodelinkSettings, suffix: &str) -> Self {
        Self {
            consistent_id: settings.node.resolve_consistent_id(suffix),
            node_type: settings.node.node_type,
            user: settings.node.user.clone(),
            credential: settings.node.credential.clone(),
            heartbeat_interval: settings.liveness.heartbeat_interval(),
            handshake_grace: settings.liveness.handshake_grace(),
            reconnect_backoff: settings.liveness.reconnect_backoff(),
            request_timeout: settings.liveness.request_timeout(),
            check_interval: settings.liveness.check_interval(),
            write_timeout: settings.liveness.write_timeout(),
        }
    }
}

// ── Seams ───────────────────────────────────────────────────────────

/// Where and as whom to dial.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DialTarget {
    /// Broker URL.
    pub url: String,
    /// Basic-auth user.
    pub user: Option<String>,
    /// Basic-auth credential.
    pub credential: Option<String>,
}

/// Opens transports to the broker.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Open one connection.
    async fn dial(&self, target: &DialTarget) -> Result<(BoxSink, BoxStream), TransportError>;
}

/// Observes connector state transitions.
///
/// Called on the task that caused the transition, in order. Must not block.
/// A panic is logged and does not stop later listeners.
pub trait ConnectorListener: Send + Sync {
    /// The state moved from `old` to `new`.
    fn on_state_changed(&self, old: ConnectorState, new: ConnectorState);
}

impl<F> ConnectorListener for F
where
    F: Fn(ConnectorState, ConnectorState) + Send + Sync,
{
    fn on_state_changed(&self, old: ConnectorState, new: ConnectorState) {
        self(old, new);
    }
}

// ── Builder ─────────────────────────────────────────────────────────

/// Builder for [`NodeConnector`].
pub struct NodeConnectorBuilder {
    config: ConnectorConfig,
    dialer: Arc<dyn Dialer>,
    broker_url: Option<String>,
    attributes: Arc<dyn AttributeProvider>,
    invoke_router: Arc<dyn InvokeRouter>,
}

impl NodeConnectorBuilder {
    /// Broker address. Without one the connector stays `NotConfigured`.
    #[must_use]
    pub fn broker_url(mut self, url: impl Into<String>) -> Self {
        self.broker_url = Some(url.into()).filter(|u: &String| !u.trim().is_empty());
        self
    }

    /// Source of the attribute snapshot sent at handshake and on `NodeInfoReq`.
    #[must_use]
    pub fn attributes(mut self, provider: Arc<dyn AttributeProvider>) -> Self {
        self.attributes = provider;
        self
    }

    /// Router answering `ControllerInvokeReq` from the broker.
    #[must_use]
    pub fn invoke_router(mut self, router: Arc<dyn InvokeRouter>) -> Self {
        self.invoke_router = router;
        self
    }

    /// Finish.
    pub fn build(self) -> Arc<NodeConnector> {
        let now = Instant::now();
        Arc::new(NodeConnector {
            config: self.config,
            dialer: self.dialer,
            state: StateCell::new(ConnectorState::NotConfigured),
            state_changed_at: Mutex::new(Utc::now()),
            broker_url: RwLock::new(self.broker_url),
            node_id: RwLock::new(None),
            sink: tokio::sync::Mutex::new(None),
            generation: AtomicU64::new(0),
            connection: Mutex::new(CancellationToken::new()),
            last_recv: Mutex::new(now),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            connects: AtomicU64::new(0),
            pending: PendingRequests::new(),
            topics: Arc::new(TopicListeners::new()),
            listeners: RwLock::new(Arc::new(Vec::new())),
            attributes: self.attributes,
            invoke_router: self.invoke_router,
            stopped: AtomicBool::new(false),
        })
    }
}

// ── Connector ───────────────────────────────────────────────────────

/// Client side of the control plane.
pub struct NodeConnector {
    pub(crate) config: ConnectorConfig,
    dialer: Arc<dyn Dialer>,
    state: StateCell<ConnectorState>,
    state_changed_at: Mutex<DateTime<Utc>>,
    broker_url: RwLock<Option<String>>,
    node_id: RwLock<Option<String>>,
    sink: tokio::sync::Mutex<Option<BoxSink>>,
    generation: AtomicU64,
    connection: Mutex<CancellationToken>,
    last_recv: Mutex<Instant>,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    connects: AtomicU64,
    pub(crate) pending: PendingRequests,
    pub(crate) topics: Arc<TopicListeners>,
    listeners: RwLock<Arc<Vec<Arc<dyn ConnectorListener>>>>,
    pub(crate) attributes: Arc<dyn AttributeProvider>,
    pub(crate) invoke_router: Arc<dyn InvokeRouter>,
    stopped: AtomicBool,
}

impl NodeConnector {
    /// Start building a connector that dials through `dialer`.
    pub fn builder(config: ConnectorConfig, dialer: Arc<dyn Dialer>) -> NodeConnectorBuilder {
        NodeConnectorBuilder {
            config,
            dialer,
            broker_url: None,
            attributes: Arc::new(StaticAttributes(Value::Null)),
            invoke_router: Arc::new(NoRoutes),
        }
    }

    /// Identity and timing.
    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    /// Current state.
    pub fn state(&self) -> ConnectorState {
        self.state.get()
    }

    /// How long the connector has been in its current state.
    pub fn state_age(&self, now: Instant) -> Duration {
        self.state.age(now)
    }

    /// Time since the last inbound frame.
    pub fn idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_recv.lock())
    }

    /// Id the broker assigned to the current connection.
    pub fn node_id(&self) -> Option<String> {
        self.node_id.read().clone()
    }

    /// Configured broker address.
    pub fn broker_url(&self) -> Option<String> {
        self.broker_url.read().clone()
    }

    /// Replace the broker address. Takes effect on the next dial.
    pub fn set_broker_url(&self, url: Option<String>) {
        *self.broker_url.write() = url.filter(|u| !u.trim().is_empty());
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Register a state listener.
    pub fn add_listener(&self, listener: Arc<dyn ConnectorListener>) {
        let mut guard = self.listeners.write();
        let mut next = guard.as_ref().clone();
        next.push(listener);
        *guard = Arc::new(next);
    }

    /// Wait until the connector reaches `target`.
    pub async fn wait_for_state(&self, target: ConnectorState, timeout: Duration) -> bool {
        let mut rx = self.state.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == target))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    fn announce(&self, old: ConnectorState, new: ConnectorState) {
        *self.state_changed_at.lock() = Utc::now();
        debug!(from = %old, to = %new, "connector state changed");
        let listeners = Arc::clone(&self.listeners.read());
        for listener in listeners.iter() {
            let _ = call_listener("connector", || listener.on_state_changed(old, new));
        }
    }

    pub(crate) fn transition(&self, next: ConnectorState) -> ConnectorState {
        let prev = self.state.set(next);
        if prev != next {
            self.announce(prev, next);
        }
        prev
    }

    pub(crate) fn transition_from(&self, expected: ConnectorState, next: ConnectorState) -> bool {
        let moved = self.state.compare_and_set(expected, next);
        if moved && expected != next {
            self.announce(expected, next);
        }
        moved
    }

    pub(crate) fn mark_received(&self) {
        *self.last_recv.lock() = Instant::now();
        let _ = self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_node_id(&self, node_id: Option<String>) {
        *self.node_id.write() = node_id;
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Dial if a broker address is configured.
    pub async fn start(self: &Arc<Self>) -> Result<(), NodeError> {
        self.stopped.store(false, Ordering::Release);
        if self.broker_url().is_none() {
            info!("no broker configured, staying offline");
            return Err(NodeError::NotConfigured);
        }
        self.connect().await
    }

    /// Open a new connection and send the handshake.
    ///
    /// A no-op while a connection is already being set up or in use.
    #[instrument(skip_all, fields(consistent_id = %self.config.consistent_id))]
    pub async fn connect(self: &Arc<Self>) -> Result<(), NodeError> {
        let Some(url) = self.broker_url() else {
            let _ = self.transition(ConnectorState::NotConfigured);
            return Err(NodeError::NotConfigured);
        };
        let prev = self.state();
        if !matches!(prev, ConnectorState::NotConfigured | ConnectorState::Closed)
            || !self.transition_from(prev, ConnectorState::Connecting)
        {
            debug!(state = %prev, "connect skipped");
            return Ok(());
        }
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let target = DialTarget {
            url: url.clone(),
            user: self.config.user.clone(),
            credential: self.config.credential.clone(),
        };

        let (mut sink, stream) = match self.dialer.dial(&target).await {
            Ok(halves) => halves,
            Err(error) => {
                if self.generation.load(Ordering::Acquire) == generation {
                    let _ = self.transition_from(ConnectorState::Connecting, ConnectorState::Closed);
                }
                warn!(%url, %error, "broker dial failed");
                return Err(NodeError::Connect(error));
            }
        };

        let token = {
            let mut guard = self.sink.lock().await;
            if self.generation.load(Ordering::Acquire) != generation {
                drop(guard);
                let _ = sink.close().await;
                debug!("discarding connection from a superseded dial");
                return Err(NodeError::ConnectionClosed);
            }
            *guard = Some(sink);
            let token = CancellationToken::new();
            *self.connection.lock() = token.clone();
            token
        };
        *self.last_recv.lock() = Instant::now();
        if !self.transition_from(ConnectorState::Connecting, ConnectorState::Initializing) {
            return Err(NodeError::ConnectionClosed);
        }

        let reader = Arc::clone(self);
        drop(tokio::spawn(async move {
            reader.run_reader(generation, stream, token).await;
        }));

        let init = InitRequest {
            consistent_id: self.config.consistent_id.clone(),
            node_type: self.config.node_type,
            user: self.config.user.clone(),
            credential: self.config.credential.clone(),
            attrs: self.attributes.node_attributes().await,
        };
        let request = Envelope::new_request(MsgType::InitReq, init.to_fields()?);
        if let Err(error) = self.write_frame(&request).await {
            self.force_close("handshake send failed").await;
            return Err(error);
        }
        let _ = self.connects.fetch_add(1, Ordering::Relaxed);
        info!(%url, "connected, handshake sent");
        Ok(())
    }

    async fn run_reader(self: Arc<Self>, generation: u64, mut stream: BoxStream, token: CancellationToken) {
        loop {
            let frame = tokio::select! {
                () = token.cancelled() => return,
                frame = stream.next_frame() => frame,
            };
            match frame {
                Some(Ok(text)) => self.handle_frame(&text).await,
                Some(Err(error)) => {
                    warn!(%error, "broker transport error");
                    break;
                }
                None => {
                    debug!("broker closed the transport");
                    break;
                }
            }
        }
        if self.generation.load(Ordering::Acquire) == generation {
            self.force_close("transport closed").await;
        }
    }

    /// Drop the current connection immediately.
    ///
    /// Idempotent. Outstanding requests fail with [`NodeError::ConnectionClosed`].
    pub async fn force_close(&self, reason: &str) {
        let _ = self.generation.fetch_add(1, Ordering::AcqRel);
        self.connection.lock().cancel();
        let limit = self.config.write_timeout;
        let sink = match tokio::time::timeout(limit, self.sink.lock()).await {
            Ok(mut guard) => guard.take(),
            Err(_) => {
                debug!("transport busy, dropping without close");
                None
            }
        };
        let had_connection = sink.is_some();
        if let Some(mut sink) = sink {
            if let Err(error) = close_within(sink.as_mut(), limit).await {
                debug!(%error, "transport close failed");
            }
        }
        let cancelled = self.pending.cancel_all();
        self.set_node_id(None);
        let prev = self.transition(ConnectorState::Closed);
        if had_connection || prev != ConnectorState::Closed {
            info!(reason, cancelled, "disconnected from broker");
        }
    }

    /// Close politely and stop reconnecting.
    ///
    /// Sends `CloseReq` when `Ready` and waits up to the handshake grace for the answer.
    pub async fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        if self.transition_from(ConnectorState::Ready, ConnectorState::Closing) {
            let request = Envelope::new_request(MsgType::CloseReq, Map::new());
            let answer = self
                .pending
                .call(request.id(), self.config.handshake_grace, self.write_frame(&request))
                .await;
            if let Err(error) = answer {
                debug!(%error, "close not acknowledged");
            }
        }
        self.force_close("shutdown").await;
    }

    // ── Sending ─────────────────────────────────────────────────────

    /// Write regardless of state.
    pub(crate) async fn write_frame(&self, envelope: &Envelope) -> Result<(), NodeError> {
        let text = envelope.to_json()?;
        let limit = self.config.write_timeout;
        let write = async {
            let mut guard = self.sink.lock().await;
            let sink = guard.as_mut().ok_or(NodeError::ConnectionClosed)?;
            sink.send_text(text).await.map_err(NodeError::from)
        };
        tokio::time::timeout(limit, write)
            .await
            .map_err(|_| NodeError::SendFailure(TransportError::WriteTimeout(limit)))??;
        let _ = self.frames_sent.fetch_add(1, Ordering::Relaxed);
        debug!(msg_type = %envelope.msg_type(), id = envelope.id(), "frame sent");
        Ok(())
    }

    /// Send while `Ready`; any other state fails with [`NodeError::NotReady`].
    pub async fn send(&self, envelope: &Envelope) -> Result<(), NodeError> {
        let state = self.state();
        if state != ConnectorState::Ready {
            return Err(NodeError::NotReady(state.to_string()));
        }
        match self.write_frame(envelope).await {
            Err(error) if error.is_fatal_to_connection() => {
                self.force_close("send failed").await;
                Err(error)
            }
            other => other,
        }
    }

    /// Send `request` and wait for its answer.
    ///
    /// `timeout` defaults to the configured request timeout and covers the
    /// write as well as the wait. A non-zero error code in the answer becomes
    /// [`NodeError::Remote`].
    pub async fn request(&self, request: Envelope, timeout: Option<Duration>) -> Result<Envelope, NodeError> {
        let limit = timeout.unwrap_or(self.config.request_timeout);
        match self.pending.call(request.id(), limit, self.send(&request)).await {
            Ok(response) => response.into_result(),
            Err(error @ NodeError::SendFailure(_)) => {
                self.force_close("request send failed").await;
                Err(error)
            }
            Err(error) => Err(error),
        }
    }

    // ── Topics ──────────────────────────────────────────────────────

    /// Listen for `topics`. When `Ready`, the broker is sent the full topic set.
    ///
    /// The set is also re-sent after every reconnect. Returns the full set.
    pub async fn topic_sub<I, T>(&self, topics: I, listener: Arc<dyn TopicListener>) -> Result<Vec<String>, NodeError>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let all = self.topics.register(topics, &listener);
        if self.state() == ConnectorState::Ready {
            self.send_subscription(all.clone()).await?;
        }
        Ok(all)
    }

    pub(crate) async fn send_subscription(&self, topics: Vec<String>) -> Result<(), NodeError> {
        let count = topics.len();
        let request = Envelope::new_request(MsgType::TopicSubReq, TopicSubscription { topics }.to_fields()?);
        let _ = self.request(request, None).await?;
        debug!(count, "topic subscription sent");
        Ok(())
    }

    /// Publish through the broker, then deliver to local listeners.
    pub async fn topic_pub(&self, topic: &str, mut payload: Map<String, Value>) -> Result<(), NodeError> {
        let _ = payload.insert(fields::TOPIC.into(), Value::String(topic.to_owned()));
        let request = Envelope::new_request(MsgType::TopicPubReq, payload.clone());
        let _ = self.request(request, None).await?;
        let _ = self.topics.dispatch(topic, &payload);
        Ok(())
    }

    /// Topics with a local listener.
    pub fn topics(&self) -> Vec<String> {
        self.topics.topics()
    }

    // ── Queries ─────────────────────────────────────────────────────

    /// Fetch a dataset from the broker's store.
    pub async fn query_data(
        &self,
        instrument: &str,
        dataset_kind: &str,
        trading_day: Option<&str>,
    ) -> Result<String, NodeError> {
        let query = DataQuery {
            exchangeable: instrument.to_owned(),
            data_info: dataset_kind.to_owned(),
            trading_day: trading_day.map(str::to_owned),
        };
        let response = self
            .request(Envelope::new_request(MsgType::DataQueryReq, query.to_fields()?), None)
            .await?;
        Ok(DataQueryResult::from_envelope(&response)?.data)
    }

    /// Serializable snapshot.
    pub fn info(&self) -> ConnectorInfo {
        ConnectorInfo {
            state: self.state(),
            state_time: *self.state_changed_at.lock(),
            broker_url: self.broker_url(),
            consistent_id: self.config.consistent_id.clone(),
            node_id: self.node_id(),
            topics: self.topics(),
            idle_ms: u64::try_from(self.idle(Instant::now()).as_millis()).unwrap_or(u64::MAX),
            connects: self.connects.load(Ordering::Relaxed),
            total_messages_sent: self.frames_sent.load(Ordering::Relaxed),
            total_messages_recv: self.frames_received.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for NodeConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeConnector")
            .field("consistent_id", &self.config.consistent_id)
            .field("state", &self.state())
            .field("node_id", &self.node_id())
            .finish_non_exhaustive()
    }
}

/// JSON view of the connector.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorInfo {
    /// Current state.
    pub state: ConnectorState,
    /// When the current state was entered.
    pub state_time: DateTime<Utc>,
    /// Configured broker address.
    pub broker_url: Option<String>,
    /// Identity presented at handshake.
    pub consistent_id: String,
    /// Id assigned by the broker, while connected.
    pub node_id: Option<String>,
    /// Topics with a local listener.
    pub topics: Vec<String>,
    /// Milliseconds since the last inbound frame.
    pub idle_ms: u64,
    /// Successful dials so far.
    pub connects: u64,
    /// Frames written.
    pub total_messages_sent: u64,
    /// Frames read.
    pub total_messages_recv: u64,
}
