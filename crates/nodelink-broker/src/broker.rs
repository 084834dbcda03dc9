//! The broker: accepts node connections and routes traffic between them.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use metrics::{counter, gauge};
use nodelink_core::constants::{
    DEFAULT_HANDSHAKE_GRACE, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_REQUEST_TIMEOUT, MAX_MESSAGE_SIZE,
    fields,
};
use nodelink_core::guard::call_listener;
use nodelink_core::payload::{InvokeRequest, InvokeResult, NodeInfo, Payload};
use nodelink_core::ports::{
    AllowAll, CredentialVerifier, DataQueryExecutor, InvokeRouter, NoDataStore, NoRoutes,
    StaticCredentials,
};
use nodelink_core::topics::{TopicListener, TopicListeners};
use nodelink_core::transport::{BoxSink, BoxStream};
use nodelink_core::{Envelope, MsgType, NodeError, SessionState};
use nodelink_settings::NodelinkSettings;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::registry::SessionRegistry;
use crate::session::{BrokerSession, SessionInfo};

/// Observes sessions joining and leaving.
///
/// Called from a spawned task, never from a connection's read loop. A
/// panicking listener is logged and the remaining listeners still run.
pub trait SessionListener: Send + Sync {
    /// A session finished its handshake.
    fn on_session_added(&self, _session: &Arc<BrokerSession>) {}

    /// A session was removed from the registry.
    fn on_session_closed(&self, _session: &Arc<BrokerSession>) {}
}

/// Broker timing and limits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Idle sessions are pinged after one interval and closed after three.
    pub heartbeat_interval: Duration,
    /// Deadline for the handshake and for close acknowledgement.
    pub handshake_grace: Duration,
    /// Deadline for broker-initiated requests.
    pub request_timeout: Duration,
    /// Liveness supervisor tick.
    pub check_interval: Duration,
    /// Longest a single frame write may block before the session is dropped.
    pub write_timeout: Duration,
    /// Largest accepted text frame.
    pub max_message_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            handshake_grace: DEFAULT_HANDSHAKE_GRACE,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            check_interval: DEFAULT_HEARTBEAT_INTERVAL,
            write_timeout: DEFAULT_HEARTBEAT_INTERVAL,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

impl From<&NodelinkSettings> for BrokerConfig {
    fn from(settings: &NodelinkSettings) -> Self {
        Self {
            heartbeat_interval: settings.liveness.heartbeat_interval(),
            handshake_grace: settings.liveness.handshake_grace(),
            request_timeout: settings.liveness.request_timeout(),
            check_interval: settings.liveness.check_interval(),
            write_timeout: settings.liveness.write_timeout(),
            max_message_size: settings.broker.max_message_size,
        }
    }
}

/// Builder for [`Broker`].
pub struct BrokerBuilder {
    config: BrokerConfig,
    credentials: Arc<dyn CredentialVerifier>,
    data_query: Arc<dyn DataQueryExecutor>,
    invoke_router: Arc<dyn InvokeRouter>,
}

impl BrokerBuilder {
    /// Start from `config` with permissive credentials and no collaborators.
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            credentials: Arc::new(AllowAll),
            data_query: Arc::new(NoDataStore),
            invoke_router: Arc::new(NoRoutes),
        }
    }

    /// Build config and credential table from loaded settings.
    pub fn from_settings(settings: &NodelinkSettings) -> Self {
        Self::new(BrokerConfig::from(settings)).credentials(Arc::new(StaticCredentials::new(
            settings.broker.credentials.clone(),
        )))
    }

    /// Handshake credential check.
    #[must_use]
    pub fn credentials(mut self, verifier: Arc<dyn CredentialVerifier>) -> Self {
        self.credentials = verifier;
        self
    }

    /// Executor answering `DataQueryReq`.
    #[must_use]
    pub fn data_query(mut self, executor: Arc<dyn DataQueryExecutor>) -> Self {
        self.data_query = executor;
        self
    }

    /// Router answering `ControllerInvokeReq`.
    #[must_use]
    pub fn invoke_router(mut self, router: Arc<dyn InvokeRouter>) -> Self {
        self.invoke_router = router;
        self
    }

    /// Finish.
    pub fn build(self) -> Arc<Broker> {
        Arc::new(Broker {
            config: self.config,
            registry: SessionRegistry::new(),
            topics: Arc::new(TopicListeners::new()),
            listeners: RwLock::new(Arc::new(Vec::new())),
            credentials: self.credentials,
            data_query: self.data_query,
            invoke_router: self.invoke_router,
        })
    }
}

/// Central hub every node connects to.
pub struct Broker {
    pub(crate) config: BrokerConfig,
    pub(crate) registry: SessionRegistry,
    pub(crate) topics: Arc<TopicListeners>,
    listeners: RwLock<Arc<Vec<Arc<dyn SessionListener>>>>,
    pub(crate) credentials: Arc<dyn CredentialVerifier>,
    pub(crate) data_query: Arc<dyn DataQueryExecutor>,
    pub(crate) invoke_router: Arc<dyn InvokeRouter>,
}

impl Broker {
    /// Shorthand for [`BrokerBuilder::new`].
    pub fn builder(config: BrokerConfig) -> BrokerBuilder {
        BrokerBuilder::new(config)
    }

    /// Timing and limits.
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Register a session listener.
    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) {
        let mut guard = self.listeners.write();
        let mut next = guard.as_ref().clone();
        next.push(listener);
        *guard = Arc::new(next);
    }

    // ── Connections ─────────────────────────────────────────────────

    /// Register a freshly accepted transport as a new session.
    pub fn accept(&self, sink: BoxSink, remote_addr: Option<String>) -> Arc<BrokerSession> {
        let session = Arc::new(BrokerSession::new(sink, remote_addr).with_write_timeout(self.config.write_timeout));
        self.registry.insert(Arc::clone(&session));
        counter!("node_sessions_total").increment(1);
        gauge!("node_sessions_active").increment(1.0);
        info!(
            session_id = %session.id(),
            remote_addr = session.remote_addr().unwrap_or("-"),
            "session accepted"
        );
        session
    }

    /// Read frames from `stream` until the peer leaves or the session closes.
    #[instrument(skip_all, fields(session_id = %session.id()))]
    pub async fn run_inbound(self: &Arc<Self>, session: Arc<BrokerSession>, mut stream: BoxStream) {
        let mut state_rx = session.subscribe_state();
        loop {
            let frame = tokio::select! {
                frame = stream.next_frame() => frame,
                () = async {
                    let _ = state_rx.wait_for(|s| *s == SessionState::Closed).await;
                } => break,
            };
            match frame {
                Some(Ok(text)) => self.handle_frame(&session, &text).await,
                Some(Err(error)) => {
                    warn!(%error, "transport error");
                    break;
                }
                None => {
                    debug!("transport closed by peer");
                    break;
                }
            }
            if session.is_closed() {
                break;
            }
        }
        let _ = self.close_session(&session, "transport closed").await;
    }

    /// Accept a transport and spawn its read loop.
    pub fn spawn_connection(
        self: &Arc<Self>,
        sink: BoxSink,
        stream: BoxStream,
        remote_addr: Option<String>,
    ) -> Arc<BrokerSession> {
        let session = self.accept(sink, remote_addr);
        let broker = Arc::clone(self);
        let reader = Arc::clone(&session);
        drop(tokio::spawn(async move {
            broker.run_inbound(reader, stream).await;
        }));
        session
    }

    /// Close a session exactly once.
    ///
    /// The winner removes it from the registry, schedules
    /// `on_session_closed`, releases pending requests, and only then tears
    /// down the transport. Returns `false` when the session was already closed.
    pub async fn close_session(&self, session: &Arc<BrokerSession>, reason: &str) -> bool {
        if !session.mark_closed() {
            return false;
        }
        if self.registry.remove(session.id()).is_some() {
            gauge!("node_sessions_active").decrement(1.0);
        }
        info!(
            session_id = %session.id(),
            consistent_id = session.consistent_id().as_deref().unwrap_or("-"),
            reason,
            "session closed"
        );
        let _ = session.pending().cancel_all();
        self.notify(session, |listener, s| listener.on_session_closed(s));
        session.shutdown_transport().await;
        true
    }

    /// Ask a node to close; the liveness supervisor finishes the job if it never answers.
    pub async fn request_close(&self, session: &Arc<BrokerSession>) -> Result<(), NodeError> {
        if !session.begin_closing() {
            return Err(NodeError::NotReady(session.state().to_string()));
        }
        let request = Envelope::new_request(MsgType::CloseReq, Map::new());
        if let Err(error) = session.write_frame(&request).await {
            let _ = self.close_session(session, "close request failed").await;
            return Err(error);
        }
        Ok(())
    }

    /// Close every session.
    pub async fn shutdown(&self) {
        for session in self.registry.snapshot() {
            let _ = self.close_session(&session, "broker shutdown").await;
        }
    }

    fn notify<F>(&self, session: &Arc<BrokerSession>, call: F)
    where
        F: Fn(&dyn SessionListener, &Arc<BrokerSession>) + Send + 'static,
    {
        let listeners = Arc::clone(&self.listeners.read());
        if listeners.is_empty() {
            return;
        }
        let session = Arc::clone(session);
        drop(tokio::spawn(async move {
            for listener in listeners.iter() {
                let _ = call_listener("session", || call(listener.as_ref(), &session));
            }
        }));
    }

    pub(crate) fn notify_added(&self, session: &Arc<BrokerSession>) {
        self.notify(session, |listener, s| listener.on_session_added(s));
    }

    // ── Lookup ──────────────────────────────────────────────────────

    /// Session by ephemeral id, or by consistent id as a fallback.
    pub fn session(&self, key: &str) -> Option<Arc<BrokerSession>> {
        self.registry.get(key)
    }

    /// Every live session.
    pub fn sessions(&self) -> Vec<Arc<BrokerSession>> {
        self.registry.snapshot()
    }

    /// Snapshots of every live session, ordered by ephemeral id.
    pub fn session_infos(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<_> = self.registry.snapshot().iter().map(|s| s.info()).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Number of sessions in `Ready`.
    pub fn ready_count(&self) -> usize {
        self.registry
            .snapshot()
            .iter()
            .filter(|s| s.state() == SessionState::Ready)
            .count()
    }

    // ── Topics ──────────────────────────────────────────────────────

    /// Listen locally for `topics`.
    pub fn subscribe<I, T>(&self, topics: I, listener: Arc<dyn TopicListener>) -> Vec<String>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.topics.register(topics, &listener)
    }

    /// Publish from the broker itself.
    ///
    /// Pushes to every subscribed `Ready` session, then runs local listeners
    /// on the caller's task. Returns the number of sessions reached.
    pub async fn publish(&self, topic: &str, mut fields_in: Map<String, Value>) -> usize {
        let _ = fields_in.insert(fields::TOPIC.into(), Value::String(topic.to_owned()));
        let delivered = self.fan_out(None, topic, &fields_in).await;
        let _ = self.topics.dispatch(topic, &fields_in);
        delivered
    }

    /// Push `fields_in` to every `Ready` session subscribed to `topic`, except `publisher`.
    ///
    /// Targets are written concurrently. A failed or timed-out push closes
    /// only that target.
    pub(crate) async fn fan_out(
        &self,
        publisher: Option<&Arc<BrokerSession>>,
        topic: &str,
        fields_in: &Map<String, Value>,
    ) -> usize {
        let mut push_fields = fields_in.clone();
        if let Some(consistent_id) = publisher.and_then(|p| p.consistent_id()) {
            let _ = push_fields.insert(fields::TOPIC_PUBLISHER.into(), Value::String(consistent_id));
        }
        let push = Envelope::new_push(MsgType::TopicPush, push_fields);

        let targets = self.registry.snapshot().into_iter().filter(|target| {
            !publisher.is_some_and(|p| Arc::ptr_eq(p, target))
                && target.state() == SessionState::Ready
                && target.is_subscribed(topic)
        });
        let push = &push;
        let outcomes = join_all(targets.map(|target| async move {
            match target.send(push).await {
                Ok(()) => true,
                Err(error) => {
                    counter!("node_fanout_failures_total").increment(1);
                    warn!(session_id = %target.id(), topic, %error, "topic push failed");
                    let _ = self.close_session(&target, "topic push failed").await;
                    false
                }
            }
        }))
        .await;
        let delivered = outcomes.into_iter().filter(|sent| *sent).count();
        debug!(topic, delivered, "topic fanned out");
        delivered
    }

    // ── Broker-initiated requests ───────────────────────────────────

    /// Send `request` to `session` and wait for its answer.
    ///
    /// The request timeout covers the write as well as the wait. A non-zero error code in the answer becomes [`NodeError::Remote`].
    pub async fn request(
        &self,
        session: &Arc<BrokerSession>,
        request: Envelope,
    ) -> Result<Envelope, NodeError> {
        let outcome = session
            .pending()
            .call(request.id(), self.config.request_timeout, session.send(&request))
            .await;
        match outcome {
            Ok(response) => response.into_result(),
            Err(error) => {
                if error.is_fatal_to_connection() {
                    let _ = self.close_session(session, "request send failed").await;
                }
                Err(error)
            }
        }
    }

    /// Pull a fresh attribute snapshot from `session`.
    pub async fn request_node_info(&self, session: &Arc<BrokerSession>) -> Result<Value, NodeError> {
        let response = self
            .request(session, Envelope::new_request(MsgType::NodeInfoReq, Map::new()))
            .await?;
        let info = NodeInfo::from_envelope(&response)?;
        session.set_attrs(info.attrs.clone());
        Ok(info.attrs)
    }

    /// Run the route at `path` on `session`'s node.
    pub async fn invoke(
        &self,
        session: &Arc<BrokerSession>,
        path: &str,
        params: Map<String, Value>,
    ) -> Result<Value, NodeError> {
        let fields_out = InvokeRequest {
            path: path.to_owned(),
            params,
        }
        .to_fields()?;
        let response = self
            .request(session, Envelope::new_request(MsgType::ControllerInvokeReq, fields_out))
            .await?;
        Ok(InvokeResult::from_envelope(&response)?.result)
    }
}
