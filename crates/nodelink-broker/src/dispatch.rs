//! Inbound frame handling on the broker.

use std::sync::Arc;

use metrics::counter;
use nodelink_core::answer;
use nodelink_core::constants::fields;
use nodelink_core::errors::{ERR_BAD_REQUEST, ERR_UNAUTHORIZED};
use nodelink_core::payload::{InitRequest, InitResponse, NodeInfo, Payload, TopicSubscription};
use nodelink_core::{Envelope, EnvelopeError, MsgType, NodeError, SessionState};
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::session::{BrokerSession, NodeIdentity};

impl Broker {
    /// Route one inbound text frame.
    pub(crate) async fn handle_frame(self: &Arc<Self>, session: &Arc<BrokerSession>, text: &str) {
        session.mark_received();
        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(EnvelopeError::UnknownType(name)) => {
                warn!(session_id = %session.id(), msg_type = %name, "unknown message type");
                let _ = self.close_session(session, "unknown message type").await;
                return;
            }
            Err(error) => {
                counter!("node_frames_dropped_total").increment(1);
                warn!(session_id = %session.id(), %error, "dropping malformed frame");
                return;
            }
        };
        debug!(
            session_id = %session.id(),
            msg_type = %envelope.msg_type(),
            id = envelope.id(),
            "frame received"
        );

        if let Err(error) = self.route(session, envelope).await {
            if error.is_fatal_to_connection() {
                warn!(session_id = %session.id(), %error, "closing session");
                let _ = self.close_session(session, error.code()).await;
            } else {
                debug!(session_id = %session.id(), %error, "frame not handled");
            }
        }
    }

    async fn route(self: &Arc<Self>, session: &Arc<BrokerSession>, envelope: Envelope) -> Result<(), NodeError> {
        match envelope.msg_type() {
            MsgType::CloseReq => {
                let _ = session.set_state(SessionState::Closing);
                let response = Envelope::derive_response(&envelope)?;
                if let Err(error) = session.write_frame(&response).await {
                    debug!(session_id = %session.id(), %error, "close response not delivered");
                }
                let _ = self.close_session(session, "closed by node").await;
                return Ok(());
            }
            MsgType::CloseResp => {
                let _ = session.pending().fulfill(envelope);
                let _ = self.close_session(session, "close acknowledged").await;
                return Ok(());
            }
            _ => {}
        }

        match session.state() {
            SessionState::Initializing => {
                if envelope.msg_type() == MsgType::InitReq {
                    self.handshake(session, &envelope).await
                } else {
                    Err(NodeError::ProtocolViolation(format!(
                        "{} before handshake",
                        envelope.msg_type()
                    )))
                }
            }
            SessionState::Ready => self.route_ready(session, envelope).await,
            SessionState::Closing | SessionState::Closed => {
                debug!(
                    session_id = %session.id(),
                    msg_type = %envelope.msg_type(),
                    "ignoring frame on closing session"
                );
                Ok(())
            }
        }
    }

    async fn handshake(self: &Arc<Self>, session: &Arc<BrokerSession>, request: &Envelope) -> Result<(), NodeError> {
        let init = match InitRequest::from_envelope(request) {
            Ok(init) if !init.consistent_id.is_empty() => init,
            Ok(_) => return self.reject(session, request, ERR_BAD_REQUEST, "missing nodeConsistentId").await,
            Err(error) => return self.reject(session, request, ERR_BAD_REQUEST, &error.to_string()).await,
        };
        if !self.credentials.verify(init.user.as_deref(), init.credential.as_deref()) {
            return self.reject(session, request, ERR_UNAUTHORIZED, "invalid credential").await;
        }

        session.complete_handshake(
            NodeIdentity {
                consistent_id: init.consistent_id.clone(),
                node_type: init.node_type,
            },
            init.attrs,
        );
        let response = answer::attach(
            Envelope::derive_response(request)?,
            &InitResponse {
                node_id: session.id().to_string(),
            },
        )?;
        session.send(&response).await?;
        info!(
            session_id = %session.id(),
            consistent_id = %init.consistent_id,
            node_type = ?init.node_type,
            "node ready"
        );
        self.notify_added(session);
        Ok(())
    }

    async fn reject(
        &self,
        session: &Arc<BrokerSession>,
        request: &Envelope,
        code: i32,
        message: &str,
    ) -> Result<(), NodeError> {
        warn!(session_id = %session.id(), code, message, "handshake rejected");
        let response = Envelope::derive_response(request)?.with_error(code, message);
        if let Err(error) = session.write_frame(&response).await {
            debug!(session_id = %session.id(), %error, "rejection not delivered");
        }
        let _ = self.close_session(session, "handshake rejected").await;
        Ok(())
    }

    async fn route_ready(self: &Arc<Self>, session: &Arc<BrokerSession>, envelope: Envelope) -> Result<(), NodeError> {
        match envelope.msg_type() {
            MsgType::PingReq => session.send(&Envelope::derive_response(&envelope)?).await,
            MsgType::PingResp => {
                debug!(session_id = %session.id(), "heartbeat answered");
                Ok(())
            }
            MsgType::TopicSubReq => {
                let response = match TopicSubscription::from_envelope(&envelope) {
                    Ok(sub) => {
                        session.replace_topics(sub.topics);
                        debug!(session_id = %session.id(), topics = ?session.topics(), "topics replaced");
                        Envelope::derive_response(&envelope)?
                    }
                    Err(error) => Envelope::derive_response(&envelope)?.with_error(ERR_BAD_REQUEST, error.to_string()),
                };
                session.send(&response).await
            }
            MsgType::TopicPubReq => self.publish_from(session, envelope).await,
            MsgType::NodeInfoResp => {
                if let Ok(info) = NodeInfo::from_envelope(&envelope) {
                    if !envelope.is_error() {
                        session.set_attrs(info.attrs);
                    }
                }
                self.fulfill(session, envelope);
                Ok(())
            }
            MsgType::DataQueryReq => {
                self.spawn_data_query(session, envelope);
                Ok(())
            }
            MsgType::ControllerInvokeReq => {
                self.spawn_invoke(session, envelope);
                Ok(())
            }
            MsgType::InitReq => Err(NodeError::ProtocolViolation("repeated handshake".into())),
            MsgType::TopicPush | MsgType::NodeInfoReq => Err(NodeError::ProtocolViolation(format!(
                "{} is not accepted from a node",
                envelope.msg_type()
            ))),
            t if t.is_response() => {
                self.fulfill(session, envelope);
                Ok(())
            }
            other => {
                debug!(session_id = %session.id(), msg_type = %other, "unhandled message");
                Ok(())
            }
        }
    }

    fn fulfill(&self, session: &Arc<BrokerSession>, envelope: Envelope) {
        if let Err(orphan) = session.pending().fulfill(envelope) {
            debug!(
                session_id = %session.id(),
                msg_type = %orphan.msg_type(),
                req_id = orphan.req_id(),
                "response without a waiting request"
            );
        }
    }

    async fn publish_from(self: &Arc<Self>, session: &Arc<BrokerSession>, envelope: Envelope) -> Result<(), NodeError> {
        let Some(topic) = envelope.field_str(fields::TOPIC).map(str::to_owned) else {
            let response = Envelope::derive_response(&envelope)?.with_error(ERR_BAD_REQUEST, "missing topic");
            return session.send(&response).await;
        };
        let response = Envelope::derive_response(&envelope)?;
        let payload = envelope.into_fields();

        let _ = self.fan_out(Some(session), &topic, &payload).await;

        let topics = Arc::clone(&self.topics);
        drop(tokio::spawn(async move {
            let _ = topics.dispatch(&topic, &payload);
        }));

        session.send(&response).await
    }

    fn spawn_data_query(self: &Arc<Self>, session: &Arc<BrokerSession>, request: Envelope) {
        let broker = Arc::clone(self);
        let session = Arc::clone(session);
        drop(tokio::spawn(async move {
            match answer::data_query(broker.data_query.as_ref(), &request).await {
                Ok(response) => broker.reply(&session, &response).await,
                Err(error) => warn!(session_id = %session.id(), %error, "data query response not built"),
            }
        }));
    }

    fn spawn_invoke(self: &Arc<Self>, session: &Arc<BrokerSession>, request: Envelope) {
        let broker = Arc::clone(self);
        let session = Arc::clone(session);
        drop(tokio::spawn(async move {
            match answer::invoke(broker.invoke_router.as_ref(), &request).await {
                Ok(response) => broker.reply(&session, &response).await,
                Err(error) => warn!(session_id = %session.id(), %error, "invoke response not built"),
            }
        }));
    }

    async fn reply(&self, session: &Arc<BrokerSession>, response: &Envelope) {
        if let Err(error) = session.send(response).await {
            warn!(session_id = %session.id(), %error, "response not delivered");
            if error.is_fatal_to_connection() {
                let _ = self.close_session(session, "response send failed").await;
            }
        }
    }
}
