//! Inbound frame handling on the node.

use std::sync::Arc;

use nodelink_core::answer;
use nodelink_core::constants::fields;
use nodelink_core::payload::{InitResponse, Payload};
use nodelink_core::{ConnectorState, Envelope, EnvelopeError, MsgType, NodeError};
use tracing::{debug, info, warn};

use crate::connector::NodeConnector;

impl NodeConnector {
    /// Route one inbound text frame.
    pub(crate) async fn handle_frame(self: &Arc<Self>, text: &str) {
        self.mark_received();
        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(%error, "dropping frame from broker");
                return;
            }
        };
        debug!(msg_type = %envelope.msg_type(), id = envelope.id(), "frame received");

        let state = self.state();
        match envelope.msg_type() {
            MsgType::PingReq => {
                if let Err(error) = self.respond(&envelope).await {
                    debug!(%error, "heartbeat not answered");
                }
            }
            MsgType::InitResp if state == ConnectorState::Initializing => self.on_init_response(envelope).await,
            MsgType::CloseReq => {
                let _ = self.transition(ConnectorState::Closing);
                match Envelope::derive_response(&envelope) {
                    Ok(response) => {
                        if let Err(error) = self.write_frame(&response).await {
                            debug!(%error, "close response not delivered");
                        }
                    }
                    Err(error) => debug!(%error, "close response not built"),
                }
                self.force_close("closed by broker").await;
            }
            MsgType::CloseResp => {
                self.fulfill(envelope);
                self.force_close("close acknowledged").await;
            }
            MsgType::TopicPush if state == ConnectorState::Ready => {
                let Some(topic) = envelope.field_str(fields::TOPIC).map(str::to_owned) else {
                    warn!("topic push without a topic");
                    return;
                };
                let topics = Arc::clone(&self.topics);
                let payload = envelope.into_fields();
                drop(tokio::spawn(async move {
                    let _ = topics.dispatch(&topic, &payload);
                }));
            }
            MsgType::NodeInfoReq if state == ConnectorState::Ready => {
                let connector = Arc::clone(self);
                drop(tokio::spawn(async move {
                    let response = answer::node_info(connector.attributes.as_ref(), &envelope).await;
                    connector.reply(response).await;
                }));
            }
            MsgType::ControllerInvokeReq if state == ConnectorState::Ready => {
                let connector = Arc::clone(self);
                drop(tokio::spawn(async move {
                    let response = answer::invoke(connector.invoke_router.as_ref(), &envelope).await;
                    connector.reply(response).await;
                }));
            }
            t if t.is_response() => self.fulfill(envelope),
            other => warn!(msg_type = %other, state = %state, "ignoring unexpected message"),
        }
    }

    async fn on_init_response(self: &Arc<Self>, envelope: Envelope) {
        if envelope.is_error() {
            let error = NodeError::HandshakeRejected {
                code: envelope.error_code(),
                message: envelope.error_msg().unwrap_or_default().to_owned(),
            };
            warn!(%error, "broker refused the handshake");
            self.force_close("handshake rejected").await;
            return;
        }
        let node_id = InitResponse::from_envelope(&envelope).ok().map(|r| r.node_id);
        self.set_node_id(node_id.clone());
        if !self.transition_from(ConnectorState::Initializing, ConnectorState::Ready) {
            return;
        }
        info!(node_id = node_id.as_deref().unwrap_or("-"), "node ready");

        let topics = self.topics();
        if !topics.is_empty() {
            let connector = Arc::clone(self);
            drop(tokio::spawn(async move {
                if let Err(error) = connector.send_subscription(topics).await {
                    warn!(%error, "re-subscribe failed");
                }
            }));
        }
    }

    async fn respond(&self, request: &Envelope) -> Result<(), NodeError> {
        self.send(&Envelope::derive_response(request)?).await
    }

    async fn reply(&self, response: Result<Envelope, EnvelopeError>) {
        match response {
            Ok(response) => {
                if let Err(error) = self.send(&response).await {
                    warn!(%error, "response not delivered");
                }
            }
            Err(error) => warn!(%error, "response not built"),
        }
    }

    fn fulfill(&self, envelope: Envelope) {
        if let Err(orphan) = self.pending.fulfill(envelope) {
            debug!(
                msg_type = %orphan.msg_type(),
                req_id = orphan.req_id(),
                "response without a waiting request"
            );
        }
    }
}
