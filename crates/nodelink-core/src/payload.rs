//! Typed views over envelope payloads.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::envelope::Envelope;
use crate::errors::EnvelopeError;

/// A payload shape that converts to and from envelope fields.
pub trait Payload: Serialize + DeserializeOwned {
    /// Decode from the fields of `envelope`.
    fn from_envelope(envelope: &Envelope) -> Result<Self, EnvelopeError> {
        serde_json::from_value(Value::Object(envelope.fields().clone())).map_err(|e| {
            EnvelopeError::Malformed(format!("{} payload: {e}", envelope.msg_type()))
        })
    }

    /// Encode as envelope fields.
    fn to_fields(&self) -> Result<Map<String, Value>, EnvelopeError> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(EnvelopeError::Malformed(format!(
                "payload must encode as an object, got {other}"
            ))),
        }
    }
}

/// Declared kind of a node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    /// A trading process.
    #[default]
    Trader,
    /// Any other client (tools, dashboards).
    GenericClient,
}

/// `InitReq` payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {
    /// Stable identity across reconnects.
    #[serde(rename = "nodeConsistentId")]
    pub consistent_id: String,
    /// Declared kind.
    #[serde(default)]
    pub node_type: NodeType,
    /// Handshake user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Handshake credential.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    /// Attribute snapshot at connect time.
    #[serde(rename = "nodeAttrs", default)]
    pub attrs: Value,
}

impl Payload for InitRequest {}

/// `InitResp` payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitResponse {
    /// Ephemeral id the broker assigned to the connection.
    pub node_id: String,
}

impl Payload for InitResponse {}

/// `TopicSubReq` payload. Always the full topic set.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TopicSubscription {
    /// Topics the sender wants pushed to it.
    #[serde(default)]
    pub topics: Vec<String>,
}

impl Payload for TopicSubscription {}

/// `DataQueryReq` payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataQuery {
    /// Instrument identifier.
    pub exchangeable: String,
    /// Dataset kind.
    pub data_info: String,
    /// Trading day, `None` for the current one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trading_day: Option<String>,
}

impl Payload for DataQuery {}

/// `DataQueryResp` payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataQueryResult {
    /// Raw dataset content.
    #[serde(default)]
    pub data: String,
}

impl Payload for DataQueryResult {}

/// `ControllerInvokeReq` payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvokeRequest {
    /// Route to run.
    pub path: String,
    /// Remaining request fields, handed to the router.
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl Payload for InvokeRequest {}

/// `ControllerInvokeResp` payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvokeResult {
    /// Route output.
    #[serde(default)]
    pub result: Value,
}

impl Payload for InvokeResult {}

/// `NodeInfoResp` payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Attribute snapshot.
    #[serde(rename = "nodeAttrs", default)]
    pub attrs: Value,
}

impl Payload for NodeInfo {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MsgType;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn envelope(t: MsgType, value: Value) -> Envelope {
        let Value::Object(fields) = value else {
            panic!("object expected")
        };
        Envelope::new_request(t, fields)
    }

    #[test]
    fn init_request_from_wire_names() {
        let env = envelope(
            MsgType::InitReq,
            json!({"nodeConsistentId": "N1", "credential": "x", "nodeType": "GenericClient", "nodeAttrs": {"os": "linux"}}),
        );
        let init = InitRequest::from_envelope(&env).unwrap();
        assert_eq!(init.consistent_id, "N1");
        assert_eq!(init.node_type, NodeType::GenericClient);
        assert_eq!(init.user, None);
        assert_eq!(init.credential.as_deref(), Some("x"));
        assert_eq!(init.attrs["os"], "linux");
    }

    #[test]
    fn init_request_requires_consistent_id() {
        let env = envelope(MsgType::InitReq, json!({"credential": "x"}));
        assert_matches!(InitRequest::from_envelope(&env), Err(EnvelopeError::Malformed(m)) if m.contains("InitReq"));
    }

    #[test]
    fn init_request_to_fields_skips_missing_user() {
        let init = InitRequest {
            consistent_id: "N1".into(),
            node_type: NodeType::Trader,
            user: None,
            credential: Some("x".into()),
            attrs: Value::Null,
        };
        let fields = init.to_fields().unwrap();
        assert_eq!(fields["nodeConsistentId"], "N1");
        assert_eq!(fields["nodeType"], "Trader");
        assert!(!fields.contains_key("user"));
    }

    #[test]
    fn subscription_defaults_to_empty() {
        let env = envelope(MsgType::TopicSubReq, json!({}));
        assert!(TopicSubscription::from_envelope(&env).unwrap().topics.is_empty());
    }

    #[test]
    fn invoke_request_keeps_extra_fields() {
        let env = envelope(MsgType::ControllerInvokeReq, json!({"path": "/api/x", "a": 1}));
        let req = InvokeRequest::from_envelope(&env).unwrap();
        assert_eq!(req.path, "/api/x");
        assert_eq!(req.params["a"], 1);
    }

    #[test]
    fn data_query_wire_names() {
        let q = DataQuery {
            exchangeable: "shfe.ru2501".into(),
            data_info: "min1".into(),
            trading_day: Some("20250102".into()),
        };
        let fields = q.to_fields().unwrap();
        assert_eq!(fields["dataInfo"], "min1");
        assert_eq!(fields["tradingDay"], "20250102");
    }
}
