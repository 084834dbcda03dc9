//! The wire envelope exchanged between broker and nodes.
//!
//! Every frame is one JSON object. Six header keys (`type`, `id`, `reqId`,
//! `corrId`, `errorCode`, `errorMsg`) sit next to the payload fields at the
//! top level:
//!
//! ```json
//! {"type":"TopicPubReq","id":7,"reqId":0,"corrId":0,"errorCode":0,"topic":"/a/b","x":1}
//! ```
//!
//! Ids come from a single process-wide counter that only the constructors in
//! this module touch. Parsed envelopes keep the id chosen by the peer.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

use crate::constants::{PUSH_SUFFIX, REQ_SUFFIX, RESP_SUFFIX, is_reserved_key};
use crate::errors::{EnvelopeError, NodeError};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

// ── Verbs ───────────────────────────────────────────────────────────

/// Every verb the protocol knows about.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MsgType {
    /// Handshake request.
    InitReq,
    /// Handshake response.
    InitResp,
    /// Heartbeat request.
    PingReq,
    /// Heartbeat response.
    PingResp,
    /// Close request.
    CloseReq,
    /// Close response.
    CloseResp,
    /// Attribute pull request.
    NodeInfoReq,
    /// Attribute snapshot response.
    NodeInfoResp,
    /// Remote invoke request.
    ControllerInvokeReq,
    /// Remote invoke response.
    ControllerInvokeResp,
    /// Topic subscribe request.
    TopicSubReq,
    /// Topic subscribe response.
    TopicSubResp,
    /// Topic publish request.
    TopicPubReq,
    /// Topic publish response.
    TopicPubResp,
    /// Topic broadcast, never answered.
    TopicPush,
    /// Data query request.
    DataQueryReq,
    /// Data query response.
    DataQueryResp,
}

impl MsgType {
    /// All verbs, requests before their responses.
    pub const ALL: [Self; 17] = [
        Self::InitReq,
        Self::InitResp,
        Self::PingReq,
        Self::PingResp,
        Self::CloseReq,
        Self::CloseResp,
        Self::NodeInfoReq,
        Self::NodeInfoResp,
        Self::ControllerInvokeReq,
        Self::ControllerInvokeResp,
        Self::TopicSubReq,
        Self::TopicSubResp,
        Self::TopicPubReq,
        Self::TopicPubResp,
        Self::TopicPush,
        Self::DataQueryReq,
        Self::DataQueryResp,
    ];

    /// Wire name of the verb.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InitReq => "InitReq",
            Self::InitResp => "InitResp",
            Self::PingReq => "PingReq",
            Self::PingResp => "PingResp",
            Self::CloseReq => "CloseReq",
            Self::CloseResp => "CloseResp",
            Self::NodeInfoReq => "NodeInfoReq",
            Self::NodeInfoResp => "NodeInfoResp",
            Self::ControllerInvokeReq => "ControllerInvokeReq",
            Self::ControllerInvokeResp => "ControllerInvokeResp",
            Self::TopicSubReq => "TopicSubReq",
            Self::TopicSubResp => "TopicSubResp",
            Self::TopicPubReq => "TopicPubReq",
            Self::TopicPubResp => "TopicPubResp",
            Self::TopicPush => "TopicPush",
            Self::DataQueryReq => "DataQueryReq",
            Self::DataQueryResp => "DataQueryResp",
        }
    }

    /// The response verb paired with a request verb.
    pub fn response_type(self) -> Option<Self> {
        match self {
            Self::InitReq => Some(Self::InitResp),
            Self::PingReq => Some(Self::PingResp),
            Self::CloseReq => Some(Self::CloseResp),
            Self::NodeInfoReq => Some(Self::NodeInfoResp),
            Self::ControllerInvokeReq => Some(Self::ControllerInvokeResp),
            Self::TopicSubReq => Some(Self::TopicSubResp),
            Self::TopicPubReq => Some(Self::TopicPubResp),
            Self::DataQueryReq => Some(Self::DataQueryResp),
            _ => None,
        }
    }

    /// Whether the verb is a request.
    pub fn is_request(self) -> bool {
        self.as_str().ends_with(REQ_SUFFIX)
    }

    /// Whether the verb answers a request.
    pub fn is_response(self) -> bool {
        self.as_str().ends_with(RESP_SUFFIX)
    }

    /// Whether the verb is a fire-and-forget broadcast.
    pub fn is_push(self) -> bool {
        self.as_str().ends_with(PUSH_SUFFIX)
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MsgType {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| EnvelopeError::UnknownType(s.to_owned()))
    }
}

// ── Envelope ────────────────────────────────────────────────────────

/// One message unit on the wire.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    msg_type: MsgType,
    id: u64,
    req_id: u64,
    corr_id: u64,
    error_code: i32,
    error_msg: Option<String>,
    fields: Map<String, Value>,
}

impl Envelope {
    fn with_id(msg_type: MsgType, mut fields: Map<String, Value>) -> Self {
        fields.retain(|k, _| !is_reserved_key(k));
        Self {
            msg_type,
            id: next_id(),
            req_id: 0,
            corr_id: 0,
            error_code: 0,
            error_msg: None,
            fields,
        }
    }

    /// Build a new request (or any unsolicited message) with a fresh id.
    ///
    /// Header keys present in `fields` are dropped.
    pub fn new_request(msg_type: MsgType, fields: Map<String, Value>) -> Self {
        Self::with_id(msg_type, fields)
    }

    /// Build a new broadcast with a fresh id.
    pub fn new_push(msg_type: MsgType, fields: Map<String, Value>) -> Self {
        Self::with_id(msg_type, fields)
    }

    /// Derive the response to `request`.
    ///
    /// The response gets a fresh id, `reqId` set to the request id and the
    /// request's correlation id, or the request id when none was set.
    pub fn derive_response(request: &Self) -> Result<Self, EnvelopeError> {
        let response_type = request
            .msg_type
            .response_type()
            .ok_or(EnvelopeError::NotARequestType(request.msg_type))?;
        let mut response = Self::with_id(response_type, Map::new());
        response.req_id = request.id;
        response.corr_id = if request.corr_id != 0 {
            request.corr_id
        } else {
            request.id
        };
        Ok(response)
    }

    /// Set the correlation id carried through a multi-hop exchange.
    #[must_use]
    pub fn with_corr_id(mut self, corr_id: u64) -> Self {
        self.corr_id = corr_id;
        self
    }

    /// Mark the envelope as failed.
    #[must_use]
    pub fn with_error(mut self, code: i32, message: impl Into<String>) -> Self {
        self.error_code = code;
        self.error_msg = Some(message.into());
        self
    }

    /// Set a payload field, refusing header keys.
    pub fn set_field(&mut self, key: impl Into<String>, value: Value) -> Result<(), EnvelopeError> {
        let key = key.into();
        if is_reserved_key(&key) {
            return Err(EnvelopeError::ReservedKey(key));
        }
        let _ = self.fields.insert(key, value);
        Ok(())
    }

    /// Remove a payload field.
    pub fn remove_field(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    /// Verb of the envelope.
    pub fn msg_type(&self) -> MsgType {
        self.msg_type
    }

    /// Process-unique id assigned by the sender.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Id of the request this envelope answers, 0 otherwise.
    pub fn req_id(&self) -> u64 {
        self.req_id
    }

    /// Correlation id.
    pub fn corr_id(&self) -> u64 {
        self.corr_id
    }

    /// Error code, 0 on success.
    pub fn error_code(&self) -> i32 {
        self.error_code
    }

    /// Error message, only present when the error code is non-zero.
    pub fn error_msg(&self) -> Option<&str> {
        if self.error_code == 0 {
            None
        } else {
            self.error_msg.as_deref()
        }
    }

    /// Whether the envelope reports a failure.
    pub fn is_error(&self) -> bool {
        self.error_code != 0
    }

    /// Payload fields.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Consume the envelope, keeping only its payload.
    pub fn into_fields(self) -> Map<String, Value> {
        self.fields
    }

    /// A single payload field.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// A payload field as a string slice.
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// Turn a non-zero error code into [`NodeError::Remote`].
    pub fn into_result(self) -> Result<Self, NodeError> {
        if self.is_error() {
            Err(NodeError::Remote {
                code: self.error_code,
                message: self.error_msg.unwrap_or_default(),
            })
        } else {
            Ok(self)
        }
    }

    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a JSON text frame.
    ///
    /// Header integers are accepted as JSON numbers or numeric strings.
    /// A frame whose header decodes but whose verb is not part of the
    /// protocol fails with [`EnvelopeError::UnknownType`]; every other
    /// problem is [`EnvelopeError::Malformed`].
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        let Value::Object(mut fields) = value else {
            return Err(EnvelopeError::Malformed("frame is not a JSON object".into()));
        };

        let tag = match fields.remove("type") {
            Some(Value::String(tag)) => tag,
            Some(other) => {
                return Err(EnvelopeError::Malformed(format!(
                    "type must be a string, got {other}"
                )));
            }
            None => return Err(EnvelopeError::Malformed("missing type".into())),
        };
        let id = take_u64(&mut fields, "id")?;
        let req_id = take_u64(&mut fields, "reqId")?;
        let corr_id = take_u64(&mut fields, "corrId")?;
        let error_code = take_i32(&mut fields, "errorCode")?;
        let error_msg = match fields.remove("errorMsg") {
            Some(Value::String(msg)) => Some(msg),
            Some(Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        };

        let msg_type = tag.parse::<MsgType>()?;

        Ok(Self {
            msg_type,
            id,
            req_id,
            corr_id,
            error_code,
            error_msg: if error_code == 0 { None } else { error_msg },
            fields,
        })
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let error_msg = self.error_msg();
        let header = 5 + usize::from(error_msg.is_some());
        let mut map = serializer.serialize_map(Some(header + self.fields.len()))?;
        map.serialize_entry("type", self.msg_type.as_str())?;
        map.serialize_entry("id", &self.id)?;
        map.serialize_entry("reqId", &self.req_id)?;
        map.serialize_entry("corrId", &self.corr_id)?;
        map.serialize_entry("errorCode", &self.error_code)?;
        if let Some(msg) = error_msg {
            map.serialize_entry("errorMsg", msg)?;
        }
        for (key, value) in &self.fields {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{} reqId={} corrId={}",
            self.msg_type, self.id, self.req_id, self.corr_id
        )?;
        if self.is_error() {
            write!(f, " errorCode={}", self.error_code)?;
        }
        Ok(())
    }
}

fn take_int(fields: &mut Map<String, Value>, key: &str) -> Result<i64, EnvelopeError> {
    let invalid = |v: &Value| EnvelopeError::Malformed(format!("{key} is not an integer: {v}"));
    match fields.remove(key) {
        None | Some(Value::Null) => Ok(0),
        Some(Value::Number(n)) => n.as_i64().ok_or_else(|| invalid(&Value::Number(n.clone()))),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(0),
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| invalid(&Value::String(s.clone()))),
        Some(other) => Err(invalid(&other)),
    }
}

fn take_u64(fields: &mut Map<String, Value>, key: &str) -> Result<u64, EnvelopeError> {
    let raw = take_int(fields, key)?;
    u64::try_from(raw).map_err(|_| EnvelopeError::Malformed(format!("{key} is negative: {raw}")))
}

fn take_i32(fields: &mut Map<String, Value>, key: &str) -> Result<i32, EnvelopeError> {
    let raw = take_int(fields, key)?;
    i32::try_from(raw).map_err(|_| EnvelopeError::Malformed(format!("{key} out of range: {raw}")))
}

/// Build a payload map from `(key, value)` pairs.
pub fn payload<I, K>(entries: I) -> Map<String, Value>
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    entries.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    // ── MsgType ──

    #[test]
    fn every_request_has_matching_response() {
        for t in MsgType::ALL.into_iter().filter(|t| t.is_request()) {
            let resp = t.response_type().unwrap();
            let base = t.as_str().strip_suffix(REQ_SUFFIX).unwrap();
            assert_eq!(resp.as_str(), format!("{base}{RESP_SUFFIX}"));
        }
    }

    #[test]
    fn non_requests_have_no_response() {
        for t in MsgType::ALL.into_iter().filter(|t| !t.is_request()) {
            assert!(t.response_type().is_none(), "{t}");
        }
    }

    #[test]
    fn push_is_neither_request_nor_response() {
        assert!(MsgType::TopicPush.is_push());
        assert!(!MsgType::TopicPush.is_request());
        assert!(!MsgType::TopicPush.is_response());
    }

    #[test]
    fn msg_type_from_str() {
        assert_eq!("PingReq".parse::<MsgType>().unwrap(), MsgType::PingReq);
        assert_matches!("Bogus".parse::<MsgType>(), Err(EnvelopeError::UnknownType(t)) if t == "Bogus");
    }

    // ── Construction ──

    #[test]
    fn new_request_defaults() {
        let env = Envelope::new_request(MsgType::PingReq, Map::new());
        assert!(env.id() > 0);
        assert_eq!(env.req_id(), 0);
        assert_eq!(env.corr_id(), 0);
        assert_eq!(env.error_code(), 0);
        assert!(env.error_msg().is_none());
    }

    #[test]
    fn ids_increase() {
        let a = Envelope::new_request(MsgType::PingReq, Map::new());
        let b = Envelope::new_request(MsgType::PingReq, Map::new());
        assert!(b.id() > a.id());
    }

    #[test]
    fn constructor_drops_header_keys() {
        let env = Envelope::new_request(
            MsgType::TopicPubReq,
            fields(json!({"id": 99, "type": "X", "topic": "/a"})),
        );
        assert_ne!(env.id(), 99);
        assert_eq!(env.fields().len(), 1);
        assert_eq!(env.field_str("topic"), Some("/a"));
    }

    #[test]
    fn set_field_rejects_reserved() {
        let mut env = Envelope::new_request(MsgType::PingReq, Map::new());
        assert_matches!(env.set_field("reqId", json!(1)), Err(EnvelopeError::ReservedKey(k)) if k == "reqId");
        env.set_field("x", json!(1)).unwrap();
        assert_eq!(env.field("x"), Some(&json!(1)));
    }

    // ── derive_response ──

    #[test]
    fn derive_response_uses_request_id_as_corr() {
        let req = Envelope::new_request(MsgType::InitReq, Map::new());
        let resp = Envelope::derive_response(&req).unwrap();
        assert_eq!(resp.msg_type(), MsgType::InitResp);
        assert_eq!(resp.req_id(), req.id());
        assert_eq!(resp.corr_id(), req.id());
        assert_ne!(resp.id(), req.id());
    }

    #[test]
    fn derive_response_keeps_corr_id() {
        let req = Envelope::new_request(MsgType::DataQueryReq, Map::new()).with_corr_id(7);
        let resp = Envelope::derive_response(&req).unwrap();
        assert_eq!(resp.corr_id(), 7);
    }

    #[test]
    fn derive_response_from_response_fails() {
        let req = Envelope::new_request(MsgType::PingReq, Map::new());
        let resp = Envelope::derive_response(&req).unwrap();
        assert_matches!(
            Envelope::derive_response(&resp),
            Err(EnvelopeError::NotARequestType(MsgType::PingResp))
        );
        let push = Envelope::new_push(MsgType::TopicPush, Map::new());
        assert_matches!(
            Envelope::derive_response(&push),
            Err(EnvelopeError::NotARequestType(MsgType::TopicPush))
        );
    }

    // ── Serialization ──

    #[test]
    fn serializes_flat() {
        let env = Envelope::new_request(MsgType::TopicPubReq, fields(json!({"topic": "/a/b", "x": 1})));
        let value: Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "TopicPubReq");
        assert_eq!(value["id"], env.id());
        assert_eq!(value["reqId"], 0);
        assert_eq!(value["topic"], "/a/b");
        assert_eq!(value["x"], 1);
        assert!(value.get("errorMsg").is_none());
    }

    #[test]
    fn error_msg_only_when_code_set() {
        let req = Envelope::new_request(MsgType::DataQueryReq, Map::new());
        let ok = Envelope::derive_response(&req).unwrap();
        let value: Value = serde_json::to_value(&ok).unwrap();
        assert!(value.get("errorMsg").is_none());

        let failed = Envelope::derive_response(&req).unwrap().with_error(1, "no data");
        let value: Value = serde_json::to_value(&failed).unwrap();
        assert_eq!(value["errorCode"], 1);
        assert_eq!(value["errorMsg"], "no data");
    }

    #[test]
    fn round_trip_with_error() {
        let req = Envelope::new_request(MsgType::ControllerInvokeReq, Map::new()).with_corr_id(3);
        let mut resp = Envelope::derive_response(&req).unwrap().with_error(-1, "boom");
        resp.set_field("path", json!("/x")).unwrap();
        let back = Envelope::parse(&resp.to_json().unwrap()).unwrap();
        assert_eq!(back, resp);
        assert_eq!(back.error_msg(), Some("boom"));
    }

    // ── Parsing ──

    #[test]
    fn parse_accepts_numeric_strings() {
        let env = Envelope::parse(r#"{"type":"PingReq","id":"12","reqId":"0","errorCode":"0"}"#).unwrap();
        assert_eq!(env.id(), 12);
        assert_eq!(env.msg_type(), MsgType::PingReq);
    }

    #[test]
    fn parse_missing_headers_default_to_zero() {
        let env = Envelope::parse(r#"{"type":"TopicPush","topic":"/a"}"#).unwrap();
        assert_eq!(env.id(), 0);
        assert_eq!(env.corr_id(), 0);
        assert_eq!(env.field_str("topic"), Some("/a"));
    }

    #[test]
    fn parse_ignores_error_msg_without_code() {
        let env = Envelope::parse(r#"{"type":"PingResp","errorMsg":"stale"}"#).unwrap();
        assert!(env.error_msg().is_none());
        assert!(env.fields().is_empty());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_matches!(Envelope::parse("not json"), Err(EnvelopeError::Malformed(_)));
        assert_matches!(Envelope::parse("[1,2]"), Err(EnvelopeError::Malformed(_)));
        assert_matches!(Envelope::parse(r#"{"id":1}"#), Err(EnvelopeError::Malformed(_)));
        assert_matches!(Envelope::parse(r#"{"type":5}"#), Err(EnvelopeError::Malformed(_)));
        assert_matches!(
            Envelope::parse(r#"{"type":"PingReq","id":"abc"}"#),
            Err(EnvelopeError::Malformed(_))
        );
        assert_matches!(
            Envelope::parse(r#"{"type":"PingReq","id":-4}"#),
            Err(EnvelopeError::Malformed(_))
        );
    }

    #[test]
    fn parse_unknown_type() {
        assert_matches!(
            Envelope::parse(r#"{"type":"FooReq","id":1}"#),
            Err(EnvelopeError::UnknownType(t)) if t == "FooReq"
        );
    }

    #[test]
    fn into_result_maps_remote_error() {
        let req = Envelope::new_request(MsgType::DataQueryReq, Map::new());
        let resp = Envelope::derive_response(&req).unwrap().with_error(404, "missing");
        assert_matches!(
            resp.into_result(),
            Err(NodeError::Remote { code: 404, message }) if message == "missing"
        );
    }

    fn request_type() -> impl Strategy<Value = MsgType> {
        prop::sample::select(
            MsgType::ALL
                .into_iter()
                .filter(|t| t.is_request())
                .collect::<Vec<_>>(),
        )
    }

    proptest! {
        #[test]
        fn derived_response_pairs_with_request(t in request_type(), corr in 0u64..1000) {
            let req = Envelope::new_request(t, Map::new()).with_corr_id(corr);
            let resp = Envelope::derive_response(&req).unwrap();
            prop_assert_eq!(resp.req_id(), req.id());
            prop_assert_eq!(resp.corr_id(), if corr != 0 { corr } else { req.id() });
            prop_assert!(resp.msg_type().is_response());
        }

        #[test]
        fn parse_reproduces_serialized(
            t in request_type(),
            code in -5i32..5,
            msg in "[a-z ]{0,12}",
            x in any::<i64>(),
            s in "[a-zA-Z0-9/]{0,16}",
        ) {
            let mut env = Envelope::new_request(t, Map::new());
            env.set_field("x", json!(x)).unwrap();
            env.set_field("s", json!(s)).unwrap();
            if code != 0 {
                env = env.with_error(code, msg);
            }
            let back = Envelope::parse(&env.to_json().unwrap()).unwrap();
            prop_assert_eq!(back, env);
        }
    }
}
