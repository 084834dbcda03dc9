//! Protocol constants shared by the broker and the node.

use std::time::Duration;

/// Suffix carried by every request verb.
pub const REQ_SUFFIX: &str = "Req";

/// Suffix carried by every response verb.
pub const RESP_SUFFIX: &str = "Resp";

/// Suffix carried by broadcast-only verbs (no response variant).
pub const PUSH_SUFFIX: &str = "Push";

/// Default interval between liveness checks and heartbeat pings.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// How long a connection may stay in a handshake or close state.
pub const DEFAULT_HANDSHAKE_GRACE: Duration = Duration::from_secs(3);

/// Minimum time a disconnected node waits before dialing again.
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(60);

/// Deadline applied to synchronous request/response calls.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Idle multiple of the heartbeat interval after which a connection is dead.
pub const IDLE_TIMEOUT_FACTOR: u32 = 3;

/// Largest text frame accepted by the transport adapters (1 GiB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024 * 1024;

/// HTTP path nodes dial to open their control connection.
pub const WS_NODE_PATH: &str = "/api/ws/node";

/// Envelope keys that payload fields may never use.
pub const RESERVED_KEYS: [&str; 6] = ["type", "id", "reqId", "corrId", "errorCode", "errorMsg"];

/// Payload key names.
pub mod fields {
    /// Declared node kind (`Trader`, `GenericClient`).
    pub const NODE_TYPE: &str = "nodeType";
    /// Stable identity a node presents on every connection.
    pub const NODE_CONSISTENT_ID: &str = "nodeConsistentId";
    /// Broker-assigned ephemeral session id.
    pub const NODE_ID: &str = "nodeId";
    /// Opaque attribute snapshot.
    pub const NODE_ATTRS: &str = "nodeAttrs";
    /// Topic list of a subscribe request.
    pub const TOPICS: &str = "topics";
    /// Topic of a publish or push.
    pub const TOPIC: &str = "topic";
    /// Consistent id of the node that published a push.
    pub const TOPIC_PUBLISHER: &str = "topicPublisher";
    /// Handshake user name.
    pub const USER: &str = "user";
    /// Handshake credential.
    pub const CREDENTIAL: &str = "credential";
    /// Instrument a data query targets.
    pub const EXCHANGEABLE: &str = "exchangeable";
    /// Dataset kind a data query targets.
    pub const DATA_INFO: &str = "dataInfo";
    /// Trading day a data query targets.
    pub const TRADING_DAY: &str = "tradingDay";
    /// Raw data-query answer.
    pub const DATA: &str = "data";
    /// Route of a remote invoke.
    pub const PATH: &str = "path";
    /// Remote invoke answer.
    pub const RESULT: &str = "result";
}

/// Returns true when `key` is one of the envelope header keys.
pub fn is_reserved_key(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_keys_are_reserved() {
        for key in RESERVED_KEYS {
            assert!(is_reserved_key(key));
        }
        assert!(!is_reserved_key(fields::TOPIC));
        assert!(!is_reserved_key("Type"));
    }

    #[test]
    fn idle_timeout_is_three_heartbeats() {
        assert_eq!(
            DEFAULT_HEARTBEAT_INTERVAL * IDLE_TIMEOUT_FACTOR,
            Duration::from_secs(30)
        );
    }
}
