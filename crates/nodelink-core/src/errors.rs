//! Error types for envelope handling and connection-level operations.

use std::time::Duration;

use crate::envelope::MsgType;
use crate::transport::TransportError;

// ── Wire error codes ────────────────────────────────────────────────

/// A data query failed inside the executor.
pub const ERR_QUERY_FAILED: i32 = 1;
/// A remote invoke failed inside the router.
pub const ERR_INVOKE_FAILED: i32 = -1;
/// Request payload could not be decoded.
pub const ERR_BAD_REQUEST: i32 = 400;
/// Handshake credentials were refused.
pub const ERR_UNAUTHORIZED: i32 = 401;
/// Requested dataset or route does not exist.
pub const ERR_NOT_FOUND: i32 = 404;

/// Failures decoding, encoding or building an [`Envelope`](crate::envelope::Envelope).
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// Frame is not a JSON object with valid header keys.
    #[error("malformed envelope: {0}")]
    Malformed(String),

    /// Frame is well-formed but carries a verb outside the protocol.
    #[error("unknown message type {0:?}")]
    UnknownType(String),

    /// A response was requested from a non-request verb.
    #[error("{0} is not a request type")]
    NotARequestType(MsgType),

    /// Payload key collides with a header key.
    #[error("payload key {0:?} is reserved")]
    ReservedKey(String),

    /// JSON encoding failed.
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failures surfaced by session and connector operations.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// Envelope could not be decoded or built.
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    /// Peer sent something the current state does not allow.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A send was attempted outside the `Ready` state.
    #[error("connection is not ready (state {0})")]
    NotReady(String),

    /// The transport refused the write.
    #[error("send failed: {0}")]
    SendFailure(#[from] TransportError),

    /// Opening the transport failed.
    #[error("connect failed: {0}")]
    Connect(#[source] TransportError),

    /// No response arrived before the deadline.
    #[error("request {id} timed out after {timeout:?}")]
    Timeout {
        /// Id of the unanswered request.
        id: u64,
        /// Deadline that elapsed.
        timeout: Duration,
    },

    /// The broker answered the handshake with a non-zero error code.
    #[error("handshake rejected ({code}): {message}")]
    HandshakeRejected {
        /// Wire error code.
        code: i32,
        /// Reason given by the broker.
        message: String,
    },

    /// The connection closed while a response was outstanding.
    #[error("connection closed before a response arrived")]
    ConnectionClosed,

    /// The peer answered with a non-zero error code.
    #[error("peer returned error {code}: {message}")]
    Remote {
        /// Wire error code.
        code: i32,
        /// Reason given by the peer.
        message: String,
    },

    /// No broker address is configured.
    #[error("broker address is not configured")]
    NotConfigured,
}

impl NodeError {
    /// Stable, machine-readable name of the error class.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Envelope(_) => "MALFORMED_ENVELOPE",
            Self::ProtocolViolation(_) => "PROTOCOL_VIOLATION",
            Self::NotReady(_) => "NOT_READY",
            Self::SendFailure(_) => "SEND_FAILURE",
            Self::Connect(_) => "CONNECT_FAILURE",
            Self::Timeout { .. } => "TIMEOUT",
            Self::HandshakeRejected { .. } => "HANDSHAKE_REJECTED",
            Self::ConnectionClosed => "CONNECTION_CLOSED",
            Self::Remote { .. } => "REMOTE_ERROR",
            Self::NotConfigured => "NOT_CONFIGURED",
        }
    }

    /// Whether this failure means the connection itself is gone.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            Self::ProtocolViolation(_)
                | Self::SendFailure(_)
                | Self::HandshakeRejected { .. }
                | Self::ConnectionClosed
        )
    }
}

/// Convenience alias for connection-level results.
pub type Result<T> = std::result::Result<T, NodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_distinct() {
        let errors = [
            NodeError::Envelope(EnvelopeError::Malformed("x".into())),
            NodeError::ProtocolViolation("x".into()),
            NodeError::NotReady("Closed".into()),
            NodeError::SendFailure(TransportError::Closed),
            NodeError::Connect(TransportError::Closed),
            NodeError::Timeout {
                id: 1,
                timeout: Duration::from_secs(1),
            },
            NodeError::HandshakeRejected {
                code: ERR_UNAUTHORIZED,
                message: "x".into(),
            },
            NodeError::ConnectionClosed,
            NodeError::Remote {
                code: 1,
                message: "x".into(),
            },
            NodeError::NotConfigured,
        ];
        let mut codes: Vec<_> = errors.iter().map(NodeError::code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn timeout_display_names_request() {
        let err = NodeError::Timeout {
            id: 42,
            timeout: Duration::from_millis(500),
        };
        assert_eq!(err.to_string(), "request 42 timed out after 500ms");
        assert!(!err.is_fatal_to_connection());
    }

    #[test]
    fn send_failure_is_fatal() {
        let err: NodeError = TransportError::Closed.into();
        assert!(err.is_fatal_to_connection());
        assert_eq!(err.code(), "SEND_FAILURE");
    }

    #[test]
    fn wire_codes_are_distinct() {
        let mut codes = [
            ERR_QUERY_FAILED,
            ERR_INVOKE_FAILED,
            ERR_BAD_REQUEST,
            ERR_UNAUTHORIZED,
            ERR_NOT_FOUND,
        ];
        codes.sort_unstable();
        assert!(codes.windows(2).all(|w| w[0] != w[1]));
        assert!(!codes.contains(&0));
    }
}
