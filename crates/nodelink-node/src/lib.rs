//! # nodelink-node
//!
//! A node's connection to the broker.
//!
//! - **Connector**: dial, handshake, request/response, topic subscribe and publish, shutdown
//! - **Dispatch**: inbound envelopes from the broker
//! - **Liveness**: broker silence, stuck dials, reconnect backoff
//! - **Ws**: tokio-tungstenite dialer with basic auth

#![deny(unsafe_code)]

pub mod connector;
mod dispatch;
pub mod liveness;
pub mod ws;

pub use connector::{
    ConnectorConfig, ConnectorInfo, ConnectorListener, DialTarget, Dialer, NodeConnector, NodeConnectorBuilder,
};
pub use liveness::LivenessAction;
pub use ws::TungsteniteDialer;
