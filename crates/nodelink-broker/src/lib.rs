//! # nodelink-broker
//!
//! The hub every node connects to.
//!
//! - **Session**: per-connection state, identity, topics, and the serialized write path
//! - **Registry**: live sessions by ephemeral id with a consistent-id fallback
//! - **Broker**: accept, close, topic fan-out, broker-initiated requests
//! - **Dispatch**: per-state routing of inbound envelopes
//! - **Liveness**: heartbeat, idle, and handshake deadlines
//! - **Server**: axum routes for the node socket, health, and session snapshots

#![deny(unsafe_code)]

pub mod broker;
mod dispatch;
pub mod health;
pub mod liveness;
pub mod registry;
pub mod server;
pub mod session;
pub mod ws;

pub use broker::{Broker, BrokerBuilder, BrokerConfig, SessionListener};
pub use liveness::SweepReport;
pub use server::BrokerServer;
pub use session::{BrokerSession, SessionInfo};
