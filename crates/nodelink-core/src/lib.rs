//! # nodelink-core
//!
//! Shared vocabulary of the broker/node control plane.
//!
//! - **Envelope**: JSON wire format, verb enumeration, request/response pairing
//! - **Transport**: `FrameSink` / `FrameStream` seam plus an in-memory pair
//! - **State**: broker session and node connector states with timestamped cells
//! - **Topics**: copy-on-write local listener table
//! - **Pending**: oneshot slots for synchronous request/response calls
//! - **Ports**: collaborator traits (attributes, data queries, remote invoke, credentials)
//! - **Answer**: response builders for collaborator-backed requests
//! - **Guard**: panic isolation for listener callbacks
//! - **Logging**: `tracing` subscriber setup and log capture for tests

#![deny(unsafe_code)]

pub mod answer;
pub mod constants;
pub mod envelope;
pub mod errors;
pub mod guard;
pub mod ids;
pub mod logging;
pub mod payload;
pub mod pending;
pub mod ports;
pub mod shutdown;
pub mod state;
pub mod topics;
pub mod transport;

pub use envelope::{Envelope, MsgType};
pub use errors::{EnvelopeError, NodeError};
pub use ids::SessionId;
pub use state::{ConnectorState, SessionState, StateCell};
pub use transport::{BoxSink, BoxStream, FrameSink, FrameStream, TransportError};
