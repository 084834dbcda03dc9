//! Settings type definitions.
//!
//! Field names are camelCase on disk. Every section implements [`Default`]
//! and is `#[serde(default)]`, so partial files are fine.

mod broker;
mod liveness;
mod logging;
mod node;

pub use broker::*;
pub use liveness::*;
pub use logging::*;
pub use node::*;

use serde::{Deserialize, Serialize};

/// Root settings for both the broker and the node.
///
/// ```json
/// {
///   "liveness": { "heartbeatIntervalMs": 5000 },
///   "node": { "brokerUrl": "ws://10.0.0.2:8930/api/ws/node", "consistentId": "host1.trader" }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodelinkSettings {
    /// Log level and format.
    pub logging: LoggingSettings,
    /// Heartbeat, grace and reconnect timing.
    pub liveness: LivenessSettings,
    /// Broker listener and handshake credentials.
    pub broker: BrokerSettings,
    /// Node identity and broker address.
    pub node: NodeSettings,
}

impl NodelinkSettings {
    /// Reject values that would make the liveness rules meaningless.
    pub fn validate(&self) -> crate::Result<()> {
        self.liveness.validate()?;
        if self.broker.max_message_size == 0 {
            return Err(crate::SettingsError::InvalidValue(
                "broker.maxMessageSize must be positive".into(),
            ));
        }
        Ok(())
    }
}
