use std::collections::HashMap;

use nodelink_core::constants::MAX_MESSAGE_SIZE;
use serde::{Deserialize, Serialize};

/// Broker listener settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (0 picks a free one).
    pub port: u16,
    /// Largest accepted text frame in bytes.
    pub max_message_size: usize,
    /// Handshake user to credential table; empty accepts every node.
    pub credentials: HashMap<String, String>,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8930,
            max_message_size: MAX_MESSAGE_SIZE,
            credentials: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_frame_limit_is_one_gib() {
        assert_eq!(BrokerSettings::default().max_message_size, 1 << 30);
    }

    #[test]
    fn credentials_from_json() {
        let json = r#"{"credentials":{"trader":"x"}}"#;
        let s: BrokerSettings = serde_json::from_str(json).unwrap();
        assert_eq!(s.credentials.get("trader").map(String::as_str), Some("x"));
        assert_eq!(s.port, 8930);
    }
}
