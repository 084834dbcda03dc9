use nodelink_core::payload::NodeType;
use serde::{Deserialize, Serialize};

/// Node identity and broker address.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeSettings {
    /// WebSocket URL of the broker; `None` leaves the node unconfigured.
    pub broker_url: Option<String>,
    /// Stable identity presented on every connection.
    ///
    /// Empty means `<hostname>.<config name>` is derived at startup.
    pub consistent_id: String,
    /// Handshake user.
    pub user: Option<String>,
    /// Handshake credential.
    pub credential: Option<String>,
    /// Declared node kind.
    pub node_type: NodeType,
}

impl NodeSettings {
    /// Whether a broker address is known.
    pub fn is_configured(&self) -> bool {
        self.broker_url.as_deref().is_some_and(|u| !u.trim().is_empty())
    }

    /// The configured consistent id, or `<hostname>.<suffix>` when blank.
    pub fn resolve_consistent_id(&self, suffix: &str) -> String {
        if !self.consistent_id.trim().is_empty() {
            return self.consistent_id.clone();
        }
        let host = std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "localhost".into());
        format!("{host}.{suffix}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_by_default() {
        assert!(!NodeSettings::default().is_configured());
    }

    #[test]
    fn blank_url_is_unconfigured() {
        let s = NodeSettings {
            broker_url: Some("  ".into()),
            ..NodeSettings::default()
        };
        assert!(!s.is_configured());
    }

    #[test]
    fn explicit_consistent_id_wins() {
        let s = NodeSettings {
            consistent_id: "host1.trader".into(),
            ..NodeSettings::default()
        };
        assert_eq!(s.resolve_consistent_id("node"), "host1.trader");
    }

    #[test]
    fn derived_consistent_id_has_suffix() {
        let id = NodeSettings::default().resolve_consistent_id("trader");
        assert!(id.ends_with(".trader"));
        assert!(id.len() > ".trader".len());
    }

    #[test]
    fn node_type_from_json() {
        let s: NodeSettings =
            serde_json::from_str(r#"{"brokerUrl":"ws://b/api/ws/node","nodeType":"GenericClient"}"#)
                .unwrap();
        assert!(s.is_configured());
        assert_eq!(s.node_type, NodeType::GenericClient);
    }
}
