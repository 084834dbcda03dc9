//! Live sessions keyed by ephemeral id.

use std::collections::HashMap;
use std::sync::Arc;

use nodelink_core::SessionId;
use parking_lot::RwLock;

use crate::session::BrokerSession;

/// Every session the broker has accepted and not yet closed.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<BrokerSession>>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fully constructed session.
    pub fn insert(&self, session: Arc<BrokerSession>) {
        let _ = self.sessions.write().insert(session.id().clone(), session);
    }

    /// Remove `id`. Only the caller that actually removed it gets the session back.
    pub fn remove(&self, id: &SessionId) -> Option<Arc<BrokerSession>> {
        self.sessions.write().remove(id)
    }

    /// Look up by ephemeral id, falling back to a scan on consistent id.
    pub fn get(&self, key: &str) -> Option<Arc<BrokerSession>> {
        let sessions = self.sessions.read();
        if let Some(session) = sessions.get(&SessionId::from(key)) {
            return Some(Arc::clone(session));
        }
        sessions
            .values()
            .find(|s| s.consistent_id().as_deref() == Some(key))
            .cloned()
    }

    /// Point-in-time copy of every session, safe to iterate while others mutate.
    pub fn snapshot(&self) -> Vec<Arc<BrokerSession>> {
        self.sessions.read().values().cloned().collect()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Whether no session is live.
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::NodeIdentity;
    use nodelink_core::payload::NodeType;
    use nodelink_core::transport::memory;
    use serde_json::Value;

    fn session() -> Arc<BrokerSession> {
        let (local, _remote) = memory::pair();
        Arc::new(BrokerSession::new(Box::new(local.sink), None))
    }

    #[test]
    fn insert_and_get_by_id() {
        let registry = SessionRegistry::new();
        let s = session();
        registry.insert(Arc::clone(&s));
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.get(s.id().as_str()).unwrap(), &s));
    }

    #[test]
    fn get_falls_back_to_consistent_id() {
        let registry = SessionRegistry::new();
        let s = session();
        s.complete_handshake(
            NodeIdentity {
                consistent_id: "host1.trader".into(),
                node_type: NodeType::Trader,
            },
            Value::Null,
        );
        registry.insert(Arc::clone(&s));
        assert!(Arc::ptr_eq(&registry.get("host1.trader").unwrap(), &s));
        assert!(registry.get("nobody").is_none());
    }

    #[test]
    fn remove_succeeds_once() {
        let registry = SessionRegistry::new();
        let s = session();
        registry.insert(Arc::clone(&s));
        assert!(registry.remove(s.id()).is_some());
        assert!(registry.remove(s.id()).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn snapshot_is_detached() {
        let registry = SessionRegistry::new();
        let a = session();
        registry.insert(Arc::clone(&a));
        let snap = registry.snapshot();
        let _ = registry.remove(a.id());
        assert_eq!(snap.len(), 1);
        assert!(registry.is_empty());
    }
}
