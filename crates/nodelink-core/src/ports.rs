//! Collaborators the messaging layer calls into.
//!
//! The layer only carries envelopes; attribute snapshots, data queries and
//! remote invokes are answered by implementations of these traits.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::errors::{ERR_INVOKE_FAILED, ERR_NOT_FOUND, ERR_QUERY_FAILED};

/// Failure reported by a collaborator.
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    /// The requested dataset does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// No handler is mounted at the requested path.
    #[error("route not found: {0}")]
    RouteNotFound(String),

    /// The collaborator ran and failed.
    #[error("{0}")]
    Failed(String),
}

impl CollaboratorError {
    /// Error code written into the response envelope for a data query.
    pub fn query_code(&self) -> i32 {
        match self {
            Self::NotFound(_) | Self::RouteNotFound(_) => ERR_NOT_FOUND,
            Self::Failed(_) => ERR_QUERY_FAILED,
        }
    }

    /// Error code written into the response envelope for a remote invoke.
    pub fn invoke_code(&self) -> i32 {
        match self {
            Self::NotFound(_) | Self::RouteNotFound(_) => ERR_NOT_FOUND,
            Self::Failed(_) => ERR_INVOKE_FAILED,
        }
    }
}

/// Supplies the node's attribute snapshot (host, plugins, accounts).
#[async_trait]
pub trait AttributeProvider: Send + Sync {
    /// Current snapshot.
    async fn node_attributes(&self) -> Value;
}

/// Answers data-query requests against the time-series store.
#[async_trait]
pub trait DataQueryExecutor: Send + Sync {
    /// Load the raw payload of `dataset_kind` for `instrument` on `trading_day`.
    async fn query(
        &self,
        instrument: &str,
        dataset_kind: &str,
        trading_day: Option<&str>,
    ) -> Result<String, CollaboratorError>;
}

/// Routes remote-invoke requests into the local handler table.
#[async_trait]
pub trait InvokeRouter: Send + Sync {
    /// Run the handler mounted at `path`.
    async fn invoke(&self, path: &str, payload: &Map<String, Value>) -> Result<Value, CollaboratorError>;
}

/// Decides whether a handshake's credentials are acceptable.
pub trait CredentialVerifier: Send + Sync {
    /// Check one handshake.
    fn verify(&self, user: Option<&str>, credential: Option<&str>) -> bool;
}

// ── Stock implementations ───────────────────────────────────────────

/// Always answers with the same snapshot.
#[derive(Clone, Debug, Default)]
pub struct StaticAttributes(pub Value);

#[async_trait]
impl AttributeProvider for StaticAttributes {
    async fn node_attributes(&self) -> Value {
        self.0.clone()
    }
}

/// Executor for processes without a data store.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoDataStore;

#[async_trait]
impl DataQueryExecutor for NoDataStore {
    async fn query(
        &self,
        instrument: &str,
        dataset_kind: &str,
        _trading_day: Option<&str>,
    ) -> Result<String, CollaboratorError> {
        Err(CollaboratorError::NotFound(format!("{instrument}/{dataset_kind}")))
    }
}

/// Router with no routes.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoRoutes;

#[async_trait]
impl InvokeRouter for NoRoutes {
    async fn invoke(&self, path: &str, _payload: &Map<String, Value>) -> Result<Value, CollaboratorError> {
        Err(CollaboratorError::RouteNotFound(path.to_owned()))
    }
}

/// Accepts every handshake.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl CredentialVerifier for AllowAll {
    fn verify(&self, _user: Option<&str>, _credential: Option<&str>) -> bool {
        true
    }
}

/// Fixed user to credential table. An empty table accepts everyone.
#[derive(Clone, Debug, Default)]
pub struct StaticCredentials {
    users: HashMap<String, String>,
}

impl StaticCredentials {
    /// Build from a user to credential map.
    pub fn new(users: HashMap<String, String>) -> Self {
        Self { users }
    }
}

impl CredentialVerifier for StaticCredentials {
    fn verify(&self, user: Option<&str>, credential: Option<&str>) -> bool {
        if self.users.is_empty() {
            return true;
        }
        match (user, credential) {
            (Some(user), Some(credential)) => self.users.get(user).is_some_and(|c| c == credential),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn empty_credentials_accept_everyone() {
        let creds = StaticCredentials::default();
        assert!(creds.verify(None, None));
        assert!(creds.verify(Some("u"), Some("anything")));
    }

    #[test]
    fn credentials_must_match() {
        let creds = StaticCredentials::new(HashMap::from([("trader".into(), "x".into())]));
        assert!(creds.verify(Some("trader"), Some("x")));
        assert!(!creds.verify(Some("trader"), Some("y")));
        assert!(!creds.verify(Some("other"), Some("x")));
        assert!(!creds.verify(Some("trader"), None));
    }

    #[test]
    fn error_codes_by_operation() {
        let missing = CollaboratorError::NotFound("x".into());
        assert_eq!(missing.query_code(), ERR_NOT_FOUND);
        let failed = CollaboratorError::Failed("boom".into());
        assert_eq!(failed.query_code(), ERR_QUERY_FAILED);
        assert_eq!(failed.invoke_code(), ERR_INVOKE_FAILED);
    }

    #[tokio::test]
    async fn stock_collaborators() {
        assert_eq!(StaticAttributes(json!({"host": "h1"})).node_attributes().await["host"], "h1");
        assert_matches!(
            NoDataStore.query("ru2501", "min1", None).await,
            Err(CollaboratorError::NotFound(_))
        );
        assert_matches!(
            NoRoutes.invoke("/x", &Map::new()).await,
            Err(CollaboratorError::RouteNotFound(p)) if p == "/x"
        );
        assert!(AllowAll.verify(None, None));
    }
}
