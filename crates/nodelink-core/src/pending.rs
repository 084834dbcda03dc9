//! Outstanding synchronous requests, keyed by request id.
//!
//! A caller registers a slot before sending, the inbound dispatcher fulfils it
//! with the matching response, and [`PendingRequests::call`] bounds the send and the wait.
//! Dropping the table's senders (see [`PendingRequests::cancel_all`]) wakes
//! every waiter with [`NodeError::ConnectionClosed`].

use std::future::Future;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::envelope::Envelope;
use crate::errors::NodeError;
use crate::transport::TransportError;

/// Request id to response slot.
#[derive(Debug, Default)]
pub struct PendingRequests {
    slots: DashMap<u64, oneshot::Sender<Envelope>>,
}

impl PendingRequests {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a slot for the response to request `id`.
    pub fn register(&self, id: u64) -> oneshot::Receiver<Envelope> {
        let (tx, rx) = oneshot::channel();
        let _ = self.slots.insert(id, tx);
        rx
    }

    /// Hand `response` to whoever waits on its `reqId`.
    ///
    /// Gives the envelope back when nobody is waiting.
    pub fn fulfill(&self, response: Envelope) -> Result<(), Envelope> {
        match self.slots.remove(&response.req_id()) {
            Some((_, tx)) => tx.send(response),
            None => Err(response),
        }
    }

    /// Drop the slot for `id`, if any.
    pub fn remove(&self, id: u64) -> bool {
        self.slots.remove(&id).is_some()
    }

    /// Drop every slot. Waiters fail with [`NodeError::ConnectionClosed`].
    pub fn cancel_all(&self) -> usize {
        let count = self.slots.len();
        self.slots.clear();
        if count > 0 {
            debug!(count, "cancelled pending requests");
        }
        count
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Register `id`, run `send`, then wait for the answer.
    ///
    /// `timeout` covers the send and the wait together. A send still blocked
    /// at the deadline fails with a fatal [`NodeError::SendFailure`], an
    /// unanswered request with [`NodeError::Timeout`].
    pub async fn call<F>(&self, id: u64, timeout: Duration, send: F) -> Result<Envelope, NodeError>
    where
        F: Future<Output = Result<(), NodeError>>,
    {
        let deadline = Instant::now() + timeout;
        let rx = self.register(id);
        match tokio::time::timeout_at(deadline, send).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                let _ = self.remove(id);
                return Err(error);
            }
            Err(_) => {
                let _ = self.remove(id);
                return Err(NodeError::SendFailure(TransportError::WriteTimeout(timeout)));
            }
        }
        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(NodeError::ConnectionClosed),
            Err(_) => {
                let _ = self.remove(id);
                Err(NodeError::Timeout { id, timeout })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::envelope::MsgType;
    use assert_matches::assert_matches;
    use serde_json::Map;

    fn request() -> Envelope {
        Envelope::new_request(MsgType::DataQueryReq, Map::new())
    }

    #[test]
    fn fulfill_without_waiter_returns_envelope() {
        let table = PendingRequests::new();
        let req = request();
        let resp = Envelope::derive_response(&req).unwrap();
        assert_eq!(table.fulfill(resp.clone()), Err(resp));
    }

    #[tokio::test(start_paused = true)]
    async fn call_times_out_at_deadline() {
        let table = PendingRequests::new();
        let req = request();
        let start = tokio::time::Instant::now();

        let err = table
            .call(req.id(), Duration::from_secs(30), async { Ok::<(), NodeError>(()) })
            .await
            .unwrap_err();
        assert_matches!(err, NodeError::Timeout { id, .. } if id == req.id());
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn call_deadline_covers_a_stuck_send() {
        let table = PendingRequests::new();
        let start = tokio::time::Instant::now();

        let err = table
            .call(7, Duration::from_secs(30), std::future::pending())
            .await
            .unwrap_err();
        assert_matches!(err, NodeError::SendFailure(TransportError::WriteTimeout(_)));
        assert!(err.is_fatal_to_connection());
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn call_deadline_includes_send_time() {
        let table = PendingRequests::new();
        let start = tokio::time::Instant::now();

        let slow_send = async {
            tokio::time::sleep(Duration::from_secs(20)).await;
            Ok::<(), NodeError>(())
        };
        let err = table.call(8, Duration::from_secs(30), slow_send).await.unwrap_err();
        assert_matches!(err, NodeError::Timeout { id: 8, .. });
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn call_returns_answer() {
        let table = Arc::new(PendingRequests::new());
        let req = request();
        let resp = Envelope::derive_response(&req).unwrap();

        let answer = {
            let table = Arc::clone(&table);
            let resp = resp.clone();
            async move {
                table.fulfill(resp).unwrap();
                Ok::<(), NodeError>(())
            }
        };
        let got = table.call(req.id(), Duration::from_secs(1), answer).await.unwrap();
        assert_eq!(got, resp);
    }

    #[tokio::test]
    async fn cancel_all_releases_waiters() {
        let table = Arc::new(PendingRequests::new());
        let req = request();

        let waiter = {
            let table = Arc::clone(&table);
            tokio::spawn(async move {
                table
                    .call(req.id(), Duration::from_secs(60), async { Ok::<(), NodeError>(()) })
                    .await
            })
        };
        while table.is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(table.cancel_all(), 1);
        assert_matches!(waiter.await.unwrap(), Err(NodeError::ConnectionClosed));
    }

    #[test]
    fn remove_is_idempotent() {
        let table = PendingRequests::new();
        let _rx = table.register(5);
        assert_eq!(table.len(), 1);
        assert!(table.remove(5));
        assert!(!table.remove(5));
    }
}
