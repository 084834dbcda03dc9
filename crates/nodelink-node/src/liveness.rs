//! Connection watchdog: broker silence, stuck dials, and reconnect.

use std::sync::Arc;

use nodelink_core::ConnectorState;
use nodelink_core::constants::IDLE_TIMEOUT_FACTOR;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::connector::NodeConnector;

/// What one check did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LivenessAction {
    /// Nothing to do.
    Idle,
    /// The connection was dropped.
    Closed,
    /// A reconnect was started.
    Reconnect,
}

impl NodeConnector {
    /// Check the connection once, as of `now`.
    ///
    /// - Connected states silent for three heartbeat intervals: dropped.
    /// - `Connecting` for longer than one heartbeat interval: dropped.
    /// - Offline for the reconnect backoff with a broker address: redialled.
    pub async fn check_connection(self: &Arc<Self>, now: Instant) -> LivenessAction {
        let heartbeat = self.config.heartbeat_interval;
        match self.state() {
            ConnectorState::Initializing | ConnectorState::Ready | ConnectorState::Closing
                if self.idle(now) >= heartbeat * IDLE_TIMEOUT_FACTOR =>
            {
                self.force_close("broker idle timeout").await;
                LivenessAction::Closed
            }
            ConnectorState::Connecting if self.state_age(now) >= heartbeat => {
                self.force_close("connect timed out").await;
                LivenessAction::Closed
            }
            ConnectorState::NotConfigured | ConnectorState::Closed
                if !self.is_stopped()
                    && self.broker_url().is_some()
                    && self.state_age(now) >= self.config.reconnect_backoff =>
            {
                let connector = Arc::clone(self);
                drop(tokio::spawn(async move {
                    if let Err(error) = connector.connect().await {
                        debug!(%error, "reconnect failed");
                    }
                }));
                LivenessAction::Reconnect
            }
            _ => LivenessAction::Idle,
        }
    }

    /// Run [`check_connection`](Self::check_connection) every check interval until `cancel` fires.
    pub fn spawn_supervisor(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                interval_ms = self.config.check_interval.as_millis(),
                "connection supervisor started"
            );
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let action = self.check_connection(Instant::now()).await;
                        if action != LivenessAction::Idle {
                            debug!(?action, "liveness check");
                        }
                    }
                }
            }
            info!("connection supervisor stopped");
        })
    }
}
