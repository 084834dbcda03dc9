//! Periodic sweep over every session: heartbeats, idle and handshake deadlines.

use std::sync::Arc;

use futures::future::join_all;
use nodelink_core::constants::IDLE_TIMEOUT_FACTOR;
use nodelink_core::{Envelope, MsgType, SessionState};
use serde_json::Map;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::session::BrokerSession;

/// What one sweep did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Heartbeats sent.
    pub pinged: usize,
    /// Sessions closed.
    pub closed: usize,
}

impl Broker {
    /// Sweep every session once, as of `now`.
    ///
    /// - `Initializing` or `Closing` past the handshake grace: closed.
    /// - `Ready` idle for three heartbeat intervals: closed.
    /// - `Ready` idle for one heartbeat interval: pinged.
    ///
    /// Pings and closes run concurrently, each bounded by the write timeout,
    /// so one peer that stopped reading cannot hold up the others.
    pub async fn check_sessions(&self, now: Instant) -> SweepReport {
        let heartbeat = self.config.heartbeat_interval;
        let grace = self.config.handshake_grace;
        let mut to_close: Vec<(Arc<BrokerSession>, &'static str)> = Vec::new();
        let mut to_ping = Vec::new();

        for session in self.registry.snapshot() {
            match session.state() {
                SessionState::Initializing if session.state_age(now) >= grace => {
                    to_close.push((session, "handshake timed out"));
                }
                SessionState::Closing if session.state_age(now) >= grace => {
                    to_close.push((session, "close timed out"));
                }
                SessionState::Ready => {
                    let idle = session.idle(now);
                    if idle >= heartbeat * IDLE_TIMEOUT_FACTOR {
                        to_close.push((session, "idle timeout"));
                    } else if idle >= heartbeat {
                        to_ping.push((session, idle));
                    }
                }
                SessionState::Closed => to_close.push((session, "already closed")),
                SessionState::Initializing | SessionState::Closing => {}
            }
        }

        let pings = join_all(to_ping.into_iter().map(|(session, idle)| async move {
            let ping = Envelope::new_request(MsgType::PingReq, Map::new());
            let sent = session.send(&ping).await;
            (session, idle, sent)
        }))
        .await;
        let mut report = SweepReport::default();
        for (session, idle, sent) in pings {
            match sent {
                Ok(()) => {
                    report.pinged += 1;
                    debug!(session_id = %session.id(), idle_ms = idle.as_millis(), "heartbeat sent");
                }
                Err(error) => {
                    warn!(session_id = %session.id(), %error, "heartbeat failed");
                    to_close.push((session, "heartbeat failed"));
                }
            }
        }

        let closes = join_all(
            to_close
                .iter()
                .map(|(session, reason)| self.close_session(session, reason)),
        )
        .await;
        report.closed = closes.into_iter().filter(|closed| *closed).count();
        report
    }

    /// Run [`check_sessions`](Self::check_sessions) every check interval until `cancel` fires.
    pub fn spawn_supervisor(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                interval_ms = self.config.check_interval.as_millis(),
                "liveness supervisor started"
            );
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = self.check_sessions(Instant::now()).await;
                        if report != SweepReport::default() {
                            debug!(pinged = report.pinged, closed = report.closed, "liveness sweep");
                        }
                    }
                }
            }
            info!("liveness supervisor stopped");
        })
    }
}
