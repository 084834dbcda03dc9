use std::time::Duration;

use nodelink_core::constants::{
    DEFAULT_HANDSHAKE_GRACE, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_RECONNECT_BACKOFF,
    DEFAULT_REQUEST_TIMEOUT,
};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Timing of the liveness supervisors and synchronous calls.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LivenessSettings {
    /// Heartbeat interval; idle connections are pinged after one and closed after three.
    pub heartbeat_interval_ms: u64,
    /// How long a connection may stay in a handshake or close state.
    pub handshake_grace_ms: u64,
    /// How long a disconnected node waits before dialing again.
    pub reconnect_backoff_ms: u64,
    /// Deadline for synchronous request/response calls.
    pub request_timeout_ms: u64,
    /// Supervisor tick; defaults to the heartbeat interval when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_interval_ms: Option<u64>,
    /// Longest a single frame write may block; defaults to the heartbeat interval.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub write_timeout_ms: Option<u64>,
}

impl Default for LivenessSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: millis(DEFAULT_HEARTBEAT_INTERVAL),
            handshake_grace_ms: millis(DEFAULT_HANDSHAKE_GRACE),
            reconnect_backoff_ms: millis(DEFAULT_RECONNECT_BACKOFF),
            request_timeout_ms: millis(DEFAULT_REQUEST_TIMEOUT),
            check_interval_ms: None,
            write_timeout_ms: None,
        }
    }
}

impl LivenessSettings {
    /// Heartbeat interval.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Handshake and close grace window.
    pub fn handshake_grace(&self) -> Duration {
        Duration::from_millis(self.handshake_grace_ms)
    }

    /// Reconnect backoff.
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    /// Synchronous call deadline.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Supervisor tick.
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.unwrap_or(self.heartbeat_interval_ms))
    }

    /// Frame write deadline.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms.unwrap_or(self.heartbeat_interval_ms))
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let named = [
            ("heartbeatIntervalMs", self.heartbeat_interval_ms),
            ("handshakeGraceMs", self.handshake_grace_ms),
            ("reconnectBackoffMs", self.reconnect_backoff_ms),
            ("requestTimeoutMs", self.request_timeout_ms),
            ("checkIntervalMs", self.check_interval_ms.unwrap_or(1)),
            ("writeTimeoutMs", self.write_timeout_ms.unwrap_or(1)),
        ];
        for (name, value) in named {
            if value == 0 {
                return Err(SettingsError::InvalidValue(format!(
                    "liveness.{name} must be positive"
                )));
            }
        }
        Ok(())
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
