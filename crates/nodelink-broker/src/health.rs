//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` while the broker runs.
    pub status: String,
    /// Seconds since the broker started.
    pub uptime_secs: u64,
    /// Registered sessions, any state.
    pub sessions: usize,
    /// Sessions past the handshake.
    pub ready_sessions: usize,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, sessions: usize, ready_sessions: usize) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        sessions,
        ready_sessions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_ok() {
        let resp = health_check(Instant::now(), 0, 0);
        assert_eq!(resp.status, "ok");
        assert!(resp.uptime_secs < 2);
    }

    #[test]
    fn uptime_increases() {
        let start = Instant::now()
            .checked_sub(std::time::Duration::from_secs(60))
            .unwrap();
        assert!(health_check(start, 0, 0).uptime_secs >= 59);
    }

    #[test]
    fn counts_serialize() {
        let json = serde_json::to_value(health_check(Instant::now(), 4, 3)).unwrap();
        assert_eq!(json["sessions"], 4);
        assert_eq!(json["ready_sessions"], 3);
    }
}
