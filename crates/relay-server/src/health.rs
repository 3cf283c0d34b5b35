//! `GET /` status summary.

use serde::Serialize;
use std::time::Instant;

use crate::listener::ListenerState;

pub const STATUS_RUNNING: &str = "WebSocket server running";

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    /// `connected`, `degraded` (listener not currently listening) or `disconnected`.
    pub bus_status: &'static str,
    pub store_status: &'static str,
    pub active_users: Vec<String>,
    pub uptime_secs: u64,
    /// Absent when the process runs without a bus.
    pub listener_state: Option<ListenerState>,
}

pub fn bus_status(listener: Option<ListenerState>) -> &'static str {
    match listener {
        None => "disconnected",
        Some(ListenerState::Listening) => "connected",
        Some(_) => "degraded",
    }
}

pub fn status(
    start_time: Instant,
    listener: Option<ListenerState>,
    store_present: bool,
    active_users: Vec<String>,
) -> StatusResponse {
    StatusResponse {
        status: STATUS_RUNNING,
        bus_status: bus_status(listener),
        store_status: if store_present { "connected" } else { "disconnected" },
        active_users,
        uptime_secs: start_time.elapsed().as_secs(),
        listener_state: listener,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_status_follows_listener() {
        assert_eq!(bus_status(None), "disconnected");
        assert_eq!(bus_status(Some(ListenerState::Listening)), "connected");
        assert_eq!(bus_status(Some(ListenerState::ReconnectPending)), "degraded");
        assert_eq!(bus_status(Some(ListenerState::Crashed)), "degraded");
    }

    #[test]
    fn uptime_increases() {
        let start = Instant::now()
            .checked_sub(std::time::Duration::from_secs(60))
            .unwrap();
        let resp = status(start, None, false, Vec::new());
        assert!(resp.uptime_secs >= 59);
    }

    #[test]
    fn serialization() {
        let resp = status(
            Instant::now(),
            Some(ListenerState::Listening),
            true,
            vec!["A".into(), "B".into()],
        );
        let parsed = serde_json::to_value(&resp).unwrap();
        assert_eq!(parsed["status"], STATUS_RUNNING);
        assert_eq!(parsed["bus_status"], "connected");
        assert_eq!(parsed["store_status"], "connected");
        assert_eq!(parsed["active_users"], serde_json::json!(["A", "B"]));
        assert_eq!(parsed["listener_state"], "listening");
        assert!(parsed["uptime_secs"].is_number());
    }
}
