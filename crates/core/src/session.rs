use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{DeviceId, SessionId, TrackId, UserId};

/// Kind of client device a session runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Web,
    Mobile,
    Desktop,
    Tablet,
    Speaker,
    Tv,
    #[default]
    Unknown,
}

/// How a session reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndedBy {
    /// Explicit `End` call from the client.
    User,
    /// Idle past the heartbeat timeout; finalized by the sweeper or a late
    /// `End` call.
    Timeout,
    /// A new session started on the same `(user, device)` pair.
    Superseded,
}

impl EndedBy {
    /// Return the wire representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Timeout => "timeout",
            Self::Superseded => "superseded",
        }
    }
}

/// Aggregates computed when a session is finalized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub total_duration_ms: u64,
    pub tracks_played: u64,
    pub tracks_skipped: u64,
    /// Completed plays over total plays, in `[0, 1]`.
    pub completion_rate: f64,
}

/// A time-bounded listening context grouping related interactions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub device_type: DeviceType,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub ended_by: Option<EndedBy>,
    /// Last position reported by a heartbeat, persisted opportunistically.
    pub position_ms: Option<u64>,
    pub current_track_id: Option<TrackId>,
    #[serde(default)]
    pub client_context: HashMap<String, String>,
    pub summary: Option<SessionSummary>,
}

impl Session {
    /// Whether the session counts as active at `now`.
    ///
    /// A heartbeat exactly at the idle timeout is still active; only strictly
    /// older heartbeats expire.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>, idle_timeout: Duration) -> bool {
        self.ended_at.is_none() && now - self.last_heartbeat_at <= idle_timeout
    }

    /// Whether the session has gone idle past the timeout without ending.
    #[must_use]
    pub fn is_idle_expired(&self, now: DateTime<Utc>, idle_timeout: Duration) -> bool {
        self.ended_at.is_none() && now - self.last_heartbeat_at > idle_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn session(started: DateTime<Utc>) -> Session {
        Session {
            id: SessionId::new("ses-1"),
            user_id: UserId::new("usr-1"),
            device_id: DeviceId::new("dev-1"),
            device_type: DeviceType::Mobile,
            started_at: started,
            last_heartbeat_at: started,
            ended_at: None,
            ended_by: None,
            position_ms: None,
            current_track_id: None,
            client_context: HashMap::new(),
            summary: None,
        }
    }

    #[test]
    fn active_exactly_at_idle_timeout() {
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let s = session(start);
        let timeout = Duration::minutes(15);

        assert!(s.is_active(start + timeout, timeout));
        assert!(!s.is_active(start + timeout + Duration::seconds(1), timeout));
    }

    #[test]
    fn ended_session_is_never_active() {
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let mut s = session(start);
        s.ended_at = Some(start + Duration::minutes(1));
        s.ended_by = Some(EndedBy::User);
        assert!(!s.is_active(start + Duration::minutes(1), Duration::minutes(15)));
        assert!(!s.is_idle_expired(start + Duration::hours(1), Duration::minutes(15)));
    }
}
