//! Interaction events and telemetry records.
//!
//! Interactions are immutable after insert. Open-ended client attributes go
//! in the `extensions` map; everything the offline learner branches on is a
//! tagged field.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::DeviceType;
use crate::types::{RecommendationId, SessionId, TrackId, UserId};

/// What the listener did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionType {
    Play,
    Skip,
    Like,
    Dislike,
    Save,
    AddToPlaylist,
    Share,
    Complete,
}

impl InteractionType {
    /// Return the wire representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Play => "play",
            Self::Skip => "skip",
            Self::Like => "like",
            Self::Dislike => "dislike",
            Self::Save => "save",
            Self::AddToPlaylist => "add_to_playlist",
            Self::Share => "share",
            Self::Complete => "complete",
        }
    }
}

/// Where the listener found the track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InteractionSource {
    Recommendation,
    Search,
    Playlist,
    Radio,
    Library,
    Chart,
    Share,
    #[default]
    Unknown,
}

/// An accepted, immutable interaction record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    pub id: String,
    pub user_id: UserId,
    pub track_id: TrackId,
    pub session_id: Option<SessionId>,
    #[serde(rename = "type")]
    pub kind: InteractionType,
    pub created_at: DateTime<Utc>,
    pub play_duration_ms: Option<u64>,
    pub position_ms: Option<u64>,
    pub source: InteractionSource,
    pub source_id: Option<String>,
    /// Impression slot this interaction closes the loop on.
    pub recommendation_id: Option<RecommendationId>,
    pub device_type: DeviceType,
    pub skip_reason: Option<String>,
    pub mood: Option<String>,
    pub activity: Option<String>,
    /// Set when a `complete` or `skip` was downgraded to `play` by
    /// validation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_override: Option<bool>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extensions: HashMap<String, String>,
}

/// An interaction as submitted by a client, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestEvent {
    pub track_id: TrackId,
    pub session_id: Option<SessionId>,
    #[serde(rename = "type")]
    pub kind: InteractionType,
    pub play_duration_ms: Option<u64>,
    pub position_ms: Option<u64>,
    #[serde(default)]
    pub source: InteractionSource,
    pub source_id: Option<String>,
    pub recommendation_id: Option<RecommendationId>,
    #[serde(default)]
    pub device_type: DeviceType,
    pub skip_reason: Option<String>,
    pub mood: Option<String>,
    pub activity: Option<String>,
    /// Monotonic per-session sequence number; enforces per-session FIFO.
    pub client_seq: Option<u64>,
    #[serde(default)]
    pub extensions: HashMap<String, String>,
}

/// Append-only search telemetry record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    pub id: String,
    pub user_id: UserId,
    pub query: String,
    pub results_count: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extensions: HashMap<String, String>,
}

/// Append-only content view telemetry record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentView {
    pub id: String,
    pub user_id: UserId,
    pub content_type: String,
    pub content_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extensions: HashMap<String, String>,
}

/// Append-only low-level player event record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerEvent {
    pub id: String,
    pub user_id: UserId,
    pub session_id: Option<SessionId>,
    pub event: String,
    pub track_id: Option<TrackId>,
    pub position_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extensions: HashMap<String, String>,
}
