//! Request bodies sent to the sync API.

use serde::{Deserialize, Deserializer, Serialize};

use crate::domain::{SyncState, ViewLayout};

/// Create a session from an explicit video pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout: Option<ViewLayout>,
    pub reaction_video_id: String,
    pub external_video_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_offset: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playback_speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reaction_volume: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_volume: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_public: Option<bool>,
}

/// Partial session update. `None` leaves a field untouched.
///
/// `timestamp_start` is doubly optional: `Some(None)` clears the anchor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSessionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout: Option<ViewLayout>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_offset: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playback_speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reaction_volume: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_volume: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reaction_position: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_position: Option<f64>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_some"
    )]
    pub timestamp_start: Option<Option<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub countdown_start: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_state: Option<SyncState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_public: Option<bool>,
}

impl UpdateSessionRequest {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

// A present-but-null field must become Some(None), not None.
fn deserialize_some<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

/// Create or update a profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProfileRequest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_layout: Option<ViewLayout>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reaction_video_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_video_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_offset: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playback_speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reaction_volume: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_volume: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_notes: Option<String>,
}

/// Periodic position report. Idempotent on the server.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionReport {
    pub reaction_position: f64,
    pub external_position: f64,
}

/// Anchor for timestamp pinning, in seconds into the reaction stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimestampRequest {
    pub timestamp: f64,
}
