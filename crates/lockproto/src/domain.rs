//! Domain types shared by the engine and the sync API.
//!
//! Field names follow the API's camelCase JSON. Enums serialize as the
//! lowercase strings the service uses (`"youtube"`, `"synchronized"`, ...).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::request::UpdateSessionRequest;

// ============================================================================
// SessionId - Newtype for type safety
// ============================================================================

/// Identifier of a sync session. On the wire it's just a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ============================================================================
// Videos
// ============================================================================

/// Where a video comes from. Selects the playback backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Uploaded,
    Youtube,
    Vimeo,
    DirectLink,
}

impl SourceType {
    /// Hosted players (YouTube, Vimeo) are driven through an embed API
    /// rather than a native media element.
    pub fn is_embedded(&self) -> bool {
        matches!(self, SourceType::Youtube | SourceType::Vimeo)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Uploaded => "uploaded",
            SourceType::Youtube => "youtube",
            SourceType::Vimeo => "vimeo",
            SourceType::DirectLink => "direct_link",
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A playable video reference. The engine never mutates one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Video {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub url: String,
    pub source_type: SourceType,
    /// Seconds. Unknown for live or not-yet-probed streams.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

impl Video {
    pub fn new(url: impl Into<String>, source_type: SourceType) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: None,
            url: url.into(),
            source_type,
            duration: None,
        }
    }

    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.duration = Some(seconds);
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Title if present, otherwise the URL.
    pub fn label(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.url)
    }
}

// ============================================================================
// Session state
// ============================================================================

/// How the two players are arranged. Carried as data only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewLayout {
    #[default]
    SideBySide,
    Stacked,
    PictureInPicture,
    Grid,
}

/// Coarse synchronization status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    Unsynchronized,
    Syncing,
    Synchronized,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Unsynchronized => "unsynchronized",
            SyncState::Syncing => "syncing",
            SyncState::Synchronized => "synchronized",
        }
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected session parameters.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("playback speed must be a positive finite ratio, got {0}")]
    Speed(f64),

    #[error("volume must be within 0.0..=1.0, got {0}")]
    Volume(f64),

    #[error("time offset must be finite, got {0}")]
    Offset(f64),

    #[error("position must be a finite number of seconds >= 0, got {0}")]
    Position(f64),
}

pub fn validate_speed(speed: f64) -> Result<f64, ValidationError> {
    if speed.is_finite() && speed > 0.0 {
        Ok(speed)
    } else {
        Err(ValidationError::Speed(speed))
    }
}

pub fn validate_volume(volume: f64) -> Result<f64, ValidationError> {
    if (0.0..=1.0).contains(&volume) {
        Ok(volume)
    } else {
        Err(ValidationError::Volume(volume))
    }
}

pub fn validate_offset(offset: f64) -> Result<f64, ValidationError> {
    if offset.is_finite() {
        Ok(offset)
    } else {
        Err(ValidationError::Offset(offset))
    }
}

pub fn validate_position(position: f64) -> Result<f64, ValidationError> {
    if position.is_finite() && position >= 0.0 {
        Ok(position)
    } else {
        Err(ValidationError::Position(position))
    }
}

/// A pairing of two videos plus the parameters that keep them aligned.
///
/// `time_offset` follows `position(source) = position(reaction) + time_offset`.
/// The "external" fields are the source stream; the API predates the naming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub layout: ViewLayout,
    #[serde(default)]
    pub time_offset: f64,
    #[serde(default = "default_speed")]
    pub playback_speed: f64,
    #[serde(default = "default_volume")]
    pub reaction_volume: f64,
    #[serde(default = "default_volume")]
    pub external_volume: f64,
    #[serde(default)]
    pub reaction_position: f64,
    #[serde(default)]
    pub external_position: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_start: Option<f64>,
    #[serde(default)]
    pub countdown_start: bool,
    #[serde(default)]
    pub sync_state: SyncState,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shareable_link: Option<String>,
    pub reaction_video: Video,
    pub external_video: Video,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_speed() -> f64 {
    1.0
}

fn default_volume() -> f64 {
    1.0
}

impl Session {
    /// New unsynchronized session over a video pair with neutral parameters.
    pub fn new(reaction_video: Video, external_video: Video) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            name: None,
            layout: ViewLayout::default(),
            time_offset: 0.0,
            playback_speed: 1.0,
            reaction_volume: 1.0,
            external_volume: 1.0,
            reaction_position: 0.0,
            external_position: 0.0,
            timestamp_start: None,
            countdown_start: false,
            sync_state: SyncState::Unsynchronized,
            is_public: false,
            shareable_link: None,
            reaction_video,
            external_video,
            created_at: now,
            updated_at: now,
        }
    }

    /// Seed parameters from a profile template.
    pub fn apply_profile(&mut self, profile: &Profile) {
        self.name = Some(profile.name.clone());
        self.layout = profile.default_layout;
        self.time_offset = profile.time_offset;
        self.playback_speed = profile.playback_speed;
        self.reaction_volume = profile.reaction_volume;
        self.external_volume = profile.external_volume;
        self.updated_at = Utc::now();
    }

    /// Check the numeric invariants.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_offset(self.time_offset)?;
        validate_speed(self.playback_speed)?;
        validate_volume(self.reaction_volume)?;
        validate_volume(self.external_volume)?;
        Ok(())
    }

    /// Apply a partial update. Fields that would break an invariant are
    /// rejected before anything is written.
    pub fn apply_update(&mut self, update: &UpdateSessionRequest) -> Result<(), ValidationError> {
        if let Some(v) = update.time_offset {
            validate_offset(v)?;
        }
        if let Some(v) = update.playback_speed {
            validate_speed(v)?;
        }
        if let Some(v) = update.reaction_volume {
            validate_volume(v)?;
        }
        if let Some(v) = update.external_volume {
            validate_volume(v)?;
        }
        if let Some(v) = update.reaction_position {
            validate_position(v)?;
        }
        if let Some(v) = update.external_position {
            validate_position(v)?;
        }
        if let Some(Some(v)) = update.timestamp_start {
            validate_position(v)?;
        }

        if let Some(name) = &update.name {
            self.name = Some(name.clone());
        }
        if let Some(layout) = update.layout {
            self.layout = layout;
        }
        if let Some(v) = update.time_offset {
            self.time_offset = v;
        }
        if let Some(v) = update.playback_speed {
            self.playback_speed = v;
        }
        if let Some(v) = update.reaction_volume {
            self.reaction_volume = v;
        }
        if let Some(v) = update.external_volume {
            self.external_volume = v;
        }
        if let Some(v) = update.reaction_position {
            self.reaction_position = v;
        }
        if let Some(v) = update.external_position {
            self.external_position = v;
        }
        if let Some(v) = update.timestamp_start {
            self.timestamp_start = v;
        }
        if let Some(v) = update.countdown_start {
            self.countdown_start = v;
        }
        if let Some(v) = update.sync_state {
            self.sync_state = v;
        }
        if let Some(v) = update.is_public {
            self.is_public = v;
        }
        self.updated_at = Utc::now();
        Ok(())
    }
}

// ============================================================================
// Profiles
// ============================================================================

/// A named template of default session parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub default_layout: ViewLayout,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reaction_video_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_video_url: Option<String>,
    #[serde(default)]
    pub time_offset: f64,
    #[serde(default = "default_speed")]
    pub playback_speed: f64,
    #[serde(default = "default_volume")]
    pub reaction_volume: f64,
    #[serde(default = "default_volume")]
    pub external_volume: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_notes: Option<String>,
}

impl Profile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: None,
            default_layout: ViewLayout::default(),
            reaction_video_url: None,
            external_video_url: None,
            time_offset: 0.0,
            playback_speed: 1.0,
            reaction_volume: 1.0,
            external_volume: 1.0,
            sync_notes: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn pair() -> (Video, Video) {
        (
            Video::new("https://cdn.example.com/reaction.mp4", SourceType::DirectLink),
            Video::new("https://youtu.be/dQw4w9WgXcQ", SourceType::Youtube),
        )
    }

    #[test]
    fn test_source_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&SourceType::DirectLink).unwrap(),
            "\"direct_link\""
        );
        let parsed: SourceType = serde_json::from_str("\"vimeo\"").unwrap();
        assert_eq!(parsed, SourceType::Vimeo);
        assert!(parsed.is_embedded());
        assert!(!SourceType::Uploaded.is_embedded());
    }

    #[test]
    fn test_session_deserializes_api_shape() {
        let json = serde_json::json!({
            "id": "s-1",
            "layout": "picture_in_picture",
            "timeOffset": -5.0,
            "playbackSpeed": 1.25,
            "reactionVolume": 0.5,
            "externalVolume": 0.8,
            "reactionPosition": 12.0,
            "externalPosition": 7.0,
            "countdownStart": false,
            "syncState": "synchronized",
            "isPublic": true,
            "reactionVideo": {"id": "r", "url": "file:///r.mp4", "sourceType": "uploaded"},
            "externalVideo": {"id": "e", "url": "https://vimeo.com/1", "sourceType": "vimeo", "duration": 300.0},
            "createdAt": "2024-01-01T00:00:00Z",
            "updatedAt": "2024-01-01T00:00:00Z"
        });

        let session: Session = serde_json::from_value(json).unwrap();
        assert_eq!(session.id.as_str(), "s-1");
        assert_eq!(session.layout, ViewLayout::PictureInPicture);
        assert_eq!(session.sync_state, SyncState::Synchronized);
        assert_eq!(session.external_video.duration, Some(300.0));
        assert_eq!(session.timestamp_start, None);
        assert!(session.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_speed_and_volume() {
        let (r, e) = pair();
        let mut session = Session::new(r, e);
        session.playback_speed = 0.0;
        assert_eq!(session.validate(), Err(ValidationError::Speed(0.0)));

        session.playback_speed = 1.0;
        session.external_volume = 1.5;
        assert_eq!(session.validate(), Err(ValidationError::Volume(1.5)));
    }

    #[test]
    fn test_apply_update_is_all_or_nothing() {
        let (r, e) = pair();
        let mut session = Session::new(r, e);
        let update = UpdateSessionRequest {
            time_offset: Some(3.0),
            playback_speed: Some(-1.0),
            ..Default::default()
        };

        assert!(session.apply_update(&update).is_err());
        assert_eq!(session.time_offset, 0.0, "offset must not be written");

        let update = UpdateSessionRequest {
            time_offset: Some(3.0),
            timestamp_start: Some(Some(30.0)),
            sync_state: Some(SyncState::Syncing),
            ..Default::default()
        };
        session.apply_update(&update).unwrap();
        assert_eq!(session.time_offset, 3.0);
        assert_eq!(session.timestamp_start, Some(30.0));
        assert_eq!(session.sync_state, SyncState::Syncing);
    }

    #[test]
    fn test_apply_profile() {
        let (r, e) = pair();
        let mut session = Session::new(r, e);
        let mut profile = Profile::new("late start");
        profile.time_offset = 12.5;
        profile.playback_speed = 1.5;
        profile.reaction_volume = 0.2;
        profile.default_layout = ViewLayout::Grid;

        session.apply_profile(&profile);
        assert_eq!(session.name.as_deref(), Some("late start"));
        assert_eq!(session.time_offset, 12.5);
        assert_eq!(session.playback_speed, 1.5);
        assert_eq!(session.reaction_volume, 0.2);
        assert_eq!(session.layout, ViewLayout::Grid);
    }

    #[test]
    fn test_video_label_falls_back_to_url() {
        let v = Video::new("https://example.com/a.mp4", SourceType::DirectLink);
        assert_eq!(v.label(), "https://example.com/a.mp4");
        assert_eq!(v.with_title("A").label(), "A");
    }
}
