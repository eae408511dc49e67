//! In-process sync API backed by DashMaps.
//!
//! Mirrors the server's rules (validation, position acks carrying the
//! stored sync state, share codes) closely enough to run the engine
//! against. Also lets tests play "another participant" and inject failures.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use lockproto::{
    validate_offset, validate_position, validate_speed, validate_volume, CreateProfileRequest,
    CreateSessionRequest, PositionAck, PositionReport, Profile, Session, SessionId, SourceType,
    SyncState, UpdateSessionRequest, Video,
};
use tracing::debug;
use uuid::Uuid;

use super::{share_code, ApiError, SessionApi};
use crate::offset::clamp_position;

const DEFAULT_SHARE_BASE: &str = "http://localhost:8080/shared";

pub struct InMemorySessionApi {
    sessions: DashMap<SessionId, Session>,
    profiles: DashMap<String, Profile>,
    videos: DashMap<String, Video>,
    shares: DashMap<String, SessionId>,
    share_base: String,
    calls: DashMap<(&'static str, String), u32>,
    fail_next: AtomicU32,
}

impl Default for InMemorySessionApi {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySessionApi {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            profiles: DashMap::new(),
            videos: DashMap::new(),
            shares: DashMap::new(),
            share_base: DEFAULT_SHARE_BASE.to_string(),
            calls: DashMap::new(),
            fail_next: AtomicU32::new(0),
        }
    }

    pub fn with_share_base(mut self, base: impl Into<String>) -> Self {
        self.share_base = base.into().trim_end_matches('/').to_string();
        self
    }

    /// Make a video known so sessions can reference it by id.
    pub fn register_video(&self, video: Video) -> String {
        let id = video.id.clone();
        self.videos.insert(id.clone(), video);
        id
    }

    pub fn insert_session(&self, session: Session) -> SessionId {
        let id = session.id.clone();
        self.sessions.insert(id.clone(), session);
        id
    }

    /// Current stored copy of a session.
    pub fn session(&self, id: &SessionId) -> Option<Session> {
        self.sessions.get(id).map(|s| s.clone())
    }

    /// Change the stored sync state as another participant would.
    pub fn force_sync_state(&self, id: &SessionId, state: SyncState) -> bool {
        match self.sessions.get_mut(id) {
            Some(mut session) => {
                session.sync_state = state;
                true
            }
            None => false,
        }
    }

    /// The next `count` calls fail with [`ApiError::Unavailable`].
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Calls of `op` made for `key` (a session or profile id).
    pub fn call_count(&self, op: &str, key: &str) -> u32 {
        self.calls
            .iter()
            .filter(|entry| entry.key().0 == op && entry.key().1 == key)
            .map(|entry| *entry.value())
            .sum()
    }

    /// Calls of `op` across all keys.
    pub fn total_calls(&self, op: &str) -> u32 {
        self.calls
            .iter()
            .filter(|entry| entry.key().0 == op)
            .map(|entry| *entry.value())
            .sum()
    }

    fn record(&self, op: &'static str, key: &str) -> Result<(), ApiError> {
        *self.calls.entry((op, key.to_string())).or_insert(0) += 1;
        debug!(op, key, "in-memory api call");

        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ApiError::Unavailable(format!("{op} failed (injected)")));
        }
        Ok(())
    }

    fn with_session<T>(
        &self,
        id: &SessionId,
        f: impl FnOnce(&mut Session) -> Result<T, ApiError>,
    ) -> Result<T, ApiError> {
        let mut session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| ApiError::NotFound(format!("session {id}")))?;
        f(&mut session)
    }

    fn video(&self, id: &str) -> Result<Video, ApiError> {
        self.videos
            .get(id)
            .map(|v| v.clone())
            .ok_or_else(|| ApiError::NotFound(format!("video {id}")))
    }

    fn video_for_url(&self, url: &str) -> Video {
        self.videos
            .iter()
            .find(|entry| entry.value().url == url)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| Video::new(url, guess_source_type(url)))
    }
}

/// Infer a source type from a URL.
pub fn guess_source_type(url: &str) -> SourceType {
    if url.contains("youtube.com") || url.contains("youtu.be") {
        SourceType::Youtube
    } else if url.contains("vimeo.com") {
        SourceType::Vimeo
    } else {
        SourceType::DirectLink
    }
}

fn profile_from_request(mut profile: Profile, request: &CreateProfileRequest) -> Result<Profile, ApiError> {
    if request.name.trim().is_empty() {
        return Err(ApiError::Rejected("profile name is required".to_string()));
    }
    profile.name = request.name.clone();
    profile.description = request.description.clone();
    if let Some(layout) = request.default_layout {
        profile.default_layout = layout;
    }
    if request.reaction_video_url.is_some() {
        profile.reaction_video_url = request.reaction_video_url.clone();
    }
    if request.external_video_url.is_some() {
        profile.external_video_url = request.external_video_url.clone();
    }
    if let Some(v) = request.time_offset {
        profile.time_offset = validate_offset(v)?;
    }
    if let Some(v) = request.playback_speed {
        profile.playback_speed = validate_speed(v)?;
    }
    if let Some(v) = request.reaction_volume {
        profile.reaction_volume = validate_volume(v)?;
    }
    if let Some(v) = request.external_volume {
        profile.external_volume = validate_volume(v)?;
    }
    if request.sync_notes.is_some() {
        profile.sync_notes = request.sync_notes.clone();
    }
    Ok(profile)
}

#[async_trait]
impl SessionApi for InMemorySessionApi {
    async fn create_session(&self, request: &CreateSessionRequest) -> Result<Session, ApiError> {
        self.record("create_session", "")?;
        let mut session = Session::new(
            self.video(&request.reaction_video_id)?,
            self.video(&request.external_video_id)?,
        );
        session.apply_update(&UpdateSessionRequest {
            name: request.name.clone(),
            layout: request.layout,
            time_offset: request.time_offset,
            playback_speed: request.playback_speed,
            reaction_volume: request.reaction_volume,
            external_volume: request.external_volume,
            is_public: request.is_public,
            ..Default::default()
        })?;
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn create_session_from_profile(&self, profile_id: &str) -> Result<Session, ApiError> {
        self.record("create_session_from_profile", profile_id)?;
        let profile = self
            .profiles
            .get(profile_id)
            .map(|p| p.clone())
            .ok_or_else(|| ApiError::NotFound(format!("profile {profile_id}")))?;

        let (Some(reaction_url), Some(external_url)) =
            (&profile.reaction_video_url, &profile.external_video_url)
        else {
            return Err(ApiError::Rejected(
                "profile does not name both videos".to_string(),
            ));
        };

        let mut session = Session::new(
            self.video_for_url(reaction_url),
            self.video_for_url(external_url),
        );
        session.apply_profile(&profile);
        session.validate()?;
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn get_session(&self, id: &SessionId) -> Result<Session, ApiError> {
        self.record("get_session", id.as_str())?;
        self.session(id)
            .ok_or_else(|| ApiError::NotFound(format!("session {id}")))
    }

    async fn get_shared_session(&self, share: &str) -> Result<Session, ApiError> {
        let code = share_code(share);
        self.record("get_shared_session", code)?;
        let id = self
            .shares
            .get(code)
            .map(|id| id.clone())
            .ok_or_else(|| ApiError::NotFound(format!("share {code}")))?;
        self.session(&id)
            .filter(|s| s.is_public)
            .ok_or_else(|| ApiError::NotFound(format!("share {code}")))
    }

    async fn update_session(
        &self,
        id: &SessionId,
        update: &UpdateSessionRequest,
    ) -> Result<Session, ApiError> {
        self.record("update_session", id.as_str())?;
        self.with_session(id, |session| {
            session.apply_update(update)?;
            Ok(session.clone())
        })
    }

    async fn delete_session(&self, id: &SessionId) -> Result<(), ApiError> {
        self.record("delete_session", id.as_str())?;
        self.sessions
            .remove(id)
            .ok_or_else(|| ApiError::NotFound(format!("session {id}")))?;
        self.shares.retain(|_, session| session != id);
        Ok(())
    }

    async fn start_countdown(&self, id: &SessionId) -> Result<Session, ApiError> {
        self.record("start_countdown", id.as_str())?;
        self.with_session(id, |session| {
            session.apply_update(&UpdateSessionRequest {
                countdown_start: Some(true),
                sync_state: Some(SyncState::Syncing),
                ..Default::default()
            })?;
            Ok(session.clone())
        })
    }

    async fn set_timestamp(&self, id: &SessionId, timestamp: f64) -> Result<Session, ApiError> {
        self.record("set_timestamp", id.as_str())?;
        validate_position(timestamp)?;
        self.with_session(id, |session| {
            let external = clamp_position(
                timestamp + session.time_offset,
                session.external_video.duration,
            );
            session.apply_update(&UpdateSessionRequest {
                timestamp_start: Some(Some(timestamp)),
                reaction_position: Some(timestamp),
                external_position: Some(external),
                ..Default::default()
            })?;
            Ok(session.clone())
        })
    }

    async fn report_positions(
        &self,
        id: &SessionId,
        report: PositionReport,
    ) -> Result<PositionAck, ApiError> {
        self.record("report_positions", id.as_str())?;
        self.with_session(id, |session| {
            session.apply_update(&UpdateSessionRequest {
                reaction_position: Some(report.reaction_position),
                external_position: Some(report.external_position),
                ..Default::default()
            })?;
            Ok(PositionAck {
                sync_state: session.sync_state,
                reaction_position: session.reaction_position,
                external_position: session.external_position,
            })
        })
    }

    async fn generate_share_link(&self, id: &SessionId) -> Result<String, ApiError> {
        self.record("generate_share_link", id.as_str())?;
        let link = self.with_session(id, |session| {
            if let Some(link) = &session.shareable_link {
                return Ok(link.clone());
            }
            let code = Uuid::new_v4().simple().to_string()[..10].to_string();
            let link = format!("{}/{}", self.share_base, code);
            session.shareable_link = Some(link.clone());
            session.is_public = true;
            Ok(link)
        })?;
        self.shares.insert(share_code(&link).to_string(), id.clone());
        Ok(link)
    }

    async fn create_profile(&self, request: &CreateProfileRequest) -> Result<Profile, ApiError> {
        self.record("create_profile", "")?;
        let profile = profile_from_request(Profile::new(request.name.clone()), request)?;
        self.profiles.insert(profile.id.clone(), profile.clone());
        Ok(profile)
    }

    async fn get_profile(&self, id: &str) -> Result<Profile, ApiError> {
        self.record("get_profile", id)?;
        self.profiles
            .get(id)
            .map(|p| p.clone())
            .ok_or_else(|| ApiError::NotFound(format!("profile {id}")))
    }

    async fn update_profile(
        &self,
        id: &str,
        request: &CreateProfileRequest,
    ) -> Result<Profile, ApiError> {
        self.record("update_profile", id)?;
        let mut entry = self
            .profiles
            .get_mut(id)
            .ok_or_else(|| ApiError::NotFound(format!("profile {id}")))?;
        let updated = profile_from_request(entry.clone(), request)?;
        *entry = updated.clone();
        Ok(updated)
    }

    async fn delete_profile(&self, id: &str) -> Result<(), ApiError> {
        self.record("delete_profile", id)?;
        self.profiles
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| ApiError::NotFound(format!("profile {id}")))
    }
}
