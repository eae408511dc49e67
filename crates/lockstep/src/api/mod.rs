//! Session persistence API
//!
//! [`SessionApi`] is the engine's only view of the server. [`HttpSessionApi`]
//! talks to the real service; [`InMemorySessionApi`] keeps everything in
//! process for the demo and tests.

mod http;
mod memory;

pub use http::HttpSessionApi;
pub use memory::InMemorySessionApi;

use async_trait::async_trait;
use lockproto::{
    CreateProfileRequest, CreateSessionRequest, PositionAck, PositionReport, Profile, Session,
    SessionId, UpdateSessionRequest, ValidationError,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid response: {0}")]
    Decode(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),
}

impl ApiError {
    /// A later identical request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Transport(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ApiError::Status { status, .. } => *status >= 500 || *status == 429,
            ApiError::Unavailable(_) => true,
            ApiError::NotFound(_) | ApiError::Decode(_) | ApiError::Rejected(_) => false,
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        ApiError::Rejected(e.to_string())
    }
}

/// The code at the end of a share link. A bare code is returned as is.
pub(crate) fn share_code(link_or_code: &str) -> &str {
    link_or_code
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(link_or_code)
}

/// Server operations on sessions and profiles.
#[async_trait]
pub trait SessionApi: Send + Sync {
    async fn create_session(&self, request: &CreateSessionRequest) -> Result<Session, ApiError>;

    async fn create_session_from_profile(&self, profile_id: &str) -> Result<Session, ApiError>;

    async fn get_session(&self, id: &SessionId) -> Result<Session, ApiError>;

    /// Resolve a share code to its session.
    async fn get_shared_session(&self, share_code: &str) -> Result<Session, ApiError>;

    async fn update_session(
        &self,
        id: &SessionId,
        update: &UpdateSessionRequest,
    ) -> Result<Session, ApiError>;

    async fn delete_session(&self, id: &SessionId) -> Result<(), ApiError>;

    /// Tell other participants a countdown has started.
    async fn start_countdown(&self, id: &SessionId) -> Result<Session, ApiError>;

    async fn set_timestamp(&self, id: &SessionId, timestamp: f64) -> Result<Session, ApiError>;

    /// Idempotent position report. The ack carries the server's view of
    /// the sync state.
    async fn report_positions(
        &self,
        id: &SessionId,
        report: PositionReport,
    ) -> Result<PositionAck, ApiError>;

    async fn generate_share_link(&self, id: &SessionId) -> Result<String, ApiError>;

    async fn create_profile(&self, request: &CreateProfileRequest) -> Result<Profile, ApiError>;

    async fn get_profile(&self, id: &str) -> Result<Profile, ApiError>;

    async fn update_profile(
        &self,
        id: &str,
        request: &CreateProfileRequest,
    ) -> Result<Profile, ApiError>;

    async fn delete_profile(&self, id: &str) -> Result<(), ApiError>;
}
