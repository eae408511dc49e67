//! Engine-level errors and their classification.

use lockproto::{SessionId, ValidationError};
use thiserror::Error;

use crate::api::ApiError;
use crate::backends::ResolveError;
use crate::controller::ControllerError;
use crate::state::ProtocolError;

/// How a caller should treat a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Players not ready or a backend hiccup; retry later.
    Transient,
    /// A sync protocol was refused, cancelled or timed out.
    Protocol,
    /// The sync API could not be reached or answered badly.
    Network,
    /// The request itself is invalid.
    InvalidInput,
    /// The session can't be used in this engine.
    Terminal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Network => "network",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Terminal => "terminal",
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no session is loaded")]
    NoSession,

    #[error("session is unusable: {0}")]
    Unusable(String),

    #[error("session {loaded} is loaded, not {requested}")]
    SessionMismatch {
        loaded: SessionId,
        requested: SessionId,
    },

    #[error("superseded by a newer load")]
    Superseded,

    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("engine has shut down")]
    Closed,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::NoSession | EngineError::SessionMismatch { .. } => ErrorKind::InvalidInput,
            EngineError::Unusable(_) | EngineError::Resolve(_) | EngineError::Closed => {
                ErrorKind::Terminal
            }
            EngineError::Superseded | EngineError::Protocol(_) => ErrorKind::Protocol,
            EngineError::Controller(e) if e.is_transient() => ErrorKind::Transient,
            EngineError::Controller(_) | EngineError::Invalid(_) => ErrorKind::InvalidInput,
            EngineError::Api(_) => ErrorKind::Network,
        }
    }
}
