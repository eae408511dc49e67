//! lockproto - Data and wire types for the Lockstep sync API
//!
//! These are the shapes exchanged with the session persistence service and
//! read by the sync engine:
//!
//! - [`Session`]: a reaction/source video pair plus offset, speed, volumes,
//!   last known positions and the coarse [`SyncState`]
//! - [`Video`]: an immutable reference whose [`SourceType`] selects a backend
//! - [`Profile`]: a named template that can spawn sessions
//!
//! JSON uses camelCase field names and an [`ApiResponse`] envelope.
//!
//! ## Offset convention
//!
//! `position(source) = position(reaction) + time_offset`. A positive offset
//! means the source timeline is ahead of the reaction timeline.

pub mod domain;
pub mod request;
pub mod responses;

pub use domain::{
    validate_offset, validate_position, validate_speed, validate_volume, Profile, Session,
    SessionId, SourceType, SyncState, ValidationError, Video, ViewLayout,
};
pub use request::{
    CreateProfileRequest, CreateSessionRequest, PositionReport, TimestampRequest,
    UpdateSessionRequest,
};
pub use responses::{ApiErrorBody, ApiResponse, PositionAck, ShareLink};
