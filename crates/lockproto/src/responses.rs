//! Response envelopes returned by the sync API.

use serde::{Deserialize, Serialize};

use crate::domain::SyncState;

/// Every API response is wrapped in this envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            message: String::new(),
            data,
        }
    }
}

/// Error body. Only `message` is relied upon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub success: bool,
    pub message: String,
}

/// Answer to a position report. `sync_state` is authoritative and may differ
/// from what this client believes, e.g. after another participant re-synced.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionAck {
    pub sync_state: SyncState,
    pub reaction_position: f64,
    pub external_position: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareLink {
    pub shareable_link: String,
}
