//! Session sync channel: position reporting and remote reconciliation
//!
//! Reports are throttled to one per report interval and only sent while
//! playing. Acks carry the server's sync state, which is advisory: the
//! engine shows it but never seeks because of it. Remote session changes
//! that matter (offset, pinned timestamp, countdown) are turned into
//! [`RemoteAction`]s for the engine to run locally without echoing them back.

use std::time::Duration;

use lockproto::{PositionAck, PositionReport, Session};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::api::ApiError;
use crate::controller::Positions;

const OFFSET_EPSILON: f64 = 1e-6;

/// At most one report per interval.
#[derive(Debug, Clone)]
pub struct ReportThrottle {
    min_interval: Duration,
    last_sent: Option<Instant>,
}

impl ReportThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_sent: None,
        }
    }

    /// Claim a slot at `now` if one is free.
    pub fn ready(&mut self, now: Instant) -> bool {
        let free = self
            .last_sent
            .map_or(true, |last| now.saturating_duration_since(last) >= self.min_interval);
        if free {
            self.last_sent = Some(now);
        }
        free
    }

    pub fn reset(&mut self) {
        self.last_sent = None;
    }
}

#[derive(Debug)]
pub struct SessionSyncChannel {
    throttle: ReportThrottle,
    sent: u64,
    consecutive_failures: u32,
    last_ack: Option<PositionAck>,
}

impl SessionSyncChannel {
    pub fn new(report_interval: Duration) -> Self {
        Self {
            throttle: ReportThrottle::new(report_interval),
            sent: 0,
            consecutive_failures: 0,
            last_ack: None,
        }
    }

    /// A report to send now, if any.
    pub fn poll_report(
        &mut self,
        now: Instant,
        playing: bool,
        positions: Option<Positions>,
    ) -> Option<PositionReport> {
        if !playing {
            return None;
        }
        let positions = positions?;
        if !self.throttle.ready(now) {
            return None;
        }
        self.sent += 1;
        Some(PositionReport {
            reaction_position: positions.reaction.max(0.0),
            external_position: positions.source.max(0.0),
        })
    }

    pub fn on_ack(&mut self, ack: PositionAck) {
        self.consecutive_failures = 0;
        self.last_ack = Some(ack);
    }

    pub fn on_report_failed(&mut self, error: &ApiError) {
        self.consecutive_failures += 1;
        if self.consecutive_failures == 1 || !error.is_retryable() {
            warn!(error = %error, failures = self.consecutive_failures, "position report failed");
        } else {
            debug!(error = %error, failures = self.consecutive_failures, "position report failed");
        }
    }

    pub fn reports_sent(&self) -> u64 {
        self.sent
    }

    pub fn last_ack(&self) -> Option<&PositionAck> {
        self.last_ack.as_ref()
    }

    pub fn reset(&mut self) {
        self.throttle.reset();
        self.sent = 0;
        self.consecutive_failures = 0;
        self.last_ack = None;
    }
}

/// Local work implied by a remote copy of the session.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteAction {
    /// Show this state; no seeks.
    DisplayState(lockproto::SyncState),
    /// Adopt a new offset.
    Offset(f64),
    /// Adopt a new shared rate.
    Speed(f64),
    /// Re-pin at `timestamp`, or at the current reaction position.
    Repin { timestamp: Option<f64> },
    /// Another participant started a countdown.
    Countdown,
}

/// Diff `remote` against `local` and list what to do, in order.
pub fn reconcile(local: &Session, remote: &Session) -> Vec<RemoteAction> {
    let mut actions = Vec::new();

    let offset_changed = (remote.time_offset - local.time_offset).abs() > OFFSET_EPSILON;
    if offset_changed {
        actions.push(RemoteAction::Offset(remote.time_offset));
    }

    if (remote.playback_speed - local.playback_speed).abs() > OFFSET_EPSILON {
        actions.push(RemoteAction::Speed(remote.playback_speed));
    }

    if remote.countdown_start && !local.countdown_start {
        actions.push(RemoteAction::Countdown);
        return actions;
    }

    let timestamp_changed = match (remote.timestamp_start, local.timestamp_start) {
        (Some(r), Some(l)) => (r - l).abs() > OFFSET_EPSILON,
        (Some(_), None) => true,
        _ => false,
    };
    if timestamp_changed {
        actions.push(RemoteAction::Repin {
            timestamp: remote.timestamp_start,
        });
    } else if offset_changed {
        actions.push(RemoteAction::Repin { timestamp: None });
    } else if remote.sync_state != local.sync_state {
        actions.push(RemoteAction::DisplayState(remote.sync_state));
    }

    actions
}
