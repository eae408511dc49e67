//! Session sync state machine
//!
//! Owns the loaded [`Session`] and is the only place its fields change:
//! every write goes through [`SyncStateMachine::update`]. On top of that it
//! tracks the two sync protocols (countdown and timestamp pinning) and the
//! fallbacks that drop a session out of `synchronized`.
//!
//! ```text
//!   unsynchronized --countdown/pin--> syncing --both streams ok--> synchronized
//!         ^                              |                              |
//!         +---------- failure -----------+---- independent pause ------+
//!                                        |     or correction escalation
//!   (cancel restores the previous state) +
//! ```

use lockproto::{Session, SessionId, SyncState, UpdateSessionRequest, ValidationError};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::handle::Stream;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("a {0} is already in progress")]
    Busy(&'static str),

    #[error("countdown was cancelled")]
    Cancelled,

    #[error("{0} timed out")]
    TimedOut(&'static str),

    #[error("{protocol} failed: {reason}")]
    Failed {
        protocol: &'static str,
        reason: String,
    },
}

/// Result of a state change request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    Changed { from: SyncState, to: SyncState },
}

impl Transition {
    fn between(from: SyncState, to: SyncState) -> Self {
        if from == to {
            Transition::Unchanged
        } else {
            Transition::Changed { from, to }
        }
    }

    pub fn is_changed(&self) -> bool {
        matches!(self, Transition::Changed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Countdown {
    pub remaining: u32,
    pub previous: SyncState,
    /// Ticking has started.
    pub armed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CountdownStep {
    /// No countdown running.
    Idle,
    /// Waiting for the server to acknowledge.
    Waiting,
    Tick(u32),
    /// Reached zero: start both streams.
    Fire,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PendingPin {
    pub timestamp: f64,
    pub reaction_target: f64,
    pub source_target: f64,
    pub reaction_settled: bool,
    pub source_settled: bool,
    pub started_at: Instant,
    pub previous: SyncState,
}

impl PendingPin {
    pub fn target(&self, stream: Stream) -> f64 {
        match stream {
            Stream::Reaction => self.reaction_target,
            Stream::Source => self.source_target,
        }
    }

    /// Settle `stream` if its seek landed on the pin target. Seeks issued
    /// before the pin may still be reporting in.
    fn settle(&mut self, stream: Stream, position: f64, tolerance: f64) -> bool {
        if (position - self.target(stream)).abs() > tolerance {
            return false;
        }
        match stream {
            Stream::Reaction => self.reaction_settled = true,
            Stream::Source => self.source_settled = true,
        }
        true
    }

    fn is_settled(&self) -> bool {
        self.reaction_settled && self.source_settled
    }
}

#[derive(Debug)]
pub struct SyncStateMachine {
    session: Session,
    countdown: Option<Countdown>,
    pin: Option<PendingPin>,
    unusable: Option<String>,
    last_error: Option<String>,
}

impl SyncStateMachine {
    /// Adopt a session. A countdown flag left over from a previous client
    /// is cleared; countdowns do not survive a reload.
    pub fn new(mut session: Session) -> Self {
        session.countdown_start = false;
        if session.sync_state == SyncState::Syncing {
            session.sync_state = SyncState::Unsynchronized;
        }
        Self {
            session,
            countdown: None,
            pin: None,
            unusable: None,
            last_error: None,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session.id
    }

    pub fn sync_state(&self) -> SyncState {
        self.session.sync_state
    }

    pub fn time_offset(&self) -> f64 {
        self.session.time_offset
    }

    pub fn countdown(&self) -> Option<&Countdown> {
        self.countdown.as_ref()
    }

    pub fn pin(&self) -> Option<&PendingPin> {
        self.pin.as_ref()
    }

    pub fn protocol_in_progress(&self) -> bool {
        self.countdown.is_some() || self.pin.is_some()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn unusable_reason(&self) -> Option<&str> {
        self.unusable.as_deref()
    }

    pub fn is_usable(&self) -> bool {
        self.unusable.is_none()
    }

    /// The single write path for session fields.
    pub fn update(&mut self, update: &UpdateSessionRequest) -> Result<(), ValidationError> {
        self.session.apply_update(update)
    }

    pub fn set_shareable_link(&mut self, link: String) {
        self.session.shareable_link = Some(link);
    }

    fn transition(&mut self, to: SyncState, countdown_start: Option<bool>) -> Transition {
        let from = self.session.sync_state;
        let update = UpdateSessionRequest {
            sync_state: Some(to),
            countdown_start,
            ..Default::default()
        };
        if let Err(e) = self.update(&update) {
            warn!(error = %e, "state update rejected");
            return Transition::Unchanged;
        }
        let transition = Transition::between(from, to);
        if transition.is_changed() {
            info!(session = %self.session.id, %from, %to, "sync state changed");
        }
        transition
    }

    fn fail(&mut self, reason: impl Into<String>) -> Transition {
        let reason = reason.into();
        warn!(session = %self.session.id, %reason, "sync failed");
        self.last_error = Some(reason);
        self.transition(SyncState::Unsynchronized, Some(false))
    }

    // ------------------------------------------------------------------
    // Countdown
    // ------------------------------------------------------------------

    pub fn begin_countdown(&mut self, seconds: u32) -> Result<Transition, ProtocolError> {
        self.check_idle()?;
        self.countdown = Some(Countdown {
            remaining: seconds.max(1),
            previous: self.session.sync_state,
            armed: false,
        });
        self.last_error = None;
        Ok(self.transition(SyncState::Syncing, Some(true)))
    }

    /// Start ticking. Returns false when there is nothing to arm.
    pub fn arm_countdown(&mut self) -> bool {
        match self.countdown.as_mut() {
            Some(c) => {
                c.armed = true;
                true
            }
            None => false,
        }
    }

    pub fn countdown_tick(&mut self) -> CountdownStep {
        let Some(countdown) = self.countdown.as_mut() else {
            return CountdownStep::Idle;
        };
        if !countdown.armed {
            return CountdownStep::Waiting;
        }
        countdown.remaining = countdown.remaining.saturating_sub(1);
        if countdown.remaining == 0 {
            CountdownStep::Fire
        } else {
            CountdownStep::Tick(countdown.remaining)
        }
    }

    /// Abort and restore the state from before the countdown.
    pub fn cancel_countdown(&mut self) -> Option<Transition> {
        let countdown = self.countdown.take()?;
        info!(session = %self.session.id, "countdown cancelled");
        Some(self.transition(countdown.previous, Some(false)))
    }

    /// Both streams started (or failed to) after the countdown fired.
    pub fn complete_countdown(&mut self, outcome: Result<(), String>) -> Transition {
        self.countdown = None;
        match outcome {
            Ok(()) => self.transition(SyncState::Synchronized, Some(false)),
            Err(reason) => self.fail(format!("countdown: {reason}")),
        }
    }

    // ------------------------------------------------------------------
    // Timestamp pinning
    // ------------------------------------------------------------------

    pub fn begin_pin(
        &mut self,
        timestamp: f64,
        reaction_target: f64,
        source_target: f64,
        now: Instant,
    ) -> Result<Transition, ProtocolError> {
        self.check_idle()?;
        self.pin = Some(PendingPin {
            timestamp,
            reaction_target,
            source_target,
            reaction_settled: false,
            source_settled: false,
            started_at: now,
            previous: self.session.sync_state,
        });
        self.last_error = None;
        Ok(self.transition(SyncState::Syncing, None))
    }

    /// A seek landed at `position`. Completes the pin once both streams
    /// have settled within `tolerance` of their targets.
    pub fn pin_seeked(
        &mut self,
        stream: Stream,
        position: f64,
        tolerance: f64,
    ) -> Option<Transition> {
        let pin = self.pin.as_mut()?;
        if !pin.settle(stream, position, tolerance) {
            debug!(%stream, position, target = pin.target(stream), "seek is not the pin's");
            return None;
        }
        if !pin.is_settled() {
            return None;
        }
        let pin = self.pin.take()?;

        let update = UpdateSessionRequest {
            timestamp_start: Some(Some(pin.timestamp)),
            reaction_position: Some(pin.reaction_target),
            external_position: Some(pin.source_target),
            ..Default::default()
        };
        if let Err(e) = self.update(&update) {
            return Some(self.fail(format!("pin: {e}")));
        }
        Some(self.transition(SyncState::Synchronized, None))
    }

    pub fn fail_pin(&mut self, reason: impl Into<String>) -> Option<Transition> {
        self.pin.take()?;
        Some(self.fail(format!("pin: {}", reason.into())))
    }

    pub fn pin_expired(&self, now: Instant, timeout: std::time::Duration) -> bool {
        self.pin
            .is_some_and(|p| now.saturating_duration_since(p.started_at) >= timeout)
    }

    // ------------------------------------------------------------------
    // Fallbacks and remote state
    // ------------------------------------------------------------------

    /// Lose sync, e.g. one stream paused on its own.
    pub fn fall_back(&mut self, reason: impl Into<String>) -> Transition {
        if self.session.sync_state != SyncState::Synchronized {
            return Transition::Unchanged;
        }
        self.fail(reason)
    }

    /// Show a state reported by the server. Never overrides a local
    /// protocol in progress.
    pub fn apply_remote_state(&mut self, state: SyncState) -> Transition {
        if self.protocol_in_progress() || !self.is_usable() {
            return Transition::Unchanged;
        }
        self.transition(state, None)
    }

    /// Terminal: the session can't be played here.
    pub fn mark_unusable(&mut self, reason: impl Into<String>) -> Transition {
        let reason = reason.into();
        warn!(session = %self.session.id, %reason, "session unusable");
        self.countdown = None;
        self.pin = None;
        self.unusable = Some(reason.clone());
        self.last_error = Some(reason);
        self.transition(SyncState::Unsynchronized, Some(false))
    }

    pub fn record_error(&mut self, reason: impl Into<String>) {
        self.last_error = Some(reason.into());
    }

    fn check_idle(&self) -> Result<(), ProtocolError> {
        if self.countdown.is_some() {
            return Err(ProtocolError::Busy("countdown"));
        }
        if self.pin.is_some() {
            return Err(ProtocolError::Busy("timestamp pin"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockproto::{SourceType, Video};
    use std::time::Duration;

    fn machine() -> SyncStateMachine {
        SyncStateMachine::new(Session::new(
            Video::new("file:///r.mp4", SourceType::Uploaded),
            Video::new("https://youtu.be/x", SourceType::Youtube),
        ))
    }

    #[test]
    fn test_countdown_ticks_then_fires() {
        let mut sm = machine();
        sm.begin_countdown(3).unwrap();
        assert_eq!(sm.sync_state(), SyncState::Syncing);
        assert!(sm.session().countdown_start);
        assert_eq!(sm.countdown_tick(), CountdownStep::Waiting);

        assert!(sm.arm_countdown());
        assert_eq!(sm.countdown_tick(), CountdownStep::Tick(2));
        assert_eq!(sm.countdown_tick(), CountdownStep::Tick(1));
        assert_eq!(sm.countdown_tick(), CountdownStep::Fire);

        let t = sm.complete_countdown(Ok(()));
        assert_eq!(
            t,
            Transition::Changed {
                from: SyncState::Syncing,
                to: SyncState::Synchronized
            }
        );
        assert!(!sm.session().countdown_start);
        assert_eq!(sm.countdown_tick(), CountdownStep::Idle);
    }

    #[test]
    fn test_cancel_restores_previous_state() {
        let mut sm = machine();
        sm.update(&UpdateSessionRequest {
            sync_state: Some(SyncState::Synchronized),
            ..Default::default()
        })
        .unwrap();

        sm.begin_countdown(3).unwrap();
        sm.arm_countdown();
        sm.countdown_tick();
        sm.cancel_countdown();

        assert_eq!(sm.sync_state(), SyncState::Synchronized);
        assert!(sm.countdown().is_none());
        assert!(sm.cancel_countdown().is_none(), "second cancel is a no-op");
    }

    #[test]
    fn test_failed_start_reverts_to_unsynchronized() {
        let mut sm = machine();
        sm.begin_countdown(1).unwrap();
        sm.complete_countdown(Err("source refused play".into()));
        assert_eq!(sm.sync_state(), SyncState::Unsynchronized);
        assert!(sm.last_error().unwrap().contains("source refused play"));
    }

    #[test]
    fn test_one_protocol_at_a_time() {
        let mut sm = machine();
        sm.begin_countdown(3).unwrap();
        assert_eq!(
            sm.begin_pin(30.0, 30.0, 25.0, Instant::now()),
            Err(ProtocolError::Busy("countdown"))
        );
        assert_eq!(sm.begin_countdown(3), Err(ProtocolError::Busy("countdown")));
    }

    #[test]
    fn test_pin_completes_after_both_seeks() {
        let mut sm = machine();
        sm.begin_pin(30.0, 30.0, 25.0, Instant::now()).unwrap();
        assert_eq!(sm.sync_state(), SyncState::Syncing);

        assert_eq!(sm.pin_seeked(Stream::Source, 25.0, 0.3), None);
        let t = sm.pin_seeked(Stream::Reaction, 30.0, 0.3).unwrap();
        assert!(t.is_changed());
        assert_eq!(sm.sync_state(), SyncState::Synchronized);
        assert_eq!(sm.session().timestamp_start, Some(30.0));
        assert_eq!(sm.session().external_position, 25.0);
    }

    #[test]
    fn test_pin_ignores_seeks_that_miss_the_target() {
        let mut sm = machine();
        sm.begin_pin(50.0, 50.0, 45.0, Instant::now()).unwrap();

        // an earlier skip landing late
        assert_eq!(sm.pin_seeked(Stream::Source, 5.0, 0.3), None);
        assert_eq!(sm.pin_seeked(Stream::Reaction, 50.0, 0.3), None);
        assert_eq!(sm.sync_state(), SyncState::Syncing);
        assert!(!sm.pin().unwrap().source_settled);

        assert!(sm.pin_seeked(Stream::Source, 45.1, 0.3).is_some());
        assert_eq!(sm.sync_state(), SyncState::Synchronized);
    }

    #[test]
    fn test_pin_expiry() {
        let t0 = Instant::now();
        let mut sm = machine();
        sm.begin_pin(10.0, 10.0, 10.0, t0).unwrap();
        assert!(!sm.pin_expired(t0 + Duration::from_secs(1), Duration::from_secs(5)));
        assert!(sm.pin_expired(t0 + Duration::from_secs(5), Duration::from_secs(5)));

        sm.fail_pin("timed out");
        assert_eq!(sm.sync_state(), SyncState::Unsynchronized);
        assert!(sm.pin().is_none());
    }

    #[test]
    fn test_fall_back_only_from_synchronized() {
        let mut sm = machine();
        assert_eq!(sm.fall_back("paused"), Transition::Unchanged);

        sm.begin_pin(0.0, 0.0, 0.0, Instant::now()).unwrap();
        sm.pin_seeked(Stream::Reaction, 0.0, 0.3);
        sm.pin_seeked(Stream::Source, 0.0, 0.3);
        assert!(sm.fall_back("paused").is_changed());
        assert_eq!(sm.sync_state(), SyncState::Unsynchronized);
    }

    #[test]
    fn test_remote_state_does_not_interrupt_local_protocol() {
        let mut sm = machine();
        sm.begin_countdown(3).unwrap();
        assert_eq!(
            sm.apply_remote_state(SyncState::Unsynchronized),
            Transition::Unchanged
        );
        sm.cancel_countdown();
        assert!(sm.apply_remote_state(SyncState::Synchronized).is_changed());
    }

    #[test]
    fn test_reload_clears_stale_countdown() {
        let mut session = machine().session().clone();
        session.countdown_start = true;
        session.sync_state = SyncState::Syncing;
        let sm = SyncStateMachine::new(session);
        assert!(!sm.session().countdown_start);
        assert_eq!(sm.sync_state(), SyncState::Unsynchronized);
    }

    #[test]
    fn test_unusable_is_terminal_for_remote_state() {
        let mut sm = machine();
        sm.mark_unusable("source never became ready");
        assert!(!sm.is_usable());
        assert_eq!(
            sm.apply_remote_state(SyncState::Synchronized),
            Transition::Unchanged
        );
    }
}
