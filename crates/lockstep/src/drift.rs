//! Drift detection and correction
//!
//! Compares the observed offset between the streams against the configured
//! one on every sampler tick. When they diverge by more than the tolerance,
//! the lagging stream is re-seeked to where the leading one says it should
//! be. While that seek is in flight the corrector is guarded; once it lands
//! a cooldown starts. A correction that does not land in time, or leaves
//! the streams still apart after the cooldown, counts as a failure; enough
//! consecutive failures escalate.
//!
//! While one stream's offset-mapped position lies outside its range (the
//! source has not started yet in the reaction's timeline, or has already
//! ended) nothing is corrected. When the mapping comes back into range,
//! that stream is the one re-seeked, so the other keeps its place.

use std::time::Duration;

use lockconf::SyncConfig;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::controller::Positions;
use crate::handle::Stream;
use crate::offset::{self, target_position};

#[derive(Debug, Clone, PartialEq)]
pub struct DriftConfig {
    pub tolerance: f64,
    pub cooldown: Duration,
    pub seek_timeout: Duration,
    pub max_failures: u32,
}

impl From<&SyncConfig> for DriftConfig {
    fn from(sync: &SyncConfig) -> Self {
        Self {
            tolerance: sync.drift_tolerance,
            cooldown: sync.correction_cooldown(),
            seek_timeout: sync.seek_timeout(),
            max_failures: sync.max_correction_failures.max(1),
        }
    }
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

/// A corrective seek in flight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correction {
    pub stream: Stream,
    pub target: f64,
    pub drift: f64,
    pub issued_at: Instant,
}

/// What the sampler should do after a measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DriftVerdict {
    /// Not playing; nothing measured.
    Idle,
    /// A correction is in flight or cooling down.
    Settling { drift: f64 },
    InSync { drift: f64 },
    /// Out of tolerance, but one stream's offset-mapped position is
    /// clamped (e.g. the source has not started yet).
    Unreachable { drift: f64 },
    /// Seek `stream` to `target`.
    Correct { stream: Stream, target: f64, drift: f64 },
    /// Corrections keep failing.
    Escalate { failures: u32, drift: f64 },
}

impl DriftVerdict {
    pub fn drift(&self) -> Option<f64> {
        match self {
            DriftVerdict::Idle => None,
            DriftVerdict::Settling { drift }
            | DriftVerdict::InSync { drift }
            | DriftVerdict::Unreachable { drift }
            | DriftVerdict::Correct { drift, .. }
            | DriftVerdict::Escalate { drift, .. } => Some(*drift),
        }
    }
}

#[derive(Debug)]
pub struct DriftCorrector {
    config: DriftConfig,
    active: bool,
    guard: Option<Correction>,
    /// Stream that was outside its mapped range at the last sample.
    clamped: Option<Stream>,
    cooldown_until: Option<Instant>,
    verify_pending: bool,
    consecutive_failures: u32,
    escalated: bool,
    corrections: u64,
}

impl DriftCorrector {
    pub fn new(config: DriftConfig) -> Self {
        Self {
            config,
            active: false,
            guard: None,
            clamped: None,
            cooldown_until: None,
            verify_pending: false,
            consecutive_failures: 0,
            escalated: false,
            corrections: 0,
        }
    }

    pub fn config(&self) -> &DriftConfig {
        &self.config
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn in_flight(&self) -> Option<&Correction> {
        self.guard.as_ref()
    }

    pub fn failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn corrections(&self) -> u64 {
        self.corrections
    }

    /// Start sampling, e.g. when both streams begin playing.
    pub fn resume(&mut self) {
        self.active = true;
        self.guard = None;
        self.clamped = None;
        self.cooldown_until = None;
        self.verify_pending = false;
    }

    /// Stop sampling and drop any in-flight correction.
    pub fn stop(&mut self) {
        self.active = false;
        self.guard = None;
        self.clamped = None;
        self.cooldown_until = None;
        self.verify_pending = false;
    }

    /// A user action moved the streams. Forget the in-flight correction
    /// and failure streak and measure again after the cooldown.
    pub fn supersede(&mut self, now: Instant) {
        if let Some(c) = self.guard.take() {
            debug!(stream = %c.stream, "correction superseded by user action");
        }
        self.clamped = None;
        self.verify_pending = false;
        self.consecutive_failures = 0;
        self.escalated = false;
        self.cooldown_until = Some(now + self.config.cooldown);
    }

    /// Whether position updates reflect settled playback. Neither stream's
    /// updates count while a correction is in flight.
    pub fn accepts_time_updates(&self) -> bool {
        self.guard.is_none()
    }

    /// A seek landed. Returns true if it was ours.
    pub fn on_seeked(&mut self, stream: Stream, now: Instant) -> bool {
        match self.guard {
            Some(c) if c.stream == stream => {
                self.guard = None;
                self.cooldown_until = Some(now + self.config.cooldown);
                self.verify_pending = true;
                debug!(%stream, target = c.target, "correction settled");
                true
            }
            _ => false,
        }
    }

    /// The correction seek could not even be issued.
    pub fn abandon(&mut self, now: Instant) -> Option<DriftVerdict> {
        let c = self.guard.take()?;
        self.cooldown_until = Some(now + self.config.cooldown);
        self.record_failure(c.drift)
    }

    fn record_failure(&mut self, drift: f64) -> Option<DriftVerdict> {
        self.consecutive_failures += 1;
        warn!(
            failures = self.consecutive_failures,
            drift, "drift correction failed"
        );
        if self.consecutive_failures >= self.config.max_failures && !self.escalated {
            self.escalated = true;
            return Some(DriftVerdict::Escalate {
                failures: self.consecutive_failures,
                drift,
            });
        }
        None
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.escalated = false;
    }

    /// Measure and decide. `durations` are `(reaction, source)`.
    pub fn sample(
        &mut self,
        now: Instant,
        positions: Positions,
        time_offset: f64,
        durations: (Option<f64>, Option<f64>),
    ) -> DriftVerdict {
        if !self.active {
            return DriftVerdict::Idle;
        }
        let drift = offset::drift(positions.reaction, positions.source, time_offset);

        if let Some(c) = self.guard {
            if now.saturating_duration_since(c.issued_at) < self.config.seek_timeout {
                return DriftVerdict::Settling { drift };
            }
            self.guard = None;
            if let Some(escalate) = self.record_failure(drift) {
                return escalate;
            }
        }

        if self.cooldown_until.is_some_and(|until| now < until) {
            return DriftVerdict::Settling { drift };
        }
        self.cooldown_until = None;

        let out_of_tolerance = drift.abs() > self.config.tolerance;

        if std::mem::take(&mut self.verify_pending) {
            if out_of_tolerance {
                if let Some(escalate) = self.record_failure(drift) {
                    return escalate;
                }
            } else {
                self.record_success();
            }
        }

        if !out_of_tolerance {
            if !self.escalated {
                self.consecutive_failures = 0;
            }
            self.clamped = None;
            return DriftVerdict::InSync { drift };
        }

        if let Some(stream) = outside_mapped_range(positions, time_offset, durations) {
            if self.clamped.replace(stream).is_none() {
                debug!(%stream, drift, "offset maps outside the stream, holding corrections");
            }
            return DriftVerdict::Unreachable { drift };
        }

        // A stream that ran while clamped is out of place, not the other.
        let corrected = match self.clamped.take() {
            Some(stream) => stream,
            None if drift > 0.0 => Stream::Reaction,
            None => Stream::Source,
        };
        let duration = match corrected {
            Stream::Reaction => durations.0,
            Stream::Source => durations.1,
        };
        let target = target_position(
            corrected.other(),
            positions.get(corrected.other()),
            time_offset,
            duration,
        );

        if (positions.get(corrected) - target).abs() <= self.config.tolerance {
            return DriftVerdict::Unreachable { drift };
        }

        self.guard = Some(Correction {
            stream: corrected,
            target,
            drift,
            issued_at: now,
        });
        self.corrections += 1;
        info!(stream = %corrected, drift, target, "correcting drift");
        DriftVerdict::Correct {
            stream: corrected,
            target,
            drift,
        }
    }
}

/// The stream whose position, mapped from the other through the offset,
/// falls before its start or past its known end.
fn outside_mapped_range(
    positions: Positions,
    time_offset: f64,
    durations: (Option<f64>, Option<f64>),
) -> Option<Stream> {
    let outside = |position: f64, duration: Option<f64>| {
        position < 0.0 || duration.is_some_and(|d| position > d)
    };
    if outside(positions.reaction + time_offset, durations.1) {
        Some(Stream::Source)
    } else if outside(positions.source - time_offset, durations.0) {
        Some(Stream::Reaction)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corrector() -> DriftCorrector {
        let mut c = DriftCorrector::new(DriftConfig {
            tolerance: 0.3,
            cooldown: Duration::from_secs(2),
            seek_timeout: Duration::from_secs(3),
            max_failures: 2,
        });
        c.resume();
        c
    }

    fn at(reaction: f64, source: f64) -> Positions {
        Positions { reaction, source }
    }

    #[test]
    fn test_idle_until_resumed() {
        let mut c = DriftCorrector::new(DriftConfig::default());
        assert_eq!(
            c.sample(Instant::now(), at(0.0, 9.0), 0.0, (None, None)),
            DriftVerdict::Idle
        );
    }

    #[test]
    fn test_within_tolerance_is_in_sync() {
        let mut c = corrector();
        let verdict = c.sample(Instant::now(), at(10.0, 5.2), -5.0, (None, None));
        assert!(matches!(verdict, DriftVerdict::InSync { .. }));
    }

    #[test]
    fn test_lagging_source_is_seeked_forward() {
        let mut c = corrector();
        let verdict = c.sample(Instant::now(), at(10.0, 4.0), -5.0, (None, None));
        assert_eq!(
            verdict,
            DriftVerdict::Correct {
                stream: Stream::Source,
                target: 5.0,
                drift: -1.0
            }
        );
    }

    #[test]
    fn test_lagging_reaction_is_seeked_forward() {
        let mut c = corrector();
        let verdict = c.sample(Instant::now(), at(10.0, 16.0), 5.0, (None, None));
        assert_eq!(
            verdict,
            DriftVerdict::Correct {
                stream: Stream::Reaction,
                target: 11.0,
                drift: 1.0
            }
        );
    }

    #[test]
    fn test_guard_blocks_until_seeked_then_cooldown() {
        let t0 = Instant::now();
        let mut c = corrector();
        assert!(matches!(
            c.sample(t0, at(10.0, 4.0), -5.0, (None, None)),
            DriftVerdict::Correct { .. }
        ));
        assert!(!c.accepts_time_updates());

        let t1 = t0 + Duration::from_secs(1);
        assert!(matches!(
            c.sample(t1, at(11.0, 5.0), -5.0, (None, None)),
            DriftVerdict::Settling { .. }
        ));

        assert!(!c.on_seeked(Stream::Reaction, t1), "not our seek");
        assert!(c.on_seeked(Stream::Source, t1));

        let t2 = t1 + Duration::from_secs(1);
        assert!(matches!(
            c.sample(t2, at(12.0, 7.0), -5.0, (None, None)),
            DriftVerdict::Settling { .. }
        ));

        let t3 = t1 + Duration::from_secs(2);
        assert!(matches!(
            c.sample(t3, at(13.0, 8.0), -5.0, (None, None)),
            DriftVerdict::InSync { .. }
        ));
        assert_eq!(c.failures(), 0);
    }

    #[test]
    fn test_unreachable_target_is_not_chased() {
        let mut c = corrector();
        // source already sits at its end
        let verdict = c.sample(Instant::now(), at(60.0, 50.0), 0.0, (None, Some(50.0)));
        assert!(matches!(verdict, DriftVerdict::Unreachable { .. }));
        assert!(c.in_flight().is_none());
    }

    #[test]
    fn test_source_pre_roll_holds_then_reseeks_source() {
        let t0 = Instant::now();
        let mut c = corrector();

        // Reaction at 3s, source due at 5s: the source started early from 0.
        let verdict = c.sample(t0, at(3.0, 1.0), -5.0, (Some(600.0), Some(600.0)));
        assert!(matches!(verdict, DriftVerdict::Unreachable { .. }));
        assert!(c.in_flight().is_none());

        // Source is now due but 3s ahead; it goes back, the reaction stays.
        let verdict = c.sample(
            t0 + Duration::from_secs(3),
            at(6.0, 4.0),
            -5.0,
            (Some(600.0), Some(600.0)),
        );
        assert_eq!(
            verdict,
            DriftVerdict::Correct {
                stream: Stream::Source,
                target: 1.0,
                drift: 3.0
            }
        );
    }

    #[test]
    fn test_reaction_pre_roll_is_not_chased() {
        let mut c = corrector();
        // Source at 2s, reaction starts at source 5s.
        let verdict = c.sample(Instant::now(), at(1.0, 2.0), 5.0, (None, None));
        assert!(matches!(verdict, DriftVerdict::Unreachable { .. }));
    }

    #[test]
    fn test_seek_timeouts_escalate_once() {
        let t0 = Instant::now();
        let mut c = corrector();
        let timeout = Duration::from_secs(3);

        assert!(matches!(
            c.sample(t0, at(10.0, 4.0), -5.0, (None, None)),
            DriftVerdict::Correct { .. }
        ));
        // first timeout: failure 1, re-issued
        let t1 = t0 + timeout;
        assert!(matches!(
            c.sample(t1, at(13.0, 4.0), -5.0, (None, None)),
            DriftVerdict::Correct { .. }
        ));
        assert_eq!(c.failures(), 1);

        let t2 = t1 + timeout;
        assert!(matches!(
            c.sample(t2, at(16.0, 4.0), -5.0, (None, None)),
            DriftVerdict::Escalate { failures: 2, .. }
        ));

        // keeps trying, but does not escalate again
        let t3 = t2 + Duration::from_secs(1);
        assert!(matches!(
            c.sample(t3, at(17.0, 4.0), -5.0, (None, None)),
            DriftVerdict::Correct { .. }
        ));
        let t4 = t3 + timeout;
        assert!(matches!(
            c.sample(t4, at(20.0, 4.0), -5.0, (None, None)),
            DriftVerdict::Correct { .. }
        ));
    }

    #[test]
    fn test_supersede_clears_guard_and_streak() {
        let t0 = Instant::now();
        let mut c = corrector();
        c.sample(t0, at(10.0, 4.0), -5.0, (None, None));
        c.supersede(t0);

        assert!(c.in_flight().is_none());
        assert!(c.accepts_time_updates());
        assert!(matches!(
            c.sample(t0 + Duration::from_secs(1), at(10.0, 4.0), -5.0, (None, None)),
            DriftVerdict::Settling { .. }
        ));
    }
}
