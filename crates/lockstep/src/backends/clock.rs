//! Monotonic media clock for simulated playback position
//!
//! Advances position from elapsed time scaled by playback rate. Uses
//! `tokio::time::Instant` so paused-time tests drive it deterministically.
//!
//! Every mutating call takes the instant it happens at. Callers read `now`
//! once and pass it through so two clocks sampled together agree.

use tokio::time::Instant;

/// Clock that tracks a media position in seconds.
///
/// While running, the clock remembers `start_instant` (when it was last
/// started or re-anchored) and `start_position`. The position is
/// `start_position + elapsed * rate`.
#[derive(Debug, Clone)]
pub struct MediaClock {
    /// When the clock was last anchored (None if paused)
    start_instant: Option<Instant>,

    /// Position at `start_instant`
    start_position: f64,

    /// Position as of the last pause/seek/tick
    current_position: f64,

    rate: f64,
}

impl Default for MediaClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaClock {
    /// Create a paused clock at position 0, rate 1.
    pub fn new() -> Self {
        Self {
            start_instant: None,
            start_position: 0.0,
            current_position: 0.0,
            rate: 1.0,
        }
    }

    /// Start the clock from the current position.
    pub fn start(&mut self, now: Instant) {
        if self.start_instant.is_none() {
            self.start_instant = Some(now);
            self.start_position = self.current_position;
        }
    }

    pub fn is_running(&self) -> bool {
        self.start_instant.is_some()
    }

    /// Pause without resetting position.
    pub fn pause(&mut self, now: Instant) {
        if self.start_instant.is_some() {
            self.tick(now);
            self.start_instant = None;
        }
    }

    /// Jump to `position`. A running clock keeps running from there.
    pub fn seek(&mut self, position: f64, now: Instant) {
        self.current_position = position;
        self.start_position = position;
        if self.start_instant.is_some() {
            self.start_instant = Some(now);
        }
    }

    /// Change rate. Position accrued so far is kept at the old rate.
    pub fn set_rate(&mut self, rate: f64, now: Instant) {
        if self.start_instant.is_some() {
            self.tick(now);
            self.start_instant = Some(now);
            self.start_position = self.current_position;
        }
        self.rate = rate;
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Position at `now` without mutating.
    pub fn position_at(&self, now: Instant) -> f64 {
        match self.start_instant {
            Some(start) => {
                let elapsed = now.saturating_duration_since(start).as_secs_f64();
                self.start_position + elapsed * self.rate
            }
            None => self.current_position,
        }
    }

    /// Advance the stored position to `now` and return it.
    pub fn tick(&mut self, now: Instant) -> f64 {
        self.current_position = self.position_at(now);
        self.current_position
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_new_clock_at_zero() {
        let clock = MediaClock::new();
        assert_eq!(clock.position_at(Instant::now()), 0.0);
        assert!(!clock.is_running());
    }

    #[test]
    fn test_position_advances_with_rate() {
        let t0 = Instant::now();
        let mut clock = MediaClock::new();
        clock.set_rate(1.5, t0);
        clock.start(t0);

        let pos = clock.tick(t0 + Duration::from_secs(2));
        assert!((pos - 3.0).abs() < 1e-9, "got {pos}");
    }

    #[test]
    fn test_pause_preserves_position() {
        let t0 = Instant::now();
        let mut clock = MediaClock::new();
        clock.start(t0);
        clock.pause(t0 + Duration::from_millis(500));

        let later = t0 + Duration::from_secs(10);
        assert!((clock.position_at(later) - 0.5).abs() < 1e-9);
        assert!(!clock.is_running());
    }

    #[test]
    fn test_seek_while_running_reanchors() {
        let t0 = Instant::now();
        let mut clock = MediaClock::new();
        clock.start(t0);
        clock.seek(30.0, t0 + Duration::from_secs(5));

        assert!(clock.is_running());
        let pos = clock.position_at(t0 + Duration::from_secs(6));
        assert!((pos - 31.0).abs() < 1e-9, "got {pos}");
    }

    #[test]
    fn test_rate_change_mid_playback() {
        let t0 = Instant::now();
        let mut clock = MediaClock::new();
        clock.start(t0);
        clock.set_rate(2.0, t0 + Duration::from_secs(1));

        let pos = clock.position_at(t0 + Duration::from_secs(2));
        assert!((pos - 3.0).abs() < 1e-9, "got {pos}");
    }
}
