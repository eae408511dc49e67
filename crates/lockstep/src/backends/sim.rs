//! Simulated media shared by the in-process backends
//!
//! [`MediaCore`] owns the state of one simulated player: a [`MediaClock`],
//! readiness, volume and stall/failure knobs. It runs a progress task that
//! emits [`PlaybackEvent::Progress`] while playing, cancelled when the core
//! is dropped. [`SimControl`] is the test/demo side of the same state and
//! can inject stalls, external pauses and rejected commands.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::clock::MediaClock;
use crate::handle::{EventSink, HandleError, PlaybackEvent, Stream};
use crate::offset::clamp_position;

/// Timing characteristics of a backend.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BackendProfile {
    pub name: &'static str,
    pub progress_interval: Duration,
    pub ready_after: Duration,
}

#[derive(Debug)]
struct MediaState {
    clock: MediaClock,
    /// The element is not paused. It may still be stalled.
    playing: bool,
    ready: bool,
    volume: f64,
    duration: Option<f64>,
    stalled_until: Option<Instant>,
    ended: bool,
    ended_unreported: bool,
    unresponsive: bool,
    reject_play: u32,
    reject_seek: u32,
    play_calls: u32,
    pause_calls: u32,
    seek_calls: u32,
}

impl MediaState {
    fn new(duration: Option<f64>) -> Self {
        Self {
            clock: MediaClock::new(),
            playing: false,
            ready: false,
            volume: 1.0,
            duration,
            stalled_until: None,
            ended: false,
            ended_unreported: false,
            unresponsive: false,
            reject_play: 0,
            reject_seek: 0,
            play_calls: 0,
            pause_calls: 0,
            seek_calls: 0,
        }
    }

    fn refresh(&mut self, now: Instant) {
        if let Some(until) = self.stalled_until {
            if until <= now {
                self.stalled_until = None;
                if self.playing {
                    self.clock.start(until);
                }
            }
        }

        if let Some(duration) = self.duration {
            if self.clock.is_running() && self.clock.position_at(now) >= duration {
                self.clock.pause(now);
                self.clock.seek(duration, now);
                self.playing = false;
                self.ended = true;
                self.ended_unreported = true;
            }
        }
    }

    fn position(&mut self, now: Instant) -> f64 {
        self.refresh(now);
        clamp_position(self.clock.position_at(now), self.duration)
    }

    fn is_stalled(&self) -> bool {
        self.stalled_until.is_some()
    }

    fn start(&mut self, now: Instant) {
        self.refresh(now);
        self.playing = true;
        self.ended = false;
        if !self.is_stalled() {
            self.clock.start(now);
        }
    }

    fn stop(&mut self, now: Instant) {
        self.refresh(now);
        self.playing = false;
        self.clock.pause(now);
    }

    fn jump(&mut self, position: f64, now: Instant) -> f64 {
        self.refresh(now);
        let position = clamp_position(position, self.duration);
        self.clock.seek(position, now);
        self.ended = false;
        if self.playing && !self.is_stalled() {
            self.clock.start(now);
        }
        position
    }
}

fn lock_state(state: &Mutex<MediaState>) -> MutexGuard<'_, MediaState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Result of a seek request against the core.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum SeekOutcome {
    /// Position changed; the caller schedules `Seeked`.
    Applied(f64),
    /// Accepted but the player never acts on it.
    Swallowed,
}

pub(crate) struct MediaCore {
    stream: Stream,
    state: Arc<Mutex<MediaState>>,
    sink: EventSink,
    cancel: CancellationToken,
}

impl MediaCore {
    /// Must be called inside a tokio runtime.
    pub(crate) fn open(
        sink: EventSink,
        duration: Option<f64>,
        profile: BackendProfile,
        hold_unready: bool,
    ) -> Self {
        let stream = sink.stream();
        let state = Arc::new(Mutex::new(MediaState::new(duration)));
        let cancel = CancellationToken::new();

        spawn_progress(
            stream,
            state.clone(),
            sink.clone(),
            profile.progress_interval,
            cancel.clone(),
        );

        if !hold_unready {
            if profile.ready_after.is_zero() {
                lock_state(&state).ready = true;
                sink.emit(PlaybackEvent::Ready { stream });
            } else {
                spawn_ready(stream, state.clone(), sink.clone(), profile.ready_after, cancel.clone());
            }
        }

        debug!(%stream, backend = profile.name, ?duration, "simulated media opened");

        Self {
            stream,
            state,
            sink,
            cancel,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MediaState> {
        lock_state(&self.state)
    }

    pub(crate) fn control(&self) -> SimControl {
        SimControl {
            stream: self.stream,
            state: self.state.clone(),
            sink: self.sink.clone(),
        }
    }

    pub(crate) fn stream(&self) -> Stream {
        self.stream
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.lock().ready
    }

    pub(crate) fn position(&self) -> f64 {
        self.lock().position(Instant::now())
    }

    pub(crate) fn duration(&self) -> Option<f64> {
        self.lock().duration
    }

    pub(crate) fn is_playing(&self) -> bool {
        let mut state = self.lock();
        state.refresh(Instant::now());
        state.playing
    }

    pub(crate) fn play(&self) -> Result<(), HandleError> {
        {
            let mut state = self.lock();
            state.play_calls += 1;
            if state.reject_play > 0 {
                state.reject_play -= 1;
                return Err(HandleError::Rejected {
                    operation: "play",
                    reason: "playback was blocked".to_string(),
                });
            }
            if state.playing {
                return Ok(());
            }
            state.start(Instant::now());
        }
        self.sink.emit(PlaybackEvent::Play {
            stream: self.stream,
        });
        Ok(())
    }

    pub(crate) fn pause(&self) -> Result<(), HandleError> {
        {
            let mut state = self.lock();
            state.pause_calls += 1;
            if !state.playing {
                return Ok(());
            }
            state.stop(Instant::now());
        }
        self.sink.emit(PlaybackEvent::Pause {
            stream: self.stream,
        });
        Ok(())
    }

    pub(crate) fn seek(&self, position: f64) -> Result<SeekOutcome, HandleError> {
        let mut state = self.lock();
        state.seek_calls += 1;
        if state.reject_seek > 0 {
            state.reject_seek -= 1;
            return Err(HandleError::Rejected {
                operation: "seek",
                reason: "seek was refused".to_string(),
            });
        }
        if state.unresponsive {
            return Ok(SeekOutcome::Swallowed);
        }
        Ok(SeekOutcome::Applied(state.jump(position, Instant::now())))
    }

    /// Emit `Seeked` after `delay`, or right away for a zero delay.
    pub(crate) fn emit_seeked(&self, position: f64, delay: Duration) {
        let event = PlaybackEvent::Seeked {
            stream: self.stream,
            position,
        };
        if delay.is_zero() {
            self.sink.emit(event);
            return;
        }

        let sink = self.sink.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => sink.emit(event),
            }
        });
    }

    pub(crate) fn volume(&self) -> f64 {
        self.lock().volume
    }

    pub(crate) fn set_volume(&self, level: f64) {
        self.lock().volume = level;
    }

    pub(crate) fn rate(&self) -> f64 {
        self.lock().clock.rate()
    }

    pub(crate) fn set_rate(&self, rate: f64) {
        let mut state = self.lock();
        let now = Instant::now();
        state.refresh(now);
        state.clock.set_rate(rate, now);
    }
}

impl Drop for MediaCore {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn spawn_progress(
    stream: Stream,
    state: Arc<Mutex<MediaState>>,
    sink: EventSink,
    every: Duration,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let (position, ended, progressing) = {
                        let mut s = lock_state(&state);
                        let position = s.position(Instant::now());
                        let ended = std::mem::take(&mut s.ended_unreported);
                        (position, ended, s.ready && s.playing && !s.is_stalled())
                    };

                    if ended {
                        sink.emit(PlaybackEvent::Pause { stream });
                        sink.emit(PlaybackEvent::Ended { stream });
                    } else if progressing {
                        trace!(%stream, position, "progress");
                        sink.emit(PlaybackEvent::Progress { stream, position });
                    }
                }
            }
        }
    });
}

fn spawn_ready(
    stream: Stream,
    state: Arc<Mutex<MediaState>>,
    sink: EventSink,
    after: Duration,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(after) => {
                lock_state(&state).ready = true;
                sink.emit(PlaybackEvent::Ready { stream });
            }
        }
    });
}

/// Outside control over a simulated player, for tests and the demo.
#[derive(Clone)]
pub struct SimControl {
    stream: Stream,
    state: Arc<Mutex<MediaState>>,
    sink: EventSink,
}

impl std::fmt::Debug for SimControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimControl")
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}

impl SimControl {
    fn lock(&self) -> MutexGuard<'_, MediaState> {
        lock_state(&self.state)
    }

    pub fn stream(&self) -> Stream {
        self.stream
    }

    pub fn position(&self) -> f64 {
        self.lock().position(Instant::now())
    }

    pub fn is_playing(&self) -> bool {
        let mut state = self.lock();
        state.refresh(Instant::now());
        state.playing
    }

    pub fn is_ready(&self) -> bool {
        self.lock().ready
    }

    pub fn rate(&self) -> f64 {
        self.lock().clock.rate()
    }

    pub fn volume(&self) -> f64 {
        self.lock().volume
    }

    pub fn play_calls(&self) -> u32 {
        self.lock().play_calls
    }

    pub fn pause_calls(&self) -> u32 {
        self.lock().pause_calls
    }

    pub fn seek_calls(&self) -> u32 {
        self.lock().seek_calls
    }

    /// Freeze playback for `duration` as if buffering.
    pub fn stall_for(&self, duration: Duration) {
        {
            let mut state = self.lock();
            let now = Instant::now();
            state.refresh(now);
            state.clock.pause(now);
            let until = now + duration;
            state.stalled_until = Some(state.stalled_until.map_or(until, |u| u.max(until)));
        }
        self.sink.emit(PlaybackEvent::Waiting {
            stream: self.stream,
        });
    }

    /// Pause from inside the player, bypassing the engine.
    pub fn pause_externally(&self) {
        self.lock().stop(Instant::now());
        self.sink.emit(PlaybackEvent::Pause {
            stream: self.stream,
        });
    }

    pub fn play_externally(&self) {
        self.lock().start(Instant::now());
        self.sink.emit(PlaybackEvent::Play {
            stream: self.stream,
        });
    }

    pub fn set_ready(&self, ready: bool) {
        self.lock().ready = ready;
        if ready {
            self.sink.emit(PlaybackEvent::Ready {
                stream: self.stream,
            });
        }
    }

    pub fn reject_next_play(&self, count: u32) {
        self.lock().reject_play = count;
    }

    pub fn reject_next_seek(&self, count: u32) {
        self.lock().reject_seek = count;
    }

    /// Accept seeks without ever acting on them.
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.lock().unresponsive = unresponsive;
    }

    /// Shift the position without emitting `Seeked`.
    pub fn nudge(&self, delta: f64) {
        let mut state = self.lock();
        let now = Instant::now();
        let position = state.position(now);
        state.jump(position + delta, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::SessionEpoch;
    use tokio::sync::mpsc;

    const PROFILE: BackendProfile = BackendProfile {
        name: "test",
        progress_interval: Duration::from_millis(250),
        ready_after: Duration::ZERO,
    };

    fn open(duration: Option<f64>) -> (MediaCore, mpsc::UnboundedReceiver<crate::handle::StampedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(SessionEpoch::default(), Stream::Source, tx);
        (MediaCore::open(sink, duration, PROFILE, false), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_immediately_with_zero_delay() {
        let (core, mut rx) = open(None);
        assert!(core.is_ready());
        let first = rx.recv().await.unwrap();
        assert_eq!(first.event, PlaybackEvent::Ready { stream: Stream::Source });
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_freezes_position() {
        let (core, _rx) = open(None);
        let control = core.control();
        core.play().unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        control.stall_for(Duration::from_millis(500));
        tokio::time::sleep(Duration::from_secs(1)).await;

        let pos = control.position();
        assert!((pos - 1.5).abs() < 1e-6, "got {pos}");
        assert!(control.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_playback_stops_at_duration() {
        let (core, mut rx) = open(Some(2.0));
        core.play().unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(!core.is_playing());
        assert_eq!(core.position(), 2.0);

        let mut saw_ended = false;
        while let Ok(stamped) = rx.try_recv() {
            if matches!(stamped.event, PlaybackEvent::Ended { .. }) {
                saw_ended = true;
            }
        }
        assert!(saw_ended);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_play_counts_call() {
        let (core, _rx) = open(None);
        let control = core.control();
        control.reject_next_play(1);

        assert!(core.play().is_err());
        assert!(core.play().is_ok());
        assert_eq!(control.play_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_swallows_seek() {
        let (core, _rx) = open(None);
        core.control().set_unresponsive(true);
        assert_eq!(core.seek(10.0).unwrap(), SeekOutcome::Swallowed);
        assert_eq!(core.position(), 0.0);
    }
}
