//! Dual media controller
//!
//! Owns the two playback handles and applies every transport command to
//! both of them as a pair. If the second half of a pairwise command fails,
//! the first half is rolled back so the streams never end up split (one
//! playing, one paused; or at different rates) because of a command.

use thiserror::Error;
use tracing::{debug, warn};

use crate::handle::{HandleError, PlaybackHandle, Stream};
use crate::offset::clamp_position;

/// Skip distance for the forward/back buttons.
pub const SKIP_SECONDS: f64 = 10.0;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ControllerError {
    #[error("no {0} player is attached")]
    Unavailable(Stream),

    #[error("{0} player is not ready")]
    NotReady(Stream),

    #[error("playback rate must be a positive finite ratio, got {0}")]
    InvalidRate(f64),

    #[error("volume must be a number, got {0}")]
    InvalidVolume(f64),

    #[error("seek distance must be finite, got {0}")]
    InvalidSeek(f64),

    #[error("{stream} player failed: {source}")]
    Backend {
        stream: Stream,
        #[source]
        source: HandleError,
    },
}

impl ControllerError {
    /// Worth retrying once the players settle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ControllerError::Unavailable(_)
                | ControllerError::NotReady(_)
                | ControllerError::Backend { .. }
        )
    }

    fn backend(stream: Stream) -> impl FnOnce(HandleError) -> ControllerError {
        move |source| ControllerError::Backend { stream, source }
    }
}

/// A simultaneous reading of both positions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Positions {
    pub reaction: f64,
    pub source: f64,
}

impl Positions {
    pub fn get(&self, stream: Stream) -> f64 {
        match stream {
            Stream::Reaction => self.reaction,
            Stream::Source => self.source,
        }
    }
}

type Handle = Box<dyn PlaybackHandle>;

pub struct DualMediaController {
    reaction: Option<Handle>,
    source: Option<Handle>,
    playing: bool,
    rate: f64,
}

impl Default for DualMediaController {
    fn default() -> Self {
        Self::new()
    }
}

impl DualMediaController {
    pub fn new() -> Self {
        Self {
            reaction: None,
            source: None,
            playing: false,
            rate: 1.0,
        }
    }

    fn slot(&self, stream: Stream) -> &Option<Handle> {
        match stream {
            Stream::Reaction => &self.reaction,
            Stream::Source => &self.source,
        }
    }

    fn slot_mut(&mut self, stream: Stream) -> &mut Option<Handle> {
        match stream {
            Stream::Reaction => &mut self.reaction,
            Stream::Source => &mut self.source,
        }
    }

    fn handle(&self, stream: Stream) -> Result<&dyn PlaybackHandle, ControllerError> {
        self.slot(stream)
            .as_deref()
            .ok_or(ControllerError::Unavailable(stream))
    }

    fn handle_mut(&mut self, stream: Stream) -> Result<&mut Handle, ControllerError> {
        self.slot_mut(stream)
            .as_mut()
            .ok_or(ControllerError::Unavailable(stream))
    }

    /// Both handles attached and ready.
    pub fn ensure_ready(&self) -> Result<(), ControllerError> {
        for stream in Stream::BOTH {
            if !self.handle(stream)?.is_ready() {
                return Err(ControllerError::NotReady(stream));
            }
        }
        Ok(())
    }

    /// Mount a handle, returning the one it replaces. A ready handle
    /// inherits the shared rate right away; others get it from [`prime`].
    ///
    /// [`prime`]: DualMediaController::prime
    pub fn attach(&mut self, stream: Stream, mut handle: Handle) -> Option<Handle> {
        if self.rate != 1.0 && handle.is_ready() {
            if let Err(e) = handle.set_playback_rate(self.rate) {
                warn!(%stream, rate = self.rate, error = %e, "new handle refused shared rate");
            }
        }
        debug!(%stream, backend = handle.backend(), "handle attached");
        self.slot_mut(stream).replace(handle)
    }

    /// Drop both handles and reset transport state.
    pub fn detach_all(&mut self) {
        self.reaction = None;
        self.source = None;
        self.playing = false;
        self.rate = 1.0;
    }

    /// Record the shared rate without touching the handles, e.g. before
    /// attaching handles for a session with a stored speed.
    pub fn adopt_rate(&mut self, rate: f64) -> Result<(), ControllerError> {
        if !(rate.is_finite() && rate > 0.0) {
            return Err(ControllerError::InvalidRate(rate));
        }
        self.rate = rate;
        Ok(())
    }

    /// Push the shared rate and a volume to a handle that just became ready.
    pub fn prime(&mut self, stream: Stream, volume: f64) -> Result<(), ControllerError> {
        let rate = self.rate;
        let handle = self.handle_mut(stream)?;
        if (handle.playback_rate() - rate).abs() > f64::EPSILON {
            handle
                .set_playback_rate(rate)
                .map_err(ControllerError::backend(stream))?;
        }
        handle
            .set_volume(volume.clamp(0.0, 1.0))
            .map_err(ControllerError::backend(stream))
    }

    pub fn is_attached(&self, stream: Stream) -> bool {
        self.slot(stream).is_some()
    }

    pub fn is_ready(&self, stream: Stream) -> bool {
        self.slot(stream).as_ref().is_some_and(|h| h.is_ready())
    }

    pub fn both_ready(&self) -> bool {
        Stream::BOTH.iter().all(|s| self.is_ready(*s))
    }

    /// Whether the pair was last commanded to play.
    pub fn is_playing(&self) -> bool {
        self.playing
    }

    /// Whether one player is actually playing right now.
    pub fn stream_playing(&self, stream: Stream) -> Option<bool> {
        self.slot(stream).as_ref().map(|h| h.is_playing())
    }

    /// Record that playback stopped without a command.
    pub fn mark_interrupted(&mut self) {
        self.playing = false;
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn position(&self, stream: Stream) -> Option<f64> {
        self.slot(stream).as_ref().map(|h| h.current_time())
    }

    pub fn positions(&self) -> Option<Positions> {
        Some(Positions {
            reaction: self.position(Stream::Reaction)?,
            source: self.position(Stream::Source)?,
        })
    }

    pub fn duration(&self, stream: Stream) -> Option<f64> {
        self.slot(stream).as_ref().and_then(|h| h.duration())
    }

    pub fn volume(&self, stream: Stream) -> Option<f64> {
        self.slot(stream).as_ref().map(|h| h.volume())
    }

    /// Start both players.
    pub fn play(&mut self) -> Result<(), ControllerError> {
        self.ensure_ready()?;

        self.handle_mut(Stream::Reaction)?
            .play()
            .map_err(ControllerError::backend(Stream::Reaction))?;

        if let Err(e) = self.handle_mut(Stream::Source)?.play() {
            if let Err(rollback) = self.handle_mut(Stream::Reaction)?.pause() {
                warn!(error = %rollback, "could not roll back reaction play");
            }
            return Err(ControllerError::backend(Stream::Source)(e));
        }

        self.playing = true;
        Ok(())
    }

    /// Pause both players.
    pub fn pause(&mut self) -> Result<(), ControllerError> {
        self.handle(Stream::Reaction)?;
        self.handle(Stream::Source)?;
        let was_playing = self.playing;

        self.handle_mut(Stream::Reaction)?
            .pause()
            .map_err(ControllerError::backend(Stream::Reaction))?;

        if let Err(e) = self.handle_mut(Stream::Source)?.pause() {
            if was_playing {
                if let Err(rollback) = self.handle_mut(Stream::Reaction)?.play() {
                    warn!(error = %rollback, "could not roll back reaction pause");
                }
            }
            return Err(ControllerError::backend(Stream::Source)(e));
        }

        self.playing = false;
        Ok(())
    }

    /// Move both streams by `delta` seconds, each clamped to its bounds.
    pub fn seek_by(&mut self, delta: f64) -> Result<Positions, ControllerError> {
        if !delta.is_finite() {
            return Err(ControllerError::InvalidSeek(delta));
        }
        self.ensure_ready()?;

        let before = self
            .positions()
            .ok_or(ControllerError::Unavailable(Stream::Reaction))?;
        let target = Positions {
            reaction: clamp_position(before.reaction + delta, self.duration(Stream::Reaction)),
            source: clamp_position(before.source + delta, self.duration(Stream::Source)),
        };

        self.handle_mut(Stream::Reaction)?
            .set_current_time(target.reaction)
            .map_err(ControllerError::backend(Stream::Reaction))?;

        if let Err(e) = self
            .handle_mut(Stream::Source)?
            .set_current_time(target.source)
        {
            if let Err(rollback) = self
                .handle_mut(Stream::Reaction)?
                .set_current_time(before.reaction)
            {
                warn!(error = %rollback, "could not roll back reaction seek");
            }
            return Err(ControllerError::backend(Stream::Source)(e));
        }

        Ok(target)
    }

    /// Seek a single stream, clamped to its bounds. Returns the position
    /// actually requested.
    pub fn seek_to(&mut self, stream: Stream, position: f64) -> Result<f64, ControllerError> {
        if !position.is_finite() {
            return Err(ControllerError::InvalidSeek(position));
        }
        let target = clamp_position(position, self.duration(stream));
        self.handle_mut(stream)?
            .set_current_time(target)
            .map_err(ControllerError::backend(stream))?;
        Ok(target)
    }

    /// Set the shared playback rate on both players.
    pub fn set_rate(&mut self, rate: f64) -> Result<(), ControllerError> {
        if !(rate.is_finite() && rate > 0.0) {
            return Err(ControllerError::InvalidRate(rate));
        }
        let previous = self.rate;

        self.handle_mut(Stream::Reaction)?
            .set_playback_rate(rate)
            .map_err(ControllerError::backend(Stream::Reaction))?;

        if let Err(e) = self.handle_mut(Stream::Source)?.set_playback_rate(rate) {
            if let Err(rollback) = self
                .handle_mut(Stream::Reaction)?
                .set_playback_rate(previous)
            {
                warn!(error = %rollback, "could not roll back reaction rate");
            }
            return Err(ControllerError::backend(Stream::Source)(e));
        }

        self.rate = rate;
        Ok(())
    }

    /// Set one stream's volume, clamped into `0.0..=1.0`. Returns the
    /// applied level.
    pub fn set_volume(&mut self, stream: Stream, level: f64) -> Result<f64, ControllerError> {
        if level.is_nan() {
            return Err(ControllerError::InvalidVolume(level));
        }
        let level = level.clamp(0.0, 1.0);
        self.handle_mut(stream)?
            .set_volume(level)
            .map_err(ControllerError::backend(stream))?;
        Ok(level)
    }
}
