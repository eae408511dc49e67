//! Playback handle abstraction
//!
//! A [`PlaybackHandle`] is the uniform face of one playing video, whatever
//! backend sits behind it. Calls are synchronous and return once the
//! request is accepted. Completion (a seek landing, playback actually
//! starting) arrives later as a [`PlaybackEvent`] through the handle's
//! [`EventSink`].

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::scheduler::SessionEpoch;

/// Which of the two synchronized videos.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stream {
    Reaction,
    Source,
}

impl Stream {
    pub const BOTH: [Stream; 2] = [Stream::Reaction, Stream::Source];

    pub fn other(self) -> Stream {
        match self {
            Stream::Reaction => Stream::Source,
            Stream::Source => Stream::Reaction,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stream::Reaction => "reaction",
            Stream::Source => "source",
        }
    }
}

impl std::fmt::Display for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something a player reports back.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    /// The player can accept commands.
    Ready { stream: Stream },
    /// Periodic position update while playing.
    Progress { stream: Stream, position: f64 },
    Play { stream: Stream },
    Pause { stream: Stream },
    /// A seek landed.
    Seeked { stream: Stream, position: f64 },
    /// Playback stalled on buffering.
    Waiting { stream: Stream },
    Ended { stream: Stream },
    Error { stream: Stream, message: String },
}

impl PlaybackEvent {
    pub fn stream(&self) -> Stream {
        match self {
            PlaybackEvent::Ready { stream }
            | PlaybackEvent::Progress { stream, .. }
            | PlaybackEvent::Play { stream }
            | PlaybackEvent::Pause { stream }
            | PlaybackEvent::Seeked { stream, .. }
            | PlaybackEvent::Waiting { stream }
            | PlaybackEvent::Ended { stream }
            | PlaybackEvent::Error { stream, .. } => *stream,
        }
    }
}

/// An event tagged with the session epoch its handle was opened under.
#[derive(Debug, Clone, PartialEq)]
pub struct StampedEvent {
    pub epoch: SessionEpoch,
    pub event: PlaybackEvent,
}

/// Where a handle sends its events. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventSink {
    epoch: SessionEpoch,
    stream: Stream,
    tx: mpsc::UnboundedSender<StampedEvent>,
}

impl EventSink {
    pub fn new(epoch: SessionEpoch, stream: Stream, tx: mpsc::UnboundedSender<StampedEvent>) -> Self {
        Self { epoch, stream, tx }
    }

    pub fn stream(&self) -> Stream {
        self.stream
    }

    pub fn epoch(&self) -> SessionEpoch {
        self.epoch
    }

    /// Send an event. A closed receiver means the engine is gone; the
    /// event is dropped.
    pub fn emit(&self, event: PlaybackEvent) {
        let _ = self.tx.send(StampedEvent {
            epoch: self.epoch,
            event,
        });
    }
}

/// Errors a backend may return for a command.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HandleError {
    #[error("player is not ready")]
    NotReady,

    #[error("{backend} does not support playback rate {rate}")]
    UnsupportedRate { rate: f64, backend: &'static str },

    #[error("player rejected {operation}: {reason}")]
    Rejected {
        operation: &'static str,
        reason: String,
    },
}

/// Uniform control surface over one playing video.
///
/// Positions are seconds from the start of the media. Implementations
/// report completion of asynchronous work through their [`EventSink`].
pub trait PlaybackHandle: Send {
    /// Short backend name for logs.
    fn backend(&self) -> &'static str;

    fn is_ready(&self) -> bool;

    fn current_time(&self) -> f64;

    /// Request a seek. Completion is signalled by [`PlaybackEvent::Seeked`].
    fn set_current_time(&mut self, seconds: f64) -> Result<(), HandleError>;

    /// Media length, if known yet.
    fn duration(&self) -> Option<f64>;

    fn is_playing(&self) -> bool;

    fn play(&mut self) -> Result<(), HandleError>;

    fn pause(&mut self) -> Result<(), HandleError>;

    fn volume(&self) -> f64;

    fn set_volume(&mut self, level: f64) -> Result<(), HandleError>;

    fn playback_rate(&self) -> f64;

    fn set_playback_rate(&mut self, rate: f64) -> Result<(), HandleError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_other() {
        assert_eq!(Stream::Reaction.other(), Stream::Source);
        assert_eq!(Stream::Source.other(), Stream::Reaction);
    }

    #[test]
    fn test_sink_stamps_epoch() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(SessionEpoch::new(7), Stream::Source, tx);
        sink.emit(PlaybackEvent::Ready {
            stream: sink.stream(),
        });

        let stamped = rx.try_recv().unwrap();
        assert_eq!(stamped.epoch, SessionEpoch::new(7));
        assert_eq!(stamped.event.stream(), Stream::Source);
    }

    #[test]
    fn test_sink_tolerates_closed_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let sink = EventSink::new(SessionEpoch::default(), Stream::Reaction, tx);
        sink.emit(PlaybackEvent::Waiting {
            stream: Stream::Reaction,
        });
    }
}
