//! Native media element backend (uploaded files, direct links)
//!
//! Behaves like an HTML media element: seeks land on the next event turn,
//! progress fires four times a second and rates between 1/16x and 16x are
//! accepted.

use std::time::Duration;

use lockproto::Video;

use super::sim::{BackendProfile, MediaCore, SeekOutcome, SimControl};
use crate::handle::{EventSink, HandleError, PlaybackHandle};

const PROFILE: BackendProfile = BackendProfile {
    name: "native",
    progress_interval: Duration::from_millis(250),
    ready_after: Duration::ZERO,
};

pub struct NativeElement {
    core: MediaCore,
}

impl NativeElement {
    pub const MIN_RATE: f64 = 0.0625;
    pub const MAX_RATE: f64 = 16.0;

    pub fn open(video: &Video, sink: EventSink, hold_unready: bool) -> Self {
        Self {
            core: MediaCore::open(sink, video.duration, PROFILE, hold_unready),
        }
    }

    pub fn control(&self) -> SimControl {
        self.core.control()
    }
}

impl PlaybackHandle for NativeElement {
    fn backend(&self) -> &'static str {
        PROFILE.name
    }

    fn is_ready(&self) -> bool {
        self.core.is_ready()
    }

    fn current_time(&self) -> f64 {
        self.core.position()
    }

    fn set_current_time(&mut self, seconds: f64) -> Result<(), HandleError> {
        if !self.core.is_ready() {
            return Err(HandleError::NotReady);
        }
        if let SeekOutcome::Applied(position) = self.core.seek(seconds)? {
            self.core.emit_seeked(position, Duration::ZERO);
        }
        Ok(())
    }

    fn duration(&self) -> Option<f64> {
        self.core.duration()
    }

    fn is_playing(&self) -> bool {
        self.core.is_playing()
    }

    fn play(&mut self) -> Result<(), HandleError> {
        if !self.core.is_ready() {
            return Err(HandleError::NotReady);
        }
        self.core.play()
    }

    fn pause(&mut self) -> Result<(), HandleError> {
        self.core.pause()
    }

    fn volume(&self) -> f64 {
        self.core.volume()
    }

    fn set_volume(&mut self, level: f64) -> Result<(), HandleError> {
        if !(0.0..=1.0).contains(&level) {
            return Err(HandleError::Rejected {
                operation: "set_volume",
                reason: format!("{level} is outside 0.0..=1.0"),
            });
        }
        self.core.set_volume(level);
        Ok(())
    }

    fn playback_rate(&self) -> f64 {
        self.core.rate()
    }

    fn set_playback_rate(&mut self, rate: f64) -> Result<(), HandleError> {
        if !(Self::MIN_RATE..=Self::MAX_RATE).contains(&rate) {
            return Err(HandleError::UnsupportedRate {
                rate,
                backend: PROFILE.name,
            });
        }
        self.core.set_rate(rate);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{PlaybackEvent, Stream};
    use crate::scheduler::SessionEpoch;
    use lockproto::SourceType;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn test_seek_emits_seeked() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(SessionEpoch::default(), Stream::Reaction, tx);
        let video = Video::new("file:///r.mp4", SourceType::Uploaded).with_duration(60.0);
        let mut element = NativeElement::open(&video, sink, false);

        element.set_current_time(90.0).unwrap();
        assert_eq!(element.current_time(), 60.0, "seek clamps to duration");

        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|s| s.event)
            .collect();
        assert!(events.contains(&PlaybackEvent::Seeked {
            stream: Stream::Reaction,
            position: 60.0
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_bounds() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(SessionEpoch::default(), Stream::Reaction, tx);
        let video = Video::new("file:///r.mp4", SourceType::Uploaded);
        let mut element = NativeElement::open(&video, sink, false);

        assert!(element.set_playback_rate(32.0).is_err());
        element.set_playback_rate(2.0).unwrap();
        assert_eq!(element.playback_rate(), 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_held_element_refuses_play() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(SessionEpoch::default(), Stream::Reaction, tx);
        let video = Video::new("file:///r.mp4", SourceType::Uploaded);
        let mut element = NativeElement::open(&video, sink, true);

        assert!(!element.is_ready());
        assert_eq!(element.play(), Err(HandleError::NotReady));
    }
}
