//! Hosted embed backend (YouTube, Vimeo)
//!
//! The embed API needs time to load before it accepts commands and only
//! reports duration once loaded. Seeks complete after a round trip to the
//! iframe, progress fires once per second and each provider has its own
//! set of playback rates.

use std::time::Duration;

use lockproto::{SourceType, Video};

use super::sim::{BackendProfile, MediaCore, SeekOutcome, SimControl};
use crate::handle::{EventSink, HandleError, PlaybackHandle};

pub const DEFAULT_READY_AFTER: Duration = Duration::from_millis(500);
pub const DEFAULT_SEEK_LATENCY: Duration = Duration::from_millis(200);

/// Timing knobs for an embed.
#[derive(Debug, Clone, Copy)]
pub struct EmbedTiming {
    pub ready_after: Duration,
    pub seek_latency: Duration,
}

impl Default for EmbedTiming {
    fn default() -> Self {
        Self {
            ready_after: DEFAULT_READY_AFTER,
            seek_latency: DEFAULT_SEEK_LATENCY,
        }
    }
}

pub struct EmbeddedPlayer {
    core: MediaCore,
    provider: SourceType,
    seek_latency: Duration,
}

impl EmbeddedPlayer {
    pub fn open(video: &Video, sink: EventSink, timing: EmbedTiming, hold_unready: bool) -> Self {
        let profile = BackendProfile {
            name: backend_name(video.source_type),
            progress_interval: Duration::from_secs(1),
            ready_after: timing.ready_after,
        };
        Self {
            core: MediaCore::open(sink, video.duration, profile, hold_unready),
            provider: video.source_type,
            seek_latency: timing.seek_latency,
        }
    }

    pub fn control(&self) -> SimControl {
        self.core.control()
    }

    /// Rates the provider's player accepts.
    pub fn rate_range(provider: SourceType) -> (f64, f64) {
        match provider {
            SourceType::Vimeo => (0.5, 2.0),
            _ => (0.25, 2.0),
        }
    }

    fn require_ready(&self) -> Result<(), HandleError> {
        if self.core.is_ready() {
            Ok(())
        } else {
            Err(HandleError::NotReady)
        }
    }
}

fn backend_name(provider: SourceType) -> &'static str {
    match provider {
        SourceType::Vimeo => "vimeo",
        _ => "youtube",
    }
}

impl PlaybackHandle for EmbeddedPlayer {
    fn backend(&self) -> &'static str {
        backend_name(self.provider)
    }

    fn is_ready(&self) -> bool {
        self.core.is_ready()
    }

    fn current_time(&self) -> f64 {
        self.core.position()
    }

    fn set_current_time(&mut self, seconds: f64) -> Result<(), HandleError> {
        self.require_ready()?;
        if let SeekOutcome::Applied(position) = self.core.seek(seconds)? {
            tracing::trace!(stream = %self.core.stream(), position, "embed seek in flight");
            self.core.emit_seeked(position, self.seek_latency);
        }
        Ok(())
    }

    fn duration(&self) -> Option<f64> {
        if self.core.is_ready() {
            self.core.duration()
        } else {
            None
        }
    }

    fn is_playing(&self) -> bool {
        self.core.is_playing()
    }

    fn play(&mut self) -> Result<(), HandleError> {
        self.require_ready()?;
        self.core.play()
    }

    fn pause(&mut self) -> Result<(), HandleError> {
        self.require_ready()?;
        self.core.pause()
    }

    fn volume(&self) -> f64 {
        self.core.volume()
    }

    fn set_volume(&mut self, level: f64) -> Result<(), HandleError> {
        self.require_ready()?;
        // Embeds take 0..100 and round.
        let level = (level.clamp(0.0, 1.0) * 100.0).round() / 100.0;
        self.core.set_volume(level);
        Ok(())
    }

    fn playback_rate(&self) -> f64 {
        self.core.rate()
    }

    fn set_playback_rate(&mut self, rate: f64) -> Result<(), HandleError> {
        self.require_ready()?;
        let (min, max) = Self::rate_range(self.provider);
        if !(min..=max).contains(&rate) {
            return Err(HandleError::UnsupportedRate {
                rate,
                backend: self.backend(),
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
    use tokio::sync::mpsc;

    fn youtube() -> Video {
        Video::new("https://youtu.be/abc", SourceType::Youtube).with_duration(300.0)
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_wait_for_embed_load() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(SessionEpoch::default(), Stream::Source, tx);
        let mut player = EmbeddedPlayer::open(&youtube(), sink, EmbedTiming::default(), false);

        assert_eq!(player.play(), Err(HandleError::NotReady));
        assert_eq!(player.duration(), None);

        tokio::time::sleep(DEFAULT_READY_AFTER + Duration::from_millis(1)).await;
        assert!(player.is_ready());
        assert_eq!(player.duration(), Some(300.0));
        player.play().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_seeked_arrives_after_latency() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(SessionEpoch::default(), Stream::Source, tx);
        let timing = EmbedTiming {
            ready_after: Duration::ZERO,
            seek_latency: Duration::from_millis(200),
        };
        let mut player = EmbeddedPlayer::open(&youtube(), sink, timing, false);
        player.set_current_time(42.0).unwrap();

        let seeked = |rx: &mut mpsc::UnboundedReceiver<crate::handle::StampedEvent>| {
            std::iter::from_fn(|| rx.try_recv().ok())
                .any(|s| matches!(s.event, PlaybackEvent::Seeked { .. }))
        };
        assert!(!seeked(&mut rx));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(seeked(&mut rx));
    }

    #[tokio::test(start_paused = true)]
    async fn test_vimeo_rate_range() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(SessionEpoch::default(), Stream::Source, tx);
        let video = Video::new("https://vimeo.com/1", SourceType::Vimeo);
        let timing = EmbedTiming {
            ready_after: Duration::ZERO,
            ..Default::default()
        };
        let mut player = EmbeddedPlayer::open(&video, sink, timing, false);

        assert!(matches!(
            player.set_playback_rate(0.25),
            Err(HandleError::UnsupportedRate { backend: "vimeo", .. })
        ));
        player.set_playback_rate(1.5).unwrap();
        assert_eq!(player.playback_rate(), 1.5);
    }
}
