//! Playback backends and asset resolution
//!
//! The engine never names a backend. It asks an [`AssetResolver`] to open a
//! [`Video`] and gets a boxed [`PlaybackHandle`] back; the resolver picks the
//! implementation from the video's [`SourceType`].

mod clock;
pub mod embedded;
pub mod native;
mod sim;

use std::collections::HashSet;
use std::sync::Mutex;

use dashmap::DashMap;
use lockproto::{SourceType, Video};
use thiserror::Error;
use tracing::info;

pub use clock::MediaClock;
pub use embedded::{EmbedTiming, EmbeddedPlayer};
pub use native::NativeElement;
pub use sim::SimControl;

use crate::handle::{EventSink, PlaybackHandle, Stream};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResolveError {
    #[error("video {id} has no URL")]
    MissingUrl { id: String },

    #[error("{url} is not a {source_type} URL")]
    HostMismatch { url: String, source_type: SourceType },
}

/// Turns a video reference into a live handle.
pub trait AssetResolver: Send + Sync {
    fn open(&self, video: &Video, sink: EventSink) -> Result<Box<dyn PlaybackHandle>, ResolveError>;
}

/// Check that a video's URL is plausible for its source type.
pub fn check_url(video: &Video) -> Result<(), ResolveError> {
    let url = video.url.trim();
    if url.is_empty() {
        return Err(ResolveError::MissingUrl {
            id: video.id.clone(),
        });
    }

    let hosts: &[&str] = match video.source_type {
        SourceType::Youtube => &["youtube.com", "youtu.be", "youtube-nocookie.com"],
        SourceType::Vimeo => &["vimeo.com"],
        SourceType::Uploaded | SourceType::DirectLink => &[],
    };
    if !hosts.is_empty() && !hosts.iter().any(|host| url.contains(host)) {
        return Err(ResolveError::HostMismatch {
            url: url.to_string(),
            source_type: video.source_type,
        });
    }
    Ok(())
}

/// Opens in-process simulated players.
///
/// Keeps a [`SimControl`] for the most recent handle of each stream so
/// callers can drive the players from outside.
#[derive(Default)]
pub struct SimulatedResolver {
    embed_timing: EmbedTiming,
    held: Mutex<HashSet<Stream>>,
    controls: DashMap<Stream, SimControl>,
}

impl SimulatedResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_embed_timing(mut self, timing: EmbedTiming) -> Self {
        self.embed_timing = timing;
        self
    }

    /// Players opened for `stream` from now on never become ready.
    pub fn hold_unready(&self, stream: Stream) {
        self.held
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(stream);
    }

    pub fn control(&self, stream: Stream) -> Option<SimControl> {
        self.controls.get(&stream).map(|c| c.value().clone())
    }

    fn is_held(&self, stream: Stream) -> bool {
        self.held
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains(&stream)
    }
}

impl AssetResolver for SimulatedResolver {
    fn open(&self, video: &Video, sink: EventSink) -> Result<Box<dyn PlaybackHandle>, ResolveError> {
        check_url(video)?;
        let stream = sink.stream();
        let held = self.is_held(stream);

        let (handle, control): (Box<dyn PlaybackHandle>, SimControl) = if video.source_type.is_embedded() {
            let player = EmbeddedPlayer::open(video, sink, self.embed_timing, held);
            let control = player.control();
            (Box::new(player), control)
        } else {
            let element = NativeElement::open(video, sink, held);
            let control = element.control();
            (Box::new(element), control)
        };

        info!(
            %stream,
            backend = handle.backend(),
            video = video.label(),
            "opened playback handle"
        );
        self.controls.insert(stream, control);
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::SessionEpoch;
    use tokio::sync::mpsc;

    #[test]
    fn test_check_url() {
        let ok = Video::new("https://www.youtube.com/watch?v=x", SourceType::Youtube);
        assert!(check_url(&ok).is_ok());

        let wrong = Video::new("https://vimeo.com/1", SourceType::Youtube);
        assert!(matches!(
            check_url(&wrong),
            Err(ResolveError::HostMismatch { .. })
        ));

        let empty = Video::new("  ", SourceType::Uploaded);
        assert!(matches!(check_url(&empty), Err(ResolveError::MissingUrl { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolver_picks_backend_by_source_type() {
        let resolver = SimulatedResolver::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        let native = resolver
            .open(
                &Video::new("https://cdn.example.com/a.mp4", SourceType::DirectLink),
                EventSink::new(SessionEpoch::default(), Stream::Reaction, tx.clone()),
            )
            .unwrap();
        let embed = resolver
            .open(
                &Video::new("https://vimeo.com/2", SourceType::Vimeo),
                EventSink::new(SessionEpoch::default(), Stream::Source, tx),
            )
            .unwrap();

        assert_eq!(native.backend(), "native");
        assert_eq!(embed.backend(), "vimeo");
        assert!(resolver.control(Stream::Reaction).is_some());
        assert!(resolver.control(Stream::Source).is_some());
    }
}
