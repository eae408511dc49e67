//! Offset model: mapping a position on one stream to the other
//!
//! `position(source) = position(reaction) + offset`. A positive offset means
//! the source is ahead of the reaction; a negative one means the source
//! starts later in the reaction's timeline.

use crate::handle::Stream;

/// Clamp a position into `[0, duration]`. Unknown durations only clamp
/// below.
pub fn clamp_position(position: f64, duration: Option<f64>) -> f64 {
    let floor = position.max(0.0);
    match duration {
        Some(d) if d.is_finite() && d >= 0.0 => floor.min(d),
        _ => floor,
    }
}

/// Where `driver.other()` belongs when `driver` is at `driver_position`.
pub fn target_position(
    driver: Stream,
    driver_position: f64,
    offset: f64,
    target_duration: Option<f64>,
) -> f64 {
    let raw = match driver {
        Stream::Reaction => driver_position + offset,
        Stream::Source => driver_position - offset,
    };
    clamp_position(raw, target_duration)
}

/// Offset the two positions actually exhibit.
pub fn observed_offset(reaction: f64, source: f64) -> f64 {
    source - reaction
}

/// Signed divergence from the configured offset. Positive means the source
/// has run ahead (the reaction lags); negative means the source lags.
pub fn drift(reaction: f64, source: f64, offset: f64) -> f64 {
    observed_offset(reaction, source) - offset
}

/// Which stream leads for a given offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lead {
    SourceAhead,
    ReactionAhead,
    Aligned,
}

impl Lead {
    pub fn of(offset: f64) -> Self {
        if offset > 0.0 {
            Lead::SourceAhead
        } else if offset < 0.0 {
            Lead::ReactionAhead
        } else {
            Lead::Aligned
        }
    }

    /// Human label, e.g. "source ahead by 5.00s".
    pub fn describe(offset: f64) -> String {
        match Self::of(offset) {
            Lead::SourceAhead => format!("source ahead by {:.2}s", offset),
            Lead::ReactionAhead => format!("reaction ahead by {:.2}s", -offset),
            Lead::Aligned => "aligned".to_string(),
        }
    }
}
