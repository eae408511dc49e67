//! Lockstep: keep a reaction video and its source video playing in sync
//!
//! A session pairs two videos with a time offset
//! (`source = reaction + offset`). The [`SyncEngine`] drives both through
//! [`PlaybackHandle`]s, whatever backend plays them:
//!
//! - **Transport**: play, pause, skip and rate changes apply to both streams
//!   together or not at all ([`DualMediaController`])
//! - **Drift correction**: a sampler compares positions every tick and seeks
//!   the lagging stream when they diverge ([`DriftCorrector`])
//! - **Sync protocols**: a shared countdown or a pinned timestamp bring the
//!   session to `synchronized` ([`SyncStateMachine`])
//! - **Session channel**: throttled position reports and reconciliation with
//!   remote edits, over a [`SessionApi`]
//!
//! The engine runs as one tokio task and publishes [`SyncSnapshot`]s.
//! Everything it schedules is tied to a [`SessionEpoch`]; loading another
//! session invalidates all of it at once.

pub mod api;
pub mod backends;
pub mod channel;
pub mod controller;
pub mod drift;
pub mod engine;
pub mod error;
pub mod handle;
pub mod offset;
pub mod scheduler;
pub mod state;
pub mod telemetry;

pub use api::{ApiError, HttpSessionApi, InMemorySessionApi, SessionApi};
pub use backends::{
    AssetResolver, EmbedTiming, EmbeddedPlayer, NativeElement, ResolveError, SimControl,
    SimulatedResolver,
};
pub use channel::{reconcile, RemoteAction, ReportThrottle, SessionSyncChannel};
pub use controller::{ControllerError, DualMediaController, Positions, SKIP_SECONDS};
pub use drift::{Correction, DriftConfig, DriftCorrector, DriftVerdict};
pub use engine::{EngineHandle, SyncEngine, SyncSnapshot};
pub use error::{EngineError, ErrorKind};
pub use handle::{EventSink, HandleError, PlaybackEvent, PlaybackHandle, StampedEvent, Stream};
pub use offset::Lead;
pub use scheduler::{Scheduler, SessionEpoch, TaskKind, Tick};
pub use state::{CountdownStep, ProtocolError, SyncStateMachine, Transition};
