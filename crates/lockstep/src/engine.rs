//! The sync engine
//!
//! One tokio task owns the controller, drift corrector, state machine,
//! sync channel and scheduler. Everything reaches it as a message: user
//! commands from [`EngineHandle`], playback events from the handles,
//! scheduler ticks, and results of API calls it fired off. Nothing else
//! mutates sync state, so there are no locks around it.
//!
//! Observers read [`SyncSnapshot`]s from a watch channel.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use lockconf::SyncConfig;
use lockproto::{
    validate_offset, validate_position, PositionAck, Session, SessionId, UpdateSessionRequest,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::api::{ApiError, SessionApi};
use crate::backends::AssetResolver;
use crate::channel::{self, RemoteAction, SessionSyncChannel};
use crate::controller::{ControllerError, DualMediaController, Positions, SKIP_SECONDS};
use crate::drift::{DriftConfig, DriftCorrector, DriftVerdict};
use crate::error::EngineError;
use crate::handle::{EventSink, PlaybackEvent, StampedEvent, Stream};
use crate::offset::{clamp_position, target_position};
use crate::scheduler::{Scheduler, SessionEpoch, Tick, TaskKind};
use crate::state::{CountdownStep, ProtocolError, SyncStateMachine, Transition};

const COMMAND_BUFFER: usize = 64;
const COUNTDOWN_STEP: Duration = Duration::from_secs(1);

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

/// Read-only view of the engine, published after every change.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SyncSnapshot {
    pub session_id: Option<SessionId>,
    pub sync_state: lockproto::SyncState,
    pub is_playing: bool,
    /// Seconds left on a running countdown.
    pub countdown: Option<u32>,
    pub pinning: bool,
    pub reaction_position: f64,
    pub source_position: f64,
    pub reaction_duration: Option<f64>,
    pub source_duration: Option<f64>,
    /// Last measured divergence from the configured offset.
    pub drift: Option<f64>,
    pub time_offset: f64,
    pub playback_speed: f64,
    pub reaction_volume: f64,
    pub source_volume: f64,
    pub reaction_ready: bool,
    pub source_ready: bool,
    /// Stream with a corrective seek in flight.
    pub correcting: Option<Stream>,
    pub corrections: u64,
    pub reports_sent: u64,
    pub shareable_link: Option<String>,
    pub unusable: Option<String>,
    pub last_error: Option<String>,
}

enum Command {
    Load {
        id: SessionId,
        reply: Reply<Session>,
    },
    LoadShared {
        share: String,
        reply: Reply<Session>,
    },
    Open {
        session: Box<Session>,
        reply: Reply<Session>,
    },
    Unload {
        reply: Reply<()>,
    },
    Play {
        reply: Reply<()>,
    },
    Pause {
        reply: Reply<()>,
    },
    SeekBy {
        delta: f64,
        reply: Reply<Positions>,
    },
    SetRate {
        rate: f64,
        reply: Reply<()>,
    },
    SetVolume {
        stream: Stream,
        level: f64,
        reply: Reply<f64>,
    },
    SetOffset {
        offset: f64,
        reply: Reply<()>,
    },
    StartCountdown {
        reply: Reply<()>,
    },
    CancelCountdown {
        reply: Reply<()>,
    },
    PinTimestamp {
        timestamp: f64,
        reply: Reply<()>,
    },
    ApplyRemote {
        session: Box<Session>,
        reply: Reply<()>,
    },
    Share {
        reply: Reply<String>,
    },
}

enum ApiMsg {
    Loaded {
        seq: u64,
        result: Result<Session, ApiError>,
        reply: Reply<Session>,
    },
    CountdownAck {
        epoch: SessionEpoch,
        seq: u64,
        result: Result<(), ApiError>,
    },
    Reported {
        epoch: SessionEpoch,
        state_changes: u64,
        result: Result<PositionAck, ApiError>,
    },
    Persisted {
        epoch: SessionEpoch,
        what: &'static str,
        result: Result<(), ApiError>,
    },
    Shared {
        epoch: SessionEpoch,
        result: Result<String, ApiError>,
        reply: Reply<String>,
    },
}

struct Inbox {
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedReceiver<StampedEvent>,
    ticks: mpsc::UnboundedReceiver<Tick>,
    api: mpsc::UnboundedReceiver<ApiMsg>,
}

/// Cloneable handle to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<SyncSnapshot>,
    shutdown: CancellationToken,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| EngineError::Closed)?;
        rx.await.map_err(|_| EngineError::Closed)?
    }

    /// Fetch a session from the API and load it.
    pub async fn load(&self, id: SessionId) -> Result<Session, EngineError> {
        self.request(|reply| Command::Load { id, reply }).await
    }

    /// Load a session from a share code or link.
    pub async fn load_shared(&self, share: impl Into<String>) -> Result<Session, EngineError> {
        let share = share.into();
        self.request(|reply| Command::LoadShared { share, reply })
            .await
    }

    /// Load a session that was already fetched.
    pub async fn open(&self, session: Session) -> Result<Session, EngineError> {
        self.request(|reply| Command::Open {
            session: Box::new(session),
            reply,
        })
        .await
    }

    pub async fn unload(&self) -> Result<(), EngineError> {
        self.request(|reply| Command::Unload { reply }).await
    }

    pub async fn play(&self) -> Result<(), EngineError> {
        self.request(|reply| Command::Play { reply }).await
    }

    pub async fn pause(&self) -> Result<(), EngineError> {
        self.request(|reply| Command::Pause { reply }).await
    }

    pub async fn seek_by(&self, delta: f64) -> Result<Positions, EngineError> {
        self.request(|reply| Command::SeekBy { delta, reply }).await
    }

    pub async fn skip_forward(&self) -> Result<Positions, EngineError> {
        self.seek_by(SKIP_SECONDS).await
    }

    pub async fn skip_back(&self) -> Result<Positions, EngineError> {
        self.seek_by(-SKIP_SECONDS).await
    }

    pub async fn set_rate(&self, rate: f64) -> Result<(), EngineError> {
        self.request(|reply| Command::SetRate { rate, reply }).await
    }

    /// Returns the level actually applied after clamping.
    pub async fn set_volume(&self, stream: Stream, level: f64) -> Result<f64, EngineError> {
        self.request(|reply| Command::SetVolume {
            stream,
            level,
            reply,
        })
        .await
    }

    pub async fn set_offset(&self, offset: f64) -> Result<(), EngineError> {
        self.request(|reply| Command::SetOffset { offset, reply })
            .await
    }

    /// Resolves once the server acknowledged and ticking has begun.
    pub async fn start_countdown(&self) -> Result<(), EngineError> {
        self.request(|reply| Command::StartCountdown { reply }).await
    }

    pub async fn cancel_countdown(&self) -> Result<(), EngineError> {
        self.request(|reply| Command::CancelCountdown { reply })
            .await
    }

    /// Resolves once both seeks have landed.
    pub async fn pin_timestamp(&self, timestamp: f64) -> Result<(), EngineError> {
        self.request(|reply| Command::PinTimestamp { timestamp, reply })
            .await
    }

    /// Reconcile with a copy of the session fetched from the server.
    pub async fn apply_remote(&self, session: Session) -> Result<(), EngineError> {
        self.request(|reply| Command::ApplyRemote {
            session: Box::new(session),
            reply,
        })
        .await
    }

    pub async fn share(&self) -> Result<String, EngineError> {
        self.request(|reply| Command::Share { reply }).await
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncSnapshot> {
        self.snapshots.clone()
    }

    /// Stop the engine and wait for it to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut rx = self.snapshots.clone();
        while rx.changed().await.is_ok() {}
    }
}

pub struct SyncEngine {
    config: SyncConfig,
    api: Arc<dyn SessionApi>,
    resolver: Arc<dyn AssetResolver>,
    controller: DualMediaController,
    drift: DriftCorrector,
    channel: SessionSyncChannel,
    scheduler: Scheduler,
    session: Option<SyncStateMachine>,
    events_tx: mpsc::UnboundedSender<StampedEvent>,
    api_tx: mpsc::UnboundedSender<ApiMsg>,
    snapshots: watch::Sender<SyncSnapshot>,
    last_drift: Option<f64>,
    interrupted: bool,
    unready_ticks: u32,
    load_seq: u64,
    countdown_seq: u64,
    state_changes: u64,
    persists_in_flight: u32,
    remote_protocol: bool,
    countdown_waiter: Option<Reply<()>>,
    pin_waiter: Option<Reply<()>>,
}

impl SyncEngine {
    /// Start an engine task and return a handle to it.
    pub fn spawn(
        config: SyncConfig,
        api: Arc<dyn SessionApi>,
        resolver: Arc<dyn AssetResolver>,
    ) -> EngineHandle {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (tick_tx, tick_rx) = mpsc::unbounded_channel();
        let (api_tx, api_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(SyncSnapshot::default());
        let shutdown = CancellationToken::new();

        let engine = Self {
            drift: DriftCorrector::new(DriftConfig::from(&config)),
            channel: SessionSyncChannel::new(config.report_interval()),
            scheduler: Scheduler::new(tick_tx),
            config,
            api,
            resolver,
            controller: DualMediaController::new(),
            session: None,
            events_tx,
            api_tx,
            snapshots: snapshot_tx,
            last_drift: None,
            interrupted: false,
            unready_ticks: 0,
            load_seq: 0,
            countdown_seq: 0,
            state_changes: 0,
            persists_in_flight: 0,
            remote_protocol: false,
            countdown_waiter: None,
            pin_waiter: None,
        };

        let inbox = Inbox {
            commands: command_rx,
            events: events_rx,
            ticks: tick_rx,
            api: api_rx,
        };
        tokio::spawn(engine.run(inbox, shutdown.clone()));

        EngineHandle {
            commands: command_tx,
            snapshots: snapshot_rx,
            shutdown,
        }
    }

    async fn run(mut self, mut inbox: Inbox, shutdown: CancellationToken) {
        info!("sync engine started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                command = inbox.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(stamped) = inbox.events.recv() => self.handle_event(stamped),
                Some(tick) = inbox.ticks.recv() => self.handle_tick(tick),
                Some(msg) = inbox.api.recv() => self.handle_api(msg),
            }
            self.publish();
        }
        self.teardown();
        self.publish();
        info!("sync engine stopped");
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    fn spawn_api<F, Fut>(&self, call: F)
    where
        F: FnOnce(Arc<dyn SessionApi>) -> Fut + Send + 'static,
        Fut: Future<Output = ApiMsg> + Send + 'static,
    {
        let api = Arc::clone(&self.api);
        let tx = self.api_tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(call(api).await);
        });
    }

    fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|sm| sm.session_id().clone())
    }

    fn require_session(&self) -> Result<&SyncStateMachine, EngineError> {
        self.session.as_ref().ok_or(EngineError::NoSession)
    }

    fn require_usable(&self) -> Result<&SyncStateMachine, EngineError> {
        let sm = self.require_session()?;
        match sm.unusable_reason() {
            Some(reason) => Err(EngineError::Unusable(reason.to_string())),
            None => Ok(sm),
        }
    }

    fn with_session<R>(&mut self, f: impl FnOnce(&mut SyncStateMachine) -> R) -> Option<R> {
        self.session.as_mut().map(f)
    }

    /// Fire-and-forget session update.
    fn persist(&mut self, what: &'static str, update: UpdateSessionRequest) {
        let Some(id) = self.session_id() else {
            return;
        };
        let epoch = self.scheduler.epoch();
        self.persists_in_flight += 1;
        self.spawn_api(move |api| async move {
            ApiMsg::Persisted {
                epoch,
                what,
                result: api.update_session(&id, &update).await.map(|_| ()),
            }
        });
    }

    fn on_transition(&mut self, transition: Transition, persist: bool) {
        let Transition::Changed { to, .. } = transition else {
            return;
        };
        self.state_changes += 1;
        if persist {
            let countdown_start = self
                .session
                .as_ref()
                .map(|sm| sm.session().countdown_start);
            self.persist(
                "sync_state",
                UpdateSessionRequest {
                    sync_state: Some(to),
                    countdown_start,
                    ..Default::default()
                },
            );
        }
    }

    fn snapshot(&self) -> SyncSnapshot {
        let Some(sm) = &self.session else {
            return SyncSnapshot::default();
        };
        let session = sm.session();
        let position = |stream: Stream, stored: f64| self.controller.position(stream).unwrap_or(stored);

        SyncSnapshot {
            session_id: Some(session.id.clone()),
            sync_state: session.sync_state,
            is_playing: self.controller.is_playing(),
            countdown: sm.countdown().map(|c| c.remaining),
            pinning: sm.pin().is_some(),
            reaction_position: position(Stream::Reaction, session.reaction_position),
            source_position: position(Stream::Source, session.external_position),
            reaction_duration: self.controller.duration(Stream::Reaction),
            source_duration: self.controller.duration(Stream::Source),
            drift: self.last_drift,
            time_offset: session.time_offset,
            playback_speed: session.playback_speed,
            reaction_volume: session.reaction_volume,
            source_volume: session.external_volume,
            reaction_ready: self.controller.is_ready(Stream::Reaction),
            source_ready: self.controller.is_ready(Stream::Source),
            correcting: self.drift.in_flight().map(|c| c.stream),
            corrections: self.drift.corrections(),
            reports_sent: self.channel.reports_sent(),
            shareable_link: session.shareable_link.clone(),
            unusable: sm.unusable_reason().map(str::to_string),
            last_error: sm.last_error().map(str::to_string),
        }
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.snapshot());
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    /// Drop the current session: cancel its tasks, fail its waiters and
    /// release its handles.
    fn teardown(&mut self) {
        self.scheduler.next_session();
        if let Some(reply) = self.countdown_waiter.take() {
            let _ = reply.send(Err(ProtocolError::Cancelled.into()));
        }
        if let Some(reply) = self.pin_waiter.take() {
            let _ = reply.send(Err(EngineError::Superseded));
        }
        self.controller.detach_all();
        self.drift = DriftCorrector::new(DriftConfig::from(&self.config));
        self.channel.reset();
        if let Some(sm) = self.session.take() {
            info!(session = %sm.session_id(), "session unloaded");
        }
        self.last_drift = None;
        self.interrupted = false;
        self.unready_ticks = 0;
        self.persists_in_flight = 0;
        self.remote_protocol = false;
    }

    fn install(&mut self, session: Session) -> Result<Session, EngineError> {
        session.validate()?;
        self.teardown();
        let epoch = self.scheduler.epoch();
        let sm = SyncStateMachine::new(session);

        self.controller.adopt_rate(sm.session().playback_speed)?;
        for stream in Stream::BOTH {
            let video = match stream {
                Stream::Reaction => &sm.session().reaction_video,
                Stream::Source => &sm.session().external_video,
            };
            let sink = EventSink::new(epoch, stream, self.events_tx.clone());
            match self.resolver.open(video, sink) {
                Ok(handle) => {
                    self.controller.attach(stream, handle);
                }
                Err(e) => {
                    warn!(%stream, error = %e, "could not open playback handle");
                    self.controller.detach_all();
                    return Err(e.into());
                }
            }
        }

        self.scheduler.every(TaskKind::Sampler, self.config.tick());
        info!(
            session = %sm.session_id(),
            %epoch,
            offset = sm.time_offset(),
            reaction = sm.session().reaction_video.label(),
            source = sm.session().external_video.label(),
            "session loaded"
        );
        let loaded = sm.session().clone();
        self.session = Some(sm);
        Ok(loaded)
    }

    /// Fail waiters and stop protocols once the session is unusable.
    fn retire(&mut self, reason: String) {
        let Some(transition) = self.with_session(|sm| sm.mark_unusable(reason.clone())) else {
            return;
        };
        self.scheduler.cancel(TaskKind::Countdown);
        self.drift.stop();
        if let Some(reply) = self.countdown_waiter.take() {
            let _ = reply.send(Err(EngineError::Unusable(reason.clone())));
        }
        if let Some(reply) = self.pin_waiter.take() {
            let _ = reply.send(Err(EngineError::Unusable(reason)));
        }
        self.on_transition(transition, true);
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Load { id, reply } => {
                self.load_seq += 1;
                let seq = self.load_seq;
                debug!(session = %id, "loading session");
                self.spawn_api(move |api| async move {
                    ApiMsg::Loaded {
                        seq,
                        result: api.get_session(&id).await,
                        reply,
                    }
                });
            }
            Command::LoadShared { share, reply } => {
                self.load_seq += 1;
                let seq = self.load_seq;
                self.spawn_api(move |api| async move {
                    ApiMsg::Loaded {
                        seq,
                        result: api.get_shared_session(&share).await,
                        reply,
                    }
                });
            }
            Command::Open { session, reply } => {
                self.load_seq += 1;
                let _ = reply.send(self.install(*session));
            }
            Command::Unload { reply } => {
                self.load_seq += 1;
                self.teardown();
                let _ = reply.send(Ok(()));
            }
            Command::Play { reply } => {
                let _ = reply.send(self.play());
            }
            Command::Pause { reply } => {
                let _ = reply.send(self.pause());
            }
            Command::SeekBy { delta, reply } => {
                let _ = reply.send(self.seek_by(delta));
            }
            Command::SetRate { rate, reply } => {
                let _ = reply.send(self.set_rate(rate));
            }
            Command::SetVolume {
                stream,
                level,
                reply,
            } => {
                let _ = reply.send(self.set_volume(stream, level));
            }
            Command::SetOffset { offset, reply } => {
                let _ = reply.send(self.set_offset(offset));
            }
            Command::StartCountdown { reply } => self.start_countdown(Some(reply), true),
            Command::CancelCountdown { reply } => {
                let result = match self.require_session() {
                    Ok(_) => {
                        self.abort_countdown();
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::PinTimestamp { timestamp, reply } => match self.begin_pin(timestamp, true) {
                Ok(()) => self.pin_waiter = Some(reply),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::ApplyRemote { session, reply } => {
                let _ = reply.send(self.apply_remote(*session));
            }
            Command::Share { reply } => match self.require_session() {
                Ok(sm) => {
                    let id = sm.session_id().clone();
                    let epoch = self.scheduler.epoch();
                    self.spawn_api(move |api| async move {
                        ApiMsg::Shared {
                            epoch,
                            result: api.generate_share_link(&id).await,
                            reply,
                        }
                    });
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
        }
    }

    fn play(&mut self) -> Result<(), EngineError> {
        self.require_usable()?;
        self.abort_countdown();
        self.controller.play()?;
        self.interrupted = false;
        self.drift.resume();
        info!("playing");
        Ok(())
    }

    fn pause(&mut self) -> Result<(), EngineError> {
        self.require_session()?;
        self.abort_countdown();
        self.controller.pause()?;
        self.drift.stop();
        info!("paused");
        Ok(())
    }

    fn seek_by(&mut self, delta: f64) -> Result<Positions, EngineError> {
        self.require_usable()?;
        let landed = self.controller.seek_by(delta)?;
        self.drift.supersede(Instant::now());
        debug!(delta, reaction = landed.reaction, source = landed.source, "seek");
        Ok(landed)
    }

    fn set_rate(&mut self, rate: f64) -> Result<(), EngineError> {
        self.require_usable()?;
        self.controller.set_rate(rate)?;
        let update = UpdateSessionRequest {
            playback_speed: Some(rate),
            ..Default::default()
        };
        if let Some(result) = self.with_session(|sm| sm.update(&update)) {
            result?;
        }
        self.drift.supersede(Instant::now());
        self.persist("playback_speed", update);
        info!(rate, "playback rate changed");
        Ok(())
    }

    fn set_volume(&mut self, stream: Stream, level: f64) -> Result<f64, EngineError> {
        self.require_usable()?;
        let applied = self.controller.set_volume(stream, level)?;
        let update = match stream {
            Stream::Reaction => UpdateSessionRequest {
                reaction_volume: Some(applied),
                ..Default::default()
            },
            Stream::Source => UpdateSessionRequest {
                external_volume: Some(applied),
                ..Default::default()
            },
        };
        if let Some(result) = self.with_session(|sm| sm.update(&update)) {
            result?;
        }
        self.persist("volume", update);
        Ok(applied)
    }

    fn set_offset(&mut self, offset: f64) -> Result<(), EngineError> {
        self.require_usable()?;
        validate_offset(offset)?;
        let update = UpdateSessionRequest {
            time_offset: Some(offset),
            ..Default::default()
        };
        if let Some(result) = self.with_session(|sm| sm.update(&update)) {
            result?;
        }
        self.drift.supersede(Instant::now());
        self.persist("time_offset", update);
        info!(offset, "time offset changed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Countdown
    // ------------------------------------------------------------------

    fn start_countdown(&mut self, reply: Option<Reply<()>>, notify: bool) {
        let begun = self.require_usable().map(|_| ()).and_then(|()| {
            for stream in Stream::BOTH {
                if !self.controller.is_attached(stream) {
                    return Err(EngineError::from(ControllerError::Unavailable(stream)));
                }
            }
            let seconds = self.config.countdown_secs;
            self.with_session(|sm| sm.begin_countdown(seconds))
                .ok_or(EngineError::NoSession)?
                .map_err(EngineError::from)
        });

        let transition = match begun {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, remote = !notify, "countdown refused");
                if let Some(reply) = reply {
                    let _ = reply.send(Err(e));
                }
                return;
            }
        };

        self.countdown_seq += 1;
        self.remote_protocol = !notify;
        self.on_transition(transition, false);

        if notify {
            let Some(id) = self.session_id() else {
                return;
            };
            let epoch = self.scheduler.epoch();
            let seq = self.countdown_seq;
            self.countdown_waiter = reply;
            self.spawn_api(move |api| async move {
                ApiMsg::CountdownAck {
                    epoch,
                    seq,
                    result: api.start_countdown(&id).await.map(|_| ()),
                }
            });
        } else {
            self.arm_countdown();
            if let Some(reply) = reply {
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn arm_countdown(&mut self) {
        if self.with_session(|sm| sm.arm_countdown()) == Some(true) {
            self.scheduler.every(TaskKind::Countdown, COUNTDOWN_STEP);
            info!(seconds = self.config.countdown_secs, "countdown started");
        }
    }

    /// Cancel a running countdown. Returns whether there was one.
    fn abort_countdown(&mut self) -> bool {
        let Some(Some(transition)) = self.with_session(|sm| sm.cancel_countdown()) else {
            return false;
        };
        self.scheduler.cancel(TaskKind::Countdown);
        if let Some(reply) = self.countdown_waiter.take() {
            let _ = reply.send(Err(ProtocolError::Cancelled.into()));
        }
        let remote = std::mem::take(&mut self.remote_protocol);
        self.on_transition(transition, false);
        if !remote {
            let sync_state = self.session.as_ref().map(|sm| sm.sync_state());
            self.persist(
                "countdown_cancel",
                UpdateSessionRequest {
                    countdown_start: Some(false),
                    sync_state,
                    ..Default::default()
                },
            );
        }
        true
    }

    fn on_countdown_tick(&mut self) {
        let Some(step) = self.with_session(|sm| sm.countdown_tick()) else {
            self.scheduler.cancel(TaskKind::Countdown);
            return;
        };
        match step {
            CountdownStep::Idle => self.scheduler.cancel(TaskKind::Countdown),
            CountdownStep::Waiting => {}
            CountdownStep::Tick(remaining) => info!(remaining, "countdown"),
            CountdownStep::Fire => {
                self.scheduler.cancel(TaskKind::Countdown);
                let outcome = self.controller.play().map_err(|e| e.to_string());
                if outcome.is_ok() {
                    self.interrupted = false;
                    self.drift.resume();
                }
                let remote = std::mem::take(&mut self.remote_protocol);
                if let Some(transition) = self.with_session(|sm| sm.complete_countdown(outcome)) {
                    self.on_transition(transition, !remote);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Timestamp pinning
    // ------------------------------------------------------------------

    fn begin_pin(&mut self, timestamp: f64, notify: bool) -> Result<(), EngineError> {
        let sm = self.require_usable()?;
        validate_position(timestamp)?;
        self.controller.ensure_ready()?;

        let offset = sm.time_offset();
        let reaction_target = clamp_position(timestamp, self.controller.duration(Stream::Reaction));
        let source_target = target_position(
            Stream::Reaction,
            reaction_target,
            offset,
            self.controller.duration(Stream::Source),
        );
        let now = Instant::now();
        let transition = self
            .with_session(|sm| sm.begin_pin(timestamp, reaction_target, source_target, now))
            .ok_or(EngineError::NoSession)??;
        self.drift.supersede(now);

        let previous_reaction = self.controller.position(Stream::Reaction);
        let mut seeks = self.controller.seek_to(Stream::Reaction, reaction_target);
        if seeks.is_ok() {
            seeks = self.controller.seek_to(Stream::Source, source_target);
            if seeks.is_err() {
                if let Some(previous) = previous_reaction {
                    if let Err(e) = self.controller.seek_to(Stream::Reaction, previous) {
                        warn!(error = %e, "could not roll back reaction seek");
                    }
                }
            }
        }
        if let Err(e) = seeks {
            if let Some(Some(t)) = self.with_session(|sm| sm.fail_pin(e.to_string())) {
                self.on_transition(t, notify);
            }
            return Err(e.into());
        }

        self.remote_protocol = !notify;
        self.on_transition(transition, false);
        info!(timestamp, reaction_target, source_target, remote = !notify, "pinning timestamp");

        if notify {
            if let Some(id) = self.session_id() {
                let epoch = self.scheduler.epoch();
                self.persists_in_flight += 1;
                self.spawn_api(move |api| async move {
                    ApiMsg::Persisted {
                        epoch,
                        what: "timestamp",
                        result: api.set_timestamp(&id, timestamp).await.map(|_| ()),
                    }
                });
            }
        }
        Ok(())
    }

    fn finish_pin(&mut self, transition: Transition) {
        let remote = std::mem::take(&mut self.remote_protocol);
        self.on_transition(transition, !remote);
        let synchronized = self
            .session
            .as_ref()
            .is_some_and(|sm| sm.sync_state() == lockproto::SyncState::Synchronized);
        if let Some(reply) = self.pin_waiter.take() {
            let result = if synchronized {
                Ok(())
            } else {
                Err(ProtocolError::Failed {
                    protocol: "timestamp pin",
                    reason: "session rejected pinned positions".to_string(),
                }
                .into())
            };
            let _ = reply.send(result);
        }
    }

    // ------------------------------------------------------------------
    // Remote updates
    // ------------------------------------------------------------------

    fn apply_remote(&mut self, remote: Session) -> Result<(), EngineError> {
        let sm = self.require_usable()?;
        if sm.session_id() != &remote.id {
            return Err(EngineError::SessionMismatch {
                loaded: sm.session_id().clone(),
                requested: remote.id,
            });
        }
        remote.validate()?;

        for action in channel::reconcile(sm.session(), &remote) {
            debug!(?action, "applying remote change");
            match action {
                RemoteAction::DisplayState(state) => {
                    if let Some(t) = self.with_session(|sm| sm.apply_remote_state(state)) {
                        self.on_transition(t, false);
                    }
                }
                RemoteAction::Offset(offset) => {
                    let update = UpdateSessionRequest {
                        time_offset: Some(offset),
                        ..Default::default()
                    };
                    if let Some(result) = self.with_session(|sm| sm.update(&update)) {
                        result?;
                    }
                    self.drift.supersede(Instant::now());
                }
                RemoteAction::Speed(speed) => match self.controller.set_rate(speed) {
                    Ok(()) => {
                        let update = UpdateSessionRequest {
                            playback_speed: Some(speed),
                            ..Default::default()
                        };
                        if let Some(result) = self.with_session(|sm| sm.update(&update)) {
                            result?;
                        }
                    }
                    Err(e) => warn!(speed, error = %e, "could not adopt remote speed"),
                },
                RemoteAction::Repin { timestamp } => {
                    let timestamp = timestamp
                        .or_else(|| self.controller.position(Stream::Reaction))
                        .unwrap_or(0.0);
                    if let Err(e) = self.begin_pin(timestamp, false) {
                        warn!(timestamp, error = %e, "could not follow remote pin");
                    }
                }
                RemoteAction::Countdown => self.start_countdown(None, false),
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Playback events
    // ------------------------------------------------------------------

    fn handle_event(&mut self, stamped: StampedEvent) {
        if !self.scheduler.is_current(stamped.epoch) || self.session.is_none() {
            trace!(epoch = %stamped.epoch, "dropping stale playback event");
            return;
        }
        let now = Instant::now();

        match stamped.event {
            PlaybackEvent::Ready { stream } => {
                debug!(%stream, "stream ready");
                let volume = self.session.as_ref().map(|sm| match stream {
                    Stream::Reaction => sm.session().reaction_volume,
                    Stream::Source => sm.session().external_volume,
                });
                if let Some(volume) = volume {
                    if let Err(e) = self.controller.prime(stream, volume) {
                        warn!(%stream, error = %e, "could not apply session settings");
                    }
                }
            }
            PlaybackEvent::Progress { .. } => {
                if self.drift.accepts_time_updates() {
                    self.maybe_report(now);
                }
            }
            PlaybackEvent::Play { stream } => debug!(%stream, "stream playing"),
            PlaybackEvent::Pause { stream } | PlaybackEvent::Ended { stream } => {
                if self.controller.is_playing() {
                    info!(%stream, "stream stopped outside engine control");
                    self.interrupted = true;
                }
            }
            PlaybackEvent::Seeked { stream, position } => {
                trace!(%stream, position, "seeked");
                if !self.drift.on_seeked(stream, now) {
                    let tolerance = self.config.drift_tolerance;
                    if let Some(Some(t)) =
                        self.with_session(|sm| sm.pin_seeked(stream, position, tolerance))
                    {
                        self.finish_pin(t);
                    }
                }
            }
            PlaybackEvent::Waiting { stream } => debug!(%stream, "stream buffering"),
            PlaybackEvent::Error { stream, message } => {
                warn!(%stream, %message, "player error");
                self.with_session(|sm| sm.record_error(format!("{stream}: {message}")));
            }
        }
    }

    fn maybe_report(&mut self, now: Instant) {
        let Some(id) = self.session_id() else {
            return;
        };
        if self.require_usable().is_err() {
            return;
        }
        let positions = self.controller.positions();
        let Some(report) = self
            .channel
            .poll_report(now, self.controller.is_playing(), positions)
        else {
            return;
        };

        let epoch = self.scheduler.epoch();
        let state_changes = self.state_changes;
        self.spawn_api(move |api| async move {
            ApiMsg::Reported {
                epoch,
                state_changes,
                result: api.report_positions(&id, report).await,
            }
        });
    }

    // ------------------------------------------------------------------
    // Ticks
    // ------------------------------------------------------------------

    fn handle_tick(&mut self, tick: Tick) {
        if !self.scheduler.is_current(tick.epoch) {
            trace!(epoch = %tick.epoch, kind = tick.kind.as_str(), "dropping stale tick");
            return;
        }
        match tick.kind {
            TaskKind::Sampler => self.on_sampler_tick(Instant::now()),
            TaskKind::Countdown => self.on_countdown_tick(),
        }
    }

    fn on_sampler_tick(&mut self, now: Instant) {
        if self.require_usable().is_err() {
            return;
        }

        if self.controller.both_ready() {
            self.unready_ticks = 0;
        } else {
            self.unready_ticks += 1;
            if self.unready_ticks >= self.config.max_unready_ticks.max(1) {
                let stream = Stream::BOTH
                    .into_iter()
                    .find(|s| !self.controller.is_ready(*s))
                    .unwrap_or(Stream::Source);
                self.retire(format!("{stream} player never became ready"));
                return;
            }
        }

        let expired = self
            .session
            .as_ref()
            .is_some_and(|sm| sm.pin_expired(now, self.config.pin_timeout()));
        if expired {
            if let Some(Some(t)) = self.with_session(|sm| sm.fail_pin("seeks did not settle")) {
                let remote = std::mem::take(&mut self.remote_protocol);
                self.on_transition(t, !remote);
            }
            if let Some(reply) = self.pin_waiter.take() {
                let _ = reply.send(Err(ProtocolError::TimedOut("timestamp pin").into()));
            }
        }

        if self.controller.is_playing() {
            let stopped = Stream::BOTH
                .into_iter()
                .find(|s| self.controller.stream_playing(*s) == Some(false));
            if self.interrupted || stopped.is_some() {
                self.controller.mark_interrupted();
                self.drift.stop();
                let reason = match stopped {
                    Some(stream) => format!("{stream} stopped on its own"),
                    None => "a stream paused on its own".to_string(),
                };
                if let Some(t) = self.with_session(|sm| sm.fall_back(reason)) {
                    self.on_transition(t, true);
                }
            }
        }
        self.interrupted = false;

        self.sample_drift(now);
        self.maybe_report(now);
    }

    fn sample_drift(&mut self, now: Instant) {
        if !self.controller.is_playing() {
            self.last_drift = None;
            return;
        }
        let Some(sm) = self.session.as_ref() else {
            return;
        };
        if sm.protocol_in_progress() {
            return;
        }
        let Some(positions) = self.controller.positions() else {
            return;
        };

        let durations = (
            self.controller.duration(Stream::Reaction),
            self.controller.duration(Stream::Source),
        );
        let verdict = self
            .drift
            .sample(now, positions, sm.time_offset(), durations);
        self.last_drift = verdict.drift();

        let escalation = match verdict {
            DriftVerdict::Correct { stream, target, .. } => {
                match self.controller.seek_to(stream, target) {
                    Ok(_) => None,
                    Err(e) => {
                        warn!(%stream, error = %e, "corrective seek refused");
                        self.drift.abandon(now)
                    }
                }
            }
            escalate @ DriftVerdict::Escalate { .. } => Some(escalate),
            _ => None,
        };

        if let Some(DriftVerdict::Escalate { failures, drift }) = escalation {
            let reason = format!("drift of {drift:.2}s persisted after {failures} corrections");
            if let Some(t) = self.with_session(|sm| sm.fall_back(reason)) {
                self.on_transition(t, true);
            }
        }
    }

    // ------------------------------------------------------------------
    // API results
    // ------------------------------------------------------------------

    fn handle_api(&mut self, msg: ApiMsg) {
        match msg {
            ApiMsg::Loaded { seq, result, reply } => {
                if seq != self.load_seq {
                    let _ = reply.send(Err(EngineError::Superseded));
                    return;
                }
                let outcome = result
                    .map_err(EngineError::from)
                    .and_then(|session| self.install(session));
                if let Err(e) = &outcome {
                    warn!(error = %e, "session load failed");
                }
                let _ = reply.send(outcome);
            }
            ApiMsg::CountdownAck { epoch, seq, result } => {
                let pending = self.scheduler.is_current(epoch)
                    && seq == self.countdown_seq
                    && self
                        .session
                        .as_ref()
                        .and_then(|sm| sm.countdown())
                        .is_some_and(|c| !c.armed);
                if !pending {
                    trace!("ignoring countdown ack for a cancelled countdown");
                    return;
                }
                match result {
                    Ok(()) => {
                        self.arm_countdown();
                        if let Some(reply) = self.countdown_waiter.take() {
                            let _ = reply.send(Ok(()));
                        }
                    }
                    Err(e) => {
                        self.remote_protocol = false;
                        let reason = format!("server refused countdown: {e}");
                        if let Some(t) = self.with_session(|sm| sm.complete_countdown(Err(reason))) {
                            self.on_transition(t, false);
                        }
                        if let Some(reply) = self.countdown_waiter.take() {
                            let _ = reply.send(Err(e.into()));
                        }
                    }
                }
            }
            ApiMsg::Reported {
                epoch,
                state_changes,
                result,
            } => {
                if !self.scheduler.is_current(epoch) {
                    return;
                }
                match result {
                    Ok(ack) => {
                        self.channel.on_ack(ack);
                        let fresh =
                            state_changes == self.state_changes && self.persists_in_flight == 0;
                        if fresh {
                            let transition = self.with_session(|sm| {
                                if sm.sync_state() == ack.sync_state {
                                    Transition::Unchanged
                                } else {
                                    sm.apply_remote_state(ack.sync_state)
                                }
                            });
                            if let Some(t @ Transition::Changed { to, .. }) = transition {
                                info!(state = %to, "server reports a different sync state");
                                self.on_transition(t, false);
                            }
                        }
                    }
                    Err(e) => self.channel.on_report_failed(&e),
                }
            }
            ApiMsg::Persisted {
                epoch,
                what,
                result,
            } => {
                if !self.scheduler.is_current(epoch) {
                    return;
                }
                self.persists_in_flight = self.persists_in_flight.saturating_sub(1);
                if let Err(e) = result {
                    warn!(what, error = %e, "could not persist session change");
                    self.with_session(|sm| sm.record_error(format!("saving {what}: {e}")));
                }
            }
            ApiMsg::Shared {
                epoch,
                result,
                reply,
            } => {
                if let Ok(link) = &result {
                    if self.scheduler.is_current(epoch) {
                        let link = link.clone();
                        self.with_session(|sm| sm.set_shareable_link(link));
                    }
                }
                let _ = reply.send(result.map_err(EngineError::from));
            }
        }
    }
}
