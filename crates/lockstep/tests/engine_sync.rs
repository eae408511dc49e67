//! End-to-end engine behavior against simulated players and the
//! in-memory session store, on a paused tokio clock.

use std::sync::Arc;
use std::time::Duration;

use lockconf::SyncConfig;
use lockproto::{Session, SessionId, SourceType, SyncState, Video};
use lockstep::{
    EngineError, EngineHandle, InMemorySessionApi, SimControl, SimulatedResolver, Stream,
    SyncEngine,
};
use pretty_assertions::assert_eq;
use tokio::time::sleep;

struct Rig {
    store: Arc<InMemorySessionApi>,
    resolver: Arc<SimulatedResolver>,
    engine: EngineHandle,
    id: SessionId,
}

impl Rig {
    fn control(&self, stream: Stream) -> SimControl {
        self.resolver.control(stream).expect("handle opened")
    }

    fn calls(&self, op: &str) -> u32 {
        self.store.call_count(op, self.id.as_str())
    }
}

fn uploaded(name: &str) -> Video {
    Video::new(format!("file:///media/{name}.mp4"), SourceType::Uploaded).with_duration(600.0)
}

fn youtube() -> Video {
    Video::new("https://www.youtube.com/watch?v=abc", SourceType::Youtube).with_duration(300.0)
}

fn session(source: Video, offset: f64) -> Session {
    let mut session = Session::new(uploaded("reaction"), source);
    session.time_offset = offset;
    session
}

async fn rig(config: SyncConfig, session: Session) -> Rig {
    rig_with(config, session, SimulatedResolver::new()).await
}

async fn rig_with(config: SyncConfig, session: Session, resolver: SimulatedResolver) -> Rig {
    let store = Arc::new(InMemorySessionApi::new());
    let resolver = Arc::new(resolver);
    let id = store.insert_session(session);
    let engine = SyncEngine::spawn(config, store.clone(), resolver.clone());
    engine.load(id.clone()).await.unwrap();
    Rig {
        store,
        resolver,
        engine,
        id,
    }
}

#[tokio::test(start_paused = true)]
async fn test_countdown_plays_both_and_synchronizes() {
    let rig = rig(SyncConfig::default(), session(youtube(), -5.0)).await;

    rig.engine.start_countdown().await.unwrap();
    let snap = rig.engine.snapshot();
    assert_eq!(snap.sync_state, SyncState::Syncing);
    assert_eq!(snap.countdown, Some(3));
    assert_eq!(rig.calls("start_countdown"), 1);

    sleep(Duration::from_millis(2500)).await;
    assert_eq!(rig.engine.snapshot().countdown, Some(1));
    assert_eq!(rig.control(Stream::Reaction).play_calls(), 0);

    sleep(Duration::from_secs(1)).await;
    let snap = rig.engine.snapshot();
    assert_eq!(snap.sync_state, SyncState::Synchronized);
    assert_eq!(snap.countdown, None);
    assert!(snap.is_playing);
    assert!(rig.control(Stream::Reaction).is_playing());
    assert!(rig.control(Stream::Source).is_playing());

    let stored = rig.store.session(&rig.id).unwrap();
    assert_eq!(stored.sync_state, SyncState::Synchronized);
    assert!(!stored.countdown_start);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_countdown_never_plays() {
    let rig = rig(SyncConfig::default(), session(uploaded("source"), 0.0)).await;

    rig.engine.start_countdown().await.unwrap();
    sleep(Duration::from_millis(1500)).await;
    assert_eq!(rig.engine.snapshot().countdown, Some(2));

    rig.engine.cancel_countdown().await.unwrap();
    sleep(Duration::from_secs(5)).await;

    let snap = rig.engine.snapshot();
    assert_eq!(snap.sync_state, SyncState::Unsynchronized);
    assert_eq!(snap.countdown, None);
    assert!(!snap.is_playing);
    for stream in Stream::BOTH {
        assert_eq!(rig.control(stream).play_calls(), 0, "{stream} was started");
    }
    assert!(!rig.store.session(&rig.id).unwrap().countdown_start);
}

#[tokio::test(start_paused = true)]
async fn test_second_protocol_is_refused() {
    let rig = rig(SyncConfig::default(), session(uploaded("source"), 0.0)).await;

    rig.engine.start_countdown().await.unwrap();
    let err = rig.engine.pin_timestamp(10.0).await.unwrap_err();
    assert!(matches!(err, EngineError::Protocol(_)), "{err:?}");
    assert_eq!(rig.engine.snapshot().countdown, Some(3));
}

#[tokio::test(start_paused = true)]
async fn test_pin_applies_offset_to_source() {
    let rig = rig(SyncConfig::default(), session(uploaded("source"), -5.0)).await;

    rig.engine.pin_timestamp(30.0).await.unwrap();

    assert_eq!(rig.control(Stream::Reaction).position(), 30.0);
    assert_eq!(rig.control(Stream::Source).position(), 25.0);
    let snap = rig.engine.snapshot();
    assert_eq!(snap.sync_state, SyncState::Synchronized);
    assert!(!snap.pinning);

    sleep(Duration::from_millis(10)).await;
    assert_eq!(rig.calls("set_timestamp"), 1);
    let stored = rig.store.session(&rig.id).unwrap();
    assert_eq!(stored.timestamp_start, Some(30.0));
    assert_eq!(stored.external_position, 25.0);
}

#[tokio::test(start_paused = true)]
async fn test_pin_near_start_clamps_source() {
    let rig = rig(SyncConfig::default(), session(uploaded("source"), -5.0)).await;

    rig.engine.pin_timestamp(2.0).await.unwrap();
    assert_eq!(rig.control(Stream::Reaction).position(), 2.0);
    assert_eq!(rig.control(Stream::Source).position(), 0.0);

    // The source runs early until the reaction reaches 5s; it is the one
    // pulled back, the reaction keeps playing from its pin.
    rig.engine.play().await.unwrap();
    for second in 1..=8 {
        sleep(Duration::from_secs(1)).await;
        let reaction = rig.control(Stream::Reaction).position();
        assert!(
            (reaction - (2.0 + f64::from(second))).abs() < 0.05,
            "reaction moved to {reaction} after {second}s"
        );
    }
    assert_eq!(rig.control(Stream::Reaction).seek_calls(), 1, "pin only");

    let reaction = rig.control(Stream::Reaction).position();
    let source = rig.control(Stream::Source).position();
    assert!((source - (reaction - 5.0)).abs() <= 0.3, "{reaction} vs {source}");
    assert_eq!(rig.engine.snapshot().sync_state, SyncState::Synchronized);
}

#[tokio::test(start_paused = true)]
async fn test_pin_waits_for_its_own_seek() {
    let config = SyncConfig {
        pin_timeout_ms: 2000,
        ..SyncConfig::default()
    };
    let rig = rig(config, session(youtube(), -5.0)).await;
    sleep(Duration::from_millis(600)).await;

    // The skip's seek is still in flight on the embedded source when the
    // pin starts, and the pin's own seek never lands.
    rig.engine.seek_by(5.0).await.unwrap();
    rig.control(Stream::Source).set_unresponsive(true);

    let err = rig.engine.pin_timestamp(50.0).await.unwrap_err();
    assert!(
        matches!(err, EngineError::Protocol(lockstep::ProtocolError::TimedOut(_))),
        "{err:?}"
    );
    assert_eq!(rig.control(Stream::Source).position(), 5.0);
    assert_eq!(rig.engine.snapshot().sync_state, SyncState::Unsynchronized);
}

#[tokio::test(start_paused = true)]
async fn test_pin_after_skip_settles_on_targets() {
    let rig = rig(SyncConfig::default(), session(youtube(), -5.0)).await;
    sleep(Duration::from_millis(600)).await;

    rig.engine.seek_by(5.0).await.unwrap();
    rig.engine.pin_timestamp(50.0).await.unwrap();

    let snap = rig.engine.snapshot();
    assert_eq!(snap.sync_state, SyncState::Synchronized);
    assert_eq!(rig.control(Stream::Reaction).position(), 50.0);
    assert_eq!(rig.control(Stream::Source).position(), 45.0);
}

#[tokio::test(start_paused = true)]
async fn test_pin_times_out_when_seeks_never_land() {
    let config = SyncConfig {
        pin_timeout_ms: 2000,
        ..SyncConfig::default()
    };
    let rig = rig(config, session(uploaded("source"), 0.0)).await;
    rig.control(Stream::Source).set_unresponsive(true);

    let err = rig.engine.pin_timestamp(10.0).await.unwrap_err();
    assert!(
        matches!(err, EngineError::Protocol(lockstep::ProtocolError::TimedOut(_))),
        "{err:?}"
    );
    let snap = rig.engine.snapshot();
    assert_eq!(snap.sync_state, SyncState::Unsynchronized);
    assert!(snap.last_error.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_rate_is_validated_and_shared() {
    let rig = rig(SyncConfig::default(), session(uploaded("source"), 0.0)).await;

    for bad in [0.0, -1.0, f64::NAN] {
        let err = rig.engine.set_rate(bad).await.unwrap_err();
        assert!(matches!(err, EngineError::Controller(_)), "{bad}: {err:?}");
    }
    assert_eq!(rig.control(Stream::Reaction).rate(), 1.0);

    rig.engine.set_rate(1.5).await.unwrap();
    assert_eq!(rig.control(Stream::Reaction).rate(), 1.5);
    assert_eq!(rig.control(Stream::Source).rate(), 1.5);
    assert_eq!(rig.engine.snapshot().playback_speed, 1.5);

    sleep(Duration::from_millis(10)).await;
    assert_eq!(rig.store.session(&rig.id).unwrap().playback_speed, 1.5);
}

#[tokio::test(start_paused = true)]
async fn test_volume_is_clamped_per_stream() {
    let rig = rig(SyncConfig::default(), session(uploaded("source"), 0.0)).await;

    let applied = rig.engine.set_volume(Stream::Source, 1.7).await.unwrap();
    assert_eq!(applied, 1.0);
    let applied = rig.engine.set_volume(Stream::Reaction, 0.25).await.unwrap();
    assert_eq!(applied, 0.25);

    assert_eq!(rig.control(Stream::Reaction).volume(), 0.25);
    assert_eq!(rig.control(Stream::Source).volume(), 1.0);
    assert_eq!(rig.engine.snapshot().reaction_volume, 0.25);
}

#[tokio::test(start_paused = true)]
async fn test_skip_moves_both_streams() {
    let rig = rig(SyncConfig::default(), session(uploaded("source"), 0.0)).await;

    let landed = rig.engine.skip_forward().await.unwrap();
    assert_eq!(landed.reaction, 10.0);
    assert_eq!(landed.source, 10.0);

    rig.engine.seek_by(-25.0).await.unwrap();
    assert_eq!(rig.control(Stream::Reaction).position(), 0.0);
    assert_eq!(rig.control(Stream::Source).position(), 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_reports_at_most_once_per_second() {
    let rig = rig(SyncConfig::default(), session(uploaded("source"), 0.0)).await;

    rig.engine.play().await.unwrap();
    sleep(Duration::from_millis(10_500)).await;

    let reports = rig.calls("report_positions");
    assert!((10..=11).contains(&reports), "{reports} reports in 10.5s");
    assert_eq!(rig.engine.snapshot().reports_sent, u64::from(reports));
}

#[tokio::test(start_paused = true)]
async fn test_no_reports_while_paused() {
    let rig = rig(SyncConfig::default(), session(uploaded("source"), 0.0)).await;
    sleep(Duration::from_secs(5)).await;
    assert_eq!(rig.calls("report_positions"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_independent_pause_falls_back() {
    let rig = rig(SyncConfig::default(), session(uploaded("source"), 0.0)).await;
    rig.engine.pin_timestamp(0.0).await.unwrap();
    rig.engine.play().await.unwrap();
    assert_eq!(rig.engine.snapshot().sync_state, SyncState::Synchronized);

    sleep(Duration::from_millis(500)).await;
    rig.control(Stream::Source).pause_externally();
    sleep(Duration::from_millis(1100)).await;

    let snap = rig.engine.snapshot();
    assert_eq!(snap.sync_state, SyncState::Unsynchronized);
    assert!(!snap.is_playing);
    // The other stream is left alone.
    assert!(rig.control(Stream::Reaction).is_playing());
    assert_eq!(rig.control(Stream::Reaction).pause_calls(), 0);

    sleep(Duration::from_millis(10)).await;
    assert_eq!(
        rig.store.session(&rig.id).unwrap().sync_state,
        SyncState::Unsynchronized
    );
}

#[tokio::test(start_paused = true)]
async fn test_stall_is_corrected() {
    let rig = rig(SyncConfig::default(), session(uploaded("source"), 0.0)).await;
    rig.engine.pin_timestamp(10.0).await.unwrap();
    rig.engine.play().await.unwrap();

    sleep(Duration::from_millis(1100)).await;
    rig.control(Stream::Source).stall_for(Duration::from_millis(800));

    sleep(Duration::from_millis(1500)).await;
    let snap = rig.engine.snapshot();
    assert_eq!(snap.corrections, 1);
    assert_eq!(rig.control(Stream::Source).seek_calls(), 2, "pin + correction");

    for second in 1..=4 {
        sleep(Duration::from_secs(1)).await;
        let reaction = rig.control(Stream::Reaction).position();
        let source = rig.control(Stream::Source).position();
        assert!(
            (source - reaction).abs() <= 0.3,
            "{reaction} vs {source} {second}s after correcting"
        );
        let drift = rig.engine.snapshot().drift;
        assert!(drift.map_or(true, |d| d.abs() <= 0.3), "sampled drift {drift:?}");
    }
    let snap = rig.engine.snapshot();
    assert_eq!(snap.corrections, 1);
    assert_eq!(snap.sync_state, SyncState::Synchronized);
    assert_eq!(rig.control(Stream::Reaction).seek_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_persistent_drift_escalates() {
    let config = SyncConfig {
        max_correction_failures: 2,
        ..SyncConfig::default()
    };
    let rig = rig(config, session(uploaded("source"), 0.0)).await;
    rig.engine.pin_timestamp(10.0).await.unwrap();
    rig.engine.play().await.unwrap();

    // Accepted but never applied: every correction times out.
    rig.control(Stream::Source).set_unresponsive(true);
    rig.control(Stream::Source).nudge(-2.0);

    sleep(Duration::from_secs(12)).await;
    let snap = rig.engine.snapshot();
    assert_eq!(snap.sync_state, SyncState::Unsynchronized);
    assert!(snap.last_error.unwrap().contains("drift"));
}

#[tokio::test(start_paused = true)]
async fn test_session_switch_drops_old_work() {
    let rig = rig(SyncConfig::default(), session(uploaded("source"), 0.0)).await;
    rig.engine.play().await.unwrap();
    sleep(Duration::from_millis(2500)).await;
    let old = rig.control(Stream::Reaction);

    let next = rig.store.insert_session(session(uploaded("other"), 3.0));
    rig.engine.load(next.clone()).await.unwrap();
    let before = rig.calls("report_positions");
    let updates = rig.calls("update_session");
    assert!(before > 0);

    rig.engine.play().await.unwrap();
    sleep(Duration::from_secs(5)).await;

    assert_eq!(rig.calls("report_positions"), before);
    assert_eq!(rig.calls("update_session"), updates);
    assert!(rig.store.call_count("report_positions", next.as_str()) > 0);

    let snap = rig.engine.snapshot();
    assert_eq!(snap.session_id, Some(next));
    assert_eq!(snap.time_offset, 3.0);
    // The old handle was released; nothing drives it anymore.
    assert_eq!(old.play_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unready_player_makes_session_unusable() {
    let config = SyncConfig {
        max_unready_ticks: 3,
        ..SyncConfig::default()
    };
    let resolver = SimulatedResolver::new();
    resolver.hold_unready(Stream::Source);
    let rig = rig_with(config, session(youtube(), 0.0), resolver).await;

    sleep(Duration::from_millis(3500)).await;
    let snap = rig.engine.snapshot();
    let reason = snap.unusable.expect("session should be unusable");
    assert!(reason.contains("source"), "{reason}");
    assert_eq!(snap.sync_state, SyncState::Unsynchronized);

    let err = rig.engine.play().await.unwrap_err();
    assert!(matches!(err, EngineError::Unusable(_)), "{err:?}");
    let err = rig.engine.start_countdown().await.unwrap_err();
    assert!(matches!(err, EngineError::Unusable(_)), "{err:?}");
}

#[tokio::test(start_paused = true)]
async fn test_server_state_is_advisory() {
    let rig = rig(SyncConfig::default(), session(uploaded("source"), 0.0)).await;
    rig.store.force_sync_state(&rig.id, SyncState::Synchronized);

    rig.engine.play().await.unwrap();
    sleep(Duration::from_millis(1500)).await;

    assert_eq!(rig.engine.snapshot().sync_state, SyncState::Synchronized);
    for stream in Stream::BOTH {
        assert_eq!(rig.control(stream).seek_calls(), 0, "{stream} was seeked");
    }
}

#[tokio::test(start_paused = true)]
async fn test_remote_pin_does_not_echo() {
    let rig = rig(SyncConfig::default(), session(uploaded("source"), 4.0)).await;

    let mut remote = rig.store.session(&rig.id).unwrap();
    remote.timestamp_start = Some(42.0);
    remote.sync_state = SyncState::Synchronized;
    rig.engine.apply_remote(remote).await.unwrap();
    sleep(Duration::from_millis(100)).await;

    assert_eq!(rig.control(Stream::Reaction).position(), 42.0);
    assert_eq!(rig.control(Stream::Source).position(), 46.0);
    assert_eq!(rig.engine.snapshot().sync_state, SyncState::Synchronized);
    assert_eq!(rig.calls("set_timestamp"), 0);
    assert_eq!(rig.calls("update_session"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_remote_offset_change_repins_at_current_position() {
    let rig = rig(SyncConfig::default(), session(uploaded("source"), 0.0)).await;
    rig.engine.seek_by(20.0).await.unwrap();

    let mut remote = rig.store.session(&rig.id).unwrap();
    remote.time_offset = -10.0;
    rig.engine.apply_remote(remote).await.unwrap();
    sleep(Duration::from_millis(100)).await;

    assert_eq!(rig.engine.snapshot().time_offset, -10.0);
    assert_eq!(rig.control(Stream::Reaction).position(), 20.0);
    assert_eq!(rig.control(Stream::Source).position(), 10.0);
}

#[tokio::test(start_paused = true)]
async fn test_remote_session_must_match() {
    let rig = rig(SyncConfig::default(), session(uploaded("source"), 0.0)).await;
    let stranger = session(uploaded("source"), 0.0);
    let err = rig.engine.apply_remote(stranger).await.unwrap_err();
    assert!(matches!(err, EngineError::SessionMismatch { .. }), "{err:?}");
}

#[tokio::test(start_paused = true)]
async fn test_share_link_is_recorded() {
    let rig = rig(SyncConfig::default(), session(uploaded("source"), 0.0)).await;

    let link = rig.engine.share().await.unwrap();
    assert!(link.starts_with("http://localhost:8080/shared/"), "{link}");
    assert_eq!(rig.engine.snapshot().shareable_link, Some(link.clone()));

    let other = SyncEngine::spawn(
        SyncConfig::default(),
        rig.store.clone(),
        Arc::new(SimulatedResolver::new()),
    );
    let loaded = other.load_shared(link).await.unwrap();
    assert_eq!(loaded.id, rig.id);
}

#[tokio::test(start_paused = true)]
async fn test_commands_need_a_session() {
    let engine = SyncEngine::spawn(
        SyncConfig::default(),
        Arc::new(InMemorySessionApi::new()),
        Arc::new(SimulatedResolver::new()),
    );
    assert!(matches!(engine.play().await, Err(EngineError::NoSession)));
    assert!(matches!(
        engine.load(SessionId::from("missing")).await,
        Err(EngineError::Api(_))
    ));

    engine.shutdown().await;
    assert!(matches!(engine.pause().await, Err(EngineError::Closed)));
}
