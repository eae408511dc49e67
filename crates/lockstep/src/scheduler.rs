//! Cancellable periodic tasks scoped to one loaded session
//!
//! Every timer the engine relies on (drift sampling, countdown ticks) is a
//! task owned here. Each task only posts a [`Tick`] message tagged with the
//! current [`SessionEpoch`]; the engine loop does the work. Switching
//! sessions bumps the epoch and cancels every task, so nothing scheduled
//! for the old session can touch the new one.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Generation counter for the loaded session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SessionEpoch(u64);

impl SessionEpoch {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl std::fmt::Display for SessionEpoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "epoch-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Drift sampling, readiness and position reporting.
    Sampler,
    Countdown,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Sampler => "sampler",
            TaskKind::Countdown => "countdown",
        }
    }
}

/// Message posted by a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    pub epoch: SessionEpoch,
    pub kind: TaskKind,
}

struct ScheduledTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Scheduler {
    epoch: SessionEpoch,
    session_token: CancellationToken,
    tasks: HashMap<TaskKind, ScheduledTask>,
    tx: mpsc::UnboundedSender<Tick>,
}

impl Scheduler {
    pub fn new(tx: mpsc::UnboundedSender<Tick>) -> Self {
        Self {
            epoch: SessionEpoch::default(),
            session_token: CancellationToken::new(),
            tasks: HashMap::new(),
            tx,
        }
    }

    pub fn epoch(&self) -> SessionEpoch {
        self.epoch
    }

    pub fn is_current(&self, epoch: SessionEpoch) -> bool {
        self.epoch == epoch
    }

    /// Cancel everything and start a new generation.
    pub fn next_session(&mut self) -> SessionEpoch {
        self.cancel_all();
        self.session_token = CancellationToken::new();
        self.epoch = self.epoch.next();
        debug!(epoch = %self.epoch, "scheduler advanced");
        self.epoch
    }

    /// Post a `kind` tick every `period`, first one a full period from now.
    /// Replaces any task of the same kind.
    pub fn every(&mut self, kind: TaskKind, period: Duration) {
        self.cancel(kind);

        let cancel = self.session_token.child_token();
        let token = cancel.clone();
        let tx = self.tx.clone();
        let epoch = self.epoch;

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        trace!(task = kind.as_str(), %epoch, "scheduled task cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        if tx.send(Tick { epoch, kind }).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        self.tasks.insert(kind, ScheduledTask { cancel, handle });
    }

    pub fn cancel(&mut self, kind: TaskKind) {
        if let Some(task) = self.tasks.remove(&kind) {
            task.cancel.cancel();
            task.handle.abort();
        }
    }

    pub fn cancel_all(&mut self) {
        self.session_token.cancel();
        for (_, task) in self.tasks.drain() {
            task.handle.abort();
        }
    }

    pub fn is_scheduled(&self, kind: TaskKind) -> bool {
        self.tasks
            .get(&kind)
            .is_some_and(|task| !task.handle.is_finished())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_carry_epoch() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scheduler = Scheduler::new(tx);
        let epoch = scheduler.next_session();
        scheduler.every(TaskKind::Sampler, Duration::from_secs(1));

        let tick = rx.recv().await.unwrap();
        assert_eq!(tick.epoch, epoch);
        assert_eq!(tick.kind, TaskKind::Sampler);
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_session_cancels_tasks() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scheduler = Scheduler::new(tx);
        let old = scheduler.next_session();
        scheduler.every(TaskKind::Countdown, Duration::from_secs(1));
        let new = scheduler.next_session();

        assert_ne!(old, new);
        assert!(!scheduler.is_current(old));
        assert!(!scheduler.is_scheduled(TaskKind::Countdown));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(rx.try_recv().is_err(), "cancelled task must not tick");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_single_kind_keeps_others() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scheduler = Scheduler::new(tx);
        scheduler.next_session();
        scheduler.every(TaskKind::Sampler, Duration::from_secs(1));
        scheduler.every(TaskKind::Countdown, Duration::from_secs(1));
        scheduler.cancel(TaskKind::Countdown);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        let mut kinds = Vec::new();
        while let Ok(tick) = rx.try_recv() {
            kinds.push(tick.kind);
        }
        assert_eq!(kinds, vec![TaskKind::Sampler, TaskKind::Sampler]);
    }
}
