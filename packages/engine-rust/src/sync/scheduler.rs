//! Cooperative background sync scheduler.
//!
//! One scheduler per owner (enforced by [`SchedulerRegistry`]). A single
//! tokio task ticks on the base interval and reacts to host signals; every
//! tick is gated on visibility, network state, and user idleness. The
//! driver's own mutex guarantees at most one in-flight sync; the scheduler
//! guarantees at most one driving task.
//!
//! State machine: `Idle -> Scheduled -> Running -> Scheduled | Stopped`.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::clock::now_millis;
use crate::sync::reconcile::SyncDriver;

/// Scheduler timing configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Base interval between sync ticks.
    pub base_interval: Duration,
    /// User idleness past this skips ticks (unless badly overdue).
    pub idle_threshold: Duration,
    /// Becoming visible triggers a sync when the last one is older than
    /// this.
    pub visible_stale_after: Duration,
    /// An idle-skipped sync still runs once it is this many base
    /// intervals overdue.
    pub idle_override_factor: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(5 * 60),
            idle_threshold: Duration::from_secs(15 * 60),
            visible_stale_after: Duration::from_secs(5 * 60),
            idle_override_factor: 3,
        }
    }
}

/// Scheduler lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerPhase {
    /// Created, never started.
    Idle,
    /// Waiting for the next tick or event.
    Scheduled,
    /// A sync pass is in flight.
    Running,
    /// Stopped; restartable with `start()`.
    Stopped,
}

struct SignalState {
    online: watch::Sender<bool>,
    visible: watch::Sender<bool>,
    last_activity_at: AtomicI64,
}

/// Host-fed environment signals: network, visibility, user activity.
///
/// The embedding layer calls these from its own event listeners; the
/// scheduler reads them at every gate.
#[derive(Clone)]
pub struct HostSignals {
    inner: Arc<SignalState>,
}

impl HostSignals {
    /// Creates signals assuming an online, visible, just-active host.
    #[must_use]
    pub fn new() -> Self {
        let (online, _) = watch::channel(true);
        let (visible, _) = watch::channel(true);
        Self {
            inner: Arc::new(SignalState {
                online,
                visible,
                last_activity_at: AtomicI64::new(now_millis()),
            }),
        }
    }

    /// Reports a network state change. Only transitions notify watchers.
    pub fn set_online(&self, online: bool) {
        self.inner.online.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
    }

    /// Reports a visibility change. Only transitions notify watchers.
    pub fn set_visible(&self, visible: bool) {
        self.inner.visible.send_if_modified(|current| {
            let changed = *current != visible;
            *current = visible;
            changed
        });
    }

    /// Records user activity (pointer, key, touch, scroll) now.
    pub fn note_user_activity(&self) {
        self.note_user_activity_at(now_millis());
    }

    /// Records user activity at an explicit instant.
    pub fn note_user_activity_at(&self, at_millis: i64) {
        self.inner.last_activity_at.store(at_millis, Ordering::Relaxed);
    }

    /// Whether the host currently has network access.
    #[must_use]
    pub fn is_online(&self) -> bool {
        *self.inner.online.borrow()
    }

    /// Whether the host surface is currently visible.
    #[must_use]
    pub fn is_visible(&self) -> bool {
        *self.inner.visible.borrow()
    }

    /// How long the user has been idle as of `now`.
    #[must_use]
    pub fn idle_for(&self, now: i64) -> Duration {
        let last = self.inner.last_activity_at.load(Ordering::Relaxed);
        Duration::from_millis(u64::try_from((now - last).max(0)).unwrap_or(0))
    }

    fn online_receiver(&self) -> watch::Receiver<bool> {
        self.inner.online.subscribe()
    }

    fn visible_receiver(&self) -> watch::Receiver<bool> {
        self.inner.visible.subscribe()
    }
}

impl Default for HostSignals {
    fn default() -> Self {
        Self::new()
    }
}

struct SchedulerInner {
    driver: Arc<dyn SyncDriver>,
    signals: HostSignals,
    config: SchedulerConfig,
    phase: ArcSwap<SchedulerPhase>,
    task: parking_lot::Mutex<Option<(CancellationToken, tokio::task::JoinHandle<()>)>>,
}

impl SchedulerInner {
    /// Tick gate: visibility, network, and idleness with the overdue
    /// override.
    fn should_sync_on_tick(&self, now: i64) -> bool {
        if !self.signals.is_visible() {
            debug!("tick skipped: hidden");
            return false;
        }
        if !self.signals.is_online() {
            debug!("tick skipped: offline");
            return false;
        }
        if self.signals.idle_for(now) > self.config.idle_threshold {
            let overdue_after =
                self.config.base_interval * self.config.idle_override_factor;
            if !self.sync_older_than(now, overdue_after) {
                debug!("tick skipped: user idle");
                return false;
            }
        }
        true
    }

    /// Whether the last sync is older than `age` (never synced counts as
    /// infinitely old).
    fn sync_older_than(&self, now: i64, age: Duration) -> bool {
        match self.driver.last_synced_at() {
            None => true,
            Some(last) => {
                let elapsed = (now - last).max(0);
                u128::try_from(elapsed).unwrap_or(0) > age.as_millis()
            }
        }
    }

    async fn run_pass(&self) {
        self.phase.store(Arc::new(SchedulerPhase::Running));
        let result = self.driver.sync_once().await;
        if !result.errors.is_empty() {
            debug!(errors = ?result.errors, "scheduled sync reported errors");
        }
        self.phase.store(Arc::new(SchedulerPhase::Scheduled));
    }
}

/// Cooperative periodic sync driver for one owner.
pub struct SyncScheduler {
    inner: Arc<SchedulerInner>,
}

impl SyncScheduler {
    /// Creates a scheduler over the given driver and host signals.
    #[must_use]
    pub fn new(
        driver: Arc<dyn SyncDriver>,
        signals: HostSignals,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                driver,
                signals,
                config,
                phase: ArcSwap::from_pointee(SchedulerPhase::Idle),
                task: parking_lot::Mutex::new(None),
            }),
        }
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> SchedulerPhase {
        **self.inner.phase.load()
    }

    /// Starts the scheduler. Idempotent while a task is running; after
    /// `stop()` a fresh task is spawned.
    pub fn start(&self) {
        let mut task = self.inner.task.lock();
        if let Some((_, handle)) = task.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }
        let token = CancellationToken::new();
        let inner = Arc::clone(&self.inner);
        inner.phase.store(Arc::new(SchedulerPhase::Scheduled));
        let handle = tokio::spawn(run_loop(Arc::clone(&inner), token.clone()));
        *task = Some((token, handle));
        info!("sync scheduler started");
    }

    /// Stops the scheduler: the tick source is cancelled and all signal
    /// subscriptions are dropped with the task. An in-flight sync pass runs
    /// to completion before the task exits.
    pub fn stop(&self) {
        let mut task = self.inner.task.lock();
        if let Some((token, _)) = task.take() {
            token.cancel();
            info!("sync scheduler stopped");
        }
    }
}

async fn run_loop(inner: Arc<SchedulerInner>, token: CancellationToken) {
    let mut ticks = tokio::time::interval(inner.config.base_interval);
    ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick of a tokio interval fires immediately; consume it so
    // the first scheduled pass happens one base interval after start.
    ticks.tick().await;

    let mut online_rx = inner.signals.online_receiver();
    let mut visible_rx = inner.signals.visible_receiver();

    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = ticks.tick() => {
                if inner.should_sync_on_tick(now_millis()) {
                    inner.run_pass().await;
                }
            }
            changed = online_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                if *online_rx.borrow_and_update() {
                    // Back online: sync immediately.
                    inner.run_pass().await;
                }
            }
            changed = visible_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let visible = *visible_rx.borrow_and_update();
                if visible
                    && inner.sync_older_than(now_millis(), inner.config.visible_stale_after)
                {
                    inner.run_pass().await;
                }
            }
        }
    }
    inner.phase.store(Arc::new(SchedulerPhase::Stopped));
}

/// Process-wide scheduler registry, one scheduler per normalized owner.
///
/// `get_or_create` is idempotent: a second call for the same owner returns
/// the existing scheduler, never a second driving task.
#[derive(Default)]
pub struct SchedulerRegistry {
    schedulers: DashMap<String, Arc<SyncScheduler>>,
}

impl SchedulerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the owner's scheduler, creating it with `make` on first use.
    pub fn get_or_create<F>(&self, owner: &str, make: F) -> Arc<SyncScheduler>
    where
        F: FnOnce() -> SyncScheduler,
    {
        Arc::clone(
            &self
                .schedulers
                .entry(owner.to_lowercase())
                .or_insert_with(|| Arc::new(make())),
        )
    }

    /// Stops and removes the owner's scheduler.
    pub fn remove(&self, owner: &str) {
        if let Some((_, scheduler)) = self.schedulers.remove(&owner.to_lowercase()) {
            scheduler.stop();
        }
    }

    /// Number of live schedulers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.schedulers.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.schedulers.is_empty()
    }
}
