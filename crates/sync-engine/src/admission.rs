//! Render admission gate.
//!
//! Several producers race to show the task list: the local cache, a remote
//! fetch, server-rendered content and realtime pushes. The gate decides
//! which of their snapshots reach the [`Presenter`], so the list never
//! flashes empty and an unchanged list is never drawn twice.

use serde_json::Value;
use std::sync::Arc;
use store::TaskView;
use tasks::checksum::hash_value;
use tasks::Checksum;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::{Result, SyncError};

/// Where a proposed snapshot came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotSource {
    LocalCache,
    RemoteFetch,
    ServerRendered,
    Realtime,
    Optimistic,
}

/// A complete task list proposed for presentation
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub source: SnapshotSource,
    pub tasks: Vec<TaskView>,
    fingerprint: Checksum,
}

impl Snapshot {
    pub fn new(source: SnapshotSource, tasks: Vec<TaskView>) -> Self {
        let fingerprint = fingerprint(&tasks);
        Self {
            source,
            tasks,
            fingerprint,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Order-independent content identity over id, last modification,
    /// status and pin flag.
    pub fn fingerprint(&self) -> &Checksum {
        &self.fingerprint
    }
}

fn fingerprint(tasks: &[TaskView]) -> Checksum {
    let mut parts: Vec<String> = tasks
        .iter()
        .map(|view| {
            let task = &view.task;
            let modified = task
                .updated_at
                .map(|at| at.timestamp_millis().to_string())
                .unwrap_or_default();
            format!(
                "{}|{}|{}|{}",
                task.id.key(),
                modified,
                task.status.as_str(),
                task.pinned
            )
        })
        .collect();
    parts.sort_unstable();
    hash_value(&Value::from(parts))
}

/// Receives admitted snapshots
#[async_trait::async_trait]
pub trait Presenter: Send + Sync {
    async fn present(&self, snapshot: &Snapshot) -> Result<()>;
}

/// Presenter that forwards admitted snapshots over a channel, for
/// presentation layers living in another task.
pub struct ChannelPresenter {
    tx: mpsc::UnboundedSender<Snapshot>,
}

impl ChannelPresenter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Snapshot>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait::async_trait]
impl Presenter for ChannelPresenter {
    async fn present(&self, snapshot: &Snapshot) -> Result<()> {
        self.tx
            .send(snapshot.clone())
            .map_err(|_| SyncError::PresenterClosed)
    }
}

/// Diagnostic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateStats {
    pub applied: u64,
    pub skipped_identical: u64,
    pub dropped_empty: u64,
    pub deferred: u64,
    pub queued: u64,
    pub hydrations: u64,
}

/// What the gate did with a proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Handed to the presenter
    Applied,

    /// Same content as what is on screen
    SkippedIdentical,

    /// Empty, and would have cleared visible content
    DroppedEmpty,

    /// Empty before hydration; parked in the deferred slot
    Deferred,

    /// Arrived during an apply; parked in the pending slot
    Queued,
}

#[derive(Default)]
struct GateState {
    hydrated: bool,
    applying: bool,
    presented: Option<Checksum>,
    presented_empty: bool,
    deferred: Option<Snapshot>,
    pending: Option<Snapshot>,
    stats: GateStats,
}

impl GateState {
    /// Admission decision for a proposal when no apply is in flight.
    fn decide(&mut self, snapshot: Snapshot) -> std::result::Result<Snapshot, Admission> {
        if !self.hydrated {
            if snapshot.is_empty() {
                if self.deferred.replace(snapshot).is_some() {
                    debug!("older deferred snapshot superseded");
                }
                self.stats.deferred += 1;
                return Err(Admission::Deferred);
            }
            return Ok(snapshot);
        }
        if self.presented.as_ref() == Some(snapshot.fingerprint()) {
            self.stats.skipped_identical += 1;
            return Err(Admission::SkippedIdentical);
        }
        if snapshot.is_empty() && !self.presented_empty {
            self.stats.dropped_empty += 1;
            debug!(source = ?snapshot.source, "dropped empty snapshot over visible content");
            return Err(Admission::DroppedEmpty);
        }
        Ok(snapshot)
    }

    /// Records a finished apply. Returns true on the transition to
    /// hydrated.
    fn presented(&mut self, snapshot: &Snapshot, authoritative: bool) -> bool {
        self.stats.applied += 1;
        self.presented = Some(snapshot.fingerprint().clone());
        self.presented_empty = snapshot.is_empty();
        if self.hydrated || (snapshot.is_empty() && !authoritative) {
            return false;
        }
        self.hydrated = true;
        self.stats.hydrations += 1;
        if self.deferred.take().is_some() {
            self.stats.dropped_empty += 1;
        }
        true
    }

    /// Takes the next pending snapshot worth applying, or ends the apply.
    fn next_pending(&mut self) -> Option<Snapshot> {
        while let Some(pending) = self.pending.take() {
            if let Ok(next) = self.decide(pending) {
                return Some(next);
            }
        }
        self.applying = false;
        None
    }
}

/// Ends an apply that did not run to completion: the presenter failed, or
/// the proposing future was dropped while the presenter was awaited. The
/// pending slot is cleared with it; the next proposal supersedes it.
struct ApplyGuard<'a> {
    state: &'a parking_lot::Mutex<GateState>,
    finished: bool,
}

impl Drop for ApplyGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut state = self.state.lock();
        state.applying = false;
        if state.pending.take().is_some() {
            debug!("pending snapshot dropped with abandoned apply");
        }
    }
}

/// Decides which proposed snapshots reach the presenter.
///
/// Starts not hydrated. The first non-empty snapshot is applied and
/// completes hydration; empty proposals before that wait in a single
/// latest-wins slot. Once hydrated, proposals identical to what is on
/// screen are skipped and empty ones never clear visible content.
/// Applies are exclusive: a proposal arriving during one waits in a single
/// pending slot and is considered when the apply finishes.
pub struct RenderAdmissionGate {
    presenter: Arc<dyn Presenter>,
    state: parking_lot::Mutex<GateState>,
    hydration: watch::Sender<bool>,
}

impl RenderAdmissionGate {
    pub fn new(presenter: Arc<dyn Presenter>) -> Self {
        let (hydration, _) = watch::channel(false);
        Self {
            presenter,
            state: parking_lot::Mutex::new(GateState::default()),
            hydration,
        }
    }

    /// Gate for a surface that already shows `on_screen`. Non-empty content
    /// counts as an implicit hydration.
    pub fn with_presented(presenter: Arc<dyn Presenter>, on_screen: &Snapshot) -> Self {
        let gate = Self::new(presenter);
        if !on_screen.is_empty() {
            let mut state = gate.state.lock();
            state.hydrated = true;
            state.presented = Some(on_screen.fingerprint().clone());
            state.stats.hydrations = 1;
            drop(state);
            gate.hydration.send_replace(true);
        }
        gate
    }

    pub async fn propose(&self, snapshot: Snapshot) -> Result<Admission> {
        let admitted = {
            let mut state = self.state.lock();
            if state.applying {
                if state.pending.replace(snapshot).is_some() {
                    debug!("pending snapshot superseded");
                }
                state.stats.queued += 1;
                return Ok(Admission::Queued);
            }
            match state.decide(snapshot) {
                Ok(admitted) => {
                    state.applying = true;
                    admitted
                }
                Err(outcome) => return Ok(outcome),
            }
        };
        self.apply(admitted, false).await?;
        Ok(Admission::Applied)
    }

    /// Presents the deferred empty snapshot once the remote authority has
    /// confirmed the list really is empty. Completes hydration.
    pub async fn flush_deferred(&self) -> Result<Option<Admission>> {
        let deferred = {
            let mut state = self.state.lock();
            if state.hydrated || state.applying {
                return Ok(None);
            }
            let Some(deferred) = state.deferred.take() else {
                return Ok(None);
            };
            state.applying = true;
            deferred
        };
        self.apply(deferred, true).await?;
        Ok(Some(Admission::Applied))
    }

    async fn apply(&self, mut snapshot: Snapshot, mut authoritative: bool) -> Result<()> {
        let mut guard = ApplyGuard {
            state: &self.state,
            finished: false,
        };
        loop {
            // A failed present leaves the apply to the guard.
            self.presenter.present(&snapshot).await?;
            let next = {
                let mut state = self.state.lock();
                if state.presented(&snapshot, authoritative) {
                    info!(source = ?snapshot.source, tasks = snapshot.len(), "hydrated");
                    self.hydration.send_replace(true);
                }
                state.next_pending()
            };
            match next {
                Some(pending) => {
                    snapshot = pending;
                    authoritative = false;
                }
                None => {
                    guard.finished = true;
                    return Ok(());
                }
            }
        }
    }

    pub fn is_hydrated(&self) -> bool {
        self.state.lock().hydrated
    }

    pub fn stats(&self) -> GateStats {
        self.state.lock().stats
    }

    /// `hydrationReady` for the presentation layer.
    pub fn subscribe_hydration(&self) -> watch::Receiver<bool> {
        self.hydration.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tasks::{Task, TaskId, TaskStatus};

    /// Records every presented snapshot and the peak number of concurrent
    /// presents.
    #[derive(Default)]
    struct RecordingPresenter {
        shown: Mutex<Vec<Snapshot>>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        delay_ms: u64,
    }

    #[async_trait::async_trait]
    impl Presenter for RecordingPresenter {
        async fn present(&self, snapshot: &Snapshot) -> Result<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if self.delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
            }
            self.shown.lock().push(snapshot.clone());
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn views(count: i64) -> Vec<TaskView> {
        let at = Utc::now() - Duration::hours(1);
        (1..=count)
            .map(|id| {
                let mut task = Task::new(TaskId::Confirmed(id), format!("task {id}"));
                task.updated_at = Some(at);
                TaskView { task, sync: None }
            })
            .collect()
    }

    fn snapshot(source: SnapshotSource, count: i64) -> Snapshot {
        Snapshot::new(source, views(count))
    }

    #[test]
    fn test_fingerprint_ignores_order_and_tracks_status() {
        let tasks = views(3);
        let mut reversed = tasks.clone();
        reversed.reverse();
        let a = Snapshot::new(SnapshotSource::LocalCache, tasks.clone());
        let b = Snapshot::new(SnapshotSource::RemoteFetch, reversed);
        assert_eq!(a.fingerprint(), b.fingerprint());

        let mut changed = tasks.clone();
        changed[0].task.status = TaskStatus::Completed;
        let c = Snapshot::new(SnapshotSource::Realtime, changed);
        assert_ne!(a.fingerprint(), c.fingerprint());

        let mut pinned = tasks;
        pinned[1].task.pinned = true;
        let d = Snapshot::new(SnapshotSource::Realtime, pinned);
        assert_ne!(a.fingerprint(), d.fingerprint());
    }

    #[tokio::test]
    async fn test_empty_then_full_presents_only_full() {
        let presenter = Arc::new(RecordingPresenter::default());
        let gate = RenderAdmissionGate::new(presenter.clone());
        let mut ready = gate.subscribe_hydration();

        assert_eq!(
            gate.propose(snapshot(SnapshotSource::LocalCache, 0)).await.unwrap(),
            Admission::Deferred
        );
        assert!(!*ready.borrow());

        assert_eq!(
            gate.propose(snapshot(SnapshotSource::RemoteFetch, 5)).await.unwrap(),
            Admission::Applied
        );
        let shown = presenter.shown.lock().clone();
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].len(), 5);

        let stats = gate.stats();
        assert_eq!(stats.hydrations, 1);
        assert_eq!(stats.dropped_empty, 1);
        assert!(gate.is_hydrated());
        ready.changed().await.unwrap();
        assert!(*ready.borrow());

        // a later full snapshot does not hydrate again
        gate.propose(snapshot(SnapshotSource::Realtime, 6)).await.unwrap();
        assert_eq!(gate.stats().hydrations, 1);
    }

    #[tokio::test]
    async fn test_identical_snapshot_does_no_work() {
        let presenter = Arc::new(RecordingPresenter::default());
        let gate = RenderAdmissionGate::new(presenter.clone());
        gate.propose(snapshot(SnapshotSource::LocalCache, 5)).await.unwrap();

        let outcome = gate
            .propose(snapshot(SnapshotSource::RemoteFetch, 5))
            .await
            .unwrap();
        assert_eq!(outcome, Admission::SkippedIdentical);
        assert_eq!(gate.stats().skipped_identical, 1);
        assert_eq!(presenter.shown.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_never_clears_visible_content() {
        let presenter = Arc::new(RecordingPresenter::default());
        let gate = RenderAdmissionGate::new(presenter.clone());
        gate.propose(snapshot(SnapshotSource::LocalCache, 2)).await.unwrap();

        let outcome = gate
            .propose(snapshot(SnapshotSource::RemoteFetch, 0))
            .await
            .unwrap();
        assert_eq!(outcome, Admission::DroppedEmpty);
        assert_eq!(presenter.shown.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_pre_existing_content_is_implicit_hydration() {
        let presenter = Arc::new(RecordingPresenter::default());
        let on_screen = snapshot(SnapshotSource::ServerRendered, 3);
        let gate = RenderAdmissionGate::with_presented(presenter.clone(), &on_screen);
        assert!(gate.is_hydrated());
        assert!(*gate.subscribe_hydration().borrow());

        let outcome = gate
            .propose(snapshot(SnapshotSource::LocalCache, 3))
            .await
            .unwrap();
        assert_eq!(outcome, Admission::SkippedIdentical);
        assert!(presenter.shown.lock().is_empty());
    }

    #[tokio::test]
    async fn test_flush_deferred_hydrates_on_authoritative_empty() {
        let presenter = Arc::new(RecordingPresenter::default());
        let gate = RenderAdmissionGate::new(presenter.clone());
        gate.propose(snapshot(SnapshotSource::LocalCache, 0)).await.unwrap();
        gate.propose(snapshot(SnapshotSource::RemoteFetch, 0)).await.unwrap();
        assert_eq!(gate.stats().deferred, 2);

        assert_eq!(gate.flush_deferred().await.unwrap(), Some(Admission::Applied));
        assert!(gate.is_hydrated());
        let shown = presenter.shown.lock().clone();
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].source, SnapshotSource::RemoteFetch);

        assert_eq!(gate.flush_deferred().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_proposal_during_apply_waits_for_it() {
        let presenter = Arc::new(RecordingPresenter {
            delay_ms: 50,
            ..Default::default()
        });
        let gate = RenderAdmissionGate::new(presenter.clone());

        let (first, second, third) = tokio::join!(
            gate.propose(snapshot(SnapshotSource::LocalCache, 1)),
            async {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                gate.propose(snapshot(SnapshotSource::RemoteFetch, 2)).await
            },
            async {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                gate.propose(snapshot(SnapshotSource::Realtime, 3)).await
            },
        );
        assert_eq!(first.unwrap(), Admission::Applied);
        assert_eq!(second.unwrap(), Admission::Queued);
        assert_eq!(third.unwrap(), Admission::Queued);

        let shown: Vec<usize> = presenter.shown.lock().iter().map(Snapshot::len).collect();
        assert_eq!(shown, vec![1, 3]);
        assert_eq!(presenter.peak.load(Ordering::SeqCst), 1);
        assert_eq!(gate.stats().queued, 2);
    }

    #[tokio::test]
    async fn test_abandoned_apply_does_not_wedge_the_gate() {
        let presenter = Arc::new(RecordingPresenter {
            delay_ms: 50,
            ..Default::default()
        });
        let gate = RenderAdmissionGate::new(presenter.clone());

        let abandoned = tokio::time::timeout(
            std::time::Duration::from_millis(5),
            gate.propose(snapshot(SnapshotSource::LocalCache, 1)),
        )
        .await;
        assert!(abandoned.is_err());
        assert!(presenter.shown.lock().is_empty());

        let outcome = gate
            .propose(snapshot(SnapshotSource::RemoteFetch, 2))
            .await
            .unwrap();
        assert_eq!(outcome, Admission::Applied);
        assert_eq!(presenter.shown.lock().len(), 1);
        assert!(gate.is_hydrated());
    }

    #[tokio::test]
    async fn test_channel_presenter_forwards_and_reports_closed() {
        let (presenter, mut rx) = ChannelPresenter::new();
        let gate = RenderAdmissionGate::new(Arc::new(presenter));
        gate.propose(snapshot(SnapshotSource::LocalCache, 2)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().len(), 2);

        drop(rx);
        let err = gate
            .propose(snapshot(SnapshotSource::RemoteFetch, 4))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::PresenterClosed));

        // a failed apply does not wedge the gate
        assert!(matches!(
            gate.propose(snapshot(SnapshotSource::Realtime, 5)).await,
            Err(SyncError::PresenterClosed)
        ));
    }
}
