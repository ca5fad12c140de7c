//! Background sync reconciler.
//!
//! Drains each session's durable queue against the remote store, strictly
//! in sequence order per session. Transient failures back off with a
//! capped exponential delay and a bounded attempt budget; permanent
//! failures are marked and skipped so one bad entry never wedges the rest
//! of its session's queue. Different sessions are fully independent.
//!
//! The reconciler runs on its own thread (`spawn`) and is woken by
//! connectivity-change messages on a channel, or by a poll-interval
//! timeout while entries are pending. Errors inside the loop are logged,
//! never propagated out of it.

use crate::queue::EventQueue;
use crate::remote::{Connectivity, RemoteResponse, RemoteStore};
use crate::store::SessionStore;
use crate::{DomainEvent, Result, SyncStatus};
use chrono::{DateTime, Duration, Utc};
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::thread::JoinHandle;
use uuid::Uuid;

/// Retry discipline for transient failures
#[derive(Clone, Debug)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::milliseconds(500),
            cap: Duration::seconds(60),
            max_attempts: 8,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the next attempt, given how many have already been
    /// made: base doubled per attempt, capped.
    pub fn delay_after(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::zero();
        }
        let shift = (attempts - 1).min(20);
        let delay = self.base * 2i32.saturating_pow(shift);
        delay.min(self.cap)
    }

    /// Whether an entry attempted at `last_attempt_at` is eligible again
    fn eligible(&self, attempts: u32, last_attempt_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match last_attempt_at {
            None => true,
            Some(last) => now >= last + self.delay_after(attempts),
        }
    }
}

/// Messages that wake the background loop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectivityChange {
    Online,
    Offline,
    Shutdown,
}

/// Summary of one drain pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub confirmed: usize,
    /// (session, sequence) pairs newly marked failed this pass
    pub failed: Vec<(Uuid, u64)>,
    pub still_pending: usize,
}

pub struct Reconciler<R: RemoteStore, C: Connectivity> {
    queue_dir: PathBuf,
    store: SessionStore,
    remote: R,
    connectivity: C,
    policy: BackoffPolicy,
}

impl<R: RemoteStore, C: Connectivity> Reconciler<R, C> {
    pub fn new(
        queue_dir: impl Into<PathBuf>,
        store: SessionStore,
        remote: R,
        connectivity: C,
        policy: BackoffPolicy,
    ) -> Self {
        Self {
            queue_dir: queue_dir.into(),
            store,
            remote,
            connectivity,
            policy,
        }
    }

    /// One pass over every session queue. Sessions drain independently; a
    /// failure in one never blocks another.
    pub fn drain_once(&self, now: DateTime<Utc>) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        for session_id in EventQueue::sessions(&self.queue_dir)? {
            if let Err(e) = self.drain_session(session_id, now, &mut report) {
                tracing::warn!(session = %session_id, "Drain failed: {}", e);
            }
        }
        Ok(report)
    }

    fn drain_session(
        &self,
        session_id: Uuid,
        now: DateTime<Utc>,
        report: &mut DrainReport,
    ) -> Result<()> {
        let queue = EventQueue::for_session(&self.queue_dir, session_id);
        let state = queue.load()?;

        let mut halted = false;
        let mut newly_failed = 0usize;
        for entry in &state.pending {
            if halted {
                report.still_pending += 1;
                continue;
            }

            // Retry budget exhausted: mark failed, surface once, move on
            if entry.attempts >= self.policy.max_attempts {
                queue.mark_failed(entry.sequence_no)?;
                self.flag_set_status(session_id, &entry.event, SyncStatus::Failed);
                report.failed.push((session_id, entry.sequence_no));
                newly_failed += 1;
                tracing::warn!(
                    session = %session_id,
                    sequence_no = entry.sequence_no,
                    attempts = entry.attempts,
                    "Entry exceeded retry budget, marked failed"
                );
                continue;
            }

            // Backoff: an entry mid-retry blocks later entries of the same
            // session (ordering), but not other sessions.
            if !self
                .policy
                .eligible(entry.attempts, entry.last_attempt_at, now)
            {
                report.still_pending += 1;
                halted = true;
                continue;
            }

            queue.record_attempt(entry.sequence_no, now)?;
            match self
                .remote
                .apply_event(session_id, entry.sequence_no, &entry.event)
            {
                RemoteResponse::Ack => {
                    queue.mark_confirmed(entry.sequence_no)?;
                    self.flag_set_status(session_id, &entry.event, SyncStatus::Confirmed);
                    report.confirmed += 1;
                    tracing::debug!(
                        session = %session_id,
                        sequence_no = entry.sequence_no,
                        "Entry confirmed"
                    );
                }
                RemoteResponse::Transient(reason) => {
                    tracing::debug!(
                        session = %session_id,
                        sequence_no = entry.sequence_no,
                        "Transient delivery failure: {}",
                        reason
                    );
                    report.still_pending += 1;
                    halted = true;
                }
                RemoteResponse::Permanent(reason) => {
                    queue.mark_failed(entry.sequence_no)?;
                    self.flag_set_status(session_id, &entry.event, SyncStatus::Failed);
                    report.failed.push((session_id, entry.sequence_no));
                    newly_failed += 1;
                    tracing::warn!(
                        session = %session_id,
                        sequence_no = entry.sequence_no,
                        "Remote rejected entry: {}",
                        reason
                    );
                    // Later entries keep going; one bad entry must not
                    // wedge the queue.
                }
            }
        }

        if !halted && newly_failed == 0 && !state.pending.is_empty() {
            // Everything confirmed; shrink the log
            queue.compact()?;
        }
        Ok(())
    }

    /// Reflect delivery outcome onto the affected set's sync status, so a
    /// permanent failure is tied to the specific set it concerns.
    fn flag_set_status(&self, session_id: Uuid, event: &DomainEvent, status: SyncStatus) {
        if let DomainEvent::SetCompleted { set } = event {
            if let Err(e) = self.store.mark_set_status(session_id, set.id, status) {
                tracing::warn!(
                    session = %session_id,
                    set = %set.id,
                    "Failed to update set sync status: {}",
                    e
                );
            }
        }
    }

    /// Background loop: wake on connectivity changes or every
    /// `poll_interval` while entries may be pending.
    pub fn run(&self, wake: Receiver<ConnectivityChange>, poll_interval: std::time::Duration) {
        tracing::info!("Sync reconciler started");
        loop {
            match wake.recv_timeout(poll_interval) {
                Ok(ConnectivityChange::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                    tracing::info!("Sync reconciler stopping");
                    break;
                }
                Ok(ConnectivityChange::Offline) => continue,
                Ok(ConnectivityChange::Online) | Err(RecvTimeoutError::Timeout) => {}
            }
            if !self.connectivity.is_online() {
                continue;
            }
            match self.drain_once(Utc::now()) {
                Ok(report) if report.confirmed > 0 || !report.failed.is_empty() => {
                    tracing::info!(
                        confirmed = report.confirmed,
                        failed = report.failed.len(),
                        pending = report.still_pending,
                        "Sync pass finished"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Sync pass failed: {}", e),
            }
        }
    }

    /// Run the reconciler on its own thread
    pub fn spawn(
        self,
        wake: Receiver<ConnectivityChange>,
        poll_interval: std::time::Duration,
    ) -> JoinHandle<()>
    where
        R: Send + 'static,
        C: Send + 'static,
    {
        std::thread::spawn(move || self.run(wake, poll_interval))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::AlwaysOnline;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::path::Path;

    fn paused_event() -> DomainEvent {
        DomainEvent::SessionPaused { at: Utc::now() }
    }

    fn store_in(dir: &Path) -> SessionStore {
        SessionStore::open(dir).unwrap()
    }

    /// Remote double with scripted responses keyed by (session, sequence);
    /// unscripted events ack. Applied sequence numbers are recorded in
    /// arrival order.
    struct ScriptedRemote {
        scripts: RefCell<HashMap<(Uuid, u64), Vec<RemoteResponse>>>,
        applied: RefCell<Vec<u64>>,
    }

    impl ScriptedRemote {
        fn new() -> Self {
            Self {
                scripts: RefCell::new(HashMap::new()),
                applied: RefCell::new(Vec::new()),
            }
        }

        fn script(self, session_id: Uuid, sequence_no: u64, responses: Vec<RemoteResponse>) -> Self {
            self.scripts
                .borrow_mut()
                .insert((session_id, sequence_no), responses);
            self
        }
    }

    impl RemoteStore for ScriptedRemote {
        fn apply_event(&self, session_id: Uuid, sequence_no: u64, _: &DomainEvent) -> RemoteResponse {
            let mut scripts = self.scripts.borrow_mut();
            if let Some(responses) = scripts.get_mut(&(session_id, sequence_no)) {
                if !responses.is_empty() {
                    return responses.remove(0);
                }
            }
            self.applied.borrow_mut().push(sequence_no);
            RemoteResponse::Ack
        }
    }

    fn reconciler_with(
        dir: &Path,
        remote: ScriptedRemote,
        policy: BackoffPolicy,
    ) -> Reconciler<ScriptedRemote, AlwaysOnline> {
        Reconciler::new(
            dir.join("queue"),
            store_in(dir),
            remote,
            AlwaysOnline,
            policy,
        )
    }

    fn instant_policy() -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::zero(),
            cap: Duration::zero(),
            max_attempts: 8,
        }
    }

    fn enqueue_n(dir: &Path, session: Uuid, n: u64) {
        let queue = EventQueue::for_session(&dir.join("queue"), session);
        for _ in 0..n {
            queue.enqueue(paused_event(), Utc::now()).unwrap();
        }
    }

    #[test]
    fn test_drains_in_order_and_empties_queue() {
        // Scenario C: three events queued offline, connectivity restored,
        // all confirmed in original order, queue empties.
        let temp_dir = tempfile::tempdir().unwrap();
        let session = Uuid::new_v4();
        enqueue_n(temp_dir.path(), session, 3);

        let reconciler = reconciler_with(temp_dir.path(), ScriptedRemote::new(), instant_policy());
        let report = reconciler.drain_once(Utc::now()).unwrap();

        assert_eq!(report.confirmed, 3);
        assert!(report.failed.is_empty());
        assert_eq!(report.still_pending, 0);
        assert_eq!(*reconciler.remote.applied.borrow(), vec![1, 2, 3]);

        let queue = EventQueue::for_session(&temp_dir.path().join("queue"), session);
        assert!(queue.load().unwrap().pending.is_empty());
    }

    #[test]
    fn test_later_entry_never_confirmed_before_retrying_earlier() {
        // Entry 2 fails transiently; entry 3 must wait until 2 is confirmed.
        let temp_dir = tempfile::tempdir().unwrap();
        let session = Uuid::new_v4();
        enqueue_n(temp_dir.path(), session, 3);

        let remote =
            ScriptedRemote::new().script(session, 2, vec![RemoteResponse::Transient("flaky".into())]);
        let reconciler = reconciler_with(temp_dir.path(), remote, instant_policy());

        let first = reconciler.drain_once(Utc::now()).unwrap();
        assert_eq!(first.confirmed, 1);
        assert_eq!(first.still_pending, 2);
        assert_eq!(*reconciler.remote.applied.borrow(), vec![1]);

        let second = reconciler.drain_once(Utc::now()).unwrap();
        assert_eq!(second.confirmed, 2);
        // 2 retried and applied strictly before 3
        assert_eq!(*reconciler.remote.applied.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn test_permanent_failure_skipped_not_wedging() {
        let temp_dir = tempfile::tempdir().unwrap();
        let session = Uuid::new_v4();
        enqueue_n(temp_dir.path(), session, 3);

        let remote = ScriptedRemote::new().script(
            session,
            2,
            vec![RemoteResponse::Permanent("bad payload".into())],
        );
        let reconciler = reconciler_with(temp_dir.path(), remote, instant_policy());

        let report = reconciler.drain_once(Utc::now()).unwrap();
        assert_eq!(report.confirmed, 2);
        assert_eq!(report.failed, vec![(session, 2)]);
        assert_eq!(*reconciler.remote.applied.borrow(), vec![1, 3]);

        // Failed entry is surfaced, not pending, and not retried next pass
        let queue = EventQueue::for_session(&temp_dir.path().join("queue"), session);
        let state = queue.load().unwrap();
        assert!(state.pending.is_empty());
        assert_eq!(state.failed.len(), 1);

        let next = reconciler.drain_once(Utc::now()).unwrap();
        assert_eq!(next.confirmed, 0);
        assert!(next.failed.is_empty());
    }

    #[test]
    fn test_retry_budget_bounded() {
        let temp_dir = tempfile::tempdir().unwrap();
        let session = Uuid::new_v4();
        enqueue_n(temp_dir.path(), session, 1);

        let policy = BackoffPolicy {
            base: Duration::zero(),
            cap: Duration::zero(),
            max_attempts: 3,
        };
        let remote = ScriptedRemote::new().script(
            session,
            1,
            vec![RemoteResponse::Transient("down".into()); 10],
        );
        let reconciler = reconciler_with(temp_dir.path(), remote, policy);

        for _ in 0..3 {
            reconciler.drain_once(Utc::now()).unwrap();
        }
        // Fourth pass sees attempts == max and fails the entry
        let report = reconciler.drain_once(Utc::now()).unwrap();
        assert_eq!(report.failed, vec![(session, 1)]);

        let queue = EventQueue::for_session(&temp_dir.path().join("queue"), session);
        assert!(queue.load().unwrap().pending.is_empty());
    }

    #[test]
    fn test_sessions_drain_independently() {
        let temp_dir = tempfile::tempdir().unwrap();
        let stuck = Uuid::new_v4();
        let healthy = Uuid::new_v4();
        enqueue_n(temp_dir.path(), stuck, 1);
        enqueue_n(temp_dir.path(), healthy, 2);

        let remote = ScriptedRemote::new().script(
            stuck,
            1,
            vec![RemoteResponse::Transient("down".into()); 10],
        );
        let reconciler = reconciler_with(temp_dir.path(), remote, instant_policy());
        let report = reconciler.drain_once(Utc::now()).unwrap();

        // The stuck session halts on its first entry; the healthy session
        // is unaffected and fully confirms.
        assert_eq!(report.confirmed, 2);
        assert_eq!(report.still_pending, 1);
        assert_eq!(*reconciler.remote.applied.borrow(), vec![1, 2]);

        let queue_dir = temp_dir.path().join("queue");
        let healthy_queue = EventQueue::for_session(&queue_dir, healthy);
        assert!(healthy_queue.load().unwrap().pending.is_empty());
        let stuck_queue = EventQueue::for_session(&queue_dir, stuck);
        assert_eq!(stuck_queue.load().unwrap().pending.len(), 1);
    }

    #[test]
    fn test_backoff_delays_grow_and_cap() {
        let policy = BackoffPolicy {
            base: Duration::milliseconds(500),
            cap: Duration::seconds(8),
            max_attempts: 10,
        };
        assert_eq!(policy.delay_after(0), Duration::zero());
        assert_eq!(policy.delay_after(1), Duration::milliseconds(500));
        assert_eq!(policy.delay_after(2), Duration::seconds(1));
        assert_eq!(policy.delay_after(4), Duration::seconds(4));
        // Capped
        assert_eq!(policy.delay_after(6), Duration::seconds(8));
        assert_eq!(policy.delay_after(20), Duration::seconds(8));
    }

    #[test]
    fn test_entry_in_backoff_blocks_its_session() {
        let temp_dir = tempfile::tempdir().unwrap();
        let session = Uuid::new_v4();
        enqueue_n(temp_dir.path(), session, 2);

        let policy = BackoffPolicy {
            base: Duration::hours(1),
            cap: Duration::hours(1),
            max_attempts: 8,
        };
        let remote =
            ScriptedRemote::new().script(session, 1, vec![RemoteResponse::Transient("down".into())]);
        let reconciler = reconciler_with(temp_dir.path(), remote, policy);

        let now = Utc::now();
        let first = reconciler.drain_once(now).unwrap();
        assert_eq!(first.confirmed, 0);
        assert_eq!(first.still_pending, 2);

        // Immediately after, entry 1 is still backing off; nothing happens
        let second = reconciler.drain_once(now).unwrap();
        assert_eq!(second.confirmed, 0);
        assert_eq!(second.still_pending, 2);
        assert!(reconciler.remote.applied.borrow().is_empty());

        // Once the backoff has elapsed, both entries go through in order
        let third = reconciler.drain_once(now + Duration::hours(2)).unwrap();
        assert_eq!(third.confirmed, 2);
        assert_eq!(*reconciler.remote.applied.borrow(), vec![1, 2]);
    }

    #[test]
    fn test_run_loop_drains_on_poll_timeout() {
        let temp_dir = tempfile::tempdir().unwrap();
        let session = Uuid::new_v4();
        enqueue_n(temp_dir.path(), session, 2);

        let remote_dir = temp_dir.path().join("remote");
        std::fs::create_dir_all(&remote_dir).unwrap();
        let reconciler = Reconciler::new(
            temp_dir.path().join("queue"),
            store_in(temp_dir.path()),
            crate::remote::DirRemoteStore::new(&remote_dir),
            AlwaysOnline,
            BackoffPolicy::default(),
        );

        let (tx, rx) = std::sync::mpsc::channel();
        let handle = reconciler.spawn(rx, std::time::Duration::from_millis(5));

        // No Online nudge is ever sent; the poll interval alone must drain
        let queue = EventQueue::for_session(&temp_dir.path().join("queue"), session);
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !queue.load().unwrap().pending.is_empty() {
            assert!(
                std::time::Instant::now() < deadline,
                "poll loop never drained the queue"
            );
            std::thread::sleep(std::time::Duration::from_millis(10));
        }

        tx.send(ConnectivityChange::Shutdown).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_run_loop_shutdown() {
        let temp_dir = tempfile::tempdir().unwrap();
        let reconciler = Reconciler::new(
            temp_dir.path().join("queue"),
            store_in(temp_dir.path()),
            crate::remote::DirRemoteStore::new(temp_dir.path().join("remote")),
            AlwaysOnline,
            BackoffPolicy::default(),
        );
        let (tx, rx) = std::sync::mpsc::channel();
        let handle = reconciler.spawn(rx, std::time::Duration::from_millis(10));
        tx.send(ConnectivityChange::Shutdown).unwrap();
        handle.join().unwrap();
    }
}
