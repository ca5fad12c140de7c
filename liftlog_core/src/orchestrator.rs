//! Session orchestrator: the session-id-keyed registry that accepts
//! domain events, runs the pure transition function, and executes the
//! declared side effects against the durable stores.
//!
//! Exactly one orchestrator owns a live session at a time; distinct
//! sessions are independent. Every event bound for the remote is durably
//! queued before the transition is considered final, and a sync failure
//! afterwards never rolls an accepted transition back.

use crate::machine::{self, SessionEvent, SetRecord, SideEffect};
use crate::metrics::{self, CalorieModel};
use crate::queue::EventQueue;
use crate::rest::{self, FatigueEstimator, FileFatigueEstimator};
use crate::store::SessionStore;
use crate::{
    CompletedSet, Config, DomainEvent, Error, Result, Session, SessionMetricsSnapshot,
    SessionOptions, SyncStatus,
};
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use uuid::Uuid;

type Subscriber = Box<dyn Fn(&Session) + Send>;

struct LiveSession {
    session: Session,
    sets: Vec<CompletedSet>,
}

/// Sync state of a session's queue, for the offline/pending indicator
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncIndicator {
    pub pending: usize,
    pub failed: usize,
}

pub struct Orchestrator {
    store: SessionStore,
    queue_dir: PathBuf,
    base_rest_seconds: u32,
    max_fatigue_multiplier: f32,
    calories: CalorieModel,
    fatigue: Box<dyn FatigueEstimator + Send>,
    live: HashMap<Uuid, LiveSession>,
    subscribers: HashMap<Uuid, Vec<Subscriber>>,
}

impl Orchestrator {
    /// Open an orchestrator over `data_dir`, wiring the file-backed
    /// recovery signal at `<data_dir>/recovery.json` (neutral when absent)
    pub fn open(data_dir: &Path, config: &Config) -> Result<Self> {
        let fatigue = FileFatigueEstimator::new(data_dir.join("recovery.json"));
        Self::with_fatigue(data_dir, config, Box::new(fatigue))
    }

    /// Open with an explicit fatigue estimator
    pub fn with_fatigue(
        data_dir: &Path,
        config: &Config,
        fatigue: Box<dyn FatigueEstimator + Send>,
    ) -> Result<Self> {
        let store = SessionStore::open(data_dir)?;
        let queue_dir = data_dir.join("queue");
        std::fs::create_dir_all(&queue_dir)?;
        Ok(Self {
            store,
            queue_dir,
            base_rest_seconds: config.rest.base_rest_seconds,
            max_fatigue_multiplier: config.rest.max_fatigue_multiplier,
            calories: CalorieModel::from(&config.calories),
            fatigue,
            live: HashMap::new(),
            subscribers: HashMap::new(),
        })
    }

    pub fn queue_dir(&self) -> &Path {
        &self.queue_dir
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Create a new idle session owned by `owner_id` and snapshot it
    pub fn start_session(
        &mut self,
        owner_id: impl Into<String>,
        name: impl Into<String>,
        options: SessionOptions,
    ) -> Result<Uuid> {
        let session = Session::new(owner_id, name, options, Utc::now());
        let id = session.id;
        self.persist_session(&session)?;
        tracing::info!(session = %id, "Started session {:?}", session.name);
        self.live.insert(
            id,
            LiveSession {
                session,
                sets: Vec::new(),
            },
        );
        Ok(id)
    }

    /// Apply one event to a session. On success the new session value is
    /// durable and subscribers have been notified; on `InvalidTransition`
    /// nothing changed.
    pub fn dispatch(&mut self, id: Uuid, event: SessionEvent) -> Result<&Session> {
        let mut pending: VecDeque<SessionEvent> = VecDeque::from([event]);

        while let Some(event) = pending.pop_front() {
            self.ensure_loaded(id)?;
            let now = Utc::now();
            let current = &self.live[&id].session;
            let (next, effects) = machine::apply(current, &event, now)?;
            tracing::debug!(
                session = %id,
                "{} applied: {} -> {}",
                event.name(),
                current.status.as_str(),
                next.status.as_str()
            );

            for effect in effects {
                match effect {
                    SideEffect::PersistSet(record) => {
                        let set = self.materialize_set(id, record);
                        let queue = EventQueue::for_session(&self.queue_dir, id);
                        let queued = DomainEvent::SetCompleted { set: set.clone() };
                        with_retry("enqueue set event", || {
                            queue.enqueue(queued.clone(), now)
                        })?;
                        with_retry("append set", || self.store.append_set(&set))?;
                        self.live
                            .get_mut(&id)
                            .map(|live| live.sets.push(set.clone()));
                    }
                    SideEffect::Enqueue(domain_event) => {
                        let queue = EventQueue::for_session(&self.queue_dir, id);
                        with_retry("enqueue event", || {
                            queue.enqueue(domain_event.clone(), now)
                        })?;
                    }
                    SideEffect::RecomputeMetrics => {
                        let sets = &self.live[&id].sets;
                        let snap = metrics::compute(&next, sets, now, &self.calories);
                        tracing::debug!(
                            session = %id,
                            volume = snap.total_volume,
                            sets = snap.total_sets,
                            "Metrics recomputed"
                        );
                    }
                    SideEffect::BeginAdaptiveRest { last_rpe } => {
                        let fatigue = self.fatigue.fatigue_level(&next.owner_id);
                        let seconds = rest::target_rest_seconds(
                            last_rpe,
                            fatigue,
                            self.base_rest_seconds,
                            self.max_fatigue_multiplier,
                        );
                        tracing::debug!(
                            session = %id,
                            seconds,
                            fatigue,
                            "Scheduling adaptive rest"
                        );
                        pending.push_back(SessionEvent::StartRest {
                            seconds: Some(seconds),
                        });
                    }
                }
            }

            self.persist_session(&next)?;
            if let Some(live) = self.live.get_mut(&id) {
                live.session = next;
            }
            self.notify(id);
        }

        Ok(&self.live[&id].session)
    }

    /// The session plus its recomputed metrics snapshot
    pub fn snapshot(&mut self, id: Uuid) -> Result<(Session, SessionMetricsSnapshot)> {
        self.ensure_loaded(id)?;
        let live = &self.live[&id];
        let snap = metrics::compute(&live.session, &live.sets, Utc::now(), &self.calories);
        Ok((live.session.clone(), snap))
    }

    /// The session's set log, in append order
    pub fn sets(&mut self, id: Uuid) -> Result<Vec<CompletedSet>> {
        self.ensure_loaded(id)?;
        Ok(self.live[&id].sets.clone())
    }

    /// Pending/failed queue counts for the offline indicator
    pub fn sync_indicator(&self, id: Uuid) -> Result<SyncIndicator> {
        let state = EventQueue::for_session(&self.queue_dir, id).load()?;
        Ok(SyncIndicator {
            pending: state.pending.len(),
            failed: state.failed.len(),
        })
    }

    /// Register a callback fired after every successful transition
    pub fn subscribe(&mut self, id: Uuid, callback: impl Fn(&Session) + Send + 'static) {
        self.subscribers
            .entry(id)
            .or_default()
            .push(Box::new(callback));
    }

    /// All known sessions, newest first (live registry plus snapshots)
    pub fn list_sessions(&self) -> Result<Vec<Session>> {
        self.store.list_sessions()
    }

    /// The most recently created non-terminal session, if any
    pub fn current_session(&self) -> Result<Option<Session>> {
        Ok(self
            .store
            .list_sessions()?
            .into_iter()
            .find(|s| !s.status.is_terminal()))
    }

    fn ensure_loaded(&mut self, id: Uuid) -> Result<()> {
        if self.live.contains_key(&id) {
            return Ok(());
        }
        let session = self
            .store
            .load_session(id)?
            .ok_or(Error::UnknownSession(id))?;
        let sets = self.store.load_sets(id)?;
        self.live.insert(id, LiveSession { session, sets });
        Ok(())
    }

    fn materialize_set(&self, session_id: Uuid, record: SetRecord) -> CompletedSet {
        CompletedSet {
            id: Uuid::new_v4(),
            session_id,
            exercise_id: record.exercise_id,
            set_number: record.set_number,
            weight_kg: record.weight_kg,
            reps: record.reps,
            rpe: record.rpe,
            completed_at: record.completed_at,
            sync_status: SyncStatus::Pending,
        }
    }

    fn persist_session(&self, session: &Session) -> Result<()> {
        with_retry("save session", || self.store.save_session(session))
    }

    fn notify(&self, id: Uuid) {
        let Some(live) = self.live.get(&id) else {
            return;
        };
        if let Some(callbacks) = self.subscribers.get(&id) {
            for callback in callbacks {
                callback(&live.session);
            }
        }
    }
}

/// Retry a local durable write once before surfacing it as a persistence
/// error; an event must never be silently dropped.
fn with_retry<T>(what: &str, mut f: impl FnMut() -> Result<T>) -> Result<T> {
    match f() {
        Ok(value) => Ok(value),
        Err(first) => {
            tracing::warn!("{} failed, retrying once: {}", what, first);
            f().map_err(|e| Error::Persistence(format!("{} failed after retry: {}", what, e)))
        }
    }
}
