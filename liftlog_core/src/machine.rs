//! Pure transition function for the live session state machine.
//!
//! `apply` never performs IO and never reads the clock; the caller supplies
//! `now`. A successful transition yields the next session value plus a list
//! of declarative side effects the orchestrator executes afterwards. An
//! event with no defined transition from the current state returns
//! `Error::InvalidTransition` and leaves the session untouched.

use crate::{
    DomainEvent, Error, PauseInterval, Result, Session, SessionStatus,
};
use chrono::{DateTime, Utc};

/// Events accepted by the state machine
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    StartWarmup,
    BeginExercise { exercise_id: String },
    CompleteSet { weight_kg: Option<f64>, reps: Option<u32>, rpe: Option<u8> },
    StartRest { seconds: Option<u32> },
    SkipRest,
    Pause,
    Resume,
    Complete,
    EmergencyStop { reason: String },
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::StartWarmup => "start_warmup",
            SessionEvent::BeginExercise { .. } => "begin_exercise",
            SessionEvent::CompleteSet { .. } => "complete_set",
            SessionEvent::StartRest { .. } => "start_rest",
            SessionEvent::SkipRest => "skip_rest",
            SessionEvent::Pause => "pause",
            SessionEvent::Resume => "resume",
            SessionEvent::Complete => "complete",
            SessionEvent::EmergencyStop { .. } => "emergency_stop",
        }
    }
}

/// Fields of a set the machine has decided to record; the orchestrator
/// materializes the `CompletedSet` (fresh id, pending sync status) from it.
#[derive(Clone, Debug, PartialEq)]
pub struct SetRecord {
    pub exercise_id: String,
    pub set_number: u32,
    pub weight_kg: Option<f64>,
    pub reps: Option<u32>,
    pub rpe: Option<u8>,
    pub completed_at: DateTime<Utc>,
}

/// Declarative side effects of a successful transition, executed by the
/// orchestrator in order. Persistence or sync failures while executing them
/// never roll back the transition itself.
#[derive(Clone, Debug)]
pub enum SideEffect {
    /// Durably persist the set and enqueue its `SetCompleted` event
    PersistSet(SetRecord),
    /// Enqueue a session lifecycle event for remote delivery
    Enqueue(DomainEvent),
    /// Recompute the derived metrics snapshot
    RecomputeMetrics,
    /// Compute an adaptive rest target and dispatch a follow-up `StartRest`
    BeginAdaptiveRest { last_rpe: Option<u8> },
}

fn invalid(session: &Session, event: &SessionEvent) -> Error {
    Error::InvalidTransition {
        from: session.status.as_str().to_string(),
        event: event.name().to_string(),
    }
}

/// Apply one event to a session, returning the next session value and the
/// side effects to execute. Pure: the input session is never modified.
pub fn apply(
    session: &Session,
    event: &SessionEvent,
    now: DateTime<Utc>,
) -> Result<(Session, Vec<SideEffect>)> {
    use SessionEvent as E;
    use SessionStatus as S;

    // EmergencyStop bypasses the ordinary transition table: legal from every
    // non-terminal state, guaranteeing a safe exit path.
    if let E::EmergencyStop { reason } = event {
        if session.status.is_terminal() {
            return Err(invalid(session, event));
        }
        let mut next = session.clone();
        close_open_pause(&mut next, now);
        next.status = S::EmergencyStopped;
        next.paused_from = None;
        next.current_rest_seconds = None;
        next.ended_at = Some(now);
        next.stop_reason = Some(reason.clone());
        let effects = vec![
            SideEffect::Enqueue(DomainEvent::SessionCancelled {
                at: now,
                reason: reason.clone(),
            }),
            SideEffect::RecomputeMetrics,
        ];
        return Ok((next, effects));
    }

    let mut next = session.clone();
    let effects = match (session.status, event) {
        (S::Idle, E::StartWarmup) => {
            next.status = S::WarmingUp;
            next.started_at = Some(now);
            vec![SideEffect::Enqueue(DomainEvent::SessionStarted {
                owner_id: next.owner_id.clone(),
                name: next.name.clone(),
                started_at: now,
            })]
        }

        (S::WarmingUp | S::Resting, E::BeginExercise { exercise_id }) => {
            next.status = S::Working;
            next.current_rest_seconds = None;
            if !next.exercise_order.iter().any(|e| e == exercise_id) {
                next.exercise_order.push(exercise_id.clone());
            }
            next.current_exercise = Some(exercise_id.clone());
            vec![]
        }

        (S::Working, E::CompleteSet { weight_kg, reps, rpe }) => {
            if let Some(r) = rpe {
                if !(1..=10).contains(r) {
                    return Err(Error::Session(format!(
                        "rpe must be between 1 and 10, got {}",
                        r
                    )));
                }
            }
            let exercise_id = next
                .current_exercise
                .clone()
                .ok_or_else(|| Error::Session("no exercise in progress".into()))?;
            next.sets_logged += 1;
            let record = SetRecord {
                exercise_id,
                set_number: next.sets_logged,
                weight_kg: *weight_kg,
                reps: *reps,
                rpe: *rpe,
                completed_at: now,
            };
            let mut effects = vec![
                SideEffect::PersistSet(record),
                SideEffect::RecomputeMetrics,
            ];
            if next.smart_rest {
                effects.push(SideEffect::BeginAdaptiveRest { last_rpe: *rpe });
            }
            effects
        }

        (S::Working, E::StartRest { seconds }) => {
            next.status = S::Resting;
            next.current_rest_seconds = *seconds;
            vec![]
        }

        (S::Resting, E::SkipRest) => {
            next.status = S::Working;
            next.current_rest_seconds = None;
            vec![]
        }

        // Pause from an already-paused session is rejected by falling
        // through to the invalid arm below.
        (S::WarmingUp | S::Working | S::Resting, E::Pause) => {
            next.paused_from = Some(session.status);
            next.status = S::Paused;
            next.pauses.push(PauseInterval {
                start: now,
                end: None,
            });
            vec![SideEffect::Enqueue(DomainEvent::SessionPaused { at: now })]
        }

        (S::Paused, E::Resume) => {
            let restored = next
                .paused_from
                .take()
                .ok_or_else(|| Error::Session("paused session has no recorded prior state".into()))?;
            let paused_seconds = close_open_pause(&mut next, now);
            next.status = restored;
            vec![SideEffect::Enqueue(DomainEvent::SessionResumed {
                at: now,
                paused_seconds,
            })]
        }

        (S::Working | S::Resting | S::Paused, E::Complete) => {
            close_open_pause(&mut next, now);
            next.status = S::Completed;
            next.paused_from = None;
            next.current_rest_seconds = None;
            next.ended_at = Some(now);
            vec![
                SideEffect::Enqueue(DomainEvent::SessionCompleted { at: now }),
                SideEffect::RecomputeMetrics,
            ]
        }

        _ => return Err(invalid(session, event)),
    };

    Ok((next, effects))
}

/// Close a still-open pause interval, adding its duration to the closed
/// total. Returns the closed duration in seconds (0 if nothing was open).
fn close_open_pause(session: &mut Session, now: DateTime<Utc>) -> i64 {
    if let Some(open) = session.pauses.last_mut().filter(|p| p.end.is_none()) {
        open.end = Some(now);
        let seconds = (now - open.start).num_seconds().max(0);
        session.total_pause_seconds += seconds;
        seconds
    } else {
        0
    }
}
