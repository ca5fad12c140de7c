//! Core domain types for the live workout session tracker.
//!
//! This module defines the fundamental types used throughout the system:
//! - Sessions, their status and pause accounting
//! - Completed sets (the append-only performance log)
//! - Derived metrics snapshots
//! - Domain events and queue entries for offline sync

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Session Types
// ============================================================================

/// State-machine status of a live session
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    WarmingUp,
    Working,
    Resting,
    Paused,
    Completed,
    EmergencyStopped,
}

impl SessionStatus {
    /// Terminal states accept no further events
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::EmergencyStopped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::WarmingUp => "warming_up",
            SessionStatus::Working => "working",
            SessionStatus::Resting => "resting",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::EmergencyStopped => "emergency_stopped",
        }
    }
}

/// One pause span; `end` is None while the session is still paused
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PauseInterval {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

/// Per-session options chosen at start time
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct SessionOptions {
    pub target_duration_minutes: Option<u32>,
    /// When set, completing a set schedules an adaptive rest automatically
    pub smart_rest: bool,
}

/// One bounded training activity, exclusively owned by the orchestrator
/// while live and immutable once terminal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub owner_id: String,
    pub name: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub pauses: Vec<PauseInterval>,
    /// Sum of *closed* pause intervals only, in seconds
    pub total_pause_seconds: i64,
    pub target_duration_minutes: Option<u32>,
    /// Exercise ids in the order they were first begun
    pub exercise_order: Vec<String>,
    pub current_exercise: Option<String>,
    /// The status that was active immediately before `Pause`; `Resume`
    /// restores it verbatim
    pub paused_from: Option<SessionStatus>,
    pub smart_rest: bool,
    /// Number of sets logged so far; assigns set numbers
    pub sets_logged: u32,
    /// Rest target of the rest period currently in progress, if any
    pub current_rest_seconds: Option<u32>,
    pub stop_reason: Option<String>,
}

impl Session {
    pub fn new(owner_id: impl Into<String>, name: impl Into<String>, options: SessionOptions, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            name: name.into(),
            status: SessionStatus::Idle,
            created_at: now,
            started_at: None,
            ended_at: None,
            pauses: Vec::new(),
            total_pause_seconds: 0,
            target_duration_minutes: options.target_duration_minutes,
            exercise_order: Vec::new(),
            current_exercise: None,
            paused_from: None,
            smart_rest: options.smart_rest,
            sets_logged: 0,
            current_rest_seconds: None,
            stop_reason: None,
        }
    }

    /// The pause interval currently open, if the session is paused
    pub fn open_pause(&self) -> Option<&PauseInterval> {
        self.pauses.last().filter(|p| p.end.is_none())
    }

    /// Total paused time as of `now`, counting a still-open interval up to
    /// `now` (the open interval is *not* part of `total_pause_seconds`)
    pub fn pause_seconds_at(&self, now: DateTime<Utc>) -> i64 {
        let open = self
            .open_pause()
            .map(|p| (now - p.start).num_seconds().max(0))
            .unwrap_or(0);
        self.total_pause_seconds + open
    }

    /// Wall-clock seconds spent actively training (elapsed minus paused)
    pub fn active_seconds_at(&self, now: DateTime<Utc>) -> i64 {
        let Some(started) = self.started_at else {
            return 0;
        };
        let end = self.ended_at.unwrap_or(now);
        let elapsed = (end - started).num_seconds().max(0);
        (elapsed - self.pause_seconds_at(end)).max(0)
    }
}

// ============================================================================
// Completed Sets
// ============================================================================

/// Delivery status of a set's `SetCompleted` event
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Confirmed,
    Failed,
}

/// Immutable record of one performed set. Append-only: nothing but
/// `sync_status` ever changes after the fact.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompletedSet {
    pub id: Uuid,
    pub session_id: Uuid,
    pub exercise_id: String,
    pub set_number: u32,
    pub weight_kg: Option<f64>,
    pub reps: Option<u32>,
    /// Rate of Perceived Exertion, 1-10
    pub rpe: Option<u8>,
    pub completed_at: DateTime<Utc>,
    pub sync_status: SyncStatus,
}

// ============================================================================
// Derived Metrics
// ============================================================================

/// Running totals derived from the set log + session metadata.
/// Never persisted independently; always recomputable.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SessionMetricsSnapshot {
    pub total_volume: f64,
    pub total_sets: u32,
    pub average_rpe: Option<f64>,
    pub estimated_calories: f64,
    pub active_seconds: i64,
}

// ============================================================================
// Domain Events and Queue Entries
// ============================================================================

/// Events that must reach the remote store
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    SessionStarted {
        owner_id: String,
        name: String,
        started_at: DateTime<Utc>,
    },
    SetCompleted {
        set: CompletedSet,
    },
    SessionPaused {
        at: DateTime<Utc>,
    },
    SessionResumed {
        at: DateTime<Utc>,
        paused_seconds: i64,
    },
    SessionCompleted {
        at: DateTime<Utc>,
    },
    SessionCancelled {
        at: DateTime<Utc>,
        reason: String,
    },
}

impl DomainEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            DomainEvent::SessionStarted { .. } => "session_started",
            DomainEvent::SetCompleted { .. } => "set_completed",
            DomainEvent::SessionPaused { .. } => "session_paused",
            DomainEvent::SessionResumed { .. } => "session_resumed",
            DomainEvent::SessionCompleted { .. } => "session_completed",
            DomainEvent::SessionCancelled { .. } => "session_cancelled",
        }
    }
}

/// One locally queued, unconfirmed domain event awaiting remote
/// acknowledgment. The sequence number is the remote's idempotency key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueEntry {
    pub session_id: Uuid,
    pub sequence_no: u64,
    pub event: DomainEvent,
    pub confirmed: bool,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
}
