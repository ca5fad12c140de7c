//! CSV rollup for finished sessions.
//!
//! Terminal sessions whose queues have fully drained are summarized into
//! `sessions.csv` for long-term history, and their live snapshot/set files
//! are renamed to `.processed` so the live directories stay small. The CSV
//! is synced to disk before anything is renamed.

use crate::metrics::{self, CalorieModel};
use crate::queue::EventQueue;
use crate::store::SessionStore;
use crate::{Result, Session};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::Path;

/// A row in the CSV output
#[derive(Debug, Serialize, Deserialize)]
pub struct ArchivedSession {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub status: String,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub total_pause_seconds: i64,
    pub total_sets: u32,
    pub total_volume: f64,
    pub average_rpe: Option<f64>,
    pub estimated_calories: f64,
}

fn to_row(session: &Session, store: &SessionStore, model: &CalorieModel) -> Result<ArchivedSession> {
    let sets = store.load_sets(session.id)?;
    let now = session.ended_at.unwrap_or_else(Utc::now);
    let snap = metrics::compute(session, &sets, now, model);
    Ok(ArchivedSession {
        id: session.id.to_string(),
        owner_id: session.owner_id.clone(),
        name: session.name.clone(),
        status: session.status.as_str().to_string(),
        started_at: session.started_at.map(|t| t.to_rfc3339()),
        ended_at: session.ended_at.map(|t| t.to_rfc3339()),
        total_pause_seconds: session.total_pause_seconds,
        total_sets: snap.total_sets,
        total_volume: snap.total_volume,
        average_rpe: snap.average_rpe,
        estimated_calories: snap.estimated_calories,
    })
}

/// Roll terminal, fully-synced sessions up into the CSV archive.
///
/// A session with pending or failed queue entries is left alone: its
/// events have not all reached the remote yet, and a failed entry still
/// needs to be surfaced to the user. Returns the number of sessions
/// archived.
pub fn rollup_finished(
    store: &SessionStore,
    queue_dir: &Path,
    csv_path: &Path,
    model: &CalorieModel,
) -> Result<usize> {
    let mut rows = Vec::new();
    let mut archived_ids = Vec::new();

    for session in store.list_sessions()? {
        if !session.status.is_terminal() {
            continue;
        }
        let queue_state = EventQueue::for_session(queue_dir, session.id).load()?;
        if !queue_state.pending.is_empty() || !queue_state.failed.is_empty() {
            tracing::debug!(
                session = %session.id,
                pending = queue_state.pending.len(),
                failed = queue_state.failed.len(),
                "Skipping rollup of unsynced session"
            );
            continue;
        }
        rows.push(to_row(&session, store, model)?);
        archived_ids.push(session.id);
    }

    if rows.is_empty() {
        tracing::info!("No finished sessions to roll up");
        return Ok(0);
    }

    if let Some(parent) = csv_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = OpenOptions::new().create(true).append(true).open(csv_path)?;
    let needs_headers = file.metadata()?.len() == 0;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(needs_headers)
        .from_writer(file);

    for row in &rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    let file = writer
        .into_inner()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    file.sync_all()?;

    tracing::info!("Wrote {} sessions to CSV", rows.len());

    // CSV is on disk; only now take the live files out of circulation
    for id in &archived_ids {
        store.archive_session(*id)?;
        let queue = EventQueue::for_session(queue_dir, *id);
        if queue.path().exists() {
            std::fs::rename(queue.path(), queue.path().with_extension("wal.processed"))?;
        }
    }

    Ok(rows.len())
}

/// Remove `.processed` leftovers from the store and the queue directory
pub fn cleanup_processed(store: &SessionStore, queue_dir: &Path) -> Result<usize> {
    let mut count = store.cleanup_processed()?;
    if queue_dir.exists() {
        for entry in std::fs::read_dir(queue_dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "processed").unwrap_or(false) {
                std::fs::remove_file(&path)?;
                count += 1;
            }
        }
    }
    Ok(count)
}

/// Load archived sessions from the last `days` days, newest first
pub fn load_recent(csv_path: &Path, days: i64) -> Result<Vec<ArchivedSession>> {
    if !csv_path.exists() {
        return Ok(Vec::new());
    }
    let cutoff = Utc::now() - Duration::days(days);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(csv_path)?;

    let mut sessions = Vec::new();
    for result in reader.deserialize::<ArchivedSession>() {
        match result {
            Ok(row) => {
                let recent = row
                    .started_at
                    .as_deref()
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|t| t.with_timezone(&Utc) >= cutoff)
                    .unwrap_or(true);
                if recent {
                    sessions.push(row);
                }
            }
            Err(e) => {
                tracing::warn!("Failed to deserialize CSV row: {}", e);
            }
        }
    }

    sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    Ok(sessions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::SessionEvent;
    use crate::orchestrator::Orchestrator;
    use crate::reconciler::{BackoffPolicy, Reconciler};
    use crate::remote::{AlwaysOnline, DirRemoteStore};
    use crate::{Config, SessionOptions};
    use uuid::Uuid;

    fn finish_one_session(data_dir: &Path, synced: bool) -> Uuid {
        let mut orch =
            Orchestrator::with_fatigue(data_dir, &Config::default(), Box::new(crate::rest::NeutralFatigue))
                .unwrap();
        let id = orch.start_session("u1", "push day", SessionOptions::default()).unwrap();
        orch.dispatch(id, SessionEvent::StartWarmup).unwrap();
        orch.dispatch(
            id,
            SessionEvent::BeginExercise {
                exercise_id: "ohp".into(),
            },
        )
        .unwrap();
        orch.dispatch(
            id,
            SessionEvent::CompleteSet {
                weight_kg: Some(50.0),
                reps: Some(8),
                rpe: Some(7),
            },
        )
        .unwrap();
        orch.dispatch(id, SessionEvent::Complete).unwrap();

        if synced {
            let store = SessionStore::open(data_dir).unwrap();
            let remote = DirRemoteStore::new(data_dir.join("remote"));
            std::fs::create_dir_all(data_dir.join("remote")).unwrap();
            let reconciler = Reconciler::new(
                data_dir.join("queue"),
                store,
                remote,
                AlwaysOnline,
                BackoffPolicy::default(),
            );
            reconciler.drain_once(Utc::now()).unwrap();
        }
        id
    }

    #[test]
    fn test_rollup_archives_synced_terminal_sessions() {
        let temp_dir = tempfile::tempdir().unwrap();
        let id = finish_one_session(temp_dir.path(), true);

        let store = SessionStore::open(temp_dir.path()).unwrap();
        let csv_path = temp_dir.path().join("sessions.csv");
        let count = rollup_finished(
            &store,
            &temp_dir.path().join("queue"),
            &csv_path,
            &CalorieModel::default(),
        )
        .unwrap();

        assert_eq!(count, 1);
        assert!(csv_path.exists());
        assert!(!store.session_path(id).exists());

        let rows = load_recent(&csv_path, 7).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total_volume, 400.0);
        assert_eq!(rows[0].status, "completed");
    }

    #[test]
    fn test_rollup_skips_unsynced_sessions() {
        let temp_dir = tempfile::tempdir().unwrap();
        let id = finish_one_session(temp_dir.path(), false);

        let store = SessionStore::open(temp_dir.path()).unwrap();
        let csv_path = temp_dir.path().join("sessions.csv");
        let count = rollup_finished(
            &store,
            &temp_dir.path().join("queue"),
            &csv_path,
            &CalorieModel::default(),
        )
        .unwrap();

        assert_eq!(count, 0);
        // Still live, nothing archived
        assert!(store.session_path(id).exists());
    }

    #[test]
    fn test_rollup_appends_across_runs() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(temp_dir.path()).unwrap();
        let csv_path = temp_dir.path().join("sessions.csv");
        let queue_dir = temp_dir.path().join("queue");

        finish_one_session(temp_dir.path(), true);
        rollup_finished(&store, &queue_dir, &csv_path, &CalorieModel::default()).unwrap();
        finish_one_session(temp_dir.path(), true);
        rollup_finished(&store, &queue_dir, &csv_path, &CalorieModel::default()).unwrap();

        let rows = load_recent(&csv_path, 7).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_load_recent_missing_csv() {
        let temp_dir = tempfile::tempdir().unwrap();
        let rows = load_recent(&temp_dir.path().join("none.csv"), 7).unwrap();
        assert!(rows.is_empty());
    }
}
