//! Replay-based metrics accumulator.
//!
//! Totals are recomputed from the immutable set log on every call; nothing
//! is cached or persisted. Recomputation is idempotent and duplicate-safe:
//! entries are deduplicated by id before summing, so a re-delivered
//! duplicate yields the same snapshot as if it had never repeated.

use crate::{CompletedSet, Session, SessionMetricsSnapshot};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use uuid::Uuid;

/// Calorie heuristic coefficients. A placeholder, not a physiological
/// model; the contract is monotonicity only.
#[derive(Clone, Debug)]
pub struct CalorieModel {
    /// kcal per kg·rep of volume
    pub per_volume_kg: f64,
    /// kcal per minute of active (non-paused) time
    pub per_active_minute: f64,
}

impl Default for CalorieModel {
    fn default() -> Self {
        Self {
            per_volume_kg: 0.05,
            per_active_minute: 5.0,
        }
    }
}

impl From<&crate::config::CaloriesConfig> for CalorieModel {
    fn from(cfg: &crate::config::CaloriesConfig) -> Self {
        Self {
            per_volume_kg: cfg.per_volume_kg,
            per_active_minute: cfg.per_active_minute,
        }
    }
}

/// Recompute the full metrics snapshot from the set log.
///
/// - volume sums only sets carrying both weight and reps
/// - average RPE ignores sets that supplied none (they do not affect the
///   denominator)
/// - the calorie estimate never decreases as sets append, because volume
///   and active time both only grow
pub fn compute(
    session: &Session,
    sets: &[CompletedSet],
    now: DateTime<Utc>,
    model: &CalorieModel,
) -> SessionMetricsSnapshot {
    let mut seen: HashSet<Uuid> = HashSet::new();

    let mut total_volume = 0.0;
    let mut total_sets = 0u32;
    let mut rpe_sum = 0.0;
    let mut rpe_count = 0u32;

    for set in sets {
        if !seen.insert(set.id) {
            continue;
        }
        total_sets += 1;
        if let (Some(weight), Some(reps)) = (set.weight_kg, set.reps) {
            total_volume += weight * f64::from(reps);
        }
        if let Some(rpe) = set.rpe {
            rpe_sum += f64::from(rpe);
            rpe_count += 1;
        }
    }

    let average_rpe = (rpe_count > 0).then(|| rpe_sum / f64::from(rpe_count));
    let active_seconds = session.active_seconds_at(now);
    let active_minutes = active_seconds as f64 / 60.0;
    let estimated_calories =
        total_volume * model.per_volume_kg + active_minutes * model.per_active_minute;

    SessionMetricsSnapshot {
        total_volume,
        total_sets,
        average_rpe,
        estimated_calories,
        active_seconds,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SessionOptions, SyncStatus};
    use chrono::Duration;

    fn make_set(
        session_id: Uuid,
        number: u32,
        weight: Option<f64>,
        reps: Option<u32>,
        rpe: Option<u8>,
    ) -> CompletedSet {
        CompletedSet {
            id: Uuid::new_v4(),
            session_id,
            exercise_id: "bench_press".into(),
            set_number: number,
            weight_kg: weight,
            reps,
            rpe,
            completed_at: Utc::now(),
            sync_status: SyncStatus::Pending,
        }
    }

    fn started_session(now: DateTime<Utc>) -> Session {
        let mut session = Session::new("u1", "push day", SessionOptions::default(), now);
        session.started_at = Some(now);
        session
    }

    #[test]
    fn test_scenario_a_totals() {
        // CompleteSet{weight: 80, reps: 10, rpe: 8} => volume 800, 1 set, rpe 8
        let now = Utc::now();
        let session = started_session(now);
        let sets = vec![make_set(session.id, 1, Some(80.0), Some(10), Some(8))];

        let snap = compute(&session, &sets, now, &CalorieModel::default());
        assert_eq!(snap.total_volume, 800.0);
        assert_eq!(snap.total_sets, 1);
        assert_eq!(snap.average_rpe, Some(8.0));
    }

    #[test]
    fn test_volume_requires_both_weight_and_reps() {
        let now = Utc::now();
        let session = started_session(now);
        let sets = vec![
            make_set(session.id, 1, Some(80.0), Some(10), None),
            make_set(session.id, 2, None, Some(15), None), // bodyweight, no volume
            make_set(session.id, 3, Some(40.0), None, None),
        ];

        let snap = compute(&session, &sets, now, &CalorieModel::default());
        assert_eq!(snap.total_volume, 800.0);
        assert_eq!(snap.total_sets, 3);
    }

    #[test]
    fn test_average_rpe_ignores_missing_values() {
        let now = Utc::now();
        let session = started_session(now);
        let sets = vec![
            make_set(session.id, 1, Some(80.0), Some(10), Some(6)),
            make_set(session.id, 2, Some(80.0), Some(10), None),
            make_set(session.id, 3, Some(80.0), Some(10), Some(10)),
        ];

        let snap = compute(&session, &sets, now, &CalorieModel::default());
        assert_eq!(snap.average_rpe, Some(8.0));
    }

    #[test]
    fn test_no_rpe_at_all_yields_none() {
        let now = Utc::now();
        let session = started_session(now);
        let sets = vec![make_set(session.id, 1, Some(80.0), Some(10), None)];

        let snap = compute(&session, &sets, now, &CalorieModel::default());
        assert_eq!(snap.average_rpe, None);
    }

    #[test]
    fn test_recompute_is_idempotent() {
        let now = Utc::now();
        let session = started_session(now);
        let sets = vec![
            make_set(session.id, 1, Some(100.0), Some(5), Some(7)),
            make_set(session.id, 2, Some(100.0), Some(5), Some(9)),
        ];

        let later = now + Duration::minutes(12);
        let first = compute(&session, &sets, later, &CalorieModel::default());
        let second = compute(&session, &sets, later, &CalorieModel::default());
        assert_eq!(first, second);
    }

    #[test]
    fn test_duplicate_ids_deduplicated() {
        // A re-delivered duplicate entry changes nothing
        let now = Utc::now();
        let session = started_session(now);
        let set = make_set(session.id, 1, Some(80.0), Some(10), Some(8));
        let without = vec![set.clone()];
        let with_duplicate = vec![set.clone(), set];

        let a = compute(&session, &without, now, &CalorieModel::default());
        let b = compute(&session, &with_duplicate, now, &CalorieModel::default());
        assert_eq!(a, b);
        assert_eq!(b.total_sets, 1);
    }

    #[test]
    fn test_appending_sets_is_monotonic() {
        let now = Utc::now();
        let session = started_session(now);
        let model = CalorieModel::default();

        let mut sets = Vec::new();
        let mut prev = compute(&session, &sets, now, &model);
        for n in 1..=10 {
            sets.push(make_set(session.id, n, Some(60.0), Some(8), None));
            let next = compute(&session, &sets, now, &model);
            assert!(next.total_volume >= prev.total_volume);
            assert!(next.total_sets >= prev.total_sets);
            assert!(next.estimated_calories >= prev.estimated_calories);
            prev = next;
        }
    }

    #[test]
    fn test_calories_frozen_while_paused() {
        let now = Utc::now();
        let mut session = started_session(now);
        session.pauses.push(crate::PauseInterval {
            start: now + Duration::minutes(10),
            end: None,
        });
        let model = CalorieModel::default();

        let at_pause = compute(&session, &[], now + Duration::minutes(10), &model);
        let mid_pause = compute(&session, &[], now + Duration::minutes(14), &model);
        assert_eq!(at_pause.estimated_calories, mid_pause.estimated_calories);
        assert_eq!(mid_pause.active_seconds, 600);
    }

    #[test]
    fn test_active_time_counts_toward_calories() {
        let now = Utc::now();
        let session = started_session(now);
        let model = CalorieModel::default();

        let snap = compute(&session, &[], now + Duration::minutes(10), &model);
        // 10 active minutes at 5 kcal/min
        assert_eq!(snap.estimated_calories, 50.0);
    }
}
