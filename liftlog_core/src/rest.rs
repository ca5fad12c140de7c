//! Adaptive rest calculator.
//!
//! Maps the last set's RPE and an externally supplied fatigue level to a
//! target rest duration. Pure and deterministic; the fatigue signal itself
//! comes from a `FatigueEstimator`, which degrades to a neutral baseline
//! whenever no recovery data is available.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Default base rest between sets, in seconds
pub const DEFAULT_BASE_REST_SECONDS: u32 = 90;

/// Neutral midpoint used when the last set carried no RPE
const NEUTRAL_RPE: f32 = 5.5;

/// Floor on the RPE multiplier, so an easy set never produces a
/// zero-length rest
const MIN_RPE_MULTIPLIER: f32 = 0.5;

/// Compute the target rest in seconds.
///
/// `target = round(base × rpe_multiplier × fatigue_multiplier)` where the
/// RPE multiplier scales linearly with RPE/10 (floored) and the fatigue
/// multiplier is `1 + fatigue_level`, capped at `max_fatigue_multiplier`.
pub fn target_rest_seconds(
    last_rpe: Option<u8>,
    fatigue_level: f32,
    base_seconds: u32,
    max_fatigue_multiplier: f32,
) -> u32 {
    let rpe = last_rpe.map(f32::from).unwrap_or(NEUTRAL_RPE);
    let rpe_multiplier = (rpe / 10.0).max(MIN_RPE_MULTIPLIER);
    let fatigue_multiplier = (1.0 + fatigue_level.clamp(0.0, 1.0)).min(max_fatigue_multiplier);
    (base_seconds as f32 * rpe_multiplier * fatigue_multiplier).round() as u32
}

/// Source of the 0-1 fatigue signal used to scale rest targets
pub trait FatigueEstimator {
    fn fatigue_level(&self, owner_id: &str) -> f32;
}

/// Neutral baseline: no fatigue data, multiplier stays at 1x
#[derive(Clone, Debug, Default)]
pub struct NeutralFatigue;

impl FatigueEstimator for NeutralFatigue {
    fn fatigue_level(&self, _owner_id: &str) -> f32 {
        0.0
    }
}

/// Recovery signal file format (matches external estimator output)
#[derive(Debug, Deserialize)]
struct RecoverySignalFile {
    fatigue_level: f32,
    #[allow(dead_code)]
    recorded_at: Option<DateTime<Utc>>,
}

/// File-backed fatigue estimator reading an external recovery signal.
///
/// A missing or malformed file is not an error: the estimator logs a
/// warning and falls back to the neutral baseline.
#[derive(Clone, Debug)]
pub struct FileFatigueEstimator {
    path: PathBuf,
}

impl FileFatigueEstimator {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read_signal(&self, path: &Path) -> Option<f32> {
        if !path.exists() {
            tracing::debug!("No recovery signal file found at {:?}", path);
            return None;
        }

        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                tracing::warn!(
                    "Failed to read recovery signal at {:?}: {}. Using neutral baseline.",
                    path,
                    e
                );
                return None;
            }
        };

        match serde_json::from_str::<RecoverySignalFile>(&contents) {
            Ok(file) => Some(file.fatigue_level.clamp(0.0, 1.0)),
            Err(e) => {
                tracing::warn!(
                    "Failed to parse recovery signal at {:?}: {}. Using neutral baseline.",
                    path,
                    e
                );
                None
            }
        }
    }
}

impl FatigueEstimator for FileFatigueEstimator {
    fn fatigue_level(&self, _owner_id: &str) -> f32 {
        self.read_signal(&self.path).unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_neutral_midpoint_when_rpe_absent() {
        // 90 * 0.55 * 1.0 = 49.5 -> 50
        assert_eq!(target_rest_seconds(None, 0.0, 90, 2.0), 50);
    }

    #[test]
    fn test_rpe_floor_avoids_zero_rest() {
        // RPE 1 would give 0.1; floored to 0.5
        assert_eq!(target_rest_seconds(Some(1), 0.0, 90, 2.0), 45);
    }

    #[test]
    fn test_rpe_ten_full_base() {
        assert_eq!(target_rest_seconds(Some(10), 0.0, 90, 2.0), 90);
    }

    #[test]
    fn test_full_fatigue_doubles_rest() {
        assert_eq!(target_rest_seconds(Some(10), 1.0, 90, 2.0), 180);
    }

    #[test]
    fn test_fatigue_multiplier_capped() {
        assert_eq!(target_rest_seconds(Some(10), 1.0, 90, 1.5), 135);
    }

    #[test]
    fn test_out_of_range_fatigue_clamped() {
        assert_eq!(
            target_rest_seconds(Some(10), 7.5, 90, 2.0),
            target_rest_seconds(Some(10), 1.0, 90, 2.0)
        );
        assert_eq!(
            target_rest_seconds(Some(10), -3.0, 90, 2.0),
            target_rest_seconds(Some(10), 0.0, 90, 2.0)
        );
    }

    #[test]
    fn test_neutral_estimator() {
        assert_eq!(NeutralFatigue.fatigue_level("u1"), 0.0);
    }

    #[test]
    fn test_file_estimator_reads_signal() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("recovery.json");
        std::fs::write(&path, r#"{"fatigue_level": 0.6, "recorded_at": null}"#).unwrap();

        let estimator = FileFatigueEstimator::new(&path);
        assert!((estimator.fatigue_level("u1") - 0.6).abs() < f32::EPSILON);
    }

    #[test]
    fn test_file_estimator_clamps_signal() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("recovery.json");
        std::fs::write(&path, r#"{"fatigue_level": 4.2}"#).unwrap();

        let estimator = FileFatigueEstimator::new(&path);
        assert_eq!(estimator.fatigue_level("u1"), 1.0);
    }

    #[test]
    fn test_missing_or_malformed_file_neutral() {
        let temp_dir = tempfile::tempdir().unwrap();

        let missing = FileFatigueEstimator::new(temp_dir.path().join("none.json"));
        assert_eq!(missing.fatigue_level("u1"), 0.0);

        let bad_path = temp_dir.path().join("bad.json");
        std::fs::write(&bad_path, "{ not json }").unwrap();
        let malformed = FileFatigueEstimator::new(&bad_path);
        assert_eq!(malformed.fatigue_level("u1"), 0.0);
    }
}
