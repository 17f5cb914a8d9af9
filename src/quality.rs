//! The quality gate applied between direction-dependent calibration and
//! facet imaging.
//!
//! Each calibration direction gets a signal-to-noise estimate from an
//! external model-quality routine. Directions whose SNR falls below a
//! duration-scaled threshold are rejected, and every solution file sharing a
//! rejected direction's facet index is quarantined so the solution merger
//! only ever sees accepted directions.

use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use itertools::Itertools;
use log::{info, warn};
use thiserror::Error;

use crate::error::PipelineError;

/// The SNR a direction must reach over the reference duration to be kept.
pub const REFERENCE_SNR: f64 = 0.002;

/// The duration \[s\] at which the acceptance threshold equals
/// [`REFERENCE_SNR`].
pub const REFERENCE_DURATION_S: f64 = 18000.0;

#[derive(Error, Debug)]
#[error("Model-quality estimate failed for {path}: {reason}")]
pub struct QualityEstimateError {
    pub path: PathBuf,
    pub reason: String,
}

/// The external routine that measures (noise, flux) of the model column of a
/// dataset. Treated as a black box; a failure here rejects the direction but
/// never aborts the run.
pub trait ModelQuality: Send + Sync {
    fn estimate(&self, ms: &Path) -> Result<(f64, f64), QualityEstimateError>;
}

/// [`ModelQuality`] backed by the `msmodelinfo.py` helper script, which
/// prints `<noise> <flux>` on stdout.
pub struct ScriptModelQuality {
    script: PathBuf,
}

impl ScriptModelQuality {
    pub fn new(helper_scripts: &Path) -> ScriptModelQuality {
        ScriptModelQuality {
            script: helper_scripts.join("msmodelinfo.py"),
        }
    }
}

impl ModelQuality for ScriptModelQuality {
    fn estimate(&self, ms: &Path) -> Result<(f64, f64), QualityEstimateError> {
        let make_err = |reason: String| QualityEstimateError {
            path: ms.to_path_buf(),
            reason,
        };
        let output = Command::new("python3")
            .arg(&self.script)
            .arg(ms)
            .output()
            .map_err(|e| make_err(e.to_string()))?;
        if !output.status.success() {
            return Err(make_err(format!(
                "exit status {}",
                output.status.code().unwrap_or(-1)
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let values: Vec<f64> = stdout
            .split_whitespace()
            .filter_map(|token| token.parse().ok())
            .collect();
        match values.as_slice() {
            [noise, flux] => Ok((*noise, *flux)),
            _ => Err(make_err(format!("unparseable output {stdout:?}"))),
        }
    }
}

/// A direction's identity as encoded in its file names: `Dir3.peel.ms` is
/// facet 3, `Dir3.1.peel.ms` is facet 3, dataset 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectionId {
    pub facet: u32,
    pub dataset: Option<u32>,
    /// The literal index text from the file name (`"3"` or `"3.1"`); leading
    /// zeros must survive into derived file names.
    pub label: String,
}

impl DirectionId {
    /// Parse from a measurement-set file name like `Dir3.peel.ms` or
    /// `Dir3.1.peel.ms`.
    pub fn from_ms_name(file_name: &str) -> Option<DirectionId> {
        let rest = file_name.strip_prefix("Dir")?;
        let parts: Vec<&str> = rest.split('.').collect();
        // "3.peel.ms" has 3 parts, "3.1.peel.ms" has 4.
        let (label, dataset) = if parts.len() >= 4 {
            (
                format!("{}.{}", parts[0], parts[1]),
                Some(parts[1].parse().ok()?),
            )
        } else {
            (parts.first()?.to_string(), None)
        };
        let facet = parts.first()?.parse().ok()?;
        Some(DirectionId {
            facet,
            dataset,
            label,
        })
    }

    /// Parse from a solution-file name like `direction3.1.h5`.
    pub fn from_solution_name(file_name: &str) -> Option<DirectionId> {
        let label = file_name
            .strip_prefix("direction")?
            .strip_suffix(".h5")?
            .to_string();
        let mut parts = label.split('.');
        let facet = parts.next()?.parse().ok()?;
        let dataset = parts.next().and_then(|p| p.parse().ok());
        Some(DirectionId {
            facet,
            dataset,
            label,
        })
    }
}

/// A calibration direction awaiting the quality gate.
#[derive(Debug, Clone)]
pub struct Direction {
    pub id: DirectionId,
    /// The peeled dataset the model-quality estimate runs on.
    pub ms: PathBuf,
    /// Last minus first time sample \[s\].
    pub duration_s: f64,
}

/// The SNR a direction of the given duration must reach to be accepted.
/// SNR scales as sqrt(t), so the threshold does too; it is monotonically
/// non-decreasing in duration.
pub fn acceptance_threshold(duration_s: f64) -> f64 {
    REFERENCE_SNR * (duration_s / REFERENCE_DURATION_S).sqrt()
}

/// Whether an SNR fails the gate. Strictly below the threshold rejects; a
/// failed estimate (NaN) must also reject, and IEEE `<` would report false
/// for NaN, so it is special-cased.
pub fn is_rejected(snr: f64, threshold: f64) -> bool {
    snr.is_nan() || snr < threshold
}

/// Estimate every direction's SNR, classify, and quarantine the solution
/// files of rejected directions.
///
/// `results_dir` is the directory holding `h5files/`; quarantined files move
/// to `rejected/` next to it. When a facet carries multiple per-dataset
/// solution files, rejecting any one of them quarantines them all: an
/// orphaned sibling solution must never survive its pair.
///
/// Returns the rejected direction identities.
pub fn apply_quality_gate(
    directions: &[Direction],
    estimator: &dyn ModelQuality,
    results_dir: &Path,
) -> Result<Vec<DirectionId>, PipelineError> {
    let directions: Vec<&Direction> = directions
        .iter()
        .sorted_by_key(|d| (d.id.facet, d.id.dataset))
        .collect();

    let mut rejected = vec![];
    for direction in &directions {
        let snr = match estimator.estimate(&direction.ms) {
            Ok((noise, flux)) => flux / noise,
            Err(e) => {
                // Deliberately absorbed: a direction we cannot score is a
                // direction we cannot trust.
                warn!("{e}; rejecting direction {}", direction.id.label);
                f64::NAN
            }
        };
        let threshold = acceptance_threshold(direction.duration_s);
        if is_rejected(snr, threshold) {
            info!(
                "Rejecting direction {} (SNR {snr:.4} < threshold {threshold:.4})",
                direction.id.label
            );
            rejected.push(direction.id.clone());
        }
    }

    let rejected_facets: Vec<u32> = rejected.iter().map(|id| id.facet).unique().collect();
    quarantine_facets(results_dir, &rejected_facets)?;
    Ok(rejected)
}

/// Move every solution file whose facet index is in `facets` from
/// `<results>/h5files/` into `<results>/rejected/`.
fn quarantine_facets(results_dir: &Path, facets: &[u32]) -> Result<(), PipelineError> {
    let quarantine = results_dir.join("rejected");
    fs::create_dir_all(&quarantine)?;
    if facets.is_empty() {
        return Ok(());
    }

    for entry in fs::read_dir(results_dir.join("h5files"))? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(id) = file_name.to_str().and_then(DirectionId::from_solution_name) else {
            continue;
        };
        if facets.contains(&id.facet) {
            info!("Removing: {}", file_name.to_string_lossy());
            fs::rename(entry.path(), quarantine.join(&file_name))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use approx::assert_abs_diff_eq;

    use super::*;

    #[test]
    fn threshold_reference_point() {
        assert_abs_diff_eq!(acceptance_threshold(18000.0), 0.002, epsilon = 1e-12);
    }

    #[test]
    fn threshold_scales_as_sqrt_duration() {
        assert_abs_diff_eq!(acceptance_threshold(72000.0), 0.004, epsilon = 1e-12);
        // Monotone non-decreasing.
        let mut last = 0.0;
        for duration in [0.0, 100.0, 18000.0, 20000.0, 1e6] {
            let t = acceptance_threshold(duration);
            assert!(t >= last);
            last = t;
        }
    }

    #[test]
    fn rejection_is_strictly_below_threshold() {
        assert!(is_rejected(0.0019, 0.002));
        // Exactly at threshold is accepted.
        assert!(!is_rejected(0.002, 0.002));
        assert!(!is_rejected(1.0, 0.004));
    }

    #[test]
    fn failed_estimates_always_reject() {
        assert!(is_rejected(f64::NAN, 0.002));
        assert!(is_rejected(f64::NAN, 0.0));
    }

    #[test]
    fn direction_names_parse() {
        let single = DirectionId::from_ms_name("Dir7.peel.ms").unwrap();
        assert_eq!(single.facet, 7);
        assert_eq!(single.dataset, None);
        assert_eq!(single.label, "7");

        let multi = DirectionId::from_ms_name("Dir10.0.peel.ms").unwrap();
        assert_eq!(multi.facet, 10);
        assert_eq!(multi.dataset, Some(0));
        assert_eq!(multi.label, "10.0");

        assert!(DirectionId::from_ms_name("notadir.ms").is_none());
    }

    #[test]
    fn solution_names_keep_leading_zeros() {
        let id = DirectionId::from_solution_name("direction03.1.h5").unwrap();
        assert_eq!(id.facet, 3);
        assert_eq!(id.label, "03.1");
    }

    struct FakeQuality {
        estimates: HashMap<PathBuf, (f64, f64)>,
    }

    impl ModelQuality for FakeQuality {
        fn estimate(&self, ms: &Path) -> Result<(f64, f64), QualityEstimateError> {
            self.estimates
                .get(ms)
                .copied()
                .ok_or_else(|| QualityEstimateError {
                    path: ms.to_path_buf(),
                    reason: "no estimate".to_string(),
                })
        }
    }

    fn direction(label: &str, ms: &str, duration_s: f64) -> Direction {
        Direction {
            id: DirectionId::from_solution_name(&format!("direction{label}.h5")).unwrap(),
            ms: PathBuf::from(ms),
            duration_s,
        }
    }

    #[test]
    fn gate_rejects_low_snr_and_failed_estimates_and_their_siblings() {
        let results = tempfile::tempdir().unwrap();
        let h5files = results.path().join("h5files");
        fs::create_dir(&h5files).unwrap();
        for name in [
            "direction0.0.h5",
            "direction0.1.h5",
            "direction1.0.h5",
            "direction1.1.h5",
            "direction2.0.h5",
            "direction2.1.h5",
        ] {
            fs::write(h5files.join(name), b"").unwrap();
        }

        let mut estimates = HashMap::new();
        // Facet 0: healthy on both datasets.
        estimates.insert(PathBuf::from("Dir0.0.peel.ms"), (1.0, 1.0));
        estimates.insert(PathBuf::from("Dir0.1.peel.ms"), (1.0, 1.0));
        // Facet 1: the first dataset's estimate fails (no entry), the second
        // is healthy; the whole facet must still go.
        estimates.insert(PathBuf::from("Dir1.1.peel.ms"), (1.0, 1.0));
        // Facet 2: SNR below threshold on both.
        estimates.insert(PathBuf::from("Dir2.0.peel.ms"), (1.0, 0.000001));
        estimates.insert(PathBuf::from("Dir2.1.peel.ms"), (1.0, 0.000001));

        let directions = vec![
            direction("0.0", "Dir0.0.peel.ms", 18000.0),
            direction("0.1", "Dir0.1.peel.ms", 18000.0),
            direction("1.0", "Dir1.0.peel.ms", 18000.0),
            direction("1.1", "Dir1.1.peel.ms", 18000.0),
            direction("2.0", "Dir2.0.peel.ms", 18000.0),
            direction("2.1", "Dir2.1.peel.ms", 18000.0),
        ];

        let fake = FakeQuality { estimates };
        let rejected = apply_quality_gate(&directions, &fake, results.path()).unwrap();
        let rejected_labels: Vec<&str> = rejected.iter().map(|id| id.label.as_str()).collect();
        assert_eq!(rejected_labels, vec!["1.0", "2.0", "2.1"]);

        // Facet 0 stays put; facets 1 and 2 are fully quarantined, including
        // the healthy sibling of the failed estimate.
        let quarantined = results.path().join("rejected");
        assert!(h5files.join("direction0.0.h5").exists());
        assert!(h5files.join("direction0.1.h5").exists());
        for name in [
            "direction1.0.h5",
            "direction1.1.h5",
            "direction2.0.h5",
            "direction2.1.h5",
        ] {
            assert!(!h5files.join(name).exists(), "{name} not quarantined");
            assert!(quarantined.join(name).exists());
        }
    }

    #[test]
    fn gate_with_nothing_rejected_moves_nothing() {
        let results = tempfile::tempdir().unwrap();
        let h5files = results.path().join("h5files");
        fs::create_dir(&h5files).unwrap();
        fs::write(h5files.join("direction0.h5"), b"").unwrap();

        let mut estimates = HashMap::new();
        estimates.insert(PathBuf::from("Dir0.peel.ms"), (1.0, 1.0));
        let fake = FakeQuality { estimates };

        // Duration 72000 s scales the threshold to 0.004; SNR 1.0 passes.
        let directions = vec![direction("0", "Dir0.peel.ms", 72000.0)];
        let rejected = apply_quality_gate(&directions, &fake, results.path()).unwrap();
        assert!(rejected.is_empty());
        assert!(h5files.join("direction0.h5").exists());
    }
}
