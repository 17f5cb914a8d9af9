//! Explicit pipeline configuration.
//!
//! Everything the stages need to know about the installation (helper-script
//! locations, solution priors, skymodels, tuning knobs) is carried in a
//! [`PipelineConfig`] value handed to the sequencer, never in process-wide
//! globals.

use std::{f64::consts::PI, path::PathBuf};

use hifitime::Duration;
use lazy_static::lazy_static;

use crate::error::PipelineError;

/// Staged file name of the shared polalign+bandpass solution prior.
pub const BANDPASS_SOLUTIONS: &str = "Band_PA.h5";

/// A field matches a catalogued calibrator when its delay direction lies
/// within this great-circle radius \[radians\] (0.2 degrees).
pub const SKYMODEL_MATCH_RADIUS_RAD: f64 = 0.2 * PI / 180.0;

lazy_static! {
    /// Calibrator sources with curated skymodels: (name, ra, dec) \[radians\].
    static ref CALIBRATOR_POSITIONS: [(&'static str, f64, f64); 2] = [
        ("3c380", -1.44194739, 0.85078014),
        ("3c196", 2.15374139, 0.8415521),
    ];
}

/// A curated skymodel for a calibrator source.
#[derive(Debug, Clone)]
pub struct Skymodel {
    /// Lower-case source name, as the self-cal driver expects it.
    pub source: String,
    pub ra_rad: f64,
    pub dec_rad: f64,
    /// Where the skymodel file lives in the installation.
    pub file: PathBuf,
    /// The name the skymodel is staged under in a working directory. The
    /// source name is the part before the first `-`.
    pub staged_name: String,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// The installation root holding helper scripts, priors and skymodels.
    pub root_folder: PathBuf,

    /// Directory of the self-calibration helper scripts.
    pub helper_scripts: PathBuf,

    /// The self-calibration driver script.
    pub facet_pipeline: PathBuf,

    /// Directory of the solution-merging helpers.
    pub h5_helper: PathBuf,

    /// Source of the shared polalign+bandpass solution prior.
    pub bandpass_solutions: PathBuf,

    pub skymodels: Vec<Skymodel>,

    /// Frequency-averaging factor applied during per-dataset correction.
    pub freqstep: usize,

    /// Frequency-averaging factor applied after phase-shifting to the
    /// target.
    pub target_freqstep: usize,

    /// Thread count handed to the visibility-processing tool.
    pub dppp_threads: usize,

    /// Worker count for both the correction pool and the staggered
    /// direction-dependent fan-out.
    pub workers: usize,

    /// Delay between starts of direction-dependent calibration jobs.
    pub dd_spawn_delay: Duration,

    /// Worker count for the demix prerun.
    pub demix_workers: usize,

    /// Delay between starts of demix prerun jobs; buffers the initial
    /// dataset load.
    pub demix_spawn_delay: Duration,
}

impl PipelineConfig {
    pub fn from_root(root_folder: PathBuf, workers: usize) -> PipelineConfig {
        let helper_scripts = root_folder.join("lofar_facet_selfcal");
        let facet_pipeline = helper_scripts.join("facetselfcal.py");
        let skymodel_dir = root_folder.join("skymodels");
        let skymodels = CALIBRATOR_POSITIONS
            .iter()
            .map(|&(source, ra_rad, dec_rad)| {
                let staged_name = match source {
                    "3c380" => "3C380-SH.skymodel",
                    _ => "3C196-pandey.skymodel",
                };
                let file = match source {
                    "3c380" => skymodel_dir.join("3C380_8h_SH.skymodel"),
                    _ => skymodel_dir.join("3C196-pandey.skymodel"),
                };
                Skymodel {
                    source: source.to_string(),
                    ra_rad,
                    dec_rad,
                    file,
                    staged_name: staged_name.to_string(),
                }
            })
            .collect();

        PipelineConfig {
            helper_scripts,
            facet_pipeline,
            h5_helper: root_folder.join("lofar_helpers"),
            bandpass_solutions: root_folder.join("largefiles").join(BANDPASS_SOLUTIONS),
            skymodels,
            freqstep: 1,
            target_freqstep: 4,
            dppp_threads: 80,
            workers,
            dd_spawn_delay: Duration::from_seconds(3600.0),
            demix_workers: 4,
            demix_spawn_delay: Duration::from_seconds(600.0),
            root_folder,
        }
    }

    /// The catalogued skymodel (if any) whose calibrator lies within
    /// [`SKYMODEL_MATCH_RADIUS_RAD`] of the given delay direction.
    pub fn select_skymodel(&self, ra_rad: f64, dec_rad: f64) -> Option<&Skymodel> {
        self.skymodels.iter().find(|sm| {
            angular_separation(ra_rad, dec_rad, sm.ra_rad, sm.dec_rad) < SKYMODEL_MATCH_RADIUS_RAD
        })
    }
}

/// Great-circle separation between two (ra, dec) positions \[radians\].
/// Vincenty form; numerically stable at small separations.
pub fn angular_separation(ra1: f64, dec1: f64, ra2: f64, dec2: f64) -> f64 {
    let (sin_dlon, cos_dlon) = (ra2 - ra1).sin_cos();
    let (sin_dec1, cos_dec1) = dec1.sin_cos();
    let (sin_dec2, cos_dec2) = dec2.sin_cos();
    let num1 = cos_dec2 * sin_dlon;
    let num2 = cos_dec1 * sin_dec2 - sin_dec1 * cos_dec2 * cos_dlon;
    let den = sin_dec1 * sin_dec2 + cos_dec1 * cos_dec2 * cos_dlon;
    num1.hypot(num2).atan2(den)
}

/// A target direction in degrees, parsed from the bracketed command-line
/// form.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetDirection {
    pub ra_deg: f64,
    pub dec_deg: f64,
}

impl TargetDirection {
    /// Parse `"[147.5deg,55.2deg]"` (the `deg` suffixes are optional).
    pub fn parse(direction: &str) -> Result<TargetDirection, PipelineError> {
        let bad = || {
            PipelineError::Configuration(format!(
                "Direction {direction:?} is not of the form \"[xxx.xxdeg,yyy.yydeg]\""
            ))
        };
        let inner = direction
            .trim()
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .ok_or_else(bad)?;
        let values: Vec<f64> = inner
            .split(',')
            .map(|part| {
                let part = part.trim();
                part.strip_suffix("deg").unwrap_or(part).trim().parse()
            })
            .collect::<Result<_, _>>()
            .map_err(|_| bad())?;
        match values.as_slice() {
            [ra_deg, dec_deg] => Ok(TargetDirection {
                ra_deg: *ra_deg,
                dec_deg: *dec_deg,
            }),
            _ => Err(bad()),
        }
    }

    pub fn ra_rad(&self) -> f64 {
        self.ra_deg.to_radians()
    }

    pub fn dec_rad(&self) -> f64 {
        self.dec_deg.to_radians()
    }
}

/// Rewrite a parenthesized-tuple direction (`"(147.5, 55.2)"`) into the
/// bracketed form the rest of the pipeline uses. Returns `None` when the
/// input is already in bracket form.
pub fn normalise_direction(direction: &str) -> Option<String> {
    if !direction.trim_start().starts_with('(') {
        return None;
    }
    let parts: Vec<String> = direction
        .replace(['(', ')'], "")
        .split(',')
        .map(|p| format!("{}deg", p.trim()))
        .collect();
    Some(format!("[{}]", parts.join(",")))
}
