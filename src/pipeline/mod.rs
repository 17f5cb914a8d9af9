//! The stage sequencer.
//!
//! A pipeline invocation names a [`Stage`]; the [`Sequencer`] validates its
//! preconditions and drives the location through it, threading a
//! [`WorkingContext`] through the stage functions so that no stage ever
//! infers its state from the ambient working directory.

pub mod calibrator;
pub mod dd;
pub mod facet;
pub mod init;
pub mod target;

use std::{
    fs,
    path::{Path, PathBuf},
};

use clap::ArgEnum;
use log::{info, warn};

use crate::{
    config::PipelineConfig,
    error::PipelineError,
    metadata::VisMetadata,
    quality::ModelQuality,
};

/// The selectable pipeline stages. Names match the stage-selection flag
/// values on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ArgEnum)]
pub enum Stage {
    #[clap(name = "DD")]
    Dd,
    #[clap(name = "DI_target")]
    DiTarget,
    #[clap(name = "DI_calibrator")]
    DiCalibrator,
    #[clap(name = "DDF")]
    FacetImaging,
    #[clap(name = "full")]
    Full,
}

/// The directory a stage operates in, plus the upstream artifacts it was
/// handed. Lives for one pipeline invocation.
#[derive(Debug, Clone)]
pub struct WorkingContext {
    /// Every external command for this stage runs in this directory.
    pub dir: PathBuf,

    /// Calibration files carried from the DI-calibrator stage, one per
    /// location.
    pub cal_files: Vec<PathBuf>,
}

impl WorkingContext {
    pub fn new(dir: PathBuf) -> WorkingContext {
        WorkingContext {
            dir,
            cal_files: vec![],
        }
    }

    pub fn with_cal_files(mut self, cal_files: Vec<PathBuf>) -> WorkingContext {
        self.cal_files = cal_files;
        self
    }

    /// The same context one directory further down.
    pub fn descend(&self, sub: &str) -> WorkingContext {
        WorkingContext {
            dir: self.dir.join(sub),
            cal_files: self.cal_files.clone(),
        }
    }
}

/// Everything a stage run needs from the command line.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// The directory the tool was invoked from; working directories are
    /// created under it.
    pub base: PathBuf,
    pub locations: Vec<PathBuf>,
    pub cal_files: Vec<PathBuf>,
    pub direction: Option<String>,
    pub boxes: Option<PathBuf>,
    pub flag_station: Option<String>,
    pub delete_files: bool,
    pub no_progress_bars: bool,
}

pub struct Sequencer<'a> {
    pub config: &'a PipelineConfig,
    pub metadata: &'a dyn VisMetadata,
    pub quality: &'a dyn ModelQuality,
}

impl Sequencer<'_> {
    pub fn run(&self, stage: Stage, req: &RunRequest) -> Result<(), PipelineError> {
        match stage {
            Stage::DiCalibrator => self.di_calibrator(req),
            Stage::DiTarget => self.di_target(req),
            Stage::Dd => self.dd(req),
            Stage::FacetImaging => self.facet_imaging(req),
            Stage::Full => self.full(req),
        }
    }

    fn di_calibrator(&self, req: &RunRequest) -> Result<(), PipelineError> {
        let mut last_ctx = None;
        for location in &req.locations {
            let ctx = init::run(
                self.config,
                self.metadata,
                std::slice::from_ref(location),
                &req.base,
            )?;
            calibrator::run(
                self.config,
                self.metadata,
                &ctx,
                req.flag_station.as_deref(),
                req.no_progress_bars,
            )?;
            last_ctx = Some(ctx);
        }
        if let Some(ctx) = last_ctx {
            if req.delete_files {
                calibrator::delete_intermediates(&ctx)?;
            }
            info!("----------------");
            info!("{}", ctx.dir.display());
        }
        Ok(())
    }

    fn di_target(&self, req: &RunRequest) -> Result<(), PipelineError> {
        let direction = req.direction.as_deref().ok_or_else(|| {
            PipelineError::Configuration(
                "The target pipeline needs a --direction to phase-shift towards".to_string(),
            )
        })?;
        let cal_files = absolute_cal_files(&req.cal_files)?;
        let ctx = init::run(self.config, self.metadata, &req.locations, &req.base)?
            .with_cal_files(cal_files);
        target::run(
            self.config,
            self.metadata,
            &ctx,
            direction,
            req.no_progress_bars,
        )
    }

    fn dd(&self, req: &RunRequest) -> Result<(), PipelineError> {
        let ctx = WorkingContext::new(first_location(req)?);
        dd::run(self.config, &ctx, req.boxes.clone())
    }

    fn facet_imaging(&self, req: &RunRequest) -> Result<(), PipelineError> {
        let ctx = WorkingContext::new(first_location(req)?);
        facet::run(
            self.config,
            self.metadata,
            self.quality,
            &ctx,
            req.direction.as_deref(),
        )
    }

    /// The whole sequence: init, per-L target split, consolidation, DD
    /// calibration, facet imaging. Every stage inspects the artifacts of the
    /// previous one; a failed stage leaves the tree behind for inspection.
    fn full(&self, req: &RunRequest) -> Result<(), PipelineError> {
        let direction = req.direction.as_deref().ok_or_else(|| {
            PipelineError::Configuration(
                "The full pipeline needs a --direction to phase-shift towards".to_string(),
            )
        })?;
        let cal_files = absolute_cal_files(&req.cal_files)?;
        let ctx = init::run(self.config, self.metadata, &req.locations, &req.base)?
            .with_cal_files(cal_files);
        target::run(
            self.config,
            self.metadata,
            &ctx,
            direction,
            req.no_progress_bars,
        )?;
        let boxes = ctx.dir.join("extract_directions").join("regions_ws1");
        dd::run(self.config, &ctx, Some(boxes))?;
        facet::run(self.config, self.metadata, self.quality, &ctx, None)
    }
}

/// The first location, resolved to an absolute path. The late stages run
/// subprocesses in subdirectories of the location, so paths derived from it
/// must not be relative to the invocation directory.
fn first_location(req: &RunRequest) -> Result<PathBuf, PipelineError> {
    let location = req
        .locations
        .first()
        .ok_or_else(|| PipelineError::Configuration("No location given".to_string()))?;
    fs::canonicalize(location).map_err(|e| {
        PipelineError::Configuration(format!(
            "Cannot resolve location {}: {e}",
            location.display()
        ))
    })
}

fn absolute_cal_files(cal_files: &[PathBuf]) -> Result<Vec<PathBuf>, PipelineError> {
    cal_files
        .iter()
        .map(|f| fs::canonicalize(f).map_err(PipelineError::from))
        .collect()
}

/// All paths under `dir` matching a glob pattern, sorted. Unreadable matches
/// are skipped with a warning.
pub(crate) fn glob_sorted(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>, PipelineError> {
    let full_pattern = dir.join(pattern);
    let full_pattern = full_pattern.to_string_lossy();
    let mut paths = vec![];
    let matches = glob::glob(&full_pattern).map_err(|e| {
        PipelineError::Configuration(format!("Bad glob pattern {full_pattern}: {e}"))
    })?;
    for entry in matches {
        match entry {
            Ok(path) => paths.push(path),
            Err(e) => warn!("Skipping unreadable path: {e}"),
        }
    }
    paths.sort();
    Ok(paths)
}

/// The final component of a path as a string, when it has one.
pub(crate) fn file_name_string(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        metadata::MetadataError,
        quality::QualityEstimateError,
    };

    struct NoMetadata;

    impl VisMetadata for NoMetadata {
        fn ref_frequency(&self, _: &Path) -> Result<f64, MetadataError> {
            unimplemented!()
        }
        fn chan_frequency(&self, _: &Path) -> Result<f64, MetadataError> {
            unimplemented!()
        }
        fn time_range(&self, _: &Path) -> Result<(f64, f64), MetadataError> {
            unimplemented!()
        }
        fn station_names(&self, _: &Path) -> Result<Vec<String>, MetadataError> {
            unimplemented!()
        }
        fn field_code(&self, _: &Path) -> Result<String, MetadataError> {
            unimplemented!()
        }
        fn delay_direction(&self, _: &Path) -> Result<(f64, f64), MetadataError> {
            unimplemented!()
        }
        fn solution_stations(&self, _: &Path) -> Result<Vec<String>, MetadataError> {
            unimplemented!()
        }
    }

    struct NoQuality;

    impl ModelQuality for NoQuality {
        fn estimate(&self, _: &Path) -> Result<(f64, f64), QualityEstimateError> {
            unimplemented!()
        }
    }

    #[test]
    fn glob_sorted_finds_and_orders_matches() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.corr.ms", "a.corr.ms", "c.msdemix"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        let found = glob_sorted(dir.path(), "*.corr.ms").unwrap();
        let names: Vec<String> = found.iter().filter_map(|p| file_name_string(p)).collect();
        assert_eq!(names, vec!["a.corr.ms", "b.corr.ms"]);
    }

    #[test]
    fn relative_locations_resolve_before_dd_staging() {
        let base = tempfile::tempdir().unwrap();
        let location = base.path().join("L123456");
        let regions = location.join("extract_directions").join("regions_ws1");
        fs::create_dir_all(&regions).unwrap();
        fs::write(regions.join("Dir0.reg"), b"box").unwrap();
        fs::create_dir(location.join("DI_image")).unwrap();

        // The location as typed on the command line, relative to where the
        // tool was invoked.
        std::env::set_current_dir(base.path()).unwrap();
        let req = RunRequest {
            base: base.path().to_path_buf(),
            locations: vec![PathBuf::from("L123456")],
            cal_files: vec![],
            direction: None,
            boxes: None,
            flag_station: None,
            delete_files: false,
            no_progress_bars: true,
        };

        let resolved = first_location(&req).unwrap();
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("L123456"));

        let config = crate::config::PipelineConfig::from_root(base.path().join("root"), 1);
        let sequencer = Sequencer {
            config: &config,
            metadata: &NoMetadata,
            quality: &NoQuality,
        };
        // The worker launch at the end fails (there is no runner script
        // here); the staging that precedes it must not.
        let _ = sequencer.run(Stage::Dd, &req);
        assert!(location
            .join("DD_cal")
            .join("rectangles")
            .join("Dir0.reg")
            .exists());
    }

    #[test]
    fn descend_keeps_carried_artifacts() {
        let ctx = WorkingContext::new(PathBuf::from("/work/L123456"))
            .with_cal_files(vec![PathBuf::from("/cal/a.h5")]);
        let sub = ctx.descend("DD_cal");
        assert_eq!(sub.dir, PathBuf::from("/work/L123456/DD_cal"));
        assert_eq!(sub.cal_files, ctx.cal_files);
    }
}
