//! Working-directory initialisation and the optional demix prerun.

use std::{
    fs,
    path::{Component, Path, PathBuf},
};

use log::{info, warn};

use super::{file_name_string, glob_sorted, WorkingContext};
use crate::{
    command::{ExternalCommand, RunOptions},
    config::{PipelineConfig, BANDPASS_SOLUTIONS},
    error::PipelineError,
    metadata::VisMetadata,
    pool,
};

/// Create and populate a working directory for the given location(s).
///
/// The run label comes from the location's directory name when there is one
/// location, and from the field code of a sample dataset when several
/// locations of the same pointing are combined. The shared bandpass prior,
/// all raw demixed datasets, and (when the field matches a catalogued
/// calibrator) a skymodel are staged into the new directory.
pub fn run(
    config: &PipelineConfig,
    metadata: &dyn VisMetadata,
    locations: &[PathBuf],
    base: &Path,
) -> Result<WorkingContext, PipelineError> {
    let first = locations.first().ok_or_else(|| {
        PipelineError::Configuration("No location given to initialise from".to_string())
    })?;
    let sample = raw_datasets(first)?.into_iter().next().ok_or_else(|| {
        PipelineError::MissingPrerequisite(format!(
            "No raw demixed datasets found at {}",
            first.display()
        ))
    })?;

    let label = if locations.len() == 1 {
        location_label(first).ok_or_else(|| {
            PipelineError::Configuration(format!(
                "Cannot derive a run label from location {}",
                first.display()
            ))
        })?
    } else {
        metadata.field_code(&sample)?
    };

    let workdir = base.join(&label);
    info!("Initialising working directory {}", workdir.display());
    fs::create_dir(&workdir)?;

    let opts = RunOptions::default();
    ExternalCommand::new("cp")
        .arg("-r")
        .arg(config.bandpass_solutions.display())
        .arg(workdir.join(BANDPASS_SOLUTIONS).display())
        .run_in(base, &opts)?;

    for location in locations {
        for dataset in raw_datasets(location)? {
            if let Some(name) = file_name_string(&dataset) {
                info!("Copying {name}");
                ExternalCommand::new("cp")
                    .arg("-r")
                    .arg(dataset.display())
                    .arg(workdir.join(&name).display())
                    .run_in(base, &opts)?;
            }
        }
    }

    let (ra_rad, dec_rad) = metadata.delay_direction(&sample)?;
    match config.select_skymodel(ra_rad, dec_rad) {
        Some(skymodel) => {
            info!("Field matches calibrator {}", skymodel.source);
            ExternalCommand::new("cp")
                .arg("-r")
                .arg(skymodel.file.display())
                .arg(workdir.join(&skymodel.staged_name).display())
                .run_in(base, &opts)?;
        }
        None => warn!("Field matches no catalogued calibrator; no skymodel staged"),
    }

    Ok(WorkingContext::new(workdir))
}

/// Demix raw data in place before the pipeline proper. The demix helper is
/// launched several times with staggered starts; the delay buffers the
/// initial dataset load.
pub fn prerun(config: &PipelineConfig, location: &Path) -> Result<(), PipelineError> {
    let opts = RunOptions::default();
    for script in glob_sorted(&config.root_folder.join("prerun"), "*.py")? {
        ExternalCommand::new("cp")
            .arg("-r")
            .arg(script.display())
            .arg(location.display())
            .run_in(location, &opts)?;
    }
    ExternalCommand::new("cp")
        .arg("-r")
        .arg(config.root_folder.join("prerun").join("demix.sourcedb").display())
        .arg(location.display())
        .run_in(location, &opts)?;

    pool::run_staggered(config.demix_workers, config.demix_spawn_delay, |_| {
        ExternalCommand::new("python3")
            .arg(location.join("averageandemix.py").display())
            .arg(location.display())
            .run_in(location, &RunOptions::default())?;
        Ok(())
    })
}

/// The raw demixed datasets at a location, sorted by name.
pub(crate) fn raw_datasets(location: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    glob_sorted(location, "*.msdemix")
}

/// The last real component of a location path; tolerates trailing slashes.
fn location_label(location: &Path) -> Option<String> {
    location.components().rev().find_map(|c| match c {
        Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_come_from_the_last_path_component() {
        assert_eq!(
            location_label(Path::new("/data/archive/L123456")).as_deref(),
            Some("L123456")
        );
        assert_eq!(
            location_label(Path::new("L654321/")).as_deref(),
            Some("L654321")
        );
        assert_eq!(location_label(Path::new("/")), None);
    }
}
