//! Direction-dependent calibration: one staggered self-cal run per worker
//! over the pre-determined extraction boxes.

use std::{fs, path::PathBuf};

use log::info;

use super::{glob_sorted, WorkingContext};
use crate::{
    command::{ExternalCommand, RunOptions},
    config::PipelineConfig,
    error::PipelineError,
    pool,
};

/// Run direction-dependent calibration in a fresh `DD_cal` directory.
///
/// `boxes` is the directory of pre-determined extraction regions; when absent
/// it defaults to the regions estimated by the target pipeline. The regions
/// are checked before anything is created so that a missing prerequisite
/// leaves no half-staged directory behind.
pub fn run(
    config: &PipelineConfig,
    ctx: &WorkingContext,
    boxes: Option<PathBuf>,
) -> Result<(), PipelineError> {
    let boxes = boxes.unwrap_or_else(|| ctx.dir.join("extract_directions").join("regions_ws1"));
    let boxes = fs::canonicalize(&boxes).map_err(|_| missing_boxes(&boxes))?;
    if glob_sorted(&boxes, "*")?.is_empty() {
        return Err(missing_boxes(&boxes));
    }

    let dd_cal = ctx.descend("DD_cal");
    info!("Staging direction-dependent calibration in {}", dd_cal.dir.display());
    fs::create_dir(&dd_cal.dir)?;

    let opts = RunOptions::default();
    ExternalCommand::new("cp")
        .arg("-r")
        .arg(boxes.display())
        .arg(dd_cal.dir.join("rectangles").display())
        .run_in(&dd_cal.dir, &opts)?;
    for runner in glob_sorted(&config.root_folder.join("DD"), "*")? {
        ExternalCommand::new("cp")
            .arg("-r")
            .arg(runner.display())
            .arg(dd_cal.dir.display())
            .run_in(&dd_cal.dir, &opts)?;
    }
    let di_image = ctx.dir.join("DI_image");
    for model in glob_sorted(&di_image, "image_000-????-model.fits")? {
        ExternalCommand::new("cp")
            .arg("-r")
            .arg(model.display())
            .arg(dd_cal.dir.display())
            .run_in(&dd_cal.dir, &opts)?;
    }
    for ms in glob_sorted(&di_image, "*ms")? {
        ExternalCommand::new("cp")
            .arg("-r")
            .arg(ms.display())
            .arg(dd_cal.dir.display())
            .run_in(&dd_cal.dir, &opts)?;
    }

    // Each worker repeatedly picks the next unclaimed direction; the delay
    // between launches spreads the heavy startup load over the node.
    pool::run_staggered(config.workers, config.dd_spawn_delay, |index| {
        ExternalCommand::new("python")
            .arg("launch_run.py")
            .arg(index)
            .run_in(&dd_cal.dir, &RunOptions::default())?;
        Ok(())
    })
}

fn missing_boxes(boxes: &std::path::Path) -> PipelineError {
    PipelineError::MissingPrerequisite(format!(
        "No extraction boxes found at {}. Are you sure you ran the DI pipeline first, and that \
         it created any regions? Do that by hand, if necessary",
        boxes.display()
    ))
}
