//! The target pipeline: per-L-number calibration application and
//! phase-shifting, then consolidated self-calibration, direction-independent
//! imaging and extraction-region estimation.

use std::{fs, path::Path};

use itertools::Itertools;
use log::info;

use super::{calibrator, file_name_string, glob_sorted, init, WorkingContext};
use crate::{
    command::{ExternalCommand, RunOptions},
    config::{PipelineConfig, TargetDirection, BANDPASS_SOLUTIONS},
    error::PipelineError,
    metadata::VisMetadata,
};

/// Drive the target pipeline: one split-and-calibrate pass per L-number,
/// then the consolidated pass over all of them. Needs exactly one
/// calibration file per L-number found in the working directory.
pub fn run(
    config: &PipelineConfig,
    metadata: &dyn VisMetadata,
    ctx: &WorkingContext,
    direction: &str,
    no_progress_bars: bool,
) -> Result<(), PipelineError> {
    let raw_names: Vec<String> = init::raw_datasets(&ctx.dir)?
        .iter()
        .filter_map(|p| file_name_string(p))
        .collect();
    let lnums = lnumbers(&raw_names);
    if lnums.len() != ctx.cal_files.len() {
        return Err(PipelineError::Configuration(format!(
            "Found {} L-number(s) in the working directory but {} calibrator file(s) were \
             supplied. Maybe something went wrong in the initialisation phase?",
            lnums.len(),
            ctx.cal_files.len()
        )));
    }

    for (lnum, cal_file) in lnums.iter().zip(ctx.cal_files.iter()) {
        individual_target(config, metadata, ctx, lnum, cal_file, direction, no_progress_bars)?;
    }
    consolidated_target(config, ctx, direction)
}

/// The unique L-numbers (dataset name prefixes before the first `_`),
/// sorted.
fn lnumbers(raw_names: &[String]) -> Vec<String> {
    raw_names
        .iter()
        .filter_map(|name| name.split('_').next())
        .map(|l| l.to_string())
        .unique()
        .sorted()
        .collect()
}

/// Split one L-number's datasets into their own directory, correct them,
/// concatenate, apply the calibrator solutions in a circular basis, and
/// phase-shift towards the target. The phase-shifted dataset (and the
/// calibrated concat) are staged back at the parent level for the
/// consolidated pass.
fn individual_target(
    config: &PipelineConfig,
    metadata: &dyn VisMetadata,
    ctx: &WorkingContext,
    lnum: &str,
    cal_file: &Path,
    direction: &str,
    no_progress_bars: bool,
) -> Result<(), PipelineError> {
    info!("Running the individual target pipeline for {lnum}");
    let sub = ctx.descend(lnum);
    fs::create_dir(&sub.dir)?;
    for dataset in glob_sorted(&ctx.dir, &format!("{lnum}*.msdemix"))? {
        if let Some(name) = file_name_string(&dataset) {
            fs::rename(&dataset, sub.dir.join(name))?;
        }
    }

    let opts = RunOptions::default();
    ExternalCommand::new("cp")
        .arg("-r")
        .arg(cal_file.display())
        .arg(sub.dir.join("calibrator.h5").display())
        .run_in(&sub.dir, &opts)?;
    ExternalCommand::new("cp")
        .arg("-r")
        .arg(ctx.dir.join(BANDPASS_SOLUTIONS).display())
        .arg(sub.dir.join(BANDPASS_SOLUTIONS).display())
        .run_in(&sub.dir, &opts)?;

    calibrator::correct_all(config, metadata, &sub, no_progress_bars)?;
    let corrected = calibrator::corrected_datasets(metadata, &sub)?;
    let concat = calibrator::concatenate(config, &sub, corrected)?;

    // The calibrator solutions were solved in a circular basis; convert,
    // apply, convert back.
    ExternalCommand::new("cp")
        .arg("-r")
        .arg(config.root_folder.join("lin2circ.py").display())
        .arg(sub.dir.display())
        .run_in(&sub.dir, &opts)?;
    ExternalCommand::new("python")
        .arg("lin2circ.py")
        .arg("-i")
        .arg(&concat)
        .arg("-c")
        .arg("DATA")
        .arg("-o")
        .arg("DATA_CIRC")
        .run_in(&sub.dir, &opts)?;

    ExternalCommand::new("DPPP")
        .param("msin", &concat)
        .param("msout", ".")
        .param("steps", "[ac1,ac2]")
        .param("msout.datacolumn", "CALCORRECT_DATA_CIRC")
        .param("msin.datacolumn", "DATA_CIRC")
        .param("ac1.type", "applycal")
        .param("ac1.parmdb", "calibrator.h5")
        .param("ac1.solset", "sol000")
        .param("ac1.correction", "phase000")
        .param("ac2.type", "applycal")
        .param("ac2.parmdb", "calibrator.h5")
        .param("ac2.solset", "sol000")
        .param("ac2.correction", "amplitude000")
        .run_in(&sub.dir, &opts)?;

    ExternalCommand::new("python")
        .arg("lin2circ.py")
        .arg("-i")
        .arg(&concat)
        .arg("-c")
        .arg("CALCORRECT_DATA_CIRC")
        .arg("-b")
        .arg("-l")
        .arg("CALCORRECT_DATA")
        .run_in(&sub.dir, &opts)?;
    ExternalCommand::new("cp")
        .arg("-r")
        .arg(sub.dir.join(&concat).display())
        .arg(ctx.dir.display())
        .run_in(&sub.dir, &opts)?;

    let shifted = format!("phaseshifted_{concat}");
    ExternalCommand::new("DPPP")
        .param("msin", &concat)
        .param("msin.datacolumn", "CALCORRECT_DATA")
        .param("msout", &shifted)
        .param("msout.storagemanager", "dysco")
        .param("msout.writefullresflag", "false")
        .param("steps", "[phaseshift,averager]")
        .param("phaseshift.phasecenter", direction)
        .param("averager.freqstep", config.target_freqstep)
        .run_in(&sub.dir, &opts)?;
    ExternalCommand::new("cp")
        .arg("-r")
        .arg(sub.dir.join(&shifted).display())
        .arg(ctx.dir.display())
        .run_in(&sub.dir, &opts)?;
    Ok(())
}

/// Self-calibrate all phase-shifted datasets together, image the full field
/// and estimate extraction regions for the direction-dependent stage.
fn consolidated_target(
    config: &PipelineConfig,
    ctx: &WorkingContext,
    direction: &str,
) -> Result<(), PipelineError> {
    let opts = RunOptions::default();
    let target_cal = ctx.descend("target_cal");
    fs::create_dir(&target_cal.dir)?;
    for shifted in glob_sorted(&ctx.dir, "phaseshifted_*")? {
        if let Some(name) = file_name_string(&shifted) {
            fs::rename(&shifted, target_cal.dir.join(name))?;
        }
    }

    let parsed = TargetDirection::parse(direction)?;
    write_boxfile(&target_cal.dir, &parsed)?;

    let shifted_names: Vec<String> = glob_sorted(&target_cal.dir, "phaseshifted_*")?
        .iter()
        .filter_map(|p| file_name_string(p))
        .collect();
    ExternalCommand::new("python")
        .arg(config.facet_pipeline.display())
        .param("--helperscriptspath", config.helper_scripts.display())
        .param("--helperscriptspathh5merge", config.h5_helper.display())
        .param("--pixelscale", 8)
        .arg("-b")
        .arg("boxfile.reg")
        .param("--antennaconstraint", "['core',None]")
        .arg("--BLsmooth")
        .param("--ionfactor", 0.02)
        .arg("--docircular")
        .arg("--startfromtgss")
        .param("--soltype-list", "['scalarphasediffFR','tecandphase']")
        .param("--solint-list", "[24,1]")
        .param("--nchan-list", "[1,1]")
        .param("--smoothnessconstraint-list", "[1.0,0.0]")
        .param("--uvmin", 300)
        .param("--channelsout", 24)
        .param("--fitspectralpol", "False")
        .param("--soltypecycles-list", "[0,0]")
        .param("--normamps", "False")
        .param("--stop", 5)
        .param("--smoothnessreffrequency-list", "[30.,0]")
        .param("--doflagging", "True")
        .param("--doflagslowphases", "False")
        .param("--flagslowamprms", 25)
        .args(&shifted_names)
        .run_in(&target_cal.dir, &RunOptions::logged("target_di_facetselfcal.log"))?;

    // Direction-independent image of the whole field, with the merged
    // self-cal solutions applied per concat dataset.
    let di_image = ctx.descend("DI_image");
    fs::create_dir(&di_image.dir)?;
    for merged in glob_sorted(&target_cal.dir, "merged_selfcalcyle004*")? {
        // Keep their original names; the apply step below depends on them.
        ExternalCommand::new("cp")
            .arg("-r")
            .arg(merged.display())
            .arg(ctx.dir.display())
            .run_in(&ctx.dir, &opts)?;
    }
    for concat in glob_sorted(&ctx.dir, "L*concat.ms")? {
        let Some(name) = file_name_string(&concat) else {
            continue;
        };
        ExternalCommand::new("DPPP")
            .param("msin", &name)
            .param("msout", format!("DI_image/corrected_{name}"))
            .param("msin.datacolumn", "CALCORRECT_DATA_CIRC")
            .param("steps", "[ac1,ac2]")
            .param("msout.writefullresflag", "false")
            .param("msout.storagemanager", "dysco")
            .param("ac1.type", "applycal")
            .param("ac1.parmdb", format!("merged_selfcalcyle004_phaseshifted_{name}.copy.h5"))
            .param("ac1.solset", "sol000")
            .param("ac1.correction", "phase000")
            .param("ac2.type", "applycal")
            .param("ac2.parmdb", format!("merged_selfcalcyle004_phaseshifted_{name}.copy.h5"))
            .param("ac2.solset", "sol000")
            .param("ac2.correction", "amplitude000")
            .run_in(&ctx.dir, &opts)?;
    }

    let corrected_names: Vec<String> = glob_sorted(&di_image.dir, "corrected_*")?
        .iter()
        .filter_map(|p| file_name_string(p))
        .collect();
    ExternalCommand::new("wsclean")
        .args([
            "-no-update-model-required",
            "-minuv-l",
            "80.0",
            "-size",
            "8192",
            "8192",
            "-reorder",
            "-parallel-deconvolution",
            "2048",
            "-weight",
            "briggs",
            "-0.5",
            "-weighting-rank-filter",
            "3",
            "-clean-border",
            "1",
            "-parallel-reordering",
            "4",
            "-mgain",
            "0.8",
            "-fit-beam",
            "-data-column",
            "DATA",
            "-padding",
            "1.4",
            "-join-channels",
            "-channels-out",
            "8",
            "-auto-mask",
            "2.5",
            "-auto-threshold",
            "0.5",
            "-pol",
            "i",
            "-baseline-averaging",
            "2.396844981071314",
            "-use-wgridder",
            "-name",
            "image_000",
            "-scale",
            "8.0arcsec",
            "-niter",
            "150000",
        ])
        .args(&corrected_names)
        .run_in(&di_image.dir, &RunOptions::logged("target_di_image.log"))?;

    // First guess of the extraction regions from the wide-field image.
    let extract = ctx.descend("extract_directions");
    fs::create_dir(&extract.dir)?;
    ExternalCommand::new("cp")
        .arg("-r")
        .arg(di_image.dir.join("image_000-MFS-image.fits").display())
        .arg(extract.dir.display())
        .run_in(&extract.dir, &opts)?;
    for helper in ["extract.py", "split_rectangles.py"] {
        ExternalCommand::new("cp")
            .arg("-r")
            .arg(config.root_folder.join("DI").join(helper).display())
            .arg(extract.dir.display())
            .run_in(&extract.dir, &opts)?;
    }
    ExternalCommand::new("python")
        .arg("extract.py")
        .run_in(&extract.dir, &opts)?;
    ExternalCommand::new("python")
        .arg("split_rectangles.py")
        .arg("regions_ws1.reg")
        .run_in(&extract.dir, &opts)?;
    Ok(())
}

/// Write the ds9 box region centred on the target that constrains the
/// consolidated self-calibration.
fn write_boxfile(dir: &Path, direction: &TargetDirection) -> Result<(), PipelineError> {
    // 8 arcsec pixels, 512 of them.
    let width_arcsec = 8.0 * 512.0;
    let contents = format!(
        "# Region file format: DS9\nfk5\nbox({:.6},{:.6},{w}\",{w}\",0)\n",
        direction.ra_deg,
        direction.dec_deg,
        w = width_arcsec,
    );
    fs::write(dir.join("boxfile.reg"), contents)?;
    Ok(())
}
