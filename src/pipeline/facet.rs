//! Facet imaging: score the direction-dependent solutions, merge the
//! survivors, and image the field twice with the faceting imager (the second
//! pass masked by the first).

use std::{fs, path::Path};

use itertools::Itertools;
use log::info;

use super::{file_name_string, glob_sorted, WorkingContext};
use crate::{
    command::{ExternalCommand, RunOptions},
    config::{PipelineConfig, TargetDirection},
    error::PipelineError,
    metadata::VisMetadata,
    quality::{self, Direction, DirectionId, ModelQuality},
};

pub fn run(
    config: &PipelineConfig,
    metadata: &dyn VisMetadata,
    estimator: &dyn ModelQuality,
    ctx: &WorkingContext,
    direction: Option<&str>,
) -> Result<(), PipelineError> {
    let dd_cal = ctx.descend("DD_cal");
    if !dd_cal.dir.is_dir() {
        return Err(PipelineError::MissingPrerequisite(
            "You need to perform DD calibration before running the facet-imaging pipeline. Also \
             make sure that you are giving it the directory of the pointing (not the dataset)"
                .to_string(),
        ));
    }

    let opts = RunOptions::default();
    ExternalCommand::new("python")
        .arg("extract_results.py")
        .run_in(&dd_cal.dir, &opts)?;

    let directions = find_directions(metadata, &dd_cal.dir)?;
    let results = dd_cal.dir.join("RESULTS");
    quality::apply_quality_gate(&directions, estimator, &results)?;

    merge_solutions(config, &dd_cal, direction)?;

    // Stage the imaging directory with the merged solutions and the peeled
    // datasets.
    let imaging = ctx.descend("facet_imaging");
    fs::create_dir(&imaging.dir)?;
    ExternalCommand::new("cp")
        .arg("-r")
        .arg(config.root_folder.join("DDF").join("make_mask.py").display())
        .arg(imaging.dir.display())
        .run_in(&imaging.dir, &opts)?;
    for merged in glob_sorted(&dd_cal.dir, "merged.*h5")? {
        ExternalCommand::new("cp")
            .arg("-r")
            .arg(merged.display())
            .arg(imaging.dir.display())
            .run_in(&imaging.dir, &opts)?;
    }
    for ms in glob_sorted(&dd_cal.dir, "*ms")? {
        ExternalCommand::new("cp")
            .arg("-r")
            .arg(ms.display())
            .arg(imaging.dir.display())
            .run_in(&imaging.dir, &opts)?;
    }

    let ms_names: Vec<String> = glob_sorted(&imaging.dir, "*ms")?
        .iter()
        .filter_map(|p| file_name_string(p))
        .collect();
    if ms_names.is_empty() {
        return Err(PipelineError::MissingPrerequisite(format!(
            "No peeled datasets staged in {}",
            imaging.dir.display()
        )));
    }

    ddf_command(&ms_names, ImagingPass::Initial)
        .run_in(&imaging.dir, &RunOptions::logged("ddf_image1.log"))?;
    // Mask from the apparent (flat-noise) image.
    ExternalCommand::new("python")
        .arg("make_mask.py")
        .arg("-s")
        .arg("run1.app.restored.fits")
        .arg("-m")
        .arg("run1mask.fits")
        .run_in(&imaging.dir, &opts)?;
    ddf_command(&ms_names, ImagingPass::Masked)
        .run_in(&imaging.dir, &RunOptions::logged("ddf_image2.log"))?;
    Ok(())
}

/// The calibrated directions under `DD_cal`, found from the peeled datasets
/// the per-direction runs left behind.
fn find_directions(
    metadata: &dyn VisMetadata,
    dd_cal: &Path,
) -> Result<Vec<Direction>, PipelineError> {
    let mut directions = vec![];
    for ms in glob_sorted(dd_cal, "run*/direction*/Dir*ms")? {
        let Some(id) = file_name_string(&ms).and_then(|n| DirectionId::from_ms_name(&n)) else {
            continue;
        };
        let (start, end) = metadata.time_range(&ms)?;
        directions.push(Direction {
            id,
            ms,
            duration_s: end - start,
        });
    }
    if directions.is_empty() {
        return Err(PipelineError::MissingPrerequisite(format!(
            "No calibrated directions found under {}; did the DD stage finish?",
            dd_cal.display()
        )));
    }
    Ok(directions)
}

/// Merge the surviving per-direction solutions into the `merged*.h5` tables
/// the imager applies. Multi-dataset runs get one merged table per dataset
/// index; a target direction (when given) is stamped into each.
fn merge_solutions(
    config: &PipelineConfig,
    dd_cal: &WorkingContext,
    direction: Option<&str>,
) -> Result<(), PipelineError> {
    let add_direction = direction
        .map(|d| {
            let parsed = TargetDirection::parse(d)?;
            Ok::<_, PipelineError>(format!("[{},{}]", parsed.ra_rad(), parsed.dec_rad()))
        })
        .transpose()?;

    let solutions = glob_sorted(&dd_cal.dir.join("RESULTS").join("h5files"), "direction*h5")?;
    let ids: Vec<DirectionId> = solutions
        .iter()
        .filter_map(|p| file_name_string(p).and_then(|n| DirectionId::from_solution_name(&n)))
        .collect();
    if ids.is_empty() {
        return Err(PipelineError::MissingPrerequisite(
            "Every direction was rejected by the quality gate; nothing left to merge".to_string(),
        ));
    }

    let dataset_indices: Vec<u32> = ids.iter().filter_map(|id| id.dataset).unique().sorted().collect();
    if dataset_indices.is_empty() {
        // Single dataset per facet.
        let merge = merge_command(config, "merged.h5", &solutions, "run_0/direction0/Dir0.peel.ms");
        apply_add_direction(merge, add_direction.as_deref()).run_in(&dd_cal.dir, &RunOptions::default())?;
    } else {
        for n in dataset_indices {
            let inputs = glob_sorted(
                &dd_cal.dir.join("RESULTS").join("h5files"),
                &format!("direction*.{n}.h5"),
            )?;
            info!("Merging {} solution table(s) for dataset {n}", inputs.len());
            let merge = merge_command(
                config,
                &format!("merged.{n}.h5"),
                &inputs,
                &format!("run_0/direction0/Dir0.{n}.peel.ms"),
            );
            apply_add_direction(merge, add_direction.as_deref())
                .run_in(&dd_cal.dir, &RunOptions::default())?;
        }
    }
    Ok(())
}

fn merge_command(
    config: &PipelineConfig,
    out: &str,
    inputs: &[std::path::PathBuf],
    template_ms: &str,
) -> ExternalCommand {
    ExternalCommand::new("python")
        .arg(config.h5_helper.join("h5_merger.py").display())
        .arg("-out")
        .arg(out)
        .arg("-in")
        .args(inputs.iter().map(|p| p.display()))
        .arg("--ms")
        .arg(template_ms)
}

fn apply_add_direction(cmd: ExternalCommand, add_direction: Option<&str>) -> ExternalCommand {
    match add_direction {
        Some(coords) => cmd.arg("--add_direction").arg(coords),
        None => cmd,
    }
}

/// The two imaging passes. The second predicts from the first pass's model
/// and cleans inside its mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImagingPass {
    Initial,
    Masked,
}

/// Build one faceting-imager invocation over the staged datasets. With
/// several datasets the merged solution tables carry per-dataset suffixes
/// and the imager resolves the wildcard itself.
fn ddf_command(ms_names: &[String], pass: ImagingPass) -> ExternalCommand {
    let multi = ms_names.len() > 1;
    let sols = if multi { "merged.*.h5" } else { "merged.h5" };
    let mut cmd = ExternalCommand::new("DDF.py")
        .env("NUMEXPR_MAX_THREADS", 96)
        .arg("--Data-ChunkHours=0.5")
        .arg("--Debug-Pdb=never")
        .args(["--Parallel-NCPU", "32"])
        .args(["--Cache-Dir", "./"]);
    if pass == ImagingPass::Masked {
        cmd = cmd
            .arg("--Mask-External=run1mask.fits")
            .arg("--Predict-InitDicoModel=run1.01.DicoModel");
    }
    cmd.args(["--Data-MS", &ms_names.iter().join(",")])
        .args(["--Data-ColName", "DATA"])
        .args(["--Data-Sort", "1"])
        .args(["--Output-Mode", "Clean"])
        .args(["--Deconv-CycleFactor", "0"])
        .args(["--Deconv-MaxMinorIter", "1000000"])
        .args(["--Deconv-RMSFactor", "2.0"])
        .args(["--Deconv-FluxThreshold", "0.0"])
        .args(["--Deconv-Mode", "HMP"])
        .args(["--HMP-AllowResidIncrease", "1.0"])
        .args(["--Weight-Robust", "-0.5"])
        .args(["--Image-NPix", "8192"])
        .args(["--CF-wmax", "50000"])
        .args(["--CF-Nw", "100"])
        .args(["--Beam-CenterNorm", "1"])
        .args(["--Beam-Smooth", "1"])
        .args(["--Beam-Model", "LOFAR"])
        .args(["--Beam-LOFARBeamMode", "A"])
        .args(["--Beam-NBand", "1"])
        .args(["--Beam-DtBeamMin", "5"])
        .args(["--Output-Also", "onNeds"])
        .args(["--Image-Cell", "8.0"])
        .args(["--Freq-NDegridBand", "7"])
        .args(["--Freq-NBand", "7"])
        .args(["--Mask-Auto", "1"])
        .args(["--Mask-SigTh", "2.0"])
        .args(["--GAClean-MinSizeInit", "10"])
        .args(["--GAClean-MaxMinorIterInitHMP", "100000"])
        .args(["--Facets-DiamMax", "1.5"])
        .args(["--Facets-DiamMin", "0.1"])
        .args(["--Weight-ColName", "WEIGHT_SPECTRUM"])
        .args([
            "--Output-Name",
            match pass {
                ImagingPass::Initial => "run1",
                ImagingPass::Masked => "run2",
            },
        ])
        .args(["--DDESolutions-DDModeGrid", "AP"])
        .args(["--DDESolutions-DDModeDeGrid", "AP"])
        .args(["--RIME-ForwardMode", "BDA-degrid"])
        .args(["--Output-RestoringBeam", "45.0"])
        .args([
            "--DDESolutions-DDSols",
            &format!("{sols}:sol000/phase000+amplitude000"),
        ])
        .args(["--Deconv-MaxMajorIter", "8"])
        .args(["--Deconv-PeakFactor", "0.005"])
        .args(["--Cache-Reset", "1"])
        .arg("--Misc-IgnoreDeprecationMarking=1")
}
