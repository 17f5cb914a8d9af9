//! Per-dataset correction, concatenation and direction-independent
//! calibration against a catalogued calibrator.

use std::{fs, path::Path};

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use itertools::Itertools;
use log::info;
use vec1::Vec1;

use super::{file_name_string, glob_sorted, init, WorkingContext};
use crate::{
    command::{ExternalCommand, RunOptions},
    config::{PipelineConfig, BANDPASS_SOLUTIONS},
    error::PipelineError,
    grid::{self, Dataset, GridEntry},
    metadata::{self, VisMetadata},
    pool,
};

/// The command removing stations that the solution table knows nothing
/// about, writing `<stem>.split.ms`.
fn filter_command(config: &PipelineConfig, input: &str, output: &str, missing: &[String]) -> ExternalCommand {
    let baseline = missing.iter().map(|station| format!("!{station}&&*")).join(";");
    ExternalCommand::new("DPPP")
        .param("numthreads", config.dppp_threads)
        .param("msin", input)
        .param("msout.storagemanager", "dysco")
        .param("msout", output)
        .param("msout.writefullresflag", "False")
        .param("steps", "[filter]")
        .param("filter.type", "filter")
        .param("filter.remove", "True")
        .param("filter.baseline", baseline)
}

/// The command applying the polalign, bandpass and beam corrections plus
/// frequency averaging, writing `<stem>.corr.ms`.
fn correction_command(config: &PipelineConfig, input: &str, output: &str) -> ExternalCommand {
    ExternalCommand::new("DPPP")
        .param("numthreads", config.dppp_threads)
        .param("msin", input)
        .param("msout.storagemanager", "dysco")
        .param("msout", output)
        .param("msout.writefullresflag", "False")
        .param("steps", "[applyPA,applyBandpass,applyBeam,avg]")
        .param("applyPA.type", "applycal")
        .param("applyPA.correction", "polalign")
        .param("applyPA.parmdb", BANDPASS_SOLUTIONS)
        .param("applyBandpass.type", "applycal")
        .param("applyBandpass.correction", "bandpass")
        .param("applyBandpass.parmdb", BANDPASS_SOLUTIONS)
        .param("applyBandpass.updateweights", "True")
        .param("applyBeam.type", "applybeam")
        .param("applyBeam.updateweights", "True")
        // Single-subband inputs; the beam is evaluated per subband.
        .param("applyBeam.usechannelfreq", "False")
        .param("avg.type", "averager")
        .param("avg.freqstep", config.freqstep)
}

/// Correct one raw dataset. The original dataset is never touched; the
/// corrected data lands under a new name.
pub(crate) fn correct_dataset(
    config: &PipelineConfig,
    ctx: &WorkingContext,
    ms_name: &str,
    missing: &[String],
) -> Result<(), PipelineError> {
    let stem = ms_name.strip_suffix(".msdemix").unwrap_or(ms_name);
    let opts = RunOptions::default();

    let input = if missing.is_empty() {
        ms_name.to_string()
    } else {
        let split = format!("{stem}.split.ms");
        filter_command(config, ms_name, &split, missing).run_in(&ctx.dir, &opts)?;
        split
    };
    let corrected = format!("{stem}.corr.ms");
    correction_command(config, &input, &corrected).run_in(&ctx.dir, &opts)?;
    Ok(())
}

/// Correct every raw dataset in the working directory over a bounded worker
/// pool.
pub(crate) fn correct_all(
    config: &PipelineConfig,
    metadata: &dyn VisMetadata,
    ctx: &WorkingContext,
    no_progress_bars: bool,
) -> Result<(), PipelineError> {
    let raw = init::raw_datasets(&ctx.dir)?;
    let names: Vec<String> = raw.iter().filter_map(|p| file_name_string(p)).collect();
    let first = raw.first().ok_or_else(|| {
        PipelineError::MissingPrerequisite(format!(
            "No raw demixed datasets in {}",
            ctx.dir.display()
        ))
    })?;

    let missing =
        metadata::missing_stations(metadata, first, &ctx.dir.join(BANDPASS_SOLUTIONS))?;
    if !missing.is_empty() {
        info!(
            "Stations missing from the solution table: {}",
            missing.iter().join(", ")
        );
    }

    let progress = ProgressBar::with_draw_target(
        Some(names.len() as u64),
        if no_progress_bars {
            ProgressDrawTarget::hidden()
        } else {
            ProgressDrawTarget::stdout()
        },
    )
    .with_style(
        ProgressStyle::default_bar()
            .template("{msg:10}: [{wide_bar:.blue}] {pos:3}/{len:3} datasets ({elapsed_precise}<{eta_precise})")
            .unwrap()
            .progress_chars("=> "),
    )
    .with_message("Correcting");

    pool::run_bounded(
        names,
        |name| correct_dataset(config, ctx, &name, &missing),
        config.workers,
        progress,
    )
}

/// The corrected datasets in the working directory, with their frequency
/// metadata, ordered by name.
pub(crate) fn corrected_datasets(
    metadata: &dyn VisMetadata,
    ctx: &WorkingContext,
) -> Result<Vec1<Dataset>, PipelineError> {
    let mut datasets = vec![];
    for path in glob_sorted(&ctx.dir, "*.corr.ms")? {
        let Some(name) = file_name_string(&path) else {
            continue;
        };
        datasets.push(Dataset {
            path: name.into(),
            ref_freq_hz: metadata.ref_frequency(&path)?,
            chan_freq_hz: metadata.chan_frequency(&path)?,
        });
    }
    Vec1::try_from_vec(datasets).map_err(|_| {
        PipelineError::MissingPrerequisite(format!(
            "No corrected datasets in {}; did the correction stage run?",
            ctx.dir.display()
        ))
    })
}

/// Name of the concatenated dataset: the part of a subband name before `SB`,
/// followed by `concat.ms`.
fn concat_output_name(subband_name: &str) -> String {
    let prefix = subband_name.split("SB").next().unwrap_or_default();
    format!("{prefix}concat.ms")
}

/// Regularise the frequency grid and concatenate everything into a single
/// dataset. Placeholder entries are tolerated as missing data by the
/// concatenation tool.
pub(crate) fn concatenate(
    config: &PipelineConfig,
    ctx: &WorkingContext,
    datasets: Vec1<Dataset>,
) -> Result<String, PipelineError> {
    let entries = grid::regularise(datasets);
    let first_real = entries
        .iter()
        .find_map(|e| match e {
            GridEntry::Real(ds) => Some(ds.path.display().to_string()),
            GridEntry::Placeholder { .. } => None,
        })
        .unwrap_or_default();
    let output = concat_output_name(&first_real);

    let msin = format!("[{}]", entries.iter().map(|e| e.name()).join(","));
    ExternalCommand::new("DPPP")
        .param("numthreads", config.dppp_threads)
        .param("msin", msin)
        .param("msout", &output)
        .param("msout.storagemanager", "dysco")
        .param("msout.writefullresflag", "false")
        .param("msin.missingdata", "true")
        .param("msin.orderms", "false")
        .param("steps", "[]")
        .run_in(&ctx.dir, &RunOptions::default())?;
    Ok(output)
}

/// The DI-calibrator stage: correct, concatenate, optionally pre-flag a
/// station, then run the self-calibration driver against the staged
/// skymodel, stopping after the sky solve.
pub fn run(
    config: &PipelineConfig,
    metadata: &dyn VisMetadata,
    ctx: &WorkingContext,
    flag_station: Option<&str>,
    no_progress_bars: bool,
) -> Result<(), PipelineError> {
    correct_all(config, metadata, ctx, no_progress_bars)?;
    let corrected = corrected_datasets(metadata, ctx)?;
    let concat = concatenate(config, ctx, corrected)?;

    let skymodel = glob_sorted(&ctx.dir, "*.skymodel")?
        .first()
        .and_then(|p| file_name_string(p))
        .ok_or_else(|| {
            PipelineError::MissingPrerequisite(format!(
                "No skymodel staged in {}; did init match a calibrator?",
                ctx.dir.display()
            ))
        })?;
    let source = skymodel
        .split('-')
        .next()
        .unwrap_or_default()
        .to_lowercase();

    if let Some(station) = flag_station {
        ExternalCommand::new("DPPP")
            .param("msin", &concat)
            .param("msout", ".")
            .param("steps", "[preflagger]")
            .param("preflagger.baseline", format!("{station}&&*"))
            .run_in(&ctx.dir, &RunOptions::default())?;
    }

    ExternalCommand::new("python")
        .arg(config.facet_pipeline.display())
        .param("--helperscriptspath", config.helper_scripts.display())
        .param("--helperscriptspathh5merge", config.h5_helper.display())
        .arg("--BLsmooth")
        .param("--ionfactor", 0.02)
        .arg("--docircular")
        .arg("--no-beamcor")
        .param("--skymodel", &skymodel)
        .param("--skymodelsource", &source)
        .param("--soltype-list", "['scalarphasediff','scalarphase','complexgain']")
        .param("--solint-list", "[4,1,8]")
        .param("--nchan-list", "[1,1,1]")
        .param("--smoothnessconstraint-list", "[0.6,0.3,1]")
        .param("--imsize", 4096)
        .param("--uvmin", 300)
        .arg("--stopafterskysolve")
        .param("--channelsout", 24)
        .param("--fitspectralpol", "False")
        .param("--soltypecycles-list", "[0,0,0]")
        .param("--normamps", "False")
        .param("--stop", 1)
        .param("--smoothnessreffrequency-list", "[30.,20.,0.]")
        .param("--doflagging", "True")
        .param("--doflagslowphases", "False")
        .param("--flagslowamprms", 25)
        .arg(&concat)
        .run_in(&ctx.dir, &RunOptions::logged("calibrator_facetselfcal.log"))?;
    Ok(())
}

/// Remove the bulky intermediate datasets and collect the image products.
/// Only offered for the calibrator stage.
pub fn delete_intermediates(ctx: &WorkingContext) -> Result<(), PipelineError> {
    for pattern in ["*.msdemix", "*.split.ms", "*.corr.ms"] {
        for path in glob_sorted(&ctx.dir, pattern)? {
            info!("Deleting {}", path.display());
            remove_path(&path)?;
        }
    }
    let images = ctx.dir.join("FITSimages");
    fs::create_dir_all(&images)?;
    for fits in glob_sorted(&ctx.dir, "*.fits")? {
        if let Some(name) = file_name_string(&fits) {
            fs::rename(&fits, images.join(name))?;
        }
    }
    Ok(())
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}
