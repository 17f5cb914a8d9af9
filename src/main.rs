use std::{env, path::PathBuf, process::exit};

use clap::{AppSettings, Parser};
use itertools::Itertools;
use log::info;

use lodess::{
    command::append_call_log,
    config::{normalise_direction, PipelineConfig},
    error::PipelineError,
    metadata::ScriptMetadata,
    pipeline::{init, RunRequest, Sequencer, Stage},
    quality::ScriptModelQuality,
};

#[derive(Parser, Debug)]
#[clap(about = "Decametre-band calibrator+target pipeline")]
#[clap(global_setting(AppSettings::DeriveDisplayOrder))]
#[clap(disable_help_subcommand = true)]
#[clap(infer_long_args = true)]
struct Args {
    /// Location of the downloaded+demixed data. The final path component
    /// should be the observation's L-number.
    #[clap(required = true)]
    location: Vec<PathBuf>,

    /// Solution file(s) from the calibrator pipeline, used to make an initial
    /// correction. One per location.
    #[clap(long, multiple_values(true))]
    cal_h5: Vec<PathBuf>,

    /// Direction to phase-shift towards in the target pipeline. Format:
    /// "[xxx.xxdeg,yyy.yydeg]".
    #[clap(long)]
    direction: Option<String>,

    /// Folder with pre-determined extraction boxes, needed for
    /// direction-dependent calibration. Defaults to the regions estimated by
    /// the target pipeline.
    #[clap(long)]
    boxes: Option<PathBuf>,

    /// Worker count for the correction pool and the direction-dependent
    /// fan-out. 5 basically fills up a 96-core node.
    #[clap(long, default_value = "6")]
    nthreads: usize,

    /// Demix the raw data in place before anything else.
    #[clap(long, alias = "prerun")]
    demix: bool,

    /// Delete intermediate datasets after running. Only supported for the
    /// calibrator pipeline.
    #[clap(long)]
    delete_files: bool,

    /// Pipeline of choice.
    #[clap(long, arg_enum)]
    pipeline: Option<Stage>,

    /// Flag this station throughout, particularly handy for the calibrator
    /// pipeline.
    #[clap(long)]
    flag_station: Option<String>,

    /// The installation root holding helper scripts, priors and skymodels.
    #[clap(long, default_value = "/net/rijn/data2/groeneveld/LoDeSS_files")]
    root_folder: PathBuf,

    /// Print the parsed arguments and stop.
    #[clap(short, long)]
    debug: bool,

    /// The verbosity of the program. Increase by specifying multiple times
    /// (e.g. -vv). The default is to print only high-level information.
    #[clap(short, long, parse(from_occurrences))]
    verbosity: u8,

    /// Disable progress bars.
    #[clap(long)]
    no_progress_bars: bool,
}

impl Args {
    fn validate(&self) -> Result<(), PipelineError> {
        if self.pipeline == Some(Stage::DiTarget) && self.cal_h5.len() != self.location.len() {
            return Err(PipelineError::Configuration(
                "Must give as many calibrator files as dataset locations when running the DI \
                 pipeline"
                    .to_string(),
            ));
        }
        let missing: Vec<&PathBuf> = self.cal_h5.iter().filter(|cf| !cf.is_file()).collect();
        if !missing.is_empty() {
            return Err(PipelineError::Configuration(format!(
                "Specified calibrator file(s) missing: {}",
                missing.iter().map(|cf| cf.display()).join(", ")
            )));
        }
        if self.delete_files && self.pipeline != Some(Stage::DiCalibrator) {
            return Err(PipelineError::Configuration(
                "Deleting files automatically is currently only supported for the DI calibrator \
                 pipeline"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

fn main() {
    if let Err(e) = run() {
        eprintln!("{e}");
        exit(1);
    }
}

fn run() -> Result<(), PipelineError> {
    let mut args = Args::parse();
    setup_logging(args.verbosity);
    args.validate()?;

    if let Some(direction) = args.direction.as_deref() {
        if let Some(reformatted) = normalise_direction(direction) {
            info!("Reformatting direction to: {reformatted}");
            args.direction = Some(reformatted);
        }
    }

    let base = env::current_dir()?;
    append_call_log(&base, &env::args().join(" "))?;

    if args.debug {
        info!("{args:#?}");
        info!("Stopping for debugging...");
        return Ok(());
    }

    let config = PipelineConfig::from_root(args.root_folder.clone(), args.nthreads);
    if args.demix {
        for location in &args.location {
            init::prerun(&config, location)?;
        }
    }

    let Some(stage) = args.pipeline else {
        return Ok(());
    };
    let metadata = ScriptMetadata::new(&config.helper_scripts);
    let quality = ScriptModelQuality::new(&config.helper_scripts);
    let sequencer = Sequencer {
        config: &config,
        metadata: &metadata,
        quality: &quality,
    };
    let request = RunRequest {
        base,
        locations: args.location,
        cal_files: args.cal_h5,
        direction: args.direction,
        boxes: args.boxes,
        flag_station: args.flag_station,
        delete_files: args.delete_files,
        no_progress_bars: args.no_progress_bars,
    };
    sequencer.run(stage, &request)
}

fn setup_logging(verbosity: u8) {
    let mut builder = env_logger::Builder::from_default_env();
    builder.target(env_logger::Target::Stdout);
    builder.format_target(false);
    match verbosity {
        0 => builder.filter_level(log::LevelFilter::Info),
        1 => builder.filter_level(log::LevelFilter::Debug),
        2 => builder.filter_level(log::LevelFilter::Trace),
        _ => {
            builder.filter_level(log::LevelFilter::Trace);
            builder.format(|buf, record| {
                use std::io::Write;

                let timestamp = buf.timestamp();
                let level = record.level();
                let target = record.target();
                let line = record.line().unwrap_or(0);
                let message = record.args();

                writeln!(buf, "[{timestamp} {level} {target}:{line}] {message}")
            })
        }
    };
    builder.init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_names_parse() {
        let args = Args::try_parse_from(["lodess", "L123456", "--pipeline", "DD"]).unwrap();
        assert_eq!(args.pipeline, Some(Stage::Dd));
        let args =
            Args::try_parse_from(["lodess", "L123456", "--pipeline", "DI_calibrator"]).unwrap();
        assert_eq!(args.pipeline, Some(Stage::DiCalibrator));
        assert!(Args::try_parse_from(["lodess", "L123456", "--pipeline", "bogus"]).is_err());
    }

    #[test]
    fn a_location_is_required() {
        assert!(Args::try_parse_from(["lodess"]).is_err());
    }

    #[test]
    fn prerun_is_an_alias_for_demix() {
        let args = Args::try_parse_from(["lodess", "L123456", "--prerun"]).unwrap();
        assert!(args.demix);
    }

    #[test]
    fn target_needs_one_calibrator_file_per_location() {
        let args = Args::try_parse_from([
            "lodess",
            "L123456",
            "L654321",
            "--pipeline",
            "DI_target",
            "--cal-h5",
            "a.h5",
        ])
        .unwrap();
        assert!(args.validate().is_err());
    }

    #[test]
    fn delete_files_is_calibrator_only() {
        let args = Args::try_parse_from([
            "lodess",
            "L123456",
            "--delete-files",
            "--pipeline",
            "DD",
        ])
        .unwrap();
        assert!(args.validate().is_err());

        let args = Args::try_parse_from([
            "lodess",
            "L123456",
            "--delete-files",
            "--pipeline",
            "DI_calibrator",
        ])
        .unwrap();
        assert!(args.validate().is_ok());
    }

    #[test]
    fn missing_calibrator_files_are_reported() {
        let args = Args::try_parse_from([
            "lodess",
            "L123456",
            "--pipeline",
            "DI_target",
            "--cal-h5",
            "/definitely/not/here.h5",
        ])
        .unwrap();
        let err = args.validate().unwrap_err().to_string();
        assert!(err.contains("/definitely/not/here.h5"));
    }
}
