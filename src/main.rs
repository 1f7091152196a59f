//! Command line pipeline turning MRI echo series into T2 maps.
//!
//! `dicom` converts DICOM series into volume files, `register` aligns the
//! echoes to a reference, `normalize` divides them by their background and
//! `t2map` hands the prepared images to the external fitting program.
mod config;
mod dicom;
mod image_list;
mod io;
mod logging;
mod naming;
mod process;
mod registration;
mod report;
mod stages;
mod volume;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;

use crate::config::{ConfigError, NormalizeConfig, RegisterConfig, T2MapConfig};
use crate::report::{print_summary, ItemResult, ReportTargets};
use crate::stages::convert::ConvertJob;

#[derive(Parser)]
#[command(name = "t2map-pipeline")]
#[command(about = "MRI T2 mapping pipeline", long_about = None)]
/// Entry CLI that dispatches to subcommands.
struct Cli {
    /// Debug level logging, including per-iteration registration metrics.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Optional destination for the CSV run report.
    #[arg(long, global = true, value_name = "PATH")]
    report_csv: Option<PathBuf>,

    /// Optional destination for the JSON run report.
    #[arg(long, global = true, value_name = "PATH")]
    report_json: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert every DICOM series in a folder into one volume file
    Dicom(DicomArgs),
    /// Rigidly register images to a reference image
    Register(ConfigArgs),
    /// Divide images by their background mean
    Normalize(ConfigArgs),
    /// Run the T2 fitting program for each configured experiment
    T2map(T2MapArgs),
}

#[derive(Args, Clone)]
struct DicomArgs {
    /// Folder holding the DICOM files (not searched recursively).
    dicom_path: PathBuf,

    /// Folder receiving the converted volumes.
    output_dir: PathBuf,

    /// Output format extension (.mha, .mhd, .nii or .nii.gz).
    #[arg(long, default_value = ".mha")]
    extension: String,

    /// Print identifying tags of each series instead of converting.
    #[arg(long)]
    info: bool,
}

#[derive(Args, Clone)]
struct ConfigArgs {
    /// TOML configuration file.
    config: PathBuf,
}

#[derive(Args, Clone)]
struct T2MapArgs {
    /// TOML configuration file.
    config: PathBuf,

    /// T2 fitting program, overriding `[t2map] executable`.
    #[arg(long, value_name = "PATH")]
    executable: Option<String>,

    /// Continue with the next experiment when one fails.
    #[arg(long)]
    keep_going: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = logging::init(cli.verbose) {
        eprintln!("[ERROR] {:#}", e);
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(config_error) = e.downcast_ref::<ConfigError>() {
                for issue in &config_error.issues {
                    eprintln!("{}", issue);
                }
                return ExitCode::from(2);
            }
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

/// Loads the configuration, runs the stage, then writes reports even when
/// the stage failed part way.
async fn run(cli: Cli) -> Result<()> {
    let targets = ReportTargets {
        csv: cli.report_csv,
        json: cli.report_json,
    };
    let mut results: Vec<ItemResult> = Vec::new();

    let (title, outcome) = match cli.command {
        Commands::Dicom(args) => {
            let job = ConvertJob {
                dicom_dir: args.dicom_path,
                output_dir: args.output_dir,
                extension: args.extension,
                info_only: args.info,
            };
            ("dicom", stages::convert::run(&job, &mut results))
        }
        Commands::Register(args) => {
            let config = RegisterConfig::load(&args.config)?;
            ("register", stages::register::run(&config, &mut results))
        }
        Commands::Normalize(args) => {
            let config = NormalizeConfig::load(&args.config)?;
            ("normalize", stages::normalize::run(&config, &mut results))
        }
        Commands::T2map(args) => {
            let mut config = T2MapConfig::load(&args.config)?;
            if let Some(executable) = args.executable {
                config.executable = executable;
            }
            ("t2map", stages::t2map::run(&config, args.keep_going, &mut results).await)
        }
    };

    let report = targets.write(&results);
    if !results.is_empty() {
        print_summary(title, &results);
    }
    settle(outcome, report)
}

/// A stage error takes precedence over a failed report write, which is then only logged.
fn settle(outcome: Result<()>, report: Result<()>) -> Result<()> {
    match (outcome, report) {
        (Err(e), Err(report_error)) => {
            error!("{:#}", report_error);
            Err(e)
        }
        (outcome, report) => report.and(outcome),
    }
}
