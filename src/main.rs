use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use env_logger::Env;

use calphenix::calibration::combination::ResidualVariable;
use calphenix::calibration::{check_residuals, check_timing, residuals, run_offset, tower_offset};
use calphenix::config::{CalibrationConfig, ResidualsConfig, RunOffsetConfig, TowerOffsetConfig};
use calphenix::error::CalibrationError;
use calphenix::util::processer::{Processor, ProcessorSettings};

#[derive(Parser)]
#[command(name = "calphenix", version, about = "PHENIX residual and EMCal timing calibrations")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sigmalized track-matching residuals (dphi, dz) per detector and charge
    Residuals {
        #[command(flatten)]
        run: RunArgs,
        /// Calibrate only the detector at this index of `detectors_to_calibrate`
        #[arg(long)]
        detector: Option<usize>,
        /// Calibrate only this variable (dphi or dz)
        #[arg(long, value_parser = parse_variable)]
        variable: Option<ResidualVariable>,
    },
    /// EMCal time offset vs ADC for every tower of a sector
    TowerOffset {
        #[command(flatten)]
        run: RunArgs,
        /// Calibrate only the sector at this index of `sectors_to_calibrate`
        #[arg(long)]
        sector: Option<usize>,
    },
    /// EMCal time offset vs ADC for every run of a sector
    RunOffset {
        #[command(flatten)]
        run: RunArgs,
        #[arg(long)]
        sector: Option<usize>,
    },
    /// Applies written parameter tables and re-fits the corrected distributions
    Check {
        #[command(subcommand)]
        program: CheckCommand,
    },
}

#[derive(Subcommand)]
enum CheckCommand {
    /// Sigmalized residuals should peak at 0 with width 1; writes `recal_*` tables
    Residuals {
        #[command(flatten)]
        run: RunArgs,
        #[arg(long)]
        detector: Option<usize>,
        #[arg(long, value_parser = parse_variable)]
        variable: Option<ResidualVariable>,
    },
    /// EMCal times corrected by the run-by-run offsets should peak at 0
    Timing {
        #[command(flatten)]
        run: RunArgs,
        #[arg(long)]
        sector: Option<usize>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Input file, or a directory holding `<status>.yaml`
    input: PathBuf,
    /// Worker threads (defaults to the available parallelism)
    #[arg(short, long)]
    threads: Option<usize>,
    /// Do not draw the progress bar
    #[arg(long)]
    no_progress: bool,
}

impl RunArgs {
    fn processor(&self) -> Processor {
        Processor::new(ProcessorSettings {
            threads: self.threads,
            show_progress: !self.no_progress,
        })
    }
}

fn parse_variable(name: &str) -> Result<ResidualVariable, String> {
    ResidualVariable::from_name(name).ok_or_else(|| format!("unknown variable \"{name}\", expected dphi or dz"))
}

fn dispatch(command: Command) -> Result<(), CalibrationError> {
    match command {
        Command::Residuals { run, detector, variable } => {
            let config = ResidualsConfig::load(&run.input)?;
            residuals::run(&config, &run.processor(), detector, variable)
        }
        Command::TowerOffset { run, sector } => {
            let config = TowerOffsetConfig::load(&run.input)?;
            tower_offset::run(&config, &run.processor(), sector)
        }
        Command::RunOffset { run, sector } => {
            let config = RunOffsetConfig::load(&run.input)?;
            run_offset::run(&config, &run.processor(), sector)
        }
        Command::Check {
            program: CheckCommand::Residuals { run, detector, variable },
        } => {
            let config = ResidualsConfig::load(&run.input)?;
            check_residuals::run(&config, &run.processor(), detector, variable)
        }
        Command::Check {
            program: CheckCommand::Timing { run, sector },
        } => {
            let config = RunOffsetConfig::load(&run.input)?;
            check_timing::run(&config, &run.processor(), sector)
        }
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    match dispatch(Cli::parse().command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}
