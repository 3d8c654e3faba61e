use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand, ValueEnum};

use bic_calib::channel_map::{GeomEncoding, MappingVariant};
use bic_calib::pipeline;
use bic_calib::waveform::WindowStrategy;
use bic_calib::{CalibConfig, CalibError};

#[derive(Parser, Debug)]
#[command(author, version, about = "BIC calorimeter energy calibration", long_about = None)]
struct Cli {
    /// Path to the config file in yaml format
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Derive calibration constants for one layer
    Calibrate {
        /// Event-builder parquet file
        input: PathBuf,
        /// Simulated energy deposit histograms (json)
        simulation: PathBuf,
        #[arg(long, default_value = "calibration_constant_output")]
        output_dir: PathBuf,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Apply calibration tables to a run
    Apply {
        input: PathBuf,
        /// Calibration tables, later ones win on repeated (GeomID, side)
        #[arg(long = "table", required = true, num_args = 1..)]
        tables: Vec<PathBuf>,
        /// Simulation histograms for the beam normalization and data/simulation ratios
        #[arg(long)]
        simulation: Option<PathBuf>,
        #[arg(long)]
        max_layers: Option<u32>,
        #[arg(long)]
        beam_normalize: bool,
        #[arg(long, default_value = "energy_calibration_output")]
        output_dir: PathBuf,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Integrated ADC spectra of one layer
    Qa {
        input: PathBuf,
        #[arg(long, default_value = "intADC_QA_output")]
        output_dir: PathBuf,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Keep the events inside a trigger time / number window
    Select {
        input: PathBuf,
        output: PathBuf,
        #[arg(long)]
        time_min: Option<i64>,
        #[arg(long)]
        time_max: Option<i64>,
        #[arg(long)]
        number_min: Option<i64>,
        #[arg(long)]
        number_max: Option<i64>,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum WindowArg {
    /// Fixed window after each channel's waveform offset
    Fixed,
    /// From one channel's offset to the next
    Gap,
}

#[derive(Args, Debug, Clone)]
struct Overrides {
    #[arg(long)]
    layer: Option<u32>,
    #[arg(long)]
    threshold: Option<f64>,
    /// Beam energy in GeV
    #[arg(long)]
    beam_energy: Option<f64>,
    #[arg(long, value_enum)]
    mapping: Option<MappingVariant>,
    #[arg(long, value_enum)]
    encoding: Option<GeomEncoding>,
    /// Channel map yaml, replaces the built-in wiring
    #[arg(long)]
    channel_map: Option<PathBuf>,
    #[arg(long, value_enum)]
    window: Option<WindowArg>,
    #[arg(long)]
    stride: Option<usize>,
    /// Shard the events over the rayon thread pool
    #[arg(long)]
    parallel: bool,
}

impl Overrides {
    fn apply_to(&self, config: &mut CalibConfig) {
        if let Some(layer) = self.layer {
            config.target_layer = layer;
        }
        if let Some(threshold) = self.threshold {
            config.integration.threshold = threshold;
        }
        if let Some(beam) = self.beam_energy {
            config.solver.beam_energy_gev = beam;
        }
        if let Some(mapping) = self.mapping {
            config.mapping = mapping;
        }
        if let Some(encoding) = self.encoding {
            config.encoding = encoding;
        }
        if let Some(path) = &self.channel_map {
            config.channel_map_file = Some(path.clone());
        }
        match self.window {
            Some(WindowArg::Gap) => config.integration.window = WindowStrategy::InterChannelGap,
            Some(WindowArg::Fixed) => {
                if config.integration.window == WindowStrategy::InterChannelGap {
                    config.integration.window = WindowStrategy::default();
                }
            }
            None => {}
        }
        if let Some(stride) = self.stride {
            config.integration.stride = stride;
        }
        if self.parallel {
            config.parallel = true;
        }
    }
}

fn run(cli: Cli) -> Result<(), CalibError> {
    let mut config = match &cli.config {
        Some(path) => CalibConfig::load(path)?,
        None => CalibConfig::default(),
    };

    match cli.command {
        Command::Calibrate {
            input,
            simulation,
            output_dir,
            overrides,
        } => {
            overrides.apply_to(&mut config);
            config.validate()?;
            let outcome = pipeline::calibrate(&config, &input, &simulation, &output_dir)?;
            log::info!(
                "Calibration table: {} ({} rows, {} invalid)",
                outcome.table_path.display(),
                outcome.solution.table.len(),
                outcome.solution.table.invalid_count()
            );
        }
        Command::Apply {
            input,
            tables,
            simulation,
            max_layers,
            beam_normalize,
            output_dir,
            overrides,
        } => {
            overrides.apply_to(&mut config);
            if let Some(max_layers) = max_layers {
                config.max_layers = max_layers;
            }
            if beam_normalize {
                config.beam_normalization = true;
            }
            config.validate()?;
            let outcome = pipeline::apply(
                &config,
                &input,
                &tables,
                simulation.as_deref(),
                &output_dir,
            )?;
            log::info!(
                "Calibrated {} events into {}",
                outcome.run.events.len(),
                outcome.events_path.display()
            );
        }
        Command::Qa {
            input,
            output_dir,
            overrides,
        } => {
            overrides.apply_to(&mut config);
            config.validate()?;
            let path = pipeline::integrated_adc_qa(&config, &input, &output_dir)?;
            log::info!("Saved {}", path.display());
        }
        Command::Select {
            input,
            output,
            time_min,
            time_max,
            number_min,
            number_max,
        } => {
            let selection = &mut config.selection;
            if let Some(v) = time_min {
                selection.time_min = v;
            }
            if let Some(v) = time_max {
                selection.time_max = v;
            }
            if let Some(v) = number_min {
                selection.number_min = v;
            }
            if let Some(v) = number_max {
                selection.number_max = v;
            }
            pipeline::select(&config, &input, &output)?;
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
