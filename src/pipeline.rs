use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use log::info;

use super::aggregator::{AggregationResult, AggregatorConfig, EventAggregator, aggregate_parallel};
use super::applier::{CalibratedRun, CalibrationApplier, ChannelCalibration, beam_scale};
use super::calibration_table::CalibrationTable;
use super::channel_map::ChannelGeometryMap;
use super::config::CalibConfig;
use super::error::CalibError;
use super::event::Event;
use super::event_file::EventFile;
use super::output_paths::OutputPaths;
use super::qa::{self, JsonQaReport, QaSink};
use super::simulation::{JsonHistogramStore, SimulationReference};
use super::solver::{CalibrationSolution, solve};

fn progress_bar(len: usize, message: &str) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::with_template("[{elapsed_precise}] {bar:40} {pos:>7}/{len:7} {msg}") {
        pb.set_style(style);
    }
    pb.set_message(message.to_owned());
    pb
}

/// Outputs of one command. Each file is written under a `.partial` name and the
/// set is only moved into place once every write succeeded.
#[derive(Debug, Default)]
struct StagedOutputs {
    files: Vec<(PathBuf, PathBuf)>,
}

impl StagedOutputs {
    fn stage(&mut self, path: &Path) -> PathBuf {
        let mut name = OsString::from(path.as_os_str());
        name.push(".partial");
        let staged = PathBuf::from(name);
        self.files.push((staged.clone(), path.to_path_buf()));
        staged
    }

    fn finish(self, written: Result<(), CalibError>) -> Result<(), CalibError> {
        let result = written.and_then(|()| {
            for (staged, path) in &self.files {
                fs::rename(staged, path)?;
            }
            Ok(())
        });
        if result.is_err() {
            for (staged, _) in &self.files {
                fs::remove_file(staged).ok();
            }
        }
        result
    }
}

/// One pass of the aggregator over a whole file.
pub fn aggregate_file(
    file: &EventFile,
    map: &ChannelGeometryMap,
    config: &AggregatorConfig,
    calibration: Option<&ChannelCalibration>,
    parallel: bool,
) -> Result<AggregationResult, CalibError> {
    let pb = progress_bar(file.len(), "integrating");

    let result = if parallel {
        let mut events: Vec<Event> = Vec::with_capacity(file.len());
        for event in file.iter() {
            events.push(event?);
            pb.inc(1);
        }
        aggregate_parallel(map, config, calibration, &events)
    } else {
        let mut aggregator = EventAggregator::new(map, config);
        if let Some(calibration) = calibration {
            aggregator = aggregator.with_calibration(calibration);
        }
        for event in file.iter() {
            aggregator.push_event(&event?);
            pb.inc(1);
        }
        aggregator.finish()
    };

    pb.finish_and_clear();
    result.summary.log();
    Ok(result)
}

#[derive(Debug, Clone)]
pub struct CalibrateOutcome {
    pub solution: CalibrationSolution,
    pub aggregation: AggregationResult,
    pub table_path: PathBuf,
    pub text_path: PathBuf,
    pub qa_path: PathBuf,
}

/// Derives the calibration table of the target layer and writes it with its QA report.
pub fn calibrate(
    config: &CalibConfig,
    input: &Path,
    simulation: &Path,
    output_dir: &Path,
) -> Result<CalibrateOutcome, CalibError> {
    let map = config.channel_map()?;
    let store = JsonHistogramStore::open(simulation)?;
    let file = EventFile::open(input)?;

    let aggregation = aggregate_file(
        &file,
        &map,
        &config.calibration_aggregator(),
        None,
        config.parallel,
    )?;
    let sim = SimulationReference::load(
        &store,
        &config.simulation_prefix,
        config.solver.reference_layer,
        &config.layout,
    );
    let solution = solve(&aggregation.cells, &sim, &config.layout, &config.solver);
    solution.log();

    let mut report = JsonQaReport::default();
    qa::push_aggregation(&mut report, &aggregation);
    qa::push_simulation(&mut report, &sim);
    qa::push_solution(&mut report, &solution);
    for key in &aggregation.unmapped_channels {
        report.note(format!("unmapped channel {key}"));
    }

    let paths = OutputPaths::for_input(output_dir, input, Some(config.target_layer));
    let table_path = paths.calibration_table();
    let text_path = paths.calibration_text();
    let qa_path = paths.calibration_qa();
    let mut outputs = StagedOutputs::default();
    let staged_table = outputs.stage(&table_path);
    let staged_text = outputs.stage(&text_path);
    let staged_qa = outputs.stage(&qa_path);
    let written = solution
        .table
        .write_parquet(&staged_table)
        .and_then(|()| solution.table.write_text(&staged_text))
        .and_then(|()| report.write(&staged_qa));
    outputs.finish(written)?;
    info!(
        "Wrote {} calibration constants to {}",
        solution.table.len(),
        table_path.display()
    );

    Ok(CalibrateOutcome {
        solution,
        aggregation,
        table_path,
        text_path,
        qa_path,
    })
}

#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub run: CalibratedRun,
    pub events_path: PathBuf,
    pub qa_path: PathBuf,
}

/// Applies one or more tables to a file. The simulation store is optional and only
/// feeds the beam normalization and the data/simulation comparison.
pub fn apply(
    config: &CalibConfig,
    input: &Path,
    tables: &[PathBuf],
    simulation: Option<&Path>,
    output_dir: &Path,
) -> Result<ApplyOutcome, CalibError> {
    if tables.is_empty() {
        return Err(CalibError::Config(
            "at least one calibration table is needed".to_owned(),
        ));
    }
    let map = config.channel_map()?;
    let table = CalibrationTable::load_all(tables)?;
    let calibration = ChannelCalibration::build(&map, &table);
    let sim = match simulation {
        Some(path) => Some(SimulationReference::load_layers(
            &JsonHistogramStore::open(path)?,
            &config.simulation_prefix,
            config.max_layers,
            &config.layout,
        )),
        None => None,
    };
    let scale = match (&sim, config.beam_normalization) {
        (Some(sim), true) => beam_scale(
            config.solver.beam_energy_mev(),
            sim,
            config.target_layer,
            &config.layout,
        ),
        _ => None,
    };

    let file = EventFile::open(input)?;
    let aggregation = config.applier_aggregator();
    let mut applier = CalibrationApplier::new(&map, &aggregation, &calibration, &config.applier)
        .with_beam_scale(scale);
    let pb = progress_bar(file.len(), "calibrating");
    for event in file.iter() {
        applier.push_event(&event?);
        pb.inc(1);
    }
    pb.finish_and_clear();

    let run = applier.finish();
    run.aggregation.summary.log();
    run.log(sim.as_ref());

    let mut report = JsonQaReport::default();
    qa::push_calibrated_run(&mut report, &run, sim.as_ref());
    for key in calibration.missing() {
        report.note(format!("{key} has no calibration entry, unity used"));
    }
    for key in &run.aggregation.zero_constant_channels {
        report.note(format!("{key} has a zero calibration constant"));
    }

    let paths = OutputPaths::for_input(output_dir, input, None);
    let events_path = paths.calibrated_events();
    let qa_path = paths.energy_qa();
    let mut outputs = StagedOutputs::default();
    let staged_events = outputs.stage(&events_path);
    let staged_qa = outputs.stage(&qa_path);
    let written = run
        .write_events(&staged_events)
        .and_then(|()| report.write(&staged_qa));
    outputs.finish(written)?;

    Ok(ApplyOutcome {
        run,
        events_path,
        qa_path,
    })
}

/// Integrated ADC spectra of the target layer, without any calibration.
pub fn integrated_adc_qa(
    config: &CalibConfig,
    input: &Path,
    output_dir: &Path,
) -> Result<PathBuf, CalibError> {
    let map = config.channel_map()?;
    let file = EventFile::open(input)?;
    let aggregation = aggregate_file(&file, &map, &config.qa_aggregator(), None, config.parallel)?;

    let mut report = JsonQaReport::default();
    qa::push_aggregation(&mut report, &aggregation);
    report.push_value("target_layer", config.target_layer as f64);

    let path = OutputPaths::for_input(output_dir, input, Some(config.target_layer)).integrated_adc_qa();
    report.write(&path)?;
    Ok(path)
}

pub fn select(config: &CalibConfig, input: &Path, output: &Path) -> Result<usize, CalibError> {
    let file = EventFile::open(input)?;
    config.selection.run(&file, output)
}
