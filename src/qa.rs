use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use log::info;
use serde::{Deserialize, Serialize};

use super::aggregator::{AggregationResult, RunSummary};
use super::applier::CalibratedRun;
use super::error::CalibError;
use super::histogram::Histogram;
use super::simulation::SimulationReference;
use super::solver::CalibrationSolution;

/// Destination for diagnostic histograms and scalars.
pub trait QaSink {
    fn push(&mut self, label: &str, histogram: &Histogram);
    fn push_value(&mut self, label: &str, value: f64);
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JsonQaReport {
    pub histograms: BTreeMap<String, Histogram>,
    pub values: BTreeMap<String, f64>,
    pub notes: Vec<String>,
}

impl QaSink for JsonQaReport {
    fn push(&mut self, label: &str, histogram: &Histogram) {
        self.histograms.insert(label.to_owned(), histogram.clone());
    }

    fn push_value(&mut self, label: &str, value: f64) {
        self.values.insert(label.to_owned(), value);
    }
}

impl JsonQaReport {
    pub fn note(&mut self, note: String) {
        self.notes.push(note);
    }

    pub fn write(&self, path: &Path) -> Result<(), CalibError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)?;
        info!("Wrote QA report to {}", path.display());
        Ok(())
    }

    pub fn read(path: &Path) -> Result<JsonQaReport, CalibError> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }
}

pub fn push_summary<S: QaSink + ?Sized>(sink: &mut S, summary: &RunSummary) {
    let counters = [
        ("events_seen", summary.events_seen),
        ("events_accepted", summary.events_accepted),
        ("events_incomplete", summary.events_incomplete),
        ("channels_malformed", summary.channels_malformed),
        ("channels_foreign_board", summary.channels_foreign_board),
        ("channels_unmapped", summary.channels_unmapped),
        ("channels_outside_layer", summary.channels_outside_layer),
        ("channels_missing_offset", summary.channels_missing_offset),
        ("channels_below_threshold", summary.channels_below_threshold),
        ("channels_integrated", summary.channels_integrated),
        ("channels_uncalibrated", summary.channels_uncalibrated),
        ("hits_zero_constant", summary.hits_zero_constant),
    ];
    for (label, count) in counters {
        sink.push_value(&format!("summary.{label}"), count as f64);
    }
}

/// Per-cell distributions and means of one aggregation pass.
pub fn push_aggregation<S: QaSink + ?Sized>(sink: &mut S, result: &AggregationResult) {
    for (key, acc) in result.cells.iter() {
        sink.push(&acc.histogram.name, &acc.histogram);
        sink.push_value(
            &format!("mean.G{}_{}", key.geom_id, key.side.label()),
            acc.mean(),
        );
    }
    push_summary(sink, &result.summary);
}

pub fn push_simulation<S: QaSink + ?Sized>(sink: &mut S, sim: &SimulationReference) {
    for (_, cell) in sim.iter() {
        sink.push(&cell.distribution.name, &cell.distribution);
    }
}

pub fn push_solution<S: QaSink + ?Sized>(sink: &mut S, solution: &CalibrationSolution) {
    for row in &solution.rows {
        let cell = format!("G{}_{}", row.entry.geom_id, row.entry.side.label());
        sink.push_value(&format!("constant.{cell}"), row.entry.constant);
        sink.push_value(&format!("half_beam_percent.{cell}"), row.percent_of_half_beam);
    }
    sink.push_value("total_sim_deposit", solution.total_sim_deposit);
    sink.push_value("total_sim_percent", solution.total_sim_percent);
    sink.push_value("rows_missing_reference", solution.missing_reference as f64);
    sink.push_value("rows_degenerate", solution.degenerate as f64);
}

pub fn push_calibrated_run<S: QaSink + ?Sized>(
    sink: &mut S,
    run: &CalibratedRun,
    sim: Option<&SimulationReference>,
) {
    for histogram in run.geom_energy.values().chain(run.geom_raw.values()) {
        sink.push(&histogram.name, histogram);
    }
    sink.push(&run.total_energy.name, &run.total_energy);
    sink.push(&run.total_raw.name, &run.total_raw);
    if let Some(scaled) = &run.scaled_total {
        sink.push(&scaled.name, scaled);
    }
    if let Some(scale) = run.beam_scale {
        sink.push_value("beam_scale", scale);
    }
    for summary in run.geom_summaries(sim) {
        let geom = summary.geom_id;
        sink.push_value(&format!("energy_mean.G{geom}"), summary.mean);
        sink.push_value(&format!("energy_resolution_percent.G{geom}"), summary.resolution_percent);
        if let Some(fit_mean) = summary.fit_mean {
            sink.push_value(&format!("energy_fit_mean.G{geom}"), fit_mean);
        }
        if let Some(raw_fit_mean) = summary.raw_fit_mean {
            sink.push_value(&format!("raw_adc_fit_mean.G{geom}"), raw_fit_mean);
        }
        if let Some(ratio) = summary.ratio_percent {
            sink.push_value(&format!("sim_ratio_percent.G{geom}"), ratio);
        }
    }
    if let Some(sim) = sim {
        push_simulation(sink, sim);
    }
    push_aggregation(sink, &run.aggregation);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qa").join("report.json");
        let mut report = JsonQaReport::default();
        let mut h = Histogram::new("hData_G7_R", 10, (0.0, 10.0));
        h.fill(3.0);
        report.push("hData_G7_R", &h);
        report.push_value("total_sim_percent", 12.5);
        push_summary(&mut report, &RunSummary {
            events_seen: 4,
            ..Default::default()
        });
        report.note("two channels fell back to unity".to_owned());
        report.write(&path).unwrap();

        let loaded = JsonQaReport::read(&path).unwrap();
        assert_eq!(loaded, report);
        assert_eq!(loaded.values["summary.events_seen"], 4.0);
    }
}
