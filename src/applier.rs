use std::collections::BTreeMap;
use std::path::Path;

use fnv::FnvHashMap;
use log::{info, warn};
use polars::prelude::*;
use serde::{Deserialize, Serialize};

use super::aggregator::{AggregationResult, AggregatorConfig, CellKey, EventAggregator};
use super::calibration_table::CalibrationTable;
use super::channel_map::{ChannelGeometryMap, ChannelKey, DetectorLayout};
use super::error::CalibError;
use super::event::Event;
use super::event_file::write_frame;
use super::gaussian::fit_peak;
use super::histogram::{Binning, Histogram};
use super::simulation::SimulationReference;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelConstant {
    pub value: f64,
    // false when the unity fallback was used
    pub from_table: bool,
}

/// Per-channel constants, rebuilt from a table through the geometry map.
#[derive(Debug, Clone, Default)]
pub struct ChannelCalibration {
    constants: FnvHashMap<ChannelKey, ChannelConstant>,
    missing: Vec<ChannelKey>,
}

impl ChannelCalibration {
    pub fn build(map: &ChannelGeometryMap, table: &CalibrationTable) -> ChannelCalibration {
        let mut calibration = ChannelCalibration::default();
        for (key, entry) in map.sorted_entries() {
            let constant = match table.get(&CellKey::new(entry.geom_id, entry.side)) {
                Some(row) => ChannelConstant {
                    value: row.constant,
                    from_table: true,
                },
                None => {
                    warn!(
                        "No calibration for {key} (GeomID {} side {}), using 1.0",
                        entry.geom_id,
                        entry.side.label()
                    );
                    calibration.missing.push(key);
                    ChannelConstant {
                        value: 1.0,
                        from_table: false,
                    }
                }
            };
            calibration.constants.insert(key, constant);
        }
        info!(
            "Built per-channel calibration for {} channels ({} without a table entry)",
            calibration.constants.len(),
            calibration.missing.len()
        );
        calibration
    }

    pub fn get(&self, key: &ChannelKey) -> Option<&ChannelConstant> {
        self.constants.get(key)
    }

    /// Channels that fell back to unity, in key order.
    pub fn missing(&self) -> &[ChannelKey] {
        &self.missing
    }

    pub fn len(&self) -> usize {
        self.constants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constants.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplierConfig {
    pub geom_binning: Binning,
    pub raw_binning: Binning,
    pub total_binning: Binning,
    pub raw_total_binning: Binning,
}

impl Default for ApplierConfig {
    fn default() -> Self {
        ApplierConfig {
            geom_binning: Binning::new(100, (0.0, 1000.0)),
            raw_binning: Binning::new(200, (0.0, 100_000.0)),
            total_binning: Binning::new(200, (0.0, 20_000.0)),
            raw_total_binning: Binning::new(200, (0.0, 1_000_000.0)),
        }
    }
}

/// Global normalization `beamMeV / sum of simulated means over one layer`.
pub fn beam_scale(
    beam_energy_mev: f64,
    sim: &SimulationReference,
    layer: u32,
    layout: &DetectorLayout,
) -> Option<f64> {
    let deposit = sim.layer_total(layer, layout);
    if deposit > 0.0 {
        let scale = beam_energy_mev / deposit;
        info!("Beam scale {scale:.4} ({beam_energy_mev} MeV over {deposit:.1} MeV simulated in layer {layer})");
        Some(scale)
    } else {
        warn!("No simulated deposit in layer {layer}, beam scale not applied");
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibratedEvent {
    pub event: u64,
    pub calibrated_energy: f64,
    pub raw_adc: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeomSummary {
    pub geom_id: u32,
    pub entries: u64,
    pub mean: f64,
    pub stdev: f64,
    pub resolution_percent: f64,
    // Gaussian peak fit, present above the minimum entry count
    pub fit_mean: Option<f64>,
    pub fit_sigma: Option<f64>,
    pub raw_mean: f64,
    pub raw_fit_mean: Option<f64>,
    pub sim_mean: Option<f64>,
    pub ratio_percent: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct CalibratedRun {
    pub aggregation: AggregationResult,
    // L+R calibrated energy per GeomID
    pub geom_energy: BTreeMap<u32, Histogram>,
    pub geom_raw: BTreeMap<u32, Histogram>,
    pub total_energy: Histogram,
    pub total_raw: Histogram,
    pub scaled_total: Option<Histogram>,
    pub beam_scale: Option<f64>,
    pub events: Vec<CalibratedEvent>,
}

impl CalibratedRun {
    pub fn geom_summaries(&self, sim: Option<&SimulationReference>) -> Vec<GeomSummary> {
        self.geom_energy
            .iter()
            .map(|(&geom_id, histogram)| {
                let (entries, mean, stdev) = histogram.get_statistics();
                let sim_mean = sim.and_then(|s| s.mean(geom_id));
                let fit = fit_peak(histogram);
                let raw = self.geom_raw.get(&geom_id);
                GeomSummary {
                    geom_id,
                    entries,
                    mean,
                    stdev,
                    resolution_percent: if mean > 0.0 { stdev / mean * 100.0 } else { 0.0 },
                    fit_mean: fit.map(|f| f.mean),
                    fit_sigma: fit.map(|f| f.sigma),
                    raw_mean: raw.map_or(0.0, |h| h.mean()),
                    raw_fit_mean: raw.and_then(fit_peak).map(|f| f.mean),
                    sim_mean,
                    ratio_percent: sim_mean.filter(|m| *m > 0.0).map(|m| mean / m * 100.0),
                }
            })
            .collect()
    }

    pub fn log(&self, sim: Option<&SimulationReference>) {
        for summary in self.geom_summaries(sim) {
            if let Some(fit_mean) = summary.fit_mean {
                info!(
                    "GeomID {:2}: E(fit)={:6.1} MeV (sigma={:5.1}) | ADC={:8.1} ADC(fit)={}",
                    summary.geom_id,
                    fit_mean,
                    summary.fit_sigma.unwrap_or(0.0),
                    summary.raw_mean,
                    summary
                        .raw_fit_mean
                        .map_or_else(|| "-".to_owned(), |m| format!("{m:.1}"))
                );
            }
            match (summary.sim_mean, summary.ratio_percent) {
                (Some(sim_mean), Some(ratio)) => info!(
                    "GeomID {:2}: E={:6.1} MeV (sigma={:5.1}, {:5.1}%) | Sim Edep={:6.1} MeV | Ratio={:5.1}%",
                    summary.geom_id, summary.mean, summary.stdev, summary.resolution_percent, sim_mean, ratio
                ),
                _ => info!(
                    "GeomID {:2}: E={:6.1} MeV (sigma={:5.1}, {:5.1}%)",
                    summary.geom_id, summary.mean, summary.stdev, summary.resolution_percent
                ),
            }
        }
        let (_, mean, stdev) = self.total_energy.get_statistics();
        info!("Total energy per event: mean = {mean:.1} MeV, sigma = {stdev:.1} MeV");
        if let Some(scaled) = &self.scaled_total {
            let (_, mean, stdev) = scaled.get_statistics();
            info!("Beam scaled total: mean = {mean:.1} MeV, sigma = {stdev:.1} MeV");
        }
        let zero = &self.aggregation.zero_constant_channels;
        if !zero.is_empty() {
            let list: Vec<String> = zero.iter().map(|k| k.to_string()).collect();
            warn!("Channels with a zero constant: {}", list.join(", "));
        }
    }

    pub fn to_frame(&self) -> Result<DataFrame, CalibError> {
        let event: Vec<i64> = self.events.iter().map(|e| e.event as i64).collect();
        let energy: Vec<f64> = self.events.iter().map(|e| e.calibrated_energy).collect();
        let raw: Vec<f64> = self.events.iter().map(|e| e.raw_adc).collect();
        Ok(df!(
            "event" => event,
            "calibrated_energy" => energy,
            "raw_adc" => raw
        )?)
    }

    pub fn write_events(&self, path: &Path) -> Result<(), CalibError> {
        let mut frame = self.to_frame()?;
        write_frame(&mut frame, path)
    }
}

/// Second pass: the aggregation step with every channel scaled by its constant.
#[derive(Debug)]
pub struct CalibrationApplier<'a> {
    aggregator: EventAggregator<'a>,
    config: &'a ApplierConfig,
    beam_scale: Option<f64>,
    next_event: u64,
    geom_energy: BTreeMap<u32, Histogram>,
    geom_raw: BTreeMap<u32, Histogram>,
    total_energy: Histogram,
    total_raw: Histogram,
    scaled_total: Option<Histogram>,
    events: Vec<CalibratedEvent>,
}

impl<'a> CalibrationApplier<'a> {
    pub fn new(
        map: &'a ChannelGeometryMap,
        aggregation: &'a AggregatorConfig,
        calibration: &'a ChannelCalibration,
        config: &'a ApplierConfig,
    ) -> CalibrationApplier<'a> {
        CalibrationApplier {
            aggregator: EventAggregator::new(map, aggregation).with_calibration(calibration),
            config,
            beam_scale: None,
            next_event: 0,
            geom_energy: BTreeMap::new(),
            geom_raw: BTreeMap::new(),
            total_energy: Histogram::with_binning("hTotalCal", &config.total_binning),
            total_raw: Histogram::with_binning("hTotalRawADC", &config.raw_total_binning),
            scaled_total: None,
            events: Vec::new(),
        }
    }

    pub fn with_beam_scale(mut self, scale: Option<f64>) -> CalibrationApplier<'a> {
        self.beam_scale = scale;
        self.scaled_total = scale
            .map(|_| Histogram::with_binning("hTotalScaled", &self.config.total_binning));
        self
    }

    pub fn push_event(&mut self, event: &Event) -> Option<CalibratedEvent> {
        let index = self.next_event;
        self.next_event += 1;

        let sums = self.aggregator.push_event(event)?;

        let mut geom_lr: BTreeMap<u32, f64> = BTreeMap::new();
        let mut calibrated_energy = 0.0;
        let mut raw_adc = 0.0;
        for (key, sum) in &sums {
            *geom_lr.entry(key.geom_id).or_insert(0.0) += sum.energy;
            calibrated_energy += sum.energy;
            raw_adc += sum.raw;

            let binning = &self.config.raw_binning;
            self.geom_raw
                .entry(key.geom_id)
                .or_insert_with(|| Histogram::with_binning(&format!("hRawADC_G{}", key.geom_id), binning))
                .fill(sum.raw);
        }

        for (geom_id, energy) in geom_lr {
            if energy > 0.0 {
                let binning = &self.config.geom_binning;
                self.geom_energy
                    .entry(geom_id)
                    .or_insert_with(|| Histogram::with_binning(&format!("hCal_G{geom_id}"), binning))
                    .fill(energy);
            }
        }

        self.total_energy.fill(calibrated_energy);
        self.total_raw.fill(raw_adc);
        if let (Some(scale), Some(scaled)) = (self.beam_scale, self.scaled_total.as_mut()) {
            scaled.fill(calibrated_energy * scale);
        }

        let calibrated = CalibratedEvent {
            event: index,
            calibrated_energy,
            raw_adc,
        };
        self.events.push(calibrated);
        Some(calibrated)
    }

    pub fn finish(self) -> CalibratedRun {
        CalibratedRun {
            aggregation: self.aggregator.finish(),
            geom_energy: self.geom_energy,
            geom_raw: self.geom_raw,
            total_energy: self.total_energy,
            total_raw: self.total_raw,
            scaled_total: self.scaled_total,
            beam_scale: self.beam_scale,
            events: self.events,
        }
    }
}
