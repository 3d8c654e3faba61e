use std::collections::{BTreeMap, BTreeSet};

use fnv::FnvHashSet;
use log::{info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::applier::ChannelCalibration;
use super::channel_map::{ChannelGeometryMap, ChannelKey, GeometryCell, Side};
use super::event::Event;
use super::histogram::{Binning, Histogram};
use super::waveform::IntegrationParams;

// Events per rayon shard
const SHARD_EVENTS: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellKey {
    pub geom_id: u32,
    pub side: Side,
}

impl CellKey {
    pub const fn new(geom_id: u32, side: Side) -> Self {
        CellKey { geom_id, side }
    }
}

/// Which layers contribute to a pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerFilter {
    #[default]
    All,
    Only(u32),
    Below(u32),
}

impl LayerFilter {
    pub fn accepts(&self, layer: u32) -> bool {
        match self {
            LayerFilter::All => true,
            LayerFilter::Only(target) => layer == *target,
            LayerFilter::Below(max_layers) => layer < *max_layers,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatorConfig {
    pub readout_boards: Vec<u32>,
    pub expected_channel_count: usize,
    pub layers: LayerFilter,
    pub integration: IntegrationParams,
    pub binning: Binning,
    pub histogram_prefix: String,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        AggregatorConfig {
            readout_boards: vec![41, 42],
            expected_channel_count: 92,
            layers: LayerFilter::All,
            integration: IntegrationParams::default(),
            binning: Binning::new(100, (0.0, 100_000.0)),
            histogram_prefix: "hData".to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CellAccumulator {
    pub cell: GeometryCell,
    pub sum: f64,
    pub count: u64,
    pub histogram: Histogram,
}

impl CellAccumulator {
    /// Cells are only created on their first contribution, so count > 0.
    pub fn mean(&self) -> f64 {
        self.sum / self.count as f64
    }

    fn merge(&mut self, other: &CellAccumulator) {
        self.sum += other.sum;
        self.count += other.count;
        self.histogram.add(&other.histogram);
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PerCellAccumulator {
    cells: BTreeMap<CellKey, CellAccumulator>,
}

impl PerCellAccumulator {
    pub fn get(&self, key: &CellKey) -> Option<&CellAccumulator> {
        self.cells.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CellKey, &CellAccumulator)> {
        self.cells.iter()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Commits one event's value for one cell.
    pub fn commit(&mut self, key: CellKey, cell: GeometryCell, value: f64, binning: &Binning, prefix: &str) {
        let acc = self.cells.entry(key).or_insert_with(|| CellAccumulator {
            cell,
            sum: 0.0,
            count: 0,
            histogram: Histogram::with_binning(
                &format!("{prefix}_G{}_{}", key.geom_id, key.side.label()),
                binning,
            ),
        });
        acc.sum += value;
        acc.count += 1;
        acc.histogram.fill(value);
    }

    pub fn merge(&mut self, other: PerCellAccumulator) {
        for (key, acc) in other.cells {
            match self.cells.get_mut(&key) {
                Some(existing) => existing.merge(&acc),
                None => {
                    self.cells.insert(key, acc);
                }
            }
        }
    }
}

/// Counters for every recoverable condition met during a pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub events_seen: u64,
    pub events_accepted: u64,
    pub events_incomplete: u64,
    pub channels_malformed: u64,
    pub channels_foreign_board: u64,
    pub channels_unmapped: u64,
    pub channels_outside_layer: u64,
    pub channels_missing_offset: u64,
    pub channels_below_threshold: u64,
    pub channels_integrated: u64,
    pub channels_uncalibrated: u64,
    pub hits_zero_constant: u64,
}

impl RunSummary {
    pub fn merge(&mut self, other: &RunSummary) {
        self.events_seen += other.events_seen;
        self.events_accepted += other.events_accepted;
        self.events_incomplete += other.events_incomplete;
        self.channels_malformed += other.channels_malformed;
        self.channels_foreign_board += other.channels_foreign_board;
        self.channels_unmapped += other.channels_unmapped;
        self.channels_outside_layer += other.channels_outside_layer;
        self.channels_missing_offset += other.channels_missing_offset;
        self.channels_below_threshold += other.channels_below_threshold;
        self.channels_integrated += other.channels_integrated;
        self.channels_uncalibrated += other.channels_uncalibrated;
        self.hits_zero_constant += other.hits_zero_constant;
    }

    pub fn log(&self) {
        info!(
            "Events: {} seen, {} accepted, {} skipped as incomplete",
            self.events_seen, self.events_accepted, self.events_incomplete
        );
        info!(
            "Channels: {} integrated, {} below threshold, {} unmapped, {} missing waveform offset, {} outside layer selection, {} on other boards",
            self.channels_integrated,
            self.channels_below_threshold,
            self.channels_unmapped,
            self.channels_missing_offset,
            self.channels_outside_layer,
            self.channels_foreign_board
        );
        if self.channels_malformed > 0 {
            warn!(
                "{} hits had a null or out of range MID / ch and were skipped",
                self.channels_malformed
            );
        }
        if self.channels_uncalibrated > 0 {
            warn!(
                "{} hits used the unity constant (no calibration entry)",
                self.channels_uncalibrated
            );
        }
        if self.hits_zero_constant > 0 {
            warn!(
                "{} hits landed on channels with a zero calibration constant",
                self.hits_zero_constant
            );
        }
    }
}

/// Per-event sum of one (GeomID, side) before it is committed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellSum {
    pub cell: GeometryCell,
    pub raw: f64,
    pub energy: f64,
}

pub type EventSums = BTreeMap<CellKey, CellSum>;

#[derive(Debug, Clone, Default)]
pub struct AggregationResult {
    pub cells: PerCellAccumulator,
    pub summary: RunSummary,
    pub unmapped_channels: BTreeSet<ChannelKey>,
    pub zero_constant_channels: BTreeSet<ChannelKey>,
}

impl AggregationResult {
    pub fn merge(&mut self, other: AggregationResult) {
        self.cells.merge(other.cells);
        self.summary.merge(&other.summary);
        self.unmapped_channels.extend(other.unmapped_channels);
        self.zero_constant_channels.extend(other.zero_constant_channels);
    }
}

/// One-pass aggregation of integrated charge per (GeomID, side).
#[derive(Debug)]
pub struct EventAggregator<'a> {
    map: &'a ChannelGeometryMap,
    config: &'a AggregatorConfig,
    calibration: Option<&'a ChannelCalibration>,
    cells: PerCellAccumulator,
    summary: RunSummary,
    unmapped: FnvHashSet<ChannelKey>,
    zero_constant: BTreeSet<ChannelKey>,
}

impl<'a> EventAggregator<'a> {
    pub fn new(map: &'a ChannelGeometryMap, config: &'a AggregatorConfig) -> EventAggregator<'a> {
        EventAggregator {
            map,
            config,
            calibration: None,
            cells: PerCellAccumulator::default(),
            summary: RunSummary::default(),
            unmapped: FnvHashSet::default(),
            zero_constant: BTreeSet::new(),
        }
    }

    /// Every integrated value is multiplied by its channel constant before it is summed.
    pub fn with_calibration(mut self, calibration: &'a ChannelCalibration) -> EventAggregator<'a> {
        self.calibration = Some(calibration);
        self
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    pub fn cells(&self) -> &PerCellAccumulator {
        &self.cells
    }

    fn note_unmapped(&mut self, key: ChannelKey) {
        self.summary.channels_unmapped += 1;
        if self.unmapped.insert(key) {
            info!("No geometry mapping for {key}, channel is excluded");
        }
    }

    fn constant_for(&mut self, key: &ChannelKey) -> f64 {
        let Some(calibration) = self.calibration else {
            return 1.0;
        };
        match calibration.get(key) {
            Some(constant) => {
                if !constant.from_table {
                    self.summary.channels_uncalibrated += 1;
                }
                if constant.value == 0.0 {
                    self.summary.hits_zero_constant += 1;
                    self.zero_constant.insert(*key);
                }
                constant.value
            }
            None => {
                self.summary.channels_uncalibrated += 1;
                1.0
            }
        }
    }

    /// Integrates one event without committing it. None if the event is incomplete.
    pub fn integrate_event(&mut self, event: &Event) -> Option<EventSums> {
        self.summary.events_seen += 1;
        if !event.is_complete(self.config.expected_channel_count) {
            self.summary.events_incomplete += 1;
            return None;
        }
        self.summary.events_accepted += 1;

        let mut sums = EventSums::new();
        for (index, key) in event.channel_keys() {
            if event.is_malformed(index) {
                self.summary.channels_malformed += 1;
                continue;
            }
            if !self.config.readout_boards.contains(&key.module_id) {
                self.summary.channels_foreign_board += 1;
                continue;
            }

            let Some(entry) = self.map.lookup(&key).copied() else {
                self.note_unmapped(key);
                continue;
            };

            if !self.config.layers.accepts(entry.cell.layer) {
                self.summary.channels_outside_layer += 1;
                continue;
            }

            let value = match self.config.integration.integrate_channel(
                &event.samples,
                &event.waveform_offsets,
                index,
            ) {
                None => {
                    warn!(
                        "No waveform offset for channel index {index} (size={}), skipping {key}",
                        event.waveform_offsets.len()
                    );
                    self.summary.channels_missing_offset += 1;
                    continue;
                }
                Some(None) => {
                    self.summary.channels_below_threshold += 1;
                    continue;
                }
                Some(Some(value)) => value,
            };
            self.summary.channels_integrated += 1;

            let constant = self.constant_for(&key);
            let slot = sums
                .entry(CellKey::new(entry.geom_id, entry.side))
                .or_insert(CellSum {
                    cell: entry.cell,
                    raw: 0.0,
                    energy: 0.0,
                });
            slot.raw += value;
            slot.energy += value * constant;
        }

        Some(sums)
    }

    pub fn commit(&mut self, sums: &EventSums) {
        for (key, sum) in sums {
            self.cells.commit(
                *key,
                sum.cell,
                sum.energy,
                &self.config.binning,
                &self.config.histogram_prefix,
            );
        }
    }

    /// Integrates and commits one event, handing back what was committed.
    pub fn push_event(&mut self, event: &Event) -> Option<EventSums> {
        let sums = self.integrate_event(event)?;
        self.commit(&sums);
        Some(sums)
    }

    pub fn finish(self) -> AggregationResult {
        AggregationResult {
            cells: self.cells,
            summary: self.summary,
            unmapped_channels: self.unmapped.into_iter().collect(),
            zero_constant_channels: self.zero_constant,
        }
    }
}

/// Sharded version of the sequential pass; shards are merged by summation.
pub fn aggregate_parallel(
    map: &ChannelGeometryMap,
    config: &AggregatorConfig,
    calibration: Option<&ChannelCalibration>,
    events: &[Event],
) -> AggregationResult {
    events
        .par_chunks(SHARD_EVENTS)
        .map(|shard| {
            let mut aggregator = EventAggregator::new(map, config);
            if let Some(calibration) = calibration {
                aggregator = aggregator.with_calibration(calibration);
            }
            for event in shard {
                aggregator.push_event(event);
            }
            aggregator.finish()
        })
        .reduce(AggregationResult::default, |mut a, b| {
            a.merge(b);
            a
        })
}
