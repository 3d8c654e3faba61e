use log::{info, warn};
use serde::{Deserialize, Serialize};

use super::aggregator::PerCellAccumulator;
use super::calibration_table::{CalibrationEntry, CalibrationTable};
use super::channel_map::{DetectorLayout, GeometryCell};
use super::simulation::SimulationReference;

// one readout side sees half of the tile's deposit
pub const HALF_ENERGY_FACTOR: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub reference_layer: u32,
    pub beam_energy_gev: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        SolverConfig {
            reference_layer: 1,
            beam_energy_gev: 3.0,
        }
    }
}

impl SolverConfig {
    pub fn beam_energy_mev(&self) -> f64 {
        self.beam_energy_gev * 1000.0
    }
}

/// One solved row together with the numbers that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolvedRow {
    pub entry: CalibrationEntry,
    pub data_mean: f64,
    pub reference_geom_id: u32,
    // None when the reference column had no simulation histogram
    pub sim_half: Option<f64>,
    pub percent_of_half_beam: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibrationSolution {
    pub table: CalibrationTable,
    pub rows: Vec<SolvedRow>,
    pub missing_reference: u64,
    pub degenerate: u64,
    pub total_sim_deposit: f64,
    pub total_sim_percent: f64,
}

impl CalibrationSolution {
    pub fn log(&self) {
        info!("GeomID Side   mean_data   sim_half (% of half beam)   CalibConst  (simGeom)");
        for row in &self.rows {
            info!(
                "  {:2}    {}   {:10.3} {:10.3} ({:.1}%)   {:10.5}  ({})",
                row.entry.geom_id,
                row.entry.side.label(),
                row.data_mean,
                row.sim_half.unwrap_or(0.0),
                row.percent_of_half_beam,
                row.entry.constant,
                row.reference_geom_id
            );
        }
        info!(
            "Total sim Edep: {:.1} MeV = {:.2}% of beam energy",
            self.total_sim_deposit, self.total_sim_percent
        );
        if self.missing_reference > 0 || self.degenerate > 0 {
            warn!(
                "{} rows had no simulation reference, {} rows were written with the 0 sentinel",
                self.missing_reference, self.degenerate
            );
        }
    }
}

/// GeomID of the simulated cell in the same column as `cell`.
pub fn reference_geom_id(cell: &GeometryCell, reference_layer: u32, layout: &DetectorLayout) -> u32 {
    GeometryCell::new(reference_layer, cell.column).row_major_id(layout.columns_per_layer)
}

fn percent_of_half_beam(sim_half: f64, config: &SolverConfig) -> f64 {
    let half_beam = config.beam_energy_mev() * HALF_ENERGY_FACTOR;
    if half_beam > 0.0 {
        sim_half / half_beam * 100.0
    } else {
        0.0
    }
}

/// Derives constant = simMean(reference column) * 0.5 / dataMean for every accumulated cell.
pub fn solve(
    cells: &PerCellAccumulator,
    sim: &SimulationReference,
    layout: &DetectorLayout,
    config: &SolverConfig,
) -> CalibrationSolution {
    let mut solution = CalibrationSolution::default();

    // accumulator iterates in (GeomID, side) order
    for (key, acc) in cells.iter() {
        let data_mean = acc.mean();
        let reference = reference_geom_id(&acc.cell, config.reference_layer, layout);
        let sim_half = sim.mean(reference).map(|mean| mean * HALF_ENERGY_FACTOR);

        let constant = match sim_half {
            None => {
                warn!(
                    "No simulation reference (GeomID {reference}) for GeomID {} side {}",
                    key.geom_id,
                    key.side.label()
                );
                solution.missing_reference += 1;
                solution.degenerate += 1;
                0.0
            }
            Some(_) if data_mean <= 0.0 => {
                warn!(
                    "Data mean {data_mean} for GeomID {} side {} is not positive",
                    key.geom_id,
                    key.side.label()
                );
                solution.degenerate += 1;
                0.0
            }
            Some(half) => half / data_mean,
        };

        let entry = CalibrationEntry::new(key.geom_id, key.side, constant);
        solution.table.insert(entry);
        solution.rows.push(SolvedRow {
            entry,
            data_mean,
            reference_geom_id: reference,
            sim_half,
            percent_of_half_beam: percent_of_half_beam(sim_half.unwrap_or(0.0), config),
        });
    }

    solution.total_sim_deposit = sim.total_mean();
    let beam = config.beam_energy_mev();
    solution.total_sim_percent = if beam > 0.0 {
        solution.total_sim_deposit / beam * 100.0
    } else {
        0.0
    };
    solution
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::CellKey;
    use crate::channel_map::Side;
    use crate::histogram::{Binning, Histogram};
    use crate::simulation::{JsonHistogramStore, histogram_name};

    const BINNING: Binning = Binning::new(100, (0.0, 100_000.0));

    fn sim_with(geom_id: u32, value: f64) -> SimulationReference {
        let mut h = Histogram::new(&histogram_name("Edep", geom_id), 100, (0.0, 1000.0));
        h.fill(value);
        let store: JsonHistogramStore = std::iter::once(h).collect();
        SimulationReference::load(&store, "Edep", 1, &DetectorLayout::default())
    }

    fn cells_with(key: CellKey, cell: GeometryCell, values: &[f64]) -> PerCellAccumulator {
        let mut cells = PerCellAccumulator::default();
        for &v in values {
            cells.commit(key, cell, v, &BINNING, "hData");
        }
        cells
    }

    #[test]
    fn test_constant_uses_half_of_reference_mean() {
        // layer 0 column 6 takes the reference from layer 1 column 6, GeomID 15
        let sim = sim_with(15, 395.0);
        let cells = cells_with(
            CellKey::new(7, Side::Right),
            GeometryCell::new(0, 6),
            &[220.0, 220.0],
        );
        let solution = solve(&cells, &sim, &DetectorLayout::default(), &SolverConfig::default());

        assert_eq!(solution.rows.len(), 1);
        let row = solution.rows[0];
        assert_eq!(row.reference_geom_id, 15);
        assert_eq!(row.data_mean, 220.0);
        assert_eq!(row.sim_half, Some(197.5));
        assert!((row.entry.constant - 197.5 / 220.0).abs() < 1e-12);
        assert!(row.entry.valid);
        // 197.5 of a 1500 MeV half beam
        assert!((row.percent_of_half_beam - 197.5 / 1500.0 * 100.0).abs() < 1e-9);
        assert!((solution.total_sim_percent - 395.0 / 3000.0 * 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_missing_reference_gives_sentinel() {
        let sim = sim_with(15, 395.0);
        let cells = cells_with(
            CellKey::new(1, Side::Left),
            GeometryCell::new(0, 0),
            &[100.0],
        );
        let solution = solve(&cells, &sim, &DetectorLayout::default(), &SolverConfig::default());
        let entry = solution.table.get(&CellKey::new(1, Side::Left)).unwrap();
        assert_eq!(entry.constant, 0.0);
        assert!(!entry.valid);
        assert_eq!(solution.missing_reference, 1);
        assert_eq!(solution.rows[0].sim_half, None);
    }

    #[test]
    fn test_non_positive_mean_gives_sentinel() {
        let sim = sim_with(15, 395.0);
        let cells = cells_with(
            CellKey::new(7, Side::Left),
            GeometryCell::new(0, 6),
            &[0.0, 0.0],
        );
        let solution = solve(&cells, &sim, &DetectorLayout::default(), &SolverConfig::default());
        assert_eq!(solution.table.constant(7, Side::Left), Some(0.0));
        assert_eq!(solution.degenerate, 1);
        assert_eq!(solution.missing_reference, 0);
    }

    #[test]
    fn test_solver_is_deterministic() {
        let sim = sim_with(15, 395.0);
        let mut cells = cells_with(
            CellKey::new(7, Side::Right),
            GeometryCell::new(0, 6),
            &[220.0, 180.0],
        );
        cells.merge(cells_with(
            CellKey::new(7, Side::Left),
            GeometryCell::new(0, 6),
            &[210.0],
        ));
        let layout = DetectorLayout::default();
        let config = SolverConfig::default();
        let first = solve(&cells, &sim, &layout, &config);
        let second = solve(&cells, &sim, &layout, &config);
        assert_eq!(first, second);
        assert_eq!(first.rows[0].entry.side, Side::Left);
    }
}
