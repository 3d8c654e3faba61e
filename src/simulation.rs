use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use super::channel_map::{DetectorLayout, GeometryCell};
use super::error::CalibError;
use super::histogram::Histogram;

pub const DEFAULT_PREFIX: &str = "Edep";

/// Named histogram source for the simulated energy deposits.
pub trait HistogramStore {
    fn histogram(&self, name: &str) -> Option<&Histogram>;
}

/// JSON document of `name -> {name, bins, range}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JsonHistogramStore {
    histograms: BTreeMap<String, Histogram>,
}

impl JsonHistogramStore {
    pub fn open(path: &Path) -> Result<JsonHistogramStore, CalibError> {
        let reader = BufReader::new(File::open(path)?);
        let store: JsonHistogramStore = serde_json::from_reader(reader)?;
        info!(
            "Loaded {} simulation histograms from {}",
            store.histograms.len(),
            path.display()
        );
        Ok(store)
    }

    pub fn insert(&mut self, histogram: Histogram) {
        self.histograms.insert(histogram.name.clone(), histogram);
    }

    pub fn len(&self) -> usize {
        self.histograms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histograms.is_empty()
    }

    pub fn write(&self, path: &Path) -> Result<(), CalibError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }
}

impl FromIterator<Histogram> for JsonHistogramStore {
    fn from_iter<I: IntoIterator<Item = Histogram>>(iter: I) -> Self {
        let mut store = JsonHistogramStore::default();
        for histogram in iter {
            store.insert(histogram);
        }
        store
    }
}

impl HistogramStore for JsonHistogramStore {
    fn histogram(&self, name: &str) -> Option<&Histogram> {
        self.histograms.get(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedCell {
    pub mean: f64,
    pub distribution: Histogram,
}

/// Simulated deposit per row-major GeomID. Missing cells are absent, never zero.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimulationReference {
    cells: BTreeMap<u32, SimulatedCell>,
}

pub fn histogram_name(prefix: &str, geom_id: u32) -> String {
    format!("{prefix}_M{geom_id}")
}

impl SimulationReference {
    fn load_cells<S, I>(store: &S, prefix: &str, cells: I, layout: &DetectorLayout) -> SimulationReference
    where
        S: HistogramStore + ?Sized,
        I: IntoIterator<Item = GeometryCell>,
    {
        let mut reference = SimulationReference::default();
        for cell in cells {
            let geom_id = cell.row_major_id(layout.columns_per_layer);
            let name = histogram_name(prefix, geom_id);
            match store.histogram(&name) {
                Some(histogram) => {
                    reference.cells.insert(
                        geom_id,
                        SimulatedCell {
                            mean: histogram.mean(),
                            distribution: histogram.clone(),
                        },
                    );
                }
                None => warn!("Simulation histogram {name} not found, GeomID {geom_id} has no reference"),
            }
        }
        reference
    }

    /// One entry per column of `reference_layer`.
    pub fn load<S>(store: &S, prefix: &str, reference_layer: u32, layout: &DetectorLayout) -> SimulationReference
    where
        S: HistogramStore + ?Sized,
    {
        let cells = (0..layout.columns_per_layer).map(|column| GeometryCell::new(reference_layer, column));
        let reference = Self::load_cells(store, prefix, cells, layout);
        info!(
            "Loaded simulation reference for layer {reference_layer}: {}/{} columns",
            reference.len(),
            layout.columns_per_layer
        );
        reference
    }

    /// Every cell of the layers below `max_layers`, for comparing calibrated data layer by layer.
    pub fn load_layers<S>(store: &S, prefix: &str, max_layers: u32, layout: &DetectorLayout) -> SimulationReference
    where
        S: HistogramStore + ?Sized,
    {
        let layers = max_layers.min(layout.layers);
        let columns = layout.columns_per_layer;
        let cells = (0..layers).flat_map(|layer| (0..columns).map(move |column| GeometryCell::new(layer, column)));
        Self::load_cells(store, prefix, cells, layout)
    }

    pub fn get(&self, geom_id: u32) -> Option<&SimulatedCell> {
        self.cells.get(&geom_id)
    }

    pub fn mean(&self, geom_id: u32) -> Option<f64> {
        self.cells.get(&geom_id).map(|c| c.mean)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u32, &SimulatedCell)> {
        self.cells.iter()
    }

    /// Sum of the means of every loaded cell.
    pub fn total_mean(&self) -> f64 {
        self.cells.values().map(|c| c.mean).sum()
    }

    /// Sum of the means over the columns of one layer.
    pub fn layer_total(&self, layer: u32, layout: &DetectorLayout) -> f64 {
        (0..layout.columns_per_layer)
            .filter_map(|column| self.mean(GeometryCell::new(layer, column).row_major_id(layout.columns_per_layer)))
            .sum()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}
