use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use log::info;
use serde::{Deserialize, Serialize};

use super::aggregator::{AggregatorConfig, LayerFilter};
use super::applier::ApplierConfig;
use super::channel_map::{ChannelGeometryMap, DetectorLayout, GeomEncoding, MappingVariant};
use super::error::CalibError;
use super::histogram::Binning;
use super::selection::EventSelection;
use super::simulation::DEFAULT_PREFIX;
use super::solver::SolverConfig;
use super::waveform::IntegrationParams;

/// Run configuration, read from YAML. Every field has a default so a partial file is enough.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibConfig {
    pub layout: DetectorLayout,
    pub mapping: MappingVariant,
    pub encoding: GeomEncoding,
    // overrides `mapping` when set
    pub channel_map_file: Option<PathBuf>,
    pub readout_boards: Vec<u32>,
    pub expected_channel_count: usize,
    pub integration: IntegrationParams,
    pub target_layer: u32,
    pub max_layers: u32,
    pub solver: SolverConfig,
    pub simulation_prefix: String,
    pub data_binning: Binning,
    pub qa_binning: Binning,
    pub applier: ApplierConfig,
    pub beam_normalization: bool,
    pub selection: EventSelection,
    pub parallel: bool,
}

impl Default for CalibConfig {
    fn default() -> Self {
        CalibConfig {
            layout: DetectorLayout::default(),
            mapping: MappingVariant::Current,
            encoding: GeomEncoding::RowMajor,
            channel_map_file: None,
            readout_boards: vec![41, 42],
            expected_channel_count: 92,
            integration: IntegrationParams::default(),
            target_layer: 1,
            max_layers: 4,
            solver: SolverConfig::default(),
            simulation_prefix: DEFAULT_PREFIX.to_owned(),
            data_binning: Binning::new(100, (0.0, 100_000.0)),
            qa_binning: Binning::new(100, (0.0, 70_000.0)),
            applier: ApplierConfig::default(),
            beam_normalization: false,
            selection: EventSelection::default(),
            parallel: false,
        }
    }
}

impl CalibConfig {
    pub fn load(path: &Path) -> Result<CalibConfig, CalibError> {
        let reader = BufReader::new(File::open(path)?);
        let config: CalibConfig = serde_yaml::from_reader(reader)?;
        info!("Loaded configuration from {}", path.display());
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CalibError> {
        if self.layout.layers == 0 || self.layout.columns_per_layer == 0 {
            return Err(CalibError::Config(
                "layout needs at least one layer and one column".to_owned(),
            ));
        }
        if self.target_layer >= self.layout.layers {
            return Err(CalibError::Config(format!(
                "target layer {} is outside the {} layer detector",
                self.target_layer, self.layout.layers
            )));
        }
        if self.solver.reference_layer >= self.layout.layers {
            return Err(CalibError::Config(format!(
                "reference layer {} is outside the {} layer detector",
                self.solver.reference_layer, self.layout.layers
            )));
        }
        if self.integration.stride == 0 {
            return Err(CalibError::Config("stride must be at least 1".to_owned()));
        }
        for (name, binning) in [
            ("data_binning", &self.data_binning),
            ("qa_binning", &self.qa_binning),
            ("applier.geom_binning", &self.applier.geom_binning),
            ("applier.raw_binning", &self.applier.raw_binning),
            ("applier.total_binning", &self.applier.total_binning),
            ("applier.raw_total_binning", &self.applier.raw_total_binning),
        ] {
            if binning.bins == 0 || binning.range.1 <= binning.range.0 {
                return Err(CalibError::Config(format!(
                    "{name} needs at least one bin over a non-empty range"
                )));
            }
        }
        Ok(())
    }

    pub fn channel_map(&self) -> Result<ChannelGeometryMap, CalibError> {
        let map = match &self.channel_map_file {
            Some(path) => ChannelGeometryMap::from_yaml_file(path, self.encoding, self.layout)?,
            None => ChannelGeometryMap::new(self.mapping, self.encoding, self.layout)?,
        };
        Ok(map)
    }

    fn aggregator(&self, layers: LayerFilter, binning: Binning, prefix: &str) -> AggregatorConfig {
        AggregatorConfig {
            readout_boards: self.readout_boards.clone(),
            expected_channel_count: self.expected_channel_count,
            layers,
            integration: self.integration,
            binning,
            histogram_prefix: prefix.to_owned(),
        }
    }

    /// Derivation pass over the target layer.
    pub fn calibration_aggregator(&self) -> AggregatorConfig {
        self.aggregator(
            LayerFilter::Only(self.target_layer),
            self.data_binning,
            "hData",
        )
    }

    /// Application pass over every layer below `max_layers`.
    pub fn applier_aggregator(&self) -> AggregatorConfig {
        self.aggregator(
            LayerFilter::Below(self.max_layers),
            self.applier.geom_binning,
            "hCalib",
        )
    }

    pub fn qa_aggregator(&self) -> AggregatorConfig {
        self.aggregator(
            LayerFilter::Only(self.target_layer),
            self.qa_binning,
            "hIntADC",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waveform::WindowStrategy;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = "
target_layer: 2
mapping: Legacy
integration:
  window:
    kind: InterChannelGap
  stride: 1
solver:
  beam_energy_gev: 5.0
";
        let config: CalibConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.target_layer, 2);
        assert_eq!(config.mapping, MappingVariant::Legacy);
        assert_eq!(config.integration.window, WindowStrategy::InterChannelGap);
        assert_eq!(config.integration.threshold, 0.0);
        assert_eq!(config.solver.reference_layer, 1);
        assert_eq!(config.solver.beam_energy_gev, 5.0);
        assert_eq!(config.expected_channel_count, 92);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_fixed_offset_window_from_yaml() {
        let yaml = "
integration:
  window:
    kind: FixedOffset
    offset: 50
    length: 150
";
        let config: CalibConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            config.integration.window,
            WindowStrategy::FixedOffset {
                offset: 50,
                length: 150
            }
        );
        assert_eq!(config.integration.stride, 2);

        let config: CalibConfig =
            serde_yaml::from_str("integration: {window: {kind: InterChannelGap}}").unwrap();
        assert_eq!(config.integration.window, WindowStrategy::InterChannelGap);
    }

    #[test]
    fn test_validation() {
        let config = CalibConfig {
            target_layer: 4,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(CalibError::Config(_))));

        let mut config = CalibConfig::default();
        config.integration.stride = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pass_configs() {
        let config = CalibConfig::default();
        assert_eq!(config.calibration_aggregator().layers, LayerFilter::Only(1));
        assert_eq!(config.applier_aggregator().layers, LayerFilter::Below(4));
        assert_eq!(config.applier_aggregator().binning.range, (0.0, 1000.0));
        assert_eq!(config.channel_map().unwrap().len(), 46);
    }
}
