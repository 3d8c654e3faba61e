use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Readout end of a tile. Persisted as 0 (Left) / 1 (Right).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn index(self) -> i32 {
        match self {
            Side::Left => 0,
            Side::Right => 1,
        }
    }

    pub fn from_index(index: i32) -> Option<Side> {
        match index {
            0 => Some(Side::Left),
            1 => Some(Side::Right),
            _ => None,
        }
    }

    pub fn label(self) -> char {
        match self {
            Side::Left => 'L',
            Side::Right => 'R',
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ChannelKey {
    pub module_id: u32,
    pub channel: u32,
}

impl ChannelKey {
    pub const fn new(module_id: u32, channel: u32) -> Self {
        ChannelKey { module_id, channel }
    }
}

impl std::fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MID {} CH {}", self.module_id, self.channel)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct GeometryCell {
    pub layer: u32,
    pub column: u32,
}

impl GeometryCell {
    pub const fn new(layer: u32, column: u32) -> Self {
        GeometryCell { layer, column }
    }

    /// 1-based GeomID, row-major by layer.
    pub const fn row_major_id(&self, columns_per_layer: u32) -> u32 {
        self.layer * columns_per_layer + self.column + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorLayout {
    pub layers: u32,
    pub columns_per_layer: u32,
    // Largest serial number a physical module can carry.
    pub module_count: u32,
}

impl Default for DetectorLayout {
    fn default() -> Self {
        DetectorLayout {
            layers: 4,
            columns_per_layer: 8,
            module_count: 33,
        }
    }
}

impl DetectorLayout {
    pub fn cell_count(&self) -> u32 {
        self.layers * self.columns_per_layer
    }

    pub fn contains(&self, cell: &GeometryCell) -> bool {
        cell.layer < self.layers && cell.column < self.columns_per_layer
    }

    /// Inverse of the row-major GeomID.
    pub fn cell_for_row_major(&self, geom_id: u32) -> Option<GeometryCell> {
        if geom_id == 0 || geom_id > self.cell_count() {
            return None;
        }
        let index = geom_id - 1;
        Some(GeometryCell::new(
            index / self.columns_per_layer,
            index % self.columns_per_layer,
        ))
    }
}

/// How a GeomID is derived from a mapped channel.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
pub enum GeomEncoding {
    /// `layer * columns_per_layer + column + 1`
    #[default]
    RowMajor,
    /// The legacy module serial number is the GeomID.
    ModuleNumber,
}

impl GeomEncoding {
    pub fn geom_id(&self, cell: &GeometryCell, module: u32, layout: &DetectorLayout) -> u32 {
        match self {
            GeomEncoding::RowMajor => cell.row_major_id(layout.columns_per_layer),
            GeomEncoding::ModuleNumber => module,
        }
    }

    pub fn max_geom_id(&self, layout: &DetectorLayout) -> u32 {
        match self {
            GeomEncoding::RowMajor => layout.cell_count(),
            GeomEncoding::ModuleNumber => layout.module_count,
        }
    }
}

/// Hardware wiring generation.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
pub enum MappingVariant {
    #[default]
    Current,
    Legacy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelGeometryEntry {
    pub side: Side,
    pub cell: GeometryCell,
    pub module: u32,
    pub geom_id: u32,
}

/// Row of a user supplied channel map file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMapEntry {
    pub module_id: u32,
    pub channel: u32,
    pub side: Side,
    pub column: u32,
    pub layer: u32,
    // Defaults to the row-major id of the cell when absent
    #[serde(default)]
    pub module: Option<u32>,
}

#[derive(Debug)]
pub enum ChannelMapError {
    IOError(std::io::Error),
    ParseError(serde_yaml::Error),
    GeomOutOfRange {
        key: ChannelKey,
        geom_id: u32,
        max: u32,
    },
    CellOutOfRange {
        key: ChannelKey,
        cell: GeometryCell,
    },
    Duplicate(ChannelKey),
}

impl From<std::io::Error> for ChannelMapError {
    fn from(e: std::io::Error) -> Self {
        ChannelMapError::IOError(e)
    }
}

impl From<serde_yaml::Error> for ChannelMapError {
    fn from(e: serde_yaml::Error) -> Self {
        ChannelMapError::ParseError(e)
    }
}

impl std::fmt::Display for ChannelMapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelMapError::IOError(x) => {
                write!(f, "Channel map had an error with the input file: {x}")
            }
            ChannelMapError::ParseError(x) => write!(
                f,
                "Channel map had an error parsing the channel map file: {x}"
            ),
            ChannelMapError::GeomOutOfRange { key, geom_id, max } => write!(
                f,
                "Channel map entry {key} resolves to GeomID {geom_id}, outside [1, {max}]"
            ),
            ChannelMapError::CellOutOfRange { key, cell } => write!(
                f,
                "Channel map entry {key} points at layer {} column {}, outside the detector",
                cell.layer, cell.column
            ),
            ChannelMapError::Duplicate(key) => {
                write!(f, "Channel map has more than one entry for {key}")
            }
        }
    }
}

impl std::error::Error for ChannelMapError {}

// (MID, CH) -> (side, module, column, layer)
const CURRENT_WIRING: [(u32, u32, Side, u32, u32, u32); 46] = [
    (41, 3, Side::Left, 6, 7, 0),
    (41, 4, Side::Right, 6, 7, 0),
    (41, 6, Side::Right, 26, 4, 0),
    (41, 7, Side::Right, 30, 4, 1),
    (41, 8, Side::Right, 29, 4, 2),
    (41, 10, Side::Right, 18, 5, 0),
    (41, 11, Side::Right, 17, 5, 1),
    (41, 12, Side::Right, 31, 5, 2),
    (41, 14, Side::Right, 27, 6, 0),
    (41, 15, Side::Right, 22, 6, 1),
    (41, 16, Side::Right, 28, 6, 2),
    (41, 18, Side::Right, 7, 7, 1),
    (41, 20, Side::Right, 15, 7, 2),
    (41, 22, Side::Left, 26, 4, 0),
    (41, 23, Side::Left, 30, 4, 1),
    (41, 24, Side::Left, 29, 4, 2),
    (41, 26, Side::Left, 18, 5, 0),
    (41, 27, Side::Left, 17, 5, 1),
    (41, 28, Side::Left, 31, 5, 2),
    (41, 30, Side::Left, 27, 6, 0),
    (41, 31, Side::Left, 22, 6, 1),
    (41, 32, Side::Left, 28, 6, 2),
    (42, 5, Side::Right, 14, 1, 0),
    (42, 6, Side::Right, 13, 1, 1),
    (42, 7, Side::Right, 21, 1, 2),
    (42, 8, Side::Right, 10, 1, 3),
    (42, 9, Side::Right, 4, 2, 0),
    (42, 10, Side::Right, 25, 2, 1),
    (42, 11, Side::Right, 23, 2, 2),
    (42, 12, Side::Right, 32, 2, 3),
    (42, 13, Side::Right, 11, 3, 0),
    (42, 14, Side::Right, 33, 3, 1),
    (42, 15, Side::Right, 20, 3, 2),
    (42, 16, Side::Right, 19, 3, 3),
    (42, 21, Side::Left, 14, 1, 0),
    (42, 22, Side::Left, 13, 1, 1),
    (42, 23, Side::Left, 21, 1, 2),
    (42, 24, Side::Left, 10, 1, 3),
    (42, 25, Side::Left, 4, 2, 0),
    (42, 26, Side::Left, 25, 2, 1),
    (42, 27, Side::Left, 23, 2, 2),
    (42, 28, Side::Left, 32, 2, 3),
    (42, 29, Side::Left, 11, 3, 0),
    (42, 30, Side::Left, 33, 3, 1),
    (42, 31, Side::Left, 20, 3, 2),
    (42, 32, Side::Left, 19, 3, 3),
];

// Channels 1..=32 in order -> (side, column, layer)
const LEGACY_WIRING_41: [(Side, u32, u32); 32] = [
    (Side::Left, 7, 0),
    (Side::Right, 7, 0),
    (Side::Left, 7, 1),
    (Side::Right, 7, 1),
    (Side::Right, 4, 0),
    (Side::Right, 4, 1),
    (Side::Right, 4, 2),
    (Side::Right, 4, 3),
    (Side::Right, 5, 0),
    (Side::Right, 5, 1),
    (Side::Right, 5, 2),
    (Side::Right, 5, 3),
    (Side::Right, 6, 0),
    (Side::Right, 6, 1),
    (Side::Right, 6, 2),
    (Side::Right, 6, 3),
    (Side::Left, 7, 2),
    (Side::Right, 7, 2),
    (Side::Left, 7, 3),
    (Side::Right, 7, 3),
    (Side::Left, 4, 0),
    (Side::Left, 4, 1),
    (Side::Left, 4, 2),
    (Side::Left, 4, 3),
    (Side::Left, 5, 0),
    (Side::Left, 5, 1),
    (Side::Left, 5, 2),
    (Side::Left, 5, 3),
    (Side::Left, 6, 0),
    (Side::Left, 6, 1),
    (Side::Left, 6, 2),
    (Side::Left, 6, 3),
];

const LEGACY_WIRING_42: [(Side, u32, u32); 32] = [
    (Side::Right, 0, 0),
    (Side::Right, 0, 1),
    (Side::Right, 0, 2),
    (Side::Right, 0, 3),
    (Side::Right, 1, 0),
    (Side::Right, 1, 1),
    (Side::Right, 1, 2),
    (Side::Right, 1, 3),
    (Side::Right, 2, 0),
    (Side::Right, 2, 1),
    (Side::Right, 2, 2),
    (Side::Right, 2, 3),
    (Side::Right, 3, 0),
    (Side::Right, 3, 1),
    (Side::Right, 3, 2),
    (Side::Right, 3, 3),
    (Side::Left, 0, 0),
    (Side::Left, 0, 1),
    (Side::Left, 0, 2),
    (Side::Left, 0, 3),
    (Side::Left, 1, 0),
    (Side::Left, 1, 1),
    (Side::Left, 1, 2),
    (Side::Left, 1, 3),
    (Side::Left, 2, 0),
    (Side::Left, 2, 1),
    (Side::Left, 2, 2),
    (Side::Left, 2, 3),
    (Side::Left, 3, 0),
    (Side::Left, 3, 1),
    (Side::Left, 3, 2),
    (Side::Left, 3, 3),
];

impl MappingVariant {
    pub fn entries(&self, layout: &DetectorLayout) -> Vec<ChannelMapEntry> {
        match self {
            MappingVariant::Current => CURRENT_WIRING
                .iter()
                .map(|&(module_id, channel, side, module, column, layer)| ChannelMapEntry {
                    module_id,
                    channel,
                    side,
                    column,
                    layer,
                    module: Some(module),
                })
                .collect(),
            MappingVariant::Legacy => [(41, &LEGACY_WIRING_41), (42, &LEGACY_WIRING_42)]
                .into_iter()
                .flat_map(|(module_id, wiring)| {
                    wiring
                        .iter()
                        .enumerate()
                        .map(move |(index, &(side, column, layer))| ChannelMapEntry {
                            module_id,
                            channel: index as u32 + 1,
                            side,
                            column,
                            layer,
                            // legacy boards were tagged with the row-major id directly
                            module: Some(
                                GeometryCell::new(layer, column)
                                    .row_major_id(layout.columns_per_layer),
                            ),
                        })
                })
                .collect(),
        }
    }
}

/// Immutable (MID, CH) -> geometry lookup. Built once per run and shared by reference.
#[derive(Debug, Clone)]
pub struct ChannelGeometryMap {
    map: FnvHashMap<ChannelKey, ChannelGeometryEntry>,
    encoding: GeomEncoding,
    layout: DetectorLayout,
}

impl ChannelGeometryMap {
    pub fn new(
        variant: MappingVariant,
        encoding: GeomEncoding,
        layout: DetectorLayout,
    ) -> Result<ChannelGeometryMap, ChannelMapError> {
        Self::from_entries(variant.entries(&layout), encoding, layout)
    }

    pub fn from_entries(
        entries: Vec<ChannelMapEntry>,
        encoding: GeomEncoding,
        layout: DetectorLayout,
    ) -> Result<ChannelGeometryMap, ChannelMapError> {
        let mut map = FnvHashMap::default();
        let max = encoding.max_geom_id(&layout);

        for entry in entries {
            let key = ChannelKey::new(entry.module_id, entry.channel);
            let cell = GeometryCell::new(entry.layer, entry.column);
            if !layout.contains(&cell) {
                return Err(ChannelMapError::CellOutOfRange { key, cell });
            }

            let module = entry
                .module
                .unwrap_or_else(|| cell.row_major_id(layout.columns_per_layer));
            let geom_id = encoding.geom_id(&cell, module, &layout);
            if geom_id == 0 || geom_id > max {
                return Err(ChannelMapError::GeomOutOfRange { key, geom_id, max });
            }

            let data = ChannelGeometryEntry {
                side: entry.side,
                cell,
                module,
                geom_id,
            };
            if map.insert(key, data).is_some() {
                return Err(ChannelMapError::Duplicate(key));
            }
        }

        log::info!(
            "Built channel map with {} entries ({:?} encoding)",
            map.len(),
            encoding
        );

        Ok(ChannelGeometryMap {
            map,
            encoding,
            layout,
        })
    }

    pub fn from_yaml_file(
        path: &Path,
        encoding: GeomEncoding,
        layout: DetectorLayout,
    ) -> Result<ChannelGeometryMap, ChannelMapError> {
        let reader = BufReader::new(File::open(path)?);
        let entries: Vec<ChannelMapEntry> = serde_yaml::from_reader(reader)?;
        Self::from_entries(entries, encoding, layout)
    }

    /// Unmapped channels are not an error; callers skip them.
    pub fn lookup(&self, key: &ChannelKey) -> Option<&ChannelGeometryEntry> {
        self.map.get(key)
    }

    pub fn encoding(&self) -> GeomEncoding {
        self.encoding
    }

    pub fn layout(&self) -> &DetectorLayout {
        &self.layout
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    // Sorted so that everything derived from the map is reproducible
    pub fn sorted_entries(&self) -> Vec<(ChannelKey, ChannelGeometryEntry)> {
        let mut entries: Vec<_> = self.map.iter().map(|(k, v)| (*k, *v)).collect();
        entries.sort_by_key(|(k, _)| *k);
        entries
    }
}
