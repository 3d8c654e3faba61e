use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use log::{info, warn};
use polars::prelude::*;
use serde::{Deserialize, Serialize};

use super::aggregator::CellKey;
use super::channel_map::Side;
use super::error::CalibError;
use super::event_file::write_frame;

pub const GEOM_COLUMN: &str = "GeomID";
pub const SIDE_COLUMN: &str = "Side";
pub const CONSTANT_COLUMN: &str = "CalibConst";

const TEXT_HEADER: &str = "#GeomID,Side,CalibConst";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationEntry {
    pub geom_id: u32,
    pub side: Side,
    pub constant: f64,
    // false for the 0.0 sentinel of a degenerate derivation
    pub valid: bool,
}

impl CalibrationEntry {
    pub fn new(geom_id: u32, side: Side, constant: f64) -> Self {
        CalibrationEntry {
            geom_id,
            side,
            constant,
            valid: constant.is_finite() && constant != 0.0,
        }
    }

    pub fn key(&self) -> CellKey {
        CellKey::new(self.geom_id, self.side)
    }
}

/// (GeomID, side) -> constant, always iterated in (GeomID, side) order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibrationTable {
    entries: BTreeMap<CellKey, CalibrationEntry>,
}

impl CalibrationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entry that was replaced, if any.
    pub fn insert(&mut self, entry: CalibrationEntry) -> Option<CalibrationEntry> {
        self.entries.insert(entry.key(), entry)
    }

    pub fn get(&self, key: &CellKey) -> Option<&CalibrationEntry> {
        self.entries.get(key)
    }

    pub fn constant(&self, geom_id: u32, side: Side) -> Option<f64> {
        self.get(&CellKey::new(geom_id, side)).map(|e| e.constant)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CalibrationEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn invalid_count(&self) -> usize {
        self.entries.values().filter(|e| !e.valid).count()
    }

    /// Folds `other` in. Keys already present are overwritten by `other`.
    pub fn merge(&mut self, other: CalibrationTable) {
        for (key, entry) in other.entries {
            if let Some(previous) = self.entries.insert(key, entry) {
                warn!(
                    "Calibration for GeomID {} side {} given twice ({} then {}), keeping the later one",
                    key.geom_id,
                    key.side.label(),
                    previous.constant,
                    entry.constant
                );
            }
        }
    }

    pub fn to_frame(&self) -> Result<DataFrame, CalibError> {
        let geom_ids: Vec<i32> = self.iter().map(|e| e.geom_id as i32).collect();
        let sides: Vec<i32> = self.iter().map(|e| e.side.index()).collect();
        let constants: Vec<f64> = self.iter().map(|e| e.constant).collect();
        Ok(df!(
            GEOM_COLUMN => geom_ids,
            SIDE_COLUMN => sides,
            CONSTANT_COLUMN => constants
        )?)
    }

    pub fn from_frame(frame: &DataFrame) -> Result<CalibrationTable, CalibError> {
        let column = |name: &str| {
            frame
                .column(name)
                .map_err(|_| CalibError::MissingColumn(name.to_owned()))
        };
        let geom_ids = column(GEOM_COLUMN)?.cast(&DataType::Int32)?;
        let sides = column(SIDE_COLUMN)?.cast(&DataType::Int32)?;
        let constants = column(CONSTANT_COLUMN)?.cast(&DataType::Float64)?;

        let mut table = CalibrationTable::new();
        let rows = geom_ids
            .i32()?
            .into_iter()
            .zip(sides.i32()?.into_iter())
            .zip(constants.f64()?.into_iter());
        for (row, ((geom_id, side), constant)) in rows.enumerate() {
            let (Some(geom_id), Some(side), Some(constant)) = (geom_id, side, constant) else {
                return Err(CalibError::Config(format!(
                    "calibration table has a null value in row {row}"
                )));
            };
            let entry = parse_entry(row, geom_id as i64, side, constant)?;
            if table.insert(entry).is_some() {
                return Err(CalibError::Config(format!(
                    "calibration table lists GeomID {} side {} more than once",
                    entry.geom_id,
                    entry.side.label()
                )));
            }
        }
        Ok(table)
    }

    pub fn write_parquet(&self, path: &Path) -> Result<(), CalibError> {
        let mut frame = self.to_frame()?;
        write_frame(&mut frame, path)
    }

    pub fn read_parquet(path: &Path) -> Result<CalibrationTable, CalibError> {
        let file = File::open(path)?;
        let frame = ParquetReader::new(file).finish()?;
        let table = Self::from_frame(&frame)?;
        info!(
            "Loaded {} calibration constants from {}",
            table.len(),
            path.display()
        );
        Ok(table)
    }

    /// `#GeomID,Side,CalibConst` text with the side written as L/R.
    pub fn write_text(&self, path: &Path) -> Result<(), CalibError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut writer = BufWriter::new(File::create(path)?);
        writeln!(writer, "{TEXT_HEADER}")?;
        for entry in self.iter() {
            writeln!(
                writer,
                "{},{},{}",
                entry.geom_id,
                entry.side.label(),
                entry.constant
            )?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn read_text(path: &Path) -> Result<CalibrationTable, CalibError> {
        let reader = BufReader::new(File::open(path)?);
        let mut table = CalibrationTable::new();
        for (row, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            let [geom_id, side, constant] = fields[..] else {
                return Err(CalibError::Config(format!(
                    "{}:{}: expected 3 comma separated fields",
                    path.display(),
                    row + 1
                )));
            };
            let bad = |what: &str| {
                CalibError::Config(format!("{}:{}: bad {what}", path.display(), row + 1))
            };
            let geom_id: i64 = geom_id.parse().map_err(|_| bad("GeomID"))?;
            let side = match side {
                "L" | "0" => 0,
                "R" | "1" => 1,
                _ => return Err(bad("side")),
            };
            let constant: f64 = constant.parse().map_err(|_| bad("constant"))?;
            let entry = parse_entry(row, geom_id, side, constant)?;
            if table.insert(entry).is_some() {
                return Err(bad("duplicate (GeomID, side)"));
            }
        }
        Ok(table)
    }

    /// Reads parquet, or the text form for `.txt` / `.csv` files.
    pub fn load(path: &Path) -> Result<CalibrationTable, CalibError> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("txt") | Some("csv") => Self::read_text(path),
            _ => Self::read_parquet(path),
        }
    }

    /// Later paths win on duplicate keys.
    pub fn load_all<P: AsRef<Path>>(paths: &[P]) -> Result<CalibrationTable, CalibError> {
        let mut table = CalibrationTable::new();
        for path in paths {
            table.merge(Self::load(path.as_ref())?);
        }
        Ok(table)
    }
}

fn parse_entry(row: usize, geom_id: i64, side: i32, constant: f64) -> Result<CalibrationEntry, CalibError> {
    if geom_id < 1 || geom_id > u32::MAX as i64 {
        return Err(CalibError::Config(format!(
            "calibration row {row} has GeomID {geom_id}"
        )));
    }
    let Some(side) = Side::from_index(side) else {
        return Err(CalibError::Config(format!(
            "calibration row {row} has side {side}, expected 0 or 1"
        )));
    };
    Ok(CalibrationEntry::new(geom_id as u32, side, constant))
}

impl FromIterator<CalibrationEntry> for CalibrationTable {
    fn from_iter<I: IntoIterator<Item = CalibrationEntry>>(iter: I) -> Self {
        let mut table = CalibrationTable::new();
        for entry in iter {
            table.insert(entry);
        }
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_table() -> CalibrationTable {
        [
            CalibrationEntry::new(15, Side::Right, 0.002475),
            CalibrationEntry::new(7, Side::Left, 1.0 / 3.0),
            CalibrationEntry::new(7, Side::Right, 0.0),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_rows_are_sorted() {
        let table = sample_table();
        let keys: Vec<_> = table.iter().map(|e| (e.geom_id, e.side)).collect();
        assert_eq!(
            keys,
            vec![(7, Side::Left), (7, Side::Right), (15, Side::Right)]
        );
        assert_eq!(table.invalid_count(), 1);
    }

    #[test]
    fn test_parquet_round_trip_is_exact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("table.parquet");
        let table = sample_table();
        table.write_parquet(&path).unwrap();
        let loaded = CalibrationTable::load(&path).unwrap();
        assert_eq!(loaded, table);
        assert_eq!(loaded.constant(7, Side::Left), Some(1.0 / 3.0));
    }

    #[test]
    fn test_text_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table.txt");
        let table = sample_table();
        table.write_text(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("#GeomID,Side,CalibConst\n7,L,"));
        let loaded = CalibrationTable::load(&path).unwrap();
        assert_eq!(loaded, table);
    }

    #[test]
    fn test_merge_later_wins() {
        let mut table = sample_table();
        let other: CalibrationTable = [CalibrationEntry::new(15, Side::Right, 0.5)]
            .into_iter()
            .collect();
        table.merge(other);
        assert_eq!(table.len(), 3);
        assert_eq!(table.constant(15, Side::Right), Some(0.5));
    }

    #[test]
    fn test_bad_side_is_rejected() {
        let frame = df!(
            GEOM_COLUMN => [1i32],
            SIDE_COLUMN => [2i32],
            CONSTANT_COLUMN => [1.0f64]
        )
        .unwrap();
        assert!(matches!(
            CalibrationTable::from_frame(&frame),
            Err(CalibError::Config(_))
        ));
    }

    #[test]
    fn test_missing_column() {
        let frame = df!(GEOM_COLUMN => [1i32], SIDE_COLUMN => [0i32]).unwrap();
        assert!(matches!(
            CalibrationTable::from_frame(&frame),
            Err(CalibError::MissingColumn(_))
        ));
    }
}
