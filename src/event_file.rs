use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};

use log::info;
use polars::prelude::*;

use super::error::CalibError;
use super::event::Event;

pub const MODULE_COLUMN: &str = "MID";
pub const CHANNEL_COLUMN: &str = "ch";
pub const OFFSET_COLUMN: &str = "waveform_idx";
pub const SAMPLE_COLUMN: &str = "waveform_total";
pub const LENGTH_COLUMN: &str = "data_length";
pub const TRIGGER_TIME_COLUMN: &str = "trigger_time";
pub const TRIGGER_NUMBER_COLUMN: &str = "trigger_number";

fn list_column(df: &DataFrame, name: &str, inner: DataType) -> Result<ListChunked, CalibError> {
    let column = df
        .column(name)
        .map_err(|_| CalibError::MissingColumn(name.to_owned()))?;
    let cast = column.cast(&DataType::List(Box::new(inner)))?;
    Ok(cast.list()?.clone())
}

fn optional_list_column(df: &DataFrame, name: &str) -> Result<Option<ListChunked>, CalibError> {
    if df.get_column_names().iter().any(|c| c.as_str() == name) {
        Ok(Some(list_column(df, name, DataType::Int64)?))
    } else {
        Ok(None)
    }
}

fn row_series(list: &ListChunked, row: usize, column: &str) -> Result<Series, CalibError> {
    list.get_as_series(row).ok_or_else(|| CalibError::RaggedEvent {
        row,
        column: column.to_owned(),
    })
}

// nulls stay in place so the hit arrays remain parallel
fn row_i64(list: &ListChunked, row: usize, column: &str) -> Result<Vec<Option<i64>>, CalibError> {
    let series = row_series(list, row, column)?;
    Ok(series.i64()?.into_iter().collect())
}

/// MID / ch values that are null or do not fit a u32 become 0 and are recorded
/// in `malformed` by hit index.
fn hit_ids(values: &[Option<i64>], malformed: &mut BTreeSet<usize>) -> Vec<u32> {
    values
        .iter()
        .enumerate()
        .map(|(index, value)| match value.and_then(|v| u32::try_from(v).ok()) {
            Some(id) => id,
            None => {
                malformed.insert(index);
                0
            }
        })
        .collect()
}

fn first_value(list: Option<&ListChunked>, row: usize) -> Result<Option<i64>, CalibError> {
    match list.and_then(|l| l.get_as_series(row)) {
        Some(series) => Ok(series.i64()?.into_iter().flatten().next()),
        None => Ok(None),
    }
}

/// Event-builder output: one parquet row per readout frame, every field a list column.
#[derive(Debug, Clone)]
pub struct EventFile {
    path: PathBuf,
    frame: DataFrame,
    module_ids: ListChunked,
    channels: ListChunked,
    offsets: ListChunked,
    samples: ListChunked,
    data_length: ListChunked,
    trigger_time: Option<ListChunked>,
    trigger_number: Option<ListChunked>,
}

impl EventFile {
    pub fn open(path: &Path) -> Result<EventFile, CalibError> {
        let file = File::open(path)?;
        let frame = ParquetReader::new(file).finish()?;
        info!(
            "Opened event file {} with {} entries",
            path.display(),
            frame.height()
        );
        Self::from_frame(path, frame)
    }

    pub fn from_frame(path: &Path, frame: DataFrame) -> Result<EventFile, CalibError> {
        Ok(EventFile {
            path: path.to_path_buf(),
            module_ids: list_column(&frame, MODULE_COLUMN, DataType::Int64)?,
            channels: list_column(&frame, CHANNEL_COLUMN, DataType::Int64)?,
            offsets: list_column(&frame, OFFSET_COLUMN, DataType::Int64)?,
            samples: list_column(&frame, SAMPLE_COLUMN, DataType::Int32)?,
            data_length: list_column(&frame, LENGTH_COLUMN, DataType::Int64)?,
            trigger_time: optional_list_column(&frame, TRIGGER_TIME_COLUMN)?,
            trigger_number: optional_list_column(&frame, TRIGGER_NUMBER_COLUMN)?,
            frame,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.frame.height()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn event(&self, row: usize) -> Result<Event, CalibError> {
        let mut malformed_hits = BTreeSet::new();
        let module_ids = hit_ids(&row_i64(&self.module_ids, row, MODULE_COLUMN)?, &mut malformed_hits);
        let channels = hit_ids(&row_i64(&self.channels, row, CHANNEL_COLUMN)?, &mut malformed_hits);
        let samples = row_series(&self.samples, row, SAMPLE_COLUMN)?
            .i32()?
            .into_iter()
            .map(|v| v.unwrap_or(0))
            .collect();
        let channel_count = row_series(&self.data_length, row, LENGTH_COLUMN)?.len();

        Ok(Event {
            module_ids,
            channels,
            waveform_offsets: row_i64(&self.offsets, row, OFFSET_COLUMN)?,
            samples,
            channel_count,
            trigger_time: first_value(self.trigger_time.as_ref(), row)?,
            trigger_number: first_value(self.trigger_number.as_ref(), row)?,
            malformed_hits,
        })
    }

    /// Sequential pass over the file; re-callable.
    pub fn iter(&self) -> impl Iterator<Item = Result<Event, CalibError>> + '_ {
        (0..self.len()).map(move |row| self.event(row))
    }

    /// Keeps the rows whose mask entry is true and writes them unchanged.
    pub fn write_subset(&self, keep: &[bool], output: &Path) -> Result<usize, CalibError> {
        let mask = BooleanChunked::from_slice("keep".into(), keep);
        let mut selected = self.frame.filter(&mask)?;
        let rows = selected.height();
        write_frame(&mut selected, output)?;
        Ok(rows)
    }
}

pub fn write_frame(frame: &mut DataFrame, output: &Path) -> Result<(), CalibError> {
    info!("Writing dataframe to disk at {}", output.display());
    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut output_file = File::create(output)?;
    ParquetWriter::new(&mut output_file).finish(frame)?;
    Ok(())
}

fn list_rows<F>(events: &[Event], f: F) -> Vec<Series>
where
    F: Fn(&Event) -> Series,
{
    events.iter().map(f).collect()
}

fn hit_values(event: &Event, ids: &[u32]) -> Vec<Option<i64>> {
    ids.iter()
        .enumerate()
        .map(|(index, &id)| (!event.is_malformed(index)).then_some(i64::from(id)))
        .collect()
}

/// Writes events in the event-builder layout. Trigger values are written as
/// single element lists, or empty lists when absent. Malformed hits and missing
/// offsets are written as nulls.
pub fn write_events(events: &[Event], output: &Path) -> Result<(), CalibError> {
    let mut frame = df!(
        MODULE_COLUMN => list_rows(events, |e| Series::new("".into(), hit_values(e, &e.module_ids))),
        CHANNEL_COLUMN => list_rows(events, |e| Series::new("".into(), hit_values(e, &e.channels))),
        OFFSET_COLUMN => list_rows(events, |e| Series::new("".into(), e.waveform_offsets.clone())),
        SAMPLE_COLUMN => list_rows(events, |e| Series::new("".into(), e.samples.clone())),
        LENGTH_COLUMN => list_rows(events, |e| Series::new("".into(), vec![0i32; e.channel_count])),
        TRIGGER_TIME_COLUMN => list_rows(events, |e| {
            Series::new("".into(), e.trigger_time.into_iter().collect::<Vec<i64>>())
        }),
        TRIGGER_NUMBER_COLUMN => list_rows(events, |e| {
            Series::new("".into(), e.trigger_number.into_iter().collect::<Vec<i64>>())
        })
    )?;
    write_frame(&mut frame, output)
}
