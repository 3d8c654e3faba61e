use std::path::Path;

use log::info;
use serde::{Deserialize, Serialize};

use super::error::CalibError;
use super::event::Event;
use super::event_file::EventFile;

/// Inclusive trigger time / trigger number windows.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventSelection {
    pub time_min: i64,
    pub time_max: i64,
    pub number_min: i64,
    pub number_max: i64,
}

impl Default for EventSelection {
    fn default() -> Self {
        EventSelection {
            time_min: 0,
            time_max: 1_000_000_000_000,
            number_min: 0,
            number_max: i32::MAX as i64,
        }
    }
}

impl EventSelection {
    /// Missing trigger values read as 0.
    pub fn accepts(&self, event: &Event) -> bool {
        let time = event.trigger_time.unwrap_or(0);
        let number = event.trigger_number.unwrap_or(0);
        (self.time_min..=self.time_max).contains(&time)
            && (self.number_min..=self.number_max).contains(&number)
    }

    /// Copies the accepted rows of `input` to `output` with the schema untouched.
    pub fn run(&self, input: &EventFile, output: &Path) -> Result<usize, CalibError> {
        let mut keep = Vec::with_capacity(input.len());
        for event in input.iter() {
            keep.push(self.accepts(&event?));
        }
        let kept = input.write_subset(&keep, output)?;
        info!(
            "Selected {kept} of {} events from {} into {}",
            input.len(),
            input.path().display(),
            output.display()
        );
        Ok(kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_file::write_events;

    fn triggered(time: Option<i64>, number: Option<i64>) -> Event {
        Event {
            module_ids: vec![41],
            channels: vec![6],
            waveform_offsets: vec![Some(0)],
            samples: vec![1, 2, 3, 4],
            channel_count: 92,
            trigger_time: time,
            trigger_number: number,
            ..Default::default()
        }
    }

    #[test]
    fn test_window_is_inclusive() {
        let selection = EventSelection {
            time_min: 10,
            time_max: 20,
            number_min: 1,
            number_max: 5,
        };
        assert!(selection.accepts(&triggered(Some(10), Some(1))));
        assert!(selection.accepts(&triggered(Some(20), Some(5))));
        assert!(!selection.accepts(&triggered(Some(21), Some(3))));
        assert!(!selection.accepts(&triggered(Some(15), Some(6))));
        // missing number reads as 0, below number_min
        assert!(!selection.accepts(&triggered(Some(15), None)));
    }

    #[test]
    fn test_missing_values_read_as_zero() {
        let selection = EventSelection::default();
        assert!(selection.accepts(&triggered(None, None)));
    }

    #[test]
    fn test_selected_rows_are_written_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("Run_60184_Waveform.parquet");
        let output = dir.path().join("Run_60184_Selected.parquet");
        let events = vec![
            triggered(Some(5), Some(1)),
            triggered(Some(50), Some(2)),
            triggered(Some(15), Some(3)),
        ];
        write_events(&events, &input).unwrap();

        let selection = EventSelection {
            time_min: 0,
            time_max: 20,
            ..Default::default()
        };
        let file = EventFile::open(&input).unwrap();
        assert_eq!(selection.run(&file, &output).unwrap(), 2);

        let selected = EventFile::open(&output).unwrap();
        assert_eq!(selected.len(), 2);
        assert_eq!(selected.event(0).unwrap(), events[0]);
        assert_eq!(selected.event(1).unwrap(), events[2]);
    }
}
