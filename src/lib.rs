//! Energy calibration for the BIC calorimeter.
//!
//! Raw waveform events from the event builder are mapped channel by channel onto the
//! detector geometry, integrated, and compared with simulated energy deposits to derive
//! one constant per (GeomID, side). The constants are written as a small table that a
//! later pass applies to new data.

#![warn(clippy::all, rust_2018_idioms)]

pub mod aggregator;
pub mod applier;
pub mod calibration_table;
pub mod channel_map;
pub mod config;
pub mod error;
pub mod event;
pub mod event_file;
pub mod gaussian;
pub mod histogram;
pub mod output_paths;
pub mod pipeline;
pub mod qa;
pub mod selection;
pub mod simulation;
pub mod solver;
pub mod waveform;

pub use config::CalibConfig;
pub use error::CalibError;
