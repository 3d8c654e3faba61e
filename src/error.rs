use super::channel_map::ChannelMapError;
use polars::error::PolarsError;
use std::error::Error;
use std::fmt::Display;

#[derive(Debug)]
pub enum CalibError {
    File(std::io::Error),
    DataFrame(PolarsError),
    Channel(ChannelMapError),
    Yaml(serde_yaml::Error),
    Json(serde_json::Error),
    MissingColumn(String),
    RaggedEvent { row: usize, column: String },
    Config(String),
}

impl From<std::io::Error> for CalibError {
    fn from(err: std::io::Error) -> CalibError {
        CalibError::File(err)
    }
}

impl From<PolarsError> for CalibError {
    fn from(err: PolarsError) -> CalibError {
        CalibError::DataFrame(err)
    }
}

impl From<ChannelMapError> for CalibError {
    fn from(err: ChannelMapError) -> CalibError {
        CalibError::Channel(err)
    }
}

impl From<serde_yaml::Error> for CalibError {
    fn from(value: serde_yaml::Error) -> Self {
        CalibError::Yaml(value)
    }
}

impl From<serde_json::Error> for CalibError {
    fn from(value: serde_json::Error) -> Self {
        CalibError::Json(value)
    }
}

impl Display for CalibError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CalibError::File(x) => write!(f, "Run had a file I/O error: {x}"),
            CalibError::DataFrame(x) => write!(f, "Run had an error using polars: {x}"),
            CalibError::Channel(x) => {
                write!(f, "Run had an error occur with the channel map: {x}")
            }
            CalibError::Yaml(x) => write!(f, "Run could not parse the yaml configuration: {x}"),
            CalibError::Json(x) => write!(f, "Run could not parse a json document: {x}"),
            CalibError::MissingColumn(name) => {
                write!(f, "Run could not find required column '{name}' in the input")
            }
            CalibError::RaggedEvent { row, column } => write!(
                f,
                "Run found a null list in column '{column}' at row {row}"
            ),
            CalibError::Config(x) => write!(f, "Run has an invalid configuration: {x}"),
        }
    }
}

impl Error for CalibError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CalibError::File(x) => Some(x),
            CalibError::DataFrame(x) => Some(x),
            CalibError::Channel(x) => Some(x),
            CalibError::Yaml(x) => Some(x),
            CalibError::Json(x) => Some(x),
            _ => None,
        }
    }
}
