use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Write rejected with status {status}: {body}")]
    Write { status: u16, body: String },

    #[error("InfluxDB error: {0}")]
    Influx(String),
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Http(err.to_string())
    }
}

impl From<influxdb2::RequestError> for Error {
    fn from(err: influxdb2::RequestError) -> Self {
        match err {
            influxdb2::RequestError::Http { status, text } => Error::Write {
                status: status.as_u16(),
                body: text,
            },
            influxdb2::RequestError::ReqwestProcessing { source } => source.into(),
            other => Error::Influx(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
