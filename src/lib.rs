pub mod collector;
pub mod config;
pub mod error;
pub mod influx;
pub mod logging;
pub mod models;
pub mod speedtest;
pub mod transform;

pub use error::{Error, Result};
