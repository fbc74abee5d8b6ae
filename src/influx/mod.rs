//! Persistence of measurement points to InfluxDB.

pub mod writer;

pub use writer::{InfluxWriter, PointWriter, WriteSession};
