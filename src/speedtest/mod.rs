//! Bandwidth and latency measurement against speedtest.net servers.

use std::io::{self, Write};
use std::path::Path;

use async_trait::async_trait;

use crate::models::{MeasurementResult, ServerDescriptor};
use crate::Result;

pub mod client;
pub mod probe;

pub use client::HttpSpeedtest;
pub use probe::{probe_latency, LatencyProbe};

/// Produces one measurement per call.
#[async_trait]
pub trait SpeedTester: Send + Sync {
    async fn run(&self) -> Result<MeasurementResult>;
}

/// Receives one call per completed transfer. `last` is set on the final
/// call of a phase.
pub trait ProgressCallback: Send + Sync {
    fn on_progress(&self, completed: usize, last: bool);
}

impl<F> ProgressCallback for F
where
    F: Fn(usize, bool) + Send + Sync,
{
    fn on_progress(&self, completed: usize, last: bool) {
        self(completed, last)
    }
}

/// Prints a dot per transfer and ends the line when a phase finishes.
#[derive(Debug, Default, Clone, Copy)]
pub struct DotPrinter;

impl ProgressCallback for DotPrinter {
    fn on_progress(&self, _completed: usize, last: bool) {
        let mut out = io::stdout().lock();
        let _ = out.write_all(b".");
        if last {
            let _ = out.write_all(b"\n");
        }
        let _ = out.flush();
    }
}

/// How the measurement server is chosen.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerSelection {
    /// Lowest-latency server among the closest candidates.
    Automatic,
    /// This server is the only candidate and is used as is.
    Pinned(ServerDescriptor),
}

/// Reads a pinned server descriptor from `path`.
pub async fn load_server(path: &Path) -> Result<ServerDescriptor> {
    let raw = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&raw)?)
}
