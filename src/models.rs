use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Time unit used when timestamping persisted points.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WritePrecision {
    #[default]
    Seconds,
    Milliseconds,
    Microseconds,
    Nanoseconds,
}

impl WritePrecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            WritePrecision::Seconds => "s",
            WritePrecision::Milliseconds => "ms",
            WritePrecision::Microseconds => "us",
            WritePrecision::Nanoseconds => "ns",
        }
    }

    /// Converts `time` to an integer count of this unit since the epoch.
    pub fn timestamp(&self, time: &DateTime<Utc>) -> i64 {
        match self {
            WritePrecision::Seconds => time.timestamp(),
            WritePrecision::Milliseconds => time.timestamp_millis(),
            WritePrecision::Microseconds => time.timestamp_micros(),
            // Out of range only past the year 2262.
            WritePrecision::Nanoseconds => time.timestamp_nanos_opt().unwrap_or(i64::MAX),
        }
    }
}

impl fmt::Display for WritePrecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WritePrecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "s" => Ok(WritePrecision::Seconds),
            "ms" => Ok(WritePrecision::Milliseconds),
            "us" => Ok(WritePrecision::Microseconds),
            "ns" => Ok(WritePrecision::Nanoseconds),
            other => Err(format!("unknown write precision '{}', expected s, ms, us or ns", other)),
        }
    }
}

/// A candidate measurement endpoint.
///
/// Matches both the pinned server file and the entries of the public server
/// list, where the distance is named `distance` instead of `d`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub url: String,
    pub lat: String,
    pub lon: String,
    pub name: String,
    pub country: String,
    pub cc: String,
    pub sponsor: String,
    pub id: String,
    pub host: String,
    #[serde(default, alias = "distance")]
    pub d: f64,
    #[serde(default)]
    pub latency: f64,
}

/// The measuring host as seen by the speedtest service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientDescriptor {
    pub ip: String,
    pub isp: String,
    pub lat: String,
    pub lon: String,
    pub country: String,
}

/// Outcome of one download/upload/ping run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementResult {
    /// bits per second
    pub download: f64,
    /// bits per second
    pub upload: f64,
    /// milliseconds
    pub ping: f64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub server: ServerDescriptor,
    pub client: ClientDescriptor,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    Integer(i64),
    Float(f64),
}

/// One named, timestamped observation destined for the time-series store.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    pub measurement: String,
    pub fields: Vec<(String, FieldValue)>,
    pub timestamp: DateTime<Utc>,
    pub precision: WritePrecision,
}

impl MetricPoint {
    pub fn new(measurement: &str, timestamp: DateTime<Utc>, precision: WritePrecision) -> Self {
        Self {
            measurement: measurement.to_string(),
            fields: Vec::new(),
            timestamp,
            precision,
        }
    }

    pub fn field(mut self, name: &str, value: FieldValue) -> Self {
        self.fields.push((name.to_string(), value));
        self
    }

    pub fn get(&self, name: &str) -> Option<FieldValue> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }
}

/// Identifying labels applied to every point of one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DefaultTagSet {
    tags: BTreeMap<String, String>,
}

impl DefaultTagSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: &str, value: impl Into<String>) {
        self.tags.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.tags.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Tags in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tags.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}
