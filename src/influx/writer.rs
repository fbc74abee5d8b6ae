use async_trait::async_trait;
use futures::stream;
use influxdb2::api::write::TimestampPrecision;
use influxdb2::models::DataPoint;
use influxdb2::Client;
use tracing::{debug, info};

use crate::config::Config;
use crate::models::{DefaultTagSet, FieldValue, MetricPoint, WritePrecision};
use crate::{Error, Result};

/// Destination for the points of one run.
#[async_trait]
pub trait PointWriter: Send + Sync {
    async fn write(&self, points: &[MetricPoint], tags: &DefaultTagSet) -> Result<()>;
}

impl From<WritePrecision> for TimestampPrecision {
    fn from(precision: WritePrecision) -> Self {
        match precision {
            WritePrecision::Seconds => TimestampPrecision::Seconds,
            WritePrecision::Milliseconds => TimestampPrecision::Milliseconds,
            WritePrecision::Microseconds => TimestampPrecision::Microseconds,
            WritePrecision::Nanoseconds => TimestampPrecision::Nanoseconds,
        }
    }
}

/// Builds the stored form of `point` with `tags` merged in, or `None` when it
/// has no writable field. Empty tag values and non-finite floats are left out
/// since InfluxDB rejects them.
fn data_point(
    point: &MetricPoint,
    tags: &DefaultTagSet,
    precision: WritePrecision,
) -> Result<Option<DataPoint>> {
    let mut builder = DataPoint::builder(point.measurement.as_str());
    for (key, value) in tags.iter().filter(|(_, v)| !v.is_empty()) {
        builder = builder.tag(key, value);
    }

    let mut writable = false;
    for (name, value) in &point.fields {
        builder = match *value {
            FieldValue::Integer(v) => builder.field(name.as_str(), v),
            FieldValue::Float(v) if v.is_finite() => builder.field(name.as_str(), v),
            FieldValue::Float(_) => continue,
        };
        writable = true;
    }
    if !writable {
        return Ok(None);
    }

    let point = builder
        .timestamp(precision.timestamp(&point.timestamp))
        .build()
        .map_err(|e| Error::Influx(e.to_string()))?;
    Ok(Some(point))
}

/// InfluxDB v2 writer bound to one bucket and organization.
///
/// Holds the one database client of the process; clones share it.
#[derive(Clone)]
pub struct InfluxWriter {
    client: Client,
    bucket: String,
    org: String,
}

impl InfluxWriter {
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::new(
            config.influxdb_uri.trim_end_matches('/'),
            config.influxdb_org.as_str(),
            config.influxdb_token.as_deref().unwrap_or_default(),
        );
        Ok(Self {
            client,
            bucket: config.influxdb_bucket.clone(),
            org: config.influxdb_org.clone(),
        })
    }

    /// Opens a session submitting with `tags` at `precision`.
    pub fn session<'a>(&'a self, tags: &'a DefaultTagSet, precision: WritePrecision) -> WriteSession<'a> {
        debug!("Opening write session for {}/{}", self.org, self.bucket);
        WriteSession {
            writer: self,
            tags,
            precision,
        }
    }
}

/// One write against the database. Released when dropped.
pub struct WriteSession<'a> {
    writer: &'a InfluxWriter,
    tags: &'a DefaultTagSet,
    precision: WritePrecision,
}

impl WriteSession<'_> {
    pub async fn submit(&self, points: &[MetricPoint]) -> Result<()> {
        let mut batch = Vec::with_capacity(points.len());
        for point in points {
            if let Some(point) = data_point(point, self.tags, self.precision)? {
                batch.push(point);
            }
        }
        if batch.is_empty() {
            debug!("Nothing to write");
            return Ok(());
        }

        self.writer
            .client
            .write_with_precision(&self.writer.bucket, stream::iter(batch), self.precision.into())
            .await?;
        Ok(())
    }
}

impl Drop for WriteSession<'_> {
    fn drop(&mut self) {
        debug!("Write session released");
    }
}

#[async_trait]
impl PointWriter for InfluxWriter {
    async fn write(&self, points: &[MetricPoint], tags: &DefaultTagSet) -> Result<()> {
        info!("Committing results to database");
        let precision = points.first().map(|p| p.precision).unwrap_or_default();
        let session = self.session(tags, precision);
        session.submit(points).await
    }
}
