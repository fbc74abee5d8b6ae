use tracing::{debug, warn};

use crate::models::{DefaultTagSet, FieldValue, MeasurementResult, MetricPoint, WritePrecision};

/// Tag names attached to every point of a run.
pub const TAG_NAMES: [&str; 7] = [
    "server_id",
    "server_name",
    "server_sponsor",
    "server_country",
    "isp_name",
    "isp_addr",
    "hostname",
];

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Host name of the measuring machine, empty when it cannot be determined.
pub fn local_hostname() -> String {
    match whoami::fallible::hostname() {
        Ok(name) => name,
        Err(e) => {
            warn!("Failed to read hostname: {}", e);
            String::new()
        }
    }
}

fn integer(value: u64) -> FieldValue {
    FieldValue::Integer(i64::try_from(value).unwrap_or(i64::MAX))
}

/// Maps one measurement into its download, upload and ping points plus the
/// tags shared by all three.
pub fn to_points(
    result: &MeasurementResult,
    hostname: &str,
    precision: WritePrecision,
) -> (Vec<MetricPoint>, DefaultTagSet) {
    debug!("Parsing results");

    let mut tags = DefaultTagSet::new();
    tags.add("server_id", result.server.id.as_str());
    tags.add("server_name", result.server.name.as_str());
    tags.add("server_sponsor", result.server.sponsor.as_str());
    tags.add("server_country", result.server.country.as_str());
    tags.add("isp_name", result.client.isp.as_str());
    tags.add("isp_addr", result.client.ip.as_str());
    tags.add("hostname", hostname);

    let time = result.timestamp;
    let points = vec![
        MetricPoint::new("download", time, precision)
            .field("bytes_received", integer(result.bytes_received))
            .field("bps", FieldValue::Float(round2(result.download))),
        MetricPoint::new("upload", time, precision)
            .field("bytes_sent", integer(result.bytes_sent))
            .field("bps", FieldValue::Float(round2(result.upload))),
        MetricPoint::new("ping", time, precision)
            .field("ms", FieldValue::Float(round2(result.ping))),
    ];

    (points, tags)
}
