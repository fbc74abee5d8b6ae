use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use reqwest::{Client, StatusCode};
use tracing::debug;

use crate::models::ServerDescriptor;
use crate::transform::round2;

/// Body the latency endpoint answers with.
pub const LATENCY_BODY: &str = "test=test\n";

/// Outcome of a best-effort latency probe.
#[derive(Debug, Clone, PartialEq)]
pub enum LatencyProbe {
    /// Round trip in milliseconds, rounded to 2 decimals.
    Measured(f64),
    /// Anything else; the reason is only logged.
    Absorbed(String),
}

impl LatencyProbe {
    /// The ping to keep: the probe result when measured, `current` otherwise.
    pub fn apply(&self, current: f64) -> f64 {
        match self {
            LatencyProbe::Measured(ms) => *ms,
            LatencyProbe::Absorbed(_) => current,
        }
    }

    /// Classifies a finished probe.
    pub fn from_response(status: StatusCode, body: &str, elapsed: Duration) -> Self {
        if status != StatusCode::OK {
            return LatencyProbe::Absorbed(format!("unexpected status {}", status));
        }
        if body != LATENCY_BODY {
            return LatencyProbe::Absorbed(format!("unexpected body {:?}", body));
        }
        LatencyProbe::Measured(round2(elapsed.as_secs_f64() * 1000.0))
    }
}

/// Directory part of a server URL, without the trailing slash.
pub fn base_url(server_url: &str) -> &str {
    match server_url.rfind('/') {
        // Keep "http://" intact for URLs without a path.
        Some(pos) if !server_url[..pos].ends_with('/') => &server_url[..pos],
        _ => server_url.trim_end_matches('/'),
    }
}

pub(crate) fn cache_buster() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

pub fn latency_url(server: &ServerDescriptor) -> String {
    format!("{}/latency.txt?x={}", base_url(&server.url), cache_buster())
}

/// Probes the server's latency endpoint. Never fails: transport errors are
/// absorbed like any other unexpected outcome.
pub async fn probe_latency(http: &Client, server: &ServerDescriptor) -> LatencyProbe {
    let url = latency_url(server);
    let start = Instant::now();
    let response = match http.get(&url).send().await {
        Ok(response) => response,
        Err(e) => return absorbed(&url, format!("request failed: {}", e)),
    };
    let elapsed = start.elapsed();
    let status = response.status();
    let body = match response.text().await {
        Ok(body) => body,
        Err(e) => return absorbed(&url, format!("unreadable body: {}", e)),
    };

    match LatencyProbe::from_response(status, &body, elapsed) {
        LatencyProbe::Absorbed(reason) => absorbed(&url, reason),
        measured => measured,
    }
}

fn absorbed(url: &str, reason: String) -> LatencyProbe {
    debug!("Latency probe of {} absorbed: {}", url, reason);
    LatencyProbe::Absorbed(reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Router};
    use pretty_assertions::assert_eq;
    use tokio::net::TcpListener;

    fn server_at(url: String) -> ServerDescriptor {
        ServerDescriptor {
            url,
            lat: "0".to_string(),
            lon: "0".to_string(),
            name: "Local".to_string(),
            country: "Nowhere".to_string(),
            cc: "NW".to_string(),
            sponsor: "Test".to_string(),
            id: "1".to_string(),
            host: "localhost".to_string(),
            d: 0.0,
            latency: 42.0,
        }
    }

    async fn serve(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}/speedtest/upload.php", addr)
    }

    #[test]
    fn test_base_url() {
        assert_eq!(
            base_url("http://speedtest.example.net:8080/speedtest/upload.php"),
            "http://speedtest.example.net:8080/speedtest"
        );
        assert_eq!(base_url("http://host:8080/upload.php"), "http://host:8080");
        assert_eq!(base_url("http://host:8080"), "http://host:8080");
        assert_eq!(base_url("http://host:8080/"), "http://host:8080");
    }

    #[test]
    fn test_latency_url_has_cache_buster() {
        let url = latency_url(&server_at("http://host/speedtest/upload.php".to_string()));
        assert!(url.starts_with("http://host/speedtest/latency.txt?x="));
        let stamp: u128 = url.rsplit('=').next().unwrap().parse().unwrap();
        assert!(stamp > 0);
    }

    #[test]
    fn test_classification() {
        let elapsed = Duration::from_micros(12_346);
        assert_eq!(
            LatencyProbe::from_response(StatusCode::OK, "test=test\n", elapsed),
            LatencyProbe::Measured(12.35)
        );
        assert!(matches!(
            LatencyProbe::from_response(StatusCode::OK, "test=test", elapsed),
            LatencyProbe::Absorbed(_)
        ));
        assert!(matches!(
            LatencyProbe::from_response(StatusCode::NOT_FOUND, "test=test\n", elapsed),
            LatencyProbe::Absorbed(_)
        ));
    }

    #[test]
    fn test_apply_keeps_prior_value_when_absorbed() {
        assert_eq!(LatencyProbe::Measured(9.5).apply(42.0), 9.5);
        assert_eq!(LatencyProbe::Absorbed("nope".to_string()).apply(42.0), 42.0);
    }

    #[tokio::test]
    async fn test_probe_measures_matching_response() {
        let url = serve(Router::new().route("/speedtest/latency.txt", get(|| async { "test=test\n" }))).await;

        match probe_latency(&Client::new(), &server_at(url)).await {
            LatencyProbe::Measured(ms) => {
                assert!(ms >= 0.0);
                assert_eq!(ms, round2(ms));
            }
            other => panic!("expected a measurement, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_probe_absorbs_wrong_body_and_missing_endpoint() {
        let url = serve(Router::new().route("/speedtest/latency.txt", get(|| async { "nope" }))).await;
        assert!(matches!(
            probe_latency(&Client::new(), &server_at(url)).await,
            LatencyProbe::Absorbed(_)
        ));

        let url = serve(Router::new()).await;
        assert!(matches!(
            probe_latency(&Client::new(), &server_at(url)).await,
            LatencyProbe::Absorbed(_)
        ));
    }

    #[tokio::test]
    async fn test_probe_absorbs_connection_errors() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let server = server_at(format!("http://{}/speedtest/upload.php", addr));
        assert!(matches!(
            probe_latency(&Client::new(), &server).await,
            LatencyProbe::Absorbed(_)
        ));
    }
}
