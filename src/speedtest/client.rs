use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::{future, stream, StreamExt};
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::Client;
use tracing::{debug, info, warn};

use super::probe::{base_url, cache_buster, probe_latency, LatencyProbe};
use super::{load_server, DotPrinter, ProgressCallback, ServerSelection, SpeedTester};
use crate::config::Config;
use crate::models::{ClientDescriptor, MeasurementResult, ServerDescriptor};
use crate::transform::round2;
use crate::{Error, Result};

pub const CONFIG_URL: &str = "https://www.speedtest.net/speedtest-config.php";
pub const SERVERS_URL: &str = "https://www.speedtest.net/api/js/servers?engine=js&limit=10";

const USER_AGENT: &str = concat!("Mozilla/5.0 (compatible) wanspeed/", env!("CARGO_PKG_VERSION"));
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const DOWNLOAD_SIZES: [u32; 10] = [350, 500, 750, 1000, 1500, 2000, 2500, 3000, 3500, 4000];
const DOWNLOAD_REPEAT: usize = 4;
const UPLOAD_SIZES: [usize; 2] = [256 * 1024, 512 * 1024];
const UPLOAD_REPEAT: usize = 25;
const UPLOAD_ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Each phase stops launching transfers after this long.
pub const DEFAULT_TEST_LENGTH: Duration = Duration::from_secs(10);

const CANDIDATE_SERVERS: usize = 5;
const LATENCY_ROUNDS: usize = 3;

lazy_static! {
    static ref CLIENT_ELEMENT: Regex = Regex::new(r"<client\s([^>]*)>").unwrap();
    static ref ATTRIBUTE: Regex = Regex::new(r#"(\w+)="([^"]*)""#).unwrap();
}

/// Extracts the `<client .../>` element of the speedtest configuration.
pub fn parse_client(document: &str) -> Result<ClientDescriptor> {
    let element = CLIENT_ELEMENT
        .captures(document)
        .and_then(|c| c.get(1))
        .ok_or_else(|| Error::Protocol("configuration has no client element".to_string()))?;

    let mut attributes: HashMap<&str, &str> = ATTRIBUTE
        .captures_iter(element.as_str())
        .filter_map(|c| Some((c.get(1)?.as_str(), c.get(2)?.as_str())))
        .collect();
    let mut take = |name: &str| attributes.remove(name).unwrap_or_default().to_string();

    let client = ClientDescriptor {
        ip: take("ip"),
        isp: take("isp"),
        lat: take("lat"),
        lon: take("lon"),
        country: take("country"),
    };
    if client.ip.is_empty() {
        return Err(Error::Protocol("client element has no ip".to_string()));
    }
    Ok(client)
}

fn upload_payload(size: usize) -> Bytes {
    let mut data = Vec::with_capacity(size);
    data.extend_from_slice(b"content1=");
    data.extend(UPLOAD_ALPHABET.iter().cycle().take(size.saturating_sub(data.len())));
    Bytes::from(data)
}

/// Ping for a pinned server: the probe's round trip, or the latency stored
/// with the descriptor when the probe was absorbed.
fn pinned_ping(server: &ServerDescriptor, probe: &LatencyProbe) -> f64 {
    if let LatencyProbe::Absorbed(reason) = probe {
        warn!(
            "Latency probe of server {} failed ({}), reporting stored ping of {} ms",
            server.id, reason, server.latency
        );
    }
    probe.apply(server.latency)
}

struct Phase {
    bytes: u64,
    elapsed: Duration,
}

impl Phase {
    fn bits_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if self.bytes == 0 || secs == 0.0 {
            return 0.0;
        }
        self.bytes as f64 * 8.0 / secs
    }
}

/// speedtest.net client over HTTP.
///
/// The server selection is resolved on every run: a pinned descriptor file is
/// re-read each time, otherwise the closest servers are probed.
pub struct HttpSpeedtest {
    http: Client,
    config_url: String,
    servers_url: String,
    pinned_server: Option<PathBuf>,
    threads: usize,
    test_length: Duration,
    progress: Arc<dyn ProgressCallback>,
}

impl HttpSpeedtest {
    pub fn new(config: &Config) -> Result<Self> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            config_url: CONFIG_URL.to_string(),
            servers_url: SERVERS_URL.to_string(),
            pinned_server: config.speedtest_server.clone(),
            threads: config.speedtest_threads.max(1),
            test_length: DEFAULT_TEST_LENGTH,
            progress: Arc::new(DotPrinter),
        })
    }

    pub fn with_endpoints(mut self, config_url: impl Into<String>, servers_url: impl Into<String>) -> Self {
        self.config_url = config_url.into();
        self.servers_url = servers_url.into();
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_test_length(mut self, test_length: Duration) -> Self {
        self.test_length = test_length;
        self
    }

    /// Runs download then upload against the server `selection` resolves to.
    pub async fn measure(&self, selection: ServerSelection) -> Result<MeasurementResult> {
        let timestamp = Utc::now();
        let client = self.client_descriptor().await?;

        let (server, ping) = match selection {
            ServerSelection::Pinned(server) => {
                let probe = probe_latency(&self.http, &server).await;
                let ping = pinned_ping(&server, &probe);
                (server, ping)
            }
            ServerSelection::Automatic => {
                let server = self.best_server().await?;
                let ping = server.latency;
                (server, ping)
            }
        };
        info!(
            "Testing against {} ({}, {}), ping {} ms",
            server.sponsor, server.name, server.id, ping
        );

        info!("Testing download speed");
        let download = self.download(&server).await?;
        info!("Testing upload speed");
        let upload = self.upload(&server).await?;

        Ok(MeasurementResult {
            download: download.bits_per_second(),
            upload: upload.bits_per_second(),
            ping,
            bytes_sent: upload.bytes,
            bytes_received: download.bytes,
            server,
            client,
            timestamp,
        })
    }

    async fn client_descriptor(&self) -> Result<ClientDescriptor> {
        let document = self
            .http
            .get(&self.config_url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        parse_client(&document)
    }

    async fn best_server(&self) -> Result<ServerDescriptor> {
        let mut servers: Vec<ServerDescriptor> = self
            .http
            .get(&self.servers_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        servers.sort_by(|a, b| a.d.total_cmp(&b.d));
        servers.truncate(CANDIDATE_SERVERS);

        let mut best: Option<ServerDescriptor> = None;
        for mut server in servers {
            let mut samples = Vec::with_capacity(LATENCY_ROUNDS);
            for _ in 0..LATENCY_ROUNDS {
                if let LatencyProbe::Measured(ms) = probe_latency(&self.http, &server).await {
                    samples.push(ms);
                }
            }
            if samples.is_empty() {
                debug!("Skipping unreachable server {} ({})", server.id, server.host);
                continue;
            }

            server.latency = round2(samples.iter().sum::<f64>() / samples.len() as f64);
            if best.as_ref().map_or(true, |b| server.latency < b.latency) {
                best = Some(server);
            }
        }

        best.ok_or_else(|| Error::Protocol("no reachable speedtest server".to_string()))
    }

    async fn download(&self, server: &ServerDescriptor) -> Result<Phase> {
        let base = base_url(&server.url);
        let stamp = cache_buster();
        let urls: Vec<String> = DOWNLOAD_SIZES
            .iter()
            .flat_map(|size| std::iter::repeat(*size).take(DOWNLOAD_REPEAT))
            .enumerate()
            .map(|(i, size)| format!("{}/random{}x{}.jpg?x={}.{}", base, size, size, stamp, i))
            .collect();

        self.run_phase(urls, |url| self.fetch(url)).await
    }

    async fn upload(&self, server: &ServerDescriptor) -> Result<Phase> {
        let payloads: Vec<Bytes> = UPLOAD_SIZES
            .iter()
            .map(|size| upload_payload(*size))
            .flat_map(|payload| std::iter::repeat(payload).take(UPLOAD_REPEAT))
            .collect();
        let url = server.url.as_str();

        self.run_phase(payloads, |payload| self.push(url, payload)).await
    }

    async fn fetch(&self, url: String) -> Result<u64> {
        let mut response = self.http.get(&url).send().await?.error_for_status()?;
        let mut received = 0u64;
        while let Some(chunk) = response.chunk().await? {
            received += chunk.len() as u64;
        }
        Ok(received)
    }

    async fn push(&self, url: &str, payload: Bytes) -> Result<u64> {
        let sent = payload.len() as u64;
        self.http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(sent)
    }

    /// Runs `transfer` over `items` with at most `threads` in flight, launching
    /// nothing new once the test length has passed.
    async fn run_phase<I, F, Fut>(&self, items: I, transfer: F) -> Result<Phase>
    where
        I: IntoIterator,
        F: FnMut(I::Item) -> Fut,
        Fut: Future<Output = Result<u64>>,
    {
        let start = Instant::now();
        let deadline = start + self.test_length;
        let transfers = stream::iter(items)
            .take_while(move |_| future::ready(Instant::now() < deadline))
            .map(transfer)
            .buffer_unordered(self.threads);
        futures::pin_mut!(transfers);

        let mut bytes = 0u64;
        let mut completed = 0usize;
        while let Some(result) = transfers.next().await {
            bytes += result?;
            completed += 1;
            // The previous transfer is reported once we know it was not the last.
            if completed > 1 {
                self.progress.on_progress(completed - 1, false);
            }
        }
        if completed > 0 {
            self.progress.on_progress(completed, true);
        }

        Ok(Phase {
            bytes,
            elapsed: start.elapsed(),
        })
    }
}

#[async_trait]
impl SpeedTester for HttpSpeedtest {
    async fn run(&self) -> Result<MeasurementResult> {
        info!("Performing speedtest");
        let selection = match &self.pinned_server {
            Some(path) => {
                info!("Using server specified in: {}", path.display());
                ServerSelection::Pinned(load_server(path).await?)
            }
            None => ServerSelection::Automatic,
        };
        self.measure(selection).await
    }
}
