use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::info;

use crate::config::Config;
use crate::influx::PointWriter;
use crate::models::WritePrecision;
use crate::speedtest::SpeedTester;
use crate::transform::{local_hostname, to_points};
use crate::Result;

/// How a collection loop that did not fail came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// The operator asked to stop.
    Interrupted,
}

/// Process exit status for the outcome of [`Collector::run_until`].
pub fn exit_status(outcome: &Result<Exit>) -> u8 {
    match outcome {
        Ok(Exit::Interrupted) => 0,
        Err(_) => 1,
    }
}

/// Measures, converts and persists on a fixed interval.
pub struct Collector<T, W> {
    tester: T,
    writer: W,
    precision: WritePrecision,
    hostname: Option<String>,
    interval: Duration,
}

impl<T: SpeedTester, W: PointWriter> Collector<T, W> {
    pub fn new(tester: T, writer: W, config: &Config) -> Self {
        Self {
            tester,
            writer,
            precision: config.write_precision,
            hostname: None,
            interval: config.collection_interval,
        }
    }

    /// Tags points with `hostname` instead of reading the host name on
    /// every run.
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn tester(&self) -> &T {
        &self.tester
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    /// One measure, transform, write cycle. Returns the number of points written.
    pub async fn run_once(&self) -> Result<usize> {
        let result = self.tester.run().await?;
        let hostname = match &self.hostname {
            Some(hostname) => hostname.clone(),
            None => local_hostname(),
        };
        let (points, tags) = to_points(&result, &hostname, self.precision);
        self.writer.write(&points, &tags).await?;
        Ok(points.len())
    }

    /// Runs cycles until `shutdown` resolves or a cycle fails.
    ///
    /// `shutdown` is watched during both the cycle and the wait that follows
    /// it. A failed cycle ends the loop at once.
    pub async fn run_until<S>(&self, shutdown: S) -> Result<Exit>
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                result = self.run_once() => {
                    result?;
                }
            }

            info!(
                "Run complete. Next run in {} second(s)",
                self.interval.as_secs()
            );

            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = sleep(self.interval) => {}
            }
        }

        info!("Interrupted, shutting down");
        Ok(Exit::Interrupted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DefaultTagSet, MeasurementResult, MetricPoint};
    use crate::transform::tests::sample_result;
    use crate::Error;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::Notify;

    #[derive(Default)]
    struct ScriptedTester {
        runs: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl SpeedTester for ScriptedTester {
        async fn run(&self) -> Result<MeasurementResult> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::Http("connection reset".to_string()));
            }
            Ok(sample_result())
        }
    }

    #[derive(Default)]
    struct RecordingWriter {
        writes: Mutex<Vec<(Vec<MetricPoint>, DefaultTagSet)>>,
        fail: bool,
        stop_after: Option<(usize, Arc<Notify>)>,
    }

    #[async_trait]
    impl PointWriter for RecordingWriter {
        async fn write(&self, points: &[MetricPoint], tags: &DefaultTagSet) -> Result<()> {
            if self.fail {
                return Err(Error::Write {
                    status: 500,
                    body: "down".to_string(),
                });
            }
            let count = {
                let mut writes = self.writes.lock().unwrap();
                writes.push((points.to_vec(), tags.clone()));
                writes.len()
            };
            if let Some((limit, notify)) = &self.stop_after {
                if count == *limit {
                    notify.notify_one();
                }
            }
            Ok(())
        }
    }

    fn config(interval_secs: u64) -> Config {
        Config {
            collection_interval: Duration::from_secs(interval_secs),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_run_once_writes_points_and_tags_of_one_result() {
        let collector = Collector::new(ScriptedTester::default(), RecordingWriter::default(), &config(0))
            .with_hostname("probe-1");

        assert_eq!(collector.run_once().await.unwrap(), 3);

        let writes = collector.writer().writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        let (points, tags) = &writes[0];
        let expected = to_points(&sample_result(), "probe-1", WritePrecision::Seconds);
        assert_eq!(points, &expected.0);
        assert_eq!(tags, &expected.1);
    }

    #[tokio::test]
    async fn test_hostname_is_read_for_each_run() {
        let collector = Collector::new(ScriptedTester::default(), RecordingWriter::default(), &config(0));

        collector.run_once().await.unwrap();
        collector.run_once().await.unwrap();

        let expected = local_hostname();
        let writes = collector.writer().writes.lock().unwrap();
        assert_eq!(writes.len(), 2);
        for (_, tags) in writes.iter() {
            assert_eq!(tags.get("hostname"), Some(expected.as_str()));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_runs_back_to_back() {
        let notify = Arc::new(Notify::new());
        let writer = RecordingWriter {
            stop_after: Some((5, notify.clone())),
            ..RecordingWriter::default()
        };
        let collector = Collector::new(ScriptedTester::default(), writer, &config(0));

        let start = tokio::time::Instant::now();
        let exit = collector
            .run_until(async move { notify.notified().await })
            .await
            .unwrap();

        assert_eq!(exit, Exit::Interrupted);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(collector.tester().runs.load(Ordering::SeqCst), 5);
        assert_eq!(collector.writer().writes.lock().unwrap().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_during_wait_stops_cleanly() {
        let collector = Collector::new(ScriptedTester::default(), RecordingWriter::default(), &config(300));

        let start = tokio::time::Instant::now();
        let outcome = collector
            .run_until(sleep(Duration::from_secs(10)))
            .await;

        assert_eq!(exit_status(&outcome), 0);
        assert_eq!(start.elapsed(), Duration::from_secs(10));
        assert_eq!(collector.tester().runs.load(Ordering::SeqCst), 1);
        assert_eq!(collector.writer().writes.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_separates_runs() {
        let collector = Collector::new(ScriptedTester::default(), RecordingWriter::default(), &config(300));

        collector
            .run_until(sleep(Duration::from_secs(650)))
            .await
            .unwrap();

        // Runs at 0s, 300s and 600s.
        assert_eq!(collector.tester().runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_measurement_failure_skips_write_and_fails() {
        let tester = ScriptedTester {
            fail: true,
            ..ScriptedTester::default()
        };
        let collector = Collector::new(tester, RecordingWriter::default(), &config(0));

        let outcome = collector.run_until(std::future::pending()).await;

        assert!(matches!(outcome, Err(Error::Http(_))));
        assert_eq!(exit_status(&outcome), 1);
        assert_eq!(collector.tester().runs.load(Ordering::SeqCst), 1);
        assert!(collector.writer().writes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_failure_ends_the_loop() {
        let writer = RecordingWriter {
            fail: true,
            ..RecordingWriter::default()
        };
        let collector = Collector::new(ScriptedTester::default(), writer, &config(0));

        let outcome = collector.run_until(std::future::pending()).await;

        assert!(matches!(outcome, Err(Error::Write { status: 500, .. })));
        assert_eq!(collector.tester().runs.load(Ordering::SeqCst), 1);
    }
}
