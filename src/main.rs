use std::process::ExitCode;

use tracing::error;
use wanspeed::{
    collector::{exit_status, Collector, Exit},
    config::Config,
    influx::InfluxWriter,
    logging,
    speedtest::HttpSpeedtest,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    if let Err(e) = logging::init_logger() {
        eprintln!("Failed to initialize logger: {}", e);
    }

    let outcome = run().await;
    if let Err(e) = &outcome {
        error!("FATAL: {}", e);
    }
    ExitCode::from(exit_status(&outcome))
}

async fn run() -> wanspeed::Result<Exit> {
    let config = Config::from_env()?;

    // One database client for the whole process.
    let writer = InfluxWriter::new(&config)?;
    let tester = HttpSpeedtest::new(&config)?;

    let collector = Collector::new(tester, writer, &config);
    collector.run_until(interrupted()).await
}

async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for interrupt: {}", e);
        std::future::pending::<()>().await;
    }
}
