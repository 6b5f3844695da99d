//! serlink: terminate a PPP link on a serial device and bridge its TCP
//! flows to local services.

mod cli;
mod serial;

use clap::Parser;
use serlink_core::shutdown::SessionEnd;
use serlink_core::Bridge;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = cli::Args::parse();

    let default_filter = match args.verbose {
        0 => "info",
        1 => "serlink=debug,serlink_core=debug,info",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = cli::build_config(&args)?;
    tracing::info!(
        device = %config.serial.device.display(),
        baud = config.serial.baud,
        role = ?config.role,
        "opening serial device"
    );
    let port = serial::SerialPort::open(
        &config.serial.device,
        config.serial.baud,
        config.serial.flow_control,
    )?;

    let bridge = Bridge::new(port, config);
    let stats = bridge.stats();

    // SIGINT and SIGTERM both end the session through the orderly teardown
    // path: flows reset, proxies drained, serial flushed.
    let shutdown = bridge.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received; closing link");
            shutdown.raise(SessionEnd::Operator);
        }
    });
    let shutdown = bridge.shutdown_handle();
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        if terminate.recv().await.is_some() {
            tracing::info!("termination signal received; closing link");
            shutdown.raise(SessionEnd::Operator);
        }
    });

    let result = bridge.run().await;
    let snapshot = stats.snapshot();
    tracing::info!(?snapshot, "final link counters");
    result?;
    Ok(())
}
