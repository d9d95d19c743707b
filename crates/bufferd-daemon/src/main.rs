//! bufferd daemon entry point.
//!
//! Starts the hardware driver, creates its buffers and serves clients over
//! TCP until a client, Ctrl-C or `bufferd --stop` asks it to shut down.

use std::path::PathBuf;

use anyhow::{Context, Result};
use bufferd_core::{DriverChoice, select_driver};
use bufferd_daemon::{Daemon, panic};
use bufferd_rpc::{ClientEndpoint, CommunicationSettings};
use clap::{Parser, ValueEnum};
use tracing::{info, warn};
use tracing_appender::non_blocking::NonBlocking;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// bufferd - gateway daemon exposing hardware buffers over TCP
#[derive(Parser, Debug)]
#[command(name = "bufferd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Port to listen on (defaults to `$BUFFERD_DAEMON_PORT` or 3449)
    #[arg(long, value_name = "PORT")]
    port: Option<u16>,

    /// Hardware driver to run
    #[arg(long, value_enum, default_value_t = DriverArg::Auto)]
    driver: DriverArg,

    /// Ask the running daemon to shut down, then exit
    #[arg(long)]
    stop: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DriverArg {
    /// Best suitable driver, `$BUFFERD_DRIVER` selects the unit test driver
    Auto,
    /// No hardware
    Dummy,
    /// Simulated AI, AO, DI and DO ports
    UnitTest,
}

impl From<DriverArg> for DriverChoice {
    fn from(arg: DriverArg) -> Self {
        match arg {
            DriverArg::Auto => DriverChoice::Auto,
            DriverArg::Dummy => DriverChoice::Dummy,
            DriverArg::UnitTest => DriverChoice::UnitTest,
        }
    }
}

/// Open the debug build's log file in the temp directory and point
/// `bufferd-daemon.log` next to it at the newest one.
fn debug_log() -> (PathBuf, NonBlocking) {
    let dir = std::env::temp_dir();
    let name = format!(
        "bufferd-daemon-{}.log",
        chrono::Local::now().format("%Y%m%d_%H%M%S")
    );
    let path = dir.join(&name);

    #[cfg(unix)]
    {
        let latest = dir.join("bufferd-daemon.log");
        let _ = std::fs::remove_file(&latest);
        let _ = std::os::unix::fs::symlink(&path, &latest);
    }

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(&dir, &name));
    // Keeps flushing until the process exits.
    std::mem::forget(guard);
    (path, writer)
}

/// Log to stderr, `bufferd=debug` in debug builds and `bufferd=info`
/// otherwise. Debug builds also keep a plain-text copy in a file.
fn setup_logging() {
    let verbose = cfg!(debug_assertions);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "bufferd=debug" } else { "bufferd=info" })
    });

    let log_file = verbose.then(debug_log);
    let file_layer = log_file.as_ref().map(|(_, writer)| {
        fmt::layer()
            .with_writer(writer.clone())
            .with_ansi(false)
            .with_line_number(true)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    if let Some((path, _)) = &log_file {
        info!("Debug log at {}", path.display());
    }
}

async fn request_stop(settings: CommunicationSettings) -> Result<()> {
    let address = settings.socket_addr();
    let client = ClientEndpoint::new(settings);
    client
        .shutdown_daemon()
        .await
        .with_context(|| format!("No daemon answering on {address}"))?;
    client.disconnect().await;
    info!("Shutdown requested from daemon on {}", address);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging();

    let mut settings = CommunicationSettings::from_env();
    if let Some(port) = args.port {
        settings.port = port;
    }

    if args.stop {
        return request_stop(settings).await;
    }

    panic::install();
    info!("Starting bufferd daemon...");

    let daemon = Daemon::bind(&settings, select_driver(args.driver.into()))
        .await
        .with_context(|| format!("Failed to start daemon on {}", settings.socket_addr()))?;

    let handle = daemon.handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupted");
                handle.shutdown();
            }
            Err(e) => warn!("Cannot listen for Ctrl-C: {}", e),
        }
    });

    daemon.run().await?;

    info!("bufferd daemon stopped");
    Ok(())
}
