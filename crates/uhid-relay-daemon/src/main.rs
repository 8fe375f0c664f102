//! uhid-relay daemon
//!
//! Creates a virtual USB keyboard, injects keystrokes received over TCP and
//! answers with the text the X server produced for them.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use uhid_relay_config::{Config, MAX_SETTLE_DELAY_MS};
use uhid_relay_daemon::capture;
use uhid_relay_daemon::queue::RelayQueue;
use uhid_relay_daemon::relay::RelayServer;
use uhid_relay_daemon::uhid::UhidDevice;

#[derive(Parser, Debug)]
#[command(name = "uhid-relayd")]
#[command(about = "Virtual HID keyboard relay daemon")]
#[command(version)]
struct Args {
    /// Path of the uhid device file [default: /dev/uhid]
    #[arg(short, long = "uhid-file")]
    uhid_file: Option<String>,

    /// Port of the TCP interface [default: 4242]
    #[arg(short, long)]
    port: Option<u16>,

    /// Log every request, response and captured key press
    #[arg(short, long)]
    verbose: bool,

    /// Optional KDL configuration file; flags override its values
    #[arg(short, long)]
    config: Option<String>,

    /// Time to wait for captured text after injecting a keystroke [default: 20]
    #[arg(long)]
    settle_delay_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(&args)?;

    // Initialize tracing
    let default_level = if args.verbose {
        "debug"
    } else {
        config.log_level.unwrap_or_default().as_filter()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    // Without a device nothing downstream is meaningful, so this happens before any socket
    let device = UhidDevice::create(&config.relay.uhid_path, &config.device)
        .context("Cannot create USB HID keyboard device")?;

    let queue = RelayQueue::with_default_capacity();

    let capture = capture::spawn(config.device.clone(), queue.clone())
        .context("Failed to start capture thread")?;

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.relay.port));
    let mut server = RelayServer::bind(
        addr,
        config.relay.listen_backlog,
        device,
        queue,
        config.relay.settle_delay,
    )?;

    tracing::info!("uhid-relay daemon running");

    let outcome = tokio::select! {
        _ = server.serve() => Ok(()),
        result = capture.wait() => match result {
            Ok(()) => Err(anyhow::anyhow!("Capture worker stopped unexpectedly")),
            Err(e) => Err(anyhow::Error::new(e).context("Capture worker failed")),
        },
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            tracing::info!("Shutting down...");
            Ok(())
        }
    };

    if let Err(e) = server.into_sink().destroy() {
        tracing::warn!("Failed to destroy virtual keyboard: {}", e);
    }

    outcome
}

/// Merge the optional config file with command line flags
fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => {
            let path: PathBuf = shellexpand::tilde(path).into_owned().into();
            uhid_relay_config::parse_config(&path)
                .with_context(|| format!("Failed to load configuration from {}", path.display()))?
        }
        None => Config::default(),
    };

    if let Some(uhid_file) = &args.uhid_file {
        config.relay.uhid_path = shellexpand::tilde(uhid_file).into_owned().into();
    }

    if let Some(port) = args.port {
        if port == 0 {
            bail!("Port must be between 1 and 65535");
        }
        config.relay.port = port;
    }

    if let Some(ms) = args.settle_delay_ms {
        if ms > MAX_SETTLE_DELAY_MS {
            bail!("Settle delay must be between 0 and {} ms", MAX_SETTLE_DELAY_MS);
        }
        config.relay.settle_delay = Duration::from_millis(ms);
    }

    Ok(config)
}
