//! uhid-relay CLI
//!
//! Control and diagnostics tool for uhid-relay.

use std::io::{BufRead, Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use miette::IntoDiagnostic;
use uhid_relay_config::Config;
use uhid_relay_daemon::relay::{NO_TEXT, REQUEST_LEN};
use uhid_relay_daemon::uhid::{HidReport, ReportSink, UhidDevice};

/// How long to wait for the first response byte
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Quiet period after which the response is considered complete
const RESPONSE_IDLE: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(name = "uhid-relay")]
#[command(about = "Control tool for the uhid-relay daemon")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate the configuration file and print the effective settings
    Validate,

    /// List available input devices
    Devices,

    /// Send one keystroke to a running relay and print the captured text
    Send {
        /// Relay host
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Relay port (overrides config setting)
        #[arg(short, long)]
        port: Option<u16>,

        /// Report bytes in hex, e.g. `02 00 04`
        #[arg(required = true)]
        bytes: Vec<String>,
    },

    /// Create the virtual keyboard and write hex reports read from stdin
    Inject {
        /// Path of the uhid device file (overrides config setting)
        #[arg(short, long = "uhid-file")]
        uhid_file: Option<PathBuf>,
    },
}

fn main() -> miette::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Expand tilde in config path
    let config_path: Option<PathBuf> = cli
        .config
        .as_deref()
        .map(|path| shellexpand::tilde(path).into_owned().into());

    match cli.command {
        Commands::Validate => cmd_validate(config_path.as_deref()),
        Commands::Devices => cmd_devices(config_path.as_deref()),
        Commands::Send { host, port, bytes } => {
            cmd_send(config_path.as_deref(), &host, port, &bytes)
        }
        Commands::Inject { uhid_file } => cmd_inject(config_path.as_deref(), uhid_file),
    }
}

fn load_config(config_path: Option<&Path>) -> miette::Result<Config> {
    match config_path {
        Some(path) => uhid_relay_config::parse_config(path).map_err(|e| miette::miette!("{}", e)),
        None => Ok(Config::default()),
    }
}

fn cmd_validate(config_path: Option<&Path>) -> miette::Result<()> {
    let Some(path) = config_path else {
        miette::bail!("No configuration file given, use --config <path>");
    };

    println!("Validating configuration: {}", path.display());

    let config = uhid_relay_config::parse_config(path).map_err(miette::Report::new)?;

    println!("Configuration is valid!");
    println!("  uhid file:       {}", config.relay.uhid_path.display());
    println!("  port:            {}", config.relay.port);
    println!("  settle delay:    {} ms", config.relay.settle_delay.as_millis());
    println!("  listen backlog:  {}", config.relay.listen_backlog);
    println!(
        "  device:          {} ({:04x}:{:04x})",
        config.device.name, config.device.vendor, config.device.product
    );
    println!(
        "  discovery delay: {} ms",
        config.device.discovery_delay.as_millis()
    );

    Ok(())
}

fn cmd_devices(config_path: Option<&Path>) -> miette::Result<()> {
    let config = load_config(config_path)?;

    println!("Available input devices:\n");

    for entry in std::fs::read_dir("/dev/input").into_diagnostic()? {
        let entry = entry.into_diagnostic()?;
        let path = entry.path();

        if !path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with("event"))
            .unwrap_or(false)
        {
            continue;
        }

        match evdev::Device::open(&path) {
            Ok(device) => {
                let name = device.name().unwrap_or("Unknown");
                let id = device.input_id();

                let is_keyboard = device.supported_events().contains(evdev::EventType::KEY)
                    && device
                        .supported_keys()
                        .map(|keys| keys.contains(evdev::Key::KEY_A))
                        .unwrap_or(false);

                let device_type = if is_keyboard { "keyboard" } else { "other" };
                let marker = if name == config.device.name {
                    " <- uhid-relay"
                } else {
                    ""
                };

                println!("  {} [{}]{}", name, device_type, marker);
                println!("    Path: {}", path.display());
                println!("    ID: {:04x}:{:04x}", id.vendor(), id.product());
                println!();
            }
            Err(e) => {
                tracing::debug!("Could not open {}: {}", path.display(), e);
            }
        }
    }

    Ok(())
}

fn cmd_send(
    config_path: Option<&Path>,
    host: &str,
    port: Option<u16>,
    bytes: &[String],
) -> miette::Result<()> {
    let config = load_config(config_path)?;
    let port = port.unwrap_or(config.relay.port);

    let request = parse_request(bytes)?;

    let mut stream = TcpStream::connect((host, port)).into_diagnostic()?;
    stream.write_all(&request).into_diagnostic()?;

    let response = read_response(&mut stream).into_diagnostic()?;
    println!("{}", describe_response(&response));

    Ok(())
}

fn cmd_inject(config_path: Option<&Path>, uhid_file: Option<PathBuf>) -> miette::Result<()> {
    let config = load_config(config_path)?;
    let uhid_path = uhid_file.unwrap_or(config.relay.uhid_path);

    let mut device = UhidDevice::create(&uhid_path, &config.device).into_diagnostic()?;

    let injected = inject_lines(std::io::stdin().lock(), &mut device)?;
    tracing::info!("Injected {} reports", injected);

    device.destroy().into_diagnostic()?;
    Ok(())
}

/// Press and release one report per hex line; bad lines are skipped
fn inject_lines<R: BufRead, S: ReportSink>(input: R, sink: &mut S) -> miette::Result<usize> {
    let mut injected = 0;

    for line in input.lines() {
        let line = line.into_diagnostic()?;
        if line.trim().is_empty() {
            continue;
        }

        let report = match HidReport::parse_hex(&line) {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!("Skipping line: {}", e);
                continue;
            }
        };

        match sink.inject(&report) {
            Ok(()) => injected += 1,
            Err(e) => tracing::warn!("Failed to inject report: {}", e),
        }
        if let Err(e) = sink.release() {
            tracing::warn!("Failed to release keys: {}", e);
        }
    }

    Ok(injected)
}

/// Build a relay request from hex bytes, zero-padded to the full length
fn parse_request<S: AsRef<str>>(bytes: &[S]) -> miette::Result<[u8; REQUEST_LEN]> {
    let tokens: Vec<&str> = bytes
        .iter()
        .flat_map(|arg| arg.as_ref().split_whitespace())
        .collect();

    if tokens.len() > REQUEST_LEN {
        miette::bail!(
            "A request holds at most {} bytes, got {}",
            REQUEST_LEN,
            tokens.len()
        );
    }

    let mut request = [0u8; REQUEST_LEN];
    for (slot, token) in request.iter_mut().zip(tokens) {
        let digits = token
            .strip_prefix("0x")
            .or_else(|| token.strip_prefix("0X"))
            .unwrap_or(token);
        *slot = u8::from_str_radix(digits, 16)
            .map_err(|_| miette::miette!("Invalid hex byte '{}'", token))?;
    }

    Ok(request)
}

/// Read until the relay has been quiet for a moment; responses carry no length
fn read_response(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut response = Vec::new();
    let mut buf = [0u8; 1024];

    stream.set_read_timeout(Some(RESPONSE_TIMEOUT))?;
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                response.extend_from_slice(&buf[..n]);
                stream.set_read_timeout(Some(RESPONSE_IDLE))?;
            }
            Err(e)
                if !response.is_empty()
                    && matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
            {
                break
            }
            Err(e) => return Err(e),
        }
    }

    Ok(response)
}

fn describe_response(response: &[u8]) -> String {
    if response == [NO_TEXT] {
        "<no text>".to_string()
    } else {
        format!("{:?}", String::from_utf8_lossy(response))
    }
}
