//! Configuration data model

use std::path::PathBuf;
use std::time::Duration;

/// Default path of the kernel's user-space HID character device
pub const DEFAULT_UHID_PATH: &str = "/dev/uhid";

/// Default TCP port of the relay interface
pub const DEFAULT_PORT: u16 = 4242;

/// Default name the virtual keyboard announces to the kernel
pub const DEFAULT_DEVICE_NAME: &str = "virtual-keyboard";

/// Longest device name that still fits the kernel's NUL-terminated name field
pub const MAX_DEVICE_NAME_LEN: usize = 127;

/// Upper bound for the settle delay; anything longer stalls every client round trip
pub const MAX_SETTLE_DELAY_MS: u64 = 10_000;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub log_level: Option<LogLevel>,
    pub relay: RelayConfig,
    pub device: DeviceConfig,
}

/// Settings of the network relay and the device file it writes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Path of the uhid character device
    pub uhid_path: PathBuf,
    /// TCP port to listen on
    pub port: u16,
    /// Time between injecting a keystroke and collecting the captured text
    pub settle_delay: Duration,
    /// Pending connections the OS may queue while a session is active
    pub listen_backlog: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            uhid_path: PathBuf::from(DEFAULT_UHID_PATH),
            port: DEFAULT_PORT,
            settle_delay: Duration::from_millis(20),
            listen_backlog: 5,
        }
    }
}

/// Identity of the emulated keyboard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Name announced to the kernel; the capture worker looks the device up by it
    pub name: String,
    pub vendor: u32,
    pub product: u32,
    pub version: u32,
    pub country: u32,
    /// Grace period between creating the device and querying the X server for it
    pub discovery_delay: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_DEVICE_NAME.to_string(),
            vendor: 0x15d9,
            product: 0x0a37,
            version: 0,
            country: 0,
            discovery_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`
    pub fn as_filter(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(format!("Unknown log level: {}", s)),
        }
    }
}
