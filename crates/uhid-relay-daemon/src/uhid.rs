//! Virtual keyboard device via uhid
//!
//! This module owns the lifecycle of the emulated USB keyboard. Every operation
//! is a single write of one `struct uhid_event` to the uhid character device
//! (usually `/dev/uhid`). The kernel rejects writes of any other size, so a
//! short write is treated as an error.
//!
//! Only three request types are ever sent:
//!
//! ```text
//! UHID_CREATE2  [type:4][name:128][phys:64][uniq:64][rd_size:2][bus:2]
//!               [vendor:4][product:4][version:4][country:4][rd_data:4096]
//! UHID_INPUT2   [type:4][size:2][data:4096]
//! UHID_DESTROY  [type:4]
//! ```
//!
//! All fields are native-endian and the remainder of the event is zero-filled.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::libc;
use thiserror::Error;
use uhid_relay_config::{DeviceConfig, MAX_DEVICE_NAME_LEN};

// ============================================================================
// Kernel ABI
// ============================================================================

/// `sizeof(struct uhid_event)`: the type tag plus the largest union member (`uhid_create2_req`)
pub const UHID_EVENT_SIZE: usize = 4376;

/// `UHID_DATA_MAX`
const UHID_DATA_MAX: usize = 4096;

const UHID_DESTROY: u32 = 1;
const UHID_CREATE2: u32 = 11;
const UHID_INPUT2: u32 = 12;

const BUS_USB: u16 = 0x03;

const CREATE2_NAME: usize = 4;
const CREATE2_RD_SIZE: usize = 260;
const CREATE2_BUS: usize = 262;
const CREATE2_VENDOR: usize = 264;
const CREATE2_PRODUCT: usize = 268;
const CREATE2_VERSION: usize = 272;
const CREATE2_COUNTRY: usize = 276;
const CREATE2_RD_DATA: usize = 280;

const INPUT2_SIZE: usize = 4;
const INPUT2_DATA: usize = 6;

const _: () = assert!(CREATE2_RD_DATA + UHID_DATA_MAX == UHID_EVENT_SIZE);

/// Report descriptor of a boot-protocol keyboard: one modifier byte, one
/// reserved byte, five LED outputs and six key slots (usages 0x00-0xff).
#[rustfmt::skip]
pub const KEYBOARD_REPORT_DESCRIPTOR: [u8; 65] = [
    0x05, 0x01, 0x09, 0x06, 0xa1,
    0x01, 0x05, 0x07, 0x19, 0xe0,
    0x29, 0xe7, 0x15, 0x00, 0x25,
    0x01, 0x75, 0x01, 0x95, 0x08,
    0x81, 0x02, 0x95, 0x01, 0x75,
    0x08, 0x81, 0x01, 0x95, 0x05,
    0x75, 0x01, 0x05, 0x08, 0x19,
    0x01, 0x29, 0x05, 0x91, 0x02,
    0x95, 0x01, 0x75, 0x03, 0x91,
    0x01, 0x95, 0x06, 0x75, 0x08,
    0x15, 0x00, 0x26, 0xff, 0x00,
    0x05, 0x07, 0x19, 0x00, 0x2a,
    0xff, 0x00, 0x81, 0x00, 0xc0,
];

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while talking to the uhid device file
#[derive(Debug, Error)]
pub enum UhidError {
    /// The device file could not be opened
    #[error("cannot open uhid device file '{path}': {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The kernel rejected the write
    #[error("cannot write to uhid: {0}")]
    Write(#[source] std::io::Error),

    /// The kernel accepted fewer bytes than one full event
    #[error("wrong size written to uhid device file: {written} != {expected}")]
    ShortWrite { written: usize, expected: usize },

    /// The device name does not fit the kernel's name field
    #[error("device name is {len} bytes, at most {max} are allowed")]
    NameTooLong { len: usize, max: usize },

    /// A textual report could not be parsed
    #[error("invalid hex byte '{0}'")]
    InvalidHex(String),
}

// ============================================================================
// HID reports
// ============================================================================

/// One instant of keyboard state: modifier bitmask, reserved byte and up to
/// six pressed key usages.
///
/// `size` counts how many leading bytes are meaningful; it is what the kernel
/// receives as the input report length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HidReport {
    data: [u8; HidReport::LEN],
    size: usize,
}

impl HidReport {
    /// Length of a boot keyboard input report
    pub const LEN: usize = 8;

    /// Build a press report from raw request bytes.
    ///
    /// Bytes map positionally into the report; anything past the eighth byte
    /// is ignored.
    pub fn from_request(bytes: &[u8]) -> Self {
        let mut data = [0u8; Self::LEN];
        let size = bytes.len().min(Self::LEN);
        data[..size].copy_from_slice(&bytes[..size]);
        Self { data, size }
    }

    /// The "all keys up" report
    pub fn released() -> Self {
        Self {
            data: [0u8; Self::LEN],
            size: Self::LEN,
        }
    }

    /// Parse a line of whitespace-separated hex bytes such as `02 00 04 00 00 00 00 00`.
    ///
    /// Tokens past the eighth are dropped with a warning.
    pub fn parse_hex(line: &str) -> Result<Self, UhidError> {
        let mut bytes = Vec::with_capacity(Self::LEN);
        for token in line.split_whitespace() {
            let digits = token
                .strip_prefix("0x")
                .or_else(|| token.strip_prefix("0X"))
                .unwrap_or(token);
            let byte = u8::from_str_radix(digits, 16)
                .map_err(|_| UhidError::InvalidHex(token.to_string()))?;
            bytes.push(byte);
        }

        if bytes.len() > Self::LEN {
            tracing::warn!(
                "Report has {} bytes, truncating to {}",
                bytes.len(),
                Self::LEN
            );
        }

        Ok(Self::from_request(&bytes))
    }

    /// The meaningful bytes of the report
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.size]
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

// ============================================================================
// Wire encoding
// ============================================================================

/// A request to the uhid device file
#[derive(Debug, Clone, Copy)]
pub enum UhidRequest<'a> {
    Create(&'a DeviceConfig),
    Input(&'a HidReport),
    Destroy,
}

impl UhidRequest<'_> {
    /// Encode into a zero-filled `struct uhid_event`
    pub fn encode(&self) -> Result<Vec<u8>, UhidError> {
        let mut buf = vec![0u8; UHID_EVENT_SIZE];

        match self {
            UhidRequest::Create(device) => {
                let name = device.name.as_bytes();
                // The kernel expects a NUL terminator inside the 128-byte field
                if name.len() > MAX_DEVICE_NAME_LEN {
                    return Err(UhidError::NameTooLong {
                        len: name.len(),
                        max: MAX_DEVICE_NAME_LEN,
                    });
                }

                put(&mut buf, 0, &UHID_CREATE2.to_ne_bytes());
                put(&mut buf, CREATE2_NAME, name);
                put(
                    &mut buf,
                    CREATE2_RD_SIZE,
                    &(KEYBOARD_REPORT_DESCRIPTOR.len() as u16).to_ne_bytes(),
                );
                put(&mut buf, CREATE2_BUS, &BUS_USB.to_ne_bytes());
                put(&mut buf, CREATE2_VENDOR, &device.vendor.to_ne_bytes());
                put(&mut buf, CREATE2_PRODUCT, &device.product.to_ne_bytes());
                put(&mut buf, CREATE2_VERSION, &device.version.to_ne_bytes());
                put(&mut buf, CREATE2_COUNTRY, &device.country.to_ne_bytes());
                put(&mut buf, CREATE2_RD_DATA, &KEYBOARD_REPORT_DESCRIPTOR);
            }
            UhidRequest::Input(report) => {
                put(&mut buf, 0, &UHID_INPUT2.to_ne_bytes());
                put(&mut buf, INPUT2_SIZE, &(report.size() as u16).to_ne_bytes());
                put(&mut buf, INPUT2_DATA, report.as_bytes());
            }
            UhidRequest::Destroy => {
                put(&mut buf, 0, &UHID_DESTROY.to_ne_bytes());
            }
        }

        Ok(buf)
    }
}

fn put(buf: &mut [u8], offset: usize, bytes: &[u8]) {
    buf[offset..offset + bytes.len()].copy_from_slice(bytes);
}

// ============================================================================
// Report sink
// ============================================================================

/// Destination for keyboard reports.
///
/// The relay worker writes through this trait so it can be driven without a
/// kernel device.
pub trait ReportSink {
    /// Send one input report
    fn inject(&mut self, report: &HidReport) -> Result<(), UhidError>;

    /// Send the "all keys up" report
    fn release(&mut self) -> Result<(), UhidError> {
        self.inject(&HidReport::released())
    }
}

// ============================================================================
// Device
// ============================================================================

/// The emulated keyboard.
///
/// The kernel device exists from [`UhidDevice::create`] until
/// [`UhidDevice::destroy`] (or drop).
pub struct UhidDevice {
    file: File,
    path: PathBuf,
    destroyed: bool,
}

impl UhidDevice {
    /// Open the uhid device file and create the keyboard.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened, the device name is too
    /// long, or the kernel rejects the create request.
    pub fn create(path: &Path, device: &DeviceConfig) -> Result<Self, UhidError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(path)
            .map_err(|source| UhidError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        let mut uhid = Self {
            file,
            path: path.to_path_buf(),
            // Nothing to destroy until the create request went through
            destroyed: true,
        };

        uhid.write_request(&UhidRequest::Create(device))?;
        uhid.destroyed = false;

        tracing::info!(
            "Created virtual keyboard '{}' ({:04x}:{:04x}) via {}",
            device.name,
            device.vendor,
            device.product,
            path.display()
        );

        Ok(uhid)
    }

    /// Path of the uhid device file this keyboard was created through
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the keyboard from the kernel
    pub fn destroy(mut self) -> Result<(), UhidError> {
        self.destroy_inner()
    }

    fn destroy_inner(&mut self) -> Result<(), UhidError> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;
        self.write_request(&UhidRequest::Destroy)?;
        tracing::info!("Destroyed virtual keyboard");
        Ok(())
    }

    fn write_request(&mut self, request: &UhidRequest<'_>) -> Result<(), UhidError> {
        let buf = request.encode()?;
        let written = self.file.write(&buf).map_err(UhidError::Write)?;
        if written != buf.len() {
            return Err(UhidError::ShortWrite {
                written,
                expected: buf.len(),
            });
        }
        Ok(())
    }
}

impl ReportSink for UhidDevice {
    fn inject(&mut self, report: &HidReport) -> Result<(), UhidError> {
        tracing::trace!("Injecting report {:02x?}", report.as_bytes());
        self.write_request(&UhidRequest::Input(report))
    }
}

impl Drop for UhidDevice {
    fn drop(&mut self) {
        if let Err(e) = self.destroy_inner() {
            tracing::warn!("Failed to destroy virtual keyboard on shutdown: {}", e);
        }
    }
}
