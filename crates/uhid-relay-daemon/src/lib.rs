//! uhid-relay daemon library
//!
//! Emulates a USB boot keyboard through the kernel's uhid interface, injects
//! HID reports received over TCP and echoes back the text the X server
//! resolved them to.
//!
//! ## Architecture
//!
//! - [`uhid`]: virtual device lifecycle and the uhid wire format
//! - [`capture`]: X11 worker that turns the device's key presses into text
//! - [`queue`]: bounded drop-oldest queue between the capture and relay workers
//! - [`relay`]: serial TCP server driving one request/response cycle at a time

pub mod capture;
pub mod queue;
pub mod relay;
pub mod uhid;
