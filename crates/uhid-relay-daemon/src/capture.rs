//! X11 capture of the virtual keyboard's key presses
//!
//! The capture worker finds the virtual keyboard among the X server's input
//! devices (XInput 1), selects its key press/release events on the root
//! window and resolves every press to text with `XLookupString`, i.e. with
//! the server's active layout and the current locale. Non-empty results are
//! pushed onto the [`RelayQueue`].
//!
//! Xlib blocks inside `XNextEvent`, so the worker owns a dedicated OS thread.
//! Setup failures are reported back through a oneshot channel; nothing here is
//! retried.

use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_uchar, c_uint, c_ulong};
use std::ptr::{null, null_mut};
use std::thread;

use nix::libc;
use thiserror::Error;
use tokio::sync::oneshot;
use uhid_relay_config::DeviceConfig;
use x11::xinput;
use x11::xlib;

use crate::queue::RelayQueue;

/// `KeyClass` from XI.h
const KEY_CLASS: u8 = 0;
/// `_deviceKeyPress` offset from the device's event type base
const DEVICE_KEY_PRESS: u8 = 0;
/// `_deviceKeyRelease` offset from the device's event type base
const DEVICE_KEY_RELEASE: u8 = 1;

/// Keysyms `0x0100_0000 + codepoint` map directly to Unicode
const UNICODE_KEYSYM_FLAG: c_ulong = 0x0100_0000;

const LOOKUP_BUFFER_LEN: usize = 256;

/// Fatal capture setup failures
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("cannot set default locale")]
    Locale,

    #[error("cannot open X display")]
    Display,

    #[error("cannot find {0}")]
    MissingExtension(&'static str),

    #[error("cannot find input device '{0}'")]
    DeviceNotFound(String),

    #[error("cannot open input device '{0}'")]
    DeviceOpen(String),

    #[error("input device '{0}' reports no key class")]
    NoKeyClass(String),

    #[error("cannot select key events for '{0}'")]
    Select(String),

    #[error("capture thread exited without reporting a result")]
    Vanished,
}

/// Handle to the running capture thread.
///
/// Resolves when the thread stops, which only happens on a setup failure.
pub struct CaptureHandle {
    result: oneshot::Receiver<Result<(), CaptureError>>,
}

impl CaptureHandle {
    /// Wait for the capture thread to stop and return why it stopped
    pub async fn wait(self) -> Result<(), CaptureError> {
        self.result.await.unwrap_or(Err(CaptureError::Vanished))
    }
}

/// Start the capture worker on its own thread.
///
/// # Errors
///
/// Returns an error only if the OS refuses to spawn the thread; capture
/// failures are delivered through [`CaptureHandle::wait`].
pub fn spawn(device: DeviceConfig, queue: RelayQueue) -> std::io::Result<CaptureHandle> {
    let (tx, rx) = oneshot::channel();

    thread::Builder::new()
        .name("capture".to_string())
        .spawn(move || {
            let result = run(&device, &queue);
            if let Err(ref e) = result {
                tracing::error!("Capture worker failed: {}", e);
            }
            let _ = tx.send(result);
        })?;

    Ok(CaptureHandle { result: rx })
}

/// Run the capture loop on the calling thread.
///
/// Only returns on a setup failure.
pub fn run(device: &DeviceConfig, queue: &RelayQueue) -> Result<(), CaptureError> {
    tracing::debug!("Started capture worker");

    // Device discovery in the kernel and X server is asynchronous
    thread::sleep(device.discovery_delay);

    // XLookupString honours the locale
    let locale = unsafe { libc::setlocale(libc::LC_ALL, c"".as_ptr()) };
    if locale.is_null() {
        return Err(CaptureError::Locale);
    }

    let display = Display::open()?;
    display.require_extension(c"XInputExtension", "XInputExtension")?;

    let device_id = display
        .find_device(&device.name)
        .ok_or_else(|| CaptureError::DeviceNotFound(device.name.clone()))?;
    tracing::debug!("Found '{}' as X input device {}", device.name, device_id);

    let classes = display.select_key_events(device_id, &device.name)?;

    tracing::info!("Capturing key presses of '{}'", device.name);

    loop {
        let event = display.next_event();

        handle_event(
            event.get_type(),
            &classes,
            || {
                // Device events are delivered in the generic XEvent union
                let key_event = unsafe { &*(&event as *const xlib::XEvent as *const XDeviceKeyEvent) };
                let (text, keysym) = display.lookup(key_event.state, key_event.keycode);

                tracing::debug!(
                    "Received key press [keycode: {}, keysym: {:#x}, state: {:#x}, text: {:?}]",
                    key_event.keycode,
                    keysym,
                    key_event.state,
                    text
                );
                text
            },
            queue,
        );
    }
}

/// Dispatch one X event; only presses that resolve to text reach the queue.
///
/// `resolve` is called for key presses only. Returns whether a fragment was
/// pushed.
fn handle_event<F>(event_type: c_int, classes: &KeyEventTypes, resolve: F, queue: &RelayQueue) -> bool
where
    F: FnOnce() -> String,
{
    if event_type == classes.press_type {
        let text = resolve();
        if text.is_empty() {
            return false;
        }
        queue.push(text);
        true
    } else {
        if event_type == classes.release_type {
            tracing::trace!("Received key release");
        }
        false
    }
}

// ============================================================================
// Xlib wrapper
// ============================================================================

/// `XDeviceKeyEvent` from XInput.h.
///
/// Same head as `XKeyEvent` but with the device id after `window`, which
/// shifts `state` and `keycode` by one XID.
#[repr(C)]
#[allow(dead_code)]
struct XDeviceKeyEvent {
    type_: c_int,
    serial: c_ulong,
    send_event: xlib::Bool,
    display: *mut xlib::Display,
    window: xlib::Window,
    deviceid: xlib::XID,
    root: xlib::Window,
    subwindow: xlib::Window,
    time: xlib::Time,
    x: c_int,
    y: c_int,
    x_root: c_int,
    y_root: c_int,
    state: c_uint,
    keycode: c_uint,
    same_screen: xlib::Bool,
    device_state: c_uint,
    axes_count: c_uchar,
    first_axis: c_uchar,
    axis_data: [c_int; 6],
}

/// Event types assigned to the device's key class
struct KeyEventTypes {
    press_type: c_int,
    release_type: c_int,
}

/// An open X display, closed on drop
struct Display {
    raw: *mut xlib::Display,
}

impl Display {
    fn open() -> Result<Self, CaptureError> {
        let raw = unsafe { xlib::XOpenDisplay(null()) };
        if raw.is_null() {
            return Err(CaptureError::Display);
        }
        Ok(Self { raw })
    }

    fn require_extension(&self, name: &CStr, label: &'static str) -> Result<(), CaptureError> {
        let (mut opcode, mut event, mut error) = (0, 0, 0);
        let present = unsafe {
            xlib::XQueryExtension(self.raw, name.as_ptr(), &mut opcode, &mut event, &mut error)
        };
        if present == 0 {
            return Err(CaptureError::MissingExtension(label));
        }
        Ok(())
    }

    /// Look up an input device id by its exact name
    fn find_device(&self, name: &str) -> Option<c_ulong> {
        let mut count: c_int = 0;
        let infos = unsafe { xinput::XListInputDevices(self.raw, &mut count) };
        if infos.is_null() {
            return None;
        }

        let devices = unsafe { std::slice::from_raw_parts(infos, count.max(0) as usize) };
        let found = find_device_id(
            devices.iter().filter(|info| !info.name.is_null()).map(|info| {
                let device_name = unsafe { CStr::from_ptr(info.name) };
                (info.id, device_name.to_string_lossy())
            }),
            name,
        );

        unsafe { xinput::XFreeDeviceList(infos) };
        found
    }

    /// Open the device and select its key press/release events on the root window
    fn select_key_events(&self, device_id: c_ulong, name: &str) -> Result<KeyEventTypes, CaptureError> {
        let device = unsafe { xinput::XOpenDevice(self.raw, device_id) };
        if device.is_null() {
            return Err(CaptureError::DeviceOpen(name.to_string()));
        }

        let (id, classes) = unsafe {
            let device = &*device;
            let classes = if device.classes.is_null() {
                &[][..]
            } else {
                std::slice::from_raw_parts(device.classes, device.num_classes.max(0) as usize)
            };
            (device.device_id, classes)
        };

        let key_class = classes
            .iter()
            .find(|class| class.input_class == KEY_CLASS)
            .ok_or_else(|| CaptureError::NoKeyClass(name.to_string()))?;

        let press_type = key_class.event_type_base + DEVICE_KEY_PRESS;
        let release_type = key_class.event_type_base + DEVICE_KEY_RELEASE;
        let mut event_classes = [event_class(id, press_type), event_class(id, release_type)];

        let status = unsafe {
            let root = xlib::XDefaultRootWindow(self.raw);
            xinput::XSelectExtensionEvent(
                self.raw,
                root,
                event_classes.as_mut_ptr(),
                event_classes.len() as c_int,
            )
        };
        if status != 0 {
            return Err(CaptureError::Select(name.to_string()));
        }

        Ok(KeyEventTypes {
            press_type: press_type as c_int,
            release_type: release_type as c_int,
        })
    }

    fn next_event(&self) -> xlib::XEvent {
        let mut event: xlib::XEvent = unsafe { std::mem::zeroed() };
        unsafe { xlib::XNextEvent(self.raw, &mut event) };
        event
    }

    /// Resolve a keycode and modifier state to text with the active layout
    fn lookup(&self, state: c_uint, keycode: c_uint) -> (String, c_ulong) {
        let mut key_event: xlib::XKeyEvent = unsafe { std::mem::zeroed() };
        key_event.type_ = xlib::KeyPress;
        key_event.display = self.raw;
        key_event.state = state;
        key_event.keycode = keycode;

        let mut buf = [0 as c_char; LOOKUP_BUFFER_LEN];
        let mut keysym: xlib::KeySym = 0;
        let len = unsafe {
            xlib::XLookupString(
                &mut key_event,
                buf.as_mut_ptr(),
                buf.len() as c_int,
                &mut keysym,
                null_mut(),
            )
        };

        let len = (len.max(0) as usize).min(buf.len());
        let bytes: Vec<u8> = buf[..len].iter().map(|&c| c as u8).collect();
        (decode_lookup(&bytes, keysym), keysym)
    }
}

impl Drop for Display {
    fn drop(&mut self) {
        unsafe { xlib::XCloseDisplay(self.raw) };
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Event class for `XSelectExtensionEvent`, as built by the `DeviceKeyPress` macros
fn event_class(device_id: c_ulong, event_type: u8) -> c_ulong {
    (device_id << 8) | event_type as c_ulong
}

/// Pick the device with the given name; the last listed one wins
fn find_device_id<I, S>(devices: I, name: &str) -> Option<c_ulong>
where
    I: IntoIterator<Item = (c_ulong, S)>,
    S: AsRef<str>,
{
    devices
        .into_iter()
        .filter(|(_, device_name)| device_name.as_ref() == name)
        .map(|(id, _)| id)
        .last()
}

/// Turn `XLookupString` output into UTF-8 text.
///
/// Xlib returns Latin-1 bytes. Keysyms outside Latin-1 produce no bytes, so
/// Unicode keysyms are mapped to their code point instead.
fn decode_lookup(bytes: &[u8], keysym: c_ulong) -> String {
    if !bytes.is_empty() {
        return bytes.iter().map(|&b| b as char).collect();
    }

    if keysym & 0xff00_0000 == UNICODE_KEYSYM_FLAG {
        if let Some(c) = char::from_u32((keysym & 0x00ff_ffff) as u32) {
            return c.to_string();
        }
    }

    String::new()
}
