//! TinyG device enumeration.
//!
//! A dual-channel controller shows up as two adjacent serial devices: the
//! command port (manufacturer "Synthetos", or "FTDI" for older boards)
//! followed by a data port that usually carries no manufacturer string of
//! its own. Grouping is heuristic: a bare port directly after a candidate
//! with a matching USB serial number (or an adjacent numeric path suffix)
//! is taken as that candidate's data channel.

use once_cell::sync::Lazy;
use regex::Regex;
use serialport::{SerialPortInfo, SerialPortType};
use tracing::debug;

use crate::error::{Result, TinygError};

#[allow(clippy::unwrap_used)]
static PATH_SUFFIX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(.*?)([0-9]+)$").unwrap());

/// One detected controller: the command port and, when paired, its
/// high-volume data port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedTinyg {
    pub path: String,
    pub data_port_path: Option<String>,
}

/// Normalized view of a serial device, independent of the platform's
/// enumeration quirks. Public so pairing can be unit-tested without
/// hardware.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortDescriptor {
    pub path: String,
    pub manufacturer: Option<String>,
    pub serial_number: Option<String>,
    pub product: Option<String>,
}

impl From<SerialPortInfo> for PortDescriptor {
    fn from(info: SerialPortInfo) -> Self {
        match info.port_type {
            SerialPortType::UsbPort(usb) => Self {
                path: info.port_name,
                manufacturer: usb.manufacturer,
                serial_number: usb.serial_number,
                product: usb.product,
            },
            _ => Self {
                path: info.port_name,
                ..Default::default()
            },
        }
    }
}

/// Enumerate connected TinyGs, pairing command and data ports.
pub fn list() -> Result<Vec<DetectedTinyg>> {
    let ports = serialport::available_ports()
        .map_err(|err| TinygError::Transport(format!("port enumeration failed: {err}")))?;
    let found = pair_ports(ports.into_iter().map(PortDescriptor::from).collect());
    debug!(count = found.len(), "tinyg enumeration finished");
    Ok(found)
}

/// Group a command-port entry with its adjacent data-port entry.
pub fn pair_ports(ports: Vec<PortDescriptor>) -> Vec<DetectedTinyg> {
    let mut found: Vec<(DetectedTinyg, Option<String>)> = Vec::new();

    for port in ports {
        if is_command_candidate(&port) {
            found.push((
                DetectedTinyg {
                    path: port.path,
                    data_port_path: None,
                },
                port.serial_number,
            ));
            continue;
        }

        // A nondescript port right after a candidate may be its data
        // channel; require a matching serial number or an adjacent path.
        if let Some((device, serial)) = found.last_mut() {
            if device.data_port_path.is_none()
                && (serials_match(serial.as_deref(), port.serial_number.as_deref())
                    || adjacent_paths(&device.path, &port.path))
            {
                device.data_port_path = Some(port.path);
            }
        }
    }

    found.into_iter().map(|(device, _)| device).collect()
}

fn is_command_candidate(port: &PortDescriptor) -> bool {
    let manufacturer = port.manufacturer.as_deref().unwrap_or("");
    if manufacturer.eq_ignore_ascii_case("synthetos") || manufacturer.eq_ignore_ascii_case("ftdi") {
        return true;
    }
    port.product
        .as_deref()
        .is_some_and(|p| p.to_ascii_lowercase().contains("tinyg"))
}

fn serials_match(a: Option<&str>, b: Option<&str>) -> bool {
    matches!((a, b), (Some(a), Some(b)) if !a.is_empty() && a == b)
}

/// Same path prefix with a numeric suffix at most two interfaces away
/// (`ttyACM0`/`ttyACM1`, `usbmodem001`/`usbmodem003`).
fn adjacent_paths(command: &str, data: &str) -> bool {
    let (Some(c), Some(d)) = (
        PATH_SUFFIX_RE.captures(command),
        PATH_SUFFIX_RE.captures(data),
    ) else {
        return false;
    };
    if c[1] != d[1] {
        return false;
    }
    let (Ok(cn), Ok(dn)) = (c[2].parse::<u64>(), d[2].parse::<u64>()) else {
        return false;
    };
    dn > cn && dn - cn <= 2
}
