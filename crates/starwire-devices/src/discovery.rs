/*!
 * Serial port discovery.
 *
 * Enumerates the serial devices the host exposes and narrows them to the
 * ones an instrument could plausibly be attached to (USB-serial adapters,
 * ACM modems and RFCOMM links). Auto-search only tries these.
 */
use tracing::debug;

use crate::error::{DeviceError, Result};

/// Whether a port name matches any of the filters
///
/// An empty filter list matches everything.
pub fn matches_filter(port: &str, filters: &[String]) -> bool {
    filters.is_empty() || filters.iter().any(|f| port.contains(f.as_str()))
}

/// Ports that pass the filters, in enumeration order, without duplicates
pub fn filter_ports(available: &[String], filters: &[String]) -> Vec<String> {
    let mut ports: Vec<String> = Vec::new();
    for port in available {
        if matches_filter(port, filters) && !ports.contains(port) {
            ports.push(port.clone());
        }
    }
    ports
}

/// Auto-search candidates: filtered ports minus the one already tried
///
/// Returns an empty list unless the filtered enumeration holds more than one
/// port, since with a single port there is nothing else to try.
pub fn candidate_ports(available: &[String], filters: &[String], tried: &str) -> Vec<String> {
    let ports = filter_ports(available, filters);
    if ports.len() <= 1 {
        debug!("Only {} matching port(s), skipping auto-search", ports.len());
        return Vec::new();
    }
    ports.into_iter().filter(|p| p != tried).collect()
}

/// Enumerate the host's serial ports
#[cfg(feature = "serial")]
pub fn system_ports() -> Result<Vec<String>> {
    let ports = serialport::available_ports()
        .map_err(|e| DeviceError::connection(format!("Failed to enumerate serial ports: {}", e)))?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}

/// Enumerate the host's serial ports
#[cfg(not(feature = "serial"))]
pub fn system_ports() -> Result<Vec<String>> {
    Err(DeviceError::connection("Serial support is not enabled"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_filter_ports() {
        let available = names(&["/dev/ttyS0", "/dev/ttyUSB0", "/dev/ttyACM1", "/dev/ttyUSB0", "/dev/rfcomm0"]);
        let filters = names(&["ttyUSB", "ttyACM", "rfcomm"]);
        assert_eq!(
            filter_ports(&available, &filters),
            names(&["/dev/ttyUSB0", "/dev/ttyACM1", "/dev/rfcomm0"])
        );
        assert_eq!(filter_ports(&available, &[]).len(), 4);
    }

    #[test]
    fn test_candidates_exclude_tried_port() {
        let available = names(&["/dev/ttyUSB0", "/dev/ttyUSB1", "/dev/ttyUSB2"]);
        let filters = names(&["ttyUSB"]);
        assert_eq!(
            candidate_ports(&available, &filters, "/dev/ttyUSB1"),
            names(&["/dev/ttyUSB0", "/dev/ttyUSB2"])
        );
    }

    #[test]
    fn test_single_port_has_no_candidates() {
        let available = names(&["/dev/ttyS0", "/dev/ttyUSB0"]);
        let filters = names(&["ttyUSB"]);
        assert!(candidate_ports(&available, &filters, "/dev/ttyUSB9").is_empty());
    }
}
