use crate::capture_models::ConnectionTarget;
use crate::terminal::TerminalError;
use crate::transport::{SerialTransport, TcpTransport, Transport, TransportError};
use serialport::{SerialPortType, UsbPortInfo};
use std::time::Duration;

/// USB vendor/product pairs of supported analyzers
const KNOWN_USB_IDS: [(u16, u16); 2] = [(0x1209, 0x3020), (0x2E8A, 0x000A)];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyzerDevice {
    pub name: String,
    pub port: String,
}

impl AnalyzerDevice {
    pub fn new(name: String, port: String) -> Self {
        Self { name, port }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Handshake timed out: {0}")]
    Timeout(TerminalError),

    #[error("Handshake failed: {0}")]
    Terminal(TerminalError),

    #[error("Handshake mismatch: expected {expected}, got '{actual}'")]
    HandshakeMismatch { expected: String, actual: String },

    #[error("Port {port} is not a supported logic analyzer")]
    InvalidPort { port: String },

    #[error("No logic analyzer {name} found. Please connect a device or specify the port manually")]
    DeviceNotFound { name: String },

    #[error("Connecting member device {device_id} failed: {source}")]
    Member {
        device_id: String,
        #[source]
        source: Box<ConnectionError>,
    },
}

impl From<TerminalError> for ConnectionError {
    fn from(error: TerminalError) -> Self {
        match error {
            TerminalError::Transport(e) => Self::Transport(e),
            e @ TerminalError::Timeout { .. } => Self::Timeout(e),
            e => Self::Terminal(e),
        }
    }
}

pub struct Connector;

impl Connector {
    /// Open a transport to the target.
    ///
    /// An empty serial port name selects the first discovered analyzer.
    pub fn open(
        target: &ConnectionTarget,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, ConnectionError> {
        match target {
            ConnectionTarget::Serial { port, baud_rate } => {
                let port = if port.is_empty() {
                    Self::find_port(None)?
                } else {
                    port.clone()
                };
                log::debug!("Connecting to logic analyzer on port {}", port);
                Ok(Box::new(SerialTransport::open(&port, *baud_rate)?))
            }
            ConnectionTarget::Network { host, port } => {
                Ok(Box::new(TcpTransport::connect(host, *port, timeout)?))
            }
        }
    }

    fn validate_device(name: Option<&str>, info: &UsbPortInfo) -> bool {
        if !KNOWN_USB_IDS.contains(&(info.vid, info.pid)) {
            return false;
        }

        match (name, info.product.as_deref()) {
            (Some(expected), Some(product)) => product == expected,
            (Some(_), None) => false,
            (None, _) => true,
        }
    }

    /// All serial ports that look like a supported analyzer
    pub fn available_devices(name: Option<&str>) -> Result<Vec<AnalyzerDevice>, ConnectionError> {
        let ports = serialport::available_ports().map_err(TransportError::from)?;

        let devices = ports
            .into_iter()
            .filter_map(|port| match &port.port_type {
                SerialPortType::UsbPort(info) if Self::validate_device(name, info) => {
                    Some(AnalyzerDevice::new(
                        info.product
                            .clone()
                            .unwrap_or_else(|| "Logic Analyzer".to_string()),
                        port.port_name.clone(),
                    ))
                }
                _ => None,
            })
            .collect();

        Ok(devices)
    }

    /// Port of the first analyzer matching `name`
    pub fn find_port(name: Option<&str>) -> Result<String, ConnectionError> {
        log::debug!("Searching for logic analyzer {:?}", name);

        Self::available_devices(name)?
            .into_iter()
            .next()
            .map(|device| device.port)
            .ok_or_else(|| ConnectionError::DeviceNotFound {
                name: name.unwrap_or("any").to_string(),
            })
    }

    /// Check that `port` belongs to a supported analyzer
    pub fn validate_port(name: Option<&str>, port: &str) -> Result<(), ConnectionError> {
        let devices = Self::available_devices(name)?;

        if !devices.iter().any(|d| d.port == port) {
            return Err(ConnectionError::InvalidPort {
                port: port.to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usb_info(vid: u16, pid: u16, product: Option<&str>) -> UsbPortInfo {
        UsbPortInfo {
            vid,
            pid,
            serial_number: None,
            manufacturer: None,
            product: product.map(str::to_string),
        }
    }

    #[test]
    fn test_device_validation() {
        assert!(Connector::validate_device(None, &usb_info(0x1209, 0x3020, None)));
        assert!(!Connector::validate_device(None, &usb_info(0x0403, 0x6001, None)));
        assert!(Connector::validate_device(
            Some("LogicAnalyzer"),
            &usb_info(0x1209, 0x3020, Some("LogicAnalyzer"))
        ));
        assert!(!Connector::validate_device(
            Some("LogicAnalyzer"),
            &usb_info(0x1209, 0x3020, None)
        ));
    }

    #[test]
    fn test_get_available_devices() {
        // Depends on what is plugged into the machine running the tests
        match Connector::available_devices(None) {
            Ok(devices) => {
                for device in devices {
                    assert!(!device.name.is_empty());
                    assert!(!device.port.is_empty());
                }
            }
            Err(ConnectionError::Transport(_)) => {}
            Err(e) => panic!("Unexpected error: {:?}", e),
        }
    }

    #[test]
    fn test_terminal_timeout_maps_to_connection_timeout() {
        let error: ConnectionError = TerminalError::Timeout {
            expected: "line".to_string(),
            actual: String::new(),
        }
        .into();
        assert!(matches!(error, ConnectionError::Timeout(_)));
    }
}
