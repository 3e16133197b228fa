//! Serial port backend for physical printers

use super::line::{DataBits, FlowControl, LineConfig, Parity};
use super::{Interface, LinkBackend, LinkFactory, Received, TransportError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serialport::{ClearBuffer, SerialPort, SerialPortType};
use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// USB vendor/product ids of the printer's virtual COM port
pub const PRINTER_USB_IDS: [(u16, u16); 2] = [(0x0483, 0x0001), (0x0483, 0x5740)];

const READ_CHUNK: usize = 4096;

/// Where to find the port for an interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PortSpec {
    /// Explicit device path (COM3, /dev/ttyUSB0)
    Path(String),
    /// Find the printer's USB VID/PID
    Auto,
}

impl FromStr for PortSpec {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("auto") {
            Ok(Self::Auto)
        } else if s.is_empty() {
            Err(TransportError::UnknownInterface(String::new()))
        } else {
            Ok(Self::Path(s.to_string()))
        }
    }
}

impl TryFrom<String> for PortSpec {
    type Error = TransportError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PortSpec> for String {
    fn from(spec: PortSpec) -> Self {
        spec.to_string()
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => write!(f, "{path}"),
            Self::Auto => write!(f, "auto"),
        }
    }
}

/// Serial port on the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    /// Device name
    pub name: String,
    /// Kind of port ("USB", "PCI", "Bluetooth", "Unknown")
    pub kind: String,
    /// USB vendor id
    pub vid: Option<u16>,
    /// USB product id
    pub pid: Option<u16>,
    /// USB product string
    pub product: Option<String>,
}

impl PortInfo {
    /// Whether this is the printer's USB virtual COM port
    pub fn is_printer(&self) -> bool {
        match (self.vid, self.pid) {
            (Some(vid), Some(pid)) => PRINTER_USB_IDS.contains(&(vid, pid)),
            _ => false,
        }
    }
}

impl From<serialport::SerialPortInfo> for PortInfo {
    fn from(info: serialport::SerialPortInfo) -> Self {
        match info.port_type {
            SerialPortType::UsbPort(usb) => Self {
                name: info.port_name,
                kind: "USB".to_string(),
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                product: usb.product,
            },
            other => Self {
                name: info.port_name,
                kind: match other {
                    SerialPortType::PciPort => "PCI",
                    SerialPortType::BluetoothPort => "Bluetooth",
                    _ => "Unknown",
                }
                .to_string(),
                vid: None,
                pid: None,
                product: None,
            },
        }
    }
}

/// List available serial ports
pub fn list_ports() -> Result<Vec<PortInfo>, TransportError> {
    let ports = serialport::available_ports().map_err(|e| TransportError::IoError(e.into()))?;
    Ok(ports.into_iter().map(PortInfo::from).collect())
}

/// Pick the single port matching the printer's USB ids
pub fn find_printer_port(ports: &[PortInfo]) -> Result<String, TransportError> {
    let candidates: Vec<&PortInfo> = ports.iter().filter(|p| p.is_printer()).collect();
    match candidates.as_slice() {
        [port] => Ok(port.name.clone()),
        [] => Err(TransportError::InterfaceUnavailable {
            interface: Interface::Usb,
            reason: "no printer found on USB".to_string(),
        }),
        many => Err(TransportError::InterfaceUnavailable {
            interface: Interface::Usb,
            reason: format!(
                "{} printers found on USB: {}",
                many.len(),
                many.iter().map(|p| p.name.as_str()).collect::<Vec<_>>().join(", ")
            ),
        }),
    }
}

fn serial_error(interface: Interface, port: &str, e: &serialport::Error) -> TransportError {
    let reason = match e.kind() {
        serialport::ErrorKind::NoDevice => format!("{port}: no such device"),
        serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
            format!("{port}: permission denied")
        }
        _ => format!("{port}: {e}"),
    };
    TransportError::InterfaceUnavailable { interface, reason }
}

/// Physical serial port
pub struct SerialLink {
    interface: Interface,
    name: String,
    config: LineConfig,
    port: Option<Box<dyn SerialPort + Send>>,
}

impl SerialLink {
    /// Open a port with the default line configuration
    pub fn open(interface: Interface, name: &str) -> Result<Self, TransportError> {
        let config = LineConfig::DEFAULT;
        let port = serialport::new(name, config.baud_rate.bits_per_second())
            .data_bits(data_bits(config.data_bits()))
            .parity(parity(config.parity()))
            .flow_control(flow_control(config.flow_control))
            .timeout(Duration::from_millis(10))
            .open()
            .map_err(|e| serial_error(interface, name, &e))?;

        debug!("Opened {} on {}", interface, name);

        Ok(Self {
            interface,
            name: name.to_string(),
            config,
            port: Some(port),
        })
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort + Send>, TransportError> {
        self.port
            .as_mut()
            .ok_or(TransportError::AlreadyClosed(self.interface))
    }
}

fn data_bits(bits: DataBits) -> serialport::DataBits {
    match bits {
        DataBits::Seven => serialport::DataBits::Seven,
        DataBits::Eight => serialport::DataBits::Eight,
    }
}

fn parity(parity: Parity) -> serialport::Parity {
    match parity {
        Parity::None => serialport::Parity::None,
        Parity::Even => serialport::Parity::Even,
        Parity::Odd => serialport::Parity::Odd,
    }
}

fn flow_control(flow: FlowControl) -> serialport::FlowControl {
    match flow {
        FlowControl::None => serialport::FlowControl::None,
        FlowControl::Hardware => serialport::FlowControl::Hardware,
        FlowControl::Software => serialport::FlowControl::Software,
    }
}

fn io_error(e: serialport::Error) -> TransportError {
    TransportError::IoError(e.into())
}

impl LinkBackend for SerialLink {
    fn apply(&mut self, config: &LineConfig) -> Result<(), TransportError> {
        let port = self.port()?;
        port.set_baud_rate(config.baud_rate.bits_per_second())
            .map_err(io_error)?;
        port.set_data_bits(data_bits(config.data_bits()))
            .map_err(io_error)?;
        port.set_parity(parity(config.parity())).map_err(io_error)?;
        port.set_flow_control(flow_control(config.flow_control))
            .map_err(io_error)?;
        self.config = *config;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let port = self.port()?;
        port.write_all(data)?;
        port.flush()?;
        Ok(data.len())
    }

    fn read(&mut self) -> Result<Received, TransportError> {
        let port = self.port()?;
        let available = port.bytes_to_read().map_err(io_error)? as usize;
        if available == 0 {
            return Ok(Received::default());
        }

        let mut buffer = vec![0u8; available.min(READ_CHUNK)];
        match port.read(&mut buffer) {
            Ok(n) => {
                buffer.truncate(n);
                // The OS driver drops parity and framing errors silently
                Ok(Received {
                    data: Bytes::from(buffer),
                    errors: Default::default(),
                })
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(Received::default()),
            Err(e) => Err(TransportError::IoError(e)),
        }
    }

    fn discard_input(&mut self) -> Result<(), TransportError> {
        self.port()?.clear(ClearBuffer::Input).map_err(io_error)
    }

    fn shutdown(&mut self) -> Result<(), TransportError> {
        if self.port.take().is_some() {
            debug!("Closed {} on {}", self.interface, self.name);
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("{} @ {}", self.name, self.config)
    }
}

/// Physical ports for each interface of the device under test
#[derive(Debug, Clone, Default)]
pub struct HardwarePorts {
    ports: HashMap<Interface, PortSpec>,
}

impl HardwarePorts {
    /// No ports assigned
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign a port to an interface
    #[must_use]
    pub fn with_port(mut self, interface: Interface, spec: PortSpec) -> Self {
        self.ports.insert(interface, spec);
        self
    }

    /// Port assigned to an interface
    pub fn port(&self, interface: Interface) -> Option<&PortSpec> {
        self.ports.get(&interface)
    }

    fn resolve(&self, interface: Interface) -> Result<String, TransportError> {
        match self.ports.get(&interface) {
            Some(PortSpec::Path(path)) => Ok(path.clone()),
            Some(PortSpec::Auto) if interface == Interface::Usb => {
                find_printer_port(&list_ports()?)
            }
            Some(PortSpec::Auto) => Err(TransportError::InterfaceUnavailable {
                interface,
                reason: "auto detection only works for USB".to_string(),
            }),
            None => Err(TransportError::InterfaceUnavailable {
                interface,
                reason: "no port configured".to_string(),
            }),
        }
    }
}

impl LinkFactory for HardwarePorts {
    fn connect(&self, interface: Interface) -> Result<Box<dyn LinkBackend>, TransportError> {
        let name = self.resolve(interface)?;
        Ok(Box::new(SerialLink::open(interface, &name)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usb(name: &str, vid: u16, pid: u16) -> PortInfo {
        PortInfo {
            name: name.to_string(),
            kind: "USB".to_string(),
            vid: Some(vid),
            pid: Some(pid),
            product: None,
        }
    }

    #[test]
    fn test_port_spec_parsing() {
        assert_eq!("auto".parse::<PortSpec>().unwrap(), PortSpec::Auto);
        assert_eq!("AUTO".parse::<PortSpec>().unwrap(), PortSpec::Auto);
        assert_eq!(
            "/dev/ttyUSB0".parse::<PortSpec>().unwrap(),
            PortSpec::Path("/dev/ttyUSB0".to_string())
        );
        assert!("".parse::<PortSpec>().is_err());
    }

    #[test]
    fn test_find_single_printer() {
        let ports = vec![
            usb("/dev/ttyUSB0", 0x0403, 0x6001),
            usb("/dev/ttyACM0", 0x0483, 0x5740),
        ];
        assert_eq!(find_printer_port(&ports).unwrap(), "/dev/ttyACM0");
    }

    #[test]
    fn test_no_or_many_printers_is_unavailable() {
        let none = vec![usb("/dev/ttyUSB0", 0x0403, 0x6001)];
        assert!(matches!(
            find_printer_port(&none),
            Err(TransportError::InterfaceUnavailable { interface: Interface::Usb, .. })
        ));

        let many = vec![
            usb("/dev/ttyACM0", 0x0483, 0x0001),
            usb("/dev/ttyACM1", 0x0483, 0x5740),
        ];
        let err = find_printer_port(&many).unwrap_err();
        assert!(err.to_string().contains("2 printers"));
    }

    #[test]
    fn test_unconfigured_interface_is_unavailable() {
        let ports = HardwarePorts::new().with_port(Interface::Rs232, PortSpec::Auto);
        assert!(matches!(
            ports.connect(Interface::Infrared),
            Err(TransportError::InterfaceUnavailable { .. })
        ));
        assert!(matches!(
            ports.connect(Interface::Rs232),
            Err(TransportError::InterfaceUnavailable { .. })
        ));
    }
}
