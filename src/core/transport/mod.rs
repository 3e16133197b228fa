//! Serial transport layer
//!
//! Supports:
//! - USB virtual COM ports
//! - RS232 through a USB to RS232 adapter
//! - IrDA (SIR) infrared adapters
//! - An emulated printer bench for running the same flows without hardware

mod channel;
mod emulated;
pub mod line;
mod serial;
pub mod uart;

pub use channel::{Channel, ChannelStats, Echo, TransportManager};
pub use emulated::{EmulatedDevice, EmulatedLink};
pub use line::{BaudRate, DataBits, FlowControl, FrameFormat, LineConfig, LineConfigError, Parity};
pub use serial::{find_printer_port, list_ports, HardwarePorts, PortInfo, PortSpec, SerialLink, PRINTER_USB_IDS};
pub use uart::LineErrors;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Physical interface of the device under test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Interface {
    /// USB virtual COM port
    Usb,
    /// RS232 serial
    Rs232,
    /// IrDA infrared
    Infrared,
}

impl Interface {
    /// All interfaces
    pub const ALL: [Interface; 3] = [Self::Usb, Self::Rs232, Self::Infrared];

    /// Check that a line configuration can be realized on this interface
    pub fn validate(self, config: &LineConfig) -> Result<(), TransportError> {
        let unsupported = |reason: &str| TransportError::UnsupportedConfiguration {
            interface: self,
            config: *config,
            reason: reason.to_string(),
        };

        match self {
            Self::Usb | Self::Rs232 => Ok(()),
            Self::Infrared => {
                // IrDA SIR rates; 600..=1200 and 4800 are not defined
                if matches!(
                    config.baud_rate,
                    BaudRate::B600 | BaudRate::B1200 | BaudRate::B4800
                ) {
                    return Err(unsupported("IrDA SIR supports 2400 and 9600..=115200 baud"));
                }
                if config.data_bits() != DataBits::Eight {
                    return Err(unsupported("IrDA frames carry 8 data bits"));
                }
                if config.flow_control == FlowControl::Hardware {
                    return Err(unsupported("IrDA has no RTS/CTS lines"));
                }
                Ok(())
            }
        }
    }

    /// Whether the device applies line settings on this interface.
    /// A USB virtual COM port accepts any setting and ignores it.
    pub const fn has_line_settings(self) -> bool {
        !matches!(self, Self::Usb)
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Usb => write!(f, "USB"),
            Self::Rs232 => write!(f, "RS232"),
            Self::Infrared => write!(f, "IR"),
        }
    }
}

impl FromStr for Interface {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "usb" => Ok(Self::Usb),
            "rs232" | "serial" => Ok(Self::Rs232),
            "ir" | "irda" | "infrared" => Ok(Self::Infrared),
            _ => Err(TransportError::UnknownInterface(s.to_string())),
        }
    }
}

/// Transport error types
#[derive(Error, Debug)]
pub enum TransportError {
    /// Underlying resource could not be acquired
    #[error("{interface} interface unavailable: {reason}")]
    InterfaceUnavailable {
        /// Interface
        interface: Interface,
        /// Why
        reason: String,
    },

    /// Interface opened twice without a close
    #[error("{0} interface is already open")]
    AlreadyOpen(Interface),

    /// Operation on a closed channel
    #[error("{0} channel is closed")]
    AlreadyClosed(Interface),

    /// Line parameters not realizable on the interface
    #[error("{interface} cannot use {config}: {reason}")]
    UnsupportedConfiguration {
        /// Interface
        interface: Interface,
        /// Rejected configuration
        config: LineConfig,
        /// Why
        reason: String,
    },

    /// Unknown interface name
    #[error("Unknown interface: {0}")]
    UnknownInterface(String),

    /// A queued write failed in the background
    #[error("Write failed on {interface}: {reason}")]
    WriteFailed {
        /// Interface
        interface: Interface,
        /// Why
        reason: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Bytes read from a link together with the errors detected while receiving them
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Received {
    /// Data
    pub data: Bytes,
    /// Parity and framing errors
    pub errors: LineErrors,
}

impl Received {
    /// Nothing was available
    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.errors.is_clean()
    }
}

/// Byte-stream resource behind a channel
///
/// Calls are short and non-blocking; `read` returns whatever is available,
/// possibly nothing.
#[cfg_attr(test, mockall::automock)]
pub trait LinkBackend: Send {
    /// Apply line parameters on the test-system side
    fn apply(&mut self, config: &LineConfig) -> Result<(), TransportError>;

    /// Transmit bytes
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Read available bytes
    fn read(&mut self) -> Result<Received, TransportError>;

    /// Drop anything waiting in the input buffer
    fn discard_input(&mut self) -> Result<(), TransportError>;

    /// Release the resource
    fn shutdown(&mut self) -> Result<(), TransportError>;

    /// Human readable description of the resource
    fn describe(&self) -> String;
}

/// Source of link backends, one per interface
#[cfg_attr(test, mockall::automock)]
pub trait LinkFactory: Send + Sync {
    /// Acquire the resource behind an interface
    fn connect(&self, interface: Interface) -> Result<Box<dyn LinkBackend>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_names() {
        assert_eq!("usb".parse::<Interface>().unwrap(), Interface::Usb);
        assert_eq!("RS232".parse::<Interface>().unwrap(), Interface::Rs232);
        assert_eq!("IrDA".parse::<Interface>().unwrap(), Interface::Infrared);
        assert!("bluetooth".parse::<Interface>().is_err());
        assert_eq!(Interface::Infrared.to_string(), "IR");
    }

    #[test]
    fn test_infrared_capabilities() {
        let ir = Interface::Infrared;
        assert!(ir.validate(&LineConfig::DEFAULT).is_ok());
        assert!(ir
            .validate(&LineConfig::new(BaudRate::B115200, DataBits::Eight, Parity::Even))
            .is_ok());

        let slow = LineConfig::new(BaudRate::B1200, DataBits::Eight, Parity::None);
        assert!(matches!(
            ir.validate(&slow),
            Err(TransportError::UnsupportedConfiguration { .. })
        ));

        let seven = LineConfig::new(BaudRate::B9600, DataBits::Seven, Parity::Odd);
        assert!(ir.validate(&seven).is_err());

        let rtscts = LineConfig::DEFAULT.flow_control(FlowControl::Hardware);
        assert!(ir.validate(&rtscts).is_err());
    }

    #[test]
    fn test_wired_interfaces_accept_everything() {
        for baud in BaudRate::ALL {
            for frame in FrameFormat::ALL {
                let config = LineConfig::with_frame(baud, frame);
                assert!(Interface::Rs232.validate(&config).is_ok());
                assert!(Interface::Usb.validate(&config).is_ok());
            }
        }
    }
}
