//! TCU command set
//!
//! Commands are ASCII with hex fields and end with CR. The TCU echoes every
//! command back in full before acting on it.
//!
//! | Command | Bytes |
//! |---------|-------|
//! | open relay | `O` relay CR |
//! | close relay | `C` relay CR |
//! | set channel | `S` channel value(4) CR |
//! | measure | `M` channel CR, answered with hex digits and CR |
//! | print | `P` length data CR |
//! | print with response | `W` length data CR, answered with the printer's reply |

use crate::core::transport::{BaudRate, DataBits, Interface, LineConfig, Parity};
use std::fmt;
use thiserror::Error;

/// Longest command the TCU buffers; its receive buffer wraps beyond this
pub const MAX_COMMAND_LEN: usize = 128;

/// Ends commands and responses
pub const TERMINATOR: u8 = b'\r';

/// TCU protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TcuProtocolError {
    /// Encoded command would overflow the TCU buffer
    #[error("Command is {0} bytes; the TCU buffers at most {MAX_COMMAND_LEN}")]
    CommandTooLong(usize),

    /// Bytes that are not a TCU command
    #[error("Malformed TCU command: {0:?}")]
    MalformedCommand(String),

    /// Measurement that is not hex digits
    #[error("Malformed TCU response: {0:?}")]
    MalformedResponse(String),

    /// Line setting the TCU cannot produce
    #[error("The TCU cannot drive {0}")]
    UnsupportedLine(LineConfig),
}

/// Relays and set channels
///
/// Single relays are switched with open/close or set to 0/1. The `*Bit*`
/// relays are bits of a bitfield; the `*Set` channels take whole values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum RelayChannel {
    /// Connect the battery supply
    BatteryConnect = 0x00,
    /// Battery supply at 4.45 V
    BatteryVoltage4V45 = 0x01,
    /// Route supply current through the meter
    CurrentMeasureEnable = 0x02,
    /// Connect battery and charger
    ChargerConnect = 0x04,
    /// Charger limited to 8 V
    ChargerLimit8V = 0x05,
    /// Charger limited to 12 V
    ChargerLimit12V = 0x06,
    /// Charger limited to 17 V
    ChargerLimit17V = 0x07,
    /// Comms mode, bit 0
    CommsModeBit0 = 0x0C,
    /// Comms mode, bit 1
    CommsModeBit1 = 0x0D,
    /// Comms mode, bit 2
    CommsModeBit2 = 0x0E,
    /// Comms mode, bit 3
    CommsModeBit3 = 0x0F,
    /// Baud rate index, bit 0
    BaudRateBit0 = 0x10,
    /// Baud rate index, bit 1
    BaudRateBit1 = 0x11,
    /// Baud rate index, bit 2
    BaudRateBit2 = 0x12,
    /// Parity on; see `ParitySetEven`
    ParityEnable = 0x13,
    /// Even parity when closed, odd when open
    ParitySetEven = 0x14,
    /// Protocol select, bit 0
    ProtocolBit0 = 0x18,
    /// Protocol select, bit 1
    ProtocolBit1 = 0x19,
    /// Seven data bits when closed, eight when open
    DataBitsSet7 = 0x1A,
    /// Space/mark parity
    ParitySetSpaceMark = 0x1B,
    /// Baud rate index, bit 3
    BaudRateBit3 = 0x1C,
    /// Charger limited to 5 V
    ChargerLimit5V = 0x1D,
    /// Battery supply voltage in mV
    BatteryVoltageSet = 0x20,
    /// Battery supply on
    BatteryEnable = 0x21,
    /// Battery current limit on
    BatteryCurrentLimitEnable = 0x22,
    /// Battery overcurrent trip off
    BatteryTripDisable = 0x23,
    /// Charger supply voltage in mV
    ChargerVoltageSet = 0x30,
    /// Charger supply on
    ChargerEnable = 0x31,
    /// Charger current limit on
    ChargerCurrentLimitEnable = 0x32,
    /// Charger overcurrent trip off
    ChargerTripDisable = 0x33,
    /// Comms mode as a whole value, see [`CommsMode`]
    CommsModeSet = 0x40,
    /// Baud rate in hundreds of bits per second
    BaudRateSet = 0x41,
}

impl RelayChannel {
    /// Every relay and channel the TCU knows
    pub const ALL: [RelayChannel; 32] = [
        Self::BatteryConnect,
        Self::BatteryVoltage4V45,
        Self::CurrentMeasureEnable,
        Self::ChargerConnect,
        Self::ChargerLimit8V,
        Self::ChargerLimit12V,
        Self::ChargerLimit17V,
        Self::CommsModeBit0,
        Self::CommsModeBit1,
        Self::CommsModeBit2,
        Self::CommsModeBit3,
        Self::BaudRateBit0,
        Self::BaudRateBit1,
        Self::BaudRateBit2,
        Self::ParityEnable,
        Self::ParitySetEven,
        Self::ProtocolBit0,
        Self::ProtocolBit1,
        Self::DataBitsSet7,
        Self::ParitySetSpaceMark,
        Self::BaudRateBit3,
        Self::ChargerLimit5V,
        Self::BatteryVoltageSet,
        Self::BatteryEnable,
        Self::BatteryCurrentLimitEnable,
        Self::BatteryTripDisable,
        Self::ChargerVoltageSet,
        Self::ChargerEnable,
        Self::ChargerCurrentLimitEnable,
        Self::ChargerTripDisable,
        Self::CommsModeSet,
        Self::BaudRateSet,
    ];

    /// Comms mode bitfield, least significant bit first
    pub const COMMS_MODE_BITS: [RelayChannel; 4] =
        [Self::CommsModeBit0, Self::CommsModeBit1, Self::CommsModeBit2, Self::CommsModeBit3];

    /// Baud rate index bitfield, least significant bit first
    pub const BAUD_RATE_BITS: [RelayChannel; 4] =
        [Self::BaudRateBit0, Self::BaudRateBit1, Self::BaudRateBit2, Self::BaudRateBit3];

    /// Channel number on the wire
    pub const fn number(self) -> u8 {
        self as u8
    }

    /// Look up a relay by number
    pub fn from_number(number: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.number() == number)
    }

    /// Takes a value rather than open/closed
    pub const fn takes_value(self) -> bool {
        matches!(
            self,
            Self::BatteryVoltageSet | Self::ChargerVoltageSet | Self::CommsModeSet | Self::BaudRateSet
        )
    }
}

impl fmt::Display for RelayChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({:02X})", self, self.number())
    }
}

/// TCU measurement channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MeasureChannel {
    /// Battery supply current in mA
    BatteryCurrent = 0x00,
    /// Charger supply current in mA
    ChargerCurrent = 0x01,
    /// Level of the printer's CTS line
    CtsLevel = 0x02,
    /// Battery supply voltage in mV
    BatteryVoltage = 0x03,
    /// Battery voltage drop over 100 ms
    BatteryVoltageDrop100ms = 0x04,
    /// Battery voltage drop over 500 ms
    BatteryVoltageDrop500ms = 0x05,
    /// Battery voltage drop over 2 s
    BatteryVoltageDrop2s = 0x06,
    /// Battery voltage drop over 5 s
    BatteryVoltageDrop5s = 0x07,
    /// TCU firmware version
    FirmwareVersion = 0x08,
    /// TCU reference voltage in mV
    ReferenceVoltage = 0x09,
    /// TCU internal battery rail in mV
    InternalBatteryVoltage = 0x0A,
    /// TCU internal charger rail in mV
    InternalChargerVoltage = 0x0B,
    /// Bluetooth address, upper 16 bits
    BluetoothAddressUpper = 0x10,
    /// Bluetooth address, middle 16 bits
    BluetoothAddressMiddle = 0x11,
    /// Bluetooth address, lower 16 bits
    BluetoothAddressLower = 0x12,
    /// Non-zero once the Bluetooth address is known
    BluetoothAddressReady = 0x13,
    /// Connect to the printer with PIN 0
    BluetoothConnectPin0 = 0x14,
    /// Connect to the printer with PIN 1234
    BluetoothConnectPin1234 = 0x15,
    /// Connect to the printer with PIN 4254
    BluetoothConnectPin4254 = 0x16,
}

impl MeasureChannel {
    /// Every measurement channel
    pub const ALL: [MeasureChannel; 19] = [
        Self::BatteryCurrent,
        Self::ChargerCurrent,
        Self::CtsLevel,
        Self::BatteryVoltage,
        Self::BatteryVoltageDrop100ms,
        Self::BatteryVoltageDrop500ms,
        Self::BatteryVoltageDrop2s,
        Self::BatteryVoltageDrop5s,
        Self::FirmwareVersion,
        Self::ReferenceVoltage,
        Self::InternalBatteryVoltage,
        Self::InternalChargerVoltage,
        Self::BluetoothAddressUpper,
        Self::BluetoothAddressMiddle,
        Self::BluetoothAddressLower,
        Self::BluetoothAddressReady,
        Self::BluetoothConnectPin0,
        Self::BluetoothConnectPin1234,
        Self::BluetoothConnectPin4254,
    ];

    /// Channel number on the wire
    pub const fn number(self) -> u8 {
        self as u8
    }

    /// Channel with this number
    pub fn from_number(number: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.number() == number)
    }
}

/// How the TCU talks to the printer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommsMode {
    /// RS232 both ways
    Rs232 = 0,
    /// TTL serial both ways
    Ttl = 1,
    /// Receive on RS232, transmit on IrDA
    Rs232RxIrdaTx = 2,
    /// Receive on TTL, transmit on IrDA
    TtlRxIrdaTx = 3,
    /// Receive on RS232, transmit on HP infrared
    Rs232RxHpirTx = 4,
    /// Receive on TTL, transmit on HP infrared
    TtlRxHpirTx = 5,
    /// IrDA both ways
    Irda = 6,
    /// Receive on RS232, transmit on the parallel port
    Rs232RxParallelTx = 7,
    /// RS485
    Rs485 = 8,
    /// Bluetooth
    Bluetooth = 9,
}

impl CommsMode {
    /// Every mode
    pub const ALL: [CommsMode; 10] = [
        Self::Rs232,
        Self::Ttl,
        Self::Rs232RxIrdaTx,
        Self::TtlRxIrdaTx,
        Self::Rs232RxHpirTx,
        Self::TtlRxHpirTx,
        Self::Irda,
        Self::Rs232RxParallelTx,
        Self::Rs485,
        Self::Bluetooth,
    ];

    /// Mode selected by a channel value
    pub fn from_value(value: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|m| *m as u16 == value)
    }

    /// Printer interface the mode transmits on
    pub fn interface(self) -> Option<Interface> {
        match self {
            Self::Rs232 => Some(Interface::Rs232),
            Self::Irda | Self::Rs232RxIrdaTx | Self::TtlRxIrdaTx => Some(Interface::Infrared),
            _ => None,
        }
    }

    /// Mode that drives a printer interface, if any
    pub fn for_interface(interface: Interface) -> Option<Self> {
        match interface {
            Interface::Rs232 => Some(Self::Rs232),
            Interface::Infrared => Some(Self::Irda),
            Interface::Usb => None,
        }
    }
}

impl fmt::Display for CommsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Baud rates selected by the baud rate bitfield; unused indices fall back
/// to 9600
const BAUD_INDEX: [u32; 10] = [9600, 19200, 300, 600, 1200, 2400, 4800, 38400, 57600, 115_200];

/// Bits per second selected by a baud rate bitfield index
pub fn baud_for_index(index: u8) -> u32 {
    BAUD_INDEX.get(usize::from(index)).copied().unwrap_or(9600)
}

/// A TCU command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Open a relay, or clear a bitfield bit
    OpenRelay(u8),
    /// Close a relay, or set a bitfield bit
    CloseRelay(u8),
    /// Set a channel to a value
    SetChannel(u8, u16),
    /// Read a measurement channel
    Measure(u8),
    /// Forward bytes to the printer
    Print(Vec<u8>),
    /// Forward bytes and return the printer's CR-terminated reply
    PrintWithResponse(Vec<u8>),
}

impl Command {
    /// Bytes on the wire, terminator included
    pub fn encode(&self) -> Result<Vec<u8>, TcuProtocolError> {
        let text = match self {
            Self::OpenRelay(relay) => format!("O{relay:02X}"),
            Self::CloseRelay(relay) => format!("C{relay:02X}"),
            Self::SetChannel(channel, value) => format!("S{channel:02X}{value:04X}"),
            Self::Measure(channel) => format!("M{channel:02X}"),
            Self::Print(data) => forward_text('P', data)?,
            Self::PrintWithResponse(data) => forward_text('W', data)?,
        };
        let mut bytes = text.into_bytes();
        bytes.push(TERMINATOR);
        if bytes.len() > MAX_COMMAND_LEN {
            return Err(TcuProtocolError::CommandTooLong(bytes.len()));
        }
        Ok(bytes)
    }

    /// Parse a command line without its terminator
    pub fn parse(line: &[u8]) -> Result<Self, TcuProtocolError> {
        let malformed = || TcuProtocolError::MalformedCommand(String::from_utf8_lossy(line).into_owned());
        let (&letter, fields) = line.split_first().ok_or_else(malformed)?;
        let fields = hex::decode(fields).map_err(|_| malformed())?;

        match (letter, fields.as_slice()) {
            (b'O', &[relay]) => Ok(Self::OpenRelay(relay)),
            (b'C', &[relay]) => Ok(Self::CloseRelay(relay)),
            (b'S', &[channel, high, low]) => Ok(Self::SetChannel(channel, u16::from_be_bytes([high, low]))),
            (b'M', &[channel]) => Ok(Self::Measure(channel)),
            (b'P' | b'W', [len, data @ ..]) if usize::from(*len) == data.len() => {
                if letter == b'P' {
                    Ok(Self::Print(data.to_vec()))
                } else {
                    Ok(Self::PrintWithResponse(data.to_vec()))
                }
            }
            _ => Err(malformed()),
        }
    }

    /// Whether the TCU answers after the acknowledgement
    pub fn has_response(&self) -> bool {
        matches!(self, Self::Measure(_) | Self::PrintWithResponse(_))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpenRelay(relay) => write!(f, "open relay {relay:02X}"),
            Self::CloseRelay(relay) => write!(f, "close relay {relay:02X}"),
            Self::SetChannel(channel, value) => write!(f, "set channel {channel:02X} to {value}"),
            Self::Measure(channel) => write!(f, "measure channel {channel:02X}"),
            Self::Print(data) => write!(f, "print {} bytes", data.len()),
            Self::PrintWithResponse(data) => write!(f, "print {} bytes with response", data.len()),
        }
    }
}

fn forward_text(letter: char, data: &[u8]) -> Result<String, TcuProtocolError> {
    let len = u8::try_from(data.len()).map_err(|_| TcuProtocolError::CommandTooLong(data.len() * 2 + 4))?;
    Ok(format!("{letter}{len:02X}{}", hex::encode_upper(data)))
}

/// Channel settings that put the TCU's printer side on `config`
///
/// The TCU has no flow control; that part of `config` is not represented.
pub fn line_settings(config: &LineConfig) -> Result<Vec<(RelayChannel, u16)>, TcuProtocolError> {
    let hundreds = u16::try_from(config.baud_rate.bits_per_second() / 100)
        .map_err(|_| TcuProtocolError::UnsupportedLine(*config))?;

    let mut settings = vec![
        (RelayChannel::BaudRateSet, hundreds),
        (
            RelayChannel::DataBitsSet7,
            u16::from(config.frame.data_bits == DataBits::Seven),
        ),
    ];
    match config.frame.parity {
        Parity::None => settings.push((RelayChannel::ParityEnable, 0)),
        Parity::Even | Parity::Odd => {
            settings.push((RelayChannel::ParityEnable, 1));
            settings.push((RelayChannel::ParitySetEven, u16::from(config.frame.parity == Parity::Even)));
        }
    }
    Ok(settings)
}

/// Parse a measure response: hex digits, then CR
pub fn parse_measurement(response: &[u8]) -> Result<u32, TcuProtocolError> {
    let text = String::from_utf8_lossy(response);
    let digits = text.trim_end_matches(['\r', '\n']).trim();
    u32::from_str_radix(digits, 16).map_err(|_| TcuProtocolError::MalformedResponse(text.into_owned()))
}

/// Line the TCU drives given its baud rate and frame relays
pub fn line_from_settings(bits_per_second: u32, seven_bits: bool, parity: Option<bool>) -> Option<LineConfig> {
    let baud_rate = BaudRate::from_bits_per_second(bits_per_second)?;
    let data_bits = if seven_bits { DataBits::Seven } else { DataBits::Eight };
    let parity = match parity {
        None => Parity::None,
        Some(true) => Parity::Even,
        Some(false) => Parity::Odd,
    };
    Some(LineConfig::new(baud_rate, data_bits, parity))
}
