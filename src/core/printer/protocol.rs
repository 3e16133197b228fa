//! Printer command set
//!
//! Builders return raw bytes; the transport never interprets them.
//!
//! Configuration commands share the `ESC NUL NUL <cmd>` prefix:
//!
//! | Command | Bytes |
//! |---------|-------|
//! | set option | `ESC 00 00 'O' option value` |
//! | measure channel | `ESC 00 00 'M' channel` |
//! | set debug mode | `ESC 00 00 'D' mode` |
//! | set channel | `ESC 00 00 'S' channel` |
//! | set name | `ESC 00 00 'N' name NUL` |
//! | reset | `ESC 00 00 '@'` |

use codepage_437::CP437_CONTROL;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

/// Protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Print mode font outside 0..=3
    #[error("Invalid font {0}: must be 0..=3")]
    InvalidFont(u8),

    /// Option value outside the option's range
    #[error("Invalid value {value} for option {option}")]
    InvalidOptionValue {
        /// Option
        option: u8,
        /// Rejected value
        value: u8,
    },

    /// Device name with a non-ASCII or NUL character
    #[error("Invalid device name: {0:?}")]
    InvalidName(String),

    /// Unknown text encoding name
    #[error("Unknown encoding: {0}")]
    UnknownEncoding(String),

    /// Response could not be parsed
    #[error("Malformed response: {0:?}")]
    MalformedResponse(String),
}

/// Control characters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlCode {
    /// Terminates names and pads commands
    Nul = 0x00,
    /// Horizontal tab
    Ht = 0x09,
    /// Print the line buffer
    Lf = 0x0A,
    /// Form feed
    Ff = 0x0C,
    /// Carriage return, ends measure replies
    Cr = 0x0D,
    /// Double width on
    So = 0x0E,
    /// Double width off
    Si = 0x0F,
    /// Clear print buffer
    Can = 0x18,
    /// Command prefix
    Esc = 0x1B,
}

impl From<ControlCode> for u8 {
    fn from(code: ControlCode) -> Self {
        code as u8
    }
}

/// Debug output modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DebugMode {
    /// Self test printout
    Autotest = 0,
    /// Main state machine transitions
    MainState = 1,
    /// Charger state
    Charger = 2,
    /// Supply voltages
    Voltages = 3,
    /// Received bytes in hex
    HexDump = 4,
    /// Stack usage
    Stack = 5,
    /// Real-time clock
    DateTime = 6,
    /// Stored options
    Options = 7,
    /// Command parser trace
    Protocol = 8,
}

/// Firmware configuration options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConfigOption {
    /// Frame format of the RS232 port
    DataBitsParity1 = 1,
    /// Baud rate of the RS232 port
    BaudRate1 = 2,
    /// Flow control of the RS232 port
    Handshake1 = 3,
    /// Bluetooth pairing mode
    BluetoothPairing = 4,
    /// Font slot used after reset
    DefaultFont = 5,
    /// Double size after reset
    DoubleWidthHeight = 6,
    /// Print density
    Density = 7,
    /// Mechanism current limit
    Current = 8,
    /// Print upside down for labels
    LabelUpside = 9,
    /// Idle time before sleeping
    SleepTime = 10,
    /// Escape sequence dialect
    EscapeMode = 11,
    /// 12 or 24 hour clock
    TimeFormat = 12,
    /// USB device class
    UsbMode = 13,
    /// Fast battery charging
    FastCharge = 14,
    /// Frame format of the IR port
    DataBitsParity2 = 15,
    /// Baud rate of the IR port
    BaudRate2 = 16,
    /// Flow control of the IR port
    Handshake2 = 17,
    /// Option profile
    Profile = 18,
    /// Power on when charging starts
    AutoPowerOn = 19,
    /// Non-zero when the RS232 port is not fitted
    HardwareNoRs232 = 67,
    /// Non-zero when USB is not fitted
    HardwareNoUsb = 68,
    /// Non-zero when Bluetooth is not fitted
    HardwareNoBluetooth = 69,
    /// Non-zero when the IR port is not fitted
    HardwareNoIr = 70,
    /// Non-zero when the clock is not fitted
    HardwareNoRtc = 71,
}

impl ConfigOption {
    /// Every option the firmware knows
    pub const ALL: [ConfigOption; 24] = [
        Self::DataBitsParity1,
        Self::BaudRate1,
        Self::Handshake1,
        Self::BluetoothPairing,
        Self::DefaultFont,
        Self::DoubleWidthHeight,
        Self::Density,
        Self::Current,
        Self::LabelUpside,
        Self::SleepTime,
        Self::EscapeMode,
        Self::TimeFormat,
        Self::UsbMode,
        Self::FastCharge,
        Self::DataBitsParity2,
        Self::BaudRate2,
        Self::Handshake2,
        Self::Profile,
        Self::AutoPowerOn,
        Self::HardwareNoRs232,
        Self::HardwareNoUsb,
        Self::HardwareNoBluetooth,
        Self::HardwareNoIr,
        Self::HardwareNoRtc,
    ];

    /// Option number on the wire
    pub const fn number(self) -> u8 {
        self as u8
    }

    /// Look up an option by number
    pub fn from_number(number: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|o| o.number() == number)
    }

    /// Measure channel that reads this option back
    pub const fn measure_channel(self) -> u8 {
        MeasureChannel::ConfigOption1 as u8 - 1 + self as u8
    }
}

impl fmt::Display for ConfigOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.number())
    }
}

/// Measurement channels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MeasureChannel {
    /// Battery voltage in mV
    BatteryVoltage = 0,
    /// Charger input voltage in mV
    ChargerVoltage = 1,
    /// Logic supply in mV
    VccVoltage = 2,
    /// Mechanism supply in mV
    MechVoltage = 3,
    /// Print head temperature in °C
    MechTemperature = 4,
    /// 1 when paper is present
    PaperSensor = 5,
    /// Wake-up line level
    WakeupSignal = 6,
    /// Feed button level
    ButtonState = 8,
    /// 1 when the clock answers
    RtcPresent = 10,
    /// Firmware image checksum
    FirmwareChecksum = 12,
    /// Non-zero while the mechanism is printing
    MechBusy = 13,
    /// 1 when the font library checksum is good
    FontLibraryValid = 19,
    /// Font library major version
    FontLibraryVersionMajor = 26,
    /// Font library minor version
    FontLibraryVersionMinor = 27,
    /// First option read-back channel; option `n` is channel `31 + n`
    ConfigOption1 = 32,
}

/// Set-channel actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SetChannel {
    /// Run the charger test
    ChargeTest = 0,
    /// Toggle CTS for handshake tests
    CtsTest = 1,
    /// Feed paper
    FeedPaper = 3,
    /// Enter sleep
    Sleep = 4,
    /// Power off
    PowerOff = 5,
    /// Send printed text back over the link
    EnablePrintRedirect = 6,
    /// Stop redirecting printed text
    DisablePrintRedirect = 7,
    /// Print the self test page
    PrintSelftest = 8,
}

fn config_command(command: u8) -> Vec<u8> {
    vec![ControlCode::Esc.into(), 0x00, 0x00, command]
}

/// Set a configuration option
pub fn set_option(option: ConfigOption, value: u8) -> Vec<u8> {
    debug!("set option {} = {}", option, value);
    let mut bytes = config_command(b'O');
    bytes.extend_from_slice(&[option.number(), value]);
    bytes
}

/// Read a measurement channel; the printer answers `"<value>\r"`
pub fn measure_channel(channel: u8) -> Vec<u8> {
    let mut bytes = config_command(b'M');
    bytes.push(channel);
    bytes
}

/// Read a configuration option back
pub fn measure_option(option: ConfigOption) -> Vec<u8> {
    measure_channel(option.measure_channel())
}

/// Select a debug output mode
pub fn set_debug_mode(mode: DebugMode) -> Vec<u8> {
    let mut bytes = config_command(b'D');
    bytes.push(mode as u8);
    bytes
}

/// Trigger a set-channel action
pub fn set_channel(channel: SetChannel) -> Vec<u8> {
    let mut bytes = config_command(b'S');
    bytes.push(channel as u8);
    bytes
}

/// Set the device name
pub fn set_name(name: &str) -> Result<Vec<u8>, ProtocolError> {
    if !name.is_ascii() || name.contains('\0') {
        return Err(ProtocolError::InvalidName(name.to_string()));
    }
    let mut bytes = config_command(b'N');
    bytes.extend_from_slice(name.as_bytes());
    bytes.push(0x00);
    Ok(bytes)
}

/// Restart the firmware, applying stored options
pub fn reset() -> Vec<u8> {
    config_command(b'@')
}

/// Select font slot and character size
pub fn print_mode(font: u8, double_height: bool, double_width: bool) -> Result<Vec<u8>, ProtocolError> {
    if font > 3 {
        return Err(ProtocolError::InvalidFont(font));
    }
    let mut word = font;
    if double_height {
        word += 0x10;
    }
    if double_width {
        word += 0x20;
    }
    Ok(vec![ControlCode::Esc.into(), b'!', word])
}

/// Discard anything not yet printed
pub fn clear_print_buffer() -> Vec<u8> {
    vec![ControlCode::Can.into()]
}

/// Restore print defaults
pub fn set_print_defaults() -> Vec<u8> {
    vec![ControlCode::Esc.into(), b'@']
}

/// Text encoding used to turn strings into printer bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// 7-bit ASCII
    Ascii,
    /// IBM code page 437, the printer's native character set
    #[default]
    Cp437,
    /// Raw UTF-8 bytes
    Utf8,
}

impl Encoding {
    /// Encode text, replacing unrepresentable characters with `?`
    pub fn encode(self, text: &str) -> Vec<u8> {
        match self {
            Self::Ascii => text
                .chars()
                .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
                .collect(),
            Self::Cp437 => text
                .chars()
                .map(|c| CP437_CONTROL.encode(c).unwrap_or(b'?'))
                .collect(),
            Self::Utf8 => text.as_bytes().to_vec(),
        }
    }
}

impl FromStr for Encoding {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "").as_str() {
            "ascii" => Ok(Self::Ascii),
            "cp437" => Ok(Self::Cp437),
            "utf8" => Ok(Self::Utf8),
            _ => Err(ProtocolError::UnknownEncoding(s.to_string())),
        }
    }
}

/// Parse a measure response such as `"7400\r"`
pub fn parse_measurement(response: &str) -> Result<i64, ProtocolError> {
    response
        .trim_end_matches(['\r', '\n'])
        .trim()
        .parse()
        .map_err(|_| ProtocolError::MalformedResponse(response.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_commands() {
        assert_eq!(
            set_option(ConfigOption::BaudRate1, 4),
            vec![0x1B, 0x00, 0x00, b'O', 2, 4]
        );
        assert_eq!(measure_channel(13), vec![0x1B, 0x00, 0x00, b'M', 13]);
        assert_eq!(set_debug_mode(DebugMode::Options), vec![0x1B, 0x00, 0x00, b'D', 7]);
        assert_eq!(reset(), vec![0x1B, 0x00, 0x00, b'@']);
        assert_eq!(set_channel(SetChannel::FeedPaper), vec![0x1B, 0x00, 0x00, b'S', 3]);
        assert_eq!(
            set_name("MT").unwrap(),
            vec![0x1B, 0x00, 0x00, b'N', b'M', b'T', 0x00]
        );
        assert!(set_name("bad\0").is_err());
    }

    #[test]
    fn test_measure_option_channel() {
        assert_eq!(measure_option(ConfigOption::DataBitsParity1), measure_channel(32));
        assert_eq!(ConfigOption::BaudRate2.measure_channel(), 47);
        assert_eq!(ConfigOption::from_number(70), Some(ConfigOption::HardwareNoIr));
        assert_eq!(ConfigOption::from_number(40), None);
    }

    #[test]
    fn test_print_mode() {
        assert_eq!(print_mode(0, false, false).unwrap(), vec![0x1B, b'!', 0x00]);
        assert_eq!(print_mode(2, true, false).unwrap(), vec![0x1B, b'!', 0x12]);
        assert_eq!(print_mode(3, true, true).unwrap(), vec![0x1B, b'!', 0x33]);
        assert_eq!(print_mode(4, false, false), Err(ProtocolError::InvalidFont(4)));
        assert_eq!(clear_print_buffer(), vec![0x18]);
    }

    #[test]
    fn test_encodings() {
        assert_eq!(Encoding::Ascii.encode("café"), b"caf?".to_vec());
        assert_eq!(Encoding::Cp437.encode("café"), vec![b'c', b'a', b'f', 0x82]);
        assert_eq!(Encoding::Utf8.encode("é"), vec![0xC3, 0xA9]);
        assert_eq!("UTF-8".parse::<Encoding>().unwrap(), Encoding::Utf8);
        assert!("latin1".parse::<Encoding>().is_err());
    }

    #[test]
    fn test_parse_measurement() {
        assert_eq!(parse_measurement("7400\r").unwrap(), 7400);
        assert_eq!(parse_measurement("-3\r\n").unwrap(), -3);
        assert!(parse_measurement("x\r").is_err());
    }
}
