//! Line configuration: baud rate, frame format and flow control
//!
//! Every parameter is a closed enumeration. Loosely typed values (option
//! tables, config files, CLI flags) are parsed once at the boundary and
//! rejected there, so the transport only ever sees realizable settings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while parsing line parameters
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LineConfigError {
    /// Baud rate outside the supported table
    #[error("Unsupported baud rate: {0}")]
    UnsupportedBaudRate(u32),

    /// Data bit count other than 7 or 8
    #[error("Unsupported data bits: {0}")]
    UnsupportedDataBits(u8),

    /// Unknown parity name
    #[error("Unknown parity: {0}")]
    UnknownParity(String),

    /// Unknown frame format name
    #[error("Unknown frame format: {0}")]
    UnknownFrameFormat(String),

    /// Unknown flow control name
    #[error("Unknown flow control: {0}")]
    UnknownFlowControl(String),

    /// Option value that does not index a table entry
    #[error("Option value {value} does not select a {kind}")]
    InvalidOptionValue {
        /// Table being indexed
        kind: &'static str,
        /// Offending value
        value: u8,
    },

    /// Unparseable line configuration string
    #[error("Malformed line configuration: {0}")]
    Malformed(String),
}

/// Supported baud rates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum BaudRate {
    /// 600 baud
    B600,
    /// 1200 baud
    B1200,
    /// 2400 baud
    B2400,
    /// 4800 baud
    B4800,
    /// 9600 baud
    B9600,
    /// 19200 baud
    B19200,
    /// 38400 baud
    B38400,
    /// 57600 baud
    B57600,
    /// 115200 baud
    B115200,
}

impl BaudRate {
    /// All supported rates, slowest first. The position is the option value.
    pub const ALL: [BaudRate; 9] = [
        Self::B600,
        Self::B1200,
        Self::B2400,
        Self::B4800,
        Self::B9600,
        Self::B19200,
        Self::B38400,
        Self::B57600,
        Self::B115200,
    ];

    /// Bits per second
    pub const fn bits_per_second(self) -> u32 {
        match self {
            Self::B600 => 600,
            Self::B1200 => 1200,
            Self::B2400 => 2400,
            Self::B4800 => 4800,
            Self::B9600 => 9600,
            Self::B19200 => 19200,
            Self::B38400 => 38400,
            Self::B57600 => 57600,
            Self::B115200 => 115_200,
        }
    }

    /// Look up a rate by its bits per second
    pub fn from_bits_per_second(bps: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|rate| rate.bits_per_second() == bps)
    }

    /// Printer option value selecting this rate
    pub fn option_value(self) -> u8 {
        Self::ALL
            .iter()
            .position(|rate| *rate == self)
            .map_or(0, |index| index as u8)
    }

    /// Rate selected by a printer option value
    pub fn from_option_value(value: u8) -> Result<Self, LineConfigError> {
        Self::ALL
            .get(usize::from(value))
            .copied()
            .ok_or(LineConfigError::InvalidOptionValue { kind: "baud rate", value })
    }
}

impl TryFrom<u32> for BaudRate {
    type Error = LineConfigError;

    fn try_from(bps: u32) -> Result<Self, Self::Error> {
        Self::from_bits_per_second(bps).ok_or(LineConfigError::UnsupportedBaudRate(bps))
    }
}

impl From<BaudRate> for u32 {
    fn from(rate: BaudRate) -> Self {
        rate.bits_per_second()
    }
}

impl fmt::Display for BaudRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bits_per_second())
    }
}

impl FromStr for BaudRate {
    type Err = LineConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_suffix("baud")
            .or_else(|| trimmed.strip_suffix("Baud"))
            .unwrap_or(trimmed)
            .trim();
        let bps: u32 = digits
            .parse()
            .map_err(|_| LineConfigError::Malformed(s.to_string()))?;
        Self::try_from(bps)
    }
}

/// Data bits per character
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum DataBits {
    /// 7 data bits
    Seven,
    /// 8 data bits
    #[default]
    Eight,
}

impl DataBits {
    /// Number of bits
    pub const fn count(self) -> u8 {
        match self {
            Self::Seven => 7,
            Self::Eight => 8,
        }
    }

    /// Mask of the bits carried on the wire
    pub const fn mask(self) -> u8 {
        match self {
            Self::Seven => 0x7F,
            Self::Eight => 0xFF,
        }
    }
}

impl TryFrom<u8> for DataBits {
    type Error = LineConfigError;

    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        match bits {
            7 => Ok(Self::Seven),
            8 => Ok(Self::Eight),
            other => Err(LineConfigError::UnsupportedDataBits(other)),
        }
    }
}

impl From<DataBits> for u8 {
    fn from(bits: DataBits) -> Self {
        bits.count()
    }
}

/// Parity scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Parity {
    /// No parity bit
    #[default]
    None,
    /// Even parity
    Even,
    /// Odd parity
    Odd,
}

impl Parity {
    /// Parity bit for the given data, or `None` if no parity bit is sent
    pub fn bit_for(self, data: u8) -> Option<bool> {
        let odd_ones = data.count_ones() % 2 == 1;
        match self {
            Self::None => None,
            Self::Even => Some(odd_ones),
            Self::Odd => Some(!odd_ones),
        }
    }
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Even => write!(f, "Even"),
            Self::Odd => write!(f, "Odd"),
        }
    }
}

impl FromStr for Parity {
    type Err = LineConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" | "n" => Ok(Self::None),
            "even" | "e" => Ok(Self::Even),
            "odd" | "o" => Ok(Self::Odd),
            _ => Err(LineConfigError::UnknownParity(s.to_string())),
        }
    }
}

/// Flow control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FlowControl {
    /// No flow control
    #[default]
    None,
    /// RTS/CTS
    Hardware,
    /// XON/XOFF
    Software,
}

impl fmt::Display for FlowControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Hardware => write!(f, "Hardware"),
            Self::Software => write!(f, "Software"),
        }
    }
}

impl FromStr for FlowControl {
    type Err = LineConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" | "off" => Ok(Self::None),
            "hardware" | "hw" | "rtscts" => Ok(Self::Hardware),
            "software" | "sw" | "xonxoff" => Ok(Self::Software),
            _ => Err(LineConfigError::UnknownFlowControl(s.to_string())),
        }
    }
}

/// Frame format: data bits plus parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FrameFormat {
    /// Data bits
    pub data_bits: DataBits,
    /// Parity
    pub parity: Parity,
}

impl FrameFormat {
    /// "8 Bits None"
    pub const EIGHT_NONE: Self = Self::new(DataBits::Eight, Parity::None);
    /// "8 Bits Even"
    pub const EIGHT_EVEN: Self = Self::new(DataBits::Eight, Parity::Even);
    /// "8 Bits Odd"
    pub const EIGHT_ODD: Self = Self::new(DataBits::Eight, Parity::Odd);
    /// "7 Bits None"
    pub const SEVEN_NONE: Self = Self::new(DataBits::Seven, Parity::None);
    /// "7 Bits Even"
    pub const SEVEN_EVEN: Self = Self::new(DataBits::Seven, Parity::Even);
    /// "7 Bits Odd"
    pub const SEVEN_ODD: Self = Self::new(DataBits::Seven, Parity::Odd);

    /// All frame formats. The position is the option value.
    pub const ALL: [FrameFormat; 6] = [
        Self::EIGHT_NONE,
        Self::EIGHT_EVEN,
        Self::EIGHT_ODD,
        Self::SEVEN_NONE,
        Self::SEVEN_EVEN,
        Self::SEVEN_ODD,
    ];

    /// Create a frame format
    pub const fn new(data_bits: DataBits, parity: Parity) -> Self {
        Self { data_bits, parity }
    }

    /// Bits on the wire per character, start and stop bits included
    pub const fn bits_per_frame(self) -> u8 {
        let parity = match self.parity {
            Parity::None => 0,
            Parity::Even | Parity::Odd => 1,
        };
        1 + self.data_bits.count() + parity + 1
    }

    /// Short form, e.g. `8N`
    pub fn short_name(self) -> String {
        let parity = match self.parity {
            Parity::None => 'N',
            Parity::Even => 'E',
            Parity::Odd => 'O',
        };
        format!("{}{}", self.data_bits.count(), parity)
    }

    /// Printer option value selecting this format
    pub fn option_value(self) -> u8 {
        Self::ALL
            .iter()
            .position(|format| *format == self)
            .map_or(0, |index| index as u8)
    }

    /// Format selected by a printer option value
    pub fn from_option_value(value: u8) -> Result<Self, LineConfigError> {
        Self::ALL
            .get(usize::from(value))
            .copied()
            .ok_or(LineConfigError::InvalidOptionValue { kind: "frame format", value })
    }
}

impl fmt::Display for FrameFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} Bits {}", self.data_bits.count(), self.parity)
    }
}

impl FromStr for FrameFormat {
    type Err = LineConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unknown = || LineConfigError::UnknownFrameFormat(s.to_string());
        let words: Vec<&str> = s.split_whitespace().collect();

        match words.as_slice() {
            // "8 Bits Even"
            [bits, label, parity] if label.eq_ignore_ascii_case("bits") => {
                let bits: u8 = bits.parse().map_err(|_| unknown())?;
                Ok(Self::new(DataBits::try_from(bits)?, parity.parse()?))
            }
            // "8E", "8e1", "8-E"
            [compact] => {
                let compact = compact.replace('-', "");
                let mut chars = compact.chars();
                let bits = chars.next().and_then(|c| c.to_digit(10)).ok_or_else(unknown)?;
                let parity = chars.next().ok_or_else(unknown)?;
                match chars.as_str() {
                    "" | "1" => {}
                    _ => return Err(unknown()),
                }
                let bits = u8::try_from(bits).map_err(|_| unknown())?;
                Ok(Self::new(DataBits::try_from(bits)?, parity.to_string().parse()?))
            }
            _ => Err(unknown()),
        }
    }
}

impl TryFrom<String> for FrameFormat {
    type Error = LineConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FrameFormat> for String {
    fn from(format: FrameFormat) -> Self {
        format.to_string()
    }
}

/// Complete line configuration for one side of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LineConfig {
    /// Baud rate
    pub baud_rate: BaudRate,
    /// Frame format
    pub frame: FrameFormat,
    /// Flow control
    pub flow_control: FlowControl,
}

impl LineConfig {
    /// The printer's factory setting, 9600/8/None
    pub const DEFAULT: Self = Self {
        baud_rate: BaudRate::B9600,
        frame: FrameFormat::EIGHT_NONE,
        flow_control: FlowControl::None,
    };

    /// Create a configuration without flow control
    pub const fn new(baud_rate: BaudRate, data_bits: DataBits, parity: Parity) -> Self {
        Self {
            baud_rate,
            frame: FrameFormat::new(data_bits, parity),
            flow_control: FlowControl::None,
        }
    }

    /// Create a configuration from a baud rate and frame format
    pub const fn with_frame(baud_rate: BaudRate, frame: FrameFormat) -> Self {
        Self {
            baud_rate,
            frame,
            flow_control: FlowControl::None,
        }
    }

    /// Set flow control
    #[must_use]
    pub const fn flow_control(mut self, flow_control: FlowControl) -> Self {
        self.flow_control = flow_control;
        self
    }

    /// Data bits
    pub const fn data_bits(&self) -> DataBits {
        self.frame.data_bits
    }

    /// Parity
    pub const fn parity(&self) -> Parity {
        self.frame.parity
    }
}

impl Default for LineConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for LineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.baud_rate, self.frame.short_name())?;
        if self.flow_control != FlowControl::None {
            write!(f, " {}", self.flow_control)?;
        }
        Ok(())
    }
}

impl FromStr for LineConfig {
    type Err = LineConfigError;

    /// Accepts `Default`, `9600/8/None`, `9600 8N`, `9600 8N Hardware`
    /// and `9600 8 Bits Even`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("default") {
            return Ok(Self::DEFAULT);
        }

        if trimmed.contains('/') {
            let parts: Vec<&str> = trimmed.split('/').map(str::trim).collect();
            return match parts.as_slice() {
                [baud, bits, parity] | [baud, bits, parity, _] => {
                    let bits: u8 = bits
                        .parse()
                        .map_err(|_| LineConfigError::Malformed(s.to_string()))?;
                    let mut config =
                        Self::new(baud.parse()?, DataBits::try_from(bits)?, parity.parse()?);
                    if let [_, _, _, flow] = parts.as_slice() {
                        config.flow_control = flow.parse()?;
                    }
                    Ok(config)
                }
                _ => Err(LineConfigError::Malformed(s.to_string())),
            };
        }

        let (baud, rest) = trimmed
            .split_once(char::is_whitespace)
            .ok_or_else(|| LineConfigError::Malformed(s.to_string()))?;
        let baud_rate: BaudRate = baud.parse()?;
        let rest = rest.trim();

        // Trailing flow control word, if the remainder is not a frame on its own
        if let Ok(frame) = rest.parse::<FrameFormat>() {
            return Ok(Self::with_frame(baud_rate, frame));
        }
        let (frame, flow) = rest
            .rsplit_once(char::is_whitespace)
            .ok_or_else(|| LineConfigError::Malformed(s.to_string()))?;
        Ok(Self::with_frame(baud_rate, frame.trim().parse()?).flow_control(flow.parse()?))
    }
}

impl TryFrom<String> for LineConfig {
    type Error = LineConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<LineConfig> for String {
    fn from(config: LineConfig) -> Self {
        config.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_9600_8n() {
        assert_eq!(LineConfig::default(), LineConfig::DEFAULT);
        assert_eq!(LineConfig::DEFAULT.baud_rate, BaudRate::B9600);
        assert_eq!(LineConfig::DEFAULT.frame, FrameFormat::EIGHT_NONE);
        assert_eq!("Default".parse::<LineConfig>().unwrap(), LineConfig::DEFAULT);
    }

    #[test]
    fn test_frame_format_names() {
        assert_eq!("8 Bits Odd".parse::<FrameFormat>().unwrap(), FrameFormat::EIGHT_ODD);
        assert_eq!("7 bits even".parse::<FrameFormat>().unwrap(), FrameFormat::SEVEN_EVEN);
        assert_eq!("8N".parse::<FrameFormat>().unwrap(), FrameFormat::EIGHT_NONE);
        assert_eq!("7o1".parse::<FrameFormat>().unwrap(), FrameFormat::SEVEN_ODD);
        assert_eq!(FrameFormat::EIGHT_EVEN.to_string(), "8 Bits Even");
        assert!("9 Bits None".parse::<FrameFormat>().is_err());
        assert!("8 Bits Mark".parse::<FrameFormat>().is_err());
    }

    #[test]
    fn test_line_config_parsing() {
        let config: LineConfig = "19200/7/Even".parse().unwrap();
        assert_eq!(config, LineConfig::new(BaudRate::B19200, DataBits::Seven, Parity::Even));

        let config: LineConfig = "115200 8 Bits Odd".parse().unwrap();
        assert_eq!(config.frame, FrameFormat::EIGHT_ODD);

        let config: LineConfig = "9600 8N hw".parse().unwrap();
        assert_eq!(config.flow_control, FlowControl::Hardware);

        assert_eq!(
            "14400/8/None".parse::<LineConfig>(),
            Err(LineConfigError::UnsupportedBaudRate(14400))
        );
    }

    #[test]
    fn test_display_parses_back() {
        for baud in BaudRate::ALL {
            for frame in FrameFormat::ALL {
                let config = LineConfig::with_frame(baud, frame);
                assert_eq!(config.to_string().parse::<LineConfig>().unwrap(), config);
            }
        }
    }

    #[test]
    fn test_option_values() {
        assert_eq!(BaudRate::B600.option_value(), 0);
        assert_eq!(BaudRate::B9600.option_value(), 4);
        assert_eq!(BaudRate::from_option_value(8).unwrap(), BaudRate::B115200);
        assert!(BaudRate::from_option_value(9).is_err());
        assert_eq!(FrameFormat::EIGHT_ODD.option_value(), 2);
        assert_eq!(FrameFormat::from_option_value(3).unwrap(), FrameFormat::SEVEN_NONE);
    }

    #[test]
    fn test_parity_bit() {
        // 'M' = 0x4D has four ones
        assert_eq!(Parity::Even.bit_for(0x4D), Some(false));
        assert_eq!(Parity::Odd.bit_for(0x4D), Some(true));
        assert_eq!(Parity::None.bit_for(0x4D), None);
    }

    #[test]
    fn test_serde_as_strings() {
        let json = serde_json::to_string(&LineConfig::DEFAULT).unwrap();
        assert_eq!(json, "\"9600 8N\"");
        let back: LineConfig = serde_json::from_str("\"57600/7/Odd\"").unwrap();
        assert_eq!(back.baud_rate, BaudRate::B57600);
    }
}
