//! CLI Exit Codes
//!
//! Standard exit codes for CLI operations and automation.

use crate::config::ConfigError;
use crate::core::capture::CaptureError;
use crate::core::printer::{PrinterError, ProtocolError};
use crate::core::printout::PrintoutError;
use crate::core::scenario::ScenarioError;
use crate::core::tcu::TcuError;
use crate::core::transport::{LineConfigError, TransportError};
use std::process::ExitCode;

/// Exit code constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodes;

impl ExitCodes {
    /// Success
    pub const SUCCESS: u8 = 0;

    /// General error
    pub const ERROR: u8 = 1;

    /// Invalid arguments
    pub const INVALID_ARGS: u8 = 2;

    /// Connection failed
    pub const CONNECTION_FAILED: u8 = 3;

    /// Timeout
    pub const TIMEOUT: u8 = 4;

    /// File not found
    pub const FILE_NOT_FOUND: u8 = 6;

    /// Permission denied
    pub const PERMISSION_DENIED: u8 = 7;

    /// Configuration error
    pub const CONFIG_ERROR: u8 = 8;

    /// Protocol error
    pub const PROTOCOL_ERROR: u8 = 9;

    /// Device busy
    pub const DEVICE_BUSY: u8 = 13;

    /// Echo mismatch, printout mismatch or failed scenario
    pub const VALIDATION_FAILED: u8 = 17;

    /// Internal error
    pub const INTERNAL_ERROR: u8 = 127;

    /// Every code, in table order
    pub const ALL: [u8; 12] = [
        Self::SUCCESS,
        Self::ERROR,
        Self::INVALID_ARGS,
        Self::CONNECTION_FAILED,
        Self::TIMEOUT,
        Self::FILE_NOT_FOUND,
        Self::PERMISSION_DENIED,
        Self::CONFIG_ERROR,
        Self::PROTOCOL_ERROR,
        Self::DEVICE_BUSY,
        Self::VALIDATION_FAILED,
        Self::INTERNAL_ERROR,
    ];
}

/// CLI operation result
#[derive(Debug)]
pub enum CliResult {
    /// Success with optional message
    Success(Option<String>),

    /// Error with code and message
    Error(u8, String),
}

impl CliResult {
    /// Success without a message
    pub fn success() -> Self {
        Self::Success(None)
    }

    /// Success with a message for stderr
    pub fn success_with_message(msg: impl Into<String>) -> Self {
        Self::Success(Some(msg.into()))
    }

    /// Failure with an explicit code
    pub fn error(code: u8, msg: impl Into<String>) -> Self {
        Self::Error(code, msg.into())
    }

    /// Echo, printout or scenario did not match
    pub fn validation_failed(msg: impl Into<String>) -> Self {
        Self::Error(ExitCodes::VALIDATION_FAILED, msg.into())
    }

    /// Get exit code
    pub fn code(&self) -> u8 {
        match self {
            Self::Success(_) => ExitCodes::SUCCESS,
            Self::Error(code, _) => *code,
        }
    }

    /// Get message
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Success(Some(msg)) | Self::Error(_, msg) => Some(msg),
            Self::Success(None) => None,
        }
    }

    /// Convert to ExitCode
    pub fn to_exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }

    /// Is success?
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

impl From<anyhow::Error> for CliResult {
    fn from(err: anyhow::Error) -> Self {
        Self::Error(code_for(&err), format!("{err:#}"))
    }
}

fn io_code(err: &std::io::Error) -> u8 {
    use std::io::ErrorKind;

    match err.kind() {
        ErrorKind::NotFound => ExitCodes::FILE_NOT_FOUND,
        ErrorKind::PermissionDenied => ExitCodes::PERMISSION_DENIED,
        ErrorKind::ConnectionRefused => ExitCodes::CONNECTION_FAILED,
        ErrorKind::TimedOut => ExitCodes::TIMEOUT,
        _ => ExitCodes::ERROR,
    }
}

fn transport_code(err: &TransportError) -> u8 {
    match err {
        TransportError::InterfaceUnavailable { .. } => ExitCodes::CONNECTION_FAILED,
        TransportError::AlreadyOpen(_) => ExitCodes::DEVICE_BUSY,
        TransportError::UnsupportedConfiguration { .. } | TransportError::UnknownInterface(_) => {
            ExitCodes::INVALID_ARGS
        }
        TransportError::IoError(e) => io_code(e),
        TransportError::AlreadyClosed(_) | TransportError::WriteFailed { .. } => ExitCodes::ERROR,
    }
}

fn printout_code(err: &PrintoutError) -> u8 {
    match err {
        PrintoutError::SampleNotFound(_) => ExitCodes::FILE_NOT_FOUND,
        PrintoutError::WidthMismatch { .. } => ExitCodes::VALIDATION_FAILED,
        PrintoutError::InvalidSampleName(_) => ExitCodes::INVALID_ARGS,
        PrintoutError::Io(e) => io_code(e),
        PrintoutError::Image(_) => ExitCodes::ERROR,
    }
}

fn printer_code(err: &PrinterError) -> u8 {
    match err {
        PrinterError::Transport(e) => transport_code(e),
        PrinterError::Protocol(_) => ExitCodes::PROTOCOL_ERROR,
        PrinterError::NoResponse(..) => ExitCodes::TIMEOUT,
        PrinterError::NoLineSettings(_) => ExitCodes::INVALID_ARGS,
    }
}

fn tcu_code(err: &TcuError) -> u8 {
    match err {
        TcuError::Transport(e) => transport_code(e),
        TcuError::Protocol(_) | TcuError::Printer(_) => ExitCodes::PROTOCOL_ERROR,
        TcuError::NotAcknowledged { .. } | TcuError::NoResponse(..) => ExitCodes::TIMEOUT,
    }
}

/// Exit code for an error, looking through `anyhow` context
pub fn code_for(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<TransportError>() {
            return transport_code(e);
        }
        if let Some(e) = cause.downcast_ref::<PrintoutError>() {
            return printout_code(e);
        }
        if let Some(e) = cause.downcast_ref::<PrinterError>() {
            return printer_code(e);
        }
        if let Some(e) = cause.downcast_ref::<TcuError>() {
            return tcu_code(e);
        }
        if let Some(e) = cause.downcast_ref::<ScenarioError>() {
            return match e {
                ScenarioError::Transport(e) => transport_code(e),
                ScenarioError::Printer(e) => printer_code(e),
                ScenarioError::Printout(e) => printout_code(e),
                ScenarioError::UnknownScenario(_) => ExitCodes::INVALID_ARGS,
            };
        }
        if cause.is::<ConfigError>() {
            return ExitCodes::CONFIG_ERROR;
        }
        if cause.is::<ProtocolError>() {
            return ExitCodes::PROTOCOL_ERROR;
        }
        if cause.is::<LineConfigError>() {
            return ExitCodes::INVALID_ARGS;
        }
        if let Some(e) = cause.downcast_ref::<CaptureError>() {
            return match e {
                CaptureError::Timeout(_) => ExitCodes::TIMEOUT,
                CaptureError::NotComplete | CaptureError::NoPrintout => ExitCodes::ERROR,
            };
        }
        if let Some(e) = cause.downcast_ref::<std::io::Error>() {
            return io_code(e);
        }
    }
    ExitCodes::ERROR
}

/// Exit code description
pub fn exit_code_description(code: u8) -> &'static str {
    match code {
        0 => "Success",
        1 => "General error",
        2 => "Invalid arguments or unsupported line configuration",
        3 => "Interface unavailable",
        4 => "Timeout",
        6 => "File or sample not found",
        7 => "Permission denied",
        8 => "Configuration error",
        9 => "Protocol error",
        13 => "Interface already open",
        17 => "Validation failed",
        127 => "Internal error",
        _ => "Unknown error",
    }
}

/// Print exit code table
pub fn print_exit_codes() {
    println!("Exit Codes:");
    for code in ExitCodes::ALL {
        println!("  {:>3}  {}", code, exit_code_description(code));
    }
}
