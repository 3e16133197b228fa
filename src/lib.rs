//! # Printer HIL Library
//!
//! Hardware-in-the-loop acceptance testing for thermal receipt printers:
//! - Serial transport over USB, RS232 and infrared with a reconfigurable line
//! - An emulated printer that models UART framing and the print mechanism
//! - Printout capture and comparison against stored samples
//! - Acceptance scenarios with structured reports
//!
//! ## Example
//!
//! ```rust,no_run
//! use printer_hil::{EmulatedPrinter, Interface, TransportManager};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let printer = EmulatedPrinter::new();
//!     printer.set_echo(Interface::Rs232, true);
//!
//!     let manager = TransportManager::new(printer);
//!     let channel = manager.open(Interface::Rs232).await?;
//!     let echo = channel.exchange(b"Martel\r\n", Duration::from_millis(500)).await?;
//!     assert!(echo.matched);
//!
//!     channel.teardown().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;

// Re-exports for convenience
pub use crate::cli::{CliResult, ExitCodes};
pub use crate::config::{ConfigError, HilConfig};
pub use crate::core::capture::{capture_printout, CaptureError, CaptureState, PrintoutCapture};
pub use crate::core::logger::{LogEntry, LogFormat, TrafficLog};
pub use crate::core::printer::{EmulatedPrinter, Printer, PrinterError};
pub use crate::core::printout::{CompareMode, Comparator, Printout, PrintoutError, Sample, SampleStore, Tolerance};
pub use crate::core::scenario::{Bench, ScenarioKind, ScenarioReport, ScenarioSettings};
pub use crate::core::tcu::{EmulatedTcu, Tcu, TcuError};
pub use crate::core::transport::{
    BaudRate, Channel, FrameFormat, Interface, LineConfig, TransportError, TransportManager,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
