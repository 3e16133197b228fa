//! Core module containing the test bench
//!
//! This module provides:
//! - Transport layer with per-interface line configuration
//! - Traffic logging with timestamps
//! - Printer commands and the emulated printer
//! - Printout capture, storage and comparison
//! - Acceptance scenarios
//! - The test control unit that switches relays and forwards to the printer

pub mod capture;
pub mod logger;
pub mod printer;
pub mod printout;
pub mod scenario;
pub mod tcu;
pub mod transport;
