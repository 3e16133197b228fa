//! Link to an emulated device
//!
//! Traffic crosses the UART model in both directions: host bytes are encoded
//! with the host configuration and sampled with the device's, responses are
//! encoded with the device configuration and sampled with the host's. A USB
//! virtual COM port carries bytes verbatim.

use super::line::LineConfig;
use super::uart::{self, DecodedChar, LineErrors};
use super::{Interface, LinkBackend, Received, TransportError};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tracing::trace;

/// Device side of an emulated link
pub trait EmulatedDevice: Send + Sync {
    /// Device line configuration on an interface, `None` where the device
    /// ignores line settings
    fn line_config(&self, interface: Interface) -> Option<LineConfig>;

    /// Handle characters as sampled by the device, returning bytes to send back
    fn receive(&self, interface: Interface, chars: &[DecodedChar]) -> Vec<u8>;
}

/// Host end of an emulated link
pub struct EmulatedLink {
    interface: Interface,
    device: Arc<dyn EmulatedDevice>,
    config: LineConfig,
    inbox: BytesMut,
    errors: LineErrors,
    open: bool,
}

impl EmulatedLink {
    /// Create a link to a device
    pub fn new(interface: Interface, device: Arc<dyn EmulatedDevice>) -> Self {
        Self {
            interface,
            device,
            config: LineConfig::DEFAULT,
            inbox: BytesMut::new(),
            errors: LineErrors::default(),
            open: true,
        }
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.open {
            Ok(())
        } else {
            Err(TransportError::AlreadyClosed(self.interface))
        }
    }
}

impl LinkBackend for EmulatedLink {
    fn apply(&mut self, config: &LineConfig) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.config = *config;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        self.ensure_open()?;

        match self.device.line_config(self.interface) {
            None => {
                let chars: Vec<DecodedChar> = data
                    .iter()
                    .map(|&value| DecodedChar {
                        value,
                        parity_error: false,
                        framing_error: false,
                    })
                    .collect();
                let response = self.device.receive(self.interface, &chars);
                self.inbox.extend_from_slice(&response);
            }
            Some(device_config) => {
                let inbound = uart::transmit(data, &self.config, &device_config);
                trace!(
                    "{} device sampled {} chars ({} line errors)",
                    self.interface,
                    inbound.chars.len(),
                    inbound.errors().total()
                );
                let response = self.device.receive(self.interface, &inbound.chars);
                if !response.is_empty() {
                    let outbound = uart::transmit(&response, &device_config, &self.config);
                    self.inbox.extend_from_slice(&outbound.bytes());
                    self.errors += outbound.errors();
                }
            }
        }

        Ok(data.len())
    }

    fn read(&mut self) -> Result<Received, TransportError> {
        self.ensure_open()?;
        let data: Bytes = self.inbox.split().freeze();
        let errors = std::mem::take(&mut self.errors);
        Ok(Received { data, errors })
    }

    fn discard_input(&mut self) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.inbox.clear();
        self.errors = LineErrors::default();
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), TransportError> {
        self.open = false;
        self.inbox.clear();
        Ok(())
    }

    fn describe(&self) -> String {
        format!("emulated {} @ {}", self.interface, self.config)
    }
}
