//! Test control unit
//!
//! The TCU sits between the bench and the printer. It switches the
//! printer's supplies, measures currents and voltages, and relays print data
//! over RS232 or IrDA with its own line settings. [`Tcu`] drives it over an
//! open channel; [`EmulatedTcu`] stands in for it without hardware.

mod emulator;
pub mod protocol;

pub use emulator::EmulatedTcu;
pub use protocol::{Command, CommsMode, MeasureChannel, RelayChannel, TcuProtocolError};

use crate::core::printer::{self, ProtocolError};
use crate::core::transport::{Channel, FlowControl, LineConfig, TransportError};
use bytes::{Bytes, BytesMut};
use codepage_437::{BorrowFromCp437, CP437_CONTROL};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default wait for a command to be echoed
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Default wait for a response after the echo
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Errors talking to a TCU
#[derive(Error, Debug)]
pub enum TcuError {
    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Command could not be encoded or the response parsed
    #[error(transparent)]
    Protocol(#[from] TcuProtocolError),

    /// Printer reply relayed by the TCU did not parse
    #[error(transparent)]
    Printer(#[from] ProtocolError),

    /// Echo differed from the command or stopped short
    #[error("TCU did not acknowledge {command}: expected [{expected}], received [{received}]")]
    NotAcknowledged {
        /// Command
        command: String,
        /// Bytes sent, hex
        expected: String,
        /// Bytes echoed, hex
        received: String,
    },

    /// No CR-terminated response in time
    #[error("No response from the TCU to {0} within {1:?}")]
    NoResponse(String, Duration),
}

/// TCU commands on an open channel
pub struct Tcu<'a> {
    channel: &'a Channel,
    ack_timeout: Duration,
    response_timeout: Duration,
}

impl<'a> Tcu<'a> {
    /// Talk to the TCU on `channel`
    pub fn new(channel: &'a Channel) -> Self {
        Self {
            channel,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    /// Wait for command echoes
    #[must_use]
    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Wait for responses
    #[must_use]
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Open a relay, or clear a bitfield bit
    pub async fn open_relay(&self, relay: RelayChannel) -> Result<(), TcuError> {
        info!("Opening TCU relay {}", relay);
        self.execute(&Command::OpenRelay(relay.number())).await?;
        Ok(())
    }

    /// Close a relay, or set a bitfield bit
    pub async fn close_relay(&self, relay: RelayChannel) -> Result<(), TcuError> {
        info!("Closing TCU relay {}", relay);
        self.execute(&Command::CloseRelay(relay.number())).await?;
        Ok(())
    }

    /// Set a channel to a value
    pub async fn set_channel(&self, channel: RelayChannel, value: u16) -> Result<(), TcuError> {
        info!("Setting TCU channel {} to {}", channel, value);
        self.execute(&Command::SetChannel(channel.number(), value)).await?;
        Ok(())
    }

    /// Read a measurement channel
    pub async fn measure(&self, channel: MeasureChannel) -> Result<u32, TcuError> {
        let response = self.execute(&Command::Measure(channel.number())).await?;
        let value = protocol::parse_measurement(&response)?;
        info!("TCU {:?} = {}", channel, value);
        Ok(value)
    }

    /// Relay bytes to the printer
    pub async fn print(&self, data: &[u8]) -> Result<(), TcuError> {
        debug!("Printing [{}] via TCU", hex::encode_upper(data));
        self.execute(&Command::Print(data.to_vec())).await?;
        Ok(())
    }

    /// Relay bytes to the printer and return its CR-terminated reply
    pub async fn print_with_response(&self, data: &[u8]) -> Result<Bytes, TcuError> {
        debug!("Printing [{}] via TCU, expecting a reply", hex::encode_upper(data));
        self.execute(&Command::PrintWithResponse(data.to_vec())).await
    }

    /// Route printer traffic through a comms mode
    pub async fn select_comms(&self, mode: CommsMode) -> Result<(), TcuError> {
        self.set_channel(RelayChannel::CommsModeSet, mode as u16).await
    }

    /// Put the TCU's printer side on `config`
    pub async fn configure_line(&self, config: LineConfig) -> Result<(), TcuError> {
        if config.flow_control != FlowControl::None {
            warn!("TCU has no flow control; ignoring {}", config.flow_control);
        }
        for (channel, value) in protocol::line_settings(&config)? {
            self.set_channel(channel, value).await?;
        }
        Ok(())
    }

    /// Read a printer measurement channel through the TCU
    pub async fn measure_printer(&self, channel: u8) -> Result<i64, TcuError> {
        let reply = self.print_with_response(&printer::protocol::measure_channel(channel)).await?;
        let text = String::borrow_from_cp437(&reply, &CP437_CONTROL);
        Ok(printer::protocol::parse_measurement(&text)?)
    }

    /// Send a command, wait for its echo and, where the command has one,
    /// for its response
    async fn execute(&self, command: &Command) -> Result<Bytes, TcuError> {
        let bytes = command.encode()?;
        self.channel.flush().await?;
        self.channel.discard_input()?;
        self.channel.send(bytes.clone())?;
        self.channel.flush().await?;

        let mut received = BytesMut::new();
        let deadline = Instant::now() + self.ack_timeout;
        loop {
            received.extend_from_slice(&self.channel.try_receive()?.data);
            let seen = received.len().min(bytes.len());
            if received[..seen] != bytes[..seen] || (seen < bytes.len() && Instant::now() >= deadline) {
                return Err(TcuError::NotAcknowledged {
                    command: command.to_string(),
                    expected: hex::encode_upper(&bytes),
                    received: hex::encode_upper(&received),
                });
            }
            if seen == bytes.len() {
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        debug!("TCU acknowledged {}", command);

        let mut response = received.split_off(bytes.len());
        if !command.has_response() {
            return Ok(Bytes::new());
        }

        let deadline = Instant::now() + self.response_timeout;
        loop {
            if let Some(end) = response.iter().position(|&b| b == protocol::TERMINATOR) {
                response.truncate(end + 1);
                debug!("TCU response [{}]", hex::encode_upper(&response));
                return Ok(response.freeze());
            }
            if Instant::now() >= deadline {
                return Err(TcuError::NoResponse(command.to_string(), self.response_timeout));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
            response.extend_from_slice(&self.channel.try_receive()?.data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::capture::PrintoutCapture;
    use crate::core::printer::{render_text, EmulatedPrinter, MeasureChannel as PrinterMeasure, PrintMode};
    use crate::core::transport::{
        BaudRate, FrameFormat, Interface, MockLinkBackend, MockLinkFactory, Received, TransportManager,
    };

    async fn bench() -> (EmulatedPrinter, EmulatedTcu, Channel) {
        let printer = EmulatedPrinter::new();
        let tcu = EmulatedTcu::new().with_printer(printer.clone());
        let manager = TransportManager::new(tcu.clone());
        let channel = manager.open(Interface::Usb).await.unwrap();
        (printer, tcu, channel)
    }

    #[tokio::test(start_paused = true)]
    async fn test_relays_and_measure() {
        let (_printer, emulated, channel) = bench().await;
        let tcu = Tcu::new(&channel);

        tcu.close_relay(RelayChannel::ChargerEnable).await.unwrap();
        assert!(emulated.is_closed(RelayChannel::ChargerEnable));
        tcu.open_relay(RelayChannel::ChargerEnable).await.unwrap();
        assert!(!emulated.is_closed(RelayChannel::ChargerEnable));

        tcu.set_channel(RelayChannel::BatteryVoltageSet, 7400).await.unwrap();
        assert_eq!(emulated.channel_value(RelayChannel::BatteryVoltageSet), Some(7400));

        emulated.set_measurement(MeasureChannel::ChargerCurrent, 0x1F4);
        assert_eq!(tcu.measure(MeasureChannel::ChargerCurrent).await.unwrap(), 500);
        assert_eq!(tcu.measure(MeasureChannel::FirmwareVersion).await.unwrap(), 0x0105);

        channel.teardown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_print_through_tcu() {
        let (printer, _emulated, channel) = bench().await;
        let tcu = Tcu::new(&channel);

        printer.start_capture("tcu").await;
        tcu.print(b"Martel\n").await.unwrap();
        printer.await_completion(Duration::from_secs(1)).await.unwrap();
        assert_eq!(
            printer.printout().unwrap(),
            render_text("tcu", PrintMode::default(), b"Martel\n")
        );

        channel.teardown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_printer_measure_through_tcu() {
        let (printer, emulated, channel) = bench().await;
        let tcu = Tcu::new(&channel).response_timeout(Duration::from_millis(200));
        let target = LineConfig::with_frame(BaudRate::B57600, FrameFormat::EIGHT_ODD);

        // Mismatched sides: the printer never parses the command
        printer.set_line_config(Interface::Infrared, target);
        tcu.select_comms(CommsMode::Irda).await.unwrap();
        assert!(matches!(
            tcu.measure_printer(PrinterMeasure::BatteryVoltage as u8).await,
            Err(TcuError::NoResponse(..))
        ));

        // Matched: no reconnect needed
        tcu.configure_line(target).await.unwrap();
        assert_eq!(emulated.printer_line(), Some(target));
        assert_eq!(tcu.measure_printer(PrinterMeasure::BatteryVoltage as u8).await.unwrap(), 7400);

        channel.teardown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_too_long_is_not_sent() {
        let (_printer, emulated, channel) = bench().await;
        let tcu = Tcu::new(&channel);

        let result = tcu.print(&[b'x'; 100]).await;
        assert!(matches!(result, Err(TcuError::Protocol(TcuProtocolError::CommandTooLong(_)))));
        assert_eq!(emulated.forwarded(), 0);
        assert_eq!(channel.stats().bytes_sent, 0);

        channel.teardown().await;
    }

    fn link_answering(reply: &'static [u8]) -> MockLinkFactory {
        let mut factory = MockLinkFactory::new();
        factory.expect_connect().returning(move |_| {
            let mut link = MockLinkBackend::new();
            link.expect_apply().returning(|_| Ok(()));
            link.expect_write().returning(|data| Ok(data.len()));
            link.expect_discard_input().returning(|| Ok(()));
            link.expect_shutdown().returning(|| Ok(()));
            link.expect_describe().return_const("mock TCU".to_string());
            let mut sent = false;
            link.expect_read().returning(move || {
                let data = if sent { Bytes::new() } else { Bytes::from_static(reply) };
                sent = true;
                Ok(Received {
                    data,
                    ..Received::default()
                })
            });
            Ok(Box::new(link))
        });
        factory
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_echo_is_not_acknowledged() {
        let manager = TransportManager::new(link_answering(b"O21\r"));
        let channel = manager.open(Interface::Usb).await.unwrap();
        let tcu = Tcu::new(&channel);

        let result = tcu.close_relay(RelayChannel::BatteryEnable).await;
        match result {
            Err(TcuError::NotAcknowledged { expected, received, .. }) => {
                assert_eq!(expected, hex::encode_upper(b"C21\r"));
                assert_eq!(received, hex::encode_upper(b"O21\r"));
            }
            other => panic!("{other:?}"),
        }

        channel.teardown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_tcu_times_out() {
        let manager = TransportManager::new(link_answering(b"C2"));
        let channel = manager.open(Interface::Usb).await.unwrap();
        let tcu = Tcu::new(&channel).ack_timeout(Duration::from_millis(100));

        let started = Instant::now();
        let result = tcu.close_relay(RelayChannel::BatteryEnable).await;
        assert!(matches!(result, Err(TcuError::NotAcknowledged { .. })), "{result:?}");
        assert!(started.elapsed() >= Duration::from_millis(100));

        channel.teardown().await;
    }
}
