//! Emulated TCU
//!
//! Answers on the host's USB port. Every command is echoed as it arrives;
//! print data is forwarded to an emulated printer over the comms mode and
//! line the TCU was set to, through the same UART model the host links use.

use super::protocol::{
    self, baud_for_index, Command, CommsMode, MeasureChannel, RelayChannel, MAX_COMMAND_LEN, TERMINATOR,
};
use crate::core::transport::uart::DecodedChar;
use crate::core::transport::{
    EmulatedDevice, EmulatedLink, Interface, LineConfig, LinkBackend, LinkFactory, TransportError,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

fn default_measurements() -> HashMap<u8, u32> {
    [
        (MeasureChannel::CtsLevel, 1),
        (MeasureChannel::FirmwareVersion, 0x0105),
        (MeasureChannel::ReferenceVoltage, 2500),
        (MeasureChannel::InternalBatteryVoltage, 7400),
        (MeasureChannel::InternalChargerVoltage, 12000),
        (MeasureChannel::BluetoothAddressReady, 1),
    ]
    .into_iter()
    .map(|(channel, value)| (channel.number(), value))
    .collect()
}

struct TcuState {
    closed: BTreeSet<u8>,
    values: BTreeMap<u8, u16>,
    comms_mode: u16,
    baud_index: u8,
    bits_per_second: u32,
    measurements: HashMap<u8, u32>,
    pending: Vec<u8>,
    printer: Option<Arc<dyn EmulatedDevice>>,
    forwarded: u64,
}

impl TcuState {
    fn is_closed(&self, relay: RelayChannel) -> bool {
        self.closed.contains(&relay.number())
    }

    fn printer_line(&self) -> Option<LineConfig> {
        let parity = self
            .is_closed(RelayChannel::ParityEnable)
            .then(|| self.is_closed(RelayChannel::ParitySetEven));
        protocol::line_from_settings(self.bits_per_second, self.is_closed(RelayChannel::DataBitsSet7), parity)
    }

    fn switch(&mut self, relay: u8, closed: bool) {
        if closed {
            self.closed.insert(relay);
        } else {
            self.closed.remove(&relay);
        }

        let Some(relay) = RelayChannel::from_number(relay) else {
            debug!("TCU relay {:02X} is not wired", relay);
            return;
        };
        if let Some(bit) = RelayChannel::COMMS_MODE_BITS.iter().position(|r| *r == relay) {
            let mask = 1u16 << bit;
            self.comms_mode = if closed { self.comms_mode | mask } else { self.comms_mode & !mask };
        } else if let Some(bit) = RelayChannel::BAUD_RATE_BITS.iter().position(|r| *r == relay) {
            let mask = 1u8 << bit;
            self.baud_index = if closed { self.baud_index | mask } else { self.baud_index & !mask };
            self.bits_per_second = baud_for_index(self.baud_index);
        }
    }

    fn set(&mut self, channel: u8, value: u16) {
        match RelayChannel::from_number(channel) {
            Some(RelayChannel::CommsModeSet) => self.comms_mode = value,
            Some(RelayChannel::BaudRateSet) => self.bits_per_second = u32::from(value) * 100,
            Some(relay) if relay.takes_value() => {}
            _ => self.switch(channel, value != 0),
        }
        self.values.insert(channel, value);
    }

    fn measure(&self, channel: u8) -> u32 {
        self.measurements.get(&channel).copied().unwrap_or(0)
    }

    /// Send bytes to the printer and return whatever it answered
    fn forward(&mut self, data: &[u8]) -> Vec<u8> {
        let Some(printer) = self.printer.clone() else {
            warn!("No printer behind the emulated TCU, dropping {} bytes", data.len());
            return Vec::new();
        };
        let Some(interface) = CommsMode::from_value(self.comms_mode).and_then(CommsMode::interface) else {
            warn!("TCU comms mode {} does not reach the printer", self.comms_mode);
            return Vec::new();
        };
        let Some(line) = self.printer_line() else {
            warn!("TCU baud rate {} is not a printer rate", self.bits_per_second);
            return Vec::new();
        };

        let mut link = EmulatedLink::new(interface, printer);
        let reply = link
            .apply(&line)
            .and_then(|()| link.write(data))
            .and_then(|_| link.read());
        match reply {
            Ok(received) => {
                self.forwarded += data.len() as u64;
                if !received.errors.is_clean() {
                    debug!("Printer reply over {} had line errors", interface);
                }
                received.data.to_vec()
            }
            Err(e) => {
                warn!("TCU forward over {} failed: {}", interface, e);
                Vec::new()
            }
        }
    }

    fn execute(&mut self, line: &[u8]) -> Vec<u8> {
        let command = match Command::parse(line) {
            Ok(command) => command,
            Err(e) => {
                warn!("Emulated TCU ignoring {}", e);
                return Vec::new();
            }
        };
        debug!("Emulated TCU: {}", command);

        match command {
            Command::OpenRelay(relay) => self.switch(relay, false),
            Command::CloseRelay(relay) => self.switch(relay, true),
            Command::SetChannel(channel, value) => self.set(channel, value),
            Command::Measure(channel) => {
                let mut reply = format!("{:X}", self.measure(channel)).into_bytes();
                reply.push(TERMINATOR);
                return reply;
            }
            Command::Print(data) => {
                self.forward(&data);
            }
            Command::PrintWithResponse(data) => {
                let mut reply = self.forward(&data);
                if let Some(end) = reply.iter().position(|&b| b == TERMINATOR) {
                    reply.truncate(end + 1);
                }
                return reply;
            }
        }
        Vec::new()
    }
}

/// Emulated test control unit
#[derive(Clone)]
pub struct EmulatedTcu {
    state: Arc<Mutex<TcuState>>,
}

impl Default for EmulatedTcu {
    fn default() -> Self {
        Self::new()
    }
}

impl EmulatedTcu {
    /// TCU with every relay open, RS232 at 9600/8N and nothing behind it
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TcuState {
                closed: BTreeSet::new(),
                values: BTreeMap::new(),
                comms_mode: CommsMode::Rs232 as u16,
                baud_index: 0,
                bits_per_second: baud_for_index(0),
                measurements: default_measurements(),
                pending: Vec::new(),
                printer: None,
                forwarded: 0,
            })),
        }
    }

    /// Wire a printer to the TCU's comms outputs
    #[must_use]
    pub fn with_printer(self, printer: impl EmulatedDevice + 'static) -> Self {
        self.state.lock().printer = Some(Arc::new(printer));
        self
    }

    /// Whether a relay is closed
    pub fn is_closed(&self, relay: RelayChannel) -> bool {
        self.state.lock().is_closed(relay)
    }

    /// Last value set on a channel
    pub fn channel_value(&self, channel: RelayChannel) -> Option<u16> {
        self.state.lock().values.get(&channel.number()).copied()
    }

    /// Comms mode in effect
    pub fn comms_mode(&self) -> Option<CommsMode> {
        CommsMode::from_value(self.state.lock().comms_mode)
    }

    /// Line the TCU drives towards the printer, `None` for rates the printer
    /// has no setting for
    pub fn printer_line(&self) -> Option<LineConfig> {
        self.state.lock().printer_line()
    }

    /// Override a measurement channel
    pub fn set_measurement(&self, channel: MeasureChannel, value: u32) {
        self.state.lock().measurements.insert(channel.number(), value);
    }

    /// Bytes forwarded to the printer so far
    pub fn forwarded(&self) -> u64 {
        self.state.lock().forwarded
    }
}

impl EmulatedDevice for EmulatedTcu {
    fn line_config(&self, _interface: Interface) -> Option<LineConfig> {
        None
    }

    fn receive(&self, _interface: Interface, chars: &[DecodedChar]) -> Vec<u8> {
        let mut state = self.state.lock();
        let mut response = Vec::new();

        for c in chars {
            response.push(c.value);
            if c.value != TERMINATOR {
                state.pending.push(c.value);
                if state.pending.len() >= MAX_COMMAND_LEN {
                    warn!("Emulated TCU buffer overflow, dropping {} bytes", state.pending.len());
                    state.pending.clear();
                }
                continue;
            }
            let line = std::mem::take(&mut state.pending);
            response.extend(state.execute(&line));
        }
        response
    }
}

impl LinkFactory for EmulatedTcu {
    fn connect(&self, interface: Interface) -> Result<Box<dyn LinkBackend>, TransportError> {
        if interface != Interface::Usb {
            return Err(TransportError::InterfaceUnavailable {
                interface,
                reason: "the TCU is reached over USB".to_string(),
            });
        }
        info!("Connected to emulated TCU");
        Ok(Box::new(EmulatedLink::new(interface, Arc::new(self.clone()))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::capture::PrintoutCapture;
    use crate::core::printer::{protocol as printer_protocol, EmulatedPrinter, MeasureChannel as PrinterMeasure};
    use crate::core::transport::{BaudRate, FrameFormat};

    fn send(tcu: &EmulatedTcu, bytes: &[u8]) -> Vec<u8> {
        let chars: Vec<DecodedChar> = bytes
            .iter()
            .map(|&value| DecodedChar {
                value,
                parity_error: false,
                framing_error: false,
            })
            .collect();
        tcu.receive(Interface::Usb, &chars)
    }

    fn command(tcu: &EmulatedTcu, command: &Command) -> Vec<u8> {
        let bytes = command.encode().unwrap();
        let reply = send(tcu, &bytes);
        assert!(reply.starts_with(&bytes), "no acknowledgement for {command}");
        reply[bytes.len()..].to_vec()
    }

    #[test]
    fn test_acknowledges_by_echo() {
        let tcu = EmulatedTcu::new();
        assert!(command(&tcu, &Command::CloseRelay(RelayChannel::BatteryEnable.number())).is_empty());
        assert!(tcu.is_closed(RelayChannel::BatteryEnable));

        assert!(command(&tcu, &Command::OpenRelay(RelayChannel::BatteryEnable.number())).is_empty());
        assert!(!tcu.is_closed(RelayChannel::BatteryEnable));

        // Malformed commands are still echoed but do nothing
        assert_eq!(send(&tcu, b"Q12\r"), b"Q12\r");
    }

    #[test]
    fn test_commands_split_across_writes() {
        let tcu = EmulatedTcu::new();
        assert_eq!(send(&tcu, b"M0"), b"M0");
        assert_eq!(send(&tcu, b"8\r"), b"8\r105\r");
    }

    #[test]
    fn test_measure_replies_in_hex() {
        let tcu = EmulatedTcu::new();
        tcu.set_measurement(MeasureChannel::BatteryCurrent, 250);
        assert_eq!(command(&tcu, &Command::Measure(MeasureChannel::BatteryCurrent.number())), b"FA\r");
        assert_eq!(command(&tcu, &Command::Measure(MeasureChannel::BatteryVoltageDrop5s.number())), b"0\r");
    }

    #[test]
    fn test_line_from_channels_and_bitfields() {
        let tcu = EmulatedTcu::new();
        assert_eq!(tcu.printer_line(), Some(LineConfig::DEFAULT));
        assert_eq!(tcu.comms_mode(), Some(CommsMode::Rs232));

        let target = LineConfig::with_frame(BaudRate::B38400, FrameFormat::SEVEN_EVEN);
        for (relay, value) in protocol::line_settings(&target).unwrap() {
            command(&tcu, &Command::SetChannel(relay.number(), value));
        }
        assert_eq!(tcu.printer_line(), Some(target));
        assert_eq!(tcu.channel_value(RelayChannel::BaudRateSet), Some(384));

        // Index 1 of the baud bitfield is 19200; comms mode 6 is IrDA
        command(&tcu, &Command::CloseRelay(RelayChannel::BaudRateBit0.number()));
        command(&tcu, &Command::CloseRelay(RelayChannel::CommsModeBit1.number()));
        command(&tcu, &Command::CloseRelay(RelayChannel::CommsModeBit2.number()));
        assert_eq!(tcu.printer_line().map(|l| l.baud_rate), Some(BaudRate::B19200));
        assert_eq!(tcu.comms_mode(), Some(CommsMode::Irda));

        // 300 baud is beyond the printer's settings
        command(&tcu, &Command::SetChannel(RelayChannel::BaudRateSet.number(), 3));
        assert_eq!(tcu.printer_line(), None);
    }

    #[test]
    fn test_buffer_overflow_drops_command() {
        let tcu = EmulatedTcu::new();
        let mut flood = vec![b'C'; MAX_COMMAND_LEN];
        flood.extend_from_slice(b"21\r");
        send(&tcu, &flood);
        assert!(!tcu.is_closed(RelayChannel::BatteryEnable));
    }

    #[tokio::test]
    async fn test_forwards_print_data() {
        let printer = EmulatedPrinter::new();
        let tcu = EmulatedTcu::new().with_printer(printer.clone());

        printer.start_capture("via_tcu").await;
        assert!(command(&tcu, &Command::Print(b"Martel\n".to_vec())).is_empty());
        assert_eq!(tcu.forwarded(), 7);
        assert!(printer.printout().is_ok());
    }

    #[test]
    fn test_forwards_measure_and_returns_reply() {
        let printer = EmulatedPrinter::new();
        let tcu = EmulatedTcu::new().with_printer(printer);
        let measure = printer_protocol::measure_channel(PrinterMeasure::VccVoltage as u8);
        assert_eq!(command(&tcu, &Command::PrintWithResponse(measure)), b"3300\r");
    }

    #[test]
    fn test_mismatched_line_garbles_forwarded_data() {
        let printer = EmulatedPrinter::new();
        printer.set_line_config(Interface::Rs232, LineConfig::with_frame(BaudRate::B19200, FrameFormat::EIGHT_NONE));
        let tcu = EmulatedTcu::new().with_printer(printer.clone());

        command(&tcu, &Command::Print(b"abc".to_vec()));
        assert_ne!(printer.pending_text(), b"abc");

        // Restart the printer to drop the garbage, then match its rate
        printer.set_line_config(Interface::Rs232, LineConfig::with_frame(BaudRate::B19200, FrameFormat::EIGHT_NONE));
        command(&tcu, &Command::SetChannel(RelayChannel::BaudRateSet.number(), 192));
        command(&tcu, &Command::Print(b"abc".to_vec()));
        assert_eq!(printer.pending_text(), b"abc");
    }

    #[test]
    fn test_usb_only() {
        let tcu = EmulatedTcu::new();
        assert!(tcu.connect(Interface::Usb).is_ok());
        assert!(matches!(
            tcu.connect(Interface::Rs232),
            Err(TransportError::InterfaceUnavailable { .. })
        ));
    }
}
