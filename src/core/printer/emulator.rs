//! Emulated printer bench
//!
//! Device side of the emulated links: interprets the bytes it samples with
//! its own line configuration, answers measure requests, and burns text into
//! a paper strip that can be captured as a [`Printout`].

use super::protocol::{ConfigOption, ControlCode, MeasureChannel, SetChannel};
use crate::core::capture::{CaptureError, CaptureState, PrintoutCapture};
use crate::core::printout::{Printout, BLACK, WHITE};
use crate::core::transport::line::{BaudRate, FlowControl, FrameFormat, LineConfig};
use crate::core::transport::uart::DecodedChar;
use crate::core::transport::{EmulatedDevice, EmulatedLink, Interface, LinkBackend, LinkFactory, TransportError};
use async_trait::async_trait;
use image::GrayImage;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Dots per printed line
pub const DOTS_PER_LINE: u32 = 384;

/// Glyph cell at font slot 0
const CELL_WIDTH: u32 = 9;
const CELL_HEIGHT: u32 = 12;

/// Shown for characters received with a line error
const REPLACEMENT: u8 = b'?';

const ESC: u8 = ControlCode::Esc as u8;
const CAN: u8 = ControlCode::Can as u8;
const LF: u8 = ControlCode::Lf as u8;
const CR: u8 = ControlCode::Cr as u8;
const SO: u8 = ControlCode::So as u8;
const SI: u8 = ControlCode::Si as u8;
const NUL: u8 = ControlCode::Nul as u8;

/// Character size selected by `ESC !`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrintMode {
    /// Font slot 0..=3
    pub font: u8,
    /// Double height
    pub double_height: bool,
    /// Double width
    pub double_width: bool,
}

impl PrintMode {
    fn from_word(word: u8) -> Self {
        Self {
            font: word & 0x03,
            double_height: word & 0x10 != 0,
            double_width: word & 0x20 != 0,
        }
    }

    fn scale_x(self) -> u32 {
        (u32::from(self.font) + 1) * if self.double_width { 2 } else { 1 }
    }

    fn scale_y(self) -> u32 {
        (u32::from(self.font) + 1) * if self.double_height { 2 } else { 1 }
    }

    /// Characters that fit on one line
    pub fn chars_per_line(self) -> usize {
        (DOTS_PER_LINE / (CELL_WIDTH * self.scale_x())) as usize
    }
}

/// Print head and paper
///
/// Glyphs are synthetic: column `c` of a character cell is burned when bit
/// `c` of the character code is set, above a baseline common to every
/// printable character. Distinct codes give distinct marks.
struct Mechanism {
    mode: PrintMode,
    line: Vec<u8>,
    paper: Vec<u8>,
    burn_variance: u8,
    rng: StdRng,
}

impl Mechanism {
    fn new(burn_variance: u8, seed: u64) -> Self {
        Self {
            mode: PrintMode::default(),
            line: Vec::new(),
            paper: Vec::new(),
            burn_variance,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn rows(&self) -> u32 {
        (self.paper.len() / DOTS_PER_LINE as usize) as u32
    }

    fn push(&mut self, byte: u8) {
        self.line.push(byte);
        if self.line.len() >= self.mode.chars_per_line() {
            self.print_line();
        }
    }

    fn clear_line(&mut self) {
        self.line.clear();
    }

    fn feed(&mut self, rows: u32) {
        let dots = (rows * DOTS_PER_LINE) as usize;
        self.paper.extend(std::iter::repeat(WHITE).take(dots));
    }

    fn burn(&mut self) -> u8 {
        if self.burn_variance == 0 {
            BLACK
        } else {
            self.rng.gen_range(BLACK..=self.burn_variance)
        }
    }

    fn print_line(&mut self) {
        let sx = self.mode.scale_x();
        let sy = self.mode.scale_y();
        let top = self.rows();
        self.feed(CELL_HEIGHT * sy);

        let line = std::mem::take(&mut self.line);
        for (i, &code) in line.iter().enumerate() {
            let left = i as u32 * CELL_WIDTH * sx;
            for (col, row) in glyph_dots(code) {
                for dy in 0..sy {
                    for dx in 0..sx {
                        let x = left + col * sx + dx;
                        let y = top + row * sy + dy;
                        if x < DOTS_PER_LINE {
                            let level = self.burn();
                            self.paper[(y * DOTS_PER_LINE + x) as usize] = level;
                        }
                    }
                }
            }
        }
    }

    fn take_paper(&mut self, name: &str) -> Option<Printout> {
        if self.paper.is_empty() {
            return None;
        }
        let rows = self.rows();
        let paper = std::mem::take(&mut self.paper);
        GrayImage::from_raw(DOTS_PER_LINE, rows, paper).map(|image| Printout::new(name, image))
    }
}

/// Dots of a glyph as (column, row) within a 9x12 cell
fn glyph_dots(code: u8) -> impl Iterator<Item = (u32, u32)> {
    let printable = code != b' ';
    let strokes = (0..8u32)
        .filter(move |&c| printable && code & (1 << c) != 0)
        .flat_map(|c| (2..=9u32).map(move |r| (c, r)));
    let baseline = (0..8u32).filter(move |_| printable).map(|c| (c, 10));
    strokes.chain(baseline)
}

/// Render text the way the emulated printer prints it, without burn jitter
pub fn render_text(name: &str, mode: PrintMode, text: &[u8]) -> Printout {
    let mut mechanism = Mechanism::new(0, 0);
    mechanism.mode = mode;
    for &byte in text {
        match byte {
            LF => mechanism.print_line(),
            CR => {}
            _ => mechanism.push(byte),
        }
    }
    if !mechanism.line.is_empty() {
        mechanism.print_line();
    }
    mechanism
        .take_paper(name)
        .unwrap_or_else(|| Printout::blank(name, DOTS_PER_LINE, 0))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ParseState {
    Idle,
    Escape,
    PrintMode,
    EscapeNul,
    Config,
    Args { command: u8, args: Vec<u8>, needed: usize },
    Name(Vec<u8>),
}

struct Capture {
    name: String,
    active: bool,
    lines_at_start: u64,
    printout: Option<Printout>,
}

struct PrinterState {
    options: BTreeMap<ConfigOption, u8>,
    lines: HashMap<Interface, LineConfig>,
    echo: HashSet<Interface>,
    parsers: HashMap<Interface, ParseState>,
    measurements: HashMap<u8, i64>,
    mechanism: Mechanism,
    lines_printed: u64,
    name: String,
    capture: Capture,
}

fn default_options() -> BTreeMap<ConfigOption, u8> {
    let mut options: BTreeMap<ConfigOption, u8> = ConfigOption::ALL.into_iter().map(|o| (o, 0)).collect();
    let baud = LineConfig::DEFAULT.baud_rate.option_value();
    options.insert(ConfigOption::BaudRate1, baud);
    options.insert(ConfigOption::BaudRate2, baud);
    options
}

fn default_measurements() -> HashMap<u8, i64> {
    [
        (MeasureChannel::BatteryVoltage, 7400),
        (MeasureChannel::VccVoltage, 3300),
        (MeasureChannel::MechVoltage, 7400),
        (MeasureChannel::MechTemperature, 25),
        (MeasureChannel::PaperSensor, 1),
        (MeasureChannel::RtcPresent, 1),
        (MeasureChannel::FirmwareChecksum, 0x5A3C),
        (MeasureChannel::FontLibraryValid, 1),
        (MeasureChannel::FontLibraryVersionMajor, 1),
        (MeasureChannel::FontLibraryVersionMinor, 4),
    ]
    .into_iter()
    .map(|(channel, value)| (channel as u8, value))
    .collect()
}

fn flow_control_from_option(value: u8) -> FlowControl {
    match value {
        1 => FlowControl::Hardware,
        2 => FlowControl::Software,
        _ => FlowControl::None,
    }
}

/// Option value of a flow control setting
pub fn flow_control_option(flow: FlowControl) -> u8 {
    match flow {
        FlowControl::None => 0,
        FlowControl::Hardware => 1,
        FlowControl::Software => 2,
    }
}

/// Options addressing an interface's line settings: frame, baud, handshake
pub fn line_options(interface: Interface) -> Option<(ConfigOption, ConfigOption, ConfigOption)> {
    match interface {
        Interface::Rs232 => Some((
            ConfigOption::DataBitsParity1,
            ConfigOption::BaudRate1,
            ConfigOption::Handshake1,
        )),
        Interface::Infrared => Some((
            ConfigOption::DataBitsParity2,
            ConfigOption::BaudRate2,
            ConfigOption::Handshake2,
        )),
        Interface::Usb => None,
    }
}

fn absence_option(interface: Interface) -> ConfigOption {
    match interface {
        Interface::Usb => ConfigOption::HardwareNoUsb,
        Interface::Rs232 => ConfigOption::HardwareNoRs232,
        Interface::Infrared => ConfigOption::HardwareNoIr,
    }
}

impl PrinterState {
    fn option(&self, option: ConfigOption) -> u8 {
        self.options.get(&option).copied().unwrap_or(0)
    }

    fn stored_line_config(&self, interface: Interface) -> LineConfig {
        let Some((frame, baud, handshake)) = line_options(interface) else {
            return LineConfig::DEFAULT;
        };
        let baud_rate = BaudRate::from_option_value(self.option(baud)).unwrap_or_else(|_| {
            warn!("Invalid stored baud rate {} for {}", self.option(baud), interface);
            LineConfig::DEFAULT.baud_rate
        });
        let frame = FrameFormat::from_option_value(self.option(frame)).unwrap_or_else(|_| {
            warn!("Invalid stored frame format {} for {}", self.option(frame), interface);
            LineConfig::DEFAULT.frame
        });
        LineConfig::with_frame(baud_rate, frame).flow_control(flow_control_from_option(self.option(handshake)))
    }

    /// Restart: stored options take effect, print state is dropped
    fn reset(&mut self) {
        for interface in [Interface::Rs232, Interface::Infrared] {
            let config = self.stored_line_config(interface);
            if self.lines.get(&interface) != Some(&config) {
                info!("Emulated printer {} line now {}", interface, config);
            }
            self.lines.insert(interface, config);
        }
        self.parsers.clear();
        self.mechanism.clear_line();
        self.mechanism.mode = PrintMode {
            font: self.option(ConfigOption::DefaultFont).min(3),
            ..PrintMode::default()
        };
    }

    fn measure(&self, channel: u8) -> i64 {
        if channel >= MeasureChannel::ConfigOption1 as u8 {
            let number = channel - (MeasureChannel::ConfigOption1 as u8 - 1);
            return ConfigOption::from_number(number).map_or(0, |o| i64::from(self.option(o)));
        }
        if channel == MeasureChannel::MechBusy as u8 {
            return 0;
        }
        self.measurements.get(&channel).copied().unwrap_or(0)
    }

    fn print_line(&mut self) {
        self.mechanism.print_line();
        self.lines_printed += 1;
    }

    fn execute(&mut self, command: u8, args: &[u8], response: &mut Vec<u8>) {
        match (command, args) {
            (b'O', &[number, value]) => match ConfigOption::from_number(number) {
                Some(option) => {
                    debug!("Emulated printer option {} = {}", option, value);
                    self.options.insert(option, value);
                }
                None => debug!("Emulated printer ignoring unknown option {}", number),
            },
            (b'M', &[channel]) => {
                let value = self.measure(channel);
                response.extend_from_slice(format!("{value}\r").as_bytes());
            }
            (b'D', &[mode]) => debug!("Emulated printer debug mode {}", mode),
            (b'S', &[channel]) => {
                if channel == SetChannel::FeedPaper as u8 {
                    self.mechanism.feed(CELL_HEIGHT);
                }
            }
            _ => {}
        }
    }

    fn handle(&mut self, interface: Interface, byte: u8, response: &mut Vec<u8>) {
        let state = self.parsers.remove(&interface).unwrap_or(ParseState::Idle);
        let next = match state {
            ParseState::Idle => {
                match byte {
                    ESC => return self.set_parser(interface, ParseState::Escape),
                    CAN => self.mechanism.clear_line(),
                    LF => self.print_line(),
                    SO => self.mechanism.mode.double_width = true,
                    SI => self.mechanism.mode.double_width = false,
                    0x20..=0xFF => {
                        let before = self.mechanism.rows();
                        self.mechanism.push(byte);
                        if self.mechanism.rows() != before {
                            self.lines_printed += 1;
                        }
                    }
                    _ => {}
                }
                ParseState::Idle
            }
            ParseState::Escape => match byte {
                b'!' => ParseState::PrintMode,
                NUL => ParseState::EscapeNul,
                b'@' => {
                    self.mechanism.mode = PrintMode::default();
                    ParseState::Idle
                }
                _ => ParseState::Idle,
            },
            ParseState::PrintMode => {
                self.mechanism.mode = PrintMode::from_word(byte);
                ParseState::Idle
            }
            ParseState::EscapeNul => match byte {
                NUL => ParseState::Config,
                _ => ParseState::Idle,
            },
            ParseState::Config => match byte {
                b'O' => ParseState::Args { command: byte, args: Vec::new(), needed: 2 },
                b'M' | b'D' | b'S' => ParseState::Args { command: byte, args: Vec::new(), needed: 1 },
                b'N' => ParseState::Name(Vec::new()),
                b'@' => {
                    info!("Emulated printer reset");
                    self.reset();
                    return;
                }
                _ => ParseState::Idle,
            },
            ParseState::Args { command, mut args, needed } => {
                args.push(byte);
                if args.len() == needed {
                    self.execute(command, &args, response);
                    ParseState::Idle
                } else {
                    ParseState::Args { command, args, needed }
                }
            }
            ParseState::Name(mut name) => {
                if byte == NUL {
                    self.name = String::from_utf8_lossy(&name).into_owned();
                    debug!("Emulated printer name set to {}", self.name);
                    ParseState::Idle
                } else {
                    name.push(byte);
                    ParseState::Name(name)
                }
            }
        };
        self.set_parser(interface, next);
    }

    fn set_parser(&mut self, interface: Interface, state: ParseState) {
        if state != ParseState::Idle {
            self.parsers.insert(interface, state);
        }
    }

    /// Capture completes once something was printed and nothing is pending
    fn update_capture(&mut self) -> Option<CaptureState> {
        if !self.capture.active
            || self.lines_printed == self.capture.lines_at_start
            || !self.mechanism.line.is_empty()
        {
            return None;
        }
        self.capture.active = false;
        let name = self.capture.name.clone();
        self.capture.printout = self.mechanism.take_paper(&name);
        Some(CaptureState::Complete)
    }
}

struct Inner {
    state: Mutex<PrinterState>,
    capture_tx: watch::Sender<CaptureState>,
}

/// Emulated printer shared by its links
#[derive(Clone)]
pub struct EmulatedPrinter {
    inner: Arc<Inner>,
}

impl Default for EmulatedPrinter {
    fn default() -> Self {
        Self::new()
    }
}

impl EmulatedPrinter {
    /// Printer with factory defaults: every interface fitted, 9600/8N on
    /// RS232 and IR, font slot 0, no burn jitter
    pub fn new() -> Self {
        let mut state = PrinterState {
            options: default_options(),
            lines: HashMap::new(),
            echo: HashSet::new(),
            parsers: HashMap::new(),
            measurements: default_measurements(),
            mechanism: Mechanism::new(0, 0),
            lines_printed: 0,
            name: "Emulated printer".to_string(),
            capture: Capture {
                name: String::new(),
                active: false,
                lines_at_start: 0,
                printout: None,
            },
        };
        state.reset();
        let (capture_tx, _) = watch::channel(CaptureState::Idle);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                capture_tx,
            }),
        }
    }

    /// Mark an interface as not fitted
    #[must_use]
    pub fn without(self, interface: Interface) -> Self {
        self.inner.state.lock().options.insert(absence_option(interface), 1);
        self
    }

    /// Vary the darkness of burned dots between 0 and `variance`
    #[must_use]
    pub fn with_burn_variance(self, variance: u8, seed: u64) -> Self {
        {
            let mut state = self.inner.state.lock();
            state.mechanism.burn_variance = variance;
            state.mechanism.rng = StdRng::seed_from_u64(seed);
        }
        self
    }

    /// Whether an interface is fitted
    pub fn is_fitted(&self, interface: Interface) -> bool {
        self.inner.state.lock().option(absence_option(interface)) == 0
    }

    /// Current device-side line configuration of an interface
    pub fn line_config_of(&self, interface: Interface) -> LineConfig {
        self.inner
            .state
            .lock()
            .lines
            .get(&interface)
            .copied()
            .unwrap_or(LineConfig::DEFAULT)
    }

    /// Store line options for an interface and reset, as the option
    /// protocol would
    pub fn set_line_config(&self, interface: Interface, config: LineConfig) {
        let Some((frame, baud, handshake)) = line_options(interface) else {
            return;
        };
        let mut state = self.inner.state.lock();
        state.options.insert(frame, config.frame.option_value());
        state.options.insert(baud, config.baud_rate.option_value());
        state.options.insert(handshake, flow_control_option(config.flow_control));
        state.reset();
    }

    /// Stored value of an option
    pub fn option(&self, option: ConfigOption) -> u8 {
        self.inner.state.lock().option(option)
    }

    /// Echo received bytes back instead of interpreting them
    pub fn set_echo(&self, interface: Interface, enabled: bool) {
        let mut state = self.inner.state.lock();
        if enabled {
            state.echo.insert(interface);
        } else {
            state.echo.remove(&interface);
        }
    }

    /// Override a measurement channel
    pub fn set_measurement(&self, channel: MeasureChannel, value: i64) {
        self.inner.state.lock().measurements.insert(channel as u8, value);
    }

    /// Current print mode
    pub fn print_mode(&self) -> PrintMode {
        self.inner.state.lock().mechanism.mode
    }

    /// Device name set through the option protocol
    pub fn device_name(&self) -> String {
        self.inner.state.lock().name.clone()
    }

    /// Characters waiting for a line feed
    pub fn pending_text(&self) -> Vec<u8> {
        self.inner.state.lock().mechanism.line.clone()
    }
}

/// The echo loopback is 7-bit text; anything else comes back as the
/// replacement character
fn echo_byte(c: DecodedChar) -> u8 {
    if c.is_clean() && c.value.is_ascii() {
        c.value
    } else {
        REPLACEMENT
    }
}

impl EmulatedDevice for EmulatedPrinter {
    fn line_config(&self, interface: Interface) -> Option<LineConfig> {
        if interface.has_line_settings() {
            Some(self.line_config_of(interface))
        } else {
            None
        }
    }

    fn receive(&self, interface: Interface, chars: &[DecodedChar]) -> Vec<u8> {
        let mut state = self.inner.state.lock();
        if state.echo.contains(&interface) {
            return chars.iter().map(|c| echo_byte(*c)).collect();
        }

        let mut response = Vec::new();
        for c in chars {
            let byte = if c.is_clean() { c.value } else { REPLACEMENT };
            state.handle(interface, byte, &mut response);
        }

        if let Some(capture_state) = state.update_capture() {
            drop(state);
            self.inner.capture_tx.send_replace(capture_state);
        }
        response
    }
}

impl LinkFactory for EmulatedPrinter {
    fn connect(&self, interface: Interface) -> Result<Box<dyn LinkBackend>, TransportError> {
        if !self.is_fitted(interface) {
            return Err(TransportError::InterfaceUnavailable {
                interface,
                reason: "interface not fitted on the emulated printer".to_string(),
            });
        }
        Ok(Box::new(EmulatedLink::new(interface, Arc::new(self.clone()))))
    }
}

#[async_trait]
impl PrintoutCapture for EmulatedPrinter {
    async fn start_capture(&self, name: &str) {
        {
            let mut state = self.inner.state.lock();
            state.mechanism.paper.clear();
            state.capture = Capture {
                name: name.to_string(),
                active: true,
                lines_at_start: state.lines_printed,
                printout: None,
            };
        }
        debug!("Capture {} started", name);
        self.inner.capture_tx.send_replace(CaptureState::InProgress);
    }

    fn state(&self) -> CaptureState {
        *self.inner.capture_tx.borrow()
    }

    async fn await_completion(&self, timeout: Duration) -> Result<(), CaptureError> {
        let mut rx = self.inner.capture_tx.subscribe();
        if *rx.borrow() == CaptureState::Idle {
            return Err(CaptureError::NoPrintout);
        }
        let outcome = match tokio::time::timeout(timeout, rx.wait_for(|s| *s == CaptureState::Complete)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(CaptureError::NoPrintout),
            Err(_) => Err(CaptureError::Timeout(timeout)),
        };
        outcome
    }

    fn printout(&self) -> Result<Printout, CaptureError> {
        match self.state() {
            CaptureState::Complete => self
                .inner
                .state
                .lock()
                .capture
                .printout
                .clone()
                .ok_or(CaptureError::NoPrintout),
            CaptureState::InProgress => Err(CaptureError::NotComplete),
            CaptureState::Idle => Err(CaptureError::NoPrintout),
        }
    }

    async fn clear(&self) {
        {
            let mut state = self.inner.state.lock();
            state.mechanism.paper.clear();
            state.mechanism.clear_line();
            state.capture.active = false;
            state.capture.printout = None;
        }
        self.inner.capture_tx.send_replace(CaptureState::Idle);
    }
}
