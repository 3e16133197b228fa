//! UART line model
//!
//! Bytes are encoded into a waveform (idle high, start bit, data bits LSB
//! first, optional parity bit, one stop bit) at the sender's baud rate and
//! sampled back at bit centres using the receiver's configuration. Decoding
//! never fails: a receiver configured differently from the sender gets
//! garbled bytes plus parity and framing error flags, the same way a real
//! UART does.

use super::line::LineConfig;
use std::ops::AddAssign;
use std::time::Duration;

/// Time base of the model. Every supported bit period is an even number of
/// ticks, so bit centres fall on whole ticks.
pub const TICKS_PER_SECOND: u64 = 230_400;

/// Bit period in ticks for a line configuration
pub fn bit_period(config: &LineConfig) -> u64 {
    TICKS_PER_SECOND / u64::from(config.baud_rate.bits_per_second())
}

/// Parity and framing errors detected by a receiver
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct LineErrors {
    /// Characters whose parity bit did not match
    pub parity: u32,
    /// Characters whose stop bit was sampled low
    pub framing: u32,
}

impl LineErrors {
    /// No errors detected
    pub fn is_clean(&self) -> bool {
        self.parity == 0 && self.framing == 0
    }

    /// Total number of flagged characters
    pub fn total(&self) -> u32 {
        self.parity + self.framing
    }
}

impl AddAssign for LineErrors {
    fn add_assign(&mut self, rhs: Self) {
        self.parity += rhs.parity;
        self.framing += rhs.framing;
    }
}

/// One character as seen by the receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedChar {
    /// Data bits as sampled
    pub value: u8,
    /// Parity bit mismatch
    pub parity_error: bool,
    /// Stop bit sampled low
    pub framing_error: bool,
}

impl DecodedChar {
    /// Character was received without a detected error
    pub fn is_clean(&self) -> bool {
        !self.parity_error && !self.framing_error
    }
}

/// Result of sampling a waveform
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decoded {
    /// Characters in arrival order
    pub chars: Vec<DecodedChar>,
}

impl Decoded {
    /// Data bytes, errors ignored
    pub fn bytes(&self) -> Vec<u8> {
        self.chars.iter().map(|c| c.value).collect()
    }

    /// Error counts
    pub fn errors(&self) -> LineErrors {
        let mut errors = LineErrors::default();
        for c in &self.chars {
            if c.parity_error {
                errors.parity += 1;
            }
            if c.framing_error {
                errors.framing += 1;
            }
        }
        errors
    }
}

/// Logic levels on the line over time
///
/// Stored as level transitions. The line is high (idle) before the first
/// transition and after the end of the signal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineSignal {
    edges: Vec<(u64, bool)>,
    end: u64,
}

impl LineSignal {
    /// Level at tick `t`. A transition at `t` is already in effect.
    pub fn level_at(&self, t: u64) -> bool {
        if t >= self.end {
            return true;
        }
        let idx = self.edges.partition_point(|(at, _)| *at <= t);
        if idx == 0 {
            true
        } else {
            self.edges[idx - 1].1
        }
    }

    /// First high-to-low transition strictly after `t`
    pub fn next_falling_edge(&self, t: u64) -> Option<u64> {
        let idx = self.edges.partition_point(|(at, _)| *at <= t);
        self.edges[idx..]
            .iter()
            .find(|(_, level)| !*level)
            .map(|(at, _)| *at)
    }

    /// Length of the signal in ticks
    pub fn len_ticks(&self) -> u64 {
        self.end
    }

    /// Time on the wire
    pub fn duration(&self) -> Duration {
        Duration::from_nanos(self.end * 1_000_000_000 / TICKS_PER_SECOND)
    }

    fn push(&mut self, level: bool, ticks: u64) {
        let current = self.edges.last().map_or(true, |(_, l)| *l);
        if level != current {
            self.edges.push((self.end, level));
        }
        self.end += ticks;
    }
}

/// Encode bytes as the sender configured with `config` would put them on the wire
pub fn encode(data: &[u8], config: &LineConfig) -> LineSignal {
    let period = bit_period(config);
    let frame = config.frame;
    let mut signal = LineSignal::default();

    // One bit time of idle so the first start bit is a real edge
    signal.push(true, period);

    for &byte in data {
        let value = byte & frame.data_bits.mask();
        signal.push(false, period);
        for bit in 0..frame.data_bits.count() {
            signal.push((value >> bit) & 1 == 1, period);
        }
        if let Some(parity) = frame.parity.bit_for(value) {
            signal.push(parity, period);
        }
        signal.push(true, period);
    }

    signal
}

/// Sample a waveform as a receiver configured with `config` would
pub fn decode(signal: &LineSignal, config: &LineConfig) -> Decoded {
    let period = bit_period(config);
    let half = period / 2;
    let frame = config.frame;
    let mut decoded = Decoded::default();
    let mut cursor = 0;

    while let Some(start) = signal.next_falling_edge(cursor) {
        let centre = |bit: u64| start + half + bit * period;

        // False start: line back high by the middle of the start bit
        if signal.level_at(centre(0)) {
            cursor = centre(0);
            continue;
        }

        let mut value = 0u8;
        let mut bit = 1;
        for index in 0..frame.data_bits.count() {
            if signal.level_at(centre(bit)) {
                value |= 1 << index;
            }
            bit += 1;
        }

        let parity_error = match frame.parity.bit_for(value) {
            Some(expected) => signal.level_at(centre(bit)) != expected,
            None => false,
        };

        let stop = centre(u64::from(frame.bits_per_frame()) - 1);
        let framing_error = !signal.level_at(stop);

        decoded.chars.push(DecodedChar {
            value,
            parity_error,
            framing_error,
        });
        cursor = stop;
    }

    decoded
}

/// Encode with one configuration and decode with another
pub fn transmit(data: &[u8], sender: &LineConfig, receiver: &LineConfig) -> Decoded {
    decode(&encode(data, sender), receiver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::line::{BaudRate, FrameFormat};

    const TEXT: &[u8] = b"Martel Instruments is a leading manufacturer and global...\n";

    fn config(baud: BaudRate, frame: FrameFormat) -> LineConfig {
        LineConfig::with_frame(baud, frame)
    }

    #[test]
    fn test_bit_periods_are_even() {
        for baud in BaudRate::ALL {
            let period = bit_period(&config(baud, FrameFormat::EIGHT_NONE));
            assert!(period >= 2);
            assert_eq!(period % 2, 0, "{baud}");
        }
    }

    #[test]
    fn test_matching_configs_are_lossless() {
        for baud in BaudRate::ALL {
            for frame in FrameFormat::ALL {
                let cfg = config(baud, frame);
                let decoded = transmit(TEXT, &cfg, &cfg);
                assert_eq!(decoded.bytes(), TEXT, "{cfg}");
                assert!(decoded.errors().is_clean(), "{cfg}");
            }
        }
    }

    #[test]
    fn test_seven_bit_frames_drop_the_high_bit() {
        let cfg = config(BaudRate::B9600, FrameFormat::SEVEN_EVEN);
        let decoded = transmit(&[0xC1], &cfg, &cfg);
        assert_eq!(decoded.bytes(), vec![0x41]);
        assert!(decoded.errors().is_clean());
    }

    #[test]
    fn test_parity_mismatch_is_flagged_on_every_char() {
        let sender = config(BaudRate::B9600, FrameFormat::EIGHT_EVEN);
        let receiver = config(BaudRate::B9600, FrameFormat::EIGHT_ODD);
        let decoded = transmit(TEXT, &sender, &receiver);

        // Same framing, so the data survives but every parity bit is wrong
        assert_eq!(decoded.bytes(), TEXT);
        assert_eq!(decoded.errors().parity as usize, TEXT.len());
    }

    #[test]
    fn test_eight_bits_read_as_seven_gives_framing_errors() {
        let sender = config(BaudRate::B9600, FrameFormat::EIGHT_NONE);
        let receiver = config(BaudRate::B9600, FrameFormat::SEVEN_NONE);
        let decoded = transmit(b"Martel", &sender, &receiver);

        // The stop sample lands on bit 7, which is low for ASCII
        assert!(decoded.errors().framing > 0);
    }

    #[test]
    fn test_baud_mismatch_garbles() {
        let sender = config(BaudRate::B9600, FrameFormat::EIGHT_NONE);
        let receiver = config(BaudRate::B19200, FrameFormat::EIGHT_NONE);
        let decoded = transmit(TEXT, &sender, &receiver);
        assert_ne!(decoded.bytes(), TEXT);

        let receiver = config(BaudRate::B4800, FrameFormat::EIGHT_NONE);
        let decoded = transmit(TEXT, &sender, &receiver);
        assert_ne!(decoded.bytes(), TEXT);
    }

    #[test]
    fn test_signal_levels() {
        let cfg = config(BaudRate::B115200, FrameFormat::EIGHT_NONE);
        let signal = encode(&[0x00], &cfg);
        let period = bit_period(&cfg);

        assert!(signal.level_at(0));
        assert!(!signal.level_at(period));
        assert!(!signal.level_at(period * 10 - 1));
        assert!(signal.level_at(period * 10));
        assert!(signal.level_at(signal.len_ticks() + 100));
        assert_eq!(signal.next_falling_edge(0), Some(period));
        assert_eq!(signal.next_falling_edge(period), None);
    }

    #[test]
    fn test_signal_length_follows_frame_size() {
        for frame in FrameFormat::ALL {
            let cfg = config(BaudRate::B9600, frame);
            let signal = encode(b"abc", &cfg);
            let bits = 1 + 3 * u64::from(frame.bits_per_frame());
            assert_eq!(signal.len_ticks(), bits * bit_period(&cfg), "{frame}");
        }
    }

    #[test]
    fn test_duration() {
        let cfg = config(BaudRate::B9600, FrameFormat::EIGHT_NONE);
        // idle bit plus one 10-bit frame
        let signal = encode(b"A", &cfg);
        assert_eq!(signal.len_ticks(), 11 * 24);
        assert_eq!(signal.duration(), Duration::from_nanos(11 * 24 * 1_000_000_000 / 230_400));
    }
}
