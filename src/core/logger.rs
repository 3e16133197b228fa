//! Wire traffic logging
//!
//! Every channel keeps a bounded in-memory log of what crossed the link so a
//! failed test can dump the conversation that led to it.

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

/// Shared handle to a traffic log
pub type SharedTrafficLog = Arc<Mutex<TrafficLog>>;

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum LogFormat {
    /// Plain text
    #[default]
    Text,
    /// Hex dump
    Hex,
    /// Text for printable payloads, hex otherwise
    Mixed,
    /// JSON lines
    JsonLines,
}

impl LogFormat {
    /// Get file extension for format
    pub fn extension(&self) -> &'static str {
        match self {
            LogFormat::Text | LogFormat::Mixed => "txt",
            LogFormat::Hex => "hex",
            LogFormat::JsonLines => "jsonl",
        }
    }
}

/// Data direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Direction {
    /// From the device
    Received,
    /// To the device
    Sent,
    /// Annotation, no traffic
    Info,
}

impl Direction {
    fn tag(self) -> &'static str {
        match self {
            Direction::Received => "RX",
            Direction::Sent => "TX",
            Direction::Info => "##",
        }
    }
}

/// A single log entry
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LogEntry {
    /// When the bytes were seen
    pub timestamp: DateTime<Local>,
    /// Which way they went
    pub direction: Direction,
    /// Raw bytes
    pub data: Vec<u8>,
    /// Optional annotation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl LogEntry {
    /// Create new entry
    pub fn new(direction: Direction, data: Vec<u8>) -> Self {
        Self {
            timestamp: Local::now(),
            direction,
            data,
            note: None,
        }
    }

    /// Create with note
    pub fn with_note(direction: Direction, data: Vec<u8>, note: &str) -> Self {
        Self {
            note: Some(note.to_string()),
            ..Self::new(direction, data)
        }
    }

    fn prefix(&self, show_timestamp: bool) -> String {
        if show_timestamp {
            format!(
                "[{}] {}",
                self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
                self.direction.tag()
            )
        } else {
            self.direction.tag().to_string()
        }
    }

    fn suffix(&self) -> String {
        self.note
            .as_ref()
            .map(|note| format!(" ({note})"))
            .unwrap_or_default()
    }

    /// Format as text
    pub fn to_text(&self, show_timestamp: bool) -> String {
        format!(
            "{} {}{}",
            self.prefix(show_timestamp),
            String::from_utf8_lossy(&self.data).escape_debug(),
            self.suffix()
        )
    }

    /// Format as hex
    pub fn to_hex(&self, show_timestamp: bool) -> String {
        format!(
            "{} {}{}",
            self.prefix(show_timestamp),
            hex::encode_upper(&self.data),
            self.suffix()
        )
    }

    /// Format as JSON line
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    fn is_printable(&self) -> bool {
        self.data
            .iter()
            .all(|&b| (32..127).contains(&b) || matches!(b, b'\n' | b'\r' | b'\t'))
    }

    /// Format in the given style
    pub fn render(&self, format: LogFormat, show_timestamp: bool) -> String {
        match format {
            LogFormat::Text => self.to_text(show_timestamp),
            LogFormat::Hex => self.to_hex(show_timestamp),
            LogFormat::Mixed if self.is_printable() => self.to_text(show_timestamp),
            LogFormat::Mixed => self.to_hex(show_timestamp),
            LogFormat::JsonLines => self.to_json(),
        }
    }
}

/// Bounded traffic log
#[derive(Debug)]
pub struct TrafficLog {
    entries: Vec<LogEntry>,
    max_entries: usize,
    bytes_logged: usize,
}

impl Default for TrafficLog {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl TrafficLog {
    /// Create a log keeping at most `max_entries`
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_entries: max_entries.max(1),
            bytes_logged: 0,
        }
    }

    /// Create a shared handle
    pub fn shared(max_entries: usize) -> SharedTrafficLog {
        Arc::new(Mutex::new(Self::new(max_entries)))
    }

    fn push(&mut self, entry: LogEntry) {
        self.bytes_logged += entry.data.len();
        self.entries.push(entry);
        if self.entries.len() > self.max_entries {
            let excess = self.entries.len() - self.max_entries;
            self.entries.drain(..excess);
        }
    }

    /// Log sent data
    pub fn log_tx(&mut self, data: &[u8]) {
        self.push(LogEntry::new(Direction::Sent, data.to_vec()));
    }

    /// Log received data, annotated when line errors were detected
    pub fn log_rx(&mut self, data: &[u8], note: Option<&str>) {
        let entry = match note {
            Some(note) => LogEntry::with_note(Direction::Received, data.to_vec(), note),
            None => LogEntry::new(Direction::Received, data.to_vec()),
        };
        self.push(entry);
    }

    /// Log info message
    pub fn log_info(&mut self, message: &str) {
        self.push(LogEntry::new(Direction::Info, message.as_bytes().to_vec()));
    }

    /// Entries currently held
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Total payload bytes logged, including evicted entries
    pub fn bytes_logged(&self) -> usize {
        self.bytes_logged
    }

    /// Export entries to a string
    pub fn export(&self, format: LogFormat) -> String {
        let mut result = String::new();
        for entry in &self.entries {
            result.push_str(&entry.render(format, true));
            result.push('\n');
        }
        result
    }

    /// Append the log to a file
    pub fn write_to(&self, path: &Path, format: LogFormat) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(self.export(format).as_bytes())?;
        writer.flush()
    }
}

/// Generate log filename with timestamp
pub fn generate_log_filename(prefix: &str, format: LogFormat) -> String {
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    format!("{}_{}.{}", prefix, timestamp, format.extension())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_formats() {
        let entry = LogEntry::new(Direction::Sent, b"OK\r\n".to_vec());
        assert_eq!(entry.to_text(false), "TX OK\\r\\n");
        assert_eq!(entry.to_hex(false), "TX 4F4B0D0A");

        let binary = LogEntry::with_note(Direction::Received, vec![0x1B, 0x00], "parity x1");
        assert_eq!(binary.render(LogFormat::Mixed, false), "RX 1B00 (parity x1)");
        assert!(binary.to_json().contains("\"Received\""));
    }

    #[test]
    fn test_bounded_buffer() {
        let mut log = TrafficLog::new(3);
        for i in 0..5u8 {
            log.log_tx(&[i]);
        }
        assert_eq!(log.entries().len(), 3);
        assert_eq!(log.entries()[0].data, vec![2]);
        assert_eq!(log.bytes_logged(), 5);
    }

    #[test]
    fn test_write_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("traffic.txt");

        let mut log = TrafficLog::default();
        log.log_info("open RS232");
        log.log_tx(b"ping");
        log.write_to(&path, LogFormat::Text).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("## open RS232"));
        assert!(content.contains("TX ping"));
    }

    #[test]
    fn test_log_filename() {
        let name = generate_log_filename("rs232", LogFormat::Hex);
        assert!(name.starts_with("rs232_"));
        assert!(name.ends_with(".hex"));
    }
}
