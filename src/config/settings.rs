//! Bench settings

use super::ConfigError;
use crate::core::logger::LogFormat;
use crate::core::printout::{CompareMode, Tolerance};
use crate::core::transport::{HardwarePorts, Interface, LineConfig, PortSpec, TransportError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// File name looked up in the working and config directories
pub const CONFIG_FILE_NAME: &str = "printer-hil.toml";

/// Bench configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HilConfig {
    /// Port per interface
    pub interfaces: InterfacesConfig,
    /// Line configuration per interface
    pub line: LineSettings,
    /// Timeouts
    pub timing: TimingConfig,
    /// Printout comparison
    pub comparison: ComparisonConfig,
    /// Sample and output locations
    pub paths: PathsConfig,
    /// Logging
    pub logging: LoggingConfig,
}

impl HilConfig {
    /// Load `path`, or the first config file found, or defaults
    ///
    /// Returns the file the settings came from.
    pub fn load(path: Option<&Path>) -> Result<(Self, Option<PathBuf>), ConfigError> {
        let path = match path {
            Some(path) if !path.is_file() => return Err(ConfigError::NotFound(path.to_path_buf())),
            Some(path) => Some(path.to_path_buf()),
            None => super::find_config_file(),
        };
        match path {
            Some(path) => Ok((Self::load_from(&path)?, Some(path))),
            None => Ok((Self::default(), None)),
        }
    }

    /// Load a config file
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;
        Ok(config)
    }

    /// Parse and validate TOML
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Write to a file, creating parent directories
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io)?;
        }
        std::fs::write(path, self.to_toml()?).map_err(io)
    }

    /// Line configurations must be realizable on their interface
    pub fn validate(&self) -> Result<(), ConfigError> {
        for interface in Interface::ALL {
            interface
                .validate(&self.line.get(interface))
                .map_err(|e| ConfigError::Invalid(format!("[line] {}: {e}", key(interface))))?;
        }
        let fraction = self.comparison.max_diff_fraction;
        if !(0.0..=1.0).contains(&fraction) {
            return Err(ConfigError::Invalid(format!(
                "[comparison] max_diff_fraction must be within 0.0-1.0, got {fraction}"
            )));
        }
        Ok(())
    }

    /// Hardware ports for interfaces not set to `emulated`
    pub fn hardware_ports(&self) -> HardwarePorts {
        Interface::ALL
            .into_iter()
            .filter_map(|interface| match self.interfaces.get(interface) {
                PortSetting::Hardware(spec) => Some((interface, spec.clone())),
                PortSetting::Emulated => None,
            })
            .fold(HardwarePorts::new(), |ports, (interface, spec)| ports.with_port(interface, spec))
    }
}

fn key(interface: Interface) -> &'static str {
    match interface {
        Interface::Usb => "usb",
        Interface::Rs232 => "rs232",
        Interface::Infrared => "ir",
    }
}

/// Where an interface is connected
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PortSetting {
    /// The emulated printer
    #[default]
    Emulated,
    /// A serial port, or `auto` for USB detection
    Hardware(PortSpec),
}

impl fmt::Display for PortSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Emulated => write!(f, "emulated"),
            Self::Hardware(spec) => write!(f, "{spec}"),
        }
    }
}

impl FromStr for PortSetting {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("emulated") {
            Ok(Self::Emulated)
        } else {
            Ok(Self::Hardware(s.parse()?))
        }
    }
}

impl TryFrom<String> for PortSetting {
    type Error = TransportError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PortSetting> for String {
    fn from(setting: PortSetting) -> Self {
        setting.to_string()
    }
}

/// `[interfaces]`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfacesConfig {
    /// USB virtual COM port
    pub usb: PortSetting,
    /// RS232 port
    pub rs232: PortSetting,
    /// IrDA adapter port
    pub ir: PortSetting,
}

impl InterfacesConfig {
    /// Setting for an interface
    pub fn get(&self, interface: Interface) -> &PortSetting {
        match interface {
            Interface::Usb => &self.usb,
            Interface::Rs232 => &self.rs232,
            Interface::Infrared => &self.ir,
        }
    }

    /// Whether every interface is emulated
    pub fn all_emulated(&self) -> bool {
        Interface::ALL.into_iter().all(|i| *self.get(i) == PortSetting::Emulated)
    }
}

/// `[line]`, e.g. `rs232 = "9600/8/None"` or `ir = "Default"`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LineSettings {
    /// USB
    pub usb: LineConfig,
    /// RS232
    pub rs232: LineConfig,
    /// IR
    pub ir: LineConfig,
}

impl LineSettings {
    /// Line configuration for an interface
    pub fn get(&self, interface: Interface) -> LineConfig {
        match interface {
            Interface::Usb => self.usb,
            Interface::Rs232 => self.rs232,
            Interface::Infrared => self.ir,
        }
    }
}

/// `[timing]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Wait for an echo (ms)
    pub echo_timeout_ms: u64,
    /// Wait for a print to complete (ms)
    pub capture_timeout_ms: u64,
    /// Wait for a measure response (ms)
    pub response_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            echo_timeout_ms: 500,
            capture_timeout_ms: 5000,
            response_timeout_ms: 2000,
        }
    }
}

impl TimingConfig {
    /// Wait for an echo
    pub fn echo_timeout(&self) -> Duration {
        Duration::from_millis(self.echo_timeout_ms)
    }

    /// Wait for a print to complete
    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }

    /// Wait for a measure response
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

/// `[comparison]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComparisonConfig {
    /// Default strictness
    pub mode: CompareMode,
    /// Grey levels ignored per pixel in tolerant mode
    pub pixel_threshold: u8,
    /// Fraction of differing pixels still matching in tolerant mode
    pub max_diff_fraction: f64,
    /// Burn darkness variance of the emulated print head
    pub burn_variance: u8,
}

impl Default for ComparisonConfig {
    fn default() -> Self {
        let tolerance = Tolerance::default();
        Self {
            mode: CompareMode::Exact,
            pixel_threshold: tolerance.pixel_threshold,
            max_diff_fraction: tolerance.max_diff_fraction,
            burn_variance: 0,
        }
    }
}

impl ComparisonConfig {
    /// Tolerant-mode thresholds
    pub fn tolerance(&self) -> Tolerance {
        Tolerance::default()
            .with_pixel_threshold(self.pixel_threshold)
            .with_max_diff_fraction(self.max_diff_fraction)
    }
}

/// `[paths]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Sample root; run directories below it
    pub samples: PathBuf,
    /// Output root for comparisons and traffic logs
    pub output: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            samples: PathBuf::from("samples"),
            output: PathBuf::from("output"),
        }
    }
}

impl PathsConfig {
    /// Comparison images of failed checks
    pub fn compare_dir(&self) -> PathBuf {
        self.output.join("compare")
    }
}

/// `[logging]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive when neither `-v` nor `RUST_LOG` is given
    pub level: String,
    /// Also log to a daily rolling file
    pub file: bool,
    /// Directory for log files
    pub directory: Option<PathBuf>,
    /// Traffic log entries kept per channel
    pub traffic_entries: usize,
    /// Traffic log rendering
    pub traffic_format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: false,
            directory: super::log_dir(),
            traffic_entries: 10_000,
            traffic_format: LogFormat::Mixed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::{BaudRate, FrameFormat};

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = HilConfig::from_toml("").unwrap();
        assert_eq!(config, HilConfig::default());
        assert_eq!(config.line.rs232, LineConfig::DEFAULT);
        assert!(config.interfaces.all_emulated());
        assert_eq!(config.timing.echo_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn test_full_file() {
        let config = HilConfig::from_toml(
            r#"
            [interfaces]
            usb = "auto"
            rs232 = "/dev/ttyUSB0"

            [line]
            rs232 = "19200/8/Odd"
            ir = "Default"

            [timing]
            capture_timeout_ms = 8000

            [comparison]
            mode = "tolerant"
            pixel_threshold = 30

            [paths]
            samples = "/srv/samples"
            "#,
        )
        .unwrap();

        assert_eq!(config.interfaces.usb, PortSetting::Hardware(PortSpec::Auto));
        assert_eq!(config.interfaces.ir, PortSetting::Emulated);
        assert_eq!(
            config.line.rs232,
            LineConfig::with_frame(BaudRate::B19200, FrameFormat::EIGHT_ODD)
        );
        assert_eq!(config.line.ir, LineConfig::DEFAULT);
        assert_eq!(config.timing.capture_timeout(), Duration::from_secs(8));
        assert_eq!(config.timing.echo_timeout_ms, 500);
        assert_eq!(config.comparison.mode, CompareMode::Tolerant);
        assert_eq!(config.comparison.tolerance().pixel_threshold, 30);
        assert_eq!(config.paths.compare_dir(), PathBuf::from("output/compare"));

        let ports = config.hardware_ports();
        assert_eq!(ports.port(Interface::Rs232), Some(&PortSpec::Path("/dev/ttyUSB0".into())));
        assert_eq!(ports.port(Interface::Infrared), None);
    }

    #[test]
    fn test_rejects_unrealizable_line() {
        let err = HilConfig::from_toml("[line]\nir = \"4800/8/None\"").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)), "{err}");

        let err = HilConfig::from_toml("[line]\nrs232 = \"14400/8/None\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }), "{err}");

        let err = HilConfig::from_toml("[comparison]\nmax_diff_fraction = 2.0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)), "{err}");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE_NAME);

        let mut config = HilConfig::default();
        config.line.ir = LineConfig::with_frame(BaudRate::B115200, FrameFormat::EIGHT_EVEN);
        config.interfaces.usb = PortSetting::Hardware(PortSpec::Path("COM7".into()));
        config.save(&path).unwrap();

        let (loaded, source) = HilConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(source.as_deref(), Some(path.as_path()));

        assert!(matches!(
            HilConfig::load(Some(&dir.path().join("missing.toml"))),
            Err(ConfigError::NotFound(_))
        ));
    }
}
