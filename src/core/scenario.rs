//! Acceptance scenarios on the emulated bench
//!
//! Each scenario drives the emulated printer through a [`TransportManager`]
//! the same way a hardware test would: configure the line, print or echo,
//! wait for the capture and compare against a sample. Steps that do not go
//! as expected are recorded as failures; only infrastructure errors (missing
//! samples, unavailable interfaces) abort a scenario.

use crate::core::capture::{capture_printout, CaptureError, PrintoutCapture};
use crate::core::logger::{generate_log_filename, LogFormat, SharedTrafficLog};
use crate::core::printer::{render_text, EmulatedPrinter, PrintMode, Printer, PrinterError};
use crate::core::printout::{
    ArtifactDir, CompareMode, Comparator, Printout, PrintoutError, Sample, SampleName, SampleStore, Tolerance,
};
use crate::core::transport::{BaudRate, Channel, FrameFormat, Interface, LineConfig, TransportError, TransportManager};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

/// Text printed by the scenarios
pub const SAMPLE_TEXT: &str = "Martel Instruments is a leading manufacturer and global supplier of bespoke and innovative commercial printing solutions.";

/// Payload for echo steps
pub const ECHO_PAYLOAD: &[u8] = b"Martel Instruments\r\n";

/// Sample fonts and the font slot they are loaded into
pub const SAMPLE_FONTS: [(&str, u8); 3] = [("arial9", 0), ("arial12", 1), ("arial16", 2)];

/// Sample texts by name
pub const SAMPLE_TEXTS: [(&str, &str); 2] = [
    ("text_short", SAMPLE_TEXT),
    ("text_digits", "0123456789 +-*/ 0123456789"),
];

/// Sample the print scenarios compare against
pub const MATCH_SAMPLE: &str = "arial16_sample_text_short";
const MATCH_FONT_SLOT: u8 = 2;

/// Scenario errors
#[derive(Error, Debug)]
pub enum ScenarioError {
    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Printer command failure
    #[error(transparent)]
    Printer(#[from] PrinterError),

    /// Sample or artifact failure
    #[error(transparent)]
    Printout(#[from] PrintoutError),

    /// Unknown scenario name
    #[error("Unknown scenario: {0}")]
    UnknownScenario(String),
}

/// Built-in scenarios
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScenarioKind {
    /// Print at the factory setting and match the sample exactly
    SampleMatch,
    /// Frame format mismatch, then recovery without reopening
    FrameRecovery,
    /// Echo every supported configuration and print at every baud rate
    BaudSweep,
}

impl ScenarioKind {
    /// All scenarios in run order
    pub const ALL: [ScenarioKind; 3] = [Self::SampleMatch, Self::FrameRecovery, Self::BaudSweep];
}

impl fmt::Display for ScenarioKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SampleMatch => write!(f, "sample-match"),
            Self::FrameRecovery => write!(f, "frame-recovery"),
            Self::BaudSweep => write!(f, "baud-sweep"),
        }
    }
}

impl FromStr for ScenarioKind {
    type Err = ScenarioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.to_string().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ScenarioError::UnknownScenario(s.to_string()))
    }
}

/// Outcome of one step
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    /// Step name
    pub name: String,
    /// Whether the step went as expected
    pub passed: bool,
    /// What was observed
    pub detail: String,
    /// Comparison image written for a failed print step
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<PathBuf>,
}

impl StepResult {
    fn new(name: impl Into<String>, passed: bool, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed,
            detail: detail.into(),
            artifact: None,
        }
    }
}

/// Outcome of a scenario
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    /// Scenario run
    pub scenario: ScenarioKind,
    /// Whether every step passed
    pub passed: bool,
    /// Steps in order
    pub steps: Vec<StepResult>,
    /// Wall time
    pub duration_ms: u64,
    /// Traffic log written for a failed run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traffic_log: Option<PathBuf>,
}

impl ScenarioReport {
    /// Empty report, passing until a step fails
    pub fn new(scenario: ScenarioKind) -> Self {
        Self {
            scenario,
            passed: true,
            steps: Vec::new(),
            duration_ms: 0,
            traffic_log: None,
        }
    }

    fn record(&mut self, step: StepResult) {
        if step.passed {
            info!("[{}] {}: {}", self.scenario, step.name, step.detail);
        } else {
            warn!("[{}] {} FAILED: {}", self.scenario, step.name, step.detail);
            self.passed = false;
        }
        self.steps.push(step);
    }

    /// Steps that did not pass
    pub fn failures(&self) -> impl Iterator<Item = &StepResult> {
        self.steps.iter().filter(|s| !s.passed)
    }

    /// One-line summary
    pub fn summary(&self) -> String {
        let failed = self.failures().count();
        format!(
            "{}: {} ({} steps, {} failed, {} ms)",
            self.scenario,
            if self.passed { "PASS" } else { "FAIL" },
            self.steps.len(),
            failed,
            self.duration_ms
        )
    }
}

/// Tunables for scenario runs
#[derive(Debug, Clone)]
pub struct ScenarioSettings {
    /// Interface the scenarios talk over; must carry line settings
    pub interface: Interface,
    /// Wait for an echo
    pub echo_timeout: Duration,
    /// Wait for a print to complete
    pub capture_timeout: Duration,
    /// Comparison strictness for print steps
    pub mode: CompareMode,
    /// Thresholds for tolerant comparison
    pub tolerance: Tolerance,
    /// Burn darkness variance of the emulated print head
    pub burn_variance: u8,
    /// Seed for the burn variance
    pub seed: u64,
    /// Where failed comparisons and traffic logs are written, if anywhere
    pub artifacts: Option<ArtifactDir>,
    /// Rendering of traffic logs written for failed runs
    pub traffic_format: LogFormat,
}

impl Default for ScenarioSettings {
    fn default() -> Self {
        Self {
            interface: Interface::Rs232,
            echo_timeout: Duration::from_millis(500),
            capture_timeout: Duration::from_secs(2),
            mode: CompareMode::Exact,
            tolerance: Tolerance::default(),
            burn_variance: 0,
            seed: 0,
            artifacts: None,
            traffic_format: LogFormat::Mixed,
        }
    }
}

/// Render every sample font and text into `store`
pub fn generate_samples(store: &SampleStore) -> Result<Vec<SampleName>, PrintoutError> {
    let mut names = Vec::new();
    for (font, slot) in SAMPLE_FONTS {
        for (text_name, text) in SAMPLE_TEXTS {
            let name = SampleName::new(font, "sample", text_name);
            let mode = PrintMode {
                font: slot,
                ..PrintMode::default()
            };
            let mut bytes = text.as_bytes().to_vec();
            bytes.push(b'\n');
            store.save_sample(&name, &render_text(&name.to_string(), mode, &bytes))?;
            names.push(name);
        }
    }
    info!("Generated {} samples in {}", names.len(), store.dir().display());
    Ok(names)
}

/// Latest sample run under `root` that holds the match sample, or a freshly
/// rendered run when there is none
pub fn prepare_samples(root: &Path) -> Result<SampleStore, PrintoutError> {
    match SampleStore::latest(root) {
        Ok(store) if store.path_of(MATCH_SAMPLE).is_file() => return Ok(store),
        Ok(store) => warn!("No {} in {}, rendering samples", MATCH_SAMPLE, store.dir().display()),
        Err(PrintoutError::SampleNotFound(_)) => info!("No samples under {}, rendering them", root.display()),
        Err(e) => return Err(e),
    }
    let store = SampleStore::new_run(root)?;
    generate_samples(&store)?;
    Ok(store)
}

/// Emulated printer with its transport manager and sample store
pub struct Bench {
    printer: EmulatedPrinter,
    manager: TransportManager,
    samples: SampleStore,
    comparator: Comparator,
    settings: ScenarioSettings,
}

impl Bench {
    /// Bench with a fresh emulated printer
    pub fn new(samples: SampleStore, settings: ScenarioSettings) -> Self {
        Self::with_printer(EmulatedPrinter::new(), samples, settings)
    }

    /// Bench around an existing emulated printer
    pub fn with_printer(printer: EmulatedPrinter, samples: SampleStore, settings: ScenarioSettings) -> Self {
        let printer = printer.with_burn_variance(settings.burn_variance, settings.seed);
        Self {
            manager: TransportManager::new(printer.clone()),
            comparator: Comparator::new(settings.tolerance),
            printer,
            samples,
            settings,
        }
    }

    /// Device side
    pub fn printer(&self) -> &EmulatedPrinter {
        &self.printer
    }

    /// Host side
    pub fn manager(&self) -> &TransportManager {
        &self.manager
    }

    /// Run one scenario
    pub async fn run(&self, kind: ScenarioKind) -> Result<ScenarioReport, ScenarioError> {
        info!("Running scenario {} over {}", kind, self.settings.interface);
        let started = Instant::now();
        self.printer.set_echo(self.settings.interface, false);
        self.printer.set_line_config(self.settings.interface, LineConfig::DEFAULT);
        self.printer.clear().await;

        let mut report = ScenarioReport::new(kind);
        let mut channel = self.manager.open(self.settings.interface).await?;
        let outcome = match kind {
            ScenarioKind::SampleMatch => self.sample_match(&channel, &mut report).await,
            ScenarioKind::FrameRecovery => {
                self.frame_recovery(&mut channel, FrameFormat::EIGHT_ODD, FrameFormat::EIGHT_EVEN, &mut report)
                    .await
            }
            ScenarioKind::BaudSweep => self.baud_sweep(&mut channel, &mut report).await,
        };
        let traffic = channel.traffic_log();
        channel.teardown().await;
        outcome?;

        report.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        if !report.passed {
            report.traffic_log = self.save_traffic(kind, &traffic);
        }
        info!("{}", report.summary());
        Ok(report)
    }

    fn save_traffic(&self, kind: ScenarioKind, traffic: &SharedTrafficLog) -> Option<PathBuf> {
        let artifacts = self.settings.artifacts.as_ref()?;
        let format = self.settings.traffic_format;
        let path = artifacts
            .dir()
            .join(generate_log_filename(&kind.to_string(), format));
        match traffic.lock().write_to(&path, format) {
            Ok(()) => Some(path),
            Err(e) => {
                warn!("Cannot write traffic log {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Run every scenario in order
    pub async fn run_all(&self) -> Result<Vec<ScenarioReport>, ScenarioError> {
        let mut reports = Vec::with_capacity(ScenarioKind::ALL.len());
        for kind in ScenarioKind::ALL {
            reports.push(self.run(kind).await?);
        }
        Ok(reports)
    }

    async fn sample_match(&self, channel: &Channel, report: &mut ScenarioReport) -> Result<(), ScenarioError> {
        let sample = self.samples.load_sample(MATCH_SAMPLE)?;
        let printed = self.print(channel, "sample_match").await?;
        report.record(self.check_printout(&format!("print at {}", channel.config()), printed, &sample, true)?);
        Ok(())
    }

    /// Device at `device_frame`, host first at `host_frame`, then corrected
    pub async fn frame_recovery(
        &self,
        channel: &mut Channel,
        device_frame: FrameFormat,
        host_frame: FrameFormat,
        report: &mut ScenarioReport,
    ) -> Result<(), ScenarioError> {
        let interface = channel.interface();
        let sample = self.samples.load_sample(MATCH_SAMPLE)?;
        let baud = channel.config().baud_rate;

        self.printer
            .set_line_config(interface, LineConfig::with_frame(baud, device_frame));
        channel.configure(LineConfig::with_frame(baud, host_frame)).await?;

        self.printer.set_echo(interface, true);
        let echo = channel.exchange(ECHO_PAYLOAD, self.settings.echo_timeout).await?;
        report.record(StepResult::new(
            format!("echo with host {host_frame}, device {device_frame}"),
            !echo.matched,
            format!("{} line errors, timed out: {}", echo.errors.total(), echo.timed_out),
        ));
        self.printer.set_echo(interface, false);

        let printed = self.print(channel, "frame_mismatch").await?;
        report.record(self.check_printout(
            &format!("print with host {host_frame}, device {device_frame}"),
            printed,
            &sample,
            false,
        )?);

        channel.configure(LineConfig::with_frame(baud, device_frame)).await?;
        Printer::new(channel).clear_buffer()?;

        self.printer.set_echo(interface, true);
        let echo = channel.exchange(ECHO_PAYLOAD, self.settings.echo_timeout).await?;
        report.record(StepResult::new(
            format!("echo after switching host to {device_frame}"),
            echo.matched,
            format!("received {:?}", String::from_utf8_lossy(&echo.received)),
        ));
        self.printer.set_echo(interface, false);

        let printed = self.print(channel, "frame_recovered").await?;
        report.record(self.check_printout(
            &format!("print after switching host to {device_frame}"),
            printed,
            &sample,
            true,
        )?);

        report.record(StepResult::new(
            "channel kept open",
            channel.is_open(),
            format!("{} reconfigurations", channel.stats().reconfigurations),
        ));
        Ok(())
    }

    async fn baud_sweep(&self, channel: &mut Channel, report: &mut ScenarioReport) -> Result<(), ScenarioError> {
        let interface = channel.interface();
        let sample = self.samples.load_sample(MATCH_SAMPLE)?;

        for (i, baud) in BaudRate::ALL.into_iter().enumerate() {
            if interface.validate(&LineConfig::with_frame(baud, FrameFormat::EIGHT_NONE)).is_err() {
                continue;
            }

            self.printer.set_echo(interface, true);
            for frame in FrameFormat::ALL {
                let config = LineConfig::with_frame(baud, frame);
                if interface.validate(&config).is_err() {
                    continue;
                }
                self.printer.set_line_config(interface, config);
                channel.configure(config).await?;
                let matched = channel
                    .send_and_expect_echo(ECHO_PAYLOAD, self.settings.echo_timeout)
                    .await?;
                report.record(StepResult::new(format!("echo at {config}"), matched, "both sides equal"));
            }

            // Device one rate up (or down from the top) with the same frame
            let other = BaudRate::ALL[if i + 1 < BaudRate::ALL.len() { i + 1 } else { i - 1 }];
            let host = LineConfig::with_frame(baud, FrameFormat::EIGHT_NONE);
            self.printer
                .set_line_config(interface, LineConfig::with_frame(other, FrameFormat::EIGHT_NONE));
            channel.configure(host).await?;
            let matched = channel
                .send_and_expect_echo(ECHO_PAYLOAD, self.settings.echo_timeout)
                .await?;
            report.record(StepResult::new(
                format!("echo at {host} against device at {other}"),
                !matched,
                "rates differ",
            ));
            self.printer.set_echo(interface, false);

            self.printer.set_line_config(interface, host);
            let printed = self.print(channel, &format!("baud_{baud}")).await?;
            report.record(self.check_printout(&format!("print at {host}"), printed, &sample, true)?);
        }

        self.printer.set_line_config(interface, LineConfig::DEFAULT);
        Ok(())
    }

    /// Clear the print buffer, then print the sample text and capture it
    async fn print(&self, channel: &Channel, name: &str) -> Result<Result<Printout, CaptureError>, PrinterError> {
        let printer = Printer::new(channel);
        printer.clear_buffer()?;
        capture_printout(&self.printer, name, self.settings.capture_timeout, move || async move {
            printer.print_mode(MATCH_FONT_SLOT, false, false)?;
            printer.println(SAMPLE_TEXT)?;
            channel.flush().await?;
            Ok::<(), PrinterError>(())
        })
        .await
    }

    /// Compare a capture with a sample; `expect_match` says which outcome passes
    fn check_printout(
        &self,
        step: &str,
        printed: Result<Printout, CaptureError>,
        sample: &Sample,
        expect_match: bool,
    ) -> Result<StepResult, ScenarioError> {
        let printout = match printed {
            Ok(printout) => printout,
            Err(e) => return Ok(StepResult::new(step, !expect_match, e.to_string())),
        };

        let result = self.comparator.compare(&printout, sample, self.settings.mode);
        let detail = format!(
            "{} comparison: {} ({:.2}% of pixels differ)",
            result.mode,
            if result.matched { "match" } else { "no match" },
            result.diff_percentage()
        );
        let mut step_result = StepResult::new(step, result.matched == expect_match, detail);

        if !step_result.passed {
            if let Some(artifacts) = &self.settings.artifacts {
                step_result.artifact = Some(artifacts.save_failure(step, &printout, sample)?);
            }
        }
        Ok(step_result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bench(settings: ScenarioSettings) -> (Bench, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SampleStore::open(dir.path());
        generate_samples(&store).unwrap();
        (Bench::new(store, settings), dir)
    }

    #[test]
    fn test_scenario_names() {
        for kind in ScenarioKind::ALL {
            assert_eq!(kind.to_string().parse::<ScenarioKind>().unwrap(), kind);
        }
        assert!("everything".parse::<ScenarioKind>().is_err());
    }

    #[test]
    fn test_generated_samples_follow_naming() {
        let dir = tempfile::tempdir().unwrap();
        let store = SampleStore::open(dir.path());
        let names = generate_samples(&store).unwrap();
        assert_eq!(names.len(), SAMPLE_FONTS.len() * SAMPLE_TEXTS.len());
        assert_eq!(store.list().unwrap().len(), names.len());
        assert!(store.load_sample(MATCH_SAMPLE).is_ok());
    }

    #[test]
    fn test_prepare_samples_renders_once_then_reuses() {
        let root = tempfile::tempdir().unwrap();
        let samples = root.path().join("samples");

        let first = prepare_samples(&samples).unwrap();
        assert!(first.dir().starts_with(&samples));
        assert!(first.load_sample(MATCH_SAMPLE).is_ok());

        let second = prepare_samples(&samples).unwrap();
        assert_eq!(second.dir(), first.dir());
        assert_eq!(std::fs::read_dir(&samples).unwrap().count(), 1);
    }

    #[test]
    fn test_prepare_samples_prefers_configured_files() {
        let root = tempfile::tempdir().unwrap();
        let flat = SampleStore::open(root.path());
        generate_samples(&flat).unwrap();

        let store = prepare_samples(root.path()).unwrap();
        assert_eq!(store.dir(), root.path());

        // A run without the match sample gets a rendered run beside it
        let stale = tempfile::tempdir().unwrap();
        std::fs::create_dir(stale.path().join("2000-01-01_000000")).unwrap();
        let store = prepare_samples(stale.path()).unwrap();
        assert_ne!(store.dir(), stale.path().join("2000-01-01_000000"));
        assert!(store.load_sample(MATCH_SAMPLE).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sample_match_passes() {
        let (bench, _dir) = bench(ScenarioSettings::default());
        let report = bench.run(ScenarioKind::SampleMatch).await.unwrap();
        assert!(report.passed, "{report:?}");
        assert_eq!(report.steps.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frame_recovery_leaves_no_artifacts_when_passing() {
        let out = tempfile::tempdir().unwrap();
        let settings = ScenarioSettings {
            artifacts: Some(ArtifactDir::new(out.path())),
            ..ScenarioSettings::default()
        };
        let (bench, _dir) = bench(settings);
        let report = bench.run(ScenarioKind::FrameRecovery).await.unwrap();
        assert!(report.passed, "{report:?}");
        assert_eq!(report.steps.len(), 5);
        // The garbled print is an expected mismatch, not a failure
        assert!(report.steps.iter().all(|s| s.artifact.is_none()));
        assert!(report.traffic_log.is_none());
        assert!(!out.path().exists() || std::fs::read_dir(out.path()).unwrap().next().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_sample_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let bench = Bench::new(SampleStore::open(dir.path()), ScenarioSettings::default());
        assert!(matches!(
            bench.run(ScenarioKind::SampleMatch).await,
            Err(ScenarioError::Printout(PrintoutError::SampleNotFound(_)))
        ));
        assert!(!bench.manager().is_open(Interface::Rs232));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tolerant_mode_absorbs_burn_variance() {
        let exact = ScenarioSettings {
            burn_variance: 40,
            seed: 3,
            ..ScenarioSettings::default()
        };
        let tolerant = ScenarioSettings {
            mode: CompareMode::Tolerant,
            ..exact.clone()
        };

        let (strict, _dir) = bench(exact);
        assert!(!strict.run(ScenarioKind::SampleMatch).await.unwrap().passed);
        let (lenient, _dir) = bench(tolerant);
        assert!(lenient.run(ScenarioKind::SampleMatch).await.unwrap().passed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_infrared_sweep_skips_unsupported_rates() {
        let settings = ScenarioSettings {
            interface: Interface::Infrared,
            ..ScenarioSettings::default()
        };
        let (bench, _dir) = bench(settings);
        let report = bench.run(ScenarioKind::BaudSweep).await.unwrap();
        assert!(report.passed, "{:?}", report.failures().collect::<Vec<_>>());
        // 6 rates, 3 eight-bit frames each, one mismatch echo and one print per rate
        assert_eq!(report.steps.len(), 6 * 5);
        for rejected in ["echo at 600 ", "echo at 1200 ", "echo at 4800 ", "echo at 9600 7"] {
            assert!(!report.steps.iter().any(|s| s.name.starts_with(rejected)), "{rejected}");
        }
    }
}
