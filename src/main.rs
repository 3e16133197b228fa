//! printer-hil - Command Line Interface
//!
//! Drives the printer test bench from scripts and CI:
//! - List serial ports and spot the printer
//! - Echo a payload over an interface
//! - Read a measurement channel
//! - Drive the test control unit
//! - Compare a printout image against a sample
//! - Run the acceptance scenarios against the emulated printer

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use printer_hil::cli::{self, print_exit_codes, CliResult, ExitCodes};
use printer_hil::config::{HilConfig, PortSetting};
use printer_hil::core::printer::{EmulatedPrinter, Printer};
use printer_hil::core::printout::{
    save_comparison, similarity, ArtifactDir, Comparator, CompareMode, Printout, Sample, SampleStore,
};
use printer_hil::core::scenario::{prepare_samples, Bench, ScenarioKind, ScenarioReport, ScenarioSettings};
use printer_hil::core::tcu::{EmulatedTcu, MeasureChannel, RelayChannel, Tcu};
use printer_hil::core::transport::{
    list_ports, BaudRate, Echo, FrameFormat, Interface, LineConfig, TransportManager,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{debug, info};

/// Output format for results
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON for scripting
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "printer-hil")]
#[command(author, version, about = "Thermal printer hardware-in-the-loop test bench")]
#[command(propagate_version = true)]
struct Cli {
    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    format: OutputFormat,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Errors only
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Config file instead of the default search
    #[arg(short, long, env = "PRINTER_HIL_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List available serial ports
    #[command(visible_alias = "ls")]
    ListPorts {
        /// Only ports that look like the printer
        #[arg(long)]
        printers: bool,
    },

    /// Send a payload and check that it echoes back unchanged
    Echo {
        /// Interface (usb, rs232, ir)
        #[arg(short, long, default_value = "rs232")]
        interface: Interface,

        /// Serial port or `auto`; defaults to the configured port
        #[arg(short, long)]
        port: Option<String>,

        /// Host baud rate
        #[arg(short, long)]
        baud: Option<BaudRate>,

        /// Host frame, e.g. 8N or "7 Bits Even"
        #[arg(long)]
        frame: Option<FrameFormat>,

        /// Line the emulated device listens with, e.g. "9600/8/Odd"
        #[arg(long)]
        device_line: Option<LineConfig>,

        /// Echo timeout in milliseconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Payload
        text: String,
    },

    /// Read a measurement channel from the printer
    Measure {
        /// Interface (usb, rs232, ir)
        #[arg(short, long, default_value = "usb")]
        interface: Interface,

        /// Serial port or `auto`; defaults to the configured port
        #[arg(short, long)]
        port: Option<String>,

        /// Channel number, e.g. 2 for VCC or 31+n for option n
        channel: u8,
    },

    /// Compare a printout image with a sample
    Compare {
        /// Sample PNG
        sample: PathBuf,

        /// Printout PNG
        printout: PathBuf,

        /// Comparison mode (exact, tolerant)
        #[arg(short, long)]
        mode: Option<CompareMode>,

        /// Write a side-by-side comparison here on mismatch
        #[arg(long)]
        diff: Option<PathBuf>,
    },

    /// Run acceptance scenarios against the emulated printer
    Scenario {
        /// Scenario name or `all`
        #[arg(default_value = "all")]
        name: String,

        /// Interface to exercise
        #[arg(short, long)]
        interface: Option<Interface>,

        /// Comparison mode (exact, tolerant)
        #[arg(short, long)]
        mode: Option<CompareMode>,

        /// Per-dot burn variance of the emulated mechanism
        #[arg(long)]
        burn_variance: Option<u8>,

        /// Seed for the burn variance
        #[arg(long)]
        seed: Option<u64>,

        /// Sample directory to use as is instead of `[paths] samples`
        #[arg(long)]
        samples: Option<PathBuf>,
    },

    /// Drive the test control unit
    Tcu {
        /// TCU serial port or `auto`; defaults to the configured USB port
        #[arg(short, long)]
        port: Option<String>,

        #[command(subcommand)]
        action: TcuAction,
    },

    /// Show exit codes
    ExitCodes,
}

#[derive(Subcommand, Debug)]
enum TcuAction {
    /// Read a TCU measurement channel
    Measure {
        /// Channel number, e.g. 3 for battery voltage
        channel: u8,
    },

    /// Close a relay or set a bitfield bit
    Close {
        /// Relay number
        relay: u8,
    },

    /// Open a relay or clear a bitfield bit
    Open {
        /// Relay number
        relay: u8,
    },

    /// Set a value channel
    Set {
        /// Channel number, e.g. 65 for the comms mode
        channel: u8,
        /// Value
        value: u16,
    },

    /// Read a printer measurement channel through the TCU
    Printer {
        /// Printer channel number
        channel: u8,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let (config, source) = match HilConfig::load(cli.config.as_deref()) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::from(ExitCodes::CONFIG_ERROR);
        }
    };

    let level = cli::log_level(cli.verbose, cli.quiet, &config.logging.level);
    let _guard = match cli::init_logging(&level, &config.logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Warning: logging disabled: {e:#}");
            None
        }
    };
    match &source {
        Some(path) => debug!("Loaded config from {}", path.display()),
        None => debug!("No config file, using defaults"),
    }

    let result = run(&cli, &config).await.unwrap_or_else(CliResult::from);

    if let Some(msg) = result.message() {
        if !result.is_success() {
            eprintln!("Error: {msg}");
        } else if !cli.quiet {
            eprintln!("{msg}");
        }
    }
    result.to_exit_code()
}

async fn run(cli: &Cli, config: &HilConfig) -> anyhow::Result<CliResult> {
    match &cli.command {
        Commands::ListPorts { printers } => cmd_list_ports(cli, *printers),
        Commands::Echo {
            interface,
            port,
            baud,
            frame,
            device_line,
            timeout,
            text,
        } => {
            let mut line = config.line.get(*interface);
            if let Some(baud) = baud {
                line.baud_rate = *baud;
            }
            if let Some(frame) = frame {
                line.frame = *frame;
            }
            let timeout = timeout.map_or_else(|| config.timing.echo_timeout(), Duration::from_millis);
            let setting = match port {
                Some(port) => port.parse::<PortSetting>()?,
                None => config.interfaces.get(*interface).clone(),
            };
            cmd_echo(cli, config, *interface, setting, line, *device_line, timeout, text).await
        }
        Commands::Measure { interface, port, channel } => {
            let setting = match port {
                Some(port) => port.parse::<PortSetting>()?,
                None => config.interfaces.get(*interface).clone(),
            };
            cmd_measure(cli, config, *interface, setting, *channel).await
        }
        Commands::Compare {
            sample,
            printout,
            mode,
            diff,
        } => cmd_compare(cli, config, sample, printout, mode.unwrap_or(config.comparison.mode), diff.as_deref()),
        Commands::Scenario {
            name,
            interface,
            mode,
            burn_variance,
            seed,
            samples,
        } => {
            let kinds = if name.eq_ignore_ascii_case("all") {
                ScenarioKind::ALL.to_vec()
            } else {
                vec![name.parse::<ScenarioKind>()?]
            };
            let interface = interface.unwrap_or(Interface::Rs232);
            if !interface.has_line_settings() {
                return Ok(CliResult::error(
                    ExitCodes::INVALID_ARGS,
                    format!("Scenarios need an interface with line settings, not {interface}"),
                ));
            }
            let settings = ScenarioSettings {
                interface,
                echo_timeout: config.timing.echo_timeout(),
                capture_timeout: config.timing.capture_timeout(),
                mode: mode.unwrap_or(config.comparison.mode),
                tolerance: config.comparison.tolerance(),
                burn_variance: burn_variance.unwrap_or(config.comparison.burn_variance),
                seed: seed.unwrap_or_else(rand::random),
                artifacts: Some(ArtifactDir::new(config.paths.compare_dir())),
                traffic_format: config.logging.traffic_format,
            };
            cmd_scenario(cli, config, &kinds, settings, samples.as_deref()).await
        }
        Commands::Tcu { port, action } => {
            let setting = match port {
                Some(port) => port.parse::<PortSetting>()?,
                None => config.interfaces.get(Interface::Usb).clone(),
            };
            cmd_tcu(cli, config, setting, action).await
        }
        Commands::ExitCodes => {
            print_exit_codes();
            Ok(CliResult::success())
        }
    }
}

fn cmd_list_ports(cli: &Cli, printers: bool) -> anyhow::Result<CliResult> {
    let ports: Vec<_> = list_ports()?
        .into_iter()
        .filter(|port| !printers || port.is_printer())
        .collect();

    match cli.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&ports)?),
        OutputFormat::Text => {
            if ports.is_empty() {
                println!("No serial ports found");
            } else {
                println!("Available serial ports:");
                for port in &ports {
                    let ids = match (port.vid, port.pid) {
                        (Some(vid), Some(pid)) => format!(" [{vid:04x}:{pid:04x}]"),
                        _ => String::new(),
                    };
                    let marker = if port.is_printer() { " (printer)" } else { "" };
                    println!("  {} - {}{}{}", port.name, port.kind, ids, marker);
                }
            }
        }
    }
    Ok(CliResult::success())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_echo(
    cli: &Cli,
    config: &HilConfig,
    interface: Interface,
    setting: PortSetting,
    line: LineConfig,
    device_line: Option<LineConfig>,
    timeout: Duration,
    text: &str,
) -> anyhow::Result<CliResult> {
    let manager = match setting {
        PortSetting::Emulated => {
            let printer = EmulatedPrinter::new();
            if interface.has_line_settings() {
                printer.set_line_config(interface, device_line.unwrap_or(line));
            }
            printer.set_echo(interface, true);
            TransportManager::new(printer)
        }
        PortSetting::Hardware(spec) => TransportManager::new(config.hardware_ports().with_port(interface, spec)),
    }
    .log_capacity(config.logging.traffic_entries);

    let mut channel = manager
        .open(interface)
        .await
        .with_context(|| format!("opening {interface}"))?;
    let outcome = match channel.configure(line).await {
        Ok(()) => {
            info!("Echo over {}", channel.describe());
            channel.exchange(text.as_bytes(), timeout).await
        }
        Err(e) => Err(e),
    };
    let traffic = channel.traffic_log();
    channel.teardown().await;
    let echo = outcome?;

    if cli.verbose > 0 {
        eprint!("{}", traffic.lock().export(config.logging.traffic_format));
    }
    print_echo(cli.format, &echo)?;

    Ok(if echo.matched {
        CliResult::success()
    } else if echo.timed_out {
        CliResult::validation_failed(format!("Echo timed out after {} ms", echo.elapsed_ms))
    } else {
        CliResult::validation_failed("Echo does not match")
    })
}

async fn cmd_measure(
    cli: &Cli,
    config: &HilConfig,
    interface: Interface,
    setting: PortSetting,
    measure: u8,
) -> anyhow::Result<CliResult> {
    let manager = match setting {
        PortSetting::Emulated => TransportManager::new(EmulatedPrinter::new()),
        PortSetting::Hardware(spec) => TransportManager::new(config.hardware_ports().with_port(interface, spec)),
    }
    .log_capacity(config.logging.traffic_entries);

    let mut channel = manager
        .open(interface)
        .await
        .with_context(|| format!("opening {interface}"))?;
    let outcome = match channel.configure(config.line.get(interface)).await {
        Ok(()) => {
            Printer::new(&channel)
                .response_timeout(config.timing.response_timeout())
                .measure(measure)
                .await
        }
        Err(e) => Err(e.into()),
    };
    channel.teardown().await;
    let value = outcome?;

    match cli.format {
        OutputFormat::Json => {
            let report = serde_json::json!({
                "interface": interface,
                "channel": measure,
                "value": value,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Text => println!("{value}"),
    }
    Ok(CliResult::success())
}

async fn cmd_tcu(cli: &Cli, config: &HilConfig, setting: PortSetting, action: &TcuAction) -> anyhow::Result<CliResult> {
    let manager = match setting {
        PortSetting::Emulated => TransportManager::new(EmulatedTcu::new().with_printer(EmulatedPrinter::new())),
        PortSetting::Hardware(spec) => {
            TransportManager::new(config.hardware_ports().with_port(Interface::Usb, spec))
        }
    }
    .log_capacity(config.logging.traffic_entries);

    let channel = manager.open(Interface::Usb).await.context("opening TCU")?;
    let tcu = Tcu::new(&channel).response_timeout(config.timing.response_timeout());
    let outcome = run_tcu_action(&tcu, action).await;
    channel.teardown().await;
    let value = outcome?;

    match (cli.format, value) {
        (OutputFormat::Json, value) => {
            let report = serde_json::json!({ "action": format!("{action:?}"), "value": value });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        (OutputFormat::Text, Some(value)) => println!("{value}"),
        (OutputFormat::Text, None) => {}
    }
    Ok(CliResult::success())
}

async fn run_tcu_action(tcu: &Tcu<'_>, action: &TcuAction) -> anyhow::Result<Option<i64>> {
    let relay = |number: u8| {
        RelayChannel::from_number(number).with_context(|| format!("No TCU relay or channel {number:#04x}"))
    };
    match action {
        TcuAction::Measure { channel } => {
            let channel = MeasureChannel::from_number(*channel)
                .with_context(|| format!("No TCU measurement channel {channel:#04x}"))?;
            Ok(Some(i64::from(tcu.measure(channel).await?)))
        }
        TcuAction::Close { relay: number } => {
            tcu.close_relay(relay(*number)?).await?;
            Ok(None)
        }
        TcuAction::Open { relay: number } => {
            tcu.open_relay(relay(*number)?).await?;
            Ok(None)
        }
        TcuAction::Set { channel, value } => {
            tcu.set_channel(relay(*channel)?, *value).await?;
            Ok(None)
        }
        TcuAction::Printer { channel } => Ok(Some(tcu.measure_printer(*channel).await?)),
    }
}

fn print_echo(format: OutputFormat, echo: &Echo) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(echo)?),
        OutputFormat::Text => {
            println!("Sent:     {}", String::from_utf8_lossy(&echo.sent).escape_debug());
            println!("Received: {}", String::from_utf8_lossy(&echo.received).escape_debug());
            if !echo.errors.is_clean() {
                println!(
                    "Errors:   parity {} framing {}",
                    echo.errors.parity, echo.errors.framing
                );
            }
            println!(
                "Result:   {} ({} ms)",
                if echo.matched { "MATCH" } else { "MISMATCH" },
                echo.elapsed_ms
            );
        }
    }
    Ok(())
}

fn cmd_compare(
    cli: &Cli,
    config: &HilConfig,
    sample_path: &Path,
    printout_path: &Path,
    mode: CompareMode,
    diff: Option<&Path>,
) -> anyhow::Result<CliResult> {
    let sample = Sample::load(sample_path).with_context(|| format!("loading sample {}", sample_path.display()))?;
    let printout =
        Printout::open(printout_path).with_context(|| format!("loading printout {}", printout_path.display()))?;

    let result = Comparator::new(config.comparison.tolerance()).compare(&printout, &sample, mode);
    let score = similarity(&printout, &sample).ok();

    if let (false, Some(path)) = (result.matched, diff) {
        save_comparison(&printout, &sample, path)?;
        info!("Comparison saved to {}", path.display());
    }

    match cli.format {
        OutputFormat::Json => {
            let report = serde_json::json!({
                "sample": sample_path,
                "printout": printout_path,
                "mode": mode.to_string(),
                "matched": result.matched,
                "differing_pixels": result.differing_pixels,
                "total_pixels": result.total_pixels,
                "dimension_mismatch": result.dimension_mismatch,
                "similarity": score,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Text => {
            println!("Mode:       {mode}");
            println!(
                "Differing:  {} of {} pixels ({:.3}%)",
                result.differing_pixels,
                result.total_pixels,
                result.diff_percentage()
            );
            if let Some(score) = score {
                println!("Similarity: {score:.4}");
            }
            if result.dimension_mismatch {
                println!("Lengths differ");
            }
            println!("Result:     {}", if result.matched { "MATCH" } else { "MISMATCH" });
        }
    }

    Ok(if result.matched {
        CliResult::success()
    } else {
        CliResult::validation_failed("Printout does not match the sample")
    })
}

async fn cmd_scenario(
    cli: &Cli,
    config: &HilConfig,
    kinds: &[ScenarioKind],
    settings: ScenarioSettings,
    samples: Option<&Path>,
) -> anyhow::Result<CliResult> {
    if !config.interfaces.all_emulated() {
        info!("Scenarios run against the emulated printer; configured hardware ports are ignored");
    }
    let store = match samples {
        Some(dir) => SampleStore::open(dir),
        None => prepare_samples(&config.paths.samples)
            .with_context(|| format!("preparing samples under {}", config.paths.samples.display()))?,
    };
    info!("Samples from {}", store.dir().display());
    debug!("Burn variance {} seed {}", settings.burn_variance, settings.seed);

    let bench = Bench::new(store, settings);
    let mut reports = Vec::with_capacity(kinds.len());
    for kind in kinds {
        reports.push(bench.run(*kind).await.with_context(|| format!("scenario {kind}"))?);
    }

    print_reports(cli.format, &reports)?;

    let failed = reports.iter().filter(|r| !r.passed).count();
    Ok(if failed == 0 {
        CliResult::success_with_message(format!("{} scenario(s) passed", reports.len()))
    } else {
        CliResult::validation_failed(format!("{failed} of {} scenario(s) failed", reports.len()))
    })
}

fn print_reports(format: OutputFormat, reports: &[ScenarioReport]) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(reports)?),
        OutputFormat::Text => {
            for report in reports {
                println!("{}", report.summary());
                if let Some(path) = &report.traffic_log {
                    println!("  traffic log: {}", path.display());
                }
                for step in report.failures() {
                    print!("  FAIL {}: {}", step.name, step.detail);
                    match &step.artifact {
                        Some(path) => println!(" -> {}", path.display()),
                        None => println!(),
                    }
                }
            }
        }
    }
    Ok(())
}
