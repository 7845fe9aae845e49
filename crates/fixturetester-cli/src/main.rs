//! Console shell for the fixturetester engine
//!
//! Supplies the engine's external collaborators: serial port enumeration
//! (tokio-serial), threshold persistence (a JSON limits file with
//! per-field defaults), and a console presenter. The engine itself never
//! touches hardware enumeration, files, or output.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

use fixturetester_core::engine::session::StepSnapshot;
use fixturetester_core::link::ports::{DeviceIo, PortProvider};
use fixturetester_core::{
    profile, FaultCategory, NullPresenter, Presenter, TestLimits, TestReport, TestRunner,
};

#[derive(Debug, Parser)]
#[command(name = "fixturetester", version, about = "Automated electrical fixture tester")]
struct Cli {
    /// Fixture profile: full-18ch or compact-12ch
    #[arg(long, default_value = "full-18ch")]
    profile: String,

    /// Limits file (JSON); missing fields fall back to defaults
    #[arg(long, default_value = "fixturetester-limits.json")]
    limits: PathBuf,

    /// Write the effective limits back to the limits file and exit
    #[arg(long)]
    write_limits: bool,

    /// Pause after each adjacency sub-test (overrides the limits file)
    #[arg(long)]
    step: bool,

    /// Ports to skip during the connect scan (repeatable)
    #[arg(long = "exclude")]
    excluded_ports: Vec<String>,

    /// List connectable serial ports and exit
    #[arg(long)]
    list_ports: bool,

    /// Print the last run as JSON after completion
    #[arg(long)]
    json: bool,
}

/// Serial port collaborator backed by tokio-serial.
struct SerialProvider {
    excluded: HashSet<String>,
}

impl PortProvider for SerialProvider {
    fn list_ports(&self, exclude: &HashSet<String>) -> Vec<String> {
        match tokio_serial::available_ports() {
            Ok(ports) => ports
                .into_iter()
                .map(|p| p.port_name)
                .filter(|name| !exclude.contains(name) && !self.excluded.contains(name))
                .collect(),
            Err(e) => {
                warn!(error = %e, "port enumeration failed");
                Vec::new()
            }
        }
    }

    fn open(&self, port: &str, baud_rate: u32) -> std::io::Result<DeviceIo> {
        let stream = tokio_serial::new(port, baud_rate)
            .open_native_async()
            .map_err(std::io::Error::other)?;
        debug!(port, baud_rate, "opened serial port");
        Ok(Box::new(stream))
    }
}

/// Prints progress and the final report to the console.
struct ConsolePresenter;

impl Presenter for ConsolePresenter {
    fn on_status(&self, status: &str, progress: f32) {
        info!(progress = format_args!("{:3.0}%", progress * 100.0), "{status}");
    }

    fn on_channel_active(&self, channel: u8) {
        debug!(channel, "reading");
    }

    fn on_step(&self, snapshot: &StepSnapshot) {
        println!(
            "-- channel {} (running: arduino={:?} stm32={:?})",
            snapshot.channel, snapshot.arduino_running, snapshot.stm32_running
        );
        for c in &snapshot.comparisons {
            println!(
                "   {} pin {}: baseline {:?} fresh {:?}{}",
                c.device,
                c.neighbor,
                c.baseline,
                c.fresh,
                if c.shorted { "  << SHIFTED" } else { "" }
            );
        }
    }

    fn on_report(&self, report: &TestReport) {
        print_report(report);
    }
}

fn print_report(report: &TestReport) {
    println!();
    println!(
        "=== {} : {} ({} ms) ===",
        report.profile,
        if report.cancelled {
            "CANCELLED"
        } else if report.passed {
            "PASS"
        } else {
            "FAIL"
        },
        report.duration_ms()
    );

    let categories = [
        FaultCategory::DrainSupplyShort,
        FaultCategory::GateDrainShort,
        FaultCategory::DrainSourceShort,
        FaultCategory::DrainGroundShort,
        FaultCategory::LoadDisconnected,
        FaultCategory::GateGroundShort,
        FaultCategory::GateSourceShort,
        FaultCategory::WireFault,
    ];
    for category in categories {
        let channels = report.channels_with(category);
        if !channels.is_empty() {
            println!("  {category}: channels {channels:?}");
        }
    }
    for fault in &report.adjacency_faults {
        println!("  adjacent short {fault}");
    }
    for failure in &report.range_failures {
        println!(
            "  out of range: {} {} ch{} {} = {} (expected {})",
            failure.device, failure.label, failure.channel, failure.state, failure.value,
            failure.range
        );
    }
    for sensor in &report.sensors {
        match sensor.value {
            Some(value) => println!("  sensor {} = {}", sensor.name, value),
            None => println!("  sensor {} did not answer", sensor.name),
        }
    }
    if !report.unresponsive.is_empty() {
        println!("  no data from channels {:?}", report.unresponsive);
    }
}

/// Load limits from disk, falling back to defaults on any error. Missing
/// fields inside a present file fall back per-field via serde defaults.
fn load_limits(path: &Path) -> TestLimits {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(limits) => {
                info!(path = %path.display(), "loaded limits");
                limits
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to parse limits, using defaults");
                TestLimits::default()
            }
        },
        Err(_) => {
            info!(path = %path.display(), "no limits file, using defaults");
            TestLimits::default()
        }
    }
}

fn save_limits(limits: &TestLimits, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(limits)?;
    std::fs::write(path, json)
        .with_context(|| format!("writing limits to {}", path.display()))?;
    info!(path = %path.display(), "limits saved");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if cli.list_ports {
        let provider = SerialProvider { excluded: HashSet::new() };
        for port in provider.list_ports(&HashSet::new()) {
            println!("{port}");
        }
        return Ok(());
    }

    let mut limits = load_limits(&cli.limits);
    if cli.step {
        limits.step_mode = true;
    }
    if cli.write_limits {
        save_limits(&limits, &cli.limits)?;
        return Ok(());
    }

    let Some(profile) = profile::by_name(&cli.profile) else {
        bail!("unknown profile {:?} (try full-18ch or compact-12ch)", cli.profile);
    };
    info!(profile = profile.name, version = fixturetester_core::VERSION, "starting");

    let provider = SerialProvider {
        excluded: cli.excluded_ports.iter().cloned().collect(),
    };

    let presenter: std::sync::Arc<dyn Presenter> = if cli.json {
        // Quiet progress; the report is printed as JSON below.
        std::sync::Arc::new(NullPresenter)
    } else {
        std::sync::Arc::new(ConsolePresenter)
    };
    let mut runner = TestRunner::new(profile, limits, presenter);

    // Ctrl-C requests cooperative cancellation; the engine de-energizes
    // outputs on its way out.
    let cancel = runner.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("cancellation requested");
            cancel.cancel();
        }
    });

    if runner.limits().step_mode {
        // Enter advances, `b` steps back through recorded snapshots.
        // Stdin is blocking, so the pump gets its own thread.
        let commands = runner.step_handle();
        std::thread::spawn(move || {
            let mut line = String::new();
            loop {
                line.clear();
                if std::io::stdin().read_line(&mut line).is_err() {
                    return;
                }
                let command = match line.trim() {
                    "b" | "back" => fixturetester_core::StepCommand::Back,
                    _ => fixturetester_core::StepCommand::Next,
                };
                if commands.send(command).is_err() {
                    return;
                }
            }
        });
    }

    let report = match runner.run(&provider).await {
        Ok(report) => report,
        Err(e) => {
            if let Some(report) = runner.last_report() {
                if cli.json {
                    println!("{}", serde_json::to_string_pretty(report)?);
                }
            }
            bail!("test run failed: {e}");
        }
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    if !report.passed {
        std::process::exit(1);
    }
    Ok(())
}
