//! sorter - command arbitration for produce sorting machines
//!
//! Thin CLI over `sorter-core`: inspect the command registry, validate a
//! configuration, replay a JSON scenario deterministically, or arbitrate a
//! live stream of newline-delimited JSON actions from stdin.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::io::AsyncBufReadExt;

use sorter_core::arbitration::{CurrentCommandState, Evaluation};
use sorter_core::clock::{ManualClock, SystemClock};
use sorter_core::config::{Config, LogFormat};
use sorter_core::flags::AggregatedControlFlags;
use sorter_core::intake::IntakeStats;
use sorter_core::logging::init_logging;
use sorter_core::SorterController;
use sorter_core::scenario::{self, Action, Scenario, StepReport};

/// sorter - command arbitration for produce sorting machines
#[derive(Parser, Debug)]
#[command(name = "sorter")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to sorter.toml (built-in defaults when omitted)
    #[arg(short, long, env = "SORTER_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (pretty, json); overrides the config
    #[arg(long)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the command registry as JSON
    Registry,

    /// Load and validate the configuration, then print a summary
    CheckConfig,

    /// Replay a JSON scenario against a controller with a manual clock
    Replay {
        /// Scenario file (`{"steps": [...]}`)
        scenario: PathBuf,

        /// Start time of the manual clock (RFC 3339); defaults to now
        #[arg(long)]
        start: Option<DateTime<Utc>>,

        /// Pretty-print each JSON report
        #[arg(long)]
        pretty: bool,
    },

    /// Arbitrate newline-delimited JSON actions read from stdin
    Run,
}

fn main() {
    if let Err(err) = run_cli() {
        eprintln!("error: {err:#}");
        if let Some(remediation) = err
            .downcast_ref::<sorter_core::Error>()
            .and_then(sorter_core::Error::remediation)
        {
            eprintln!("\n{}", remediation.render_plain());
        }
        std::process::exit(1);
    }
}

fn run_cli() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_logging(&config.logging).context("Failed to initialize logging")?;

    match cli.command {
        Commands::Registry => print_registry(&config),
        Commands::CheckConfig => check_config(cli.config.as_deref(), &config),
        Commands::Replay {
            scenario,
            start,
            pretty,
        } => replay(&config, &scenario, start.unwrap_or_else(Utc::now), pretty),
        Commands::Run => tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to build tokio runtime")?
            .block_on(run_stream(&config)),
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path).map_err(sorter_core::Error::from)?,
        None => Config::default(),
    };
    if let Some(level) = &cli.log_level {
        config.logging.level.clone_from(level);
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    config.validate().map_err(sorter_core::Error::from)?;
    Ok(config)
}

fn emit<T: Serialize>(value: &T, pretty: bool) -> Result<()> {
    let text = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{text}").context("Failed to write to stdout")?;
    Ok(())
}

// =============================================================================
// registry / check-config
// =============================================================================

fn print_registry(config: &Config) -> Result<()> {
    let registry = config.registry().map_err(sorter_core::Error::from)?;
    emit(&registry.definitions(), true)
}

fn check_config(path: Option<&Path>, config: &Config) -> Result<()> {
    let registry = config.registry().map_err(sorter_core::Error::from)?;
    let source = path.map_or_else(|| "built-in defaults".to_string(), |p| p.display().to_string());
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "config ok: {source}")?;
    writeln!(stdout, "  machine_id: {}", config.general.machine_id)?;
    writeln!(stdout, "  commands: {}", registry.len())?;
    writeln!(
        stdout,
        "  panel_echo_window_secs: {}",
        config.intake.panel_echo_window_secs
    )?;
    writeln!(
        stdout,
        "  active_expiry_sweep: {} ({} ms)",
        config.sessions.active_expiry_sweep, config.sessions.sweep_interval_ms
    )?;
    writeln!(
        stdout,
        "  logging: {} ({})",
        config.logging.level, config.logging.format
    )?;
    Ok(())
}

// =============================================================================
// replay
// =============================================================================

#[derive(Serialize)]
struct ReplayFinal<'a> {
    #[serde(rename = "final")]
    state: FinalState<'a>,
}

#[derive(Serialize)]
struct FinalState<'a> {
    current: Option<&'a CurrentCommandState>,
    flags: &'a AggregatedControlFlags,
    stats: IntakeStats,
    queued: usize,
    pending: usize,
}

fn replay(config: &Config, path: &Path, start: DateTime<Utc>, pretty: bool) -> Result<()> {
    let scenario = Scenario::load_from(path)
        .with_context(|| format!("Failed to load scenario {}", path.display()))?;
    let clock = Arc::new(ManualClock::new(start));
    let controller = SorterController::from_config(config, clock.clone())?;
    tracing::info!(steps = scenario.steps.len(), path = %path.display(), "replaying scenario");

    let summary = scenario::replay(&scenario, &controller, &clock)?;
    for step in &summary.steps {
        emit(step, pretty)?;
    }
    let state = FinalState {
        current: summary.current.as_ref(),
        flags: &summary.flags,
        stats: summary.stats,
        queued: summary.queue.len(),
        pending: controller.pending_len(),
    };
    emit(&ReplayFinal { state }, pretty)
}

// =============================================================================
// run
// =============================================================================

#[derive(Serialize)]
struct LineReport {
    line: u64,
    at: DateTime<Utc>,
    report: StepReport,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    evaluations: Vec<Evaluation>,
}

#[derive(Serialize)]
struct LineError {
    line: u64,
    error: String,
}

async fn tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn run_stream(config: &Config) -> Result<()> {
    let controller = SorterController::from_config(config, Arc::new(SystemClock))?;
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut sweep = config.sessions.active_expiry_sweep.then(|| {
        tokio::time::interval(Duration::from_millis(config.sessions.sweep_interval_ms))
    });
    tracing::info!(
        machine_id = %config.general.machine_id,
        active_expiry_sweep = sweep.is_some(),
        "reading actions from stdin"
    );

    let mut line_no = 0u64;
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                line_no += 1;
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match handle_line(&controller, line_no, line) {
                    Ok(report) => emit(&report, false)?,
                    Err(err) => {
                        tracing::warn!(line = line_no, error = %err, "action failed");
                        emit(&LineError { line: line_no, error: err.to_string() }, false)?;
                    }
                }
            }
            () = tick(&mut sweep) => {
                match controller.sweep_expired_sessions() {
                    Ok(Some(rollover)) => {
                        tracing::info!(session_id = %rollover.expired, "session expired by sweep");
                    }
                    Ok(None) => {}
                    Err(err) => tracing::error!(error = %err, "session sweep failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
        }
    }

    tracing::info!(lines = line_no, stats = ?controller.stats(), "input closed");
    Ok(())
}

/// Apply one action, then arbitrate whatever it queued.
fn handle_line(controller: &SorterController, line: u64, text: &str) -> sorter_core::Result<LineReport> {
    let action: Action = serde_json::from_str(text)?;
    let explicit_process = matches!(action, Action::Process);
    let report = scenario::apply(controller, action)?;
    let evaluations = if explicit_process {
        Vec::new()
    } else {
        controller.process_pending()?
    };
    Ok(LineReport {
        line,
        at: Utc::now(),
        report,
        evaluations,
    })
}
