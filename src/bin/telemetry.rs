//! Telemetry CLI - Command-line interface for Booking Telemetry
//!
//! Commands:
//! - replay: Drive a tracker from a scripted event stream and export the result
//! - inspect: Summarize an exported session document
//! - validate: Check an exported document against the ledger invariants
//! - doctor: Diagnose configuration and output directory

use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use booking_telemetry::export::format_timestamp;
use booking_telemetry::{
    validate_record, DirectorySave, ExportDocument, Exporter, InputEvent, LocationHandle,
    ManualClock, SessionRecord, StopReport, Tracker, TrackerConfig, DOCUMENT_VERSION,
    PRODUCER_NAME, TELEMETRY_VERSION,
};

/// Telemetry - behavioral session engine for booking flows
#[derive(Parser)]
#[command(name = "telemetry")]
#[command(version = TELEMETRY_VERSION)]
#[command(about = "Replay, inspect, and validate booking telemetry sessions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive a tracker from a scripted event stream
    Replay {
        /// Script file path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Script format
        #[arg(long, default_value = "ndjson")]
        input_format: InputFormat,

        /// Directory receiving exported documents
        #[arg(long, default_value = "telemetry-out")]
        out_dir: PathBuf,

        /// Tracker configuration file (JSON)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Page showing when the replay begins
        #[arg(long, default_value = "/")]
        initial_path: String,

        /// Wall-clock instant of script offset zero (RFC 3339); defaults to now
        #[arg(long)]
        epoch: Option<String>,

        /// Upload endpoint (requires the `http` feature)
        #[arg(long)]
        endpoint: Option<String>,
    },

    /// Summarize an exported session document
    Inspect {
        /// Document path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check an exported document against the ledger invariants
    Validate {
        /// Document path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Output validation report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Diagnose configuration and output directory
    Doctor {
        /// Tracker configuration file to check
        #[arg(long)]
        config: Option<PathBuf>,

        /// Output directory to check
        #[arg(long)]
        out_dir: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, ValueEnum)]
enum InputFormat {
    /// Newline-delimited JSON (one step per line)
    Ndjson,
    /// JSON array of steps
    Json,
}

/// One line of a replay script
#[derive(Debug, Deserialize)]
struct ScriptStep {
    /// Milliseconds since script offset zero
    at_ms: i64,
    #[serde(flatten)]
    action: ScriptAction,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ScriptAction {
    Start { run_key: String },
    Stop,
    /// Router moved to a new path (no signal fired yet)
    Location { path: String },
    Selection { payload: serde_json::Value },
    Input { event: InputEvent },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e))
                    .unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), TelemetryCliError> {
    match cli.command {
        Commands::Replay {
            input,
            input_format,
            out_dir,
            config,
            initial_path,
            epoch,
            endpoint,
        } => cmd_replay(
            &input,
            input_format,
            &out_dir,
            config.as_deref(),
            &initial_path,
            epoch.as_deref(),
            endpoint.as_deref(),
        ),

        Commands::Inspect { input, json } => cmd_inspect(&input, json),

        Commands::Validate { input, json } => cmd_validate(&input, json),

        Commands::Doctor {
            config,
            out_dir,
            json,
        } => cmd_doctor(config.as_deref(), out_dir.as_deref(), json),
    }
}

fn read_input(input: &Path) -> Result<String, TelemetryCliError> {
    if input.to_string_lossy() == "-" {
        if atty::is(atty::Stream::Stdin) {
            warn!("Reading from an interactive stdin; end input with Ctrl-D");
        }
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        Ok(buffer)
    } else {
        Ok(fs::read_to_string(input)?)
    }
}

fn load_config(path: Option<&Path>) -> Result<TrackerConfig, TelemetryCliError> {
    match path {
        Some(path) => Ok(TrackerConfig::from_json(&fs::read_to_string(path)?)?),
        None => Ok(TrackerConfig::default()),
    }
}

fn parse_script(data: &str, format: InputFormat) -> Result<Vec<ScriptStep>, TelemetryCliError> {
    let steps: Vec<ScriptStep> = match format {
        InputFormat::Json => serde_json::from_str(data)?,
        InputFormat::Ndjson => data
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                serde_json::from_str(line.trim()).map_err(|e| {
                    TelemetryCliError::Script(format!("line {}: {}", idx + 1, e))
                })
            })
            .collect::<Result<_, _>>()?,
    };

    if steps.is_empty() {
        return Err(TelemetryCliError::NoSteps);
    }
    if let Some(step) = steps.iter().find(|step| step.at_ms < 0) {
        return Err(TelemetryCliError::Script(format!(
            "step at {} ms precedes the epoch",
            step.at_ms
        )));
    }
    if let Some(pair) = steps.windows(2).find(|pair| pair[1].at_ms < pair[0].at_ms) {
        return Err(TelemetryCliError::Script(format!(
            "step at {} ms follows step at {} ms",
            pair[1].at_ms, pair[0].at_ms
        )));
    }
    Ok(steps)
}

/// Wall-clock instant of a script step
fn step_instant(epoch: DateTime<Utc>, at_ms: i64) -> Result<DateTime<Utc>, TelemetryCliError> {
    Duration::try_milliseconds(at_ms)
        .and_then(|offset| epoch.checked_add_signed(offset))
        .ok_or_else(|| {
            TelemetryCliError::Script(format!("step at {} ms is out of range for the epoch", at_ms))
        })
}

fn build_exporter(
    config: &TrackerConfig,
    out_dir: &Path,
    endpoint: Option<&str>,
) -> Result<Exporter, TelemetryCliError> {
    let exporter = Exporter::from_config(config).with_local_save(Box::new(DirectorySave::new(out_dir)));

    match endpoint {
        #[cfg(feature = "http")]
        Some(url) => Ok(exporter.with_sink(Box::new(booking_telemetry::HttpSink::new(url)))),
        #[cfg(not(feature = "http"))]
        Some(_) => Err(TelemetryCliError::Script(
            "--endpoint requires the `http` feature".to_string(),
        )),
        None => Ok(exporter),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReplaySummary {
    session_id: String,
    run_key: String,
    pages: usize,
    filename: String,
    delivered: bool,
    local_copy: Option<String>,
}

impl From<&StopReport> for ReplaySummary {
    fn from(report: &StopReport) -> Self {
        Self {
            session_id: report.record.session_id.clone(),
            run_key: report.record.run_key.clone(),
            pages: report.record.pages.len(),
            filename: report.delivery.filename.clone(),
            delivered: report.delivery.delivered(),
            local_copy: report.delivery.local_copy.clone(),
        }
    }
}

fn cmd_replay(
    input: &Path,
    input_format: InputFormat,
    out_dir: &Path,
    config_path: Option<&Path>,
    initial_path: &str,
    epoch: Option<&str>,
    endpoint: Option<&str>,
) -> Result<(), TelemetryCliError> {
    let config = load_config(config_path)?;
    let steps = parse_script(&read_input(input)?, input_format)?;

    let epoch: DateTime<Utc> = match epoch {
        Some(value) => DateTime::parse_from_rfc3339(value)
            .map_err(|e| TelemetryCliError::Script(format!("invalid --epoch: {}", e)))?
            .with_timezone(&Utc),
        None => Utc::now(),
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let clock = ManualClock::new(epoch);
    let location = LocationHandle::new(initial_path);
    let exporter = build_exporter(&config, out_dir, endpoint)?;
    let mut tracker = Tracker::new(config, location.clone())
        .with_clock(clock.clone())
        .with_exporter(exporter);

    let mut reports = Vec::new();

    for step in steps {
        clock.set(step_instant(epoch, step.at_ms)?);
        match step.action {
            ScriptAction::Start { run_key } => {
                if let Err(e) = tracker.start(&run_key) {
                    warn!("start {} at {} ms: {}", run_key, step.at_ms, e);
                }
            }
            ScriptAction::Stop => match runtime.block_on(tracker.stop()) {
                Ok(report) => reports.push(report),
                Err(e) => warn!("stop at {} ms: {}", step.at_ms, e),
            },
            ScriptAction::Location { path } => location.set(path),
            ScriptAction::Selection { payload } => {
                tracker.add_selection(payload);
            }
            ScriptAction::Input { event } => {
                tracker.handle(&event);
            }
        }
    }

    if tracker.is_tracking() {
        warn!("Script ended without stop; finalizing the open session");
        reports.push(runtime.block_on(tracker.stop())?);
    }

    info!("Replay produced {} session(s)", reports.len());
    for report in &reports {
        println!("{}", serde_json::to_string(&ReplaySummary::from(report))?);
    }
    Ok(())
}

fn load_record(input: &Path) -> Result<(ExportDocument, SessionRecord), TelemetryCliError> {
    let document = ExportDocument::from_json(&read_input(input)?)?;
    if document.document_version != DOCUMENT_VERSION {
        warn!(
            "Document version {} differs from supported {}",
            document.document_version, DOCUMENT_VERSION
        );
    }
    let record = SessionRecord::try_from(document.clone())?;
    Ok((document, record))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PageSummary {
    page_key: String,
    opened_at: String,
    duration_ms: Option<i64>,
    pointer_samples: usize,
    scroll_samples: usize,
    clicks: usize,
    key_presses: usize,
    annotation_type: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionSummary {
    session_id: String,
    run_key: String,
    participant_id: Option<String>,
    started_at: String,
    ended_at: Option<String>,
    total_duration_ms: Option<i64>,
    pages: Vec<PageSummary>,
}

fn summarize(record: &SessionRecord) -> SessionSummary {
    SessionSummary {
        session_id: record.session_id.clone(),
        run_key: record.run_key.clone(),
        participant_id: record.participant_id.clone(),
        started_at: format_timestamp(&record.started_at),
        ended_at: record.ended_at.as_ref().map(format_timestamp),
        total_duration_ms: record
            .ended_at
            .map(|end| (end - record.started_at).num_milliseconds()),
        pages: record
            .pages
            .iter()
            .map(|visit| PageSummary {
                page_key: visit.page_key.clone(),
                opened_at: format_timestamp(&visit.opened_at),
                duration_ms: visit.duration_ms(),
                pointer_samples: visit.pointer_samples.len(),
                scroll_samples: visit.scroll_samples.len(),
                clicks: visit.clicks.len(),
                key_presses: visit.key_presses.len(),
                annotation_type: visit.annotation.as_ref().and_then(|a| {
                    a.payload
                        .get("type")
                        .and_then(|t| t.as_str())
                        .map(str::to_string)
                }),
            })
            .collect(),
    }
}

fn cmd_inspect(input: &Path, json: bool) -> Result<(), TelemetryCliError> {
    let (_, record) = load_record(input)?;
    let summary = summarize(&record);

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("Session {} (run {})", summary.session_id, summary.run_key);
    if let Some(participant) = &summary.participant_id {
        println!("Participant: {}", participant);
    }
    println!(
        "Started: {}  Ended: {}",
        summary.started_at,
        summary.ended_at.as_deref().unwrap_or("-")
    );
    println!();
    println!(
        "{:<28} {:>10} {:>7} {:>7} {:>7} {:>7}  selection",
        "page", "ms", "moves", "scroll", "clicks", "keys"
    );
    for page in &summary.pages {
        println!(
            "{:<28} {:>10} {:>7} {:>7} {:>7} {:>7}  {}",
            page.page_key,
            page.duration_ms
                .map(|ms| ms.to_string())
                .unwrap_or_else(|| "open".to_string()),
            page.pointer_samples,
            page.scroll_samples,
            page.clicks,
            page.key_presses,
            page.annotation_type.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

#[derive(Serialize)]
struct ValidationReport {
    valid: bool,
    violations: Vec<String>,
}

fn cmd_validate(input: &Path, json: bool) -> Result<(), TelemetryCliError> {
    let (_, record) = load_record(input)?;
    let violations: Vec<String> = validate_record(&record)
        .iter()
        .map(|v| v.to_string())
        .collect();

    let report = ValidationReport {
        valid: violations.is_empty(),
        violations,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if report.valid {
        println!("Document is valid ({} page visits)", record.pages.len());
    } else {
        println!("Found {} violation(s):", report.violations.len());
        for violation in &report.violations {
            println!("  - {}", violation);
        }
    }

    if report.valid {
        Ok(())
    } else {
        Err(TelemetryCliError::ValidationFailed(report.violations.len()))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "lowercase")]
enum CheckStatus {
    Ok,
    Warning,
    Error,
}

#[derive(Serialize)]
struct DoctorCheck {
    name: String,
    status: CheckStatus,
    message: String,
}

#[derive(Serialize)]
struct DoctorReport {
    producer: String,
    version: String,
    checks: Vec<DoctorCheck>,
}

fn cmd_doctor(
    config: Option<&Path>,
    out_dir: Option<&Path>,
    json: bool,
) -> Result<(), TelemetryCliError> {
    let mut checks = Vec::new();

    checks.push(match config {
        None => DoctorCheck {
            name: "config".to_string(),
            status: CheckStatus::Ok,
            message: "Using default configuration".to_string(),
        },
        Some(path) => match fs::read_to_string(path) {
            Ok(content) => match TrackerConfig::from_json(&content) {
                Ok(cfg) => DoctorCheck {
                    name: "config".to_string(),
                    status: CheckStatus::Ok,
                    message: format!(
                        "Config valid (debounce {} ms, {} excluded pages)",
                        cfg.navigation_debounce_ms,
                        cfg.excluded_pages.len()
                    ),
                },
                Err(e) => DoctorCheck {
                    name: "config".to_string(),
                    status: CheckStatus::Error,
                    message: e.to_string(),
                },
            },
            Err(e) => DoctorCheck {
                name: "config".to_string(),
                status: CheckStatus::Error,
                message: format!("Cannot read config file: {}", e),
            },
        },
    });

    if let Some(dir) = out_dir {
        let probe = DirectorySave::new(dir);
        let probe_name = ".telemetry-doctor-probe";
        checks.push(
            match booking_telemetry::LocalSave::save(&probe, probe_name, b"ok") {
                Ok(location) => {
                    let _ = fs::remove_file(location);
                    DoctorCheck {
                        name: "out_dir".to_string(),
                        status: CheckStatus::Ok,
                        message: format!("{} is writable", dir.display()),
                    }
                }
                Err(e) => DoctorCheck {
                    name: "out_dir".to_string(),
                    status: CheckStatus::Error,
                    message: format!("{} is not writable: {}", dir.display(), e),
                },
            },
        );
    }

    checks.push(DoctorCheck {
        name: "http".to_string(),
        status: if cfg!(feature = "http") {
            CheckStatus::Ok
        } else {
            CheckStatus::Warning
        },
        message: if cfg!(feature = "http") {
            "Upload sink available".to_string()
        } else {
            "Built without `http`; documents are saved locally only".to_string()
        },
    });

    checks.push(DoctorCheck {
        name: "stdin".to_string(),
        status: CheckStatus::Ok,
        message: if atty::is(atty::Stream::Stdin) {
            "stdin is a TTY (interactive mode)".to_string()
        } else {
            "stdin is a pipe (scripts can be streamed)".to_string()
        },
    });

    let report = DoctorReport {
        producer: PRODUCER_NAME.to_string(),
        version: TELEMETRY_VERSION.to_string(),
        checks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Telemetry Doctor Report");
        println!("=======================");
        println!("Producer: {}", report.producer);
        println!("Version:  {}", report.version);
        println!("\nChecks:");

        for check in &report.checks {
            let status_icon = match check.status {
                CheckStatus::Ok => "[OK]",
                CheckStatus::Warning => "[WARN]",
                CheckStatus::Error => "[ERR]",
            };
            println!("  {} {}: {}", status_icon, check.name, check.message);
        }
    }

    let has_errors = report
        .checks
        .iter()
        .any(|c| matches!(c.status, CheckStatus::Error));
    if has_errors {
        Err(TelemetryCliError::DoctorFailed)
    } else {
        Ok(())
    }
}

// ============================================================================
// Error handling
// ============================================================================

#[derive(Debug)]
enum TelemetryCliError {
    Io(io::Error),
    Tracker(booking_telemetry::TrackerError),
    Json(serde_json::Error),
    Script(String),
    NoSteps,
    ValidationFailed(usize),
    DoctorFailed,
}

impl From<io::Error> for TelemetryCliError {
    fn from(e: io::Error) -> Self {
        TelemetryCliError::Io(e)
    }
}

impl From<booking_telemetry::TrackerError> for TelemetryCliError {
    fn from(e: booking_telemetry::TrackerError) -> Self {
        TelemetryCliError::Tracker(e)
    }
}

impl From<serde_json::Error> for TelemetryCliError {
    fn from(e: serde_json::Error) -> Self {
        TelemetryCliError::Json(e)
    }
}

#[derive(Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<TelemetryCliError> for CliError {
    fn from(e: TelemetryCliError) -> Self {
        match e {
            TelemetryCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            TelemetryCliError::Tracker(e) => CliError {
                code: "TRACKER_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Ensure the document was produced by booking-telemetry".to_string()),
            },
            TelemetryCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            TelemetryCliError::Script(message) => CliError {
                code: "SCRIPT_ERROR".to_string(),
                message,
                hint: Some("Each step needs at_ms and action fields, in time order".to_string()),
            },
            TelemetryCliError::NoSteps => CliError {
                code: "NO_STEPS".to_string(),
                message: "No steps found in script".to_string(),
                hint: Some("Ensure input file is not empty".to_string()),
            },
            TelemetryCliError::ValidationFailed(count) => CliError {
                code: "VALIDATION_FAILED".to_string(),
                message: format!("{} invariant violation(s) found", count),
                hint: Some("Run 'telemetry inspect' to see the ledger".to_string()),
            },
            TelemetryCliError::DoctorFailed => CliError {
                code: "DOCTOR_FAILED".to_string(),
                message: "One or more health checks failed".to_string(),
                hint: Some("Review the checks above".to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn epoch() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn test_step_instant_offsets_epoch() {
        let at = step_instant(epoch(), 1_500).unwrap();
        assert_eq!((at - epoch()).num_milliseconds(), 1_500);
    }

    #[test]
    fn test_step_instant_rejects_overflow() {
        assert!(matches!(
            step_instant(epoch(), i64::MAX),
            Err(TelemetryCliError::Script(_))
        ));
    }

    #[test]
    fn test_script_rejects_negative_and_unordered_steps() {
        let negative = r#"{"at_ms": -5, "action": "stop"}"#;
        assert!(matches!(
            parse_script(negative, InputFormat::Ndjson),
            Err(TelemetryCliError::Script(_))
        ));

        let unordered = concat!(
            r#"{"at_ms": 10, "action": "start", "run_key": "1"}"#,
            "\n",
            r#"{"at_ms": 5, "action": "stop"}"#
        );
        assert!(matches!(
            parse_script(unordered, InputFormat::Ndjson),
            Err(TelemetryCliError::Script(_))
        ));
    }

    #[test]
    fn test_script_parses_input_steps() {
        let script = r#"[
            {"at_ms": 0, "action": "start", "run_key": "1"},
            {"at_ms": 20, "action": "location", "path": "/search"},
            {"at_ms": 25, "action": "input", "event": {"type": "history_pop"}},
            {"at_ms": 90, "action": "stop"}
        ]"#;
        let steps = parse_script(script, InputFormat::Json).unwrap();
        assert_eq!(steps.len(), 4);
        assert!(matches!(
            steps[2].action,
            ScriptAction::Input {
                event: InputEvent::HistoryPop
            }
        ));
    }
}
