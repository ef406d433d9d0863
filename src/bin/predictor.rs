//! Predictor CLI - Command-line interface for the launch predictor
//!
//! Commands:
//! - replay: Feed a launch log through the engine and print predictions
//! - validate: Validate a launch log against launch.event.v1
//! - inspect: Summarise persisted prediction state
//! - prune: Forget stored labels matching a pattern path
//! - hide: Hide an app from predictions, or show it again

use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use launch_predictor::adapters::{
    FileStore, KeyValueStore, LayoutItem, MemoryAuditSink, MemoryEventLog, MemoryPackages,
    StaticLayout,
};
use launch_predictor::engine::{replay_step, FEATURE_STATE_KEY, RANKER_STATE_KEY};
use launch_predictor::extractors::ExtractorSummary;
use launch_predictor::filters::hidden::HIDDEN_KEY;
use launch_predictor::filters::subtraction::DISMISSED_KEY;
use launch_predictor::schema::{LaunchEvent, ReplayStep};
use launch_predictor::{
    AppIdentifier, Collaborators, LaunchEventAdapter, PredictError, PredictionContext, PredictionEngine,
    PredictorConfig, PrunePattern, SCHEMA_VERSION, VERSION,
};

/// Predictor - On-device predicted app-launch ranking
#[derive(Parser)]
#[command(name = "predictor")]
#[command(version = VERSION)]
#[command(about = "Learn launch habits from a usage log and rank likely next apps", long_about = None)]
struct Cli {
    /// Predictor configuration (JSON); defaults apply to omitted fields
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Feed a launch log through the engine and print predictions
    Replay {
        /// Input file path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Input format
        #[arg(long, default_value = "ndjson")]
        input_format: InputFormat,

        /// State file; loaded before and saved after the replay
        #[arg(long)]
        state: Option<PathBuf>,

        /// First-page layout file (JSON array of {"intent", "profile"})
        #[arg(long)]
        layout: Option<PathBuf>,

        /// Predict for this time (RFC 3339); defaults to one minute after the last event
        #[arg(long)]
        at: Option<String>,

        /// Print every stage's changes along with the predictions
        #[arg(long)]
        report: bool,

        /// Output format
        #[arg(long, default_value = "json-pretty")]
        output_format: OutputFormat,
    },

    /// Validate a launch log
    Validate {
        /// Input file path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Input format
        #[arg(long, default_value = "ndjson")]
        input_format: InputFormat,

        /// Output validation report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Summarise persisted prediction state
    Inspect {
        /// State file
        #[arg(long)]
        state: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Forget stored labels; the first pattern selects extractors by tag
    Prune {
        /// State file
        #[arg(long)]
        state: PathBuf,

        /// Pattern path, e.g. `usage_decay 'com.example/*'`
        #[arg(required = true)]
        patterns: Vec<String>,
    },

    /// Hide an app from predictions
    Hide {
        /// State file
        #[arg(long)]
        state: PathBuf,

        /// App identifier, e.g. `com.example/.Main#10`
        app: String,

        /// Show the app again instead
        #[arg(long)]
        show: bool,
    },
}

#[derive(Clone, ValueEnum)]
enum InputFormat {
    /// Newline-delimited JSON (one event per line)
    Ndjson,
    /// JSON array of events
    Json,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Compact JSON
    Json,
    /// Pretty-printed JSON
    JsonPretty,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", serde_json::to_string(&CliError::from(e)).unwrap_or_else(|_| "Unknown error".to_string()));
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), PredictorCliError> {
    let config = match &cli.config {
        Some(path) => PredictorConfig::from_file(path)?,
        None => PredictorConfig::default(),
    };

    match cli.command {
        Commands::Replay {
            input,
            input_format,
            state,
            layout,
            at,
            report,
            output_format,
        } => cmd_replay(
            config,
            &input,
            input_format,
            state.as_deref(),
            layout.as_deref(),
            at.as_deref(),
            report,
            output_format,
        ),

        Commands::Validate {
            input,
            input_format,
            json,
        } => cmd_validate(&input, input_format, json),

        Commands::Inspect { state, json } => cmd_inspect(config, &state, json),

        Commands::Prune { state, patterns } => cmd_prune(config, &state, &patterns),

        Commands::Hide { state, app, show } => cmd_hide(config, &state, &app, show),
    }
}

/// Host collaborators for a CLI session: in-memory log and package table,
/// state in a file when one is given
struct Session {
    events: MemoryEventLog,
    packages: MemoryPackages,
    layout: StaticLayout,
    store: Arc<dyn KeyValueStore>,
}

impl Session {
    fn open(state: Option<&Path>) -> Result<Self, PredictorCliError> {
        let store: Arc<dyn KeyValueStore> = match state {
            Some(path) => Arc::new(FileStore::open(path)?),
            None => Arc::new(launch_predictor::adapters::MemoryStore::new()),
        };
        Ok(Self {
            events: MemoryEventLog::new(),
            packages: MemoryPackages::new(),
            layout: StaticLayout::default(),
            store,
        })
    }

    fn collaborators(&self) -> Collaborators {
        Collaborators {
            events: Arc::new(self.events.clone()),
            packages: Arc::new(self.packages.clone()),
            layout: Arc::new(self.layout.clone()),
            store: Arc::clone(&self.store),
            audit: Arc::new(MemoryAuditSink::new()),
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_replay(
    config: PredictorConfig,
    input: &Path,
    input_format: InputFormat,
    state: Option<&Path>,
    layout: Option<&Path>,
    at: Option<&str>,
    report: bool,
    output_format: OutputFormat,
) -> Result<(), PredictorCliError> {
    let events = read_events(input, input_format)?;
    if events.is_empty() {
        return Err(PredictorCliError::NoEvents);
    }
    let steps = LaunchEventAdapter::to_steps(&events)?;

    let session = Session::open(state)?;
    let mut engine = PredictionEngine::new(config, session.collaborators())?;
    let last = steps.last().map(ReplayStep::timestamp);
    for step in steps {
        // An app counts as installed once it launches, until the log removes it
        if let ReplayStep::Launch(event) = &step {
            session.packages.install(event.app.clone());
        }
        replay_step(&mut engine, &session.events, &session.packages, step);
    }

    let now = match at {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| PredictorCliError::ParseError(format!("Invalid --at {raw}: {e}")))?,
        None => last.unwrap_or_else(Utc::now) + Duration::minutes(1),
    };

    if let Some(path) = layout {
        let items: Vec<LayoutItem> = serde_json::from_str(&fs::read_to_string(path)?)?;
        session.layout.set(items);
        engine.on_workspace_changed(now);
    }

    let result = engine.predict_report(&PredictionContext::at(now));
    engine.save()?;

    let output = if report {
        serde_json::to_value(&result)?
    } else {
        serde_json::to_value(&result.candidates)?
    };
    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string(&output)?),
        OutputFormat::JsonPretty => println!("{}", serde_json::to_string_pretty(&output)?),
    }
    Ok(())
}

fn cmd_validate(input: &Path, input_format: InputFormat, json: bool) -> Result<(), PredictorCliError> {
    let events = read_events(input, input_format)?;
    let results = LaunchEventAdapter::validate_events(&events);

    let report = ValidationReport {
        schema_version: SCHEMA_VERSION.to_string(),
        total_events: events.len(),
        valid_events: events.len() - results.len(),
        invalid_events: results.len(),
        errors: results
            .iter()
            .map(|r| ValidationErrorDetail {
                index: r.index,
                event_id: r.event_id.clone(),
                error: r.error.to_string(),
            })
            .collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Validation Report ({})", report.schema_version);
        println!("=================");
        println!("Total events:   {}", report.total_events);
        println!("Valid events:   {}", report.valid_events);
        println!("Invalid events: {}", report.invalid_events);

        if !report.errors.is_empty() {
            println!("\nErrors:");
            for err in &report.errors {
                println!(
                    "  - Event {} (index {}): {}",
                    err.event_id.as_deref().unwrap_or("unknown"),
                    err.index,
                    err.error
                );
            }
        }
    }

    if report.invalid_events > 0 {
        Err(PredictorCliError::ValidationFailed(report.invalid_events))
    } else {
        Ok(())
    }
}

fn cmd_inspect(config: PredictorConfig, state: &Path, json: bool) -> Result<(), PredictorCliError> {
    if !state.exists() {
        return Err(PredictorCliError::MissingState(state.to_path_buf()));
    }
    let store = FileStore::open(state)?;
    let blob_len = |key: &str| -> Result<usize, PredictError> {
        Ok(store.get_bytes(key)?.map(|b| b.len()).unwrap_or(0))
    };
    let report = InspectReport {
        version: VERSION.to_string(),
        keys: store.keys(),
        feature_state_bytes: blob_len(FEATURE_STATE_KEY)?,
        ranker_state_bytes: blob_len(RANKER_STATE_KEY)?,
        dismissed: store.get_string_set(DISMISSED_KEY)?.unwrap_or_default(),
        hidden: store.get_string_set(HIDDEN_KEY)?.unwrap_or_default(),
        extractors: {
            let session = Session {
                events: MemoryEventLog::new(),
                packages: MemoryPackages::new(),
                layout: StaticLayout::default(),
                store: Arc::new(store),
            };
            PredictionEngine::new(config, session.collaborators())?.describe()
        },
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Prediction State");
        println!("================");
        println!("Keys:          {}", report.keys.join(", "));
        println!("Feature state: {} bytes", report.feature_state_bytes);
        println!("Ranker state:  {} bytes", report.ranker_state_bytes);
        println!("Dismissed:     {}", report.dismissed.len());
        for app in &report.dismissed {
            println!("  - {}", app);
        }
        println!("Hidden:        {}", report.hidden.len());
        for app in &report.hidden {
            println!("  - {}", app);
        }
        println!("\nExtractors:");
        print_summary(&report.extractors, 1);
    }
    Ok(())
}

fn print_summary(summary: &ExtractorSummary, depth: usize) {
    let labels = summary
        .live_labels
        .map(|n| format!(", {} labels", n))
        .unwrap_or_default();
    println!(
        "{}{} [{}..{}){}",
        "  ".repeat(depth),
        summary.tag,
        summary.offset,
        summary.offset + summary.capacity,
        labels
    );
    for child in &summary.children {
        print_summary(child, depth + 1);
    }
}

fn cmd_prune(config: PredictorConfig, state: &Path, patterns: &[String]) -> Result<(), PredictorCliError> {
    if !state.exists() {
        return Err(PredictorCliError::MissingState(state.to_path_buf()));
    }
    let session = Session::open(Some(state))?;
    let mut engine = PredictionEngine::new(config, session.collaborators())?;
    let path: Vec<PrunePattern> = patterns.iter().map(PrunePattern::new).collect();
    let removed = engine.prune(&path);
    engine.save()?;
    println!("{}", serde_json::to_string(&serde_json::json!({ "removed": removed }))?);
    Ok(())
}

fn cmd_hide(config: PredictorConfig, state: &Path, app: &str, show: bool) -> Result<(), PredictorCliError> {
    let app: AppIdentifier = app.parse()?;
    let session = Session::open(Some(state))?;
    let mut engine = PredictionEngine::new(config, session.collaborators())?;
    let changed = engine.set_hidden(&app, !show);
    println!(
        "{}",
        serde_json::to_string(&serde_json::json!({ "app": app.to_string(), "hidden": !show, "changed": changed }))?
    );
    Ok(())
}

// Helper functions

fn read_events(input: &Path, input_format: InputFormat) -> Result<Vec<LaunchEvent>, PredictorCliError> {
    let input_data = if input.to_string_lossy() == "-" {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    } else {
        fs::read_to_string(input)?
    };

    Ok(match input_format {
        InputFormat::Ndjson => LaunchEventAdapter::parse_ndjson(&input_data)?,
        InputFormat::Json => LaunchEventAdapter::parse_array(&input_data)?,
    })
}

// Error types

#[derive(Debug)]
enum PredictorCliError {
    Io(io::Error),
    Predict(PredictError),
    Json(serde_json::Error),
    NoEvents,
    MissingState(PathBuf),
    ValidationFailed(usize),
    ParseError(String),
}

impl From<io::Error> for PredictorCliError {
    fn from(e: io::Error) -> Self {
        PredictorCliError::Io(e)
    }
}

impl From<PredictError> for PredictorCliError {
    fn from(e: PredictError) -> Self {
        PredictorCliError::Predict(e)
    }
}

impl From<serde_json::Error> for PredictorCliError {
    fn from(e: serde_json::Error) -> Self {
        PredictorCliError::Json(e)
    }
}

#[derive(Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<PredictorCliError> for CliError {
    fn from(e: PredictorCliError) -> Self {
        match e {
            PredictorCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            PredictorCliError::Predict(PredictError::InvalidConfig(message)) => CliError {
                code: "CONFIG_ERROR".to_string(),
                message,
                hint: Some("Fix the configuration file".to_string()),
            },
            PredictorCliError::Predict(e @ PredictError::Parse(_)) => CliError {
                code: "PARSE_ERROR".to_string(),
                message: e.to_string(),
                hint: Some(format!("Ensure input matches {} schema; run 'predictor validate' for details", SCHEMA_VERSION)),
            },
            PredictorCliError::Predict(e) => CliError {
                code: "PREDICT_ERROR".to_string(),
                message: e.to_string(),
                hint: None,
            },
            PredictorCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            PredictorCliError::NoEvents => CliError {
                code: "NO_EVENTS".to_string(),
                message: "No events found in input".to_string(),
                hint: Some("Ensure input file is not empty".to_string()),
            },
            PredictorCliError::MissingState(path) => CliError {
                code: "NO_STATE".to_string(),
                message: format!("State file {} does not exist", path.display()),
                hint: Some("Run 'predictor replay --state' first".to_string()),
            },
            PredictorCliError::ValidationFailed(count) => CliError {
                code: "VALIDATION_FAILED".to_string(),
                message: format!("{} events failed validation", count),
                hint: Some("Fix validation errors and retry".to_string()),
            },
            PredictorCliError::ParseError(msg) => CliError {
                code: "PARSE_ERROR".to_string(),
                message: msg,
                hint: Some("Check input format".to_string()),
            },
        }
    }
}

// Report types

#[derive(Serialize)]
struct ValidationReport {
    schema_version: String,
    total_events: usize,
    valid_events: usize,
    invalid_events: usize,
    errors: Vec<ValidationErrorDetail>,
}

#[derive(Serialize)]
struct ValidationErrorDetail {
    index: usize,
    event_id: Option<String>,
    error: String,
}

#[derive(Serialize)]
struct InspectReport {
    version: String,
    keys: Vec<String>,
    feature_state_bytes: usize,
    ranker_state_bytes: usize,
    dismissed: BTreeSet<String>,
    hidden: BTreeSet<String>,
    extractors: ExtractorSummary,
}
