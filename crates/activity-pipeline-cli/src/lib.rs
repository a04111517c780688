//! Command surface for the activity pipeline engine.
//!
//! Hosts embed it through:
//! - [`run_cli`] for a fully parsed command line.
//! - [`run_pipeline_with_db`] for a single [`Command`] against a DB path with
//!   default settings.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use activity_pipeline_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, Activity, ActivityId, FollowUp, FollowUpId,
    FollowUpRecord, PipelineConfig, PipelineError, PipelineOrchestrator, PipelineRun, Priority,
    StrategyKind,
};
use activity_pipeline_store_sqlite::{SeedBundle, SqliteActivityStore, StoreConfig};
use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::debug;
use ulid::Ulid;

pub const PIPELINE_VIEW_CONTRACT: &str = "pipeline_view.v1";

#[derive(Debug, Parser)]
#[command(name = "ap")]
#[command(about = "Activity pipeline reconstruction CLI")]
pub struct Cli {
    #[arg(long, default_value = "./activity_pipeline.sqlite3")]
    db: PathBuf,

    #[arg(long, default_value_t = 2500)]
    operation_timeout_ms: u64,

    #[arg(long, default_value_t = 5000)]
    busy_timeout_ms: u64,

    /// Treat an optimized-strategy failure as final.
    #[arg(long)]
    no_fallback: bool,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[must_use]
    pub fn verbosity(&self) -> u8 {
        self.verbose
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Activity {
        #[command(subcommand)]
        command: ActivityCommand,
    },
    FollowUp {
        #[command(subcommand)]
        command: FollowUpCommand,
    },
    Import(ImportArgs),
    Pipeline {
        #[command(subcommand)]
        command: PipelineCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum ActivityCommand {
    Add(ActivityAddArgs),
}

#[derive(Debug, Args)]
pub struct ActivityAddArgs {
    #[arg(long)]
    id: Option<String>,
    #[arg(long)]
    activity_type: String,
    #[arg(long)]
    activity_date: Option<String>,
    #[arg(long)]
    parent_activity_id: Option<String>,
    #[arg(long)]
    customer_id: Option<String>,
    #[arg(long)]
    lead_id: Option<String>,
    #[arg(long)]
    contact_id: Option<String>,
    #[arg(long)]
    notes: Option<String>,
    #[arg(long)]
    pipeline_stage: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum FollowUpCommand {
    Add(FollowUpAddArgs),
}

#[derive(Debug, Args)]
pub struct FollowUpAddArgs {
    #[arg(long)]
    id: Option<String>,
    #[arg(long)]
    activity_id: String,
    #[arg(long)]
    note: String,
    #[arg(long)]
    follow_up_date: Option<String>,
    #[arg(long, value_enum, default_value_t = PriorityArg::Medium)]
    priority: PriorityArg,
    #[arg(long)]
    done: bool,
}

#[derive(Debug, Args)]
pub struct ImportArgs {
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Subcommand)]
pub enum PipelineCommand {
    Show(PipelineShowArgs),
}

#[derive(Debug, Args)]
pub struct PipelineShowArgs {
    #[arg(long)]
    activity_id: String,
    #[arg(long, value_enum, default_value_t = StrategyArg::Auto)]
    strategy: StrategyArg,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PriorityArg {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StrategyArg {
    Auto,
    Optimized,
    Original,
}

/// Settings that come from global flags rather than the subcommand.
#[derive(Debug, Clone, Default)]
pub struct RunSettings {
    pub store: StoreConfig,
    pub pipeline: PipelineConfig,
}

/// Machine-readable failure printed on stderr.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorEnvelope {
    pub code: String,
    pub message: String,
}

impl From<&PipelineError> for ErrorEnvelope {
    fn from(err: &PipelineError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Builds the stderr envelope for a failed command, using the engine's code
/// when one is anywhere in the error chain.
#[must_use]
pub fn error_envelope(err: &anyhow::Error) -> ErrorEnvelope {
    let code = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<PipelineError>())
        .map_or("cli.command_failed", PipelineError::code);
    ErrorEnvelope {
        code: code.to_string(),
        message: format!("{err:#}"),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineViewPayload {
    contract_version: String,
    start_activity_id: ActivityId,
    strategy: StrategyKind,
    fallback_error: Option<ErrorEnvelope>,
    annotation_error: Option<ErrorEnvelope>,
    activities: Vec<Activity>,
}

#[derive(Debug, Clone, Serialize)]
struct ImportSummary {
    activities: usize,
    follow_ups: usize,
}

/// Executes the parsed top-level command.
///
/// # Errors
/// Returns an error when store open/migrate fails or the command fails.
pub async fn run_cli(cli: Cli) -> Result<()> {
    let settings = RunSettings {
        store: StoreConfig {
            busy_timeout_ms: cli.busy_timeout_ms,
            operation_timeout_ms: cli.operation_timeout_ms,
        },
        pipeline: PipelineConfig {
            fallback_enabled: !cli.no_fallback,
        },
    };
    run_with_settings(&cli.db, &settings, cli.command).await
}

/// Executes one command against `db_path` with default settings.
///
/// # Errors
/// Returns an error when store open/migrate fails or the command fails.
pub async fn run_pipeline_with_db(db_path: &Path, command: Command) -> Result<()> {
    run_with_settings(db_path, &RunSettings::default(), command).await
}

async fn run_with_settings(db_path: &Path, settings: &RunSettings, command: Command) -> Result<()> {
    let store = SqliteActivityStore::open(db_path, &settings.store)?;
    store.migrate()?;
    debug!(db = %db_path.display(), "activity store ready");

    match command {
        Command::Activity {
            command: ActivityCommand::Add(args),
        } => {
            let activity = add_activity(&store, args)?;
            println!("{}", serde_json::to_string_pretty(&activity)?);
            Ok(())
        }
        Command::FollowUp {
            command: FollowUpCommand::Add(args),
        } => {
            let follow_up = add_follow_up(&store, args)?;
            println!("{}", serde_json::to_string_pretty(&follow_up)?);
            Ok(())
        }
        Command::Import(args) => {
            let body = std::fs::read_to_string(&args.file)
                .with_context(|| format!("failed to read bundle {}", args.file.display()))?;
            let bundle: SeedBundle = serde_json::from_str(&body)
                .with_context(|| format!("invalid bundle JSON in {}", args.file.display()))?;
            let report = store.import_bundle(&bundle)?;
            let summary = ImportSummary {
                activities: report.activities,
                follow_ups: report.follow_ups,
            };
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Command::Pipeline {
            command: PipelineCommand::Show(args),
        } => show_pipeline(store, settings, &args).await,
    }
}

fn add_activity(store: &SqliteActivityStore, args: ActivityAddArgs) -> Result<Activity> {
    let activity_type = args.activity_type.trim();
    if activity_type.is_empty() {
        return Err(PipelineError::Validation("activity_type must not be empty".to_string()).into());
    }

    let activity = Activity {
        id: ActivityId(args.id.unwrap_or_else(|| Ulid::new().to_string())),
        activity_date: parse_optional_utc(args.activity_date.as_deref())?,
        activity_type: activity_type.to_string(),
        parent_activity_id: args.parent_activity_id.map(ActivityId),
        customer_id: args.customer_id,
        lead_id: args.lead_id,
        contact_id: args.contact_id,
        notes: args.notes,
        pipeline_stage: args.pipeline_stage,
        follow_ups: Vec::new(),
    };
    store.insert_activity(&activity)?;

    store
        .get_activity(&activity.id)?
        .ok_or_else(|| anyhow!("activity {} missing after insert", activity.id))
}

fn add_follow_up(store: &SqliteActivityStore, args: FollowUpAddArgs) -> Result<FollowUp> {
    let activity_id = ActivityId(args.activity_id);
    if store.get_activity(&activity_id)?.is_none() {
        return Err(PipelineError::NotFound(activity_id).into());
    }

    let record = FollowUpRecord {
        id: FollowUpId(args.id.unwrap_or_else(|| Ulid::new().to_string())),
        activity_id,
        follow_up_note: args.note,
        follow_up_date: parse_optional_utc(args.follow_up_date.as_deref())?,
        priority: map_priority(args.priority).as_str().to_string(),
        is_done: args.done,
        created_at: now_utc(),
    };
    store.insert_follow_up(&record)?;
    Ok(FollowUp::from(record))
}

async fn show_pipeline(
    store: SqliteActivityStore,
    settings: &RunSettings,
    args: &PipelineShowArgs,
) -> Result<()> {
    let orchestrator =
        PipelineOrchestrator::new(Arc::new(store)).with_config(settings.pipeline.clone());
    let start_id = ActivityId::new(args.activity_id.as_str());

    let run = match args.strategy {
        StrategyArg::Auto => orchestrator.run(&start_id).await?,
        StrategyArg::Optimized => {
            orchestrator
                .run_strategy(StrategyKind::Optimized, &start_id)
                .await?
        }
        StrategyArg::Original => {
            orchestrator
                .run_strategy(StrategyKind::Original, &start_id)
                .await?
        }
    };

    if args.json {
        let payload = build_pipeline_view_payload(run);
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        print_pipeline_table(&run)?;
    }
    Ok(())
}

fn build_pipeline_view_payload(run: PipelineRun) -> PipelineViewPayload {
    PipelineViewPayload {
        contract_version: PIPELINE_VIEW_CONTRACT.to_string(),
        start_activity_id: run.start_id,
        strategy: run.strategy,
        fallback_error: run.fallback_error.as_ref().map(ErrorEnvelope::from),
        annotation_error: run.annotation_error.as_ref().map(ErrorEnvelope::from),
        activities: run.activities,
    }
}

fn print_pipeline_table(run: &PipelineRun) -> Result<()> {
    println!("pipeline: {} strategy={}", run.start_id, run.strategy);
    if let Some(err) = &run.fallback_error {
        println!("fallback: {err}");
    }
    if let Some(err) = &run.annotation_error {
        println!("follow-ups unavailable: {err}");
    }
    println!(
        "{:<30} {:<28} {:<12} {:<14} parent",
        "activity_date", "id", "type", "stage"
    );
    println!("{}", "-".repeat(96));

    for activity in &run.activities {
        println!("{}", format_activity_row(activity)?);
        for follow_up in &activity.follow_ups {
            println!(
                "    [{}] {} {}{}",
                follow_up.priority.as_str(),
                format_timestamp(follow_up.follow_up_date)?,
                follow_up.follow_up_note,
                if follow_up.is_done { " (done)" } else { "" }
            );
        }
    }
    Ok(())
}

// Date column fits RFC3339 with nanoseconds.
fn format_activity_row(activity: &Activity) -> Result<String> {
    Ok(format!(
        "{:<30} {:<28} {:<12} {:<14} {}",
        format_timestamp(activity.activity_date)?,
        activity.id,
        activity.activity_type,
        activity.pipeline_stage.as_deref().unwrap_or("-"),
        activity
            .parent_activity_id
            .as_ref()
            .map_or("-", ActivityId::as_str),
    ))
}

fn format_timestamp(value: time::OffsetDateTime) -> Result<String> {
    Ok(format_rfc3339(value)?)
}

fn parse_optional_utc(raw: Option<&str>) -> Result<time::OffsetDateTime> {
    match raw {
        Some(value) => Ok(parse_rfc3339_utc(value)?),
        None => Ok(now_utc()),
    }
}

fn map_priority(value: PriorityArg) -> Priority {
    match value {
        PriorityArg::Low => Priority::Low,
        PriorityArg::Medium => Priority::Medium,
        PriorityArg::High => Priority::High,
    }
}
