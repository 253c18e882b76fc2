//! chatclass - incremental, idempotent chat classification
//!
//! Classifies whole sessions and individual messages stored in the chat
//! database, writing only what changed since the last run.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/chatclass/data.db (~/.local/share/chatclass/data.db)
//! - Logs: $XDG_STATE_HOME/chatclass/chatclass.log (~/.local/state/chatclass/chatclass.log)
//! - Config: $XDG_CONFIG_HOME/chatclass/config.toml (~/.config/chatclass/config.toml)

use anyhow::{Context, Result};
use chatclass_core::classifier::{
    create_completion_client, LlmClassifier, ResilientClassifier, RetryPolicy,
};
use chatclass_core::db::repo::{format_ts, parse_ts};
use chatclass_core::instructions::create_instruction_provider;
use chatclass_core::pipeline::{plan_candidates, Pipeline, PipelineOptions, RunSummary};
use chatclass_core::{Config, Database, RoleFilter, SessionRef, Taxonomy};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "chatclass")]
#[command(about = "Classify chat sessions and messages incrementally")]
#[command(version)]
struct Args {
    /// Roles eligible for per-message classification
    #[arg(long, num_args = 1.., value_name = "ROLE", default_value = "user")]
    roles: Vec<String>,

    /// Only consider sessions with activity at or after this time (ISO 8601)
    #[arg(long, value_parser = parse_since)]
    since: Option<DateTime<Utc>>,

    /// Process at most N sessions
    #[arg(long, value_name = "N")]
    limit: Option<usize>,

    /// Skip session-level classification
    #[arg(long)]
    no_session: bool,

    /// Skip per-message classification
    #[arg(long)]
    no_messages: bool,

    /// Re-send messages that already have a classification
    #[arg(long)]
    reclassify_existing_messages: bool,

    /// Messages per model call (default: all of a session's messages at once)
    #[arg(long, value_name = "N")]
    per_session_message_batch_size: Option<usize>,

    /// Console log level
    #[arg(long, value_enum, ignore_case = true, default_value = "info")]
    log_level: LogLevel,

    /// Config file (default: $XDG_CONFIG_HOME/chatclass/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Database file (overrides [database] path)
    #[arg(long)]
    database: Option<PathBuf>,

    /// Parallel session workers (overrides [pipeline] workers)
    #[arg(long, value_name = "N")]
    workers: Option<usize>,

    /// List candidate sessions without classifying anything
    #[arg(long)]
    dry_run: bool,

    /// Output format for the run summary
    #[arg(long, value_enum, default_value = "text")]
    format: OutputFormat,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogLevel {
    Debug,
    Info,
    #[value(alias = "warn")]
    Warning,
    Error,
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn parse_since(raw: &str) -> std::result::Result<DateTime<Utc>, String> {
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc());
        }
    }
    parse_ts(raw).or_else(|_| parse_ts(&raw.replacen('T', " ", 1)))
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Ensure XDG environment variables are set before using core library
    Config::ensure_xdg_env();

    let mut config = match &args.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("failed to load configuration")?;
    if let Some(workers) = args.workers {
        config.pipeline.workers = workers;
    }
    config.validate().context("invalid configuration")?;

    let _log_guard = chatclass_core::logging::init(&config.logging, Some(args.log_level.as_filter()))
        .context("failed to initialize logging")?;

    tracing::info!("chatclass starting");

    let message_roles = RoleFilter::from_names(&args.roles)
        .map_err(anyhow::Error::msg)
        .context("invalid --roles")?;
    let taxonomy = Taxonomy::from_config(&config.taxonomy).context("invalid taxonomy")?;

    let options = PipelineOptions {
        classify_sessions: !args.no_session,
        classify_messages: !args.no_messages,
        message_roles,
        since: args.since,
        limit: args.limit,
        batch_size: args.per_session_message_batch_size,
        reclassify_existing_messages: args.reclassify_existing_messages,
        ..PipelineOptions::from_config(&config).context("invalid pipeline configuration")?
    };

    let db_path = args
        .database
        .clone()
        .unwrap_or_else(|| config.resolved_database_path());
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    tracing::info!(path = %db_path.display(), "Opening database");
    let db = Database::open(&db_path).context("failed to open database")?;
    db.migrate().context("failed to run database migrations")?;

    if args.dry_run {
        let candidates = plan_candidates(&db, &options).context("failed to list candidates")?;
        print_candidates(&candidates, args.format)?;
        tracing::info!(candidates = candidates.len(), "Dry run complete");
        return Ok(());
    }

    let provider =
        create_instruction_provider(&config.instructions).context("failed to set up instructions")?;
    let client = create_completion_client(&config.llm).context("failed to set up model client")?;
    let classifier = ResilientClassifier::new(
        LlmClassifier::new(client, taxonomy.clone()),
        RetryPolicy::from_config(&config.retry),
    );

    let cancel = Arc::new(AtomicBool::new(false));
    let c = cancel.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nStopping after the current session...");
        c.store(true, Ordering::SeqCst);
    })
    .context("failed to install Ctrl-C handler")?;

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {pos} session(s) processed {msg}")
            .unwrap(),
    );
    pb.enable_steady_tick(Duration::from_millis(120));

    let result = Pipeline::new(&db, &classifier, provider.as_ref(), &taxonomy, options)
        .with_cancel_flag(cancel)
        .on_session_done(|outcome| {
            pb.inc(1);
            pb.set_message(outcome.session_id.clone());
        })
        .run();

    let summary = match result {
        Ok(summary) => {
            pb.finish_and_clear();
            summary
        }
        Err(e) => {
            pb.abandon();
            tracing::error!(error = %e, "Classification run aborted");
            return Err(e).context("classification run aborted");
        }
    };

    print_summary(&summary, args.format)?;
    Ok(())
}

fn print_candidates(candidates: &[SessionRef], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let rows: Vec<serde_json::Value> = candidates
                .iter()
                .map(|s| {
                    serde_json::json!({
                        "session_id": s.session_id,
                        "message_count": s.message_count,
                        "current_upto": format_ts(&s.current_upto),
                        "processed_upto": s.processed_upto.as_ref().map(format_ts),
                        "unclassified_messages": s.unclassified_messages,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        OutputFormat::Text => {
            println!("{} candidate session(s)", candidates.len());
            for s in candidates {
                println!(
                    "  {}  messages={} upto={} processed_upto={} unclassified={}",
                    s.session_id,
                    s.message_count,
                    format_ts(&s.current_upto),
                    s.processed_upto
                        .as_ref()
                        .map(format_ts)
                        .unwrap_or_else(|| "-".to_string()),
                    s.unclassified_messages
                );
            }
            println!("\nDry run - nothing classified");
        }
    }
    Ok(())
}

fn print_summary(summary: &RunSummary, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(summary)?),
        OutputFormat::Text => {
            let elapsed = summary
                .finished_at
                .map(|end| (end - summary.started_at).num_milliseconds() as f64 / 1000.0)
                .unwrap_or_default();
            println!("Run {} finished in {:.1}s", summary.run_id, elapsed);
            println!(
                "Sessions: {} considered, {} classified, {} skipped, {} failed",
                summary.sessions_considered,
                summary.sessions_classified,
                summary.sessions_skipped,
                summary.sessions_failed
            );
            println!(
                "Message batches: {} classified, {} skipped, {} failed",
                summary.batches_classified, summary.batches_skipped, summary.batches_failed
            );
            println!(
                "Messages: {} classified, {} already classified, {} failed",
                summary.messages_classified, summary.messages_skipped, summary.messages_failed
            );
            if summary.anomalies > 0 {
                println!("Anomalies: {}", summary.anomalies);
            }
            if summary.cancelled {
                println!("Run was cancelled; remaining sessions will be picked up next time");
            }
            if summary.has_failures() {
                println!("Some units failed; see {}", Config::log_path().display());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_since_formats() {
        let midnight = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        assert_eq!(parse_since("2025-03-01").unwrap(), midnight);
        assert_eq!(parse_since("2025-03-01T00:00:00Z").unwrap(), midnight);
        assert_eq!(parse_since("2025-03-01T00:00:00").unwrap(), midnight);
        assert_eq!(parse_since("2025-03-01 00:00:00").unwrap(), midnight);
        assert!(parse_since("yesterday").is_err());
    }

    #[test]
    fn test_log_level_is_case_insensitive() {
        let args = Args::try_parse_from(["chatclass", "--log-level", "WARNING"]).unwrap();
        assert_eq!(args.log_level.as_filter(), "warn");
        let args = Args::try_parse_from(["chatclass", "--log-level", "debug"]).unwrap();
        assert_eq!(args.log_level.as_filter(), "debug");
    }

    #[test]
    fn test_roles_accept_multiple_values() {
        let args = Args::try_parse_from(["chatclass", "--roles", "user", "assistant"]).unwrap();
        assert_eq!(args.roles, vec!["user", "assistant"]);
        let args = Args::try_parse_from(["chatclass"]).unwrap();
        assert_eq!(args.roles, vec!["user"]);
    }
}
