mod config;
mod error;
mod model;
mod query;
mod remote;
mod store;
mod sync;
mod workspace;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use config::Config;
use model::{EditField, EntityKind, RunOutcome};
use remote::HttpRemote;
use store::IssueOrder;
use sync::CacheEvent;
use workspace::Workspace;

#[derive(Parser, Debug)]
#[command(name = "pdash")]
#[command(about = "Local-first sync and query engine for project tracking")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/pdash/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run one sync pass and print the outcome
  Sync,
  /// Sync continuously on the configured poll interval
  Watch,
  /// Show recent sync runs, newest first
  History {
    /// How many runs to show
    #[arg(short = 'n', long, default_value_t = 10)]
    limit: usize,
  },
  /// Query cached issues with a filter expression,
  /// e.g. `status:"In Progress" priority:high login`
  Issues {
    /// Sort order: priority, updated, or created
    #[arg(short, long, default_value = "priority")]
    order: String,
    /// Filter expression; empty lists everything
    filter: Vec<String>,
  },
  /// Record an optimistic local edit on a cached issue
  Edit {
    /// Issue id or identifier
    issue: String,
    /// Field to edit: status, assignee, or estimate
    field: String,
    /// New value; omit to clear the assignee
    value: Option<String>,
  },
  /// Check configuration, credentials, and cache health
  Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  let _log_guard = init_tracing();

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let ws = Workspace::connect(config)?;

  match args.command {
    Command::Sync => run_sync(&ws).await,
    Command::Watch => run_watch(&ws).await,
    Command::History { limit } => show_history(&ws, limit),
    Command::Issues { order, filter } => show_issues(&ws, &filter.join(" "), &order),
    Command::Edit {
      issue,
      field,
      value,
    } => apply_edit(&ws, &issue, &field, value),
    Command::Doctor => doctor(&ws),
  }
}

/// File logging via a rolling appender; PDASH_LOG controls the filter.
/// Logging is best-effort: an unusable log directory never blocks the CLI.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
  let log_dir = dirs::state_dir()
    .or_else(dirs::cache_dir)
    .unwrap_or_else(std::env::temp_dir)
    .join("pdash");

  let appender = tracing_appender::rolling::daily(log_dir, "pdash.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);
  let filter = EnvFilter::try_from_env("PDASH_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();
  Some(guard)
}

async fn run_sync(ws: &Workspace<HttpRemote>) -> Result<()> {
  let run = ws.trigger_sync().wait().await;
  println!("{}", run.summary());
  if let Some(error) = &run.error {
    println!("error: {}", error);
  }
  if run.outcome == RunOutcome::Failed {
    return Err(eyre!("sync failed"));
  }
  Ok(())
}

async fn run_watch(ws: &Workspace<HttpRemote>) -> Result<()> {
  let (shutdown_tx, shutdown_rx) = watch::channel(false);
  let poller = sync::spawn_poller(Arc::clone(ws.engine()), shutdown_rx);
  let mut events = ws.subscribe();

  // First pass right away; the poller handles the rest
  let run = ws.trigger_sync().wait().await;
  println!("{}", run.summary());

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      event = events.recv() => {
        if let Ok(CacheEvent::SyncFinished(outcome)) = event {
          println!("sync finished: {}", outcome.as_str());
        }
      }
    }
  }

  shutdown_tx.send(true)?;
  poller.await?;
  Ok(())
}

fn show_history(ws: &Workspace<HttpRemote>, limit: usize) -> Result<()> {
  let runs = ws.sync_history(limit)?;
  if runs.is_empty() {
    println!("no sync runs recorded yet");
    return Ok(());
  }
  for run in runs {
    println!(
      "#{:<4} {}  {}",
      run.id,
      run.started_at.format("%Y-%m-%d %H:%M:%S"),
      run.summary()
    );
    if let Some(error) = &run.error {
      println!("      error: {}", error);
    }
    for (step, note) in &run.diagnostics {
      if note.starts_with("failed") {
        println!("      {}: {}", step, note);
      }
    }
  }
  Ok(())
}

fn show_issues(ws: &Workspace<HttpRemote>, expression: &str, order: &str) -> Result<()> {
  let order = IssueOrder::parse(order)
    .ok_or_else(|| eyre!("unknown order '{}' (expected priority, updated, or created)", order))?;
  let issues = ws.query_issues(expression, order)?;
  for issue in &issues {
    println!(
      "{:<10} {:<7} {:<12} {}",
      issue.identifier,
      issue.priority.as_str(),
      issue.status,
      issue.title
    );
  }
  println!("{} issue(s)", issues.len());
  Ok(())
}

fn apply_edit(
  ws: &Workspace<HttpRemote>,
  issue: &str,
  field: &str,
  value: Option<String>,
) -> Result<()> {
  let field = EditField::parse(field)
    .ok_or_else(|| eyre!("unknown field '{}' (expected status, assignee, or estimate)", field))?;

  // Accept the human-readable identifier as well as the raw id
  let issue_id = match ws.get_entity(EntityKind::Issue, issue)? {
    Some(_) => issue.to_string(),
    None => {
      let found = ws.query_issues(&format!("id:{}", issue), IssueOrder::default())?;
      found
        .first()
        .map(|i| i.id.clone())
        .ok_or_else(|| eyre!("no cached issue matches '{}'", issue))?
    }
  };

  let pending = ws.apply_local_edit(&issue_id, field, value)?;
  println!(
    "{} {:<7} {:<12} {} (pending sync)",
    pending.identifier,
    pending.priority.as_str(),
    pending.status,
    pending.title
  );
  Ok(())
}

fn doctor(ws: &Workspace<HttpRemote>) -> Result<()> {
  let config = ws.config();
  println!("remote url:      {}", config.remote.url);
  println!(
    "api token:       {}",
    if Config::get_api_token().is_ok() {
      "present"
    } else {
      "missing (set PDASH_API_TOKEN or LINEAR_API_KEY)"
    }
  );
  println!("cache path:      {}", config.resolve_cache_path()?.display());
  println!("conflict policy: {:?}", config.conflict_policy);

  for kind in EntityKind::SYNC_ORDER {
    let meta = ws.store().entity_meta(kind)?;
    let tombstoned = meta.values().filter(|m| m.deleted_at.is_some()).count();
    println!(
      "{:<9} {} cached, {} tombstoned",
      format!("{}s:", kind),
      meta.len() - tombstoned,
      tombstoned
    );
  }

  let pending = ws.store().list_pending_edits()?;
  println!("pending edits:   {}", pending.len());

  let dangling = ws.store().list_dangling()?;
  println!("dangling refs:   {}", dangling.len());
  for (issue_id, field, target_id) in dangling.iter().take(10) {
    println!("  issue {} {} -> {}", issue_id, field, target_id);
  }

  match ws.sync_history(1)?.first() {
    Some(run) => println!("last sync:       {}", run.summary()),
    None => println!("last sync:       never"),
  }
  Ok(())
}
