//! Drives sync runs: fetch, reconcile, commit, record.
//!
//! One run at a time (single-flight). Entity types are fetched concurrently
//! but reconciled and committed in dependency order, one atomic batch per
//! type, so that a later type's failure never takes down data already
//! committed. Every run ends with an appended `sync_runs` record.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{RemoteError, StorageError};
use crate::model::{Entity, EntityKind, RunOutcome, SyncRun, TypeCounts};
use crate::remote::RemoteSource;
use crate::store::Store;

use super::reconciler::{self, ReferenceIndex, SnapshotMode};

/// Phase of an in-flight run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
  Fetching,
  Reconciling,
  Committing,
}

/// Observable state of a run.
#[derive(Debug, Clone)]
pub enum RunStatus {
  Running(RunPhase),
  Done(SyncRun),
}

/// Notifications for consumers holding cached reads.
#[derive(Debug, Clone)]
pub enum CacheEvent {
  /// A batch for this kind was committed.
  Changed(EntityKind),
  /// A run reached a terminal state.
  SyncFinished(RunOutcome),
}

/// Handle to a sync run. Cloneable; `trigger_sync` hands the same handle to
/// every caller while the run is active.
#[derive(Debug, Clone)]
pub struct RunHandle {
  id: u64,
  status: watch::Receiver<RunStatus>,
  cancel: Arc<AtomicBool>,
}

impl RunHandle {
  fn new(id: u64) -> (Self, watch::Sender<RunStatus>) {
    let (tx, rx) = watch::channel(RunStatus::Running(RunPhase::Fetching));
    let handle = Self {
      id,
      status: rx,
      cancel: Arc::new(AtomicBool::new(false)),
    };
    (handle, tx)
  }

  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn status(&self) -> RunStatus {
    self.status.borrow().clone()
  }

  pub fn is_running(&self) -> bool {
    matches!(*self.status.borrow(), RunStatus::Running(_))
  }

  /// Request cancellation. Honored between entity-type phases, never
  /// mid-commit; the run then records a partial outcome.
  pub fn cancel(&self) {
    self.cancel.store(true, Ordering::SeqCst);
  }

  /// Wait for the run to reach a terminal state.
  pub async fn wait(&self) -> SyncRun {
    let mut status = self.status.clone();
    loop {
      if let RunStatus::Done(run) = &*status.borrow() {
        return run.clone();
      }
      if status.changed().await.is_err() {
        // Runner dropped without reporting; surface it as a failed run
        // rather than hanging the caller.
        let now = Utc::now();
        return SyncRun {
          id: 0,
          started_at: now,
          finished_at: now,
          outcome: RunOutcome::Failed,
          error: Some("sync task aborted".to_string()),
          counts: BTreeMap::new(),
          diagnostics: BTreeMap::new(),
        };
      }
    }
  }
}

/// Sync orchestrator.
pub struct SyncEngine<R: RemoteSource> {
  store: Arc<Store>,
  remote: Arc<R>,
  config: Config,
  active: Mutex<Option<RunHandle>>,
  events: broadcast::Sender<CacheEvent>,
  run_seq: AtomicU64,
}

impl<R: RemoteSource + 'static> SyncEngine<R> {
  pub fn new(store: Arc<Store>, remote: R, config: Config) -> Self {
    let (events, _) = broadcast::channel(64);
    Self {
      store,
      remote: Arc::new(remote),
      config,
      active: Mutex::new(None),
      events,
      run_seq: AtomicU64::new(1),
    }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
    self.events.subscribe()
  }

  /// Publish a cache event on behalf of a local write.
  pub(crate) fn emit(&self, event: CacheEvent) {
    let _ = self.events.send(event);
  }

  pub fn is_syncing(&self) -> bool {
    self
      .active_lock()
      .as_ref()
      .map(|h| h.is_running())
      .unwrap_or(false)
  }

  fn active_lock(&self) -> std::sync::MutexGuard<'_, Option<RunHandle>> {
    self.active.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Start a sync run, or return the handle of the one already in flight.
  pub fn trigger_sync(self: &Arc<Self>) -> RunHandle {
    let mut active = self.active_lock();
    if let Some(handle) = active.as_ref() {
      if handle.is_running() {
        debug!(run = handle.id(), "sync already in flight");
        return handle.clone();
      }
    }

    let id = self.run_seq.fetch_add(1, Ordering::SeqCst);
    let (handle, tx) = RunHandle::new(id);
    *active = Some(handle.clone());
    drop(active);

    let engine = Arc::clone(self);
    let cancel = Arc::clone(&handle.cancel);
    tokio::spawn(async move {
      let run = engine.run(id, &tx, &cancel).await;
      let _ = engine.events.send(CacheEvent::SyncFinished(run.outcome));
      tx.send_replace(RunStatus::Done(run));
    });

    handle
  }

  /// One complete fetch-reconcile-commit pass.
  async fn run(&self, id: u64, tx: &watch::Sender<RunStatus>, cancel: &AtomicBool) -> SyncRun {
    let started_at = Utc::now();
    info!(run = id, "sync run started");

    let mut counts: BTreeMap<String, TypeCounts> = BTreeMap::new();
    let mut diagnostics: BTreeMap<String, String> = BTreeMap::new();
    let mut first_error: Option<String> = None;
    let mut storage_error: Option<String> = None;
    let mut cancelled = false;
    let mut any_ok = false;
    let mut any_failed = false;

    // Fetches are independent per type and run concurrently; reconcile and
    // commit stay serialized in dependency order below.
    tx.send_replace(RunStatus::Running(RunPhase::Fetching));
    let fetched = futures::future::join_all(
      EntityKind::SYNC_ORDER.map(|kind| self.fetch_snapshot(kind)),
    )
    .await;

    for (kind, result) in EntityKind::SYNC_ORDER.into_iter().zip(fetched) {
      if cancel.load(Ordering::SeqCst) {
        cancelled = true;
        diagnostics.insert("cancelled".to_string(), format!("before {}", kind));
        warn!(run = id, kind = %kind, "sync run cancelled");
        break;
      }

      let entities = match result {
        Ok(entities) => entities,
        Err(err) => {
          warn!(run = id, kind = %kind, error = %err, "fetch failed");
          counts.insert(
            kind.as_str().to_string(),
            TypeCounts { failed: true, ..Default::default() },
          );
          diagnostics.insert(kind.as_str().to_string(), format!("failed: {}", err));
          first_error.get_or_insert_with(|| format!("{} fetch failed: {}", kind, err));
          any_failed = true;
          continue;
        }
      };

      tx.send_replace(RunStatus::Running(RunPhase::Reconciling));
      match self.reconcile_and_commit(kind, entities, tx).await {
        Ok(type_counts) => {
          diagnostics.insert(
            kind.as_str().to_string(),
            format!("ok: {}", type_counts.fetched),
          );
          counts.insert(kind.as_str().to_string(), type_counts);
          any_ok = true;
          let _ = self.events.send(CacheEvent::Changed(kind));
        }
        Err(err) => {
          // A storage failure poisons the rest of the run: nothing further
          // can commit reliably.
          error!(run = id, kind = %kind, error = %err, "commit failed");
          counts.insert(
            kind.as_str().to_string(),
            TypeCounts { failed: true, ..Default::default() },
          );
          diagnostics.insert(kind.as_str().to_string(), format!("failed: {}", err));
          storage_error = Some(err.to_string());
          any_failed = true;
          break;
        }
      }
    }

    let outcome = if storage_error.is_some() {
      RunOutcome::Failed
    } else if cancelled {
      RunOutcome::Partial
    } else if any_failed && any_ok {
      RunOutcome::Partial
    } else if any_failed {
      RunOutcome::Failed
    } else {
      RunOutcome::Success
    };

    let error = storage_error.or(if outcome == RunOutcome::Success {
      None
    } else {
      first_error
    });

    if outcome == RunOutcome::Success {
      match self.store.purge_tombstones(self.config.tombstone_retention_days) {
        Ok(0) => {}
        Ok(purged) => debug!(run = id, purged, "purged expired tombstones"),
        Err(err) => warn!(run = id, error = %err, "tombstone purge failed"),
      }
    }

    let mut run = SyncRun {
      id: 0,
      started_at,
      finished_at: Utc::now(),
      outcome,
      error,
      counts,
      diagnostics,
    };

    match self.store.apply_batch(&[], Some(&run)) {
      Ok(result) => run.id = result.run_id.unwrap_or(0),
      Err(err) => error!(run = id, error = %err, "failed to append sync run record"),
    }

    info!(run = id, outcome = outcome.as_str(), summary = %run.summary(), "sync run finished");
    run
  }

  async fn reconcile_and_commit(
    &self,
    kind: EntityKind,
    entities: Vec<Entity>,
    tx: &watch::Sender<RunStatus>,
  ) -> Result<TypeCounts, StorageError> {
    let cached = self.store.entity_meta(kind)?;
    let pending = self.store.list_pending_edits()?;
    let refs = if kind == EntityKind::Issue {
      self.reference_index()?
    } else {
      ReferenceIndex::default()
    };

    let diff = reconciler::reconcile(
      kind,
      entities,
      &cached,
      &pending,
      &refs,
      SnapshotMode::Full,
      self.config.conflict_policy,
      Utc::now(),
    );
    let mut counts = diff.counts;

    tx.send_replace(RunStatus::Running(RunPhase::Committing));
    self.store.apply_batch(&diff.changes, None)?;

    match kind {
      EntityKind::Member | EntityKind::Project | EntityKind::Cycle => {
        let resolved = self.store.resolve_dangling(kind)?;
        if resolved > 0 {
          debug!(kind = %kind, resolved, "resolved dangling references");
        }
      }
      EntityKind::Issue => {
        // Project aggregates derive from the committed issue set; refresh
        // them in their own batch once issues have landed.
        let aggregates = reconciler::project_aggregates(
          &self.store.projects()?,
          &self.store.live_issues()?,
          &self.config.active_statuses,
        );
        if !aggregates.is_empty() {
          counts.updated += aggregates.len() as u64;
          self.store.apply_batch(&aggregates, None)?;
        }
      }
      EntityKind::Team => {}
    }

    Ok(counts)
  }

  fn reference_index(&self) -> Result<ReferenceIndex, StorageError> {
    let live = |kind: EntityKind| -> Result<_, StorageError> {
      Ok(
        self
          .store
          .entity_meta(kind)?
          .into_iter()
          .filter(|(_, meta)| meta.deleted_at.is_none())
          .map(|(id, _)| id)
          .collect(),
      )
    };
    Ok(ReferenceIndex {
      members: live(EntityKind::Member)?,
      projects: live(EntityKind::Project)?,
      cycles: live(EntityKind::Cycle)?,
    })
  }

  /// Fetch every page of a type's snapshot, retrying transient failures
  /// with bounded exponential backoff.
  async fn fetch_snapshot(&self, kind: EntityKind) -> Result<Vec<Entity>, RemoteError> {
    let mut entities = Vec::new();
    let mut cursor: Option<String> = None;

    loop {
      let page = self.fetch_page_with_retry(kind, cursor).await?;
      entities.extend(page.entities);
      match page.next_cursor {
        Some(next) => cursor = Some(next),
        None => break,
      }
    }
    Ok(entities)
  }

  async fn fetch_page_with_retry(
    &self,
    kind: EntityKind,
    cursor: Option<String>,
  ) -> Result<crate::remote::Page, RemoteError> {
    let retries = self.config.sync.fetch_retries;
    let base = self.config.sync.retry_base_ms;
    let mut attempt = 0;

    loop {
      match self.remote.fetch_page(kind, cursor.clone()).await {
        Ok(page) => return Ok(page),
        Err(err) if err.is_transient() && attempt < retries => {
          let delay = backoff_delay(base, attempt);
          warn!(kind = %kind, attempt, error = %err, "transient fetch error, retrying");
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
        Err(err) => return Err(err),
      }
    }
  }
}

/// Exponential retry delay. The exponent is clamped so a large configured
/// retry count cannot overflow the shift.
fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
  Duration::from_millis(base_ms.saturating_mul(1 << attempt.min(16)))
}

/// Spawn the polling loop: re-trigger a run every poll interval unless one
/// is active, backing off after failed runs. Shut down via the watch channel.
pub fn spawn_poller<R: RemoteSource + 'static>(
  engine: Arc<SyncEngine<R>>,
  mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    let interval = Duration::from_secs(engine.config.sync.poll_interval_secs);
    let cooldown_base = engine.config.sync.failure_cooldown_secs;
    let max_backoff = engine.config.sync.max_backoff_secs;
    let mut consecutive_failures: u32 = 0;

    loop {
      tokio::select! {
        _ = tokio::time::sleep(interval) => {}
        _ = shutdown.changed() => {
          debug!("poller shutting down");
          return;
        }
      }

      if engine.is_syncing() {
        continue;
      }

      // Skip silently while the failure cooldown window is open
      if consecutive_failures > 0 {
        let shift = consecutive_failures.saturating_sub(1).min(16);
        let cooldown = cooldown_base.saturating_mul(1 << shift).min(max_backoff);
        let last = match engine.store.sync_history(1) {
          Ok(runs) => runs.into_iter().next(),
          Err(err) => {
            warn!(error = %err, "poller could not read sync history");
            None
          }
        };
        if let Some(last) = last {
          let elapsed = (Utc::now() - last.finished_at).num_seconds().max(0) as u64;
          if elapsed < cooldown {
            debug!(elapsed, cooldown, "skipping poll during failure cooldown");
            continue;
          }
        }
      }

      let run = engine.trigger_sync().wait().await;
      if run.outcome == RunOutcome::Failed {
        consecutive_failures += 1;
      } else {
        consecutive_failures = 0;
      }
    }
  })
}
