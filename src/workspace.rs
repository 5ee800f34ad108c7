//! High-level facade tying the store, query engine, and sync orchestrator
//! together. Binaries and embedding callers go through this; the modules
//! underneath stay independently testable.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::config::Config;
use crate::model::{EditField, Entity, EntityKind, Issue, Member, PendingEdit, Project, SyncRun};
use crate::query;
use crate::remote::{HttpRemote, RemoteSource};
use crate::store::{CachedEntity, Change, IssueOrder, Store};
use crate::sync::{CacheEvent, RunHandle, SyncEngine};

pub struct Workspace<R: RemoteSource + 'static> {
  store: Arc<Store>,
  engine: Arc<SyncEngine<R>>,
  config: Config,
}

impl Workspace<HttpRemote> {
  /// Open the cache at the configured path and wire up the remote client.
  pub fn connect(config: Config) -> Result<Self> {
    let remote = HttpRemote::new(&config)?;
    let cache_path = config.resolve_cache_path()?;
    let store = Arc::new(Store::open(&cache_path)?);
    Ok(Self::with_remote(config, store, remote))
  }
}

impl<R: RemoteSource + 'static> Workspace<R> {
  pub fn with_remote(config: Config, store: Arc<Store>, remote: R) -> Self {
    let engine = Arc::new(SyncEngine::new(Arc::clone(&store), remote, config.clone()));
    Self {
      store,
      engine,
      config,
    }
  }

  pub fn store(&self) -> &Store {
    &self.store
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
    self.engine.subscribe()
  }

  /// Start (or join) a sync run.
  pub fn trigger_sync(&self) -> RunHandle {
    self.engine.trigger_sync()
  }

  pub fn engine(&self) -> &Arc<SyncEngine<R>> {
    &self.engine
  }

  pub fn sync_history(&self, limit: usize) -> Result<Vec<SyncRun>> {
    Ok(self.store.sync_history(limit)?)
  }

  pub fn get_entity(&self, kind: EntityKind, id: &str) -> Result<Option<CachedEntity>> {
    Ok(self.store.get(kind, id)?)
  }

  pub fn members(&self) -> Result<Vec<Member>> {
    Ok(self.store.members()?)
  }

  pub fn projects(&self) -> Result<Vec<Project>> {
    Ok(self.store.projects()?)
  }

  /// Run a filter expression against the cache in the requested order,
  /// pending edits overlaid.
  pub fn query_issues(&self, expression: &str, order: IssueOrder) -> Result<Vec<Issue>> {
    let members = self.store.members()?;
    let filter = query::parse(expression, &members)?;
    let issues = query::execute(&self.store, &filter, order, self.config.query.result_limit)?;
    Ok(issues)
  }

  /// Record an optimistic local edit. The edit is validated, stored in the
  /// overlay, and visible in query results immediately; the next sync run
  /// resolves it against remote state. Returns the issue as reads will now
  /// see it, overlay applied.
  pub fn apply_local_edit(
    &self,
    issue_id: &str,
    field: EditField,
    value: Option<String>,
  ) -> Result<Issue> {
    let cached = self
      .store
      .get(EntityKind::Issue, issue_id)?
      .ok_or_else(|| eyre!("no cached issue with id '{}'", issue_id))?;
    if cached.is_tombstone() {
      return Err(eyre!("issue '{}' was deleted remotely", issue_id));
    }

    let value = match (field, value) {
      (EditField::Status, Some(v)) => {
        let known = self
          .config
          .statuses
          .iter()
          .find(|s| s.eq_ignore_ascii_case(&v))
          .ok_or_else(|| eyre!("unknown status '{}'", v))?;
        Some(known.clone())
      }
      (EditField::Status, None) => return Err(eyre!("status cannot be cleared")),
      (EditField::Assignee, Some(v)) => Some(self.resolve_member(&v)?),
      (EditField::Assignee, None) => None,
      (EditField::Estimate, Some(v)) => {
        let n: i64 = v
          .parse()
          .map_err(|_| eyre!("estimate must be a number, got '{}'", v))?;
        if n < 0 {
          return Err(eyre!("estimate must be non-negative, got {}", n));
        }
        Some(n.to_string())
      }
      (EditField::Estimate, None) => return Err(eyre!("estimate cannot be cleared")),
    };

    self.store.apply_batch(
      &[Change::PutPendingEdit(PendingEdit {
        issue_id: issue_id.to_string(),
        field,
        value,
        edited_at: Utc::now(),
      })],
      None,
    )?;
    self.engine.emit(CacheEvent::Changed(EntityKind::Issue));

    let Entity::Issue(mut issue) = cached.entity else {
      return Err(eyre!("'{}' is not an issue", issue_id));
    };
    for edit in self.store.list_pending_edits()? {
      if edit.issue_id == issue.id {
        query::apply_edit(&mut issue, &edit);
      }
    }
    Ok(issue)
  }

  fn resolve_member(&self, value: &str) -> Result<String> {
    let members = self.store.members()?;
    if members.iter().any(|m| m.id == value) {
      return Ok(value.to_string());
    }
    if let Some(m) = members.iter().find(|m| m.name.eq_ignore_ascii_case(value)) {
      return Ok(m.id.clone());
    }
    Err(eyre!("no member with id or name '{}'", value))
  }
}
