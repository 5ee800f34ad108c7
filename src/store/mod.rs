//! Durable, transactional cache store backed by SQLite.
//!
//! All writes go through `apply_batch`, which commits a whole change set plus
//! an optional sync-run record in one transaction. Reads never see a
//! partially committed batch. Tombstoned rows are excluded from default
//! queries but retained (and retrievable) for diagnostics.

mod schema;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::{params, params_from_iter, types::Value, Connection, Row};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::error::StorageError;
use crate::model::{
  Cycle, EditField, Entity, EntityKind, Issue, Member, PendingEdit, Priority, Project, RunOutcome,
  SyncRun, Team,
};

/// A cached record plus its tombstone marker, if any.
#[derive(Debug, Clone)]
pub struct CachedEntity {
  pub entity: Entity,
  pub deleted_at: Option<DateTime<Utc>>,
}

impl CachedEntity {
  pub fn is_tombstone(&self) -> bool {
    self.deleted_at.is_some()
  }
}

/// Cached revision metadata the reconciler diffs against.
#[derive(Debug, Clone, Copy)]
pub struct EntityMeta {
  pub updated_at: DateTime<Utc>,
  pub deleted_at: Option<DateTime<Utc>>,
}

/// One write in a batch.
#[derive(Debug, Clone)]
pub enum Change {
  Upsert(Entity),
  Tombstone {
    kind: EntityKind,
    id: String,
    deleted_at: DateTime<Utc>,
  },
  PutPendingEdit(PendingEdit),
  ClearPendingEdit {
    issue_id: String,
    field: EditField,
  },
  PutDangling {
    issue_id: String,
    field: String,
    target_kind: EntityKind,
    target_id: String,
  },
  /// Drop all dangling markers for an issue before re-recording them.
  ClearDangling {
    issue_id: String,
  },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitResult {
  pub inserted: u64,
  pub updated: u64,
  pub deleted: u64,
  /// Id assigned to the appended sync-run record, when one was included.
  pub run_id: Option<i64>,
}

/// One conjunct of an issue predicate. Every clause maps to an indexed
/// column, so constrained queries never full-scan.
#[derive(Debug, Clone, PartialEq)]
pub enum IssueClause {
  Status(String),
  Priority(Priority),
  Assignee(String),
  Project(String),
  Cycle(String),
  Id(String),
}

/// Predicate tree for issue queries: indexed conjuncts plus free-text terms
/// matched against title and description.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IssueFilter {
  pub clauses: Vec<IssueClause>,
  pub text_terms: Vec<String>,
}

impl IssueFilter {
  pub fn is_empty(&self) -> bool {
    self.clauses.is_empty() && self.text_terms.is_empty()
  }

  /// In-memory evaluation, used to re-check rows after the pending-edit
  /// overlay is merged (an edit may change a filtered field).
  pub fn matches(&self, issue: &Issue) -> bool {
    for clause in &self.clauses {
      let ok = match clause {
        IssueClause::Status(v) => issue.status.eq_ignore_ascii_case(v),
        IssueClause::Priority(p) => issue.priority == *p,
        IssueClause::Assignee(v) => issue.assignee_id.as_deref() == Some(v.as_str()),
        IssueClause::Project(v) => issue.project_id.as_deref() == Some(v.as_str()),
        IssueClause::Cycle(v) => issue.cycle_id.as_deref() == Some(v.as_str()),
        IssueClause::Id(v) => {
          issue.id.eq_ignore_ascii_case(v) || issue.identifier.eq_ignore_ascii_case(v)
        }
      };
      if !ok {
        return false;
      }
    }
    for term in &self.text_terms {
      let t = term.to_lowercase();
      let in_title = issue.title.to_lowercase().contains(&t);
      let in_desc = issue
        .description
        .as_deref()
        .map(|d| d.to_lowercase().contains(&t))
        .unwrap_or(false);
      if !in_title && !in_desc {
        return false;
      }
    }
    true
  }
}

/// Result ordering for issue queries. Always ends with the id as a
/// tie-breaker so repeated calls return the same sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IssueOrder {
  /// Priority descending, then updated-time descending.
  #[default]
  PriorityThenUpdated,
  UpdatedDesc,
  CreatedDesc,
}

impl IssueOrder {
  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "priority" => Some(IssueOrder::PriorityThenUpdated),
      "updated" => Some(IssueOrder::UpdatedDesc),
      "created" => Some(IssueOrder::CreatedDesc),
      _ => None,
    }
  }

  fn sql(&self) -> &'static str {
    match self {
      IssueOrder::PriorityThenUpdated => "priority DESC, updated_at DESC, id ASC",
      IssueOrder::UpdatedDesc => "updated_at DESC, id ASC",
      IssueOrder::CreatedDesc => "created_at DESC, id ASC",
    }
  }

  /// The same ordering, for in-memory re-sorts after overlay merge.
  pub fn sort(&self, issues: &mut [Issue]) {
    match self {
      IssueOrder::PriorityThenUpdated => issues.sort_by(|a, b| {
        b.priority
          .cmp(&a.priority)
          .then(b.updated_at.cmp(&a.updated_at))
          .then(a.id.cmp(&b.id))
      }),
      IssueOrder::UpdatedDesc => {
        issues.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)))
      }
      IssueOrder::CreatedDesc => {
        issues.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)))
      }
    }
  }
}

/// SQLite-backed cache store.
pub struct Store {
  conn: Mutex<Connection>,
}

impl Store {
  /// Open or create the cache database at the given path and run migrations.
  pub fn open(path: &Path) -> Result<Self, StorageError> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| StorageError::Io(format!("create cache directory: {}", e)))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| StorageError::Io(format!("open cache database {}: {}", path.display(), e)))?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  fn run_migrations(&self) -> Result<(), StorageError> {
    let conn = self.lock()?;
    conn.execute_batch(schema::SCHEMA)?;
    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
    self
      .conn
      .lock()
      .map_err(|_| StorageError::Io("cache lock poisoned".to_string()))
  }

  /// Get one cached entity by kind and id, tombstones included.
  pub fn get(&self, kind: EntityKind, id: &str) -> Result<Option<CachedEntity>, StorageError> {
    let conn = self.lock()?;
    let sql = format!("SELECT * FROM {} WHERE id = ?", table(kind));
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params![id])?;

    match rows.next()? {
      Some(row) => {
        let deleted_at = parse_opt_ts(row.get::<_, Option<String>>("deleted_at")?)?;
        let entity = row_to_entity(kind, row)?;
        Ok(Some(CachedEntity { entity, deleted_at }))
      }
      None => Ok(None),
    }
  }

  /// List live issues matching the filter, in the requested order.
  pub fn list_issues(
    &self,
    filter: &IssueFilter,
    order: IssueOrder,
    limit: usize,
  ) -> Result<Vec<Issue>, StorageError> {
    let (sql, values) = build_issue_sql(filter, order, limit);
    debug!(sql, "issue query");

    let conn = self.lock()?;
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params_from_iter(values.iter()))?;

    let mut issues = Vec::new();
    while let Some(row) = rows.next()? {
      issues.push(row_to_issue(row)?);
    }
    Ok(issues)
  }

  /// Live issues that carry a pending local edit. The query engine unions
  /// these with filtered rows so an edited field still matches filters.
  pub fn issues_with_pending_edits(&self) -> Result<Vec<Issue>, StorageError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT i.* FROM issues i
       WHERE i.deleted_at IS NULL
         AND i.id IN (SELECT issue_id FROM pending_edits)",
    )?;
    let mut rows = stmt.query([])?;

    let mut issues = Vec::new();
    while let Some(row) = rows.next()? {
      issues.push(row_to_issue(row)?);
    }
    Ok(issues)
  }

  pub fn list_pending_edits(&self) -> Result<Vec<PendingEdit>, StorageError> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT issue_id, field, value, edited_at FROM pending_edits ORDER BY issue_id")?;
    let mut rows = stmt.query([])?;

    let mut edits = Vec::new();
    while let Some(row) = rows.next()? {
      let field_str: String = row.get("field")?;
      let field = EditField::parse(&field_str)
        .ok_or_else(|| StorageError::Integrity(format!("unknown edit field '{}'", field_str)))?;
      edits.push(PendingEdit {
        issue_id: row.get("issue_id")?,
        field,
        value: row.get("value")?,
        edited_at: parse_ts(&row.get::<_, String>("edited_at")?)?,
      });
    }
    Ok(edits)
  }

  /// Commit a batch of changes, plus an optional sync-run record, atomically.
  /// On any failure the transaction rolls back and prior state is unchanged.
  pub fn apply_batch(
    &self,
    changes: &[Change],
    run: Option<&SyncRun>,
  ) -> Result<CommitResult, StorageError> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    let mut result = CommitResult::default();

    for change in changes {
      match change {
        Change::Upsert(entity) => {
          // Only a no-rows result means "insert"; any other probe failure
          // aborts the batch rather than miscounting.
          let exists = match tx.query_row(
            &format!("SELECT 1 FROM {} WHERE id = ?", table(entity.kind())),
            params![entity.id()],
            |_| Ok(()),
          ) {
            Ok(()) => true,
            Err(rusqlite::Error::QueryReturnedNoRows) => false,
            Err(err) => return Err(err.into()),
          };
          upsert_entity(&tx, entity)?;
          if exists {
            result.updated += 1;
          } else {
            result.inserted += 1;
          }
        }
        Change::Tombstone {
          kind,
          id,
          deleted_at,
        } => {
          let n = tx.execute(
            &format!(
              "UPDATE {} SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL",
              table(*kind)
            ),
            params![ts(*deleted_at), id],
          )?;
          result.deleted += n as u64;
        }
        Change::PutPendingEdit(edit) => {
          tx.execute(
            "INSERT OR REPLACE INTO pending_edits (issue_id, field, value, edited_at)
             VALUES (?, ?, ?, ?)",
            params![
              edit.issue_id,
              edit.field.as_str(),
              edit.value,
              ts(edit.edited_at)
            ],
          )?;
        }
        Change::ClearPendingEdit { issue_id, field } => {
          tx.execute(
            "DELETE FROM pending_edits WHERE issue_id = ? AND field = ?",
            params![issue_id, field.as_str()],
          )?;
        }
        Change::PutDangling {
          issue_id,
          field,
          target_kind,
          target_id,
        } => {
          tx.execute(
            "INSERT OR REPLACE INTO dangling_refs (issue_id, field, target_kind, target_id)
             VALUES (?, ?, ?, ?)",
            params![issue_id, field, target_kind.as_str(), target_id],
          )?;
        }
        Change::ClearDangling { issue_id } => {
          tx.execute(
            "DELETE FROM dangling_refs WHERE issue_id = ?",
            params![issue_id],
          )?;
        }
      }
    }

    if let Some(run) = run {
      tx.execute(
        "INSERT INTO sync_runs (started_at, finished_at, outcome, error, counts, diagnostics)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
          ts(run.started_at),
          ts(run.finished_at),
          run.outcome.as_str(),
          run.error,
          serde_json::to_string(&run.counts)?,
          serde_json::to_string(&run.diagnostics)?,
        ],
      )?;
      result.run_id = Some(tx.last_insert_rowid());
    }

    tx.commit()?;
    Ok(result)
  }

  /// Most recent sync runs, newest first.
  pub fn sync_history(&self, limit: usize) -> Result<Vec<SyncRun>, StorageError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT id, started_at, finished_at, outcome, error, counts, diagnostics
       FROM sync_runs ORDER BY id DESC LIMIT ?",
    )?;
    let mut rows = stmt.query(params![limit as i64])?;

    let mut runs = Vec::new();
    while let Some(row) = rows.next()? {
      let outcome_str: String = row.get("outcome")?;
      let outcome = RunOutcome::parse(&outcome_str)
        .ok_or_else(|| StorageError::Integrity(format!("unknown outcome '{}'", outcome_str)))?;
      runs.push(SyncRun {
        id: row.get("id")?,
        started_at: parse_ts(&row.get::<_, String>("started_at")?)?,
        finished_at: parse_ts(&row.get::<_, String>("finished_at")?)?,
        outcome,
        error: row.get("error")?,
        counts: serde_json::from_str(&row.get::<_, String>("counts")?)?,
        diagnostics: serde_json::from_str(&row.get::<_, String>("diagnostics")?)?,
      });
    }
    Ok(runs)
  }

  /// Revision metadata for every row of a kind, tombstones included.
  pub fn entity_meta(
    &self,
    kind: EntityKind,
  ) -> Result<HashMap<String, EntityMeta>, StorageError> {
    let conn = self.lock()?;
    let mut stmt =
      conn.prepare(&format!("SELECT id, updated_at, deleted_at FROM {}", table(kind)))?;
    let mut rows = stmt.query([])?;

    let mut meta = HashMap::new();
    while let Some(row) = rows.next()? {
      let id: String = row.get("id")?;
      meta.insert(
        id,
        EntityMeta {
          updated_at: parse_ts(&row.get::<_, String>("updated_at")?)?,
          deleted_at: parse_opt_ts(row.get::<_, Option<String>>("deleted_at")?)?,
        },
      );
    }
    Ok(meta)
  }

  /// Drop dangling markers whose target of the given kind is now cached.
  /// Returns the number of references resolved.
  pub fn resolve_dangling(&self, kind: EntityKind) -> Result<usize, StorageError> {
    let conn = self.lock()?;
    let n = conn.execute(
      &format!(
        "DELETE FROM dangling_refs
         WHERE target_kind = ?
           AND target_id IN (SELECT id FROM {} WHERE deleted_at IS NULL)",
        table(kind)
      ),
      params![kind.as_str()],
    )?;
    Ok(n)
  }

  /// Unresolved references, for diagnostics.
  pub fn list_dangling(&self) -> Result<Vec<(String, String, String)>, StorageError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT issue_id, field, target_id FROM dangling_refs ORDER BY issue_id, field",
    )?;
    let mut rows = stmt.query([])?;

    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
      out.push((row.get(0)?, row.get(1)?, row.get(2)?));
    }
    Ok(out)
  }

  /// Delete tombstones older than the retention window. 0 days disables.
  pub fn purge_tombstones(&self, retention_days: u32) -> Result<usize, StorageError> {
    if retention_days == 0 {
      return Ok(0);
    }
    let cutoff = ts(Utc::now() - Duration::days(retention_days as i64));
    let conn = self.lock()?;
    let mut purged = 0;
    for kind in EntityKind::SYNC_ORDER {
      purged += conn.execute(
        &format!(
          "DELETE FROM {} WHERE deleted_at IS NOT NULL AND deleted_at < ?",
          table(kind)
        ),
        params![cutoff],
      )?;
    }
    Ok(purged)
  }

  /// Every live issue, for aggregate recomputation.
  pub fn live_issues(&self) -> Result<Vec<Issue>, StorageError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT * FROM issues WHERE deleted_at IS NULL ORDER BY id")?;
    let mut rows = stmt.query([])?;

    let mut issues = Vec::new();
    while let Some(row) = rows.next()? {
      issues.push(row_to_issue(row)?);
    }
    Ok(issues)
  }

  /// All live members, for assignee-name resolution.
  pub fn members(&self) -> Result<Vec<Member>, StorageError> {
    let conn = self.lock()?;
    let mut stmt =
      conn.prepare("SELECT * FROM members WHERE deleted_at IS NULL ORDER BY name, id")?;
    let mut rows = stmt.query([])?;

    let mut members = Vec::new();
    while let Some(row) = rows.next()? {
      members.push(row_to_member(row)?);
    }
    Ok(members)
  }

  /// All live projects.
  pub fn projects(&self) -> Result<Vec<Project>, StorageError> {
    let conn = self.lock()?;
    let mut stmt =
      conn.prepare("SELECT * FROM projects WHERE deleted_at IS NULL ORDER BY name, id")?;
    let mut rows = stmt.query([])?;

    let mut projects = Vec::new();
    while let Some(row) = rows.next()? {
      projects.push(row_to_project(row)?);
    }
    Ok(projects)
  }
}

/// Build the issue query. Clause comparisons rely on the schema's column
/// collations (id/identifier/status are NOCASE) so every constrained field
/// stays an index search, never a scan.
fn build_issue_sql(filter: &IssueFilter, order: IssueOrder, limit: usize) -> (String, Vec<Value>) {
  let mut sql = String::from("SELECT * FROM issues WHERE deleted_at IS NULL");
  let mut values: Vec<Value> = Vec::new();

  for clause in &filter.clauses {
    match clause {
      IssueClause::Status(v) => {
        sql.push_str(" AND status = ?");
        values.push(Value::from(v.clone()));
      }
      IssueClause::Priority(p) => {
        sql.push_str(" AND priority = ?");
        values.push(Value::from(p.rank()));
      }
      IssueClause::Assignee(v) => {
        sql.push_str(" AND assignee_id = ?");
        values.push(Value::from(v.clone()));
      }
      IssueClause::Project(v) => {
        sql.push_str(" AND project_id = ?");
        values.push(Value::from(v.clone()));
      }
      IssueClause::Cycle(v) => {
        sql.push_str(" AND cycle_id = ?");
        values.push(Value::from(v.clone()));
      }
      IssueClause::Id(v) => {
        sql.push_str(" AND (id = ? OR identifier = ?)");
        values.push(Value::from(v.clone()));
        values.push(Value::from(v.clone()));
      }
    }
  }

  for term in &filter.text_terms {
    sql.push_str(" AND (title LIKE '%' || ? || '%' OR COALESCE(description, '') LIKE '%' || ? || '%')");
    values.push(Value::from(term.clone()));
    values.push(Value::from(term.clone()));
  }

  sql.push_str(&format!(" ORDER BY {} LIMIT {}", order.sql(), limit));
  (sql, values)
}

fn table(kind: EntityKind) -> &'static str {
  match kind {
    EntityKind::Team => "teams",
    EntityKind::Member => "members",
    EntityKind::Project => "projects",
    EntityKind::Cycle => "cycles",
    EntityKind::Issue => "issues",
  }
}

fn upsert_entity(conn: &Connection, entity: &Entity) -> Result<(), StorageError> {
  match entity {
    Entity::Team(t) => {
      conn.execute(
        "INSERT OR REPLACE INTO teams (id, key, name, updated_at, deleted_at)
         VALUES (?, ?, ?, ?, NULL)",
        params![t.id, t.key, t.name, ts(t.updated_at)],
      )?;
    }
    Entity::Member(m) => {
      conn.execute(
        "INSERT OR REPLACE INTO members (id, name, capacity, team_id, updated_at, deleted_at)
         VALUES (?, ?, ?, ?, ?, NULL)",
        params![m.id, m.name, m.capacity, m.team_id, ts(m.updated_at)],
      )?;
    }
    Entity::Project(p) => {
      conn.execute(
        "INSERT OR REPLACE INTO projects
           (id, name, status, target_date, team_id, issues_count, in_progress_count,
            blocked_count, updated_at, deleted_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)",
        params![
          p.id,
          p.name,
          p.status,
          p.target_date.map(date),
          p.team_id,
          p.issues_count,
          p.in_progress_count,
          p.blocked_count,
          ts(p.updated_at),
        ],
      )?;
    }
    Entity::Cycle(c) => {
      conn.execute(
        "INSERT OR REPLACE INTO cycles (id, name, starts_at, ends_at, team_id, updated_at, deleted_at)
         VALUES (?, ?, ?, ?, ?, ?, NULL)",
        params![
          c.id,
          c.name,
          date(c.starts_at),
          date(c.ends_at),
          c.team_id,
          ts(c.updated_at)
        ],
      )?;
    }
    Entity::Issue(i) => {
      conn.execute(
        "INSERT OR REPLACE INTO issues
           (id, identifier, title, description, status, priority, estimate, assignee_id,
            project_id, cycle_id, team_id, blocked_by, created_at, updated_at, deleted_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)",
        params![
          i.id,
          i.identifier,
          i.title,
          i.description,
          i.status,
          i.priority.rank(),
          i.estimate,
          i.assignee_id,
          i.project_id,
          i.cycle_id,
          i.team_id,
          serde_json::to_string(&i.blocked_by)?,
          ts(i.created_at),
          ts(i.updated_at),
        ],
      )?;
    }
  }
  Ok(())
}

fn row_to_entity(kind: EntityKind, row: &Row<'_>) -> Result<Entity, StorageError> {
  Ok(match kind {
    EntityKind::Team => Entity::Team(Team {
      id: row.get("id")?,
      key: row.get("key")?,
      name: row.get("name")?,
      updated_at: parse_ts(&row.get::<_, String>("updated_at")?)?,
    }),
    EntityKind::Member => Entity::Member(row_to_member(row)?),
    EntityKind::Project => Entity::Project(row_to_project(row)?),
    EntityKind::Cycle => Entity::Cycle(Cycle {
      id: row.get("id")?,
      name: row.get("name")?,
      starts_at: parse_date(&row.get::<_, String>("starts_at")?)?,
      ends_at: parse_date(&row.get::<_, String>("ends_at")?)?,
      team_id: row.get("team_id")?,
      updated_at: parse_ts(&row.get::<_, String>("updated_at")?)?,
    }),
    EntityKind::Issue => Entity::Issue(row_to_issue(row)?),
  })
}

fn row_to_member(row: &Row<'_>) -> Result<Member, StorageError> {
  Ok(Member {
    id: row.get("id")?,
    name: row.get("name")?,
    capacity: row.get("capacity")?,
    team_id: row.get("team_id")?,
    updated_at: parse_ts(&row.get::<_, String>("updated_at")?)?,
  })
}

fn row_to_project(row: &Row<'_>) -> Result<Project, StorageError> {
  Ok(Project {
    id: row.get("id")?,
    name: row.get("name")?,
    status: row.get("status")?,
    target_date: match row.get::<_, Option<String>>("target_date")? {
      Some(s) => Some(parse_date(&s)?),
      None => None,
    },
    team_id: row.get("team_id")?,
    issues_count: row.get("issues_count")?,
    in_progress_count: row.get("in_progress_count")?,
    blocked_count: row.get("blocked_count")?,
    updated_at: parse_ts(&row.get::<_, String>("updated_at")?)?,
  })
}

fn row_to_issue(row: &Row<'_>) -> Result<Issue, StorageError> {
  Ok(Issue {
    id: row.get("id")?,
    identifier: row.get("identifier")?,
    title: row.get("title")?,
    description: row.get("description")?,
    status: row.get("status")?,
    priority: Priority::from_rank(row.get("priority")?),
    estimate: row.get("estimate")?,
    assignee_id: row.get("assignee_id")?,
    project_id: row.get("project_id")?,
    cycle_id: row.get("cycle_id")?,
    team_id: row.get("team_id")?,
    blocked_by: serde_json::from_str(&row.get::<_, String>("blocked_by")?)?,
    created_at: parse_ts(&row.get::<_, String>("created_at")?)?,
    updated_at: parse_ts(&row.get::<_, String>("updated_at")?)?,
  })
}

fn ts(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339()
}

fn date(d: NaiveDate) -> String {
  d.format("%Y-%m-%d").to_string()
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StorageError> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| StorageError::Integrity(format!("bad timestamp '{}': {}", s, e)))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>, StorageError> {
  s.map(|s| parse_ts(&s)).transpose()
}

fn parse_date(s: &str) -> Result<NaiveDate, StorageError> {
  NaiveDate::parse_from_str(s, "%Y-%m-%d")
    .map_err(|e| StorageError::Integrity(format!("bad date '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  fn test_store() -> (Store, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&dir.path().join("cache.db")).unwrap();
    (store, dir)
  }

  fn when(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
  }

  fn issue(id: &str, status: &str, priority: Priority) -> Issue {
    Issue {
      id: id.to_string(),
      identifier: format!("ENG-{}", id),
      title: format!("Issue {}", id),
      description: None,
      status: status.to_string(),
      priority,
      estimate: 3,
      assignee_id: None,
      project_id: None,
      cycle_id: None,
      team_id: None,
      blocked_by: Vec::new(),
      created_at: when(0),
      updated_at: when(0),
    }
  }

  fn run_record(outcome: RunOutcome) -> SyncRun {
    SyncRun {
      id: 0,
      started_at: when(0),
      finished_at: when(1),
      outcome,
      error: None,
      counts: Default::default(),
      diagnostics: Default::default(),
    }
  }

  #[test]
  fn upsert_then_get_roundtrip() {
    let (store, _dir) = test_store();
    let i = issue("1", "Todo", Priority::High);
    let result = store
      .apply_batch(&[Change::Upsert(Entity::Issue(i.clone()))], None)
      .unwrap();
    assert_eq!(result.inserted, 1);
    assert_eq!(result.updated, 0);

    let cached = store.get(EntityKind::Issue, "1").unwrap().unwrap();
    assert!(!cached.is_tombstone());
    assert_eq!(cached.entity, Entity::Issue(i.clone()));

    // Second upsert counts as an update
    let result = store
      .apply_batch(&[Change::Upsert(Entity::Issue(i))], None)
      .unwrap();
    assert_eq!(result.inserted, 0);
    assert_eq!(result.updated, 1);
  }

  #[test]
  fn failed_batch_leaves_prior_state_untouched() {
    let (store, _dir) = test_store();
    store
      .apply_batch(&[Change::Upsert(Entity::Issue(issue("1", "Todo", Priority::Low)))], None)
      .unwrap();

    // Second change in the batch violates the estimate CHECK constraint
    let mut bad = issue("3", "Todo", Priority::Low);
    bad.estimate = -1;
    let batch = vec![
      Change::Upsert(Entity::Issue(issue("2", "Todo", Priority::Low))),
      Change::Upsert(Entity::Issue(bad)),
    ];
    let err = store
      .apply_batch(&batch, Some(&run_record(RunOutcome::Success)))
      .unwrap_err();
    assert!(matches!(err, StorageError::Integrity(_)));

    // Neither the earlier upsert nor the run record is visible
    assert!(store.get(EntityKind::Issue, "2").unwrap().is_none());
    assert!(store.sync_history(10).unwrap().is_empty());
    assert!(store.get(EntityKind::Issue, "1").unwrap().is_some());
  }

  #[test]
  fn tombstones_hidden_from_queries_but_retrievable() {
    let (store, _dir) = test_store();
    store
      .apply_batch(&[Change::Upsert(Entity::Issue(issue("1", "Todo", Priority::Low)))], None)
      .unwrap();
    store
      .apply_batch(
        &[Change::Tombstone {
          kind: EntityKind::Issue,
          id: "1".to_string(),
          deleted_at: when(10),
        }],
        None,
      )
      .unwrap();

    let listed = store
      .list_issues(&IssueFilter::default(), IssueOrder::default(), 100)
      .unwrap();
    assert!(listed.is_empty());

    let cached = store.get(EntityKind::Issue, "1").unwrap().unwrap();
    assert!(cached.is_tombstone());
    assert_eq!(cached.deleted_at, Some(when(10)));
  }

  #[test]
  fn purge_respects_retention() {
    let (store, _dir) = test_store();
    store
      .apply_batch(&[Change::Upsert(Entity::Issue(issue("1", "Todo", Priority::Low)))], None)
      .unwrap();
    store
      .apply_batch(
        &[Change::Tombstone {
          kind: EntityKind::Issue,
          id: "1".to_string(),
          deleted_at: Utc::now() - Duration::days(60),
        }],
        None,
      )
      .unwrap();

    assert_eq!(store.purge_tombstones(0).unwrap(), 0);
    assert_eq!(store.purge_tombstones(90).unwrap(), 0);
    assert_eq!(store.purge_tombstones(30).unwrap(), 1);
    assert!(store.get(EntityKind::Issue, "1").unwrap().is_none());
  }

  #[test]
  fn filtered_list_is_ordered_and_stable() {
    let (store, _dir) = test_store();
    let mut a = issue("a", "Todo", Priority::High);
    a.updated_at = when(5);
    let mut b = issue("b", "Todo", Priority::Urgent);
    b.updated_at = when(1);
    let mut c = issue("c", "Todo", Priority::High);
    c.updated_at = when(9);
    let d = issue("d", "Done", Priority::Urgent);
    let batch: Vec<Change> = [a, b, c, d]
      .into_iter()
      .map(|i| Change::Upsert(Entity::Issue(i)))
      .collect();
    store.apply_batch(&batch, None).unwrap();

    let filter = IssueFilter {
      clauses: vec![IssueClause::Status("todo".to_string())],
      text_terms: Vec::new(),
    };
    let first = store.list_issues(&filter, IssueOrder::default(), 100).unwrap();
    let ids: Vec<&str> = first.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, vec!["b", "c", "a"]);

    let second = store.list_issues(&filter, IssueOrder::default(), 100).unwrap();
    assert_eq!(first, second);
  }

  fn query_plan(store: &Store, filter: &IssueFilter) -> Vec<String> {
    let (sql, values) = build_issue_sql(filter, IssueOrder::default(), 100);
    let conn = store.lock().unwrap();
    let mut stmt = conn.prepare(&format!("EXPLAIN QUERY PLAN {}", sql)).unwrap();
    let rows = stmt
      .query_map(params_from_iter(values.iter()), |row| row.get::<_, String>(3))
      .unwrap();
    rows.collect::<Result<_, _>>().unwrap()
  }

  #[test]
  fn constrained_clauses_search_indexes_not_scan() {
    let (store, _dir) = test_store();
    store
      .apply_batch(&[Change::Upsert(Entity::Issue(issue("1", "Todo", Priority::Low)))], None)
      .unwrap();

    let status = IssueFilter {
      clauses: vec![IssueClause::Status("todo".to_string())],
      text_terms: Vec::new(),
    };
    let plan = query_plan(&store, &status);
    assert!(
      plan.iter().any(|step| step.contains("idx_issues_status")),
      "status plan: {:?}",
      plan
    );
    assert!(
      plan.iter().all(|step| !step.contains("SCAN issues")),
      "status plan: {:?}",
      plan
    );

    let id = IssueFilter {
      clauses: vec![IssueClause::Id("eng-1".to_string())],
      text_terms: Vec::new(),
    };
    let plan = query_plan(&store, &id);
    assert!(
      plan.iter().all(|step| !step.contains("SCAN issues")),
      "id plan: {:?}",
      plan
    );

    let assignee = IssueFilter {
      clauses: vec![IssueClause::Assignee("m1".to_string())],
      text_terms: Vec::new(),
    };
    let plan = query_plan(&store, &assignee);
    assert!(
      plan.iter().any(|step| step.contains("idx_issues_assignee")),
      "assignee plan: {:?}",
      plan
    );
  }

  #[test]
  fn id_clause_matches_identifier_too() {
    let (store, _dir) = test_store();
    store
      .apply_batch(&[Change::Upsert(Entity::Issue(issue("1", "Todo", Priority::Low)))], None)
      .unwrap();

    let filter = IssueFilter {
      clauses: vec![IssueClause::Id("eng-1".to_string())],
      text_terms: Vec::new(),
    };
    let found = store.list_issues(&filter, IssueOrder::default(), 10).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, "1");
  }

  #[test]
  fn sync_runs_append_newest_first() {
    let (store, _dir) = test_store();
    let r1 = store.apply_batch(&[], Some(&run_record(RunOutcome::Success))).unwrap();
    let r2 = store.apply_batch(&[], Some(&run_record(RunOutcome::Partial))).unwrap();
    assert!(r2.run_id.unwrap() > r1.run_id.unwrap());

    let history = store.sync_history(10).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].outcome, RunOutcome::Partial);
    assert_eq!(history[1].outcome, RunOutcome::Success);

    let latest = store.sync_history(1).unwrap();
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].outcome, RunOutcome::Partial);
  }

  #[test]
  fn pending_edits_roundtrip_and_join() {
    let (store, _dir) = test_store();
    store
      .apply_batch(&[Change::Upsert(Entity::Issue(issue("1", "Todo", Priority::Low)))], None)
      .unwrap();
    store
      .apply_batch(
        &[Change::PutPendingEdit(PendingEdit {
          issue_id: "1".to_string(),
          field: EditField::Status,
          value: Some("Done".to_string()),
          edited_at: when(3),
        })],
        None,
      )
      .unwrap();

    let edits = store.list_pending_edits().unwrap();
    assert_eq!(edits.len(), 1);
    assert_eq!(edits[0].value.as_deref(), Some("Done"));

    let overlaid = store.issues_with_pending_edits().unwrap();
    assert_eq!(overlaid.len(), 1);
    assert_eq!(overlaid[0].id, "1");

    store
      .apply_batch(
        &[Change::ClearPendingEdit {
          issue_id: "1".to_string(),
          field: EditField::Status,
        }],
        None,
      )
      .unwrap();
    assert!(store.list_pending_edits().unwrap().is_empty());
  }

  #[test]
  fn dangling_refs_resolve_when_target_arrives() {
    let (store, _dir) = test_store();
    store
      .apply_batch(
        &[Change::PutDangling {
          issue_id: "1".to_string(),
          field: "project".to_string(),
          target_kind: EntityKind::Project,
          target_id: "p1".to_string(),
        }],
        None,
      )
      .unwrap();
    assert_eq!(store.list_dangling().unwrap().len(), 1);

    // Target not cached yet: nothing to resolve
    assert_eq!(store.resolve_dangling(EntityKind::Project).unwrap(), 0);

    let project = Project {
      id: "p1".to_string(),
      name: "Apollo".to_string(),
      status: "Active".to_string(),
      target_date: None,
      team_id: None,
      issues_count: 0,
      in_progress_count: 0,
      blocked_count: 0,
      updated_at: when(0),
    };
    store
      .apply_batch(&[Change::Upsert(Entity::Project(project))], None)
      .unwrap();
    assert_eq!(store.resolve_dangling(EntityKind::Project).unwrap(), 1);
    assert!(store.list_dangling().unwrap().is_empty());
  }

  #[test]
  fn filter_matches_mirrors_sql_semantics() {
    let mut i = issue("1", "In Progress", Priority::High);
    i.assignee_id = Some("m1".to_string());
    i.description = Some("Fix the login flow".to_string());

    let filter = IssueFilter {
      clauses: vec![
        IssueClause::Status("in progress".to_string()),
        IssueClause::Assignee("m1".to_string()),
      ],
      text_terms: vec!["login".to_string()],
    };
    assert!(filter.matches(&i));

    let miss = IssueFilter {
      clauses: vec![IssueClause::Status("Done".to_string())],
      text_terms: Vec::new(),
    };
    assert!(!miss.matches(&i));
  }
}
