//! Cached entity types mirroring the remote workspace.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The entity types the cache mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
  Team,
  Member,
  Project,
  Cycle,
  Issue,
}

impl EntityKind {
  /// Sync order. Issues reference everything else, so they go last and the
  /// reconciler has maximal information for reference checks.
  pub const SYNC_ORDER: [EntityKind; 5] = [
    EntityKind::Team,
    EntityKind::Member,
    EntityKind::Project,
    EntityKind::Cycle,
    EntityKind::Issue,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      EntityKind::Team => "team",
      EntityKind::Member => "member",
      EntityKind::Project => "project",
      EntityKind::Cycle => "cycle",
      EntityKind::Issue => "issue",
    }
  }

  /// Short letter used in run summaries (e.g. "success t:4 m:7 p:3 c:2 i:41").
  pub fn short(&self) -> char {
    match self {
      EntityKind::Team => 't',
      EntityKind::Member => 'm',
      EntityKind::Project => 'p',
      EntityKind::Cycle => 'c',
      EntityKind::Issue => 'i',
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "team" => Some(EntityKind::Team),
      "member" => Some(EntityKind::Member),
      "project" => Some(EntityKind::Project),
      "cycle" => Some(EntityKind::Cycle),
      "issue" => Some(EntityKind::Issue),
      _ => None,
    }
  }
}

impl std::fmt::Display for EntityKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Issue priority, ordered so that comparisons sort urgent work first.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
  #[default]
  None,
  Low,
  Medium,
  High,
  Urgent,
}

impl Priority {
  pub fn as_str(&self) -> &'static str {
    match self {
      Priority::None => "none",
      Priority::Low => "low",
      Priority::Medium => "medium",
      Priority::High => "high",
      Priority::Urgent => "urgent",
    }
  }

  /// Parse a priority name, case-insensitive. Returns None for unknown names.
  pub fn parse(s: &str) -> Option<Self> {
    match s.to_lowercase().as_str() {
      "none" | "no priority" => Some(Priority::None),
      "low" => Some(Priority::Low),
      "medium" => Some(Priority::Medium),
      "high" => Some(Priority::High),
      "urgent" => Some(Priority::Urgent),
      _ => None,
    }
  }

  /// Map the remote's numeric priority (0 = none, 1 = urgent .. 4 = low).
  pub fn from_remote(n: i64) -> Self {
    match n {
      1 => Priority::Urgent,
      2 => Priority::High,
      3 => Priority::Medium,
      4 => Priority::Low,
      _ => Priority::None,
    }
  }

  /// Numeric rank for SQL ordering, higher is more urgent.
  pub fn rank(&self) -> i64 {
    *self as i64
  }

  pub fn from_rank(n: i64) -> Self {
    match n {
      1 => Priority::Low,
      2 => Priority::Medium,
      3 => Priority::High,
      4 => Priority::Urgent,
      _ => Priority::None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Team {
  pub id: String,
  pub key: String,
  pub name: String,
  pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
  pub id: String,
  pub name: String,
  /// Sprint capacity in points.
  pub capacity: i64,
  pub team_id: Option<String>,
  pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
  pub id: String,
  pub name: String,
  pub status: String,
  pub target_date: Option<NaiveDate>,
  pub team_id: Option<String>,
  /// Aggregates recomputed from the issue set during reconciliation.
  pub issues_count: i64,
  pub in_progress_count: i64,
  pub blocked_count: i64,
  pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cycle {
  pub id: String,
  pub name: String,
  pub starts_at: NaiveDate,
  pub ends_at: NaiveDate,
  pub team_id: Option<String>,
  pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
  /// Stable remote id, unique across the cache.
  pub id: String,
  /// Human-readable key, e.g. "ENG-245".
  pub identifier: String,
  pub title: String,
  pub description: Option<String>,
  pub status: String,
  pub priority: Priority,
  pub estimate: i64,
  pub assignee_id: Option<String>,
  pub project_id: Option<String>,
  pub cycle_id: Option<String>,
  pub team_id: Option<String>,
  /// Ids of issues blocking this one.
  pub blocked_by: Vec<String>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

/// One cached record of any kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Entity {
  Team(Team),
  Member(Member),
  Project(Project),
  Cycle(Cycle),
  Issue(Issue),
}

impl Entity {
  pub fn kind(&self) -> EntityKind {
    match self {
      Entity::Team(_) => EntityKind::Team,
      Entity::Member(_) => EntityKind::Member,
      Entity::Project(_) => EntityKind::Project,
      Entity::Cycle(_) => EntityKind::Cycle,
      Entity::Issue(_) => EntityKind::Issue,
    }
  }

  pub fn id(&self) -> &str {
    match self {
      Entity::Team(t) => &t.id,
      Entity::Member(m) => &m.id,
      Entity::Project(p) => &p.id,
      Entity::Cycle(c) => &c.id,
      Entity::Issue(i) => &i.id,
    }
  }

  pub fn updated_at(&self) -> DateTime<Utc> {
    match self {
      Entity::Team(t) => t.updated_at,
      Entity::Member(m) => m.updated_at,
      Entity::Project(p) => p.updated_at,
      Entity::Cycle(c) => c.updated_at,
      Entity::Issue(i) => i.updated_at,
    }
  }
}

/// Issue field a local edit may touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditField {
  Status,
  Assignee,
  Estimate,
}

impl EditField {
  pub fn as_str(&self) -> &'static str {
    match self {
      EditField::Status => "status",
      EditField::Assignee => "assignee",
      EditField::Estimate => "estimate",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "status" => Some(EditField::Status),
      "assignee" => Some(EditField::Assignee),
      "estimate" => Some(EditField::Estimate),
      _ => None,
    }
  }
}

/// An optimistic local edit, kept as an overlay until the reconciler resolves
/// it against remote state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEdit {
  pub issue_id: String,
  pub field: EditField,
  /// New value as text; None clears the field (e.g. unassign).
  pub value: Option<String>,
  pub edited_at: DateTime<Utc>,
}

/// Outcome of one sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
  Success,
  Partial,
  Failed,
}

impl RunOutcome {
  pub fn as_str(&self) -> &'static str {
    match self {
      RunOutcome::Success => "success",
      RunOutcome::Partial => "partial",
      RunOutcome::Failed => "failed",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "success" => Some(RunOutcome::Success),
      "partial" => Some(RunOutcome::Partial),
      "failed" => Some(RunOutcome::Failed),
      _ => None,
    }
  }
}

/// Per-entity-type accounting for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeCounts {
  pub fetched: u64,
  pub inserted: u64,
  pub updated: u64,
  pub deleted: u64,
  /// Local edits discarded because remote won the timestamp compare.
  pub conflicts: u64,
  pub failed: bool,
}

/// Append-only record of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
  /// Monotonic id assigned by the store on append.
  pub id: i64,
  pub started_at: DateTime<Utc>,
  pub finished_at: DateTime<Utc>,
  pub outcome: RunOutcome,
  pub error: Option<String>,
  /// Keyed by `EntityKind::as_str`.
  pub counts: BTreeMap<String, TypeCounts>,
  /// Per-step diagnostic lines, e.g. "issue" -> "ok: 41".
  pub diagnostics: BTreeMap<String, String>,
}

impl SyncRun {
  /// One-line summary, e.g. "success t:4 m:7 p:3 c:2 i:41".
  pub fn summary(&self) -> String {
    match self.outcome {
      RunOutcome::Success | RunOutcome::Partial => {
        let mut parts = vec![self.outcome.as_str().to_string()];
        for kind in EntityKind::SYNC_ORDER {
          if let Some(counts) = self.counts.get(kind.as_str()) {
            if counts.failed {
              parts.push(format!("{}:!", kind.short()));
            } else {
              parts.push(format!("{}:{}", kind.short(), counts.fetched));
            }
          }
        }
        parts.join(" ")
      }
      RunOutcome::Failed => match &self.error {
        Some(err) => format!("failed: {}", err),
        None => "failed".to_string(),
      },
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn priority_orders_urgent_first() {
    assert!(Priority::Urgent > Priority::High);
    assert!(Priority::High > Priority::Medium);
    assert!(Priority::Medium > Priority::Low);
    assert!(Priority::Low > Priority::None);
  }

  #[test]
  fn priority_remote_mapping() {
    assert_eq!(Priority::from_remote(0), Priority::None);
    assert_eq!(Priority::from_remote(1), Priority::Urgent);
    assert_eq!(Priority::from_remote(4), Priority::Low);
    assert_eq!(Priority::from_remote(99), Priority::None);
  }

  #[test]
  fn run_summary_counts_in_sync_order() {
    let mut counts = BTreeMap::new();
    counts.insert("team".to_string(), TypeCounts { fetched: 4, ..Default::default() });
    counts.insert("issue".to_string(), TypeCounts { fetched: 41, ..Default::default() });
    let run = SyncRun {
      id: 1,
      started_at: Utc::now(),
      finished_at: Utc::now(),
      outcome: RunOutcome::Success,
      error: None,
      counts,
      diagnostics: BTreeMap::new(),
    };
    assert_eq!(run.summary(), "success t:4 i:41");
  }

  #[test]
  fn run_summary_failed_carries_error() {
    let run = SyncRun {
      id: 1,
      started_at: Utc::now(),
      finished_at: Utc::now(),
      outcome: RunOutcome::Failed,
      error: Some("auth failed".to_string()),
      counts: BTreeMap::new(),
      diagnostics: BTreeMap::new(),
    };
    assert_eq!(run.summary(), "failed: auth failed");
  }
}
