//! Diffs a fetched remote snapshot against cached state.
//!
//! Pure logic: input is the fetched entities plus cached revision metadata,
//! output is the minimal change set that makes the cache consistent with the
//! snapshot. The store applies the change set atomically.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::config::ConflictPolicy;
use crate::model::{Entity, EntityKind, Issue, PendingEdit, Project, TypeCounts};
use crate::store::{Change, EntityMeta};

/// Whether the fetched snapshot covers the whole entity type. Only full
/// snapshots may tombstone: in an incremental snapshot, absence is not
/// deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotMode {
  Full,
  Incremental,
}

/// Live ids of already-reconciled types, used to detect dangling issue
/// references.
#[derive(Debug, Default)]
pub struct ReferenceIndex {
  pub members: HashSet<String>,
  pub projects: HashSet<String>,
  pub cycles: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct Diff {
  pub changes: Vec<Change>,
  pub counts: TypeCounts,
}

pub fn reconcile(
  kind: EntityKind,
  fetched: Vec<Entity>,
  cached: &HashMap<String, EntityMeta>,
  pending: &[PendingEdit],
  refs: &ReferenceIndex,
  mode: SnapshotMode,
  policy: ConflictPolicy,
  now: DateTime<Utc>,
) -> Diff {
  let mut diff = Diff::default();
  let mut seen: HashSet<String> = HashSet::new();

  let mut pending_by_issue: HashMap<&str, Vec<&PendingEdit>> = HashMap::new();
  for edit in pending {
    pending_by_issue.entry(edit.issue_id.as_str()).or_default().push(edit);
  }

  for entity in fetched {
    // Restartable pagination can repeat a row across pages; first one wins.
    if !seen.insert(entity.id().to_string()) {
      continue;
    }
    diff.counts.fetched += 1;

    let id = entity.id().to_string();
    let remote_rev = entity.updated_at();

    match cached.get(&id) {
      None => {
        record_issue_refs(&entity, refs, &mut diff.changes);
        diff.changes.push(Change::Upsert(entity));
        diff.counts.inserted += 1;
      }
      Some(meta) if meta.deleted_at.is_some() => {
        // Remote still has it: the tombstone was premature, resurrect.
        record_issue_refs(&entity, refs, &mut diff.changes);
        diff.changes.push(Change::Upsert(entity));
        diff.counts.updated += 1;
      }
      Some(meta) if remote_rev > meta.updated_at => {
        resolve_pending(kind, &id, remote_rev, &pending_by_issue, policy, &mut diff);
        record_issue_refs(&entity, refs, &mut diff.changes);
        diff.changes.push(Change::Upsert(entity));
        diff.counts.updated += 1;
      }
      Some(_) => {
        // Cached copy is current (or newer); nothing to apply. Pending
        // edits stay in the overlay until a newer remote revision lands.
      }
    }
  }

  if mode == SnapshotMode::Full {
    for (id, meta) in cached {
      if meta.deleted_at.is_none() && !seen.contains(id) {
        diff.changes.push(Change::Tombstone {
          kind,
          id: id.clone(),
          deleted_at: now,
        });
        diff.counts.deleted += 1;

        // Edits on a deleted issue have nothing left to apply to
        for edit in pending_by_issue.get(id.as_str()).into_iter().flatten() {
          diff.changes.push(Change::ClearPendingEdit {
            issue_id: id.clone(),
            field: edit.field,
          });
        }
      }
    }
  }

  debug!(
    kind = %kind,
    fetched = diff.counts.fetched,
    inserted = diff.counts.inserted,
    updated = diff.counts.updated,
    deleted = diff.counts.deleted,
    conflicts = diff.counts.conflicts,
    "reconciled snapshot"
  );
  diff
}

/// Apply the conflict policy for an issue whose remote revision is newer
/// than the cached one while local edits are pending.
fn resolve_pending(
  kind: EntityKind,
  id: &str,
  remote_rev: DateTime<Utc>,
  pending_by_issue: &HashMap<&str, Vec<&PendingEdit>>,
  policy: ConflictPolicy,
  diff: &mut Diff,
) {
  if kind != EntityKind::Issue {
    return;
  }
  for edit in pending_by_issue.get(id).into_iter().flatten() {
    if edit.edited_at > remote_rev {
      // Local edit is newer than the remote revision: not a conflict yet
      continue;
    }
    diff.counts.conflicts += 1;
    if policy == ConflictPolicy::RemoteWins {
      diff.changes.push(Change::ClearPendingEdit {
        issue_id: id.to_string(),
        field: edit.field,
      });
    }
  }
}

/// For issue upserts, re-record which references do not resolve yet.
fn record_issue_refs(entity: &Entity, refs: &ReferenceIndex, changes: &mut Vec<Change>) {
  let Entity::Issue(issue) = entity else {
    return;
  };

  changes.push(Change::ClearDangling {
    issue_id: issue.id.clone(),
  });

  let targets = [
    ("project", EntityKind::Project, &issue.project_id, &refs.projects),
    ("cycle", EntityKind::Cycle, &issue.cycle_id, &refs.cycles),
    ("assignee", EntityKind::Member, &issue.assignee_id, &refs.members),
  ];
  for (field, target_kind, target_id, known) in targets {
    if let Some(target_id) = target_id {
      if !known.contains(target_id) {
        changes.push(Change::PutDangling {
          issue_id: issue.id.clone(),
          field: field.to_string(),
          target_kind,
          target_id: target_id.clone(),
        });
      }
    }
  }
}

/// Recompute per-project aggregates from the live issue set. Emits an upsert
/// only when the numbers actually changed, so an unchanged workspace
/// reconciles to an empty change set.
pub fn project_aggregates(
  projects: &[Project],
  issues: &[Issue],
  active_statuses: &[String],
) -> Vec<Change> {
  let mut by_project: HashMap<&str, (i64, i64, i64)> = HashMap::new();
  for issue in issues {
    let Some(project_id) = issue.project_id.as_deref() else {
      continue;
    };
    let entry = by_project.entry(project_id).or_default();
    entry.0 += 1;
    if active_statuses.iter().any(|s| s.eq_ignore_ascii_case(&issue.status)) {
      entry.1 += 1;
    }
    if !issue.blocked_by.is_empty() || issue.status.to_lowercase().contains("blocked") {
      entry.2 += 1;
    }
  }

  let mut changes = Vec::new();
  for project in projects {
    let (issues_count, in_progress_count, blocked_count) =
      by_project.get(project.id.as_str()).copied().unwrap_or_default();
    if (project.issues_count, project.in_progress_count, project.blocked_count)
      != (issues_count, in_progress_count, blocked_count)
    {
      let mut updated = project.clone();
      updated.issues_count = issues_count;
      updated.in_progress_count = in_progress_count;
      updated.blocked_count = blocked_count;
      changes.push(Change::Upsert(Entity::Project(updated)));
    }
  }
  changes
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::{EditField, Priority};
  use chrono::TimeZone;

  fn when(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
  }

  fn issue(id: &str, updated: DateTime<Utc>) -> Entity {
    Entity::Issue(Issue {
      id: id.to_string(),
      identifier: format!("ENG-{}", id),
      title: format!("Issue {}", id),
      description: None,
      status: "Todo".to_string(),
      priority: Priority::Medium,
      estimate: 2,
      assignee_id: None,
      project_id: None,
      cycle_id: None,
      team_id: None,
      blocked_by: Vec::new(),
      created_at: when(0),
      updated_at: updated,
    })
  }

  fn meta(updated: DateTime<Utc>) -> EntityMeta {
    EntityMeta {
      updated_at: updated,
      deleted_at: None,
    }
  }

  fn reconcile_issues(
    fetched: Vec<Entity>,
    cached: &HashMap<String, EntityMeta>,
    pending: &[PendingEdit],
    mode: SnapshotMode,
    policy: ConflictPolicy,
  ) -> Diff {
    reconcile(
      EntityKind::Issue,
      fetched,
      cached,
      pending,
      &ReferenceIndex::default(),
      mode,
      policy,
      when(100),
    )
  }

  #[test]
  fn inserts_updates_and_skips() {
    let mut cached = HashMap::new();
    cached.insert("stale".to_string(), meta(when(1)));
    cached.insert("current".to_string(), meta(when(5)));

    let fetched = vec![
      issue("new", when(5)),
      issue("stale", when(5)),
      issue("current", when(5)),
    ];
    let diff = reconcile_issues(
      fetched,
      &cached,
      &[],
      SnapshotMode::Incremental,
      ConflictPolicy::RemoteWins,
    );
    assert_eq!(diff.counts.fetched, 3);
    assert_eq!(diff.counts.inserted, 1);
    assert_eq!(diff.counts.updated, 1);
    assert_eq!(diff.counts.deleted, 0);
  }

  #[test]
  fn unchanged_snapshot_reconciles_to_nothing() {
    let mut cached = HashMap::new();
    cached.insert("a".to_string(), meta(when(1)));
    cached.insert("b".to_string(), meta(when(2)));

    let fetched = vec![issue("a", when(1)), issue("b", when(2))];
    let diff = reconcile_issues(
      fetched,
      &cached,
      &[],
      SnapshotMode::Full,
      ConflictPolicy::RemoteWins,
    );
    assert_eq!(diff.counts.inserted, 0);
    assert_eq!(diff.counts.updated, 0);
    assert_eq!(diff.counts.deleted, 0);
    assert!(diff.changes.is_empty());
  }

  #[test]
  fn full_snapshot_tombstones_absentees() {
    let mut cached = HashMap::new();
    cached.insert("kept".to_string(), meta(when(1)));
    cached.insert("gone".to_string(), meta(when(1)));

    let diff = reconcile_issues(
      vec![issue("kept", when(1))],
      &cached,
      &[],
      SnapshotMode::Full,
      ConflictPolicy::RemoteWins,
    );
    assert_eq!(diff.counts.deleted, 1);
    assert!(diff.changes.iter().any(|c| matches!(
      c,
      Change::Tombstone { id, .. } if id == "gone"
    )));
  }

  #[test]
  fn incremental_absence_is_not_deletion() {
    let mut cached = HashMap::new();
    cached.insert("kept".to_string(), meta(when(1)));
    cached.insert("absent".to_string(), meta(when(1)));

    let diff = reconcile_issues(
      vec![issue("kept", when(1))],
      &cached,
      &[],
      SnapshotMode::Incremental,
      ConflictPolicy::RemoteWins,
    );
    assert_eq!(diff.counts.deleted, 0);
  }

  #[test]
  fn tombstoned_entity_still_remote_is_resurrected() {
    let mut cached = HashMap::new();
    cached.insert(
      "back".to_string(),
      EntityMeta {
        updated_at: when(1),
        deleted_at: Some(when(2)),
      },
    );

    let diff = reconcile_issues(
      vec![issue("back", when(1))],
      &cached,
      &[],
      SnapshotMode::Full,
      ConflictPolicy::RemoteWins,
    );
    assert_eq!(diff.counts.updated, 1);
    assert!(diff
      .changes
      .iter()
      .any(|c| matches!(c, Change::Upsert(e) if e.id() == "back")));
  }

  #[test]
  fn remote_wins_clears_pending_edit_and_counts_conflict() {
    let mut cached = HashMap::new();
    cached.insert("i1".to_string(), meta(when(1)));
    let pending = vec![PendingEdit {
      issue_id: "i1".to_string(),
      field: EditField::Status,
      value: Some("Done".to_string()),
      edited_at: when(3),
    }];

    // Remote revision at t=5 is newer than the edit at t=3
    let diff = reconcile_issues(
      vec![issue("i1", when(5))],
      &cached,
      &pending,
      SnapshotMode::Full,
      ConflictPolicy::RemoteWins,
    );
    assert_eq!(diff.counts.conflicts, 1);
    assert!(diff.changes.iter().any(|c| matches!(
      c,
      Change::ClearPendingEdit { issue_id, field }
        if issue_id == "i1" && *field == EditField::Status
    )));
  }

  #[test]
  fn local_wins_keeps_pending_edit() {
    let mut cached = HashMap::new();
    cached.insert("i1".to_string(), meta(when(1)));
    let pending = vec![PendingEdit {
      issue_id: "i1".to_string(),
      field: EditField::Status,
      value: Some("Done".to_string()),
      edited_at: when(3),
    }];

    let diff = reconcile_issues(
      vec![issue("i1", when(5))],
      &cached,
      &pending,
      SnapshotMode::Full,
      ConflictPolicy::LocalWins,
    );
    assert_eq!(diff.counts.conflicts, 1);
    assert!(!diff
      .changes
      .iter()
      .any(|c| matches!(c, Change::ClearPendingEdit { .. })));
  }

  #[test]
  fn edit_newer_than_remote_is_not_a_conflict() {
    let mut cached = HashMap::new();
    cached.insert("i1".to_string(), meta(when(1)));
    let pending = vec![PendingEdit {
      issue_id: "i1".to_string(),
      field: EditField::Estimate,
      value: Some("5".to_string()),
      edited_at: when(9),
    }];

    let diff = reconcile_issues(
      vec![issue("i1", when(5))],
      &cached,
      &pending,
      SnapshotMode::Full,
      ConflictPolicy::RemoteWins,
    );
    assert_eq!(diff.counts.conflicts, 0);
    assert!(!diff
      .changes
      .iter()
      .any(|c| matches!(c, Change::ClearPendingEdit { .. })));
  }

  #[test]
  fn unresolved_references_are_marked_dangling() {
    let mut refs = ReferenceIndex::default();
    refs.projects.insert("p1".to_string());

    let mut entity = issue("i1", when(1));
    if let Entity::Issue(i) = &mut entity {
      i.project_id = Some("p1".to_string());
      i.assignee_id = Some("ghost".to_string());
    }

    let diff = reconcile(
      EntityKind::Issue,
      vec![entity],
      &HashMap::new(),
      &[],
      &refs,
      SnapshotMode::Full,
      ConflictPolicy::RemoteWins,
      when(100),
    );
    // Project resolves, assignee does not
    let dangling: Vec<_> = diff
      .changes
      .iter()
      .filter_map(|c| match c {
        Change::PutDangling { field, target_id, .. } => Some((field.as_str(), target_id.as_str())),
        _ => None,
      })
      .collect();
    assert_eq!(dangling, vec![("assignee", "ghost")]);
  }

  #[test]
  fn aggregates_only_change_when_numbers_move() {
    let project = Project {
      id: "p1".to_string(),
      name: "Apollo".to_string(),
      status: "Active".to_string(),
      target_date: None,
      team_id: None,
      issues_count: 2,
      in_progress_count: 1,
      blocked_count: 0,
      updated_at: when(0),
    };
    let active = vec!["In Progress".to_string(), "Review".to_string()];

    let mk = |id: &str, status: &str| {
      let Entity::Issue(mut i) = issue(id, when(1)) else { unreachable!() };
      i.project_id = Some("p1".to_string());
      i.status = status.to_string();
      i
    };

    // Matches the stored aggregates: no change emitted
    let same = vec![mk("a", "Todo"), mk("b", "In Progress")];
    assert!(project_aggregates(&[project.clone()], &same, &active).is_empty());

    // One more active issue: project row must be refreshed
    let moved = vec![mk("a", "Review"), mk("b", "In Progress")];
    let changes = project_aggregates(&[project], &moved, &active);
    assert_eq!(changes.len(), 1);
    let Change::Upsert(Entity::Project(updated)) = &changes[0] else {
      panic!("expected project upsert");
    };
    assert_eq!(updated.in_progress_count, 2);
  }
}
