//! Filter-expression parsing and query execution over the local cache.
//!
//! Expressions are whitespace-separated tokens. A `field:value` token maps to
//! an indexed clause (status, priority, assignee, project, cycle, id); any
//! other token is a free-text term matched against title and description.
//! Values with spaces are double-quoted: `status:"In Progress"`.
//!
//! Execution reads from SQLite, then merges the pending-edit overlay: an
//! optimistic local edit must be visible in results immediately, including
//! when it moves an issue into or out of the filtered set.

use std::collections::HashMap;

use crate::error::{QueryError, StorageError};
use crate::model::{EditField, Issue, Member, PendingEdit, Priority};
use crate::store::{IssueClause, IssueFilter, IssueOrder, Store};

/// Parse a filter expression. `members` is used to resolve assignee names to
/// ids; pass the store's current member list.
pub fn parse(input: &str, members: &[Member]) -> Result<IssueFilter, QueryError> {
  let mut filter = IssueFilter::default();

  for token in tokenize(input)? {
    let clause = match token.split_once(':') {
      Some((field, value)) => match field.to_lowercase().as_str() {
        "status" => Some(require_value(&token, value).map(IssueClause::Status)?),
        "priority" => {
          let value = require_value(&token, value)?;
          let priority = Priority::parse(&value).ok_or_else(|| QueryError::InvalidExpression {
            token: token.clone(),
            reason: format!("unknown priority '{}'", value),
          })?;
          Some(IssueClause::Priority(priority))
        }
        "assignee" => {
          let value = require_value(&token, value)?;
          Some(IssueClause::Assignee(resolve_assignee(
            &token, &value, members,
          )?))
        }
        "project" => Some(require_value(&token, value).map(IssueClause::Project)?),
        "cycle" => Some(require_value(&token, value).map(IssueClause::Cycle)?),
        "id" => Some(require_value(&token, value).map(IssueClause::Id)?),
        // Unknown field names fall through to free text, so searching for
        // something like "http://..." still works.
        _ => None,
      },
      None => None,
    };

    match clause {
      Some(clause) => filter.clauses.push(clause),
      None => filter.text_terms.push(token),
    }
  }

  Ok(filter)
}

/// Run a filter against the cache, overlaying pending local edits.
///
/// Results are deterministic: the same cache state and expression always
/// yield the same sequence.
pub fn execute(
  store: &Store,
  filter: &IssueFilter,
  order: IssueOrder,
  limit: usize,
) -> Result<Vec<Issue>, StorageError> {
  let edits = store.list_pending_edits()?;
  if edits.is_empty() {
    return store.list_issues(filter, order, limit);
  }

  // Over-fetch by the overlay size: an edit may knock a base row out of the
  // filtered set, and the union below can only add rows back.
  let mut issues = store.list_issues(filter, order, limit + edits.len())?;
  for candidate in store.issues_with_pending_edits()? {
    if !issues.iter().any(|i| i.id == candidate.id) {
      issues.push(candidate);
    }
  }

  let mut by_issue: HashMap<&str, Vec<&PendingEdit>> = HashMap::new();
  for edit in &edits {
    by_issue.entry(edit.issue_id.as_str()).or_default().push(edit);
  }

  for issue in &mut issues {
    if let Some(edits) = by_issue.get(issue.id.as_str()) {
      for edit in edits {
        apply_edit(issue, edit);
      }
    }
  }

  // Edits may have changed filtered fields either way, so re-check and
  // re-sort in memory before applying the limit.
  issues.retain(|i| filter.matches(i));
  order.sort(&mut issues);
  issues.truncate(limit);
  Ok(issues)
}

/// Overlay one pending edit onto an issue.
pub fn apply_edit(issue: &mut Issue, edit: &PendingEdit) {
  match edit.field {
    EditField::Status => {
      if let Some(value) = &edit.value {
        issue.status = value.clone();
      }
    }
    EditField::Assignee => {
      issue.assignee_id = edit.value.clone();
    }
    EditField::Estimate => {
      if let Some(value) = &edit.value {
        if let Ok(n) = value.parse::<i64>() {
          issue.estimate = n;
        }
      }
    }
  }
}

fn require_value(token: &str, value: &str) -> Result<String, QueryError> {
  if value.is_empty() {
    return Err(QueryError::InvalidExpression {
      token: token.to_string(),
      reason: "missing value".to_string(),
    });
  }
  Ok(value.to_string())
}

/// Resolve an assignee value to a member id. Exact id match wins, then exact
/// name match (case-insensitive), then a unique name prefix. Ambiguity is an
/// error rather than a guess.
fn resolve_assignee(token: &str, value: &str, members: &[Member]) -> Result<String, QueryError> {
  if members.iter().any(|m| m.id == value) {
    return Ok(value.to_string());
  }
  if let Some(m) = members.iter().find(|m| m.name.eq_ignore_ascii_case(value)) {
    return Ok(m.id.clone());
  }

  let needle = value.to_lowercase();
  let prefix_matches: Vec<&Member> = members
    .iter()
    .filter(|m| m.name.to_lowercase().starts_with(&needle))
    .collect();
  match prefix_matches.as_slice() {
    [only] => Ok(only.id.clone()),
    [] => Err(QueryError::InvalidExpression {
      token: token.to_string(),
      reason: format!("no member matches '{}'", value),
    }),
    many => Err(QueryError::InvalidExpression {
      token: token.to_string(),
      reason: format!(
        "ambiguous member '{}' ({} matches)",
        value,
        many.len()
      ),
    }),
  }
}

/// Split an expression into tokens, honoring double quotes both around whole
/// tokens and around `field:value` values.
fn tokenize(input: &str) -> Result<Vec<String>, QueryError> {
  let mut tokens = Vec::new();
  let mut current = String::new();
  let mut in_quotes = false;

  for ch in input.chars() {
    match ch {
      '"' => in_quotes = !in_quotes,
      c if c.is_whitespace() && !in_quotes => {
        if !current.is_empty() {
          tokens.push(std::mem::take(&mut current));
        }
      }
      c => current.push(c),
    }
  }

  if in_quotes {
    return Err(QueryError::InvalidExpression {
      token: current,
      reason: "unterminated quote".to_string(),
    });
  }
  if !current.is_empty() {
    tokens.push(current);
  }
  Ok(tokens)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::{Entity, PendingEdit};
  use crate::store::Change;
  use chrono::{DateTime, TimeZone, Utc};

  fn when(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
  }

  fn member(id: &str, name: &str) -> Member {
    Member {
      id: id.to_string(),
      name: name.to_string(),
      capacity: 10,
      team_id: None,
      updated_at: when(0),
    }
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

  #[test]
  fn parses_field_clauses_and_free_text() {
    let filter = parse("status:Todo priority:high login flow", &[]).unwrap();
    assert_eq!(
      filter.clauses,
      vec![
        IssueClause::Status("Todo".to_string()),
        IssueClause::Priority(Priority::High),
      ]
    );
    assert_eq!(filter.text_terms, vec!["login", "flow"]);
  }

  #[test]
  fn quoted_values_keep_spaces() {
    let filter = parse(r#"status:"In Progress" "login flow""#, &[]).unwrap();
    assert_eq!(
      filter.clauses,
      vec![IssueClause::Status("In Progress".to_string())]
    );
    assert_eq!(filter.text_terms, vec!["login flow"]);
  }

  #[test]
  fn unknown_field_is_free_text() {
    let filter = parse("label:urgent", &[]).unwrap();
    assert!(filter.clauses.is_empty());
    assert_eq!(filter.text_terms, vec!["label:urgent"]);
  }

  #[test]
  fn bad_priority_names_the_token() {
    let err = parse("priority:sev1", &[]).unwrap_err();
    let QueryError::InvalidExpression { token, reason } = err;
    assert_eq!(token, "priority:sev1");
    assert!(reason.contains("sev1"));
  }

  #[test]
  fn missing_value_is_an_error() {
    let err = parse("status:", &[]).unwrap_err();
    let QueryError::InvalidExpression { token, .. } = err;
    assert_eq!(token, "status:");
  }

  #[test]
  fn unterminated_quote_is_an_error() {
    assert!(parse(r#"status:"In Prog"#, &[]).is_err());
  }

  #[test]
  fn assignee_resolves_name_and_prefix() {
    let members = vec![member("m1", "Alice Chen"), member("m2", "Bob Park")];

    let filter = parse("assignee:m1", &members).unwrap();
    assert_eq!(filter.clauses, vec![IssueClause::Assignee("m1".to_string())]);

    let filter = parse(r#"assignee:"alice chen""#, &members).unwrap();
    assert_eq!(filter.clauses, vec![IssueClause::Assignee("m1".to_string())]);

    let filter = parse("assignee:bob", &members).unwrap();
    assert_eq!(filter.clauses, vec![IssueClause::Assignee("m2".to_string())]);
  }

  #[test]
  fn ambiguous_or_unknown_assignee_is_an_error() {
    let members = vec![member("m1", "Alice Chen"), member("m2", "Alice Park")];
    assert!(parse("assignee:alice", &members).is_err());
    assert!(parse("assignee:nobody", &members).is_err());
  }

  fn seeded_store() -> (Store, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&dir.path().join("cache.db")).unwrap();
    let batch: Vec<Change> = [
      issue("1", "Todo", Priority::High),
      issue("2", "In Progress", Priority::Low),
      issue("3", "Todo", Priority::Urgent),
    ]
    .into_iter()
    .map(|i| Change::Upsert(Entity::Issue(i)))
    .collect();
    store.apply_batch(&batch, None).unwrap();
    (store, dir)
  }

  #[test]
  fn execute_without_edits_hits_sql_path() {
    let (store, _dir) = seeded_store();
    let filter = parse("status:Todo", &[]).unwrap();
    let found = execute(&store, &filter, IssueOrder::default(), 10).unwrap();
    let ids: Vec<&str> = found.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, vec!["3", "1"]);
  }

  #[test]
  fn pending_edit_moves_issue_into_filtered_set() {
    let (store, _dir) = seeded_store();
    // Issue 2 is "In Progress" in the cache but locally edited to "Todo"
    store
      .apply_batch(
        &[Change::PutPendingEdit(PendingEdit {
          issue_id: "2".to_string(),
          field: EditField::Status,
          value: Some("Todo".to_string()),
          edited_at: when(5),
        })],
        None,
      )
      .unwrap();

    let filter = parse("status:Todo", &[]).unwrap();
    let found = execute(&store, &filter, IssueOrder::default(), 10).unwrap();
    let ids: Vec<&str> = found.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, vec!["3", "1", "2"]);
    assert_eq!(found[2].status, "Todo");
  }

  #[test]
  fn pending_edit_moves_issue_out_of_filtered_set() {
    let (store, _dir) = seeded_store();
    store
      .apply_batch(
        &[Change::PutPendingEdit(PendingEdit {
          issue_id: "1".to_string(),
          field: EditField::Status,
          value: Some("Done".to_string()),
          edited_at: when(5),
        })],
        None,
      )
      .unwrap();

    let filter = parse("status:Todo", &[]).unwrap();
    let found = execute(&store, &filter, IssueOrder::default(), 10).unwrap();
    let ids: Vec<&str> = found.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, vec!["3"]);
  }

  #[test]
  fn overlay_results_are_deterministic_and_limited() {
    let (store, _dir) = seeded_store();
    store
      .apply_batch(
        &[Change::PutPendingEdit(PendingEdit {
          issue_id: "2".to_string(),
          field: EditField::Estimate,
          value: Some("8".to_string()),
          edited_at: when(5),
        })],
        None,
      )
      .unwrap();

    let filter = IssueFilter::default();
    let first = execute(&store, &filter, IssueOrder::default(), 2).unwrap();
    let second = execute(&store, &filter, IssueOrder::default(), 2).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.len(), 2);
    assert_eq!(first[0].id, "3");
  }

  #[test]
  fn unassign_edit_clears_assignee_in_results() {
    let (store, _dir) = seeded_store();
    let mut assigned = issue("4", "Todo", Priority::Medium);
    assigned.assignee_id = Some("m1".to_string());
    store
      .apply_batch(&[Change::Upsert(Entity::Issue(assigned))], None)
      .unwrap();
    store
      .apply_batch(
        &[Change::PutPendingEdit(PendingEdit {
          issue_id: "4".to_string(),
          field: EditField::Assignee,
          value: None,
          edited_at: when(5),
        })],
        None,
      )
      .unwrap();

    let filter = parse("id:ENG-4", &[]).unwrap();
    let found = execute(&store, &filter, IssueOrder::default(), 10).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].assignee_id, None);
  }
}
