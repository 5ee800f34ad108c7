//! Wire types for the workspace GraphQL API.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;

use crate::config::Config;
use crate::model::{Cycle, Entity, Issue, Member, Priority, Project, Team};

pub const PAGE_SIZE: u32 = 100;

pub const TEAMS_QUERY: &str = r#"
query($first: Int!, $after: String) {
  teams(first: $first, after: $after) {
    nodes {
      id
      key
      name
      updatedAt
    }
    pageInfo {
      hasNextPage
      endCursor
    }
  }
}
"#;

pub const MEMBERS_QUERY: &str = r#"
query($first: Int!, $after: String) {
  users(first: $first, after: $after) {
    nodes {
      id
      name
      updatedAt
    }
    pageInfo {
      hasNextPage
      endCursor
    }
  }
}
"#;

pub const PROJECTS_QUERY: &str = r#"
query($first: Int!, $after: String) {
  projects(first: $first, after: $after) {
    nodes {
      id
      name
      state
      targetDate
      updatedAt
    }
    pageInfo {
      hasNextPage
      endCursor
    }
  }
}
"#;

pub const CYCLES_QUERY: &str = r#"
query($first: Int!, $after: String) {
  cycles(first: $first, after: $after) {
    nodes {
      id
      name
      number
      startsAt
      endsAt
      team {
        id
      }
      updatedAt
    }
    pageInfo {
      hasNextPage
      endCursor
    }
  }
}
"#;

pub const ISSUES_QUERY: &str = r#"
query($first: Int!, $after: String) {
  issues(first: $first, after: $after) {
    nodes {
      id
      identifier
      title
      description
      priority
      estimate
      createdAt
      updatedAt
      state {
        name
      }
      assignee {
        id
      }
      project {
        id
      }
      cycle {
        id
      }
      team {
        id
      }
      inverseRelations(first: 25) {
        nodes {
          type
          issue {
            id
          }
        }
      }
    }
    pageInfo {
      hasNextPage
      endCursor
    }
  }
}
"#;

#[derive(Debug, Deserialize)]
pub struct GraphQlError {
  pub message: String,
  #[serde(default)]
  pub extensions: GraphQlErrorExtensions,
}

#[derive(Debug, Default, Deserialize)]
pub struct GraphQlErrorExtensions {
  pub code: Option<String>,
  #[serde(rename = "type")]
  pub error_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GraphQlResponse {
  pub data: Option<serde_json::Value>,
  #[serde(default)]
  pub errors: Vec<GraphQlError>,
}

/// Cursor-paginated connection as the API returns it.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection<T> {
  pub nodes: Vec<T>,
  pub page_info: PageInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
  pub has_next_page: bool,
  pub end_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApiRef {
  pub id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiTeam {
  pub id: String,
  pub key: String,
  pub name: String,
  pub updated_at: DateTime<Utc>,
}

impl ApiTeam {
  pub fn into_entity(self) -> Entity {
    Entity::Team(Team {
      id: self.id,
      key: self.key,
      name: self.name,
      updated_at: self.updated_at,
    })
  }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiUser {
  pub id: String,
  pub name: String,
  pub updated_at: DateTime<Utc>,
}

impl ApiUser {
  pub fn into_entity(self, config: &Config) -> Entity {
    let capacity = config.capacity_for(&self.id);
    Entity::Member(Member {
      id: self.id,
      name: self.name,
      capacity,
      team_id: None,
      updated_at: self.updated_at,
    })
  }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiProject {
  pub id: String,
  pub name: String,
  pub state: Option<String>,
  pub target_date: Option<NaiveDate>,
  pub updated_at: DateTime<Utc>,
}

impl ApiProject {
  pub fn into_entity(self) -> Entity {
    Entity::Project(Project {
      id: self.id,
      name: self.name,
      status: self.state.unwrap_or_else(|| "Active".to_string()),
      target_date: self.target_date,
      team_id: None,
      // Aggregates are recomputed from the issue set during reconciliation
      issues_count: 0,
      in_progress_count: 0,
      blocked_count: 0,
      updated_at: self.updated_at,
    })
  }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiCycle {
  pub id: String,
  pub name: Option<String>,
  pub number: Option<i64>,
  pub starts_at: DateTime<Utc>,
  pub ends_at: DateTime<Utc>,
  pub team: Option<ApiRef>,
  pub updated_at: DateTime<Utc>,
}

impl ApiCycle {
  pub fn into_entity(self) -> Entity {
    let name = match (self.name, self.number) {
      (Some(name), _) => name,
      (None, Some(n)) => format!("Cycle {}", n),
      (None, None) => self.id.clone(),
    };
    Entity::Cycle(Cycle {
      id: self.id,
      name,
      starts_at: self.starts_at.date_naive(),
      ends_at: self.ends_at.date_naive(),
      team_id: self.team.map(|t| t.id),
      updated_at: self.updated_at,
    })
  }
}

#[derive(Debug, Deserialize)]
pub struct ApiState {
  pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiRelation {
  #[serde(rename = "type")]
  pub relation_type: String,
  pub issue: Option<ApiRef>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiRelations {
  pub nodes: Vec<ApiRelation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiIssue {
  pub id: String,
  pub identifier: String,
  pub title: String,
  pub description: Option<String>,
  pub priority: i64,
  pub estimate: Option<f64>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  pub state: Option<ApiState>,
  pub assignee: Option<ApiRef>,
  pub project: Option<ApiRef>,
  pub cycle: Option<ApiRef>,
  pub team: Option<ApiRef>,
  pub inverse_relations: Option<ApiRelations>,
}

impl ApiIssue {
  pub fn into_entity(self) -> Entity {
    let blocked_by = self
      .inverse_relations
      .map(|rels| {
        rels
          .nodes
          .into_iter()
          .filter(|r| r.relation_type == "blocks")
          .filter_map(|r| r.issue.map(|i| i.id))
          .collect()
      })
      .unwrap_or_default();

    Entity::Issue(Issue {
      id: self.id,
      identifier: self.identifier,
      title: self.title,
      description: self.description,
      status: self.state.map(|s| s.name).unwrap_or_else(|| "Todo".to_string()),
      priority: Priority::from_remote(self.priority),
      estimate: self.estimate.map(|e| e.round() as i64).unwrap_or(0),
      assignee_id: self.assignee.map(|a| a.id),
      project_id: self.project.map(|p| p.id),
      cycle_id: self.cycle.map(|c| c.id),
      team_id: self.team.map(|t| t.id),
      blocked_by,
      created_at: self.created_at,
      updated_at: self.updated_at,
    })
  }
}
