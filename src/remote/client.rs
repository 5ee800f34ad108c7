//! GraphQL client for the remote workspace.

use color_eyre::{eyre::eyre, Result};
use reqwest::StatusCode;
use serde_json::json;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::config::Config;
use crate::error::RemoteError;
use crate::model::EntityKind;

use super::api_types::{
  ApiCycle, ApiIssue, ApiProject, ApiTeam, ApiUser, Connection, GraphQlResponse, CYCLES_QUERY,
  ISSUES_QUERY, MEMBERS_QUERY, PAGE_SIZE, PROJECTS_QUERY, TEAMS_QUERY,
};
use super::{Page, RemoteSource};

/// Remote API client wrapper.
///
/// The token is looked up lazily so that local commands work without
/// credentials; a missing token only surfaces when a fetch is attempted.
#[derive(Clone)]
pub struct HttpRemote {
  http: reqwest::Client,
  url: String,
  token: Option<String>,
  config: Config,
}

impl HttpRemote {
  pub fn new(config: &Config) -> Result<Self> {
    let http = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.sync.fetch_timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      url: config.remote.url.clone(),
      token: Config::get_api_token().ok(),
      config: config.clone(),
    })
  }

  async fn post(
    &self,
    query: &str,
    variables: serde_json::Value,
  ) -> Result<serde_json::Value, RemoteError> {
    let token = self.token.as_ref().ok_or_else(|| {
      RemoteError::Auth("no API token; set PDASH_API_TOKEN or LINEAR_API_KEY".to_string())
    })?;

    let response = self
      .http
      .post(&self.url)
      .header("Content-Type", "application/json")
      .header("Authorization", token)
      .json(&json!({ "query": query, "variables": variables }))
      .send()
      .await
      .map_err(|e| RemoteError::Transient(e.to_string()))?;

    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
      return Err(RemoteError::Auth(format!("HTTP {}", status)));
    }
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
      return Err(RemoteError::Transient(format!("HTTP {}", status)));
    }
    if !status.is_success() {
      return Err(RemoteError::Malformed(format!("HTTP {}", status)));
    }

    let body: GraphQlResponse = response
      .json()
      .await
      .map_err(|e| RemoteError::Malformed(format!("response body: {}", e)))?;

    if let Some(first) = body.errors.first() {
      return Err(classify_api_error(first));
    }

    body
      .data
      .ok_or_else(|| RemoteError::Malformed("response missing data".to_string()))
  }

  fn page_variables(cursor: Option<String>) -> serde_json::Value {
    json!({ "first": PAGE_SIZE, "after": cursor })
  }

  fn parse_connection<T: serde::de::DeserializeOwned>(
    mut data: serde_json::Value,
    root: &str,
  ) -> Result<Connection<T>, RemoteError> {
    let node = data
      .get_mut(root)
      .map(serde_json::Value::take)
      .ok_or_else(|| RemoteError::Malformed(format!("response missing '{}'", root)))?;
    serde_json::from_value(node)
      .map_err(|e| RemoteError::Malformed(format!("'{}' payload: {}", root, e)))
  }
}

/// Map a GraphQL-level error onto the remote taxonomy. Rate limiting is the
/// only retryable API error; everything else is terminal for the run.
fn classify_api_error(err: &super::api_types::GraphQlError) -> RemoteError {
  let code = err.extensions.code.as_deref().unwrap_or("").to_uppercase();
  if code.contains("AUTH") || code.contains("FORBIDDEN") || code.contains("UNAUTHORIZED") {
    return RemoteError::Auth(err.message.clone());
  }
  if code.contains("RATELIMIT") || code.contains("RATE_LIMIT") {
    return RemoteError::Transient(err.message.clone());
  }
  RemoteError::Malformed(format!("{} (code={})", err.message, code))
}

impl RemoteSource for HttpRemote {
  fn fetch_page(
    &self,
    kind: EntityKind,
    cursor: Option<String>,
  ) -> impl Future<Output = Result<Page, RemoteError>> + Send {
    async move {
      debug!(kind = %kind, cursor = cursor.as_deref(), "fetching remote page");
      let variables = Self::page_variables(cursor);

      let (entities, page_info) = match kind {
        EntityKind::Team => {
          let data = self.post(TEAMS_QUERY, variables).await?;
          let conn: Connection<ApiTeam> = Self::parse_connection(data, "teams")?;
          let entities = conn.nodes.into_iter().map(ApiTeam::into_entity).collect();
          (entities, conn.page_info)
        }
        EntityKind::Member => {
          let data = self.post(MEMBERS_QUERY, variables).await?;
          let conn: Connection<ApiUser> = Self::parse_connection(data, "users")?;
          let entities = conn
            .nodes
            .into_iter()
            .map(|u| u.into_entity(&self.config))
            .collect();
          (entities, conn.page_info)
        }
        EntityKind::Project => {
          let data = self.post(PROJECTS_QUERY, variables).await?;
          let conn: Connection<ApiProject> = Self::parse_connection(data, "projects")?;
          let entities = conn.nodes.into_iter().map(ApiProject::into_entity).collect();
          (entities, conn.page_info)
        }
        EntityKind::Cycle => {
          let data = self.post(CYCLES_QUERY, variables).await?;
          let conn: Connection<ApiCycle> = Self::parse_connection(data, "cycles")?;
          let entities = conn.nodes.into_iter().map(ApiCycle::into_entity).collect();
          (entities, conn.page_info)
        }
        EntityKind::Issue => {
          let data = self.post(ISSUES_QUERY, variables).await?;
          let conn: Connection<ApiIssue> = Self::parse_connection(data, "issues")?;
          let entities = conn.nodes.into_iter().map(ApiIssue::into_entity).collect();
          (entities, conn.page_info)
        }
      };

      let next_cursor = if page_info.has_next_page {
        page_info.end_cursor
      } else {
        None
      };

      Ok(Page {
        entities,
        next_cursor,
      })
    }
  }
}
