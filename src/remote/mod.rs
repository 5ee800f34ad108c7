//! Remote boundary: paginated entity fetches from the workspace API.
//!
//! This is a pure I/O layer. Caching, retries, and snapshot semantics all
//! belong to the sync orchestrator; the only contract here is "give me one
//! page of entities of this kind, starting at this cursor".

pub mod api_types;
mod client;

pub use client::HttpRemote;

use std::future::Future;

use crate::error::RemoteError;
use crate::model::{Entity, EntityKind};

/// One page of a restartable paginated fetch.
#[derive(Debug, Clone)]
pub struct Page {
  pub entities: Vec<Entity>,
  /// Present when more pages remain; feed it back to `fetch_page`.
  pub next_cursor: Option<String>,
}

/// Source of remote entity snapshots.
pub trait RemoteSource: Send + Sync {
  fn fetch_page(
    &self,
    kind: EntityKind,
    cursor: Option<String>,
  ) -> impl Future<Output = Result<Page, RemoteError>> + Send;
}
