//! Typed errors for the sync and storage boundaries.

use thiserror::Error;

/// Errors from the remote boundary.
#[derive(Error, Debug)]
pub enum RemoteError {
  /// Network-level failure (connect, timeout, 5xx). Retryable by the caller.
  #[error("transient remote error: {0}")]
  Transient(String),

  /// Authentication or authorization failure. Terminal for the current run.
  #[error("authentication failed: {0}")]
  Auth(String),

  /// The remote returned a payload we could not understand. Terminal for the
  /// current run.
  #[error("malformed remote payload: {0}")]
  Malformed(String),
}

impl RemoteError {
  pub fn is_transient(&self) -> bool {
    matches!(self, RemoteError::Transient(_))
  }
}

/// Errors from the cache store.
#[derive(Error, Debug)]
pub enum StorageError {
  #[error("storage i/o error: {0}")]
  Io(String),

  /// The batch violated a schema constraint; nothing was committed.
  #[error("storage integrity error: {0}")]
  Integrity(String),
}

impl From<rusqlite::Error> for StorageError {
  fn from(err: rusqlite::Error) -> Self {
    match &err {
      rusqlite::Error::SqliteFailure(code, _)
        if code.code == rusqlite::ErrorCode::ConstraintViolation =>
      {
        StorageError::Integrity(err.to_string())
      }
      _ => StorageError::Io(err.to_string()),
    }
  }
}

impl From<serde_json::Error> for StorageError {
  fn from(err: serde_json::Error) -> Self {
    StorageError::Integrity(err.to_string())
  }
}

/// Errors surfaced synchronously by the query engine.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum QueryError {
  /// Carries the offending token so the caller can point at it.
  #[error("invalid filter expression at '{token}': {reason}")]
  InvalidExpression { token: String, reason: String },
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn transient_is_retryable() {
    assert!(RemoteError::Transient("timeout".into()).is_transient());
    assert!(!RemoteError::Auth("bad token".into()).is_transient());
    assert!(!RemoteError::Malformed("truncated".into()).is_transient());
  }

  #[test]
  fn query_error_names_the_token() {
    let err = QueryError::InvalidExpression {
      token: "status:".to_string(),
      reason: "missing value".to_string(),
    };
    assert!(err.to_string().contains("status:"));
  }
}
