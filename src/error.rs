//! Error taxonomy for the offline sync layer.

use thiserror::Error;

/// Errors surfaced by the store, cache, queue and sync engine.
#[derive(Debug, Error)]
pub enum SyncError {
  /// The underlying storage medium could not be opened.
  #[error("storage unavailable: {0}")]
  StorageUnavailable(String),

  /// A read or write against an open medium failed.
  #[error("storage I/O error: {0}")]
  StorageIo(String),

  /// A cached entry could not be decoded.
  #[error("corrupt cache entry {key}: {reason}")]
  CacheCorruptEntry { key: String, reason: String },

  /// Neither the live fetch nor the cache produced a value.
  #[error("no cached data for {key}{}", cause.as_ref().map(|c| format!(" (live fetch: {})", c)).unwrap_or_default())]
  NoCachedData { key: String, cause: Option<String> },

  /// The remote side rejected or never received a mutation.
  #[error("remote apply failed for {id}: {reason}")]
  RemoteApplyFailed { id: String, reason: String },

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("runtime error: {0}")]
  Runtime(String),

  /// A setting handed to the client builder is unusable.
  #[error("invalid configuration: {0}")]
  Config(String),
}

impl SyncError {
  /// Whether the error came from the storage medium.
  pub fn is_storage(&self) -> bool {
    matches!(
      self,
      SyncError::StorageUnavailable(_) | SyncError::StorageIo(_)
    )
  }
}

impl From<rusqlite::Error> for SyncError {
  fn from(e: rusqlite::Error) -> Self {
    match e {
      rusqlite::Error::SqliteFailure(ref code, _)
        if matches!(
          code.code,
          rusqlite::ErrorCode::CannotOpen
            | rusqlite::ErrorCode::NotADatabase
            | rusqlite::ErrorCode::PermissionDenied
        ) =>
      {
        SyncError::StorageUnavailable(e.to_string())
      }
      other => SyncError::StorageIo(other.to_string()),
    }
  }
}

impl From<tokio::task::JoinError> for SyncError {
  fn from(e: tokio::task::JoinError) -> Self {
    SyncError::Runtime(e.to_string())
  }
}

/// Result type for sync layer operations.
pub type Result<T> = std::result::Result<T, SyncError>;
