//! Errors surfaced by the preload cache.

use thiserror::Error;

/// Hard failures of the preload protocol.
///
/// A cache miss is not an error (it is `None`), and a failed network call is
/// delivered as a regular completion. Only the variants below reach callers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PreloadError {
  /// The descriptor cannot identify a request (e.g. empty URL).
  #[error("malformed request descriptor: {0}")]
  MalformedDescriptor(String),

  /// The response body did not parse as the declared data type.
  #[error("failed to decode response for {key}: {message}")]
  Decode { key: String, message: String },

  /// An entry already exists for this canonical key.
  #[error("an entry already exists for {0}")]
  Conflict(String),

  /// A preload was started outside a tokio runtime.
  #[error("cannot preload {0}: no tokio runtime is running")]
  NoRuntime(String),

  /// The background completion task did not run to the end.
  #[error("completion task for {key} failed: {message}")]
  TaskFailed { key: String, message: String },
}

pub type Result<T> = std::result::Result<T, PreloadError>;
