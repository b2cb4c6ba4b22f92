//! Per-key cache entries and the values they deliver.

use serde::Serialize;

use crate::error::PreloadError;
use crate::transport::TransportMeta;

/// Decoded result payload of a completed request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Response {
  /// Body parsed as JSON
  Json(serde_json::Value),
  /// Body passed through as text
  Text(String),
  /// The request failed; `status` falls back to 404 when none was received
  #[serde(rename_all = "camelCase")]
  NetworkError {
    network_error: bool,
    retcode: u16,
    status: u16,
  },
}

impl Response {
  pub fn network_error(status: u16) -> Self {
    let status = if status == 0 { 404 } else { status };
    Response::NetworkError {
      network_error: true,
      retcode: status,
      status,
    }
  }

  pub fn is_network_error(&self) -> bool {
    matches!(self, Response::NetworkError { .. })
  }
}

/// What a callback receives once a preload finishes.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
  pub response: Response,
  pub meta: Option<TransportMeta>,
}

/// A completed preload: either a (possibly failed) response or a decode error.
pub type Outcome = Result<Completion, PreloadError>;

/// Consumer callback. `None` means "no preload, fetch it yourself".
pub type Callback = Box<dyn FnOnce(Option<Outcome>) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryStatus {
  Fetching,
  Done,
}

/// One in-flight or completed preload.
pub(crate) struct CacheEntry {
  pub(crate) status: EntryStatus,
  pub(crate) used: bool,
  pub(crate) outcome: Option<Outcome>,
  pub(crate) pending: Vec<Callback>,
  /// Identifies the `load` call that created this entry
  pub(crate) generation: u64,
}

impl CacheEntry {
  pub(crate) fn fetching(generation: u64, callback: Option<Callback>) -> Self {
    Self {
      status: EntryStatus::Fetching,
      used: false,
      outcome: None,
      pending: callback.into_iter().collect(),
      generation,
    }
  }

  pub(crate) fn status(&self) -> EntryStatus {
    self.status
  }

  pub(crate) fn is_used(&self) -> bool {
    self.used
  }

  /// Take exclusive ownership of the eventual result.
  ///
  /// Returns `Err(callback)` when the entry was already claimed.
  pub(crate) fn claim(&mut self, callback: Callback) -> Result<(), Callback> {
    if self.used {
      return Err(callback);
    }
    self.used = true;
    self.pending.push(callback);
    Ok(())
  }

  /// Mark the entry done and take the callbacks waiting on it.
  ///
  /// A new outcome replaces the stored one; `None` keeps what is stored.
  /// Callbacks registered afterwards go to a fresh list.
  pub(crate) fn finish(&mut self, outcome: Option<Outcome>) -> Delivery {
    if outcome.is_some() {
      self.outcome = outcome;
    }
    self.status = EntryStatus::Done;
    Delivery {
      callbacks: std::mem::take(&mut self.pending),
      outcome: self.outcome.clone(),
    }
  }
}

impl std::fmt::Debug for CacheEntry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CacheEntry")
      .field("status", &self.status)
      .field("used", &self.used)
      .field("outcome", &self.outcome)
      .field("pending", &self.pending.len())
      .field("generation", &self.generation)
      .finish()
  }
}

/// Callbacks drained from an entry, delivered outside the store lock.
#[must_use]
pub(crate) struct Delivery {
  callbacks: Vec<Callback>,
  outcome: Option<Outcome>,
}

impl Delivery {
  /// Invoke every callback in registration order.
  pub(crate) fn deliver(self) {
    for callback in self.callbacks {
      callback(self.outcome.clone());
    }
  }
}
