//! In-memory table of outstanding preloads.

use std::collections::HashMap;

use super::entry::CacheEntry;
use crate::error::{PreloadError, Result};

/// Maps canonical keys to their single entry.
///
/// Owned by one `PreloadCache`; there is no process-wide instance.
#[derive(Debug, Default)]
pub(crate) struct EntryStore {
  entries: HashMap<String, CacheEntry>,
}

impl EntryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Insert a new entry, refusing to touch an existing one.
  ///
  /// In-crate guard for callers that must not replace a live entry.
  /// `PreloadCache` replaces on repeated loads and goes through `insert`.
  #[allow(dead_code)]
  pub fn create(&mut self, key: &str, entry: CacheEntry) -> Result<&mut CacheEntry> {
    if self.entries.contains_key(key) {
      return Err(PreloadError::Conflict(key.to_string()));
    }
    Ok(self.entries.entry(key.to_string()).or_insert(entry))
  }

  /// Insert an entry, returning the one it replaced.
  pub fn insert(&mut self, key: &str, entry: CacheEntry) -> Option<CacheEntry> {
    self.entries.insert(key.to_string(), entry)
  }

  #[allow(dead_code)]
  pub fn get(&self, key: &str) -> Option<&CacheEntry> {
    self.entries.get(key)
  }

  pub fn get_mut(&mut self, key: &str) -> Option<&mut CacheEntry> {
    self.entries.get_mut(key)
  }

  pub fn remove(&mut self, key: &str) -> Option<CacheEntry> {
    self.entries.remove(key)
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}
