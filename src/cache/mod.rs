//! Speculative-fetch cache: preload a request early, claim its result once.
//!
//! This module provides:
//! - `EntryStore`, the per-instance table of outstanding preloads (internal)
//! - `CacheEntry`, the fetching/done state of one canonical key (internal)
//! - `PreloadCache`, the `load`/`get` hand-off between producer and consumer

mod entry;
mod preload;
mod store;

pub use entry::{Callback, Completion, Outcome, Response};
pub use preload::{CacheOptions, LoadHandle, PreloadCache, NONCE_PARAM, TOKEN_PARAM};
