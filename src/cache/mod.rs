//! In-memory caching layer for ledger reads.
//!
//! This module provides a domain-agnostic caching mechanism that:
//! - Stores opaque JSON results under string keys with per-entry TTL
//! - Evicts least-recently-accessed entries beyond configured ceilings
//! - Runs at most one fetch per key, shared by every concurrent caller
//! - Preloads keys in the background, highest priority first

mod layer;
mod scheduler;
mod store;
mod traits;

pub use layer::{CacheLayer, LoadOptions};
pub use scheduler::{
  FetchOutcome, Pending, PreloadHandle, PreloadScheduler, PreloadTask, Priority, RetryPolicy,
  SchedulerStatus,
};
pub use store::{CacheStats, CacheStore, EntryInfo, Hit};
pub use traits::{fetcher_fn, CacheResult, CacheSource, CachedValue, FetchFuture, FetcherFn, QueryKey};
