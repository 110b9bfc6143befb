//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Cached payloads are stored as shared JSON values.
pub type CachedValue = Arc<Value>;

/// A boxed future producing a fetch result.
pub type FetchFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

/// A re-invocable factory for fetches of one key.
///
/// Each call starts a new fetch; the factory itself is kept around so the
/// key can be warmed again after an invalidation or retried after a failure.
pub type FetcherFn = Arc<dyn Fn() -> FetchFuture<Value> + Send + Sync>;

/// Erase a typed fetcher into a [`FetcherFn`] producing JSON values.
pub fn fetcher_fn<T, F, Fut>(fetcher: F) -> FetcherFn
where
  T: Serialize,
  F: Fn() -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<T>> + Send + 'static,
{
  Arc::new(move || {
    let fut = fetcher();
    Box::pin(async move {
      let data = fut.await?;
      serde_json::to_value(data).map_err(|e| eyre!("Failed to serialize fetched value: {}", e))
    })
  })
}

/// Something that can name a cache entry.
pub trait QueryKey {
  /// Deterministic cache key
  fn cache_key(&self) -> String;

  /// Human readable description for logs
  fn description(&self) -> String;
}

impl QueryKey for str {
  fn cache_key(&self) -> String {
    self.to_string()
  }

  fn description(&self) -> String {
    self.to_string()
  }
}

impl QueryKey for String {
  fn cache_key(&self) -> String {
    self.clone()
  }

  fn description(&self) -> String {
    self.clone()
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from a fetch this call started.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from a fetch another caller started.
  pub fn shared(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Shared,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::CacheFresh,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from a fetch started by this call
  Network,
  /// Data from a fetch that was already in flight for the same key
  Shared,
  /// Data from cache, still considered fresh
  CacheFresh,
}
