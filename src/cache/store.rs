//! In-memory cache store with per-entry expiry, LRU eviction and statistics.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use super::traits::CachedValue;
use crate::config::CacheConfig;
use crate::error::FetchError;

/// A single cached result.
#[derive(Debug)]
struct CacheEntry {
  value: CachedValue,
  created_at: Instant,
  expires_at: Instant,
  /// Wall-clock time of the write, for diagnostics
  cached_at: DateTime<Utc>,
  size_estimate: usize,
  /// Store tick of the most recent read or write
  last_access: u64,
  hits: u64,
}

impl CacheEntry {
  fn is_expired(&self, now: Instant) -> bool {
    now >= self.expires_at
  }
}

/// A fresh value returned by [`CacheStore::lookup`].
#[derive(Debug, Clone)]
pub struct Hit {
  pub value: CachedValue,
  pub cached_at: DateTime<Utc>,
}

/// Side-effect-free snapshot of one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryInfo {
  pub key: String,
  pub cached_at: DateTime<Utc>,
  /// Age of the entry in milliseconds
  pub age_ms: u64,
  /// Milliseconds until the entry goes stale, 0 once expired
  pub expires_in_ms: u64,
  pub size_estimate: usize,
  pub hits: u64,
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
  pub hits: u64,
  pub misses: u64,
  /// Entry count
  pub size: usize,
  /// Sum of entry size estimates in bytes
  pub memory_usage: usize,
  /// Entries dropped to stay under the capacity limits
  pub evictions: u64,
  /// Expired entries removed by cleanup
  pub expired: u64,
}

impl CacheStats {
  pub fn hit_rate(&self) -> f64 {
    let total = self.hits + self.misses;
    if total == 0 {
      0.0
    } else {
      self.hits as f64 / total as f64
    }
  }
}

#[derive(Debug, Default)]
struct StoreState {
  entries: HashMap<String, CacheEntry>,
  tick: u64,
  memory: usize,
  hits: u64,
  misses: u64,
  evictions: u64,
  expired: u64,
}

impl StoreState {
  fn next_tick(&mut self) -> u64 {
    self.tick += 1;
    self.tick
  }

  fn remove(&mut self, key: &str) -> Option<CacheEntry> {
    let entry = self.entries.remove(key)?;
    self.memory = self.memory.saturating_sub(entry.size_estimate);
    Some(entry)
  }
}

/// Key/value store of cached results.
///
/// Cloning is cheap and yields a handle to the same store. All mutation goes
/// through the methods below; nothing outside holds references into entries.
#[derive(Debug, Clone)]
pub struct CacheStore {
  state: Arc<Mutex<StoreState>>,
  default_ttl: Duration,
  max_entries: Option<usize>,
  max_memory_bytes: Option<usize>,
}

impl Default for CacheStore {
  fn default() -> Self {
    Self::new(&CacheConfig::default())
  }
}

impl CacheStore {
  pub fn new(config: &CacheConfig) -> Self {
    Self {
      state: Arc::new(Mutex::new(StoreState::default())),
      default_ttl: config.default_ttl(),
      max_entries: config.max_entries,
      max_memory_bytes: config.max_memory_bytes,
    }
  }

  fn state(&self) -> MutexGuard<'_, StoreState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn default_ttl(&self) -> Duration {
    self.default_ttl
  }

  /// Fresh value for `key`, counting a hit or a miss.
  ///
  /// Expired entries read as misses; they stay in place until `cleanup`,
  /// eviction or a new write removes them.
  pub fn lookup(&self, key: &str) -> Option<Hit> {
    let now = Instant::now();
    let mut state = self.state();
    let tick = state.next_tick();

    let hit = match state.entries.get_mut(key) {
      Some(entry) if !entry.is_expired(now) => {
        entry.last_access = tick;
        entry.hits += 1;
        Some(Hit {
          value: Arc::clone(&entry.value),
          cached_at: entry.cached_at,
        })
      }
      _ => None,
    };

    if hit.is_some() {
      state.hits += 1;
    } else {
      state.misses += 1;
    }
    hit
  }

  pub fn get(&self, key: &str) -> Option<CachedValue> {
    self.lookup(key).map(|hit| hit.value)
  }

  /// Typed read of a cached value.
  pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, FetchError> {
    match self.get(key) {
      Some(value) => decode(key, &value).map(Some),
      None => Ok(None),
    }
  }

  /// Fresh value without touching statistics or recency.
  pub fn peek_value(&self, key: &str) -> Option<Hit> {
    let now = Instant::now();
    let state = self.state();
    state
      .entries
      .get(key)
      .filter(|e| !e.is_expired(now))
      .map(|e| Hit {
        value: Arc::clone(&e.value),
        cached_at: e.cached_at,
      })
  }

  pub fn is_fresh(&self, key: &str) -> bool {
    self.peek_value(key).is_some()
  }

  /// Diagnostics snapshot of one entry, expired or not.
  pub fn peek(&self, key: &str) -> Option<EntryInfo> {
    let now = Instant::now();
    let state = self.state();
    state.entries.get(key).map(|e| entry_info(key, e, now))
  }

  /// Snapshots of all entries, ordered by key.
  pub fn entries(&self) -> Vec<EntryInfo> {
    let now = Instant::now();
    let state = self.state();
    let mut infos: Vec<EntryInfo> = state
      .entries
      .iter()
      .map(|(k, e)| entry_info(k, e, now))
      .collect();
    infos.sort_by(|a, b| a.key.cmp(&b.key));
    infos
  }

  /// Unconditionally (over)write `key`, then enforce the capacity limits.
  pub fn set(&self, key: &str, value: CachedValue, ttl: Duration) {
    let now = Instant::now();
    let size_estimate = key.len() + estimate_size(&value);
    let mut state = self.state();
    let tick = state.next_tick();

    state.remove(key);
    state.memory += size_estimate;
    state.entries.insert(
      key.to_string(),
      CacheEntry {
        value,
        created_at: now,
        expires_at: expiry(now, ttl),
        cached_at: Utc::now(),
        size_estimate,
        last_access: tick,
        hits: 0,
      },
    );

    self.evict_over_capacity(&mut state, key);
  }

  /// Serialize and store a typed value.
  pub fn set_value<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<(), FetchError> {
    let value = serde_json::to_value(value).map_err(|e| FetchError::codec(key, &e))?;
    self.set(key, Arc::new(value), ttl);
    Ok(())
  }

  /// Remove a single entry. Returns whether one was present.
  pub fn invalidate(&self, key: &str) -> bool {
    let removed = self.state().remove(key).is_some();
    if removed {
      debug!(key, "cache entry invalidated");
    }
    removed
  }

  /// Remove every entry whose key starts with `prefix`, returning their keys.
  pub fn invalidate_prefix(&self, prefix: &str) -> Vec<String> {
    let mut state = self.state();
    let keys: Vec<String> = state
      .entries
      .keys()
      .filter(|k| k.starts_with(prefix))
      .cloned()
      .collect();
    for key in &keys {
      state.remove(key);
    }
    if !keys.is_empty() {
      debug!(prefix, count = keys.len(), "cache entries invalidated by prefix");
    }
    keys
  }

  pub fn clear(&self) {
    let mut state = self.state();
    state.entries.clear();
    state.memory = 0;
  }

  /// Remove expired entries. Returns how many were dropped.
  pub fn cleanup(&self) -> usize {
    let now = Instant::now();
    let mut state = self.state();
    let expired: Vec<String> = state
      .entries
      .iter()
      .filter(|(_, e)| e.is_expired(now))
      .map(|(k, _)| k.clone())
      .collect();

    for key in &expired {
      state.remove(key);
    }
    state.expired += expired.len() as u64;
    expired.len()
  }

  pub fn stats(&self) -> CacheStats {
    let state = self.state();
    CacheStats {
      hits: state.hits,
      misses: state.misses,
      size: state.entries.len(),
      memory_usage: state.memory,
      evictions: state.evictions,
      expired: state.expired,
    }
  }

  pub fn len(&self) -> usize {
    self.state().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Sweep expired entries every `every` until the returned task is aborted.
  pub fn spawn_cleanup(&self, every: Duration) -> JoinHandle<()> {
    let store = self.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(every);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      // The first tick completes immediately
      ticker.tick().await;
      loop {
        ticker.tick().await;
        let removed = store.cleanup();
        if removed > 0 {
          debug!(removed, "expired cache entries swept");
        }
      }
    })
  }

  fn over_capacity(&self, state: &StoreState) -> bool {
    self.max_entries.is_some_and(|max| state.entries.len() > max)
      || self.max_memory_bytes.is_some_and(|max| state.memory > max)
  }

  /// Evict least-recently-accessed entries until under the limits. The entry
  /// at `keep` was just written and is never evicted here.
  fn evict_over_capacity(&self, state: &mut StoreState, keep: &str) {
    while self.over_capacity(state) {
      let victim = state
        .entries
        .iter()
        .filter(|(k, _)| k.as_str() != keep)
        .min_by_key(|(_, e)| e.last_access)
        .map(|(k, _)| k.clone());

      match victim {
        Some(key) => {
          state.remove(&key);
          state.evictions += 1;
          debug!(key = %key, "cache entry evicted");
        }
        None => break,
      }
    }
  }
}

/// Entries written with a TTL too large to represent never expire in practice.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn expiry(now: Instant, ttl: Duration) -> Instant {
  now
    .checked_add(ttl)
    .or_else(|| now.checked_add(FAR_FUTURE))
    .unwrap_or(now)
}

pub(crate) fn decode<T: DeserializeOwned>(key: &str, value: &Value) -> Result<T, FetchError> {
  T::deserialize(value).map_err(|e| FetchError::codec(key, &e))
}

fn entry_info(key: &str, entry: &CacheEntry, now: Instant) -> EntryInfo {
  EntryInfo {
    key: key.to_string(),
    cached_at: entry.cached_at,
    age_ms: now.saturating_duration_since(entry.created_at).as_millis() as u64,
    expires_in_ms: entry.expires_at.saturating_duration_since(now).as_millis() as u64,
    size_estimate: entry.size_estimate,
    hits: entry.hits,
  }
}

/// Approximate serialized size of a JSON value in bytes.
fn estimate_size(value: &Value) -> usize {
  match value {
    Value::Null => 4,
    Value::Bool(_) => 5,
    Value::Number(_) => 8,
    Value::String(s) => s.len() + 2,
    Value::Array(items) => 2 + items.iter().map(|v| estimate_size(v) + 1).sum::<usize>(),
    Value::Object(map) => {
      2 + map
        .iter()
        .map(|(k, v)| k.len() + 4 + estimate_size(v))
        .sum::<usize>()
    }
  }
}
