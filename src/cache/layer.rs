//! Cache layer that fronts data fetches with the store and the scheduler.

use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

use super::scheduler::{PreloadHandle, PreloadScheduler, PreloadTask, Priority};
use super::store::{decode, CacheStats, CacheStore};
use super::traits::{CacheResult, FetcherFn};
use crate::config::Config;
use crate::error::FetchError;

/// Per-call options for [`CacheLayer::load`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
  /// Store default when `None`
  pub ttl: Option<Duration>,
  /// Register the key for eager warming and refresh after invalidation
  pub preload: bool,
  pub priority: Priority,
}

impl LoadOptions {
  pub fn ttl(mut self, ttl: Duration) -> Self {
    self.ttl = Some(ttl);
    self
  }

  pub fn preload(mut self, priority: Priority) -> Self {
    self.preload = true;
    self.priority = priority;
    self
  }
}

#[derive(Clone)]
struct WarmEntry {
  fetcher: FetcherFn,
  priority: Priority,
  ttl: Option<Duration>,
}

/// Cache layer that manages caching logic and fetching.
///
/// Reads are cache-first: a fresh entry is returned without fetching, and a
/// miss goes through the scheduler so concurrent callers share one fetch.
/// Keys loaded with `preload` keep their fetcher in a warm set, which is what
/// allows the sync coordinator to refresh them after an invalidation.
#[derive(Clone)]
pub struct CacheLayer {
  store: CacheStore,
  scheduler: PreloadScheduler,
  warm: Arc<Mutex<HashMap<String, WarmEntry>>>,
}

impl CacheLayer {
  /// Create a cache layer over an existing store and scheduler.
  ///
  /// The scheduler should write to the same store.
  pub fn new(store: CacheStore, scheduler: PreloadScheduler) -> Self {
    Self {
      store,
      scheduler,
      warm: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  pub fn from_config(config: &Config) -> Self {
    let store = CacheStore::new(&config.cache);
    let scheduler = PreloadScheduler::new(store.clone(), &config.preload);
    Self::new(store, scheduler)
  }

  pub fn store(&self) -> &CacheStore {
    &self.store
  }

  pub fn scheduler(&self) -> &PreloadScheduler {
    &self.scheduler
  }

  pub fn stats(&self) -> CacheStats {
    self.store.stats()
  }

  fn warm_set(&self) -> MutexGuard<'_, HashMap<String, WarmEntry>> {
    self.warm.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Fetch `key` with a cache-first strategy.
  ///
  /// 1. Fresh entry in the store: return it (`CacheFresh`)
  /// 2. Fetch already pending for the key: wait for it (`Shared`)
  /// 3. Otherwise fetch now and store the result (`Network`)
  ///
  /// Failures are returned to the caller and never cached.
  pub async fn load<T>(
    &self,
    key: &str,
    fetcher: FetcherFn,
    opts: LoadOptions,
  ) -> Result<CacheResult<T>, FetchError>
  where
    T: DeserializeOwned,
  {
    if opts.preload {
      self.register(key, fetcher.clone(), opts.priority, opts.ttl);
    }

    if let Some(hit) = self.store.lookup(key) {
      debug!(key, "cache hit");
      let data = decode(key, &hit.value)?;
      return Ok(CacheResult::from_cache(data, hit.cached_at));
    }

    debug!(key, "cache miss");
    let ttl = opts.ttl.unwrap_or_else(|| self.store.default_ttl());
    let pending = self.scheduler.fetch_now(key, fetcher, ttl);
    let value = pending.handle.await?;
    let data = decode(key, &value)?;
    Ok(if pending.joined {
      CacheResult::shared(data)
    } else {
      CacheResult::from_network(data)
    })
  }

  /// Fresh cached value for `key`, fetching it at most once across
  /// concurrent callers on a miss.
  pub async fn get_or_load<T>(
    &self,
    key: &str,
    fetcher: FetcherFn,
    ttl: Option<Duration>,
  ) -> Result<T, FetchError>
  where
    T: DeserializeOwned,
  {
    let opts = LoadOptions {
      ttl,
      ..LoadOptions::default()
    };
    self.load(key, fetcher, opts).await.map(|r| r.data)
  }

  fn register(&self, key: &str, fetcher: FetcherFn, priority: Priority, ttl: Option<Duration>) {
    self.warm_set().insert(
      key.to_string(),
      WarmEntry {
        fetcher,
        priority,
        ttl,
      },
    );
  }

  /// Register `key` in the warm set and preload it unless it is already fresh.
  pub fn warm(&self, key: &str, fetcher: FetcherFn, priority: Priority) -> Option<PreloadHandle> {
    self.register(key, fetcher, priority, None);
    self.refresh(key, priority)
  }

  /// Preload every registered key that is not currently fresh, each at its
  /// registered priority.
  pub fn warm_all(&self) -> Vec<PreloadHandle> {
    let entries: Vec<(String, WarmEntry)> = self
      .warm_set()
      .iter()
      .map(|(k, e)| (k.clone(), e.clone()))
      .collect();

    entries
      .into_iter()
      .filter(|(key, _)| !self.store.is_fresh(key))
      .map(|(key, entry)| self.enqueue(key, entry, None))
      .collect()
  }

  /// Registered fetcher for `key`, if any.
  pub fn refresher(&self, key: &str) -> Option<FetcherFn> {
    self.warm_set().get(key).map(|e| e.fetcher.clone())
  }

  /// Preload `key` with its registered fetcher at `priority`.
  ///
  /// Returns `None` when the key has no registered fetcher or is still fresh.
  pub fn refresh(&self, key: &str, priority: Priority) -> Option<PreloadHandle> {
    if self.store.is_fresh(key) {
      return None;
    }
    let entry = self.warm_set().get(key).cloned()?;
    Some(self.enqueue(key.to_string(), entry, Some(priority)))
  }

  fn enqueue(&self, key: String, entry: WarmEntry, priority: Option<Priority>) -> PreloadHandle {
    let task = PreloadTask::new(key, entry.fetcher, priority.unwrap_or(entry.priority));
    let task = match entry.ttl {
      Some(ttl) => task.with_ttl(ttl),
      None => task,
    };
    self.scheduler.enqueue(task)
  }

  /// Drop `key` from the store and detach any in-flight fetch for it.
  pub fn invalidate(&self, key: &str) -> bool {
    let detached = self.scheduler.detach_in_flight(|k| k == key);
    let removed = self.store.invalidate(key);
    removed || !detached.is_empty()
  }

  /// Drop every key starting with `prefix`, detaching in-flight fetches for
  /// matching keys. Returns the affected keys, sorted.
  pub fn invalidate_prefix(&self, prefix: &str) -> Vec<String> {
    let mut keys = self.scheduler.detach_in_flight(|k| k.starts_with(prefix));
    keys.extend(self.store.invalidate_prefix(prefix));
    keys.sort();
    keys.dedup();
    keys
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::scheduler::RetryPolicy;
  use crate::cache::traits::{fetcher_fn, CacheSource};
  use color_eyre::eyre::eyre;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn layer() -> CacheLayer {
    let store = CacheStore::default();
    let scheduler = PreloadScheduler::with_policy(store.clone(), 2, RetryPolicy::default());
    CacheLayer::new(store, scheduler)
  }

  fn counting(counter: Arc<AtomicUsize>) -> FetcherFn {
    fetcher_fn(move || {
      let counter = Arc::clone(&counter);
      async move {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(vec![n; 2])
      }
    })
  }

  #[tokio::test]
  async fn test_second_read_is_a_hit() {
    let layer = layer();
    let counter = Arc::new(AtomicUsize::new(0));
    let ttl = Some(Duration::from_secs(60));

    let opts = LoadOptions::default().ttl(Duration::from_secs(60));
    let first: CacheResult<Vec<usize>> = layer
      .load("accounts:all", counting(counter.clone()), opts)
      .await
      .unwrap();
    assert_eq!(first.source, CacheSource::Network);
    let before = layer.stats();

    let second: Vec<usize> = layer
      .get_or_load("accounts:all", counting(counter.clone()), ttl)
      .await
      .unwrap();
    let after = layer.stats();

    assert_eq!(second, first.data);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(after.hits, before.hits + 1);
    assert_eq!(after.misses, before.misses);
  }

  #[tokio::test]
  async fn test_concurrent_loads_share_one_fetch() {
    let layer = layer();
    let counter = Arc::new(AtomicUsize::new(0));
    let f = counting(counter.clone());

    let loads = (0..8).map(|_| layer.load::<Vec<usize>>("k", f.clone(), LoadOptions::default()));
    let results = futures::future::join_all(loads).await;

    assert_eq!(counter.load(Ordering::SeqCst), 1);
    let sources: Vec<CacheSource> = results.iter().map(|r| r.as_ref().unwrap().source).collect();
    assert_eq!(sources[0], CacheSource::Network);
    assert!(sources[1..].iter().all(|s| *s == CacheSource::Shared));
    assert_eq!(layer.stats().misses, 8);
  }

  #[tokio::test]
  async fn test_failures_are_not_cached() {
    let layer = layer();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let flaky = fetcher_fn(move || {
      let counter = Arc::clone(&counter);
      async move {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
          Err(eyre!("boom"))
        } else {
          Ok("ok")
        }
      }
    });

    let err = layer.get_or_load::<String>("k", flaky.clone(), None).await.unwrap_err();
    assert!(matches!(err, FetchError::Failed { .. }));
    assert!(layer.store().peek("k").is_none());

    let value: String = layer.get_or_load("k", flaky, None).await.unwrap();
    assert_eq!(value, "ok");
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_type_mismatch_is_a_codec_error() {
    let layer = layer();
    let f = fetcher_fn(|| async { Ok("not a number") });
    let err = layer.get_or_load::<u64>("k", f, None).await.unwrap_err();
    assert!(matches!(err, FetchError::Codec { .. }));
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidate_detaches_in_flight_fetch() {
    let layer = layer();
    let slow = fetcher_fn(|| async {
      tokio::time::sleep(Duration::from_secs(1)).await;
      Ok("old")
    });

    let load = tokio::spawn({
      let layer = layer.clone();
      async move { layer.get_or_load::<String>("k", slow, None).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(layer.invalidate("k"));
    assert_eq!(load.await.unwrap().unwrap(), "old");
    assert!(!layer.store().is_fresh("k"));
  }

  #[tokio::test]
  async fn test_preloaded_keys_can_be_refreshed() {
    let layer = layer();
    let counter = Arc::new(AtomicUsize::new(0));
    let opts = LoadOptions::default().preload(Priority::High);

    let _: CacheResult<Vec<usize>> = layer
      .load("accounts:all", counting(counter.clone()), opts)
      .await
      .unwrap();
    assert!(layer.refresher("accounts:all").is_some());
    assert!(layer.refresher("accounts:other").is_none());
    assert!(layer.refresh("accounts:all", Priority::High).is_none());

    assert_eq!(layer.invalidate_prefix("accounts:"), vec!["accounts:all"]);
    let handle = layer.refresh("accounts:all", Priority::High).unwrap();
    handle.await.unwrap();

    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert_eq!(
      layer.store().get_as::<Vec<usize>>("accounts:all").unwrap(),
      Some(vec![2, 2])
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_refresh_keeps_the_registered_ttl() {
    let layer = layer();
    let counter = Arc::new(AtomicUsize::new(0));
    let opts = LoadOptions::default()
      .ttl(Duration::from_secs(5))
      .preload(Priority::Low);

    let _: CacheResult<Vec<usize>> = layer
      .load("reports:balances", counting(counter.clone()), opts)
      .await
      .unwrap();
    layer.invalidate("reports:balances");
    layer
      .refresh("reports:balances", Priority::High)
      .unwrap()
      .await
      .unwrap();

    let info = layer.store().peek("reports:balances").unwrap();
    assert!(info.expires_in_ms <= 5_000, "{}", info.expires_in_ms);
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(!layer.store().is_fresh("reports:balances"));
  }

  #[tokio::test]
  async fn test_warm_all_skips_fresh_keys() {
    let layer = layer();
    let counter = Arc::new(AtomicUsize::new(0));

    layer.warm("a", counting(counter.clone()), Priority::Low).unwrap().await.unwrap();
    layer.warm("b", counting(counter.clone()), Priority::Low);
    layer.store().invalidate("b");

    let handles = layer.warm_all();
    assert_eq!(handles.len(), 1);
    futures::future::join_all(handles).await;
    assert!(layer.store().is_fresh("a") && layer.store().is_fresh("b"));
  }
}
