//! Priority-ordered background fetching with per-key de-duplication.
//!
//! Every outstanding fetch for a key is represented by one shared handle;
//! any further request for that key attaches to it. Background work is
//! started highest priority first (FIFO within a priority) with at most
//! `concurrency` tasks in flight. Foreground loads from
//! [`CacheLayer`](super::CacheLayer) use the same de-duplication path but start
//! immediately.
//!
//! Enqueuing and dispatching must happen inside a tokio runtime.

use color_eyre::eyre::eyre;
use futures::future::{self, BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::store::CacheStore;
use super::traits::{CachedValue, FetcherFn};
use crate::config::PreloadConfig;
use crate::error::{ConfigurationError, FetchError};
use crate::event::panic_message;

/// Scheduling class of a background fetch.
#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
  Low,
  #[default]
  Medium,
  High,
}

impl Priority {
  pub fn as_str(&self) -> &'static str {
    match self {
      Priority::Low => "low",
      Priority::Medium => "medium",
      Priority::High => "high",
    }
  }
}

impl fmt::Display for Priority {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Priority {
  type Err = ConfigurationError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "high" => Ok(Priority::High),
      "medium" => Ok(Priority::Medium),
      "low" => Ok(Priority::Low),
      _ => Err(ConfigurationError::UnknownPriority(s.to_string())),
    }
  }
}

/// Outcome shared by every waiter of a fetch.
pub type FetchOutcome = Result<CachedValue, FetchError>;

/// Shared in-flight handle for one key.
pub type PreloadHandle = Shared<BoxFuture<'static, FetchOutcome>>;

/// A background fetch request.
pub struct PreloadTask {
  pub key: String,
  pub fetcher: FetcherFn,
  pub priority: Priority,
  /// Store default when `None`
  pub ttl: Option<Duration>,
}

impl PreloadTask {
  pub fn new(key: impl Into<String>, fetcher: FetcherFn, priority: Priority) -> Self {
    Self {
      key: key.into(),
      fetcher,
      priority,
      ttl: None,
    }
  }

  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = Some(ttl);
    self
  }
}

impl fmt::Debug for PreloadTask {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PreloadTask")
      .field("key", &self.key)
      .field("priority", &self.priority)
      .field("ttl", &self.ttl)
      .finish_non_exhaustive()
  }
}

/// Bounded retry for failed background fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Extra attempts after the first failure
  pub max_retries: u32,
  pub backoff: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: 0,
      backoff: Duration::from_millis(250),
    }
  }
}

/// Counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStatus {
  pub queued: usize,
  pub in_flight: usize,
  pub completed: u64,
  pub failed: u64,
  pub cancelled: u64,
  pub retried: u64,
}

/// Handle returned by [`PreloadScheduler::fetch_now`].
pub struct Pending {
  pub handle: PreloadHandle,
  /// The caller attached to work it did not start
  pub joined: bool,
}

/// Heap slot; stale slots (superseded or already started) are skipped on pop.
#[derive(Debug, PartialEq, Eq)]
struct QueueSlot {
  priority: Priority,
  seq: u64,
  key: String,
}

impl Ord for QueueSlot {
  fn cmp(&self, other: &Self) -> Ordering {
    // Max-heap: higher priority first, then lower sequence number first
    self
      .priority
      .cmp(&other.priority)
      .then_with(|| other.seq.cmp(&self.seq))
  }
}

impl PartialOrd for QueueSlot {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

enum Phase {
  Queued {
    seq: u64,
    priority: Priority,
    fetcher: FetcherFn,
    ttl: Duration,
    tx: oneshot::Sender<FetchOutcome>,
  },
  InFlight,
}

struct PendingFetch {
  /// Identifies this fetch; a finished fetch only writes to the store if it
  /// is still the registered one for its key.
  id: u64,
  handle: PreloadHandle,
  phase: Phase,
}

/// A fetch ready to be spawned.
struct Launch {
  key: String,
  id: u64,
  fetcher: FetcherFn,
  ttl: Duration,
  tx: oneshot::Sender<FetchOutcome>,
  background: bool,
}

#[derive(Default)]
struct SchedulerState {
  queue: BinaryHeap<QueueSlot>,
  pending: HashMap<String, PendingFetch>,
  background_running: usize,
  next_seq: u64,
  next_id: u64,
  pump_scheduled: bool,
  completed: u64,
  failed: u64,
  cancelled: u64,
  retried: u64,
}

impl SchedulerState {
  fn next_seq(&mut self) -> u64 {
    self.next_seq += 1;
    self.next_seq
  }

  fn next_id(&mut self) -> u64 {
    self.next_id += 1;
    self.next_id
  }
}

struct Inner {
  store: CacheStore,
  concurrency: usize,
  retry: RetryPolicy,
  state: Mutex<SchedulerState>,
}

/// Orders and executes background fetches, writing results to the store.
#[derive(Clone)]
pub struct PreloadScheduler {
  inner: Arc<Inner>,
}

impl PreloadScheduler {
  pub fn new(store: CacheStore, config: &PreloadConfig) -> Self {
    Self::with_policy(
      store,
      config.concurrency,
      RetryPolicy {
        max_retries: config.max_retries,
        backoff: config.retry_backoff(),
      },
    )
  }

  pub fn with_policy(store: CacheStore, concurrency: usize, retry: RetryPolicy) -> Self {
    Self {
      inner: Arc::new(Inner {
        store,
        concurrency: concurrency.max(1),
        retry,
        state: Mutex::new(SchedulerState::default()),
      }),
    }
  }

  pub fn store(&self) -> &CacheStore {
    &self.inner.store
  }

  /// Enqueue a background fetch for `key` with the store's default TTL.
  pub fn preload(&self, key: &str, fetcher: FetcherFn, priority: Priority) -> PreloadHandle {
    self.enqueue(PreloadTask::new(key, fetcher, priority))
  }

  /// Enqueue a background fetch.
  ///
  /// If `task.key` already has a pending fetch its handle is returned and no
  /// new work is queued; a queued fetch re-requested at a higher priority is
  /// moved up.
  pub fn enqueue(&self, task: PreloadTask) -> PreloadHandle {
    let ttl = task.ttl.unwrap_or_else(|| self.inner.store.default_ttl());
    let mut guard = self.inner.state();
    let state = &mut *guard;
    let seq = state.next_seq();

    if let Some(pending) = state.pending.get_mut(&task.key) {
      if let Phase::Queued {
        priority,
        seq: queued_seq,
        ..
      } = &mut pending.phase
      {
        if task.priority > *priority {
          debug!(key = %task.key, from = %priority, to = %task.priority, "queued preload promoted");
          *priority = task.priority;
          *queued_seq = seq;
          state.queue.push(QueueSlot {
            priority: task.priority,
            seq,
            key: task.key.clone(),
          });
        }
      }
      return pending.handle.clone();
    }

    let (tx, handle) = outcome_channel(&task.key);
    let id = state.next_id();
    state.queue.push(QueueSlot {
      priority: task.priority,
      seq,
      key: task.key.clone(),
    });
    state.pending.insert(
      task.key.clone(),
      PendingFetch {
        id,
        handle: handle.clone(),
        phase: Phase::Queued {
          seq,
          priority: task.priority,
          fetcher: task.fetcher,
          ttl,
          tx,
        },
      },
    );
    debug!(key = %task.key, priority = %task.priority, "preload queued");

    let schedule_pump = !state.pump_scheduled;
    state.pump_scheduled = true;
    drop(guard);

    // Dispatch on the next turn so that work enqueued together is started
    // by priority rather than by call order.
    if schedule_pump {
      let inner = Arc::clone(&self.inner);
      tokio::spawn(async move { inner.dispatch() });
    }
    handle
  }

  /// Start a fetch for `key` now, or attach to the one already pending.
  ///
  /// A queued background fetch for the key is started immediately with the
  /// given fetcher; foreground fetches do not count against the background
  /// concurrency limit.
  pub fn fetch_now(&self, key: &str, fetcher: FetcherFn, ttl: Duration) -> Pending {
    let mut guard = self.inner.state();
    let state = &mut *guard;

    let (pending, launch) = if let Some(existing) = state.pending.get_mut(key) {
      let handle = existing.handle.clone();
      match std::mem::replace(&mut existing.phase, Phase::InFlight) {
        Phase::Queued { tx, .. } => {
          debug!(key, "queued preload started by a foreground load");
          let launch = Launch {
            key: key.to_string(),
            id: existing.id,
            fetcher,
            ttl,
            tx,
            background: false,
          };
          (
            Pending {
              handle,
              joined: false,
            },
            Some(launch),
          )
        }
        Phase::InFlight => (
          Pending {
            handle,
            joined: true,
          },
          None,
        ),
      }
    } else if let Some(hit) = self.inner.store.peek_value(key) {
      // A fetch settled between the caller's miss and this call
      let handle = future::ready(Ok(hit.value)).boxed().shared();
      (
        Pending {
          handle,
          joined: true,
        },
        None,
      )
    } else {
      let (tx, handle) = outcome_channel(key);
      let id = state.next_id();
      state.pending.insert(
        key.to_string(),
        PendingFetch {
          id,
          handle: handle.clone(),
          phase: Phase::InFlight,
        },
      );
      let launch = Launch {
        key: key.to_string(),
        id,
        fetcher,
        ttl,
        tx,
        background: false,
      };
      (
        Pending {
          handle,
          joined: false,
        },
        Some(launch),
      )
    };
    drop(guard);

    if let Some(launch) = launch {
      self.inner.launch(launch);
    }
    pending
  }

  /// Best-effort cancellation.
  ///
  /// A queued fetch is dropped and its waiters receive
  /// [`FetchError::Cancelled`]. A fetch already in flight runs to completion
  /// and its waiters get the result, but the store never sees it.
  pub fn cancel(&self, key: &str) -> bool {
    let mut guard = self.inner.state();
    let state = &mut *guard;
    let Some(pending) = state.pending.remove(key) else {
      return false;
    };

    state.cancelled += 1;
    match pending.phase {
      Phase::Queued { tx, .. } => {
        debug!(key, "queued preload cancelled");
        let _ = tx.send(Err(FetchError::Cancelled {
          key: key.to_string(),
        }));
      }
      Phase::InFlight => debug!(key, "in-flight fetch detached"),
    }
    true
  }

  /// Detach in-flight fetches whose key matches, so their results are not
  /// written back. Queued fetches are left alone since they have not read
  /// anything yet. Returns the detached keys.
  pub fn detach_in_flight(&self, matches: impl Fn(&str) -> bool) -> Vec<String> {
    let mut state = self.inner.state();
    let keys: Vec<String> = state
      .pending
      .iter()
      .filter(|(k, p)| matches!(p.phase, Phase::InFlight) && matches(k))
      .map(|(k, _)| k.clone())
      .collect();
    for key in &keys {
      state.pending.remove(key);
      debug!(key = %key, "in-flight fetch detached");
    }
    keys
  }

  pub fn is_pending(&self, key: &str) -> bool {
    self.inner.state().pending.contains_key(key)
  }

  pub fn status(&self) -> SchedulerStatus {
    let state = self.inner.state();
    let queued = state
      .pending
      .values()
      .filter(|p| matches!(p.phase, Phase::Queued { .. }))
      .count();
    SchedulerStatus {
      queued,
      in_flight: state.pending.len() - queued,
      completed: state.completed,
      failed: state.failed,
      cancelled: state.cancelled,
      retried: state.retried,
    }
  }
}

impl Inner {
  fn state(&self) -> MutexGuard<'_, SchedulerState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Start queued work, highest priority first, while background slots are free.
  fn dispatch(self: &Arc<Self>) {
    let launches = {
      let mut guard = self.state();
      let state = &mut *guard;
      state.pump_scheduled = false;

      let mut launches = Vec::new();
      while state.background_running < self.concurrency {
        let Some(slot) = state.queue.pop() else {
          break;
        };
        let Some(pending) = state.pending.get_mut(&slot.key) else {
          continue;
        };
        if !matches!(&pending.phase, Phase::Queued { seq, .. } if *seq == slot.seq) {
          continue;
        }
        if let Phase::Queued {
          fetcher, ttl, tx, ..
        } = std::mem::replace(&mut pending.phase, Phase::InFlight)
        {
          state.background_running += 1;
          launches.push(Launch {
            key: slot.key,
            id: pending.id,
            fetcher,
            ttl,
            tx,
            background: true,
          });
        }
      }
      launches
    };

    for launch in launches {
      self.launch(launch);
    }
  }

  fn launch(self: &Arc<Self>, launch: Launch) {
    debug!(key = %launch.key, background = launch.background, "fetch started");
    tokio::spawn(Arc::clone(self).execute(launch));
  }

  async fn execute(self: Arc<Self>, launch: Launch) {
    let Launch {
      key,
      id,
      fetcher,
      ttl,
      tx,
      background,
    } = launch;
    let max_attempts = if background {
      self.retry.max_retries + 1
    } else {
      1
    };

    let mut attempt = 0;
    let outcome = loop {
      attempt += 1;
      // A panicking fetcher must still settle its key and free its slot
      let result = match AssertUnwindSafe(async { fetcher().await }).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(eyre!("fetcher panicked: {}", panic_message(&*panic))),
      };
      match result {
        Ok(value) => break Ok(Arc::new(value)),
        Err(err) if attempt < max_attempts => {
          warn!(key = %key, attempt, error = %err, "background fetch failed, retrying");
          self.state().retried += 1;
          tokio::time::sleep(self.retry.backoff).await;
        }
        Err(err) => break Err(FetchError::failed(&key, &err)),
      }
    };

    {
      let mut guard = self.state();
      let state = &mut *guard;
      let current = state.pending.get(&key).is_some_and(|p| p.id == id);
      if current {
        state.pending.remove(&key);
      }
      if background {
        state.background_running = state.background_running.saturating_sub(1);
      }

      match &outcome {
        Ok(value) if current => {
          state.completed += 1;
          self.store.set(&key, Arc::clone(value), ttl);
          debug!(key = %key, "fetch stored");
        }
        Ok(_) => {
          state.completed += 1;
          debug!(key = %key, "result of detached fetch discarded");
        }
        Err(err) => {
          state.failed += 1;
          warn!(key = %key, error = %err, "fetch failed");
        }
      }
    }

    let _ = tx.send(outcome);
    if background {
      self.dispatch();
    }
  }
}

/// Channel whose receiving side becomes the shared handle for `key`.
fn outcome_channel(key: &str) -> (oneshot::Sender<FetchOutcome>, PreloadHandle) {
  let (tx, rx) = oneshot::channel();
  let key = key.to_string();
  let handle = rx
    .map(move |received| received.unwrap_or_else(|_| Err(FetchError::Cancelled { key })))
    .boxed()
    .shared();
  (tx, handle)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::traits::fetcher_fn;
  use serde_json::json;
  use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

  const TTL: Duration = Duration::from_secs(60);

  fn scheduler(concurrency: usize) -> PreloadScheduler {
    PreloadScheduler::with_policy(CacheStore::default(), concurrency, RetryPolicy::default())
  }

  /// Fetcher that records its name when it starts.
  fn recording(log: Arc<Mutex<Vec<String>>>, name: &str) -> FetcherFn {
    let name = name.to_string();
    fetcher_fn(move || {
      let log = Arc::clone(&log);
      let name = name.clone();
      async move {
        log.lock().unwrap().push(name.clone());
        tokio::task::yield_now().await;
        Ok(name)
      }
    })
  }

  fn counting(counter: Arc<AtomicUsize>, delay: Duration) -> FetcherFn {
    fetcher_fn(move || {
      let counter = Arc::clone(&counter);
      async move {
        counter.fetch_add(1, AtomicOrdering::SeqCst);
        tokio::time::sleep(delay).await;
        Ok(json!({"rows": 3}))
      }
    })
  }

  #[test]
  fn test_priority_parsing() {
    assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
    assert_eq!(" low ".parse::<Priority>().unwrap(), Priority::Low);
    assert_eq!(
      "urgent".parse::<Priority>().unwrap_err(),
      ConfigurationError::UnknownPriority("urgent".into())
    );
    assert!(Priority::High > Priority::Medium && Priority::Medium > Priority::Low);
  }

  #[tokio::test]
  async fn test_high_priority_starts_first() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let s = scheduler(1);

    let low = s.preload("low-key", recording(log.clone(), "low"), Priority::Low);
    let high = s.preload("high-key", recording(log.clone(), "high"), Priority::High);
    let medium = s.preload("medium-key", recording(log.clone(), "medium"), Priority::Medium);

    let _ = futures::future::join3(low, high, medium).await;
    assert_eq!(*log.lock().unwrap(), vec!["high", "medium", "low"]);
  }

  #[tokio::test]
  async fn test_fifo_within_priority() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let s = scheduler(1);

    let handles: Vec<_> = ["a", "b", "c"]
      .iter()
      .map(|k| s.preload(k, recording(log.clone(), k), Priority::Medium))
      .collect();
    futures::future::join_all(handles).await;
    assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
  }

  #[tokio::test]
  async fn test_duplicate_preloads_share_one_fetch() {
    let counter = Arc::new(AtomicUsize::new(0));
    let s = scheduler(2);
    let f = counting(counter.clone(), Duration::from_millis(5));

    let first = s.preload("k", f.clone(), Priority::Low);
    let second = s.preload("k", f.clone(), Priority::High);
    let (a, b) = futures::future::join(first, second).await;

    assert_eq!(counter.load(AtomicOrdering::SeqCst), 1);
    assert_eq!(a.unwrap(), b.unwrap());
    assert!(s.store().is_fresh("k"));
  }

  #[tokio::test]
  async fn test_concurrent_fetch_now_runs_fetcher_once() {
    let counter = Arc::new(AtomicUsize::new(0));
    let s = scheduler(2);
    let f = counting(counter.clone(), Duration::from_millis(5));

    let pendings: Vec<Pending> = (0..10).map(|_| s.fetch_now("k", f.clone(), TTL)).collect();
    assert!(!pendings[0].joined);
    assert!(pendings[1..].iter().all(|p| p.joined));

    let results = futures::future::join_all(pendings.into_iter().map(|p| p.handle)).await;
    assert_eq!(counter.load(AtomicOrdering::SeqCst), 1);
    assert!(results.iter().all(|r| r.is_ok()));
    assert!(!s.is_pending("k"));
  }

  #[tokio::test]
  async fn test_failure_reaches_every_waiter_and_is_not_cached() {
    let s = scheduler(1);
    let f = fetcher_fn(|| async {
      tokio::task::yield_now().await;
      Err::<u32, _>(eyre!("backend unavailable"))
    });

    let a = s.fetch_now("k", f.clone(), TTL);
    let b = s.fetch_now("k", f.clone(), TTL);
    let (ra, rb) = futures::future::join(a.handle, b.handle).await;

    let expected = FetchError::Failed {
      key: "k".into(),
      message: "backend unavailable".into(),
    };
    assert_eq!(ra.unwrap_err(), expected);
    assert_eq!(rb.unwrap_err(), expected);
    assert!(s.store().peek("k").is_none());
    assert_eq!(s.status().failed, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancel_queued_task() {
    let counter = Arc::new(AtomicUsize::new(0));
    let s = scheduler(1);

    let blocker = s.preload(
      "blocker",
      counting(counter.clone(), Duration::from_secs(1)),
      Priority::High,
    );
    let queued = s.preload(
      "queued",
      counting(counter.clone(), Duration::ZERO),
      Priority::Low,
    );

    assert!(s.cancel("queued"));
    assert!(!s.cancel("queued"));
    assert_eq!(
      queued.await.unwrap_err(),
      FetchError::Cancelled {
        key: "queued".into()
      }
    );

    blocker.await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(counter.load(AtomicOrdering::SeqCst), 1);
    assert!(!s.store().is_fresh("queued"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancel_in_flight_discards_result() {
    let counter = Arc::new(AtomicUsize::new(0));
    let s = scheduler(1);
    let handle = s.preload(
      "k",
      counting(counter.clone(), Duration::from_secs(1)),
      Priority::Medium,
    );

    // Let the pump start the fetch
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(s.status().in_flight, 1);

    assert!(s.cancel("k"));
    assert!(handle.await.is_ok());
    assert!(!s.store().is_fresh("k"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_detached_fetch_does_not_overwrite_newer_one() {
    let s = scheduler(2);
    let slow = fetcher_fn(|| async {
      tokio::time::sleep(Duration::from_secs(5)).await;
      Ok("stale")
    });
    let fast = fetcher_fn(|| async { Ok("fresh") });

    let old = s.fetch_now("k", slow, TTL);
    s.detach_in_flight(|k| k == "k");
    let new = s.fetch_now("k", fast, TTL);
    assert!(!new.joined);

    new.handle.await.unwrap();
    old.handle.await.unwrap();
    assert_eq!(*s.store().get("k").unwrap(), json!("fresh"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_retry_policy() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let s = PreloadScheduler::with_policy(
      CacheStore::default(),
      1,
      RetryPolicy {
        max_retries: 2,
        backoff: Duration::from_millis(100),
      },
    );

    let counter = attempts.clone();
    let flaky = fetcher_fn(move || {
      let counter = Arc::clone(&counter);
      async move {
        if counter.fetch_add(1, AtomicOrdering::SeqCst) == 0 {
          Err(eyre!("timeout"))
        } else {
          Ok(7)
        }
      }
    });

    let value = s.preload("k", flaky, Priority::High).await.unwrap();
    assert_eq!(*value, json!(7));
    assert_eq!(attempts.load(AtomicOrdering::SeqCst), 2);
    assert_eq!(s.status().retried, 1);
  }

  #[tokio::test]
  async fn test_requeue_at_higher_priority_promotes() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let s = scheduler(1);

    let a = s.preload("a", recording(log.clone(), "a"), Priority::Medium);
    let b = s.preload("b", recording(log.clone(), "b"), Priority::Low);
    let b_again = s.preload("b", recording(log.clone(), "b-dup"), Priority::High);

    let _ = futures::future::join3(a, b, b_again).await;
    assert_eq!(*log.lock().unwrap(), vec!["b", "a"]);
  }

  fn panicking() -> FetcherFn {
    fetcher_fn(|| async {
      tokio::task::yield_now().await;
      if true {
        panic!("decoder blew up");
      }
      Ok(0u32)
    })
  }

  #[tokio::test]
  async fn test_panicking_fetch_settles_and_key_can_be_fetched_again() {
    let s = scheduler(1);

    let err = s.fetch_now("k", panicking(), TTL).handle.await.unwrap_err();
    match err {
      FetchError::Failed { key, message } => {
        assert_eq!(key, "k");
        assert!(message.contains("decoder blew up"), "{}", message);
      }
      other => panic!("unexpected error: {:?}", other),
    }
    assert!(!s.is_pending("k"));
    assert_eq!(s.status().failed, 1);

    let retry = s.fetch_now("k", fetcher_fn(|| async { Ok("healthy") }), TTL);
    assert!(!retry.joined);
    assert_eq!(*retry.handle.await.unwrap(), json!("healthy"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_panicking_preload_frees_its_slot() {
    let s = scheduler(1);

    let a = s.preload("a", panicking(), Priority::High);
    let b = s.preload("b", fetcher_fn(|| async { Ok("b") }), Priority::Low);

    assert!(matches!(a.await, Err(FetchError::Failed { .. })));
    let settled = tokio::time::timeout(Duration::from_secs(2), b).await;
    assert_eq!(*settled.unwrap().unwrap(), json!("b"));
    assert_eq!(s.status().in_flight, 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_fetch_now_starts_queued_key_immediately() {
    let counter = Arc::new(AtomicUsize::new(0));
    let s = scheduler(1);

    let blocker = s.preload(
      "blocker",
      counting(counter.clone(), Duration::from_secs(10)),
      Priority::High,
    );
    let _queued = s.preload(
      "wanted",
      counting(counter.clone(), Duration::from_secs(10)),
      Priority::Low,
    );
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(s.status().queued, 1);

    let pending = s.fetch_now("wanted", fetcher_fn(|| async { Ok("now") }), TTL);
    assert_eq!(*pending.handle.await.unwrap(), json!("now"));
    assert!(!s.store().is_fresh("blocker"));

    blocker.await.unwrap();
    assert_eq!(counter.load(AtomicOrdering::SeqCst), 1);
  }
}
