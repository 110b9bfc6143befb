//! Auto-sync: turns mutation events into cache invalidations.
//!
//! The coordinator subscribes to every `<entity>:<kind>` topic, turns each
//! event into a [`SyncTask`] and drains the tasks one at a time on a single
//! worker. A task invalidates its targets through the cache layer and, for
//! eagerly refreshed targets, waits for the re-warm of every invalidated key
//! that has a registered fetcher.

use futures::future::join_all;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};

use super::rules::{KeySelector, RefreshPriority, SyncRules, SyncTarget};
use crate::cache::{CacheLayer, Priority};
use crate::config::SyncConfig;
use crate::entity::{topic, MutationEvent, MutationKind};
use crate::error::InvalidationError;
use crate::event::{EventBus, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncTaskStatus {
  Pending,
  Processing,
  Done,
  Failed,
}

/// One queued invalidation, created per received event.
#[derive(Debug, Clone, Serialize)]
pub struct SyncTask {
  pub id: u64,
  pub topic: String,
  pub event: MutationEvent,
  pub targets: Vec<SyncTarget>,
  pub status: SyncTaskStatus,
  pub error: Option<String>,
  /// Keys removed from the cache
  pub invalidated: Vec<String>,
  /// Keys fetched again before the task finished
  pub refreshed: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
  pub is_initialized: bool,
  pub queue_length: usize,
  pub is_processing: bool,
  pub processed: u64,
  pub failed: u64,
}

#[derive(Default)]
struct SyncState {
  initialized: bool,
  processing: bool,
  queue: VecDeque<SyncTask>,
  subscriptions: Vec<Subscription>,
  /// Bumped on start and stop; a worker exits once it sees a newer value
  generation: u64,
  next_task_id: u64,
  history: VecDeque<SyncTask>,
  processed: u64,
  failed: u64,
}

struct Inner {
  bus: EventBus<MutationEvent>,
  layer: CacheLayer,
  rules: SyncRules,
  history_limit: usize,
  state: Mutex<SyncState>,
  wake: Notify,
  idle: Notify,
}

/// Keeps cached reads consistent with writes announced on the event bus.
#[derive(Clone)]
pub struct SyncCoordinator {
  inner: Arc<Inner>,
}

impl SyncCoordinator {
  pub fn new(bus: EventBus<MutationEvent>, layer: CacheLayer, rules: SyncRules) -> Self {
    Self::with_history_limit(bus, layer, rules, SyncConfig::default().history_limit)
  }

  pub fn with_history_limit(
    bus: EventBus<MutationEvent>,
    layer: CacheLayer,
    rules: SyncRules,
    history_limit: usize,
  ) -> Self {
    Self {
      inner: Arc::new(Inner {
        bus,
        layer,
        rules,
        history_limit,
        state: Mutex::new(SyncState::default()),
        wake: Notify::new(),
        idle: Notify::new(),
      }),
    }
  }

  pub fn from_config(bus: EventBus<MutationEvent>, layer: CacheLayer, config: &SyncConfig) -> Self {
    Self::with_history_limit(bus, layer, SyncRules::from_config(config), config.history_limit)
  }

  /// Subscribe to mutation topics and spawn the worker. Calling it again
  /// while started does nothing.
  pub fn start(&self) {
    let generation = {
      let mut state = self.inner.state();
      if state.initialized {
        return;
      }
      state.initialized = true;
      state.generation += 1;
      state.generation
    };

    let mut subscriptions = Vec::new();
    for entity in self.inner.rules.entities() {
      for kind in MutationKind::ALL {
        let topic = topic(entity, kind);
        let coordinator = Arc::downgrade(&self.inner);
        let queued_topic = topic.clone();
        subscriptions.push(self.inner.bus.on(&topic, move |event: &MutationEvent| {
          if let Some(inner) = coordinator.upgrade() {
            inner.enqueue(&queued_topic, event.clone());
          }
          Ok(())
        }));
      }
    }
    let topics = subscriptions.len();
    self.inner.state().subscriptions = subscriptions;

    tokio::spawn(Arc::clone(&self.inner).run(generation));
    info!(topics, "auto-sync started");
  }

  /// Unsubscribe and drop queued tasks. A task already being processed
  /// finishes in the background. Calling it again does nothing.
  pub fn stop(&self) {
    let (subscriptions, dropped) = {
      let mut state = self.inner.state();
      if !state.initialized {
        return;
      }
      state.initialized = false;
      state.processing = false;
      state.generation += 1;
      let dropped = state.queue.len();
      state.queue.clear();
      (std::mem::take(&mut state.subscriptions), dropped)
    };

    for subscription in &subscriptions {
      subscription.unsubscribe();
    }
    self.inner.wake.notify_one();
    self.inner.idle.notify_waiters();
    info!(dropped, "auto-sync stopped");
  }

  pub fn status(&self) -> SyncStatus {
    let state = self.inner.state();
    SyncStatus {
      is_initialized: state.initialized,
      queue_length: state.queue.len(),
      is_processing: state.processing,
      processed: state.processed,
      failed: state.failed,
    }
  }

  /// Recently finished tasks, oldest first.
  pub fn history(&self) -> Vec<SyncTask> {
    self.inner.state().history.iter().cloned().collect()
  }

  /// Resolve once the queue is drained and no task is running, or the
  /// coordinator is stopped.
  pub async fn wait_idle(&self) {
    loop {
      let notified = self.inner.idle.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();

      if self.inner.is_idle() {
        return;
      }
      notified.await;
    }
  }
}

impl Inner {
  fn state(&self) -> MutexGuard<'_, SyncState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn is_idle(&self) -> bool {
    let state = self.state();
    !state.initialized || (state.queue.is_empty() && !state.processing)
  }

  fn enqueue(&self, topic: &str, event: MutationEvent) {
    let targets = self.rules.plan(&event);
    let id = {
      let mut state = self.state();
      if !state.initialized {
        return;
      }
      state.next_task_id += 1;
      let id = state.next_task_id;
      state.queue.push_back(SyncTask {
        id,
        topic: topic.to_string(),
        event,
        targets,
        status: SyncTaskStatus::Pending,
        error: None,
        invalidated: Vec::new(),
        refreshed: Vec::new(),
      });
      id
    };
    debug!(task_id = id, topic, "sync task queued");
    self.wake.notify_one();
  }

  async fn run(self: Arc<Self>, generation: u64) {
    loop {
      let next = {
        let mut state = self.state();
        if state.generation != generation {
          break;
        }
        let next = state.queue.pop_front();
        state.processing = next.is_some();
        next
      };

      match next {
        Some(mut task) => {
          task.status = SyncTaskStatus::Processing;
          let task = self.process(task).await;
          self.record(generation, task);
        }
        None => {
          self.idle.notify_waiters();
          self.wake.notified().await;
        }
      }
    }
    debug!(generation, "sync worker exited");
  }

  #[instrument(skip_all, fields(task_id = task.id, topic = %task.topic))]
  async fn process(&self, mut task: SyncTask) -> SyncTask {
    match self.apply(&mut task).await {
      Ok(()) => {
        task.status = SyncTaskStatus::Done;
        debug!(
          invalidated = task.invalidated.len(),
          refreshed = task.refreshed.len(),
          "sync task done"
        );
      }
      Err(err) => {
        warn!(error = %err, "sync task failed");
        task.status = SyncTaskStatus::Failed;
        task.error = Some(err.to_string());
      }
    }
    task
  }

  async fn apply(&self, task: &mut SyncTask) -> Result<(), InvalidationError> {
    let mut refreshes = Vec::new();
    for target in &task.targets {
      let removed = match &target.selector {
        KeySelector::Exact(key) if self.layer.invalidate(key) => vec![key.clone()],
        KeySelector::Exact(_) => Vec::new(),
        KeySelector::Prefix(prefix) => self.layer.invalidate_prefix(prefix),
      };

      if target.refresh == RefreshPriority::High {
        for key in &removed {
          if let Some(handle) = self.layer.refresh(key, Priority::High) {
            refreshes.push((key.clone(), handle));
          }
        }
      }
      task.invalidated.extend(removed);
    }

    let (keys, handles): (Vec<String>, Vec<_>) = refreshes.into_iter().unzip();
    let mut failures = Vec::new();
    for (key, result) in keys.into_iter().zip(join_all(handles).await) {
      match result {
        Ok(_) => task.refreshed.push(key),
        Err(err) => failures.push(err.to_string()),
      }
    }

    if failures.is_empty() {
      Ok(())
    } else {
      Err(InvalidationError {
        task_id: task.id,
        topic: task.topic.clone(),
        reason: failures.join("; "),
      })
    }
  }

  fn record(&self, generation: u64, task: SyncTask) {
    let mut state = self.state();
    // A worker from before a restart must not clear the new worker's flag
    if state.generation == generation {
      state.processing = false;
    }
    if task.status == SyncTaskStatus::Failed {
      state.failed += 1;
    } else {
      state.processed += 1;
    }
    state.history.push_back(task);
    while state.history.len() > self.history_limit {
      state.history.pop_front();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{fetcher_fn, CacheStore, FetcherFn, LoadOptions, PreloadScheduler, RetryPolicy};
  use crate::entity::EntityKind;
  use color_eyre::eyre::eyre;
  use serde_json::Value;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  struct Fixture {
    bus: EventBus<MutationEvent>,
    layer: CacheLayer,
    coordinator: SyncCoordinator,
  }

  fn fixture() -> Fixture {
    let store = CacheStore::default();
    let scheduler = PreloadScheduler::with_policy(store.clone(), 2, RetryPolicy::default());
    let layer = CacheLayer::new(store, scheduler);
    let bus = EventBus::new();
    let coordinator = SyncCoordinator::new(bus.clone(), layer.clone(), SyncRules::default());
    Fixture {
      bus,
      layer,
      coordinator,
    }
  }

  fn counting(counter: Arc<AtomicUsize>) -> FetcherFn {
    fetcher_fn(move || {
      let counter = Arc::clone(&counter);
      async move { Ok(counter.fetch_add(1, Ordering::SeqCst) + 1) }
    })
  }

  async fn warm(layer: &CacheLayer, key: &str, fetcher: FetcherFn) {
    let opts = LoadOptions::default().preload(Priority::Medium);
    layer.load::<Value>(key, fetcher, opts).await.unwrap();
  }

  fn emit(bus: &EventBus<MutationEvent>, event: MutationEvent) {
    bus.emit(&event.topic(), &event);
  }

  #[tokio::test]
  async fn test_created_transaction_refreshes_transaction_lists() {
    let f = fixture();
    let list_fetches = Arc::new(AtomicUsize::new(0));
    warm(&f.layer, "transactions:all", counting(list_fetches.clone())).await;
    f.layer
      .store()
      .set_value("categories:all", &vec!["food"], Duration::from_secs(60))
      .unwrap();

    f.coordinator.start();
    emit(&f.bus, MutationEvent::created(EntityKind::Transaction, "t1"));
    assert_eq!(f.coordinator.status().queue_length, 1);

    f.coordinator.wait_idle().await;

    let status = f.coordinator.status();
    assert_eq!(status.queue_length, 0);
    assert_eq!(status.processed, 1);
    assert_eq!(list_fetches.load(Ordering::SeqCst), 2);
    assert_eq!(
      f.layer.store().get_as::<usize>("transactions:all").unwrap(),
      Some(2)
    );
    assert!(f.layer.store().is_fresh("categories:all"));

    let task = &f.coordinator.history()[0];
    assert_eq!(task.status, SyncTaskStatus::Done);
    assert_eq!(task.topic, "transaction:created");
    assert_eq!(task.refreshed, vec!["transactions:all"]);
  }

  #[tokio::test]
  async fn test_low_priority_targets_stay_invalidated() {
    let f = fixture();
    let fetches = Arc::new(AtomicUsize::new(0));
    warm(&f.layer, "reports:balances", counting(fetches.clone())).await;

    f.coordinator.start();
    emit(&f.bus, MutationEvent::updated(EntityKind::Account, "a1"));
    f.coordinator.wait_idle().await;

    assert!(!f.layer.store().is_fresh("reports:balances"));
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
    assert_eq!(
      f.coordinator.history()[0].invalidated,
      vec!["reports:balances"]
    );
  }

  #[tokio::test]
  async fn test_tasks_drain_in_arrival_order() {
    let f = fixture();
    f.coordinator.start();
    for id in ["t1", "t2", "t3"] {
      emit(&f.bus, MutationEvent::updated(EntityKind::Transaction, id));
    }
    emit(&f.bus, MutationEvent::deleted(EntityKind::Category, "c1"));
    f.coordinator.wait_idle().await;

    let history = f.coordinator.history();
    let ids: Vec<&str> = history.iter().map(|t| t.event.id.as_str()).collect();
    assert_eq!(ids, vec!["t1", "t2", "t3", "c1"]);
    assert!(history.windows(2).all(|w| w[0].id < w[1].id));
  }

  #[tokio::test]
  async fn test_failed_refresh_marks_task_and_queue_continues() {
    let f = fixture();
    let broken = fetcher_fn(|| async { Err::<u32, _>(eyre!("backend down")) });
    f.layer.store().set_value("accounts:all", &1, Duration::from_secs(60)).unwrap();
    f.layer.warm("accounts:all", broken, Priority::Low);

    f.coordinator.start();
    emit(&f.bus, MutationEvent::updated(EntityKind::Account, "a1"));
    emit(&f.bus, MutationEvent::updated(EntityKind::Category, "c1"));
    f.coordinator.wait_idle().await;

    let status = f.coordinator.status();
    assert_eq!((status.processed, status.failed), (1, 1));

    let history = f.coordinator.history();
    assert_eq!(history[0].status, SyncTaskStatus::Failed);
    assert!(history[0]
      .error
      .as_deref()
      .is_some_and(|e| e.contains("backend down")));
    assert_eq!(history[1].status, SyncTaskStatus::Done);
  }

  #[tokio::test]
  async fn test_start_and_stop_are_idempotent() {
    let f = fixture();
    f.coordinator.start();
    f.coordinator.start();
    assert_eq!(f.bus.listener_count("account:created"), 1);
    assert!(f.coordinator.status().is_initialized);

    f.coordinator.stop();
    f.coordinator.stop();
    assert_eq!(f.bus.listener_count("account:created"), 0);
    assert!(f.bus.topics().is_empty());

    emit(&f.bus, MutationEvent::created(EntityKind::Account, "a1"));
    assert_eq!(f.coordinator.status(), SyncStatus::default());
  }

  #[tokio::test(start_paused = true)]
  async fn test_restart_keeps_new_worker_state() {
    let f = fixture();
    let slow = |secs: u64| {
      fetcher_fn(move || async move {
        tokio::time::sleep(Duration::from_secs(secs)).await;
        Ok(secs)
      })
    };
    warm(&f.layer, "accounts:all", slow(1)).await;
    warm(&f.layer, "categories:all", slow(5)).await;

    f.coordinator.start();
    emit(&f.bus, MutationEvent::updated(EntityKind::Account, "a1"));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(f.coordinator.status().is_processing);

    // Restart while the account task is still refreshing
    f.coordinator.stop();
    assert!(!f.coordinator.status().is_processing);
    f.coordinator.start();
    emit(&f.bus, MutationEvent::updated(EntityKind::Category, "c1"));
    tokio::time::sleep(Duration::from_millis(10)).await;

    // The old task finishes while the new one is still running
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(f.coordinator.history().len(), 1);
    assert!(f.coordinator.status().is_processing);

    f.coordinator.wait_idle().await;
    let status = f.coordinator.status();
    assert!(!status.is_processing);
    assert_eq!(status.processed, 2);
  }

  #[tokio::test]
  async fn test_history_is_bounded() {
    let store = CacheStore::default();
    let layer = CacheLayer::new(
      store.clone(),
      PreloadScheduler::with_policy(store, 1, RetryPolicy::default()),
    );
    let bus = EventBus::new();
    let coordinator = SyncCoordinator::with_history_limit(bus.clone(), layer, SyncRules::default(), 2);

    coordinator.start();
    for id in ["a", "b", "c"] {
      emit(&bus, MutationEvent::deleted(EntityKind::Account, id));
    }
    coordinator.wait_idle().await;

    let ids: Vec<String> = coordinator.history().into_iter().map(|t| t.event.id).collect();
    assert_eq!(ids, vec!["b", "c"]);
    assert_eq!(coordinator.status().processed, 3);
  }
}
