//! Topic-keyed publish/subscribe for in-process notifications.

use color_eyre::Result;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, warn};

/// Event handler; an error or a panic only affects this handler.
pub type Handler<P> = Arc<dyn Fn(&P) -> Result<()> + Send + Sync>;

struct Registration<P> {
  id: u64,
  handler: Handler<P>,
  active: Arc<AtomicBool>,
}

impl<P> Clone for Registration<P> {
  fn clone(&self) -> Self {
    Self {
      id: self.id,
      handler: Arc::clone(&self.handler),
      active: Arc::clone(&self.active),
    }
  }
}

struct BusState<P> {
  topics: HashMap<String, Vec<Registration<P>>>,
  next_id: u64,
}

/// Outcome of one [`EventBus::emit`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitReport {
  pub delivered: usize,
  pub failed: usize,
}

/// Handle for removing a handler from its bus.
pub struct Subscription {
  topic: String,
  active: Arc<AtomicBool>,
  remove: Box<dyn Fn() + Send + Sync>,
}

impl Subscription {
  pub fn topic(&self) -> &str {
    &self.topic
  }

  pub fn is_active(&self) -> bool {
    self.active.load(Ordering::SeqCst)
  }

  /// Remove the handler. Safe to call more than once, and after the bus is
  /// gone.
  pub fn unsubscribe(&self) {
    if self.active.swap(false, Ordering::SeqCst) {
      (self.remove)();
    }
  }
}

impl std::fmt::Debug for Subscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription")
      .field("topic", &self.topic)
      .field("active", &self.is_active())
      .finish()
  }
}

/// Synchronous event bus.
///
/// `emit` calls the topic's handlers in registration order on the caller's
/// task. Handlers run without the bus lock held, so they may subscribe,
/// unsubscribe or emit themselves. Nothing is buffered: an event emitted with
/// no listeners is gone.
pub struct EventBus<P> {
  state: Arc<Mutex<BusState<P>>>,
}

impl<P> Clone for EventBus<P> {
  fn clone(&self) -> Self {
    Self {
      state: Arc::clone(&self.state),
    }
  }
}

impl<P: 'static> Default for EventBus<P> {
  fn default() -> Self {
    Self::new()
  }
}

impl<P: 'static> EventBus<P> {
  pub fn new() -> Self {
    Self {
      state: Arc::new(Mutex::new(BusState {
        topics: HashMap::new(),
        next_id: 0,
      })),
    }
  }

  fn state(&self) -> MutexGuard<'_, BusState<P>> {
    lock(&self.state)
  }

  /// Register `handler` for `topic`.
  pub fn on<F>(&self, topic: &str, handler: F) -> Subscription
  where
    F: Fn(&P) -> Result<()> + Send + Sync + 'static,
  {
    let active = Arc::new(AtomicBool::new(true));
    let id = {
      let mut state = self.state();
      state.next_id += 1;
      let id = state.next_id;
      state
        .topics
        .entry(topic.to_string())
        .or_default()
        .push(Registration {
          id,
          handler: Arc::new(handler),
          active: Arc::clone(&active),
        });
      id
    };
    debug!(topic, subscription = id, "handler registered");

    let bus: Weak<Mutex<BusState<P>>> = Arc::downgrade(&self.state);
    let owned_topic = topic.to_string();
    let remove = move || {
      let Some(state) = bus.upgrade() else {
        return;
      };
      let mut state = lock(&state);
      if let Some(registrations) = state.topics.get_mut(&owned_topic) {
        registrations.retain(|r| r.id != id);
        if registrations.is_empty() {
          state.topics.remove(&owned_topic);
        }
      }
    };

    Subscription {
      topic: topic.to_string(),
      active,
      remove: Box::new(remove),
    }
  }

  /// Call every handler registered for `topic` with `payload`.
  pub fn emit(&self, topic: &str, payload: &P) -> EmitReport {
    // Snapshot: handlers added during this emit do not see it
    let registrations: Vec<Registration<P>> =
      self.state().topics.get(topic).cloned().unwrap_or_default();

    let mut report = EmitReport::default();
    for registration in registrations {
      if !registration.active.load(Ordering::SeqCst) {
        continue;
      }

      match panic::catch_unwind(AssertUnwindSafe(|| (registration.handler)(payload))) {
        Ok(Ok(())) => report.delivered += 1,
        Ok(Err(err)) => {
          report.failed += 1;
          warn!(topic, subscription = registration.id, error = %err, "event handler failed");
        }
        Err(panic) => {
          report.failed += 1;
          warn!(
            topic,
            subscription = registration.id,
            panic = panic_message(&*panic),
            "event handler panicked"
          );
        }
      }
    }
    report
  }

  pub fn listener_count(&self, topic: &str) -> usize {
    self.state().topics.get(topic).map_or(0, Vec::len)
  }

  /// Topics with at least one handler, sorted.
  pub fn topics(&self) -> Vec<String> {
    let mut topics: Vec<String> = self.state().topics.keys().cloned().collect();
    topics.sort();
    topics
  }
}

fn lock<P>(state: &Mutex<BusState<P>>) -> MutexGuard<'_, BusState<P>> {
  state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> &str {
  if let Some(s) = panic.downcast_ref::<&'static str>() {
    s
  } else if let Some(s) = panic.downcast_ref::<String>() {
    s.as_str()
  } else {
    "unknown panic"
  }
}
