//! Event-driven cache invalidation.

mod coordinator;
mod rules;

pub use coordinator::{SyncCoordinator, SyncStatus, SyncTask, SyncTaskStatus};
pub use rules::{KeySelector, RefreshPriority, SyncRules, SyncTarget};
