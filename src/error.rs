//! Error types surfaced by the data-access core.
//!
//! Fetchers and the binary work with `color_eyre::Result`; the core converts
//! those reports into the typed errors below at its boundaries.

use thiserror::Error;

/// A data operation behind a cache key failed.
///
/// `Clone` so that a single failure can be handed to every caller waiting on
/// the same shared fetch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
  /// The fetcher itself returned an error
  #[error("fetch for `{key}` failed: {message}")]
  Failed { key: String, message: String },

  /// The fetch was removed from the preload queue before it started
  #[error("fetch for `{key}` was cancelled before it started")]
  Cancelled { key: String },

  /// The value could not be converted to or from its cached JSON form
  #[error("cached value for `{key}` could not be converted: {message}")]
  Codec { key: String, message: String },
}

impl FetchError {
  pub fn failed(key: &str, err: &color_eyre::Report) -> Self {
    Self::Failed {
      key: key.to_string(),
      message: err.to_string(),
    }
  }

  pub fn codec(key: &str, err: &serde_json::Error) -> Self {
    Self::Codec {
      key: key.to_string(),
      message: err.to_string(),
    }
  }

  /// Cache key the failed fetch was issued for.
  pub fn key(&self) -> &str {
    match self {
      Self::Failed { key, .. } | Self::Cancelled { key } | Self::Codec { key, .. } => key,
    }
  }
}

/// A sync task failed while invalidating or refreshing cache entries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("sync task #{task_id} ({topic}) failed: {reason}")]
pub struct InvalidationError {
  pub task_id: u64,
  pub topic: String,
  pub reason: String,
}

/// Malformed configuration or caller input that has no safe default.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
  #[error("unknown priority `{0}` (expected high, medium or low)")]
  UnknownPriority(String),

  #[error("total row count cannot be negative (got {0})")]
  NegativeTotal(i64),

  #[error("`{field}` is not a recognized filter for {scope}")]
  UnknownFilter { scope: String, field: String },

  #[error("`{field}` is not a sortable field for {scope}")]
  UnknownSortField { scope: String, field: String },

  #[error("invalid configuration: {0}")]
  Invalid(String),
}
