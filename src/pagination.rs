//! Offset-based pagination state for collection views.
//!
//! The controller owns page/page-size/sort/filter state and projects it into
//! [`FetchParams`] for the fetch functions that populate the cache. Every
//! operation leaves `1 <= page <= total_pages` with `total_pages >= 1`; out of
//! range input is clamped, and only input with no safe default (a negative
//! total, an unrecognized filter or sort field) is rejected.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::config::PaginationConfig;
use crate::error::ConfigurationError;

/// Upper bound on page size when none is configured.
pub const DEFAULT_MAX_PAGE_SIZE: u64 = 500;

/// Sort direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
  #[default]
  Asc,
  Desc,
}

impl SortOrder {
  pub fn toggled(self) -> Self {
    match self {
      SortOrder::Asc => SortOrder::Desc,
      SortOrder::Desc => SortOrder::Asc,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      SortOrder::Asc => "asc",
      SortOrder::Desc => "desc",
    }
  }
}

impl fmt::Display for SortOrder {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A scalar filter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
  Bool(bool),
  Number(f64),
  Date(NaiveDate),
  Text(String),
}

impl FilterValue {
  pub fn as_text(&self) -> Option<&str> {
    match self {
      FilterValue::Text(s) => Some(s),
      _ => None,
    }
  }

  pub fn as_number(&self) -> Option<f64> {
    match self {
      FilterValue::Number(n) => Some(*n),
      _ => None,
    }
  }

  pub fn as_bool(&self) -> Option<bool> {
    match self {
      FilterValue::Bool(b) => Some(*b),
      _ => None,
    }
  }

  pub fn as_date(&self) -> Option<NaiveDate> {
    match self {
      FilterValue::Date(d) => Some(*d),
      _ => None,
    }
  }
}

impl fmt::Display for FilterValue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      FilterValue::Bool(b) => write!(f, "{}", b),
      FilterValue::Number(n) => write!(f, "{}", n),
      FilterValue::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
      FilterValue::Text(s) => f.write_str(s),
    }
  }
}

impl From<&str> for FilterValue {
  fn from(s: &str) -> Self {
    FilterValue::Text(s.to_string())
  }
}

impl From<String> for FilterValue {
  fn from(s: String) -> Self {
    FilterValue::Text(s)
  }
}

impl From<f64> for FilterValue {
  fn from(n: f64) -> Self {
    FilterValue::Number(n)
  }
}

impl From<i64> for FilterValue {
  fn from(n: i64) -> Self {
    FilterValue::Number(n as f64)
  }
}

impl From<bool> for FilterValue {
  fn from(b: bool) -> Self {
    FilterValue::Bool(b)
  }
}

impl From<NaiveDate> for FilterValue {
  fn from(d: NaiveDate) -> Self {
    FilterValue::Date(d)
  }
}

/// Filter map; ordered so that serialization is canonical.
pub type Filters = BTreeMap<String, FilterValue>;

/// The closed set of filter and sort fields a collection understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterSchema {
  /// Collection name used in error messages
  pub scope: &'static str,
  pub filters: &'static [&'static str],
  pub sort_fields: &'static [&'static str],
  pub default_sort: Option<(&'static str, SortOrder)>,
}

impl FilterSchema {
  pub fn accepts_filter(&self, field: &str) -> bool {
    self.filters.contains(&field)
  }

  pub fn accepts_sort(&self, field: &str) -> bool {
    self.sort_fields.contains(&field)
  }

  fn check_filters(&self, filters: &Filters) -> Result<(), ConfigurationError> {
    match filters.keys().find(|k| !self.accepts_filter(k)) {
      Some(field) => Err(ConfigurationError::UnknownFilter {
        scope: self.scope.to_string(),
        field: field.clone(),
      }),
      None => Ok(()),
    }
  }
}

/// Page bookkeeping reported to the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PaginationState {
  /// 1-based current page
  pub page: u64,
  pub page_size: u64,
  /// Row count reported by the server
  pub total: u64,
  pub total_pages: u64,
}

impl PaginationState {
  fn new(page_size: u64) -> Self {
    Self {
      page: 1,
      page_size,
      total: 0,
      total_pages: 1,
    }
  }

  fn recompute(&mut self) {
    self.total_pages = self.total.div_ceil(self.page_size).max(1);
    self.page = self.page.clamp(1, self.total_pages);
  }

  /// Zero-based offset of the first row on the current page.
  pub fn offset(&self) -> u64 {
    (self.page - 1) * self.page_size
  }
}

/// Authoritative values reported by a completed fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PaginationUpdate {
  pub page: Option<u64>,
  pub page_size: Option<u64>,
  /// Signed because it comes straight from the wire; negative values are rejected.
  pub total: Option<i64>,
}

impl PaginationUpdate {
  pub fn total(total: i64) -> Self {
    Self {
      total: Some(total),
      ..Self::default()
    }
  }
}

/// Parameters handed to a list fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchParams {
  pub page: u64,
  pub page_size: u64,
  pub offset: u64,
  pub limit: u64,
  pub sort_by: Option<String>,
  pub sort_order: SortOrder,
  pub filters: Filters,
}

impl FetchParams {
  /// Deterministic serialization used to build cache keys. Logically
  /// identical parameter sets always serialize identically.
  pub fn canonical(&self) -> String {
    let mut out = format!(
      "page={};size={};sort={}:{}",
      self.page,
      self.page_size,
      self.sort_by.as_deref().unwrap_or(""),
      self.sort_order
    );
    for (key, value) in &self.filters {
      let value = serde_json::to_string(value).unwrap_or_else(|_| value.to_string());
      out.push_str(&format!(";f.{}={}", key, value));
    }
    out
  }
}

/// Pagination, sort and filter state for one collection view.
#[derive(Debug, Clone)]
pub struct PaginationController {
  state: PaginationState,
  sort_by: Option<String>,
  sort_order: SortOrder,
  filters: Filters,
  schema: FilterSchema,
  max_page_size: u64,
}

impl PaginationController {
  pub fn new(schema: FilterSchema, page_size: u64) -> Self {
    Self::with_limits(schema, page_size, DEFAULT_MAX_PAGE_SIZE)
  }

  pub fn with_limits(schema: FilterSchema, page_size: u64, max_page_size: u64) -> Self {
    let max_page_size = max_page_size.max(1);
    let (sort_by, sort_order) = match schema.default_sort {
      Some((field, order)) => (Some(field.to_string()), order),
      None => (None, SortOrder::default()),
    };

    Self {
      state: PaginationState::new(page_size.clamp(1, max_page_size)),
      sort_by,
      sort_order,
      filters: Filters::new(),
      schema,
      max_page_size,
    }
  }

  pub fn from_config(schema: FilterSchema, config: &PaginationConfig) -> Self {
    Self::with_limits(schema, config.default_page_size, config.max_page_size)
  }

  pub fn pagination(&self) -> &PaginationState {
    &self.state
  }

  pub fn sort_by(&self) -> Option<&str> {
    self.sort_by.as_deref()
  }

  pub fn sort_order(&self) -> SortOrder {
    self.sort_order
  }

  pub fn filters(&self) -> &Filters {
    &self.filters
  }

  pub fn schema(&self) -> &FilterSchema {
    &self.schema
  }

  pub fn go_to_page(&mut self, page: u64) {
    self.state.page = page.clamp(1, self.state.total_pages);
  }

  pub fn next_page(&mut self) {
    self.go_to_page(self.state.page.saturating_add(1));
  }

  pub fn prev_page(&mut self) {
    self.go_to_page(self.state.page.saturating_sub(1));
  }

  pub fn first_page(&mut self) {
    self.go_to_page(1);
  }

  pub fn last_page(&mut self) {
    self.go_to_page(self.state.total_pages);
  }

  /// Change the page size, clamped to `[1, max_page_size]`. Always returns to page 1.
  pub fn change_page_size(&mut self, page_size: u64) {
    self.state.page_size = page_size.clamp(1, self.max_page_size);
    self.state.page = 1;
    self.state.recompute();
  }

  /// Replace the filter map. Returns to page 1.
  pub fn update_filters(&mut self, filters: Filters) -> Result<(), ConfigurationError> {
    self.schema.check_filters(&filters)?;
    self.filters = filters;
    self.state.page = 1;
    Ok(())
  }

  /// Set or replace a single filter. Returns to page 1.
  pub fn set_filter(
    &mut self,
    field: &str,
    value: impl Into<FilterValue>,
  ) -> Result<(), ConfigurationError> {
    if !self.schema.accepts_filter(field) {
      return Err(ConfigurationError::UnknownFilter {
        scope: self.schema.scope.to_string(),
        field: field.to_string(),
      });
    }
    self.filters.insert(field.to_string(), value.into());
    self.state.page = 1;
    Ok(())
  }

  pub fn remove_filter(&mut self, field: &str) {
    if self.filters.remove(field).is_some() {
      self.state.page = 1;
    }
  }

  pub fn clear_filters(&mut self) {
    self.filters.clear();
    self.state.page = 1;
  }

  /// Sort by `field`. Returns to page 1.
  pub fn set_sort(&mut self, field: &str, order: SortOrder) -> Result<(), ConfigurationError> {
    if !self.schema.accepts_sort(field) {
      return Err(ConfigurationError::UnknownSortField {
        scope: self.schema.scope.to_string(),
        field: field.to_string(),
      });
    }
    self.sort_by = Some(field.to_string());
    self.sort_order = order;
    self.state.page = 1;
    Ok(())
  }

  /// Sort by `field`, flipping the direction if it is already the sort field.
  pub fn toggle_sort(&mut self, field: &str) -> Result<(), ConfigurationError> {
    let order = if self.sort_by.as_deref() == Some(field) {
      self.sort_order.toggled()
    } else {
      SortOrder::Asc
    };
    self.set_sort(field, order)
  }

  /// Apply values reported by a completed fetch.
  ///
  /// A negative total is rejected and leaves the state untouched.
  pub fn update_pagination(&mut self, update: PaginationUpdate) -> Result<(), ConfigurationError> {
    let total = match update.total {
      Some(t) if t < 0 => return Err(ConfigurationError::NegativeTotal(t)),
      Some(t) => Some(t as u64),
      None => None,
    };

    if let Some(page_size) = update.page_size {
      self.state.page_size = page_size.clamp(1, self.max_page_size);
    }
    if let Some(total) = total {
      self.state.total = total;
    }
    if let Some(page) = update.page {
      self.state.page = page;
    }
    self.state.recompute();
    Ok(())
  }

  pub fn get_params(&self) -> FetchParams {
    FetchParams {
      page: self.state.page,
      page_size: self.state.page_size,
      offset: self.state.offset(),
      limit: self.state.page_size,
      sort_by: self.sort_by.clone(),
      sort_order: self.sort_order,
      filters: self.filters.clone(),
    }
  }

  pub fn has_next_page(&self) -> bool {
    self.state.page < self.state.total_pages
  }

  pub fn has_prev_page(&self) -> bool {
    self.state.page > 1
  }

  /// 1-based inclusive row range shown on the current page, `None` when empty.
  pub fn item_range(&self) -> Option<(u64, u64)> {
    if self.state.total == 0 {
      return None;
    }
    let first = self.state.offset() + 1;
    let last = (self.state.offset() + self.state.page_size).min(self.state.total);
    (first <= last).then_some((first, last))
  }

  /// Back to page 1 with no filters and the schema's default sort.
  pub fn reset(&mut self) {
    let (sort_by, sort_order) = match self.schema.default_sort {
      Some((field, order)) => (Some(field.to_string()), order),
      None => (None, SortOrder::default()),
    };
    self.sort_by = sort_by;
    self.sort_order = sort_order;
    self.filters.clear();
    self.state.page = 1;
  }
}
