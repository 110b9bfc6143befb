//! Cache keys for ledger queries.
//!
//! Keys are deterministic: logically identical queries always map to the same
//! string. Collection keys share the `<plural>:` prefix so they can be
//! invalidated together; item keys use the singular name so that refreshing a
//! collection does not drop unrelated item entries.

use sha2::{Digest, Sha256};

use crate::cache::QueryKey;
use crate::entity::EntityKind;
use crate::pagination::FetchParams;

/// Prefix shared by aggregate report keys.
pub const REPORTS_PREFIX: &str = "reports:";

/// Query key types for ledger reads.
#[derive(Clone, Debug, PartialEq)]
pub enum LedgerQueryKey {
  /// Every record of a kind, unpaginated
  All { entity: EntityKind },
  /// One page of a filtered, sorted list
  List {
    entity: EntityKind,
    params: FetchParams,
  },
  /// A single record
  Item { entity: EntityKind, id: String },
  /// An aggregate computed from several kinds
  Report { name: String },
}

impl LedgerQueryKey {
  pub fn all(entity: EntityKind) -> Self {
    Self::All { entity }
  }

  pub fn list(entity: EntityKind, params: FetchParams) -> Self {
    Self::List { entity, params }
  }

  pub fn item(entity: EntityKind, id: impl Into<String>) -> Self {
    Self::Item {
      entity,
      id: id.into(),
    }
  }

  pub fn report(name: impl Into<String>) -> Self {
    Self::Report { name: name.into() }
  }
}

impl QueryKey for LedgerQueryKey {
  fn cache_key(&self) -> String {
    match self {
      Self::All { entity } => format!("{}all", entity.collection_prefix()),
      Self::List { entity, params } => {
        format!(
          "{}list:{}",
          entity.collection_prefix(),
          hash_params(params)
        )
      }
      Self::Item { entity, id } => format!("{}:{}", entity.as_str(), id),
      Self::Report { name } => format!("{}{}", REPORTS_PREFIX, name),
    }
  }

  fn description(&self) -> String {
    match self {
      Self::All { entity } => format!("all {}", entity.collection()),
      Self::List { entity, params } => {
        format!(
          "{} page {} ({} per page)",
          entity.collection(),
          params.page,
          params.page_size
        )
      }
      Self::Item { entity, id } => format!("{} {}", entity, id),
      Self::Report { name } => format!("{} report", name),
    }
  }
}

/// SHA256 of the canonical parameter string, for stable fixed-length keys.
fn hash_params(params: &FetchParams) -> String {
  let mut hasher = Sha256::new();
  hasher.update(params.canonical().as_bytes());
  hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::pagination::{PaginationController, PaginationUpdate};

  fn params_with(filters: &[(&str, &str)]) -> FetchParams {
    let mut c = PaginationController::new(EntityKind::Transaction.schema(), 20);
    c.update_pagination(PaginationUpdate::total(100)).unwrap();
    for (k, v) in filters {
      c.set_filter(k, *v).unwrap();
    }
    c.get_params()
  }

  #[test]
  fn test_fixed_keys() {
    assert_eq!(
      LedgerQueryKey::all(EntityKind::Account).cache_key(),
      "accounts:all"
    );
    assert_eq!(
      LedgerQueryKey::item(EntityKind::Transaction, "t1").cache_key(),
      "transaction:t1"
    );
    assert_eq!(
      LedgerQueryKey::report("balances").cache_key(),
      "reports:balances"
    );
  }

  #[test]
  fn test_list_keys_are_canonical() {
    let a = LedgerQueryKey::list(
      EntityKind::Transaction,
      params_with(&[("search", "rent"), ("account_id", "a1")]),
    );
    let b = LedgerQueryKey::list(
      EntityKind::Transaction,
      params_with(&[("account_id", "a1"), ("search", "rent")]),
    );
    let c = LedgerQueryKey::list(
      EntityKind::Transaction,
      params_with(&[("account_id", "a2")]),
    );

    assert_eq!(a.cache_key(), b.cache_key());
    assert_ne!(a.cache_key(), c.cache_key());
    assert!(a.cache_key().starts_with("transactions:list:"));
  }

  #[test]
  fn test_item_keys_are_outside_collection_prefix() {
    let item = LedgerQueryKey::item(EntityKind::Transaction, "t1").cache_key();
    assert!(!item.starts_with(&EntityKind::Transaction.collection_prefix()));
  }
}
