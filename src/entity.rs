//! Entity kinds, mutation events and the topics they are published on.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::pagination::{FilterSchema, SortOrder};

/// Kinds of records the ledger backend stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
  Account,
  Transaction,
  Category,
}

impl EntityKind {
  pub const ALL: [EntityKind; 3] = [
    EntityKind::Account,
    EntityKind::Transaction,
    EntityKind::Category,
  ];

  /// Singular name, used for topics and item keys.
  pub fn as_str(&self) -> &'static str {
    match self {
      EntityKind::Account => "account",
      EntityKind::Transaction => "transaction",
      EntityKind::Category => "category",
    }
  }

  /// Plural name, used for collection keys.
  pub fn collection(&self) -> &'static str {
    match self {
      EntityKind::Account => "accounts",
      EntityKind::Transaction => "transactions",
      EntityKind::Category => "categories",
    }
  }

  /// Prefix shared by every collection-level key of this kind.
  pub fn collection_prefix(&self) -> String {
    format!("{}:", self.collection())
  }

  /// Filter and sort fields list queries for this kind accept.
  pub fn schema(&self) -> FilterSchema {
    match self {
      EntityKind::Account => FilterSchema {
        scope: "accounts",
        filters: &["kind", "archived", "search"],
        sort_fields: &["name", "balance"],
        default_sort: Some(("name", SortOrder::Asc)),
      },
      EntityKind::Transaction => FilterSchema {
        scope: "transactions",
        filters: &[
          "account_id",
          "category_id",
          "min_amount",
          "max_amount",
          "from",
          "to",
          "search",
        ],
        sort_fields: &["date", "amount", "description"],
        default_sort: Some(("date", SortOrder::Desc)),
      },
      EntityKind::Category => FilterSchema {
        scope: "categories",
        filters: &["search"],
        sort_fields: &["name"],
        default_sort: Some(("name", SortOrder::Asc)),
      },
    }
  }
}

impl fmt::Display for EntityKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// What happened to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
  Created,
  Updated,
  Deleted,
}

impl MutationKind {
  pub const ALL: [MutationKind; 3] = [
    MutationKind::Created,
    MutationKind::Updated,
    MutationKind::Deleted,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      MutationKind::Created => "created",
      MutationKind::Updated => "updated",
      MutationKind::Deleted => "deleted",
    }
  }
}

/// Topic name for a mutation, e.g. `transaction:created`.
pub fn topic(entity: EntityKind, kind: MutationKind) -> String {
  format!("{}:{}", entity.as_str(), kind.as_str())
}

/// Payload published after a remote write succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationEvent {
  pub entity: EntityKind,
  pub kind: MutationKind,
  /// Id of the affected record
  pub id: String,
  /// The writer already cached the returned record under its item key
  #[serde(default)]
  pub seeded: bool,
}

impl MutationEvent {
  pub fn new(entity: EntityKind, kind: MutationKind, id: impl Into<String>) -> Self {
    Self {
      entity,
      kind,
      id: id.into(),
      seeded: false,
    }
  }

  pub fn seeded(mut self) -> Self {
    self.seeded = true;
    self
  }

  pub fn created(entity: EntityKind, id: impl Into<String>) -> Self {
    Self::new(entity, MutationKind::Created, id)
  }

  pub fn updated(entity: EntityKind, id: impl Into<String>) -> Self {
    Self::new(entity, MutationKind::Updated, id)
  }

  pub fn deleted(entity: EntityKind, id: impl Into<String>) -> Self {
    Self::new(entity, MutationKind::Deleted, id)
  }

  pub fn topic(&self) -> String {
    topic(self.entity, self.kind)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_topic_names() {
    assert_eq!(
      topic(EntityKind::Transaction, MutationKind::Created),
      "transaction:created"
    );
    assert_eq!(
      MutationEvent::deleted(EntityKind::Category, "c1").topic(),
      "category:deleted"
    );
  }

  #[test]
  fn test_schemas_have_default_sort_in_sort_fields() {
    for entity in EntityKind::ALL {
      let schema = entity.schema();
      if let Some((field, _)) = schema.default_sort {
        assert!(schema.accepts_sort(field), "{} default sort", entity);
      }
    }
  }
}
