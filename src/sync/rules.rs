//! Which cache keys a mutation invalidates, and how eagerly to refresh them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::cache::QueryKey;
use crate::config::SyncConfig;
use crate::entity::{EntityKind, MutationEvent, MutationKind};
use crate::keys::{LedgerQueryKey, REPORTS_PREFIX};

/// Refresh class of an invalidated target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshPriority {
  /// Re-warm right away
  High,
  /// Leave for the next read
  #[default]
  Low,
}

impl fmt::Display for RefreshPriority {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RefreshPriority::High => f.write_str("high"),
      RefreshPriority::Low => f.write_str("low"),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "match", content = "key", rename_all = "lowercase")]
pub enum KeySelector {
  Exact(String),
  Prefix(String),
}

impl fmt::Display for KeySelector {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      KeySelector::Exact(k) => f.write_str(k),
      KeySelector::Prefix(p) => write!(f, "{}*", p),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncTarget {
  pub selector: KeySelector,
  pub refresh: RefreshPriority,
}

impl SyncTarget {
  pub fn exact(key: impl Into<String>, refresh: RefreshPriority) -> Self {
    Self {
      selector: KeySelector::Exact(key.into()),
      refresh,
    }
  }

  pub fn prefix(prefix: impl Into<String>, refresh: RefreshPriority) -> Self {
    Self {
      selector: KeySelector::Prefix(prefix.into()),
      refresh,
    }
  }
}

/// Mapping from entity kind to the key groups its mutations affect.
#[derive(Debug, Clone)]
pub struct SyncRules {
  table: BTreeMap<EntityKind, Vec<SyncTarget>>,
}

impl Default for SyncRules {
  fn default() -> Self {
    use RefreshPriority::{High, Low};

    let accounts = EntityKind::Account.collection_prefix();
    let transactions = EntityKind::Transaction.collection_prefix();
    let categories = EntityKind::Category.collection_prefix();

    let mut table = BTreeMap::new();
    table.insert(
      EntityKind::Account,
      vec![
        SyncTarget::prefix(accounts.clone(), High),
        SyncTarget::prefix(REPORTS_PREFIX, Low),
      ],
    );
    // Transactions move balances, so account lists and records go stale with them
    table.insert(
      EntityKind::Transaction,
      vec![
        SyncTarget::prefix(transactions.clone(), High),
        SyncTarget::prefix(accounts, High),
        SyncTarget::prefix(format!("{}:", EntityKind::Account.as_str()), High),
        SyncTarget::prefix(REPORTS_PREFIX, Low),
      ],
    );
    table.insert(
      EntityKind::Category,
      vec![
        SyncTarget::prefix(categories, High),
        SyncTarget::prefix(transactions, Low),
        SyncTarget::prefix(REPORTS_PREFIX, Low),
      ],
    );
    Self { table }
  }
}

impl SyncRules {
  /// Built-in table extended with the configured rules.
  pub fn from_config(config: &SyncConfig) -> Self {
    config
      .extra_rules
      .iter()
      .fold(Self::default(), |rules, rule| {
        rules.with_rule(rule.entity, SyncTarget::prefix(rule.prefix.clone(), rule.refresh))
      })
  }

  pub fn with_rule(mut self, entity: EntityKind, target: SyncTarget) -> Self {
    let targets = self.table.entry(entity).or_default();
    if !targets.contains(&target) {
      targets.push(target);
    }
    self
  }

  /// Entities the coordinator subscribes to.
  pub fn entities(&self) -> Vec<EntityKind> {
    let mut entities: Vec<EntityKind> = self.table.keys().copied().collect();
    for entity in EntityKind::ALL {
      if !entities.contains(&entity) {
        entities.push(entity);
      }
    }
    entities.sort();
    entities
  }

  pub fn targets(&self, entity: EntityKind) -> &[SyncTarget] {
    self.table.get(&entity).map(Vec::as_slice).unwrap_or(&[])
  }

  /// Targets for one mutation: the record's own key first, then the table's
  /// rows for its kind.
  ///
  /// An updated record is refreshed eagerly. A created record has no cached
  /// item yet and a deleted one cannot be refetched, so both stay lazy. A
  /// seeded event already holds the authoritative record under its item key,
  /// which is left in place.
  pub fn plan(&self, event: &MutationEvent) -> Vec<SyncTarget> {
    let item = (!event.seeded).then(|| {
      let refresh = match event.kind {
        MutationKind::Updated => RefreshPriority::High,
        MutationKind::Created | MutationKind::Deleted => RefreshPriority::Low,
      };
      let key = LedgerQueryKey::item(event.entity, event.id.clone()).cache_key();
      SyncTarget::exact(key, refresh)
    });

    item
      .into_iter()
      .chain(self.targets(event.entity).iter().cloned())
      .collect()
  }
}
