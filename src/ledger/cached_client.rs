//! Cached ledger client that wraps MemoryBackend with transparent caching.

use color_eyre::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::cache::{fetcher_fn, CacheLayer, LoadOptions, Priority, QueryKey};
use crate::entity::{EntityKind, MutationEvent};
use crate::event::{EmitReport, EventBus};
use crate::keys::LedgerQueryKey;
use crate::pagination::FetchParams;

use super::backend::MemoryBackend;
use super::types::{
  Account, BalanceReport, Category, NewAccount, NewTransaction, Page, Transaction,
};

/// Pages go stale quickly once other clients write.
const LIST_TTL: Duration = Duration::from_secs(60);
const REPORT_TTL: Duration = Duration::from_secs(30);

/// Name of the balances report key.
pub const BALANCES_REPORT: &str = "balances";

/// Ledger client with transparent caching support.
///
/// This wraps the backend and provides the same API. Reads go through the
/// cache layer and are registered for refresh; writes go to the backend,
/// seed the record's item key with the returned value and then announce the
/// mutation on the event bus.
#[derive(Clone)]
pub struct CachedLedgerClient {
  inner: MemoryBackend,
  cache: CacheLayer,
  bus: EventBus<MutationEvent>,
}

impl CachedLedgerClient {
  pub fn new(inner: MemoryBackend, cache: CacheLayer, bus: EventBus<MutationEvent>) -> Self {
    Self { inner, cache, bus }
  }

  pub fn backend(&self) -> &MemoryBackend {
    &self.inner
  }

  pub fn cache(&self) -> &CacheLayer {
    &self.cache
  }

  async fn read<T, F, Fut>(&self, key: LedgerQueryKey, opts: LoadOptions, fetch: F) -> Result<T>
  where
    T: Serialize + DeserializeOwned,
    F: Fn(MemoryBackend) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let inner = self.inner.clone();
    let fetcher = fetcher_fn(move || fetch(inner.clone()));
    let result = self.cache.load::<T>(&key.cache_key(), fetcher, opts).await?;
    debug!(query = %key.description(), source = ?result.source, "ledger read");
    Ok(result.data)
  }

  /// Every account, archived ones included.
  pub async fn all_accounts(&self) -> Result<Vec<Account>> {
    let opts = LoadOptions::default().preload(Priority::High);
    self
      .read(LedgerQueryKey::all(EntityKind::Account), opts, |backend| async move {
        backend.all_accounts().await
      })
      .await
  }

  pub async fn list_accounts(&self, params: &FetchParams) -> Result<Page<Account>> {
    let key = LedgerQueryKey::list(EntityKind::Account, params.clone());
    let opts = LoadOptions::default().ttl(LIST_TTL).preload(Priority::Medium);
    let params = params.clone();
    self
      .read(key, opts, move |backend| {
        let params = params.clone();
        async move { backend.list_accounts(&params).await }
      })
      .await
  }

  pub async fn get_account(&self, id: &str) -> Result<Account> {
    let key = LedgerQueryKey::item(EntityKind::Account, id);
    let opts = LoadOptions::default().preload(Priority::Medium);
    let id = id.to_string();
    self
      .read(key, opts, move |backend| {
        let id = id.clone();
        async move { backend.get_account(&id).await }
      })
      .await
  }

  pub async fn list_transactions(&self, params: &FetchParams) -> Result<Page<Transaction>> {
    let key = LedgerQueryKey::list(EntityKind::Transaction, params.clone());
    let opts = LoadOptions::default().ttl(LIST_TTL).preload(Priority::Medium);
    let params = params.clone();
    self
      .read(key, opts, move |backend| {
        let params = params.clone();
        async move { backend.list_transactions(&params).await }
      })
      .await
  }

  pub async fn get_transaction(&self, id: &str) -> Result<Transaction> {
    let key = LedgerQueryKey::item(EntityKind::Transaction, id);
    let opts = LoadOptions::default().preload(Priority::Low);
    let id = id.to_string();
    self
      .read(key, opts, move |backend| {
        let id = id.clone();
        async move { backend.get_transaction(&id).await }
      })
      .await
  }

  pub async fn list_categories(&self) -> Result<Vec<Category>> {
    let opts = LoadOptions::default().preload(Priority::Medium);
    self
      .read(LedgerQueryKey::all(EntityKind::Category), opts, |backend| async move {
        backend.list_categories().await
      })
      .await
  }

  pub async fn balance_report(&self) -> Result<BalanceReport> {
    let opts = LoadOptions::default().ttl(REPORT_TTL).preload(Priority::Low);
    self
      .read(LedgerQueryKey::report(BALANCES_REPORT), opts, |backend| async move {
        backend.balance_report().await
      })
      .await
  }

  /// Write a record under its item key and announce the mutation.
  fn settle<T: Serialize>(&self, event: MutationEvent, record: Option<&T>) -> Result<EmitReport> {
    let event = match record {
      Some(record) => {
        let key = LedgerQueryKey::item(event.entity, event.id.clone()).cache_key();
        let store = self.cache.store();
        store.set_value(&key, record, store.default_ttl())?;
        event.seeded()
      }
      None => event,
    };
    let report = self.bus.emit(&event.topic(), &event);
    debug!(topic = %event.topic(), delivered = report.delivered, "mutation published");
    Ok(report)
  }

  pub async fn create_account(&self, new: NewAccount) -> Result<Account> {
    let account = self.inner.create_account(new).await?;
    self.settle(
      MutationEvent::created(EntityKind::Account, account.id.clone()),
      Some(&account),
    )?;
    Ok(account)
  }

  pub async fn update_account(
    &self,
    id: &str,
    name: Option<String>,
    archived: Option<bool>,
  ) -> Result<Account> {
    let account = self.inner.update_account(id, name, archived).await?;
    self.settle(
      MutationEvent::updated(EntityKind::Account, account.id.clone()),
      Some(&account),
    )?;
    Ok(account)
  }

  pub async fn create_transaction(&self, new: NewTransaction) -> Result<Transaction> {
    let tx = self.inner.create_transaction(new).await?;
    self.settle(
      MutationEvent::created(EntityKind::Transaction, tx.id.clone()),
      Some(&tx),
    )?;
    Ok(tx)
  }

  pub async fn update_transaction(&self, id: &str, new: NewTransaction) -> Result<Transaction> {
    let tx = self.inner.update_transaction(id, new).await?;
    self.settle(
      MutationEvent::updated(EntityKind::Transaction, tx.id.clone()),
      Some(&tx),
    )?;
    Ok(tx)
  }

  pub async fn delete_transaction(&self, id: &str) -> Result<Transaction> {
    let tx = self.inner.delete_transaction(id).await?;
    self.settle::<Transaction>(MutationEvent::deleted(EntityKind::Transaction, id), None)?;
    Ok(tx)
  }

  pub async fn create_category(&self, name: &str) -> Result<Category> {
    let category = self.inner.create_category(name).await?;
    self.settle(
      MutationEvent::created(EntityKind::Category, category.id.clone()),
      Some(&category),
    )?;
    Ok(category)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheStore, PreloadScheduler, RetryPolicy};
  use crate::entity::MutationKind;
  use crate::ledger::types::AccountKind;
  use crate::pagination::PaginationController;
  use crate::sync::{SyncCoordinator, SyncRules};
  use chrono::NaiveDate;
  use std::sync::{Arc, Mutex};

  fn client() -> CachedLedgerClient {
    let backend = MemoryBackend::default();
    backend.seed_demo().unwrap();
    let store = CacheStore::default();
    let layer = CacheLayer::new(
      store.clone(),
      PreloadScheduler::with_policy(store, 2, RetryPolicy::default()),
    );
    CachedLedgerClient::new(backend, layer, EventBus::new())
  }

  fn lunch(account_id: &str) -> NewTransaction {
    NewTransaction {
      account_id: account_id.into(),
      category_id: Some("c1".into()),
      amount_cents: -1_250,
      description: "Lunch".into(),
      date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
    }
  }

  #[tokio::test]
  async fn test_repeated_reads_hit_the_cache() {
    let client = client();
    let first = client.all_accounts().await.unwrap();
    let second = client.all_accounts().await.unwrap();

    assert_eq!(first, second);
    assert_eq!(client.backend().call_count("all_accounts"), 1);
    assert_eq!(client.cache().stats().hits, 1);
  }

  #[tokio::test]
  async fn test_pages_are_cached_per_params() {
    let client = client();
    let mut pager = PaginationController::new(EntityKind::Transaction.schema(), 10);

    let page1 = client.list_transactions(&pager.get_params()).await.unwrap();
    pager
      .update_pagination(crate::pagination::PaginationUpdate::total(page1.total))
      .unwrap();
    pager.next_page();
    let page2 = client.list_transactions(&pager.get_params()).await.unwrap();
    pager.prev_page();
    let again = client.list_transactions(&pager.get_params()).await.unwrap();

    assert_ne!(page1.items[0].id, page2.items[0].id);
    assert_eq!(page1, again);
    assert_eq!(client.backend().call_count("list_transactions"), 2);
  }

  #[tokio::test]
  async fn test_write_seeds_item_key_and_publishes() {
    let client = client();
    let coordinator = SyncCoordinator::new(
      client.bus.clone(),
      client.cache().clone(),
      SyncRules::default(),
    );
    coordinator.start();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    let _sub = client.bus.on("transaction:created", move |e: &MutationEvent| {
      log.lock().unwrap().push(e.clone());
      Ok(())
    });

    let tx = client.create_transaction(lunch("a1")).await.unwrap();
    assert_eq!(
      *seen.lock().unwrap(),
      vec![MutationEvent::new(EntityKind::Transaction, MutationKind::Created, tx.id.clone()).seeded()]
    );
    coordinator.wait_idle().await;

    // The seeded record survives the sync pass
    let cached = client.get_transaction(&tx.id).await.unwrap();
    assert_eq!(cached, tx);
    assert_eq!(client.backend().call_count("get_transaction"), 0);
    coordinator.stop();
  }

  #[tokio::test]
  async fn test_account_and_category_writes_refresh_their_lists() {
    let client = client();
    let coordinator = SyncCoordinator::new(
      client.bus.clone(),
      client.cache().clone(),
      SyncRules::default(),
    );
    coordinator.start();

    let params = PaginationController::new(EntityKind::Account.schema(), 10).get_params();
    assert_eq!(client.list_accounts(&params).await.unwrap().total, 4);
    assert_eq!(client.list_categories().await.unwrap().len(), 5);

    let account = client
      .create_account(NewAccount {
        name: "Brokerage".into(),
        kind: AccountKind::Savings,
        currency: "USD".into(),
        opening_balance_cents: 10_000,
      })
      .await
      .unwrap();
    let category = client.create_category("Gifts").await.unwrap();
    coordinator.wait_idle().await;

    // Lists were re-warmed by the coordinator, the new account was seeded
    let calls = client.backend().total_calls();
    let page = client.list_accounts(&params).await.unwrap();
    assert_eq!(page.total, 5);
    assert!(page.items.iter().any(|a| a.id == account.id));
    assert!(client.list_categories().await.unwrap().contains(&category));
    assert_eq!(client.get_account(&account.id).await.unwrap(), account);
    assert_eq!(client.backend().total_calls(), calls);

    let renamed = client
      .update_account(&account.id, Some("Index Funds".into()), None)
      .await
      .unwrap();
    coordinator.wait_idle().await;
    assert_eq!(client.get_account(&account.id).await.unwrap().name, "Index Funds");
    assert_eq!(renamed.name, "Index Funds");
    assert_eq!(client.backend().call_count("get_account"), 0);
    coordinator.stop();
  }

  #[tokio::test]
  async fn test_failed_write_publishes_nothing() {
    let client = client();
    let seen = Arc::new(Mutex::new(0));
    let count = Arc::clone(&seen);
    let _sub = client.bus.on("transaction:created", move |_| {
      *count.lock().unwrap() += 1;
      Ok(())
    });

    assert!(client.create_transaction(lunch("a404")).await.is_err());
    assert_eq!(*seen.lock().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_mutation_refreshes_dependent_reads() {
    let client = client();
    let coordinator = SyncCoordinator::new(
      client.bus.clone(),
      client.cache().clone(),
      SyncRules::default(),
    );
    coordinator.start();

    let before = client.get_account("a1").await.unwrap();
    let _ = client.all_accounts().await.unwrap();

    client.create_transaction(lunch("a1")).await.unwrap();
    coordinator.wait_idle().await;

    // Both were re-warmed by the coordinator, so these reads are hits
    let calls = client.backend().total_calls();
    let after = client.get_account("a1").await.unwrap();
    let accounts = client.all_accounts().await.unwrap();
    assert_eq!(client.backend().total_calls(), calls);

    assert_eq!(after.balance_cents, before.balance_cents - 1_250);
    let listed = accounts.iter().find(|a| a.id == "a1").unwrap();
    assert_eq!(listed.balance_cents, after.balance_cents);
  }
}
