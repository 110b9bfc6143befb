use chrono::NaiveDate;
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::info;

use crate::cache::{CacheLayer, CacheStats, EntryInfo, SchedulerStatus};
use crate::config::Config;
use crate::entity::{EntityKind, MutationEvent};
use crate::event::EventBus;
use crate::ledger::{CachedLedgerClient, MemoryBackend, NewTransaction};
use crate::pagination::{PaginationController, PaginationUpdate};
use crate::sync::{SyncCoordinator, SyncStatus, SyncTask};

/// Options for [`App::run_demo`].
#[derive(Debug, Clone, Copy)]
pub struct DemoOptions {
  pub page_size: u64,
  pub mutations: usize,
}

/// Point-in-time view of every component.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
  pub cache: CacheStats,
  pub hit_rate: f64,
  pub scheduler: SchedulerStatus,
  pub sync: SyncStatus,
  pub entries: Vec<EntryInfo>,
  pub recent_tasks: Vec<SyncTask>,
}

/// What the demo session did.
#[derive(Debug, Clone, Serialize)]
pub struct DemoReport {
  pub accounts: usize,
  /// Hits gained by the repeated account read
  pub repeat_read_hits: u64,
  pub transaction_pages: u64,
  pub transactions_seen: usize,
  pub mutations: usize,
  /// Backend calls made by reads after the sync coordinator settled
  pub calls_after_sync: u64,
  pub diagnostics: Diagnostics,
}

/// Main application state
pub struct App {
  config: Config,
  layer: CacheLayer,
  coordinator: SyncCoordinator,
  client: CachedLedgerClient,
  janitor: Option<JoinHandle<()>>,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let backend = MemoryBackend::from_config(&config.backend);
    backend.seed_demo()?;

    let layer = CacheLayer::from_config(&config);
    let bus: EventBus<MutationEvent> = EventBus::new();
    let coordinator = SyncCoordinator::from_config(bus.clone(), layer.clone(), &config.sync);
    let client = CachedLedgerClient::new(backend, layer.clone(), bus);

    Ok(Self {
      config,
      layer,
      coordinator,
      client,
      janitor: None,
    })
  }

  pub fn client(&self) -> &CachedLedgerClient {
    &self.client
  }

  pub fn coordinator(&self) -> &SyncCoordinator {
    &self.coordinator
  }

  /// Start background work: the cache janitor and, if enabled, auto-sync.
  pub fn start(&mut self) {
    if self.janitor.is_none() {
      let every = self.config.cache.cleanup_interval();
      self.janitor = Some(self.layer.store().spawn_cleanup(every));
    }
    if self.config.sync.enabled {
      self.coordinator.start();
    }
    info!(sync = self.config.sync.enabled, "application started");
  }

  pub fn shutdown(&mut self) {
    self.coordinator.stop();
    if let Some(janitor) = self.janitor.take() {
      janitor.abort();
    }
    info!("application stopped");
  }

  pub fn diagnostics(&self) -> Diagnostics {
    let cache = self.layer.stats();
    Diagnostics {
      cache,
      hit_rate: cache.hit_rate(),
      scheduler: self.layer.scheduler().status(),
      sync: self.coordinator.status(),
      entries: self.layer.store().entries(),
      recent_tasks: self.coordinator.history(),
    }
  }

  /// Scripted session: repeated reads, paging, mutations, then diagnostics.
  pub async fn run_demo(&mut self, opts: DemoOptions) -> Result<DemoReport> {
    self.start();

    let accounts = self.client.all_accounts().await?;
    let hits_before = self.layer.stats().hits;
    self.client.all_accounts().await?;
    let repeat_read_hits = self.layer.stats().hits - hits_before;
    info!(accounts = accounts.len(), repeat_read_hits, "accounts loaded");

    self.client.list_categories().await?;
    self.client.balance_report().await?;

    let (transaction_pages, transactions_seen) =
      self.page_through_transactions(opts.page_size).await?;
    info!(pages = transaction_pages, rows = transactions_seen, "transactions paged");

    let account_id = accounts
      .first()
      .map(|a| a.id.clone())
      .ok_or_else(|| eyre!("Demo ledger has no accounts"))?;
    self.client.get_account(&account_id).await?;
    self.apply_mutations(&account_id, opts.mutations).await?;
    self.coordinator.wait_idle().await;

    // Keys refreshed by the coordinator are served from cache
    let calls = self.client.backend().total_calls();
    self.client.all_accounts().await?;
    self.client.get_account(&account_id).await?;
    let calls_after_sync = self.client.backend().total_calls() - calls;

    let report = DemoReport {
      accounts: accounts.len(),
      repeat_read_hits,
      transaction_pages,
      transactions_seen,
      mutations: opts.mutations,
      calls_after_sync,
      diagnostics: self.diagnostics(),
    };
    self.shutdown();
    Ok(report)
  }

  async fn page_through_transactions(&self, page_size: u64) -> Result<(u64, usize)> {
    let mut pager =
      PaginationController::from_config(EntityKind::Transaction.schema(), &self.config.pagination);
    pager.change_page_size(page_size);

    let mut pages = 0;
    let mut rows = 0;
    loop {
      let page = self.client.list_transactions(&pager.get_params()).await?;
      pager.update_pagination(PaginationUpdate::total(page.total))?;
      pages += 1;
      rows += page.items.len();

      if !pager.has_next_page() {
        break;
      }
      pager.next_page();
    }
    Ok((pages, rows))
  }

  async fn apply_mutations(&self, account_id: &str, count: usize) -> Result<()> {
    let start = NaiveDate::from_ymd_opt(2024, 7, 1).ok_or_else(|| eyre!("Invalid demo date"))?;
    let mut previous: Option<String> = None;

    for i in 0..count {
      let new = NewTransaction {
        account_id: account_id.to_string(),
        category_id: None,
        amount_cents: -(500 + 125 * i as i64),
        description: format!("Demo purchase #{}", i + 1),
        date: start,
      };

      match (i % 3, previous.take()) {
        (2, Some(id)) => {
          self.client.delete_transaction(&id).await?;
        }
        (1, Some(id)) => {
          let tx = self.client.update_transaction(&id, new).await?;
          previous = Some(tx.id);
        }
        _ => {
          let tx = self.client.create_transaction(new).await?;
          previous = Some(tx.id);
        }
      }
    }
    info!(count, "demo mutations applied");
    Ok(())
  }
}
