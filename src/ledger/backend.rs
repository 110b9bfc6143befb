//! In-memory ledger service standing in for the remote data API.

use chrono::{Days, NaiveDate, Utc};
use color_eyre::{eyre::eyre, Result};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

use super::types::{
  Account, AccountBalance, AccountKind, BalanceReport, Category, NewAccount, NewTransaction, Page,
  Transaction,
};
use crate::config::BackendConfig;
use crate::pagination::{FetchParams, FilterValue, SortOrder};

#[derive(Default)]
struct Ledger {
  accounts: BTreeMap<String, Account>,
  transactions: BTreeMap<String, Transaction>,
  categories: BTreeMap<String, Category>,
  /// Last id handed out per prefix
  ids: BTreeMap<&'static str, u64>,
  calls: BTreeMap<&'static str, u64>,
  /// Remaining calls that fail on purpose
  fail_next: usize,
}

impl Ledger {
  fn next_id(&mut self, prefix: &'static str) -> String {
    let n = self.ids.entry(prefix).or_default();
    *n += 1;
    format!("{}{}", prefix, n)
  }

  fn account_mut(&mut self, id: &str) -> Result<&mut Account> {
    self
      .accounts
      .get_mut(id)
      .ok_or_else(|| eyre!("Account not found: {}", id))
  }

  fn check_refs(&self, tx: &NewTransaction) -> Result<()> {
    if !self.accounts.contains_key(&tx.account_id) {
      return Err(eyre!("Account not found: {}", tx.account_id));
    }
    if let Some(category_id) = &tx.category_id {
      if !self.categories.contains_key(category_id) {
        return Err(eyre!("Category not found: {}", category_id));
      }
    }
    Ok(())
  }

  /// Store `new` under `id` and post its amount.
  fn book(&mut self, id: String, new: NewTransaction) -> Result<Transaction> {
    let tx = Transaction {
      id: id.clone(),
      account_id: new.account_id,
      category_id: new.category_id,
      amount_cents: new.amount_cents,
      description: new.description,
      date: new.date,
    };
    self.post(&tx.account_id, tx.amount_cents)?;
    self.transactions.insert(id, tx.clone());
    Ok(tx)
  }

  /// Move `amount_cents` into the balance of `account_id`.
  fn post(&mut self, account_id: &str, amount_cents: i64) -> Result<()> {
    let account = self.account_mut(account_id)?;
    account.balance_cents += amount_cents;
    account.updated_at = Utc::now();
    Ok(())
  }
}

/// Async in-memory ledger with simulated latency and failure injection.
///
/// Cloning yields a handle to the same data.
#[derive(Clone, Default)]
pub struct MemoryBackend {
  state: Arc<Mutex<Ledger>>,
  latency: Duration,
}

impl MemoryBackend {
  pub fn new(latency: Duration) -> Self {
    Self {
      state: Arc::default(),
      latency,
    }
  }

  pub fn from_config(config: &BackendConfig) -> Self {
    Self::new(Duration::from_millis(config.latency_ms))
  }

  fn state(&self) -> MutexGuard<'_, Ledger> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Simulated network hop: wait, count the call, maybe fail.
  async fn round_trip(&self, op: &'static str) -> Result<MutexGuard<'_, Ledger>> {
    if !self.latency.is_zero() {
      tokio::time::sleep(self.latency).await;
    }
    let mut state = self.state();
    *state.calls.entry(op).or_default() += 1;
    if state.fail_next > 0 {
      state.fail_next -= 1;
      return Err(eyre!("Failed to {}: injected backend failure", op));
    }
    debug!(op, "backend call");
    Ok(state)
  }

  /// Make the next `n` calls fail.
  pub fn fail_next(&self, n: usize) {
    self.state().fail_next = n;
  }

  pub fn call_count(&self, op: &str) -> u64 {
    self.state().calls.get(op).copied().unwrap_or(0)
  }

  pub fn total_calls(&self) -> u64 {
    self.state().calls.values().sum()
  }

  /// Populate a small, deterministic data set.
  pub fn seed_demo(&self) -> Result<()> {
    let start = NaiveDate::from_ymd_opt(2024, 1, 1).ok_or_else(|| eyre!("Invalid seed date"))?;
    let mut state = self.state();
    let now = Utc::now();

    let categories = ["Groceries", "Rent", "Salary", "Utilities", "Travel"];
    let mut category_ids = Vec::with_capacity(categories.len());
    for name in categories {
      let id = state.next_id("c");
      let category = Category {
        id: id.clone(),
        name: name.to_string(),
      };
      state.categories.insert(id.clone(), category);
      category_ids.push(id);
    }

    let accounts = [
      ("Everyday Checking", AccountKind::Checking, 150_000),
      ("Rainy Day Savings", AccountKind::Savings, 500_000),
      ("Travel Card", AccountKind::Credit, 0),
      ("Wallet", AccountKind::Cash, 4_000),
    ];
    let account_ids: Vec<String> = accounts
      .iter()
      .map(|(name, kind, opening)| {
        let id = state.next_id("a");
        state.accounts.insert(
          id.clone(),
          Account {
            id: id.clone(),
            name: name.to_string(),
            kind: *kind,
            currency: "USD".to_string(),
            balance_cents: *opening,
            archived: false,
            updated_at: now,
          },
        );
        id
      })
      .collect();

    for i in 0..48u64 {
      let (account, category, amount_cents) = if i % 12 == 0 {
        (0, 2, 320_000)
      } else {
        let slot = (i % 4) as usize;
        ([0, 0, 2, 3][slot], [0, 1, 3, 4][slot], -(1_500 + (i as i64 * 731) % 9_000))
      };
      let id = state.next_id("t");
      let new = NewTransaction {
        account_id: account_ids[account].clone(),
        category_id: Some(category_ids[category].clone()),
        amount_cents,
        description: format!("{} #{}", categories[category], i + 1),
        date: start + Days::new(i * 2),
      };
      state.book(id, new)?;
    }

    debug!(
      accounts = state.accounts.len(),
      transactions = state.transactions.len(),
      "demo ledger seeded"
    );
    Ok(())
  }

  /// Accounts matching the filters, sorted and paged.
  ///
  /// Filters: `kind` (text), `archived` (bool), `search` (name substring).
  pub async fn list_accounts(&self, params: &FetchParams) -> Result<Page<Account>> {
    let state = self.round_trip("list_accounts").await?;
    let kind = text_filter(params, "kind");
    let archived = bool_filter(params, "archived");
    let search = text_filter(params, "search").map(|s| s.to_lowercase());

    let rows: Vec<Account> = state
      .accounts
      .values()
      .filter(|a| kind.as_deref().map_or(true, |k| a.kind.as_str() == k))
      .filter(|a| archived.map_or(true, |v| a.archived == v))
      .filter(|a| search_matches(&a.name, search.as_deref()))
      .cloned()
      .collect();

    Ok(paginate(rows, params, |a, b, field| match field {
      "balance" => a.balance_cents.cmp(&b.balance_cents),
      _ => a.name.cmp(&b.name),
    }))
  }

  /// Every account, archived ones included, ordered by id.
  pub async fn all_accounts(&self) -> Result<Vec<Account>> {
    let state = self.round_trip("all_accounts").await?;
    Ok(state.accounts.values().cloned().collect())
  }

  pub async fn get_account(&self, id: &str) -> Result<Account> {
    let state = self.round_trip("get_account").await?;
    state
      .accounts
      .get(id)
      .cloned()
      .ok_or_else(|| eyre!("Account not found: {}", id))
  }

  pub async fn create_account(&self, new: NewAccount) -> Result<Account> {
    let mut state = self.round_trip("create_account").await?;
    if new.name.trim().is_empty() {
      return Err(eyre!("Failed to create account: name is empty"));
    }
    let id = state.next_id("a");
    let account = Account {
      id: id.clone(),
      name: new.name,
      kind: new.kind,
      currency: new.currency,
      balance_cents: new.opening_balance_cents,
      archived: false,
      updated_at: Utc::now(),
    };
    state.accounts.insert(id, account.clone());
    Ok(account)
  }

  /// Rename and/or (un)archive an account.
  pub async fn update_account(
    &self,
    id: &str,
    name: Option<String>,
    archived: Option<bool>,
  ) -> Result<Account> {
    let mut state = self.round_trip("update_account").await?;
    let account = state.account_mut(id)?;
    if let Some(name) = name {
      account.name = name;
    }
    if let Some(archived) = archived {
      account.archived = archived;
    }
    account.updated_at = Utc::now();
    Ok(account.clone())
  }

  /// Transactions matching the filters, sorted and paged.
  ///
  /// Filters: `account_id`, `category_id`, `min_amount`/`max_amount` (cents),
  /// `from`/`to` (inclusive dates), `search` (description substring).
  pub async fn list_transactions(&self, params: &FetchParams) -> Result<Page<Transaction>> {
    let state = self.round_trip("list_transactions").await?;
    let account_id = text_filter(params, "account_id");
    let category_id = text_filter(params, "category_id");
    let min_amount = number_filter(params, "min_amount");
    let max_amount = number_filter(params, "max_amount");
    let from = date_filter(params, "from");
    let to = date_filter(params, "to");
    let search = text_filter(params, "search").map(|s| s.to_lowercase());

    let rows: Vec<Transaction> = state
      .transactions
      .values()
      .filter(|t| account_id.as_deref().map_or(true, |id| t.account_id == id))
      .filter(|t| {
        category_id
          .as_deref()
          .map_or(true, |id| t.category_id.as_deref() == Some(id))
      })
      .filter(|t| min_amount.map_or(true, |min| t.amount_cents as f64 >= min))
      .filter(|t| max_amount.map_or(true, |max| t.amount_cents as f64 <= max))
      .filter(|t| from.map_or(true, |d| t.date >= d))
      .filter(|t| to.map_or(true, |d| t.date <= d))
      .filter(|t| search_matches(&t.description, search.as_deref()))
      .cloned()
      .collect();

    Ok(paginate(rows, params, |a, b, field| match field {
      "amount" => a.amount_cents.cmp(&b.amount_cents),
      "description" => a.description.cmp(&b.description),
      _ => a.date.cmp(&b.date),
    }))
  }

  pub async fn get_transaction(&self, id: &str) -> Result<Transaction> {
    let state = self.round_trip("get_transaction").await?;
    state
      .transactions
      .get(id)
      .cloned()
      .ok_or_else(|| eyre!("Transaction not found: {}", id))
  }

  pub async fn create_transaction(&self, new: NewTransaction) -> Result<Transaction> {
    let mut state = self.round_trip("create_transaction").await?;
    state.check_refs(&new)?;

    let id = state.next_id("t");
    state.book(id, new)
  }

  /// Replace a transaction, moving its amount between accounts as needed.
  pub async fn update_transaction(&self, id: &str, new: NewTransaction) -> Result<Transaction> {
    let mut state = self.round_trip("update_transaction").await?;
    state.check_refs(&new)?;
    let old = state
      .transactions
      .get(id)
      .cloned()
      .ok_or_else(|| eyre!("Transaction not found: {}", id))?;

    state.post(&old.account_id, -old.amount_cents)?;
    state.book(id.to_string(), new)
  }

  /// Remove a transaction and reverse its effect on the account balance.
  pub async fn delete_transaction(&self, id: &str) -> Result<Transaction> {
    let mut state = self.round_trip("delete_transaction").await?;
    let tx = state
      .transactions
      .remove(id)
      .ok_or_else(|| eyre!("Transaction not found: {}", id))?;
    state.post(&tx.account_id, -tx.amount_cents)?;
    Ok(tx)
  }

  pub async fn list_categories(&self) -> Result<Vec<Category>> {
    let state = self.round_trip("list_categories").await?;
    let mut categories: Vec<Category> = state.categories.values().cloned().collect();
    categories.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(categories)
  }

  pub async fn create_category(&self, name: &str) -> Result<Category> {
    let mut state = self.round_trip("create_category").await?;
    if state.categories.values().any(|c| c.name.eq_ignore_ascii_case(name)) {
      return Err(eyre!("Failed to create category: {} already exists", name));
    }
    let id = state.next_id("c");
    let category = Category {
      id: id.clone(),
      name: name.to_string(),
    };
    state.categories.insert(id, category.clone());
    Ok(category)
  }

  /// Balances of all non-archived accounts.
  pub async fn balance_report(&self) -> Result<BalanceReport> {
    let state = self.round_trip("balance_report").await?;
    let accounts: Vec<AccountBalance> = state
      .accounts
      .values()
      .filter(|a| !a.archived)
      .map(|a| AccountBalance {
        account_id: a.id.clone(),
        name: a.name.clone(),
        balance_cents: a.balance_cents,
      })
      .collect();
    let total_cents = accounts.iter().map(|a| a.balance_cents).sum();

    Ok(BalanceReport {
      accounts,
      total_cents,
      generated_at: Utc::now(),
    })
  }
}

fn text_filter(params: &FetchParams, field: &str) -> Option<String> {
  params.filters.get(field).map(FilterValue::to_string)
}

fn bool_filter(params: &FetchParams, field: &str) -> Option<bool> {
  params.filters.get(field).and_then(|v| match v {
    FilterValue::Text(s) => s.parse().ok(),
    other => other.as_bool(),
  })
}

fn number_filter(params: &FetchParams, field: &str) -> Option<f64> {
  params.filters.get(field).and_then(|v| match v {
    FilterValue::Text(s) => s.parse().ok(),
    other => other.as_number(),
  })
}

fn date_filter(params: &FetchParams, field: &str) -> Option<NaiveDate> {
  params.filters.get(field).and_then(|v| match v {
    FilterValue::Text(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d").ok(),
    other => other.as_date(),
  })
}

fn search_matches(haystack: &str, needle: Option<&str>) -> bool {
  needle.map_or(true, |n| haystack.to_lowercase().contains(n))
}

/// Sort by the requested field (ties broken by input order), then slice out
/// the requested page. `total` counts every matching row.
fn paginate<T>(
  mut rows: Vec<T>,
  params: &FetchParams,
  compare: impl Fn(&T, &T, &str) -> Ordering,
) -> Page<T> {
  if let Some(field) = params.sort_by.as_deref() {
    rows.sort_by(|a, b| {
      let ord = compare(a, b, field);
      match params.sort_order {
        SortOrder::Asc => ord,
        SortOrder::Desc => ord.reverse(),
      }
    });
  }

  let total = rows.len() as i64;
  let items = rows
    .into_iter()
    .skip(params.offset as usize)
    .take(params.limit as usize)
    .collect();
  Page { items, total }
}
