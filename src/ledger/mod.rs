//! Ledger data service and its cached client.

pub mod backend;
pub mod cached_client;
pub mod types;

pub use backend::MemoryBackend;
pub use cached_client::{CachedLedgerClient, BALANCES_REPORT};
pub use types::{
  Account, AccountBalance, AccountKind, BalanceReport, Category, NewAccount, NewTransaction, Page,
  Transaction,
};
