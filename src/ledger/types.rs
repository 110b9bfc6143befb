use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Kind of account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountKind {
  Checking,
  Savings,
  Credit,
  Cash,
}

impl AccountKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      AccountKind::Checking => "checking",
      AccountKind::Savings => "savings",
      AccountKind::Credit => "credit",
      AccountKind::Cash => "cash",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
  pub id: String,
  pub name: String,
  pub kind: AccountKind,
  pub currency: String,
  /// Opening balance plus every transaction on the account
  pub balance_cents: i64,
  pub archived: bool,
  pub updated_at: DateTime<Utc>,
}

/// Fields for creating an account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAccount {
  pub name: String,
  pub kind: AccountKind,
  pub currency: String,
  pub opening_balance_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
  pub id: String,
  pub account_id: String,
  pub category_id: Option<String>,
  /// Negative for outflows
  pub amount_cents: i64,
  pub description: String,
  pub date: NaiveDate,
}

/// Fields for creating or replacing a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTransaction {
  pub account_id: String,
  pub category_id: Option<String>,
  pub amount_cents: i64,
  pub description: String,
  pub date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
  pub id: String,
  pub name: String,
}

/// One page of a list query with the server-side row count
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
  pub items: Vec<T>,
  pub total: i64,
}

/// Balance of one account in the report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBalance {
  pub account_id: String,
  pub name: String,
  pub balance_cents: i64,
}

/// Aggregate balances over active accounts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceReport {
  pub accounts: Vec<AccountBalance>,
  pub total_cents: i64,
  pub generated_at: DateTime<Utc>,
}
