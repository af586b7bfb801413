//! Storage layer
//!
//! The ledger algorithms only see these traits:
//!
//! - `LedgerStore` - committed reads and `begin()` of an atomic unit
//! - `LedgerUnit` - the writes of one atomic unit (lock, update, insert)
//! - `RateStore` - rate, override and discount rows
//!
//! A unit that is dropped without `commit` is rolled back. Implementations:
//! `MemoryStore` (tests, embedding) and `PgStore` (feature `postgres`).

use crate::{
    types::{
        AccountLevelRate, AgentDailyDiscount, CurrencyId, ExchangeRate, HistoryStatus,
        NewTransaction, NewTransactionStatusEntry, NewWallet, RateKey, Transaction,
        TransactionStatusEntry, UserId, Wallet, WalletHistoryEntry,
    },
    Result,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::{FailPoint, MemoryStore};
#[cfg(feature = "postgres")]
pub use postgres::PgStore;

/// Fields of a history row before the store assigns id and timestamps
#[derive(Debug, Clone)]
pub struct NewHistoryEntry {
    /// Wallet
    pub wallet_id: Uuid,
    /// Balance before
    pub old_balance: Decimal,
    /// Balance after
    pub new_balance: Decimal,
    /// Action performed
    pub action_performed: String,
    /// Initial status
    pub status: HistoryStatus,
}

/// Committed reads and unit creation
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Open an atomic unit
    async fn begin(&self) -> Result<Box<dyn LedgerUnit>>;

    /// Read a wallet row
    async fn get_wallet(&self, id: Uuid) -> Result<Option<Wallet>>;

    /// Read a transaction row
    async fn get_transaction(&self, id: Uuid) -> Result<Option<Transaction>>;

    /// Read the status trail of a transaction
    async fn transaction_status_entries(
        &self,
        transaction_id: Uuid,
    ) -> Result<Vec<TransactionStatusEntry>>;

    /// Read a history row
    async fn get_history(&self, id: i64) -> Result<Option<WalletHistoryEntry>>;

    /// Read all history rows of a wallet, oldest first
    async fn list_history(&self, wallet_id: Uuid) -> Result<Vec<WalletHistoryEntry>>;
}

/// Writes of one atomic unit
///
/// Wallet writes bump the row version by one each.
#[async_trait]
pub trait LedgerUnit: Send {
    /// Insert a wallet row with an empty hash and version 0
    async fn insert_wallet(&mut self, wallet: NewWallet) -> Result<Wallet>;

    /// Re-read a wallet row and lock it for the rest of the unit
    async fn lock_wallet_for_update(&mut self, id: Uuid) -> Result<Option<Wallet>>;

    /// Persist a new balance
    async fn update_wallet_balance(&mut self, id: Uuid, balance: Decimal) -> Result<Wallet>;

    /// Persist a new integrity hash
    async fn update_wallet_hash(&mut self, id: Uuid, hash: &str) -> Result<Wallet>;

    /// Insert an immutable transaction row
    async fn insert_transaction(&mut self, transaction: NewTransaction) -> Result<Transaction>;

    /// Insert a transaction status row
    async fn insert_transaction_status(
        &mut self,
        entry: NewTransactionStatusEntry,
    ) -> Result<TransactionStatusEntry>;

    /// Insert an unsigned history row; the store assigns id and timestamps
    async fn insert_history(&mut self, entry: NewHistoryEntry) -> Result<WalletHistoryEntry>;

    /// Persist the hash of a freshly inserted history row
    async fn update_history_hash(&mut self, id: i64, hash: &str) -> Result<WalletHistoryEntry>;

    /// Re-read a history row and lock it for the rest of the unit
    async fn lock_history_for_update(&mut self, id: i64) -> Result<Option<WalletHistoryEntry>>;

    /// Write status, hash and updated_at; created_at is left untouched
    async fn update_history_status(
        &mut self,
        id: i64,
        status: HistoryStatus,
        hash: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<WalletHistoryEntry>;

    /// Make every write of the unit visible
    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Rate rows, unfiltered by validity
#[async_trait]
pub trait RateStore: Send + Sync {
    /// Base rates for a pair and direction
    async fn exchange_rates(&self, key: RateKey) -> Result<Vec<ExchangeRate>>;

    /// Overrides for a user, pair and direction
    async fn account_level_rates(&self, user: UserId, key: RateKey)
        -> Result<Vec<AccountLevelRate>>;

    /// Discounts for a user and base currency
    async fn agent_daily_discounts(
        &self,
        user: UserId,
        base: CurrencyId,
    ) -> Result<Vec<AgentDailyDiscount>>;
}
