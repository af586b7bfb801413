//! In-memory store
//!
//! A unit holds the table lock from `begin` until it is committed or dropped,
//! and stages its writes on a private copy of the tables. Commit swaps the
//! copy in; drop discards it. Units are therefore serialised, which is enough
//! to exercise the optimistic version check: a caller holding a stale wallet
//! still loses once its unit runs.

use super::{LedgerStore, LedgerUnit, NewHistoryEntry, RateStore};
use crate::{
    time::{Clock, SystemClock},
    types::{
        AccountLevelRate, AgentDailyDiscount, CurrencyId, ExchangeRate, HistoryStatus,
        NewTransaction, NewTransactionStatusEntry, NewWallet, RateKey, Transaction,
        TransactionStatusEntry, UserId, Wallet, WalletHistoryEntry,
    },
    Error, Result,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

/// Unit operation at which an injected failure fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    /// `insert_wallet`
    InsertWallet,
    /// `lock_wallet_for_update`
    LockWallet,
    /// `update_wallet_balance`
    UpdateWalletBalance,
    /// `update_wallet_hash`
    UpdateWalletHash,
    /// `insert_transaction`
    InsertTransaction,
    /// `insert_transaction_status`
    InsertTransactionStatus,
    /// `insert_history`
    InsertHistory,
    /// `update_history_hash`
    UpdateHistoryHash,
    /// `lock_history_for_update`
    LockHistory,
    /// `update_history_status`
    UpdateHistoryStatus,
    /// `commit`
    Commit,
}

#[derive(Debug, Clone, Default)]
struct LedgerTables {
    wallets: HashMap<Uuid, Wallet>,
    transactions: HashMap<Uuid, Transaction>,
    transaction_status: Vec<TransactionStatusEntry>,
    history: BTreeMap<i64, WalletHistoryEntry>,
    next_history_id: i64,
    next_status_id: i64,
}

#[derive(Debug, Default)]
struct RateTables {
    exchange_rates: Vec<ExchangeRate>,
    account_level_rates: Vec<AccountLevelRate>,
    agent_daily_discounts: Vec<AgentDailyDiscount>,
}

/// In-memory implementation of every storage trait
pub struct MemoryStore {
    tables: Arc<AsyncMutex<LedgerTables>>,
    rates: RwLock<RateTables>,
    clock: Arc<dyn Clock>,
    fail_point: Arc<Mutex<Option<FailPoint>>>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create empty store on the system clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create empty store stamping rows from `clock`
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: Arc::new(AsyncMutex::new(LedgerTables::default())),
            rates: RwLock::new(RateTables::default()),
            clock,
            fail_point: Arc::new(Mutex::new(None)),
        }
    }

    /// Make the next matching unit operation fail with `Error::Storage`
    pub fn inject_failure(&self, point: FailPoint) {
        *self.fail_point.lock() = Some(point);
    }

    /// Overwrite a wallet row directly, bypassing the ledger
    ///
    /// Simulates an out-of-band edit of the underlying table.
    pub async fn overwrite_wallet(&self, wallet: Wallet) {
        self.tables.lock().await.wallets.insert(wallet.id, wallet);
    }

    /// Overwrite a history row directly, bypassing the audit trail
    pub async fn overwrite_history(&self, entry: WalletHistoryEntry) {
        self.tables.lock().await.history.insert(entry.id, entry);
    }

    /// Number of committed wallet rows
    pub async fn wallet_count(&self) -> usize {
        self.tables.lock().await.wallets.len()
    }

    /// Number of committed transaction rows
    pub async fn transaction_count(&self) -> usize {
        self.tables.lock().await.transactions.len()
    }

    /// Add a base rate
    pub fn add_exchange_rate(&self, rate: ExchangeRate) {
        self.rates.write().exchange_rates.push(rate);
    }

    /// Add an account-level override
    pub fn add_account_level_rate(&self, rate: AccountLevelRate) {
        self.rates.write().account_level_rates.push(rate);
    }

    /// Add an agent daily discount
    pub fn add_agent_daily_discount(&self, discount: AgentDailyDiscount) {
        self.rates.write().agent_daily_discounts.push(discount);
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn LedgerUnit>> {
        let committed = Arc::clone(&self.tables).lock_owned().await;
        let staged = committed.clone();
        Ok(Box::new(MemoryUnit {
            committed,
            staged,
            clock: Arc::clone(&self.clock),
            fail_point: Arc::clone(&self.fail_point),
        }))
    }

    async fn get_wallet(&self, id: Uuid) -> Result<Option<Wallet>> {
        Ok(self.tables.lock().await.wallets.get(&id).cloned())
    }

    async fn get_transaction(&self, id: Uuid) -> Result<Option<Transaction>> {
        Ok(self.tables.lock().await.transactions.get(&id).cloned())
    }

    async fn transaction_status_entries(
        &self,
        transaction_id: Uuid,
    ) -> Result<Vec<TransactionStatusEntry>> {
        Ok(self
            .tables
            .lock()
            .await
            .transaction_status
            .iter()
            .filter(|entry| entry.transaction_id == transaction_id)
            .cloned()
            .collect())
    }

    async fn get_history(&self, id: i64) -> Result<Option<WalletHistoryEntry>> {
        Ok(self.tables.lock().await.history.get(&id).cloned())
    }

    async fn list_history(&self, wallet_id: Uuid) -> Result<Vec<WalletHistoryEntry>> {
        Ok(self
            .tables
            .lock()
            .await
            .history
            .values()
            .filter(|entry| entry.wallet_id == wallet_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RateStore for MemoryStore {
    async fn exchange_rates(&self, key: RateKey) -> Result<Vec<ExchangeRate>> {
        Ok(self
            .rates
            .read()
            .exchange_rates
            .iter()
            .filter(|rate| {
                rate.base_currency_id == key.base
                    && rate.quote_currency_id == key.quote
                    && rate.direction == key.direction
            })
            .cloned()
            .collect())
    }

    async fn account_level_rates(
        &self,
        user: UserId,
        key: RateKey,
    ) -> Result<Vec<AccountLevelRate>> {
        Ok(self
            .rates
            .read()
            .account_level_rates
            .iter()
            .filter(|rate| {
                rate.owner_id == user
                    && rate.base_currency_id == key.base
                    && rate.quote_currency_id == key.quote
                    && rate.direction == key.direction
            })
            .cloned()
            .collect())
    }

    async fn agent_daily_discounts(
        &self,
        user: UserId,
        base: CurrencyId,
    ) -> Result<Vec<AgentDailyDiscount>> {
        Ok(self
            .rates
            .read()
            .agent_daily_discounts
            .iter()
            .filter(|discount| discount.owner_id == user && discount.base_currency_id == base)
            .cloned()
            .collect())
    }
}

/// Atomic unit over the in-memory tables
pub struct MemoryUnit {
    committed: OwnedMutexGuard<LedgerTables>,
    staged: LedgerTables,
    clock: Arc<dyn Clock>,
    fail_point: Arc<Mutex<Option<FailPoint>>>,
}

impl MemoryUnit {
    fn check(&self, point: FailPoint) -> Result<()> {
        let mut armed = self.fail_point.lock();
        if *armed == Some(point) {
            *armed = None;
            return Err(Error::Storage(format!("injected failure at {:?}", point)));
        }
        Ok(())
    }

    fn wallet_mut(&mut self, id: Uuid) -> Result<&mut Wallet> {
        self.staged
            .wallets
            .get_mut(&id)
            .ok_or(Error::WalletNotFound(id))
    }

    fn history_mut(&mut self, id: i64) -> Result<&mut WalletHistoryEntry> {
        self.staged
            .history
            .get_mut(&id)
            .ok_or(Error::HistoryNotFound(id))
    }
}

#[async_trait]
impl LedgerUnit for MemoryUnit {
    async fn insert_wallet(&mut self, wallet: NewWallet) -> Result<Wallet> {
        self.check(FailPoint::InsertWallet)?;
        if self.staged.wallets.contains_key(&wallet.id) {
            return Err(Error::Storage(format!("duplicate wallet id {}", wallet.id)));
        }
        let now = self.clock.now();
        let row = Wallet {
            id: wallet.id,
            owner_id: wallet.owner_id,
            currency_id: wallet.currency_id,
            balance: wallet.balance,
            hash: String::new(),
            version: 0,
            locked: wallet.locked,
            created_at: now,
            updated_at: now,
        };
        self.staged.wallets.insert(row.id, row.clone());
        Ok(row)
    }

    async fn lock_wallet_for_update(&mut self, id: Uuid) -> Result<Option<Wallet>> {
        self.check(FailPoint::LockWallet)?;
        Ok(self.staged.wallets.get(&id).cloned())
    }

    async fn update_wallet_balance(&mut self, id: Uuid, balance: Decimal) -> Result<Wallet> {
        self.check(FailPoint::UpdateWalletBalance)?;
        let now = self.clock.now();
        let wallet = self.wallet_mut(id)?;
        wallet.balance = balance;
        wallet.version += 1;
        wallet.updated_at = now;
        Ok(wallet.clone())
    }

    async fn update_wallet_hash(&mut self, id: Uuid, hash: &str) -> Result<Wallet> {
        self.check(FailPoint::UpdateWalletHash)?;
        let now = self.clock.now();
        let wallet = self.wallet_mut(id)?;
        wallet.hash = hash.to_string();
        wallet.version += 1;
        wallet.updated_at = now;
        Ok(wallet.clone())
    }

    async fn insert_transaction(&mut self, transaction: NewTransaction) -> Result<Transaction> {
        self.check(FailPoint::InsertTransaction)?;
        if self.staged.transactions.contains_key(&transaction.id) {
            return Err(Error::Storage(format!(
                "duplicate transaction id {}",
                transaction.id
            )));
        }
        let row = Transaction {
            id: transaction.id,
            wallet_id: transaction.wallet_id,
            user_id: transaction.user_id,
            amount: transaction.amount,
            direction: transaction.direction,
            status: transaction.status,
            currency_id: transaction.currency_id,
            fee: transaction.fee,
            rate: transaction.rate,
            tag: transaction.tag,
            payload: transaction.payload,
            created_at: self.clock.now(),
        };
        self.staged.transactions.insert(row.id, row.clone());
        Ok(row)
    }

    async fn insert_transaction_status(
        &mut self,
        entry: NewTransactionStatusEntry,
    ) -> Result<TransactionStatusEntry> {
        self.check(FailPoint::InsertTransactionStatus)?;
        self.staged.next_status_id += 1;
        let row = TransactionStatusEntry {
            id: self.staged.next_status_id,
            transaction_id: entry.transaction_id,
            user_id: entry.user_id,
            reason: entry.reason,
            amount: entry.amount,
            old_status: entry.old_status,
            new_status: entry.new_status,
            payload: entry.payload,
            created_at: self.clock.now(),
        };
        self.staged.transaction_status.push(row.clone());
        Ok(row)
    }

    async fn insert_history(&mut self, entry: NewHistoryEntry) -> Result<WalletHistoryEntry> {
        self.check(FailPoint::InsertHistory)?;
        self.staged.next_history_id += 1;
        let now = self.clock.now();
        let row = WalletHistoryEntry {
            id: self.staged.next_history_id,
            wallet_id: entry.wallet_id,
            old_balance: entry.old_balance,
            new_balance: entry.new_balance,
            action_performed: entry.action_performed,
            status: entry.status,
            hash: String::new(),
            created_at: now,
            updated_at: now,
        };
        self.staged.history.insert(row.id, row.clone());
        Ok(row)
    }

    async fn update_history_hash(&mut self, id: i64, hash: &str) -> Result<WalletHistoryEntry> {
        self.check(FailPoint::UpdateHistoryHash)?;
        let entry = self.history_mut(id)?;
        entry.hash = hash.to_string();
        Ok(entry.clone())
    }

    async fn lock_history_for_update(&mut self, id: i64) -> Result<Option<WalletHistoryEntry>> {
        self.check(FailPoint::LockHistory)?;
        Ok(self.staged.history.get(&id).cloned())
    }

    async fn update_history_status(
        &mut self,
        id: i64,
        status: HistoryStatus,
        hash: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<WalletHistoryEntry> {
        self.check(FailPoint::UpdateHistoryStatus)?;
        let entry = self.history_mut(id)?;
        entry.status = status;
        entry.hash = hash.to_string();
        entry.updated_at = updated_at;
        Ok(entry.clone())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.check(FailPoint::Commit)?;
        let MemoryUnit {
            mut committed,
            staged,
            ..
        } = *self;
        *committed = staged;
        Ok(())
    }
}
