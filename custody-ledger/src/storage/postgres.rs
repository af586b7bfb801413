//! Postgres store
//!
//! Units map onto database transactions; `lock_*_for_update` issue
//! `SELECT ... FOR UPDATE`. A `PgUnit` dropped without commit is rolled back
//! by sqlx. Database errors are returned unwrapped as `Error::Database`.

use super::{LedgerStore, LedgerUnit, NewHistoryEntry, RateStore};
use crate::{
    config::DatabaseConfig,
    types::{
        AccountLevelRate, AgentDailyDiscount, CurrencyId, ExchangeRate, HistoryStatus,
        NewTransaction, NewTransactionStatusEntry, NewWallet, RateKey, Transaction,
        TransactionStatusEntry, UserId, Validity, Wallet, WalletHistoryEntry,
    },
    Error, Result,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Executor, FromRow, Postgres};
use std::time::Duration;
use uuid::Uuid;

const SCHEMA: &str = include_str!("../../migrations/0001_wallet_ledger.sql");

/// Postgres implementation of every storage trait
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect a pool
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.url)
            .await?;

        tracing::info!(max_connections = config.max_connections, "Connected to ledger database");
        Ok(Self { pool })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Underlying pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist
    pub async fn apply_schema(&self) -> Result<()> {
        (&self.pool).execute(SCHEMA).await?;
        tracing::info!("Ledger schema applied");
        Ok(())
    }

    /// IDs of every wallet, oldest first
    pub async fn wallet_ids(&self) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id FROM wallets ORDER BY created_at, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }
}

#[derive(FromRow)]
struct WalletRow {
    id: Uuid,
    owner_id: Uuid,
    currency_id: i32,
    balance: Decimal,
    hash: String,
    version: i64,
    locked: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<WalletRow> for Wallet {
    fn from(row: WalletRow) -> Self {
        Wallet {
            id: row.id,
            owner_id: UserId(row.owner_id),
            currency_id: CurrencyId(row.currency_id),
            balance: row.balance,
            hash: row.hash,
            version: row.version,
            locked: row.locked,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct TransactionRow {
    id: Uuid,
    wallet_id: Uuid,
    user_id: Uuid,
    amount: Decimal,
    direction: String,
    status: String,
    currency_id: i32,
    fee: Decimal,
    rate: Decimal,
    tag: String,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = Error;

    fn try_from(row: TransactionRow) -> Result<Self> {
        Ok(Transaction {
            id: row.id,
            wallet_id: row.wallet_id,
            user_id: UserId(row.user_id),
            amount: row.amount,
            direction: row.direction.parse()?,
            status: row.status.parse()?,
            currency_id: CurrencyId(row.currency_id),
            fee: row.fee,
            rate: row.rate,
            tag: row.tag,
            payload: row.payload,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct TransactionStatusRow {
    id: i64,
    transaction_id: Uuid,
    user_id: Uuid,
    reason: String,
    amount: Decimal,
    old_status: String,
    new_status: String,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<TransactionStatusRow> for TransactionStatusEntry {
    type Error = Error;

    fn try_from(row: TransactionStatusRow) -> Result<Self> {
        Ok(TransactionStatusEntry {
            id: row.id,
            transaction_id: row.transaction_id,
            user_id: UserId(row.user_id),
            reason: row.reason,
            amount: row.amount,
            old_status: row.old_status.parse()?,
            new_status: row.new_status.parse()?,
            payload: row.payload,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct HistoryRow {
    id: i64,
    wallet_id: Uuid,
    old_balance: Decimal,
    new_balance: Decimal,
    action_performed: String,
    hash: String,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<HistoryRow> for WalletHistoryEntry {
    type Error = Error;

    fn try_from(row: HistoryRow) -> Result<Self> {
        Ok(WalletHistoryEntry {
            id: row.id,
            wallet_id: row.wallet_id,
            old_balance: row.old_balance,
            new_balance: row.new_balance,
            action_performed: row.action_performed,
            status: row.status.parse()?,
            hash: row.hash,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct ExchangeRateRow {
    id: i32,
    base_currency_id: i32,
    quote_currency_id: i32,
    rate: Decimal,
    spread: Decimal,
    direction: String,
    valid_from: Option<DateTime<Utc>>,
    valid_until: Option<DateTime<Utc>>,
    version: DateTime<Utc>,
}

impl TryFrom<ExchangeRateRow> for ExchangeRate {
    type Error = Error;

    fn try_from(row: ExchangeRateRow) -> Result<Self> {
        Ok(ExchangeRate {
            id: row.id,
            base_currency_id: CurrencyId(row.base_currency_id),
            quote_currency_id: CurrencyId(row.quote_currency_id),
            rate: row.rate,
            spread: row.spread,
            direction: row.direction.parse()?,
            validity: Validity {
                from: row.valid_from,
                until: row.valid_until,
            },
            version: row.version,
        })
    }
}

#[derive(FromRow)]
struct AccountLevelRateRow {
    id: i32,
    owner_id: Uuid,
    base_currency_id: i32,
    quote_currency_id: i32,
    rate: Decimal,
    spread: Decimal,
    direction: String,
    valid_from: Option<DateTime<Utc>>,
    valid_until: Option<DateTime<Utc>>,
    version: DateTime<Utc>,
}

impl TryFrom<AccountLevelRateRow> for AccountLevelRate {
    type Error = Error;

    fn try_from(row: AccountLevelRateRow) -> Result<Self> {
        Ok(AccountLevelRate {
            id: row.id,
            owner_id: UserId(row.owner_id),
            base_currency_id: CurrencyId(row.base_currency_id),
            quote_currency_id: CurrencyId(row.quote_currency_id),
            rate: row.rate,
            spread: row.spread,
            direction: row.direction.parse()?,
            validity: Validity {
                from: row.valid_from,
                until: row.valid_until,
            },
            version: row.version,
        })
    }
}

#[derive(FromRow)]
struct DiscountRow {
    id: i32,
    owner_id: Uuid,
    base_currency_id: i32,
    discount_amount: Decimal,
    discount_multiple: Decimal,
    top_up_amount: Decimal,
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
}

impl From<DiscountRow> for AgentDailyDiscount {
    fn from(row: DiscountRow) -> Self {
        AgentDailyDiscount {
            id: row.id,
            owner_id: UserId(row.owner_id),
            base_currency_id: CurrencyId(row.base_currency_id),
            discount_amount: row.discount_amount,
            discount_multiple: row.discount_multiple,
            top_up_amount: row.top_up_amount,
            validity: Validity {
                from: row.start_date,
                until: row.end_date,
            },
        }
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>>
where
    T: TryFrom<R, Error = Error>,
{
    rows.into_iter().map(T::try_from).collect()
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn begin(&self) -> Result<Box<dyn LedgerUnit>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgUnit { tx }))
    }

    async fn get_wallet(&self, id: Uuid) -> Result<Option<Wallet>> {
        let row = sqlx::query_as::<_, WalletRow>(
            r#"
            SELECT * FROM wallets WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Wallet::from))
    }

    async fn get_transaction(&self, id: Uuid) -> Result<Option<Transaction>> {
        let row = sqlx::query_as::<_, TransactionRow>(
            r#"
            SELECT * FROM transactions WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Transaction::try_from).transpose()
    }

    async fn transaction_status_entries(
        &self,
        transaction_id: Uuid,
    ) -> Result<Vec<TransactionStatusEntry>> {
        let rows = sqlx::query_as::<_, TransactionStatusRow>(
            r#"
            SELECT * FROM transaction_history WHERE transaction_id = $1 ORDER BY id
            "#,
        )
        .bind(transaction_id)
        .fetch_all(&self.pool)
        .await?;

        convert_all(rows)
    }

    async fn get_history(&self, id: i64) -> Result<Option<WalletHistoryEntry>> {
        let row = sqlx::query_as::<_, HistoryRow>(
            r#"
            SELECT * FROM wallet_history WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(WalletHistoryEntry::try_from).transpose()
    }

    async fn list_history(&self, wallet_id: Uuid) -> Result<Vec<WalletHistoryEntry>> {
        let rows = sqlx::query_as::<_, HistoryRow>(
            r#"
            SELECT * FROM wallet_history WHERE wallet_id = $1 ORDER BY id
            "#,
        )
        .bind(wallet_id)
        .fetch_all(&self.pool)
        .await?;

        convert_all(rows)
    }
}

#[async_trait]
impl RateStore for PgStore {
    async fn exchange_rates(&self, key: RateKey) -> Result<Vec<ExchangeRate>> {
        let rows = sqlx::query_as::<_, ExchangeRateRow>(
            r#"
            SELECT * FROM exchange_rates
            WHERE base_currency_id = $1 AND quote_currency_id = $2 AND direction = $3
            "#,
        )
        .bind(key.base.0)
        .bind(key.quote.0)
        .bind(key.direction.as_str())
        .fetch_all(&self.pool)
        .await?;

        convert_all(rows)
    }

    async fn account_level_rates(
        &self,
        user: UserId,
        key: RateKey,
    ) -> Result<Vec<AccountLevelRate>> {
        let rows = sqlx::query_as::<_, AccountLevelRateRow>(
            r#"
            SELECT * FROM account_level_rates
            WHERE owner_id = $1 AND base_currency_id = $2 AND quote_currency_id = $3
              AND direction = $4
            "#,
        )
        .bind(user.0)
        .bind(key.base.0)
        .bind(key.quote.0)
        .bind(key.direction.as_str())
        .fetch_all(&self.pool)
        .await?;

        convert_all(rows)
    }

    async fn agent_daily_discounts(
        &self,
        user: UserId,
        base: CurrencyId,
    ) -> Result<Vec<AgentDailyDiscount>> {
        let rows = sqlx::query_as::<_, DiscountRow>(
            r#"
            SELECT * FROM agent_daily_discounts
            WHERE owner_id = $1 AND base_currency_id = $2
            "#,
        )
        .bind(user.0)
        .bind(base.0)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(AgentDailyDiscount::from).collect())
    }
}

/// Atomic unit over one database transaction
pub struct PgUnit {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerUnit for PgUnit {
    async fn insert_wallet(&mut self, wallet: NewWallet) -> Result<Wallet> {
        let row = sqlx::query_as::<_, WalletRow>(
            r#"
            INSERT INTO wallets (id, owner_id, currency_id, balance, locked)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(wallet.id)
        .bind(wallet.owner_id.0)
        .bind(wallet.currency_id.0)
        .bind(wallet.balance)
        .bind(wallet.locked)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(row.into())
    }

    async fn lock_wallet_for_update(&mut self, id: Uuid) -> Result<Option<Wallet>> {
        let row = sqlx::query_as::<_, WalletRow>(
            r#"
            SELECT * FROM wallets WHERE id = $1 FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(row.map(Wallet::from))
    }

    async fn update_wallet_balance(&mut self, id: Uuid, balance: Decimal) -> Result<Wallet> {
        let row = sqlx::query_as::<_, WalletRow>(
            r#"
            UPDATE wallets
            SET balance = $1, version = version + 1, updated_at = now()
            WHERE id = $2
            RETURNING *
            "#,
        )
        .bind(balance)
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(Wallet::from).ok_or(Error::WalletNotFound(id))
    }

    async fn update_wallet_hash(&mut self, id: Uuid, hash: &str) -> Result<Wallet> {
        let row = sqlx::query_as::<_, WalletRow>(
            r#"
            UPDATE wallets
            SET hash = $1, version = version + 1, updated_at = now()
            WHERE id = $2
            RETURNING *
            "#,
        )
        .bind(hash)
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(Wallet::from).ok_or(Error::WalletNotFound(id))
    }

    async fn insert_transaction(&mut self, transaction: NewTransaction) -> Result<Transaction> {
        let row = sqlx::query_as::<_, TransactionRow>(
            r#"
            INSERT INTO transactions
                (id, wallet_id, user_id, amount, direction, status, currency_id, fee, rate, tag, payload)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING *
            "#,
        )
        .bind(transaction.id)
        .bind(transaction.wallet_id)
        .bind(transaction.user_id.0)
        .bind(transaction.amount)
        .bind(transaction.direction.as_str())
        .bind(transaction.status.as_str())
        .bind(transaction.currency_id.0)
        .bind(transaction.fee)
        .bind(transaction.rate)
        .bind(&transaction.tag)
        .bind(&transaction.payload)
        .fetch_one(&mut *self.tx)
        .await?;

        row.try_into()
    }

    async fn insert_transaction_status(
        &mut self,
        entry: NewTransactionStatusEntry,
    ) -> Result<TransactionStatusEntry> {
        let row = sqlx::query_as::<_, TransactionStatusRow>(
            r#"
            INSERT INTO transaction_history
                (transaction_id, user_id, reason, amount, old_status, new_status, payload)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(entry.transaction_id)
        .bind(entry.user_id.0)
        .bind(&entry.reason)
        .bind(entry.amount)
        .bind(entry.old_status.as_str())
        .bind(entry.new_status.as_str())
        .bind(&entry.payload)
        .fetch_one(&mut *self.tx)
        .await?;

        row.try_into()
    }

    async fn insert_history(&mut self, entry: NewHistoryEntry) -> Result<WalletHistoryEntry> {
        let row = sqlx::query_as::<_, HistoryRow>(
            r#"
            INSERT INTO wallet_history (wallet_id, old_balance, new_balance, action_performed, status)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(entry.wallet_id)
        .bind(entry.old_balance)
        .bind(entry.new_balance)
        .bind(&entry.action_performed)
        .bind(entry.status.as_str())
        .fetch_one(&mut *self.tx)
        .await?;

        row.try_into()
    }

    async fn update_history_hash(&mut self, id: i64, hash: &str) -> Result<WalletHistoryEntry> {
        let row = sqlx::query_as::<_, HistoryRow>(
            r#"
            UPDATE wallet_history SET hash = $1 WHERE id = $2
            RETURNING *
            "#,
        )
        .bind(hash)
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.ok_or(Error::HistoryNotFound(id))?.try_into()
    }

    async fn lock_history_for_update(&mut self, id: i64) -> Result<Option<WalletHistoryEntry>> {
        let row = sqlx::query_as::<_, HistoryRow>(
            r#"
            SELECT * FROM wallet_history WHERE id = $1 FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(WalletHistoryEntry::try_from).transpose()
    }

    async fn update_history_status(
        &mut self,
        id: i64,
        status: HistoryStatus,
        hash: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<WalletHistoryEntry> {
        let row = sqlx::query_as::<_, HistoryRow>(
            r#"
            UPDATE wallet_history
            SET status = $1, hash = $2, updated_at = $3
            WHERE id = $4
            RETURNING *
            "#,
        )
        .bind(status.as_str())
        .bind(hash)
        .bind(updated_at)
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.ok_or(Error::HistoryNotFound(id))?.try_into()
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let PgUnit { tx } = *self;
        tx.commit().await?;
        Ok(())
    }
}
