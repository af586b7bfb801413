//! Core types for the custody ledger
//!
//! All types are designed for:
//! - Exact arithmetic (Decimal for money and rates)
//! - Stable string forms for enums (they are persisted as text)
//! - Deterministic canonical encoding where a value is signed

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::Error;

/// Owner of wallets and rate overrides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    /// Create new user ID
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Get the inner UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Currency identifier as assigned by the currency registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CurrencyId(pub i32);

impl fmt::Display for CurrencyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Direction of a balance movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Direction {
    /// Adds to the balance
    Credit,
    /// Subtracts from the balance
    Debit,
}

impl Direction {
    /// Wire value
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Credit => "credit",
            Direction::Debit => "debit",
        }
    }

    /// Apply this direction to a balance
    ///
    /// Fails with `InvalidAmount` when the result leaves the `Decimal` range.
    pub fn apply(&self, balance: Decimal, amount: Decimal) -> Result<Decimal, Error> {
        let moved = match self {
            Direction::Credit => balance.checked_add(amount),
            Direction::Debit => balance.checked_sub(amount),
        };
        moved.ok_or_else(|| {
            Error::InvalidAmount(format!(
                "{} of {} overflows balance {}",
                self.as_str(),
                amount,
                balance
            ))
        })
    }
}

impl FromStr for Direction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "credit" => Ok(Direction::Credit),
            "debit" => Ok(Direction::Debit),
            other => Err(Error::InvalidDirection(other.to_string())),
        }
    }
}

impl TryFrom<String> for Direction {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Direction> for String {
    fn from(value: Direction) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TransactionStatus {
    /// Awaiting processing
    Pending,
    /// Swap approved by an operator
    SwapApproved,
    /// Being processed by a downstream rail
    Processing,
    /// Completed (terminal)
    Completed,
    /// Failed (terminal)
    Failed,
    /// Canceled (terminal)
    Canceled,
    /// Flagged for manual review
    Issue,
}

impl TransactionStatus {
    /// Wire value
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::SwapApproved => "swap-approved",
            TransactionStatus::Processing => "processing",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Canceled => "canceled",
            TransactionStatus::Issue => "issue",
        }
    }

    /// Check if status is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Completed | TransactionStatus::Failed | TransactionStatus::Canceled
        )
    }
}

impl FromStr for TransactionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransactionStatus::Pending),
            "swap-approved" => Ok(TransactionStatus::SwapApproved),
            "processing" => Ok(TransactionStatus::Processing),
            "completed" => Ok(TransactionStatus::Completed),
            "failed" => Ok(TransactionStatus::Failed),
            "canceled" => Ok(TransactionStatus::Canceled),
            "issue" => Ok(TransactionStatus::Issue),
            other => Err(Error::InvalidStatus(other.to_string())),
        }
    }
}

impl TryFrom<String> for TransactionStatus {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TransactionStatus> for String {
    fn from(value: TransactionStatus) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a wallet history entry
///
/// Only terminal statuses carry an integrity hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum HistoryStatus {
    /// Recorded, no terminal effect yet (unsigned)
    New,
    /// Movement completed (signed)
    Completed,
    /// Movement failed (signed)
    Failed,
}

impl HistoryStatus {
    /// Wire value
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryStatus::New => "new",
            HistoryStatus::Completed => "completed",
            HistoryStatus::Failed => "failed",
        }
    }

    /// Whether entries in this status must carry a hash
    pub fn is_signed(&self) -> bool {
        !matches!(self, HistoryStatus::New)
    }
}

impl FromStr for HistoryStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(HistoryStatus::New),
            "completed" => Ok(HistoryStatus::Completed),
            "failed" => Ok(HistoryStatus::Failed),
            other => Err(Error::InvalidStatus(other.to_string())),
        }
    }
}

impl TryFrom<String> for HistoryStatus {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<HistoryStatus> for String {
    fn from(value: HistoryStatus) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for HistoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Custodial balance record for one user/currency pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    /// Wallet ID
    pub id: Uuid,

    /// Owner of the wallet
    pub owner_id: UserId,

    /// Currency held
    pub currency_id: CurrencyId,

    /// Current balance (exact decimal)
    pub balance: Decimal,

    /// Keyed integrity digest (hex)
    pub hash: String,

    /// Bumped by every physical write to the row
    pub version: i64,

    /// Locked flag
    pub locked: bool,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    /// Balance rounded for display
    ///
    /// Never use the result for arithmetic or signing.
    pub fn display_balance(&self, decimal_places: u32) -> String {
        let mut rounded = self.balance.round_dp(decimal_places);
        rounded.rescale(decimal_places);
        rounded.to_string()
    }
}

/// Fields a store needs to insert a wallet row
#[derive(Debug, Clone)]
pub struct NewWallet {
    /// Wallet ID
    pub id: Uuid,
    /// Owner
    pub owner_id: UserId,
    /// Currency
    pub currency_id: CurrencyId,
    /// Opening balance
    pub balance: Decimal,
    /// Locked flag
    pub locked: bool,
}

/// Parameters of one ledger movement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionParams {
    /// Amount moved (must be positive)
    pub amount: Decimal,

    /// Credit or debit
    pub direction: Direction,

    /// Currency of the movement
    pub currency_id: CurrencyId,

    /// Fee charged
    #[serde(default)]
    pub fee: Decimal,

    /// Rate applied, if the movement is part of a conversion
    #[serde(default)]
    pub rate: Decimal,

    /// Action tag, e.g. `swap`, `ext-transfer`
    pub tag: String,

    /// Initial transaction status
    #[serde(default = "default_transaction_status")]
    pub status: TransactionStatus,

    /// Opaque payload (recipient snapshot etc.)
    #[serde(default)]
    pub payload: serde_json::Value,
}

fn default_transaction_status() -> TransactionStatus {
    TransactionStatus::Pending
}

impl TransactionParams {
    /// Create parameters with zero fee and rate, pending status and an empty payload
    pub fn new(
        amount: Decimal,
        direction: Direction,
        currency_id: CurrencyId,
        tag: impl Into<String>,
    ) -> Self {
        Self {
            amount,
            direction,
            currency_id,
            fee: Decimal::ZERO,
            rate: Decimal::ZERO,
            tag: tag.into(),
            status: TransactionStatus::Pending,
            payload: serde_json::Value::Null,
        }
    }

    /// Set the fee
    pub fn with_fee(mut self, fee: Decimal) -> Self {
        self.fee = fee;
        self
    }

    /// Set the applied rate
    pub fn with_rate(mut self, rate: Decimal) -> Self {
        self.rate = rate;
        self
    }

    /// Set the initial status
    pub fn with_status(mut self, status: TransactionStatus) -> Self {
        self.status = status;
        self
    }

    /// Attach a payload
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Immutable record of one ledger movement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction ID (UUIDv7)
    pub id: Uuid,
    /// Wallet moved
    pub wallet_id: Uuid,
    /// Wallet owner at the time of the movement
    pub user_id: UserId,
    /// Amount
    pub amount: Decimal,
    /// Credit or debit
    pub direction: Direction,
    /// Status at creation
    pub status: TransactionStatus,
    /// Currency
    pub currency_id: CurrencyId,
    /// Fee
    pub fee: Decimal,
    /// Rate
    pub rate: Decimal,
    /// Action tag
    pub tag: String,
    /// Opaque payload
    pub payload: serde_json::Value,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
}

/// Fields a store needs to insert a transaction row
#[derive(Debug, Clone)]
pub struct NewTransaction {
    /// Transaction ID
    pub id: Uuid,
    /// Wallet moved
    pub wallet_id: Uuid,
    /// Wallet owner
    pub user_id: UserId,
    /// Amount
    pub amount: Decimal,
    /// Direction
    pub direction: Direction,
    /// Status
    pub status: TransactionStatus,
    /// Currency
    pub currency_id: CurrencyId,
    /// Fee
    pub fee: Decimal,
    /// Rate
    pub rate: Decimal,
    /// Tag
    pub tag: String,
    /// Payload
    pub payload: serde_json::Value,
}

/// Status trail row for a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionStatusEntry {
    /// Store-assigned ID
    pub id: i64,
    /// Transaction described
    pub transaction_id: Uuid,
    /// Owner
    pub user_id: UserId,
    /// Reason (the transaction tag)
    pub reason: String,
    /// Amount
    pub amount: Decimal,
    /// Status before
    pub old_status: TransactionStatus,
    /// Status after
    pub new_status: TransactionStatus,
    /// Payload
    pub payload: serde_json::Value,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
}

/// Fields a store needs to insert a transaction status row
#[derive(Debug, Clone)]
pub struct NewTransactionStatusEntry {
    /// Transaction described
    pub transaction_id: Uuid,
    /// Owner
    pub user_id: UserId,
    /// Reason
    pub reason: String,
    /// Amount
    pub amount: Decimal,
    /// Status before
    pub old_status: TransactionStatus,
    /// Status after
    pub new_status: TransactionStatus,
    /// Payload
    pub payload: serde_json::Value,
}

/// One balance transition in the audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletHistoryEntry {
    /// Store-assigned ID (part of the signed message)
    pub id: i64,
    /// Wallet
    pub wallet_id: Uuid,
    /// Balance before
    pub old_balance: Decimal,
    /// Balance after
    pub new_balance: Decimal,
    /// Action that caused the transition
    pub action_performed: String,
    /// Status
    pub status: HistoryStatus,
    /// Integrity hash, empty while status is `new`
    pub hash: String,
    /// Created timestamp (never rewritten)
    pub created_at: DateTime<Utc>,
    /// Updated timestamp
    pub updated_at: DateTime<Utc>,
}

/// Parameters for a new history entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryParams {
    /// Wallet
    pub wallet_id: Uuid,
    /// Balance before
    pub old_balance: Decimal,
    /// Balance after
    pub new_balance: Decimal,
    /// Action performed
    pub action_performed: String,
}

/// Direction of a quoted rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RateDirection {
    /// Platform buys the base currency
    Buy,
    /// Platform sells the base currency
    Sell,
}

impl RateDirection {
    /// Wire value
    pub fn as_str(&self) -> &'static str {
        match self {
            RateDirection::Buy => "buy",
            RateDirection::Sell => "sell",
        }
    }
}

impl FromStr for RateDirection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(RateDirection::Buy),
            "sell" => Ok(RateDirection::Sell),
            other => Err(Error::InvalidDirection(other.to_string())),
        }
    }
}

impl TryFrom<String> for RateDirection {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RateDirection> for String {
    fn from(value: RateDirection) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for RateDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validity window of a rate or discount record
///
/// Unset bounds are open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Validity {
    /// Start of validity
    pub from: Option<DateTime<Utc>>,
    /// End of validity
    pub until: Option<DateTime<Utc>>,
}

impl Validity {
    /// Window with both bounds unset
    pub fn open() -> Self {
        Self::default()
    }

    /// Window starting at `from` with no end
    pub fn starting(from: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            until: None,
        }
    }

    /// Window between two instants
    pub fn between(from: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            until: Some(until),
        }
    }

    /// Half-open check used for rates: `from <= now < until`
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| from <= now) && self.until.map_or(true, |until| now < until)
    }

    /// Closed check used for discounts: `from <= now <= until`
    pub fn contains_inclusive(&self, now: DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| from <= now) && self.until.map_or(true, |until| now <= until)
    }
}

/// Key of a rate lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RateKey {
    /// Base currency
    pub base: CurrencyId,
    /// Quote currency
    pub quote: CurrencyId,
    /// Direction
    pub direction: RateDirection,
}

impl fmt::Display for RateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} {}", self.base, self.quote, self.direction)
    }
}

/// Platform-wide base rate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRate {
    /// Record ID
    pub id: i32,
    /// Base currency
    pub base_currency_id: CurrencyId,
    /// Quote currency
    pub quote_currency_id: CurrencyId,
    /// Rate
    pub rate: Decimal,
    /// Spread
    pub spread: Decimal,
    /// Direction
    pub direction: RateDirection,
    /// Validity window
    pub validity: Validity,
    /// Version timestamp
    pub version: DateTime<Utc>,
}

/// User-specific override of the base rate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountLevelRate {
    /// Record ID
    pub id: i32,
    /// Owner the override applies to
    pub owner_id: UserId,
    /// Base currency
    pub base_currency_id: CurrencyId,
    /// Quote currency
    pub quote_currency_id: CurrencyId,
    /// Rate
    pub rate: Decimal,
    /// Spread
    pub spread: Decimal,
    /// Direction
    pub direction: RateDirection,
    /// Validity window
    pub validity: Validity,
    /// Version timestamp
    pub version: DateTime<Utc>,
}

/// Time-boxed promotional reduction for an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDailyDiscount {
    /// Record ID
    pub id: i32,
    /// Agent
    pub owner_id: UserId,
    /// Base currency the discount applies to
    pub base_currency_id: CurrencyId,
    /// Discount per full multiple
    pub discount_amount: Decimal,
    /// Size of one multiple
    pub discount_multiple: Decimal,
    /// Amount topped up in the window
    pub top_up_amount: Decimal,
    /// Active window (inclusive bounds)
    pub validity: Validity,
}

impl AgentDailyDiscount {
    /// `discount_amount * floor(top_up_amount / discount_multiple)`
    ///
    /// Returns `None` for a zero multiple or when the product overflows.
    pub fn total_discount(&self) -> Option<Decimal> {
        let multiples = self.top_up_amount.checked_div(self.discount_multiple)?.floor();
        self.discount_amount.checked_mul(multiples)
    }
}

/// Outcome of a rate resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateResult {
    /// Effective rate after overrides and discount
    pub rate: Decimal,
    /// True when the global base rate was selected
    pub is_based_rate: bool,
    /// True when an active discount was applied
    pub has_discount: bool,
    /// Discount subtracted from the selected rate
    pub discount: Decimal,
    /// Spread of the selected record
    pub spread: Decimal,
    /// Base rate value (zero unless selected)
    pub exchange_rate: Decimal,
    /// Base rate record ID (unless account-level was selected)
    pub exchange_rate_id: Option<i32>,
    /// Base rate window
    pub exchange_rate_validity: Option<Validity>,
    /// Account-level rate value (zero unless selected)
    pub account_level_rate: Decimal,
    /// Account-level record ID
    pub account_level_rate_id: Option<i32>,
    /// Account-level window
    pub account_level_validity: Option<Validity>,
    /// Applied discount record ID
    pub discount_id: Option<i32>,
    /// Applied discount window
    pub discount_validity: Option<Validity>,
}

impl RateResult {
    /// Lossy float conversion for display
    pub fn rate_f64(&self) -> f64 {
        use rust_decimal::prelude::ToPrimitive;
        self.rate.to_f64().unwrap_or(0.0)
    }

    /// Rate rounded for display
    pub fn display_rate(&self, decimal_places: u32) -> String {
        let mut rounded = self.rate.round_dp(decimal_places);
        rounded.rescale(decimal_places);
        rounded.to_string()
    }
}
