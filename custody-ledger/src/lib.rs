//! Custody Ledger Core
//!
//! Tamper-evident wallet balances, atomic credit/debit mutations, a
//! verifiable audit trail, and layered exchange rate resolution.
//!
//! # Architecture
//!
//! - **Keyed hashes**: Every wallet and terminal history entry carries an
//!   HMAC-SHA256 digest under a process-held key
//! - **Optimistic concurrency**: Mutations fail on a stale wallet version
//!   instead of overwriting it
//! - **Two-phase history hashing**: Entries are signed over store-assigned
//!   ids and timestamps
//! - **Layered rates**: Account-level overrides, then base rates, then
//!   agent discounts
//!
//! # Invariants
//!
//! - A wallet's hash always matches its signed fields under the current key
//! - Wallet versions only grow, by one per physical write
//! - A mutation writes its balance, transaction and history entry together or not at all
//! - History `created_at` never changes after insert

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]

pub mod audit;
pub mod config;
pub mod crypto;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod rates;
pub mod storage;
pub mod time;
pub mod types;
pub mod wallet;

// Re-exports
pub use audit::{AuditReport, AuditTrail};
pub use config::Config;
pub use crypto::{HashSigner, SigningKey};
pub use error::{Error, Result};
pub use ledger::{TransactionOutcome, TransactionProcessor};
pub use metrics::Metrics;
pub use rates::RateResolver;
pub use storage::{LedgerStore, LedgerUnit, MemoryStore, RateStore};
#[cfg(feature = "postgres")]
pub use storage::PgStore;
pub use time::{with_deadline, Clock, FixedClock, SystemClock};
pub use types::{
    AccountLevelRate, AgentDailyDiscount, CurrencyId, Direction, ExchangeRate, HistoryParams,
    HistoryStatus, RateDirection, RateResult, TransactionParams, TransactionStatus, UserId,
    Validity, Wallet, WalletHistoryEntry,
};
pub use wallet::WalletLedger;
