//! Balance mutation orchestration
//!
//! `TransactionProcessor::perform` is the only path that changes a wallet
//! balance. One call runs as a single atomic unit:
//!
//! 1. Verify the caller's wallet snapshot against its hash
//! 2. Compute the new balance from the movement direction
//! 3. Lock the wallet row and compare versions (optimistic check)
//! 4. Persist the balance, then the recomputed hash
//! 5. Re-verify the persisted row
//! 6. Insert the transaction, its status row and a signed history entry
//! 7. Commit
//!
//! Any failure before commit drops the unit, which rolls every write back.
//!
//! # Example
//!
//! ```no_run
//! use custody_ledger::{
//!     CurrencyId, Direction, HashSigner, MemoryStore, SigningKey, TransactionParams,
//!     TransactionProcessor, UserId,
//! };
//! use rust_decimal::Decimal;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> custody_ledger::Result<()> {
//!     let signer = HashSigner::new(SigningKey::from_bytes(b"secret".to_vec())?)?;
//!     let processor = TransactionProcessor::new(Arc::new(MemoryStore::new()), signer);
//!
//!     let wallet = processor
//!         .wallets()
//!         .open_wallet(UserId::new(uuid::Uuid::now_v7()), CurrencyId(1))
//!         .await?;
//!     let params = TransactionParams::new(Decimal::new(100, 0), Direction::Credit, CurrencyId(1), "fund_account");
//!     let outcome = processor.perform(&wallet, params).await?;
//!
//!     assert_eq!(outcome.wallet.balance, Decimal::new(100, 0));
//!     Ok(())
//! }
//! ```

use crate::{
    audit::{self, AuditTrail},
    crypto::HashSigner,
    metrics::Metrics,
    storage::LedgerStore,
    time::Clock,
    types::{
        HistoryParams, HistoryStatus, NewTransaction, NewTransactionStatusEntry, Transaction,
        TransactionParams, TransactionStatusEntry, Wallet, WalletHistoryEntry,
    },
    wallet::WalletLedger,
    Error, Result,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Rows written by one successful `perform`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionOutcome {
    /// Wallet as persisted, with its new balance, hash and version
    pub wallet: Wallet,
    /// Transaction record
    pub transaction: Transaction,
    /// Transaction status row
    pub status_entry: TransactionStatusEntry,
    /// Signed audit entry
    pub history: WalletHistoryEntry,
}

/// Atomic credit/debit processor
pub struct TransactionProcessor<S: LedgerStore + ?Sized> {
    store: Arc<S>,
    signer: HashSigner,
    wallets: WalletLedger<S>,
    audit: AuditTrail<S>,
    metrics: Option<Metrics>,
}

impl<S: LedgerStore + ?Sized> TransactionProcessor<S> {
    /// Create processor
    pub fn new(store: Arc<S>, signer: HashSigner) -> Self {
        Self {
            wallets: WalletLedger::new(Arc::clone(&store), signer.clone()),
            audit: AuditTrail::new(Arc::clone(&store), signer.clone()),
            store,
            signer,
            metrics: None,
        }
    }

    /// Use `clock` for audit `updated_at` stamps
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.audit = self.audit.with_clock(clock);
        self
    }

    /// Record metrics
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.wallets = self.wallets.with_metrics(metrics.clone());
        self.audit = self.audit.with_metrics(metrics.clone());
        self.metrics = Some(metrics);
        self
    }

    /// Wallet registry sharing this processor's store and key
    pub fn wallets(&self) -> &WalletLedger<S> {
        &self.wallets
    }

    /// Audit trail sharing this processor's store and key
    pub fn audit(&self) -> &AuditTrail<S> {
        &self.audit
    }

    /// Apply one credit or debit to `wallet`
    ///
    /// `wallet` is the caller's snapshot; its version must still be current.
    /// A stale snapshot fails with `Error::Concurrency` and is never retried
    /// here. The locked row must verify as well; a row edited out of band
    /// fails with `Error::Integrity` and is left as found. Balance
    /// sufficiency is the caller's precondition.
    pub async fn perform(
        &self,
        wallet: &Wallet,
        params: TransactionParams,
    ) -> Result<TransactionOutcome> {
        let started = Instant::now();

        self.wallets.ensure_integrity(wallet)?;

        if params.amount <= Decimal::ZERO {
            return Err(Error::InvalidAmount(format!(
                "amount must be positive, got {}",
                params.amount
            )));
        }
        if params.amount.normalize().scale() > self.signer.balance_scale() {
            return Err(Error::InvalidAmount(format!(
                "amount {} has more than {} decimal places",
                params.amount,
                self.signer.balance_scale()
            )));
        }

        let mut unit = self.store.begin().await?;

        let current = unit
            .lock_wallet_for_update(wallet.id)
            .await?
            .ok_or(Error::WalletNotFound(wallet.id))?;
        self.wallets.ensure_integrity(&current)?;
        if current.version != wallet.version {
            if let Some(metrics) = &self.metrics {
                metrics.record_concurrency_conflict();
            }
            warn!(
                wallet_id = %wallet.id,
                expected = wallet.version,
                found = current.version,
                "Wallet version mismatch"
            );
            return Err(Error::Concurrency {
                wallet_id: wallet.id,
                expected: wallet.version,
                found: current.version,
            });
        }

        let new_balance = params.direction.apply(current.balance, params.amount)?;
        let with_balance = unit.update_wallet_balance(current.id, new_balance).await?;
        let hash = self.signer.sign_wallet(&with_balance);
        let persisted = unit.update_wallet_hash(current.id, &hash).await?;
        self.wallets.ensure_integrity(&persisted)?;
        debug!(
            wallet_id = %persisted.id,
            version = persisted.version,
            "Wallet balance and hash staged"
        );

        let transaction = unit
            .insert_transaction(NewTransaction {
                id: Uuid::now_v7(),
                wallet_id: persisted.id,
                user_id: persisted.owner_id,
                amount: params.amount,
                direction: params.direction,
                status: params.status,
                currency_id: params.currency_id,
                fee: params.fee,
                rate: params.rate,
                tag: params.tag.clone(),
                payload: params.payload.clone(),
            })
            .await?;

        let status_entry = unit
            .insert_transaction_status(NewTransactionStatusEntry {
                transaction_id: transaction.id,
                user_id: transaction.user_id,
                reason: params.tag.clone(),
                amount: params.amount,
                old_status: params.status,
                new_status: params.status,
                payload: params.payload,
            })
            .await?;

        let history = audit::record(
            &mut unit,
            &self.signer,
            HistoryParams {
                wallet_id: persisted.id,
                old_balance: current.balance,
                new_balance,
                action_performed: params.tag,
            },
            HistoryStatus::Completed,
        )
        .await?;

        unit.commit().await?;

        if let Some(metrics) = &self.metrics {
            metrics.record_perform(started.elapsed().as_secs_f64());
        }
        info!(
            wallet_id = %persisted.id,
            transaction_id = %transaction.id,
            history_id = history.id,
            direction = %transaction.direction,
            version = persisted.version,
            "Transaction performed"
        );

        Ok(TransactionOutcome {
            wallet: persisted,
            transaction,
            status_entry,
            history,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SigningKey;
    use crate::storage::{FailPoint, MemoryStore};
    use crate::types::{CurrencyId, Direction, TransactionStatus, UserId};
    use rust_decimal_macros::dec;

    fn processor() -> (Arc<MemoryStore>, TransactionProcessor<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let signer = HashSigner::new(SigningKey::from_bytes(b"processor-key".to_vec()).unwrap()).unwrap();
        (store.clone(), TransactionProcessor::new(store, signer))
    }

    async fn funded(processor: &TransactionProcessor<MemoryStore>, amount: Decimal) -> Wallet {
        let wallet = processor
            .wallets()
            .open_wallet(UserId::new(Uuid::now_v7()), CurrencyId(840))
            .await
            .unwrap();
        let params = TransactionParams::new(amount, Direction::Credit, CurrencyId(840), "fund_account");
        processor.perform(&wallet, params).await.unwrap().wallet
    }

    #[tokio::test]
    async fn test_credit_writes_every_row() {
        let (store, processor) = processor();
        let wallet = processor
            .wallets()
            .open_wallet(UserId::new(Uuid::now_v7()), CurrencyId(840))
            .await
            .unwrap();

        let params = TransactionParams::new(dec!(100), Direction::Credit, CurrencyId(840), "fund_account")
            .with_payload(serde_json::json!({"source": "bank"}));
        let outcome = processor.perform(&wallet, params).await.unwrap();

        assert_eq!(outcome.wallet.balance, dec!(100));
        assert_eq!(outcome.wallet.version, wallet.version + 2);
        assert!(processor.wallets().verify(&outcome.wallet));

        assert_eq!(outcome.transaction.user_id, wallet.owner_id);
        assert_eq!(outcome.transaction.status, TransactionStatus::Pending);
        assert_eq!(outcome.status_entry.reason, "fund_account");

        assert_eq!(outcome.history.old_balance, Decimal::ZERO);
        assert_eq!(outcome.history.new_balance, dec!(100));
        assert_eq!(outcome.history.status, HistoryStatus::Completed);
        assert!(processor.audit().verify(outcome.history.id).await.unwrap());

        assert_eq!(store.transaction_count().await, 1);
        let stored = processor.wallets().load_verified(wallet.id).await.unwrap();
        assert_eq!(stored, outcome.wallet);
    }

    #[tokio::test]
    async fn test_debit_subtracts() {
        let (_, processor) = processor();
        let wallet = funded(&processor, dec!(100)).await;

        let params = TransactionParams::new(dec!(40), Direction::Debit, CurrencyId(840), "ext-transfer")
            .with_fee(dec!(1.5));
        let outcome = processor.perform(&wallet, params).await.unwrap();

        assert_eq!(outcome.wallet.balance, dec!(60));
        assert_eq!(outcome.transaction.fee, dec!(1.5));
        assert_eq!(outcome.history.old_balance, dec!(100));
        assert_eq!(outcome.history.new_balance, outcome.wallet.balance);
    }

    #[tokio::test]
    async fn test_stale_snapshot_is_rejected() {
        let (store, processor) = processor();
        let wallet = funded(&processor, dec!(100)).await;

        let params = TransactionParams::new(dec!(10), Direction::Debit, CurrencyId(840), "swap");
        processor.perform(&wallet, params.clone()).await.unwrap();

        let err = processor.perform(&wallet, params).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Concurrency { expected, found, .. } if found == expected + 2
        ));
        assert!(err.is_retryable());
        assert_eq!(store.transaction_count().await, 2);
    }

    #[tokio::test]
    async fn test_tampered_snapshot_persists_nothing() {
        let (store, processor) = processor();
        let wallet = funded(&processor, dec!(100)).await;

        let mut forged = wallet.clone();
        forged.balance = dec!(1_000_000);
        let params = TransactionParams::new(dec!(10), Direction::Debit, CurrencyId(840), "swap");

        let err = processor.perform(&forged, params).await.unwrap_err();
        assert!(matches!(err, Error::Integrity(id) if id == wallet.id));
        assert_eq!(store.transaction_count().await, 1);
        assert_eq!(processor.wallets().load(wallet.id).await.unwrap(), wallet);
    }

    #[tokio::test]
    async fn test_tampered_row_under_lock_is_not_repaired() {
        let (store, processor) = processor();
        let wallet = funded(&processor, dec!(100)).await;

        let mut edited = wallet.clone();
        edited.balance = dec!(1_000_000);
        store.overwrite_wallet(edited.clone()).await;

        let params = TransactionParams::new(dec!(10), Direction::Credit, CurrencyId(840), "swap");
        let err = processor.perform(&wallet, params).await.unwrap_err();
        assert!(matches!(err, Error::Integrity(id) if id == wallet.id));

        assert_eq!(processor.wallets().load(wallet.id).await.unwrap(), edited);
        assert_eq!(store.transaction_count().await, 1);
        assert_eq!(processor.audit().entries(wallet.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_amount_finer_than_balance_scale_is_rejected() {
        let (store, processor) = processor();
        let wallet = funded(&processor, dec!(1)).await;

        let params = TransactionParams::new(dec!(0.000000001), Direction::Credit, CurrencyId(840), "swap");
        let err = processor.perform(&wallet, params).await.unwrap_err();
        assert!(matches!(err, Error::InvalidAmount(_)));
        assert_eq!(processor.wallets().load(wallet.id).await.unwrap(), wallet);
        assert_eq!(store.transaction_count().await, 1);

        let padded = TransactionParams::new(dec!(0.0000000100), Direction::Credit, CurrencyId(840), "swap");
        let outcome = processor.perform(&wallet, padded).await.unwrap();
        assert_eq!(outcome.wallet.balance, dec!(1.00000001));
    }

    #[tokio::test]
    async fn test_overflowing_credit_is_rejected() {
        let (store, processor) = processor();
        let wallet = funded(&processor, Decimal::MAX).await;
        assert!(processor.wallets().verify(&wallet));

        let params = TransactionParams::new(dec!(1), Direction::Credit, CurrencyId(840), "swap");
        let err = processor.perform(&wallet, params).await.unwrap_err();
        assert!(matches!(err, Error::InvalidAmount(_)));

        assert_eq!(processor.wallets().load_verified(wallet.id).await.unwrap(), wallet);
        assert_eq!(store.transaction_count().await, 1);
    }

    #[tokio::test]
    async fn test_non_positive_amount_is_rejected() {
        let (_, processor) = processor();
        let wallet = funded(&processor, dec!(5)).await;

        for amount in [Decimal::ZERO, dec!(-3)] {
            let params = TransactionParams::new(amount, Direction::Credit, CurrencyId(840), "swap");
            assert!(matches!(
                processor.perform(&wallet, params).await,
                Err(Error::InvalidAmount(_))
            ));
        }
        assert_eq!(processor.wallets().load(wallet.id).await.unwrap(), wallet);
    }

    #[tokio::test]
    async fn test_late_failure_rolls_back_everything() {
        let (store, processor) = processor();
        let wallet = funded(&processor, dec!(100)).await;
        store.inject_failure(FailPoint::UpdateHistoryHash);

        let params = TransactionParams::new(dec!(25), Direction::Debit, CurrencyId(840), "swap");
        assert!(processor.perform(&wallet, params.clone()).await.is_err());

        assert_eq!(processor.wallets().load(wallet.id).await.unwrap(), wallet);
        assert_eq!(store.transaction_count().await, 1);
        assert_eq!(processor.audit().entries(wallet.id).await.unwrap().len(), 1);

        let outcome = processor.perform(&wallet, params).await.unwrap();
        assert_eq!(outcome.wallet.balance, dec!(75));
    }

    #[tokio::test]
    async fn test_metrics_are_recorded() {
        let store = Arc::new(MemoryStore::new());
        let signer = HashSigner::new(SigningKey::from_bytes(b"processor-key".to_vec()).unwrap()).unwrap();
        let metrics = Metrics::new().unwrap();
        let processor = TransactionProcessor::new(store, signer).with_metrics(metrics.clone());

        let wallet = funded(&processor, dec!(10)).await;
        let params = TransactionParams::new(dec!(1), Direction::Debit, CurrencyId(840), "swap");
        let _ = processor.perform(&wallet, params.clone()).await.unwrap();
        let _ = processor.perform(&wallet, params).await.unwrap_err();

        assert_eq!(metrics.performs_total.get(), 2);
        assert_eq!(metrics.concurrency_conflicts.get(), 1);
    }
}
