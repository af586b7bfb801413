//! Wallet state and integrity
//!
//! `WalletLedger` owns wallet rows: it opens them signed and refuses to hand
//! a wallet to a mutation unless its hash verifies.

use crate::{
    crypto::HashSigner,
    metrics::Metrics,
    storage::LedgerStore,
    types::{CurrencyId, NewWallet, UserId, Wallet},
    Error, Result,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

/// Wallet registry over a ledger store
pub struct WalletLedger<S: LedgerStore + ?Sized> {
    store: Arc<S>,
    signer: HashSigner,
    metrics: Option<Metrics>,
}

impl<S: LedgerStore + ?Sized> WalletLedger<S> {
    /// Create wallet ledger
    pub fn new(store: Arc<S>, signer: HashSigner) -> Self {
        Self {
            store,
            signer,
            metrics: None,
        }
    }

    /// Record metrics
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Open a zero-balance wallet for `owner` in `currency`
    ///
    /// The row is inserted first and signed afterwards, because the signed
    /// message includes the store-assigned created_at.
    pub async fn open_wallet(&self, owner: UserId, currency: CurrencyId) -> Result<Wallet> {
        let mut unit = self.store.begin().await?;

        let inserted = unit
            .insert_wallet(NewWallet {
                id: Uuid::now_v7(),
                owner_id: owner,
                currency_id: currency,
                balance: Decimal::ZERO,
                locked: false,
            })
            .await?;

        let hash = self.signer.sign_wallet(&inserted);
        let wallet = unit.update_wallet_hash(inserted.id, &hash).await?;
        if !self.signer.verify_wallet(&wallet) {
            return Err(self.integrity_failure(wallet.id));
        }
        unit.commit().await?;

        tracing::info!(
            wallet_id = %wallet.id,
            owner_id = %owner,
            currency_id = %currency,
            "Wallet opened"
        );
        Ok(wallet)
    }

    /// Load a wallet without checking its hash
    pub async fn load(&self, id: Uuid) -> Result<Wallet> {
        self.store
            .get_wallet(id)
            .await?
            .ok_or(Error::WalletNotFound(id))
    }

    /// Load a wallet and fail unless its hash verifies
    pub async fn load_verified(&self, id: Uuid) -> Result<Wallet> {
        let wallet = self.load(id).await?;
        self.ensure_integrity(&wallet)?;
        Ok(wallet)
    }

    /// Check a wallet's hash
    pub fn verify(&self, wallet: &Wallet) -> bool {
        self.signer.verify_wallet(wallet)
    }

    /// Fail with `Error::Integrity` unless the wallet's hash verifies
    pub fn ensure_integrity(&self, wallet: &Wallet) -> Result<()> {
        if self.signer.verify_wallet(wallet) {
            Ok(())
        } else {
            Err(self.integrity_failure(wallet.id))
        }
    }

    fn integrity_failure(&self, wallet_id: Uuid) -> Error {
        if let Some(metrics) = &self.metrics {
            metrics.record_integrity_failure();
        }
        tracing::error!(wallet_id = %wallet_id, "Wallet integrity check failed");
        Error::Integrity(wallet_id)
    }
}
