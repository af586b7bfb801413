//! Append-only audit trail of wallet balance transitions
//!
//! Entries are hashed in two phases: the row is inserted unsigned so the
//! store can assign its id and created_at, then the hash over those
//! server-assigned fields is computed and written in a follow-up update
//! inside the same unit. Entries in status `new` stay unsigned until a
//! status transition gives them a terminal status.

use crate::{
    crypto::HashSigner,
    metrics::Metrics,
    storage::{LedgerStore, LedgerUnit, NewHistoryEntry},
    time::{Clock, SystemClock},
    types::{HistoryParams, HistoryStatus, WalletHistoryEntry},
    Error, Result,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Result of verifying every entry of one wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditReport {
    /// Wallet verified
    pub wallet_id: Uuid,
    /// Entries examined
    pub checked: usize,
    /// Entries still in status `new`
    pub unsigned: usize,
    /// Entries whose hash does not match
    pub invalid: Vec<i64>,
}

impl AuditReport {
    /// No entry failed verification
    pub fn is_clean(&self) -> bool {
        self.invalid.is_empty()
    }
}

/// Audit trail over a ledger store
pub struct AuditTrail<S: LedgerStore + ?Sized> {
    store: Arc<S>,
    signer: HashSigner,
    clock: Arc<dyn Clock>,
    metrics: Option<Metrics>,
}

impl<S: LedgerStore + ?Sized> AuditTrail<S> {
    /// Create audit trail on the system clock
    pub fn new(store: Arc<S>, signer: HashSigner) -> Self {
        Self {
            store,
            signer,
            clock: Arc::new(SystemClock),
            metrics: None,
        }
    }

    /// Use `clock` for `updated_at` stamps
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Record metrics
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Create an entry in its own atomic unit
    pub async fn create(
        &self,
        params: HistoryParams,
        status: HistoryStatus,
    ) -> Result<WalletHistoryEntry> {
        let mut unit = self.store.begin().await?;
        let entry = record(&mut unit, &self.signer, params, status).await?;
        unit.commit().await?;
        Ok(entry)
    }

    /// Move an entry to `new_status`, re-signing it over its original created_at
    pub async fn transition_status(
        &self,
        id: i64,
        new_status: HistoryStatus,
    ) -> Result<WalletHistoryEntry> {
        let mut unit = self.store.begin().await?;

        let base = unit
            .lock_history_for_update(id)
            .await?
            .ok_or(Error::HistoryNotFound(id))?;
        let old_status = base.status;

        let hash = if new_status.is_signed() {
            let for_hash = WalletHistoryEntry {
                status: new_status,
                ..base
            };
            self.signer.sign_history(&for_hash)?
        } else {
            String::new()
        };

        let updated = unit
            .update_history_status(id, new_status, &hash, self.clock.now())
            .await?;
        unit.commit().await?;

        if let Some(metrics) = &self.metrics {
            metrics.record_history_transition();
        }
        tracing::info!(
            history_id = id,
            wallet_id = %updated.wallet_id,
            from = %old_status,
            to = %new_status,
            "Wallet history status updated"
        );

        Ok(updated)
    }

    /// Verify one entry against its stored hash
    pub async fn verify(&self, id: i64) -> Result<bool> {
        let entry = self
            .store
            .get_history(id)
            .await?
            .ok_or(Error::HistoryNotFound(id))?;

        let valid = self.signer.verify_history(&entry);
        if !valid {
            tracing::warn!(history_id = id, wallet_id = %entry.wallet_id, "Wallet history hash mismatch");
        }
        Ok(valid)
    }

    /// Entries of a wallet, oldest first
    pub async fn entries(&self, wallet_id: Uuid) -> Result<Vec<WalletHistoryEntry>> {
        self.store.list_history(wallet_id).await
    }

    /// Verify every entry of a wallet
    pub async fn verify_wallet_trail(&self, wallet_id: Uuid) -> Result<AuditReport> {
        let entries = self.store.list_history(wallet_id).await?;

        let mut report = AuditReport {
            wallet_id,
            checked: entries.len(),
            unsigned: 0,
            invalid: Vec::new(),
        };
        for entry in &entries {
            if !entry.status.is_signed() {
                report.unsigned += 1;
            } else if !self.signer.verify_history(entry) {
                report.invalid.push(entry.id);
            }
        }

        if report.is_clean() {
            tracing::debug!(wallet_id = %wallet_id, checked = report.checked, "Audit trail verified");
        } else {
            tracing::warn!(
                wallet_id = %wallet_id,
                invalid = report.invalid.len(),
                "Audit trail contains tampered entries"
            );
        }
        Ok(report)
    }
}

/// Insert an entry inside `unit`, signing it when `status` is terminal
#[allow(clippy::borrowed_box)]
pub(crate) async fn record(
    unit: &mut Box<dyn LedgerUnit>,
    signer: &HashSigner,
    params: HistoryParams,
    status: HistoryStatus,
) -> Result<WalletHistoryEntry> {
    let inserted = unit
        .insert_history(NewHistoryEntry {
            wallet_id: params.wallet_id,
            old_balance: params.old_balance,
            new_balance: params.new_balance,
            action_performed: params.action_performed,
            status,
        })
        .await?;

    if !status.is_signed() {
        return Ok(inserted);
    }

    let hash = signer.sign_history(&inserted).map_err(|e| {
        Error::InvalidHistoryEntry(format!(
            "entry {} inserted but could not be signed: {}",
            inserted.id, e
        ))
    })?;
    unit.update_history_hash(inserted.id, &hash).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SigningKey;
    use crate::storage::{FailPoint, MemoryStore};
    use crate::time::FixedClock;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn signer() -> HashSigner {
        HashSigner::new(SigningKey::from_bytes(b"audit-key".to_vec()).unwrap()).unwrap()
    }

    fn params(wallet_id: Uuid) -> HistoryParams {
        HistoryParams {
            wallet_id,
            old_balance: dec!(100),
            new_balance: dec!(75.50),
            action_performed: "ext-transfer".to_string(),
        }
    }

    fn trail() -> (Arc<MemoryStore>, Arc<FixedClock>, AuditTrail<MemoryStore>) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap(),
        ));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let trail = AuditTrail::new(store.clone(), signer()).with_clock(clock.clone());
        (store, clock, trail)
    }

    #[tokio::test]
    async fn test_new_entry_is_unsigned_and_verifies() {
        let (_, _, trail) = trail();
        let entry = trail
            .create(params(Uuid::now_v7()), HistoryStatus::New)
            .await
            .unwrap();

        assert!(entry.hash.is_empty());
        assert!(trail.verify(entry.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_completed_entry_is_signed_with_assigned_id() {
        let (_, _, trail) = trail();
        let entry = trail
            .create(params(Uuid::now_v7()), HistoryStatus::Completed)
            .await
            .unwrap();

        assert!(entry.id > 0);
        assert_eq!(entry.hash, signer().sign_history(&entry).unwrap());
        assert!(trail.verify(entry.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_transitions_keep_created_at_and_change_hash() {
        let (_, clock, trail) = trail();
        let entry = trail
            .create(params(Uuid::now_v7()), HistoryStatus::New)
            .await
            .unwrap();

        clock.advance(chrono::Duration::minutes(5));
        let completed = trail
            .transition_status(entry.id, HistoryStatus::Completed)
            .await
            .unwrap();
        clock.advance(chrono::Duration::minutes(5));
        let failed = trail
            .transition_status(entry.id, HistoryStatus::Failed)
            .await
            .unwrap();

        assert_ne!(completed.hash, failed.hash);
        assert_eq!(completed.created_at, entry.created_at);
        assert_eq!(failed.created_at, entry.created_at);
        assert!(failed.updated_at > completed.updated_at);
        assert!(trail.verify(entry.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_transition_back_to_new_clears_hash() {
        let (_, _, trail) = trail();
        let entry = trail
            .create(params(Uuid::now_v7()), HistoryStatus::Completed)
            .await
            .unwrap();

        let reset = trail
            .transition_status(entry.id, HistoryStatus::New)
            .await
            .unwrap();
        assert!(reset.hash.is_empty());
        assert!(trail.verify(entry.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_out_of_band_edit_is_detected() {
        let (store, _, trail) = trail();
        let wallet_id = Uuid::now_v7();
        let entry = trail
            .create(params(wallet_id), HistoryStatus::Completed)
            .await
            .unwrap();

        let mut edited = entry.clone();
        edited.new_balance = dec!(1_000_000);
        store.overwrite_history(edited).await;

        assert!(!trail.verify(entry.id).await.unwrap());
        let report = trail.verify_wallet_trail(wallet_id).await.unwrap();
        assert_eq!(report.invalid, vec![entry.id]);
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn test_status_edit_without_transition_is_detected() {
        let (store, _, trail) = trail();
        let entry = trail
            .create(params(Uuid::now_v7()), HistoryStatus::Completed)
            .await
            .unwrap();

        let mut edited = entry.clone();
        edited.status = HistoryStatus::Failed;
        store.overwrite_history(edited).await;

        assert!(!trail.verify(entry.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_wallet_trail_report_counts() {
        let (_, _, trail) = trail();
        let wallet_id = Uuid::now_v7();
        trail.create(params(wallet_id), HistoryStatus::New).await.unwrap();
        trail.create(params(wallet_id), HistoryStatus::Completed).await.unwrap();
        trail.create(params(wallet_id), HistoryStatus::Failed).await.unwrap();
        trail.create(params(Uuid::now_v7()), HistoryStatus::Completed).await.unwrap();

        let report = trail.verify_wallet_trail(wallet_id).await.unwrap();
        assert_eq!(report.checked, 3);
        assert_eq!(report.unsigned, 1);
        assert!(report.is_clean());
        assert_eq!(trail.entries(wallet_id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_hash_write_rolls_back_insert() {
        let (store, _, trail) = trail();
        let wallet_id = Uuid::now_v7();
        store.inject_failure(FailPoint::UpdateHistoryHash);

        let err = trail
            .create(params(wallet_id), HistoryStatus::Completed)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        assert!(trail.entries(wallet_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_entry() {
        let (_, _, trail) = trail();
        assert!(matches!(
            trail.verify(999).await,
            Err(Error::HistoryNotFound(999))
        ));
        assert!(matches!(
            trail.transition_status(999, HistoryStatus::Completed).await,
            Err(Error::HistoryNotFound(999))
        ));
    }
}
