//! Keyed integrity digests for the ledger
//!
//! This module provides:
//! - `SigningKey`, the process-held secret (never stored with the data it signs)
//! - HMAC-SHA256 signing of wallets and wallet history entries
//! - Constant-time verification
//!
//! A record edited outside the signing process no longer matches its hash on
//! the next verification.

use crate::{
    types::{Wallet, WalletHistoryEntry},
    Error, Result,
};
use chrono::SecondsFormat;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

type HmacSha256 = Hmac<Sha256>;

/// Default number of decimal places balances are fixed to before signing
pub const DEFAULT_BALANCE_SCALE: u32 = 8;

/// Secret used to sign ledger records
#[derive(Clone)]
pub struct SigningKey {
    bytes: Vec<u8>,
}

impl SigningKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(Error::Config("signing key must not be empty".to_string()));
        }
        Ok(Self { bytes })
    }

    /// Create from a hex string
    pub fn from_hex(encoded: &str) -> Result<Self> {
        let bytes = hex::decode(encoded.trim())
            .map_err(|e| Error::Config(format!("signing key is not valid hex: {}", e)))?;
        Self::from_bytes(bytes)
    }

    fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey").field("bytes", &"<redacted>").finish()
    }
}

impl Drop for SigningKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

/// Computes and verifies integrity hashes for wallets and history entries
#[derive(Clone)]
pub struct HashSigner {
    /// Keyed MAC state, cloned for every digest
    mac: Arc<HmacSha256>,
    balance_scale: u32,
}

impl fmt::Debug for HashSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashSigner")
            .field("key", &"<redacted>")
            .field("balance_scale", &self.balance_scale)
            .finish()
    }
}

impl HashSigner {
    /// Create signer with the default balance scale
    pub fn new(key: SigningKey) -> Result<Self> {
        let mac = HmacSha256::new_from_slice(key.as_bytes())
            .map_err(|e| Error::Config(format!("unusable signing key: {}", e)))?;
        Ok(Self {
            mac: Arc::new(mac),
            balance_scale: DEFAULT_BALANCE_SCALE,
        })
    }

    /// Set the number of decimal places balances are fixed to
    pub fn with_balance_scale(mut self, scale: u32) -> Self {
        self.balance_scale = scale;
        self
    }

    /// Balance scale in use
    pub fn balance_scale(&self) -> u32 {
        self.balance_scale
    }

    /// Canonical message for a wallet
    pub fn wallet_message(&self, wallet: &Wallet) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}",
            wallet.id,
            wallet.owner_id,
            wallet.currency_id,
            self.fixed(wallet.balance),
            wallet.created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            wallet.locked,
        )
    }

    /// Sign a wallet, returning a hex digest
    pub fn sign_wallet(&self, wallet: &Wallet) -> String {
        self.digest(&self.wallet_message(wallet))
    }

    /// Verify a wallet's stored hash
    ///
    /// Returns false rather than failing; the caller decides severity.
    pub fn verify_wallet(&self, wallet: &Wallet) -> bool {
        let expected = self.sign_wallet(wallet);
        constant_time_eq(&expected, &wallet.hash)
    }

    /// Canonical message for a history entry, for the status it carries
    pub fn history_message(&self, entry: &WalletHistoryEntry) -> Result<String> {
        if entry.id <= 0 {
            return Err(Error::InvalidHistoryEntry(
                "cannot sign an entry without a store-assigned id".to_string(),
            ));
        }
        let created_at_nanos = entry.created_at.timestamp_nanos_opt().ok_or_else(|| {
            Error::InvalidHistoryEntry(format!(
                "created_at out of range for entry {}",
                entry.id
            ))
        })?;

        Ok(format!(
            "{}|{}|{}|{}|{}|{}|{}",
            entry.id,
            entry.wallet_id,
            self.fixed(entry.old_balance),
            self.fixed(entry.new_balance),
            entry.action_performed,
            created_at_nanos,
            entry.status,
        ))
    }

    /// Sign a history entry for the status it carries
    pub fn sign_history(&self, entry: &WalletHistoryEntry) -> Result<String> {
        Ok(self.digest(&self.history_message(entry)?))
    }

    /// Verify a history entry
    ///
    /// Entries in status `new` carry no hash and always verify.
    pub fn verify_history(&self, entry: &WalletHistoryEntry) -> bool {
        if !entry.status.is_signed() {
            return true;
        }
        match self.sign_history(entry) {
            Ok(expected) => constant_time_eq(&expected, &entry.hash),
            Err(_) => false,
        }
    }

    /// Balance text at `balance_scale` places
    ///
    /// Values carrying more significant places than that keep all of them, so
    /// no digit of a stored balance escapes the hash.
    fn fixed(&self, value: Decimal) -> String {
        let mut fixed = value.normalize();
        if fixed.is_zero() {
            fixed.set_sign_positive(true);
        }
        if fixed.scale() <= self.balance_scale {
            fixed.rescale(self.balance_scale);
        }
        fixed.to_string()
    }

    fn digest(&self, message: &str) -> String {
        let mut mac = (*self.mac).clone();
        mac.update(message.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CurrencyId, HistoryStatus, UserId};
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn signer() -> HashSigner {
        HashSigner::new(SigningKey::from_bytes(b"test-wallet-key".to_vec()).unwrap()).unwrap()
    }

    fn wallet(signer: &HashSigner) -> Wallet {
        let created_at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let mut wallet = Wallet {
            id: Uuid::from_u128(1),
            owner_id: UserId(Uuid::from_u128(2)),
            currency_id: CurrencyId(3),
            balance: dec!(150.25),
            hash: String::new(),
            version: 1,
            locked: false,
            created_at,
            updated_at: created_at,
        };
        wallet.hash = signer.sign_wallet(&wallet);
        wallet
    }

    fn history(status: HistoryStatus) -> WalletHistoryEntry {
        let created_at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        WalletHistoryEntry {
            id: 42,
            wallet_id: Uuid::from_u128(1),
            old_balance: dec!(100),
            new_balance: dec!(150.25),
            action_performed: "fund_account".to_string(),
            status,
            hash: String::new(),
            created_at,
            updated_at: created_at,
        }
    }

    #[test]
    fn test_sign_and_verify_wallet() {
        let signer = signer();
        let wallet = wallet(&signer);

        assert_eq!(wallet.hash.len(), 64);
        assert!(signer.verify_wallet(&wallet));
    }

    #[test]
    fn test_sign_is_deterministic() {
        let signer = signer();
        let wallet = wallet(&signer);
        assert_eq!(signer.sign_wallet(&wallet), signer.sign_wallet(&wallet));
    }

    #[test]
    fn test_tampered_fields_fail_verification() {
        let signer = signer();
        let original = wallet(&signer);

        let mut tampered = original.clone();
        tampered.balance += dec!(0.01);
        assert!(!signer.verify_wallet(&tampered));

        let mut tampered = original.clone();
        tampered.locked = true;
        assert!(!signer.verify_wallet(&tampered));

        let mut tampered = original.clone();
        tampered.owner_id = UserId(Uuid::from_u128(99));
        assert!(!signer.verify_wallet(&tampered));

        let mut tampered = original.clone();
        tampered.currency_id = CurrencyId(4);
        assert!(!signer.verify_wallet(&tampered));

        let mut tampered = original.clone();
        tampered.created_at += chrono::Duration::seconds(1);
        assert!(!signer.verify_wallet(&tampered));

        let mut tampered = original;
        tampered.hash = "00".repeat(32);
        assert!(!signer.verify_wallet(&tampered));
    }

    #[test]
    fn test_version_is_not_signed() {
        let signer = signer();
        let mut wallet = wallet(&signer);
        wallet.version += 2;
        assert!(signer.verify_wallet(&wallet));
    }

    #[test]
    fn test_wrong_key_fails_verification() {
        let signer = signer();
        let wallet = wallet(&signer);
        let other =
            HashSigner::new(SigningKey::from_bytes(b"another-key".to_vec()).unwrap()).unwrap();
        assert!(!other.verify_wallet(&wallet));
    }

    #[test]
    fn test_balance_scale_is_fixed() {
        let signer = signer();
        let mut wallet = wallet(&signer);
        wallet.balance = dec!(150.250);
        assert!(signer.verify_wallet(&wallet));
        assert!(signer.wallet_message(&wallet).contains("|150.25000000|"));
    }

    #[test]
    fn test_digits_past_the_scale_are_signed() {
        let signer = signer();
        let mut wallet = wallet(&signer);
        wallet.balance = dec!(1.000000001);
        wallet.hash = signer.sign_wallet(&wallet);
        assert!(signer.wallet_message(&wallet).contains("|1.000000001|"));

        let mut edited = wallet.clone();
        edited.balance = dec!(1.000000004);
        assert!(!signer.verify_wallet(&edited));

        let mut padded = wallet;
        padded.balance = dec!(1.0000000010);
        assert!(signer.verify_wallet(&padded));
    }

    #[test]
    fn test_history_new_always_verifies() {
        let signer = signer();
        let entry = history(HistoryStatus::New);
        assert!(entry.hash.is_empty());
        assert!(signer.verify_history(&entry));
    }

    #[test]
    fn test_history_hash_depends_on_status() {
        let signer = signer();
        let completed = signer.sign_history(&history(HistoryStatus::Completed)).unwrap();
        let failed = signer.sign_history(&history(HistoryStatus::Failed)).unwrap();
        assert_ne!(completed, failed);

        let mut entry = history(HistoryStatus::Completed);
        entry.hash = completed;
        assert!(signer.verify_history(&entry));

        entry.new_balance = dec!(1_000_000);
        assert!(!signer.verify_history(&entry));
    }

    #[test]
    fn test_history_requires_assigned_id() {
        let signer = signer();
        let mut entry = history(HistoryStatus::Completed);
        entry.id = 0;
        assert!(matches!(
            signer.sign_history(&entry),
            Err(Error::InvalidHistoryEntry(_))
        ));
        assert!(!signer.verify_history(&entry));
    }

    #[test]
    fn test_key_debug_is_redacted() {
        let key = SigningKey::from_bytes(b"super-secret".to_vec()).unwrap();
        let rendered = format!("{:?}", key);
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("redacted"));
    }

    #[test]
    fn test_key_from_hex() {
        let key = SigningKey::from_hex("00ff10").unwrap();
        assert_eq!(key.as_bytes(), &[0x00, 0xff, 0x10]);
        assert!(SigningKey::from_hex("zz").is_err());
        assert!(SigningKey::from_bytes(Vec::new()).is_err());
    }
}
