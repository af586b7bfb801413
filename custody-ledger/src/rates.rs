//! Exchange rate resolution
//!
//! The effective rate for (base, quote, direction, user) is layered:
//!
//! 1. An account-level override for the user, valid now, wins
//! 2. Otherwise the platform base rate valid now
//! 3. Otherwise `Error::RateNotFound`
//!
//! An agent daily discount active now for (user, base currency) is then
//! subtracted from whichever rate was selected. Rate windows are half-open
//! (`from <= now < until`); discount windows include both ends. A discount
//! with a zero multiple is skipped; one that leaves the `Decimal` range fails
//! the quote with `Error::InvalidAmount`.

use crate::{
    metrics::Metrics,
    storage::RateStore,
    time::{Clock, SystemClock},
    types::{
        AccountLevelRate, AgentDailyDiscount, CurrencyId, ExchangeRate, RateDirection, RateKey,
        RateResult, UserId,
    },
    Error, Result,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, warn};

/// Resolves effective exchange rates
pub struct RateResolver<R: RateStore + ?Sized> {
    store: Arc<R>,
    clock: Arc<dyn Clock>,
    metrics: Option<Metrics>,
}

impl<R: RateStore + ?Sized> RateResolver<R> {
    /// Create resolver on the system clock
    pub fn new(store: Arc<R>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            metrics: None,
        }
    }

    /// Evaluate validity windows against `clock`
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Record metrics
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Effective rate for `user`, with overrides and discounts applied
    pub async fn calculate_exchange_rate(
        &self,
        base: CurrencyId,
        quote: CurrencyId,
        direction: RateDirection,
        user: UserId,
    ) -> Result<RateResult> {
        let key = RateKey {
            base,
            quote,
            direction,
        };
        let now = self.clock.now();

        let overrides = self.store.account_level_rates(user, key).await?;
        let mut result = match select_account_level(&overrides, now) {
            Some(selected) => {
                debug!(rate_key = %key, user = %user, account_level_rate_id = selected.id, "Account-level rate selected");
                RateResult {
                    rate: selected.rate,
                    is_based_rate: false,
                    has_discount: false,
                    discount: Decimal::ZERO,
                    spread: selected.spread,
                    exchange_rate: Decimal::ZERO,
                    exchange_rate_id: None,
                    exchange_rate_validity: None,
                    account_level_rate: selected.rate,
                    account_level_rate_id: Some(selected.id),
                    account_level_validity: Some(selected.validity),
                    discount_id: None,
                    discount_validity: None,
                }
            }
            None => self.base_rate(key, now).await?,
        };

        let discounts = self.store.agent_daily_discounts(user, base).await?;
        if let Some(discount) = select_discount(&discounts, now) {
            if discount.discount_multiple.is_zero() {
                warn!(
                    discount_id = discount.id,
                    user = %user,
                    "Agent daily discount has a zero multiple; ignored"
                );
            } else {
                let amount = discount.total_discount().ok_or_else(|| {
                    Error::InvalidAmount(format!(
                        "agent daily discount {} overflows",
                        discount.id
                    ))
                })?;
                result.rate = result.rate.checked_sub(amount).ok_or_else(|| {
                    Error::InvalidAmount(format!(
                        "discount {} overflows rate {}",
                        amount, result.rate
                    ))
                })?;
                result.discount = amount;
                result.has_discount = true;
                result.discount_id = Some(discount.id);
                result.discount_validity = Some(discount.validity);
                debug!(
                    rate_key = %key,
                    user = %user,
                    discount_id = discount.id,
                    discount = %amount,
                    "Agent daily discount applied"
                );
            }
        }

        self.resolved(key, &result);
        Ok(result)
    }

    /// Platform base rate, without user overrides or discounts
    pub async fn calculate_global_exchange_rate(
        &self,
        base: CurrencyId,
        quote: CurrencyId,
        direction: RateDirection,
    ) -> Result<RateResult> {
        let key = RateKey {
            base,
            quote,
            direction,
        };
        let result = self.base_rate(key, self.clock.now()).await?;
        self.resolved(key, &result);
        Ok(result)
    }

    async fn base_rate(&self, key: RateKey, now: DateTime<Utc>) -> Result<RateResult> {
        let rates = self.store.exchange_rates(key).await?;
        let Some(selected) = select_exchange_rate(&rates, now) else {
            if let Some(metrics) = &self.metrics {
                metrics.record_rate_miss();
            }
            warn!(rate_key = %key, "No valid exchange rate");
            return Err(Error::RateNotFound(key));
        };

        debug!(rate_key = %key, exchange_rate_id = selected.id, "Base rate selected");
        Ok(RateResult {
            rate: selected.rate,
            is_based_rate: true,
            has_discount: false,
            discount: Decimal::ZERO,
            spread: selected.spread,
            exchange_rate: selected.rate,
            exchange_rate_id: Some(selected.id),
            exchange_rate_validity: Some(selected.validity),
            account_level_rate: Decimal::ZERO,
            account_level_rate_id: None,
            account_level_validity: None,
            discount_id: None,
            discount_validity: None,
        })
    }

    fn resolved(&self, key: RateKey, result: &RateResult) {
        if let Some(metrics) = &self.metrics {
            metrics.record_rate_resolution();
        }
        debug!(
            rate_key = %key,
            rate = %result.rate,
            is_based_rate = result.is_based_rate,
            has_discount = result.has_discount,
            "Exchange rate resolved"
        );
    }
}

// Among records valid at once, the latest version wins, then the highest id.

fn select_exchange_rate(rates: &[ExchangeRate], now: DateTime<Utc>) -> Option<&ExchangeRate> {
    rates
        .iter()
        .filter(|rate| rate.validity.contains(now))
        .max_by_key(|rate| (rate.version, rate.id))
}

fn select_account_level(
    rates: &[AccountLevelRate],
    now: DateTime<Utc>,
) -> Option<&AccountLevelRate> {
    rates
        .iter()
        .filter(|rate| rate.validity.contains(now))
        .max_by_key(|rate| (rate.version, rate.id))
}

fn select_discount(
    discounts: &[AgentDailyDiscount],
    now: DateTime<Utc>,
) -> Option<&AgentDailyDiscount> {
    discounts
        .iter()
        .filter(|discount| discount.validity.contains_inclusive(now))
        .max_by_key(|discount| discount.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::time::FixedClock;
    use crate::types::Validity;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    const EUR: CurrencyId = CurrencyId(978);
    const USD: CurrencyId = CurrencyId(840);

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap()
    }

    fn resolver() -> (Arc<MemoryStore>, RateResolver<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let resolver =
            RateResolver::new(store.clone()).with_clock(Arc::new(FixedClock::new(now())));
        (store, resolver)
    }

    fn base(id: i32, rate: Decimal, validity: Validity) -> ExchangeRate {
        ExchangeRate {
            id,
            base_currency_id: EUR,
            quote_currency_id: USD,
            rate,
            spread: dec!(0.01),
            direction: RateDirection::Buy,
            validity,
            version: now() - Duration::days(1),
        }
    }

    #[tokio::test]
    async fn test_latest_version_wins() {
        let (store, resolver) = resolver();
        store.add_exchange_rate(base(1, dec!(1.10), Validity::open()));
        store.add_exchange_rate(ExchangeRate {
            version: now() - Duration::hours(1),
            ..base(2, dec!(1.12), Validity::open())
        });

        let result = resolver
            .calculate_global_exchange_rate(EUR, USD, RateDirection::Buy)
            .await
            .unwrap();
        assert_eq!(result.rate, dec!(1.12));
        assert_eq!(result.exchange_rate_id, Some(2));
    }

    #[tokio::test]
    async fn test_equal_versions_fall_back_to_highest_id() {
        let (store, resolver) = resolver();
        store.add_exchange_rate(base(7, dec!(1.10), Validity::open()));
        store.add_exchange_rate(base(3, dec!(1.30), Validity::open()));

        let result = resolver
            .calculate_global_exchange_rate(EUR, USD, RateDirection::Buy)
            .await
            .unwrap();
        assert_eq!(result.exchange_rate_id, Some(7));
    }

    #[tokio::test]
    async fn test_rate_window_end_is_exclusive() {
        let (store, resolver) = resolver();
        store.add_exchange_rate(base(1, dec!(1.10), Validity::between(now() - Duration::days(1), now())));

        let err = resolver
            .calculate_global_exchange_rate(EUR, USD, RateDirection::Buy)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RateNotFound(key) if key.base == EUR && key.quote == USD));
    }

    #[tokio::test]
    async fn test_direction_is_part_of_the_key() {
        let (store, resolver) = resolver();
        store.add_exchange_rate(base(1, dec!(1.10), Validity::open()));

        assert!(resolver
            .calculate_global_exchange_rate(EUR, USD, RateDirection::Sell)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_discount_window_end_is_inclusive() {
        let (store, resolver) = resolver();
        let user = UserId::new(Uuid::now_v7());
        store.add_exchange_rate(base(1, dec!(20), Validity::open()));
        store.add_agent_daily_discount(AgentDailyDiscount {
            id: 4,
            owner_id: user,
            base_currency_id: EUR,
            discount_amount: dec!(0.5),
            discount_multiple: dec!(100),
            top_up_amount: dec!(250),
            validity: Validity::between(now() - Duration::hours(8), now()),
        });

        let result = resolver
            .calculate_exchange_rate(EUR, USD, RateDirection::Buy, user)
            .await
            .unwrap();
        assert!(result.has_discount);
        assert_eq!(result.discount, dec!(1.0));
        assert_eq!(result.rate, dec!(19.0));
        assert_eq!(result.discount_id, Some(4));
    }

    #[tokio::test]
    async fn test_zero_multiple_discount_is_skipped() {
        let (store, resolver) = resolver();
        let user = UserId::new(Uuid::now_v7());
        store.add_exchange_rate(base(1, dec!(1.10), Validity::open()));
        store.add_agent_daily_discount(AgentDailyDiscount {
            id: 1,
            owner_id: user,
            base_currency_id: EUR,
            discount_amount: dec!(2),
            discount_multiple: Decimal::ZERO,
            top_up_amount: dec!(10000),
            validity: Validity::open(),
        });

        let result = resolver
            .calculate_exchange_rate(EUR, USD, RateDirection::Buy, user)
            .await
            .unwrap();
        assert!(!result.has_discount);
        assert_eq!(result.rate, dec!(1.10));
    }

    #[tokio::test]
    async fn test_overflowing_discount_fails_the_quote() {
        let (store, resolver) = resolver();
        let user = UserId::new(Uuid::now_v7());
        store.add_exchange_rate(base(1, dec!(1.10), Validity::open()));
        store.add_agent_daily_discount(AgentDailyDiscount {
            id: 1,
            owner_id: user,
            base_currency_id: EUR,
            discount_amount: Decimal::MAX,
            discount_multiple: dec!(1),
            top_up_amount: dec!(2),
            validity: Validity::open(),
        });

        let err = resolver
            .calculate_exchange_rate(EUR, USD, RateDirection::Buy, user)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidAmount(_)));
    }

    #[tokio::test]
    async fn test_discount_past_the_rate_range_fails_the_quote() {
        let (store, resolver) = resolver();
        let user = UserId::new(Uuid::now_v7());
        store.add_exchange_rate(base(1, Decimal::MIN, Validity::open()));
        store.add_agent_daily_discount(AgentDailyDiscount {
            id: 1,
            owner_id: user,
            base_currency_id: EUR,
            discount_amount: dec!(1),
            discount_multiple: dec!(1),
            top_up_amount: dec!(1),
            validity: Validity::open(),
        });

        let err = resolver
            .calculate_exchange_rate(EUR, USD, RateDirection::Buy, user)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidAmount(_)));
    }

    #[tokio::test]
    async fn test_metrics_count_hits_and_misses() {
        let store = Arc::new(MemoryStore::new());
        let metrics = Metrics::new().unwrap();
        let resolver = RateResolver::new(store.clone())
            .with_clock(Arc::new(FixedClock::new(now())))
            .with_metrics(metrics.clone());

        let _ = resolver
            .calculate_global_exchange_rate(EUR, USD, RateDirection::Buy)
            .await;
        store.add_exchange_rate(base(1, dec!(1.10), Validity::open()));
        resolver
            .calculate_global_exchange_rate(EUR, USD, RateDirection::Buy)
            .await
            .unwrap();

        assert_eq!(metrics.rate_misses.get(), 1);
        assert_eq!(metrics.rate_resolutions.get(), 1);
    }
}
