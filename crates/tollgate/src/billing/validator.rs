use std::sync::Arc;

use common::consts::{MICROS_PER_USD, RATE_WINDOW_PREFIX, SPEND_TOTAL_PREFIX, SPEND_WINDOW_PREFIX};
use common::errors::ProxyError;
use common::models::Key;
use common::window::WindowUnit;
use tracing::{debug, warn};

use super::access::{AccessCache, BlockKind};
use super::counters::{Clock, CounterError, CounterStore, SystemClock};

/// A key failing one of its limits. Checks run in declaration order and the
/// first failure wins.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PolicyViolation {
    #[error("key has expired")]
    Expired,
    #[error("key is not valid: {0}")]
    Invalid(String),
    #[error("key exceeded its lifetime cost limit")]
    LifetimeCost,
    #[error("key exceeded its cost limit for the current window")]
    WindowedCost,
    #[error("key exceeded its rate limit")]
    Rate,
}

impl PolicyViolation {
    /// Marker to remember this violation by until the window rolls over.
    /// Lifetime cost and expiry never clear on their own, so they get none.
    pub fn block(&self, key: &Key) -> Option<(BlockKind, WindowUnit)> {
        match self {
            PolicyViolation::WindowedCost => key.cost_limit_in_usd_unit.map(|u| (BlockKind::Cost, u)),
            PolicyViolation::Rate => key.rate_limit_unit.map(|u| (BlockKind::Rate, u)),
            _ => None,
        }
    }
}

impl From<PolicyViolation> for ProxyError {
    fn from(v: PolicyViolation) -> Self {
        match v {
            PolicyViolation::Expired => ProxyError::Expiration(v.to_string()),
            PolicyViolation::Invalid(_) => ProxyError::Validation(v.to_string()),
            PolicyViolation::LifetimeCost | PolicyViolation::WindowedCost => {
                ProxyError::CostLimit(v.to_string())
            }
            PolicyViolation::Rate => ProxyError::RateLimit(v.to_string()),
        }
    }
}

pub fn spend_window_prefix(unit: WindowUnit) -> String {
    format!("{SPEND_WINDOW_PREFIX}-{unit}")
}

pub fn rate_window_prefix(unit: WindowUnit) -> String {
    format!("{RATE_WINDOW_PREFIX}-{unit}")
}

/// Admission checks against a key's expiry, spend and request rate.
#[derive(Clone)]
pub struct Validator {
    counters: Arc<dyn CounterStore>,
    access: Arc<dyn AccessCache>,
    clock: Arc<dyn Clock>,
}

impl Validator {
    pub fn new(counters: Arc<dyn CounterStore>, access: Arc<dyn AccessCache>) -> Self {
        Self::with_clock(counters, access, Arc::new(SystemClock))
    }

    pub fn with_clock(
        counters: Arc<dyn CounterStore>,
        access: Arc<dyn AccessCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            counters,
            access,
            clock,
        }
    }

    /// Request-path check. Consults the access marker before touching the
    /// counters.
    pub async fn validate(&self, key: &Key, prompt_cost_usd: f64) -> Result<(), PolicyViolation> {
        self.check_expiry(key)?;

        match self.access.get(&key.key_id).await {
            Ok(Some(BlockKind::Cost)) => return Err(PolicyViolation::WindowedCost),
            Ok(Some(BlockKind::Rate)) => return Err(PolicyViolation::Rate),
            Ok(None) => {}
            Err(e) => warn!(key_id = %key.key_id, error = %e, "access cache read failed"),
        }

        self.check_counters(key, prompt_cost_usd).await
    }

    /// Full check straight against the counters, skipping the access marker.
    pub async fn validate_fresh(
        &self,
        key: &Key,
        prompt_cost_usd: f64,
    ) -> Result<(), PolicyViolation> {
        self.check_expiry(key)?;
        self.check_counters(key, prompt_cost_usd).await
    }

    fn check_expiry(&self, key: &Key) -> Result<(), PolicyViolation> {
        key.ttl_duration().map_err(PolicyViolation::Invalid)?;
        if key.is_expired(self.clock.now().timestamp()) {
            return Err(PolicyViolation::Expired);
        }
        Ok(())
    }

    async fn check_counters(&self, key: &Key, prompt_cost_usd: f64) -> Result<(), PolicyViolation> {
        if key.cost_limit_in_usd > 0.0 {
            let spent = self
                .counters
                .get(SPEND_TOTAL_PREFIX, &key.key_id)
                .await;
            if let Some(spent) = admit_on_error(key, "lifetime spend", spent) {
                if to_usd(spent) + prompt_cost_usd > key.cost_limit_in_usd {
                    return Err(PolicyViolation::LifetimeCost);
                }
            }
        }

        if let (true, Some(unit)) = (
            key.cost_limit_in_usd_over_time > 0.0,
            key.cost_limit_in_usd_unit,
        ) {
            let spent = self
                .counters
                .get_windowed(&spend_window_prefix(unit), &key.key_id, unit)
                .await;
            if let Some(spent) = admit_on_error(key, "windowed spend", spent) {
                if to_usd(spent) + prompt_cost_usd > key.cost_limit_in_usd_over_time {
                    return Err(PolicyViolation::WindowedCost);
                }
            }
        }

        if let (true, Some(unit)) = (key.rate_limit_over_time > 0, key.rate_limit_unit) {
            let requests = self
                .counters
                .get_windowed(&rate_window_prefix(unit), &key.key_id, unit)
                .await;
            if let Some(requests) = admit_on_error(key, "request rate", requests) {
                if requests >= key.rate_limit_over_time {
                    return Err(PolicyViolation::Rate);
                }
            }
        }

        debug!(key_id = %key.key_id, "key within limits");
        Ok(())
    }
}

fn to_usd(micros: i64) -> f64 {
    micros as f64 / MICROS_PER_USD
}

/// Counter outages must not take the proxy down with them.
fn admit_on_error(key: &Key, what: &str, read: Result<i64, CounterError>) -> Option<i64> {
    match read {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key_id = %key.key_id, counter = what, error = %e, "counter read failed, admitting request");
            metrics::counter!("validator.counter_errors").increment(1);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::access::MemoryAccessCache;
    use crate::billing::counters::tests::ManualClock;
    use crate::billing::counters::MemoryCounters;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};

    fn key() -> Key {
        Key {
            key_id: "k1".into(),
            name: "test".into(),
            created_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap().timestamp(),
            ..Default::default()
        }
    }

    fn validator() -> (Validator, Arc<MemoryCounters>, Arc<MemoryAccessCache>) {
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap());
        let counters = Arc::new(MemoryCounters::with_clock(clock.clone()));
        let access = Arc::new(MemoryAccessCache::new());
        (
            Validator::with_clock(counters.clone(), access.clone(), clock),
            counters,
            access,
        )
    }

    #[tokio::test]
    async fn test_unlimited_key_passes() {
        let (validator, _, _) = validator();
        assert_eq!(validator.validate(&key(), 100.0).await, Ok(()));
    }

    #[tokio::test]
    async fn test_expiration_wins_over_everything() {
        let (validator, counters, _) = validator();
        let mut key = key();
        key.ttl = Some("1s".into());
        key.cost_limit_in_usd = 1.0;
        key.rate_limit_over_time = 1;
        key.rate_limit_unit = Some(WindowUnit::Minute);
        counters
            .incr_by(SPEND_TOTAL_PREFIX, "k1", 5_000_000)
            .await
            .unwrap();

        assert_eq!(
            validator.validate(&key, 0.0).await,
            Err(PolicyViolation::Expired)
        );
    }

    #[tokio::test]
    async fn test_lifetime_cost_includes_prompt_cost() {
        let (validator, counters, _) = validator();
        let mut key = key();
        key.cost_limit_in_usd = 1.0;
        counters
            .incr_by(SPEND_TOTAL_PREFIX, "k1", 900_000)
            .await
            .unwrap();

        assert_eq!(validator.validate(&key, 0.05).await, Ok(()));
        assert_eq!(
            validator.validate(&key, 0.2).await,
            Err(PolicyViolation::LifetimeCost)
        );
    }

    #[tokio::test]
    async fn test_lifetime_cost_before_windowed_and_rate() {
        let (validator, counters, _) = validator();
        let mut key = key();
        key.cost_limit_in_usd = 1.0;
        key.cost_limit_in_usd_over_time = 0.5;
        key.cost_limit_in_usd_unit = Some(WindowUnit::Day);
        key.rate_limit_over_time = 1;
        key.rate_limit_unit = Some(WindowUnit::Minute);

        counters
            .incr_by(SPEND_TOTAL_PREFIX, "k1", 2_000_000)
            .await
            .unwrap();
        counters
            .increment_windowed(&spend_window_prefix(WindowUnit::Day), "k1", WindowUnit::Day, 2_000_000)
            .await
            .unwrap();
        counters
            .increment_windowed(&rate_window_prefix(WindowUnit::Minute), "k1", WindowUnit::Minute, 3)
            .await
            .unwrap();

        assert_eq!(
            validator.validate(&key, 0.0).await,
            Err(PolicyViolation::LifetimeCost)
        );
        key.cost_limit_in_usd = 0.0;
        assert_eq!(
            validator.validate(&key, 0.0).await,
            Err(PolicyViolation::WindowedCost)
        );
        key.cost_limit_in_usd_over_time = 0.0;
        key.cost_limit_in_usd_unit = None;
        assert_eq!(validator.validate(&key, 0.0).await, Err(PolicyViolation::Rate));
    }

    #[tokio::test]
    async fn test_rate_limit_counts_prior_requests() {
        let (validator, counters, _) = validator();
        let mut key = key();
        key.rate_limit_over_time = 2;
        key.rate_limit_unit = Some(WindowUnit::Minute);
        let prefix = rate_window_prefix(WindowUnit::Minute);

        counters
            .increment_windowed(&prefix, "k1", WindowUnit::Minute, 1)
            .await
            .unwrap();
        assert_eq!(validator.validate(&key, 0.0).await, Ok(()));
        counters
            .increment_windowed(&prefix, "k1", WindowUnit::Minute, 1)
            .await
            .unwrap();
        assert_eq!(validator.validate(&key, 0.0).await, Err(PolicyViolation::Rate));
    }

    #[tokio::test]
    async fn test_access_marker_short_circuits() {
        let (validator, _, access) = validator();
        access
            .set("k1", BlockKind::Rate, WindowUnit::Hour)
            .await
            .unwrap();

        assert_eq!(validator.validate(&key(), 0.0).await, Err(PolicyViolation::Rate));
        assert_eq!(validator.validate_fresh(&key(), 0.0).await, Ok(()));
    }

    struct BrokenCounters;

    #[async_trait]
    impl CounterStore for BrokenCounters {
        async fn incr_by(&self, _: &str, _: &str, _: i64) -> Result<i64, CounterError> {
            Err(CounterError::Store("down".into()))
        }
        async fn get(&self, _: &str, _: &str) -> Result<i64, CounterError> {
            Err(CounterError::Store("down".into()))
        }
        async fn delete(&self, _: &str, _: &str) -> Result<(), CounterError> {
            Err(CounterError::Store("down".into()))
        }
        async fn increment_windowed(
            &self,
            _: &str,
            _: &str,
            _: WindowUnit,
            _: i64,
        ) -> Result<i64, CounterError> {
            Err(CounterError::Store("down".into()))
        }
        async fn get_windowed(&self, _: &str, _: &str, _: WindowUnit) -> Result<i64, CounterError> {
            Err(CounterError::Store("down".into()))
        }
    }

    #[tokio::test]
    async fn test_counter_outage_admits() {
        let validator = Validator::new(Arc::new(BrokenCounters), Arc::new(MemoryAccessCache::new()));
        let mut key = key();
        key.cost_limit_in_usd = 0.01;
        key.rate_limit_over_time = 1;
        key.rate_limit_unit = Some(WindowUnit::Second);
        assert_eq!(validator.validate(&key, 0.0).await, Ok(()));
    }

    #[test]
    fn test_violation_maps_to_proxy_error() {
        assert!(matches!(
            ProxyError::from(PolicyViolation::Expired),
            ProxyError::Expiration(_)
        ));
        assert!(matches!(
            ProxyError::from(PolicyViolation::WindowedCost),
            ProxyError::CostLimit(_)
        ));
        assert!(matches!(
            ProxyError::from(PolicyViolation::Rate),
            ProxyError::RateLimit(_)
        ));
        assert!(matches!(
            ProxyError::from(PolicyViolation::Invalid("ttl".into())),
            ProxyError::Validation(_)
        ));
    }
}
