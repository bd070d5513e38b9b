use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::window::WindowUnit;
use dashmap::DashMap;

#[derive(Debug, thiserror::Error)]
pub enum CounterError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("counter store error: {0}")]
    Store(String),
}

/// Source of wall-clock time, swappable in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub fn counter_key(prefix: &str, key_id: &str) -> String {
    format!("{prefix}-{key_id}")
}

/// Shared integer counters addressed by `(prefix, keyId)`.
///
/// Windowed counters are hashes of `bucket -> count` that expire when the
/// window rolls over; reads sum every live bucket.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn incr_by(&self, prefix: &str, key_id: &str, delta: i64) -> Result<i64, CounterError>;

    async fn get(&self, prefix: &str, key_id: &str) -> Result<i64, CounterError>;

    async fn delete(&self, prefix: &str, key_id: &str) -> Result<(), CounterError>;

    async fn increment_windowed(
        &self,
        prefix: &str,
        key_id: &str,
        unit: WindowUnit,
        delta: i64,
    ) -> Result<i64, CounterError>;

    async fn get_windowed(
        &self,
        prefix: &str,
        key_id: &str,
        unit: WindowUnit,
    ) -> Result<i64, CounterError>;
}

struct Window {
    buckets: HashMap<i64, i64>,
    expires_at: DateTime<Utc>,
}

/// Process-local counters for single-node deployments and tests.
pub struct MemoryCounters {
    totals: Arc<DashMap<String, AtomicI64>>,
    windows: Arc<DashMap<String, Window>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCounters {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            totals: Arc::new(DashMap::new()),
            windows: Arc::new(DashMap::new()),
            clock,
        }
    }
}

#[async_trait]
impl CounterStore for MemoryCounters {
    async fn incr_by(&self, prefix: &str, key_id: &str, delta: i64) -> Result<i64, CounterError> {
        Ok(self
            .totals
            .entry(counter_key(prefix, key_id))
            .or_insert_with(|| AtomicI64::new(0))
            .fetch_add(delta, Ordering::Relaxed)
            + delta)
    }

    async fn get(&self, prefix: &str, key_id: &str) -> Result<i64, CounterError> {
        Ok(self
            .totals
            .get(&counter_key(prefix, key_id))
            .map(|v| v.load(Ordering::Relaxed))
            .unwrap_or(0))
    }

    async fn delete(&self, prefix: &str, key_id: &str) -> Result<(), CounterError> {
        let key = counter_key(prefix, key_id);
        self.totals.remove(&key);
        self.windows.remove(&key);
        Ok(())
    }

    async fn increment_windowed(
        &self,
        prefix: &str,
        key_id: &str,
        unit: WindowUnit,
        delta: i64,
    ) -> Result<i64, CounterError> {
        let now = self.clock.now();
        let new_window = || Window {
            buckets: HashMap::new(),
            expires_at: now + unit.remaining(now),
        };

        let mut window = self
            .windows
            .entry(counter_key(prefix, key_id))
            .or_insert_with(new_window);
        if window.expires_at <= now {
            *window = new_window();
        }
        let bucket = window.buckets.entry(unit.bucket(now)).or_insert(0);
        *bucket += delta;
        Ok(*bucket)
    }

    async fn get_windowed(
        &self,
        prefix: &str,
        key_id: &str,
        _unit: WindowUnit,
    ) -> Result<i64, CounterError> {
        let now = self.clock.now();
        Ok(self
            .windows
            .get(&counter_key(prefix, key_id))
            .filter(|w| w.expires_at > now)
            .map(|w| w.buckets.values().sum())
            .unwrap_or(0))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Mutex;

    /// Clock that only moves when told to.
    pub struct ManualClock(Mutex<DateTime<Utc>>);

    impl ManualClock {
        pub fn at(now: DateTime<Utc>) -> Arc<Self> {
            Arc::new(Self(Mutex::new(now)))
        }

        pub fn set(&self, now: DateTime<Utc>) {
            *self.0.lock().unwrap() = now;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    #[tokio::test]
    async fn test_totals_sum_all_increments() {
        let counters = MemoryCounters::new();
        for micros in [10, 20, 30] {
            counters.incr_by("spend-total", "k1", micros).await.unwrap();
        }
        assert_eq!(counters.get("spend-total", "k1").await.unwrap(), 60);
        assert_eq!(counters.get("spend-total", "k2").await.unwrap(), 0);

        counters.delete("spend-total", "k1").await.unwrap();
        assert_eq!(counters.get("spend-total", "k1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_windowed_sums_buckets() {
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2024, 3, 1, 13, 10, 0).unwrap());
        let counters = MemoryCounters::with_clock(clock.clone());

        counters
            .increment_windowed("spend-h", "k1", WindowUnit::Hour, 5)
            .await
            .unwrap();
        clock.set(Utc.with_ymd_and_hms(2024, 3, 1, 13, 40, 0).unwrap());
        counters
            .increment_windowed("spend-h", "k1", WindowUnit::Hour, 7)
            .await
            .unwrap();

        assert_eq!(
            counters
                .get_windowed("spend-h", "k1", WindowUnit::Hour)
                .await
                .unwrap(),
            12
        );
    }

    #[tokio::test]
    async fn test_windowed_rolls_over_at_hour_boundary() {
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2024, 3, 1, 13, 59, 0).unwrap());
        let counters = MemoryCounters::with_clock(clock.clone());

        counters
            .increment_windowed("rate-h", "k1", WindowUnit::Hour, 1)
            .await
            .unwrap();
        assert_eq!(
            counters
                .get_windowed("rate-h", "k1", WindowUnit::Hour)
                .await
                .unwrap(),
            1
        );

        clock.set(Utc.with_ymd_and_hms(2024, 3, 1, 14, 0, 0).unwrap());
        assert_eq!(
            counters
                .get_windowed("rate-h", "k1", WindowUnit::Hour)
                .await
                .unwrap(),
            0
        );

        counters
            .increment_windowed("rate-h", "k1", WindowUnit::Hour, 1)
            .await
            .unwrap();
        assert_eq!(
            counters
                .get_windowed("rate-h", "k1", WindowUnit::Hour)
                .await
                .unwrap(),
            1
        );
    }
}
