use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use common::window::WindowUnit;
use moka::future::Cache;
use moka::Expiry;

use super::counters::{Clock, CounterError, SystemClock};

/// Why a key is currently blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Cost,
    Rate,
}

impl BlockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockKind::Cost => "cost",
            BlockKind::Rate => "rate",
        }
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlockKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cost" => Ok(BlockKind::Cost),
            "rate" => Ok(BlockKind::Rate),
            other => Err(format!("unknown block kind '{other}'")),
        }
    }
}

pub fn access_key(key_id: &str) -> String {
    format!("access-{key_id}")
}

/// Short-lived "key is over quota" markers that expire when the window that
/// tripped them rolls over.
#[async_trait]
pub trait AccessCache: Send + Sync {
    async fn set(&self, key_id: &str, kind: BlockKind, unit: WindowUnit)
        -> Result<(), CounterError>;

    async fn get(&self, key_id: &str) -> Result<Option<BlockKind>, CounterError>;
}

struct MarkerExpiry;

impl Expiry<String, (BlockKind, Duration)> for MarkerExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &(BlockKind, Duration),
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.1)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &(BlockKind, Duration),
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.1)
    }
}

pub struct MemoryAccessCache {
    markers: Cache<String, (BlockKind, Duration)>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryAccessCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAccessCache {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            markers: Cache::builder()
                .max_capacity(100_000)
                .expire_after(MarkerExpiry)
                .build(),
            clock,
        }
    }
}

#[async_trait]
impl AccessCache for MemoryAccessCache {
    async fn set(
        &self,
        key_id: &str,
        kind: BlockKind,
        unit: WindowUnit,
    ) -> Result<(), CounterError> {
        let ttl = unit.remaining(self.clock.now());
        self.markers.insert(access_key(key_id), (kind, ttl)).await;
        Ok(())
    }

    async fn get(&self, key_id: &str) -> Result<Option<BlockKind>, CounterError> {
        Ok(self
            .markers
            .get(&access_key(key_id))
            .await
            .map(|(kind, _)| kind))
    }
}
