use async_trait::async_trait;
use chrono::Utc;
use common::window::WindowUnit;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use tracing::info;

use super::access::{access_key, AccessCache, BlockKind};
use super::counters::{counter_key, CounterError, CounterStore};

/// Bumps one bucket of a window hash and arms the hash TTL if it has none,
/// in a single round trip.
const WINDOWED_INCR: &str = r#"
local value = redis.call('HINCRBY', KEYS[1], ARGV[1], ARGV[2])
if redis.call('PTTL', KEYS[1]) < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[3])
end
return value
"#;

/// Counters and access markers shared across proxy instances.
#[derive(Clone)]
pub struct RedisCounters {
    conn: MultiplexedConnection,
    windowed_incr: Script,
}

impl RedisCounters {
    pub async fn connect(redis_url: &str) -> Result<Self, CounterError> {
        let client = redis::Client::open(redis_url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!("connected to redis");
        Ok(Self {
            conn,
            windowed_incr: Script::new(WINDOWED_INCR),
        })
    }
}

#[async_trait]
impl CounterStore for RedisCounters {
    async fn incr_by(&self, prefix: &str, key_id: &str, delta: i64) -> Result<i64, CounterError> {
        let mut conn = self.conn.clone();
        let value: i64 = conn.incr(counter_key(prefix, key_id), delta).await?;
        Ok(value)
    }

    async fn get(&self, prefix: &str, key_id: &str) -> Result<i64, CounterError> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = conn.get(counter_key(prefix, key_id)).await?;
        Ok(value.unwrap_or(0))
    }

    async fn delete(&self, prefix: &str, key_id: &str) -> Result<(), CounterError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(counter_key(prefix, key_id)).await?;
        Ok(())
    }

    async fn increment_windowed(
        &self,
        prefix: &str,
        key_id: &str,
        unit: WindowUnit,
        delta: i64,
    ) -> Result<i64, CounterError> {
        let now = Utc::now();
        let ttl_ms = unit.remaining(now).as_millis() as i64;
        let mut conn = self.conn.clone();
        let value: i64 = self
            .windowed_incr
            .key(counter_key(prefix, key_id))
            .arg(unit.bucket(now))
            .arg(delta)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn get_windowed(
        &self,
        prefix: &str,
        key_id: &str,
        _unit: WindowUnit,
    ) -> Result<i64, CounterError> {
        let mut conn = self.conn.clone();
        let values: Vec<i64> = conn.hvals(counter_key(prefix, key_id)).await?;
        Ok(values.into_iter().sum())
    }
}

#[async_trait]
impl AccessCache for RedisCounters {
    async fn set(
        &self,
        key_id: &str,
        kind: BlockKind,
        unit: WindowUnit,
    ) -> Result<(), CounterError> {
        let ttl_ms = unit.remaining(Utc::now()).as_millis() as u64;
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(access_key(key_id))
            .arg(kind.as_str())
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key_id: &str) -> Result<Option<BlockKind>, CounterError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(access_key(key_id)).await?;
        value
            .map(|v| v.parse::<BlockKind>().map_err(CounterError::Store))
            .transpose()
    }
}
