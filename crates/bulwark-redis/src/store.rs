//! Sliding-window store shared by every process pointing at one Redis.
//!
//! Each key is a sorted set scored by request timestamp. Members encode the
//! request cost (`<timestamp>:<cost>:<nonce>`), so the admission script can
//! trim, sum, compare and insert in a single server-side step.

use std::sync::LazyLock;

use bulwark_core::traits::{WindowAdmission, WindowRequest, WindowStore, WindowTally};
use bulwark_core::AppError;
use rand::Rng;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use crate::config::RedisConfig;

static ADMIT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        local key = KEYS[1]
        local now = tonumber(ARGV[1])
        local window = tonumber(ARGV[2])
        local limit = tonumber(ARGV[3])
        local cost = tonumber(ARGV[4])
        local ttl = tonumber(ARGV[5])

        redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)

        local entries = redis.call('ZRANGE', key, 0, -1, 'WITHSCORES')
        local count = 0
        local score = 0
        local oldest = ''
        for i = 1, #entries, 2 do
            score = score + (tonumber(string.match(entries[i], '^[^:]*:(%d+):')) or 1)
            count = count + 1
            if i == 1 then
                oldest = entries[i + 1]
            end
        end

        if score + cost > limit then
            return {0, count, score, oldest}
        end

        redis.call('ZADD', key, now, ARGV[6])
        redis.call('EXPIRE', key, ttl)
        if oldest == '' then
            oldest = ARGV[1]
        end
        return {1, count + 1, score + cost, oldest}
        "#,
    )
});

static TALLY: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        local now = tonumber(ARGV[1])
        local window = tonumber(ARGV[2])

        local entries = redis.call('ZRANGEBYSCORE', KEYS[1], '(' .. (now - window), '+inf', 'WITHSCORES')
        local count = 0
        local score = 0
        local oldest = ''
        for i = 1, #entries, 2 do
            score = score + (tonumber(string.match(entries[i], '^[^:]*:(%d+):')) or 1)
            count = count + 1
            if i == 1 then
                oldest = entries[i + 1]
            end
        end
        return {count, score, oldest}
        "#,
    )
});

/// [`WindowStore`] backed by Redis sorted sets and Lua scripts.
#[derive(Clone)]
pub struct RedisWindowStore {
    redis: ConnectionManager,
    prefix: String,
}

impl std::fmt::Debug for RedisWindowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisWindowStore")
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl RedisWindowStore {
    pub async fn connect(config: &RedisConfig) -> Result<Self, AppError> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| AppError::Config(format!("Invalid REDIS_URL: {e}")))?;
        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| AppError::Store(format!("Failed to connect to Redis: {e}")))?;

        tracing::info!(prefix = %config.key_prefix, "Connected to Redis rate-limit store");
        Ok(Self::from_manager(redis, config.key_prefix.clone()))
    }

    /// Wrap an existing connection (useful for testing).
    pub fn from_manager(redis: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            redis,
            prefix: prefix.into(),
        }
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }
}

fn member(now: f64, cost: u64) -> String {
    let nonce: u64 = rand::rng().random();
    format!("{now:.6}:{cost}:{nonce:016x}")
}

fn parse_oldest(raw: &str) -> Result<Option<f64>, AppError> {
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse()
        .map(Some)
        .map_err(|_| AppError::Store(format!("Unexpected window score '{raw}'")))
}

fn store_error(op: &str, e: redis::RedisError) -> AppError {
    AppError::Store(format!("Redis {op} failed: {e}"))
}

impl WindowStore for RedisWindowStore {
    async fn admit(&self, request: &WindowRequest<'_>) -> Result<WindowAdmission, AppError> {
        let mut conn = self.redis.clone();
        let (allowed, count, score, oldest): (i64, u64, u64, String) = ADMIT
            .key(self.redis_key(request.key))
            .arg(request.now.to_string())
            .arg(request.window_seconds)
            .arg(request.limit)
            .arg(request.cost)
            .arg(request.ttl_seconds.max(1))
            .arg(member(request.now, request.cost))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| store_error("admit", e))?;

        Ok(WindowAdmission {
            allowed: allowed == 1,
            tally: WindowTally {
                count,
                score,
                oldest: parse_oldest(&oldest)?,
            },
        })
    }

    async fn tally(&self, key: &str, now: f64, window_seconds: u64) -> Result<WindowTally, AppError> {
        let mut conn = self.redis.clone();
        let (count, score, oldest): (u64, u64, String) = TALLY
            .key(self.redis_key(key))
            .arg(now.to_string())
            .arg(window_seconds)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| store_error("tally", e))?;

        Ok(WindowTally {
            count,
            score,
            oldest: parse_oldest(&oldest)?,
        })
    }

    async fn clear(&self, key: &str) -> Result<(), AppError> {
        let mut conn = self.redis.clone();
        let _: () = conn
            .del(self.redis_key(key))
            .await
            .map_err(|e| store_error("clear", e))?;
        Ok(())
    }
}
