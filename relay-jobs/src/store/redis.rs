//! Redis store backend for multi-worker deployments.
//!
//! Conditional writes (insert-if-absent, compare-and-swap) run as
//! server-side Lua scripts so the check and the write are one atomic step
//! even with many worker processes hammering the same key.
//!
//! Values are encoded as `"{version}\n{data}"`; the version line is what the
//! compare-and-swap script checks.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config as RedisConfig, Pool, Runtime};
use once_cell::sync::Lazy;
use redis::Script;

use super::{
    CasOutcome, PutIfAbsent, SharedStore, StoreError, Versioned, WindowCount,
};

static PUT_IF_ABSENT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
        local cur = redis.call('GET', KEYS[1])
        if cur then return cur end
        if ARGV[2] ~= '' then
            redis.call('SET', KEYS[1], ARGV[1], 'PX', tonumber(ARGV[2]))
        else
            redis.call('SET', KEYS[1], ARGV[1])
        end
        return ''
        ",
    )
});

static COMPARE_AND_SWAP: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
        local cur = redis.call('GET', KEYS[1])
        if cur == false then
            if ARGV[1] == '' then
                redis.call('SET', KEYS[1], '1\n' .. ARGV[2])
                return 1
            end
            return -1
        end
        local nl = string.find(cur, '\n', 1, true)
        if nl == nil then return -2 end
        local ver = string.sub(cur, 1, nl - 1)
        if ARGV[1] == ver then
            local nv = tonumber(ver) + 1
            redis.call('SET', KEYS[1], tostring(nv) .. '\n' .. ARGV[2])
            return nv
        end
        return -1
        ",
    )
});

/// Redis-backed [`SharedStore`].
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
}

impl RedisStore {
    /// Wrap an existing connection pool.
    #[must_use]
    pub const fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Create a pool for the given Redis URL and wrap it.
    pub fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = RedisConfig::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StoreError::Pool(format!("Failed to create Redis pool: {e}")))?;
        Ok(Self { pool })
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, StoreError> {
        self.pool.get().await.map_err(|e| {
            StoreError::Pool(format!("Failed to get Redis connection: {e}"))
        })
    }
}

fn encode(version: u64, data: &str) -> String {
    format!("{version}\n{data}")
}

fn decode(key: &str, raw: &str) -> Result<Versioned, StoreError> {
    let (version, data) = raw.split_once('\n').ok_or_else(|| StoreError::Corrupt {
        key: key.to_string(),
        detail: "missing version line".to_string(),
    })?;
    let version = version.parse::<u64>().map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        detail: format!("bad version line: {e}"),
    })?;
    Ok(Versioned {
        version,
        data: data.to_string(),
    })
}

fn backend_err(context: &str, err: &redis::RedisError) -> StoreError {
    StoreError::Backend(format!("{context}: {err}"))
}

fn ttl_millis(ttl: Option<Duration>) -> String {
    ttl.map(|t| t.as_millis().max(1).to_string())
        .unwrap_or_default()
}

fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| backend_err("GET failed", &e))?;
        raw.map(|r| decode(key, &r)).transpose()
    }

    async fn put(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(encode(1, value));
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(u64::try_from(ttl.as_millis().max(1)).unwrap_or(u64::MAX));
        }
        let _: () = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| backend_err("SET failed", &e))?;
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<PutIfAbsent, StoreError> {
        let mut conn = self.conn().await?;
        let existing: String = PUT_IF_ABSENT
            .key(key)
            .arg(encode(1, value))
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| backend_err("put-if-absent script failed", &e))?;
        if existing.is_empty() {
            Ok(PutIfAbsent::Inserted)
        } else {
            Ok(PutIfAbsent::Occupied(decode(key, &existing)?))
        }
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: &str,
    ) -> Result<CasOutcome, StoreError> {
        let mut conn = self.conn().await?;
        let expected_arg = expected.map(|v| v.to_string()).unwrap_or_default();
        let result: i64 = COMPARE_AND_SWAP
            .key(key)
            .arg(expected_arg)
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| backend_err("compare-and-swap script failed", &e))?;
        match result {
            -2 => Err(StoreError::Corrupt {
                key: key.to_string(),
                detail: "missing version line".to_string(),
            }),
            -1 => Ok(CasOutcome::Conflict),
            version => Ok(CasOutcome::Swapped(
                u64::try_from(version).map_err(|_| StoreError::Corrupt {
                    key: key.to_string(),
                    detail: format!("negative version {version}"),
                })?,
            )),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let removed: u64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| backend_err("DEL failed", &e))?;
        Ok(removed > 0)
    }

    async fn incr_window(
        &self,
        key: &str,
        window: Duration,
    ) -> Result<WindowCount, StoreError> {
        let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX).max(1);
        let now_ms = unix_millis();
        let bucket = now_ms / window_ms;
        let bucket_key = format!("{key}:{bucket}");

        let mut conn = self.conn().await?;
        let count: u64 = redis::cmd("INCR")
            .arg(&bucket_key)
            .query_async(&mut conn)
            .await
            .map_err(|e| backend_err("INCR failed", &e))?;

        // Expire the bucket on first touch; double the window covers clock
        // skew between workers.
        if count == 1 {
            let _: () = redis::cmd("PEXPIRE")
                .arg(&bucket_key)
                .arg(window_ms.saturating_mul(2))
                .query_async(&mut conn)
                .await
                .map_err(|e| backend_err("PEXPIRE failed", &e))?;
        }

        let window_end_ms = (bucket + 1) * window_ms;
        Ok(WindowCount {
            count,
            resets_in: Duration::from_millis(window_end_ms.saturating_sub(now_ms)),
        })
    }

    async fn append(&self, list: &str, value: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn().await?;
        let len: u64 = redis::cmd("RPUSH")
            .arg(list)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(|e| backend_err("RPUSH failed", &e))?;
        Ok(len)
    }

    async fn list_range(&self, list: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn().await?;
        let values: Vec<String> = redis::cmd("LRANGE")
            .arg(list)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(|e| backend_err("LRANGE failed", &e))?;
        Ok(values)
    }

    async fn list_trim(&self, list: &str, keep_last: u64) -> Result<(), StoreError> {
        // LTRIM keeps the given range: "-keep_last .. -1" is the newest
        // tail, "1 .. 0" the empty range.
        let (start, stop) = if keep_last == 0 {
            (1, 0)
        } else {
            (i64::try_from(keep_last).map(|k| -k).unwrap_or(i64::MIN), -1)
        };
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("LTRIM")
            .arg(list)
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await
            .map_err(|e| backend_err("LTRIM failed", &e))?;
        Ok(())
    }
}
