//! Redis-backed gateway shared by every registrar in the cluster.
//!
//! - Shared clock: Redis `TIME`
//! - Tables: one bincode snapshot under `rollcall:tables`
//! - Transactions: serialised by a token-guarded lock key; the snapshot is
//!   written only while the token still owns the lock

use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use rollcall_common::constants::redis_keys;
use rollcall_common::{RollcallError, RollcallResult};
use std::time::{Duration, Instant};

use super::{Gateway, Tables, Tx};

const COMMIT_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('SET', KEYS[2], ARGV[2])
    return 1
end
return 0
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

fn store_err(e: impl std::fmt::Display) -> RollcallError {
    RollcallError::Store(e.to_string())
}

/// Gateway over a Redis connection manager (auto-reconnecting)
pub struct RedisGateway {
    redis: ConnectionManager,
    lock_ttl: Duration,
    lock_wait: Duration,
}

impl RedisGateway {
    /// Connect to Redis
    pub async fn connect(
        redis_url: &str,
        lock_ttl: Duration,
        lock_wait: Duration,
    ) -> RollcallResult<Self> {
        let client = redis::Client::open(redis_url).map_err(store_err)?;
        let redis = ConnectionManager::new(client).await.map_err(store_err)?;

        Ok(Self {
            redis,
            lock_ttl,
            lock_wait,
        })
    }

    /// Check Redis connectivity
    pub async fn ping(&self) -> bool {
        let mut conn = self.redis.clone();
        let result: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
        result.is_ok()
    }

    async fn load(&self) -> RollcallResult<Tables> {
        let mut conn = self.redis.clone();
        let data: Option<Vec<u8>> = conn.get(redis_keys::TABLES).await.map_err(store_err)?;

        match data {
            Some(bytes) => bincode::deserialize(&bytes).map_err(store_err),
            None => Ok(Tables::default()),
        }
    }

    async fn acquire(&self) -> RollcallResult<String> {
        let token = format!("{:016x}", rand::random::<u64>());
        let deadline = Instant::now() + self.lock_wait;
        let mut conn = self.redis.clone();

        loop {
            let acquired: Option<String> = redis::cmd("SET")
                .arg(redis_keys::TABLES_LOCK)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(self.lock_ttl.as_millis() as u64)
                .query_async(&mut conn)
                .await
                .map_err(store_err)?;

            if acquired.is_some() {
                return Ok(token);
            }
            if Instant::now() >= deadline {
                return Err(RollcallError::Timeout(
                    "waiting for the tables lock".to_string(),
                ));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn release(&self, token: &str) {
        let mut conn = self.redis.clone();
        let result: Result<i32, _> = redis::Script::new(RELEASE_SCRIPT)
            .key(redis_keys::TABLES_LOCK)
            .arg(token)
            .invoke_async(&mut conn)
            .await;

        if let Err(e) = result {
            tracing::warn!(error = %e, "Failed to release tables lock");
        }
    }

    async fn commit(&self, token: &str, tables: &Tables) -> RollcallResult<()> {
        let bytes = bincode::serialize(tables).map_err(store_err)?;
        let mut conn = self.redis.clone();
        let written: i32 = redis::Script::new(COMMIT_SCRIPT)
            .key(redis_keys::TABLES_LOCK)
            .key(redis_keys::TABLES)
            .arg(token)
            .arg(bytes)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;

        if written == 0 {
            return Err(RollcallError::Store(
                "tables lock expired before commit".to_string(),
            ));
        }
        Ok(())
    }
}

impl Gateway for RedisGateway {
    async fn now(&self) -> RollcallResult<DateTime<Utc>> {
        let mut conn = self.redis.clone();
        let (secs, micros): (i64, i64) = redis::cmd("TIME")
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;

        DateTime::from_timestamp(secs, (micros * 1_000) as u32)
            .ok_or_else(|| RollcallError::Store(format!("invalid server time {secs}.{micros}")))
    }

    async fn read<R, F>(&self, f: F) -> RollcallResult<R>
    where
        R: Send,
        F: FnOnce(&Tables, DateTime<Utc>) -> RollcallResult<R> + Send,
    {
        let now = self.now().await?;
        let tables = self.load().await?;
        f(&tables, now)
    }

    async fn transaction<R, F>(&self, f: F) -> RollcallResult<R>
    where
        R: Send,
        F: FnOnce(&mut Tx<'_>) -> RollcallResult<R> + Send,
    {
        let token = self.acquire().await?;

        let result = async {
            let now = self.now().await?;
            let mut tables = self.load().await?;
            let output = f(&mut Tx::new(&mut tables, now))?;
            self.commit(&token, &tables).await?;
            Ok(output)
        }
        .await;

        self.release(&token).await;
        result
    }
}
