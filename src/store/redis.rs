// src/store/redis.rs
//
// Redis adapter. One ConnectionManager shared by all tasks (it multiplexes
// and reconnects internally); every call is wrapped in an explicit timeout so
// a wedged server can never stall the request path. Multi-key operations go
// through a single pipeline round trip.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::info;

use super::{IndexStore, StoreError};

const OP_TIMEOUT: Duration = Duration::from_secs(5);
// SCAN walks can be long on big keyspaces; give them more room.
const SCAN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct RedisStore {
    manager: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(host: &str, port: u16) -> Result<Self, StoreError> {
        let url = format!("redis://{host}:{port}");
        let client = redis::Client::open(url.as_str())
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let manager = tokio::time::timeout(OP_TIMEOUT, client.get_connection_manager())
            .await
            .map_err(|_| StoreError::Timeout)?
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        info!(%url, "connected to index store");
        Ok(Self { manager })
    }

    async fn run<T, F>(&self, timeout: Duration, fut: F) -> Result<T, StoreError>
    where
        F: std::future::Future<Output = redis::RedisResult<T>>,
    {
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout)?
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl IndexStore for RedisStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let mut con = self.manager.clone();
        self.run(OP_TIMEOUT, async move {
            redis::cmd("PING").query_async::<_, String>(&mut con).await
        })
        .await
        .map(|_| ())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut con = self.manager.clone();
        let key = key.to_string();
        self.run(OP_TIMEOUT, async move { con.get(key).await }).await
    }

    async fn get_i64(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let mut con = self.manager.clone();
        let key = key.to_string();
        self.run(OP_TIMEOUT, async move { con.get(key).await }).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut con = self.manager.clone();
        let (key, value) = (key.to_string(), value.to_string());
        self.run(OP_TIMEOUT, async move { con.set(key, value).await })
            .await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut con = self.manager.clone();
        let (key, value) = (key.to_string(), value.to_string());
        self.run(OP_TIMEOUT, async move {
            con.set_ex(key, value, ttl.as_secs()).await
        })
        .await
    }

    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut con = self.manager.clone();
        let (key, value) = (key.to_string(), value.to_string());
        let reply: Option<String> = self
            .run(OP_TIMEOUT, async move {
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("EX")
                    .arg(ttl.as_secs())
                    .query_async(&mut con)
                    .await
            })
            .await?;
        Ok(reply.is_some())
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let mut con = self.manager.clone();
        let key = key.to_string();
        self.run(OP_TIMEOUT, async move { con.incr(key, delta).await })
            .await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut con = self.manager.clone();
        let key = key.to_string();
        self.run(OP_TIMEOUT, async move {
            con.expire(key, ttl.as_secs() as i64).await
        })
        .await
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut con = self.manager.clone();
        let (key, member) = (key.to_string(), member.to_string());
        self.run(OP_TIMEOUT, async move { con.sadd(key, member).await })
            .await
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut con = self.manager.clone();
        let (key, member) = (key.to_string(), member.to_string());
        self.run(OP_TIMEOUT, async move { con.srem(key, member).await })
            .await
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut con = self.manager.clone();
        let (key, member) = (key.to_string(), member.to_string());
        self.run(OP_TIMEOUT, async move { con.sismember(key, member).await })
            .await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut con = self.manager.clone();
        let key = key.to_string();
        self.run(OP_TIMEOUT, async move { con.smembers(key).await })
            .await
    }

    async fn exists_many(&self, keys: &[String]) -> Result<Vec<bool>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut con = self.manager.clone();
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.exists(key);
        }
        self.run(OP_TIMEOUT, async move { pipe.query_async(&mut con).await })
            .await
    }

    async fn smembers_many(&self, keys: &[String]) -> Result<Vec<Vec<String>>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut con = self.manager.clone();
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.smembers(key);
        }
        self.run(OP_TIMEOUT, async move { pipe.query_async(&mut con).await })
            .await
    }

    async fn expire_many(&self, keys: &[String], ttl: Duration) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut con = self.manager.clone();
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.expire(key, ttl.as_secs() as i64).ignore();
        }
        self.run(OP_TIMEOUT, async move { pipe.query_async(&mut con).await })
            .await
    }

    async fn sadd_many(
        &self,
        entries: &[(String, String)],
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut con = self.manager.clone();
        let mut pipe = redis::pipe();
        for (key, member) in entries {
            pipe.sadd(key, member).ignore();
            if let Some(ttl) = ttl {
                pipe.expire(key, ttl.as_secs() as i64).ignore();
            }
        }
        self.run(OP_TIMEOUT, async move { pipe.query_async(&mut con).await })
            .await
    }

    async fn set_flags(&self, keys: &[String]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut con = self.manager.clone();
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.set(key, "1").ignore();
        }
        self.run(OP_TIMEOUT, async move { pipe.query_async(&mut con).await })
            .await
    }

    async fn del_many(&self, keys: &[String]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut con = self.manager.clone();
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.del(key).ignore();
        }
        self.run(OP_TIMEOUT, async move { pipe.query_async(&mut con).await })
            .await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        let mut con = self.manager.clone();
        let pattern = format!("{prefix}*");
        self.run(SCAN_TIMEOUT, async move {
            let keys: Vec<String> = {
                let mut iter = con.scan_match::<_, String>(&pattern).await?;
                let mut keys = Vec::new();
                while let Some(key) = iter.next_item().await {
                    keys.push(key);
                }
                keys
            };
            if keys.is_empty() {
                return Ok(0);
            }
            let removed: u64 = con.del(&keys).await?;
            Ok(removed)
        })
        .await
    }
}
