// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Redis dedup backend shared by every worker process.
//!
//! Algorithm:
//! - Claim: `SET key entry NX PX ttl_ms`; on refusal `GET` the holder
//! - Force: `SET key entry PX ttl_ms`
//! - Release: `GET` the holder, `DEL` only if it is the releasing job
//! - Clear: `SCAN MATCH prefix*` then `DEL`
//!
//! Keys carry their own expiry, so `sweep` has nothing to do.

use super::dedup::{DedupBackend, DedupEntry};
use async_trait::async_trait;
use orbit_finality_core::{FinalityError, FinalityResult};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Commands the backend needs, kept narrow so tests can run without a server.
#[async_trait]
trait RedisCommands: Send + Sync + std::fmt::Debug + 'static {
    async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> FinalityResult<bool>;
    async fn set_px(&self, key: &str, value: &str, ttl_ms: u64) -> FinalityResult<()>;
    async fn get(&self, key: &str) -> FinalityResult<Option<String>>;
    async fn scan(&self, pattern: &str) -> FinalityResult<Vec<String>>;
    async fn del(&self, keys: &[String]) -> FinalityResult<usize>;
}

#[derive(Debug, Clone)]
pub struct RedisDedupBackend {
    commands: Arc<dyn RedisCommands>,
}

impl RedisDedupBackend {
    pub async fn connect(url: &str, timeout: Duration) -> FinalityResult<Self> {
        if url.trim().is_empty() {
            return Err(FinalityError::Configuration("redis url is empty".to_string()));
        }
        let client = redis::Client::open(url)
            .map_err(|e| FinalityError::Configuration(format!("invalid redis url: {}", e)))?;
        let conn = with_timeout(timeout, client.get_multiplexed_async_connection()).await?;
        let commands = MultiplexedCommands { conn, timeout };
        commands.ping().await?;
        info!("[Coordinator] Using redis dedup backend");
        Ok(Self {
            commands: Arc::new(commands),
        })
    }

    #[cfg(test)]
    fn for_test(commands: Arc<dyn RedisCommands>) -> Self {
        Self { commands }
    }
}

fn ttl_ms(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn encode(entry: &DedupEntry) -> FinalityResult<String> {
    serde_json::to_string(entry).map_err(|e| FinalityError::Internal(e.to_string()))
}

fn decode(raw: &str) -> FinalityResult<DedupEntry> {
    serde_json::from_str(raw)
        .map_err(|e| FinalityError::Decode(format!("dedup entry '{}': {}", raw, e)))
}

#[async_trait]
impl DedupBackend for RedisDedupBackend {
    async fn try_claim(
        &self,
        key: &str,
        entry: &DedupEntry,
        ttl: Duration,
    ) -> FinalityResult<Option<DedupEntry>> {
        let value = encode(entry)?;
        // A holder can expire between SET NX and GET; one retry covers it.
        for _ in 0..2 {
            if self.commands.set_nx_px(key, &value, ttl_ms(ttl)).await? {
                return Ok(None);
            }
            if let Some(raw) = self.commands.get(key).await? {
                return decode(&raw).map(Some);
            }
        }
        Err(FinalityError::Store(format!("dedup key {} is contended", key)))
    }

    async fn force_claim(&self, key: &str, entry: &DedupEntry, ttl: Duration) -> FinalityResult<()> {
        self.commands.set_px(key, &encode(entry)?, ttl_ms(ttl)).await
    }

    async fn release(&self, key: &str, job_id: &str) -> FinalityResult<bool> {
        let Some(raw) = self.commands.get(key).await? else {
            return Ok(false);
        };
        if decode(&raw)?.job_id != job_id {
            return Ok(false);
        }
        Ok(self.commands.del(&[key.to_string()]).await? > 0)
    }

    async fn clear_prefix(&self, prefix: &str) -> FinalityResult<usize> {
        let keys = self.commands.scan(&format!("{}*", prefix)).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let removed = self.commands.del(&keys).await?;
        debug!("[Coordinator] Cleared {} redis keys under {}", removed, prefix);
        Ok(removed)
    }

    async fn sweep(&self, _older_than: Duration) -> FinalityResult<usize> {
        Ok(0)
    }
}

#[derive(Clone)]
struct MultiplexedCommands {
    conn: redis::aio::MultiplexedConnection,
    timeout: Duration,
}

impl std::fmt::Debug for MultiplexedCommands {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiplexedCommands")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl MultiplexedCommands {
    async fn query<T: redis::FromRedisValue>(&self, cmd: redis::Cmd) -> FinalityResult<T> {
        let mut conn = self.conn.clone();
        with_timeout(self.timeout, async move {
            cmd.query_async::<_, T>(&mut conn).await
        })
        .await
    }

    async fn ping(&self) -> FinalityResult<()> {
        self.query::<String>(redis::cmd("PING")).await.map(|_| ())
    }
}

#[async_trait]
impl RedisCommands for MultiplexedCommands {
    async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> FinalityResult<bool> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX").arg("PX").arg(ttl_ms);
        let reply: Option<String> = self.query(cmd).await?;
        Ok(reply.is_some())
    }

    async fn set_px(&self, key: &str, value: &str, ttl_ms: u64) -> FinalityResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("PX").arg(ttl_ms);
        self.query::<String>(cmd).await.map(|_| ())
    }

    async fn get(&self, key: &str) -> FinalityResult<Option<String>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.query(cmd).await
    }

    async fn scan(&self, pattern: &str) -> FinalityResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor = 0u64;
        loop {
            let mut cmd = redis::cmd("SCAN");
            cmd.arg(cursor).arg("MATCH").arg(pattern).arg("COUNT").arg(100);
            let (next, batch): (u64, Vec<String>) = self.query(cmd).await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn del(&self, keys: &[String]) -> FinalityResult<usize> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(keys);
        self.query(cmd).await
    }
}

async fn with_timeout<T>(
    timeout: Duration,
    fut: impl Future<Output = redis::RedisResult<T>>,
) -> FinalityResult<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(map_redis_err),
        Err(_) => Err(FinalityError::Store(format!(
            "redis command timed out after {:?}",
            timeout
        ))),
    }
}

fn map_redis_err(e: redis::RedisError) -> FinalityError {
    if e.is_timeout() || e.is_connection_dropped() || e.is_connection_refusal() {
        return FinalityError::Store(format!("redis unavailable: {}", e));
    }
    FinalityError::Store(format!("redis: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::epoch;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    /// key -> (value, expires_at_ms)
    #[derive(Debug, Default)]
    struct FakeRedis {
        inner: Mutex<HashMap<String, (String, u64)>>,
        now_ms: AtomicU64,
    }

    impl FakeRedis {
        fn advance(&self, ms: u64) {
            self.now_ms.fetch_add(ms, Ordering::SeqCst);
        }

        fn live(&self) -> std::sync::MutexGuard<'_, HashMap<String, (String, u64)>> {
            let now = self.now_ms.load(Ordering::SeqCst);
            let mut map = self.inner.lock().unwrap();
            map.retain(|_, (_, expires)| now < *expires);
            map
        }
    }

    #[async_trait]
    impl RedisCommands for FakeRedis {
        async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> FinalityResult<bool> {
            let now = self.now_ms.load(Ordering::SeqCst);
            let mut map = self.live();
            if map.contains_key(key) {
                return Ok(false);
            }
            map.insert(key.to_string(), (value.to_string(), now + ttl_ms));
            Ok(true)
        }

        async fn set_px(&self, key: &str, value: &str, ttl_ms: u64) -> FinalityResult<()> {
            let now = self.now_ms.load(Ordering::SeqCst);
            self.live()
                .insert(key.to_string(), (value.to_string(), now + ttl_ms));
            Ok(())
        }

        async fn get(&self, key: &str) -> FinalityResult<Option<String>> {
            Ok(self.live().get(key).map(|(v, _)| v.clone()))
        }

        async fn scan(&self, pattern: &str) -> FinalityResult<Vec<String>> {
            let prefix = pattern.trim_end_matches('*');
            Ok(self
                .live()
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect())
        }

        async fn del(&self, keys: &[String]) -> FinalityResult<usize> {
            let mut map = self.live();
            Ok(keys.iter().filter(|k| map.remove(*k).is_some()).count())
        }
    }

    fn entry(job_id: &str) -> DedupEntry {
        DedupEntry {
            job_id: job_id.to_string(),
            enqueued_at: epoch(),
        }
    }

    #[tokio::test]
    async fn claim_is_set_if_absent_with_expiry() {
        let fake = Arc::new(FakeRedis::default());
        let backend = RedisDedupBackend::for_test(fake.clone());
        let ttl = Duration::from_secs(120);

        assert_eq!(backend.try_claim("k", &entry("a"), ttl).await.unwrap(), None);
        fake.advance(60_000);
        assert_eq!(
            backend.try_claim("k", &entry("b"), ttl).await.unwrap(),
            Some(entry("a"))
        );
        fake.advance(61_000);
        assert_eq!(backend.try_claim("k", &entry("c"), ttl).await.unwrap(), None);
    }

    #[tokio::test]
    async fn force_overwrites_and_prefix_clear_scans() {
        let fake = Arc::new(FakeRedis::default());
        let backend = RedisDedupBackend::for_test(fake.clone());
        let ttl = Duration::from_secs(120);

        backend.try_claim("d:7:a", &entry("a"), ttl).await.unwrap();
        backend.force_claim("d:7:a", &entry("b"), ttl).await.unwrap();
        backend.try_claim("d:8:a", &entry("c"), ttl).await.unwrap();
        assert_eq!(
            backend.try_claim("d:7:a", &entry("x"), ttl).await.unwrap(),
            Some(entry("b"))
        );

        assert_eq!(backend.clear_prefix("d:7:").await.unwrap(), 1);
        assert_eq!(backend.try_claim("d:7:a", &entry("y"), ttl).await.unwrap(), None);
        assert_eq!(backend.sweep(Duration::ZERO).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn release_deletes_only_its_own_claim() {
        let fake = Arc::new(FakeRedis::default());
        let backend = RedisDedupBackend::for_test(fake.clone());
        let ttl = Duration::from_secs(120);
        backend.try_claim("k", &entry("a"), ttl).await.unwrap();

        assert!(!backend.release("k", "b").await.unwrap());
        assert!(!backend.release("missing", "a").await.unwrap());
        assert!(fake.get("k").await.unwrap().is_some());
        assert!(backend.release("k", "a").await.unwrap());
        assert_eq!(backend.try_claim("k", &entry("c"), ttl).await.unwrap(), None);
    }

    #[tokio::test]
    async fn corrupt_entries_surface_as_decode_errors() {
        let fake = Arc::new(FakeRedis::default());
        fake.set_px("k", "not json", 1_000).await.unwrap();
        let backend = RedisDedupBackend::for_test(fake);

        let err = backend
            .try_claim("k", &entry("a"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, FinalityError::Decode(_)));
    }
}
