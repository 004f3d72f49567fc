//! Distributed mutual exclusion for scheduled jobs.
//
//  Redis keys
//  ----------
//  lock:<name>  – STRING  value = <token>, PX = ttl

use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use redis::{Client as RedisClient, Script};
use uuid::Uuid;

use crate::error::EngineResult;

/// Proof of ownership handed back by [`DistributedLock::try_acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(String);

impl LockToken {
    fn fresh() -> Self {
        LockToken(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Take `key` for `ttl` if nobody holds it. `None` when held elsewhere.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> EngineResult<Option<LockToken>>;

    /// Drop `key` only if it is still held with `token`.
    async fn release(&self, key: &str, token: &LockToken) -> EngineResult<bool>;
}

/// Run `f` while holding `key`.
///
/// A held lock yields `Ok(None)`; a backend failure is returned so the
/// calling job fails and is retried later.
pub async fn with_lock<T, F, Fut>(
    lock: &dyn DistributedLock,
    key: &str,
    ttl: Duration,
    f: F,
) -> EngineResult<Option<T>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = EngineResult<T>>,
{
    let Some(token) = lock.try_acquire(key, ttl).await? else {
        log::debug!("lock {key} is held elsewhere, skipping");
        return Ok(None);
    };

    let result = f().await;

    match lock.release(key, &token).await {
        Ok(true) => {}
        Ok(false) => log::warn!("lock {key} expired before release"),
        Err(e) => log::warn!("releasing lock {key} failed: {e}"),
    }
    result.map(Some)
}

static RELEASE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('DEL', KEYS[1])
        end
        return 0
        "#,
    )
});

pub struct RedisLock {
    client: RedisClient,
}

impl RedisLock {
    pub fn new(client: RedisClient) -> Self {
        RedisLock { client }
    }
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> EngineResult<Option<LockToken>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let token = LockToken::fresh();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token.as_str())
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.map(|_| token))
    }

    async fn release(&self, key: &str, token: &LockToken) -> EngineResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let removed: i64 = RELEASE
            .key(key)
            .arg(token.as_str())
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }
}

/// Process-local lock with the same expiry semantics.
#[derive(Default)]
pub struct MemoryLock {
    held: DashMap<String, (String, Instant)>,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Occupy `key` as if another process held it.
    pub fn hold(&self, key: &str, ttl: Duration) -> LockToken {
        let token = LockToken::fresh();
        self.held
            .insert(key.to_owned(), (token.0.clone(), Instant::now() + ttl));
        token
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.held
            .get(key)
            .is_some_and(|slot| slot.1 > Instant::now())
    }
}

#[async_trait]
impl DistributedLock for MemoryLock {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> EngineResult<Option<LockToken>> {
        let now = Instant::now();
        let token = LockToken::fresh();
        match self.held.entry(key.to_owned()) {
            Entry::Occupied(mut slot) => {
                if slot.get().1 > now {
                    return Ok(None);
                }
                slot.insert((token.0.clone(), now + ttl));
            }
            Entry::Vacant(slot) => {
                slot.insert((token.0.clone(), now + ttl));
            }
        }
        Ok(Some(token))
    }

    async fn release(&self, key: &str, token: &LockToken) -> EngineResult<bool> {
        Ok(self
            .held
            .remove_if(key, |_, (owner, _)| *owner == token.0)
            .is_some())
    }
}
