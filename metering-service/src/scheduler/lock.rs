//! Named mutual exclusion across processes (Postgres advisory locks) or
//! within one process (`MemoryLocks`).

use std::{
    collections::HashSet,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use futures::FutureExt;
use metering_client::db::lock_queries;
use sqlx::{pool::PoolConnection, PgPool, Postgres};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock connection unavailable: {0}")]
    Pool(#[from] sqlx::Error),
    #[error("lock backend error: {0:#}")]
    Backend(#[from] anyhow::Error),
}

/// Advisory lock key for a name: first 8 bytes of its blake3 digest.
pub fn lock_key(name: &str) -> i64 {
    let digest = blake3::hash(name.as_bytes());
    let mut key = [0u8; 8];
    key.copy_from_slice(&digest.as_bytes()[..8]);
    i64::from_be_bytes(key)
}

#[async_trait]
pub trait NamedLocks: Send + Sync {
    /// Non-blocking acquire. `Ok(None)` means another holder has it.
    async fn try_acquire(&self, name: &str) -> Result<Option<LockGuard>, LockError>;
}

enum Held {
    Pg {
        conn: Option<PoolConnection<Postgres>>,
        key: i64,
    },
    Memory {
        held: Arc<Mutex<HashSet<String>>>,
    },
}

/// A held lock. Call [`LockGuard::release`]; dropping it also frees the lock
/// (the Postgres variant closes its session instead of unlocking).
pub struct LockGuard {
    name: String,
    held: Held,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn release(mut self) -> Result<(), LockError> {
        if let Held::Pg { conn, key } = &mut self.held {
            if let Some(mut c) = conn.take() {
                let key = *key;
                if let Err(e) = lock_queries::advisory_unlock(&mut c, key).await {
                    // Keep the connection out of the pool so the session ends.
                    drop(c.detach());
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match &mut self.held {
            Held::Pg { conn, .. } => {
                if let Some(c) = conn.take() {
                    tracing::warn!(lock = %self.name, "lock guard dropped without release, closing session");
                    drop(c.detach());
                }
            }
            Held::Memory { held } => {
                held.lock().unwrap_or_else(|p| p.into_inner()).remove(&self.name);
            }
        }
    }
}

/// Session advisory locks, each held on its own pooled connection.
#[derive(Clone)]
pub struct PgAdvisoryLocks {
    pool: PgPool,
}

impl PgAdvisoryLocks {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NamedLocks for PgAdvisoryLocks {
    async fn try_acquire(&self, name: &str) -> Result<Option<LockGuard>, LockError> {
        let key = lock_key(name);
        let mut conn = self.pool.acquire().await?;
        if !lock_queries::try_advisory_lock(&mut conn, key).await? {
            return Ok(None);
        }
        Ok(Some(LockGuard {
            name: name.to_string(),
            held: Held::Pg { conn: Some(conn), key },
        }))
    }
}

#[derive(Clone, Default)]
pub struct MemoryLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

impl MemoryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, name: &str) -> bool {
        self.held.lock().unwrap_or_else(|p| p.into_inner()).contains(name)
    }
}

#[async_trait]
impl NamedLocks for MemoryLocks {
    async fn try_acquire(&self, name: &str) -> Result<Option<LockGuard>, LockError> {
        let inserted = self
            .held
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(name.to_string());
        if !inserted {
            return Ok(None);
        }
        Ok(Some(LockGuard {
            name: name.to_string(),
            held: Held::Memory { held: self.held.clone() },
        }))
    }
}

/// Runs `fut` while holding `name`. Returns `Ok(None)` without running it when
/// the lock is taken. The lock is released on every exit path, panics included.
pub async fn with_lock<L, F, T>(locks: &L, name: &str, fut: F) -> Result<Option<T>, LockError>
where
    L: NamedLocks + ?Sized,
    F: Future<Output = T>,
{
    let Some(guard) = locks.try_acquire(name).await? else {
        return Ok(None);
    };
    let out = AssertUnwindSafe(fut).catch_unwind().await;
    if let Err(e) = guard.release().await {
        tracing::warn!(lock = name, error = %e, "lock release failed");
    }
    match out {
        Ok(value) => Ok(Some(value)),
        Err(panic) => std::panic::resume_unwind(panic),
    }
}
