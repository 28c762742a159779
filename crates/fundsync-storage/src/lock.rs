//! Named, non-blocking job locks.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use tracing::{debug, warn};

use crate::StoreError;

/// A lock currently held by this process.
#[async_trait]
pub trait HeldLock: Send {
    async fn release(self: Box<Self>) -> Result<(), StoreError>;

    /// Last-resort release used when the guard is dropped outside a runtime.
    fn abandon(self: Box<Self>) {}
}

#[async_trait]
pub trait LockManager: Send + Sync {
    /// `Ok(None)` when another holder has `name`.
    async fn try_acquire(&self, name: &str) -> Result<Option<LockGuard>, StoreError>;
}

/// Owns a held lock until `release` is awaited or the guard is dropped.
///
/// Release runs on its own task, so cancelling the caller mid-release does
/// not leave the lock behind. Dropping the guard schedules the same release.
pub struct LockGuard {
    name: String,
    held: Option<Box<dyn HeldLock>>,
}

impl LockGuard {
    pub fn new(name: impl Into<String>, held: Box<dyn HeldLock>) -> Self {
        Self {
            name: name.into(),
            held: Some(held),
        }
    }

    /// Guard for a batch that runs without a lock. Releasing it does nothing.
    pub fn disabled() -> Self {
        Self {
            name: String::new(),
            held: None,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.held.is_none()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn release(mut self) -> Result<(), StoreError> {
        let Some(held) = self.held.take() else {
            return Ok(());
        };
        let name = std::mem::take(&mut self.name);
        match tokio::spawn(held.release()).await {
            Ok(result) => {
                debug!(lock = %name, "job lock released");
                result
            }
            Err(join_err) => Err(StoreError::message(format!(
                "releasing lock {name}: {join_err}"
            ))),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(held) = self.held.take() else {
            return;
        };
        let name = std::mem::take(&mut self.name);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = held.release().await {
                        warn!(lock = %name, error = %err, "releasing dropped job lock failed");
                    }
                });
            }
            Err(_) => held.abandon(),
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("name", &self.name)
            .field("held", &self.held.is_some())
            .finish()
    }
}

/// First eight bytes of SHA-256(name), big-endian.
pub fn advisory_key(name: &str) -> i64 {
    let digest = Sha256::digest(name.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

/// Session-level Postgres advisory lock held on a dedicated pooled connection.
#[derive(Debug, Clone)]
pub struct PgAdvisoryLock {
    pool: PgPool,
}

impl PgAdvisoryLock {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockManager for PgAdvisoryLock {
    async fn try_acquire(&self, name: &str) -> Result<Option<LockGuard>, StoreError> {
        let key = advisory_key(name);
        let mut conn = self.pool.acquire().await?;
        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut *conn)
            .await?;
        if !locked {
            return Ok(None);
        }
        debug!(lock = name, key, "advisory lock acquired");
        Ok(Some(LockGuard::new(
            name,
            Box::new(PgHeldLock {
                conn,
                key,
                name: name.to_string(),
            }),
        )))
    }
}

struct PgHeldLock {
    conn: PoolConnection<Postgres>,
    key: i64,
    name: String,
}

#[async_trait]
impl HeldLock for PgHeldLock {
    async fn release(self: Box<Self>) -> Result<(), StoreError> {
        let mut this = *self;
        let unlocked = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(this.key)
            .fetch_one(&mut *this.conn)
            .await;
        match unlocked {
            Ok(true) => Ok(()),
            Ok(false) => {
                warn!(lock = %this.name, "advisory lock was not held at release");
                Ok(())
            }
            Err(err) => {
                // The session still holds the lock; it must not go back to the pool.
                warn!(lock = %this.name, error = %err, "advisory unlock failed, closing session");
                Box::new(this).abandon();
                Err(err.into())
            }
        }
    }

    fn abandon(self: Box<Self>) {
        let this = *self;
        // Closing the session drops every advisory lock it holds.
        drop(this.conn.detach());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryLock;
    use std::sync::{Arc, Mutex};

    #[test]
    fn advisory_keys_are_stable_per_name() {
        assert_eq!(advisory_key("scopus_ingest_job"), advisory_key("scopus_ingest_job"));
        assert_ne!(advisory_key("scopus_ingest_job"), advisory_key("scholar_import_job"));
    }

    #[tokio::test]
    async fn second_acquire_is_refused_until_release() {
        let locks = MemoryLock::default();
        let guard = locks.try_acquire("job").await.unwrap().expect("first acquire");
        assert!(locks.try_acquire("job").await.unwrap().is_none());
        assert!(locks.try_acquire("other").await.unwrap().is_some());

        guard.release().await.unwrap();
        assert!(locks.try_acquire("job").await.unwrap().is_some());
    }

    /// Records which release path ran.
    struct Recorder {
        fail_release: bool,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl HeldLock for Recorder {
        async fn release(self: Box<Self>) -> Result<(), StoreError> {
            self.log.lock().unwrap().push("release");
            if self.fail_release {
                return Err(StoreError::message("unlock timed out"));
            }
            Ok(())
        }

        fn abandon(self: Box<Self>) {
            self.log.lock().unwrap().push("abandon");
        }
    }

    fn recorded(fail_release: bool) -> (LockGuard, Arc<Mutex<Vec<&'static str>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let guard = LockGuard::new(
            "job",
            Box::new(Recorder {
                fail_release,
                log: Arc::clone(&log),
            }),
        );
        (guard, log)
    }

    #[tokio::test]
    async fn failed_release_is_reported_once() {
        let (guard, log) = recorded(true);
        assert!(guard.release().await.is_err());
        tokio::task::yield_now().await;
        assert_eq!(*log.lock().unwrap(), vec!["release"]);
    }

    #[test]
    fn guard_dropped_outside_a_runtime_is_abandoned() {
        let (guard, log) = recorded(false);
        drop(guard);
        assert_eq!(*log.lock().unwrap(), vec!["abandon"]);
    }

    #[tokio::test]
    async fn disabled_guard_holds_nothing() {
        let guard = LockGuard::disabled();
        assert!(guard.is_disabled());
        guard.release().await.unwrap();
        drop(LockGuard::disabled());
    }

    #[tokio::test]
    async fn dropped_guard_still_releases() {
        let locks = MemoryLock::default();
        let guard = locks.try_acquire("job").await.unwrap().expect("acquire");
        drop(guard);
        tokio::task::yield_now().await;
        assert!(!locks.is_held("job"));
    }
}
