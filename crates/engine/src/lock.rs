//! Per-instance mutual exclusion.
//!
//! Every mutating service operation runs inside a non-blocking critical
//! section keyed by `workflow_instance_execute_<id>`: if another holder owns
//! the key the acquire fails immediately with `LockFailed` — there is no
//! queueing. A lease bounds stuck holders; an expired entry is treated as
//! free by the next acquirer.
//!
//! Reentrancy is explicit: a [`LockScope`] carries the keys held by the
//! current call chain, and an acquire against a key the scope already holds
//! succeeds without touching the lock (and without releasing on exit). The
//! scope is threaded through calls as an argument — no thread-local or
//! task-local state.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::EngineError;

/// Lease for the per-instance critical section.
pub const INSTANCE_LOCK_LEASE: Duration = Duration::from_secs(600);

/// Lock key for a workflow instance.
pub fn instance_lock_key(instance_id: i64) -> String {
    format!("workflow_instance_execute_{instance_id}")
}

/// The set of lock keys held by the current call chain.
#[derive(Debug, Clone, Default)]
pub struct LockScope {
    held: HashSet<String>,
}

impl LockScope {
    /// A fresh scope holding nothing — the entry point of every public
    /// service operation.
    pub fn root() -> Self {
        Self::default()
    }

    pub fn holds(&self, key: &str) -> bool {
        self.held.contains(key)
    }

    /// A child scope that additionally holds `key`.
    pub fn child(&self, key: &str) -> Self {
        let mut held = self.held.clone();
        held.insert(key.to_string());
        Self { held }
    }
}

/// The lock provider contract. Only the non-blocking behavior matters:
/// a contended `try_acquire` must fail immediately, never queue.
#[async_trait]
pub trait WorkflowLock: Send + Sync {
    /// Try to take `key` for at most `lease`. Returns an owner token on
    /// success; fails with [`EngineError::LockFailed`] if another unexpired
    /// holder owns the key.
    async fn try_acquire(&self, key: &str, lease: Duration) -> Result<String, EngineError>;

    /// Release `key` if `token` still owns it. Releasing with a stale token
    /// (e.g. after lease expiry handed the key to someone else) is a no-op.
    async fn release(&self, key: &str, token: &str);
}

/// In-process lock provider.
#[derive(Default)]
pub struct LocalLock {
    entries: Mutex<HashMap<String, LockEntry>>,
    token_seq: AtomicU64,
}

struct LockEntry {
    token: String,
    expires_at: Instant,
}

impl LocalLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowLock for LocalLock {
    async fn try_acquire(&self, key: &str, lease: Duration) -> Result<String, EngineError> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get(key) {
            if entry.expires_at > Instant::now() {
                return Err(EngineError::LockFailed(format!("key already held: {key}")));
            }
            // lease expired: force-release the stuck holder
        }
        let token = format!("lock-{}", self.token_seq.fetch_add(1, Ordering::Relaxed));
        entries.insert(
            key.to_string(),
            LockEntry {
                token: token.clone(),
                expires_at: Instant::now() + lease,
            },
        );
        Ok(token)
    }

    async fn release(&self, key: &str, token: &str) {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.token == token => {
                entries.remove(key);
            }
            Some(_) => {
                tracing::warn!(key, "lock release skipped: token no longer owns the key");
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[tokio::test]
    async fn second_acquire_fails_immediately() {
        let lock = LocalLock::new();
        let token = lock.try_acquire("k", INSTANCE_LOCK_LEASE).await.unwrap();
        let err = lock.try_acquire("k", INSTANCE_LOCK_LEASE).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockFailed);

        lock.release("k", &token).await;
        lock.try_acquire("k", INSTANCE_LOCK_LEASE)
            .await
            .expect("free after release");
    }

    #[tokio::test]
    async fn expired_lease_is_treated_as_free() {
        let lock = LocalLock::new();
        let stale = lock
            .try_acquire("k", Duration::from_millis(0))
            .await
            .unwrap();
        let fresh = lock
            .try_acquire("k", INSTANCE_LOCK_LEASE)
            .await
            .expect("expired entry must not block");

        // the stale token can no longer release the key
        lock.release("k", &stale).await;
        let err = lock.try_acquire("k", INSTANCE_LOCK_LEASE).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockFailed);

        lock.release("k", &fresh).await;
    }

    #[tokio::test]
    async fn independent_keys_do_not_contend() {
        let lock = LocalLock::new();
        lock.try_acquire("a", INSTANCE_LOCK_LEASE).await.unwrap();
        lock.try_acquire("b", INSTANCE_LOCK_LEASE).await.unwrap();
    }

    #[test]
    fn scope_reentrancy() {
        let scope = LockScope::root();
        let key = instance_lock_key(7);
        assert!(!scope.holds(&key));
        let child = scope.child(&key);
        assert!(child.holds(&key));
        // the parent is unaffected
        assert!(!scope.holds(&key));
    }
}
