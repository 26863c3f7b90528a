//! Per-video mutual exclusion.
//!
//! One fair async mutex per video key, created on first use and dropped once
//! no holder or waiter references it. Process-local only.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

/// A video's mutex and the number of callers holding or awaiting it.
#[derive(Default)]
struct Slot {
    mutex: Arc<AsyncMutex<()>>,
    users: usize,
}

type Arena = Arc<Mutex<HashMap<String, Slot>>>;

/// Arena of per-video locks.
#[derive(Clone, Default)]
pub struct VideoLock {
    arena: Arena,
}

impl VideoLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other holder exists for `video_key`, then take the lock.
    ///
    /// Waiters are served in arrival order. The lock is released when the
    /// returned guard is dropped or [`VideoLockGuard::release`] is called.
    /// Dropping the returned future while it waits gives up its place.
    pub async fn acquire(&self, video_key: &str) -> VideoLockGuard {
        let (user, mutex) = self.join(video_key);
        let guard = mutex.lock_owned().await;
        debug!(video_key, "Acquired video lock");

        VideoLockGuard {
            guard: Some(guard),
            user: Some(user),
        }
    }

    /// True while some caller holds or awaits the lock for `video_key`.
    pub fn is_contended(&self, video_key: &str) -> bool {
        let arena = self.arena.lock().unwrap_or_else(|e| e.into_inner());
        arena.contains_key(video_key)
    }

    fn join(&self, video_key: &str) -> (SlotUser, Arc<AsyncMutex<()>>) {
        let mut arena = self.arena.lock().unwrap_or_else(|e| e.into_inner());
        let slot = arena.entry(video_key.to_string()).or_default();
        slot.users += 1;
        let user = SlotUser {
            video_key: video_key.to_string(),
            arena: Arc::clone(&self.arena),
        };
        (user, Arc::clone(&slot.mutex))
    }
}

/// Registration in a slot; the slot is removed when its last user drops.
struct SlotUser {
    video_key: String,
    arena: Arena,
}

impl Drop for SlotUser {
    fn drop(&mut self) {
        let mut arena = self.arena.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = arena.get_mut(&self.video_key) {
            slot.users = slot.users.saturating_sub(1);
            if slot.users == 0 {
                arena.remove(&self.video_key);
            }
        }
    }
}

/// Scoped hold on a video lock.
pub struct VideoLockGuard {
    guard: Option<OwnedMutexGuard<()>>,
    user: Option<SlotUser>,
}

impl VideoLockGuard {
    /// Release the lock. Calling this more than once has no effect.
    pub fn release(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        drop(guard);
        if let Some(user) = self.user.take() {
            debug!(video_key = %user.video_key, "Released video lock");
        }
    }
}

impl Drop for VideoLockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let lock = VideoLock::new();
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = lock.clone();
            let active = Arc::clone(&active);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                let _guard = lock.acquire("video-1").await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert!(!lock.is_contended("video-1"));
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let lock = VideoLock::new();
        let _a = lock.acquire("video-a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), lock.acquire("video-b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let lock = VideoLock::new();
        let mut guard = lock.acquire("video-1").await;
        guard.release();
        guard.release();
        assert!(!lock.is_contended("video-1"));

        let again = tokio::time::timeout(Duration::from_millis(100), lock.acquire("video-1")).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn test_waiter_keeps_entry_alive() {
        let lock = VideoLock::new();
        let mut first = lock.acquire("video-1").await;

        let waiter_lock = lock.clone();
        let waiter = tokio::spawn(async move {
            let _g = waiter_lock.acquire("video-1").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        first.release();
        assert!(waiter.await.is_ok());
        assert!(!lock.is_contended("video-1"));
    }

    #[tokio::test]
    async fn test_abandoned_waiter_leaves_no_entry() {
        let lock = VideoLock::new();
        let mut first = lock.acquire("video-1").await;

        let waited = tokio::time::timeout(Duration::from_millis(20), lock.acquire("video-1")).await;
        assert!(waited.is_err());
        assert!(lock.is_contended("video-1"));

        first.release();
        assert!(!lock.is_contended("video-1"));

        // A waiter dropped after the holder left must not pin the entry either.
        let mut held = lock.acquire("video-2").await;
        let waiter_lock = lock.clone();
        let waiter = tokio::spawn(async move {
            let _g = waiter_lock.acquire("video-2").await;
            std::future::pending::<()>().await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        held.release();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(lock.is_contended("video-2"));
        waiter.abort();
        let _ = waiter.await;
        assert!(!lock.is_contended("video-2"));
    }
}
