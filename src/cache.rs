// Copyright (C) myl7
// SPDX-License-Identifier: Apache-2.0

//! Process-wide, volatile TTL cache for parsed channel records (spec.md
//! §4.3). Entries are evicted on read-after-expiry, by the periodic sweep,
//! or by explicit [`Cache::remove`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{oneshot, RwLock};
use tokio::time::Instant;

struct Entry<V> {
    value: V,
    expires: Instant,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub success: u64,
    pub failed: u64,
    pub len: usize,
}

/// A cancel handle for a [`Cache::check_every`] sweeper. Dropping it also
/// signals the sweeper to exit on its next wake, since the paired
/// `oneshot::Receiver` resolves to an error either way.
pub struct SweepHandle {
    cancel: Option<oneshot::Sender<()>>,
}

impl SweepHandle {
    pub fn cancel(mut self) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
    }
}

/// Concurrent `key -> (value, expiry)` map. Disabled reads/writes are no-ops;
/// a disabled cache's `value` always misses without touching the stats
/// counters.
pub struct Cache<V> {
    entries: RwLock<HashMap<String, Entry<V>>>,
    enabled: AtomicBool,
    success: AtomicU64,
    failed: AtomicU64,
}

impl<V> Default for Cache<V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            enabled: AtomicBool::new(true),
            success: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> Cache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Ignores empty keys.
    pub async fn set_value(&self, key: &str, value: V, ttl: Duration) {
        if key.is_empty() || !self.is_enabled() {
            return;
        }
        let key = key.to_lowercase();
        let mut entries = self.entries.write().await;
        entries.insert(
            key,
            Entry {
                value,
                expires: Instant::now() + ttl,
            },
        );
    }

    /// A hit increments `success`; a miss (absent or expired) increments
    /// `failed`. An expired entry is removed as a side effect of the miss.
    pub async fn value(&self, key: &str) -> Option<V> {
        if !self.is_enabled() {
            return None;
        }
        let key = key.to_lowercase();
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(&key) {
                Some(entry) if entry.expires > now => {
                    self.success.fetch_add(1, Ordering::SeqCst);
                    return Some(entry.value.clone());
                }
                None => {
                    self.failed.fetch_add(1, Ordering::SeqCst);
                    return None;
                }
                Some(_) => (), // expired, fall through to evict under the write lock
            }
        }
        let mut entries = self.entries.write().await;
        entries.remove(&key);
        self.failed.fetch_add(1, Ordering::SeqCst);
        None
    }

    pub async fn remove(&self, key: &str) {
        let key = key.to_lowercase();
        self.entries.write().await.remove(&key);
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// Scan and evict every expired entry.
    pub async fn check(&self) {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| entry.expires > now);
    }

    pub async fn stats(&self) -> CacheStats {
        let len = self.entries.read().await.len();
        CacheStats {
            success: self.success.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            len,
        }
    }
}

impl<V: Clone + Send + Sync + 'static> Cache<V> {
    /// Spawn a periodic sweeper and return a handle that cancels it. The
    /// sweeper wakes every `interval`, calls [`Cache::check`], and exits on
    /// its next wake after the handle is cancelled (a one-shot rendezvous,
    /// not an immediate interrupt).
    ///
    /// Takes `&Arc<Self>` as a plain argument, not a method receiver: `&Arc<Self>`
    /// is not among the self-types the compiler accepts directly (only `Self`,
    /// `&Self`, `&mut Self`, `Box/Rc/Arc<Self>`, and `Pin` of those are).
    pub fn check_every(cache: &std::sync::Arc<Self>, interval: Duration) -> SweepHandle {
        let (tx, mut rx) = oneshot::channel();
        let cache = std::sync::Arc::clone(cache);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        cache.check().await;
                    }
                    _ = &mut rx => {
                        break;
                    }
                }
            }
        });
        SweepHandle { cancel: Some(tx) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_ttl_hit_then_expiry_miss() {
        let cache: Cache<i32> = Cache::new();
        cache.set_value("k", 1, Duration::from_millis(5)).await;
        assert_eq!(cache.value("k").await, Some(1));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.value("k").await, None);
        let stats = cache.stats().await;
        assert_eq!(stats.len, 0);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.success, 1);
    }

    #[tokio::test]
    async fn test_disabled_is_noop() {
        let cache: Cache<i32> = Cache::new();
        cache.disable();
        cache.set_value("k", 1, Duration::from_secs(5)).await;
        assert_eq!(cache.value("k").await, None);
        assert_eq!(cache.stats().await, CacheStats::default());
    }

    #[tokio::test]
    async fn test_empty_key_ignored() {
        let cache: Cache<i32> = Cache::new();
        cache.set_value("", 1, Duration::from_secs(5)).await;
        assert_eq!(cache.stats().await.len, 0);
    }

    #[tokio::test]
    async fn test_check_every_sweeps_and_cancels() {
        let cache = Arc::new(Cache::<i32>::new());
        cache.set_value("k", 1, Duration::from_millis(5)).await;
        let handle = Cache::check_every(&cache, Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.stats().await.len, 0);
        handle.cancel();
    }
}
