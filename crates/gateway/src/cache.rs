// Access control cache: (user, device) -> authorized?
//
// Two independent policies share one map. Expiry is absolute from the write
// and is never extended by reads. Eviction under size pressure ranks entries
// by last read time. Keep them separate.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::debug;

pub const DEFAULT_MAX_SIZE: usize = 10_000;
pub const DEFAULT_TTL_SECS: i64 = 300;

/// Share of entries dropped when a write finds the cache full.
const WRITE_EVICTION_DIVISOR: usize = 5;
/// Share of entries dropped when a sweep still finds the cache nearly full.
const SWEEP_EVICTION_DIVISOR: usize = 10;
/// Sweep eviction kicks in at this occupancy, in percent of max size.
const SWEEP_HIGH_WATER_PERCENT: usize = 90;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccessKey {
    pub user_id: String,
    pub device_id: String,
}

impl AccessKey {
    pub fn new(user_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), device_id: device_id.into() }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    authorized: bool,
    expires_at: DateTime<Utc>,
    access_count: u64,
    last_accessed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessCacheConfig {
    pub max_size: usize,
    pub ttl: Duration,
}

impl Default for AccessCacheConfig {
    fn default() -> Self {
        Self { max_size: DEFAULT_MAX_SIZE, ttl: Duration::seconds(DEFAULT_TTL_SECS) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub evicted: usize,
}

#[derive(Debug)]
pub struct AccessCache {
    config: AccessCacheConfig,
    entries: Mutex<HashMap<AccessKey, CacheEntry>>,
    misses: AtomicU64,
}

impl Default for AccessCache {
    fn default() -> Self {
        Self::new(AccessCacheConfig::default())
    }
}

impl AccessCache {
    pub fn new(config: AccessCacheConfig) -> Self {
        let config = AccessCacheConfig { max_size: config.max_size.max(1), ..config };
        Self { config, entries: Mutex::new(HashMap::new()), misses: AtomicU64::new(0) }
    }

    pub fn config(&self) -> AccessCacheConfig {
        self.config
    }

    pub fn get(&self, key: &AccessKey) -> Option<bool> {
        self.get_at(key, Utc::now())
    }

    /// Cached decision for `key`, or `None` on a miss.
    ///
    /// An entry past its expiry is removed here even if it was read a moment
    /// ago.
    pub fn get_at(&self, key: &AccessKey, now: DateTime<Utc>) -> Option<bool> {
        let mut entries = self.lock();
        let expired = match entries.get_mut(key) {
            Some(entry) if now > entry.expires_at => true,
            Some(entry) => {
                entry.access_count += 1;
                entry.last_accessed_at = now;
                return Some(entry.authorized);
            }
            None => false,
        };

        if expired {
            entries.remove(key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn set(&self, key: AccessKey, authorized: bool) {
        self.set_at(key, authorized, Utc::now());
    }

    pub fn set_at(&self, key: AccessKey, authorized: bool, now: DateTime<Utc>) {
        let mut entries = self.lock();
        if !entries.contains_key(&key) && entries.len() >= self.config.max_size {
            let count = (entries.len() / WRITE_EVICTION_DIVISOR).max(1);
            let evicted = evict_least_recently_accessed(&mut entries, count);
            debug!(evicted, max_size = self.config.max_size, "access cache full, evicted entries");
        }

        let expires_at =
            now.checked_add_signed(self.config.ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
        entries.insert(
            key,
            CacheEntry { authorized, expires_at, access_count: 0, last_accessed_at: now },
        );
    }

    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now())
    }

    /// Drop expired entries, then trim the least recently read entries if
    /// occupancy is still at the high-water mark.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| now <= entry.expires_at);
        let expired = before - entries.len();

        let mut evicted = 0;
        if above_high_water(entries.len(), self.config.max_size) {
            let count = (entries.len() / SWEEP_EVICTION_DIVISOR).max(1);
            evicted = evict_least_recently_accessed(&mut entries, count);
        }

        SweepReport { expired, evicted }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.lock();
        CacheStats {
            size: entries.len(),
            hits: entries.values().map(|entry| entry.access_count).sum(),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<AccessKey, CacheEntry>> {
        // Entries are plain data; a panic mid-update cannot leave them torn.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn above_high_water(len: usize, max_size: usize) -> bool {
    len as u128 * 100 >= max_size as u128 * SWEEP_HIGH_WATER_PERCENT as u128
}

fn evict_least_recently_accessed(
    entries: &mut HashMap<AccessKey, CacheEntry>,
    count: usize,
) -> usize {
    let mut ranked = entries
        .iter()
        .map(|(key, entry)| (entry.last_accessed_at, key.clone()))
        .collect::<Vec<_>>();
    ranked.sort_by_key(|(last_accessed_at, _)| *last_accessed_at);

    let mut evicted = 0;
    for (_, key) in ranked.into_iter().take(count) {
        if entries.remove(&key).is_some() {
            evicted += 1;
        }
    }
    evicted
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 7, 12, 0, 0).single().expect("valid timestamp")
    }

    fn cache(max_size: usize, ttl_secs: i64) -> AccessCache {
        AccessCache::new(AccessCacheConfig { max_size, ttl: Duration::seconds(ttl_secs) })
    }

    fn key(n: usize) -> AccessKey {
        AccessKey::new(format!("user-{n}"), format!("device-{n}"))
    }

    #[test]
    fn read_within_ttl_returns_latest_write() {
        let cache = cache(10, 60);
        let key = AccessKey::new("userA", "d1");
        cache.set_at(key.clone(), true, t0());
        cache.set_at(key.clone(), false, t0() + Duration::seconds(1));

        assert_eq!(cache.get_at(&key, t0() + Duration::seconds(30)), Some(false));
    }

    #[test]
    fn read_after_expiry_is_a_miss_and_drops_entry() {
        let cache = cache(10, 60);
        let key = AccessKey::new("userA", "d1");
        cache.set_at(key.clone(), true, t0());

        assert_eq!(cache.get_at(&key, t0() + Duration::seconds(61)), None);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn ttl_past_the_calendar_end_never_expires() {
        let cache = AccessCache::new(AccessCacheConfig { max_size: 10, ttl: Duration::MAX });
        let key = AccessKey::new("userA", "d1");
        cache.set_at(key.clone(), true, t0());

        assert_eq!(cache.get_at(&key, t0() + Duration::days(365 * 100)), Some(true));
    }

    #[test]
    fn sweep_with_huge_max_size_does_not_overflow() {
        let cache = cache(usize::MAX, 60);
        cache.set_at(key(1), true, t0());

        assert_eq!(cache.sweep_at(t0()), SweepReport { expired: 0, evicted: 0 });
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn reads_do_not_extend_expiry() {
        let cache = cache(10, 60);
        let key = AccessKey::new("userA", "d1");
        cache.set_at(key.clone(), true, t0());

        for second in [10, 20, 30, 40, 50, 60] {
            assert_eq!(cache.get_at(&key, t0() + Duration::seconds(second)), Some(true));
        }
        assert_eq!(cache.get_at(&key, t0() + Duration::seconds(61)), None);
    }

    #[test]
    fn full_cache_evicts_least_recently_read_fifth() {
        let cache = cache(10, 600);
        for n in 0..10 {
            cache.set_at(key(n), true, t0());
        }
        // Touch everything except 3 and 7 so they rank oldest.
        for n in (0..10).filter(|n| *n != 3 && *n != 7) {
            assert_eq!(cache.get_at(&key(n), t0() + Duration::seconds(5)), Some(true));
        }

        cache.set_at(key(10), true, t0() + Duration::seconds(6));

        assert_eq!(cache.len(), 9);
        assert_eq!(cache.get_at(&key(3), t0() + Duration::seconds(7)), None);
        assert_eq!(cache.get_at(&key(7), t0() + Duration::seconds(7)), None);
        assert_eq!(cache.get_at(&key(10), t0() + Duration::seconds(7)), Some(true));
    }

    #[test]
    fn overwriting_existing_key_does_not_evict() {
        let cache = cache(2, 600);
        cache.set_at(key(0), true, t0());
        cache.set_at(key(1), true, t0());
        cache.set_at(key(1), false, t0());

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get_at(&key(0), t0()), Some(true));
    }

    #[test]
    fn sweep_removes_expired_entries() {
        let cache = cache(100, 60);
        cache.set_at(key(0), true, t0());
        cache.set_at(key(1), true, t0() + Duration::seconds(30));

        let report = cache.sweep_at(t0() + Duration::seconds(61));

        assert_eq!(report, SweepReport { expired: 1, evicted: 0 });
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn sweep_trims_a_tenth_when_nearly_full() {
        let cache = cache(10, 600);
        for n in 0..9 {
            cache.set_at(key(n), true, t0() + Duration::seconds(n as i64));
        }

        let report = cache.sweep_at(t0() + Duration::seconds(20));

        assert_eq!(report, SweepReport { expired: 0, evicted: 1 });
        assert_eq!(cache.get_at(&key(0), t0() + Duration::seconds(21)), None);
        assert_eq!(cache.len(), 8);
    }

    #[test]
    fn stats_count_hits_from_entries_and_misses_globally() {
        let cache = cache(10, 60);
        let key = AccessKey::new("userA", "d1");
        assert_eq!(cache.get_at(&key, t0()), None);
        cache.set_at(key.clone(), true, t0());
        cache.get_at(&key, t0());
        cache.get_at(&key, t0());

        assert_eq!(cache.stats(), CacheStats { size: 1, hits: 2, misses: 1 });
    }
}

#[cfg(test)]
mod properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn occupancy_never_exceeds_max_size(
            max_size in 1usize..32,
            ops in proptest::collection::vec((0usize..64, any::<bool>(), 0i64..120), 1..200),
        ) {
            let cache =
                AccessCache::new(AccessCacheConfig { max_size, ttl: Duration::seconds(60) });
            let start = Utc::now();
            for (n, read, offset) in ops {
                let key = AccessKey::new(format!("user-{n}"), "device");
                let now = start + Duration::seconds(offset);
                if read {
                    cache.get_at(&key, now);
                } else {
                    cache.set_at(key, true, now);
                }
                prop_assert!(cache.len() <= max_size);
            }
        }
    }
}
