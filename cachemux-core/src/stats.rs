use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free operation counters, kept once for the façade and once per provider.
///
/// Counters use `Relaxed` ordering and are read individually, so a snapshot taken
/// during concurrent updates may be off by the in-flight operations.
///
/// # Examples
///
/// ```
/// use cachemux_core::CacheStats;
///
/// let stats = CacheStats::new();
/// stats.record_hit();
/// stats.record_hit();
/// stats.record_miss();
///
/// let snap = stats.snapshot();
/// assert_eq!(snap.lookups(), 3);
/// assert!((snap.hit_rate - 0.6666).abs() < 0.001);
/// ```
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn read(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// A lookup that returned a live value.
    #[inline]
    pub fn record_hit(&self) {
        bump(&self.hits);
    }

    /// A lookup that found nothing, or only an expired entry.
    #[inline]
    pub fn record_miss(&self) {
        bump(&self.misses);
    }

    #[inline]
    pub fn record_set(&self) {
        bump(&self.sets);
    }

    #[inline]
    pub fn record_delete(&self) {
        bump(&self.deletes);
    }

    #[inline]
    pub fn record_error(&self) {
        bump(&self.errors);
    }

    pub fn hits(&self) -> u64 {
        read(&self.hits)
    }

    pub fn misses(&self) -> u64 {
        read(&self.misses)
    }

    pub fn sets(&self) -> u64 {
        read(&self.sets)
    }

    pub fn deletes(&self) -> u64 {
        read(&self.deletes)
    }

    pub fn errors(&self) -> u64 {
        read(&self.errors)
    }

    /// Hits plus misses.
    pub fn total_accesses(&self) -> u64 {
        self.snapshot().lookups()
    }

    /// Fraction of lookups that hit, `0.0` before the first lookup.
    pub fn hit_rate(&self) -> f64 {
        self.snapshot().hit_rate
    }

    /// Fraction of lookups that missed, `1.0` before the first lookup.
    pub fn miss_rate(&self) -> f64 {
        1.0 - self.hit_rate()
    }

    pub fn reset(&self) {
        for counter in [&self.hits, &self.misses, &self.sets, &self.deletes, &self.errors] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot::from_counts(
            self.hits(),
            self.misses(),
            self.sets(),
            self.deletes(),
            self.errors(),
        )
    }
}

impl Clone for CacheStats {
    fn clone(&self) -> Self {
        let snap = self.snapshot();
        Self {
            hits: AtomicU64::new(snap.hits),
            misses: AtomicU64::new(snap.misses),
            sets: AtomicU64::new(snap.sets),
            deletes: AtomicU64::new(snap.deletes),
            errors: AtomicU64::new(snap.errors),
        }
    }
}

/// Serializable view of [`CacheStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
    pub hit_rate: f64,
}

impl StatsSnapshot {
    fn from_counts(hits: u64, misses: u64, sets: u64, deletes: u64, errors: u64) -> Self {
        let lookups = hits + misses;
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            hits as f64 / lookups as f64
        };
        Self {
            hits,
            misses,
            sets,
            deletes,
            errors,
            hit_rate,
        }
    }

    pub fn lookups(&self) -> u64 {
        self.hits + self.misses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_empty_stats_have_zero_hit_rate() {
        let stats = CacheStats::new();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
        assert_eq!(stats.hit_rate(), 0.0);
        assert_eq!(stats.miss_rate(), 1.0);
    }

    #[test]
    fn test_rates_follow_lookups_only() {
        let stats = CacheStats::new();
        stats.record_hit();
        stats.record_miss();
        stats.record_miss();
        stats.record_miss();
        stats.record_set();
        stats.record_error();

        assert_eq!(stats.total_accesses(), 4);
        assert_eq!(stats.hit_rate(), 0.25);
        assert_eq!(stats.miss_rate(), 0.75);
    }

    #[test]
    fn test_write_counters_and_reset() {
        let stats = CacheStats::new();
        stats.record_set();
        stats.record_set();
        stats.record_delete();
        stats.record_error();

        let snap = stats.snapshot();
        assert_eq!((snap.sets, snap.deletes, snap.errors), (2, 1, 1));

        stats.reset();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn test_clone_is_independent() {
        let stats = CacheStats::new();
        stats.record_miss();

        let cloned = stats.clone();
        stats.record_miss();
        assert_eq!(stats.misses(), 2);
        assert_eq!(cloned.misses(), 1);
    }

    #[test]
    fn test_snapshot_serializes_flat() {
        let stats = CacheStats::new();
        stats.record_hit();
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["hits"], 1);
        assert_eq!(json["hit_rate"], 1.0);
    }

    #[test]
    fn test_counters_under_contention() {
        let stats = Arc::new(CacheStats::new());

        std::thread::scope(|scope| {
            for worker in 0..8 {
                let stats = Arc::clone(&stats);
                scope.spawn(move || {
                    for i in 0..200 {
                        if (i + worker) % 4 == 0 {
                            stats.record_miss();
                        } else {
                            stats.record_hit();
                        }
                    }
                });
            }
        });

        assert_eq!(stats.total_accesses(), 1600);
        assert_eq!(stats.misses(), 400);
        assert_eq!(stats.hits(), 1200);
    }
}
