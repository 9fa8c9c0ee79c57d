use serde::{Deserialize, Serialize};

/// Policy used by [`MemoryAdapter`](crate::MemoryAdapter) to pick a victim when it
/// reaches its entry limit.
///
/// # Variants
///
/// * `FIFO` - **First In, First Out**
///   - The oldest inserted entry is removed first
///   - Reads do NOT change an entry's position
///
/// * `LRU` - **Least Recently Used** (default)
///   - The least recently read or written entry is removed first
///   - Every hit moves the entry to the "most recent" position
///
/// * `LFU` - **Least Frequently Used**
///   - The entry with the fewest hits is removed first
///   - Ties go to the oldest entry
///
/// * `Random` - **Random Replacement**
///   - A uniformly random entry is removed
///
/// # Performance Characteristics
///
/// | Policy | Eviction | Cache Hit |
/// |--------|----------|-----------|
/// | FIFO   | O(1)     | O(1)      |
/// | LRU    | O(1)     | O(n)      |
/// | LFU    | O(n)     | O(1)      |
/// | Random | O(n)     | O(1)      |
///
/// # Examples
///
/// ```
/// use cachemux_core::EvictionPolicy;
///
/// assert_eq!(EvictionPolicy::default(), EvictionPolicy::LRU);
///
/// let policy: EvictionPolicy = "lfu".into();
/// assert_eq!(policy, EvictionPolicy::LFU);
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    FIFO,
    #[default]
    LRU,
    LFU,
    Random,
}

impl EvictionPolicy {
    /// True when a hit reorders the eviction queue.
    pub const fn reorders_on_hit(self) -> bool {
        matches!(self, EvictionPolicy::LRU)
    }

    /// True when hits are counted for eviction.
    pub const fn tracks_frequency(self) -> bool {
        matches!(self, EvictionPolicy::LFU)
    }
}

/// Case-insensitive; unknown values fall back to LRU.
impl From<&str> for EvictionPolicy {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "fifo" => EvictionPolicy::FIFO,
            "lfu" => EvictionPolicy::LFU,
            "random" => EvictionPolicy::Random,
            _ => EvictionPolicy::LRU,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_str() {
        assert_eq!(EvictionPolicy::from("FIFO"), EvictionPolicy::FIFO);
        assert_eq!(EvictionPolicy::from("Random"), EvictionPolicy::Random);
        assert_eq!(EvictionPolicy::from("unknown"), EvictionPolicy::LRU);
    }

    #[test]
    fn test_serde_lowercase() {
        assert_eq!(serde_json::to_string(&EvictionPolicy::LFU).unwrap(), "\"lfu\"");
        let policy: EvictionPolicy = serde_json::from_str("\"random\"").unwrap();
        assert_eq!(policy, EvictionPolicy::Random);
    }

    #[test]
    fn test_policy_traits() {
        assert!(EvictionPolicy::LRU.reorders_on_hit());
        assert!(!EvictionPolicy::FIFO.reorders_on_hit());
        assert!(EvictionPolicy::LFU.tracks_frequency());
    }
}
