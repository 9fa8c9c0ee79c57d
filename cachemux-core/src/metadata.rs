//! # Metadata Index
//!
//! In-memory side table keyed by cache key. It tracks tags, timestamps, access
//! counts and expiry for every entry written through the cache, and answers the
//! queries invalidation and staleness checks need:
//!
//! - **Tag lookup**: a reverse index maps each tag to the keys carrying it
//! - **Prefix lookup**: keys starting with a given prefix
//! - **Expiry scan**: keys whose `expires_at` has passed
//!
//! The index never evicts anything from storage itself; callers act on the keys it
//! returns.
//!
//! # Examples
//!
//! ```rust
//! use cachemux_core::metadata::{MetadataIndex, MetadataUpdate};
//! use std::time::Duration;
//!
//! let index = MetadataIndex::new();
//! index.set(
//!     "user:1",
//!     MetadataUpdate::new()
//!         .with_tags(["users", "profiles"])
//!         .with_ttl(Duration::from_secs(60)),
//! );
//!
//! assert_eq!(index.find_by_tag("users"), vec!["user:1".to_string()]);
//! assert!(index.get("user:1").unwrap().expires_at.is_some());
//! ```

use crate::utils::now_millis;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

/// Bookkeeping for one cache key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub key: String,
    pub tags: BTreeSet<String>,
    /// Unix milliseconds of the first write.
    pub created_at: u64,
    /// Unix milliseconds of the last read or write.
    pub last_accessed: u64,
    pub access_count: u64,
    /// Stored size in bytes.
    pub size: Option<usize>,
    pub ttl: Option<Duration>,
    /// `created_at + ttl` when a positive ttl is set.
    pub expires_at: Option<u64>,
    /// Duration of the computation that produced the value.
    pub compute_time: Option<Duration>,
    /// Unix milliseconds of the last (re)computation.
    pub refreshed_at: Option<u64>,
}

impl EntryMetadata {
    /// True when an expiry is set and has passed at `now` (Unix milliseconds).
    pub fn is_expired_at(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Changes applied by [`MetadataIndex::set`].
///
/// Unset fields keep their previous value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataUpdate {
    pub tags: Vec<String>,
    /// Replace the tag set instead of unioning with it.
    pub replace_tags: bool,
    pub size: Option<usize>,
    pub ttl: Option<Duration>,
}

impl MetadataUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn replacing_tags(mut self) -> Self {
        self.replace_tags = true;
        self
    }

    #[must_use]
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

#[derive(Debug, Default)]
struct IndexState {
    entries: HashMap<String, EntryMetadata>,
    /// Map from tag to set of keys
    tag_to_keys: HashMap<String, HashSet<String>>,
}

impl IndexState {
    fn unlink_tags(&mut self, key: &str, tags: &BTreeSet<String>) {
        for tag in tags {
            if let Some(keys) = self.tag_to_keys.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tag_to_keys.remove(tag);
                }
            }
        }
    }
}

/// Thread-safe metadata side table.
///
/// Entries and the reverse tag index live behind one lock so they can never
/// disagree.
#[derive(Debug, Default)]
pub struct MetadataIndex {
    state: RwLock<IndexState>,
}

impl MetadataIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or merges metadata for `key`.
    ///
    /// - Tags are unioned with existing ones unless `replace_tags` is set
    /// - `created_at` is preserved across updates
    /// - `last_accessed` is reset to now
    /// - `expires_at` is recomputed from the (possibly new) ttl
    ///
    /// # Returns
    ///
    /// The metadata as stored after the merge.
    pub fn set(&self, key: &str, update: MetadataUpdate) -> EntryMetadata {
        let now = now_millis();
        let mut state = self.state.write();

        let previous_tags = state
            .entries
            .get(key)
            .map(|m| m.tags.clone())
            .unwrap_or_default();

        let merged = {
            let entry = state
                .entries
                .entry(key.to_string())
                .or_insert_with(|| EntryMetadata {
                    key: key.to_string(),
                    tags: BTreeSet::new(),
                    created_at: now,
                    last_accessed: now,
                    access_count: 0,
                    size: None,
                    ttl: None,
                    expires_at: None,
                    compute_time: None,
                    refreshed_at: None,
                });

            if update.replace_tags {
                entry.tags.clear();
            }
            entry.tags.extend(update.tags);
            entry.last_accessed = now;
            if update.size.is_some() {
                entry.size = update.size;
            }
            if update.ttl.is_some() {
                entry.ttl = update.ttl;
            }
            entry.expires_at = match entry.ttl {
                Some(ttl) if !ttl.is_zero() => {
                    Some(entry.created_at.saturating_add(ttl.as_millis() as u64))
                }
                _ => None,
            };
            entry.clone()
        };

        let removed: BTreeSet<String> = previous_tags.difference(&merged.tags).cloned().collect();
        state.unlink_tags(key, &removed);
        for tag in &merged.tags {
            state
                .tag_to_keys
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }

        merged
    }

    /// Records compute bookkeeping for an existing entry.
    ///
    /// No-op when the key has no metadata.
    pub fn set_compute_info(&self, key: &str, compute_time: Duration, refreshed_at: u64) {
        if let Some(entry) = self.state.write().entries.get_mut(key) {
            entry.compute_time = Some(compute_time);
            entry.refreshed_at = Some(refreshed_at);
        }
    }

    pub fn get(&self, key: &str) -> Option<EntryMetadata> {
        self.state.read().entries.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.read().entries.contains_key(key)
    }

    /// Removes metadata for `key`.
    ///
    /// # Returns
    ///
    /// `true` if metadata existed
    pub fn delete(&self, key: &str) -> bool {
        let mut state = self.state.write();
        match state.entries.remove(key) {
            Some(meta) => {
                state.unlink_tags(key, &meta.tags);
                true
            }
            None => false,
        }
    }

    /// Bumps `access_count` and `last_accessed`.
    ///
    /// Never creates metadata: a read of an unknown key is a no-op.
    pub fn record_access(&self, key: &str) {
        if let Some(entry) = self.state.write().entries.get_mut(key) {
            entry.access_count = entry.access_count.saturating_add(1);
            entry.last_accessed = now_millis();
        }
    }

    /// Keys carrying `tag`, sorted.
    pub fn find_by_tag(&self, tag: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .state
            .read()
            .tag_to_keys
            .get(tag)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Keys starting with `prefix`, sorted.
    pub fn find_by_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .state
            .read()
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Keys whose expiry has passed, sorted.
    ///
    /// Linear scan over all entries.
    pub fn find_expired(&self) -> Vec<String> {
        let now = now_millis();
        let mut keys: Vec<String> = self
            .state
            .read()
            .entries
            .values()
            .filter(|m| m.is_expired_at(now))
            .map(|m| m.key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// All tags currently in use, sorted.
    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.state.read().tag_to_keys.keys().cloned().collect();
        tags.sort();
        tags
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state.read().entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().entries.is_empty()
    }

    /// Drops all metadata and tags.
    pub fn clear(&self) {
        let mut state = self.state.write();
        state.entries.clear();
        state.tag_to_keys.clear();
    }
}
