use crate::error::{CacheError, Result};
use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

/// Default maximum key length in bytes.
pub const DEFAULT_MAX_KEY_LENGTH: usize = 250;

/// Current wall-clock time in Unix milliseconds.
///
/// A clock set before the epoch yields `0` rather than panicking.
#[inline]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Checks a cache key before any storage I/O.
///
/// # Arguments
///
/// * `key` - The key to validate
/// * `max_len` - Maximum allowed length in bytes
///
/// # Errors
///
/// * [`CacheError::InvalidKey`] if the key is empty or whitespace only
/// * [`CacheError::KeyTooLong`] if the key exceeds `max_len`
///
/// # Examples
///
/// ```
/// use cachemux_core::utils::validate_key;
///
/// assert!(validate_key("user:1", 250).is_ok());
/// assert!(validate_key("   ", 250).is_err());
/// assert!(validate_key(&"x".repeat(300), 250).is_err());
/// ```
pub fn validate_key(key: &str, max_len: usize) -> Result<()> {
    if key.trim().is_empty() {
        return Err(CacheError::InvalidKey(
            "key must not be empty or whitespace".to_string(),
        ));
    }
    if key.len() > max_len {
        return Err(CacheError::KeyTooLong {
            len: key.len(),
            max: max_len,
        });
    }
    Ok(())
}

/// Matches `key` against a glob `pattern`.
///
/// `*` matches any run of characters (including none) and `?` matches exactly one.
/// Everything else matches literally.
///
/// # Examples
///
/// ```
/// use cachemux_core::utils::glob_match;
///
/// assert!(glob_match("user:*", "user:42"));
/// assert!(glob_match("user:?", "user:7"));
/// assert!(!glob_match("user:?", "user:42"));
/// assert!(glob_match("*", ""));
/// ```
pub fn glob_match(pattern: &str, key: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let k: Vec<char> = key.chars().collect();

    let (mut pi, mut ki) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut star_ki = 0usize;

    while ki < k.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == k[ki]) {
            pi += 1;
            ki += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            star_ki = ki;
            pi += 1;
        } else if let Some(s) = star {
            // Backtrack: let the last star absorb one more character
            pi = s + 1;
            star_ki += 1;
            ki = star_ki;
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Moves a key to the end of the order queue (marks as most recently used).
///
/// If the key is not in the queue, the queue is left unchanged.
///
/// # Examples
///
/// ```
/// use std::collections::VecDeque;
/// use cachemux_core::utils::move_key_to_end;
///
/// let mut order = VecDeque::from(vec!["key1".to_string(), "key2".to_string(), "key3".to_string()]);
/// move_key_to_end(&mut order, "key2");
/// assert_eq!(order.back().unwrap(), "key2");
/// ```
pub fn move_key_to_end(order: &mut VecDeque<String>, key: &str) {
    if let Some(pos) = order.iter().position(|k| k == key) {
        order.remove(pos);
        order.push_back(key.to_string());
    }
}

/// Removes a key from the order queue, if present.
pub fn remove_key_from_order(order: &mut VecDeque<String>, key: &str) {
    if let Some(pos) = order.iter().position(|k| k == key) {
        order.remove(pos);
    }
}

/// Serde helpers storing a `Duration` as integer milliseconds.
///
/// Used with `#[serde(with = "...")]` on config fields named `*_ms`.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Like [`duration_ms`] for `Option<Duration>`.
pub mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}
