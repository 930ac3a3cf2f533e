//! Concurrent keyed store with optional per-entry expiry.
//!
//! A [`Set`] maps a case-folded key to a single item. Entries may carry an
//! expiry deadline; expiry is evaluated when an entry is read, never by a
//! background sweep. Any read path that finds a dead entry removes it, but
//! only after re-checking under the write lock that it is still dead, so a
//! concurrent write of the same key is never lost.
//!
//! The set backs room membership as well as every ban, whitelist, and
//! operator list in [`crate::auth`].

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;

/// Errors returned by [`Set`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SetError {
    /// A live entry already exists under the key.
    #[error("item already exists")]
    Collision,

    /// No live entry exists under the key.
    #[error("item does not exist")]
    Missing,
}

/// A value that can be stored in a [`Set`].
///
/// The key is read once, when the item is inserted; later changes to
/// whatever the key was derived from do not move the entry.
pub trait Item: Clone + Send + Sync {
    /// The item's key before normalisation.
    fn key(&self) -> &str;
}

impl Item for String {
    fn key(&self) -> &str {
        self
    }
}

/// Case-folds a key the way every [`Set`] compares keys.
#[must_use]
pub fn normalize(key: &str) -> String {
    key.to_lowercase()
}

struct Entry<T> {
    item: T,
    expires_at: Option<Instant>,
}

impl<T> Entry<T> {
    fn new(item: T, ttl: Option<Duration>) -> Self {
        Self {
            item,
            expires_at: ttl.map(|d| Instant::now() + d),
        }
    }

    fn is_alive(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// Concurrent mapping from normalised key to item.
///
/// Guarded by a single [`RwLock`]: lookups and listings share the lock,
/// inserts and removals take it exclusively.
pub struct Set<T> {
    entries: RwLock<HashMap<String, Entry<T>>>,
}

impl<T: Item> Default for Set<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Item> Set<T> {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .values()
            .filter(|entry| entry.is_alive(now))
            .count()
    }

    /// Whether the set holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every entry, returning how many were removed.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.write();
        let count = entries.len();
        entries.clear();
        count
    }

    /// Whether a live entry exists under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.lookup(&normalize(key)).is_some()
    }

    /// Returns a clone of the live item stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`SetError::Missing`] if the key is absent or has expired.
    pub fn get(&self, key: &str) -> Result<T, SetError> {
        self.lookup(&normalize(key)).ok_or(SetError::Missing)
    }

    /// Inserts a permanent item.
    ///
    /// An expired entry under the same key is overwritten.
    ///
    /// # Errors
    ///
    /// Returns [`SetError::Collision`] if a live entry uses the same key.
    pub fn add(&self, item: T) -> Result<(), SetError> {
        self.insert_new(item, None)
    }

    /// Inserts an item that stops being live after `ttl`.
    ///
    /// # Errors
    ///
    /// Returns [`SetError::Collision`] if a live entry uses the same key.
    pub fn add_expiring(&self, item: T, ttl: Duration) -> Result<(), SetError> {
        self.insert_new(item, Some(ttl))
    }

    /// Inserts or replaces a permanent item.
    pub fn set(&self, item: T) {
        self.upsert(item, None);
    }

    /// Inserts or replaces an item that stops being live after `ttl`.
    pub fn set_expiring(&self, item: T, ttl: Duration) {
        self.upsert(item, Some(ttl));
    }

    /// Removes and returns the item stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`SetError::Missing`] if the key is absent or had already
    /// expired.
    pub fn remove(&self, key: &str) -> Result<T, SetError> {
        let now = Instant::now();
        let mut entries = self.entries.write();
        match entries.remove(&normalize(key)) {
            Some(entry) if entry.is_alive(now) => Ok(entry.item),
            _ => Err(SetError::Missing),
        }
    }

    /// Atomically moves the entry under `old_key` to `item`'s key.
    ///
    /// Replacing an entry with an item whose key normalises to the same
    /// value is always allowed and just swaps the stored item. The expiry
    /// of the old entry carries over.
    ///
    /// # Errors
    ///
    /// Returns [`SetError::Missing`] if `old_key` has no live entry, or
    /// [`SetError::Collision`] if a different live entry already uses the
    /// new key.
    pub fn replace(&self, old_key: &str, item: T) -> Result<(), SetError> {
        let now = Instant::now();
        let old_key = normalize(old_key);
        let new_key = normalize(item.key());

        let mut entries = self.entries.write();
        let expires_at = match entries.get(&old_key) {
            Some(entry) if entry.is_alive(now) => entry.expires_at,
            Some(_) => {
                entries.remove(&old_key);
                return Err(SetError::Missing);
            }
            None => return Err(SetError::Missing),
        };

        if new_key != old_key
            && entries
                .get(&new_key)
                .is_some_and(|entry| entry.is_alive(now))
        {
            return Err(SetError::Collision);
        }

        entries.remove(&old_key);
        entries.insert(new_key, Entry { item, expires_at });
        Ok(())
    }

    /// Calls `f` for every live entry while holding the read lock.
    ///
    /// `f` must not mutate this set. Iteration stops at the first error,
    /// which is returned. Dead entries seen along the way are removed after
    /// the read lock is released.
    ///
    /// # Errors
    ///
    /// Returns the first error produced by `f`.
    pub fn each<E>(&self, mut f: impl FnMut(&T) -> Result<(), E>) -> Result<(), E> {
        let now = Instant::now();
        let mut expired = Vec::new();
        let result = {
            let entries = self.entries.read();
            entries.iter().try_for_each(|(key, entry)| {
                if entry.is_alive(now) {
                    f(&entry.item)
                } else {
                    expired.push(key.clone());
                    Ok(())
                }
            })
        };
        for key in expired {
            self.reap(&key);
        }
        result
    }

    /// Returns every live item whose key starts with `prefix`,
    /// case-insensitively, ordered by key.
    pub fn list_prefix(&self, prefix: &str) -> Vec<T> {
        let prefix = normalize(prefix);
        let now = Instant::now();
        let mut matches: Vec<(String, T)> = {
            let entries = self.entries.read();
            entries
                .iter()
                .filter(|(key, entry)| key.starts_with(&prefix) && entry.is_alive(now))
                .map(|(key, entry)| (key.clone(), entry.item.clone()))
                .collect()
        };
        matches.sort_by(|a, b| a.0.cmp(&b.0));
        matches.into_iter().map(|(_, item)| item).collect()
    }

    /// Snapshot of every live item, ordered by key.
    pub fn items(&self) -> Vec<T> {
        self.list_prefix("")
    }

    fn lookup(&self, key: &str) -> Option<T> {
        let now = Instant::now();
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if entry.is_alive(now) => return Some(entry.item.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        self.reap(key);
        None
    }

    /// Removes `key` only if it is still dead under the write lock.
    fn reap(&self, key: &str) {
        let now = Instant::now();
        let mut entries = self.entries.write();
        if entries.get(key).is_some_and(|entry| !entry.is_alive(now)) {
            entries.remove(key);
        }
    }

    fn insert_new(&self, item: T, ttl: Option<Duration>) -> Result<(), SetError> {
        let now = Instant::now();
        let key = normalize(item.key());
        let mut entries = self.entries.write();
        if entries.get(&key).is_some_and(|entry| entry.is_alive(now)) {
            return Err(SetError::Collision);
        }
        entries.insert(key, Entry::new(item, ttl));
        Ok(())
    }

    fn upsert(&self, item: T, ttl: Option<Duration>) {
        let key = normalize(item.key());
        self.entries.write().insert(key, Entry::new(item, ttl));
    }
}
