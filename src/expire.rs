//! Key/value map with per-entry expiry, checked lazily.
//!
//! Expiry is only discovered on access or [`refresh`](TimeoutMap::refresh),
//! never by a timer of its own. Request/response correlation and blacklists
//! need thousands of short-lived entries; giving each a wheel entry would
//! dwarf the wheel's real work, and the callers already touch these maps on
//! every message anyway.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

type ExpireCallback<K, V> = Box<dyn FnOnce(&K, V)>;

struct Entry<K, V> {
    value: V,
    expires_at: Instant,
    on_expire: Option<ExpireCallback<K, V>>,
}

/// A map whose entries disappear after a TTL.
///
/// An entry's expiry callback runs exactly once, at the access (or refresh)
/// that discovers the entry expired. As in any lazily-expiring store,
/// [`len`](Self::len) counts entries whose expiry has not been discovered
/// yet; call `refresh` first for an exact figure.
pub struct TimeoutMap<K, V> {
    entries: HashMap<K, Entry<K, V>>,
}

impl<K: Eq + Hash + Clone, V> TimeoutMap<K, V> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inserts without an expiry callback. A previous entry under the same
    /// key is displaced as by [`take`](Self::take): expired → its callback
    /// fires, live → silently dropped.
    pub fn put(&mut self, now: Instant, key: K, value: V, ttl: Duration) {
        self.put_entry(now, key, value, ttl, None);
    }

    /// Inserts with a callback to run when the entry is discovered expired.
    pub fn put_with(
        &mut self,
        now: Instant,
        key: K,
        value: V,
        ttl: Duration,
        on_expire: impl FnOnce(&K, V) + 'static,
    ) {
        self.put_entry(now, key, value, ttl, Some(Box::new(on_expire)));
    }

    fn put_entry(
        &mut self,
        now: Instant,
        key: K,
        value: V,
        ttl: Duration,
        on_expire: Option<ExpireCallback<K, V>>,
    ) {
        self.take(now, &key);
        self.entries.insert(
            key,
            Entry {
                value,
                expires_at: now + ttl,
                on_expire,
            },
        );
    }

    /// Returns the live value for `key`, or `None`. An expired entry is
    /// evicted (firing its callback) before `None` is returned.
    pub fn get(&mut self, now: Instant, key: &K) -> Option<&V> {
        if self.entries.get(key).is_some_and(|e| e.expires_at < now) {
            self.expire(key);
            return None;
        }
        self.entries.get(key).map(|e| &e.value)
    }

    pub fn contains(&mut self, now: Instant, key: &K) -> bool {
        self.get(now, key).is_some()
    }

    /// Removes and returns the live value for `key`. Removing an entry that
    /// turns out to be expired fires its callback and returns `None`.
    pub fn take(&mut self, now: Instant, key: &K) -> Option<V> {
        let entry = self.entries.remove(key)?;
        if entry.expires_at < now {
            if let Some(callback) = entry.on_expire {
                callback(key, entry.value);
            }
            return None;
        }
        Some(entry.value)
    }

    /// Evicts every expired entry, firing callbacks. Callers run this on a
    /// fixed interval so abandoned entries do not accumulate.
    pub fn refresh(&mut self, now: Instant) {
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at < now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.expire(&key);
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }

    fn expire(&mut self, key: &K) {
        if let Some(entry) = self.entries.remove(key) {
            if let Some(callback) = entry.on_expire {
                callback(key, entry.value);
            }
        }
    }
}

impl<K: Eq + Hash + Clone, V> Default for TimeoutMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    const TTL: Duration = Duration::from_secs(3);

    #[test]
    fn get_returns_live_values_and_evicts_expired() {
        let now = Instant::now();
        let mut map = TimeoutMap::new();
        map.put(now, "a", 1, TTL);

        assert_eq!(map.get(now + Duration::from_secs(2), &"a"), Some(&1));
        assert_eq!(map.get(now + Duration::from_secs(4), &"a"), None);
        assert!(map.is_empty());
    }

    #[test]
    fn expiry_callback_fires_exactly_once() {
        let now = Instant::now();
        let fired = Rc::new(Cell::new(0));
        let mut map = TimeoutMap::new();
        let counter = fired.clone();
        map.put_with(now, "a", 1, TTL, move |_, _| counter.set(counter.get() + 1));

        let late = now + TTL + Duration::from_millis(1);
        assert_eq!(map.get(late, &"a"), None);
        assert_eq!(fired.get(), 1);

        // Entry already gone; nothing more to fire.
        assert_eq!(map.get(late, &"a"), None);
        map.refresh(late);
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn take_returns_live_value_without_firing_callback() {
        let now = Instant::now();
        let fired = Rc::new(Cell::new(false));
        let mut map = TimeoutMap::new();
        let flag = fired.clone();
        map.put_with(now, "a", 7, TTL, move |_, _| flag.set(true));

        assert_eq!(map.take(now + Duration::from_secs(1), &"a"), Some(7));
        assert!(!fired.get());
        assert_eq!(map.take(now + Duration::from_secs(1), &"a"), None);
    }

    #[test]
    fn take_of_expired_entry_fires_callback_and_returns_none() {
        let now = Instant::now();
        let fired = Rc::new(Cell::new(false));
        let mut map = TimeoutMap::new();
        let flag = fired.clone();
        map.put_with(now, "a", 7, TTL, move |_, _| flag.set(true));

        assert_eq!(map.take(now + TTL + Duration::from_millis(1), &"a"), None);
        assert!(fired.get());
    }

    #[test]
    fn refresh_evicts_all_and_only_expired_entries() {
        let now = Instant::now();
        let fired = Rc::new(Cell::new(0));
        let mut map = TimeoutMap::new();
        for i in 0..4 {
            let counter = fired.clone();
            let ttl = TTL + Duration::from_secs(i);
            map.put_with(now, i, i, ttl, move |_, _| counter.set(counter.get() + 1));
        }

        // Entries with ttl 3s and 4s are past due; 5s and 6s live on.
        map.refresh(now + Duration::from_millis(4500));
        assert_eq!(map.len(), 2);
        assert_eq!(fired.get(), 2);
        assert!(map.contains(now + Duration::from_millis(4500), &2));
        assert!(map.contains(now + Duration::from_millis(4500), &3));
    }

    #[test]
    fn reinsert_displaces_live_entry_silently() {
        let now = Instant::now();
        let fired = Rc::new(Cell::new(false));
        let mut map = TimeoutMap::new();
        let flag = fired.clone();
        map.put_with(now, "a", 1, TTL, move |_, _| flag.set(true));
        map.put(now + Duration::from_secs(1), "a", 2, TTL);

        assert!(!fired.get());
        assert_eq!(map.get(now + Duration::from_secs(2), &"a"), Some(&2));
    }
}
