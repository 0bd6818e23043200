//! Durable record of active EWS subscriptions.
//!
//! Two kinds of cache entries are kept:
//!
//! - `ActiveSubscriptions`: ordered list of subscription ids believed live
//! - `ActiveSubscriptions#<id>`: point ids covered by one subscription

use crate::persistence::{CacheStore, CacheStoreExt, StoreError};
use std::collections::HashSet;

/// Cache key of the active subscription set.
pub const ACTIVE_SUBSCRIPTIONS_KEY: &str = "ActiveSubscriptions";

/// Cache key of a subscription's coverage list.
#[must_use]
pub fn coverage_key(subscription_id: &str) -> String {
    format!("{ACTIVE_SUBSCRIPTIONS_KEY}#{subscription_id}")
}

/// Ordered set of subscription ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveSet {
    ids: Vec<String>,
}

impl ActiveSet {
    /// Build from a list, dropping repeats.
    #[must_use]
    pub fn from_ids(ids: Vec<String>) -> Self {
        let mut set = Self::default();
        for id in ids {
            set.insert(id);
        }
        set
    }

    /// Copy of the ids, safe to iterate while the set is mutated.
    #[must_use]
    pub fn snapshot(&self) -> Vec<String> {
        self.ids.clone()
    }

    /// Append an id if not already present.
    pub fn insert(&mut self, id: String) {
        if !self.contains(&id) {
            self.ids.push(id);
        }
    }

    /// Remove an id, returning whether it was present.
    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.ids.len();
        self.ids.retain(|existing| existing != id);
        before != self.ids.len()
    }

    /// Swap `old` for `new`.
    pub fn replace(&mut self, old: &str, new: String) {
        self.remove(old);
        self.insert(new);
    }

    /// Whether an id is present.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.ids.iter().any(|existing| existing == id)
    }

    /// Number of ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Ids in insertion order.
    #[must_use]
    pub fn ids(&self) -> &[String] {
        &self.ids
    }
}

/// Subscription bookkeeping on top of a cache.
#[derive(Clone, Copy)]
pub struct SubscriptionStore<'a> {
    cache: &'a dyn CacheStore,
}

impl<'a> SubscriptionStore<'a> {
    /// Wrap a cache.
    #[must_use]
    pub fn new(cache: &'a dyn CacheStore) -> Self {
        Self { cache }
    }

    /// Load the active subscription set.
    ///
    /// # Errors
    ///
    /// Returns error if the cache fails.
    pub fn active_set(&self) -> Result<ActiveSet, StoreError> {
        let ids: Vec<String> = self.cache.get_or(ACTIVE_SUBSCRIPTIONS_KEY, Vec::new)?;
        Ok(ActiveSet::from_ids(ids))
    }

    /// Persist the active subscription set.
    ///
    /// # Errors
    ///
    /// Returns error if the cache fails.
    pub fn save_active_set(&self, set: &ActiveSet) -> Result<(), StoreError> {
        self.cache.put_value(ACTIVE_SUBSCRIPTIONS_KEY, set.ids(), None)
    }

    /// Points covered by one subscription.
    ///
    /// # Errors
    ///
    /// Returns error if the cache fails.
    pub fn coverage(&self, subscription_id: &str) -> Result<Option<Vec<String>>, StoreError> {
        self.cache.get_or(&coverage_key(subscription_id), || None)
    }

    /// Record the points a subscription covers.
    ///
    /// # Errors
    ///
    /// Returns error if the cache fails.
    pub fn save_coverage(&self, subscription_id: &str, point_ids: &[String]) -> Result<(), StoreError> {
        self.cache
            .put_value(&coverage_key(subscription_id), point_ids, None)
    }

    /// Forget a subscription's coverage.
    ///
    /// # Errors
    ///
    /// Returns error if the cache fails.
    pub fn delete_coverage(&self, subscription_id: &str) -> Result<(), StoreError> {
        self.cache.delete(&coverage_key(subscription_id))
    }

    /// Move coverage from a renamed subscription to its new id.
    ///
    /// The new entry is written before the old one is removed.
    ///
    /// # Errors
    ///
    /// Returns error if the cache fails.
    pub fn move_coverage(&self, old_id: &str, new_id: &str) -> Result<(), StoreError> {
        if let Some(points) = self.coverage(old_id)? {
            self.save_coverage(new_id, &points)?;
        }
        self.delete_coverage(old_id)
    }

    /// Union of the coverage of every active subscription.
    ///
    /// # Errors
    ///
    /// Returns error if the cache fails.
    pub fn covered_point_ids(&self) -> Result<HashSet<String>, StoreError> {
        let mut covered = HashSet::new();
        for id in self.active_set()?.ids() {
            if let Some(points) = self.coverage(id)? {
                covered.extend(points);
            }
        }
        Ok(covered)
    }
}
