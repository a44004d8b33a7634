//! Bounded snapshot cache of resources read through this server.
//!
//! Entries are evicted when the dispatcher sees a change touching the key
//! or when a local write goes through, so a cached snapshot is never older
//! than the last dispatched sequence.

use mini_moka::sync::Cache;
use rollcall_common::{ChangeSubject, Resource, ResourceKey};

pub struct ResourceCache {
    entries: Cache<ResourceKey, Resource>,
}

impl ResourceCache {
    pub fn new(max_entries: u64) -> Self {
        Self {
            entries: Cache::new(max_entries),
        }
    }

    pub fn get(&self, key: &ResourceKey) -> Option<Resource> {
        self.entries.get(key)
    }

    pub fn put(&self, resource: Resource) {
        self.entries.insert(resource.key.clone(), resource);
    }

    pub fn evict(&self, key: &ResourceKey) {
        self.entries.invalidate(key);
    }

    /// Evict every key a change to `subject` may have made stale
    pub fn evict_subject(&self, subject: &ChangeSubject) {
        for key in subject.watched_keys() {
            self.entries.invalidate(key);
        }
    }

    pub fn entry_count(&self) -> u64 {
        self.entries.entry_count()
    }
}
