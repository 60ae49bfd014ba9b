//! Keyed cache of loaded modules.
//!
//! Maps an application-chosen key (commonly the image's content hash or a
//! source identifier) to one loaded [`Module`] per device, so repeated
//! lookups skip the native load. Entries are shared via `Arc`; removal drops
//! the cache's reference but never unloads, since callers may still hold one.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::error::Result;
use crate::module::code::Module;

/// Per-device module cache keyed by `K`.
pub struct ModuleCache<K> {
    /// Key → device ordinal → loaded module.
    map: Mutex<HashMap<K, HashMap<usize, Arc<Module>>>>,
}

impl<K: Eq + Hash + Clone> ModuleCache<K> {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, HashMap<usize, Arc<Module>>>> {
        self.map.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, key: &K, device: usize) -> Option<Arc<Module>> {
        self.lock().get(key)?.get(&device).cloned()
    }

    /// Insert a loaded module, returning the entry it replaced, if any.
    pub fn insert(&self, key: K, device: usize, module: Arc<Module>) -> Option<Arc<Module>> {
        self.lock()
            .entry(key)
            .or_default()
            .insert(device, module)
    }

    /// Look up or load. The loader runs outside the cache lock; when two
    /// threads race on the same key the first insertion wins and the loser's
    /// module is returned to it for unloading.
    pub fn get_or_load<F>(&self, key: &K, device: usize, load: F) -> Result<Arc<Module>>
    where
        F: FnOnce() -> Result<Module>,
    {
        if let Some(found) = self.get(key, device) {
            return Ok(found);
        }

        let loaded = Arc::new(load()?);

        let mut map = self.lock();
        let slot = map.entry(key.clone()).or_default();
        match slot.get(&device) {
            Some(existing) => {
                // Lost the race; the caller's module is redundant.
                let existing = existing.clone();
                drop(map);
                debug!(device, "Discarding redundantly loaded module");
                loaded.unload()?;
                Ok(existing)
            }
            None => {
                slot.insert(device, loaded.clone());
                Ok(loaded)
            }
        }
    }

    /// Drop the cached entry. Does not unload; the returned module is handed
    /// to the caller for that.
    pub fn remove(&self, key: &K, device: usize) -> Option<Arc<Module>> {
        let mut map = self.lock();
        let slot = map.get_mut(key)?;
        let removed = slot.remove(&device);
        if slot.is_empty() {
            map.remove(key);
        }
        removed
    }

    /// Drop every entry cached for one device, returning them for unloading.
    pub fn invalidate_device(&self, device: usize) -> Vec<Arc<Module>> {
        let mut map = self.lock();
        let mut dropped = Vec::new();
        map.retain(|_, slot| {
            if let Some(module) = slot.remove(&device) {
                dropped.push(module);
            }
            !slot.is_empty()
        });
        dropped
    }

    /// Drop every cached entry, returning them for unloading.
    pub fn clear(&self) -> Vec<Arc<Module>> {
        self.lock()
            .drain()
            .flat_map(|(_, slot)| slot.into_values())
            .collect()
    }

    /// Total cached entries across all keys and devices.
    pub fn len(&self) -> usize {
        self.lock().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash + Clone> Default for ModuleCache<K> {
    fn default() -> Self {
        Self::new()
    }
}
