//! In-memory binding for the cache store.
//!
//! Backs tests and standalone runs where no external cache is reachable.
//! Semantics mirror the Redis binding: index sets, hashes, and a broadcast
//! channel standing in for pub/sub.

use super::{CacheError, CacheStore};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;
use tokio::sync::broadcast;

#[derive(Default)]
struct Tables {
    strings: HashMap<String, String>,
    sets: HashMap<String, BTreeSet<String>>,
    hashes: HashMap<String, BTreeMap<String, String>>,
}

pub struct MemoryStore {
    tables: Mutex<Tables>,
    events: broadcast::Sender<(String, String)>,
    /// When set, every operation fails with this error (for failure tests).
    fail_with: Mutex<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            tables: Mutex::new(Tables::default()),
            events,
            fail_with: Mutex::new(None),
        }
    }

    /// Subscribes to published channel messages as `(channel, payload)`.
    pub fn subscribe_events(&self) -> broadcast::Receiver<(String, String)> {
        self.events.subscribe()
    }

    /// Makes every subsequent operation fail transiently until cleared.
    pub fn set_failing(&self, reason: Option<&str>) {
        *self.fail_with.lock().unwrap() = reason.map(str::to_string);
    }

    fn check(&self) -> Result<(), CacheError> {
        if let Some(reason) = self.fail_with.lock().unwrap().as_ref() {
            return Err(CacheError::Transient(reason.clone()));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn ping(&self) -> Result<(), CacheError> {
        self.check()
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.check()?;
        Ok(self.tables.lock().unwrap().strings.get(key).cloned())
    }

    async fn set_with_index(
        &self,
        key: &str,
        value: &str,
        index_key: &str,
        member: &str,
    ) -> Result<(), CacheError> {
        self.check()?;
        let mut tables = self.tables.lock().unwrap();
        tables.strings.insert(key.to_string(), value.to_string());
        tables
            .sets
            .entry(index_key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn delete_with_index(
        &self,
        key: &str,
        index_key: &str,
        member: &str,
    ) -> Result<(), CacheError> {
        self.check()?;
        let mut tables = self.tables.lock().unwrap();
        tables.strings.remove(key);
        if let Some(set) = tables.sets.get_mut(index_key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, CacheError> {
        self.check()?;
        Ok(self
            .tables
            .lock()
            .unwrap()
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), CacheError> {
        self.check()?;
        self.tables
            .lock()
            .unwrap()
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, CacheError> {
        self.check()?;
        Ok(self
            .tables
            .lock()
            .unwrap()
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field).cloned()))
    }

    async fn hash_set_all(
        &self,
        key: &str,
        fields: Vec<(String, String)>,
    ) -> Result<(), CacheError> {
        self.check()?;
        let mut tables = self.tables.lock().unwrap();
        let hash = tables.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field, value);
        }
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, String)>, CacheError> {
        self.check()?;
        Ok(self
            .tables
            .lock()
            .unwrap()
            .hashes
            .get(key)
            .map(|hash| hash.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), CacheError> {
        self.check()?;
        // No receivers is fine, same as publishing to an idle channel.
        let _ = self.events.send((channel.to_string(), payload.to_string()));
        Ok(())
    }
}
