//! Cache Mirror
//!
//! Thin projection of the object registry into an external key-value store.
//! The cache is not authoritative; it exists for crash recovery and for
//! cross-process consumers. Key layout:
//!
//! ```text
//! {prefix}object:{type}:{instance}   object record blob (JSON)
//! {prefix}objects:index              set of "{type}:{instance}"
//! {prefix}stream:positions           hash subscription_id -> position
//! {prefix}device:config              hash of device fields
//! {prefix}events:value_change        pub/sub channel, payload "{type}:{instance}"
//! ```

mod memory;
mod redis_store;
mod store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use store::CacheStore;

use crate::types::{DeviceState, ObjectId, ObjectRecord, ObjectType};
use std::sync::Arc;
use tracing::{debug, warn};

/// Cache error, classified for the retry policy: transient errors are
/// retried via nak/redelivery, permanent ones surface to the operator.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache transient error: {0}")]
    Transient(String),

    #[error("cache permanent error: {0}")]
    Permanent(String),
}

impl CacheError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CacheError::Transient(_))
    }
}

/// Typed projection layer over a [`CacheStore`].
pub struct CacheMirror {
    store: Arc<dyn CacheStore>,
    prefix: String,
}

impl CacheMirror {
    pub fn new(store: Arc<dyn CacheStore>, key_prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: key_prefix.into(),
        }
    }

    fn object_key(&self, id: ObjectId) -> String {
        format!(
            "{}object:{}:{}",
            self.prefix,
            id.object_type.code(),
            id.instance
        )
    }

    fn index_key(&self) -> String {
        format!("{}objects:index", self.prefix)
    }

    fn positions_key(&self) -> String {
        format!("{}stream:positions", self.prefix)
    }

    fn device_key(&self) -> String {
        format!("{}device:config", self.prefix)
    }

    fn channel_key(&self) -> String {
        format!("{}events:value_change", self.prefix)
    }

    /// Round-trip probe used by health checks and startup.
    pub async fn ping(&self) -> Result<(), CacheError> {
        self.store.ping().await
    }

    /// Reconnects performed by the underlying store binding.
    pub fn store_reconnects(&self) -> u64 {
        self.store.reconnects()
    }

    /// Writes the record blob and its index entry in one batch.
    pub async fn put_object(&self, record: &ObjectRecord) -> Result<(), CacheError> {
        let blob = serde_json::to_string(record)
            .map_err(|e| CacheError::Permanent(format!("serialize object record: {e}")))?;
        let id = record.id();
        self.store
            .set_with_index(&self.object_key(id), &blob, &self.index_key(), &id.key())
            .await
    }

    pub async fn get_object(&self, id: ObjectId) -> Result<Option<ObjectRecord>, CacheError> {
        let Some(blob) = self.store.get(&self.object_key(id)).await? else {
            return Ok(None);
        };
        let record: ObjectRecord = serde_json::from_str(&blob)
            .map_err(|e| CacheError::Permanent(format!("malformed cached record {id}: {e}")))?;
        Ok(Some(record))
    }

    pub async fn delete_object(&self, id: ObjectId) -> Result<(), CacheError> {
        self.store
            .delete_with_index(&self.object_key(id), &self.index_key(), &id.key())
            .await
    }

    /// Loads every cached record, optionally filtered by type. Index entries
    /// whose blob is missing or unreadable are skipped with a warning so a
    /// single bad key cannot block recovery.
    pub async fn iterate_objects(
        &self,
        filter: Option<ObjectType>,
    ) -> Result<Vec<ObjectRecord>, CacheError> {
        let members = self.store.set_members(&self.index_key()).await?;
        let mut records = Vec::with_capacity(members.len());
        let mut seen = std::collections::HashSet::new();

        for member in members {
            let Some(id) = ObjectId::parse_key(&member) else {
                warn!("skipping unparseable index entry '{}'", member);
                continue;
            };
            if !seen.insert(id) {
                continue;
            }
            if let Some(wanted) = filter {
                if id.object_type != wanted {
                    continue;
                }
            }
            match self.get_object(id).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => warn!("index entry {} has no cached blob", id),
                Err(CacheError::Permanent(msg)) => {
                    warn!("skipping unreadable cached object {}: {}", id, msg);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(records)
    }

    pub async fn put_cursor(
        &self,
        subscription_id: &str,
        position: u64,
    ) -> Result<(), CacheError> {
        self.store
            .hash_set(
                &self.positions_key(),
                subscription_id,
                &position.to_string(),
            )
            .await
    }

    pub async fn get_cursor(&self, subscription_id: &str) -> Result<Option<u64>, CacheError> {
        let Some(raw) = self
            .store
            .hash_get(&self.positions_key(), subscription_id)
            .await?
        else {
            return Ok(None);
        };
        raw.parse::<u64>().map(Some).map_err(|_| {
            CacheError::Permanent(format!(
                "cursor for '{subscription_id}' is not a position: '{raw}'"
            ))
        })
    }

    pub async fn put_device(&self, device: &DeviceState) -> Result<(), CacheError> {
        let fields = vec![
            ("instance".to_string(), device.instance.to_string()),
            ("name".to_string(), device.name.clone()),
            ("description".to_string(), device.description.clone()),
            ("location".to_string(), device.location.clone()),
            ("vendor_id".to_string(), device.vendor_id.to_string()),
            ("vendor_name".to_string(), device.vendor_name.clone()),
            ("model_name".to_string(), device.model_name.clone()),
            (
                "application_software_version".to_string(),
                device.application_software_version.clone(),
            ),
        ];
        self.store.hash_set_all(&self.device_key(), fields).await
    }

    pub async fn get_device(&self) -> Result<Option<Vec<(String, String)>>, CacheError> {
        let fields = self.store.hash_get_all(&self.device_key()).await?;
        if fields.is_empty() {
            Ok(None)
        } else {
            Ok(Some(fields))
        }
    }

    /// Best-effort out-of-band change signal; failures are logged, never
    /// propagated.
    pub async fn publish_change(&self, id: ObjectId) {
        if let Err(e) = self.store.publish(&self.channel_key(), &id.key()).await {
            debug!("value-change publish for {} failed: {}", id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{StatusFlags, Value, ValueKind};

    fn record(instance: u32) -> ObjectRecord {
        ObjectRecord {
            object_type: ObjectType::AnalogInput,
            object_instance: instance,
            object_name: format!("AI-{instance}"),
            description: String::new(),
            value_kind: ValueKind::Real,
            units: 95,
            units_text: String::new(),
            cov_increment: 0.0,
            min_value: None,
            max_value: None,
            state_texts: Vec::new(),
            state_count: 0,
            inactive_text: String::new(),
            active_text: String::new(),
            supports_priority_array: false,
            present_value: Value::Real(1.0),
            status_flags: StatusFlags::default(),
            reliability: 0,
            event_state: 0,
            last_update: 0,
            source_id: "test".to_string(),
            stream_position: Some(3),
            last_notified_value: Value::Real(1.0),
        }
    }

    fn mirror() -> CacheMirror {
        CacheMirror::new(Arc::new(MemoryStore::new()), "bacnet:")
    }

    #[tokio::test]
    async fn put_get_round_trip() {
        let mirror = mirror();
        let rec = record(7);
        mirror.put_object(&rec).await.unwrap();
        let loaded = mirror.get_object(rec.id()).await.unwrap().unwrap();
        assert_eq!(loaded, rec);
    }

    #[tokio::test]
    async fn get_missing_is_none() {
        let mirror = mirror();
        let id = ObjectId::new(ObjectType::BinaryValue, 9);
        assert!(mirror.get_object(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_removes_blob_and_index() {
        let mirror = mirror();
        let rec = record(7);
        mirror.put_object(&rec).await.unwrap();
        mirror.delete_object(rec.id()).await.unwrap();
        assert!(mirror.get_object(rec.id()).await.unwrap().is_none());
        assert!(mirror.iterate_objects(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn iterate_filters_by_type() {
        let mirror = mirror();
        mirror.put_object(&record(1)).await.unwrap();
        mirror.put_object(&record(2)).await.unwrap();

        let all = mirror.iterate_objects(None).await.unwrap();
        assert_eq!(all.len(), 2);

        let none = mirror
            .iterate_objects(Some(ObjectType::BinaryInput))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn cursor_round_trip() {
        let mirror = mirror();
        assert_eq!(mirror.get_cursor("plant-1").await.unwrap(), None);
        mirror.put_cursor("plant-1", 42).await.unwrap();
        assert_eq!(mirror.get_cursor("plant-1").await.unwrap(), Some(42));
        mirror.put_cursor("plant-1", 43).await.unwrap();
        assert_eq!(mirror.get_cursor("plant-1").await.unwrap(), Some(43));
    }
}
