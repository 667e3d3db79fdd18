//! In-process BACnet server.
//!
//! Owns the stack-visible mirror of gateway objects, the device object,
//! request/notification statistics, and the outbound transmit loop. The
//! wire stack proper is external; notifications handed to
//! `send_cov_notification` are queued and drained by the task loop, which
//! is where a linked stack would encode and transmit them.

use super::{BacnetError, CovNotification, ObjectLayer};
use crate::config::ServerConfig;
use crate::types::{DevicePatch, DeviceState, ObjectId, ObjectRecord, StatusFlags, Value};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// Stack-visible state of one object.
#[derive(Debug, Clone)]
struct StackObject {
    name: String,
    #[allow(dead_code)]
    units: u16,
    value: Value,
    #[allow(dead_code)]
    flags: StatusFlags,
}

/// Monotonic server counters.
#[derive(Default)]
pub struct ServerStats {
    pub read_requests: AtomicU64,
    pub write_requests: AtomicU64,
    pub subscribe_requests: AtomicU64,
    pub cov_notifications_sent: AtomicU64,
}

/// Point-in-time view of [`ServerStats`] plus gauges.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StatsSnapshot {
    pub read_requests: u64,
    pub write_requests: u64,
    pub subscribe_requests: u64,
    pub cov_notifications_sent: u64,
    pub objects_total: u64,
}

pub struct BacnetServer {
    device: Mutex<DeviceState>,
    objects: DashMap<ObjectId, StackObject>,
    stats: ServerStats,
    running: AtomicBool,
    outbound_tx: mpsc::Sender<CovNotification>,
    outbound_rx: Mutex<Option<mpsc::Receiver<CovNotification>>>,
    port: u16,
}

impl BacnetServer {
    pub fn new(config: &ServerConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        Self {
            device: Mutex::new(DeviceState {
                instance: config.device_instance,
                name: config.device_name.clone(),
                description: config.device_description.clone(),
                location: config.location.clone(),
                vendor_id: config.vendor_id,
                vendor_name: config.vendor_name.clone(),
                model_name: config.model_name.clone(),
                application_software_version: config.application_software_version.clone(),
            }),
            objects: DashMap::new(),
            stats: ServerStats::default(),
            running: AtomicBool::new(false),
            outbound_tx,
            outbound_rx: Mutex::new(None),
            port: 0,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Starts the transmit loop. Must be called once; the returned handle
    /// completes after the cancellation token fires and the queue drains.
    pub fn start(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let mut rx = {
            let mut slot = self.outbound_rx.lock().unwrap();
            match slot.take() {
                Some(rx) => rx,
                None => {
                    // Second start: nothing to pump.
                    warn!("BACnet server started twice");
                    let (_tx, rx) = mpsc::channel(1);
                    rx
                }
            }
        };

        self.running.store(true, Ordering::SeqCst);
        let device = self.device.lock().unwrap().clone();
        info!(
            "BACnet server started: device {} '{}' on port {}",
            device.instance, device.name, self.port
        );

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(notification) => transmit(&notification),
                        None => break,
                    },
                }
            }
            // Flush whatever was queued before the stop signal.
            while let Ok(notification) = rx.try_recv() {
                transmit(&notification);
            }
            info!("BACnet server stopped");
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub fn mark_running(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    pub fn device(&self) -> DeviceState {
        self.device.lock().unwrap().clone()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            read_requests: self.stats.read_requests.load(Ordering::Relaxed),
            write_requests: self.stats.write_requests.load(Ordering::Relaxed),
            subscribe_requests: self.stats.subscribe_requests.load(Ordering::Relaxed),
            cov_notifications_sent: self.stats.cov_notifications_sent.load(Ordering::Relaxed),
            objects_total: self.objects.len() as u64,
        }
    }

    /// Wire-side hooks: the request handlers of a linked stack call these
    /// so `/metrics` can classify request traffic.
    pub fn note_read_request(&self) {
        self.stats.read_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_write_request(&self) {
        self.stats.write_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_subscribe_request(&self) {
        self.stats.subscribe_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Present value as the stack sees it (read-property path).
    pub fn read_value(&self, id: ObjectId) -> Option<Value> {
        self.note_read_request();
        self.objects.get(&id).map(|obj| obj.value)
    }
}

fn transmit(notification: &CovNotification) {
    // A linked wire stack encodes and sends here.
    debug!(
        "{} COV notification: {} = {} to process {} at {} (timeRemaining={})",
        if notification.confirmed {
            "confirmed"
        } else {
            "unconfirmed"
        },
        notification.object_id,
        notification.present_value,
        notification.subscriber_process_id,
        notification.subscriber_address,
        notification.time_remaining,
    );
}

#[async_trait]
impl ObjectLayer for BacnetServer {
    async fn create_object(&self, record: &ObjectRecord) -> Result<(), BacnetError> {
        let id = record.id();
        let created = !self.objects.contains_key(&id);
        self.objects.insert(
            id,
            StackObject {
                name: record.object_name.clone(),
                units: record.units,
                value: record.present_value,
                flags: record.status_flags,
            },
        );
        if created {
            info!("created BACnet object {} '{}'", id, record.object_name);
        } else {
            debug!("refreshed BACnet object {}", id);
        }
        Ok(())
    }

    async fn update_value(
        &self,
        id: ObjectId,
        value: &Value,
        flags: &StatusFlags,
    ) -> Result<(), BacnetError> {
        match self.objects.get_mut(&id) {
            Some(mut obj) => {
                obj.value = *value;
                obj.flags = *flags;
                Ok(())
            }
            None => Err(BacnetError::UnknownObject(id)),
        }
    }

    async fn delete_object(&self, id: ObjectId) -> Result<(), BacnetError> {
        match self.objects.remove(&id) {
            Some((_, obj)) => {
                info!("deleted BACnet object {} '{}'", id, obj.name);
                Ok(())
            }
            None => Err(BacnetError::UnknownObject(id)),
        }
    }

    async fn update_device(&self, patch: &DevicePatch) -> Result<(), BacnetError> {
        let mut device = self.device.lock().unwrap();
        if let Some(name) = &patch.name {
            device.name = name.clone();
        }
        if let Some(description) = &patch.description {
            device.description = description.clone();
        }
        if let Some(location) = &patch.location {
            device.location = location.clone();
        }
        if let Some(model_name) = &patch.model_name {
            device.model_name = model_name.clone();
        }
        if let Some(vendor_name) = &patch.vendor_name {
            device.vendor_name = vendor_name.clone();
        }
        if let Some(version) = &patch.application_software_version {
            device.application_software_version = version.clone();
        }
        info!("device properties updated: '{}'", device.name);
        Ok(())
    }

    async fn send_cov_notification(
        &self,
        notification: &CovNotification,
    ) -> Result<(), BacnetError> {
        if !self.is_running() {
            return Err(BacnetError::NotRunning);
        }
        self.outbound_tx
            .try_send(notification.clone())
            .map_err(|_| BacnetError::QueueFull)?;
        self.stats
            .cov_notifications_sent
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ObjectType, ValueKind};

    fn record(instance: u32) -> ObjectRecord {
        ObjectRecord {
            object_type: ObjectType::AnalogValue,
            object_instance: instance,
            object_name: format!("AV-{instance}"),
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
            source_id: String::new(),
            stream_position: None,
            last_notified_value: Value::Real(1.0),
        }
    }

    #[tokio::test]
    async fn object_lifecycle() {
        let server = BacnetServer::new(&ServerConfig::default());
        let rec = record(5);
        server.create_object(&rec).await.unwrap();
        assert_eq!(server.object_count(), 1);

        server
            .update_value(rec.id(), &Value::Real(2.5), &StatusFlags::default())
            .await
            .unwrap();
        assert_eq!(server.read_value(rec.id()), Some(Value::Real(2.5)));

        server.delete_object(rec.id()).await.unwrap();
        assert_eq!(server.object_count(), 0);
        assert_eq!(
            server.delete_object(rec.id()).await,
            Err(BacnetError::UnknownObject(rec.id()))
        );
    }

    #[tokio::test]
    async fn create_is_idempotent_refresh() {
        let server = BacnetServer::new(&ServerConfig::default());
        let mut rec = record(5);
        server.create_object(&rec).await.unwrap();
        rec.present_value = Value::Real(9.0);
        server.create_object(&rec).await.unwrap();
        assert_eq!(server.object_count(), 1);
        assert_eq!(server.read_value(rec.id()), Some(Value::Real(9.0)));
    }

    #[tokio::test]
    async fn notifications_require_running_server() {
        let server = BacnetServer::new(&ServerConfig::default());
        let notification = CovNotification {
            subscriber_process_id: 1,
            subscriber_address: crate::types::MacAddress([0; 6]),
            initiating_device: 1,
            object_id: ObjectId::new(ObjectType::AnalogValue, 5),
            present_value: Value::Real(1.0),
            status_flags: StatusFlags::default(),
            time_remaining: 0,
            confirmed: false,
            priority: None,
        };
        assert_eq!(
            server.send_cov_notification(&notification).await,
            Err(BacnetError::NotRunning)
        );

        server.mark_running();
        server.send_cov_notification(&notification).await.unwrap();
        assert_eq!(server.stats().cov_notifications_sent, 1);
    }

    #[tokio::test]
    async fn device_patch_applies_per_field() {
        let server = BacnetServer::new(&ServerConfig::default());
        let before = server.device();
        server
            .update_device(&DevicePatch {
                location: Some("Hall 3".to_string()),
                ..DevicePatch::default()
            })
            .await
            .unwrap();
        let after = server.device();
        assert_eq!(after.location, "Hall 3");
        assert_eq!(after.name, before.name);
    }

    #[tokio::test]
    async fn transmit_loop_drains_queue_on_shutdown() {
        let server = BacnetServer::new(&ServerConfig::default());
        let cancel = CancellationToken::new();
        let handle = server.start(cancel.clone());
        assert!(server.is_running());

        cancel.cancel();
        handle.await.unwrap();
    }
}
