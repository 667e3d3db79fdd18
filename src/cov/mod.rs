//! COV Manager
//!
//! Tracks Change-of-Value subscriptions per object, ages them out, and
//! fans notifications out through the BACnet object layer. The subscriber
//! identity is the quadruple (process id, address, object type, instance);
//! re-subscribing with the same identity renews the existing entry.
//!
//! A lifetime of 0 means indefinite: the subscription never expires on its
//! own and notifications report `timeRemaining = 0`.

use crate::bacnet::{BacnetError, CovNotification, ObjectLayer};
use crate::types::{MacAddress, ObjectId, ObjectRecord, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// COV error
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CovError {
    #[error("COV subscription table is full ({0} entries)")]
    CapacityExceeded(usize),

    #[error("no such object {0}")]
    NoSuchObject(ObjectId),
}

/// Identity of one subscription
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub struct SubscriptionKey {
    pub process_id: u32,
    pub address: MacAddress,
    pub object_id: ObjectId,
}

/// One live COV subscription
#[derive(Debug, Clone)]
pub struct CovSubscription {
    pub key: SubscriptionKey,
    pub confirmed: bool,
    /// `None` = indefinite.
    pub remaining: Option<u32>,
    pub increment_override: Option<f32>,
    pub created_at: i64,
    pub last_notified_at: Option<i64>,
}

impl CovSubscription {
    pub fn time_remaining(&self) -> u32 {
        self.remaining.unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    New,
    Renewed,
}

/// Result of one fan-out pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifyOutcome {
    pub sent: usize,
    pub failed: usize,
    pub suppressed: usize,
}

pub struct CovManager {
    subscriptions: Mutex<HashMap<SubscriptionKey, CovSubscription>>,
    max_subscriptions: usize,
}

impl CovManager {
    pub fn new(max_subscriptions: usize) -> Self {
        Self {
            subscriptions: Mutex::new(HashMap::new()),
            max_subscriptions,
        }
    }

    /// Creates or renews a subscription. The identity quadruple decides
    /// which: an existing entry gets its lifetime, confirmation mode, and
    /// increment override replaced.
    #[allow(clippy::too_many_arguments)]
    pub fn subscribe(
        &self,
        process_id: u32,
        address: MacAddress,
        object_id: ObjectId,
        confirmed: bool,
        lifetime_seconds: u32,
        increment_override: Option<f32>,
        now: i64,
    ) -> Result<SubscribeOutcome, CovError> {
        let key = SubscriptionKey {
            process_id,
            address,
            object_id,
        };
        let remaining = if lifetime_seconds == 0 {
            None
        } else {
            Some(lifetime_seconds)
        };

        let mut subs = self.subscriptions.lock().unwrap();
        if let Some(existing) = subs.get_mut(&key) {
            existing.remaining = remaining;
            existing.confirmed = confirmed;
            existing.increment_override = increment_override;
            debug!(
                "renewed COV subscription for {} (process {}, lifetime {}s)",
                object_id, process_id, lifetime_seconds
            );
            return Ok(SubscribeOutcome::Renewed);
        }

        if subs.len() >= self.max_subscriptions {
            return Err(CovError::CapacityExceeded(self.max_subscriptions));
        }

        subs.insert(
            key,
            CovSubscription {
                key,
                confirmed,
                remaining,
                increment_override,
                created_at: now,
                last_notified_at: None,
            },
        );
        info!(
            "new COV subscription for {} (process {}, lifetime {}s, confirmed={})",
            object_id, process_id, lifetime_seconds, confirmed
        );
        Ok(SubscribeOutcome::New)
    }

    /// Cancels a subscription; `false` when the identity is unknown.
    pub fn cancel(&self, process_id: u32, address: MacAddress, object_id: ObjectId) -> bool {
        let key = SubscriptionKey {
            process_id,
            address,
            object_id,
        };
        let removed = self.subscriptions.lock().unwrap().remove(&key).is_some();
        if removed {
            info!(
                "cancelled COV subscription for {} (process {})",
                object_id, process_id
            );
        }
        removed
    }

    /// Decrements lifetimes and removes subscriptions that reached zero.
    /// Returns the removed identities.
    pub fn tick(&self, elapsed_seconds: u32) -> Vec<SubscriptionKey> {
        if elapsed_seconds == 0 {
            return Vec::new();
        }
        let mut expired = Vec::new();
        let mut subs = self.subscriptions.lock().unwrap();
        subs.retain(|key, sub| match sub.remaining {
            None => true,
            Some(remaining) => {
                if remaining <= elapsed_seconds {
                    expired.push(*key);
                    false
                } else {
                    sub.remaining = Some(remaining - elapsed_seconds);
                    true
                }
            }
        });
        drop(subs);

        for key in &expired {
            info!(
                "COV subscription for {} (process {}) expired",
                key.object_id, key.process_id
            );
        }
        expired
    }

    /// Drops every subscription for a deleted object. Returns how many
    /// were removed.
    pub fn remove_for_object(&self, object_id: ObjectId) -> usize {
        let mut subs = self.subscriptions.lock().unwrap();
        let before = subs.len();
        subs.retain(|key, _| key.object_id != object_id);
        before - subs.len()
    }

    pub fn list_for_object(&self, object_id: ObjectId) -> Vec<CovSubscription> {
        self.subscriptions
            .lock()
            .unwrap()
            .values()
            .filter(|sub| sub.key.object_id == object_id)
            .cloned()
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.subscriptions.lock().unwrap().len()
    }

    /// Fans one value change out to the object's subscribers.
    ///
    /// `previous_value` is the object-level `last_notified_value` before
    /// this change; a per-subscription increment override is gated against
    /// it instead of the object increment. Status-flag changes always
    /// notify. Send failures are counted and retried implicitly on the
    /// next delta.
    pub async fn notify(
        &self,
        layer: &dyn ObjectLayer,
        record: &ObjectRecord,
        previous_value: Value,
        flags_changed: bool,
        priority: Option<u8>,
        device_instance: u32,
        now: i64,
    ) -> NotifyOutcome {
        let targets = self.list_for_object(record.id());
        if targets.is_empty() {
            return NotifyOutcome::default();
        }

        let mut outcome = NotifyOutcome::default();
        let mut notified = Vec::new();

        for sub in &targets {
            if !flags_changed {
                if let Some(increment) = sub.increment_override {
                    let delta =
                        (record.present_value.as_f64() - previous_value.as_f64()).abs();
                    let passes = if increment > 0.0 {
                        delta >= f64::from(increment)
                    } else {
                        record.present_value != previous_value
                    };
                    if !passes {
                        outcome.suppressed += 1;
                        continue;
                    }
                }
            }

            let notification = CovNotification {
                subscriber_process_id: sub.key.process_id,
                subscriber_address: sub.key.address,
                initiating_device: device_instance,
                object_id: record.id(),
                present_value: record.present_value,
                status_flags: record.status_flags,
                time_remaining: sub.time_remaining(),
                confirmed: sub.confirmed,
                priority,
            };

            match layer.send_cov_notification(&notification).await {
                Ok(()) => {
                    outcome.sent += 1;
                    notified.push(sub.key);
                }
                Err(BacnetError::NotRunning) => {
                    outcome.failed += 1;
                    warn!(
                        "COV notification for {} dropped, BACnet layer not running",
                        record.id()
                    );
                }
                Err(e) => {
                    outcome.failed += 1;
                    warn!(
                        "COV notification for {} to process {} failed: {}",
                        record.id(),
                        sub.key.process_id,
                        e
                    );
                }
            }
        }

        if !notified.is_empty() {
            let mut subs = self.subscriptions.lock().unwrap();
            for key in notified {
                if let Some(sub) = subs.get_mut(&key) {
                    sub.last_notified_at = Some(now);
                }
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bacnet::BacnetServer;
    use crate::config::ServerConfig;
    use crate::types::{ObjectType, StatusFlags, ValueKind};

    fn addr(last: u8) -> MacAddress {
        MacAddress([10, 0, 0, 1, 0, last])
    }

    fn object() -> ObjectId {
        ObjectId::new(ObjectType::AnalogInput, 1)
    }

    fn record(value: f32, increment: f32) -> ObjectRecord {
        ObjectRecord {
            object_type: ObjectType::AnalogInput,
            object_instance: 1,
            object_name: "T".to_string(),
            description: String::new(),
            value_kind: ValueKind::Real,
            units: 95,
            units_text: String::new(),
            cov_increment: increment,
            min_value: None,
            max_value: None,
            state_texts: Vec::new(),
            state_count: 0,
            inactive_text: String::new(),
            active_text: String::new(),
            supports_priority_array: false,
            present_value: Value::Real(value),
            status_flags: StatusFlags::default(),
            reliability: 0,
            event_state: 0,
            last_update: 0,
            source_id: "s1".to_string(),
            stream_position: Some(1),
            last_notified_value: Value::Real(value),
        }
    }

    #[test]
    fn subscribe_then_renew() {
        let manager = CovManager::new(10);
        let outcome = manager
            .subscribe(7, addr(1), object(), false, 300, None, 0)
            .unwrap();
        assert_eq!(outcome, SubscribeOutcome::New);

        let outcome = manager
            .subscribe(7, addr(1), object(), true, 600, Some(1.0), 5)
            .unwrap();
        assert_eq!(outcome, SubscribeOutcome::Renewed);
        assert_eq!(manager.active_count(), 1);

        let sub = &manager.list_for_object(object())[0];
        assert!(sub.confirmed);
        assert_eq!(sub.remaining, Some(600));
        assert_eq!(sub.increment_override, Some(1.0));
    }

    #[test]
    fn capacity_is_enforced() {
        let manager = CovManager::new(2);
        manager
            .subscribe(1, addr(1), object(), false, 0, None, 0)
            .unwrap();
        manager
            .subscribe(2, addr(2), object(), false, 0, None, 0)
            .unwrap();
        assert_eq!(
            manager.subscribe(3, addr(3), object(), false, 0, None, 0),
            Err(CovError::CapacityExceeded(2))
        );
        // Renewal is not a new entry and still succeeds at capacity.
        assert_eq!(
            manager.subscribe(1, addr(1), object(), false, 60, None, 0),
            Ok(SubscribeOutcome::Renewed)
        );
    }

    #[test]
    fn tick_expires_finite_lifetimes_only() {
        let manager = CovManager::new(10);
        manager
            .subscribe(1, addr(1), object(), false, 3, None, 0)
            .unwrap();
        manager
            .subscribe(2, addr(2), object(), false, 0, None, 0)
            .unwrap();

        assert!(manager.tick(1).is_empty());
        assert!(manager.tick(1).is_empty());
        let expired = manager.tick(1);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].process_id, 1);

        // Indefinite subscription survives any amount of ticking.
        assert!(manager.tick(1_000_000).is_empty());
        assert_eq!(manager.active_count(), 1);
    }

    #[test]
    fn cancel_and_remove_for_object() {
        let manager = CovManager::new(10);
        manager
            .subscribe(1, addr(1), object(), false, 0, None, 0)
            .unwrap();
        manager
            .subscribe(2, addr(2), object(), false, 0, None, 0)
            .unwrap();

        assert!(manager.cancel(1, addr(1), object()));
        assert!(!manager.cancel(1, addr(1), object()));
        assert_eq!(manager.remove_for_object(object()), 1);
        assert!(manager.list_for_object(object()).is_empty());
    }

    #[tokio::test]
    async fn notify_fans_out_and_stamps_time() {
        let server = BacnetServer::new(&ServerConfig::default());
        server.mark_running();
        let manager = CovManager::new(10);
        manager
            .subscribe(1, addr(1), object(), false, 0, None, 0)
            .unwrap();
        manager
            .subscribe(2, addr(2), object(), true, 120, None, 0)
            .unwrap();

        let rec = record(21.0, 0.5);
        let outcome = manager
            .notify(&server, &rec, Value::Real(20.0), false, None, 500, 99)
            .await;
        assert_eq!(outcome.sent, 2);
        assert_eq!(outcome.failed, 0);

        for sub in manager.list_for_object(object()) {
            assert_eq!(sub.last_notified_at, Some(99));
        }
        assert_eq!(server.stats().cov_notifications_sent, 2);
    }

    #[tokio::test]
    async fn increment_override_gates_per_subscriber() {
        let server = BacnetServer::new(&ServerConfig::default());
        server.mark_running();
        let manager = CovManager::new(10);
        // Coarse subscriber wants at least 2.0 of movement.
        manager
            .subscribe(1, addr(1), object(), false, 0, Some(2.0), 0)
            .unwrap();
        manager
            .subscribe(2, addr(2), object(), false, 0, None, 0)
            .unwrap();

        let rec = record(21.0, 0.5);
        let outcome = manager
            .notify(&server, &rec, Value::Real(20.0), false, None, 500, 0)
            .await;
        assert_eq!(outcome.sent, 1);
        assert_eq!(outcome.suppressed, 1);

        // A status-flag change overrides the per-subscriber gate.
        let outcome = manager
            .notify(&server, &rec, Value::Real(20.0), true, None, 500, 0)
            .await;
        assert_eq!(outcome.sent, 2);
    }
}
