//! Object Registry
//!
//! Authoritative in-memory table of gateway objects. Apply operations run
//! under one registry-wide lock held by the caller (the supervisor wraps
//! the registry in a `Mutex`); each returns the data the caller needs for
//! the follow-up side effects, in order: cache mirror, then COV fan-out.
//!
//! Redelivered events are detected by the per-object `stream_position`,
//! which never moves backwards; re-applying an already-applied update is a
//! no-op, which is what makes at-least-once delivery safe.

use crate::decoder::{DeviceConfigMsg, ObjectDefinition, ObjectDelete, ValueUpdate};
use crate::types::{
    DevicePatch, DeviceState, ObjectId, ObjectRecord, ObjectType, Value, ValueKind,
};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info, warn};

/// Registry error; all of these ack-and-skip the offending event.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RegistryError {
    #[error("object {0} does not exist")]
    NotFound(ObjectId),

    #[error("object {id} holds {expected} values, update carries {got}")]
    KindMismatch {
        id: ObjectId,
        expected: ValueKind,
        got: ValueKind,
    },

    #[error("value {value} for {id} is out of range: {reason}")]
    OutOfRange {
        id: ObjectId,
        value: Value,
        reason: String,
    },
}

/// What `apply_definition` did.
#[derive(Debug, Clone)]
pub struct DefinitionApplied {
    pub record: ObjectRecord,
    pub created: bool,
}

/// Data for a pending COV fan-out.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CovTrigger {
    /// Object-level `last_notified_value` before this write.
    pub previous_value: Value,
    pub flags_changed: bool,
}

/// What `apply_value` did.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueApplied {
    pub record: ObjectRecord,
    /// `Some` when the delta rule says subscribers must be notified.
    pub cov: Option<CovTrigger>,
    /// True when the event position was at or behind the stored one.
    pub replayed: bool,
}

/// What `apply_delete` did.
#[derive(Debug, Clone, Copy)]
pub struct DeleteApplied {
    pub id: ObjectId,
    /// False when the object was already gone (replayed delete).
    pub existed: bool,
}

pub struct ObjectRegistry {
    objects: HashMap<ObjectId, ObjectRecord>,
    by_type: HashMap<ObjectType, BTreeSet<u32>>,
    device: DeviceState,
    clamp_out_of_range: bool,
}

impl ObjectRegistry {
    pub fn new(device: DeviceState, clamp_out_of_range: bool) -> Self {
        Self {
            objects: HashMap::new(),
            by_type: HashMap::new(),
            device,
            clamp_out_of_range,
        }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn get(&self, id: ObjectId) -> Option<&ObjectRecord> {
        self.objects.get(&id)
    }

    pub fn device(&self) -> &DeviceState {
        &self.device
    }

    pub fn count_by_type(&self, object_type: ObjectType) -> usize {
        self.by_type
            .get(&object_type)
            .map(BTreeSet::len)
            .unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ObjectRecord> {
        self.objects.values()
    }

    fn index_insert(&mut self, id: ObjectId) {
        self.by_type
            .entry(id.object_type)
            .or_default()
            .insert(id.instance);
    }

    /// Creates or updates an object from a definition message.
    ///
    /// An existing object keeps its present value and COV baseline; only
    /// metadata is refreshed. A definition whose value kind disagrees with
    /// the stored one is rejected.
    pub fn apply_definition(
        &mut self,
        def: &ObjectDefinition,
        offset: u32,
        source_id: &str,
        position: u64,
        now: i64,
    ) -> Result<DefinitionApplied, RegistryError> {
        let instance = def.object_instance.saturating_add(offset);
        let id = ObjectId::new(def.object_type, instance);

        if let Some(existing) = self.objects.get_mut(&id) {
            if existing.value_kind != def.value_kind {
                return Err(RegistryError::KindMismatch {
                    id,
                    expected: existing.value_kind,
                    got: def.value_kind,
                });
            }
            if let Some(applied) = existing.stream_position {
                if position <= applied {
                    debug!(
                        "definition for {} at position {} already applied (at {})",
                        id, position, applied
                    );
                    return Ok(DefinitionApplied {
                        record: existing.clone(),
                        created: false,
                    });
                }
            }

            existing.object_name = def.object_name.clone();
            existing.description = def.description.clone();
            existing.units = def.units;
            existing.units_text = def.units_text.clone();
            existing.cov_increment = def.cov_increment;
            existing.min_value = def.min_value;
            existing.max_value = def.max_value;
            existing.state_texts = def.state_texts.clone();
            existing.state_count = def.state_texts.len() as u32;
            existing.inactive_text = def.inactive_text.clone();
            existing.active_text = def.active_text.clone();
            existing.supports_priority_array = def.supports_priority_array;
            existing.source_id = source_id.to_string();
            existing.last_update = now;
            existing.stream_position = Some(position);

            debug!("refreshed object {} '{}'", id, existing.object_name);
            return Ok(DefinitionApplied {
                record: existing.clone(),
                created: false,
            });
        }

        let initial = def
            .initial_value
            .unwrap_or_else(|| Value::zero(def.value_kind));
        let record = ObjectRecord {
            object_type: def.object_type,
            object_instance: instance,
            object_name: def.object_name.clone(),
            description: def.description.clone(),
            value_kind: def.value_kind,
            units: def.units,
            units_text: def.units_text.clone(),
            cov_increment: def.cov_increment,
            min_value: def.min_value,
            max_value: def.max_value,
            state_texts: def.state_texts.clone(),
            state_count: def.state_texts.len() as u32,
            inactive_text: def.inactive_text.clone(),
            active_text: def.active_text.clone(),
            supports_priority_array: def.supports_priority_array,
            present_value: initial,
            status_flags: Default::default(),
            reliability: 0,
            event_state: 0,
            last_update: now,
            source_id: source_id.to_string(),
            stream_position: Some(position),
            // COV baseline starts at the creation value.
            last_notified_value: initial,
        };

        self.objects.insert(id, record.clone());
        self.index_insert(id);
        info!("created object {} '{}'", id, record.object_name);

        Ok(DefinitionApplied {
            record,
            created: true,
        })
    }

    /// Applies a value update and evaluates the COV delta rule.
    ///
    /// The present value, status flags, timestamps, and (when the rule
    /// fires) `last_notified_value` are all written under the same lock,
    /// so a crash between the write and the notification cannot suppress
    /// a future notification.
    pub fn apply_value(
        &mut self,
        update: &ValueUpdate,
        offset: u32,
        position: u64,
        now: i64,
    ) -> Result<ValueApplied, RegistryError> {
        let instance = update.object_instance.saturating_add(offset);
        let id = ObjectId::new(update.object_type, instance);

        let record = self
            .objects
            .get_mut(&id)
            .ok_or(RegistryError::NotFound(id))?;

        if let Some(applied) = record.stream_position {
            if position <= applied {
                debug!(
                    "value for {} at position {} already applied (at {})",
                    id, position, applied
                );
                return Ok(ValueApplied {
                    record: record.clone(),
                    cov: None,
                    replayed: true,
                });
            }
        }

        let mut value = update
            .present_value
            .coerce(record.value_kind)
            .ok_or(RegistryError::KindMismatch {
                id,
                expected: record.value_kind,
                got: update.present_value.kind(),
            })?;

        if record.object_type.is_multi_state() {
            let v = match value {
                Value::Unsigned(v) => v,
                _ => 0,
            };
            if v < 1 || (record.state_count > 0 && v > record.state_count) {
                return Err(RegistryError::OutOfRange {
                    id,
                    value,
                    reason: format!("multi-state range is 1..={}", record.state_count),
                });
            }
        } else if let Value::Real(v) = value {
            let below = record.min_value.filter(|min| v < *min);
            let above = record.max_value.filter(|max| v > *max);
            if below.is_some() || above.is_some() {
                if self.clamp_out_of_range {
                    let clamped = below.or(above).unwrap_or(v);
                    debug!("clamping {} update {} to {}", id, v, clamped);
                    value = Value::Real(clamped);
                } else {
                    return Err(RegistryError::OutOfRange {
                        id,
                        value,
                        reason: format!(
                            "outside [{}, {}]",
                            record.min_value.unwrap_or(f32::NEG_INFINITY),
                            record.max_value.unwrap_or(f32::INFINITY)
                        ),
                    });
                }
            }
        }

        let previous_notified = record.last_notified_value;
        let flags_changed = match update.status_flags {
            Some(flags) => flags != record.status_flags,
            None => false,
        };

        record.present_value = value;
        if let Some(flags) = update.status_flags {
            record.status_flags = flags;
        }
        if let Some(reliability) = update.reliability {
            record.reliability = reliability;
        }
        if let Some(event_state) = update.event_state {
            record.event_state = event_state;
        }
        record.last_update = update
            .source_timestamp_ms
            .map(|ms| ms / 1000)
            .unwrap_or(now);
        record.stream_position = Some(position);

        let notify = flags_changed
            || cov_delta_exceeded(record.value_kind, previous_notified, value, record.cov_increment);

        let cov = if notify {
            record.last_notified_value = value;
            Some(CovTrigger {
                previous_value: previous_notified,
                flags_changed,
            })
        } else {
            None
        };

        Ok(ValueApplied {
            record: record.clone(),
            cov,
            replayed: false,
        })
    }

    /// Removes an object. A delete for an unknown object is a no-op so
    /// redelivered deletes stay idempotent.
    pub fn apply_delete(&mut self, delete: &ObjectDelete, offset: u32) -> DeleteApplied {
        let instance = delete.object_instance.saturating_add(offset);
        let id = ObjectId::new(delete.object_type, instance);

        let existed = self.objects.remove(&id).is_some();
        if existed {
            if let Some(set) = self.by_type.get_mut(&id.object_type) {
                set.remove(&id.instance);
            }
            if delete.reason.is_empty() {
                info!("deleted object {}", id);
            } else {
                info!("deleted object {}: {}", id, delete.reason);
            }
        } else {
            warn!("delete for unknown object {}", id);
        }

        DeleteApplied { id, existed }
    }

    /// Patches the device record per present field and returns the new
    /// state together with the patch that was applied.
    pub fn apply_device_config(&mut self, config: &DeviceConfigMsg) -> (DeviceState, DevicePatch) {
        let patch = DevicePatch {
            name: config.device_name.clone(),
            description: config.device_description.clone(),
            location: config.location.clone(),
            model_name: config.model_name.clone(),
            vendor_name: config.vendor_name.clone(),
            application_software_version: config.application_software_version.clone(),
        };

        if let Some(name) = &patch.name {
            self.device.name = name.clone();
        }
        if let Some(description) = &patch.description {
            self.device.description = description.clone();
        }
        if let Some(location) = &patch.location {
            self.device.location = location.clone();
        }
        if let Some(model_name) = &patch.model_name {
            self.device.model_name = model_name.clone();
        }
        if let Some(vendor_name) = &patch.vendor_name {
            self.device.vendor_name = vendor_name.clone();
        }
        if let Some(version) = &patch.application_software_version {
            self.device.application_software_version = version.clone();
        }

        (self.device.clone(), patch)
    }

    /// Installs a record recovered from the cache, keeping whichever
    /// stream position is newer if the object already exists.
    pub fn insert_recovered(&mut self, record: ObjectRecord) {
        let id = record.id();
        match self.objects.get(&id) {
            Some(existing) if existing.stream_position >= record.stream_position => {}
            _ => {
                self.index_insert(id);
                self.objects.insert(id, record);
            }
        }
    }
}

/// The COV delta rule.
///
/// Numeric kinds compare `|new - previous| >= increment` when the
/// increment is positive and plain inequality when it is zero; booleans
/// notify on any change.
fn cov_delta_exceeded(kind: ValueKind, previous: Value, new: Value, increment: f32) -> bool {
    match kind {
        ValueKind::Boolean => previous != new,
        _ => {
            if increment > 0.0 {
                (new.as_f64() - previous.as_f64()).abs() >= f64::from(increment)
            } else {
                previous != new
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StatusFlags;

    fn device() -> DeviceState {
        DeviceState {
            instance: 500,
            name: "GW".to_string(),
            description: String::new(),
            location: String::new(),
            vendor_id: 0,
            vendor_name: String::new(),
            model_name: String::new(),
            application_software_version: String::new(),
        }
    }

    fn definition(increment: f32, initial: f32) -> ObjectDefinition {
        ObjectDefinition {
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
            inactive_text: "Inactive".to_string(),
            active_text: "Active".to_string(),
            supports_priority_array: false,
            initial_value: Some(Value::Real(initial)),
        }
    }

    fn update(value: f32) -> ValueUpdate {
        ValueUpdate {
            object_type: ObjectType::AnalogInput,
            object_instance: 1,
            present_value: Value::Real(value),
            quality: "good".to_string(),
            status_flags: None,
            priority: None,
            reliability: None,
            event_state: None,
            source_timestamp_ms: None,
        }
    }

    #[test]
    fn definition_creates_and_refreshes() {
        let mut registry = ObjectRegistry::new(device(), false);
        let applied = registry
            .apply_definition(&definition(0.5, 20.0), 0, "s1", 10, 100)
            .unwrap();
        assert!(applied.created);
        assert_eq!(applied.record.present_value, Value::Real(20.0));
        assert_eq!(applied.record.last_notified_value, Value::Real(20.0));

        // Redefinition keeps the live value, refreshes metadata.
        registry.apply_value(&update(25.0), 0, 11, 101).unwrap();
        let mut def = definition(1.0, 20.0);
        def.object_name = "T2".to_string();
        let applied = registry.apply_definition(&def, 0, "s1", 12, 102).unwrap();
        assert!(!applied.created);
        assert_eq!(applied.record.object_name, "T2");
        assert_eq!(applied.record.present_value, Value::Real(25.0));
        assert_eq!(applied.record.cov_increment, 1.0);
    }

    #[test]
    fn definition_kind_mismatch_is_rejected() {
        let mut registry = ObjectRegistry::new(device(), false);
        registry
            .apply_definition(&definition(0.0, 1.0), 0, "s1", 1, 0)
            .unwrap();

        let mut def = definition(0.0, 1.0);
        def.value_kind = ValueKind::Unsigned;
        def.initial_value = None;
        assert!(matches!(
            registry.apply_definition(&def, 0, "s1", 2, 0),
            Err(RegistryError::KindMismatch { .. })
        ));
    }

    #[test]
    fn offset_shifts_instance() {
        let mut registry = ObjectRegistry::new(device(), false);
        let mut def = definition(0.0, 1.0);
        def.object_instance = 5;
        let applied = registry.apply_definition(&def, 1000, "s1", 1, 0).unwrap();
        assert_eq!(applied.record.object_instance, 1005);
        assert!(registry
            .get(ObjectId::new(ObjectType::AnalogInput, 1005))
            .is_some());
    }

    #[test]
    fn value_below_increment_does_not_notify() {
        let mut registry = ObjectRegistry::new(device(), false);
        registry
            .apply_definition(&definition(0.5, 20.0), 0, "s1", 10, 0)
            .unwrap();

        let applied = registry.apply_value(&update(20.4), 0, 11, 0).unwrap();
        assert!(applied.cov.is_none());
        assert_eq!(applied.record.present_value, Value::Real(20.4));
        assert_eq!(applied.record.last_notified_value, Value::Real(20.0));
        assert_eq!(applied.record.stream_position, Some(11));
    }

    #[test]
    fn value_at_increment_notifies_and_moves_baseline() {
        let mut registry = ObjectRegistry::new(device(), false);
        registry
            .apply_definition(&definition(0.5, 20.0), 0, "s1", 10, 0)
            .unwrap();
        registry.apply_value(&update(20.4), 0, 11, 0).unwrap();

        let applied = registry.apply_value(&update(20.6), 0, 12, 0).unwrap();
        let trigger = applied.cov.expect("delta must notify");
        assert_eq!(trigger.previous_value, Value::Real(20.0));
        assert!(!trigger.flags_changed);
        assert_eq!(applied.record.last_notified_value, Value::Real(20.6));
    }

    #[test]
    fn zero_increment_notifies_on_any_change() {
        let mut registry = ObjectRegistry::new(device(), false);
        registry
            .apply_definition(&definition(0.0, 20.0), 0, "s1", 10, 0)
            .unwrap();

        assert!(registry
            .apply_value(&update(20.0001), 0, 11, 0)
            .unwrap()
            .cov
            .is_some());
        // Same value again: no delta.
        assert!(registry
            .apply_value(&update(20.0001), 0, 12, 0)
            .unwrap()
            .cov
            .is_none());
    }

    #[test]
    fn status_flag_change_always_notifies() {
        let mut registry = ObjectRegistry::new(device(), false);
        registry
            .apply_definition(&definition(10.0, 20.0), 0, "s1", 10, 0)
            .unwrap();

        let mut upd = update(20.1);
        upd.status_flags = Some(StatusFlags {
            in_alarm: true,
            ..Default::default()
        });
        let applied = registry.apply_value(&upd, 0, 11, 0).unwrap();
        let trigger = applied.cov.expect("flag change must notify");
        assert!(trigger.flags_changed);
        assert!(applied.record.status_flags.in_alarm);
    }

    #[test]
    fn replayed_position_is_a_no_op() {
        let mut registry = ObjectRegistry::new(device(), false);
        registry
            .apply_definition(&definition(0.5, 20.0), 0, "s1", 10, 0)
            .unwrap();
        registry.apply_value(&update(20.6), 0, 12, 0).unwrap();

        let replay = registry.apply_value(&update(20.6), 0, 12, 0).unwrap();
        assert!(replay.replayed);
        assert!(replay.cov.is_none());
        assert_eq!(replay.record.present_value, Value::Real(20.6));
    }

    #[test]
    fn replay_at_position_zero_is_detected() {
        let mut registry = ObjectRegistry::new(device(), false);
        let applied = registry
            .apply_definition(&definition(0.0, 20.0), 0, "s1", 0, 0)
            .unwrap();
        assert!(applied.created);
        assert_eq!(applied.record.stream_position, Some(0));

        // A redelivered definition at position 0 must not refresh metadata.
        let mut def = definition(0.0, 20.0);
        def.object_name = "T2".to_string();
        let redelivered = registry.apply_definition(&def, 0, "s1", 0, 0).unwrap();
        assert!(!redelivered.created);
        assert_eq!(redelivered.record.object_name, "T");

        // A value update at position 0 for state produced at position 0 is
        // a replay: no write, no notification.
        let replay = registry.apply_value(&update(25.0), 0, 0, 0).unwrap();
        assert!(replay.replayed);
        assert!(replay.cov.is_none());
        assert_eq!(replay.record.present_value, Value::Real(20.0));
    }

    #[test]
    fn update_for_missing_object_is_not_found() {
        let mut registry = ObjectRegistry::new(device(), false);
        assert_eq!(
            registry.apply_value(&update(1.0), 0, 1, 0),
            Err(RegistryError::NotFound(ObjectId::new(
                ObjectType::AnalogInput,
                1
            )))
        );
    }

    #[test]
    fn multi_state_range_is_enforced() {
        let mut registry = ObjectRegistry::new(device(), false);
        let def = ObjectDefinition {
            object_type: ObjectType::MultiStateValue,
            object_instance: 1,
            object_name: "Mode".to_string(),
            description: String::new(),
            value_kind: ValueKind::Unsigned,
            units: 95,
            units_text: String::new(),
            cov_increment: 0.0,
            min_value: None,
            max_value: None,
            state_texts: vec!["Off".into(), "Low".into(), "High".into()],
            inactive_text: String::new(),
            active_text: String::new(),
            supports_priority_array: false,
            initial_value: Some(Value::Unsigned(1)),
        };
        registry.apply_definition(&def, 0, "s1", 1, 0).unwrap();

        let mut upd = update(0.0);
        upd.object_type = ObjectType::MultiStateValue;
        upd.present_value = Value::Unsigned(3);
        assert!(registry.apply_value(&upd, 0, 2, 0).is_ok());

        upd.present_value = Value::Unsigned(4);
        assert!(matches!(
            registry.apply_value(&upd, 0, 3, 0),
            Err(RegistryError::OutOfRange { .. })
        ));
    }

    #[test]
    fn min_max_rejects_or_clamps() {
        let mut strict = ObjectRegistry::new(device(), false);
        let mut def = definition(0.0, 20.0);
        def.min_value = Some(0.0);
        def.max_value = Some(50.0);
        strict.apply_definition(&def, 0, "s1", 1, 0).unwrap();
        assert!(matches!(
            strict.apply_value(&update(60.0), 0, 2, 0),
            Err(RegistryError::OutOfRange { .. })
        ));

        let mut clamping = ObjectRegistry::new(device(), true);
        clamping.apply_definition(&def, 0, "s1", 1, 0).unwrap();
        let applied = clamping.apply_value(&update(60.0), 0, 2, 0).unwrap();
        assert_eq!(applied.record.present_value, Value::Real(50.0));
    }

    #[test]
    fn delete_is_idempotent() {
        let mut registry = ObjectRegistry::new(device(), false);
        registry
            .apply_definition(&definition(0.0, 1.0), 0, "s1", 1, 0)
            .unwrap();

        let delete = ObjectDelete {
            object_type: ObjectType::AnalogInput,
            object_instance: 1,
            reason: "decommissioned".to_string(),
        };
        assert!(registry.apply_delete(&delete, 0).existed);
        assert!(!registry.apply_delete(&delete, 0).existed);
        assert!(registry.is_empty());
        assert_eq!(registry.count_by_type(ObjectType::AnalogInput), 0);
    }

    #[test]
    fn device_config_patches_fields() {
        let mut registry = ObjectRegistry::new(device(), false);
        let (state, patch) = registry.apply_device_config(&DeviceConfigMsg {
            device_name: Some("Gateway North".to_string()),
            location: Some("Hall 3".to_string()),
            ..Default::default()
        });
        assert_eq!(state.name, "Gateway North");
        assert_eq!(state.location, "Hall 3");
        assert!(!patch.is_empty());
        assert_eq!(registry.device().name, "Gateway North");
    }

    #[test]
    fn recovery_keeps_newest_position() {
        let mut registry = ObjectRegistry::new(device(), false);
        let applied = registry
            .apply_definition(&definition(0.0, 1.0), 0, "s1", 10, 0)
            .unwrap();

        let mut stale = applied.record.clone();
        stale.stream_position = Some(5);
        stale.present_value = Value::Real(99.0);
        registry.insert_recovered(stale);
        assert_eq!(
            registry.get(applied.record.id()).unwrap().present_value,
            Value::Real(1.0)
        );
    }
}
