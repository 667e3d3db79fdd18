//! The per-subscription apply path.

use super::GatewayCore;
use crate::bacnet::ObjectLayer;
use crate::consumer::{
    ConsumerState, Disposition, EventHandler, NakAction, ReceivedEvent, TransportError,
};
use crate::config::DeviceSubscription;
use crate::decoder::{self, Message};
use crate::health::{
    MSG_DEVICE_CONFIG, MSG_OBJECT_DEFINITION, MSG_OBJECT_DELETE, MSG_VALUE_UPDATE,
};
use crate::types::now_secs;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Decode, apply, mirror, notify, persist cursor; one event at a time.
pub struct ApplyHandler {
    core: Arc<GatewayCore>,
    subscription: DeviceSubscription,
}

impl ApplyHandler {
    pub fn new(core: Arc<GatewayCore>, subscription: DeviceSubscription) -> Self {
        Self { core, subscription }
    }

    /// Applies a decoded message. `Ok(index)` carries the metrics slot of
    /// the message type; `Err` is the disposition to report upstream.
    async fn apply(
        &self,
        envelope: &decoder::DecodedEnvelope,
        position: u64,
    ) -> Result<usize, Disposition> {
        let core = &self.core;
        let offset = self.subscription.object_instance_offset;
        let now = now_secs();

        match &envelope.message {
            Message::ObjectDefinition(def) => {
                let applied = {
                    let mut registry = core.registry.lock().unwrap();
                    registry.apply_definition(def, offset, &envelope.source_id, position, now)
                };
                let applied = match applied {
                    Ok(applied) => applied,
                    Err(e) => {
                        warn!("rejected definition at position {}: {}", position, e);
                        core.metrics.registry_errors.fetch_add(1, Ordering::Relaxed);
                        return Ok(MSG_OBJECT_DEFINITION);
                    }
                };

                if let Err(e) = core.cache.put_object(&applied.record).await {
                    error!("cache mirror for {} failed: {}", applied.record.id(), e);
                    core.metrics.cache_errors.fetch_add(1, Ordering::Relaxed);
                    return Err(Disposition::Failed(NakAction::Retry));
                }

                if let Err(e) = core.bacnet.create_object(&applied.record).await {
                    warn!("BACnet object for {} not created: {}", applied.record.id(), e);
                }
                Ok(MSG_OBJECT_DEFINITION)
            }

            Message::ValueUpdate(update) => {
                let applied = {
                    let mut registry = core.registry.lock().unwrap();
                    registry.apply_value(update, offset, position, now)
                };
                let applied = match applied {
                    Ok(applied) => applied,
                    Err(e) => {
                        warn!("rejected value update at position {}: {}", position, e);
                        core.metrics.registry_errors.fetch_add(1, Ordering::Relaxed);
                        return Ok(MSG_VALUE_UPDATE);
                    }
                };
                let id = applied.record.id();

                // Mirror even a replayed event: after a crash the cache may
                // be behind the recovered registry.
                if let Err(e) = core.cache.put_object(&applied.record).await {
                    error!("cache mirror for {} failed: {}", id, e);
                    core.metrics.cache_errors.fetch_add(1, Ordering::Relaxed);
                    return Err(Disposition::Failed(NakAction::Retry));
                }

                if applied.replayed {
                    debug!("replayed event for {} at position {}", id, position);
                    return Ok(MSG_VALUE_UPDATE);
                }

                if let Err(e) = core
                    .bacnet
                    .update_value(id, &applied.record.present_value, &applied.record.status_flags)
                    .await
                {
                    warn!("BACnet value push for {} failed: {}", id, e);
                }

                if let Some(trigger) = applied.cov {
                    let outcome = core
                        .cov
                        .notify(
                            core.bacnet.as_ref(),
                            &applied.record,
                            trigger.previous_value,
                            trigger.flags_changed,
                            update.priority,
                            core.config.server.device_instance,
                            now,
                        )
                        .await;
                    if outcome.failed > 0 {
                        core.metrics
                            .cov_send_failures
                            .fetch_add(outcome.failed as u64, Ordering::Relaxed);
                    }
                }

                core.cache.publish_change(id).await;
                Ok(MSG_VALUE_UPDATE)
            }

            Message::ObjectDelete(delete) => {
                let applied = {
                    let mut registry = core.registry.lock().unwrap();
                    registry.apply_delete(delete, offset)
                };

                if applied.existed {
                    if let Err(e) = core.bacnet.delete_object(applied.id).await {
                        warn!("BACnet object {} not deleted: {}", applied.id, e);
                    }
                }

                if let Err(e) = core.cache.delete_object(applied.id).await {
                    error!("cache delete for {} failed: {}", applied.id, e);
                    core.metrics.cache_errors.fetch_add(1, Ordering::Relaxed);
                    return Err(Disposition::Failed(NakAction::Retry));
                }

                let cancelled = core.cov.remove_for_object(applied.id);
                if cancelled > 0 {
                    info!(
                        "cancelled {} COV subscription(s) for deleted object {}",
                        cancelled, applied.id
                    );
                }
                Ok(MSG_OBJECT_DELETE)
            }

            Message::DeviceConfig(config) => {
                let (state, patch) = {
                    let mut registry = core.registry.lock().unwrap();
                    registry.apply_device_config(config)
                };

                if !patch.is_empty() {
                    if let Err(e) = core.bacnet.update_device(&patch).await {
                        warn!("BACnet device update failed: {}", e);
                    }
                }

                if let Err(e) = core.cache.put_device(&state).await {
                    error!("device config mirror failed: {}", e);
                    core.metrics.cache_errors.fetch_add(1, Ordering::Relaxed);
                    return Err(Disposition::Failed(NakAction::Retry));
                }
                Ok(MSG_DEVICE_CONFIG)
            }
        }
    }
}

#[async_trait::async_trait]
impl EventHandler for ApplyHandler {
    async fn on_event(&self, event: &ReceivedEvent) -> Disposition {
        let core = &self.core;
        core.metrics.events_received.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        let envelope = match decoder::decode(event.data.as_bytes()) {
            Ok(envelope) => envelope,
            Err(e) => {
                // A malformed event never becomes valid; count it and move
                // the cursor past it.
                warn!(
                    "undecodable event {} at position {}: {}",
                    event.event_id, event.position, e
                );
                core.metrics.decode_errors.fetch_add(1, Ordering::Relaxed);
                return self.finish_processed(event, None, started).await;
            }
        };

        match self.apply(&envelope, event.position).await {
            Ok(message_index) => {
                self.finish_processed(event, Some(message_index), started)
                    .await
            }
            Err(disposition) => {
                core.metrics.events_nakked.fetch_add(1, Ordering::Relaxed);
                disposition
            }
        }
    }

    async fn on_status(&self, subscription_id: &str, state: ConsumerState) {
        if state == ConsumerState::Reconnecting {
            self.core
                .metrics
                .consumer_reconnects
                .fetch_add(1, Ordering::Relaxed);
        }
        self.core
            .consumer_states
            .insert(subscription_id.to_string(), state);
    }

    async fn on_error(&self, subscription_id: &str, error: &TransportError) {
        warn!("subscription {}: {}", subscription_id, error);
    }
}

impl ApplyHandler {
    /// Persists the cursor, then reports success so the consumer acks.
    /// Cursor-before-ack means a crash in between redelivers the event,
    /// and redelivery is idempotent.
    async fn finish_processed(
        &self,
        event: &ReceivedEvent,
        message_index: Option<usize>,
        started: Instant,
    ) -> Disposition {
        let core = &self.core;
        if let Err(e) = core
            .cache
            .put_cursor(&self.subscription.subscription_id, event.position)
            .await
        {
            error!(
                "cursor write for {} failed: {}",
                self.subscription.subscription_id, e
            );
            core.metrics.cache_errors.fetch_add(1, Ordering::Relaxed);
            core.metrics.events_nakked.fetch_add(1, Ordering::Relaxed);
            return Disposition::Failed(NakAction::Retry);
        }

        if let Some(index) = message_index {
            core.metrics.note_processed(index);
        }
        core.metrics.events_acked.fetch_add(1, Ordering::Relaxed);
        core.metrics
            .processing_latency
            .observe(started.elapsed().as_secs_f64() * 1000.0);
        Disposition::Processed
    }
}
