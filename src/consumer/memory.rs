//! In-memory transport binding.
//!
//! Feeds delivery loops from queues held in process memory. Used by the
//! integration tests and by demos that run without an event store.

use super::{NakAction, ReceivedEvent, StreamTransport, TransportError};
use crate::config::DeviceSubscription;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct StreamState {
    /// Sorted by position; events stay here until acked or dropped.
    pending: Vec<ReceivedEvent>,
    parked: Vec<ReceivedEvent>,
}

#[derive(Default)]
pub struct MemoryTransport {
    streams: Mutex<HashMap<String, StreamState>>,
    connects: AtomicU64,
    fail_fetches: AtomicUsize,
    naks: Mutex<Vec<NakAction>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an event with a JSON payload to a stream.
    pub fn push_json(&self, stream: &str, position: u64, payload: serde_json::Value) {
        self.push_event(ReceivedEvent {
            event_id: Uuid::new_v4().to_string(),
            event_type: payload
                .get("messageType")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            stream_id: stream.to_string(),
            position,
            created_ms: None,
            data: payload.to_string(),
            ack_uri: None,
            nack_uri: None,
        });
    }

    pub fn push_event(&self, event: ReceivedEvent) {
        let mut streams = self.streams.lock().unwrap();
        let state = streams.entry(event.stream_id.clone()).or_default();
        state.pending.push(event);
        state.pending.sort_by_key(|e| e.position);
    }

    pub fn pending(&self, stream: &str) -> usize {
        self.streams
            .lock()
            .unwrap()
            .get(stream)
            .map(|s| s.pending.len())
            .unwrap_or(0)
    }

    pub fn parked(&self, stream: &str) -> usize {
        self.streams
            .lock()
            .unwrap()
            .get(stream)
            .map(|s| s.parked.len())
            .unwrap_or(0)
    }

    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    pub fn nak_actions(&self) -> Vec<NakAction> {
        self.naks.lock().unwrap().clone()
    }

    /// Makes the next `n` fetches fail, exercising the reconnect path.
    pub fn fail_next_fetches(&self, n: usize) {
        self.fail_fetches.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl StreamTransport for MemoryTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.connects.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn fetch(
        &self,
        subscription: &DeviceSubscription,
        _from: Option<u64>,
        max: usize,
    ) -> Result<Vec<ReceivedEvent>, TransportError> {
        let remaining = self.fail_fetches.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_fetches.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::Request("injected fetch failure".to_string()));
        }

        // Like a server-side persistent subscription, the queue itself is
        // the cursor; the `from` hint is not consulted.
        let streams = self.streams.lock().unwrap();
        let Some(state) = streams.get(&subscription.stream_name) else {
            return Ok(Vec::new());
        };
        Ok(state.pending.iter().take(max).cloned().collect())
    }

    async fn ack(
        &self,
        subscription: &DeviceSubscription,
        event: &ReceivedEvent,
    ) -> Result<(), TransportError> {
        let mut streams = self.streams.lock().unwrap();
        if let Some(state) = streams.get_mut(&subscription.stream_name) {
            state.pending.retain(|e| e.event_id != event.event_id);
        }
        Ok(())
    }

    async fn nak(
        &self,
        subscription: &DeviceSubscription,
        event: &ReceivedEvent,
        action: NakAction,
    ) -> Result<(), TransportError> {
        self.naks.lock().unwrap().push(action);
        let mut streams = self.streams.lock().unwrap();
        if let Some(state) = streams.get_mut(&subscription.stream_name) {
            match action {
                // Left in the queue; the next fetch redelivers it.
                NakAction::Retry => {}
                NakAction::Skip => {
                    state.pending.retain(|e| e.event_id != event.event_id);
                }
                NakAction::Park => {
                    if let Some(i) = state
                        .pending
                        .iter()
                        .position(|e| e.event_id == event.event_id)
                    {
                        let parked = state.pending.remove(i);
                        state.parked.push(parked);
                    }
                }
            }
        }
        Ok(())
    }
}
