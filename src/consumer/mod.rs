//! Event Consumer
//!
//! Durable, ordered, at-least-once delivery from one named stream per
//! subscription. The consumer runs one delivery loop per subscription:
//! fetch a batch, hand each event to the handler synchronously (this is
//! the backpressure mechanism), ack or nak per the handler's disposition,
//! and advance the in-memory cursor. Transport failures move the loop
//! into a reconnect state with exponential backoff.

mod longpoll;
mod memory;
mod transport;

pub use longpoll::LongPollTransport;
pub use memory::MemoryTransport;
pub use transport::{ReceivedEvent, StreamTransport, TransportError};

use crate::config::{DeviceSubscription, StartFrom};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Consumer state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    Ready,
    Delivering,
    Reconnecting,
    Stopping,
    Stopped,
}

impl ConsumerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerState::Disconnected => "disconnected",
            ConsumerState::Connecting => "connecting",
            ConsumerState::Ready => "ready",
            ConsumerState::Delivering => "delivering",
            ConsumerState::Reconnecting => "reconnecting",
            ConsumerState::Stopping => "stopping",
            ConsumerState::Stopped => "stopped",
        }
    }
}

/// Requested backend behavior for a failed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NakAction {
    /// Redeliver after a backend-controlled delay.
    Retry,
    /// Discard the event.
    Skip,
    /// Route to the dead-letter facility.
    Park,
}

impl NakAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            NakAction::Retry => "retry",
            NakAction::Skip => "skip",
            NakAction::Park => "park",
        }
    }
}

/// Handler verdict for one delivered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Processed,
    Failed(NakAction),
}

/// Receives events and lifecycle signals from a delivery loop.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_event(&self, event: &ReceivedEvent) -> Disposition;

    async fn on_status(&self, _subscription_id: &str, _state: ConsumerState) {}

    async fn on_error(&self, subscription_id: &str, error: &TransportError) {
        warn!("subscription {}: {}", subscription_id, error);
    }
}

/// Delivery-loop tuning
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// -1 retries forever.
    pub max_reconnect_attempts: i32,
    pub batch_size: usize,
    /// Idle wait when a fetch returns nothing (long-poll transports wait
    /// server-side and return quickly; this caps the spin).
    pub poll_interval: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_reconnect_attempts: -1,
            batch_size: 10,
            poll_interval: Duration::from_millis(200),
        }
    }
}

impl ConsumerOptions {
    pub fn from_config(config: &crate::config::EventStoreConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.reconnect_delay_ms.max(1)),
            max_reconnect_attempts: config.max_reconnect_attempts,
            ..Self::default()
        }
    }
}

/// Handle to a running delivery loop.
pub struct SubscriptionHandle {
    pub subscription_id: String,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl SubscriptionHandle {
    /// Signals the loop to stop and waits for in-flight work to drain.
    pub async fn unsubscribe(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!("delivery loop for {} panicked: {}", self.subscription_id, e);
        }
    }
}

/// Spawns delivery loops over a shared transport.
pub struct EventConsumer {
    transport: Arc<dyn StreamTransport>,
    options: ConsumerOptions,
}

impl EventConsumer {
    pub fn new(transport: Arc<dyn StreamTransport>, options: ConsumerOptions) -> Self {
        Self { transport, options }
    }

    /// Starts a delivery loop for one subscription.
    ///
    /// `cached_cursor` is the last durably applied position from the cache;
    /// delivery resumes from `max(configured start, cached_cursor + 1)`.
    pub fn subscribe(
        &self,
        config: DeviceSubscription,
        cached_cursor: Option<u64>,
        handler: Arc<dyn EventHandler>,
        parent_cancel: &CancellationToken,
    ) -> SubscriptionHandle {
        let cancel = parent_cancel.child_token();
        let loop_cancel = cancel.clone();
        let transport = Arc::clone(&self.transport);
        let options = self.options.clone();
        let subscription_id = config.subscription_id.clone();

        let task = tokio::spawn(async move {
            delivery_loop(transport, config, cached_cursor, handler, options, loop_cancel).await;
        });

        SubscriptionHandle {
            subscription_id,
            cancel,
            task,
        }
    }
}

/// First position to deliver.
fn resume_position(config: &DeviceSubscription, cached_cursor: Option<u64>) -> Option<u64> {
    let configured = match config.start_from {
        StartFrom::Begin => Some(0),
        StartFrom::Position => Some(config.start_position),
        // "End" means the transport decides; only a cached cursor can
        // override it.
        StartFrom::End => None,
    };
    match (configured, cached_cursor) {
        (Some(configured), Some(cursor)) => Some(configured.max(cursor.saturating_add(1))),
        (None, Some(cursor)) => Some(cursor.saturating_add(1)),
        (configured, None) => configured,
    }
}

fn backoff_delay(options: &ConsumerOptions, attempts: u32) -> Duration {
    let exp = options
        .base_delay
        .saturating_mul(1u32.checked_shl(attempts.min(16)).unwrap_or(u32::MAX));
    let capped = exp.min(options.max_delay);
    // Jitter spreads simultaneous reconnects of multiple subscriptions.
    let jitter_ms = rand::thread_rng().gen_range(0..=capped.as_millis().min(250) as u64);
    capped + Duration::from_millis(jitter_ms)
}

async fn set_state(
    handler: &Arc<dyn EventHandler>,
    subscription_id: &str,
    state: &mut ConsumerState,
    next: ConsumerState,
) {
    if *state != next {
        *state = next;
        debug!("subscription {} -> {}", subscription_id, next.as_str());
        handler.on_status(subscription_id, next).await;
    }
}

async fn delivery_loop(
    transport: Arc<dyn StreamTransport>,
    config: DeviceSubscription,
    cached_cursor: Option<u64>,
    handler: Arc<dyn EventHandler>,
    options: ConsumerOptions,
    cancel: CancellationToken,
) {
    let subscription_id = config.subscription_id.clone();
    let mut state = ConsumerState::Disconnected;
    let mut cursor = resume_position(&config, cached_cursor);
    let mut attempts: u32 = 0;

    info!(
        "subscription {} starting on stream '{}' (resume from {:?})",
        subscription_id, config.stream_name, cursor
    );

    'outer: loop {
        if cancel.is_cancelled() {
            break;
        }

        set_state(&handler, &subscription_id, &mut state, ConsumerState::Connecting).await;
        match transport.connect().await {
            Ok(()) => {
                attempts = 0;
                set_state(&handler, &subscription_id, &mut state, ConsumerState::Ready).await;
            }
            Err(e) => {
                handler.on_error(&subscription_id, &e).await;
                set_state(
                    &handler,
                    &subscription_id,
                    &mut state,
                    ConsumerState::Reconnecting,
                )
                .await;
                if options.max_reconnect_attempts >= 0
                    && attempts >= options.max_reconnect_attempts as u32
                {
                    error!(
                        "subscription {} giving up after {} reconnect attempts",
                        subscription_id, attempts
                    );
                    break;
                }
                let delay = backoff_delay(&options, attempts);
                attempts = attempts.saturating_add(1);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }
        }

        // Fetch/deliver until the transport fails or we are stopped.
        loop {
            if cancel.is_cancelled() {
                break 'outer;
            }

            // Long-poll fetches can sit on the wire for a while; racing
            // against the stop signal keeps shutdown prompt.
            let fetched = tokio::select! {
                _ = cancel.cancelled() => break 'outer,
                fetched = transport.fetch(&config, cursor, options.batch_size) => fetched,
            };
            let batch = match fetched {
                Ok(batch) => batch,
                Err(e) => {
                    handler.on_error(&subscription_id, &e).await;
                    set_state(
                        &handler,
                        &subscription_id,
                        &mut state,
                        ConsumerState::Reconnecting,
                    )
                    .await;
                    if options.max_reconnect_attempts >= 0
                        && attempts >= options.max_reconnect_attempts as u32
                    {
                        error!(
                            "subscription {} giving up after {} reconnect attempts",
                            subscription_id, attempts
                        );
                        break 'outer;
                    }
                    let delay = backoff_delay(&options, attempts);
                    attempts = attempts.saturating_add(1);
                    tokio::select! {
                        _ = cancel.cancelled() => break 'outer,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue 'outer;
                }
            };

            if batch.is_empty() {
                set_state(&handler, &subscription_id, &mut state, ConsumerState::Ready).await;
                tokio::select! {
                    _ = cancel.cancelled() => break 'outer,
                    _ = tokio::time::sleep(options.poll_interval) => {}
                }
                continue;
            }

            set_state(
                &handler,
                &subscription_id,
                &mut state,
                ConsumerState::Delivering,
            )
            .await;

            for event in &batch {
                if cancel.is_cancelled() {
                    break 'outer;
                }

                // Ordering guarantee: never hand out a position at or
                // behind one already delivered in this incarnation.
                if let Some(from) = cursor {
                    if event.position < from {
                        debug!(
                            "subscription {} skipping stale event at {}",
                            subscription_id, event.position
                        );
                        let _ = transport.ack(&config, event).await;
                        continue;
                    }
                }

                match handler.on_event(event).await {
                    Disposition::Processed => {
                        if let Err(e) = transport.ack(&config, event).await {
                            handler.on_error(&subscription_id, &e).await;
                        }
                        cursor = Some(event.position.saturating_add(1));
                    }
                    Disposition::Failed(action) => {
                        if let Err(e) = transport.nak(&config, event, action).await {
                            handler.on_error(&subscription_id, &e).await;
                        }
                        match action {
                            NakAction::Retry => {
                                // Drop the rest of the batch so the retried
                                // event is redelivered in order.
                                debug!(
                                    "subscription {} nak-retry at {}, refetching",
                                    subscription_id, event.position
                                );
                                tokio::select! {
                                    _ = cancel.cancelled() => break 'outer,
                                    _ = tokio::time::sleep(options.poll_interval) => {}
                                }
                                continue 'outer;
                            }
                            NakAction::Skip | NakAction::Park => {
                                cursor = Some(event.position.saturating_add(1));
                            }
                        }
                    }
                }
            }
        }
    }

    set_state(&handler, &subscription_id, &mut state, ConsumerState::Stopping).await;
    set_state(&handler, &subscription_id, &mut state, ConsumerState::Stopped).await;
    info!("subscription {} stopped", subscription_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        seen: Mutex<Vec<u64>>,
        fail_at: Option<u64>,
        action: NakAction,
        failed_once: Mutex<bool>,
    }

    impl Recorder {
        fn new(fail_at: Option<u64>, action: NakAction) -> Self {
            Self {
                seen: Mutex::new(Vec::new()),
                fail_at,
                action,
                failed_once: Mutex::new(false),
            }
        }
    }

    #[async_trait::async_trait]
    impl EventHandler for Recorder {
        async fn on_event(&self, event: &ReceivedEvent) -> Disposition {
            if Some(event.position) == self.fail_at {
                let mut failed = self.failed_once.lock().unwrap();
                if !*failed {
                    *failed = true;
                    return Disposition::Failed(self.action);
                }
            }
            self.seen.lock().unwrap().push(event.position);
            Disposition::Processed
        }
    }

    fn subscription() -> DeviceSubscription {
        DeviceSubscription {
            subscription_id: "test".to_string(),
            stream_name: "stream-1".to_string(),
            group_name: "gw".to_string(),
            start_from: StartFrom::Begin,
            start_position: 0,
            object_instance_offset: 0,
            enabled: true,
        }
    }

    fn options() -> ConsumerOptions {
        ConsumerOptions {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            poll_interval: Duration::from_millis(5),
            ..Default::default()
        }
    }

    async fn wait_for<F: Fn() -> bool>(predicate: F) {
        for _ in 0..200 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn delivers_in_order_and_acks() {
        let transport = Arc::new(MemoryTransport::new());
        for i in 1..=5u64 {
            transport.push_json(
                "stream-1",
                i,
                serde_json::json!({ "n": i }),
            );
        }

        let handler = Arc::new(Recorder::new(None, NakAction::Retry));
        let consumer = EventConsumer::new(transport.clone(), options());
        let cancel = CancellationToken::new();
        let handle = consumer.subscribe(subscription(), None, handler.clone(), &cancel);

        wait_for(|| handler.seen.lock().unwrap().len() == 5).await;
        assert_eq!(*handler.seen.lock().unwrap(), vec![1, 2, 3, 4, 5]);
        wait_for(|| transport.pending("stream-1") == 0).await;

        handle.unsubscribe().await;
    }

    #[tokio::test]
    async fn cached_cursor_skips_already_applied_events() {
        let transport = Arc::new(MemoryTransport::new());
        for i in 1..=4u64 {
            transport.push_json("stream-1", i, serde_json::json!({ "n": i }));
        }

        let handler = Arc::new(Recorder::new(None, NakAction::Retry));
        let consumer = EventConsumer::new(transport.clone(), options());
        let cancel = CancellationToken::new();
        let handle = consumer.subscribe(subscription(), Some(2), handler.clone(), &cancel);

        wait_for(|| handler.seen.lock().unwrap().len() == 2).await;
        assert_eq!(*handler.seen.lock().unwrap(), vec![3, 4]);

        handle.unsubscribe().await;
    }

    #[tokio::test]
    async fn nak_retry_redelivers_in_order() {
        let transport = Arc::new(MemoryTransport::new());
        for i in 1..=3u64 {
            transport.push_json("stream-1", i, serde_json::json!({ "n": i }));
        }

        let handler = Arc::new(Recorder::new(Some(2), NakAction::Retry));
        let consumer = EventConsumer::new(transport.clone(), options());
        let cancel = CancellationToken::new();
        let handle = consumer.subscribe(subscription(), None, handler.clone(), &cancel);

        wait_for(|| handler.seen.lock().unwrap().len() == 3).await;
        // Event 2 failed once, then was redelivered before 3.
        assert_eq!(*handler.seen.lock().unwrap(), vec![1, 2, 3]);

        handle.unsubscribe().await;
    }

    #[tokio::test]
    async fn nak_skip_discards_the_event() {
        let transport = Arc::new(MemoryTransport::new());
        for i in 1..=3u64 {
            transport.push_json("stream-1", i, serde_json::json!({ "n": i }));
        }

        let handler = Arc::new(Recorder::new(Some(2), NakAction::Skip));
        let consumer = EventConsumer::new(transport.clone(), options());
        let cancel = CancellationToken::new();
        let handle = consumer.subscribe(subscription(), None, handler.clone(), &cancel);

        wait_for(|| handler.seen.lock().unwrap().len() == 2).await;
        assert_eq!(*handler.seen.lock().unwrap(), vec![1, 3]);
        assert_eq!(transport.nak_actions(), vec![NakAction::Skip]);

        handle.unsubscribe().await;
    }

    #[tokio::test]
    async fn nak_park_reaches_the_dead_letter_queue() {
        let transport = Arc::new(MemoryTransport::new());
        transport.push_json("stream-1", 1, serde_json::json!({ "n": 1 }));

        let handler = Arc::new(Recorder::new(Some(1), NakAction::Park));
        let consumer = EventConsumer::new(transport.clone(), options());
        let cancel = CancellationToken::new();
        let handle = consumer.subscribe(subscription(), None, handler.clone(), &cancel);

        wait_for(|| transport.parked("stream-1") == 1).await;
        assert_eq!(transport.nak_actions(), vec![NakAction::Park]);

        handle.unsubscribe().await;
    }

    #[tokio::test]
    async fn reconnects_after_transport_failure() {
        let transport = Arc::new(MemoryTransport::new());
        transport.push_json("stream-1", 1, serde_json::json!({ "n": 1 }));
        transport.fail_next_fetches(2);

        let handler = Arc::new(Recorder::new(None, NakAction::Retry));
        let consumer = EventConsumer::new(transport.clone(), options());
        let cancel = CancellationToken::new();
        let handle = consumer.subscribe(subscription(), None, handler.clone(), &cancel);

        wait_for(|| handler.seen.lock().unwrap().len() == 1).await;
        assert!(transport.connect_count() >= 2);

        handle.unsubscribe().await;
    }

    #[test]
    fn resume_position_prefers_the_later_of_cursor_and_config() {
        let mut config = subscription();
        assert_eq!(resume_position(&config, None), Some(0));
        assert_eq!(resume_position(&config, Some(41)), Some(42));

        config.start_from = StartFrom::Position;
        config.start_position = 100;
        assert_eq!(resume_position(&config, Some(41)), Some(100));
        assert_eq!(resume_position(&config, Some(200)), Some(201));

        config.start_from = StartFrom::End;
        assert_eq!(resume_position(&config, None), None);
        assert_eq!(resume_position(&config, Some(7)), Some(8));
    }
}
