//! Pipeline Supervisor
//!
//! Owns every component and the order they start and stop in. Startup:
//! cache, registry recovery, BACnet server, consumers (resuming from the
//! cached cursors), COV ticker, health surface. Shutdown walks the same
//! list backwards, consumers first so no new events arrive while the rest
//! drains.
//!
//! The apply path runs on each subscription's delivery loop: decode, apply
//! to the registry under its lock, mirror to the cache, fan out COV, then
//! persist the cursor *before* the ack goes upstream. A crash after the
//! ack therefore redelivers an already-applied event, which the registry's
//! monotonic stream positions turn into a no-op.

mod handler;

pub use handler::ApplyHandler;

use crate::bacnet::{BacnetServer, ObjectLayer};
use crate::cache::{CacheMirror, CacheStore};
use crate::config::GatewayConfig;
use crate::consumer::{
    ConsumerOptions, ConsumerState, EventConsumer, StreamTransport, SubscriptionHandle,
};
use crate::cov::{CovError, CovManager, SubscribeOutcome};
use crate::health::{
    ComponentHealth, ConsumerStatus, GatewaySnapshot, HealthCheck, HealthState, Metrics,
    SnapshotSource,
};
use crate::types::{now_secs, DeviceState, MacAddress, ObjectId, ObjectType, Value};
use crate::registry::ObjectRegistry;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Shared state of a running gateway.
pub struct GatewayCore {
    pub config: GatewayConfig,
    pub cache: CacheMirror,
    pub registry: Mutex<ObjectRegistry>,
    pub cov: CovManager,
    pub bacnet: Arc<BacnetServer>,
    pub metrics: Arc<Metrics>,
    pub consumer_states: DashMap<String, ConsumerState>,
    started_at: Instant,
}

impl GatewayCore {
    /// COV subscribe entry point for the wire side (and tests).
    #[allow(clippy::too_many_arguments)]
    pub fn cov_subscribe(
        &self,
        process_id: u32,
        address: MacAddress,
        object_id: ObjectId,
        confirmed: bool,
        lifetime_seconds: u32,
        increment_override: Option<f32>,
    ) -> Result<SubscribeOutcome, CovError> {
        self.bacnet.note_subscribe_request();
        if self.registry.lock().unwrap().get(object_id).is_none() {
            return Err(CovError::NoSuchObject(object_id));
        }
        self.cov.subscribe(
            process_id,
            address,
            object_id,
            confirmed,
            lifetime_seconds,
            increment_override,
            now_secs(),
        )
    }

    pub fn cov_cancel(&self, process_id: u32, address: MacAddress, object_id: ObjectId) -> bool {
        self.cov.cancel(process_id, address, object_id)
    }

    /// Read-property path: serves the present value from the registry and
    /// feeds the read-latency histogram.
    pub fn read_present_value(&self, object_id: ObjectId) -> Option<Value> {
        let started = Instant::now();
        self.bacnet.note_read_request();
        let value = self
            .registry
            .lock()
            .unwrap()
            .get(object_id)
            .map(|record| record.present_value);
        self.metrics
            .read_latency
            .observe(started.elapsed().as_secs_f64() * 1000.0);
        value
    }
}

impl SnapshotSource for GatewayCore {
    fn snapshot(&self) -> GatewaySnapshot {
        let registry = self.registry.lock().unwrap();
        let objects_by_type = ObjectType::ALL
            .iter()
            .map(|t| (t.to_string(), registry.count_by_type(*t)))
            .filter(|(_, count)| *count > 0)
            .collect();
        let device_name = registry.device().name.clone();
        let objects_total = registry.len();
        drop(registry);

        GatewaySnapshot {
            device_name,
            uptime_seconds: self.started_at.elapsed().as_secs(),
            objects_total,
            objects_by_type,
            cov_subscriptions_active: self.cov.active_count(),
            cache_reconnects: self.cache.store_reconnects(),
            bacnet: self.bacnet.stats(),
            consumers: self
                .consumer_states
                .iter()
                .map(|entry| ConsumerStatus {
                    subscription_id: entry.key().clone(),
                    state: entry.value().as_str().to_string(),
                })
                .collect(),
        }
    }
}

struct CacheCheck(Arc<GatewayCore>);

#[async_trait::async_trait]
impl HealthCheck for CacheCheck {
    fn name(&self) -> &str {
        "cache"
    }

    async fn check(&self) -> ComponentHealth {
        match self.0.cache.ping().await {
            Ok(()) => ComponentHealth::up(),
            Err(e) => ComponentHealth::down(e.to_string()),
        }
    }
}

struct EventStoreCheck(Arc<GatewayCore>);

#[async_trait::async_trait]
impl HealthCheck for EventStoreCheck {
    fn name(&self) -> &str {
        "event-store"
    }

    async fn check(&self) -> ComponentHealth {
        let mut reconnecting = 0;
        let mut stopped = 0;
        let mut total = 0;
        for entry in self.0.consumer_states.iter() {
            total += 1;
            match entry.value() {
                ConsumerState::Reconnecting => reconnecting += 1,
                ConsumerState::Stopped | ConsumerState::Stopping => stopped += 1,
                _ => {}
            }
        }
        if total == 0 {
            ComponentHealth::degraded("no subscriptions started yet")
        } else if stopped > 0 {
            ComponentHealth::down(format!("{stopped} of {total} subscriptions stopped"))
        } else if reconnecting > 0 {
            ComponentHealth::down(format!("{reconnecting} of {total} subscriptions reconnecting"))
        } else {
            ComponentHealth::up()
        }
    }
}

struct BacnetCheck(Arc<GatewayCore>);

#[async_trait::async_trait]
impl HealthCheck for BacnetCheck {
    fn name(&self) -> &str {
        "bacnet"
    }

    async fn check(&self) -> ComponentHealth {
        if self.0.bacnet.is_running() {
            ComponentHealth::up()
        } else {
            ComponentHealth::down("server not running")
        }
    }
}

/// A running gateway; dropping it without `shutdown` aborts its tasks.
pub struct Gateway {
    core: Arc<GatewayCore>,
    cancel: CancellationToken,
    subscriptions: Vec<SubscriptionHandle>,
    background: Vec<tokio::task::JoinHandle<()>>,
    health_addr: Option<SocketAddr>,
}

impl Gateway {
    /// Brings the whole pipeline up in dependency order. Any error here is
    /// fatal; the caller exits with code 1.
    pub async fn start(
        config: GatewayConfig,
        cache_store: Arc<dyn CacheStore>,
        transport: Arc<dyn StreamTransport>,
    ) -> crate::types::Result<Self> {
        config.validate()?;

        let metrics = Arc::new(Metrics::new(now_secs()));
        let cache = CacheMirror::new(cache_store, config.cache.key_prefix.clone());

        // 1. The cache must answer before anything else starts; recovery
        //    and cursors depend on it.
        cache.ping().await?;
        info!("cache connected ({}:{})", config.cache.host, config.cache.port);

        let bacnet = Arc::new(
            BacnetServer::new(&config.server).with_port(config.legacy_transport.port),
        );
        let device = DeviceState {
            instance: config.server.device_instance,
            name: config.server.device_name.clone(),
            description: config.server.device_description.clone(),
            location: config.server.location.clone(),
            vendor_id: config.server.vendor_id,
            vendor_name: config.server.vendor_name.clone(),
            model_name: config.server.model_name.clone(),
            application_software_version: config.server.application_software_version.clone(),
        };
        let mut registry = ObjectRegistry::new(device, config.server.clamp_out_of_range);

        // 2. Rebuild the registry and the stack objects from the mirror.
        let recovered = cache.iterate_objects(None).await?;
        let recovered_count = recovered.len();
        for record in recovered {
            bacnet.create_object(&record).await?;
            registry.insert_recovered(record);
        }
        if recovered_count > 0 {
            info!("recovered {} object(s) from cache", recovered_count);
        }
        if let Some(fields) = cache.get_device().await? {
            let mut patch = crate::types::DevicePatch::default();
            for (field, value) in fields {
                match field.as_str() {
                    "name" if !value.is_empty() => patch.name = Some(value),
                    "description" if !value.is_empty() => patch.description = Some(value),
                    "location" if !value.is_empty() => patch.location = Some(value),
                    "model_name" if !value.is_empty() => patch.model_name = Some(value),
                    "vendor_name" if !value.is_empty() => patch.vendor_name = Some(value),
                    "application_software_version" if !value.is_empty() => {
                        patch.application_software_version = Some(value)
                    }
                    _ => {}
                }
            }
            if !patch.is_empty() {
                registry.apply_device_config(&crate::decoder::DeviceConfigMsg {
                    device_name: patch.name.clone(),
                    device_description: patch.description.clone(),
                    location: patch.location.clone(),
                    model_name: patch.model_name.clone(),
                    vendor_name: patch.vendor_name.clone(),
                    application_software_version: patch.application_software_version.clone(),
                });
                bacnet.update_device(&patch).await?;
            }
        }

        // 3. BACnet server and its transmit loop.
        let cancel = CancellationToken::new();
        let mut background = Vec::new();
        background.push(bacnet.start(cancel.child_token()));

        let core = Arc::new(GatewayCore {
            cov: CovManager::new(config.server.max_cov_subscriptions),
            registry: Mutex::new(registry),
            cache,
            bacnet,
            metrics: Arc::clone(&metrics),
            consumer_states: DashMap::new(),
            started_at: Instant::now(),
            config,
        });

        // 4/5. One delivery loop per enabled subscription, resuming from
        //      the cached cursor.
        let consumer = EventConsumer::new(
            transport,
            ConsumerOptions::from_config(&core.config.event_store),
        );
        let mut subscriptions = Vec::new();
        for device_sub in core.config.enabled_devices() {
            let cursor = core.cache.get_cursor(&device_sub.subscription_id).await?;
            if let Some(position) = cursor {
                info!(
                    "resuming subscription {} from position {}",
                    device_sub.subscription_id, position
                );
            }
            core.consumer_states.insert(
                device_sub.subscription_id.clone(),
                ConsumerState::Disconnected,
            );
            let handler = Arc::new(ApplyHandler::new(Arc::clone(&core), device_sub.clone()));
            subscriptions.push(consumer.subscribe(device_sub.clone(), cursor, handler, &cancel));
        }
        info!("started {} subscription(s)", subscriptions.len());

        // 6. COV lifetime ticker, once per second.
        {
            let core = Arc::clone(&core);
            let tick_cancel = cancel.child_token();
            background.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(1));
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = tick_cancel.cancelled() => break,
                        _ = interval.tick() => {
                            core.cov.tick(1);
                        }
                    }
                }
            }));
        }

        // Periodic status line, the unattended-operation heartbeat.
        {
            let core = Arc::clone(&core);
            let status_cancel = cancel.child_token();
            background.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(60));
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                interval.tick().await; // immediate first tick
                loop {
                    tokio::select! {
                        _ = status_cancel.cancelled() => break,
                        _ = interval.tick() => {
                            let stats = core.bacnet.stats();
                            info!(
                                "status: objects={}, cov_subscriptions={}, notifications={}, events_processed={}",
                                stats.objects_total,
                                core.cov.active_count(),
                                stats.cov_notifications_sent,
                                core.metrics.processed_total(),
                            );
                        }
                    }
                }
            }));
        }

        // Health/metrics surface.
        let health_addr = {
            let state = HealthState {
                metrics,
                checks: Arc::new(vec![
                    Box::new(CacheCheck(Arc::clone(&core))) as Box<dyn HealthCheck>,
                    Box::new(EventStoreCheck(Arc::clone(&core))) as Box<dyn HealthCheck>,
                    Box::new(BacnetCheck(Arc::clone(&core))) as Box<dyn HealthCheck>,
                ]),
                source: Arc::clone(&core) as Arc<dyn SnapshotSource>,
            };
            let bind = format!(
                "{}:{}",
                core.config.health.bind_address, core.config.health.port
            );
            let listener = TcpListener::bind(&bind).await.map_err(|e| {
                crate::types::Error::Other(format!("cannot bind health endpoint {bind}: {e}"))
            })?;
            let addr = listener.local_addr().ok();
            let router = crate::health::router(state);
            let serve_cancel = cancel.child_token();
            background.push(tokio::spawn(async move {
                let shutdown = async move { serve_cancel.cancelled().await };
                if let Err(e) = axum::serve(listener, router)
                    .with_graceful_shutdown(shutdown)
                    .await
                {
                    error!("health endpoint failed: {}", e);
                }
            }));
            if let Some(addr) = addr {
                info!("health endpoint listening on http://{}", addr);
            }
            addr
        };

        Ok(Self {
            core,
            cancel,
            subscriptions,
            background,
            health_addr,
        })
    }

    pub fn core(&self) -> Arc<GatewayCore> {
        Arc::clone(&self.core)
    }

    pub fn health_addr(&self) -> Option<SocketAddr> {
        self.health_addr
    }

    /// Orderly shutdown: consumers first (no new events), then the BACnet
    /// server, ticker, health surface, and finally the cache connection
    /// goes away with the core.
    pub async fn shutdown(self) {
        info!("shutting down");

        for handle in self.subscriptions {
            handle.unsubscribe().await;
        }

        self.core.bacnet.stop();
        self.cancel.cancel();

        for task in self.background {
            if let Err(e) = task.await {
                warn!("background task ended abnormally: {}", e);
            }
        }

        info!("shutdown complete");
    }
}
