//! Gateway Configuration
//!
//! Loads and validates the JSON configuration document. Section and option
//! names follow the deployed config format; unknown options are ignored so
//! configs can carry forward-compatible fields.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Largest BACnet object instance (22-bit field). A configured instance
/// offset must leave room for the full instance range below `u32::MAX`.
pub const MAX_OBJECT_INSTANCE: u32 = 4_194_303;

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {field}: {reason}")]
    Invalid { field: String, reason: String },
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.into(),
    }
}

/// Top-level configuration document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(rename = "secure-transport", default)]
    pub secure_transport: SecureTransportConfig,
    #[serde(rename = "legacy-transport", default)]
    pub legacy_transport: LegacyTransportConfig,
    #[serde(rename = "event-store", default)]
    pub event_store: EventStoreConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub devices: Vec<DeviceSubscription>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

/// BACnet device identity and COV limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "defaults::device_instance")]
    pub device_instance: u32,
    #[serde(default = "defaults::device_name")]
    pub device_name: String,
    #[serde(default)]
    pub device_description: String,
    #[serde(default = "defaults::vendor_id")]
    pub vendor_id: u16,
    #[serde(default)]
    pub vendor_name: String,
    #[serde(default)]
    pub model_name: String,
    #[serde(default)]
    pub application_software_version: String,
    #[serde(default)]
    pub location: String,
    /// Default COV subscription lifetime in seconds.
    #[serde(default = "defaults::cov_lifetime")]
    pub cov_lifetime: u32,
    #[serde(default = "defaults::max_cov_subscriptions")]
    pub max_cov_subscriptions: usize,
    /// Clamp out-of-range analog updates to min/max instead of rejecting.
    #[serde(default)]
    pub clamp_out_of_range: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            device_instance: defaults::device_instance(),
            device_name: defaults::device_name(),
            device_description: String::new(),
            vendor_id: defaults::vendor_id(),
            vendor_name: String::new(),
            model_name: String::new(),
            application_software_version: String::new(),
            location: String::new(),
            cov_lifetime: defaults::cov_lifetime(),
            max_cov_subscriptions: defaults::max_cov_subscriptions(),
            clamp_out_of_range: false,
        }
    }
}

/// BACnet/SC hub connection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecureTransportConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub hub_uri: String,
    #[serde(default)]
    pub failover_hub_uri: String,
    #[serde(default)]
    pub certificate_file: String,
    #[serde(default)]
    pub private_key_file: String,
    #[serde(default)]
    pub ca_certificate_file: String,
    #[serde(default)]
    pub hub_function_enabled: bool,
}

/// Legacy BACnet/IP datalink
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyTransportConfig {
    #[serde(default = "defaults::bacnet_port")]
    pub port: u16,
    #[serde(default)]
    pub interface: String,
    #[serde(default)]
    pub broadcast_address: String,
}

impl Default for LegacyTransportConfig {
    fn default() -> Self {
        Self {
            port: defaults::bacnet_port(),
            interface: String::new(),
            broadcast_address: String::new(),
        }
    }
}

/// Event-store connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventStoreConfig {
    #[serde(default = "defaults::connection_string")]
    pub connection_string: String,
    #[serde(default = "defaults::yes")]
    pub tls_enabled: bool,
    #[serde(default = "defaults::yes")]
    pub tls_verify_cert: bool,
    #[serde(default)]
    pub tls_ca_file: String,
    #[serde(default = "defaults::reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// -1 retries forever.
    #[serde(default = "defaults::unbounded")]
    pub max_reconnect_attempts: i32,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            connection_string: defaults::connection_string(),
            tls_enabled: true,
            tls_verify_cert: true,
            tls_ca_file: String::new(),
            reconnect_delay_ms: defaults::reconnect_delay_ms(),
            max_reconnect_attempts: -1,
        }
    }
}

/// Key-value cache connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    #[serde(default = "defaults::cache_host")]
    pub host: String,
    #[serde(default = "defaults::cache_port")]
    pub port: u16,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub database: u32,
    #[serde(default = "defaults::key_prefix")]
    pub key_prefix: String,
    #[serde(default = "defaults::connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "defaults::command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            host: defaults::cache_host(),
            port: defaults::cache_port(),
            password: String::new(),
            database: 0,
            key_prefix: defaults::key_prefix(),
            connection_timeout_ms: defaults::connection_timeout_ms(),
            command_timeout_ms: defaults::command_timeout_ms(),
        }
    }
}

/// Where a subscription starts when no cursor is cached
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartFrom {
    #[default]
    Begin,
    End,
    Position,
}

/// One configured stream subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSubscription {
    pub subscription_id: String,
    pub stream_name: String,
    #[serde(default)]
    pub group_name: String,
    #[serde(default)]
    pub start_from: StartFrom,
    #[serde(default)]
    pub start_position: u64,
    #[serde(default)]
    pub object_instance_offset: u32,
    #[serde(default = "defaults::yes")]
    pub enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "defaults::log_level")]
    pub level: String,
    /// Bitmask: 1 = stdout, 2 = file, 4 = syslog.
    #[serde(default = "defaults::log_outputs")]
    pub outputs: u8,
    #[serde(default = "defaults::log_format")]
    pub format: String,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub max_file_size: u64,
    #[serde(default)]
    pub max_backup_files: u32,
    #[serde(default)]
    pub syslog_facility: String,
    #[serde(default = "defaults::yes")]
    pub colorize: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::log_level(),
            outputs: defaults::log_outputs(),
            format: defaults::log_format(),
            file: String::new(),
            max_file_size: 0,
            max_backup_files: 0,
            syslog_facility: String::new(),
            colorize: true,
        }
    }
}

/// Health/metrics HTTP surface
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthConfig {
    #[serde(default = "defaults::health_port")]
    pub port: u16,
    #[serde(default = "defaults::bind_address")]
    pub bind_address: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            port: defaults::health_port(),
            bind_address: defaults::bind_address(),
        }
    }
}

mod defaults {
    pub fn device_instance() -> u32 {
        1
    }
    pub fn device_name() -> String {
        "BACnet Event Gateway".to_string()
    }
    pub fn vendor_id() -> u16 {
        0
    }
    pub fn cov_lifetime() -> u32 {
        300
    }
    pub fn max_cov_subscriptions() -> usize {
        100
    }
    pub fn bacnet_port() -> u16 {
        47808
    }
    pub fn connection_string() -> String {
        "esdb://localhost:2113".to_string()
    }
    pub fn reconnect_delay_ms() -> u64 {
        5000
    }
    pub fn unbounded() -> i32 {
        -1
    }
    pub fn cache_host() -> String {
        "localhost".to_string()
    }
    pub fn cache_port() -> u16 {
        6379
    }
    pub fn key_prefix() -> String {
        "bacnet:".to_string()
    }
    pub fn connection_timeout_ms() -> u64 {
        5000
    }
    pub fn command_timeout_ms() -> u64 {
        1000
    }
    pub fn log_level() -> String {
        "info".to_string()
    }
    pub fn log_outputs() -> u8 {
        1
    }
    pub fn log_format() -> String {
        "text".to_string()
    }
    pub fn health_port() -> u16 {
        9090
    }
    pub fn bind_address() -> String {
        "0.0.0.0".to_string()
    }
    pub fn yes() -> bool {
        true
    }
}

impl GatewayConfig {
    /// Loads and validates a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: GatewayConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled_devices().next().is_none() {
            return Err(invalid("devices", "no enabled subscriptions configured"));
        }

        let mut seen = std::collections::HashSet::new();
        for (i, device) in self.devices.iter().enumerate() {
            let field = format!("devices[{i}]");
            if device.subscription_id.is_empty() {
                return Err(invalid(&field, "subscriptionId must not be empty"));
            }
            if device.stream_name.is_empty() {
                return Err(invalid(&field, "streamName must not be empty"));
            }
            if !seen.insert(device.subscription_id.clone()) {
                return Err(invalid(
                    &field,
                    format!("duplicate subscriptionId '{}'", device.subscription_id),
                ));
            }
            // An offset that cannot host the full 22-bit instance range would
            // wrap u32 for in-range source instances.
            if device
                .object_instance_offset
                .checked_add(MAX_OBJECT_INSTANCE)
                .is_none()
            {
                return Err(invalid(
                    &field,
                    format!(
                        "objectInstanceOffset {} overflows the instance range",
                        device.object_instance_offset
                    ),
                ));
            }
            if device.start_from == StartFrom::Position && device.start_position == 0 {
                return Err(invalid(
                    &field,
                    "startFrom=position requires a startPosition",
                ));
            }
        }

        if self.cache.key_prefix.is_empty() {
            return Err(invalid("cache.keyPrefix", "must not be empty"));
        }

        if !self.event_store.connection_string.starts_with("esdb://")
            && !self.event_store.connection_string.starts_with("http://")
            && !self.event_store.connection_string.starts_with("https://")
        {
            return Err(invalid(
                "event-store.connectionString",
                "expected esdb://, http:// or https:// scheme",
            ));
        }

        match self.logging.format.as_str() {
            "text" | "json" => {}
            other => {
                return Err(invalid(
                    "logging.format",
                    format!("unknown format '{other}'"),
                ));
            }
        }

        Ok(())
    }

    pub fn enabled_devices(&self) -> impl Iterator<Item = &DeviceSubscription> {
        self.devices.iter().filter(|d| d.enabled)
    }

    /// Cache connection URL in the form the client library accepts.
    pub fn cache_url(&self) -> String {
        if self.cache.password.is_empty() {
            format!(
                "redis://{}:{}/{}",
                self.cache.host, self.cache.port, self.cache.database
            )
        } else {
            format!(
                "redis://:{}@{}:{}/{}",
                self.cache.password, self.cache.host, self.cache.port, self.cache.database
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> serde_json::Value {
        serde_json::json!({
            "server": { "deviceInstance": 500100, "deviceName": "GW" },
            "devices": [
                {
                    "subscriptionId": "plant-1",
                    "streamName": "measurements-plant-1",
                    "groupName": "bacnet-gateway",
                    "objectInstanceOffset": 1000
                }
            ]
        })
    }

    #[test]
    fn defaults_fill_in() {
        let config: GatewayConfig = serde_json::from_value(minimal()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.cache.key_prefix, "bacnet:");
        assert_eq!(config.cache.port, 6379);
        assert_eq!(config.health.port, 9090);
        assert_eq!(config.legacy_transport.port, 47808);
        assert_eq!(config.server.cov_lifetime, 300);
        assert_eq!(config.server.max_cov_subscriptions, 100);
        assert_eq!(config.event_store.max_reconnect_attempts, -1);
        assert!(config.devices[0].enabled);
        assert_eq!(config.devices[0].start_from, StartFrom::Begin);
    }

    #[test]
    fn rejects_offset_overflow() {
        let mut doc = minimal();
        doc["devices"][0]["objectInstanceOffset"] =
            serde_json::json!(u32::MAX - MAX_OBJECT_INSTANCE + 1);
        let config: GatewayConfig = serde_json::from_value(doc).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn accepts_largest_safe_offset() {
        let mut doc = minimal();
        doc["devices"][0]["objectInstanceOffset"] =
            serde_json::json!(u32::MAX - MAX_OBJECT_INSTANCE);
        let config: GatewayConfig = serde_json::from_value(doc).unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn rejects_duplicate_subscription_ids() {
        let mut doc = minimal();
        let dup = doc["devices"][0].clone();
        doc["devices"].as_array_mut().unwrap().push(dup);
        let config: GatewayConfig = serde_json::from_value(doc).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_no_enabled_devices() {
        let mut doc = minimal();
        doc["devices"][0]["enabled"] = serde_json::json!(false);
        let config: GatewayConfig = serde_json::from_value(doc).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn cache_url_includes_password() {
        let mut config: GatewayConfig = serde_json::from_value(minimal()).unwrap();
        assert_eq!(config.cache_url(), "redis://localhost:6379/0");
        config.cache.password = "secret".to_string();
        config.cache.database = 2;
        assert_eq!(config.cache_url(), "redis://:secret@localhost:6379/2");
    }

    #[test]
    fn position_start_requires_position() {
        let mut doc = minimal();
        doc["devices"][0]["startFrom"] = serde_json::json!("position");
        let config: GatewayConfig = serde_json::from_value(doc.clone()).unwrap();
        assert!(config.validate().is_err());

        doc["devices"][0]["startPosition"] = serde_json::json!(42);
        let config: GatewayConfig = serde_json::from_value(doc).unwrap();
        config.validate().unwrap();
    }
}
