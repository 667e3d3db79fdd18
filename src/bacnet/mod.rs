//! BACnet object layer
//!
//! The wire stack (codec, datalink, BACnet/SC session) is an external
//! collaborator; this module defines the seam the rest of the gateway
//! talks through. [`ObjectLayer`] covers object lifecycle and the send
//! primitive for COV notifications; [`BacnetServer`] is the in-process
//! implementation that owns the stack-visible object table and the
//! outbound transmit loop.

mod server;

pub use server::{BacnetServer, ServerStats, StatsSnapshot};

use crate::types::{DevicePatch, MacAddress, ObjectId, ObjectRecord, StatusFlags, Value};
use async_trait::async_trait;

/// BACnet layer error
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BacnetError {
    #[error("BACnet server is not running")]
    NotRunning,

    #[error("outbound queue is full")]
    QueueFull,

    #[error("no stack object {0}")]
    UnknownObject(ObjectId),
}

/// A composed COV notification, ready for the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct CovNotification {
    pub subscriber_process_id: u32,
    pub subscriber_address: MacAddress,
    pub initiating_device: u32,
    pub object_id: ObjectId,
    pub present_value: Value,
    pub status_flags: StatusFlags,
    /// Seconds of subscription lifetime left; 0 for indefinite.
    pub time_remaining: u32,
    pub confirmed: bool,
    pub priority: Option<u8>,
}

/// Object lifecycle and send primitives of the BACnet stack.
#[async_trait]
pub trait ObjectLayer: Send + Sync {
    /// Creates the stack object, or refreshes name/units/value if it
    /// already exists.
    async fn create_object(&self, record: &ObjectRecord) -> Result<(), BacnetError>;

    async fn update_value(
        &self,
        id: ObjectId,
        value: &Value,
        flags: &StatusFlags,
    ) -> Result<(), BacnetError>;

    async fn delete_object(&self, id: ObjectId) -> Result<(), BacnetError>;

    async fn update_device(&self, patch: &DevicePatch) -> Result<(), BacnetError>;

    /// Hands a notification to the datalink. An `Err` means this cycle's
    /// notification is lost; the subscriber is retried on the next delta.
    async fn send_cov_notification(&self, notification: &CovNotification)
        -> Result<(), BacnetError>;
}
