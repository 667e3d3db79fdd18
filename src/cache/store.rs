//! Raw key-value operations the mirror is built on.

use super::CacheError;
use async_trait::async_trait;

/// The subset of key-value store operations the gateway relies on.
///
/// Two bindings exist: [`super::RedisStore`] for production and
/// [`super::MemoryStore`] for tests and standalone runs.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Round-trip liveness probe.
    async fn ping(&self) -> Result<(), CacheError>;

    /// How many times the binding reconnected since startup.
    fn reconnects(&self) -> u64 {
        0
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Writes a value and adds `member` to the index set in one batch
    /// (a transaction where the backend supports one).
    async fn set_with_index(
        &self,
        key: &str,
        value: &str,
        index_key: &str,
        member: &str,
    ) -> Result<(), CacheError>;

    /// Deletes a value and removes `member` from the index set.
    async fn delete_with_index(
        &self,
        key: &str,
        index_key: &str,
        member: &str,
    ) -> Result<(), CacheError>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, CacheError>;

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), CacheError>;

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, CacheError>;

    async fn hash_set_all(
        &self,
        key: &str,
        fields: Vec<(String, String)>,
    ) -> Result<(), CacheError>;

    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, String)>, CacheError>;

    /// Fire-and-forget pub/sub signal.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), CacheError>;
}
