use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

#[cfg(feature = "test-support")]
use mockall::automock;

use crate::variant::Value;

/// One display row of [`OpcProvider::read_tag_values`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagValue {
    /// Item id as requested, for example `Plant.Line1.Speed`.
    pub tag_id: String,
    /// Value rendered with `Display`, or `Error`.
    pub value: String,
    /// OPC quality label (`"Good"`, `"Bad"` or `"Uncertain"`), or the
    /// failure description when the item could not be read.
    pub quality: String,
    /// Source timestamp in local time; empty for failed rows.
    pub timestamp: String,
}

/// Outcome of [`OpcProvider::write_tag_value`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteResult {
    pub tag_id: String,
    pub success: bool,
    /// Code and hint of the per-item failure.
    pub error: Option<String>,
}

/// Request/response access to OPC DA servers for async callers.
///
/// Implemented by [`OpcDaClient`](crate::OpcDaClient), which serializes
/// every call onto a dedicated thread that owns the COM runtime.
#[cfg_attr(feature = "test-support", automock)]
#[async_trait]
pub trait OpcProvider: Send + Sync {
    /// ProgIDs of the DA servers registered on `host` (empty for local).
    ///
    /// # Errors
    /// Fails when the server list object cannot be activated.
    async fn list_servers(&self, host: &str) -> Result<Vec<String>>;

    /// Collects up to `max_tags` item ids. `progress` counts ids as they
    /// are found and `tags_sink` receives each one immediately.
    ///
    /// # Errors
    /// Fails when the server cannot be reached or offers no browse
    /// interface.
    async fn browse_tags(
        &self,
        server: &str,
        max_tags: usize,
        progress: Arc<AtomicUsize>,
        tags_sink: Arc<std::sync::Mutex<Vec<String>>>,
    ) -> Result<Vec<String>>;

    /// Reads `tag_ids` from the device, one row per tag in order. Tags
    /// that cannot be added or read get an error row.
    ///
    /// # Errors
    /// Fails only when the connection or the whole batch fails.
    async fn read_tag_values(&self, server: &str, tag_ids: Vec<String>) -> Result<Vec<TagValue>>;

    /// Writes one value; a rejected item is a `WriteResult` with
    /// `success == false`.
    ///
    /// # Errors
    /// Fails when the connection fails or `value` has no wire encoding.
    async fn write_tag_value(&self, server: &str, tag_id: &str, value: Value) -> Result<WriteResult>;
}
