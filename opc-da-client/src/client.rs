use crate::com::{Activator, ComActivator};
use crate::com_worker::{ComRequest, ComWorker};
use crate::config::ClientConfig;
use crate::errors::OpcResult;
use crate::provider::{OpcProvider, TagValue, WriteResult};
use crate::variant::Value;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

/// Concrete [`OpcProvider`] over the interop core.
///
/// Every call is serialized onto a [`ComWorker`] thread, which keeps one
/// connection per server and reconnects once when a cached connection has
/// gone stale.
pub struct OpcDaClient<A: Activator + 'static = ComActivator> {
    pub worker: ComWorker<A>,
}

impl OpcDaClient<ComActivator> {
    /// A client going through the platform runtime.
    ///
    /// # Errors
    /// Fails when the worker cannot initialize the runtime.
    pub fn platform(config: ClientConfig) -> OpcResult<Self> {
        Self::new(ComActivator, config)
    }
}

impl<A: Activator + 'static> OpcDaClient<A> {
    /// Creates a new `OpcDaClient` activating servers through `activator`.
    pub fn new(activator: A, config: ClientConfig) -> OpcResult<Self> {
        tracing::info!("Initializing OpcDaClient...");
        let worker = ComWorker::start(Arc::new(activator), config)?;
        tracing::info!("OpcDaClient initialized successfully");
        Ok(Self { worker })
    }
}

#[async_trait]
impl<A: Activator + 'static> OpcProvider for OpcDaClient<A> {
    async fn list_servers(&self, host: &str) -> Result<Vec<String>> {
        let host_owned = host.to_string();
        Ok(self
            .worker
            .send_request(|reply| ComRequest::ListServers {
                host: host_owned,
                reply,
            })
            .await?)
    }

    async fn browse_tags(
        &self,
        server: &str,
        max_tags: usize,
        progress: Arc<AtomicUsize>,
        tags_sink: Arc<std::sync::Mutex<Vec<String>>>,
    ) -> Result<Vec<String>> {
        let server_owned = server.to_string();
        Ok(self
            .worker
            .send_request(|reply| ComRequest::BrowseTags {
                server: server_owned,
                max_tags,
                progress,
                tags_sink,
                reply,
            })
            .await?)
    }

    async fn read_tag_values(&self, server: &str, tag_ids: Vec<String>) -> Result<Vec<TagValue>> {
        let server_owned = server.to_string();
        Ok(self
            .worker
            .send_request(|reply| ComRequest::ReadTagValues {
                server: server_owned,
                tag_ids,
                reply,
            })
            .await?)
    }

    async fn write_tag_value(&self, server: &str, tag_id: &str, value: Value) -> Result<WriteResult> {
        let server_owned = server.to_string();
        let tag_id_owned = tag_id.to_string();
        Ok(self
            .worker
            .send_request(|reply| ComRequest::WriteTagValue {
                server: server_owned,
                tag_id: tag_id_owned,
                value,
                reply,
            })
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SIM_PROG_ID, SimServer};

    #[tokio::test]
    async fn test_provider_round_trip_through_worker() {
        let sim = SimServer::new();
        let client = OpcDaClient::new(sim.activator(), ClientConfig::default()).unwrap();

        let servers = client.list_servers("").await.unwrap();
        assert_eq!(servers, vec![SIM_PROG_ID]);

        let written = client
            .write_tag_value(SIM_PROG_ID, "Simulation.Text", Value::String("hello".into()))
            .await
            .unwrap();
        assert!(written.success);

        let rows = client
            .read_tag_values(SIM_PROG_ID, vec!["Simulation.Text".into()])
            .await
            .unwrap();
        assert_eq!(rows[0].value, "\"hello\"");
    }

    #[tokio::test]
    async fn test_unknown_server_is_an_error() {
        let sim = SimServer::new();
        let client = OpcDaClient::new(sim.activator(), ClientConfig::default()).unwrap();
        let err = client
            .read_tag_values("Vendor.Missing.1", vec!["X.Y".into()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("0x800401F3"), "{err}");
    }
}
