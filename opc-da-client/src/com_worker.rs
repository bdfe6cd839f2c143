use crate::com::{Activator, ComRuntime, StatusCode};
use crate::config::ClientConfig;
use crate::discovery::list_servers;
use crate::errors::{ItemError, OpcError, OpcResult};
use crate::group::OpcGroup;
use crate::helpers::{item_error_to_string, tag_value};
use crate::provider::{TagValue, WriteResult};
use crate::records::DataSource;
use crate::server::OpcServer;
use crate::variant::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{mpsc, oneshot};

const READ_GROUP: &str = "opc-da-client-read";
const WRITE_GROUP: &str = "opc-da-client-write";

pub enum ComRequest {
    ListServers {
        host: String,
        reply: oneshot::Sender<OpcResult<Vec<String>>>,
    },
    ReadTagValues {
        server: String,
        tag_ids: Vec<String>,
        reply: oneshot::Sender<OpcResult<Vec<TagValue>>>,
    },
    WriteTagValue {
        server: String,
        tag_id: String,
        value: Value,
        reply: oneshot::Sender<OpcResult<WriteResult>>,
    },
    BrowseTags {
        server: String,
        max_tags: usize,
        progress: Arc<AtomicUsize>,
        tags_sink: Arc<std::sync::Mutex<Vec<String>>>,
        reply: oneshot::Sender<OpcResult<Vec<String>>>,
    },
}

/// A dedicated thread owning the COM runtime and a cache of connected
/// servers, fed through a bounded request channel.
pub struct ComWorker<A: Activator + 'static> {
    pub sender: mpsc::Sender<ComRequest>,
    pub handle: Option<std::thread::JoinHandle<()>>,
    _phantom: std::marker::PhantomData<A>,
}

/// Codes meaning the cached connection is gone (server process died, host
/// unreachable) and a fresh one may succeed.
fn is_connection_error(err: &OpcError) -> bool {
    err.code().is_some_and(|code| {
        [
            StatusCode::RPC_S_SERVER_UNAVAILABLE,
            StatusCode::RPC_S_CALL_FAILED_DNE,
            StatusCode::RPC_S_CALL_FAILED,
            StatusCode::CO_E_SERVER_EXEC_FAILURE,
        ]
        .contains(&code)
    })
}

impl<A: Activator + 'static> ComWorker<A> {
    /// Spawns the worker thread and waits until its runtime is initialized.
    /// The wait is short and synchronous, so this may be called from async
    /// code.
    ///
    /// # Errors
    /// `Internal` when the thread cannot initialize the runtime.
    pub fn start(activator: Arc<A>, config: ClientConfig) -> OpcResult<Self> {
        let (tx, mut rx) = mpsc::channel(32);
        let (init_tx, init_rx) = std::sync::mpsc::sync_channel(1);

        let handle = std::thread::Builder::new()
            .name("opc-com-worker".into())
            .spawn(move || {
                let _runtime = match ComRuntime::new() {
                    Ok(runtime) => {
                        let _ = init_tx.send(Ok(()));
                        runtime
                    }
                    Err(e) => {
                        tracing::error!(error = ?e, "COM worker failed to initialize MTA");
                        let _ = init_tx.send(Err(OpcError::Internal(format!(
                            "COM init failed on worker: {e}"
                        ))));
                        return;
                    }
                };

                let connect = |name: &str| {
                    OpcServer::connect_with(activator.as_ref(), name, "", config.clone())
                };
                let mut cache: HashMap<String, OpcServer> = HashMap::new();

                while let Some(req) = rx.blocking_recv() {
                    match req {
                        ComRequest::ListServers { host, reply } => {
                            let servers = list_servers(activator.as_ref(), &host);
                            if let Ok(s) = &servers {
                                tracing::info!(count = s.len(), "list_servers completed");
                            }
                            let _ = reply.send(servers);
                        }
                        ComRequest::ReadTagValues {
                            server,
                            tag_ids,
                            reply,
                        } => {
                            let result =
                                dispatch_with_retry(&mut cache, &connect, &server, |opc_server| {
                                    handle_read(&server, &tag_ids, opc_server)
                                });
                            let _ = reply.send(result);
                        }
                        ComRequest::WriteTagValue {
                            server,
                            tag_id,
                            value,
                            reply,
                        } => {
                            let result =
                                dispatch_with_retry(&mut cache, &connect, &server, |opc_server| {
                                    handle_write(&server, &tag_id, &value, opc_server)
                                });
                            let _ = reply.send(result);
                        }
                        ComRequest::BrowseTags {
                            server,
                            max_tags,
                            progress,
                            tags_sink,
                            reply,
                        } => {
                            let result =
                                dispatch_with_retry(&mut cache, &connect, &server, |opc_server| {
                                    handle_browse(&server, max_tags, &progress, &tags_sink, opc_server)
                                });
                            let _ = reply.send(result);
                        }
                    }
                }

                for (name, server) in cache.drain() {
                    if let Err(e) = server.disconnect() {
                        tracing::warn!(server = %name, error = ?e, "disconnect on worker exit failed");
                    }
                }
                tracing::debug!("COM worker thread exiting cleanly");
            })
            .map_err(|e| OpcError::Internal(format!("failed to spawn COM worker: {e}")))?;

        init_rx
            .recv()
            .map_err(|_| OpcError::Internal("COM worker thread panicked during init".into()))??;

        tracing::debug!("COM worker thread started");

        Ok(Self {
            sender: tx,
            handle: Some(handle),
            _phantom: std::marker::PhantomData,
        })
    }

    /// Sends a request and waits for its reply.
    ///
    /// # Errors
    /// `Internal` when the worker has stopped; otherwise whatever the
    /// request itself produced.
    pub async fn send_request<F, R>(&self, req_builder: F) -> OpcResult<R>
    where
        F: FnOnce(oneshot::Sender<OpcResult<R>>) -> ComRequest,
    {
        if self
            .handle
            .as_ref()
            .is_some_and(std::thread::JoinHandle::is_finished)
        {
            tracing::error!("COM worker thread panicked or exited unexpectedly");
            return Err(OpcError::Internal("COM worker thread panicked".into()));
        }

        let (tx, rx) = oneshot::channel();
        let req = req_builder(tx);

        self.sender
            .send(req)
            .await
            .map_err(|_| OpcError::Internal("COM worker channel closed (worker stopped)".into()))?;

        rx.await
            .map_err(|_| OpcError::Internal("COM worker shut down during request".into()))?
    }
}

/// Runs `operation` against the cached connection for `server_name`,
/// connecting on a miss. A connection-level failure evicts the entry and
/// the operation is retried once on a fresh connection.
fn dispatch_with_retry<S, C, F, R>(
    cache: &mut HashMap<String, S>,
    connect: &C,
    server_name: &str,
    operation: F,
) -> OpcResult<R>
where
    C: Fn(&str) -> OpcResult<S>,
    F: Fn(&S) -> OpcResult<R>,
{
    let server_ref = match cache.entry(server_name.to_string()) {
        std::collections::hash_map::Entry::Occupied(entry) => {
            tracing::trace!(server = %server_name, "Cache hit");
            entry.into_mut()
        }
        std::collections::hash_map::Entry::Vacant(entry) => {
            tracing::debug!(server = %server_name, "Cache miss, connecting");
            entry.insert(connect(server_name)?)
        }
    };

    match operation(server_ref) {
        Err(e) if is_connection_error(&e) => {
            tracing::warn!(server = %server_name, error = ?e, "Evicting stale connection");
            cache.remove(server_name);
            tracing::debug!(server = %server_name, "Reconnecting");
            let fresh_srv = connect(server_name).map_err(|connect_e| {
                tracing::error!(error = ?connect_e, "Reconnect failed");
                connect_e
            })?;
            let result = operation(&fresh_srv);
            cache.insert(server_name.to_string(), fresh_srv);
            result
        }
        other => other,
    }
}

/// Runs `body` on a temporary group that is removed afterwards, whatever
/// the outcome.
fn with_temporary_group<R>(
    opc_server: &OpcServer,
    name: &str,
    operation: &'static str,
    body: impl FnOnce(&OpcGroup) -> OpcResult<R>,
) -> OpcResult<R> {
    let group = opc_server.groups().add(name)?;
    let result = body(&group);
    if let Err(e) = opc_server.groups().remove(group.server_handle()) {
        tracing::warn!(error = ?e, operation, "Failed to remove OPC group during cleanup");
    }
    result
}

fn handle_read(server_name: &str, tag_ids: &[String], opc_server: &OpcServer) -> OpcResult<Vec<TagValue>> {
    let span = tracing::info_span!(
        "opc.read_tag_values",
        server = %server_name,
        tag_count = tag_ids.len()
    );
    let _enter = span.enter();

    let tag_values = with_temporary_group(opc_server, READ_GROUP, "read_tag_values", |group| {
        let added = group.items().add_items(tag_ids)?;
        let mut rows: Vec<Option<TagValue>> = vec![None; tag_ids.len()];
        let mut server_handles = Vec::new();
        let mut valid_indices = Vec::new();

        for (idx, outcome) in added.iter().enumerate() {
            match outcome {
                Ok(item) => {
                    server_handles.push(item.server_handle);
                    valid_indices.push(idx);
                }
                Err(e) => {
                    tracing::warn!(tag = %tag_ids[idx], code = %e.code(), "read_tag_values: add_items rejected tag");
                    rows[idx] = Some(tag_value(&tag_ids[idx], Err(e)));
                }
            }
        }

        if !server_handles.is_empty() {
            let values = group.sync_read(DataSource::Device, &server_handles)?;
            for (idx, outcome) in valid_indices.into_iter().zip(values) {
                rows[idx] = Some(tag_value(&tag_ids[idx], outcome.as_ref()));
            }
        }

        Ok(rows
            .into_iter()
            .zip(tag_ids)
            .map(|(row, tag_id)| {
                row.unwrap_or_else(|| tag_value(tag_id, Err(&ItemError::from_code(StatusCode::E_FAIL))))
            })
            .collect::<Vec<_>>())
    })?;

    tracing::info!(count = tag_values.len(), "read_tag_values completed");
    Ok(tag_values)
}

fn handle_write(server_name: &str, tag_id: &str, value: &Value, opc_server: &OpcServer) -> OpcResult<WriteResult> {
    let span = tracing::info_span!(
        "opc.write_tag_value",
        server = %server_name,
        tag = %tag_id
    );
    let _enter = span.enter();

    let failed = |message: String| WriteResult {
        tag_id: tag_id.to_string(),
        success: false,
        error: Some(message),
    };

    with_temporary_group(opc_server, WRITE_GROUP, "write_tag_value", |group| {
        let added = group.items().add_items(&[tag_id])?;
        let item = match added.into_iter().next() {
            Some(Ok(item)) => item,
            Some(Err(e)) => {
                tracing::warn!(code = %e.code(), "write_tag_value: failed to add tag to group");
                return Ok(failed(format!("Failed to add tag: {}", item_error_to_string(&e))));
            }
            None => return Err(OpcError::Internal("Server returned empty item results".into())),
        };

        let outcome = group
            .sync_write(&[item.server_handle], std::slice::from_ref(value))?
            .into_iter()
            .next()
            .ok_or_else(|| OpcError::Internal("Server returned empty write errors".into()))?;

        Ok(match outcome {
            Ok(()) => {
                tracing::info!("write_tag_value completed");
                WriteResult {
                    tag_id: tag_id.to_string(),
                    success: true,
                    error: None,
                }
            }
            Err(e) => {
                let msg = item_error_to_string(&e);
                tracing::warn!(error = %msg, "write_tag_value: server rejected write");
                failed(msg)
            }
        })
    })
}

fn handle_browse(
    server_name: &str,
    max_tags: usize,
    progress: &Arc<AtomicUsize>,
    tags_sink: &Arc<std::sync::Mutex<Vec<String>>>,
    opc_server: &OpcServer,
) -> OpcResult<Vec<String>> {
    let span = tracing::info_span!("opc.browse_tags", server = %server_name, max_tags);
    let _enter = span.enter();

    opc_server.browser()?.collect_item_ids(max_tags, |tag| {
        if let Ok(mut sink) = tags_sink.lock() {
            sink.push(tag.to_string());
        }
        progress.fetch_add(1, Ordering::Relaxed);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimServer;
    use std::cell::Cell;

    fn start(sim: &SimServer) -> ComWorker<crate::sim::SimActivator> {
        ComWorker::start(Arc::new(sim.activator()), ClientConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_worker_starts_and_stops() {
        let sim = SimServer::new();
        let worker = tokio::task::spawn_blocking(move || start(&sim)).await.unwrap();
        drop(worker);
    }

    #[tokio::test]
    async fn test_worker_list_servers() {
        let sim = SimServer::new();
        let worker = start(&sim);
        let servers = worker
            .send_request(|reply| ComRequest::ListServers {
                host: "localhost".into(),
                reply,
            })
            .await
            .unwrap();
        assert_eq!(servers, vec![crate::sim::SIM_PROG_ID.to_string()]);
    }

    #[tokio::test]
    async fn test_worker_read_reports_failures_per_tag() {
        let sim = SimServer::new();
        let worker = start(&sim);
        let rows = worker
            .send_request(|reply| ComRequest::ReadTagValues {
                server: crate::sim::SIM_PROG_ID.into(),
                tag_ids: vec!["X.Y".into(), "No.Such.Tag".into()],
                reply,
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].quality, "Good");
        assert_eq!(rows[1].value, "Error");
        // The temporary group is gone again.
        assert_eq!(sim.group_count(), 0);
    }

    #[tokio::test]
    async fn test_worker_write_then_read() {
        let sim = SimServer::new();
        let worker = start(&sim);
        let written = worker
            .send_request(|reply| ComRequest::WriteTagValue {
                server: crate::sim::SIM_PROG_ID.into(),
                tag_id: "X.Y".into(),
                value: Value::I32(42),
                reply,
            })
            .await
            .unwrap();
        assert!(written.success, "{written:?}");
        assert_eq!(sim.tag("X.Y"), Some(Value::I32(42)));

        let rejected = worker
            .send_request(|reply| ComRequest::WriteTagValue {
                server: crate::sim::SIM_PROG_ID.into(),
                tag_id: "Simulation.Ramp".into(),
                value: Value::F64(1.0),
                reply,
            })
            .await
            .unwrap();
        assert!(!rejected.success);
        assert!(rejected.error.unwrap().contains("0xC0040006"));
    }

    #[tokio::test]
    async fn test_worker_browse_reports_progress() {
        let sim = SimServer::new();
        let worker = start(&sim);
        let progress = Arc::new(AtomicUsize::new(0));
        let sink = Arc::new(std::sync::Mutex::new(Vec::new()));
        let tags = worker
            .send_request(|reply| ComRequest::BrowseTags {
                server: crate::sim::SIM_PROG_ID.into(),
                max_tags: 3,
                progress: Arc::clone(&progress),
                tags_sink: Arc::clone(&sink),
                reply,
            })
            .await
            .unwrap();
        assert_eq!(tags.len(), 3);
        assert_eq!(progress.load(Ordering::Relaxed), 3);
        assert_eq!(*sink.lock().unwrap(), tags);
    }

    #[tokio::test]
    async fn test_drop_disconnects_cached_servers() {
        let sim = SimServer::new();
        let worker = start(&sim);
        worker
            .send_request(|reply| ComRequest::ReadTagValues {
                server: crate::sim::SIM_PROG_ID.into(),
                tag_ids: vec!["X.Y".into()],
                reply,
            })
            .await
            .unwrap();
        assert!(sim.live_objects() > 0);

        let ComWorker { sender, handle, .. } = worker;
        drop(sender);
        handle.unwrap().join().unwrap();
        assert_eq!(sim.live_objects(), 0);
        assert_eq!(sim.over_releases(), 0);
    }

    #[test]
    fn test_connection_cache_reuse() {
        let connects = Cell::new(0);
        let connect = |_: &str| {
            connects.set(connects.get() + 1);
            Ok(connects.get())
        };
        let mut cache = HashMap::new();
        for _ in 0..3 {
            let id = dispatch_with_retry(&mut cache, &connect, "srv", |id: &u32| Ok(*id)).unwrap();
            assert_eq!(id, 1);
        }
        assert_eq!(connects.get(), 1);
    }

    #[test]
    fn test_stale_connection_eviction() {
        let connects = Cell::new(0u32);
        let connect = |_: &str| {
            connects.set(connects.get() + 1);
            Ok(connects.get())
        };
        let mut cache = HashMap::new();
        cache.insert("srv".to_string(), 0);
        let result = dispatch_with_retry(&mut cache, &connect, "srv", |id: &u32| {
            if *id == 0 {
                Err(OpcError::com(StatusCode::RPC_S_SERVER_UNAVAILABLE, "Read"))
            } else {
                Ok(*id)
            }
        });
        assert_eq!(result.unwrap(), 1);
        assert_eq!(cache.get("srv"), Some(&1));
    }

    #[test]
    fn test_other_errors_are_not_retried() {
        let connects = Cell::new(0u32);
        let connect = |_: &str| {
            connects.set(connects.get() + 1);
            Ok(connects.get())
        };
        let mut cache = HashMap::new();
        let result: OpcResult<()> = dispatch_with_retry(&mut cache, &connect, "srv", |_: &u32| {
            Err(OpcError::com(StatusCode::E_FAIL, "Read"))
        });
        assert!(result.is_err());
        assert_eq!(connects.get(), 1);
    }

    #[test]
    fn test_connect_failure_is_returned() {
        let connect = |name: &str| -> OpcResult<u32> { Err(OpcError::Connection(name.to_string())) };
        let mut cache = HashMap::new();
        let result = dispatch_with_retry(&mut cache, &connect, "srv", |id: &u32| Ok(*id));
        assert!(matches!(result, Err(OpcError::Connection(_))));
        assert!(cache.is_empty());
    }
}
