//! Master side of the control channel.
//!
//! Registers the configuration, datastore and aggregator services on a Unix
//! socket. Every worker pipeline holds its own connection; requests on one
//! connection are answered in order.

use super::framing::{read_message, write_message};
use super::protocol::*;
use crate::config::Config;
use crate::datastore::StaticDatastore;
use crate::error::{MeshError, MeshResult};
use crate::stats::{Aggregator, Stat};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::{JoinHandle, JoinSet};

/// Services exposed to workers.
#[derive(Clone)]
pub struct ControlServices {
    pub config: Arc<Config>,
    pub datastore: StaticDatastore,
    pub aggregator: Arc<Aggregator>,
}

/// A running control server. Dropping it stops accepting and closes every
/// open connection.
pub struct ControlServer {
    path: PathBuf,
    task: Option<JoinHandle<()>>,
}

impl ControlServer {
    /// Bind `path` (removing a stale socket) and start serving.
    pub fn bind(path: &Path, services: ControlServices) -> MeshResult<Self> {
        if path.exists() {
            std::fs::remove_file(path).map_err(|e| {
                MeshError::Control(format!(
                    "Failed to remove stale socket {}: {}",
                    path.display(),
                    e
                ))
            })?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(path).map_err(|e| {
            MeshError::Control(format!("Failed to bind {}: {}", path.display(), e))
        })?;
        log::info!("Control channel listening on {}", path.display());

        let task = tokio::spawn(accept_loop(listener, services));
        Ok(Self {
            path: path.to_path_buf(),
            task: Some(task),
        })
    }

    /// Socket path workers dial.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop serving and remove the socket file.
    pub async fn stop(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        self.remove_socket();
    }

    fn remove_socket(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Failed to remove {}: {}", self.path.display(), e);
            }
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            self.remove_socket();
        }
    }
}

async fn accept_loop(listener: UnixListener, services: ControlServices) {
    // Connection tasks live in the set so aborting the loop aborts them too.
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let services = services.clone();
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(stream, services).await {
                            log::debug!("Control connection closed: {}", e);
                        }
                    });
                }
                Err(e) => log::error!("Control accept error: {}", e),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

async fn handle_connection(mut stream: UnixStream, services: ControlServices) -> MeshResult<()> {
    loop {
        let Some(request) = read_message::<_, Request>(&mut stream).await? else {
            return Ok(());
        };
        let result = handle_request(&request, &services).await;

        let Some(id) = request.id else {
            if let Err(error) = result {
                log::debug!("Notification {} failed: {}", request.method, error.message);
            }
            continue;
        };
        write_message(&mut stream, &Response::new(id, result)).await?;
    }
}

/// Dispatch one request to its service.
pub async fn handle_request(
    request: &Request,
    services: &ControlServices,
) -> Result<serde_json::Value, RpcError> {
    if request.jsonrpc != JSONRPC_VERSION {
        return Err(RpcError::new(
            INVALID_REQUEST,
            format!("Unsupported jsonrpc version: {}", request.jsonrpc),
        ));
    }
    match request.method.as_str() {
        METHOD_SYNC => handle_sync(services),
        METHOD_MAPPING => handle_mapping(request, services).await,
        METHOD_SINK => handle_sink(request, services),
        _ => Err(RpcError::new(
            METHOD_NOT_FOUND,
            format!("Method not found: {}", request.method),
        )),
    }
}

fn handle_sync(services: &ControlServices) -> Result<serde_json::Value, RpcError> {
    serde_json::to_value(services.config.as_ref())
        .map_err(|e| RpcError::new(INTERNAL_ERROR, e.to_string()))
}

async fn handle_mapping(
    request: &Request,
    services: &ControlServices,
) -> Result<serde_json::Value, RpcError> {
    let raw: u32 = params(request)?;
    let ip = decode_address(raw);
    match services.datastore.mapping(ip).await {
        Ok(record) => serde_json::to_value(record)
            .map_err(|e| RpcError::new(INTERNAL_ERROR, e.to_string())),
        Err(MeshError::MappingNotFound(_)) => Err(RpcError::new(
            MAPPING_NOT_FOUND,
            format!("Mapping not found: {}", ip),
        )),
        Err(e) => Err(RpcError::new(INTERNAL_ERROR, e.to_string())),
    }
}

fn handle_sink(
    request: &Request,
    services: &ControlServices,
) -> Result<serde_json::Value, RpcError> {
    let stat: Stat = params(request)?;
    services.aggregator.sink(&stat);
    Ok(serde_json::Value::Null)
}

fn params<T: serde::de::DeserializeOwned>(request: &Request) -> Result<T, RpcError> {
    serde_json::from_value(
        request
            .params
            .clone()
            .ok_or_else(|| RpcError::new(INVALID_PARAMS, "Missing params"))?,
    )
    .map_err(|e| RpcError::new(INVALID_PARAMS, e.to_string()))
}
