//! Worker side of the control channel.

use super::framing::{read_message, write_message};
use super::protocol::*;
use crate::config::Config;
use crate::error::{MeshError, MeshResult};
use crate::mapping::{Mapping, MappingRecord};
use crate::stats::Stat;
use crate::workers::{MappingResolver, StatSink};
use serde::{de::DeserializeOwned, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Queued stats per process before new ones are dropped.
pub const STAT_CHANNEL_CAPACITY: usize = 4096;

/// One connection to the master's control channel.
#[derive(Debug)]
pub struct ControlClient {
    path: PathBuf,
    stream: Mutex<UnixStream>,
    next_id: AtomicU64,
}

impl ControlClient {
    /// Dial the control channel at `path`.
    pub async fn connect(path: &Path) -> MeshResult<Self> {
        let stream = UnixStream::connect(path).await.map_err(|e| {
            MeshError::Control(format!("Failed to connect to {}: {}", path.display(), e))
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            stream: Mutex::new(stream),
            next_id: AtomicU64::new(1),
        })
    }

    /// Path this client is connected to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Issue a request and wait for its response.
    pub async fn call<P, R>(&self, method: &str, params: Option<P>) -> MeshResult<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let params = params.map(serde_json::to_value).transpose()?;
        let request = Request::call(method, params, id);

        let mut stream = self.stream.lock().await;
        write_message(&mut *stream, &request).await?;
        let response: Response = read_message(&mut *stream)
            .await?
            .ok_or_else(|| MeshError::Control(format!("{}: master closed the channel", method)))?;

        if response.id != id {
            // Frames still queued on this stream belong to other requests.
            match UnixStream::connect(&self.path).await {
                Ok(fresh) => *stream = fresh,
                Err(e) => log::warn!(
                    "Failed to reconnect to {}: {}",
                    self.path.display(),
                    e
                ),
            }
            return Err(MeshError::Control(format!(
                "{}: response id {} does not match request id {}",
                method, response.id, id
            )));
        }
        drop(stream);
        Ok(serde_json::from_value(response.into_result()?)?)
    }

    /// Send a notification; no response is read.
    pub async fn notify<P: Serialize>(&self, method: &str, params: P) -> MeshResult<()> {
        let request = Request::notify(method, serde_json::to_value(params)?);
        let mut stream = self.stream.lock().await;
        write_message(&mut *stream, &request).await
    }

    /// Fetch the master's configuration snapshot.
    pub async fn sync(&self) -> MeshResult<Config> {
        self.call::<(), Config>(METHOD_SYNC, None).await
    }

    /// Fetch the raw record for `private_ip`.
    pub async fn mapping_record(&self, private_ip: Ipv4Addr) -> MeshResult<MappingRecord> {
        match self
            .call(METHOD_MAPPING, Some(encode_address(private_ip)))
            .await
        {
            Err(MeshError::Rpc {
                code: MAPPING_NOT_FOUND,
                ..
            }) => Err(MeshError::MappingNotFound(private_ip.to_string())),
            other => other,
        }
    }

    /// Report one stat.
    pub async fn sink(&self, stat: &Stat) -> MeshResult<()> {
        self.notify(METHOD_SINK, stat).await
    }
}

impl MappingResolver for ControlClient {
    async fn mapping(&self, private_ip: Ipv4Addr) -> MeshResult<Mapping> {
        Mapping::try_from(self.mapping_record(private_ip).await?)
    }
}

/// Non-blocking stat sink shared by every pipeline of a worker.
///
/// Stats are queued to a task that forwards them over its own connection.
/// When the queue is full the stat is dropped.
#[derive(Clone)]
pub struct StatReporter {
    tx: mpsc::Sender<Stat>,
}

impl StatReporter {
    /// Start forwarding stats through `client`. The task ends once every
    /// reporter clone is dropped and the queue is drained, or at the first
    /// failed send; stats offered after that are dropped.
    pub fn spawn(client: ControlClient, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Stat>(capacity.max(1));
        let task = tokio::spawn(async move {
            while let Some(stat) = rx.recv().await {
                if let Err(e) = client.sink(&stat).await {
                    log::warn!("Stat reporting stopped: {}", e);
                    break;
                }
            }
        });
        (Self { tx }, task)
    }
}

impl StatSink for StatReporter {
    fn sink(&self, stat: Stat) {
        if let Err(e) = self.tx.try_send(stat) {
            log::trace!("Stat not queued: {}", e);
        }
    }
}
