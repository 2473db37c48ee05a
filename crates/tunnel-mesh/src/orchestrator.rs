//! Master process: hosts the control services, provisions every device and
//! socket queue, and hands each worker its share by descriptor inheritance.
//!
//! Workers are not restarted. An exited worker is logged and its queues stay
//! idle until the master is restarted.

use crate::config::Config;
use crate::control::{ControlServer, ControlServices};
use crate::datastore::StaticDatastore;
use crate::device::{configure_interface, TunQueues};
use crate::error::MeshResult;
use crate::lock::MasterLock;
use crate::process::{kill, spawn_worker, terminate, worker_binary};
use crate::queues::QueueSet;
use crate::signal::wait_for_shutdown;
use crate::socket::UdpQueues;
use crate::stats::Aggregator;
use anyhow::{anyhow, bail, Context, Result};
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::task::JoinSet;

/// Run the master until SIGINT/SIGTERM, then stop the workers and tear the
/// control services down.
pub async fn run_master(config: Config) -> Result<()> {
    config.validate().context("Invalid configuration")?;
    let _lock = MasterLock::acquire(&config.data_dir)?;
    let binary = worker_binary(&config)?;
    if !binary.exists() {
        bail!("Worker binary {} not found", binary.display());
    }
    let config = Arc::new(config);

    log::info!("[MASTER] tunnel-mesh master starting");
    log::info!(
        "[MASTER]   Workers: {} x {} queue(s)",
        config.workers,
        config.queues_per_worker
    );
    log::info!("[MASTER]   Listen: {}", config.listen_sockaddr());
    log::info!(
        "[MASTER]   Device: {} ({}/{}, MTU {})",
        config.device_name,
        config.private_ip,
        config.network.ip_net().prefix_len(),
        config.mtu
    );
    log::info!(
        "[MASTER]   Public: {}",
        config.public_addresses()
    );

    let datastore = StaticDatastore::new(config.peers.iter().cloned());
    if datastore.is_empty().await {
        log::warn!("[MASTER]   Peers: none, every outgoing packet will be dropped");
    } else {
        log::info!("[MASTER]   Peers: {}", datastore.len().await);
    }
    let aggregator = Arc::new(Aggregator::new(config.stats_interval()));
    aggregator.start();

    let services = ControlServices {
        config: config.clone(),
        datastore: datastore.clone(),
        aggregator: aggregator.clone(),
    };
    let result = match ControlServer::bind(&config.control_socket_path(), services) {
        Ok(server) => {
            let result = supervise(&config, &binary, server.path()).await;
            server.stop().await;
            result
        }
        Err(e) => Err(e).context("Failed to start control channel"),
    };

    aggregator.stop();
    log::info!("[MASTER] stopped");
    result
}

/// Provision the queues, start the workers and wait for a stop signal.
async fn supervise(config: &Config, binary: &Path, control_path: &Path) -> Result<()> {
    let (devices, sockets) = provision(config)
        .await
        .context("Failed to provision queues")?;

    let shutdown = wait_for_shutdown();
    tokio::pin!(shutdown);

    let mut pool = WorkerPool::default();
    let last = devices.len().saturating_sub(1);
    let delay = config.spawn_delay();
    let mut outcome = None;

    for (index, (devices, sockets)) in devices.into_iter().zip(sockets).enumerate() {
        match spawn_worker(binary, control_path, devices, sockets) {
            Ok(child) => pool.add(index, child),
            Err(e) => {
                outcome = Some(Err(anyhow!(e).context(format!("Failed to spawn worker {}", index))));
                break;
            }
        }
        if index < last && !delay.is_zero() {
            tokio::select! {
                signal = &mut shutdown => {
                    log::info!("Received {} while starting workers", signal);
                    outcome = Some(Ok(()));
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    let outcome = match outcome {
        Some(outcome) => outcome,
        None => {
            log::info!("[MASTER] {} worker(s) running", pool.len());
            loop {
                tokio::select! {
                    signal = &mut shutdown => {
                        log::info!("Received {}, stopping workers", signal);
                        break Ok(());
                    }
                    _ = pool.next_exit() => {
                        if pool.is_empty() {
                            break Err(anyhow!("All workers exited"));
                        }
                    }
                }
            }
        }
    };

    pool.shutdown(config.shutdown_grace()).await;
    outcome
}

/// Create the device queues, configure the interface and bind the socket
/// queues, then split both into per-worker sets.
async fn provision(config: &Config) -> MeshResult<(Vec<QueueSet>, Vec<QueueSet>)> {
    let total = config.total_queues();
    let devices = TunQueues::create(&config.device_name, total)?;
    configure_interface(
        &config.device_name,
        config.private_ip,
        config.network.ip_net().prefix_len(),
        config.mtu,
    )
    .await?;
    let sockets = UdpQueues::bind(total, config.listen_sockaddr())?;
    log::info!(
        "Provisioned {} device and {} socket queue(s)",
        devices.len(),
        sockets.len()
    );
    Ok((
        devices.split(config.queues_per_worker)?,
        sockets.split(config.queues_per_worker)?,
    ))
}

type Exit = (usize, u32, io::Result<ExitStatus>);

/// Spawned workers, each awaited by its own task.
#[derive(Default)]
struct WorkerPool {
    exits: JoinSet<Exit>,
    pids: HashMap<usize, u32>,
}

impl WorkerPool {
    fn add(&mut self, index: usize, mut child: Child) {
        let Some(pid) = child.id() else {
            log::warn!("Worker {} exited before it could be tracked", index);
            return;
        };
        self.pids.insert(index, pid);
        self.exits.spawn(async move { (index, pid, child.wait().await) });
    }

    fn len(&self) -> usize {
        self.exits.len()
    }

    fn is_empty(&self) -> bool {
        self.exits.is_empty()
    }

    /// Wait for one worker to exit and log it. Returns false when no worker
    /// is left to wait for.
    async fn next_exit(&mut self) -> bool {
        match self.exits.join_next().await {
            Some(Ok((index, pid, status))) => {
                self.pids.remove(&index);
                match status {
                    Ok(status) if status.success() => {
                        log::info!("Worker {} (pid {}) exited", index, pid)
                    }
                    Ok(status) => {
                        log::warn!("Worker {} (pid {}) exited: {}", index, pid, status)
                    }
                    Err(e) => log::warn!("Failed to wait for worker {} (pid {}): {}", index, pid, e),
                }
                true
            }
            Some(Err(e)) => {
                log::error!("Worker wait task failed: {}", e);
                true
            }
            None => false,
        }
    }

    /// SIGTERM every worker, wait up to `grace`, then SIGKILL the rest.
    async fn shutdown(&mut self, grace: Duration) {
        for (index, &pid) in &self.pids {
            if let Err(e) = terminate(pid) {
                log::warn!("Worker {}: {}", index, e);
            }
        }

        let deadline = tokio::time::Instant::now() + grace;
        while !self.is_empty() {
            if tokio::time::timeout_at(deadline, self.next_exit()).await.is_err() {
                log::warn!(
                    "{} worker(s) still running after {:?}, killing",
                    self.len(),
                    grace
                );
                for (index, &pid) in &self.pids {
                    if let Err(e) = kill(pid) {
                        log::warn!("Worker {}: {}", index, e);
                    }
                }
                while self.next_exit().await {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::process::Command;

    fn sh(script: &str) -> Child {
        Command::new("sh").arg("-c").arg(script).spawn().unwrap()
    }

    #[tokio::test]
    async fn test_pool_reports_exits() {
        let mut pool = WorkerPool::default();
        pool.add(0, sh("exit 0"));
        pool.add(1, sh("exit 3"));
        assert_eq!(pool.len(), 2);

        assert!(pool.next_exit().await);
        assert!(pool.next_exit().await);
        assert!(pool.is_empty());
        assert!(pool.pids.is_empty());
        assert!(!pool.next_exit().await);
    }

    #[tokio::test]
    async fn test_shutdown_terminates_workers() {
        let mut pool = WorkerPool::default();
        pool.add(0, sh("exec sleep 30"));
        pool.add(1, sh("exec sleep 30"));

        let started = tokio::time::Instant::now();
        pool.shutdown(Duration::from_secs(5)).await;
        assert!(pool.is_empty());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_shutdown_kills_stragglers() {
        let mut pool = WorkerPool::default();
        pool.add(0, sh("trap '' TERM; exec sleep 30"));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = tokio::time::Instant::now();
        pool.shutdown(Duration::from_millis(300)).await;
        assert!(pool.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_before_provisioning() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            workers: 0,
            data_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let err = run_master(config).await.unwrap_err();
        assert!(err.to_string().contains("Invalid configuration"));
        assert!(!dir.path().join(crate::lock::LOCK_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn test_missing_worker_binary_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            worker_binary: Some(dir.path().join("missing-worker")),
            ..Config::default()
        };
        let err = run_master(config).await.unwrap_err();
        assert!(err.to_string().contains("not found"));
        assert!(!dir.path().join(crate::config::CONTROL_SOCKET_NAME).exists());
    }
}
