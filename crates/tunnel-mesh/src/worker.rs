//! Worker process: adopts the queues inherited from the master and runs the
//! pipelines on them until told to stop.

use crate::config::Config;
use crate::control::{ControlClient, StatReporter, STAT_CHANNEL_CAPACITY};
use crate::device::TunQueues;
use crate::error::{MeshError, MeshResult};
use crate::queues::QueueLayout;
use crate::signal::wait_for_shutdown;
use crate::socket::UdpQueues;
use crate::workers::Workers;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

/// Run one worker against the master's control channel at `control_path`.
pub async fn run_worker(control_path: &Path) -> Result<()> {
    let control = ControlClient::connect(control_path)
        .await
        .context("Failed to reach the master")?;
    let config: Arc<Config> = Arc::new(
        control
            .sync()
            .await
            .context("Failed to sync configuration")?,
    );

    let layout = QueueLayout::new(config.queues_per_worker);
    let devices = layout
        .inherit_devices()
        .context("Failed to inherit device queues")?;
    let sockets = layout
        .inherit_sockets()
        .context("Failed to inherit socket queues")?;
    let device = Arc::new(TunQueues::open(config.device_name.clone(), devices)?);
    let socket = Arc::new(UdpQueues::open(sockets)?);

    let resolvers = connect_resolvers(control_path, layout.queues())
        .await
        .context("Failed to open resolver connections")?;
    // The sync connection carries the stats from here on.
    let (reporter, reporter_task) = StatReporter::spawn(control, STAT_CHANNEL_CAPACITY);

    log::info!(
        "[WORKER] pid {} starting {} queue(s) on {} (fds {:?}, public {})",
        std::process::id(),
        layout.queues(),
        device.name(),
        layout.all_fds(),
        config.public_addresses()
    );
    let workers = Workers::start(config.clone(), socket, device, resolvers, reporter)?;

    let signal = wait_for_shutdown().await;
    log::info!("Received {}, stopping pipelines", signal);

    let (socket, device) = workers.stop().await;
    let released = release(socket, device);

    // Every reporter clone went away with the pipelines; let the queue drain.
    let mut reporter_task = reporter_task;
    if tokio::time::timeout(config.shutdown_grace(), &mut reporter_task)
        .await
        .is_err()
    {
        log::warn!("Stat reporter did not drain in time");
        reporter_task.abort();
    }

    released.context("Failed to close queues")?;
    log::info!("[WORKER] pid {} stopped", std::process::id());
    Ok(())
}

/// One `(incoming, outgoing)` client pair per queue.
async fn connect_resolvers(
    control_path: &Path,
    queues: usize,
) -> MeshResult<Vec<(ControlClient, ControlClient)>> {
    let mut resolvers = Vec::with_capacity(queues);
    for _ in 0..queues {
        resolvers.push((
            ControlClient::connect(control_path).await?,
            ControlClient::connect(control_path).await?,
        ));
    }
    Ok(resolvers)
}

/// Close the socket queues, then the device queues.
fn release(socket: Arc<UdpQueues>, device: Arc<TunQueues>) -> MeshResult<()> {
    let mut failures = Vec::new();

    match Arc::try_unwrap(socket) {
        Ok(socket) => {
            if let Err(e) = socket.close() {
                failures.push(e.to_string());
            }
        }
        Err(_) => failures.push("socket queues still in use".to_string()),
    }
    match Arc::try_unwrap(device) {
        Ok(device) => {
            if let Err(e) = device.close() {
                failures.push(e.to_string());
            }
        }
        Err(_) => failures.push("device queues still in use".to_string()),
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(MeshError::Close {
            kind: "worker",
            failures,
        })
    }
}
