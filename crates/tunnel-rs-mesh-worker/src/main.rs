//! tunnel-rs-mesh-worker
//!
//! Started by the master as `tunnel-rs-mesh-worker <control-socket>` with its
//! device and socket queues already open on descriptors 3 and up.

use std::path::PathBuf;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Some(control_path) = std::env::args_os().nth(1).map(PathBuf::from) else {
        log::error!("usage: tunnel-rs-mesh-worker <control-socket>");
        std::process::exit(1);
    };

    if let Err(e) = tunnel_mesh::run_worker(&control_path).await {
        log::error!("Worker failed: {:#}", e);
        std::process::exit(1);
    }
}
