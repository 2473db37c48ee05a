//! Multi-queue encrypted overlay data-plane for tunnel-rs.
//!
//! A node runs one master and a pool of workers:
//! - the **master** hosts the control channel (configuration, mapping
//!   datastore, stats aggregator), creates the TUN and UDP queues and hands
//!   each worker its share by descriptor inheritance
//! - each **worker** runs an incoming and an outgoing pipeline per queue,
//!   sealing every packet with the destination peer's AES-256-GCM key
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────── master ────────────────────────────┐
//! │  ConfigServer.Sync   DatastoreServer.Mapping   AggServer.Sink  │
//! └───────────────┬──────────── unix socket ───────────────────────┘
//!                 │
//! ┌─────────────── worker (fds 3..3+2Q) ──────────────────────────┐
//! │  TUN queue ──► Outgoing ── seal ──► UDP queue ──► peer         │
//! │  TUN queue ◄── Incoming ◄─ open ─── UDP queue ◄── peer         │
//! └───────────────────────────────────────────────────────────────┘
//! ```

#[cfg(not(target_os = "linux"))]
compile_error!("tunnel-mesh only supports Linux");

pub mod config;
pub mod control;
pub mod crypto;
pub mod datastore;
pub mod device;
pub mod error;
pub mod lock;
pub mod mapping;
pub mod network;
pub mod orchestrator;
pub mod payload;
pub mod process;
pub mod queues;
pub mod signal;
pub mod socket;
pub mod stats;
pub mod worker;
pub mod workers;

#[cfg(test)]
mod testing;

// Re-exports for convenience
pub use config::Config;
pub use crypto::{Cipher, PeerKey};
pub use error::{MeshError, MeshResult};
pub use lock::MasterLock;
pub use mapping::{Mapping, MappingRecord};
pub use network::NetworkConfig;
pub use orchestrator::run_master;
pub use payload::Payload;
pub use stats::{Aggregator, Direction, Stat};
pub use worker::run_worker;
pub use workers::{is_trusted, MappingResolver, StatSink, StopFlag, Workers};
