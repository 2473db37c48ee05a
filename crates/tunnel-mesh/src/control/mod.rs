//! Master/worker control channel.
//!
//! JSON-RPC 2.0 over a Unix domain socket using length-prefixed framing.
//!
//! | Method | Params | Result |
//! |---|---|---|
//! | `ConfigServer.Sync` | none | [`Config`](crate::config::Config) |
//! | `DatastoreServer.Mapping` | `u32` address, network byte order | [`MappingRecord`](crate::mapping::MappingRecord) |
//! | `AggServer.Sink` | [`Stat`](crate::stats::Stat) | notification |

pub mod client;
pub mod framing;
pub mod protocol;
pub mod server;

pub use client::{ControlClient, StatReporter, STAT_CHANNEL_CAPACITY};
pub use framing::{read_message, write_message};
pub use protocol::{Request, Response, RpcError, METHOD_MAPPING, METHOD_SINK, METHOD_SYNC};
pub use server::{ControlServer, ControlServices};
