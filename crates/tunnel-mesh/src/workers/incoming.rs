//! Socket → device pipeline.

use super::{drop_level, stat, MappingResolver, StatSink, StopFlag};
use crate::device::Device;
use crate::error::MeshResult;
use crate::payload::Payload;
use crate::socket::Socket;
use crate::stats::{Direction, Stat};
use std::sync::Arc;

/// Receives sealed datagrams on one queue, opens them with the sender's key
/// and delivers the plaintext packet to the device.
pub struct Incoming<S, D, R, K> {
    queue: usize,
    socket: Arc<S>,
    device: Arc<D>,
    resolver: R,
    stats: K,
    payload: Payload,
}

impl<S, D, R, K> Incoming<S, D, R, K>
where
    S: Socket,
    D: Device,
    R: MappingResolver,
    K: StatSink,
{
    pub fn new(queue: usize, socket: Arc<S>, device: Arc<D>, resolver: R, stats: K) -> Self {
        Self {
            queue,
            socket,
            device,
            resolver,
            stats,
            payload: Payload::new(),
        }
    }

    /// Process packets until `stop` is raised. A blocked read is abandoned
    /// on stop; a packet already read is finished first.
    pub async fn run(mut self, stop: StopFlag) {
        log::debug!("incoming[{}] started", self.queue);
        while !stop.is_stopped() {
            let read = tokio::select! {
                biased;
                _ = stop.stopped() => break,
                read = self.socket.read(&mut self.payload, self.queue) => read,
            };
            self.complete(read).await;
        }
        log::debug!("incoming[{}] stopped", self.queue);
    }

    /// Read and handle exactly one datagram.
    pub async fn process(&mut self) -> Stat {
        let read = self.socket.read(&mut self.payload, self.queue).await;
        self.complete(read).await
    }

    async fn complete(&mut self, read: MeshResult<()>) -> Stat {
        let stat = match read {
            Ok(()) => self.deliver().await,
            Err(e) => {
                log::log!(drop_level(&e), "incoming[{}] read failed: {}", self.queue, e);
                stat(self.queue, Direction::Incoming, true, 0, None)
            }
        };
        self.stats.sink(stat.clone());
        stat
    }

    async fn deliver(&mut self) -> Stat {
        let queue = self.queue;
        let bytes = self.payload.length();
        let sender = self.payload.ip_address_v4();

        let mapping = match self.resolver.mapping(sender).await {
            Ok(mapping) => mapping,
            Err(e) => {
                log::log!(
                    drop_level(&e),
                    "incoming[{}] no mapping for {}: {}",
                    queue,
                    sender,
                    e
                );
                return stat(queue, Direction::Incoming, true, bytes, None);
            }
        };
        let peer = Some(mapping.private_ip());

        if let Err(e) = self.payload.open(mapping.cipher()) {
            log::log!(drop_level(&e), "incoming[{}] from {}: {}", queue, sender, e);
            return stat(queue, Direction::Incoming, true, bytes, peer);
        }

        if let Err(e) = self.device.write(&self.payload, queue).await {
            log::log!(
                drop_level(&e),
                "incoming[{}] device write failed: {}",
                queue,
                e
            );
            return stat(queue, Direction::Incoming, true, bytes, peer);
        }

        log::trace!("incoming[{}] {} bytes from {}", queue, bytes, sender);
        stat(queue, Direction::Incoming, false, bytes, peer)
    }
}
