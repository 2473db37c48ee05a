//! Device → socket pipeline.

use super::{drop_level, is_trusted, stat, MappingResolver, StatSink, StopFlag};
use crate::config::Config;
use crate::device::Device;
use crate::error::MeshResult;
use crate::payload::Payload;
use crate::socket::Socket;
use crate::stats::{Direction, Stat};
use std::sync::Arc;

/// Reads plaintext packets from one device queue, seals them for the
/// destination peer and sends them on the matching socket queue.
pub struct Outgoing<S, D, R, K> {
    queue: usize,
    config: Arc<Config>,
    socket: Arc<S>,
    device: Arc<D>,
    resolver: R,
    stats: K,
    payload: Payload,
}

impl<S, D, R, K> Outgoing<S, D, R, K>
where
    S: Socket,
    D: Device,
    R: MappingResolver,
    K: StatSink,
{
    pub fn new(
        queue: usize,
        config: Arc<Config>,
        socket: Arc<S>,
        device: Arc<D>,
        resolver: R,
        stats: K,
    ) -> Self {
        Self {
            queue,
            config,
            socket,
            device,
            resolver,
            stats,
            payload: Payload::new(),
        }
    }

    /// Process packets until `stop` is raised.
    pub async fn run(mut self, stop: StopFlag) {
        log::debug!("outgoing[{}] started", self.queue);
        while !stop.is_stopped() {
            let read = tokio::select! {
                biased;
                _ = stop.stopped() => break,
                read = self.device.read(&mut self.payload, self.queue) => read,
            };
            self.complete(read).await;
        }
        log::debug!("outgoing[{}] stopped", self.queue);
    }

    /// Read and handle exactly one packet.
    pub async fn process(&mut self) -> Stat {
        let read = self.device.read(&mut self.payload, self.queue).await;
        self.complete(read).await
    }

    async fn complete(&mut self, read: MeshResult<()>) -> Stat {
        let stat = match read {
            Ok(()) => self.transmit().await,
            Err(e) => {
                log::log!(drop_level(&e), "outgoing[{}] read failed: {}", self.queue, e);
                stat(self.queue, Direction::Outgoing, true, 0, None)
            }
        };
        self.stats.sink(stat.clone());
        stat
    }

    async fn transmit(&mut self) -> Stat {
        let queue = self.queue;
        let bytes = self.payload.length();

        let Some(destination) = self.payload.destination() else {
            log::trace!("outgoing[{}] not an IPv4 packet", queue);
            return stat(queue, Direction::Outgoing, true, bytes, None);
        };

        let mapping = match self.resolver.mapping(destination).await {
            Ok(mapping) => mapping,
            Err(e) => {
                log::log!(
                    drop_level(&e),
                    "outgoing[{}] no mapping for {}: {}",
                    queue,
                    destination,
                    e
                );
                return stat(queue, Direction::Outgoing, true, bytes, None);
            }
        };
        let peer = Some(mapping.private_ip());

        let Some(sockaddr) =
            mapping.select_sockaddr(self.config.ipv4_enabled, self.config.ipv6_enabled)
        else {
            log::debug!(
                "outgoing[{}] no usable transport address for {}",
                queue,
                destination
            );
            return stat(queue, Direction::Outgoing, true, bytes, peer);
        };

        if is_trusted(&self.config.trusted_networks, mapping.private_ip()) {
            log::trace!("outgoing[{}] {} is trusted", queue, destination);
        }

        self.payload.set_sockaddr(sockaddr);
        self.payload.set_ip_address(self.config.private_ip);
        if let Err(e) = self.payload.seal(mapping.cipher()) {
            log::log!(drop_level(&e), "outgoing[{}] to {}: {}", queue, destination, e);
            return stat(queue, Direction::Outgoing, true, bytes, peer);
        }

        if let Err(e) = self.socket.write(&self.payload, queue).await {
            log::log!(
                drop_level(&e),
                "outgoing[{}] send to {} failed: {}",
                queue,
                sockaddr,
                e
            );
            return stat(queue, Direction::Outgoing, true, bytes, peer);
        }

        log::trace!("outgoing[{}] {} bytes to {}", queue, bytes, sockaddr);
        stat(queue, Direction::Outgoing, false, bytes, peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Cipher, PeerKey};
    use crate::mapping::{Mapping, MappingRecord};
    use crate::payload::{FOOTER_SIZE, HEADER_SIZE};
    use crate::testing::{ipv4_packet, mapping_record, MockDevice, MockResolver, MockSink, MockSocket};
    use crate::workers::Incoming;
    use std::net::{Ipv4Addr, SocketAddr};

    const LOCAL: Ipv4Addr = Ipv4Addr::new(10, 99, 0, 1);
    const PEER: Ipv4Addr = Ipv4Addr::new(10, 99, 0, 5);

    fn config(ipv6_enabled: bool) -> Arc<Config> {
        Arc::new(Config {
            private_ip: LOCAL,
            ipv6_enabled,
            ..Config::default()
        })
    }

    type TestOutgoing = Outgoing<MockSocket, MockDevice, MockResolver, MockSink>;

    fn pipeline(
        config: Arc<Config>,
        records: Vec<MappingRecord>,
    ) -> (TestOutgoing, Arc<MockSocket>, Arc<MockDevice>, MockSink) {
        let socket = Arc::new(MockSocket::new(1));
        let device = Arc::new(MockDevice::new(1));
        let sink = MockSink::default();
        let outgoing = Outgoing::new(
            0,
            config,
            socket.clone(),
            device.clone(),
            MockResolver::with(records),
            sink.clone(),
        );
        (outgoing, socket, device, sink)
    }

    #[tokio::test]
    async fn test_seals_and_sends_to_peer() {
        let key = PeerKey::generate();
        let (mut outgoing, socket, device, sink) =
            pipeline(config(false), vec![mapping_record(PEER, &key)]);
        let packet = ipv4_packet([10, 99, 0, 5], b"hello");
        device.push_inbound(0, packet.clone());

        let stat = outgoing.process().await;
        assert!(!stat.dropped);
        assert_eq!(stat.private_ip, "10.99.0.5");
        assert_eq!(stat.bytes as usize, HEADER_SIZE + packet.len() + FOOTER_SIZE);

        let sent = socket.sent(0);
        assert_eq!(sent.len(), 1);
        let (wire, to) = &sent[0];
        assert_eq!(*to, "198.51.100.5:1099".parse::<SocketAddr>().unwrap());
        assert_eq!(&wire[..4], &LOCAL.octets());
        assert_eq!(wire.len(), stat.bytes as usize);
        assert_ne!(&wire[HEADER_SIZE..HEADER_SIZE + packet.len()], &packet[..]);
        assert_eq!(sink.stats().len(), 1);
    }

    #[tokio::test]
    async fn test_prefers_ipv6_when_enabled() {
        let key = PeerKey::generate();
        let record = mapping_record(PEER, &key).with_ipv6("2001:db8::5".parse().unwrap());

        let (mut v6, socket, device, _) = pipeline(config(true), vec![record.clone()]);
        device.push_inbound(0, ipv4_packet([10, 99, 0, 5], b"x"));
        v6.process().await;
        assert_eq!(socket.sent(0)[0].1, "[2001:db8::5]:1099".parse().unwrap());

        let (mut v4, socket, device, _) = pipeline(config(false), vec![record]);
        device.push_inbound(0, ipv4_packet([10, 99, 0, 5], b"x"));
        v4.process().await;
        assert_eq!(socket.sent(0)[0].1, "198.51.100.5:1099".parse().unwrap());
    }

    /// Resolves every destination to one gateway peer.
    struct GatewayResolver(MappingRecord);

    impl MappingResolver for GatewayResolver {
        async fn mapping(&self, _private_ip: Ipv4Addr) -> MeshResult<Mapping> {
            Mapping::try_from(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_ipv6_only_gateway_for_other_destination() {
        let key = PeerKey::generate();
        let mut gateway = MappingRecord::new(PEER, Ipv4Addr::UNSPECIFIED, 4000, &key)
            .with_ipv6("2001:db8::5".parse().unwrap());
        gateway.ipv4 = None;

        let socket = Arc::new(MockSocket::new(1));
        let device = Arc::new(MockDevice::new(1));
        let mut outgoing = Outgoing::new(
            0,
            config(true),
            socket.clone(),
            device.clone(),
            GatewayResolver(gateway),
            MockSink::default(),
        );
        let packet = ipv4_packet([10, 99, 3, 7], b"routed");
        device.push_inbound(0, packet.clone());

        let stat = outgoing.process().await;
        assert!(!stat.dropped);
        assert_eq!(stat.private_ip, "10.99.0.5");

        let sent = socket.sent(0);
        assert_eq!(sent.len(), 1);
        let (wire, to) = &sent[0];
        assert_eq!(*to, "[2001:db8::5]:4000".parse::<SocketAddr>().unwrap());
        assert_eq!(&wire[..4], &LOCAL.octets());

        // The gateway opens it with the shared key.
        let mut opened = Payload::with_capacity(4096);
        opened.socket_buffer()[..wire.len()].copy_from_slice(wire);
        opened.load_socket(wire.len(), *to).unwrap();
        opened.open(&Cipher::new(&key).unwrap()).unwrap();
        assert_eq!(opened.packet(), &packet[..]);
    }

    #[tokio::test]
    async fn test_falls_back_to_ipv4_without_peer_ipv6() {
        let key = PeerKey::generate();
        let (mut outgoing, socket, device, _) =
            pipeline(config(true), vec![mapping_record(PEER, &key)]);
        device.push_inbound(0, ipv4_packet([10, 99, 0, 5], b"x"));
        assert!(!outgoing.process().await.dropped);
        assert_eq!(socket.sent(0)[0].1, "198.51.100.5:1099".parse().unwrap());
    }

    #[tokio::test]
    async fn test_no_usable_family_dropped_with_peer() {
        let key = PeerKey::generate();
        let mut record = mapping_record(PEER, &key);
        record.ipv4 = None;
        record.ipv6 = Some("2001:db8::5".parse().unwrap());
        let (mut outgoing, socket, device, _) = pipeline(config(false), vec![record]);
        device.push_inbound(0, ipv4_packet([10, 99, 0, 5], b"x"));

        let stat = outgoing.process().await;
        assert!(stat.dropped);
        assert_eq!(stat.private_ip, "10.99.0.5");
        assert!(socket.sent(0).is_empty());
    }

    #[tokio::test]
    async fn test_unresolved_destination_dropped_once() {
        let (mut outgoing, socket, device, sink) = pipeline(config(false), vec![]);
        device.push_inbound(0, ipv4_packet([10, 99, 0, 42], b"x"));

        let stat = outgoing.process().await;
        assert!(stat.dropped);
        assert!(stat.private_ip.is_empty());
        assert!(socket.sent(0).is_empty());
        assert_eq!(sink.stats(), vec![stat]);
    }

    #[tokio::test]
    async fn test_non_ipv4_packet_dropped() {
        let key = PeerKey::generate();
        let (mut outgoing, socket, device, _) =
            pipeline(config(false), vec![mapping_record(PEER, &key)]);
        let mut packet = ipv4_packet([10, 99, 0, 5], b"x");
        packet[0] = 0x60;
        device.push_inbound(0, packet);
        assert!(outgoing.process().await.dropped);
        assert!(socket.sent(0).is_empty());
    }

    #[tokio::test]
    async fn test_read_failure_drops_once() {
        let (mut outgoing, socket, device, sink) = pipeline(config(false), vec![]);
        device.push_read_error(0);
        let stat = outgoing.process().await;
        assert!(stat.dropped);
        assert_eq!(stat.bytes, 0);
        assert_eq!(sink.stats().len(), 1);
        assert!(socket.sent(0).is_empty());
    }

    #[tokio::test]
    async fn test_socket_write_failure_dropped() {
        let key = PeerKey::generate();
        let (mut outgoing, socket, device, sink) =
            pipeline(config(false), vec![mapping_record(PEER, &key)]);
        socket.fail_writes(true);
        device.push_inbound(0, ipv4_packet([10, 99, 0, 5], b"x"));
        let stat = outgoing.process().await;
        assert!(stat.dropped);
        assert_eq!(stat.private_ip, "10.99.0.5");
        assert_eq!(sink.stats().len(), 1);
    }

    #[tokio::test]
    async fn test_trusted_peer_is_still_sealed() {
        let key = PeerKey::generate();
        let config = Arc::new(Config {
            private_ip: LOCAL,
            trusted_networks: vec!["10.99.0.0/24".parse().unwrap()],
            ..Config::default()
        });
        let (mut outgoing, socket, device, _) = pipeline(config, vec![mapping_record(PEER, &key)]);
        let packet = ipv4_packet([10, 99, 0, 5], b"plaintext!");
        device.push_inbound(0, packet.clone());
        assert!(!outgoing.process().await.dropped);
        let (wire, _) = &socket.sent(0)[0];
        assert_eq!(wire.len(), HEADER_SIZE + packet.len() + FOOTER_SIZE);
        assert_ne!(&wire[HEADER_SIZE..HEADER_SIZE + packet.len()], &packet[..]);
    }

    #[tokio::test]
    async fn test_end_to_end_between_two_nodes() {
        let key = PeerKey::generate();

        // Node A (10.99.0.1) knows B as 10.99.0.5.
        let (mut a_out, a_socket, a_device, a_sink) =
            pipeline(config(false), vec![mapping_record(PEER, &key)]);

        // Node B knows A as 10.99.0.1 with the same shared key.
        let b_socket = Arc::new(MockSocket::new(1));
        let b_device = Arc::new(MockDevice::new(1));
        let b_sink = MockSink::default();
        let mut b_in = Incoming::new(
            0,
            b_socket.clone(),
            b_device.clone(),
            MockResolver::with(vec![mapping_record(LOCAL, &key)]),
            b_sink.clone(),
        );

        let packet = ipv4_packet([10, 99, 0, 5], b"end to end");
        a_device.push_inbound(0, packet.clone());
        let a_stat = a_out.process().await;
        assert!(!a_stat.dropped);
        assert_eq!(a_stat.private_ip, "10.99.0.5");

        let (wire, _) = a_socket.sent(0).remove(0);
        b_socket.push_inbound(0, wire, "198.51.100.1:1099".parse().unwrap());
        let b_stat = b_in.process().await;
        assert!(!b_stat.dropped);
        assert_eq!(b_stat.private_ip, "10.99.0.1");
        assert_eq!(b_device.written(0), vec![packet]);

        assert_eq!(a_sink.stats().len(), 1);
        assert_eq!(b_sink.stats().len(), 1);
    }
}
