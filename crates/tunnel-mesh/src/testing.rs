//! In-memory stand-ins for the pipeline seams.

use crate::crypto::PeerKey;
use crate::device::Device;
use crate::error::{MeshError, MeshResult};
use crate::mapping::{Mapping, MappingRecord};
use crate::payload::Payload;
use crate::socket::Socket;
use crate::stats::Stat;
use crate::workers::{MappingResolver, StatSink};
use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddr};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Minimal IPv4/UDP packet from 10.99.0.1 to `dst`.
pub(crate) fn ipv4_packet(dst: [u8; 4], body: &[u8]) -> Vec<u8> {
    let mut pkt = vec![0u8; 20];
    pkt[0] = 0x45;
    let total = (20 + body.len()) as u16;
    pkt[2..4].copy_from_slice(&total.to_be_bytes());
    pkt[9] = 17;
    pkt[12..16].copy_from_slice(&[10, 99, 0, 1]);
    pkt[16..20].copy_from_slice(&dst);
    pkt.extend_from_slice(body);
    pkt
}

/// Record for `private_ip` reachable at 198.51.100.<last octet>:1099.
pub(crate) fn mapping_record(private_ip: Ipv4Addr, key: &PeerKey) -> MappingRecord {
    let last = private_ip.octets()[3];
    MappingRecord::new(private_ip, Ipv4Addr::new(198, 51, 100, last), 1099, key)
}

type Inbound<T> = Mutex<Vec<VecDeque<Option<T>>>>;

fn queued<T>(queues: usize) -> Inbound<T> {
    Mutex::new((0..queues).map(|_| VecDeque::new()).collect())
}

fn pop<T>(inbound: &Inbound<T>, queue: usize) -> Option<Option<T>> {
    inbound.lock().unwrap().get_mut(queue)?.pop_front()
}

/// Socket whose reads are scripted and whose writes are recorded.
///
/// A read on an empty queue never completes.
pub(crate) struct MockSocket {
    inbound: Inbound<(Vec<u8>, SocketAddr)>,
    sent: Mutex<Vec<Vec<(Vec<u8>, SocketAddr)>>>,
    fail_writes: AtomicBool,
}

impl MockSocket {
    pub(crate) fn new(queues: usize) -> Self {
        Self {
            inbound: queued(queues),
            sent: Mutex::new(vec![Vec::new(); queues]),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub(crate) fn push_inbound(&self, queue: usize, bytes: Vec<u8>, from: SocketAddr) {
        self.inbound.lock().unwrap()[queue].push_back(Some((bytes, from)));
    }

    pub(crate) fn push_read_error(&self, queue: usize) {
        self.inbound.lock().unwrap()[queue].push_back(None);
    }

    pub(crate) fn sent(&self, queue: usize) -> Vec<(Vec<u8>, SocketAddr)> {
        self.sent.lock().unwrap()[queue].clone()
    }

    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl Socket for MockSocket {
    async fn read(&self, payload: &mut Payload, queue: usize) -> MeshResult<()> {
        match pop(&self.inbound, queue) {
            Some(Some((bytes, from))) => {
                payload.socket_buffer()[..bytes.len()].copy_from_slice(&bytes);
                payload.load_socket(bytes.len(), from)
            }
            Some(None) => Err(MeshError::Socket("injected read failure".into())),
            None => std::future::pending().await,
        }
    }

    async fn write(&self, payload: &Payload, queue: usize) -> MeshResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(MeshError::Socket("injected write failure".into()));
        }
        let to = payload
            .sockaddr()
            .ok_or_else(|| MeshError::Socket("no destination".into()))?;
        self.sent.lock().unwrap()[queue].push((payload.raw().to_vec(), to));
        Ok(())
    }

    fn queues(&self) -> Vec<RawFd> {
        (0..self.sent.lock().unwrap().len() as RawFd).collect()
    }
}

/// Device whose reads are scripted and whose writes are recorded.
pub(crate) struct MockDevice {
    inbound: Inbound<Vec<u8>>,
    written: Mutex<Vec<Vec<Vec<u8>>>>,
    fail_writes: AtomicBool,
}

impl MockDevice {
    pub(crate) fn new(queues: usize) -> Self {
        Self {
            inbound: queued(queues),
            written: Mutex::new(vec![Vec::new(); queues]),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub(crate) fn push_inbound(&self, queue: usize, packet: Vec<u8>) {
        self.inbound.lock().unwrap()[queue].push_back(Some(packet));
    }

    pub(crate) fn push_read_error(&self, queue: usize) {
        self.inbound.lock().unwrap()[queue].push_back(None);
    }

    pub(crate) fn written(&self, queue: usize) -> Vec<Vec<u8>> {
        self.written.lock().unwrap()[queue].clone()
    }

    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl Device for MockDevice {
    async fn read(&self, payload: &mut Payload, queue: usize) -> MeshResult<()> {
        match pop(&self.inbound, queue) {
            Some(Some(packet)) => {
                payload.device_buffer()[..packet.len()].copy_from_slice(&packet);
                payload.load_device(packet.len());
                Ok(())
            }
            Some(None) => Err(MeshError::Device("injected read failure".into())),
            None => std::future::pending().await,
        }
    }

    async fn write(&self, payload: &Payload, queue: usize) -> MeshResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(MeshError::Device("injected write failure".into()));
        }
        self.written.lock().unwrap()[queue].push(payload.packet().to_vec());
        Ok(())
    }

    fn queues(&self) -> Vec<RawFd> {
        (0..self.written.lock().unwrap().len() as RawFd).collect()
    }
}

/// Resolver backed by a fixed table.
#[derive(Default)]
pub(crate) struct MockResolver {
    records: HashMap<Ipv4Addr, MappingRecord>,
}

impl MockResolver {
    pub(crate) fn with(records: Vec<MappingRecord>) -> Self {
        Self {
            records: records.into_iter().map(|r| (r.private_ip, r)).collect(),
        }
    }
}

impl MappingResolver for MockResolver {
    async fn mapping(&self, private_ip: Ipv4Addr) -> MeshResult<Mapping> {
        let record = self
            .records
            .get(&private_ip)
            .cloned()
            .ok_or_else(|| MeshError::MappingNotFound(private_ip.to_string()))?;
        Mapping::try_from(record)
    }
}

/// Sink that keeps every stat.
#[derive(Clone, Default)]
pub(crate) struct MockSink {
    stats: Arc<Mutex<Vec<Stat>>>,
}

impl MockSink {
    pub(crate) fn stats(&self) -> Vec<Stat> {
        self.stats.lock().unwrap().clone()
    }
}

impl StatSink for MockSink {
    fn sink(&self, stat: Stat) {
        self.stats.lock().unwrap().push(stat);
    }
}
