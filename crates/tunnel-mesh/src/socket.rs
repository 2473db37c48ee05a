//! Multi-queue UDP endpoint.

use crate::error::{MeshError, MeshResult};
use crate::payload::Payload;
use crate::queues::{QueueKind, QueueSet};
use socket2::{Domain, Protocol, Socket as RawSocket, Type};
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

/// Datagram side of the data-plane.
///
/// Each queue index is read by exactly one task and written by exactly one
/// task. Errors are per-datagram; callers drop the packet and move on.
pub trait Socket: Send + Sync + 'static {
    /// Receive one datagram on `queue` into the payload buffer.
    fn read(
        &self,
        payload: &mut Payload,
        queue: usize,
    ) -> impl Future<Output = MeshResult<()>> + Send;

    /// Send the payload's wire bytes to its sockaddr on `queue`.
    fn write(&self, payload: &Payload, queue: usize) -> impl Future<Output = MeshResult<()>> + Send;

    /// Raw descriptors in queue order.
    fn queues(&self) -> Vec<RawFd>;
}

/// Non-blocking UDP socket queues sharing one local address.
pub struct UdpQueues {
    sockets: Vec<tokio::net::UdpSocket>,
    ipv6: bool,
}

impl UdpQueues {
    /// Create `count` datagram sockets bound to `listen` with address and
    /// port reuse. When `listen` has port 0 the port picked for the first
    /// queue is reused by the rest.
    pub fn bind(count: usize, listen: SocketAddr) -> MeshResult<QueueSet> {
        let mut addr = listen;
        let mut fds = Vec::with_capacity(count);
        for queue in 0..count {
            let socket = bind_one(addr)
                .map_err(|e| MeshError::Socket(format!("queue {} bind {}: {}", queue, addr, e)))?;
            if addr.port() == 0 {
                let bound = socket
                    .local_addr()
                    .ok()
                    .and_then(|a| a.as_socket())
                    .ok_or_else(|| {
                        MeshError::Socket(format!("queue {} has no local address", queue))
                    })?;
                addr.set_port(bound.port());
            }
            fds.push(OwnedFd::from(socket));
        }
        log::info!("Bound {} UDP queue(s) on {}", count, addr);
        Ok(QueueSet::new(QueueKind::Socket, fds))
    }

    /// Wrap provisioned or inherited handles for async use.
    pub fn open(set: QueueSet) -> MeshResult<Self> {
        if set.kind() != QueueKind::Socket {
            return Err(MeshError::Socket(format!(
                "cannot open {} queues as sockets",
                set.kind()
            )));
        }
        let mut ipv6 = false;
        let mut sockets = Vec::with_capacity(set.len());
        for fd in set.into_fds() {
            let std_socket = std::net::UdpSocket::from(fd);
            std_socket.set_nonblocking(true)?;
            ipv6 = std_socket.local_addr()?.is_ipv6();
            sockets.push(tokio::net::UdpSocket::from_std(std_socket)?);
        }
        Ok(Self { sockets, ipv6 })
    }

    /// Number of queues.
    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    /// Local address of a queue.
    pub fn local_addr(&self, queue: usize) -> MeshResult<SocketAddr> {
        Ok(self.queue(queue)?.local_addr()?)
    }

    /// Close every queue, continuing past failures.
    pub fn close(self) -> MeshResult<()> {
        let mut fds = Vec::with_capacity(self.sockets.len());
        for socket in self.sockets {
            fds.push(OwnedFd::from(socket.into_std()?));
        }
        QueueSet::new(QueueKind::Socket, fds).close()
    }

    fn queue(&self, queue: usize) -> MeshResult<&tokio::net::UdpSocket> {
        self.sockets.get(queue).ok_or_else(|| {
            MeshError::Socket(format!(
                "queue {} out of range ({} queues)",
                queue,
                self.sockets.len()
            ))
        })
    }

    fn target(&self, addr: SocketAddr) -> SocketAddr {
        match addr.ip() {
            IpAddr::V4(v4) if self.ipv6 => {
                SocketAddr::new(IpAddr::V6(v4.to_ipv6_mapped()), addr.port())
            }
            _ => addr,
        }
    }
}

impl Socket for UdpQueues {
    async fn read(&self, payload: &mut Payload, queue: usize) -> MeshResult<()> {
        let socket = self.queue(queue)?;
        let (n, from) = socket.recv_from(payload.socket_buffer()).await?;
        payload.load_socket(n, unmap(from))
    }

    async fn write(&self, payload: &Payload, queue: usize) -> MeshResult<()> {
        let socket = self.queue(queue)?;
        let addr = payload
            .sockaddr()
            .ok_or_else(|| MeshError::Socket("payload has no destination".into()))?;
        let n = socket.send_to(payload.raw(), self.target(addr)).await?;
        if n != payload.length() {
            return Err(MeshError::Socket(format!(
                "short send to {}: {} of {} bytes",
                addr,
                n,
                payload.length()
            )));
        }
        Ok(())
    }

    fn queues(&self) -> Vec<RawFd> {
        self.sockets.iter().map(|s| s.as_raw_fd()).collect()
    }
}

fn bind_one(addr: SocketAddr) -> std::io::Result<RawSocket> {
    let socket = RawSocket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.bind(&addr.into())?;
    Ok(socket)
}

/// Report v4-mapped peers as plain IPv4.
fn unmap(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), addr.port()),
            None => addr,
        },
        IpAddr::V4(_) => addr,
    }
}
