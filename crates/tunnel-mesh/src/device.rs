//! Multi-queue TUN device.
//!
//! The master opens one handle per queue on the same interface with
//! `IFF_MULTI_QUEUE`; the kernel spreads flows across them. Workers only ever
//! see the inherited handles and never touch the interface configuration.

use crate::error::{MeshError, MeshResult};
use crate::payload::Payload;
use crate::queues::{QueueKind, QueueSet};
use std::future::Future;
use std::io;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use tokio::io::unix::AsyncFd;
use tokio::process::Command;

const TUN_PATH: &str = "/dev/net/tun";
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;
const IFF_MULTI_QUEUE: libc::c_short = 0x0100;
const TUNSETIFF: libc::c_ulong = 0x400454ca;

/// Packet side of the data-plane.
///
/// Same queue discipline as [`crate::socket::Socket`]: reads fill the payload
/// after its header, writes deliver the packet region.
pub trait Device: Send + Sync + 'static {
    /// Read one IP packet from `queue` into the payload.
    fn read(
        &self,
        payload: &mut Payload,
        queue: usize,
    ) -> impl Future<Output = MeshResult<()>> + Send;

    /// Write the payload's packet region to `queue`.
    fn write(&self, payload: &Payload, queue: usize) -> impl Future<Output = MeshResult<()>> + Send;

    /// Raw descriptors in queue order.
    fn queues(&self) -> Vec<RawFd>;
}

#[repr(C)]
struct IfReqTun {
    ifr_name: [u8; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

impl IfReqTun {
    fn new(name: &str, flags: libc::c_short) -> MeshResult<Self> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() >= libc::IFNAMSIZ {
            return Err(MeshError::Device(format!(
                "interface name '{}' must be 1-{} bytes",
                name,
                libc::IFNAMSIZ - 1
            )));
        }
        let mut ifr_name = [0u8; libc::IFNAMSIZ];
        ifr_name[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            ifr_name,
            ifr_flags: flags,
            _pad: [0; 22],
        })
    }
}

/// Non-blocking TUN queues of one interface.
pub struct TunQueues {
    name: String,
    queues: Vec<AsyncFd<OwnedFd>>,
}

impl TunQueues {
    /// Open `count` queues on interface `name`, creating it if needed.
    pub fn create(name: &str, count: usize) -> MeshResult<QueueSet> {
        let mut fds = Vec::with_capacity(count);
        for queue in 0..count {
            let fd = open_queue(name)
                .map_err(|e| MeshError::Device(format!("{} queue {}: {}", name, queue, e)))?;
            fds.push(fd);
        }
        log::info!("Opened {} queue(s) on TUN device {}", count, name);
        Ok(QueueSet::new(QueueKind::Device, fds))
    }

    /// Wrap provisioned or inherited handles for async use.
    pub fn open(name: impl Into<String>, set: QueueSet) -> MeshResult<Self> {
        if set.kind() != QueueKind::Device {
            return Err(MeshError::Device(format!(
                "cannot open {} queues as a device",
                set.kind()
            )));
        }
        let queues = set
            .into_fds()
            .into_iter()
            .map(|fd| {
                set_nonblocking(fd.as_raw_fd())?;
                Ok(AsyncFd::new(fd)?)
            })
            .collect::<MeshResult<Vec<_>>>()?;
        Ok(Self {
            name: name.into(),
            queues,
        })
    }

    /// Interface name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of queues.
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Close every queue, continuing past failures.
    pub fn close(self) -> MeshResult<()> {
        let fds = self.queues.into_iter().map(AsyncFd::into_inner).collect();
        QueueSet::new(QueueKind::Device, fds).close()
    }

    fn queue(&self, queue: usize) -> MeshResult<&AsyncFd<OwnedFd>> {
        self.queues.get(queue).ok_or_else(|| {
            MeshError::Device(format!(
                "queue {} out of range ({} queues)",
                queue,
                self.queues.len()
            ))
        })
    }
}

impl Device for TunQueues {
    async fn read(&self, payload: &mut Payload, queue: usize) -> MeshResult<()> {
        let fd = self.queue(queue)?;
        let buf = payload.device_buffer();
        let n = loop {
            let mut guard = fd.readable().await?;
            match guard.try_io(|inner| {
                // SAFETY: buf is valid for writes of buf.len() bytes.
                let n = unsafe {
                    libc::read(
                        inner.as_raw_fd(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(result) => break result?,
                Err(_would_block) => continue,
            }
        };
        if n == 0 {
            return Err(MeshError::Device(format!("{} queue {}: end of file", self.name, queue)));
        }
        payload.load_device(n);
        Ok(())
    }

    async fn write(&self, payload: &Payload, queue: usize) -> MeshResult<()> {
        let fd = self.queue(queue)?;
        let packet = payload.packet();
        let n = loop {
            let mut guard = fd.writable().await?;
            match guard.try_io(|inner| {
                // SAFETY: packet is valid for reads of packet.len() bytes.
                let n = unsafe {
                    libc::write(
                        inner.as_raw_fd(),
                        packet.as_ptr() as *const libc::c_void,
                        packet.len(),
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(result) => break result?,
                Err(_would_block) => continue,
            }
        };
        if n != packet.len() {
            return Err(MeshError::Device(format!(
                "{} queue {}: short write {} of {} bytes",
                self.name,
                queue,
                n,
                packet.len()
            )));
        }
        Ok(())
    }

    fn queues(&self) -> Vec<RawFd> {
        self.queues.iter().map(|q| q.as_raw_fd()).collect()
    }
}

fn open_queue(name: &str) -> io::Result<OwnedFd> {
    let path = std::ffi::CString::new(TUN_PATH)?;
    // SAFETY: path is a valid NUL-terminated string.
    let raw = unsafe { libc::open(path.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: raw is a freshly opened descriptor we own.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    let req = IfReqTun::new(name, IFF_TUN | IFF_NO_PI | IFF_MULTI_QUEUE)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
    // SAFETY: req is a properly sized ifreq for TUNSETIFF.
    if unsafe { libc::ioctl(fd.as_raw_fd(), TUNSETIFF as _, &req) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

fn set_nonblocking(fd: RawFd) -> MeshResult<()> {
    // SAFETY: fcntl on a descriptor we own.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(MeshError::Io(io::Error::last_os_error()));
    }
    Ok(())
}

/// Check if `ip` stderr says the address or route is already there.
fn is_already_exists_error(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("file exists") || lower.contains("eexist")
}

async fn run_ip(args: &[&str]) -> MeshResult<std::process::Output> {
    Command::new("ip")
        .args(args)
        .output()
        .await
        .map_err(|e| MeshError::Device(format!("Failed to execute ip command: {}", e)))
}

/// Set the MTU, bring the link up and assign the node's private address.
///
/// Re-running against an already configured interface succeeds.
pub async fn configure_interface(
    name: &str,
    address: Ipv4Addr,
    prefix_len: u8,
    mtu: u16,
) -> MeshResult<()> {
    let mtu = mtu.to_string();
    let output = run_ip(&["link", "set", "dev", name, "mtu", &mtu, "up"]).await?;
    if !output.status.success() {
        return Err(MeshError::Device(format!(
            "Failed to bring up {}: {}",
            name,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let cidr = format!("{}/{}", address, prefix_len);
    let output = run_ip(&["addr", "add", &cidr, "dev", name]).await?;
    if output.status.success() {
        log::info!("Assigned {} to {} (MTU {})", cidr, name, mtu);
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if is_already_exists_error(&stderr) {
        log::warn!(
            "Address {} already on {} (treating as success): {}",
            cidr,
            name,
            stderr.trim()
        );
        Ok(())
    } else {
        Err(MeshError::Device(format!(
            "Failed to assign {} to {}: {}",
            cidr,
            name,
            stderr.trim()
        )))
    }
}
