//! Queue handle sets and the inherited descriptor layout.
//!
//! Both sockets and devices are provisioned as an ordered set of OS handles,
//! one per queue. The master creates the handles (bind mode) and a worker
//! adopts its share from descriptors it inherited (inherit mode):
//!
//! ```text
//! fd:  0 1 2 | 3 .. 3+Q        | 3+Q .. 3+2Q
//!      stdio | device queues   | socket queues
//! ```

use crate::error::{MeshError, MeshResult};
use std::fmt;
use std::ops::Range;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

/// First descriptor after stdin, stdout and stderr.
pub const FIRST_INHERITED_FD: RawFd = 3;

/// What a queue handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Device,
    Socket,
}

impl QueueKind {
    fn expected_mode(self) -> libc::mode_t {
        match self {
            QueueKind::Device => libc::S_IFCHR,
            QueueKind::Socket => libc::S_IFSOCK,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QueueKind::Device => "device",
            QueueKind::Socket => "socket",
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered set of queue handles of one kind.
#[derive(Debug)]
pub struct QueueSet {
    kind: QueueKind,
    fds: Vec<OwnedFd>,
}

impl QueueSet {
    pub fn new(kind: QueueKind, fds: Vec<OwnedFd>) -> Self {
        Self { kind, fds }
    }

    /// Adopt `count` inherited descriptors starting at `first_fd`.
    ///
    /// Every descriptor is checked to be open and of the expected type before
    /// any of them is taken over, so a failed inherit closes nothing. Adopted
    /// descriptors are marked close-on-exec.
    pub fn inherit(kind: QueueKind, first_fd: RawFd, count: usize) -> MeshResult<Self> {
        let fds: Vec<RawFd> = (0..count).map(|i| first_fd + i as RawFd).collect();
        for &fd in &fds {
            validate_inherited(kind, fd)?;
        }

        let fds = fds
            .into_iter()
            .map(|fd| {
                set_cloexec(fd)?;
                // SAFETY: fd was validated as open and nothing else in this
                // process owns it.
                Ok(unsafe { OwnedFd::from_raw_fd(fd) })
            })
            .collect::<MeshResult<Vec<_>>>()?;

        log::debug!(
            "Inherited {} {} queue(s) at fd {}..{}",
            count,
            kind,
            first_fd,
            first_fd + count as RawFd
        );
        Ok(Self { kind, fds })
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Number of queues.
    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Raw descriptors in queue order.
    pub fn raw_fds(&self) -> Vec<RawFd> {
        self.fds.iter().map(|fd| fd.as_raw_fd()).collect()
    }

    /// Split into consecutive sets of `per_set` queues, one per worker.
    pub fn split(self, per_set: usize) -> MeshResult<Vec<QueueSet>> {
        if per_set == 0 || self.fds.len() % per_set != 0 {
            return Err(MeshError::Config(format!(
                "cannot split {} {} queues into sets of {}",
                self.fds.len(),
                self.kind,
                per_set
            )));
        }
        let kind = self.kind;
        let mut sets = Vec::with_capacity(self.fds.len() / per_set);
        let mut fds = self.fds.into_iter();
        loop {
            let chunk: Vec<OwnedFd> = fds.by_ref().take(per_set).collect();
            if chunk.is_empty() {
                break;
            }
            sets.push(QueueSet::new(kind, chunk));
        }
        Ok(sets)
    }

    /// Take the handles out of the set.
    pub fn into_fds(self) -> Vec<OwnedFd> {
        self.fds
    }

    /// Close every handle, continuing past failures.
    pub fn close(self) -> MeshResult<()> {
        let kind = self.kind;
        let failures: Vec<String> = self
            .fds
            .into_iter()
            .enumerate()
            .filter_map(|(queue, fd)| {
                let raw = fd.into_raw_fd();
                // SAFETY: raw came from an OwnedFd we just released.
                if unsafe { libc::close(raw) } == 0 {
                    None
                } else {
                    Some(format!(
                        "queue {} (fd {}): {}",
                        queue,
                        raw,
                        std::io::Error::last_os_error()
                    ))
                }
            })
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(MeshError::Close {
                kind: kind.as_str(),
                failures,
            })
        }
    }
}

/// Descriptor layout a worker inherits for `Q` queues per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLayout {
    queues: usize,
}

impl QueueLayout {
    pub fn new(queues_per_worker: usize) -> Self {
        Self {
            queues: queues_per_worker,
        }
    }

    /// Queues of each kind.
    pub fn queues(&self) -> usize {
        self.queues
    }

    /// Total inherited descriptors beyond stdio.
    pub fn len(&self) -> usize {
        2 * self.queues
    }

    pub fn is_empty(&self) -> bool {
        self.queues == 0
    }

    /// Descriptors holding the device queues.
    pub fn device_fds(&self) -> Range<RawFd> {
        let start = FIRST_INHERITED_FD;
        start..start + self.queues as RawFd
    }

    /// Descriptors holding the socket queues.
    pub fn socket_fds(&self) -> Range<RawFd> {
        let start = FIRST_INHERITED_FD + self.queues as RawFd;
        start..start + self.queues as RawFd
    }

    /// Every inherited descriptor, device queues first.
    pub fn all_fds(&self) -> Range<RawFd> {
        FIRST_INHERITED_FD..FIRST_INHERITED_FD + self.len() as RawFd
    }

    /// Adopt the device queues of this layout.
    pub fn inherit_devices(&self) -> MeshResult<QueueSet> {
        QueueSet::inherit(QueueKind::Device, self.device_fds().start, self.queues)
    }

    /// Adopt the socket queues of this layout.
    pub fn inherit_sockets(&self) -> MeshResult<QueueSet> {
        QueueSet::inherit(QueueKind::Socket, self.socket_fds().start, self.queues)
    }
}

fn validate_inherited(kind: QueueKind, fd: RawFd) -> MeshResult<()> {
    // SAFETY: F_GETFD only inspects descriptor flags.
    if unsafe { libc::fcntl(fd, libc::F_GETFD) } < 0 {
        return Err(inherit_error(
            kind,
            format!(
                "inherited fd {} is not open: {}",
                fd,
                std::io::Error::last_os_error()
            ),
        ));
    }

    // SAFETY: stat is plain old data and fstat fills it completely on success.
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } < 0 {
        return Err(inherit_error(
            kind,
            format!("fstat on fd {}: {}", fd, std::io::Error::last_os_error()),
        ));
    }
    if stat.st_mode & libc::S_IFMT != kind.expected_mode() {
        return Err(inherit_error(
            kind,
            format!("inherited fd {} is not a {} handle", fd, kind),
        ));
    }
    Ok(())
}

fn set_cloexec(fd: RawFd) -> MeshResult<()> {
    // SAFETY: fd was validated as open.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(MeshError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

fn inherit_error(kind: QueueKind, message: String) -> MeshError {
    match kind {
        QueueKind::Device => MeshError::Device(message),
        QueueKind::Socket => MeshError::Socket(message),
    }
}
