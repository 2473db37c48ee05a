//! Worker process spawning with descriptor hand-off.
//!
//! A worker is started as `[binary, control-path]` with stdio inherited and
//! its device and socket queues remapped to the [`QueueLayout`] positions.

use crate::config::Config;
use crate::error::{MeshError, MeshResult};
use crate::queues::{QueueKind, QueueLayout, QueueSet, FIRST_INHERITED_FD};
use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use tokio::process::{Child, Command};

/// File name of the worker executable.
pub const WORKER_BINARY_NAME: &str = "tunnel-rs-mesh-worker";

/// Locate the worker executable: the configured path, or the worker binary
/// installed next to the running executable.
pub fn worker_binary(config: &Config) -> MeshResult<PathBuf> {
    if let Some(path) = &config.worker_binary {
        return Ok(path.clone());
    }
    let exe = std::env::current_exe()?;
    let dir = exe.parent().ok_or_else(|| {
        MeshError::Spawn(format!("{} has no parent directory", exe.display()))
    })?;
    Ok(dir.join(WORKER_BINARY_NAME))
}

/// Spawn one worker owning `devices` and `sockets`.
///
/// The parent's copies of the queue handles are closed once the child has
/// been started, whether or not the spawn succeeded.
pub fn spawn_worker(
    binary: &Path,
    control_path: &Path,
    devices: QueueSet,
    sockets: QueueSet,
) -> MeshResult<Child> {
    if devices.kind() != QueueKind::Device || sockets.kind() != QueueKind::Socket {
        return Err(MeshError::Spawn("queue sets passed in the wrong order".into()));
    }
    if devices.len() != sockets.len() {
        return Err(MeshError::Spawn(format!(
            "{} device queues but {} socket queues",
            devices.len(),
            sockets.len()
        )));
    }
    let layout = QueueLayout::new(devices.len());

    // Park every handle above the target block so the child's dup2 calls
    // never overwrite a source that is still to be moved.
    let sources: Vec<RawFd> = devices
        .raw_fds()
        .into_iter()
        .chain(sockets.raw_fds())
        .collect();
    let staged = stage_above(&sources, layout.all_fds().end)?;
    let staged_raw: Vec<RawFd> = staged.iter().map(std::os::fd::AsRawFd::as_raw_fd).collect();

    let mut command = Command::new(binary);
    command.arg(control_path);
    // SAFETY: the closure only calls dup2, which is async-signal-safe, on
    // descriptors that stay open in the parent until spawn returns.
    unsafe {
        command.pre_exec(move || {
            for (i, &fd) in staged_raw.iter().enumerate() {
                let target = FIRST_INHERITED_FD + i as RawFd;
                if libc::dup2(fd, target) < 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }

    let spawned = command.spawn();
    drop(staged);
    close_parent_copies(devices, sockets);

    let child = spawned.map_err(|e| {
        MeshError::Spawn(format!("Failed to start {}: {}", binary.display(), e))
    })?;
    log::info!(
        "Spawned worker pid {} ({} queue(s), fds {:?})",
        child.id().unwrap_or_default(),
        layout.queues(),
        layout.all_fds()
    );
    Ok(child)
}

/// Ask a worker to shut down. A worker that is already gone is not an error.
pub fn terminate(pid: u32) -> MeshResult<()> {
    send_signal(pid, libc::SIGTERM)
}

/// Force a worker down after its grace period ran out.
pub fn kill(pid: u32) -> MeshResult<()> {
    send_signal(pid, libc::SIGKILL)
}

fn send_signal(pid: u32, signal: libc::c_int) -> MeshResult<()> {
    // SAFETY: kill has no memory-safety preconditions.
    if unsafe { libc::kill(pid as libc::pid_t, signal) } < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(MeshError::Spawn(format!(
                "Failed to signal pid {}: {}",
                pid, err
            )));
        }
    }
    Ok(())
}

fn stage_above(sources: &[RawFd], floor: RawFd) -> MeshResult<Vec<OwnedFd>> {
    sources
        .iter()
        .map(|&fd| {
            // SAFETY: F_DUPFD_CLOEXEC on an open descriptor we own.
            let staged = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, floor) };
            if staged < 0 {
                return Err(MeshError::Spawn(format!(
                    "Failed to stage fd {}: {}",
                    fd,
                    io::Error::last_os_error()
                )));
            }
            // SAFETY: staged is a fresh descriptor owned by nobody else.
            Ok(unsafe { OwnedFd::from_raw_fd(staged) })
        })
        .collect()
}

fn close_parent_copies(devices: QueueSet, sockets: QueueSet) {
    for set in [devices, sockets] {
        if let Err(e) = set.close() {
            log::warn!("{}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::UdpSocket;

    fn device_set(count: usize) -> QueueSet {
        let fds = (0..count)
            .map(|_| OwnedFd::from(std::fs::File::open("/dev/null").unwrap()))
            .collect();
        QueueSet::new(QueueKind::Device, fds)
    }

    fn socket_set(count: usize) -> QueueSet {
        let fds = (0..count)
            .map(|_| OwnedFd::from(UdpSocket::bind("127.0.0.1:0").unwrap()))
            .collect();
        QueueSet::new(QueueKind::Socket, fds)
    }

    /// Script run as `sh <script>`; exits non-zero when the layout is wrong.
    fn layout_script(queues: usize) -> tempfile::NamedTempFile {
        let mut script = tempfile::NamedTempFile::new().unwrap();
        let layout = QueueLayout::new(queues);
        writeln!(script, "set -e").unwrap();
        for fd in layout.device_fds() {
            writeln!(
                script,
                "[ \"$(readlink /proc/$$/fd/{})\" = /dev/null ] || exit 10",
                fd
            )
            .unwrap();
        }
        for fd in layout.socket_fds() {
            writeln!(
                script,
                "readlink /proc/$$/fd/{} | grep -q '^socket:' || exit 11",
                fd
            )
            .unwrap();
        }
        script
    }

    #[tokio::test]
    async fn test_worker_sees_layout() {
        for queues in [1usize, 3] {
            let script = layout_script(queues);
            let mut child = spawn_worker(
                Path::new("/bin/sh"),
                script.path(),
                device_set(queues),
                socket_set(queues),
            )
            .unwrap();
            let status = child.wait().await.unwrap();
            assert!(status.success(), "queues={} status={:?}", queues, status);
        }
    }

    #[tokio::test]
    async fn test_mismatched_sets_rejected() {
        let err = spawn_worker(
            Path::new("/bin/sh"),
            Path::new("/dev/null"),
            device_set(2),
            socket_set(1),
        )
        .unwrap_err();
        assert!(matches!(err, MeshError::Spawn(_)));
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let err = spawn_worker(
            Path::new("/nonexistent/worker"),
            Path::new("/tmp/ctl.sock"),
            device_set(1),
            socket_set(1),
        )
        .unwrap_err();
        assert!(matches!(err, MeshError::Spawn(_)));
    }

    #[tokio::test]
    async fn test_terminate_stops_child() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id().unwrap();
        terminate(pid).unwrap();
        let status = child.wait().await.unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn test_kill_ignores_sigterm() {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg("trap '' TERM; exec sleep 30")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        terminate(pid).unwrap();
        let waited = tokio::time::timeout(std::time::Duration::from_millis(300), child.wait()).await;
        assert!(waited.is_err());

        kill(pid).unwrap();
        let status = child.wait().await.unwrap();
        assert!(!status.success());
        // Reaped: no-op.
        kill(pid).unwrap();
    }

    #[test]
    fn test_worker_binary_override() {
        let config = Config {
            worker_binary: Some(PathBuf::from("/opt/mesh/worker")),
            ..Config::default()
        };
        assert_eq!(worker_binary(&config).unwrap(), PathBuf::from("/opt/mesh/worker"));
        let default = worker_binary(&Config::default()).unwrap();
        assert!(default.ends_with(WORKER_BINARY_NAME));
    }
}
