//! Per-queue packet pipelines.
//!
//! A worker runs one [`Incoming`] and one [`Outgoing`] pipeline for every
//! queue it owns. Each pipeline is a tokio task with its own reusable
//! [`Payload`](crate::payload::Payload) and its own resolver connection;
//! the socket, device and stat sink are shared.
//!
//! Every packet produces exactly one [`Stat`], dropped or not.

mod incoming;
mod outgoing;

pub use incoming::Incoming;
pub use outgoing::Outgoing;

use crate::config::Config;
use crate::device::Device;
use crate::error::{MeshError, MeshResult};
use crate::mapping::Mapping;
use crate::socket::Socket;
use crate::stats::{Direction, Stat};
use ipnet::Ipv4Net;
use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Resolves a private IP to the peer's mapping.
pub trait MappingResolver: Send + Sync + 'static {
    fn mapping(&self, private_ip: Ipv4Addr) -> impl Future<Output = MeshResult<Mapping>> + Send;
}

/// Fire-and-forget stat reporting. Must never block the caller.
pub trait StatSink: Send + Sync + 'static {
    fn sink(&self, stat: Stat);
}

/// Returns true if `ip` belongs to any of the `trusted` networks.
pub fn is_trusted(trusted: &[Ipv4Net], ip: Ipv4Addr) -> bool {
    trusted.iter().any(|net| net.contains(&ip))
}

/// Cooperative stop signal shared by every pipeline of a worker.
#[derive(Clone, Default)]
pub struct StopFlag {
    inner: Arc<StopInner>,
}

#[derive(Default)]
struct StopInner {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag and wake every waiter.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Resolves once the flag is raised.
    pub async fn stopped(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }
}

pub(crate) fn stat(
    queue: usize,
    direction: Direction,
    dropped: bool,
    bytes: usize,
    peer: Option<Ipv4Addr>,
) -> Stat {
    Stat {
        queue,
        direction,
        dropped,
        bytes: bytes as u64,
        private_ip: peer.map(|ip| ip.to_string()).unwrap_or_default(),
    }
}

/// Log level for a dropped packet: per-packet conditions stay at trace,
/// queue and control failures surface at debug.
pub(crate) fn drop_level(error: &MeshError) -> log::Level {
    if error.is_packet_level() {
        log::Level::Trace
    } else {
        log::Level::Debug
    }
}

/// The running pipelines of one worker.
pub struct Workers<S, D> {
    socket: Arc<S>,
    device: Arc<D>,
    stop: StopFlag,
    grace: Duration,
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl<S: Socket, D: Device> Workers<S, D> {
    /// Start one incoming and one outgoing pipeline per queue.
    ///
    /// `resolvers` holds one `(incoming, outgoing)` pair per queue.
    pub fn start<R, K>(
        config: Arc<Config>,
        socket: Arc<S>,
        device: Arc<D>,
        resolvers: Vec<(R, R)>,
        stats: K,
    ) -> MeshResult<Self>
    where
        R: MappingResolver,
        K: StatSink + Clone,
    {
        let queues = socket.queues().len();
        if device.queues().len() != queues || resolvers.len() != queues {
            return Err(MeshError::Config(format!(
                "queue mismatch: {} socket, {} device, {} resolver pairs",
                queues,
                device.queues().len(),
                resolvers.len()
            )));
        }

        let stop = StopFlag::new();
        let mut tasks = Vec::with_capacity(2 * queues);
        for (queue, (inbound, outbound)) in resolvers.into_iter().enumerate() {
            let incoming = Incoming::new(
                queue,
                socket.clone(),
                device.clone(),
                inbound,
                stats.clone(),
            );
            tasks.push((
                format!("incoming[{}]", queue),
                tokio::spawn(incoming.run(stop.clone())),
            ));

            let outgoing = Outgoing::new(
                queue,
                config.clone(),
                socket.clone(),
                device.clone(),
                outbound,
                stats.clone(),
            );
            tasks.push((
                format!("outgoing[{}]", queue),
                tokio::spawn(outgoing.run(stop.clone())),
            ));
        }
        log::info!("Started {} pipeline(s) on {} queue(s)", tasks.len(), queues);

        Ok(Self {
            socket,
            device,
            stop,
            grace: config.shutdown_grace(),
            tasks,
        })
    }

    /// Number of running pipeline tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Raise the stop flag and wait up to the grace period for the pipelines
    /// to finish; stragglers are aborted. Returns the socket and device once
    /// no pipeline holds them anymore.
    pub async fn stop(self) -> (Arc<S>, Arc<D>) {
        self.stop.stop();
        let deadline = tokio::time::Instant::now() + self.grace;
        for (name, mut handle) in self.tasks {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_panic() => log::error!("Pipeline {} panicked", name),
                Ok(Err(e)) => log::debug!("Pipeline {} ended: {}", name, e),
                Err(_) => {
                    log::warn!(
                        "Pipeline {} did not stop within {:?}, aborting",
                        name,
                        self.grace
                    );
                    handle.abort();
                    let _ = handle.await;
                }
            }
        }
        (self.socket, self.device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockDevice, MockResolver, MockSink, MockSocket};

    #[test]
    fn test_is_trusted() {
        let trusted: Vec<Ipv4Net> = vec![
            "10.99.0.0/24".parse().unwrap(),
            "192.168.10.0/30".parse().unwrap(),
        ];
        assert!(is_trusted(&trusted, Ipv4Addr::new(10, 99, 0, 200)));
        assert!(is_trusted(&trusted, Ipv4Addr::new(192, 168, 10, 3)));
        assert!(!is_trusted(&trusted, Ipv4Addr::new(192, 168, 10, 4)));
        assert!(!is_trusted(&trusted, Ipv4Addr::new(10, 99, 1, 1)));
    }

    #[test]
    fn test_drop_level() {
        assert_eq!(
            drop_level(&MeshError::MappingNotFound("10.99.0.9".into())),
            log::Level::Trace
        );
        assert_eq!(
            drop_level(&MeshError::Cipher("authentication failed".into())),
            log::Level::Trace
        );
        assert_eq!(
            drop_level(&MeshError::Control("master closed the channel".into())),
            log::Level::Debug
        );
        assert_eq!(
            drop_level(&MeshError::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe))),
            log::Level::Debug
        );
    }

    #[test]
    fn test_empty_trust_list_trusts_nobody() {
        assert!(!is_trusted(&[], Ipv4Addr::new(10, 99, 0, 1)));
        assert!(!is_trusted(&[], Ipv4Addr::UNSPECIFIED));
    }

    #[tokio::test]
    async fn test_stop_flag_wakes_waiters() {
        let flag = StopFlag::new();
        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move { flag.stopped().await })
        };
        tokio::task::yield_now().await;
        assert!(!flag.is_stopped());
        flag.stop();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        // Already raised: returns immediately.
        flag.stopped().await;
    }

    #[tokio::test]
    async fn test_start_rejects_queue_mismatch() {
        let config = Arc::new(Config::default());
        let result = Workers::start(
            config,
            Arc::new(MockSocket::new(2)),
            Arc::new(MockDevice::new(1)),
            vec![(MockResolver::default(), MockResolver::default())],
            MockSink::default(),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_idle_pipelines_stop_promptly() {
        let config = Arc::new(Config {
            shutdown_grace_secs: 5,
            ..Config::default()
        });
        let socket = Arc::new(MockSocket::new(2));
        let device = Arc::new(MockDevice::new(2));
        let workers = Workers::start(
            config,
            socket,
            device,
            vec![
                (MockResolver::default(), MockResolver::default()),
                (MockResolver::default(), MockResolver::default()),
            ],
            MockSink::default(),
        )
        .unwrap();
        assert_eq!(workers.len(), 4);

        let started = tokio::time::Instant::now();
        let (socket, device) = workers.stop().await;
        assert!(started.elapsed() < Duration::from_secs(1));
        // Every pipeline released its handles.
        assert!(Arc::try_unwrap(socket).is_ok());
        assert!(Arc::try_unwrap(device).is_ok());
    }
}
