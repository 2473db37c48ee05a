//! Termination signal handling shared by the master and the workers.

use tokio::signal::unix::{signal, SignalKind};

/// Signal that ended a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    Interrupt,
    Terminate,
}

impl std::fmt::Display for Shutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Shutdown::Interrupt => write!(f, "SIGINT"),
            Shutdown::Terminate => write!(f, "SIGTERM"),
        }
    }
}

/// Wait for SIGINT or SIGTERM.
///
/// Falls back to SIGINT alone if the SIGTERM handler cannot be installed.
pub async fn wait_for_shutdown() -> Shutdown {
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => Shutdown::Interrupt,
                _ = sigterm.recv() => Shutdown::Terminate,
            }
        }
        Err(e) => {
            log::warn!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            Shutdown::Interrupt
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_sigterm_ends_wait() {
        let waiter = tokio::spawn(wait_for_shutdown());
        // Give the handler time to register before raising the signal.
        tokio::time::sleep(Duration::from_millis(50)).await;
        // SAFETY: raise has no memory-safety preconditions.
        unsafe { libc::raise(libc::SIGTERM) };
        let got = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, Shutdown::Terminate);
    }
}
