//! Waiting for remote worker endpoints
//!
//! Before a worker is placed on a remote host the coordinator polls the
//! host's daemon endpoint at a fixed interval until it answers. There is no
//! attempt limit; progress is shown on the console instead.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::net::TcpStream;

/// Port the remote worker daemon listens on
pub const DEFAULT_DAEMON_PORT: u16 = 1900;

/// Pause between two reachability probes
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Source of sleeps for the reachability poll
pub trait Clock: Send + Sync {
    /// Sleep for the given duration
    fn sleep(&self, duration: Duration) -> BoxFuture<'_, ()>;
}

/// Clock backed by the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn sleep(&self, duration: Duration) -> BoxFuture<'_, ()> {
        tokio::time::sleep(duration).boxed()
    }
}

/// Checks whether a remote worker endpoint answers
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// Whether the endpoint on `ip` is reachable right now
    async fn is_reachable(&self, ip: IpAddr) -> bool;
}

/// Probe that opens a TCP connection to the daemon port
#[derive(Debug, Clone)]
pub struct TcpProbe {
    port: u16,
    timeout: Duration,
}

impl TcpProbe {
    /// Create a probe for the given port
    pub fn new(port: u16) -> Self {
        Self {
            port,
            timeout: Duration::from_secs(1),
        }
    }

    /// Set the connect timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(DEFAULT_DAEMON_PORT)
    }
}

#[async_trait]
impl ReachabilityProbe for TcpProbe {
    async fn is_reachable(&self, ip: IpAddr) -> bool {
        let addr = SocketAddr::new(ip, self.port);
        matches!(
            tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }
}

/// Poll `ip` until it is reachable
///
/// Returns the number of failed probes.
pub async fn wait_until_reachable(
    ip: IpAddr,
    probe: &dyn ReachabilityProbe,
    clock: &dyn Clock,
    interval: Duration,
) -> usize {
    if probe.is_reachable(ip).await {
        tracing::debug!(%ip, "Worker endpoint already running");
        return 0;
    }

    tracing::info!(%ip, "Waiting for worker endpoint");
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed}] {msg}") {
        spinner.set_style(style);
    }
    spinner.set_message(format!("Waiting for worker daemon on [{ip}]"));

    let mut attempts = 1;
    loop {
        clock.sleep(interval).await;
        spinner.tick();
        if probe.is_reachable(ip).await {
            break;
        }
        attempts += 1;
    }

    spinner.finish_with_message(format!("Worker daemon on [{ip}] [OK]"));
    tracing::info!(%ip, attempts, "Worker endpoint reachable");
    attempts
}
