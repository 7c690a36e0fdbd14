//! Builder pattern for Coordinator construction

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::channel::ChannelConfig;
use crate::config::Config;
use crate::error::{MechanicError, Result};
use crate::metrics::{shared, InMemoryMetricsStore, SharedMetricsStore};
use crate::topology::{HostResolver, SystemResolver};
use crate::traits::ComponentProvider;
use crate::worker::{InProcessSpawner, WorkerSpawner};

use super::executor::Coordinator;
use super::handle::EngineHandle;
use super::reachability::{Clock, ReachabilityProbe, TcpProbe, TokioClock, DEFAULT_POLL_INTERVAL};

/// Builder for a coordinator task
///
/// Only the component provider is mandatory. Workers are spawned as local
/// tasks unless another [`WorkerSpawner`] is set.
///
/// # Example
///
/// ```ignore
/// let mut engine = CoordinatorBuilder::new()
///     .provider(provider)
///     .local_config(local_config)
///     .spawn()?;
///
/// let started = engine.start_engine(start).await?;
/// ```
pub struct CoordinatorBuilder {
    provider: Option<Arc<dyn ComponentProvider>>,
    spawner: Option<Arc<dyn WorkerSpawner>>,
    resolver: Arc<dyn HostResolver>,
    probe: Arc<dyn ReachabilityProbe>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    local_config: Config,
    metrics: Option<SharedMetricsStore>,
    channel_config: ChannelConfig,
}

impl CoordinatorBuilder {
    /// Create a builder with default collaborators
    pub fn new() -> Self {
        Self {
            provider: None,
            spawner: None,
            resolver: Arc::new(SystemResolver),
            probe: Arc::new(TcpProbe::default()),
            clock: Arc::new(TokioClock),
            poll_interval: DEFAULT_POLL_INTERVAL,
            local_config: Config::new("local"),
            metrics: None,
            channel_config: ChannelConfig::default(),
        }
    }

    /// Set the component provider
    pub fn provider(mut self, provider: Arc<dyn ComponentProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Set the worker spawner
    pub fn spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    /// Set the host name resolver
    pub fn resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Set the probe for remote worker endpoints
    pub fn probe(mut self, probe: Arc<dyn ReachabilityProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Set the clock used between probes
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the interval between probes
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the host-local configuration handed to the default spawner
    pub fn local_config(mut self, local_config: Config) -> Self {
        self.local_config = local_config;
        self
    }

    /// Set the run-wide metrics store
    pub fn metrics_store(mut self, metrics: SharedMetricsStore) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Set the channel configuration
    pub fn channel_config(mut self, config: ChannelConfig) -> Self {
        self.channel_config = config;
        self
    }

    /// Spawn the coordinator on the current tokio runtime
    ///
    /// # Errors
    /// Returns an error if no component provider is set.
    pub fn spawn(self) -> Result<EngineHandle> {
        let provider = self
            .provider
            .ok_or_else(|| MechanicError::setup("Coordinator requires a component provider"))?;
        let channels = self.channel_config;

        let spawner = match self.spawner {
            Some(spawner) => spawner,
            None => Arc::new(
                InProcessSpawner::new(provider.clone(), self.local_config)
                    .with_buffer(channels.worker_buffer),
            ),
        };
        let metrics = self
            .metrics
            .unwrap_or_else(|| shared(InMemoryMetricsStore::new()));

        let (command_tx, command_rx) = mpsc::channel(channels.command_buffer);
        let (event_tx, event_rx) = mpsc::channel(channels.event_buffer);
        let (notify_tx, notify_rx) = mpsc::channel(channels.notification_buffer);

        let coordinator = Coordinator::new(
            provider,
            spawner,
            self.resolver,
            self.probe,
            self.clock,
            self.poll_interval,
            metrics,
            event_tx,
            notify_tx,
        );
        let task = tokio::spawn(coordinator.run(command_rx, notify_rx));

        Ok(EngineHandle::new(command_tx, event_rx, task))
    }
}

impl Default for CoordinatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CoordinatorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorBuilder")
            .field("has_provider", &self.provider.is_some())
            .field("has_spawner", &self.spawner.is_some())
            .field("poll_interval", &self.poll_interval)
            .field("local_config", &self.local_config.name)
            .field("channel_config", &self.channel_config)
            .finish()
    }
}
