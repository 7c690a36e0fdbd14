//! Host worker receive loop

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::{Config, WORKER_SECTIONS};
use crate::error::{MechanicError, Result};
use crate::metrics::{shared, InMemoryMetricsStore, SharedMetricsStore};
use crate::pipeline::{Mechanic, PipelineFactory};
use crate::protocol::{
    Dispatch, Failure, NodeAssignment, StartNodes, WorkerCommand, WorkerEvent, WorkerId,
    WorkerNotification,
};
use crate::traits::ComponentProvider;

/// Coordination unit of one host
///
/// Runs as its own tokio task; see [`HostWorker::run`].
pub struct HostWorker {
    /// Worker identifier within the run
    id: WorkerId,

    /// Builds the pipeline on start-nodes
    factory: PipelineFactory,

    /// Host-local configuration the run-wide sections are merged into
    local_config: Config,

    /// Local metrics store of the current run
    metrics: Option<SharedMetricsStore>,

    /// Pipeline of the current run
    mechanic: Option<Mechanic>,

    /// Whether the pipeline has nodes running
    running: bool,
}

impl HostWorker {
    /// Create an idle worker
    pub fn new(id: WorkerId, provider: Arc<dyn ComponentProvider>, local_config: Config) -> Self {
        Self {
            id,
            factory: PipelineFactory::new(provider),
            local_config,
            metrics: None,
            mechanic: None,
            running: false,
        }
    }

    /// Worker identifier
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Whether the pipeline has nodes running
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Process commands until `Exit` arrives or the inbox closes
    ///
    /// An active pipeline is torn down best-effort before the task ends.
    pub async fn run(
        mut self,
        mut inbox: mpsc::Receiver<Dispatch>,
        notifications: mpsc::Sender<WorkerNotification>,
    ) {
        tracing::debug!(worker = %self.id, "Worker started");

        while let Some(Dispatch { round, command }) = inbox.recv().await {
            if matches!(command, WorkerCommand::Exit) {
                tracing::debug!(worker = %self.id, "Worker asked to exit");
                break;
            }

            let event = self.receive(command).await;
            let reply = WorkerNotification::Replied {
                worker: self.id,
                round,
                event,
            };
            if notifications.send(reply).await.is_err() {
                tracing::debug!(worker = %self.id, "Coordinator gone, worker stopping");
                break;
            }
        }

        self.shutdown().await;
        tracing::debug!(worker = %self.id, "Worker finished");
    }

    /// Handle one command and turn any error into a failure event
    pub async fn receive(&mut self, command: WorkerCommand) -> WorkerEvent {
        let name = command.name();
        tracing::debug!(worker = %self.id, command = name, "Received command");

        match self.handle(command).await {
            Ok(event) => event,
            Err(e) => {
                tracing::error!(worker = %self.id, command = name, error = %e, "Command failed");
                self.running = false;
                WorkerEvent::Failure(Failure::from_error(&e))
            }
        }
    }

    async fn handle(&mut self, command: WorkerCommand) -> Result<WorkerEvent> {
        match command {
            WorkerCommand::StartNodes(start) => self.start_nodes(*start).await,
            WorkerCommand::ApplyMetricsMetaInfo(meta) => {
                self.metrics()?.lock().merge_meta_info(&meta);
                Ok(WorkerEvent::MetricsMetaInfoApplied)
            }
            WorkerCommand::OnBenchmarkStart { lap } => {
                self.metrics()?.lock().set_lap(lap);
                self.mechanic()?.on_benchmark_start().await?;
                Ok(WorkerEvent::BenchmarkStarted)
            }
            WorkerCommand::OnBenchmarkStop => {
                self.mechanic()?.on_benchmark_stop().await?;
                let system_metrics = self.metrics()?.lock().to_externalizable(true);
                Ok(WorkerEvent::BenchmarkStopped { system_metrics })
            }
            WorkerCommand::StopNodes => self.stop_nodes().await,
            WorkerCommand::Exit => Err(MechanicError::protocol("exit is not answered")),
        }
    }

    async fn start_nodes(&mut self, start: StartNodes) -> Result<WorkerEvent> {
        if self.running {
            return Err(MechanicError::protocol(format!(
                "{} already has nodes running",
                self.id
            )));
        }

        let StartNodes {
            cfg,
            metrics_context,
            cluster_settings,
            mode,
            assignment,
        } = start;

        let mut host_cfg = self.local_config.clone();
        for section in WORKER_SECTIONS {
            host_cfg.add_all(&cfg, section);
        }

        let all_node_ips = match assignment {
            NodeAssignment::External {
                hosts,
                ip,
                port,
                node_ids,
            } => {
                tracing::info!(worker = %self.id, hosts = hosts.len(), ip = ?ip, "Connecting to external cluster");
                if let Some(ip) = ip {
                    host_cfg.add("provisioning", "node.ip", ip.to_string());
                }
                if let Some(port) = port {
                    host_cfg.add("provisioning", "node.http.port", port);
                }
                if let Some(node_ids) = node_ids {
                    host_cfg.add("provisioning", "node.ids", node_ids);
                }
                Vec::new()
            }
            NodeAssignment::Managed {
                all_node_ips,
                ip,
                port,
                node_ids,
            } => {
                tracing::info!(worker = %self.id, %ip, port, node_ids = ?node_ids, "Starting nodes");
                host_cfg.add("provisioning", "node.ip", ip.to_string());
                host_cfg.add("provisioning", "node.http.port", port);
                host_cfg.add("provisioning", "node.ids", node_ids);
                all_node_ips
            }
        };

        let metrics = shared(InMemoryMetricsStore::opened(&metrics_context));
        self.metrics = Some(metrics.clone());

        let mut mechanic =
            self.factory
                .create(&host_cfg, metrics.clone(), &all_node_ips, cluster_settings, mode)?;
        let nodes = mechanic.start_engine().await?;
        self.mechanic = Some(mechanic);
        self.running = true;

        let system_meta = metrics.lock().meta_info().clone();
        Ok(WorkerEvent::NodesStarted { nodes, system_meta })
    }

    async fn stop_nodes(&mut self) -> Result<WorkerEvent> {
        if self.running {
            if let Some(mechanic) = self.mechanic.as_mut() {
                mechanic.stop_engine().await?;
            }
        } else {
            tracing::debug!(worker = %self.id, "No nodes running, nothing to stop");
        }

        let system_metrics = self
            .metrics
            .as_ref()
            .map(|m| m.lock().to_externalizable(false))
            .unwrap_or_default();
        self.reset();
        Ok(WorkerEvent::NodesStopped { system_metrics })
    }

    /// Best-effort teardown when the worker is terminated
    async fn shutdown(&mut self) {
        if self.running {
            if let Some(mechanic) = self.mechanic.as_mut() {
                tracing::info!(worker = %self.id, "Stopping nodes before exit");
                if let Err(e) = mechanic.stop_engine().await {
                    tracing::debug!(worker = %self.id, error = %e, "Ignoring teardown failure on exit");
                }
            }
        }
        self.reset();
    }

    fn reset(&mut self) {
        self.metrics = None;
        self.mechanic = None;
        self.running = false;
    }

    fn metrics(&self) -> Result<&SharedMetricsStore> {
        self.metrics
            .as_ref()
            .ok_or_else(|| MechanicError::protocol(format!("{} has no active run", self.id)))
    }

    fn mechanic(&mut self) -> Result<&mut Mechanic> {
        match self.mechanic.as_mut() {
            Some(mechanic) if self.running => Ok(mechanic),
            _ => Err(MechanicError::protocol(format!(
                "{} has no nodes running",
                self.id
            ))),
        }
    }
}

impl std::fmt::Debug for HostWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostWorker")
            .field("id", &self.id)
            .field("running", &self.running)
            .field("mechanic", &self.mechanic)
            .finish()
    }
}
