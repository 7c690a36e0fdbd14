//! Coordinator receive loop

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::Config;
use crate::error::{MechanicError, Result};
use crate::metrics::SharedMetricsStore;
use crate::protocol::{
    AcquisitionMode, ClusterMetaInfo, EngineCommand, EngineEvent, EngineReply, EngineRequest,
    EngineStarted, Failure, NodeAssignment, RequestId, Round, StartEngine, WorkerCommand,
    WorkerEvent, WorkerId, WorkerNotification,
};
use crate::topology::{HostResolver, Topology};
use crate::traits::{Cluster, ClusterLauncher, ComponentProvider};
use crate::worker::{Placement, WorkerHandle, WorkerSpawner};

use super::barrier::{BarrierProgress, ResponseBarrier};
use super::reachability::{wait_until_reachable, Clock, ReachabilityProbe};
use super::state::LifecycleState;

use LifecycleState::*;

/// Whether the receive loop keeps going
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// A worker to create for the run
struct PlannedWorker {
    id: WorkerId,
    name: String,
    placement: Placement,
    assignment: NodeAssignment,
}

/// Cluster-level state machine of one run
///
/// Owns the run-wide configuration and metrics store, the host workers and
/// the cluster launcher. Every phase is a fan-out to all workers followed by
/// a barrier on their replies; see [`Coordinator::run`].
pub struct Coordinator {
    pub(crate) provider: Arc<dyn ComponentProvider>,
    pub(crate) spawner: Arc<dyn WorkerSpawner>,
    pub(crate) resolver: Arc<dyn HostResolver>,
    pub(crate) probe: Arc<dyn ReachabilityProbe>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) poll_interval: Duration,

    /// Run-wide metrics store
    pub(crate) metrics: SharedMetricsStore,

    /// Events to the run-control caller
    pub(crate) events: mpsc::Sender<EngineReply>,

    /// Handed to every spawned worker
    pub(crate) notifications: mpsc::Sender<WorkerNotification>,

    state: LifecycleState,

    /// Current fan-out; replies of other rounds are stale
    round: Round,

    /// Whether a worker failed in the current round
    round_failed: bool,

    /// Caller request that opened the current phase
    answering: RequestId,

    cfg: Option<Config>,

    /// First id handed out to the next set of workers
    next_worker_id: usize,

    workers: BTreeMap<WorkerId, WorkerHandle>,
    barrier: ResponseBarrier,
    cluster_launcher: Option<Box<dyn ClusterLauncher>>,
    cluster: Option<Box<dyn Cluster>>,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        provider: Arc<dyn ComponentProvider>,
        spawner: Arc<dyn WorkerSpawner>,
        resolver: Arc<dyn HostResolver>,
        probe: Arc<dyn ReachabilityProbe>,
        clock: Arc<dyn Clock>,
        poll_interval: Duration,
        metrics: SharedMetricsStore,
        events: mpsc::Sender<EngineReply>,
        notifications: mpsc::Sender<WorkerNotification>,
    ) -> Self {
        Self {
            provider,
            spawner,
            resolver,
            probe,
            clock,
            poll_interval,
            metrics,
            events,
            notifications,
            state: Idle,
            round: Round::default(),
            round_failed: false,
            answering: RequestId::default(),
            cfg: None,
            next_worker_id: 0,
            workers: BTreeMap::new(),
            barrier: ResponseBarrier::new(),
            cluster_launcher: None,
            cluster: None,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Run until the engine has stopped or the caller is gone
    ///
    /// Remaining workers are told to exit before the task ends.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<EngineRequest>,
        mut notifications: mpsc::Receiver<WorkerNotification>,
    ) {
        tracing::debug!("Coordinator started");

        loop {
            let flow = tokio::select! {
                command = commands.recv() => match command {
                    Some(request) => self.on_command(request).await,
                    None => {
                        tracing::debug!("Run control gone, coordinator stopping");
                        Flow::Stop
                    }
                },
                Some(notification) = notifications.recv() => {
                    self.on_notification(notification).await
                }
            };
            if flow == Flow::Stop {
                break;
            }
        }

        self.release_workers();
        tracing::debug!(state = %self.state, "Coordinator finished");
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    async fn on_command(&mut self, request: EngineRequest) -> Flow {
        let EngineRequest { id, command } = request;
        let name = command.name();
        tracing::debug!(command = name, %id, state = %self.state, "Received command");

        let result = match command {
            EngineCommand::StartEngine(start) => self.start_engine(id, *start).await,
            EngineCommand::OnBenchmarkStart { lap } => self.on_benchmark_start(id, lap).await,
            EngineCommand::OnBenchmarkStop => self.on_benchmark_stop(id).await,
            EngineCommand::StopEngine => self.stop_engine(id).await,
        };

        if let Err(e) = result {
            self.escalate(id, name, e).await;
        }
        Flow::Continue
    }

    async fn on_notification(&mut self, notification: WorkerNotification) -> Flow {
        let result = match notification {
            WorkerNotification::Replied {
                worker,
                round,
                event,
            } => {
                let name = event.name();
                self.on_worker_event(worker, round, event).await.map_err(|e| (name, e))
            }
            WorkerNotification::Exited { worker, detail } => {
                self.on_worker_exit(worker, &detail).map(|()| Flow::Continue).map_err(|e| ("exit", e))
            }
        };

        match result {
            Ok(flow) => flow,
            Err((name, e)) => {
                self.escalate(self.answering, name, e).await;
                Flow::Continue
            }
        }
    }

    async fn on_worker_event(
        &mut self,
        worker: WorkerId,
        round: Round,
        event: WorkerEvent,
    ) -> Result<Flow> {
        tracing::debug!(%worker, %round, event = event.name(), state = %self.state, "Received worker event");

        if round != self.round {
            tracing::debug!(%worker, %round, current = %self.round, event = event.name(), "Discarding reply of a superseded round");
            return Ok(Flow::Continue);
        }

        if let WorkerEvent::Failure(failure) = event {
            tracing::error!(%worker, message = %failure.message, state = %self.state, "Worker failed");
            self.round_failed = true;
            emit(&self.events, self.answering, EngineEvent::Failure(failure)).await;
            return Ok(Flow::Continue);
        }

        if self.round_failed {
            tracing::debug!(%worker, event = event.name(), "Discarding reply of a failed round");
            return Ok(Flow::Continue);
        }

        match event {
            WorkerEvent::NodesStarted { system_meta, .. } => {
                let progress = self.arrive(worker, Starting, NodesStarted)?;
                self.metrics.lock().merge_meta_info(&system_meta);
                if progress == BarrierProgress::Complete {
                    self.on_all_nodes_started().await?;
                }
            }
            WorkerEvent::MetricsMetaInfoApplied => {
                if self.arrive(worker, ApplyMetaInfo, ClusterStarted)? == BarrierProgress::Complete {
                    self.on_cluster_started().await?;
                }
            }
            WorkerEvent::BenchmarkStarted => {
                if self.arrive(worker, BenchmarkStarting, BenchmarkStarted)? == BarrierProgress::Complete {
                    self.cluster()?.on_benchmark_start().await?;
                    emit(&self.events, self.answering, EngineEvent::BenchmarkStarted).await;
                }
            }
            WorkerEvent::BenchmarkStopped { system_metrics } => {
                let progress = self.arrive(worker, BenchmarkStopping, BenchmarkStopped)?;
                self.metrics.lock().bulk_add(system_metrics);
                if progress == BarrierProgress::Complete {
                    self.cluster()?.on_benchmark_stop().await?;
                    let system_metrics = self.metrics.lock().to_externalizable(true);
                    let stopped = EngineEvent::BenchmarkStopped { system_metrics };
                    emit(&self.events, self.answering, stopped).await;
                }
            }
            WorkerEvent::NodesStopped { system_metrics } => {
                let progress = self.arrive(worker, ClusterStopping, ClusterStopped)?;
                self.metrics.lock().bulk_add(system_metrics);
                if progress == BarrierProgress::Complete {
                    let system_metrics = self.metrics.lock().to_externalizable(false);
                    let stopped = EngineEvent::EngineStopped { system_metrics };
                    emit(&self.events, self.answering, stopped).await;
                    return Ok(Flow::Stop);
                }
            }
            WorkerEvent::Failure(_) => {}
        }
        Ok(Flow::Continue)
    }

    fn on_worker_exit(&mut self, worker: WorkerId, detail: &str) -> Result<()> {
        if !self.workers.contains_key(&worker) {
            tracing::debug!(%worker, detail, "Ignoring exit of a released worker");
            return Ok(());
        }
        if self.state == ClusterStopping {
            tracing::info!(%worker, detail, "Worker exited while the engine is stopping");
            return Ok(());
        }
        Err(MechanicError::protocol(format!(
            "{worker} exited with [{detail}] while in state [{}]",
            self.state
        )))
    }

    // ========================================================================
    // Caller commands
    // ========================================================================

    async fn start_engine(&mut self, request: RequestId, start: StartEngine) -> Result<()> {
        self.accept(request, &[Idle], "start-engine")?;
        tracing::info!(mode = %start.mode, "Starting engine");

        let hosts = start.cfg.hosts()?;
        if hosts.is_empty() {
            return Err(MechanicError::launch("No target hosts are configured."));
        }
        self.metrics.lock().open(&start.metrics_context);

        let plan = self.plan_workers(&start).await?;
        self.next_worker_id += plan.len();

        // no start-nodes is sent unless every worker could be created
        let mut spawned = BTreeMap::new();
        let mut assignments = Vec::with_capacity(plan.len());
        for planned in plan {
            match self.spawner.spawn(
                planned.id,
                &planned.name,
                planned.placement,
                self.notifications.clone(),
            ) {
                Ok(handle) => {
                    spawned.insert(planned.id, handle);
                    assignments.push((planned.id, planned.assignment));
                }
                Err(e) => {
                    tracing::error!(worker = %planned.id, name = %planned.name, error = %e, "Could not create worker");
                    for handle in spawned.values() {
                        let _ = handle.exit();
                    }
                    return Err(e);
                }
            }
        }

        self.workers = spawned;
        self.cfg = Some(start.cfg.clone());
        self.next_round();
        self.state = Starting;
        tracing::info!(workers = self.workers.len(), round = %self.round, state = %self.state, "Dispatching start-nodes");

        for (id, assignment) in assignments {
            let command = WorkerCommand::StartNodes(Box::new(start.for_nodes(assignment)));
            if let Some(worker) = self.workers.get(&id) {
                if let Err(e) = worker.send(self.round, command).await {
                    tracing::error!(%id, error = %e, "Could not deliver start-nodes");
                    self.round_failed = true;
                    return Err(MechanicError::launch(
                        "Could not start benchmark candidate. Are daemons on all targeted machines running?",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Decide which workers to create, polling remote hosts until reachable
    async fn plan_workers(&mut self, start: &StartEngine) -> Result<Vec<PlannedWorker>> {
        let cfg = &start.cfg;
        let hosts = cfg.hosts()?;
        let base = self.next_worker_id;

        if start.mode == AcquisitionMode::External {
            tracing::info!(hosts = hosts.len(), "Cluster will not be provisioned");
            return Ok(vec![PlannedWorker {
                id: WorkerId(base),
                name: "mechanic/worker/external".to_string(),
                placement: Placement::Coordinator,
                assignment: NodeAssignment::External {
                    hosts,
                    ip: start.ip,
                    port: start.port,
                    node_ids: start.node_ids.clone(),
                },
            }]);
        }

        let topology = Topology::resolve(&hosts, self.resolver.as_ref())?;
        tracing::info!(
            nodes = topology.node_count(),
            hosts = topology.groups.len(),
            "Cluster will be provisioned"
        );

        let remote: BTreeSet<_> = topology
            .groups
            .iter()
            .filter(|g| !g.is_local())
            .map(|g| g.ip)
            .collect();
        if let Some(ip) = remote.iter().next() {
            if !cfg.remote_benchmarking_supported()? {
                return Err(MechanicError::setup(format!(
                    "To benchmark remote hosts (e.g. {ip}) you need to start the worker daemon \
                     on each machine including this one."
                )));
            }
        }
        for ip in &remote {
            wait_until_reachable(*ip, self.probe.as_ref(), self.clock.as_ref(), self.poll_interval)
                .await;
        }

        Ok(topology
            .groups
            .iter()
            .enumerate()
            .map(|(i, group)| PlannedWorker {
                id: WorkerId(base + i),
                name: format!("mechanic/worker/{}:{}", group.ip, group.port),
                placement: if group.is_local() {
                    Placement::Coordinator
                } else {
                    Placement::Remote { ip: group.ip }
                },
                assignment: NodeAssignment::Managed {
                    all_node_ips: topology.all_node_ips.clone(),
                    ip: group.ip,
                    port: group.port,
                    node_ids: group.node_ids.clone(),
                },
            })
            .collect())
    }

    async fn on_benchmark_start(&mut self, request: RequestId, lap: u32) -> Result<()> {
        let allowed = [ClusterStarted, BenchmarkStopped];
        self.accept(request, &allowed, "on-benchmark-start")?;

        self.metrics.lock().set_lap(lap);
        self.cluster()?.on_benchmark_start().await?;
        self.fan_out(WorkerCommand::OnBenchmarkStart { lap }, &allowed, BenchmarkStarting)
            .await
    }

    async fn on_benchmark_stop(&mut self, request: RequestId) -> Result<()> {
        let allowed = [BenchmarkStarted];
        self.accept(request, &allowed, "on-benchmark-stop")?;
        self.fan_out(WorkerCommand::OnBenchmarkStop, &allowed, BenchmarkStopping)
            .await
    }

    async fn stop_engine(&mut self, request: RequestId) -> Result<()> {
        let allowed = self.stop_allowed_from();
        self.accept(request, &allowed, "stop-engine")?;

        if let (Some(launcher), Some(cluster)) = (self.cluster_launcher.as_mut(), self.cluster.take()) {
            if let Err(e) = launcher.stop(cluster).await {
                tracing::warn!(error = %e, "Could not detach from cluster");
            }
        }
        self.cluster_launcher = None;

        if self.round_failed {
            tracing::info!(state = %self.state, round = %self.round, "Tearing down after a failed round");
        }
        self.fan_out(WorkerCommand::StopNodes, &allowed, ClusterStopping).await
    }

    /// Teardown is reachable after partial startup and, once a round has
    /// failed, from the state that round was left in
    fn stop_allowed_from(&self) -> Vec<LifecycleState> {
        let mut allowed = vec![NodesStarted, BenchmarkStopped];
        if self.round_failed && self.state.awaits_replies() {
            allowed.push(self.state);
        }
        allowed
    }

    // ========================================================================
    // Barrier continuations
    // ========================================================================

    async fn on_all_nodes_started(&mut self) -> Result<()> {
        let cfg = self
            .cfg
            .as_ref()
            .ok_or_else(|| MechanicError::protocol("no run configuration"))?;
        let mut launcher = self.provider.cluster_launcher(cfg, self.metrics.clone())?;
        let cluster = launcher.start().await?;
        self.cluster_launcher = Some(launcher);
        self.cluster = Some(cluster);

        let meta = self.metrics.lock().meta_info().clone();
        self.fan_out(WorkerCommand::ApplyMetricsMetaInfo(meta), &[NodesStarted], ApplyMetaInfo)
            .await
    }

    async fn on_cluster_started(&mut self) -> Result<()> {
        let cluster = self.cluster()?;
        let info = ClusterMetaInfo::new(
            cluster.nodes(),
            cluster.source_revision(),
            cluster.distribution_version(),
        );
        let system_meta = self.metrics.lock().meta_info().clone();
        tracing::info!(nodes = info.node_count(), "Engine started");
        let started = EngineEvent::EngineStarted(Box::new(EngineStarted {
            cluster: info,
            system_meta,
        }));
        emit(&self.events, self.answering, started).await;
        Ok(())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Record a reply toward the barrier of `expected`
    ///
    /// On the last reply the state moves to `next`. Nothing is mutated when
    /// the reply is rejected.
    fn arrive(
        &mut self,
        worker: WorkerId,
        expected: LifecycleState,
        next: LifecycleState,
    ) -> Result<BarrierProgress> {
        self.state.require(&[expected], "reply")?;

        let live: BTreeSet<WorkerId> = self.workers.keys().copied().collect();
        let progress = self.barrier.record(worker, &live)?;
        match progress {
            BarrierProgress::Pending { received, expected } => {
                tracing::info!(
                    received,
                    expected,
                    from = %self.state,
                    to = %next,
                    "Workers responded"
                );
            }
            BarrierProgress::Complete => {
                tracing::info!(
                    workers = live.len(),
                    from = %self.state,
                    to = %next,
                    "All workers responded, transitioning"
                );
                self.state = next;
            }
        }
        Ok(progress)
    }

    /// Check a caller command against the current state
    ///
    /// An accepted command opens the phase whose events answer it.
    fn accept(&mut self, request: RequestId, allowed: &[LifecycleState], name: &str) -> Result<()> {
        self.state.require(allowed, name)?;
        self.answering = request;
        Ok(())
    }

    /// Start a new fan-out round with an empty barrier
    fn next_round(&mut self) {
        self.round = self.round.next();
        self.round_failed = false;
        self.barrier.clear();
    }

    /// Move to `next` and send `command` to every worker without waiting
    async fn fan_out(
        &mut self,
        command: WorkerCommand,
        allowed: &[LifecycleState],
        next: LifecycleState,
    ) -> Result<()> {
        self.state.require(allowed, command.name())?;
        self.next_round();
        tracing::info!(command = command.name(), round = %self.round, from = %self.state, to = %next, "Fanning out");
        self.state = next;

        for worker in self.workers.values() {
            if let Err(e) = worker.send(self.round, command.clone()).await {
                tracing::error!(worker = %worker.id, command = command.name(), error = %e, "Could not deliver command");
                self.round_failed = true;
                return Err(MechanicError::communication(format!(
                    "Could not communicate with benchmark candidate (unknown reason): {e}"
                )));
            }
        }
        Ok(())
    }

    fn cluster(&mut self) -> Result<&mut Box<dyn Cluster>> {
        self.cluster
            .as_mut()
            .ok_or_else(|| MechanicError::protocol("cluster has not been started"))
    }

    async fn escalate(&mut self, request: RequestId, what: &str, e: MechanicError) {
        tracing::error!(message = what, %request, state = %self.state, error = %e, "Cannot process message");
        emit(&self.events, request, EngineEvent::Failure(Failure::command_failed(&e))).await;
    }

    /// Tell every worker to exit and forget them
    fn release_workers(&mut self) {
        for worker in std::mem::take(&mut self.workers).values() {
            if worker.exit().is_err() {
                tracing::debug!(worker = %worker.id, "Worker already gone");
            }
        }
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("state", &self.state)
            .field("round", &self.round)
            .field("round_failed", &self.round_failed)
            .field("workers", &self.workers.len())
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

async fn emit(events: &mpsc::Sender<EngineReply>, request: RequestId, event: EngineEvent) {
    let name = event.name();
    if events.send(EngineReply { request, event }).await.is_err() {
        tracing::debug!(event = name, %request, "Run control gone, dropping event");
    }
}
