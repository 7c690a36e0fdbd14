//! Tests for the coordinator

use super::*;
use crate::config::Config;
use crate::error::{MechanicError, Result};
use crate::metrics::{shared, InMemoryMetricsStore, MetaInfo, MetricsContext};
use crate::protocol::{
    AcquisitionMode, Dispatch, EngineCommand, EngineEvent, Round, StartEngine, WorkerEvent,
    WorkerId, WorkerNotification,
};
use crate::simulated::{ManualClock, ScriptedProbe, SimulatedProvider, StaticResolver, Stage};
use crate::worker::{InProcessSpawner, Placement, WorkerHandle, WorkerSpawner};

use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

// ============================================================================
// Spawners
// ============================================================================

/// Hands every worker inbox to the test instead of running a worker
struct ManualSpawner {
    spawned: mpsc::UnboundedSender<(WorkerId, mpsc::Receiver<Dispatch>)>,
}

impl WorkerSpawner for ManualSpawner {
    fn spawn(
        &self,
        id: WorkerId,
        name: &str,
        placement: Placement,
        _notifications: mpsc::Sender<WorkerNotification>,
    ) -> Result<WorkerHandle> {
        let (tx, rx) = mpsc::channel(8);
        let _ = self.spawned.send((id, rx));
        Ok(WorkerHandle::new(id, name, placement, tx))
    }
}

/// Fails the n-th spawn (0-based), delegating all others
struct FailingSpawner {
    inner: InProcessSpawner,
    fail_on: usize,
    calls: AtomicUsize,
}

impl WorkerSpawner for FailingSpawner {
    fn spawn(
        &self,
        id: WorkerId,
        name: &str,
        placement: Placement,
        notifications: mpsc::Sender<WorkerNotification>,
    ) -> Result<WorkerHandle> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == self.fail_on {
            return Err(MechanicError::communication(format!("cannot create {name}")));
        }
        self.inner.spawn(id, name, placement, notifications)
    }
}

/// Returns handles whose worker is already gone
struct DeadSpawner;

impl WorkerSpawner for DeadSpawner {
    fn spawn(
        &self,
        id: WorkerId,
        name: &str,
        placement: Placement,
        _notifications: mpsc::Sender<WorkerNotification>,
    ) -> Result<WorkerHandle> {
        let (tx, _rx) = mpsc::channel(1);
        Ok(WorkerHandle::new(id, name, placement, tx))
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn run_config(hosts: Value) -> Config {
    Config::new("run")
        .with("system", "time.start", "20261018T120000Z")
        .with("mechanic", "car.name", "defaults")
        .with("mechanic", "distribution.version", "8.1.0")
        .with("mechanic", "distribution.repository", "release")
        .with("client", "hosts", hosts)
}

fn loopback_hosts(count: u16) -> Value {
    Value::Array(
        (0..count)
            .map(|i| json!({"host": "127.0.0.1", "port": 9200 + i}))
            .collect(),
    )
}

fn local_config() -> Config {
    Config::new("local")
        .with("node", "root.dir", "/var/lib/mechanic")
        .with("source", "distribution.dir", "distributions")
}

fn start(cfg: Config, mode: AcquisitionMode) -> StartEngine {
    StartEngine::new(cfg, MetricsContext::new(chrono::Utc::now()), mode)
}

fn in_process(provider: &SimulatedProvider) -> Arc<dyn WorkerSpawner> {
    Arc::new(InProcessSpawner::new(Arc::new(provider.clone()), local_config()))
}

/// A coordinator task plus a way to inject worker notifications
struct Harness {
    engine: EngineHandle,
    notify: mpsc::Sender<WorkerNotification>,
    probe: Arc<ScriptedProbe>,
    clock: Arc<ManualClock>,
}

fn harness_with(
    provider: &SimulatedProvider,
    spawner: Arc<dyn WorkerSpawner>,
    resolver: StaticResolver,
    probe: ScriptedProbe,
) -> Harness {
    let probe = Arc::new(probe);
    let clock = Arc::new(ManualClock::new());
    let (command_tx, command_rx) = mpsc::channel(8);
    let (event_tx, event_rx) = mpsc::channel(8);
    let (notify_tx, notify_rx) = mpsc::channel(64);

    let coordinator = executor::Coordinator::new(
        Arc::new(provider.clone()),
        spawner,
        Arc::new(resolver),
        probe.clone(),
        clock.clone(),
        DEFAULT_POLL_INTERVAL,
        shared(InMemoryMetricsStore::new()),
        event_tx,
        notify_tx.clone(),
    );
    let task = tokio::spawn(coordinator.run(command_rx, notify_rx));

    Harness {
        engine: EngineHandle::new(command_tx, event_rx, task),
        notify: notify_tx,
        probe,
        clock,
    }
}

fn harness(provider: &SimulatedProvider) -> Harness {
    harness_with(
        provider,
        in_process(provider),
        StaticResolver::new(),
        ScriptedProbe::reachable(),
    )
}

async fn next_failure(engine: &mut EngineHandle) -> String {
    match tokio::time::timeout(Duration::from_secs(5), engine.next_event()).await {
        Ok(Some(EngineEvent::Failure(failure))) => failure.message,
        other => panic!("Expected Failure, got {:?}", other),
    }
}

async fn reply(
    notify: &mpsc::Sender<WorkerNotification>,
    worker: usize,
    round: Round,
    event: WorkerEvent,
) {
    notify
        .send(WorkerNotification::Replied {
            worker: WorkerId(worker),
            round,
            event,
        })
        .await
        .expect("Failed to inject reply");
}

async fn next_dispatch(inbox: &mut mpsc::Receiver<Dispatch>, expected: &str) -> Round {
    let dispatch = tokio::time::timeout(Duration::from_secs(5), inbox.recv())
        .await
        .expect("Worker got no command in time")
        .expect("Worker inbox closed");
    assert_eq!(dispatch.command.name(), expected);
    dispatch.round
}

type Inboxes = Vec<(WorkerId, mpsc::Receiver<Dispatch>)>;

fn manual(provider: &SimulatedProvider) -> (Harness, mpsc::UnboundedReceiver<(WorkerId, mpsc::Receiver<Dispatch>)>) {
    let (spawned_tx, spawned_rx) = mpsc::unbounded_channel();
    let h = harness_with(
        provider,
        Arc::new(ManualSpawner { spawned: spawned_tx }),
        StaticResolver::new(),
        ScriptedProbe::reachable(),
    );
    (h, spawned_rx)
}

/// Walk `workers` hand-driven workers through startup
async fn start_manually(
    h: &mut Harness,
    spawned: &mut mpsc::UnboundedReceiver<(WorkerId, mpsc::Receiver<Dispatch>)>,
    workers: u16,
) -> Inboxes {
    h.engine
        .send(EngineCommand::StartEngine(Box::new(start(
            run_config(loopback_hosts(workers)),
            AcquisitionMode::Distribution,
        ))))
        .await
        .expect("Failed to send start-engine");

    let mut inboxes = Vec::new();
    for _ in 0..workers {
        inboxes.push(spawned.recv().await.expect("Worker was not spawned"));
    }
    for (id, inbox) in inboxes.iter_mut() {
        let round = next_dispatch(inbox, "start-nodes").await;
        reply(&h.notify, id.0, round, nodes_started()).await;
    }
    for (id, inbox) in inboxes.iter_mut() {
        let round = next_dispatch(inbox, "apply-metrics-meta-info").await;
        reply(&h.notify, id.0, round, WorkerEvent::MetricsMetaInfoApplied).await;
    }
    match h.engine.next_event().await {
        Some(EngineEvent::EngineStarted(_)) => {}
        other => panic!("Expected EngineStarted, got {:?}", other),
    }
    inboxes
}

fn nodes_started() -> WorkerEvent {
    WorkerEvent::NodesStarted {
        nodes: Vec::new(),
        system_meta: MetaInfo::default(),
    }
}

// ============================================================================
// Startup
// ============================================================================

#[tokio::test]
async fn test_start_engine_provisions_one_worker_per_host() {
    let provider = SimulatedProvider::new();
    let mut h = harness(&provider);

    let started = h
        .engine
        .start_engine(start(run_config(loopback_hosts(3)), AcquisitionMode::Distribution))
        .await
        .expect("Failed to start engine");

    assert_eq!(started.cluster.node_count(), 3);
    assert_eq!(started.cluster.distribution_version(), Some("8.1.0"));
    assert_eq!(provider.log().count("local_provisioner"), 3);
    assert_eq!(provider.log().count("launch:1"), 3);
    assert_eq!(provider.log().count("cluster_start"), 1);
    assert_eq!(h.probe.calls(), 0);
}

#[tokio::test]
async fn test_start_engine_collects_node_meta_info() {
    let provider = SimulatedProvider::new();
    let mut h = harness(&provider);

    let started = h
        .engine
        .start_engine(start(run_config(loopback_hosts(2)), AcquisitionMode::Distribution))
        .await
        .expect("Failed to start engine");

    assert!(started.system_meta.nodes.contains_key("node-0"));
    assert!(started.system_meta.nodes.contains_key("node-1"));
}

#[tokio::test]
async fn test_external_cluster_uses_single_worker() {
    let provider = SimulatedProvider::new();
    let mut h = harness(&provider);
    let cfg = run_config(json!([{"host": "10.0.0.5", "port": 9200}]));

    let started = h
        .engine
        .start_engine(start(cfg, AcquisitionMode::External))
        .await
        .expect("Failed to start engine");

    assert_eq!(started.cluster.node_count(), 1);
    assert!(started.cluster.nodes()[0].plugins.is_empty());
    assert_eq!(provider.log().count("launcher:external"), 1);
    assert_eq!(provider.log().count("load_car"), 0);
    assert_eq!(h.probe.calls(), 0);
}

#[tokio::test]
async fn test_no_hosts_is_launch_error() {
    let provider = SimulatedProvider::new();
    let mut h = harness(&provider);

    let failure = h
        .engine
        .start_engine(start(run_config(json!([])), AcquisitionMode::Distribution))
        .await
        .unwrap_err();

    assert!(failure.message.contains("No target hosts"));
}

#[tokio::test]
async fn test_remote_hosts_require_worker_daemons() {
    let provider = SimulatedProvider::new();
    let mut h = harness(&provider);
    let cfg = run_config(json!([{"host": "10.0.0.7", "port": 9200}]));

    let failure = h
        .engine
        .start_engine(start(cfg, AcquisitionMode::Distribution))
        .await
        .unwrap_err();

    assert!(failure.message.contains("10.0.0.7"));
    assert!(failure.message.contains("worker daemon"));
    assert_eq!(provider.log().count("prepare"), 0);
}

#[tokio::test]
async fn test_remote_hosts_are_polled_until_reachable() {
    let provider = SimulatedProvider::new();
    let resolver = StaticResolver::new().with("db-1", "10.0.0.8".parse().unwrap());
    let mut h = harness_with(
        &provider,
        in_process(&provider),
        resolver,
        ScriptedProbe::reachable_after(2),
    );
    let cfg = run_config(json!([
        {"host": "10.0.0.7", "port": 9200},
        {"host": "db-1", "port": 9200},
    ]))
    .with("system", "remote.benchmarking.supported", true);

    let started = h
        .engine
        .start_engine(start(cfg, AcquisitionMode::Distribution))
        .await
        .expect("Failed to start engine");

    assert_eq!(started.cluster.node_count(), 2);
    assert_eq!(h.probe.calls(), 4);
    assert_eq!(h.clock.sleeps(), vec![Duration::from_secs(3); 2]);
    assert_eq!(h.clock.elapsed(), Duration::from_secs(6));
}

#[tokio::test]
async fn test_spawn_failure_aborts_before_start_nodes() {
    let provider = SimulatedProvider::new();
    let spawner = Arc::new(FailingSpawner {
        inner: InProcessSpawner::new(Arc::new(provider.clone()), local_config()),
        fail_on: 1,
        calls: AtomicUsize::new(0),
    });
    let mut h = harness_with(&provider, spawner, StaticResolver::new(), ScriptedProbe::reachable());

    let failure = h
        .engine
        .start_engine(start(run_config(loopback_hosts(3)), AcquisitionMode::Distribution))
        .await
        .unwrap_err();
    assert!(failure.message.contains("cannot create"));
    assert_eq!(provider.log().count("load_car"), 0);

    let failure = h.engine.stop_engine().await.unwrap_err();
    assert!(failure.message.contains("[idle]"));
}

#[tokio::test]
async fn test_undeliverable_start_nodes() {
    let provider = SimulatedProvider::new();
    let mut h = harness_with(
        &provider,
        Arc::new(DeadSpawner),
        StaticResolver::new(),
        ScriptedProbe::reachable(),
    );

    let failure = h
        .engine
        .start_engine(start(run_config(loopback_hosts(1)), AcquisitionMode::Distribution))
        .await
        .unwrap_err();

    assert!(failure
        .message
        .contains("Are daemons on all targeted machines running?"));
}

// ============================================================================
// Protocol violations
// ============================================================================

#[tokio::test]
async fn test_commands_in_wrong_state_change_nothing() {
    let provider = SimulatedProvider::new();
    let mut h = harness(&provider);

    let failure = h.engine.on_benchmark_stop().await.unwrap_err();
    assert!(failure.message.contains("on-benchmark-stop"));
    assert!(failure.message.contains("[idle]"));

    let failure = h.engine.on_benchmark_start(1).await.unwrap_err();
    assert!(failure.message.contains("cluster_started, benchmark_stopped"));

    h.engine
        .start_engine(start(run_config(loopback_hosts(1)), AcquisitionMode::Distribution))
        .await
        .expect("Failed to start engine after rejected commands");

    let failure = h
        .engine
        .start_engine(start(run_config(loopback_hosts(1)), AcquisitionMode::Distribution))
        .await
        .unwrap_err();
    assert!(failure.message.contains("[cluster_started]"));

    let failure = h.engine.stop_engine().await.unwrap_err();
    assert!(failure.message.contains("stop-engine"));

    h.engine.on_benchmark_start(1).await.expect("Failed to start lap");
}

#[tokio::test]
async fn test_stray_reply_is_rejected() {
    let provider = SimulatedProvider::new();
    let mut h = harness(&provider);
    h.engine
        .start_engine(start(run_config(loopback_hosts(2)), AcquisitionMode::Distribution))
        .await
        .expect("Failed to start engine");

    // start-nodes was round 1, apply-metrics-meta-info round 2
    reply(&h.notify, 0, Round(2), WorkerEvent::BenchmarkStarted).await;

    let message = next_failure(&mut h.engine).await;
    assert!(message.contains("[cluster_started]"));
    assert!(message.contains("benchmark_starting"));

    h.engine.on_benchmark_start(1).await.expect("Failed to start lap");
    h.engine.on_benchmark_stop().await.expect("Failed to stop lap");
}

#[tokio::test]
async fn test_duplicate_and_unknown_replies_are_rejected() {
    let provider = SimulatedProvider::new();
    let (mut h, mut spawned_rx) = manual(&provider);

    h.engine
        .send(EngineCommand::StartEngine(Box::new(start(
            run_config(loopback_hosts(2)),
            AcquisitionMode::Distribution,
        ))))
        .await
        .expect("Failed to send start-engine");

    let mut inboxes = Vec::new();
    let mut round = Round::default();
    for _ in 0..2 {
        let (id, mut inbox) = spawned_rx.recv().await.expect("Worker was not spawned");
        round = next_dispatch(&mut inbox, "start-nodes").await;
        inboxes.push((id, inbox));
    }

    reply(&h.notify, 0, round, nodes_started()).await;
    reply(&h.notify, 0, round, nodes_started()).await;
    assert!(next_failure(&mut h.engine).await.contains("duplicate reply from worker-0"));

    reply(&h.notify, 9, round, nodes_started()).await;
    assert!(next_failure(&mut h.engine).await.contains("unknown worker-9"));

    reply(&h.notify, 1, round, nodes_started()).await;
    let mut apply_round = Round::default();
    for (_, inbox) in inboxes.iter_mut() {
        apply_round = next_dispatch(inbox, "apply-metrics-meta-info").await;
    }
    assert_eq!(apply_round, round.next());

    reply(&h.notify, 0, apply_round, WorkerEvent::MetricsMetaInfoApplied).await;
    reply(&h.notify, 1, apply_round, WorkerEvent::MetricsMetaInfoApplied).await;
    match h.engine.next_event().await {
        Some(EngineEvent::EngineStarted(started)) => assert_eq!(started.cluster.node_count(), 2),
        other => panic!("Expected EngineStarted, got {:?}", other),
    }
}

#[tokio::test]
async fn test_replies_of_superseded_round_are_ignored() {
    let provider = SimulatedProvider::new();
    let (mut h, mut spawned_rx) = manual(&provider);
    let mut inboxes = start_manually(&mut h, &mut spawned_rx, 2).await;

    // a late start-nodes reply after the cluster has started
    reply(&h.notify, 0, Round(1), nodes_started()).await;

    h.engine
        .send(EngineCommand::OnBenchmarkStart { lap: 1 })
        .await
        .expect("Failed to send on-benchmark-start");
    for (id, inbox) in inboxes.iter_mut() {
        let round = next_dispatch(inbox, "on-benchmark-start").await;
        reply(&h.notify, id.0, round, WorkerEvent::BenchmarkStarted).await;
    }

    match h.engine.next_event().await {
        Some(EngineEvent::BenchmarkStarted) => {}
        other => panic!("Expected BenchmarkStarted, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unexpected_worker_exit_is_reported() {
    let provider = SimulatedProvider::new();
    let mut h = harness(&provider);
    h.engine
        .start_engine(start(run_config(loopback_hosts(1)), AcquisitionMode::Distribution))
        .await
        .expect("Failed to start engine");

    h.notify
        .send(WorkerNotification::Exited {
            worker: WorkerId(0),
            detail: "panicked: boom".into(),
        })
        .await
        .expect("Failed to inject exit");

    let message = next_failure(&mut h.engine).await;
    assert!(message.contains("worker-0 exited"));
    assert!(message.contains("panicked: boom"));
}

// ============================================================================
// Laps and teardown
// ============================================================================

#[tokio::test]
async fn test_laps_report_only_their_own_metrics() {
    let provider = SimulatedProvider::new();
    let mut h = harness(&provider);
    h.engine
        .start_engine(start(run_config(loopback_hosts(3)), AcquisitionMode::Distribution))
        .await
        .expect("Failed to start engine");

    for lap in 1..=2 {
        h.engine.on_benchmark_start(lap).await.expect("Failed to start lap");
        let metrics = h.engine.on_benchmark_stop().await.expect("Failed to stop lap");
        assert_eq!(metrics.len(), 3);
        assert_eq!(metrics.laps(), vec![lap]);
    }
    assert_eq!(provider.log().count("cluster_benchmark_stop"), 2);
    assert_eq!(provider.log().count("node_benchmark_stop"), 6);

    let totals = h.engine.stop_engine().await.expect("Failed to stop engine");
    assert!(totals.is_empty());
}

#[tokio::test]
async fn test_stop_engine_tears_down_every_host() {
    let provider = SimulatedProvider::new();
    let mut h = harness(&provider);
    h.engine
        .start_engine(start(run_config(loopback_hosts(3)), AcquisitionMode::Distribution))
        .await
        .expect("Failed to start engine");

    h.engine.stop_engine().await.expect("Failed to stop engine");

    assert_eq!(provider.log().count("cluster_stop"), 1);
    assert_eq!(provider.log().count("launcher_stop"), 3);
    assert_eq!(provider.log().count("cleanup"), 3);
    tokio::time::timeout(Duration::from_secs(5), h.engine.join())
        .await
        .expect("Coordinator did not finish");
}

#[tokio::test]
async fn test_cluster_stop_failure_does_not_block_teardown() {
    let provider = SimulatedProvider::new().fail_at(Stage::ClusterStop);
    let mut h = harness(&provider);
    h.engine
        .start_engine(start(run_config(loopback_hosts(2)), AcquisitionMode::Distribution))
        .await
        .expect("Failed to start engine");

    h.engine.stop_engine().await.expect("Failed to stop engine");

    assert_eq!(provider.log().count("launcher_stop"), 2);
}

#[tokio::test]
async fn test_failed_start_can_be_torn_down() {
    let provider = SimulatedProvider::new().fail_at_once(Stage::Prepare);
    let mut h = harness(&provider);

    let failure = h
        .engine
        .start_engine(start(run_config(loopback_hosts(3)), AcquisitionMode::Distribution))
        .await
        .unwrap_err();
    assert!(failure.message.contains("provisioner failed"));
    assert_eq!(provider.log().count("cluster_start"), 0);

    h.engine.stop_engine().await.expect("Failed to tear down");
    assert_eq!(provider.log().count("cluster_stop"), 0);
}

#[tokio::test]
async fn test_failed_lap_can_be_torn_down() {
    let provider = SimulatedProvider::new();
    let mut h = harness(&provider);
    h.engine
        .start_engine(start(run_config(loopback_hosts(2)), AcquisitionMode::Distribution))
        .await
        .expect("Failed to start engine");
    h.engine.on_benchmark_start(1).await.expect("Failed to start lap");

    let provider = provider.fail_at_once(Stage::NodeBenchmarkStop);
    let failure = h.engine.on_benchmark_stop().await.unwrap_err();
    assert!(failure.message.contains("node failed"));

    h.engine.stop_engine().await.expect("Failed to tear down");
    assert_eq!(provider.log().count("cluster_stop"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lap_failing_on_every_worker_can_be_torn_down() {
    for iteration in 0..20 {
        let provider = SimulatedProvider::new();
        let mut h = harness(&provider);
        h.engine
            .start_engine(start(run_config(loopback_hosts(3)), AcquisitionMode::Distribution))
            .await
            .expect("Failed to start engine");
        h.engine.on_benchmark_start(1).await.expect("Failed to start lap");

        let provider = provider.fail_at(Stage::NodeBenchmarkStop);
        let failure = h.engine.on_benchmark_stop().await.unwrap_err();
        assert!(failure.message.contains("node failed"), "iteration {iteration}: {failure}");

        let stopped = h.engine.stop_engine().await;
        assert!(stopped.is_ok(), "iteration {iteration}: {:?}", stopped.err());
        assert_eq!(provider.log().count("cluster_stop"), 1);
        h.engine.join().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_teardown_can_be_retried_after_a_failed_stop() {
    for iteration in 0..20 {
        let provider = SimulatedProvider::new();
        let mut h = harness(&provider);
        h.engine
            .start_engine(start(run_config(loopback_hosts(3)), AcquisitionMode::Distribution))
            .await
            .expect("Failed to start engine");
        h.engine.on_benchmark_start(1).await.expect("Failed to start lap");
        h.engine.on_benchmark_stop().await.expect("Failed to stop lap");

        let provider = provider.fail_at_once(Stage::LauncherStop);
        let failure = h.engine.stop_engine().await.unwrap_err();
        assert!(failure.message.contains("launcher failed"), "iteration {iteration}: {failure}");

        let stopped = h.engine.stop_engine().await;
        assert!(stopped.is_ok(), "iteration {iteration}: {:?}", stopped.err());
        assert_eq!(provider.log().count("launcher_stop"), 3);
        tokio::time::timeout(Duration::from_secs(5), h.engine.join())
            .await
            .expect("Coordinator did not finish");
    }
}

#[tokio::test]
async fn test_undeliverable_lap_command_is_communication_failure() {
    let provider = SimulatedProvider::new();
    let (mut h, mut spawned_rx) = manual(&provider);
    let inboxes = start_manually(&mut h, &mut spawned_rx, 2).await;
    drop(inboxes);

    let failure = h.engine.on_benchmark_start(1).await.unwrap_err();

    assert!(failure
        .message
        .contains("Could not communicate with benchmark candidate (unknown reason)"));
    assert!(failure.message.contains("[on-benchmark-start]"));
}

#[tokio::test]
async fn test_worker_exit_during_teardown_is_tolerated() {
    let provider = SimulatedProvider::new();
    let (mut h, mut spawned_rx) = manual(&provider);
    let mut inboxes = start_manually(&mut h, &mut spawned_rx, 2).await;

    h.engine
        .send(EngineCommand::StopEngine)
        .await
        .expect("Failed to send stop-engine");
    let mut round = Round::default();
    for (_, inbox) in inboxes.iter_mut() {
        round = next_dispatch(inbox, "stop-nodes").await;
    }

    let stopped = || WorkerEvent::NodesStopped {
        system_metrics: Default::default(),
    };
    reply(&h.notify, 0, round, stopped()).await;
    h.notify
        .send(WorkerNotification::Exited {
            worker: WorkerId(0),
            detail: "exited".into(),
        })
        .await
        .expect("Failed to inject exit");
    reply(&h.notify, 1, round, stopped()).await;

    match tokio::time::timeout(Duration::from_secs(5), h.engine.next_event()).await {
        Ok(Some(EngineEvent::EngineStopped { .. })) => {}
        other => panic!("Expected EngineStopped, got {:?}", other),
    }
}
