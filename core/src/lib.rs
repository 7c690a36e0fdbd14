//! bench-mechanic-core: lifecycle coordination of a benchmark candidate cluster
//!
//! This crate drives a multi-node cluster through provisioning, measurement
//! laps and teardown from a single coordinating process:
//!
//! - A [`Coordinator`] task owns the run-wide [`LifecycleState`] and fans
//!   commands out to one host worker per physical host
//! - Each [`HostWorker`] builds a [`Mechanic`] pipeline (supply, provision,
//!   launch) and reports every command back as exactly one event
//! - Failures cross task boundaries as [`Failure`] values, never as panics
//!
//! Suppliers, provisioners, launchers and the cluster launcher are external
//! collaborators reached through [`ComponentProvider`]. The [`simulated`]
//! module implements all of them in memory.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod protocol;
pub mod simulated;
pub mod topology;
pub mod traits;
pub mod worker;

pub use channel::ChannelConfig;
pub use config::*;
pub use coordinator::{
    BarrierProgress, Clock, Coordinator, CoordinatorBuilder, EngineHandle, LifecycleState,
    ReachabilityProbe, ResponseBarrier, TcpProbe, TokioClock,
};
pub use error::*;
pub use metrics::*;
pub use pipeline::{Mechanic, PipelineFactory};
pub use protocol::*;
pub use topology::{HostGroup, HostResolver, SystemResolver, Topology};
pub use traits::*;
pub use worker::{HostWorker, InProcessSpawner, Placement, WorkerHandle, WorkerSpawner};

#[cfg(test)]
mod integration_tests {
    use super::*;
    use crate::simulated::{SimulatedProvider, Stage};

    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    // =========================================================================
    // Helpers
    // =========================================================================

    fn run_config(hosts: serde_json::Value) -> Config {
        Config::new("run")
            .with("system", "time.start", "20261018T120000Z")
            .with("mechanic", "car.name", "defaults")
            .with("mechanic", "distribution.version", "8.1.0")
            .with("mechanic", "distribution.repository", "release")
            .with("client", "hosts", hosts)
    }

    fn local_config() -> Config {
        Config::new("local")
            .with("node", "root.dir", "/var/lib/mechanic")
            .with("source", "distribution.dir", "distributions")
    }

    fn three_local_hosts() -> serde_json::Value {
        json!([
            {"host": "127.0.0.1", "port": 9200},
            {"host": "127.0.0.1", "port": 9201},
            {"host": "127.0.0.1", "port": 9202},
        ])
    }

    fn engine(provider: &SimulatedProvider) -> EngineHandle {
        CoordinatorBuilder::new()
            .provider(Arc::new(provider.clone()))
            .local_config(local_config())
            .spawn()
            .expect("Failed to spawn coordinator")
    }

    fn start(cfg: Config, mode: AcquisitionMode) -> StartEngine {
        StartEngine::new(
            cfg,
            MetricsContext::new(chrono::Utc::now()).with_car("defaults"),
            mode,
        )
    }

    // =========================================================================
    // End-to-end runs
    // =========================================================================

    #[tokio::test]
    async fn test_three_local_hosts_full_run() {
        let provider = SimulatedProvider::new();
        let mut engine = engine(&provider);

        let started = engine
            .start_engine(start(run_config(three_local_hosts()), AcquisitionMode::Distribution))
            .await
            .expect("Failed to start engine");
        assert_eq!(started.cluster.node_count(), 3);
        assert_eq!(provider.log().count("supply"), 3);

        engine.on_benchmark_start(1).await.expect("Failed to start lap");
        let lap = engine.on_benchmark_stop().await.expect("Failed to stop lap");
        assert_eq!(lap.len(), 3);

        engine.stop_engine().await.expect("Failed to stop engine");
        assert_eq!(provider.log().count("cleanup"), 3);

        tokio::time::timeout(Duration::from_secs(5), engine.join())
            .await
            .expect("Coordinator did not finish");
    }

    #[tokio::test]
    async fn test_external_cluster_run() {
        let provider = SimulatedProvider::new();
        let mut engine = engine(&provider);
        let cfg = run_config(json!([{"host": "10.0.0.5", "port": 9200}]));

        let started = engine
            .start_engine(start(cfg, AcquisitionMode::External))
            .await
            .expect("Failed to start engine");

        assert_eq!(started.cluster.node_count(), 1);
        assert_eq!(started.cluster.nodes()[0].ip, "10.0.0.5");
        assert!(started.cluster.nodes()[0].plugins.is_empty());
        assert_eq!(provider.log().count("launcher:external"), 1);
        assert_eq!(provider.log().count("prepare"), 0);

        engine.stop_engine().await.expect("Failed to stop engine");
    }

    #[tokio::test]
    async fn test_two_laps_do_not_duplicate_metrics() {
        let provider = SimulatedProvider::new();
        let mut engine = engine(&provider);
        engine
            .start_engine(start(run_config(three_local_hosts()), AcquisitionMode::Distribution))
            .await
            .expect("Failed to start engine");

        let mut laps = Vec::new();
        for lap in 1..=2 {
            engine.on_benchmark_start(lap).await.expect("Failed to start lap");
            laps.push(engine.on_benchmark_stop().await.expect("Failed to stop lap"));
        }

        assert_eq!(laps[0].laps(), vec![1]);
        assert_eq!(laps[1].laps(), vec![2]);
        assert_eq!(laps[0].len(), laps[1].len());

        let totals = engine.stop_engine().await.expect("Failed to stop engine");
        assert!(totals.is_empty());
    }

    // =========================================================================
    // Failure handling
    // =========================================================================

    #[tokio::test]
    async fn test_provisioning_failure_then_teardown() {
        let provider = SimulatedProvider::new().fail_at_once(Stage::Prepare);
        let mut engine = engine(&provider);

        let failure = engine
            .start_engine(start(run_config(three_local_hosts()), AcquisitionMode::Distribution))
            .await
            .unwrap_err();
        assert!(failure.message.contains("provisioner failed"));
        assert!(!failure.cause.is_empty());
        assert_eq!(provider.log().count("cluster_start"), 0);

        engine.stop_engine().await.expect("Failed to tear down");
    }

    #[tokio::test]
    async fn test_teardown_from_nodes_started() {
        let provider = SimulatedProvider::new().fail_at(Stage::ClusterStart);
        let mut engine = engine(&provider);

        let failure = engine
            .start_engine(start(run_config(three_local_hosts()), AcquisitionMode::Distribution))
            .await
            .unwrap_err();
        assert!(failure.message.contains("cluster launcher failed"));

        engine.stop_engine().await.expect("Failed to tear down");
        assert_eq!(provider.log().count("launcher_stop"), 3);
        assert_eq!(provider.log().count("node_benchmark"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_start_failing_on_every_host_still_tears_down() {
        let provider = SimulatedProvider::new().fail_at(Stage::Prepare);

        for iteration in 0..50 {
            let mut engine = engine(&provider);
            let failure = engine
                .start_engine(start(run_config(three_local_hosts()), AcquisitionMode::Distribution))
                .await
                .unwrap_err();
            assert!(failure.message.contains("provisioner failed"), "iteration {iteration}: {failure}");

            let stopped = engine.stop_engine().await;
            assert!(stopped.is_ok(), "iteration {iteration}: {:?}", stopped.err());
            engine.join().await;
        }
        assert_eq!(provider.log().count("cluster_start"), 0);

        provider.heal(Stage::Prepare);
        let mut engine = engine(&provider);
        let started = engine
            .start_engine(start(run_config(three_local_hosts()), AcquisitionMode::Distribution))
            .await
            .expect("Failed to start engine after healing");
        assert_eq!(started.cluster.node_count(), 3);
        engine.stop_engine().await.expect("Failed to stop engine");
    }

    #[tokio::test]
    async fn test_external_cluster_from_address_strings() {
        let provider = SimulatedProvider::new();
        let mut engine = engine(&provider);
        let cfg = run_config(json!(["10.0.0.5:9200"]));

        let started = engine
            .start_engine(start(cfg, AcquisitionMode::External))
            .await
            .expect("Failed to start engine");

        assert_eq!(started.cluster.node_count(), 1);
        assert_eq!(started.cluster.nodes()[0].ip, "10.0.0.5");
        engine.stop_engine().await.expect("Failed to stop engine");
    }

    #[tokio::test]
    async fn test_external_cluster_with_fixed_node() {
        let provider = SimulatedProvider::new();
        let mut engine = engine(&provider);
        let request = start(run_config(json!(["10.0.0.5:9200"])), AcquisitionMode::External)
            .with_fixed_node("10.0.0.5".parse().unwrap(), 9200, vec![0]);

        engine.start_engine(request).await.expect("Failed to start engine");

        assert_eq!(provider.log().count("launcher:external@10.0.0.5"), 1);
        engine.stop_engine().await.expect("Failed to stop engine");
    }

    #[tokio::test]
    async fn test_pipelines_are_rebuilt_for_a_second_run() {
        let provider = SimulatedProvider::new();

        for _ in 0..2 {
            let mut engine = engine(&provider);
            engine
                .start_engine(start(run_config(three_local_hosts()), AcquisitionMode::Distribution))
                .await
                .expect("Failed to start engine");
            engine.stop_engine().await.expect("Failed to stop engine");
            engine.join().await;
        }

        assert_eq!(provider.log().count("distribution_supplier"), 6);
        assert_eq!(provider.log().count("supply"), 6);
        assert_eq!(provider.log().count("cleanup"), 6);
    }

    #[test]
    fn test_failure_round_trips_as_json() {
        let failure = Failure::from_error(&MechanicError::launch("node did not come up"));
        let json = serde_json::to_string(&failure).unwrap();
        let back: Failure = serde_json::from_str(&json).unwrap();

        assert_eq!(back, failure);
        assert!(back.message.contains("node did not come up"));
    }
}
