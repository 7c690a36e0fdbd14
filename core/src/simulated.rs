//! In-memory collaborators
//!
//! [`SimulatedProvider`] implements every collaborator seam without touching
//! processes, disks or the network. Calls are recorded in a shared
//! [`CallLog`] and any stage can be told to fail, which makes the provider
//! usable both by tests and by the `simulate` command of the binary.
//!
//! The module also carries the deterministic stand-ins used around the
//! coordinator: [`ManualClock`], [`StaticResolver`] and [`ScriptedProbe`].

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde_json::Value;

use crate::config::{Config, HostSpec};
use crate::coordinator::{Clock, ReachabilityProbe};
use crate::error::{MechanicError, Result};
use crate::metrics::{MetaScope, SharedMetricsStore};
use crate::protocol::{Descriptor, NodeMetaInfo};
use crate::topology::HostResolver;
use crate::traits::{
    Binaries, BinarySupplier, Car, Cluster, ClusterLauncher, ComponentProvider, DistributionSpec,
    Launcher, LauncherKind, Node, NodeConfiguration, NodeProvisioner, Plugin, ProvisionerSpec,
    SourceSpec,
};

// ============================================================================
// Call log and fault injection
// ============================================================================

/// Ordered record of collaborator calls
#[derive(Debug, Default)]
pub struct CallLog {
    calls: Mutex<Vec<String>>,
}

impl CallLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a call
    pub fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }

    /// All recorded calls in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Number of calls starting with `prefix`
    pub fn count(&self, prefix: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.starts_with(prefix)).count()
    }

    /// Forget all recorded calls
    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

/// A collaborator call that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// `BinarySupplier::supply`
    Supply,
    /// `NodeProvisioner::prepare`
    Prepare,
    /// `Launcher::start`
    Launch,
    /// `Node::on_benchmark_start`
    NodeBenchmarkStart,
    /// `Node::on_benchmark_stop`
    NodeBenchmarkStop,
    /// `Launcher::stop`
    LauncherStop,
    /// `NodeProvisioner::cleanup`
    Cleanup,
    /// `ClusterLauncher::start`
    ClusterStart,
    /// `ClusterLauncher::stop`
    ClusterStop,
}

impl Stage {
    fn component(&self) -> &'static str {
        match self {
            Self::Supply => "supplier",
            Self::Prepare | Self::Cleanup => "provisioner",
            Self::Launch | Self::LauncherStop => "launcher",
            Self::NodeBenchmarkStart | Self::NodeBenchmarkStop => "node",
            Self::ClusterStart | Self::ClusterStop => "cluster launcher",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    Always,
    Once,
}

#[derive(Debug, Default)]
struct Faults {
    stages: Mutex<HashMap<Stage, Fault>>,
}

impl Faults {
    fn trip(&self, stage: Stage) -> Result<()> {
        let mut stages = self.stages.lock();
        match stages.get(&stage).copied() {
            None => Ok(()),
            Some(fault) => {
                if fault == Fault::Once {
                    stages.remove(&stage);
                }
                Err(MechanicError::component(
                    stage.component(),
                    format!("injected fault at {stage:?}"),
                ))
            }
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    log: CallLog,
    faults: Faults,
}

// ============================================================================
// Component provider
// ============================================================================

/// Component provider backed by in-memory collaborators
#[derive(Debug, Clone, Default)]
pub struct SimulatedProvider {
    shared: Arc<Shared>,
}

impl SimulatedProvider {
    /// Create a provider where every call succeeds
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call of `stage` fail
    pub fn fail_at(self, stage: Stage) -> Self {
        self.shared.faults.stages.lock().insert(stage, Fault::Always);
        self
    }

    /// Make only the next call of `stage` fail
    pub fn fail_at_once(self, stage: Stage) -> Self {
        self.shared.faults.stages.lock().insert(stage, Fault::Once);
        self
    }

    /// Stop injecting faults at `stage`
    pub fn heal(&self, stage: Stage) {
        self.shared.faults.stages.lock().remove(&stage);
    }

    /// Calls recorded by all collaborators of this provider
    pub fn log(&self) -> &CallLog {
        &self.shared.log
    }
}

impl ComponentProvider for SimulatedProvider {
    fn load_car(&self, _cfg: &Config, name: &str) -> Result<Car> {
        self.shared.log.record(format!("load_car:{name}"));
        Ok(Car {
            name: name.to_string(),
            variables: Default::default(),
        })
    }

    fn load_plugins(&self, _cfg: &Config, names: &[String]) -> Result<Vec<Plugin>> {
        Ok(names
            .iter()
            .map(|name| Plugin {
                name: name.clone(),
                variables: Default::default(),
            })
            .collect())
    }

    fn source_supplier(&self, spec: SourceSpec) -> Result<Box<dyn BinarySupplier>> {
        self.shared
            .log
            .record(format!("source_supplier:{}:{}", spec.revision, spec.build));
        Ok(Box::new(SimulatedSupplier {
            shared: self.shared.clone(),
            binaries: Binaries::single("candidate", spec.src_dir),
        }))
    }

    fn distribution_supplier(&self, spec: DistributionSpec) -> Result<Box<dyn BinarySupplier>> {
        self.shared
            .log
            .record(format!("distribution_supplier:{}", spec.version));
        let mut binaries =
            Binaries::single("candidate", spec.distributions_root.join(&spec.version));
        for plugin in &spec.plugins {
            binaries
                .artifacts
                .insert(plugin.name.clone(), spec.distributions_root.join(&plugin.name));
        }
        Ok(Box::new(SimulatedSupplier {
            shared: self.shared.clone(),
            binaries,
        }))
    }

    fn local_provisioner(&self, spec: ProvisionerSpec) -> Result<Box<dyn NodeProvisioner>> {
        self.shared
            .log
            .record(format!("local_provisioner:{}", spec.node_id));
        Ok(Box::new(SimulatedProvisioner::new(self.shared.clone(), spec)))
    }

    fn docker_provisioner(&self, spec: ProvisionerSpec) -> Result<Box<dyn NodeProvisioner>> {
        self.shared
            .log
            .record(format!("docker_provisioner:{}", spec.node_id));
        Ok(Box::new(SimulatedProvisioner::new(self.shared.clone(), spec)))
    }

    fn launcher(
        &self,
        kind: LauncherKind,
        cfg: &Config,
        metrics: SharedMetricsStore,
    ) -> Result<Box<dyn Launcher>> {
        let external_hosts = match kind {
            LauncherKind::External => {
                match cfg.get_opt::<String>("provisioning", "node.ip")? {
                    Some(ip) => self.shared.log.record(format!("launcher:external@{ip}")),
                    None => self.shared.log.record("launcher:external"),
                }
                Some(cfg.hosts()?)
            }
            LauncherKind::InProcess { .. } => {
                self.shared.log.record("launcher:in-process");
                None
            }
            LauncherKind::Docker => {
                self.shared.log.record("launcher:docker");
                None
            }
        };
        Ok(Box::new(SimulatedLauncher {
            shared: self.shared.clone(),
            metrics,
            external_hosts,
        }))
    }

    fn cluster_launcher(
        &self,
        cfg: &Config,
        _metrics: SharedMetricsStore,
    ) -> Result<Box<dyn ClusterLauncher>> {
        let plugins = cfg.car_plugins()?;
        let nodes = cfg
            .hosts()?
            .iter()
            .enumerate()
            .map(|(i, host)| NodeMetaInfo {
                host_name: host.host.clone(),
                node_name: format!("node-{i}"),
                ip: host.host.clone(),
                plugins: plugins.clone(),
                ..Default::default()
            })
            .collect();
        Ok(Box::new(SimulatedClusterLauncher {
            shared: self.shared.clone(),
            nodes,
            revision: cfg.get_opt("mechanic", "source.revision")?,
            distribution_version: cfg.get_opt("mechanic", "distribution.version")?,
        }))
    }
}

// ============================================================================
// Pipeline collaborators
// ============================================================================

struct SimulatedSupplier {
    shared: Arc<Shared>,
    binaries: Binaries,
}

#[async_trait]
impl BinarySupplier for SimulatedSupplier {
    async fn supply(&mut self) -> Result<Binaries> {
        self.shared.log.record("supply");
        self.shared.faults.trip(Stage::Supply)?;
        Ok(self.binaries.clone())
    }
}

struct SimulatedProvisioner {
    shared: Arc<Shared>,
    spec: ProvisionerSpec,
}

impl SimulatedProvisioner {
    fn new(shared: Arc<Shared>, spec: ProvisionerSpec) -> Self {
        Self { shared, spec }
    }
}

#[async_trait]
impl NodeProvisioner for SimulatedProvisioner {
    async fn prepare(&mut self, binaries: &Binaries) -> Result<Option<NodeConfiguration>> {
        let node_id = self.spec.node_id;
        self.shared.log.record(format!("prepare:{node_id}"));
        self.shared.faults.trip(Stage::Prepare)?;

        let cfg = &self.spec.cfg;
        Ok(Some(NodeConfiguration {
            node_id,
            node_name: format!("node-{node_id}"),
            ip: cfg.get_opt("provisioning", "node.ip")?,
            http_port: cfg.get_opt("provisioning", "node.http.port")?,
            install_dir: Some(self.spec.race_root.join(format!("node-{node_id}"))),
            binaries: binaries.clone(),
            plugins: self.spec.plugins.iter().map(|p| p.name.clone()).collect(),
            settings: self.spec.cluster_settings.clone().unwrap_or_default(),
        }))
    }

    async fn cleanup(&mut self) -> Result<()> {
        self.shared
            .log
            .record(format!("cleanup:{}", self.spec.node_id));
        self.shared.faults.trip(Stage::Cleanup)
    }
}

struct SimulatedLauncher {
    shared: Arc<Shared>,
    metrics: SharedMetricsStore,
    external_hosts: Option<Vec<HostSpec>>,
}

#[async_trait]
impl Launcher for SimulatedLauncher {
    async fn start(&mut self, configs: Vec<NodeConfiguration>) -> Result<Vec<Box<dyn Node>>> {
        self.shared.log.record(format!("launch:{}", configs.len()));
        self.shared.faults.trip(Stage::Launch)?;

        let infos: Vec<NodeMetaInfo> = match &self.external_hosts {
            Some(hosts) => hosts
                .iter()
                .enumerate()
                .map(|(i, host)| NodeMetaInfo {
                    host_name: host.host.clone(),
                    node_name: format!("node-{i}"),
                    ip: host.host.clone(),
                    ..Default::default()
                })
                .collect(),
            None => configs.iter().map(meta_info_of).collect(),
        };

        {
            let mut metrics = self.metrics.lock();
            for info in &infos {
                let node = MetaScope::Node(info.node_name.clone());
                metrics.add_meta_info(node.clone(), "host_name", Value::from(info.host_name.clone()));
                let os_name = info.os.get("name").cloned().unwrap_or(Value::Null);
                metrics.add_meta_info(node, "os_name", os_name);
            }
        }

        Ok(infos
            .into_iter()
            .map(|info| {
                Box::new(SimulatedNode {
                    shared: self.shared.clone(),
                    metrics: self.metrics.clone(),
                    info,
                    laps: 0,
                }) as Box<dyn Node>
            })
            .collect())
    }

    async fn stop(&mut self, nodes: Vec<Box<dyn Node>>) -> Result<()> {
        self.shared.log.record(format!("launcher_stop:{}", nodes.len()));
        self.shared.faults.trip(Stage::LauncherStop)
    }
}

fn meta_info_of(config: &NodeConfiguration) -> NodeMetaInfo {
    let ip = config
        .ip
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let mut os = Descriptor::new();
    os.insert("name".into(), Value::from(std::env::consts::OS));
    let mut cpu = Descriptor::new();
    cpu.insert("arch".into(), Value::from(std::env::consts::ARCH));
    NodeMetaInfo {
        host_name: ip.clone(),
        node_name: config.node_name.clone(),
        ip,
        os,
        cpu,
        plugins: config.plugins.clone(),
        ..Default::default()
    }
}

/// A node that records one system metric per finished lap
struct SimulatedNode {
    shared: Arc<Shared>,
    metrics: SharedMetricsStore,
    info: NodeMetaInfo,
    laps: u32,
}

#[async_trait]
impl Node for SimulatedNode {
    fn meta_info(&self) -> NodeMetaInfo {
        self.info.clone()
    }

    async fn on_benchmark_start(&mut self) -> Result<()> {
        self.shared
            .log
            .record(format!("node_benchmark_start:{}", self.info.node_name));
        self.shared.faults.trip(Stage::NodeBenchmarkStart)
    }

    async fn on_benchmark_stop(&mut self) -> Result<()> {
        self.shared
            .log
            .record(format!("node_benchmark_stop:{}", self.info.node_name));
        self.shared.faults.trip(Stage::NodeBenchmarkStop)?;
        self.laps += 1;
        self.metrics.lock().put_value(
            "young_gc_time",
            f64::from(self.laps) * 10.0,
            "ms",
            Some(&self.info.node_name),
        );
        Ok(())
    }
}

// ============================================================================
// Cluster launcher
// ============================================================================

struct SimulatedClusterLauncher {
    shared: Arc<Shared>,
    nodes: Vec<NodeMetaInfo>,
    revision: Option<String>,
    distribution_version: Option<String>,
}

#[async_trait]
impl ClusterLauncher for SimulatedClusterLauncher {
    async fn start(&mut self) -> Result<Box<dyn Cluster>> {
        self.shared.log.record("cluster_start");
        self.shared.faults.trip(Stage::ClusterStart)?;
        Ok(Box::new(SimulatedCluster {
            shared: self.shared.clone(),
            nodes: self.nodes.clone(),
            revision: self.revision.clone(),
            distribution_version: self.distribution_version.clone(),
        }))
    }

    async fn stop(&mut self, _cluster: Box<dyn Cluster>) -> Result<()> {
        self.shared.log.record("cluster_stop");
        self.shared.faults.trip(Stage::ClusterStop)
    }
}

struct SimulatedCluster {
    shared: Arc<Shared>,
    nodes: Vec<NodeMetaInfo>,
    revision: Option<String>,
    distribution_version: Option<String>,
}

#[async_trait]
impl Cluster for SimulatedCluster {
    fn nodes(&self) -> Vec<NodeMetaInfo> {
        self.nodes.clone()
    }

    fn source_revision(&self) -> Option<String> {
        self.revision.clone()
    }

    fn distribution_version(&self) -> Option<String> {
        self.distribution_version.clone()
    }

    async fn on_benchmark_start(&mut self) -> Result<()> {
        self.shared.log.record("cluster_benchmark_start");
        Ok(())
    }

    async fn on_benchmark_stop(&mut self) -> Result<()> {
        self.shared.log.record("cluster_benchmark_stop");
        Ok(())
    }
}

// ============================================================================
// Deterministic clock, resolver and probe
// ============================================================================

/// Clock whose sleeps return immediately and are only recorded
#[derive(Debug, Default)]
pub struct ManualClock {
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    /// Create a clock with no recorded sleeps
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleeps requested so far
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }

    /// Total time the callers asked to sleep
    pub fn elapsed(&self) -> Duration {
        self.sleeps.lock().iter().sum()
    }
}

impl Clock for ManualClock {
    fn sleep(&self, duration: Duration) -> BoxFuture<'_, ()> {
        self.sleeps.lock().push(duration);
        futures::future::ready(()).boxed()
    }
}

/// Resolver with a fixed name table; IP literals resolve to themselves
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    names: HashMap<String, IpAddr>,
}

impl StaticResolver {
    /// Create a resolver that only knows IP literals
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a name
    pub fn with(mut self, name: impl Into<String>, ip: IpAddr) -> Self {
        self.names.insert(name.into(), ip);
        self
    }
}

impl HostResolver for StaticResolver {
    fn resolve(&self, host: &str) -> Result<IpAddr> {
        if let Some(ip) = self.names.get(host) {
            return Ok(*ip);
        }
        host.parse()
            .map_err(|_| MechanicError::setup(format!("cannot resolve host [{host}]")))
    }
}

/// Probe answering from a script; once the script runs out, hosts are reachable
#[derive(Debug, Default)]
pub struct ScriptedProbe {
    answers: Mutex<VecDeque<bool>>,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    /// Probe for which every host is reachable
    pub fn reachable() -> Self {
        Self::default()
    }

    /// Probe that answers `unreachable` times "no" before answering "yes"
    pub fn reachable_after(unreachable: usize) -> Self {
        Self {
            answers: Mutex::new(std::iter::repeat(false).take(unreachable).collect()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of probes so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReachabilityProbe for ScriptedProbe {
    async fn is_reachable(&self, _ip: IpAddr) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answers.lock().pop_front().unwrap_or(true)
    }
}
