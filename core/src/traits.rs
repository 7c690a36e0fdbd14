//! Collaborator traits for the lifecycle pipeline
//!
//! Acquiring binaries, turning a node id into an on-disk configuration and
//! supervising node processes all happen behind these traits. The core only
//! composes them; implementations live with the caller (see
//! [`crate::simulated`] for in-memory stand-ins).

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{Config, Section};
use crate::error::Result;
use crate::metrics::SharedMetricsStore;
use crate::protocol::NodeMetaInfo;

// ============================================================================
// Pipeline values
// ============================================================================

/// Immutable set of binaries produced by a supplier
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Binaries {
    /// Artifact name -> location
    pub artifacts: BTreeMap<String, PathBuf>,
}

impl Binaries {
    /// Binaries with a single artifact
    pub fn single(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let mut artifacts = BTreeMap::new();
        artifacts.insert(name.into(), path.into());
        Self { artifacts }
    }

    /// Whether nothing was supplied
    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }
}

/// A named candidate configuration ("car")
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Car {
    /// Car name
    pub name: String,
    /// Variables the car applies to a node
    #[serde(default)]
    pub variables: Section,
}

/// A candidate plugin
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plugin {
    /// Plugin name
    pub name: String,
    /// Plugin variables
    #[serde(default)]
    pub variables: Section,
}

/// Concrete configuration of one node, ready to launch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfiguration {
    /// Logical node id
    pub node_id: usize,
    /// Logical node name
    pub node_name: String,
    /// Address the node binds to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,
    /// HTTP port of the node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_port: Option<u16>,
    /// Installation directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_dir: Option<PathBuf>,
    /// Binaries the node runs
    #[serde(default)]
    pub binaries: Binaries,
    /// Installed plugin names
    #[serde(default)]
    pub plugins: Vec<String>,
    /// Effective node settings
    #[serde(default)]
    pub settings: Section,
}

// ============================================================================
// Collaborator traits
// ============================================================================

/// Produces the binaries of a pipeline run
#[async_trait]
pub trait BinarySupplier: Send {
    /// Fetch or build the binaries
    async fn supply(&mut self) -> Result<Binaries>;
}

/// Turns a node id into a concrete node configuration
#[async_trait]
pub trait NodeProvisioner: Send {
    /// Prepare the node configuration from the supplied binaries
    ///
    /// Returns `None` when the node needs no local configuration, as for
    /// nodes managed outside of this system.
    async fn prepare(&mut self, binaries: &Binaries) -> Result<Option<NodeConfiguration>>;

    /// Release everything `prepare` created
    async fn cleanup(&mut self) -> Result<()>;
}

/// A running node
#[async_trait]
pub trait Node: Send {
    /// Snapshot of the node
    fn meta_info(&self) -> NodeMetaInfo;

    /// A measurement lap begins
    async fn on_benchmark_start(&mut self) -> Result<()>;

    /// A measurement lap ends
    async fn on_benchmark_stop(&mut self) -> Result<()>;
}

/// Starts and stops node processes
#[async_trait]
pub trait Launcher: Send {
    /// Start one node per configuration
    async fn start(&mut self, configs: Vec<NodeConfiguration>) -> Result<Vec<Box<dyn Node>>>;

    /// Stop the given nodes
    async fn stop(&mut self, nodes: Vec<Box<dyn Node>>) -> Result<()>;
}

/// The running node set seen as one cluster
#[async_trait]
pub trait Cluster: Send {
    /// Nodes of the cluster
    fn nodes(&self) -> Vec<NodeMetaInfo>;

    /// Source revision of the candidate, if known
    fn source_revision(&self) -> Option<String>;

    /// Distribution version of the candidate, if known
    fn distribution_version(&self) -> Option<String>;

    /// A measurement lap begins
    async fn on_benchmark_start(&mut self) -> Result<()>;

    /// A measurement lap ends
    async fn on_benchmark_stop(&mut self) -> Result<()>;
}

/// Attaches to the started nodes as one cohesive cluster
#[async_trait]
pub trait ClusterLauncher: Send {
    /// Attach to and validate the running nodes
    async fn start(&mut self) -> Result<Box<dyn Cluster>>;

    /// Detach from the cluster
    async fn stop(&mut self, cluster: Box<dyn Cluster>) -> Result<()>;
}

// ============================================================================
// Component provider
// ============================================================================

/// Inputs of a source supplier
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSpec {
    /// Remote repository URL
    pub remote_url: String,
    /// Local checkout directory
    pub src_dir: PathBuf,
    /// Revision to check out
    pub revision: String,
    /// Build tool binary
    pub build_tool: PathBuf,
    /// Java home used for the build
    pub java_home: PathBuf,
    /// Directory of the current race
    pub race_root: PathBuf,
    /// Whether to build after checkout
    pub build: bool,
}

/// Inputs of a distribution supplier
#[derive(Debug, Clone, PartialEq)]
pub struct DistributionSpec {
    /// Distribution version
    pub version: String,
    /// Repository to download from
    pub repository: String,
    /// Distribution catalog section
    pub distribution_config: Section,
    /// Local download directory
    pub distributions_root: PathBuf,
    /// Plugins to download alongside
    pub plugins: Vec<Plugin>,
}

/// Inputs of a provisioner for a single node
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionerSpec {
    /// Host-local configuration
    pub cfg: Config,
    /// Car to apply (absent for external clusters)
    pub car: Option<Car>,
    /// Plugins to install
    pub plugins: Vec<Plugin>,
    /// Cluster settings requested by the workload
    pub cluster_settings: Option<Section>,
    /// IPs of all nodes in the cluster
    pub all_node_ips: Vec<IpAddr>,
    /// Directory of the current race
    pub race_root: PathBuf,
    /// Logical node id
    pub node_id: usize,
}

/// Which launcher a pipeline needs
#[derive(Debug, Clone, PartialEq)]
pub enum LauncherKind {
    /// Launch node processes on this host
    InProcess {
        /// Root directory of all races
        races_root: PathBuf,
        /// Directory of the current race
        race_root: PathBuf,
    },
    /// Connect to externally managed nodes
    External,
    /// Launch node containers
    Docker,
}

/// Creates the collaborators a pipeline or coordinator is made of
pub trait ComponentProvider: Send + Sync {
    /// Load a car by name
    fn load_car(&self, cfg: &Config, name: &str) -> Result<Car>;

    /// Load plugins by name
    fn load_plugins(&self, cfg: &Config, names: &[String]) -> Result<Vec<Plugin>>;

    /// Supplier that checks out and builds sources
    fn source_supplier(&self, spec: SourceSpec) -> Result<Box<dyn BinarySupplier>>;

    /// Supplier that downloads a packaged distribution
    fn distribution_supplier(&self, spec: DistributionSpec) -> Result<Box<dyn BinarySupplier>>;

    /// Provisioner for a node running directly on this host
    fn local_provisioner(&self, spec: ProvisionerSpec) -> Result<Box<dyn NodeProvisioner>>;

    /// Provisioner for a node running in a container
    fn docker_provisioner(&self, spec: ProvisionerSpec) -> Result<Box<dyn NodeProvisioner>>;

    /// Launcher of the given kind
    fn launcher(
        &self,
        kind: LauncherKind,
        cfg: &Config,
        metrics: SharedMetricsStore,
    ) -> Result<Box<dyn Launcher>>;

    /// Cluster launcher used by the coordinator
    fn cluster_launcher(
        &self,
        cfg: &Config,
        metrics: SharedMetricsStore,
    ) -> Result<Box<dyn ClusterLauncher>>;
}
