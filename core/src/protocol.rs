//! Message protocol between run control, the coordinator and host workers
//!
//! Every command has exactly one matching event. A receiver answers a command
//! with that event or with a [`Failure`], never with silence.

use std::collections::BTreeMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{Config, HostSpec, Section};
use crate::error::MechanicError;
use crate::metrics::{MetaInfo, MetricsContext, SystemMetrics};

// ============================================================================
// Identifiers and value types
// ============================================================================

/// Identifier of a host worker within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub usize);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Sequence number of a caller request
///
/// Every coordinator event carries the request it answers, so a caller can
/// tell a late event of an earlier request from the reply it waits for.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct RequestId(pub u64);

impl RequestId {
    /// The id following this one
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "request-{}", self.0)
    }
}

/// Sequence number of a coordinator fan-out
///
/// Workers echo the round of the command they answer. Replies of an earlier
/// round never count toward the current barrier.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Round(pub u64);

impl Round {
    /// The round following this one
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for Round {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "round-{}", self.0)
    }
}

/// How the benchmark candidate's binaries are acquired and run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionMode {
    /// Check out (and optionally build) from sources
    Sources {
        /// Whether to build before provisioning
        build: bool,
    },
    /// Download a packaged distribution
    Distribution,
    /// Connect to a cluster managed outside of this system
    External,
    /// Run nodes as containers
    Docker,
}

impl AcquisitionMode {
    /// Derive the mode from the legacy flag set
    ///
    /// Flags are evaluated in the order sources, distribution, external,
    /// docker; the first set flag wins.
    pub fn from_flags(
        sources: bool,
        build: bool,
        distribution: bool,
        external: bool,
        docker: bool,
    ) -> crate::Result<Self> {
        if sources {
            Ok(Self::Sources { build })
        } else if distribution {
            Ok(Self::Distribution)
        } else if external {
            Ok(Self::External)
        } else if docker {
            Ok(Self::Docker)
        } else {
            Err(MechanicError::protocol(
                "one of sources, distribution, docker or external must be set",
            ))
        }
    }

    /// Whether the cluster is managed outside of this system
    pub fn is_external(&self) -> bool {
        matches!(self, Self::External)
    }
}

impl std::fmt::Display for AcquisitionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sources { build: true } => write!(f, "sources (build)"),
            Self::Sources { build: false } => write!(f, "sources"),
            Self::Distribution => write!(f, "distribution"),
            Self::External => write!(f, "external"),
            Self::Docker => write!(f, "docker"),
        }
    }
}

/// Free-form descriptor (OS, JVM, CPU, ...)
pub type Descriptor = BTreeMap<String, Value>;

/// Snapshot of a started node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetaInfo {
    /// Host the node runs on
    pub host_name: String,
    /// Logical node name
    pub node_name: String,
    /// Node IP address
    pub ip: String,
    /// Operating system descriptor
    #[serde(default)]
    pub os: Descriptor,
    /// JVM descriptor
    #[serde(default)]
    pub jvm: Descriptor,
    /// CPU descriptor
    #[serde(default)]
    pub cpu: Descriptor,
    /// Memory descriptor
    #[serde(default)]
    pub memory: Descriptor,
    /// File system descriptors
    #[serde(default)]
    pub fs: Vec<Descriptor>,
    /// Installed plugins
    #[serde(default)]
    pub plugins: Vec<String>,
}

/// Snapshot of the whole cluster, built once it is confirmed started
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterMetaInfo {
    nodes: Vec<NodeMetaInfo>,
    node_count: usize,
    revision: Option<String>,
    distribution_version: Option<String>,
}

impl ClusterMetaInfo {
    /// Create cluster metadata from its nodes
    pub fn new(
        nodes: Vec<NodeMetaInfo>,
        revision: Option<String>,
        distribution_version: Option<String>,
    ) -> Self {
        Self {
            node_count: nodes.len(),
            nodes,
            revision,
            distribution_version,
        }
    }

    /// Cluster nodes
    pub fn nodes(&self) -> &[NodeMetaInfo] {
        &self.nodes
    }

    /// Number of nodes
    pub fn node_count(&self) -> usize {
        self.node_count
    }

    /// Source revision of the candidate
    pub fn revision(&self) -> Option<&str> {
        self.revision.as_deref()
    }

    /// Distribution version of the candidate
    pub fn distribution_version(&self) -> Option<&str> {
        self.distribution_version.as_deref()
    }
}

/// A failure report that crosses a task boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    /// Human readable message
    pub message: String,
    /// Opaque cause detail
    pub cause: String,
}

impl Failure {
    /// Create a failure from its parts
    pub fn new(message: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: cause.into(),
        }
    }

    /// Create a failure from an error, keeping its source chain as cause
    pub fn from_error(err: &MechanicError) -> Self {
        Self::new(err.to_string(), err.cause_chain())
    }

    /// Create a failure for a command the receiver could not execute
    pub fn command_failed(err: &MechanicError) -> Self {
        Self::new(
            format!("Could not execute command ({err})"),
            err.cause_chain(),
        )
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for Failure {}

// ============================================================================
// Run control <-> coordinator
// ============================================================================

/// Request to start the benchmark candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartEngine {
    /// Run-wide configuration
    pub cfg: Config,
    /// Context for opening metrics stores
    pub metrics_context: MetricsContext,
    /// Cluster settings requested by the workload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_settings: Option<Section>,
    /// How binaries are acquired
    pub mode: AcquisitionMode,
    /// Fixed IP of an externally managed node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,
    /// Fixed HTTP port of an externally managed node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Fixed node ids of an externally managed node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_ids: Option<Vec<usize>>,
}

impl StartEngine {
    /// Create a start request
    pub fn new(cfg: Config, metrics_context: MetricsContext, mode: AcquisitionMode) -> Self {
        Self {
            cfg,
            metrics_context,
            cluster_settings: None,
            mode,
            ip: None,
            port: None,
            node_ids: None,
        }
    }

    /// Set the cluster settings
    pub fn with_cluster_settings(mut self, settings: Section) -> Self {
        self.cluster_settings = Some(settings);
        self
    }

    /// Pin the externally managed node the worker connects to
    ///
    /// Only externally managed clusters use these; self-managed runs derive
    /// IP, port and node ids from the topology.
    pub fn with_fixed_node(mut self, ip: IpAddr, port: u16, node_ids: Vec<usize>) -> Self {
        self.ip = Some(ip);
        self.port = Some(port);
        self.node_ids = Some(node_ids);
        self
    }

    /// Derive the start-nodes command for one host
    pub fn for_nodes(&self, assignment: NodeAssignment) -> StartNodes {
        StartNodes {
            cfg: self.cfg.clone(),
            metrics_context: self.metrics_context.clone(),
            cluster_settings: self.cluster_settings.clone(),
            mode: self.mode,
            assignment,
        }
    }
}

/// Commands accepted by the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineCommand {
    /// Provision and start the cluster
    StartEngine(Box<StartEngine>),
    /// A measurement lap begins
    OnBenchmarkStart {
        /// Lap number (1-based)
        lap: u32,
    },
    /// The current measurement lap ends
    OnBenchmarkStop,
    /// Tear the cluster down
    StopEngine,
}

impl EngineCommand {
    /// Message name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::StartEngine(_) => "start-engine",
            Self::OnBenchmarkStart { .. } => "on-benchmark-start",
            Self::OnBenchmarkStop => "on-benchmark-stop",
            Self::StopEngine => "stop-engine",
        }
    }
}

/// A command on its way to the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineRequest {
    /// Sequence number assigned by the caller
    pub id: RequestId,
    /// The command
    pub command: EngineCommand,
}

/// An event on its way to the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineReply {
    /// Request the event answers
    pub request: RequestId,
    /// The event
    pub event: EngineEvent,
}

/// The cluster is up and ready
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStarted {
    /// Cluster metadata
    pub cluster: ClusterMetaInfo,
    /// Metrics meta-information gathered during startup
    pub system_meta: MetaInfo,
}

/// Events emitted by the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineEvent {
    /// Reply to [`EngineCommand::StartEngine`]
    EngineStarted(Box<EngineStarted>),
    /// Reply to [`EngineCommand::OnBenchmarkStart`]
    BenchmarkStarted,
    /// Reply to [`EngineCommand::OnBenchmarkStop`]
    BenchmarkStopped {
        /// System metrics of the finished lap
        system_metrics: SystemMetrics,
    },
    /// Reply to [`EngineCommand::StopEngine`]
    EngineStopped {
        /// Final system metrics
        system_metrics: SystemMetrics,
    },
    /// Any command failed
    Failure(Failure),
}

impl EngineEvent {
    /// Message name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::EngineStarted(_) => "engine-started",
            Self::BenchmarkStarted => "benchmark-started",
            Self::BenchmarkStopped { .. } => "benchmark-stopped",
            Self::EngineStopped { .. } => "engine-stopped",
            Self::Failure(_) => "failure",
        }
    }
}

// ============================================================================
// Coordinator <-> host worker
// ============================================================================

/// Which nodes a host worker is responsible for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeAssignment {
    /// Connect to an externally managed cluster
    External {
        /// All hosts of the external cluster
        hosts: Vec<HostSpec>,
        /// Fixed IP of the node to connect to
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ip: Option<IpAddr>,
        /// Fixed HTTP port of the node to connect to
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
        /// Fixed node ids
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node_ids: Option<Vec<usize>>,
    },
    /// Provision and launch nodes on this host
    Managed {
        /// IPs of all nodes in the cluster, including this host
        all_node_ips: Vec<IpAddr>,
        /// IP of this host
        ip: IpAddr,
        /// HTTP port on this host
        port: u16,
        /// Logical node ids that live on this host
        node_ids: Vec<usize>,
    },
}

/// Start the nodes of one host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartNodes {
    /// Run-wide configuration
    pub cfg: Config,
    /// Context for opening the local metrics store
    pub metrics_context: MetricsContext,
    /// Cluster settings requested by the workload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_settings: Option<Section>,
    /// How binaries are acquired
    pub mode: AcquisitionMode,
    /// Nodes of this host
    pub assignment: NodeAssignment,
}

/// Commands accepted by a host worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkerCommand {
    /// Provision and start the local nodes
    StartNodes(Box<StartNodes>),
    /// Merge cluster-wide metrics meta-information
    ApplyMetricsMetaInfo(MetaInfo),
    /// A measurement lap begins
    OnBenchmarkStart {
        /// Lap number
        lap: u32,
    },
    /// The current measurement lap ends
    OnBenchmarkStop,
    /// Stop the local nodes
    StopNodes,
    /// The parent terminates this worker
    Exit,
}

/// A worker command stamped with the fan-out it belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dispatch {
    /// Fan-out round
    pub round: Round,
    /// The command
    pub command: WorkerCommand,
}

impl WorkerCommand {
    /// Message name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::StartNodes(_) => "start-nodes",
            Self::ApplyMetricsMetaInfo(_) => "apply-metrics-meta-info",
            Self::OnBenchmarkStart { .. } => "on-benchmark-start",
            Self::OnBenchmarkStop => "on-benchmark-stop",
            Self::StopNodes => "stop-nodes",
            Self::Exit => "exit",
        }
    }
}

/// Events emitted by a host worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkerEvent {
    /// Reply to [`WorkerCommand::StartNodes`]
    NodesStarted {
        /// Started nodes
        nodes: Vec<NodeMetaInfo>,
        /// Local metrics meta-information
        system_meta: MetaInfo,
    },
    /// Reply to [`WorkerCommand::ApplyMetricsMetaInfo`]
    MetricsMetaInfoApplied,
    /// Reply to [`WorkerCommand::OnBenchmarkStart`]
    BenchmarkStarted,
    /// Reply to [`WorkerCommand::OnBenchmarkStop`]
    BenchmarkStopped {
        /// Metrics buffered during the lap
        system_metrics: SystemMetrics,
    },
    /// Reply to [`WorkerCommand::StopNodes`]
    NodesStopped {
        /// All metrics still buffered locally
        system_metrics: SystemMetrics,
    },
    /// A command failed
    Failure(Failure),
}

impl WorkerEvent {
    /// Message name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::NodesStarted { .. } => "nodes-started",
            Self::MetricsMetaInfoApplied => "metrics-meta-info-applied",
            Self::BenchmarkStarted => "benchmark-started",
            Self::BenchmarkStopped { .. } => "benchmark-stopped",
            Self::NodesStopped { .. } => "nodes-stopped",
            Self::Failure(_) => "failure",
        }
    }
}

/// What a worker (or its supervisor) tells the coordinator
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerNotification {
    /// A worker answered a command
    Replied {
        /// Replying worker
        worker: WorkerId,
        /// Round of the answered command
        round: Round,
        /// The reply
        event: WorkerEvent,
    },
    /// A worker task ended
    Exited {
        /// Terminated worker
        worker: WorkerId,
        /// How it ended
        detail: String,
    },
}
