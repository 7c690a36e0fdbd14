//! Cluster-wide lifecycle state machine

use serde::{Deserialize, Serialize};

use crate::error::{MechanicError, Result};

/// Lifecycle state of one run
///
/// The lap loop `cluster_started | benchmark_stopped -> benchmark_starting
/// -> benchmark_started -> benchmark_stopping -> benchmark_stopped` repeats
/// until teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// No run in progress
    Idle,
    /// Start-nodes sent to every worker
    Starting,
    /// All nodes are running
    NodesStarted,
    /// Cluster meta-info pushed to every worker
    ApplyMetaInfo,
    /// The cluster is ready
    ClusterStarted,
    /// A lap is being started
    BenchmarkStarting,
    /// A lap is running
    BenchmarkStarted,
    /// A lap is being stopped
    BenchmarkStopping,
    /// The last lap has finished
    BenchmarkStopped,
    /// Stop-nodes sent to every worker
    ClusterStopping,
    /// All nodes are stopped
    ClusterStopped,
}

impl LifecycleState {
    /// Stable snake_case name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::NodesStarted => "nodes_started",
            Self::ApplyMetaInfo => "apply_meta_info",
            Self::ClusterStarted => "cluster_started",
            Self::BenchmarkStarting => "benchmark_starting",
            Self::BenchmarkStarted => "benchmark_started",
            Self::BenchmarkStopping => "benchmark_stopping",
            Self::BenchmarkStopped => "benchmark_stopped",
            Self::ClusterStopping => "cluster_stopping",
            Self::ClusterStopped => "cluster_stopped",
        }
    }

    /// Whether the coordinator waits for worker replies in this state
    pub fn awaits_replies(&self) -> bool {
        matches!(
            self,
            Self::Starting
                | Self::ApplyMetaInfo
                | Self::BenchmarkStarting
                | Self::BenchmarkStopping
                | Self::ClusterStopping
        )
    }

    /// Reject `what` unless the current state is one of `allowed`
    pub fn require(&self, allowed: &[LifecycleState], what: &str) -> Result<()> {
        if allowed.contains(self) {
            Ok(())
        } else {
            let expected = allowed
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            Err(MechanicError::protocol(format!(
                "received [{what}] in state [{self}] but expected one of [{expected}]"
            )))
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
