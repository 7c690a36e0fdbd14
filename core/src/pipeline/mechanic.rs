//! Mechanic: the run-state of one host's pipeline

use crate::error::{MechanicError, Result};
use crate::protocol::NodeMetaInfo;
use crate::traits::{BinarySupplier, Launcher, Node, NodeConfiguration, NodeProvisioner};

/// Supply -> provision -> launch over the nodes of one host
///
/// The supplier runs lazily inside [`Mechanic::start_engine`], at most once
/// per start. After [`Mechanic::stop_engine`] the mechanic can be started
/// again.
pub struct Mechanic {
    supplier: Box<dyn BinarySupplier>,
    provisioners: Vec<Box<dyn NodeProvisioner>>,
    launcher: Box<dyn Launcher>,
    nodes: Vec<Box<dyn Node>>,
    running: bool,
}

impl Mechanic {
    /// Compose a mechanic from its collaborators
    pub fn new(
        supplier: Box<dyn BinarySupplier>,
        provisioners: Vec<Box<dyn NodeProvisioner>>,
        launcher: Box<dyn Launcher>,
    ) -> Self {
        Self {
            supplier,
            provisioners,
            launcher,
            nodes: Vec::new(),
            running: false,
        }
    }

    /// Fetch binaries, prepare every node and launch them
    ///
    /// Returns the metadata of the started nodes.
    pub async fn start_engine(&mut self) -> Result<Vec<NodeMetaInfo>> {
        if self.running {
            return Err(MechanicError::protocol("mechanic is already running"));
        }

        let binaries = self.supplier.supply().await?;
        tracing::debug!(artifacts = binaries.artifacts.len(), "Binaries supplied");

        let mut configs: Vec<NodeConfiguration> = Vec::with_capacity(self.provisioners.len());
        for provisioner in &mut self.provisioners {
            if let Some(config) = provisioner.prepare(&binaries).await? {
                configs.push(config);
            }
        }

        self.nodes = self.launcher.start(configs).await?;
        self.running = true;

        tracing::info!(nodes = self.nodes.len(), "Nodes launched");
        Ok(self.nodes.iter().map(|n| n.meta_info()).collect())
    }

    /// Notify every node that a lap begins
    pub async fn on_benchmark_start(&mut self) -> Result<()> {
        for node in &mut self.nodes {
            node.on_benchmark_start().await?;
        }
        Ok(())
    }

    /// Notify every node that a lap ends
    pub async fn on_benchmark_stop(&mut self) -> Result<()> {
        for node in &mut self.nodes {
            node.on_benchmark_stop().await?;
        }
        Ok(())
    }

    /// Stop all nodes and clean up every provisioner
    ///
    /// The mechanic counts as stopped afterwards even if a collaborator
    /// failed; the first error is returned once all cleanups have run.
    pub async fn stop_engine(&mut self) -> Result<()> {
        let nodes = std::mem::take(&mut self.nodes);
        let mut first_error = self.launcher.stop(nodes).await.err();

        for provisioner in &mut self.provisioners {
            if let Err(e) = provisioner.cleanup().await {
                tracing::warn!(error = %e, "Provisioner cleanup failed");
                first_error.get_or_insert(e);
            }
        }
        self.running = false;

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Whether nodes are currently launched
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Names of the launched nodes
    pub fn node_names(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.meta_info().node_name).collect()
    }
}

impl std::fmt::Debug for Mechanic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mechanic")
            .field("provisioners", &self.provisioners.len())
            .field("nodes", &self.nodes.len())
            .field("running", &self.running)
            .finish()
    }
}
