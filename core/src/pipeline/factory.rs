//! Pipeline factory: picks collaborators per acquisition mode

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{Config, Section};
use crate::error::{MechanicError, Result};
use crate::metrics::SharedMetricsStore;
use crate::protocol::AcquisitionMode;
use crate::traits::{
    BinarySupplier, ComponentProvider, DistributionSpec, LauncherKind, NodeProvisioner,
    Plugin, ProvisionerSpec, SourceSpec,
};

use super::mechanic::Mechanic;
use super::noop::{NoopProvisioner, NoopSupplier};

/// Builds a [`Mechanic`] for a host-local configuration
#[derive(Clone)]
pub struct PipelineFactory {
    provider: Arc<dyn ComponentProvider>,
}

impl PipelineFactory {
    /// Create a factory backed by the given component provider
    pub fn new(provider: Arc<dyn ComponentProvider>) -> Self {
        Self { provider }
    }

    /// Create the mechanic for one host
    ///
    /// `cfg` is the host-local configuration; `provisioning.node.ids` names
    /// the nodes to provision on this host.
    pub fn create(
        &self,
        cfg: &Config,
        metrics: SharedMetricsStore,
        all_node_ips: &[IpAddr],
        cluster_settings: Option<Section>,
        mode: AcquisitionMode,
    ) -> Result<Mechanic> {
        tracing::debug!(mode = %mode, config = %cfg.name, "Creating pipeline");

        if mode.is_external() {
            return self.external(cfg, metrics, cluster_settings);
        }

        let car = self.provider.load_car(cfg, &cfg.car_name()?)?;
        let plugins = self.provider.load_plugins(cfg, &cfg.car_plugins()?)?;
        let node_ids = cfg.node_ids()?;
        let race_root = cfg.race_root()?;

        let provisioner_spec = |node_id: usize| ProvisionerSpec {
            cfg: cfg.clone(),
            car: Some(car.clone()),
            plugins: plugins.clone(),
            cluster_settings: cluster_settings.clone(),
            all_node_ips: all_node_ips.to_vec(),
            race_root: race_root.clone(),
            node_id,
        };

        match mode {
            AcquisitionMode::Sources { build } => {
                let src_dir: PathBuf = cfg.get("source", "local.src.dir").map_err(|e| {
                    tracing::error!(error = %e, "Cannot determine source directory");
                    MechanicError::setup(
                        "You cannot benchmark from sources. Please install all prerequisites \
                         and configure the source directory.",
                    )
                })?;
                let spec = SourceSpec {
                    remote_url: cfg.get("source", "remote.repo.url")?,
                    src_dir,
                    revision: cfg.get("mechanic", "source.revision")?,
                    build_tool: cfg.get("build", "gradle.bin")?,
                    java_home: cfg.get("runtime", "java8.home")?,
                    race_root: race_root.clone(),
                    build,
                };
                if !plugins.is_empty() {
                    return Err(MechanicError::unsupported(
                        "Source builds of plugins are not supported.",
                    ));
                }
                let supplier = self.provider.source_supplier(spec)?;
                let provisioners = node_ids
                    .iter()
                    .map(|id| self.provider.local_provisioner(provisioner_spec(*id)))
                    .collect::<Result<Vec<_>>>()?;
                self.assemble(cfg, metrics, supplier, provisioners, self.in_process(cfg, race_root)?)
            }
            AcquisitionMode::Distribution => {
                let root: PathBuf = cfg.get("node", "root.dir")?;
                let dir: String = cfg.get("source", "distribution.dir")?;
                let spec = DistributionSpec {
                    version: cfg.get("mechanic", "distribution.version")?,
                    repository: cfg.get("mechanic", "distribution.repository")?,
                    distribution_config: cfg.all_opts("distributions"),
                    distributions_root: root.join(dir),
                    plugins: plugins.clone(),
                };
                let supplier = self.provider.distribution_supplier(spec)?;
                let provisioners = node_ids
                    .iter()
                    .map(|id| self.provider.local_provisioner(provisioner_spec(*id)))
                    .collect::<Result<Vec<_>>>()?;
                self.assemble(cfg, metrics, supplier, provisioners, self.in_process(cfg, race_root)?)
            }
            AcquisitionMode::Docker => {
                reject_plugins(&plugins, "Docker clusters")?;
                let provisioners = node_ids
                    .iter()
                    .map(|id| self.provider.docker_provisioner(provisioner_spec(*id)))
                    .collect::<Result<Vec<_>>>()?;
                self.assemble(cfg, metrics, Box::new(NoopSupplier), provisioners, LauncherKind::Docker)
            }
            AcquisitionMode::External => self.external(cfg, metrics, cluster_settings),
        }
    }

    /// Externally managed clusters get no car and no plugins
    fn external(
        &self,
        cfg: &Config,
        metrics: SharedMetricsStore,
        cluster_settings: Option<Section>,
    ) -> Result<Mechanic> {
        if let Some(settings) = cluster_settings.filter(|s| !s.is_empty()) {
            tracing::warn!(
                settings = ?settings,
                "Cannot apply cluster settings to an externally provisioned cluster. Please ensure \
                 that the cluster settings are present or the benchmark may fail or behave unexpectedly"
            );
        }
        let provisioners: Vec<Box<dyn NodeProvisioner>> = vec![Box::new(NoopProvisioner)];
        self.assemble(cfg, metrics, Box::new(NoopSupplier), provisioners, LauncherKind::External)
    }

    fn in_process(&self, cfg: &Config, race_root: PathBuf) -> Result<LauncherKind> {
        Ok(LauncherKind::InProcess {
            races_root: cfg.races_root()?,
            race_root,
        })
    }

    fn assemble(
        &self,
        cfg: &Config,
        metrics: SharedMetricsStore,
        supplier: Box<dyn BinarySupplier>,
        provisioners: Vec<Box<dyn NodeProvisioner>>,
        kind: LauncherKind,
    ) -> Result<Mechanic> {
        let launcher = self.provider.launcher(kind, cfg, metrics)?;
        Ok(Mechanic::new(supplier, provisioners, launcher))
    }
}

impl std::fmt::Debug for PipelineFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineFactory").finish_non_exhaustive()
    }
}

fn reject_plugins(plugins: &[Plugin], target: &str) -> Result<()> {
    if plugins.is_empty() {
        Ok(())
    } else {
        Err(MechanicError::setup(format!(
            "You cannot specify any plugins for {target}. Please remove the plugins and try again."
        )))
    }
}
