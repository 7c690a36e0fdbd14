//! Collaborators for pipelines that neither fetch nor provision anything

use async_trait::async_trait;

use crate::error::Result;
use crate::traits::{Binaries, BinarySupplier, NodeConfiguration, NodeProvisioner};

/// Supplier that supplies nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSupplier;

#[async_trait]
impl BinarySupplier for NoopSupplier {
    async fn supply(&mut self) -> Result<Binaries> {
        Ok(Binaries::default())
    }
}

/// Provisioner for nodes that are configured elsewhere
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProvisioner;

#[async_trait]
impl NodeProvisioner for NoopProvisioner {
    async fn prepare(&mut self, _binaries: &Binaries) -> Result<Option<NodeConfiguration>> {
        Ok(None)
    }

    async fn cleanup(&mut self) -> Result<()> {
        Ok(())
    }
}
