//! Lifecycle pipeline of one host: supply -> provision -> launch
//!
//! A [`Mechanic`] composes a binary supplier, one provisioner per local node
//! and a launcher. The [`PipelineFactory`] picks the implementations for an
//! acquisition mode and rejects combinations the mode does not support.
//!
//! # Example
//!
//! ```ignore
//! use bench_mechanic_core::pipeline::PipelineFactory;
//!
//! let factory = PipelineFactory::new(provider);
//! let mut mechanic = factory.create(&cfg, metrics, &all_node_ips, None, mode)?;
//!
//! let nodes = mechanic.start_engine().await?;
//! mechanic.on_benchmark_start().await?;
//! mechanic.on_benchmark_stop().await?;
//! mechanic.stop_engine().await?;
//! ```

mod factory;
mod mechanic;
mod noop;

pub use factory::PipelineFactory;
pub use mechanic::Mechanic;
pub use noop::{NoopProvisioner, NoopSupplier};
