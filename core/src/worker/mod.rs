//! Host workers: one coordination unit per physical host
//!
//! A [`HostWorker`] owns exactly one lifecycle pipeline and processes the
//! coordinator's commands one at a time:
//!
//! 1. `start-nodes` materializes a host-local configuration, opens a local
//!    metrics store and starts a fresh [`Mechanic`](crate::pipeline::Mechanic)
//! 2. benchmark-phase commands are proxied to the pipeline; a finished lap
//!    drains the local metrics buffer into the reply
//! 3. `stop-nodes` tears the pipeline down and resets the worker so that it
//!    can serve another run
//!
//! Every command is answered with its matching event or a failure event. A
//! failing command never ends the worker task.
//!
//! # Example
//!
//! ```ignore
//! use bench_mechanic_core::worker::{InProcessSpawner, Placement, WorkerSpawner};
//!
//! let spawner = InProcessSpawner::new(provider, local_config);
//! let handle = spawner.spawn(
//!     WorkerId(0),
//!     "mechanic/worker/127.0.0.1:9200",
//!     Placement::Coordinator,
//!     notifications_tx,
//! )?;
//! handle.send(Round(1), WorkerCommand::StopNodes).await?;
//! ```

mod executor;
mod spawner;

pub use executor::HostWorker;
pub use spawner::{InProcessSpawner, Placement, WorkerHandle, WorkerSpawner};
