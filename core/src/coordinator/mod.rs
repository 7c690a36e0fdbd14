//! Cluster-level coordination of host workers
//!
//! The coordinator is a single tokio task that owns the lifecycle state of one
//! run. Each phase follows the same shape:
//!
//! - validate the current state against the phase's allowed states
//! - fan a command out to every host worker and move to the waiting state
//! - collect exactly one reply per worker in a [`ResponseBarrier`]
//! - on the last reply, move on and run the phase's continuation
//!
//! Messages that do not fit the current state are protocol violations. They
//! are reported to the caller as failures and change nothing.
//!
//! # Example
//!
//! ```ignore
//! use bench_mechanic_core::{CoordinatorBuilder, StartEngine};
//!
//! let mut engine = CoordinatorBuilder::new()
//!     .provider(provider)
//!     .local_config(local_config)
//!     .spawn()?;
//!
//! let started = engine.start_engine(start).await?;
//! engine.on_benchmark_start(1).await?;
//! let lap = engine.on_benchmark_stop().await?;
//! let totals = engine.stop_engine().await?;
//! ```

mod barrier;
mod builder;
mod executor;
mod handle;
mod reachability;
mod state;

pub use barrier::{BarrierProgress, ResponseBarrier};
pub use builder::CoordinatorBuilder;
pub use executor::Coordinator;
pub use handle::EngineHandle;
pub use reachability::{
    wait_until_reachable, Clock, ReachabilityProbe, TcpProbe, TokioClock, DEFAULT_DAEMON_PORT,
    DEFAULT_POLL_INTERVAL,
};
pub use state::LifecycleState;

#[cfg(test)]
mod tests;
