//! Creating and addressing host workers

use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::Config;
use crate::error::{MechanicError, Result};
use crate::protocol::{Dispatch, Round, WorkerCommand, WorkerId, WorkerNotification};
use crate::traits::ComponentProvider;

use super::executor::HostWorker;

/// Where a worker runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// In the coordinator's process
    Coordinator,
    /// On a remote host
    Remote {
        /// Host IP
        ip: IpAddr,
    },
}

/// Address of a spawned worker
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    /// Worker identifier
    pub id: WorkerId,

    /// Worker name, e.g. `mechanic/worker/127.0.0.1:9200`
    pub name: String,

    /// Where the worker runs
    pub placement: Placement,

    commands: mpsc::Sender<Dispatch>,
}

impl WorkerHandle {
    /// Create a handle from its command channel
    pub fn new(
        id: WorkerId,
        name: impl Into<String>,
        placement: Placement,
        commands: mpsc::Sender<Dispatch>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            placement,
            commands,
        }
    }

    /// Deliver a command of the given fan-out round
    ///
    /// Fails when the worker can no longer accept commands.
    pub async fn send(&self, round: Round, command: WorkerCommand) -> Result<()> {
        let name = command.name();
        self.commands
            .send(Dispatch { round, command })
            .await
            .map_err(|_| {
                MechanicError::communication(format!("{} did not accept [{name}]", self.name))
            })
    }

    /// Tell the worker to exit without waiting for buffer space
    pub fn exit(&self) -> Result<()> {
        let dispatch = Dispatch {
            round: Round::default(),
            command: WorkerCommand::Exit,
        };
        self.commands.try_send(dispatch).map_err(|_| {
            MechanicError::communication(format!("{} did not accept [exit]", self.name))
        })
    }
}

/// Creates host workers
pub trait WorkerSpawner: Send + Sync {
    /// Spawn one worker
    ///
    /// The worker reports replies to `notifications`, followed by an
    /// [`WorkerNotification::Exited`] once its task has ended.
    fn spawn(
        &self,
        id: WorkerId,
        name: &str,
        placement: Placement,
        notifications: mpsc::Sender<WorkerNotification>,
    ) -> Result<WorkerHandle>;
}

/// Spawns every worker as a task of the current tokio runtime
///
/// Remote placements are served by local tasks too; the placement is only
/// recorded on the handle.
pub struct InProcessSpawner {
    provider: Arc<dyn ComponentProvider>,
    local_config: Config,
    buffer: usize,
}

impl InProcessSpawner {
    /// Create a spawner
    pub fn new(provider: Arc<dyn ComponentProvider>, local_config: Config) -> Self {
        Self {
            provider,
            local_config,
            buffer: 16,
        }
    }

    /// Set the command buffer size of spawned workers
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer;
        self
    }
}

impl WorkerSpawner for InProcessSpawner {
    fn spawn(
        &self,
        id: WorkerId,
        name: &str,
        placement: Placement,
        notifications: mpsc::Sender<WorkerNotification>,
    ) -> Result<WorkerHandle> {
        let (tx, rx) = mpsc::channel(self.buffer);
        let worker = HostWorker::new(id, self.provider.clone(), self.local_config.clone());

        let task = tokio::spawn(worker.run(rx, notifications.clone()));
        tokio::spawn(async move {
            let detail = match task.await {
                Ok(()) => "exited".to_string(),
                Err(e) if e.is_panic() => format!("panicked: {e}"),
                Err(e) => format!("cancelled: {e}"),
            };
            let _ = notifications
                .send(WorkerNotification::Exited { worker: id, detail })
                .await;
        });

        tracing::debug!(worker = %id, name, placement = ?placement, "Spawned worker");
        Ok(WorkerHandle::new(id, name, placement, tx))
    }
}

impl std::fmt::Debug for InProcessSpawner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessSpawner")
            .field("local_config", &self.local_config.name)
            .field("buffer", &self.buffer)
            .finish()
    }
}
