//! Run-control side of the coordinator

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{MechanicError, Result};
use crate::metrics::SystemMetrics;
use crate::protocol::{
    EngineCommand, EngineEvent, EngineReply, EngineRequest, EngineStarted, Failure, RequestId,
    StartEngine,
};

/// Handle to a running coordinator task
///
/// Every request waits for the first event that answers it. A [`Failure`]
/// event is returned as the error; a reply of the wrong kind is turned into
/// one. Events answering earlier requests are discarded.
pub struct EngineHandle {
    commands: mpsc::Sender<EngineRequest>,
    events: mpsc::Receiver<EngineReply>,
    last_request: RequestId,
    task: Option<JoinHandle<()>>,
}

impl EngineHandle {
    pub(crate) fn new(
        commands: mpsc::Sender<EngineRequest>,
        events: mpsc::Receiver<EngineReply>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            commands,
            events,
            last_request: RequestId::default(),
            task: Some(task),
        }
    }

    /// Send a command without waiting for its reply
    pub async fn send(&mut self, command: EngineCommand) -> Result<RequestId> {
        let id = self.last_request.next();
        let name = command.name();
        self.commands
            .send(EngineRequest { id, command })
            .await
            .map_err(|_| MechanicError::communication(format!("coordinator did not accept [{name}]")))?;
        self.last_request = id;
        Ok(id)
    }

    /// Next event of the coordinator, `None` once it has finished
    pub async fn next_event(&mut self) -> Option<EngineEvent> {
        self.events.recv().await.map(|reply| reply.event)
    }

    /// Provision and start the cluster
    pub async fn start_engine(&mut self, start: StartEngine) -> std::result::Result<EngineStarted, Failure> {
        match self.request(EngineCommand::StartEngine(Box::new(start))).await? {
            EngineEvent::EngineStarted(started) => Ok(*started),
            other => Err(unexpected("start-engine", &other)),
        }
    }

    /// Begin a measurement lap
    pub async fn on_benchmark_start(&mut self, lap: u32) -> std::result::Result<(), Failure> {
        match self.request(EngineCommand::OnBenchmarkStart { lap }).await? {
            EngineEvent::BenchmarkStarted => Ok(()),
            other => Err(unexpected("on-benchmark-start", &other)),
        }
    }

    /// End the current measurement lap, returning its system metrics
    pub async fn on_benchmark_stop(&mut self) -> std::result::Result<SystemMetrics, Failure> {
        match self.request(EngineCommand::OnBenchmarkStop).await? {
            EngineEvent::BenchmarkStopped { system_metrics } => Ok(system_metrics),
            other => Err(unexpected("on-benchmark-stop", &other)),
        }
    }

    /// Tear the cluster down, returning the final system metrics
    pub async fn stop_engine(&mut self) -> std::result::Result<SystemMetrics, Failure> {
        match self.request(EngineCommand::StopEngine).await? {
            EngineEvent::EngineStopped { system_metrics } => Ok(system_metrics),
            other => Err(unexpected("stop-engine", &other)),
        }
    }

    /// Close the command channel and wait for the coordinator task
    pub async fn join(self) {
        let Self {
            commands,
            mut events,
            task,
            ..
        } = self;
        drop(commands);
        events.close();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Coordinator task did not finish cleanly");
            }
        }
    }

    async fn request(&mut self, command: EngineCommand) -> std::result::Result<EngineEvent, Failure> {
        let name = command.name();
        let id = self.send(command).await.map_err(|e| Failure::from_error(&e))?;

        while let Some(EngineReply { request, event }) = self.events.recv().await {
            if request != id {
                tracing::warn!(event = event.name(), %request, awaiting = %id, "Discarding event of an earlier request");
                continue;
            }
            return match event {
                EngineEvent::Failure(failure) => Err(failure),
                event => Ok(event),
            };
        }
        Err(Failure::new(
            format!("Coordinator stopped before replying to [{name}]"),
            "",
        ))
    }
}

fn unexpected(request: &str, event: &EngineEvent) -> Failure {
    Failure::new(
        format!("Received [{}] in reply to [{request}]", event.name()),
        "",
    )
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("last_request", &self.last_request)
            .field("finished", &self.task.as_ref().map_or(true, |t| t.is_finished()))
            .finish()
    }
}
