//! Multiplexer mode: every worker runs at once behind one outward channel.

use std::{sync::Arc, time::Duration};

use futures_util::future::join_all;
use strum_macros::Display;
use tokio::{io::BufReader, process::ChildStdout, sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    error::MuxError,
    framer::{Frame, LineReader},
    outward::{OutwardChannel, OutwardConnector},
    registry::{WorkerInput, WorkerRegistry},
    router::Router,
    worker::{LogStream, Worker, WorkerSpec, WorkerStatus, spawn_log_drain},
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Display)]
pub enum SupervisorState {
    Idle,
    Connecting,
    Running,
    ShuttingDown,
    Terminated,
}

/// Why [`Supervisor::run`] stopped.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The cancellation token fired.
    Cancelled,
    /// The outward channel failed or was closed by the counterpart.
    ChannelClosed,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub workers: Vec<WorkerSpec>,
    pub grace_period: Duration,
}

pub struct Supervisor {
    config: SupervisorConfig,
    connector: Arc<dyn OutwardConnector>,
    registry: WorkerRegistry,
    state: watch::Sender<SupervisorState>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, connector: Arc<dyn OutwardConnector>) -> Self {
        let (state, _) = watch::channel(SupervisorState::Idle);
        Self {
            config,
            connector,
            registry: WorkerRegistry::new(),
            state,
        }
    }

    /// Shared view of the workers, filled in while [`Supervisor::run`] starts them.
    pub fn registry(&self) -> WorkerRegistry {
        self.registry.clone()
    }

    pub fn state(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    fn transition(&self, next: SupervisorState) {
        let prev = self.state.send_replace(next);
        info!(from = %prev, to = %next, "supervisor state");
    }

    /// Connect, start every worker, route until `cancel` fires or the
    /// outward channel goes away, then tear everything down.
    ///
    /// No worker is started when the connection cannot be made.
    pub async fn run(&self, cancel: CancellationToken) -> Result<ShutdownReason, MuxError> {
        if *self.state.borrow() != SupervisorState::Idle {
            return Err(MuxError::Config("supervisor can only run once".to_string()));
        }

        self.transition(SupervisorState::Connecting);
        let outward = tokio::select! {
            _ = cancel.cancelled() => {
                self.transition(SupervisorState::Terminated);
                return Ok(ShutdownReason::Cancelled);
            }
            res = self.connector.connect() => match res {
                Ok(outward) => outward,
                Err(e) => {
                    error!(
                        endpoint = %self.connector.endpoint(),
                        error = %e,
                        "outward channel unavailable"
                    );
                    self.transition(SupervisorState::Terminated);
                    return Err(e);
                }
            },
        };

        self.transition(SupervisorState::Running);
        let router = Router::new(self.registry.clone(), outward.clone());
        let stop = CancellationToken::new();
        let channel_lost = CancellationToken::new();
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        let mut writers: Vec<JoinHandle<()>> = Vec::new();
        let mut workers: Vec<Worker> = Vec::new();

        for spec in &self.config.workers {
            let (mut worker, pipes) = match Worker::start(spec) {
                Ok(started) => started,
                Err(e) => {
                    error!(
                        worker = %spec.name,
                        error = %e,
                        "worker failed to start, continuing without it"
                    );
                    if let Err(e) = self.registry.register_failed(&spec.name) {
                        warn!(worker = %spec.name, error = %e, "could not record failed worker");
                    }
                    continue;
                }
            };

            let input = pipes.stdin.map(|stdin| {
                let (input, writer) = WorkerInput::spawn(&spec.name, stdin);
                writers.push(writer);
                input
            });
            if let Err(e) = self
                .registry
                .register(&spec.name, worker.status_cell(), input.clone())
            {
                error!(worker = %spec.name, error = %e, "refusing duplicate worker");
                if let Some(input) = input {
                    input.close();
                }
                if let Err(e) = worker.terminate(self.config.grace_period).await {
                    warn!(worker = %spec.name, error = %e, "could not stop duplicate worker");
                }
                continue;
            }

            tasks.push(tokio::spawn(forward_output(
                spec.name.clone(),
                pipes.stdout,
                router.clone(),
                stop.clone(),
                channel_lost.clone(),
            )));
            tasks.push(spawn_log_drain(spec.name.clone(), LogStream::Stderr, pipes.stderr));
            workers.push(worker);
        }

        tasks.push(tokio::spawn(listen_inbound(
            outward.clone(),
            router,
            stop.clone(),
            channel_lost.clone(),
        )));

        info!(
            started = workers.len(),
            configured = self.config.workers.len(),
            "multiplexer running"
        );

        let reason = tokio::select! {
            _ = cancel.cancelled() => ShutdownReason::Cancelled,
            _ = channel_lost.cancelled() => ShutdownReason::ChannelClosed,
        };

        self.transition(SupervisorState::ShuttingDown);
        stop.cancel();
        self.shutdown(workers, tasks, writers, outward).await;
        self.transition(SupervisorState::Terminated);
        Ok(reason)
    }

    async fn shutdown(
        &self,
        mut workers: Vec<Worker>,
        tasks: Vec<JoinHandle<()>>,
        writers: Vec<JoinHandle<()>>,
        outward: Arc<dyn OutwardChannel>,
    ) {
        for task in tasks {
            task.abort();
        }

        // well-behaved workers exit on EOF before any signal is sent
        self.registry.close_inputs();
        for res in join_all(writers).await {
            if let Err(e) = res {
                warn!(error = %e, "stdin writer task failed");
            }
        }

        let grace = self.config.grace_period;
        let results = join_all(workers.iter_mut().map(|w| w.terminate(grace))).await;
        for (worker, result) in workers.iter().zip(results) {
            if let Err(e) = result {
                error!(worker = %worker.name(), error = %e, "termination failed");
            }
        }

        if let Err(e) = outward.close().await {
            warn!(error = %e, "could not close outward channel cleanly");
        }
    }
}

/// Worker stdout → router → outward channel, in order.
async fn forward_output(
    name: String,
    stdout: ChildStdout,
    router: Router,
    stop: CancellationToken,
    channel_lost: CancellationToken,
) {
    let mut reader = LineReader::new(BufReader::new(stdout), name.clone());
    loop {
        let frame = tokio::select! {
            _ = stop.cancelled() => return,
            frame = reader.read_message() => frame,
        };
        match frame {
            Ok(Frame::Message(msg)) => {
                if let Err(e) = router.route_outbound(&name, msg).await {
                    error!(worker = %name, error = %e, "outward send failed");
                    channel_lost.cancel();
                    return;
                }
            }
            Ok(Frame::EndOfStream) => {
                let closed = MuxError::StreamClosed {
                    name: name.clone(),
                    stream: "stdout",
                };
                warn!(worker = %name, error = %closed, "worker stopped producing output");
                router.registry().set_status(&name, WorkerStatus::Stopped);
                return;
            }
            Err(e) => {
                warn!(worker = %name, error = %e, "reading worker output failed");
                router.registry().set_status(&name, WorkerStatus::Stopped);
                return;
            }
        }
    }
}

/// Outward channel → router → worker stdin, in order.
async fn listen_inbound(
    outward: Arc<dyn OutwardChannel>,
    router: Router,
    stop: CancellationToken,
    channel_lost: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = stop.cancelled() => return,
            next = outward.receive() => next,
        };
        match next {
            Ok(Some(msg)) => {
                router.route_inbound(msg);
            }
            Ok(None) => {
                warn!("outward channel closed by counterpart");
                channel_lost.cancel();
                return;
            }
            Err(e) => {
                error!(error = %e, "outward channel failed");
                channel_lost.cancel();
                return;
            }
        }
    }
}
