//! Driver lifecycle.
//!
//! 1. Launch the worker and connect the channel.
//! 2. init/ready handshake, bounded by the setup timeout.
//! 3. Run the optimizer on a blocking thread against an [`EvalStub`].
//! 4. Send the termination signal once the optimizer returns.
//! 5. Join the worker, then report.
//!
//! Any fatal bridge error kills and reaps the worker before it is returned.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::bridge::channel::{self, DEFAULT_PAIR_CAPACITY, DriverEndpoint};
use crate::bridge::protocol::RunId;
use crate::config::{BridgeConfig, ConfigError, OptimizerConfig, Problem};
use crate::objective::{Objective, panic_message};
use crate::optimizer::{Optimizer, RunResult};
use crate::stub::{BridgeError, EvalStub, Exchange, handshake};
use crate::worker::{self, ServeSummary, WorkerError};

/// How long a worker gets to exit after SIGTERM before it is killed.
const SIGTERM_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// A started worker and the driver's end of its channel.
pub struct LaunchedWorker {
    pub endpoint: DriverEndpoint,
    pub handle: WorkerHandle,
}

/// Extension point for different ways of starting a worker.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self) -> Result<LaunchedWorker, SpawnError>;
}

/// Starts the worker as a child process speaking over its stdin/stdout.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Re-run the current executable, typically with a `worker` argument.
    pub fn current_exe() -> Result<Self, SpawnError> {
        Ok(Self::new(std::env::current_exe()?))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self) -> Result<LaunchedWorker, SpawnError> {
        tracing::info!(program = %self.program.display(), args = ?self.args, "Spawning worker process");
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        let endpoint = channel::from_child(&mut child)?;
        Ok(LaunchedWorker {
            endpoint,
            handle: WorkerHandle::Process(child),
        })
    }
}

/// Runs the worker loop as a tokio task over an in-memory channel.
pub struct TaskLauncher<F> {
    factory: F,
    capacity: usize,
}

impl<F, O> TaskLauncher<F>
where
    F: Fn() -> O + Send + Sync,
    O: Objective,
{
    /// `factory` builds a fresh objective for every launch.
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            capacity: DEFAULT_PAIR_CAPACITY,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

#[async_trait]
impl<F, O> WorkerLauncher for TaskLauncher<F>
where
    F: Fn() -> O + Send + Sync,
    O: Objective,
{
    async fn launch(&self) -> Result<LaunchedWorker, SpawnError> {
        let (driver, worker) = channel::pair(self.capacity);
        let task = tokio::spawn(worker::serve(worker, (self.factory)()));
        Ok(LaunchedWorker {
            endpoint: driver,
            handle: WorkerHandle::Task(task),
        })
    }
}

/// How the worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerExit {
    pub success: bool,
    /// Process exit code; `None` for tasks and signal deaths.
    pub code: Option<i32>,
    /// The worker had to be signalled or killed.
    pub forced: bool,
}

pub enum WorkerHandle {
    Process(Child),
    Task(JoinHandle<Result<ServeSummary, WorkerError>>),
}

impl WorkerHandle {
    /// OS pid, while a process worker is running.
    pub fn id(&self) -> Option<u32> {
        match self {
            Self::Process(child) => child.id(),
            Self::Task(_) => None,
        }
    }

    /// Wait for the worker to finish on its own. After `grace` a process
    /// gets SIGTERM and then SIGKILL; a task is aborted.
    pub async fn join(self, grace: Duration) -> io::Result<WorkerExit> {
        match self {
            Self::Process(mut child) => {
                if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
                    let status = status?;
                    return Ok(WorkerExit {
                        success: status.success(),
                        code: status.code(),
                        forced: false,
                    });
                }

                tracing::warn!(?grace, "Worker did not exit in time, sending SIGTERM");
                send_sigterm(&child);
                let status = match tokio::time::timeout(SIGTERM_GRACE, child.wait()).await {
                    Ok(status) => status?,
                    Err(_) => {
                        tracing::warn!("Worker ignored SIGTERM, killing");
                        child.kill().await?;
                        child.wait().await?
                    }
                };
                Ok(WorkerExit {
                    success: false,
                    code: status.code(),
                    forced: true,
                })
            }
            Self::Task(mut task) => match tokio::time::timeout(grace, &mut task).await {
                Ok(Ok(Ok(summary))) => {
                    tracing::debug!(served = summary.served, failed = summary.failed, "Worker task finished");
                    Ok(WorkerExit {
                        success: true,
                        code: None,
                        forced: false,
                    })
                }
                Ok(Ok(Err(e))) => {
                    tracing::warn!(error = %e, "Worker task failed");
                    Ok(WorkerExit {
                        success: false,
                        code: None,
                        forced: false,
                    })
                }
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "Worker task did not complete");
                    Ok(WorkerExit {
                        success: false,
                        code: None,
                        forced: false,
                    })
                }
                Err(_) => {
                    tracing::warn!(?grace, "Worker task did not finish in time, aborting");
                    task.abort();
                    let _ = task.await;
                    Ok(WorkerExit {
                        success: false,
                        code: None,
                        forced: true,
                    })
                }
            },
        }
    }

    /// Kill the worker and reap it.
    pub async fn kill(self) -> io::Result<WorkerExit> {
        match self {
            Self::Process(mut child) => {
                child.kill().await?;
                let status = child.wait().await?;
                Ok(WorkerExit {
                    success: false,
                    code: status.code(),
                    forced: true,
                })
            }
            Self::Task(task) => {
                task.abort();
                let _ = task.await;
                Ok(WorkerExit {
                    success: false,
                    code: None,
                    forced: true,
                })
            }
        }
    }
}

#[cfg(unix)]
fn send_sigterm(child: &Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    if let Some(pid) = child.id()
        && let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
    {
        tracing::debug!(pid, error = %e, "Failed to send SIGTERM");
    }
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child) {}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to launch worker: {0}")]
    Spawn(#[from] SpawnError),
    #[error("worker setup timed out after {0:?}")]
    SetupTimeout(Duration),
    #[error("worker setup failed: {0}")]
    Setup(#[source] BridgeError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error("optimizer panicked: {0}")]
    OptimizerPanicked(String),
    #[error("failed to reap worker: {0}")]
    Shutdown(#[source] io::Error),
}

/// Everything known about a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub worker_pid: u32,
    pub result: RunResult,
    pub exchanges: Vec<Exchange>,
    pub worker_exit: WorkerExit,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

pub struct Driver {
    config: BridgeConfig,
}

impl Driver {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Run `optimizer` on `problem` with every objective call answered by a
    /// freshly launched worker.
    pub async fn run<L, P>(
        &self,
        launcher: &L,
        optimizer: P,
        problem: Problem,
        optimizer_config: OptimizerConfig,
    ) -> Result<RunReport, DriverError>
    where
        L: WorkerLauncher + ?Sized,
        P: Optimizer,
    {
        self.config.validate()?;
        optimizer_config.validate()?;

        let run_id = RunId::new();
        let started_at = Utc::now();
        let dimensions = problem.dimensions();
        tracing::info!(%run_id, dimensions, "Starting run");

        let LaunchedWorker {
            mut endpoint,
            handle,
        } = launcher.launch().await?;

        let worker_pid =
            match handshake(&mut endpoint, run_id, dimensions, self.config.setup_timeout).await {
                Ok(pid) => pid,
                Err(e) => {
                    drop(endpoint);
                    reap_after_failure(handle).await;
                    return Err(match e {
                        BridgeError::HandshakeTimeout(d) => DriverError::SetupTimeout(d),
                        other => DriverError::Setup(other),
                    });
                }
            };
        tracing::info!(%run_id, worker_pid, "Worker ready, starting optimizer");

        let stub = EvalStub::new(endpoint, dimensions, &self.config);
        let mut optimizer = optimizer;
        let joined = tokio::task::spawn_blocking(move || {
            let mut stub = stub;
            let result = optimizer.optimize(&mut stub, &problem, &optimizer_config);
            (stub, result)
        })
        .await;

        let (mut stub, result) = match joined {
            Ok(done) => done,
            Err(e) => {
                let reason = if e.is_panic() {
                    panic_message(&*e.into_panic()).to_string()
                } else {
                    e.to_string()
                };
                tracing::error!(%run_id, %reason, "Optimizer panicked");
                reap_after_failure(handle).await;
                return Err(DriverError::OptimizerPanicked(reason));
            }
        };

        if let Some(e) = stub.failure().cloned() {
            tracing::error!(%run_id, error = %e, "Bridge failed during run");
            drop(stub);
            reap_after_failure(handle).await;
            return Err(e.into());
        }

        if let Err(e) = stub.terminate().await {
            drop(stub);
            reap_after_failure(handle).await;
            return Err(e.into());
        }
        let exchanges = stub.into_exchanges();

        let worker_exit = handle
            .join(self.config.shutdown_timeout)
            .await
            .map_err(DriverError::Shutdown)?;
        if !worker_exit.success {
            tracing::warn!(%run_id, ?worker_exit, "Worker did not exit cleanly");
        }

        tracing::info!(
            %run_id,
            status = result.status.code(),
            best = ?result.best_value(),
            evaluations = exchanges.len(),
            "Run finished"
        );

        Ok(RunReport {
            run_id,
            worker_pid,
            result,
            exchanges,
            worker_exit,
            started_at,
            completed_at: Utc::now(),
        })
    }
}

async fn reap_after_failure(handle: WorkerHandle) {
    match handle.kill().await {
        Ok(exit) => tracing::debug!(?exit, "Worker killed"),
        Err(e) => tracing::warn!(error = %e, "Failed to kill worker"),
    }
}
