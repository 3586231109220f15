//! evalbridge: run a black-box optimizer against an objective function that
//! lives in another process.

pub mod bridge;
pub mod config;
pub mod driver;
pub mod functions;
pub mod logging;
pub mod objective;
pub mod optimizer;
pub mod stub;
pub mod worker;

pub use bridge::protocol::RunId;
pub use config::{BridgeConfig, ConfigError, ObjectiveFailurePolicy, OptimizerConfig, Problem};
pub use driver::{
    Driver, DriverError, ProcessLauncher, RunReport, TaskLauncher, WorkerExit, WorkerLauncher,
};
pub use objective::{FallibleObjective, Objective, ObjectiveError};
pub use optimizer::{
    Candidate, EvalError, Evaluator, Optimizer, RandomSearch, RunResult, RunStatus,
    ScriptedOptimizer,
};
pub use stub::{BridgeError, EvalStub, Exchange, ExchangeOutcome};
pub use worker::{ServeSummary, WorkerError, run_worker, serve};
