//! Wire protocol types for driver-worker communication.
//!
//! One duplex channel carries both directions. The driver speaks
//! [`DriverMessage`], the worker answers with [`WorkerMessage`]. Termination is
//! its own variant rather than a reserved payload value, so no legal point can
//! ever be mistaken for the stop signal.

use serde::{Deserialize, Serialize};

/// Identifier for one optimization run.
///
/// Sent in `Init` and echoed in `Ready` so a driver can tell it is talking to
/// the worker it spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(uuid::Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Messages from driver to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DriverMessage {
    /// Handshake, must be the first message of a run.
    Init { run_id: RunId, dimensions: usize },

    /// Evaluate the objective at `point`. `seq` starts at 1 and grows by one
    /// per request.
    Evaluate { seq: u64, point: Vec<f64> },

    /// No further requests follow. Never answered.
    Terminate,
}

impl DriverMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::Evaluate { .. } => "evaluate",
            Self::Terminate => "terminate",
        }
    }
}

/// Messages from worker to driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Ready { run_id: RunId, pid: u32 },

    /// Objective value for request `seq`.
    Value { seq: u64, value: f64 },

    /// The objective failed on request `seq`; the worker keeps serving.
    Failed { seq: u64, error: String },

    /// Worker unrecoverable error. The worker exits right after sending this.
    Fatal { reason: String },
}

impl WorkerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "ready",
            Self::Value { .. } => "value",
            Self::Failed { .. } => "failed",
            Self::Fatal { .. } => "fatal",
        }
    }
}
