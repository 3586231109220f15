//! Driver-side evaluation stub.
//!
//! The optimizer sees a plain synchronous [`Evaluator`]. Each call forwards
//! the point over the channel and blocks the optimizer thread until the
//! worker's answer arrives. `&mut self` keeps at most one request in flight.
//!
//! Fatal bridge errors are latched: once the channel is broken every later
//! call fails fast with the same error and nothing more is sent.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::runtime::Handle;

use crate::bridge::channel::{ChannelError, DriverEndpoint};
use crate::bridge::protocol::{DriverMessage, RunId, WorkerMessage};
use crate::config::{BridgeConfig, ObjectiveFailurePolicy};
use crate::optimizer::{EvalError, Evaluator};

#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    #[error("worker unavailable: {0}")]
    WorkerUnavailable(#[source] Arc<ChannelError>),
    #[error("no response to request {seq} within {timeout:?}")]
    ResponseTimeout { seq: u64, timeout: Duration },
    #[error("no ready from worker within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("worker reported fatal error: {reason}")]
    WorkerFatal { reason: String },
    #[error("invalid point: {0}")]
    InvalidPoint(String),
}

impl BridgeError {
    /// Whether this error leaves the channel unusable.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::InvalidPoint(_))
    }
}

impl From<ChannelError> for BridgeError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Malformed(cause) => {
                Self::Protocol(format!("malformed message from worker: {cause}"))
            }
            other => Self::WorkerUnavailable(Arc::new(other)),
        }
    }
}

impl From<BridgeError> for EvalError {
    fn from(e: BridgeError) -> Self {
        match e {
            BridgeError::InvalidPoint(reason) => EvalError::InvalidPoint(reason),
            other => EvalError::Aborted {
                reason: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeOutcome {
    Value(f64),
    Failed(String),
}

/// One request/response pair as seen by the driver.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Exchange {
    pub seq: u64,
    pub point: Vec<f64>,
    pub outcome: ExchangeOutcome,
}

/// Send `init` and wait for the matching `ready`. Returns the worker's pid.
pub async fn handshake(
    endpoint: &mut DriverEndpoint,
    run_id: RunId,
    dimensions: usize,
    timeout: Duration,
) -> Result<u32, BridgeError> {
    tracing::debug!(%run_id, dimensions, "Sending init to worker");
    endpoint
        .send(DriverMessage::Init { run_id, dimensions })
        .await?;

    match endpoint.recv(Some(timeout)).await {
        Ok(WorkerMessage::Ready { run_id: echoed, pid }) if echoed == run_id => {
            tracing::debug!(%run_id, pid, "Worker ready");
            Ok(pid)
        }
        Ok(WorkerMessage::Ready { run_id: echoed, .. }) => Err(BridgeError::Protocol(format!(
            "ready for run {echoed}, expected {run_id}"
        ))),
        Ok(WorkerMessage::Fatal { reason }) => Err(BridgeError::WorkerFatal { reason }),
        Ok(other) => Err(BridgeError::Protocol(format!(
            "expected ready, got {}",
            other.kind()
        ))),
        Err(ChannelError::Timeout(d)) => Err(BridgeError::HandshakeTimeout(d)),
        Err(e) => Err(e.into()),
    }
}

pub struct EvalStub {
    endpoint: DriverEndpoint,
    runtime: Handle,
    dimensions: usize,
    response_timeout: Option<Duration>,
    failure_policy: ObjectiveFailurePolicy,
    next_seq: u64,
    in_flight: Option<(u64, Vec<f64>)>,
    fatal: Option<BridgeError>,
    terminated: bool,
    exchanges: Vec<Exchange>,
}

impl EvalStub {
    /// Wrap an endpoint whose handshake has completed.
    ///
    /// Must be called from within a Tokio runtime; evaluations block on it.
    pub fn new(endpoint: DriverEndpoint, dimensions: usize, config: &BridgeConfig) -> Self {
        Self {
            endpoint,
            runtime: Handle::current(),
            dimensions,
            response_timeout: config.response_timeout,
            failure_policy: config.failure_policy,
            next_seq: 1,
            in_flight: None,
            fatal: None,
            terminated: false,
            exchanges: Vec::new(),
        }
    }

    /// The first fatal error, if the bridge is broken.
    pub fn failure(&self) -> Option<&BridgeError> {
        self.fatal.as_ref()
    }

    pub fn exchanges(&self) -> &[Exchange] {
        &self.exchanges
    }

    pub fn into_exchanges(self) -> Vec<Exchange> {
        self.exchanges
    }

    /// Sequence number of the outstanding request, if any.
    pub fn in_flight(&self) -> Option<u64> {
        self.in_flight.as_ref().map(|(seq, _)| *seq)
    }

    fn usable(&self) -> Result<(), BridgeError> {
        if let Some(e) = &self.fatal {
            return Err(e.clone());
        }
        if self.terminated {
            return Err(BridgeError::Protocol("bridge already terminated".into()));
        }
        Ok(())
    }

    fn latch(&mut self, e: BridgeError) -> BridgeError {
        if e.is_fatal() && self.fatal.is_none() {
            tracing::error!(error = %e, "Bridge failed");
            self.fatal = Some(e.clone());
        }
        e
    }

    /// Send an evaluation request. Returns its sequence number.
    pub async fn submit(&mut self, point: &[f64]) -> Result<u64, BridgeError> {
        self.usable()?;
        if let Some(seq) = self.in_flight() {
            return Err(self.latch(BridgeError::Protocol(format!(
                "request {seq} is still outstanding"
            ))));
        }
        if point.len() != self.dimensions {
            return Err(BridgeError::InvalidPoint(format!(
                "expected {} coordinates, got {}",
                self.dimensions,
                point.len()
            )));
        }
        if let Some(index) = point.iter().position(|x| !x.is_finite()) {
            return Err(BridgeError::InvalidPoint(format!(
                "coordinate {index} is not finite"
            )));
        }

        let seq = self.next_seq;
        tracing::trace!(seq, ?point, "Submitting evaluation");
        if let Err(e) = self
            .endpoint
            .send(DriverMessage::Evaluate {
                seq,
                point: point.to_vec(),
            })
            .await
        {
            return Err(self.latch(e.into()));
        }
        self.next_seq += 1;
        self.in_flight = Some((seq, point.to_vec()));
        Ok(seq)
    }

    /// Wait for the answer to the outstanding request.
    pub async fn await_response(&mut self) -> Result<ExchangeOutcome, BridgeError> {
        self.usable()?;
        let Some((seq, point)) = self.in_flight.take() else {
            return Err(self.latch(BridgeError::Protocol(
                "no request outstanding".into(),
            )));
        };

        let outcome = match self.endpoint.recv(self.response_timeout).await {
            Ok(WorkerMessage::Value { seq: got, value }) if got == seq => {
                ExchangeOutcome::Value(value)
            }
            Ok(WorkerMessage::Failed { seq: got, error }) if got == seq => {
                ExchangeOutcome::Failed(error)
            }
            Ok(WorkerMessage::Value { seq: got, .. } | WorkerMessage::Failed { seq: got, .. }) => {
                return Err(self.latch(BridgeError::Protocol(format!(
                    "response for request {got}, expected {seq}"
                ))));
            }
            Ok(WorkerMessage::Fatal { reason }) => {
                return Err(self.latch(BridgeError::WorkerFatal { reason }));
            }
            Ok(other) => {
                return Err(self.latch(BridgeError::Protocol(format!(
                    "unexpected {} while awaiting request {seq}",
                    other.kind()
                ))));
            }
            Err(ChannelError::Timeout(timeout)) => {
                return Err(self.latch(BridgeError::ResponseTimeout { seq, timeout }));
            }
            Err(e) => return Err(self.latch(e.into())),
        };

        tracing::trace!(seq, ?outcome, "Received response");
        self.exchanges.push(Exchange {
            seq,
            point,
            outcome: outcome.clone(),
        });
        Ok(outcome)
    }

    async fn round_trip(&mut self, point: &[f64]) -> Result<f64, EvalError> {
        let max_attempts = self.failure_policy.max_attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.submit(point).await?;
            match self.await_response().await? {
                ExchangeOutcome::Value(value) => return Ok(value),
                ExchangeOutcome::Failed(error) if attempt < max_attempts => {
                    tracing::warn!(attempt, max_attempts, %error, "Objective failed, retrying");
                }
                ExchangeOutcome::Failed(message) => return Err(EvalError::Objective { message }),
            }
        }
    }

    /// Send the termination signal and close the channel.
    ///
    /// Refused, with nothing sent, while a request is outstanding or after
    /// the bridge has failed.
    pub async fn terminate(&mut self) -> Result<(), BridgeError> {
        self.usable()?;
        if let Some(seq) = self.in_flight() {
            return Err(self.latch(BridgeError::Protocol(format!(
                "terminate while request {seq} is outstanding"
            ))));
        }
        self.terminated = true;
        tracing::debug!(requests = self.next_seq - 1, "Sending termination signal");
        if let Err(e) = self.endpoint.send(DriverMessage::Terminate).await {
            return Err(self.latch(e.into()));
        }
        if let Err(e) = self.endpoint.close().await {
            tracing::debug!(error = %e, "Failed to close channel after termination signal");
        }
        Ok(())
    }
}

impl Evaluator for EvalStub {
    /// Blocks the calling thread; call from outside the runtime's workers
    /// (e.g. inside `spawn_blocking`).
    fn evaluate(&mut self, point: &[f64]) -> Result<f64, EvalError> {
        let runtime = self.runtime.clone();
        runtime.block_on(self.round_trip(point))
    }
}
