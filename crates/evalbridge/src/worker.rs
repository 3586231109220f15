//! Worker side of the bridge.
//!
//! The parent side (spawning, the evaluation stub) is in driver.rs and stub.rs.
//!
//! State machine:
//! - AwaitingInit: `init` → send `ready` → Waiting; `terminate` → Stopped
//! - Waiting: `evaluate` → Evaluating → send `value`/`failed` → Waiting
//! - Waiting: `terminate` → Stopped (no reply)
//!
//! Anything else is a protocol violation: the worker sends `fatal` and exits.

use serde::Serialize;

use crate::bridge::channel::{self, ChannelError, WorkerEndpoint};
use crate::bridge::protocol::{DriverMessage, WorkerMessage};
use crate::objective::{Objective, evaluate_guarded};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    AwaitingInit,
    Waiting,
    Evaluating,
    Stopped,
}

/// What the service loop did before it stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServeSummary {
    /// Requests answered with a value.
    pub served: u64,
    /// Requests answered with `failed`.
    pub failed: u64,
}

impl ServeSummary {
    pub fn requests(&self) -> u64 {
        self.served + self.failed
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("evaluation task failed: {0}")]
    Task(String),
}

/// Serve evaluation requests until the termination signal arrives.
///
/// Objective errors, panics and non-finite values are answered with
/// `failed` and the loop keeps going.
pub async fn serve<O: Objective>(
    mut endpoint: WorkerEndpoint,
    mut objective: O,
) -> Result<ServeSummary, WorkerError> {
    let mut state = WorkerState::AwaitingInit;
    let mut dimensions = 0usize;
    let mut last_seq = 0u64;
    let mut summary = ServeSummary::default();

    loop {
        tracing::trace!(?state, "Waiting for message");
        let msg = match endpoint.recv(None).await {
            Ok(msg) => msg,
            Err(ChannelError::Closed) => {
                tracing::error!("Channel closed before termination signal (driver died?), exiting");
                return Err(ChannelError::Closed.into());
            }
            Err(ChannelError::Malformed(e)) => {
                return fatal(&mut endpoint, format!("malformed message from driver: {e}")).await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Channel error");
                return Err(e.into());
            }
        };

        match (state, msg) {
            (_, DriverMessage::Terminate) => {
                state = WorkerState::Stopped;
                tracing::info!(
                    served = summary.served,
                    failed = summary.failed,
                    "Termination signal received"
                );
                break;
            }

            (WorkerState::AwaitingInit, DriverMessage::Init { run_id, dimensions: d }) => {
                dimensions = d;
                tracing::info!(%run_id, dimensions, "Worker initialized");
                endpoint
                    .send(WorkerMessage::Ready {
                        run_id,
                        pid: std::process::id(),
                    })
                    .await?;
                state = WorkerState::Waiting;
            }

            (WorkerState::Waiting, DriverMessage::Evaluate { seq, point }) => {
                if seq != last_seq + 1 {
                    return fatal(
                        &mut endpoint,
                        format!("expected request {}, got {}", last_seq + 1, seq),
                    )
                    .await;
                }
                last_seq = seq;
                state = WorkerState::Evaluating;
                tracing::trace!(seq, ?state, ?point, "Evaluating request");

                let outcome = if point.len() != dimensions {
                    Err(format!(
                        "expected {} coordinates, got {}",
                        dimensions,
                        point.len()
                    ))
                } else {
                    let (returned, outcome) = tokio::task::spawn_blocking(move || {
                        let outcome = evaluate_guarded(&mut objective, &point);
                        (objective, outcome)
                    })
                    .await
                    .map_err(|e| WorkerError::Task(e.to_string()))?;
                    objective = returned;
                    outcome
                };

                let reply = match outcome {
                    Ok(value) => {
                        summary.served += 1;
                        WorkerMessage::Value { seq, value }
                    }
                    Err(error) => {
                        summary.failed += 1;
                        tracing::warn!(seq, %error, "Evaluation failed");
                        WorkerMessage::Failed { seq, error }
                    }
                };
                endpoint.send(reply).await?;
                state = WorkerState::Waiting;
            }

            (state, msg) => {
                return fatal(
                    &mut endpoint,
                    format!("unexpected {} while {:?}", msg.kind(), state),
                )
                .await;
            }
        }
    }

    debug_assert_eq!(state, WorkerState::Stopped);
    if let Err(e) = endpoint.close().await {
        tracing::debug!(error = %e, "Failed to close channel after termination");
    }
    Ok(summary)
}

async fn fatal(
    endpoint: &mut WorkerEndpoint,
    reason: String,
) -> Result<ServeSummary, WorkerError> {
    tracing::error!(%reason, "Protocol violation, exiting");
    let _ = endpoint
        .send(WorkerMessage::Fatal {
            reason: reason.clone(),
        })
        .await;
    Err(WorkerError::Protocol(reason))
}

/// Worker process entry point: serve over stdin/stdout.
///
/// Stdout is reserved for the channel; see [`channel::stdio`] for how stray
/// prints from the objective are kept off it.
pub async fn run_worker<O: Objective>(objective: O) -> Result<ServeSummary, WorkerError> {
    tracing::info!(pid = std::process::id(), "Worker starting");
    let endpoint = channel::stdio().map_err(ChannelError::Io)?;
    let summary = serve(endpoint, objective).await?;
    tracing::info!(requests = summary.requests(), "Worker exiting");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::bridge::channel::{DEFAULT_PAIR_CAPACITY, DriverEndpoint, pair};
    use crate::bridge::protocol::RunId;
    use crate::functions::OffsetSphere;

    async fn init(driver: &mut DriverEndpoint, dimensions: usize) {
        let run_id = RunId::new();
        driver
            .send(DriverMessage::Init { run_id, dimensions })
            .await
            .unwrap();
        match driver.recv(None).await.unwrap() {
            WorkerMessage::Ready { run_id: echoed, pid } => {
                assert_eq!(echoed, run_id);
                assert_eq!(pid, std::process::id());
            }
            other => panic!("expected ready, got {other:?}"),
        }
    }

    async fn evaluate(driver: &mut DriverEndpoint, seq: u64, point: Vec<f64>) -> WorkerMessage {
        driver
            .send(DriverMessage::Evaluate { seq, point })
            .await
            .unwrap();
        driver.recv(None).await.unwrap()
    }

    #[tokio::test]
    async fn two_requests_then_terminate() {
        let (mut driver, worker) = pair(DEFAULT_PAIR_CAPACITY);
        let task = tokio::spawn(serve(worker, OffsetSphere::default()));

        init(&mut driver, 2).await;

        match evaluate(&mut driver, 1, vec![0.5, 0.5]).await {
            WorkerMessage::Value { seq: 1, value } => assert!((value - 10.0018).abs() < 1e-12),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            evaluate(&mut driver, 2, vec![0.53, 0.53]).await,
            WorkerMessage::Value {
                seq: 2,
                value: 10.0
            }
        );

        driver.send(DriverMessage::Terminate).await.unwrap();
        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary, ServeSummary { served: 2, failed: 0 });

        // Nothing is sent in reply to the termination signal.
        assert!(matches!(driver.recv(None).await, Err(ChannelError::Closed)));
    }

    #[tokio::test]
    async fn terminate_as_first_message() {
        let (mut driver, worker) = pair(DEFAULT_PAIR_CAPACITY);
        let task = tokio::spawn(serve(worker, OffsetSphere::default()));

        driver.send(DriverMessage::Terminate).await.unwrap();

        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.requests(), 0);
        assert!(matches!(driver.recv(None).await, Err(ChannelError::Closed)));
    }

    #[tokio::test]
    async fn requests_are_processed_in_submission_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = {
            let seen = Arc::clone(&seen);
            move |p: &[f64]| {
                seen.lock().unwrap().push(p[0]);
                p[0] * 2.0
            }
        };
        let (mut driver, worker) = pair(DEFAULT_PAIR_CAPACITY);
        let task = tokio::spawn(serve(worker, recorder));

        init(&mut driver, 1).await;
        for seq in 1..=5u64 {
            let reply = evaluate(&mut driver, seq, vec![seq as f64]).await;
            assert_eq!(
                reply,
                WorkerMessage::Value {
                    seq,
                    value: seq as f64 * 2.0
                }
            );
        }
        driver.send(DriverMessage::Terminate).await.unwrap();

        assert_eq!(task.await.unwrap().unwrap().served, 5);
        assert_eq!(*seen.lock().unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[tokio::test]
    async fn objective_panic_is_reported_and_loop_continues() {
        let mut calls = 0;
        let flaky = move |_: &[f64]| {
            calls += 1;
            if calls == 1 {
                panic!("first call explodes");
            }
            1.0
        };
        let (mut driver, worker) = pair(DEFAULT_PAIR_CAPACITY);
        let task = tokio::spawn(serve(worker, flaky));

        init(&mut driver, 1).await;
        match evaluate(&mut driver, 1, vec![0.0]).await {
            WorkerMessage::Failed { seq: 1, error } => {
                assert!(error.contains("first call explodes"), "{error}")
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            evaluate(&mut driver, 2, vec![0.0]).await,
            WorkerMessage::Value { seq: 2, value: 1.0 }
        );
        driver.send(DriverMessage::Terminate).await.unwrap();

        assert_eq!(
            task.await.unwrap().unwrap(),
            ServeSummary { served: 1, failed: 1 }
        );
    }

    #[tokio::test]
    async fn wrong_dimension_is_failed_not_fatal() {
        let (mut driver, worker) = pair(DEFAULT_PAIR_CAPACITY);
        let task = tokio::spawn(serve(worker, OffsetSphere::default()));

        init(&mut driver, 2).await;
        match evaluate(&mut driver, 1, vec![0.5]).await {
            WorkerMessage::Failed { seq: 1, error } => {
                assert_eq!(error, "expected 2 coordinates, got 1")
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            evaluate(&mut driver, 2, vec![0.5, 0.5]).await,
            WorkerMessage::Value { seq: 2, .. }
        ));
        driver.send(DriverMessage::Terminate).await.unwrap();
        assert_eq!(task.await.unwrap().unwrap().failed, 1);
    }

    #[tokio::test]
    async fn evaluate_before_init_is_fatal() {
        let (mut driver, worker) = pair(DEFAULT_PAIR_CAPACITY);
        let task = tokio::spawn(serve(worker, OffsetSphere::default()));

        driver
            .send(DriverMessage::Evaluate {
                seq: 1,
                point: vec![0.5],
            })
            .await
            .unwrap();

        assert!(matches!(
            driver.recv(None).await.unwrap(),
            WorkerMessage::Fatal { .. }
        ));
        assert!(matches!(
            task.await.unwrap(),
            Err(WorkerError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_init_is_fatal() {
        let (mut driver, worker) = pair(DEFAULT_PAIR_CAPACITY);
        let task = tokio::spawn(serve(worker, OffsetSphere::default()));

        init(&mut driver, 1).await;
        driver
            .send(DriverMessage::Init {
                run_id: RunId::new(),
                dimensions: 1,
            })
            .await
            .unwrap();

        match driver.recv(None).await.unwrap() {
            WorkerMessage::Fatal { reason } => assert!(reason.contains("init"), "{reason}"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn skipped_sequence_number_is_fatal() {
        let (mut driver, worker) = pair(DEFAULT_PAIR_CAPACITY);
        let task = tokio::spawn(serve(worker, OffsetSphere::default()));

        init(&mut driver, 1).await;
        assert!(matches!(
            evaluate(&mut driver, 1, vec![0.1]).await,
            WorkerMessage::Value { seq: 1, .. }
        ));
        match evaluate(&mut driver, 3, vec![0.1]).await {
            WorkerMessage::Fatal { reason } => {
                assert_eq!(reason, "expected request 2, got 3")
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            task.await.unwrap(),
            Err(WorkerError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn unreadable_frame_from_driver_is_fatal() {
        use tokio::io::AsyncWriteExt;

        use crate::bridge::channel::Endpoint;

        let (raw_driver, worker_side) = tokio::io::duplex(DEFAULT_PAIR_CAPACITY);
        let (read, write) = tokio::io::split(worker_side);
        let worker: WorkerEndpoint = Endpoint::new(Box::new(read), Box::new(write));
        let task = tokio::spawn(serve(worker, OffsetSphere::default()));

        let (raw_read, mut raw_write) = tokio::io::split(raw_driver);
        raw_write.write_all(b"not a frame at all").await.unwrap();

        let mut driver: DriverEndpoint =
            Endpoint::new(Box::new(raw_read), Box::new(tokio::io::sink()));
        match driver.recv(None).await.unwrap() {
            WorkerMessage::Fatal { reason } => {
                assert!(reason.starts_with("malformed message from driver"), "{reason}")
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            task.await.unwrap(),
            Err(WorkerError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn driver_disappearing_stops_the_worker() {
        let (mut driver, worker) = pair(DEFAULT_PAIR_CAPACITY);
        let task = tokio::spawn(serve(worker, OffsetSphere::default()));

        init(&mut driver, 1).await;
        drop(driver);

        assert!(matches!(
            task.await.unwrap(),
            Err(WorkerError::Channel(ChannelError::Closed))
        ));
    }
}
