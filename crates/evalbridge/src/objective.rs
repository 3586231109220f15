//! Objective function capability, hosted by the worker.

use std::panic::{AssertUnwindSafe, catch_unwind};

/// Error raised by an objective function.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct ObjectiveError {
    message: String,
}

impl ObjectiveError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// The function being optimized.
///
/// Implementations may keep state between calls but must not touch the
/// channel; the service loop owns it exclusively. In a worker process that
/// channel is stdout. Prints made while serving are redirected to stderr on
/// unix, but anything written to stdout before [`run_worker`] starts reaches
/// the driver as a malformed message.
///
/// [`run_worker`]: crate::worker::run_worker
pub trait Objective: Send + 'static {
    fn evaluate(&mut self, point: &[f64]) -> Result<f64, ObjectiveError>;
}

impl<F> Objective for F
where
    F: FnMut(&[f64]) -> f64 + Send + 'static,
{
    fn evaluate(&mut self, point: &[f64]) -> Result<f64, ObjectiveError> {
        Ok(self(point))
    }
}

/// Adapter for closures that can fail.
pub struct FallibleObjective<F>(pub F);

impl<F> Objective for FallibleObjective<F>
where
    F: FnMut(&[f64]) -> Result<f64, ObjectiveError> + Send + 'static,
{
    fn evaluate(&mut self, point: &[f64]) -> Result<f64, ObjectiveError> {
        (self.0)(point)
    }
}

/// Run the objective, turning errors, panics and non-finite results into an
/// error message the worker can report instead of dying.
pub fn evaluate_guarded<O: Objective>(objective: &mut O, point: &[f64]) -> Result<f64, String> {
    match catch_unwind(AssertUnwindSafe(|| objective.evaluate(point))) {
        Ok(Ok(value)) if value.is_finite() => Ok(value),
        Ok(Ok(value)) => Err(format!("objective returned non-finite value: {value}")),
        Ok(Err(e)) => Err(format!("objective failed: {e}")),
        Err(payload) => Err(format!("objective panicked: {}", panic_message(&*payload))),
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closure_is_an_objective() {
        let mut f = |x: &[f64]| x.iter().sum::<f64>();
        assert_eq!(evaluate_guarded(&mut f, &[1.0, 2.0]), Ok(3.0));
    }

    #[test]
    fn error_is_reported() {
        let mut f = FallibleObjective(|_: &[f64]| -> Result<f64, ObjectiveError> {
            Err(ObjectiveError::new("out of budget"))
        });
        assert_eq!(
            evaluate_guarded(&mut f, &[0.0]),
            Err("objective failed: out of budget".to_string())
        );
    }

    #[test]
    fn panic_is_caught() {
        let mut f = |_: &[f64]| -> f64 { panic!("boom") };
        assert_eq!(
            evaluate_guarded(&mut f, &[0.0]),
            Err("objective panicked: boom".to_string())
        );
    }

    #[test]
    fn formatted_panic_is_caught() {
        let mut f = |x: &[f64]| -> f64 { panic!("bad point {:?}", x) };
        assert_eq!(
            evaluate_guarded(&mut f, &[1.5]),
            Err("objective panicked: bad point [1.5]".to_string())
        );
    }

    #[test]
    fn non_finite_is_rejected() {
        let mut f = |_: &[f64]| f64::INFINITY;
        let err = evaluate_guarded(&mut f, &[0.0]).unwrap_err();
        assert!(err.contains("non-finite"), "{err}");
    }

    #[test]
    fn state_survives_between_calls() {
        let mut calls = 0u32;
        let mut f = move |_: &[f64]| {
            calls += 1;
            calls as f64
        };
        assert_eq!(evaluate_guarded(&mut f, &[]), Ok(1.0));
        assert_eq!(evaluate_guarded(&mut f, &[]), Ok(2.0));
    }
}
