//! The optimizer capability.
//!
//! The bridge treats the optimizer as a black box: something that repeatedly
//! asks an [`Evaluator`] for objective values and eventually returns a
//! [`RunResult`]. Two simple implementations live here for demos and tests;
//! real Bayesian optimizers plug in through the same trait.

use rand::rngs::StdRng;
use rand::distributions::Standard;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::{OptimizerConfig, Problem};

/// Why an evaluation did not produce a value.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvalError {
    /// The optimizer asked for a point the bridge cannot send.
    #[error("invalid point: {0}")]
    InvalidPoint(String),
    /// The objective failed in the worker and the failure policy gave up.
    #[error("objective failed: {message}")]
    Objective { message: String },
    /// The bridge is broken; no further evaluation will succeed.
    #[error("evaluation aborted: {reason}")]
    Aborted { reason: String },
}

/// Synchronous evaluation interface the optimizer calls.
pub trait Evaluator {
    fn evaluate(&mut self, point: &[f64]) -> Result<f64, EvalError>;
}

impl<F> Evaluator for F
where
    F: FnMut(&[f64]) -> Result<f64, EvalError>,
{
    fn evaluate(&mut self, point: &[f64]) -> Result<f64, EvalError> {
        self(point)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub point: Vec<f64>,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    ObjectiveFailed { message: String },
    Aborted { reason: String },
}

impl RunStatus {
    /// Integer status as returned by the optimizer library (0 means success).
    pub fn code(&self) -> i32 {
        match self {
            Self::Completed => 0,
            Self::ObjectiveFailed { .. } => 1,
            Self::Aborted { .. } => 2,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl From<EvalError> for RunStatus {
    fn from(e: EvalError) -> Self {
        match e {
            EvalError::Objective { message } => Self::ObjectiveFailed { message },
            EvalError::InvalidPoint(reason) => Self::Aborted { reason },
            EvalError::Aborted { reason } => Self::Aborted { reason },
        }
    }
}

/// Outcome of one optimizer run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    /// Lowest value seen, if anything was evaluated.
    pub best: Option<Candidate>,
    #[serde(flatten)]
    pub status: RunStatus,
}

impl RunResult {
    pub fn best_value(&self) -> Option<f64> {
        self.best.as_ref().map(|c| c.value)
    }

    pub fn best_point(&self) -> Option<&[f64]> {
        self.best.as_ref().map(|c| c.point.as_slice())
    }
}

/// An optimization algorithm, minimizing over `problem`.
///
/// Runs on a blocking thread. It must stop calling the evaluator once it
/// returns, and should stop as soon as an evaluation fails.
pub trait Optimizer: Send + 'static {
    fn optimize(
        &mut self,
        evaluator: &mut dyn Evaluator,
        problem: &Problem,
        config: &OptimizerConfig,
    ) -> RunResult;
}

#[derive(Default)]
struct BestSoFar {
    best: Option<Candidate>,
}

impl BestSoFar {
    fn observe(&mut self, point: &[f64], value: f64) {
        let improved = self.best.as_ref().is_none_or(|b| value < b.value);
        if improved {
            self.best = Some(Candidate {
                point: point.to_vec(),
                value,
            });
        }
    }

    fn finish(self, status: RunStatus) -> RunResult {
        RunResult {
            best: self.best,
            status,
        }
    }
}

/// Evaluates a fixed list of points in order.
///
/// Deterministic, which makes it the optimizer of choice for regression tests.
#[derive(Debug, Clone, Default)]
pub struct ScriptedOptimizer {
    points: Vec<Vec<f64>>,
}

impl ScriptedOptimizer {
    pub fn new(points: Vec<Vec<f64>>) -> Self {
        Self { points }
    }

    pub fn points(&self) -> &[Vec<f64>] {
        &self.points
    }
}

impl Optimizer for ScriptedOptimizer {
    fn optimize(
        &mut self,
        evaluator: &mut dyn Evaluator,
        _problem: &Problem,
        _config: &OptimizerConfig,
    ) -> RunResult {
        let mut best = BestSoFar::default();
        for point in &self.points {
            match evaluator.evaluate(point) {
                Ok(value) => best.observe(point, value),
                Err(e) => return best.finish(e.into()),
            }
        }
        best.finish(RunStatus::Completed)
    }
}

/// Uniform random sampling inside the bounds.
///
/// Spends `n_init_samples + n_iterations` evaluations. Seeded from
/// `random_seed` when set.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomSearch;

impl Optimizer for RandomSearch {
    fn optimize(
        &mut self,
        evaluator: &mut dyn Evaluator,
        problem: &Problem,
        config: &OptimizerConfig,
    ) -> RunResult {
        let mut rng = match config.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let budget = config.evaluation_budget();
        tracing::debug!(budget, dimensions = problem.dimensions(), "Starting random search");

        let mut best = BestSoFar::default();
        for _ in 0..budget {
            let point: Vec<f64> = problem
                .lower()
                .iter()
                .zip(problem.upper())
                .map(|(lo, hi)| {
                    // Scaling a unit sample stays finite for any span Problem accepts.
                    let unit: f64 = rng.sample(Standard);
                    (lo + (hi - lo) * unit).min(*hi)
                })
                .collect();

            match evaluator.evaluate(&point) {
                Ok(value) => best.observe(&point, value),
                Err(e) => return best.finish(e.into()),
            }
        }
        best.finish(RunStatus::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::OffsetSphere;

    #[test]
    fn scripted_replays_in_order_and_keeps_minimum() {
        let mut seen = Vec::new();
        let mut eval = |p: &[f64]| -> Result<f64, EvalError> {
            seen.push(p.to_vec());
            Ok(OffsetSphere::default().value(p))
        };
        let mut opt = ScriptedOptimizer::new(vec![vec![0.5, 0.5], vec![0.53, 0.53], vec![0.9, 0.1]]);
        let problem = Problem::unit_cube(2).unwrap();

        let result = opt.optimize(&mut eval, &problem, &OptimizerConfig::default());

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.best_value(), Some(10.0));
        assert_eq!(result.best_point(), Some(&[0.53, 0.53][..]));
        assert_eq!(seen, vec![vec![0.5, 0.5], vec![0.53, 0.53], vec![0.9, 0.1]]);
    }

    #[test]
    fn scripted_stops_on_first_failure() {
        let mut calls = 0;
        let mut eval = |_: &[f64]| -> Result<f64, EvalError> {
            calls += 1;
            if calls == 2 {
                Err(EvalError::Objective {
                    message: "boom".into(),
                })
            } else {
                Ok(1.0)
            }
        };
        let mut opt = ScriptedOptimizer::new(vec![vec![0.1], vec![0.2], vec![0.3]]);
        let result = opt.optimize(
            &mut eval,
            &Problem::unit_cube(1).unwrap(),
            &OptimizerConfig::default(),
        );

        assert_eq!(calls, 2);
        assert_eq!(result.status.code(), 1);
        assert_eq!(result.best_value(), Some(1.0));
    }

    #[test]
    fn empty_script_evaluates_nothing() {
        let mut eval = |_: &[f64]| -> Result<f64, EvalError> { panic!("must not be called") };
        let result = ScriptedOptimizer::default().optimize(
            &mut eval,
            &Problem::unit_cube(1).unwrap(),
            &OptimizerConfig::default(),
        );
        assert_eq!(result.best, None);
        assert!(result.status.is_success());
    }

    #[test]
    fn random_search_respects_budget_and_bounds() {
        let problem = Problem::new(vec![-1.0, 10.0], vec![1.0, 20.0]).unwrap();
        let config = OptimizerConfig::builder()
            .n_init_samples(3)
            .n_iterations(7)
            .random_seed(42)
            .build()
            .unwrap();

        let mut points = Vec::new();
        let mut eval = |p: &[f64]| -> Result<f64, EvalError> {
            points.push(p.to_vec());
            Ok(p.iter().sum())
        };
        let result = RandomSearch.optimize(&mut eval, &problem, &config);

        assert_eq!(points.len(), 10);
        assert!(points.iter().all(|p| problem.contains(p)));
        let min = points
            .iter()
            .map(|p| p.iter().sum::<f64>())
            .fold(f64::INFINITY, f64::min);
        assert_eq!(result.best_value(), Some(min));
    }

    #[test]
    fn random_search_handles_spans_near_f64_max() {
        let problem = Problem::new(vec![0.0, -f64::MAX / 2.0], vec![f64::MAX, f64::MAX / 2.0])
            .unwrap();
        let config = OptimizerConfig::builder()
            .n_init_samples(4)
            .n_iterations(4)
            .random_seed(3)
            .build()
            .unwrap();

        let mut points = Vec::new();
        let mut eval = |p: &[f64]| -> Result<f64, EvalError> {
            points.push(p.to_vec());
            Ok(0.0)
        };
        let result = RandomSearch.optimize(&mut eval, &problem, &config);

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(points.len(), 8);
        assert!(points.iter().all(|p| problem.contains(p)));
    }

    #[test]
    fn random_search_is_reproducible_with_seed() {
        let problem = Problem::unit_cube(3).unwrap();
        let config = OptimizerConfig::builder()
            .n_init_samples(2)
            .n_iterations(3)
            .random_seed(9)
            .build()
            .unwrap();

        let run = || {
            let mut points = Vec::new();
            let mut eval = |p: &[f64]| -> Result<f64, EvalError> {
                points.push(p.to_vec());
                Ok(0.0)
            };
            RandomSearch.optimize(&mut eval, &problem, &config);
            points
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn run_status_serializes_flat() {
        let result = RunResult {
            best: None,
            status: RunStatus::Aborted {
                reason: "worker unavailable".into(),
            },
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "aborted");
        assert_eq!(json["reason"], "worker unavailable");
    }
}
