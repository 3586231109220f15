//! Typed configuration: optimizer parameters, problem bounds, bridge tuning.
//!
//! Everything is validated when built, so a config that exists is usable.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("problem must have at least one dimension")]
    NoDimensions,
    #[error("bounds length mismatch: {lower} lower vs {upper} upper")]
    BoundsLengthMismatch { lower: usize, upper: usize },
    #[error("bound {index} is not finite")]
    NonFiniteBound { index: usize },
    #[error("lower bound {index} ({lower}) exceeds upper bound ({upper})")]
    InvertedBounds { index: usize, lower: f64, upper: f64 },
    #[error("bound {index} spans [{lower}, {upper}], which overflows f64")]
    SpanOverflow { index: usize, lower: f64, upper: f64 },
    #[error("invalid value for {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("invalid parameters: {0}")]
    Parse(String),
    #[error("invalid environment variable {var}: {reason}")]
    Env { var: &'static str, reason: String },
}

impl ConfigError {
    fn field(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

/// Search box for the optimizer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Problem {
    lower: Vec<f64>,
    upper: Vec<f64>,
}

impl Problem {
    pub fn new(lower: Vec<f64>, upper: Vec<f64>) -> Result<Self, ConfigError> {
        if lower.len() != upper.len() {
            return Err(ConfigError::BoundsLengthMismatch {
                lower: lower.len(),
                upper: upper.len(),
            });
        }
        if lower.is_empty() {
            return Err(ConfigError::NoDimensions);
        }
        for (index, (lo, hi)) in lower.iter().zip(&upper).enumerate() {
            if !lo.is_finite() || !hi.is_finite() {
                return Err(ConfigError::NonFiniteBound { index });
            }
            if lo > hi {
                return Err(ConfigError::InvertedBounds {
                    index,
                    lower: *lo,
                    upper: *hi,
                });
            }
            if !(hi - lo).is_finite() {
                return Err(ConfigError::SpanOverflow {
                    index,
                    lower: *lo,
                    upper: *hi,
                });
            }
        }
        Ok(Self { lower, upper })
    }

    /// `[0, 1]^dimensions`.
    pub fn unit_cube(dimensions: usize) -> Result<Self, ConfigError> {
        Self::new(vec![0.0; dimensions], vec![1.0; dimensions])
    }

    pub fn dimensions(&self) -> usize {
        self.lower.len()
    }

    pub fn lower(&self) -> &[f64] {
        &self.lower
    }

    pub fn upper(&self) -> &[f64] {
        &self.upper
    }

    pub fn contains(&self, point: &[f64]) -> bool {
        point.len() == self.dimensions()
            && point
                .iter()
                .zip(self.lower.iter().zip(&self.upper))
                .all(|(x, (lo, hi))| lo <= x && x <= hi)
    }
}

/// Optimizer parameters.
///
/// Handed to the optimizer untouched; the bridge never interprets them. The
/// named fields mirror the options the optimizer library understands, `extra`
/// carries anything else through verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub n_iterations: usize,
    pub n_inner_iterations: usize,
    pub n_init_samples: usize,
    /// Iterations between hyperparameter relearning, 0 disables it.
    pub n_iter_relearn: usize,
    pub init_method: u32,
    /// `None` seeds from entropy.
    pub random_seed: Option<u64>,
    pub verbose_level: u32,
    pub noise: f64,
    #[serde(rename = "s_name")]
    pub surrogate: String,
    /// May be composite, e.g. `cHedge(cEI,cLCB,cExpReturn)`.
    #[serde(rename = "c_name")]
    pub criterion: String,
    #[serde(rename = "k_name")]
    pub kernel: String,
    #[serde(rename = "m_name")]
    pub mean: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            n_iterations: 300,
            n_inner_iterations: 500,
            n_init_samples: 30,
            n_iter_relearn: 0,
            init_method: 1,
            random_seed: None,
            verbose_level: 1,
            noise: 1e-4,
            surrogate: "sGaussianProcess".to_string(),
            criterion: "cEI".to_string(),
            kernel: "kMaternISO3".to_string(),
            mean: "mConst".to_string(),
            extra: BTreeMap::new(),
        }
    }
}

impl OptimizerConfig {
    pub fn builder() -> OptimizerConfigBuilder {
        OptimizerConfigBuilder::default()
    }

    /// Build from an untyped option map. Omitted keys take their defaults,
    /// unknown keys land in `extra`.
    pub fn from_params(params: serde_json::Value) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_value(params).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n_inner_iterations == 0 {
            return Err(ConfigError::field("n_inner_iterations", "must be positive"));
        }
        if !self.noise.is_finite() || self.noise < 0.0 {
            return Err(ConfigError::field(
                "noise",
                format!("must be finite and non-negative, got {}", self.noise),
            ));
        }
        for (field, name) in [
            ("s_name", &self.surrogate),
            ("k_name", &self.kernel),
            ("m_name", &self.mean),
        ] {
            if name.trim().is_empty() {
                return Err(ConfigError::field(field, "must not be empty"));
            }
        }
        check_criterion(&self.criterion)
    }

    /// Total number of objective evaluations the optimizer is budgeted for.
    pub fn evaluation_budget(&self) -> usize {
        self.n_init_samples + self.n_iterations
    }
}

fn check_criterion(criterion: &str) -> Result<(), ConfigError> {
    if criterion.trim().is_empty() {
        return Err(ConfigError::field("c_name", "must not be empty"));
    }
    let mut depth = 0usize;
    for ch in criterion.chars() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| ConfigError::field("c_name", "unbalanced ')'"))?;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(ConfigError::field("c_name", "unbalanced '('"));
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct OptimizerConfigBuilder {
    config: OptimizerConfig,
}

impl OptimizerConfigBuilder {
    pub fn n_iterations(mut self, n: usize) -> Self {
        self.config.n_iterations = n;
        self
    }

    pub fn n_init_samples(mut self, n: usize) -> Self {
        self.config.n_init_samples = n;
        self
    }

    pub fn n_inner_iterations(mut self, n: usize) -> Self {
        self.config.n_inner_iterations = n;
        self
    }

    pub fn random_seed(mut self, seed: u64) -> Self {
        self.config.random_seed = Some(seed);
        self
    }

    pub fn n_iter_relearn(mut self, n: usize) -> Self {
        self.config.n_iter_relearn = n;
        self
    }

    pub fn init_method(mut self, method: u32) -> Self {
        self.config.init_method = method;
        self
    }

    pub fn verbose_level(mut self, level: u32) -> Self {
        self.config.verbose_level = level;
        self
    }

    pub fn noise(mut self, noise: f64) -> Self {
        self.config.noise = noise;
        self
    }

    pub fn surrogate(mut self, name: impl Into<String>) -> Self {
        self.config.surrogate = name.into();
        self
    }

    pub fn criterion(mut self, name: impl Into<String>) -> Self {
        self.config.criterion = name.into();
        self
    }

    pub fn kernel(mut self, name: impl Into<String>) -> Self {
        self.config.kernel = name.into();
        self
    }

    pub fn mean(mut self, name: impl Into<String>) -> Self {
        self.config.mean = name.into();
        self
    }

    pub fn extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.config.extra.insert(key.into(), value);
        self
    }

    pub fn build(self) -> Result<OptimizerConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// What the driver does when the worker reports an objective failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ObjectiveFailurePolicy {
    /// Stop the optimizer and report the failure in the run status.
    #[default]
    Abort,
    /// Re-send the same point, up to `max_attempts` tries in total.
    Retry { max_attempts: u32 },
}

impl ObjectiveFailurePolicy {
    pub fn max_attempts(&self) -> u32 {
        match self {
            Self::Abort => 1,
            Self::Retry { max_attempts } => *max_attempts,
        }
    }
}

pub const ENV_RESPONSE_TIMEOUT_MS: &str = "EVALBRIDGE_RESPONSE_TIMEOUT_MS";
pub const ENV_SETUP_TIMEOUT_MS: &str = "EVALBRIDGE_SETUP_TIMEOUT_MS";
pub const ENV_SHUTDOWN_TIMEOUT_MS: &str = "EVALBRIDGE_SHUTDOWN_TIMEOUT_MS";

/// Tuning for the driver side of the bridge.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    /// How long the stub waits for each evaluation. `None` blocks until the
    /// worker answers or the channel closes.
    pub response_timeout: Option<Duration>,
    /// Bound on the init/ready handshake.
    pub setup_timeout: Duration,
    /// How long to wait for the worker to exit after the termination signal
    /// before it is signalled and killed.
    pub shutdown_timeout: Duration,
    pub failure_policy: ObjectiveFailurePolicy,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            response_timeout: None,
            setup_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(10),
            failure_policy: ObjectiveFailurePolicy::Abort,
        }
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = Some(timeout);
        self
    }

    pub fn with_setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_failure_policy(mut self, policy: ObjectiveFailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Defaults overridden by `EVALBRIDGE_*_MS` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(ms) = parse_millis(ENV_RESPONSE_TIMEOUT_MS, &lookup)? {
            config.response_timeout = Some(ms);
        }
        if let Some(ms) = parse_millis(ENV_SETUP_TIMEOUT_MS, &lookup)? {
            config.setup_timeout = ms;
        }
        if let Some(ms) = parse_millis(ENV_SHUTDOWN_TIMEOUT_MS, &lookup)? {
            config.shutdown_timeout = ms;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.response_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::field("response_timeout", "must be non-zero"));
        }
        if self.setup_timeout.is_zero() {
            return Err(ConfigError::field("setup_timeout", "must be non-zero"));
        }
        if self.failure_policy.max_attempts() == 0 {
            return Err(ConfigError::field(
                "failure_policy",
                "retry needs at least one attempt",
            ));
        }
        Ok(())
    }
}

fn parse_millis(
    var: &'static str,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<Option<Duration>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|e| ConfigError::Env {
                var,
                reason: format!("{raw:?}: {e}"),
            }),
    }
}
