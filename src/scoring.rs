mod estimator;
mod remote;
mod window;

pub use estimator::{ProbabilityEstimator, ThresholdEstimator, WeightedEstimator};
pub use remote::RemoteScorer;
pub use window::ReadingWindow;

use crate::error::ScoringError;
use std::sync::Arc;

/// Fire probability in [0, 1], derived from exactly one reading.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct FireProbability(f64);

impl FireProbability {
    pub fn new(value: f64) -> Result<Self, ScoringError> {
        if !value.is_finite() {
            return Err(ScoringError::NonFinite(value));
        }
        Ok(Self(value.clamp(0.0, 1.0)))
    }

    pub fn value(self) -> f64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
    pub probability: FireProbability,
    pub r_value: Option<f64>,
}

/// Where probabilities come from: an in-process estimator fed with the
/// node's history, or the external analytics function.
#[derive(Clone)]
pub enum Scorer {
    Local(Arc<dyn ProbabilityEstimator>),
    Remote(RemoteScorer),
}

impl Scorer {
    pub fn describe(&self) -> &'static str {
        match self {
            Scorer::Local(estimator) => estimator.name(),
            Scorer::Remote(_) => "remote",
        }
    }
}
