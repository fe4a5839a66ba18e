use super::window::ReadingWindow;
use super::{Estimate, FireProbability};
use crate::error::ScoringError;
use crate::reading::Reading;

/// Highest ambient temperature expected on site plus a 3 °C margin.
pub const TEMPERATURE_THRESHOLD_C: f64 = 40.0;
pub const AIR_QUALITY_THRESHOLD_PPM: f64 = 450.0;
pub const AIR_QUALITY_MIN_HITS: usize = 10;
pub const MIN_CORRELATION_SAMPLES: usize = 25;
/// Temperature/humidity correlation observed during a reference burn.
pub const REFERENCE_R_VALUE: f64 = -0.62;

/// Scores a single reading. Implementations must be pure: the same reading
/// and history always yield the same estimate.
pub trait ProbabilityEstimator: Send + Sync {
    fn name(&self) -> &'static str;

    fn estimate(
        &self,
        reading: &Reading,
        history: &ReadingWindow,
    ) -> Result<Estimate, ScoringError>;
}

fn flame_signal(reading: &Reading) -> f64 {
    match reading.flame_present {
        Some(true) => 1.0,
        _ => 0.0,
    }
}

fn temperature_signal(reading: &Reading) -> f64 {
    match reading.temperature {
        Some(temp) if temp > TEMPERATURE_THRESHOLD_C => 1.0,
        _ => 0.0,
    }
}

/// Hot-sensor and flame-sensor vote; ignores history.
#[derive(Debug, Clone)]
pub struct ThresholdEstimator {
    pub flame_weight: f64,
    pub temperature_weight: f64,
}

impl Default for ThresholdEstimator {
    fn default() -> Self {
        Self {
            flame_weight: 0.6,
            temperature_weight: 0.4,
        }
    }
}

impl ProbabilityEstimator for ThresholdEstimator {
    fn name(&self) -> &'static str {
        "threshold"
    }

    fn estimate(
        &self,
        reading: &Reading,
        _history: &ReadingWindow,
    ) -> Result<Estimate, ScoringError> {
        let raw = self.flame_weight * flame_signal(reading)
            + self.temperature_weight * temperature_signal(reading);
        Ok(Estimate {
            probability: FireProbability::new(raw)?,
            r_value: None,
        })
    }
}

/// Blends flame, temperature, sustained air quality and the
/// temperature/humidity correlation over the node's recent history.
#[derive(Debug, Clone, Default)]
pub struct WeightedEstimator;

impl WeightedEstimator {
    const FLAME_WEIGHT: f64 = 0.3;
    const AIR_WEIGHT: f64 = 0.3;
    const TEMP_HUMIDITY_WEIGHT: f64 = 0.2;
    const TEMPERATURE_WEIGHT: f64 = 0.2;
}

fn air_quality_signal(history: &ReadingWindow) -> f64 {
    if history.count_air_quality_above(AIR_QUALITY_THRESHOLD_PPM) >= AIR_QUALITY_MIN_HITS {
        1.0
    } else {
        0.0
    }
}

fn temp_humidity_signal(r_value: Option<f64>) -> f64 {
    let Some(r_value) = r_value else {
        return 0.0;
    };
    (r_value / REFERENCE_R_VALUE).clamp(0.0, 1.0)
}

/// Pearson correlation; `None` below the sample floor, 0 for a flat series.
pub fn correlation(xs: &[f64], ys: &[f64]) -> Option<f64> {
    let n = xs.len().min(ys.len());
    if n < MIN_CORRELATION_SAMPLES {
        return None;
    }
    let (xs, ys) = (&xs[..n], &ys[..n]);
    let mean_x = xs.iter().sum::<f64>() / n as f64;
    let mean_y = ys.iter().sum::<f64>() / n as f64;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        let dx = x - mean_x;
        let dy = y - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    if var_x <= f64::EPSILON || var_y <= f64::EPSILON {
        return Some(0.0);
    }
    Some(cov / (var_x.sqrt() * var_y.sqrt()))
}

impl ProbabilityEstimator for WeightedEstimator {
    fn name(&self) -> &'static str {
        "weighted"
    }

    fn estimate(
        &self,
        reading: &Reading,
        history: &ReadingWindow,
    ) -> Result<Estimate, ScoringError> {
        let (temps, humidities) = history.paired_temperature_humidity();
        let r_value = correlation(&temps, &humidities);

        let raw = Self::FLAME_WEIGHT * flame_signal(reading)
            + Self::AIR_WEIGHT * air_quality_signal(history)
            + Self::TEMP_HUMIDITY_WEIGHT * temp_humidity_signal(r_value)
            + Self::TEMPERATURE_WEIGHT * temperature_signal(reading);

        Ok(Estimate {
            probability: FireProbability::new(raw)?,
            r_value,
        })
    }
}
