//! Composite health scoring.
//!
//! [score] is a pure function of [HealthMetrics]. Each sub-score is 0 to 100 and the composite is
//! their weighted sum, clamped and rounded.

use crate::{error::ConfigError, usage::StressLevel};
use serde::{Deserialize, Serialize};
use strum_macros::Display;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub capacity: f64,
    pub resistance: f64,
    pub imbalance: f64,
    pub thermal: f64,
    pub safety: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            capacity: 0.35,
            resistance: 0.25,
            imbalance: 0.15,
            thermal: 0.10,
            safety: 0.15,
        }
    }
}

impl ScoringWeights {
    const TOLERANCE: f64 = 1e-6;

    fn all(&self) -> [f64; 5] {
        [self.capacity, self.resistance, self.imbalance, self.thermal, self.safety]
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.all().iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(ConfigError::InvalidValue {
                field: "scoring.weights",
                reason: "weights must be finite and non-negative",
            });
        }
        let sum: f64 = self.all().iter().sum();
        if (sum - 1.0).abs() > Self::TOLERANCE {
            return Err(ConfigError::WeightSum(sum));
        }
        Ok(())
    }
}

/// Thermal sub-score per stress level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThermalScores {
    pub easy: f64,
    pub moderate: f64,
    pub hard: f64,
    pub extreme: f64,
}

impl Default for ThermalScores {
    fn default() -> Self {
        Self {
            easy: 100.0,
            moderate: 80.0,
            hard: 55.0,
            extreme: 30.0,
        }
    }
}

impl ThermalScores {
    pub fn for_level(&self, level: StressLevel) -> f64 {
        match level {
            StressLevel::Easy => self.easy,
            StressLevel::Moderate => self.moderate,
            StressLevel::Hard => self.hard,
            StressLevel::Extreme => self.extreme,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringSettings {
    pub weights: ScoringWeights,
    /// Resistance at which the resistance sub-score reaches 0, as a multiple of the baseline.
    pub resistance_zero_factor: f64,
    /// Points lost per mV of spread above the imbalance threshold.
    pub imbalance_penalty_per_mv: f64,
    pub thermal: ThermalScores,
    /// Points lost per recorded safety event.
    pub safety_penalty_per_event: f64,
}

impl Default for ScoringSettings {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            resistance_zero_factor: 2.5,
            imbalance_penalty_per_mv: 1.0,
            thermal: ThermalScores::default(),
            safety_penalty_per_event: 10.0,
        }
    }
}

impl ScoringSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.weights.validate()?;
        if !(self.resistance_zero_factor.is_finite() && self.resistance_zero_factor > 1.0) {
            return Err(ConfigError::InvalidValue {
                field: "scoring.resistance_zero_factor",
                reason: "must be greater than 1",
            });
        }
        if !(self.imbalance_penalty_per_mv.is_finite() && self.imbalance_penalty_per_mv >= 0.0)
            || !(self.safety_penalty_per_event.is_finite() && self.safety_penalty_per_event >= 0.0)
        {
            return Err(ConfigError::InvalidValue {
                field: "scoring",
                reason: "penalties must be finite and non-negative",
            });
        }
        Ok(())
    }
}

/// Qualitative band shared by capacity and overall health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Rating {
    Critical,
    Poor,
    Fair,
    Good,
    Excellent,
}

impl Rating {
    pub fn from_capacity(percentage: f64) -> Self {
        match percentage {
            p if p >= 80.0 => Rating::Excellent,
            p if p >= 70.0 => Rating::Good,
            p if p >= 60.0 => Rating::Fair,
            p if p >= 50.0 => Rating::Poor,
            _ => Rating::Critical,
        }
    }

    pub fn from_health_score(score: u8) -> Self {
        match score {
            90.. => Rating::Excellent,
            75..=89 => Rating::Good,
            60..=74 => Rating::Fair,
            40..=59 => Rating::Poor,
            _ => Rating::Critical,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SafetyStatus {
    Safe,
    Monitor,
    Warning,
    Critical,
}

/// Safety event counts by severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SafetyEvents {
    pub high: u32,
    pub low: u32,
}

impl SafetyEvents {
    pub fn total(&self) -> u32 {
        self.high.saturating_add(self.low)
    }
}

impl SafetyStatus {
    pub fn assess(events: SafetyEvents, critical_flag: bool) -> Self {
        if critical_flag || events.high >= 2 {
            SafetyStatus::Critical
        } else if events.high >= 1 || events.total() > 2 {
            SafetyStatus::Warning
        } else if events.total() > 0 {
            SafetyStatus::Monitor
        } else {
            SafetyStatus::Safe
        }
    }
}

/// Everything scoring needs, already extracted from a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthMetrics {
    /// Present capacity relative to new, in percent.
    pub capacity_percentage: Option<f64>,
    pub internal_resistance_mohm: Option<f64>,
    pub resistance_baseline_mohm: f64,
    pub cell_spread_mv: Option<f64>,
    pub imbalance_threshold_mv: f64,
    pub stress: StressLevel,
    pub safety_events: SafetyEvents,
    /// Names of set protection flags marked critical.
    pub critical_flags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SubScores {
    pub capacity: f64,
    pub resistance: f64,
    pub imbalance: f64,
    pub thermal: f64,
    pub safety: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthScore {
    /// 0 to 100.
    pub score: u8,
    pub sub_scores: SubScores,
    pub rating: Rating,
    pub capacity_rating: Rating,
    pub safety_status: SafetyStatus,
}

fn clamp_score(value: f64) -> f64 {
    if value.is_nan() { 0.0 } else { value.clamp(0.0, 100.0) }
}

/// 100 at or below baseline, falling linearly to 0 at `zero_factor` times baseline.
pub fn resistance_score(resistance_mohm: Option<f64>, baseline_mohm: f64, zero_factor: f64) -> f64 {
    let Some(resistance) = resistance_mohm else {
        return 100.0;
    };
    if baseline_mohm <= 0.0 || resistance <= baseline_mohm {
        return 100.0;
    }
    let zero_at = baseline_mohm * zero_factor;
    clamp_score(100.0 * (zero_at - resistance) / (zero_at - baseline_mohm))
}

/// Score a pack. Returns `None` when capacity is unknown.
pub fn score(metrics: &HealthMetrics, settings: &ScoringSettings) -> Option<HealthScore> {
    let Some(capacity_percentage) = metrics.capacity_percentage else {
        tracing::warn!("no capacity metric, pack cannot be scored");
        return None;
    };

    let excess_mv = metrics
        .cell_spread_mv
        .map_or(0.0, |spread| (spread - metrics.imbalance_threshold_mv).max(0.0));
    let sub_scores = SubScores {
        capacity: clamp_score(capacity_percentage),
        resistance: resistance_score(
            metrics.internal_resistance_mohm,
            metrics.resistance_baseline_mohm,
            settings.resistance_zero_factor,
        ),
        imbalance: clamp_score(100.0 - settings.imbalance_penalty_per_mv * excess_mv),
        thermal: clamp_score(settings.thermal.for_level(metrics.stress)),
        safety: clamp_score(100.0 - settings.safety_penalty_per_event * metrics.safety_events.total() as f64),
    };

    let w = &settings.weights;
    let composite = sub_scores.capacity * w.capacity
        + sub_scores.resistance * w.resistance
        + sub_scores.imbalance * w.imbalance
        + sub_scores.thermal * w.thermal
        + sub_scores.safety * w.safety;
    let score = clamp_score(composite).round() as u8;

    let result = HealthScore {
        score,
        sub_scores,
        rating: Rating::from_health_score(score),
        capacity_rating: Rating::from_capacity(capacity_percentage),
        safety_status: SafetyStatus::assess(metrics.safety_events, !metrics.critical_flags.is_empty()),
    };
    tracing::debug!(score, rating = %result.rating, safety = %result.safety_status, "pack scored");
    Some(result)
}
