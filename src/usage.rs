//! Discharge current histograms.
//!
//! Packs count the seconds spent discharging in fixed width current buckets starting at 0A, with
//! the last bucket open ended. This module turns those counters into time shares, energy and a
//! stress classification.

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter};

/// How hard a pack has been worked.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumIter, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StressLevel {
    Easy,
    Moderate,
    Hard,
    Extreme,
}

/// Lower current bounds, in amps, of each stress level above [StressLevel::Easy].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StressThresholds {
    pub moderate_a: f64,
    pub hard_a: f64,
    pub extreme_a: f64,
}

impl Default for StressThresholds {
    fn default() -> Self {
        Self {
            moderate_a: 50.0,
            hard_a: 125.0,
            extreme_a: 200.0,
        }
    }
}

impl StressThresholds {
    pub fn classify(&self, current_a: f64) -> StressLevel {
        if current_a >= self.extreme_a {
            StressLevel::Extreme
        } else if current_a >= self.hard_a {
            StressLevel::Hard
        } else if current_a >= self.moderate_a {
            StressLevel::Moderate
        } else {
            StressLevel::Easy
        }
    }

    /// True when every threshold is finite and they strictly ascend.
    pub fn is_ascending(&self) -> bool {
        [self.moderate_a, self.hard_a, self.extreme_a].iter().all(|t| t.is_finite())
            && self.moderate_a < self.hard_a
            && self.hard_a < self.extreme_a
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageSettings {
    /// Amps covered by each bucket.
    pub bucket_width_a: f64,
    /// Overrides the register map's nominal pack voltage.
    pub nominal_voltage: Option<f64>,
    pub thresholds: StressThresholds,
}

impl Default for UsageSettings {
    fn default() -> Self {
        Self {
            bucket_width_a: 25.0,
            nominal_voltage: None,
            thresholds: StressThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramBucket {
    pub start_a: f64,
    /// `None` for the open ended last bucket.
    pub end_a: Option<f64>,
    pub seconds: f64,
    /// Share of total discharge time, 0 to 100.
    pub percentage: f64,
    pub energy_wh: f64,
    /// Energy of this bucket and every bucket below it.
    pub cumulative_wh: f64,
    pub stress: StressLevel,
}

impl HistogramBucket {
    /// Current used for energy estimates. The open ended bucket uses half a width above its start.
    pub fn midpoint_a(&self, width_a: f64) -> f64 {
        match self.end_a {
            Some(end) => (self.start_a + end) / 2.0,
            None => self.start_a + width_a / 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DischargeHistogram {
    pub buckets: Vec<HistogramBucket>,
    pub total_seconds: f64,
    pub total_energy_wh: f64,
    /// Time weighted mean of the bucket midpoints. 0 when nothing has been recorded.
    pub mean_current_a: f64,
    /// Class of the mean current.
    pub stress: StressLevel,
}

impl DischargeHistogram {
    /// Build a histogram from per-bucket seconds, lowest current first.
    ///
    /// Negative or non-finite counters are treated as 0.
    pub fn from_seconds(seconds: &[f64], nominal_voltage: f64, settings: &UsageSettings) -> Self {
        let width = settings.bucket_width_a;
        let voltage = settings.nominal_voltage.unwrap_or(nominal_voltage);
        let last = seconds.len().saturating_sub(1);

        let cleaned: Vec<f64> = seconds
            .iter()
            .enumerate()
            .map(|(i, s)| {
                if s.is_finite() && *s >= 0.0 {
                    *s
                } else {
                    tracing::warn!(bucket = i, value = *s, "ignoring invalid discharge counter");
                    0.0
                }
            })
            .collect();
        let total_seconds: f64 = cleaned.iter().sum();

        let mut cumulative_wh = 0.0;
        let mut weighted_current = 0.0;
        let buckets: Vec<HistogramBucket> = cleaned
            .iter()
            .enumerate()
            .map(|(i, &secs)| {
                let start_a = i as f64 * width;
                let end_a = (i != last).then_some(start_a + width);
                let mut bucket = HistogramBucket {
                    start_a,
                    end_a,
                    seconds: secs,
                    percentage: if total_seconds > 0.0 { secs / total_seconds * 100.0 } else { 0.0 },
                    energy_wh: 0.0,
                    cumulative_wh: 0.0,
                    stress: settings.thresholds.classify(start_a),
                };
                let midpoint = bucket.midpoint_a(width);
                bucket.energy_wh = midpoint * secs / 3600.0 * voltage;
                cumulative_wh += bucket.energy_wh;
                bucket.cumulative_wh = cumulative_wh;
                weighted_current += midpoint * secs;
                bucket
            })
            .collect();

        let mean_current_a = if total_seconds > 0.0 { weighted_current / total_seconds } else { 0.0 };
        let stress = if total_seconds > 0.0 {
            settings.thresholds.classify(mean_current_a)
        } else {
            StressLevel::Easy
        };

        tracing::debug!(total_seconds, total_energy_wh = cumulative_wh, %stress, "discharge histogram built");
        Self {
            buckets,
            total_seconds,
            total_energy_wh: cumulative_wh,
            mean_current_a,
            stress,
        }
    }

    /// Share of time, 0 to 100, spent at or above `level`.
    pub fn time_at_or_above(&self, level: StressLevel) -> f64 {
        self.buckets
            .iter()
            .filter(|b| b.stress >= level)
            .map(|b| b.percentage)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    fn histogram(seconds: &[f64]) -> DischargeHistogram {
        DischargeHistogram::from_seconds(seconds, 18.0, &UsageSettings::default())
    }

    #[test]
    fn buckets_are_contiguous() {
        let h = histogram(&[1.0; 8]);
        assert_eq!(h.buckets.len(), 8);
        assert_eq!(h.buckets[0].start_a, 0.0);
        for pair in h.buckets.windows(2) {
            assert_eq!(pair[0].end_a, Some(pair[1].start_a));
        }
        assert_eq!(h.buckets[7].start_a, 175.0);
        assert_eq!(h.buckets[7].end_a, None);
    }

    #[test]
    fn percentages_sum_to_100() {
        let inputs: [&[f64]; 4] = [
            &[3600.0, 1200.0, 300.0, 0.0, 0.0, 0.0, 0.0, 1.0],
            &[0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 7.0],
            &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0],
            &[1e9, 1e-3, 0.5, 12345.0, 0.0, 99.0, 1.0, 0.25],
        ];
        for seconds in inputs {
            let total: f64 = histogram(seconds).buckets.iter().map(|b| b.percentage).sum();
            assert!((total - 100.0).abs() <= 0.5, "{seconds:?} summed to {total}");
        }
    }

    #[test]
    fn zero_time_is_easy() {
        let h = histogram(&[0.0; 8]);
        assert!(h.buckets.iter().all(|b| b.percentage == 0.0));
        assert_eq!(h.total_energy_wh, 0.0);
        assert_eq!(h.stress, StressLevel::Easy);
    }

    #[test]
    fn energy_uses_midpoints() {
        // One hour at 12.5A and one hour in the open bucket (175 + 12.5A).
        let mut seconds = [0.0; 8];
        seconds[0] = 3600.0;
        seconds[7] = 3600.0;
        let h = histogram(&seconds);
        assert!((h.buckets[0].energy_wh - 12.5 * 18.0).abs() < 1e-9);
        assert!((h.buckets[7].energy_wh - 187.5 * 18.0).abs() < 1e-9);
        assert!((h.total_energy_wh - 200.0 * 18.0).abs() < 1e-9);
        assert_eq!(h.buckets[7].cumulative_wh, h.total_energy_wh);
        assert!((h.mean_current_a - 100.0).abs() < 1e-9);
        assert_eq!(h.stress, StressLevel::Moderate);
    }

    #[test]
    fn nominal_voltage_override() {
        let settings = UsageSettings {
            nominal_voltage: Some(36.0),
            ..UsageSettings::default()
        };
        let h = DischargeHistogram::from_seconds(&[3600.0], 18.0, &settings);
        // Single bucket is also the open ended one.
        assert_eq!(h.buckets[0].end_a, None);
        assert!((h.total_energy_wh - 12.5 * 36.0).abs() < 1e-9);
    }

    #[test]
    fn bucket_stress_levels() {
        let h = histogram(&[1.0; 8]);
        let levels: Vec<StressLevel> = h.buckets.iter().map(|b| b.stress).collect();
        use StressLevel::*;
        assert_eq!(levels, vec![Easy, Easy, Moderate, Moderate, Moderate, Hard, Hard, Hard]);
        assert!((h.time_at_or_above(Hard) - 37.5).abs() < 1e-9);
    }

    #[test]
    fn threshold_boundaries() {
        let t = StressThresholds::default();
        assert_eq!(t.classify(49.9), StressLevel::Easy);
        assert_eq!(t.classify(50.0), StressLevel::Moderate);
        assert_eq!(t.classify(125.0), StressLevel::Hard);
        assert_eq!(t.classify(200.0), StressLevel::Extreme);
        assert!(t.is_ascending());
        assert!(
            !StressThresholds {
                hard_a: 40.0,
                ..t
            }
            .is_ascending()
        );
    }

    #[test]
    fn invalid_counters_are_ignored() {
        let h = histogram(&[10.0, -5.0, f64::NAN, 10.0]);
        assert_eq!(h.total_seconds, 20.0);
        assert_eq!(h.buckets[1].seconds, 0.0);
        assert_eq!(h.buckets[2].percentage, 0.0);
    }

    #[test]
    fn levels_are_ordered() {
        let levels: Vec<StressLevel> = StressLevel::iter().collect();
        assert!(levels.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(StressLevel::Extreme.to_string(), "extreme");
    }
}
