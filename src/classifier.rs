//! Performance classification against DORA benchmark bands.
//!
//! Bands are configuration: [`ThresholdConfig::default`] carries the
//! published DORA bands, and a JSON file can override any subset of them.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::model::{MetricWindow, PerformanceClassification, PerformanceTier};

/// Bands for a metric where larger values are better.
///
/// A value `>= elite` is elite, `>= high` is high, `>= medium` is medium,
/// anything else is low.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FloorBands {
    pub elite: f64,
    pub high: f64,
    pub medium: f64,
}

impl FloorBands {
    pub fn tier(&self, value: f64) -> PerformanceTier {
        if value >= self.elite {
            PerformanceTier::Elite
        } else if value >= self.high {
            PerformanceTier::High
        } else if value >= self.medium {
            PerformanceTier::Medium
        } else {
            PerformanceTier::Low
        }
    }

    fn validate(&self, metric: &str) -> Result<(), ConfigError> {
        if !(self.elite >= self.high && self.high >= self.medium && self.medium >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "{metric} bands must satisfy elite >= high >= medium >= 0"
            )));
        }
        Ok(())
    }
}

/// Bands for a metric where smaller values are better.
///
/// A value `<= elite` is elite, `<= high` is high, `<= medium` is medium,
/// anything else is low.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CeilingBands {
    pub elite: f64,
    pub high: f64,
    pub medium: f64,
}

impl CeilingBands {
    pub fn tier(&self, value: f64) -> PerformanceTier {
        if value <= self.elite {
            PerformanceTier::Elite
        } else if value <= self.high {
            PerformanceTier::High
        } else if value <= self.medium {
            PerformanceTier::Medium
        } else {
            PerformanceTier::Low
        }
    }

    fn validate(&self, metric: &str) -> Result<(), ConfigError> {
        if !(0.0 <= self.elite && self.elite <= self.high && self.high <= self.medium) {
            return Err(ConfigError::Invalid(format!(
                "{metric} bands must satisfy 0 <= elite <= high <= medium"
            )));
        }
        Ok(())
    }
}

/// Threshold table for all four metrics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    /// Deployments per day.
    pub deployment_frequency: FloorBands,
    pub lead_time_hours: CeilingBands,
    pub mttr_hours: CeilingBands,
    /// Ratio in `[0, 1]`.
    pub change_failure_rate: CeilingBands,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            // daily / weekly / monthly
            deployment_frequency: FloorBands {
                elite: 1.0,
                high: 0.14,
                medium: 0.033,
            },
            // a day / a week / a month
            lead_time_hours: CeilingBands {
                elite: 24.0,
                high: 168.0,
                medium: 720.0,
            },
            // an hour / a day / a week
            mttr_hours: CeilingBands {
                elite: 1.0,
                high: 24.0,
                medium: 168.0,
            },
            change_failure_rate: CeilingBands {
                elite: 0.15,
                high: 0.20,
                medium: 0.30,
            },
        }
    }
}

impl ThresholdConfig {
    /// Parse a (possibly partial) JSON threshold table and validate it.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.deployment_frequency.validate("deployment_frequency")?;
        self.lead_time_hours.validate("lead_time_hours")?;
        self.mttr_hours.validate("mttr_hours")?;
        self.change_failure_rate.validate("change_failure_rate")?;
        if self.change_failure_rate.medium > 1.0 {
            return Err(ConfigError::Invalid(
                "change_failure_rate bands must lie within [0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

/// Stateless classifier over a fixed threshold table.
#[derive(Debug, Clone, Copy, Default)]
pub struct Classifier {
    thresholds: ThresholdConfig,
}

impl Classifier {
    pub fn new(thresholds: ThresholdConfig) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &ThresholdConfig {
        &self.thresholds
    }

    pub fn deployment_frequency(&self, per_day: f64) -> PerformanceTier {
        self.thresholds.deployment_frequency.tier(per_day)
    }

    pub fn lead_time(&self, lead_time: Duration) -> PerformanceTier {
        self.thresholds.lead_time_hours.tier(hours(lead_time))
    }

    pub fn mttr(&self, mttr: Duration) -> PerformanceTier {
        self.thresholds.mttr_hours.tier(hours(mttr))
    }

    pub fn change_failure_rate(&self, rate: f64) -> PerformanceTier {
        self.thresholds.change_failure_rate.tier(rate)
    }

    /// Classify every metric of a window. `overall` is the worst tier, so a
    /// single regressed metric is never masked by healthy ones.
    pub fn classify(&self, window: &MetricWindow) -> PerformanceClassification {
        let summary = &window.summary;
        let deployment_frequency = self.deployment_frequency(summary.deployment_frequency);
        let lead_time = self.lead_time(summary.lead_time);
        let mttr = self.mttr(summary.mttr);
        let change_failure_rate = self.change_failure_rate(summary.change_failure_rate);

        let overall = deployment_frequency
            .min(lead_time)
            .min(mttr)
            .min(change_failure_rate);

        PerformanceClassification {
            deployment_frequency,
            lead_time,
            mttr,
            change_failure_rate,
            overall,
        }
    }
}

fn hours(d: Duration) -> f64 {
    d.num_milliseconds() as f64 / 3_600_000.0
}
