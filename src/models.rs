use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn parse(value: &str) -> Option<Side> {
        match value.trim().to_ascii_lowercase().as_str() {
            "left" | "l" => Some(Side::Left),
            "right" | "r" => Some(Side::Right),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Left => "left",
            Side::Right => "right",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub athlete_id: String,
    pub team: String,
    pub metric: String,
    pub side: Option<Side>,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub data_source: Option<String>,
}

/// Time-ordered values of one metric for one athlete. Per-side rows get
/// their own series, labelled `metric (side)`; `base_metric` keeps the name.
#[derive(Debug, Clone)]
pub struct AthleteMetricSeries {
    pub athlete_id: String,
    pub team: String,
    pub metric: String,
    pub base_metric: String,
    pub points: Vec<(DateTime<Utc>, f64)>,
}

impl AthleteMetricSeries {
    pub fn latest(&self) -> Option<(DateTime<Utc>, f64)> {
        self.points.last().copied()
    }
}

/// Latest value per athlete for one (team, metric).
#[derive(Debug, Clone)]
pub struct TeamNormSet {
    pub team: String,
    pub metric: String,
    pub values: Vec<f64>,
}

impl TeamNormSet {
    pub fn mean(&self) -> Option<f64> {
        if self.values.is_empty() {
            return None;
        }
        Some(self.values.iter().sum::<f64>() / self.values.len() as f64)
    }

    /// Sample standard deviation (n - 1 denominator). `None` below two values.
    pub fn std_dev(&self) -> Option<f64> {
        let n = self.values.len();
        if n < 2 {
            return None;
        }
        let mean = self.mean()?;
        let sum_sq: f64 = self.values.iter().map(|v| (v - mean).powi(2)).sum();
        Some((sum_sq / (n - 1) as f64).sqrt())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagType {
    Inactivity,
    Decline,
    OutsideNorm,
    Asymmetry,
}

impl FlagType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlagType::Inactivity => "inactivity",
            FlagType::Decline => "decline",
            FlagType::OutsideNorm => "outside_norm",
            FlagType::Asymmetry => "asymmetry",
        }
    }
}

impl fmt::Display for FlagType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Flag {
    pub athlete_id: String,
    pub team: String,
    pub flag_type: FlagType,
    pub metric: Option<String>,
    pub metric_value: Option<String>,
    pub detected_at: DateTime<Utc>,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct FlagTypeSummary {
    pub flag_type: FlagType,
    pub count: usize,
    pub athlete_count: usize,
}

#[derive(Debug, Clone)]
pub struct TeamSufficiency {
    pub team: String,
    pub total_athletes: usize,
    pub athletes_with_min: usize,
}

impl TeamSufficiency {
    pub fn pct_with_min(&self) -> f64 {
        if self.total_athletes == 0 {
            0.0
        } else {
            self.athletes_with_min as f64 / self.total_athletes as f64 * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(values: &[f64]) -> TeamNormSet {
        TeamNormSet {
            team: "Basketball".to_string(),
            metric: "Jump Height(m)".to_string(),
            values: values.to_vec(),
        }
    }

    #[test]
    fn std_dev_uses_sample_denominator() {
        let set = norm(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert_eq!(set.mean(), Some(5.0));
        let expected = (32.0_f64 / 7.0).sqrt();
        assert!((set.std_dev().unwrap() - expected).abs() < 1e-9);
    }

    #[test]
    fn std_dev_needs_two_values() {
        assert_eq!(norm(&[]).mean(), None);
        assert_eq!(norm(&[3.0]).std_dev(), None);
    }

    #[test]
    fn side_parses_common_spellings() {
        assert_eq!(Side::parse("Left"), Some(Side::Left));
        assert_eq!(Side::parse(" r "), Some(Side::Right));
        assert_eq!(Side::parse("both"), None);
    }

    #[test]
    fn sufficiency_percentage_handles_empty_team() {
        let empty = TeamSufficiency {
            team: "Soccer".to_string(),
            total_athletes: 0,
            athletes_with_min: 0,
        };
        assert_eq!(empty.pct_with_min(), 0.0);

        let half = TeamSufficiency {
            team: "Soccer".to_string(),
            total_athletes: 4,
            athletes_with_min: 2,
        };
        assert_eq!(half.pct_with_min(), 50.0);
    }
}
