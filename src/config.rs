use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use thiserror::Error;

pub const DECLINE_THRESHOLD: f64 = 0.10;
pub const INACTIVITY_DAYS: i64 = 30;
pub const TEAM_NORM_SD: f64 = 2.0;
pub const ASYMMETRY_THRESHOLD: f64 = 0.10;
pub const MAX_INACTIVITY_DAYS: i64 = 36_500;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero (got {value})")]
    NotPositive { field: &'static str, value: f64 },

    #[error("{field} must be at least {min} (got {value})")]
    TooSmall {
        field: &'static str,
        min: usize,
        value: usize,
    },

    #[error("{field} must be at most {max} (got {value})")]
    TooLarge {
        field: &'static str,
        max: i64,
        value: i64,
    },

    #[error("bilateral pair {left}/{right} names the same metric twice")]
    DegeneratePair { left: String, right: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BilateralPair {
    pub left: String,
    pub right: String,
}

impl BilateralPair {
    pub fn new(left: &str, right: &str) -> Self {
        Self {
            left: left.to_string(),
            right: right.to_string(),
        }
    }

    pub fn label(&self) -> String {
        format!("{}/{}", self.left, self.right)
    }
}

/// Thresholds and windows for the flag rules. Every field falls back to its
/// default when absent from the TOML file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FlagConfig {
    pub inactivity_days: i64,
    pub decline_threshold: f64,
    pub recent_sessions: usize,
    pub baseline_sessions: usize,
    pub team_norm_sd: f64,
    pub min_team_size: usize,
    pub asymmetry_threshold: f64,
    pub min_measurements: usize,
    /// Metrics to evaluate. Empty means every metric in the input.
    pub selected_metrics: Vec<String>,
    /// Metrics where a smaller value is the better result, e.g. sprint time.
    pub lower_is_better: Vec<String>,
    pub bilateral_pairs: Vec<BilateralPair>,
}

impl Default for FlagConfig {
    fn default() -> Self {
        Self {
            inactivity_days: INACTIVITY_DAYS,
            decline_threshold: DECLINE_THRESHOLD,
            recent_sessions: 1,
            baseline_sessions: 3,
            team_norm_sd: TEAM_NORM_SD,
            min_team_size: 3,
            asymmetry_threshold: ASYMMETRY_THRESHOLD,
            min_measurements: 5,
            selected_metrics: [
                "Jump Height(m)",
                "Peak Propulsive Power(W)",
                "distance_total",
                "accel_load_accum",
                "leftMaxForce",
                "rightMaxForce",
                "MaxForce_left",
                "MaxForce_right",
            ]
            .iter()
            .map(|m| m.to_string())
            .collect(),
            lower_is_better: Vec::new(),
            bilateral_pairs: vec![
                BilateralPair::new("leftMaxForce", "rightMaxForce"),
                BilateralPair::new("MaxForce_left", "MaxForce_right"),
            ],
        }
    }
}

impl FlagConfig {
    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let config: FlagConfig = toml::from_str(contents).context("invalid flag config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml_str(&contents)
    }

    /// Reads `path`, then `FLAG_CONFIG`, else the built-in defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }
        match std::env::var("FLAG_CONFIG") {
            Ok(path) if !path.trim().is_empty() => Self::from_file(Path::new(&path)),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("decline_threshold", self.decline_threshold),
            ("team_norm_sd", self.team_norm_sd),
            ("asymmetry_threshold", self.asymmetry_threshold),
            ("inactivity_days", self.inactivity_days as f64),
        ] {
            if !(value > 0.0) {
                return Err(ConfigError::NotPositive { field, value });
            }
        }

        if self.inactivity_days > MAX_INACTIVITY_DAYS {
            return Err(ConfigError::TooLarge {
                field: "inactivity_days",
                max: MAX_INACTIVITY_DAYS,
                value: self.inactivity_days,
            });
        }

        for (field, min, value) in [
            ("recent_sessions", 1, self.recent_sessions),
            ("baseline_sessions", 1, self.baseline_sessions),
            ("min_team_size", 2, self.min_team_size),
            ("min_measurements", 1, self.min_measurements),
        ] {
            if value < min {
                return Err(ConfigError::TooSmall { field, min, value });
            }
        }

        if let Some(pair) = self.bilateral_pairs.iter().find(|p| p.left == p.right) {
            return Err(ConfigError::DegeneratePair {
                left: pair.left.clone(),
                right: pair.right.clone(),
            });
        }

        Ok(())
    }

    pub fn is_selected(&self, metric: &str) -> bool {
        self.selected_metrics.is_empty() || self.selected_metrics.iter().any(|m| m == metric)
    }

    pub fn is_lower_better(&self, metric: &str) -> bool {
        self.lower_is_better.iter().any(|m| m == metric)
    }

    /// The configured pair naming `metric`, and whether it is the left half.
    pub fn pair_for(&self, metric: &str) -> Option<(&BilateralPair, crate::models::Side)> {
        self.bilateral_pairs.iter().find_map(|pair| {
            if pair.left == metric {
                Some((pair, crate::models::Side::Left))
            } else if pair.right == metric {
                Some((pair, crate::models::Side::Right))
            } else {
                None
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Side;

    #[test]
    fn defaults_are_valid() {
        let config = FlagConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.inactivity_days, 30);
        assert_eq!(config.team_norm_sd, 2.0);
    }

    #[test]
    fn toml_overrides_merge_over_defaults() {
        let config = FlagConfig::from_toml_str(
            r#"
            decline_threshold = 0.2
            lower_is_better = ["sprint_time_10m"]
            selected_metrics = []
            "#,
        )
        .unwrap();

        assert_eq!(config.decline_threshold, 0.2);
        assert_eq!(config.inactivity_days, 30);
        assert!(config.is_lower_better("sprint_time_10m"));
        assert!(config.is_selected("anything"));
        assert_eq!(config.bilateral_pairs.len(), 2);
    }

    #[test]
    fn example_file_parses() {
        let config = FlagConfig::from_toml_str(include_str!("../flags.example.toml")).unwrap();
        assert_eq!(config.bilateral_pairs, vec![BilateralPair::new("leftMaxForce", "rightMaxForce")]);
        assert_eq!(config.selected_metrics.len(), 6);
    }

    #[test]
    fn rejects_invalid_values() {
        let err = FlagConfig {
            min_team_size: 1,
            ..FlagConfig::default()
        }
        .validate()
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::TooSmall {
                field: "min_team_size",
                min: 2,
                value: 1
            }
        );

        let err = FlagConfig {
            decline_threshold: 0.0,
            ..FlagConfig::default()
        }
        .validate()
        .unwrap_err();
        assert!(matches!(err, ConfigError::NotPositive { field: "decline_threshold", .. }));

        assert!(FlagConfig::from_toml_str("recent_sessions = 0").is_err());
    }

    #[test]
    fn rejects_inactivity_span_beyond_limit() {
        let err = FlagConfig::from_toml_str("inactivity_days = 200000000000000").unwrap_err();
        assert!(format!("{err:#}").contains("inactivity_days must be at most 36500"));

        let config = FlagConfig {
            inactivity_days: MAX_INACTIVITY_DAYS,
            ..FlagConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_pair_with_same_metric() {
        let config = FlagConfig {
            bilateral_pairs: vec![BilateralPair::new("force", "force")],
            ..FlagConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DegeneratePair { .. })
        ));
    }

    #[test]
    fn finds_pair_side_for_metric() {
        let config = FlagConfig::default();
        let (pair, side) = config.pair_for("rightMaxForce").unwrap();
        assert_eq!(pair.label(), "leftMaxForce/rightMaxForce");
        assert_eq!(side, Side::Right);
        assert!(config.pair_for("distance_total").is_none());
    }
}
