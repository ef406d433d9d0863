//! Predictor configuration
//!
//! Every tunable constant lives here and is handed to constructors. All
//! sections default, so a partial JSON file only overrides what it names.

use crate::error::PredictError;
use crate::extractors::{usage_decay, vocabulary};
use crate::filters::{popularity, recency};
use crate::ranker;
use crate::slot_store::MAX_CAPACITY;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Longest accepted usage window, one week
pub const MAX_USAGE_WINDOW_MINUTES: i64 = 7 * 24 * 60;

/// Longest accepted "just connected" headset window, one day
pub const MAX_HEADSET_RECENT_SECONDS: i64 = 24 * 60 * 60;

/// Longest accepted recency promotion window, thirty days
pub const MAX_RECENCY_WINDOW_HOURS: i64 = 30 * 24;

/// Largest accepted recency queue
pub const MAX_RECENCY_CAPACITY: usize = 1024;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictorConfig {
    /// Number of predictions shown
    pub max_predictions: usize,
    /// Events fetched from the event log per pass
    pub history_limit: usize,
    pub usage_decay: UsageDecayConfig,
    pub headset: HeadsetConfig,
    pub geo: GeoConfig,
    pub places: PlaceConfig,
    pub ranker: RankerConfig,
    pub recency: RecencyConfig,
    pub popularity: PopularityConfig,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            max_predictions: 5,
            history_limit: 100,
            usage_decay: UsageDecayConfig::default(),
            headset: HeadsetConfig::default(),
            geo: GeoConfig::default(),
            places: PlaceConfig::default(),
            ranker: RankerConfig::default(),
            recency: RecencyConfig::default(),
            popularity: PopularityConfig::default(),
        }
    }
}

/// Recently-used-app extractor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageDecayConfig {
    pub capacity: usize,
    pub window_minutes: i64,
    pub max_distinct: usize,
}

impl Default for UsageDecayConfig {
    fn default() -> Self {
        Self {
            capacity: usage_decay::DEFAULT_CAPACITY,
            window_minutes: usage_decay::DEFAULT_WINDOW_MINUTES,
            max_distinct: usage_decay::DEFAULT_MAX_DISTINCT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadsetConfig {
    /// How long after connecting a headset counts as "just connected"
    pub recent_seconds: i64,
}

impl Default for HeadsetConfig {
    fn default() -> Self {
        Self {
            recent_seconds: vocabulary::DEFAULT_HEADSET_RECENT_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoConfig {
    pub enabled: bool,
    pub cell_degrees: f64,
    pub buckets: usize,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cell_degrees: vocabulary::DEFAULT_GEO_CELL_DEGREES,
            buckets: vocabulary::DEFAULT_GEO_BUCKETS,
        }
    }
}

/// Known place identifiers; unknown places share one "other" slot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaceConfig {
    pub vocabulary: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankerConfig {
    pub prior_weight: f32,
    pub max_apps: usize,
}

impl Default for RankerConfig {
    fn default() -> Self {
        Self {
            prior_weight: ranker::DEFAULT_PRIOR_WEIGHT,
            max_apps: ranker::DEFAULT_MAX_APPS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecencyConfig {
    pub capacity: usize,
    pub window_hours: i64,
    pub max_promotions: usize,
}

impl Default for RecencyConfig {
    fn default() -> Self {
        Self {
            capacity: recency::DEFAULT_CAPACITY,
            window_hours: recency::DEFAULT_WINDOW_HOURS,
            max_promotions: recency::DEFAULT_MAX_PROMOTIONS,
        }
    }
}

/// Backfill list for devices without enough history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PopularityConfig {
    /// Package names in priority order
    pub packages: Vec<String>,
    pub score_step: f32,
}

impl Default for PopularityConfig {
    fn default() -> Self {
        Self {
            packages: [
                "com.google.android.dialer",
                "com.google.android.apps.messaging",
                "com.android.chrome",
                "com.google.android.GoogleCamera",
                "com.google.android.gm",
                "com.google.android.apps.maps",
                "com.google.android.apps.photos",
                "com.google.android.youtube",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            score_step: popularity::DEFAULT_SCORE_STEP,
        }
    }
}

impl PredictorConfig {
    pub fn from_json(json: &str) -> Result<Self, PredictError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PredictError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String, PredictError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject settings that would make a component degenerate or overflow
    /// the duration and capacity ranges the engine builds from them
    pub fn validate(&self) -> Result<(), PredictError> {
        let usage = &self.usage_decay;
        let checks = [
            (self.max_predictions == 0, "max_predictions must be positive"),
            (self.history_limit == 0, "history_limit must be positive"),
            (
                usage.capacity == 0 || usage.capacity > MAX_CAPACITY,
                "usage_decay.capacity must be between 1 and 65536",
            ),
            (
                usage.window_minutes <= 0 || usage.window_minutes > MAX_USAGE_WINDOW_MINUTES,
                "usage_decay.window_minutes must be between 1 and one week",
            ),
            (
                usage.max_distinct == 0 || usage.max_distinct > MAX_CAPACITY,
                "usage_decay.max_distinct must be between 1 and 65536",
            ),
            (
                !(0..=MAX_HEADSET_RECENT_SECONDS).contains(&self.headset.recent_seconds),
                "headset.recent_seconds must be between 0 and one day",
            ),
            (
                self.geo.enabled
                    && (self.geo.buckets == 0
                        || self.geo.buckets > vocabulary::MAX_GEO_BUCKETS
                        || !(self.geo.cell_degrees > 0.0)
                        || !self.geo.cell_degrees.is_finite()),
                "geo needs 1 to 4096 buckets and a positive finite cell_degrees",
            ),
            (
                self.ranker.max_apps == 0 || self.ranker.max_apps > MAX_CAPACITY,
                "ranker.max_apps must be between 1 and 65536",
            ),
            (
                self.recency.capacity == 0 || self.recency.capacity > MAX_RECENCY_CAPACITY,
                "recency.capacity must be between 1 and 1024",
            ),
            (
                self.recency.window_hours <= 0 || self.recency.window_hours > MAX_RECENCY_WINDOW_HOURS,
                "recency.window_hours must be between 1 and thirty days",
            ),
            (
                !(self.popularity.score_step > 0.0)
                    || !self.popularity.score_step.is_finite()
                    || !self.ranker.prior_weight.is_finite(),
                "popularity.score_step must be positive and ranker.prior_weight finite",
            ),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, message)) => Err(PredictError::InvalidConfig(message.to_string())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_validate() {
        let config = PredictorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.usage_decay.capacity, 200);
        assert_eq!(config.usage_decay.window_minutes, 10);
        assert_eq!(config.recency.capacity, 10);
        assert_eq!(config.recency.window_hours, 6);
        assert_eq!(config.recency.max_promotions, 1);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = PredictorConfig::from_json(
            r#"{"max_predictions": 3, "usage_decay": {"capacity": 50}, "places": {"vocabulary": ["home"]}}"#,
        )
        .unwrap();
        assert_eq!(config.max_predictions, 3);
        assert_eq!(config.usage_decay.capacity, 50);
        assert_eq!(config.usage_decay.max_distinct, 2);
        assert_eq!(config.places.vocabulary, vec!["home".to_string()]);
        assert_eq!(config.history_limit, 100);
    }

    #[test]
    fn test_invalid_values_rejected() {
        for json in [
            r#"{"max_predictions": 0}"#,
            r#"{"usage_decay": {"window_minutes": 0}}"#,
            r#"{"geo": {"buckets": 0}}"#,
            r#"{"recency": {"capacity": 0}}"#,
            r#"{"usage_decay": {"window_minutes": 9223372036854775807}}"#,
            r#"{"usage_decay": {"capacity": 4294967295}}"#,
            r#"{"headset": {"recent_seconds": 9223372036854775807}}"#,
            r#"{"recency": {"window_hours": 9223372036854775807}}"#,
            r#"{"recency": {"capacity": 1000000}}"#,
            r#"{"geo": {"buckets": 1000000}}"#,
        ] {
            assert!(
                matches!(PredictorConfig::from_json(json), Err(PredictError::InvalidConfig(_))),
                "accepted {json}"
            );
        }
        // geo settings are ignored when the extractor is disabled
        assert!(PredictorConfig::from_json(r#"{"geo": {"enabled": false, "buckets": 0}}"#).is_ok());
    }

    #[test]
    fn test_json_round_trip() {
        let config = PredictorConfig::default();
        let restored = PredictorConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(restored, config);
    }
}
