//! Candidate ranking
//!
//! Turns a feature vector into scored candidates. [`AffinityRanker`] is a
//! counter heuristic: every launch is recorded against the features active at
//! the time, and an app scores by how often it was launched overall and how
//! strongly it co-occurs with the features active now.

use crate::error::PredictError;
use crate::types::{AppIdentifier, PredictionCandidate};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::debug;

/// Default weight of the overall launch share in the score
pub const DEFAULT_PRIOR_WEIGHT: f32 = 0.2;

/// Default number of apps tracked before the least used is dropped
pub const DEFAULT_MAX_APPS: usize = 200;

/// Scores apps against a feature vector and learns from launches
pub trait Ranker: Send {
    /// Candidates sorted by descending score
    fn rank(&self, features: &[f32]) -> Vec<PredictionCandidate>;

    /// Learn that `app` was launched while `features` were active
    fn record_launch(&mut self, app: &AppIdentifier, features: &[f32], at: DateTime<Utc>);

    /// A feature slot was recycled; whatever was learned about it is stale
    fn forget_feature(&mut self, index: usize);

    /// Drop everything learned about a package in one profile
    fn forget_package(&mut self, package: &str, profile: u32) -> usize;

    fn save_state(&self) -> Result<String, PredictError>;

    fn load_state(&mut self, json: &str) -> Result<(), PredictError>;
}

/// Per-app counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppStats {
    pub launches: u64,
    /// Milliseconds since the epoch of the latest launch
    pub last_launched: i64,
    /// Launch count per active feature index
    #[serde(default)]
    pub features: BTreeMap<usize, u32>,
}

/// Launch-count and feature co-occurrence ranker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffinityRanker {
    prior_weight: f32,
    max_apps: usize,
    apps: BTreeMap<AppIdentifier, AppStats>,
}

impl Default for AffinityRanker {
    fn default() -> Self {
        Self::new(DEFAULT_PRIOR_WEIGHT, DEFAULT_MAX_APPS)
    }
}

impl AffinityRanker {
    pub fn new(prior_weight: f32, max_apps: usize) -> Self {
        Self {
            prior_weight,
            max_apps: max_apps.max(1),
            apps: BTreeMap::new(),
        }
    }

    pub fn stats(&self, app: &AppIdentifier) -> Option<&AppStats> {
        self.apps.get(app)
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }

    pub fn total_launches(&self) -> u64 {
        self.apps.values().map(|stats| stats.launches).sum()
    }

    /// Score of one app against the active feature indexes
    pub fn score(&self, app: &AppIdentifier, active: &[usize]) -> f32 {
        let Some(stats) = self.apps.get(app) else {
            return 0.0;
        };
        let total = self.total_launches();
        let prior = if total == 0 {
            0.0
        } else {
            stats.launches as f32 / total as f32
        };
        self.prior_weight * prior + self.affinity(stats, active)
    }

    fn affinity(&self, stats: &AppStats, active: &[usize]) -> f32 {
        if active.is_empty() {
            return 0.0;
        }
        let sum: f32 = active
            .iter()
            .map(|index| {
                let column = self.column_total(*index);
                if column == 0 {
                    0.0
                } else {
                    stats.features.get(index).copied().unwrap_or(0) as f32 / column as f32
                }
            })
            .sum();
        sum / active.len() as f32
    }

    fn column_total(&self, index: usize) -> u64 {
        self.apps
            .values()
            .filter_map(|stats| stats.features.get(&index))
            .map(|count| u64::from(*count))
            .sum()
    }

    fn evict_least_used(&mut self, keep: &AppIdentifier) {
        let victim = self
            .apps
            .iter()
            .filter(|(app, _)| *app != keep)
            .min_by_key(|(app, stats)| (stats.launches, stats.last_launched, (*app).clone()))
            .map(|(app, _)| app.clone());
        if let Some(victim) = victim {
            debug!(app = %victim, "dropping least used app from ranker");
            self.apps.remove(&victim);
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

fn active_indexes(features: &[f32]) -> Vec<usize> {
    features
        .iter()
        .enumerate()
        .filter(|(_, value)| **value > 0.0)
        .map(|(index, _)| index)
        .collect()
}

impl Ranker for AffinityRanker {
    fn rank(&self, features: &[f32]) -> Vec<PredictionCandidate> {
        let active = active_indexes(features);
        let mut candidates: Vec<PredictionCandidate> = self
            .apps
            .keys()
            .map(|app| PredictionCandidate::new(app.clone(), self.score(app, &active)))
            .collect();
        candidates.sort_by(|a, b| match b.score.total_cmp(&a.score) {
            Ordering::Equal => a.app.cmp(&b.app),
            other => other,
        });
        candidates
    }

    fn record_launch(&mut self, app: &AppIdentifier, features: &[f32], at: DateTime<Utc>) {
        let stats = self.apps.entry(app.clone()).or_default();
        stats.launches += 1;
        stats.last_launched = stats.last_launched.max(at.timestamp_millis());
        for index in active_indexes(features) {
            *stats.features.entry(index).or_insert(0) += 1;
        }
        if self.apps.len() > self.max_apps {
            self.evict_least_used(app);
        }
    }

    fn forget_feature(&mut self, index: usize) {
        for stats in self.apps.values_mut() {
            stats.features.remove(&index);
        }
    }

    fn forget_package(&mut self, package: &str, profile: u32) -> usize {
        let before = self.apps.len();
        self.apps.retain(|app, _| !app.belongs_to(package, profile));
        before - self.apps.len()
    }

    fn save_state(&self) -> Result<String, PredictError> {
        Ok(self.to_json()?)
    }

    /// Replace learned counters; the configured weight and bound are kept
    fn load_state(&mut self, json: &str) -> Result<(), PredictError> {
        let loaded = Self::from_json(json)?;
        self.apps = loaded.apps;
        while self.apps.len() > self.max_apps {
            let before = self.apps.len();
            if let Some(newest) = self
                .apps
                .iter()
                .max_by_key(|(_, stats)| stats.last_launched)
                .map(|(app, _)| app.clone())
            {
                self.evict_least_used(&newest);
            }
            if self.apps.len() == before {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;

    fn app(s: &str) -> AppIdentifier {
        s.parse().unwrap()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 8, 0, 0).unwrap()
    }

    fn one_hot(len: usize, hot: &[usize]) -> Vec<f32> {
        let mut v = vec![0.0; len];
        for &i in hot {
            v[i] = 1.0;
        }
        v
    }

    #[test]
    fn test_launch_counts_order_without_features() {
        let mut ranker = AffinityRanker::default();
        for _ in 0..3 {
            ranker.record_launch(&app("com.a/Main"), &[], t0());
        }
        ranker.record_launch(&app("com.b/Main"), &[], t0());

        let ranked = ranker.rank(&[]);
        let names: Vec<String> = ranked.iter().map(|c| c.app.to_string()).collect();
        assert_eq!(names, vec!["com.a/Main", "com.b/Main"]);
        assert!((ranked[0].score - 0.2 * 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_active_features_dominate_prior() {
        let mut ranker = AffinityRanker::default();
        // com.a is used a lot in the morning (feature 0), com.b in the evening (feature 1)
        for _ in 0..5 {
            ranker.record_launch(&app("com.a/Main"), &one_hot(2, &[0]), t0());
        }
        ranker.record_launch(&app("com.b/Main"), &one_hot(2, &[1]), t0());

        let evening = ranker.rank(&one_hot(2, &[1]));
        assert_eq!(evening[0].app, app("com.b/Main"));
        let morning = ranker.rank(&one_hot(2, &[0]));
        assert_eq!(morning[0].app, app("com.a/Main"));
    }

    #[test]
    fn test_ties_break_by_identifier() {
        let mut ranker = AffinityRanker::default();
        ranker.record_launch(&app("com.z/Main"), &[], t0());
        ranker.record_launch(&app("com.m/Main"), &[], t0());
        let ranked = ranker.rank(&[]);
        assert_eq!(ranked[0].app, app("com.m/Main"));
        assert_eq!(ranked[0].score, ranked[1].score);
    }

    #[test]
    fn test_forget_feature_clears_column() {
        let mut ranker = AffinityRanker::default();
        ranker.record_launch(&app("com.a/Main"), &one_hot(3, &[0, 2]), t0());
        ranker.forget_feature(2);
        let stats = ranker.stats(&app("com.a/Main")).unwrap();
        assert_eq!(stats.features.keys().copied().collect::<Vec<_>>(), vec![0]);
        assert_eq!(ranker.score(&app("com.a/Main"), &[2]), 0.2);
    }

    #[test]
    fn test_forget_package_respects_profile() {
        let mut ranker = AffinityRanker::default();
        ranker.record_launch(&app("com.a/Main"), &[], t0());
        ranker.record_launch(&app("com.a/Other"), &[], t0());
        ranker.record_launch(&app("com.a/Main#10"), &[], t0());

        assert_eq!(ranker.forget_package("com.a", 0), 2);
        assert_eq!(ranker.len(), 1);
        assert!(ranker.stats(&app("com.a/Main#10")).is_some());
    }

    #[test]
    fn test_bounded_app_count_keeps_new_launch() {
        let mut ranker = AffinityRanker::new(0.2, 2);
        ranker.record_launch(&app("com.a/Main"), &[], t0());
        ranker.record_launch(&app("com.a/Main"), &[], t0());
        ranker.record_launch(&app("com.b/Main"), &[], t0() + Duration::minutes(1));
        ranker.record_launch(&app("com.c/Main"), &[], t0() + Duration::minutes(2));

        assert_eq!(ranker.len(), 2);
        assert!(ranker.stats(&app("com.b/Main")).is_none());
        assert!(ranker.stats(&app("com.c/Main")).is_some());
    }

    #[test]
    fn test_state_round_trip() {
        let mut ranker = AffinityRanker::default();
        ranker.record_launch(&app("com.a/Main#10"), &one_hot(4, &[1, 3]), t0());

        let json = ranker.save_state().unwrap();
        let mut restored = AffinityRanker::default();
        restored.load_state(&json).unwrap();
        assert_eq!(restored, ranker);

        assert!(restored.load_state("{\"apps\": 3}").is_err());
    }
}
