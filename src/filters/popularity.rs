//! Popularity backfill stage
//!
//! A new device has little usage history, so the list is topped up from a
//! configured ranking of well-known packages. Each package is resolved to its
//! launch target once and the answer cached.

use super::{score_below, FilterChanges, FilterContext, FilterStage};
use crate::adapters::PackageQuery;
use crate::types::{AppIdentifier, PredictionCandidate};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::warn;

/// Default score decrement between consecutive backfilled candidates
pub const DEFAULT_SCORE_STEP: f32 = 1e-3;

/// Appends popular packages until the list reaches its target size
pub struct PopularityBackfillFilter {
    packages: Vec<String>,
    query: Arc<dyn PackageQuery>,
    launchable: HashMap<String, Option<AppIdentifier>>,
    step: f32,
}

impl PopularityBackfillFilter {
    /// `packages` in priority order; duplicates after the first are ignored
    pub fn new(packages: Vec<String>, query: Arc<dyn PackageQuery>) -> Self {
        let mut seen = HashSet::new();
        let packages = packages
            .into_iter()
            .filter(|package| seen.insert(package.clone()))
            .collect();
        Self {
            packages,
            query,
            launchable: HashMap::new(),
            step: DEFAULT_SCORE_STEP,
        }
    }

    pub fn with_score_step(mut self, step: f32) -> Self {
        if step > 0.0 {
            self.step = step;
        }
        self
    }

    pub fn packages(&self) -> &[String] {
        &self.packages
    }

    /// Launch target of a popular package in the primary profile, cached.
    /// Query failures are not cached and mean "not launchable".
    pub fn launch_target(&mut self, package: &str) -> Option<AppIdentifier> {
        if let Some(cached) = self.launchable.get(package) {
            return cached.clone();
        }
        match self.query.launch_target(package, 0) {
            Ok(target) => {
                self.launchable.insert(package.to_string(), target.clone());
                target
            }
            Err(e) => {
                warn!(package, error = %e, "launch target lookup failed, skipping");
                None
            }
        }
    }
}

impl FilterStage for PopularityBackfillFilter {
    fn name(&self) -> &'static str {
        "popularity_backfill"
    }

    fn apply(
        &mut self,
        context: &FilterContext,
        candidates: &mut Vec<PredictionCandidate>,
        mut changes: Option<&mut FilterChanges>,
    ) {
        if candidates.len() >= context.target_size {
            return;
        }
        // A package counts as present if any of its primary-profile targets is
        let mut present: HashSet<String> = candidates
            .iter()
            .filter(|c| c.app.profile == 0)
            .map(|c| c.app.package.clone())
            .collect();
        let mut score = candidates.last().map_or(1.0, |c| c.score);

        for package in self.packages.clone() {
            if candidates.len() >= context.target_size {
                break;
            }
            if present.contains(&package) {
                continue;
            }
            let Some(target) = self.launch_target(&package) else {
                continue;
            };
            if context.is_excluded(&target) || candidates.iter().any(|c| c.app == target) {
                continue;
            }

            score = score_below(score, self.step);
            let candidate = PredictionCandidate::new(target, score);
            if let Some(changes) = changes.as_deref_mut() {
                changes.added.push(candidate.clone());
            }
            present.insert(package);
            candidates.push(candidate);
        }
    }

    fn on_package_changed(&mut self, package: &str, profile: u32) {
        if profile == 0 {
            self.launchable.remove(package);
        }
    }
}
