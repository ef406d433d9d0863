//! Post-ranking filter stages
//!
//! A stage mutates the ranked candidate list in place and may record what it
//! removed or added. Stages can own cached or persisted state and receive
//! lifecycle hooks from the engine; every hook defaults to a no-op.

pub mod hidden;
pub mod installed;
pub mod pipeline;
pub mod popularity;
pub mod recency;
pub mod subtraction;

pub use hidden::HiddenAppsFilter;
pub use installed::InstalledStateFilter;
pub use pipeline::{FilterPipeline, PipelineReport, StageReport};
pub use popularity::PopularityBackfillFilter;
pub use recency::RecencyPromotionFilter;
pub use subtraction::SubtractionFilter;

use crate::types::{AppIdentifier, PredictionCandidate};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;

/// Per-pass inputs shared by every stage
#[derive(Debug, Clone, PartialEq)]
pub struct FilterContext {
    pub now: DateTime<Utc>,
    /// Number of predictions the caller wants to show
    pub target_size: usize,
    /// Identifiers removed by earlier stages of the current pass; stages
    /// that insert candidates must not bring these back
    pub excluded: HashSet<AppIdentifier>,
}

impl FilterContext {
    pub fn new(now: DateTime<Utc>, target_size: usize) -> Self {
        Self {
            now,
            target_size,
            excluded: HashSet::new(),
        }
    }

    pub fn is_excluded(&self, app: &AppIdentifier) -> bool {
        self.excluded.contains(app)
    }
}

/// Candidates a stage dropped or inserted during one `apply`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FilterChanges {
    pub removed: Vec<PredictionCandidate>,
    pub added: Vec<PredictionCandidate>,
}

impl FilterChanges {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }
}

/// One step of the post-ranking pipeline
pub trait FilterStage: Send {
    fn name(&self) -> &'static str;

    /// Mutate `candidates` in place, optionally recording the changes
    fn apply(
        &mut self,
        context: &FilterContext,
        candidates: &mut Vec<PredictionCandidate>,
        changes: Option<&mut FilterChanges>,
    );

    /// Called before the first stage of a pass runs
    fn begin_pass(&mut self, _context: &FilterContext) {}

    /// Called after the last stage of a pass has run
    fn end_pass(&mut self, _context: &FilterContext) {}

    fn on_app_launched(&mut self, _app: &AppIdentifier, _at: DateTime<Utc>) {}

    /// A package was installed, updated or removed for `profile`
    fn on_package_changed(&mut self, _package: &str, _profile: u32) {}

    fn on_activity_state_changed(&mut self, _app: &AppIdentifier, _enabled: bool) {}

    /// Re-read external state; returns whether anything changed
    fn refresh(&mut self, _now: DateTime<Utc>) -> bool {
        false
    }

    /// Add identifiers no stage may insert during the coming pass
    fn exclude(&self, _excluded: &mut HashSet<AppIdentifier>) {}

    /// The user hid or showed `app`; returns whether stage state changed
    fn on_visibility_changed(&mut self, _app: &AppIdentifier, _hidden: bool) -> bool {
        false
    }
}

/// Keep the first occurrence of each identifier; returns the dropped duplicates
pub fn dedup_candidates(candidates: &mut Vec<PredictionCandidate>) -> Vec<PredictionCandidate> {
    let mut seen = HashSet::with_capacity(candidates.len());
    let mut removed = Vec::new();
    candidates.retain(|candidate| {
        if seen.insert(candidate.app.clone()) {
            true
        } else {
            removed.push(candidate.clone());
            false
        }
    });
    removed
}

/// Whether every identifier in `candidates` is distinct
pub fn is_unique(candidates: &[PredictionCandidate]) -> bool {
    let mut seen = HashSet::with_capacity(candidates.len());
    candidates.iter().all(|candidate| seen.insert(&candidate.app))
}

/// Smallest gap that still moves `score`: `step`, widened to the spacing of
/// f32 values at the score's magnitude
fn effective_step(score: f32, step: f32) -> f32 {
    step.max(score.abs() * f32::EPSILON)
}

/// A score strictly below `score`
pub fn score_below(score: f32, step: f32) -> f32 {
    score - effective_step(score, step)
}

/// A score strictly above `score`
pub fn score_above(score: f32, step: f32) -> f32 {
    score + effective_step(score, step)
}

/// Remove candidates rejected by `keep`, recording them in `changes`
pub(crate) fn retain_recording<F>(
    candidates: &mut Vec<PredictionCandidate>,
    mut changes: Option<&mut FilterChanges>,
    mut keep: F,
) where
    F: FnMut(&PredictionCandidate) -> bool,
{
    candidates.retain(|candidate| {
        if keep(candidate) {
            return true;
        }
        if let Some(changes) = changes.as_deref_mut() {
            changes.removed.push(candidate.clone());
        }
        false
    });
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::types::PredictionCandidate;

    pub fn candidates(items: &[(&str, f32)]) -> Vec<PredictionCandidate> {
        items
            .iter()
            .map(|(app, score)| PredictionCandidate::new(app.parse().unwrap(), *score))
            .collect()
    }

    pub fn names(candidates: &[PredictionCandidate]) -> Vec<String> {
        candidates.iter().map(|c| c.app.to_string()).collect()
    }
}
