//! Filter pipeline
//!
//! Runs stages in a fixed order over the ranker's output. The standard order
//! is Subtraction, Hidden, InstalledState, RecencyPromotion,
//! PopularityBackfill, so promotion and backfill only fill headroom left by
//! the removals before them.
//!
//! The raw list is de-duplicated before the first stage and checked again
//! after every stage. Identifiers removed by a stage, and any a stage excludes
//! up front, are kept out by the stages that follow in the same pass.

use super::{
    dedup_candidates, is_unique, FilterChanges, FilterContext, FilterStage, HiddenAppsFilter,
    InstalledStateFilter, PopularityBackfillFilter, RecencyPromotionFilter, SubtractionFilter,
};
use crate::types::{AppIdentifier, PredictionCandidate};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

/// Changes made by one stage during a pass
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageReport {
    pub stage: &'static str,
    #[serde(flatten)]
    pub changes: FilterChanges,
}

/// Full account of one pipeline pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineReport {
    /// Duplicates dropped from the ranker output
    pub duplicates: Vec<PredictionCandidate>,
    pub stages: Vec<StageReport>,
    /// Candidates cut by the final truncation to the target size
    pub truncated: Vec<PredictionCandidate>,
    /// Final predictions
    pub candidates: Vec<PredictionCandidate>,
}

/// Ordered sequence of filter stages
#[derive(Default)]
pub struct FilterPipeline {
    stages: Vec<Box<dyn FilterStage>>,
}

impl FilterPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pipeline with the built-in stages in the standard order
    pub fn standard(
        subtraction: SubtractionFilter,
        hidden: HiddenAppsFilter,
        installed: InstalledStateFilter,
        recency: RecencyPromotionFilter,
        popularity: PopularityBackfillFilter,
    ) -> Self {
        Self::new()
            .with_stage(subtraction)
            .with_stage(hidden)
            .with_stage(installed)
            .with_stage(recency)
            .with_stage(popularity)
    }

    pub fn with_stage(mut self, stage: impl FilterStage + 'static) -> Self {
        self.push(Box::new(stage));
        self
    }

    pub fn push(&mut self, stage: Box<dyn FilterStage>) {
        self.stages.push(stage);
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Filter `candidates` and return only the final list
    pub fn apply(
        &mut self,
        now: DateTime<Utc>,
        target_size: usize,
        candidates: Vec<PredictionCandidate>,
    ) -> Vec<PredictionCandidate> {
        self.run(now, target_size, candidates).candidates
    }

    /// Filter `candidates`, recording every stage's changes
    pub fn run(
        &mut self,
        now: DateTime<Utc>,
        target_size: usize,
        mut candidates: Vec<PredictionCandidate>,
    ) -> PipelineReport {
        let mut context = FilterContext::new(now, target_size);
        let mut report = PipelineReport {
            duplicates: dedup_candidates(&mut candidates),
            ..PipelineReport::default()
        };
        if !report.duplicates.is_empty() {
            debug!(count = report.duplicates.len(), "dropped duplicate ranker output");
        }

        for stage in &mut self.stages {
            stage.begin_pass(&context);
            stage.exclude(&mut context.excluded);
        }

        for stage in &mut self.stages {
            let mut changes = FilterChanges::default();
            stage.apply(&context, &mut candidates, Some(&mut changes));

            if !is_unique(&candidates) {
                debug_assert!(false, "stage {} produced duplicates", stage.name());
                warn!(stage = stage.name(), "stage produced duplicates, dropping repeats");
                changes.removed.extend(dedup_candidates(&mut candidates));
            }

            let added: Vec<&AppIdentifier> = changes.added.iter().map(|c| &c.app).collect();
            context.excluded.extend(
                changes
                    .removed
                    .iter()
                    .filter(|c| !added.contains(&&c.app) && !candidates.iter().any(|k| k.app == c.app))
                    .map(|c| c.app.clone()),
            );

            if !changes.is_empty() {
                debug!(
                    stage = stage.name(),
                    removed = changes.removed.len(),
                    added = changes.added.len(),
                    "stage changed candidates"
                );
            }
            report.stages.push(StageReport {
                stage: stage.name(),
                changes,
            });
        }

        for stage in &mut self.stages {
            stage.end_pass(&context);
        }

        if candidates.len() > target_size {
            report.truncated = candidates.split_off(target_size);
        }
        report.candidates = candidates;
        report
    }

    pub fn on_app_launched(&mut self, app: &AppIdentifier, at: DateTime<Utc>) {
        for stage in &mut self.stages {
            stage.on_app_launched(app, at);
        }
    }

    pub fn on_package_changed(&mut self, package: &str, profile: u32) {
        for stage in &mut self.stages {
            stage.on_package_changed(package, profile);
        }
    }

    pub fn on_activity_state_changed(&mut self, app: &AppIdentifier, enabled: bool) {
        for stage in &mut self.stages {
            stage.on_activity_state_changed(app, enabled);
        }
    }

    /// Hide or show `app` in every stage that tracks visibility
    pub fn set_hidden(&mut self, app: &AppIdentifier, hidden: bool) -> bool {
        self.stages
            .iter_mut()
            .fold(false, |changed, stage| stage.on_visibility_changed(app, hidden) | changed)
    }

    /// Refresh every stage; true if any of them changed
    pub fn refresh(&mut self, now: DateTime<Utc>) -> bool {
        self.stages
            .iter_mut()
            .fold(false, |changed, stage| stage.refresh(now) | changed)
    }
}

impl std::fmt::Debug for FilterPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterPipeline")
            .field("stages", &self.stage_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{LayoutItem, MemoryAuditSink, MemoryPackages, MemoryStore, StaticLayout};
    use crate::filters::test_support::{candidates, names};
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 4, 12, 0, 0).unwrap()
    }

    struct Fixture {
        layout: StaticLayout,
        packages: MemoryPackages,
    }

    impl Fixture {
        fn new(installed: &[&str]) -> Self {
            let packages = MemoryPackages::new();
            for id in installed {
                packages.install(id.parse().unwrap());
            }
            Self {
                layout: StaticLayout::default(),
                packages,
            }
        }

        fn pipeline(&self, popular: &[&str]) -> FilterPipeline {
            let packages: Arc<MemoryPackages> = Arc::new(self.packages.clone());
            FilterPipeline::standard(
                SubtractionFilter::new(
                    Arc::new(MemoryStore::new()),
                    Arc::new(self.layout.clone()),
                    Arc::new(MemoryAuditSink::new()),
                ),
                HiddenAppsFilter::new(Arc::new(MemoryStore::new())),
                InstalledStateFilter::new(packages.clone()),
                RecencyPromotionFilter::default(),
                PopularityBackfillFilter::new(
                    popular.iter().map(|s| s.to_string()).collect(),
                    packages,
                ),
            )
        }
    }

    /// Stage that echoes its first candidate, violating uniqueness
    struct Echo;

    impl FilterStage for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn apply(
            &mut self,
            _context: &FilterContext,
            candidates: &mut Vec<PredictionCandidate>,
            _changes: Option<&mut FilterChanges>,
        ) {
            if let Some(first) = candidates.first().cloned() {
                candidates.push(first);
            }
        }
    }

    #[test]
    fn test_standard_order() {
        let fixture = Fixture::new(&[]);
        assert_eq!(
            fixture.pipeline(&[]).stage_names(),
            vec![
                "subtraction",
                "hidden",
                "installed_state",
                "recency_promotion",
                "popularity_backfill"
            ]
        );
    }

    #[test]
    fn test_dismissed_candidate_removed() {
        let fixture = Fixture::new(&["com.a/Main", "com.b/Main"]);
        fixture.layout.set(vec![LayoutItem::new("com.a/Main", 0)]);
        let mut pipeline = fixture.pipeline(&[]);
        assert!(pipeline.refresh(now()));

        let report = pipeline.run(now(), 5, candidates(&[("com.a/Main", 0.9), ("com.b/Main", 0.5)]));
        assert_eq!(report.candidates, candidates(&[("com.b/Main", 0.5)]));
        assert_eq!(report.stages[0].stage, "subtraction");
        assert_eq!(report.stages[0].changes.removed, candidates(&[("com.a/Main", 0.9)]));
    }

    #[test]
    fn test_full_pass() {
        let fixture = Fixture::new(&["com.a/Main", "com.b/Main", "com.new/Main", "p1", "p2", "p3"]);
        fixture.layout.set(vec![LayoutItem::new("com.b/Main", 0)]);
        let mut pipeline = fixture.pipeline(&["p1", "p2", "p3"]);
        pipeline.refresh(now());
        pipeline.on_app_launched(&"com.new/Main".parse().unwrap(), now() - Duration::minutes(3));

        let raw = candidates(&[
            ("com.a/Main", 0.9),
            ("com.b/Main", 0.8),
            ("com.gone/Main", 0.7),
            ("com.a/Main", 0.1),
        ]);
        let report = pipeline.run(now(), 4, raw);

        assert_eq!(names(&report.duplicates), vec!["com.a/Main"]);
        assert_eq!(
            names(&report.candidates),
            vec!["com.new/Main", "com.a/Main", "p1", "p2"]
        );
        let removed: Vec<Vec<String>> = report
            .stages
            .iter()
            .map(|s| names(&s.changes.removed))
            .collect();
        assert_eq!(
            removed,
            vec![
                vec!["com.b/Main".to_string()],
                vec![],
                vec!["com.gone/Main".to_string()],
                vec![],
                vec![]
            ]
        );
        assert!(report.truncated.is_empty());
    }

    #[test]
    fn test_truncates_to_target_size() {
        let fixture = Fixture::new(&["com.a/Main", "com.b/Main", "com.c/Main"]);
        let mut pipeline = fixture.pipeline(&[]);
        let report = pipeline.run(
            now(),
            2,
            candidates(&[("com.a/Main", 0.9), ("com.b/Main", 0.5), ("com.c/Main", 0.2)]),
        );
        assert_eq!(names(&report.candidates), vec!["com.a/Main", "com.b/Main"]);
        assert_eq!(names(&report.truncated), vec!["com.c/Main"]);
    }

    #[test]
    fn test_removed_identifier_not_backfilled() {
        // p1 is pinned on the first page, so backfill must not bring it back
        let fixture = Fixture::new(&["p1", "p2"]);
        fixture.layout.set(vec![LayoutItem::new("p1", 0)]);
        let mut pipeline = fixture.pipeline(&["p1", "p2"]);
        pipeline.refresh(now());

        let report = pipeline.run(now(), 3, candidates(&[("p1", 0.9)]));
        assert_eq!(names(&report.candidates), vec!["p2"]);
    }

    #[test]
    fn test_hidden_apps_are_never_reinserted() {
        let fixture = Fixture::new(&["com.a/Main", "com.new/Main", "p1", "p2"]);
        let mut pipeline = fixture.pipeline(&["p1", "p2"]);
        let new_app: AppIdentifier = "com.new/Main".parse().unwrap();
        pipeline.on_app_launched(&new_app, now() - Duration::minutes(1));

        assert!(pipeline.set_hidden(&new_app, true));
        assert!(pipeline.set_hidden(&"p1".parse().unwrap(), true));
        assert!(!pipeline.set_hidden(&"p1".parse().unwrap(), true));

        let report = pipeline.run(now(), 4, candidates(&[("com.a/Main", 0.9)]));
        assert_eq!(names(&report.candidates), vec!["com.a/Main", "p2"]);

        // Shown again, the recent launch is promoted
        assert!(pipeline.set_hidden(&new_app, false));
        let list = pipeline.apply(now(), 4, candidates(&[("com.a/Main", 0.9)]));
        assert_eq!(list[0].app, new_app);
    }

    #[test]
    fn test_promotion_expires_after_passes() {
        let fixture = Fixture::new(&["com.a/Main", "com.new/Main"]);
        let mut pipeline = fixture.pipeline(&[]);
        pipeline.on_app_launched(&"com.new/Main".parse().unwrap(), now());

        let mut promoted = 0;
        for pass in 0..15 {
            let list = pipeline.apply(now() + Duration::minutes(pass), 5, candidates(&[("com.a/Main", 0.9)]));
            if list[0].app.package == "com.new" {
                promoted += 1;
            }
        }
        // seen counter may reach the queue capacity (10) before pruning
        assert_eq!(promoted, 11);
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn test_duplicates_from_stage_are_dropped() {
        let mut pipeline = FilterPipeline::new().with_stage(Echo);
        let report = pipeline.run(now(), 5, candidates(&[("com.a/Main", 0.9)]));
        assert_eq!(names(&report.candidates), vec!["com.a/Main"]);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "produced duplicates")]
    fn test_duplicates_from_stage_assert_in_debug() {
        let mut pipeline = FilterPipeline::new().with_stage(Echo);
        pipeline.run(now(), 5, candidates(&[("com.a/Main", 0.9)]));
    }
}
