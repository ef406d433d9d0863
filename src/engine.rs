//! Prediction engine
//!
//! Owns the feature aggregator, the ranker and the filter pipeline, and keeps
//! their state in the key-value store. One pass reads recent history from the
//! event log, extracts features for the current context, ranks, and filters.
//!
//! The engine is single-writer: every method takes `&mut self` and nothing
//! inside locks. [`PredictionWorker`](crate::worker::PredictionWorker) gives it
//! a dedicated thread.

use crate::adapters::{AuditSink, EventLog, KeyValueStore, PackageQuery, WorkspaceLayout};
use crate::adapters::{MemoryAuditSink, MemoryEventLog, MemoryPackages, MemoryStore, StaticLayout};
use crate::config::PredictorConfig;
use crate::error::PredictError;
use crate::extractors::{
    usage_decay, DayOfWeekExtractor, Extractor, ExtractorRegistry, ExtractorSummary,
    FeatureAggregator, GeoBucketExtractor, HeadsetExtractor, HourOfDayExtractor, PlaceExtractor,
    PrunePattern, SlotEvicted, UsageDecayExtractor,
};
use crate::filters::{
    FilterPipeline, HiddenAppsFilter, InstalledStateFilter, PipelineReport, PopularityBackfillFilter,
    RecencyPromotionFilter, SubtractionFilter,
};
use crate::ranker::{AffinityRanker, Ranker};
use crate::schema::ReplayStep;
use crate::types::{AppIdentifier, Event, FeatureVector, PredictionCandidate, PredictionContext};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Key of the serialized feature aggregator
pub const FEATURE_STATE_KEY: &str = "feature_state";

/// Key of the ranker's JSON state
pub const RANKER_STATE_KEY: &str = "ranker_state";

/// Everything the engine needs from its host
#[derive(Clone)]
pub struct Collaborators {
    pub events: Arc<dyn EventLog>,
    pub packages: Arc<dyn PackageQuery>,
    pub layout: Arc<dyn WorkspaceLayout>,
    pub store: Arc<dyn KeyValueStore>,
    pub audit: Arc<dyn AuditSink>,
}

/// In-memory collaborators with handles kept for the host
#[derive(Debug, Clone, Default)]
pub struct MemoryCollaborators {
    pub events: MemoryEventLog,
    pub packages: MemoryPackages,
    pub layout: StaticLayout,
    pub store: MemoryStore,
    pub audit: MemoryAuditSink,
}

impl MemoryCollaborators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            events: Arc::new(self.events.clone()),
            packages: Arc::new(self.packages.clone()),
            layout: Arc::new(self.layout.clone()),
            store: Arc::new(self.store.clone()),
            audit: Arc::new(self.audit.clone()),
        }
    }
}

/// Persisted engine state in transportable form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub feature_state: Vec<u8>,
    pub ranker_state: String,
}

/// The extractor layout built from a validated configuration
pub fn default_aggregator(config: &PredictorConfig) -> FeatureAggregator {
    let mut aggregator = FeatureAggregator::new()
        .with_child(UsageDecayExtractor::new(
            config.usage_decay.capacity,
            Duration::minutes(config.usage_decay.window_minutes),
            config.usage_decay.max_distinct,
        ))
        .with_child(DayOfWeekExtractor)
        .with_child(HourOfDayExtractor)
        .with_child(HeadsetExtractor::new(Duration::seconds(config.headset.recent_seconds)));
    if config.geo.enabled {
        aggregator = aggregator.with_child(GeoBucketExtractor::new(
            config.geo.cell_degrees,
            config.geo.buckets,
        ));
    }
    aggregator.with_child(PlaceExtractor::new(config.places.vocabulary.clone()))
}

/// `(tag, offset, capacity)` of every extractor in the tree, depth first
fn layout_of(summary: &ExtractorSummary) -> Vec<(String, usize, usize)> {
    let mut layout = vec![(summary.tag.clone(), summary.offset, summary.capacity)];
    for child in &summary.children {
        layout.extend(layout_of(child));
    }
    layout
}

/// Feature indexes backed by label slots rather than a fixed vocabulary
fn slot_columns(summary: &ExtractorSummary, base: usize) -> Vec<usize> {
    let start = base + summary.offset;
    if summary.children.is_empty() {
        return match summary.live_labels {
            Some(_) => (start..start + summary.capacity).collect(),
            None => Vec::new(),
        };
    }
    summary
        .children
        .iter()
        .flat_map(|child| slot_columns(child, start))
        .collect()
}

/// Label patterns covering every stored label of a package in a profile.
///
/// Profile 0 labels carry no suffix, so its patterns also reach the same
/// package in other profiles.
pub fn package_patterns(package: &str, profile: u32) -> Vec<PrunePattern> {
    let suffix = if profile == 0 {
        "*".to_string()
    } else {
        format!("*#{profile}")
    };
    let exact = if profile == 0 {
        package.to_string()
    } else {
        format!("{package}#{profile}")
    };
    vec![
        PrunePattern::new(exact.clone()),
        PrunePattern::new(format!("{package}/{suffix}")),
        PrunePattern::new(format!("*:{exact}")),
        PrunePattern::new(format!("*:{package}/{suffix}")),
    ]
}

/// Stateful launch predictor
pub struct PredictionEngine {
    config: PredictorConfig,
    events: Arc<dyn EventLog>,
    store: Arc<dyn KeyValueStore>,
    registry: ExtractorRegistry,
    aggregator: FeatureAggregator,
    ranker: Box<dyn Ranker>,
    pipeline: FilterPipeline,
    evicted: Arc<Mutex<Vec<usize>>>,
    dirty: bool,
}

impl PredictionEngine {
    /// Build the engine and load persisted state. Unreadable state is
    /// discarded with a warning and the engine starts fresh.
    pub fn new(config: PredictorConfig, collaborators: Collaborators) -> Result<Self, PredictError> {
        config.validate()?;

        let pipeline = FilterPipeline::standard(
            SubtractionFilter::new(
                Arc::clone(&collaborators.store),
                Arc::clone(&collaborators.layout),
                Arc::clone(&collaborators.audit),
            ),
            HiddenAppsFilter::new(Arc::clone(&collaborators.store)),
            InstalledStateFilter::new(Arc::clone(&collaborators.packages)),
            RecencyPromotionFilter::new(
                config.recency.capacity,
                Duration::hours(config.recency.window_hours),
                config.recency.max_promotions,
            ),
            PopularityBackfillFilter::new(
                config.popularity.packages.clone(),
                Arc::clone(&collaborators.packages),
            )
            .with_score_step(config.popularity.score_step),
        );

        let mut engine = Self {
            aggregator: default_aggregator(&config),
            ranker: Box::new(AffinityRanker::new(
                config.ranker.prior_weight,
                config.ranker.max_apps,
            )),
            config,
            events: collaborators.events,
            store: collaborators.store,
            registry: ExtractorRegistry::with_defaults(),
            pipeline,
            evicted: Arc::new(Mutex::new(Vec::new())),
            dirty: false,
        };

        let feature_state = engine.read_store(|store| store.get_bytes(FEATURE_STATE_KEY));
        let ranker_state = engine
            .read_store(|store| store.get_bytes(RANKER_STATE_KEY))
            .and_then(|bytes| String::from_utf8(bytes).ok());
        engine.restore_parts(feature_state.as_deref(), ranker_state.as_deref());
        Ok(engine)
    }

    /// Replace the ranker, e.g. with a host-provided model
    pub fn with_ranker(mut self, ranker: Box<dyn Ranker>) -> Self {
        self.ranker = ranker;
        self
    }

    fn read_store<F>(&self, read: F) -> Option<Vec<u8>>
    where
        F: FnOnce(&dyn KeyValueStore) -> Result<Option<Vec<u8>>, PredictError>,
    {
        match read(self.store.as_ref()) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "persisted state unavailable");
                None
            }
        }
    }

    fn restore_parts(&mut self, feature_state: Option<&[u8]>, ranker_state: Option<&str>) {
        let fresh = default_aggregator(&self.config);
        let expected = layout_of(&fresh.describe());

        let mut layout_matches = true;
        let mut recovered = false;
        self.aggregator = match feature_state {
            Some(bytes) => {
                let config = &self.config;
                let loaded = FeatureAggregator::from_bytes_or_else(bytes, &self.registry, || {
                    recovered = true;
                    default_aggregator(config)
                });
                if layout_of(&loaded.describe()) == expected {
                    loaded
                } else {
                    warn!("feature layout changed, starting fresh");
                    layout_matches = false;
                    fresh
                }
            }
            None => fresh,
        };
        self.attach_listener();

        match ranker_state {
            Some(_) if !layout_matches => {
                info!("discarding ranker state learned against a different layout");
                self.dirty = true;
            }
            Some(json) => {
                if let Err(e) = self.ranker.load_state(json) {
                    warn!(error = %e, "discarding unreadable ranker state");
                } else if recovered {
                    // The restored stores are empty, so their columns no
                    // longer name the labels the ranker learned them for
                    let columns = slot_columns(&self.aggregator.describe(), 0);
                    info!(columns = columns.len(), "clearing ranker columns of lost label slots");
                    for index in columns {
                        self.ranker.forget_feature(index);
                    }
                    self.dirty = true;
                }
            }
            None => {}
        }
        info!(capacity = self.aggregator.capacity(), "prediction state loaded");
    }

    fn attach_listener(&mut self) {
        let sink = Arc::clone(&self.evicted);
        self.aggregator
            .set_eviction_listener(Arc::new(move |evicted: &SlotEvicted| {
                sink.lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .push(evicted.feature_index);
            }));
    }

    /// Forward recycled feature slots to the ranker
    fn drain_evictions(&mut self) {
        let indexes: Vec<usize> = std::mem::take(
            &mut *self
                .evicted
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for index in indexes {
            debug!(index, "feature slot recycled");
            self.ranker.forget_feature(index);
        }
    }

    fn history(&self) -> Vec<Event> {
        match self.events.ordered_recent_events(self.config.history_limit) {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "event log unavailable, predicting without history");
                Vec::new()
            }
        }
    }

    pub fn config(&self) -> &PredictorConfig {
        &self.config
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Shape of the feature extractor tree
    pub fn describe(&self) -> ExtractorSummary {
        self.aggregator.describe()
    }

    pub fn feature_len(&self) -> usize {
        self.aggregator.capacity()
    }

    /// Features for `context` over the current history
    pub fn features(&mut self, context: &PredictionContext) -> FeatureVector {
        let history = self.history();
        let features = self.aggregator.extract(&history, context);
        self.drain_evictions();
        self.dirty = true;
        features
    }

    /// Learn from a launch. History is read from the event log and cut to
    /// what happened before the launch.
    pub fn on_app_launched(&mut self, event: &Event) {
        let history: Vec<Event> = self
            .history()
            .into_iter()
            .filter(|e| e.timestamp < event.timestamp)
            .collect();
        let context = PredictionContext::from_event(event);
        let features = self.aggregator.extract(&history, &context);
        self.drain_evictions();
        self.ranker.record_launch(&event.app, &features, event.timestamp);
        self.pipeline.on_app_launched(&event.app, event.timestamp);
        self.dirty = true;
        debug!(app = %event.app, "launch recorded");
    }

    /// Final predictions for `context`
    pub fn predict(&mut self, context: &PredictionContext) -> Vec<PredictionCandidate> {
        self.predict_report(context).candidates
    }

    /// Predictions with the pipeline's per-stage account
    pub fn predict_report(&mut self, context: &PredictionContext) -> PipelineReport {
        let features = self.features(context);
        let ranked = self.ranker.rank(&features);
        let report = self
            .pipeline
            .run(context.now, self.config.max_predictions, ranked);
        debug!(predictions = report.candidates.len(), "prediction pass complete");
        report
    }

    /// A package was installed or updated
    pub fn on_package_changed(&mut self, package: &str, profile: u32) {
        self.pipeline.on_package_changed(package, profile);
    }

    /// A package was removed: forget its labels and counters and drop caches
    pub fn on_package_removed(&mut self, package: &str, profile: u32) -> usize {
        let mut forgotten = 0;
        for pattern in package_patterns(package, profile) {
            forgotten += self
                .aggregator
                .prune(&[PrunePattern::new(usage_decay::TAG), pattern]);
        }
        self.drain_evictions();
        let apps = self.ranker.forget_package(package, profile);
        self.pipeline.on_package_changed(package, profile);
        self.dirty = true;
        info!(package, profile, labels = forgotten, apps, "forgot removed package");
        forgotten
    }

    pub fn on_activity_state_changed(&mut self, app: &AppIdentifier, enabled: bool) {
        self.pipeline.on_activity_state_changed(app, enabled);
    }

    /// The first page changed; returns whether any filter state changed
    pub fn on_workspace_changed(&mut self, now: DateTime<Utc>) -> bool {
        self.pipeline.refresh(now)
    }

    /// Hide `app` from predictions, or show it again; returns whether the
    /// hidden set changed. The set is persisted immediately.
    pub fn set_hidden(&mut self, app: &AppIdentifier, hidden: bool) -> bool {
        self.pipeline.set_hidden(app, hidden)
    }

    /// Forget stored labels selected by a pattern path
    pub fn prune(&mut self, path: &[PrunePattern]) -> usize {
        let removed = self.aggregator.prune(path);
        self.drain_evictions();
        if removed > 0 {
            self.dirty = true;
        }
        removed
    }

    /// Current state in transportable form
    pub fn snapshot(&self) -> Result<StateSnapshot, PredictError> {
        Ok(StateSnapshot {
            feature_state: self.aggregator.to_bytes()?,
            ranker_state: self.ranker.save_state()?,
        })
    }

    /// Replace in-memory state with a snapshot, falling back to fresh state
    /// for any part that cannot be read
    pub fn restore(&mut self, snapshot: &StateSnapshot) {
        self.ranker = Box::new(AffinityRanker::new(
            self.config.ranker.prior_weight,
            self.config.ranker.max_apps,
        ));
        self.restore_parts(Some(&snapshot.feature_state), Some(&snapshot.ranker_state));
        self.dirty = true;
    }

    /// Persist state if anything changed since the last save
    pub fn save(&mut self) -> Result<bool, PredictError> {
        if !self.dirty {
            return Ok(false);
        }
        let snapshot = self.snapshot()?;
        self.store.put_bytes(FEATURE_STATE_KEY, &snapshot.feature_state)?;
        self.store
            .put_bytes(RANKER_STATE_KEY, snapshot.ranker_state.as_bytes())?;
        self.dirty = false;
        debug!(bytes = snapshot.feature_state.len(), "prediction state saved");
        Ok(true)
    }
}

/// Feed one log record to the engine. Launches are appended to `events`
/// first so later passes see them as history; removals also uninstall the
/// package from `packages`.
pub fn replay_step(
    engine: &mut PredictionEngine,
    events: &MemoryEventLog,
    packages: &MemoryPackages,
    step: ReplayStep,
) {
    match step {
        ReplayStep::Launch(event) => {
            events.push(event.clone());
            engine.on_app_launched(&event);
        }
        ReplayStep::PackageChanged { package, profile, .. } => {
            engine.on_package_changed(&package, profile);
        }
        ReplayStep::PackageRemoved { package, profile, .. } => {
            packages.uninstall(&package, profile);
            engine.on_package_removed(&package, profile);
        }
    }
}

impl std::fmt::Debug for PredictionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredictionEngine")
            .field("aggregator", &self.aggregator)
            .field("pipeline", &self.pipeline)
            .field("dirty", &self.dirty)
            .finish()
    }
}
