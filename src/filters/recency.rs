//! Recency promotion stage
//!
//! Apps launched recently get a short-lived chance at the front of the list
//! before the ranker has learned enough about them. Each queued launch counts
//! the passes it has been through and ages out after a fixed number of passes
//! or once it falls outside the decay window.

use super::{score_above, FilterChanges, FilterContext, FilterStage};
use crate::types::{AppIdentifier, PredictionCandidate};
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashSet, VecDeque};
use tracing::debug;

/// Default number of queued launches
pub const DEFAULT_CAPACITY: usize = 10;

/// Default age after which a queued launch is dropped
pub const DEFAULT_WINDOW_HOURS: i64 = 6;

/// Default number of promotions per pass
pub const DEFAULT_MAX_PROMOTIONS: usize = 1;

/// Score gap between a promoted candidate and the one below it
const PROMOTION_STEP: f32 = 1.0;

/// A queued launch
#[derive(Debug, Clone, PartialEq)]
pub struct RecentLaunch {
    pub app: AppIdentifier,
    pub launched_at: DateTime<Utc>,
    /// Passes this entry has been queued through
    pub seen: usize,
}

/// Promotes recently launched apps to the front of the list
#[derive(Debug, Clone)]
pub struct RecencyPromotionFilter {
    queue: VecDeque<RecentLaunch>,
    capacity: usize,
    window: Duration,
    max_promotions: usize,
}

impl Default for RecencyPromotionFilter {
    fn default() -> Self {
        Self::new(
            DEFAULT_CAPACITY,
            Duration::hours(DEFAULT_WINDOW_HOURS),
            DEFAULT_MAX_PROMOTIONS,
        )
    }
}

impl RecencyPromotionFilter {
    pub fn new(capacity: usize, window: Duration, max_promotions: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: VecDeque::with_capacity(capacity),
            capacity,
            window,
            max_promotions,
        }
    }

    /// Queued launches, oldest first
    pub fn queued(&self) -> impl Iterator<Item = &RecentLaunch> {
        self.queue.iter()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queue a launch. A relaunch moves the entry to the back with a fresh
    /// timestamp and counter; a full queue drops its oldest entry.
    pub fn observe(&mut self, app: &AppIdentifier, launched_at: DateTime<Utc>) {
        self.queue.retain(|entry| &entry.app != app);
        if self.queue.len() >= self.capacity {
            self.queue.pop_front();
        }
        self.queue.push_back(RecentLaunch {
            app: app.clone(),
            launched_at,
            seen: 0,
        });
    }

    /// Drop entries older than the window or seen more than `capacity` times
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.queue.len();
        let (window, limit) = (self.window, self.capacity);
        self.queue
            .retain(|entry| now - entry.launched_at <= window && entry.seen <= limit);
        before - self.queue.len()
    }

    /// Count one more pass against every queued entry
    pub fn tick(&mut self) {
        for entry in &mut self.queue {
            entry.seen += 1;
        }
    }
}

impl FilterStage for RecencyPromotionFilter {
    fn name(&self) -> &'static str {
        "recency_promotion"
    }

    fn apply(
        &mut self,
        context: &FilterContext,
        candidates: &mut Vec<PredictionCandidate>,
        changes: Option<&mut FilterChanges>,
    ) {
        if self.max_promotions == 0 {
            return;
        }
        let present: HashSet<&AppIdentifier> = candidates.iter().map(|c| &c.app).collect();
        let promoted: Vec<AppIdentifier> = self
            .queue
            .iter()
            .filter(|entry| !present.contains(&entry.app) && !context.is_excluded(&entry.app))
            .take(self.max_promotions)
            .map(|entry| entry.app.clone())
            .collect();
        if promoted.is_empty() {
            return;
        }

        let top = candidates
            .iter()
            .map(|c| c.score)
            .fold(0.0_f32, f32::max);
        let count = promoted.len();
        // Scores climb from the last promoted entry up to the first
        let mut score = top;
        let mut added: Vec<PredictionCandidate> = promoted
            .into_iter()
            .rev()
            .map(|app| {
                score = score_above(score, PROMOTION_STEP);
                PredictionCandidate::new(app, score)
            })
            .collect();
        added.reverse();
        debug!(promoted = count, "promoting recent launches");

        if let Some(changes) = changes {
            changes.added.extend(added.iter().cloned());
        }
        candidates.splice(0..0, added);
    }

    fn begin_pass(&mut self, context: &FilterContext) {
        let dropped = self.prune(context.now);
        if dropped > 0 {
            debug!(dropped, "recent launches expired");
        }
    }

    fn end_pass(&mut self, _context: &FilterContext) {
        self.tick();
    }

    fn on_app_launched(&mut self, app: &AppIdentifier, at: DateTime<Utc>) {
        self.observe(app, at);
    }

    fn on_package_changed(&mut self, package: &str, profile: u32) {
        self.queue.retain(|entry| !entry.app.belongs_to(package, profile));
    }
}
