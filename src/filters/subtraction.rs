//! Subtraction stage
//!
//! Items already pinned to the first home-screen page should not be suggested
//! again. The set of such identifiers is persisted so it is available before
//! the layout has been queried, and rebuilt whenever the layout changes.

use super::{retain_recording, FilterChanges, FilterContext, FilterStage};
use crate::adapters::{AuditRecord, AuditSink, KeyValueStore, WorkspaceLayout};
use crate::error::PredictError;
use crate::types::{AppIdentifier, PredictionCandidate};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Key of the persisted dismissed set
pub const DISMISSED_KEY: &str = "dismissed_predictions";

/// Removes candidates that are already on the first page
pub struct SubtractionFilter {
    dismissed: BTreeSet<AppIdentifier>,
    store: Arc<dyn KeyValueStore>,
    layout: Arc<dyn WorkspaceLayout>,
    audit: Arc<dyn AuditSink>,
}

impl SubtractionFilter {
    /// Build the stage, loading the persisted dismissed set
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        layout: Arc<dyn WorkspaceLayout>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let dismissed = match store.get_string_set(DISMISSED_KEY) {
            Ok(Some(values)) => values
                .iter()
                .filter_map(|value| match value.parse::<AppIdentifier>() {
                    Ok(app) => Some(app),
                    Err(e) => {
                        warn!(error = %e, "dropping unreadable dismissed entry");
                        None
                    }
                })
                .collect(),
            Ok(None) => BTreeSet::new(),
            Err(e) => {
                warn!(error = %e, "dismissed set unavailable, starting empty");
                BTreeSet::new()
            }
        };
        debug!(size = dismissed.len(), "loaded dismissed set");
        Self {
            dismissed,
            store,
            layout,
            audit,
        }
    }

    pub fn dismissed(&self) -> &BTreeSet<AppIdentifier> {
        &self.dismissed
    }

    /// Derive the dismissed set from the current first-page layout
    pub fn recompute(&self) -> Result<BTreeSet<AppIdentifier>, PredictError> {
        let items = self.layout.first_page_items()?;
        Ok(items
            .into_iter()
            .filter_map(|item| match item.intent.parse::<AppIdentifier>() {
                Ok(app) => Some(app.with_profile(item.profile)),
                Err(_) => {
                    debug!(intent = %item.intent, "ignoring non-app layout item");
                    None
                }
            })
            .collect())
    }

    fn persist(&self) -> Result<(), PredictError> {
        let values: BTreeSet<String> = self.dismissed.iter().map(ToString::to_string).collect();
        self.store.put_string_set(DISMISSED_KEY, &values)
    }
}

impl FilterStage for SubtractionFilter {
    fn name(&self) -> &'static str {
        "subtraction"
    }

    fn apply(
        &mut self,
        _context: &FilterContext,
        candidates: &mut Vec<PredictionCandidate>,
        changes: Option<&mut FilterChanges>,
    ) {
        if self.dismissed.is_empty() {
            return;
        }
        let dismissed = &self.dismissed;
        retain_recording(candidates, changes, |candidate| {
            !dismissed.contains(&candidate.app)
        });
    }

    fn refresh(&mut self, now: DateTime<Utc>) -> bool {
        let next = match self.recompute() {
            Ok(next) => next,
            Err(e) => {
                warn!(error = %e, "keeping previous dismissed set");
                return false;
            }
        };
        if next == self.dismissed {
            return false;
        }

        let record = AuditRecord::dismissed_changed(now, &self.dismissed, &next);
        self.dismissed = next;
        if let Err(e) = self.persist() {
            warn!(error = %e, "failed to persist dismissed set");
        }
        info!(
            added = record.added.len(),
            removed = record.removed.len(),
            size = record.size,
            "dismissed set changed"
        );
        self.audit.record(record);
        true
    }
}
