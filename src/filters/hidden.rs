//! Hidden-apps stage
//!
//! Users can hide an app from predictions. The set is persisted in the
//! key-value store and every hidden identifier is removed from the list and
//! kept out of it by the stages that insert candidates later in the pass.

use super::{retain_recording, FilterChanges, FilterContext, FilterStage};
use crate::adapters::KeyValueStore;
use crate::error::PredictError;
use crate::types::{AppIdentifier, PredictionCandidate};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Key of the persisted hidden set
pub const HIDDEN_KEY: &str = "hidden_predictions";

/// Removes candidates the user asked never to see
pub struct HiddenAppsFilter {
    hidden: BTreeSet<AppIdentifier>,
    store: Arc<dyn KeyValueStore>,
}

impl HiddenAppsFilter {
    /// Build the stage, loading the persisted hidden set
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        let hidden = match store.get_string_set(HIDDEN_KEY) {
            Ok(Some(values)) => values
                .iter()
                .filter_map(|value| match value.parse::<AppIdentifier>() {
                    Ok(app) => Some(app),
                    Err(e) => {
                        warn!(error = %e, "dropping unreadable hidden entry");
                        None
                    }
                })
                .collect(),
            Ok(None) => BTreeSet::new(),
            Err(e) => {
                warn!(error = %e, "hidden set unavailable, starting empty");
                BTreeSet::new()
            }
        };
        debug!(size = hidden.len(), "loaded hidden set");
        Self { hidden, store }
    }

    pub fn hidden(&self) -> &BTreeSet<AppIdentifier> {
        &self.hidden
    }

    pub fn is_hidden(&self, app: &AppIdentifier) -> bool {
        self.hidden.contains(app)
    }

    /// Hide or show `app`; returns whether the set changed. The in-memory set
    /// changes even when persisting fails.
    pub fn set_hidden(&mut self, app: &AppIdentifier, hidden: bool) -> bool {
        let changed = if hidden {
            self.hidden.insert(app.clone())
        } else {
            self.hidden.remove(app)
        };
        if changed {
            if let Err(e) = self.persist() {
                warn!(error = %e, "failed to persist hidden set");
            }
            info!(app = %app, hidden, size = self.hidden.len(), "hidden set changed");
        }
        changed
    }

    fn persist(&self) -> Result<(), PredictError> {
        let values: BTreeSet<String> = self.hidden.iter().map(ToString::to_string).collect();
        self.store.put_string_set(HIDDEN_KEY, &values)
    }
}

impl FilterStage for HiddenAppsFilter {
    fn name(&self) -> &'static str {
        "hidden"
    }

    fn apply(
        &mut self,
        _context: &FilterContext,
        candidates: &mut Vec<PredictionCandidate>,
        changes: Option<&mut FilterChanges>,
    ) {
        if self.hidden.is_empty() {
            return;
        }
        let hidden = &self.hidden;
        retain_recording(candidates, changes, |candidate| !hidden.contains(&candidate.app));
    }

    fn exclude(&self, excluded: &mut HashSet<AppIdentifier>) {
        excluded.extend(self.hidden.iter().cloned());
    }

    fn on_visibility_changed(&mut self, app: &AppIdentifier, hidden: bool) -> bool {
        self.set_hidden(app, hidden)
    }
}
