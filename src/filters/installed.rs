//! Installed-state stage
//!
//! Drops candidates whose target is not installed and enabled. Answers are
//! cached per identifier until a package or activity change invalidates them.

use super::{retain_recording, FilterChanges, FilterContext, FilterStage};
use crate::adapters::PackageQuery;
use crate::types::{AppIdentifier, PredictionCandidate};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Removes candidates that cannot be launched
pub struct InstalledStateFilter {
    packages: Arc<dyn PackageQuery>,
    cache: HashMap<AppIdentifier, bool>,
}

impl InstalledStateFilter {
    pub fn new(packages: Arc<dyn PackageQuery>) -> Self {
        Self {
            packages,
            cache: HashMap::new(),
        }
    }

    /// Cached answer for `app`, if any
    pub fn cached(&self, app: &AppIdentifier) -> Option<bool> {
        self.cache.get(app).copied()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Installed check through the cache. Query failures count as not
    /// installed and are not cached, so the next pass asks again.
    pub fn is_installed(&mut self, app: &AppIdentifier) -> bool {
        lookup(self.packages.as_ref(), &mut self.cache, app)
    }
}

fn lookup(
    packages: &dyn PackageQuery,
    cache: &mut HashMap<AppIdentifier, bool>,
    app: &AppIdentifier,
) -> bool {
    if let Some(&installed) = cache.get(app) {
        return installed;
    }
    match packages.is_activity_enabled(app) {
        Ok(installed) => {
            cache.insert(app.clone(), installed);
            installed
        }
        Err(e) => {
            warn!(app = %app, error = %e, "package query failed, treating as not installed");
            false
        }
    }
}

impl FilterStage for InstalledStateFilter {
    fn name(&self) -> &'static str {
        "installed_state"
    }

    fn apply(
        &mut self,
        _context: &FilterContext,
        candidates: &mut Vec<PredictionCandidate>,
        changes: Option<&mut FilterChanges>,
    ) {
        let packages = self.packages.as_ref();
        let cache = &mut self.cache;
        retain_recording(candidates, changes, |candidate| {
            lookup(packages, cache, &candidate.app)
        });
    }

    fn on_package_changed(&mut self, package: &str, profile: u32) {
        let before = self.cache.len();
        self.cache.retain(|app, _| !app.belongs_to(package, profile));
        debug!(package, profile, cleared = before - self.cache.len(), "installed cache invalidated");
    }

    fn on_activity_state_changed(&mut self, app: &AppIdentifier, enabled: bool) {
        self.cache.insert(app.clone(), enabled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryPackages;
    use crate::filters::test_support::{candidates, names};
    use chrono::{TimeZone, Utc};

    fn context() -> FilterContext {
        FilterContext::new(Utc.with_ymd_and_hms(2024, 5, 4, 12, 0, 0).unwrap(), 5)
    }

    fn app(s: &str) -> AppIdentifier {
        s.parse().unwrap()
    }

    #[test]
    fn test_drops_uninstalled_candidates() {
        let packages = MemoryPackages::new();
        packages.install(app("com.a/Main"));
        let mut stage = InstalledStateFilter::new(Arc::new(packages));

        let mut list = candidates(&[("com.a/Main", 0.9), ("com.gone/Main", 0.5)]);
        let mut changes = FilterChanges::default();
        stage.apply(&context(), &mut list, Some(&mut changes));

        assert_eq!(names(&list), vec!["com.a/Main"]);
        assert_eq!(names(&changes.removed), vec!["com.gone/Main"]);
    }

    #[test]
    fn test_answers_are_cached() {
        let packages = MemoryPackages::new();
        packages.install(app("com.a/Main"));
        let mut stage = InstalledStateFilter::new(Arc::new(packages.clone()));

        for _ in 0..3 {
            let mut list = candidates(&[("com.a/Main", 0.9)]);
            stage.apply(&context(), &mut list, None);
            assert_eq!(list.len(), 1);
        }
        assert_eq!(packages.query_count(), 1);
        assert_eq!(stage.cached(&app("com.a/Main")), Some(true));
    }

    #[test]
    fn test_package_change_clears_package_and_profile_only() {
        let packages = MemoryPackages::new();
        for id in ["com.a/Main", "com.a/Main#10", "com.b/Main"] {
            packages.install(app(id));
        }
        let mut stage = InstalledStateFilter::new(Arc::new(packages.clone()));
        let mut list = candidates(&[("com.a/Main", 0.9), ("com.a/Main#10", 0.8), ("com.b/Main", 0.7)]);
        stage.apply(&context(), &mut list, None);
        assert_eq!(stage.cache_len(), 3);

        packages.uninstall("com.a", 0);
        stage.on_package_changed("com.a", 0);
        assert_eq!(stage.cached(&app("com.a/Main")), None);
        assert_eq!(stage.cached(&app("com.a/Main#10")), Some(true));

        let mut list = candidates(&[("com.a/Main", 0.9), ("com.a/Main#10", 0.8), ("com.b/Main", 0.7)]);
        stage.apply(&context(), &mut list, None);
        assert_eq!(names(&list), vec!["com.a/Main#10", "com.b/Main"]);
    }

    #[test]
    fn test_activity_state_change_updates_entry() {
        let packages = MemoryPackages::new();
        packages.install(app("com.a/Main"));
        let mut stage = InstalledStateFilter::new(Arc::new(packages.clone()));
        assert!(stage.is_installed(&app("com.a/Main")));

        stage.on_activity_state_changed(&app("com.a/Main"), false);
        let mut list = candidates(&[("com.a/Main", 0.9)]);
        stage.apply(&context(), &mut list, None);
        assert!(list.is_empty());
        assert_eq!(packages.query_count(), 1);
    }

    #[test]
    fn test_query_failure_drops_without_caching() {
        let packages = MemoryPackages::new();
        packages.install(app("com.flaky/Main"));
        packages.fail_package("com.flaky");
        let mut stage = InstalledStateFilter::new(Arc::new(packages.clone()));

        let mut list = candidates(&[("com.flaky/Main", 0.9)]);
        stage.apply(&context(), &mut list, None);
        assert!(list.is_empty());
        assert_eq!(stage.cached(&app("com.flaky/Main")), None);
    }
}
