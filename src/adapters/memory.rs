//! In-memory collaborators
//!
//! Cheap, cloneable implementations backed by shared state. Clones observe
//! the same data, so a host (or a test) can keep a handle after moving one
//! into the engine.

use super::{AuditRecord, AuditSink, EventLog, KeyValueStore, LayoutItem, PackageQuery, WorkspaceLayout};
use crate::error::PredictError;
use crate::types::{AppIdentifier, Event};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Append-only launch log
#[derive(Debug, Clone, Default)]
pub struct MemoryEventLog {
    events: Arc<Mutex<Vec<Event>>>,
    unavailable: Arc<Mutex<bool>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event; events are expected in chronological order
    pub fn push(&self, event: Event) {
        lock(&self.events).push(event);
    }

    pub fn len(&self) -> usize {
        lock(&self.events).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make every read fail, as a locked or missing usage database would
    pub fn set_unavailable(&self, unavailable: bool) {
        *lock(&self.unavailable) = unavailable;
    }
}

impl EventLog for MemoryEventLog {
    fn ordered_recent_events(&self, limit: usize) -> Result<Vec<Event>, PredictError> {
        if *lock(&self.unavailable) {
            return Err(PredictError::EventLog("event log unavailable".to_string()));
        }
        Ok(lock(&self.events).iter().rev().take(limit).cloned().collect())
    }
}

#[derive(Debug, Default)]
struct PackageState {
    enabled: HashSet<AppIdentifier>,
    launch_targets: HashMap<(String, u32), AppIdentifier>,
    failing: HashSet<String>,
}

/// Installed-package table
#[derive(Debug, Clone, Default)]
pub struct MemoryPackages {
    state: Arc<Mutex<PackageState>>,
    queries: Arc<AtomicUsize>,
}

impl MemoryPackages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install an enabled activity; the first activity of a package becomes
    /// its launch target
    pub fn install(&self, app: AppIdentifier) {
        let mut state = lock(&self.state);
        state
            .launch_targets
            .entry((app.package.clone(), app.profile))
            .or_insert_with(|| app.clone());
        state.enabled.insert(app);
    }

    /// Remove every activity of a package in one profile
    pub fn uninstall(&self, package: &str, profile: u32) {
        let mut state = lock(&self.state);
        state.enabled.retain(|app| !app.belongs_to(package, profile));
        state
            .launch_targets
            .remove(&(package.to_string(), profile));
    }

    pub fn set_enabled(&self, app: &AppIdentifier, enabled: bool) {
        let mut state = lock(&self.state);
        if enabled {
            state.enabled.insert(app.clone());
        } else {
            state.enabled.remove(app);
        }
    }

    /// Make queries about `package` fail
    pub fn fail_package(&self, package: &str) {
        lock(&self.state).failing.insert(package.to_string());
    }

    /// Number of queries answered so far, failed ones included
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::Relaxed)
    }
}

impl PackageQuery for MemoryPackages {
    fn is_activity_enabled(&self, app: &AppIdentifier) -> Result<bool, PredictError> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        let state = lock(&self.state);
        if state.failing.contains(&app.package) {
            return Err(PredictError::PackageQuery(format!("{app}: service unavailable")));
        }
        Ok(state.enabled.contains(app))
    }

    fn launch_target(
        &self,
        package: &str,
        profile: u32,
    ) -> Result<Option<AppIdentifier>, PredictError> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        let state = lock(&self.state);
        if state.failing.contains(package) {
            return Err(PredictError::PackageQuery(format!("{package}: service unavailable")));
        }
        Ok(state
            .launch_targets
            .get(&(package.to_string(), profile))
            .cloned())
    }
}

/// Fixed first-page layout that can be swapped at runtime
#[derive(Debug, Clone, Default)]
pub struct StaticLayout {
    items: Arc<Mutex<Vec<LayoutItem>>>,
}

impl StaticLayout {
    pub fn new(items: Vec<LayoutItem>) -> Self {
        Self {
            items: Arc::new(Mutex::new(items)),
        }
    }

    pub fn set(&self, items: Vec<LayoutItem>) {
        *lock(&self.items) = items;
    }
}

impl WorkspaceLayout for StaticLayout {
    fn first_page_items(&self) -> Result<Vec<LayoutItem>, PredictError> {
        Ok(lock(&self.items).clone())
    }
}

/// Collects audit records in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryAuditSink {
    records: Arc<Mutex<Vec<AuditRecord>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        lock(&self.records).clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: AuditRecord) {
        lock(&self.records).push(record);
    }
}

#[derive(Debug, Default)]
struct StoreState {
    sets: HashMap<String, BTreeSet<String>>,
    blobs: HashMap<String, Vec<u8>>,
    writes: usize,
}

/// Key-value store held in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful puts, used to observe save behaviour
    pub fn write_count(&self) -> usize {
        lock(&self.state).writes
    }
}

impl KeyValueStore for MemoryStore {
    fn get_string_set(&self, key: &str) -> Result<Option<BTreeSet<String>>, PredictError> {
        Ok(lock(&self.state).sets.get(key).cloned())
    }

    fn put_string_set(&self, key: &str, values: &BTreeSet<String>) -> Result<(), PredictError> {
        let mut state = lock(&self.state);
        state.sets.insert(key.to_string(), values.clone());
        state.writes += 1;
        Ok(())
    }

    fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, PredictError> {
        Ok(lock(&self.state).blobs.get(key).cloned())
    }

    fn put_bytes(&self, key: &str, value: &[u8]) -> Result<(), PredictError> {
        let mut state = lock(&self.state);
        state.blobs.insert(key.to_string(), value.to_vec());
        state.writes += 1;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PredictError> {
        let mut state = lock(&self.state);
        state.sets.remove(key);
        state.blobs.remove(key);
        Ok(())
    }
}
