//! External collaborator interfaces
//!
//! The engine never talks to the platform directly. Usage history, package
//! state, the home-screen layout, persistence and auditing all arrive through
//! the traits below so hosts can plug in their own implementations.

mod file_store;
pub mod memory;

pub use file_store::FileStore;
pub use memory::{MemoryAuditSink, MemoryEventLog, MemoryPackages, MemoryStore, StaticLayout};

use crate::error::PredictError;
use crate::types::{AppIdentifier, Event};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Source of historical usage events
pub trait EventLog: Send + Sync {
    /// Up to `limit` most recent events, newest first
    fn ordered_recent_events(&self, limit: usize) -> Result<Vec<Event>, PredictError>;
}

/// Installed and enabled state of launch targets
pub trait PackageQuery: Send + Sync {
    /// Whether the activity behind `app` is installed and enabled for its profile
    fn is_activity_enabled(&self, app: &AppIdentifier) -> Result<bool, PredictError>;

    /// Default launch target of a package in a profile, if it has one
    fn launch_target(
        &self,
        package: &str,
        profile: u32,
    ) -> Result<Option<AppIdentifier>, PredictError>;
}

/// A reserved item on the first home-screen page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutItem {
    /// Intent reference in identifier form, e.g. `com.a/.Main`
    pub intent: String,
    #[serde(default)]
    pub profile: u32,
}

impl LayoutItem {
    pub fn new(intent: impl Into<String>, profile: u32) -> Self {
        Self {
            intent: intent.into(),
            profile,
        }
    }
}

/// Read access to the home-screen layout
pub trait WorkspaceLayout: Send + Sync {
    fn first_page_items(&self) -> Result<Vec<LayoutItem>, PredictError>;
}

/// What caused an audit record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    DismissedSetChanged,
}

/// Structured record describing a change to persisted filter state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub kind: AuditKind,
    pub at: DateTime<Utc>,
    pub added: Vec<AppIdentifier>,
    pub removed: Vec<AppIdentifier>,
    /// Size of the set after the change
    pub size: usize,
}

impl AuditRecord {
    pub fn dismissed_changed(
        at: DateTime<Utc>,
        before: &BTreeSet<AppIdentifier>,
        after: &BTreeSet<AppIdentifier>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: AuditKind::DismissedSetChanged,
            at,
            added: after.difference(before).cloned().collect(),
            removed: before.difference(after).cloned().collect(),
            size: after.len(),
        }
    }
}

/// Fire-and-forget audit destination
pub trait AuditSink: Send + Sync {
    fn record(&self, record: AuditRecord);
}

/// Key-value persistence for string sets and opaque blobs.
///
/// Implementations synchronise internally; the engine shares one store
/// between the dismissed-set filter and its own state.
pub trait KeyValueStore: Send + Sync {
    fn get_string_set(&self, key: &str) -> Result<Option<BTreeSet<String>>, PredictError>;

    fn put_string_set(&self, key: &str, values: &BTreeSet<String>) -> Result<(), PredictError>;

    fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, PredictError>;

    fn put_bytes(&self, key: &str, value: &[u8]) -> Result<(), PredictError>;

    fn remove(&self, key: &str) -> Result<(), PredictError>;
}
