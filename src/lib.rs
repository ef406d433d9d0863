//! Launch Predictor - On-device predicted app-launch ranking
//!
//! Turns a device's launch history and current context into a short ranked
//! list of apps the user is likely to open next:
//! bounded feature store → feature extraction → ranking → filter pipeline.
//!
//! ## Modules
//!
//! - **Feature store**: [`slot_store::LabelSlotStore`] maps an open-ended label
//!   set onto a fixed number of feature slots with least-recently-used reuse
//! - **Extractors**: usage decay, time, headset and location features combined
//!   by [`extractors::FeatureAggregator`] with a versioned binary layout
//! - **Filters**: subtraction, installed state, recency promotion and
//!   popularity backfill applied after ranking
//! - **Engine**: [`PredictionEngine`] ties them together and persists state;
//!   [`PredictionWorker`] runs it on a dedicated thread

pub mod adapters;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod extractors;
pub mod filters;
pub mod ranker;
pub mod schema;
pub mod slot_store;
pub mod types;
pub mod worker;

// FFI bindings for C interop (always available for cdylib/staticlib builds)
pub mod ffi;

pub use config::PredictorConfig;
pub use engine::{Collaborators, MemoryCollaborators, PredictionEngine, StateSnapshot};
pub use error::PredictError;
pub use extractors::{Extractor, FeatureAggregator, PrunePattern};
pub use filters::{FilterPipeline, FilterStage, PipelineReport};
pub use slot_store::LabelSlotStore;
pub use types::{AppIdentifier, Event, HeadsetState, PredictionCandidate, PredictionContext};
pub use worker::{PredictionUpdate, PredictionWorker};

// Schema exports
pub use schema::{LaunchEvent, LaunchEventAdapter, SCHEMA_VERSION};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
