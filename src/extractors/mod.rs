//! Feature extractors
//!
//! An extractor maps (event history, current context) to a fixed-length
//! feature vector. Fixed-vocabulary extractors one-hot encode the context;
//! [`UsageDecayExtractor`] keeps a bounded label store of recently used apps.
//! [`FeatureAggregator`] concatenates any number of extractors, itself
//! included.
//!
//! Extractors are rebuilt from persisted bytes through an
//! [`ExtractorRegistry`] that maps each type tag to a constructor.

pub mod aggregator;
pub mod usage_decay;
pub mod vocabulary;

pub use aggregator::FeatureAggregator;
pub use usage_decay::{Proximity, ProximityPredicate, UsageDecayExtractor, WithinWindow};
pub use vocabulary::{
    DayOfWeekExtractor, GeoBucketExtractor, HeadsetExtractor, HourOfDayExtractor, PlaceExtractor,
};

use crate::error::PredictError;
use crate::types::{Event, FeatureVector, PredictionContext};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Notification that a label lost its slot, either to eviction or pruning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotEvicted {
    pub label: String,
    /// Index into the vector of the extractor the listener was registered on
    pub feature_index: usize,
}

/// Callback injected when an extractor is registered with its owner
pub type EvictionListener = Arc<dyn Fn(&SlotEvicted) + Send + Sync>;

/// Capability shared by every feature extractor
pub trait Extractor: Send {
    /// Stable tag used for persistence and prune matching
    fn type_tag(&self) -> &'static str;

    /// Length of the vector this extractor writes
    fn capacity(&self) -> usize;

    /// Write features into `out`, which is exactly `capacity()` long and
    /// zeroed by the caller
    fn extract_into(&mut self, history: &[Event], context: &PredictionContext, out: &mut [f32]);

    /// Extract into a fresh vector
    fn extract(&mut self, history: &[Event], context: &PredictionContext) -> FeatureVector {
        let mut out = vec![0.0; self.capacity()];
        self.extract_into(history, context, &mut out);
        out
    }

    /// Serialize state and configuration
    fn to_bytes(&self) -> Result<Vec<u8>, PredictError>;

    /// Forget stored labels selected by `patterns`; returns how many were dropped
    fn prune(&mut self, _patterns: &[PrunePattern]) -> usize {
        0
    }

    fn set_eviction_listener(&mut self, _listener: EvictionListener) {}

    /// Shape of this extractor for diagnostics
    fn describe(&self) -> ExtractorSummary {
        ExtractorSummary {
            tag: self.type_tag().to_string(),
            capacity: self.capacity(),
            offset: 0,
            live_labels: None,
            children: Vec::new(),
        }
    }
}

/// Diagnostic description of an extractor tree
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractorSummary {
    pub tag: String,
    pub capacity: usize,
    pub offset: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live_labels: Option<usize>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ExtractorSummary>,
}

/// Glob pattern used to select extractors by tag and labels by name.
///
/// `*` matches any run of characters; everything else matches literally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrunePattern(String);

impl PrunePattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into())
    }

    /// Pattern matching every label of one package, across activities
    pub fn package(package: &str) -> Self {
        Self(format!("{package}/*"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, text: &str) -> bool {
        glob_match(self.0.as_bytes(), text.as_bytes())
    }
}

impl From<&str> for PrunePattern {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for PrunePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && pattern[p] == b'*' {
            backtrack = Some((p, t));
            p += 1;
        } else if p < pattern.len() && pattern[p] == text[t] {
            p += 1;
            t += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|&c| c == b'*')
}

/// Builds an extractor from its serialized bytes
pub type ExtractorConstructor =
    fn(&[u8], &ExtractorRegistry) -> Result<Box<dyn Extractor>, PredictError>;

/// Tag to constructor table used when restoring persisted extractors
#[derive(Clone, Default)]
pub struct ExtractorRegistry {
    constructors: BTreeMap<String, ExtractorConstructor>,
}

impl ExtractorRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry knowing every built-in extractor
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(usage_decay::TAG, |bytes, _| {
            Ok(Box::new(UsageDecayExtractor::from_bytes(bytes)?))
        });
        registry.register(vocabulary::DAY_TAG, |bytes, _| {
            Ok(Box::new(DayOfWeekExtractor::from_bytes(bytes)?))
        });
        registry.register(vocabulary::HOUR_TAG, |bytes, _| {
            Ok(Box::new(HourOfDayExtractor::from_bytes(bytes)?))
        });
        registry.register(vocabulary::HEADSET_TAG, |bytes, _| {
            Ok(Box::new(HeadsetExtractor::from_bytes(bytes)?))
        });
        registry.register(vocabulary::GEO_TAG, |bytes, _| {
            Ok(Box::new(GeoBucketExtractor::from_bytes(bytes)?))
        });
        registry.register(vocabulary::PLACE_TAG, |bytes, _| {
            Ok(Box::new(PlaceExtractor::from_bytes(bytes)?))
        });
        registry.register(aggregator::TAG, |bytes, registry| {
            Ok(Box::new(FeatureAggregator::from_bytes(bytes, registry)?))
        });
        registry
    }

    /// Register or replace the constructor for `tag`
    pub fn register(&mut self, tag: impl Into<String>, constructor: ExtractorConstructor) {
        self.constructors.insert(tag.into(), constructor);
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.constructors.contains_key(tag)
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    /// Rebuild an extractor; an unknown tag is an error
    pub fn build(&self, tag: &str, bytes: &[u8]) -> Result<Box<dyn Extractor>, PredictError> {
        let constructor = self
            .constructors
            .get(tag)
            .ok_or_else(|| PredictError::UnknownExtractor(tag.to_string()))?;
        constructor(bytes, self)
    }
}

impl fmt::Debug for ExtractorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractorRegistry")
            .field("tags", &self.constructors.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Write a one-hot at `index` if it is in range
pub(crate) fn set_hot(out: &mut [f32], index: usize) {
    if let Some(value) = out.get_mut(index) {
        *value = 1.0;
    }
}
