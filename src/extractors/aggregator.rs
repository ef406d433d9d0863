//! Composite extractor
//!
//! Concatenates child feature vectors in registration order. Child `i`
//! occupies `[offset_i, offset_i + capacity_i)` and the aggregator's capacity
//! is the sum of its children's.

use super::{
    EvictionListener, Extractor, ExtractorRegistry, ExtractorSummary, PrunePattern, SlotEvicted,
};
use crate::codec::{self, AggregatorRecord, ChildRecord};
use crate::error::PredictError;
use crate::types::{Event, PredictionContext};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

pub const TAG: &str = "aggregate";

/// Ordered collection of extractors producing one combined vector
#[derive(Default)]
pub struct FeatureAggregator {
    children: Vec<Box<dyn Extractor>>,
    offsets: Vec<usize>,
    capacity: usize,
    listener: Option<EvictionListener>,
}

impl fmt::Debug for FeatureAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureAggregator")
            .field(
                "children",
                &self.children.iter().map(|c| c.type_tag()).collect::<Vec<_>>(),
            )
            .field("offsets", &self.offsets)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl FeatureAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`add_child`](Self::add_child)
    pub fn with_child(mut self, child: impl Extractor + 'static) -> Self {
        self.add_child(Box::new(child));
        self
    }

    /// Append a child; its output lands right after the previous child's
    pub fn add_child(&mut self, mut child: Box<dyn Extractor>) {
        let offset = self.capacity;
        if let Some(listener) = &self.listener {
            child.set_eviction_listener(shifted(Arc::clone(listener), offset));
        }
        self.capacity += child.capacity();
        self.offsets.push(offset);
        self.children.push(child);
    }

    /// Number of direct children
    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// `(offset, child)` pairs in registration order
    pub fn children(&self) -> impl Iterator<Item = (usize, &dyn Extractor)> {
        self.offsets
            .iter()
            .copied()
            .zip(self.children.iter().map(|c| c.as_ref()))
    }

    pub fn from_bytes(bytes: &[u8], registry: &ExtractorRegistry) -> Result<Self, PredictError> {
        let record: AggregatorRecord = codec::decode(bytes)?;
        let mut aggregator = Self::new();
        for child in record.children {
            aggregator.add_child(registry.build(&child.tag, &child.bytes)?);
        }
        Ok(aggregator)
    }

    /// Restore from bytes, or build a fresh aggregator when any part of the
    /// blob cannot be trusted
    pub fn from_bytes_or_else<F>(bytes: &[u8], registry: &ExtractorRegistry, fallback: F) -> Self
    where
        F: FnOnce() -> Self,
    {
        match Self::from_bytes(bytes, registry) {
            Ok(aggregator) => aggregator,
            Err(e) => {
                warn!(error = %e, "discarding unreadable feature state");
                fallback()
            }
        }
    }
}

fn shifted(listener: EvictionListener, offset: usize) -> EvictionListener {
    Arc::new(move |evicted: &SlotEvicted| {
        listener(&SlotEvicted {
            label: evicted.label.clone(),
            feature_index: evicted.feature_index + offset,
        })
    })
}

impl Extractor for FeatureAggregator {
    fn type_tag(&self) -> &'static str {
        TAG
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn extract_into(&mut self, history: &[Event], context: &PredictionContext, out: &mut [f32]) {
        debug_assert_eq!(out.len(), self.capacity, "output length mismatch");
        for (child, &offset) in self.children.iter_mut().zip(&self.offsets) {
            let end = offset + child.capacity();
            if end > out.len() {
                debug_assert!(false, "child {} overruns output", child.type_tag());
                warn!(tag = child.type_tag(), offset, "skipping child that overruns output");
                continue;
            }
            child.extract_into(history, context, &mut out[offset..end]);
        }
    }

    /// `[childCount]{[tag][child bytes]}*` in registration order
    fn to_bytes(&self) -> Result<Vec<u8>, PredictError> {
        let children = self
            .children
            .iter()
            .map(|child| {
                Ok(ChildRecord {
                    tag: child.type_tag().to_string(),
                    bytes: child.to_bytes()?,
                })
            })
            .collect::<Result<Vec<_>, PredictError>>()?;
        codec::encode(&AggregatorRecord { children })
    }

    /// The first pattern selects children by type tag; matching children are
    /// pruned with the rest of the path. An empty path reaches every child.
    fn prune(&mut self, patterns: &[PrunePattern]) -> usize {
        match patterns.split_first() {
            None => self.children.iter_mut().map(|child| child.prune(&[])).sum(),
            Some((head, rest)) => self
                .children
                .iter_mut()
                .filter(|child| head.matches(child.type_tag()))
                .map(|child| child.prune(rest))
                .sum(),
        }
    }

    fn set_eviction_listener(&mut self, listener: EvictionListener) {
        for (child, &offset) in self.children.iter_mut().zip(&self.offsets) {
            child.set_eviction_listener(shifted(Arc::clone(&listener), offset));
        }
        self.listener = Some(listener);
    }

    fn describe(&self) -> ExtractorSummary {
        ExtractorSummary {
            tag: TAG.to_string(),
            capacity: self.capacity,
            offset: 0,
            live_labels: None,
            children: self
                .children()
                .map(|(offset, child)| ExtractorSummary {
                    offset,
                    ..child.describe()
                })
                .collect(),
        }
    }
}
