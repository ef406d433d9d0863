//! Property tests: slot store bounds and eviction order, state round trips,
//! aggregator layout, pipeline uniqueness.

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;
use std::sync::Arc;

use launch_predictor::adapters::{MemoryAuditSink, MemoryPackages, MemoryStore, StaticLayout};
use launch_predictor::extractors::{
    DayOfWeekExtractor, Extractor, FeatureAggregator, GeoBucketExtractor, HeadsetExtractor,
    HourOfDayExtractor, PlaceExtractor,
};
use launch_predictor::filters::{
    is_unique, FilterPipeline, HiddenAppsFilter, InstalledStateFilter, PopularityBackfillFilter,
    RecencyPromotionFilter, SubtractionFilter,
};
use launch_predictor::slot_store::SlotEntry;
use launch_predictor::{AppIdentifier, LabelSlotStore, PredictionCandidate, PredictionContext};

fn observations() -> impl Strategy<Value = Vec<(u8, i64)>> {
    prop::collection::vec((0u8..12, 0i64..50), 1..80)
}

fn label(n: u8) -> String {
    format!("com.app{n}/Main")
}

fn child(kind: u8) -> Box<dyn Extractor> {
    match kind % 5 {
        0 => Box::new(DayOfWeekExtractor),
        1 => Box::new(HourOfDayExtractor),
        2 => Box::new(HeadsetExtractor::new(Duration::minutes(2))),
        3 => Box::new(GeoBucketExtractor::new(0.01, 1 + kind as usize)),
        _ => Box::new(PlaceExtractor::new(
            (0..kind).map(|i| format!("place{i}")).collect(),
        )),
    }
}

proptest! {
    #[test]
    fn prop_slots_stay_in_bounds(capacity in 1usize..8, ops in observations()) {
        let mut store = LabelSlotStore::new(capacity);
        for (n, t) in ops {
            let slot = store.observe(&label(n), t);
            prop_assert!(slot < capacity);
            prop_assert!(store.len() <= capacity);
            prop_assert!(store.entries().all(|e| e.slot < capacity));
        }
    }

    #[test]
    fn prop_reobserve_keeps_slot(capacity in 1usize..8, ops in observations()) {
        let mut store = LabelSlotStore::new(capacity);
        for (n, t) in ops {
            let before = store.slot_of(&label(n));
            let slot = store.observe(&label(n), t);
            if let Some(before) = before {
                prop_assert_eq!(before, slot);
                prop_assert_eq!(store.last_used(&label(n)), Some(t));
            }
        }
    }

    #[test]
    fn prop_eviction_takes_oldest(capacity in 1usize..6, ops in observations()) {
        let mut store = LabelSlotStore::new(capacity);
        for (n, t) in ops {
            let expected: Option<SlotEntry> = if store.is_full() && store.slot_of(&label(n)).is_none() {
                store.entries().min_by_key(|e| (e.last_used, e.slot)).cloned()
            } else {
                None
            };
            let (slot, evicted) = store.observe_evicting(&label(n), t);
            prop_assert_eq!(&evicted, &expected);
            if let Some(evicted) = evicted {
                prop_assert_eq!(evicted.slot, slot);
                prop_assert_eq!(store.slot_of(&evicted.label), None);
            }
        }
    }

    #[test]
    fn prop_store_survives_serialization(capacity in 1usize..10, ops in observations()) {
        let mut store = LabelSlotStore::new(capacity);
        for (n, t) in ops {
            store.observe(&label(n), t);
        }
        let restored = LabelSlotStore::from_bytes(&store.to_bytes().unwrap()).unwrap();
        prop_assert_eq!(restored.capacity(), store.capacity());
        prop_assert_eq!(restored.free_slots(), store.free_slots());
        prop_assert_eq!(&restored, &store);
    }

    #[test]
    fn prop_aggregator_length_is_sum_of_children(kinds in prop::collection::vec(0u8..10, 0..8)) {
        let mut aggregator = FeatureAggregator::new();
        let mut expected_offset = 0;
        let mut offsets = Vec::new();
        for kind in kinds {
            let child = child(kind);
            offsets.push(expected_offset);
            expected_offset += child.capacity();
            aggregator.add_child(child);
        }
        prop_assert_eq!(aggregator.capacity(), expected_offset);

        let summary = aggregator.describe();
        let actual: Vec<usize> = summary.children.iter().map(|c| c.offset).collect();
        prop_assert_eq!(actual, offsets);

        let now = Utc.with_ymd_and_hms(2024, 1, 15, 8, 0, 0).unwrap();
        let features = aggregator.extract(&[], &PredictionContext::at(now));
        prop_assert_eq!(features.len(), expected_offset);
    }

    #[test]
    fn prop_pipeline_output_is_unique(
        raw in prop::collection::vec((0u8..10, 0.0f32..1.0), 0..20),
        launched in prop::collection::vec(0u8..10, 0..5),
        target in 1usize..8,
    ) {
        let packages = MemoryPackages::new();
        for n in 0..8u8 {
            packages.install(AppIdentifier::app(format!("com.app{n}"), "Main"));
        }
        let popular = (0..10).map(|n| format!("com.app{n}")).collect();
        let mut pipeline = FilterPipeline::standard(
            SubtractionFilter::new(
                Arc::new(MemoryStore::new()),
                Arc::new(StaticLayout::default()),
                Arc::new(MemoryAuditSink::new()),
            ),
            HiddenAppsFilter::new(Arc::new(MemoryStore::new())),
            InstalledStateFilter::new(Arc::new(packages.clone())),
            RecencyPromotionFilter::default(),
            PopularityBackfillFilter::new(popular, Arc::new(packages)),
        );

        let now = Utc.with_ymd_and_hms(2024, 1, 15, 8, 0, 0).unwrap();
        for (i, n) in launched.iter().enumerate() {
            let app: AppIdentifier = label(*n).parse().unwrap();
            pipeline.on_app_launched(&app, now - Duration::minutes(10 - i as i64));
        }

        let candidates: Vec<PredictionCandidate> = raw
            .iter()
            .map(|(n, score)| PredictionCandidate::new(label(*n).parse().unwrap(), *score))
            .collect();
        let report = pipeline.run(now, target, candidates);
        prop_assert!(is_unique(&report.candidates));
        prop_assert!(report.candidates.len() <= target);
    }
}
