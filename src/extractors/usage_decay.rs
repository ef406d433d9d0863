//! Recent-usage extractor
//!
//! Marks which apps were launched within a short window before `now`. Every
//! app seen gets a slot in a bounded [`LabelSlotStore`], so the feature vector
//! length stays fixed no matter how many distinct apps the user has.

use super::{set_hot, EvictionListener, Extractor, ExtractorSummary, PrunePattern, SlotEvicted};
use crate::codec;
use crate::error::PredictError;
use crate::slot_store::{LabelSlotStore, SlotEntry, MAX_CAPACITY};
use crate::types::{Event, PredictionContext};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

pub const TAG: &str = "usage_decay";

/// Default number of app slots
pub const DEFAULT_CAPACITY: usize = 200;

/// Default recency window in minutes
pub const DEFAULT_WINDOW_MINUTES: i64 = 10;

/// Default number of distinct recent apps marked per extraction
pub const DEFAULT_MAX_DISTINCT: usize = 2;

/// Where an event sits relative to the recency window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proximity {
    /// Inside the window
    Recent,
    /// Older than the window
    Stale,
    /// Dated after `now`
    Ahead,
}

/// Decides whether an event counts as recent relative to `now`
pub trait ProximityPredicate: Send + Sync {
    fn classify(&self, event_time: DateTime<Utc>, now: DateTime<Utc>) -> Proximity;
}

/// Recent when `now - window <= event_time <= now`
#[derive(Debug, Clone, Copy)]
pub struct WithinWindow(pub Duration);

impl ProximityPredicate for WithinWindow {
    fn classify(&self, event_time: DateTime<Utc>, now: DateTime<Utc>) -> Proximity {
        let age = now - event_time;
        if age < Duration::zero() {
            Proximity::Ahead
        } else if age <= self.0 {
            Proximity::Recent
        } else {
            Proximity::Stale
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct UsageDecayRecord {
    capacity: u32,
    window_ms: i64,
    max_distinct: u32,
    store: Vec<u8>,
}

/// Binary presence features for the apps used in the last few minutes.
///
/// History is scanned newest to oldest. Scanning stops at the first event
/// older than the window, since everything behind it is older still. Events
/// dated after `now` are skipped rather than ending the scan, so one skewed
/// clock reading cannot blank the feature.
pub struct UsageDecayExtractor {
    store: LabelSlotStore,
    window: Duration,
    max_distinct: usize,
    predicate: Box<dyn ProximityPredicate>,
    listener: Option<EvictionListener>,
}

impl Default for UsageDecayExtractor {
    fn default() -> Self {
        Self::new(
            DEFAULT_CAPACITY,
            Duration::minutes(DEFAULT_WINDOW_MINUTES),
            DEFAULT_MAX_DISTINCT,
        )
    }
}

impl fmt::Debug for UsageDecayExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsageDecayExtractor")
            .field("store", &self.store)
            .field("window", &self.window)
            .field("max_distinct", &self.max_distinct)
            .finish()
    }
}

impl UsageDecayExtractor {
    pub fn new(capacity: usize, window: Duration, max_distinct: usize) -> Self {
        Self::with_store(LabelSlotStore::new(capacity), window, max_distinct)
    }

    fn with_store(store: LabelSlotStore, window: Duration, max_distinct: usize) -> Self {
        Self {
            store,
            window,
            max_distinct,
            predicate: Box::new(WithinWindow(window)),
            listener: None,
        }
    }

    /// Replace the default window predicate
    pub fn with_predicate(mut self, predicate: impl ProximityPredicate + 'static) -> Self {
        self.predicate = Box::new(predicate);
        self
    }

    pub fn store(&self) -> &LabelSlotStore {
        &self.store
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn max_distinct(&self) -> usize {
        self.max_distinct
    }

    /// Decode config and labels. Any unreadable part fails the whole
    /// extractor, since its slots are feature columns the ranker has learned.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PredictError> {
        let record: UsageDecayRecord = codec::decode(bytes)?;
        let capacity = record.capacity as usize;
        if capacity == 0 || capacity > MAX_CAPACITY {
            return Err(PredictError::CorruptState(format!(
                "{TAG} capacity {capacity} outside 1..={MAX_CAPACITY}"
            )));
        }
        let window = Duration::try_milliseconds(record.window_ms)
            .filter(|window| *window > Duration::zero())
            .ok_or_else(|| {
                PredictError::CorruptState(format!("{TAG} window {}ms", record.window_ms))
            })?;

        let store = LabelSlotStore::from_bytes(&record.store)?;
        if store.capacity() != capacity {
            return Err(PredictError::CorruptState(format!(
                "{TAG} store capacity {} does not match {capacity}",
                store.capacity()
            )));
        }
        Ok(Self::with_store(store, window, record.max_distinct as usize))
    }

    fn notify(&self, entry: SlotEntry) {
        debug!(label = %entry.label, slot = entry.slot, "usage slot released");
        if let Some(listener) = &self.listener {
            listener(&SlotEvicted {
                label: entry.label,
                feature_index: entry.slot,
            });
        }
    }
}

impl Extractor for UsageDecayExtractor {
    fn type_tag(&self) -> &'static str {
        TAG
    }

    fn capacity(&self) -> usize {
        self.store.capacity()
    }

    fn extract_into(&mut self, history: &[Event], context: &PredictionContext, out: &mut [f32]) {
        let mut marked: Vec<String> = Vec::with_capacity(self.max_distinct.min(history.len()));

        for event in history {
            if marked.len() >= self.max_distinct {
                break;
            }
            match self.predicate.classify(event.timestamp, context.now) {
                Proximity::Recent => {}
                Proximity::Ahead => continue,
                Proximity::Stale => break,
            }

            let label = event.app.to_string();
            if marked.contains(&label) {
                continue;
            }

            let (slot, evicted) = self
                .store
                .observe_evicting(&label, event.timestamp_millis());
            if let Some(entry) = evicted {
                self.notify(entry);
            }
            set_hot(out, slot);
            marked.push(label);
        }
    }

    fn to_bytes(&self) -> Result<Vec<u8>, PredictError> {
        codec::encode(&UsageDecayRecord {
            capacity: self.store.capacity() as u32,
            window_ms: self.window.num_milliseconds(),
            max_distinct: self.max_distinct as u32,
            store: self.store.to_bytes()?,
        })
    }

    /// With no patterns left every label is forgotten, otherwise labels
    /// matching the first pattern are
    fn prune(&mut self, patterns: &[PrunePattern]) -> usize {
        let removed = match patterns.first() {
            None => self.store.clear(),
            Some(pattern) => self.store.remove_matching(|label| pattern.matches(label)),
        };
        let count = removed.len();
        for entry in removed {
            self.notify(entry);
        }
        count
    }

    fn set_eviction_listener(&mut self, listener: EvictionListener) {
        self.listener = Some(listener);
    }

    fn describe(&self) -> ExtractorSummary {
        ExtractorSummary {
            tag: TAG.to_string(),
            capacity: self.capacity(),
            offset: 0,
            live_labels: Some(self.store.len()),
            children: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AppIdentifier;
    use chrono::TimeZone;
    use std::sync::{Arc, Mutex};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 9, 0, 0).unwrap()
    }

    fn launch(app: &str, minutes_ago: i64) -> Event {
        Event::at(app.parse().unwrap(), now() - Duration::minutes(minutes_ago))
    }

    fn hot_slots(vector: &[f32]) -> Vec<usize> {
        vector
            .iter()
            .enumerate()
            .filter(|(_, v)| **v == 1.0)
            .map(|(i, _)| i)
            .collect()
    }

    #[test]
    fn test_marks_distinct_recent_apps() {
        let mut extractor = UsageDecayExtractor::new(10, Duration::minutes(10), 2);
        let history = vec![
            launch("com.a/Main", 1),
            launch("com.a/Main", 2),
            launch("com.b/Main", 3),
            launch("com.c/Main", 4),
        ];
        let features = extractor.extract(&history, &PredictionContext::at(now()));

        assert_eq!(features.len(), 10);
        let a = extractor.store().slot_of("com.a/Main").unwrap();
        let b = extractor.store().slot_of("com.b/Main").unwrap();
        assert_eq!(hot_slots(&features), {
            let mut v = vec![a, b];
            v.sort();
            v
        });
        // max_distinct reached before com.c was scanned
        assert!(extractor.store().slot_of("com.c/Main").is_none());
    }

    #[test]
    fn test_presence_is_binary_not_a_count() {
        let mut extractor = UsageDecayExtractor::new(4, Duration::minutes(10), 2);
        let history = vec![
            launch("com.a/Main", 1),
            launch("com.a/Main", 2),
            launch("com.a/Main", 3),
        ];
        let features = extractor.extract(&history, &PredictionContext::at(now()));
        assert_eq!(features.iter().sum::<f32>(), 1.0);
    }

    #[test]
    fn test_stale_event_terminates_scan() {
        let mut extractor = UsageDecayExtractor::new(10, Duration::minutes(10), 3);
        // Out of order on purpose: a stale event between two recent ones
        let history = vec![
            launch("com.a/Main", 1),
            launch("com.old/Main", 30),
            launch("com.b/Main", 2),
        ];
        let features = extractor.extract(&history, &PredictionContext::at(now()));

        assert_eq!(hot_slots(&features).len(), 1);
        assert!(extractor.store().slot_of("com.b/Main").is_none());
        assert!(extractor.store().slot_of("com.old/Main").is_none());
    }

    #[test]
    fn test_future_event_is_skipped() {
        let mut extractor = UsageDecayExtractor::new(10, Duration::minutes(10), 2);
        let history = vec![launch("com.skew/Main", -5), launch("com.a/Main", 1)];
        let features = extractor.extract(&history, &PredictionContext::at(now()));

        assert_eq!(hot_slots(&features).len(), 1);
        assert!(extractor.store().slot_of("com.a/Main").is_some());
        assert!(extractor.store().slot_of("com.skew/Main").is_none());
    }

    #[test]
    fn test_observation_uses_event_timestamp() {
        let mut extractor = UsageDecayExtractor::new(10, Duration::minutes(10), 2);
        let event = launch("com.a/Main", 3);
        extractor.extract(std::slice::from_ref(&event), &PredictionContext::at(now()));
        assert_eq!(
            extractor.store().last_used("com.a/Main"),
            Some(event.timestamp_millis())
        );
    }

    #[test]
    fn test_custom_predicate() {
        struct Always;
        impl ProximityPredicate for Always {
            fn classify(&self, _: DateTime<Utc>, _: DateTime<Utc>) -> Proximity {
                Proximity::Recent
            }
        }

        let mut extractor =
            UsageDecayExtractor::new(10, Duration::minutes(10), 2).with_predicate(Always);
        let history = vec![launch("com.a/Main", 600)];
        let features = extractor.extract(&history, &PredictionContext::at(now()));
        assert_eq!(hot_slots(&features).len(), 1);
    }

    #[test]
    fn test_eviction_and_prune_notify_listener() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut extractor = UsageDecayExtractor::new(1, Duration::minutes(10), 1);
        extractor.set_eviction_listener(Arc::new(move |evicted: &SlotEvicted| {
            sink.lock().unwrap().push(evicted.clone());
        }));

        let ctx = PredictionContext::at(now());
        extractor.extract(&[launch("com.a/Main", 5)], &ctx);
        extractor.extract(&[launch("com.b/Main", 1)], &ctx);
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[SlotEvicted {
                label: "com.a/Main".to_string(),
                feature_index: 0
            }]
        );

        assert_eq!(extractor.prune(&[PrunePattern::package("com.b")]), 1);
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert!(extractor.store().is_empty());
    }

    #[test]
    fn test_prune_with_empty_path_forgets_everything() {
        let mut extractor = UsageDecayExtractor::new(4, Duration::minutes(10), 2);
        let ctx = PredictionContext::at(now());
        extractor.extract(&[launch("com.a/Main", 1), launch("com.b/Main", 2)], &ctx);
        assert_eq!(extractor.prune(&[]), 2);
        assert!(extractor.store().is_empty());
    }

    #[test]
    fn test_bytes_round_trip_keeps_config_and_labels() {
        let mut extractor = UsageDecayExtractor::new(8, Duration::minutes(7), 3);
        let ctx = PredictionContext::at(now());
        extractor.extract(&[launch("com.a/Main", 1)], &ctx);

        let loaded = UsageDecayExtractor::from_bytes(&extractor.to_bytes().unwrap()).unwrap();
        assert_eq!(loaded.capacity(), 8);
        assert_eq!(loaded.window(), Duration::minutes(7));
        assert_eq!(loaded.max_distinct(), 3);
        assert_eq!(loaded.store(), extractor.store());
    }

    fn record_bytes(capacity: u32, window_ms: i64, store: Vec<u8>) -> Vec<u8> {
        codec::encode(&UsageDecayRecord {
            capacity,
            window_ms,
            max_distinct: 2,
            store,
        })
        .unwrap()
    }

    #[test]
    fn test_out_of_range_window_is_corrupt() {
        let store = LabelSlotStore::new(4).to_bytes().unwrap();
        for window_ms in [i64::MIN, i64::MAX, 0, -5] {
            let bytes = record_bytes(4, window_ms, store.clone());
            assert!(
                matches!(UsageDecayExtractor::from_bytes(&bytes), Err(PredictError::CorruptState(_))),
                "accepted window {window_ms}"
            );
        }
    }

    #[test]
    fn test_oversized_capacity_is_corrupt() {
        let bytes = record_bytes(u32::MAX, 60_000, LabelSlotStore::new(4).to_bytes().unwrap());
        assert!(matches!(
            UsageDecayExtractor::from_bytes(&bytes),
            Err(PredictError::CorruptState(_))
        ));
    }

    #[test]
    fn test_unreadable_store_fails_the_extractor() {
        let bytes = record_bytes(4, 60_000, vec![1, 2, 3]);
        assert!(UsageDecayExtractor::from_bytes(&bytes).is_err());

        let mismatched = record_bytes(4, 60_000, LabelSlotStore::new(9).to_bytes().unwrap());
        assert!(matches!(
            UsageDecayExtractor::from_bytes(&mismatched),
            Err(PredictError::CorruptState(_))
        ));
    }

    #[test]
    fn test_identifier_profile_is_part_of_label() {
        let mut extractor = UsageDecayExtractor::new(4, Duration::minutes(10), 2);
        let work = AppIdentifier::app("com.a", "Main").with_profile(10);
        let history = vec![
            Event::at(work, now() - Duration::minutes(1)),
            launch("com.a/Main", 2),
        ];
        let features = extractor.extract(&history, &PredictionContext::at(now()));
        assert_eq!(hot_slots(&features).len(), 2);
    }
}
