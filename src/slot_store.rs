//! Bounded label-to-slot store
//!
//! Maps opaque string labels onto a fixed range of array slots `[0, capacity)`.
//! New labels take the lowest free slot; once the store is full the least
//! recently used label is evicted and its slot handed to the newcomer.
//!
//! The store does no locking. It is owned by a single writer (see
//! [`crate::worker`]).

use crate::codec::{self, SlotStoreRecord};
use crate::error::PredictError;
use std::collections::{BTreeSet, HashMap};
use tracing::warn;

/// Largest capacity a store may be built with or decoded at
pub const MAX_CAPACITY: usize = 1 << 16;

/// A live label and its slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotEntry {
    pub label: String,
    pub slot: usize,
    pub last_used: i64,
}

/// Fixed-capacity label store with least-recently-used eviction.
///
/// Eviction picks the minimum `(last_used, slot)` pair, so when several labels
/// share the oldest timestamp the one in the lowest slot goes first.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelSlotStore {
    capacity: usize,
    labels: HashMap<String, usize>,
    /// Indexed by slot; `None` marks a free slot
    slots: Vec<Option<SlotEntry>>,
    /// `(last_used, slot)` for every live entry
    recency: BTreeSet<(i64, usize)>,
}

impl LabelSlotStore {
    /// Create an empty store. A zero capacity is bumped to one so that
    /// eviction on a full store always has a victim.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            labels: HashMap::with_capacity(capacity),
            slots: vec![None; capacity],
            recency: BTreeSet::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of live labels
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.labels.len() >= self.capacity
    }

    pub fn slot_of(&self, label: &str) -> Option<usize> {
        self.labels.get(label).copied()
    }

    pub fn last_used(&self, label: &str) -> Option<i64> {
        self.slot_of(label)
            .and_then(|slot| self.slots[slot].as_ref())
            .map(|entry| entry.last_used)
    }

    /// Live entries in slot order
    pub fn entries(&self) -> impl Iterator<Item = &SlotEntry> {
        self.slots.iter().flatten()
    }

    /// Free slots in ascending order
    pub fn free_slots(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.is_none())
            .map(|(slot, _)| slot)
            .collect()
    }

    /// Record a use of `label` at `timestamp` and return its slot
    pub fn observe(&mut self, label: &str, timestamp: i64) -> usize {
        self.observe_evicting(label, timestamp).0
    }

    /// Like [`observe`](Self::observe), also returning the entry that was
    /// evicted to make room, if any
    pub fn observe_evicting(&mut self, label: &str, timestamp: i64) -> (usize, Option<SlotEntry>) {
        if let Some(&slot) = self.labels.get(label) {
            self.touch(slot, timestamp);
            return (slot, None);
        }

        let (slot, evicted) = match self.lowest_free_slot() {
            Some(slot) => (slot, None),
            None => {
                let evicted = self.evict_oldest();
                (evicted.slot, Some(evicted))
            }
        };

        self.labels.insert(label.to_string(), slot);
        self.slots[slot] = Some(SlotEntry {
            label: label.to_string(),
            slot,
            last_used: timestamp,
        });
        self.recency.insert((timestamp, slot));
        (slot, evicted)
    }

    /// Explicitly evict `label` without replacement
    pub fn remove(&mut self, label: &str) -> Option<SlotEntry> {
        let slot = self.labels.remove(label)?;
        let entry = self.slots[slot].take()?;
        self.recency.remove(&(entry.last_used, slot));
        Some(entry)
    }

    /// Evict every label matching `predicate`, returning what was removed
    pub fn remove_matching<F>(&mut self, mut predicate: F) -> Vec<SlotEntry>
    where
        F: FnMut(&str) -> bool,
    {
        let doomed: Vec<String> = self
            .entries()
            .filter(|entry| predicate(&entry.label))
            .map(|entry| entry.label.clone())
            .collect();
        doomed.iter().filter_map(|label| self.remove(label)).collect()
    }

    /// Evict everything
    pub fn clear(&mut self) -> Vec<SlotEntry> {
        self.remove_matching(|_| true)
    }

    fn touch(&mut self, slot: usize, timestamp: i64) {
        if let Some(entry) = self.slots[slot].as_mut() {
            self.recency.remove(&(entry.last_used, slot));
            entry.last_used = timestamp;
            self.recency.insert((timestamp, slot));
        }
    }

    fn lowest_free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|entry| entry.is_none())
    }

    fn evict_oldest(&mut self) -> SlotEntry {
        if let Some((_, slot)) = self.recency.pop_first() {
            if let Some(entry) = self.slots[slot].take() {
                self.labels.remove(&entry.label);
                return entry;
            }
        }

        // Recency index out of sync with the slots. Reclaim slot 0 and rebuild.
        debug_assert!(false, "recency index out of sync with slots");
        let entry = self.slots[0].take().unwrap_or(SlotEntry {
            label: String::new(),
            slot: 0,
            last_used: i64::MIN,
        });
        self.labels.retain(|_, slot| *slot != 0);
        self.recency = self
            .entries()
            .map(|entry| (entry.last_used, entry.slot))
            .collect();
        entry
    }

    /// Encode as `[capacity][labels][timestamps]`
    pub fn to_bytes(&self) -> Result<Vec<u8>, PredictError> {
        codec::encode(&self.to_record())
    }

    pub fn to_record(&self) -> SlotStoreRecord {
        SlotStoreRecord {
            capacity: self.capacity as u32,
            labels: self
                .entries()
                .map(|entry| (entry.label.clone(), entry.slot as u32))
                .collect(),
            timestamps: self
                .entries()
                .map(|entry| (entry.slot as u32, entry.last_used))
                .collect(),
        }
    }

    /// Decode a store; malformed blobs are an error
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PredictError> {
        let record: SlotStoreRecord = codec::decode(bytes)?;
        Self::from_record(record)
    }

    /// Rebuild a store; the used/free map is derived from the label entries.
    ///
    /// Entries pointing outside the capacity or at an already-claimed slot are
    /// programmer errors: they trip an assertion in debug builds and are
    /// skipped otherwise.
    pub fn from_record(record: SlotStoreRecord) -> Result<Self, PredictError> {
        if record.capacity == 0 {
            return Err(PredictError::CorruptState(
                "slot store capacity is zero".to_string(),
            ));
        }
        if record.capacity as usize > MAX_CAPACITY {
            return Err(PredictError::CorruptState(format!(
                "slot store capacity {} exceeds {MAX_CAPACITY}",
                record.capacity
            )));
        }
        if record.labels.len() > record.capacity as usize {
            return Err(PredictError::CorruptState(format!(
                "{} labels exceed capacity {}",
                record.labels.len(),
                record.capacity
            )));
        }

        let mut store = Self::new(record.capacity as usize);
        let timestamps: HashMap<u32, i64> = record.timestamps.into_iter().collect();

        for (label, slot) in record.labels {
            let index = slot as usize;
            let valid = index < store.capacity
                && store.slots[index].is_none()
                && !store.labels.contains_key(&label);
            debug_assert!(valid, "invalid slot entry {label} -> {slot}");
            if !valid {
                warn!(%label, slot, "skipping invalid slot entry");
                continue;
            }

            let last_used = timestamps.get(&slot).copied().unwrap_or_else(|| {
                warn!(%label, slot, "slot has no timestamp, treating as oldest");
                0
            });
            store.labels.insert(label.clone(), index);
            store.slots[index] = Some(SlotEntry {
                label,
                slot: index,
                last_used,
            });
            store.recency.insert((last_used, index));
        }

        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_scenario_capacity_two_evicts_oldest() {
        let mut store = LabelSlotStore::new(2);
        store.observe("X", 100);
        store.observe("Y", 200);
        let (_, evicted) = store.observe_evicting("Z", 300);

        assert_eq!(evicted.map(|e| e.label), Some("X".to_string()));
        assert_eq!(store.slot_of("X"), None);
        assert!(store.slot_of("Y").is_some());
        assert!(store.slot_of("Z").is_some());
        assert_eq!(store.len(), 2);
        // Z reuses the slot X freed
        assert_eq!(store.slot_of("Z"), Some(0));
    }

    #[test]
    fn test_new_labels_take_lowest_free_slot() {
        let mut store = LabelSlotStore::new(4);
        assert_eq!(store.observe("a", 1), 0);
        assert_eq!(store.observe("b", 2), 1);
        assert_eq!(store.observe("c", 3), 2);
        store.remove("a");
        assert_eq!(store.observe("d", 4), 0);
        assert_eq!(store.free_slots(), vec![3]);
    }

    #[test]
    fn test_reobserve_refreshes_recency_but_keeps_slot() {
        let mut store = LabelSlotStore::new(2);
        let slot = store.observe("X", 100);
        store.observe("Y", 200);
        assert_eq!(store.observe("X", 300), slot);
        assert_eq!(store.last_used("X"), Some(300));

        // Y is now the oldest
        let (_, evicted) = store.observe_evicting("Z", 400);
        assert_eq!(evicted.unwrap().label, "Y");
        assert_eq!(store.slot_of("X"), Some(slot));
    }

    #[test]
    fn test_tie_break_evicts_lowest_slot() {
        let mut store = LabelSlotStore::new(3);
        store.observe("a", 50);
        store.observe("b", 10);
        store.observe("c", 10);
        let (slot, evicted) = store.observe_evicting("d", 60);
        assert_eq!(evicted.unwrap().label, "b");
        assert_eq!(slot, 1);
    }

    #[test]
    fn test_remove_frees_slot() {
        let mut store = LabelSlotStore::new(2);
        store.observe("X", 1);
        let removed = store.remove("X").unwrap();
        assert_eq!(removed.slot, 0);
        assert!(store.is_empty());
        assert_eq!(store.free_slots(), vec![0, 1]);
        assert!(store.remove("X").is_none());
    }

    #[test]
    fn test_remove_matching() {
        let mut store = LabelSlotStore::new(4);
        store.observe("com.a/Main", 1);
        store.observe("com.a/Settings", 2);
        store.observe("com.b/Main", 3);
        let removed = store.remove_matching(|label| label.starts_with("com.a/"));
        assert_eq!(removed.len(), 2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.slot_of("com.b/Main"), Some(2));
    }

    #[test]
    fn test_zero_capacity_is_bumped() {
        let mut store = LabelSlotStore::new(0);
        assert_eq!(store.capacity(), 1);
        store.observe("a", 1);
        store.observe("b", 2);
        assert_eq!(store.slot_of("b"), Some(0));
    }

    #[test]
    fn test_bytes_round_trip() {
        let mut store = LabelSlotStore::new(5);
        store.observe("com.a/Main", 100);
        store.observe("com.b/Main", 200);
        store.observe("com.c/Main", 300);
        store.remove("com.b/Main");

        let bytes = store.to_bytes().unwrap();
        let loaded = LabelSlotStore::from_bytes(&bytes).unwrap();

        assert_eq!(loaded, store);
        assert_eq!(loaded.free_slots(), vec![1, 3, 4]);
        assert_eq!(loaded.last_used("com.c/Main"), Some(300));
    }

    #[test]
    fn test_malformed_blob_is_an_error() {
        assert!(matches!(
            LabelSlotStore::from_bytes(&[1, 2, 3]),
            Err(PredictError::Decode(_))
        ));
    }

    #[test]
    fn test_oversized_capacity_rejected_before_allocating() {
        let record = SlotStoreRecord {
            capacity: u32::MAX,
            labels: vec![],
            timestamps: vec![],
        };
        assert!(matches!(
            LabelSlotStore::from_record(record),
            Err(PredictError::CorruptState(_))
        ));
    }

    #[test]
    fn test_record_with_too_many_labels_is_corrupt() {
        let record = SlotStoreRecord {
            capacity: 1,
            labels: vec![("a".to_string(), 0), ("b".to_string(), 1)],
            timestamps: vec![],
        };
        assert!(matches!(
            LabelSlotStore::from_record(record),
            Err(PredictError::CorruptState(_))
        ));
    }

    #[test]
    fn test_missing_timestamp_makes_entry_oldest() {
        let record = SlotStoreRecord {
            capacity: 2,
            labels: vec![("a".to_string(), 0), ("b".to_string(), 1)],
            timestamps: vec![(0, 500)],
        };
        let mut store = LabelSlotStore::from_record(record).unwrap();
        let (_, evicted) = store.observe_evicting("c", 600);
        assert_eq!(evicted.unwrap().label, "b");
    }
}
