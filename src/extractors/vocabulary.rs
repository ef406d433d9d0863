//! Fixed-vocabulary context extractors
//!
//! These carry no learned state: each maps the current context onto a small
//! one-hot (or multi-hot) vector. Only configuration is persisted, so that a
//! restored aggregator keeps the same layout.

use super::{set_hot, Extractor};
use crate::codec;
use crate::error::PredictError;
use crate::types::{Event, HeadsetState, PredictionContext};
use chrono::Duration;
use serde::{Deserialize, Serialize};

pub const DAY_TAG: &str = "day_of_week";
pub const HOUR_TAG: &str = "hour_of_day";
pub const HEADSET_TAG: &str = "headset";
pub const GEO_TAG: &str = "geo_bucket";
pub const PLACE_TAG: &str = "place";

/// How long after connecting a headset counts as "just connected"
pub const DEFAULT_HEADSET_RECENT_SECS: i64 = 120;

/// Default geo grid cell edge, roughly 1 km of latitude
pub const DEFAULT_GEO_CELL_DEGREES: f64 = 0.01;

/// Default number of geo buckets
pub const DEFAULT_GEO_BUCKETS: usize = 32;

/// Largest accepted number of geo buckets
pub const MAX_GEO_BUCKETS: usize = 4096;

#[derive(Debug, Serialize, Deserialize)]
struct FixedRecord {
    capacity: u32,
}

fn encode_fixed(capacity: usize) -> Result<Vec<u8>, PredictError> {
    codec::encode(&FixedRecord {
        capacity: capacity as u32,
    })
}

fn check_fixed(bytes: &[u8], tag: &str, expected: usize) -> Result<(), PredictError> {
    let record: FixedRecord = codec::decode(bytes)?;
    if record.capacity as usize != expected {
        return Err(PredictError::CorruptState(format!(
            "{tag} capacity {} does not match {expected}",
            record.capacity
        )));
    }
    Ok(())
}

/// One-hot day of week, Monday first
#[derive(Debug, Clone, Copy, Default)]
pub struct DayOfWeekExtractor;

impl DayOfWeekExtractor {
    pub const CAPACITY: usize = 7;

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PredictError> {
        check_fixed(bytes, DAY_TAG, Self::CAPACITY)?;
        Ok(Self)
    }
}

impl Extractor for DayOfWeekExtractor {
    fn type_tag(&self) -> &'static str {
        DAY_TAG
    }

    fn capacity(&self) -> usize {
        Self::CAPACITY
    }

    fn extract_into(&mut self, _history: &[Event], context: &PredictionContext, out: &mut [f32]) {
        set_hot(out, context.day_of_week as usize);
    }

    fn to_bytes(&self) -> Result<Vec<u8>, PredictError> {
        encode_fixed(Self::CAPACITY)
    }
}

/// One-hot hour of day
#[derive(Debug, Clone, Copy, Default)]
pub struct HourOfDayExtractor;

impl HourOfDayExtractor {
    pub const CAPACITY: usize = 24;

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PredictError> {
        check_fixed(bytes, HOUR_TAG, Self::CAPACITY)?;
        Ok(Self)
    }
}

impl Extractor for HourOfDayExtractor {
    fn type_tag(&self) -> &'static str {
        HOUR_TAG
    }

    fn capacity(&self) -> usize {
        Self::CAPACITY
    }

    fn extract_into(&mut self, _history: &[Event], context: &PredictionContext, out: &mut [f32]) {
        set_hot(out, context.hour_of_day as usize);
    }

    fn to_bytes(&self) -> Result<Vec<u8>, PredictError> {
        encode_fixed(Self::CAPACITY)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct HeadsetRecord {
    recent_ms: i64,
}

/// Headset state: one-hot over disconnected / wired / bluetooth, plus a
/// fourth bit set while the connection is fresh
#[derive(Debug, Clone, Copy)]
pub struct HeadsetExtractor {
    recent: Duration,
}

impl Default for HeadsetExtractor {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_HEADSET_RECENT_SECS))
    }
}

impl HeadsetExtractor {
    pub const CAPACITY: usize = 4;

    pub fn new(recent: Duration) -> Self {
        Self { recent }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PredictError> {
        let record: HeadsetRecord = codec::decode(bytes)?;
        let recent = Duration::try_milliseconds(record.recent_ms)
            .filter(|recent| *recent >= Duration::zero())
            .ok_or_else(|| {
                PredictError::CorruptState(format!("{HEADSET_TAG} window {}ms", record.recent_ms))
            })?;
        Ok(Self::new(recent))
    }
}

impl Extractor for HeadsetExtractor {
    fn type_tag(&self) -> &'static str {
        HEADSET_TAG
    }

    fn capacity(&self) -> usize {
        Self::CAPACITY
    }

    fn extract_into(&mut self, _history: &[Event], context: &PredictionContext, out: &mut [f32]) {
        let index = match context.headset {
            HeadsetState::Disconnected => 0,
            HeadsetState::Wired => 1,
            HeadsetState::Bluetooth => 2,
        };
        set_hot(out, index);
        if context.headset_connected_within(self.recent) {
            set_hot(out, 3);
        }
    }

    fn to_bytes(&self) -> Result<Vec<u8>, PredictError> {
        codec::encode(&HeadsetRecord {
            recent_ms: self.recent.num_milliseconds(),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct GeoRecord {
    cell_degrees: f64,
    buckets: u32,
}

/// Hashes the grid cell containing the current location into a fixed number
/// of buckets. Unknown location leaves the vector empty.
#[derive(Debug, Clone, Copy)]
pub struct GeoBucketExtractor {
    cell_degrees: f64,
    buckets: usize,
}

impl Default for GeoBucketExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_GEO_CELL_DEGREES, DEFAULT_GEO_BUCKETS)
    }
}

impl GeoBucketExtractor {
    pub fn new(cell_degrees: f64, buckets: usize) -> Self {
        let cell_degrees = if cell_degrees.is_finite() && cell_degrees > 0.0 {
            cell_degrees
        } else {
            DEFAULT_GEO_CELL_DEGREES
        };
        Self {
            cell_degrees,
            buckets: buckets.max(1),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PredictError> {
        let record: GeoRecord = codec::decode(bytes)?;
        let buckets = record.buckets as usize;
        if buckets == 0 || buckets > MAX_GEO_BUCKETS {
            return Err(PredictError::CorruptState(format!(
                "{GEO_TAG} buckets {buckets} outside 1..={MAX_GEO_BUCKETS}"
            )));
        }
        Ok(Self::new(record.cell_degrees, buckets))
    }

    /// Bucket for a location, or `None` when it is not a valid coordinate
    pub fn bucket(&self, lat: f64, lng: f64) -> Option<usize> {
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
            return None;
        }
        let lat_cell = (lat / self.cell_degrees).floor() as i64;
        let lng_cell = (lng / self.cell_degrees).floor() as i64;
        let mixed = splitmix64((lat_cell as u64).rotate_left(32) ^ lng_cell as u64);
        Some((mixed % self.buckets as u64) as usize)
    }
}

fn splitmix64(seed: u64) -> u64 {
    let mut z = seed.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

impl Extractor for GeoBucketExtractor {
    fn type_tag(&self) -> &'static str {
        GEO_TAG
    }

    fn capacity(&self) -> usize {
        self.buckets
    }

    fn extract_into(&mut self, _history: &[Event], context: &PredictionContext, out: &mut [f32]) {
        if let (Some(lat), Some(lng)) = (context.lat, context.lng) {
            if let Some(bucket) = self.bucket(lat, lng) {
                set_hot(out, bucket);
            }
        }
    }

    fn to_bytes(&self) -> Result<Vec<u8>, PredictError> {
        codec::encode(&GeoRecord {
            cell_degrees: self.cell_degrees,
            buckets: self.buckets as u32,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PlaceRecord {
    places: Vec<String>,
}

/// One-hot over a configured list of place ids, with a trailing slot for any
/// other place. No place leaves the vector empty.
#[derive(Debug, Clone, Default)]
pub struct PlaceExtractor {
    places: Vec<String>,
}

impl PlaceExtractor {
    pub fn new(places: Vec<String>) -> Self {
        let mut unique: Vec<String> = Vec::with_capacity(places.len());
        for place in places {
            if !unique.contains(&place) {
                unique.push(place);
            }
        }
        Self { places: unique }
    }

    pub fn places(&self) -> &[String] {
        &self.places
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PredictError> {
        let record: PlaceRecord = codec::decode(bytes)?;
        Ok(Self::new(record.places))
    }
}

impl Extractor for PlaceExtractor {
    fn type_tag(&self) -> &'static str {
        PLACE_TAG
    }

    fn capacity(&self) -> usize {
        self.places.len() + 1
    }

    fn extract_into(&mut self, _history: &[Event], context: &PredictionContext, out: &mut [f32]) {
        if let Some(place) = &context.place_id {
            let index = self
                .places
                .iter()
                .position(|known| known == place)
                .unwrap_or(self.places.len());
            set_hot(out, index);
        }
    }

    fn to_bytes(&self) -> Result<Vec<u8>, PredictError> {
        codec::encode(&PlaceRecord {
            places: self.places.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn context() -> PredictionContext {
        // Wednesday 2024-01-17, 18:xx
        PredictionContext::at(Utc.with_ymd_and_hms(2024, 1, 17, 18, 5, 0).unwrap())
    }

    #[test]
    fn test_day_one_hot() {
        let features = DayOfWeekExtractor.extract(&[], &context());
        assert_eq!(features, vec![0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_hour_one_hot() {
        let features = HourOfDayExtractor.extract(&[], &context());
        assert_eq!(features.len(), 24);
        assert_eq!(features[18], 1.0);
        assert_eq!(features.iter().sum::<f32>(), 1.0);
    }

    #[test]
    fn test_headset_multi_hot() {
        let ctx = context();
        let mut extractor = HeadsetExtractor::default();

        assert_eq!(extractor.extract(&[], &ctx), vec![1.0, 0.0, 0.0, 0.0]);

        let fresh = ctx
            .clone()
            .with_headset(HeadsetState::Bluetooth, Some(ctx.now - Duration::seconds(10)));
        assert_eq!(extractor.extract(&[], &fresh), vec![0.0, 0.0, 1.0, 1.0]);

        let settled = ctx
            .clone()
            .with_headset(HeadsetState::Wired, Some(ctx.now - Duration::minutes(30)));
        assert_eq!(extractor.extract(&[], &settled), vec![0.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_geo_bucket_is_stable_and_local() {
        let mut extractor = GeoBucketExtractor::default();
        let here = context().with_location(47.3769, 8.5417);
        let a = extractor.extract(&[], &here);
        let b = extractor.extract(&[], &here);
        assert_eq!(a, b);
        assert_eq!(a.iter().sum::<f32>(), 1.0);

        // Same cell, a few metres away
        let nearby = context().with_location(47.3771, 8.5419);
        assert_eq!(extractor.extract(&[], &nearby), a);
    }

    #[test]
    fn test_geo_unknown_location_is_empty() {
        let mut extractor = GeoBucketExtractor::default();
        let features = extractor.extract(&[], &context());
        assert!(features.iter().all(|v| *v == 0.0));

        let invalid = context().with_location(123.0, 8.0);
        assert!(extractor.extract(&[], &invalid).iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_place_vocabulary_with_other_slot() {
        let mut extractor =
            PlaceExtractor::new(vec!["home".to_string(), "work".to_string(), "home".to_string()]);
        assert_eq!(extractor.capacity(), 3);

        let at_work = context().with_place("work");
        assert_eq!(extractor.extract(&[], &at_work), vec![0.0, 1.0, 0.0]);

        let gym = context().with_place("gym");
        assert_eq!(extractor.extract(&[], &gym), vec![0.0, 0.0, 1.0]);

        assert_eq!(extractor.extract(&[], &context()), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_config_survives_bytes() {
        let geo = GeoBucketExtractor::new(0.05, 16);
        let loaded = GeoBucketExtractor::from_bytes(&geo.to_bytes().unwrap()).unwrap();
        assert_eq!(loaded.capacity(), 16);

        let place = PlaceExtractor::new(vec!["home".to_string()]);
        let loaded = PlaceExtractor::from_bytes(&place.to_bytes().unwrap()).unwrap();
        assert_eq!(loaded.places(), place.places());

        let headset = HeadsetExtractor::new(Duration::seconds(90));
        let loaded = HeadsetExtractor::from_bytes(&headset.to_bytes().unwrap()).unwrap();
        assert_eq!(loaded.recent, Duration::seconds(90));
    }

    #[test]
    fn test_fixed_capacity_mismatch_is_corrupt() {
        let bytes = encode_fixed(8).unwrap();
        assert!(matches!(
            DayOfWeekExtractor::from_bytes(&bytes),
            Err(PredictError::CorruptState(_))
        ));
    }

    #[test]
    fn test_out_of_range_headset_window_is_corrupt() {
        for recent_ms in [i64::MIN, i64::MAX, -1] {
            let bytes = codec::encode(&HeadsetRecord { recent_ms }).unwrap();
            assert!(
                matches!(HeadsetExtractor::from_bytes(&bytes), Err(PredictError::CorruptState(_))),
                "accepted {recent_ms}"
            );
        }
    }

    #[test]
    fn test_oversized_geo_buckets_are_corrupt() {
        for buckets in [0, u32::MAX] {
            let bytes = codec::encode(&GeoRecord {
                cell_degrees: 0.01,
                buckets,
            })
            .unwrap();
            assert!(matches!(
                GeoBucketExtractor::from_bytes(&bytes),
                Err(PredictError::CorruptState(_))
            ));
        }
    }
}
