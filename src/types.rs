//! Core data types
//!
//! This module defines the values that flow through the prediction engine:
//! app identifiers, historical launch events, the current prediction context
//! and ranked candidates.

use crate::error::PredictError;
use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Fixed-length feature vector produced by an extractor
pub type FeatureVector = Vec<f32>;

/// What an identifier points at on the home screen
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    App,
    Shortcut,
    Widget,
}

impl TargetKind {
    fn prefix(&self) -> Option<&'static str> {
        match self {
            TargetKind::App => None,
            TargetKind::Shortcut => Some("shortcut:"),
            TargetKind::Widget => Some("widget:"),
        }
    }
}

/// Immutable value identifying a launch target plus the user profile it belongs to.
///
/// The canonical string form is `package/target`, optionally prefixed with
/// `shortcut:` or `widget:` and suffixed with `#profile` for non-primary
/// profiles. A bare `package` is a package-level target.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AppIdentifier {
    pub kind: TargetKind,
    pub package: String,
    pub target: String,
    pub profile: u32,
}

impl AppIdentifier {
    /// Identifier for an activity in the primary profile
    pub fn app(package: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::App,
            package: package.into(),
            target: target.into(),
            profile: 0,
        }
    }

    /// Identifier for a pinned or deep shortcut
    pub fn shortcut(package: impl Into<String>, shortcut_id: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::Shortcut,
            package: package.into(),
            target: shortcut_id.into(),
            profile: 0,
        }
    }

    /// Same target in another user profile
    pub fn with_profile(mut self, profile: u32) -> Self {
        self.profile = profile;
        self
    }

    /// Whether this identifier belongs to the given package and profile
    pub fn belongs_to(&self, package: &str, profile: u32) -> bool {
        self.package == package && self.profile == profile
    }
}

impl fmt::Display for AppIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(prefix) = self.kind.prefix() {
            f.write_str(prefix)?;
        }
        f.write_str(&self.package)?;
        if !self.target.is_empty() {
            write!(f, "/{}", self.target)?;
        }
        if self.profile != 0 {
            write!(f, "#{}", self.profile)?;
        }
        Ok(())
    }
}

impl FromStr for AppIdentifier {
    type Err = PredictError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (kind, rest) = if let Some(rest) = trimmed.strip_prefix("shortcut:") {
            (TargetKind::Shortcut, rest)
        } else if let Some(rest) = trimmed.strip_prefix("widget:") {
            (TargetKind::Widget, rest)
        } else {
            (TargetKind::App, trimmed)
        };

        let (body, profile) = match rest.rsplit_once('#') {
            Some((body, profile)) => {
                let profile = profile
                    .parse::<u32>()
                    .map_err(|_| PredictError::InvalidIdentifier(s.to_string()))?;
                (body, profile)
            }
            None => (rest, 0),
        };

        let (package, target) = body.split_once('/').unwrap_or((body, ""));
        if package.is_empty() || package.contains(char::is_whitespace) {
            return Err(PredictError::InvalidIdentifier(s.to_string()));
        }

        Ok(Self {
            kind,
            package: package.to_string(),
            target: target.to_string(),
            profile,
        })
    }
}

impl TryFrom<String> for AppIdentifier {
    type Error = PredictError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AppIdentifier> for String {
    fn from(value: AppIdentifier) -> Self {
        value.to_string()
    }
}

/// Audio output state at the time of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadsetState {
    #[default]
    Disconnected,
    Wired,
    Bluetooth,
}

impl HeadsetState {
    pub fn is_connected(&self) -> bool {
        !matches!(self, HeadsetState::Disconnected)
    }
}

/// A historical launch event, read-only once recorded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub app: AppIdentifier,
    pub timestamp: DateTime<Utc>,
    /// Day of week, 0 = Monday
    pub day_of_week: u8,
    /// Hour of day, 0-23
    pub hour_of_day: u8,
    #[serde(default)]
    pub headset: HeadsetState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lng: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub place_id: Option<String>,
}

impl Event {
    /// Event with day and hour derived from the timestamp and no other context
    pub fn at(app: AppIdentifier, timestamp: DateTime<Utc>) -> Self {
        Self {
            app,
            timestamp,
            day_of_week: timestamp.weekday().num_days_from_monday() as u8,
            hour_of_day: timestamp.hour() as u8,
            headset: HeadsetState::Disconnected,
            lat: None,
            lng: None,
            place_id: None,
        }
    }

    pub fn with_headset(mut self, headset: HeadsetState) -> Self {
        self.headset = headset;
        self
    }

    pub fn with_location(mut self, lat: f64, lng: f64) -> Self {
        self.lat = Some(lat);
        self.lng = Some(lng);
        self
    }

    pub fn with_place(mut self, place_id: impl Into<String>) -> Self {
        self.place_id = Some(place_id.into());
        self
    }

    /// Timestamp in epoch milliseconds, the unit used by the slot store
    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}

/// The device context a prediction is computed for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionContext {
    pub now: DateTime<Utc>,
    pub day_of_week: u8,
    pub hour_of_day: u8,
    #[serde(default)]
    pub headset: HeadsetState,
    /// When the current headset connection was established
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headset_connected_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lng: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub place_id: Option<String>,
}

impl PredictionContext {
    /// Context with day and hour derived from `now` and no device signals
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now,
            day_of_week: now.weekday().num_days_from_monday() as u8,
            hour_of_day: now.hour() as u8,
            headset: HeadsetState::Disconnected,
            headset_connected_at: None,
            lat: None,
            lng: None,
            place_id: None,
        }
    }

    /// The context a launch happened in, used when learning from that launch
    pub fn from_event(event: &Event) -> Self {
        Self {
            now: event.timestamp,
            day_of_week: event.day_of_week,
            hour_of_day: event.hour_of_day,
            headset: event.headset,
            headset_connected_at: None,
            lat: event.lat,
            lng: event.lng,
            place_id: event.place_id.clone(),
        }
    }

    pub fn with_headset(mut self, headset: HeadsetState, connected_at: Option<DateTime<Utc>>) -> Self {
        self.headset = headset;
        self.headset_connected_at = connected_at;
        self
    }

    pub fn with_location(mut self, lat: f64, lng: f64) -> Self {
        self.lat = Some(lat);
        self.lng = Some(lng);
        self
    }

    pub fn with_place(mut self, place_id: impl Into<String>) -> Self {
        self.place_id = Some(place_id.into());
        self
    }

    /// Whether a headset was connected no longer than `window` ago
    pub fn headset_connected_within(&self, window: Duration) -> bool {
        match (self.headset.is_connected(), self.headset_connected_at) {
            (true, Some(at)) => {
                let age = self.now - at;
                age >= Duration::zero() && age <= window
            }
            _ => false,
        }
    }

    pub fn now_millis(&self) -> i64 {
        self.now.timestamp_millis()
    }
}

/// A ranked prediction; filters may reorder, add or drop candidates but never
/// change an identifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionCandidate {
    pub app: AppIdentifier,
    pub score: f32,
}

impl PredictionCandidate {
    pub fn new(app: AppIdentifier, score: f32) -> Self {
        Self { app, score }
    }
}
