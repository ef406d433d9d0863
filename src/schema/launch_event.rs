//! launch.event.v1 schema definition
//!
//! One record per line of a usage log: app launches, plus the package
//! lifecycle events that change what can be predicted.

use crate::types::{AppIdentifier, HeadsetState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current schema version
pub const SCHEMA_VERSION: &str = "launch.event.v1";

/// What happened
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    #[default]
    Launch,
    /// Package installed or updated; only the package and profile of `app` matter
    PackageChanged,
    PackageRemoved,
}

/// Device context at the time of the event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceContext {
    #[serde(default)]
    pub headset: HeadsetState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lng: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub place_id: Option<String>,
}

/// The launch.event.v1 record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchEvent {
    /// Schema version identifier
    pub schema_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    /// Event timestamp (UTC)
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub kind: EventKind,
    /// Identifier string, e.g. `com.a/.Main` or `shortcut:com.a/compose#10`
    pub app: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<DeviceContext>,
}

impl LaunchEvent {
    /// A launch event with a fresh id
    pub fn launch(app: &AppIdentifier, timestamp: DateTime<Utc>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            event_id: Some(uuid::Uuid::new_v4().to_string()),
            timestamp,
            kind: EventKind::Launch,
            app: app.to_string(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: DeviceContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Parsed identifier
    pub fn app_identifier(&self) -> Result<AppIdentifier, ValidationError> {
        self.app
            .parse()
            .map_err(|_| ValidationError::InvalidApp(self.app.clone()))
    }

    /// Check the record on its own
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(ValidationError::InvalidSchemaVersion {
                expected: SCHEMA_VERSION.to_string(),
                actual: self.schema_version.clone(),
            });
        }

        self.app_identifier()?;

        if let Some(context) = &self.context {
            match (context.lat, context.lng) {
                (Some(lat), Some(lng)) => {
                    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
                        return Err(ValidationError::InvalidLocation { lat, lng });
                    }
                }
                (None, None) => {}
                _ => return Err(ValidationError::PartialLocation),
            }
            if matches!(&context.place_id, Some(place) if place.trim().is_empty()) {
                return Err(ValidationError::EmptyPlace);
            }
        }
        Ok(())
    }
}

/// Validation errors for launch events
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid schema version: expected {expected}, got {actual}")]
    InvalidSchemaVersion { expected: String, actual: String },

    #[error("Invalid app identifier: {0}")]
    InvalidApp(String),

    #[error("Location out of range: ({lat}, {lng})")]
    InvalidLocation { lat: f64, lng: f64 },

    #[error("Location needs both lat and lng")]
    PartialLocation,

    #[error("Place id is empty")]
    EmptyPlace,

    #[error("Event at {timestamp} is earlier than the previous event at {previous}")]
    OutOfOrder {
        previous: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 9, 30, 0).unwrap()
    }

    #[test]
    fn test_deserialize_minimal_launch() {
        let json = r#"{"schema_version":"launch.event.v1","timestamp":"2024-06-01T09:30:00Z","app":"com.a/.Main"}"#;
        let event: LaunchEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.kind, EventKind::Launch);
        assert!(event.context.is_none());
        assert!(event.validate().is_ok());
        assert_eq!(event.app_identifier().unwrap().target, ".Main");
    }

    #[test]
    fn test_serialize_round_trip() {
        let app: AppIdentifier = "com.a/Main#10".parse().unwrap();
        let event = LaunchEvent::launch(&app, ts()).with_context(DeviceContext {
            headset: HeadsetState::Bluetooth,
            lat: Some(47.37),
            lng: Some(8.54),
            place_id: Some("work".to_string()),
        });
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"launch\""));
        assert!(json.contains("\"headset\":\"bluetooth\""));
        let parsed: LaunchEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_validation_errors() {
        let app: AppIdentifier = "com.a/Main".parse().unwrap();
        let mut event = LaunchEvent::launch(&app, ts());
        event.schema_version = "launch.event.v0".to_string();
        assert!(matches!(event.validate(), Err(ValidationError::InvalidSchemaVersion { .. })));

        let mut event = LaunchEvent::launch(&app, ts());
        event.app = "com.a/Main#x".to_string();
        assert_eq!(event.validate(), Err(ValidationError::InvalidApp("com.a/Main#x".to_string())));

        let event = LaunchEvent::launch(&app, ts()).with_context(DeviceContext {
            lat: Some(91.0),
            lng: Some(0.0),
            ..Default::default()
        });
        assert!(matches!(event.validate(), Err(ValidationError::InvalidLocation { .. })));

        let event = LaunchEvent::launch(&app, ts()).with_context(DeviceContext {
            lat: Some(10.0),
            ..Default::default()
        });
        assert_eq!(event.validate(), Err(ValidationError::PartialLocation));
    }
}
