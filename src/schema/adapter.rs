//! Adapter for turning launch.event.v1 records into engine inputs

use crate::error::PredictError;
use crate::schema::launch_event::*;
use crate::types::Event;
use chrono::{DateTime, Utc};

/// A validated log record, ready to feed the engine
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayStep {
    Launch(Event),
    PackageChanged {
        package: String,
        profile: u32,
        at: DateTime<Utc>,
    },
    PackageRemoved {
        package: String,
        profile: u32,
        at: DateTime<Utc>,
    },
}

impl ReplayStep {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            ReplayStep::Launch(event) => event.timestamp,
            ReplayStep::PackageChanged { at, .. } | ReplayStep::PackageRemoved { at, .. } => *at,
        }
    }
}

/// Parses and converts launch logs
pub struct LaunchEventAdapter;

impl LaunchEventAdapter {
    /// Parse a JSON array of events
    pub fn parse_array(json: &str) -> Result<Vec<LaunchEvent>, PredictError> {
        let events: Vec<LaunchEvent> = serde_json::from_str(json)?;
        Ok(events)
    }

    /// Parse NDJSON; blank lines are skipped
    pub fn parse_ndjson(ndjson: &str) -> Result<Vec<LaunchEvent>, PredictError> {
        let mut events = Vec::new();
        for (line_num, line) in ndjson.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let event = serde_json::from_str::<LaunchEvent>(trimmed).map_err(|e| {
                PredictError::Parse(format!("Failed to parse line {}: {}", line_num + 1, e))
            })?;
            events.push(event);
        }
        Ok(events)
    }

    /// Parse either form, deciding by the first non-blank character
    pub fn parse(input: &str) -> Result<Vec<LaunchEvent>, PredictError> {
        if input.trim_start().starts_with('[') {
            Self::parse_array(input)
        } else {
            Self::parse_ndjson(input)
        }
    }

    /// Every problem in a batch, including events out of chronological order
    pub fn validate_events(events: &[LaunchEvent]) -> Vec<ValidationResult> {
        let mut previous: Option<DateTime<Utc>> = None;
        let mut results = Vec::new();
        for (index, event) in events.iter().enumerate() {
            let error = event.validate().err().or_else(|| match previous {
                Some(previous) if event.timestamp < previous => Some(ValidationError::OutOfOrder {
                    previous,
                    timestamp: event.timestamp,
                }),
                _ => None,
            });
            previous = Some(previous.map_or(event.timestamp, |p| p.max(event.timestamp)));
            if let Some(error) = error {
                results.push(ValidationResult {
                    index,
                    event_id: event.event_id.clone(),
                    error,
                });
            }
        }
        results
    }

    /// Convert a batch into replay steps in chronological order. Invalid
    /// records fail the whole batch; ordering is fixed by a stable sort.
    pub fn to_steps(events: &[LaunchEvent]) -> Result<Vec<ReplayStep>, PredictError> {
        let mut steps = Vec::with_capacity(events.len());
        for (index, event) in events.iter().enumerate() {
            event
                .validate()
                .map_err(|e| PredictError::Parse(format!("Invalid event at index {index}: {e}")))?;
            let app = event
                .app_identifier()
                .map_err(|e| PredictError::Parse(format!("Invalid event at index {index}: {e}")))?;
            let step = match event.kind {
                EventKind::Launch => ReplayStep::Launch(to_event(event, app)),
                EventKind::PackageChanged => ReplayStep::PackageChanged {
                    package: app.package,
                    profile: app.profile,
                    at: event.timestamp,
                },
                EventKind::PackageRemoved => ReplayStep::PackageRemoved {
                    package: app.package,
                    profile: app.profile,
                    at: event.timestamp,
                },
            };
            steps.push(step);
        }
        steps.sort_by_key(ReplayStep::timestamp);
        Ok(steps)
    }
}

fn to_event(record: &LaunchEvent, app: crate::types::AppIdentifier) -> Event {
    let mut event = Event::at(app, record.timestamp);
    if let Some(context) = &record.context {
        event = event.with_headset(context.headset);
        if let (Some(lat), Some(lng)) = (context.lat, context.lng) {
            event = event.with_location(lat, lng);
        }
        if let Some(place) = &context.place_id {
            event = event.with_place(place.clone());
        }
    }
    event
}

/// One invalid record of a batch
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResult {
    pub index: usize,
    pub event_id: Option<String>,
    pub error: ValidationError,
}
