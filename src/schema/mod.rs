//! launch.event.v1 input schema
//!
//! This module defines the usage-log format accepted by the CLI and the FFI:
//! app launches plus package lifecycle events, as NDJSON or a JSON array.

mod adapter;
mod launch_event;

pub use adapter::*;
pub use launch_event::*;
