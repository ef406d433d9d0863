//! FFI bindings for the launch predictor
//!
//! This module provides C-compatible functions for driving a predictor from a
//! host launcher. The predictor keeps its collaborators in memory: the host
//! registers installed activities and the first-page layout, feeds
//! launch.event.v1 records, and persists state itself through
//! `predictor_save_state` / `predictor_load_state`.
//!
//! All strings are null-terminated UTF-8. Returned strings must be freed with
//! `predictor_free_string`.

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::ptr;

use crate::adapters::LayoutItem;
use crate::config::PredictorConfig;
use crate::engine::{replay_step, MemoryCollaborators, PredictionEngine, StateSnapshot};
use crate::error::PredictError;
use crate::schema::LaunchEventAdapter;
use crate::types::{AppIdentifier, PredictionContext};

// Thread-local storage for the last error message
thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_last_error(msg: &str) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = CString::new(msg).ok();
    });
}

fn clear_last_error() {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = None;
    });
}

unsafe fn cstr_to_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok().map(|s| s.to_string())
}

fn string_to_cstr(s: &str) -> *mut c_char {
    match CString::new(s) {
        Ok(cstr) => cstr.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

/// Report a failed call through LAST_ERROR and map it to the C return value
fn status(result: Result<i32, PredictError>) -> i32 {
    match result {
        Ok(value) => value,
        Err(e) => {
            set_last_error(&e.to_string());
            -1
        }
    }
}

fn json_out(result: Result<String, PredictError>) -> *mut c_char {
    match result {
        Ok(json) => string_to_cstr(&json),
        Err(e) => {
            set_last_error(&e.to_string());
            ptr::null_mut()
        }
    }
}

unsafe fn required(ptr: *const c_char, what: &str) -> Result<String, PredictError> {
    cstr_to_string(ptr).ok_or_else(|| PredictError::Parse(format!("Invalid {what} string pointer")))
}

// ============================================================================
// Predictor lifecycle
// ============================================================================

/// Opaque handle to a predictor and its in-memory collaborators
pub struct PredictorHandle {
    host: MemoryCollaborators,
    engine: PredictionEngine,
}

impl PredictorHandle {
    fn new(config: PredictorConfig) -> Result<Self, PredictError> {
        let host = MemoryCollaborators::new();
        let engine = PredictionEngine::new(config, host.collaborators())?;
        Ok(Self { host, engine })
    }
}

/// Create a predictor.
///
/// # Safety
/// - `config_json` is a null-terminated predictor configuration, or NULL for defaults.
/// - Must be freed with `predictor_free`.
/// - Returns NULL on error; call `predictor_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn predictor_new(config_json: *const c_char) -> *mut PredictorHandle {
    clear_last_error();

    let config = if config_json.is_null() {
        Ok(PredictorConfig::default())
    } else {
        required(config_json, "config").and_then(|json| PredictorConfig::from_json(&json))
    };

    match config.and_then(PredictorHandle::new) {
        Ok(handle) => Box::into_raw(Box::new(handle)),
        Err(e) => {
            set_last_error(&e.to_string());
            ptr::null_mut()
        }
    }
}

/// Free a predictor.
///
/// # Safety
/// - `predictor` must be a pointer returned by `predictor_new`, or NULL.
/// - After calling this function, the pointer is invalid.
#[no_mangle]
pub unsafe extern "C" fn predictor_free(predictor: *mut PredictorHandle) {
    if !predictor.is_null() {
        drop(Box::from_raw(predictor));
    }
}

unsafe fn handle<'a>(predictor: *mut PredictorHandle) -> Result<&'a mut PredictorHandle, PredictError> {
    predictor
        .as_mut()
        .ok_or_else(|| PredictError::Parse("Null predictor pointer".to_string()))
}

// ============================================================================
// Host state
// ============================================================================

/// Register an installed, enabled activity such as `com.a/.Main#10`.
///
/// # Safety
/// - `predictor` must be a valid pointer returned by `predictor_new`.
/// - `app` must be a valid null-terminated C string.
/// - Returns 0 on success, -1 on error.
#[no_mangle]
pub unsafe extern "C" fn predictor_install(predictor: *mut PredictorHandle, app: *const c_char) -> i32 {
    clear_last_error();
    status((|| -> Result<i32, PredictError> {
        let handle = handle(predictor)?;
        let app: AppIdentifier = required(app, "app")?.parse()?;
        handle.host.packages.install(app.clone());
        handle.engine.on_activity_state_changed(&app, true);
        Ok(0)
    })())
}

/// Replace the first-page layout with a JSON array of `{"intent", "profile"}`
/// items and refresh the dismissed set.
///
/// # Safety
/// - `predictor` must be a valid pointer returned by `predictor_new`.
/// - `layout_json` and `now` (RFC 3339) must be valid null-terminated C strings.
/// - Returns 1 if the dismissed set changed, 0 if not, -1 on error.
#[no_mangle]
pub unsafe extern "C" fn predictor_set_layout(
    predictor: *mut PredictorHandle,
    layout_json: *const c_char,
    now: *const c_char,
) -> i32 {
    clear_last_error();
    status((|| -> Result<i32, PredictError> {
        let handle = handle(predictor)?;
        let items: Vec<LayoutItem> = serde_json::from_str(&required(layout_json, "layout")?)?;
        let now = parse_time(&required(now, "timestamp")?)?;
        handle.host.layout.set(items);
        Ok(handle.engine.on_workspace_changed(now) as i32)
    })())
}

fn parse_time(raw: &str) -> Result<chrono::DateTime<chrono::Utc>, PredictError> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&chrono::Utc))
        .map_err(|e| PredictError::Parse(format!("Invalid timestamp {raw}: {e}")))
}

// ============================================================================
// Events and predictions
// ============================================================================

/// Feed launch.event.v1 records (NDJSON or a JSON array).
///
/// # Safety
/// - `predictor` must be a valid pointer returned by `predictor_new`.
/// - `events` must be a valid null-terminated C string.
/// - Returns the number of records applied, or -1 on error. A batch with an
///   invalid record is rejected as a whole.
#[no_mangle]
pub unsafe extern "C" fn predictor_record_events(
    predictor: *mut PredictorHandle,
    events: *const c_char,
) -> i32 {
    clear_last_error();
    status((|| -> Result<i32, PredictError> {
        let handle = handle(predictor)?;
        let records = LaunchEventAdapter::parse(&required(events, "events")?)?;
        let steps = LaunchEventAdapter::to_steps(&records)?;
        let count = steps.len();
        for step in steps {
            replay_step(&mut handle.engine, &handle.host.events, &handle.host.packages, step);
        }
        Ok(count as i32)
    })())
}

/// Compute predictions for a context and return them as a JSON array of
/// `{"app", "score"}`.
///
/// # Safety
/// - `predictor` must be a valid pointer returned by `predictor_new`.
/// - `context_json` must be a valid null-terminated prediction context.
/// - Returns a newly allocated string that must be freed with `predictor_free_string`.
/// - Returns NULL on error; call `predictor_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn predictor_predict(
    predictor: *mut PredictorHandle,
    context_json: *const c_char,
) -> *mut c_char {
    clear_last_error();
    json_out((|| -> Result<String, PredictError> {
        let handle = handle(predictor)?;
        let context: PredictionContext = serde_json::from_str(&required(context_json, "context")?)?;
        let predictions = handle.engine.predict(&context);
        Ok(serde_json::to_string(&predictions)?)
    })())
}

/// Forget a removed package.
///
/// # Safety
/// - `predictor` must be a valid pointer returned by `predictor_new`.
/// - `package` must be a valid null-terminated C string.
/// - Returns the number of labels forgotten, or -1 on error.
#[no_mangle]
pub unsafe extern "C" fn predictor_package_removed(
    predictor: *mut PredictorHandle,
    package: *const c_char,
    profile: u32,
) -> i32 {
    clear_last_error();
    status((|| -> Result<i32, PredictError> {
        let handle = handle(predictor)?;
        let package = required(package, "package")?;
        handle.host.packages.uninstall(&package, profile);
        Ok(handle.engine.on_package_removed(&package, profile) as i32)
    })())
}

/// Hide an app from predictions (`hidden` non-zero) or show it again.
///
/// # Safety
/// - `predictor` must be a valid pointer returned by `predictor_new`.
/// - `app` must be a valid null-terminated C string.
/// - Returns 1 if the hidden set changed, 0 if not, -1 on error.
#[no_mangle]
pub unsafe extern "C" fn predictor_set_hidden(
    predictor: *mut PredictorHandle,
    app: *const c_char,
    hidden: i32,
) -> i32 {
    clear_last_error();
    status((|| -> Result<i32, PredictError> {
        let handle = handle(predictor)?;
        let app: AppIdentifier = required(app, "app")?.parse()?;
        Ok(handle.engine.set_hidden(&app, hidden != 0) as i32)
    })())
}

// ============================================================================
// Persistence
// ============================================================================

/// Save predictor state to JSON.
///
/// # Safety
/// - `predictor` must be a valid pointer returned by `predictor_new`.
/// - Returns a newly allocated string that must be freed with `predictor_free_string`.
/// - Returns NULL on error; call `predictor_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn predictor_save_state(predictor: *mut PredictorHandle) -> *mut c_char {
    clear_last_error();
    json_out((|| -> Result<String, PredictError> {
        let handle = handle(predictor)?;
        let snapshot = handle.engine.snapshot()?;
        Ok(serde_json::to_string(&snapshot)?)
    })())
}

/// Load predictor state from JSON produced by `predictor_save_state`.
/// Parts that cannot be read fall back to fresh state.
///
/// # Safety
/// - `predictor` must be a valid pointer returned by `predictor_new`.
/// - `json` must be a valid null-terminated C string.
/// - Returns 0 on success, -1 if the JSON itself is malformed.
#[no_mangle]
pub unsafe extern "C" fn predictor_load_state(predictor: *mut PredictorHandle, json: *const c_char) -> i32 {
    clear_last_error();
    status((|| -> Result<i32, PredictError> {
        let handle = handle(predictor)?;
        let snapshot: StateSnapshot = serde_json::from_str(&required(json, "state")?)?;
        handle.engine.restore(&snapshot);
        Ok(0)
    })())
}

// ============================================================================
// Memory Management
// ============================================================================

/// Free a string returned by predictor functions.
///
/// # Safety
/// - `ptr` must be a valid pointer returned by a predictor function, or NULL.
/// - After calling this function, the pointer is invalid.
#[no_mangle]
pub unsafe extern "C" fn predictor_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}

// ============================================================================
// Error Handling
// ============================================================================

/// Get the last error message.
///
/// # Safety
/// - The returned pointer is valid until the next predictor call on this thread.
/// - Do NOT free the returned pointer.
/// - Returns NULL if no error occurred.
#[no_mangle]
pub unsafe extern "C" fn predictor_last_error() -> *const c_char {
    LAST_ERROR.with(|e| match &*e.borrow() {
        Some(cstr) => cstr.as_ptr(),
        None => ptr::null(),
    })
}

/// Get the library version.
///
/// # Safety
/// - Returns a pointer to a static string. Do NOT free.
#[no_mangle]
pub unsafe extern "C" fn predictor_version() -> *const c_char {
    static VERSION: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION.as_ptr() as *const c_char
}
