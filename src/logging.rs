//! Structured logging helpers.
//!
//! Translates `logging_config.py`'s `log_session_event`/`log_resource_event`/
//! `log_sandbox_event` (which pass an `extra={}` dict to the stdlib logger)
//! into small functions that emit `tracing` events with structured fields —
//! the Rust-native equivalent of the same "always log this shape of context"
//! discipline, following the teacher's `info!(session = %id, ...)` call
//! sites in `session.rs`.

use tracing::{error, info, warn};

use crate::error::{ErrorSeverity, GatewayError};
use crate::models::{Flavor, SessionStatus, Template};

/// Log a session lifecycle transition.
pub fn log_session_event(session_id: &str, event: &str, status: SessionStatus, template: Template) {
    info!(
        session_id = %session_id,
        event = %event,
        status = %status,
        template = %template,
        "session event"
    );
}

/// Log a resource admission or eviction decision.
pub fn log_resource_event(event: &str, flavor: Option<Flavor>, active_sessions: usize, max_sessions: usize) {
    info!(
        event = %event,
        flavor = flavor.map(|f| f.to_string()).unwrap_or_default(),
        active_sessions,
        max_sessions,
        "resource event"
    );
}

/// Log an orphan-reaper or start/stop action against a remote sandbox.
pub fn log_sandbox_event(event: &str, namespace: &str, sandbox_name: &str, success: bool) {
    info!(
        event = %event,
        namespace = %namespace,
        sandbox_name = %sandbox_name,
        success,
        "sandbox event"
    );
}

/// Log a `GatewayError` at the tracing level matching its severity, mirroring
/// `exceptions.py::log_error_with_context`'s severity-to-log-level mapping.
pub fn log_error(err: &GatewayError) {
    let info = err.to_error_info();
    match info.severity {
        ErrorSeverity::Critical | ErrorSeverity::High => {
            error!(error_code = %info.error_code, category = ?info.category, "{}", info.message);
        }
        ErrorSeverity::Medium => {
            warn!(error_code = %info.error_code, category = ?info.category, "{}", info.message);
        }
        ErrorSeverity::Low => {
            info!(error_code = %info.error_code, category = ?info.category, "{}", info.message);
        }
    }
}
