//! # Errors
//!
//! Failures raised while instrumenting requests. None of these stop the
//! server from handling traffic: configuration problems are routed to the
//! global error handler and degrade to no-op instruments, and a request body
//! that cannot be read only fails that single request.

use actix_http::error::PayloadError;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Errors produced by the telemetry middleware.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A metric instrument was rejected and replaced with a no-op instrument.
    #[error("invalid instrument `{name}`: {reason}")]
    InvalidInstrument {
        /// Name of the rejected instrument.
        name: &'static str,
        /// Why the instrument was rejected.
        reason: &'static str,
    },

    /// The request payload could not be read while measuring its size.
    #[error("failed to read request body: {0}")]
    BodyRead(#[from] PayloadError),
}

type ErrorHandler = Arc<dyn Fn(&Error) + Send + Sync>;

static ERROR_HANDLER: RwLock<Option<ErrorHandler>> = RwLock::new(None);

/// Install a process-wide handler for instrumentation errors.
///
/// Without a handler, errors are logged through [`tracing`] at error level.
///
/// ```
/// actix_web_request_telemetry::set_error_handler(|err| {
///     eprintln!("telemetry error: {err}");
/// });
/// ```
pub fn set_error_handler<F>(handler: F)
where
    F: Fn(&Error) + Send + Sync + 'static,
{
    let mut slot = match ERROR_HANDLER.write() {
        Ok(slot) => slot,
        Err(poisoned) => poisoned.into_inner(),
    };
    *slot = Some(Arc::new(handler));
}

/// Report an error to the installed handler.
pub(crate) fn handle_error(err: Error) {
    let handler = match ERROR_HANDLER.read() {
        Ok(slot) => slot.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };

    match handler {
        Some(handler) => handler(&err),
        None => tracing::error!(error = %err, "request telemetry error"),
    }
}
