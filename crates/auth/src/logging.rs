//! Request/response logging for the auth API.
//!
//! Success logs at info and unexpected failures at error. NotActivated logs
//! at debug: every request against a cluster that never turned auth on takes
//! that path, and logging it loudly only confuses operators.

use std::fmt::Debug;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::error::AuthError;

pub(crate) fn request<R: Debug>(method: &'static str, request: &R) {
    info!(method, request = ?request, "handling request");
}

pub(crate) fn response<T>(
    method: &'static str,
    result: &Result<T, AuthError>,
    duration: Duration,
) {
    match result {
        Ok(_) => info!(method, ?duration, "request succeeded"),
        Err(err) if err.is_not_activated() => {
            debug!(method, ?duration, error = %err, "request refused")
        }
        Err(err) => error!(method, ?duration, error = %err, "request failed"),
    }
}
