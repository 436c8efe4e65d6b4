//! Shared HTTP failure classification for outbound calls.

use followup_core::error::FollowUpError;
use reqwest::StatusCode;

/// Map a non-success response to a delivery error.
///
/// Rate limits, timeouts and server errors are worth retrying; any other
/// client error will fail the same way next time.
pub fn status_error(service: &str, status: StatusCode, body: &str) -> FollowUpError {
    let message = format!("{service} returned {status}: {}", truncate(body, 200));
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        FollowUpError::transient(message)
    } else {
        FollowUpError::permanent(message)
    }
}

/// Connection-level failures are always transient, except a malformed request.
pub fn send_error(service: &str, err: reqwest::Error) -> FollowUpError {
    if err.is_builder() {
        FollowUpError::permanent(format!("{service} request invalid: {err}"))
    } else {
        FollowUpError::transient(format!("{service} unreachable: {err}"))
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
