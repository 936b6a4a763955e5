//! Status code helpers.
//!
//! Besides the registered codes from [`http::StatusCode`] the engine uses three local
//! codes in the 55x range to report internal conditions distinctly from standard
//! HTTP errors. They never collide with registered codes and always carry a reason
//! phrase from [`reason`].

use http::StatusCode;

/// Communication failure between stages or with the peer.
pub const COMMS_ERROR: u16 = 550;
/// The client misbehaved in a way no standard code describes.
pub const CLIENT_ERROR: u16 = 551;
/// A configured limit was exceeded.
pub const LIMIT_ERROR: u16 = 552;

/// Builds a local status code, falling back to 500 if the value is out of range.
pub fn local(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

/// The reason phrase written on the status line.
pub fn reason(status: StatusCode) -> &'static str {
    match status.as_u16() {
        COMMS_ERROR => "Comms Error",
        CLIENT_ERROR => "General Client Error",
        LIMIT_ERROR => "Limit Error",
        _ => status.canonical_reason().unwrap_or("Unknown"),
    }
}

/// True for statuses that never carry a message body.
pub fn forbids_body(status: StatusCode) -> bool {
    status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED
}
