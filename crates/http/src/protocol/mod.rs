//! Core HTTP protocol abstractions.
//!
//! This module provides the protocol-level building blocks the pipeline works with:
//!
//! - **Message Handling** ([`message`]): decoded body items and body framing
//!   - [`PayloadItem`]: a decoded body chunk or the end of the body
//!   - [`BodyFraming`]: how the length of a request body is determined
//!
//! - **Request Processing** ([`request`]): request header handling
//!   - [`RequestHeader`]: wraps HTTP request headers
//!
//! - **Byte Ranges** ([`range`]): `Range` header parsing and resolution
//!
//! - **Status Codes** ([`status`]): reason phrases and the local 55x codes
//!
//! - **Error Handling** ([`error`]): error types
//!   - [`HttpError`]: Top-level error type
//!   - [`ParseError`]: Request parsing errors
//!   - [`SendError`]: Response sending errors
//!   - [`ConfigError`]: Engine and host assembly errors

mod message;
pub use message::BodyFraming;
pub use message::PayloadItem;

mod request;
pub use request::RequestHeader;

mod error;
pub use error::ConfigError;
pub use error::HttpError;
pub use error::ParseError;
pub use error::SendError;

pub mod range;
pub use range::ByteRange;

pub mod status;
