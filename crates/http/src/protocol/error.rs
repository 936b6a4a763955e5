use std::io;

use http::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request error: {source}")]
    RequestError {
        #[from]
        source: ParseError,
    },

    #[error("response error: {source}")]
    ResponseError {
        #[from]
        source: SendError,
    },

    #[error("config error: {source}")]
    ConfigError {
        #[from]
        source: ConfigError,
    },
}

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("header size too large, current: {current_size} exceed the limit {max_size}")]
    TooLargeHeader { current_size: usize, max_size: usize },

    #[error("header number exceed the limit {max_num}")]
    TooManyHeaders { max_num: usize },

    #[error("invalid header: {reason}")]
    InvalidHeader { reason: String },

    #[error("invalid http version: {0:?}")]
    InvalidVersion(Option<u8>),

    #[error("invalid http method")]
    InvalidMethod,

    #[error("invalid http uri")]
    InvalidUri,

    #[error("uri length {len} exceed the limit {max_len}")]
    UriTooLong { len: usize, max_len: usize },

    #[error("invalid content-length header: {reason}")]
    InvalidContentLength { reason: String },

    #[error("bad chunk framing at body byte {offset}: {reason}")]
    BadChunk { offset: u64, reason: &'static str },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl ParseError {
    pub fn too_large_header(current_size: usize, max_size: usize) -> Self {
        Self::TooLargeHeader { current_size, max_size }
    }

    pub fn too_many_headers(max_num: usize) -> Self {
        Self::TooManyHeaders { max_num }
    }

    pub fn uri_too_long(len: usize, max_len: usize) -> Self {
        Self::UriTooLong { len, max_len }
    }

    pub fn invalid_header<S: ToString>(str: S) -> Self {
        Self::InvalidHeader { reason: str.to_string() }
    }

    pub fn bad_chunk(offset: u64, reason: &'static str) -> Self {
        Self::BadChunk { offset, reason }
    }

    pub fn invalid_content_length<S: ToString>(str: S) -> Self {
        Self::InvalidContentLength { reason: str.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }

    /// The status a connection answers with when parsing fails this way.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::TooLargeHeader { .. } => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
            Self::InvalidVersion(_) => StatusCode::NOT_ACCEPTABLE,
            Self::InvalidMethod => StatusCode::METHOD_NOT_ALLOWED,
            Self::UriTooLong { .. } => StatusCode::URI_TOO_LONG,
            Self::TooManyHeaders { .. }
            | Self::InvalidHeader { .. }
            | Self::InvalidUri
            | Self::InvalidContentLength { .. }
            | Self::BadChunk { .. }
            | Self::Io { .. } => StatusCode::BAD_REQUEST,
        }
    }
}

#[derive(Error, Debug)]
pub enum SendError {
    #[error("invalid body: {reason}")]
    InvalidBody { reason: String },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl SendError {
    pub fn invalid_body<S: ToString>(str: S) -> Self {
        Self::InvalidBody { reason: str.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}

/// Errors raised while assembling an engine, a host table or a server.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("required stage {name} is not registered")]
    MissingStage { name: String },

    #[error("stage {name} is registered twice")]
    DuplicateStage { name: String },

    #[error("stage {name} is not a {role}")]
    WrongRole { name: String, role: &'static str },

    #[error("invalid configuration: {reason}")]
    Invalid { reason: String },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl ConfigError {
    pub fn missing_stage<S: ToString>(name: S) -> Self {
        Self::MissingStage { name: name.to_string() }
    }

    pub fn invalid<S: ToString>(str: S) -> Self {
        Self::Invalid { reason: str.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_errors_map_to_statuses() {
        assert_eq!(ParseError::too_large_header(9000, 8192).status(), StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE);
        assert_eq!(ParseError::too_many_headers(64).status(), StatusCode::BAD_REQUEST);
        assert_eq!(ParseError::InvalidVersion(Some(2)).status(), StatusCode::NOT_ACCEPTABLE);
        assert_eq!(ParseError::uri_too_long(5000, 4096).status(), StatusCode::URI_TOO_LONG);
        assert_eq!(ParseError::InvalidMethod.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[test]
    fn errors_convert_into_http_error() {
        let err: HttpError = ConfigError::missing_stage("passHandler").into();
        assert_eq!(err.to_string(), "config error: required stage passHandler is not registered");
    }
}
