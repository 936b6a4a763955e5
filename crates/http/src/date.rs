//! Cached `Date` header value.
//!
//! Formatting an HTTP date on every response is wasted work under load, so the
//! formatted value is cached and refreshed at most every 500 milliseconds.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::HeaderValue;
use once_cell::sync::Lazy;

const REFRESH: Duration = Duration::from_millis(500);

static CURRENT: Lazy<Mutex<(Instant, HeaderValue)>> = Lazy::new(|| Mutex::new((Instant::now(), format_now())));

/// The current time as an HTTP date.
pub(crate) fn http_date() -> HeaderValue {
    let mut current = CURRENT.lock().unwrap_or_else(PoisonError::into_inner);
    let now = Instant::now();
    if now.duration_since(current.0) >= REFRESH {
        *current = (now, format_now());
    }
    current.1.clone()
}

fn format_now() -> HeaderValue {
    let mut buf = faf_http_date::get_date_buff_no_key();
    faf_http_date::get_date_no_key(&mut buf);
    HeaderValue::from_maybe_shared(Bytes::from_owner(buf)).unwrap_or_else(|_invalid| HeaderValue::from_static("Thu, 01 Jan 1970 00:00:00 GMT"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_parses_as_http_date() {
        let date = http_date();
        let parsed = httpdate::parse_http_date(date.to_str().unwrap()).unwrap();
        let age = std::time::SystemTime::now().duration_since(parsed).unwrap_or_default();
        assert!(age < Duration::from_secs(5));
    }
}
