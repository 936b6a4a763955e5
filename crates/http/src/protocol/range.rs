//! Byte range requests.
//!
//! Ranges are stored with an exclusive `end`. A suffix range (`-N`) is stored with
//! `start == -1` and `end == N`, and an open range (`N-`) with `end == -1`, until
//! [`fix_ranges`] resolves both against the entity length.

/// One range from a `Range: bytes=...` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: i64,
    pub end: i64,
}

impl ByteRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// Byte count of a resolved range.
    pub fn len(&self) -> u64 {
        u64::try_from(self.end - self.start).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Inclusive last byte, as written in `Content-Range`.
    pub fn last(&self) -> i64 {
        self.end - 1
    }
}

/// Parses the value of a `Range` header.
///
/// Returns `None` for anything but a well formed, ascending, non overlapping
/// list of byte ranges.
pub fn parse_ranges(value: &str) -> Option<Vec<ByteRange>> {
    let spec = value.trim().strip_prefix("bytes=")?;
    let mut ranges = Vec::new();

    for part in spec.split(',') {
        let part = part.trim();
        let (first, last) = part.split_once('-')?;
        let (first, last) = (first.trim(), last.trim());

        let range = match (first.is_empty(), last.is_empty()) {
            (true, true) => return None,
            (true, false) => ByteRange::new(-1, parse_position(last)?),
            (false, true) => ByteRange::new(parse_position(first)?, -1),
            (false, false) => {
                let start = parse_position(first)?;
                let end = parse_position(last)?.checked_add(1)?;
                if start >= end {
                    return None;
                }
                ByteRange::new(start, end)
            }
        };
        ranges.push(range);
    }

    for pair in ranges.windows(2) {
        let (prev, next) = (pair[0], pair[1]);
        if prev.start >= 0 && next.start >= 0 && (prev.end < 0 || next.start < prev.end) {
            return None;
        }
    }

    if ranges.is_empty() { None } else { Some(ranges) }
}

fn parse_position(text: &str) -> Option<i64> {
    if !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse::<i64>().ok()
}

/// Resolves suffix and open ranges against `length` and clamps every range to it.
///
/// Returns `false` when a range cannot be satisfied, or when the resolved ranges are
/// not ascending and disjoint. The ranges should then be ignored and the full entity
/// sent.
pub fn fix_ranges(ranges: &mut [ByteRange], length: i64) -> bool {
    if length < 0 {
        return false;
    }
    for range in ranges.iter_mut() {
        if range.start < 0 {
            range.start = (length - range.end).max(0);
            range.end = length;
        } else if range.end < 0 {
            range.end = length;
        }
        range.end = range.end.min(length);
        range.start = range.start.min(length);
        if range.is_empty() {
            return false;
        }
    }
    ranges.windows(2).all(|pair| pair[0].end <= pair[1].start)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_explicit_ranges() {
        let ranges = parse_ranges("bytes=100-199").unwrap();
        assert_eq!(ranges, vec![ByteRange::new(100, 200)]);
        assert_eq!(ranges[0].len(), 100);
        assert_eq!(ranges[0].last(), 199);
    }

    #[test]
    fn parses_suffix_and_open_ranges() {
        let ranges = parse_ranges("bytes=-50").unwrap();
        assert_eq!(ranges, vec![ByteRange::new(-1, 50)]);

        let ranges = parse_ranges("bytes=1-").unwrap();
        assert_eq!(ranges, vec![ByteRange::new(1, -1)]);
    }

    #[test]
    fn parses_multiple_ranges() {
        let ranges = parse_ranges("bytes=0-49, 50-99,200-249").unwrap();
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[2], ByteRange::new(200, 250));
    }

    #[test]
    fn rejects_malformed_ranges() {
        assert!(parse_ranges("bytes=").is_none());
        assert!(parse_ranges("bytes=-").is_none());
        assert!(parse_ranges("bytes=10-5").is_none());
        assert!(parse_ranges("items=0-5").is_none());
        assert!(parse_ranges("bytes=a-5").is_none());
        assert!(parse_ranges("bytes=0-50,25-75").is_none());
        assert!(parse_ranges("bytes=5-,10-20").is_none());
    }

    #[test]
    fn fixes_ranges_against_length() {
        let mut ranges = parse_ranges("bytes=-50").unwrap();
        assert!(fix_ranges(&mut ranges, 30));
        assert_eq!(ranges[0], ByteRange::new(0, 30));

        let mut ranges = vec![ByteRange::new(-1, 50)];
        assert!(fix_ranges(&mut ranges, 10_000));
        assert_eq!(ranges[0], ByteRange::new(9950, 10_000));

        let mut ranges = vec![ByteRange::new(9990, -1)];
        assert!(fix_ranges(&mut ranges, 10_000));
        assert_eq!(ranges[0], ByteRange::new(9990, 10_000));

        let mut ranges = vec![ByteRange::new(0, 20_000)];
        assert!(fix_ranges(&mut ranges, 10_000));
        assert_eq!(ranges[0].len(), 10_000);
    }

    #[test]
    fn unsatisfiable_ranges_are_rejected() {
        let mut ranges = vec![ByteRange::new(20_000, 20_100)];
        assert!(!fix_ranges(&mut ranges, 10_000));
        let mut ranges = vec![ByteRange::new(0, 10)];
        assert!(!fix_ranges(&mut ranges, -1));
    }

    #[test]
    fn resolved_ranges_must_ascend() {
        let mut ranges = parse_ranges("bytes=900-949,-100").unwrap();
        assert!(!fix_ranges(&mut ranges, 1000));

        let mut ranges = parse_ranges("bytes=-100,0-9").unwrap();
        assert!(!fix_ranges(&mut ranges, 1000));

        let mut ranges = parse_ranges("bytes=0-9,-100").unwrap();
        assert!(fix_ranges(&mut ranges, 1000));
        assert_eq!(ranges, [ByteRange::new(0, 10), ByteRange::new(900, 1000)]);
    }
}
