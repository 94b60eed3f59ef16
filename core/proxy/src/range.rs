//! HTTP `Range` header handling.
//!
//! Only single byte ranges are honored. Multi-range requests and anything
//! that does not parse are treated as if no header was sent.

use cloudshelf_remote::ByteRange;

/// One parsed `bytes=` range, not yet bound to an object size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// `bytes=a-b` or, with `end == None`, `bytes=a-`.
    From { start: u64, end: Option<u64> },
    /// `bytes=-n`: the last `n` bytes.
    Suffix(u64),
}

/// What to send for a request against an object of known size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOutcome {
    /// No usable range: send everything with 200.
    Full,
    /// Send exactly this range with 206.
    Partial(ByteRange),
    /// Range lies outside the object: 416.
    NotSatisfiable,
}

/// Parse a `Range` header value. `None` means the header is to be ignored.
pub fn parse_range(header: &str) -> Option<RangeSpec> {
    let spec = header.trim().strip_prefix("bytes=")?.trim();
    if spec.contains(',') {
        return None;
    }

    let (start, end) = spec.split_once('-')?;
    let (start, end) = (start.trim(), end.trim());

    if start.is_empty() {
        return end.parse().ok().map(RangeSpec::Suffix);
    }

    let start: u64 = start.parse().ok()?;
    if end.is_empty() {
        return Some(RangeSpec::From { start, end: None });
    }
    let end: u64 = end.parse().ok()?;
    if end < start {
        return None;
    }
    Some(RangeSpec::From {
        start,
        end: Some(end),
    })
}

impl RangeSpec {
    /// Bind the range to an object of `total` bytes.
    ///
    /// The end is clamped to the last byte; a start at or past the end of
    /// the object, or an empty suffix, cannot be satisfied.
    pub fn resolve(&self, total: u64) -> RangeOutcome {
        if total == 0 {
            return RangeOutcome::NotSatisfiable;
        }
        let last = total - 1;
        match *self {
            RangeSpec::From { start, .. } if start > last => RangeOutcome::NotSatisfiable,
            RangeSpec::From { start, end } => RangeOutcome::Partial(ByteRange {
                start,
                end: end.map_or(last, |end| end.min(last)),
            }),
            RangeSpec::Suffix(0) => RangeOutcome::NotSatisfiable,
            RangeSpec::Suffix(n) => RangeOutcome::Partial(ByteRange {
                start: total.saturating_sub(n),
                end: last,
            }),
        }
    }
}

/// Resolve an optional raw header against `total` bytes.
pub fn resolve_range(header: Option<&str>, total: u64) -> RangeOutcome {
    match header.and_then(parse_range) {
        Some(spec) => spec.resolve(total),
        None => RangeOutcome::Full,
    }
}

/// `Content-Range` value for a served range.
pub fn content_range(range: ByteRange, total: u64) -> String {
    format!("bytes {}-{}/{}", range.start, range.end, total)
}

/// `Content-Range` value for a 416 response.
pub fn unsatisfied_range(total: u64) -> String {
    format!("bytes */{}", total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_forms() {
        assert_eq!(
            parse_range("bytes=100-199"),
            Some(RangeSpec::From {
                start: 100,
                end: Some(199)
            })
        );
        assert_eq!(
            parse_range("bytes=500-"),
            Some(RangeSpec::From {
                start: 500,
                end: None
            })
        );
        assert_eq!(parse_range("bytes=-50"), Some(RangeSpec::Suffix(50)));
        assert_eq!(
            parse_range(" bytes= 1 - 2 "),
            Some(RangeSpec::From {
                start: 1,
                end: Some(2)
            })
        );
    }

    #[test]
    fn test_ignored_headers() {
        assert_eq!(parse_range("bytes=0-1,5-9"), None);
        assert_eq!(parse_range("items=0-1"), None);
        assert_eq!(parse_range("bytes=abc"), None);
        assert_eq!(parse_range("bytes=9-3"), None);
        assert_eq!(parse_range("bytes=-"), None);
        assert_eq!(resolve_range(Some("garbage"), 10), RangeOutcome::Full);
        assert_eq!(resolve_range(None, 10), RangeOutcome::Full);
    }

    #[test]
    fn test_resolve_hundred_bytes() {
        let outcome = resolve_range(Some("bytes=100-199"), 1000);
        let RangeOutcome::Partial(range) = outcome else {
            panic!("expected partial, got {:?}", outcome);
        };
        assert_eq!(range.len(), 100);
        assert_eq!(content_range(range, 1000), "bytes 100-199/1000");
    }

    #[test]
    fn test_resolve_clamps_and_suffix() {
        assert_eq!(
            resolve_range(Some("bytes=900-5000"), 1000),
            RangeOutcome::Partial(ByteRange { start: 900, end: 999 })
        );
        assert_eq!(
            resolve_range(Some("bytes=-5000"), 1000),
            RangeOutcome::Partial(ByteRange { start: 0, end: 999 })
        );
        assert_eq!(
            resolve_range(Some("bytes=-10"), 1000),
            RangeOutcome::Partial(ByteRange { start: 990, end: 999 })
        );
    }

    #[test]
    fn test_not_satisfiable() {
        assert_eq!(resolve_range(Some("bytes=1000-"), 1000), RangeOutcome::NotSatisfiable);
        assert_eq!(resolve_range(Some("bytes=-0"), 1000), RangeOutcome::NotSatisfiable);
        assert_eq!(resolve_range(Some("bytes=0-0"), 0), RangeOutcome::NotSatisfiable);
        assert_eq!(unsatisfied_range(1000), "bytes */1000");
    }

    proptest! {
        #[test]
        fn resolved_ranges_stay_in_bounds(
            start in 0u64..2000,
            len in 0u64..2000,
            total in 1u64..1500
        ) {
            let header = format!("bytes={}-{}", start, start + len);
            match resolve_range(Some(&header), total) {
                RangeOutcome::Partial(range) => {
                    prop_assert!(range.start <= range.end);
                    prop_assert!(range.end < total);
                    prop_assert_eq!(range.len(), (start + len).min(total - 1) - start + 1);
                }
                RangeOutcome::NotSatisfiable => prop_assert!(start >= total),
                RangeOutcome::Full => prop_assert!(false, "well-formed range ignored"),
            }
        }

        #[test]
        fn suffix_covers_tail(n in 1u64..3000, total in 1u64..1500) {
            let header = format!("bytes=-{}", n);
            let RangeOutcome::Partial(range) = resolve_range(Some(&header), total) else {
                return Err(TestCaseError::fail("suffix not satisfied"));
            };
            prop_assert_eq!(range.end, total - 1);
            prop_assert_eq!(range.len(), n.min(total));
        }
    }
}
