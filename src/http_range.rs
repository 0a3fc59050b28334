use std::cmp::min;
use std::time::SystemTime;

use time::Duration;
use time::format_description::FormatItem;
use time::format_description::well_known::Rfc2822;
use time::macros::format_description;
use time::{OffsetDateTime, macros::offset};

const HTTP_DATE_FORMAT: &[FormatItem<'_>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

#[must_use]
pub(crate) fn systemtime_to_http_datetime(time: SystemTime) -> String {
    let odt = OffsetDateTime::from(time);
    assert_eq!(odt.offset(), offset!(UTC));

    /* round up to the next full second */
    let odt = match odt.nanosecond() {
        0 => odt,
        ns => odt.saturating_add(Duration::NANOSECOND * (1_000_000_000 - ns)),
    };
    assert_eq!(odt.nanosecond(), 0);

    odt.format(HTTP_DATE_FORMAT).expect("date should be valid")
}

#[must_use]
pub(crate) fn http_datetime_to_systemtime(time: &str) -> Option<SystemTime> {
    OffsetDateTime::parse(time, &Rfc2822)
        .ok()
        .map(std::convert::Into::into)
}

/// One requested byte range with inclusive bounds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct ByteRange {
    pub(crate) start: u64,
    pub(crate) end: u64,
}

impl ByteRange {
    #[must_use]
    pub(crate) const fn len(&self) -> u64 {
        self.end + 1 - self.start
    }

    #[must_use]
    pub(crate) fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{total}", self.start, self.end)
    }
}

/// Outcome of evaluating a `Range` header against the total body length.
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum RangeOutcome {
    /// No usable `Range` header; serve the full body.
    Full,
    /// At least one range overlaps `[0, total)`; serve these parts.
    Partial(Vec<ByteRange>),
    /// Ranges were requested but none is satisfiable.
    Unsatisfiable,
}

/// Parses a `Range: bytes=…` header into satisfiable ranges.
///
/// Follows RFC 7233 §2.1 with the clamps the package managers rely on:
/// `-N` is strictly a suffix length (clamped to the file when larger),
/// `N-` runs to the end, and parts beyond the body are dropped rather
/// than failing the whole request. A present `If-Range` cancels range
/// handling entirely, as does a malformed header.
#[must_use]
pub(crate) fn http_parse_ranges(
    range: Option<&str>,
    if_range: Option<&str>,
    total_length: u64,
) -> RangeOutcome {
    let Some(range) = range else {
        return RangeOutcome::Full;
    };

    if if_range.is_some() {
        return RangeOutcome::Full;
    }

    if total_length == 0 {
        return RangeOutcome::Full;
    }

    let Some(spec) = range.strip_prefix("bytes=") else {
        return RangeOutcome::Full;
    };

    let mut parts = Vec::new();
    for part in spec.split(',') {
        let part = part.trim();

        let Some((start, end)) = part.split_once('-') else {
            return RangeOutcome::Full;
        };

        let range = match (start.is_empty(), end.is_empty()) {
            (true, true) => return RangeOutcome::Full,
            (false, false) => {
                let Ok(start) = start.parse::<u64>() else {
                    return RangeOutcome::Full;
                };
                let Ok(end) = end.parse::<u64>() else {
                    return RangeOutcome::Full;
                };
                if start > end {
                    return RangeOutcome::Full;
                }
                if start >= total_length {
                    /* unsatisfiable part, drop it */
                    continue;
                }
                ByteRange {
                    start,
                    end: min(end, total_length - 1),
                }
            }
            (false, true) => {
                let Ok(start) = start.parse::<u64>() else {
                    return RangeOutcome::Full;
                };
                if start >= total_length {
                    continue;
                }
                ByteRange {
                    start,
                    end: total_length - 1,
                }
            }
            (true, false) => {
                /* suffix length, clamped to the whole body */
                let Ok(suffix) = end.parse::<u64>() else {
                    return RangeOutcome::Full;
                };
                if suffix == 0 {
                    continue;
                }
                ByteRange {
                    start: total_length.saturating_sub(suffix),
                    end: total_length - 1,
                }
            }
        };

        parts.push(range);
    }

    if parts.is_empty() {
        RangeOutcome::Unsatisfiable
    } else {
        RangeOutcome::Partial(parts)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use super::*;

    #[test]
    fn format_datetime_test() {
        assert_eq!(
            systemtime_to_http_datetime(UNIX_EPOCH),
            "Thu, 01 Jan 1970 00:00:00 GMT"
        );

        assert_eq!(
            systemtime_to_http_datetime(UNIX_EPOCH + Duration::from_secs(12_345_678_909)),
            "Tue, 21 Mar 2361 19:15:09 GMT"
        );

        /* sub-second timestamps round up */
        assert_eq!(
            systemtime_to_http_datetime(UNIX_EPOCH + Duration::from_nanos(1)),
            "Thu, 01 Jan 1970 00:00:01 GMT"
        );
    }

    #[test]
    fn parse_datetime_test() {
        assert_eq!(
            http_datetime_to_systemtime("Thu, 01 Jan 1970 00:00:00 GMT"),
            Some(UNIX_EPOCH)
        );

        assert_eq!(
            http_datetime_to_systemtime("Tue, 21 Mar 2361 19:15:09 GMT"),
            Some(UNIX_EPOCH + Duration::from_secs(12_345_678_909))
        );

        assert_eq!(http_datetime_to_systemtime("ABCDEFG"), None);
    }

    #[test]
    fn parse_single_ranges() {
        assert_eq!(
            http_parse_ranges(Some("bytes=0-1023"), None, 8192),
            RangeOutcome::Partial(vec![ByteRange { start: 0, end: 1023 }])
        );

        /* end clamped to the body */
        assert_eq!(
            http_parse_ranges(Some("bytes=5000-6999"), None, 6000),
            RangeOutcome::Partial(vec![ByteRange {
                start: 5000,
                end: 5999
            }])
        );

        /* open range */
        assert_eq!(
            http_parse_ranges(Some("bytes=4096-"), None, 10000),
            RangeOutcome::Partial(vec![ByteRange {
                start: 4096,
                end: 9999
            }])
        );

        /* suffix range */
        assert_eq!(
            http_parse_ranges(Some("bytes=-500"), None, 10000),
            RangeOutcome::Partial(vec![ByteRange {
                start: 9500,
                end: 9999
            }])
        );

        /* oversized suffix clamps to the full body */
        assert_eq!(
            http_parse_ranges(Some("bytes=-1000"), None, 400),
            RangeOutcome::Partial(vec![ByteRange { start: 0, end: 399 }])
        );
    }

    #[test]
    fn parse_multi_ranges() {
        assert_eq!(
            http_parse_ranges(Some("bytes=0-50, 100-150"), None, 8192),
            RangeOutcome::Partial(vec![
                ByteRange { start: 0, end: 50 },
                ByteRange {
                    start: 100,
                    end: 150
                }
            ])
        );

        /* one part out of range: only the valid part survives */
        assert_eq!(
            http_parse_ranges(Some("bytes=90000-99999, 0-9"), None, 8192),
            RangeOutcome::Partial(vec![ByteRange { start: 0, end: 9 }])
        );

        /* all parts out of range */
        assert_eq!(
            http_parse_ranges(Some("bytes=90000-99999, 80000-"), None, 8192),
            RangeOutcome::Unsatisfiable
        );
    }

    #[test]
    fn parse_range_cancellation() {
        /* If-Range present cancels range handling */
        assert_eq!(
            http_parse_ranges(
                Some("bytes=0-1023"),
                Some("Thu, 01 Jan 1970 00:00:00 GMT"),
                8192
            ),
            RangeOutcome::Full
        );

        /* malformed specs fall back to the full body */
        assert_eq!(http_parse_ranges(Some("bytes=-"), None, 8192), RangeOutcome::Full);
        assert_eq!(http_parse_ranges(Some("bytes="), None, 8192), RangeOutcome::Full);
        assert_eq!(
            http_parse_ranges(Some("bytes=foo-bar"), None, 8192),
            RangeOutcome::Full
        );
        assert_eq!(
            http_parse_ranges(Some("bytes=1023-0"), None, 8192),
            RangeOutcome::Full
        );
        assert_eq!(http_parse_ranges(Some("ABCDEFG"), None, 8192), RangeOutcome::Full);
        assert_eq!(http_parse_ranges(None, None, 8192), RangeOutcome::Full);

        /* empty file cannot satisfy ranges */
        assert_eq!(
            http_parse_ranges(Some("bytes=0-10"), None, 0),
            RangeOutcome::Full
        );
    }
}
