//! Requested byte ranges.

use std::fmt;

/// A requested byte interval: `limit` bytes starting at `start`.
///
/// A `limit` of `0` means "until the end of the object".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Range {
    /// First byte offset.
    pub start: u64,
    /// Number of bytes requested, `0` for open-ended.
    pub limit: u64,
}

impl Range {
    /// Create a range of `limit` bytes from `start`.
    #[must_use]
    pub const fn new(start: u64, limit: u64) -> Self {
        Self { start, limit }
    }

    /// Parse a `Range` request header value.
    ///
    /// Only the single-interval `bytes=N-` and `bytes=N-M` forms are accepted.
    /// Suffix ranges (`bytes=-N`), multiple intervals and `M < N` yield `None`.
    #[must_use]
    pub fn parse(header: &str) -> Option<Self> {
        let interval = header.trim().strip_prefix("bytes=")?;
        let (start, end) = interval.split_once('-')?;
        let start = start.trim().parse::<u64>().ok()?;
        let end = end.trim();
        if end.is_empty() {
            return Some(Self::new(start, 0));
        }
        let end = end.parse::<u64>().ok()?;
        if end < start {
            return None;
        }
        let limit = (end - start).checked_add(1)?;
        Some(Self::new(start, limit))
    }

    /// Number of bytes that will actually be returned for an object of `total` bytes.
    ///
    /// Clamps to `min(limit, total - start)`, or `total - start` when open-ended.
    /// A start at or past the end yields `0`.
    #[must_use]
    pub fn accept_length(&self, total: u64) -> u64 {
        let available = total.saturating_sub(self.start);
        if self.limit == 0 {
            available
        } else {
            self.limit.min(available)
        }
    }

    /// `Content-Range` value for `length` bytes served from an object of
    /// `total` bytes, where `length` comes from [`Range::accept_length`].
    /// `None` when nothing is served.
    #[must_use]
    pub fn content_range(&self, length: u64, total: u64) -> Option<String> {
        (length > 0).then(|| {
            format!(
                "bytes {}-{}/{}",
                self.start,
                self.start + length - 1,
                total
            )
        })
    }

    /// Last byte offset when the range is bounded.
    #[must_use]
    pub fn end(&self) -> Option<u64> {
        (self.limit > 0).then(|| self.start.saturating_add(self.limit - 1))
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end() {
            Some(end) => write!(f, "bytes={}-{}", self.start, end),
            None => write!(f, "bytes={}-", self.start),
        }
    }
}
