//! `Range` header resolution for partial-content responses.
//!
//! Only the first range of a multi-range request is honored; multipart
//! byteranges bodies are not produced.

use crate::error::ServiceError;

/// Inclusive byte interval `[start, end]` within a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes covered; never zero.
    pub fn length(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range` value for a payload of `total` bytes.
    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeRequest {
    /// No `Range` header: serve the whole payload.
    Full,
    Partial(ByteRange),
}

/// Resolves a raw `Range` header against a payload of `len` bytes.
///
/// Malformed and unsatisfiable headers both yield
/// [`ServiceError::RangeNotSatisfiable`].
pub fn resolve(header: Option<&str>, len: u64) -> Result<RangeRequest, ServiceError> {
    let Some(header) = header else {
        return Ok(RangeRequest::Full);
    };
    let unsatisfiable = || ServiceError::RangeNotSatisfiable { len };

    let ranges = header
        .trim()
        .strip_prefix("bytes=")
        .ok_or_else(unsatisfiable)?;
    let first = ranges
        .split(',')
        .map(str::trim)
        .find(|part| !part.is_empty())
        .ok_or_else(unsatisfiable)?;
    let (start, end) = first.split_once('-').ok_or_else(unsatisfiable)?;
    let (start, end) = (start.trim(), end.trim());

    let (start, end) = if start.is_empty() {
        // Suffix form: the last `n` bytes, clamped to the whole payload.
        let suffix = parse_offset(end).ok_or_else(unsatisfiable)?;
        if suffix == 0 || len == 0 {
            return Err(unsatisfiable());
        }
        (len.saturating_sub(suffix), len - 1)
    } else {
        let start = parse_offset(start).ok_or_else(unsatisfiable)?;
        let end = if end.is_empty() {
            len.checked_sub(1).ok_or_else(unsatisfiable)?
        } else {
            parse_offset(end).ok_or_else(unsatisfiable)?
        };
        (start, end)
    };

    if start > end || end >= len {
        return Err(unsatisfiable());
    }
    Ok(RangeRequest::Partial(ByteRange { start, end }))
}

fn parse_offset(value: &str) -> Option<u64> {
    if value.is_empty() || !value.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}
