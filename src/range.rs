//! HTTP `Range` header resolution shared by every byte source.

use crate::error::{AppError, Result};

/// Serving window computed for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeWindow {
    /// 200, 206 or 416.
    pub status: u16,
    /// First byte served.
    pub start: u64,
    /// Last byte served, inclusive.
    pub end: u64,
    /// Length of the whole resource.
    pub total: u64,
}

impl RangeWindow {
    /// Whether the request cannot be satisfied.
    pub fn is_unsatisfiable(&self) -> bool {
        self.status == 416
    }

    /// Number of body bytes to send.
    pub fn content_length(&self) -> u64 {
        match self.status {
            416 => 0,
            200 => self.total,
            _ => self.end - self.start + 1,
        }
    }

    /// `Content-Range` value for partial and unsatisfiable responses.
    pub fn content_range(&self) -> Option<String> {
        match self.status {
            206 => Some(format!("bytes {}-{}/{}", self.start, self.end, self.total)),
            416 => Some(format!("bytes */{}", self.total)),
            _ => None,
        }
    }
}

/// Resolve a `Range` header against a resource of `total` bytes.
///
/// Any malformed or out-of-bounds header yields a 416 window. A range that
/// covers the whole resource is served as a plain 200.
pub fn resolve(header: Option<&str>, total: u64) -> RangeWindow {
    let Some(header) = header else {
        return RangeWindow {
            status: 200,
            start: 0,
            end: total.saturating_sub(1),
            total,
        };
    };

    match parse_bounds(header, total) {
        Ok((start, end)) => RangeWindow {
            status: if start == 0 && end + 1 == total { 200 } else { 206 },
            start,
            end,
            total,
        },
        Err(e) => {
            tracing::debug!(header = %header, total, error = %e, "Unsatisfiable range");
            RangeWindow {
                status: 416,
                start: 0,
                end: 0,
                total,
            }
        }
    }
}

/// Parse `bytes=<start>-<end>` into an inclusive, in-bounds interval.
fn parse_bounds(header: &str, total: u64) -> Result<(u64, u64)> {
    let spec = header
        .trim()
        .strip_prefix("bytes=")
        .ok_or_else(|| AppError::InvalidRequest("range unit must be bytes".to_string()))?;
    let (first, last) = spec
        .split_once('-')
        .ok_or_else(|| AppError::InvalidRequest("missing '-' in range".to_string()))?;

    let number = |s: &str| -> Result<Option<i128>> {
        if s.is_empty() {
            return Ok(None);
        }
        if !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AppError::InvalidRequest(format!("bad range bound '{}'", s)));
        }
        s.parse::<i128>()
            .map(Some)
            .map_err(|_| AppError::InvalidRequest(format!("range bound too large '{}'", s)))
    };

    let total = i128::from(total);
    let (start, end) = match (number(first)?, number(last)?) {
        (None, None) => {
            return Err(AppError::InvalidRequest("empty range".to_string()));
        }
        (None, Some(suffix)) => (total - suffix, total - 1),
        (Some(start), None) => (start, total - 1),
        (Some(start), Some(end)) => (start, end),
    };

    if start < 0 || start >= total || end >= total || start > end {
        return Err(AppError::InvalidRequest(format!(
            "range {}-{} outside 0-{}",
            start,
            end,
            total - 1
        )));
    }

    Ok((start as u64, end as u64))
}
