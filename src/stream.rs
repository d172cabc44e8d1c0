//! Byte streaming with a self-describing header.
//!
//! Every stream is written as one newline-terminated JSON header followed
//! immediately by exactly `content_length` raw body bytes. The header is
//! flushed before the first body byte.

pub mod client;
pub mod local;
pub mod s3;

use crate::error::{AppError, Result};
use crate::range::RangeWindow;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Header record preceding the body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHeader {
    /// MIME type of the body.
    pub content_type: String,
    /// Number of body bytes that follow.
    pub content_length: u64,
    /// HTTP-equivalent status: 200, 206 or 416.
    pub status: u16,
    /// First byte served, for partial responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_start: Option<u64>,
    /// Last byte served, for partial responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_end: Option<u64>,
    /// `Content-Range` header value, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_range: Option<String>,
    /// `Accept-Ranges` header value, when advertised.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accept_ranges: Option<String>,
}

impl StreamHeader {
    /// Header for a locally resolved window.
    pub fn for_window(content_type: &str, window: &RangeWindow) -> Self {
        let partial = window.status == 206;
        Self {
            content_type: content_type.to_string(),
            content_length: window.content_length(),
            status: window.status,
            range_start: partial.then_some(window.start),
            range_end: partial.then_some(window.end),
            content_range: window.content_range(),
            accept_ranges: Some("bytes".to_string()),
        }
    }

    /// Encode as a single JSON line.
    pub fn to_line(&self) -> Result<Vec<u8>> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }

    /// Decode a header line (with or without the trailing newline).
    pub fn parse_line(line: &[u8]) -> Result<Self> {
        let trimmed = line.strip_suffix(b"\n").unwrap_or(line);
        let trimmed = trimmed.strip_suffix(b"\r").unwrap_or(trimmed);
        serde_json::from_slice(trimmed)
            .map_err(|_| AppError::HeaderParse(String::from_utf8_lossy(trimmed).into_owned()))
    }
}

/// Write the header, flush it, then copy exactly `content_length` bytes of `body`.
///
/// Returns the number of body bytes written. A body shorter than announced
/// is an I/O error; the header has already gone out by then.
pub async fn write_framed<R, W>(header: &StreamHeader, body: R, out: &mut W) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    out.write_all(&header.to_line()?).await?;
    out.flush().await?;

    let mut limited = body.take(header.content_length);
    let copied = tokio::io::copy(&mut limited, out).await?;
    out.flush().await?;

    if copied != header.content_length {
        return Err(AppError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!(
                "body ended after {} of {} bytes",
                copied, header.content_length
            ),
        )));
    }
    Ok(copied)
}

/// Write a header with no body.
pub async fn write_header_only<W>(header: &StreamHeader, out: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    out.write_all(&header.to_line()?).await?;
    out.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range;

    #[test]
    fn header_line_omits_absent_fields() {
        let header = StreamHeader {
            content_type: "application/pdf".to_string(),
            content_length: 10,
            status: 200,
            range_start: None,
            range_end: None,
            content_range: None,
            accept_ranges: None,
        };
        let line = header.to_line().unwrap();
        assert_eq!(
            line,
            b"{\"content_type\":\"application/pdf\",\"content_length\":10,\"status\":200}\n"
        );
        assert_eq!(StreamHeader::parse_line(&line).unwrap(), header);
    }

    #[test]
    fn unparsable_header_keeps_raw_line() {
        let err = StreamHeader::parse_line(b"<html>Bad Gateway</html>\n").unwrap_err();
        match err {
            AppError::HeaderParse(raw) => assert_eq!(raw, "<html>Bad Gateway</html>"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn framed_body_follows_header_line() {
        let window = range::resolve(Some("bytes=2-5"), 10);
        let header = StreamHeader::for_window("application/epub+zip", &window);
        let source: &[u8] = b"0123456789";

        let mut out = Vec::new();
        // The body reader is positioned at the window start by the caller.
        let written = write_framed(&header, &source[2..], &mut out).await.unwrap();
        assert_eq!(written, 4);

        let split = out.iter().position(|&b| b == b'\n').unwrap();
        let parsed = StreamHeader::parse_line(&out[..=split]).unwrap();
        assert_eq!(parsed.range_start, Some(2));
        assert_eq!(parsed.range_end, Some(5));
        assert_eq!(&out[split + 1..], b"2345");
    }

    #[tokio::test]
    async fn short_body_is_an_error() {
        let window = range::resolve(None, 10);
        let header = StreamHeader::for_window("application/pdf", &window);
        let mut out = Vec::new();
        let err = write_framed(&header, &b"abc"[..], &mut out).await;
        assert!(matches!(err, Err(AppError::Io(_))));
    }
}
