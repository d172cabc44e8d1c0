//! Local file streaming.

use crate::config::BookFormat;
use crate::error::{AppError, Result};
use crate::range;
use crate::stream::{StreamHeader, write_framed, write_header_only};
use std::io::SeekFrom;
use std::path::Path;
use tokio::io::{AsyncSeekExt, AsyncWrite};

/// Stream `path` (or the requested window of it) to `out`.
pub async fn serve<W>(
    path: &Path,
    format: BookFormat,
    range_header: Option<&str>,
    out: &mut W,
) -> Result<StreamHeader>
where
    W: AsyncWrite + Unpin,
{
    let metadata = match tokio::fs::metadata(path).await {
        Ok(m) if m.is_file() => m,
        Ok(_) => {
            return Err(AppError::NotFound(format!(
                "Not a regular file: {}",
                path.display()
            )));
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(AppError::NotFound(format!(
                "File not found: {}",
                path.display()
            )));
        }
        Err(e) => return Err(e.into()),
    };

    let window = range::resolve(range_header, metadata.len());
    let header = StreamHeader::for_window(format.mime_type(), &window);

    if window.is_unsatisfiable() {
        write_header_only(&header, out).await?;
        return Ok(header);
    }

    let mut file = tokio::fs::File::open(path).await?;
    if window.start > 0 {
        file.seek(SeekFrom::Start(window.start)).await?;
    }

    let sent = write_framed(&header, file, out).await?;
    tracing::debug!(
        path = %path.display(),
        status = header.status,
        bytes = sent,
        "Served local file"
    );

    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn thousand_byte_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        file.write_all(&data).unwrap();
        file.flush().unwrap();
        file
    }

    fn split(out: &[u8]) -> (StreamHeader, &[u8]) {
        let nl = out.iter().position(|&b| b == b'\n').unwrap();
        (StreamHeader::parse_line(&out[..=nl]).unwrap(), &out[nl + 1..])
    }

    #[tokio::test]
    async fn partial_request_serves_exact_window() {
        let file = thousand_byte_file();
        let mut out = Vec::new();
        serve(file.path(), BookFormat::Pdf, Some("bytes=500-699"), &mut out)
            .await
            .unwrap();

        let (header, body) = split(&out);
        assert_eq!(header.status, 206);
        assert_eq!(header.content_length, 200);
        assert_eq!(header.content_range.as_deref(), Some("bytes 500-699/1000"));
        assert_eq!(header.content_type, "application/pdf");
        assert_eq!(header.accept_ranges.as_deref(), Some("bytes"));
        assert_eq!(body.len(), 200);
        assert_eq!(body[0], (500 % 251) as u8);
    }

    #[tokio::test]
    async fn full_request_serves_whole_file() {
        let file = thousand_byte_file();
        let mut out = Vec::new();
        serve(file.path(), BookFormat::Epub, None, &mut out).await.unwrap();

        let (header, body) = split(&out);
        assert_eq!(header.status, 200);
        assert_eq!(header.content_type, "application/epub+zip");
        assert_eq!(header.content_range, None);
        assert_eq!(body.len(), 1000);
    }

    #[tokio::test]
    async fn unsatisfiable_request_has_no_body() {
        let file = thousand_byte_file();
        let mut out = Vec::new();
        serve(file.path(), BookFormat::Pdf, Some("bytes=1000-"), &mut out)
            .await
            .unwrap();

        let (header, body) = split(&out);
        assert_eq!(header.status, 416);
        assert_eq!(header.content_range.as_deref(), Some("bytes */1000"));
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn missing_file_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut out = Vec::new();
        let err = serve(&dir.path().join("gone.pdf"), BookFormat::Pdf, None, &mut out)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert_eq!(err.status_code(), 404);
        assert!(out.is_empty());
    }
}
