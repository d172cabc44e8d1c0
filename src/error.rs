use std::time::Duration;
use thiserror::Error;

/// Main error type for the application.
#[derive(Error, Debug)]
pub enum AppError {
    /// Resource not found error.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed request (bad range, parameter mismatch, bad JSON input).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Invalid format error.
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// ZIP archive error.
    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// PDF processing error.
    #[error("PDF error: {0}")]
    Pdf(String),

    /// XML parsing error.
    #[error("XML parsing error: {0}")]
    Xml(#[from] roxmltree::Error),

    /// Image processing error.
    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Database engine error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The remote stream failed before a response header was obtained.
    #[error("Stream failed before header: {0}")]
    StreamFailed(String),

    /// A response arrived but its header line could not be parsed.
    #[error("Failed to parse stream header: {0}")]
    HeaderParse(String),

    /// The remote operation exceeded its time bound.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// HTTP-equivalent status a caller should present for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::NotFound(_) => 404,
            AppError::InvalidRequest(_) | AppError::InvalidFormat(_) => 400,
            AppError::StreamFailed(_) => 502,
            AppError::Timeout(_) => 504,
            _ => 500,
        }
    }

    /// Stable tag written to stderr so callers can classify failures.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "not_found",
            AppError::InvalidRequest(_) | AppError::InvalidFormat(_) => "invalid_request",
            AppError::Config(_) => "config",
            AppError::StreamFailed(_) => "stream_failed",
            AppError::HeaderParse(_) => "header_parse",
            AppError::Timeout(_) => "timeout",
            AppError::Database(_) => "database",
            _ => "internal",
        }
    }
}

/// Result type alias for the application.
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_errors_map_to_distinct_statuses() {
        assert_eq!(AppError::StreamFailed("refused".into()).status_code(), 502);
        assert_eq!(AppError::HeaderParse("garbage".into()).status_code(), 500);
        assert_eq!(AppError::Timeout(Duration::from_secs(30)).status_code(), 504);
        assert_eq!(AppError::NotFound("/x.pdf".into()).status_code(), 404);
        assert_eq!(AppError::Config("missing bucket".into()).status_code(), 500);
    }

    #[test]
    fn kinds_are_distinguishable() {
        assert_eq!(AppError::StreamFailed(String::new()).kind(), "stream_failed");
        assert_eq!(AppError::HeaderParse(String::new()).kind(), "header_parse");
        assert_eq!(AppError::Timeout(Duration::from_secs(1)).kind(), "timeout");
    }
}
