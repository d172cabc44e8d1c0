pub mod migrate;
mod schema;

pub use schema::{Database, InsertOutcome};

use crate::config::BookFormat;
use crate::error::{AppError, Result};
use chrono::Utc;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// How long a connection waits on the writer lock before giving up.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings key of the library change counter.
pub const LIBRARY_VERSION_KEY: &str = "library_version";

/// Open a connection with WAL journaling and foreign keys enforced.
pub fn open_connection(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(path)
        .map_err(|e| AppError::Internal(format!("Failed to open database: {}", e)))?;
    configure(&conn)?;
    Ok(conn)
}

/// Apply connection pragmas.
pub fn configure(conn: &Connection) -> Result<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    // journal_mode returns a row, so it cannot go through execute().
    conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(())
}

/// User account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Unique user ID.
    pub id: String,
    /// Email used to log in.
    pub email: String,
    /// Argon2 password hash.
    #[serde(skip_serializing)]
    pub password_hash: String,
    /// Display name.
    pub name: Option<String>,
    /// User role: "admin" or "user".
    pub role: String,
    /// Account creation timestamp.
    pub created_at: i64,
    /// Last update timestamp.
    pub updated_at: i64,
}

/// Where a book's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookSource {
    /// A file on local disk; `file_path` is absolute.
    Local,
    /// An object in the configured bucket; `file_path` is the key.
    S3,
}

impl BookSource {
    /// Value stored in the `source` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            BookSource::Local => "local",
            BookSource::S3 => "s3",
        }
    }

    /// Parse a stored value, defaulting to local.
    pub fn parse(value: &str) -> Self {
        match value {
            "s3" => BookSource::S3,
            _ => BookSource::Local,
        }
    }
}

/// Stored book row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredBook {
    /// Book ID.
    pub id: String,
    /// Book title.
    pub title: String,
    /// Primary author.
    pub author: Option<String>,
    /// Book description.
    pub description: Option<String>,
    /// Book format.
    pub file_type: BookFormat,
    /// Absolute path or object key.
    pub file_path: String,
    /// File size in bytes.
    pub file_size: i64,
    /// SHA-256 of the file bytes, hex encoded.
    pub file_hash: String,
    /// Path of the extracted cover image.
    pub cover_path: Option<String>,
    /// Page count (pdf only).
    pub page_count: Option<i64>,
    /// Where the file lives.
    pub source: BookSource,
    /// Remote entity tag, used to detect remote changes.
    pub source_etag: Option<String>,
    /// Creation timestamp.
    pub added_at: i64,
    /// Last update timestamp.
    pub updated_at: i64,
}

/// Reading status of a book for a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingStatus {
    /// Not opened yet.
    NotStarted,
    /// In progress.
    Reading,
    /// Finished.
    Completed,
}

impl ReadingStatus {
    /// Value stored in the `status` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadingStatus::NotStarted => "not_started",
            ReadingStatus::Reading => "reading",
            ReadingStatus::Completed => "completed",
        }
    }

    /// Parse a stored value.
    pub fn parse(value: &str) -> Self {
        match value {
            "completed" => ReadingStatus::Completed,
            "reading" => ReadingStatus::Reading,
            _ => ReadingStatus::NotStarted,
        }
    }
}

/// A reader's new position in a book.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressUpdate {
    /// Page based position.
    Pdf {
        /// Current page, 1-based.
        current_page: i64,
        /// Total pages.
        total_pages: i64,
    },
    /// CFI based position.
    Epub {
        /// CFI location string.
        location: String,
        /// Percentage reported by the reader (0-100).
        percent: f64,
    },
}

impl ProgressUpdate {
    /// Percentage complete, clamped to 0-100.
    pub fn percent_complete(&self) -> f64 {
        let raw = match self {
            ProgressUpdate::Pdf {
                current_page,
                total_pages,
            } => {
                if *total_pages <= 0 {
                    0.0
                } else {
                    (*current_page as f64 / *total_pages as f64) * 100.0
                }
            }
            ProgressUpdate::Epub { percent, .. } => *percent,
        };
        if raw.is_nan() { 0.0 } else { raw.clamp(0.0, 100.0) }
    }

    /// Status implied by this position.
    pub fn status(&self) -> ReadingStatus {
        let completed = match self {
            ProgressUpdate::Pdf {
                current_page,
                total_pages,
            } => *total_pages > 0 && current_page >= total_pages,
            ProgressUpdate::Epub { percent, .. } => *percent >= 100.0,
        };
        let started = match self {
            ProgressUpdate::Pdf { current_page, .. } => *current_page > 0,
            ProgressUpdate::Epub { location, percent } => !location.is_empty() || *percent > 0.0,
        };

        if completed {
            ReadingStatus::Completed
        } else if started {
            ReadingStatus::Reading
        } else {
            ReadingStatus::NotStarted
        }
    }
}

/// Reading progress for a book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadingProgress {
    /// Progress ID.
    pub id: i64,
    /// User ID.
    pub user_id: String,
    /// Book ID.
    pub book_id: String,
    /// Current page number (pdf).
    pub current_page: Option<i64>,
    /// CFI location (epub).
    pub epub_location: Option<String>,
    /// Total pages in book.
    pub total_pages: Option<i64>,
    /// Reading percentage (0.0 - 100.0).
    pub percent_complete: f64,
    /// Reading status.
    pub status: ReadingStatus,
    /// Last update timestamp.
    pub last_read_at: i64,
}

/// Named set of books owned by a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    /// Collection ID.
    pub id: String,
    /// Owner.
    pub user_id: String,
    /// Name, at most 100 characters.
    pub name: String,
    /// Description.
    pub description: Option<String>,
    /// Public share token when shared.
    pub share_token: Option<String>,
    /// When sharing was enabled.
    pub shared_at: Option<i64>,
    /// Creation timestamp.
    pub created_at: i64,
}

/// Timestamp helper.
pub fn now_timestamp() -> i64 {
    Utc::now().timestamp()
}
