//! One-shot command execution over stdio.
//!
//! Each function performs one request and writes one response. On failure
//! nothing (db) or nothing before the header (streams) reaches the output;
//! the caller reports the error on stderr.

use crate::bridge::{self, BridgeRequest};
use crate::config::{BookFormat, BridgeMode, Config};
use crate::db::{self, migrate::MigrationReport};
use crate::error::Result;
use crate::stream::{StreamHeader, local, s3::S3Streamer};
use std::io::{Read, Write};
use std::path::Path;
use tokio::io::AsyncWrite;

/// Read one JSON request from `input`, run it, write one JSON document.
pub fn run_db<R, W>(mode: BridgeMode, db_path: &Path, mut input: R, mut output: W) -> Result<()>
where
    R: Read,
    W: Write,
{
    let mut raw = Vec::new();
    input.read_to_end(&mut raw)?;
    let request = BridgeRequest::from_json(&raw)?;

    let conn = db::open_connection(db_path)?;
    let response = bridge::run(&conn, &request, mode)?;
    drop(conn);

    // Serialize fully before the first byte goes out.
    let line = response.to_line()?;
    output.write_all(&line)?;
    output.flush()?;
    Ok(())
}

/// Stream a local file with header framing.
pub async fn run_serve_file<W>(
    path: &Path,
    format: BookFormat,
    range: Option<&str>,
    out: &mut W,
) -> Result<StreamHeader>
where
    W: AsyncWrite + Unpin,
{
    local::serve(path, format, range, out).await
}

/// Stream an object from the configured bucket with header framing.
pub async fn run_s3_stream<W>(
    config: &Config,
    key: &str,
    range: Option<&str>,
    out: &mut W,
) -> Result<StreamHeader>
where
    W: AsyncWrite + Unpin,
{
    let streamer = S3Streamer::from_config(&config.s3)?;
    streamer.stream_to(key, range, out).await
}

/// Apply pending migrations to `db_path`.
pub fn run_migrate(db_path: &Path, script: Option<&Path>) -> Result<MigrationReport> {
    let script = match script {
        Some(path) => std::fs::read_to_string(path)?,
        None => db::migrate::INITIAL_SCRIPT.to_string(),
    };

    let conn = db::open_connection(db_path)?;
    let report = db::migrate::run(&conn, &script)?;
    tracing::info!(
        db = %db_path.display(),
        initial = report.initial_applied,
        fixup = report.unique_fixup_applied,
        duplicates_removed = report.duplicates_removed,
        source_columns = report.source_columns_applied,
        "Migration finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AppError;

    fn migrated_db() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("library.db");
        run_migrate(&path, None).unwrap();
        (dir, path)
    }

    #[test]
    fn db_request_writes_one_document() {
        let (_dir, path) = migrated_db();

        let mut out = Vec::new();
        run_db(
            BridgeMode::QueryOne,
            &path,
            &br#"{"sql":"SELECT value FROM settings WHERE key = ?1","params":["library_version"]}"#[..],
            &mut out,
        )
        .unwrap();

        let doc: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(doc["row"]["value"], "0");
    }

    #[test]
    fn failed_db_request_writes_nothing() {
        let (_dir, path) = migrated_db();

        let mut out = Vec::new();
        let err = run_db(
            BridgeMode::QueryAll,
            &path,
            &br#"{"sql":"SELECT * FROM books WHERE id = ?1","params":[]}"#[..],
            &mut out,
        )
        .unwrap_err();

        assert!(matches!(err, AppError::InvalidRequest(_)));
        assert!(out.is_empty());
    }

    #[test]
    fn bridge_does_not_create_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh.db");

        let mut out = Vec::new();
        let err = run_db(
            BridgeMode::QueryAll,
            &path,
            &br#"{"sql":"SELECT * FROM users"}"#[..],
            &mut out,
        )
        .unwrap_err();

        assert!(matches!(err, AppError::Database(_)));
        assert!(out.is_empty());
    }

    #[test]
    fn migrate_twice_is_a_no_op() {
        let (_dir, path) = migrated_db();
        let report = run_migrate(&path, None).unwrap();
        assert!(!report.changed());
    }
}
