//! ebook-bridge: storage and streaming plumbing for a self-hosted e-book server.
//!
//! The web layer talks to this crate through one-shot subcommands over stdio:
//!
//! - `db query-all|query-one|execute`: run one SQL request against the
//!   library database (WAL, foreign keys on) and print one JSON document
//! - `serve-file` / `s3-stream`: a JSON header line followed by exactly
//!   `content_length` raw bytes, with HTTP range support
//! - `migrate`: idempotent schema migrations
//!
//! Long-lived subcommands keep the database in sync with a library directory
//! (`watch`) or an S3 bucket (`watch-s3`): content-hash deduplication, cover
//! extraction, orphan removal and a `library_version` change counter.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Password hashing and user management.
pub mod auth;
/// SQL request bridge.
pub mod bridge;
/// Configuration and CLI.
pub mod config;
/// Database operations.
pub mod db;
/// Error types.
pub mod error;
/// Book format handlers.
pub mod formats;
/// Book files, hashing and covers.
pub mod library;
/// HTTP byte range resolution.
pub mod range;
/// One-shot stdio commands.
pub mod router;
/// Header-framed byte streams.
pub mod stream;
/// Library watcher and ingestion.
pub mod watcher;


pub use config::{Cli, Command, Config};
pub use db::Database;
pub use error::{AppError, Result};
