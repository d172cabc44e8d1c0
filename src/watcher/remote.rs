//! Ingestion from an S3 bucket.
//!
//! Each poll lists the bucket under the configured prefix and reconciles the
//! `source = 's3'` rows against the listing: unknown keys are downloaded and
//! added, keys whose size or entity tag moved go through the change path, and
//! rows whose key vanished are removed.

use crate::config::{BookFormat, S3Config};
use crate::db::{BookSource, StoredBook};
use crate::error::{AppError, Result};
use crate::stream::s3::build_client;
use crate::watcher::{Candidate, Ingestor, Outcome};
use aws_sdk_s3::{Client, error::DisplayErrorContext};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;

/// One object in a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    /// Object key.
    pub key: String,
    /// Object size in bytes.
    pub size: i64,
    /// Entity tag, quotes included as the store returns it.
    pub etag: Option<String>,
}

/// Reconciliation step for one key.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteAction {
    /// Key not in the database yet.
    Add(RemoteEntry),
    /// Key known but its object changed.
    Change(RemoteEntry),
    /// Row whose key is gone from the bucket.
    Remove(Box<StoredBook>),
}

/// Objects whose bytes were already in the library under another book,
/// remembered with the size and tag they had when skipped.
#[derive(Debug, Default, Clone)]
pub struct SkippedKeys(HashMap<String, RemoteEntry>);

impl SkippedKeys {
    /// Whether `entry` was skipped and has not changed since.
    pub fn contains(&self, entry: &RemoteEntry) -> bool {
        self.0.get(&entry.key) == Some(entry)
    }

    /// Remember a skipped object.
    pub fn insert(&mut self, entry: RemoteEntry) {
        self.0.insert(entry.key.clone(), entry);
    }

    /// Forget a key.
    pub fn forget(&mut self, key: &str) {
        self.0.remove(key);
    }

    /// Drop keys missing from `listing`.
    pub fn retain_listed(&mut self, listing: &[RemoteEntry]) {
        let listed: HashSet<&str> = listing.iter().map(|e| e.key.as_str()).collect();
        self.0.retain(|key, _| listed.contains(key.as_str()));
    }

    /// Number of remembered keys.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Compare known rows with a listing. Non-book keys and unchanged skipped
/// objects are ignored.
pub fn plan(
    known: &[StoredBook],
    listing: &[RemoteEntry],
    skipped: &SkippedKeys,
) -> Vec<RemoteAction> {
    let by_key: HashMap<&str, &StoredBook> =
        known.iter().map(|b| (b.file_path.as_str(), b)).collect();
    let listed: HashMap<&str, &RemoteEntry> = listing
        .iter()
        .filter(|e| BookFormat::from_path(&e.key).is_some())
        .map(|e| (e.key.as_str(), e))
        .collect();

    let mut actions: Vec<RemoteAction> = known
        .iter()
        .filter(|b| !listed.contains_key(b.file_path.as_str()))
        .map(|b| RemoteAction::Remove(Box::new(b.clone())))
        .collect();

    for entry in listing {
        if !listed.contains_key(entry.key.as_str()) || skipped.contains(entry) {
            continue;
        }
        match by_key.get(entry.key.as_str()) {
            None => actions.push(RemoteAction::Add(entry.clone())),
            Some(book) => {
                let etag_moved = matches!(
                    (&book.source_etag, &entry.etag),
                    (Some(old), Some(new)) if old != new
                );
                if book.file_size != entry.size || etag_moved {
                    actions.push(RemoteAction::Change(entry.clone()));
                }
            }
        }
    }

    actions
}

/// Counts from one poll.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollSummary {
    /// Objects listed.
    pub listed: usize,
    /// New rows.
    pub added: usize,
    /// Rows re-extracted.
    pub updated: usize,
    /// Rows removed.
    pub removed: usize,
    /// Objects skipped as duplicate content.
    pub duplicates: usize,
    /// Objects that failed.
    pub failed: usize,
}

/// A bucket (and optional key prefix) to ingest from.
#[derive(Debug, Clone)]
pub struct RemoteSource {
    client: Client,
    bucket: String,
    prefix: Option<String>,
    timeout: Duration,
}

impl RemoteSource {
    /// Create a source; missing bucket or credentials is a configuration error.
    pub fn from_config(config: &S3Config) -> Result<Self> {
        let bucket = config.credentials()?.bucket;
        Ok(Self {
            client: build_client(config)?,
            bucket,
            prefix: config.prefix.clone().filter(|p| !p.is_empty()),
            timeout: config.timeout(),
        })
    }

    /// List every object under the prefix.
    pub async fn list(&self) -> Result<Vec<RemoteEntry>> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .set_prefix(self.prefix.clone())
            .into_paginator()
            .send();

        let mut entries = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| {
                AppError::StreamFailed(format!("Failed to list bucket: {}", DisplayErrorContext(&e)))
            })?;
            for object in page.contents() {
                let Some(key) = object.key() else {
                    continue;
                };
                entries.push(RemoteEntry {
                    key: key.to_string(),
                    size: object.size().unwrap_or(0),
                    etag: object.e_tag().map(String::from),
                });
            }
        }
        Ok(entries)
    }

    /// Download `key` into a temporary file that is deleted when dropped.
    pub async fn download(&self, key: &str) -> Result<NamedTempFile> {
        let request = self.client.get_object().bucket(&self.bucket).key(key).send();
        let output = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| AppError::Timeout(self.timeout))?
            .map_err(|e| {
                AppError::StreamFailed(format!("Failed to fetch {}: {}", key, DisplayErrorContext(&e)))
            })?;

        let scratch = scratch_file(key)?;
        let mut file = tokio::fs::File::from_std(scratch.reopen()?);
        let mut body = output.body.into_async_read();
        tokio::io::copy(&mut body, &mut file).await?;
        file.flush().await?;
        Ok(scratch)
    }
}

/// Temporary file keeping the key's extension, so format detection still works.
fn scratch_file(key: &str) -> Result<NamedTempFile> {
    let suffix = Path::new(key)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    Ok(tempfile::Builder::new()
        .prefix("ebook-bridge-")
        .suffix(&suffix)
        .tempfile()?)
}

/// List, plan and apply one reconciliation pass.
///
/// Objects that resolve to duplicates are recorded in `skipped` and not
/// downloaded again until their size or tag changes.
pub async fn poll_once(
    source: &RemoteSource,
    ingestor: &Ingestor,
    skipped: &mut SkippedKeys,
) -> Result<PollSummary> {
    let listing = source.list().await?;
    skipped.retain_listed(&listing);
    let known = ingestor.db().get_books_by_source(BookSource::S3)?;
    let actions = plan(&known, &listing, skipped);

    let mut summary = PollSummary {
        listed: listing.len(),
        ..PollSummary::default()
    };

    for action in actions {
        let changed = matches!(action, RemoteAction::Change(_));
        match action {
            RemoteAction::Remove(book) => match ingestor.remove(&book) {
                Ok(()) => summary.removed += 1,
                Err(e) => {
                    summary.failed += 1;
                    tracing::error!(key = %book.file_path, error = %e, "Failed to remove object");
                }
            },
            RemoteAction::Add(entry) | RemoteAction::Change(entry) => {
                let key = entry.key.clone();
                match ingest_entry(source, ingestor, entry.clone(), changed).await {
                    Ok(Outcome::Added { .. }) => {
                        skipped.forget(&key);
                        summary.added += 1;
                    }
                    Ok(Outcome::Updated { .. }) => {
                        skipped.forget(&key);
                        summary.updated += 1;
                    }
                    Ok(Outcome::Duplicate { .. }) => {
                        skipped.insert(entry);
                        summary.duplicates += 1;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        summary.failed += 1;
                        tracing::error!(key = %key, error = %e, "Failed to ingest object");
                    }
                }
            }
        }
    }

    if summary.removed > 0 {
        ingestor.db().bump_library_version()?;
    }
    Ok(summary)
}

async fn ingest_entry(
    source: &RemoteSource,
    ingestor: &Ingestor,
    entry: RemoteEntry,
    changed: bool,
) -> Result<Outcome> {
    let format = BookFormat::from_path(&entry.key)
        .ok_or_else(|| AppError::InvalidFormat(format!("Not a book: {}", entry.key)))?;
    let scratch = source.download(&entry.key).await?;

    let ingestor = ingestor.clone();
    tokio::task::spawn_blocking(move || {
        let candidate = Candidate {
            file_path: &entry.key,
            local: scratch.path(),
            format,
            source: BookSource::S3,
            etag: entry.etag.as_deref(),
        };
        if changed {
            ingestor.change(candidate)
        } else {
            ingestor.add(candidate)
        }
    })
    .await
    .map_err(|e| AppError::Internal(format!("Ingest task failed: {}", e)))?
}

/// Poll every `interval` until `shutdown` resolves. Poll failures are logged.
pub async fn run<F>(source: RemoteSource, ingestor: Ingestor, interval: Duration, shutdown: F)
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut skipped = SkippedKeys::default();

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Remote watcher stopping");
                return;
            }
            _ = ticker.tick() => {
                match poll_once(&source, &ingestor, &mut skipped).await {
                    Ok(summary) => tracing::info!(
                        listed = summary.listed,
                        added = summary.added,
                        updated = summary.updated,
                        removed = summary.removed,
                        duplicates = summary.duplicates,
                        failed = summary.failed,
                        "Remote poll complete"
                    ),
                    Err(e) => tracing::error!(error = %e, "Remote poll failed"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BookFormat;

    fn book(key: &str, size: i64, etag: Option<&str>) -> StoredBook {
        StoredBook {
            id: format!("id-{}", key),
            title: key.to_string(),
            author: None,
            description: None,
            file_type: BookFormat::from_path(key).unwrap_or(BookFormat::Pdf),
            file_path: key.to_string(),
            file_size: size,
            file_hash: format!("hash-{}", key),
            cover_path: None,
            page_count: None,
            source: BookSource::S3,
            source_etag: etag.map(String::from),
            added_at: 0,
            updated_at: 0,
        }
    }

    fn entry(key: &str, size: i64, etag: Option<&str>) -> RemoteEntry {
        RemoteEntry {
            key: key.to_string(),
            size,
            etag: etag.map(String::from),
        }
    }

    #[test]
    fn plan_reconciles_listing() {
        let known = vec![
            book("books/same.pdf", 10, Some("\"a\"")),
            book("books/resized.epub", 10, None),
            book("books/retagged.pdf", 10, Some("\"a\"")),
            book("books/gone.pdf", 10, None),
        ];
        let listing = vec![
            entry("books/same.pdf", 10, Some("\"a\"")),
            entry("books/resized.epub", 11, None),
            entry("books/retagged.pdf", 10, Some("\"b\"")),
            entry("books/new.epub", 5, None),
            entry("books/readme.txt", 5, None),
        ];

        let actions = plan(&known, &listing, &SkippedKeys::default());
        assert_eq!(
            actions,
            vec![
                RemoteAction::Remove(Box::new(book("books/gone.pdf", 10, None))),
                RemoteAction::Change(entry("books/resized.epub", 11, None)),
                RemoteAction::Change(entry("books/retagged.pdf", 10, Some("\"b\""))),
                RemoteAction::Add(entry("books/new.epub", 5, None)),
            ]
        );
    }

    #[test]
    fn skipped_duplicates_are_not_planned_again() {
        let known = vec![book("books/a.pdf", 10, Some("\"a\""))];
        let copy = entry("books/copy-of-a.pdf", 10, Some("\"c\""));
        let resized = entry("books/a.pdf", 12, Some("\"a2\""));
        let listing = vec![copy.clone(), resized.clone()];

        let mut skipped = SkippedKeys::default();
        assert_eq!(
            plan(&known, &listing, &skipped),
            vec![
                RemoteAction::Add(copy.clone()),
                RemoteAction::Change(resized.clone()),
            ]
        );

        // Both resolved to content already in the library.
        skipped.insert(copy.clone());
        skipped.insert(resized);
        assert!(plan(&known, &listing, &skipped).is_empty());

        // A new upload under the same key is looked at again.
        let reuploaded = entry("books/copy-of-a.pdf", 11, Some("\"d\""));
        assert_eq!(
            plan(&known, &[reuploaded.clone()], &skipped),
            vec![
                RemoteAction::Remove(Box::new(book("books/a.pdf", 10, Some("\"a\"")))),
                RemoteAction::Add(reuploaded),
            ]
        );

        skipped.retain_listed(&[copy]);
        assert_eq!(skipped.len(), 1);
    }

    #[test]
    fn scratch_file_keeps_extension_and_is_removed_on_drop() {
        let scratch = scratch_file("a/b/book.epub").unwrap();
        std::fs::write(scratch.path(), b"x").unwrap();
        let path = scratch.path().to_path_buf();
        assert_eq!(path.extension().unwrap(), "epub");
        assert_eq!(BookFormat::from_path(&path), Some(BookFormat::Epub));

        drop(scratch);
        assert!(!path.exists());
    }
}
