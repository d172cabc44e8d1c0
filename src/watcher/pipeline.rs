//! Ingestion of add, change and unlink events into the database.

use crate::config::BookFormat;
use crate::db::{BookSource, Database, InsertOutcome, StoredBook, now_timestamp};
use crate::error::Result;
use crate::formats;
use crate::library::{BookFile, CoverStore, FileDigest, sha256_file};
use std::path::{Path, PathBuf};

/// A filesystem change, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
    /// A file appeared.
    Add(PathBuf),
    /// A file's contents or timestamps changed.
    Change(PathBuf),
    /// A file disappeared.
    Unlink(PathBuf),
}

impl FileEvent {
    /// Path the event is about.
    pub fn path(&self) -> &Path {
        match self {
            FileEvent::Add(p) | FileEvent::Change(p) | FileEvent::Unlink(p) => p,
        }
    }
}

/// What handling an event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A new book row was inserted.
    Added {
        /// New book id.
        id: String,
    },
    /// The content is already in the library under another book.
    Duplicate {
        /// Id of the book already holding the content.
        existing_id: String,
    },
    /// A tracked book was re-extracted.
    Updated {
        /// Book id.
        id: String,
    },
    /// Hash unchanged, nothing to do.
    Unchanged,
    /// A tracked book was deleted.
    Removed {
        /// Book id.
        id: String,
    },
    /// The path has no book row.
    Untracked,
    /// Not a book file.
    Ignored,
}

/// File to ingest, wherever its bytes came from.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    /// Value stored in `books.file_path`: absolute path or object key.
    pub file_path: &'a str,
    /// Readable local copy of the bytes.
    pub local: &'a Path,
    /// Book format.
    pub format: BookFormat,
    /// Where the book lives.
    pub source: BookSource,
    /// Remote entity tag, if any.
    pub etag: Option<&'a str>,
}

/// Applies file events to the database and cover store.
#[derive(Clone)]
pub struct Ingestor {
    db: Database,
    covers: CoverStore,
}

impl Ingestor {
    /// Create an ingestor.
    pub fn new(db: Database, covers: CoverStore) -> Self {
        Self { db, covers }
    }

    /// Database handle.
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Handle an event, logging failures with the path instead of returning them.
    pub fn dispatch(&self, event: &FileEvent) -> Option<Outcome> {
        let result = match event {
            FileEvent::Add(path) => self.handle_add(path),
            FileEvent::Change(path) => self.handle_change(path),
            FileEvent::Unlink(path) => self.handle_unlink(path),
        };

        match result {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                tracing::error!(path = %event.path().display(), error = %e, "Failed to process file event");
                None
            }
        }
    }

    /// A local file appeared.
    pub fn handle_add(&self, path: &Path) -> Result<Outcome> {
        let Some(file) = crate::library::classify(path) else {
            return Ok(Outcome::Ignored);
        };
        let file_path = local_key(&file);
        self.add(Candidate {
            file_path: &file_path,
            local: &file.path,
            format: file.format,
            source: BookSource::Local,
            etag: None,
        })
    }

    /// A local file changed.
    pub fn handle_change(&self, path: &Path) -> Result<Outcome> {
        let Some(file) = crate::library::classify(path) else {
            return Ok(Outcome::Ignored);
        };
        let file_path = local_key(&file);
        self.change(Candidate {
            file_path: &file_path,
            local: &file.path,
            format: file.format,
            source: BookSource::Local,
            etag: None,
        })
    }

    /// A local file disappeared.
    pub fn handle_unlink(&self, path: &Path) -> Result<Outcome> {
        if BookFormat::from_path(path).is_none() {
            return Ok(Outcome::Ignored);
        }
        let file_path = path.to_string_lossy();
        let Some(book) = self.db.get_book_by_path(&file_path)? else {
            tracing::warn!(path = %path.display(), "Unlink for untracked file");
            return Ok(Outcome::Untracked);
        };

        self.remove(&book)?;
        self.db.bump_library_version()?;
        Ok(Outcome::Removed { id: book.id })
    }

    /// Insert a new book unless its content is already known.
    pub fn add(&self, candidate: Candidate<'_>) -> Result<Outcome> {
        let digest = sha256_file(candidate.local)?;

        if let Some(existing) = self.db.get_book_by_hash(&digest.hash)? {
            // Already ingested from this very path, e.g. on restart.
            if existing.file_path == candidate.file_path {
                return Ok(Outcome::Unchanged);
            }
            tracing::info!(
                path = %candidate.file_path,
                existing = %existing.file_path,
                "Duplicate content, skipping"
            );
            return Ok(Outcome::Duplicate {
                existing_id: existing.id,
            });
        }

        // Replaced while nobody was watching: same path, new content.
        if let Some(existing) = self.db.get_book_by_path(candidate.file_path)? {
            return self.replace_content(existing, candidate, digest);
        }

        let meta = formats::extract_metadata(candidate.local, candidate.format);
        let id = uuid::Uuid::new_v4().to_string();
        let cover_path = match &meta.cover {
            Some(bytes) => Some(self.covers.save(&id, bytes)?),
            None => None,
        };

        let now = now_timestamp();
        let book = StoredBook {
            id: id.clone(),
            title: meta.title,
            author: meta.author,
            description: meta.description,
            file_type: candidate.format,
            file_path: candidate.file_path.to_string(),
            file_size: digest.size as i64,
            file_hash: digest.hash,
            cover_path: cover_path.as_ref().map(|p| p.to_string_lossy().into_owned()),
            page_count: meta.page_count,
            source: candidate.source,
            source_etag: candidate.etag.map(String::from),
            added_at: now,
            updated_at: now,
        };

        let inserted = self.db.insert_book(&book);
        if !matches!(inserted, Ok(InsertOutcome::Inserted))
            && let Some(path) = &cover_path
        {
            self.covers.remove(path)?;
        }

        match inserted? {
            InsertOutcome::Inserted => {
                let version = self.db.bump_library_version()?;
                tracing::info!(path = %candidate.file_path, id = %id, version, "Added book");
                Ok(Outcome::Added { id })
            }
            InsertOutcome::Duplicate => {
                // Lost a race against a concurrent add of the same content.
                let existing_id = self
                    .db
                    .get_book_by_hash(&book.file_hash)?
                    .map(|b| b.id)
                    .unwrap_or_default();
                tracing::info!(path = %candidate.file_path, "Duplicate content, skipping");
                Ok(Outcome::Duplicate { existing_id })
            }
        }
    }

    /// Re-ingest a tracked file whose bytes may have changed.
    pub fn change(&self, candidate: Candidate<'_>) -> Result<Outcome> {
        let Some(existing) = self.db.get_book_by_path(candidate.file_path)? else {
            tracing::warn!(path = %candidate.file_path, "Change for untracked file");
            return Ok(Outcome::Untracked);
        };

        let digest = sha256_file(candidate.local)?;
        if digest.hash == existing.file_hash {
            if candidate.etag.is_some() && candidate.etag != existing.source_etag.as_deref() {
                // Same bytes under a new tag: remember the tag, nothing changed for readers.
                self.db.update_book_content(&StoredBook {
                    source_etag: candidate.etag.map(String::from),
                    ..existing
                })?;
            }
            return Ok(Outcome::Unchanged);
        }

        self.replace_content(existing, candidate, digest)
    }

    fn replace_content(
        &self,
        existing: StoredBook,
        candidate: Candidate<'_>,
        digest: FileDigest,
    ) -> Result<Outcome> {
        if let Some(other) = self.db.get_book_by_hash(&digest.hash)?
            && other.id != existing.id
        {
            tracing::info!(
                path = %candidate.file_path,
                existing = %other.file_path,
                "New content duplicates another book, keeping old row"
            );
            return Ok(Outcome::Duplicate {
                existing_id: other.id,
            });
        }

        let meta = formats::extract_metadata(candidate.local, candidate.format);
        let old_cover = existing.cover_path.as_deref().map(PathBuf::from);
        let new_cover = match &meta.cover {
            Some(bytes) => Some(self.covers.save(&existing.id, bytes)?),
            None => None,
        };
        if let Some(old) = &old_cover
            && new_cover.as_ref() != Some(old)
        {
            self.covers.remove(old)?;
        }

        let book = StoredBook {
            title: meta.title,
            author: meta.author,
            description: meta.description,
            file_size: digest.size as i64,
            file_hash: digest.hash,
            cover_path: new_cover.map(|p| p.to_string_lossy().into_owned()),
            page_count: meta.page_count,
            source_etag: candidate.etag.map(String::from),
            updated_at: now_timestamp(),
            ..existing
        };
        self.db.update_book_content(&book)?;

        let version = self.db.bump_library_version()?;
        tracing::info!(path = %candidate.file_path, id = %book.id, version, "Updated book");
        Ok(Outcome::Updated { id: book.id })
    }

    /// Delete a book's cover and row. Progress and collection entries cascade.
    pub fn remove(&self, book: &StoredBook) -> Result<()> {
        if let Some(cover) = &book.cover_path {
            self.covers.remove(Path::new(cover))?;
        }
        self.db.delete_book(&book.id)?;
        tracing::info!(path = %book.file_path, id = %book.id, "Removed book");
        Ok(())
    }

    /// Remove local books whose file no longer exists. Returns the number removed.
    pub fn orphan_sweep(&self) -> Result<usize> {
        let mut removed = 0;
        for book in self.db.get_books_by_source(BookSource::Local)? {
            if Path::new(&book.file_path).exists() {
                continue;
            }
            match self.remove(&book) {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::error!(path = %book.file_path, error = %e, "Failed to remove orphan");
                }
            }
        }

        if removed > 0 {
            self.db.bump_library_version()?;
        }
        tracing::info!(removed, "Orphan sweep complete");
        Ok(removed)
    }
}

fn local_key(file: &BookFile) -> String {
    file.path.to_string_lossy().into_owned()
}
