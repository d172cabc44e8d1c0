use crate::auth::generate_token;
use crate::bridge::{self, BridgeRequest, BridgeResponse};
use crate::config::{BookFormat, BridgeMode};
use crate::db::migrate::{self, MigrationReport};
use crate::db::*;
use crate::error::{AppError, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Arc;

/// Column list shared by every book query.
const BOOK_COLUMNS: &str = "id, title, author, description, file_type, file_path, file_size, file_hash,
     cover_path, page_count, source, source_etag, added_at, updated_at";

/// Result of inserting a book.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The row was written.
    Inserted,
    /// A book with the same content hash already exists; nothing was written.
    Duplicate,
}

/// Database wrapper for thread-safe access.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open the database at the given path. The schema is not created here.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = open_connection(path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open in-memory database with the bundled schema (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| AppError::Internal(format!("Failed to open database: {}", e)))?;
        configure(&conn)?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.migrate(migrate::INITIAL_SCRIPT)?;
        Ok(db)
    }

    /// Apply pending migrations.
    pub fn migrate(&self, initial_script: &str) -> Result<MigrationReport> {
        let conn = self.conn.lock();
        migrate::run(&conn, initial_script)
    }

    /// Run a raw bridge request on this connection.
    pub fn run_request(&self, request: &BridgeRequest, mode: BridgeMode) -> Result<BridgeResponse> {
        let conn = self.conn.lock();
        bridge::run(&conn, request, mode)
    }

    // ========== USER OPERATIONS ==========

    /// Create a new user.
    pub fn create_user(&self, user: &User) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO users (id, email, password_hash, name, role, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                user.id,
                user.email,
                user.password_hash,
                user.name,
                user.role,
                user.created_at,
                user.updated_at,
            ],
        )
        .map_err(|e| {
            if e.to_string().contains("UNIQUE constraint") {
                AppError::InvalidRequest(format!("Email '{}' already exists", user.email))
            } else {
                AppError::Internal(format!("Failed to create user: {}", e))
            }
        })?;
        Ok(())
    }

    /// Get user by email.
    pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, email, password_hash, name, role, created_at, updated_at
             FROM users WHERE email = ?1",
            params![email],
            Self::row_to_user,
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get user: {}", e)))
    }

    /// List all users.
    pub fn list_users(&self) -> Result<Vec<User>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, email, password_hash, name, role, created_at, updated_at
                 FROM users ORDER BY email",
            )
            .map_err(|e| AppError::Internal(format!("Failed to prepare query: {}", e)))?;

        let users = stmt
            .query_map([], Self::row_to_user)
            .map_err(|e| AppError::Internal(format!("Failed to list users: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Internal(format!("Failed to collect users: {}", e)))?;

        Ok(users)
    }

    fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
        Ok(User {
            id: row.get(0)?,
            email: row.get(1)?,
            password_hash: row.get(2)?,
            name: row.get(3)?,
            role: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    // ========== BOOK OPERATIONS ==========

    /// Insert a book unless its content hash is already known.
    pub fn insert_book(&self, book: &StoredBook) -> Result<InsertOutcome> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "INSERT INTO books
                 (id, title, author, description, file_type, file_path, file_size, file_hash,
                  cover_path, page_count, source, source_etag, added_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                 ON CONFLICT (file_hash) DO NOTHING",
                params![
                    book.id,
                    book.title,
                    book.author,
                    book.description,
                    book.file_type.as_str(),
                    book.file_path,
                    book.file_size,
                    book.file_hash,
                    book.cover_path,
                    book.page_count,
                    book.source.as_str(),
                    book.source_etag,
                    book.added_at,
                    book.updated_at,
                ],
            )
            .map_err(|e| AppError::Internal(format!("Failed to insert book: {}", e)))?;

        Ok(if rows > 0 {
            InsertOutcome::Inserted
        } else {
            InsertOutcome::Duplicate
        })
    }

    /// Overwrite the content-derived fields of an existing book.
    pub fn update_book_content(&self, book: &StoredBook) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE books SET
                    title = ?2,
                    author = ?3,
                    description = ?4,
                    file_size = ?5,
                    file_hash = ?6,
                    cover_path = ?7,
                    page_count = ?8,
                    source_etag = ?9,
                    updated_at = ?10
                 WHERE id = ?1",
                params![
                    book.id,
                    book.title,
                    book.author,
                    book.description,
                    book.file_size,
                    book.file_hash,
                    book.cover_path,
                    book.page_count,
                    book.source_etag,
                    book.updated_at,
                ],
            )
            .map_err(|e| AppError::Internal(format!("Failed to update book: {}", e)))?;
        Ok(rows > 0)
    }

    /// Get book by ID.
    pub fn get_book(&self, id: &str) -> Result<Option<StoredBook>> {
        self.find_book("id", id)
    }

    /// Get book by file hash.
    pub fn get_book_by_hash(&self, hash: &str) -> Result<Option<StoredBook>> {
        self.find_book("file_hash", hash)
    }

    /// Get book by file path or object key.
    pub fn get_book_by_path(&self, path: &str) -> Result<Option<StoredBook>> {
        self.find_book("file_path", path)
    }

    fn find_book(&self, column: &str, value: &str) -> Result<Option<StoredBook>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {BOOK_COLUMNS} FROM books WHERE {column} = ?1"),
            params![value],
            Self::row_to_stored_book,
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get book: {}", e)))
    }

    /// Get all books.
    pub fn get_all_books(&self) -> Result<Vec<StoredBook>> {
        self.list_books("SELECT {cols} FROM books ORDER BY added_at, id", [])
    }

    /// Get books from one source.
    pub fn get_books_by_source(&self, source: BookSource) -> Result<Vec<StoredBook>> {
        self.list_books(
            "SELECT {cols} FROM books WHERE source = ?1 ORDER BY added_at, id",
            [source.as_str()],
        )
    }

    fn list_books<P: rusqlite::Params>(&self, template: &str, params: P) -> Result<Vec<StoredBook>> {
        let conn = self.conn.lock();
        let sql = template.replace("{cols}", BOOK_COLUMNS);
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| AppError::Internal(format!("Failed to prepare query: {}", e)))?;

        let books = stmt
            .query_map(params, Self::row_to_stored_book)
            .map_err(|e| AppError::Internal(format!("Failed to get books: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Internal(format!("Failed to collect books: {}", e)))?;

        Ok(books)
    }

    /// Count books.
    pub fn book_count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        Ok(conn.query_row("SELECT COUNT(*) FROM books", [], |row| row.get(0))?)
    }

    /// Helper to convert a row to StoredBook.
    fn row_to_stored_book(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredBook> {
        let file_type: String = row.get(4)?;
        let file_type = BookFormat::from_extension(&file_type).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                format!("unknown file_type '{}'", file_type).into(),
            )
        })?;
        let source: String = row.get(10)?;

        Ok(StoredBook {
            id: row.get(0)?,
            title: row.get(1)?,
            author: row.get(2)?,
            description: row.get(3)?,
            file_type,
            file_path: row.get(5)?,
            file_size: row.get(6)?,
            file_hash: row.get(7)?,
            cover_path: row.get(8)?,
            page_count: row.get(9)?,
            source: BookSource::parse(&source),
            source_etag: row.get(11)?,
            added_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    /// Delete a single book by ID. Progress and memberships cascade.
    pub fn delete_book(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute("DELETE FROM books WHERE id = ?1", params![id])
            .map_err(|e| AppError::Internal(format!("Failed to delete book: {}", e)))?;
        Ok(rows > 0)
    }

    // ========== PROGRESS OPERATIONS ==========

    /// Record a reader's position, inserting or updating the single row for the pair.
    pub fn save_progress(
        &self,
        user_id: &str,
        book_id: &str,
        update: &ProgressUpdate,
    ) -> Result<ReadingProgress> {
        let (current_page, total_pages, location) = match update {
            ProgressUpdate::Pdf {
                current_page,
                total_pages,
            } => (Some(*current_page), Some(*total_pages), None),
            ProgressUpdate::Epub { location, .. } => (None, None, Some(location.as_str())),
        };

        {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT INTO reading_progress
                 (user_id, book_id, current_page, epub_location, total_pages,
                  percent_complete, status, last_read_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT (user_id, book_id) DO UPDATE SET
                    current_page = excluded.current_page,
                    epub_location = excluded.epub_location,
                    total_pages = excluded.total_pages,
                    percent_complete = excluded.percent_complete,
                    status = excluded.status,
                    last_read_at = excluded.last_read_at",
                params![
                    user_id,
                    book_id,
                    current_page,
                    location,
                    total_pages,
                    update.percent_complete(),
                    update.status().as_str(),
                    now_timestamp(),
                ],
            )
            .map_err(|e| AppError::Internal(format!("Failed to save progress: {}", e)))?;
        }

        self.get_progress(user_id, book_id)?
            .ok_or_else(|| AppError::Internal("Progress row vanished after upsert".to_string()))
    }

    /// Get reading progress for a book.
    pub fn get_progress(&self, user_id: &str, book_id: &str) -> Result<Option<ReadingProgress>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, user_id, book_id, current_page, epub_location, total_pages,
                    percent_complete, status, last_read_at
             FROM reading_progress
             WHERE user_id = ?1 AND book_id = ?2",
            params![user_id, book_id],
            |row| {
                let status: String = row.get(7)?;
                Ok(ReadingProgress {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    book_id: row.get(2)?,
                    current_page: row.get(3)?,
                    epub_location: row.get(4)?,
                    total_pages: row.get(5)?,
                    percent_complete: row.get(6)?,
                    status: ReadingStatus::parse(&status),
                    last_read_at: row.get(8)?,
                })
            },
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get progress: {}", e)))
    }

    // ========== COLLECTION OPERATIONS ==========

    /// Create a collection.
    pub fn create_collection(
        &self,
        user_id: &str,
        name: &str,
        description: Option<&str>,
    ) -> Result<Collection> {
        let name = name.trim();
        if name.is_empty() || name.chars().count() > 100 {
            return Err(AppError::InvalidRequest(
                "Collection name must be 1-100 characters".to_string(),
            ));
        }

        let collection = Collection {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            name: name.to_string(),
            description: description.map(String::from),
            share_token: None,
            shared_at: None,
            created_at: now_timestamp(),
        };

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO collections (id, user_id, name, description, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                collection.id,
                collection.user_id,
                collection.name,
                collection.description,
                collection.created_at,
            ],
        )
        .map_err(|e| AppError::Internal(format!("Failed to create collection: {}", e)))?;

        Ok(collection)
    }

    /// Get a collection by ID.
    pub fn get_collection(&self, id: &str) -> Result<Option<Collection>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, user_id, name, description, share_token, shared_at, created_at
             FROM collections WHERE id = ?1",
            params![id],
            |row| {
                Ok(Collection {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    name: row.get(2)?,
                    description: row.get(3)?,
                    share_token: row.get(4)?,
                    shared_at: row.get(5)?,
                    created_at: row.get(6)?,
                })
            },
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get collection: {}", e)))
    }

    /// Add a book to a collection. Returns false if it was already a member.
    pub fn add_to_collection(&self, collection_id: &str, book_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "INSERT OR IGNORE INTO collection_books (collection_id, book_id, added_at)
                 VALUES (?1, ?2, ?3)",
                params![collection_id, book_id, now_timestamp()],
            )
            .map_err(|e| AppError::Internal(format!("Failed to add to collection: {}", e)))?;
        Ok(rows > 0)
    }

    /// Book IDs in a collection, in insertion order.
    pub fn collection_book_ids(&self, collection_id: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT book_id FROM collection_books WHERE collection_id = ?1
             ORDER BY added_at, rowid",
        )?;
        let ids = stmt
            .query_map(params![collection_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Enable or disable public sharing of a collection.
    pub fn set_collection_sharing(&self, id: &str, enabled: bool) -> Result<Collection> {
        {
            let conn = self.conn.lock();
            let rows = if enabled {
                conn.execute(
                    "UPDATE collections SET share_token = ?2, shared_at = ?3 WHERE id = ?1",
                    params![id, generate_token(), now_timestamp()],
                )
            } else {
                conn.execute(
                    "UPDATE collections SET share_token = NULL, shared_at = NULL WHERE id = ?1",
                    params![id],
                )
            }
            .map_err(|e| AppError::Internal(format!("Failed to update sharing: {}", e)))?;

            if rows == 0 {
                return Err(AppError::NotFound(format!("Collection not found: {}", id)));
            }
        }

        self.get_collection(id)?
            .ok_or_else(|| AppError::NotFound(format!("Collection not found: {}", id)))
    }

    // ========== SETTINGS OPERATIONS ==========

    /// Read a setting.
    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get setting: {}", e)))
    }

    /// Write a setting.
    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now_timestamp()],
        )
        .map_err(|e| AppError::Internal(format!("Failed to set setting: {}", e)))?;
        Ok(())
    }

    /// Current library version (0 when never bumped).
    pub fn library_version(&self) -> Result<i64> {
        Ok(self
            .get_setting(LIBRARY_VERSION_KEY)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    /// Atomically increment the library version and return the new value.
    pub fn bump_library_version(&self) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, '1', ?2)
             ON CONFLICT (key) DO UPDATE SET
                value = CAST(CAST(settings.value AS INTEGER) + 1 AS TEXT),
                updated_at = excluded.updated_at
             RETURNING CAST(value AS INTEGER)",
            params![LIBRARY_VERSION_KEY, now_timestamp()],
            |row| row.get(0),
        )
        .map_err(|e| AppError::Internal(format!("Failed to bump library version: {}", e)))
    }
}
