//! Schema migrations.
//!
//! Each step checks for a sentinel (table, index or column) and only runs
//! when the sentinel is absent, so running the whole sequence again is a
//! no-op.

use crate::error::{AppError, Result};
use rusqlite::{Connection, OptionalExtension, params};

/// Bundled initial schema.
pub const INITIAL_SCRIPT: &str = include_str!("../../migrations/001_initial.sql");

/// Table whose presence marks the initial script as applied.
pub const SENTINEL_TABLE: &str = "users";

/// Index whose presence marks the uniqueness fix-up as applied.
pub const SENTINEL_INDEX: &str = "idx_books_file_hash_unique";

/// Columns added to `books` for remote sources.
const SOURCE_STATEMENTS: &[&str] = &[
    "ALTER TABLE books ADD COLUMN source TEXT NOT NULL DEFAULT 'local'",
    "ALTER TABLE books ADD COLUMN source_etag TEXT",
    "CREATE INDEX IF NOT EXISTS idx_books_source ON books(source)",
];

/// What a migration run changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    /// The initial script ran.
    pub initial_applied: bool,
    /// The uniqueness fix-up ran.
    pub unique_fixup_applied: bool,
    /// Rows removed while deduplicating before the unique indexes.
    pub duplicates_removed: usize,
    /// The source columns were added.
    pub source_columns_applied: bool,
}

impl MigrationReport {
    /// Whether anything was applied.
    pub fn changed(&self) -> bool {
        self.initial_applied || self.unique_fixup_applied || self.source_columns_applied
    }
}

/// Apply every pending migration.
pub fn run(conn: &Connection, initial_script: &str) -> Result<MigrationReport> {
    let mut report = MigrationReport::default();

    if !table_exists(conn, SENTINEL_TABLE)? {
        apply_initial(conn, initial_script)?;
        report.initial_applied = true;
        tracing::info!("Applied initial schema");
    }

    if !index_exists(conn, SENTINEL_INDEX)? {
        report.duplicates_removed = apply_unique_fixup(conn)?;
        report.unique_fixup_applied = true;
        tracing::info!(
            removed = report.duplicates_removed,
            "Applied unique index fix-up"
        );
    }

    if !column_exists(conn, "books", "source")? || !column_exists(conn, "books", "source_etag")? {
        apply_idempotent(conn, SOURCE_STATEMENTS)?;
        report.source_columns_applied = true;
        tracing::info!("Added book source columns");
    }

    Ok(report)
}

/// Run the initial script in one transaction so a failure leaves no sentinel behind.
fn apply_initial(conn: &Connection, script: &str) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(script)
        .map_err(|e| AppError::Internal(format!("Failed to apply initial schema: {}", e)))?;
    tx.commit()?;
    Ok(())
}

/// Deduplicate books by hash then by path, keeping the earliest `added_at`,
/// then create the unique indexes.
fn apply_unique_fixup(conn: &Connection) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;

    let mut removed = 0;
    for column in ["file_hash", "file_path"] {
        let sql = format!(
            "DELETE FROM books WHERE rowid IN (
                SELECT rowid FROM (
                    SELECT rowid, ROW_NUMBER() OVER (
                        PARTITION BY {column} ORDER BY added_at ASC, rowid ASC
                    ) AS rn
                    FROM books
                ) WHERE rn > 1
            )"
        );
        removed += tx.execute(&sql, [])?;
    }

    tx.execute_batch(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_books_file_hash_unique ON books(file_hash);
         CREATE UNIQUE INDEX IF NOT EXISTS idx_books_file_path_unique ON books(file_path);",
    )?;
    tx.commit()?;

    Ok(removed)
}

/// Run statements one by one, ignoring duplicate-column failures.
fn apply_idempotent(conn: &Connection, statements: &[&str]) -> Result<()> {
    for sql in statements {
        if let Err(e) = conn.execute_batch(sql) {
            if e.to_string().contains("duplicate column name") {
                tracing::debug!(statement = %sql, "Column already present");
                continue;
            }
            return Err(AppError::Internal(format!(
                "Migration statement failed ({}): {}",
                sql, e
            )));
        }
    }
    Ok(())
}

fn sqlite_object_exists(conn: &Connection, kind: &str, name: &str) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = ?1 AND name = ?2",
            params![kind, name],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Whether a table exists.
pub fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    sqlite_object_exists(conn, "table", name)
}

/// Whether an index exists.
pub fn index_exists(conn: &Connection, name: &str) -> Result<bool> {
    sqlite_object_exists(conn, "index", name)
}

/// Whether a table has the named column.
pub fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
    let names = stmt
        .query_map(params![table], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(names.iter().any(|n| n == column))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema_snapshot(conn: &Connection) -> Vec<(String, String)> {
        let mut stmt = conn
            .prepare(
                "SELECT type, name FROM sqlite_master
                 WHERE name NOT LIKE 'sqlite_%' ORDER BY type, name",
            )
            .unwrap();
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn running_twice_matches_running_once() {
        let conn = Connection::open_in_memory().unwrap();

        let first = run(&conn, INITIAL_SCRIPT).unwrap();
        assert!(first.initial_applied);
        assert!(first.unique_fixup_applied);
        assert!(first.source_columns_applied);
        let once = schema_snapshot(&conn);

        let second = run(&conn, INITIAL_SCRIPT).unwrap();
        assert!(!second.changed());
        assert_eq!(schema_snapshot(&conn), once);
    }

    #[test]
    fn failed_initial_script_is_retried() {
        let conn = Connection::open_in_memory().unwrap();
        let cut = INITIAL_SCRIPT
            .find("CREATE TABLE IF NOT EXISTS reading_progress")
            .unwrap();
        let broken = format!("{}CREATE TABLE oops (", &INITIAL_SCRIPT[..cut]);

        assert!(run(&conn, &broken).is_err());
        assert!(!table_exists(&conn, SENTINEL_TABLE).unwrap());
        assert!(!table_exists(&conn, "books").unwrap());

        let retry = run(&conn, INITIAL_SCRIPT).unwrap();
        assert!(retry.initial_applied);
        assert!(table_exists(&conn, "reading_progress").unwrap());
        assert!(table_exists(&conn, "settings").unwrap());
    }

    #[test]
    fn source_columns_are_added_once() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn, INITIAL_SCRIPT).unwrap();

        assert!(column_exists(&conn, "books", "source").unwrap());
        assert!(column_exists(&conn, "books", "source_etag").unwrap());

        // Replaying the ALTERs directly must not surface duplicate-column errors.
        apply_idempotent(&conn, SOURCE_STATEMENTS).unwrap();
    }

    #[test]
    fn non_duplicate_errors_propagate() {
        let conn = Connection::open_in_memory().unwrap();
        let err = apply_idempotent(&conn, &["ALTER TABLE missing ADD COLUMN x TEXT"]);
        assert!(err.is_err());
    }

    #[test]
    fn fixup_keeps_earliest_row_per_hash_and_path() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(INITIAL_SCRIPT).unwrap();

        let insert = "INSERT INTO books (id, title, file_type, file_path, file_size, file_hash, added_at, updated_at)
                      VALUES (?1, ?1, 'pdf', ?2, 1, ?3, ?4, ?4)";
        conn.execute(insert, params!["a", "/lib/a.pdf", "h1", 200]).unwrap();
        conn.execute(insert, params!["b", "/lib/b.pdf", "h1", 100]).unwrap();
        conn.execute(insert, params!["c", "/lib/c.pdf", "h2", 300]).unwrap();
        conn.execute(insert, params!["d", "/lib/c.pdf", "h3", 50]).unwrap();

        let report = run(&conn, INITIAL_SCRIPT).unwrap();
        assert!(!report.initial_applied);
        assert_eq!(report.duplicates_removed, 2);

        let mut stmt = conn.prepare("SELECT id FROM books ORDER BY id").unwrap();
        let ids: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap();
        assert_eq!(ids, vec!["b", "d"]);
        assert!(index_exists(&conn, "idx_books_file_path_unique").unwrap());
    }
}
