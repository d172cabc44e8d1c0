//! Book files on disk: classification, content hashing and cover storage.

mod covers;
mod hash;

pub use covers::CoverStore;
pub use hash::{FileDigest, sha256_file};

use crate::config::BookFormat;
use std::path::{Path, PathBuf};

/// A book file found under the library root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookFile {
    /// Absolute path.
    pub path: PathBuf,
    /// Format from the extension.
    pub format: BookFormat,
}

/// Classify a path; only `.pdf` and `.epub` files are books.
pub fn classify(path: &Path) -> Option<BookFile> {
    let format = BookFormat::from_path(path)?;
    Some(BookFile {
        path: path.to_path_buf(),
        format,
    })
}

/// Every book file below `root`, nested directories included.
pub fn discover(root: &Path) -> Vec<BookFile> {
    walkdir::WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| classify(e.path()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discover_filters_extensions_and_recurses() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join("one.pdf"), b"1").unwrap();
        std::fs::write(nested.join("two.EPUB"), b"2").unwrap();
        std::fs::write(nested.join("notes.txt"), b"3").unwrap();
        std::fs::create_dir_all(dir.path().join("folder.pdf")).unwrap();

        let mut found: Vec<_> = discover(dir.path())
            .into_iter()
            .map(|f| (f.path.file_name().unwrap().to_string_lossy().into_owned(), f.format))
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));

        assert_eq!(
            found,
            vec![
                ("one.pdf".to_string(), BookFormat::Pdf),
                ("two.EPUB".to_string(), BookFormat::Epub),
            ]
        );
    }
}
