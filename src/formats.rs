mod epub;
mod pdf;

pub use epub::EpubHandler;
pub use pdf::PdfHandler;

use crate::config::BookFormat;
use crate::error::Result;
use std::path::Path;

/// Metadata pulled out of a book file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedMetadata {
    /// Book title.
    pub title: String,
    /// Primary author.
    pub author: Option<String>,
    /// Description or subject.
    pub description: Option<String>,
    /// Number of pages, for fixed-layout formats.
    pub page_count: Option<i64>,
    /// Cover image bytes (JPEG or PNG).
    pub cover: Option<Vec<u8>>,
}

impl ExtractedMetadata {
    /// Metadata carrying only the filename-derived title.
    pub fn from_path(path: &Path) -> Self {
        Self {
            title: title_from_stem(path),
            ..Self::default()
        }
    }
}

/// Trait for format-specific metadata extractors.
pub trait FormatHandler: Send + Sync {
    /// Fill `meta` from the file at `path`. Fields the file does not carry are left alone.
    fn extract(&self, path: &Path, meta: &mut ExtractedMetadata) -> Result<()>;
}

/// Get the appropriate handler for a book format.
pub fn get_handler(format: BookFormat) -> Box<dyn FormatHandler> {
    match format {
        BookFormat::Epub => Box::new(EpubHandler),
        BookFormat::Pdf => Box::new(PdfHandler),
    }
}

/// Extract metadata, falling back to the filename stem when the file can't be read.
pub fn extract_metadata(path: &Path, format: BookFormat) -> ExtractedMetadata {
    let mut meta = ExtractedMetadata::from_path(path);
    if let Err(e) = get_handler(format).extract(path, &mut meta) {
        tracing::debug!(path = %path.display(), error = %e, "Metadata extraction failed, using filename");
        return ExtractedMetadata::from_path(path);
    }
    if meta.title.trim().is_empty() {
        meta.title = title_from_stem(path);
    }
    meta
}

/// Title derived from the file name: stem with `_` turned into spaces.
pub fn title_from_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().replace('_', " ").trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "Untitled".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stem_title() {
        assert_eq!(title_from_stem(Path::new("/books/The_Hobbit.epub")), "The Hobbit");
        assert_eq!(title_from_stem(Path::new("/books/.pdf")), ".pdf");
    }

    #[test]
    fn unreadable_file_falls_back_to_stem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Broken_Book.pdf");
        std::fs::write(&path, b"this is not a pdf").unwrap();

        let meta = extract_metadata(&path, BookFormat::Pdf);
        assert_eq!(meta.title, "Broken Book");
        assert_eq!(meta.author, None);
        assert_eq!(meta.cover, None);
    }
}
