use crate::error::Result;
use std::path::{Path, PathBuf};

/// Directory holding extracted cover images, one file per book.
#[derive(Debug, Clone)]
pub struct CoverStore {
    dir: PathBuf,
}

impl CoverStore {
    /// Store rooted at `dir` (created on first save).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Write the cover of `book_id`, replacing any previous one. Returns its path.
    pub fn save(&self, book_id: &str, data: &[u8]) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{}.{}", book_id, extension_for(data)));
        std::fs::write(&path, data)?;
        Ok(path)
    }

    /// Delete a cover file. A file that is already gone is not an error.
    pub fn remove(&self, path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn extension_for(data: &[u8]) -> &'static str {
    if data.starts_with(&[0x89, b'P', b'N', b'G']) {
        "png"
    } else if data.starts_with(b"RIFF") && data.get(8..12) == Some(&b"WEBP"[..]) {
        "webp"
    } else {
        "jpg"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_picks_extension_and_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = CoverStore::new(dir.path().join("covers"));

        let png = store.save("b1", &[0x89, b'P', b'N', b'G', 1]).unwrap();
        assert_eq!(png.extension().unwrap(), "png");
        let jpg = store.save("b2", &[0xFF, 0xD8, 0xFF, 0xE0]).unwrap();
        assert_eq!(jpg.extension().unwrap(), "jpg");

        store.remove(&png).unwrap();
        assert!(!png.exists());
        store.remove(&png).unwrap();
    }
}
