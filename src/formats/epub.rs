//! EPUB format handler.

use crate::error::{AppError, Result};
use crate::formats::{ExtractedMetadata, FormatHandler};
use roxmltree::Document;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use zip::ZipArchive;

/// Handler for EPUB files.
pub struct EpubHandler;

impl EpubHandler {
    /// Find the OPF file path from container.xml.
    fn find_opf_path(archive: &mut ZipArchive<File>) -> Result<String> {
        let mut container = archive.by_name("META-INF/container.xml")?;
        let mut content = String::new();
        container.read_to_string(&mut content)?;

        let doc = Document::parse(&content)?;

        doc.descendants()
            .find(|n| n.has_tag_name("rootfile"))
            .and_then(|n| n.attribute("full-path"))
            .map(String::from)
            .ok_or_else(|| AppError::InvalidFormat("No rootfile in container.xml".into()))
    }

    /// Parse the OPF package document. Returns the cover href, if any.
    fn parse_opf(content: &str, meta: &mut ExtractedMetadata) -> Result<Option<String>> {
        let doc = Document::parse(content)?;
        let mut cover_id: Option<String> = None;

        for node in doc.descendants() {
            let text = node.text().map(str::trim).filter(|t| !t.is_empty());
            match node.tag_name().name() {
                "title" => {
                    if let Some(text) = text {
                        meta.title = text.to_string();
                    }
                }
                // First creator wins.
                "creator" if meta.author.is_none() => {
                    meta.author = text.map(String::from);
                }
                "description" => {
                    if let Some(text) = text {
                        meta.description = Some(text.to_string());
                    }
                }
                "meta" if node.attribute("name") == Some("cover") => {
                    cover_id = node.attribute("content").map(String::from);
                }
                _ => {}
            }
        }

        let items = || {
            doc.descendants()
                .filter(|n| n.tag_name().name() == "item")
        };

        if let Some(cover_id) = cover_id.as_deref()
            && let Some(item) = items().find(|n| n.attribute("id") == Some(cover_id))
        {
            return Ok(item.attribute("href").map(String::from));
        }

        // EPUB 3 marks the cover in the manifest properties.
        if let Some(item) = items().find(|n| {
            n.attribute("properties")
                .is_some_and(|p| p.split_whitespace().any(|p| p == "cover-image"))
        }) {
            return Ok(item.attribute("href").map(String::from));
        }

        // Fallback: look for common cover image names in manifest
        Ok(items()
            .filter_map(|n| n.attribute("href"))
            .find(|href| {
                let lower = href.to_lowercase();
                lower.contains("cover")
                    && (lower.ends_with(".jpg") || lower.ends_with(".jpeg") || lower.ends_with(".png"))
            })
            .map(String::from))
    }

    /// Read the cover entry, resolving the href against the OPF directory.
    fn read_cover(
        archive: &mut ZipArchive<File>,
        opf_dir: &str,
        cover_href: &str,
    ) -> Result<Vec<u8>> {
        let cover_path = if opf_dir.is_empty() {
            cover_href.to_string()
        } else {
            format!("{}/{}", opf_dir.trim_end_matches('/'), cover_href)
        };

        let actual_path = if archive.file_names().any(|n| n == cover_path) {
            cover_path
        } else {
            cover_href.to_string()
        };

        let mut data = Vec::new();
        archive.by_name(&actual_path)?.read_to_end(&mut data)?;

        Self::ensure_web_image(data)
    }

    /// Keep JPEG and PNG as is, re-encode anything else as PNG.
    fn ensure_web_image(data: Vec<u8>) -> Result<Vec<u8>> {
        if data.starts_with(&[0x89, b'P', b'N', b'G']) || data.starts_with(&[0xFF, 0xD8, 0xFF]) {
            return Ok(data);
        }

        let img = image::load_from_memory(&data)?;
        let mut png_data = Vec::new();
        img.write_to(
            &mut std::io::Cursor::new(&mut png_data),
            image::ImageFormat::Png,
        )?;

        Ok(png_data)
    }
}

impl FormatHandler for EpubHandler {
    fn extract(&self, path: &Path, meta: &mut ExtractedMetadata) -> Result<()> {
        let file = File::open(path)?;
        let mut archive = ZipArchive::new(file)?;

        let opf_path = Self::find_opf_path(&mut archive)?;
        let opf_dir = opf_path
            .rsplit_once('/')
            .map(|(dir, _)| dir.to_string())
            .unwrap_or_default();

        let mut opf_content = String::new();
        archive
            .by_name(&opf_path)?
            .read_to_string(&mut opf_content)?;

        if let Some(href) = Self::parse_opf(&opf_content, meta)? {
            // A broken cover reference should not lose the text metadata.
            match Self::read_cover(&mut archive, &opf_dir, &href) {
                Ok(cover) => meta.cover = Some(cover),
                Err(e) => {
                    tracing::debug!(path = %path.display(), href = %href, error = %e, "EPUB cover unreadable");
                }
            }
        }

        // Reflowable: no fixed page count.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    const CONTAINER: &str = r#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles><rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/></rootfiles>
</container>"#;

    const OPF: &str = r#"<?xml version="1.0"?>
<package xmlns="http://www.idpf.org/2007/opf" xmlns:dc="http://purl.org/dc/elements/1.1/" version="2.0">
  <metadata>
    <dc:title>  The Left Hand of Darkness </dc:title>
    <dc:creator>Ursula K. Le Guin</dc:creator>
    <dc:creator>Someone Else</dc:creator>
    <dc:description>Winter.</dc:description>
    <meta name="cover" content="cover-img"/>
  </metadata>
  <manifest>
    <item id="cover-img" href="images/cover.png" media-type="image/png"/>
  </manifest>
</package>"#;

    fn write_epub(path: &Path, cover: &[u8]) {
        let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
        let options = SimpleFileOptions::default();
        zip.start_file("mimetype", options).unwrap();
        zip.write_all(b"application/epub+zip").unwrap();
        zip.start_file("META-INF/container.xml", options).unwrap();
        zip.write_all(CONTAINER.as_bytes()).unwrap();
        zip.start_file("OEBPS/content.opf", options).unwrap();
        zip.write_all(OPF.as_bytes()).unwrap();
        zip.start_file("OEBPS/images/cover.png", options).unwrap();
        zip.write_all(cover).unwrap();
        zip.finish().unwrap();
    }

    #[test]
    fn extracts_metadata_and_cover() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book.epub");
        let cover = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 1, 2, 3];
        write_epub(&path, &cover);

        let mut meta = ExtractedMetadata::from_path(&path);
        EpubHandler.extract(&path, &mut meta).unwrap();

        assert_eq!(meta.title, "The Left Hand of Darkness");
        assert_eq!(meta.author.as_deref(), Some("Ursula K. Le Guin"));
        assert_eq!(meta.description.as_deref(), Some("Winter."));
        assert_eq!(meta.page_count, None);
        assert_eq!(meta.cover.as_deref(), Some(&cover[..]));
    }

    #[test]
    fn not_a_zip_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book.epub");
        std::fs::write(&path, b"plain text").unwrap();

        let mut meta = ExtractedMetadata::default();
        assert!(EpubHandler.extract(&path, &mut meta).is_err());
    }
}
