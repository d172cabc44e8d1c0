use crate::error::{AppError, Result};
use crate::formats::{ExtractedMetadata, FormatHandler};
use lopdf::{Dictionary, Document, Object};
use std::path::Path;

/// Handler for PDF files.
pub struct PdfHandler;

impl PdfHandler {
    /// Extract text content from a PDF info dictionary value.
    fn extract_text(obj: &Object) -> Option<String> {
        match obj {
            Object::String(bytes, _) => {
                // UTF-16BE when it starts with a BOM
                if bytes.starts_with(&[0xFE, 0xFF]) {
                    let utf16: Vec<u16> = bytes[2..]
                        .chunks(2)
                        .map(|chunk| {
                            u16::from_be_bytes([chunk[0], chunk.get(1).copied().unwrap_or(0)])
                        })
                        .collect();
                    String::from_utf16(&utf16).ok()
                } else {
                    // UTF-8, else Latin-1
                    Some(
                        String::from_utf8(bytes.clone())
                            .unwrap_or_else(|_| bytes.iter().map(|&b| b as char).collect()),
                    )
                }
            }
            Object::Name(name) => String::from_utf8(name.clone()).ok(),
            _ => None,
        }
    }

    fn info_field(info: &Dictionary, key: &[u8]) -> Option<String> {
        info.get(key)
            .ok()
            .and_then(Self::extract_text)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    }

    fn dictionary<'a>(doc: &'a Document, obj: Option<&'a Object>) -> Option<&'a Dictionary> {
        match obj? {
            Object::Reference(r) => doc.get_dictionary(*r).ok(),
            Object::Dictionary(d) => Some(d),
            _ => None,
        }
    }

    /// First JPEG or PNG image drawn on the first page.
    fn first_page_image(doc: &Document) -> Option<Vec<u8>> {
        let &first_page_id = doc.get_pages().values().next()?;
        let page = doc.get_dictionary(first_page_id).ok()?;
        let resources = Self::dictionary(doc, page.get(b"Resources").ok())?;
        let xobjects = Self::dictionary(doc, resources.get(b"XObject").ok())?;

        for (_name, obj) in xobjects.iter() {
            let Object::Reference(xobj_ref) = obj else {
                continue;
            };
            let Ok(Object::Stream(stream)) = doc.get_object(*xobj_ref) else {
                continue;
            };

            let is_image = matches!(
                stream.dict.get(b"Subtype"),
                Ok(Object::Name(n)) if n == b"Image"
            );
            if !is_image {
                continue;
            }

            // DCTDecode streams are JPEG files as stored.
            if stream.content.starts_with(&[0xFF, 0xD8, 0xFF]) {
                return Some(stream.content.clone());
            }

            if let Ok(data) = stream.decompressed_content()
                && (data.starts_with(&[0xFF, 0xD8, 0xFF]) || data.starts_with(&[0x89, b'P', b'N', b'G']))
            {
                return Some(data);
            }
        }

        None
    }
}

impl FormatHandler for PdfHandler {
    fn extract(&self, path: &Path, meta: &mut ExtractedMetadata) -> Result<()> {
        let doc = Document::load(path).map_err(|e| AppError::Pdf(e.to_string()))?;

        meta.page_count = Some(doc.get_pages().len() as i64);

        if let Ok(info_ref) = doc.trailer.get(b"Info").and_then(Object::as_reference)
            && let Ok(info) = doc.get_dictionary(info_ref)
        {
            if let Some(title) = Self::info_field(info, b"Title") {
                meta.title = title;
            }
            if let Some(author) = Self::info_field(info, b"Author") {
                meta.author = Some(author);
            }
            // Subject doubles as description
            if let Some(subject) = Self::info_field(info, b"Subject") {
                meta.description = Some(subject);
            }
        }

        meta.cover = Self::first_page_image(&doc);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::{Stream, dictionary};

    fn write_pdf(path: &Path, pages: usize) {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();

        let kids: Vec<Object> = (0..pages)
            .map(|_| {
                let content_id = doc.add_object(Stream::new(dictionary! {}, Vec::new()));
                doc.add_object(dictionary! {
                    "Type" => "Page",
                    "Parent" => pages_id,
                    "Contents" => content_id,
                    "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
                })
                .into()
            })
            .collect();

        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => pages as i64,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        let info_id = doc.add_object(dictionary! {
            "Title" => Object::string_literal("Dune"),
            "Author" => Object::string_literal("Frank Herbert"),
        });
        doc.trailer.set("Root", catalog_id);
        doc.trailer.set("Info", info_id);
        doc.save(path).unwrap();
    }

    #[test]
    fn extracts_info_dictionary_and_pages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dune.pdf");
        write_pdf(&path, 3);

        let mut meta = ExtractedMetadata::from_path(&path);
        PdfHandler.extract(&path, &mut meta).unwrap();

        assert_eq!(meta.title, "Dune");
        assert_eq!(meta.author.as_deref(), Some("Frank Herbert"));
        assert_eq!(meta.page_count, Some(3));
        assert_eq!(meta.cover, None);
    }

    #[test]
    fn utf16_strings_decode() {
        let obj = Object::String(
            vec![0xFE, 0xFF, 0x00, b'H', 0x00, b'i'],
            lopdf::StringFormat::Hexadecimal,
        );
        assert_eq!(PdfHandler::extract_text(&obj).as_deref(), Some("Hi"));
    }
}
