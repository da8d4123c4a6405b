//! Page-level text extraction for uploaded documents.
//!
//! The ingestion pipeline supplies raw bytes plus the display name; this
//! module returns one [`PageText`] per source page, blank pages included,
//! so page numbers stay aligned with the original document.
//!
//! | Kind | Detection | Page boundary |
//! |------|-----------|---------------|
//! | PDF | `%PDF-` magic or `.pdf` name | PDF page objects (`pdf-extract`) |
//! | Text | anything valid as UTF-8 | form feed (`\x0c`) |

use thiserror::Error;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_TEXT: &str = "text/plain";

const PDF_MAGIC: &[u8] = b"%PDF-";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported content-type: {0}")]
    UnsupportedContentType(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
}

/// Text of a single page. `number` is 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageText {
    pub number: usize,
    pub text: String,
}

impl PageText {
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Infer the content type from magic bytes first, then the file name.
pub fn detect_content_type(bytes: &[u8], name: &str) -> &'static str {
    if bytes.starts_with(PDF_MAGIC) || name.to_lowercase().ends_with(".pdf") {
        MIME_PDF
    } else {
        MIME_TEXT
    }
}

pub fn extract_pages(bytes: &[u8], content_type: &str) -> Result<Vec<PageText>, ExtractError> {
    let pages = match content_type {
        MIME_PDF => extract_pdf_pages(bytes)?,
        MIME_TEXT => extract_text_pages(bytes)?,
        other => return Err(ExtractError::UnsupportedContentType(other.to_string())),
    };

    Ok(pages
        .into_iter()
        .enumerate()
        .map(|(i, text)| PageText { number: i + 1, text })
        .collect())
}

fn extract_pdf_pages(bytes: &[u8]) -> Result<Vec<String>, ExtractError> {
    pdf_extract::extract_text_from_mem_by_pages(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

fn extract_text_pages(bytes: &[u8]) -> Result<Vec<String>, ExtractError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| ExtractError::UnsupportedContentType("binary data".to_string()))?;
    let text = text.strip_suffix('\x0c').unwrap_or(text);
    Ok(text.split('\x0c').map(str::to_string).collect())
}
