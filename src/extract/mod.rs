//! Content extractors: per-format parsers producing a common
//! [`ExtractionArtifact`] (spec.md §4.2). Extractors are pure — they consume
//! bytes and emit an artifact, never touching the database or queue.

pub mod csv_extractor;
pub mod image;
pub mod pdf;
pub mod text;
pub mod xlsx;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_TEXT: &str = "text/plain";
pub const MIME_MARKDOWN: &str = "text/markdown";
pub const MIME_CSV: &str = "text/csv";
pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
pub const MIME_XLS: &str = "application/vnd.ms-excel";
pub const MIME_PNG: &str = "image/png";
pub const MIME_JPEG: &str = "image/jpeg";
pub const MIME_GIF: &str = "image/gif";
pub const MIME_WEBP: &str = "image/webp";
pub const MIME_TIFF: &str = "image/tiff";
pub const MIME_BMP: &str = "image/bmp";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("text extraction failed: {0}")]
    Text(String),
    #[error("CSV extraction failed: {0}")]
    Csv(String),
    #[error("spreadsheet extraction failed: {0}")]
    Xlsx(String),
    #[error("image extraction failed: {0}")]
    Image(String),
}

/// A single extracted table, row-major, with an optional generated or
/// detected header row (spec.md §4.2 `tables[]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedTable {
    pub name: Option<String>,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// A single image recorded by an extractor, whether embedded in a document
/// or the primary content of an image upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedImage {
    pub filename: String,
    pub image_index: i64,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub page_number: Option<i64>,
    /// Populated by a pluggable OCR provider; `None` under the default
    /// no-op provider (spec.md §4.2).
    pub ocr_text: Option<String>,
    /// Filesystem path the image bytes were written to, when an extractor
    /// has a working directory to write into (embedded PDF images). `None`
    /// for an uploaded image, which is already stored as the document's
    /// own blob.
    #[serde(default)]
    pub storage_path: Option<String>,
}

/// Common output of every content extractor (spec.md §4.2).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionArtifact {
    pub text: Option<String>,
    #[serde(default)]
    pub tables: Vec<ExtractedTable>,
    #[serde(default)]
    pub images: Vec<ExtractedImage>,
    pub metadata: serde_json::Value,
    pub extractor_name: String,
    pub extractor_version: String,
    pub page_count: Option<i64>,
    pub char_count: i64,
    pub word_count: i64,
    pub processing_time_ms: i64,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl ExtractionArtifact {
    /// Fill in the derived `char_count`/`word_count` from `text` after an
    /// extractor has set it, so every call site doesn't repeat this.
    pub fn finalize(mut self) -> Self {
        let text = self.text.as_deref().unwrap_or("");
        self.char_count = text.chars().count() as i64;
        self.word_count = text.split_whitespace().count() as i64;
        self
    }
}

/// Pluggable OCR provider for image extraction. The default is a no-op;
/// a real provider (a vendor OCR API, a local Tesseract binding) implements
/// this trait without the rest of the extractor changing.
pub trait OcrProvider: Send + Sync {
    fn recognize(&self, image_bytes: &[u8]) -> Option<String>;
}

pub struct NoOpOcrProvider;

impl OcrProvider for NoOpOcrProvider {
    fn recognize(&self, _image_bytes: &[u8]) -> Option<String> {
        None
    }
}

/// Dispatch to the appropriate extractor by content type, preferring
/// extension-based detection as a fallback (spec.md §4.2: "format detection
/// by content type and by extension"). PDF is the only extractor that
/// reaches outside the process (a remote extraction service, when
/// configured), so this is `async` even though every other format is pure
/// CPU work.
pub async fn extract(
    bytes: &[u8],
    content_type: &str,
    filename_hint: Option<&str>,
    ocr: &dyn OcrProvider,
    extraction_config: &crate::config::ExtractionConfig,
) -> Result<ExtractionArtifact, ExtractError> {
    let effective_type = resolve_content_type(content_type, filename_hint);
    match effective_type.as_str() {
        MIME_PDF => pdf::extract_pdf(bytes, extraction_config).await,
        MIME_TEXT | MIME_MARKDOWN => text::extract_text(bytes),
        MIME_CSV => csv_extractor::extract_csv(bytes),
        MIME_XLSX | MIME_XLS => xlsx::extract_xlsx(bytes, filename_hint),
        MIME_PNG | MIME_JPEG | MIME_GIF | MIME_WEBP | MIME_TIFF | MIME_BMP => {
            image::extract_image(bytes, &effective_type, filename_hint, ocr)
        }
        other => Err(ExtractError::UnsupportedContentType(other.to_string())),
    }
}

fn resolve_content_type(content_type: &str, filename_hint: Option<&str>) -> String {
    if content_type != "application/octet-stream" && !content_type.is_empty() {
        return content_type.to_string();
    }
    let Some(name) = filename_hint else {
        return content_type.to_string();
    };
    let ext = name.rsplit('.').next().unwrap_or("").to_lowercase();
    match ext.as_str() {
        "pdf" => MIME_PDF,
        "md" | "markdown" => MIME_MARKDOWN,
        "txt" => MIME_TEXT,
        "csv" => MIME_CSV,
        "xlsx" => MIME_XLSX,
        "xls" => MIME_XLS,
        "png" => MIME_PNG,
        "jpg" | "jpeg" => MIME_JPEG,
        "gif" => MIME_GIF,
        "webp" => MIME_WEBP,
        "tiff" | "tif" => MIME_TIFF,
        "bmp" => MIME_BMP,
        _ => return content_type.to_string(),
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unsupported_content_type_returns_error() {
        let config = crate::config::ExtractionConfig::default();
        let err = extract(b"foo", "application/octet-stream", None, &NoOpOcrProvider, &config)
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::UnsupportedContentType(_)));
    }

    #[tokio::test]
    async fn falls_back_to_extension_when_octet_stream() {
        let config = crate::config::ExtractionConfig::default();
        let artifact = extract(
            b"hello world",
            "application/octet-stream",
            Some("notes.txt"),
            &NoOpOcrProvider,
            &config,
        )
        .await
        .unwrap();
        assert_eq!(artifact.text.as_deref(), Some("hello world"));
    }
}
