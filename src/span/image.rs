//! Image span generator: an uploaded or embedded image becomes exactly one
//! span, its text content the OCR output when present (spec.md §4.3).

use crate::extract::ExtractedImage;
use crate::models::{Locator, SpanType};

use super::{make_span, SpanData};

pub fn generate_image_span(image: &ExtractedImage) -> SpanData {
    let locator = Locator::Image {
        filename: image.filename.clone(),
        image_index: image.image_index,
        width: image.width,
        height: image.height,
        page_number: image.page_number,
    };

    make_span(
        image.ocr_text.clone().unwrap_or_default(),
        locator,
        None,
        SpanType::Figure,
        serde_json::json!({}),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_text_falls_back_to_empty_without_ocr() {
        let image = ExtractedImage {
            filename: "fig1.png".to_string(),
            image_index: 0,
            width: Some(100),
            height: Some(50),
            page_number: Some(3),
            ocr_text: None,
            storage_path: None,
        };
        let span = generate_image_span(&image);
        assert_eq!(span.text_content, "");
        assert_eq!(span.span_type, SpanType::Figure);
    }

    #[test]
    fn span_text_uses_ocr_output_when_present() {
        let image = ExtractedImage {
            filename: "fig2.png".to_string(),
            image_index: 1,
            width: None,
            height: None,
            page_number: None,
            ocr_text: Some("recognized caption text".to_string()),
            storage_path: None,
        };
        let span = generate_image_span(&image);
        assert_eq!(span.text_content, "recognized caption text");
    }
}
