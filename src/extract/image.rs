//! Image extraction: reads pixel dimensions via the `image` crate and
//! defers recognition text to a pluggable [`OcrProvider`] (spec.md §4.2).
//! An uploaded image has no pages or tables, only itself as a single
//! [`ExtractedImage`] entry.

use image::GenericImageView;

use super::{ExtractError, ExtractedImage, ExtractionArtifact, OcrProvider};

pub fn extract_image(
    bytes: &[u8],
    content_type: &str,
    filename_hint: Option<&str>,
    ocr: &dyn OcrProvider,
) -> Result<ExtractionArtifact, ExtractError> {
    let started = std::time::Instant::now();
    let img = image::load_from_memory(bytes).map_err(|e| ExtractError::Image(e.to_string()))?;
    let (width, height) = img.dimensions();

    let filename = filename_hint.unwrap_or("image").to_string();
    let ocr_text = ocr.recognize(bytes);

    let metadata = serde_json::json!({
        "content_type": content_type,
        "width": width,
        "height": height,
    });

    let image_entry = ExtractedImage {
        filename: filename.clone(),
        image_index: 0,
        width: Some(width as i64),
        height: Some(height as i64),
        page_number: None,
        ocr_text: ocr_text.clone(),
        storage_path: None,
    };

    let artifact = ExtractionArtifact {
        text: ocr_text,
        tables: Vec::new(),
        images: vec![image_entry],
        metadata,
        extractor_name: "image".to_string(),
        extractor_version: "1".to_string(),
        page_count: None,
        char_count: 0,
        word_count: 0,
        processing_time_ms: started.elapsed().as_millis() as i64,
        warnings: Vec::new(),
        errors: Vec::new(),
    };
    Ok(artifact.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::NoOpOcrProvider;

    fn tiny_png() -> Vec<u8> {
        let img = image::RgbImage::from_pixel(2, 2, image::Rgb([10, 20, 30]));
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    #[test]
    fn reads_dimensions_from_png() {
        let bytes = tiny_png();
        let artifact = extract_image(&bytes, "image/png", Some("dot.png"), &NoOpOcrProvider).unwrap();
        assert_eq!(artifact.images.len(), 1);
        assert_eq!(artifact.images[0].width, Some(2));
        assert_eq!(artifact.images[0].height, Some(2));
    }

    #[test]
    fn no_op_ocr_leaves_text_empty() {
        let bytes = tiny_png();
        let artifact = extract_image(&bytes, "image/png", None, &NoOpOcrProvider).unwrap();
        assert!(artifact.text.is_none());
    }
}
