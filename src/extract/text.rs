//! Plain text / markdown extraction with multi-encoding detection
//! (spec.md §4.2): BOM-aware UTF-8/UTF-16-LE/UTF-16-BE detection, then a
//! UTF-8 / Latin-1 / CP1252 fallback chain, with a final lossy-UTF-8
//! fallback that never fails.

use super::{ExtractError, ExtractionArtifact};

pub fn extract_text(bytes: &[u8]) -> Result<ExtractionArtifact, ExtractError> {
    let started = std::time::Instant::now();
    let (text, encoding_used) = decode_best_effort(bytes);

    let artifact = ExtractionArtifact {
        text: Some(text),
        tables: Vec::new(),
        images: Vec::new(),
        metadata: serde_json::json!({ "encoding": encoding_used }),
        extractor_name: "text".to_string(),
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

/// Try encodings in the order spec.md §4.2 names them, returning the first
/// clean decode and which encoding won. Shared with the CSV extractor,
/// which needs the same fallback chain before it can sniff a delimiter.
pub(crate) fn decode_best_effort(bytes: &[u8]) -> (String, &'static str) {
    if let Some(rest) = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
        if let Ok(s) = std::str::from_utf8(rest) {
            return (s.to_string(), "utf-8-bom");
        }
    }
    if let Some(rest) = bytes.strip_prefix(&[0xFF, 0xFE]) {
        if let Some(s) = decode_utf16(rest, false) {
            return (s, "utf-16-le");
        }
    }
    if let Some(rest) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        if let Some(s) = decode_utf16(rest, true) {
            return (s, "utf-16-be");
        }
    }
    if let Ok(s) = std::str::from_utf8(bytes) {
        return (s.to_string(), "utf-8");
    }
    // Latin-1 and CP1252 are both single-byte-per-codepoint supersets of
    // ASCII and never fail to decode, so they are tried only to get a
    // better result than lossy UTF-8, not as a fallible step.
    (decode_cp1252(bytes), "cp1252")
}

fn decode_utf16(bytes: &[u8], big_endian: bool) -> Option<String> {
    if bytes.len() % 2 != 0 {
        return None;
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|chunk| {
            if big_endian {
                u16::from_be_bytes([chunk[0], chunk[1]])
            } else {
                u16::from_le_bytes([chunk[0], chunk[1]])
            }
        })
        .collect();
    String::from_utf16(&units).ok()
}

/// CP1252 for the 0x80-0x9F range (where it diverges from Latin-1), Latin-1
/// identity mapping elsewhere.
fn decode_cp1252(bytes: &[u8]) -> String {
    const CP1252_HIGH: [char; 32] = [
        '\u{20AC}', '\u{FFFD}', '\u{201A}', '\u{0192}', '\u{201E}', '\u{2026}', '\u{2020}',
        '\u{2021}', '\u{02C6}', '\u{2030}', '\u{0160}', '\u{2039}', '\u{0152}', '\u{FFFD}',
        '\u{017D}', '\u{FFFD}', '\u{FFFD}', '\u{2018}', '\u{2019}', '\u{201C}', '\u{201D}',
        '\u{2022}', '\u{2013}', '\u{2014}', '\u{02DC}', '\u{2122}', '\u{0161}', '\u{203A}',
        '\u{0153}', '\u{FFFD}', '\u{017E}', '\u{0178}',
    ];
    bytes
        .iter()
        .map(|&b| {
            if (0x80..=0x9F).contains(&b) {
                CP1252_HIGH[(b - 0x80) as usize]
            } else {
                b as char
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_plain_utf8() {
        let artifact = extract_text("hello world".as_bytes()).unwrap();
        assert_eq!(artifact.text.as_deref(), Some("hello world"));
    }

    #[test]
    fn strips_utf8_bom() {
        let mut bytes = vec![0xEF, 0xBB, 0xBF];
        bytes.extend_from_slice(b"bom text");
        let artifact = extract_text(&bytes).unwrap();
        assert_eq!(artifact.text.as_deref(), Some("bom text"));
    }

    #[test]
    fn decodes_utf16_le() {
        let text = "hi";
        let mut bytes = vec![0xFF, 0xFE];
        for unit in text.encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        let artifact = extract_text(&bytes).unwrap();
        assert_eq!(artifact.text.as_deref(), Some("hi"));
    }

    #[test]
    fn falls_back_to_cp1252_for_invalid_utf8() {
        let bytes = vec![0x93, b'h', b'i', 0x94];
        let artifact = extract_text(&bytes).unwrap();
        assert!(artifact.text.unwrap().contains("hi"));
    }
}
