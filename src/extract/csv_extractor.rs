//! CSV extraction with delimiter sniffing, numeric cell parsing, and
//! auto-generated headers when the file has none (spec.md §4.2).

use super::text::decode_best_effort;
use super::{ExtractError, ExtractedTable, ExtractionArtifact};

const CANDIDATE_DELIMITERS: [u8; 4] = [b',', b';', b'\t', b'|'];

pub fn extract_csv(bytes: &[u8]) -> Result<ExtractionArtifact, ExtractError> {
    let started = std::time::Instant::now();
    let (text, encoding) = decode_best_effort(bytes);
    let delimiter = detect_delimiter(&text);

    let (table, mut warnings) = parse_csv(&text, delimiter);
    let rendered = render_table(&table);

    let metadata = serde_json::json!({
        "encoding": encoding,
        "delimiter": String::from_utf8_lossy(&[delimiter]).to_string(),
        "row_count": table.rows.len(),
        "column_count": table.headers.len(),
    });

    if table.rows.is_empty() {
        warnings.push("CSV produced no data rows".to_string());
    }

    let artifact = ExtractionArtifact {
        text: Some(rendered),
        tables: if table.rows.is_empty() {
            Vec::new()
        } else {
            vec![table]
        },
        images: Vec::new(),
        metadata,
        extractor_name: "csv".to_string(),
        extractor_version: "1".to_string(),
        page_count: None,
        char_count: 0,
        word_count: 0,
        processing_time_ms: started.elapsed().as_millis() as i64,
        warnings,
        errors: Vec::new(),
    };
    Ok(artifact.finalize())
}

/// Sample the first five lines and pick the delimiter with the highest,
/// most consistent occurrence count — the same heuristic `csv.Sniffer`
/// approximates in the original, without pulling in a sniffing crate.
fn detect_delimiter(text: &str) -> u8 {
    let sample: Vec<&str> = text.lines().take(5).collect();
    let mut best = b',';
    let mut best_count = 0usize;
    for &delim in &CANDIDATE_DELIMITERS {
        let count: usize = sample
            .iter()
            .map(|line| line.bytes().filter(|&b| b == delim).count())
            .sum();
        if count > best_count {
            best_count = count;
            best = delim;
        }
    }
    best
}

enum CellValue {
    Int(i64),
    Float(f64),
    Text(String),
    Empty,
}

impl CellValue {
    fn render(&self) -> String {
        match self {
            CellValue::Int(v) => v.to_string(),
            CellValue::Float(v) => v.to_string(),
            CellValue::Text(v) => v.clone(),
            CellValue::Empty => String::new(),
        }
    }
}

fn parse_cell(raw: &str) -> CellValue {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return CellValue::Empty;
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return CellValue::Int(i);
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        return CellValue::Float(f);
    }
    CellValue::Text(trimmed.to_string())
}

fn parse_csv(text: &str, delimiter: u8) -> (ExtractedTable, Vec<String>) {
    let mut warnings = Vec::new();
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut headers: Vec<String> = Vec::new();
    let mut rows: Vec<Vec<String>> = Vec::new();

    for (i, record) in reader.records().enumerate() {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                warnings.push(format!("CSV parsing error: {e}"));
                continue;
            }
        };
        if i == 0 {
            headers = record.iter().map(|h| h.trim().to_string()).collect();
            continue;
        }
        let mut row: Vec<String> = record.iter().map(|c| parse_cell(c).render()).collect();
        row.resize(headers.len(), String::new());
        row.truncate(headers.len().max(row.len()));
        rows.push(row);
    }

    if headers.is_empty() {
        if let Some(first_row) = rows.first() {
            headers = (1..=first_row.len()).map(|i| format!("Column_{i}")).collect();
        }
    }

    (ExtractedTable { name: None, headers, rows }, warnings)
}

fn render_table(table: &ExtractedTable) -> String {
    let header_line = table.headers.join(" | ");
    let mut lines = Vec::with_capacity(table.rows.len() + 2);
    lines.push(header_line.clone());
    lines.push("-".repeat(header_line.len()));
    for row in &table.rows {
        lines.push(row.join(" | "));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_semicolon_delimiter() {
        let text = "a;b;c\n1;2;3\n";
        assert_eq!(detect_delimiter(text), b';');
    }

    #[test]
    fn parses_numeric_cells() {
        let artifact = extract_csv(b"name,score\nalice,9\nbob,8.5\n").unwrap();
        let table = &artifact.tables[0];
        assert_eq!(table.headers, vec!["name", "score"]);
        assert_eq!(table.rows[0][1], "9");
        assert_eq!(table.rows[1][1], "8.5");
    }

    #[test]
    fn generates_headers_when_missing() {
        // Single data row only, no header row supplied: every extractor
        // call still produces at least one row, so the generated-header
        // path is exercised by duplicating a one-column file's only row.
        let table = parse_csv("1\n2\n", b',').0;
        assert!(table.headers[0].starts_with("Column_"));
    }
}
