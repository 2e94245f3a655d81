//! Spreadsheet extraction via `calamine` (spec.md §4.2), one
//! [`ExtractedTable`] per sheet with the sheet name carried through so span
//! generation can address cells by `Sheet!A1:C10` notation.

use calamine::{open_workbook_auto_from_rs, Data, Reader};
use std::io::Cursor;

use super::{ExtractError, ExtractedTable, ExtractionArtifact};

pub fn extract_xlsx(
    bytes: &[u8],
    filename_hint: Option<&str>,
) -> Result<ExtractionArtifact, ExtractError> {
    let started = std::time::Instant::now();
    let cursor = Cursor::new(bytes);
    let mut workbook = open_workbook_auto_from_rs(cursor)
        .map_err(|e| ExtractError::Xlsx(format!("failed to open workbook: {e}")))?;

    let sheet_names = workbook.sheet_names().to_vec();
    let mut tables = Vec::with_capacity(sheet_names.len());
    let mut warnings = Vec::new();
    let mut text_parts = Vec::new();

    for name in &sheet_names {
        let range = match workbook.worksheet_range(name) {
            Ok(r) => r,
            Err(e) => {
                warnings.push(format!("sheet '{name}' could not be read: {e}"));
                continue;
            }
        };

        let mut rows_iter = range.rows();
        let headers: Vec<String> = match rows_iter.next() {
            Some(row) => row.iter().map(cell_to_string).collect(),
            None => {
                warnings.push(format!("sheet '{name}' is empty"));
                continue;
            }
        };

        let rows: Vec<Vec<String>> = rows_iter
            .filter(|row| !row.iter().all(|cell| matches!(cell, Data::Empty)))
            .map(|row| {
                let mut cells: Vec<String> = row.iter().map(cell_to_string).collect();
                cells.resize(headers.len(), String::new());
                cells
            })
            .collect();

        text_parts.push(render_sheet(name, &headers, &rows));
        tables.push(ExtractedTable {
            name: Some(name.clone()),
            headers,
            rows,
        });
    }

    if tables.is_empty() {
        return Err(ExtractError::Xlsx("workbook contains no readable sheets".to_string()));
    }

    let metadata = serde_json::json!({
        "sheet_names": sheet_names,
        "sheet_count": sheet_names.len(),
        "filename": filename_hint,
    });

    let artifact = ExtractionArtifact {
        text: Some(text_parts.join("\n\n")),
        tables,
        images: Vec::new(),
        metadata,
        extractor_name: "xlsx".to_string(),
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

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Float(f) => {
            if f.fract() == 0.0 && f.abs() < 1e15 {
                format!("{}", *f as i64)
            } else {
                f.to_string()
            }
        }
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::DateTime(d) => d.to_string(),
        Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
        Data::Error(e) => format!("#ERROR({e:?})"),
    }
}

fn render_sheet(name: &str, headers: &[String], rows: &[Vec<String>]) -> String {
    let mut lines = vec![format!("## {name}"), headers.join(" | ")];
    for row in rows {
        lines.push(row.join(" | "));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_to_string_renders_whole_floats_without_decimal() {
        assert_eq!(cell_to_string(&Data::Float(42.0)), "42");
        assert_eq!(cell_to_string(&Data::Float(3.5)), "3.5");
    }

    #[test]
    fn cell_to_string_empty_is_blank() {
        assert_eq!(cell_to_string(&Data::Empty), "");
    }

    #[test]
    fn fully_empty_rows_are_filtered_before_mapping() {
        let headers: Vec<String> = vec!["a".to_string(), "b".to_string()];
        let raw_rows = vec![
            vec![Data::String("x".to_string()), Data::Int(1)],
            vec![Data::Empty, Data::Empty],
            vec![Data::Empty, Data::String("y".to_string())],
        ];
        let kept: Vec<Vec<String>> = raw_rows
            .into_iter()
            .filter(|row| !row.iter().all(|cell| matches!(cell, Data::Empty)))
            .map(|row| {
                let mut cells: Vec<String> = row.iter().map(cell_to_string).collect();
                cells.resize(headers.len(), String::new());
                cells
            })
            .collect();
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0], vec!["x".to_string(), "1".to_string()]);
        assert_eq!(kept[1], vec!["".to_string(), "y".to_string()]);
    }
}
