//! Excel span generator: one span per row range per sheet, addressed by
//! A1 cell-range notation (spec.md §4.3). Row/column indices are shifted
//! by the header row and converted to 1-indexed, so the first data row
//! (index 0) lands on sheet row 2.

use crate::extract::ExtractedTable;
use crate::models::{Locator, SpanType};

use super::{make_span, SpanData, DEFAULT_ROWS_PER_SPAN, MAX_ROWS_PER_SPAN, MIN_ROWS_PER_SPAN};

/// Generate spans for every sheet in `tables` (one [`ExtractedTable`] per
/// sheet, as produced by `extract::xlsx::extract_xlsx`).
pub fn generate_excel_spans(tables: &[ExtractedTable], rows_per_span: Option<usize>) -> Vec<SpanData> {
    tables
        .iter()
        .flat_map(|table| generate_sheet_spans(table, rows_per_span))
        .collect()
}

fn generate_sheet_spans(table: &ExtractedTable, rows_per_span: Option<usize>) -> Vec<SpanData> {
    let rows_per_span = rows_per_span
        .unwrap_or(DEFAULT_ROWS_PER_SPAN)
        .clamp(MIN_ROWS_PER_SPAN, MAX_ROWS_PER_SPAN);

    if table.rows.is_empty() {
        return Vec::new();
    }

    let sheet = table.name.clone().unwrap_or_else(|| "Sheet1".to_string());
    let last_col = table.headers.len().saturating_sub(1) as u32;
    let end_col_letters = column_letters(last_col);

    let mut spans = Vec::new();
    let mut row_start = 0usize;

    while row_start < table.rows.len() {
        let row_end = (row_start + rows_per_span).min(table.rows.len());
        let chunk = &table.rows[row_start..row_end];
        let text_content = render_rows(&table.headers, chunk);

        // +2: one for the header row, one for 1-indexing.
        let sheet_row_start = row_start as i64 + 2;
        let sheet_row_end = row_end as i64 + 1;
        let cell_range = format!("A{sheet_row_start}:{end_col_letters}{sheet_row_end}");

        let locator = Locator::Excel {
            sheet: sheet.clone(),
            cell_range,
        };

        spans.push(make_span(
            text_content,
            locator,
            None,
            SpanType::Table,
            serde_json::json!({ "sheet": sheet }),
        ));

        row_start = row_end;
    }

    spans
}

/// Zero-indexed column number to spreadsheet letters (0 -> A, 25 -> Z, 26 -> AA).
fn column_letters(mut col: u32) -> String {
    let mut letters = Vec::new();
    loop {
        letters.push((b'A' + (col % 26) as u8) as char);
        if col < 26 {
            break;
        }
        col = col / 26 - 1;
    }
    letters.iter().rev().collect()
}

fn render_rows(headers: &[String], rows: &[Vec<String>]) -> String {
    let mut lines = Vec::with_capacity(rows.len() + 1);
    lines.push(headers.join(" | "));
    for row in rows {
        lines.push(row.join(" | "));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(name: &str, cols: usize, rows: usize) -> ExtractedTable {
        ExtractedTable {
            name: Some(name.to_string()),
            headers: (0..cols).map(|i| format!("col{i}")).collect(),
            rows: (0..rows).map(|r| (0..cols).map(|c| format!("{r}-{c}")).collect()).collect(),
        }
    }

    #[test]
    fn column_letters_wraps_past_z() {
        assert_eq!(column_letters(0), "A");
        assert_eq!(column_letters(25), "Z");
        assert_eq!(column_letters(26), "AA");
        assert_eq!(column_letters(27), "AB");
    }

    #[test]
    fn cell_range_accounts_for_header_and_one_indexing() {
        let t = table("Sheet1", 3, 10);
        let spans = generate_excel_spans(&[t], Some(25));
        assert_eq!(spans.len(), 1);
        match &spans[0].locator {
            Locator::Excel { sheet, cell_range } => {
                assert_eq!(sheet, "Sheet1");
                assert_eq!(cell_range, "A2:C11");
            }
            _ => panic!("expected Excel locator"),
        }
    }

    #[test]
    fn multiple_sheets_each_produce_their_own_spans() {
        let t1 = table("Sheet1", 2, 5);
        let t2 = table("Sheet2", 2, 5);
        let spans = generate_excel_spans(&[t1, t2], None);
        assert_eq!(spans.len(), 2);
    }
}
