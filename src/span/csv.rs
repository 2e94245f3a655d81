//! CSV span generator: slices a table into contiguous row ranges
//! (spec.md §4.3), rendering each range back to the pipe-delimited text
//! the rest of the crate treats as a span's body.

use crate::extract::ExtractedTable;
use crate::models::{Locator, SpanType};

use super::{make_span, SpanData, DEFAULT_ROWS_PER_SPAN, MAX_ROWS_PER_SPAN, MIN_ROWS_PER_SPAN};

/// Generate row-range spans for `table`. `rows_per_span` is clamped to
/// `[MIN_ROWS_PER_SPAN, MAX_ROWS_PER_SPAN]` and defaults to
/// `DEFAULT_ROWS_PER_SPAN` when `None`.
pub fn generate_csv_spans(table: &ExtractedTable, rows_per_span: Option<usize>) -> Vec<SpanData> {
    let rows_per_span = rows_per_span
        .unwrap_or(DEFAULT_ROWS_PER_SPAN)
        .clamp(MIN_ROWS_PER_SPAN, MAX_ROWS_PER_SPAN);

    if table.rows.is_empty() {
        return Vec::new();
    }

    let col_end = table.headers.len() as i64;
    let mut spans = Vec::new();
    let mut row_start = 0usize;

    while row_start < table.rows.len() {
        let row_end = (row_start + rows_per_span).min(table.rows.len());
        let chunk = &table.rows[row_start..row_end];
        let text_content = render_rows(&table.headers, chunk);

        let locator = Locator::Csv {
            row_start: row_start as i64,
            row_end: row_end as i64,
            col_start: 0,
            col_end,
            table_index: None,
        };

        spans.push(make_span(
            text_content,
            locator,
            None,
            SpanType::Table,
            serde_json::json!({ "table_name": table.name }),
        ));

        row_start = row_end;
    }

    spans
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

    fn table_with_rows(n: usize) -> ExtractedTable {
        ExtractedTable {
            name: Some("sheet1".to_string()),
            headers: vec!["a".to_string(), "b".to_string()],
            rows: (0..n).map(|i| vec![i.to_string(), (i * 2).to_string()]).collect(),
        }
    }

    #[test]
    fn empty_table_yields_no_spans() {
        let table = ExtractedTable { name: None, headers: vec![], rows: vec![] };
        assert!(generate_csv_spans(&table, None).is_empty());
    }

    #[test]
    fn splits_into_row_chunks_covering_every_row() {
        let table = table_with_rows(60);
        let spans = generate_csv_spans(&table, Some(25));
        assert_eq!(spans.len(), 3);
        let (mut lo, mut hi) = (i64::MAX, i64::MIN);
        for span in &spans {
            if let Locator::Csv { row_start, row_end, .. } = span.locator {
                lo = lo.min(row_start);
                hi = hi.max(row_end);
            }
        }
        assert_eq!(lo, 0);
        assert_eq!(hi, 60);
    }

    #[test]
    fn out_of_range_rows_per_span_is_clamped() {
        let table = table_with_rows(10);
        let spans_low = generate_csv_spans(&table, Some(1));
        let spans_high = generate_csv_spans(&table, Some(1000));
        assert_eq!(spans_low.len(), 2); // clamped to MIN_ROWS_PER_SPAN=5 -> ceil(10/5)=2
        assert_eq!(spans_high.len(), 1); // clamped to MAX_ROWS_PER_SPAN=50, fits in one
    }
}
