//! Office formats for `file_write`: `.xlsx` workbooks and `.docx`
//! documents, rendered to bytes so the sandbox can write them with its
//! no-overwrite guarantee.

use std::collections::HashSet;
use std::io::Cursor;

use docx_rs::{Docx, Paragraph, Run};
use rust_xlsxwriter::{Format, Workbook, Worksheet};
use serde_json::Value;

/// Excel's sheet-name limit, in characters.
const MAX_SHEET_NAME: usize = 31;

// ─────────────────────────────────────────────
// XLSX
// ─────────────────────────────────────────────

/// Render `{"sheets": [{"name", "headers", "rows"}]}` as a workbook.
/// A string is parsed as JSON first.
pub fn render_xlsx(content: &Value) -> anyhow::Result<Vec<u8>> {
    let parsed;
    let book = match content {
        Value::String(s) => {
            parsed = serde_json::from_str::<Value>(s).map_err(|_| {
                anyhow::anyhow!("XLSX content must be valid JSON with sheets data.")
            })?;
            &parsed
        }
        other => other,
    };
    let Some(obj) = book.as_object() else {
        anyhow::bail!(
            r#"XLSX content must be {{"sheets": [{{"name": ..., "headers": [...], "rows": [[...]]}}]}}."#
        );
    };

    let mut workbook = Workbook::new();
    let header_format = Format::new().set_bold();
    let mut used = HashSet::new();
    let sheets = obj
        .get("sheets")
        .and_then(|s| s.as_array())
        .map(Vec::as_slice)
        .unwrap_or_default();

    for (i, sheet) in sheets.iter().enumerate() {
        let fallback = format!("Sheet{}", i + 1);
        let name = sheet
            .get("name")
            .and_then(|n| n.as_str())
            .map(sheet_name)
            .filter(|n| !n.is_empty())
            .unwrap_or(fallback);
        let name = unique_name(name, &mut used);

        let worksheet = workbook.add_worksheet();
        worksheet.set_name(&name)?;

        let mut row: u32 = 0;
        if let Some(headers) = sheet.get("headers").and_then(|h| h.as_array()) {
            if !headers.is_empty() {
                for (col, header) in headers.iter().enumerate() {
                    worksheet.write_string_with_format(
                        row,
                        column(col)?,
                        cell_text(header),
                        &header_format,
                    )?;
                }
                row += 1;
            }
        }
        for values in sheet
            .get("rows")
            .and_then(|r| r.as_array())
            .map(Vec::as_slice)
            .unwrap_or_default()
        {
            let cells = match values.as_array() {
                Some(cells) => cells.as_slice(),
                None => std::slice::from_ref(values),
            };
            for (col, cell) in cells.iter().enumerate() {
                write_cell(worksheet, row, column(col)?, cell)?;
            }
            row = row
                .checked_add(1)
                .ok_or_else(|| anyhow::anyhow!("Too many rows for one sheet"))?;
        }
    }

    // An empty workbook is still a valid file.
    if sheets.is_empty() {
        workbook.add_worksheet();
    }
    Ok(workbook.save_to_buffer()?)
}

fn write_cell(worksheet: &mut Worksheet, row: u32, col: u16, cell: &Value) -> anyhow::Result<()> {
    match cell {
        Value::Null => {}
        Value::Bool(b) => {
            worksheet.write_boolean(row, col, *b)?;
        }
        Value::Number(n) => match n.as_f64() {
            Some(f) => {
                worksheet.write_number(row, col, f)?;
            }
            None => {
                worksheet.write_string(row, col, n.to_string())?;
            }
        },
        other => {
            worksheet.write_string(row, col, cell_text(other))?;
        }
    }
    Ok(())
}

fn column(index: usize) -> anyhow::Result<u16> {
    u16::try_from(index).map_err(|_| anyhow::anyhow!("Too many columns for one sheet"))
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Strip characters Excel rejects in sheet names and cut to 31 chars.
fn sheet_name(raw: &str) -> String {
    raw.chars()
        .filter(|c| !matches!(c, '[' | ']' | ':' | '*' | '?' | '/' | '\\'))
        .take(MAX_SHEET_NAME)
        .collect::<String>()
        .trim_matches('\'')
        .to_string()
}

/// Sheet names are case-insensitively unique within a workbook.
fn unique_name(name: String, used: &mut HashSet<String>) -> String {
    let mut candidate = name.clone();
    let mut n = 2;
    while used.contains(&candidate.to_lowercase()) {
        let suffix = format!(" ({n})");
        let keep = MAX_SHEET_NAME.saturating_sub(suffix.chars().count());
        candidate = format!("{}{suffix}", name.chars().take(keep).collect::<String>());
        n += 1;
    }
    used.insert(candidate.to_lowercase());
    candidate
}

// ─────────────────────────────────────────────
// DOCX
// ─────────────────────────────────────────────

/// Render markdown-ish text as a document. Takes `{"content": "..."}`, a
/// JSON string of that object, or the text itself. `#`, `##` and `###`
/// lines become headings; other non-blank lines become paragraphs.
pub fn render_docx(content: &Value) -> anyhow::Result<Vec<u8>> {
    let text = match content {
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(parsed @ Value::Object(_)) => markdown_field(&parsed)?,
            _ => s.clone(),
        },
        other => markdown_field(other)?,
    };

    let mut doc = Docx::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let paragraph = match heading(line) {
            Some((level, title)) => Paragraph::new()
                .add_run(Run::new().add_text(title).bold().size(heading_size(level))),
            None => Paragraph::new().add_run(Run::new().add_text(line)),
        };
        doc = doc.add_paragraph(paragraph);
    }

    let mut buf = Cursor::new(Vec::new());
    doc.build().pack(&mut buf)?;
    Ok(buf.into_inner())
}

fn markdown_field(content: &Value) -> anyhow::Result<String> {
    let Some(obj) = content.as_object() else {
        anyhow::bail!(r#"DOCX content must be {{"content": "markdown string"}}."#);
    };
    Ok(obj.get("content").map(cell_text).unwrap_or_default())
}

fn heading(line: &str) -> Option<(u8, &str)> {
    [("### ", 3), ("## ", 2), ("# ", 1)]
        .into_iter()
        .find_map(|(prefix, level)| line.strip_prefix(prefix).map(|t| (level, t.trim())))
}

/// Run size in half-points.
fn heading_size(level: u8) -> usize {
    match level {
        1 => 32,
        2 => 28,
        _ => 24,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn is_zip(bytes: &[u8]) -> bool {
        bytes.starts_with(b"PK\x03\x04")
    }

    #[test]
    fn test_xlsx_from_object_and_string() {
        let content = json!({"sheets": [
            {"name": "Sales", "headers": ["region", "total"], "rows": [["north", 12.5], ["south", true]]},
            {"headers": ["only"], "rows": ["scalar row"]}
        ]});
        assert!(is_zip(&render_xlsx(&content).unwrap()));
        assert!(is_zip(&render_xlsx(&json!(content.to_string())).unwrap()));
        assert!(is_zip(&render_xlsx(&json!({})).unwrap()));
    }

    #[test]
    fn test_xlsx_rejects_non_json_text() {
        let err = render_xlsx(&json!("a,b,c")).unwrap_err();
        assert_eq!(err.to_string(), "XLSX content must be valid JSON with sheets data.");
        let err = render_xlsx(&json!([1, 2])).unwrap_err();
        assert!(err.to_string().starts_with("XLSX content must be {\"sheets\""));
    }

    #[test]
    fn test_sheet_names_are_cleaned_and_unique() {
        assert_eq!(sheet_name("Q1/Q2: [draft]?"), "Q1Q2 draft");
        assert_eq!(sheet_name(&"x".repeat(40)).len(), 31);

        let mut used = HashSet::new();
        assert_eq!(unique_name("Data".into(), &mut used), "Data");
        assert_eq!(unique_name("data".into(), &mut used), "data (2)");
        assert_eq!(unique_name("Data".into(), &mut used), "Data (3)");
    }

    #[test]
    fn test_docx_accepts_object_json_text_and_markdown() {
        let md = "# Report\n\n## Summary\nAll good.\n### Detail\nmore";
        assert!(is_zip(&render_docx(&json!({"content": md})).unwrap()));
        assert!(is_zip(&render_docx(&json!(json!({"content": md}).to_string())).unwrap()));
        assert!(is_zip(&render_docx(&json!(md)).unwrap()));

        let err = render_docx(&json!(42)).unwrap_err();
        assert!(err.to_string().starts_with("DOCX content must be"));
    }

    #[test]
    fn test_heading_levels() {
        assert_eq!(heading("# Title"), Some((1, "Title")));
        assert_eq!(heading("### Deep"), Some((3, "Deep")));
        assert_eq!(heading("#hashtag"), None);
        assert_eq!(heading("plain"), None);
    }
}
