//! Delimited text parsing for bulk loads
//!
//! Accepts the loose CSV that spreadsheet exports produce: an optional UTF-8
//! byte-order mark, any of `,` `;` TAB `|` as separator (detected from the
//! header row), double-quoted fields with `""` escapes, CRLF or LF line ends.
//! Header names are trimmed and lower-cased; rows are exposed as name lookups.

use std::collections::HashMap;
use taxq_common::{Error, Result};

/// Candidate separators in tie-break order
pub const SEPARATORS: [char; 4] = [',', ';', '\t', '|'];

const BOM: char = '\u{feff}';

/// Parsed file: header plus data rows (blank rows dropped)
#[derive(Debug, Clone)]
pub struct Table {
    pub headers: Vec<String>,
    pub separator: char,
    pub rows: Vec<TableRow>,
}

/// One data row
#[derive(Debug, Clone)]
pub struct TableRow {
    /// Line in the source file where the row starts (header is line 1 when it
    /// is the first line)
    pub line: usize,
    fields: HashMap<String, String>,
}

impl TableRow {
    /// Trimmed value of column `name`; empty cells read as absent
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    /// First non-empty value among alias column names
    pub fn first_of(&self, names: &[&str]) -> Option<&str> {
        names.iter().find_map(|name| self.get(name))
    }
}

/// Pick the separator that occurs most often outside quotes in the first line
pub fn detect_separator(content: &str) -> char {
    let mut counts = [0usize; SEPARATORS.len()];
    let mut in_quotes = false;

    for ch in content.chars() {
        match ch {
            '"' => in_quotes = !in_quotes,
            '\n' | '\r' if !in_quotes => break,
            _ if !in_quotes => {
                if let Some(index) = SEPARATORS.iter().position(|sep| *sep == ch) {
                    counts[index] += 1;
                }
            }
            _ => {}
        }
    }

    // max_by_key keeps the last maximum; iterate reversed so ties go to the
    // earlier candidate
    SEPARATORS
        .iter()
        .zip(counts.iter())
        .rev()
        .max_by_key(|(_, count)| **count)
        .filter(|(_, count)| **count > 0)
        .map(|(sep, _)| *sep)
        .unwrap_or(',')
}

/// Parse delimited text with a mandatory header row
pub fn parse(content: &str) -> Result<Table> {
    let content = content.strip_prefix(BOM).unwrap_or(content);
    let separator = detect_separator(content);

    let mut records = split_records(content, separator)?
        .into_iter()
        .filter(|(_, fields)| fields.iter().any(|field| !field.trim().is_empty()));

    let (_, header) = records
        .next()
        .ok_or_else(|| Error::Parse("file has no header row".to_string()))?;
    let headers: Vec<String> = header
        .iter()
        .map(|name| name.trim().to_lowercase())
        .collect();

    let rows = records
        .map(|(line, values)| {
            let mut fields = HashMap::with_capacity(headers.len());
            for (name, value) in headers.iter().zip(values) {
                if !name.is_empty() {
                    fields.entry(name.clone()).or_insert(value);
                }
            }
            TableRow { line, fields }
        })
        .collect();

    Ok(Table {
        headers,
        separator,
        rows,
    })
}

/// Split into records of raw fields, tagged with their starting line
fn split_records(content: &str, separator: char) -> Result<Vec<(usize, Vec<String>)>> {
    let mut records = Vec::new();
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut line = 1;
    let mut record_line = 1;
    let mut chars = content.chars().peekable();

    while let Some(ch) = chars.next() {
        if in_quotes {
            match ch {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                '\n' => {
                    line += 1;
                    field.push(ch);
                }
                _ => field.push(ch),
            }
            continue;
        }

        match ch {
            '"' if field.trim().is_empty() => {
                field.clear();
                in_quotes = true;
            }
            '\r' | '\n' => {
                if ch == '\r' && chars.peek() == Some(&'\n') {
                    chars.next();
                }
                fields.push(std::mem::take(&mut field));
                records.push((record_line, std::mem::take(&mut fields)));
                line += 1;
                record_line = line;
            }
            _ if ch == separator => fields.push(std::mem::take(&mut field)),
            _ => field.push(ch),
        }
    }

    if in_quotes {
        return Err(Error::Parse(format!(
            "unterminated quoted field in record starting at line {}",
            record_line
        )));
    }

    if !field.is_empty() || !fields.is_empty() {
        fields.push(field);
        records.push((record_line, fields));
    }

    Ok(records)
}
