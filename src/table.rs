//! Header-plus-rows table model over delimited text.
//!
//! The parser accepts the usual quoted-field grammar (embedded commas,
//! quotes, and newlines) and reconciles ragged records against the header
//! width instead of rejecting them: extraction scripts routinely emit short
//! or overlong rows and those exports still need to load.

use anyhow::{anyhow, Result};
use std::collections::BTreeMap;

/// One parsed row, keyed by header name. Every key set is exactly the table's
/// header list.
pub type Row = BTreeMap<String, String>;

/// A parsed table: ordered headers plus rows in source order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Row>,
}

impl Table {
    /// Parse delimited text. The first record is the header; later records
    /// are right-padded or right-truncated to the header width. Empty input
    /// yields an empty table. The only hard error is an unterminated quote.
    pub fn parse(text: &str) -> Result<Self> {
        let records = tokenize(text)?;
        let mut records = records.into_iter();
        let Some(headers) = records.next() else {
            return Ok(Self::default());
        };

        let rows = records
            .map(|record| {
                headers
                    .iter()
                    .enumerate()
                    .map(|(idx, header)| {
                        let value = record.get(idx).cloned().unwrap_or_default();
                        (header.clone(), value)
                    })
                    .collect()
            })
            .collect();

        Ok(Self { headers, rows })
    }

    /// True when the input had no usable header record.
    pub fn has_headers(&self) -> bool {
        self.headers.iter().any(|header| !header.is_empty())
    }

    /// Serialize back to delimited text: header record, then one record per
    /// row with absent keys written as empty fields. Line-feed terminated
    /// only, so output diffs stay stable across platforms.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        push_record(&mut out, self.headers.iter().map(String::as_str));
        for row in &self.rows {
            push_record(
                &mut out,
                self.headers
                    .iter()
                    .map(|header| row.get(header).map(String::as_str).unwrap_or("")),
            );
        }
        out
    }
}

fn push_record<'a>(out: &mut String, fields: impl Iterator<Item = &'a str>) {
    for (idx, field) in fields.enumerate() {
        if idx > 0 {
            out.push(',');
        }
        if field.contains(['"', ',', '\n', '\r']) {
            out.push('"');
            out.push_str(&field.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(field);
        }
    }
    out.push('\n');
}

/// Split text into records of fields. Accepts LF and CRLF record terminators;
/// a quoted field may contain either verbatim.
fn tokenize(text: &str) -> Result<Vec<Vec<String>>> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut chars = text.chars().peekable();
    let mut in_quotes = false;
    // Whether the current record has any content yet; a bare trailing
    // newline must not produce a phantom empty record.
    let mut pending = false;

    while let Some(ch) = chars.next() {
        if in_quotes {
            match ch {
                '"' => {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        field.push('"');
                    } else {
                        in_quotes = false;
                    }
                }
                _ => field.push(ch),
            }
            continue;
        }
        match ch {
            '"' => {
                in_quotes = true;
                pending = true;
            }
            ',' => {
                record.push(std::mem::take(&mut field));
                pending = true;
            }
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
                pending = false;
            }
            _ => {
                field.push(ch);
                pending = true;
            }
        }
    }

    if in_quotes {
        return Err(anyhow!("unterminated quoted field in delimited input"));
    }
    if pending || !record.is_empty() {
        record.push(field);
        records.push(record);
    }
    Ok(records)
}
