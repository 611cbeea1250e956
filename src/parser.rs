//! Per-line parsing: auto-detection or typed parse of one line, plus
//! validation. Pure functions, no I/O, no shared state — mirrors the
//! teacher's preference for small free functions over stateful objects
//! where no state is actually needed.

use serde_json::Value;

/// Raw line text kept in an error entry is capped to this many bytes.
const RAW_PREVIEW_LEN: usize = 200;

/// The outcome of parsing one line. A proper sum type instead of nullable
/// `data`/`error` fields: a caller can't observe both or neither.
#[derive(Debug, Clone, PartialEq)]
pub enum LineParse {
    /// The line was empty after trimming; silently skipped.
    Empty,
    Ok { line_number: u64, data: Value },
    Err {
        line_number: u64,
        message: String,
        raw: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserKind {
    Json,
    Csv,
    Text,
    Auto,
}

/// Choose a parser kind from a declared content-type, by substring match.
pub fn select_parser(content_type: &str) -> ParserKind {
    let lower = content_type.to_ascii_lowercase();
    if lower.contains("json") {
        ParserKind::Json
    } else if lower.contains("csv") {
        ParserKind::Csv
    } else if lower.contains("text") {
        ParserKind::Text
    } else {
        ParserKind::Auto
    }
}

fn truncate_raw(line: &str) -> String {
    if line.len() <= RAW_PREVIEW_LEN {
        line.to_string()
    } else {
        line.chars().take(RAW_PREVIEW_LEN).collect()
    }
}

/// Parse one line as JSON.
pub fn parse_json(line: &str, line_number: u64) -> LineParse {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return LineParse::Empty;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(data) => LineParse::Ok { line_number, data },
        Err(e) => LineParse::Err {
            line_number,
            message: format!("invalid JSON: {e}"),
            raw: truncate_raw(line),
        },
    }
}

/// Parse one line as CSV, splitting on `,` and trimming each cell. Does
/// **not** handle quoted commas — a line like `"a,b",c` splits into three
/// cells rather than two.
pub fn parse_csv(line: &str, line_number: u64, headers: Option<&[String]>) -> LineParse {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return LineParse::Empty;
    }

    let cells: Vec<&str> = trimmed.split(',').map(|c| c.trim()).collect();
    let data = match headers {
        Some(headers) if headers.len() == cells.len() => {
            let mut obj = serde_json::Map::new();
            for (header, cell) in headers.iter().zip(cells.iter()) {
                obj.insert(header.clone(), Value::String(cell.to_string()));
            }
            Value::Object(obj)
        }
        _ => {
            let mut obj = serde_json::Map::new();
            for (i, cell) in cells.iter().enumerate() {
                obj.insert(format!("field_{i}"), Value::String(cell.to_string()));
            }
            Value::Object(obj)
        }
    };

    LineParse::Ok { line_number, data }
}

/// Wrap the un-trimmed line as `{"text": line}`. Empty trimmed lines are
/// skipped.
pub fn parse_text(line: &str, line_number: u64) -> LineParse {
    if line.trim().is_empty() {
        return LineParse::Empty;
    }
    let mut obj = serde_json::Map::new();
    obj.insert("text".to_string(), Value::String(line.to_string()));
    LineParse::Ok {
        line_number,
        data: Value::Object(obj),
    }
}

/// Auto-detect: JSON if the trimmed line starts with `{`/`[`; else CSV if it
/// contains a comma; else text.
pub fn parse_auto(line: &str, line_number: u64) -> LineParse {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return LineParse::Empty;
    }
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        parse_json(line, line_number)
    } else if trimmed.contains(',') {
        parse_csv(line, line_number, None)
    } else {
        parse_text(line, line_number)
    }
}

/// Parse one line using the given parser kind.
pub fn parse_line(kind: ParserKind, line: &str, line_number: u64) -> LineParse {
    match kind {
        ParserKind::Json => parse_json(line, line_number),
        ParserKind::Csv => parse_csv(line, line_number, None),
        ParserKind::Text => parse_text(line, line_number),
        ParserKind::Auto => parse_auto(line, line_number),
    }
}

/// Reject non-objects and empty objects; everything else is considered
/// structurally valid for storage as a parsed record.
pub fn validate(data: &Value) -> bool {
    match data {
        Value::Object(map) => !map.is_empty(),
        _ => false,
    }
}
