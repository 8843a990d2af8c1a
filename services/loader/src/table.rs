//! Tabular extraction and normalization
//!
//! Turns raw spreadsheet bytes (xlsx/xls or CSV) into a `RawTable` of
//! untyped cells, then normalizes it against a feed profile into a `Table`
//! of typed values: headers renamed to canonical names, noise columns
//! dropped, every cell coerced per its column class. Coercion never fails a
//! file; an uncoercible cell becomes null and the defect surfaces later as
//! a row-level skip or a missing measurement.

use anyhow::{anyhow, bail, Context, Result};
use calamine::{open_workbook_auto_from_rs, Data, Reader};
use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;

use crate::feed::{ColumnClass, FeedSpec};

// ============================================================
// Raw extraction
// ============================================================

/// A cell as read from the source file, before any typing.
#[derive(Debug, Clone, PartialEq)]
pub enum RawCell {
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Duration(NaiveTime),
}

#[derive(Debug, Clone)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<RawCell>>,
}

/// Read the configured worksheet out of an Excel workbook held in memory.
pub fn read_xlsx_bytes(bytes: &[u8], sheet: Option<&str>) -> Result<RawTable> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes))
        .context("Failed to open workbook")?;
    let sheet_name = match sheet {
        Some(name) => name.to_string(),
        None => workbook
            .sheet_names()
            .first()
            .cloned()
            .ok_or_else(|| anyhow!("Workbook has no worksheets"))?,
    };
    let range = workbook
        .worksheet_range(&sheet_name)
        .with_context(|| format!("Worksheet '{}' not found", sheet_name))?;

    let mut rows_iter = range.rows();
    let header_row = rows_iter
        .next()
        .ok_or_else(|| anyhow!("Worksheet '{}' is empty", sheet_name))?;
    let headers: Vec<String> = header_row
        .iter()
        .map(|cell| clean_header(&cell.to_string()))
        .collect();

    let mut rows = Vec::new();
    for row in rows_iter {
        let mut cells: Vec<RawCell> = row.iter().map(convert_cell).collect();
        cells.resize(headers.len(), RawCell::Empty);
        cells.truncate(headers.len());
        if cells.iter().all(|c| matches!(c, RawCell::Empty)) {
            continue;
        }
        rows.push(cells);
    }
    Ok(RawTable { headers, rows })
}

/// Headers sometimes carry embedded line breaks from wrapped cells.
fn clean_header(raw: &str) -> String {
    raw.replace(['\r', '\n'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn convert_cell(cell: &Data) -> RawCell {
    match cell {
        Data::Empty => RawCell::Empty,
        Data::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                RawCell::Empty
            } else {
                RawCell::Text(trimmed.to_string())
            }
        }
        Data::Float(f) => RawCell::Number(*f),
        Data::Int(i) => RawCell::Number(*i as f64),
        Data::Bool(b) => RawCell::Bool(*b),
        Data::DateTime(dt) => match dt.as_datetime() {
            Some(ndt) if ndt.time() == NaiveTime::MIN && dt.as_f64() >= 1.0 => {
                RawCell::Date(ndt.date())
            }
            Some(ndt) if dt.as_f64() < 1.0 => RawCell::Duration(ndt.time()),
            Some(ndt) => RawCell::DateTime(ndt),
            None => RawCell::Number(dt.as_f64()),
        },
        Data::DateTimeIso(s) | Data::DurationIso(s) => RawCell::Text(s.clone()),
        Data::Error(e) => RawCell::Text(format!("{:?}", e)),
    }
}

/// Read a CSV file held in memory. Decoded as UTF-8 with a lossy fallback
/// so a stray legacy byte cannot fail the whole file; calamine handles the
/// Excel formats, this path exists for plain exports.
pub fn read_csv_bytes(bytes: &[u8]) -> Result<RawTable> {
    let (text, _, _) = encoding_rs::UTF_8.decode(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .context("Failed to read CSV header row")?
        .iter()
        .map(clean_header)
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.context("Failed to read CSV record")?;
        let mut cells: Vec<RawCell> = record
            .iter()
            .map(|field| {
                let trimmed = field.trim();
                if trimmed.is_empty() {
                    RawCell::Empty
                } else {
                    RawCell::Text(trimmed.to_string())
                }
            })
            .collect();
        cells.resize(headers.len(), RawCell::Empty);
        cells.truncate(headers.len());
        if cells.iter().all(|c| matches!(c, RawCell::Empty)) {
            continue;
        }
        rows.push(cells);
    }
    Ok(RawTable { headers, rows })
}

/// Dispatch on file extension.
pub fn read_table(path: &Path, bytes: &[u8], sheet: Option<&str>) -> Result<RawTable> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "xlsx" | "xls" | "xlsm" | "xlsb" => read_xlsx_bytes(bytes, sheet),
        "csv" => read_csv_bytes(bytes),
        other => bail!("Unsupported file extension '{}'", other),
    }
}

// ============================================================
// Typed values and normalization
// ============================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Text(String),
    Number(f64),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl Value {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Value::Date(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            Value::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }
}

/// Normalized table: canonical columns in profile order, typed cells.
#[derive(Debug, Clone)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    index: HashMap<String, usize>,
}

impl Table {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Table {
        let index = columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.clone(), i))
            .collect();
        Table { columns, rows, index }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn value<'a>(&self, row: &'a [Value], name: &str) -> &'a Value {
        match self.column_index(name) {
            Some(i) => &row[i],
            None => &Value::Null,
        }
    }

    /// Non-empty text for a column, or None when absent/blank.
    pub fn text<'a>(&self, row: &'a [Value], name: &str) -> Option<&'a str> {
        self.value(row, name).as_text().filter(|s| !s.is_empty())
    }
}

/// Apply a feed profile to a raw table: drop noise, rename headers, emit
/// the canonical column set, coerce each cell by class. Source columns not
/// named by the profile are dropped; profile columns missing from the
/// source come out all-null.
pub fn normalize(raw: &RawTable, spec: &FeedSpec) -> Table {
    // raw header -> canonical name, skipping dropped headers
    let mut source_index: HashMap<&str, usize> = HashMap::new();
    for (i, header) in raw.headers.iter().enumerate() {
        if spec.drop.iter().any(|d| d == header) {
            continue;
        }
        let canonical = spec
            .rename
            .get(header)
            .map(|c| c.as_str())
            .unwrap_or(header.as_str());
        source_index.entry(canonical).or_insert(i);
    }

    let columns: Vec<String> = spec.columns.iter().map(|c| c.name.clone()).collect();
    let mut rows = Vec::with_capacity(raw.rows.len());
    for raw_row in &raw.rows {
        let mut row = Vec::with_capacity(spec.columns.len());
        for col in &spec.columns {
            let cell = source_index
                .get(col.name.as_str())
                .and_then(|&i| raw_row.get(i))
                .unwrap_or(&RawCell::Empty);
            let value = match col.class {
                ColumnClass::Text => coerce_text(cell),
                ColumnClass::Numeric => coerce_numeric(cell),
                ColumnClass::Date => coerce_date(cell),
                ColumnClass::Timestamp => {
                    let date = col
                        .date_column
                        .as_deref()
                        .and_then(|dc| source_index.get(dc))
                        .and_then(|&i| raw_row.get(i))
                        .map(coerce_date)
                        .and_then(|v| v.as_date());
                    coerce_timestamp(cell, date)
                }
            };
            row.push(value);
        }
        rows.push(row);
    }
    Table::new(columns, rows)
}

// ============================================================
// Cell coercion
// ============================================================

/// Text cells always land as Text, never Null: downstream treats an empty
/// string as the canonical "no value" for descriptive fields.
fn coerce_text(cell: &RawCell) -> Value {
    let s = match cell {
        RawCell::Empty => String::new(),
        RawCell::Text(s) => clean_text(s),
        RawCell::Number(n) => format_number_as_text(*n),
        RawCell::Bool(b) => b.to_string(),
        RawCell::Date(d) => d.format("%Y-%m-%d").to_string(),
        RawCell::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        RawCell::Duration(t) => t.format("%H:%M:%S").to_string(),
    };
    Value::Text(s)
}

fn clean_text(s: &str) -> String {
    let trimmed = s.trim().trim_matches(|c| c == '"' || c == '\'').trim();
    match trimmed {
        "None" | "none" | "nan" | "NaN" | "NULL" | "null" => String::new(),
        other => other.to_string(),
    }
}

/// Integral numbers print without a fractional part so identifiers read
/// back from numeric cells come out as "1234", not "1234.0".
fn format_number_as_text(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

fn coerce_numeric(cell: &RawCell) -> Value {
    let parsed = match cell {
        RawCell::Number(n) => Some(*n),
        RawCell::Text(s) => s.replace(',', "").trim().parse::<f64>().ok(),
        RawCell::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    };
    match parsed {
        Some(n) if n.is_finite() => Value::Number(round2(n)),
        _ => Value::Null,
    }
}

pub fn round2(n: f64) -> f64 {
    (n * 100.0).round() / 100.0
}

/// Tolerant date parsing. Accepts native date cells, Excel serial numbers,
/// and the textual formats seen in lab exports (day-first and ISO). Years
/// in the Buddhist calendar (>= 2400) are shifted to the common era.
fn coerce_date(cell: &RawCell) -> Value {
    let date = match cell {
        RawCell::Date(d) => Some(*d),
        RawCell::DateTime(dt) => Some(dt.date()),
        RawCell::Number(n) => excel_serial_to_date(*n),
        RawCell::Text(s) => parse_date_text(s),
        _ => None,
    };
    match date.map(fix_buddhist_year) {
        Some(d) => Value::Date(d),
        None => Value::Null,
    }
}

/// Excel epoch with the historical leap-year bug offset. Plausible sample
/// dates only; small numbers are measurements, not dates.
fn excel_serial_to_date(n: f64) -> Option<NaiveDate> {
    if !(20000.0..=80000.0).contains(&n) {
        return None;
    }
    let base = NaiveDate::from_ymd_opt(1899, 12, 30)?;
    base.checked_add_signed(Duration::days(n as i64))
}

fn parse_date_text(s: &str) -> Option<NaiveDate> {
    let s = clean_text(s);
    if s.is_empty() {
        return None;
    }
    // datetime text first so the time part does not break the date formats
    for fmt in ["%Y-%m-%d %H:%M:%S", "%d/%m/%Y %H:%M:%S", "%d/%m/%Y %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(&s, fmt) {
            return Some(dt.date());
        }
    }
    for fmt in ["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y", "%d/%m/%y"] {
        if let Ok(d) = NaiveDate::parse_from_str(&s, fmt) {
            return Some(d);
        }
    }
    None
}

fn fix_buddhist_year(d: NaiveDate) -> NaiveDate {
    use chrono::Datelike;
    if d.year() >= 2400 {
        d.with_year(d.year() - 543).unwrap_or(d)
    } else {
        d
    }
}

/// Combine a time-of-day cell with its companion date into a timestamp.
/// The time may arrive as a datetime cell, an Excel day-fraction, or
/// "HH:MM[:SS]" text; either half missing yields Null.
fn coerce_timestamp(cell: &RawCell, date: Option<NaiveDate>) -> Value {
    if let RawCell::DateTime(dt) = cell {
        return Value::Timestamp(*dt);
    }
    let time = match cell {
        RawCell::Duration(t) => Some(*t),
        RawCell::Number(n) if (0.0..1.0).contains(n) => {
            let secs = (n * 86400.0).round() as u32;
            NaiveTime::from_num_seconds_from_midnight_opt(secs % 86400, 0)
        }
        RawCell::Text(s) => parse_time_text(s),
        _ => None,
    };
    match (date, time) {
        (Some(d), Some(t)) => Value::Timestamp(d.and_time(t)),
        _ => Value::Null,
    }
}

fn parse_time_text(s: &str) -> Option<NaiveTime> {
    let s = clean_text(s);
    for fmt in ["%H:%M:%S", "%H:%M"] {
        if let Ok(t) = NaiveTime::parse_from_str(&s, fmt) {
            return Some(t);
        }
    }
    None
}

// ============================================================
// Tests
// ============================================================
