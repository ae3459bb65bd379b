//! Downloading and summarising the data file a quiz page links to.
//!
//! Parsing is delegated to `csv`, `calamine` and `pdf-extract`. Only the shape
//! of the summary handed to the model is decided here.

use std::io::Cursor;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use calamine::{Data, Reader, open_workbook_auto_from_rs};
use regex::Regex;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use serde_json::{Map, Number, Value};
use tracing::debug;

use crate::types::{DataSummary, Link, ParsedPayload};

/// Bytes inspected when guessing whether an unlabelled payload is text.
const SNIFF_BYTES: usize = 2000;

static DATA_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\.csv|\.xlsx?|\.pdf|\.json)$").expect("static regex"));

static NUMERIC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*-?(\d+\.?|\.\d+|\d+\.\d+)([eE][-+]?\d+)?\s*$").expect("static regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    Csv,
    Json,
    Excel,
    Pdf,
    Binary,
}

impl DataKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DataKind::Csv => "csv",
            DataKind::Json => "json",
            DataKind::Excel => "excel",
            DataKind::Pdf => "pdf",
            DataKind::Binary => "binary",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResource {
    pub content_type: String,
    pub size: usize,
    pub bytes: Vec<u8>,
}

/// Lowercased path of `url`, or the whole string if it does not parse.
fn lower_path(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) => parsed.path().to_ascii_lowercase(),
        Err(_) => url.to_ascii_lowercase(),
    }
}

pub fn is_data_link(href: &str) -> bool {
    DATA_LINK.is_match(&lower_path(href))
}

/// The first link pointing at a data file, in document order.
pub fn first_data_link(links: &[Link]) -> Option<&Link> {
    links.iter().find(|l| is_data_link(&l.href))
}

/// Content type wins when it is specific; otherwise the extension decides.
/// Anything unrecognised is `Binary` and gets sniffed after download.
pub fn classify(content_type: &str, url: &str) -> DataKind {
    let ct = content_type.to_ascii_lowercase();
    let path = lower_path(url);

    if ct.contains("text/csv") || path.ends_with(".csv") {
        DataKind::Csv
    } else if ct.contains("application/json") || path.ends_with(".json") {
        DataKind::Json
    } else if ct.contains("spreadsheet") || path.ends_with(".xlsx") || path.ends_with(".xls") {
        DataKind::Excel
    } else if ct.contains("pdf") || path.ends_with(".pdf") {
        DataKind::Pdf
    } else {
        DataKind::Binary
    }
}

pub async fn fetch_resource(
    client: &Client,
    url: &str,
    timeout: Duration,
) -> Result<FetchedResource> {
    let response = client
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .with_context(|| format!("GET {url}"))?
        .error_for_status()?;

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let bytes = response.bytes().await.context("reading response body")?.to_vec();

    Ok(FetchedResource {
        content_type,
        size: bytes.len(),
        bytes,
    })
}

/// Download `url` and reduce it to a summary the model can read.
pub async fn fetch_and_parse(
    client: &Client,
    url: &str,
    timeout: Duration,
    row_limit: usize,
) -> Result<DataSummary> {
    let resource = fetch_resource(client, url, timeout).await?;
    let size = resource.size;

    let (kind, parsed) = match classify(&resource.content_type, url) {
        DataKind::Csv => (DataKind::Csv, Some(parse_csv(&resource.bytes, row_limit)?)),
        DataKind::Json => (DataKind::Json, Some(parse_json(&resource.bytes)?)),
        DataKind::Excel => (DataKind::Excel, Some(parse_spreadsheet(&resource.bytes)?)),
        DataKind::Pdf => (DataKind::Pdf, Some(parse_pdf(resource.bytes).await)),
        DataKind::Binary => sniff(&resource.bytes, row_limit),
    };

    debug!(url, kind = kind.as_str(), size, "data link parsed");

    Ok(DataSummary::Loaded {
        url: url.to_string(),
        kind: kind.as_str().to_string(),
        size,
        parsed,
    })
}

/// Unlabelled payloads that look like text get one chance as CSV.
fn sniff(bytes: &[u8], row_limit: usize) -> (DataKind, Option<ParsedPayload>) {
    let head = String::from_utf8_lossy(&bytes[..bytes.len().min(SNIFF_BYTES)]);
    if head.contains(',') || head.contains('\n') {
        if let Ok(table) = parse_csv(bytes, row_limit) {
            return (DataKind::Csv, Some(table));
        }
    }
    (DataKind::Binary, None)
}

/// Header-keyed rows with numbers and booleans typed, truncated to `limit`.
pub fn parse_csv(bytes: &[u8], limit: usize) -> Result<ParsedPayload> {
    let text = String::from_utf8_lossy(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers = reader.headers().context("reading CSV header")?.clone();
    let mut data = Vec::new();

    for record in reader.records() {
        let record = record.context("reading CSV record")?;
        let mut row = Map::new();
        let mut extra = Vec::new();

        for (i, field) in record.iter().enumerate() {
            match headers.get(i) {
                Some(name) => {
                    row.insert(name.to_string(), typed_cell(field));
                }
                None => extra.push(typed_cell(field)),
            }
        }
        if !extra.is_empty() {
            row.insert("__parsed_extra".to_string(), Value::Array(extra));
        }
        data.push(row);
    }

    let total_rows = data.len();
    let truncated = total_rows > limit;
    data.truncate(limit);

    Ok(ParsedPayload::Table {
        data,
        truncated: Some(truncated),
        total_rows: Some(total_rows),
    })
}

/// Booleans are only the lower and upper case spellings; `True` stays a string.
fn typed_cell(field: &str) -> Value {
    match field {
        "" => Value::Null,
        "true" | "TRUE" => Value::Bool(true),
        "false" | "FALSE" => Value::Bool(false),
        _ if NUMERIC.is_match(field) => {
            let trimmed = field.trim();
            if let Ok(i) = trimmed.parse::<i64>() {
                Value::Number(i.into())
            } else {
                trimmed
                    .parse::<f64>()
                    .ok()
                    .and_then(Number::from_f64)
                    .map(Value::Number)
                    .unwrap_or_else(|| Value::String(field.to_string()))
            }
        }
        _ => Value::String(field.to_string()),
    }
}

pub fn parse_json(bytes: &[u8]) -> Result<ParsedPayload> {
    let text = String::from_utf8_lossy(bytes);
    let data = serde_json::from_str(&text).context("parsing JSON data file")?;
    Ok(ParsedPayload::Document { data })
}

/// Rows of the first sheet, keyed by its first row. Missing cells are null.
pub fn parse_spreadsheet(bytes: &[u8]) -> Result<ParsedPayload> {
    let mut workbook =
        open_workbook_auto_from_rs(Cursor::new(bytes.to_vec())).context("opening workbook")?;

    let empty = ParsedPayload::Table {
        data: Vec::new(),
        truncated: None,
        total_rows: None,
    };

    let Some(sheet) = workbook.sheet_names().first().cloned() else {
        return Ok(empty);
    };
    let range = workbook
        .worksheet_range(&sheet)
        .with_context(|| format!("reading sheet {sheet}"))?;

    let mut rows = range.rows();
    let Some(header_row) = rows.next() else {
        return Ok(empty);
    };
    let headers = header_names(header_row);

    let data = rows
        .filter(|row| row.iter().any(|c| !matches!(c, Data::Empty)))
        .map(|row| {
            headers
                .iter()
                .enumerate()
                .map(|(i, name)| (name.clone(), row.get(i).map(cell_value).unwrap_or(Value::Null)))
                .collect::<Map<String, Value>>()
        })
        .collect();

    Ok(ParsedPayload::Table {
        data,
        truncated: None,
        total_rows: None,
    })
}

fn header_names(row: &[Data]) -> Vec<String> {
    let mut blanks = 0;
    row.iter()
        .map(|cell| match cell {
            Data::Empty => {
                let name = if blanks == 0 {
                    "__EMPTY".to_string()
                } else {
                    format!("__EMPTY_{blanks}")
                };
                blanks += 1;
                name
            }
            other => other.to_string(),
        })
        .collect()
}

fn cell_value(cell: &Data) -> Value {
    match cell {
        Data::Empty => Value::Null,
        Data::Int(i) => Value::Number((*i).into()),
        Data::Float(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
        Data::Bool(b) => Value::Bool(*b),
        Data::String(s) => Value::String(s.clone()),
        Data::DateTime(dt) => Number::from_f64(dt.as_f64())
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Data::DateTimeIso(s) | Data::DurationIso(s) => Value::String(s.clone()),
        Data::Error(e) => Value::String(e.to_string()),
    }
}

/// Extracted text, or empty text if the document cannot be read.
pub async fn parse_pdf(bytes: Vec<u8>) -> ParsedPayload {
    // pdf-extract can panic on malformed input; a panicked blocking task
    // surfaces as a JoinError here.
    let text = tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes).ok())
        .await
        .ok()
        .flatten()
        .unwrap_or_default();
    ParsedPayload::Text { text }
}
