//! Spreadsheet sink contract and the Google Sheets v4 implementation.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{FetchError, HttpFetcher, HttpRequest};

pub const GOOGLE_SHEETS_API: &str = "https://sheets.googleapis.com/v4/spreadsheets";

/// 1-based cell address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellRef {
    pub row: u32,
    pub col: u32,
}

impl CellRef {
    pub fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }

    /// Parse an A1 reference such as `B1` or `AA12`.
    pub fn parse_a1(a1: &str) -> Option<Self> {
        let a1 = a1.trim();
        let split = a1.find(|c: char| c.is_ascii_digit())?;
        let (letters, digits) = a1.split_at(split);
        if letters.is_empty() || !letters.chars().all(|c| c.is_ascii_alphabetic()) {
            return None;
        }
        let col = letters
            .to_ascii_uppercase()
            .bytes()
            .try_fold(0u32, |acc, b| acc.checked_mul(26)?.checked_add(u32::from(b - b'A') + 1))?;
        let row = digits.parse::<u32>().ok().filter(|r| *r > 0)?;
        Some(Self { row, col })
    }
}

impl fmt::Display for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", column_letters(self.col), self.row)
    }
}

/// Column letters for a 1-based column index (`1 -> A`, `27 -> AA`).
pub fn column_letters(col: u32) -> String {
    let mut n = col.max(1);
    let mut out = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        out.push(char::from(b'A' + rem as u8));
        n = (n - 1) / 26;
    }
    out.iter().rev().collect()
}

/// Value written to a cell. Requests use `USER_ENTERED` so formulas evaluate;
/// text is sent with a leading apostrophe so codes like `0110` or `10-12`
/// stay literal instead of turning into numbers or dates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellValue {
    Empty,
    Text(String),
    Number(i64),
    Formula(String),
}

impl CellValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn count(value: usize) -> Self {
        Self::Number(i64::try_from(value).unwrap_or(i64::MAX))
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Empty => JsonValue::String(String::new()),
            Self::Text(s) if s.is_empty() => JsonValue::String(String::new()),
            Self::Text(s) => JsonValue::String(format!("'{s}")),
            Self::Formula(s) => JsonValue::String(s.clone()),
            Self::Number(n) => JsonValue::from(*n),
        }
    }

    /// Rendering used when reading values back.
    pub fn display(&self) -> String {
        match self {
            Self::Empty => String::new(),
            Self::Text(s) | Self::Formula(s) => s.clone(),
            Self::Number(n) => n.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellUpdate {
    pub cell: CellRef,
    pub value: CellValue,
}

impl CellUpdate {
    pub fn new(row: u32, col: u32, value: CellValue) -> Self {
        Self {
            cell: CellRef::new(row, col),
            value,
        }
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("spreadsheet credentials expired or were rejected: {0}")]
    AuthExpired(String),
    #[error("worksheet unavailable: {0}")]
    WorksheetUnavailable(String),
    #[error("spreadsheet api returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("spreadsheet request failed: {0}")]
    Request(#[source] FetchError),
    #[error("unexpected spreadsheet response: {0}")]
    Protocol(String),
}

impl SinkError {
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::AuthExpired(_))
    }
}

impl From<FetchError> for SinkError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::HttpStatus { status: 401, body, .. } => Self::AuthExpired(body),
            FetchError::HttpStatus { status, body, .. }
                if body.contains("invalid_grant") || body.contains("expired") =>
            {
                if status == 400 || status == 403 {
                    Self::AuthExpired(body)
                } else {
                    Self::Api { status, message: body }
                }
            }
            FetchError::HttpStatus { status, body, .. } => Self::Api { status, message: body },
            FetchError::Decode { url, source } => Self::Protocol(format!("{url}: {source}")),
            other => Self::Request(other),
        }
    }
}

/// A tabular store holding the inventory worksheet.
///
/// Rows and columns are 1-based. Writes address cells directly; nothing here
/// deletes rows.
#[async_trait]
pub trait SheetSink: Send + Sync {
    /// Locate the worksheet, creating it with the given grid size when missing.
    async fn ensure_worksheet(&self, title: &str, rows: u32, cols: u32) -> Result<(), SinkError>;

    /// Rendered values from `first_row` down to the last non-empty row, at most
    /// `cols` columns wide. Trailing empty cells may be omitted.
    async fn read_rows(&self, title: &str, first_row: u32, cols: u32) -> Result<Vec<Vec<String>>, SinkError>;

    /// Write a rectangular block whose top-left cell is `origin`.
    async fn write_block(&self, title: &str, origin: CellRef, rows: &[Vec<CellValue>]) -> Result<(), SinkError>;

    /// Write individual cells in one request.
    async fn write_cells(&self, title: &str, cells: &[CellUpdate]) -> Result<(), SinkError>;

    /// Grow the worksheet grid so it holds at least `rows` rows.
    async fn ensure_rows(&self, _title: &str, _rows: u32) -> Result<(), SinkError> {
        Ok(())
    }

    /// Obtain fresh credentials after an [`SinkError::AuthExpired`].
    async fn refresh_auth(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> Result<String, SinkError>;

    async fn refresh(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

#[async_trait]
impl TokenSource for StaticToken {
    async fn token(&self) -> Result<String, SinkError> {
        Ok(self.0.clone())
    }
}

/// Bearer token kept in a file maintained by an external helper. Refreshing
/// drops the cached copy so the next call rereads the file.
#[derive(Debug)]
pub struct FileToken {
    path: PathBuf,
    cached: Mutex<Option<String>>,
}

impl FileToken {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: Mutex::new(None),
        }
    }
}

#[async_trait]
impl TokenSource for FileToken {
    async fn token(&self) -> Result<String, SinkError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            SinkError::AuthExpired(format!("reading token file {}: {e}", self.path.display()))
        })?;
        let token = raw.trim().to_string();
        if token.is_empty() {
            return Err(SinkError::AuthExpired(format!(
                "token file {} is empty",
                self.path.display()
            )));
        }
        *cached = Some(token.clone());
        Ok(token)
    }

    async fn refresh(&self) -> Result<(), SinkError> {
        self.cached.lock().await.take();
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct SpreadsheetMeta {
    #[serde(default)]
    sheets: Vec<SheetMeta>,
}

#[derive(Debug, Deserialize)]
struct SheetMeta {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SheetProperties {
    #[serde(default)]
    sheet_id: u64,
    title: String,
    #[serde(default)]
    grid_properties: GridProperties,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GridProperties {
    #[serde(default)]
    row_count: u32,
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<JsonValue>>,
}

/// Google Sheets v4 REST sink addressed by spreadsheet id.
pub struct GoogleSheetsSink {
    http: Arc<HttpFetcher>,
    run_id: Uuid,
    base_url: String,
    spreadsheet_id: String,
    tokens: Box<dyn TokenSource>,
}

impl GoogleSheetsSink {
    pub fn new(
        http: Arc<HttpFetcher>,
        run_id: Uuid,
        spreadsheet_id: impl Into<String>,
        tokens: Box<dyn TokenSource>,
    ) -> Self {
        Self {
            http,
            run_id,
            base_url: GOOGLE_SHEETS_API.to_string(),
            spreadsheet_id: spreadsheet_id.into(),
            tokens,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// `'<title>'!<range>` with embedded quotes doubled.
    pub fn a1_range(title: &str, range: &str) -> String {
        format!("'{}'!{}", title.replace('\'', "''"), range)
    }

    /// Body for a `values` PUT of a rectangular block.
    pub fn block_body(range: &str, rows: &[Vec<CellValue>]) -> JsonValue {
        json!({
            "range": range,
            "majorDimension": "ROWS",
            "values": rows
                .iter()
                .map(|row| row.iter().map(CellValue::to_json).collect::<Vec<_>>())
                .collect::<Vec<_>>(),
        })
    }

    /// Body for `values:batchUpdate` with one range per cell.
    pub fn cells_body(title: &str, cells: &[CellUpdate]) -> JsonValue {
        let data = cells
            .iter()
            .map(|update| {
                json!({
                    "range": Self::a1_range(title, &update.cell.to_string()),
                    "values": [[update.value.to_json()]],
                })
            })
            .collect::<Vec<_>>();
        json!({ "valueInputOption": "USER_ENTERED", "data": data })
    }

    /// `appendDimension` request adding the rows missing below `row_count`,
    /// or `None` when the grid is already tall enough.
    pub fn grow_rows_body(sheet_id: u64, row_count: u32, rows: u32) -> Option<JsonValue> {
        let missing = rows.checked_sub(row_count).filter(|n| *n > 0)?;
        Some(json!({
            "requests": [{
                "appendDimension": {
                    "sheetId": sheet_id,
                    "dimension": "ROWS",
                    "length": missing
                }
            }]
        }))
    }

    async fn metadata(&self, fields: &str) -> Result<SpreadsheetMeta, SinkError> {
        let url = self.endpoint(&[], &[("fields", fields)])?;
        let body = self
            .execute(HttpRequest::get(&url))
            .await
            .map_err(|e| match e {
                SinkError::Api { status: 404, message } => SinkError::WorksheetUnavailable(message),
                other => other,
            })?;
        serde_json::from_slice(&body).map_err(|e| SinkError::Protocol(format!("spreadsheet metadata: {e}")))
    }

    pub(crate) fn endpoint(&self, segments: &[&str], query: &[(&str, &str)]) -> Result<String, SinkError> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| SinkError::Protocol(format!("invalid base url {}: {e}", self.base_url)))?;
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| SinkError::Protocol(format!("base url {} cannot hold a path", self.base_url)))?;
            path.pop_if_empty();
            path.push(&self.spreadsheet_id);
            for segment in segments {
                path.push(segment);
            }
        }
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url.to_string())
    }

    async fn execute(&self, request: HttpRequest<'_>) -> Result<Vec<u8>, SinkError> {
        let token = self.tokens.token().await?;
        let response = self
            .http
            .send(self.run_id, "sheets", &request.bearer(&token))
            .await?;
        Ok(response.body)
    }
}

#[async_trait]
impl SheetSink for GoogleSheetsSink {
    async fn ensure_worksheet(&self, title: &str, rows: u32, cols: u32) -> Result<(), SinkError> {
        let meta = self.metadata("sheets.properties.title").await?;

        if meta.sheets.iter().any(|s| s.properties.title == title) {
            debug!(title, "found existing worksheet");
            return Ok(());
        }

        info!(title, rows, cols, "worksheet not found, creating it");
        let url = self.endpoint(&[], &[])?;
        let url = format!("{url}:batchUpdate");
        let request = json!({
            "requests": [{
                "addSheet": {
                    "properties": {
                        "title": title,
                        "gridProperties": { "rowCount": rows, "columnCount": cols }
                    }
                }
            }]
        });
        self.execute(HttpRequest::post_json(&url, &request))
            .await
            .map_err(|e| match e {
                SinkError::Api { message, .. } => SinkError::WorksheetUnavailable(message),
                other => other,
            })?;
        Ok(())
    }

    async fn read_rows(&self, title: &str, first_row: u32, cols: u32) -> Result<Vec<Vec<String>>, SinkError> {
        let range = Self::a1_range(title, &format!("A{first_row}:{}", column_letters(cols)));
        let url = self.endpoint(&["values", &range], &[("majorDimension", "ROWS")])?;
        let body = self.execute(HttpRequest::get(&url)).await?;
        let values: ValueRange = serde_json::from_slice(&body)
            .map_err(|e| SinkError::Protocol(format!("value range {range}: {e}")))?;
        Ok(values
            .values
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .map(|cell| match cell {
                        JsonValue::String(s) => s,
                        JsonValue::Null => String::new(),
                        other => other.to_string(),
                    })
                    .collect()
            })
            .collect())
    }

    async fn write_block(&self, title: &str, origin: CellRef, rows: &[Vec<CellValue>]) -> Result<(), SinkError> {
        if rows.is_empty() {
            return Ok(());
        }
        let range = Self::a1_range(title, &origin.to_string());
        let url = self.endpoint(&["values", &range], &[("valueInputOption", "USER_ENTERED")])?;
        let body = Self::block_body(&range, rows);
        self.execute(HttpRequest::put_json(&url, &body)).await?;
        Ok(())
    }

    async fn write_cells(&self, title: &str, cells: &[CellUpdate]) -> Result<(), SinkError> {
        if cells.is_empty() {
            return Ok(());
        }
        let url = self.endpoint(&["values:batchUpdate"], &[])?;
        let body = Self::cells_body(title, cells);
        self.execute(HttpRequest::post_json(&url, &body)).await?;
        Ok(())
    }

    async fn ensure_rows(&self, title: &str, rows: u32) -> Result<(), SinkError> {
        let meta = self
            .metadata("sheets.properties(sheetId,title,gridProperties.rowCount)")
            .await?;
        let properties = meta
            .sheets
            .iter()
            .map(|s| &s.properties)
            .find(|p| p.title == title)
            .ok_or_else(|| SinkError::WorksheetUnavailable(title.to_string()))?;
        let row_count = properties.grid_properties.row_count;
        let Some(request) = Self::grow_rows_body(properties.sheet_id, row_count, rows) else {
            return Ok(());
        };
        info!(title, row_count, rows, "growing worksheet grid");
        let url = format!("{}:batchUpdate", self.endpoint(&[], &[])?);
        self.execute(HttpRequest::post_json(&url, &request)).await?;
        Ok(())
    }

    async fn refresh_auth(&self) -> Result<(), SinkError> {
        self.tokens.refresh().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HttpClientConfig;

    #[test]
    fn column_letters_roll_over_after_z() {
        assert_eq!(column_letters(1), "A");
        assert_eq!(column_letters(8), "H");
        assert_eq!(column_letters(26), "Z");
        assert_eq!(column_letters(27), "AA");
        assert_eq!(column_letters(703), "AAA");
    }

    #[test]
    fn a1_references_parse_and_print() {
        let cell = CellRef::parse_a1("b1").unwrap();
        assert_eq!(cell, CellRef::new(1, 2));
        assert_eq!(cell.to_string(), "B1");
        assert_eq!(CellRef::parse_a1("AA12"), Some(CellRef::new(12, 27)));
        assert_eq!(CellRef::parse_a1("12"), None);
        assert_eq!(CellRef::parse_a1("A0"), None);
    }

    #[test]
    fn expired_credentials_are_classified_for_retry() {
        let unauthorized = FetchError::HttpStatus {
            status: 401,
            url: "u".into(),
            body: "nope".into(),
        };
        assert!(SinkError::from(unauthorized).is_auth_expired());

        let grant = FetchError::HttpStatus {
            status: 400,
            url: "u".into(),
            body: "{\"error\":\"invalid_grant\"}".into(),
        };
        assert!(SinkError::from(grant).is_auth_expired());

        let quota = FetchError::HttpStatus {
            status: 500,
            url: "u".into(),
            body: "backend".into(),
        };
        assert!(!SinkError::from(quota).is_auth_expired());
    }

    #[test]
    fn endpoints_escape_sheet_ranges() {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let sink = GoogleSheetsSink::new(http, Uuid::nil(), "sheet123", Box::new(StaticToken("t".into())));
        let range = GoogleSheetsSink::a1_range("Inventory Q1", "A5:H");
        assert_eq!(range, "'Inventory Q1'!A5:H");
        let url = sink.endpoint(&["values", &range], &[("majorDimension", "ROWS")]).unwrap();
        assert!(url.starts_with("https://sheets.googleapis.com/v4/spreadsheets/sheet123/values/"));
        assert!(!url.contains(' '));
        assert!(url.ends_with("?majorDimension=ROWS"));

        let local = sink.with_base_url("http://127.0.0.1:8080/v4/spreadsheets/");
        let url = local.endpoint(&["values:batchUpdate"], &[]).unwrap();
        assert_eq!(url, "http://127.0.0.1:8080/v4/spreadsheets/sheet123/values:batchUpdate");
    }

    #[test]
    fn text_cells_are_sent_as_literals() {
        let block = GoogleSheetsSink::block_body(
            "'Inventory'!A6",
            &[vec![
                CellValue::text("Threshold plate"),
                CellValue::text("0110"),
                CellValue::Empty,
                CellValue::Empty,
                CellValue::count(2),
                CellValue::text("10-12"),
            ]],
        );
        assert_eq!(block["values"][0][0], "'Threshold plate");
        assert_eq!(block["values"][0][1], "'0110");
        assert_eq!(block["values"][0][2], "");
        assert_eq!(block["values"][0][4], 2);
        assert_eq!(block["values"][0][5], "'10-12");

        let cells = GoogleSheetsSink::cells_body(
            "Inventory",
            &[
                CellUpdate::new(6, 3, CellValue::text("")),
                CellUpdate::new(6, 7, CellValue::Formula("=E6+F6".to_string())),
            ],
        );
        assert_eq!(cells["valueInputOption"], "USER_ENTERED");
        assert_eq!(cells["data"][0]["range"], "'Inventory'!C6");
        assert_eq!(cells["data"][0]["values"][0][0], "");
        assert_eq!(cells["data"][1]["values"][0][0], "=E6+F6");
    }

    #[test]
    fn grid_grows_only_when_rows_are_missing() {
        assert_eq!(GoogleSheetsSink::grow_rows_body(7, 1000, 1000), None);
        assert_eq!(GoogleSheetsSink::grow_rows_body(7, 1000, 12), None);
        let request = GoogleSheetsSink::grow_rows_body(7, 1000, 1003).unwrap();
        let append = &request["requests"][0]["appendDimension"];
        assert_eq!(append["sheetId"], 7);
        assert_eq!(append["dimension"], "ROWS");
        assert_eq!(append["length"], 3);
    }

    #[test]
    fn metadata_reads_grid_size() {
        let meta: SpreadsheetMeta = serde_json::from_str(
            r#"{"sheets":[{"properties":{"sheetId":42,"title":"Inventory","gridProperties":{"rowCount":1000}}}]}"#,
        )
        .unwrap();
        let properties = &meta.sheets[0].properties;
        assert_eq!(properties.sheet_id, 42);
        assert_eq!(properties.grid_properties.row_count, 1000);

        let bare: SpreadsheetMeta =
            serde_json::from_str(r#"{"sheets":[{"properties":{"title":"Inventory"}}]}"#).unwrap();
        assert_eq!(bare.sheets[0].properties.grid_properties.row_count, 0);
    }

    #[tokio::test]
    async fn file_token_rereads_after_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "first\n").unwrap();
        let tokens = FileToken::new(&path);
        assert_eq!(tokens.token().await.unwrap(), "first");

        std::fs::write(&path, "second").unwrap();
        assert_eq!(tokens.token().await.unwrap(), "first");
        tokens.refresh().await.unwrap();
        assert_eq!(tokens.token().await.unwrap(), "second");
    }
}
