//! Upstream source adapters: Jobber GraphQL pages, fixture replay, and the
//! product catalog CSV.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use invsync_core::{LineItemRecord, SourceKind};
use invsync_storage::{ArtifactStore, FetchError, HttpFetcher, HttpRequest};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

mod catalog;
mod classify;

pub use catalog::{load_catalog_csv, parse_catalog, CatalogImport};
pub use classify::{classify_line_item, extract_observations, is_name_sku, strip_sku_token};

pub const DEFAULT_JOBBER_GRAPHQL_URL: &str = "https://api.getjobber.com/api/graphql";
pub const DEFAULT_JOBBER_TOKEN_URL: &str = "https://api.getjobber.com/api/oauth/token";
pub const DEFAULT_JOBBER_API_VERSION: &str = "2023-08-18";

pub const JOBS_QUERY: &str = r#"query Jobs($limit: Int!, $after: String) {
  jobs(first: $limit, after: $after) {
    nodes {
      id
      jobNumber
      title
      lineItems(first: 50) {
        nodes {
          name
          description
          category
          linkedProductOrService { name description category }
        }
      }
    }
    pageInfo { endCursor hasNextPage }
  }
}"#;

pub const QUOTES_QUERY: &str = r#"query Quotes($limit: Int!, $after: String) {
  quotes(first: $limit, after: $after) {
    nodes {
      id
      quoteNumber
      title
      lineItems(first: 50) {
        nodes {
          name
          description
          linkedProductOrService { name description category }
        }
      }
    }
    pageInfo { endCursor hasNextPage }
  }
}"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub source: SourceKind,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed page: {0}")]
    Protocol(String),
    #[error("graphql errors: {}", .0.join("; "))]
    GraphQl(Vec<String>),
    #[error("query throttled ({} requested, {} available)", .0.requested, .0.currently_available)]
    Throttled(QueryCost),
    #[error("catalog csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A paginated collection of jobs or quotes.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_kind(&self) -> SourceKind;

    async fn fetch_page(&self, ctx: &AdapterContext, after: Option<&str>) -> Result<FetchedPage, AdapterError>;

    fn parse_page(&self, page: &FetchedPage) -> Result<RecordPage, AdapterError> {
        let body: JsonValue = serde_json::from_slice(&page.body)
            .map_err(|e| AdapterError::Protocol(format!("{} page is not json: {e}", page.source)))?;
        parse_record_page(self.source_kind(), &body)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Connection<T> {
    #[serde(default)]
    pub nodes: Vec<T>,
}

/// One job or quote with its line items.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRecord {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, alias = "jobNumber", alias = "quoteNumber")]
    pub number: Option<i64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub line_items: Option<Connection<LineItemRecord>>,
}

impl SourceRecord {
    pub fn line_items(&self) -> &[LineItemRecord] {
        self.line_items.as_ref().map(|c| c.nodes.as_slice()).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    #[serde(default)]
    end_cursor: Option<String>,
    #[serde(default)]
    has_next_page: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RecordPage {
    pub records: Vec<SourceRecord>,
    pub end_cursor: Option<String>,
    pub has_next_page: bool,
    pub cost: Option<QueryCost>,
}

impl RecordPage {
    /// Cursor for the next request, or `None` when the sweep is complete.
    pub fn next_cursor(&self) -> Option<&str> {
        self.has_next_page.then_some(self.end_cursor.as_deref()).flatten()
    }
}

pub fn connection_field(kind: SourceKind) -> &'static str {
    match kind {
        SourceKind::Jobs => "jobs",
        SourceKind::Quotes => "quotes",
    }
}

pub fn query_for(kind: SourceKind) -> &'static str {
    match kind {
        SourceKind::Jobs => JOBS_QUERY,
        SourceKind::Quotes => QUOTES_QUERY,
    }
}

/// Decode `{"data": {"<jobs|quotes>": {"nodes": [...], "pageInfo": {...}}}}`.
pub fn parse_record_page(kind: SourceKind, body: &JsonValue) -> Result<RecordPage, AdapterError> {
    let cost = QueryCost::from_response(body);

    if let Some(cost) = cost.as_ref().filter(|c| c.throttled) {
        return Err(AdapterError::Throttled(cost.clone()));
    }

    if let Some(errors) = body.get("errors").and_then(JsonValue::as_array) {
        if !errors.is_empty() {
            let messages = errors
                .iter()
                .map(|e| {
                    e.get("message")
                        .and_then(JsonValue::as_str)
                        .unwrap_or("unknown graphql error")
                        .to_string()
                })
                .collect();
            return Err(AdapterError::GraphQl(messages));
        }
    }

    let field = connection_field(kind);
    let connection = body
        .get("data")
        .and_then(|d| d.get(field))
        .filter(|c| !c.is_null())
        .ok_or_else(|| AdapterError::Protocol(format!("response has no data.{field}")))?;
    let nodes = connection
        .get("nodes")
        .cloned()
        .ok_or_else(|| AdapterError::Protocol(format!("data.{field} has no nodes")))?;
    let records: Vec<SourceRecord> = serde_json::from_value(nodes)
        .map_err(|e| AdapterError::Protocol(format!("data.{field}.nodes: {e}")))?;
    let page_info: PageInfo = connection
        .get("pageInfo")
        .cloned()
        .ok_or_else(|| AdapterError::Protocol(format!("data.{field} has no pageInfo")))
        .and_then(|v| {
            serde_json::from_value(v)
                .map_err(|e| AdapterError::Protocol(format!("data.{field}.pageInfo: {e}")))
        })?;

    if page_info.has_next_page && page_info.end_cursor.is_none() {
        return Err(AdapterError::Protocol(format!(
            "data.{field}.pageInfo has a next page but no endCursor"
        )));
    }

    Ok(RecordPage {
        records,
        end_cursor: page_info.end_cursor,
        has_next_page: page_info.has_next_page,
        cost,
    })
}

/// Rate-limit accounting reported in `extensions.cost`.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryCost {
    pub requested: f64,
    pub actual: Option<f64>,
    pub maximum_available: f64,
    pub currently_available: f64,
    pub restore_rate: f64,
    pub throttled: bool,
}

impl QueryCost {
    pub fn from_response(body: &JsonValue) -> Option<Self> {
        let cost = body.get("extensions")?.get("cost")?;
        let status = cost.get("throttleStatus")?;
        let number = |v: &JsonValue, key: &str| v.get(key).and_then(JsonValue::as_f64);
        let throttled = body
            .get("errors")
            .and_then(JsonValue::as_array)
            .is_some_and(|errors| {
                errors.iter().any(|e| {
                    e.get("extensions")
                        .and_then(|x| x.get("code"))
                        .and_then(JsonValue::as_str)
                        == Some("THROTTLED")
                })
            });
        Some(Self {
            requested: number(cost, "requestedQueryCost")?,
            actual: number(cost, "actualQueryCost"),
            maximum_available: number(status, "maximumAvailable")?,
            currently_available: number(status, "currentlyAvailable")?,
            restore_rate: number(status, "restoreRate").unwrap_or_default(),
            throttled,
        })
    }

    /// Share of the cost bucket in use, rounded to two decimals.
    pub fn percentage_used(&self) -> f64 {
        if self.maximum_available <= 0.0 {
            return 0.0;
        }
        let used = (self.maximum_available - self.currently_available) / self.maximum_available * 100.0;
        (used * 100.0).round() / 100.0
    }

    /// Time until enough budget is restored to rerun the query.
    pub fn suggested_wait(&self) -> Option<Duration> {
        let shortfall = self.requested - self.currently_available;
        (shortfall > 0.0 && self.restore_rate > 0.0)
            .then(|| Duration::from_secs_f64(shortfall / self.restore_rate))
    }

    pub fn log(&self, source: SourceKind) {
        if self.throttled {
            warn!(
                %source,
                requested = self.requested,
                available = self.currently_available,
                wait_secs = self.suggested_wait().map(|d| d.as_secs_f64()),
                "query throttled"
            );
        } else {
            info!(
                %source,
                requested = self.requested,
                actual = self.actual,
                available = self.currently_available,
                used_pct = self.percentage_used(),
                "query cost"
            );
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobberConfig {
    pub graphql_url: String,
    pub api_version: String,
    pub page_size: u32,
}

impl Default for JobberConfig {
    fn default() -> Self {
        Self {
            graphql_url: DEFAULT_JOBBER_GRAPHQL_URL.to_string(),
            api_version: DEFAULT_JOBBER_API_VERSION.to_string(),
            page_size: 5,
        }
    }
}

/// Live GraphQL adapter for one Jobber collection.
pub struct JobberAdapter {
    kind: SourceKind,
    http: Arc<HttpFetcher>,
    config: JobberConfig,
    access_token: String,
    archive: Option<ArtifactStore>,
}

impl JobberAdapter {
    pub fn new(kind: SourceKind, http: Arc<HttpFetcher>, config: JobberConfig, access_token: impl Into<String>) -> Self {
        Self {
            kind,
            http,
            config,
            access_token: access_token.into(),
            archive: None,
        }
    }

    /// Keep a copy of every raw page under `store`.
    pub fn with_archive(mut self, store: ArtifactStore) -> Self {
        self.archive = Some(store);
        self
    }

    fn request_body(&self, after: Option<&str>) -> JsonValue {
        json!({
            "query": query_for(self.kind),
            "variables": { "limit": self.config.page_size, "after": after },
        })
    }
}

#[async_trait]
impl SourceAdapter for JobberAdapter {
    fn source_kind(&self) -> SourceKind {
        self.kind
    }

    async fn fetch_page(&self, ctx: &AdapterContext, after: Option<&str>) -> Result<FetchedPage, AdapterError> {
        let body = self.request_body(after);
        let request = HttpRequest::post_json(&self.config.graphql_url, &body)
            .bearer(&self.access_token)
            .header("X-JOBBER-GRAPHQL-VERSION", self.config.api_version.clone());
        let response = self.http.send(ctx.run_id, self.kind.as_str(), &request).await?;
        let fetched_at = Utc::now();

        if let Some(store) = &self.archive {
            match store
                .store_page(fetched_at, self.kind.as_str(), "json", &response.body)
                .await
            {
                Ok(stored) => debug!(
                    path = %stored.relative_path.display(),
                    deduplicated = stored.deduplicated,
                    "archived raw page"
                ),
                Err(err) => warn!(error = %err, "failed to archive raw page"),
            }
        }

        Ok(FetchedPage {
            source: self.kind,
            body: response.body,
            fetched_at,
        })
    }
}

/// Replays captured GraphQL pages from disk or memory. Cursors are resolved
/// through each page's own `pageInfo.endCursor`.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    kind: SourceKind,
    pages: Vec<Vec<u8>>,
    cursor_to_page: HashMap<String, usize>,
}

impl FixtureSource {
    pub fn from_pages(kind: SourceKind, pages: Vec<Vec<u8>>) -> Result<Self> {
        let mut cursor_to_page = HashMap::new();
        for (idx, page) in pages.iter().enumerate() {
            let body: JsonValue =
                serde_json::from_slice(page).with_context(|| format!("fixture page {idx} is not json"))?;
            let cursor = body
                .pointer(&format!("/data/{}/pageInfo/endCursor", connection_field(kind)))
                .and_then(JsonValue::as_str);
            if let Some(cursor) = cursor {
                cursor_to_page.insert(cursor.to_string(), idx + 1);
            }
        }
        Ok(Self {
            kind,
            pages,
            cursor_to_page,
        })
    }

    pub fn from_json(kind: SourceKind, pages: &[JsonValue]) -> Result<Self> {
        let bytes = pages
            .iter()
            .map(serde_json::to_vec)
            .collect::<Result<Vec<_>, _>>()
            .context("serializing fixture pages")?;
        Self::from_pages(kind, bytes)
    }

    /// Load `<dir>/*.json` in file-name order.
    pub fn from_dir(kind: SourceKind, dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut paths = fs::read_dir(dir)
            .with_context(|| format!("reading fixture directory {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect::<Vec<_>>();
        paths.sort();

        let pages = paths
            .iter()
            .map(|p| fs::read(p).with_context(|| format!("reading fixture page {}", p.display())))
            .collect::<Result<Vec<_>>>()?;
        Self::from_pages(kind, pages)
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

#[async_trait]
impl SourceAdapter for FixtureSource {
    fn source_kind(&self) -> SourceKind {
        self.kind
    }

    async fn fetch_page(&self, ctx: &AdapterContext, after: Option<&str>) -> Result<FetchedPage, AdapterError> {
        let idx = match after {
            None => 0,
            Some(cursor) => *self
                .cursor_to_page
                .get(cursor)
                .ok_or_else(|| AdapterError::Protocol(format!("unknown fixture cursor {cursor}")))?,
        };
        let body = self
            .pages
            .get(idx)
            .cloned()
            .ok_or_else(|| AdapterError::Protocol(format!("no fixture page {idx} for {}", self.kind)))?;
        Ok(FetchedPage {
            source: self.kind,
            body,
            fetched_at: ctx.fetched_at,
        })
    }
}
