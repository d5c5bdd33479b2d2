//! Inventory sync orchestration: source sweeps, reconciliation, ledger flush
//! and run reports.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, Utc};
use invsync_adapters::{
    extract_observations, load_catalog_csv, AdapterContext, AdapterError, JobberAdapter, JobberConfig,
    SourceAdapter, DEFAULT_JOBBER_API_VERSION, DEFAULT_JOBBER_GRAPHQL_URL, DEFAULT_JOBBER_TOKEN_URL,
};
use invsync_core::{CombinedEntry, InventoryObservation, SourceKind, Vocabulary};
use invsync_storage::{
    ArtifactStore, FileToken, GoogleSheetsSink, HttpClientConfig, HttpFetcher, RefreshTokenGrant,
    SheetSink, StaticToken, TokenSource,
};
use serde::Serialize;
use tokio::fs;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

mod ledger;
mod reconcile;

pub use ledger::{
    available_formula, format_timestamp, index_ledger_rows, plan_reconciliation, total_allocated_formula,
    LedgerColumn, LedgerOutcome, LedgerRow, RetryPolicy, SheetLayout, SheetSyncEngine, SyncMode, SyncPhase,
    SyncPlan, LEDGER_HEADERS,
};
pub use reconcile::{aggregate, merge};

#[derive(Debug, Clone)]
pub struct JobberCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub jobber: Option<JobberCredentials>,
    pub jobber_api_version: String,
    pub jobber_graphql_url: String,
    pub jobber_token_url: String,
    pub page_size: u32,
    pub page_pause: Duration,
    pub sheets_id: Option<String>,
    pub sheets_token_file: Option<PathBuf>,
    pub sheets_access_token: Option<String>,
    pub sheet_name: String,
    pub header_row: u32,
    pub write_batch_size: usize,
    pub write_pause: Duration,
    pub catalog_csv: PathBuf,
    pub catalog_detect_sku: bool,
    pub raw_pages_dir: Option<PathBuf>,
    pub reports_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_string(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let jobber = match (
            env_string("JOBBER_CLIENT_ID"),
            env_string("JOBBER_CLIENT_SECRET"),
            env_string("JOBBER_REFRESH_TOKEN"),
        ) {
            (Some(client_id), Some(client_secret), Some(refresh_token)) => Some(JobberCredentials {
                client_id,
                client_secret,
                refresh_token,
            }),
            _ => None,
        };

        Self {
            jobber,
            jobber_api_version: env_string("JOBBER_API_VERSION")
                .unwrap_or_else(|| DEFAULT_JOBBER_API_VERSION.to_string()),
            jobber_graphql_url: env_string("JOBBER_GRAPHQL_URL")
                .unwrap_or_else(|| DEFAULT_JOBBER_GRAPHQL_URL.to_string()),
            jobber_token_url: env_string("JOBBER_TOKEN_URL")
                .unwrap_or_else(|| DEFAULT_JOBBER_TOKEN_URL.to_string()),
            page_size: env_parse("INVSYNC_PAGE_SIZE", 5),
            page_pause: Duration::from_millis(env_parse("INVSYNC_PAGE_PAUSE_MS", 1000)),
            sheets_id: env_string("GOOGLE_SHEETS_ID"),
            sheets_token_file: env_string("GOOGLE_SHEETS_TOKEN_FILE").map(PathBuf::from),
            sheets_access_token: env_string("GOOGLE_SHEETS_ACCESS_TOKEN"),
            sheet_name: env_string("INVSYNC_SHEET_NAME").unwrap_or_else(|| "Inventory".to_string()),
            header_row: env_parse("INVSYNC_HEADER_ROW", 5u32).max(1),
            write_batch_size: env_parse("INVSYNC_WRITE_BATCH_SIZE", 100usize).max(1),
            write_pause: Duration::from_millis(env_parse("INVSYNC_WRITE_PAUSE_MS", 500)),
            catalog_csv: env_string("INVSYNC_CATALOG_CSV")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("catalog.csv")),
            catalog_detect_sku: env_string("INVSYNC_CATALOG_DETECT_SKU")
                .map(|v| !matches!(v.to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off"))
                .unwrap_or(true),
            raw_pages_dir: env_string("INVSYNC_RAW_PAGES_DIR").map(PathBuf::from),
            reports_dir: env_string("INVSYNC_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./reports")),
            workspace_root: env_string("INVSYNC_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            http_timeout_secs: env_parse("INVSYNC_HTTP_TIMEOUT_SECS", 20),
            user_agent: env_string("INVSYNC_USER_AGENT")
                .unwrap_or_else(|| format!("invsync/{}", env!("CARGO_PKG_VERSION"))),
        }
    }

    pub fn layout(&self) -> SheetLayout {
        SheetLayout {
            worksheet_title: self.sheet_name.clone(),
            header_row: self.header_row,
            ..SheetLayout::default()
        }
    }

    pub fn engine(&self) -> SheetSyncEngine {
        SheetSyncEngine::new(self.layout()).with_batching(self.write_batch_size, self.write_pause)
    }

    pub fn jobber_config(&self) -> JobberConfig {
        JobberConfig {
            graphql_url: self.jobber_graphql_url.clone(),
            api_version: self.jobber_api_version.clone(),
            page_size: self.page_size,
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }
}

/// `rules/vocabulary.yaml` under the workspace root, or the built-in lists
/// when the file does not exist. Missing keys fall back per list.
pub fn load_vocabulary(workspace_root: &Path) -> Result<Vocabulary> {
    let path = workspace_root.join("rules").join("vocabulary.yaml");
    if !path.exists() {
        debug!(path = %path.display(), "no vocabulary override");
        return Ok(Vocabulary::default());
    }
    let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Seed ledger rows from the catalog CSV.
    Catalog,
    /// Reconcile counts from quotes and jobs.
    Activity,
    /// Catalog seed followed by the activity reconcile.
    Both,
}

impl RunMode {
    pub fn includes_catalog(self) -> bool {
        matches!(self, Self::Catalog | Self::Both)
    }

    pub fn includes_activity(self) -> bool {
        matches!(self, Self::Activity | Self::Both)
    }
}

/// Everything collected from one full pagination sweep.
#[derive(Debug, Clone)]
pub struct SourceSweep {
    pub source: SourceKind,
    pub pages: usize,
    pub records: usize,
    pub observations: Vec<InventoryObservation>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceStats {
    pub source: SourceKind,
    pub pages: usize,
    pub records: usize,
    pub observations: usize,
}

impl From<&SourceSweep> for SourceStats {
    fn from(sweep: &SourceSweep) -> Self {
        Self {
            source: sweep.source,
            pages: sweep.pages,
            records: sweep.records,
            observations: sweep.observations.len(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceStats>,
    pub combined_entries: usize,
    pub catalog_rows: usize,
    pub catalog_error: Option<String>,
    pub rows_updated: usize,
    pub rows_appended: usize,
    pub rows_zeroed: usize,
    pub reports_dir: Option<String>,
}

impl RunSummary {
    fn new(run_id: Uuid, mode: RunMode) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            mode,
            started_at: now,
            finished_at: now,
            sources: Vec::new(),
            combined_entries: 0,
            catalog_rows: 0,
            catalog_error: None,
            rows_updated: 0,
            rows_appended: 0,
            rows_zeroed: 0,
            reports_dir: None,
        }
    }

    fn absorb(&mut self, outcome: &LedgerOutcome) {
        self.rows_updated += outcome.rows_updated;
        self.rows_appended += outcome.rows_appended;
        self.rows_zeroed += outcome.rows_zeroed;
    }
}

pub struct SyncPipeline {
    run_id: Uuid,
    config: SyncConfig,
    vocabulary: Vocabulary,
    engine: SheetSyncEngine,
    sink: Arc<dyn SheetSink>,
    quotes: Option<Box<dyn SourceAdapter>>,
    jobs: Option<Box<dyn SourceAdapter>>,
}

impl SyncPipeline {
    pub fn new(run_id: Uuid, config: SyncConfig, vocabulary: Vocabulary, sink: Arc<dyn SheetSink>) -> Self {
        let engine = config.engine();
        Self {
            run_id,
            config,
            vocabulary,
            engine,
            sink,
            quotes: None,
            jobs: None,
        }
    }

    pub fn with_sources(mut self, quotes: Box<dyn SourceAdapter>, jobs: Box<dyn SourceAdapter>) -> Self {
        self.quotes = Some(quotes);
        self.jobs = Some(jobs);
        self
    }

    pub fn with_engine(mut self, engine: SheetSyncEngine) -> Self {
        self.engine = engine;
        self
    }

    pub async fn run(&self, mode: RunMode) -> Result<RunSummary> {
        let mut summary = RunSummary::new(self.run_id, mode);
        info!(run_id = %self.run_id, ?mode, "starting inventory sync");

        if mode.includes_catalog() {
            self.seed_from_catalog(&mut summary).await?;
        }
        if mode.includes_activity() {
            self.reconcile_activity(&mut summary).await?;
        }

        summary.finished_at = Utc::now();
        info!(
            run_id = %self.run_id,
            updated = summary.rows_updated,
            appended = summary.rows_appended,
            zeroed = summary.rows_zeroed,
            "inventory sync finished"
        );
        Ok(summary)
    }

    async fn seed_from_catalog(&self, summary: &mut RunSummary) -> Result<()> {
        let path = &self.config.catalog_csv;
        let import = match load_catalog_csv(path, self.config.catalog_detect_sku, &self.vocabulary) {
            Ok(import) => import,
            Err(err) => {
                error!(path = %path.display(), error = %err, "catalog import failed; continuing with no catalog rows");
                summary.catalog_error = Some(err.to_string());
                return Ok(());
            }
        };
        summary.catalog_rows = import.entries.len();
        info!(
            path = %path.display(),
            rows = import.rows_read,
            skipped = import.rows_skipped,
            entries = import.entries.len(),
            "loaded catalog"
        );
        if import.entries.is_empty() {
            return Ok(());
        }

        let outcome = self
            .engine
            .sync(self.sink.as_ref(), &import.entries, SyncMode::SeedOnly, Local::now().naive_local())
            .await
            .context("seeding ledger from catalog")?;
        summary.absorb(&outcome);
        Ok(())
    }

    async fn reconcile_activity(&self, summary: &mut RunSummary) -> Result<()> {
        let (Some(quotes), Some(jobs)) = (self.quotes.as_deref(), self.jobs.as_deref()) else {
            bail!("quotes and jobs sources are not configured");
        };

        let quotes = self.sweep(quotes).await.context("sweeping quotes")?;
        let jobs = self.sweep(jobs).await.context("sweeping jobs")?;
        summary.sources = vec![SourceStats::from(&quotes), SourceStats::from(&jobs)];

        let combined = merge(&aggregate(&quotes.observations), &aggregate(&jobs.observations));
        summary.combined_entries = combined.len();
        info!(entries = combined.len(), "merged quotes and jobs");

        let outcome = self
            .engine
            .sync(self.sink.as_ref(), &combined, SyncMode::Reconcile, Local::now().naive_local())
            .await
            .context("reconciling ledger with quotes and jobs")?;
        summary.absorb(&outcome);

        let reports_dir = self.write_reports(summary, &[&quotes, &jobs], &combined).await?;
        summary.reports_dir = Some(reports_dir.display().to_string());
        Ok(())
    }

    /// Walk every page of one source. The next page is requested only after
    /// the current one is fully processed, with a pause in between.
    async fn sweep(&self, source: &dyn SourceAdapter) -> Result<SourceSweep> {
        let kind = source.source_kind();
        let mut sweep = SourceSweep {
            source: kind,
            pages: 0,
            records: 0,
            observations: Vec::new(),
        };
        let mut cursor: Option<String> = None;

        loop {
            let ctx = AdapterContext {
                run_id: self.run_id,
                fetched_at: Utc::now(),
            };
            let page_no = sweep.pages + 1;
            let fetched = source
                .fetch_page(&ctx, cursor.as_deref())
                .await
                .with_context(|| format!("fetching {kind} page {page_no}"))?;
            let page = match source.parse_page(&fetched) {
                Ok(page) => page,
                Err(AdapterError::Throttled(cost)) => {
                    cost.log(kind);
                    bail!(
                        "{kind} page {page_no} was throttled; retry after {:.1}s",
                        cost.suggested_wait().unwrap_or_default().as_secs_f64()
                    );
                }
                Err(err) => return Err(err).with_context(|| format!("parsing {kind} page {page_no}")),
            };
            if let Some(cost) = &page.cost {
                cost.log(kind);
            }

            sweep.pages += 1;
            sweep.records += page.records.len();
            for record in &page.records {
                let found = extract_observations(kind, record, &self.vocabulary);
                let dropped = record.line_items().len() - found.len();
                if dropped > 0 {
                    debug!(source = %kind, record = record.id.as_deref().unwrap_or("?"), dropped, "line items not classified as inventory");
                }
                sweep.observations.extend(found);
            }
            info!(
                source = %kind,
                page = sweep.pages,
                records = page.records.len(),
                observations = sweep.observations.len(),
                "processed page"
            );

            match page.next_cursor() {
                Some(next) => {
                    cursor = Some(next.to_string());
                    if !self.config.page_pause.is_zero() {
                        tokio::time::sleep(self.config.page_pause).await;
                    }
                }
                None => break,
            }
        }

        Ok(sweep)
    }

    async fn write_reports(
        &self,
        summary: &RunSummary,
        sweeps: &[&SourceSweep],
        combined: &[CombinedEntry],
    ) -> Result<PathBuf> {
        let reports_dir = self.config.reports_dir.join(self.run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let observations = sweeps
            .iter()
            .flat_map(|s| s.observations.iter().map(move |o| (s.source, o)))
            .collect::<Vec<_>>();
        fs::write(
            reports_dir.join("items_without_sku.md"),
            render_items_without_sku(self.run_id, &observations),
        )
        .await
        .context("writing items_without_sku.md")?;

        let inventory_json = serde_json::to_vec_pretty(&serde_json::json!({
            "run_id": self.run_id,
            "started_at": summary.started_at,
            "sources": sweeps.iter().map(|s| SourceStats::from(*s)).collect::<Vec<_>>(),
            "entries": combined,
        }))
        .context("serializing combined inventory")?;
        fs::write(reports_dir.join("combined_inventory.json"), inventory_json)
            .await
            .context("writing combined_inventory.json")?;

        Ok(reports_dir)
    }
}

fn percent(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

/// Markdown diagnostics for observations that resolved without a SKU.
pub fn render_items_without_sku(run_id: Uuid, observations: &[(SourceKind, &InventoryObservation)]) -> String {
    let total = observations.len();
    let with_sku = observations.iter().filter(|(_, o)| o.has_sku()).count();
    let with_description = observations
        .iter()
        .filter(|(_, o)| o.description.as_deref().is_some_and(|d| !d.is_empty()))
        .count();
    let missing = observations.iter().filter(|(_, o)| !o.has_sku()).collect::<Vec<_>>();

    let mut provenance: BTreeMap<&'static str, usize> = BTreeMap::new();
    for (_, obs) in observations {
        for origin in obs.provenance.iter() {
            *provenance.entry(origin.as_str()).or_default() += 1;
        }
    }
    let mut provenance = provenance.into_iter().collect::<Vec<_>>();
    provenance.sort_by(|a, b| b.1.cmp(&a.1));

    let mut out = format!(
        "# Items Without SKU\n\n- Run ID: `{run_id}`\n- Observations: {total}\n- With name: {total} (100.0%)\n- With SKU: {with_sku} ({:.1}%)\n- With description: {with_description} ({:.1}%)\n- Without SKU: {} ({:.1}%)\n\n## Provenance\n",
        percent(with_sku, total),
        percent(with_description, total),
        missing.len(),
        percent(missing.len(), total),
    );
    for (tag, count) in &provenance {
        out.push_str(&format!("- {tag}: {count}\n"));
    }

    out.push_str("\n## Items\n");
    if missing.is_empty() {
        out.push_str("\nEvery observation carried a SKU.\n");
    }
    for (idx, (source, obs)) in missing.iter().enumerate() {
        out.push_str(&format!(
            "\n### {}. {} ({source})\n- Description: {}\n- Category: {}\n- Provenance: {}\n",
            idx + 1,
            obs.name,
            obs.description.as_deref().unwrap_or("(none)"),
            obs.category,
            obs.provenance,
        ));
    }
    out
}

/// Build the live pipeline from the environment and run it once.
pub async fn run_sync_from_env(mode: RunMode, catalog_override: Option<PathBuf>) -> Result<RunSummary> {
    let mut config = SyncConfig::from_env();
    if let Some(path) = catalog_override {
        config.catalog_csv = path;
    }
    let vocabulary = load_vocabulary(&config.workspace_root)?;
    let run_id = Uuid::new_v4();
    let http = Arc::new(HttpFetcher::new(config.http_client_config())?);

    let spreadsheet_id = config
        .sheets_id
        .clone()
        .context("GOOGLE_SHEETS_ID is not set")?;
    let tokens: Box<dyn TokenSource> = match (&config.sheets_token_file, &config.sheets_access_token) {
        (Some(path), _) => Box::new(FileToken::new(path.clone())),
        (None, Some(token)) => Box::new(StaticToken(token.clone())),
        (None, None) => bail!("set GOOGLE_SHEETS_TOKEN_FILE or GOOGLE_SHEETS_ACCESS_TOKEN"),
    };
    let sink = GoogleSheetsSink::new(Arc::clone(&http), run_id, spreadsheet_id, tokens);
    let mut pipeline = SyncPipeline::new(run_id, config.clone(), vocabulary, Arc::new(sink));

    if mode.includes_activity() {
        let credentials = config
            .jobber
            .clone()
            .context("JOBBER_CLIENT_ID, JOBBER_CLIENT_SECRET and JOBBER_REFRESH_TOKEN must be set")?;
        let grant = RefreshTokenGrant {
            token_url: config.jobber_token_url.clone(),
            client_id: credentials.client_id,
            client_secret: credentials.client_secret,
            refresh_token: credentials.refresh_token.clone(),
        };
        let token = http
            .exchange_refresh_token(run_id, &grant)
            .await
            .context("exchanging jobber refresh token")?;
        if token
            .refresh_token
            .as_deref()
            .is_some_and(|rotated| rotated != credentials.refresh_token)
        {
            warn!("jobber issued a new refresh token; update JOBBER_REFRESH_TOKEN before the next run");
        }

        let mut quotes = JobberAdapter::new(
            SourceKind::Quotes,
            Arc::clone(&http),
            config.jobber_config(),
            token.access_token.clone(),
        );
        let mut jobs = JobberAdapter::new(SourceKind::Jobs, Arc::clone(&http), config.jobber_config(), token.access_token);
        if let Some(dir) = &config.raw_pages_dir {
            quotes = quotes.with_archive(ArtifactStore::new(dir.clone()));
            jobs = jobs.with_archive(ArtifactStore::new(dir.clone()));
        }
        pipeline = pipeline.with_sources(Box::new(quotes), Box::new(jobs));
    }

    pipeline.run(mode).await
}
