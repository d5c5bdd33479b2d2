//! Spreadsheet ledger reconciliation.
//!
//! Rows are matched by their `(Part, Part No.)` cells. Matching rows get
//! fresh counts and formulas, unknown entries are appended below the last
//! data row, and rows missing from the input are zeroed. Nothing is deleted
//! and the Current Inv column is never written.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use invsync_core::{CombinedEntry, IdentityKey};
use invsync_storage::{column_letters, CellRef, CellUpdate, CellValue, SheetSink, SinkError};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};

pub const LEDGER_HEADERS: [&str; 8] = [
    "Part",
    "Part No.",
    "Description",
    "Current Inv",
    "Quote QTY",
    "Job QTY",
    "Total allocated",
    "Available QTY",
];

/// Fixed column order of the ledger, 1-based from column A.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedgerColumn {
    Part,
    PartNo,
    Description,
    CurrentInv,
    QuoteQty,
    JobQty,
    TotalAllocated,
    AvailableQty,
}

impl LedgerColumn {
    pub fn index(self) -> u32 {
        match self {
            Self::Part => 1,
            Self::PartNo => 2,
            Self::Description => 3,
            Self::CurrentInv => 4,
            Self::QuoteQty => 5,
            Self::JobQty => 6,
            Self::TotalAllocated => 7,
            Self::AvailableQty => 8,
        }
    }

    pub fn letter(self) -> String {
        column_letters(self.index())
    }

    pub fn at(self, row: u32) -> CellRef {
        CellRef::new(row, self.index())
    }
}

/// Where the ledger lives inside the spreadsheet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetLayout {
    pub worksheet_title: String,
    /// Rows above this one belong to external metadata.
    pub header_row: u32,
    pub headers: Vec<String>,
    pub timestamp_cell: CellRef,
}

impl Default for SheetLayout {
    fn default() -> Self {
        Self {
            worksheet_title: "Inventory".to_string(),
            header_row: 5,
            headers: LEDGER_HEADERS.iter().map(|h| h.to_string()).collect(),
            timestamp_cell: CellRef::new(1, 2),
        }
    }
}

impl SheetLayout {
    pub fn first_data_row(&self) -> u32 {
        self.header_row + 1
    }

    pub fn width(&self) -> u32 {
        self.headers.len().max(LEDGER_HEADERS.len()) as u32
    }

    fn header_matches(&self, found: Option<&Vec<String>>) -> bool {
        let Some(found) = found else {
            return false;
        };
        self.headers
            .iter()
            .enumerate()
            .all(|(i, expected)| found.get(i).map(|v| v.trim()) == Some(expected.as_str()))
    }
}

pub fn total_allocated_formula(row: u32) -> String {
    format!(
        "={q}{row}+{j}{row}",
        q = LedgerColumn::QuoteQty.letter(),
        j = LedgerColumn::JobQty.letter()
    )
}

pub fn available_formula(row: u32) -> String {
    format!(
        "={c}{row}-{j}{row}",
        c = LedgerColumn::CurrentInv.letter(),
        j = LedgerColumn::JobQty.letter()
    )
}

/// `October 19, 3:04 pm`
pub fn format_timestamp(at: NaiveDateTime) -> String {
    at.format("%B %-d, %-I:%M %P").to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Update matched rows, append new ones, zero rows missing from input.
    Reconcile,
    /// Only append rows that do not exist yet.
    SeedOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Uninitialized,
    HeaderVerified,
    Reconciling,
    Flushed,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Uninitialized => "uninitialized",
            Self::HeaderVerified => "header_verified",
            Self::Reconciling => "reconciling",
            Self::Flushed => "flushed",
        })
    }
}

/// A data row already present in the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerRow {
    pub row: u32,
    pub key: IdentityKey,
}

/// Turn rendered rows (starting at the first data row) into keyed rows.
/// Blank keys are skipped; for duplicate keys the first row wins.
pub fn index_ledger_rows(first_data_row: u32, rows: &[Vec<String>]) -> Vec<LedgerRow> {
    let mut seen = HashSet::new();
    let mut indexed = Vec::new();
    for (offset, cells) in rows.iter().enumerate() {
        let row = first_data_row + offset as u32;
        let cell = |col: LedgerColumn| {
            cells
                .get(col.index() as usize - 1)
                .map(|v| v.trim())
                .unwrap_or_default()
        };
        let (part, part_no) = (cell(LedgerColumn::Part), cell(LedgerColumn::PartNo));
        if part.is_empty() && part_no.is_empty() {
            continue;
        }
        let key = IdentityKey::new(part, Some(part_no));
        if !seen.insert(key.clone()) {
            warn!(row, part, part_no, "duplicate ledger row ignored");
            continue;
        }
        indexed.push(LedgerRow { row, key });
    }
    indexed
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncPlan {
    /// Cell writes against existing rows, row by row.
    pub updates: Vec<CellUpdate>,
    pub appended: Vec<CombinedEntry>,
    pub append_at: u32,
    pub rows_updated: usize,
    pub rows_zeroed: usize,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.appended.is_empty()
    }

    /// Literal cells for the appended block, Part through Job QTY.
    pub fn appended_block(&self) -> Vec<Vec<CellValue>> {
        self.appended
            .iter()
            .map(|entry| {
                vec![
                    CellValue::text(entry.name.clone()),
                    optional_text(Some(entry.sku.as_str())),
                    optional_text(entry.description.as_deref()),
                    CellValue::Empty,
                    CellValue::count(entry.quotes_count),
                    CellValue::count(entry.jobs_count),
                ]
            })
            .collect()
    }

    pub fn appended_formulas(&self) -> Vec<CellUpdate> {
        (0..self.appended.len() as u32)
            .map(|i| self.append_at + i)
            .flat_map(formula_updates)
            .collect()
    }
}

fn optional_text(value: Option<&str>) -> CellValue {
    match value {
        Some(v) if !v.is_empty() => CellValue::text(v),
        _ => CellValue::Empty,
    }
}

fn formula_updates(row: u32) -> [CellUpdate; 2] {
    [
        CellUpdate {
            cell: LedgerColumn::TotalAllocated.at(row),
            value: CellValue::Formula(total_allocated_formula(row)),
        },
        CellUpdate {
            cell: LedgerColumn::AvailableQty.at(row),
            value: CellValue::Formula(available_formula(row)),
        },
    ]
}

/// Decide every write for one run without touching the sink.
///
/// `append_at` is the first row below the existing data block.
pub fn plan_reconciliation(
    existing: &[LedgerRow],
    append_at: u32,
    entries: &[CombinedEntry],
    mode: SyncMode,
) -> SyncPlan {
    let by_key: HashMap<&IdentityKey, u32> = existing.iter().map(|r| (&r.key, r.row)).collect();
    let mut plan = SyncPlan {
        append_at,
        ..Default::default()
    };
    let mut touched = HashSet::new();
    let mut pending = HashSet::new();

    for entry in entries {
        let key = entry.identity_key();
        match by_key.get(&key) {
            Some(&row) => {
                if mode == SyncMode::SeedOnly || !touched.insert(row) {
                    continue;
                }
                plan.updates.push(CellUpdate {
                    cell: LedgerColumn::QuoteQty.at(row),
                    value: CellValue::count(entry.quotes_count),
                });
                plan.updates.push(CellUpdate {
                    cell: LedgerColumn::JobQty.at(row),
                    value: CellValue::count(entry.jobs_count),
                });
                plan.updates.push(CellUpdate {
                    cell: LedgerColumn::Description.at(row),
                    value: optional_text(entry.description.as_deref()),
                });
                plan.updates.extend(formula_updates(row));
                plan.rows_updated += 1;
            }
            None => {
                if pending.insert(key) {
                    plan.appended.push(entry.clone());
                }
            }
        }
    }

    if mode == SyncMode::Reconcile {
        for stale in existing.iter().filter(|r| !touched.contains(&r.row)) {
            plan.updates.push(CellUpdate {
                cell: LedgerColumn::QuoteQty.at(stale.row),
                value: CellValue::count(0),
            });
            plan.updates.push(CellUpdate {
                cell: LedgerColumn::JobQty.at(stale.row),
                value: CellValue::count(0),
            });
            plan.rows_zeroed += 1;
        }
    }

    plan
}

/// Bounded retry around mutating sink calls. Only expired credentials are
/// retried, after asking the sink to refresh them.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub pause: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            pause: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub async fn run<T, F, Fut>(&self, sink: &dyn SheetSink, operation: &str, mut call: F) -> Result<T, SinkError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SinkError>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_auth_expired() && attempt < self.max_attempts => {
                    warn!(operation, attempt, error = %err, "spreadsheet credentials expired; refreshing");
                    sink.refresh_auth().await?;
                    if !self.pause.is_zero() {
                        tokio::time::sleep(self.pause).await;
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerOutcome {
    pub header_rewritten: bool,
    pub rows_updated: usize,
    pub rows_appended: usize,
    pub rows_zeroed: usize,
    pub batches_written: usize,
}

/// Runs `Uninitialized -> HeaderVerified -> Reconciling -> Flushed` against a sink.
#[derive(Debug, Clone)]
pub struct SheetSyncEngine {
    layout: SheetLayout,
    batch_size: usize,
    batch_pause: Duration,
    retry: RetryPolicy,
}

impl SheetSyncEngine {
    pub fn new(layout: SheetLayout) -> Self {
        Self {
            layout,
            batch_size: 100,
            batch_pause: Duration::from_millis(500),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_batching(mut self, batch_size: usize, batch_pause: Duration) -> Self {
        self.batch_size = batch_size.max(1);
        self.batch_pause = batch_pause;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn layout(&self) -> &SheetLayout {
        &self.layout
    }

    pub async fn sync(
        &self,
        sink: &dyn SheetSink,
        entries: &[CombinedEntry],
        mode: SyncMode,
        now: NaiveDateTime,
    ) -> Result<LedgerOutcome> {
        let span = info_span!(
            "sheet_sync",
            worksheet = %self.layout.worksheet_title,
            mode = ?mode,
            entries = entries.len()
        );
        let mut phase = SyncPhase::Uninitialized;
        let result = self
            .sync_phases(sink, entries, mode, now, &mut phase)
            .instrument(span)
            .await;
        result.with_context(|| format!("ledger sync failed while {phase}"))
    }

    async fn sync_phases(
        &self,
        sink: &dyn SheetSink,
        entries: &[CombinedEntry],
        mode: SyncMode,
        now: NaiveDateTime,
        phase: &mut SyncPhase,
    ) -> Result<LedgerOutcome> {
        let title = self.layout.worksheet_title.as_str();
        let width = self.layout.width();
        let mut outcome = LedgerOutcome::default();

        sink.ensure_worksheet(title, 1000, width).await?;
        let rows = sink.read_rows(title, self.layout.header_row, width).await?;
        if !self.layout.header_matches(rows.first()) {
            info!(header_row = self.layout.header_row, "writing ledger header");
            let header_rows = vec![self.layout.headers.iter().map(CellValue::text).collect::<Vec<_>>()];
            let header = header_rows.as_slice();
            let origin = CellRef::new(self.layout.header_row, 1);
            self.retry
                .run(sink, "write header", move || sink.write_block(title, origin, header))
                .await?;
            outcome.header_rewritten = true;
        }
        *phase = SyncPhase::HeaderVerified;
        debug!(%phase, "ledger header verified");

        let data_rows = rows.get(1..).unwrap_or_default();
        let existing = index_ledger_rows(self.layout.first_data_row(), data_rows);
        let append_at = self.layout.first_data_row() + data_rows.len() as u32;
        *phase = SyncPhase::Reconciling;
        let plan = plan_reconciliation(&existing, append_at, entries, mode);
        debug!(
            %phase,
            existing = existing.len(),
            updates = plan.updates.len(),
            appended = plan.appended.len(),
            "planned ledger writes"
        );

        if !plan.appended.is_empty() {
            let last_row = plan.append_at + plan.appended.len() as u32 - 1;
            self.retry
                .run(sink, "grow grid", move || sink.ensure_rows(title, last_row))
                .await?;
            let block_rows = plan.appended_block();
            let block = block_rows.as_slice();
            let origin = CellRef::new(plan.append_at, 1);
            self.retry
                .run(sink, "append rows", move || sink.write_block(title, origin, block))
                .await?;
            let formula_cells = plan.appended_formulas();
            let formulas = formula_cells.as_slice();
            self.retry
                .run(sink, "append formulas", move || sink.write_cells(title, formulas))
                .await?;
        }

        let batches = plan.updates.chunks(self.batch_size).collect::<Vec<_>>();
        for (idx, &batch) in batches.iter().enumerate() {
            if idx > 0 && !self.batch_pause.is_zero() {
                tokio::time::sleep(self.batch_pause).await;
            }
            self.retry
                .run(sink, "update rows", move || sink.write_cells(title, batch))
                .await?;
            outcome.batches_written += 1;
            debug!(batch = idx + 1, of = batches.len(), cells = batch.len(), "flushed update batch");
        }

        let stamp_cells = [CellUpdate {
            cell: self.layout.timestamp_cell,
            value: CellValue::text(format_timestamp(now)),
        }];
        let stamp = stamp_cells.as_slice();
        self.retry
            .run(sink, "timestamp", move || sink.write_cells(title, stamp))
            .await?;
        *phase = SyncPhase::Flushed;

        outcome.rows_updated = plan.rows_updated;
        outcome.rows_appended = plan.appended.len();
        outcome.rows_zeroed = plan.rows_zeroed;
        info!(
            updated = outcome.rows_updated,
            appended = outcome.rows_appended,
            zeroed = outcome.rows_zeroed,
            batches = outcome.batches_written,
            "ledger flushed"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use invsync_storage::MemorySheet;

    const TITLE: &str = "Inventory";
    const HEADER: &[&str] = &LEDGER_HEADERS;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, 19)
            .and_then(|d| d.and_hms_opt(15, 4, 0))
            .expect("timestamp")
    }

    fn engine() -> SheetSyncEngine {
        SheetSyncEngine::new(SheetLayout::default())
            .with_batching(100, Duration::ZERO)
            .with_retry(RetryPolicy {
                max_attempts: 2,
                pause: Duration::ZERO,
            })
    }

    fn entry(sku: &str, name: &str, description: Option<&str>, quotes: usize, jobs: usize) -> CombinedEntry {
        CombinedEntry {
            sku: sku.to_string(),
            name: name.to_string(),
            description: description.map(String::from),
            quotes_count: quotes,
            jobs_count: jobs,
        }
    }

    /// Metadata rows 1-4, header at row 5, data from row 6.
    fn ledger_with(data: &[&[&str]]) -> MemorySheet {
        let metadata: [&[&str]; 5] = [
            &["Last Updated", "October 1, 9:00 am"],
            &["Warehouse", "North"],
            &[],
            &[],
            HEADER,
        ];
        let mut rows = metadata.to_vec();
        rows.extend_from_slice(data);
        MemorySheet::new().with_rows(TITLE, &rows)
    }

    fn text(sheet: &MemorySheet, a1: &str) -> String {
        sheet.cell_a1(TITLE, a1).display()
    }

    #[test]
    fn formulas_reference_their_own_row() {
        assert_eq!(total_allocated_formula(42), "=E42+F42");
        assert_eq!(available_formula(42), "=D42-F42");
    }

    #[test]
    fn timestamp_uses_lowercase_meridiem() {
        assert_eq!(format_timestamp(now()), "October 19, 3:04 pm");
    }

    #[test]
    fn indexing_skips_blank_and_duplicate_keys() {
        let rows = vec![
            vec!["Widget".to_string(), "W1".to_string()],
            vec![],
            vec!["Widget".to_string(), "W1 ".to_string()],
            vec!["Gadget".to_string()],
        ];
        let indexed = index_ledger_rows(6, &rows);
        assert_eq!(
            indexed,
            vec![
                LedgerRow { row: 6, key: IdentityKey::new("Widget", Some("W1")) },
                LedgerRow { row: 9, key: IdentityKey::new("Gadget", None) },
            ]
        );
    }

    #[test]
    fn seed_plan_never_touches_existing_rows() {
        let existing = vec![LedgerRow { row: 6, key: IdentityKey::new("Widget", Some("W1")) }];
        let entries = vec![entry("W1", "Widget", Some("new"), 0, 0), entry("G1", "Gadget", None, 0, 0)];
        let plan = plan_reconciliation(&existing, 7, &entries, SyncMode::SeedOnly);
        assert!(plan.updates.is_empty());
        assert_eq!(plan.rows_zeroed, 0);
        assert_eq!(plan.appended.len(), 1);
        assert_eq!(plan.appended[0].name, "Gadget");
    }

    #[tokio::test]
    async fn fresh_sheet_gets_header_rows_and_formulas() {
        let sheet = MemorySheet::new();
        let entries = vec![
            entry("PS636WR", "Patriot 6'", Some("Patriot Series 6' ramp"), 1, 2),
            entry("", "Rubber Threshold Ramp", None, 1, 1),
        ];
        let outcome = engine().sync(&sheet, &entries, SyncMode::Reconcile, now()).await.unwrap();

        assert!(outcome.header_rewritten);
        assert_eq!(outcome.rows_appended, 2);
        assert_eq!(text(&sheet, "A5"), "Part");
        assert_eq!(text(&sheet, "H5"), "Available QTY");
        assert_eq!(text(&sheet, "A6"), "Patriot 6'");
        assert_eq!(text(&sheet, "B6"), "PS636WR");
        assert_eq!(sheet.cell_a1(TITLE, "E6"), CellValue::Number(1));
        assert_eq!(sheet.cell_a1(TITLE, "F6"), CellValue::Number(2));
        assert_eq!(sheet.cell_a1(TITLE, "D6"), CellValue::Empty);
        assert_eq!(sheet.cell_a1(TITLE, "G7"), CellValue::Formula("=E7+F7".to_string()));
        assert_eq!(sheet.cell_a1(TITLE, "H7"), CellValue::Formula("=D7-F7".to_string()));
        assert_eq!(sheet.cell_a1(TITLE, "B7"), CellValue::Empty);
        assert_eq!(text(&sheet, "B1"), "October 19, 3:04 pm");
    }

    #[tokio::test]
    async fn matched_rows_update_in_place_and_keep_current_inv() {
        let sheet = ledger_with(&[&["Widget", "W1", "old text", "12", "0", "0", "=E6+F6", "=D6-F6"]]);
        let entries = vec![entry("W1", "Widget", Some("Widget, blue"), 2, 5)];
        let outcome = engine().sync(&sheet, &entries, SyncMode::Reconcile, now()).await.unwrap();

        assert!(!outcome.header_rewritten);
        assert_eq!(outcome.rows_updated, 1);
        assert_eq!(outcome.rows_appended, 0);
        assert_eq!(sheet.used_rows(TITLE), 6);
        assert_eq!(text(&sheet, "C6"), "Widget, blue");
        assert_eq!(text(&sheet, "D6"), "12");
        assert_eq!(sheet.cell_a1(TITLE, "E6"), CellValue::Number(2));
        assert_eq!(sheet.cell_a1(TITLE, "F6"), CellValue::Number(5));
        assert_eq!(text(&sheet, "A2"), "Warehouse");
    }

    #[tokio::test]
    async fn rows_missing_from_input_are_zeroed_not_deleted() {
        let sheet = ledger_with(&[
            &["Old Part", "OP1", "kept description", "7", "3", "4"],
            &["Widget", "W1", "", "1", "0", "0"],
        ]);
        let entries = vec![entry("W1", "Widget", None, 1, 0)];
        let outcome = engine().sync(&sheet, &entries, SyncMode::Reconcile, now()).await.unwrap();

        assert_eq!(outcome.rows_zeroed, 1);
        assert_eq!(text(&sheet, "A6"), "Old Part");
        assert_eq!(text(&sheet, "C6"), "kept description");
        assert_eq!(text(&sheet, "D6"), "7");
        assert_eq!(sheet.cell_a1(TITLE, "E6"), CellValue::Number(0));
        assert_eq!(sheet.cell_a1(TITLE, "F6"), CellValue::Number(0));
        assert_eq!(sheet.used_rows(TITLE), 7);
    }

    #[tokio::test]
    async fn cleared_description_is_cleared_in_the_ledger() {
        let sheet = ledger_with(&[&["Widget", "W1", "discontinued blue", "4", "1", "1"]]);
        let entries = vec![entry("W1", "Widget", None, 2, 0)];
        engine().sync(&sheet, &entries, SyncMode::Reconcile, now()).await.unwrap();

        assert_eq!(sheet.cell_a1(TITLE, "C6"), CellValue::Empty);
        assert_eq!(text(&sheet, "D6"), "4");
        assert_eq!(sheet.cell_a1(TITLE, "E6"), CellValue::Number(2));
    }

    #[tokio::test]
    async fn appending_past_the_grid_grows_it_first() {
        let sheet = ledger_with(&[&["Widget", "W1", "", "4", "1", "1"]]).with_row_limit(TITLE, 6);
        let entries = vec![
            entry("W1", "Widget", None, 1, 1),
            entry("G1", "Gadget", None, 0, 2),
            entry("", "Grab bar", None, 1, 0),
        ];
        let outcome = engine().sync(&sheet, &entries, SyncMode::Reconcile, now()).await.unwrap();

        assert_eq!(outcome.rows_appended, 2);
        assert_eq!(sheet.row_limit(TITLE), Some(8));
        assert_eq!(text(&sheet, "A7"), "Gadget");
        assert_eq!(text(&sheet, "A8"), "Grab bar");
        assert_eq!(sheet.cell_a1(TITLE, "H8"), CellValue::Formula("=D8-F8".to_string()));
    }

    #[tokio::test]
    async fn rerunning_the_same_input_is_a_no_op() {
        let sheet = ledger_with(&[&["Old Part", "OP1", "", "7", "3", "4"]]);
        let entries = vec![
            entry("W1", "Widget", Some("Widget"), 2, 5),
            entry("", "Grab bar", None, 0, 1),
        ];
        engine().sync(&sheet, &entries, SyncMode::Reconcile, now()).await.unwrap();
        let first = sheet.snapshot(TITLE);

        let second = engine().sync(&sheet, &entries, SyncMode::Reconcile, now()).await.unwrap();
        assert_eq!(second.rows_appended, 0);
        assert_eq!(second.rows_updated, 2);
        assert_eq!(sheet.snapshot(TITLE), first);
    }

    #[tokio::test]
    async fn every_formula_points_at_its_own_row() {
        let sheet = ledger_with(&[&["A", "A1X", "", "1"], &["B", "B1X", "", "2"]]);
        let entries = vec![
            entry("A1X", "A", None, 1, 0),
            entry("B1X", "B", None, 0, 1),
            entry("C1X", "C", None, 3, 3),
        ];
        engine().sync(&sheet, &entries, SyncMode::Reconcile, now()).await.unwrap();

        for row in 6..=8 {
            assert_eq!(
                sheet.cell(TITLE, LedgerColumn::TotalAllocated.at(row)),
                CellValue::Formula(format!("=E{row}+F{row}"))
            );
            assert_eq!(
                sheet.cell(TITLE, LedgerColumn::AvailableQty.at(row)),
                CellValue::Formula(format!("=D{row}-F{row}"))
            );
        }
    }

    #[tokio::test]
    async fn header_mismatch_rewrites_only_the_header_row() {
        let sheet = MemorySheet::new().with_rows(
            TITLE,
            &[
                &["Last Updated", "yesterday"],
                &["Notes", "do not touch"],
                &[],
                &[],
                &["Item", "SKU"],
                &["Widget", "W1", "", "4", "1", "1"],
            ],
        );
        let entries = vec![entry("W1", "Widget", None, 0, 2)];
        let outcome = engine().sync(&sheet, &entries, SyncMode::Reconcile, now()).await.unwrap();

        assert!(outcome.header_rewritten);
        assert_eq!(text(&sheet, "A5"), "Part");
        assert_eq!(text(&sheet, "B2"), "do not touch");
        assert_eq!(text(&sheet, "D6"), "4");
        assert_eq!(sheet.cell_a1(TITLE, "F6"), CellValue::Number(2));
        assert_eq!(sheet.used_rows(TITLE), 6);
    }

    #[tokio::test]
    async fn seed_mode_only_appends() {
        let sheet = ledger_with(&[&["Widget", "W1", "desc", "4", "3", "2"]]);
        let entries = vec![entry("W1", "Widget", Some("catalog"), 0, 0), entry("G1", "Gadget", None, 0, 0)];
        let outcome = engine().sync(&sheet, &entries, SyncMode::SeedOnly, now()).await.unwrap();

        assert_eq!(outcome.rows_updated, 0);
        assert_eq!(outcome.rows_zeroed, 0);
        assert_eq!(outcome.rows_appended, 1);
        assert_eq!(text(&sheet, "C6"), "desc");
        assert_eq!(sheet.cell_a1(TITLE, "E6").display(), "3");
        assert_eq!(text(&sheet, "A7"), "Gadget");
        assert_eq!(sheet.cell_a1(TITLE, "E7"), CellValue::Number(0));
    }

    #[tokio::test]
    async fn open_failure_writes_nothing() {
        let sheet = MemorySheet::new().failing_open();
        let err = engine()
            .sync(&sheet, &[entry("W1", "Widget", None, 1, 0)], SyncMode::Reconcile, now())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("uninitialized"));
        assert_eq!(sheet.write_calls(), 0);
    }

    #[tokio::test]
    async fn failed_batch_keeps_earlier_batches() {
        let sheet = ledger_with(&[
            &["A", "A1X", "", "1", "0", "0"],
            &["B", "B1X", "", "1", "0", "0"],
            &["C", "C1X", "", "1", "0", "0"],
        ])
        .failing_writes_after(1);
        let entries = vec![
            entry("A1X", "A", None, 9, 9),
            entry("B1X", "B", None, 9, 9),
            entry("C1X", "C", None, 9, 9),
        ];
        let err = SheetSyncEngine::new(SheetLayout::default())
            .with_batching(4, Duration::ZERO)
            .with_retry(RetryPolicy {
                max_attempts: 2,
                pause: Duration::ZERO,
            })
            .sync(&sheet, &entries, SyncMode::Reconcile, now())
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<SinkError>(),
            Some(SinkError::Api { status: 503, .. })
        ));
        assert_eq!(sheet.cell_a1(TITLE, "E6"), CellValue::Number(9));
        assert_eq!(sheet.cell_a1(TITLE, "F6"), CellValue::Number(9));
        assert_eq!(text(&sheet, "E7"), "0");
        assert_eq!(text(&sheet, "B1"), "October 1, 9:00 am");
    }

    #[tokio::test]
    async fn expired_auth_is_refreshed_and_retried_once() {
        let sheet = ledger_with(&[]).expiring_auth_once();
        let outcome = engine()
            .sync(&sheet, &[entry("W1", "Widget", None, 1, 0)], SyncMode::Reconcile, now())
            .await
            .unwrap();
        assert_eq!(outcome.rows_appended, 1);
        assert_eq!(sheet.auth_refreshes(), 1);
        assert_eq!(text(&sheet, "A6"), "Widget");
    }

    #[tokio::test]
    async fn auth_failures_beyond_the_retry_limit_propagate() {
        let sheet = ledger_with(&[]).expiring_auth_once();
        let err = engine()
            .with_retry(RetryPolicy {
                max_attempts: 1,
                pause: Duration::ZERO,
            })
            .sync(&sheet, &[entry("W1", "Widget", None, 1, 0)], SyncMode::Reconcile, now())
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<SinkError>().is_some_and(SinkError::is_auth_expired));
        assert_eq!(sheet.auth_refreshes(), 0);
    }
}
