//! In-process [`SheetSink`] with failure injection, used by the sync tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::sheets::{CellRef, CellUpdate, CellValue, SheetSink, SinkError};

#[derive(Debug, Default)]
struct MemoryState {
    worksheets: BTreeMap<String, Vec<Vec<CellValue>>>,
    row_limits: BTreeMap<String, u32>,
    fail_open: bool,
    fail_writes_after: Option<usize>,
    expire_auth_once: bool,
    write_calls: usize,
    auth_refreshes: usize,
}

/// Grid-backed sheet with failure injection.
#[derive(Debug, Default)]
pub struct MemorySheet {
    state: Mutex<MemoryState>,
}

impl MemorySheet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a worksheet with literal text rows starting at row 1.
    pub fn with_rows(self, title: &str, rows: &[&[&str]]) -> Self {
        {
            let mut state = self.lock();
            let grid = rows
                .iter()
                .map(|row| {
                    row.iter()
                        .map(|v| {
                            if v.is_empty() {
                                CellValue::Empty
                            } else {
                                CellValue::text(*v)
                            }
                        })
                        .collect()
                })
                .collect();
            state.worksheets.insert(title.to_string(), grid);
        }
        self
    }

    /// Cap the worksheet grid at `rows` rows until it is grown.
    pub fn with_row_limit(self, title: &str, rows: u32) -> Self {
        self.lock().row_limits.insert(title.to_string(), rows);
        self
    }

    pub fn row_limit(&self, title: &str) -> Option<u32> {
        self.lock().row_limits.get(title).copied()
    }

    pub fn failing_open(self) -> Self {
        self.lock().fail_open = true;
        self
    }

    /// Every write call after the first `n` fails with a server error.
    pub fn failing_writes_after(self, n: usize) -> Self {
        self.lock().fail_writes_after = Some(n);
        self
    }

    /// The next write call reports expired credentials.
    pub fn expiring_auth_once(self) -> Self {
        self.lock().expire_auth_once = true;
        self
    }

    pub fn cell(&self, title: &str, cell: CellRef) -> CellValue {
        let state = self.lock();
        state
            .worksheets
            .get(title)
            .and_then(|grid| grid.get(cell.row as usize - 1))
            .and_then(|row| row.get(cell.col as usize - 1))
            .cloned()
            .unwrap_or(CellValue::Empty)
    }

    pub fn cell_a1(&self, title: &str, a1: &str) -> CellValue {
        CellRef::parse_a1(a1)
            .map(|cell| self.cell(title, cell))
            .unwrap_or(CellValue::Empty)
    }

    /// Number of rows up to the last non-empty one.
    pub fn used_rows(&self, title: &str) -> usize {
        let state = self.lock();
        state
            .worksheets
            .get(title)
            .map(|grid| trimmed_len(grid))
            .unwrap_or(0)
    }

    pub fn has_worksheet(&self, title: &str) -> bool {
        self.lock().worksheets.contains_key(title)
    }

    pub fn snapshot(&self, title: &str) -> Vec<Vec<CellValue>> {
        let state = self.lock();
        let Some(grid) = state.worksheets.get(title) else {
            return Vec::new();
        };
        grid[..trimmed_len(grid)]
            .iter()
            .map(|row| {
                let width = row.iter().rposition(|c| *c != CellValue::Empty).map_or(0, |i| i + 1);
                row[..width].to_vec()
            })
            .collect()
    }

    pub fn write_calls(&self) -> usize {
        self.lock().write_calls
    }

    pub fn auth_refreshes(&self) -> usize {
        self.lock().auth_refreshes
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn trimmed_len(grid: &[Vec<CellValue>]) -> usize {
    grid.iter()
        .rposition(|row| row.iter().any(|c| *c != CellValue::Empty))
        .map_or(0, |i| i + 1)
}

impl MemoryState {
    fn begin_write(&mut self) -> Result<(), SinkError> {
        if self.expire_auth_once {
            self.expire_auth_once = false;
            return Err(SinkError::AuthExpired("token expired".to_string()));
        }
        self.write_calls += 1;
        match self.fail_writes_after {
            Some(limit) if self.write_calls > limit => Err(SinkError::Api {
                status: 503,
                message: format!("injected failure on write call {}", self.write_calls),
            }),
            _ => Ok(()),
        }
    }

    fn check_rows(&self, title: &str, last_row: u32) -> Result<(), SinkError> {
        match self.row_limits.get(title) {
            Some(&limit) if last_row > limit => Err(SinkError::Api {
                status: 400,
                message: format!("range {title}!{last_row} exceeds grid limits. Max rows: {limit}"),
            }),
            _ => Ok(()),
        }
    }

    fn grid_mut(&mut self, title: &str) -> Result<&mut Vec<Vec<CellValue>>, SinkError> {
        self.worksheets
            .get_mut(title)
            .ok_or_else(|| SinkError::WorksheetUnavailable(title.to_string()))
    }
}

fn put(grid: &mut Vec<Vec<CellValue>>, cell: CellRef, value: CellValue) {
    let (r, c) = (cell.row as usize - 1, cell.col as usize - 1);
    if grid.len() <= r {
        grid.resize_with(r + 1, Vec::new);
    }
    let row = &mut grid[r];
    if row.len() <= c {
        row.resize(c + 1, CellValue::Empty);
    }
    row[c] = value;
}

#[async_trait]
impl SheetSink for MemorySheet {
    async fn ensure_worksheet(&self, title: &str, rows: u32, _cols: u32) -> Result<(), SinkError> {
        let mut state = self.lock();
        if state.fail_open {
            return Err(SinkError::WorksheetUnavailable(format!("cannot open {title}")));
        }
        if !state.worksheets.contains_key(title) {
            state.worksheets.insert(title.to_string(), Vec::new());
            state.row_limits.insert(title.to_string(), rows);
        }
        Ok(())
    }

    async fn read_rows(&self, title: &str, first_row: u32, cols: u32) -> Result<Vec<Vec<String>>, SinkError> {
        let state = self.lock();
        let grid = state
            .worksheets
            .get(title)
            .ok_or_else(|| SinkError::WorksheetUnavailable(title.to_string()))?;
        let end = trimmed_len(grid);
        let start = (first_row.max(1) as usize - 1).min(end);
        Ok(grid[start..end]
            .iter()
            .map(|row| {
                let mut values = row
                    .iter()
                    .take(cols as usize)
                    .map(CellValue::display)
                    .collect::<Vec<_>>();
                while values.last().is_some_and(String::is_empty) {
                    values.pop();
                }
                values
            })
            .collect())
    }

    async fn write_block(&self, title: &str, origin: CellRef, rows: &[Vec<CellValue>]) -> Result<(), SinkError> {
        let mut state = self.lock();
        state.begin_write()?;
        state.check_rows(title, origin.row + rows.len().saturating_sub(1) as u32)?;
        let grid = state.grid_mut(title)?;
        for (dr, row) in rows.iter().enumerate() {
            for (dc, value) in row.iter().enumerate() {
                let cell = CellRef::new(origin.row + dr as u32, origin.col + dc as u32);
                put(grid, cell, value.clone());
            }
        }
        Ok(())
    }

    async fn write_cells(&self, title: &str, cells: &[CellUpdate]) -> Result<(), SinkError> {
        let mut state = self.lock();
        state.begin_write()?;
        let last_row = cells.iter().map(|u| u.cell.row).max().unwrap_or(0);
        state.check_rows(title, last_row)?;
        let grid = state.grid_mut(title)?;
        for update in cells {
            put(grid, update.cell, update.value.clone());
        }
        Ok(())
    }

    async fn ensure_rows(&self, title: &str, rows: u32) -> Result<(), SinkError> {
        let mut state = self.lock();
        match state.row_limits.get(title).copied() {
            Some(limit) if limit < rows => {
                state.begin_write()?;
                state.row_limits.insert(title.to_string(), rows);
            }
            _ => {}
        }
        Ok(())
    }

    async fn refresh_auth(&self) -> Result<(), SinkError> {
        self.lock().auth_refreshes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_trim_trailing_blank_rows_and_cells() {
        let sheet = MemorySheet::new().with_rows(
            "Inventory",
            &[&["Last Updated", ""], &["Part", "Part No.", ""], &["", ""]],
        );
        let rows = sheet.read_rows("Inventory", 2, 8).await.unwrap();
        assert_eq!(rows, vec![vec!["Part".to_string(), "Part No.".to_string()]]);
        assert_eq!(sheet.used_rows("Inventory"), 2);
    }

    #[tokio::test]
    async fn injected_failures_apply_per_write_call() {
        let sheet = MemorySheet::new()
            .with_rows("Inventory", &[])
            .failing_writes_after(1);
        let update = [CellUpdate::new(1, 1, CellValue::count(3))];
        sheet.write_cells("Inventory", &update).await.unwrap();
        let err = sheet.write_cells("Inventory", &update).await.unwrap_err();
        assert!(matches!(err, SinkError::Api { status: 503, .. }));
        assert_eq!(sheet.cell_a1("Inventory", "A1"), CellValue::Number(3));
    }

    #[tokio::test]
    async fn writes_past_the_grid_fail_until_it_grows() {
        let sheet = MemorySheet::new().with_rows("Inventory", &[]).with_row_limit("Inventory", 6);
        let block = [vec![CellValue::text("a")], vec![CellValue::text("b")]];
        let err = sheet
            .write_block("Inventory", CellRef::new(6, 1), &block)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exceeds grid limits"));
        assert_eq!(sheet.cell_a1("Inventory", "A6"), CellValue::Empty);

        sheet.ensure_rows("Inventory", 7).await.unwrap();
        sheet.write_block("Inventory", CellRef::new(6, 1), &block).await.unwrap();
        assert_eq!(sheet.row_limit("Inventory"), Some(7));
        assert_eq!(sheet.cell_a1("Inventory", "A7").display(), "b");
    }

    #[tokio::test]
    async fn auth_expiry_is_reported_once() {
        let sheet = MemorySheet::new().with_rows("Inventory", &[]).expiring_auth_once();
        let update = [CellUpdate::new(2, 3, CellValue::text("x"))];
        assert!(sheet.write_cells("Inventory", &update).await.unwrap_err().is_auth_expired());
        sheet.write_cells("Inventory", &update).await.unwrap();
        assert_eq!(sheet.write_calls(), 1);
    }
}
