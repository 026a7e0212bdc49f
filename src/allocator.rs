//! Group block allocation and writing.
//!
//! The group block is the run of columns from `block_start` (inclusive) to
//! `block_end` (exclusive). Group names are appended after each row's last
//! filled block slot. Work happens in three phases that never interleave:
//!
//! 1. [`plan_block_width`] reads every row and returns the width the block
//!    must have.
//! 2. [`grow_block`] inserts all missing columns in one run right before
//!    `block_end`.
//! 3. [`write_groups`] fills the slots. No columns are added here, and a write
//!    at or past `block_end` aborts the whole pass.
//!
//! [`append_groups`] drives all three.

use crate::error::{Result, SyncError};
use crate::groups::GroupIndex;
use crate::models::normalize_email;
use crate::table::{AnonymousNaming, RecordTable, Row};
use tracing::{debug, info};

/// Names of the two sentinel columns bounding the group block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupBlock {
    pub start: String,
    pub end: String,
}

impl GroupBlock {
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    /// Resolve the sentinel positions against the table's current columns
    pub fn resolve(&self, table: &RecordTable) -> Result<BlockBounds> {
        let start = table.position(&self.start).ok_or_else(|| {
            SyncError::schema(format!("group block start column '{}' not found", self.start))
        })?;
        let end = table.position(&self.end).ok_or_else(|| {
            SyncError::schema(format!("group block end column '{}' not found", self.end))
        })?;
        if start >= end {
            return Err(SyncError::schema(format!(
                "group block start '{}' (position {}) must come before end '{}' (position {})",
                self.start, start, self.end, end
            )));
        }
        Ok(BlockBounds { start, end })
    }
}

/// Resolved block positions; `end` is exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockBounds {
    pub start: usize,
    pub end: usize,
}

impl BlockBounds {
    pub fn width(&self) -> usize {
        self.end - self.start
    }

    /// Offset within the block of the row's last filled slot.
    ///
    /// Duplicate-named columns count as filled when any same-named cell in
    /// the row is filled.
    pub fn fill_cursor(&self, table: &RecordTable, row: &Row) -> Option<usize> {
        let columns = table.columns();
        (self.start..self.end)
            .rev()
            .find(|&pos| table.any_filled(row, &columns[pos]))
            .map(|pos| pos - self.start)
    }

    /// First block offset a new group may go to. Offset 0 is the primary
    /// group slot and is never written.
    pub fn write_start(&self, table: &RecordTable, row: &Row) -> usize {
        self.fill_cursor(table, row).map(|c| c + 1).unwrap_or(0).max(1)
    }
}

/// Result of the sizing pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPlan {
    pub current_width: usize,
    pub required_width: usize,
    pub rows_with_groups: usize,
}

impl BlockPlan {
    pub fn shortfall(&self) -> usize {
        self.required_width.saturating_sub(self.current_width)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub rows_updated: usize,
    pub cells_written: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationReport {
    pub plan: BlockPlan,
    pub added_columns: Vec<String>,
    pub writes: WriteSummary,
}

/// Row key extractor: the normalized email of a row, if it has one
pub fn email_key(column: &str) -> impl Fn(&RecordTable, &Row) -> Option<String> + '_ {
    move |table, row| table.value_by_name(row, column).map(normalize_email)
}

fn groups_for_row<'i, K>(
    index: &'i GroupIndex,
    table: &RecordTable,
    row: &Row,
    key: &K,
) -> &'i [String]
where
    K: Fn(&RecordTable, &Row) -> Option<String>,
{
    key(table, row)
        .map(|email| index.groups_for(&email))
        .unwrap_or(&[])
}

/// Phase 1: compute the block width every row's new groups need. Read-only.
pub fn plan_block_width<K>(
    table: &RecordTable,
    block: &GroupBlock,
    index: &GroupIndex,
    key: K,
) -> Result<BlockPlan>
where
    K: Fn(&RecordTable, &Row) -> Option<String>,
{
    let bounds = block.resolve(table)?;
    let current_width = bounds.width();
    let mut required_width = 0;
    let mut rows_with_groups = 0;

    for row in table.rows() {
        let groups = groups_for_row(index, table, row, &key);
        if groups.is_empty() {
            continue;
        }
        rows_with_groups += 1;
        let needed = bounds.write_start(table, row) + groups.len();
        required_width = required_width.max(needed);
    }

    let plan = BlockPlan {
        current_width,
        required_width,
        rows_with_groups,
    };
    debug!(
        current_width,
        required_width, rows_with_groups, "sized group block"
    );
    Ok(plan)
}

/// Phase 2: widen the block to the planned width with a single insertion of
/// anonymous columns right before the block end.
pub fn grow_block(
    table: RecordTable,
    block: &GroupBlock,
    plan: &BlockPlan,
    naming: &AnonymousNaming,
) -> Result<(RecordTable, Vec<String>)> {
    let bounds = block.resolve(&table)?;
    if bounds.width() != plan.current_width {
        return Err(SyncError::schema(format!(
            "group block is {} columns wide but was sized at {}",
            bounds.width(),
            plan.current_width
        )));
    }
    let missing = plan.shortfall();
    if missing == 0 {
        return Ok((table, Vec::new()));
    }

    let first = naming.next_suffix(table.columns())?;
    if first.checked_add(missing as u64 - 1).is_none() {
        return Err(SyncError::schema(format!(
            "not enough anonymous column suffixes after {} for {} new columns",
            first, missing
        )));
    }
    let names: Vec<String> = (0..missing as u64).map(|i| naming.name(first + i)).collect();
    info!(
        added = missing,
        from = bounds.width(),
        to = plan.required_width,
        "growing group block"
    );

    let grown = table.insert_columns(bounds.end, names.clone());
    Ok((grown, names))
}

/// Phase 3: write each row's groups after its last filled slot.
///
/// Bounds and cursors are recomputed against the table as it is now. Any
/// write that would land at or past the block end fails the whole pass with
/// an allocation invariant error.
pub fn write_groups<K>(
    mut table: RecordTable,
    block: &GroupBlock,
    index: &GroupIndex,
    key: K,
) -> Result<(RecordTable, WriteSummary)>
where
    K: Fn(&RecordTable, &Row) -> Option<String>,
{
    let bounds = block.resolve(&table)?;
    let mut summary = WriteSummary::default();

    for row_idx in 0..table.row_count() {
        let row = &table.rows()[row_idx];
        let groups = groups_for_row(index, &table, row, &key);
        if groups.is_empty() {
            continue;
        }
        let first = bounds.start + bounds.write_start(&table, row);

        for (offset, group) in groups.iter().enumerate() {
            let pos = first + offset;
            if pos >= bounds.end {
                return Err(SyncError::allocation_invariant(format!(
                    "row {}: group '{}' would be written at column {} but block end '{}' is at {}",
                    row_idx, group, pos, block.end, bounds.end
                )));
            }
            table.set_cell(row_idx, pos, Some(group.clone()));
            summary.cells_written += 1;
        }
        summary.rows_updated += 1;
    }

    debug!(
        rows_updated = summary.rows_updated,
        cells_written = summary.cells_written,
        "wrote groups"
    );
    Ok((table, summary))
}

/// Size, grow, then write: the full group allocation over one table
pub fn append_groups<K>(
    table: RecordTable,
    block: &GroupBlock,
    index: &GroupIndex,
    naming: &AnonymousNaming,
    key: K,
) -> Result<(RecordTable, AllocationReport)>
where
    K: Fn(&RecordTable, &Row) -> Option<String>,
{
    let plan = plan_block_width(&table, block, index, &key)?;
    let (table, added_columns) = grow_block(table, block, &plan, naming)?;
    let (table, writes) = write_groups(table, block, index, &key)?;

    Ok((
        table,
        AllocationReport {
            plan,
            added_columns,
            writes,
        },
    ))
}
