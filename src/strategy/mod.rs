//! Decides how a database is dumped based on its size.
//!
//! [classify] looks at the row counts of all tables and picks a
//! [SizingClassification]. The [plan] module turns that classification into
//! concrete [DumpTask](plan::DumpTask)s.

pub mod plan;

pub use plan::{plan, DumpScope, DumpTask, PlanContext, PlanError, RowWindow};

use derive_more::Display;

use crate::mysql::TableInfo;

/// Size limits and preferences that steer the dump strategy.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct BackupThresholds {
    /// Total rows of the database above which tables are dumped in batches.
    pub database_row_threshold: u64,

    /// Rows of a single table above which the table is split into batches.
    pub table_row_threshold: u64,

    /// Maximum rows dumped by a single batch.
    pub batch_size: u64,

    /// Dump schema and data into separate files even for small databases.
    pub force_split: bool,
}

impl Default for BackupThresholds {
    fn default() -> Self {
        Self {
            database_row_threshold: 10_000_000,
            table_row_threshold: 5_000_000,
            batch_size: 1_000_000,
            force_split: false,
        }
    }
}

/// The dump strategy chosen for a run.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, Hash, serde::Serialize)]
pub enum SizingClassification {
    /// One data-only file for the whole database.
    #[display("single file")]
    SingleFile,
    /// One schema file followed by one data file.
    #[display("split schema and data")]
    SplitSchemaAndData,
    /// Batches of tables and table slices.
    #[display("batched by table")]
    BatchedByTable,
}

/// Sum of all row counts.
pub fn total_rows(tables: &[TableInfo]) -> u64 {
    tables
        .iter()
        .fold(0u64, |total, table| total.saturating_add(table.row_count))
}

/// Classifies a database by its total row count.
///
/// Exceeding the database threshold always leads to
/// [BatchedByTable](SizingClassification::BatchedByTable), even if only a
/// split was requested. Reaching the threshold exactly does not count as
/// exceeding it.
pub fn classify(tables: &[TableInfo], thresholds: &BackupThresholds) -> SizingClassification {
    let total = total_rows(tables);

    let classification = if total > thresholds.database_row_threshold {
        SizingClassification::BatchedByTable
    } else if thresholds.force_split {
        SizingClassification::SplitSchemaAndData
    } else {
        SizingClassification::SingleFile
    };

    log::debug!(
        target: "strategy",
        "Classified {} tables with {total} rows (threshold {}, force split {}) as: {classification}",
        tables.len(),
        thresholds.database_row_threshold,
        thresholds.force_split,
    );

    classification
}
