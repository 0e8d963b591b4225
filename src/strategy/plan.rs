//! Turns a [SizingClassification] into the dump invocations of a run.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use derive_more::{Display, Error};

use super::{BackupThresholds, SizingClassification};
use crate::mysql::{Connection, TableInfo};

/// `LIMIT` row count meaning "all remaining rows" in MySQL.
const ALL_REMAINING_ROWS: u64 = u64::MAX;

/// Options shared by every task producing table data.
///
/// The schema is expected to exist on restore, so neither databases,
/// tables nor triggers are created by data dumps.
const DATA_ONLY_FLAGS: [&str; 3] = ["--no-create-db", "--no-create-info", "--skip-triggers"];
const SCHEMA_ONLY_FLAGS: [&str; 1] = ["--no-data"];

/// What part of the database a [DumpTask] covers.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub enum DumpScope {
    /// Data of all tables in one file.
    WholeDatabase,
    /// Table definitions only.
    SchemaOnly,
    /// Data of all tables, without table definitions.
    DataOnly,
    /// Data of some tables, or a slice of a single table.
    TableBatch {
        tables: Vec<String>,
        /// Unique within a plan, starting at 1.
        batch_index: usize,
        /// Rows of a single table covered by this batch.
        rows: Option<RowWindow>,
    },
}

/// A window `[offset, offset + count)` of a table's rows.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct RowWindow {
    pub offset: u64,
    pub count: u64,
    /// The last window of a table also picks up rows that were added
    /// after the row count was estimated.
    pub open_ended: bool,
}

impl RowWindow {
    /// The `--where` option selecting the window in `primary_key` order.
    ///
    /// mysqldump appends the condition verbatim after `WHERE`, so ordering
    /// has to happen in here. `--order-by-primary` would place its
    /// `ORDER BY` after the `LIMIT`.
    fn where_clause(&self, primary_key: &[String]) -> String {
        let limit = if self.open_ended {
            ALL_REMAINING_ROWS
        } else {
            self.count
        };
        let order_by = primary_key
            .iter()
            .map(|column| quote_identifier(column))
            .collect::<Vec<_>>()
            .join(",");
        format!("--where=1 ORDER BY {order_by} LIMIT {},{limit}", self.offset)
    }
}

/// Quotes `name` for use as a MySQL identifier.
fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// A single invocation of the dump tool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DumpTask {
    pub scope: DumpScope,
    pub output_path: PathBuf,
    /// Complete argument list, including credentials.
    pub arguments: Vec<String>,
}

impl DumpTask {
    /// Whether the task may run concurrently with other independent tasks.
    pub fn is_independent(&self) -> bool {
        matches!(self.scope, DumpScope::TableBatch { .. })
    }
}

/// Everything besides the classification a plan depends on.
#[derive(Debug, Clone, Copy)]
pub struct PlanContext<'a> {
    pub connection: &'a Connection,
    pub database: &'a str,
    pub execution_date: NaiveDate,
    /// Directory receiving the dump files.
    pub entry_dir: &'a Path,
}

impl PlanContext<'_> {
    fn output_path(&self, scope: &str, batch_index: Option<usize>) -> PathBuf {
        let stamp = self.execution_date.format("%Y%m%d");
        let batch = batch_index
            .map(|index| format!("_batch{index}"))
            .unwrap_or_default();
        self.entry_dir
            .join(format!("{}_{scope}_{stamp}{batch}.sql", self.database))
    }

    fn task(
        &self,
        scope: DumpScope,
        output_path: PathBuf,
        flags: &[&str],
        extra: impl IntoIterator<Item = String>,
        tables: &[String],
    ) -> DumpTask {
        let mut arguments = self.connection.args();
        arguments.push("--single-transaction".into());
        arguments.extend(flags.iter().map(|flag| flag.to_string()));
        arguments.extend(extra);
        arguments.push(format!("--result-file={}", output_path.display()));
        arguments.push(self.database.to_string());
        arguments.extend(tables.iter().cloned());

        DumpTask {
            scope,
            output_path,
            arguments,
        }
    }
}

#[derive(Debug, Display, Error, PartialEq, Eq)]
/// Errors on planning the dump of a database.
pub enum PlanError {
    /// The thresholds can't produce a plan.
    #[display("Invalid configuration: {_0}")]
    Configuration(#[error(ignore)] &'static str),
    /// Batching was requested for a database without tables.
    #[display("Nothing to batch: database {_0} has no tables")]
    EmptyInventory(#[error(ignore)] String),
}

/// Builds the ordered list of dump invocations for `classification`.
pub fn plan(
    classification: SizingClassification,
    tables: &[TableInfo],
    thresholds: &BackupThresholds,
    ctx: &PlanContext<'_>,
) -> Result<Vec<DumpTask>, PlanError> {
    if thresholds.batch_size == 0 {
        return Err(PlanError::Configuration("batch size must be greater than zero"));
    }

    let tasks = match classification {
        SizingClassification::SingleFile => vec![ctx.task(
            DumpScope::WholeDatabase,
            ctx.output_path("DATA", None),
            &DATA_ONLY_FLAGS,
            [],
            &[],
        )],
        SizingClassification::SplitSchemaAndData => vec![
            ctx.task(
                DumpScope::SchemaOnly,
                ctx.output_path("SCHEMA", None),
                &SCHEMA_ONLY_FLAGS,
                [],
                &[],
            ),
            ctx.task(
                DumpScope::DataOnly,
                ctx.output_path("DATA", None),
                &DATA_ONLY_FLAGS,
                [],
                &[],
            ),
        ],
        SizingClassification::BatchedByTable => {
            if tables.is_empty() {
                return Err(PlanError::EmptyInventory(ctx.database.to_string()));
            }
            plan_batches(tables, thresholds, ctx)
        }
    };

    log::debug!(target: "strategy::plan", "Planned {} dump task(s) ({classification})", tasks.len());
    Ok(tasks)
}

fn plan_batches(
    tables: &[TableInfo],
    thresholds: &BackupThresholds,
    ctx: &PlanContext<'_>,
) -> Vec<DumpTask> {
    let batch_size = thresholds.batch_size;
    let mut tasks = Vec::new();
    let mut next_index = 1;

    let mut bin: Vec<String> = Vec::new();
    let mut bin_rows = 0u64;
    let flush_bin = |bin: &mut Vec<String>, tasks: &mut Vec<DumpTask>, next_index: &mut usize| {
        if bin.is_empty() {
            return;
        }
        let tables = std::mem::take(bin);
        let batch_index = *next_index;
        *next_index += 1;
        tasks.push(ctx.task(
            DumpScope::TableBatch {
                tables: tables.clone(),
                batch_index,
                rows: None,
            },
            ctx.output_path("DATA", Some(batch_index)),
            &DATA_ONLY_FLAGS,
            [],
            &tables,
        ));
    };

    for table in tables {
        if table.row_count > thresholds.table_row_threshold && table.primary_key.is_empty() {
            // without a key the windows have no stable order and could overlap
            log::warn!(
                target: "strategy::plan",
                "Table {} ({} rows) has no primary key and is dumped in a single batch",
                table.name,
                table.row_count
            );
            let batch_index = next_index;
            next_index += 1;

            let tables = [table.name.clone()];
            tasks.push(ctx.task(
                DumpScope::TableBatch {
                    tables: tables.to_vec(),
                    batch_index,
                    rows: None,
                },
                ctx.output_path(&file_name_component(&table.name), Some(batch_index)),
                &DATA_ONLY_FLAGS,
                [],
                &tables,
            ));
        } else if table.row_count > thresholds.table_row_threshold {
            let batches = table.row_count.div_ceil(batch_size);
            log::debug!(
                target: "strategy::plan",
                "Table {} ({} rows) is split into {batches} batches",
                table.name,
                table.row_count
            );

            for batch in 0..batches {
                let offset = batch * batch_size;
                let window = RowWindow {
                    offset,
                    count: batch_size.min(table.row_count - offset),
                    open_ended: batch + 1 == batches,
                };
                let batch_index = next_index;
                next_index += 1;

                let tables = [table.name.clone()];
                tasks.push(ctx.task(
                    DumpScope::TableBatch {
                        tables: tables.to_vec(),
                        batch_index,
                        rows: Some(window),
                    },
                    ctx.output_path(&file_name_component(&table.name), Some(batch_index)),
                    &DATA_ONLY_FLAGS,
                    [window.where_clause(&table.primary_key)],
                    &tables,
                ));
            }
        } else {
            if !bin.is_empty() && bin_rows.saturating_add(table.row_count) > batch_size {
                flush_bin(&mut bin, &mut tasks, &mut next_index);
                bin_rows = 0;
            }
            bin.push(table.name.clone());
            bin_rows = bin_rows.saturating_add(table.row_count);
        }
    }
    flush_bin(&mut bin, &mut tasks, &mut next_index);

    tasks
}

/// Replaces characters that don't belong into a file name.
fn file_name_component(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '$') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
