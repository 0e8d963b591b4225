//! Drives a complete backup run: inventory, planning, dumping and rotation.

use std::io;
use std::panic;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use chrono::NaiveDate;
use derive_more::{Display, Error, From};

use crate::config::{BackupConfig, ConfigError};
use crate::mysql::{self, redact, InventoryError, ProcessRunner, TableInventory, TaskFailure};
use crate::strategy::{self, DumpScope, DumpTask, PlanContext, PlanError, SizingClassification};
use crate::util::retention::{PruneReport, RetentionManager, TierKind};

/// A single backup of one database.
#[derive(Debug, Clone)]
pub struct BackupRun {
    pub database: String,
    /// Date the backup is filed under.
    pub execution_date: NaiveDate,
    /// Directory holding the tier directories.
    pub output_root: PathBuf,
}

impl BackupRun {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.database.trim().is_empty() {
            return Err(ConfigError::EmptyDatabase);
        }
        if self.output_root.exists() && !self.output_root.is_dir() {
            return Err(ConfigError::OutputRootNotADirectory(self.output_root.clone()));
        }
        Ok(())
    }
}

#[derive(Debug, Display, Error, From)]
/// Errors aborting a run before any dump was started.
pub enum RunError {
    /// The configuration is invalid.
    #[display("{_0}")]
    Configuration(ConfigError),
    /// The output directories couldn't be created.
    #[display("Preparing the output directories failed: {_0}")]
    Prepare(io::Error),
    /// The tables of the database couldn't be listed.
    #[display("Table inventory unavailable: {_0}")]
    InventoryUnavailable(InventoryError),
    /// No dump plan could be made.
    #[display("{_0}")]
    Plan(PlanError),
}

/// Result of a single dump task.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub enum TaskOutcome {
    Succeeded,
    Failed(TaskFailure),
    /// Not started because an earlier task failed.
    Skipped,
}

/// A dump task and what became of it.
#[derive(Clone, Debug, serde::Serialize)]
pub struct TaskReport {
    pub scope: DumpScope,
    /// File holding the dump, compressed if enabled.
    pub artifact: PathBuf,
    /// Command line with redacted credentials.
    pub command: String,
    pub outcome: TaskOutcome,
}

/// A backup stored in a retention tier.
#[derive(Clone, Debug, serde::Serialize)]
pub struct RecordedEntry {
    pub tier: TierKind,
    pub path: PathBuf,
}

/// Overall state of a finished run.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, serde::Serialize)]
pub enum RunStatus {
    #[display("complete")]
    Complete,
    /// At least one dump failed; written files were kept.
    #[display("incomplete")]
    Degraded,
}

/// Everything a run did.
#[derive(Clone, Debug, serde::Serialize)]
pub struct RunSummary {
    pub database: String,
    pub execution_date: String,
    pub dry_run: bool,
    pub classification: SizingClassification,
    pub total_rows: u64,
    pub tasks: Vec<TaskReport>,
    pub recorded: Vec<RecordedEntry>,
    pub pruned: Vec<PruneReport>,
    /// Non-fatal problems besides failed tasks.
    pub warnings: Vec<String>,
}

impl RunSummary {
    pub fn status(&self) -> RunStatus {
        if self.failed().next().is_some() {
            RunStatus::Degraded
        } else {
            RunStatus::Complete
        }
    }

    /// Tasks that were started.
    pub fn attempted(&self) -> impl Iterator<Item = &TaskReport> {
        self.tasks
            .iter()
            .filter(|task| task.outcome != TaskOutcome::Skipped)
    }

    pub fn failed(&self) -> impl Iterator<Item = &TaskReport> {
        self.tasks
            .iter()
            .filter(|task| matches!(task.outcome, TaskOutcome::Failed(_)))
    }

    /// Writes the summary to the log.
    pub fn log(&self) {
        log::info!(
            target: "run",
            "Backup of {} ({}) {}: {} with {} rows",
            self.database,
            self.execution_date,
            self.status(),
            self.classification,
            self.total_rows
        );
        log::info!(
            target: "run",
            "Tasks attempted: {}/{}",
            self.attempted().count(),
            self.tasks.len()
        );
        for task in self.failed() {
            if let TaskOutcome::Failed(reason) = &task.outcome {
                log::error!(target: "run", "Task failed: {} ({reason})", task.artifact.display());
            }
        }
        for entry in &self.recorded {
            log::info!(target: "run", "Recorded {} backup: {}", entry.tier, entry.path.display());
        }
        for report in &self.pruned {
            log::info!(
                target: "run",
                "Pruned {} tier: {} removed, {} kept, {} failed",
                report.tier,
                report.evicted.len(),
                report.kept,
                report.failures.len()
            );
        }
        for warning in &self.warnings {
            log::warn!(target: "run", "{warning}");
        }
    }
}

/// Runs dump tasks. Shared by all workers of a run.
struct Executor<'a> {
    runner: &'a dyn ProcessRunner,
    dump_tool: &'a Path,
    compress: bool,
    dry_run: bool,
}

impl Executor<'_> {
    fn execute(&self, task: &DumpTask) -> TaskReport {
        let command = redact(&self.dump_tool.to_string_lossy(), &task.arguments);
        let mut report = TaskReport {
            scope: task.scope.clone(),
            artifact: task.output_path.clone(),
            command,
            outcome: TaskOutcome::Succeeded,
        };

        if self.dry_run {
            log::info!(target: "run", "Would run: {}", report.command);
            return report;
        }

        log::info!(target: "run", "Dumping to {}", task.output_path.display());
        log::debug!(target: "run", "Running: {}", report.command);
        let result = self
            .runner
            .run(self.dump_tool, &task.arguments)
            .and_then(|()| {
                if self.compress {
                    mysql::compress(&task.output_path)
                        .map_err(|e| TaskFailure::Compression(e.to_string()))
                } else {
                    Ok(task.output_path.clone())
                }
            });

        match result {
            Ok(artifact) => report.artifact = artifact,
            Err(failure) => {
                log::error!(target: "run", "Dump to {} failed: {failure}", task.output_path.display());
                report.outcome = TaskOutcome::Failed(failure);
            }
        }
        report
    }

    fn skip(&self, task: &DumpTask) -> TaskReport {
        TaskReport {
            scope: task.scope.clone(),
            artifact: task.output_path.clone(),
            command: redact(&self.dump_tool.to_string_lossy(), &task.arguments),
            outcome: TaskOutcome::Skipped,
        }
    }

    /// Runs `tasks` in order until one fails.
    fn run_sequentially(&self, tasks: &[DumpTask], reports: &mut Vec<TaskReport>) {
        for task in tasks {
            if has_failed(reports) {
                reports.push(self.skip(task));
            } else {
                reports.push(self.execute(task));
            }
        }
    }

    /// Runs independent `tasks` on up to `workers` threads.
    ///
    /// No task is started after a failure; running tasks are awaited and
    /// all their failures reported.
    fn run_concurrently(&self, tasks: &[DumpTask], workers: usize, reports: &mut Vec<TaskReport>) {
        let next = &AtomicUsize::new(0);
        let failed = &AtomicBool::new(has_failed(reports));

        let mut done: Vec<(usize, TaskReport)> = thread::scope(|scope| {
            let handles: Vec<_> = (0..workers.min(tasks.len()))
                .map(|_| {
                    scope.spawn(move || {
                        let mut done = Vec::new();
                        while !failed.load(Ordering::SeqCst) {
                            let index = next.fetch_add(1, Ordering::SeqCst);
                            let Some(task) = tasks.get(index) else {
                                break;
                            };
                            let report = self.execute(task);
                            if matches!(report.outcome, TaskOutcome::Failed(_)) {
                                failed.store(true, Ordering::SeqCst);
                            }
                            done.push((index, report));
                        }
                        done
                    })
                })
                .collect();

            handles
                .into_iter()
                .flat_map(|handle| handle.join().unwrap_or_else(|e| panic::resume_unwind(e)))
                .collect()
        });

        done.sort_by_key(|(index, _)| *index);
        let mut done = done.into_iter().peekable();
        for (index, task) in tasks.iter().enumerate() {
            match done.next_if(|(done_index, _)| *done_index == index) {
                Some((_, report)) => reports.push(report),
                None => reports.push(self.skip(task)),
            }
        }
    }
}

fn has_failed(reports: &[TaskReport]) -> bool {
    reports
        .iter()
        .any(|report| matches!(report.outcome, TaskOutcome::Failed(_)))
}

/// Performs [BackupRun]s with the given collaborators.
pub struct Orchestrator<'a> {
    config: &'a BackupConfig,
    inventory: &'a dyn TableInventory,
    runner: &'a dyn ProcessRunner,
    dump_tool: PathBuf,
    dry_run: bool,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        config: &'a BackupConfig,
        inventory: &'a dyn TableInventory,
        runner: &'a dyn ProcessRunner,
        dump_tool: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config,
            inventory,
            runner,
            dump_tool: dump_tool.into(),
            dry_run: false,
        }
    }

    /// On a dry run the plan is logged but nothing is written or removed.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Backs up the database of `run`.
    ///
    /// Returns an error only if the run was aborted before dumping. Failed
    /// dumps are reported in the [RunSummary].
    pub fn run(&self, run: &BackupRun) -> Result<RunSummary, RunError> {
        let config = self.config;
        let dry_run = self.dry_run;
        let date = run.execution_date;

        config.validate()?;
        run.validate()?;

        let mut retention = RetentionManager::new(&run.output_root, &run.database, &config.retention);
        if !dry_run {
            retention.ensure_tier_directories()?;
        }

        let tables = self.inventory.tables(&run.database)?;
        let classification = strategy::classify(&tables, &config.thresholds);
        log::info!(
            target: "run",
            "Backing up {} tables of {} as {classification}",
            tables.len(),
            run.database
        );

        let entry_dir = retention.entry_dir(TierKind::Daily, date);
        let ctx = PlanContext {
            connection: &config.connection,
            database: &run.database,
            execution_date: date,
            entry_dir: &entry_dir,
        };
        let tasks = strategy::plan(classification, &tables, &config.thresholds, &ctx)?;

        if !dry_run {
            std::fs::create_dir_all(&entry_dir)?;
        }

        let executor = Executor {
            runner: self.runner,
            dump_tool: &self.dump_tool,
            compress: config.dump.compress,
            dry_run,
        };
        let mut reports = Vec::with_capacity(tasks.len());
        let mut rest = tasks.as_slice();
        while !rest.is_empty() {
            let independent = rest
                .iter()
                .take_while(|task| task.is_independent())
                .count();
            if independent > 1 && config.dump.workers > 1 {
                let (group, tail) = rest.split_at(independent);
                executor.run_concurrently(group, config.dump.workers, &mut reports);
                rest = tail;
            } else {
                let (task, tail) = rest.split_at(1);
                executor.run_sequentially(task, &mut reports);
                rest = tail;
            }
        }

        let mut summary = RunSummary {
            database: run.database.clone(),
            execution_date: date.to_string(),
            dry_run,
            classification,
            total_rows: strategy::total_rows(&tables),
            tasks: reports,
            recorded: Vec::new(),
            pruned: Vec::new(),
            warnings: Vec::new(),
        };

        if summary.status() == RunStatus::Degraded {
            summary.warnings.push(format!(
                "Backup is incomplete, kept partial files in {} without rotating",
                entry_dir.display()
            ));
        } else if dry_run {
            for kind in TierKind::ALL {
                summary.pruned.push(retention.prune(kind, true));
            }
        } else {
            for kind in TierKind::ALL {
                match retention.record_entry(kind, date, &entry_dir) {
                    Ok(Some(path)) => summary.recorded.push(RecordedEntry { tier: kind, path }),
                    Ok(None) => {}
                    Err(e) => summary
                        .warnings
                        .push(format!("Recording the {kind} backup failed: {e}")),
                }
            }
            for kind in TierKind::ALL {
                summary.pruned.push(retention.prune(kind, false));
            }
        }
        retention.settle();

        Ok(summary)
    }
}
