use std::path::PathBuf;

use chrono::NaiveDate;
use clap::Parser;
use log::LevelFilter;

use crate::config::BackupConfig;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Verbosity of the command output.
    #[arg(long)]
    pub verbose: Option<LevelFilter>,

    /// Configuration file. Created with defaults if missing.
    #[arg(long, short = 'c', default_value = "mysql_backup.toml")]
    pub config: PathBuf,

    /// Database to back up.
    #[arg(long, short = 'd')]
    pub database: String,

    /// Folder receiving the daily, weekly and monthly backups. (Default: working directory)
    #[arg(long, short = 'o')]
    pub output_dir: Option<PathBuf>,

    /// Date the backup is filed under. (Default: today)
    #[arg(long)]
    pub date: Option<NaiveDate>,

    /// Simulative backup run.
    #[arg(long)]
    pub dry_run: bool,

    /// Write a JSON summary of the run to this file.
    #[arg(long)]
    pub summary_json: Option<PathBuf>,

    /// Host of the MySQL server.
    #[arg(long)]
    pub host: Option<String>,

    /// Port of the MySQL server.
    #[arg(long)]
    pub port: Option<u16>,

    /// User used for the backup.
    #[arg(long, short = 'u')]
    pub user: Option<String>,

    /// Password of the backup user.
    #[arg(long, env = "MYSQL_PWD", hide_env_values = true)]
    pub password: Option<String>,

    /// Total rows above which the database is dumped in batches.
    #[arg(long)]
    pub database_row_threshold: Option<u64>,

    /// Rows above which a single table is dumped in slices.
    #[arg(long)]
    pub table_row_threshold: Option<u64>,

    /// Maximum rows of a single batch.
    #[arg(long)]
    pub batch_size: Option<u64>,

    /// Dump schema and data into separate files.
    #[arg(long)]
    pub force_split: bool,

    /// Path of the mysqldump binary.
    #[arg(long)]
    pub mysqldump_path: Option<PathBuf>,

    /// Path of the mysql client.
    #[arg(long)]
    pub mysql_path: Option<PathBuf>,

    /// Number of table batches dumped at the same time.
    #[arg(long, short = 'j')]
    pub workers: Option<usize>,

    /// Gzip the dump files.
    #[arg(long)]
    pub compress: bool,

    /// Days of daily backups to keep.
    #[arg(long)]
    pub daily: Option<usize>,

    /// Weekly backups to keep.
    #[arg(long)]
    pub weekly: Option<usize>,

    /// Monthly backups to keep.
    #[arg(long)]
    pub monthly: Option<usize>,
}

impl Cli {
    /// Overrides values of `config` given on the command line.
    pub fn apply(&self, config: &mut BackupConfig) {
        let connection = &mut config.connection;
        if let Some(host) = &self.host {
            connection.host.clone_from(host);
        }
        if let Some(port) = self.port {
            connection.port = port;
        }
        if let Some(user) = &self.user {
            connection.user.clone_from(user);
        }
        if self.password.is_some() {
            connection.password.clone_from(&self.password);
        }

        let thresholds = &mut config.thresholds;
        if let Some(threshold) = self.database_row_threshold {
            thresholds.database_row_threshold = threshold;
        }
        if let Some(threshold) = self.table_row_threshold {
            thresholds.table_row_threshold = threshold;
        }
        if let Some(batch_size) = self.batch_size {
            thresholds.batch_size = batch_size;
        }
        thresholds.force_split |= self.force_split;

        let dump = &mut config.dump;
        if let Some(path) = &self.mysqldump_path {
            dump.mysqldump_path.clone_from(path);
        }
        if let Some(path) = &self.mysql_path {
            dump.mysql_path.clone_from(path);
        }
        if let Some(workers) = self.workers {
            dump.workers = workers;
        }
        dump.compress |= self.compress;

        let retention = &mut config.retention;
        if let Some(daily) = self.daily {
            retention.daily = daily;
        }
        if let Some(weekly) = self.weekly {
            retention.weekly = weekly;
        }
        if let Some(monthly) = self.monthly {
            retention.monthly = monthly;
        }
    }
}
