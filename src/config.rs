//! Configuration file of the backup tool.
//!
//! Every value can be overridden on the command line, see [Cli](crate::cli::Cli).

use std::io;
use std::path::{Path, PathBuf};

use derive_more::{Display, Error, From};

use crate::mysql::Connection;
use crate::strategy::BackupThresholds;
use crate::util::retention::RetentionConfig;

const DEFAULT_MYSQLDUMP: &str = "mysqldump";
const DEFAULT_MYSQL: &str = "mysql";

/// Settings of the external tools.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DumpConfig {
    /// Path or name of the `mysqldump` binary.
    pub mysqldump_path: PathBuf,

    /// Path or name of the `mysql` client used to list tables.
    pub mysql_path: PathBuf,

    /// Number of table batches dumped at the same time.
    pub workers: usize,

    /// Gzip every dump file after it was written.
    pub compress: bool,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            mysqldump_path: DEFAULT_MYSQLDUMP.into(),
            mysql_path: DEFAULT_MYSQL.into(),
            workers: 1,
            compress: false,
        }
    }
}

#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
/// Complete configuration of a backup run.
pub struct BackupConfig {
    /// Server to back up.
    pub connection: Connection,

    /// Limits deciding how the database is dumped.
    pub thresholds: BackupThresholds,

    /// Number of backups kept per tier.
    pub retention: RetentionConfig,

    /// External tools.
    pub dump: DumpConfig,
}

#[derive(Debug, Display, Error, From)]
/// Invalid or unreadable configuration.
pub enum ConfigError {
    /// Reading the config file failed.
    #[display("Reading the config file failed: {_0}")]
    Read(io::Error),
    /// The config file isn't valid TOML for [BackupConfig].
    #[display("Parsing the config file failed: {_0}")]
    Parse(toml::de::Error),
    /// Batches must contain at least one row.
    #[display("Batch size must be greater than zero")]
    #[from(ignore)]
    ZeroBatchSize,
    /// At least one worker is needed to dump anything.
    #[display("Number of workers must be greater than zero")]
    #[from(ignore)]
    ZeroWorkers,
    /// Daily backups hold the dumps of every run.
    #[display("Daily retention must keep at least one backup")]
    #[from(ignore)]
    ZeroDailyRetention,
    /// No database to back up.
    #[display("Database name must not be empty")]
    #[from(ignore)]
    EmptyDatabase,
    /// The output root exists but isn't a directory.
    #[display("Output directory is not a directory: {}", _0.display())]
    #[from(ignore)]
    OutputRootNotADirectory(#[error(ignore)] PathBuf),
}

impl BackupConfig {
    /// Reads the config at `path`.
    ///
    /// A missing config file is created with the default configuration.
    pub fn load_or_init(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(config_str) => Ok(toml::from_str(&config_str)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!(
                    "Writing default config to {} because it doesn't exist yet",
                    path.display()
                );
                let default_config = Self::default();
                match toml::to_string_pretty(&default_config) {
                    Ok(config_str) => {
                        if let Err(e) = std::fs::write(path, config_str) {
                            log::warn!("Writing default config to {} failed {e}", path.display());
                        }
                    }
                    Err(e) => log::warn!("Serializing the default config failed: {e}"),
                }
                Ok(default_config)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Checks the configuration before anything is touched.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.thresholds.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.dump.workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.retention.daily == 0 {
            return Err(ConfigError::ZeroDailyRetention);
        }
        Ok(())
    }
}
