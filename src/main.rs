use std::process::ExitCode;

use chrono::Local;
use clap::Parser;

use mysql_backup_lib::cli::Cli;
use mysql_backup_lib::config::BackupConfig;
use mysql_backup_lib::mysql::{self, CommandRunner, MysqlClient};
use mysql_backup_lib::run::{BackupRun, Orchestrator, RunStatus};

fn main() -> ExitCode {
    let cli = Cli::parse();

    // init logger
    let mut env_logger = env_logger::builder();
    if let Some(level) = cli.verbose {
        env_logger.filter_level(level);
    }
    if let Err(e) = env_logger.try_init() {
        eprintln!("Initializing the logger failed: {e}");
    }

    let mut config = match BackupConfig::load_or_init(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    cli.apply(&mut config);

    if let Err(e) = config.validate() {
        log::error!("{e}");
        return ExitCode::FAILURE;
    }

    let dump_tool = match mysql::locate_dump_tool(&config.dump.mysqldump_path) {
        Ok(path) => path,
        Err(e) => {
            log::error!(
                "mysqldump binary can not be found at {} ({e}), please specify a correct --mysqldump-path",
                config.dump.mysqldump_path.display()
            );
            return ExitCode::FAILURE;
        }
    };

    let output_root = match cli.output_dir.clone().map_or_else(std::env::current_dir, Ok) {
        Ok(dir) => dir,
        Err(e) => {
            log::error!("Determining the working directory failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    if cli.dry_run {
        log::warn!("Running in dry-run mode");
    }

    let backup_run = BackupRun {
        database: cli.database.clone(),
        execution_date: cli.date.unwrap_or_else(|| Local::now().date_naive()),
        output_root,
    };

    let inventory = MysqlClient::new(&config.dump.mysql_path, config.connection.clone());
    let runner = CommandRunner;
    let summary = match Orchestrator::new(&config, &inventory, &runner, dump_tool)
        .dry_run(cli.dry_run)
        .run(&backup_run)
    {
        Ok(summary) => summary,
        Err(e) => {
            log::error!(target: "run", "Backup of {} aborted: {e}", backup_run.database);
            return ExitCode::FAILURE;
        }
    };

    summary.log();

    if let Some(path) = &cli.summary_json {
        match serde_json::to_string_pretty(&summary) {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    log::warn!("Writing the run summary to {} failed: {e}", path.display());
                }
            }
            Err(e) => log::warn!("Serializing the run summary failed: {e}"),
        }
    }

    match summary.status() {
        RunStatus::Complete => ExitCode::SUCCESS,
        RunStatus::Degraded => ExitCode::FAILURE,
    }
}
