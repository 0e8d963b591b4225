use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use derive_more::{Display, Error};
use flate2::write::GzEncoder;
use flate2::Compression;

use super::redact;

/// Runs the external dump tool.
///
/// Tasks of a batched dump may be run from several threads at once.
pub trait ProcessRunner: Sync {
    /// Runs `program` with `args` until it exits.
    fn run(&self, program: &Path, args: &[String]) -> Result<(), TaskFailure>;
}

/// Reasons a single dump task failed.
#[derive(Clone, Debug, Display, Error, PartialEq, Eq, serde::Serialize)]
pub enum TaskFailure {
    /// The dump tool couldn't be started.
    #[display("Failed to execute the dump tool: {_0}")]
    NotRun(#[error(ignore)] String),
    /// The dump tool exited unsuccessfully.
    #[display("Dump tool exited with {status}: {stderr}")]
    Exited { status: String, stderr: String },
    /// Compressing the dump failed.
    #[display("Compressing the dump failed: {_0}")]
    Compression(#[error(ignore)] String),
}

/// [ProcessRunner] spawning real processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandRunner;

impl ProcessRunner for CommandRunner {
    fn run(&self, program: &Path, args: &[String]) -> Result<(), TaskFailure> {
        log::trace!(target: "mysql::dump", "Running: {}", redact(&program.to_string_lossy(), args));

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| TaskFailure::NotRun(e.to_string()))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(TaskFailure::Exited {
                status: output.status.to_string(),
                stderr: stderr.trim_end().to_string(),
            });
        }
        if !stderr.is_empty() {
            log::warn!(target: "mysql::dump", "{}", stderr.trim_end());
        }

        Ok(())
    }
}

/// Resolves the dump tool either as a path or by searching `PATH`.
pub fn locate_dump_tool(program: &Path) -> Result<PathBuf, which::Error> {
    which::which(program)
}

/// Gzips `dump` next to itself and removes the uncompressed file.
///
/// Returns the path of the compressed file.
pub fn compress(dump: &Path) -> io::Result<PathBuf> {
    let mut compressed = dump.as_os_str().to_owned();
    compressed.push(".gz");
    let compressed = PathBuf::from(compressed);

    let mut reader = BufReader::new(File::open(dump)?);
    let mut encoder = GzEncoder::new(File::create_new(&compressed)?, Compression::default());
    io::copy(&mut reader, &mut encoder)?;
    encoder.finish()?;

    fs::remove_file(dump)?;
    log::debug!(target: "mysql::dump", "Compressed dump to: {}", compressed.display());

    Ok(compressed)
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use flate2::read::GzDecoder;

    use super::*;

    #[test]
    fn compress_replaces_dump() {
        let dir = tempfile::tempdir().unwrap();
        let dump = dir.path().join("shop_DATA_20240101.sql");
        fs::write(&dump, "INSERT INTO t VALUES (1);\n").unwrap();

        let compressed = compress(&dump).unwrap();
        assert_eq!(compressed, dir.path().join("shop_DATA_20240101.sql.gz"));
        assert!(!dump.exists());

        let mut content = String::new();
        GzDecoder::new(File::open(compressed).unwrap())
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "INSERT INTO t VALUES (1);\n");
    }

    #[test]
    fn missing_program_is_not_run() {
        let failure = CommandRunner
            .run(Path::new("/nonexistent/mysqldump"), &[])
            .unwrap_err();
        assert!(matches!(failure, TaskFailure::NotRun(_)));
    }

    #[test]
    fn missing_dump_tool_is_not_located() {
        assert!(locate_dump_tool(Path::new("/nonexistent/mysqldump")).is_err());
    }
}
