use std::io;
use std::path::PathBuf;
use std::process::Command;

use derive_more::{Display, Error};

use super::{redact, Connection, TableInfo};

/// Lists the base tables of the connected database with their estimated row
/// count and the columns of their primary key.
///
/// The schema is selected through the `--database` option of the client,
/// so the query itself never contains user input.
pub const TABLES_QUERY: &str = "SELECT t.table_name, t.table_rows, \
    COALESCE((SELECT GROUP_CONCAT(k.column_name ORDER BY k.ordinal_position SEPARATOR '\u{1f}') \
        FROM information_schema.key_column_usage k \
        WHERE k.table_schema = t.table_schema AND k.table_name = t.table_name \
        AND k.constraint_name = 'PRIMARY'), '') \
    FROM information_schema.tables t \
    WHERE t.table_schema = DATABASE() AND t.table_type = 'BASE TABLE' \
    ORDER BY t.table_name";

/// Separates the primary key columns in the output of [TABLES_QUERY].
const KEY_SEPARATOR: char = '\u{1f}';

/// Source of the tables of a database.
pub trait TableInventory {
    /// Returns all tables of `database` with their row counts.
    fn tables(&self, database: &str) -> Result<Vec<TableInfo>, InventoryError>;
}

#[derive(Debug, Display, Error)]
/// Errors on listing the tables of a database.
pub enum InventoryError {
    /// The `mysql` client couldn't be executed.
    #[display("Failed to execute the mysql client: {_0}")]
    ClientNotRun(io::Error),
    /// The `mysql` client reported an error.
    #[display("mysql client exited with {status}: {stderr}")]
    ClientFailed { status: String, stderr: String },
    /// The client output didn't match the query.
    #[display("Unexpected row in table listing: {_0:?}")]
    MalformedRow(#[error(ignore)] String),
}

/// Table inventory backed by the `mysql` command line client.
#[derive(Debug, Clone)]
pub struct MysqlClient {
    program: PathBuf,
    connection: Connection,
}

impl MysqlClient {
    pub fn new(program: impl Into<PathBuf>, connection: Connection) -> Self {
        Self {
            program: program.into(),
            connection,
        }
    }

    fn args(&self, database: &str) -> Vec<String> {
        let mut args = self.connection.args();
        args.push("--batch".into());
        args.push("--skip-column-names".into());
        args.push(format!("--database={database}"));
        args.push(format!("--execute={TABLES_QUERY}"));
        args
    }
}

impl TableInventory for MysqlClient {
    fn tables(&self, database: &str) -> Result<Vec<TableInfo>, InventoryError> {
        let args = self.args(database);
        log::trace!(
            target: "mysql::inventory",
            "Running: {}",
            redact(&self.program.to_string_lossy(), &args)
        );

        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .map_err(InventoryError::ClientNotRun)?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(InventoryError::ClientFailed {
                status: output.status.to_string(),
                stderr: stderr.trim_end().to_string(),
            });
        }
        if !stderr.is_empty() {
            log::warn!(target: "mysql::inventory", "{}", stderr.trim_end());
        }

        let tables = parse_table_rows(&String::from_utf8_lossy(&output.stdout))?;
        log::info!(target: "mysql::inventory", "{} tables retrieved: {database}", tables.len());

        Ok(tables)
    }
}

/// Parses the tab separated `--batch` output of [TABLES_QUERY].
fn parse_table_rows(stdout: &str) -> Result<Vec<TableInfo>, InventoryError> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let malformed = || InventoryError::MalformedRow(line.to_string());
            let mut fields = line.split('\t');
            let (Some(name), Some(rows), Some(key), None) =
                (fields.next(), fields.next(), fields.next(), fields.next())
            else {
                return Err(malformed());
            };

            let row_count = match rows.trim() {
                // some engines don't report a row count
                "NULL" => 0,
                rows => rows.parse().map_err(|_| malformed())?,
            };
            let primary_key = key
                .split(KEY_SEPARATOR)
                .filter(|column| !column.is_empty())
                .map(unescape_field);

            Ok(TableInfo::new(unescape_field(name), row_count).with_primary_key(primary_key))
        })
        .collect()
}

/// Reverts the escaping `mysql --batch` applies to `\`, tab, newline and NUL.
fn unescape_field(field: &str) -> String {
    let mut unescaped = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            unescaped.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => unescaped.push('\\'),
            Some('t') => unescaped.push('\t'),
            Some('n') => unescaped.push('\n'),
            Some('0') => unescaped.push('\0'),
            Some(other) => {
                unescaped.push('\\');
                unescaped.push(other);
            }
            None => unescaped.push('\\'),
        }
    }
    unescaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_batch_output() {
        let stdout = "customers\t1200\tid\n\
            order_items\t8000000\torder_id\u{1f}line\n\
            sessions\tNULL\t\n";
        let tables = parse_table_rows(stdout).unwrap();
        assert_eq!(
            tables,
            vec![
                TableInfo::new("customers", 1200).with_primary_key(["id"]),
                TableInfo::new("order_items", 8_000_000).with_primary_key(["order_id", "line"]),
                TableInfo::new("sessions", 0),
            ]
        );
        assert!(TABLES_QUERY.contains(KEY_SEPARATOR));
    }

    #[test]
    fn escaped_names_are_restored() {
        let stdout = "a\\\\b\t10\tkey\\tpart\nline\\nbreak\t0\t\n";
        let tables = parse_table_rows(stdout).unwrap();
        assert_eq!(tables[0].name, "a\\b");
        assert_eq!(tables[0].primary_key, ["key\tpart"]);
        assert_eq!(tables[1].name, "line\nbreak");
        assert_eq!(unescape_field("trailing\\"), "trailing\\");
        assert_eq!(unescape_field("50\\%"), "50\\%");
    }

    #[test]
    fn empty_output_is_empty_inventory() {
        assert!(parse_table_rows("").unwrap().is_empty());
        assert!(parse_table_rows("\n").unwrap().is_empty());
    }

    #[test]
    fn rejects_malformed_rows() {
        assert!(matches!(
            parse_table_rows("orders"),
            Err(InventoryError::MalformedRow(_))
        ));
        assert!(matches!(
            parse_table_rows("orders\tmany\tid"),
            Err(InventoryError::MalformedRow(_))
        ));
        assert!(matches!(
            parse_table_rows("orders\t10"),
            Err(InventoryError::MalformedRow(_))
        ));
        assert!(matches!(
            parse_table_rows("orders\t10\tid\textra"),
            Err(InventoryError::MalformedRow(_))
        ));
    }

    #[test]
    fn database_name_is_passed_out_of_band() {
        let client = MysqlClient::new("mysql", Connection::default());
        let args = client.args("shop'; DROP TABLE users; --");
        assert!(args.contains(&"--database=shop'; DROP TABLE users; --".to_string()));
        assert!(args.contains(&format!("--execute={TABLES_QUERY}")));
        assert!(!TABLES_QUERY.contains("shop"));
    }
}
