//! Interaction with the MySQL server and its command line tools.

mod dump;
mod inventory;

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

pub use dump::{compress, locate_dump_tool, CommandRunner, ProcessRunner, TaskFailure};
pub use inventory::{InventoryError, MysqlClient, TableInventory, TABLES_QUERY};

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 3306;
const DEFAULT_USER: &str = "admin";

static PASSWORD_ARG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(--password=|-p).+$").expect("password pattern should be a valid regex")
});

/// A table of the backed up database.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableInfo {
    /// Name of the table.
    pub name: String,
    /// Number of rows as reported by `information_schema`.
    pub row_count: u64,
    /// Columns of the primary key in key order, empty if the table has none.
    pub primary_key: Vec<String>,
}

impl TableInfo {
    pub fn new(name: impl Into<String>, row_count: u64) -> Self {
        Self {
            name: name.into(),
            row_count,
            primary_key: Vec::new(),
        }
    }

    pub fn with_primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }
}

/// Credentials and address of the MySQL server.
#[derive(Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Connection {
    pub host: String,
    pub port: u16,
    pub user: String,

    /// Never written back to the config file.
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
}

impl Default for Connection {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            user: DEFAULT_USER.to_string(),
            password: None,
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "****"))
            .finish()
    }
}

impl Connection {
    /// Connection options understood by both `mysql` and `mysqldump`.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            format!("--host={}", self.host),
            format!("--port={}", self.port),
            format!("--user={}", self.user),
        ];
        if let Some(password) = &self.password {
            args.push(format!("--password={password}"));
        }
        args
    }
}

/// Renders a command line with every password argument masked.
pub fn redact<S: AsRef<str>>(program: &str, args: &[S]) -> String {
    let mut line = String::from(program);
    for arg in args {
        line.push(' ');
        line.push_str(&PASSWORD_ARG.replace(arg.as_ref(), "${1}****"));
    }
    line
}
