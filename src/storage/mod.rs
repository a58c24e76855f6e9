//! Storage layer: the application database and its unit of work.
//!
//! Services never hold a connection across calls. Each operation runs in
//! [`Database::unit_of_work`], which commits when the closure returns `Ok`
//! and rolls back otherwise.
//!
//! ## Database URLs
//!
//! - `sqlite:///taskdeck.db` - file relative to the working directory
//! - `sqlite:////var/lib/taskdeck.db` - absolute path
//! - `sqlite://` or `sqlite:///:memory:` - in-memory database

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use rusqlite::{Connection, Transaction};
use tracing::{debug, warn};

use crate::config::DatabaseSettings;
use crate::{Error, Result};

const SQLITE_SCHEME: &str = "sqlite://";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Parsed database location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseUrl {
    /// SQLite file
    File(PathBuf),
    /// Private in-memory SQLite database
    Memory,
}

impl DatabaseUrl {
    /// Parse a `sqlite://` URL. Other schemes are rejected.
    pub fn parse(url: &str) -> Result<Self> {
        let trimmed = url.trim();
        let unsupported = || Error::UnsupportedDatabase(trimmed.to_string());

        let rest = trimmed.strip_prefix(SQLITE_SCHEME).ok_or_else(unsupported)?;
        if rest.is_empty() {
            return Ok(DatabaseUrl::Memory);
        }

        // sqlite://<host>/... is not meaningful for a local file
        let path = rest.strip_prefix('/').ok_or_else(unsupported)?;
        match path {
            "" | ":memory:" => Ok(DatabaseUrl::Memory),
            path => Ok(DatabaseUrl::File(PathBuf::from(path))),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            DatabaseUrl::File(path) => Some(path),
            DatabaseUrl::Memory => None,
        }
    }
}

impl fmt::Display for DatabaseUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseUrl::File(path) => write!(f, "{}/{}", SQLITE_SCHEME, path.display()),
            DatabaseUrl::Memory => write!(f, "{}/:memory:", SQLITE_SCHEME),
        }
    }
}

/// Handle to the application database.
///
/// File databases open a fresh connection per unit of work. An in-memory
/// database keeps one connection so its contents outlive a single unit.
pub struct Database {
    url: DatabaseUrl,
    shared: Option<Mutex<Connection>>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database").field("url", &self.url).finish()
    }
}

impl Database {
    /// Prepare the database at `url`, creating parent directories of a file.
    pub fn open(url: DatabaseUrl) -> Result<Self> {
        let shared = match &url {
            DatabaseUrl::File(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                None
            }
            DatabaseUrl::Memory => Some(Mutex::new(Connection::open_in_memory()?)),
        };

        debug!(event = "storage.database.opened", url = %url);
        Ok(Self { url, shared })
    }

    /// Database named by the resolved settings.
    pub fn from_settings(settings: &DatabaseSettings) -> Result<Self> {
        Self::open(DatabaseUrl::parse(&settings.url.value)?)
    }

    pub fn url(&self) -> &DatabaseUrl {
        &self.url
    }

    /// Run `f` inside a transaction.
    ///
    /// Commits when `f` returns `Ok`. On `Err` the transaction is rolled
    /// back and the error is returned unchanged.
    pub fn unit_of_work<R>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<R>) -> Result<R> {
        match (&self.shared, &self.url) {
            (Some(shared), _) => {
                let mut conn = shared.lock().unwrap_or_else(PoisonError::into_inner);
                run_in_transaction(&mut conn, f)
            }
            (None, DatabaseUrl::File(path)) => {
                let mut conn = Connection::open(path)?;
                conn.busy_timeout(BUSY_TIMEOUT)?;
                run_in_transaction(&mut conn, f)
            }
            (None, DatabaseUrl::Memory) => {
                Err(Error::Other("in-memory database has no connection".to_string()))
            }
        }
    }
}

fn run_in_transaction<R>(
    conn: &mut Connection,
    f: impl FnOnce(&Transaction<'_>) -> Result<R>,
) -> Result<R> {
    let tx = conn.transaction()?;
    match f(&tx) {
        Ok(value) => {
            tx.commit()?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback() {
                warn!(
                    event = "storage.unit_of_work.rollback_failed",
                    error = %rollback,
                    "Rollback failed after unit of work error"
                );
            }
            debug!(event = "storage.unit_of_work.rolled_back", error = %e);
            Err(e)
        }
    }
}
