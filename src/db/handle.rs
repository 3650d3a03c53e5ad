use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};
use thiserror::Error;
use tracing::{info, warn};

use crate::error::StorageError;
use crate::AppResult;

const EXPECTED_JOURNAL_MODE: &str = "wal";

/// Open (creating if needed) a read-write connection to `path`.
pub fn open_connection(path: &Path) -> rusqlite::Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    Connection::open_with_flags(path, flags)
}

/// Open `path` read-only; used for files that must never be written again.
pub fn open_read_only(path: &Path) -> rusqlite::Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    Connection::open_with_flags(path, flags)
}

/// Apply the pragmas every live connection runs with.
///
/// rusqlite switches extended result codes on when it opens a handle, so error
/// values already carry the most specific code.
pub fn configure(conn: &Connection, busy_timeout: Duration) -> rusqlite::Result<()> {
    conn.busy_timeout(busy_timeout)?;
    let journal_mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", true)?;

    log_effective_pragmas(conn, &journal_mode, busy_timeout);
    Ok(())
}

fn log_effective_pragmas(conn: &Connection, journal_mode: &str, busy_timeout: Duration) {
    let sqlite_version: String = conn
        .query_row("select sqlite_version()", [], |row| row.get(0))
        .unwrap_or_else(|_| String::from("unknown"));
    let synchronous: i64 = conn
        .pragma_query_value(None, "synchronous", |row| row.get(0))
        .unwrap_or(i64::MIN);
    let foreign_keys: i64 = conn
        .pragma_query_value(None, "foreign_keys", |row| row.get(0))
        .unwrap_or(i64::MIN);

    info!(
        target: "pantry",
        event = "db_open",
        sqlite_version = %sqlite_version,
        journal_mode = %journal_mode,
        synchronous,
        foreign_keys,
        busy_timeout_ms = busy_timeout.as_millis() as u64
    );

    if !journal_mode.eq_ignore_ascii_case(EXPECTED_JOURNAL_MODE) {
        warn!(
            target: "pantry",
            event = "db_open_warning",
            msg = "journal_mode != WAL; running with reduced crash safety"
        );
    }
}

/// Which step of bringing up a connection failed.
///
/// A refused `sqlite3_open` says nothing about the bytes on disk, while a failed
/// configure step is the first real read of the file and must be classified.
#[derive(Debug, Error)]
pub enum OpenFailure {
    #[error("could not open database file: {0}")]
    Connect(#[source] rusqlite::Error),
    #[error("could not configure database connection: {0}")]
    Configure(#[source] rusqlite::Error),
}

impl OpenFailure {
    pub fn sqlite(&self) -> &rusqlite::Error {
        match self {
            OpenFailure::Connect(err) | OpenFailure::Configure(err) => err,
        }
    }

    pub fn into_sqlite(self) -> rusqlite::Error {
        match self {
            OpenFailure::Connect(err) | OpenFailure::Configure(err) => err,
        }
    }
}

/// Sole owner of the live connection. Only touched from inside the access serializer.
pub struct StorageHandle {
    path: PathBuf,
    busy_timeout: Duration,
    conn: Mutex<Option<Connection>>,
}

impl StorageHandle {
    pub fn new(path: impl Into<PathBuf>, busy_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            busy_timeout,
            conn: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn busy_timeout(&self) -> Duration {
        self.busy_timeout
    }

    pub fn is_open(&self) -> bool {
        self.conn
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Open and configure a fresh connection, replacing (and closing) any current one.
    ///
    /// Opening is lazy in SQLite; a file that is not a database usually only
    /// fails here, when the journal-mode pragma first reads the header.
    pub fn open(&self) -> Result<(), OpenFailure> {
        self.close();
        let conn = open_connection(&self.path).map_err(OpenFailure::Connect)?;
        configure(&conn, self.busy_timeout).map_err(OpenFailure::Configure)?;
        *self.conn.lock().unwrap_or_else(|e| e.into_inner()) = Some(conn);
        Ok(())
    }

    /// Release the connection. A closed handle stays closed.
    pub fn close(&self) {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(conn) = conn {
            if let Err((_conn, err)) = conn.close() {
                // The returned handle is dropped here, which closes it regardless.
                warn!(
                    target: "pantry",
                    event = "db_close_failed",
                    path = %self.path.display(),
                    error = %err
                );
            }
        }
    }

    /// Borrow the live connection for one scoped unit of work.
    ///
    /// Statements prepared inside `work` are dropped before this returns, so a
    /// caller that sees an error can hand off to recovery with nothing open.
    pub fn with_connection<T, F>(&self, work: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(conn) => work(conn).map_err(StorageError::from),
            None => Err(StorageError::Closed),
        }
    }

    /// Like [`StorageHandle::with_connection`] for maintenance steps that report `AppError`.
    pub fn try_with<T, F>(&self, work: F) -> AppResult<T>
    where
        F: FnOnce(&Connection) -> AppResult<T>,
    {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(conn) => work(conn),
            None => Err(StorageError::Closed.into()),
        }
    }
}

impl Drop for StorageHandle {
    fn drop(&mut self) {
        self.close();
    }
}
