use crate::error::{AppError, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How long a read waits on a Calibre write lock before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Checkout pool of read-only connections.
///
/// A caller takes an idle connection or opens a fresh one, so concurrent
/// requests never wait on each other's queries. Connections are returned
/// after a successful query; at most `max_idle` are kept.
pub(crate) struct ConnectionPool {
    path: PathBuf,
    idle: Mutex<Vec<Connection>>,
    max_idle: usize,
}

impl ConnectionPool {
    pub(crate) fn new(path: PathBuf, max_idle: usize) -> Self {
        Self {
            path,
            idle: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Take an idle connection or open a new one.
    pub(crate) fn checkout(&self) -> Result<Connection> {
        if let Some(conn) = self.idle.lock().pop() {
            return Ok(conn);
        }
        open_read_only(&self.path)
    }

    /// Return a healthy connection for reuse.
    pub(crate) fn checkin(&self, conn: Connection) {
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(conn);
        }
    }

    /// Drop every idle connection, e.g. after the file disappeared.
    pub(crate) fn clear(&self) {
        let dropped = std::mem::take(&mut *self.idle.lock());
        if !dropped.is_empty() {
            tracing::debug!(count = dropped.len(), "Closed idle catalog connections");
        }
    }

    pub(crate) fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }
}

/// Open the catalog database without write access.
///
/// Fails with `Unavailable` when the file is missing or cannot be opened,
/// and with `Config` if the resulting connection would accept writes.
pub(crate) fn open_read_only(path: &Path) -> Result<Connection> {
    if !path.is_file() {
        return Err(AppError::Unavailable(format!(
            "catalog database not found at {}",
            path.display()
        )));
    }

    let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags).map_err(|e| {
        AppError::Unavailable(format!("failed to open {}: {}", path.display(), e))
    })?;

    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch("PRAGMA query_only = ON;")?;

    let query_only: i64 = conn.query_row("PRAGMA query_only", [], |row| row.get(0))?;
    if query_only != 1 {
        return Err(AppError::Config(format!(
            "catalog connection to {} is writable",
            path.display()
        )));
    }

    tracing::debug!(path = %path.display(), "Opened read-only catalog connection");
    Ok(conn)
}
