//! Checkout/return pool of SQLite connections
//!
//! rusqlite connections are not Sync, so the ledger checks one out per
//! operation and returns it afterwards. A connection involved in a failed
//! transaction is discarded instead of returned; the pool reopens a fresh
//! one on a later checkout.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::{debug, warn};

use super::{Result, SpaceError};

pub struct SqlitePool {
    path: PathBuf,
    idle: Mutex<VecDeque<Connection>>,
    max_idle: usize,
}

impl SqlitePool {
    pub fn open(path: impl AsRef<Path>, max_idle: usize) -> Result<Self> {
        let pool = SqlitePool {
            path: path.as_ref().to_path_buf(),
            idle: Mutex::new(VecDeque::new()),
            max_idle,
        };
        // Open one eagerly so a bad path fails at startup, not first use.
        let conn = pool.open_connection()?;
        pool.put(conn);
        Ok(pool)
    }

    fn open_connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_millis(5000))?;
        Ok(conn)
    }

    pub fn get(&self) -> Result<Connection> {
        if let Some(conn) = self.idle.lock().unwrap().pop_front() {
            return Ok(conn);
        }
        debug!(path = %self.path.display(), "opening new ledger connection");
        self.open_connection()
    }

    pub fn put(&self, conn: Connection) {
        let mut idle = self.idle.lock().unwrap();
        if idle.len() < self.max_idle {
            idle.push_back(conn);
        }
    }

    /// Discard a connection that saw a database-level failure.
    pub fn put_failed(&self, conn: Connection, err: &SpaceError) {
        warn!(%err, "discarding ledger connection after failure");
        drop(conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_returned_connections() {
        let dir = tempfile::tempdir().unwrap();
        let pool = SqlitePool::open(dir.path().join("t.db"), 2).unwrap();
        let conn = pool.get().unwrap();
        conn.execute_batch("CREATE TABLE t (x INTEGER)").unwrap();
        pool.put(conn);

        let conn = pool.get().unwrap();
        conn.execute("INSERT INTO t (x) VALUES (1)", []).unwrap();
        pool.put(conn);
    }

    #[test]
    fn bad_path_fails_at_open() {
        assert!(SqlitePool::open("/nonexistent-dir/nope/t.db", 1).is_err());
    }
}
