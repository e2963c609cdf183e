//! Transactional reservation ledger
//!
//! Every mutation runs inside one immediate SQLite transaction; a failure
//! rolls the whole operation back, so the invariant that a reservation's
//! used + allocated bytes never exceed its size holds across crashes.
//! Token and file ids come from a persisted batch generator, so ids are
//! unique across restarts without a per-insert write to the counter table.

use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use tracing::{debug, info};

use super::model::{
    AccessLatency, FileState, LinkGroup, RetentionPolicy, Space, SpaceFile, SpaceState, VoInfo,
};
use super::pool::SqlitePool;
use super::{Result, SpaceError};

/// Ids are claimed from the counter table in batches of this size.
const ID_BATCH: i64 = 1000;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS next_id (
    name TEXT PRIMARY KEY,
    base INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS link_group (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    free_space INTEGER NOT NULL,
    reserved_space INTEGER NOT NULL DEFAULT 0,
    online_allowed INTEGER NOT NULL,
    nearline_allowed INTEGER NOT NULL,
    replica_allowed INTEGER NOT NULL,
    output_allowed INTEGER NOT NULL,
    custodial_allowed INTEGER NOT NULL,
    last_update_time INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS link_group_acl (
    link_group_id INTEGER NOT NULL REFERENCES link_group(id) ON DELETE CASCADE,
    vo_group TEXT NOT NULL,
    vo_role TEXT NOT NULL,
    PRIMARY KEY (link_group_id, vo_group, vo_role)
);

CREATE TABLE IF NOT EXISTS space_reservation (
    id INTEGER PRIMARY KEY,
    vo_group TEXT NOT NULL,
    vo_role TEXT,
    retention_policy INTEGER NOT NULL,
    access_latency INTEGER NOT NULL,
    link_group_id INTEGER NOT NULL REFERENCES link_group(id),
    size_in_bytes INTEGER NOT NULL,
    creation_time INTEGER NOT NULL,
    lifetime_ms INTEGER NOT NULL,
    description TEXT,
    state INTEGER NOT NULL,
    used_bytes INTEGER NOT NULL DEFAULT 0,
    allocated_bytes INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_reservation_state ON space_reservation (state);

CREATE TABLE IF NOT EXISTS space_file (
    id INTEGER PRIMARY KEY,
    vo_group TEXT NOT NULL,
    vo_role TEXT,
    space_id INTEGER NOT NULL REFERENCES space_reservation(id),
    size_in_bytes INTEGER NOT NULL,
    creation_time INTEGER NOT NULL,
    lifetime_ms INTEGER NOT NULL,
    path TEXT,
    content_id TEXT,
    state INTEGER NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_file_space ON space_file (space_id);
CREATE INDEX IF NOT EXISTS idx_file_content ON space_file (content_id);
CREATE INDEX IF NOT EXISTS idx_file_path ON space_file (path);
";

/// Row-cleanup policies; see the configuration for their meaning.
#[derive(Debug, Clone, Copy)]
pub struct LedgerPolicies {
    pub cleanup_expired_space_files: bool,
    pub delete_stored_file_record: bool,
}

impl Default for LedgerPolicies {
    fn default() -> Self {
        LedgerPolicies {
            cleanup_expired_space_files: true,
            delete_stored_file_record: false,
        }
    }
}

/// Telemetry-driven link-group refresh payload.
#[derive(Debug, Clone)]
pub struct LinkGroupUpdate {
    pub name: String,
    pub free_space: i64,
    pub online_allowed: bool,
    pub nearline_allowed: bool,
    pub replica_allowed: bool,
    pub output_allowed: bool,
    pub custodial_allowed: bool,
    pub authorized: Vec<VoInfo>,
}

struct IdCursor {
    next: i64,
    limit: i64,
}

pub struct Ledger {
    pool: SqlitePool,
    policies: LedgerPolicies,
    space_ids: Mutex<IdCursor>,
    file_ids: Mutex<IdCursor>,
}

impl Ledger {
    pub fn open(path: impl AsRef<Path>, pool_size: usize, policies: LedgerPolicies) -> Result<Self> {
        let pool = SqlitePool::open(path, pool_size)?;
        let conn = pool.get()?;
        conn.execute_batch(SCHEMA)?;
        pool.put(conn);
        info!("reservation ledger opened");
        Ok(Ledger {
            pool,
            policies,
            space_ids: Mutex::new(IdCursor { next: 0, limit: 0 }),
            file_ids: Mutex::new(IdCursor { next: 0, limit: 0 }),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.pool.get()?;
        match f(&mut conn) {
            Ok(value) => {
                self.pool.put(conn);
                Ok(value)
            }
            Err(err) => {
                if matches!(err, SpaceError::Ledger(_)) {
                    self.pool.put_failed(conn, &err);
                } else {
                    self.pool.put(conn);
                }
                Err(err)
            }
        }
    }

    fn with_tx<T>(&self, f: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
    }

    /// Claim an id, refilling the cursor from the counter table in batches.
    /// The refill commits on its own, so ids stay unique even when the
    /// operation that requested them rolls back.
    fn allocate_id(&self, sequence: &str, cursor: &Mutex<IdCursor>) -> Result<i64> {
        let mut cursor = cursor.lock().unwrap();
        if cursor.next >= cursor.limit {
            let base = self.with_tx(|tx| {
                tx.execute(
                    "INSERT OR IGNORE INTO next_id (name, base) VALUES (?1, ?2)",
                    params![sequence, ID_BATCH],
                )?;
                tx.execute(
                    "UPDATE next_id SET base = base + ?2 WHERE name = ?1",
                    params![sequence, ID_BATCH],
                )?;
                let base: i64 = tx.query_row(
                    "SELECT base FROM next_id WHERE name = ?1",
                    params![sequence],
                    |row| row.get(0),
                )?;
                Ok(base - ID_BATCH)
            })?;
            cursor.next = base;
            cursor.limit = base + ID_BATCH;
        }
        let id = cursor.next;
        cursor.next += 1;
        Ok(id)
    }

    // --- link groups ---

    /// Insert or refresh a link group from telemetry, replacing its ACL.
    pub fn update_link_group(&self, update: &LinkGroupUpdate, now_ms: i64) -> Result<i64> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO link_group (name, free_space, online_allowed, nearline_allowed,
                                         replica_allowed, output_allowed, custodial_allowed,
                                         last_update_time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT (name) DO UPDATE SET
                     free_space = excluded.free_space,
                     online_allowed = excluded.online_allowed,
                     nearline_allowed = excluded.nearline_allowed,
                     replica_allowed = excluded.replica_allowed,
                     output_allowed = excluded.output_allowed,
                     custodial_allowed = excluded.custodial_allowed,
                     last_update_time = excluded.last_update_time",
                params![
                    update.name,
                    update.free_space,
                    update.online_allowed,
                    update.nearline_allowed,
                    update.replica_allowed,
                    update.output_allowed,
                    update.custodial_allowed,
                    now_ms,
                ],
            )?;
            let id: i64 = tx.query_row(
                "SELECT id FROM link_group WHERE name = ?1",
                params![update.name],
                |row| row.get(0),
            )?;
            tx.execute(
                "DELETE FROM link_group_acl WHERE link_group_id = ?1",
                params![id],
            )?;
            let mut insert = tx.prepare_cached(
                "INSERT INTO link_group_acl (link_group_id, vo_group, vo_role)
                 VALUES (?1, ?2, ?3)",
            )?;
            for vo in &update.authorized {
                insert.execute(params![id, vo.group, vo.role])?;
            }
            Ok(id)
        })
    }

    fn load_acl(tx: &Transaction, link_group_id: i64) -> Result<Vec<VoInfo>> {
        let mut stmt = tx.prepare_cached(
            "SELECT vo_group, vo_role FROM link_group_acl WHERE link_group_id = ?1",
        )?;
        let rows = stmt.query_map(params![link_group_id], |row| {
            Ok(VoInfo {
                group: row.get(0)?,
                role: row.get(1)?,
            })
        })?;
        let mut acl = Vec::new();
        for vo in rows {
            acl.push(vo?);
        }
        Ok(acl)
    }

    fn link_group_from_row(row: &Row) -> rusqlite::Result<LinkGroup> {
        Ok(LinkGroup {
            id: row.get(0)?,
            name: row.get(1)?,
            free_space: row.get(2)?,
            reserved_space: row.get(3)?,
            online_allowed: row.get(4)?,
            nearline_allowed: row.get(5)?,
            replica_allowed: row.get(6)?,
            output_allowed: row.get(7)?,
            custodial_allowed: row.get(8)?,
            last_update_time: row.get(9)?,
            authorized: Vec::new(),
        })
    }

    const LINK_GROUP_COLUMNS: &'static str =
        "id, name, free_space, reserved_space, online_allowed, nearline_allowed,
         replica_allowed, output_allowed, custodial_allowed, last_update_time";

    /// Link groups that could host a reservation of the given shape, best
    /// first. `freshness_cutoff` excludes groups whose telemetry is older.
    pub fn find_link_group_candidates(
        &self,
        size_in_bytes: i64,
        latency: AccessLatency,
        retention: RetentionPolicy,
        freshness_cutoff: Option<i64>,
    ) -> Result<Vec<LinkGroup>> {
        let latency_column = match latency {
            AccessLatency::Online => "online_allowed",
            AccessLatency::Nearline => "nearline_allowed",
        };
        let retention_column = match retention {
            RetentionPolicy::Replica => "replica_allowed",
            RetentionPolicy::Output => "output_allowed",
            RetentionPolicy::Custodial => "custodial_allowed",
        };
        let sql = format!(
            "SELECT {cols} FROM link_group
             WHERE {latency_column} AND {retention_column}
               AND free_space - reserved_space >= ?1
               AND last_update_time >= ?2
             ORDER BY free_space - reserved_space DESC, id ASC",
            cols = Self::LINK_GROUP_COLUMNS,
        );
        self.with_tx(|tx| {
            let mut stmt = tx.prepare(&sql)?;
            let cutoff = freshness_cutoff.unwrap_or(i64::MIN);
            let rows = stmt.query_map(params![size_in_bytes, cutoff], Self::link_group_from_row)?;
            let mut groups = Vec::new();
            for group in rows {
                let mut group = group?;
                group.authorized = Self::load_acl(tx, group.id)?;
                groups.push(group);
            }
            Ok(groups)
        })
    }

    pub fn get_link_group(&self, name: &str) -> Result<Option<LinkGroup>> {
        let sql = format!(
            "SELECT {cols} FROM link_group WHERE name = ?1",
            cols = Self::LINK_GROUP_COLUMNS
        );
        self.with_tx(|tx| {
            let group = tx
                .query_row(&sql, params![name], Self::link_group_from_row)
                .optional()?;
            match group {
                Some(mut group) => {
                    group.authorized = Self::load_acl(tx, group.id)?;
                    Ok(Some(group))
                }
                None => Ok(None),
            }
        })
    }

    pub fn get_link_groups(&self) -> Result<Vec<LinkGroup>> {
        let sql = format!(
            "SELECT {cols} FROM link_group ORDER BY id",
            cols = Self::LINK_GROUP_COLUMNS
        );
        self.with_tx(|tx| {
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map([], Self::link_group_from_row)?;
            let mut groups = Vec::new();
            for group in rows {
                let mut group = group?;
                group.authorized = Self::load_acl(tx, group.id)?;
                groups.push(group);
            }
            Ok(groups)
        })
    }

    pub fn link_group_name(&self, id: i64) -> Result<Option<String>> {
        self.with_tx(|tx| {
            Ok(tx
                .query_row(
                    "SELECT name FROM link_group WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    pub fn get_link_group_names(&self) -> Result<Vec<String>> {
        self.with_tx(|tx| {
            let mut stmt = tx.prepare_cached("SELECT name FROM link_group ORDER BY name")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            let mut names = Vec::new();
            for name in rows {
                names.push(name?);
            }
            Ok(names)
        })
    }

    // --- reservations ---

    fn space_from_row(row: &Row) -> rusqlite::Result<Space> {
        let conv = |idx: usize, err: SpaceError| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Integer,
                Box::new(err),
            )
        };
        let retention: i64 = row.get(3)?;
        let latency: i64 = row.get(4)?;
        let state: i64 = row.get(10)?;
        Ok(Space {
            id: row.get(0)?,
            vo_group: row.get(1)?,
            vo_role: row.get(2)?,
            retention_policy: RetentionPolicy::from_id(retention).map_err(|e| conv(3, e))?,
            access_latency: AccessLatency::from_id(latency).map_err(|e| conv(4, e))?,
            link_group_id: row.get(5)?,
            size_in_bytes: row.get(6)?,
            creation_time: row.get(7)?,
            lifetime_ms: row.get(8)?,
            description: row.get(9)?,
            state: SpaceState::from_id(state).map_err(|e| conv(10, e))?,
            used_bytes: row.get(11)?,
            allocated_bytes: row.get(12)?,
        })
    }

    const SPACE_COLUMNS: &'static str =
        "id, vo_group, vo_role, retention_policy, access_latency, link_group_id,
         size_in_bytes, creation_time, lifetime_ms, description, state,
         used_bytes, allocated_bytes";

    fn load_space(tx: &Transaction, token: i64) -> Result<Space> {
        let sql = format!(
            "SELECT {cols} FROM space_reservation WHERE id = ?1",
            cols = Self::SPACE_COLUMNS
        );
        tx.query_row(&sql, params![token], Self::space_from_row)
            .optional()?
            .ok_or(SpaceError::NotFound(token))
    }

    /// A reservation usable for new admissions: not terminal, not past its
    /// lifetime at `now_ms`.
    fn load_usable_space(tx: &Transaction, token: i64, now_ms: i64) -> Result<Space> {
        let space = Self::load_space(tx, token)?;
        match space.state {
            SpaceState::Released => Err(SpaceError::SpaceReleased(token)),
            SpaceState::Expired => Err(SpaceError::SpaceExpired(token)),
            SpaceState::Reserved if space.expired_at(now_ms) => {
                Err(SpaceError::SpaceExpired(token))
            }
            SpaceState::Reserved => Ok(space),
        }
    }

    /// Create a reservation inside a named link group, debiting its
    /// uncommitted space. The caller has already picked the group.
    #[allow(clippy::too_many_arguments)]
    pub fn reserve(
        &self,
        link_group_id: i64,
        vo_group: &str,
        vo_role: Option<&str>,
        retention: RetentionPolicy,
        latency: AccessLatency,
        size_in_bytes: i64,
        lifetime_ms: i64,
        description: Option<&str>,
    ) -> Result<i64> {
        let token = self.allocate_id("space", &self.space_ids)?;
        let now = now_ms();
        self.with_tx(|tx| {
            let (free, reserved): (i64, i64) = tx
                .query_row(
                    "SELECT free_space, reserved_space FROM link_group WHERE id = ?1",
                    params![link_group_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?
                .ok_or_else(|| {
                    SpaceError::NoFreeSpace(format!("link group {link_group_id} vanished"))
                })?;
            if free - reserved < size_in_bytes {
                return Err(SpaceError::NoFreeSpace(format!(
                    "link group {link_group_id} has {} bytes uncommitted, {size_in_bytes} requested",
                    free - reserved
                )));
            }
            tx.execute(
                "INSERT INTO space_reservation
                     (id, vo_group, vo_role, retention_policy, access_latency, link_group_id,
                      size_in_bytes, creation_time, lifetime_ms, description, state)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    token,
                    vo_group,
                    vo_role,
                    retention.to_id(),
                    latency.to_id(),
                    link_group_id,
                    size_in_bytes,
                    now,
                    lifetime_ms,
                    description,
                    SpaceState::Reserved.to_id(),
                ],
            )?;
            tx.execute(
                "UPDATE link_group SET reserved_space = reserved_space + ?2 WHERE id = ?1",
                params![link_group_id, size_in_bytes],
            )?;
            Ok(())
        })?;
        debug!(token, size_in_bytes, "reservation created");
        Ok(token)
    }

    pub fn get_space(&self, token: i64) -> Result<Space> {
        self.with_tx(|tx| Self::load_space(tx, token))
    }

    /// Move a reservation to RELEASED and return its pledge to the link
    /// group. Releasing a terminal reservation reports which terminal state
    /// it is in.
    pub fn release(&self, token: i64) -> Result<()> {
        self.with_tx(|tx| {
            let space = Self::load_space(tx, token)?;
            match space.state {
                SpaceState::Released => return Err(SpaceError::SpaceReleased(token)),
                SpaceState::Expired => return Err(SpaceError::SpaceExpired(token)),
                SpaceState::Reserved => {}
            }
            tx.execute(
                "UPDATE space_reservation SET state = ?2 WHERE id = ?1",
                params![token, SpaceState::Released.to_id()],
            )?;
            tx.execute(
                "UPDATE link_group SET reserved_space = MAX(reserved_space - ?2, 0)
                 WHERE id = ?1",
                params![space.link_group_id, space.size_in_bytes],
            )?;
            Ok(())
        })?;
        info!(token, "reservation released");
        Ok(())
    }

    /// Verify a reservation could absorb `size_in_bytes` right now, without
    /// changing anything. Selection uses this before pointing a write at a
    /// reservation.
    pub fn check_space_usable(&self, token: i64, size_in_bytes: i64) -> Result<()> {
        self.with_tx(|tx| {
            let space = Self::load_usable_space(tx, token, now_ms())?;
            if space.available() < size_in_bytes {
                return Err(SpaceError::NoFreeSpace(format!(
                    "reservation {token} has {} bytes available, {size_in_bytes} needed",
                    space.available()
                )));
            }
            Ok(())
        })
    }

    /// Admit a file into a reservation, pledging `size_in_bytes` of it.
    /// A path may be claimed by at most one live, not-yet-stored file.
    #[allow(clippy::too_many_arguments)]
    pub fn add_file(
        &self,
        token: i64,
        vo_group: &str,
        vo_role: Option<&str>,
        size_in_bytes: i64,
        lifetime_ms: i64,
        path: Option<&str>,
        content_id: Option<&str>,
    ) -> Result<i64> {
        let file_id = self.allocate_id("file", &self.file_ids)?;
        let now = now_ms();
        self.with_tx(|tx| {
            let space = Self::load_usable_space(tx, token, now)?;
            if space.available() < size_in_bytes {
                return Err(SpaceError::NoFreeSpace(format!(
                    "reservation {token} has {} bytes available, {size_in_bytes} requested",
                    space.available()
                )));
            }
            if let Some(path) = path {
                let claimed: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM space_file
                     WHERE path = ?1 AND deleted = 0 AND state IN (?2, ?3)",
                    params![
                        path,
                        FileState::Reserved.to_id(),
                        FileState::Transferring.to_id()
                    ],
                    |row| row.get(0),
                )?;
                if claimed > 0 {
                    return Err(SpaceError::LedgerConsistency(format!(
                        "path {path} is already claimed by an in-flight file"
                    )));
                }
            }
            tx.execute(
                "INSERT INTO space_file
                     (id, vo_group, vo_role, space_id, size_in_bytes, creation_time,
                      lifetime_ms, path, content_id, state)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    file_id,
                    vo_group,
                    vo_role,
                    token,
                    size_in_bytes,
                    now,
                    lifetime_ms,
                    path,
                    content_id,
                    FileState::Reserved.to_id(),
                ],
            )?;
            tx.execute(
                "UPDATE space_reservation SET allocated_bytes = allocated_bytes + ?2
                 WHERE id = ?1",
                params![token, size_in_bytes],
            )?;
            Ok(())
        })?;
        debug!(token, file_id, size_in_bytes, "file admitted");
        Ok(file_id)
    }

    /// Withdraw a file that never started transferring, returning its pledge.
    pub fn cancel_use(&self, token: i64, path: &str) -> Result<()> {
        self.with_tx(|tx| {
            let file: Option<(i64, i64, i64)> = tx
                .query_row(
                    "SELECT id, size_in_bytes, state FROM space_file
                     WHERE space_id = ?1 AND path = ?2 AND deleted = 0
                       AND state IN (?3, ?4)",
                    params![
                        token,
                        path,
                        FileState::Reserved.to_id(),
                        FileState::Transferring.to_id()
                    ],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            let Some((file_id, size, state)) = file else {
                return Err(SpaceError::LedgerConsistency(format!(
                    "no pending file at {path} in reservation {token}"
                )));
            };
            if state != FileState::Reserved.to_id() {
                return Err(SpaceError::LedgerConsistency(format!(
                    "file at {path} is already transferring"
                )));
            }
            tx.execute("DELETE FROM space_file WHERE id = ?1", params![file_id])?;
            tx.execute(
                "UPDATE space_reservation SET allocated_bytes = MAX(allocated_bytes - ?2, 0)
                 WHERE id = ?1",
                params![token, size],
            )?;
            Ok(())
        })
    }

    /// Extend a reservation's lifetime. The effective lifetime never
    /// shrinks; -1 makes it infinite. Returns the effective value.
    pub fn extend_lifetime(&self, token: i64, lifetime_ms: i64) -> Result<i64> {
        self.with_tx(|tx| {
            let space = Self::load_usable_space(tx, token, now_ms())?;
            let effective = if space.lifetime_ms == -1 || lifetime_ms == -1 {
                -1
            } else {
                space.lifetime_ms.max(lifetime_ms)
            };
            tx.execute(
                "UPDATE space_reservation SET lifetime_ms = ?2 WHERE id = ?1",
                params![token, effective],
            )?;
            Ok(effective)
        })
    }

    // --- transfer lifecycle ---

    fn file_from_row(row: &Row) -> rusqlite::Result<SpaceFile> {
        let conv = |idx: usize, err: SpaceError| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Integer,
                Box::new(err),
            )
        };
        let state: i64 = row.get(9)?;
        Ok(SpaceFile {
            id: row.get(0)?,
            vo_group: row.get(1)?,
            vo_role: row.get(2)?,
            space_id: row.get(3)?,
            size_in_bytes: row.get(4)?,
            creation_time: row.get(5)?,
            lifetime_ms: row.get(6)?,
            path: row.get(7)?,
            content_id: row.get(8)?,
            state: FileState::from_id(state).map_err(|e| conv(9, e))?,
            deleted: row.get(10)?,
        })
    }

    const FILE_COLUMNS: &'static str =
        "id, vo_group, vo_role, space_id, size_in_bytes, creation_time,
         lifetime_ms, path, content_id, state, deleted";

    fn load_file_by_content_id(tx: &Transaction, content_id: &str) -> Result<Option<SpaceFile>> {
        let sql = format!(
            "SELECT {cols} FROM space_file WHERE content_id = ?1 AND deleted = 0",
            cols = Self::FILE_COLUMNS
        );
        Ok(tx
            .query_row(&sql, params![content_id], Self::file_from_row)
            .optional()?)
    }

    /// Bind a storage content id to a door-created record.
    pub fn bind_content_id(&self, file_id: i64, content_id: &str) -> Result<()> {
        self.with_tx(|tx| {
            let updated = tx.execute(
                "UPDATE space_file SET content_id = ?2 WHERE id = ?1 AND deleted = 0",
                params![file_id, content_id],
            )?;
            if updated == 0 {
                return Err(SpaceError::LedgerConsistency(format!(
                    "no live file record {file_id} to bind content id to"
                )));
            }
            Ok(())
        })
    }

    /// The mover started (or failed to start). On failure an explicit record
    /// stays around for a retry with its content id cleared; an implicit one
    /// is dropped and its pledge returned.
    pub fn transfer_started(&self, content_id: &str, success: bool) -> Result<()> {
        self.with_tx(|tx| {
            let Some(file) = Self::load_file_by_content_id(tx, content_id)? else {
                debug!(content_id, "transfer start for unknown file, ignoring");
                return Ok(());
            };
            if success {
                tx.execute(
                    "UPDATE space_file SET state = ?2 WHERE id = ?1",
                    params![file.id, FileState::Transferring.to_id()],
                )?;
            } else if file.path.is_some() {
                tx.execute(
                    "UPDATE space_file SET content_id = NULL, state = ?2 WHERE id = ?1",
                    params![file.id, FileState::Reserved.to_id()],
                )?;
            } else {
                tx.execute("DELETE FROM space_file WHERE id = ?1", params![file.id])?;
                tx.execute(
                    "UPDATE space_reservation SET allocated_bytes = MAX(allocated_bytes - ?2, 0)
                     WHERE id = ?1",
                    params![file.space_id, file.size_in_bytes],
                )?;
            }
            Ok(())
        })
    }

    /// The transfer ended. Success converts the pledge into used bytes at
    /// the final size; failure unwinds exactly like a failed start.
    pub fn transfer_finished(&self, content_id: &str, final_size: i64, success: bool) -> Result<()> {
        self.with_tx(|tx| {
            let Some(file) = Self::load_file_by_content_id(tx, content_id)? else {
                debug!(content_id, "transfer finish for unknown file, ignoring");
                return Ok(());
            };
            if success {
                if self.policies.delete_stored_file_record {
                    tx.execute("DELETE FROM space_file WHERE id = ?1", params![file.id])?;
                    tx.execute(
                        "UPDATE space_reservation
                         SET allocated_bytes = MAX(allocated_bytes - ?2, 0)
                         WHERE id = ?1",
                        params![file.space_id, file.size_in_bytes],
                    )?;
                } else {
                    tx.execute(
                        "UPDATE space_file SET state = ?2, size_in_bytes = ?3 WHERE id = ?1",
                        params![file.id, FileState::Stored.to_id(), final_size],
                    )?;
                    tx.execute(
                        "UPDATE space_reservation
                         SET allocated_bytes = MAX(allocated_bytes - ?2, 0),
                             used_bytes = used_bytes + ?3
                         WHERE id = ?1",
                        params![file.space_id, file.size_in_bytes, final_size],
                    )?;
                }
            } else if file.path.is_some() {
                tx.execute(
                    "UPDATE space_file SET content_id = NULL, state = ?2 WHERE id = ?1",
                    params![file.id, FileState::Reserved.to_id()],
                )?;
            } else {
                tx.execute("DELETE FROM space_file WHERE id = ?1", params![file.id])?;
                tx.execute(
                    "UPDATE space_reservation SET allocated_bytes = MAX(allocated_bytes - ?2, 0)
                     WHERE id = ?1",
                    params![file.space_id, file.size_in_bytes],
                )?;
            }
            Ok(())
        })
    }

    /// A stored file migrated to the archive. For nearline reservations the
    /// disk copy no longer counts against the reservation.
    pub fn file_flushed(&self, content_id: &str) -> Result<()> {
        self.with_tx(|tx| {
            let Some(file) = Self::load_file_by_content_id(tx, content_id)? else {
                return Ok(());
            };
            if file.state != FileState::Stored {
                return Ok(());
            }
            let space = Self::load_space(tx, file.space_id)?;
            if space.access_latency == AccessLatency::Online {
                // The replica must stay on disk; nothing is returned.
                return Ok(());
            }
            tx.execute(
                "UPDATE space_file SET state = ?2 WHERE id = ?1",
                params![file.id, FileState::Flushed.to_id()],
            )?;
            tx.execute(
                "UPDATE space_reservation SET used_bytes = MAX(used_bytes - ?2, 0)
                 WHERE id = ?1",
                params![file.space_id, file.size_in_bytes],
            )?;
            Ok(())
        })
    }

    /// The file vanished from the namespace. Stored and flushed records are
    /// tombstoned and whatever they held is returned; a transfer still in
    /// flight against an explicit record reverts it to RESERVED so the
    /// door's pledge survives the doomed transfer.
    pub fn file_removed(&self, content_id: &str) -> Result<()> {
        self.with_tx(|tx| {
            let Some(file) = Self::load_file_by_content_id(tx, content_id)? else {
                return Ok(());
            };
            if file.state == FileState::Transferring && file.path.is_some() {
                tx.execute(
                    "UPDATE space_file SET content_id = NULL, state = ?2 WHERE id = ?1",
                    params![file.id, FileState::Reserved.to_id()],
                )?;
                return Ok(());
            }
            match file.state {
                FileState::Stored => {
                    tx.execute(
                        "UPDATE space_reservation SET used_bytes = MAX(used_bytes - ?2, 0)
                         WHERE id = ?1",
                        params![file.space_id, file.size_in_bytes],
                    )?;
                }
                FileState::Reserved | FileState::Transferring => {
                    tx.execute(
                        "UPDATE space_reservation
                         SET allocated_bytes = MAX(allocated_bytes - ?2, 0)
                         WHERE id = ?1",
                        params![file.space_id, file.size_in_bytes],
                    )?;
                }
                FileState::Flushed => {}
            }
            tx.execute(
                "UPDATE space_file SET deleted = 1 WHERE id = ?1",
                params![file.id],
            )?;
            Ok(())
        })
    }

    // --- expiry sweeps ---

    /// Expire reservations past their lifetime, returning their pledge to
    /// the link group. Returns the number expired.
    pub fn expire_spaces(&self, now_ms: i64) -> Result<u64> {
        self.with_tx(|tx| {
            let sql = format!(
                "SELECT {cols} FROM space_reservation
                 WHERE state = ?1 AND lifetime_ms != -1
                   AND creation_time + lifetime_ms < ?2",
                cols = Self::SPACE_COLUMNS
            );
            let mut stmt = tx.prepare(&sql)?;
            let rows =
                stmt.query_map(params![SpaceState::Reserved.to_id(), now_ms], Self::space_from_row)?;
            let stale: Vec<Space> = rows.collect::<rusqlite::Result<_>>()?;
            let mut expired = 0u64;
            for space in stale {
                tx.execute(
                    "UPDATE space_reservation SET state = ?2 WHERE id = ?1",
                    params![space.id, SpaceState::Expired.to_id()],
                )?;
                tx.execute(
                    "UPDATE link_group SET reserved_space = MAX(reserved_space - ?2, 0)
                     WHERE id = ?1",
                    params![space.link_group_id, space.size_in_bytes],
                )?;
                info!(token = space.id, "reservation expired");
                expired += 1;
            }
            Ok(expired)
        })
    }

    /// Drop file pledges whose lifetime passed without a transfer starting.
    /// Disabled entirely when the cleanup policy is off.
    pub fn expire_files(&self, now_ms: i64) -> Result<u64> {
        if !self.policies.cleanup_expired_space_files {
            return Ok(0);
        }
        self.with_tx(|tx| {
            let sql = format!(
                "SELECT {cols} FROM space_file
                 WHERE state = ?1 AND deleted = 0 AND lifetime_ms != -1
                   AND creation_time + lifetime_ms < ?2",
                cols = Self::FILE_COLUMNS
            );
            let mut stmt = tx.prepare(&sql)?;
            let rows =
                stmt.query_map(params![FileState::Reserved.to_id(), now_ms], Self::file_from_row)?;
            let stale: Vec<SpaceFile> = rows.collect::<rusqlite::Result<_>>()?;
            let mut expired = 0u64;
            for file in stale {
                tx.execute("DELETE FROM space_file WHERE id = ?1", params![file.id])?;
                tx.execute(
                    "UPDATE space_reservation SET allocated_bytes = MAX(allocated_bytes - ?2, 0)
                     WHERE id = ?1",
                    params![file.space_id, file.size_in_bytes],
                )?;
                expired += 1;
            }
            Ok(expired)
        })
    }

    // --- queries ---

    pub fn get_space_tokens(
        &self,
        vo_group: Option<&str>,
        description: Option<&str>,
    ) -> Result<Vec<i64>> {
        self.with_tx(|tx| {
            let mut stmt = tx.prepare_cached(
                "SELECT id FROM space_reservation
                 WHERE state = ?1
                   AND (?2 IS NULL OR vo_group = ?2)
                   AND (?3 IS NULL OR description = ?3)
                 ORDER BY id",
            )?;
            let rows = stmt.query_map(
                params![SpaceState::Reserved.to_id(), vo_group, description],
                |row| row.get(0),
            )?;
            let mut tokens = Vec::new();
            for token in rows {
                tokens.push(token?);
            }
            Ok(tokens)
        })
    }

    /// One slot per requested token; unknown tokens yield None rather than
    /// failing the whole query.
    pub fn get_space_metadata(&self, tokens: &[i64]) -> Result<Vec<Option<Space>>> {
        self.with_tx(|tx| {
            let mut spaces = Vec::with_capacity(tokens.len());
            for &token in tokens {
                match Self::load_space(tx, token) {
                    Ok(space) => spaces.push(Some(space)),
                    Err(SpaceError::NotFound(_)) => spaces.push(None),
                    Err(err) => return Err(err),
                }
            }
            Ok(spaces)
        })
    }

    pub fn get_file_space_tokens(&self, path: &str) -> Result<Vec<i64>> {
        self.with_tx(|tx| {
            let mut stmt = tx.prepare_cached(
                "SELECT DISTINCT space_id FROM space_file
                 WHERE path = ?1 AND deleted = 0 ORDER BY space_id",
            )?;
            let rows = stmt.query_map(params![path], |row| row.get(0))?;
            let mut tokens = Vec::new();
            for token in rows {
                tokens.push(token?);
            }
            Ok(tokens)
        })
    }

    /// A door-created record waiting for its transfer: claimed path, no
    /// content id yet. Pool selection looks these up to route a write into
    /// the reservation the door prepared.
    pub fn find_pending_file_by_path(&self, path: &str) -> Result<Option<SpaceFile>> {
        let sql = format!(
            "SELECT {cols} FROM space_file
             WHERE path = ?1 AND deleted = 0 AND content_id IS NULL AND state = ?2",
            cols = Self::FILE_COLUMNS
        );
        self.with_tx(|tx| {
            Ok(tx
                .query_row(&sql, params![path, FileState::Reserved.to_id()], Self::file_from_row)
                .optional()?)
        })
    }
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> (tempfile::TempDir, Ledger) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(
            dir.path().join("space.db"),
            2,
            LedgerPolicies::default(),
        )
        .unwrap();
        (dir, ledger)
    }

    fn seed_group(ledger: &Ledger, name: &str, free: i64) -> i64 {
        ledger
            .update_link_group(
                &LinkGroupUpdate {
                    name: name.into(),
                    free_space: free,
                    online_allowed: true,
                    nearline_allowed: true,
                    replica_allowed: true,
                    output_allowed: true,
                    custodial_allowed: true,
                    authorized: vec![VoInfo::new("*", "*")],
                },
                now_ms(),
            )
            .unwrap()
    }

    #[test]
    fn reserve_debits_link_group() {
        let (_dir, ledger) = ledger();
        let lg = seed_group(&ledger, "lg", 1000);
        let token = ledger
            .reserve(lg, "atlas", None, RetentionPolicy::Replica, AccessLatency::Online, 600, -1, None)
            .unwrap();

        let group = ledger.get_link_group("lg").unwrap().unwrap();
        assert_eq!(group.available(), 400);

        let space = ledger.get_space(token).unwrap();
        assert_eq!(space.size_in_bytes, 600);
        assert_eq!(space.state, SpaceState::Reserved);
        assert_eq!(space.used_bytes, 0);
        assert_eq!(space.allocated_bytes, 0);
    }

    #[test]
    fn reserve_beyond_available_fails() {
        let (_dir, ledger) = ledger();
        let lg = seed_group(&ledger, "lg", 1000);
        ledger
            .reserve(lg, "atlas", None, RetentionPolicy::Replica, AccessLatency::Online, 1000, -1, None)
            .unwrap();
        let err = ledger
            .reserve(lg, "atlas", None, RetentionPolicy::Replica, AccessLatency::Online, 1, -1, None)
            .unwrap_err();
        assert!(matches!(err, SpaceError::NoFreeSpace(_)));
    }

    #[test]
    fn release_is_not_idempotent() {
        let (_dir, ledger) = ledger();
        let lg = seed_group(&ledger, "lg", 1000);
        let token = ledger
            .reserve(lg, "atlas", None, RetentionPolicy::Replica, AccessLatency::Online, 600, -1, None)
            .unwrap();
        ledger.release(token).unwrap();

        let group = ledger.get_link_group("lg").unwrap().unwrap();
        assert_eq!(group.available(), 1000);

        let err = ledger.release(token).unwrap_err();
        assert!(matches!(err, SpaceError::SpaceReleased(_)));
    }

    #[test]
    fn exact_fit_admission_boundary() {
        let (_dir, ledger) = ledger();
        let lg = seed_group(&ledger, "lg", 1000);
        let token = ledger
            .reserve(lg, "atlas", None, RetentionPolicy::Replica, AccessLatency::Online, 500, -1, None)
            .unwrap();

        ledger
            .add_file(token, "atlas", None, 500, -1, Some("/d/a"), None)
            .unwrap();
        let err = ledger
            .add_file(token, "atlas", None, 1, -1, Some("/d/b"), None)
            .unwrap_err();
        assert!(matches!(err, SpaceError::NoFreeSpace(_)));
    }

    #[test]
    fn duplicate_path_claim_rejected() {
        let (_dir, ledger) = ledger();
        let lg = seed_group(&ledger, "lg", 1000);
        let token = ledger
            .reserve(lg, "atlas", None, RetentionPolicy::Replica, AccessLatency::Online, 500, -1, None)
            .unwrap();
        ledger
            .add_file(token, "atlas", None, 100, -1, Some("/d/a"), None)
            .unwrap();
        let err = ledger
            .add_file(token, "atlas", None, 100, -1, Some("/d/a"), None)
            .unwrap_err();
        assert!(matches!(err, SpaceError::LedgerConsistency(_)));
    }

    #[test]
    fn cancel_use_returns_pledge() {
        let (_dir, ledger) = ledger();
        let lg = seed_group(&ledger, "lg", 1000);
        let token = ledger
            .reserve(lg, "atlas", None, RetentionPolicy::Replica, AccessLatency::Online, 500, -1, None)
            .unwrap();
        ledger
            .add_file(token, "atlas", None, 100, -1, Some("/d/a"), None)
            .unwrap();
        assert_eq!(ledger.get_space(token).unwrap().allocated_bytes, 100);
        ledger.cancel_use(token, "/d/a").unwrap();
        assert_eq!(ledger.get_space(token).unwrap().allocated_bytes, 0);
    }

    #[test]
    fn transfer_lifecycle_converts_pledge_to_used() {
        let (_dir, ledger) = ledger();
        let lg = seed_group(&ledger, "lg", 1000);
        let token = ledger
            .reserve(lg, "atlas", None, RetentionPolicy::Custodial, AccessLatency::Nearline, 500, -1, None)
            .unwrap();
        let file_id = ledger
            .add_file(token, "atlas", None, 200, -1, Some("/d/a"), None)
            .unwrap();
        ledger.bind_content_id(file_id, "c-1").unwrap();
        ledger.transfer_started("c-1", true).unwrap();
        ledger.transfer_finished("c-1", 150, true).unwrap();

        let space = ledger.get_space(token).unwrap();
        assert_eq!(space.allocated_bytes, 0);
        assert_eq!(space.used_bytes, 150);

        // Flushing a nearline file returns the disk copy's bytes.
        ledger.file_flushed("c-1").unwrap();
        assert_eq!(ledger.get_space(token).unwrap().used_bytes, 0);
    }

    #[test]
    fn failed_transfer_keeps_explicit_record_for_retry() {
        let (_dir, ledger) = ledger();
        let lg = seed_group(&ledger, "lg", 1000);
        let token = ledger
            .reserve(lg, "atlas", None, RetentionPolicy::Replica, AccessLatency::Online, 500, -1, None)
            .unwrap();
        let file_id = ledger
            .add_file(token, "atlas", None, 200, -1, Some("/d/a"), None)
            .unwrap();
        ledger.bind_content_id(file_id, "c-1").unwrap();
        ledger.transfer_started("c-1", true).unwrap();
        ledger.transfer_finished("c-1", 0, false).unwrap();

        let space = ledger.get_space(token).unwrap();
        assert_eq!(space.allocated_bytes, 200);
        assert_eq!(space.used_bytes, 0);
        let file = ledger.find_pending_file_by_path("/d/a").unwrap().unwrap();
        assert_eq!(file.id, file_id);
        assert_eq!(file.state, FileState::Reserved);
    }

    #[test]
    fn failed_implicit_transfer_drops_record() {
        let (_dir, ledger) = ledger();
        let lg = seed_group(&ledger, "lg", 1000);
        let token = ledger
            .reserve(lg, "atlas", None, RetentionPolicy::Replica, AccessLatency::Online, 500, -1, None)
            .unwrap();
        ledger
            .add_file(token, "atlas", None, 200, -1, None, Some("c-1"))
            .unwrap();
        ledger.transfer_started("c-1", false).unwrap();
        assert_eq!(ledger.get_space(token).unwrap().allocated_bytes, 0);
    }

    #[test]
    fn removed_stored_file_returns_used_bytes() {
        let (_dir, ledger) = ledger();
        let lg = seed_group(&ledger, "lg", 1000);
        let token = ledger
            .reserve(lg, "atlas", None, RetentionPolicy::Replica, AccessLatency::Online, 500, -1, None)
            .unwrap();
        let file_id = ledger
            .add_file(token, "atlas", None, 200, -1, Some("/d/a"), None)
            .unwrap();
        ledger.bind_content_id(file_id, "c-1").unwrap();
        ledger.transfer_started("c-1", true).unwrap();
        ledger.transfer_finished("c-1", 200, true).unwrap();
        ledger.file_removed("c-1").unwrap();

        let space = ledger.get_space(token).unwrap();
        assert_eq!(space.used_bytes, 0);
        // The tombstoned record no longer answers path queries.
        assert!(ledger.get_file_space_tokens("/d/a").unwrap().is_empty());
    }

    #[test]
    fn expiry_sweep_transitions_and_returns_pledge() {
        let (_dir, ledger) = ledger();
        let lg = seed_group(&ledger, "lg", 1000);
        let token = ledger
            .reserve(lg, "atlas", None, RetentionPolicy::Replica, AccessLatency::Online, 600, 10, None)
            .unwrap();

        let expired = ledger.expire_spaces(now_ms() + 60_000).unwrap();
        assert_eq!(expired, 1);
        let space = ledger.get_space(token).unwrap();
        assert_eq!(space.state, SpaceState::Expired);
        assert_eq!(ledger.get_link_group("lg").unwrap().unwrap().available(), 1000);

        let err = ledger
            .add_file(token, "atlas", None, 1, -1, None, None)
            .unwrap_err();
        assert!(matches!(err, SpaceError::SpaceExpired(_)));
    }

    #[test]
    fn lifetime_never_shrinks() {
        let (_dir, ledger) = ledger();
        let lg = seed_group(&ledger, "lg", 1000);
        let token = ledger
            .reserve(lg, "atlas", None, RetentionPolicy::Replica, AccessLatency::Online, 100, 60_000, None)
            .unwrap();
        assert_eq!(ledger.extend_lifetime(token, 10_000).unwrap(), 60_000);
        assert_eq!(ledger.extend_lifetime(token, 120_000).unwrap(), 120_000);
        assert_eq!(ledger.extend_lifetime(token, -1).unwrap(), -1);
        assert_eq!(ledger.extend_lifetime(token, 5).unwrap(), -1);
    }

    #[test]
    fn candidates_ordered_by_uncommitted_space() {
        let (_dir, ledger) = ledger();
        seed_group(&ledger, "small", 100);
        seed_group(&ledger, "big", 10_000);
        let groups = ledger
            .find_link_group_candidates(50, AccessLatency::Online, RetentionPolicy::Replica, None)
            .unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].name, "big");
        assert_eq!(groups[1].name, "small");

        let groups = ledger
            .find_link_group_candidates(500, AccessLatency::Online, RetentionPolicy::Replica, None)
            .unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name, "big");
    }

    #[test]
    fn freshness_cutoff_excludes_stale_groups() {
        let (_dir, ledger) = ledger();
        seed_group(&ledger, "lg", 1000);
        let fresh = ledger
            .find_link_group_candidates(1, AccessLatency::Online, RetentionPolicy::Replica, Some(now_ms() - 1000))
            .unwrap();
        assert_eq!(fresh.len(), 1);
        let stale = ledger
            .find_link_group_candidates(1, AccessLatency::Online, RetentionPolicy::Replica, Some(now_ms() + 60_000))
            .unwrap();
        assert!(stale.is_empty());
    }

    #[test]
    fn token_queries() {
        let (_dir, ledger) = ledger();
        let lg = seed_group(&ledger, "lg", 10_000);
        let a = ledger
            .reserve(lg, "atlas", None, RetentionPolicy::Replica, AccessLatency::Online, 100, -1, Some("run1"))
            .unwrap();
        let b = ledger
            .reserve(lg, "cms", None, RetentionPolicy::Replica, AccessLatency::Online, 100, -1, None)
            .unwrap();

        assert_eq!(ledger.get_space_tokens(Some("atlas"), None).unwrap(), vec![a]);
        assert_eq!(ledger.get_space_tokens(None, Some("run1")).unwrap(), vec![a]);
        assert_eq!(ledger.get_space_tokens(None, None).unwrap(), vec![a, b]);

        let meta = ledger.get_space_metadata(&[a, 424242, b]).unwrap();
        assert!(meta[0].is_some());
        assert!(meta[1].is_none());
        assert!(meta[2].is_some());
    }

    #[test]
    fn ids_survive_reopen_without_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("space.db");
        let first = {
            let ledger = Ledger::open(&path, 1, LedgerPolicies::default()).unwrap();
            let lg = seed_group(&ledger, "lg", 10_000);
            ledger
                .reserve(lg, "atlas", None, RetentionPolicy::Replica, AccessLatency::Online, 1, -1, None)
                .unwrap()
        };
        let ledger = Ledger::open(&path, 1, LedgerPolicies::default()).unwrap();
        let lg = ledger.get_link_group("lg").unwrap().unwrap().id;
        let second = ledger
            .reserve(lg, "atlas", None, RetentionPolicy::Replica, AccessLatency::Online, 1, -1, None)
            .unwrap();
        assert!(second > first);
    }
}
