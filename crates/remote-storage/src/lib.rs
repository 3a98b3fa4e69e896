use chrono::{DateTime, Utc};
use remote_core::Identity;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

pub const IDENTITY_SCHEMA_VERSION: i64 = 1;
pub const DEFAULT_HOST_NAME: &str = "unnamed";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRecord {
    pub identity: Identity,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl HostRecord {
    pub fn new(identity: Identity, now: DateTime<Utc>) -> Self {
        Self {
            identity,
            name: DEFAULT_HOST_NAME.to_string(),
            created_at: now,
            last_seen: now,
        }
    }
}

/// A named set of agents owned by one operator account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRecord {
    pub group_id: String,
    pub owner: String,
    pub name: String,
    pub members: Vec<Identity>,
}

/// Persistent identity and group records.
///
/// Calls are synchronous and may block on disk; async callers should run them
/// on a blocking thread.
pub trait IdentityStore: Send + Sync {
    fn get_host(&self, identity: &Identity) -> Result<Option<HostRecord>, StoreError>;

    /// Inserts `record` unless its identity already exists. Returns whether a
    /// row was written.
    fn insert_host(&self, record: &HostRecord) -> Result<bool, StoreError>;

    /// Host naming, removal and the group methods below serve the external
    /// account layer that scopes agents per operator. The relay itself only
    /// mints, looks up and touches hosts.
    fn upsert_host(&self, record: &HostRecord) -> Result<(), StoreError>;

    fn touch_host(&self, identity: &Identity, last_seen: DateTime<Utc>)
        -> Result<bool, StoreError>;

    fn delete_host(&self, identity: &Identity) -> Result<bool, StoreError>;

    fn list_hosts(&self) -> Result<Vec<HostRecord>, StoreError>;

    fn upsert_group(&self, group: &GroupRecord) -> Result<(), StoreError>;

    fn get_group(&self, group_id: &str) -> Result<Option<GroupRecord>, StoreError>;

    fn delete_group(&self, group_id: &str) -> Result<bool, StoreError>;

    fn groups_for_owner(&self, owner: &str) -> Result<Vec<GroupRecord>, StoreError>;

    /// Mints a fresh identity and persists it, re-rolling on collision.
    fn create_host(&self, now: DateTime<Utc>) -> Result<HostRecord, StoreError> {
        loop {
            let record = HostRecord::new(Identity::mint(), now);
            if self.insert_host(&record)? {
                return Ok(record);
            }
        }
    }
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn schema_version(&self) -> Result<i64, StoreError> {
        Ok(self
            .conn()
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StoreError> {
        let current = self.schema_version()?;
        if current > IDENTITY_SCHEMA_VERSION {
            return Err(StoreError::UnsupportedSchemaVersion {
                found: current,
                supported: IDENTITY_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let conn = self.conn();
            let sql = include_str!("../migrations/0001_identity_schema.sql");
            conn.execute_batch(sql)?;
            conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
        }

        Ok(())
    }

    pub fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        let found: Option<String> = self
            .conn()
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn load_members(conn: &Connection, group_id: &str) -> Result<Vec<Identity>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT identity FROM host_group_members WHERE group_id = ?1 ORDER BY position",
        )?;
        let rows = stmt.query_map(params![group_id], |row| row.get::<_, String>(0))?;
        let mut members = Vec::new();
        for row in rows {
            members.push(Identity::from(row?));
        }
        Ok(members)
    }
}

impl IdentityStore for SqliteStore {
    fn get_host(&self, identity: &Identity) -> Result<Option<HostRecord>, StoreError> {
        let row = self
            .conn()
            .query_row(
                "SELECT identity, name, created_at, last_seen FROM hosts WHERE identity = ?1",
                params![identity.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        row.map(host_from_row).transpose()
    }

    fn insert_host(&self, record: &HostRecord) -> Result<bool, StoreError> {
        let changes = self.conn().execute(
            "
            INSERT OR IGNORE INTO hosts (identity, name, created_at, last_seen)
            VALUES (?1, ?2, ?3, ?4)
            ",
            params![
                record.identity.as_str(),
                record.name,
                record.created_at.to_rfc3339(),
                record.last_seen.to_rfc3339(),
            ],
        )?;
        Ok(changes > 0)
    }

    fn upsert_host(&self, record: &HostRecord) -> Result<(), StoreError> {
        self.conn().execute(
            "
            INSERT INTO hosts (identity, name, created_at, last_seen)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(identity) DO UPDATE SET
                name=excluded.name,
                last_seen=excluded.last_seen
            ",
            params![
                record.identity.as_str(),
                record.name,
                record.created_at.to_rfc3339(),
                record.last_seen.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn touch_host(
        &self,
        identity: &Identity,
        last_seen: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let changes = self.conn().execute(
            "UPDATE hosts SET last_seen = ?2 WHERE identity = ?1",
            params![identity.as_str(), last_seen.to_rfc3339()],
        )?;
        Ok(changes > 0)
    }

    fn delete_host(&self, identity: &Identity) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM host_group_members WHERE identity = ?1",
            params![identity.as_str()],
        )?;
        let changes = tx.execute(
            "DELETE FROM hosts WHERE identity = ?1",
            params![identity.as_str()],
        )?;
        tx.commit()?;
        Ok(changes > 0)
    }

    fn list_hosts(&self) -> Result<Vec<HostRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT identity, name, created_at, last_seen FROM hosts ORDER BY identity",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut hosts = Vec::new();
        for row in rows {
            hosts.push(host_from_row(row?)?);
        }
        Ok(hosts)
    }

    fn upsert_group(&self, group: &GroupRecord) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "
            INSERT INTO host_groups (group_id, owner, name, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(group_id) DO UPDATE SET
                owner=excluded.owner,
                name=excluded.name
            ",
            params![
                group.group_id,
                group.owner,
                group.name,
                Utc::now().to_rfc3339()
            ],
        )?;
        tx.execute(
            "DELETE FROM host_group_members WHERE group_id = ?1",
            params![group.group_id],
        )?;
        for (position, member) in group.members.iter().enumerate() {
            tx.execute(
                "
                INSERT OR IGNORE INTO host_group_members (group_id, identity, position)
                VALUES (?1, ?2, ?3)
                ",
                params![group.group_id, member.as_str(), position as i64],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn get_group(&self, group_id: &str) -> Result<Option<GroupRecord>, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT group_id, owner, name FROM host_groups WHERE group_id = ?1",
                params![group_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        let Some((group_id, owner, name)) = row else {
            return Ok(None);
        };
        let members = Self::load_members(&conn, &group_id)?;
        Ok(Some(GroupRecord {
            group_id,
            owner,
            name,
            members,
        }))
    }

    fn delete_group(&self, group_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM host_group_members WHERE group_id = ?1",
            params![group_id],
        )?;
        let changes = tx.execute(
            "DELETE FROM host_groups WHERE group_id = ?1",
            params![group_id],
        )?;
        tx.commit()?;
        Ok(changes > 0)
    }

    fn groups_for_owner(&self, owner: &str) -> Result<Vec<GroupRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT group_id, name FROM host_groups WHERE owner = ?1 ORDER BY name, group_id",
        )?;
        let rows = stmt.query_map(params![owner], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut heads = Vec::new();
        for row in rows {
            heads.push(row?);
        }
        drop(stmt);

        let mut groups = Vec::with_capacity(heads.len());
        for (group_id, name) in heads {
            let members = Self::load_members(&conn, &group_id)?;
            groups.push(GroupRecord {
                group_id,
                owner: owner.to_string(),
                name,
                members,
            });
        }
        Ok(groups)
    }
}

fn host_from_row(
    (identity, name, created_at, last_seen): (String, String, String, String),
) -> Result<HostRecord, StoreError> {
    Ok(HostRecord {
        identity: Identity::from(identity),
        name,
        created_at: parse_timestamp(created_at)?,
        last_seen: parse_timestamp(last_seen)?,
    })
}

fn parse_timestamp(value: String) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| StoreError::Timestamp(err.to_string()))
}
