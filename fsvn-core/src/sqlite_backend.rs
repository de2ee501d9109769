//! SQLite backend
//!
//! Keeps objects, revision records and metadata in a single database file
//! (`{root}/fsvn.sqlite`) in WAL mode. Publishing a revision is one SQL
//! transaction, so a crash either keeps the whole revision or none of it.

use rusqlite::{Connection, OptionalExtension, params};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::backend::{Backend, check_next_revision};
use crate::error::{FsError, NotFoundKind, Result};
use crate::node::Revision;
use crate::object::ObjectId;

pub const DATABASE_FILE: &str = "fsvn.sqlite";

pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

fn open_database(root: &Path) -> Result<Connection> {
    let conn = Connection::open(root.join(DATABASE_FILE))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "FULL")?;
    conn.pragma_update(None, "cache_size", "-64000")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS objects (
            id BLOB PRIMARY KEY,
            data BLOB NOT NULL
        ) WITHOUT ROWID;
        CREATE TABLE IF NOT EXISTS revisions (
            rev INTEGER PRIMARY KEY,
            record BLOB NOT NULL
        );
        CREATE TABLE IF NOT EXISTS meta (
            name TEXT PRIMARY KEY,
            data BLOB NOT NULL
        ) WITHOUT ROWID;",
    )?;
    Ok(conn)
}

fn query_youngest(conn: &Connection) -> Result<Option<Revision>> {
    let max: Option<i64> = conn.query_row("SELECT MAX(rev) FROM revisions", [], |r| r.get(0))?;
    Ok(max.map(|r| r as Revision))
}

impl SqliteBackend {
    /// Open or create the database under `path`
    pub fn open(path: &Path) -> Result<Self> {
        fs::create_dir_all(path)?;
        let conn = open_database(path)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Backend for SqliteBackend {
    fn write(&self, data: &[u8]) -> Result<ObjectId> {
        let id = ObjectId::from_data(data);
        self.conn().execute(
            "INSERT OR IGNORE INTO objects (id, data) VALUES (?1, ?2)",
            params![id.as_bytes().as_slice(), data],
        )?;
        Ok(id)
    }

    fn read(&self, id: &ObjectId) -> Result<Vec<u8>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached("SELECT data FROM objects WHERE id = ?1")?;
        stmt.query_row(params![id.as_bytes().as_slice()], |r| r.get(0))
            .optional()?
            .ok_or(FsError::NotFound(NotFoundKind::Object(*id)))
    }

    fn finalize(&self, rev: Revision, record: &[u8]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        check_next_revision(query_youngest(&tx)?, rev)?;
        tx.execute(
            "INSERT INTO revisions (rev, record) VALUES (?1, ?2)",
            params![rev as i64, record],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn revision(&self, rev: Revision) -> Result<Vec<u8>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached("SELECT record FROM revisions WHERE rev = ?1")?;
        stmt.query_row(params![rev as i64], |r| r.get(0))
            .optional()?
            .ok_or(FsError::NotFound(NotFoundKind::Revision(rev)))
    }

    fn youngest(&self) -> Result<Option<Revision>> {
        query_youngest(&self.conn())
    }

    fn read_meta(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached("SELECT data FROM meta WHERE name = ?1")?;
        Ok(stmt.query_row(params![name], |r| r.get(0)).optional()?)
    }

    fn write_meta(&self, name: &str, data: &[u8]) -> Result<()> {
        self.conn().execute(
            "INSERT INTO meta (name, data) VALUES (?1, ?2) \
             ON CONFLICT(name) DO UPDATE SET data = excluded.data",
            params![name, data],
        )?;
        Ok(())
    }

    fn remove_meta(&self, name: &str) -> Result<()> {
        self.conn()
            .execute("DELETE FROM meta WHERE name = ?1", params![name])?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}
