//! SQLite access: extension loading, connection setup, the single-writer
//! [`Database`] handle, health checks and timestamp encoding.

pub mod migrations;
pub mod schema;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};
use sqlite_vec::sqlite3_vec_init;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, Once, TryLockError};
use std::time::{Duration, Instant};

use crate::error::{TroveError, TroveResult};

static SQLITE_VEC_INIT: Once = Once::new();

/// Readers kept around between calls on a file-backed store.
const MAX_IDLE_READERS: usize = 4;

/// Register the sqlite-vec extension globally. Safe to call multiple times.
pub fn load_sqlite_vec() {
    SQLITE_VEC_INIT.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )));
    });
}

/// Per-store open options.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub embedding_dim: usize,
    pub write_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            embedding_dim: 384,
            write_timeout: Duration::from_millis(5000),
        }
    }
}

impl StoreOptions {
    pub fn from_config(config: &crate::config::TroveConfig) -> Self {
        Self {
            embedding_dim: config.embedding.dimensions,
            write_timeout: config.write_timeout(),
        }
    }
}

/// A project or global store.
///
/// All writes go through one connection guarded by a mutex with a bounded
/// wait, so at most one write transaction is in flight per store. File-backed
/// stores serve reads from separate WAL reader connections; in-memory stores
/// share the writer connection.
pub struct Database {
    path: Option<PathBuf>,
    writer: Mutex<Connection>,
    readers: Mutex<Vec<Connection>>,
    options: StoreOptions,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .field("options", &self.options)
            .finish()
    }
}

impl Database {
    /// Open (or create) the store at `path` with schema and migrations applied.
    pub fn open(path: impl AsRef<Path>, options: StoreOptions) -> TroveResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        discard_stale_artifacts(path);

        let conn = open_connection(path, &options)?;
        tracing::info!(path = %path.display(), "store opened");
        Ok(Self {
            path: Some(path.to_path_buf()),
            writer: Mutex::new(conn),
            readers: Mutex::new(Vec::new()),
            options,
        })
    }

    /// Open a private in-memory store.
    pub fn open_in_memory(options: StoreOptions) -> TroveResult<Self> {
        let conn = open_memory_connection(options.embedding_dim)?;
        Ok(Self {
            path: None,
            writer: Mutex::new(conn),
            readers: Mutex::new(Vec::new()),
            options,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn embedding_dim(&self) -> usize {
        self.options.embedding_dim
    }

    /// Run `f` inside an immediate write transaction. Commits on `Ok`, rolls
    /// back on `Err`. Fails with [`TroveError::StoreBusy`] if the writer is
    /// not free within the configured timeout.
    ///
    /// The timeout covers both waits: for the in-process mutex, then for
    /// SQLite's file lock held by other connections.
    pub fn write<T>(&self, f: impl FnOnce(&Transaction<'_>) -> TroveResult<T>) -> TroveResult<T> {
        let deadline = Instant::now() + self.options.write_timeout;
        let mut conn = self.lock_writer(deadline)?;
        conn.busy_timeout(deadline.saturating_duration_since(Instant::now()))?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Run `f` against a read connection. Sees only committed state.
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> TroveResult<T>) -> TroveResult<T> {
        let Some(path) = self.path.as_deref() else {
            let conn = self.lock_writer(Instant::now() + self.options.write_timeout)?;
            return f(&conn);
        };

        let pooled = self.readers.lock().ok().and_then(|mut pool| pool.pop());
        let conn = match pooled {
            Some(conn) => conn,
            None => open_reader(path, &self.options)?,
        };
        let out = f(&conn);
        if let Ok(mut pool) = self.readers.lock() {
            if pool.len() < MAX_IDLE_READERS {
                pool.push(conn);
            }
        }
        out
    }

    fn lock_writer(&self, deadline: Instant) -> TroveResult<MutexGuard<'_, Connection>> {
        loop {
            match self.writer.try_lock() {
                Ok(guard) => return Ok(guard),
                // A panicking writer dropped its transaction, which rolled back.
                Err(TryLockError::Poisoned(poisoned)) => return Ok(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        tracing::warn!(
                            timeout_ms = self.options.write_timeout.as_millis() as u64,
                            "write lock not acquired"
                        );
                        return Err(TroveError::StoreBusy);
                    }
                    std::thread::sleep(Duration::from_millis(2));
                }
            }
        }
    }
}

fn configure(conn: &Connection, options: &StoreOptions) -> rusqlite::Result<()> {
    conn.busy_timeout(options.write_timeout)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

/// Open a read-write connection, enable WAL and bring the schema up to date.
pub fn open_connection(path: &Path, options: &StoreOptions) -> TroveResult<Connection> {
    load_sqlite_vec();

    let conn = Connection::open(path)?;
    configure(&conn, options)?;
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        tracing::warn!(path = %path.display(), journal_mode = %mode, "WAL not enabled");
    }
    conn.pragma_update(None, "synchronous", "NORMAL")?;

    prepare_schema(&conn, options.embedding_dim)?;
    Ok(conn)
}

fn open_reader(path: &Path, options: &StoreOptions) -> TroveResult<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_URI,
    )?;
    configure(&conn, options)?;
    Ok(conn)
}

/// Open a fully initialized in-memory connection.
pub fn open_memory_connection(embedding_dim: usize) -> TroveResult<Connection> {
    load_sqlite_vec();
    let conn = Connection::open_in_memory()?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    prepare_schema(&conn, embedding_dim)?;
    Ok(conn)
}

fn prepare_schema(conn: &Connection, embedding_dim: usize) -> TroveResult<()> {
    schema::init_schema(conn, embedding_dim)?;
    migrations::run_migrations(conn)?;

    if let Some(stored) = schema::stored_dimensions(conn)? {
        if stored != embedding_dim {
            return Err(TroveError::validation(format!(
                "store was created with {stored}-dimension vectors, configured {embedding_dim}"
            )));
        }
    }
    Ok(())
}

/// Remove leftovers from an unclean shutdown that would block opening.
///
/// A `-shm` file without its `-wal` is stale, as is a zero-length rollback
/// `-journal`. A non-empty `-wal` is left alone: SQLite replays it.
pub fn discard_stale_artifacts(db_path: &Path) {
    let sibling = |suffix: &str| {
        let mut name = db_path.as_os_str().to_owned();
        name.push(suffix);
        PathBuf::from(name)
    };

    let wal = sibling("-wal");
    let shm = sibling("-shm");
    let journal = sibling("-journal");

    if shm.exists() && !wal.exists() {
        match std::fs::remove_file(&shm) {
            Ok(()) => tracing::info!(path = %shm.display(), "removed stale shared-memory file"),
            Err(e) => tracing::warn!(path = %shm.display(), error = %e, "could not remove stale file"),
        }
    }

    let empty_journal = std::fs::metadata(&journal)
        .map(|m| m.len() == 0)
        .unwrap_or(false);
    if empty_journal {
        match std::fs::remove_file(&journal) {
            Ok(()) => tracing::info!(path = %journal.display(), "removed empty rollback journal"),
            Err(e) => tracing::warn!(path = %journal.display(), error = %e, "could not remove stale file"),
        }
    }
}

/// Health report for a store.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthReport {
    pub schema_version: u32,
    pub sqlite_vec_version: String,
    pub embedding_model: Option<String>,
    pub memory_count: i64,
    pub relationship_count: i64,
    pub activity_count: i64,
    pub session_count: i64,
    pub pending_embeddings: i64,
    pub integrity_ok: bool,
    pub integrity_details: String,
}

/// Run integrity and bookkeeping checks against an open connection.
pub fn check_database_health(conn: &Connection) -> TroveResult<HealthReport> {
    let count = |sql: &str| -> rusqlite::Result<i64> { conn.query_row(sql, [], |r| r.get(0)) };

    let integrity_details: String = conn.query_row("PRAGMA integrity_check", [], |r| r.get(0))?;

    Ok(HealthReport {
        schema_version: migrations::get_schema_version(conn)?,
        sqlite_vec_version: conn.query_row("SELECT vec_version()", [], |r| r.get(0))?,
        embedding_model: migrations::get_embedding_model(conn)?,
        memory_count: count("SELECT COUNT(*) FROM memories")?,
        relationship_count: count("SELECT COUNT(*) FROM relationships")?,
        activity_count: count("SELECT COUNT(*) FROM activities")?,
        session_count: count("SELECT COUNT(*) FROM sessions")?,
        pending_embeddings: count("SELECT COUNT(*) FROM memories WHERE embedding_pending = 1")?,
        integrity_ok: integrity_details == "ok",
        integrity_details,
    })
}

/// Encode a timestamp for storage (RFC 3339, microseconds, `Z`).
///
/// Fixed width, so lexical order in SQL equals chronological order.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

/// Read a timestamp column.
pub fn ts_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw)
}

pub fn opt_ts_column(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.as_deref().map(parse_ts).transpose()
}
