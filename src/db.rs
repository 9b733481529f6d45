//! Shared SQLite handle.
//!
//! One database file holds the ingested snapshot tables, the recommendations
//! table, and the append-only change log. WAL mode keeps dashboard reads
//! cheap while the execution path writes.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use std::sync::Arc;
use tracing::{info, warn};

pub type Db = Arc<Mutex<Connection>>;

const PRAGMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -32000;
PRAGMA temp_store = MEMORY;
PRAGMA foreign_keys = ON;
"#;

/// Open (or create) the database and apply every module's schema.
pub fn open(path: &str) -> Result<Db> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX; // locking handled by the outer Mutex

    let conn = Connection::open_with_flags(path, flags)
        .with_context(|| format!("failed to open database at {path}"))?;

    init_schema(&conn)?;

    let journal_mode: String = conn
        .query_row("PRAGMA journal_mode", [], |row| row.get(0))
        .unwrap_or_default();
    if journal_mode.to_lowercase() != "wal" {
        warn!(journal_mode, "WAL mode not active");
    }

    info!(path, "database initialized");
    Ok(Arc::new(Mutex::new(conn)))
}

/// In-memory database for tests.
pub fn open_in_memory() -> Result<Db> {
    let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
    init_schema(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(PRAGMA_SQL).context("failed to apply pragmas")?;
    conn.execute_batch(crate::warehouse::SCHEMA_SQL)
        .context("failed to initialize snapshot schema")?;
    conn.execute_batch(crate::approval::SCHEMA_SQL)
        .context("failed to initialize recommendations schema")?;
    conn.execute_batch(crate::ledger::SCHEMA_SQL)
        .context("failed to initialize change log schema")?;
    Ok(())
}
