use rusqlite::Connection;

use crate::error::StorageError;

pub const SCHEMA_VERSION: i32 = 1;

pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA cache_size = -32000;
        PRAGMA busy_timeout = 5000;
    ",
    )?;
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (?1, unixepoch())",
        [SCHEMA_VERSION],
    )?;
    Ok(())
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS layer_fields (
    position INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE CHECK (length(name) > 0),
    field_type TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS features (
    fid INTEGER PRIMARY KEY AUTOINCREMENT,
    attributes BLOB NOT NULL,
    geometry BLOB,
    xmin REAL,
    ymin REAL,
    xmax REAL,
    ymax REAL
);
CREATE INDEX IF NOT EXISTS idx_features_bbox ON features (xmin, xmax, ymin, ymax);
";
