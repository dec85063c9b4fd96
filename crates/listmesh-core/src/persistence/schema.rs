//! SQLite schema for snapshot storage

/// Version recorded in `schema_version`; a database with any other
/// version is refused
pub const SCHEMA_VERSION: u32 = 1;

/// Row id under which a user's snapshot lives inside its own table
pub const SNAPSHOT_ROW_ID: &str = "store";

/// SQLite schema definition
pub struct Schema;

impl Schema {
    /// Get the bookkeeping tables SQL. Per-user snapshot tables are created
    /// on first write by [`Schema::snapshot_table`].
    pub fn create_tables() -> &'static str {
        r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One entry per per-user snapshot table
CREATE TABLE IF NOT EXISTS snapshot_index (
    storage_key TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#
    }

    /// SQL for the snapshot table of one storage key
    pub fn snapshot_table(table: &str) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (
    id TEXT PRIMARY KEY,
    snapshot TEXT NOT NULL,
    saved_at TEXT NOT NULL
);",
            quote_ident(table)
        )
    }
}

/// Quote an SQL identifier
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
