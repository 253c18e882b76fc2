//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: upstream messages table and the two result tables
    r#"
    -- ============================================
    -- Upstream (owned by the chat system; created here only if absent)
    -- ============================================

    CREATE TABLE IF NOT EXISTS messages (
        id               INTEGER PRIMARY KEY,
        session_id       TEXT NOT NULL,
        user_id          TEXT,
        role             TEXT NOT NULL,
        content          TEXT,
        timestamp        DATETIME NOT NULL,
        tool_call_id     TEXT
    );

    -- ============================================
    -- Results
    -- ============================================

    CREATE TABLE IF NOT EXISTS session_classification (
        session_id           TEXT PRIMARY KEY,
        primary_category     TEXT NOT NULL,
        all_categories       JSON NOT NULL,
        processed_upto       DATETIME NOT NULL,
        run_at               DATETIME NOT NULL,
        model                TEXT NOT NULL,
        instructions_version TEXT,
        notes                TEXT
    );

    CREATE TABLE IF NOT EXISTS message_classification (
        message_id           INTEGER PRIMARY KEY,
        session_id           TEXT NOT NULL,
        role                 TEXT NOT NULL,
        primary_category     TEXT NOT NULL,
        all_categories       JSON NOT NULL,
        run_at               DATETIME NOT NULL,
        model                TEXT NOT NULL,
        instructions_version TEXT
    );

    -- ============================================
    -- Indexes
    -- ============================================

    CREATE INDEX IF NOT EXISTS idx_messages_session_ts ON messages(session_id, timestamp);
    CREATE INDEX IF NOT EXISTS idx_message_classification_session ON message_classification(session_id);
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    tracing::info!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrations complete"
        );
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}
