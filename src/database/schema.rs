use rusqlite::{Connection, Result};

const SCHEMA_VERSION: i64 = 1;

/// Initialize the database schema with required tables
pub fn initialize_schema(conn: &Connection) -> Result<()> {
    // Transfers keep their full record form; the columns exist for lookups
    conn.execute(
        "CREATE TABLE IF NOT EXISTS transfers (
            chain TEXT NOT NULL,
            block_number INTEGER NOT NULL,
            log_index INTEGER NOT NULL,
            hash TEXT NOT NULL,
            timestamp INTEGER,
            record TEXT NOT NULL,
            PRIMARY KEY (chain, block_number, log_index)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS trades (
            id TEXT NOT NULL,
            market TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            record TEXT NOT NULL,
            PRIMARY KEY (id, market)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS identities (
            address TEXT PRIMARY KEY,
            record TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY,
            channel TEXT NOT NULL,
            message TEXT NOT NULL,
            record TEXT NOT NULL,
            created_at INTEGER DEFAULT (strftime('%s', 'now'))
        )",
        [],
    )?;

    conn.execute("CREATE INDEX IF NOT EXISTS idx_transfers_timestamp ON transfers(timestamp)", [])?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_transfers_hash ON transfers(hash)", [])?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_trades_timestamp ON trades(timestamp)", [])?;

    Ok(())
}

/// Bring an existing database up to the current schema version
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version < SCHEMA_VERSION {
        initialize_schema(conn)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    }
    Ok(())
}
