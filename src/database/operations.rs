use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use thiserror::Error;

use crate::database::schema::{initialize_schema, run_migrations};
use crate::database::store::{BackingStore, StoredEvent};
use crate::events::Event;
use crate::logging::{MetricsLogger, PerformanceMonitor};
use crate::models::{Chain, Identity, Trade, Transfer};

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database connection failed: {0}")]
    Connection(#[from] rusqlite::Error),
    #[error("Database operation failed: {0}")]
    Operation(String),
    #[error("Record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Record not found")]
    NotFound,
}

/// SQLite backing store.
///
/// Identities are also held in memory; detectors read them on every kill.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    identities: Arc<RwLock<HashMap<String, Identity>>>,
}

impl Database {
    /// Create a new database connection and initialize schema
    pub fn new(db_path: &str) -> Result<Self, DbError> {
        let conn = Connection::open(db_path)?;
        Self::from_connection(conn)
    }

    /// Like `new`, waiting up to `busy_timeout` for locks held by other processes
    pub fn with_busy_timeout(db_path: &str, busy_timeout: Duration) -> Result<Self, DbError> {
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(busy_timeout)?;
        Self::from_connection(conn)
    }

    /// Create an in-memory database for testing
    pub fn new_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, DbError> {
        initialize_schema(&conn)?;
        run_migrations(&conn)?;

        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
            identities: Arc::new(RwLock::new(HashMap::new())),
        };
        db.prefetch_identities()?;
        Ok(db)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Operation("Failed to acquire lock".to_string()))
    }

    fn prefetch_identities(&self) -> Result<(), DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT record FROM identities")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut cache = HashMap::new();
        for row in rows {
            let identity: Identity = serde_json::from_str(&row?)?;
            cache.insert(identity.address.to_lowercase(), identity);
        }
        drop(stmt);
        drop(conn);

        let mut identities = self.identities.write().map_err(|_| DbError::Operation("Identity cache poisoned".to_string()))?;
        *identities = cache;
        Ok(())
    }

    /// Delete a transfer, used when a block has to be replayed
    pub fn delete_transfer(&self, chain: Chain, block_number: u64, log_index: u32) -> Result<(), DbError> {
        let conn = self.lock()?;
        let rows_affected = conn.execute(
            "DELETE FROM transfers WHERE chain = ?1 AND block_number = ?2 AND log_index = ?3",
            params![chain.as_str(), block_number, log_index],
        )?;
        if rows_affected == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    pub fn delete_trade(&self, id: &str, market: &str) -> Result<(), DbError> {
        let conn = self.lock()?;
        let rows_affected = conn.execute("DELETE FROM trades WHERE id = ?1 AND market = ?2", params![id, market])?;
        if rows_affected == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Drop transfers and trades older than `age`; events are kept
    pub fn clean_old_records(&self, age: Duration) -> Result<usize, DbError> {
        let cutoff = Utc::now().timestamp() - age.as_secs() as i64;
        let conn = self.lock()?;
        let transfers = conn.execute("DELETE FROM transfers WHERE timestamp IS NOT NULL AND timestamp < ?1", params![cutoff])?;
        let trades = conn.execute("DELETE FROM trades WHERE timestamp < ?1", params![cutoff])?;
        Ok(transfers + trades)
    }

    pub fn count_transfers(&self) -> Result<u64, DbError> {
        let conn = self.lock()?;
        let count: u64 = conn.query_row("SELECT COUNT(*) FROM transfers", [], |row| row.get(0))?;
        Ok(count)
    }

    fn query_transfers(&self, sql: &str, param: &dyn rusqlite::ToSql) -> Result<Vec<Transfer>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([param], |row| row.get::<_, String>(0))?;

        let mut transfers = Vec::new();
        for row in rows {
            transfers.push(Transfer::from_record(serde_json::from_str(&row?)?)?);
        }
        Ok(transfers)
    }
}

impl BackingStore for Database {
    fn insert_transfers(&self, transfers: &[Transfer]) -> Result<usize, DbError> {
        let monitor = PerformanceMonitor::new("db_insert_transfers");
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO transfers (chain, block_number, log_index, hash, timestamp, record)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for tf in transfers {
                let record = tf.to_record().map_err(|e| DbError::Operation(e.to_string()))?;
                let record = serde_json::to_string(&record)?;
                stmt.execute(params![
                    tf.chain.as_str(),
                    tf.block_number,
                    tf.log_index,
                    tf.hash,
                    tf.timestamp.map(|t| t.timestamp()),
                    record
                ])?;
            }
        }
        tx.commit()?;
        MetricsLogger::log_database_operation("insert_transfers", monitor.finish(), Some(transfers.len()));
        Ok(transfers.len())
    }

    fn insert_trades(&self, trades: &[Trade]) -> Result<usize, DbError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO trades (id, market, timestamp, record) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for trade in trades {
                stmt.execute(params![
                    trade.id,
                    trade.market.as_str(),
                    trade.timestamp.timestamp(),
                    serde_json::to_string(trade)?
                ])?;
            }
        }
        tx.commit()?;
        Ok(trades.len())
    }

    fn get_recent_transfers(&self, after: DateTime<Utc>) -> Result<Vec<Transfer>, DbError> {
        self.query_transfers(
            "SELECT record FROM transfers WHERE timestamp > ?1 ORDER BY timestamp, block_number, log_index",
            &after.timestamp(),
        )
    }

    fn get_recent_trades(&self, after: DateTime<Utc>, window: Duration) -> Result<Vec<Trade>, DbError> {
        let earliest = Utc::now() - chrono::Duration::seconds(window.as_secs() as i64);
        let after = after.max(earliest);

        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT record FROM trades WHERE timestamp > ?1 ORDER BY timestamp")?;
        let rows = stmt.query_map(params![after.timestamp()], |row| row.get::<_, String>(0))?;

        let mut trades = Vec::new();
        for row in rows {
            trades.push(serde_json::from_str(&row?)?);
        }
        Ok(trades)
    }

    fn get_transfer_by_hash(&self, hash: &str) -> Result<Option<Transfer>, DbError> {
        Ok(self
            .query_transfers("SELECT record FROM transfers WHERE hash = ?1 ORDER BY block_number, log_index", &hash)?
            .into_iter()
            .next())
    }

    fn get_transfers_by_hash(&self, hashes: &[String]) -> Result<Vec<Option<Transfer>>, DbError> {
        hashes.iter().map(|hash| self.get_transfer_by_hash(hash)).collect()
    }

    fn get_latest_block(&self, chain: Chain) -> Result<Option<u64>, DbError> {
        let conn = self.lock()?;
        let block: Option<u64> = conn.query_row(
            "SELECT MAX(block_number) FROM transfers WHERE chain = ?1",
            params![chain.as_str()],
            |row| row.get(0),
        )?;
        Ok(block)
    }

    fn insert_identities(&self, identities: &[Identity], full: bool) -> Result<usize, DbError> {
        let normalized: Vec<Identity> = identities.iter().cloned().map(Identity::normalized).collect();

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        if full {
            tx.execute("DELETE FROM identities", [])?;
        }
        {
            let mut stmt = tx.prepare("INSERT OR REPLACE INTO identities (address, record) VALUES (?1, ?2)")?;
            for identity in &normalized {
                stmt.execute(params![identity.address, serde_json::to_string(identity)?])?;
            }
        }
        tx.commit()?;
        drop(conn);

        let mut cache = self.identities.write().map_err(|_| DbError::Operation("Identity cache poisoned".to_string()))?;
        if full {
            cache.clear();
        }
        for identity in normalized {
            cache.insert(identity.address.clone(), identity);
        }
        Ok(identities.len())
    }

    fn get_identity(&self, address: &str) -> Result<Option<Identity>, DbError> {
        let cache = self.identities.read().map_err(|_| DbError::Operation("Identity cache poisoned".to_string()))?;
        Ok(cache.get(&address.to_lowercase()).cloned())
    }

    fn get_identities(&self) -> Result<Vec<Identity>, DbError> {
        let cache = self.identities.read().map_err(|_| DbError::Operation("Identity cache poisoned".to_string()))?;
        Ok(cache.values().cloned().collect())
    }

    fn count_identities_with_stake(&self, min_stake: Decimal) -> Result<u64, DbError> {
        let cache = self.identities.read().map_err(|_| DbError::Operation("Identity cache poisoned".to_string()))?;
        Ok(cache.values().filter(|i| i.stake >= min_stake).count() as u64)
    }

    fn insert_event(&self, channel: &str, message: &str, event: &Event) -> Result<(), DbError> {
        let record = event.to_record().map_err(|e| DbError::Operation(e.to_string()))?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO events (id, channel, message, record) VALUES (?1, ?2, ?3, ?4)",
            params![event.id(), channel, message, serde_json::to_string(&record)?],
        )?;
        Ok(())
    }

    fn get_event(&self, id: u64) -> Result<Option<StoredEvent>, DbError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT id, channel, message, record FROM events WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, u64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((id, channel, message, record)) => Ok(Some(StoredEvent {
                id,
                channel,
                message,
                record: serde_json::from_str(&record)?,
            })),
            None => Ok(None),
        }
    }
}
