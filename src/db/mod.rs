//! Database module for the local resource cache
//!
//! Provides SQLite storage for synchronized resources, delivery assemblies,
//! settings and sync history. Every write touching one record is a single
//! statement or a transaction, so an interrupted sync never leaves a record
//! half-written.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

// Connection pooling
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

use crate::sync::models::{ResourceMap, ResourceRecord};

/// Database error types
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Database manager for thread-safe SQLite access
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl Database {
    /// Create a new database connection pool backed by a file
    pub fn new(db_path: PathBuf) -> DbResult<Self> {
        let manager = SqliteConnectionManager::file(&db_path);

        let pool = Pool::builder()
            .max_size(8)
            .min_idle(Some(2))
            .connection_timeout(std::time::Duration::from_secs(10))
            .test_on_check_out(false)
            .build(manager)?;

        let conn = pool.get()?;

        conn.execute_batch(r#"
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        "#)?;

        Self::initialize_schema(&conn)?;
        drop(conn);

        log::info!("Database opened at {:?}", db_path);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Create an in-memory database (for testing)
    ///
    /// Each in-memory SQLite connection is its own database, so the pool is
    /// pinned to a single connection.
    pub fn in_memory() -> DbResult<Self> {
        let manager = SqliteConnectionManager::memory();

        let pool = Pool::builder()
            .max_size(1)
            .build(manager)?;

        let conn = pool.get()?;
        Self::initialize_schema(&conn)?;
        drop(conn);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    fn initialize_schema(conn: &Connection) -> DbResult<()> {
        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;
        Ok(())
    }

    /// Get a pooled connection
    pub fn get_conn(&self) -> DbResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    // =========================================================================
    // RESOURCES
    // =========================================================================

    /// Load every cached record of a resource type, keyed by id
    pub fn list_resources(&self, resource_type: &str) -> DbResult<ResourceMap> {
        let rows = self.query(
            "SELECT id, checksum, payload FROM resources WHERE resource_type = ?1 ORDER BY id",
            params![resource_type],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )?;

        let mut resources = ResourceMap::new();
        for (id, checksum, payload) in rows {
            let record = decode_record(id, checksum, &payload)?;
            resources.insert(record.id.clone(), record);
        }

        Ok(resources)
    }

    /// Get a single cached record
    pub fn get_resource(&self, resource_type: &str, id: &str) -> DbResult<Option<ResourceRecord>> {
        let conn = self.get_conn()?;

        let row = conn
            .query_row(
                "SELECT id, checksum, payload FROM resources WHERE resource_type = ?1 AND id = ?2",
                params![resource_type, id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((id, checksum, payload)) => Ok(Some(decode_record(id, checksum, &payload)?)),
            None => Ok(None),
        }
    }

    /// Insert or replace a cached record
    pub fn upsert_resource(&self, resource_type: &str, record: &ResourceRecord) -> DbResult<()> {
        let conn = self.get_conn()?;
        upsert_resource_with(&conn, resource_type, record)
    }

    /// Insert or replace a delivery record together with its assembly
    pub fn upsert_resource_with_assembly(
        &self,
        resource_type: &str,
        record: &ResourceRecord,
        assembly: &[u8],
    ) -> DbResult<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        upsert_resource_with(&tx, resource_type, record)?;
        tx.execute(
            r#"
            INSERT OR REPLACE INTO delivery_assemblies (delivery_id, content, size, downloaded_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                record.id,
                assembly,
                assembly.len() as i64,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Delete a cached record
    ///
    /// Returns whether a record was actually removed.
    pub fn delete_resource(&self, resource_type: &str, id: &str) -> DbResult<bool> {
        let affected = self.execute(
            "DELETE FROM resources WHERE resource_type = ?1 AND id = ?2",
            params![resource_type, id],
        )?;

        Ok(affected > 0)
    }

    /// Delete a delivery record together with its assembly
    pub fn delete_resource_with_assembly(&self, resource_type: &str, id: &str) -> DbResult<bool> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        let affected = tx.execute(
            "DELETE FROM resources WHERE resource_type = ?1 AND id = ?2",
            params![resource_type, id],
        )?;
        tx.execute(
            "DELETE FROM delivery_assemblies WHERE delivery_id = ?1",
            params![id],
        )?;

        tx.commit()?;
        Ok(affected > 0)
    }

    /// Count cached records of a type
    pub fn count_resources(&self, resource_type: &str) -> DbResult<i64> {
        self.query_row(
            "SELECT COUNT(*) FROM resources WHERE resource_type = ?1",
            params![resource_type],
            |row| row.get(0),
        )
    }

    /// Get the stored assembly of a delivery
    pub fn get_assembly(&self, delivery_id: &str) -> DbResult<Option<Vec<u8>>> {
        let conn = self.get_conn()?;

        let content = conn
            .query_row(
                "SELECT content FROM delivery_assemblies WHERE delivery_id = ?1",
                params![delivery_id],
                |row| row.get(0),
            )
            .optional()?;

        Ok(content)
    }

    // =========================================================================
    // SETTINGS
    // =========================================================================

    /// Get a setting value
    pub fn get_setting<T: serde::de::DeserializeOwned>(&self, key: &str) -> DbResult<Option<T>> {
        let conn = self.get_conn()?;
        let result: Result<String, _> = conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            [key],
            |row| row.get(0),
        );

        match result {
            Ok(json) => {
                let value: T = serde_json::from_str(&json)
                    .map_err(|e| DbError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Set a setting value
    pub fn set_setting<T: Serialize>(&self, key: &str, value: &T) -> DbResult<()> {
        let conn = self.get_conn()?;
        let json = serde_json::to_string(value)
            .map_err(|e| DbError::Serialization(e.to_string()))?;

        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, json],
        )?;

        Ok(())
    }

    // =========================================================================
    // GENERIC HELPERS
    // =========================================================================

    /// Execute a statement and return the number of affected rows
    pub fn execute<P>(&self, sql: &str, params: P) -> DbResult<usize>
    where
        P: rusqlite::Params,
    {
        let conn = self.get_conn()?;

        let affected = conn.execute(sql, params)?;
        Ok(affected)
    }

    /// Execute an INSERT statement and return the last inserted row ID
    pub fn execute_insert<P>(&self, sql: &str, params: P) -> DbResult<i64>
    where
        P: rusqlite::Params,
    {
        let conn = self.get_conn()?;

        conn.execute(sql, params)?;
        Ok(conn.last_insert_rowid())
    }

    /// Query multiple rows
    pub fn query<T, P, F>(&self, sql: &str, params: P, f: F) -> DbResult<Vec<T>>
    where
        P: rusqlite::Params,
        F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.get_conn()?;

        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, f)?;

        rows.collect::<rusqlite::Result<Vec<T>>>()
            .map_err(DbError::from)
    }

    /// Query single row
    pub fn query_row<T, P, F>(&self, sql: &str, params: P, f: F) -> DbResult<T>
    where
        P: rusqlite::Params,
        F: FnOnce(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.get_conn()?;

        conn.query_row(sql, params, f).map_err(DbError::from)
    }

    /// Execute a batch of statements
    pub fn execute_batch(&self, sql: &str) -> DbResult<()> {
        let conn = self.get_conn()?;

        conn.execute_batch(sql).map_err(DbError::from)
    }
}

fn upsert_resource_with(conn: &Connection, resource_type: &str, record: &ResourceRecord) -> DbResult<()> {
    let payload = serde_json::to_string(&record.payload)
        .map_err(|e| DbError::Serialization(e.to_string()))?;

    conn.execute(
        r#"
        INSERT INTO resources (resource_type, id, checksum, payload, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(resource_type, id) DO UPDATE SET
            checksum = excluded.checksum,
            payload = excluded.payload,
            updated_at = excluded.updated_at
        "#,
        params![
            resource_type,
            record.id,
            record.checksum,
            payload,
            chrono::Utc::now().to_rfc3339(),
        ],
    )?;

    Ok(())
}

fn decode_record(id: String, checksum: Option<String>, payload: &str) -> DbResult<ResourceRecord> {
    let payload = serde_json::from_str(payload)
        .map_err(|e| DbError::Serialization(format!("resource {}: {}", id, e)))?;

    Ok(ResourceRecord {
        id,
        checksum,
        payload,
    })
}
