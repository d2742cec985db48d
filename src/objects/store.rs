//! Object persistence and CRUD operations

use anyhow::Result;
use sqlx::SqlitePool;
use tracing::info;

use super::record::{ALIAS_HOLDER_ID, ROOT_ID};
use super::{Methods, ObjectId, ObjectRecord, StoredProperties};
use crate::db::Database;

/// Which records a full scan returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scan {
    /// Every record, recycled tombstones included
    All,
    /// Only records that have not been recycled
    Live,
}

/// Object storage with database backing
#[derive(Clone)]
pub struct ObjectStore {
    pool: SqlitePool,
}

impl ObjectStore {
    /// Create a new object store with the given connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (or create) a database and wrap it; `None` means in-memory
    pub async fn connect(path: Option<&str>) -> Result<Self> {
        let db = Database::new(path).await?;
        Ok(Self::new(db.pool().clone()))
    }

    /// Close the underlying pool; safe to call more than once
    pub async fn disconnect(&self) {
        self.pool.close().await;
    }

    pub fn is_connected(&self) -> bool {
        !self.pool.is_closed()
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the universal ancestor (#1) if absent; returns true if created
    pub async fn ensure_root(&self) -> Result<bool> {
        self.ensure_record(ROOT_ID).await
    }

    /// Create the alias holder (#0) if absent; returns true if created
    pub async fn ensure_alias_holder(&self) -> Result<bool> {
        self.ensure_record(ALIAS_HOLDER_ID).await
    }

    async fn ensure_record(&self, id: ObjectId) -> Result<bool> {
        if self.get(id).await?.is_some() {
            return Ok(false);
        }
        self.put(&ObjectRecord::new(id, None)).await?;
        info!("Created core object #{}", id);
        Ok(true)
    }

    /// Get an object by ID (recycled tombstones included)
    pub async fn get(&self, id: ObjectId) -> Result<Option<ObjectRecord>> {
        let row: Option<ObjectRow> = sqlx::query_as(
            r#"
            SELECT id, parent_id, properties, methods, recycled, version, created_at, modified_at
            FROM objects WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Some(r.into_record()?)),
            None => Ok(None),
        }
    }

    /// Insert or overwrite a record unconditionally
    pub async fn put(&self, record: &ObjectRecord) -> Result<()> {
        let properties = serde_json::to_string(&record.properties)?;
        let methods = serde_json::to_string(&record.methods)?;

        sqlx::query(
            r#"
            INSERT INTO objects (id, parent_id, properties, methods, recycled, version, created_at, modified_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                parent_id = excluded.parent_id,
                properties = excluded.properties,
                methods = excluded.methods,
                recycled = excluded.recycled,
                version = excluded.version,
                created_at = excluded.created_at,
                modified_at = excluded.modified_at
            "#,
        )
        .bind(record.id)
        .bind(record.parent)
        .bind(&properties)
        .bind(&methods)
        .bind(record.recycled)
        .bind(record.version)
        .bind(&record.created_at)
        .bind(&record.modified_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Write `record` only if the stored version still equals `expected_version`.
    /// Returns false when another writer got there first.
    pub async fn update(&self, record: &ObjectRecord, expected_version: i64) -> Result<bool> {
        let properties = serde_json::to_string(&record.properties)?;
        let methods = serde_json::to_string(&record.methods)?;

        let result = sqlx::query(
            r#"
            UPDATE objects
            SET parent_id = ?, properties = ?, methods = ?, recycled = ?, version = ?, modified_at = ?
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(record.parent)
        .bind(&properties)
        .bind(&methods)
        .bind(record.recycled)
        .bind(record.version)
        .bind(&record.modified_at)
        .bind(record.id)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Linear scan over every record, ordered by id
    pub async fn list_all(&self, scan: Scan) -> Result<Vec<ObjectRecord>> {
        let sql = match scan {
            Scan::All => {
                r#"
                SELECT id, parent_id, properties, methods, recycled, version, created_at, modified_at
                FROM objects ORDER BY id
                "#
            }
            Scan::Live => {
                r#"
                SELECT id, parent_id, properties, methods, recycled, version, created_at, modified_at
                FROM objects WHERE recycled = 0 ORDER BY id
                "#
            }
        };

        let rows: Vec<ObjectRow> = sqlx::query_as(sql).fetch_all(&self.pool).await?;
        rows.into_iter().map(|r| r.into_record()).collect()
    }

    /// Highest id ever stored, recycled or not
    pub async fn max_id(&self) -> Result<Option<ObjectId>> {
        let row: (Option<i64>,) = sqlx::query_as("SELECT MAX(id) FROM objects")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    /// Ids of recycled tombstones, ascending
    pub async fn recycled_ids(&self) -> Result<Vec<ObjectId>> {
        let rows: Vec<(i64,)> =
            sqlx::query_as("SELECT id FROM objects WHERE recycled = 1 ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Number of records, recycled included
    pub async fn count(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM objects")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }
}

/// Row type for SQLite queries
#[derive(sqlx::FromRow)]
struct ObjectRow {
    id: i64,
    parent_id: Option<i64>,
    properties: String,
    methods: String,
    recycled: bool,
    version: i64,
    created_at: String,
    modified_at: String,
}

impl ObjectRow {
    fn into_record(self) -> Result<ObjectRecord> {
        let properties: StoredProperties = serde_json::from_str(&self.properties)?;
        let methods: Methods = serde_json::from_str(&self.methods)?;
        Ok(ObjectRecord {
            id: self.id,
            parent: self.parent_id,
            properties,
            methods,
            recycled: self.recycled,
            version: self.version,
            created_at: self.created_at,
            modified_at: self.modified_at,
        })
    }
}
