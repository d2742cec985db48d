//! Shared test utilities for database-backed tests
//!
//! Every helper builds on `Database::new(None)` so tests run against the same
//! schema as production.

use sqlx::SqlitePool;

use super::Database;
use crate::config::RuntimeConfig;
use crate::objects::{ObjectManager, ObjectStore};

/// Create an in-memory test database pool with full schema
pub async fn test_pool() -> SqlitePool {
    let db = Database::new(None)
        .await
        .expect("Failed to create test database");
    db.pool().clone()
}

/// Create an object store over a fresh in-memory database
pub async fn test_store() -> ObjectStore {
    ObjectStore::new(test_pool().await)
}

/// Open an object manager (Lua engine) over a fresh in-memory database
pub async fn test_manager() -> ObjectManager {
    ObjectManager::open(test_store().await, RuntimeConfig::default())
        .await
        .expect("Failed to open object manager")
}
