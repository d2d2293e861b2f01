//! Shared test utilities for skelo integration tests.
//!
//! Each test gets its own SQLite database file in a private temp directory,
//! with the schema applied. Dropping the returned [`TestDb`] removes the
//! directory, so tests are fully isolated and idempotent.

use sqlx::SqlitePool;
use tempfile::TempDir;

use skelo_db::config::DbConfig;
use skelo_db::pool;

/// A pool plus the temp directory that owns the database file.
///
/// Keep this alive for the duration of the test; the directory (and the
/// database) are deleted when it is dropped.
pub struct TestDb {
    pub pool: SqlitePool,
    _dir: TempDir,
}

/// Create a fresh database with the schema applied.
pub async fn create_test_db() -> TestDb {
    let dir = TempDir::new().expect("failed to create temp directory");
    let config = DbConfig::new(dir.path().join("skelo-test.db"));

    let pool = pool::create_pool(&config)
        .await
        .expect("failed to open test database");

    TestDb { pool, _dir: dir }
}
