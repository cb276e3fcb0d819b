//! SQLite pool construction and schema management.
//!
//! The schema is embedded from `migrations/0001_init.sql` so the binary
//! and the test suite apply exactly the same DDL.

use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::path::Path;

const SCHEMA: &str = include_str!("../migrations/0001_init.sql");

/// Open (or create) the metadata database at `path`.
///
/// Foreign keys are enabled on every connection; bucket deletion relies on
/// `ON DELETE CASCADE` to drop the bucket's object rows.
pub async fn connect(path: impl AsRef<Path>) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .foreign_keys(true);

    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
}

/// Apply the embedded schema. Statements are idempotent, so running this
/// on every startup is safe.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let statements = SCHEMA
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    tracing::debug!("applying {} schema statements", statements.len());

    for stmt in statements {
        sqlx::query(stmt).execute(pool).await?;
    }

    Ok(())
}
