//! Schema bootstrap for the metadata tables.

use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};

/// Schema applied on startup; every statement is idempotent.
const INIT_SQL: &str = include_str!("../../migrations/0001_init.sql");

/// Run the embedded migration statements one by one.
pub async fn run_migrations(db: &SqlitePool) -> Result<(), sqlx::Error> {
    let statements = INIT_SQL
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    tracing::info!("Running {} migration statements...", statements.len());

    for stmt in statements {
        tracing::debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(db).await?;
    }

    Ok(())
}

/// Single-connection in-memory pool with the schema applied.
///
/// One connection is required: each SQLite `:memory:` connection is its own
/// database.
pub async fn memory_pool() -> Result<SqlitePool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}
