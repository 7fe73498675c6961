//! Persistence layer: one SQLite file holds every video's metadata, transcript,
//! and enhancement telemetry (§3, §4.1).

pub mod models;
pub mod schema;
pub mod sqlite_helpers;
pub mod store;

pub use store::Store;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{ConnectOptions, Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;

/// Bumped whenever [schema] changes shape. Stored in `PRAGMA user_version`,
/// which doubles as the database's own header for "have I been set up".
pub const CURRENT_SCHEMA_VERSION: i64 = 3;

pub(crate) async fn connect_pool(database_path: &Path) -> anyhow::Result<SqlitePool> {
    if let Some(parent) = database_path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let options = SqliteConnectOptions::from_str(&format!(
        "sqlite://{}",
        database_path.display()
    ))?
    .create_if_missing(true)
    .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
    .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
    .foreign_keys(false)
    .disable_statement_logging();

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;
    Ok(pool)
}

async fn user_version(pool: &SqlitePool) -> anyhow::Result<i64> {
    let row = sqlx::query("PRAGMA user_version").fetch_one(pool).await?;
    Ok(row.get::<i64, _>(0))
}

async fn set_user_version(pool: &SqlitePool, version: i64) -> anyhow::Result<()> {
    sqlx::query(&format!("PRAGMA user_version = {version}"))
        .execute(pool)
        .await?;
    Ok(())
}

/// Runs the fixed v0→v1→v2→v3 ladder (§4.1). Every step is idempotent, so this
/// is safe to call unconditionally on every process start, including against a
/// database stamped with a version that's ahead of what the binary in hand
/// knows about — the worst case is redundant work, not corruption.
pub async fn migrate(pool: &SqlitePool) -> anyhow::Result<()> {
    let version = user_version(pool).await?;

    if version < 1 {
        schema::ensure_tables(pool).await?;
    }
    if version < 2 {
        schema::ensure_tables(pool).await?;
        schema::rebuild_fts(pool).await?;
    }
    if version < CURRENT_SCHEMA_VERSION {
        schema::ensure_tables(pool).await?;
    }

    set_user_version(pool, CURRENT_SCHEMA_VERSION).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrate_from_scratch_sets_version_and_creates_tables() {
        let pool = connect_pool(Path::new(":memory:")).await.unwrap();
        migrate(&pool).await.unwrap();
        assert_eq!(user_version(&pool).await.unwrap(), CURRENT_SCHEMA_VERSION);

        let row = sqlx::query("SELECT COUNT(*) as c FROM videos")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row.get::<i64, _>("c"), 0);
    }

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let pool = connect_pool(Path::new(":memory:")).await.unwrap();
        migrate(&pool).await.unwrap();
        migrate(&pool).await.unwrap();
        assert_eq!(user_version(&pool).await.unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn fts_search_finds_inserted_segment_text() {
        let pool = connect_pool(Path::new(":memory:")).await.unwrap();
        migrate(&pool).await.unwrap();

        sqlx::query("INSERT INTO videos (video_id, source_kind, source_uri, status, created_at, updated_at) VALUES ('v1', 'file', '/tmp/v1.mp4', 'done', '', '')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO segments (video_id, start_ms, end_ms, text) VALUES ('v1', 0, 1000, 'hello cruel world')")
            .execute(&pool)
            .await
            .unwrap();

        let rows = sqlx::query("SELECT video_id FROM segments_fts WHERE segments_fts MATCH 'cruel'")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }
}
