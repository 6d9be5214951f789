use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create all tables if missing. Idempotent; safe to run on every startup.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    // App metadata snapshots, one row per store app id
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS apps (
            app_id TEXT PRIMARY KEY,
            platform TEXT NOT NULL,
            title TEXT NOT NULL,
            icon TEXT,
            developer TEXT,
            categories_json TEXT NOT NULL DEFAULT '[]',
            description TEXT NOT NULL DEFAULT '',
            score REAL,
            ratings INTEGER,
            histogram_json TEXT,
            installs TEXT,
            version TEXT,
            raw_json TEXT NOT NULL DEFAULT 'null',
            last_fetched INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Review sample, replaced wholesale on each re-fetch
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS reviews (
            app_id TEXT NOT NULL,
            id TEXT NOT NULL,
            user_name TEXT NOT NULL,
            user_image TEXT,
            date INTEGER NOT NULL,
            score INTEGER NOT NULL,
            title TEXT,
            text TEXT NOT NULL,
            thumbs_up INTEGER,
            version TEXT,
            PRIMARY KEY (app_id, id),
            FOREIGN KEY (app_id) REFERENCES apps(app_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Cached per-app analyses, invalidated together with reviews
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS analyses (
            app_id TEXT PRIMARY KEY,
            analysis_json TEXT NOT NULL,
            review_count INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (app_id) REFERENCES apps(app_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Cached comparisons, keyed by the sorted app-id set
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS comparisons (
            id TEXT PRIMARY KEY,
            app_set TEXT NOT NULL UNIQUE,
            comparison_json TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_reviews_app_id ON reviews(app_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_apps_last_fetched ON apps(last_fetched DESC)")
        .execute(pool)
        .await?;

    Ok(())
}
