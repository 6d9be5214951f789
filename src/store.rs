//! Fetch-or-cache layer over SQLite.
//!
//! [`AppDataStore`] answers "give me this app's metadata and reviews" from
//! the local database when the snapshot is fresher than the TTL, and falls
//! back to the external fetcher otherwise. Re-fetches overwrite the app row
//! and replace its review sample wholesale inside one transaction, so a
//! reader never observes fresh metadata paired with a stale or partial
//! sample. Cached analyses are invalidated in the same transaction.
//!
//! Two requests analyzing the same app id concurrently race on this replace;
//! the last writer wins. There is no per-app lock.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::fetcher::ReviewSource;
use crate::models::{AppAnalysis, AppInfo, ComparisonResult, FetchedApp, Platform, Review};

/// Review rows are written in batches of this size.
const REVIEW_BATCH: usize = 100;

#[derive(Clone)]
pub struct AppDataStore {
    pool: SqlitePool,
    ttl: Duration,
}

impl AppDataStore {
    pub fn new(pool: SqlitePool, ttl_days: i64) -> Self {
        Self {
            pool,
            ttl: Duration::days(ttl_days),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Return the cached snapshot if fresh, otherwise fetch and persist.
    ///
    /// Fetch errors propagate unchanged; nothing is written on a failed
    /// fetch and no retry happens at this layer.
    pub async fn get_or_fetch(
        &self,
        source: &dyn ReviewSource,
        app_id: &str,
        platform: Platform,
        review_count: usize,
    ) -> Result<FetchedApp> {
        if let Some(cached) = self.load_fresh(app_id).await? {
            return Ok(cached);
        }

        let fetched = source.fetch(app_id, platform, review_count).await?;
        self.save(&fetched).await?;
        Ok(fetched)
    }

    /// Load the snapshot for an app if it exists and is within the TTL.
    pub async fn load_fresh(&self, app_id: &str) -> Result<Option<FetchedApp>> {
        let Some(info) = self.load_app(app_id).await? else {
            return Ok(None);
        };
        if Utc::now() - info.last_fetched >= self.ttl {
            return Ok(None);
        }
        let reviews = self.load_reviews(app_id).await?;
        Ok(Some(FetchedApp { info, reviews }))
    }

    async fn load_app(&self, app_id: &str) -> Result<Option<AppInfo>> {
        let row = sqlx::query(
            r#"
            SELECT app_id, platform, title, icon, developer, categories_json, description,
                   score, ratings, histogram_json, installs, version, raw_json, last_fetched
            FROM apps WHERE app_id = ?
            "#,
        )
        .bind(app_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let platform_str: String = row.try_get("platform")?;
        let platform = Platform::parse(&platform_str)
            .with_context(|| format!("Unknown platform in apps row: {}", platform_str))?;
        let categories_json: String = row.try_get("categories_json")?;
        let histogram_json: Option<String> = row.try_get("histogram_json")?;
        let raw_json: String = row.try_get("raw_json")?;
        let last_fetched: i64 = row.try_get("last_fetched")?;

        Ok(Some(AppInfo {
            app_id: row.try_get("app_id")?,
            platform,
            title: row.try_get("title")?,
            icon: row.try_get("icon")?,
            developer: row.try_get("developer")?,
            categories: serde_json::from_str(&categories_json).unwrap_or_default(),
            description: row.try_get("description")?,
            score: row.try_get("score")?,
            ratings: row.try_get("ratings")?,
            histogram: histogram_json.and_then(|h| serde_json::from_str(&h).ok()),
            installs: row.try_get("installs")?,
            version: row.try_get("version")?,
            raw: serde_json::from_str(&raw_json).unwrap_or(serde_json::Value::Null),
            last_fetched: timestamp_to_datetime(last_fetched),
        }))
    }

    async fn load_reviews(&self, app_id: &str) -> Result<Vec<Review>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_name, user_image, date, score, title, text, thumbs_up, version
            FROM reviews WHERE app_id = ? ORDER BY date DESC
            "#,
        )
        .bind(app_id)
        .fetch_all(&self.pool)
        .await?;

        let mut reviews = Vec::with_capacity(rows.len());
        for row in rows {
            let date: i64 = row.try_get("date")?;
            reviews.push(Review {
                id: row.try_get("id")?,
                user_name: row.try_get("user_name")?,
                user_image: row.try_get("user_image")?,
                date: timestamp_to_datetime(date),
                score: row.try_get("score")?,
                title: row.try_get("title")?,
                text: row.try_get("text")?,
                thumbs_up: row.try_get("thumbs_up")?,
                version: row.try_get("version")?,
            });
        }
        Ok(reviews)
    }

    /// Upsert the app row and replace its reviews in one transaction. The
    /// cached analysis for the app is dropped alongside the old sample.
    async fn save(&self, fetched: &FetchedApp) -> Result<()> {
        let info = &fetched.info;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO apps (app_id, platform, title, icon, developer, categories_json,
                              description, score, ratings, histogram_json, installs, version,
                              raw_json, last_fetched)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(app_id) DO UPDATE SET
                platform = excluded.platform,
                title = excluded.title,
                icon = excluded.icon,
                developer = excluded.developer,
                categories_json = excluded.categories_json,
                description = excluded.description,
                score = excluded.score,
                ratings = excluded.ratings,
                histogram_json = excluded.histogram_json,
                installs = excluded.installs,
                version = excluded.version,
                raw_json = excluded.raw_json,
                last_fetched = excluded.last_fetched
            "#,
        )
        .bind(&info.app_id)
        .bind(info.platform.as_str())
        .bind(&info.title)
        .bind(&info.icon)
        .bind(&info.developer)
        .bind(serde_json::to_string(&info.categories)?)
        .bind(&info.description)
        .bind(info.score)
        .bind(info.ratings)
        .bind(match &info.histogram {
            Some(h) => Some(serde_json::to_string(h)?),
            None => None,
        })
        .bind(&info.installs)
        .bind(&info.version)
        .bind(serde_json::to_string(&info.raw)?)
        .bind(info.last_fetched.timestamp())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM reviews WHERE app_id = ?")
            .bind(&info.app_id)
            .execute(&mut *tx)
            .await?;

        for batch in fetched.reviews.chunks(REVIEW_BATCH) {
            for review in batch {
                sqlx::query(
                    r#"
                    INSERT OR IGNORE INTO reviews
                        (app_id, id, user_name, user_image, date, score, title, text, thumbs_up, version)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&info.app_id)
                .bind(&review.id)
                .bind(&review.user_name)
                .bind(&review.user_image)
                .bind(review.date.timestamp())
                .bind(review.score)
                .bind(&review.title)
                .bind(&review.text)
                .bind(review.thumbs_up)
                .bind(&review.version)
                .execute(&mut *tx)
                .await?;
            }
        }

        // The old analysis described the replaced sample
        sqlx::query("DELETE FROM analyses WHERE app_id = ?")
            .bind(&info.app_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Cached analysis for an app, with the sample size it was derived from.
    pub async fn cached_analysis(&self, app_id: &str) -> Result<Option<(AppAnalysis, i64)>> {
        let row = sqlx::query(
            "SELECT analysis_json, review_count, created_at FROM analyses WHERE app_id = ?",
        )
        .bind(app_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let created_at: i64 = row.try_get("created_at")?;
        if Utc::now() - timestamp_to_datetime(created_at) >= self.ttl {
            return Ok(None);
        }
        let json: String = row.try_get("analysis_json")?;
        let review_count: i64 = row.try_get("review_count")?;
        let analysis: AppAnalysis =
            serde_json::from_str(&json).context("Corrupt analysis_json in analyses row")?;
        Ok(Some((analysis, review_count)))
    }

    pub async fn save_analysis(
        &self,
        app_id: &str,
        analysis: &AppAnalysis,
        review_count: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO analyses (app_id, analysis_json, review_count, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(app_id) DO UPDATE SET
                analysis_json = excluded.analysis_json,
                review_count = excluded.review_count,
                created_at = excluded.created_at
            "#,
        )
        .bind(app_id)
        .bind(serde_json::to_string(analysis)?)
        .bind(review_count)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Reuse a comparison for the exact same app-id set within the freshness
    /// window.
    pub async fn cached_comparison(&self, app_ids: &[String]) -> Result<Option<ComparisonResult>> {
        let key = app_set_key(app_ids);
        let row =
            sqlx::query("SELECT comparison_json, created_at FROM comparisons WHERE app_set = ?")
                .bind(&key)
                .fetch_optional(&self.pool)
                .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let created_at: i64 = row.try_get("created_at")?;
        if Utc::now() - timestamp_to_datetime(created_at) >= self.ttl {
            return Ok(None);
        }
        let json: String = row.try_get("comparison_json")?;
        let comparison: ComparisonResult =
            serde_json::from_str(&json).context("Corrupt comparison_json in comparisons row")?;
        Ok(Some(comparison))
    }

    pub async fn save_comparison(
        &self,
        app_ids: &[String],
        comparison: &ComparisonResult,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO comparisons (id, app_set, comparison_json, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(app_set) DO UPDATE SET
                comparison_json = excluded.comparison_json,
                created_at = excluded.created_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(app_set_key(app_ids))
        .bind(serde_json::to_string(comparison)?)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Canonical key for a set of app ids: sorted, comma-joined.
fn app_set_key(app_ids: &[String]) -> String {
    let mut ids: Vec<&str> = app_ids.iter().map(|s| s.as_str()).collect();
    ids.sort_unstable();
    ids.dedup();
    ids.join(",")
}

fn timestamp_to_datetime(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        calls: AtomicUsize,
        reviews: usize,
    }

    #[async_trait]
    impl ReviewSource for CountingSource {
        async fn fetch(
            &self,
            app_id: &str,
            platform: Platform,
            _review_count: usize,
        ) -> Result<FetchedApp> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(test_app(app_id, platform, self.reviews))
        }
    }

    fn test_app(app_id: &str, platform: Platform, review_count: usize) -> FetchedApp {
        let info = AppInfo {
            app_id: app_id.to_string(),
            platform,
            title: format!("App {}", app_id),
            icon: None,
            developer: Some("Dev".to_string()),
            categories: vec![],
            description: "An app.".to_string(),
            score: Some(4.2),
            ratings: Some(1000),
            histogram: Some(vec![10, 20, 30, 40, 900]),
            installs: None,
            version: Some("1.0".to_string()),
            raw: serde_json::json!({ "platform": platform.as_str() }),
            last_fetched: Utc::now(),
        };
        let reviews = (0..review_count)
            .map(|i| Review {
                id: format!("r{}", i),
                user_name: "user".to_string(),
                user_image: None,
                date: Utc::now(),
                score: (i as i64 % 5) + 1,
                title: None,
                text: format!("review {}", i),
                thumbs_up: None,
                version: None,
            })
            .collect();
        FetchedApp { info, reviews }
    }

    async fn test_store() -> (tempfile::TempDir, AppDataStore) {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::connect_path(&dir.path().join("test.sqlite"))
            .await
            .unwrap();
        migrate::apply_schema(&pool).await.unwrap();
        (dir, AppDataStore::new(pool, 30))
    }

    #[tokio::test]
    async fn fresh_cache_skips_fetch() {
        let (_dir, store) = test_store().await;
        let source = CountingSource {
            calls: AtomicUsize::new(0),
            reviews: 5,
        };

        let first = store
            .get_or_fetch(&source, "com.a", Platform::GooglePlay, 100)
            .await
            .unwrap();
        assert_eq!(first.reviews.len(), 5);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        let second = store
            .get_or_fetch(&source, "com.a", Platform::GooglePlay, 100)
            .await
            .unwrap();
        assert_eq!(second.reviews.len(), 5);
        // Served from cache, no second network call
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.info.title, "App com.a");
    }

    #[tokio::test]
    async fn refetch_replaces_reviews_and_drops_analysis() {
        let (_dir, store) = test_store().await;

        store.save(&test_app("com.b", Platform::GooglePlay, 10)).await.unwrap();
        let analysis_json = serde_json::json!({
            "app_name": "App com.b",
            "overview": {
                "strengths": [], "weaknesses": [], "opportunities": [], "threats": [],
                "market_position": "niche", "target_demographic": "everyone"
            },
            "feature_analysis": [],
            "pricing_perception": { "value_for_money": 0.0, "pricing_complaints": 0.0, "willingness": "low" },
            "recommended_actions": []
        });
        let analysis: AppAnalysis = serde_json::from_value(analysis_json).unwrap();
        store.save_analysis("com.b", &analysis, 10).await.unwrap();
        assert!(store.cached_analysis("com.b").await.unwrap().is_some());

        // Re-fetch with a smaller sample: reviews replaced, analysis gone
        store.save(&test_app("com.b", Platform::GooglePlay, 3)).await.unwrap();
        let cached = store.load_fresh("com.b").await.unwrap().unwrap();
        assert_eq!(cached.reviews.len(), 3);
        assert!(store.cached_analysis("com.b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn comparison_cache_is_order_insensitive() {
        let (_dir, store) = test_store().await;
        let comparison = ComparisonResult {
            apps: vec![],
            feature_comparison: vec![],
            strengths_comparison: Default::default(),
            weaknesses_comparison: Default::default(),
            market_position: vec![],
            pricing_comparison: vec![],
            user_base_comparison: vec![],
            recommendation_summary: vec![],
        };
        let ids = vec!["com.a".to_string(), "com.b".to_string()];
        store.save_comparison(&ids, &comparison).await.unwrap();

        let reversed = vec!["com.b".to_string(), "com.a".to_string()];
        assert!(store.cached_comparison(&reversed).await.unwrap().is_some());
        let other = vec!["com.a".to_string(), "com.c".to_string()];
        assert!(store.cached_comparison(&other).await.unwrap().is_none());
    }

    #[test]
    fn app_set_key_sorts_and_dedups() {
        let ids = vec![
            "com.b".to_string(),
            "com.a".to_string(),
            "com.b".to_string(),
        ];
        assert_eq!(app_set_key(&ids), "com.a,com.b");
    }
}
