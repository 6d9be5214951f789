//! External review/metadata fetching.
//!
//! Defines the [`ReviewSource`] trait and the HTTP implementation that talks
//! to the per-platform backends:
//!
//! - **Google Play** has no public JSON API, so fetching goes through a
//!   configured scraper service exposing `GET /apps/{id}` and
//!   `GET /apps/{id}/reviews`.
//! - **App Store** uses the public iTunes lookup endpoint plus the
//!   customer-reviews RSS feed (50 reviews per page, recency-sorted).
//!
//! Failure policy: if the metadata call fails, the whole fetch fails naming
//! the app id. Review-page failures degrade gracefully — the sample is just
//! smaller.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;

use crate::config::FetcherConfig;
use crate::models::{AppInfo, Category, FetchedApp, Platform, Review};

/// Reviews per App Store RSS page.
const APP_STORE_PAGE_SIZE: usize = 50;
/// Hard caps on App Store pagination.
const APP_STORE_MAX_REVIEWS: usize = 500;
const APP_STORE_MAX_PAGES: usize = 10;

/// A backend that can fetch app metadata and a bounded review sample.
#[async_trait]
pub trait ReviewSource: Send + Sync {
    async fn fetch(
        &self,
        app_id: &str,
        platform: Platform,
        review_count: usize,
    ) -> Result<FetchedApp>;
}

/// HTTP implementation of [`ReviewSource`] for both platforms.
pub struct HttpReviewSource {
    client: reqwest::Client,
    config: FetcherConfig,
}

impl HttpReviewSource {
    pub fn new(config: FetcherConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    async fn get_json(&self, url: &str) -> Result<Value> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Request to {} failed", url))?;
        let status = response.status();
        if !status.is_success() {
            bail!("Request to {} returned {}", url, status);
        }
        let json = response
            .json::<Value>()
            .await
            .with_context(|| format!("Invalid JSON from {}", url))?;
        Ok(json)
    }

    async fn fetch_google_play(&self, app_id: &str, review_count: usize) -> Result<FetchedApp> {
        let base = self.config.play_base_url.trim_end_matches('/');

        let details_url = format!("{}/apps/{}?country={}", base, app_id, self.config.country);
        let details = self
            .get_json(&details_url)
            .await
            .with_context(|| format!("Fetching metadata for app {} failed", app_id))?;
        let info = parse_play_app(app_id, &details);

        // First page: newest reviews
        let newest_url = format!(
            "{}/apps/{}/reviews?num={}&sort=newest&country={}",
            base, app_id, review_count, self.config.country
        );
        let mut reviews = match self.get_json(&newest_url).await {
            Ok(page) => parse_play_reviews(&page),
            Err(e) => {
                tracing::warn!(app_id, error = %e, "newest-reviews page failed");
                Vec::new()
            }
        };

        // Second, smaller page sorted by helpfulness diversifies the sample.
        // Best-effort: a failure here only narrows the sample.
        let helpful_url = format!(
            "{}/apps/{}/reviews?num={}&sort=helpfulness&country={}",
            base,
            app_id,
            (review_count / 2).max(1),
            self.config.country
        );
        match self.get_json(&helpful_url).await {
            Ok(page) => {
                for review in parse_play_reviews(&page) {
                    if !reviews.iter().any(|r| r.id == review.id) {
                        reviews.push(review);
                    }
                }
            }
            Err(e) => {
                tracing::warn!(app_id, error = %e, "helpfulness-reviews page failed, continuing with newest only");
            }
        }

        Ok(FetchedApp { info, reviews })
    }

    async fn fetch_app_store(&self, app_id: &str, review_count: usize) -> Result<FetchedApp> {
        let base = self.config.itunes_base_url.trim_end_matches('/');

        let lookup_url = format!("{}/lookup?id={}&country={}", base, app_id, self.config.country);
        let lookup = self
            .get_json(&lookup_url)
            .await
            .with_context(|| format!("Fetching metadata for app {} failed", app_id))?;
        let info = parse_itunes_lookup(app_id, &lookup)
            .with_context(|| format!("Fetching metadata for app {} failed", app_id))?;

        let target = review_count.min(APP_STORE_MAX_REVIEWS);
        let pages = target.div_ceil(APP_STORE_PAGE_SIZE).min(APP_STORE_MAX_PAGES);

        let mut reviews: Vec<Review> = Vec::new();
        for page in 1..=pages {
            if page > 1 {
                tokio::time::sleep(Duration::from_millis(self.config.page_delay_ms)).await;
            }
            let page_url = format!(
                "{}/{}/rss/customerreviews/page={}/id={}/sortby=mostrecent/json",
                base, self.config.country, page, app_id
            );
            match self.get_json(&page_url).await {
                Ok(feed) => {
                    let batch = parse_itunes_review_page(&feed);
                    if batch.is_empty() {
                        break;
                    }
                    for review in batch {
                        if !reviews.iter().any(|r| r.id == review.id) {
                            reviews.push(review);
                        }
                    }
                    if reviews.len() >= target {
                        reviews.truncate(target);
                        break;
                    }
                }
                Err(e) => {
                    // Keep whatever we have; a failing first page still
                    // yields the metadata with zero reviews.
                    tracing::warn!(app_id, page, error = %e, "review page failed, stopping pagination");
                    break;
                }
            }
        }

        Ok(FetchedApp { info, reviews })
    }
}

#[async_trait]
impl ReviewSource for HttpReviewSource {
    async fn fetch(
        &self,
        app_id: &str,
        platform: Platform,
        review_count: usize,
    ) -> Result<FetchedApp> {
        match platform {
            Platform::GooglePlay => self.fetch_google_play(app_id, review_count).await,
            Platform::AppStore => self.fetch_app_store(app_id, review_count).await,
        }
    }
}

// ============ Normalization ============

/// Normalize a Play scraper details payload into the shared [`AppInfo`].
pub fn parse_play_app(app_id: &str, details: &Value) -> AppInfo {
    let categories = details["categories"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|c| {
                    let name = c["name"].as_str()?.to_string();
                    Some(Category {
                        id: c["id"].as_str().map(|s| s.to_string()),
                        name,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    // Histogram arrives keyed "1".."5"
    let histogram = details["histogram"].as_object().map(|h| {
        (1..=5)
            .map(|star| h.get(&star.to_string()).and_then(|v| v.as_i64()).unwrap_or(0))
            .collect()
    });

    AppInfo {
        app_id: app_id.to_string(),
        platform: Platform::GooglePlay,
        title: details["title"].as_str().unwrap_or(app_id).to_string(),
        icon: details["icon"].as_str().map(|s| s.to_string()),
        developer: details["developer"].as_str().map(|s| s.to_string()),
        categories,
        description: details["description"].as_str().unwrap_or("").to_string(),
        score: details["score"].as_f64(),
        ratings: details["ratings"].as_i64(),
        histogram,
        installs: details["installs"].as_str().map(|s| s.to_string()),
        version: details["version"].as_str().map(|s| s.to_string()),
        raw: serde_json::json!({
            "platform": Platform::GooglePlay.as_str(),
            "payload": details,
        }),
        last_fetched: Utc::now(),
    }
}

/// Normalize a Play scraper reviews payload. Accepts either a bare array or
/// an object wrapping it under `results`/`data`.
pub fn parse_play_reviews(page: &Value) -> Vec<Review> {
    let items = if let Some(arr) = page.as_array() {
        arr
    } else if let Some(arr) = page["results"].as_array() {
        arr
    } else if let Some(arr) = page["data"].as_array() {
        arr
    } else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let id = item["id"].as_str()?.to_string();
            Some(Review {
                id,
                user_name: item["userName"].as_str().unwrap_or("Anonymous").to_string(),
                user_image: item["userImage"].as_str().map(|s| s.to_string()),
                date: parse_date(&item["date"]),
                score: item["score"].as_i64().unwrap_or(0).clamp(1, 5),
                title: item["title"].as_str().map(|s| s.to_string()),
                text: item["text"].as_str().unwrap_or("").to_string(),
                thumbs_up: item["thumbsUp"].as_i64(),
                version: item["version"].as_str().map(|s| s.to_string()),
            })
        })
        .collect()
}

/// Normalize an iTunes lookup payload. Fails when the id matched nothing.
pub fn parse_itunes_lookup(app_id: &str, lookup: &Value) -> Result<AppInfo> {
    let result = lookup["results"]
        .as_array()
        .and_then(|arr| arr.first())
        .with_context(|| format!("No App Store entry for id {}", app_id))?;

    let mut categories: Vec<Category> = Vec::new();
    if let (Some(names), ids) = (
        result["genres"].as_array(),
        result["genreIds"].as_array().cloned().unwrap_or_default(),
    ) {
        for (i, name) in names.iter().enumerate() {
            if let Some(name) = name.as_str() {
                categories.push(Category {
                    id: ids.get(i).and_then(|v| v.as_str()).map(|s| s.to_string()),
                    name: name.to_string(),
                });
            }
        }
    }

    Ok(AppInfo {
        app_id: app_id.to_string(),
        platform: Platform::AppStore,
        title: result["trackName"].as_str().unwrap_or(app_id).to_string(),
        icon: result["artworkUrl512"]
            .as_str()
            .or_else(|| result["artworkUrl100"].as_str())
            .map(|s| s.to_string()),
        developer: result["artistName"].as_str().map(|s| s.to_string()),
        categories,
        description: result["description"].as_str().unwrap_or("").to_string(),
        score: result["averageUserRating"].as_f64(),
        ratings: result["userRatingCount"].as_i64(),
        histogram: None,
        installs: None,
        version: result["version"].as_str().map(|s| s.to_string()),
        raw: serde_json::json!({
            "platform": Platform::AppStore.as_str(),
            "payload": result,
        }),
        last_fetched: Utc::now(),
    })
}

/// Extract reviews from one customer-reviews RSS page. The feed mixes an app
/// summary entry into page 1; entries without a rating are skipped.
pub fn parse_itunes_review_page(feed: &Value) -> Vec<Review> {
    let entries = match feed["feed"]["entry"].as_array() {
        Some(arr) => arr,
        None => return Vec::new(),
    };

    entries
        .iter()
        .filter_map(|entry| {
            let score = entry["im:rating"]["label"].as_str()?.parse::<i64>().ok()?;
            let id = entry["id"]["label"].as_str()?.to_string();
            Some(Review {
                id,
                user_name: entry["author"]["name"]["label"]
                    .as_str()
                    .unwrap_or("Anonymous")
                    .to_string(),
                user_image: None,
                date: parse_date(&entry["updated"]["label"]),
                score: score.clamp(1, 5),
                title: entry["title"]["label"].as_str().map(|s| s.to_string()),
                text: entry["content"]["label"].as_str().unwrap_or("").to_string(),
                thumbs_up: entry["im:voteSum"]["label"]
                    .as_str()
                    .and_then(|s| s.parse().ok()),
                version: entry["im:version"]["label"].as_str().map(|s| s.to_string()),
            })
        })
        .collect()
}

/// Parse a provider date that may be an RFC 3339 string or an epoch number
/// (seconds or milliseconds). Unparseable dates fall back to now rather than
/// dropping the review.
fn parse_date(value: &Value) -> DateTime<Utc> {
    if let Some(s) = value.as_str() {
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return dt.with_timezone(&Utc);
        }
    }
    if let Some(n) = value.as_i64() {
        // Heuristic: values this large are milliseconds
        let secs = if n > 100_000_000_000 { n / 1000 } else { n };
        if let Some(dt) = chrono::TimeZone::timestamp_opt(&Utc, secs, 0).single() {
            return dt;
        }
    }
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn play_app_normalization() {
        let details = json!({
            "title": "WhatsApp Messenger",
            "icon": "https://img.example/icon.png",
            "developer": "WhatsApp LLC",
            "categories": [{ "id": "COMMUNICATION", "name": "Communication" }],
            "description": "Simple. Reliable. Private.",
            "score": 4.3,
            "ratings": 150000000,
            "histogram": { "1": 5, "2": 4, "3": 3, "4": 2, "5": 1 },
            "installs": "5,000,000,000+",
            "version": "2.24.1"
        });
        let info = parse_play_app("com.whatsapp", &details);
        assert_eq!(info.title, "WhatsApp Messenger");
        assert_eq!(info.platform, Platform::GooglePlay);
        assert_eq!(info.histogram, Some(vec![5, 4, 3, 2, 1]));
        assert_eq!(info.categories[0].name, "Communication");
        assert_eq!(info.raw["platform"], "google_play");
    }

    #[test]
    fn play_app_missing_fields_fall_back() {
        let info = parse_play_app("com.bare", &json!({}));
        assert_eq!(info.title, "com.bare");
        assert!(info.histogram.is_none());
        assert!(info.score.is_none());
    }

    #[test]
    fn play_reviews_accept_wrapped_and_bare_arrays() {
        let review = json!({
            "id": "gp:1",
            "userName": "Ada",
            "date": "2024-05-01T12:00:00Z",
            "score": 2,
            "text": "Battery drain is terrible.",
            "thumbsUp": 12
        });
        let bare = json!([review]);
        let wrapped = json!({ "results": [review] });

        assert_eq!(parse_play_reviews(&bare).len(), 1);
        let parsed = parse_play_reviews(&wrapped);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].score, 2);
        assert_eq!(parsed[0].thumbs_up, Some(12));
    }

    #[test]
    fn itunes_lookup_requires_a_result() {
        let empty = json!({ "resultCount": 0, "results": [] });
        assert!(parse_itunes_lookup("42", &empty).is_err());

        let hit = json!({
            "resultCount": 1,
            "results": [{
                "trackName": "X",
                "artistName": "X Corp",
                "genres": ["Social Networking"],
                "genreIds": ["6005"],
                "description": "d",
                "averageUserRating": 3.9,
                "userRatingCount": 1000,
                "version": "10.0"
            }]
        });
        let info = parse_itunes_lookup("553834731", &hit).unwrap();
        assert_eq!(info.platform, Platform::AppStore);
        assert_eq!(info.categories[0].id.as_deref(), Some("6005"));
        assert_eq!(info.score, Some(3.9));
    }

    #[test]
    fn itunes_review_page_skips_unrated_entries() {
        let feed = json!({
            "feed": {
                "entry": [
                    { "id": { "label": "app-summary" }, "title": { "label": "X" } },
                    {
                        "id": { "label": "900001" },
                        "author": { "name": { "label": "Grace" } },
                        "updated": { "label": "2024-06-01T09:30:00-07:00" },
                        "im:rating": { "label": "5" },
                        "title": { "label": "Love it" },
                        "content": { "label": "Works great." },
                        "im:version": { "label": "10.0" }
                    }
                ]
            }
        });
        let reviews = parse_itunes_review_page(&feed);
        assert_eq!(reviews.len(), 1);
        assert_eq!(reviews[0].id, "900001");
        assert_eq!(reviews[0].score, 5);
        assert_eq!(reviews[0].version.as_deref(), Some("10.0"));
    }

    #[test]
    fn date_parsing_accepts_epoch_forms() {
        let from_ms = parse_date(&json!(1_700_000_000_000i64));
        let from_s = parse_date(&json!(1_700_000_000i64));
        assert_eq!(from_ms, from_s);
    }
}
