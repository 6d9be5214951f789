use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub fetcher: FetcherConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub llm: LlmConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8787".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetcherConfig {
    /// Base URL of the Google Play scraper backend. The public Play store has
    /// no JSON API, so fetching goes through a scraping service exposing
    /// `GET /apps/{id}` and `GET /apps/{id}/reviews`.
    #[serde(default = "default_play_base_url")]
    pub play_base_url: String,
    /// Base URL of the iTunes endpoints (lookup + customer-reviews RSS).
    #[serde(default = "default_itunes_base_url")]
    pub itunes_base_url: String,
    #[serde(default = "default_country")]
    pub country: String,
    /// Target review sample size per app fetch.
    #[serde(default = "default_review_count")]
    pub review_count: usize,
    /// Delay between App Store review pages, in milliseconds.
    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,
    #[serde(default = "default_fetch_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            play_base_url: default_play_base_url(),
            itunes_base_url: default_itunes_base_url(),
            country: default_country(),
            review_count: default_review_count(),
            page_delay_ms: default_page_delay_ms(),
            timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

fn default_play_base_url() -> String {
    "http://127.0.0.1:3500".to_string()
}
fn default_itunes_base_url() -> String {
    "https://itunes.apple.com".to_string()
}
fn default_country() -> String {
    "us".to_string()
}
fn default_review_count() -> usize {
    100
}
fn default_page_delay_ms() -> u64 {
    250
}
fn default_fetch_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Freshness window for cached app data, in days. Stale rows are
    /// re-fetched and overwritten.
    #[serde(default = "default_ttl_days")]
    pub ttl_days: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_days: default_ttl_days(),
        }
    }
}

fn default_ttl_days() -> i64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalysisConfig {
    /// Number of reviews fed to the LLM per app, after stratified sampling.
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
    /// Prompt verbosity guidance: `basic`, `detailed`, or `comprehensive`.
    #[serde(default = "default_depth")]
    pub depth: String,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            sample_size: default_sample_size(),
            depth: default_depth(),
        }
    }
}

fn default_sample_size() -> usize {
    50
}
fn default_depth() -> String {
    "detailed".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// OpenAI-compatible chat completions endpoint.
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Low temperature keeps structured output consistent across retries.
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            api_key_env: default_api_key_env(),
            temperature: default_temperature(),
            max_retries: default_max_retries(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

fn default_llm_base_url() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}
fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_temperature() -> f64 {
    0.2
}
fn default_max_retries() -> u32 {
    5
}
fn default_llm_timeout_secs() -> u64 {
    120
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.fetcher.review_count == 0 {
        anyhow::bail!("fetcher.review_count must be > 0");
    }

    if config.cache.ttl_days < 1 {
        anyhow::bail!("cache.ttl_days must be >= 1");
    }

    if config.analysis.sample_size == 0 {
        anyhow::bail!("analysis.sample_size must be > 0");
    }

    match config.analysis.depth.as_str() {
        "basic" | "detailed" | "comprehensive" => {}
        other => anyhow::bail!(
            "Unknown analysis depth: '{}'. Must be basic, detailed, or comprehensive.",
            other
        ),
    }

    if !(0.0..=2.0).contains(&config.llm.temperature) {
        anyhow::bail!("llm.temperature must be in [0.0, 2.0]");
    }

    Ok(config)
}
