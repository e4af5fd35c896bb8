use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

/// Per-user history caps applied when a page is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryLimits {
    pub events: i64,
    pub orders: i64,
}

impl Default for HistoryLimits {
    fn default() -> Self {
        Self {
            events: 100,
            orders: 50,
        }
    }
}

/// Orchestration tunables, resolved once at start-up and passed explicitly.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    /// Users segmented per round.
    pub page_size: usize,
    pub history: HistoryLimits,
    /// Pairs rendered per creative round.
    pub max_pairs_per_round: usize,
    pub lease_ttl: Duration,
    /// Upper bound on follow-up rounds within one flow.
    pub max_followups: u32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            page_size: 5,
            history: HistoryLimits::default(),
            max_pairs_per_round: 10,
            lease_ttl: Duration::from_secs(900),
            max_followups: 32,
        }
    }
}

/// Application configuration loaded from environment variables.
/// Fails at startup if required variables are missing.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub s3_bucket: String,
    pub s3_endpoint: String,
    pub s3_public_base_url: String,
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
    pub image_api_url: String,
    pub image_api_key: String,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub pipeline: PipelineSettings,
    pub port: u16,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        let s3_bucket = require_env("S3_BUCKET")?;
        let s3_endpoint = require_env("S3_ENDPOINT")?;
        let s3_public_base_url = optional_env("S3_PUBLIC_BASE_URL").unwrap_or_else(|| {
            format!("{}/{}", s3_endpoint.trim_end_matches('/'), s3_bucket)
        });

        let defaults = PipelineSettings::default();
        let pipeline = PipelineSettings {
            page_size: parse_env("PAGE_SIZE", defaults.page_size)?,
            history: HistoryLimits {
                events: parse_env("EVENT_HISTORY_LIMIT", defaults.history.events)?,
                orders: parse_env("ORDER_HISTORY_LIMIT", defaults.history.orders)?,
            },
            max_pairs_per_round: parse_env("MAX_PAIRS_PER_ROUND", defaults.max_pairs_per_round)?,
            lease_ttl: Duration::from_secs(parse_env(
                "ROUND_LEASE_TTL_SECS",
                defaults.lease_ttl.as_secs(),
            )?),
            max_followups: parse_env("MAX_FOLLOWUPS", defaults.max_followups)?,
        };
        if pipeline.page_size == 0 {
            anyhow::bail!("PAGE_SIZE must be at least 1");
        }

        Ok(Config {
            database_url: require_env("DATABASE_URL")?,
            redis_url: require_env("REDIS_URL")?,
            s3_bucket,
            s3_endpoint,
            s3_public_base_url,
            aws_access_key_id: require_env("AWS_ACCESS_KEY_ID")?,
            aws_secret_access_key: require_env("AWS_SECRET_ACCESS_KEY")?,
            image_api_url: require_env("IMAGE_API_URL")?,
            image_api_key: require_env("IMAGE_API_KEY")?,
            webhook_url: optional_env("WEBHOOK_URL"),
            webhook_secret: optional_env("WEBHOOK_SECRET"),
            pipeline,
            port: parse_env("PORT", 8080)?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_env<T: FromStr>(key: &str, default: T) -> Result<T> {
    match optional_env(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| anyhow::anyhow!("{key} has an invalid value: '{raw}'")),
    }
}
