use std::time::Duration;

use anyhow::Context;

pub const DEFAULT_DATABASE: &str = "session_insights";
pub const DEFAULT_COLLECTION: &str = "sessions";
pub const DEFAULT_LLM_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_LLM_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_LLM_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_MAX_RETRIES: usize = 2;
pub const DEFAULT_RESULT_CAP: usize = 5000;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub uri: String,
    pub database: String,
    pub collection: String,
    pub result_cap: usize,
}

#[derive(Debug, Clone)]
pub struct OracleConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub store: StoreConfig,
    pub oracle: OracleConfig,
    pub max_retries: usize,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let uri = std::env::var("MONGODB_URI")
            .context("MONGODB_URI must be set to a MongoDB connection string")?;

        let store = StoreConfig {
            uri,
            database: env_or("MONGODB_DATABASE", DEFAULT_DATABASE),
            collection: env_or("MONGODB_COLLECTION", DEFAULT_COLLECTION),
            result_cap: parse_count(
                "RESULT_CAP",
                std::env::var("RESULT_CAP").ok().as_deref(),
                DEFAULT_RESULT_CAP,
            )?,
        };

        let timeout_secs = parse_count(
            "LLM_TIMEOUT_SECS",
            std::env::var("LLM_TIMEOUT_SECS").ok().as_deref(),
            DEFAULT_LLM_TIMEOUT_SECS as usize,
        )?;

        let oracle = OracleConfig {
            api_key: std::env::var("LLM_API_KEY").ok().filter(|key| !key.trim().is_empty()),
            base_url: env_or("LLM_BASE_URL", DEFAULT_LLM_BASE_URL),
            model: env_or("LLM_MODEL", DEFAULT_LLM_MODEL),
            timeout: Duration::from_secs(timeout_secs as u64),
        };

        let max_retries = parse_count(
            "QUERY_MAX_RETRIES",
            std::env::var("QUERY_MAX_RETRIES").ok().as_deref(),
            DEFAULT_MAX_RETRIES,
        )?;

        Ok(Self {
            store,
            oracle,
            max_retries,
        })
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Parses a positive count, falling back to `default` when unset or blank.
fn parse_count(name: &str, raw: Option<&str>, default: usize) -> anyhow::Result<usize> {
    let Some(raw) = raw.map(str::trim).filter(|value| !value.is_empty()) else {
        return Ok(default);
    };
    let value: usize = raw
        .parse()
        .with_context(|| format!("{name}={raw:?} is not a whole number"))?;
    Ok(value.max(1))
}
