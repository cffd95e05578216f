//! Pipeline configuration
//!
//! Defaults mirror the hosted deployment; every field can be overridden from
//! the environment (a `.env` file is honoured) or by the CLI.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

pub const DEFAULT_TABLE: &str = "ucla_player_stats";
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5-20250929";
pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// SQLite database holding the box scores
    pub db_path: PathBuf,
    /// The single table queries are allowed to touch
    pub table_name: String,
    pub model: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub base_url: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    /// Additional generation attempts after the first rejected candidate
    pub max_retries: u32,
    /// Minimum similarity (0.0-1.0) for resolving a mentioned name
    pub fuzzy_threshold: f64,
    /// Upper bound on cached fuzzy-match lookups
    pub cache_capacity: usize,
    /// Enables rewrites that only approximate the original expression (STDDEV)
    pub allow_approximate_rewrites: bool,
    /// Optional JSON file replacing the built-in known-shape templates
    pub templates_path: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/ucla_wbb.db"),
            table_name: DEFAULT_TABLE.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            temperature: 0.7,
            max_tokens: 1000,
            timeout_secs: 60,
            max_retries: 2,
            fuzzy_threshold: 0.80,
            cache_capacity: 1024,
            allow_approximate_rewrites: false,
            templates_path: None,
        }
    }
}

impl PipelineConfig {
    /// Build a config from defaults overlaid with environment variables.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`PipelineConfig::from_env`] but reads values through `lookup`,
    /// so callers (and tests) can supply their own source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(key) = lookup("ANTHROPIC_API_KEY").filter(|k| !k.trim().is_empty()) {
            config.api_key = Some(key);
        }
        if let Some(model) = lookup("ANTHROPIC_MODEL_NAME") {
            config.model = model;
        }
        if let Some(url) = lookup("ANTHROPIC_BASE_URL") {
            config.base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(path) = lookup("COURTSIDE_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(table) = lookup("COURTSIDE_TABLE") {
            config.table_name = table;
        }
        if let Some(raw) = lookup("COURTSIDE_MAX_RETRIES") {
            config.max_retries = parse_value("COURTSIDE_MAX_RETRIES", &raw)?;
        }
        if let Some(raw) = lookup("COURTSIDE_FUZZY_THRESHOLD") {
            config.fuzzy_threshold = parse_value("COURTSIDE_FUZZY_THRESHOLD", &raw)?;
        }
        if let Some(raw) = lookup("COURTSIDE_CACHE_CAPACITY") {
            config.cache_capacity = parse_value("COURTSIDE_CACHE_CAPACITY", &raw)?;
        }
        if let Some(raw) = lookup("COURTSIDE_APPROXIMATE_REWRITES") {
            config.allow_approximate_rewrites = parse_flag("COURTSIDE_APPROXIMATE_REWRITES", &raw)?;
        }
        if let Some(path) = lookup("COURTSIDE_TEMPLATES") {
            config.templates_path = Some(PathBuf::from(path));
        }

        config.check()?;
        Ok(config)
    }

    /// Reject values that would make the pipeline misbehave silently.
    pub fn check(&self) -> Result<()> {
        if self.table_name.trim().is_empty() {
            return Err(PipelineError::Config("table name must not be empty".to_string()));
        }
        if !self
            .table_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(PipelineError::Config(format!(
                "table name '{}' must be a plain identifier",
                self.table_name
            )));
        }
        if !(0.0..=1.0).contains(&self.fuzzy_threshold) {
            return Err(PipelineError::Config(format!(
                "fuzzy threshold {} is outside 0.0-1.0",
                self.fuzzy_threshold
            )));
        }
        if self.cache_capacity == 0 {
            return Err(PipelineError::Config("cache capacity must be at least 1".to_string()));
        }
        Ok(())
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| PipelineError::Config(format!("{} has an invalid value: '{}'", key, raw)))
}

fn parse_flag(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(PipelineError::Config(format!("{} has an invalid value: '{}'", key, raw))),
    }
}
