use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub index: IndexConfig,
    #[serde(default)]
    pub scroll: ScrollConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub highlight: HighlightConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub review: ReviewConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    pub url: String,
    pub name: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default = "default_password_env")]
    pub password_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_keyword_suffix")]
    pub keyword_suffix: String,
}

fn default_password_env() -> String {
    "KBM_INDEX_PASSWORD".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_keyword_suffix() -> String {
    ".keyword".to_string()
}

impl IndexConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Password from the configured environment variable, if set.
    pub fn password(&self) -> Option<String> {
        std::env::var(&self.password_env).ok()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScrollConfig {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for ScrollConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            ttl_secs: default_ttl_secs(),
        }
    }
}

fn default_page_size() -> usize {
    500
}
fn default_ttl_secs() -> u64 {
    60
}

impl ScrollConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SnapshotConfig {
    #[serde(default = "default_snapshot_dir")]
    pub dir: PathBuf,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            dir: default_snapshot_dir(),
        }
    }
}

fn default_snapshot_dir() -> PathBuf {
    PathBuf::from("./backups")
}

#[derive(Debug, Deserialize, Clone)]
pub struct HighlightConfig {
    #[serde(default = "default_fragment_size")]
    pub fragment_size: usize,
    #[serde(default = "default_number_of_fragments")]
    pub number_of_fragments: usize,
    #[serde(default = "default_pre_tag")]
    pub pre_tag: String,
    #[serde(default = "default_post_tag")]
    pub post_tag: String,
    #[serde(default = "default_max_analyzed_offset")]
    pub max_analyzed_offset: usize,
}

impl Default for HighlightConfig {
    fn default() -> Self {
        Self {
            fragment_size: default_fragment_size(),
            number_of_fragments: default_number_of_fragments(),
            pre_tag: default_pre_tag(),
            post_tag: default_post_tag(),
            max_analyzed_offset: default_max_analyzed_offset(),
        }
    }
}

fn default_fragment_size() -> usize {
    150
}
fn default_number_of_fragments() -> usize {
    3
}
fn default_pre_tag() -> String {
    "<<".to_string()
}
fn default_post_tag() -> String {
    ">>".to_string()
}
fn default_max_analyzed_offset() -> usize {
    1_000_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_field")]
    pub default_field: String,
    #[serde(default = "default_fields")]
    pub fields: Vec<String>,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_slop")]
    pub slop: u32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_field: default_field(),
            fields: default_fields(),
            top_k: default_top_k(),
            slop: default_slop(),
        }
    }
}

fn default_field() -> String {
    "question".to_string()
}
fn default_fields() -> Vec<String> {
    vec!["question".to_string(), "answer".to_string()]
}
fn default_top_k() -> usize {
    5
}
fn default_slop() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReviewConfig {
    #[serde(default = "default_review_field")]
    pub sentinel_field: String,
    #[serde(default)]
    pub sentinel_value: Option<String>,
    #[serde(default = "default_review_field")]
    pub edit_field: String,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            sentinel_field: default_review_field(),
            sentinel_value: None,
            edit_field: default_review_field(),
        }
    }
}

fn default_review_field() -> String {
    "answer".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    // Validate index
    if !(config.index.url.starts_with("http://") || config.index.url.starts_with("https://")) {
        anyhow::bail!("index.url must start with http:// or https://");
    }
    if config.index.name.trim().is_empty() {
        anyhow::bail!("index.name must not be empty");
    }
    if config.index.timeout_secs == 0 {
        anyhow::bail!("index.timeout_secs must be > 0");
    }

    // Validate scroll
    if !(1..=10_000).contains(&config.scroll.page_size) {
        anyhow::bail!("scroll.page_size must be in [1, 10000]");
    }
    if config.scroll.ttl_secs == 0 {
        anyhow::bail!("scroll.ttl_secs must be > 0");
    }

    // Validate highlight
    if config.highlight.fragment_size == 0 {
        anyhow::bail!("highlight.fragment_size must be > 0");
    }
    if config.highlight.max_analyzed_offset == 0 {
        anyhow::bail!("highlight.max_analyzed_offset must be > 0");
    }

    // Validate search
    if config.search.top_k < 1 {
        anyhow::bail!("search.top_k must be >= 1");
    }
    if config.search.fields.is_empty() {
        anyhow::bail!("search.fields must name at least one field");
    }
    for spec in &config.search.fields {
        if let Err(reason) = spec.parse::<crate::query::BoostedField>() {
            anyhow::bail!("search.fields: {}", reason);
        }
    }

    Ok(config)
}
