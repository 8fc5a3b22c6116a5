use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::fs;

use crate::scheduler::DEFAULT_CONCURRENCY;

/// Initial input: where collections come from, in order.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceRegistry {
    #[serde(default)]
    pub listings: Vec<ListingConfig>,
    #[serde(default)]
    pub titles: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListingConfig {
    pub url: String,
    #[serde(default = "default_start_page")]
    pub start_page: u32,
    #[serde(default)]
    pub max_pages: Option<u32>,
}

fn default_start_page() -> u32 {
    1
}

pub async fn load_source_registry(path: &Path) -> Result<SourceRegistry> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub checkpoint_path: PathBuf,
    pub sources_path: PathBuf,
    pub site: String,
    pub base_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub concurrency: usize,
    pub item_timeout_secs: u64,
    pub settle_millis: u64,
    pub grace_secs: u64,
    pub max_listing_pages: u32,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
            value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
        }

        Self {
            checkpoint_path: var("ELH_CHECKPOINT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./elh_checkpoint.json")),
            sources_path: var("ELH_SOURCES_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./sources.yaml")),
            site: var("ELH_SITE").unwrap_or_else(|| "anixl".to_string()),
            base_url: var("ELH_BASE_URL").unwrap_or_else(|| "https://anixl.to".to_string()),
            user_agent: var("ELH_USER_AGENT")
                .unwrap_or_else(|| "Mozilla/5.0 (compatible; elh/0.1)".to_string()),
            http_timeout_secs: parsed(var("ELH_HTTP_TIMEOUT_SECS"), 10),
            concurrency: parsed(var("ELH_CONCURRENCY"), DEFAULT_CONCURRENCY).max(1),
            item_timeout_secs: parsed(var("ELH_ITEM_TIMEOUT_SECS"), 30),
            settle_millis: parsed(var("ELH_SETTLE_MILLIS"), 2500),
            grace_secs: parsed(var("ELH_GRACE_SECS"), 5),
            max_listing_pages: parsed(var("ELH_MAX_LISTING_PAGES"), 500),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn item_timeout(&self) -> Duration {
        Duration::from_secs(self.item_timeout_secs)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_millis)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}
