use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment};
use serde::Deserialize;

/// Runtime settings. Every key can be overridden with a `PARTYSLATE_` environment variable,
/// e.g. `PARTYSLATE_CONCURRENCY=10`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    pub find_vendors_url: String,
    pub vendor_url_base: String,
    pub marker_chunk_substring: String,
    pub concurrency: usize,
    pub default_location: Option<String>,
    pub default_category: String,
    pub db_path: String,
    pub timeout_secs: u64,
    pub user_agent: String,
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            find_vendors_url: "https://www.partyslate.com/api/find-vendors.json".into(),
            vendor_url_base: "https://www.partyslate.com/vendors/".into(),
            marker_chunk_substring: "/_next/static/chunks/webpack-88b0373b6b6bc080.js".into(),
            concurrency: 5,
            default_location: Some("miami".into()),
            default_category: "planner".into(),
            db_path: "data/vendors.sqlite".into(),
            timeout_secs: 15,
            user_agent: "partyslate-client/1.0".into(),
            max_retries: 3,
            backoff_ms: 500,
        }
    }
}

impl SiteConfig {
    pub fn load() -> Result<Self> {
        Self::from_env("PARTYSLATE")
    }

    fn from_env(prefix: &str) -> Result<Self> {
        Config::builder()
            .add_source(Environment::with_prefix(prefix).try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize())
            .context("Invalid configuration")
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_environment() {
        let cfg = SiteConfig::from_env("VENDOR_SCRAPER_TEST_UNSET").unwrap();
        assert_eq!(cfg.concurrency, 5);
        assert_eq!(cfg.default_location.as_deref(), Some("miami"));
        assert_eq!(cfg.default_category, "planner");
        assert!(cfg.marker_chunk_substring.starts_with("/_next/static/chunks/webpack-"));
    }

    #[test]
    fn environment_overrides() {
        std::env::set_var("VSCFGTEST_CONCURRENCY", "9");
        std::env::set_var("VSCFGTEST_DEFAULT_CATEGORY", "venue");
        let cfg = SiteConfig::from_env("VSCFGTEST").unwrap();
        assert_eq!(cfg.concurrency, 9);
        assert_eq!(cfg.default_category, "venue");
        assert_eq!(cfg.timeout_secs, 15);
    }
}
