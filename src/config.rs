//! TOML configuration.
//!
//! ```toml
//! [api]
//! base_url = "https://slack.com/api"
//! # token = "xoxp-..."            # or SLACK_TOKEN in the environment
//! max_retries = 3
//!
//! [archive]
//! path = "./archive"
//! workers = 4
//! files = true
//! avatars = false
//!
//! [convert]
//! workers = 8
//! storage = "standard"            # standard | mattermost | dump
//! ```
//!
//! Every section is optional. The loaded [`Config`] is passed explicitly to
//! the controller and conversion engine; nothing reads it from global state.

use anyhow::{Context, Result};
use chatvault_core::paths::FileLayout;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub convert: ConvertConfig,
    #[serde(default)]
    pub db: DbConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_page_limit")]
    pub page_limit: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            token: None,
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            page_limit: default_page_limit(),
        }
    }
}

impl ApiConfig {
    /// Token from the config file, falling back to `SLACK_TOKEN`.
    pub fn resolve_token(&self) -> Result<String> {
        if let Some(t) = self.token.as_ref().filter(|t| !t.is_empty()) {
            return Ok(t.clone());
        }
        std::env::var("SLACK_TOKEN")
            .ok()
            .filter(|t| !t.is_empty())
            .context("no API token: set api.token or SLACK_TOKEN")
    }
}

fn default_base_url() -> String {
    "https://slack.com/api".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    500
}
fn default_page_limit() -> u32 {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct ArchiveConfig {
    #[serde(default = "default_archive_path")]
    pub path: PathBuf,
    #[serde(default = "default_archive_workers")]
    pub workers: usize,
    #[serde(default = "default_true")]
    pub files: bool,
    #[serde(default)]
    pub avatars: bool,
    #[serde(default)]
    pub member_only: bool,
    #[serde(default)]
    pub include_threads_on_resume: bool,
    #[serde(default = "default_download_workers")]
    pub download_workers: usize,
    #[serde(default = "default_download_queue")]
    pub download_queue: usize,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            path: default_archive_path(),
            workers: default_archive_workers(),
            files: true,
            avatars: false,
            member_only: false,
            include_threads_on_resume: false,
            download_workers: default_download_workers(),
            download_queue: default_download_queue(),
        }
    }
}

fn default_archive_path() -> PathBuf {
    PathBuf::from("./archive")
}
fn default_archive_workers() -> usize {
    4
}
fn default_download_workers() -> usize {
    4
}
fn default_download_queue() -> usize {
    64
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConvertConfig {
    #[serde(default = "default_convert_workers")]
    pub workers: usize,
    #[serde(default = "default_true")]
    pub files: bool,
    #[serde(default)]
    pub avatars: bool,
    #[serde(default = "default_storage")]
    pub storage: String,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            workers: default_convert_workers(),
            files: true,
            avatars: false,
            storage: default_storage(),
        }
    }
}

impl ConvertConfig {
    pub fn layout(&self) -> Result<FileLayout> {
        FileLayout::parse(&self.storage).with_context(|| {
            format!(
                "Unknown convert.storage: '{}'. Must be standard, mattermost, or dump.",
                self.storage
            )
        })
    }
}

fn default_convert_workers() -> usize {
    8
}
fn default_storage() -> String {
    "standard".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_file")]
    pub file_name: String,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            file_name: default_db_file(),
        }
    }
}

fn default_db_file() -> String {
    crate::sources::DATABASE_FILE.to_string()
}

impl Config {
    /// Defaults for every section; used when no config file exists.
    pub fn minimal() -> Self {
        Self::default()
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.archive.workers == 0 {
        anyhow::bail!("archive.workers must be >= 1");
    }
    if config.archive.download_workers == 0 {
        anyhow::bail!("archive.download_workers must be >= 1");
    }
    if config.archive.download_queue == 0 {
        anyhow::bail!("archive.download_queue must be >= 1");
    }
    if config.convert.workers == 0 {
        anyhow::bail!("convert.workers must be >= 1");
    }
    if config.api.page_limit == 0 || config.api.page_limit > 1000 {
        anyhow::bail!("api.page_limit must be in [1, 1000]");
    }
    if !config.api.base_url.starts_with("http://") && !config.api.base_url.starts_with("https://")
    {
        anyhow::bail!("api.base_url must be an http(s) URL");
    }
    config.convert.layout()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gets_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.convert.workers, 8);
        assert_eq!(cfg.archive.workers, 4);
        assert!(cfg.archive.files);
        assert!(!cfg.archive.avatars);
        assert_eq!(cfg.db.file_name, "slackdump.sqlite");
    }

    #[test]
    fn rejects_zero_workers() {
        let cfg: Config = toml::from_str("[convert]\nworkers = 0\n").unwrap();
        let err = validate(&cfg).unwrap_err().to_string();
        assert!(err.contains("convert.workers"));
    }

    #[test]
    fn rejects_unknown_storage() {
        let cfg: Config = toml::from_str("[convert]\nstorage = \"zipfile\"\n").unwrap();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn load_from_disk() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("chatvault.toml");
        std::fs::write(
            &path,
            "[archive]\npath = \"/tmp/a\"\navatars = true\n[api]\nmax_retries = 7\n",
        )
        .unwrap();
        let cfg = load_config(&path).unwrap();
        assert!(cfg.archive.avatars);
        assert_eq!(cfg.api.max_retries, 7);
        assert_eq!(cfg.archive.path, PathBuf::from("/tmp/a"));
    }
}
