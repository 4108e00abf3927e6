//! Worker configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use url::Url;

use crate::error::{CoreError, CoreResult};

/// Configuration injected into the offline worker at startup.
///
/// Every field has a default, so a config file only needs to name what it
/// changes. The generation is the one value expected to change per deploy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Cache generation identifier (e.g. "v1.0.0")
    pub generation: String,

    /// Prefix of every bucket name, joined to the generation with '-'
    pub cache_prefix: String,

    /// Origin of the controlled application
    pub origin: Url,

    /// Paths stored during install
    pub precache: Vec<String>,

    /// Path fragment that marks dynamic API calls
    pub api_marker: String,

    /// Extensions served cache-first
    pub static_extensions: Vec<String>,

    /// Background sync tag handled by the worker
    pub sync_tag: String,

    /// Endpoint refreshed when the sync tag fires
    pub sync_endpoint: String,

    /// Push notification presentation
    pub notification: NotificationConfig,

    /// Directory holding persisted cache buckets
    pub cache_dir: PathBuf,
}

/// Presentation of push notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Notification title
    pub title: String,

    /// Body used when the push payload carries no text
    pub default_body: String,

    /// Icon URL path
    pub icon: String,

    /// Badge URL path
    pub badge: String,

    /// Platform tag; notifications with the same tag replace each other
    pub tag: String,

    /// Keep the notification until the user interacts with it
    pub require_interaction: bool,

    /// Buttons shown on the notification
    pub actions: Vec<NotificationAction>,
}

/// A notification button.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
    /// Action identifier reported back on click
    pub action: String,

    /// Button label
    pub title: String,

    /// Button icon path
    pub icon: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            generation: "v1.0.0".to_string(),
            cache_prefix: "gaokao-countdown".to_string(),
            origin: Url::parse("http://localhost:3000/").expect("static origin is valid"),
            precache: vec![
                "/".to_string(),
                "/favicon.ico".to_string(),
                "/manifest.json".to_string(),
                "/static/js/bundle.js".to_string(),
                "/static/css/main.css".to_string(),
            ],
            api_marker: "/api/".to_string(),
            static_extensions: [
                ".js", ".css", ".ico", ".png", ".jpg", ".jpeg", ".svg", ".woff", ".woff2",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            sync_tag: "background-quote-sync".to_string(),
            sync_endpoint: "/api/quote?category=motivation".to_string(),
            notification: NotificationConfig::default(),
            cache_dir: dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("gaokao-countdown"),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            title: "高考倒计时".to_string(),
            default_body: "高考倒计时提醒".to_string(),
            icon: "/favicon.ico".to_string(),
            badge: "/favicon.ico".to_string(),
            tag: "gaokao-reminder".to_string(),
            require_interaction: false,
            actions: vec![
                NotificationAction {
                    action: "view".to_string(),
                    title: "查看详情".to_string(),
                    icon: "/favicon.ico".to_string(),
                },
                NotificationAction {
                    action: "close".to_string(),
                    title: "关闭".to_string(),
                    icon: "/favicon.ico".to_string(),
                },
            ],
        }
    }
}

impl WorkerConfig {
    /// Load configuration from a JSON file and validate it.
    pub fn load(path: &Path) -> CoreResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: WorkerConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Return a copy with a different generation.
    pub fn with_generation(mut self, generation: impl Into<String>) -> Self {
        self.generation = generation.into();
        self
    }

    /// Check invariants the worker relies on.
    pub fn validate(&self) -> CoreResult<()> {
        if self.generation.trim().is_empty() {
            return Err(CoreError::config("generation must not be empty"));
        }
        if self.cache_prefix.trim().is_empty() {
            return Err(CoreError::config("cache_prefix must not be empty"));
        }
        if !matches!(self.origin.scheme(), "http" | "https") {
            return Err(CoreError::config(format!(
                "origin must be http or https, got {}",
                self.origin
            )));
        }
        if self.api_marker.is_empty() {
            return Err(CoreError::config("api_marker must not be empty"));
        }
        Ok(())
    }

    /// Name of the bucket owned by the current generation.
    pub fn bucket_name(&self) -> String {
        self.bucket_name_for(&self.generation)
    }

    /// Name of the bucket owned by `generation`.
    pub fn bucket_name_for(&self, generation: &str) -> String {
        format!("{}-{}", self.cache_prefix, generation)
    }

    /// Resolve a path (or absolute URL) against the origin.
    pub fn resolve(&self, path: &str) -> CoreResult<Url> {
        Ok(self.origin.join(path)?)
    }

    /// Absolute URLs of the precache manifest.
    pub fn precache_urls(&self) -> CoreResult<Vec<Url>> {
        self.precache.iter().map(|p| self.resolve(p)).collect()
    }
}
