//! Configuration loaded from a TOML file with environment overrides.

use crate::analyzer::{AnalyzerSettings, EndpointLimiters};
use crate::clock::Clock;
use crate::feeds::twitter::{ApiPlan, TWITTER_V2_API};
use crate::search::SearchSettings;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const BEARER_ENV: &str = "TWITTER_AUTH_BEARER";
pub const PLAN_ENV: &str = "TWEETGRAPH_PLAN";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(skip_serializing)]
    pub bearer_token: Option<String>,
    pub plan: ApiPlan,
    pub base_url: String,
    pub request_timeout_secs: u64,
    pub timeline_page_size: u32,
    pub liked_page_size: u32,
    /// The timeline endpoint serves at most 3200 tweets.
    pub timeline_max_items: usize,
    pub liked_max_items: usize,
    /// Counterparts per search query. Estimated from id lengths when unset.
    pub batch_size: Option<usize>,
    pub recency_threshold_days: Option<i64>,
    /// Gives up and reports partial results after this many seconds.
    pub deadline_secs: Option<u64>,
    pub limits: Limits,
}

/// Per-endpoint quota overrides. Unset endpoints use the plan's quota.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub timeline: Option<Quota>,
    pub liked: Option<Quota>,
    pub search: Option<Quota>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    pub requests: u32,
    pub window_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bearer_token: None,
            plan: ApiPlan::default(),
            base_url: TWITTER_V2_API.to_string(),
            request_timeout_secs: 20,
            timeline_page_size: 100,
            liked_page_size: 100,
            timeline_max_items: 3200,
            liked_max_items: 1000,
            batch_size: None,
            recency_threshold_days: None,
            deadline_secs: None,
            limits: Limits::default(),
        }
    }
}

impl Config {
    /// Loads `path`, or the default config file when `path` is `None`, then
    /// applies environment overrides. Only an explicitly given file has to
    /// exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::config_file_path() {
                Some(default) if default.exists() => Self::from_file(&default)?,
                _ => Self::default(),
            },
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn config_file_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("tweetgraph").join("config.toml"))
    }

    /// Environment variables take precedence over the file.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup(BEARER_ENV).filter(|t| !t.trim().is_empty()) {
            self.bearer_token = Some(token.trim().to_string());
        }
        if let Some(plan) = lookup(PLAN_ENV) {
            self.plan = plan
                .parse()
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("Invalid {}", PLAN_ENV))?;
        }
        Ok(())
    }

    pub fn bearer_token(&self) -> Result<&str> {
        match self.bearer_token.as_deref() {
            Some(token) => Ok(token),
            None => anyhow::bail!(
                "Bearer token required. Set {} or bearer_token in {}",
                BEARER_ENV,
                Self::config_file_path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "the config file".to_string())
            ),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_secs.map(Duration::from_secs)
    }

    /// Plan quotas with the `[limits]` overrides applied, in timeline,
    /// liked, search order.
    pub fn quotas(&self) -> [(u32, Duration); 3] {
        let [timeline, liked, search] = self.plan.quotas();
        let pick = |custom: Option<Quota>, plan: (u32, Duration)| {
            custom
                .map(|q| (q.requests, Duration::from_secs(q.window_secs)))
                .unwrap_or(plan)
        };
        [
            pick(self.limits.timeline, timeline),
            pick(self.limits.liked, liked),
            pick(self.limits.search, search),
        ]
    }

    pub fn limiters(&self, clock: Arc<dyn Clock>) -> EndpointLimiters {
        EndpointLimiters::from_quotas(self.quotas(), clock)
    }

    pub fn analyzer_settings(&self) -> AnalyzerSettings {
        let recency_threshold = self
            .recency_threshold_days
            .map(chrono::Duration::days)
            .unwrap_or_else(|| self.plan.recency_threshold());

        AnalyzerSettings {
            timeline_page_size: self.timeline_page_size,
            liked_page_size: self.liked_page_size,
            timeline_max_items: self.timeline_max_items,
            liked_max_items: self.liked_max_items,
            search: SearchSettings {
                page_size: self.plan.search_page_size(),
                max_query_len: self.plan.max_search_query_length(),
                recency_threshold,
                batch_size: self.batch_size,
            },
        }
    }
}
