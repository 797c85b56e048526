//! Wizard configuration, read from a YAML file. Every field has a default so
//! an empty file (or no file at all) yields a working local setup.

use std::path::Path;
use std::time::Duration;

use derive_getters::Getters;
use serde::{Deserialize, Serialize};
use tokio::fs;
use url::Url;

use crate::channel::ClosePolicy;
use crate::error::{Result, WizardError};
use crate::feed::{FeedStrategyKind, Framing};
use crate::finalize::FinalizerTimings;
use crate::log::*;

pub fn default_base_url() -> Url {
    Url::parse("http://127.0.0.1:8000").expect("default base url is valid")
}

#[derive(Getters, Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WizardConfig {
    base_url: Url,
    #[getter(skip)]
    target_url: Option<Url>,
    request_timeout_ms: u64,
    feed: FeedConfig,
    channel: ChannelConfig,
    finalizer: FinalizerConfig,
}

impl Default for WizardConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            target_url: None,
            request_timeout_ms: 30_000,
            feed: FeedConfig::default(),
            channel: ChannelConfig::default(),
            finalizer: FinalizerConfig::default(),
        }
    }
}

impl WizardConfig {
    #[tracing::instrument]
    pub async fn load<P: AsRef<Path> + std::fmt::Debug>(path: P) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())
            .await
            .map_err(|source| WizardError::Io {
                path: path.as_ref().display().to_string(),
                source,
            })?;
        debug!("config: read {} bytes", raw.len());
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = base_url;
        self
    }

    pub fn with_target_url(mut self, target_url: Url) -> Self {
        self.target_url = Some(target_url);
        self
    }

    /// Bound on every request/response call to the backend.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// The externally reachable URL of the installed application. Defaults to
    /// `https://` on the backend's host, which is where the freshly installed
    /// app answers once the installer has shut itself down.
    pub fn target_url(&self) -> Result<Url> {
        if let Some(url) = &self.target_url {
            return Ok(url.clone());
        }
        let host = self
            .base_url
            .host_str()
            .ok_or_else(|| WizardError::Config(format!("base url {} has no host", self.base_url)))?;
        let raw = format!("https://{host}");
        Url::parse(&raw).map_err(|e| WizardError::InvalidUrl {
            url: raw,
            reason: e.to_string(),
        })
    }
}

#[derive(Getters, Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    strategy: FeedStrategyKind,
    #[getter(skip)]
    framing: Option<Framing>,
    reconnect_delay_ms: u64,
    max_reconnects: u32,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            strategy: FeedStrategyKind::Sse,
            framing: None,
            reconnect_delay_ms: 3000,
            max_reconnects: 20,
        }
    }
}

impl FeedConfig {
    pub fn new(strategy: FeedStrategyKind, framing: Option<Framing>) -> Self {
        Self {
            strategy,
            framing,
            ..Self::default()
        }
    }

    /// Explicit framing, or the one each transport's backend speaks.
    pub fn framing(&self) -> Framing {
        self.framing.unwrap_or(match self.strategy {
            FeedStrategyKind::Sse => Framing::NamedEvents,
            FeedStrategyKind::Chunked => Framing::ErrorLine,
        })
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

#[derive(Getters, Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    close_policy: ClosePolicy,
}

#[derive(Getters, Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FinalizerConfig {
    shutdown_delay_secs: u64,
    initial_delay_secs: u64,
    poll_interval_secs: u64,
    fallback_after_secs: u64,
    manual_link_after_secs: u64,
    accept_invalid_certs: bool,
}

impl Default for FinalizerConfig {
    fn default() -> Self {
        Self {
            shutdown_delay_secs: 10,
            initial_delay_secs: 30,
            poll_interval_secs: 3,
            fallback_after_secs: 180,
            manual_link_after_secs: 60,
            accept_invalid_certs: false,
        }
    }
}

impl FinalizerConfig {
    pub fn timings(&self) -> FinalizerTimings {
        FinalizerTimings {
            shutdown_delay: Duration::from_secs(self.shutdown_delay_secs),
            initial_delay: Duration::from_secs(self.initial_delay_secs),
            poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
            fallback_after: Duration::from_secs(self.fallback_after_secs),
            manual_link_after: Duration::from_secs(self.manual_link_after_secs),
        }
    }
}
