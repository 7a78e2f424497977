use anyhow::{Context, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const API_BASE_URL_ENV: &str = "EUPAY_API_BASE_URL";

/// Hosts that may be reached over plain http during local development.
const LOOPBACK_HOSTS: &[&str] = &["localhost", "127.0.0.1", "[::1]"];

/// True when `url` is plain http to a loopback host.
pub(crate) fn is_loopback_http(url: &Url) -> bool {
    url.scheme() == "http" && url.host_str().is_some_and(|host| LOOPBACK_HOSTS.contains(&host))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    /// Lifetime of an unlock ticket minted after a passkey assertion.
    pub unlock_ticket_ttl_secs: u64,
    /// Access tokens this close to expiry are refreshed before use.
    pub token_refresh_skew_secs: i64,
    pub relying_party_id: String,
    pub require_user_verification: bool,
    pub audit_log_path: Option<PathBuf>,
    pub audit_log_max_bytes: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.eupay.eu".into(),
            request_timeout_secs: 15,
            unlock_ticket_ttl_secs: 60,
            token_refresh_skew_secs: 30,
            relying_party_id: "eupay.eu".into(),
            require_user_verification: true,
            audit_log_path: None,
            audit_log_max_bytes: 1024 * 1024,
        }
    }
}

impl CoreConfig {
    /// Load from a JSON file if it exists, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let data = std::fs::read(path)
                .with_context(|| format!("read config {}", path.display()))?;
            serde_json::from_slice(&data)
                .with_context(|| format!("parse config {}", path.display()))?
        } else {
            CoreConfig::default()
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(API_BASE_URL_ENV) {
            if !url.trim().is_empty() {
                self.api_base_url = url;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let url = self.api_url()?;
        if url.scheme() != "https" && !is_loopback_http(&url) {
            anyhow::bail!("api_base_url must use https: {}", self.api_base_url);
        }
        if self.unlock_ticket_ttl_secs == 0 || self.unlock_ticket_ttl_secs > 300 {
            anyhow::bail!("unlock_ticket_ttl_secs must be within 1..=300");
        }
        if self.token_refresh_skew_secs < 0 {
            anyhow::bail!("token_refresh_skew_secs must not be negative");
        }
        Ok(())
    }

    pub fn api_url(&self) -> Result<Url> {
        Url::parse(self.api_base_url.trim())
            .with_context(|| format!("parse api_base_url {}", self.api_base_url))
    }

    pub fn ticket_ttl(&self) -> Duration {
        Duration::from_secs(self.unlock_ticket_ttl_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn refresh_skew(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.token_refresh_skew_secs)
    }
}
