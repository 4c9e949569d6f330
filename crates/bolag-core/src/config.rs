//! Engine and proxy-provider configuration.
//!
//! All configuration comes from environment variables (a `.env` file is
//! honored via `dotenvy` in the binaries). Provider blocks follow the same
//! shape for every provider; a provider is considered enabled only when its
//! `*_ENABLED` flag is true.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Proxy exit type, priced differently per GB
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    Residential,
    Isp,
    Datacenter,
}

impl ProxyType {
    /// Estimated provider rate in USD per GB
    pub fn usd_per_gb(self) -> f64 {
        match self {
            ProxyType::Residential => 3.5,
            ProxyType::Isp | ProxyType::Datacenter => 2.0,
        }
    }
}

impl From<String> for ProxyType {
    fn from(s: String) -> Self {
        match s.to_lowercase().as_str() {
            "isp" => ProxyType::Isp,
            "datacenter" => ProxyType::Datacenter,
            _ => ProxyType::Residential,
        }
    }
}

/// Proxy session allocation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    Rotate,
    Sticky,
}

impl From<String> for SessionType {
    fn from(s: String) -> Self {
        match s.to_lowercase().as_str() {
            "sticky" => SessionType::Sticky,
            _ => SessionType::Rotate,
        }
    }
}

/// Configuration block for one proxy provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub enabled: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub proxy_type: ProxyType,
    pub country: Option<String>,
    pub session_type: SessionType,
    /// Gateway host, e.g. "pr.oxylabs.io"
    pub host: String,
    /// Exit ports; requests round-robin across them
    pub ports: Vec<u16>,
    /// Encode country targeting in the username ("user-country-XX") instead
    /// of a provider header
    pub country_in_username: bool,
}

impl ProviderConfig {
    pub fn has_credentials(&self) -> bool {
        self.username.as_deref().is_some_and(|u| !u.is_empty())
            && self.password.as_deref().is_some_and(|p| !p.is_empty())
    }

    /// Username with optional country targeting applied.
    pub fn effective_username(&self) -> Option<String> {
        let username = self.username.clone()?;
        match (&self.country, self.country_in_username) {
            (Some(country), true) => Some(format!("{}-country-{}", username, country)),
            _ => Some(username),
        }
    }

    fn from_env(prefix: &str, default_host: impl Fn(ProxyType) -> String) -> Option<Self> {
        let enabled = env_bool(&format!("{}_ENABLED", prefix));
        let username = std::env::var(format!("{}_USERNAME", prefix)).ok();
        let password = std::env::var(format!("{}_PASSWORD", prefix)).ok();
        if !enabled && username.is_none() && password.is_none() {
            return None;
        }

        let proxy_type = std::env::var(format!("{}_PROXY_TYPE", prefix))
            .map(ProxyType::from)
            .unwrap_or(ProxyType::Residential);

        let mut ports: Vec<u16> = std::env::var(format!("{}_PORTS", prefix))
            .map(|raw| {
                raw.split(',')
                    .filter_map(|p| p.trim().parse().ok())
                    .collect()
            })
            .unwrap_or_default();
        if ports.is_empty() {
            if let Ok(port) = std::env::var(format!("{}_PORT", prefix)) {
                if let Ok(port) = port.trim().parse() {
                    ports.push(port);
                }
            }
        }
        if ports.is_empty() {
            ports.push(default_port(proxy_type));
        }

        Some(Self {
            enabled,
            username,
            password,
            proxy_type,
            country: std::env::var(format!("{}_COUNTRY", prefix)).ok(),
            session_type: std::env::var(format!("{}_SESSION_TYPE", prefix))
                .map(SessionType::from)
                .unwrap_or(SessionType::Rotate),
            host: default_host(proxy_type),
            ports,
            country_in_username: env_bool(&format!("{}_COUNTRY_IN_USERNAME", prefix)),
        })
    }
}

fn default_port(proxy_type: ProxyType) -> u16 {
    match proxy_type {
        ProxyType::Residential => 7777,
        ProxyType::Isp | ProxyType::Datacenter => 8001,
    }
}

/// **Proxy Configuration**
///
/// All provider blocks plus the VPN flag. Provider priority (first enabled
/// wins) is: VPN mode, ProxyScrape, Oxylabs. Selection is re-evaluated per
/// request so live configuration changes switch providers without restart.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Direct connections through an operator-maintained tunnel
    pub vpn_enabled: bool,
    pub proxyscrape: Option<ProviderConfig>,
    pub oxylabs: Option<ProviderConfig>,
}

impl ProxyConfig {
    /// Load the proxy configuration from environment variables.
    pub fn from_env() -> Self {
        Self {
            vpn_enabled: env_bool("VPN_ENABLED"),
            proxyscrape: ProviderConfig::from_env("PROXYSCRAPE", |proxy_type| {
                match proxy_type {
                    ProxyType::Residential => "rp.proxyscrape.com".to_string(),
                    _ => "dc.proxyscrape.com".to_string(),
                }
            }),
            oxylabs: ProviderConfig::from_env("OXYLABS", |proxy_type| match proxy_type {
                ProxyType::Residential => "pr.oxylabs.io".to_string(),
                ProxyType::Isp => "isp.oxylabs.io".to_string(),
                ProxyType::Datacenter => "dc.oxylabs.io".to_string(),
            }),
        }
    }

    /// Whether any egress mode is available for job traffic.
    pub fn any_enabled(&self) -> bool {
        self.vpn_enabled
            || self.proxyscrape.as_ref().is_some_and(|p| p.enabled)
            || self.oxylabs.as_ref().is_some_and(|p| p.enabled)
    }
}

fn env_bool(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// **Engine Configuration**
///
/// Knobs for the pipeline itself; defaults match the documented stage
/// behavior and are overridable individually.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding one staging file per job
    pub staging_dir: PathBuf,

    /// Write a checkpoint at most once per this many processed companies
    pub checkpoint_interval: u64,

    /// Hard page ceiling for stage 1
    pub max_pages: u32,

    /// Consecutive empty pages after which stage 1 stops
    pub max_empty_pages: u32,

    /// Stage-1 pages fetched per batch
    pub batch_size: u32,

    /// Per-batch fan-out ceiling for stage-1 page fetches
    pub chunk_concurrency: u32,

    /// Per-request deadline in seconds
    pub request_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            staging_dir: PathBuf::from("staging"),
            checkpoint_interval: 10,
            max_pages: 3000,
            max_empty_pages: 3,
            batch_size: 20,
            chunk_concurrency: 15,
            request_timeout_secs: 30,
        }
    }
}

impl EngineConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(dir) = std::env::var("STAGING_DIR") {
            config.staging_dir = PathBuf::from(dir);
        }
        if let Some(n) = env_u64("CHECKPOINT_INTERVAL") {
            config.checkpoint_interval = n.max(1);
        }
        if let Some(n) = env_u64("MAX_PAGES") {
            config.max_pages = n as u32;
        }
        if let Some(n) = env_u64("MAX_EMPTY_PAGES") {
            config.max_empty_pages = n as u32;
        }
        if let Some(n) = env_u64("REQUEST_TIMEOUT_SECS") {
            config.request_timeout_secs = n;
        }
        config
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.trim().parse().ok()
}
