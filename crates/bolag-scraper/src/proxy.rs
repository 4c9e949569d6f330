//! **Proxy Gateway**
//!
//! Single egress point for all upstream HTTP. Selects the active provider
//! from configuration on every call (live config changes switch providers
//! without restart) and enforces the mandatory-proxy policy: when a provider
//! is enabled, failing to use it is an error, never a silent fallback to
//! direct fetching.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, SET_COOKIE};
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, warn};

use bolag_core::{ProviderConfig, ProxyConfig, ScrapeError, ScrapeResult, SessionType};

/// Sliding window inside which a port's 429 counts towards saturation.
const PORT_FAILURE_WINDOW: Duration = Duration::from_secs(60);

/// Sleep before the single retry of a transient gateway status.
const GATEWAY_RETRY_SLEEP: Duration = Duration::from_secs(2);

/// The provider actually used for a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Provider {
    /// Direct connections; assumes an operator-maintained tunnel
    Vpn,
    ProxyScrape(ProviderConfig),
    Oxylabs(ProviderConfig),
    /// No provider configured at all; permitted for previews only
    Direct,
}

impl Provider {
    pub fn name(&self) -> &'static str {
        match self {
            Provider::Vpn => "vpn",
            Provider::ProxyScrape(_) => "proxyscrape",
            Provider::Oxylabs(_) => "oxylabs",
            Provider::Direct => "direct",
        }
    }

    fn provider_config(&self) -> Option<&ProviderConfig> {
        match self {
            Provider::ProxyScrape(cfg) | Provider::Oxylabs(cfg) => Some(cfg),
            _ => None,
        }
    }
}

/// Pure provider selection: first enabled wins, in priority order VPN mode,
/// ProxyScrape, Oxylabs.
pub fn select_provider(config: &ProxyConfig) -> Provider {
    if config.vpn_enabled {
        return Provider::Vpn;
    }
    if let Some(ps) = config.proxyscrape.as_ref().filter(|p| p.enabled) {
        return Provider::ProxyScrape(ps.clone());
    }
    if let Some(oxy) = config.oxylabs.as_ref().filter(|p| p.enabled) {
        return Provider::Oxylabs(oxy.clone());
    }
    Provider::Direct
}

/// Response surface handed back to the session and stage layers.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: u16,
    pub set_cookies: Vec<String>,
    pub body: String,
}

impl GatewayResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Convert a non-2xx response into the matching upstream error.
    pub fn ensure_success(self) -> ScrapeResult<GatewayResponse> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ScrapeError::UpstreamStatus {
                status: self.status,
            })
        }
    }
}

/// Counters kept by the gateway, serializable for operator surfaces.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GatewayStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub estimated_bytes: u64,
    pub last_request_at: Option<DateTime<Utc>>,
    pub active_provider: String,
    pub estimated_cost_usd: f64,
}

#[derive(Debug, Default)]
struct StatsInner {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    estimated_bytes: u64,
    last_request_at: Option<DateTime<Utc>>,
}

/// Process-wide gateway handle.
pub struct ProxyGateway {
    config: RwLock<ProxyConfig>,
    stats: Mutex<StatsInner>,
    port_cursor: AtomicUsize,
    port_failures: Mutex<HashMap<u16, Vec<Instant>>>,
    clients: Mutex<HashMap<String, Client>>,
    timeout: Duration,
}

impl ProxyGateway {
    pub fn new(config: ProxyConfig, timeout: Duration) -> Self {
        Self {
            config: RwLock::new(config),
            stats: Mutex::new(StatsInner::default()),
            port_cursor: AtomicUsize::new(0),
            port_failures: Mutex::new(HashMap::new()),
            clients: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Swap the live configuration; takes effect on the next request.
    pub fn update_config(&self, config: ProxyConfig) {
        *self.config.write().expect("proxy config lock") = config;
        self.clients.lock().expect("client cache lock").clear();
    }

    /// Jobs require an enabled egress mode; previews may fall back to direct.
    pub fn require_proxy_for_jobs(&self) -> ScrapeResult<()> {
        let config = self.config.read().expect("proxy config lock");
        if config.any_enabled() {
            Ok(())
        } else {
            Err(ScrapeError::configuration(
                "no proxy provider enabled and VPN_ENABLED is not set; refusing to run a job",
            ))
        }
    }

    /// Issue a GET through the active provider.
    pub async fn fetch(&self, url: &str, headers: &[(String, String)]) -> ScrapeResult<GatewayResponse> {
        let config = self.config.read().expect("proxy config lock").clone();
        let provider = select_provider(&config);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = self.fetch_once(&provider, url, headers).await;
            match &result {
                // 502/525 are transient gateway statuses: exactly one retry
                // after a short sleep, then the failure surfaces.
                Ok(response) if matches!(response.status, 502 | 525) && attempt == 1 => {
                    warn!(status = response.status, url, "transient gateway status, retrying once");
                    tokio::time::sleep(GATEWAY_RETRY_SLEEP).await;
                    continue;
                }
                Ok(response) if matches!(response.status, 502 | 525) => {
                    return Err(ScrapeError::UpstreamStatus {
                        status: response.status,
                    });
                }
                _ => {}
            }
            return result;
        }
    }

    async fn fetch_once(
        &self,
        provider: &Provider,
        url: &str,
        headers: &[(String, String)],
    ) -> ScrapeResult<GatewayResponse> {
        let port = self.pick_port(provider);
        let client = self.client_for(provider, port)?;

        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            let name: HeaderName = name
                .parse()
                .map_err(|_| ScrapeError::configuration(format!("invalid header name {}", name)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| ScrapeError::configuration(format!("invalid header value for {}", name)))?;
            header_map.insert(name, value);
        }
        if let Some(cfg) = provider.provider_config() {
            if !cfg.country_in_username {
                if let Some(country) = cfg.country.as_deref() {
                    if let Ok(value) = HeaderValue::from_str(country) {
                        header_map.insert(HeaderName::from_static("x-proxy-country"), value);
                    }
                }
            }
        }

        let response = match client.get(url).headers(header_map).send().await {
            Ok(response) => response,
            Err(err) => {
                self.record(false, 0);
                if err.is_timeout() {
                    return Err(ScrapeError::network(format!("request timed out: {}", url)));
                }
                return Err(ScrapeError::network(err.to_string()));
            }
        };

        let status = response.status().as_u16();

        if status == 407 {
            self.record(false, 0);
            return Err(ScrapeError::ProxyAuth(format!(
                "{} rejected proxy credentials; update the provider configuration",
                provider.name()
            )));
        }

        if status == 429 {
            self.record(false, 0);
            if self.all_ports_saturated(provider, port) {
                return Err(ScrapeError::ProxyExhausted(format!(
                    "all {} exit ports rate-limited within the failure window",
                    provider.name()
                )));
            }
            return Ok(GatewayResponse {
                status,
                set_cookies: Vec::new(),
                body: String::new(),
            });
        }

        let set_cookies = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok().map(str::to_string))
            .collect();
        let body = response
            .text()
            .await
            .map_err(|err| ScrapeError::network(err.to_string()))?;

        self.record((200..300).contains(&status), body.len() as u64);
        debug!(url, status, provider = provider.name(), "gateway fetch");
        Ok(GatewayResponse {
            status,
            set_cookies,
            body,
        })
    }

    /// Round-robin over the provider's configured exit ports.
    fn pick_port(&self, provider: &Provider) -> u16 {
        match provider.provider_config() {
            Some(cfg) if !cfg.ports.is_empty() => {
                let cursor = self.port_cursor.fetch_add(1, Ordering::Relaxed);
                cfg.ports[cursor % cfg.ports.len()]
            }
            _ => 0,
        }
    }

    /// Record a 429 on `port` and decide whether every configured port has
    /// failed within the window.
    fn all_ports_saturated(&self, provider: &Provider, port: u16) -> bool {
        let Some(cfg) = provider.provider_config() else {
            // Direct/VPN egress has no port pool to exhaust.
            return false;
        };
        let now = Instant::now();
        let mut failures = self.port_failures.lock().expect("port failure lock");
        let entry = failures.entry(port).or_default();
        entry.push(now);

        cfg.ports.iter().all(|p| {
            failures
                .get(p)
                .map(|hits| {
                    hits.iter()
                        .any(|at| now.duration_since(*at) < PORT_FAILURE_WINDOW)
                })
                .unwrap_or(false)
        })
    }

    fn client_for(&self, provider: &Provider, port: u16) -> ScrapeResult<Client> {
        let key = match provider.provider_config() {
            Some(cfg) => format!("{}:{}:{}", provider.name(), cfg.host, port),
            None => "direct".to_string(),
        };
        let mut clients = self.clients.lock().expect("client cache lock");
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = Client::builder().timeout(self.timeout);
        if let Some(cfg) = provider.provider_config() {
            if !cfg.has_credentials() {
                return Err(ScrapeError::configuration(format!(
                    "{} is enabled but credentials are missing",
                    provider.name()
                )));
            }
            if cfg.session_type == SessionType::Sticky {
                // TODO: wire provider session ids once sticky sessions are
                // supported end to end; until then sticky behaves as rotate.
                debug!(provider = provider.name(), "sticky session requested, using rotate");
            }
            let username = cfg
                .effective_username()
                .ok_or_else(|| ScrapeError::configuration("proxy username missing"))?;
            let password = cfg
                .password
                .clone()
                .ok_or_else(|| ScrapeError::configuration("proxy password missing"))?;
            let proxy = reqwest::Proxy::all(format!("http://{}:{}", cfg.host, port))
                .map_err(|err| ScrapeError::configuration(err.to_string()))?
                .basic_auth(&username, &password);
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|err| ScrapeError::configuration(err.to_string()))?;
        clients.insert(key, client.clone());
        Ok(client)
    }

    fn record(&self, success: bool, bytes: u64) {
        let mut stats = self.stats.lock().expect("gateway stats lock");
        stats.total_requests += 1;
        if success {
            stats.successful_requests += 1;
        } else {
            stats.failed_requests += 1;
        }
        stats.estimated_bytes += bytes;
        stats.last_request_at = Some(Utc::now());
    }

    /// Snapshot of the gateway counters plus the estimated data cost.
    pub fn stats(&self) -> GatewayStats {
        let config = self.config.read().expect("proxy config lock").clone();
        let provider = select_provider(&config);
        let rate = provider
            .provider_config()
            .map(|cfg| cfg.proxy_type.usd_per_gb())
            .unwrap_or(0.0);
        let inner = self.stats.lock().expect("gateway stats lock");
        let gb = inner.estimated_bytes as f64 / 1_073_741_824.0;
        GatewayStats {
            total_requests: inner.total_requests,
            successful_requests: inner.successful_requests,
            failed_requests: inner.failed_requests,
            estimated_bytes: inner.estimated_bytes,
            last_request_at: inner.last_request_at,
            active_provider: provider.name().to_string(),
            estimated_cost_usd: gb * rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bolag_core::ProxyType;

    fn provider_config(enabled: bool, ports: Vec<u16>) -> ProviderConfig {
        ProviderConfig {
            enabled,
            username: Some("customer-abc".to_string()),
            password: Some("s3cret".to_string()),
            proxy_type: ProxyType::Residential,
            country: Some("SE".to_string()),
            session_type: SessionType::Rotate,
            host: "pr.example.test".to_string(),
            ports,
            country_in_username: true,
        }
    }

    #[test]
    fn test_provider_priority_order() {
        let mut config = ProxyConfig {
            vpn_enabled: true,
            proxyscrape: Some(provider_config(true, vec![6060])),
            oxylabs: Some(provider_config(true, vec![7777])),
        };
        assert_eq!(select_provider(&config).name(), "vpn");

        config.vpn_enabled = false;
        assert_eq!(select_provider(&config).name(), "proxyscrape");

        config.proxyscrape.as_mut().unwrap().enabled = false;
        assert_eq!(select_provider(&config).name(), "oxylabs");

        config.oxylabs.as_mut().unwrap().enabled = false;
        assert_eq!(select_provider(&config).name(), "direct");
    }

    #[test]
    fn test_selection_is_reevaluated_after_update() {
        let gateway = ProxyGateway::new(ProxyConfig::default(), Duration::from_secs(30));
        assert_eq!(gateway.stats().active_provider, "direct");

        gateway.update_config(ProxyConfig {
            vpn_enabled: true,
            ..Default::default()
        });
        assert_eq!(gateway.stats().active_provider, "vpn");
    }

    #[test]
    fn test_jobs_require_an_enabled_provider() {
        let gateway = ProxyGateway::new(ProxyConfig::default(), Duration::from_secs(30));
        assert!(matches!(
            gateway.require_proxy_for_jobs(),
            Err(ScrapeError::Configuration(_))
        ));

        gateway.update_config(ProxyConfig {
            vpn_enabled: true,
            ..Default::default()
        });
        assert!(gateway.require_proxy_for_jobs().is_ok());
    }

    #[test]
    fn test_missing_credentials_fail_instead_of_falling_back() {
        let mut cfg = provider_config(true, vec![7777]);
        cfg.username = None;
        let gateway = ProxyGateway::new(
            ProxyConfig {
                vpn_enabled: false,
                proxyscrape: None,
                oxylabs: Some(cfg.clone()),
            },
            Duration::from_secs(30),
        );
        let provider = Provider::Oxylabs(cfg);
        assert!(matches!(
            gateway.client_for(&provider, 7777),
            Err(ScrapeError::Configuration(_))
        ));
    }

    #[test]
    fn test_port_round_robin() {
        let gateway = ProxyGateway::new(ProxyConfig::default(), Duration::from_secs(30));
        let provider = Provider::Oxylabs(provider_config(true, vec![7777, 7778, 7779]));
        let picks: Vec<u16> = (0..6).map(|_| gateway.pick_port(&provider)).collect();
        assert_eq!(picks, vec![7777, 7778, 7779, 7777, 7778, 7779]);
    }

    #[test]
    fn test_saturation_requires_failures_on_every_port() {
        let gateway = ProxyGateway::new(ProxyConfig::default(), Duration::from_secs(30));
        let provider = Provider::Oxylabs(provider_config(true, vec![7777, 7778]));

        assert!(!gateway.all_ports_saturated(&provider, 7777));
        // second port fails too: the pool is saturated
        assert!(gateway.all_ports_saturated(&provider, 7778));
    }

    #[test]
    fn test_direct_egress_never_reports_exhaustion() {
        let gateway = ProxyGateway::new(ProxyConfig::default(), Duration::from_secs(30));
        assert!(!gateway.all_ports_saturated(&Provider::Vpn, 0));
        assert!(!gateway.all_ports_saturated(&Provider::Direct, 0));
    }

    #[tokio::test]
    async fn test_direct_fetch_and_stats() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/landing")
            .with_status(200)
            .with_header("set-cookie", "sid=abc123; Path=/")
            .with_body("<html>ok</html>")
            .create_async()
            .await;

        let gateway = ProxyGateway::new(ProxyConfig::default(), Duration::from_secs(5));
        let response = gateway
            .fetch(&format!("{}/landing", server.url()), &[])
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.set_cookies, vec!["sid=abc123; Path=/".to_string()]);
        assert!(response.body.contains("ok"));

        let stats = gateway.stats();
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.successful_requests, 1);
        assert!(stats.estimated_bytes > 0);
        assert_eq!(stats.estimated_cost_usd, 0.0);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_transient_gateway_status_retries_exactly_once() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/flaky")
            .with_status(502)
            .expect(2)
            .create_async()
            .await;

        let gateway = ProxyGateway::new(ProxyConfig::default(), Duration::from_secs(5));
        let started = std::time::Instant::now();
        let result = gateway.fetch(&format!("{}/flaky", server.url()), &[]).await;
        assert!(matches!(
            result,
            Err(ScrapeError::UpstreamStatus { status: 502 })
        ));
        assert!(started.elapsed() >= GATEWAY_RETRY_SLEEP);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_proxy_auth_failure_is_fatal() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/any")
            .with_status(407)
            .create_async()
            .await;

        let gateway = ProxyGateway::new(ProxyConfig::default(), Duration::from_secs(5));
        let result = gateway.fetch(&format!("{}/any", server.url()), &[]).await;
        assert!(matches!(result, Err(ScrapeError::ProxyAuth(_))));
    }

    #[tokio::test]
    async fn test_rate_limited_response_passes_through_without_pool() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/busy")
            .with_status(429)
            .create_async()
            .await;

        let gateway = ProxyGateway::new(ProxyConfig::default(), Duration::from_secs(5));
        let response = gateway
            .fetch(&format!("{}/busy", server.url()), &[])
            .await
            .unwrap();
        assert_eq!(response.status, 429);
        assert!(matches!(
            response.ensure_success(),
            Err(ScrapeError::UpstreamStatus { status: 429 })
        ));
    }
}
