//! **Upstream Session**
//!
//! Produces the (cookies, CSRF token, build id) triple every data request
//! needs. Sessions are acquired from the landing page, cached in memory, and
//! replaced wholesale when the upstream starts answering 403 or returns
//! suspiciously empty first results.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use bolag_core::{ScrapeError, ScrapeResult};

use crate::proxy::ProxyGateway;
use std::future::Future;
use std::sync::Arc;

pub const UPSTREAM_BASE_URL: &str = "https://www.allabolag.se";

/// Realistic desktop user agent; upstream serves the plain HTML shell to it.
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

const ACCEPT_LANGUAGE: &str = "sv-SE,sv;q=0.9,en;q=0.8";

/// Sessions are re-acquired after this long even without a 403.
const SESSION_TTL_MINUTES: i64 = 30;

static CSRF_INPUT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"name="__RequestVerificationToken"[^>]*value="([^"]+)""#).expect("csrf regex")
});
static CSRF_META: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<meta[^>]*name="__RequestVerificationToken"[^>]*content="([^"]+)""#)
        .expect("csrf meta regex")
});
static CSRF_JSON: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""__RequestVerificationToken"\s*:\s*"([^"]+)""#).expect("csrf json regex"));

static NEXT_DATA_SCRIPT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)<script[^>]*id="__NEXT_DATA__"[^>]*>(.*?)</script>"#).expect("next data regex")
});
static BUILD_MANIFEST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"_next/static/([^/"]+)/_buildManifest\.js"#).expect("manifest regex"));
static NEXT_DATA_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"_next/data/([^/"]+)/"#).expect("data path regex"));

/// One acquired upstream session.
#[derive(Debug, Clone)]
pub struct Session {
    pub cookies: String,
    pub csrf_token: Option<String>,
    pub build_id: Option<String>,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Request headers for this session. `accept` distinguishes the HTML
    /// bootstrap pages from the JSON data endpoints.
    pub fn headers(&self, accept: &str) -> Vec<(String, String)> {
        let mut headers = vec![
            ("user-agent".to_string(), USER_AGENT.to_string()),
            ("accept".to_string(), accept.to_string()),
            ("accept-language".to_string(), ACCEPT_LANGUAGE.to_string()),
        ];
        if !self.cookies.is_empty() {
            headers.push(("cookie".to_string(), self.cookies.clone()));
        }
        if let Some(token) = &self.csrf_token {
            headers.push(("requestverificationtoken".to_string(), token.clone()));
        }
        headers
    }
}

/// Outcome of one `with_session` attempt.
pub enum SessionAttempt<T> {
    Done(T),
    /// The response parsed but carried no results; suspicious on a first
    /// attempt, legitimate once the session has been refreshed.
    Empty,
}

/// Process-wide session handle. All mutation happens behind the mutex; a
/// refresh fully replaces the previous session before any retry runs.
pub struct UpstreamSession {
    gateway: Arc<ProxyGateway>,
    base_url: String,
    current: Mutex<Option<Session>>,
}

impl UpstreamSession {
    pub fn new(gateway: Arc<ProxyGateway>, base_url: impl Into<String>) -> Self {
        Self {
            gateway,
            base_url: base_url.into(),
            current: Mutex::new(None),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn gateway(&self) -> &Arc<ProxyGateway> {
        &self.gateway
    }

    /// Acquire a fresh session from the landing page, replacing any cached
    /// one. A missing CSRF token is a soft failure.
    pub async fn acquire(&self) -> ScrapeResult<Session> {
        let bootstrap_headers = vec![
            ("user-agent".to_string(), USER_AGENT.to_string()),
            ("accept".to_string(), "text/html".to_string()),
            ("accept-language".to_string(), ACCEPT_LANGUAGE.to_string()),
        ];
        let response = self
            .gateway
            .fetch(&format!("{}/", self.base_url), &bootstrap_headers)
            .await?
            .ensure_success()?;

        let cookies = response
            .set_cookies
            .iter()
            .filter_map(|raw| raw.split(';').next())
            .map(str::trim)
            .filter(|pair| !pair.is_empty())
            .collect::<Vec<_>>()
            .join("; ");

        let csrf_token = extract_csrf_token(&response.body);
        if csrf_token.is_none() {
            warn!("no CSRF token found on landing page; continuing without one");
        }

        let now = Utc::now();
        let session = Session {
            cookies,
            csrf_token,
            build_id: None,
            acquired_at: now,
            expires_at: now + ChronoDuration::minutes(SESSION_TTL_MINUTES),
        };
        info!(acquired_at = %session.acquired_at, "acquired upstream session");
        *self.current.lock().await = Some(session.clone());
        Ok(session)
    }

    /// Cached session, acquiring one when absent or expired.
    pub async fn current(&self) -> ScrapeResult<Session> {
        {
            let guard = self.current.lock().await;
            if let Some(session) = guard.as_ref() {
                if !session.is_expired() {
                    return Ok(session.clone());
                }
            }
        }
        self.acquire().await
    }

    /// Drop the cached session.
    pub async fn discard(&self) {
        *self.current.lock().await = None;
    }

    /// The current Next.js build identifier, resolved from `/segmentering`
    /// and cached on the session.
    pub async fn build_id(&self) -> ScrapeResult<String> {
        let session = self.current().await?;
        if let Some(build_id) = session.build_id {
            return Ok(build_id);
        }

        let response = self
            .gateway
            .fetch(
                &format!("{}/segmentering", self.base_url),
                &session.headers("text/html"),
            )
            .await?
            .ensure_success()?;

        let build_id = extract_build_id(&response.body).ok_or_else(|| {
            ScrapeError::parse("no Next.js build id found on /segmentering")
        })?;
        debug!(build_id, "resolved upstream build id");

        let mut guard = self.current.lock().await;
        if let Some(session) = guard.as_mut() {
            session.build_id = Some(build_id.clone());
        }
        Ok(build_id)
    }

    /// Run `op` with a session, retrying up to 3 times. A 403-class failure
    /// acquires a fresh session before the retry; an empty-result marker does
    /// the same, but only on the first attempt (a repeat empty is presumed
    /// genuine and handed back to the caller).
    pub async fn with_session<T, F, Fut>(&self, op: F) -> ScrapeResult<SessionAttempt<T>>
    where
        F: Fn(Session) -> Fut,
        Fut: Future<Output = ScrapeResult<SessionAttempt<T>>>,
    {
        let mut last_error: Option<ScrapeError> = None;
        for attempt in 1..=3u32 {
            let session = self.current().await?;
            match op(session).await {
                Ok(SessionAttempt::Done(value)) => return Ok(SessionAttempt::Done(value)),
                Ok(SessionAttempt::Empty) => {
                    if attempt == 1 {
                        debug!("empty first result; refreshing session before retry");
                        self.acquire().await?;
                        continue;
                    }
                    return Ok(SessionAttempt::Empty);
                }
                Err(err) if err.status() == Some(403) && attempt < 3 => {
                    warn!(attempt, "403 from upstream; refreshing session");
                    self.acquire().await?;
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_error.unwrap_or_else(|| ScrapeError::network("session retries exhausted")))
    }
}

/// First matching CSRF pattern wins: form input, meta tag, JSON literal.
fn extract_csrf_token(html: &str) -> Option<String> {
    for pattern in [&*CSRF_INPUT, &*CSRF_META, &*CSRF_JSON] {
        if let Some(captures) = pattern.captures(html) {
            return Some(captures[1].to_string());
        }
    }
    None
}

/// Build id from the `__NEXT_DATA__` blob, falling back to asset paths.
fn extract_build_id(html: &str) -> Option<String> {
    if let Some(captures) = NEXT_DATA_SCRIPT.captures(html) {
        if let Ok(data) = serde_json::from_str::<serde_json::Value>(&captures[1]) {
            if let Some(build_id) = data.get("buildId").and_then(|v| v.as_str()) {
                return Some(build_id.to_string());
            }
        }
    }
    for pattern in [&*BUILD_MANIFEST, &*NEXT_DATA_PATH] {
        if let Some(captures) = pattern.captures(html) {
            return Some(captures[1].to_string());
        }
    }
    None
}
