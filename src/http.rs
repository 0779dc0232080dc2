use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use backoff::future::retry_notify;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use tracing::{info, warn};

use crate::config::SiteConfig;

/// Shared GET client with retries. Cheap to clone.
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    max_retries: u32,
    backoff_ms: u64,
}

/// A successful response body with its status and timing.
pub struct Fetched {
    pub url: String,
    pub status: u16,
    pub body: String,
    pub latency_ms: i64,
}

impl HttpClient {
    pub fn new(cfg: &SiteConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout())
            .user_agent(cfg.user_agent.as_str())
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            max_retries: cfg.max_retries.max(1),
            backoff_ms: cfg.backoff_ms,
        })
    }

    pub async fn get_text(&self, url: &str, query: &[(&str, String)]) -> Result<Fetched> {
        let start = Instant::now();
        let resp = self.send_with_retry(url, query).await?;
        let final_url = resp.url().to_string();
        let status = resp.status().as_u16();
        let body = resp.text().await.with_context(|| format!("Failed to read body of {}", url))?;
        Ok(Fetched {
            url: final_url,
            status,
            body,
            latency_ms: start.elapsed().as_millis() as i64,
        })
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str, query: &[(&str, String)]) -> Result<T> {
        let resp = self.send_with_retry(url, query).await?;
        resp.json().await.with_context(|| format!("Invalid JSON from {}", url))
    }

    fn policy(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.backoff_ms))
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_interval(Duration::from_secs(60))
            .with_max_elapsed_time(None)
            .build()
    }

    /// GET with exponential backoff, giving up after `max_retries` attempts.
    async fn send_with_retry(&self, url: &str, query: &[(&str, String)]) -> Result<reqwest::Response> {
        let attempts = AtomicU32::new(0);
        let stripped = AtomicBool::new(false);

        retry_notify(
            self.policy(),
            || async {
                let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
                match self.attempt(url, query, &stripped).await {
                    Err(backoff::Error::Transient { err, .. }) if attempt >= self.max_retries => {
                        Err(backoff::Error::permanent(
                            err.context(format!("GET {} failed after {} attempts", url, attempt)),
                        ))
                    }
                    other => other,
                }
            },
            |e, wait: Duration| {
                warn!("{} (backing off {:.1}s)", e, wait.as_secs_f64());
            },
        )
        .await
    }

    async fn attempt(
        &self,
        url: &str,
        query: &[(&str, String)],
        stripped: &AtomicBool,
    ) -> Result<reqwest::Response, backoff::Error<anyhow::Error>> {
        match self.client.get(url).query(query).send().await {
            Ok(resp) if resp.status().is_success() => Ok(resp),
            Ok(resp) if is_retryable(resp.status()) => Err(backoff::Error::transient(anyhow!(
                "HTTP {} for {}",
                resp.status(),
                url
            ))),
            Ok(resp) => Err(backoff::Error::permanent(anyhow!("HTTP {} for {}", resp.status(), url))),
            Err(e) if e.is_connect() && !stripped.swap(true, Ordering::Relaxed) => {
                // Hosts with a broken www. certificate or DNS record often serve the bare domain.
                if let Some(alt) = strip_www(url) {
                    info!("Retrying {} without www: {}", url, alt);
                    match self.client.get(&alt).query(query).send().await {
                        Ok(resp) if resp.status().is_success() => return Ok(resp),
                        Ok(resp) => warn!("Stripped host {} answered HTTP {}", alt, resp.status()),
                        Err(e2) => warn!("Stripped host {} failed: {}", alt, e2),
                    }
                }
                Err(backoff::Error::transient(anyhow!("GET {} failed: {}", url, e)))
            }
            Err(e) if e.is_connect() || e.is_timeout() || e.is_request() => {
                Err(backoff::Error::transient(anyhow!("GET {} failed: {}", url, e)))
            }
            Err(e) => Err(backoff::Error::permanent(
                anyhow::Error::new(e).context(format!("GET {} failed", url)),
            )),
        }
    }
}

/// Rate limiting and server-side failures are worth another try.
pub fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// The same URL with a leading `www.` removed from the host, if it had one.
pub fn strip_www(url: &str) -> Option<String> {
    let mut parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?.strip_prefix("www.")?.to_string();
    parsed.set_host(Some(&host)).ok()?;
    Some(parsed.into())
}
