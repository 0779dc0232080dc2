use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backoff::future::retry_notify;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, RETRY_AFTER};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use super::error::ContactOutError;

pub const DEFAULT_BASE_URL: &str = "https://api.contactout.com/v1";

/// List parameters sent to the API are capped at this many entries.
const MAX_LIST_LEN: usize = 10;

/// A person lookup for `/people/enrich`. Empty fields are not sent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnrichRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linkedin_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub company: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub company_domain: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub education: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_title: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,
}

fn filled(v: &Option<String>) -> bool {
    v.as_deref().is_some_and(|s| !s.is_empty())
}

impl EnrichRequest {
    /// Has a LinkedIn URL, email or phone to match on directly.
    pub fn has_primary(&self) -> bool {
        filled(&self.linkedin_url) || filled(&self.email) || filled(&self.phone)
    }

    /// A search needs either a primary key, or a name plus one secondary detail.
    pub fn validate(&self) -> Result<(), ContactOutError> {
        let has_name =
            filled(&self.full_name) || (filled(&self.first_name) && filled(&self.last_name));
        let has_secondary = !self.company.is_empty()
            || !self.company_domain.is_empty()
            || !self.education.is_empty()
            || filled(&self.location);

        if self.has_primary() || (has_name && has_secondary) {
            Ok(())
        } else {
            Err(ContactOutError::InvalidRequest(
                "need linkedin_url, email or phone, or a name with company, domain, education or location",
            ))
        }
    }

    /// The request as sent: empty strings dropped and lists capped.
    pub fn normalized(&self) -> Self {
        let text = |v: &Option<String>| v.clone().filter(|s| !s.is_empty());
        let list = |v: &[String]| v.iter().take(MAX_LIST_LEN).cloned().collect();
        Self {
            linkedin_url: text(&self.linkedin_url),
            email: text(&self.email),
            phone: text(&self.phone),
            full_name: text(&self.full_name),
            first_name: text(&self.first_name),
            last_name: text(&self.last_name),
            company: list(&self.company),
            company_domain: list(&self.company_domain),
            education: list(&self.education),
            location: text(&self.location),
            job_title: text(&self.job_title),
            include: self.include.clone(),
        }
    }
}

/// The two calls the token manager needs. Each call names the token to spend.
pub trait ContactSource: Send + Sync {
    fn stats(&self, token: &str) -> impl Future<Output = Result<Value, ContactOutError>> + Send;

    fn enrich(
        &self,
        token: &str,
        req: &EnrichRequest,
    ) -> impl Future<Output = Result<Value, ContactOutError>> + Send;
}

pub struct ContactOutClient {
    http: reqwest::Client,
    base_url: String,
    max_retries_on_429: u32,
    backoff: Duration,
}

impl ContactOutClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ContactOutError> {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("basic"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_retries_on_429: 2,
            backoff: Duration::from_secs(1),
        })
    }

    fn policy(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.backoff)
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build()
    }

    /// Send one API call. Only 429 is retried, honoring `Retry-After` when present.
    async fn request(
        &self,
        method: Method,
        path: &str,
        token: &str,
        query: &[(&str, String)],
        body: Option<&EnrichRequest>,
    ) -> Result<Value, ContactOutError> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let attempts = AtomicU32::new(0);
        let max_attempts = self.max_retries_on_429 + 1;

        retry_notify(
            self.policy(),
            || async {
                let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
                let mut req = self
                    .http
                    .request(method.clone(), &url)
                    .header("token", token)
                    .query(query);
                if let Some(body) = body {
                    req = req.json(body);
                }
                let resp = req
                    .send()
                    .await
                    .map_err(|e| backoff::Error::permanent(ContactOutError::from(e)))?;
                let status = resp.status();

                if status.is_success() {
                    return resp
                        .json::<Value>()
                        .await
                        .map_err(|e| backoff::Error::permanent(ContactOutError::from(e)));
                }

                if status == StatusCode::TOO_MANY_REQUESTS {
                    let retry_after = parse_retry_after(resp.headers().get(RETRY_AFTER));
                    let err = ContactOutError::RateLimited { retry_after };
                    if attempt >= max_attempts {
                        return Err(backoff::Error::permanent(err));
                    }
                    return Err(match retry_after {
                        Some(secs) => backoff::Error::retry_after(err, Duration::from_secs(secs)),
                        None => backoff::Error::transient(err),
                    });
                }

                let text = resp.text().await.unwrap_or_default();
                Err(backoff::Error::permanent(ContactOutError::from_status(status, text)))
            },
            |_, wait: Duration| {
                warn!("Rate limited on {}, waiting {:.1}s", path, wait.as_secs_f64());
            },
        )
        .await
    }
}

impl ContactSource for ContactOutClient {
    /// Usage for the current month.
    async fn stats(&self, token: &str) -> Result<Value, ContactOutError> {
        let period = chrono::Local::now().format("%Y-%m").to_string();
        self.request(Method::GET, "stats", token, &[("period", period)], None)
            .await
    }

    async fn enrich(&self, token: &str, req: &EnrichRequest) -> Result<Value, ContactOutError> {
        req.validate()?;
        let body = req.normalized();
        self.request(Method::POST, "people/enrich", token, &[], Some(&body))
            .await
    }
}

/// `Retry-After` in whole seconds. HTTP-date values are ignored.
fn parse_retry_after(value: Option<&HeaderValue>) -> Option<u64> {
    value?.to_str().ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn validation_rules() {
        let by_email = EnrichRequest {
            email: Some("ann@acme.example".into()),
            ..Default::default()
        };
        assert!(by_email.validate().is_ok());

        let name_only = EnrichRequest {
            full_name: Some("Ann Lee".into()),
            ..Default::default()
        };
        assert!(name_only.validate().is_err());

        let name_and_domain = EnrichRequest {
            company_domain: vec!["acme.example".into()],
            ..name_only.clone()
        };
        assert!(name_and_domain.validate().is_ok());

        let split_name = EnrichRequest {
            first_name: Some("Ann".into()),
            last_name: Some(String::new()),
            location: Some("Miami".into()),
            ..Default::default()
        };
        assert!(split_name.validate().is_err());
    }

    #[test]
    fn normalized_body() {
        let req = EnrichRequest {
            full_name: Some("Ann Lee".into()),
            email: Some(String::new()),
            company: (0..12).map(|i| format!("c{}", i)).collect(),
            include: vec!["work_email".into(), "phone".into()],
            ..Default::default()
        };
        let body = serde_json::to_value(req.normalized()).unwrap();
        assert_eq!(body["full_name"], "Ann Lee");
        assert!(body.get("email").is_none());
        assert!(body.get("education").is_none());
        assert_eq!(body["company"].as_array().unwrap().len(), 10);
        assert_eq!(body["include"], serde_json::json!(["work_email", "phone"]));
    }

    #[test]
    fn retry_after_seconds() {
        assert_eq!(parse_retry_after(Some(&HeaderValue::from_static("7"))), Some(7));
        assert_eq!(
            parse_retry_after(Some(&HeaderValue::from_static("Wed, 21 Oct 2026 07:28:00 GMT"))),
            None
        );
        assert_eq!(parse_retry_after(None), None);
    }
}
