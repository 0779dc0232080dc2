use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use indexmap::IndexMap;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::client::{ContactSource, EnrichRequest};
use super::error::ContactOutError;

/// Remaining credits for one token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Quota {
    pub email: i64,
    pub phone: i64,
    pub search: i64,
}

impl Quota {
    /// Read from a `/stats` response. Newer responses report `*_remaining`, older ones `*quota`.
    pub fn from_stats(stats: &Value) -> Self {
        let usage = stats.get("usage").unwrap_or(&Value::Null);
        let read = |remaining: &str, quota: &str| {
            usage
                .get(remaining)
                .or_else(|| usage.get(quota))
                .and_then(Value::as_i64)
                .unwrap_or(0)
        };
        Self {
            email: read("remaining", "quota"),
            phone: read("phone_remaining", "phone_quota"),
            search: read("search_remaining", "search_quota"),
        }
    }

    /// Credits one lookup may spend.
    pub fn required_for(req: &EnrichRequest) -> Self {
        let includes = |what: &str| req.include.iter().any(|i| i == what);
        Self {
            email: i64::from(includes("work_email") || includes("personal_email")),
            phone: i64::from(includes("phone")),
            search: i64::from(!req.has_primary()),
        }
    }

    pub fn covers(&self, required: &Quota) -> bool {
        self.email >= required.email && self.phone >= required.phone && self.search >= required.search
    }
}

/// Responses keyed by request, persisted as one JSON object.
pub struct DiskCache {
    path: PathBuf,
    data: BTreeMap<String, Value>,
}

impl DiskCache {
    /// A missing or unreadable file starts an empty cache.
    pub fn open(path: &Path) -> Self {
        let data = fs::read_to_string(path)
            .ok()
            .and_then(|text| match serde_json::from_str(&text) {
                Ok(data) => Some(data),
                Err(e) => {
                    warn!("Ignoring unreadable cache {}: {}", path.display(), e);
                    None
                }
            })
            .unwrap_or_default();
        Self {
            path: path.to_path_buf(),
            data,
        }
    }

    pub fn key(method: &str, path: &str, req: &EnrichRequest) -> Result<String, ContactOutError> {
        Ok(format!("{} {} {}", method, path, serde_json::to_string(req)?))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Store and write through. The file is replaced atomically.
    pub fn set(&mut self, key: String, value: Value) -> Result<(), ContactOutError> {
        self.data.insert(key, value);
        self.save()
    }

    fn save(&self) -> Result<(), ContactOutError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&self.data)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Spreads lookups over several API tokens, tracking what each has left.
pub struct TokenManager<C> {
    source: C,
    quotas: Mutex<IndexMap<String, Quota>>,
    cache: Mutex<DiskCache>,
}

impl<C: ContactSource> TokenManager<C> {
    pub fn new(source: C, tokens: Vec<String>, cache: DiskCache) -> Self {
        let quotas = tokens.into_iter().map(|t| (t, Quota::default())).collect();
        Self {
            source,
            quotas: Mutex::new(quotas),
            cache: Mutex::new(cache),
        }
    }

    /// Fetch current usage for every token. A token whose stats fail keeps a zero quota.
    pub async fn initialize(&self) {
        for token in self.tokens() {
            match self.refresh(&token).await {
                Ok(q) => info!(
                    "Token {}: {} email, {} phone, {} search credits",
                    mask(&token),
                    q.email,
                    q.phone,
                    q.search
                ),
                Err(e) => warn!("Failed to read stats for token {}: {}", mask(&token), e),
            }
        }
    }

    fn tokens(&self) -> Vec<String> {
        self.quotas
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn quota(&self, token: &str) -> Option<Quota> {
        self.quotas
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(token)
            .copied()
    }

    async fn refresh(&self, token: &str) -> Result<Quota, ContactOutError> {
        let stats = self.source.stats(token).await?;
        let quota = Quota::from_stats(&stats);
        self.quotas
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token.to_string(), quota);
        Ok(quota)
    }

    /// First token, in configured order, that covers `required` and was not tried yet.
    fn select(&self, required: &Quota, tried: &HashSet<String>) -> Option<String> {
        self.quotas
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(t, q)| !tried.contains(*t) && q.covers(required))
            .map(|(t, _)| t.clone())
    }

    /// Look a person up, answering from the cache when possible. A token that turns out to
    /// be exhausted is refreshed and the next one tried.
    pub async fn enrich(&self, req: &EnrichRequest) -> Result<Value, ContactOutError> {
        let key = DiskCache::key("POST", "/people/enrich", req)?;
        if let Some(hit) = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            debug!("Cache hit for {}", key);
            return Ok(hit.clone());
        }

        let required = Quota::required_for(req);
        let mut tried = HashSet::new();

        loop {
            let Some(token) = self.select(&required, &tried) else {
                return Err(ContactOutError::OutOfCredits(
                    "no token has enough quota for this request".into(),
                ));
            };
            tried.insert(token.clone());

            match self.source.enrich(&token, req).await {
                Ok(res) => {
                    if let Err(e) = self.refresh(&token).await {
                        warn!("Failed to refresh quota for token {}: {}", mask(&token), e);
                    }
                    self.cache
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .set(key, res.clone())?;
                    return Ok(res);
                }
                Err(e) if e.is_token_exhausted() => {
                    warn!("Token {} exhausted: {}", mask(&token), e);
                    if let Err(e) = self.refresh(&token).await {
                        debug!("Failed to refresh quota for token {}: {}", mask(&token), e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn mask(token: &str) -> String {
    let head: String = token.chars().take(4).collect();
    format!("{}…", head)
}
