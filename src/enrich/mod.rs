pub mod client;
pub mod error;
pub mod manager;

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use reqwest::Url;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::csv::{parse_records, write_row};
use crate::fetch::progress_bar;
pub use client::{ContactOutClient, ContactSource, EnrichRequest};
pub use error::ContactOutError;
pub use manager::{DiskCache, TokenManager};

/// A CSV row as ordered (header, value) pairs.
pub type Row = Vec<(String, String)>;

const WEBSITE_KEYS: &[&str] = &["Website", "website", "Site"];
const PERSON_KEYS: &[&str] = &["Contact Person", "Contact", "ContactPerson", "contact_person"];
const EMAIL_KEYS: &[&str] = &["Email", "email", "Work Email", "work_email"];
const PHONE_KEYS: &[&str] = &["Phone", "phone", "Mobile", "mobile"];
const DEFAULT_INCLUDE: &[&str] = &["work_email", "phone", "personal_email"];

fn field<'a>(row: &'a Row, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| {
        row.iter()
            .find(|(h, v)| h.as_str() == *k && !v.trim().is_empty())
            .map(|(_, v)| v.trim())
    })
}

/// Overwrite the first present column among `keys`, or append one under `keys[0]`.
fn set_field(row: &mut Row, keys: &[&str], value: String) {
    for k in keys {
        if let Some((_, v)) = row.iter_mut().find(|(h, _)| h.as_str() == *k) {
            *v = value;
            return;
        }
    }
    row.push((keys[0].to_string(), value));
}

/// Bare lowercase host of a website, without `www.` or port.
pub fn extract_domain(website: &str) -> Option<String> {
    let website = website.trim();
    if website.is_empty() {
        return None;
    }
    let with_scheme = if website.starts_with("http") {
        website.to_string()
    } else {
        format!("http://{}", website)
    };
    let url = Url::parse(&with_scheme).ok()?;
    let host = url.host_str()?.to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    (!host.is_empty()).then(|| host.to_string())
}

/// A string, or the first string of a list.
fn first_text(v: Option<&Value>) -> Option<String> {
    let v = v?;
    let s = match v {
        Value::String(s) => s.as_str(),
        Value::Array(items) => items.first()?.as_str()?,
        _ => return None,
    };
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

fn first_of(obj: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| first_text(obj.get(k)))
}

/// Email and phone from an enrich response. Checked in order: nested person objects,
/// top-level fields, then a typed `contacts` list.
pub fn extract_email_and_phone(res: &Value) -> (Option<String>, Option<String>) {
    const EMAIL_FIELDS: &[&str] = &["email", "emails", "work_email", "personal_email"];
    const PHONE_FIELDS: &[&str] = &["phone", "phones"];

    let mut email = None;
    let mut phone = None;

    for key in ["data", "result", "person", "profile"] {
        if let Some(sub) = res.get(key).filter(|v| v.is_object()) {
            email = email.or_else(|| first_of(sub, EMAIL_FIELDS));
            phone = phone.or_else(|| first_of(sub, PHONE_FIELDS));
        }
    }
    email = email.or_else(|| first_of(res, EMAIL_FIELDS));
    phone = phone.or_else(|| first_of(res, PHONE_FIELDS));

    if email.is_none() || phone.is_none() {
        let contacts = res.get("contacts").and_then(Value::as_array);
        for c in contacts.into_iter().flatten().filter(|c| c.is_object()) {
            let kind = c
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_lowercase();
            let Some(value) = first_of(c, &["value", "contact", "email", "phone"]) else {
                continue;
            };
            let is_email = kind.contains("email")
                || c.get("work_email").is_some()
                || c.get("personal_email").is_some();
            if is_email && email.is_none() {
                email = Some(value.clone());
            }
            if (kind.contains("phone") || kind.contains("mobile")) && phone.is_none() {
                phone = Some(value);
            }
        }
    }

    (email, phone)
}

/// The lookup for a row, if it names both a person and a usable website.
pub fn request_for(row: &Row) -> Option<EnrichRequest> {
    let website = field(row, WEBSITE_KEYS)?;
    let person = field(row, PERSON_KEYS)?;
    let domain = extract_domain(website)?;
    Some(EnrichRequest {
        full_name: Some(person.to_string()),
        company_domain: vec![domain],
        include: DEFAULT_INCLUDE.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    })
}

/// Fill in email and phone for one row. Lookup failures leave the row as it was.
pub async fn enrich_row<C: ContactSource>(mut row: Row, manager: &TokenManager<C>) -> Row {
    let Some(req) = request_for(&row) else {
        return row;
    };
    let who = req.full_name.clone().unwrap_or_default();

    match manager.enrich(&req).await {
        Ok(res) => {
            let (email, phone) = extract_email_and_phone(&res);
            if let Some(email) = email {
                set_field(&mut row, EMAIL_KEYS, email);
            }
            if let Some(phone) = phone {
                set_field(&mut row, PHONE_KEYS, phone);
            }
        }
        Err(ContactOutError::OutOfCredits(msg)) => {
            warn!("No credits left while enriching {}: {}", who, msg)
        }
        Err(e) => warn!("Failed to enrich {}: {}", who, e),
    }
    row
}

/// Enrich every row concurrently. Output keeps the input order.
pub async fn enrich_rows<C: ContactSource + 'static>(
    rows: Vec<Row>,
    manager: Arc<TokenManager<C>>,
    concurrency: usize,
) -> Result<Vec<Row>> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let pb = progress_bar(rows.len())?;
    let mut slots: Vec<Option<Row>> = vec![None; rows.len()];
    let mut set = JoinSet::new();

    for (i, row) in rows.into_iter().enumerate() {
        if request_for(&row).is_none() {
            slots[i] = Some(row);
            pb.inc(1);
            continue;
        }
        let manager = Arc::clone(&manager);
        let sem = Arc::clone(&semaphore);
        set.spawn(async move {
            let _permit = sem.acquire_owned().await;
            (i, enrich_row(row, &manager).await)
        });
    }

    while let Some(joined) = set.join_next().await {
        let (i, row) = joined.context("Enrichment task panicked")?;
        slots[i] = Some(row);
        pb.inc(1);
    }
    pb.finish_and_clear();

    Ok(slots.into_iter().flatten().collect())
}

/// Union of all row headers, in first-seen order.
pub fn union_headers(rows: &[Row]) -> Vec<String> {
    let mut headers: Vec<String> = Vec::new();
    for (h, _) in rows.iter().flatten() {
        if !headers.contains(h) {
            headers.push(h.clone());
        }
    }
    headers
}

/// Non-empty, non-comment lines of a tokens file.
pub fn read_tokens(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Tokens file not found: {}", path.display()))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect())
}

pub struct EnrichOptions<'a> {
    pub input: &'a Path,
    pub output: &'a Path,
    pub tokens_path: &'a Path,
    pub cache_path: &'a Path,
    pub base_url: &'a str,
    pub concurrency: usize,
    pub timeout: std::time::Duration,
}

/// Read a contacts sheet, enrich it through the API and write the result.
pub async fn process_csv(opts: EnrichOptions<'_>) -> Result<usize> {
    let tokens = read_tokens(opts.tokens_path)?;
    if tokens.is_empty() {
        bail!("No tokens found in {}", opts.tokens_path.display());
    }

    let client = ContactOutClient::new(opts.base_url, opts.timeout)?;
    let manager = Arc::new(TokenManager::new(client, tokens, DiskCache::open(opts.cache_path)));
    manager.initialize().await;

    let text = std::fs::read_to_string(opts.input)
        .with_context(|| format!("Failed to read {}", opts.input.display()))?;
    let (_, rows) = parse_records(&text);
    info!("Enriching {} rows from {}", rows.len(), opts.input.display());

    let rows = enrich_rows(rows, manager, opts.concurrency).await?;
    write_rows(opts.output, &rows)?;
    info!("Wrote enriched CSV to {}", opts.output.display());
    Ok(rows.len())
}

fn write_rows(path: &Path, rows: &[Row]) -> Result<()> {
    let headers = union_headers(rows);
    let mut out = Vec::new();
    write_row(&mut out, &headers)?;
    for row in rows {
        let cells: Vec<&str> = headers
            .iter()
            .map(|h| {
                row.iter()
                    .find(|(k, _)| k == h)
                    .map(|(_, v)| v.as_str())
                    .unwrap_or_default()
            })
            .collect();
        write_row(&mut out, &cells)?;
    }
    std::fs::write(path, out).with_context(|| format!("Failed to write {}", path.display()))
}
