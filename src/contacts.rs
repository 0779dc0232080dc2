use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use anyhow::Result;
use regex::Regex;
use reqwest::Url;
use rusqlite::Connection;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::db::{self, ContactRow};
use crate::fetch::progress_bar;
use crate::http::HttpClient;

static LINK_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a[href]").unwrap());

static PHONE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\+?\d{1,3}[\s\-.]?)?\(?\d{3}\)?[\s\-.]?\d{3}[\s\-.]?\d{4}").unwrap()
});
static EXT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:ext|x|extension)\s*[:.]?\s*\d+$").unwrap());
static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-zA-Z0-9_.+-]+@[a-zA-Z0-9-]+\.[a-zA-Z0-9.-]+").unwrap());
static URL_IN_TEXT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)(?:https?://|www\.)[^\s"'<>]+"#).unwrap());

/// URLs containing any of these are not outbound contact links.
const EXCLUDE_PATTERNS: &[&str] = &[
    "contact", "privacy", "terms", "about", "wp-login", "admin", "signup", "login",
];

/// Contacts found on a vendor's own website, each list unique and in page order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebsiteContacts {
    pub phones: Vec<String>,
    pub emails: Vec<String>,
    pub urls: Vec<String>,
}

impl WebsiteContacts {
    /// First harvested URL on the given host (e.g. `instagram.com`).
    pub fn first_url_on(&self, host: &str) -> Option<&str> {
        self.urls
            .iter()
            .map(String::as_str)
            .find(|u| u.to_ascii_lowercase().contains(host))
    }
}

pub fn extract_contacts(html: &str, base_url: &str) -> WebsiteContacts {
    let doc = Html::parse_document(html);
    let base = Url::parse(base_url).ok();
    let hrefs: Vec<&str> = doc
        .select(&LINK_SEL)
        .filter_map(|a| a.value().attr("href"))
        .map(str::trim)
        .collect();
    let text = doc
        .root_element()
        .text()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    WebsiteContacts {
        phones: extract_phones(&hrefs, &text),
        emails: extract_emails(&hrefs, &text),
        urls: extract_urls(&hrefs, &text, base.as_ref()),
    }
}

fn extract_phones(hrefs: &[&str], text: &str) -> Vec<String> {
    let from_links = hrefs
        .iter()
        .filter_map(|h| strip_scheme(h, "tel:"))
        .map(|rest| rest.split('?').next().unwrap_or(rest).to_string());
    let from_text = PHONE_RE.find_iter(text).map(|m| m.as_str().to_string());
    unique(from_links.chain(from_text).filter_map(|raw| normalize_phone(&raw)))
}

fn extract_emails(hrefs: &[&str], text: &str) -> Vec<String> {
    let from_links = hrefs
        .iter()
        .filter_map(|h| strip_scheme(h, "mailto:"))
        .map(|rest| rest.split('?').next().unwrap_or(rest).to_string());
    let from_text = EMAIL_RE.find_iter(text).map(|m| m.as_str().to_string());
    unique(from_links.chain(from_text))
}

fn extract_urls(hrefs: &[&str], text: &str, base: Option<&Url>) -> Vec<String> {
    let join = |raw: &str| -> Option<String> {
        match base {
            Some(b) => b.join(raw).ok().map(String::from),
            None => Some(raw.to_string()),
        }
    };

    let from_links = hrefs
        .iter()
        .filter(|h| !h.to_ascii_lowercase().starts_with("javascript:"))
        .filter_map(|h| join(*h));
    let from_text = URL_IN_TEXT_RE.find_iter(text).filter_map(|m| {
        let raw = m.as_str();
        if raw.to_ascii_lowercase().starts_with("www.") {
            join(&format!("http://{}", raw))
        } else {
            join(raw)
        }
    });

    let base_host = base.and_then(normalized_host);
    unique(from_links.chain(from_text).filter(|u| {
        let low = u.to_ascii_lowercase();
        if low.starts_with("mailto:") || low.starts_with("tel:") {
            return false;
        }
        let Ok(parsed) = Url::parse(u) else {
            return false;
        };
        if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
            return false;
        }
        if base_host.is_some() && normalized_host(&parsed) == base_host {
            return false;
        }
        !EXCLUDE_PATTERNS.iter().any(|p| low.contains(p))
    }))
}

/// Normalize a phone number to E.164. North American numbers are assumed when no
/// country code is written.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let s = EXT_RE.replace(raw.trim(), "");
    let s = s.trim_matches(|c: char| c.is_whitespace() || "-._()[]:;,/".contains(c));
    let had_plus = s.starts_with('+');
    let digits: String = s.chars().filter(char::is_ascii_digit).collect();

    match digits.len() {
        n if !(10..=15).contains(&n) => None,
        10 => Some(format!("+1{}", digits)),
        11 if digits.starts_with('1') => Some(format!("+{}", digits)),
        _ if had_plus => Some(format!("+{}", digits)),
        _ => None,
    }
}

fn strip_scheme<'a>(href: &'a str, scheme: &str) -> Option<&'a str> {
    let head = href.get(..scheme.len())?;
    head.eq_ignore_ascii_case(scheme).then(|| &href[scheme.len()..])
}

fn normalized_host(url: &Url) -> Option<String> {
    let host = url.host_str()?.to_ascii_lowercase();
    Some(host.strip_prefix("www.").map(str::to_string).unwrap_or(host))
}

fn unique(items: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .filter(|s| !s.is_empty() && seen.insert(s.clone()))
        .collect()
}

pub struct HarvestStats {
    pub total: usize,
    pub with_contacts: usize,
    pub errors: usize,
}

/// Fetch each vendor website and store what it exposes. `targets` are (slug, website).
pub async fn harvest_contacts_streaming(
    conn: &Connection,
    http: &HttpClient,
    targets: Vec<(String, String)>,
    concurrency: usize,
) -> Result<HarvestStats> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let total = targets.len();
    let pb = progress_bar(total)?;
    let (tx, mut rx) = tokio::sync::mpsc::channel::<ContactRow>(concurrency.max(1) * 2);

    for (slug, website) in targets {
        let http = http.clone();
        let sem = Arc::clone(&semaphore);
        let tx = tx.clone();

        tokio::spawn(async move {
            let Ok(_permit) = sem.acquire_owned().await else {
                return;
            };
            let row = match http.get_text(&website, &[]).await {
                Ok(fetched) => ContactRow {
                    contacts: extract_contacts(&fetched.body, &website),
                    slug,
                    website,
                    error: None,
                },
                Err(e) => {
                    warn!("Failed to fetch website of {}: {:#}", slug, e);
                    ContactRow {
                        slug,
                        website,
                        contacts: WebsiteContacts::default(),
                        error: Some(format!("{:#}", e)),
                    }
                }
            };
            let _ = tx.send(row).await;
        });
    }
    drop(tx);

    let mut stats = HarvestStats {
        total,
        with_contacts: 0,
        errors: 0,
    };
    while let Some(row) = rx.recv().await {
        if row.error.is_some() {
            stats.errors += 1;
        } else if row.contacts != WebsiteContacts::default() {
            stats.with_contacts += 1;
        }
        db::save_contacts(conn, &row)?;
        pb.inc(1);
    }

    pb.finish_and_clear();
    info!(
        "Harvested {} websites ({} with contacts, {} errors)",
        stats.total, stats.with_contacts, stats.errors
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn phone_normalization() {
        assert_eq!(normalize_phone("(305) 555-0100").as_deref(), Some("+13055550100"));
        assert_eq!(normalize_phone("1-305-555-0100").as_deref(), Some("+13055550100"));
        assert_eq!(normalize_phone("305.555.0100 ext. 12").as_deref(), Some("+13055550100"));
        assert_eq!(normalize_phone("+44 20 7946 0958").as_deref(), Some("+442079460958"));
        assert_eq!(normalize_phone("44 20 7946 0958"), None);
        assert_eq!(normalize_phone("+49 30 1234567").as_deref(), Some("+49301234567"));
        // Ten digits always read as North American, even after a plus.
        assert_eq!(normalize_phone("+44 20 7946 09").as_deref(), Some("+14420794609"));
        // Too short for a full number, plus or not.
        assert_eq!(normalize_phone("+49 301 2345"), None);
        assert_eq!(normalize_phone("555-0100"), None);
    }

    #[test]
    fn website_page() {
        let html = r#"<html><body>
            <a href="tel:+1-305-555-0100">Call</a>
            <a href="mailto:hello@acme.example?subject=Hi">Mail</a>
            <a href="/gallery">Gallery</a>
            <a href="https://www.acme.example/pricing">Pricing</a>
            <a href="https://www.instagram.com/acme">Instagram</a>
            <a href="https://facebook.com/acme">Facebook</a>
            <a href="https://partner.example/privacy">Privacy</a>
            <a href="javascript:void(0)">Menu</a>
            <p>Call us at (305) 555-0100 or 786.555.0199.</p>
            <p>Bookings: events@acme.example, see www.weddingwire.example/acme</p>
            <a href="https://www.instagram.com/acme">Instagram again</a>
        </body></html>"#;

        let contacts = extract_contacts(html, "https://acme.example/");
        assert_eq!(contacts.phones, vec!["+13055550100", "+17865550199"]);
        assert_eq!(contacts.emails, vec!["hello@acme.example", "events@acme.example"]);
        assert_eq!(
            contacts.urls,
            vec![
                "https://www.instagram.com/acme",
                "https://facebook.com/acme",
                "http://www.weddingwire.example/acme",
            ]
        );
        assert_eq!(contacts.first_url_on("instagram.com"), Some("https://www.instagram.com/acme"));
        assert_eq!(contacts.first_url_on("tiktok.com"), None);
    }

    #[test]
    fn empty_page() {
        assert_eq!(extract_contacts("", "https://acme.example/"), WebsiteContacts::default());
    }
}
