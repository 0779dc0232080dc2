use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

use crate::contacts::WebsiteContacts;
use crate::csv::{write_row, UTF8_BOM};
use crate::parser::BusinessRecord;

/// One vendor in the JSON interchange file: listing fields, website contacts and the
/// decoded business record flattened alongside.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VendorDocument {
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub minimum_spend: Option<i64>,
    #[serde(default)]
    pub url_extra: WebsiteContacts,
    #[serde(flatten)]
    pub record: BusinessRecord,
}

pub const CSV_HEADERS: [&str; 9] = [
    "Company Name",
    "Website",
    "Contact Person",
    "Job Title",
    "Phone",
    "Email",
    "Minimum spend",
    "Instagram Link",
    "Facebook Link",
];

/// One line of the contacts sheet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactSheetRow {
    pub company_name: String,
    pub website: String,
    pub contact_person: String,
    pub job_title: String,
    pub phone: String,
    pub email: String,
    pub minimum_spend: String,
    pub instagram: String,
    pub facebook: String,
}

impl ContactSheetRow {
    pub fn cells(&self) -> [&str; 9] {
        [
            &self.company_name,
            &self.website,
            &self.contact_person,
            &self.job_title,
            &self.phone,
            &self.email,
            &self.minimum_spend,
            &self.instagram,
            &self.facebook,
        ]
    }
}

static NAME_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-zÀ-ÖØ-öø-ÿ'`.-]+").unwrap());
static CAPITALIZED_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-ZÀ-ÖØ-Ý][a-zà-öø-ÿ'`.-]+$").unwrap());
static SPLIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s*(?:&|&amp;|\band\b|/|\+|;|•|·)\s*").unwrap());
static DASH_SUFFIX_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+[–—-]\s+").unwrap());
static CONTROL_WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\r\n\t]+").unwrap());
static PARENS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\(.*?\)").unwrap());
static POSSESSIVE_TEAM_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"'s\s*team\b").unwrap());
static EVENT_WORD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bevents?\b").unwrap());
static TEAM_WORD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bteam\b").unwrap());
static ROLE_SUFFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(owners|owner|lead planners|lead planner|lead|planners|planner)\b\s*$").unwrap()
});

const NON_PERSON_KEYWORDS: &[&str] = &[
    "team", "teams", "staff", "events", "event", "company", "group", "studio", "owners", "owner",
    "planners", "planner", "collective", "weddings", "wedding", "llc", "co",
];

const TEAM_CONTEXT_WORDS: &[&str] = &["event", "events", "staff", "company", "studio", "group"];

fn clean_raw_name(raw: &str) -> String {
    let s: String = raw.trim().nfc().collect();
    let s = s.replace("&amp;", "&");
    let s = s.split('|').next().unwrap_or_default().trim();
    let s = DASH_SUFFIX_RE.split(s).next().unwrap_or_default().trim();
    CONTROL_WS_RE.replace_all(s, " ").trim().to_string()
}

fn looks_like_company_team(raw: &str) -> bool {
    if raw.is_empty() {
        return true;
    }
    let low = raw.to_lowercase();
    POSSESSIVE_TEAM_RE.is_match(&low)
        || (EVENT_WORD_RE.is_match(&low) && TEAM_WORD_RE.is_match(&low))
        || (low.contains("team") && TEAM_CONTEXT_WORDS.iter().any(|w| low.contains(w)))
}

fn is_keyword(token: &str) -> bool {
    NON_PERSON_KEYWORDS.contains(&token.to_lowercase().as_str())
}

fn is_person_name(candidate: &str) -> bool {
    let c = PARENS_RE.replace_all(candidate.trim(), "");
    let c = c.trim();
    if looks_like_company_team(c) {
        return false;
    }
    let tokens: Vec<&str> = NAME_TOKEN_RE.find_iter(c).map(|m| m.as_str()).collect();
    if tokens.iter().all(|t| is_keyword(t)) {
        return false;
    }
    tokens
        .iter()
        .any(|t| CAPITALIZED_TOKEN_RE.is_match(t) && !is_keyword(t))
}

/// People named by one team-member key, e.g. `"Jon & Kate Reyes - Owners"` gives
/// `["Jon", "Kate Reyes"]`. Keys naming a team or company give nothing.
pub fn split_names_from_key(raw_key: &str) -> Vec<String> {
    let cleaned = clean_raw_name(raw_key);
    if looks_like_company_team(&cleaned) {
        return Vec::new();
    }
    SPLIT_RE
        .split(&cleaned)
        .map(|p| ROLE_SUFFIX_RE.replace(p.trim(), "").trim().to_string())
        .filter(|p| is_person_name(p))
        .collect()
}

/// First `https://<platform>.com/<handle>` among harvested URLs.
pub fn primary_social_url(urls: &[String], platform: &str) -> Option<String> {
    let re = Regex::new(&format!(
        r"(?i)https?://(?:www\.)?{}\.com/[^/?#]+",
        regex::escape(platform)
    ))
    .ok()?;
    urls.iter()
        .find_map(|u| re.find(u).map(|m| m.as_str().to_string()))
}

fn personal_email(name: &str, emails: &[String]) -> Option<String> {
    let first = name.split_whitespace().next()?.to_lowercase();
    let re = Regex::new(&format!(r"(?i)\b{}.*?@", regex::escape(&first))).ok()?;
    emails.iter().find(|e| re.is_match(e)).cloned()
}

/// Sheet rows for one vendor: one per person named in its team. The first person of each
/// team entry carries the company phone. A vendor with nobody identifiable gets a single company row.
pub fn compose_rows(vendor: &VendorDocument) -> Vec<ContactSheetRow> {
    let phones: Vec<&String> = vendor
        .phone_number
        .iter()
        .chain(vendor.url_extra.phones.iter())
        .collect();
    let emails = &vendor.url_extra.emails;
    let company_phone = phones.first().map(|p| p.to_string()).unwrap_or_default();
    let company_email = emails.first().cloned().unwrap_or_default();

    let base = ContactSheetRow {
        company_name: vendor.name.clone(),
        website: vendor.record.url.clone().unwrap_or_default(),
        minimum_spend: vendor
            .minimum_spend
            .filter(|&cents| cents != 0)
            .map(|cents| cents.to_string())
            .unwrap_or_default(),
        instagram: vendor
            .record
            .instagram_url
            .clone()
            .or_else(|| primary_social_url(&vendor.url_extra.urls, "instagram"))
            .unwrap_or_default(),
        facebook: vendor
            .record
            .facebook_url
            .clone()
            .or_else(|| primary_social_url(&vendor.url_extra.urls, "facebook"))
            .unwrap_or_default(),
        ..Default::default()
    };

    let mut rows = Vec::new();
    for (raw_key, title) in &vendor.record.team_members {
        for (i, name) in split_names_from_key(raw_key).into_iter().enumerate() {
            let email = personal_email(&name, emails);
            let (phone, email) = if i == 0 {
                (company_phone.clone(), email.unwrap_or_else(|| company_email.clone()))
            } else {
                (String::new(), email.unwrap_or_default())
            };
            rows.push(ContactSheetRow {
                contact_person: name,
                job_title: title.clone().unwrap_or_default(),
                phone,
                email,
                ..base.clone()
            });
        }
    }

    if rows.is_empty() {
        rows.push(ContactSheetRow {
            phone: company_phone,
            email: company_email,
            ..base
        });
    }
    rows
}

pub fn write_json(path: &Path, vendors: &[VendorDocument]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut w = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut w, vendors)?;
    w.flush()?;
    Ok(())
}

pub fn read_json(path: &Path) -> Result<Vec<VendorDocument>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("{} is not a list of vendors", path.display()))
}

/// Write the contacts sheet. Returns the number of rows written.
pub fn write_csv(path: &Path, vendors: &[VendorDocument]) -> Result<usize> {
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut w = BufWriter::new(file);
    let count = write_sheet(&mut w, vendors)?;
    w.flush()?;
    Ok(count)
}

fn write_sheet<W: Write>(mut w: W, vendors: &[VendorDocument]) -> Result<usize> {
    w.write_all(UTF8_BOM.as_bytes())?;
    write_row(&mut w, &CSV_HEADERS)?;
    let mut count = 0;
    for row in vendors.iter().flat_map(compose_rows) {
        write_row(&mut w, &row.cells())?;
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn vendor(team: &[(&str, Option<&str>)]) -> VendorDocument {
        let mut doc = VendorDocument {
            slug: "acme".into(),
            name: "Acme Events".into(),
            phone_number: Some("(305) 555-0100".into()),
            minimum_spend: Some(250000),
            url_extra: WebsiteContacts {
                phones: vec!["+17865550199".into()],
                emails: vec!["hello@acme.example".into(), "kate.r@acme.example".into()],
                urls: vec![
                    "https://www.instagram.com/acme/reels".into(),
                    "https://facebook.com/acme".into(),
                ],
            },
            ..Default::default()
        };
        doc.record.url = Some("https://acme.example".into());
        for (name, title) in team {
            doc.record
                .team_members
                .insert(name.to_string(), title.map(str::to_string));
        }
        doc
    }

    #[test]
    fn splits_team_keys_into_people() {
        assert_eq!(split_names_from_key("Jon & Kate Reyes"), vec!["Jon", "Kate Reyes"]);
        assert_eq!(split_names_from_key("Ann Lee and Bo Day"), vec!["Ann Lee", "Bo Day"]);
        assert_eq!(split_names_from_key("Maria Lopez | Founder"), vec!["Maria Lopez"]);
        assert_eq!(split_names_from_key("Maria Lopez - Lead Planner"), vec!["Maria Lopez"]);
        assert_eq!(split_names_from_key("Cy Ng Owner"), vec!["Cy Ng"]);
        assert_eq!(split_names_from_key("José Ñúñez"), vec!["José Ñúñez"]);
        assert!(split_names_from_key("The Acme Events Team").is_empty());
        assert!(split_names_from_key("Maria's Team").is_empty());
        assert!(split_names_from_key("Planners").is_empty());
        assert!(split_names_from_key("lowercase name").is_empty());
        assert!(split_names_from_key("").is_empty());
    }

    #[test]
    fn one_row_per_person() {
        let rows = compose_rows(&vendor(&[
            ("Jon & Kate Reyes", Some("Coordinators")),
            ("Event Team", None),
        ]));
        assert_eq!(rows.len(), 2);

        assert_eq!(rows[0].contact_person, "Jon");
        assert_eq!(rows[0].job_title, "Coordinators");
        assert_eq!(rows[0].phone, "(305) 555-0100");
        assert_eq!(rows[0].email, "hello@acme.example");
        assert_eq!(rows[0].minimum_spend, "250000");
        assert_eq!(rows[0].instagram, "https://www.instagram.com/acme");
        assert_eq!(rows[0].facebook, "https://facebook.com/acme");

        assert_eq!(rows[1].contact_person, "Kate Reyes");
        assert_eq!(rows[1].phone, "");
        assert_eq!(rows[1].email, "kate.r@acme.example");
    }

    #[test]
    fn company_row_when_nobody_qualifies() {
        let mut doc = vendor(&[("The Staff Team", Some("Team"))]);
        doc.record.instagram_url = Some("https://instagram.com/acme.official".into());
        doc.phone_number = None;
        let rows = compose_rows(&doc);
        assert_eq!(
            rows,
            vec![ContactSheetRow {
                company_name: "Acme Events".into(),
                website: "https://acme.example".into(),
                phone: "+17865550199".into(),
                email: "hello@acme.example".into(),
                minimum_spend: "250000".into(),
                instagram: "https://instagram.com/acme.official".into(),
                facebook: "https://facebook.com/acme".into(),
                ..Default::default()
            }]
        );
    }

    #[test]
    fn document_json_shape() {
        let doc = vendor(&[("Ann Lee", Some("Planner"))]);
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["url"], "https://acme.example");
        assert_eq!(json["teamMembers"]["Ann Lee"], "Planner");
        assert_eq!(json["url_extra"]["phones"][0], "+17865550199");
        assert!(json.get("facebookUrl").is_none());

        let back: VendorDocument = serde_json::from_value(json).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn sheet_starts_with_bom_and_header() {
        let mut buf = Vec::new();
        let count = write_sheet(&mut buf, &[vendor(&[])]).unwrap();
        assert_eq!(count, 1);
        let text = String::from_utf8(buf).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("\u{feff}Company Name,Website,Contact Person,Job Title,Phone,Email,Minimum spend,Instagram Link,Facebook Link")
        );
        assert_eq!(
            lines.next(),
            Some("Acme Events,https://acme.example,,,(305) 555-0100,hello@acme.example,250000,https://www.instagram.com/acme,https://facebook.com/acme")
        );
    }
}
