use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::Connection;

use crate::contacts::WebsiteContacts;
use crate::export::VendorDocument;
use crate::listing::VendorListing;
use crate::parser::BusinessRecord;

pub fn connect(path: &str) -> Result<Connection> {
    if let Some(dir) = Path::new(path).parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create database directory {}", dir.display()))?;
    }
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS vendors (
            id            INTEGER PRIMARY KEY,
            slug          TEXT UNIQUE NOT NULL,
            name          TEXT NOT NULL,
            url           TEXT NOT NULL,
            phone_number  TEXT,
            minimum_spend INTEGER,
            visited       BOOLEAN NOT NULL DEFAULT 0,
            visited_at    TEXT,
            created_at    TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_vendors_visited ON vendors(visited);

        CREATE TABLE IF NOT EXISTS page_data (
            id         INTEGER PRIMARY KEY,
            vendor_id  INTEGER NOT NULL REFERENCES vendors(id),
            url        TEXT NOT NULL,
            slug       TEXT NOT NULL,
            html       TEXT,
            status     INTEGER,
            error      TEXT,
            latency_ms INTEGER,
            scraped_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_page_data_slug ON page_data(slug);

        -- Decoded business facts
        CREATE TABLE IF NOT EXISTS business_records (
            slug          TEXT PRIMARY KEY REFERENCES vendors(slug),
            page_data_id  INTEGER NOT NULL REFERENCES page_data(id),
            website       TEXT,
            facebook_url  TEXT,
            instagram_url TEXT,
            frame_count   INTEGER NOT NULL DEFAULT 0,
            decode_error  TEXT,
            processed_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS team_members (
            id          INTEGER PRIMARY KEY,
            vendor_slug TEXT NOT NULL REFERENCES vendors(slug),
            position    INTEGER NOT NULL,
            name        TEXT NOT NULL,
            title       TEXT,
            UNIQUE(vendor_slug, name)
        );
        CREATE INDEX IF NOT EXISTS idx_team_vendor ON team_members(vendor_slug);

        -- Contacts harvested from the vendor's own website
        CREATE TABLE IF NOT EXISTS website_contacts (
            id          INTEGER PRIMARY KEY,
            vendor_slug TEXT NOT NULL REFERENCES vendors(slug),
            kind        TEXT NOT NULL CHECK(kind IN ('phone','email','url')),
            value       TEXT NOT NULL,
            position    INTEGER NOT NULL,
            UNIQUE(vendor_slug, kind, value)
        );
        CREATE INDEX IF NOT EXISTS idx_contacts_vendor ON website_contacts(vendor_slug);

        CREATE TABLE IF NOT EXISTS contact_fetches (
            vendor_slug TEXT PRIMARY KEY REFERENCES vendors(slug),
            website     TEXT NOT NULL,
            error       TEXT,
            fetched_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );
        ",
    )?;
    Ok(())
}

// ── Listings ──

/// Insert listings not seen before. Returns how many were new.
pub fn insert_vendors(conn: &Connection, vendors: &[VendorListing], url_base: &str) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let mut count = 0;
    {
        let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO vendors (slug, name, url, phone_number, minimum_spend)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for v in vendors {
            count += stmt.execute(rusqlite::params![
                v.slug, v.name, v.page_url(url_base), v.phone_number, v.minimum_spend,
            ])?;
        }
    }
    tx.commit()?;
    Ok(count)
}

/// Vendor pages not fetched yet, as (vendor_id, url, slug).
pub fn fetch_unvisited(conn: &Connection, limit: Option<usize>) -> Result<Vec<(i64, String, String)>> {
    let sql = format!(
        "SELECT id, url, slug FROM vendors WHERE visited = 0 ORDER BY id{}",
        limit_clause(limit)
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Fetching ──

pub struct ScrapeRow {
    pub vendor_id: i64,
    pub url: String,
    pub slug: String,
    pub html: Option<String>,
    pub status: Option<i32>,
    pub error: Option<String>,
    pub latency_ms: Option<i64>,
}

// ── Processing ──

pub struct ScrapedPage {
    pub page_data_id: i64,
    pub slug: String,
    pub url: String,
    pub html: String,
}

/// Fetched pages whose vendor has no business record yet.
pub fn fetch_unprocessed(conn: &Connection, limit: Option<usize>) -> Result<Vec<ScrapedPage>> {
    let sql = format!(
        "SELECT pd.id, pd.slug, pd.url, pd.html
         FROM page_data pd
         LEFT JOIN business_records br ON br.slug = pd.slug
         WHERE pd.html IS NOT NULL AND br.slug IS NULL
         ORDER BY pd.id{}",
        limit_clause(limit)
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], |row| {
            Ok(ScrapedPage {
                page_data_id: row.get(0)?,
                slug: row.get(1)?,
                url: row.get(2)?,
                html: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Outcome of decoding one page.
#[derive(Debug)]
pub struct RecordRow {
    pub page_data_id: i64,
    pub slug: String,
    pub record: BusinessRecord,
    pub frame_count: usize,
    pub decode_error: Option<String>,
}

pub fn save_records(conn: &Connection, rows: &[RecordRow]) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    {
        let mut r_stmt = tx.prepare(
            "INSERT OR REPLACE INTO business_records
             (slug, page_data_id, website, facebook_url, instagram_url, frame_count, decode_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;
        let mut clear_stmt = tx.prepare("DELETE FROM team_members WHERE vendor_slug = ?1")?;
        let mut t_stmt = tx.prepare(
            "INSERT OR IGNORE INTO team_members (vendor_slug, position, name, title)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for r in rows {
            r_stmt.execute(rusqlite::params![
                r.slug, r.page_data_id, r.record.url, r.record.facebook_url,
                r.record.instagram_url, r.frame_count as i64, r.decode_error,
            ])?;
            clear_stmt.execute(rusqlite::params![r.slug])?;
            for (i, (name, title)) in r.record.team_members.iter().enumerate() {
                t_stmt.execute(rusqlite::params![r.slug, i as i64, name, title])?;
            }
        }
    }
    tx.commit()?;
    Ok(())
}

// ── Website contacts ──

/// Vendors with a decoded website whose contacts were not fetched yet, as (slug, website).
pub fn fetch_contact_targets(conn: &Connection, limit: Option<usize>) -> Result<Vec<(String, String)>> {
    let sql = format!(
        "SELECT br.slug, br.website
         FROM business_records br
         LEFT JOIN contact_fetches cf ON cf.vendor_slug = br.slug
         WHERE br.website IS NOT NULL AND cf.vendor_slug IS NULL
         ORDER BY br.slug{}",
        limit_clause(limit)
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub struct ContactRow {
    pub slug: String,
    pub website: String,
    pub contacts: WebsiteContacts,
    pub error: Option<String>,
}

pub fn save_contacts(conn: &Connection, row: &ContactRow) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO website_contacts (vendor_slug, kind, value, position)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        let groups = [
            ("phone", &row.contacts.phones),
            ("email", &row.contacts.emails),
            ("url", &row.contacts.urls),
        ];
        for (kind, values) in groups {
            for (i, value) in values.iter().enumerate() {
                stmt.execute(rusqlite::params![row.slug, kind, value, i as i64])?;
            }
        }
        tx.execute(
            "INSERT OR REPLACE INTO contact_fetches (vendor_slug, website, error) VALUES (?1, ?2, ?3)",
            rusqlite::params![row.slug, row.website, row.error],
        )?;
    }
    tx.commit()?;
    Ok(())
}

// ── Export ──

/// Everything known about each vendor, in listing order.
pub fn fetch_export(conn: &Connection) -> Result<Vec<VendorDocument>> {
    let mut stmt = conn.prepare(
        "SELECT v.slug, v.name, v.phone_number, v.minimum_spend,
                br.website, br.facebook_url, br.instagram_url
         FROM vendors v
         LEFT JOIN business_records br ON br.slug = v.slug
         ORDER BY v.id",
    )?;
    let mut vendors = stmt
        .query_map([], |row| {
            Ok(VendorDocument {
                slug: row.get(0)?,
                name: row.get(1)?,
                phone_number: row.get(2)?,
                minimum_spend: row.get(3)?,
                record: BusinessRecord {
                    url: row.get(4)?,
                    facebook_url: row.get(5)?,
                    instagram_url: row.get(6)?,
                    ..Default::default()
                },
                url_extra: WebsiteContacts::default(),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut team_stmt = conn.prepare(
        "SELECT name, title FROM team_members WHERE vendor_slug = ?1 ORDER BY position",
    )?;
    let mut contact_stmt = conn.prepare(
        "SELECT kind, value FROM website_contacts WHERE vendor_slug = ?1 ORDER BY kind, position",
    )?;

    for v in &mut vendors {
        let team = team_stmt
            .query_map([&v.slug], |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        v.record.team_members = team.into_iter().collect();

        let contacts = contact_stmt
            .query_map([&v.slug], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        for (kind, value) in contacts {
            match kind.as_str() {
                "phone" => v.url_extra.phones.push(value),
                "email" => v.url_extra.emails.push(value),
                _ => v.url_extra.urls.push(value),
            }
        }
    }

    Ok(vendors)
}

// ── Stats ──

pub struct Stats {
    pub total: usize,
    pub visited: usize,
    pub unvisited: usize,
    pub scraped: usize,
    pub errors: usize,
    pub processed: usize,
    pub decode_errors: usize,
    pub with_website: usize,
    pub team_members: usize,
    pub contacts_fetched: usize,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let count = |sql: &str| -> Result<usize> { Ok(conn.query_row(sql, [], |r| r.get(0))?) };

    let total = count("SELECT COUNT(*) FROM vendors")?;
    let visited = count("SELECT COUNT(*) FROM vendors WHERE visited = 1")?;
    Ok(Stats {
        total,
        visited,
        unvisited: total - visited,
        scraped: count("SELECT COUNT(*) FROM page_data")?,
        errors: count("SELECT COUNT(*) FROM page_data WHERE error IS NOT NULL")?,
        processed: count("SELECT COUNT(*) FROM business_records")?,
        decode_errors: count("SELECT COUNT(*) FROM business_records WHERE decode_error IS NOT NULL")?,
        with_website: count("SELECT COUNT(*) FROM business_records WHERE website IS NOT NULL")?,
        team_members: count("SELECT COUNT(*) FROM team_members")?,
        contacts_fetched: count("SELECT COUNT(*) FROM contact_fetches")?,
    })
}

fn limit_clause(limit: Option<usize>) -> String {
    match limit {
        Some(n) => format!(" LIMIT {}", n),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys=ON;").unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    fn listing(slug: &str) -> VendorListing {
        VendorListing {
            slug: slug.into(),
            name: format!("{} name", slug),
            phone_number: Some("305-555-0100".into()),
            minimum_spend: Some(500_000),
        }
    }

    fn store_page(conn: &Connection, slug: &str, html: &str) -> i64 {
        let vendor_id: i64 = conn
            .query_row("SELECT id FROM vendors WHERE slug = ?1", [slug], |r| r.get(0))
            .unwrap();
        conn.execute(
            "INSERT INTO page_data (vendor_id, url, slug, html) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![vendor_id, format!("https://x/{}", slug), slug, html],
        )
        .unwrap();
        conn.execute("UPDATE vendors SET visited = 1 WHERE id = ?1", [vendor_id]).unwrap();
        conn.last_insert_rowid()
    }

    #[test]
    fn insert_is_idempotent() {
        let conn = memory_db();
        let vendors = vec![listing("a"), listing("b")];
        assert_eq!(insert_vendors(&conn, &vendors, "https://x/vendors/").unwrap(), 2);
        assert_eq!(insert_vendors(&conn, &vendors, "https://x/vendors/").unwrap(), 0);

        let pending = fetch_unvisited(&conn, Some(1)).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].1, "https://x/vendors/a");
    }

    #[test]
    fn records_round_trip_through_export() {
        let conn = memory_db();
        insert_vendors(&conn, &[listing("acme"), listing("idle")], "https://x/vendors/").unwrap();
        let page_id = store_page(&conn, "acme", "<html></html>");

        let unprocessed = fetch_unprocessed(&conn, None).unwrap();
        assert_eq!(unprocessed.len(), 1);

        let mut record = BusinessRecord {
            url: Some("https://acme.example".into()),
            ..Default::default()
        };
        record.team_members.insert("Zed Alpha".into(), Some("Owner".into()));
        record.team_members.insert("Amy Beta".into(), None);
        save_records(
            &conn,
            &[RecordRow {
                page_data_id: page_id,
                slug: "acme".into(),
                record: record.clone(),
                frame_count: 3,
                decode_error: None,
            }],
        )
        .unwrap();
        assert!(fetch_unprocessed(&conn, None).unwrap().is_empty());

        save_contacts(
            &conn,
            &ContactRow {
                slug: "acme".into(),
                website: "https://acme.example".into(),
                contacts: WebsiteContacts {
                    phones: vec!["+13055550100".into()],
                    emails: vec!["hello@acme.example".into()],
                    urls: vec!["https://instagram.com/acme".into()],
                },
                error: None,
            },
        )
        .unwrap();
        assert!(fetch_contact_targets(&conn, None).unwrap().is_empty());

        let export = fetch_export(&conn).unwrap();
        assert_eq!(export.len(), 2);
        assert_eq!(export[0].record, record);
        assert_eq!(export[0].url_extra.emails, vec!["hello@acme.example"]);
        assert!(export[1].record.is_empty());

        let stats = get_stats(&conn).unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.unvisited, 1);
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.team_members, 2);
        assert_eq!(stats.contacts_fetched, 1);
    }

    #[test]
    fn contact_targets_need_a_website() {
        let conn = memory_db();
        insert_vendors(&conn, &[listing("a"), listing("b")], "https://x/").unwrap();
        let pa = store_page(&conn, "a", "");
        let pb = store_page(&conn, "b", "");
        let row = |slug: &str, page_data_id, url: Option<&str>| RecordRow {
            page_data_id,
            slug: slug.into(),
            record: BusinessRecord {
                url: url.map(str::to_string),
                ..Default::default()
            },
            frame_count: 0,
            decode_error: None,
        };
        save_records(&conn, &[row("a", pa, Some("https://a.example")), row("b", pb, None)]).unwrap();
        assert_eq!(
            fetch_contact_targets(&conn, None).unwrap(),
            vec![("a".to_string(), "https://a.example".to_string())]
        );
    }
}
