use std::sync::Arc;

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use rusqlite::Connection;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::db::ScrapeRow;
use crate::http::HttpClient;

/// Fetch stats returned after completion.
pub struct FetchStats {
    pub total: usize,
    pub ok: usize,
    pub errors: usize,
}

pub fn progress_bar(len: usize) -> Result<ProgressBar> {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")?
            .progress_chars("=> "),
    );
    Ok(pb)
}

/// Fetch vendor pages concurrently, saving each result to the DB as it arrives.
/// `pages` are (vendor_id, url, slug).
pub async fn fetch_pages_streaming(
    conn: &Connection,
    http: &HttpClient,
    pages: Vec<(i64, String, String)>,
    concurrency: usize,
) -> Result<FetchStats> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let total = pages.len();
    let pb = progress_bar(total)?;

    // Workers send results, this loop owns the connection
    let (tx, mut rx) = tokio::sync::mpsc::channel::<ScrapeRow>(concurrency.max(1) * 2);

    for (vendor_id, url, slug) in pages {
        let http = http.clone();
        let sem = Arc::clone(&semaphore);
        let tx = tx.clone();

        tokio::spawn(async move {
            let Ok(_permit) = sem.acquire_owned().await else {
                return;
            };
            let row = fetch_one(&http, vendor_id, url, slug).await;
            let _ = tx.send(row).await;
        });
    }

    // rx closes once every task has dropped its sender
    drop(tx);

    let mut ok = 0usize;
    let mut errors = 0usize;

    let mut insert_stmt = conn.prepare(
        "INSERT INTO page_data (vendor_id, url, slug, html, status, error, latency_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;
    let mut update_stmt = conn.prepare(
        "UPDATE vendors SET visited = 1, visited_at = datetime('now') WHERE id = ?1",
    )?;

    while let Some(row) = rx.recv().await {
        if row.error.is_some() {
            errors += 1;
        } else {
            ok += 1;
        }
        save_one(&mut insert_stmt, &mut update_stmt, &row)?;
        pb.inc(1);
    }

    pb.finish_and_clear();
    info!("Fetched {} pages ({} ok, {} errors)", total, ok, errors);

    Ok(FetchStats { total, ok, errors })
}

fn save_one(
    insert: &mut rusqlite::Statement,
    update: &mut rusqlite::Statement,
    row: &ScrapeRow,
) -> Result<()> {
    insert.execute(rusqlite::params![
        row.vendor_id, row.url, row.slug, row.html, row.status, row.error, row.latency_ms,
    ])?;
    update.execute(rusqlite::params![row.vendor_id])?;
    Ok(())
}

async fn fetch_one(http: &HttpClient, vendor_id: i64, url: String, slug: String) -> ScrapeRow {
    match http.get_text(&url, &[]).await {
        Ok(fetched) => ScrapeRow {
            vendor_id,
            url,
            slug,
            html: Some(fetched.body),
            status: Some(i32::from(fetched.status)),
            error: None,
            latency_ms: Some(fetched.latency_ms),
        },
        Err(e) => {
            warn!("Failed to fetch {}: {:#}", slug, e);
            // Still recorded so the vendor is marked visited
            ScrapeRow {
                vendor_id,
                url,
                slug,
                html: None,
                status: None,
                error: Some(format!("{:#}", e)),
                latency_ms: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::listing::VendorListing;

    #[test]
    fn saved_row_marks_vendor_visited() {
        let conn = Connection::open_in_memory().unwrap();
        db::init_schema(&conn).unwrap();
        let listing = VendorListing {
            slug: "acme".into(),
            name: "Acme".into(),
            phone_number: None,
            minimum_spend: None,
        };
        db::insert_vendors(&conn, &[listing], "https://x/").unwrap();
        let (vendor_id, url, slug) = db::fetch_unvisited(&conn, None).unwrap().remove(0);

        let mut insert = conn
            .prepare(
                "INSERT INTO page_data (vendor_id, url, slug, html, status, error, latency_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )
            .unwrap();
        let mut update = conn.prepare("UPDATE vendors SET visited = 1 WHERE id = ?1").unwrap();
        let row = ScrapeRow {
            vendor_id,
            url,
            slug,
            html: None,
            status: None,
            error: Some("HTTP 404".into()),
            latency_ms: None,
        };
        save_one(&mut insert, &mut update, &row).unwrap();
        drop(insert);
        drop(update);

        assert!(db::fetch_unvisited(&conn, None).unwrap().is_empty());
        let stats = db::get_stats(&conn).unwrap();
        assert_eq!(stats.errors, 1);
        // Error rows carry no HTML, so nothing is queued for decoding.
        assert!(db::fetch_unprocessed(&conn, None).unwrap().is_empty());
    }
}
