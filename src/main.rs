use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use vendor_scraper::config::SiteConfig;
use vendor_scraper::http::HttpClient;
use vendor_scraper::listing::{self, ListingQuery};
use vendor_scraper::{contacts, db, enrich, export, fetch, parser};

#[derive(Parser)]
#[command(name = "vendor_scraper", about = "PartySlate vendor scraper and contact sheet builder")]
struct Cli {
    /// SQLite database path (overrides PARTYSLATE_DB_PATH)
    #[arg(long, global = true)]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Collect vendor listings into the queue
    Init {
        /// Number of vendors to collect
        #[arg(short = 'n', long, default_value = "50")]
        count: usize,
        /// First listing page to read
        #[arg(long, default_value = "1")]
        start_page: u32,
        /// Vendor category (default from config)
        #[arg(short, long)]
        category: Option<String>,
        /// Location filter (default from config)
        #[arg(short, long)]
        location: Option<String>,
    },
    /// Fetch unvisited vendor pages
    Scrape {
        /// Max pages to fetch (default: all unvisited)
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Decode fetched pages into business records
    Process {
        /// Max pages to process (default: all unprocessed)
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Harvest phones, emails and links from vendor websites
    Contacts {
        /// Max websites to visit
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Scrape + process + contacts in one pipeline
    Run {
        /// Max pages to scrape+process
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Show pipeline statistics
    Stats,
    /// Write the JSON interchange file and the contacts sheet
    Export {
        /// JSON output path
        #[arg(long, default_value = "data/vendors.json")]
        json: PathBuf,
        /// CSV output path
        #[arg(long, default_value = "data/vendors.csv")]
        csv: PathBuf,
        /// Build the sheet from an existing JSON file instead of the database
        #[arg(long)]
        from_json: Option<PathBuf>,
    },
    /// Fill in emails and phones of a contacts sheet through the ContactOut API
    Enrich {
        /// Input CSV
        #[arg(short, long, default_value = "data/vendors.csv")]
        input: PathBuf,
        /// Output CSV
        #[arg(short, long, default_value = "data/vendors_enriched.csv")]
        output: PathBuf,
        /// File with one API token per line
        #[arg(long, default_value = "tokens")]
        tokens: PathBuf,
        /// Response cache file
        #[arg(long, default_value = "cache/contactout_tokens_cache.json")]
        cache: PathBuf,
        /// Concurrent lookups
        #[arg(long, default_value = "5")]
        concurrency: usize,
        /// API base URL
        #[arg(long, env = "CONTACTOUT_BASE_URL", default_value = enrich::client::DEFAULT_BASE_URL)]
        base_url: String,
    },
    /// Decode a saved vendor page and print its frames or business record
    Decode {
        /// HTML file
        file: PathBuf,
        /// Print the frame list instead of the record
        #[arg(long)]
        frames: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let mut cfg = SiteConfig::load()?;
    if let Some(path) = cli.db {
        cfg.db_path = path;
    }

    let result = match cli.command {
        Commands::Init { count, start_page, category, location } => {
            let conn = open_db(&cfg)?;
            let http = HttpClient::new(&cfg)?;
            let mut query = ListingQuery::from_config(&cfg);
            if let Some(c) = category {
                query.category = c;
            }
            if location.is_some() {
                query.location = location;
            }
            let vendors = listing::collect_vendors(&http, &cfg, &query, count, start_page).await?;
            let inserted = db::insert_vendors(&conn, &vendors, &cfg.vendor_url_base)?;
            println!("Inserted {} new vendors ({} collected)", inserted, vendors.len());
            Ok(())
        }
        Commands::Scrape { limit } => {
            let conn = open_db(&cfg)?;
            let pages = db::fetch_unvisited(&conn, limit)?;
            if pages.is_empty() {
                println!("No unvisited pages. Run 'init' first or all pages are fetched.");
                return Ok(());
            }
            println!("Fetching {} pages (streaming to DB)...", pages.len());
            let http = HttpClient::new(&cfg)?;
            let stats = fetch::fetch_pages_streaming(&conn, &http, pages, cfg.concurrency).await?;
            println!("Done: {} fetched ({} ok, {} errors).", stats.total, stats.ok, stats.errors);
            Ok(())
        }
        Commands::Process { limit } => {
            let conn = open_db(&cfg)?;
            let pages = db::fetch_unprocessed(&conn, limit)?;
            if pages.is_empty() {
                println!("No unprocessed pages. Run 'scrape' first.");
                return Ok(());
            }
            println!("Processing {} pages...", pages.len());
            let counts = process_pages(&conn, &pages, &cfg.marker_chunk_substring)?;
            counts.print();
            Ok(())
        }
        Commands::Contacts { limit } => {
            let conn = open_db(&cfg)?;
            let targets = db::fetch_contact_targets(&conn, limit)?;
            if targets.is_empty() {
                println!("No websites left to visit. Run 'process' first.");
                return Ok(());
            }
            println!("Visiting {} vendor websites...", targets.len());
            let http = HttpClient::new(&cfg)?;
            let stats =
                contacts::harvest_contacts_streaming(&conn, &http, targets, cfg.concurrency).await?;
            println!(
                "Done: {} websites ({} with contacts, {} errors).",
                stats.total, stats.with_contacts, stats.errors
            );
            Ok(())
        }
        Commands::Run { limit } => {
            let conn = open_db(&cfg)?;
            let pages = db::fetch_unvisited(&conn, limit)?;
            if pages.is_empty() {
                println!("No unvisited pages. Run 'init' first.");
                return Ok(());
            }
            let http = HttpClient::new(&cfg)?;

            // Phase 1: Fetch (streaming to DB)
            let t_fetch = Instant::now();
            println!("Pipeline: fetching {} pages (streaming to DB)...", pages.len());
            let stats = fetch::fetch_pages_streaming(&conn, &http, pages, cfg.concurrency).await?;
            println!(
                "Fetched {} pages ({} ok, {} errors) in {:.1}s",
                stats.total, stats.ok, stats.errors, t_fetch.elapsed().as_secs_f64()
            );

            // Phase 2: Decode
            let t_process = Instant::now();
            let unprocessed = db::fetch_unprocessed(&conn, None)?;
            if unprocessed.is_empty() {
                println!("Nothing to process (all fetched pages had errors).");
                return Ok(());
            }
            println!("Processing {} pages...", unprocessed.len());
            let counts = process_pages(&conn, &unprocessed, &cfg.marker_chunk_substring)?;
            println!("Processed in {:.1}s", t_process.elapsed().as_secs_f64());
            counts.print();

            // Phase 3: Vendor websites
            let targets = db::fetch_contact_targets(&conn, None)?;
            if !targets.is_empty() {
                println!("Visiting {} vendor websites...", targets.len());
                let stats =
                    contacts::harvest_contacts_streaming(&conn, &http, targets, cfg.concurrency)
                        .await?;
                println!(
                    "Visited {} websites ({} with contacts, {} errors)",
                    stats.total, stats.with_contacts, stats.errors
                );
            }
            Ok(())
        }
        Commands::Stats => {
            let conn = open_db(&cfg)?;
            let s = db::get_stats(&conn)?;
            println!("Total:         {}", s.total);
            println!("Visited:       {}", s.visited);
            println!("Unvisited:     {}", s.unvisited);
            println!("Fetched:       {}", s.scraped);
            println!("Fetch errors:  {}", s.errors);
            println!("Processed:     {}", s.processed);
            println!("Decode errors: {}", s.decode_errors);
            println!("With website:  {}", s.with_website);
            println!("Team members:  {}", s.team_members);
            println!("Websites seen: {}", s.contacts_fetched);
            Ok(())
        }
        Commands::Export { json, csv, from_json } => {
            let vendors = match from_json {
                Some(path) => export::read_json(&path)?,
                None => {
                    let conn = open_db(&cfg)?;
                    let vendors = db::fetch_export(&conn)?;
                    ensure_parent(&json)?;
                    export::write_json(&json, &vendors)?;
                    println!("Wrote {} vendors to {}", vendors.len(), json.display());
                    vendors
                }
            };
            ensure_parent(&csv)?;
            let rows = export::write_csv(&csv, &vendors)?;
            println!("Wrote {} rows to {}", rows, csv.display());
            Ok(())
        }
        Commands::Enrich { input, output, tokens, cache, concurrency, base_url } => {
            ensure_parent(&output)?;
            let rows = enrich::process_csv(enrich::EnrichOptions {
                input: &input,
                output: &output,
                tokens_path: &tokens,
                cache_path: &cache,
                base_url: &base_url,
                concurrency,
                timeout: cfg.timeout(),
            })
            .await?;
            println!("Wrote {} enriched rows to {}", rows, output.display());
            Ok(())
        }
        Commands::Decode { file, frames } => {
            let html = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let decoded = parser::decode_page(&html, &cfg.marker_chunk_substring)?;
            if frames {
                for f in &decoded {
                    println!(
                        "{:>4} | {:<3} | {:>6} | {}",
                        f.id,
                        f.type_tag,
                        f.value.len(),
                        truncate(&f.value, 80)
                    );
                }
                println!("\n{} frames", decoded.len());
            } else {
                let record = parser::extract_business_record(&decoded);
                println!("{}", serde_json::to_string_pretty(&record)?);
            }
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn open_db(cfg: &SiteConfig) -> anyhow::Result<rusqlite::Connection> {
    let conn = db::connect(&cfg.db_path)?;
    db::init_schema(&conn)?;
    Ok(conn)
}

fn ensure_parent(path: &std::path::Path) -> anyhow::Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    Ok(())
}

struct ProcessCounts {
    records: usize,
    with_website: usize,
    team_members: usize,
    decode_errors: usize,
}

impl ProcessCounts {
    fn print(&self) {
        println!(
            "Saved {} records ({} with website), {} team members, {} decode errors.",
            self.records, self.with_website, self.team_members, self.decode_errors,
        );
    }
}

fn process_pages(
    conn: &rusqlite::Connection,
    pages: &[db::ScrapedPage],
    marker: &str,
) -> anyhow::Result<ProcessCounts> {
    use rayon::prelude::*;

    let pb = fetch::progress_bar(pages.len())?;

    let mut counts = ProcessCounts {
        records: 0,
        with_website: 0,
        team_members: 0,
        decode_errors: 0,
    };

    for chunk in pages.chunks(500) {
        let rows: Vec<db::RecordRow> = chunk
            .par_iter()
            .map(|page| parser::process_page(page, marker))
            .collect();

        for r in &rows {
            counts.records += 1;
            counts.with_website += usize::from(r.record.url.is_some());
            counts.team_members += r.record.team_members.len();
            counts.decode_errors += usize::from(r.decode_error.is_some());
        }

        db::save_records(conn, &rows)?;
        pb.inc(chunk.len() as u64);
    }

    pb.finish_and_clear();
    Ok(counts)
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
