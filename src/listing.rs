use anyhow::Result;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::SiteConfig;
use crate::http::HttpClient;

/// One vendor as listed by the find-vendors API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorListing {
    pub slug: String,
    pub name: String,
    pub phone_number: Option<String>,
    /// Lowest minimum spend across the vendor's price entries, in cents.
    pub minimum_spend: Option<i64>,
}

impl VendorListing {
    pub fn page_url(&self, base: &str) -> String {
        format!("{}/{}", base.trim_end_matches('/'), self.slug)
    }
}

#[derive(Debug, Deserialize)]
struct FindVendorsPage {
    #[serde(default)]
    vendors: Option<Vec<ApiVendor>>,
}

#[derive(Debug, Deserialize)]
struct ApiVendor {
    #[serde(default)]
    slug: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    phone_number: Option<String>,
    #[serde(default)]
    prices: Option<Vec<ApiPrice>>,
}

#[derive(Debug, Deserialize)]
struct ApiPrice {
    #[serde(default)]
    minimum_spend_cents: Option<i64>,
}

impl From<ApiVendor> for VendorListing {
    fn from(item: ApiVendor) -> Self {
        let minimum_spend = item
            .prices
            .unwrap_or_default()
            .iter()
            .filter_map(|p| p.minimum_spend_cents)
            .min();
        VendorListing {
            slug: item.slug.unwrap_or_default(),
            name: item.name.unwrap_or_default(),
            phone_number: item.phone_number,
            minimum_spend,
        }
    }
}

/// Listings from one API page. An empty list means the end of the results.
pub fn parse_listing_page(body: &str) -> Result<Vec<VendorListing>> {
    let page: FindVendorsPage = serde_json::from_str(body)?;
    Ok(page
        .vendors
        .unwrap_or_default()
        .into_iter()
        .map(VendorListing::from)
        .collect())
}

/// Search filters for the listing API.
#[derive(Debug, Clone)]
pub struct ListingQuery {
    pub category: String,
    pub location: Option<String>,
}

impl ListingQuery {
    pub fn from_config(cfg: &SiteConfig) -> Self {
        Self {
            category: cfg.default_category.clone(),
            location: cfg.default_location.clone(),
        }
    }

    fn params(&self, page: u32) -> Vec<(&'static str, String)> {
        let mut params = vec![("category", self.category.clone())];
        if let Some(location) = &self.location {
            params.push(("location", location.clone()));
        }
        params.push(("page", page.to_string()));
        params
    }
}

/// Page through the API from `start_page` until `n` vendors are collected or a page comes
/// back empty.
pub async fn collect_vendors(
    http: &HttpClient,
    cfg: &SiteConfig,
    query: &ListingQuery,
    n: usize,
    start_page: u32,
) -> Result<Vec<VendorListing>> {
    let mut collected = Vec::new();
    let mut page = start_page;

    while collected.len() < n {
        info!("Fetching listing page {} ({}/{} vendors)", page, collected.len(), n);
        let fetched = http.get_text(&cfg.find_vendors_url, &query.params(page)).await?;
        let vendors = parse_listing_page(&fetched.body)?;
        if vendors.is_empty() {
            info!("No more vendors found on page {}", page);
            break;
        }

        for v in vendors {
            if collected.len() >= n {
                break;
            }
            if v.slug.is_empty() {
                debug!("Skipping listing without slug: {:?}", v.name);
                continue;
            }
            collected.push(v);
        }
        page += 1;
    }

    Ok(collected)
}
