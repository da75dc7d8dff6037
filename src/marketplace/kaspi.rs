//! Kaspi marketplace integration.
//!
//! Public offer query: `POST https://kaspi.kz/yml/offer-view/offers/{id}`
//! Price upload:       `POST https://mc.shop.kaspi.kz/pricefeed/upload/merchant/process`
//! Session probe:      `GET  https://mc.shop.kaspi.kz/s/m`
//! Seller catalog:     `GET  https://mc.shop.kaspi.kz/bff/offer-view/list?m=&p=&l=&a=true`
//!
//! Offer queries are anonymous and routed through an egress keyed on the
//! listing SKU. Seller-cabinet calls carry the session cookies and are
//! routed through an egress keyed on the merchant id.

use async_trait::async_trait;
use reqwest::header::COOKIE;
use reqwest::{Client, Response, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::headers::{merchant_headers, offer_query_headers};
use super::{Marketplace, PriceUpdate, SessionProbe};
use crate::config::MarketplaceConfig;
use crate::proxy::{ProxyEndpoint, ProxySelector};
use crate::types::{cookie_header, CatalogOffer, CompetitorOffer, CookieMap, DemperError, Listing};

const DIRECT: &str = "direct";

// ---------------------------------------------------------------------------
// Kaspi API types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OfferQuery<'a> {
    city_id: &'a str,
    id: &'a str,
    #[serde(rename = "merchantUID")]
    merchant_uid: Vec<String>,
    limit: u32,
    page: u32,
    sort_option: &'a str,
    high_rating: Option<bool>,
    search_text: Option<String>,
    zone_id: Vec<&'a str>,
    installation_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct OfferQueryResponse {
    offers: Option<Vec<RawOffer>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOffer {
    #[serde(default)]
    merchant_id: Option<String>,
    #[serde(default)]
    price: Option<Decimal>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PriceUploadRequest<'a> {
    merchant_uid: &'a str,
    availabilities: Vec<Availability>,
    sku: &'a str,
    price: Decimal,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Availability {
    available: &'static str,
    store_id: String,
    stock_enabled: bool,
}

#[derive(Debug, Deserialize)]
struct ProbeResponse {
    #[serde(default)]
    merchants: Vec<ProbeMerchant>,
}

#[derive(Debug, Deserialize)]
struct ProbeMerchant {
    uid: String,
}

#[derive(Debug, Deserialize)]
struct CatalogResponse {
    #[serde(default)]
    data: Vec<RawCatalogOffer>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCatalogOffer {
    #[serde(default)]
    offer_id: Option<String>,
    #[serde(default)]
    sku: Option<String>,
    #[serde(default)]
    master_title: Option<String>,
    #[serde(default)]
    master_category: Option<String>,
    #[serde(default)]
    min_price: Option<Decimal>,
    #[serde(default)]
    shop_link: Option<String>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// reqwest-backed Kaspi client.
///
/// One underlying `reqwest::Client` per egress, built on first use and
/// reused afterwards so connection pools survive across rounds.
pub struct KaspiClient {
    config: MarketplaceConfig,
    proxies: Arc<ProxySelector>,
    timeout: Duration,
    clients: Mutex<HashMap<String, Client>>,
}

impl KaspiClient {
    pub fn new(config: MarketplaceConfig, proxies: Arc<ProxySelector>, timeout: Duration) -> Self {
        info!(
            proxied = proxies.is_enabled(),
            timeout_secs = timeout.as_secs(),
            "Kaspi client initialised"
        );
        Self {
            config,
            proxies,
            timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// HTTP client routed through the egress assigned to `key`.
    fn client_for(&self, key: &str) -> Result<Client, DemperError> {
        let endpoint = self.proxies.select(key);
        let cache_key = endpoint
            .as_ref()
            .map(ProxyEndpoint::url)
            .unwrap_or_else(|| DIRECT.to_string());

        let mut clients = self.clients.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(client) = clients.get(&cache_key) {
            return Ok(client.clone());
        }

        let mut builder = Client::builder().timeout(self.timeout);
        if let Some(endpoint) = &endpoint {
            builder = builder.proxy(endpoint.to_reqwest()?);
        }
        let client = builder.build()?;
        clients.insert(cache_key, client.clone());
        Ok(client)
    }

    fn offers_url(&self, external_id: &str) -> String {
        self.config.offers_url.replace("{id}", external_id)
    }
}

#[async_trait]
impl Marketplace for KaspiClient {
    async fn fetch_offers(&self, listing: &Listing) -> Result<Vec<CompetitorOffer>, DemperError> {
        let client = self.client_for(&format!("sku_{}", listing.sku))?;
        let headers = offer_query_headers(&mut rand::thread_rng(), &self.config.city_id, &listing.external_id);
        let body = OfferQuery {
            city_id: &self.config.city_id,
            id: &listing.external_id,
            merchant_uid: Vec::new(),
            limit: self.config.offers_limit,
            page: 0,
            sort_option: "PRICE",
            high_rating: None,
            search_text: None,
            zone_id: vec![self.config.zone_id.as_str()],
            installation_id: "-1",
        };

        let resp = client
            .post(self.offers_url(&listing.external_id))
            .headers(headers)
            .json(&body)
            .send()
            .await?;
        let resp = check_status(resp, "offer query").await?;

        let parsed: OfferQueryResponse = resp
            .json()
            .await
            .map_err(|e| DemperError::Transport(format!("offer query: bad response body: {e}")))?;
        let offers = parsed
            .offers
            .ok_or_else(|| DemperError::Transport("offer query: response has no offers field".into()))?;

        let offers: Vec<CompetitorOffer> = offers
            .into_iter()
            .filter_map(|raw| match (raw.merchant_id, raw.price) {
                (Some(merchant_id), Some(price)) if !merchant_id.is_empty() && price > Decimal::ZERO => {
                    Some(CompetitorOffer { merchant_id, price })
                }
                _ => None,
            })
            .collect();

        debug!(listing_id = listing.id, sku = %listing.sku, offers = offers.len(), "Offers fetched");
        Ok(offers)
    }

    async fn update_price(&self, update: &PriceUpdate) -> Result<(), DemperError> {
        let client = self.client_for(&format!("merchant_{}", update.merchant_id))?;
        let body = PriceUploadRequest {
            merchant_uid: &update.merchant_id,
            availabilities: vec![Availability {
                available: "yes",
                store_id: format!("{}_PP1", update.merchant_id),
                stock_enabled: false,
            }],
            sku: &update.sku,
            price: update.price,
        };

        let resp = client
            .post(&self.config.price_update_url)
            .headers(merchant_headers(&self.config.city_id))
            .header(COOKIE, cookie_header(&update.cookies))
            .json(&body)
            .send()
            .await?;
        check_status(resp, "price upload").await?;

        debug!(sku = %update.sku, price = %update.price, "Price upload accepted");
        Ok(())
    }

    async fn probe_session(&self, cookies: &CookieMap) -> Result<SessionProbe, DemperError> {
        if cookies.is_empty() {
            return Ok(SessionProbe::invalid());
        }

        let client = self.client_for(DIRECT)?;
        let resp = client
            .get(&self.config.session_probe_url)
            .headers(merchant_headers(&self.config.city_id))
            .header(COOKIE, cookie_header(cookies))
            .send()
            .await?;

        if resp.status() != StatusCode::OK {
            debug!(status = %resp.status(), "Session probe rejected");
            return Ok(SessionProbe::invalid());
        }

        // A 200 is a live session even if the body is not the expected shape.
        let merchant_ids = match resp.json::<ProbeResponse>().await {
            Ok(body) => body.merchants.into_iter().map(|m| m.uid).collect(),
            Err(e) => {
                warn!(error = %e, "Session probe body unreadable");
                Vec::new()
            }
        };
        Ok(SessionProbe {
            valid: true,
            merchant_ids,
        })
    }

    async fn fetch_catalog_page(
        &self,
        merchant_id: &str,
        cookies: &CookieMap,
        page: u32,
    ) -> Result<Vec<CatalogOffer>, DemperError> {
        let client = self.client_for(&format!("merchant_{merchant_id}"))?;
        let page_size = self.config.catalog_page_size.to_string();
        let page_str = page.to_string();

        let resp = client
            .get(&self.config.catalog_url)
            .query(&[
                ("m", merchant_id),
                ("p", page_str.as_str()),
                ("l", page_size.as_str()),
                ("a", "true"),
            ])
            .headers(merchant_headers(&self.config.city_id))
            .header(COOKIE, cookie_header(cookies))
            .send()
            .await?;
        let resp = check_status(resp, "catalog page").await?;

        let parsed: CatalogResponse = resp
            .json()
            .await
            .map_err(|e| DemperError::Transport(format!("catalog page: bad response body: {e}")))?;

        let offers: Vec<CatalogOffer> = parsed.data.into_iter().filter_map(map_catalog_offer).collect();
        debug!(merchant_id, page, offers = offers.len(), "Catalog page fetched");
        Ok(offers)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map a non-success status onto the error taxonomy.
async fn check_status(resp: Response, what: &str) -> Result<Response, DemperError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let detail = format!("{what}: HTTP {status}: {}", truncate(&body, 200));
    Err(match status {
        StatusCode::UNAUTHORIZED => DemperError::Auth(detail),
        StatusCode::TOO_MANY_REQUESTS => DemperError::RateLimited(detail),
        _ => DemperError::Transport(detail),
    })
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn map_catalog_offer(raw: RawCatalogOffer) -> Option<CatalogOffer> {
    let sku = raw.sku.filter(|s| !s.is_empty())?;
    let price = raw.min_price?;
    Some(CatalogOffer {
        offer_id: raw.offer_id,
        sku,
        name: raw.master_title,
        category: raw.master_category,
        price,
        external_id: raw.shop_link.as_deref().and_then(external_id_from_link),
    })
}

/// Product id from a shop link such as `/shop/p/some-title-123456/?c=750000000`:
/// the last `-<digits>/` run after `/p/`.
pub fn external_id_from_link(link: &str) -> Option<String> {
    let rest = &link[link.find("/p/")? + 3..];
    rest.match_indices('-').rev().find_map(|(idx, _)| {
        let tail = &rest[idx + 1..];
        let digits = tail.bytes().take_while(u8::is_ascii_digit).count();
        (digits > 0 && tail[digits..].starts_with('/')).then(|| tail[..digits].to_string())
    })
}
