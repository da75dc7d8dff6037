//! Browser-like request headers.
//!
//! Public offer queries get a fresh randomized header set per request so
//! that consecutive calls do not share a fingerprint. Seller-cabinet calls
//! use a fixed, realistic set. `accept-encoding` is left to the HTTP
//! client, which negotiates and decodes compressed bodies itself.

use rand::seq::SliceRandom;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/134.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.3 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/133.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/134.0.0.0 Safari/537.36 OPR/119.0.0.0",
];

const ACCEPTS: &[&str] = &["application/json, text/*", "application/json, text/html, */*"];

const ACCEPT_LANGUAGES: &[&str] = &[
    "ru-RU,ru;q=0.9,en-US;q=0.8,en;q=0.7",
    "ru-RU,ru;q=0.8,en-US;q=0.7,en;q=0.6",
    "en-US,en;q=0.9,ru-RU;q=0.8,ru;q=0.7",
];

const CACHE_CONTROLS: &[&str] = &["no-cache", "max-age=0"];

const ORIGIN: &str = "https://kaspi.kz";
const REFERER: &str = "https://kaspi.kz/";

/// Randomized headers for the public offer query of one product.
pub fn offer_query_headers<R: Rng + ?Sized>(rng: &mut R, city_id: &str, external_id: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    put(&mut headers, "accept", pick(rng, ACCEPTS));
    put(&mut headers, "accept-language", pick(rng, ACCEPT_LANGUAGES));
    put(&mut headers, "cache-control", pick(rng, CACHE_CONTROLS));
    put(&mut headers, "content-type", "application/json; charset=UTF-8");
    put(&mut headers, "origin", ORIGIN);
    put(&mut headers, "referer", &format!("https://kaspi.kz/shop/p/{external_id}"));
    put(&mut headers, "user-agent", pick(rng, USER_AGENTS));
    put(&mut headers, "x-ks-city", city_id);
    if rng.gen_bool(0.5) {
        put(&mut headers, "pragma", "no-cache");
    }
    headers
}

/// Fixed headers for authenticated seller-cabinet requests.
pub fn merchant_headers(city_id: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    put(&mut headers, "accept", "application/json, text/plain, */*");
    put(&mut headers, "accept-language", ACCEPT_LANGUAGES[0]);
    put(&mut headers, "cache-control", "no-cache");
    put(&mut headers, "origin", ORIGIN);
    put(&mut headers, "referer", REFERER);
    put(&mut headers, "user-agent", USER_AGENTS[3]);
    put(&mut headers, "x-auth-version", "3");
    put(&mut headers, "x-ks-city", city_id);
    headers
}

fn pick<'a, R: Rng + ?Sized>(rng: &mut R, choices: &[&'a str]) -> &'a str {
    choices.choose(rng).copied().unwrap_or_default()
}

fn put(headers: &mut HeaderMap, name: &'static str, value: &str) {
    // Values come from the tables above or from ids; skip anything unencodable.
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}
