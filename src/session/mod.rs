//! Session Store.
//!
//! Owns every store's authenticated marketplace session for the life of the
//! process. Sessions are loaded lazily on first use, validated with a cheap
//! probe, refreshed through a `CredentialRefresher` when invalid, and
//! persisted back on every refresh.
//!
//! Loads and refreshes for one store are single-flight: concurrent callers
//! queue on a per-store async mutex and reuse whatever the first caller
//! produced.

pub mod browser;

use async_trait::async_trait;
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::marketplace::{Marketplace, SessionProbe};
use crate::storage::Database;
use crate::types::{BrowserCookie, CookieMap, Credentials, DemperError, Session};

pub use browser::{CommandRefresher, UnconfiguredRefresher};

/// Capability that performs a fresh marketplace login.
///
/// The production implementation drives a headless browser in a helper
/// process; tests substitute a mock.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    async fn refresh_session(
        &self,
        store_id: i64,
        credentials: &Credentials,
    ) -> Result<Vec<BrowserCookie>, DemperError>;
}

/// On-disk shape of `stores.guid`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionBlob {
    #[serde(default)]
    cookies: Vec<BrowserCookie>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

impl SessionBlob {
    fn parse(store_id: i64, raw: Option<&str>) -> Self {
        let Some(raw) = raw.filter(|r| !r.trim().is_empty()) else {
            return Self::default();
        };
        serde_json::from_str(raw).unwrap_or_else(|e| {
            warn!(store_id, error = %e, "Stored session blob unreadable, treating as empty");
            Self::default()
        })
    }

    fn credentials(&self) -> Option<Credentials> {
        match (&self.email, &self.password) {
            (Some(email), Some(password)) if !email.is_empty() && !password.is_empty() => Some(Credentials {
                email: email.clone(),
                password: SecretString::new(password.clone()),
            }),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct SessionStore {
    db: Database,
    marketplace: Arc<dyn Marketplace>,
    refresher: Arc<dyn CredentialRefresher>,
    sessions: RwLock<HashMap<i64, Session>>,
    flights: Mutex<HashMap<i64, Arc<AsyncMutex<()>>>>,
    /// Stores skipped for the rest of the current round.
    unavailable: Mutex<HashSet<i64>>,
}

impl SessionStore {
    pub fn new(db: Database, marketplace: Arc<dyn Marketplace>, refresher: Arc<dyn CredentialRefresher>) -> Self {
        Self {
            db,
            marketplace,
            refresher,
            sessions: RwLock::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
            unavailable: Mutex::new(HashSet::new()),
        }
    }

    /// Forget per-round skip decisions. Cached sessions are kept.
    pub fn begin_round(&self) {
        self.unavailable_set().clear();
    }

    pub fn is_unavailable(&self, store_id: i64) -> bool {
        self.unavailable_set().contains(&store_id)
    }

    /// The store's live session, loading it on first use.
    ///
    /// Returns `SessionUnavailable` when the session is invalid and could
    /// not be refreshed; the store stays skipped until the next round.
    pub async fn session_for(&self, store_id: i64) -> Result<Session, DemperError> {
        if let Some(session) = self.usable(store_id).await? {
            return Ok(session);
        }

        let flight = self.flight(store_id);
        let _guard = flight.lock().await;
        if let Some(session) = self.usable(store_id).await? {
            return Ok(session);
        }

        if self.load_locked(store_id).await? {
            if let Some(session) = self.cached(store_id).await {
                return Ok(session);
            }
        }
        self.mark_unavailable(store_id);
        Err(unavailable(store_id, "session invalid and could not be refreshed"))
    }

    /// Fetch the persisted session, validate it and refresh if needed.
    /// Returns `false` when the caller must skip this store for the round.
    pub async fn load(&self, store_id: i64) -> Result<bool, DemperError> {
        let flight = self.flight(store_id);
        let _guard = flight.lock().await;
        let ok = self.load_locked(store_id).await?;
        if !ok {
            self.mark_unavailable(store_id);
        }
        Ok(ok)
    }

    /// Log in again with the stored credentials and persist the new cookies.
    pub async fn refresh(&self, store_id: i64) -> Result<(), DemperError> {
        let flight = self.flight(store_id);
        let _guard = flight.lock().await;
        self.refresh_locked(store_id).await
    }

    /// Persist cookies and credentials, replacing the previous session.
    pub async fn save(
        &self,
        store_id: i64,
        cookies: Vec<BrowserCookie>,
        credentials: Option<Credentials>,
    ) -> Result<(), DemperError> {
        let flight = self.flight(store_id);
        let _guard = flight.lock().await;
        self.save_locked(store_id, cookies, credentials, None).await
    }

    pub async fn get_cookies(&self, store_id: i64) -> Option<CookieMap> {
        self.sessions.read().await.get(&store_id).map(Session::cookie_map)
    }

    pub async fn get_merchant_id(&self, store_id: i64) -> Option<String> {
        self.sessions
            .read()
            .await
            .get(&store_id)
            .and_then(|s| s.merchant_id.clone())
    }

    /// React to a 401 observed with `observed` cookies.
    ///
    /// If another task already refreshed the session since those cookies
    /// were handed out, the newer session is returned without logging in
    /// again. Otherwise exactly one refresh is attempted; if it fails the
    /// store is skipped for the rest of the round.
    pub async fn handle_auth_failure(&self, store_id: i64, observed: &CookieMap) -> Result<Session, DemperError> {
        let flight = self.flight(store_id);
        let _guard = flight.lock().await;

        if self.is_unavailable(store_id) {
            return Err(unavailable(store_id, "refresh already failed this round"));
        }
        if let Some(current) = self.cached(store_id).await {
            if &current.cookie_map() != observed {
                debug!(store_id, "Session already refreshed by another task");
                return Ok(current);
            }
        }

        warn!(store_id, "Marketplace rejected session, refreshing");
        if let Err(e) = self.refresh_locked(store_id).await {
            error!(store_id, error = %e, kind = e.kind(), "Session refresh failed, skipping store this round");
            self.sessions.write().await.remove(&store_id);
            self.mark_unavailable(store_id);
            return Err(unavailable(store_id, &e.to_string()));
        }
        self.cached(store_id)
            .await
            .ok_or_else(|| unavailable(store_id, "session missing after refresh"))
    }

    // -- internals (caller holds the store's flight lock) ------------------

    async fn load_locked(&self, store_id: i64) -> Result<bool, DemperError> {
        let stored = self
            .db
            .load_session(store_id)
            .await?
            .ok_or_else(|| unavailable(store_id, "store not found"))?;
        let blob = SessionBlob::parse(store_id, stored.blob.as_deref());

        let mut session = Session {
            store_id,
            credentials: blob.credentials(),
            cookies: blob.cookies,
            last_login: stored.last_login,
            merchant_id: stored.merchant_id,
        };

        let probe = self.probe(store_id, &session.cookie_map()).await;
        if probe.valid {
            if session.merchant_id.is_none() {
                session.merchant_id = probe.merchant_ids.into_iter().next();
            }
            debug!(store_id, "Stored session is valid");
            self.sessions.write().await.insert(store_id, session);
            return Ok(true);
        }

        if session.credentials.is_none() {
            let e = DemperError::CredentialMissing(store_id);
            error!(store_id, error = %e, "Session invalid and no credentials to refresh with");
            self.sessions.write().await.remove(&store_id);
            return Ok(false);
        }

        // Cache what we have so refresh can reuse the credentials.
        self.sessions.write().await.insert(store_id, session);
        match self.refresh_locked(store_id).await {
            Ok(()) => Ok(true),
            Err(e) => {
                error!(store_id, error = %e, kind = e.kind(), "Session refresh failed");
                // Dead cookies must not be handed out next round.
                self.sessions.write().await.remove(&store_id);
                Ok(false)
            }
        }
    }

    async fn refresh_locked(&self, store_id: i64) -> Result<(), DemperError> {
        let credentials = match self.cached(store_id).await.and_then(|s| s.credentials) {
            Some(c) => c,
            None => {
                let stored = self.db.load_session(store_id).await?;
                SessionBlob::parse(store_id, stored.and_then(|s| s.blob).as_deref())
                    .credentials()
                    .ok_or(DemperError::CredentialMissing(store_id))?
            }
        };

        info!(store_id, "Refreshing marketplace session");
        let cookies = self.refresher.refresh_session(store_id, &credentials).await?;
        if cookies.is_empty() {
            return Err(DemperError::Auth("login produced no cookies".into()));
        }

        let cookie_map: CookieMap = cookies.iter().map(|c| (c.name.clone(), c.value.clone())).collect();
        let probe = self.probe(store_id, &cookie_map).await;
        let discovered = probe.merchant_ids.into_iter().next();

        self.save_locked(store_id, cookies, Some(credentials), discovered).await?;
        info!(store_id, "Session refreshed");
        Ok(())
    }

    async fn save_locked(
        &self,
        store_id: i64,
        cookies: Vec<BrowserCookie>,
        credentials: Option<Credentials>,
        discovered_merchant: Option<String>,
    ) -> Result<(), DemperError> {
        let blob = SessionBlob {
            cookies: cookies.clone(),
            email: credentials.as_ref().map(|c| c.email.clone()),
            password: credentials.as_ref().map(|c| c.password.expose_secret().clone()),
        };
        let raw = serde_json::to_string(&blob)
            .map_err(|e| DemperError::Persistence(format!("session blob encode: {e}")))?;

        let now = Utc::now();
        self.db
            .save_session(store_id, &raw, now, discovered_merchant.as_deref())
            .await?;
        let merchant_id = self
            .db
            .load_session(store_id)
            .await?
            .and_then(|s| s.merchant_id)
            .or(discovered_merchant);

        self.sessions.write().await.insert(
            store_id,
            Session {
                store_id,
                cookies,
                credentials,
                last_login: Some(now),
                merchant_id,
            },
        );
        Ok(())
    }

    /// Liveness probe; any error counts as an invalid session.
    async fn probe(&self, store_id: i64, cookies: &CookieMap) -> SessionProbe {
        if cookies.is_empty() {
            return SessionProbe::invalid();
        }
        match self.marketplace.probe_session(cookies).await {
            Ok(probe) => probe,
            Err(e) => {
                warn!(store_id, error = %e, "Session probe failed, treating session as invalid");
                SessionProbe::invalid()
            }
        }
    }

    async fn usable(&self, store_id: i64) -> Result<Option<Session>, DemperError> {
        if self.is_unavailable(store_id) {
            return Err(unavailable(store_id, "skipped for this round"));
        }
        Ok(self.cached(store_id).await)
    }

    async fn cached(&self, store_id: i64) -> Option<Session> {
        self.sessions.read().await.get(&store_id).cloned()
    }

    fn flight(&self, store_id: i64) -> Arc<AsyncMutex<()>> {
        let mut flights = self.flights.lock().unwrap_or_else(|p| p.into_inner());
        flights.entry(store_id).or_default().clone()
    }

    fn mark_unavailable(&self, store_id: i64) {
        self.unavailable_set().insert(store_id);
    }

    fn unavailable_set(&self) -> std::sync::MutexGuard<'_, HashSet<i64>> {
        self.unavailable.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn unavailable(store_id: i64, reason: &str) -> DemperError {
    DemperError::SessionUnavailable {
        store_id,
        reason: reason.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
