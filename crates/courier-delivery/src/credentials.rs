//! Per-tenant access token cache.
//!
//! A cached token is served until `expires_at`, which already subtracts a
//! safety margin from the platform-reported lifetime. Refreshes are
//! single-flight: concurrent callers for one tenant share a single upstream
//! call through a [`Shared`] future, and a failed refresh leaves the entry
//! empty so the next caller tries again.

use std::{collections::HashMap, sync::Arc, time::Duration};

use courier_core::{Credential, SharedClock, TenantConfig, TenantKey};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::{info_span, Instrument};

use crate::{
    circuit::{CircuitBreaker, CircuitConfig, CircuitSnapshot},
    client::PlatformApi,
    error::{DeliveryError, Result},
    rate_limit::RateLimiter,
};

/// Lower bound on the expiry safety margin.
pub const MIN_SAFETY_MARGIN: Duration = Duration::from_secs(60);

type SharedRefresh = Shared<BoxFuture<'static, Result<Credential>>>;

/// Credential store settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialConfig {
    /// Subtracted from the token lifetime; clamped to at least one minute.
    pub safety_margin: Duration,
    /// Breaker settings for each tenant's token endpoint.
    pub circuit: CircuitConfig,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self { safety_margin: MIN_SAFETY_MARGIN, circuit: CircuitConfig::default() }
    }
}

#[derive(Default)]
struct Slot {
    cached: Option<Credential>,
    inflight: Option<SharedRefresh>,
}

struct StoreInner {
    api: Arc<dyn PlatformApi>,
    limiter: Arc<RateLimiter>,
    clock: SharedClock,
    config: CredentialConfig,
    slots: Mutex<HashMap<TenantKey, Slot>>,
    breakers: Mutex<HashMap<TenantKey, Arc<CircuitBreaker>>>,
}

/// Token cache with single-flight refresh, gated by a rate limiter and
/// protected by a per-tenant circuit breaker.
#[derive(Clone)]
pub struct CredentialStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("tenants", &self.inner.slots.lock().len())
            .field("safety_margin", &self.inner.config.safety_margin)
            .finish_non_exhaustive()
    }
}

impl CredentialStore {
    /// Creates an empty store.
    pub fn new(
        api: Arc<dyn PlatformApi>,
        limiter: Arc<RateLimiter>,
        clock: SharedClock,
        mut config: CredentialConfig,
    ) -> Self {
        config.safety_margin = config.safety_margin.max(MIN_SAFETY_MARGIN);
        Self {
            inner: Arc::new(StoreInner {
                api,
                limiter,
                clock,
                config,
                slots: Mutex::new(HashMap::new()),
                breakers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Returns a valid access token for `tenant`, refreshing if needed.
    ///
    /// # Errors
    ///
    /// Propagates the refresh failure; an expired token is never returned.
    pub async fn get_token(&self, tenant: &TenantConfig) -> Result<String> {
        self.credential(tenant).await.map(|credential| credential.token)
    }

    /// Returns the full credential for `tenant`, refreshing if needed.
    pub async fn credential(&self, tenant: &TenantConfig) -> Result<Credential> {
        let key = tenant.tenant_key();
        let now = self.inner.clock.now_utc();

        let refresh = {
            let mut slots = self.inner.slots.lock();
            let slot = slots.entry(key.clone()).or_default();

            if let Some(credential) = slot.cached.as_ref().filter(|c| c.is_valid_at(now)) {
                return Ok(credential.clone());
            }
            slot.cached = None;

            if let Some(inflight) = &slot.inflight {
                tracing::debug!(tenant = %key, "joining in-flight token refresh");
                inflight.clone()
            } else {
                let refresh = Arc::clone(&self.inner).refresh(key.clone(), tenant.clone()).boxed().shared();
                slot.inflight = Some(refresh.clone());
                refresh
            }
        };

        refresh.await
    }

    /// Cached credential for `tenant`, if still valid.
    pub fn cached(&self, tenant: &TenantConfig) -> Option<Credential> {
        let now = self.inner.clock.now_utc();
        self.inner
            .slots
            .lock()
            .get(&tenant.tenant_key())
            .and_then(|slot| slot.cached.clone())
            .filter(|credential| credential.is_valid_at(now))
    }

    /// Drops the cached token so the next call refreshes.
    pub fn invalidate(&self, tenant: &TenantConfig) {
        let key = tenant.tenant_key();
        if let Some(slot) = self.inner.slots.lock().get_mut(&key) {
            slot.cached = None;
        }
        tracing::info!(tenant = %key, account = %tenant.account_id, "access token invalidated");
    }

    /// Breaker protecting token issuance for `tenant`.
    pub fn breaker(&self, tenant: &TenantConfig) -> Arc<CircuitBreaker> {
        self.inner.breaker_for(&tenant.tenant_key())
    }

    /// Snapshots of every token breaker created so far.
    pub fn breaker_snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut snapshots: Vec<_> = self.inner.breakers.lock().values().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}

impl StoreInner {
    fn breaker_for(&self, key: &TenantKey) -> Arc<CircuitBreaker> {
        self.breakers
            .lock()
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(format!("token:{key}"), self.config.circuit.clone(), self.clock.clone()))
            })
            .clone()
    }

    async fn refresh(self: Arc<Self>, key: TenantKey, tenant: TenantConfig) -> Result<Credential> {
        let span = info_span!("token_refresh", tenant = %key, account = %tenant.account_id);
        let result = self.issue(&key, &tenant).instrument(span).await;

        let mut slots = self.slots.lock();
        let slot = slots.entry(key).or_default();
        slot.inflight = None;
        slot.cached = result.as_ref().ok().cloned();
        result
    }

    async fn issue(&self, key: &TenantKey, tenant: &TenantConfig) -> Result<Credential> {
        self.limiter.acquire(&format!("token:{key}")).await?;

        let breaker = self.breaker_for(key);
        let issued_at = self.clock.now_utc();
        let grant = breaker
            .execute(|| self.api.issue_token(&tenant.corp_id, &tenant.corp_secret))
            .await
            .map_err(|error| {
                tracing::error!(error = %error, "token issuance failed");
                match error {
                    DeliveryError::CircuitOpen { .. } => error,
                    other => DeliveryError::refresh_failed(&other),
                }
            })?;

        let lifetime = grant.expires_in.saturating_sub(self.config.safety_margin);
        let expires_at = issued_at + chrono::Duration::from_std(lifetime).unwrap_or_else(|_| chrono::Duration::zero());
        tracing::info!(
            expires_in_secs = grant.expires_in.as_secs(),
            cache_for_secs = lifetime.as_secs(),
            "access token refreshed"
        );

        Ok(Credential { tenant_key: key.clone(), token: grant.access_token, issued_at, expires_at })
    }
}
