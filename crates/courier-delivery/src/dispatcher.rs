//! Sends one message for one account: token lookup, breaker, platform call.

use std::{collections::HashMap, sync::Arc};

use courier_core::{OutboundMessage, SendReceipt, SharedClock, TenantConfig, TenantDirectory};
use parking_lot::Mutex;
use tracing::{info_span, Instrument};

use crate::{
    circuit::{CircuitBreaker, CircuitConfig, CircuitSnapshot},
    client::PlatformApi,
    credentials::CredentialStore,
    error::{DeliveryError, Result},
    queue::{send_fn, SendFn},
};

/// Resolves tenants and performs single send attempts on their behalf.
///
/// A platform errcode saying the token is invalid drops the cached token, so
/// the retry that follows fetches a fresh one.
#[derive(Debug)]
pub struct Dispatcher {
    tenants: Arc<dyn TenantDirectory>,
    credentials: CredentialStore,
    api: Arc<dyn PlatformApi>,
    clock: SharedClock,
    circuit: CircuitConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl Dispatcher {
    /// Creates a dispatcher sharing `credentials` and `api`.
    pub fn new(
        tenants: Arc<dyn TenantDirectory>,
        credentials: CredentialStore,
        api: Arc<dyn PlatformApi>,
        clock: SharedClock,
        circuit: CircuitConfig,
    ) -> Self {
        Self { tenants, credentials, api, clock, circuit, breakers: Mutex::new(HashMap::new()) }
    }

    /// Tenant for `account_id`.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::CredentialMissing`] when the account is unknown.
    pub fn tenant(&self, account_id: &str) -> Result<TenantConfig> {
        self.tenants
            .resolve(account_id)
            .ok_or_else(|| DeliveryError::CredentialMissing { tenant: account_id.to_owned() })
    }

    /// One send attempt for `account_id`.
    pub async fn send(&self, account_id: &str, message: &OutboundMessage) -> Result<SendReceipt> {
        let tenant = self.tenant(account_id)?;
        let span = info_span!("dispatch", account = %account_id, msg_type = message.body.msg_type());

        async {
            let token = self.credentials.get_token(&tenant).await?;
            let breaker = self.breaker(account_id);
            let result = breaker.execute(|| self.api.send_message(&token, tenant.agent_id, message)).await;

            match &result {
                Ok(receipt) if !receipt.fully_delivered() => tracing::warn!(
                    invalid_users = ?receipt.invalid_users,
                    invalid_parties = ?receipt.invalid_parties,
                    invalid_tags = ?receipt.invalid_tags,
                    "message accepted with invalid recipients"
                ),
                Ok(_) => {},
                Err(error) if error.is_token_invalid() => {
                    tracing::warn!(error = %error, "platform rejected access token");
                    self.credentials.invalidate(&tenant);
                },
                Err(error) => tracing::warn!(error = %error, "send attempt failed"),
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Queue-compatible send function bound to `account_id`.
    pub fn send_fn(self: &Arc<Self>, account_id: impl Into<String>) -> SendFn {
        let dispatcher = Arc::clone(self);
        let account_id: Arc<str> = account_id.into().into();
        send_fn(move |message: OutboundMessage| {
            let dispatcher = Arc::clone(&dispatcher);
            let account_id = Arc::clone(&account_id);
            async move { dispatcher.send(&account_id, &message).await }
        })
    }

    /// Shared credential store.
    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    /// Tenant directory.
    pub fn tenants(&self) -> &Arc<dyn TenantDirectory> {
        &self.tenants
    }

    /// Snapshots of every send breaker created so far.
    pub fn breaker_snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut snapshots: Vec<_> = self.breakers.lock().values().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    fn breaker(&self, account_id: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .lock()
            .entry(account_id.to_owned())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(format!("send:{account_id}"), self.circuit.clone(), self.clock.clone()))
            })
            .clone()
    }
}
