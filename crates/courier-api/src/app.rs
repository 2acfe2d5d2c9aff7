//! Component wiring from configuration.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use courier_core::{SharedClock, TenantDirectory};
use courier_delivery::{
    CircuitProbe, CredentialStore, DeliveryQueue, Dispatcher, ErrorRateProbe, HealthMonitor, PlatformApi,
    PlatformClient, QueueProbe, RateLimiter, TokenProbe,
};

use crate::{config::Config, processor::CallbackProcessor, router::MessageRouter, server::create_router, AppState};

/// Every long-lived component of a running gateway.
#[derive(Debug, Clone)]
pub struct Services {
    /// State shared with the HTTP handlers
    pub state: AppState,
    /// Send path for application-initiated messages
    pub dispatcher: Arc<Dispatcher>,
    /// Token cache shared by sends and probes
    pub credentials: CredentialStore,
    config: Config,
}

impl Services {
    /// Builds the platform client, token store, send path, queue, health
    /// probes, and callback processor described by `config`.
    ///
    /// # Errors
    ///
    /// Fails when the HTTP client cannot be constructed.
    pub fn build(config: &Config, router: MessageRouter, clock: SharedClock) -> Result<Self> {
        let client = PlatformClient::new(config.to_client_config()).context("failed to build platform client")?;
        Ok(Self::with_api(config, router, clock, Arc::new(client)))
    }

    /// Same as [`Self::build`] with a caller-supplied platform API.
    pub fn with_api(config: &Config, router: MessageRouter, clock: SharedClock, api: Arc<dyn PlatformApi>) -> Self {
        let tenants: Arc<dyn TenantDirectory> = Arc::new(config.tenant_directory());
        let limiter = Arc::new(RateLimiter::new(config.to_rate_limit_config(), clock.clone()));
        let credentials =
            CredentialStore::new(Arc::clone(&api), limiter, clock.clone(), config.to_credential_config());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&tenants),
            credentials.clone(),
            api,
            clock.clone(),
            config.to_circuit_config(),
        ));

        let error_rate = Arc::new(ErrorRateProbe::new());
        let queue = DeliveryQueue::with_observer(config.to_queue_config(), clock.clone(), error_rate.clone());

        let breakers = {
            let credentials = credentials.clone();
            let dispatcher = Arc::clone(&dispatcher);
            CircuitProbe::new(move || {
                let mut snapshots = credentials.breaker_snapshots();
                snapshots.extend(dispatcher.breaker_snapshots());
                snapshots
            })
        };
        let health = config
            .tenant_configs()
            .into_iter()
            .fold(HealthMonitor::new(clock.clone()), |monitor, tenant| {
                monitor.with_probe(Arc::new(TokenProbe::new(tenant, credentials.clone())))
            })
            .with_probe(Arc::new(breakers))
            .with_probe(Arc::new(QueueProbe::new(queue.clone())))
            .with_probe(error_rate)
            .with_probe_timeout(config.to_client_config().probe_timeout);

        let processor = CallbackProcessor::new(tenants, config.default_tenant.clone(), Arc::new(router), clock.clone())
            .with_replies(Arc::clone(&dispatcher), queue.clone())
            .encrypt_acknowledgements(config.encrypt_acknowledgements);

        Self {
            state: AppState { processor: Arc::new(processor), queue, health: Arc::new(health), clock },
            dispatcher,
            credentials,
            config: config.clone(),
        }
    }

    /// HTTP router over [`Self::state`].
    pub fn http_router(&self) -> Router {
        create_router(self.state.clone(), self.config.request_timeout())
    }

    /// Delivery queue.
    pub fn queue(&self) -> &DeliveryQueue {
        &self.state.queue
    }

    /// Health monitor.
    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.state.health
    }
}
