//! Outbound delivery for the courier gateway.
//!
//! Everything between "the application wants to send a message" and "the
//! platform accepted it" lives here, with the resilience needed to survive a
//! flaky upstream:
//!
//! 1. **Credentials** - per-tenant access tokens cached until shortly before
//!    expiry, refreshed single-flight
//! 2. **Rate limiting** - sliding-window admission on token issuance
//! 3. **Circuit breaking** - per-resource fail-fast once the platform keeps
//!    failing
//! 4. **Queueing** - bounded concurrency, exponential backoff, dead letters
//! 5. **Health** - probes that fold the above into one verdict
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use courier_core::{OutboundMessage, RealClock, StaticTenantDirectory, Target};
//! use courier_delivery::{
//!     CircuitConfig, ClientConfig, CredentialConfig, CredentialStore, DeliveryQueue, Dispatcher,
//!     PlatformClient, QueueConfig, RateLimitConfig, RateLimiter,
//! };
//!
//! # fn example(tenants: StaticTenantDirectory) -> courier_delivery::Result<()> {
//! let clock = RealClock::shared();
//! let api = Arc::new(PlatformClient::new(ClientConfig::default())?);
//! let limiter = Arc::new(RateLimiter::new(RateLimitConfig::default(), clock.clone()));
//! let credentials = CredentialStore::new(api.clone(), limiter, clock.clone(), CredentialConfig::default());
//! let dispatcher =
//!     Arc::new(Dispatcher::new(Arc::new(tenants), credentials, api, clock.clone(), CircuitConfig::default()));
//!
//! let queue = DeliveryQueue::new(QueueConfig::default(), clock);
//! queue.enqueue(OutboundMessage::text(Target::user("zhangsan"), "hello"), dispatcher.send_fn("default"));
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod circuit;
pub mod client;
pub mod credentials;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod queue;
pub mod rate_limit;
pub mod retry;

pub use circuit::{CircuitBreaker, CircuitConfig, CircuitSnapshot, CircuitState};
pub use client::{ClientConfig, PlatformApi, PlatformClient, TokenGrant};
pub use credentials::{CredentialConfig, CredentialStore};
pub use dispatcher::Dispatcher;
pub use error::{DeliveryError, ErrorCategory, Result};
pub use health::{
    CircuitProbe, ErrorRateProbe, HealthMonitor, HealthProbe, HealthReport, HealthStatus, ProbeResult, QueueProbe,
    TokenProbe,
};
pub use queue::{send_fn, DeliveryQueue, QueueConfig, QueueStats, QueueStatus, SendFn};
pub use rate_limit::{RateDecision, RateLimitConfig, RateLimiter};
pub use retry::{RetryDecision, RetryPolicy};
