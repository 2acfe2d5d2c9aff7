//! Service configuration.
//!
//! Loaded in priority order (highest first):
//! 1. Environment variables prefixed `COURIER_`, nested keys split on `__`
//!    (`COURIER_TENANTS__DEFAULT__CORP_ID`)
//! 2. `courier.toml` in the working directory, if present
//! 3. Built-in defaults
//!
//! # Example
//!
//! ```toml
//! default_tenant = "default"
//!
//! [tenants.default]
//! corp_id = "ww0123456789abcdef"
//! corp_secret = "..."
//! agent_id = 1000002
//! token = "callback-token"
//! encoding_aes_key = "abcdefghijklmnopqrstuvwxyz0123456789ABCDEFG"
//! ```

use std::{collections::BTreeMap, net::SocketAddr, time::Duration};

use anyhow::{Context, Result};
use courier_core::{StaticTenantDirectory, TenantConfig};
use courier_delivery::{
    CircuitConfig, ClientConfig, CredentialConfig, QueueConfig, RateLimitConfig, RetryPolicy,
};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "courier.toml";
const ENV_PREFIX: &str = "COURIER_";
const AES_KEY_LEN: usize = 43;

/// One tenant as written in configuration; the account id is the map key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantSettings {
    /// Platform corp id.
    pub corp_id: String,
    /// Application secret.
    pub corp_secret: String,
    /// Application agent id.
    pub agent_id: i64,
    /// Callback signing token.
    pub token: String,
    /// Callback encryption key; omit to accept plaintext callbacks.
    #[serde(default)]
    pub encoding_aes_key: Option<String>,
}

impl std::fmt::Debug for TenantSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantSettings")
            .field("corp_id", &self.corp_id)
            .field("agent_id", &self.agent_id)
            .field("encryption", &self.encoding_aes_key.is_some())
            .finish_non_exhaustive()
    }
}

/// Complete service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Server
    /// HTTP bind address.
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    /// Per-request timeout for inbound HTTP, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Encrypt callback acknowledgements for tenants with an AES key.
    #[serde(default)]
    pub encrypt_acknowledgements: bool,

    // Platform client
    /// Platform API root.
    #[serde(default = "default_platform_base_url")]
    pub platform_base_url: String,
    /// Timeout for token issuance and sends, in seconds.
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
    /// Timeout for health probes, in seconds.
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    // Credentials
    /// Seconds subtracted from each token's lifetime; at least 60.
    #[serde(default = "default_token_safety_margin_secs")]
    pub token_safety_margin_secs: u64,

    // Rate limiting
    /// Sliding window length, in milliseconds.
    #[serde(default = "default_rate_limit_window_ms")]
    pub rate_limit_window_ms: u64,
    /// Token requests admitted per window and tenant.
    #[serde(default = "default_rate_limit_max_requests")]
    pub rate_limit_max_requests: u32,

    // Circuit breaker
    /// Failures that open a breaker.
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,
    /// Cooldown before a trial call, in milliseconds.
    #[serde(default = "default_circuit_reset_timeout_ms")]
    pub circuit_reset_timeout_ms: u64,
    /// Half-open successes that close a breaker.
    #[serde(default = "default_circuit_half_open_success_threshold")]
    pub circuit_half_open_success_threshold: u32,

    // Queue
    /// Concurrent send tasks.
    #[serde(default = "default_queue_max_concurrent")]
    pub queue_max_concurrent: usize,
    /// Retries per task after the first attempt.
    #[serde(default = "default_queue_max_retries")]
    pub queue_max_retries: u32,
    /// Backoff unit, in milliseconds.
    #[serde(default = "default_queue_base_delay_ms")]
    pub queue_base_delay_ms: u64,
    /// Backoff cap, in milliseconds.
    #[serde(default = "default_queue_max_delay_ms")]
    pub queue_max_delay_ms: u64,

    // Health
    /// Interval between background health checks, in seconds.
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,

    // Tenants
    /// Account id served by `/callback` without an account segment.
    #[serde(default = "default_tenant")]
    pub default_tenant: String,
    /// Tenants keyed by account id.
    #[serde(default)]
    pub tenants: BTreeMap<String, TenantSettings>,
}

impl Config {
    /// Loads from defaults, `courier.toml`, and the environment, then
    /// validates.
    pub fn load() -> Result<Self> {
        Self::from_figment(&Self::figment())
    }

    /// The layered provider stack used by [`load`](Self::load).
    pub fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Extracts and validates configuration from `figment`.
    pub fn from_figment(figment: &Figment) -> Result<Self> {
        let config: Self = figment.extract().context("failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Parsed bind address.
    pub fn parse_server_addr(&self) -> Result<SocketAddr> {
        self.server_addr.parse().with_context(|| format!("invalid server_addr {:?}", self.server_addr))
    }

    /// Inbound request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Background health check interval.
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    /// Platform client settings.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            base_url: self.platform_base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(self.send_timeout_secs),
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
            ..ClientConfig::default()
        }
    }

    /// Breaker settings shared by token and send breakers.
    pub fn to_circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.circuit_failure_threshold,
            reset_timeout: Duration::from_millis(self.circuit_reset_timeout_ms),
            success_threshold: self.circuit_half_open_success_threshold,
            ..CircuitConfig::default()
        }
    }

    /// Token rate limit.
    pub fn to_rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            window: Duration::from_millis(self.rate_limit_window_ms),
            max_requests: self.rate_limit_max_requests,
        }
    }

    /// Credential cache settings.
    pub fn to_credential_config(&self) -> CredentialConfig {
        CredentialConfig {
            safety_margin: Duration::from_secs(self.token_safety_margin_secs),
            circuit: self.to_circuit_config(),
        }
    }

    /// Queue backoff.
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.queue_max_retries,
            base_delay: Duration::from_millis(self.queue_base_delay_ms),
            max_delay: Duration::from_millis(self.queue_max_delay_ms),
            ..RetryPolicy::default()
        }
    }

    /// Queue settings.
    pub fn to_queue_config(&self) -> QueueConfig {
        QueueConfig { max_concurrent: self.queue_max_concurrent, retry: self.to_retry_policy() }
    }

    /// Tenants as domain configuration, in account id order.
    pub fn tenant_configs(&self) -> Vec<TenantConfig> {
        self.tenants
            .iter()
            .map(|(account_id, t)| TenantConfig {
                account_id: account_id.clone(),
                corp_id: t.corp_id.clone(),
                corp_secret: t.corp_secret.clone(),
                agent_id: t.agent_id,
                token: t.token.clone(),
                encoding_aes_key: t.encoding_aes_key.clone().filter(|k| !k.is_empty()),
            })
            .collect()
    }

    /// In-memory tenant directory over the configured tenants.
    pub fn tenant_directory(&self) -> StaticTenantDirectory {
        StaticTenantDirectory::new(self.tenant_configs())
    }

    /// Rejects configurations the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.parse_server_addr()?;

        if self.tenants.is_empty() {
            anyhow::bail!("at least one tenant must be configured");
        }
        if !self.tenants.contains_key(&self.default_tenant) {
            anyhow::bail!("default_tenant {:?} is not a configured tenant", self.default_tenant);
        }
        for (account_id, tenant) in &self.tenants {
            if tenant.corp_id.is_empty() || tenant.corp_secret.is_empty() {
                anyhow::bail!("tenant {account_id:?} needs corp_id and corp_secret");
            }
            if let Some(key) = tenant.encoding_aes_key.as_deref().filter(|k| !k.is_empty()) {
                if key.len() != AES_KEY_LEN {
                    anyhow::bail!(
                        "tenant {account_id:?} encoding_aes_key must be {AES_KEY_LEN} characters, got {}",
                        key.len()
                    );
                }
            }
        }

        if self.circuit_failure_threshold == 0 || self.circuit_half_open_success_threshold == 0 {
            anyhow::bail!("circuit thresholds must be greater than 0");
        }
        if self.queue_max_concurrent == 0 {
            anyhow::bail!("queue_max_concurrent must be greater than 0");
        }
        if self.send_timeout_secs == 0 || self.probe_timeout_secs == 0 {
            anyhow::bail!("platform timeouts must be greater than 0");
        }
        if self.rate_limit_window_ms == 0 {
            anyhow::bail!("rate_limit_window_ms must be greater than 0");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            request_timeout_secs: default_request_timeout_secs(),
            encrypt_acknowledgements: false,
            platform_base_url: default_platform_base_url(),
            send_timeout_secs: default_send_timeout_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            token_safety_margin_secs: default_token_safety_margin_secs(),
            rate_limit_window_ms: default_rate_limit_window_ms(),
            rate_limit_max_requests: default_rate_limit_max_requests(),
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_reset_timeout_ms: default_circuit_reset_timeout_ms(),
            circuit_half_open_success_threshold: default_circuit_half_open_success_threshold(),
            queue_max_concurrent: default_queue_max_concurrent(),
            queue_max_retries: default_queue_max_retries(),
            queue_base_delay_ms: default_queue_base_delay_ms(),
            queue_max_delay_ms: default_queue_max_delay_ms(),
            health_check_interval_secs: default_health_check_interval_secs(),
            default_tenant: default_tenant(),
            tenants: BTreeMap::new(),
        }
    }
}

fn default_server_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_platform_base_url() -> String {
    "https://qyapi.weixin.qq.com".to_string()
}

fn default_send_timeout_secs() -> u64 {
    10
}

fn default_probe_timeout_secs() -> u64 {
    5
}

fn default_token_safety_margin_secs() -> u64 {
    60
}

fn default_rate_limit_window_ms() -> u64 {
    60_000
}

fn default_rate_limit_max_requests() -> u32 {
    60
}

fn default_circuit_failure_threshold() -> u32 {
    5
}

fn default_circuit_reset_timeout_ms() -> u64 {
    30_000
}

fn default_circuit_half_open_success_threshold() -> u32 {
    3
}

fn default_queue_max_concurrent() -> usize {
    3
}

fn default_queue_max_retries() -> u32 {
    3
}

fn default_queue_base_delay_ms() -> u64 {
    1000
}

fn default_queue_max_delay_ms() -> u64 {
    60_000
}

fn default_health_check_interval_secs() -> u64 {
    30
}

fn default_tenant() -> String {
    "default".to_string()
}
