//! Deterministic tenant fixtures.

use courier_core::{StaticTenantDirectory, TenantConfig};

/// Callback signing token used by every fixture tenant.
pub const TEST_TOKEN: &str = "test-callback-token";

/// 43-character encoding key used by encrypted fixture tenants.
pub const TEST_AES_KEY: &str = "abcdefghijklmnopqrstuvwxyz0123456789ABCDEFG";

/// Builder for [`TenantConfig`] with working defaults.
#[derive(Debug, Clone)]
pub struct TenantBuilder {
    tenant: TenantConfig,
}

impl TenantBuilder {
    /// Encrypted tenant under `account_id`.
    pub fn new(account_id: &str) -> Self {
        Self {
            tenant: TenantConfig {
                account_id: account_id.to_owned(),
                corp_id: format!("ww{account_id}0123456789"),
                corp_secret: format!("{account_id}-secret"),
                agent_id: 1_000_002,
                token: TEST_TOKEN.to_owned(),
                encoding_aes_key: Some(TEST_AES_KEY.to_owned()),
            },
        }
    }

    /// Sets the corp id.
    #[must_use]
    pub fn corp_id(mut self, corp_id: &str) -> Self {
        self.tenant.corp_id = corp_id.to_owned();
        self
    }

    /// Sets the corp secret.
    #[must_use]
    pub fn corp_secret(mut self, secret: &str) -> Self {
        self.tenant.corp_secret = secret.to_owned();
        self
    }

    /// Sets the agent id.
    #[must_use]
    pub fn agent_id(mut self, agent_id: i64) -> Self {
        self.tenant.agent_id = agent_id;
        self
    }

    /// Disables callback encryption.
    #[must_use]
    pub fn plain(mut self) -> Self {
        self.tenant.encoding_aes_key = None;
        self
    }

    /// Finishes the tenant.
    pub fn build(self) -> TenantConfig {
        self.tenant
    }
}

/// Directory holding `tenants`.
pub fn directory(tenants: impl IntoIterator<Item = TenantConfig>) -> StaticTenantDirectory {
    StaticTenantDirectory::new(tenants)
}

/// Service configuration serving `tenants` against `platform_base_url`, with
/// short retry delays; the first tenant is the default.
pub fn config(platform_base_url: &str, tenants: &[TenantConfig]) -> courier_api::Config {
    let settings = tenants
        .iter()
        .map(|t| {
            let settings = courier_api::TenantSettings {
                corp_id: t.corp_id.clone(),
                corp_secret: t.corp_secret.clone(),
                agent_id: t.agent_id,
                token: t.token.clone(),
                encoding_aes_key: t.encoding_aes_key.clone(),
            };
            (t.account_id.clone(), settings)
        })
        .collect();

    courier_api::Config {
        platform_base_url: platform_base_url.to_owned(),
        send_timeout_secs: 2,
        probe_timeout_secs: 1,
        queue_base_delay_ms: 10,
        queue_max_delay_ms: 100,
        default_tenant: tenants.first().map(|t| t.account_id.clone()).unwrap_or_default(),
        tenants: settings,
        ..courier_api::Config::default()
    }
}
