//! HTTP client for the messaging platform API.
//!
//! Covers the two calls the send path needs, token issuance and message send.
//! A non-zero `errcode` is an error even when the HTTP status is 200.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use courier_core::{MessageBody, OutboundMessage, SendReceipt, Target};
use reqwest::RequestBuilder;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{info_span, Instrument};

use crate::error::{DeliveryError, Result};

/// Response bodies longer than this are truncated in errors.
const MAX_ERROR_BODY: usize = 512;

/// Platform client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// API root, e.g. `https://qyapi.weixin.qq.com`.
    pub base_url: String,
    /// Timeout for token issuance and sends.
    pub timeout: Duration,
    /// Timeout for health probes.
    pub probe_timeout: Duration,
    /// User agent sent with every request.
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://qyapi.weixin.qq.com".to_string(),
            timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            user_agent: concat!("courier/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Access token as issued by the platform.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenGrant {
    /// Bearer token.
    pub access_token: String,
    /// Lifetime reported by the platform.
    pub expires_in: Duration,
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant").field("expires_in", &self.expires_in).finish_non_exhaustive()
    }
}

/// Platform operations used by the credential store and send path.
#[async_trait]
pub trait PlatformApi: Send + Sync + std::fmt::Debug {
    /// Issues an access token for a corp id and secret.
    async fn issue_token(&self, corp_id: &str, corp_secret: &str) -> Result<TokenGrant>;

    /// Sends `message` as `agent_id` using `access_token`.
    async fn send_message(
        &self,
        access_token: &str,
        agent_id: i64,
        message: &OutboundMessage,
    ) -> Result<SendReceipt>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
    access_token: Option<String>,
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
    msgid: Option<String>,
    #[serde(default)]
    invaliduser: Option<String>,
    #[serde(default)]
    invalidparty: Option<String>,
    #[serde(default)]
    invalidtag: Option<String>,
}

#[derive(Serialize)]
struct SendRequest<'a> {
    #[serde(flatten)]
    target: &'a Target,
    agentid: i64,
    #[serde(flatten)]
    body: &'a MessageBody,
    safe: u8,
}

/// reqwest-backed [`PlatformApi`].
#[derive(Debug, Clone)]
pub struct PlatformClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl PlatformClient {
    /// Builds a client.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the HTTP client cannot be
    /// constructed.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| DeliveryError::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    /// Client settings.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/cgi-bin/{path}", self.config.base_url.trim_end_matches('/'))
    }

    async fn gettoken(&self, corp_id: &str, corp_secret: &str, timeout: Duration) -> Result<TokenGrant> {
        let request = self
            .client
            .get(self.endpoint("gettoken"))
            .query(&[("corpid", corp_id), ("corpsecret", corp_secret)]);

        let response: TokenResponse = execute(request, timeout).await?;
        if response.errcode != 0 {
            return Err(DeliveryError::upstream(response.errcode, response.errmsg));
        }

        let access_token = response
            .access_token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| DeliveryError::invalid_response("gettoken response missing access_token"))?;
        Ok(TokenGrant { access_token, expires_in: Duration::from_secs(response.expires_in.unwrap_or(7200)) })
    }
}

#[async_trait]
impl PlatformApi for PlatformClient {
    async fn issue_token(&self, corp_id: &str, corp_secret: &str) -> Result<TokenGrant> {
        let span = info_span!("issue_token", corp_id = %mask(corp_id));
        self.gettoken(corp_id, corp_secret, self.config.timeout).instrument(span).await
    }

    async fn send_message(
        &self,
        access_token: &str,
        agent_id: i64,
        message: &OutboundMessage,
    ) -> Result<SendReceipt> {
        let span = info_span!("send_message", msg_type = message.body.msg_type(), agent_id);

        async move {
            if message.target.is_empty() {
                return Err(DeliveryError::configuration("message has no recipients"));
            }

            let body = SendRequest {
                target: &message.target,
                agentid: agent_id,
                body: &message.body,
                safe: u8::from(message.safe),
            };
            let request = self
                .client
                .post(self.endpoint("message/send"))
                .query(&[("access_token", access_token)])
                .json(&body);

            let response: SendResponse = execute(request, self.config.timeout).await?;
            if response.errcode != 0 {
                tracing::warn!(errcode = response.errcode, errmsg = %response.errmsg, "platform rejected message");
                return Err(DeliveryError::upstream(response.errcode, response.errmsg));
            }

            let receipt = SendReceipt {
                msg_id: response.msgid,
                invalid_users: split_ids(response.invaliduser),
                invalid_parties: split_ids(response.invalidparty),
                invalid_tags: split_ids(response.invalidtag),
            };
            if !receipt.fully_delivered() {
                tracing::warn!(?receipt, "platform dropped some recipients");
            }
            Ok(receipt)
        }
        .instrument(span)
        .await
    }
}

/// Sends `request` with `timeout` and decodes a JSON body.
async fn execute<T: DeserializeOwned>(request: RequestBuilder, timeout: Duration) -> Result<T> {
    let started = Instant::now();

    let response = request.timeout(timeout).send().await.map_err(|e| {
        tracing::warn!(duration_ms = %started.elapsed().as_millis(), error = %e, "platform request failed");
        if e.is_timeout() {
            DeliveryError::timeout(timeout)
        } else {
            DeliveryError::network(e.to_string())
        }
    })?;

    let status = response.status();
    let bytes = response.bytes().await.map_err(|e| {
        if e.is_timeout() {
            DeliveryError::timeout(timeout)
        } else {
            DeliveryError::network(format!("failed to read response body: {e}"))
        }
    })?;
    tracing::debug!(status = status.as_u16(), duration_ms = %started.elapsed().as_millis(), "platform responded");

    if !status.is_success() {
        let text = String::from_utf8_lossy(&bytes[..bytes.len().min(MAX_ERROR_BODY)]).into_owned();
        return Err(DeliveryError::http_status(status.as_u16(), text));
    }

    serde_json::from_slice(&bytes).map_err(|e| DeliveryError::invalid_response(e.to_string()))
}

fn split_ids(joined: Option<String>) -> Vec<String> {
    joined
        .map(|ids| ids.split('|').filter(|id| !id.is_empty()).map(str::to_owned).collect())
        .unwrap_or_default()
}

/// First eight characters of a corp id, for logs.
pub fn mask(corp_id: &str) -> String {
    let prefix: String = corp_id.chars().take(8).collect();
    format!("{prefix}...")
}
