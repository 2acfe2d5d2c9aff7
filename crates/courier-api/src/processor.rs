//! Callback pipeline: verify, decrypt, parse, route, acknowledge.
//!
//! Verification and decryption failures end the request with an error
//! status. Once a message has been routed the platform always gets a 200,
//! whatever the handler did; its retry schedule depends on that.

use std::{fmt, sync::Arc};

use courier_core::{
    message::{json_fields, xml_fields, Fields},
    CoreError, ParsedMessage, SharedClock, TenantConfig, TenantDirectory,
};
use courier_delivery::{DeliveryQueue, Dispatcher};
use rand::{distr::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::{
    crypto::{PayloadCipher, SignatureVerifier},
    error::{CallbackError, Result},
    router::{CallbackContext, MessageRouter, RouteOutcome},
};

/// Query parameters the platform attaches to callbacks.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackQuery {
    /// Signature over token, timestamp, nonce and payload.
    #[serde(alias = "signature")]
    pub msg_signature: Option<String>,
    /// Unix timestamp as sent.
    pub timestamp: Option<String>,
    /// Request nonce.
    pub nonce: Option<String>,
    /// URL-verification challenge (GET only).
    pub echostr: Option<String>,
}

/// Body returned for an accepted message callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Acknowledgement {
    /// `{"errcode":0,"errmsg":"ok"}`
    Plain {
        /// Always `0`
        errcode: i64,
        /// Always `ok`
        errmsg: String,
    },
    /// Encrypted acknowledgement with its own signature.
    Encrypted {
        /// Base64 ciphertext of the plain acknowledgement
        encrypt: String,
        /// Signature over token, timestamp, nonce and `encrypt`
        msg_signature: String,
        /// Unix seconds when the acknowledgement was produced
        timestamp: String,
        /// Nonce echoed from the request
        nonce: String,
    },
}

impl Acknowledgement {
    /// Plain success acknowledgement.
    pub fn ok() -> Self {
        Self::Plain { errcode: 0, errmsg: "ok".to_owned() }
    }
}

/// Queue and send path used for handler replies.
#[derive(Debug, Clone)]
struct ReplySink {
    dispatcher: Arc<Dispatcher>,
    queue: DeliveryQueue,
}

/// Processes platform callbacks for every configured tenant.
pub struct CallbackProcessor {
    tenants: Arc<dyn TenantDirectory>,
    default_tenant: String,
    router: Arc<MessageRouter>,
    clock: SharedClock,
    replies: Option<ReplySink>,
    encrypt_acknowledgements: bool,
}

impl fmt::Debug for CallbackProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackProcessor")
            .field("default_tenant", &self.default_tenant)
            .field("router", &self.router)
            .field("replies", &self.replies.is_some())
            .field("encrypt_acknowledgements", &self.encrypt_acknowledgements)
            .finish_non_exhaustive()
    }
}

impl CallbackProcessor {
    /// Creates a processor that resolves tenants from `tenants` and routes
    /// through `router`. Replies are dropped until [`Self::with_replies`].
    pub fn new(
        tenants: Arc<dyn TenantDirectory>,
        default_tenant: impl Into<String>,
        router: Arc<MessageRouter>,
        clock: SharedClock,
    ) -> Self {
        Self {
            tenants,
            default_tenant: default_tenant.into(),
            router,
            clock,
            replies: None,
            encrypt_acknowledgements: false,
        }
    }

    /// Queues handler replies through `dispatcher`.
    #[must_use]
    pub fn with_replies(mut self, dispatcher: Arc<Dispatcher>, queue: DeliveryQueue) -> Self {
        self.replies = Some(ReplySink { dispatcher, queue });
        self
    }

    /// Encrypts acknowledgements for tenants with an encoding key.
    #[must_use]
    pub fn encrypt_acknowledgements(mut self, enabled: bool) -> Self {
        self.encrypt_acknowledgements = enabled;
        self
    }

    /// Message router.
    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    /// Tenant for `account_id`, or the default tenant when absent.
    ///
    /// # Errors
    ///
    /// [`CallbackError::UnknownTenant`] when nothing is configured under the id.
    pub fn tenant(&self, account_id: Option<&str>) -> Result<TenantConfig> {
        let account_id = account_id.unwrap_or(&self.default_tenant);
        self.tenants.resolve(account_id).ok_or_else(|| CallbackError::UnknownTenant(account_id.to_owned()))
    }

    /// URL verification (GET).
    ///
    /// Returns the plaintext challenge: decrypted when the tenant has an
    /// encoding key, echoed verbatim otherwise.
    ///
    /// # Errors
    ///
    /// 400 for missing parameters or an undecryptable challenge, 401 for a
    /// signature mismatch. The challenge is never decrypted before the
    /// signature has been checked.
    #[instrument(name = "verify_url", skip_all, fields(account = account_id.unwrap_or("default")))]
    pub fn verify_url(&self, account_id: Option<&str>, query: &CallbackQuery) -> Result<String> {
        let tenant = self.tenant(account_id)?;
        let signature = required(query.msg_signature.as_deref(), "msg_signature")?;
        let timestamp = required(query.timestamp.as_deref(), "timestamp")?;
        let nonce = required(query.nonce.as_deref(), "nonce")?;
        let echostr = required(query.echostr.as_deref(), "echostr")?;

        let verifier = SignatureVerifier::new(&tenant.token);
        if !verifier.verify_echo(timestamp, nonce, signature, echostr) {
            return Err(CoreError::SignatureMismatch.into());
        }
        debug!(stage = "verified", "url verification signature accepted");

        match cipher_for(&tenant)? {
            Some(cipher) => Ok(cipher.decrypt_to_string(echostr)?),
            None => Ok(echostr.to_owned()),
        }
    }

    /// Message callback (POST).
    ///
    /// The signature is checked only when `msg_signature`, `timestamp` and
    /// `nonce` are all present.
    ///
    /// # Errors
    ///
    /// 400 for a malformed body, an undecryptable payload, or an
    /// unparseable message; 401 for a signature mismatch. Handler failures
    /// and panics are logged and still acknowledged.
    #[instrument(name = "handle_message", skip_all, fields(account = account_id.unwrap_or("default"), msg_type = tracing::field::Empty))]
    pub async fn handle_message(
        &self,
        account_id: Option<&str>,
        query: &CallbackQuery,
        body: &[u8],
    ) -> Result<Acknowledgement> {
        let tenant = self.tenant(account_id)?;
        let fields = envelope_fields(body)?;
        let encrypted = fields.get("Encrypt").or_else(|| fields.get("encrypt")).cloned();

        let verifier = SignatureVerifier::new(&tenant.token);
        let nonce = present(query.nonce.as_deref());
        match (present(query.msg_signature.as_deref()), present(query.timestamp.as_deref()), nonce) {
            (Some(signature), Some(timestamp), Some(nonce)) => {
                if !verifier.verify_message(timestamp, nonce, signature, encrypted.as_deref()) {
                    return Err(CoreError::SignatureMismatch.into());
                }
                debug!(stage = "verified", encrypted = encrypted.is_some(), "message signature accepted");
            },
            _ => {
                debug!(stage = "unsigned", encrypted = encrypted.is_some(), "no signature parameters, skipping verification");
            },
        }

        let cipher = cipher_for(&tenant)?;
        let message = match (encrypted.as_deref(), &cipher) {
            (Some(ciphertext), Some(cipher)) => {
                let plaintext = cipher.decrypt_to_string(ciphertext)?;
                debug!(stage = "decrypted", "payload decrypted");
                ParsedMessage::parse(&plaintext)?
            },
            (Some(_), None) => {
                return Err(CoreError::Configuration(format!(
                    "encrypted callback for {} but no encoding_aes_key is configured",
                    tenant.account_id
                ))
                .into());
            },
            (None, _) => ParsedMessage::from_fields(fields)?,
        };
        tracing::Span::current().record("msg_type", message.msg_type.as_str());
        debug!(stage = "parsed", from_user = %message.from_user, "message parsed");

        self.dispatch(&tenant, message).await;

        match &cipher {
            Some(cipher) if self.encrypt_acknowledgements => {
                let nonce = nonce.map_or_else(fresh_nonce, str::to_owned);
                self.encrypted_ack(cipher, &verifier, nonce)
            },
            _ => Ok(Acknowledgement::ok()),
        }
    }

    async fn dispatch(&self, tenant: &TenantConfig, message: ParsedMessage) {
        let sender = message.from_user.clone();
        let context = CallbackContext { account_id: tenant.account_id.clone() };

        match self.router.route(message, context).await {
            RouteOutcome::Handled { route, reply } => {
                debug!(stage = "routed", %route, "handler completed");
                if let Some(mut reply) = reply {
                    if reply.target.is_empty() {
                        reply.target = courier_core::Target::user(&sender);
                    }
                    self.enqueue_reply(tenant, reply);
                }
            },
            RouteOutcome::Failed { route, error } => {
                warn!(%route, error = %error, "message handler failed");
            },
            RouteOutcome::Filtered | RouteOutcome::Unhandled => {},
        }
    }

    fn enqueue_reply(&self, tenant: &TenantConfig, reply: courier_core::OutboundMessage) {
        let Some(sink) = &self.replies else {
            warn!("handler returned a reply but no delivery queue is attached");
            return;
        };
        let send = sink.dispatcher.send_fn(tenant.account_id.clone());
        let task_id = sink.queue.enqueue(reply, send);
        info!(%task_id, "reply queued");
    }

    fn encrypted_ack(&self, cipher: &PayloadCipher, verifier: &SignatureVerifier, nonce: String) -> Result<Acknowledgement> {
        let plain = serde_json::to_vec(&Acknowledgement::ok()).map_err(|e| CoreError::Internal(e.to_string()))?;
        let encrypt = cipher.encrypt(&plain)?;
        let timestamp = self.clock.now_utc().timestamp().to_string();
        let msg_signature = verifier.sign(&timestamp, &nonce, Some(&encrypt));
        Ok(Acknowledgement::Encrypted { encrypt, msg_signature, timestamp, nonce })
    }
}

fn required<'a>(value: Option<&'a str>, name: &'static str) -> Result<&'a str> {
    present(value).ok_or(CallbackError::MissingParameter(name))
}

fn present(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// Nonce for acknowledgements of unsigned callbacks.
fn fresh_nonce() -> String {
    rand::rng().sample_iter(Alphanumeric).take(16).map(char::from).collect()
}

fn cipher_for(tenant: &TenantConfig) -> Result<Option<PayloadCipher>> {
    match tenant.encoding_aes_key.as_deref() {
        Some(key) if !key.is_empty() => Ok(Some(PayloadCipher::new(key)?)),
        _ => Ok(None),
    }
}

/// Top-level fields of a JSON or XML callback body.
pub fn envelope_fields(body: &[u8]) -> Result<Fields> {
    let text = std::str::from_utf8(body).map_err(|_| CallbackError::MalformedBody("body is not UTF-8".into()))?;
    let text = text.trim();
    if text.is_empty() {
        return Err(CallbackError::MalformedBody("empty body".into()));
    }

    let parsed = if text.starts_with('<') { xml_fields(text) } else { json_fields(text) };
    parsed.map_err(|e| CallbackError::MalformedBody(e.to_string()))
}
