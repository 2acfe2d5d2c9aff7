//! Builds callbacks the way the platform sends them.

use courier_api::{PayloadCipher, SignatureVerifier};
use courier_core::TenantConfig;

/// A ready-to-send callback request.
#[derive(Debug, Clone)]
pub struct SignedCallback {
    /// Query string without the leading `?`.
    pub query: String,
    /// Request body; empty for URL verification.
    pub body: String,
}

impl SignedCallback {
    /// `path?query`.
    pub fn uri(&self, path: &str) -> String {
        format!("{path}?{}", self.query)
    }
}

/// Signs and, for encrypted tenants, encrypts callback payloads.
#[derive(Debug, Clone)]
pub struct CallbackBuilder {
    verifier: SignatureVerifier,
    cipher: Option<PayloadCipher>,
    timestamp: String,
    nonce: String,
}

impl CallbackBuilder {
    /// Builder using `tenant`'s token and encoding key.
    ///
    /// # Panics
    ///
    /// If the tenant's encoding key is invalid.
    pub fn for_tenant(tenant: &TenantConfig) -> Self {
        let cipher = tenant
            .encoding_aes_key
            .as_deref()
            .map(|key| PayloadCipher::new(key).expect("fixture encoding key must be valid"));
        Self {
            verifier: SignatureVerifier::new(&tenant.token),
            cipher,
            timestamp: "1700000000".to_owned(),
            nonce: "fixture-nonce".to_owned(),
        }
    }

    /// Overrides the timestamp.
    #[must_use]
    pub fn timestamp(mut self, timestamp: &str) -> Self {
        self.timestamp = timestamp.to_owned();
        self
    }

    /// Overrides the nonce.
    #[must_use]
    pub fn nonce(mut self, nonce: &str) -> Self {
        self.nonce = nonce.to_owned();
        self
    }

    /// GET URL verification carrying `challenge`.
    pub fn url_verification(&self, challenge: &str) -> SignedCallback {
        let echostr = self.seal(challenge);
        let signature = self.verifier.sign(&self.timestamp, &self.nonce, Some(&echostr));
        SignedCallback {
            query: self.query(&signature, Some(&echostr)),
            body: String::new(),
        }
    }

    /// POST text message from `from_user`.
    pub fn text_message(&self, from_user: &str, content: &str) -> SignedCallback {
        self.message(&text_message_xml(from_user, content))
    }

    /// POST carrying `plaintext` as the message: encrypted into a JSON
    /// envelope for encrypted tenants, sent as-is otherwise.
    pub fn message(&self, plaintext: &str) -> SignedCallback {
        match &self.cipher {
            Some(_) => {
                let encrypt = self.seal(plaintext);
                let signature = self.verifier.sign(&self.timestamp, &self.nonce, Some(&encrypt));
                SignedCallback {
                    query: self.query(&signature, None),
                    body: serde_json::json!({ "encrypt": encrypt }).to_string(),
                }
            },
            None => {
                let signature = self.verifier.sign(&self.timestamp, &self.nonce, None);
                SignedCallback { query: self.query(&signature, None), body: plaintext.to_owned() }
            },
        }
    }

    /// Same as [`Self::message`] but signed with the wrong token.
    pub fn forged_message(&self, plaintext: &str) -> SignedCallback {
        let mut callback = self.message(plaintext);
        let forged = SignatureVerifier::new("not-the-token").sign(&self.timestamp, &self.nonce, None);
        callback.query = self.query(&forged, None);
        callback
    }

    fn seal(&self, plaintext: &str) -> String {
        match &self.cipher {
            Some(cipher) => cipher.encrypt(plaintext.as_bytes()).expect("fixture encryption must succeed"),
            None => plaintext.to_owned(),
        }
    }

    fn query(&self, signature: &str, echostr: Option<&str>) -> String {
        let mut query = format!("msg_signature={signature}&timestamp={}&nonce={}", self.timestamp, self.nonce);
        if let Some(echostr) = echostr {
            query.push_str("&echostr=");
            query.push_str(&percent_encode(echostr));
        }
        query
    }
}

/// Platform-style XML for a text message.
pub fn text_message_xml(from_user: &str, content: &str) -> String {
    format!(
        "<xml><ToUserName><![CDATA[corp]]></ToUserName><FromUserName><![CDATA[{from_user}]]></FromUserName>\
         <CreateTime>1700000000</CreateTime><MsgType><![CDATA[text]]></MsgType>\
         <Content><![CDATA[{content}]]></Content><MsgId>10001</MsgId><AgentID>1000002</AgentID></xml>"
    )
}

/// Escapes the base64 characters that are not query-safe.
fn percent_encode(value: &str) -> String {
    value.replace('+', "%2B").replace('/', "%2F").replace('=', "%3D")
}
