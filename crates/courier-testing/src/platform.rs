//! wiremock stand-in for the platform API.

use std::time::Duration;

use courier_delivery::ClientConfig;
use serde_json::{json, Value};
use wiremock::{
    matchers::{method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

/// Mock platform serving `/cgi-bin/gettoken` and `/cgi-bin/message/send`.
pub struct MockPlatform {
    server: MockServer,
}

impl MockPlatform {
    /// Starts a server on a random port with nothing mounted.
    pub async fn start() -> Self {
        Self { server: MockServer::start().await }
    }

    /// Base URL of the server.
    pub fn uri(&self) -> String {
        self.server.uri()
    }

    /// Client settings pointing at this server with short timeouts.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            base_url: self.uri(),
            timeout: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(1),
            ..ClientConfig::default()
        }
    }

    /// Issues `token` for `corp_id`; verified to be hit exactly `expect` times.
    pub async fn token(&self, corp_id: &str, token: &str, expect: u64) {
        Mock::given(method("GET"))
            .and(path("/cgi-bin/gettoken"))
            .and(query_param("corpid", corp_id))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errcode": 0, "errmsg": "ok", "access_token": token, "expires_in": 7200
            })))
            .expect(expect)
            .mount(&self.server)
            .await;
    }

    /// Token issuance answers with `delay` before responding.
    pub async fn slow_token(&self, token: &str, delay: Duration, expect: u64) {
        Mock::given(method("GET"))
            .and(path("/cgi-bin/gettoken"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({
                        "errcode": 0, "errmsg": "ok", "access_token": token, "expires_in": 7200
                    }))
                    .set_delay(delay),
            )
            .expect(expect)
            .mount(&self.server)
            .await;
    }

    /// Accepts sends made with `token`.
    pub async fn accept_sends(&self, token: &str, expect: u64) {
        Mock::given(method("POST"))
            .and(path("/cgi-bin/message/send"))
            .and(query_param("access_token", token))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errcode": 0, "errmsg": "ok", "msgid": "msg-1"
            })))
            .expect(expect)
            .mount(&self.server)
            .await;
    }

    /// Rejects every send with a platform errcode.
    pub async fn reject_sends(&self, errcode: i64, errmsg: &str) {
        Mock::given(method("POST"))
            .and(path("/cgi-bin/message/send"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "errcode": errcode, "errmsg": errmsg })))
            .mount(&self.server)
            .await;
    }

    /// JSON bodies of every send received so far.
    pub async fn sent_messages(&self) -> Vec<Value> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|request| request.url.path() == "/cgi-bin/message/send")
            .filter_map(|request| serde_json::from_slice(&request.body).ok())
            .collect()
    }

    /// Checks every `expect` made so far.
    pub async fn verify(&self) {
        self.server.verify().await;
    }
}
