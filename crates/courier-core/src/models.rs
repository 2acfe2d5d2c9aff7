//! Tenant, credential, and outbound message models.
//!
//! Inbound messages live in [`crate::message`]; this module holds everything
//! the send path passes around.

use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// One configured corp credential set, addressable by account id.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantConfig {
    /// Account identifier used in routes and logs.
    pub account_id: String,
    /// Platform corp id.
    pub corp_id: String,
    /// Application secret used for token issuance.
    pub corp_secret: String,
    /// Application agent id stamped on every outbound message.
    pub agent_id: i64,
    /// Callback signing token.
    pub token: String,
    /// 43-character callback encryption key, when encryption is enabled.
    #[serde(default)]
    pub encoding_aes_key: Option<String>,
}

impl TenantConfig {
    /// Whether callbacks for this tenant carry encrypted payloads.
    pub fn encryption_enabled(&self) -> bool {
        self.encoding_aes_key.as_deref().is_some_and(|key| !key.is_empty())
    }

    /// Cache key for this tenant's access token.
    pub fn tenant_key(&self) -> TenantKey {
        TenantKey::derive(&self.corp_id, &self.corp_secret)
    }

    /// Corp id shortened for log output.
    pub fn masked_corp_id(&self) -> String {
        let prefix: String = self.corp_id.chars().take(8).collect();
        format!("{prefix}...")
    }
}

impl fmt::Debug for TenantConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantConfig")
            .field("account_id", &self.account_id)
            .field("corp_id", &self.masked_corp_id())
            .field("agent_id", &self.agent_id)
            .field("encryption_enabled", &self.encryption_enabled())
            .finish_non_exhaustive()
    }
}

/// Resolves account ids to tenant configuration.
pub trait TenantDirectory: Send + Sync + fmt::Debug {
    /// Looks up a tenant by account id.
    fn resolve(&self, account_id: &str) -> Option<TenantConfig>;

    /// All configured account ids, in stable order.
    fn account_ids(&self) -> Vec<String>;
}

/// Fixed set of tenants loaded at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticTenantDirectory {
    tenants: BTreeMap<String, TenantConfig>,
}

impl StaticTenantDirectory {
    /// Builds a directory from tenant configs, keyed by their account id.
    pub fn new(tenants: impl IntoIterator<Item = TenantConfig>) -> Self {
        Self { tenants: tenants.into_iter().map(|t| (t.account_id.clone(), t)).collect() }
    }
}

impl TenantDirectory for StaticTenantDirectory {
    fn resolve(&self, account_id: &str) -> Option<TenantConfig> {
        self.tenants.get(account_id).cloned()
    }

    fn account_ids(&self) -> Vec<String> {
        self.tenants.keys().cloned().collect()
    }
}

/// Token cache key: hex SHA-256 of `corp_id:corp_secret`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantKey(String);

impl TenantKey {
    /// Derives the key for a corp id and secret pair.
    pub fn derive(corp_id: &str, corp_secret: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(corp_id.as_bytes());
        hasher.update(b":");
        hasher.update(corp_secret.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Hex digest backing this key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // First 12 hex chars are enough to correlate log lines.
        write!(f, "{}", &self.0[..12.min(self.0.len())])
    }
}

/// Cached access token.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    /// Tenant the token was issued for.
    pub tenant_key: TenantKey,
    /// Bearer token value.
    pub token: String,
    /// When the platform issued the token.
    pub issued_at: DateTime<Utc>,
    /// When the cache stops serving the token; already reduced by the safety margin.
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    /// Whether the token may still be served at `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("tenant_key", &self.tenant_key)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Recipients of an outbound message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Target {
    /// User ids, or `@all`.
    #[serde(default)]
    pub users: Vec<String>,
    /// Department ids.
    #[serde(default)]
    pub parties: Vec<String>,
    /// Tag ids.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Target {
    /// Targets a single user.
    pub fn user(id: impl Into<String>) -> Self {
        Self { users: vec![id.into()], ..Self::default() }
    }

    /// Targets everyone visible to the agent.
    pub fn everyone() -> Self {
        Self::user("@all")
    }

    /// Whether no recipient is set.
    pub fn is_empty(&self) -> bool {
        self.users.is_empty() && self.parties.is_empty() && self.tags.is_empty()
    }
}

impl Serialize for Target {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;

        let mut map = serializer.serialize_map(None)?;
        for (field, ids) in [("touser", &self.users), ("toparty", &self.parties), ("totag", &self.tags)] {
            if !ids.is_empty() {
                map.serialize_entry(field, &ids.join("|"))?;
            }
        }
        map.end()
    }
}

/// Article inside a `news` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    /// Headline.
    pub title: String,
    /// Summary text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Link opened on tap.
    pub url: String,
    /// Cover image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picurl: Option<String>,
}

/// Plain text content block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextContent {
    /// Message text.
    pub content: String,
}

/// Uploaded media reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaContent {
    /// Platform media id.
    pub media_id: String,
}

/// Video content block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoContent {
    /// Platform media id.
    pub media_id: String,
    /// Optional title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Text card content block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextCardContent {
    /// Card title.
    pub title: String,
    /// Card body; supports the platform's limited HTML.
    pub description: String,
    /// Link opened on tap.
    pub url: String,
    /// Button label.
    #[serde(default = "default_button_text")]
    pub btntxt: String,
}

fn default_button_text() -> String {
    "详情".to_string()
}

/// News content block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewsContent {
    /// One to eight articles.
    pub articles: Vec<Article>,
}

/// Type-specific payload; serializes as `msgtype` plus the matching block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "msgtype", rename_all = "lowercase")]
pub enum MessageBody {
    /// Plain text.
    Text {
        /// Text block.
        text: TextContent,
    },
    /// Image by media id.
    Image {
        /// Media block.
        image: MediaContent,
    },
    /// Voice by media id.
    Voice {
        /// Media block.
        voice: MediaContent,
    },
    /// Video by media id.
    Video {
        /// Video block.
        video: VideoContent,
    },
    /// File by media id.
    File {
        /// Media block.
        file: MediaContent,
    },
    /// Clickable text card.
    #[serde(rename = "textcard")]
    TextCard {
        /// Card block.
        textcard: TextCardContent,
    },
    /// Article list.
    News {
        /// News block.
        news: NewsContent,
    },
    /// Markdown text.
    Markdown {
        /// Markdown block.
        markdown: TextContent,
    },
}

impl MessageBody {
    /// Wire name of this message type.
    pub const fn msg_type(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Image { .. } => "image",
            Self::Voice { .. } => "voice",
            Self::Video { .. } => "video",
            Self::File { .. } => "file",
            Self::TextCard { .. } => "textcard",
            Self::News { .. } => "news",
            Self::Markdown { .. } => "markdown",
        }
    }
}

/// Message to send through the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Recipients.
    pub target: Target,
    /// Typed payload.
    pub body: MessageBody,
    /// Marks the message confidential (no forwarding).
    #[serde(default)]
    pub safe: bool,
}

impl OutboundMessage {
    /// Text message to `target`.
    pub fn text(target: Target, content: impl Into<String>) -> Self {
        Self { target, body: MessageBody::Text { text: TextContent { content: content.into() } }, safe: false }
    }

    /// Markdown message to `target`.
    pub fn markdown(target: Target, content: impl Into<String>) -> Self {
        Self {
            target,
            body: MessageBody::Markdown { markdown: TextContent { content: content.into() } },
            safe: false,
        }
    }

    /// Text card to `target` with the default button label.
    pub fn text_card(
        target: Target,
        title: impl Into<String>,
        description: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            target,
            body: MessageBody::TextCard {
                textcard: TextCardContent {
                    title: title.into(),
                    description: description.into(),
                    url: url.into(),
                    btntxt: default_button_text(),
                },
            },
            safe: false,
        }
    }

    /// News message with the given articles.
    pub fn news(target: Target, articles: Vec<Article>) -> Self {
        Self { target, body: MessageBody::News { news: NewsContent { articles } }, safe: false }
    }

    /// Media message; `kind` selects image, voice, or file.
    pub fn media(target: Target, kind: MediaKind, media_id: impl Into<String>) -> Self {
        let media = MediaContent { media_id: media_id.into() };
        let body = match kind {
            MediaKind::Image => MessageBody::Image { image: media },
            MediaKind::Voice => MessageBody::Voice { voice: media },
            MediaKind::File => MessageBody::File { file: media },
        };
        Self { target, body, safe: false }
    }

    /// Marks the message confidential.
    #[must_use]
    pub fn confidential(mut self) -> Self {
        self.safe = true;
        self
    }
}

/// Media-only message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    /// Image.
    Image,
    /// Voice.
    Voice,
    /// File.
    File,
}

/// Platform acknowledgement of a sent message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    /// Platform message id.
    pub msg_id: Option<String>,
    /// Users the platform could not deliver to.
    pub invalid_users: Vec<String>,
    /// Departments the platform could not deliver to.
    pub invalid_parties: Vec<String>,
    /// Tags the platform could not deliver to.
    pub invalid_tags: Vec<String>,
}

impl SendReceipt {
    /// Whether every recipient was accepted.
    pub fn fully_delivered(&self) -> bool {
        self.invalid_users.is_empty() && self.invalid_parties.is_empty() && self.invalid_tags.is_empty()
    }
}

/// Identifier of a queued send task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Creates a random task id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A send owned by the delivery queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuedSend {
    /// Task id returned by `enqueue`.
    pub id: TaskId,
    /// Message and its recipients.
    pub payload: OutboundMessage,
    /// Failed attempts so far.
    pub attempt_count: u32,
    /// When the task entered the queue.
    pub enqueued_at: DateTime<Utc>,
}

/// Send task set aside after exhausting its retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadLetter {
    /// Task id returned by `enqueue`.
    pub task_id: TaskId,
    /// Message that could not be delivered.
    pub payload: OutboundMessage,
    /// Total attempts made.
    pub attempts: u32,
    /// Error from the final attempt.
    pub last_error: String,
    /// When the task was dead-lettered.
    pub failed_at: DateTime<Utc>,
}
