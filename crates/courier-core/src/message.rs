//! Inbound platform messages.
//!
//! Callback bodies arrive either as platform XML (`<xml><MsgType>…`) or as a
//! flat JSON object with the same PascalCase field names. Both are reduced to
//! a flat field map first, then typed by the `MsgType` discriminator.

use std::collections::BTreeMap;

use quick_xml::{events::Event, Reader};
use serde::Serialize;
use serde_json::Value;

use crate::error::{CoreError, Result};

/// Flat field map extracted from a callback body.
pub type Fields = BTreeMap<String, String>;

/// Message received from the platform.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedMessage {
    /// Platform message id; events carry none.
    pub message_id: Option<String>,
    /// Sender user id.
    pub from_user: String,
    /// Receiving corp id.
    pub to_user: String,
    /// Lower-cased `MsgType` discriminator.
    pub msg_type: String,
    /// Unix seconds at which the platform created the message.
    pub create_time: Option<i64>,
    /// Agent the message was addressed to.
    pub agent_id: Option<i64>,
    /// Typed payload.
    #[serde(flatten)]
    pub content: MessageContent,
}

/// Type-specific payload of a [`ParsedMessage`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// `text`
    Text {
        /// Message text.
        content: String,
    },
    /// `image`
    #[serde(rename_all = "camelCase")]
    Image {
        /// Downloadable picture URL.
        pic_url: Option<String>,
        /// Platform media id.
        media_id: Option<String>,
    },
    /// `voice`
    #[serde(rename_all = "camelCase")]
    Voice {
        /// Platform media id.
        media_id: Option<String>,
        /// Audio codec, e.g. `amr`.
        format: Option<String>,
    },
    /// `video` and `shortvideo`
    #[serde(rename_all = "camelCase")]
    Video {
        /// Platform media id.
        media_id: Option<String>,
        /// Thumbnail media id.
        thumb_media_id: Option<String>,
    },
    /// `location`
    Location {
        /// Latitude (`Location_X`).
        latitude: Option<f64>,
        /// Longitude (`Location_Y`).
        longitude: Option<f64>,
        /// Map zoom level.
        scale: Option<u32>,
        /// Place description.
        label: Option<String>,
    },
    /// `link`
    #[serde(rename_all = "camelCase")]
    Link {
        /// Link title.
        title: Option<String>,
        /// Link summary.
        description: Option<String>,
        /// Target URL.
        url: Option<String>,
        /// Cover picture.
        pic_url: Option<String>,
    },
    /// `event`
    #[serde(rename_all = "camelCase")]
    Event {
        /// Lower-cased `Event` field, e.g. `subscribe`, `click`.
        event: String,
        /// `EventKey`, when present.
        event_key: Option<String>,
        /// Every field of the body, for event-specific data.
        fields: Fields,
    },
    /// Any other `MsgType`, preserved as-is.
    Raw {
        /// Every field of the body.
        fields: Fields,
    },
}

impl ParsedMessage {
    /// Parses a decrypted or plain callback body, sniffing XML versus JSON.
    pub fn parse(body: &str) -> Result<Self> {
        let trimmed = body.trim_start();
        let fields = if trimmed.starts_with('<') { xml_fields(trimmed)? } else { json_fields(trimmed)? };
        Self::from_fields(fields)
    }

    /// Builds a message from an extracted field map.
    pub fn from_fields(fields: Fields) -> Result<Self> {
        let msg_type = fields
            .get("MsgType")
            .map(|t| t.trim().to_ascii_lowercase())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| CoreError::invalid_format("missing MsgType"))?;

        let text = |key: &str| fields.get(key).cloned();
        let number = |key: &str| fields.get(key).and_then(|v| v.trim().parse::<i64>().ok());
        let float = |key: &str| fields.get(key).and_then(|v| v.trim().parse::<f64>().ok());

        let content = match msg_type.as_str() {
            "text" => MessageContent::Text { content: text("Content").unwrap_or_default() },
            "image" => MessageContent::Image { pic_url: text("PicUrl"), media_id: text("MediaId") },
            "voice" => MessageContent::Voice { media_id: text("MediaId"), format: text("Format") },
            "video" | "shortvideo" => {
                MessageContent::Video { media_id: text("MediaId"), thumb_media_id: text("ThumbMediaId") }
            },
            "location" => MessageContent::Location {
                latitude: float("Location_X"),
                longitude: float("Location_Y"),
                scale: number("Scale").and_then(|s| u32::try_from(s).ok()),
                label: text("Label"),
            },
            "link" => MessageContent::Link {
                title: text("Title"),
                description: text("Description"),
                url: text("Url"),
                pic_url: text("PicUrl"),
            },
            "event" => MessageContent::Event {
                event: fields.get("Event").map(|e| e.trim().to_ascii_lowercase()).unwrap_or_default(),
                event_key: text("EventKey").filter(|k| !k.is_empty()),
                fields: fields.clone(),
            },
            _ => MessageContent::Raw { fields: fields.clone() },
        };

        Ok(Self {
            message_id: text("MsgId").filter(|id| !id.is_empty()),
            from_user: text("FromUserName").unwrap_or_default(),
            to_user: text("ToUserName").unwrap_or_default(),
            create_time: number("CreateTime"),
            agent_id: number("AgentID"),
            msg_type,
            content,
        })
    }

    /// Event name for `event` messages.
    pub fn event(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Event { event, .. } => Some(event),
            _ => None,
        }
    }

    /// Text content for `text` messages.
    pub fn text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text { content } => Some(content),
            _ => None,
        }
    }
}

/// Extracts the direct children of the root element as a field map.
///
/// Deeper nesting (e.g. `SendPicsInfo`) is skipped; CDATA and escaped text are
/// both accepted.
pub fn xml_fields(xml: &str) -> Result<Fields> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut fields = Fields::new();
    let mut depth = 0usize;
    let mut current: Option<String> = None;
    let mut saw_root = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                depth += 1;
                if depth == 1 {
                    saw_root = true;
                } else if depth == 2 {
                    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                    fields.entry(name.clone()).or_default();
                    current = Some(name);
                }
            },
            Ok(Event::Empty(empty)) if depth == 1 => {
                let name = String::from_utf8_lossy(empty.name().as_ref()).into_owned();
                fields.entry(name).or_default();
            },
            Ok(Event::End(_)) => {
                if depth == 2 {
                    current = None;
                }
                depth = depth.saturating_sub(1);
            },
            Ok(Event::Text(text)) if depth == 2 => {
                let value = text.unescape().map_err(|e| CoreError::invalid_format(e.to_string()))?;
                if let Some(name) = &current {
                    fields.entry(name.clone()).or_default().push_str(&value);
                }
            },
            Ok(Event::CData(data)) if depth == 2 => {
                if let Some(name) = &current {
                    fields.entry(name.clone()).or_default().push_str(&String::from_utf8_lossy(&data));
                }
            },
            Ok(Event::Eof) => break,
            Ok(_) => {},
            Err(e) => return Err(CoreError::invalid_format(format!("xml: {e}"))),
        }
    }

    if !saw_root || depth != 0 {
        return Err(CoreError::invalid_format("xml: missing or unbalanced root element"));
    }
    Ok(fields)
}

/// Flattens a JSON object into a field map. Scalars are stringified; nested
/// values keep their JSON text.
pub fn json_fields(json: &str) -> Result<Fields> {
    let value: Value =
        serde_json::from_str(json).map_err(|e| CoreError::invalid_format(format!("json: {e}")))?;
    object_fields(&value)
}

/// Flattens an already-parsed JSON object into a field map.
pub fn object_fields(value: &Value) -> Result<Fields> {
    let object = value.as_object().ok_or_else(|| CoreError::invalid_format("json: expected an object"))?;

    Ok(object
        .iter()
        .filter_map(|(key, value)| {
            let text = match value {
                Value::Null => return None,
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            Some((key.clone(), text))
        })
        .collect())
}
