use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::sketch::SketchUpdate;
use super::validation;
use crate::error::{CoreError, CoreResult, ErrorBody};

/// Unique identifier for a message.
pub type MessageId = Uuid;

/// Typed payload of a frame. Serialises as `{"type": "...", "content": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageContent {
    Text(TextContent),
    Image(ImageContent),
    SketchUpdate(SketchUpdate),
    SketchCommand(SketchCommand),
    Channel(ChannelEvent),
    Member(MemberEvent),
    System(SystemNotice),
    /// Server to client only.
    Error(ErrorBody),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextContent {
    pub text: String,
}

/// `url` is a storage path produced by the upload service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageContent {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum SketchCommand {
    #[serde(rename_all = "camelCase")]
    Create {
        display_name: String,
        width: u32,
        height: u32,
        /// Filled in by the server once the sketch exists.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sketch_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Delete { sketch_id: String },
    #[serde(rename_all = "camelCase")]
    Clear { sketch_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelAction {
    Created,
    Updated,
    Deleted,
}

/// Directory-level change to a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelEvent {
    pub action: ChannelAction,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberAction {
    Joined,
    Left,
    RoleChanged,
}

/// Membership or presence change inside a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberEvent {
    pub action: MemberAction,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_admin: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemNotice {
    pub text: String,
}

impl MessageContent {
    /// Wire name of the variant, also stored in `messages.message_type`.
    pub fn kind(&self) -> &'static str {
        match self {
            MessageContent::Text(_) => "TEXT",
            MessageContent::Image(_) => "IMAGE",
            MessageContent::SketchUpdate(_) => "SKETCH_UPDATE",
            MessageContent::SketchCommand(_) => "SKETCH_COMMAND",
            MessageContent::Channel(_) => "CHANNEL",
            MessageContent::Member(_) => "MEMBER",
            MessageContent::System(_) => "SYSTEM",
            MessageContent::Error(_) => "ERROR",
        }
    }

    /// Per-variant validation of client-supplied content.
    pub fn validate(&self) -> CoreResult<()> {
        match self {
            MessageContent::Text(t) => validation::validate_text(&t.text).map_err(CoreError::Validation),
            MessageContent::Image(i) => {
                validation::validate_image_url(&i.url).map_err(CoreError::Validation)
            }
            MessageContent::SketchUpdate(u) => u.validate(),
            MessageContent::SketchCommand(cmd) => match cmd {
                SketchCommand::Create { display_name, .. } if display_name.trim().is_empty() => {
                    Err(CoreError::Validation("Sketch name cannot be empty".into()))
                }
                SketchCommand::Delete { sketch_id } | SketchCommand::Clear { sketch_id }
                    if sketch_id.trim().is_empty() =>
                {
                    Err(CoreError::Validation("Sketch id cannot be empty".into()))
                }
                _ => Ok(()),
            },
            MessageContent::Channel(c) => {
                validation::validate_channel_name(&c.name).map_err(CoreError::Validation)
            }
            MessageContent::Member(m) => {
                validation::validate_username(&m.username).map_err(CoreError::Validation)
            }
            MessageContent::System(s) => validation::validate_text(&s.text).map_err(CoreError::Validation),
            MessageContent::Error(_) => Err(CoreError::Validation(
                "ERROR frames are server-only".into(),
            )),
        }
    }

    /// Text and image messages are kept for history.
    pub fn is_chat(&self) -> bool {
        matches!(self, MessageContent::Text(_) | MessageContent::Image(_))
    }
}

/// Frame as sent by a client. Identity and time are never taken from it.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientFrame {
    #[serde(default)]
    pub channel_name: String,
    #[serde(flatten)]
    pub content: MessageContent,
}

impl ClientFrame {
    /// Decode a text frame. Unknown types and malformed content are
    /// validation errors.
    pub fn parse(text: &str) -> CoreResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| CoreError::Validation(format!("Malformed frame: {e}")))
    }
}

/// A server-stamped message: what peers receive, what pub/sub carries and
/// what the chat batch persists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub content: MessageContent,
}

impl ChatMessage {
    /// Stamp a message from an authenticated user.
    pub fn from_user(username: &str, channel_name: &str, content: MessageContent) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel_name: Some(channel_name.to_string()),
            username: Some(username.to_string()),
            timestamp: Utc::now(),
            content,
        }
    }

    /// A message originated by the server itself.
    pub fn server(channel_name: Option<&str>, content: MessageContent) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel_name: channel_name.map(str::to_string),
            username: None,
            timestamp: Utc::now(),
            content,
        }
    }

    pub fn error(err: &CoreError) -> Self {
        Self::server(None, MessageContent::Error(err.body()))
    }

    pub fn to_json(&self) -> String {
        // Every field serialises infallibly.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Row for the `messages` table, carrying only the typed payload as content.
    pub fn to_row(&self) -> Option<crate::db::models::MessageRow> {
        let content = match &self.content {
            MessageContent::Text(t) => serde_json::to_string(t),
            MessageContent::Image(i) => serde_json::to_string(i),
            _ => return None,
        }
        .ok()?;
        Some(crate::db::models::MessageRow {
            id: self.id.to_string(),
            channel_name: self.channel_name.clone()?,
            username: self.username.clone()?,
            message_type: self.content.kind().to_string(),
            content,
            timestamp: self.timestamp,
        })
    }

    /// Rebuild a stored chat message.
    pub fn from_row(row: &crate::db::models::MessageRow) -> CoreResult<Self> {
        let content = match row.message_type.as_str() {
            "TEXT" => MessageContent::Text(serde_json::from_str(&row.content).map_err(bad_row)?),
            "IMAGE" => MessageContent::Image(serde_json::from_str(&row.content).map_err(bad_row)?),
            other => {
                return Err(CoreError::Internal(format!(
                    "unexpected stored message type {other}"
                )));
            }
        };
        let id = Uuid::parse_str(&row.id).map_err(|e| CoreError::Internal(e.to_string()))?;
        Ok(Self {
            id,
            channel_name: Some(row.channel_name.clone()),
            username: Some(row.username.clone()),
            timestamp: row.timestamp,
            content,
        })
    }
}

fn bad_row(e: serde_json::Error) -> CoreError {
    CoreError::Internal(format!("stored message is not valid JSON: {e}"))
}
