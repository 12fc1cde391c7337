//! Wire types shared by the delivery service and the client core.
//!
//! REST bodies and push frames use camelCase JSON with Mongo-style `_id`
//! keys, which is what existing clients already speak. Push frames are an
//! adjacently tagged union: `{"event": "new-message", "data": {...}}`.
//! Every inbound frame goes through [`ServerFrame::decode`] or
//! [`ClientFrame::decode`], which reject malformed or incomplete payloads
//! instead of trusting their shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Public profile fields embedded in messages, conversations and notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    #[serde(rename = "_id")]
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub profile_picture: String,
}

impl UserSummary {
    /// Name shown in lists: full name when set, username otherwise.
    pub fn display_name(&self) -> &str {
        if self.full_name.is_empty() {
            &self.username
        } else {
            &self.full_name
        }
    }
}

/// A direct message as stored by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "senderId")]
    pub sender: UserSummary,
    pub receiver_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
}

impl Message {
    /// The other participant, seen from `self_id`.
    pub fn counterpart_of(&self, self_id: &str) -> &str {
        if self.sender.id == self_id {
            &self.receiver_id
        } else {
            &self.sender.id
        }
    }
}

/// One row of `GET /api/messages/conversations`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub user: UserSummary,
    pub last_message: String,
    pub last_message_time: DateTime<Utc>,
    pub unread_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Like,
    Comment,
    Follow,
    FollowRequest,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Like => "like",
            Self::Comment => "comment",
            Self::Follow => "follow",
            Self::FollowRequest => "follow_request",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "like" => Some(Self::Like),
            "comment" => Some(Self::Comment),
            "follow" => Some(Self::Follow),
            "follow_request" => Some(Self::FollowRequest),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub sender: UserSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post: Option<String>,
    #[serde(default)]
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

/// Body of `POST /api/messages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub receiver_id: String,
    pub content: String,
}

/// Body returned by the bulk "mark read" endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkReadResponse {
    pub updated: u64,
}

// --- Push frames ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    pub user_id: String,
}

/// Payload of `new-notification`. The id is advisory; clients re-fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationSignal {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: u16,
    pub message: String,
}

/// Frames sent by a client over the push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientFrame {
    Register(RegisterPayload),
    /// Carries the server-confirmed message; `receiverId` names the target.
    SendMessage(Message),
}

/// Frames pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerFrame {
    Registered(RegisterPayload),
    NewMessage(Message),
    NewNotification(NotificationSignal),
    NewPost(serde_json::Value),
    Error(ErrorPayload),
}

/// Routing key for [`ServerFrame`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Registered,
    NewMessage,
    NewNotification,
    NewPost,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::NewMessage => "new-message",
            Self::NewNotification => "new-notification",
            Self::NewPost => "new-post",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid frame: {0}")]
    Invalid(&'static str),
}

fn validate_message(message: &Message) -> Result<(), FrameError> {
    if message.id.trim().is_empty() {
        return Err(FrameError::Invalid("message id is empty"));
    }
    if message.sender.id.trim().is_empty() {
        return Err(FrameError::Invalid("sender id is empty"));
    }
    if message.receiver_id.trim().is_empty() {
        return Err(FrameError::Invalid("receiver id is empty"));
    }
    Ok(())
}

impl ClientFrame {
    pub fn decode(text: &str) -> Result<Self, FrameError> {
        let frame: ClientFrame = serde_json::from_str(text)?;
        match &frame {
            ClientFrame::Register(payload) if payload.user_id.trim().is_empty() => {
                return Err(FrameError::Invalid("register without user id"));
            }
            ClientFrame::SendMessage(message) => validate_message(message)?,
            _ => {}
        }
        Ok(frame)
    }

    pub fn encode(&self) -> Result<String, FrameError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl ServerFrame {
    pub fn decode(text: &str) -> Result<Self, FrameError> {
        let frame: ServerFrame = serde_json::from_str(text)?;
        match &frame {
            ServerFrame::NewMessage(message) => validate_message(message)?,
            ServerFrame::NewPost(post) if !post.is_object() => {
                return Err(FrameError::Invalid("post payload is not an object"));
            }
            _ => {}
        }
        Ok(frame)
    }

    pub fn encode(&self) -> Result<String, FrameError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn kind(&self) -> EventKind {
        match self {
            ServerFrame::Registered(_) => EventKind::Registered,
            ServerFrame::NewMessage(_) => EventKind::NewMessage,
            ServerFrame::NewNotification(_) => EventKind::NewNotification,
            ServerFrame::NewPost(_) => EventKind::NewPost,
            ServerFrame::Error(_) => EventKind::Error,
        }
    }
}
