use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{Attachment, ChatScope, Message, MessageId, MessageState, UserId},
    error::ApiError,
};

/// Server-side representation of a persisted chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message_id: u64,
    pub scope: ChatScope,
    pub author_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_name: Option<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Echo of the temporary id supplied by the sending client, when the server correlates it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_nonce: Option<u64>,
}

impl MessageRecord {
    pub fn into_message(self) -> Message {
        Message {
            id: MessageId::Confirmed(self.message_id),
            scope: self.scope,
            content: self.content,
            author_id: self.author_id,
            author_name: self.author_name,
            created_at: self.created_at,
            state: MessageState::Confirmed,
            attachments: self.attachments,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingPayload {
    pub scope: ChatScope,
    pub user_id: UserId,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStatus {
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: UserId,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum InboundEvent {
    #[serde(rename = "message:new")]
    MessageNew { message: MessageRecord },
    #[serde(rename = "typing:start")]
    TypingStart(TypingPayload),
    #[serde(rename = "typing:stop")]
    TypingStop(TypingPayload),
    #[serde(rename = "connection:state")]
    ConnectionChanged(LinkStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InboundKind {
    MessageNew,
    TypingStart,
    TypingStop,
    ConnectionChanged,
}

impl InboundKind {
    pub fn as_str(self) -> &'static str {
        match self {
            InboundKind::MessageNew => "message:new",
            InboundKind::TypingStart => "typing:start",
            InboundKind::TypingStop => "typing:stop",
            InboundKind::ConnectionChanged => "connection:state",
        }
    }
}

impl InboundEvent {
    pub fn kind(&self) -> InboundKind {
        match self {
            InboundEvent::MessageNew { .. } => InboundKind::MessageNew,
            InboundEvent::TypingStart(_) => InboundKind::TypingStart,
            InboundEvent::TypingStop(_) => InboundKind::TypingStop,
            InboundEvent::ConnectionChanged(_) => InboundKind::ConnectionChanged,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum OutboundEvent {
    #[serde(rename = "authenticate")]
    Authenticate(Identity),
    #[serde(rename = "typing:start")]
    TypingStart { scope: ChatScope },
    #[serde(rename = "typing:stop")]
    TypingStop { scope: ChatScope },
    #[serde(rename = "join:scope")]
    JoinScope { scope: ChatScope },
    #[serde(rename = "leave:scope")]
    LeaveScope { scope: ChatScope },
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::Authenticate(_) => "authenticate",
            OutboundEvent::TypingStart { .. } => "typing:start",
            OutboundEvent::TypingStop { .. } => "typing:stop",
            OutboundEvent::JoinScope { .. } => "join:scope",
            OutboundEvent::LeaveScope { .. } => "leave:scope",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub success: bool,
    #[serde(default)]
    pub messages: Vec<MessageRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub scope: ChatScope,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub client_nonce: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<MessageRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}
