use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ChatId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatType {
    Channel,
    Direct,
}

impl ChatType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChatType::Channel => "channel",
            ChatType::Direct => "direct",
        }
    }
}

impl fmt::Display for ChatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Addressable conversation target for messages, typing signals and pagination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatScope {
    pub chat_type: ChatType,
    pub chat_id: ChatId,
}

impl ChatScope {
    pub fn new(chat_type: ChatType, chat_id: ChatId) -> Self {
        Self { chat_type, chat_id }
    }

    pub fn channel(chat_id: i64) -> Self {
        Self::new(ChatType::Channel, ChatId(chat_id))
    }

    pub fn direct(chat_id: i64) -> Self {
        Self::new(ChatType::Direct, ChatId(chat_id))
    }
}

impl fmt::Display for ChatScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chat_type, self.chat_id)
    }
}

/// Identifier of a rendered message.
///
/// A locally created message carries a `Temporary` id until the server
/// confirms it, at which point it is replaced by the `Confirmed` server id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MessageId {
    Temporary(u64),
    Confirmed(u64),
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Temporary(id) => write!(f, "tmp-{id}"),
            MessageId::Confirmed(id) => write!(f, "{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub scope: ChatScope,
    pub content: String,
    pub author_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub state: MessageState,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl Message {
    pub fn is_confirmed(&self) -> bool {
        self.state == MessageState::Confirmed
    }
}
