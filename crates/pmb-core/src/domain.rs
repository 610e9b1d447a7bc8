use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity a message is attributed to (phone-number equivalent, e.g. `15551234567@s.whatsapp.net`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SenderId(pub String);

/// Conversation a message belongs to. Equal to the sender for direct chats.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatId(pub String);

impl SenderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl ChatId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SenderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A text message received from the transport.
#[derive(Clone, Debug, PartialEq)]
pub struct InboundMessage {
    pub id: String,
    pub chat_id: ChatId,
    pub sender: SenderId,
    pub push_name: Option<String>,
    pub text: String,
    pub is_group: bool,
    pub from_me: bool,
    pub timestamp_ms: u64,
}
