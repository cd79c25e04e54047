use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{errors::Error, Result};

/// Direct (1:1) or group conversation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Direct,
    Group,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Direct => "direct",
            MessageType::Group => "group",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderRole {
    #[default]
    Normal,
    Admin,
}

/// Where a message came from: platform + conversation.
///
/// Textual form is `platform:message_type:chat_id`. The chat id may itself
/// contain `:` (only the first two separators are significant).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Origin {
    pub platform: String,
    pub message_type: MessageType,
    pub chat_id: String,
}

impl Origin {
    pub fn new(
        platform: impl Into<String>,
        message_type: MessageType,
        chat_id: impl Into<String>,
    ) -> Self {
        Self {
            platform: platform.into(),
            message_type,
            chat_id: chat_id.into(),
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.platform,
            self.message_type.as_str(),
            self.chat_id
        )
    }
}

impl FromStr for Origin {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, ':');
        let (Some(platform), Some(kind), Some(chat_id)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::Config(format!("malformed origin: {s}")));
        };
        let message_type = match kind {
            "direct" => MessageType::Direct,
            "group" => MessageType::Group,
            other => {
                return Err(Error::Config(format!(
                    "malformed origin {s}: unknown message type {other}"
                )))
            }
        };
        if platform.is_empty() || chat_id.is_empty() {
            return Err(Error::Config(format!("malformed origin: {s}")));
        }
        Ok(Self::new(platform, message_type, chat_id))
    }
}

/// Key for all session-scoped state (rate limits, session status, run locks).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn from_origin(origin: &Origin) -> Self {
        Self(origin.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
