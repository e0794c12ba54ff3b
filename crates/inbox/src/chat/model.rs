use std::fmt;

use serde::{Deserialize, Serialize};

use crate::address::Address;

/// Per-peer trust classification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsentState {
    #[default]
    Unknown,
    Allowed,
    Blocked,
}

impl ConsentState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Allowed => "allowed",
            Self::Blocked => "blocked",
        }
    }
}

impl fmt::Display for ConsentState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// A logical thread with one counterparty. Unique by `peer_address` within a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub peer_address: Address,
    pub created_at_unix_ms: u64,
    #[serde(default)]
    pub consent_state: ConsentState,
}

impl Conversation {
    pub fn new(peer_address: Address, created_at_unix_ms: u64) -> Self {
        Self {
            peer_address,
            created_at_unix_ms,
            consent_state: ConsentState::Unknown,
        }
    }

    pub fn with_consent(mut self, consent_state: ConsentState) -> Self {
        self.consent_state = consent_state;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageBody {
    Text { text: String },
    /// Content type this client cannot decode; the sender's fallback is shown instead.
    Unsupported { content_type: String },
}

/// Immutable once received; identity is `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender_address: Address,
    pub sent_at_unix_ms: u64,
    pub body: MessageBody,
    pub fallback: Option<String>,
}

impl Message {
    pub fn text(
        id: impl Into<String>,
        sender_address: Address,
        sent_at_unix_ms: u64,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: MessageId::new(id),
            sender_address,
            sent_at_unix_ms,
            body: MessageBody::Text { text: text.into() },
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = Some(fallback.into());
        self
    }

    /// Text to render: the decoded body, else the fallback, else empty.
    pub fn display_text(&self) -> &str {
        match &self.body {
            MessageBody::Text { text } => text,
            MessageBody::Unsupported { .. } => self.fallback.as_deref().unwrap_or_default(),
        }
    }

    pub fn is_from(&self, address: &Address) -> bool {
        &self.sender_address == address
    }
}

/// Which bucket of the inbox is on screen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationTab {
    #[default]
    Allowed,
    Requests,
}

impl ConversationTab {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Requests => "requests",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "allowed" => Some(Self::Allowed),
            "requests" => Some(Self::Requests),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Address {
        Address::parse("0x1111111111111111111111111111111111111111").unwrap()
    }

    #[test]
    fn unsupported_bodies_render_their_fallback() {
        let message = Message {
            id: MessageId::new("m1"),
            sender_address: alice(),
            sent_at_unix_ms: 10,
            body: MessageBody::Unsupported {
                content_type: "xmtp.org/reaction:1.0".to_string(),
            },
            fallback: Some("reacted with 👍".to_string()),
        };
        assert_eq!(message.display_text(), "reacted with 👍");

        let bare = Message {
            fallback: None,
            ..message
        };
        assert_eq!(bare.display_text(), "");
    }

    #[test]
    fn text_bodies_win_over_fallback() {
        let message = Message::text("m1", alice(), 10, "gm").with_fallback("ignored");
        assert_eq!(message.display_text(), "gm");
        assert!(message.is_from(&alice()));
    }

    #[test]
    fn tab_names_round_trip() {
        for tab in [ConversationTab::Allowed, ConversationTab::Requests] {
            assert_eq!(ConversationTab::parse(tab.as_str()), Some(tab));
        }
        assert_eq!(ConversationTab::parse("archive"), None);
    }

    #[test]
    fn consent_serializes_lowercase() {
        let json = serde_json::to_string(&ConsentState::Blocked).unwrap();
        assert_eq!(json, "\"blocked\"");
    }
}
