//! Events produced and consumed by the pairing engine.

use crate::name::DisplayName;
use tandem_protocol::{LeaveReason, ServerFrame};

/// An event the engine or router emits to a single connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// The connection was queued.
    Waiting,
    /// The connection was matched.
    Paired {
        your_name: DisplayName,
        partner_name: DisplayName,
    },
    /// A message relayed from the partner.
    Message {
        text: String,
        sender_name: DisplayName,
        reply_to: Option<String>,
    },
    /// The partner started typing.
    PartnerTyping,
    /// The partner stopped typing.
    PartnerStopTyping,
    /// The partner is gone.
    PartnerLeft { reason: LeaveReason },
}

impl From<ChatEvent> for ServerFrame {
    fn from(event: ChatEvent) -> Self {
        match event {
            ChatEvent::Waiting => ServerFrame::Waiting,
            ChatEvent::Paired {
                your_name,
                partner_name,
            } => ServerFrame::Paired {
                your_name: your_name.to_string(),
                partner_name: partner_name.to_string(),
            },
            ChatEvent::Message {
                text,
                sender_name,
                reply_to,
            } => ServerFrame::Message {
                text,
                sender_name: sender_name.to_string(),
                reply_to,
            },
            ChatEvent::PartnerTyping => ServerFrame::PartnerTyping,
            ChatEvent::PartnerStopTyping => ServerFrame::PartnerStopTyping,
            ChatEvent::PartnerLeft { reason } => ServerFrame::PartnerLeft { reason },
        }
    }
}

/// An event a paired connection asks to relay to its partner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// A chat message.
    Message {
        text: String,
        reply_to: Option<String>,
    },
    /// Typing started.
    TypingStart,
    /// Typing stopped.
    TypingStop,
}

impl RelayEvent {
    /// Short name, for logging and metrics labels.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            RelayEvent::Message { .. } => "message",
            RelayEvent::TypingStart => "typing_start",
            RelayEvent::TypingStop => "typing_stop",
        }
    }

    /// Convert into the event the partner receives.
    #[must_use]
    pub fn into_partner_event(self, sender_name: &DisplayName) -> ChatEvent {
        match self {
            RelayEvent::Message { text, reply_to } => ChatEvent::Message {
                text,
                sender_name: sender_name.clone(),
                reply_to,
            },
            RelayEvent::TypingStart => ChatEvent::PartnerTyping,
            RelayEvent::TypingStop => ChatEvent::PartnerStopTyping,
        }
    }
}
