//! Frame types for the Tandem protocol.
//!
//! Every frame is an object tagged by `"type"`. Clients send [`ClientFrame`]s
//! and receive [`ServerFrame`]s; the same types are used for both the JSON
//! text encoding and the MessagePack binary encoding.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a partner is no longer in the chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveReason {
    /// The partner ended the chat on purpose.
    Ended,
    /// The partner's connection dropped.
    Disconnected,
}

impl LeaveReason {
    /// Wire name of the reason.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            LeaveReason::Ended => "ended",
            LeaveReason::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for LeaveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error codes carried by [`ServerFrame::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    /// The frame could not be decoded.
    InvalidFrame = 1001,
    /// The frame exceeds the configured size limit.
    FrameTooLarge = 1002,
    /// A join was sent while already waiting for a partner.
    AlreadyWaiting = 1003,
    /// A join was sent while already in a chat.
    AlreadyPaired = 1004,
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> u16 {
        code as u16
    }
}

impl TryFrom<u16> for ErrorCode {
    type Error = &'static str;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1001 => Ok(ErrorCode::InvalidFrame),
            1002 => Ok(ErrorCode::FrameTooLarge),
            1003 => Ok(ErrorCode::AlreadyWaiting),
            1004 => Ok(ErrorCode::AlreadyPaired),
            _ => Err("Invalid error code"),
        }
    }
}

/// A frame sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Ask to be paired with a stranger.
    Join {
        /// Optional display name; blank means "Stranger".
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },

    /// Send a chat message to the current partner.
    Send {
        /// Message text.
        text: String,
        /// Optional opaque reference to the message being replied to.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<String>,
    },

    /// The client started typing.
    TypingStart,

    /// The client stopped typing.
    TypingStop,

    /// End the current chat, or stop waiting.
    Leave,

    /// Application-level keepalive.
    Ping {
        /// Optional timestamp echoed back in the pong.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ClientFrame {
    /// Wire name of the frame, for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ClientFrame::Join { .. } => "join",
            ClientFrame::Send { .. } => "send",
            ClientFrame::TypingStart => "typing_start",
            ClientFrame::TypingStop => "typing_stop",
            ClientFrame::Leave => "leave",
            ClientFrame::Ping { .. } => "ping",
        }
    }

    /// Create a new Join frame.
    #[must_use]
    pub fn join(name: Option<String>) -> Self {
        ClientFrame::Join { name }
    }

    /// Create a new Send frame without a reply reference.
    #[must_use]
    pub fn send(text: impl Into<String>) -> Self {
        ClientFrame::Send {
            text: text.into(),
            reply_to: None,
        }
    }
}

/// A frame sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// First frame on every connection.
    Welcome {
        /// Identifier the server assigned to this connection.
        connection_id: String,
        /// Protocol version.
        version: u8,
        /// Interval at which the server pings, in milliseconds.
        heartbeat_ms: u32,
        /// Number of live connections.
        online: u64,
    },

    /// The live connection count changed.
    Online {
        /// Number of live connections.
        count: u64,
    },

    /// Queued; waiting for a partner.
    Waiting,

    /// Matched with a partner.
    Paired {
        /// The receiver's own display name.
        your_name: String,
        /// The partner's display name.
        partner_name: String,
    },

    /// A message from the partner.
    Message {
        /// Message text.
        text: String,
        /// Display name of the sender.
        sender_name: String,
        /// Opaque reply reference, passed through unchanged.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<String>,
    },

    /// The partner started typing.
    PartnerTyping,

    /// The partner stopped typing.
    PartnerStopTyping,

    /// The partner left the chat.
    PartnerLeft {
        /// Why the partner left.
        reason: LeaveReason,
    },

    /// Reply to a client ping.
    Pong {
        /// Echoed timestamp from the ping.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// A request was rejected.
    Error {
        /// Numeric error code, see [`ErrorCode`].
        code: u16,
        /// Human-readable description.
        message: String,
    },
}

impl ServerFrame {
    /// Wire name of the frame, for logging and metrics labels.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ServerFrame::Welcome { .. } => "welcome",
            ServerFrame::Online { .. } => "online",
            ServerFrame::Waiting => "waiting",
            ServerFrame::Paired { .. } => "paired",
            ServerFrame::Message { .. } => "message",
            ServerFrame::PartnerTyping => "partner_typing",
            ServerFrame::PartnerStopTyping => "partner_stop_typing",
            ServerFrame::PartnerLeft { .. } => "partner_left",
            ServerFrame::Pong { .. } => "pong",
            ServerFrame::Error { .. } => "error",
        }
    }

    /// Create a new Welcome frame.
    #[must_use]
    pub fn welcome(connection_id: impl Into<String>, heartbeat_ms: u32, online: u64) -> Self {
        ServerFrame::Welcome {
            connection_id: connection_id.into(),
            version: crate::PROTOCOL_VERSION,
            heartbeat_ms,
            online,
        }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        ServerFrame::Pong { timestamp }
    }
}
