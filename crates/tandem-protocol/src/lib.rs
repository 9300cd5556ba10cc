//! # tandem-protocol
//!
//! Wire protocol definitions for Tandem, an anonymous one-on-one chat service.
//!
//! ## Frame Types
//!
//! - [`ClientFrame`] - `join`, `send`, `typing_start` / `typing_stop`, `leave`, `ping`
//! - [`ServerFrame`] - `welcome`, `online`, `waiting`, `paired`, `message`,
//!   `partner_typing` / `partner_stop_typing`, `partner_left`, `pong`, `error`
//!
//! ## Example
//!
//! ```rust
//! use tandem_protocol::{codec, ClientFrame, Encoding};
//!
//! let frame = ClientFrame::send("hello, stranger");
//!
//! // JSON for browsers, MessagePack for everything else
//! let text = Encoding::Json.encode(&frame).unwrap();
//! let bytes = codec::encode(&frame).unwrap();
//! let decoded: ClientFrame = codec::decode(&bytes).unwrap();
//! assert_eq!(decoded, frame);
//! # let _ = text;
//! ```

pub mod codec;
pub mod frames;

pub use codec::{decode, decode_json, encode, encode_json, Encoded, Encoding, ProtocolError};
pub use frames::{ClientFrame, ErrorCode, LeaveReason, ServerFrame};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;
