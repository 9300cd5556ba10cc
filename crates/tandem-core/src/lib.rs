//! # tandem-core
//!
//! Pairing engine and event routing for the Tandem anonymous chat server.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Registry** - Live connections and their outbound channels
//! - **Engine** - Waiting queue, pair table, join and teardown
//! - **Router** - Relays messages and typing indicators to the partner
//! - **Event** - Events emitted to a single connection
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│   Engine    │────▶│  Registry   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        │                   ▲                   ▲
//!        │            ┌─────────────┐            │
//!        └───────────▶│   Router    │────────────┘
//!                     └─────────────┘
//! ```
//!
//! The engine lock is the single serialization point for pairing state.
//! Lock order is always engine, then registry.

pub mod engine;
pub mod event;
pub mod name;
pub mod registry;
pub mod router;

pub use engine::{
    EngineConfig, EngineStats, InvariantViolation, JoinOutcome, PairingEngine, PairingError,
    ParticipantStatus, TeardownOutcome,
};
pub use event::{ChatEvent, RelayEvent};
pub use name::{DisplayName, DEFAULT_DISPLAY_NAME, DEFAULT_MAX_NAME_CHARS};
pub use registry::{ChannelRegistry, ConnectionId, ConnectionRegistry, Inbox, Outbox};
pub use router::{EventRouter, RouteOutcome};
