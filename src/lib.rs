//! fiscgate: front-end processor core for ISO 8583 traffic between a
//! bank's channels and the FISC interbank switch.
//!
//! The crate has three load-bearing pieces:
//!
//! - [`FiscClient`]: a long-lived dual-channel (or unified) TCP client
//!   that correlates responses to requests by STAN across sockets, with
//!   sign-on, heartbeat, idle detection, backup failover and bounded
//!   auto-reconnect.
//! - [`PendingTable`]: the concurrent correlation table behind it:
//!   register-before-write, per-entry timeouts, single-fire completion.
//! - [`FiscServer`]: the switch-side counterpart: two listener ports (or
//!   one), per-MTI handlers, institution-id routing, a bounded response
//!   queue with one dispatcher, proactive sends and broadcast.
//!
//! Framing ([`framing`]) and the schema-driven message codec ([`iso`])
//! are shared by both sides.

// Library modules
pub mod client;
pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod framing;
pub mod iso;
pub mod pending;
pub mod server;

// Re-export commonly used types
pub use client::{ClientState, FiscClient};
pub use config::{ClientConfig, Endpoint, FailureStrategy, Mode, ServerConfig};
pub use error::{ChannelSide, FepError};
pub use events::{EventBus, FepEvent};
pub use framing::{FrameDecoder, FramerConfig, LengthEncoding};
pub use iso::{CodecConfig, Message, MessageCodec, Mti, Schema};
pub use pending::{PendingReply, PendingTable};
pub use server::{FiscServer, ReceivedRequest, ServerStats};
