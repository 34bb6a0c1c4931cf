//! sshgate-core: Shared protocol library for the SSH browser gateway.
//!
//! Provides the JSON message envelopes exchanged over the gateway socket,
//! the text-frame codec, incremental UTF-8 decoding for terminal output,
//! and the error taxonomy shared by the server.

pub mod codec;
pub mod error;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{decode, encode, Inbound, Utf8Decoder};
pub use error::{GateError, GateResult};
pub use messages::{
    ClientMessage, ContainerStats, FileEntry, MonitorPayload, ServerMessage, SystemStats,
};
