//! Remote SSH sessions: connection, shell worker, registry.

pub mod channel_slot;
pub mod manager;
pub mod remote;
pub mod shell;

pub use manager::{SessionId, SessionRegistry};
pub use remote::{RemoteHost, RemoteSession};
pub use shell::ShellHandle;
#[cfg(test)]
pub use shell::ShellInput;

