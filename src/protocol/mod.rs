//! Wire schemas carried over the extension channels and direct sessions.
//!
//! Both schemas are JSON (UTF-8 bytes) and must stay stable between
//! instances of this application: the swarm-layer capability negotiation
//! only checks the extension names, not a schema version.

pub mod command;
pub mod signal;

pub use command::{CommandKind, PlayState, SyncCommand};
pub use signal::Signal;

/// Capability name of the extension channel carrying [`SyncCommand`]s.
pub const SYNC_EXTENSION: &str = "watchalong_sync";

/// Capability name of the extension channel carrying [`Signal`]s.
pub const SIGNALING_EXTENSION: &str = "watchalong_signaling";

/// Milliseconds since the Unix epoch, used as command origination timestamp.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
