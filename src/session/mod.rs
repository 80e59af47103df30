//! Direct low-latency peer sessions over WebRTC data channels.
//!
//! Sessions piggyback on the swarm for discovery and signaling: offers,
//! answers and ICE candidates travel over the signaling extension channel,
//! and once a data channel opens it carries sync commands with lower
//! latency than the swarm relay.

pub mod manager;

pub use manager::{SessionEvent, SessionManager};

/// Name of the data channel carrying sync commands once a session is up.
pub const DATA_CHANNEL_LABEL: &str = "watchalong-sync";

/// Whether the local peer opens the session toward `remote`.
///
/// Exactly one side of each pair initiates: the one with the
/// lexicographically greater peer id. This keeps two peers that learn of
/// each other simultaneously from producing colliding offers.
pub fn is_initiator(local: &str, remote: &str) -> bool {
    local > remote
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exactly_one_side_initiates() {
        let a = "-WA0001-aaaaaaaaaaaa";
        let b = "-WA0001-bbbbbbbbbbbb";
        assert!(is_initiator(b, a));
        assert!(!is_initiator(a, b));
        assert!(!is_initiator(a, a));
    }
}
