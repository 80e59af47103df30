use crate::protocol::{SIGNALING_EXTENSION, SYNC_EXTENSION};

// ── Extension capabilities ──────────────────────────────────────────────────

/// Extension channels this build speaks. Declared once in the wire
/// handshake.
pub fn local_capabilities() -> Vec<String> {
    vec![SYNC_EXTENSION.to_string(), SIGNALING_EXTENSION.to_string()]
}

/// Capability set a remote peer declared in its handshake.
///
/// Support is decided exactly once per wire: a peer that did not declare
/// a channel never receives frames on it, and there is no renegotiation.
#[derive(Debug, Clone, Default)]
pub struct PeerExtensions {
    names: Vec<String>,
}

impl PeerExtensions {
    pub fn from_handshake(capabilities: Vec<String>) -> Self {
        Self {
            names: capabilities,
        }
    }

    pub fn supports(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_build_declares_both_channels() {
        let caps = local_capabilities();
        assert!(caps.contains(&SYNC_EXTENSION.to_string()));
        assert!(caps.contains(&SIGNALING_EXTENSION.to_string()));
    }

    #[test]
    fn undeclared_channels_are_unsupported() {
        let exts = PeerExtensions::from_handshake(vec![SYNC_EXTENSION.to_string()]);
        assert!(exts.supports(SYNC_EXTENSION));
        assert!(!exts.supports(SIGNALING_EXTENSION));
        assert!(!PeerExtensions::default().supports(SYNC_EXTENSION));
    }
}
