use serde::{Deserialize, Serialize};

// ── Signals ─────────────────────────────────────────────────────────────────

/// Connection-negotiation messages relayed over the signaling extension.
///
/// Wire form (JSON):
/// `{ "type": "offer"|"answer"|"candidate", "sdp"?, "candidate"?, "mid"? }`
///
/// Signals are ephemeral: a lost signal is never retried, it only leaves
/// that one peer unreachable for a direct session (the swarm relay still
/// carries commands to it).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Signal {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    Candidate {
        candidate: String,
        /// Media-line identifier; absent candidates still apply.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mid: Option<String>,
    },
}

impl Signal {
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::Offer { .. } => "offer",
            Signal::Answer { .. } => "answer",
            Signal::Candidate { .. } => "candidate",
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
