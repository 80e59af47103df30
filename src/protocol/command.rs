use serde::{Deserialize, Serialize};

use crate::protocol::now_millis;

// ── Sync commands ───────────────────────────────────────────────────────────

/// Playback-control and telemetry commands exchanged between peers.
///
/// Wire form (JSON):
/// `{ "type": "play"|"pause"|"seek"|"progress"|"chat"|"heartbeat"|"start-room",
///    "payload"?, "time"?, "state"?: "playing"|"paused", "timestamp" }`
///
/// Commands are fire-and-forget and idempotent under re-delivery; no
/// ordering is assumed beyond "latest heartbeat wins" in the sync policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCommand {
    #[serde(rename = "type")]
    pub kind: CommandKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Playback position in seconds, for transport commands and heartbeats.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
    /// Play/pause state, carried by heartbeats.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<PlayState>,
    /// Origination time in milliseconds since the Unix epoch.
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandKind {
    Play,
    Pause,
    Seek,
    Progress,
    Chat,
    Heartbeat,
    StartRoom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayState {
    Playing,
    Paused,
}

impl SyncCommand {
    fn transport(kind: CommandKind, time: f64) -> Self {
        Self {
            kind,
            payload: None,
            time: Some(time),
            state: None,
            timestamp: now_millis(),
        }
    }

    pub fn play(time: f64) -> Self {
        Self::transport(CommandKind::Play, time)
    }

    pub fn pause(time: f64) -> Self {
        Self::transport(CommandKind::Pause, time)
    }

    pub fn seek(time: f64) -> Self {
        Self::transport(CommandKind::Seek, time)
    }

    pub fn heartbeat(time: f64, playing: bool) -> Self {
        Self {
            kind: CommandKind::Heartbeat,
            payload: None,
            time: Some(time),
            state: Some(if playing {
                PlayState::Playing
            } else {
                PlayState::Paused
            }),
            timestamp: now_millis(),
        }
    }

    /// Completion telemetry: `percent` is a fraction in `0.0..=1.0`.
    pub fn progress(percent: f64) -> Self {
        Self {
            kind: CommandKind::Progress,
            payload: Some(serde_json::json!({ "percent": percent })),
            time: None,
            state: None,
            timestamp: now_millis(),
        }
    }

    pub fn chat(text: &str) -> Self {
        Self {
            kind: CommandKind::Chat,
            payload: Some(serde_json::Value::String(text.to_string())),
            time: None,
            state: None,
            timestamp: now_millis(),
        }
    }

    pub fn start_room() -> Self {
        Self {
            kind: CommandKind::StartRoom,
            payload: None,
            time: None,
            state: None,
            timestamp: now_millis(),
        }
    }

    /// The completion fraction of a progress command, if well-formed.
    pub fn progress_percent(&self) -> Option<f64> {
        if self.kind != CommandKind::Progress {
            return None;
        }
        self.payload.as_ref()?.get("percent")?.as_f64()
    }

    pub fn encode(&self) -> Vec<u8> {
        // A command built from the constructors above always serializes.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
