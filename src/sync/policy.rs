use std::time::Instant;

use crate::config::SyncTuning;
use crate::protocol::{CommandKind, PlayState, SyncCommand};
use crate::sync::Player;

// ── Sync policy ─────────────────────────────────────────────────────────────

/// What a remote command did to the local player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// A discrete transport command was executed.
    Transport,
    /// A heartbeat corrected drift by snapping the position.
    DriftCorrected,
    /// Nothing needed doing, or the command carries no transport meaning.
    NoOp,
}

/// Drift-correction state machine between the local player and remote
/// commands.
///
/// Two suppression windows keep corrections from echoing: applying any
/// remote transport command opens the command window, and snapping to a
/// heartbeat opens the drift window. The windows gate outbound traffic
/// only: while either is open the caller must not rebroadcast locally
/// observed player events ([`suppress_local`]). Inbound commands and
/// heartbeats always apply.
///
/// [`suppress_local`]: SyncPolicy::suppress_local
pub struct SyncPolicy {
    tuning: SyncTuning,
    drift_until: Option<Instant>,
    command_until: Option<Instant>,
}

impl SyncPolicy {
    pub fn new(tuning: SyncTuning) -> Self {
        Self {
            tuning,
            drift_until: None,
            command_until: None,
        }
    }

    /// Whether locally observed player events must be swallowed instead
    /// of broadcast, because they were caused by a remote correction.
    pub fn suppress_local(&self, now: Instant) -> bool {
        self.window_open(self.command_until, now) || self.window_open(self.drift_until, now)
    }

    fn window_open(&self, until: Option<Instant>, now: Instant) -> bool {
        until.is_some_and(|deadline| now < deadline)
    }

    /// Apply a remote command to the local player.
    pub fn apply_remote(
        &mut self,
        player: &mut dyn Player,
        command: &SyncCommand,
        now: Instant,
    ) -> Applied {
        match command.kind {
            CommandKind::Play => {
                self.reconcile_position(player, command.time);
                player.play();
                self.command_until = Some(now + self.tuning.command_suppression);
                Applied::Transport
            }
            CommandKind::Pause => {
                self.reconcile_position(player, command.time);
                player.pause();
                self.command_until = Some(now + self.tuning.command_suppression);
                Applied::Transport
            }
            CommandKind::Seek => {
                // Seeks within the drift threshold are buffering jitter,
                // not intent; leave the player alone.
                if !self.reconcile_position(player, command.time) {
                    return Applied::NoOp;
                }
                self.command_until = Some(now + self.tuning.command_suppression);
                Applied::Transport
            }
            CommandKind::Heartbeat => self.apply_heartbeat(player, command, now),
            // Telemetry and chat never touch the player.
            CommandKind::Progress | CommandKind::Chat | CommandKind::StartRoom => Applied::NoOp,
        }
    }

    /// Move the player to `time` if it is more than the drift threshold
    /// away. Returns whether a seek happened.
    fn reconcile_position(&self, player: &mut dyn Player, time: Option<f64>) -> bool {
        let Some(time) = time else {
            return false;
        };
        if (player.position() - time).abs() > self.tuning.drift_threshold {
            player.seek(time);
            true
        } else {
            false
        }
    }

    fn apply_heartbeat(
        &mut self,
        player: &mut dyn Player,
        command: &SyncCommand,
        now: Instant,
    ) -> Applied {
        let Some(remote_time) = command.time else {
            return Applied::NoOp;
        };
        let drift = (player.position() - remote_time).abs();
        if drift <= self.tuning.drift_threshold {
            // Within tolerance the heartbeat is informational only.
            return Applied::NoOp;
        }
        log::debug!("drift {drift:.2}s exceeds threshold, snapping to {remote_time:.2}s");
        player.seek(remote_time);
        let remote_playing = matches!(command.state, Some(PlayState::Playing));
        if remote_playing != player.is_playing() {
            if remote_playing {
                player.play();
            } else {
                player.pause();
            }
        }
        self.drift_until = Some(now + self.tuning.drift_suppression);
        Applied::DriftCorrected
    }

    /// Build the heartbeat a host emits for its current player state.
    pub fn heartbeat(&self, player: &dyn Player) -> SyncCommand {
        SyncCommand::heartbeat(player.position(), player.is_playing())
    }
}
