//! Distribution swarm: one media file replicated across a small set of
//! peers over a piece-based transport, with named extension channels
//! multiplexed onto every peer wire.

use std::time::{Duration, Instant};

use rand::distributions::Alphanumeric;
use rand::Rng;

pub mod extension;
pub mod magnet;
pub mod manager;
pub mod unit;
pub mod wire;

pub use extension::PeerExtensions;
pub use magnet::MagnetLink;
pub use manager::SwarmManager;
pub use unit::{DistributionUnit, UnitMetadata};

/// Swarm peer identifier: an azureus-style 20-character id, `-WA0001-`
/// followed by 12 random alphanumerics. Compared lexicographically when
/// electing a session initiator.
pub type PeerId = String;

const PEER_ID_PREFIX: &str = "-WA0001-";

pub fn generate_peer_id() -> PeerId {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect();
    format!("{PEER_ID_PREFIX}{suffix}")
}

// ── Events ──────────────────────────────────────────────────────────────────

/// Events emitted by the [`SwarmManager`] to its subscribers.
#[derive(Debug, Clone)]
pub enum SwarmEvent {
    PeerConnected {
        peer: PeerId,
        addr: std::net::SocketAddr,
    },
    PeerDisconnected {
        peer: PeerId,
    },
    /// Metadata for the active unit is known; range reads can now resolve.
    Ready {
        name: String,
        length: u64,
    },
    /// Local completion telemetry, throttled.
    Progress(ProgressSnapshot),
    /// A remote peer reported its completion over the sync extension.
    PeerProgress {
        peer: PeerId,
        percent: f64,
    },
    /// The local replica became complete. Emitted at most once per unit.
    Done,
    /// An extension-channel payload arrived from a peer.
    ExtensionMessage {
        peer: PeerId,
        name: String,
        payload: Vec<u8>,
    },
}

/// Point-in-time view of the active unit's replication state.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    /// Completion fraction in `0.0..=1.0`.
    pub percent: f64,
    pub downloaded: u64,
    pub uploaded: u64,
    pub length: u64,
    pub peers: usize,
    /// Bytes per second, averaged between emissions.
    pub download_rate: f64,
    pub upload_rate: f64,
    pub done: bool,
}

// ── Progress throttle ───────────────────────────────────────────────────────

/// Rate limit on progress emissions.
///
/// Ordinary updates are spaced at least `interval` apart; forced updates
/// (peer attach, metadata arrival, completion) always pass.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Whether an emission may go out at `now`; records the emission when
    /// it does.
    pub fn admit(&mut self, now: Instant, force: bool) -> bool {
        let due = match self.last {
            None => true,
            Some(last) => now.duration_since(last) >= self.interval,
        };
        if force || due {
            self.last = Some(now);
            true
        } else {
            false
        }
    }
}

// ── Rate meter ──────────────────────────────────────────────────────────────

/// Byte-per-second transfer rates, averaged between samples.
#[derive(Debug, Default)]
pub struct RateMeter {
    last: Option<(Instant, u64, u64)>,
    download: f64,
    upload: f64,
}

impl RateMeter {
    pub fn sample(&mut self, now: Instant, downloaded: u64, uploaded: u64) {
        if let Some((then, down, up)) = self.last {
            let elapsed = now.duration_since(then).as_secs_f64();
            if elapsed > 0.0 {
                self.download = downloaded.saturating_sub(down) as f64 / elapsed;
                self.upload = uploaded.saturating_sub(up) as f64 / elapsed;
            }
        }
        self.last = Some((now, downloaded, uploaded));
    }

    pub fn download(&self) -> f64 {
        self.download
    }

    pub fn upload(&self) -> f64 {
        self.upload
    }
}
