use std::net::SocketAddr;
use std::time::Duration;

// ── Defaults ────────────────────────────────────────────────────────────────

/// Announce endpoints baked into every generated magnet link, so that
/// third-party swarm peers can discover the unit through public trackers.
pub const DEFAULT_TRACKERS: &[&str] = &[
    "wss://tracker.openwebtorrent.com",
    "wss://tracker.btorrent.xyz",
    "wss://tracker.files.fm:7073/announce",
    "wss://tracker.webtorrent.dev",
];

/// STUN servers offered to every direct peer session for best-effort
/// NAT traversal.
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:global.stun.twilio.com:3478",
];

/// Piece size for the distribution unit: 64 KB.
const PIECE_SIZE: usize = 64 * 1024;

/// Maximum outstanding piece requests per peer wire.
const MAX_INFLIGHT: usize = 4;

// ── Sync tuning ─────────────────────────────────────────────────────────────

/// Timing constants of the synchronization policy.
///
/// The defaults are the observed working values; none of them is known to
/// be load-bearing, so they are carried as configuration rather than
/// hard-coded.
#[derive(Debug, Clone)]
pub struct SyncTuning {
    /// Positions further apart than this are snapped to the heartbeat.
    pub drift_threshold: f64,
    /// Host-side heartbeat period.
    pub heartbeat_interval: Duration,
    /// Suppression window opened after a drift correction.
    pub drift_suppression: Duration,
    /// Suppression window opened after applying a discrete remote command.
    pub command_suppression: Duration,
    /// Minimum spacing between progress emissions (unless forced).
    pub progress_throttle: Duration,
}

impl Default for SyncTuning {
    fn default() -> Self {
        Self {
            drift_threshold: 2.0,
            heartbeat_interval: Duration::from_millis(2000),
            drift_suppression: Duration::from_millis(500),
            command_suppression: Duration::from_millis(300),
            progress_throttle: Duration::from_millis(500),
        }
    }
}

// ── Fabric configuration ────────────────────────────────────────────────────

/// Top-level configuration for the fabric.
#[derive(Debug, Clone)]
pub struct FabricConfig {
    /// Address the swarm transport listens on. Port 0 picks a free port.
    pub listen_addr: SocketAddr,
    /// Trackers included in generated magnet links.
    pub trackers: Vec<String>,
    /// STUN servers used by direct peer sessions.
    pub stun_servers: Vec<String>,
    /// Distribution unit piece size in bytes.
    pub piece_size: usize,
    /// Maximum outstanding piece requests per peer wire.
    pub max_inflight: usize,
    pub sync: SyncTuning,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:0".parse().expect("static addr"),
            trackers: DEFAULT_TRACKERS.iter().map(|s| s.to_string()).collect(),
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            piece_size: PIECE_SIZE,
            max_inflight: MAX_INFLIGHT,
            sync: SyncTuning::default(),
        }
    }
}

impl FabricConfig {
    /// A configuration suitable for tests: loopback listener, no public
    /// trackers, no STUN.
    pub fn local() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".parse().expect("static addr"),
            trackers: Vec::new(),
            stun_servers: Vec::new(),
            ..Self::default()
        }
    }
}
