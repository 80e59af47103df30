use thiserror::Error;

/// Errors surfaced by the fabric's public API.
///
/// Per-peer failures (a malformed command, one session's negotiation
/// failing) are deliberately absent: those are logged at the point of
/// origin and isolated to the offending peer instead of unwinding here.
#[derive(Debug, Error)]
pub enum FabricError {
    /// The swarm transport could not be brought up at all. The fabric
    /// cannot operate; this is the only fatal class.
    #[error("swarm client failed to initialize: {0}")]
    ClientInit(std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid magnet URI: {0}")]
    InvalidMagnet(String),

    #[error("no active distribution unit")]
    NoActiveUnit,

    #[error("no video file in distribution unit")]
    NoVideoFile,

    /// The active distribution unit was torn down while an operation
    /// (a range read, a readiness wait) was still in flight.
    #[error("distribution unit was replaced")]
    UnitReplaced,

    #[error("requested range {start}..={end} outside file of {length} bytes")]
    RangeOutOfBounds { start: u64, end: u64, length: u64 },

    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),
}
