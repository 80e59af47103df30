//! Playback synchronization: reconciling the local player against remote
//! commands without feedback loops.

pub mod policy;

pub use policy::{Applied, SyncPolicy};

/// The local playback surface the policy steers.
///
/// Implementations wrap whatever actually renders the media; the policy
/// only reads position and state and issues transport calls.
pub trait Player: Send {
    /// Current playback position in seconds.
    fn position(&self) -> f64;
    fn is_playing(&self) -> bool;
    fn play(&mut self);
    fn pause(&mut self);
    fn seek(&mut self, time: f64);
}
