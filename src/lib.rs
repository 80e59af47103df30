//! Peer synchronization and distribution fabric for shared media playback.
//!
//! One media file is distributed to a small swarm of peers, exposed locally
//! as an HTTP byte-range stream, and every peer's playback position is kept
//! within a bounded offset of the host's through a drift-correcting command
//! channel.
//!
//! The layers, bottom up:
//!
//! - [`protocol`]: the two JSON wire schemas, playback commands and
//!   connection-negotiation signals.
//! - [`swarm`]: the distribution unit (seed or leech), the peer wire, and
//!   the capability-negotiated extension channels multiplexed over it.
//! - [`session`]: dedicated low-latency WebRTC data channels between peers,
//!   negotiated over the swarm's own signaling extension.
//! - [`sync`]: the drift-correction and suppression policy that reconciles
//!   local playback against remote commands.
//! - [`gateway`]: the HTTP byte-range responder over the active unit's file.
//! - [`fabric`]: the composition root wiring all of the above together.

pub mod config;
pub mod error;
pub mod fabric;
pub mod gateway;
pub mod logging;
pub mod media;
pub mod protocol;
pub mod session;
pub mod swarm;
pub mod sync;

pub use config::{FabricConfig, SyncTuning};
pub use error::FabricError;
pub use fabric::{Fabric, FabricEvent};
pub use protocol::{Signal, SyncCommand};
pub use swarm::{ProgressSnapshot, SwarmEvent, SwarmManager};
