//! Composition root: one fabric instance wires the swarm, the direct
//! sessions, and the gateway together and exposes a single command
//! transport to the embedder.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::FabricConfig;
use crate::error::FabricError;
use crate::gateway;
use crate::protocol::{CommandKind, Signal, SyncCommand, SIGNALING_EXTENSION, SYNC_EXTENSION};
use crate::session::{SessionEvent, SessionManager};
use crate::swarm::{PeerId, ProgressSnapshot, SwarmEvent, SwarmManager};
use crate::sync::Player;

// ── Fabric ──────────────────────────────────────────────────────────────────

/// Events surfaced to the embedder. Transport details are flattened out:
/// a command is a command whether it arrived over a direct session or the
/// swarm relay.
#[derive(Debug, Clone)]
pub enum FabricEvent {
    /// A sync command from `peer`, via either transport. Commands are
    /// idempotent, so a command that arrives twice is harmless.
    Command { peer: PeerId, command: SyncCommand },
    PeerConnected { peer: PeerId },
    PeerDisconnected { peer: PeerId },
    /// A direct session's data channel opened or closed. Purely
    /// informational; command delivery falls back to the relay either way.
    SessionUp { peer: PeerId },
    SessionDown { peer: PeerId },
    Ready { name: String, length: u64 },
    Progress(ProgressSnapshot),
    PeerProgress { peer: PeerId, percent: f64 },
    Done,
}

#[derive(Clone)]
pub struct Fabric {
    inner: Arc<Inner>,
}

struct Inner {
    config: FabricConfig,
    swarm: SwarmManager,
    sessions: SessionManager,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<FabricEvent>>>,
}

impl Fabric {
    /// Bring up the swarm transport and the session machinery and start
    /// the glue between them.
    pub async fn start(config: FabricConfig) -> Result<Self, FabricError> {
        let swarm = SwarmManager::start(&config).await?;
        let sessions =
            SessionManager::new(swarm.peer_id().clone(), config.stun_servers.clone())?;
        let inner = Arc::new(Inner {
            config,
            swarm,
            sessions,
            subscribers: Mutex::new(Vec::new()),
        });
        tokio::spawn(drive_swarm(inner.clone(), inner.swarm.subscribe()));
        tokio::spawn(drive_sessions(inner.clone(), inner.sessions.subscribe()));
        Ok(Self { inner })
    }

    pub fn peer_id(&self) -> &PeerId {
        self.inner.swarm.peer_id()
    }

    pub fn config(&self) -> &FabricConfig {
        &self.inner.config
    }

    pub fn swarm(&self) -> &SwarmManager {
        &self.inner.swarm
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<FabricEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().push(tx);
        rx
    }

    /// Seed a local file and return the magnet link peers join with.
    pub async fn share(&self, path: &Path) -> Result<String, FabricError> {
        self.inner.sessions.clear().await;
        self.inner.swarm.seed(path).await
    }

    /// Join a unit shared by someone else.
    pub async fn join(&self, magnet: &str) -> Result<(), FabricError> {
        self.inner.sessions.clear().await;
        self.inner.swarm.add(magnet).await
    }

    /// Tear down the active unit and every session.
    pub async fn leave(&self) -> Result<(), FabricError> {
        self.inner.swarm.remove().await?;
        self.inner.sessions.clear().await;
        Ok(())
    }

    pub fn magnet(&self) -> Option<String> {
        self.inner.swarm.magnet()
    }

    /// Expose the active unit over HTTP. Returns the bound address.
    pub async fn serve_gateway(&self, addr: SocketAddr) -> Result<SocketAddr, FabricError> {
        gateway::serve(self.inner.swarm.clone(), addr).await
    }

    /// Send a command to every peer, preferring direct sessions and
    /// falling back to the swarm relay per peer. Returns the peers the
    /// command was handed off for.
    pub async fn broadcast(&self, command: &SyncCommand) -> Vec<PeerId> {
        self.inner.broadcast(command).await
    }

    /// Drive host-side heartbeats off the given player until the returned
    /// task is aborted.
    pub fn start_heartbeat(
        &self,
        player: Arc<Mutex<dyn Player + Send>>,
    ) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let interval = self.inner.config.sync.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let heartbeat = {
                    let player = player.lock();
                    SyncCommand::heartbeat(player.position(), player.is_playing())
                };
                inner.broadcast(&heartbeat).await;
            }
        })
    }
}

impl Inner {
    fn emit(&self, event: FabricEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    async fn broadcast(&self, command: &SyncCommand) -> Vec<PeerId> {
        let payload = command.encode();
        let mut reached = self.sessions.broadcast(&payload).await;
        for peer in self.swarm.peers() {
            if reached.contains(&peer) {
                continue;
            }
            if self.swarm.send_extension(&peer, SYNC_EXTENSION, &payload) {
                reached.push(peer);
            }
        }
        reached
    }
}

// ── Glue ────────────────────────────────────────────────────────────────────

async fn drive_swarm(inner: Arc<Inner>, mut events: mpsc::UnboundedReceiver<SwarmEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SwarmEvent::PeerConnected { peer, .. } => {
                if let Err(e) = inner.sessions.add_peer(&peer).await {
                    log::warn!("could not open session with {peer}: {e}");
                }
                inner.emit(FabricEvent::PeerConnected { peer });
            }
            SwarmEvent::PeerDisconnected { peer } => {
                inner.sessions.remove_peer(&peer).await;
                inner.emit(FabricEvent::PeerDisconnected { peer });
            }
            SwarmEvent::ExtensionMessage {
                peer,
                name,
                payload,
            } => dispatch_extension(&inner, peer, &name, &payload).await,
            SwarmEvent::Ready { name, length } => {
                inner.emit(FabricEvent::Ready { name, length })
            }
            SwarmEvent::Progress(snapshot) => {
                // Peers learn our completion over the sync channel.
                let telemetry = SyncCommand::progress(snapshot.percent);
                inner
                    .swarm
                    .broadcast_extension(SYNC_EXTENSION, &telemetry.encode());
                inner.emit(FabricEvent::Progress(snapshot));
            }
            SwarmEvent::PeerProgress { peer, percent } => {
                inner.emit(FabricEvent::PeerProgress { peer, percent })
            }
            SwarmEvent::Done => inner.emit(FabricEvent::Done),
        }
    }
}

async fn dispatch_extension(inner: &Arc<Inner>, peer: PeerId, name: &str, payload: &[u8]) {
    match name {
        SIGNALING_EXTENSION => match Signal::decode(payload) {
            Ok(signal) => {
                if let Err(e) = inner.sessions.handle_signal(&peer, signal).await {
                    log::warn!("signal from {peer} failed: {e}");
                }
            }
            Err(e) => log::warn!("dropping malformed signal from {peer}: {e}"),
        },
        SYNC_EXTENSION => match SyncCommand::decode(payload) {
            // The swarm layer already turned progress telemetry into
            // PeerProgress; everything else surfaces as a command.
            Ok(command) if command.kind != CommandKind::Progress => {
                inner.emit(FabricEvent::Command { peer, command })
            }
            Ok(_) => {}
            Err(e) => log::warn!("dropping malformed command from {peer}: {e}"),
        },
        other => log::debug!("ignoring payload on unknown extension {other} from {peer}"),
    }
}

async fn drive_sessions(inner: Arc<Inner>, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Signal { to, signal } => {
                // Unsupported or departed peers make this a no-op; the
                // session then simply never comes up.
                inner
                    .swarm
                    .send_extension(&to, SIGNALING_EXTENSION, &signal.encode());
            }
            SessionEvent::Connected { peer } => inner.emit(FabricEvent::SessionUp { peer }),
            SessionEvent::Disconnected { peer } => {
                inner.emit(FabricEvent::SessionDown { peer })
            }
            SessionEvent::Message { peer, payload } => match SyncCommand::decode(&payload) {
                Ok(command) => inner.emit(FabricEvent::Command { peer, command }),
                Err(e) => log::warn!("dropping malformed direct command from {peer}: {e}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn start_local() -> Fabric {
        let mut config = FabricConfig::local();
        config.piece_size = 256;
        config.sync.heartbeat_interval = Duration::from_millis(100);
        Fabric::start(config).await.unwrap()
    }

    async fn wait_for(
        events: &mut mpsc::UnboundedReceiver<FabricEvent>,
        pred: impl Fn(&FabricEvent) -> bool,
    ) -> FabricEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.expect("event stream ended");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for fabric event")
    }

    async fn shared_file(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("clip.mp4");
        let content: Vec<u8> = (0..2048u32).map(|i| (i % 251) as u8).collect();
        tokio::fs::write(&path, &content).await.unwrap();
        path
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn commands_reach_joined_peers() {
        let host = start_local().await;
        let guest = start_local().await;
        let dir = tempfile::tempdir().unwrap();
        let path = shared_file(&dir).await;

        let mut host_events = host.subscribe();
        let mut guest_events = guest.subscribe();
        let magnet = host.share(&path).await.unwrap();
        guest.join(&magnet).await.unwrap();

        wait_for(&mut host_events, |e| {
            matches!(e, FabricEvent::PeerConnected { .. })
        })
        .await;
        wait_for(&mut guest_events, |e| matches!(e, FabricEvent::Done)).await;

        let reached = host.broadcast(&SyncCommand::play(12.0)).await;
        assert!(reached.contains(guest.peer_id()));

        let event = wait_for(&mut guest_events, |e| {
            matches!(
                e,
                FabricEvent::Command {
                    command: SyncCommand {
                        kind: CommandKind::Play,
                        ..
                    },
                    ..
                }
            )
        })
        .await;
        let FabricEvent::Command { peer, command } = event else {
            unreachable!()
        };
        assert_eq!(&peer, host.peer_id());
        assert_eq!(command.time, Some(12.0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn malformed_payloads_do_not_poison_the_channel() {
        let host = start_local().await;
        let guest = start_local().await;
        let dir = tempfile::tempdir().unwrap();
        let path = shared_file(&dir).await;

        let mut host_events = host.subscribe();
        let magnet = host.share(&path).await.unwrap();
        guest.join(&magnet).await.unwrap();
        wait_for(&mut host_events, |e| {
            matches!(e, FabricEvent::PeerConnected { .. })
        })
        .await;

        // Garbage on both channels is logged and dropped; the next valid
        // command still comes through.
        guest.swarm().broadcast_extension(SYNC_EXTENSION, b"not json");
        guest
            .swarm()
            .broadcast_extension(SIGNALING_EXTENSION, b"{\"type\":\"bogus\"}");
        guest
            .swarm()
            .broadcast_extension(SYNC_EXTENSION, &SyncCommand::chat("still here").encode());

        let event = wait_for(&mut host_events, |e| {
            matches!(
                e,
                FabricEvent::Command {
                    command: SyncCommand {
                        kind: CommandKind::Chat,
                        ..
                    },
                    ..
                }
            )
        })
        .await;
        let FabricEvent::Command { command, .. } = event else {
            unreachable!()
        };
        assert_eq!(
            command.payload,
            Some(serde_json::Value::String("still here".into()))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn guest_completion_surfaces_as_peer_progress() {
        let host = start_local().await;
        let guest = start_local().await;
        let dir = tempfile::tempdir().unwrap();
        let path = shared_file(&dir).await;

        let mut host_events = host.subscribe();
        let magnet = host.share(&path).await.unwrap();
        guest.join(&magnet).await.unwrap();

        let event = wait_for(&mut host_events, |e| {
            matches!(e, FabricEvent::PeerProgress { percent, .. } if *percent >= 1.0)
        })
        .await;
        let FabricEvent::PeerProgress { peer, .. } = event else {
            unreachable!()
        };
        assert_eq!(&peer, guest.peer_id());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn heartbeat_driver_broadcasts_player_state() {
        let host = start_local().await;
        let guest = start_local().await;
        let dir = tempfile::tempdir().unwrap();
        let path = shared_file(&dir).await;

        let mut guest_events = guest.subscribe();
        let magnet = host.share(&path).await.unwrap();
        guest.join(&magnet).await.unwrap();
        wait_for(&mut guest_events, |e| matches!(e, FabricEvent::Done)).await;

        struct StubPlayer;
        impl Player for StubPlayer {
            fn position(&self) -> f64 {
                42.0
            }
            fn is_playing(&self) -> bool {
                true
            }
            fn play(&mut self) {}
            fn pause(&mut self) {}
            fn seek(&mut self, _time: f64) {}
        }

        let driver = host.start_heartbeat(Arc::new(Mutex::new(StubPlayer)));
        let event = wait_for(&mut guest_events, |e| {
            matches!(
                e,
                FabricEvent::Command {
                    command: SyncCommand {
                        kind: CommandKind::Heartbeat,
                        ..
                    },
                    ..
                }
            )
        })
        .await;
        driver.abort();

        let FabricEvent::Command { command, .. } = event else {
            unreachable!()
        };
        assert_eq!(command.time, Some(42.0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn leave_tears_everything_down() {
        let host = start_local().await;
        let dir = tempfile::tempdir().unwrap();
        let path = shared_file(&dir).await;

        host.share(&path).await.unwrap();
        assert!(host.magnet().is_some());
        host.leave().await.unwrap();
        assert!(host.magnet().is_none());
        assert!(host.broadcast(&SyncCommand::pause(0.0)).await.is_empty());
    }
}
