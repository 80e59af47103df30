use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Notify};

use crate::config::FabricConfig;
use crate::error::FabricError;
use crate::protocol::{SyncCommand, SYNC_EXTENSION};
use crate::swarm::extension::{local_capabilities, PeerExtensions};
use crate::swarm::magnet::{encode_hex, MagnetLink};
use crate::swarm::unit::{DistributionUnit, StoreOutcome, UnitMetadata};
use crate::swarm::wire::{read_frame, write_frame, Frame};
use crate::swarm::{
    generate_peer_id, PeerId, ProgressSnapshot, ProgressThrottle, RateMeter, SwarmEvent,
};

/// File extensions accepted as a distribution unit's payload.
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "webm", "mkv", "avi"];

// ── Swarm manager ───────────────────────────────────────────────────────────

/// Owns the single active distribution unit and every peer wire attached
/// to it.
///
/// At most one unit is active at a time; `seed` and `add` tear down the
/// previous unit first, and lifecycle operations are serialized so a
/// replace can never interleave with another replace or removal. All
/// shared state sits behind one non-async mutex that is never held across
/// an await; peer tasks communicate with their wires through per-peer
/// frame queues.
#[derive(Clone)]
pub struct SwarmManager {
    inner: Arc<Inner>,
}

struct Inner {
    peer_id: PeerId,
    local_addr: SocketAddr,
    trackers: Vec<String>,
    piece_size: usize,
    max_inflight: usize,
    progress_interval: std::time::Duration,
    active: Mutex<Option<ActiveUnit>>,
    /// Serializes seed/add/remove. Never held while `active` is locked
    /// for longer than a swap.
    lifecycle: tokio::sync::Mutex<()>,
    next_generation: AtomicU64,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<SwarmEvent>>>,
    /// Signalled whenever readiness or piece availability advances, and
    /// on teardown, so range waiters re-check.
    ready: Notify,
}

enum UnitState {
    /// Magnet accepted, metadata not yet received from any peer.
    Pending,
    Ready(DistributionUnit),
}

struct ActiveUnit {
    generation: u64,
    info_hash: [u8; 20],
    magnet: String,
    state: UnitState,
    peers: HashMap<PeerId, PeerHandle>,
    peer_progress: HashMap<PeerId, f64>,
    /// Piece indexes requested and not yet received, across all wires.
    inflight: HashSet<u32>,
    uploaded: u64,
    rates: RateMeter,
    throttle: ProgressThrottle,
    done_emitted: bool,
    shutdown: broadcast::Sender<()>,
}

struct PeerHandle {
    addr: SocketAddr,
    extensions: PeerExtensions,
    have: Vec<bool>,
    inflight: HashSet<u32>,
    tx: mpsc::UnboundedSender<Frame>,
}

impl SwarmManager {
    /// Bind the swarm listener and start accepting peer wires.
    pub async fn start(config: &FabricConfig) -> Result<Self, FabricError> {
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .map_err(FabricError::ClientInit)?;
        let local_addr = listener.local_addr().map_err(FabricError::ClientInit)?;
        let inner = Arc::new(Inner {
            peer_id: generate_peer_id(),
            local_addr,
            trackers: config.trackers.clone(),
            piece_size: config.piece_size,
            max_inflight: config.max_inflight,
            progress_interval: config.sync.progress_throttle,
            active: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            next_generation: AtomicU64::new(1),
            subscribers: Mutex::new(Vec::new()),
            ready: Notify::new(),
        });
        log::info!(
            "swarm transport up as {} on {local_addr}",
            inner.peer_id
        );
        tokio::spawn(accept_loop(inner.clone(), listener));
        Ok(Self { inner })
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.inner.peer_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Register an event subscriber. Dropped receivers are pruned on the
    /// next emission.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SwarmEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().push(tx);
        rx
    }

    /// Seed a local file as a new distribution unit, replacing any active
    /// unit. Returns the magnet link other peers join with.
    pub async fn seed(&self, path: &Path) -> Result<String, FabricError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        if !extension.is_some_and(|e| VIDEO_EXTENSIONS.contains(&e.as_str())) {
            return Err(FabricError::NoVideoFile);
        }
        let data = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("media")
            .to_string();
        // Piece hashing is a full pass over the file; keep it off the
        // event loop.
        let piece_size = self.inner.piece_size;
        let unit = {
            let name = name.clone();
            tokio::task::spawn_blocking(move || DistributionUnit::seed(name, data, piece_size))
                .await
                .map_err(|e| {
                    FabricError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
                })??
        };
        let info_hash = unit.info_hash();
        let length = unit.metadata().length;
        let magnet = MagnetLink {
            info_hash,
            name: Some(name.clone()),
            trackers: self.inner.trackers.clone(),
            peer_hints: vec![self.inner.local_addr],
        }
        .to_uri();

        let active = self.new_active(
            info_hash,
            magnet.clone(),
            UnitState::Ready(unit),
            // Done goes out right below; the piece path must not repeat it.
            true,
        );
        self.install(active);
        log::info!("seeding {name} ({length} bytes) as {}", encode_hex(&info_hash));
        self.inner.emit(SwarmEvent::Ready { name, length });
        self.inner.emit(SwarmEvent::Done);
        Ok(magnet)
    }

    /// Join an existing unit through its magnet link, replacing any
    /// active unit. Resolves as soon as the link is accepted, before any
    /// peer or metadata has been found.
    pub async fn add(&self, magnet: &str) -> Result<(), FabricError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let link = MagnetLink::parse(magnet)?;
        let active = self.new_active(
            link.info_hash,
            magnet.to_string(),
            UnitState::Pending,
            false,
        );
        let generation = active.generation;
        self.install(active);
        log::info!(
            "joining unit {} via {} peer hints",
            encode_hex(&link.info_hash),
            link.peer_hints.len()
        );
        for hint in link.peer_hints {
            if hint == self.inner.local_addr {
                continue;
            }
            tokio::spawn(dial(self.inner.clone(), hint, generation));
        }
        Ok(())
    }

    /// Tear down the active unit, if any. Pending range reads and
    /// readiness waits resolve with an error.
    pub async fn remove(&self) -> Result<(), FabricError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.install_none();
        Ok(())
    }

    fn new_active(
        &self,
        info_hash: [u8; 20],
        magnet: String,
        state: UnitState,
        done_emitted: bool,
    ) -> ActiveUnit {
        let (shutdown, _) = broadcast::channel(1);
        ActiveUnit {
            generation: self.inner.next_generation.fetch_add(1, Ordering::Relaxed),
            info_hash,
            magnet,
            state,
            peers: HashMap::new(),
            peer_progress: HashMap::new(),
            inflight: HashSet::new(),
            uploaded: 0,
            rates: RateMeter::default(),
            throttle: ProgressThrottle::new(self.inner.progress_interval),
            done_emitted,
            shutdown,
        }
    }

    fn install(&self, active: ActiveUnit) {
        let previous = self.inner.active.lock().replace(active);
        self.teardown(previous);
        // The first snapshot goes out on attach, before any peer shows up.
        let mut guard = self.inner.active.lock();
        if let Some(active) = guard.as_mut() {
            emit_progress(&self.inner, active, true);
        }
    }

    fn install_none(&self) {
        let previous = self.inner.active.lock().take();
        self.teardown(previous);
    }

    fn teardown(&self, previous: Option<ActiveUnit>) {
        if let Some(old) = previous {
            log::info!("tearing down unit {}", encode_hex(&old.info_hash));
            let _ = old.shutdown.send(());
        }
        self.inner.ready.notify_waiters();
    }

    /// Magnet link of the active unit.
    pub fn magnet(&self) -> Option<String> {
        self.inner.active.lock().as_ref().map(|a| a.magnet.clone())
    }

    pub fn progress(&self) -> Option<ProgressSnapshot> {
        self.inner.active.lock().as_ref().map(snapshot)
    }

    /// Ids of the peers currently attached to the active unit.
    pub fn peers(&self) -> Vec<PeerId> {
        self.inner
            .active
            .lock()
            .as_ref()
            .map(|a| a.peers.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Latest completion fraction reported by each connected peer.
    pub fn peer_progress(&self) -> HashMap<PeerId, f64> {
        self.inner
            .active
            .lock()
            .as_ref()
            .map(|a| a.peer_progress.clone())
            .unwrap_or_default()
    }

    /// Block until the active unit's metadata is known, returning its
    /// name and length. Errs if the unit is torn down or replaced while
    /// waiting.
    pub async fn wait_ready(&self) -> Result<(String, u64), FabricError> {
        let mut generation = None;
        loop {
            let notified = self.inner.ready.notified();
            {
                let guard = self.inner.active.lock();
                let Some(active) = guard.as_ref() else {
                    return Err(match generation {
                        Some(_) => FabricError::UnitReplaced,
                        None => FabricError::NoActiveUnit,
                    });
                };
                match generation {
                    None => generation = Some(active.generation),
                    Some(g) if g != active.generation => {
                        return Err(FabricError::UnitReplaced)
                    }
                    _ => {}
                }
                if let UnitState::Ready(unit) = &active.state {
                    return Ok((unit.metadata().name.clone(), unit.metadata().length));
                }
            }
            notified.await;
        }
    }

    /// Read an inclusive byte range of the active unit, waiting until
    /// every covering piece has been replicated locally. Errs if the unit
    /// is torn down or replaced while waiting.
    pub async fn read_range(&self, start: u64, end: u64) -> Result<Bytes, FabricError> {
        let mut generation = None;
        loop {
            let notified = self.inner.ready.notified();
            {
                let guard = self.inner.active.lock();
                let Some(active) = guard.as_ref() else {
                    return Err(match generation {
                        Some(_) => FabricError::UnitReplaced,
                        None => FabricError::NoActiveUnit,
                    });
                };
                match generation {
                    None => generation = Some(active.generation),
                    Some(g) if g != active.generation => {
                        return Err(FabricError::UnitReplaced)
                    }
                    _ => {}
                }
                if let UnitState::Ready(unit) = &active.state {
                    let length = unit.metadata().length;
                    if start > end || end >= length {
                        return Err(FabricError::RangeOutOfBounds { start, end, length });
                    }
                    if unit.range_available(start, end) {
                        return unit.read_range(start, end);
                    }
                }
            }
            notified.await;
        }
    }

    /// Send a payload to one peer over a named extension channel. Returns
    /// whether it was queued; a peer that never declared the capability
    /// is a permanent no-op.
    pub fn send_extension(&self, peer: &str, name: &str, payload: &[u8]) -> bool {
        let guard = self.inner.active.lock();
        let Some(handle) = guard.as_ref().and_then(|a| a.peers.get(peer)) else {
            return false;
        };
        if !handle.extensions.supports(name) {
            log::debug!("peer {peer} does not support {name}, dropping payload");
            return false;
        }
        handle
            .tx
            .send(Frame::Extended {
                name: name.to_string(),
                payload: payload.to_vec(),
            })
            .is_ok()
    }

    /// Send a payload to every connected peer that supports the channel.
    /// Returns the ids of peers it was queued for.
    pub fn broadcast_extension(&self, name: &str, payload: &[u8]) -> Vec<PeerId> {
        let guard = self.inner.active.lock();
        let Some(active) = guard.as_ref() else {
            return Vec::new();
        };
        let mut reached = Vec::new();
        for (peer_id, handle) in &active.peers {
            if !handle.extensions.supports(name) {
                continue;
            }
            let sent = handle.tx.send(Frame::Extended {
                name: name.to_string(),
                payload: payload.to_vec(),
            });
            if sent.is_ok() {
                reached.push(peer_id.clone());
            }
        }
        reached
    }
}

impl Inner {
    fn emit(&self, event: SwarmEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

fn snapshot(active: &ActiveUnit) -> ProgressSnapshot {
    let (percent, downloaded, length, done) = match &active.state {
        UnitState::Ready(unit) => (
            unit.percent(),
            unit.downloaded(),
            unit.metadata().length,
            unit.is_complete(),
        ),
        UnitState::Pending => (0.0, 0, 0, false),
    };
    ProgressSnapshot {
        percent,
        downloaded,
        uploaded: active.uploaded,
        length,
        peers: active.peers.len(),
        download_rate: active.rates.download(),
        upload_rate: active.rates.upload(),
        done,
    }
}

fn emit_progress(inner: &Inner, active: &mut ActiveUnit, force: bool) {
    let now = Instant::now();
    if active.throttle.admit(now, force) {
        let downloaded = match &active.state {
            UnitState::Ready(unit) => unit.downloaded(),
            UnitState::Pending => 0,
        };
        active.rates.sample(now, downloaded, active.uploaded);
        inner.emit(SwarmEvent::Progress(snapshot(active)));
    }
}

// ── Peer wires ──────────────────────────────────────────────────────────────

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let inner = inner.clone();
                tokio::spawn(async move {
                    if let Err(e) = run_wire(inner, stream, addr).await {
                        log::debug!("wire from {addr} ended: {e}");
                    }
                });
            }
            Err(e) => log::warn!("accept failed: {e}"),
        }
    }
}

async fn dial(inner: Arc<Inner>, addr: SocketAddr, generation: u64) {
    // The unit may be replaced between spawn and connect; run_wire
    // re-checks against the live generation.
    {
        let guard = inner.active.lock();
        if !matches!(guard.as_ref(), Some(a) if a.generation == generation) {
            return;
        }
    }
    match TcpStream::connect(addr).await {
        Ok(stream) => {
            if let Err(e) = run_wire(inner, stream, addr).await {
                log::debug!("wire to {addr} ended: {e}");
            }
        }
        Err(e) => log::debug!("peer hint {addr} unreachable: {e}"),
    }
}

/// Drive one peer wire from handshake to disconnect.
async fn run_wire(
    inner: Arc<Inner>,
    stream: TcpStream,
    addr: SocketAddr,
) -> std::io::Result<()> {
    // Frames are small and latency-bound; without this, Nagle plus
    // delayed ACKs caps the request/piece exchange at a few round trips
    // per hundred milliseconds.
    let _ = stream.set_nodelay(true);
    let (generation, info_hash, mut shutdown) = {
        let guard = inner.active.lock();
        match guard.as_ref() {
            Some(active) => (
                active.generation,
                active.info_hash,
                active.shutdown.subscribe(),
            ),
            None => return Ok(()),
        }
    };

    let (mut read_half, mut write_half) = stream.into_split();
    write_frame(
        &mut write_half,
        &Frame::Handshake {
            info_hash,
            peer_id: inner.peer_id.clone(),
            capabilities: local_capabilities(),
        },
    )
    .await?;

    let (peer_id, capabilities) = match read_frame(&mut read_half).await? {
        Frame::Handshake {
            info_hash: theirs,
            peer_id,
            capabilities,
        } if theirs == info_hash => (peer_id, capabilities),
        Frame::Handshake { .. } => {
            log::warn!("peer at {addr} handshook for a different unit");
            return Ok(());
        }
        _ => {
            log::warn!("peer at {addr} spoke before handshaking");
            return Ok(());
        }
    };
    if peer_id == inner.peer_id {
        // Our own hint pointed back at us.
        return Ok(());
    }

    let (tx, mut frames) = mpsc::unbounded_channel::<Frame>();
    let writer = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            if let Err(e) = write_frame(&mut write_half, &frame).await {
                log::debug!("write failed: {e}");
                break;
            }
        }
    });

    let registered = {
        let mut guard = inner.active.lock();
        match guard.as_mut().filter(|a| a.generation == generation) {
            Some(active) if !active.peers.contains_key(&peer_id) => {
                if let UnitState::Ready(unit) = &active.state {
                    let _ = tx.send(Frame::Metadata(unit.metadata().clone()));
                    let _ = tx.send(Frame::Bitfield(unit.bitfield()));
                }
                active.peers.insert(
                    peer_id.clone(),
                    PeerHandle {
                        addr,
                        extensions: PeerExtensions::from_handshake(capabilities),
                        have: Vec::new(),
                        inflight: HashSet::new(),
                        tx,
                    },
                );
                inner.emit(SwarmEvent::PeerConnected {
                    peer: peer_id.clone(),
                    addr,
                });
                emit_progress(&inner, active, true);
                true
            }
            // Unit replaced underneath us, or a duplicate wire from a
            // simultaneous dial; the first wire wins.
            _ => false,
        }
    };
    if !registered {
        writer.abort();
        return Ok(());
    }
    log::info!("peer {peer_id} connected from {addr}");

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            frame = read_frame(&mut read_half) => match frame {
                Ok(frame) => handle_frame(&inner, generation, &peer_id, frame),
                Err(e) => {
                    log::debug!("wire with {peer_id} closed: {e}");
                    break;
                }
            },
        }
    }

    writer.abort();
    remove_peer(&inner, generation, &peer_id);
    Ok(())
}

fn remove_peer(inner: &Inner, generation: u64, peer_id: &PeerId) {
    let mut guard = inner.active.lock();
    let Some(active) = guard.as_mut().filter(|a| a.generation == generation) else {
        return;
    };
    let Some(handle) = active.peers.remove(peer_id) else {
        return;
    };
    for index in handle.inflight {
        active.inflight.remove(&index);
    }
    active.peer_progress.remove(peer_id);
    log::info!("peer {peer_id} disconnected");
    inner.emit(SwarmEvent::PeerDisconnected {
        peer: peer_id.clone(),
    });
    emit_progress(inner, active, true);
    // Requests that died with the wire go back out to remaining peers.
    let others: Vec<PeerId> = active.peers.keys().cloned().collect();
    for other in others {
        schedule_requests(active, &other, inner.max_inflight);
    }
}

fn handle_frame(inner: &Inner, generation: u64, peer_id: &PeerId, frame: Frame) {
    let mut guard = inner.active.lock();
    let Some(active) = guard.as_mut().filter(|a| a.generation == generation) else {
        return;
    };
    match frame {
        Frame::Handshake { .. } => {
            log::debug!("peer {peer_id} re-sent a handshake, ignoring");
        }
        Frame::Metadata(metadata) => handle_metadata(inner, active, peer_id, metadata),
        Frame::Bitfield(bits) => {
            if let Some(peer) = active.peers.get_mut(peer_id) {
                peer.have = bits;
            }
            schedule_requests(active, peer_id, inner.max_inflight);
        }
        Frame::Have(index) => {
            if let Some(peer) = active.peers.get_mut(peer_id) {
                let i = index as usize;
                if peer.have.len() <= i {
                    peer.have.resize(i + 1, false);
                }
                peer.have[i] = true;
            }
            schedule_requests(active, peer_id, inner.max_inflight);
        }
        Frame::Request(index) => {
            let piece = match &active.state {
                UnitState::Ready(unit) => unit.read_piece(index),
                UnitState::Pending => None,
            };
            match piece {
                Some(data) => {
                    let served = data.len() as u64;
                    if let Some(peer) = active.peers.get(peer_id) {
                        if peer.tx.send(Frame::Piece { index, data }).is_ok() {
                            active.uploaded += served;
                            emit_progress(inner, active, false);
                        }
                    }
                }
                None => log::debug!("peer {peer_id} requested piece {index} we lack"),
            }
        }
        Frame::Piece { index, data } => {
            active.inflight.remove(&index);
            if let Some(peer) = active.peers.get_mut(peer_id) {
                peer.inflight.remove(&index);
            }
            let outcome = match &mut active.state {
                UnitState::Ready(unit) => unit.store_piece(index, &data),
                UnitState::Pending => StoreOutcome::Rejected,
            };
            match outcome {
                StoreOutcome::Stored => {
                    for handle in active.peers.values() {
                        let _ = handle.tx.send(Frame::Have(index));
                    }
                    inner.ready.notify_waiters();
                    let complete =
                        matches!(&active.state, UnitState::Ready(u) if u.is_complete());
                    emit_progress(inner, active, complete);
                    if complete && !active.done_emitted {
                        active.done_emitted = true;
                        log::info!("unit {} fully replicated", encode_hex(&active.info_hash));
                        inner.emit(SwarmEvent::Done);
                    }
                }
                StoreOutcome::Duplicate => {}
                StoreOutcome::Rejected => {
                    log::warn!("peer {peer_id} sent unusable piece {index}");
                }
            }
            schedule_requests(active, peer_id, inner.max_inflight);
        }
        Frame::Extended { name, payload } => {
            // Completion telemetry on the sync channel also feeds the
            // per-peer progress map; everything else is opaque here.
            if name == SYNC_EXTENSION {
                if let Ok(command) = SyncCommand::decode(&payload) {
                    if let Some(percent) = command.progress_percent() {
                        active.peer_progress.insert(peer_id.clone(), percent);
                        inner.emit(SwarmEvent::PeerProgress {
                            peer: peer_id.clone(),
                            percent,
                        });
                    }
                }
            }
            inner.emit(SwarmEvent::ExtensionMessage {
                peer: peer_id.clone(),
                name,
                payload,
            });
        }
    }
}

fn handle_metadata(
    inner: &Inner,
    active: &mut ActiveUnit,
    peer_id: &PeerId,
    metadata: UnitMetadata,
) {
    if !matches!(active.state, UnitState::Pending) {
        return;
    }
    if metadata.info_hash() != active.info_hash {
        log::warn!("peer {peer_id} sent metadata for a different unit");
        return;
    }
    let name = metadata.name.clone();
    let length = metadata.length;
    let empty_bitfield = vec![false; metadata.piece_count()];
    active.state = UnitState::Ready(DistributionUnit::from_metadata(metadata));
    log::info!("metadata resolved: {name} ({length} bytes)");
    inner.emit(SwarmEvent::Ready { name, length });
    emit_progress(inner, active, true);
    inner.ready.notify_waiters();
    for handle in active.peers.values() {
        let _ = handle.tx.send(Frame::Bitfield(empty_bitfield.clone()));
    }
    let peers: Vec<PeerId> = active.peers.keys().cloned().collect();
    for peer in peers {
        schedule_requests(active, &peer, inner.max_inflight);
    }
}

/// Fill this peer's request pipeline with missing pieces it can serve.
fn schedule_requests(active: &mut ActiveUnit, peer_id: &str, max_inflight: usize) {
    let missing: Vec<u32> = match &active.state {
        UnitState::Ready(unit) if !unit.is_complete() => unit.missing_pieces().collect(),
        _ => return,
    };
    let ActiveUnit {
        inflight, peers, ..
    } = active;
    let Some(peer) = peers.get_mut(peer_id) else {
        return;
    };
    for index in missing {
        if peer.inflight.len() >= max_inflight {
            break;
        }
        if inflight.contains(&index) {
            continue;
        }
        if !peer.have.get(index as usize).copied().unwrap_or(false) {
            continue;
        }
        if peer.tx.send(Frame::Request(index)).is_ok() {
            inflight.insert(index);
            peer.inflight.insert(index);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::protocol::SIGNALING_EXTENSION;

    async fn start_local() -> SwarmManager {
        let mut config = FabricConfig::local();
        config.piece_size = 256;
        SwarmManager::start(&config).await.unwrap()
    }

    async fn wait_for(
        events: &mut mpsc::UnboundedReceiver<SwarmEvent>,
        pred: impl Fn(&SwarmEvent) -> bool,
    ) -> SwarmEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.expect("event stream ended");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    fn test_payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn seed_file(dir: &tempfile::TempDir, content: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join("clip.mp4");
        tokio::fs::write(&path, content).await.unwrap();
        path
    }

    #[tokio::test]
    async fn leech_replicates_seeded_unit() {
        let seeder = start_local().await;
        let leech = start_local().await;
        let dir = tempfile::tempdir().unwrap();
        let content = test_payload(4096);
        let path = seed_file(&dir, &content).await;

        let magnet = seeder.seed(&path).await.unwrap();
        assert!(magnet.contains("xt=urn:btih:"));

        let mut events = leech.subscribe();
        leech.add(&magnet).await.unwrap();
        wait_for(&mut events, |e| matches!(e, SwarmEvent::Done)).await;

        let bytes = leech
            .read_range(0, content.len() as u64 - 1)
            .await
            .unwrap();
        assert_eq!(&bytes[..], &content[..]);
        let progress = leech.progress().unwrap();
        assert!(progress.done);
        assert_eq!(progress.percent, 1.0);
    }

    #[tokio::test]
    async fn seeding_rejects_non_video_payloads() {
        let manager = start_local().await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        tokio::fs::write(&path, b"hello").await.unwrap();
        assert!(matches!(
            manager.seed(&path).await,
            Err(FabricError::NoVideoFile)
        ));
        assert!(manager.progress().is_none());
    }

    #[tokio::test]
    async fn add_resolves_before_any_metadata() {
        let leech = start_local().await;
        let mut events = leech.subscribe();
        let magnet = MagnetLink {
            info_hash: [9u8; 20],
            name: Some("ghost.mp4".into()),
            trackers: vec![],
            peer_hints: vec![],
        }
        .to_uri();
        leech.add(&magnet).await.unwrap();

        // Attach emits a snapshot right away, before anything is known.
        let event = wait_for(&mut events, |e| matches!(e, SwarmEvent::Progress(_))).await;
        let SwarmEvent::Progress(progress) = event else {
            unreachable!()
        };
        assert_eq!(progress.length, 0);
        assert!(!progress.done);
        // No peer can provide metadata, so readiness never arrives.
        let waited =
            tokio::time::timeout(Duration::from_millis(200), leech.wait_ready()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn seeding_announces_done_and_initial_progress() {
        let seeder = start_local().await;
        let dir = tempfile::tempdir().unwrap();
        let path = seed_file(&dir, &test_payload(1024)).await;

        let mut events = seeder.subscribe();
        seeder.seed(&path).await.unwrap();

        let event = wait_for(&mut events, |e| matches!(e, SwarmEvent::Progress(_))).await;
        let SwarmEvent::Progress(progress) = event else {
            unreachable!()
        };
        assert!(progress.done);
        assert_eq!(progress.percent, 1.0);
        assert_eq!(progress.peers, 0);
        wait_for(&mut events, |e| matches!(e, SwarmEvent::Done)).await;
    }

    #[tokio::test]
    async fn peer_departure_reemits_progress() {
        let seeder = start_local().await;
        let leech = start_local().await;
        let dir = tempfile::tempdir().unwrap();
        let path = seed_file(&dir, &test_payload(512)).await;

        let mut seeder_events = seeder.subscribe();
        let magnet = seeder.seed(&path).await.unwrap();
        leech.add(&magnet).await.unwrap();
        wait_for(&mut seeder_events, |e| {
            matches!(e, SwarmEvent::PeerConnected { .. })
        })
        .await;

        leech.remove().await.unwrap();
        wait_for(&mut seeder_events, |e| {
            matches!(e, SwarmEvent::PeerDisconnected { .. })
        })
        .await;
        // The departure forces a fresh snapshot with the peer gone.
        let event = wait_for(&mut seeder_events, |e| {
            matches!(e, SwarmEvent::Progress(p) if p.peers == 0)
        })
        .await;
        let SwarmEvent::Progress(progress) = event else {
            unreachable!()
        };
        assert_eq!(progress.peers, 0);
    }

    #[tokio::test]
    async fn range_read_waits_for_covering_pieces() {
        let seeder = start_local().await;
        let leech = start_local().await;
        let dir = tempfile::tempdir().unwrap();
        let content = test_payload(2048);
        let path = seed_file(&dir, &content).await;

        let magnet = seeder.seed(&path).await.unwrap();
        leech.add(&magnet).await.unwrap();

        // Issued immediately after add, before metadata or pieces exist;
        // must resolve once replication catches up.
        let bytes = tokio::time::timeout(
            Duration::from_secs(5),
            leech.read_range(1000, 1999),
        )
        .await
        .expect("range read timed out")
        .unwrap();
        assert_eq!(&bytes[..], &content[1000..2000]);
    }

    #[tokio::test]
    async fn extension_payloads_reach_supporting_peers() {
        let seeder = start_local().await;
        let leech = start_local().await;
        let dir = tempfile::tempdir().unwrap();
        let path = seed_file(&dir, &test_payload(512)).await;

        let mut seeder_events = seeder.subscribe();
        let mut leech_events = leech.subscribe();
        let magnet = seeder.seed(&path).await.unwrap();
        leech.add(&magnet).await.unwrap();
        wait_for(&mut seeder_events, |e| {
            matches!(e, SwarmEvent::PeerConnected { .. })
        })
        .await;
        wait_for(&mut leech_events, |e| {
            matches!(e, SwarmEvent::PeerConnected { .. })
        })
        .await;

        let payload = br#"{"type":"offer","sdp":"v=0"}"#;
        let reached = leech.broadcast_extension(SIGNALING_EXTENSION, payload);
        assert_eq!(reached, vec![seeder.peer_id().clone()]);

        let event = wait_for(&mut seeder_events, |e| {
            matches!(e, SwarmEvent::ExtensionMessage { .. })
        })
        .await;
        let SwarmEvent::ExtensionMessage {
            peer,
            name,
            payload: received,
        } = event
        else {
            unreachable!()
        };
        assert_eq!(&peer, leech.peer_id());
        assert_eq!(name, SIGNALING_EXTENSION);
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn progress_telemetry_feeds_peer_progress_map() {
        let seeder = start_local().await;
        let leech = start_local().await;
        let dir = tempfile::tempdir().unwrap();
        let path = seed_file(&dir, &test_payload(512)).await;

        let mut seeder_events = seeder.subscribe();
        let mut leech_events = leech.subscribe();
        let magnet = seeder.seed(&path).await.unwrap();
        leech.add(&magnet).await.unwrap();
        wait_for(&mut leech_events, |e| {
            matches!(e, SwarmEvent::PeerConnected { .. })
        })
        .await;

        let command = SyncCommand::progress(0.5);
        leech.broadcast_extension(SYNC_EXTENSION, &command.encode());

        let event = wait_for(&mut seeder_events, |e| {
            matches!(e, SwarmEvent::PeerProgress { .. })
        })
        .await;
        let SwarmEvent::PeerProgress { peer, percent } = event else {
            unreachable!()
        };
        assert_eq!(&peer, leech.peer_id());
        assert_eq!(percent, 0.5);
        assert_eq!(
            seeder.peer_progress().get(leech.peer_id()).copied(),
            Some(0.5)
        );
    }

    #[tokio::test]
    async fn teardown_unblocks_pending_waiters() {
        let leech = start_local().await;
        let magnet = MagnetLink {
            info_hash: [3u8; 20],
            name: None,
            trackers: vec![],
            peer_hints: vec![],
        }
        .to_uri();
        leech.add(&magnet).await.unwrap();

        let waiter = {
            let leech = leech.clone();
            tokio::spawn(async move { leech.wait_ready().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        leech.remove().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter did not finish")
            .unwrap();
        assert!(matches!(result, Err(FabricError::UnitReplaced)));
        assert!(leech.progress().is_none());
        assert!(leech.magnet().is_none());
    }

    #[tokio::test]
    async fn extension_send_to_unknown_peer_is_a_no_op() {
        let manager = start_local().await;
        assert!(!manager.send_extension("-WA0001-nosuchpeer00", SYNC_EXTENSION, b"{}"));
        assert!(manager
            .broadcast_extension(SYNC_EXTENSION, b"{}")
            .is_empty());
    }
}
