use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::error::FabricError;
use crate::protocol::Signal;
use crate::session::{is_initiator, DATA_CHANNEL_LABEL};
use crate::swarm::PeerId;

// ── Session manager ─────────────────────────────────────────────────────────

/// Events emitted by the [`SessionManager`].
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// An outbound signal that must be relayed to `to` over the swarm's
    /// signaling extension.
    Signal { to: PeerId, signal: Signal },
    /// The data channel with `peer` opened; direct sends now work.
    Connected { peer: PeerId },
    Disconnected { peer: PeerId },
    /// A payload arrived on the data channel from `peer`.
    Message { peer: PeerId, payload: Vec<u8> },
}

/// Owns one peer connection per remote peer and the sync data channel
/// riding on it.
///
/// The registry is single-writer behind a non-async mutex; connection
/// handles are cloned out before any await. A session failure is scoped
/// to its peer: the entry is dropped and everything else keeps running.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    local_peer_id: PeerId,
    stun_servers: Vec<String>,
    api: API,
    peers: Mutex<HashMap<PeerId, SessionHandle>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<SessionEvent>>>,
}

struct SessionHandle {
    connection: Arc<RTCPeerConnection>,
    /// Filled when the channel exists: created up front by the initiator,
    /// delivered via `on_data_channel` on the responder.
    channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
}

impl SessionManager {
    pub fn new(local_peer_id: PeerId, stun_servers: Vec<String>) -> Result<Self, FabricError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self {
            inner: Arc::new(Inner {
                local_peer_id,
                stun_servers,
                api,
                peers: Mutex::new(HashMap::new()),
                subscribers: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().push(tx);
        rx
    }

    /// Begin (or keep) a session with `remote`. Idempotent: an existing
    /// session is left untouched. The initiator side opens the data
    /// channel and emits an offer; the responder just waits for one.
    pub async fn add_peer(&self, remote: &PeerId) -> Result<(), FabricError> {
        if self.inner.peers.lock().contains_key(remote) {
            return Ok(());
        }
        let connection = Arc::new(
            self.inner
                .api
                .new_peer_connection(self.rtc_config())
                .await?,
        );
        install_callbacks(&self.inner, remote.clone(), &connection);

        let lost_race = {
            let mut peers = self.inner.peers.lock();
            if peers.contains_key(remote) {
                true
            } else {
                peers.insert(
                    remote.clone(),
                    SessionHandle {
                        connection: connection.clone(),
                        channel: Arc::new(Mutex::new(None)),
                    },
                );
                false
            }
        };
        if lost_race {
            let _ = connection.close().await;
            return Ok(());
        }

        if is_initiator(&self.inner.local_peer_id, remote) {
            let channel = connection
                .create_data_channel(DATA_CHANNEL_LABEL, None)
                .await?;
            wire_channel(&self.inner, remote.clone(), channel);
            let offer = connection.create_offer(None).await?;
            let sdp = offer.sdp.clone();
            connection.set_local_description(offer).await?;
            log::info!("offering direct session to {remote}");
            self.inner.emit(SessionEvent::Signal {
                to: remote.clone(),
                signal: Signal::Offer { sdp },
            });
        } else {
            log::debug!("awaiting offer from {remote}");
        }
        Ok(())
    }

    /// Apply a signal relayed from `from`. Signals for peers without a
    /// session entry are logged and ignored: a late candidate for a
    /// cleaned-up session must not resurrect it, and terminal-state
    /// cleanup stays the single removal path.
    pub async fn handle_signal(&self, from: &PeerId, signal: Signal) -> Result<(), FabricError> {
        let connection = {
            self.inner
                .peers
                .lock()
                .get(from)
                .map(|h| h.connection.clone())
        };
        let Some(connection) = connection else {
            log::warn!("ignoring {} signal from unknown peer {from}", signal.kind());
            return Ok(());
        };
        match signal {
            Signal::Offer { sdp } => {
                let offer = RTCSessionDescription::offer(sdp)?;
                connection.set_remote_description(offer).await?;
                let answer = connection.create_answer(None).await?;
                let sdp = answer.sdp.clone();
                connection.set_local_description(answer).await?;
                log::info!("answering direct session from {from}");
                self.inner.emit(SessionEvent::Signal {
                    to: from.clone(),
                    signal: Signal::Answer { sdp },
                });
            }
            Signal::Answer { sdp } => {
                let answer = RTCSessionDescription::answer(sdp)?;
                connection.set_remote_description(answer).await?;
            }
            Signal::Candidate { candidate, mid } => {
                connection
                    .add_ice_candidate(RTCIceCandidateInit {
                        candidate,
                        sdp_mid: mid,
                        ..Default::default()
                    })
                    .await?;
            }
        }
        Ok(())
    }

    /// Peers whose data channel is currently open.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.inner
            .peers
            .lock()
            .iter()
            .filter(|(_, handle)| {
                handle
                    .channel
                    .lock()
                    .as_ref()
                    .is_some_and(|c| c.ready_state() == RTCDataChannelState::Open)
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Send to one peer over its data channel, if open.
    pub async fn send_to(&self, peer: &PeerId, payload: &[u8]) -> bool {
        let channel = {
            self.inner
                .peers
                .lock()
                .get(peer)
                .and_then(|h| h.channel.lock().clone())
        };
        let Some(channel) = channel else {
            return false;
        };
        if channel.ready_state() != RTCDataChannelState::Open {
            return false;
        }
        match channel.send(&Bytes::copy_from_slice(payload)).await {
            Ok(_) => true,
            Err(e) => {
                log::warn!("direct send to {peer} failed: {e}");
                false
            }
        }
    }

    /// Send to every open data channel; returns the peers reached.
    pub async fn broadcast(&self, payload: &[u8]) -> Vec<PeerId> {
        let channels: Vec<(PeerId, Arc<RTCDataChannel>)> = {
            self.inner
                .peers
                .lock()
                .iter()
                .filter_map(|(id, handle)| {
                    handle.channel.lock().clone().map(|c| (id.clone(), c))
                })
                .collect()
        };
        let data = Bytes::copy_from_slice(payload);
        let mut reached = Vec::new();
        for (peer, channel) in channels {
            if channel.ready_state() != RTCDataChannelState::Open {
                continue;
            }
            match channel.send(&data).await {
                Ok(_) => reached.push(peer),
                Err(e) => log::warn!("direct send to {peer} failed: {e}"),
            }
        }
        reached
    }

    pub async fn remove_peer(&self, peer: &PeerId) {
        let handle = self.inner.peers.lock().remove(peer);
        if let Some(handle) = handle {
            if let Err(e) = handle.connection.close().await {
                log::debug!("closing session with {peer}: {e}");
            }
            log::info!("session with {peer} closed");
        }
    }

    /// Close every session. Used on unit teardown.
    pub async fn clear(&self) {
        let peers: Vec<PeerId> = self.inner.peers.lock().keys().cloned().collect();
        for peer in peers {
            self.remove_peer(&peer).await;
        }
    }

    fn rtc_config(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self
                .inner
                .stun_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }
}

impl Inner {
    fn emit(&self, event: SessionEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

fn install_callbacks(inner: &Arc<Inner>, remote: PeerId, connection: &Arc<RTCPeerConnection>) {
    {
        let inner = inner.clone();
        let remote = remote.clone();
        connection.on_ice_candidate(Box::new(move |candidate| {
            let inner = inner.clone();
            let remote = remote.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => inner.emit(SessionEvent::Signal {
                        to: remote,
                        signal: Signal::Candidate {
                            candidate: init.candidate,
                            mid: init.sdp_mid,
                        },
                    }),
                    Err(e) => log::warn!("candidate serialization failed: {e}"),
                }
            })
        }));
    }
    {
        let inner = inner.clone();
        let remote = remote.clone();
        connection.on_peer_connection_state_change(Box::new(move |state| {
            let inner = inner.clone();
            let remote = remote.clone();
            Box::pin(async move {
                log::debug!("session with {remote} is {state}");
                if matches!(
                    state,
                    RTCPeerConnectionState::Failed
                        | RTCPeerConnectionState::Disconnected
                        | RTCPeerConnectionState::Closed
                ) && inner.peers.lock().remove(&remote).is_some()
                {
                    inner.emit(SessionEvent::Disconnected { peer: remote });
                }
            })
        }));
    }
    {
        let inner = inner.clone();
        connection.on_data_channel(Box::new(move |channel| {
            let inner = inner.clone();
            let remote = remote.clone();
            Box::pin(async move {
                if channel.label() != DATA_CHANNEL_LABEL {
                    log::debug!("ignoring foreign data channel {}", channel.label());
                    return;
                }
                wire_channel(&inner, remote, channel);
            })
        }));
    }
}

fn wire_channel(inner: &Arc<Inner>, remote: PeerId, channel: Arc<RTCDataChannel>) {
    {
        let inner = inner.clone();
        let remote = remote.clone();
        channel.on_open(Box::new(move || {
            let inner = inner.clone();
            let remote = remote.clone();
            Box::pin(async move {
                log::info!("data channel open with {remote}");
                inner.emit(SessionEvent::Connected { peer: remote });
            })
        }));
    }
    {
        let inner = inner.clone();
        let remote = remote.clone();
        channel.on_message(Box::new(move |message: DataChannelMessage| {
            let inner = inner.clone();
            let remote = remote.clone();
            Box::pin(async move {
                inner.emit(SessionEvent::Message {
                    peer: remote,
                    payload: message.data.to_vec(),
                });
            })
        }));
    }
    if let Some(handle) = inner.peers.lock().get(&remote) {
        *handle.channel.lock() = Some(channel);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn manager(id: &str) -> SessionManager {
        SessionManager::new(id.to_string(), Vec::new()).unwrap()
    }

    /// Forwards one manager's outbound signals into the other and passes
    /// every non-signal event through for assertions.
    fn relay(
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
        counterpart: SessionManager,
        self_id: PeerId,
    ) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    SessionEvent::Signal { signal, .. } => {
                        if let Err(e) = counterpart.handle_signal(&self_id, signal).await {
                            log::warn!("relay failed: {e}");
                        }
                    }
                    other => {
                        let _ = tx.send(other);
                    }
                }
            }
        });
        rx
    }

    async fn wait_for(
        events: &mut mpsc::UnboundedReceiver<SessionEvent>,
        pred: impl Fn(&SessionEvent) -> bool,
    ) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let event = events.recv().await.expect("event stream ended");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for session event")
    }

    #[test]
    fn add_peer_is_idempotent() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let a = manager("-WA0001-aaaaaaaaaaaa");
            let b_id = "-WA0001-bbbbbbbbbbbb".to_string();
            a.add_peer(&b_id).await.unwrap();
            a.add_peer(&b_id).await.unwrap();
            assert_eq!(a.inner.peers.lock().len(), 1);
            // No channel is open before negotiation completes.
            assert!(a.connected_peers().is_empty());
            assert!(!a.send_to(&b_id, b"x").await);
        });
    }

    #[test]
    fn stray_signal_for_unknown_peer_is_ignored() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let a = manager("-WA0001-aaaaaaaaaaaa");
            let stray = Signal::Candidate {
                candidate: "candidate:1 1 UDP 2122260223 127.0.0.1 9 typ host".into(),
                mid: Some("0".into()),
            };
            let unknown = "-WA0001-gggggggggggg".to_string();
            // Logged and dropped; no session entry comes into existence.
            a.handle_signal(&unknown, stray).await.unwrap();
            assert!(a.inner.peers.lock().is_empty());
        });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn loopback_session_carries_messages_both_ways() {
        let a_id = "-WA0001-aaaaaaaaaaaa".to_string();
        let b_id = "-WA0001-bbbbbbbbbbbb".to_string();
        let a = manager(&a_id);
        let b = manager(&b_id);

        let mut a_events = relay(a.subscribe(), b.clone(), a_id.clone());
        let mut b_events = relay(b.subscribe(), a.clone(), b_id.clone());

        // Both sides learn of each other; only b (greater id) offers.
        a.add_peer(&b_id).await.unwrap();
        b.add_peer(&a_id).await.unwrap();

        wait_for(&mut a_events, |e| matches!(e, SessionEvent::Connected { .. })).await;
        wait_for(&mut b_events, |e| matches!(e, SessionEvent::Connected { .. })).await;
        assert_eq!(a.connected_peers(), vec![b_id.clone()]);

        let reached = a.broadcast(b"hello from a").await;
        assert_eq!(reached, vec![b_id.clone()]);
        let event = wait_for(&mut b_events, |e| matches!(e, SessionEvent::Message { .. })).await;
        let SessionEvent::Message { peer, payload } = event else {
            unreachable!()
        };
        assert_eq!(peer, a_id);
        assert_eq!(payload, b"hello from a");

        assert!(b.send_to(&a_id, b"hello back").await);
        let event = wait_for(&mut a_events, |e| matches!(e, SessionEvent::Message { .. })).await;
        let SessionEvent::Message { payload, .. } = event else {
            unreachable!()
        };
        assert_eq!(payload, b"hello back");

        a.clear().await;
        assert!(a.connected_peers().is_empty());
    }
}
